// Copyright 2020 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use ruma::{OwnedDeviceId, OwnedTransactionId, OwnedUserId, TransactionId, UserId};
use tracing::{debug, info, instrument, trace, warn};

use super::{CrossSigningIdentity, Device, LocalTrust};
use crate::{
    locks::Mutex,
    requests::{KeysQueryRequest, KeysQueryResponse},
    store::{Changes, DeviceChanges, Result as StoreResult, Store, TrackedUser},
    types::{DeviceKeys, MasterPubkey, SelfSigningPubkey, UserSigningPubkey},
};

enum DeviceChange {
    New(Device),
    Updated(Device),
    None,
}

/// The key query that was handed out and not answered yet.
#[derive(Debug)]
struct KeysQueryInFlight {
    request_id: OwnedTransactionId,
    users: BTreeSet<OwnedUserId>,
}

/// Keeps the device lists and cross-signing identities of the users we track
/// up to date.
///
/// Everything a key query returns is checked before it's admitted: device
/// keys need a valid self-signature, cross-signing subkeys need a valid
/// signature of their master key.
#[derive(Debug, Clone)]
pub(crate) struct IdentityManager {
    store: Store,
    /// The key query that, once answered, marks the queried users as up to
    /// date. Polling again for the same users hands out the same request.
    keys_query_in_flight: Arc<Mutex<Option<KeysQueryInFlight>>>,
}

impl IdentityManager {
    pub fn new(store: Store) -> Self {
        Self { store, keys_query_in_flight: Default::default() }
    }

    /// A user of the query in flight changed again, the answer to that query
    /// can't mark them as up to date anymore.
    fn invalidate_in_flight_query<'a>(&self, users: impl IntoIterator<Item = &'a UserId>) {
        let mut in_flight = self.keys_query_in_flight.lock();

        let outdated = in_flight
            .as_ref()
            .is_some_and(|query| users.into_iter().any(|u| query.users.contains(u)));

        if outdated {
            *in_flight = None;
        }
    }

    fn user_id(&self) -> &UserId {
        self.store.user_id()
    }

    /// Start tracking the devices of the given users, new users are queued up
    /// for a key query.
    pub async fn update_tracked_users(
        &self,
        users: impl IntoIterator<Item = &UserId>,
    ) -> StoreResult<()> {
        let tracked: BTreeSet<_> =
            self.store.load_tracked_users().await?.into_iter().map(|u| u.user_id).collect();

        let tracked_users: Vec<_> = users
            .into_iter()
            .filter(|u| !tracked.contains(*u))
            .map(|u| TrackedUser { user_id: u.to_owned(), dirty: true })
            .collect();

        if !tracked_users.is_empty() {
            debug!(users = ?tracked_users, "Tracking new users");
            self.store.save_changes(Changes { tracked_users, ..Default::default() }).await?;
        }

        Ok(())
    }

    /// Queue the given user up for a key query, tracking the user if needed.
    pub async fn mark_user_as_changed(&self, user_id: &UserId) -> StoreResult<()> {
        self.invalidate_in_flight_query([user_id]);

        let tracked_users = vec![TrackedUser { user_id: user_id.to_owned(), dirty: true }];
        self.store.save_changes(Changes { tracked_users, ..Default::default() }).await
    }

    /// Receive the list of users that contained changed devices from the
    /// `/sync` response.
    ///
    /// Only users we already track are queued up for a key query.
    pub async fn receive_device_changes(
        &self,
        users: impl IntoIterator<Item = &UserId>,
    ) -> StoreResult<()> {
        let users: BTreeSet<_> = users.into_iter().collect();
        self.invalidate_in_flight_query(users.iter().copied());

        let tracked_users: Vec<_> = self
            .store
            .load_tracked_users()
            .await?
            .into_iter()
            .filter(|u| users.contains(u.user_id.as_ref()))
            .map(|u| TrackedUser { dirty: true, ..u })
            .collect();

        self.store.save_changes(Changes { tracked_users, ..Default::default() }).await
    }

    /// Get the key query request for the users whose device lists are
    /// outdated, if there are any.
    ///
    /// Our own user is always tracked.
    pub async fn users_for_key_query(
        &self,
    ) -> StoreResult<Option<(OwnedTransactionId, KeysQueryRequest)>> {
        let tracked_users = self.store.load_tracked_users().await?;

        if !tracked_users.iter().any(|u| u.user_id == self.user_id()) {
            self.mark_user_as_changed(self.user_id()).await?;
            return Box::pin(self.users_for_key_query()).await;
        }

        let users: BTreeSet<OwnedUserId> =
            tracked_users.into_iter().filter(|u| u.dirty).map(|u| u.user_id).collect();

        if users.is_empty() {
            return Ok(None);
        }

        let mut in_flight = self.keys_query_in_flight.lock();

        let request_id = match in_flight.as_ref() {
            Some(query) if query.users == users => query.request_id.clone(),
            _ => {
                let request_id = TransactionId::new();
                debug!(?request_id, ?users, "Created a /keys/query request");

                *in_flight =
                    Some(KeysQueryInFlight { request_id: request_id.clone(), users: users.clone() });

                request_id
            }
        };

        Ok(Some((request_id, KeysQueryRequest::new(users))))
    }

    /// Receive a successful keys query response.
    ///
    /// Returns the device changes and the identities that were admitted.
    ///
    /// # Arguments
    ///
    /// * `request_id` - The ID of the key query request.
    ///
    /// * `response` - The keys query response of the request that the client
    ///   performed.
    #[instrument(skip_all, fields(?request_id))]
    pub async fn receive_keys_query_response(
        &self,
        request_id: &TransactionId,
        response: &KeysQueryResponse,
    ) -> StoreResult<(DeviceChanges, Vec<CrossSigningIdentity>)> {
        debug!(
            users = ?response.device_keys.keys().collect::<BTreeSet<_>>(),
            failures = ?response.failures,
            "Handling a keys query response"
        );

        let mut devices = DeviceChanges::default();

        for (user_id, device_map) in &response.device_keys {
            devices.extend(self.update_user_devices(user_id, device_map).await?);
        }

        let identities = self.handle_cross_signing_keys(response).await?;

        let mut tracked_users = Vec::new();

        let answered = {
            let mut in_flight = self.keys_query_in_flight.lock();

            if in_flight.as_ref().is_some_and(|query| *query.request_id == *request_id) {
                *in_flight = None;
                true
            } else {
                false
            }
        };

        if answered {
            tracked_users.extend(
                response
                    .device_keys
                    .keys()
                    .map(|u| TrackedUser { user_id: u.to_owned(), dirty: false }),
            );
        }

        let changes = Changes {
            identities: identities.clone(),
            devices: devices.clone(),
            tracked_users,
            ..Default::default()
        };

        self.store.save_changes(changes).await?;

        debug!(
            new_devices = devices.new.len(),
            changed_devices = devices.changed.len(),
            deleted_devices = devices.deleted.len(),
            identities = identities.len(),
            "Finished handling of the keys/query response"
        );

        Ok((devices, identities))
    }

    async fn update_or_create_device(&self, device_keys: &DeviceKeys) -> StoreResult<DeviceChange> {
        let old_device = self.store.get_device(&device_keys.user_id, &device_keys.device_id).await?;

        if let Some(mut device) = old_device {
            if device.user_id() == self.user_id() && device.device_id() == self.store.device_id() {
                // The server can't tell us anything new about our own device.
                return Ok(DeviceChange::None);
            }

            match device.update_keys(device_keys) {
                Ok(true) => Ok(DeviceChange::Updated(device)),
                Ok(false) => Ok(DeviceChange::None),
                Err(e) => {
                    warn!(
                        user_id = ?device.user_id(),
                        device_id = ?device.device_id(),
                        error = ?e,
                        "Failed to update device keys",
                    );

                    Ok(DeviceChange::None)
                }
            }
        } else {
            match Device::try_from_keys(device_keys.clone()) {
                Ok(mut device) => {
                    // If this is our own device, check that the server isn't
                    // lying about our keys, also mark the device as locally
                    // trusted.
                    if device.user_id() == self.user_id()
                        && device.device_id() == self.store.device_id()
                    {
                        let local_device_keys = self.store.static_account().unsigned_device_keys();

                        if device.keys().keys == local_device_keys.keys {
                            device.set_trust_state(LocalTrust::Verified);
                            trace!(
                                device_id = ?device.device_id(),
                                "Adding our own device to the device store, marking it as \
                                 locally verified",
                            );

                            Ok(DeviceChange::New(device))
                        } else {
                            warn!(
                                device_id = ?device.device_id(),
                                "The server returned different keys for our own device"
                            );
                            Ok(DeviceChange::None)
                        }
                    } else {
                        trace!(
                            user_id = ?device.user_id(),
                            device_id = ?device.device_id(),
                            "Adding a new device to the device store",
                        );

                        Ok(DeviceChange::New(device))
                    }
                }
                Err(e) => {
                    warn!(
                        user_id = ?device_keys.user_id,
                        device_id = ?device_keys.device_id,
                        error = ?e,
                        "Failed to create a new device",
                    );

                    Ok(DeviceChange::None)
                }
            }
        }
    }

    async fn update_user_devices(
        &self,
        user_id: &UserId,
        device_map: &BTreeMap<OwnedDeviceId, DeviceKeys>,
    ) -> StoreResult<DeviceChanges> {
        let mut changes = DeviceChanges::default();

        for (device_id, device_keys) in device_map {
            if user_id != device_keys.user_id || *device_id != device_keys.device_id {
                warn!(
                    ?user_id,
                    ?device_id,
                    device_key_user = ?device_keys.user_id,
                    device_key_device_id = ?device_keys.device_id,
                    "Mismatch in the device keys payload",
                );
                continue;
            }

            match self.update_or_create_device(device_keys).await? {
                DeviceChange::New(d) => changes.new.push(d),
                DeviceChange::Updated(d) => changes.changed.push(d),
                DeviceChange::None => (),
            }
        }

        let stored_devices = self.store.get_user_devices(user_id).await?;

        for (device_id, device) in stored_devices {
            if device_map.contains_key(&device_id) {
                continue;
            }

            if user_id == self.user_id() && device_id == self.store.device_id() {
                warn!(?device_id, "Our own device might have been deleted");
            } else {
                let mut device = device;
                device.mark_as_deleted();
                changes.deleted.push(device);
            }
        }

        Ok(changes)
    }

    /// Pick the cross-signing identities out of the response, only identities
    /// whose subkeys are signed by their master key are admitted.
    async fn handle_cross_signing_keys(
        &self,
        response: &KeysQueryResponse,
    ) -> StoreResult<Vec<CrossSigningIdentity>> {
        let mut identities = Vec::new();

        for (user_id, master_key) in &response.master_keys {
            let Some(identity) = self.identity_from_response(user_id, master_key, response) else {
                continue;
            };

            if user_id == self.user_id() {
                let private_identity = self.store.load_identity().await?;

                if private_identity.is_some_and(|p| !p.owns_master_key(identity.master_key())) {
                    info!("Our public cross-signing identity doesn't match our private one");
                }
            }

            if self.store.get_user_identity(user_id).await?.as_ref() != Some(&identity) {
                trace!(?user_id, "Updating a user identity");
                identities.push(identity);
            }
        }

        Ok(identities)
    }

    fn identity_from_response(
        &self,
        user_id: &UserId,
        master_key: &crate::types::CrossSigningKey,
        response: &KeysQueryResponse,
    ) -> Option<CrossSigningIdentity> {
        let master_key = match MasterPubkey::try_from(master_key.clone()) {
            Ok(k) => k,
            Err(e) => {
                warn!(?user_id, error = ?e, "Couldn't update or create new user identity");
                return None;
            }
        };

        let Some(self_signing) = response
            .self_signing_keys
            .get(user_id)
            .and_then(|k| SelfSigningPubkey::try_from(k.clone()).ok())
        else {
            warn!(?user_id, "A user identity didn't contain a self signing pubkey or the key was invalid");
            return None;
        };

        let user_signing = if user_id == self.user_id() {
            let Some(user_signing) = response
                .user_signing_keys
                .get(user_id)
                .and_then(|k| UserSigningPubkey::try_from(k.clone()).ok())
            else {
                warn!("User identity for our own user didn't contain a user signing pubkey");
                return None;
            };

            Some(user_signing)
        } else {
            None
        };

        if master_key.user_id() != user_id {
            warn!(?user_id, "User ID mismatch in one of the cross signing keys");
            return None;
        }

        let identity = match CrossSigningIdentity::new(master_key, self_signing, user_signing) {
            Ok(i) => i,
            Err(e) => {
                warn!(?user_id, error = ?e, "User ID mismatch in one of the cross signing keys");
                return None;
            }
        };

        if let Err(e) = identity.verify_subkeys() {
            warn!(?user_id, error = ?e, "The cross-signing subkeys aren't signed by the master key");
            return None;
        }

        Some(identity)
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, sync::Arc};

    use ruma::{device_id, user_id};

    use super::IdentityManager;
    use crate::{
        identities::LocalTrust,
        olm::{Account, PrivateCrossSigningIdentity},
        requests::KeysQueryResponse,
        store::{MemoryStore, Store},
    };

    fn manager(account: &Account) -> IdentityManager {
        IdentityManager::new(Store::new(
            account.static_data().clone(),
            Arc::new(MemoryStore::new()),
        ))
    }

    fn key_query(accounts: &[&Account], identity: Option<&PrivateCrossSigningIdentity>) -> KeysQueryResponse {
        let mut response = KeysQueryResponse::default();

        for account in accounts {
            let mut keys = account.device_keys().unwrap();
            if let Some(identity) = identity {
                identity.sign_device_keys(&mut keys).unwrap();
            }

            response
                .device_keys
                .entry(account.user_id().to_owned())
                .or_insert_with(BTreeMap::new)
                .insert(account.device_id().to_owned(), keys);
        }

        if let Some(identity) = identity {
            let user_id = identity.user_id().to_owned();
            response.master_keys.insert(user_id.clone(), identity.master_public_key().as_ref().clone());
            response
                .self_signing_keys
                .insert(user_id.clone(), identity.self_signing_public_key().as_ref().clone());
            response
                .user_signing_keys
                .insert(user_id, identity.user_signing_public_key().as_ref().clone());
        }

        response
    }

    #[tokio::test]
    async fn own_user_is_always_queried() {
        let account = Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));
        let manager = manager(&account);

        let (request_id, request) = manager.users_for_key_query().await.unwrap().unwrap();
        assert!(request.device_keys.contains_key(account.user_id()));

        manager.receive_keys_query_response(&request_id, &key_query(&[&account], None)).await.unwrap();

        // Once the response arrives the user isn't outdated anymore.
        assert!(manager.users_for_key_query().await.unwrap().is_none());

        let own_device = manager
            .store
            .get_device(account.user_id(), account.device_id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(own_device.local_trust_state(), LocalTrust::Verified);

        manager.receive_device_changes([account.user_id()]).await.unwrap();
        assert!(manager.users_for_key_query().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unanswered_key_queries_are_reused() {
        let account = Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));
        let manager = manager(&account);

        let (first_id, _) = manager.users_for_key_query().await.unwrap().unwrap();

        for _ in 0..10 {
            let (request_id, _) = manager.users_for_key_query().await.unwrap().unwrap();
            assert_eq!(request_id, first_id);
        }

        // A new user joins the query, the old request is forgotten.
        manager.update_tracked_users([user_id!("@bob:localhost")]).await.unwrap();
        let (second_id, request) = manager.users_for_key_query().await.unwrap().unwrap();
        assert_ne!(second_id, first_id);
        assert_eq!(request.device_keys.len(), 2);

        // A late answer to the forgotten request doesn't mark anyone as up to
        // date.
        manager.receive_keys_query_response(&first_id, &key_query(&[&account], None)).await.unwrap();
        let (request_id, _) = manager.users_for_key_query().await.unwrap().unwrap();
        assert_eq!(request_id, second_id);
    }

    #[tokio::test]
    async fn device_changes_during_a_query_keep_the_user_outdated() {
        let account = Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));
        let manager = manager(&account);

        let (request_id, _) = manager.users_for_key_query().await.unwrap().unwrap();

        // The device list changes while the query is on its way.
        manager.receive_device_changes([account.user_id()]).await.unwrap();
        manager.receive_keys_query_response(&request_id, &key_query(&[&account], None)).await.unwrap();

        let (next_id, request) = manager.users_for_key_query().await.unwrap().unwrap();
        assert_ne!(next_id, request_id);
        assert!(request.device_keys.contains_key(account.user_id()));
    }

    #[tokio::test]
    async fn devices_and_identities_are_admitted() {
        let alice = Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));
        let second = Account::new(user_id!("@alice:localhost"), device_id!("SECONDDEVICE"));
        let identity = PrivateCrossSigningIdentity::for_account(&second).unwrap();
        let manager = manager(&alice);

        let (request_id, _) = manager.users_for_key_query().await.unwrap().unwrap();
        let (devices, identities) = manager
            .receive_keys_query_response(&request_id, &key_query(&[&alice, &second], Some(&identity)))
            .await
            .unwrap();

        assert_eq!(devices.new.len(), 2);
        assert_eq!(identities.len(), 1);

        let stored = manager.store.get_user_identity(alice.user_id()).await.unwrap().unwrap();
        assert_eq!(stored.master_key(), &identity.master_public_key());

        // The second device disappears from the device list.
        manager.mark_user_as_changed(alice.user_id()).await.unwrap();
        let (request_id, _) = manager.users_for_key_query().await.unwrap().unwrap();
        let (devices, _) = manager
            .receive_keys_query_response(&request_id, &key_query(&[&alice], Some(&identity)))
            .await
            .unwrap();

        assert_eq!(devices.deleted.len(), 1);
        assert!(manager
            .store
            .get_device(second.user_id(), second.device_id())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn unsigned_subkeys_are_rejected() {
        let alice = Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));
        let identity = PrivateCrossSigningIdentity::new(alice.user_id().to_owned()).unwrap();
        let other = PrivateCrossSigningIdentity::new(alice.user_id().to_owned()).unwrap();
        let manager = manager(&alice);

        let mut response = key_query(&[&alice], Some(&identity));
        // A self-signing key of a different identity isn't signed by our master key.
        response
            .self_signing_keys
            .insert(alice.user_id().to_owned(), other.self_signing_public_key().as_ref().clone());

        let (request_id, _) = manager.users_for_key_query().await.unwrap().unwrap();
        let (_, identities) =
            manager.receive_keys_query_response(&request_id, &response).await.unwrap();

        assert!(identities.is_empty());
        assert!(manager.store.get_user_identity(alice.user_id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mismatched_device_payloads_are_ignored() {
        let alice = Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));
        let bob = Account::new(user_id!("@bob:localhost"), device_id!("BOBDEVICE"));
        let manager = manager(&alice);

        let mut response = KeysQueryResponse::default();
        response.device_keys.insert(
            bob.user_id().to_owned(),
            BTreeMap::from([(device_id!("OTHERDEVICE").to_owned(), bob.device_keys().unwrap())]),
        );

        let (devices, _) = manager
            .receive_keys_query_response(&ruma::TransactionId::new(), &response)
            .await
            .unwrap();

        assert!(devices.new.is_empty());
    }
}
