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

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use ruma::{
    DeviceId, OwnedDeviceId, OwnedRoomId, OwnedTransactionId, OwnedUserId, RoomId, TransactionId,
    UserId,
};

use super::{Changes, CryptoStore, Result, TrackedUser};
use crate::{
    gossiping::{GossippedSecret, IncomingKeyRequest, OutgoingKeyRequest},
    identities::{CrossSigningIdentity, Device},
    locks::RwLock as StdRwLock,
    olm::{InboundGroupSession, OutboundGroupSession, PrivateCrossSigningIdentity},
    types::events::{RoomKeyWithheldContent, SecretName},
};

/// An in-memory only store that will forget all the E2EE key once it's dropped.
#[derive(Default, Debug)]
pub struct MemoryStore {
    private_identity: StdRwLock<Option<PrivateCrossSigningIdentity>>,
    devices: StdRwLock<BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, Device>>>,
    identities: StdRwLock<HashMap<OwnedUserId, CrossSigningIdentity>>,
    inbound_group_sessions: StdRwLock<BTreeMap<OwnedRoomId, HashMap<String, InboundGroupSession>>>,
    outbound_group_sessions: StdRwLock<BTreeMap<OwnedRoomId, OutboundGroupSession>>,
    outgoing_key_requests: StdRwLock<BTreeMap<OwnedTransactionId, OutgoingKeyRequest>>,
    incoming_key_requests: StdRwLock<Vec<IncomingKeyRequest>>,
    tracked_users: StdRwLock<HashMap<OwnedUserId, TrackedUser>>,
    olm_channels: StdRwLock<HashSet<String>>,
    direct_withheld_info: StdRwLock<HashMap<OwnedRoomId, HashMap<String, RoomKeyWithheldContent>>>,
    secrets: StdRwLock<HashMap<SecretName, String>>,
    secrets_inbox: StdRwLock<HashMap<SecretName, Vec<GossippedSecret>>>,
}

impl MemoryStore {
    /// Create a new empty `MemoryStore`.
    pub fn new() -> Self {
        Self::default()
    }

    fn save_devices(&self, devices: Vec<Device>) {
        let mut stored = self.devices.write();

        for device in devices {
            stored
                .entry(device.user_id().to_owned())
                .or_default()
                .insert(device.device_id().to_owned(), device);
        }
    }

    fn delete_devices(&self, devices: Vec<Device>) {
        let mut stored = self.devices.write();

        for device in devices {
            if let Some(user_devices) = stored.get_mut(device.user_id()) {
                user_devices.remove(device.device_id());
            }
        }
    }
}

#[async_trait]
impl CryptoStore for MemoryStore {
    async fn save_changes(&self, changes: Changes) -> Result<()> {
        if let Some(identity) = changes.private_identity {
            *self.private_identity.write() = Some(identity);
        }

        self.save_devices(changes.devices.new);
        self.save_devices(changes.devices.changed);
        self.delete_devices(changes.devices.deleted);

        {
            let mut identities = self.identities.write();
            for identity in changes.identities {
                identities.insert(identity.user_id().to_owned(), identity);
            }
        }

        {
            let mut sessions = self.inbound_group_sessions.write();
            for session in changes.inbound_group_sessions {
                sessions
                    .entry(session.room_id().to_owned())
                    .or_default()
                    .insert(session.session_id().to_owned(), session);
            }
        }

        {
            let mut sessions = self.outbound_group_sessions.write();
            for session in changes.outbound_group_sessions {
                sessions.insert(session.room_id().to_owned(), session);
            }
        }

        {
            let mut requests = self.outgoing_key_requests.write();
            for request in changes.key_requests {
                requests.insert(request.request_id.clone(), request);
            }
        }

        self.incoming_key_requests.write().extend(changes.incoming_key_requests);

        {
            let mut tracked_users = self.tracked_users.write();
            for user in changes.tracked_users {
                tracked_users.insert(user.user_id.clone(), user);
            }
        }

        self.olm_channels.write().extend(changes.olm_channels);

        {
            let mut withheld_info = self.direct_withheld_info.write();
            for info in changes.withheld_session_info {
                withheld_info
                    .entry(info.room_id.clone())
                    .or_default()
                    .insert(info.session_id.clone(), info);
            }
        }

        self.secrets.write().extend(changes.secrets);

        {
            let mut inbox = self.secrets_inbox.write();
            for secret in changes.secrets_inbox {
                inbox.entry(secret.secret_name.clone()).or_default().push(secret);
            }
        }

        Ok(())
    }

    async fn load_identity(&self) -> Result<Option<PrivateCrossSigningIdentity>> {
        Ok(self.private_identity.read().clone())
    }

    async fn get_device(&self, user_id: &UserId, device_id: &DeviceId) -> Result<Option<Device>> {
        Ok(self.devices.read().get(user_id).and_then(|d| d.get(device_id)).cloned())
    }

    async fn get_user_devices(&self, user_id: &UserId) -> Result<BTreeMap<OwnedDeviceId, Device>> {
        Ok(self.devices.read().get(user_id).cloned().unwrap_or_default())
    }

    async fn get_user_identity(&self, user_id: &UserId) -> Result<Option<CrossSigningIdentity>> {
        Ok(self.identities.read().get(user_id).cloned())
    }

    async fn get_inbound_group_session(
        &self,
        room_id: &RoomId,
        session_id: &str,
    ) -> Result<Option<InboundGroupSession>> {
        Ok(self.inbound_group_sessions.read().get(room_id).and_then(|s| s.get(session_id)).cloned())
    }

    async fn get_outbound_group_session(
        &self,
        room_id: &RoomId,
    ) -> Result<Option<OutboundGroupSession>> {
        Ok(self.outbound_group_sessions.read().get(room_id).cloned())
    }

    async fn get_outgoing_key_request(
        &self,
        request_id: &TransactionId,
    ) -> Result<Option<OutgoingKeyRequest>> {
        Ok(self.outgoing_key_requests.read().get(request_id).cloned())
    }

    async fn get_unresolved_key_request(
        &self,
        room_id: &RoomId,
        session_id: &str,
    ) -> Result<Option<OutgoingKeyRequest>> {
        Ok(self
            .outgoing_key_requests
            .read()
            .values()
            .find(|r| r.is_unresolved() && r.room_id() == room_id && r.session_id() == session_id)
            .cloned())
    }

    async fn get_pending_key_requests(&self) -> Result<Vec<OutgoingKeyRequest>> {
        let mut requests: Vec<_> = self
            .outgoing_key_requests
            .read()
            .values()
            .filter(|r| r.needs_sending())
            .cloned()
            .collect();

        requests.sort_by_key(|r| r.creation_time);

        Ok(requests)
    }

    async fn delete_outgoing_key_request(&self, request_id: &TransactionId) -> Result<()> {
        self.outgoing_key_requests.write().remove(request_id);
        Ok(())
    }

    async fn get_incoming_key_requests(&self) -> Result<Vec<IncomingKeyRequest>> {
        Ok(self.incoming_key_requests.read().clone())
    }

    async fn load_tracked_users(&self) -> Result<Vec<TrackedUser>> {
        Ok(self.tracked_users.read().values().cloned().collect())
    }

    async fn has_olm_channel(&self, curve25519_key: &str) -> Result<bool> {
        Ok(self.olm_channels.read().contains(curve25519_key))
    }

    async fn get_withheld_info(
        &self,
        room_id: &RoomId,
        session_id: &str,
    ) -> Result<Option<RoomKeyWithheldContent>> {
        Ok(self.direct_withheld_info.read().get(room_id).and_then(|s| s.get(session_id)).cloned())
    }

    async fn get_secret(&self, secret_name: &SecretName) -> Result<Option<String>> {
        Ok(self.secrets.read().get(secret_name).cloned())
    }

    async fn get_secrets_from_inbox(
        &self,
        secret_name: &SecretName,
    ) -> Result<Vec<GossippedSecret>> {
        Ok(self.secrets_inbox.read().get(secret_name).cloned().unwrap_or_default())
    }

    async fn delete_secrets_from_inbox(&self, secret_name: &SecretName) -> Result<()> {
        self.secrets_inbox.write().remove(secret_name);
        Ok(())
    }
}
