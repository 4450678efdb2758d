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
    fmt,
    sync::Arc,
};

use futures_core::Stream;
use ruma::{
    DeviceId, OwnedDeviceId, OwnedTransactionId, OwnedUserId, RoomId, TransactionId, UserId,
};
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{debug, info, instrument, trace, warn};
use vodozemac::{olm::IdentityKeys, Curve25519PublicKey};

use crate::{
    error::{CrossSigningError, MegolmError, MegolmResult, VerificationError},
    gossiping::{GossipMachine, GossippedSecret, IncomingKeyRequest, OutgoingKeyRequest},
    identities::{
        CrossSigningIdentity, Device, DeviceTrustResult, IdentityManager, LocalTrust, TrustEngine,
        UserTrustResult,
    },
    locks::{Mutex, RwLock},
    olm::{Account, PrivateCrossSigningIdentity},
    requests::{
        IncomingResponse, KeysQueryResponse, KeysUploadRequest, KeysUploadResponse,
        OutgoingRequest, OutgoingRequests,
    },
    settings::TrustMachineSettings,
    store::{
        Changes, CryptoStore, DeviceChanges, MemoryStore, Result as StoreResult, RoomKeyInfo, Store,
    },
    types::events::{
        AnyRoomEvent, AnyToDeviceEvent, EncryptedRoomEvent, RoomEncryptedContent, SecretName,
    },
    verification::{VerificationEvent, VerificationRegistry},
};

/// A room event that was successfully decrypted.
#[derive(Clone, Debug)]
pub struct DecryptedRoomEvent {
    /// The user that sent the event.
    pub sender: OwnedUserId,
    /// The event type of the decrypted event.
    pub event_type: String,
    /// The content of the decrypted event.
    pub content: Value,
    /// The Curve25519 key of the device that created the room key.
    pub sender_key: Curve25519PublicKey,
    /// The message index of the event in its Megolm session.
    pub message_index: u32,
    /// Was the room key forwarded to us by another device instead of being
    /// shared by its creator.
    pub forwarded: bool,
}

/// State machine implementation of the trust and key distribution part of the
/// Matrix end-to-end encryption.
///
/// The machine doesn't do any network IO, it hands out the requests it wants
/// to have sent out with [`TrustMachine::outgoing_requests`] and expects the
/// responses to be passed back with [`TrustMachine::mark_request_as_sent`].
/// The [`OutgoingRequestProcessor`](crate::OutgoingRequestProcessor) drives
/// this loop.
#[derive(Clone)]
pub struct TrustMachine {
    inner: Arc<TrustMachineInner>,
}

struct TrustMachineInner {
    /// Our Olm account, it holds the identity and one-time keys of the
    /// device.
    account: Mutex<Account>,
    /// Store for the devices, identities and room keys.
    store: Store,
    settings: TrustMachineSettings,
    /// Manager for the device lists and cross-signing identities of the
    /// users we track.
    identity_manager: IdentityManager,
    /// The owner of the interactive verifications.
    verification_registry: VerificationRegistry,
    /// Requests and forwards room keys.
    key_request_machine: GossipMachine,
    /// Cross-signing uploads that wait to be sent out.
    outgoing_requests: RwLock<BTreeMap<OwnedTransactionId, OutgoingRequest>>,
    /// Held while the outgoing requests are sent out, only one drain pass
    /// runs per session.
    drain_gate: AsyncMutex<()>,
}

impl fmt::Debug for TrustMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustMachine")
            .field("user_id", &self.user_id())
            .field("device_id", &self.device_id())
            .finish_non_exhaustive()
    }
}

impl TrustMachine {
    /// Create a new memory based `TrustMachine` with the default settings.
    ///
    /// The created machine will keep the encryption keys only in memory and
    /// once the object is dropped the keys will be lost.
    ///
    /// # Arguments
    ///
    /// * `user_id` - The unique id of the user that owns this machine.
    ///
    /// * `device_id` - The unique id of the device that owns this machine.
    pub fn new(user_id: &UserId, device_id: &DeviceId) -> Self {
        Self::with_store(
            user_id,
            device_id,
            Arc::new(MemoryStore::new()),
            TrustMachineSettings::default(),
        )
    }

    /// Create a new `TrustMachine` with the given store and settings.
    ///
    /// # Arguments
    ///
    /// * `user_id` - The unique id of the user that owns this machine.
    ///
    /// * `device_id` - The unique id of the device that owns this machine.
    ///
    /// * `store` - The store that persists the devices, identities and room
    ///   keys.
    ///
    /// * `settings` - The settings of the machine.
    pub fn with_store(
        user_id: &UserId,
        device_id: &DeviceId,
        store: Arc<dyn CryptoStore>,
        settings: TrustMachineSettings,
    ) -> Self {
        let account = Account::new(user_id, device_id);
        let store = Store::new(account.static_data().clone(), store);

        let identity_manager = IdentityManager::new(store.clone());
        let verification_registry = VerificationRegistry::new(store.clone(), &settings);
        let key_request_machine = GossipMachine::new(store.clone(), &settings);

        debug!(
            ?user_id,
            ?device_id,
            ed25519_key = ?account.identity_keys().ed25519,
            curve25519_key = ?account.identity_keys().curve25519,
            "Created a new trust machine",
        );

        Self {
            inner: Arc::new(TrustMachineInner {
                account: Mutex::new(account),
                store,
                settings,
                identity_manager,
                verification_registry,
                key_request_machine,
                outgoing_requests: Default::default(),
                drain_gate: AsyncMutex::new(()),
            }),
        }
    }

    /// The unique user id that owns this `TrustMachine` instance.
    pub fn user_id(&self) -> &UserId {
        self.inner.store.user_id()
    }

    /// The unique device ID that identifies this `TrustMachine`.
    pub fn device_id(&self) -> &DeviceId {
        self.inner.store.device_id()
    }

    /// Get the public parts of our Olm identity keys.
    pub fn identity_keys(&self) -> IdentityKeys {
        *self.inner.store.static_account().identity_keys
    }

    /// The settings this machine was created with.
    pub fn settings(&self) -> &TrustMachineSettings {
        &self.inner.settings
    }

    /// Get the store of this machine.
    pub fn crypto_store(&self) -> Arc<dyn CryptoStore> {
        self.inner.store.crypto_store()
    }

    /// Get the owner of the interactive verifications of this session.
    pub fn verification(&self) -> &VerificationRegistry {
        &self.inner.verification_registry
    }

    /// The lock every [`OutgoingRequestProcessor`](crate::OutgoingRequestProcessor)
    /// of this session holds while it drains the outgoing requests.
    pub(crate) fn drain_gate(&self) -> &AsyncMutex<()> {
        &self.inner.drain_gate
    }

    /// Get the outgoing requests that need to be sent out.
    ///
    /// This returns a list of [`OutgoingRequest`]. Those requests need to be
    /// sent out to the server and the responses need to be passed back to
    /// the state machine using [`mark_request_as_sent`].
    ///
    /// [`mark_request_as_sent`]: #method.mark_request_as_sent
    pub async fn outgoing_requests(&self) -> StoreResult<Vec<OutgoingRequest>> {
        let mut requests = Vec::new();

        if let Some(request) = self.keys_for_upload().await? {
            requests.push(OutgoingRequest::new(TransactionId::new(), request));
        }

        if let Some((request_id, request)) =
            self.inner.identity_manager.users_for_key_query().await?
        {
            requests.push(OutgoingRequest::new(request_id, request));
        }

        requests.extend(self.inner.outgoing_requests.read().values().cloned());
        requests.extend(self.inner.verification_registry.outgoing_requests());
        requests.extend(self.inner.key_request_machine.outgoing_to_device_requests().await?);

        Ok(requests)
    }

    /// Mark the request with the given request id as sent.
    ///
    /// # Arguments
    ///
    /// * `request_id` - The unique id of the request that was sent out. This
    ///   is needed to couple the response with the now sent out request.
    ///
    /// * `response` - The response that was received from the server after the
    ///   outgoing request was sent out.
    #[instrument(skip_all, fields(request_id = ?request_id))]
    pub async fn mark_request_as_sent<'a>(
        &self,
        request_id: &TransactionId,
        response: impl Into<IncomingResponse<'a>>,
    ) -> StoreResult<()> {
        let response = response.into();

        match response {
            IncomingResponse::KeysUpload(response) => {
                self.receive_keys_upload_response(request_id, response).await?;
            }
            IncomingResponse::KeysQuery(response) => {
                self.receive_keys_query_response(request_id, response).await?;
            }
            IncomingResponse::KeysClaim(response) => {
                self.inner
                    .key_request_machine
                    .receive_keys_claim_response(request_id, response)
                    .await?;
            }
            IncomingResponse::ToDevice => {
                self.inner.key_request_machine.mark_outgoing_request_as_sent(request_id).await?;
                self.inner.verification_registry.mark_request_as_sent(request_id, &response).await?;
            }
            IncomingResponse::RoomMessage(_) => {
                self.inner.verification_registry.mark_request_as_sent(request_id, &response).await?;
            }
            IncomingResponse::SignatureUpload(upload_response) => {
                if !upload_response.failures.is_empty() {
                    warn!(failures = ?upload_response.failures, "Some signatures were rejected");
                }

                self.inner.outgoing_requests.write().remove(request_id);
                self.inner.verification_registry.mark_request_as_sent(request_id, &response).await?;
            }
        };

        Ok(())
    }

    /// Get the keys of our device that the server doesn't know about yet.
    async fn keys_for_upload(&self) -> StoreResult<Option<KeysUploadRequest>> {
        let identity = self.inner.store.load_identity().await?;
        let mut account = self.inner.account.lock();

        account.generate_one_time_keys_if_needed();

        let one_time_keys = account.signed_one_time_keys().unwrap_or_else(|error| {
            warn!(?error, "Couldn't sign our one-time keys");
            Default::default()
        });

        let device_keys = if account.shared() {
            None
        } else {
            match account.device_keys() {
                Ok(mut device_keys) => {
                    if let Some(identity) = &identity {
                        if let Err(error) = identity.sign_device_keys(&mut device_keys) {
                            warn!(?error, "Couldn't cross-sign our own device keys");
                        }
                    }

                    Some(device_keys)
                }
                Err(error) => {
                    warn!(?error, "Couldn't sign our device keys");
                    None
                }
            }
        };

        if device_keys.is_none() && one_time_keys.is_empty() {
            Ok(None)
        } else {
            Ok(Some(KeysUploadRequest { device_keys, one_time_keys, cross_signing_keys: None }))
        }
    }

    async fn receive_keys_upload_response(
        &self,
        request_id: &TransactionId,
        response: &KeysUploadResponse,
    ) -> StoreResult<()> {
        let queued = self.inner.outgoing_requests.write().remove(request_id);

        let uploaded_cross_signing_keys = queued.as_ref().is_some_and(|r| {
            matches!(r.request(), OutgoingRequests::KeysUpload(u) if u.cross_signing_keys.is_some())
        });

        if uploaded_cross_signing_keys {
            return self.receive_cross_signing_upload_response().await;
        }

        let mut account = self.inner.account.lock();

        if !account.shared() {
            debug!("Marking the account as shared");
        }

        account.mark_as_shared();
        account.mark_keys_as_published();
        account.update_uploaded_key_count(&response.one_time_key_counts);

        Ok(())
    }

    /// Our cross-signing keys are public now, publish the signature of our own
    /// device as well.
    async fn receive_cross_signing_upload_response(&self) -> StoreResult<()> {
        let Some(identity) = self.inner.store.load_identity().await? else {
            warn!("Uploaded cross-signing keys but the private identity is gone");
            return Ok(());
        };

        identity.mark_as_shared();
        info!(
            master_key = ?identity.master_public_key().get_first_key(),
            "Published our cross-signing keys"
        );

        let device_keys = self.inner.account.lock().device_keys();

        match device_keys.and_then(|keys| identity.sign_device(&keys)) {
            Ok(request) => {
                let request: OutgoingRequest = request.into();
                self.inner.outgoing_requests.write().insert(request.request_id.clone(), request);
            }
            Err(error) => warn!(?error, "Couldn't sign our own device with the self-signing key"),
        }

        self.inner
            .store
            .save_changes(Changes { private_identity: Some(identity), ..Default::default() })
            .await
    }

    /// Receive a successful keys query response.
    ///
    /// Returns a list of devices newly discovered devices and devices that
    /// changed.
    async fn receive_keys_query_response(
        &self,
        request_id: &TransactionId,
        response: &KeysQueryResponse,
    ) -> StoreResult<(DeviceChanges, Vec<CrossSigningIdentity>)> {
        self.inner.identity_manager.receive_keys_query_response(request_id, response).await
    }

    /// Create a new cross-signing identity and queue up the upload of its
    /// public keys.
    ///
    /// The master key gets signed by our device, our device gets signed by
    /// the new self-signing key once the keys are published.
    #[instrument(skip(self))]
    pub async fn bootstrap_cross_signing(&self) -> Result<(), CrossSigningError> {
        if self.inner.store.load_identity().await?.is_some() {
            return Err(CrossSigningError::AlreadyInitialized);
        }

        let (identity, mut device_keys) = {
            let account = self.inner.account.lock();
            (PrivateCrossSigningIdentity::for_account(&account)?, account.device_keys()?)
        };

        identity.sign_device_keys(&mut device_keys)?;
        let public_identity = identity.to_public_identity()?;

        let changes = Changes {
            private_identity: Some(identity.clone()),
            identities: vec![public_identity],
            devices: DeviceChanges {
                changed: vec![Device::new(device_keys, LocalTrust::Verified)],
                ..Default::default()
            },
            ..Default::default()
        };

        self.inner.store.save_changes(changes).await?;

        let request_id = TransactionId::new();
        let upload = KeysUploadRequest {
            cross_signing_keys: Some(identity.as_upload_request()),
            ..Default::default()
        };

        info!(
            ?request_id,
            master_key = ?identity.master_public_key().get_first_key(),
            "Created a new cross-signing identity"
        );

        self.inner
            .outgoing_requests
            .write()
            .insert(request_id.clone(), OutgoingRequest::new(request_id, upload));

        Ok(())
    }

    /// Start tracking the device lists of the given users.
    ///
    /// Users that weren't tracked before are queued up for a key query.
    pub async fn update_tracked_users(
        &self,
        users: impl IntoIterator<Item = &UserId>,
    ) -> StoreResult<()> {
        self.inner.identity_manager.update_tracked_users(users).await
    }

    /// Receive the list of users whose device list changed, as reported by the
    /// server.
    pub async fn receive_device_list_changes(
        &self,
        changed: impl IntoIterator<Item = &UserId>,
    ) -> StoreResult<()> {
        self.inner.identity_manager.receive_device_changes(changed).await
    }

    /// Handle a to-device event.
    ///
    /// Room key requests are only buffered, call
    /// [`TrustMachine::process_incoming_key_requests`] once all the events of a
    /// sync were received.
    #[instrument(skip_all, fields(sender = ?event.sender(), event_type = event.event_type()))]
    pub async fn receive_to_device_event(&self, event: &AnyToDeviceEvent) -> StoreResult<()> {
        match event {
            AnyToDeviceEvent::RoomKeyRequest(e) => {
                self.inner.key_request_machine.receive_incoming_key_request(e);
            }
            AnyToDeviceEvent::ForwardedRoomKey(e) => {
                self.inner
                    .key_request_machine
                    .receive_forwarded_room_key(&e.sender, e.sender_key, &e.content)
                    .await?;
            }
            AnyToDeviceEvent::RoomKeyWithheld(e) => {
                self.inner
                    .key_request_machine
                    .receive_room_key_withheld(&e.sender, &e.content)
                    .await?;
            }
            AnyToDeviceEvent::SecretRequest(e) => {
                self.inner.key_request_machine.receive_secret_request(e).await?;
            }
            AnyToDeviceEvent::SecretSend(e) => {
                self.inner
                    .key_request_machine
                    .receive_secret_send(&e.sender, e.sender_key, &e.content)
                    .await?;
            }
            AnyToDeviceEvent::Verification(e) => {
                self.inner
                    .verification_registry
                    .receive_to_device_event(&e.sender, &e.content)
                    .await?;
            }
            AnyToDeviceEvent::Custom(..) => {
                trace!("Received an unhandled to-device event");
            }
        }

        Ok(())
    }

    /// Handle the to-device events and device list changes of a sync
    /// response.
    ///
    /// Returns the incoming room key requests that were handled.
    pub async fn receive_sync_changes(
        &self,
        to_device_events: &[AnyToDeviceEvent],
        changed_devices: &[OwnedUserId],
    ) -> StoreResult<Vec<IncomingKeyRequest>> {
        self.receive_device_list_changes(changed_devices.iter().map(|u| &**u)).await?;

        for event in to_device_events {
            self.receive_to_device_event(event).await?;
        }

        self.process_incoming_key_requests().await
    }

    /// Handle a room event, in-room verification events are passed on to the
    /// verification registry.
    pub async fn receive_room_event(&self, event: &AnyRoomEvent) -> StoreResult<()> {
        if let AnyRoomEvent::Verification(e) = event {
            self.inner.verification_registry.receive_room_event(e).await?;
        }

        Ok(())
    }

    /// Decide on the buffered room key requests of our other devices.
    pub async fn process_incoming_key_requests(&self) -> StoreResult<Vec<IncomingKeyRequest>> {
        self.inner.key_request_machine.process_incoming_key_requests().await
    }

    /// Request the room key of the given event from our other devices.
    ///
    /// Returns the new request, `None` if the key was already requested.
    pub async fn request_room_key_for_event(
        &self,
        event: &EncryptedRoomEvent,
    ) -> StoreResult<Option<OutgoingKeyRequest>> {
        self.inner.key_request_machine.request_room_key_for_event(event).await
    }

    /// Request the room key of the given event again, cancelling a request
    /// that was already sent out.
    pub async fn re_request_room_key_for_event(
        &self,
        event: &EncryptedRoomEvent,
    ) -> StoreResult<()> {
        self.inner.key_request_machine.re_request_room_key_for_event(event).await
    }

    /// Store a secret we hold, e.g. a private cross-signing key, so our other
    /// devices can request it.
    pub async fn store_secret(&self, secret_name: SecretName, secret: String) -> StoreResult<()> {
        self.inner
            .store
            .save_changes(Changes { secrets: vec![(secret_name, secret)], ..Default::default() })
            .await
    }

    /// Request a secret from our other devices.
    ///
    /// Answers of trusted devices are put into the secret inbox, see
    /// [`TrustMachine::get_secrets_from_inbox`].
    pub fn request_secret(&self, secret_name: SecretName) -> OwnedTransactionId {
        self.inner.key_request_machine.request_secret(secret_name)
    }

    /// Get the secrets with the given name our other devices sent us.
    pub async fn get_secrets_from_inbox(
        &self,
        secret_name: &SecretName,
    ) -> StoreResult<Vec<GossippedSecret>> {
        self.inner.store.get_secrets_from_inbox(secret_name).await
    }

    /// Remove the secrets with the given name from the inbox, e.g. once one
    /// of them was checked and imported.
    pub async fn delete_secrets_from_inbox(&self, secret_name: &SecretName) -> StoreResult<()> {
        self.inner.store.delete_secrets_from_inbox(secret_name).await
    }

    /// Encrypt a room message for the given room.
    ///
    /// A new room key is created if we don't have one for the room yet,
    /// distributing it is up to the caller.
    pub async fn encrypt_room_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: Value,
    ) -> MegolmResult<RoomEncryptedContent> {
        let session = match self.inner.store.get_outbound_group_session(room_id).await? {
            Some(session) => session,
            None => {
                let (outbound, inbound) =
                    self.inner.store.static_account().create_group_session_pair(room_id.to_owned());

                debug!(?room_id, session_id = outbound.session_id(), "Created a new room key");

                let changes = Changes {
                    outbound_group_sessions: vec![outbound.clone()],
                    inbound_group_sessions: vec![inbound],
                    ..Default::default()
                };
                self.inner.store.save_changes(changes).await?;

                outbound
            }
        };

        session.encrypt(event_type, content)
    }

    /// Decrypt an `m.room.encrypted` event.
    ///
    /// If the room key is missing, the error carries the withheld code the
    /// sender gave us, if any, and a key request is queued up if
    /// [`TrustMachineSettings::automatic_key_requests`] is enabled.
    #[instrument(skip_all, fields(
        room_id = ?event.room_id,
        event_id = ?event.event_id,
        session_id = event.content.session_id.as_str(),
    ))]
    pub async fn decrypt_room_event(
        &self,
        event: &EncryptedRoomEvent,
    ) -> MegolmResult<DecryptedRoomEvent> {
        let content = &event.content;

        let Some(session) =
            self.inner.store.get_inbound_group_session(&event.room_id, &content.session_id).await?
        else {
            let withheld_code = self
                .inner
                .store
                .get_withheld_info(&event.room_id, &content.session_id)
                .await?
                .map(|w| w.code);

            debug!(?withheld_code, "Missing the room key to decrypt the event");

            if self.inner.settings.automatic_key_requests {
                self.request_room_key_for_event(event).await?;
            }

            return Err(MegolmError::MissingRoomKey(withheld_code));
        };

        let (payload, message_index) = session.decrypt(content)?;

        trace!(message_index, "Successfully decrypted a room event");

        Ok(DecryptedRoomEvent {
            sender: event.sender.clone(),
            event_type: payload.event_type,
            content: payload.content,
            sender_key: session.sender_key(),
            message_index,
            forwarded: session.is_imported(),
        })
    }

    /// Get a stream of the room keys we receive.
    pub fn room_keys_received_stream(
        &self,
    ) -> impl Stream<Item = Result<Vec<RoomKeyInfo>, BroadcastStreamRecvError>> + use<> {
        self.inner.store.room_keys_received_stream()
    }

    /// Compute the trust of the given user.
    pub async fn compute_user_trust(&self, user_id: &UserId) -> StoreResult<UserTrustResult> {
        let graph = self.inner.store.signature_graph(user_id).await?;
        Ok(TrustEngine::new(&graph).compute_user_trust(user_id))
    }

    /// Compute the trust of the given device.
    pub async fn compute_device_trust(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> StoreResult<DeviceTrustResult> {
        let graph = self.inner.store.signature_graph(user_id).await?;
        Ok(TrustEngine::new(&graph).compute_device_trust(user_id, device_id))
    }

    /// Should the given device be shown as trusted to the user.
    pub async fn is_device_trusted_for_display(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> StoreResult<bool> {
        let graph = self.inner.store.signature_graph(user_id).await?;
        Ok(TrustEngine::new(&graph).is_device_trusted_for_display(user_id, device_id))
    }

    /// Get a specific device of a user.
    pub async fn get_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> StoreResult<Option<Device>> {
        self.inner.store.get_device(user_id, device_id).await
    }

    /// Get all the devices of a user.
    pub async fn get_user_devices(
        &self,
        user_id: &UserId,
    ) -> StoreResult<BTreeMap<OwnedDeviceId, Device>> {
        self.inner.store.get_user_devices(user_id).await
    }

    /// Get the cross-signing identity of a user.
    pub async fn get_identity(&self, user_id: &UserId) -> StoreResult<Option<CrossSigningIdentity>> {
        self.inner.store.get_user_identity(user_id).await
    }

    /// Mark a device as verified without an interactive verification.
    pub async fn mark_device_as_verified(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<(), VerificationError> {
        self.set_local_trust(user_id, device_id, LocalTrust::Verified).await?;

        self.inner.verification_registry.emit(VerificationEvent::MarkedAsManuallyVerified {
            user_id: user_id.to_owned(),
            device_id: device_id.to_owned(),
        });

        Ok(())
    }

    /// Set the local trust state of a device.
    pub async fn set_local_trust(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        trust_state: LocalTrust,
    ) -> Result<(), VerificationError> {
        let Some(mut device) = self.inner.store.get_device(user_id, device_id).await? else {
            return Err(VerificationError::UnknownDevice(user_id.to_owned(), device_id.to_owned()));
        };

        info!(?user_id, ?device_id, ?trust_state, "Changing the local trust of a device");

        device.set_trust_state(trust_state);
        self.inner.store.save_device(device).await?;

        Ok(())
    }

    /// The users whose device lists we track.
    pub async fn tracked_users(&self) -> StoreResult<BTreeSet<OwnedUserId>> {
        Ok(self.inner.store.load_tracked_users().await?.into_iter().map(|u| u.user_id).collect())
    }
}
