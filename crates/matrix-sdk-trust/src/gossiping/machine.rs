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
    time::Duration,
};

use ruma::{
    to_device::DeviceIdOrAllDevices, DeviceId, MilliSecondsSinceUnixEpoch, OwnedDeviceId,
    OwnedTransactionId, OwnedUserId, TransactionId, UserId,
};
use tracing::{debug, info, instrument, trace, warn};
use vodozemac::Curve25519PublicKey;

use super::{
    GossippedSecret, IncomingKeyRequest, IncomingRequestState, KeyReplyResult, KeyRequestReply,
    OutgoingKeyRequest, OutgoingRequestState, RejectionReason,
};
use crate::{
    identities::{Device, TrustEngine},
    locks::{Mutex, RwLock},
    olm::{InboundGroupSession, VerifyJson, SIGNED_CURVE25519},
    requests::{KeysClaimRequest, KeysClaimResponse, OutgoingRequest, ToDeviceRequest},
    settings::TrustMachineSettings,
    store::{Changes, Result as StoreResult, Store, TrackedUser},
    types::{
        ed25519_key_id,
        events::{
            EncryptedRoomEvent, ForwardedRoomKeyContent, KeyRequestAction, RequestedKeyInfo,
            RoomKeyRequestContent, RoomKeyWithheldContent, SecretName, SecretRequestAction,
            SecretRequestContent, SecretSendContent, ToDeviceEvent, WithheldCode,
        },
    },
};

type RoomKeyRequestEvent = ToDeviceEvent<RoomKeyRequestContent>;
type SecretRequestEvent = ToDeviceEvent<SecretRequestContent>;

/// Something we share with one of our devices once we have a secure channel
/// to it.
#[derive(Debug)]
enum QueuedShare {
    RoomKey(ForwardedRoomKeyContent),
    Secret(SecretSendContent),
}

#[derive(Debug, Default)]
struct KeyClaims {
    /// Devices we need a secure channel with that aren't part of a claim yet.
    queued: BTreeMap<OwnedUserId, BTreeSet<OwnedDeviceId>>,
    /// The claim that waits for its response.
    in_flight: Option<(OwnedTransactionId, KeysClaimRequest)>,
}

/// Requests room keys we are missing and answers the requests of our other
/// devices.
#[derive(Debug, Clone)]
pub(crate) struct GossipMachine {
    store: Store,
    /// Key forwards and withheld notices waiting to be sent out.
    outgoing_requests: Arc<RwLock<BTreeMap<OwnedTransactionId, OutgoingRequest>>>,
    /// Incoming requests and cancellations, in arrival order.
    incoming_key_requests: Arc<Mutex<Vec<RoomKeyRequestEvent>>>,
    /// Forwards and secrets waiting for a secure channel to their recipient.
    wait_queue: Arc<Mutex<BTreeMap<(OwnedUserId, OwnedDeviceId), Vec<QueuedShare>>>>,
    key_claims: Arc<Mutex<KeyClaims>>,
    /// Our unanswered secret requests.
    secret_requests: Arc<Mutex<BTreeMap<OwnedTransactionId, SecretName>>>,
    secret_share_window: Duration,
}

impl GossipMachine {
    pub fn new(store: Store, settings: &TrustMachineSettings) -> Self {
        Self {
            store,
            outgoing_requests: Default::default(),
            incoming_key_requests: Default::default(),
            wait_queue: Default::default(),
            key_claims: Default::default(),
            secret_requests: Default::default(),
            secret_share_window: settings.secret_share_window,
        }
    }

    /// Our own user id.
    pub fn user_id(&self) -> &UserId {
        self.store.user_id()
    }

    /// Our own device ID.
    pub fn device_id(&self) -> &DeviceId {
        self.store.device_id()
    }

    fn is_own_device(&self, user_id: &UserId, device_id: &DeviceId) -> bool {
        user_id == self.user_id() && device_id == self.device_id()
    }

    /// Collect the key requests, cancellations, key forwards and withheld
    /// notices that need to be sent out.
    pub async fn outgoing_to_device_requests(&self) -> StoreResult<Vec<OutgoingRequest>> {
        let mut requests: Vec<_> = self
            .store
            .get_pending_key_requests()
            .await?
            .iter()
            .filter_map(|r| self.key_request_to_outgoing(r))
            .collect();

        requests.extend(self.outgoing_requests.read().values().cloned());
        requests.extend(self.key_claim_request());

        Ok(requests)
    }

    fn key_request_to_outgoing(&self, key_request: &OutgoingKeyRequest) -> Option<OutgoingRequest> {
        let content = key_request.to_content(self.device_id().to_owned());

        // The request and its cancellation share the request ID, the server
        // would drop the second one if the transaction IDs matched as well.
        let txn_id = match key_request.state {
            OutgoingRequestState::Unsent | OutgoingRequestState::Sent => {
                key_request.request_id.clone()
            }
            _ => OwnedTransactionId::from(format!("{}-cancellation", key_request.request_id)),
        };

        key_request
            .recipients
            .iter()
            .map(|(user_id, devices)| {
                ToDeviceRequest::for_recipients(
                    user_id,
                    devices.iter().cloned(),
                    content.clone(),
                    txn_id.clone(),
                )
            })
            .reduce(|mut request, other| {
                request.merge(other);
                request
            })
            .map(|request| OutgoingRequest::new(key_request.request_id.clone(), request))
    }

    fn key_claim_request(&self) -> Option<OutgoingRequest> {
        let mut claims = self.key_claims.lock();

        if claims.in_flight.is_none() && !claims.queued.is_empty() {
            let one_time_keys = std::mem::take(&mut claims.queued)
                .into_iter()
                .map(|(user_id, devices)| {
                    let devices =
                        devices.into_iter().map(|d| (d, SIGNED_CURVE25519.to_owned())).collect();
                    (user_id, devices)
                })
                .collect();

            let request_id = TransactionId::new();
            debug!(?request_id, "Claiming one-time keys to forward room keys");

            claims.in_flight = Some((request_id, KeysClaimRequest { one_time_keys }));
        }

        claims
            .in_flight
            .as_ref()
            .map(|(request_id, request)| OutgoingRequest::new(request_id.clone(), request.clone()))
    }

    /// Mark the outgoing request with the given ID as delivered.
    pub async fn mark_outgoing_request_as_sent(&self, request_id: &TransactionId) -> StoreResult<()> {
        if self.outgoing_requests.write().remove(request_id).is_some() {
            trace!(?request_id, "Marked a room key forward as sent");
            return Ok(());
        }

        let Some(mut key_request) = self.store.get_outgoing_key_request(request_id).await? else {
            return Ok(());
        };

        let old_state = key_request.state;
        let mut changes = Changes::default();

        match key_request.state {
            OutgoingRequestState::Unsent => key_request.state = OutgoingRequestState::Sent,
            OutgoingRequestState::CancellationPending => {
                key_request.state = OutgoingRequestState::Cancelled
            }
            OutgoingRequestState::CancellationPendingAndWillResend => {
                key_request.state = OutgoingRequestState::Cancelled;

                let resend = OutgoingKeyRequest {
                    request_id: TransactionId::new(),
                    state: OutgoingRequestState::Unsent,
                    replies: Vec::new(),
                    creation_time: MilliSecondsSinceUnixEpoch::now(),
                    ..key_request.clone()
                };

                debug!(
                    old_request_id = ?request_id,
                    new_request_id = ?resend.request_id,
                    "Cancellation was sent, sending the room key request again"
                );

                changes.key_requests.push(resend);
            }
            OutgoingRequestState::Sent | OutgoingRequestState::Cancelled => return Ok(()),
        }

        debug!(
            ?request_id,
            room_id = ?key_request.room_id(),
            session_id = key_request.session_id(),
            ?old_state,
            new_state = ?key_request.state,
            "Marked a room key request as sent"
        );

        changes.key_requests.push(key_request);
        self.store.save_changes(changes).await
    }

    fn requested_key_info(event: &EncryptedRoomEvent) -> RequestedKeyInfo {
        RequestedKeyInfo {
            algorithm: event.content.algorithm.clone(),
            room_id: event.room_id.clone(),
            sender_key: event.content.sender_key.clone(),
            session_id: event.content.session_id.clone(),
        }
    }

    /// Build a fresh request for the room key of the given event, addressed
    /// to all our devices and, for keys of other users, to the device that
    /// sent the event.
    fn new_key_request(&self, event: &EncryptedRoomEvent) -> OutgoingKeyRequest {
        let mut recipients =
            BTreeMap::from([(self.user_id().to_owned(), vec![DeviceIdOrAllDevices::AllDevices])]);

        if &*event.sender != self.user_id() {
            recipients.insert(
                event.sender.clone(),
                vec![DeviceIdOrAllDevices::DeviceId(event.content.device_id.clone())],
            );
        }

        OutgoingKeyRequest {
            request_id: TransactionId::new(),
            info: Self::requested_key_info(event),
            recipients,
            state: OutgoingRequestState::Unsent,
            replies: Vec::new(),
            creation_time: MilliSecondsSinceUnixEpoch::now(),
        }
    }

    async fn save_key_requests(&self, key_requests: Vec<OutgoingKeyRequest>) -> StoreResult<()> {
        self.store.save_changes(Changes { key_requests, ..Default::default() }).await
    }

    /// Request the room key of the given event from our other devices.
    ///
    /// Returns the new request, `None` if an unresolved request for the key
    /// exists already.
    #[instrument(skip_all, fields(room_id = ?event.room_id, session_id = event.content.session_id.as_str()))]
    pub async fn request_room_key_for_event(
        &self,
        event: &EncryptedRoomEvent,
    ) -> StoreResult<Option<OutgoingKeyRequest>> {
        if let Some(request) = self
            .store
            .get_unresolved_key_request(&event.room_id, &event.content.session_id)
            .await?
        {
            debug!(
                request_id = ?request.request_id,
                state = ?request.state,
                "A request for this room key exists already"
            );

            return Ok(None);
        }

        let request = self.new_key_request(event);
        info!(request_id = ?request.request_id, "Requesting a missing room key");

        self.save_key_requests(vec![request.clone()]).await?;

        Ok(Some(request))
    }

    /// Request the room key of the given event again, cancelling a request
    /// that was already sent out.
    #[instrument(skip_all, fields(room_id = ?event.room_id, session_id = event.content.session_id.as_str()))]
    pub async fn re_request_room_key_for_event(&self, event: &EncryptedRoomEvent) -> StoreResult<()> {
        let Some(mut request) = self
            .store
            .get_unresolved_key_request(&event.room_id, &event.content.session_id)
            .await?
        else {
            self.request_room_key_for_event(event).await?;
            return Ok(());
        };

        match request.state {
            OutgoingRequestState::Unsent => {
                let fresh = self.new_key_request(event);

                debug!(
                    old_request_id = ?request.request_id,
                    new_request_id = ?fresh.request_id,
                    "Replacing an unsent room key request"
                );

                self.store.delete_outgoing_key_request(&request.request_id).await?;
                self.save_key_requests(vec![fresh]).await
            }
            OutgoingRequestState::Sent | OutgoingRequestState::CancellationPending => {
                debug!(
                    request_id = ?request.request_id,
                    "Cancelling a sent room key request before sending it again"
                );

                request.state = OutgoingRequestState::CancellationPendingAndWillResend;
                self.save_key_requests(vec![request]).await
            }
            OutgoingRequestState::CancellationPendingAndWillResend
            | OutgoingRequestState::Cancelled => Ok(()),
        }
    }

    /// Find the device that forwarded a room key or sent a secret to us, only
    /// verified devices that aren't blacklisted are allowed to do so.
    async fn trusted_forwarder(
        &self,
        sender: &UserId,
        sender_key: Option<Curve25519PublicKey>,
    ) -> StoreResult<Option<Device>> {
        let Some(sender_key) = sender_key else {
            warn!("Received a gossiped key that didn't arrive over an Olm channel");
            return Ok(None);
        };

        let device = self
            .store
            .get_user_devices(sender)
            .await?
            .into_values()
            .find(|d| d.curve25519_key() == Some(sender_key));

        let Some(device) = device else {
            warn!(
                sender_key = sender_key.to_base64(),
                "Received a gossiped key from an unknown device"
            );
            return Ok(None);
        };

        if device.is_blacklisted() {
            warn!(
                device_id = ?device.device_id(),
                "Received a gossiped key from a blacklisted device"
            );
            return Ok(None);
        }

        let graph = self.store.signature_graph(sender).await?;

        if !TrustEngine::new(&graph).compute_device_trust(sender, device.device_id()).is_verified() {
            warn!(
                device_id = ?device.device_id(),
                "Received a gossiped key from an unverified device"
            );
            return Ok(None);
        }

        Ok(Some(device))
    }

    /// Receive a forwarded room key.
    ///
    /// The key is only accepted if we requested it and a device we trust
    /// forwarded it, returns the session that was imported.
    #[instrument(skip_all, fields(sender = ?sender, room_id = ?content.room_id, session_id = content.session_id.as_str()))]
    pub async fn receive_forwarded_room_key(
        &self,
        sender: &UserId,
        sender_key: Option<Curve25519PublicKey>,
        content: &ForwardedRoomKeyContent,
    ) -> StoreResult<Option<InboundGroupSession>> {
        let Some(mut request) =
            self.store.get_unresolved_key_request(&content.room_id, &content.session_id).await?
        else {
            warn!("Received a forwarded room key that we didn't request, dropping it");
            return Ok(None);
        };

        if !request.recipients.contains_key(sender) {
            warn!(
                request_id = ?request.request_id,
                "Received a forwarded room key from a user we didn't ask for it"
            );
            return Ok(None);
        }

        if request.info.sender_key != content.sender_key {
            warn!(
                request_id = ?request.request_id,
                expected_sender_key = request.info.sender_key.as_str(),
                sender_key = content.sender_key.as_str(),
                "Received a forwarded room key with a mismatched sender key"
            );
            return Ok(None);
        }

        let Some(forwarder) = self.trusted_forwarder(sender, sender_key).await? else {
            return Ok(None);
        };

        let session = match InboundGroupSession::from_forwarded_key(None, content) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = ?e, "Couldn't import a forwarded room key");
                return Ok(None);
            }
        };

        let existing =
            self.store.get_inbound_group_session(&content.room_id, &content.session_id).await?;

        let session = match existing {
            Some(existing) if !session.is_better_than(&existing) => {
                debug!(
                    first_known_index = existing.first_known_index(),
                    "Received a forwarded room key, but we have a better version already"
                );
                None
            }
            _ => Some(session),
        };

        let old_state = request.state;

        request.replies.push(KeyRequestReply {
            user_id: sender.to_owned(),
            device_id: Some(forwarder.device_id().to_owned()),
            result: KeyReplyResult::Accepted,
        });

        request.state = match request.state {
            OutgoingRequestState::Unsent => OutgoingRequestState::Cancelled,
            _ => OutgoingRequestState::CancellationPending,
        };

        info!(
            request_id = ?request.request_id,
            ?old_state,
            new_state = ?request.state,
            imported = session.is_some(),
            "Received a requested room key"
        );

        let changes = Changes {
            inbound_group_sessions: session.iter().cloned().collect(),
            key_requests: vec![request],
            ..Default::default()
        };

        self.store.save_changes(changes).await?;

        Ok(session)
    }

    /// Receive a notice that a room key is withheld from us.
    ///
    /// A matching request records the rejection but stays unresolved, another
    /// device may still have the key.
    #[instrument(skip_all, fields(sender = ?sender, room_id = ?content.room_id, session_id = content.session_id.as_str()))]
    pub async fn receive_room_key_withheld(
        &self,
        sender: &UserId,
        content: &RoomKeyWithheldContent,
    ) -> StoreResult<()> {
        debug!(code = content.code.as_str(), from_device = ?content.from_device, "Received a withheld room key notice");

        let mut changes =
            Changes { withheld_session_info: vec![content.clone()], ..Default::default() };

        if let Some(mut request) =
            self.store.get_unresolved_key_request(&content.room_id, &content.session_id).await?
        {
            request.replies.push(KeyRequestReply {
                user_id: sender.to_owned(),
                device_id: Some(content.from_device.clone()),
                result: KeyReplyResult::Rejected(content.code.clone()),
            });

            changes.key_requests.push(request);
        }

        self.store.save_changes(changes).await
    }

    /// Buffer an incoming room key request or cancellation, requests are
    /// handled by [`GossipMachine::process_incoming_key_requests`].
    pub fn receive_incoming_key_request(&self, event: &RoomKeyRequestEvent) {
        self.incoming_key_requests.lock().push(event.clone());
    }

    fn is_same_request(first: &RoomKeyRequestEvent, second: &RoomKeyRequestEvent) -> bool {
        first.sender == second.sender
            && first.content.requesting_device_id == second.content.requesting_device_id
            && first.content.request_id == second.content.request_id
    }

    /// Handle all the buffered incoming room key requests, in the order they
    /// arrived.
    ///
    /// Returns the handled requests with the decision that was taken.
    pub async fn process_incoming_key_requests(&self) -> StoreResult<Vec<IncomingKeyRequest>> {
        let events = std::mem::take(&mut *self.incoming_key_requests.lock());
        let mut pending: Vec<(RoomKeyRequestEvent, RequestedKeyInfo)> = Vec::new();

        for event in events {
            let content = &event.content;

            if self.is_own_device(&event.sender, &content.requesting_device_id) {
                trace!(request_id = ?content.request_id, "Ignoring a room key request of our own device");
                continue;
            }

            match &content.action {
                KeyRequestAction::Request => {
                    let Some(info) = content.body.clone() else {
                        warn!(
                            sender = ?event.sender,
                            requesting_device_id = ?content.requesting_device_id,
                            "Received a room key request without key info"
                        );
                        continue;
                    };

                    if !pending.iter().any(|(e, _)| Self::is_same_request(e, &event)) {
                        pending.push((event, info));
                    }
                }
                KeyRequestAction::CancelRequest => {
                    pending.retain(|(e, _)| !Self::is_same_request(e, &event));
                }
                action => {
                    warn!(
                        sender = ?event.sender,
                        requesting_device_id = ?content.requesting_device_id,
                        action = action.as_str(),
                        "Received a room key request with an unknown action"
                    );
                }
            }
        }

        let mut changes = Changes::default();
        let mut handled = Vec::with_capacity(pending.len());

        for (event, info) in pending {
            let state = self.handle_key_request(&event, &info, &mut changes).await?;

            handled.push(IncomingKeyRequest {
                request_id: event.content.request_id,
                info,
                requesting_user_id: event.sender,
                requesting_device_id: event.content.requesting_device_id,
                state,
                creation_time: MilliSecondsSinceUnixEpoch::now(),
            });
        }

        if !handled.is_empty() {
            changes.incoming_key_requests = handled.clone();
            self.store.save_changes(changes).await?;
        }

        Ok(handled)
    }

    async fn handle_key_request(
        &self,
        event: &RoomKeyRequestEvent,
        info: &RequestedKeyInfo,
        changes: &mut Changes,
    ) -> StoreResult<IncomingRequestState> {
        let user_id = &event.sender;
        let device_id = &event.content.requesting_device_id;

        match self.should_share_key(user_id, device_id, info, changes).await? {
            Ok((device, session)) => {
                info!(
                    user_id = ?user_id,
                    device_id = ?device_id,
                    room_id = ?info.room_id,
                    session_id = info.session_id.as_str(),
                    first_known_index = session.first_known_index(),
                    "Serving a room key request"
                );

                self.share_session(&device, &session).await?;

                Ok(IncomingRequestState::Accepted)
            }
            Err(reason) => {
                info!(
                    user_id = ?user_id,
                    device_id = ?device_id,
                    room_id = ?info.room_id,
                    session_id = info.session_id.as_str(),
                    ?reason,
                    "Received a room key request that we won't serve"
                );

                if let Some(code) = reason.withheld_code() {
                    self.queue_withheld(user_id, device_id, info, code);
                }

                Ok(IncomingRequestState::Rejected(reason))
            }
        }
    }

    /// Decide if the requested key should be shared with the given device.
    async fn should_share_key(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        info: &RequestedKeyInfo,
        changes: &mut Changes,
    ) -> StoreResult<Result<(Device, InboundGroupSession), RejectionReason>> {
        let device = match self.should_share_with(user_id, device_id, changes).await? {
            Ok(device) => device,
            Err(reason) => return Ok(Err(reason)),
        };

        let session = self
            .store
            .get_inbound_group_session(&info.room_id, &info.session_id)
            .await?
            .filter(|s| s.sender_key().to_base64() == info.sender_key);

        Ok(match session {
            Some(session) => Ok((device, session)),
            None => Err(RejectionReason::UnknownSession),
        })
    }

    /// Decide if we share keys or secrets with the given device.
    ///
    /// Only our own devices that we verified get them, the decision is taken
    /// against the current trust, it's never remembered.
    async fn should_share_with(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        changes: &mut Changes,
    ) -> StoreResult<Result<Device, RejectionReason>> {
        if user_id != self.user_id() {
            return Ok(Err(RejectionReason::NotOwnUser));
        }

        let Some(device) = self.store.get_device(user_id, device_id).await? else {
            warn!(?user_id, ?device_id, "Received a request from an unknown device");
            changes.tracked_users.push(TrackedUser { user_id: user_id.to_owned(), dirty: true });

            return Ok(Err(RejectionReason::UnknownDevice));
        };

        if device.is_blacklisted() {
            return Ok(Err(RejectionReason::Blacklisted));
        }

        let graph = self.store.signature_graph(user_id).await?;

        if !TrustEngine::new(&graph).compute_device_trust(user_id, device_id).is_verified() {
            return Ok(Err(RejectionReason::Unverified));
        }

        Ok(Ok(device))
    }

    async fn share_session(&self, device: &Device, session: &InboundGroupSession) -> StoreResult<()> {
        let content = session
            .to_forwarded_room_key_content(self.store.static_account().identity_keys.curve25519);

        self.share_with_device(device, QueuedShare::RoomKey(content)).await
    }

    /// Send the share out if we have a secure channel with the device,
    /// otherwise park it until a key claim sets one up.
    async fn share_with_device(&self, device: &Device, share: QueuedShare) -> StoreResult<()> {
        let has_channel = match device.curve25519_key() {
            Some(key) => self.store.has_olm_channel(&key.to_base64()).await?,
            None => false,
        };

        let user_id = device.user_id().to_owned();
        let device_id = device.device_id().to_owned();

        if has_channel {
            self.queue_share(&user_id, &device_id, share);
        } else {
            info!(
                ?user_id,
                ?device_id,
                "The device is missing an Olm channel, putting the share in the wait queue"
            );

            self.wait_queue.lock().entry((user_id.clone(), device_id.clone())).or_default().push(share);
            self.key_claims.lock().queued.entry(user_id).or_default().insert(device_id);
        }

        Ok(())
    }

    fn queue_share(&self, user_id: &UserId, device_id: &DeviceId, share: QueuedShare) {
        let request: OutgoingRequest = match share {
            QueuedShare::RoomKey(content) => ToDeviceRequest::new(user_id, device_id.to_owned(), content),
            QueuedShare::Secret(content) => ToDeviceRequest::new(user_id, device_id.to_owned(), content),
        }
        .into();

        trace!(request_id = ?request.request_id, ?user_id, ?device_id, "Queued a share");

        self.outgoing_requests.write().insert(request.request_id.clone(), request);
    }

    fn queue_withheld(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        info: &RequestedKeyInfo,
        code: WithheldCode,
    ) {
        let content = RoomKeyWithheldContent {
            algorithm: info.algorithm.clone(),
            reason: code.reason().to_owned(),
            code,
            room_id: info.room_id.clone(),
            session_id: info.session_id.clone(),
            sender_key: info.sender_key.clone(),
            from_device: self.device_id().to_owned(),
        };

        let request: OutgoingRequest =
            ToDeviceRequest::new(user_id, device_id.to_owned(), content).into();

        self.outgoing_requests.write().insert(request.request_id.clone(), request);
    }

    /// Request a secret from all our other devices.
    ///
    /// Returns the ID of the request. An answer of a trusted device ends up
    /// in the secret inbox of the store.
    pub fn request_secret(&self, secret_name: SecretName) -> OwnedTransactionId {
        let request_id = TransactionId::new();

        let content = SecretRequestContent {
            action: SecretRequestAction::Request,
            name: Some(secret_name.clone()),
            request_id: request_id.clone(),
            requesting_device_id: self.device_id().to_owned(),
        };

        let request = ToDeviceRequest::with_id(
            self.user_id(),
            DeviceIdOrAllDevices::AllDevices,
            content,
            request_id.clone(),
        );

        info!(?request_id, secret_name = secret_name.as_str(), "Requesting a secret from our other devices");

        self.secret_requests.lock().insert(request_id.clone(), secret_name);
        self.outgoing_requests
            .write()
            .insert(request_id.clone(), OutgoingRequest::new(request_id.clone(), request));

        request_id
    }

    /// Tell our other devices that a secret request was answered.
    fn queue_secret_request_cancellation(&self, request_id: &TransactionId) {
        let content = SecretRequestContent {
            action: SecretRequestAction::RequestCancellation,
            name: None,
            request_id: request_id.to_owned(),
            requesting_device_id: self.device_id().to_owned(),
        };

        let txn_id = OwnedTransactionId::from(format!("{request_id}-cancellation"));
        let request = ToDeviceRequest::with_id(
            self.user_id(),
            DeviceIdOrAllDevices::AllDevices,
            content,
            txn_id.clone(),
        );

        let mut outgoing = self.outgoing_requests.write();
        outgoing.remove(request_id);
        outgoing.insert(txn_id.clone(), OutgoingRequest::new(txn_id, request));
    }

    /// Answer a secret request of one of our other devices.
    ///
    /// Secrets only go to our own devices that we trust and that were
    /// verified interactively within the secret share window.
    #[instrument(skip_all, fields(sender = ?event.sender, request_id = ?event.content.request_id))]
    pub async fn receive_secret_request(&self, event: &SecretRequestEvent) -> StoreResult<()> {
        let content = &event.content;

        let secret_name = match (&content.action, &content.name) {
            (SecretRequestAction::Request, Some(name)) => name,
            (SecretRequestAction::Request, None) => {
                warn!("Received a secret request without a secret name");
                return Ok(());
            }
            // Nothing to serve, we answer requests right away.
            (SecretRequestAction::RequestCancellation, _) => return Ok(()),
            (action, _) => {
                warn!(action = action.as_str(), "Received a secret request with an unknown action");
                return Ok(());
            }
        };

        let user_id = &event.sender;
        let device_id = &content.requesting_device_id;

        if self.is_own_device(user_id, device_id) {
            trace!("Ignoring a secret request of our own device");
            return Ok(());
        }

        let mut changes = Changes::default();

        let device = match self.should_share_with(user_id, device_id, &mut changes).await? {
            Ok(device) => device,
            Err(reason) => {
                info!(
                    ?device_id,
                    secret_name = secret_name.as_str(),
                    ?reason,
                    "Received a secret request that we won't serve"
                );

                if !changes.is_empty() {
                    self.store.save_changes(changes).await?;
                }

                return Ok(());
            }
        };

        if !self.store.was_recently_verified(device_id, self.secret_share_window) {
            info!(
                ?device_id,
                secret_name = secret_name.as_str(),
                "Received a secret request from a device that wasn't verified recently"
            );
            return Ok(());
        }

        let Some(secret) = self.store.get_secret(secret_name).await? else {
            info!(secret_name = secret_name.as_str(), "Can't serve a secret request, the secret isn't known");
            return Ok(());
        };

        info!(?device_id, secret_name = secret_name.as_str(), "Sharing a secret with one of our devices");

        let content = SecretSendContent { request_id: content.request_id.clone(), secret };
        self.share_with_device(&device, QueuedShare::Secret(content)).await
    }

    /// Receive a secret one of our devices sent us.
    ///
    /// The secret is only accepted if we requested it and one of our trusted
    /// devices sent it, it's put into the secret inbox of the store.
    #[instrument(skip_all, fields(sender = ?sender, request_id = ?content.request_id))]
    pub async fn receive_secret_send(
        &self,
        sender: &UserId,
        sender_key: Option<Curve25519PublicKey>,
        content: &SecretSendContent,
    ) -> StoreResult<Option<GossippedSecret>> {
        if sender != self.user_id() {
            warn!("Received a secret from another user, dropping it");
            return Ok(None);
        }

        let Some(secret_name) = self.secret_requests.lock().get(&content.request_id).cloned() else {
            warn!("Received a secret that we didn't request, dropping it");
            return Ok(None);
        };

        let Some(device) = self.trusted_forwarder(sender, sender_key).await? else {
            return Ok(None);
        };

        self.secret_requests.lock().remove(&content.request_id);
        self.queue_secret_request_cancellation(&content.request_id);

        let secret = GossippedSecret {
            secret_name,
            request_id: content.request_id.clone(),
            sender_device_id: device.device_id().to_owned(),
            secret: content.secret.clone(),
        };

        info!(
            secret_name = secret.secret_name.as_str(),
            sender_device_id = ?secret.sender_device_id,
            "Received a requested secret"
        );

        self.store.save_changes(Changes { secrets_inbox: vec![secret.clone()], ..Default::default() }).await?;

        Ok(Some(secret))
    }

    /// Receive the response of the key claim we sent out.
    ///
    /// Forwards to devices that gave us a valid one-time key are sent out,
    /// the other devices are told that no secure channel could be set up.
    pub async fn receive_keys_claim_response(
        &self,
        request_id: &TransactionId,
        response: &KeysClaimResponse,
    ) -> StoreResult<()> {
        let request = {
            let mut claims = self.key_claims.lock();

            if claims.in_flight.as_ref().is_some_and(|(id, _)| &**id == request_id) {
                claims.in_flight.take().map(|(_, r)| r)
            } else {
                None
            }
        };

        let Some(request) = request else {
            debug!(?request_id, "Received an unknown key claim response");
            return Ok(());
        };

        let mut olm_channels = Vec::new();

        for (user_id, devices) in request.one_time_keys {
            for device_id in devices.into_keys() {
                let forwards = self
                    .wait_queue
                    .lock()
                    .remove(&(user_id.clone(), device_id.clone()))
                    .unwrap_or_default();

                if let Some(queued) = self.key_claims.lock().queued.get_mut(&user_id) {
                    queued.remove(&device_id);
                }

                match self.verify_claimed_key(&user_id, &device_id, response).await? {
                    Some(channel_key) => {
                        debug!(?user_id, ?device_id, "Established an Olm channel");

                        olm_channels.push(channel_key);

                        for share in forwards {
                            self.queue_share(&user_id, &device_id, share);
                        }
                    }
                    None => {
                        warn!(
                            ?user_id,
                            ?device_id,
                            "Couldn't claim a valid one-time key, withholding the queued shares"
                        );

                        for share in forwards {
                            match share {
                                QueuedShare::RoomKey(content) => {
                                    let info = RequestedKeyInfo {
                                        algorithm: content.algorithm,
                                        room_id: content.room_id,
                                        sender_key: content.sender_key,
                                        session_id: content.session_id,
                                    };

                                    self.queue_withheld(
                                        &user_id,
                                        &device_id,
                                        &info,
                                        WithheldCode::NoOlm,
                                    );
                                }
                                QueuedShare::Secret(content) => {
                                    warn!(
                                        request_id = ?content.request_id,
                                        "Dropping a secret, the requesting device has no Olm channel"
                                    );
                                }
                            }
                        }
                    }
                }
            }
        }

        self.key_claims.lock().queued.retain(|_, devices| !devices.is_empty());

        if olm_channels.is_empty() {
            Ok(())
        } else {
            self.store.save_changes(Changes { olm_channels, ..Default::default() }).await
        }
    }

    /// Check the claimed one-time key of the device, returns the Curve25519
    /// key of the device if the one-time key carries a valid signature.
    async fn verify_claimed_key(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        response: &KeysClaimResponse,
    ) -> StoreResult<Option<String>> {
        let Some(device) = self.store.get_device(user_id, device_id).await? else {
            return Ok(None);
        };

        let (Some(signing_key), Some(curve25519_key)) =
            (device.ed25519_key(), device.curve25519_key())
        else {
            return Ok(None);
        };

        let key_id = ed25519_key_id(device_id.as_str());

        let valid = response
            .one_time_keys
            .get(user_id)
            .and_then(|d| d.get(device_id))
            .into_iter()
            .flat_map(|keys| keys.values())
            .any(|key| signing_key.verify_json(user_id, &key_id, key).is_ok());

        Ok(valid.then(|| curve25519_key.to_base64()))
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, sync::Arc};

    use assert_matches2::assert_matches;
    use ruma::{
        device_id, owned_event_id, room_id, to_device::DeviceIdOrAllDevices, user_id, DeviceId,
        MilliSecondsSinceUnixEpoch, RoomId, TransactionId, UserId,
    };

    use super::GossipMachine;
    use crate::{
        gossiping::{
            IncomingRequestState, KeyReplyResult, OutgoingRequestState, RejectionReason,
        },
        identities::{Device, LocalTrust},
        olm::{Account, InboundGroupSession},
        requests::{KeysClaimResponse, OutgoingRequest},
        settings::TrustMachineSettings,
        store::{Changes, MemoryStore, Store},
        types::events::{
            AnyToDeviceContent, EncryptedRoomEvent, KeyRequestAction, RoomEncryptedContent,
            RoomEvent, RoomKeyRequestContent, RoomKeyWithheldContent, SecretName,
            SecretRequestAction, SecretRequestContent, SecretSendContent, ToDeviceEvent,
            WithheldCode, MEGOLM_V1_AES_SHA2,
        },
    };

    fn alice_id() -> &'static UserId {
        user_id!("@alice:localhost")
    }

    fn alice_device_id() -> &'static DeviceId {
        device_id!("ALICEDEVICE")
    }

    fn alice2_device_id() -> &'static DeviceId {
        device_id!("ALICEDEVICE2")
    }

    fn bob_id() -> &'static UserId {
        user_id!("@bob:localhost")
    }

    fn bob_device_id() -> &'static DeviceId {
        device_id!("BOBDEVICE")
    }

    fn room_id() -> &'static RoomId {
        room_id!("!test:localhost")
    }

    fn machine_for(account: &Account) -> GossipMachine {
        let store = Store::new(account.static_data().clone(), Arc::new(MemoryStore::new()));
        GossipMachine::new(store, &TrustMachineSettings::default())
    }

    async fn save_device(machine: &GossipMachine, account: &Account, trust: LocalTrust) {
        let device = Device::new(account.device_keys().unwrap(), trust);
        machine.store.save_device(device).await.unwrap();
    }

    fn session_of(account: &Account) -> InboundGroupSession {
        account.static_data().create_group_session_pair(room_id().to_owned()).1
    }

    fn encrypted_event(
        sender: &UserId,
        device_id: &DeviceId,
        session: &InboundGroupSession,
    ) -> EncryptedRoomEvent {
        RoomEvent {
            sender: sender.to_owned(),
            event_id: owned_event_id!("$event:localhost"),
            room_id: session.room_id().to_owned(),
            origin_server_ts: MilliSecondsSinceUnixEpoch::now(),
            content: RoomEncryptedContent {
                algorithm: MEGOLM_V1_AES_SHA2.to_owned(),
                ciphertext: "ciphertext".to_owned(),
                sender_key: session.sender_key().to_base64(),
                device_id: device_id.to_owned(),
                session_id: session.session_id().to_owned(),
            },
        }
    }

    fn key_request_event(
        sender: &UserId,
        device_id: &DeviceId,
        request_id: &str,
        session: &InboundGroupSession,
    ) -> ToDeviceEvent<RoomKeyRequestContent> {
        let body = GossipMachine::requested_key_info(&encrypted_event(sender, device_id, session));

        ToDeviceEvent::new(
            sender.to_owned(),
            RoomKeyRequestContent {
                action: KeyRequestAction::Request,
                body: Some(body),
                request_id: request_id.into(),
                requesting_device_id: device_id.to_owned(),
            },
        )
    }

    fn secret_request_event(
        sender: &UserId,
        device_id: &DeviceId,
        secret_name: SecretName,
    ) -> ToDeviceEvent<SecretRequestContent> {
        ToDeviceEvent::new(
            sender.to_owned(),
            SecretRequestContent {
                action: SecretRequestAction::Request,
                name: Some(secret_name),
                request_id: TransactionId::new(),
                requesting_device_id: device_id.to_owned(),
            },
        )
    }

    /// Alice's first device holding her master key, with an Olm channel to her
    /// second device.
    async fn alice_machines_with_secret(trust: LocalTrust) -> (GossipMachine, Account) {
        let (machine, alice2, _) = alice_machines(trust).await;

        let changes = Changes {
            olm_channels: vec![alice2.identity_keys().curve25519.to_base64()],
            secrets: vec![(SecretName::CrossSigningMasterKey, "master key".to_owned())],
            ..Default::default()
        };
        machine.store.save_changes(changes).await.unwrap();

        (machine, alice2)
    }

    fn contents(request: &OutgoingRequest) -> Vec<&AnyToDeviceContent> {
        request.request().to_device().unwrap().messages.values().flat_map(|d| d.values()).collect()
    }

    /// Alice's first device holding a room key and her second device, known
    /// to the first one with the given trust.
    async fn alice_machines(trust: LocalTrust) -> (GossipMachine, Account, InboundGroupSession) {
        let alice = Account::new(alice_id(), alice_device_id());
        let alice2 = Account::new(alice_id(), alice2_device_id());
        let machine = machine_for(&alice);

        save_device(&machine, &alice2, trust).await;

        let session = session_of(&alice);
        let changes =
            Changes { inbound_group_sessions: vec![session.clone()], ..Default::default() };
        machine.store.save_changes(changes).await.unwrap();

        (machine, alice2, session)
    }

    #[tokio::test]
    async fn create_machine() {
        let machine = machine_for(&Account::new(alice_id(), alice_device_id()));
        assert!(machine.outgoing_to_device_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn room_key_requests_are_deduplicated() {
        let account = Account::new(alice_id(), alice_device_id());
        let machine = machine_for(&account);
        let event = encrypted_event(alice_id(), alice_device_id(), &session_of(&account));

        let request = machine.request_room_key_for_event(&event).await.unwrap().unwrap();
        assert!(machine.request_room_key_for_event(&event).await.unwrap().is_none());

        let requests = machine.outgoing_to_device_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].request_id(), &*request.request_id);

        let to_device = requests[0].request().to_device().unwrap();
        assert_eq!(to_device.event_type, "m.room_key_request");
        assert!(to_device.messages[alice_id()].contains_key(&DeviceIdOrAllDevices::AllDevices));

        machine.mark_outgoing_request_as_sent(&request.request_id).await.unwrap();
        assert!(machine.outgoing_to_device_requests().await.unwrap().is_empty());

        let stored =
            machine.store.get_outgoing_key_request(&request.request_id).await.unwrap().unwrap();
        assert_eq!(stored.state, OutgoingRequestState::Sent);
        assert!(machine.request_room_key_for_event(&event).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn requests_for_keys_of_other_users_include_the_sending_device() {
        let machine = machine_for(&Account::new(alice_id(), alice_device_id()));
        let bob = Account::new(bob_id(), bob_device_id());
        let event = encrypted_event(bob_id(), bob_device_id(), &session_of(&bob));

        let request = machine.request_room_key_for_event(&event).await.unwrap().unwrap();

        assert_eq!(
            request.recipients[bob_id()],
            vec![DeviceIdOrAllDevices::DeviceId(bob_device_id().to_owned())]
        );
        assert_eq!(request.recipients[alice_id()], vec![DeviceIdOrAllDevices::AllDevices]);
    }

    #[tokio::test]
    async fn re_request_cancels_and_resends() {
        let account = Account::new(alice_id(), alice_device_id());
        let machine = machine_for(&account);
        let event = encrypted_event(alice_id(), alice_device_id(), &session_of(&account));

        let request = machine.request_room_key_for_event(&event).await.unwrap().unwrap();
        machine.mark_outgoing_request_as_sent(&request.request_id).await.unwrap();

        machine.re_request_room_key_for_event(&event).await.unwrap();

        let requests = machine.outgoing_to_device_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].request_id(), &*request.request_id);
        assert_matches!(contents(&requests[0])[0], AnyToDeviceContent::RoomKeyRequest(cancel));
        assert_eq!(cancel.action, KeyRequestAction::CancelRequest);
        assert!(cancel.body.is_none());

        machine.mark_outgoing_request_as_sent(&request.request_id).await.unwrap();

        let old = machine.store.get_outgoing_key_request(&request.request_id).await.unwrap().unwrap();
        assert_eq!(old.state, OutgoingRequestState::Cancelled);

        let requests = machine.outgoing_to_device_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        assert_ne!(requests[0].request_id(), &*request.request_id);
        assert_matches!(contents(&requests[0])[0], AnyToDeviceContent::RoomKeyRequest(resend));
        assert_eq!(resend.action, KeyRequestAction::Request);
        assert_eq!(resend.body.as_ref(), Some(&request.info));
    }

    #[tokio::test]
    async fn re_requesting_an_unsent_request_replaces_it() {
        let account = Account::new(alice_id(), alice_device_id());
        let machine = machine_for(&account);
        let event = encrypted_event(alice_id(), alice_device_id(), &session_of(&account));

        let request = machine.request_room_key_for_event(&event).await.unwrap().unwrap();
        machine.re_request_room_key_for_event(&event).await.unwrap();

        assert!(machine.store.get_outgoing_key_request(&request.request_id).await.unwrap().is_none());

        let requests = machine.outgoing_to_device_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        assert_ne!(requests[0].request_id(), &*request.request_id);
    }

    #[tokio::test]
    async fn forwarded_key_resolves_the_request() {
        let alice = Account::new(alice_id(), alice_device_id());
        let alice2 = Account::new(alice_id(), alice2_device_id());
        let machine = machine_for(&alice2);
        let session = session_of(&alice);

        save_device(&machine, &alice, LocalTrust::Verified).await;

        let event = encrypted_event(alice_id(), alice_device_id(), &session);
        let request = machine.request_room_key_for_event(&event).await.unwrap().unwrap();
        machine.mark_outgoing_request_as_sent(&request.request_id).await.unwrap();

        let sender_key = alice.identity_keys().curve25519;
        let content = session.to_forwarded_room_key_content(sender_key);
        let imported = machine
            .receive_forwarded_room_key(alice_id(), Some(sender_key), &content)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(imported.session_id(), session.session_id());
        assert!(imported.is_imported());
        assert!(machine
            .store
            .get_inbound_group_session(room_id(), session.session_id())
            .await
            .unwrap()
            .is_some());

        let stored =
            machine.store.get_outgoing_key_request(&request.request_id).await.unwrap().unwrap();
        assert_eq!(stored.state, OutgoingRequestState::CancellationPending);
        assert_eq!(stored.replies[0].result, KeyReplyResult::Accepted);
        assert_eq!(stored.replies[0].device_id.as_deref(), Some(alice_device_id()));

        machine.mark_outgoing_request_as_sent(&request.request_id).await.unwrap();

        assert!(machine
            .store
            .get_unresolved_key_request(room_id(), session.session_id())
            .await
            .unwrap()
            .is_none());
        assert!(machine.outgoing_to_device_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unrequested_forwarded_keys_are_dropped() {
        let alice = Account::new(alice_id(), alice_device_id());
        let machine = machine_for(&Account::new(alice_id(), alice2_device_id()));
        let session = session_of(&alice);

        let sender_key = alice.identity_keys().curve25519;
        let content = session.to_forwarded_room_key_content(sender_key);

        assert!(machine
            .receive_forwarded_room_key(alice_id(), Some(sender_key), &content)
            .await
            .unwrap()
            .is_none());
        assert!(machine
            .store
            .get_inbound_group_session(room_id(), session.session_id())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn forwarded_keys_need_a_trusted_forwarder() {
        let alice = Account::new(alice_id(), alice_device_id());
        let alice2 = Account::new(alice_id(), alice2_device_id());
        let machine = machine_for(&alice2);
        let session = session_of(&alice);

        let event = encrypted_event(alice_id(), alice_device_id(), &session);
        let request = machine.request_room_key_for_event(&event).await.unwrap().unwrap();
        machine.mark_outgoing_request_as_sent(&request.request_id).await.unwrap();

        let sender_key = alice.identity_keys().curve25519;
        let content = session.to_forwarded_room_key_content(sender_key);

        // An unknown device, a forward that didn't come over Olm, a blacklisted
        // and an unverified device are all refused.
        assert!(machine
            .receive_forwarded_room_key(alice_id(), Some(sender_key), &content)
            .await
            .unwrap()
            .is_none());
        assert!(machine.receive_forwarded_room_key(alice_id(), None, &content).await.unwrap().is_none());

        for trust in [LocalTrust::BlackListed, LocalTrust::Unset] {
            save_device(&machine, &alice, trust).await;

            assert!(machine
                .receive_forwarded_room_key(alice_id(), Some(sender_key), &content)
                .await
                .unwrap()
                .is_none());
        }

        assert!(machine
            .store
            .get_inbound_group_session(room_id(), session.session_id())
            .await
            .unwrap()
            .is_none());

        let stored =
            machine.store.get_outgoing_key_request(&request.request_id).await.unwrap().unwrap();
        assert_eq!(stored.state, OutgoingRequestState::Sent);
        assert!(stored.replies.is_empty());
    }

    #[tokio::test]
    async fn withheld_notices_are_recorded_as_replies() {
        let alice = Account::new(alice_id(), alice_device_id());
        let machine = machine_for(&Account::new(alice_id(), alice2_device_id()));
        let session = session_of(&alice);

        let event = encrypted_event(alice_id(), alice_device_id(), &session);
        let request = machine.request_room_key_for_event(&event).await.unwrap().unwrap();

        let content = RoomKeyWithheldContent {
            algorithm: MEGOLM_V1_AES_SHA2.to_owned(),
            code: WithheldCode::Unauthorised,
            reason: WithheldCode::Unauthorised.reason().to_owned(),
            room_id: room_id().to_owned(),
            session_id: session.session_id().to_owned(),
            sender_key: session.sender_key().to_base64(),
            from_device: alice_device_id().to_owned(),
        };

        machine.receive_room_key_withheld(alice_id(), &content).await.unwrap();

        let stored =
            machine.store.get_outgoing_key_request(&request.request_id).await.unwrap().unwrap();
        assert!(stored.is_unresolved());
        assert_eq!(stored.replies[0].result, KeyReplyResult::Rejected(WithheldCode::Unauthorised));
        assert_eq!(stored.replies[0].device_id.as_deref(), Some(alice_device_id()));
        assert!(machine
            .store
            .get_withheld_info(room_id(), session.session_id())
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn requests_of_other_users_are_rejected_silently() {
        let (machine, _, session) = alice_machines(LocalTrust::Verified).await;

        machine.receive_incoming_key_request(&key_request_event(
            bob_id(),
            bob_device_id(),
            "request",
            &session,
        ));

        let handled = machine.process_incoming_key_requests().await.unwrap();
        assert_eq!(handled[0].state, IncomingRequestState::Rejected(RejectionReason::NotOwnUser));
        assert!(machine.outgoing_to_device_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn requests_of_unknown_devices_queue_a_key_query() {
        let (machine, _, session) = alice_machines(LocalTrust::Verified).await;

        machine.receive_incoming_key_request(&key_request_event(
            alice_id(),
            device_id!("UNKNOWN"),
            "request",
            &session,
        ));

        let handled = machine.process_incoming_key_requests().await.unwrap();
        assert_eq!(
            handled[0].state,
            IncomingRequestState::Rejected(RejectionReason::UnknownDevice)
        );

        let tracked = machine.store.load_tracked_users().await.unwrap();
        assert!(tracked.iter().any(|u| &*u.user_id == alice_id() && u.dirty));
        assert!(machine.outgoing_to_device_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unverified_devices_are_told_they_are_unauthorised() {
        let (machine, _, session) = alice_machines(LocalTrust::Unset).await;

        machine.receive_incoming_key_request(&key_request_event(
            alice_id(),
            alice2_device_id(),
            "request",
            &session,
        ));

        let handled = machine.process_incoming_key_requests().await.unwrap();
        assert_eq!(handled[0].state, IncomingRequestState::Rejected(RejectionReason::Unverified));

        let requests = machine.outgoing_to_device_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        assert_matches!(contents(&requests[0])[0], AnyToDeviceContent::RoomKeyWithheld(withheld));
        assert_eq!(withheld.code, WithheldCode::Unauthorised);
        assert_eq!(&*withheld.from_device, alice_device_id());
    }

    #[tokio::test]
    async fn blacklisted_devices_are_told_so() {
        let (machine, _, session) = alice_machines(LocalTrust::BlackListed).await;

        machine.receive_incoming_key_request(&key_request_event(
            alice_id(),
            alice2_device_id(),
            "request",
            &session,
        ));

        let handled = machine.process_incoming_key_requests().await.unwrap();
        assert_eq!(handled[0].state, IncomingRequestState::Rejected(RejectionReason::Blacklisted));

        let requests = machine.outgoing_to_device_requests().await.unwrap();
        assert_matches!(contents(&requests[0])[0], AnyToDeviceContent::RoomKeyWithheld(withheld));
        assert_eq!(withheld.code, WithheldCode::Blacklisted);
    }

    #[tokio::test]
    async fn requests_for_unknown_sessions_are_unavailable() {
        let (machine, _, _) = alice_machines(LocalTrust::Verified).await;
        let other_session = session_of(&Account::new(alice_id(), alice_device_id()));

        machine.receive_incoming_key_request(&key_request_event(
            alice_id(),
            alice2_device_id(),
            "request",
            &other_session,
        ));

        let handled = machine.process_incoming_key_requests().await.unwrap();
        assert_eq!(
            handled[0].state,
            IncomingRequestState::Rejected(RejectionReason::UnknownSession)
        );

        let requests = machine.outgoing_to_device_requests().await.unwrap();
        assert_matches!(contents(&requests[0])[0], AnyToDeviceContent::RoomKeyWithheld(withheld));
        assert_eq!(withheld.code, WithheldCode::Unavailable);
    }

    #[tokio::test]
    async fn verified_devices_with_a_channel_get_the_key() {
        let (machine, alice2, session) = alice_machines(LocalTrust::Verified).await;

        let changes = Changes {
            olm_channels: vec![alice2.identity_keys().curve25519.to_base64()],
            ..Default::default()
        };
        machine.store.save_changes(changes).await.unwrap();

        machine.receive_incoming_key_request(&key_request_event(
            alice_id(),
            alice2_device_id(),
            "request",
            &session,
        ));

        let handled = machine.process_incoming_key_requests().await.unwrap();
        assert_eq!(handled[0].state, IncomingRequestState::Accepted);
        assert_eq!(machine.store.get_incoming_key_requests().await.unwrap().len(), 1);

        let requests = machine.outgoing_to_device_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        assert_matches!(contents(&requests[0])[0], AnyToDeviceContent::ForwardedRoomKey(forward));
        assert_eq!(forward.session_id, session.session_id());

        let imported = InboundGroupSession::from_forwarded_key(None, forward).unwrap();
        assert_eq!(imported.first_known_index(), session.first_known_index());

        machine.mark_outgoing_request_as_sent(requests[0].request_id()).await.unwrap();
        assert!(machine.outgoing_to_device_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn forwards_wait_for_a_key_claim() {
        let (machine, mut alice2, session) = alice_machines(LocalTrust::Verified).await;

        machine.receive_incoming_key_request(&key_request_event(
            alice_id(),
            alice2_device_id(),
            "request",
            &session,
        ));

        let handled = machine.process_incoming_key_requests().await.unwrap();
        assert_eq!(handled[0].state, IncomingRequestState::Accepted);

        let requests = machine.outgoing_to_device_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        let claim = requests[0].request().keys_claim().unwrap();
        assert!(claim.one_time_keys[alice_id()].contains_key(alice2_device_id()));

        // The claim is retried with the same ID until its response arrives.
        let again = machine.outgoing_to_device_requests().await.unwrap();
        assert_eq!(again[0].request_id(), requests[0].request_id());

        alice2.generate_one_time_keys_if_needed();
        let one_time_keys = alice2.signed_one_time_keys().unwrap().into_iter().take(1).collect();
        let response = KeysClaimResponse {
            one_time_keys: BTreeMap::from([(
                alice_id().to_owned(),
                BTreeMap::from([(alice2_device_id().to_owned(), one_time_keys)]),
            )]),
            failures: Default::default(),
        };

        machine.receive_keys_claim_response(requests[0].request_id(), &response).await.unwrap();

        let requests = machine.outgoing_to_device_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        assert_matches!(contents(&requests[0])[0], AnyToDeviceContent::ForwardedRoomKey(_));
        assert!(machine
            .store
            .has_olm_channel(&alice2.identity_keys().curve25519.to_base64())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn failed_key_claims_withhold_the_key() {
        let (machine, _, session) = alice_machines(LocalTrust::Verified).await;

        machine.receive_incoming_key_request(&key_request_event(
            alice_id(),
            alice2_device_id(),
            "request",
            &session,
        ));
        machine.process_incoming_key_requests().await.unwrap();

        let requests = machine.outgoing_to_device_requests().await.unwrap();
        machine
            .receive_keys_claim_response(requests[0].request_id(), &KeysClaimResponse::default())
            .await
            .unwrap();

        let requests = machine.outgoing_to_device_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        assert_matches!(contents(&requests[0])[0], AnyToDeviceContent::RoomKeyWithheld(withheld));
        assert_eq!(withheld.code, WithheldCode::NoOlm);
    }

    #[tokio::test]
    async fn cancellations_remove_buffered_requests() {
        let (machine, _, session) = alice_machines(LocalTrust::Verified).await;

        let request = key_request_event(alice_id(), alice2_device_id(), "request", &session);
        let mut cancellation = request.clone();
        cancellation.content.action = KeyRequestAction::CancelRequest;
        cancellation.content.body = None;

        machine.receive_incoming_key_request(&request);
        machine.receive_incoming_key_request(&request);
        machine.receive_incoming_key_request(&cancellation);

        assert!(machine.process_incoming_key_requests().await.unwrap().is_empty());
        assert!(machine.outgoing_to_device_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn requests_of_our_own_device_are_ignored() {
        let (machine, _, session) = alice_machines(LocalTrust::Verified).await;

        machine.receive_incoming_key_request(&key_request_event(
            alice_id(),
            alice_device_id(),
            "request",
            &session,
        ));

        assert!(machine.process_incoming_key_requests().await.unwrap().is_empty());
        assert!(machine.store.get_incoming_key_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_request_ids_are_ignored() {
        let machine = machine_for(&Account::new(alice_id(), alice_device_id()));
        machine.mark_outgoing_request_as_sent(&TransactionId::new()).await.unwrap();
        assert!(machine.outgoing_to_device_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn secrets_are_shared_with_recently_verified_devices() {
        let (machine, _) = alice_machines_with_secret(LocalTrust::Verified).await;
        machine.store.mark_device_as_recently_verified(alice2_device_id());

        let event =
            secret_request_event(alice_id(), alice2_device_id(), SecretName::CrossSigningMasterKey);
        machine.receive_secret_request(&event).await.unwrap();

        let requests = machine.outgoing_to_device_requests().await.unwrap();
        assert_eq!(requests.len(), 1);

        let to_device = requests[0].request().to_device().unwrap();
        assert!(to_device.messages[alice_id()]
            .contains_key(&DeviceIdOrAllDevices::DeviceId(alice2_device_id().to_owned())));
        assert_matches!(contents(&requests[0])[0], AnyToDeviceContent::SecretSend(send));
        assert_eq!(send.request_id, event.content.request_id);
        assert_eq!(send.secret, "master key");
    }

    #[tokio::test]
    async fn secrets_wait_for_a_key_claim() {
        let (machine, _, _) = alice_machines(LocalTrust::Verified).await;
        let changes = Changes {
            secrets: vec![(SecretName::CrossSigningMasterKey, "master key".to_owned())],
            ..Default::default()
        };
        machine.store.save_changes(changes).await.unwrap();
        machine.store.mark_device_as_recently_verified(alice2_device_id());

        let event =
            secret_request_event(alice_id(), alice2_device_id(), SecretName::CrossSigningMasterKey);
        machine.receive_secret_request(&event).await.unwrap();

        let requests = machine.outgoing_to_device_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].request().keys_claim().is_some());

        // Secrets aren't withheld, they are dropped if no channel can be set up.
        machine
            .receive_keys_claim_response(requests[0].request_id(), &KeysClaimResponse::default())
            .await
            .unwrap();
        assert!(machine.outgoing_to_device_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn secret_requests_need_a_recent_verification() {
        let (machine, _) = alice_machines_with_secret(LocalTrust::Verified).await;

        let event =
            secret_request_event(alice_id(), alice2_device_id(), SecretName::CrossSigningMasterKey);
        machine.receive_secret_request(&event).await.unwrap();

        assert!(machine.outgoing_to_device_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn secret_requests_of_untrusted_devices_are_ignored() {
        for trust in [LocalTrust::Unset, LocalTrust::BlackListed] {
            let (machine, _) = alice_machines_with_secret(trust).await;
            machine.store.mark_device_as_recently_verified(alice2_device_id());

            let event = secret_request_event(
                alice_id(),
                alice2_device_id(),
                SecretName::CrossSigningMasterKey,
            );
            machine.receive_secret_request(&event).await.unwrap();

            assert!(machine.outgoing_to_device_requests().await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn secret_requests_of_other_users_and_unknown_secrets_are_ignored() {
        let (machine, _) = alice_machines_with_secret(LocalTrust::Verified).await;
        let bob = Account::new(bob_id(), bob_device_id());
        save_device(&machine, &bob, LocalTrust::Verified).await;
        machine.store.mark_device_as_recently_verified(alice2_device_id());
        machine.store.mark_device_as_recently_verified(bob_device_id());

        let event = secret_request_event(bob_id(), bob_device_id(), SecretName::CrossSigningMasterKey);
        machine.receive_secret_request(&event).await.unwrap();

        let event = secret_request_event(alice_id(), alice2_device_id(), SecretName::RecoveryKey);
        machine.receive_secret_request(&event).await.unwrap();

        assert!(machine.outgoing_to_device_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn requested_secrets_land_in_the_inbox() {
        let (machine, alice2, _) = alice_machines(LocalTrust::Verified).await;

        let request_id = machine.request_secret(SecretName::RecoveryKey);

        let requests = machine.outgoing_to_device_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].request_id(), &*request_id);
        let to_device = requests[0].request().to_device().unwrap();
        assert!(to_device.messages[alice_id()].contains_key(&DeviceIdOrAllDevices::AllDevices));
        assert_matches!(contents(&requests[0])[0], AnyToDeviceContent::SecretRequest(request));
        assert_eq!(request.name, Some(SecretName::RecoveryKey));
        machine.mark_outgoing_request_as_sent(&request_id).await.unwrap();

        let content =
            SecretSendContent { request_id: request_id.clone(), secret: "recovery".to_owned() };
        let sender_key = Some(alice2.identity_keys().curve25519);

        let secret =
            machine.receive_secret_send(alice_id(), sender_key, &content).await.unwrap().unwrap();
        assert_eq!(secret.sender_device_id, alice2_device_id().to_owned());

        let inbox = machine.store.get_secrets_from_inbox(&SecretName::RecoveryKey).await.unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].secret, "recovery");

        // Our other devices are told that the request was answered.
        let requests = machine.outgoing_to_device_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        assert_matches!(contents(&requests[0])[0], AnyToDeviceContent::SecretRequest(cancellation));
        assert_eq!(cancellation.action, SecretRequestAction::RequestCancellation);

        // A second answer to the same request is dropped.
        assert!(machine.receive_secret_send(alice_id(), sender_key, &content).await.unwrap().is_none());

        machine.store.delete_secrets_from_inbox(&SecretName::RecoveryKey).await.unwrap();
        assert!(machine
            .store
            .get_secrets_from_inbox(&SecretName::RecoveryKey)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn unrequested_or_untrusted_secrets_are_dropped() {
        let (machine, alice2, _) = alice_machines(LocalTrust::Unset).await;
        let sender_key = Some(alice2.identity_keys().curve25519);

        let unrequested =
            SecretSendContent { request_id: TransactionId::new(), secret: "secret".to_owned() };
        assert!(machine
            .receive_secret_send(alice_id(), sender_key, &unrequested)
            .await
            .unwrap()
            .is_none());

        let request_id = machine.request_secret(SecretName::RecoveryKey);
        let content = SecretSendContent { request_id, secret: "secret".to_owned() };
        assert!(machine.receive_secret_send(alice_id(), sender_key, &content).await.unwrap().is_none());

        assert!(machine
            .store
            .get_secrets_from_inbox(&SecretName::RecoveryKey)
            .await
            .unwrap()
            .is_empty());
    }
}
