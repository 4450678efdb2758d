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
    collections::{btree_map::Entry, BTreeMap},
    sync::Arc,
    time::Duration,
};

use ruma::{
    to_device::DeviceIdOrAllDevices, DeviceId, MilliSecondsSinceUnixEpoch, OwnedDeviceId,
    OwnedRoomId, OwnedTransactionId, OwnedUserId, RoomId, TransactionId, UserId,
};
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, trace, warn};

use super::{
    is_timestamp_valid, requests::SUPPORTED_METHODS, FlowId, Sas, VerificationCache,
    VerificationEvent, VerificationRequest, VerificationRequestState, VerificationStore,
};
use crate::{
    error::VerificationError,
    locks::RwLock,
    requests::{IncomingResponse, OutgoingRequest, RoomMessageRequest, ToDeviceRequest},
    settings::TrustMachineSettings,
    store::{Result as StoreResult, Store},
    types::events::{
        Relation, RequestContent, RoomEvent, RoomRequestContent, RoomVerificationContent,
        StartContent, ToDeviceVerificationContent, VerificationContent, VerificationMethod,
    },
};

const ROOM_REQUEST_MSGTYPE: &str = "m.key.verification.request";

type FlowMap<T> = Arc<RwLock<BTreeMap<OwnedUserId, BTreeMap<String, T>>>>;

/// An in-room request that waits for the server to tell us the event ID, the
/// event ID becomes the ID of the flow.
#[derive(Debug)]
struct PendingRoomRequest {
    room_id: OwnedRoomId,
    other_user_id: OwnedUserId,
    methods: Vec<VerificationMethod>,
}

/// The owner of all the live verification requests and SAS flows of a
/// session.
///
/// Incoming verification messages are routed to the flow they belong to,
/// every change is announced to the listeners of [`Self::subscribe`].
#[derive(Clone, Debug)]
pub struct VerificationRegistry {
    store: VerificationStore,
    cache: VerificationCache,
    max_age: Duration,
    max_future: Duration,
    transactions: FlowMap<Sas>,
    requests: FlowMap<VerificationRequest>,
    pending_room_requests: Arc<RwLock<BTreeMap<OwnedTransactionId, PendingRoomRequest>>>,
}

impl VerificationRegistry {
    pub(crate) fn new(store: Store, settings: &TrustMachineSettings) -> Self {
        Self {
            store: VerificationStore::new(store),
            cache: VerificationCache::new(),
            max_age: settings.verification_max_age,
            max_future: settings.verification_max_future,
            transactions: Default::default(),
            requests: Default::default(),
            pending_room_requests: Default::default(),
        }
    }

    fn own_user_id(&self) -> &UserId {
        &self.store.account().user_id
    }

    fn own_device_id(&self) -> &DeviceId {
        &self.store.account().device_id
    }

    /// Listen for the progress of all verification flows.
    pub fn subscribe(&self) -> broadcast::Receiver<VerificationEvent> {
        self.cache.subscribe()
    }

    pub(crate) fn emit(&self, event: VerificationEvent) {
        self.cache.emit(event)
    }

    /// Get a SAS flow we're running with the given user.
    pub fn get_existing_transaction(&self, user_id: &UserId, flow_id: &str) -> Option<Sas> {
        self.transactions.read().get(user_id)?.get(flow_id).cloned()
    }

    /// Get a verification request we sent to or received from the given user.
    pub fn get_existing_verification_request(
        &self,
        user_id: &UserId,
        flow_id: &str,
    ) -> Option<VerificationRequest> {
        self.requests.read().get(user_id)?.get(flow_id).cloned()
    }

    /// Get all the verification requests we have with the given user.
    pub fn get_verification_requests(&self, user_id: &UserId) -> Vec<VerificationRequest> {
        self.requests
            .read()
            .get(user_id)
            .map(|requests| requests.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Register a new SAS flow, a flow that already exists is never replaced.
    ///
    /// Returns `false` if a flow with the same flow id was registered already.
    fn insert_transaction(&self, sas: Sas) -> bool {
        {
            let mut transactions = self.transactions.write();
            let user_transactions = transactions.entry(sas.other_user_id().to_owned()).or_default();

            match user_transactions.entry(sas.flow_id().as_str().to_owned()) {
                Entry::Occupied(_) => return false,
                Entry::Vacant(entry) => {
                    entry.insert(sas.clone());
                }
            }
        }

        self.emit(VerificationEvent::TransactionCreated {
            flow_id: sas.flow_id().clone(),
            other_user_id: sas.other_user_id().to_owned(),
        });

        true
    }

    fn insert_request(&self, request: VerificationRequest) {
        self.requests
            .write()
            .entry(request.other_user().to_owned())
            .or_default()
            .insert(request.flow_id().as_str().to_owned(), request.clone());

        self.emit(VerificationEvent::VerificationRequestCreated {
            flow_id: request.flow_id().clone(),
            other_user_id: request.other_user().to_owned(),
        });
    }

    /// Start a to-device SAS verification with the given device, without a
    /// preceding verification request.
    #[instrument(skip(self))]
    pub async fn begin_key_verification(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        method: VerificationMethod,
    ) -> Result<FlowId, VerificationError> {
        if method != VerificationMethod::SasV1 {
            return Err(VerificationError::UnsupportedMethod(method.to_string()));
        }

        let Some(device) = self.store.get_device(user_id, device_id).await? else {
            return Err(VerificationError::UnknownDevice(user_id.to_owned(), device_id.to_owned()));
        };

        let flow_id = FlowId::ToDevice(TransactionId::new());
        let ids = self.store.sas_ids(device).await?;
        let sas = Sas::new(ids, flow_id.clone(), true, self.cache.clone());

        info!(flow_id = flow_id.as_str(), "Starting a SAS verification");

        self.insert_transaction(sas.clone());
        sas.start();

        Ok(flow_id)
    }

    /// Request a verification with the given devices of a user, or with all
    /// of them if no device is given.
    pub fn request_verification(
        &self,
        user_id: &UserId,
        device_ids: Vec<OwnedDeviceId>,
        methods: Option<Vec<VerificationMethod>>,
    ) -> VerificationRequest {
        let transaction_id = TransactionId::new();
        let flow_id = FlowId::ToDevice(transaction_id.clone());

        let recipients: Vec<DeviceIdOrAllDevices> = if device_ids.is_empty() {
            vec![DeviceIdOrAllDevices::AllDevices]
        } else {
            device_ids.iter().cloned().map(Into::into).collect()
        };

        let request = VerificationRequest::new(
            self.store.account().clone(),
            self.cache.clone(),
            flow_id,
            user_id,
            device_ids,
            methods,
        );

        let content = RequestContent {
            from_device: self.own_device_id().to_owned(),
            methods: request.our_supported_methods().unwrap_or_default(),
            timestamp: MilliSecondsSinceUnixEpoch::now(),
            transaction_id,
        };

        let to_device = ToDeviceRequest::for_recipients(
            user_id,
            recipients,
            ToDeviceVerificationContent::Request(content),
            TransactionId::new(),
        );

        self.cache.queue_up_request(to_device.into());
        self.insert_request(request.clone());

        request
    }

    /// Request a verification with a user in a direct message room.
    ///
    /// The request only shows up in [`Self::get_verification_requests`] once
    /// the returned request was sent out, the event ID the server gives it
    /// becomes the flow ID.
    pub fn request_verification_in_room(
        &self,
        user_id: &UserId,
        room_id: &RoomId,
        methods: Option<Vec<VerificationMethod>>,
    ) -> OwnedTransactionId {
        let methods = methods.unwrap_or_else(|| SUPPORTED_METHODS.to_vec());
        let txn_id = TransactionId::new();

        let content = RoomRequestContent {
            msgtype: ROOM_REQUEST_MSGTYPE.to_owned(),
            body: format!(
                "{} is requesting to verify your key, but your client does not support \
                 in-chat key verification. You will need to use legacy key verification \
                 to verify keys.",
                self.own_user_id()
            ),
            from_device: self.own_device_id().to_owned(),
            methods: methods.clone(),
            to: user_id.to_owned(),
        };

        let request = RoomMessageRequest {
            room_id: room_id.to_owned(),
            txn_id: txn_id.clone(),
            content: RoomVerificationContent::Request(content),
        };

        self.pending_room_requests.write().insert(
            txn_id.clone(),
            PendingRoomRequest {
                room_id: room_id.to_owned(),
                other_user_id: user_id.to_owned(),
                methods,
            },
        );
        self.cache.queue_up_request(request.into());

        txn_id
    }

    /// Accept a verification request the other side sent us.
    pub fn ready_pending_verification(
        &self,
        user_id: &UserId,
        flow_id: &str,
        methods: Option<Vec<VerificationMethod>>,
    ) -> Result<(), VerificationError> {
        let request = self
            .get_existing_verification_request(user_id, flow_id)
            .ok_or_else(|| VerificationError::UnknownFlow(flow_id.to_owned()))?;

        let methods = methods.unwrap_or_else(|| SUPPORTED_METHODS.to_vec());

        if request.accept_with_methods(methods) {
            Ok(())
        } else {
            Err(VerificationError::InvalidState)
        }
    }

    /// Decline a verification request, usually one we received in a direct
    /// message room.
    pub fn decline_verification_request_in_dm(
        &self,
        user_id: &UserId,
        flow_id: &str,
    ) -> Result<(), VerificationError> {
        let request = self
            .get_existing_verification_request(user_id, flow_id)
            .ok_or_else(|| VerificationError::UnknownFlow(flow_id.to_owned()))?;

        if request.is_terminal() {
            return Err(VerificationError::InvalidState);
        }

        request.cancel();

        Ok(())
    }

    /// Transition a ready verification request into a SAS flow.
    #[instrument(skip(self))]
    pub async fn start_sas_from_request(
        &self,
        user_id: &UserId,
        flow_id: &str,
    ) -> Result<Sas, VerificationError> {
        let request = self
            .get_existing_verification_request(user_id, flow_id)
            .ok_or_else(|| VerificationError::UnknownFlow(flow_id.to_owned()))?;

        let VerificationRequestState::Ready { their_methods, our_methods, other_device_id } =
            request.state()
        else {
            return Err(VerificationError::InvalidState);
        };

        let sas_v1 = VerificationMethod::SasV1;
        if !their_methods.contains(&sas_v1) || !our_methods.contains(&sas_v1) {
            return Err(VerificationError::UnsupportedMethod(sas_v1.to_string()));
        }

        let Some(device) = self.store.get_device(user_id, &other_device_id).await? else {
            return Err(VerificationError::UnknownDevice(user_id.to_owned(), other_device_id));
        };

        let ids = self.store.sas_ids(device).await?;
        let sas = Sas::new(ids, request.flow_id().clone(), true, self.cache.clone());

        if !self.insert_transaction(sas.clone()) {
            // The other side started the flow while we were waiting on the
            // store.
            return Err(VerificationError::InvalidState);
        }

        request.mark_as_transitioned();
        sas.start();

        Ok(sas)
    }

    /// Is a verification request with the given timestamp recent enough to act
    /// on it.
    pub fn is_valid_request(&self, timestamp: MilliSecondsSinceUnixEpoch) -> bool {
        is_timestamp_valid(timestamp, MilliSecondsSinceUnixEpoch::now(), self.max_age, self.max_future)
    }

    /// Handle a verification message we received as a to-device event.
    #[instrument(skip_all, fields(sender = ?sender, event_type = content.event_type()))]
    pub async fn receive_to_device_event(
        &self,
        sender: &UserId,
        content: &ToDeviceVerificationContent,
    ) -> StoreResult<()> {
        match content {
            ToDeviceVerificationContent::Request(request) => {
                if sender == self.own_user_id() && &*request.from_device == self.own_device_id() {
                    trace!("The received verification request was sent by us, ignoring it");
                    return Ok(());
                }

                if !self.is_valid_request(request.timestamp) {
                    debug!(
                        from_device = ?request.from_device,
                        timestamp = ?request.timestamp,
                        "The received verification request was too old or too far into the future",
                    );
                    return Ok(());
                }

                self.receive_request(
                    sender,
                    FlowId::ToDevice(request.transaction_id.clone()),
                    request.from_device.clone(),
                    request.methods.clone(),
                );

                Ok(())
            }
            ToDeviceVerificationContent::Other(content) => {
                let Relation::ToDevice { transaction_id } = content.relation() else {
                    warn!("Received an in-room verification message over to-device messaging");
                    return Ok(());
                };

                self.receive_content(sender, FlowId::ToDevice(transaction_id.clone()), content).await
            }
        }
    }

    /// Handle a verification event we received in a room.
    #[instrument(skip_all, fields(sender = ?event.sender, room_id = ?event.room_id, event_id = ?event.event_id))]
    pub async fn receive_room_event(
        &self,
        event: &RoomEvent<RoomVerificationContent>,
    ) -> StoreResult<()> {
        // Room events come back to us, all our devices see them.
        if &*event.sender == self.own_user_id() {
            trace!("Ignoring an in-room verification event we sent");
            return Ok(());
        }

        match &event.content {
            RoomVerificationContent::Request(request) => {
                if &*request.to != self.own_user_id() {
                    trace!(to = ?request.to, "Ignoring an in-room verification request for another user");
                    return Ok(());
                }

                if !self.is_valid_request(event.origin_server_ts) {
                    debug!(
                        timestamp = ?event.origin_server_ts,
                        "The received verification request was too old or too far into the future",
                    );
                    return Ok(());
                }

                self.receive_request(
                    &event.sender,
                    FlowId::InRoom(event.room_id.clone(), event.event_id.clone()),
                    request.from_device.clone(),
                    request.methods.clone(),
                );

                Ok(())
            }
            RoomVerificationContent::Other(content) => {
                let Relation::InRoom { relates_to } = content.relation() else {
                    warn!("Received a to-device verification message in a room");
                    return Ok(());
                };

                let flow_id = FlowId::InRoom(event.room_id.clone(), relates_to.event_id.clone());
                self.receive_content(&event.sender, flow_id, content).await
            }
        }
    }

    fn receive_request(
        &self,
        sender: &UserId,
        flow_id: FlowId,
        from_device: OwnedDeviceId,
        methods: Vec<VerificationMethod>,
    ) {
        if self.get_existing_verification_request(sender, flow_id.as_str()).is_some() {
            debug!(flow_id = flow_id.as_str(), "Ignoring known verification request");
            return;
        }

        info!(?from_device, flow_id = flow_id.as_str(), "Received a new verification request");

        let ongoing: Vec<_> = self
            .get_verification_requests(sender)
            .into_iter()
            .filter(|r| !r.is_terminal())
            .collect();

        let request = VerificationRequest::from_request(
            self.store.account().clone(),
            self.cache.clone(),
            flow_id,
            sender,
            from_device,
            methods,
        );

        self.insert_request(request.clone());

        if !ongoing.is_empty() {
            warn!(
                "Received a new verification request whilst another request \
                 with the same user is ongoing. Cancelling both requests."
            );

            for old_request in ongoing {
                old_request.cancel();
            }

            request.cancel();
        }
    }

    async fn receive_content(
        &self,
        sender: &UserId,
        flow_id: FlowId,
        content: &VerificationContent,
    ) -> StoreResult<()> {
        let request = self.get_existing_verification_request(sender, flow_id.as_str());
        let sas = self.get_existing_transaction(sender, flow_id.as_str());

        if request.as_ref().is_some_and(|r| r.flow_id() != &flow_id)
            || sas.as_ref().is_some_and(|s| s.flow_id() != &flow_id)
        {
            warn!(
                flow_id = flow_id.as_str(),
                "Received a verification event with a mismatched flow id, \
                 the verification object was created for a in-room \
                 verification but a event was received over to-device \
                 messaging or vice versa"
            );
            return Ok(());
        }

        match content {
            VerificationContent::Ready(ready) => match request {
                Some(request) => request.receive_ready(sender, ready),
                None => debug!(flow_id = flow_id.as_str(), "Received a ready for an unknown flow"),
            },
            VerificationContent::Start(start) => {
                if sas.is_some() {
                    debug!(flow_id = flow_id.as_str(), "Ignoring a duplicate start message");
                } else {
                    self.receive_start(sender, flow_id, request, start).await?;
                }
            }
            VerificationContent::Cancel(cancel) => {
                if let Some(request) = &request {
                    request.receive_cancel(sender, cancel);
                }

                if let Some(sas) = sas {
                    sas.receive_content(sender, content);
                    self.handle_sas_progress(&sas).await?;
                } else if request.is_none() {
                    debug!(flow_id = flow_id.as_str(), "Received a cancel for an unknown flow");
                }
            }
            VerificationContent::Done(_) => {
                if let Some(request) = &request {
                    request.receive_done(sender);
                }

                if let Some(sas) = sas {
                    sas.receive_content(sender, content);
                }
            }
            VerificationContent::Accept(_)
            | VerificationContent::Key(_)
            | VerificationContent::Mac(_) => match sas {
                Some(sas) => {
                    sas.receive_content(sender, content);
                    self.handle_sas_progress(&sas).await?;
                }
                None => debug!(
                    flow_id = flow_id.as_str(),
                    event_type = content.event_type(),
                    "Received a verification message for an unknown flow",
                ),
            },
        }

        Ok(())
    }

    async fn receive_start(
        &self,
        sender: &UserId,
        flow_id: FlowId,
        request: Option<VerificationRequest>,
        content: &StartContent,
    ) -> StoreResult<()> {
        match &request {
            Some(request) => {
                let expected_device = match request.state() {
                    VerificationRequestState::Ready { other_device_id, .. } => other_device_id,
                    _ => {
                        warn!(
                            ?sender,
                            device_id = ?content.from_device,
                            "Received a key verification start event but we're not yet in the ready state"
                        );
                        return Ok(());
                    }
                };

                if expected_device != content.from_device {
                    warn!(
                        ?sender,
                        device_id = ?content.from_device,
                        "Received a key verification start event from a device that didn't accept the request"
                    );
                    return Ok(());
                }
            }
            None if flow_id.room_id().is_some() => {
                debug!(flow_id = flow_id.as_str(), "Received an in-room start for an unknown request");
                return Ok(());
            }
            None => {}
        }

        let Some(device) = self.store.get_device(sender, &content.from_device).await? else {
            warn!(
                ?sender,
                device_id = ?content.from_device,
                "Received a key verification start event from an unknown device",
            );
            return Ok(());
        };

        let ids = self.store.sas_ids(device).await?;
        let sas = Sas::new(ids, flow_id, false, self.cache.clone());

        // Another start for the same flow may have been handled while we were
        // waiting on the store.
        if !self.insert_transaction(sas.clone()) {
            debug!(flow_id = sas.flow_id().as_str(), "Ignoring a duplicate start message");
            return Ok(());
        }

        if let Some(request) = request {
            request.mark_as_transitioned();
        }

        sas.receive_start(content);
        self.handle_sas_progress(&sas).await
    }

    /// Store the result of a SAS flow that verified the other side and clean
    /// up flows that finished.
    async fn handle_sas_progress(&self, sas: &Sas) -> StoreResult<()> {
        if let Some((devices, identities)) = sas.verified() {
            let result = self.store.mark_as_verified(sas.ids(), &devices, &identities).await?;
            sas.finish(result);
        }

        if sas.is_terminal() {
            self.remove_transaction(sas);
        }

        Ok(())
    }

    fn remove_transaction(&self, sas: &Sas) {
        trace!(flow_id = sas.flow_id().as_str(), state = ?sas.state(), "Removing a finished SAS flow");

        if let Some(request) =
            self.get_existing_verification_request(sas.other_user_id(), sas.flow_id().as_str())
        {
            request.finish_with_sas(&sas.state());
        }

        let mut transactions = self.transactions.write();

        if let Some(user_transactions) = transactions.get_mut(sas.other_user_id()) {
            user_transactions.remove(sas.flow_id().as_str());

            if user_transactions.is_empty() {
                transactions.remove(sas.other_user_id());
            }
        }

        self.cache.remove_flow(sas.flow_id());
    }

    fn prune_finished_transactions(&self) {
        let finished: Vec<Sas> = self
            .transactions
            .read()
            .values()
            .flat_map(|t| t.values())
            .filter(|s| s.is_terminal())
            .cloned()
            .collect();

        for sas in finished {
            self.remove_transaction(&sas);
        }
    }

    /// The messages the verification flows want to send out.
    pub(crate) fn outgoing_requests(&self) -> Vec<OutgoingRequest> {
        self.prune_finished_transactions();
        self.cache.outgoing_requests()
    }

    /// Handle the response of a request we sent out.
    pub(crate) async fn mark_request_as_sent(
        &self,
        request_id: &TransactionId,
        response: &IncomingResponse<'_>,
    ) -> StoreResult<()> {
        let info = self.cache.mark_request_as_sent(request_id);

        if let IncomingResponse::RoomMessage(response) = response {
            let pending = self.pending_room_requests.write().remove(request_id);

            if let Some(pending) = pending {
                let request = VerificationRequest::new(
                    self.store.account().clone(),
                    self.cache.clone(),
                    FlowId::InRoom(pending.room_id, response.event_id.clone()),
                    &pending.other_user_id,
                    Vec::new(),
                    Some(pending.methods),
                );

                self.insert_request(request);
            }
        }

        let Some(info) = info else {
            return Ok(());
        };

        if let Some(sas) =
            self.get_existing_transaction(&info.other_user_id, info.flow_id.as_str())
        {
            let old_state = sas.state();
            sas.mark_request_as_sent(request_id);

            debug!(
                flow_id = info.flow_id.as_str(),
                ?old_state,
                new_state = ?sas.state(),
                "Marked a SAS verification HTTP request as sent"
            );

            self.handle_sas_progress(&sas).await?;
        }

        Ok(())
    }

    /// Remove the requests and SAS flows that finished.
    pub fn garbage_collect(&self) {
        self.prune_finished_transactions();

        let mut requests = self.requests.write();

        for user_requests in requests.values_mut() {
            user_requests.retain(|_, r| !r.is_terminal());
        }

        requests.retain(|_, r| !r.is_empty());
    }

    #[cfg(test)]
    pub(crate) fn transaction_states(&self) -> Vec<super::SasState> {
        self.transactions.read().values().flat_map(|t| t.values()).map(Sas::state).collect()
    }
}
