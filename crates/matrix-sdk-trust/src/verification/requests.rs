// Copyright 2021 The Matrix.org Foundation C.I.C.
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

use std::sync::Arc;

use eyeball::{ObservableWriteGuard, SharedObservable};
use futures_core::Stream;
use ruma::{DeviceId, OwnedDeviceId, OwnedUserId, RoomId, UserId};
use tracing::{debug, trace};

use super::{CancelInfo, FlowId, SasState, VerificationCache, VerificationEvent};
use crate::{
    olm::StaticAccountData,
    types::events::{CancelCode, CancelContent, ReadyContent, VerificationContent, VerificationMethod},
};

/// The methods we advertise if the user doesn't pick any.
pub(crate) const SUPPORTED_METHODS: &[VerificationMethod] = &[VerificationMethod::SasV1];

/// The state of a [`VerificationRequest`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VerificationRequestState {
    /// We sent out the request, waiting for the other side to accept it.
    Created {
        /// The methods we offered.
        our_methods: Vec<VerificationMethod>,
    },
    /// The other side sent us a request, waiting for us to accept it.
    Requested {
        /// The methods the other side offered.
        their_methods: Vec<VerificationMethod>,
        /// The device that sent the request.
        other_device_id: OwnedDeviceId,
    },
    /// Both sides agreed to verify, a verification flow can be started.
    Ready {
        /// The methods the other side supports.
        their_methods: Vec<VerificationMethod>,
        /// The methods we support.
        our_methods: Vec<VerificationMethod>,
        /// The device we are going to verify.
        other_device_id: OwnedDeviceId,
    },
    /// A SAS flow was started for the request.
    Transitioned {
        /// The device we are verifying.
        other_device_id: OwnedDeviceId,
    },
    /// The verification finished successfully.
    Done,
    /// The request was cancelled, either by us or by the other side.
    Cancelled(CancelInfo),
}

impl VerificationRequestState {
    fn other_device_id(&self) -> Option<&DeviceId> {
        match self {
            Self::Requested { other_device_id, .. }
            | Self::Ready { other_device_id, .. }
            | Self::Transitioned { other_device_id } => Some(other_device_id),
            Self::Created { .. } | Self::Done | Self::Cancelled(_) => None,
        }
    }
}

/// An object controlling key verification requests.
///
/// Interactive verification flows usually start with a verification request,
/// this object lets you send and reply to such a verification request.
///
/// After the initial handshake the verification flow transitions into a
/// [`Sas`](super::Sas) flow.
#[derive(Clone, Debug)]
pub struct VerificationRequest {
    account: StaticAccountData,
    cache: VerificationCache,
    flow_id: Arc<FlowId>,
    other_user_id: OwnedUserId,
    /// The devices our request was sent to, empty if it was sent to all
    /// of them.
    recipient_devices: Arc<[OwnedDeviceId]>,
    we_started: bool,
    state: SharedObservable<VerificationRequestState>,
}

impl VerificationRequest {
    pub(crate) fn new(
        account: StaticAccountData,
        cache: VerificationCache,
        flow_id: FlowId,
        other_user_id: &UserId,
        recipient_devices: Vec<OwnedDeviceId>,
        methods: Option<Vec<VerificationMethod>>,
    ) -> Self {
        let our_methods = methods.unwrap_or_else(|| SUPPORTED_METHODS.to_vec());

        Self {
            account,
            cache,
            flow_id: flow_id.into(),
            other_user_id: other_user_id.to_owned(),
            recipient_devices: recipient_devices.into(),
            we_started: true,
            state: SharedObservable::new(VerificationRequestState::Created { our_methods }),
        }
    }

    pub(crate) fn from_request(
        account: StaticAccountData,
        cache: VerificationCache,
        flow_id: FlowId,
        sender: &UserId,
        from_device: OwnedDeviceId,
        their_methods: Vec<VerificationMethod>,
    ) -> Self {
        Self {
            account,
            cache,
            flow_id: flow_id.into(),
            other_user_id: sender.to_owned(),
            recipient_devices: Arc::new([]),
            we_started: false,
            state: SharedObservable::new(VerificationRequestState::Requested {
                their_methods,
                other_device_id: from_device,
            }),
        }
    }

    /// Our own user id.
    pub fn own_user_id(&self) -> &UserId {
        &self.account.user_id
    }

    /// The id of the other user that is participating in this verification
    /// request.
    pub fn other_user(&self) -> &UserId {
        &self.other_user_id
    }

    /// The id of the other device that is participating in this verification,
    /// known once the other side sent or answered the request.
    pub fn other_device_id(&self) -> Option<OwnedDeviceId> {
        self.state.read().other_device_id().map(ToOwned::to_owned)
    }

    /// Get the room id if the verification is happening inside a room.
    pub fn room_id(&self) -> Option<&RoomId> {
        self.flow_id.room_id()
    }

    /// Get the unique ID of this verification request
    pub fn flow_id(&self) -> &FlowId {
        &self.flow_id
    }

    /// Has the verification request been sent by us.
    pub fn we_started(&self) -> bool {
        self.we_started
    }

    /// Is this a verification that is verifying one of our own devices.
    pub fn is_self_verification(&self) -> bool {
        self.own_user_id() == self.other_user()
    }

    /// Get the current state of the request.
    pub fn state(&self) -> VerificationRequestState {
        self.state.get()
    }

    /// Listen for changes in the verification request.
    pub fn changes(&self) -> impl Stream<Item = VerificationRequestState> + use<> {
        self.state.subscribe()
    }

    /// Has the verification flow that was started with this request been
    /// ready.
    pub fn is_ready(&self) -> bool {
        matches!(*self.state.read(), VerificationRequestState::Ready { .. })
    }

    /// Has the verification flow that was started with this request finished.
    pub fn is_done(&self) -> bool {
        matches!(*self.state.read(), VerificationRequestState::Done)
    }

    /// Has the verification flow that was started with this request been
    /// cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(*self.state.read(), VerificationRequestState::Cancelled(_))
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.is_done() || self.is_cancelled()
    }

    /// Get info about the cancellation if the verification request has been
    /// cancelled.
    pub fn cancel_info(&self) -> Option<CancelInfo> {
        as_variant::as_variant!(self.state(), VerificationRequestState::Cancelled)
    }

    /// Get the supported verification methods of the other side.
    ///
    /// Will be present only if the other side requested or accepted the
    /// verification.
    pub fn their_supported_methods(&self) -> Option<Vec<VerificationMethod>> {
        match self.state() {
            VerificationRequestState::Requested { their_methods, .. }
            | VerificationRequestState::Ready { their_methods, .. } => Some(their_methods),
            _ => None,
        }
    }

    /// Get our own supported verification methods that we advertised.
    ///
    /// Will be present only we requested the verification or if we're in the
    /// ready state.
    pub fn our_supported_methods(&self) -> Option<Vec<VerificationMethod>> {
        match self.state() {
            VerificationRequestState::Created { our_methods }
            | VerificationRequestState::Ready { our_methods, .. } => Some(our_methods),
            _ => None,
        }
    }

    /// Accept the verification request signaling that our client supports the
    /// given verification methods.
    ///
    /// Returns false if the request isn't waiting for us to accept it.
    pub fn accept_with_methods(&self, methods: Vec<VerificationMethod>) -> bool {
        let mut state = self.state.write();

        let VerificationRequestState::Requested { their_methods, other_device_id } = &*state else {
            return false;
        };

        let other_device_id = other_device_id.clone();
        let new_state = VerificationRequestState::Ready {
            their_methods: their_methods.clone(),
            our_methods: methods.clone(),
            other_device_id: other_device_id.clone(),
        };

        let content = VerificationContent::Ready(ReadyContent {
            from_device: self.account.device_id.clone(),
            methods,
            relation: self.flow_id.relation(),
        });

        ObservableWriteGuard::set(&mut state, new_state.clone());
        drop(state);

        self.send(&[other_device_id], content);
        self.notify(new_state);

        true
    }

    /// Accept the verification request.
    ///
    /// This method will accept the request and signal that it supports the
    /// `m.sas.v1` method.
    pub fn accept(&self) -> bool {
        self.accept_with_methods(SUPPORTED_METHODS.to_vec())
    }

    /// Cancel the verification request
    pub fn cancel(&self) {
        self.cancel_with_code(CancelCode::User)
    }

    /// Cancel the verification request with the given code.
    ///
    /// Does nothing if the request already finished.
    pub fn cancel_with_code(&self, code: CancelCode) {
        let mut state = self.state.write();

        if matches!(*state, VerificationRequestState::Done | VerificationRequestState::Cancelled(_))
        {
            return;
        }

        let recipients = match state.other_device_id() {
            Some(device_id) => vec![device_id.to_owned()],
            None => self.recipient_devices.to_vec(),
        };

        let info = CancelInfo::new(true, code);
        let content = info.as_content(&self.flow_id);
        let new_state = VerificationRequestState::Cancelled(info);

        ObservableWriteGuard::set(&mut state, new_state.clone());
        drop(state);

        debug!(flow_id = self.flow_id.as_str(), "Cancelled a verification request");

        self.send(&recipients, content);
        self.notify(new_state);
    }

    pub(crate) fn receive_ready(&self, sender: &UserId, content: &ReadyContent) {
        if sender != self.other_user() {
            return;
        }

        let mut state = self.state.write();

        let VerificationRequestState::Created { our_methods } = &*state else {
            trace!(flow_id = self.flow_id.as_str(), "Ignoring a ready for a request that moved on");
            return;
        };

        let new_state = VerificationRequestState::Ready {
            their_methods: content.methods.clone(),
            our_methods: our_methods.clone(),
            other_device_id: content.from_device.clone(),
        };

        ObservableWriteGuard::set(&mut state, new_state.clone());
        drop(state);

        self.cancel_for_other_devices(&content.from_device);
        self.notify(new_state);
    }

    /// Let the other devices we sent the request to know that another device
    /// accepted it.
    fn cancel_for_other_devices(&self, accepting_device: &DeviceId) {
        if self.room_id().is_some() {
            return;
        }

        let recipients: Vec<_> = self
            .recipient_devices
            .iter()
            .filter(|d| d.as_str() != accepting_device.as_str())
            .cloned()
            .collect();

        if recipients.is_empty() {
            return;
        }

        let content = CancelInfo::new(true, CancelCode::Accepted).as_content(&self.flow_id);
        self.send(&recipients, content);
    }

    pub(crate) fn receive_cancel(&self, sender: &UserId, content: &CancelContent) {
        if sender != self.other_user() {
            return;
        }

        trace!(
            ?sender,
            code = content.code.as_str(),
            "Cancelling a verification request, other user has cancelled"
        );

        self.set_terminal(VerificationRequestState::Cancelled(CancelInfo::from_content(content)));
    }

    pub(crate) fn receive_done(&self, sender: &UserId) {
        if sender != self.other_user() {
            return;
        }

        let is_active = matches!(
            *self.state.read(),
            VerificationRequestState::Ready { .. } | VerificationRequestState::Transitioned { .. }
        );

        if is_active {
            trace!(flow_id = self.flow_id.as_str(), "Marking a verification request as done");
            self.set_terminal(VerificationRequestState::Done);
        }
    }

    /// A SAS flow was started for this request.
    pub(crate) fn mark_as_transitioned(&self) {
        let mut state = self.state.write();

        let VerificationRequestState::Ready { other_device_id, .. } = &*state else {
            return;
        };

        let new_state =
            VerificationRequestState::Transitioned { other_device_id: other_device_id.clone() };

        ObservableWriteGuard::set(&mut state, new_state.clone());
        drop(state);

        self.notify(new_state);
    }

    /// Mirror the outcome of the SAS flow that was started for this request.
    pub(crate) fn finish_with_sas(&self, sas_state: &SasState) {
        match sas_state {
            SasState::Verified => self.set_terminal(VerificationRequestState::Done),
            SasState::Cancelled(info) | SasState::OnCancelled(info) => {
                self.set_terminal(VerificationRequestState::Cancelled(info.clone()))
            }
            _ => {}
        }
    }

    fn set_terminal(&self, new_state: VerificationRequestState) {
        let mut state = self.state.write();

        if matches!(*state, VerificationRequestState::Done | VerificationRequestState::Cancelled(_))
        {
            return;
        }

        ObservableWriteGuard::set(&mut state, new_state.clone());
        drop(state);

        self.notify(new_state);
    }

    fn send(&self, recipients: &[OwnedDeviceId], content: VerificationContent) {
        self.cache.queue_up_content(&self.other_user_id, recipients, &self.flow_id, content);
    }

    fn notify(&self, state: VerificationRequestState) {
        self.cache.emit(VerificationEvent::VerificationRequestUpdated {
            flow_id: (*self.flow_id).clone(),
            other_user_id: self.other_user_id.clone(),
            state,
        });
    }
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_matches;
    use ruma::{
        device_id, owned_device_id, owned_transaction_id, to_device::DeviceIdOrAllDevices, user_id,
    };

    use super::{VerificationRequest, VerificationRequestState};
    use crate::{
        olm::Account,
        requests::OutgoingRequests,
        types::events::{CancelCode, ReadyContent, VerificationMethod},
        verification::{CancelInfo, FlowId, SasState, VerificationCache, VerificationEvent},
    };

    fn flow_id() -> FlowId {
        FlowId::ToDevice(owned_transaction_id!("request"))
    }

    fn alice() -> Account {
        Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"))
    }

    fn outgoing_request(cache: &VerificationCache) -> VerificationRequest {
        VerificationRequest::new(
            alice().static_data().clone(),
            cache.clone(),
            flow_id(),
            user_id!("@bob:localhost"),
            vec![owned_device_id!("BOBDEVICE"), owned_device_id!("BOBPHONE")],
            None,
        )
    }

    #[test]
    fn accepting_an_incoming_request() {
        let cache = VerificationCache::new();
        let request = VerificationRequest::from_request(
            alice().static_data().clone(),
            cache.clone(),
            flow_id(),
            user_id!("@bob:localhost"),
            owned_device_id!("BOBDEVICE"),
            vec![VerificationMethod::SasV1],
        );

        assert!(!request.we_started());
        assert_eq!(request.other_device_id().as_deref(), Some(device_id!("BOBDEVICE")));

        let mut events = cache.subscribe();

        assert!(request.accept());
        assert!(request.is_ready());
        assert_eq!(request.our_supported_methods(), Some(vec![VerificationMethod::SasV1]));

        // Accepting twice is a no-op.
        assert!(!request.accept());

        let requests = cache.outgoing_requests();
        assert_eq!(requests.len(), 1);
        assert_matches!(requests[0].request(), OutgoingRequests::ToDeviceRequest(ready));
        assert_eq!(ready.event_type, "m.key.verification.ready");

        assert_matches!(
            events.try_recv(),
            Ok(VerificationEvent::VerificationRequestUpdated {
                state: VerificationRequestState::Ready { .. },
                ..
            })
        );
    }

    #[test]
    fn ready_cancels_the_request_on_other_devices() {
        let cache = VerificationCache::new();
        let request = outgoing_request(&cache);

        request.receive_ready(
            user_id!("@bob:localhost"),
            &ReadyContent {
                from_device: owned_device_id!("BOBDEVICE"),
                methods: vec![VerificationMethod::SasV1],
                relation: flow_id().relation(),
            },
        );

        assert!(request.is_ready());
        assert_eq!(request.their_supported_methods(), Some(vec![VerificationMethod::SasV1]));

        let requests = cache.outgoing_requests();
        assert_eq!(requests.len(), 1);
        assert_matches!(requests[0].request(), OutgoingRequests::ToDeviceRequest(cancel));
        assert_eq!(cancel.event_type, "m.key.verification.cancel");
        let devices = &cancel.messages[user_id!("@bob:localhost")];
        assert_eq!(devices.len(), 1);
        assert!(devices.contains_key(&DeviceIdOrAllDevices::DeviceId(owned_device_id!("BOBPHONE"))));
    }

    #[test]
    fn ready_from_another_user_is_ignored() {
        let cache = VerificationCache::new();
        let request = outgoing_request(&cache);

        request.receive_ready(
            user_id!("@mallory:localhost"),
            &ReadyContent {
                from_device: owned_device_id!("MALLORYDEVICE"),
                methods: vec![VerificationMethod::SasV1],
                relation: flow_id().relation(),
            },
        );

        assert_matches!(request.state(), VerificationRequestState::Created { .. });
    }

    #[test]
    fn cancelling_is_terminal() {
        let cache = VerificationCache::new();
        let request = outgoing_request(&cache);

        request.cancel();
        let info = request.cancel_info().unwrap();
        assert_eq!(info.cancel_code(), &CancelCode::User);
        assert_eq!(cache.outgoing_requests().len(), 1);

        request.cancel();
        request.finish_with_sas(&SasState::Verified);
        assert!(request.is_cancelled());
        assert_eq!(cache.outgoing_requests().len(), 1);
    }

    #[test]
    fn sas_outcome_finishes_the_request() {
        let cache = VerificationCache::new();
        let request = outgoing_request(&cache);

        request.receive_ready(
            user_id!("@bob:localhost"),
            &ReadyContent {
                from_device: owned_device_id!("BOBDEVICE"),
                methods: vec![VerificationMethod::SasV1],
                relation: flow_id().relation(),
            },
        );
        request.mark_as_transitioned();
        assert_matches!(request.state(), VerificationRequestState::Transitioned { .. });

        request.finish_with_sas(&SasState::OnCancelled(CancelInfo::new(
            false,
            CancelCode::MismatchedSas,
        )));

        assert_eq!(request.cancel_info().unwrap().cancel_code(), &CancelCode::MismatchedSas);
    }
}
