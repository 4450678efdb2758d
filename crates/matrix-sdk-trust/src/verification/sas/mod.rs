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

mod helpers;
mod state;

use std::{fmt, sync::Arc};

use eyeball::SharedObservable;
use futures_core::Stream;
pub(crate) use helpers::SasIds;
use helpers::{
    calculate_commitment, get_decimal, get_emoji, get_emoji_index, get_mac_content,
    receive_mac_event,
};
use ruma::{DeviceId, OwnedTransactionId, RoomId, TransactionId, UserId};
pub use state::SasState;
use tracing::{debug, trace, warn};
use vodozemac::{sas::EstablishedSas, Curve25519PublicKey};

use super::{
    cache::RequestInfo, CancelInfo, Emoji, FlowId, VerificationCache, VerificationEvent,
    VerificationResult,
};
use crate::{
    identities::{CrossSigningIdentity, Device},
    locks::Mutex,
    types::events::{
        AcceptContent, CancelCode, DoneContent, KeyContent, MacContent,
        ShortAuthenticationString, StartContent, VerificationContent, VerificationMethod,
        HASH_SHA256, KEY_AGREEMENT_V1, MAC_HKDF_HMAC_SHA256_V2,
    },
};

fn supported_short_auth_strings() -> Vec<ShortAuthenticationString> {
    vec![ShortAuthenticationString::Decimal, ShortAuthenticationString::Emoji]
}

/// The cryptographic material and negotiated parameters of a flow.
#[derive(Default)]
struct InnerSas {
    /// Our ephemeral key pair, consumed once the key of the other side
    /// arrives.
    ephemeral: Option<vodozemac::sas::Sas>,
    established: Option<EstablishedSas>,
    /// The start content the commitment is calculated over.
    start_content: Option<StartContent>,
    /// The commitment of the other side, only known if we started.
    commitment: Option<String>,
    accepted_short_auth_strings: Vec<ShortAuthenticationString>,
    /// A MAC of the other side that arrived before we sent ours.
    pending_mac: Option<MacContent>,
    /// The request whose delivery moves us out of the current `Sending*`
    /// state.
    pending_request: Option<OwnedTransactionId>,
    verified: Option<(Vec<Device>, Vec<CrossSigningIdentity>)>,
}

/// Short authentication string object, a single interactive verification
/// flow between two devices.
///
/// Messages the flow needs to send are queued up in the
/// [`VerificationRegistry`](super::VerificationRegistry), every change of
/// the [`SasState`] is announced as a
/// [`VerificationEvent::TransactionUpdated`].
#[derive(Clone)]
pub struct Sas {
    inner: Arc<Mutex<InnerSas>>,
    state: SharedObservable<SasState>,
    ids: Arc<SasIds>,
    flow_id: Arc<FlowId>,
    we_started: bool,
    cache: VerificationCache,
}

impl fmt::Debug for Sas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sas")
            .field("flow_id", &self.flow_id)
            .field("other_user_id", &self.other_user_id())
            .field("other_device_id", &self.other_device_id())
            .field("we_started", &self.we_started)
            .field("state", &self.state.get())
            .finish_non_exhaustive()
    }
}

impl Sas {
    pub(crate) fn new(
        ids: SasIds,
        flow_id: FlowId,
        we_started: bool,
        cache: VerificationCache,
    ) -> Self {
        let inner =
            InnerSas { ephemeral: Some(vodozemac::sas::Sas::new()), ..Default::default() };

        Self {
            inner: Arc::new(Mutex::new(inner)),
            state: SharedObservable::new(SasState::None),
            ids: Arc::new(ids),
            flow_id: Arc::new(flow_id),
            we_started,
            cache,
        }
    }

    /// Our own user id.
    pub fn user_id(&self) -> &UserId {
        &self.ids.account.user_id
    }

    /// Our own device ID.
    pub fn device_id(&self) -> &DeviceId {
        &self.ids.account.device_id
    }

    /// Get the user id of the other side.
    pub fn other_user_id(&self) -> &UserId {
        self.ids.other_device.user_id()
    }

    /// Get the device ID of the other side.
    pub fn other_device_id(&self) -> &DeviceId {
        self.ids.other_device.device_id()
    }

    /// Get the device of the other user.
    pub fn other_device(&self) -> &Device {
        &self.ids.other_device
    }

    /// Get the unique ID that identifies this SAS verification flow.
    pub fn flow_id(&self) -> &FlowId {
        &self.flow_id
    }

    /// Get the room id if the verification is happening inside a room.
    pub fn room_id(&self) -> Option<&RoomId> {
        self.flow_id.room_id()
    }

    /// Did we initiate the verification flow.
    pub fn we_started(&self) -> bool {
        self.we_started
    }

    /// Is this a verification that is verifying one of our own devices.
    pub fn is_self_verification(&self) -> bool {
        self.user_id() == self.other_user_id()
    }

    /// Does this verification flow support displaying emoji for the short
    /// authentication string.
    pub fn supports_emoji(&self) -> bool {
        self.inner.lock().accepted_short_auth_strings.contains(&ShortAuthenticationString::Emoji)
    }

    /// Get the current state of the verification process.
    pub fn state(&self) -> SasState {
        self.state.get()
    }

    /// Listen for changes in the SAS verification process.
    ///
    /// The stream starts with the changes after the call, the current state
    /// can be fetched with [`Sas::state`].
    pub fn changes(&self) -> impl Stream<Item = SasState> + use<> {
        self.state.subscribe()
    }

    /// Is the SAS flow done.
    pub fn is_done(&self) -> bool {
        self.state() == SasState::Verified
    }

    /// Is the SAS flow canceled.
    pub fn is_cancelled(&self) -> bool {
        self.state().is_cancelled()
    }

    /// Did the flow reach a state it can't leave anymore.
    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Get info about the cancellation if the verification flow has been
    /// cancelled.
    pub fn cancel_info(&self) -> Option<CancelInfo> {
        self.state().cancel_info().cloned()
    }

    /// Are we in a state where we can show the short auth string.
    pub fn can_be_presented(&self) -> bool {
        self.state().shows_short_code()
    }

    /// Get the emoji version of the short auth string.
    ///
    /// Returns None if we can't yet present the short auth string, otherwise
    /// seven tuples containing the emoji and description.
    pub fn emoji(&self) -> Option<[Emoji; 7]> {
        let inner = self.inner.lock();

        if !inner.accepted_short_auth_strings.contains(&ShortAuthenticationString::Emoji) {
            return None;
        }

        self.established(&inner)
            .map(|sas| get_emoji(sas, &self.ids, self.flow_id.as_str(), self.we_started))
    }

    /// Get the index of the emoji representing the short auth string
    ///
    /// Returns None if we can't yet present the short auth string, otherwise
    /// seven u8 numbers in the range from 0 to 63 inclusive.
    pub fn emoji_index(&self) -> Option<[u8; 7]> {
        let inner = self.inner.lock();

        if !inner.accepted_short_auth_strings.contains(&ShortAuthenticationString::Emoji) {
            return None;
        }

        self.established(&inner)
            .map(|sas| get_emoji_index(sas, &self.ids, self.flow_id.as_str(), self.we_started))
    }

    /// Get the decimal version of the short auth string.
    ///
    /// Returns None if we can't yet present the short auth string, otherwise a
    /// tuple containing three 4-digit integers that represent the short auth
    /// string.
    pub fn decimals(&self) -> Option<(u16, u16, u16)> {
        let inner = self.inner.lock();

        self.established(&inner)
            .map(|sas| get_decimal(sas, &self.ids, self.flow_id.as_str(), self.we_started))
    }

    fn established<'a>(&self, inner: &'a InnerSas) -> Option<&'a EstablishedSas> {
        inner.established.as_ref().filter(|_| self.state.get().shows_short_code())
    }

    /// Send out the start message of a flow we initiated.
    pub(crate) fn start(&self) {
        let mut inner = self.inner.lock();

        if !self.we_started || self.state.get() != SasState::None {
            return;
        }

        let Some(ephemeral) = &inner.ephemeral else {
            return;
        };

        trace!(flow_id = self.flow_id.as_str(), ?ephemeral, "Starting a SAS verification");

        let content = StartContent {
            from_device: self.ids.account.device_id.clone(),
            method: VerificationMethod::SasV1,
            key_agreement_protocols: vec![KEY_AGREEMENT_V1.to_owned()],
            hashes: vec![HASH_SHA256.to_owned()],
            message_authentication_codes: vec![MAC_HKDF_HMAC_SHA256_V2.to_owned()],
            short_authentication_string: supported_short_auth_strings(),
            relation: self.flow_id.relation(),
        };

        inner.start_content = Some(content.clone());
        self.transition(&mut inner, SasState::SendingStart, Some(VerificationContent::Start(content)));
    }

    /// Handle the start message of a flow the other side initiated.
    pub(crate) fn receive_start(&self, content: &StartContent) {
        let mut inner = self.inner.lock();

        if self.we_started || self.state.get() != SasState::None {
            return;
        }

        inner.start_content = Some(content.clone());
        self.transition(&mut inner, SasState::OnStarted, None);

        let supported = content.method == VerificationMethod::SasV1
            && content.key_agreement_protocols.iter().any(|p| p == KEY_AGREEMENT_V1)
            && content.hashes.iter().any(|h| h == HASH_SHA256)
            && content.message_authentication_codes.iter().any(|m| m == MAC_HKDF_HMAC_SHA256_V2)
            && content.short_authentication_string.contains(&ShortAuthenticationString::Decimal);

        if !supported {
            warn!(
                flow_id = self.flow_id.as_str(),
                method = %content.method,
                "The other side started a verification we don't support",
            );
            self.cancel_locked(&mut inner, CancelCode::UnknownMethod);
        }
    }

    /// Accept the SAS verification.
    ///
    /// This does nothing if the verification was already accepted, otherwise
    /// an accept message is queued up.
    pub fn accept(&self) {
        let mut inner = self.inner.lock();

        if self.state.get() != SasState::OnStarted {
            return;
        }

        let (Some(ephemeral), Some(start_content)) = (&inner.ephemeral, &inner.start_content)
        else {
            return;
        };

        let commitment = match calculate_commitment(ephemeral.public_key(), start_content) {
            Ok(commitment) => commitment,
            Err(error) => {
                warn!(?error, "Couldn't calculate the commitment for the start message");
                self.cancel_locked(&mut inner, CancelCode::InvalidMessage);
                return;
            }
        };

        let accepted: Vec<_> = start_content
            .short_authentication_string
            .iter()
            .filter(|s| supported_short_auth_strings().contains(s))
            .cloned()
            .collect();

        let content = AcceptContent {
            method: VerificationMethod::SasV1,
            key_agreement_protocol: KEY_AGREEMENT_V1.to_owned(),
            hash: HASH_SHA256.to_owned(),
            message_authentication_code: MAC_HKDF_HMAC_SHA256_V2.to_owned(),
            short_authentication_string: accepted.clone(),
            commitment,
            relation: self.flow_id.relation(),
        };

        inner.accepted_short_auth_strings = accepted;
        self.transition(&mut inner, SasState::SendingAccept, Some(VerificationContent::Accept(content)));
    }

    /// Confirm the Sas verification.
    ///
    /// This confirms that the short auth strings match on both sides, our MAC
    /// is queued up.
    pub fn confirm(&self) {
        let mut inner = self.inner.lock();

        if self.state.get() != SasState::ShortCodeReady {
            return;
        }

        let Some(established) = &inner.established else {
            return;
        };

        let content = get_mac_content(established, &self.ids, &self.flow_id);

        self.transition(&mut inner, SasState::ShortCodeAccepted, None);
        self.transition(&mut inner, SasState::SendingMac, Some(VerificationContent::Mac(content)));
    }

    /// Cancel the verification.
    ///
    /// This cancels the verification with the `CancelCode::User`.
    pub fn cancel(&self) {
        self.cancel_with_code(CancelCode::User);
    }

    /// Cancel the verification because the short auth strings didn't match.
    pub fn mismatch(&self) {
        self.cancel_with_code(CancelCode::MismatchedSas);
    }

    /// Cancel the verification with the given `CancelCode`.
    ///
    /// A cancel message is queued up unless the flow already reached a
    /// terminal state, in which case nothing happens.
    pub fn cancel_with_code(&self, code: CancelCode) {
        let mut inner = self.inner.lock();
        self.cancel_locked(&mut inner, code);
    }

    fn cancel_locked(&self, inner: &mut InnerSas, code: CancelCode) {
        if self.state.get().is_terminal() {
            return;
        }

        debug!(flow_id = self.flow_id.as_str(), ?code, "Cancelling the SAS verification");

        let info = CancelInfo::new(true, code);
        let content = info.as_content(&self.flow_id);

        inner.ephemeral = None;
        inner.pending_mac = None;
        self.transition(inner, SasState::Cancelled(info), Some(content));
    }

    /// Handle a verification message of the other side.
    pub(crate) fn receive_content(&self, sender: &UserId, content: &VerificationContent) {
        let mut inner = self.inner.lock();
        let old_state = self.state.get();

        if old_state.is_terminal() {
            trace!(
                flow_id = self.flow_id.as_str(),
                event_type = content.event_type(),
                "Ignoring a message for a finished SAS verification",
            );
            return;
        }

        if sender != self.other_user_id() {
            warn!(?sender, flow_id = self.flow_id.as_str(), "Received a message from the wrong user");
            self.cancel_locked(&mut inner, CancelCode::UserMismatch);
            return;
        }

        match content {
            VerificationContent::Cancel(c) => {
                self.transition(&mut inner, SasState::OnCancelled(CancelInfo::from_content(c)), None)
            }
            VerificationContent::Accept(c) => self.receive_accept(&mut inner, c),
            VerificationContent::Key(c) => self.receive_key(&mut inner, c),
            VerificationContent::Mac(c) => self.receive_mac(&mut inner, c),
            VerificationContent::Start(_)
            | VerificationContent::Ready(_)
            | VerificationContent::Done(_) => {}
        }

        trace!(
            flow_id = self.flow_id.as_str(),
            event_type = content.event_type(),
            ?old_state,
            new_state = ?self.state.get(),
            "SAS received an event and changed its state",
        );
    }

    fn receive_accept(&self, inner: &mut InnerSas, content: &AcceptContent) {
        if !self.we_started
            || !matches!(self.state.get(), SasState::SendingStart | SasState::Started)
        {
            return;
        }

        let supported = supported_short_auth_strings();

        let valid = content.method == VerificationMethod::SasV1
            && content.key_agreement_protocol == KEY_AGREEMENT_V1
            && content.hash == HASH_SHA256
            && content.message_authentication_code == MAC_HKDF_HMAC_SHA256_V2
            && !content.short_authentication_string.is_empty()
            && content.short_authentication_string.iter().all(|s| supported.contains(s));

        if !valid {
            self.cancel_locked(inner, CancelCode::UnknownMethod);
            return;
        }

        inner.commitment = Some(content.commitment.clone());
        inner.accepted_short_auth_strings = content.short_authentication_string.clone();
        // The start message was evidently delivered.
        inner.pending_request = None;

        self.transition(inner, SasState::Accepted, None);

        let Some(ephemeral) = &inner.ephemeral else {
            return;
        };

        let key = KeyContent { key: ephemeral.public_key().to_base64(), relation: self.flow_id.relation() };
        self.transition(inner, SasState::SendingKey, Some(VerificationContent::Key(key)));
    }

    fn receive_key(&self, inner: &mut InnerSas, content: &KeyContent) {
        let state = self.state.get();

        let expected = if self.we_started {
            matches!(state, SasState::SendingKey | SasState::KeySent)
        } else {
            matches!(state, SasState::SendingAccept | SasState::Accepted)
        };

        if !expected {
            return;
        }

        let Ok(their_key) = Curve25519PublicKey::from_base64(&content.key) else {
            self.cancel_locked(inner, CancelCode::InvalidMessage);
            return;
        };

        if self.we_started {
            let (Some(commitment), Some(start_content)) = (&inner.commitment, &inner.start_content)
            else {
                self.cancel_locked(inner, CancelCode::UnexpectedMessage);
                return;
            };

            match calculate_commitment(their_key, start_content) {
                Ok(calculated) if &calculated == commitment => {}
                _ => {
                    warn!(flow_id = self.flow_id.as_str(), "The commitment of the other side didn't match");
                    self.cancel_locked(inner, CancelCode::MismatchedCommitment);
                    return;
                }
            }
        }

        let Some(ephemeral) = inner.ephemeral.take() else {
            return;
        };

        let our_key = ephemeral.public_key();

        match ephemeral.diffie_hellman(their_key) {
            Ok(established) => inner.established = Some(established),
            Err(error) => {
                warn!(?error, "The ephemeral key of the other side isn't usable");
                self.cancel_locked(inner, CancelCode::KeyMismatch);
                return;
            }
        }

        self.transition(inner, SasState::OnKeyReceived, None);

        if self.we_started {
            inner.pending_request = None;
            self.transition(inner, SasState::ShortCodeReady, None);
        } else {
            inner.pending_request = None;
            let key = KeyContent { key: our_key.to_base64(), relation: self.flow_id.relation() };
            self.transition(inner, SasState::SendingKey, Some(VerificationContent::Key(key)));
        }
    }

    fn receive_mac(&self, inner: &mut InnerSas, content: &MacContent) {
        let state = self.state.get();

        if state.buffers_mac() {
            if inner.pending_mac.is_none() {
                inner.pending_mac = Some(content.clone());
            }
        } else if state == SasState::MacSent {
            self.verify_mac(inner, content);
        }
    }

    fn verify_mac(&self, inner: &mut InnerSas, content: &MacContent) {
        let Some(established) = &inner.established else {
            self.cancel_locked(inner, CancelCode::UnexpectedMessage);
            return;
        };

        match receive_mac_event(established, &self.ids, self.flow_id.as_str(), content) {
            Ok(verified) => {
                inner.verified = Some(verified);
                self.transition(inner, SasState::Verifying, None);
            }
            Err(code) => self.cancel_locked(inner, code),
        }
    }

    /// Our request with the given ID reached the server.
    pub(crate) fn mark_request_as_sent(&self, request_id: &TransactionId) {
        let mut inner = self.inner.lock();

        if inner.pending_request.as_deref() != Some(request_id) {
            debug!(
                flow_id = self.flow_id.as_str(),
                ?request_id,
                "Tried to mark a request as sent, but the request ID didn't match",
            );
            return;
        }

        inner.pending_request = None;

        match self.state.get() {
            SasState::SendingStart => self.transition(&mut inner, SasState::Started, None),
            SasState::SendingAccept => self.transition(&mut inner, SasState::Accepted, None),
            SasState::SendingKey => {
                self.transition(&mut inner, SasState::KeySent, None);

                if inner.established.is_some() {
                    self.transition(&mut inner, SasState::ShortCodeReady, None);
                }
            }
            SasState::SendingMac => {
                self.transition(&mut inner, SasState::MacSent, None);

                if let Some(mac) = inner.pending_mac.take() {
                    self.verify_mac(&mut inner, &mac);
                }
            }
            _ => {}
        }
    }

    /// The devices and identities whose keys the other side proved, only
    /// available while we're storing the result.
    pub(crate) fn verified(&self) -> Option<(Vec<Device>, Vec<CrossSigningIdentity>)> {
        let inner = self.inner.lock();
        inner.verified.clone().filter(|_| self.state.get() == SasState::Verifying)
    }

    pub(crate) fn ids(&self) -> &SasIds {
        &self.ids
    }

    /// Finish the flow with the outcome of storing the verified keys.
    pub(crate) fn finish(&self, result: VerificationResult) {
        let mut inner = self.inner.lock();

        if self.state.get() != SasState::Verifying {
            return;
        }

        match result {
            VerificationResult::Ok => {}
            VerificationResult::SignatureUpload(request) => {
                self.cache.queue_up_request(request.into())
            }
            VerificationResult::Cancel(code) => {
                self.cancel_locked(&mut inner, code);
                return;
            }
        }

        let done = DoneContent { relation: self.flow_id.relation() };
        self.transition(&mut inner, SasState::Verified, Some(VerificationContent::Done(done)));
    }

    /// Move to the given state, queue the message of the edge and notify
    /// listeners, in that order.
    fn transition(
        &self,
        inner: &mut InnerSas,
        state: SasState,
        content: Option<VerificationContent>,
    ) {
        self.state.set(state.clone());

        if let Some(content) = content {
            let request_id = self.cache.queue_up_content(
                self.other_user_id(),
                &[self.other_device_id().to_owned()],
                &self.flow_id,
                content,
            );

            if matches!(
                state,
                SasState::SendingStart
                    | SasState::SendingAccept
                    | SasState::SendingKey
                    | SasState::SendingMac
            ) {
                self.cache.add_request_info(RequestInfo {
                    flow_id: (*self.flow_id).clone(),
                    other_user_id: self.other_user_id().to_owned(),
                    request_id: request_id.clone(),
                });
                inner.pending_request = Some(request_id);
            }
        }

        self.cache.emit(VerificationEvent::TransactionUpdated {
            flow_id: (*self.flow_id).clone(),
            other_user_id: self.other_user_id().to_owned(),
            state,
        });
    }
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_matches;
    use ruma::{device_id, owned_transaction_id, user_id, DeviceId, TransactionId, UserId};

    use super::{Sas, SasIds, SasState};
    use crate::{
        identities::{Device, LocalTrust},
        olm::Account,
        requests::OutgoingRequests,
        types::events::{
            AnyToDeviceContent, CancelCode, ToDeviceVerificationContent, VerificationContent,
        },
        verification::{FlowId, VerificationCache},
    };

    struct Side {
        account: Account,
        cache: VerificationCache,
    }

    impl Side {
        fn new(user_id: &UserId, device_id: &DeviceId) -> Self {
            Self {
                account: Account::new(user_id, device_id),
                cache: VerificationCache::new(),
            }
        }

        fn sas(&self, other: &Side, flow_id: &FlowId, we_started: bool) -> Sas {
            let ids = SasIds {
                account: self.account.static_data().clone(),
                other_device: Device::new(other.account.device_keys().unwrap(), LocalTrust::Unset),
                own_identity: None,
                other_identity: None,
            };

            Sas::new(ids, flow_id.clone(), we_started, self.cache.clone())
        }

        /// Take the queued messages, marking them as sent.
        fn flush(&self, sas: &Sas) -> Vec<VerificationContent> {
            let mut contents = Vec::new();

            for request in self.cache.outgoing_requests() {
                self.cache.mark_request_as_sent(request.request_id());
                sas.mark_request_as_sent(request.request_id());

                if let OutgoingRequests::ToDeviceRequest(r) = request.request() {
                    for content in r.messages.values().flat_map(|d| d.values()) {
                        if let AnyToDeviceContent::Verification(ToDeviceVerificationContent::Other(
                            c,
                        )) = content
                        {
                            contents.push(c.clone());
                        }
                    }
                }
            }

            contents
        }
    }

    fn deliver(from: &Side, from_sas: &Sas, to: &Sas) {
        for content in from.flush(from_sas) {
            to.receive_content(from_sas.user_id(), &content);
        }
    }

    fn started_pair() -> (Side, Sas, Side, Sas) {
        let alice = Side::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));
        let bob = Side::new(user_id!("@bob:localhost"), device_id!("BOBDEVICE"));
        let flow_id = FlowId::ToDevice(owned_transaction_id!("flow"));

        let alice_sas = alice.sas(&bob, &flow_id, true);
        alice_sas.start();
        assert_eq!(alice_sas.state(), SasState::SendingStart);

        let bob_sas = bob.sas(&alice, &flow_id, false);
        let start = alice.flush(&alice_sas);
        assert_eq!(alice_sas.state(), SasState::Started);
        assert_matches!(&start[..], [VerificationContent::Start(start)]);
        bob_sas.receive_start(start);
        assert_eq!(bob_sas.state(), SasState::OnStarted);

        (alice, alice_sas, bob, bob_sas)
    }

    #[test]
    fn sas_flow_reaches_verifying_on_both_sides() {
        let (alice, alice_sas, bob, bob_sas) = started_pair();

        bob_sas.accept();
        assert_eq!(bob_sas.state(), SasState::SendingAccept);
        deliver(&bob, &bob_sas, &alice_sas);
        assert_eq!(bob_sas.state(), SasState::Accepted);
        assert_eq!(alice_sas.state(), SasState::SendingKey);

        deliver(&alice, &alice_sas, &bob_sas);
        assert_eq!(alice_sas.state(), SasState::KeySent);
        assert_eq!(bob_sas.state(), SasState::SendingKey);

        deliver(&bob, &bob_sas, &alice_sas);
        assert_eq!(bob_sas.state(), SasState::ShortCodeReady);
        assert_eq!(alice_sas.state(), SasState::ShortCodeReady);

        assert!(alice_sas.supports_emoji());
        assert_eq!(alice_sas.emoji(), bob_sas.emoji());
        assert_eq!(alice_sas.decimals(), bob_sas.decimals());
        assert!(alice_sas.decimals().is_some());

        alice_sas.confirm();
        assert_eq!(alice_sas.state(), SasState::SendingMac);
        deliver(&alice, &alice_sas, &bob_sas);
        assert_eq!(alice_sas.state(), SasState::MacSent);
        // Bob didn't confirm yet, the MAC is kept for later.
        assert_eq!(bob_sas.state(), SasState::ShortCodeReady);

        bob_sas.confirm();
        deliver(&bob, &bob_sas, &alice_sas);
        assert_eq!(bob_sas.state(), SasState::Verifying);
        assert_eq!(alice_sas.state(), SasState::Verifying);

        let (devices, _) = alice_sas.verified().unwrap();
        assert_eq!(devices[0].device_id(), bob_sas.device_id());
    }

    #[test]
    fn cancellation_is_terminal() {
        let (alice, alice_sas, bob, bob_sas) = started_pair();

        bob_sas.cancel();
        assert_matches!(bob_sas.state(), SasState::Cancelled(info));
        assert_eq!(info.cancel_code(), &CancelCode::User);
        assert!(info.cancelled_by_us());

        // Only a single cancel message is sent out.
        bob_sas.cancel_with_code(CancelCode::Timeout);
        bob_sas.accept();
        let messages = bob.flush(&bob_sas);
        assert_matches!(&messages[..], [VerificationContent::Cancel(_)]);

        for content in &messages {
            alice_sas.receive_content(bob_sas.user_id(), content);
        }
        assert_matches!(alice_sas.state(), SasState::OnCancelled(info));
        assert!(!info.cancelled_by_us());

        alice_sas.cancel();
        assert!(alice.flush(&alice_sas).is_empty());
        assert_matches!(alice_sas.state(), SasState::OnCancelled(_));
    }

    #[test]
    fn mismatched_commitment_cancels() {
        let (alice, alice_sas, bob, bob_sas) = started_pair();

        bob_sas.accept();
        let mut messages = bob.flush(&bob_sas);
        assert_matches!(&mut messages[..], [VerificationContent::Accept(accept)]);
        accept.commitment = "not the commitment".to_owned();
        alice_sas.receive_content(bob_sas.user_id(), &messages[0]);

        deliver(&alice, &alice_sas, &bob_sas);
        deliver(&bob, &bob_sas, &alice_sas);

        assert_matches!(alice_sas.state(), SasState::Cancelled(info));
        assert_eq!(info.cancel_code(), &CancelCode::MismatchedCommitment);
    }

    #[test]
    fn messages_from_other_users_cancel() {
        let (_, alice_sas, bob, bob_sas) = started_pair();

        bob_sas.accept();
        for content in bob.flush(&bob_sas) {
            alice_sas.receive_content(user_id!("@mallory:localhost"), &content);
        }

        assert_matches!(alice_sas.state(), SasState::Cancelled(info));
        assert_eq!(info.cancel_code(), &CancelCode::UserMismatch);
    }

    #[test]
    fn unrelated_request_ids_dont_advance_the_flow() {
        let (_, alice_sas, _, _) = started_pair();

        alice_sas.mark_request_as_sent(&TransactionId::new());
        assert_eq!(alice_sas.state(), SasState::Started);
    }
}
