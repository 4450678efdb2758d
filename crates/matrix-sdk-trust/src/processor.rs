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

//! Draining the outgoing requests of a [`TrustMachine`] to the network.

use std::{collections::BTreeSet, fmt, sync::Arc};

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use tracing::{debug, instrument, trace, warn};

use crate::{
    error::TransportError,
    machine::TrustMachine,
    requests::{AnyIncomingResponse, OutgoingRequest, OutgoingRequests},
    store::Result as StoreResult,
};

/// The network boundary, sends out the requests of the machine.
///
/// Implementations are expected to serialize the request, send it to the
/// homeserver and return the parsed response. To-device contents are handed
/// over as they are, wrapping them for the recipient device is up to the
/// implementation.
#[async_trait]
pub trait RequestSender: Send + Sync {
    /// Send the given request, returning the response of the server.
    async fn send(&self, request: &OutgoingRequest) -> Result<AnyIncomingResponse, TransportError>;
}

/// The kinds of requests a [`TrustMachine`] sends out.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RequestKind {
    /// See [`OutgoingRequests::KeysUpload`].
    KeysUpload,
    /// See [`OutgoingRequests::KeysQuery`].
    KeysQuery,
    /// See [`OutgoingRequests::ToDeviceRequest`].
    ToDevice,
    /// See [`OutgoingRequests::KeysClaim`].
    KeysClaim,
    /// See [`OutgoingRequests::RoomMessage`].
    RoomMessage,
    /// See [`OutgoingRequests::SignatureUpload`].
    SignatureUpload,
}

impl From<&OutgoingRequests> for RequestKind {
    fn from(request: &OutgoingRequests) -> Self {
        match request {
            OutgoingRequests::KeysUpload(_) => RequestKind::KeysUpload,
            OutgoingRequests::KeysQuery(_) => RequestKind::KeysQuery,
            OutgoingRequests::ToDeviceRequest(_) => RequestKind::ToDevice,
            OutgoingRequests::KeysClaim(_) => RequestKind::KeysClaim,
            OutgoingRequests::RoomMessage(_) => RequestKind::RoomMessage,
            OutgoingRequests::SignatureUpload(_) => RequestKind::SignatureUpload,
        }
    }
}

/// Selects which of the outgoing requests a drain pass sends out.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum RequestFilter {
    /// Send out every request.
    #[default]
    All,
    /// Only send out requests of the given kinds.
    Only(BTreeSet<RequestKind>),
}

impl RequestFilter {
    /// Only send out requests of the given kinds.
    pub fn only(kinds: impl IntoIterator<Item = RequestKind>) -> Self {
        Self::Only(kinds.into_iter().collect())
    }

    /// Should the given request be sent out.
    pub fn matches(&self, request: &OutgoingRequest) -> bool {
        match self {
            RequestFilter::All => true,
            RequestFilter::Only(kinds) => kinds.contains(&RequestKind::from(request.request())),
        }
    }
}

/// Sends out the pending requests of a [`TrustMachine`] and feeds the
/// responses back into it.
///
/// Only one drain pass runs at a time per session, even if several processors
/// share a machine. The requests of a pass are sent out concurrently.
#[derive(Clone)]
pub struct OutgoingRequestProcessor {
    machine: TrustMachine,
    sender: Arc<dyn RequestSender>,
}

impl fmt::Debug for OutgoingRequestProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutgoingRequestProcessor")
            .field("machine", &self.machine)
            .finish_non_exhaustive()
    }
}

impl OutgoingRequestProcessor {
    /// Create a new processor for the given machine.
    pub fn new(machine: TrustMachine, sender: Arc<dyn RequestSender>) -> Self {
        Self { machine, sender }
    }

    /// The machine whose requests this processor sends out.
    pub fn machine(&self) -> &TrustMachine {
        &self.machine
    }

    /// Send out all the pending requests that match the filter.
    ///
    /// Returns `true` if every request was delivered and its response
    /// handled. Requests that failed stay pending and will be part of the
    /// next pass.
    #[instrument(skip_all)]
    pub async fn process_outgoing_requests(&self, filter: &RequestFilter) -> StoreResult<bool> {
        let _guard = self.machine.drain_gate().lock().await;

        let requests: Vec<_> = self
            .machine
            .outgoing_requests()
            .await?
            .into_iter()
            .filter(|r| filter.matches(r))
            .collect();

        if requests.is_empty() {
            trace!("No outgoing requests to send out");
            return Ok(true);
        }

        debug!(count = requests.len(), "Sending out outgoing requests");

        let max_concurrent_requests = self.machine.settings().max_concurrent_requests.max(1);

        let results: Vec<bool> = stream::iter(requests)
            .map(|r| self.send_outgoing_request(r))
            .buffer_unordered(max_concurrent_requests)
            .collect()
            .await;

        Ok(results.into_iter().all(|sent| sent))
    }

    async fn send_outgoing_request(&self, request: OutgoingRequest) -> bool {
        let response = match self.sender.send(&request).await {
            Ok(response) => response,
            Err(error) => {
                warn!(
                    request_id = ?request.request_id(),
                    ?error,
                    "Error when sending out an outgoing E2EE request"
                );
                return false;
            }
        };

        let request_id = request.request_id();

        match self.machine.mark_request_as_sent(request_id, response.as_incoming_response()).await {
            Ok(()) => true,
            Err(error) => {
                warn!(
                    ?request_id,
                    ?error,
                    "Couldn't handle the response of an outgoing E2EE request"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeMap,
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use assert_matches2::assert_matches;
    use async_trait::async_trait;
    use ruma::{device_id, event_id, room_id, user_id, MilliSecondsSinceUnixEpoch};
    use serde_json::json;

    use super::{OutgoingRequestProcessor, RequestFilter, RequestKind, RequestSender};
    use crate::{
        error::{MegolmError, TransportError},
        gossiping::{
            IncomingRequestState, KeyReplyResult, OutgoingRequestState, RejectionReason,
        },
        identities::UserTrustResult,
        machine::TrustMachine,
        requests::{
            AnyIncomingResponse, KeysQueryResponse, KeysUploadResponse, OutgoingRequest,
            OutgoingRequests,
        },
        settings::TrustMachineSettings,
        store::MemoryStore,
        testing::{FakeHomeserver, HomeserverClient},
        types::events::{
            EncryptedRoomEvent, RoomEncryptedContent, VerificationMethod, WithheldCode,
        },
        verification::SasState,
    };

    /// A sender that counts the requests and how many of them run at once.
    #[derive(Default)]
    struct CountingSender {
        sent: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        fail: AtomicBool,
    }

    #[async_trait]
    impl RequestSender for CountingSender {
        async fn send(
            &self,
            request: &OutgoingRequest,
        ) -> Result<AnyIncomingResponse, TransportError> {
            let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);

            tokio::time::sleep(Duration::from_millis(5)).await;

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.sent.fetch_add(1, Ordering::SeqCst);

            if self.fail.load(Ordering::SeqCst) {
                return Err(TransportError::new("the homeserver is unreachable"));
            }

            Ok(match request.request() {
                OutgoingRequests::KeysUpload(upload) => {
                    AnyIncomingResponse::KeysUpload(KeysUploadResponse {
                        one_time_key_counts: BTreeMap::from([(
                            "signed_curve25519".to_owned(),
                            upload.one_time_keys.len() as u64,
                        )]),
                    })
                }
                OutgoingRequests::KeysQuery(query) => {
                    AnyIncomingResponse::KeysQuery(KeysQueryResponse {
                        device_keys: query
                            .device_keys
                            .keys()
                            .map(|user_id| (user_id.clone(), BTreeMap::new()))
                            .collect(),
                        ..Default::default()
                    })
                }
                OutgoingRequests::KeysClaim(_) => {
                    AnyIncomingResponse::KeysClaim(Default::default())
                }
                OutgoingRequests::SignatureUpload(_) => {
                    AnyIncomingResponse::SignatureUpload(Default::default())
                }
                _ => AnyIncomingResponse::ToDevice,
            })
        }
    }

    fn alice_machine() -> TrustMachine {
        TrustMachine::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"))
    }

    /// Send out the requests of the machine and receive its sync.
    async fn exchange(machine: &TrustMachine, client: &HomeserverClient) {
        let processor = OutgoingRequestProcessor::new(machine.clone(), Arc::new(client.clone()));
        assert!(processor.process_outgoing_requests(&RequestFilter::All).await.unwrap());
        client.sync(machine).await;
    }

    /// Run a few rounds of request and sync exchanges between two machines.
    async fn settle(
        first: (&TrustMachine, &HomeserverClient),
        second: (&TrustMachine, &HomeserverClient),
    ) {
        for _ in 0..8 {
            exchange(first.0, first.1).await;
            exchange(second.0, second.1).await;
        }
    }

    fn encrypted_event(sender: &TrustMachine, content: RoomEncryptedContent) -> EncryptedRoomEvent {
        EncryptedRoomEvent {
            sender: sender.user_id().to_owned(),
            event_id: event_id!("$secret").to_owned(),
            room_id: room_id!("!test:localhost").to_owned(),
            origin_server_ts: MilliSecondsSinceUnixEpoch::now(),
            content,
        }
    }

    #[tokio::test]
    async fn failed_requests_stay_pending() {
        let machine = alice_machine();
        let sender = Arc::new(CountingSender::default());
        sender.fail.store(true, Ordering::SeqCst);

        let processor = OutgoingRequestProcessor::new(machine.clone(), sender.clone());
        assert!(!processor.process_outgoing_requests(&RequestFilter::All).await.unwrap());
        assert_eq!(sender.sent.load(Ordering::SeqCst), 2);

        sender.fail.store(false, Ordering::SeqCst);
        assert!(processor.process_outgoing_requests(&RequestFilter::All).await.unwrap());
        assert_eq!(sender.sent.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn filtered_requests_are_left_alone() {
        let machine = alice_machine();
        let sender = Arc::new(CountingSender::default());
        let processor = OutgoingRequestProcessor::new(machine.clone(), sender.clone());

        let filter = RequestFilter::only([RequestKind::KeysQuery]);
        assert!(processor.process_outgoing_requests(&filter).await.unwrap());
        assert_eq!(sender.sent.load(Ordering::SeqCst), 1);

        let pending = machine.outgoing_requests().await.unwrap();
        assert!(pending.iter().any(|r| RequestKind::from(r.request()) == RequestKind::KeysUpload));
    }

    #[tokio::test]
    async fn drain_passes_are_serialized_and_bounded() {
        let settings = TrustMachineSettings { max_concurrent_requests: 1, ..Default::default() };
        let machine = TrustMachine::with_store(
            user_id!("@alice:localhost"),
            device_id!("ALICEDEVICE"),
            Arc::new(MemoryStore::new()),
            settings,
        );
        let sender = Arc::new(CountingSender::default());
        let processor = OutgoingRequestProcessor::new(machine, sender.clone());

        let (first, second) = tokio::join!(
            processor.process_outgoing_requests(&RequestFilter::All),
            processor.process_outgoing_requests(&RequestFilter::All),
        );

        assert!(first.unwrap());
        assert!(second.unwrap());
        assert_eq!(sender.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn processors_of_one_machine_share_the_drain_gate() {
        let machine = alice_machine();
        let sender = Arc::new(CountingSender::default());
        let first = OutgoingRequestProcessor::new(machine.clone(), sender.clone());
        let second = OutgoingRequestProcessor::new(machine.clone(), sender.clone());

        let (first, second) = tokio::join!(
            first.process_outgoing_requests(&RequestFilter::All),
            second.process_outgoing_requests(&RequestFilter::All),
        );

        assert!(first.unwrap());
        assert!(second.unwrap());
        // The keys upload and the keys query went out once, the second pass
        // found nothing left to send.
        assert_eq!(sender.sent.load(Ordering::SeqCst), 2);
        assert!(machine.outgoing_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn room_keys_are_gossiped_once_the_device_is_trusted() {
        let server = FakeHomeserver::default();
        let alice = alice_machine();
        let alice_client = server.client(alice.user_id(), alice.device_id());
        let mobile = TrustMachine::new(user_id!("@alice:localhost"), device_id!("MOBILE"));
        let mobile_client = server.client(mobile.user_id(), mobile.device_id());

        // Both devices publish their keys and learn about each other.
        settle((&alice, &alice_client), (&mobile, &mobile_client)).await;
        assert!(mobile.get_device(alice.user_id(), alice.device_id()).await.unwrap().is_some());

        let content = alice
            .encrypt_room_event(
                room_id!("!test:localhost"),
                "m.room.message",
                json!({ "body": "Hi" }),
            )
            .await
            .unwrap();
        let event = encrypted_event(&alice, content);

        assert_matches!(
            mobile.decrypt_room_event(&event).await,
            Err(MegolmError::MissingRoomKey(None))
        );
        mobile.request_room_key_for_event(&event).await.unwrap().unwrap();

        // The mobile device isn't trusted, the key is withheld.
        exchange(&mobile, &mobile_client).await;
        exchange(&alice, &alice_client).await;
        let history = alice.crypto_store().get_incoming_key_requests().await.unwrap();
        assert_eq!(
            history.last().unwrap().state,
            IncomingRequestState::Rejected(RejectionReason::Unverified)
        );

        exchange(&alice, &alice_client).await;
        exchange(&mobile, &mobile_client).await;
        assert_matches!(
            mobile.decrypt_room_event(&event).await,
            Err(MegolmError::MissingRoomKey(Some(WithheldCode::Unauthorised)))
        );
        let request = mobile
            .crypto_store()
            .get_unresolved_key_request(&event.room_id, &event.content.session_id)
            .await
            .unwrap()
            .unwrap();
        assert_matches!(
            &request.replies[0].result,
            KeyReplyResult::Rejected(WithheldCode::Unauthorised)
        );

        // Once the devices verified each other, a new request is answered and
        // the forwarded key is accepted.
        alice.mark_device_as_verified(mobile.user_id(), mobile.device_id()).await.unwrap();
        mobile.mark_device_as_verified(alice.user_id(), alice.device_id()).await.unwrap();
        mobile.re_request_room_key_for_event(&event).await.unwrap();

        settle((&mobile, &mobile_client), (&alice, &alice_client)).await;

        let decrypted = mobile.decrypt_room_event(&event).await.unwrap();
        assert_eq!(decrypted.content["body"], "Hi");
        assert!(decrypted.forwarded);

        assert!(mobile
            .crypto_store()
            .get_unresolved_key_request(&event.room_id, &event.content.session_id)
            .await
            .unwrap()
            .is_none());
        assert!(mobile.crypto_store().get_pending_key_requests().await.unwrap().is_empty());

        let history = alice.crypto_store().get_incoming_key_requests().await.unwrap();
        assert_eq!(history.last().unwrap().state, IncomingRequestState::Accepted);
        assert_eq!(
            request.state,
            OutgoingRequestState::Sent,
            "The first request was sent before it got rejected"
        );

        // The first request was cancelled before the key was asked for again.
        let first_request = mobile
            .crypto_store()
            .get_outgoing_key_request(&request.request_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first_request.state, OutgoingRequestState::Cancelled);
        assert!(first_request
            .replies
            .iter()
            .all(|reply| reply.result == KeyReplyResult::Rejected(WithheldCode::Unauthorised)));
    }

    #[tokio::test]
    async fn sas_verification_makes_devices_and_users_trusted() {
        let server = FakeHomeserver::default();
        let alice = alice_machine();
        let alice_client = server.client(alice.user_id(), alice.device_id());
        let bob = TrustMachine::new(user_id!("@bob:localhost"), device_id!("BOBDEVICE"));
        let bob_client = server.client(bob.user_id(), bob.device_id());

        alice.bootstrap_cross_signing().await.unwrap();
        bob.bootstrap_cross_signing().await.unwrap();
        alice.update_tracked_users([bob.user_id()]).await.unwrap();
        bob.update_tracked_users([alice.user_id()]).await.unwrap();

        settle((&alice, &alice_client), (&bob, &bob_client)).await;

        // Cross-signing is set up, but nobody verified Bob yet.
        assert_eq!(
            alice.compute_user_trust(alice.user_id()).await.unwrap(),
            UserTrustResult::Success
        );
        assert!(!alice.compute_user_trust(bob.user_id()).await.unwrap().is_verified());
        let before = alice.compute_device_trust(bob.user_id(), bob.device_id()).await.unwrap();
        assert!(!before.is_verified());

        let flow_id = alice
            .verification()
            .begin_key_verification(bob.user_id(), bob.device_id(), VerificationMethod::SasV1)
            .await
            .unwrap();

        settle((&alice, &alice_client), (&bob, &bob_client)).await;

        let bob_sas =
            bob.verification().get_existing_transaction(alice.user_id(), flow_id.as_str()).unwrap();
        assert_eq!(bob_sas.state(), SasState::OnStarted);
        bob_sas.accept();

        settle((&bob, &bob_client), (&alice, &alice_client)).await;

        let alice_sas =
            alice.verification().get_existing_transaction(bob.user_id(), flow_id.as_str()).unwrap();
        assert!(alice_sas.can_be_presented());
        assert!(!alice_sas.is_self_verification());
        assert!(alice_sas.emoji_index().is_some());
        assert_eq!(alice_sas.emoji_index(), bob_sas.emoji_index());
        alice_sas.confirm();
        bob_sas.confirm();

        settle((&alice, &alice_client), (&bob, &bob_client)).await;

        assert_eq!(alice_sas.state(), SasState::Verified);
        assert_eq!(bob_sas.state(), SasState::Verified);

        // The verification is stored locally and our signature of Bob's
        // master key got uploaded.
        let after = alice.compute_device_trust(bob.user_id(), bob.device_id()).await.unwrap();
        assert!(after.is_locally_verified());

        alice.receive_device_list_changes([bob.user_id()]).await.unwrap();
        exchange(&alice, &alice_client).await;

        assert_eq!(
            alice.compute_user_trust(bob.user_id()).await.unwrap(),
            UserTrustResult::Success
        );
        let after = alice.compute_device_trust(bob.user_id(), bob.device_id()).await.unwrap();
        assert!(after.is_cross_signing_verified());
        assert!(alice.is_device_trusted_for_display(bob.user_id(), bob.device_id()).await.unwrap());
    }

    #[tokio::test]
    async fn keys_of_other_users_are_never_shared() {
        let server = FakeHomeserver::default();
        let alice = alice_machine();
        let alice_client = server.client(alice.user_id(), alice.device_id());
        let bob = TrustMachine::new(user_id!("@bob:localhost"), device_id!("BOBDEVICE"));
        let bob_client = server.client(bob.user_id(), bob.device_id());

        alice.update_tracked_users([bob.user_id()]).await.unwrap();
        bob.update_tracked_users([alice.user_id()]).await.unwrap();
        settle((&alice, &alice_client), (&bob, &bob_client)).await;

        alice.mark_device_as_verified(bob.user_id(), bob.device_id()).await.unwrap();

        let content = alice
            .encrypt_room_event(room_id!("!test:localhost"), "m.room.message", json!({}))
            .await
            .unwrap();
        let event = encrypted_event(&alice, content);

        bob.request_room_key_for_event(&event).await.unwrap().unwrap();
        settle((&bob, &bob_client), (&alice, &alice_client)).await;

        let history = alice.crypto_store().get_incoming_key_requests().await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].state, IncomingRequestState::Rejected(RejectionReason::NotOwnUser));
        assert_matches!(
            bob.decrypt_room_event(&event).await,
            Err(MegolmError::MissingRoomKey(None))
        );
    }
}
