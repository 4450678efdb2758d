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

use std::{collections::BTreeMap, sync::Arc};

use ruma::{
    to_device::DeviceIdOrAllDevices, OwnedDeviceId, OwnedTransactionId, OwnedUserId,
    TransactionId, UserId,
};
use tokio::sync::broadcast;
use tracing::trace;

use super::{FlowId, VerificationEvent};
use crate::{
    locks::RwLock,
    requests::{OutgoingRequest, RoomMessageRequest, ToDeviceRequest},
    types::events::{RoomVerificationContent, ToDeviceVerificationContent, VerificationContent},
};

/// Ties an outgoing request to the flow that waits for its delivery.
#[derive(Clone, Debug)]
pub(crate) struct RequestInfo {
    pub flow_id: FlowId,
    pub other_user_id: OwnedUserId,
    pub request_id: OwnedTransactionId,
}

#[derive(Debug)]
struct Inner {
    outgoing_requests: RwLock<BTreeMap<OwnedTransactionId, OutgoingRequest>>,
    flow_ids_waiting_for_response: RwLock<BTreeMap<OwnedTransactionId, RequestInfo>>,
    events: broadcast::Sender<VerificationEvent>,
}

/// The queue of messages the verification flows want to send out, shared
/// between the flows and the registry.
#[derive(Clone, Debug)]
pub(crate) struct VerificationCache {
    inner: Arc<Inner>,
}

impl VerificationCache {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                outgoing_requests: Default::default(),
                flow_ids_waiting_for_response: Default::default(),
                events: broadcast::Sender::new(10),
            }),
        }
    }

    pub fn outgoing_requests(&self) -> Vec<OutgoingRequest> {
        self.inner.outgoing_requests.read().values().cloned().collect()
    }

    pub fn queue_up_request(&self, request: OutgoingRequest) {
        trace!(request_id = ?request.request_id(), "Queueing up a verification request");
        self.inner.outgoing_requests.write().insert(request.request_id.clone(), request);
    }

    /// Queue up a message for the other side of the given flow.
    ///
    /// An empty list of devices sends the message to all devices of the
    /// recipient. In-room flows ignore the devices. Returns the ID of the
    /// queued request.
    pub fn queue_up_content(
        &self,
        recipient: &UserId,
        recipient_devices: &[OwnedDeviceId],
        flow_id: &FlowId,
        content: VerificationContent,
    ) -> OwnedTransactionId {
        let request: OutgoingRequest = match flow_id {
            FlowId::ToDevice(_) => {
                let devices: Vec<DeviceIdOrAllDevices> = if recipient_devices.is_empty() {
                    vec![DeviceIdOrAllDevices::AllDevices]
                } else {
                    recipient_devices.iter().cloned().map(Into::into).collect()
                };

                ToDeviceRequest::for_recipients(
                    recipient,
                    devices,
                    ToDeviceVerificationContent::Other(content),
                    TransactionId::new(),
                )
                .into()
            }
            FlowId::InRoom(room_id, _) => RoomMessageRequest {
                room_id: room_id.clone(),
                txn_id: TransactionId::new(),
                content: RoomVerificationContent::Other(content),
            }
            .into(),
        };

        let request_id = request.request_id.clone();
        self.queue_up_request(request);

        request_id
    }

    pub fn add_request_info(&self, info: RequestInfo) {
        self.inner.flow_ids_waiting_for_response.write().insert(info.request_id.clone(), info);
    }

    /// Remove a delivered request, returns the flow waiting for it, if any.
    pub fn mark_request_as_sent(&self, request_id: &TransactionId) -> Option<RequestInfo> {
        self.inner.outgoing_requests.write().remove(request_id);
        self.inner.flow_ids_waiting_for_response.write().remove(request_id)
    }

    /// Drop the queued messages of a flow that went away.
    pub fn remove_flow(&self, flow_id: &FlowId) {
        self.inner.flow_ids_waiting_for_response.write().retain(|_, info| &info.flow_id != flow_id);
    }

    pub fn emit(&self, event: VerificationEvent) {
        // Nobody listening is fine.
        let _ = self.inner.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VerificationEvent> {
        self.inner.events.subscribe()
    }
}
