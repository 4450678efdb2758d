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

//! An in-memory homeserver that routes the requests of several
//! [`TrustMachine`]s between each other.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use async_trait::async_trait;
use ruma::{
    server_name, to_device::DeviceIdOrAllDevices, DeviceId, EventId, MilliSecondsSinceUnixEpoch,
    OwnedDeviceId, OwnedUserId, UserId,
};
use serde_json::{json, Value};

use crate::{
    error::TransportError,
    locks::Mutex,
    machine::TrustMachine,
    processor::RequestSender,
    requests::{
        AnyIncomingResponse, KeysClaimRequest, KeysClaimResponse, KeysQueryRequest,
        KeysQueryResponse, KeysUploadRequest, KeysUploadResponse, OutgoingRequest,
        OutgoingRequests, RoomMessageRequest, RoomMessageResponse, SignatureUploadRequest,
        SignatureUploadResponse, ToDeviceRequest,
    },
    types::{
        events::{AnyRoomEvent, AnyToDeviceEvent},
        CrossSigningKey, DeviceKeys, SignedKey, Signatures,
    },
};

#[derive(Debug, Default)]
struct Inbox {
    to_device: Vec<AnyToDeviceEvent>,
    changed_users: BTreeSet<OwnedUserId>,
    room_event_cursor: usize,
}

#[derive(Debug, Default)]
struct ServerState {
    device_keys: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, DeviceKeys>>,
    one_time_keys: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, BTreeMap<String, SignedKey>>>,
    master_keys: BTreeMap<OwnedUserId, CrossSigningKey>,
    self_signing_keys: BTreeMap<OwnedUserId, CrossSigningKey>,
    user_signing_keys: BTreeMap<OwnedUserId, CrossSigningKey>,
    inboxes: BTreeMap<(OwnedUserId, OwnedDeviceId), Inbox>,
    room_events: Vec<Value>,
}

impl ServerState {
    fn notify_key_change(&mut self, user_id: &UserId) {
        for inbox in self.inboxes.values_mut() {
            inbox.changed_users.insert(user_id.to_owned());
        }
    }

    fn keys_upload(
        &mut self,
        user_id: &UserId,
        device_id: &DeviceId,
        request: &KeysUploadRequest,
    ) -> KeysUploadResponse {
        if let Some(device_keys) = &request.device_keys {
            self.device_keys
                .entry(user_id.to_owned())
                .or_default()
                .insert(device_id.to_owned(), device_keys.clone());
            self.notify_key_change(user_id);
        }

        if let Some(keys) = &request.cross_signing_keys {
            self.master_keys.insert(user_id.to_owned(), keys.master_key.as_ref().clone());
            self.self_signing_keys.insert(user_id.to_owned(), keys.self_signing_key.as_ref().clone());
            self.user_signing_keys.insert(user_id.to_owned(), keys.user_signing_key.as_ref().clone());
            self.notify_key_change(user_id);
        }

        let count = {
            let keys = self
                .one_time_keys
                .entry(user_id.to_owned())
                .or_default()
                .entry(device_id.to_owned())
                .or_default();
            keys.extend(request.one_time_keys.clone());
            keys.len() as u64
        };

        KeysUploadResponse {
            one_time_key_counts: BTreeMap::from([("signed_curve25519".to_owned(), count)]),
        }
    }

    fn keys_query(&self, requester: &UserId, request: &KeysQueryRequest) -> KeysQueryResponse {
        let mut response = KeysQueryResponse::default();

        for user_id in request.device_keys.keys() {
            if let Some(devices) = self.device_keys.get(user_id) {
                response.device_keys.insert(user_id.clone(), devices.clone());
            }

            if let Some(key) = self.master_keys.get(user_id) {
                response.master_keys.insert(user_id.clone(), key.clone());
            }

            if let Some(key) = self.self_signing_keys.get(user_id) {
                response.self_signing_keys.insert(user_id.clone(), key.clone());
            }

            if user_id == requester {
                if let Some(key) = self.user_signing_keys.get(user_id) {
                    response.user_signing_keys.insert(user_id.clone(), key.clone());
                }
            }
        }

        response
    }

    fn keys_claim(&mut self, request: &KeysClaimRequest) -> KeysClaimResponse {
        let mut response = KeysClaimResponse::default();

        for (user_id, devices) in &request.one_time_keys {
            for device_id in devices.keys() {
                let key = self
                    .one_time_keys
                    .get_mut(user_id)
                    .and_then(|d| d.get_mut(device_id))
                    .and_then(|keys| keys.pop_first());

                if let Some((key_id, key)) = key {
                    response
                        .one_time_keys
                        .entry(user_id.clone())
                        .or_default()
                        .insert(device_id.clone(), BTreeMap::from([(key_id, key)]));
                }
            }
        }

        response
    }

    fn send_to_device(
        &mut self,
        sender: &UserId,
        sender_device: &DeviceId,
        request: &ToDeviceRequest,
    ) {
        // The contents travel in the clear, the sender key stands in for the
        // one a decrypted Olm envelope would carry.
        let sender_key = self
            .device_keys
            .get(sender)
            .and_then(|devices| devices.get(sender_device))
            .and_then(|keys| keys.curve25519_key());

        for (user_id, messages) in &request.messages {
            for (target, content) in messages {
                let content = serde_json::to_value(content).expect("The content can be serialized");
                let mut event =
                    AnyToDeviceEvent::from_parts(sender.to_owned(), &request.event_type, content)
                        .expect("The to-device event can be parsed");

                if let Some(sender_key) = sender_key {
                    event = event.with_sender_key(sender_key);
                }

                let recipients: Vec<OwnedDeviceId> =
                    if let DeviceIdOrAllDevices::DeviceId(device_id) = target {
                        vec![device_id.clone()]
                    } else {
                        self.device_keys
                            .get(user_id)
                            .map(|devices| devices.keys().cloned().collect())
                            .unwrap_or_default()
                    };

                for device_id in recipients {
                    self.inboxes
                        .entry((user_id.clone(), device_id))
                        .or_default()
                        .to_device
                        .push(event.clone());
                }
            }
        }
    }

    fn send_room_message(
        &mut self,
        sender: &UserId,
        request: &RoomMessageRequest,
    ) -> RoomMessageResponse {
        let event_id = EventId::new(server_name!("localhost"));

        self.room_events.push(json!({
            "sender": sender,
            "event_id": event_id,
            "room_id": request.room_id,
            "origin_server_ts": MilliSecondsSinceUnixEpoch::now(),
            "type": request.event_type(),
            "content": request.content,
        }));

        RoomMessageResponse { event_id }
    }

    fn upload_signatures(&mut self, request: &SignatureUploadRequest) -> SignatureUploadResponse {
        for (user_id, objects) in &request.signed_keys {
            for (key_id, object) in objects {
                let signatures: Signatures =
                    serde_json::from_value(object["signatures"].clone()).unwrap_or_default();

                let device_id: &DeviceId = key_id.as_str().into();

                if let Some(device) =
                    self.device_keys.get_mut(user_id).and_then(|d| d.get_mut(device_id))
                {
                    device.signatures.merge(signatures);
                } else if let Some(master_key) = self.master_keys.get_mut(user_id).filter(|k| {
                    k.get_first_key_and_id().is_some_and(|(_, key)| key.to_base64() == *key_id)
                }) {
                    master_key.signatures.merge(signatures);
                }
            }

            self.notify_key_change(user_id);
        }

        SignatureUploadResponse::default()
    }
}

/// A homeserver that lives in memory.
#[derive(Clone, Debug, Default)]
pub(crate) struct FakeHomeserver {
    state: Arc<Mutex<ServerState>>,
}

impl FakeHomeserver {
    /// Log in with the given device.
    pub fn client(&self, user_id: &UserId, device_id: &DeviceId) -> HomeserverClient {
        self.state.lock().inboxes.entry((user_id.to_owned(), device_id.to_owned())).or_default();

        HomeserverClient {
            server: self.clone(),
            user_id: user_id.to_owned(),
            device_id: device_id.to_owned(),
        }
    }
}

/// A logged in device of the [`FakeHomeserver`].
#[derive(Clone, Debug)]
pub(crate) struct HomeserverClient {
    server: FakeHomeserver,
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
}

impl HomeserverClient {
    /// Receive everything that was sent to this device since the last sync.
    pub async fn sync(&self, machine: &TrustMachine) {
        let (to_device, changed_users, room_events) = {
            let mut state = self.server.state.lock();
            let room_events = state.room_events.clone();

            let inbox =
                state.inboxes.entry((self.user_id.clone(), self.device_id.clone())).or_default();

            let new_room_events: Vec<AnyRoomEvent> = room_events[inbox.room_event_cursor..]
                .iter()
                .map(|e| serde_json::from_value(e.clone()).expect("The room event can be parsed"))
                .collect();
            inbox.room_event_cursor = room_events.len();

            (
                std::mem::take(&mut inbox.to_device),
                std::mem::take(&mut inbox.changed_users).into_iter().collect::<Vec<_>>(),
                new_room_events,
            )
        };

        machine
            .receive_sync_changes(&to_device, &changed_users)
            .await
            .expect("The sync changes can be handled");

        for event in &room_events {
            machine.receive_room_event(event).await.expect("The room event can be handled");
        }
    }
}

#[async_trait]
impl RequestSender for HomeserverClient {
    async fn send(&self, request: &OutgoingRequest) -> Result<AnyIncomingResponse, TransportError> {
        let mut state = self.server.state.lock();

        Ok(match request.request() {
            OutgoingRequests::KeysUpload(r) => {
                AnyIncomingResponse::KeysUpload(state.keys_upload(&self.user_id, &self.device_id, r))
            }
            OutgoingRequests::KeysQuery(r) => {
                AnyIncomingResponse::KeysQuery(state.keys_query(&self.user_id, r))
            }
            OutgoingRequests::ToDeviceRequest(r) => {
                state.send_to_device(&self.user_id, &self.device_id, r);
                AnyIncomingResponse::ToDevice
            }
            OutgoingRequests::KeysClaim(r) => AnyIncomingResponse::KeysClaim(state.keys_claim(r)),
            OutgoingRequests::RoomMessage(r) => {
                AnyIncomingResponse::RoomMessage(state.send_room_message(&self.user_id, r))
            }
            OutgoingRequests::SignatureUpload(r) => {
                AnyIncomingResponse::SignatureUpload(state.upload_signatures(r))
            }
        })
    }
}
