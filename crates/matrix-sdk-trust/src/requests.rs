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

//! The requests the machine wants to have sent out to the homeserver and the
//! responses it expects back.
//!
//! The types mirror the bodies of the Matrix client-server endpoints they
//! belong to, the network boundary only has to serialize them.

use std::{collections::BTreeMap, sync::Arc};

use as_variant::as_variant;
use ruma::{
    to_device::DeviceIdOrAllDevices, OwnedDeviceId, OwnedEventId, OwnedRoomId,
    OwnedTransactionId, OwnedUserId, TransactionId, UserId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{
    events::{AnyToDeviceContent, RoomVerificationContent},
    CrossSigningKey, DeviceKeys, MasterPubkey, SelfSigningPubkey, SignedKey, UserSigningPubkey,
};

/// The public cross-signing keys of our own identity, to be published.
#[derive(Clone, Debug, Serialize)]
pub struct UploadSigningKeys {
    /// The master key.
    pub master_key: MasterPubkey,
    /// The self-signing key, signed by the master key.
    pub self_signing_key: SelfSigningPubkey,
    /// The user-signing key, signed by the master key.
    pub user_signing_key: UserSigningPubkey,
}

/// Upload our device keys, one-time keys and, if we just created them, our
/// cross-signing keys.
#[derive(Clone, Debug, Default, Serialize)]
pub struct KeysUploadRequest {
    /// The signed device keys, only present the first time we upload keys.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_keys: Option<DeviceKeys>,
    /// Signed one-time keys, keyed by `signed_curve25519:{key id}`.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub one_time_keys: BTreeMap<String, SignedKey>,
    /// Our public cross-signing keys.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cross_signing_keys: Option<UploadSigningKeys>,
}

/// The response to a [`KeysUploadRequest`].
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct KeysUploadResponse {
    /// How many one-time keys of each algorithm the server holds for us.
    #[serde(default)]
    pub one_time_key_counts: BTreeMap<String, u64>,
}

/// Fetch the device and cross-signing keys of a set of users.
#[derive(Clone, Debug, Default, Serialize)]
pub struct KeysQueryRequest {
    /// The users to query, an empty list of devices queries all devices.
    pub device_keys: BTreeMap<OwnedUserId, Vec<OwnedDeviceId>>,
}

impl KeysQueryRequest {
    /// Query all devices of the given users.
    pub fn new(users: impl IntoIterator<Item = OwnedUserId>) -> Self {
        Self { device_keys: users.into_iter().map(|u| (u, Vec::new())).collect() }
    }
}

/// The response to a [`KeysQueryRequest`].
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct KeysQueryResponse {
    /// The device keys of the queried users.
    #[serde(default)]
    pub device_keys: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, DeviceKeys>>,
    /// The master keys of the queried users.
    #[serde(default)]
    pub master_keys: BTreeMap<OwnedUserId, CrossSigningKey>,
    /// The self-signing keys of the queried users.
    #[serde(default)]
    pub self_signing_keys: BTreeMap<OwnedUserId, CrossSigningKey>,
    /// The user-signing keys, only ever present for our own user.
    #[serde(default)]
    pub user_signing_keys: BTreeMap<OwnedUserId, CrossSigningKey>,
    /// Servers that couldn't be reached.
    #[serde(default)]
    pub failures: BTreeMap<String, Value>,
}

/// Claim one-time keys of other devices so a secure channel can be set up
/// with them.
#[derive(Clone, Debug, Default, Serialize)]
pub struct KeysClaimRequest {
    /// The algorithm of the key to claim, per user and device.
    pub one_time_keys: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, String>>,
}

/// The response to a [`KeysClaimRequest`].
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct KeysClaimResponse {
    /// The claimed keys, per user and device, keyed by the key ID.
    #[serde(default)]
    pub one_time_keys: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, BTreeMap<String, SignedKey>>>,
    /// Servers that couldn't be reached.
    #[serde(default)]
    pub failures: BTreeMap<String, Value>,
}

/// Customized version of the `send_event_to_device` request body.
#[derive(Clone, Debug, Serialize)]
pub struct ToDeviceRequest {
    /// Type of event being sent to each device.
    pub event_type: String,

    /// A request identifier unique to the access token used to send the
    /// request.
    pub txn_id: OwnedTransactionId,

    /// A map of users to devices to a content for a message event to be
    /// sent to the user's device. Individual message events can be sent
    /// to devices, but all events must be of the same type.
    /// The content's type for this field will be updated in a future
    /// release, until then you can create a value using
    /// `serde_json::value::to_raw_value`.
    pub messages: BTreeMap<OwnedUserId, BTreeMap<DeviceIdOrAllDevices, AnyToDeviceContent>>,
}

impl ToDeviceRequest {
    /// Create a new owned to-device request
    ///
    /// # Arguments
    ///
    /// * `recipient` - The ID of the user that should receive this to-device
    ///   event.
    ///
    /// * `recipient_device` - The device that should receive this to-device
    ///   event, or all devices.
    ///
    /// * `content` - The content of the to-device event.
    pub fn new(
        recipient: &UserId,
        recipient_device: impl Into<DeviceIdOrAllDevices>,
        content: impl Into<AnyToDeviceContent>,
    ) -> Self {
        Self::with_id(recipient, recipient_device, content, TransactionId::new())
    }

    /// Create a new to-device request with the given transaction ID.
    pub fn with_id(
        recipient: &UserId,
        recipient_device: impl Into<DeviceIdOrAllDevices>,
        content: impl Into<AnyToDeviceContent>,
        txn_id: OwnedTransactionId,
    ) -> Self {
        let content = content.into();
        let event_type = content.event_type().to_owned();

        let messages = BTreeMap::from([(
            recipient.to_owned(),
            BTreeMap::from([(recipient_device.into(), content)]),
        )]);

        Self { event_type, txn_id, messages }
    }

    /// Create a to-device request that sends the same content to a set of
    /// devices.
    pub fn for_recipients(
        recipient: &UserId,
        recipient_devices: impl IntoIterator<Item = DeviceIdOrAllDevices>,
        content: impl Into<AnyToDeviceContent>,
        txn_id: OwnedTransactionId,
    ) -> Self {
        let content = content.into();
        let event_type = content.event_type().to_owned();

        let devices: BTreeMap<_, _> =
            recipient_devices.into_iter().map(|d| (d, content.clone())).collect();

        let messages = if devices.is_empty() {
            BTreeMap::new()
        } else {
            BTreeMap::from([(recipient.to_owned(), devices)])
        };

        Self { event_type, txn_id, messages }
    }

    /// Add the messages of another to-device request of the same event type
    /// to this request.
    pub(crate) fn merge(&mut self, other: ToDeviceRequest) {
        for (user_id, devices) in other.messages {
            self.messages.entry(user_id).or_default().extend(devices);
        }
    }

    /// Gets the total count of messages in this request.
    pub fn message_count(&self) -> usize {
        self.messages.values().map(|d| d.len()).sum()
    }
}

/// Send a message to a room.
#[derive(Clone, Debug)]
pub struct RoomMessageRequest {
    /// The room to send the event to.
    pub room_id: OwnedRoomId,

    /// The transaction ID for this event.
    ///
    /// Clients should generate an ID unique across requests with the
    /// same access token; it will be used by the server to ensure
    /// idempotency of requests.
    pub txn_id: OwnedTransactionId,

    /// The event content to send.
    pub content: RoomVerificationContent,
}

impl RoomMessageRequest {
    /// The event type of the message.
    pub fn event_type(&self) -> &'static str {
        self.content.event_type()
    }
}

/// The response to a [`RoomMessageRequest`].
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RoomMessageResponse {
    /// The ID the server assigned to the sent event.
    pub event_id: OwnedEventId,
}

/// Upload new signatures of device or cross-signing keys.
#[derive(Clone, Debug, Default, Serialize)]
pub struct SignatureUploadRequest {
    /// The signed objects, keyed by the owner and then by the device ID or
    /// the base64 encoded public cross-signing key.
    pub signed_keys: BTreeMap<OwnedUserId, BTreeMap<String, Value>>,
}

impl SignatureUploadRequest {
    /// Add a signed object to the request.
    pub fn add_signed_object(&mut self, user_id: OwnedUserId, key_id: String, object: Value) {
        self.signed_keys.entry(user_id).or_default().insert(key_id, object);
    }

    /// Add all the signed objects of another request to this one.
    pub fn merge(&mut self, other: SignatureUploadRequest) {
        for (user_id, objects) in other.signed_keys {
            self.signed_keys.entry(user_id).or_default().extend(objects);
        }
    }

    /// Does the request contain any signatures.
    pub fn is_empty(&self) -> bool {
        self.signed_keys.is_empty()
    }
}

/// The response to a [`SignatureUploadRequest`].
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct SignatureUploadResponse {
    /// Signatures the server refused, per user and key.
    #[serde(default)]
    pub failures: BTreeMap<OwnedUserId, BTreeMap<String, Value>>,
}

/// Enum over the different outgoing requests we can have.
#[derive(Debug)]
pub enum OutgoingRequests {
    /// The keys upload request, uploading device, one-time and cross-signing
    /// keys.
    KeysUpload(KeysUploadRequest),
    /// The keys query request, fetching the device and cross signing keys of
    /// other users.
    KeysQuery(KeysQueryRequest),
    /// The to-device requests, this request is used for a couple of different
    /// things, the main use is key requests/forwards and interactive device
    /// verification.
    ToDeviceRequest(ToDeviceRequest),
    /// The key claiming request, giving us new one-time keys of other users so
    /// secure channels can be created.
    KeysClaim(KeysClaimRequest),
    /// A room message request, usually for sending in-room interactive
    /// verification events.
    RoomMessage(RoomMessageRequest),
    /// A request that will back up a batch of signatures to the server.
    SignatureUpload(SignatureUploadRequest),
}

impl OutgoingRequests {
    /// The to-device request, if this is one.
    pub fn to_device(&self) -> Option<&ToDeviceRequest> {
        as_variant!(self, Self::ToDeviceRequest)
    }

    /// The key claim request, if this is one.
    pub fn keys_claim(&self) -> Option<&KeysClaimRequest> {
        as_variant!(self, Self::KeysClaim)
    }
}

impl From<KeysQueryRequest> for OutgoingRequests {
    fn from(request: KeysQueryRequest) -> Self {
        OutgoingRequests::KeysQuery(request)
    }
}

impl From<KeysUploadRequest> for OutgoingRequests {
    fn from(request: KeysUploadRequest) -> Self {
        OutgoingRequests::KeysUpload(request)
    }
}

impl From<ToDeviceRequest> for OutgoingRequests {
    fn from(request: ToDeviceRequest) -> Self {
        OutgoingRequests::ToDeviceRequest(request)
    }
}

impl From<KeysClaimRequest> for OutgoingRequests {
    fn from(request: KeysClaimRequest) -> Self {
        OutgoingRequests::KeysClaim(request)
    }
}

impl From<RoomMessageRequest> for OutgoingRequests {
    fn from(request: RoomMessageRequest) -> Self {
        OutgoingRequests::RoomMessage(request)
    }
}

impl From<SignatureUploadRequest> for OutgoingRequests {
    fn from(request: SignatureUploadRequest) -> Self {
        OutgoingRequests::SignatureUpload(request)
    }
}

/// Enum over all the incoming responses we need to receive.
#[derive(Debug)]
pub enum IncomingResponse<'a> {
    /// The keys upload response, notifying us about the amount of uploaded
    /// one-time keys.
    KeysUpload(&'a KeysUploadResponse),
    /// The keys query response, giving us the device and cross singing keys of
    /// other users.
    KeysQuery(&'a KeysQueryResponse),
    /// The to-device response, an empty response.
    ToDevice,
    /// The key claiming requests, giving us new one-time keys of other users so
    /// secure channels can be created.
    KeysClaim(&'a KeysClaimResponse),
    /// The response for a room message request, telling us the ID the server
    /// gave the event.
    RoomMessage(&'a RoomMessageResponse),
    /// The response for a signature upload request.
    SignatureUpload(&'a SignatureUploadResponse),
}

impl<'a> From<&'a KeysUploadResponse> for IncomingResponse<'a> {
    fn from(response: &'a KeysUploadResponse) -> Self {
        IncomingResponse::KeysUpload(response)
    }
}

impl<'a> From<&'a KeysQueryResponse> for IncomingResponse<'a> {
    fn from(response: &'a KeysQueryResponse) -> Self {
        IncomingResponse::KeysQuery(response)
    }
}

impl<'a> From<&'a KeysClaimResponse> for IncomingResponse<'a> {
    fn from(response: &'a KeysClaimResponse) -> Self {
        IncomingResponse::KeysClaim(response)
    }
}

impl<'a> From<&'a RoomMessageResponse> for IncomingResponse<'a> {
    fn from(response: &'a RoomMessageResponse) -> Self {
        IncomingResponse::RoomMessage(response)
    }
}

impl<'a> From<&'a SignatureUploadResponse> for IncomingResponse<'a> {
    fn from(response: &'a SignatureUploadResponse) -> Self {
        IncomingResponse::SignatureUpload(response)
    }
}

/// An owned response, as returned by a
/// [`RequestSender`](crate::processor::RequestSender).
#[derive(Clone, Debug)]
pub enum AnyIncomingResponse {
    /// See [`IncomingResponse::KeysUpload`].
    KeysUpload(KeysUploadResponse),
    /// See [`IncomingResponse::KeysQuery`].
    KeysQuery(KeysQueryResponse),
    /// See [`IncomingResponse::ToDevice`].
    ToDevice,
    /// See [`IncomingResponse::KeysClaim`].
    KeysClaim(KeysClaimResponse),
    /// See [`IncomingResponse::RoomMessage`].
    RoomMessage(RoomMessageResponse),
    /// See [`IncomingResponse::SignatureUpload`].
    SignatureUpload(SignatureUploadResponse),
}

impl AnyIncomingResponse {
    /// Borrow the response.
    pub fn as_incoming_response(&self) -> IncomingResponse<'_> {
        match self {
            AnyIncomingResponse::KeysUpload(r) => r.into(),
            AnyIncomingResponse::KeysQuery(r) => r.into(),
            AnyIncomingResponse::ToDevice => IncomingResponse::ToDevice,
            AnyIncomingResponse::KeysClaim(r) => r.into(),
            AnyIncomingResponse::RoomMessage(r) => r.into(),
            AnyIncomingResponse::SignatureUpload(r) => r.into(),
        }
    }
}

/// Outgoing request type, holds the unique ID of the request and the actual
/// request.
#[derive(Debug, Clone)]
pub struct OutgoingRequest {
    /// The unique id of a request, needs to be passed when receiving a
    /// response.
    pub(crate) request_id: OwnedTransactionId,
    /// The underlying outgoing request.
    pub(crate) request: Arc<OutgoingRequests>,
}

impl OutgoingRequest {
    /// Create a new outgoing request with the given ID.
    pub(crate) fn new(request_id: OwnedTransactionId, request: impl Into<OutgoingRequests>) -> Self {
        Self { request_id, request: Arc::new(request.into()) }
    }

    /// Get the unique id of this request.
    pub fn request_id(&self) -> &TransactionId {
        &self.request_id
    }

    /// Get the underlying outgoing request.
    pub fn request(&self) -> &OutgoingRequests {
        &self.request
    }
}

impl From<ToDeviceRequest> for OutgoingRequest {
    fn from(request: ToDeviceRequest) -> Self {
        OutgoingRequest::new(request.txn_id.clone(), request)
    }
}

impl From<RoomMessageRequest> for OutgoingRequest {
    fn from(request: RoomMessageRequest) -> Self {
        OutgoingRequest::new(request.txn_id.clone(), request)
    }
}

impl From<SignatureUploadRequest> for OutgoingRequest {
    fn from(request: SignatureUploadRequest) -> Self {
        OutgoingRequest::new(TransactionId::new(), request)
    }
}

#[cfg(test)]
mod tests {
    use ruma::{device_id, owned_transaction_id, to_device::DeviceIdOrAllDevices, user_id};
    use serde_json::json;

    use super::ToDeviceRequest;
    use crate::types::events::{KeyRequestAction, RoomKeyRequestContent};

    #[test]
    fn to_device_requests_carry_the_event_type() {
        let content = RoomKeyRequestContent {
            action: KeyRequestAction::CancelRequest,
            body: None,
            request_id: owned_transaction_id!("request"),
            requesting_device_id: device_id!("ALICEDEVICE").to_owned(),
        };

        let mut request = ToDeviceRequest::new(
            user_id!("@alice:localhost"),
            DeviceIdOrAllDevices::AllDevices,
            content.clone(),
        );
        assert_eq!(request.event_type, "m.room_key_request");
        assert_eq!(request.message_count(), 1);

        request.merge(ToDeviceRequest::new(
            user_id!("@bob:localhost"),
            device_id!("BOBDEVICE").to_owned(),
            content,
        ));
        assert_eq!(request.message_count(), 2);

        let messages = serde_json::to_value(&request.messages).unwrap();
        assert_eq!(
            messages["@alice:localhost"]["*"],
            json!({
                "action": "request_cancellation",
                "request_id": "request",
                "requesting_device_id": "ALICEDEVICE",
            })
        );
    }
}
