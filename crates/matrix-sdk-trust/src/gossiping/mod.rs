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

//! Room key gossiping, requesting room keys we are missing from our other
//! devices and answering such requests of our other devices.
//!
//! Secrets, e.g. the private cross-signing keys, are gossiped the same way
//! but only to devices we verified a short while ago.

mod machine;

use std::{collections::BTreeMap, fmt};

pub(crate) use machine::GossipMachine;
use ruma::{
    to_device::DeviceIdOrAllDevices, MilliSecondsSinceUnixEpoch, OwnedDeviceId,
    OwnedTransactionId, OwnedUserId, RoomId,
};
use serde::{Deserialize, Serialize};

use crate::types::events::{
    KeyRequestAction, RequestedKeyInfo, RoomKeyRequestContent, SecretName, WithheldCode,
};

/// The state of an outgoing room key request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutgoingRequestState {
    /// The request was created but didn't reach the server yet.
    Unsent,
    /// The request was delivered to the server.
    Sent,
    /// The request isn't needed anymore, a cancellation needs to be sent out.
    CancellationPending,
    /// The request should be sent again, first the cancellation of the old
    /// request needs to be sent out.
    CancellationPendingAndWillResend,
    /// The request is resolved, nothing needs to be sent out anymore.
    Cancelled,
}

/// The outcome a device reported for one of our room key requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyReplyResult {
    /// The device forwarded the room key.
    Accepted,
    /// The device withheld the room key.
    Rejected(WithheldCode),
}

/// A reply of a device to one of our room key requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRequestReply {
    /// The user that replied.
    pub user_id: OwnedUserId,
    /// The device that replied, if we know it.
    pub device_id: Option<OwnedDeviceId>,
    /// The outcome of the request on that device.
    pub result: KeyReplyResult,
}

/// A request for a room key we sent, or are about to send, to other devices.
#[derive(Debug, Clone)]
pub struct OutgoingKeyRequest {
    /// The unique ID of the request, it's also the ID of its cancellation.
    pub request_id: OwnedTransactionId,
    /// The room key we are requesting.
    pub info: RequestedKeyInfo,
    /// The devices the request is addressed to.
    pub recipients: BTreeMap<OwnedUserId, Vec<DeviceIdOrAllDevices>>,
    /// The state of the request.
    pub state: OutgoingRequestState,
    /// The replies we got so far.
    pub replies: Vec<KeyRequestReply>,
    /// When the request was created.
    pub creation_time: MilliSecondsSinceUnixEpoch,
}

impl OutgoingKeyRequest {
    /// The room the requested key belongs to.
    pub fn room_id(&self) -> &RoomId {
        &self.info.room_id
    }

    /// The session ID of the requested key.
    pub fn session_id(&self) -> &str {
        &self.info.session_id
    }

    /// Is the request still unresolved.
    ///
    /// There's at most a single unresolved request per room key.
    pub fn is_unresolved(&self) -> bool {
        self.state != OutgoingRequestState::Cancelled
    }

    /// Does the request need to be sent out, either as a request or as a
    /// cancellation.
    pub fn needs_sending(&self) -> bool {
        matches!(
            self.state,
            OutgoingRequestState::Unsent
                | OutgoingRequestState::CancellationPending
                | OutgoingRequestState::CancellationPendingAndWillResend
        )
    }

    /// The content that needs to be sent out for the current state, a
    /// request for unsent requests and a cancellation otherwise.
    pub(crate) fn to_content(&self, requesting_device_id: OwnedDeviceId) -> RoomKeyRequestContent {
        match self.state {
            OutgoingRequestState::Unsent | OutgoingRequestState::Sent => RoomKeyRequestContent {
                action: KeyRequestAction::Request,
                body: Some(self.info.clone()),
                request_id: self.request_id.clone(),
                requesting_device_id,
            },
            OutgoingRequestState::CancellationPending
            | OutgoingRequestState::CancellationPendingAndWillResend
            | OutgoingRequestState::Cancelled => RoomKeyRequestContent {
                action: KeyRequestAction::CancelRequest,
                body: None,
                request_id: self.request_id.clone(),
                requesting_device_id,
            },
        }
    }
}

/// A secret one of our other devices sent us.
///
/// Received secrets wait in the inbox of the store until the application
/// checks and imports them.
#[derive(Clone, Serialize, Deserialize)]
pub struct GossippedSecret {
    /// The name of the secret.
    pub secret_name: SecretName,
    /// The ID of the request the secret answered.
    pub request_id: OwnedTransactionId,
    /// The device that sent the secret.
    pub sender_device_id: OwnedDeviceId,
    /// The secret itself.
    pub secret: String,
}

impl fmt::Debug for GossippedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GossippedSecret")
            .field("secret_name", &self.secret_name)
            .field("request_id", &self.request_id)
            .field("sender_device_id", &self.sender_device_id)
            .finish_non_exhaustive()
    }
}

/// Why an incoming room key request was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectionReason {
    /// The request came from another user, we only share keys with our own
    /// devices.
    NotOwnUser,
    /// We don't know the requesting device.
    UnknownDevice,
    /// The requesting device is blacklisted.
    Blacklisted,
    /// The requesting device isn't verified.
    Unverified,
    /// We don't have the requested room key.
    UnknownSession,
}

impl RejectionReason {
    /// The withheld code we reply with, if we reply at all.
    pub fn withheld_code(&self) -> Option<WithheldCode> {
        match self {
            RejectionReason::NotOwnUser | RejectionReason::UnknownDevice => None,
            RejectionReason::Blacklisted => Some(WithheldCode::Blacklisted),
            RejectionReason::Unverified => Some(WithheldCode::Unauthorised),
            RejectionReason::UnknownSession => Some(WithheldCode::Unavailable),
        }
    }
}

/// The state of a room key request we received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IncomingRequestState {
    /// The request waits to be processed.
    Requested,
    /// The room key was forwarded to the requesting device.
    Accepted,
    /// The request was rejected.
    Rejected(RejectionReason),
}

/// A room key request we received from one of our devices, or someone else.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingKeyRequest {
    /// The ID of the request, unique per requesting device.
    pub request_id: OwnedTransactionId,
    /// The requested room key.
    pub info: RequestedKeyInfo,
    /// The user that requested the key.
    pub requesting_user_id: OwnedUserId,
    /// The device that requested the key.
    pub requesting_device_id: OwnedDeviceId,
    /// The state of the request.
    pub state: IncomingRequestState,
    /// When we received the request.
    pub creation_time: MilliSecondsSinceUnixEpoch,
}

impl IncomingKeyRequest {
    /// The room the requested key belongs to.
    pub fn room_id(&self) -> &RoomId {
        &self.info.room_id
    }

    /// The session ID of the requested key.
    pub fn session_id(&self) -> &str {
        &self.info.session_id
    }
}
