// Copyright 2022 The Matrix.org Foundation C.I.C.
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

//! Contents of the room key related to-device events and of the encrypted room
//! event.

use std::fmt;

use ruma::{OwnedDeviceId, OwnedRoomId, OwnedTransactionId};
use serde::{Deserialize, Serialize};

use super::{verification::string_enum, EventType};

/// The only room encryption algorithm we support.
pub const MEGOLM_V1_AES_SHA2: &str = "m.megolm.v1.aes-sha2";

string_enum! {
    /// A machine-readable code for why a room key was not sent.
    WithheldCode {
        /// The sender blocked the receiving device.
        Blacklisted => "m.blacklisted",
        /// The sender only shares keys with verified devices and the receiving
        /// device isn't verified.
        Unverified => "m.unverified",
        /// The receiving device isn't allowed to receive the key, e.g. because
        /// it belongs to another user or isn't trusted.
        Unauthorised => "m.unauthorised",
        /// The sender doesn't have the requested key.
        Unavailable => "m.unavailable",
        /// No Olm session could be established with the receiving device.
        NoOlm => "m.no_olm",
    }
}

string_enum! {
    /// The action of an `m.room_key_request` event.
    KeyRequestAction {
        /// Request a room key.
        Request => "request",
        /// Cancel a previously sent request.
        CancelRequest => "request_cancellation",
    }
}

/// Information identifying the requested room key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct RequestedKeyInfo {
    /// The encryption algorithm the room key is used with.
    pub algorithm: String,
    /// The room the key belongs to.
    pub room_id: OwnedRoomId,
    /// The Curve25519 key of the device that created the session.
    pub sender_key: String,
    /// The ID of the Megolm session.
    pub session_id: String,
}

/// The `m.room_key_request` to-device content.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RoomKeyRequestContent {
    /// Is this a request or the cancellation of a request.
    pub action: KeyRequestAction,
    /// The requested key, only present for requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<RequestedKeyInfo>,
    /// The ID of the request, a cancellation has the ID of the request it
    /// cancels.
    pub request_id: OwnedTransactionId,
    /// The device that requests the key.
    pub requesting_device_id: OwnedDeviceId,
}

impl EventType for RoomKeyRequestContent {
    const EVENT_TYPE: &'static str = "m.room_key_request";
}

/// The `m.forwarded_room_key` to-device content.
#[derive(Clone, Deserialize, Serialize)]
pub struct ForwardedRoomKeyContent {
    /// The encryption algorithm the room key is used with.
    pub algorithm: String,
    /// The room the key belongs to.
    pub room_id: OwnedRoomId,
    /// The Curve25519 key of the device that created the session.
    pub sender_key: String,
    /// The ID of the Megolm session.
    pub session_id: String,
    /// The exported session key, base64 encoded.
    pub session_key: String,
    /// The Ed25519 key of the device that created the session.
    pub sender_claimed_ed25519_key: String,
    /// The chain of Curve25519 keys of the devices that forwarded the key.
    #[serde(default)]
    pub forwarding_curve25519_key_chain: Vec<String>,
}

impl fmt::Debug for ForwardedRoomKeyContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForwardedRoomKeyContent")
            .field("algorithm", &self.algorithm)
            .field("room_id", &self.room_id)
            .field("sender_key", &self.sender_key)
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

impl EventType for ForwardedRoomKeyContent {
    const EVENT_TYPE: &'static str = "m.forwarded_room_key";
}

/// The `m.room_key.withheld` to-device content.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RoomKeyWithheldContent {
    /// The encryption algorithm the room key is used with.
    pub algorithm: String,
    /// Why the key is withheld.
    pub code: WithheldCode,
    /// A human readable version of the code.
    pub reason: String,
    /// The room the key belongs to.
    pub room_id: OwnedRoomId,
    /// The ID of the Megolm session.
    pub session_id: String,
    /// The Curve25519 key of the device that created the session.
    pub sender_key: String,
    /// The device that withholds the key.
    pub from_device: OwnedDeviceId,
}

impl WithheldCode {
    /// A human readable description of the code.
    pub fn reason(&self) -> &str {
        match self {
            WithheldCode::Blacklisted => "The sender has blocked you.",
            WithheldCode::Unverified => "The sender has disabled encrypting to unverified devices.",
            WithheldCode::Unauthorised => "You are not authorised to read the message.",
            WithheldCode::Unavailable => "The requested key was not found.",
            WithheldCode::NoOlm => "Unable to establish a secure channel.",
            WithheldCode::Other(_) => "The key was withheld.",
        }
    }
}

impl EventType for RoomKeyWithheldContent {
    const EVENT_TYPE: &'static str = "m.room_key.withheld";
}

/// The `m.room.encrypted` content for the `m.megolm.v1.aes-sha2` algorithm.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RoomEncryptedContent {
    /// Always `m.megolm.v1.aes-sha2`.
    pub algorithm: String,
    /// The base64 encoded Megolm message.
    pub ciphertext: String,
    /// The Curve25519 key of the sending device.
    pub sender_key: String,
    /// The ID of the sending device.
    pub device_id: OwnedDeviceId,
    /// The ID of the Megolm session that encrypted the event.
    pub session_id: String,
}

impl EventType for RoomEncryptedContent {
    const EVENT_TYPE: &'static str = "m.room.encrypted";
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{KeyRequestAction, RoomKeyRequestContent};

    #[test]
    fn key_request_cancellation_has_no_body() {
        let json = json!({
            "action": "request_cancellation",
            "request_id": "1495474790150.19",
            "requesting_device_id": "RJYKSTBOIE",
        });

        let content: RoomKeyRequestContent = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(content.action, KeyRequestAction::CancelRequest);
        assert!(content.body.is_none());
        assert_eq!(serde_json::to_value(&content).unwrap(), json);
    }
}
