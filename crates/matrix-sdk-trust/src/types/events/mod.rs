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

//! Event types and contents exchanged by this crate.
//!
//! Contents serialize to their Matrix wire format. Events are deserialized from
//! the `{ "sender", "type", "content" }` shape the server delivers, to-device
//! events that were decrypted from an Olm envelope also carry a `sender_key`.

mod room_key;
mod secret;
mod verification;

use ruma::{MilliSecondsSinceUnixEpoch, OwnedEventId, OwnedRoomId, OwnedUserId};
pub use room_key::*;
pub use secret::*;
use serde::{de::Error as _, Deserialize, Deserializer, Serialize};
use serde_json::Value;
pub use verification::*;
use vodozemac::Curve25519PublicKey;

/// Trait binding a content type to its event type.
pub trait EventType {
    /// The event type of the content.
    const EVENT_TYPE: &'static str;

    /// Get the event type of the content.
    fn event_type(&self) -> &'static str {
        Self::EVENT_TYPE
    }
}

/// A to-device event with a typed content.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToDeviceEvent<C> {
    /// The user that sent the event.
    pub sender: OwnedUserId,
    /// The Curve25519 key of the device that sent the event, known once the
    /// event was decrypted from its Olm envelope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_key: Option<Curve25519PublicKey>,
    /// The content of the event.
    pub content: C,
}

impl<C> ToDeviceEvent<C> {
    /// Create a new to-device event.
    pub fn new(sender: OwnedUserId, content: C) -> Self {
        Self { sender, sender_key: None, content }
    }

    /// Set the Curve25519 key of the device that sent the event.
    pub fn with_sender_key(mut self, sender_key: Curve25519PublicKey) -> Self {
        self.sender_key = Some(sender_key);
        self
    }
}

/// A room event with a typed content.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoomEvent<C> {
    /// The user that sent the event.
    pub sender: OwnedUserId,
    /// The unique ID of the event.
    pub event_id: OwnedEventId,
    /// The room the event was sent in.
    pub room_id: OwnedRoomId,
    /// The server timestamp of the event.
    pub origin_server_ts: MilliSecondsSinceUnixEpoch,
    /// The content of the event.
    pub content: C,
}

/// The `m.room.encrypted` room event.
pub type EncryptedRoomEvent = RoomEvent<RoomEncryptedContent>;

/// The to-device events this crate handles.
#[derive(Clone, Debug)]
pub enum AnyToDeviceEvent {
    /// An `m.room_key_request` event.
    RoomKeyRequest(ToDeviceEvent<RoomKeyRequestContent>),
    /// An `m.forwarded_room_key` event.
    ForwardedRoomKey(ToDeviceEvent<ForwardedRoomKeyContent>),
    /// An `m.room_key.withheld` event.
    RoomKeyWithheld(ToDeviceEvent<RoomKeyWithheldContent>),
    /// An `m.secret.request` event.
    SecretRequest(ToDeviceEvent<SecretRequestContent>),
    /// An `m.secret.send` event.
    SecretSend(ToDeviceEvent<SecretSendContent>),
    /// One of the `m.key.verification.*` events.
    Verification(ToDeviceEvent<ToDeviceVerificationContent>),
    /// An event type we don't handle.
    Custom(ToDeviceEvent<Value>, String),
}

impl AnyToDeviceEvent {
    /// Parse a to-device event from its parts.
    pub fn from_parts(
        sender: OwnedUserId,
        event_type: &str,
        content: Value,
    ) -> Result<Self, serde_json::Error> {
        Ok(match event_type {
            RoomKeyRequestContent::EVENT_TYPE => {
                Self::RoomKeyRequest(ToDeviceEvent::new(sender, serde_json::from_value(content)?))
            }
            ForwardedRoomKeyContent::EVENT_TYPE => {
                Self::ForwardedRoomKey(ToDeviceEvent::new(sender, serde_json::from_value(content)?))
            }
            RoomKeyWithheldContent::EVENT_TYPE => {
                Self::RoomKeyWithheld(ToDeviceEvent::new(sender, serde_json::from_value(content)?))
            }
            SecretRequestContent::EVENT_TYPE => {
                Self::SecretRequest(ToDeviceEvent::new(sender, serde_json::from_value(content)?))
            }
            SecretSendContent::EVENT_TYPE => {
                Self::SecretSend(ToDeviceEvent::new(sender, serde_json::from_value(content)?))
            }
            t => match ToDeviceVerificationContent::from_parts(t, &content) {
                Some(c) => Self::Verification(ToDeviceEvent::new(sender, c?)),
                None => Self::Custom(ToDeviceEvent::new(sender, content), t.to_owned()),
            },
        })
    }

    /// Attach the Curve25519 key of the device that sent the event.
    pub fn with_sender_key(self, sender_key: Curve25519PublicKey) -> Self {
        match self {
            Self::RoomKeyRequest(e) => Self::RoomKeyRequest(e.with_sender_key(sender_key)),
            Self::ForwardedRoomKey(e) => Self::ForwardedRoomKey(e.with_sender_key(sender_key)),
            Self::RoomKeyWithheld(e) => Self::RoomKeyWithheld(e.with_sender_key(sender_key)),
            Self::SecretRequest(e) => Self::SecretRequest(e.with_sender_key(sender_key)),
            Self::SecretSend(e) => Self::SecretSend(e.with_sender_key(sender_key)),
            Self::Verification(e) => Self::Verification(e.with_sender_key(sender_key)),
            Self::Custom(e, t) => Self::Custom(e.with_sender_key(sender_key), t),
        }
    }

    /// The sender of the event.
    pub fn sender(&self) -> &OwnedUserId {
        match self {
            AnyToDeviceEvent::RoomKeyRequest(e) => &e.sender,
            AnyToDeviceEvent::ForwardedRoomKey(e) => &e.sender,
            AnyToDeviceEvent::RoomKeyWithheld(e) => &e.sender,
            AnyToDeviceEvent::SecretRequest(e) => &e.sender,
            AnyToDeviceEvent::SecretSend(e) => &e.sender,
            AnyToDeviceEvent::Verification(e) => &e.sender,
            AnyToDeviceEvent::Custom(e, _) => &e.sender,
        }
    }

    /// The event type of the event.
    pub fn event_type(&self) -> &str {
        match self {
            AnyToDeviceEvent::RoomKeyRequest(e) => e.content.event_type(),
            AnyToDeviceEvent::ForwardedRoomKey(e) => e.content.event_type(),
            AnyToDeviceEvent::RoomKeyWithheld(e) => e.content.event_type(),
            AnyToDeviceEvent::SecretRequest(e) => e.content.event_type(),
            AnyToDeviceEvent::SecretSend(e) => e.content.event_type(),
            AnyToDeviceEvent::Verification(e) => e.content.event_type(),
            AnyToDeviceEvent::Custom(_, t) => t,
        }
    }
}

/// The contents of the to-device events this crate sends.
#[derive(Clone, Debug, Serialize)]
#[serde(untagged)]
pub enum AnyToDeviceContent {
    /// An `m.room_key_request` content.
    RoomKeyRequest(RoomKeyRequestContent),
    /// An `m.forwarded_room_key` content.
    ForwardedRoomKey(ForwardedRoomKeyContent),
    /// An `m.room_key.withheld` content.
    RoomKeyWithheld(RoomKeyWithheldContent),
    /// An `m.secret.request` content.
    SecretRequest(SecretRequestContent),
    /// An `m.secret.send` content.
    SecretSend(SecretSendContent),
    /// One of the `m.key.verification.*` contents.
    Verification(ToDeviceVerificationContent),
}

impl AnyToDeviceContent {
    /// The event type of the content.
    pub fn event_type(&self) -> &'static str {
        match self {
            AnyToDeviceContent::RoomKeyRequest(c) => c.event_type(),
            AnyToDeviceContent::ForwardedRoomKey(c) => c.event_type(),
            AnyToDeviceContent::RoomKeyWithheld(c) => c.event_type(),
            AnyToDeviceContent::SecretRequest(c) => c.event_type(),
            AnyToDeviceContent::SecretSend(c) => c.event_type(),
            AnyToDeviceContent::Verification(c) => c.event_type(),
        }
    }
}

impl From<RoomKeyRequestContent> for AnyToDeviceContent {
    fn from(c: RoomKeyRequestContent) -> Self {
        Self::RoomKeyRequest(c)
    }
}

impl From<ForwardedRoomKeyContent> for AnyToDeviceContent {
    fn from(c: ForwardedRoomKeyContent) -> Self {
        Self::ForwardedRoomKey(c)
    }
}

impl From<RoomKeyWithheldContent> for AnyToDeviceContent {
    fn from(c: RoomKeyWithheldContent) -> Self {
        Self::RoomKeyWithheld(c)
    }
}

impl From<SecretRequestContent> for AnyToDeviceContent {
    fn from(c: SecretRequestContent) -> Self {
        Self::SecretRequest(c)
    }
}

impl From<SecretSendContent> for AnyToDeviceContent {
    fn from(c: SecretSendContent) -> Self {
        Self::SecretSend(c)
    }
}

impl From<ToDeviceVerificationContent> for AnyToDeviceContent {
    fn from(c: ToDeviceVerificationContent) -> Self {
        Self::Verification(c)
    }
}

impl From<VerificationContent> for AnyToDeviceContent {
    fn from(c: VerificationContent) -> Self {
        Self::Verification(ToDeviceVerificationContent::Other(c))
    }
}

#[derive(Deserialize)]
struct RawEvent {
    sender: OwnedUserId,
    #[serde(default)]
    sender_key: Option<Curve25519PublicKey>,
    #[serde(rename = "type")]
    event_type: String,
    content: Value,
}

impl<'de> Deserialize<'de> for AnyToDeviceEvent {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = RawEvent::deserialize(deserializer)?;
        let event =
            Self::from_parts(raw.sender, &raw.event_type, raw.content).map_err(D::Error::custom)?;

        Ok(match raw.sender_key {
            Some(sender_key) => event.with_sender_key(sender_key),
            None => event,
        })
    }
}

#[derive(Deserialize)]
struct RawRoomEvent {
    sender: OwnedUserId,
    event_id: OwnedEventId,
    room_id: OwnedRoomId,
    origin_server_ts: MilliSecondsSinceUnixEpoch,
    #[serde(rename = "type")]
    event_type: String,
    content: Value,
}

/// The room events this crate handles.
#[derive(Clone, Debug)]
pub enum AnyRoomEvent {
    /// An `m.room.encrypted` event.
    Encrypted(EncryptedRoomEvent),
    /// An in-room verification event, including the `m.room.message` carrying
    /// a verification request.
    Verification(RoomEvent<RoomVerificationContent>),
    /// Any other room event.
    Other(RoomEvent<Value>, String),
}

impl AnyRoomEvent {
    /// The ID of the event.
    pub fn event_id(&self) -> &OwnedEventId {
        match self {
            AnyRoomEvent::Encrypted(e) => &e.event_id,
            AnyRoomEvent::Verification(e) => &e.event_id,
            AnyRoomEvent::Other(e, _) => &e.event_id,
        }
    }
}

impl<'de> Deserialize<'de> for AnyRoomEvent {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let RawRoomEvent { sender, event_id, room_id, origin_server_ts, event_type, content } =
            RawRoomEvent::deserialize(deserializer)?;

        let event = |content| RoomEvent { sender, event_id, room_id, origin_server_ts, content };

        Ok(match event_type.as_str() {
            RoomEncryptedContent::EVENT_TYPE => {
                Self::Encrypted(event(serde_json::from_value(content).map_err(D::Error::custom)?))
            }
            t => match RoomVerificationContent::from_parts(t, &content) {
                Some(c) => Self::Verification(event(c.map_err(D::Error::custom)?)),
                None => Self::Other(event(content), event_type),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_matches;
    use serde_json::json;
    use vodozemac::{Curve25519PublicKey, Curve25519SecretKey};

    use super::{AnyRoomEvent, AnyToDeviceEvent, RoomVerificationContent, VerificationContent};

    #[test]
    fn unknown_to_device_events_are_kept() {
        let event: AnyToDeviceEvent = serde_json::from_value(json!({
            "sender": "@alice:example.org",
            "type": "org.example.custom",
            "content": { "foo": "bar" },
        }))
        .unwrap();

        assert_eq!(event.event_type(), "org.example.custom");
        assert_matches!(event, AnyToDeviceEvent::Custom(..));
    }

    #[test]
    fn decrypted_to_device_events_keep_the_sender_key() {
        let sender_key = Curve25519PublicKey::from(&Curve25519SecretKey::new());

        let event: AnyToDeviceEvent = serde_json::from_value(json!({
            "sender": "@alice:example.org",
            "sender_key": sender_key.to_base64(),
            "type": "m.room_key_request",
            "content": {
                "action": "request_cancellation",
                "request_id": "1495474790150.19",
                "requesting_device_id": "RJYKSTBOIE",
            },
        }))
        .unwrap();

        assert_matches!(event, AnyToDeviceEvent::RoomKeyRequest(event));
        assert_eq!(event.sender_key, Some(sender_key));

        let event: AnyToDeviceEvent = serde_json::from_value(json!({
            "sender": "@alice:example.org",
            "type": "org.example.custom",
            "content": {},
        }))
        .unwrap();

        assert_matches!(event, AnyToDeviceEvent::Custom(event, _));
        assert!(event.sender_key.is_none());
    }

    #[test]
    fn room_verification_request_is_recognized() {
        let event: AnyRoomEvent = serde_json::from_value(json!({
            "sender": "@alice:example.org",
            "event_id": "$request:example.org",
            "room_id": "!dm:example.org",
            "origin_server_ts": 1_600_000_000_000u64,
            "type": "m.room.message",
            "content": {
                "msgtype": "m.key.verification.request",
                "body": "Alice is requesting to verify your key",
                "from_device": "ALICEDEVICE",
                "methods": ["m.sas.v1"],
                "to": "@bob:example.org",
            },
        }))
        .unwrap();

        assert_matches!(event, AnyRoomEvent::Verification(event));
        assert_matches!(event.content, RoomVerificationContent::Request(request));
        assert_eq!(request.to.as_str(), "@bob:example.org");

        let plain_message: AnyRoomEvent = serde_json::from_value(json!({
            "sender": "@alice:example.org",
            "event_id": "$text:example.org",
            "room_id": "!dm:example.org",
            "origin_server_ts": 1_600_000_000_000u64,
            "type": "m.room.message",
            "content": { "msgtype": "m.text", "body": "Hello" },
        }))
        .unwrap();

        assert_matches!(plain_message, AnyRoomEvent::Other(..));

        let done: AnyRoomEvent = serde_json::from_value(json!({
            "sender": "@alice:example.org",
            "event_id": "$done:example.org",
            "room_id": "!dm:example.org",
            "origin_server_ts": 1_600_000_000_000u64,
            "type": "m.key.verification.done",
            "content": {
                "m.relates_to": { "rel_type": "m.reference", "event_id": "$request:example.org" },
            },
        }))
        .unwrap();

        assert_matches!(done, AnyRoomEvent::Verification(done));
        assert_matches!(done.content, RoomVerificationContent::Other(VerificationContent::Done(_)));
    }
}
