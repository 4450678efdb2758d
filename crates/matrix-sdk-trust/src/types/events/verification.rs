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

//! Contents of the `m.key.verification.*` events.
//!
//! Every content except the in-room request carries a [`Relation`] tying it to
//! its flow: a `transaction_id` for to-device flows and an `m.relates_to`
//! reference to the request event for in-room flows.

use std::{collections::BTreeMap, fmt};

use ruma::{MilliSecondsSinceUnixEpoch, OwnedDeviceId, OwnedEventId, OwnedTransactionId, OwnedUserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub(crate) const VERIFICATION_EVENT_PREFIX: &str = "m.key.verification.";
const ROOM_MESSAGE_EVENT_TYPE: &str = "m.room.message";

/// The only key agreement protocol we support.
pub const KEY_AGREEMENT_V1: &str = "curve25519-hkdf-sha256";
/// The only hash we support for the commitment.
pub const HASH_SHA256: &str = "sha256";
/// The only message authentication code we support.
pub const MAC_HKDF_HMAC_SHA256_V2: &str = "hkdf-hmac-sha256.v2";

macro_rules! string_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $($(#[$variant_meta:meta])* $variant:ident => $value:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
        #[serde(from = "String", into = "String")]
        pub enum $name {
            $($(#[$variant_meta])* $variant,)+
            /// A value this crate doesn't know about.
            Other(String),
        }

        impl $name {
            /// Get the string representation of the value.
            pub fn as_str(&self) -> &str {
                match self {
                    $(Self::$variant => $value,)+
                    Self::Other(s) => s,
                }
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                match value.as_str() {
                    $($value => Self::$variant,)+
                    _ => Self::Other(value),
                }
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.as_str().to_owned()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

pub(crate) use string_enum;

string_enum! {
    /// An interactive verification method.
    VerificationMethod {
        /// The `m.sas.v1` short authentication string method.
        SasV1 => "m.sas.v1",
        /// The `m.qr_code.show.v1` method, we only recognize it.
        QrCodeShowV1 => "m.qr_code.show.v1",
        /// The `m.qr_code.scan.v1` method, we only recognize it.
        QrCodeScanV1 => "m.qr_code.scan.v1",
        /// The `m.reciprocate.v1` method, we only recognize it.
        ReciprocateV1 => "m.reciprocate.v1",
    }
}

string_enum! {
    /// A way to display the short authentication string.
    ShortAuthenticationString {
        /// Three groups of four decimal digits.
        Decimal => "decimal",
        /// Seven emoji.
        Emoji => "emoji",
    }
}

string_enum! {
    /// Why a verification flow was cancelled.
    CancelCode {
        /// The user cancelled the verification.
        User => "m.user",
        /// The verification timed out.
        Timeout => "m.timeout",
        /// The device doesn't know about the flow.
        UnknownTransaction => "m.unknown_transaction",
        /// The device doesn't know how to handle the requested method.
        UnknownMethod => "m.unknown_method",
        /// The device received an unexpected message.
        UnexpectedMessage => "m.unexpected_message",
        /// The key that was verified didn't match the expected one.
        KeyMismatch => "m.key_mismatch",
        /// The user that was verified didn't match the expected one.
        UserMismatch => "m.user_mismatch",
        /// A received message was invalid.
        InvalidMessage => "m.invalid_message",
        /// The request was accepted by a different device.
        Accepted => "m.accepted",
        /// The key didn't match the commitment of the accept message.
        MismatchedCommitment => "m.mismatched_commitment",
        /// The short authentication strings didn't match.
        MismatchedSas => "m.mismatched_sas",
    }
}

/// A reference to the event that started an in-room verification flow.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Reference {
    /// Always `m.reference`.
    pub rel_type: String,
    /// The ID of the `m.key.verification.request` event.
    pub event_id: OwnedEventId,
}

impl Reference {
    /// Create a new reference to the given request event.
    pub fn new(event_id: OwnedEventId) -> Self {
        Self { rel_type: "m.reference".to_owned(), event_id }
    }
}

/// Ties a verification content to its flow.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Relation {
    /// The flow uses to-device messages.
    ToDevice {
        /// The ID of the flow.
        transaction_id: OwnedTransactionId,
    },
    /// The flow uses room messages.
    InRoom {
        /// The reference to the request event.
        #[serde(rename = "m.relates_to")]
        relates_to: Reference,
    },
}

impl Relation {
    /// The ID of the flow, the transaction ID or the event ID of the request.
    pub fn flow_id(&self) -> &str {
        match self {
            Relation::ToDevice { transaction_id } => transaction_id.as_str(),
            Relation::InRoom { relates_to } => relates_to.event_id.as_str(),
        }
    }
}

/// The `m.key.verification.request` to-device content.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RequestContent {
    /// The device that requests the verification.
    pub from_device: OwnedDeviceId,
    /// The verification methods the sending device supports.
    pub methods: Vec<VerificationMethod>,
    /// When the request was created.
    pub timestamp: MilliSecondsSinceUnixEpoch,
    /// The ID of the flow.
    pub transaction_id: OwnedTransactionId,
}

/// The `m.room.message` content carrying an in-room verification request.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RoomRequestContent {
    /// Always `m.key.verification.request`.
    pub msgtype: String,
    /// A fallback text for clients that don't support verification.
    pub body: String,
    /// The device that requests the verification.
    pub from_device: OwnedDeviceId,
    /// The verification methods the sending device supports.
    pub methods: Vec<VerificationMethod>,
    /// The user the request is meant for.
    pub to: OwnedUserId,
}

/// The `m.key.verification.ready` content.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ReadyContent {
    /// The device that accepted the request.
    pub from_device: OwnedDeviceId,
    /// The verification methods the accepting device supports.
    pub methods: Vec<VerificationMethod>,
    /// The flow of the content.
    #[serde(flatten)]
    pub relation: Relation,
}

/// The `m.key.verification.start` content for the `m.sas.v1` method.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct StartContent {
    /// The device that starts the verification.
    pub from_device: OwnedDeviceId,
    /// The verification method, we only handle `m.sas.v1`.
    pub method: VerificationMethod,
    /// The key agreement protocols the sending device supports.
    pub key_agreement_protocols: Vec<String>,
    /// The hash methods the sending device supports.
    pub hashes: Vec<String>,
    /// The message authentication codes the sending device supports.
    pub message_authentication_codes: Vec<String>,
    /// The SAS methods the sending device can display.
    pub short_authentication_string: Vec<ShortAuthenticationString>,
    /// The flow of the content.
    #[serde(flatten)]
    pub relation: Relation,
}

/// The `m.key.verification.accept` content.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AcceptContent {
    /// The verification method, we only handle `m.sas.v1`.
    pub method: VerificationMethod,
    /// The chosen key agreement protocol.
    pub key_agreement_protocol: String,
    /// The chosen hash method.
    pub hash: String,
    /// The chosen message authentication code.
    pub message_authentication_code: String,
    /// The SAS methods both devices can display.
    pub short_authentication_string: Vec<ShortAuthenticationString>,
    /// The hash of the accepting device's ephemeral public key and the
    /// canonical start content.
    pub commitment: String,
    /// The flow of the content.
    #[serde(flatten)]
    pub relation: Relation,
}

/// The `m.key.verification.key` content.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct KeyContent {
    /// The ephemeral Curve25519 public key of the sending device.
    pub key: String,
    /// The flow of the content.
    #[serde(flatten)]
    pub relation: Relation,
}

/// The `m.key.verification.mac` content.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MacContent {
    /// A map of key IDs to the MAC of the key.
    pub mac: BTreeMap<String, String>,
    /// The MAC of the sorted, comma separated list of key IDs in `mac`.
    pub keys: String,
    /// The flow of the content.
    #[serde(flatten)]
    pub relation: Relation,
}

/// The `m.key.verification.cancel` content.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CancelContent {
    /// The machine readable reason of the cancellation.
    pub code: CancelCode,
    /// The human readable reason of the cancellation.
    pub reason: String,
    /// The flow of the content.
    #[serde(flatten)]
    pub relation: Relation,
}

/// The `m.key.verification.done` content.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DoneContent {
    /// The flow of the content.
    #[serde(flatten)]
    pub relation: Relation,
}

/// The verification contents shared by the to-device and in-room transports.
#[derive(Clone, Debug, Serialize)]
#[serde(untagged)]
pub enum VerificationContent {
    /// An `m.key.verification.ready` content.
    Ready(ReadyContent),
    /// An `m.key.verification.start` content.
    Start(StartContent),
    /// An `m.key.verification.accept` content.
    Accept(AcceptContent),
    /// An `m.key.verification.key` content.
    Key(KeyContent),
    /// An `m.key.verification.mac` content.
    Mac(MacContent),
    /// An `m.key.verification.cancel` content.
    Cancel(CancelContent),
    /// An `m.key.verification.done` content.
    Done(DoneContent),
}

impl VerificationContent {
    /// Get the event type of the content.
    pub fn event_type(&self) -> &'static str {
        match self {
            VerificationContent::Ready(_) => "m.key.verification.ready",
            VerificationContent::Start(_) => "m.key.verification.start",
            VerificationContent::Accept(_) => "m.key.verification.accept",
            VerificationContent::Key(_) => "m.key.verification.key",
            VerificationContent::Mac(_) => "m.key.verification.mac",
            VerificationContent::Cancel(_) => "m.key.verification.cancel",
            VerificationContent::Done(_) => "m.key.verification.done",
        }
    }

    /// Get the relation tying the content to its flow.
    pub fn relation(&self) -> &Relation {
        match self {
            VerificationContent::Ready(c) => &c.relation,
            VerificationContent::Start(c) => &c.relation,
            VerificationContent::Accept(c) => &c.relation,
            VerificationContent::Key(c) => &c.relation,
            VerificationContent::Mac(c) => &c.relation,
            VerificationContent::Cancel(c) => &c.relation,
            VerificationContent::Done(c) => &c.relation,
        }
    }

    /// Parse the content of the given event type, returns `None` if the event
    /// type isn't a verification event type we know about.
    pub fn from_parts(
        event_type: &str,
        content: &Value,
    ) -> Option<Result<Self, serde_json::Error>> {
        let suffix = event_type.strip_prefix(VERIFICATION_EVENT_PREFIX)?;

        let content = match suffix {
            "ready" => ReadyContent::deserialize(content).map(Self::Ready),
            "start" => StartContent::deserialize(content).map(Self::Start),
            "accept" => AcceptContent::deserialize(content).map(Self::Accept),
            "key" => KeyContent::deserialize(content).map(Self::Key),
            "mac" => MacContent::deserialize(content).map(Self::Mac),
            "cancel" => CancelContent::deserialize(content).map(Self::Cancel),
            "done" => DoneContent::deserialize(content).map(Self::Done),
            _ => return None,
        };

        Some(content)
    }
}

/// The content of a to-device verification event.
#[derive(Clone, Debug, Serialize)]
#[serde(untagged)]
pub enum ToDeviceVerificationContent {
    /// An `m.key.verification.request` content.
    Request(RequestContent),
    /// Any other verification content.
    Other(VerificationContent),
}

impl ToDeviceVerificationContent {
    /// Get the event type of the content.
    pub fn event_type(&self) -> &'static str {
        match self {
            ToDeviceVerificationContent::Request(_) => "m.key.verification.request",
            ToDeviceVerificationContent::Other(c) => c.event_type(),
        }
    }

    /// Parse the content of the given event type, returns `None` if the event
    /// type isn't a verification event type we know about.
    pub fn from_parts(
        event_type: &str,
        content: &Value,
    ) -> Option<Result<Self, serde_json::Error>> {
        if event_type == "m.key.verification.request" {
            Some(RequestContent::deserialize(content).map(Self::Request))
        } else {
            VerificationContent::from_parts(event_type, content).map(|c| c.map(Self::Other))
        }
    }
}

/// The content of an in-room verification event.
#[derive(Clone, Debug, Serialize)]
#[serde(untagged)]
pub enum RoomVerificationContent {
    /// An `m.room.message` with the `m.key.verification.request` msgtype.
    Request(RoomRequestContent),
    /// Any other verification content.
    Other(VerificationContent),
}

impl RoomVerificationContent {
    /// Get the event type of the content.
    pub fn event_type(&self) -> &'static str {
        match self {
            RoomVerificationContent::Request(_) => ROOM_MESSAGE_EVENT_TYPE,
            RoomVerificationContent::Other(c) => c.event_type(),
        }
    }

    /// Parse the content of the given event type, returns `None` if the event
    /// isn't an in-room verification event.
    pub fn from_parts(
        event_type: &str,
        content: &Value,
    ) -> Option<Result<Self, serde_json::Error>> {
        if event_type == ROOM_MESSAGE_EVENT_TYPE {
            let is_request = content.get("msgtype").and_then(Value::as_str)
                == Some("m.key.verification.request");

            is_request.then(|| RoomRequestContent::deserialize(content).map(Self::Request))
        } else {
            VerificationContent::from_parts(event_type, content).map(|c| c.map(Self::Other))
        }
    }
}
