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

use std::{fmt, sync::Arc};

use ruma::{DeviceId, OwnedDeviceId, OwnedRoomId, RoomId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use vodozemac::{
    megolm::{
        ExportedSessionKey, GroupSession, InboundGroupSession as InnerSession, MegolmMessage,
        SessionConfig, SessionKey,
    },
    Curve25519PublicKey, Ed25519PublicKey,
};

use crate::{
    error::{MegolmError, MegolmResult},
    locks::Mutex,
    types::events::{ForwardedRoomKeyContent, RoomEncryptedContent, MEGOLM_V1_AES_SHA2},
};

/// The JSON payload a Megolm message encrypts.
#[derive(Debug, Deserialize, Serialize)]
pub(crate) struct MegolmPayload {
    #[serde(rename = "type")]
    pub event_type: String,
    pub content: Value,
    pub room_id: OwnedRoomId,
}

/// Inbound group session.
///
/// Inbound group sessions are used to exchange room messages between a group
/// of participants. Inbound group sessions are used to decrypt the room
/// messages.
#[derive(Clone)]
pub struct InboundGroupSession {
    inner: Arc<Mutex<InnerSession>>,
    session_id: Arc<str>,
    first_known_index: u32,
    room_id: OwnedRoomId,
    sender_key: Curve25519PublicKey,
    signing_key: Ed25519PublicKey,
    forwarding_chain: Vec<String>,
    imported: bool,
}

impl fmt::Debug for InboundGroupSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundGroupSession")
            .field("session_id", &self.session_id)
            .field("room_id", &self.room_id)
            .field("first_known_index", &self.first_known_index)
            .field("imported", &self.imported)
            .finish_non_exhaustive()
    }
}

impl InboundGroupSession {
    /// Create a new inbound group session for the given room.
    ///
    /// # Arguments
    ///
    /// * `sender_key` - The public Curve25519 key of the account that sent us
    ///   the session.
    ///
    /// * `signing_key` - The public Ed25519 key of the account that sent us
    ///   the session.
    ///
    /// * `room_id` - The id of the room that the session is used in.
    ///
    /// * `session_key` - The private session key that is used to decrypt
    ///   messages.
    pub fn new(
        sender_key: Curve25519PublicKey,
        signing_key: Ed25519PublicKey,
        room_id: OwnedRoomId,
        session_key: &SessionKey,
    ) -> Self {
        let session = InnerSession::new(session_key, SessionConfig::version_1());
        let session_id = session.session_id();
        let first_known_index = session.first_known_index();

        Self {
            inner: Arc::new(Mutex::new(session)),
            session_id: session_id.into(),
            first_known_index,
            room_id,
            sender_key,
            signing_key,
            forwarding_chain: Vec::new(),
            imported: false,
        }
    }

    /// Create an imported inbound group session from a forwarded room key.
    ///
    /// # Arguments
    ///
    /// * `forwarder_key` - The Curve25519 key of the device that forwarded the
    ///   key to us, it's appended to the forwarding chain.
    ///
    /// * `content` - The content of the `m.forwarded_room_key` event.
    pub fn from_forwarded_key(
        forwarder_key: Option<&str>,
        content: &ForwardedRoomKeyContent,
    ) -> MegolmResult<Self> {
        let session_key = ExportedSessionKey::from_base64(&content.session_key)?;
        let session = InnerSession::import(&session_key, SessionConfig::version_1());

        let session_id = session.session_id();

        if session_id != content.session_id {
            return Err(MegolmError::MismatchedSessionId);
        }

        let first_known_index = session.first_known_index();

        let mut forwarding_chain = content.forwarding_curve25519_key_chain.clone();
        forwarding_chain.extend(forwarder_key.map(ToOwned::to_owned));

        Ok(Self {
            inner: Arc::new(Mutex::new(session)),
            session_id: session_id.into(),
            first_known_index,
            room_id: content.room_id.clone(),
            sender_key: Curve25519PublicKey::from_base64(&content.sender_key)?,
            signing_key: Ed25519PublicKey::from_base64(&content.sender_claimed_ed25519_key)?,
            forwarding_chain,
            imported: true,
        })
    }

    /// Returns the unique identifier for this session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The room where this session is used in.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// The Curve25519 key of the device that created the session.
    pub fn sender_key(&self) -> Curve25519PublicKey {
        self.sender_key
    }

    /// The Ed25519 key the creator of the session claims to own.
    pub fn signing_key(&self) -> Ed25519PublicKey {
        self.signing_key
    }

    /// Get the first message index we know how to decrypt.
    pub fn first_known_index(&self) -> u32 {
        self.first_known_index
    }

    /// Has the session been imported from a forwarded room key.
    pub fn is_imported(&self) -> bool {
        self.imported
    }

    /// The chain of Curve25519 keys of the devices that forwarded this
    /// session to us.
    pub fn forwarding_chain(&self) -> &[String] {
        &self.forwarding_chain
    }

    /// Is this session a better version of the given session, i.e. can it
    /// decrypt more messages.
    pub fn is_better_than(&self, other: &InboundGroupSession) -> bool {
        self.session_id == other.session_id && self.first_known_index < other.first_known_index
    }

    /// Export this session at the first known message index.
    pub fn export_at_first_known_index(&self) -> ExportedSessionKey {
        self.inner.lock().export_at_first_known_index()
    }

    /// Build the content that forwards this session to another device.
    ///
    /// # Arguments
    ///
    /// * `our_curve25519_key` - The Curve25519 key of our own device, it's
    ///   appended to the forwarding chain if we aren't the creator of the
    ///   session.
    pub fn to_forwarded_room_key_content(
        &self,
        our_curve25519_key: Curve25519PublicKey,
    ) -> ForwardedRoomKeyContent {
        let mut forwarding_curve25519_key_chain = self.forwarding_chain.clone();

        if self.imported {
            forwarding_curve25519_key_chain.push(our_curve25519_key.to_base64());
        }

        ForwardedRoomKeyContent {
            algorithm: MEGOLM_V1_AES_SHA2.to_owned(),
            room_id: self.room_id.clone(),
            sender_key: self.sender_key.to_base64(),
            session_id: self.session_id.to_string(),
            session_key: self.export_at_first_known_index().to_base64(),
            sender_claimed_ed25519_key: self.signing_key.to_base64(),
            forwarding_curve25519_key_chain,
        }
    }

    /// Decrypt the given room event content.
    ///
    /// Returns the decrypted payload and the message index of the event.
    pub(crate) fn decrypt(
        &self,
        content: &RoomEncryptedContent,
    ) -> MegolmResult<(MegolmPayload, u32)> {
        let message = MegolmMessage::from_base64(&content.ciphertext)?;
        let decrypted = self.inner.lock().decrypt(&message)?;

        let payload: MegolmPayload = serde_json::from_slice(&decrypted.plaintext)?;

        if payload.room_id != self.room_id {
            return Err(MegolmError::MismatchedRoom(payload.room_id));
        }

        Ok((payload, decrypted.message_index))
    }
}

/// Outbound group session.
///
/// Outbound group sessions are used to encrypt room messages for a room, the
/// matching [`InboundGroupSession`] decrypts them.
#[derive(Clone)]
pub struct OutboundGroupSession {
    inner: Arc<Mutex<GroupSession>>,
    session_id: Arc<str>,
    device_id: OwnedDeviceId,
    sender_key: Curve25519PublicKey,
    room_id: OwnedRoomId,
}

impl fmt::Debug for OutboundGroupSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundGroupSession")
            .field("session_id", &self.session_id)
            .field("room_id", &self.room_id)
            .finish_non_exhaustive()
    }
}

impl OutboundGroupSession {
    /// Create a new outbound group session for the given room.
    pub(crate) fn new(
        device_id: OwnedDeviceId,
        sender_key: Curve25519PublicKey,
        room_id: OwnedRoomId,
    ) -> Self {
        let session = GroupSession::new(SessionConfig::version_1());
        let session_id = session.session_id();

        Self {
            inner: Arc::new(Mutex::new(session)),
            session_id: session_id.into(),
            device_id,
            sender_key,
            room_id,
        }
    }

    /// Returns the unique identifier for this session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The room where this session is used in.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// The device that created this session.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Get the session key of this session, at its current message index.
    pub fn session_key(&self) -> SessionKey {
        self.inner.lock().session_key()
    }

    /// Get the current message index of this session.
    pub fn message_index(&self) -> u32 {
        self.inner.lock().message_index()
    }

    /// Encrypt a room message content for the room of this session.
    pub(crate) fn encrypt(
        &self,
        event_type: &str,
        content: Value,
    ) -> MegolmResult<RoomEncryptedContent> {
        let payload = MegolmPayload {
            event_type: event_type.to_owned(),
            content,
            room_id: self.room_id.clone(),
        };

        let plaintext = serde_json::to_string(&payload)?;
        let ciphertext = self.inner.lock().encrypt(plaintext).to_base64();

        Ok(RoomEncryptedContent {
            algorithm: MEGOLM_V1_AES_SHA2.to_owned(),
            ciphertext,
            sender_key: self.sender_key.to_base64(),
            device_id: self.device_id.clone(),
            session_id: self.session_id.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_matches;
    use ruma::{device_id, room_id, user_id};
    use serde_json::json;

    use super::InboundGroupSession;
    use crate::{error::MegolmError, olm::Account};

    #[test]
    fn forwarded_sessions_decrypt_later_messages() {
        let account = Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));
        let (outbound, inbound) =
            account.static_data().create_group_session_pair(room_id!("!test:localhost").to_owned());

        let first = outbound.encrypt("m.room.message", json!({ "body": "first" })).unwrap();
        let second = outbound.encrypt("m.room.message", json!({ "body": "second" })).unwrap();

        let (payload, index) = inbound.decrypt(&first).unwrap();
        assert_eq!(index, 0);
        assert_eq!(payload.content["body"], "first");

        let forwarded = inbound.to_forwarded_room_key_content(account.identity_keys().curve25519);
        assert!(forwarded.forwarding_curve25519_key_chain.is_empty());

        let imported = InboundGroupSession::from_forwarded_key(Some("forwarder"), &forwarded)
            .unwrap();
        assert!(imported.is_imported());
        assert_eq!(imported.forwarding_chain(), ["forwarder".to_owned()]);
        assert_eq!(imported.session_id(), inbound.session_id());

        let (payload, index) = imported.decrypt(&second).unwrap();
        assert_eq!(index, 1);
        assert_eq!(payload.content["body"], "second");
    }

    #[test]
    fn sessions_reject_events_of_other_rooms() {
        let account = Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));
        let (outbound, inbound) =
            account.static_data().create_group_session_pair(room_id!("!test:localhost").to_owned());

        let mut forwarded =
            inbound.to_forwarded_room_key_content(account.identity_keys().curve25519);
        forwarded.room_id = room_id!("!other:localhost").to_owned();

        let imported = InboundGroupSession::from_forwarded_key(None, &forwarded).unwrap();
        let encrypted = outbound.encrypt("m.room.message", json!({ "body": "hello" })).unwrap();

        assert_matches!(imported.decrypt(&encrypted), Err(MegolmError::MismatchedRoom(_)));
    }
}
