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

//! Types and traits to implement the storage layer for the [`TrustMachine`].
//!
//! The storage layer persists devices, cross-signing identities, room keys
//! and the state of room key requests. Trust itself is never stored, it's
//! computed from the stored keys every time it's needed.
//!
//! An in-memory only store is provided as [`MemoryStore`]; other stores need
//! to implement the [`CryptoStore`] trait.
//!
//! [`TrustMachine`]: crate::TrustMachine

use std::{collections::BTreeMap, ops::Deref, sync::Arc, time::Duration};

use futures_core::Stream;
use ruma::{time::Instant, DeviceId, OwnedDeviceId, OwnedRoomId, OwnedUserId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Error as SerdeError;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::trace;
use vodozemac::Curve25519PublicKey;

use crate::{
    gossiping::{GossippedSecret, IncomingKeyRequest, OutgoingKeyRequest},
    identities::{CrossSigningIdentity, Device, SignatureGraph},
    locks::Mutex,
    olm::{
        InboundGroupSession, OutboundGroupSession, PrivateCrossSigningIdentity, StaticAccountData,
    },
    types::events::{RoomKeyWithheldContent, SecretName, MEGOLM_V1_AES_SHA2},
};

mod memorystore;
mod traits;

pub use memorystore::MemoryStore;
pub use traits::CryptoStore;

/// Result of a store operation.
pub type Result<T, E = CryptoStoreError> = std::result::Result<T, E>;

/// Errors a [`CryptoStore`] can return.
#[derive(Debug, Error)]
pub enum CryptoStoreError {
    /// The database or whatever else persists the data failed.
    #[error(transparent)]
    Backend(Box<dyn std::error::Error + Send + Sync>),

    /// A stored value couldn't be serialized or deserialized.
    #[error(transparent)]
    Serialization(#[from] SerdeError),
}

impl CryptoStoreError {
    /// Wrap an error of a store implementation.
    pub fn backend<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend(Box::new(error))
    }
}

/// A user whose devices and cross-signing keys we keep up to date.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrackedUser {
    /// The tracked user.
    pub user_id: OwnedUserId,
    /// Our copy of the keys may be stale, the user is part of the next key
    /// query.
    pub dirty: bool,
}

/// Everything a single operation wants to persist, saved in one go.
#[derive(Default, Debug)]
#[allow(missing_docs)]
pub struct Changes {
    pub private_identity: Option<PrivateCrossSigningIdentity>,
    pub identities: Vec<CrossSigningIdentity>,
    pub devices: DeviceChanges,
    pub inbound_group_sessions: Vec<InboundGroupSession>,
    pub outbound_group_sessions: Vec<OutboundGroupSession>,
    pub key_requests: Vec<OutgoingKeyRequest>,
    pub incoming_key_requests: Vec<IncomingKeyRequest>,
    /// Withheld notices we received for room keys.
    pub withheld_session_info: Vec<RoomKeyWithheldContent>,
    /// Curve25519 keys of devices we established a secure channel with.
    pub olm_channels: Vec<String>,
    pub tracked_users: Vec<TrackedUser>,
    /// Secrets we hold, they are shared with our other devices on request.
    pub secrets: Vec<(SecretName, String)>,
    /// Secrets our other devices sent us.
    pub secrets_inbox: Vec<GossippedSecret>,
}

impl Changes {
    /// Is there nothing to save.
    pub fn is_empty(&self) -> bool {
        self.private_identity.is_none()
            && self.identities.is_empty()
            && self.devices.is_empty()
            && self.inbound_group_sessions.is_empty()
            && self.outbound_group_sessions.is_empty()
            && self.key_requests.is_empty()
            && self.incoming_key_requests.is_empty()
            && self.withheld_session_info.is_empty()
            && self.olm_channels.is_empty()
            && self.tracked_users.is_empty()
            && self.secrets.is_empty()
            && self.secrets_inbox.is_empty()
    }
}

/// Device changes coming from a key query or a local trust change.
#[derive(Debug, Clone, Default)]
#[allow(missing_docs)]
pub struct DeviceChanges {
    pub new: Vec<Device>,
    pub changed: Vec<Device>,
    pub deleted: Vec<Device>,
}

impl DeviceChanges {
    /// Add the changes of another batch to this one.
    pub fn extend(&mut self, other: DeviceChanges) {
        self.new.extend(other.new);
        self.changed.extend(other.changed);
        self.deleted.extend(other.deleted);
    }

    /// Is there no device to save.
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.changed.is_empty() && self.deleted.is_empty()
    }
}

/// Identifies a room key we stored, broadcast to the listeners of
/// [`TrustMachine::room_keys_received_stream`](crate::TrustMachine::room_keys_received_stream).
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct RoomKeyInfo {
    /// Always `m.megolm.v1.aes-sha2`.
    pub algorithm: String,
    /// The room the key decrypts messages of.
    pub room_id: OwnedRoomId,
    /// The Curve25519 key of the device that created the session.
    pub sender_key: Curve25519PublicKey,
    /// The Megolm session ID.
    pub session_id: String,
}

impl From<&InboundGroupSession> for RoomKeyInfo {
    fn from(group_session: &InboundGroupSession) -> Self {
        RoomKeyInfo {
            algorithm: MEGOLM_V1_AES_SHA2.to_owned(),
            room_id: group_session.room_id().to_owned(),
            sender_key: group_session.sender_key(),
            session_id: group_session.session_id().to_owned(),
        }
    }
}

/// A wrapper around the [`CryptoStore`] implementation that knows who we are
/// and notifies listeners about room keys we receive.
#[derive(Debug, Clone)]
pub(crate) struct Store {
    inner: Arc<StoreInner>,
}

#[derive(Debug)]
struct StoreInner {
    static_account: StaticAccountData,
    store: Arc<dyn CryptoStore>,
    /// The sender side of a broadcast stream that is notified whenever we get
    /// an update to an inbound group session.
    room_keys_received_sender: broadcast::Sender<Vec<RoomKeyInfo>>,
    /// When our own devices were last verified interactively.
    recently_verified: Mutex<BTreeMap<OwnedDeviceId, Instant>>,
}

impl Store {
    pub(crate) fn new(static_account: StaticAccountData, store: Arc<dyn CryptoStore>) -> Self {
        let room_keys_received_sender = broadcast::Sender::new(10);

        Self {
            inner: Arc::new(StoreInner {
                static_account,
                store,
                room_keys_received_sender,
                recently_verified: Default::default(),
            }),
        }
    }

    pub(crate) fn static_account(&self) -> &StaticAccountData {
        &self.inner.static_account
    }

    pub(crate) fn user_id(&self) -> &UserId {
        &self.inner.static_account.user_id
    }

    pub(crate) fn device_id(&self) -> &DeviceId {
        &self.inner.static_account.device_id
    }

    pub(crate) fn crypto_store(&self) -> Arc<dyn CryptoStore> {
        self.inner.store.clone()
    }

    /// Save the changes and notify listeners about new room keys.
    pub(crate) async fn save_changes(&self, changes: Changes) -> Result<()> {
        let room_key_updates: Vec<_> =
            changes.inbound_group_sessions.iter().map(RoomKeyInfo::from).collect();

        self.inner.store.save_changes(changes).await?;

        if !room_key_updates.is_empty() {
            trace!(?room_key_updates, "Broadcasting room key updates");
            // There might not be any receivers, that's fine.
            let _ = self.inner.room_keys_received_sender.send(room_key_updates);
        }

        Ok(())
    }

    /// Save a single device, e.g. after its local trust changed.
    pub(crate) async fn save_device(&self, device: Device) -> Result<()> {
        let changes = Changes {
            devices: DeviceChanges { changed: vec![device], ..Default::default() },
            ..Default::default()
        };

        self.save_changes(changes).await
    }

    /// Remember that one of our own devices was just verified interactively.
    pub(crate) fn mark_device_as_recently_verified(&self, device_id: &DeviceId) {
        self.inner.recently_verified.lock().insert(device_id.to_owned(), Instant::now());
    }

    /// Was the given device of ours verified interactively within the given
    /// window.
    pub(crate) fn was_recently_verified(&self, device_id: &DeviceId, window: Duration) -> bool {
        self.inner.recently_verified.lock().get(device_id).is_some_and(|t| t.elapsed() <= window)
    }

    /// Load the snapshot of keys and signatures needed to compute the trust of
    /// our own user and the given user.
    pub(crate) async fn signature_graph(&self, user_id: &UserId) -> Result<SignatureGraph> {
        let mut graph = SignatureGraph::new(self.user_id().to_owned());

        graph.private_master_key =
            self.inner.store.load_identity().await?.map(|i| i.master_public_key());

        let mut users = vec![self.user_id()];
        if user_id != self.user_id() {
            users.push(user_id);
        }

        for user in users {
            if let Some(identity) = self.inner.store.get_user_identity(user).await? {
                graph.add_identity(identity);
            }

            for device in self.inner.store.get_user_devices(user).await?.into_values() {
                graph.add_device(device);
            }
        }

        Ok(graph)
    }

    /// Listen for room keys being stored, keys saved together arrive as one
    /// batch.
    pub(crate) fn room_keys_received_stream(
        &self,
    ) -> impl Stream<Item = Result<Vec<RoomKeyInfo>, BroadcastStreamRecvError>> + use<> {
        BroadcastStream::new(self.inner.room_keys_received_sender.subscribe())
    }
}

impl Deref for Store {
    type Target = dyn CryptoStore;

    fn deref(&self) -> &Self::Target {
        self.inner.store.deref()
    }
}
