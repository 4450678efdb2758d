// Copyright 2023 The Matrix.org Foundation C.I.C.
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

use std::{collections::BTreeMap, fmt};

use async_trait::async_trait;
use ruma::{DeviceId, OwnedDeviceId, RoomId, TransactionId, UserId};

use super::{Changes, Result, TrackedUser};
use crate::{
    gossiping::{GossippedSecret, IncomingKeyRequest, OutgoingKeyRequest},
    identities::{CrossSigningIdentity, Device},
    olm::{InboundGroupSession, OutboundGroupSession, PrivateCrossSigningIdentity},
    types::events::{RoomKeyWithheldContent, SecretName},
};

/// Represents a store that the trust machine uses to persist devices,
/// identities, room keys and key requests.
///
/// All mutations go through [`CryptoStore::save_changes`], the store never
/// decides anything on its own.
#[async_trait]
pub trait CryptoStore: fmt::Debug + Send + Sync {
    /// Save the set of changes to the store.
    ///
    /// # Arguments
    ///
    /// * `changes` - The set of changes that should be stored.
    async fn save_changes(&self, changes: Changes) -> Result<()>;

    /// Load our private cross signing identity.
    async fn load_identity(&self) -> Result<Option<PrivateCrossSigningIdentity>>;

    /// Get the device for the given user with the given device ID.
    ///
    /// # Arguments
    ///
    /// * `user_id` - The user that the device belongs to.
    ///
    /// * `device_id` - The unique id of the device.
    async fn get_device(&self, user_id: &UserId, device_id: &DeviceId) -> Result<Option<Device>>;

    /// Get all the devices of the given user.
    ///
    /// Deleted devices aren't returned.
    async fn get_user_devices(&self, user_id: &UserId) -> Result<BTreeMap<OwnedDeviceId, Device>>;

    /// Get the public cross-signing identity of the given user.
    async fn get_user_identity(&self, user_id: &UserId) -> Result<Option<CrossSigningIdentity>>;

    /// Get the inbound group session of the given room with the given
    /// session ID.
    async fn get_inbound_group_session(
        &self,
        room_id: &RoomId,
        session_id: &str,
    ) -> Result<Option<InboundGroupSession>>;

    /// Get the outbound group session we use to encrypt events in the given
    /// room.
    async fn get_outbound_group_session(
        &self,
        room_id: &RoomId,
    ) -> Result<Option<OutboundGroupSession>>;

    /// Get the outgoing key request with the given request ID.
    async fn get_outgoing_key_request(
        &self,
        request_id: &TransactionId,
    ) -> Result<Option<OutgoingKeyRequest>>;

    /// Get the unresolved outgoing key request for the given room key, if any.
    async fn get_unresolved_key_request(
        &self,
        room_id: &RoomId,
        session_id: &str,
    ) -> Result<Option<OutgoingKeyRequest>>;

    /// Get all the outgoing key requests that still need to be sent out,
    /// requests and cancellations alike.
    async fn get_pending_key_requests(&self) -> Result<Vec<OutgoingKeyRequest>>;

    /// Delete the outgoing key request with the given request ID.
    async fn delete_outgoing_key_request(&self, request_id: &TransactionId) -> Result<()>;

    /// Get the history of processed incoming key requests, in processing
    /// order.
    async fn get_incoming_key_requests(&self) -> Result<Vec<IncomingKeyRequest>>;

    /// Get the users whose device lists we track.
    async fn load_tracked_users(&self) -> Result<Vec<TrackedUser>>;

    /// Do we have a secure channel to the device with the given Curve25519
    /// key.
    async fn has_olm_channel(&self, curve25519_key: &str) -> Result<bool>;

    /// Get the `m.room_key.withheld` content we received for the given room
    /// key, if any.
    async fn get_withheld_info(
        &self,
        room_id: &RoomId,
        session_id: &str,
    ) -> Result<Option<RoomKeyWithheldContent>>;

    /// Get a secret we hold, to share it with one of our other devices.
    async fn get_secret(&self, secret_name: &SecretName) -> Result<Option<String>>;

    /// Get the secrets with the given name our other devices sent us.
    async fn get_secrets_from_inbox(&self, secret_name: &SecretName)
        -> Result<Vec<GossippedSecret>>;

    /// Remove the secrets with the given name from the inbox.
    async fn delete_secrets_from_inbox(&self, secret_name: &SecretName) -> Result<()>;
}

