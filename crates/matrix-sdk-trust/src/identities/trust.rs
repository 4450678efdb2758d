// Copyright 2024 The Matrix.org Foundation C.I.C.
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

//! Trust computation over cross-signing signatures.
//!
//! The [`TrustEngine`] never fails and never touches the network, it answers
//! questions about a [`SignatureGraph`] snapshot. Anything that is missing or
//! doesn't verify results in an untrusted answer.

use std::collections::BTreeMap;

use ruma::{DeviceId, OwnedDeviceId, OwnedUserId, UserId};
use tracing::trace;

use super::{CrossSigningIdentity, Device, DeviceTrustLevel};
use crate::{
    error::SignatureError,
    olm::VerifyJson,
    types::{ed25519_key_id, CrossSigningKey, MasterPubkey},
};

/// The outcome of a user trust computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserTrustResult {
    /// The user is trusted.
    Success,
    /// The given user, usually our own, hasn't set up cross-signing.
    CrossSigningNotConfigured(OwnedUserId),
    /// We don't know the cross-signing keys of the given user.
    UnknownCrossSigningInfo(OwnedUserId),
    /// The cross-signing keys of the given user exist but can't be trusted.
    KeysNotTrusted(OwnedUserId),
    /// The given key doesn't carry the signature that would make it trusted.
    KeyNotSigned(CrossSigningKey),
    /// The given key carries a signature that doesn't verify.
    InvalidSignature(CrossSigningKey),
}

impl UserTrustResult {
    /// Is the user trusted.
    pub fn is_verified(&self) -> bool {
        matches!(self, UserTrustResult::Success)
    }
}

/// The outcome of a device trust computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceTrustResult {
    /// The device has the given trust level.
    Success(DeviceTrustLevel),
    /// We don't know the device.
    UnknownDevice(OwnedUserId, OwnedDeviceId),
    /// The given user hasn't set up cross-signing.
    CrossSigningNotConfigured(OwnedUserId),
    /// The cross-signing keys of the given user can't be trusted.
    KeysNotTrusted(OwnedUserId),
    /// The device isn't signed by the self-signing key of its owner.
    MissingDeviceSignature(OwnedUserId, OwnedDeviceId),
    /// The self-signing signature of the device doesn't verify.
    InvalidDeviceSignature(OwnedUserId, OwnedDeviceId),
}

impl DeviceTrustResult {
    /// The trust level of the device, failures result in the unset trust
    /// level.
    pub fn trust_level(&self) -> DeviceTrustLevel {
        match self {
            DeviceTrustResult::Success(level) => *level,
            _ => DeviceTrustLevel::default(),
        }
    }

    /// Is the device trusted by any means.
    pub fn is_verified(&self) -> bool {
        self.trust_level().is_verified()
    }

    /// Is the device signed by its owner's trusted self-signing key.
    pub fn is_cross_signing_verified(&self) -> bool {
        self.trust_level().cross_signing_verified
    }

    /// Was the device verified locally.
    pub fn is_locally_verified(&self) -> bool {
        self.trust_level().locally_verified
    }
}

/// A snapshot of the keys and signatures trust is computed from.
#[derive(Debug, Clone)]
pub struct SignatureGraph {
    /// Our own user ID.
    pub own_user_id: OwnedUserId,
    /// Our own public cross-signing identity, as published on the server.
    pub own_identity: Option<CrossSigningIdentity>,
    /// The public master key of the private cross-signing identity we hold.
    pub private_master_key: Option<MasterPubkey>,
    /// The cross-signing identities of other users.
    pub identities: BTreeMap<OwnedUserId, CrossSigningIdentity>,
    /// The known devices, our own devices included.
    pub devices: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, Device>>,
}

impl SignatureGraph {
    /// Create an empty graph for the given user.
    pub fn new(own_user_id: OwnedUserId) -> Self {
        Self {
            own_user_id,
            own_identity: None,
            private_master_key: None,
            identities: BTreeMap::new(),
            devices: BTreeMap::new(),
        }
    }

    /// Add a device to the graph.
    pub fn add_device(&mut self, device: Device) {
        self.devices
            .entry(device.user_id().to_owned())
            .or_default()
            .insert(device.device_id().to_owned(), device);
    }

    /// Add a cross-signing identity to the graph, our own identity included.
    pub fn add_identity(&mut self, identity: CrossSigningIdentity) {
        if identity.user_id() == self.own_user_id {
            self.own_identity = Some(identity);
        } else {
            self.identities.insert(identity.user_id().to_owned(), identity);
        }
    }

    fn get_device(&self, user_id: &UserId, device_id: &DeviceId) -> Option<&Device> {
        self.devices.get(user_id).and_then(|d| d.get(device_id))
    }
}

/// Computes the trust of users and devices from a [`SignatureGraph`].
#[derive(Debug, Clone, Copy)]
pub struct TrustEngine<'a> {
    graph: &'a SignatureGraph,
}

impl<'a> TrustEngine<'a> {
    /// Create a trust engine over the given snapshot.
    pub fn new(graph: &'a SignatureGraph) -> Self {
        Self { graph }
    }

    /// Is our own cross-signing set up, i.e. do we know our public
    /// identity. Without it only local verification counts.
    pub fn is_legacy_mode(&self) -> bool {
        self.graph.own_identity.is_none()
    }

    /// Compute the trust of the given user.
    ///
    /// Our own user is trusted if our master key is trusted and it signed
    /// our self-signing and user-signing keys. Other users are trusted if we
    /// are trusted and our user-signing key signed their master key.
    pub fn compute_user_trust(&self, user_id: &UserId) -> UserTrustResult {
        let result = if user_id == self.graph.own_user_id {
            self.check_own_identity().err().unwrap_or(UserTrustResult::Success)
        } else {
            self.check_other_identity(user_id).err().unwrap_or(UserTrustResult::Success)
        };

        trace!(?user_id, ?result, "Computed the trust of a user");

        result
    }

    /// Compute the trust of the given device.
    ///
    /// If the device isn't cross-signing verified but was verified locally,
    /// the local verification is reported as a success.
    pub fn compute_device_trust(&self, user_id: &UserId, device_id: &DeviceId) -> DeviceTrustResult {
        let Some(device) = self.graph.get_device(user_id, device_id) else {
            return DeviceTrustResult::UnknownDevice(user_id.to_owned(), device_id.to_owned());
        };

        let locally_verified = device.is_locally_trusted();

        let result = match self.check_device_signature(device) {
            Ok(()) => DeviceTrustResult::Success(DeviceTrustLevel {
                cross_signing_verified: true,
                locally_verified,
            }),
            Err(_) if locally_verified => DeviceTrustResult::Success(DeviceTrustLevel {
                cross_signing_verified: false,
                locally_verified: true,
            }),
            Err(failure) => failure,
        };

        trace!(?user_id, ?device_id, ?result, "Computed the trust of a device");

        result
    }

    /// Should the device be displayed as trusted.
    ///
    /// Cross-signing is the only signal once our own cross-signing is set up,
    /// local verification only counts in legacy mode.
    pub fn is_device_trusted_for_display(&self, user_id: &UserId, device_id: &DeviceId) -> bool {
        let level = self.compute_device_trust(user_id, device_id).trust_level();

        if self.is_legacy_mode() {
            level.locally_verified
        } else {
            level.cross_signing_verified
        }
    }

    fn own_user_id(&self) -> &UserId {
        &self.graph.own_user_id
    }

    fn is_own_master_key_trusted(&self, master_key: &MasterPubkey) -> bool {
        if self.graph.private_master_key.as_ref() == Some(master_key) {
            return true;
        }

        // A master key signed by one of our verified devices is trusted as well.
        self.graph.devices.get(self.own_user_id()).into_iter().flat_map(|d| d.values()).any(|d| {
            d.is_locally_trusted()
                && d.ed25519_key().is_some_and(|key| {
                    key.verify_json(
                        self.own_user_id(),
                        &ed25519_key_id(d.device_id().as_str()),
                        master_key.as_ref(),
                    )
                    .is_ok()
                })
        })
    }

    fn check_own_identity(&self) -> Result<&'a CrossSigningIdentity, UserTrustResult> {
        let own_user_id = self.own_user_id().to_owned();

        let identity = self
            .graph
            .own_identity
            .as_ref()
            .ok_or_else(|| UserTrustResult::CrossSigningNotConfigured(own_user_id.clone()))?;

        let master_key = identity.master_key();

        if !self.is_own_master_key_trusted(master_key) {
            return Err(UserTrustResult::KeysNotTrusted(own_user_id));
        }

        let user_signing_key = identity
            .user_signing_key()
            .ok_or_else(|| UserTrustResult::CrossSigningNotConfigured(own_user_id.clone()))?;

        master_key
            .verify_subkey(user_signing_key)
            .map_err(|e| signature_failure(e, user_signing_key.as_ref()))?;

        master_key
            .verify_subkey(identity.self_signing_key())
            .map_err(|e| signature_failure(e, identity.self_signing_key().as_ref()))?;

        Ok(identity)
    }

    fn check_other_identity(
        &self,
        user_id: &UserId,
    ) -> Result<&'a CrossSigningIdentity, UserTrustResult> {
        let own_identity = self.check_own_identity().map_err(|e| match e {
            e @ UserTrustResult::CrossSigningNotConfigured(_) => e,
            _ => UserTrustResult::KeysNotTrusted(self.own_user_id().to_owned()),
        })?;

        let identity = self
            .graph
            .identities
            .get(user_id)
            .ok_or_else(|| UserTrustResult::UnknownCrossSigningInfo(user_id.to_owned()))?;

        let user_signing_key = own_identity.user_signing_key().ok_or_else(|| {
            UserTrustResult::CrossSigningNotConfigured(self.own_user_id().to_owned())
        })?;

        user_signing_key
            .verify_master_key(identity.master_key())
            .map_err(|e| signature_failure(e, identity.master_key().as_ref()))?;

        // Their devices are signed by the self-signing key, so it has to chain
        // up to the master key we signed.
        identity
            .master_key()
            .verify_subkey(identity.self_signing_key())
            .map_err(|e| signature_failure(e, identity.self_signing_key().as_ref()))?;

        Ok(identity)
    }

    fn check_device_signature(&self, device: &Device) -> Result<(), DeviceTrustResult> {
        let user_id = device.user_id();

        let owner = if user_id == self.own_user_id() {
            self.check_own_identity()
        } else {
            self.check_other_identity(user_id)
        };

        let owner = owner.map_err(|e| match e {
            UserTrustResult::CrossSigningNotConfigured(user)
            | UserTrustResult::UnknownCrossSigningInfo(user) => {
                DeviceTrustResult::CrossSigningNotConfigured(user)
            }
            UserTrustResult::KeysNotTrusted(user) => DeviceTrustResult::KeysNotTrusted(user),
            UserTrustResult::KeyNotSigned(key) | UserTrustResult::InvalidSignature(key) => {
                DeviceTrustResult::KeysNotTrusted(key.user_id)
            }
            UserTrustResult::Success => DeviceTrustResult::KeysNotTrusted(user_id.to_owned()),
        })?;

        owner.self_signing_key().verify_device_keys(device.keys()).map_err(|e| match e {
            SignatureError::NoSignatureFound => DeviceTrustResult::MissingDeviceSignature(
                user_id.to_owned(),
                device.device_id().to_owned(),
            ),
            _ => DeviceTrustResult::InvalidDeviceSignature(
                user_id.to_owned(),
                device.device_id().to_owned(),
            ),
        })
    }
}

fn signature_failure(error: SignatureError, key: &CrossSigningKey) -> UserTrustResult {
    match error {
        SignatureError::NoSignatureFound => UserTrustResult::KeyNotSigned(key.clone()),
        _ => UserTrustResult::InvalidSignature(key.clone()),
    }
}
