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

use ruma::{DeviceId, UserId};
use serde::{Deserialize, Serialize};
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey};

use crate::{
    error::SignatureError,
    olm::VerifyJson,
    types::{ed25519_key_id, DeviceKeys, Signatures},
};

/// The local trust state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalTrust {
    /// The device has been verified and is trusted.
    Verified,
    /// The device been blacklisted from communicating.
    BlackListed,
    /// The trust state of the device is being ignored.
    Ignored,
    /// The trust state is unset.
    Unset,
}

/// The computed trust level of a device.
///
/// A device that is neither cross-signing verified nor locally verified has
/// the unset trust level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceTrustLevel {
    /// The device carries a valid signature of its owner's trusted
    /// self-signing key.
    pub cross_signing_verified: bool,
    /// The device was verified on this device, e.g. through an interactive
    /// verification.
    pub locally_verified: bool,
}

impl DeviceTrustLevel {
    /// Is the device trusted by any means.
    pub fn is_verified(&self) -> bool {
        self.cross_signing_verified || self.locally_verified
    }
}

/// A device of a user, as we learned it from a key query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    keys: DeviceKeys,
    local_trust: LocalTrust,
    deleted: bool,
}

impl Device {
    /// Create a new device, this constructor skips the verification of the
    /// self-signature, [`Device::try_from_keys`] should be used for new
    /// devices we receive.
    pub fn new(keys: DeviceKeys, local_trust: LocalTrust) -> Self {
        Self { keys, local_trust, deleted: false }
    }

    /// Create a new device from device keys we received, checking that the
    /// keys are signed by the device itself.
    pub fn try_from_keys(keys: DeviceKeys) -> Result<Self, SignatureError> {
        verify_self_signature(&keys)?;
        Ok(Self::new(keys, LocalTrust::Unset))
    }

    /// The user id of the device owner.
    pub fn user_id(&self) -> &UserId {
        &self.keys.user_id
    }

    /// The unique ID of the device.
    pub fn device_id(&self) -> &DeviceId {
        &self.keys.device_id
    }

    /// The device keys as published by the device.
    pub fn keys(&self) -> &DeviceKeys {
        &self.keys
    }

    /// Get the Ed25519 key of the device.
    pub fn ed25519_key(&self) -> Option<Ed25519PublicKey> {
        self.keys.ed25519_key()
    }

    /// Get the Curve25519 key of the device.
    pub fn curve25519_key(&self) -> Option<Curve25519PublicKey> {
        self.keys.curve25519_key()
    }

    /// Get a map containing all the device signatures.
    pub fn signatures(&self) -> &Signatures {
        &self.keys.signatures
    }

    /// Get the trust state of the device.
    pub fn local_trust_state(&self) -> LocalTrust {
        self.local_trust
    }

    /// Is the device locally marked as trusted.
    pub fn is_locally_trusted(&self) -> bool {
        self.local_trust == LocalTrust::Verified
    }

    /// Is the device locally marked as blacklisted.
    ///
    /// Blacklisted devices won't receive any room keys.
    pub fn is_blacklisted(&self) -> bool {
        self.local_trust == LocalTrust::BlackListed
    }

    /// Set the trust state of the device to the given state.
    ///
    /// The change only persists once the device is saved in the store.
    pub(crate) fn set_trust_state(&mut self, state: LocalTrust) {
        self.local_trust = state;
    }

    /// Is the device deleted.
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub(crate) fn mark_as_deleted(&mut self) {
        self.deleted = true;
    }

    /// Do the given device keys contain the same identity keys as this device.
    pub(crate) fn has_same_keys(&self, keys: &DeviceKeys) -> bool {
        self.ed25519_key() == keys.ed25519_key() && self.curve25519_key() == keys.curve25519_key()
    }

    /// Update the device with a new version of its keys.
    ///
    /// A change of the Ed25519 key is refused, the fingerprint of a device
    /// never changes. Returns true if the keys changed.
    pub(crate) fn update_keys(&mut self, keys: &DeviceKeys) -> Result<bool, SignatureError> {
        verify_self_signature(keys)?;

        if self.ed25519_key() != keys.ed25519_key() {
            return Err(SignatureError::MissingSigningKey);
        }

        if self.keys != *keys {
            self.keys = keys.clone();
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

fn verify_self_signature(keys: &DeviceKeys) -> Result<(), SignatureError> {
    let signing_key = keys.ed25519_key().ok_or(SignatureError::MissingSigningKey)?;

    signing_key.verify_json(&keys.user_id, &ed25519_key_id(keys.device_id.as_str()), keys)
}
