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

use std::collections::BTreeMap;

use ruma::{OwnedDeviceId, OwnedUserId};
use serde::{Deserialize, Serialize};
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey};

use super::{curve25519_key_id, ed25519_key_id, Signatures};
use crate::olm::SignedJsonObject;

/// The algorithms a device advertises support for.
pub(crate) const SUPPORTED_ALGORITHMS: &[&str] =
    &["m.olm.v1.curve25519-aes-sha2", "m.megolm.v1.aes-sha2"];

/// Identity keys for a device, as uploaded to and returned by the server.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct DeviceKeys {
    /// The ID of the user the device belongs to.
    pub user_id: OwnedUserId,

    /// The ID of the device these keys belong to.
    pub device_id: OwnedDeviceId,

    /// The encryption algorithms supported by this device.
    pub algorithms: Vec<String>,

    /// Public identity keys, a map from `algorithm:device_id` to the base64
    /// encoded key.
    pub keys: BTreeMap<String, String>,

    /// Signatures for the device key object.
    #[serde(default)]
    pub signatures: Signatures,
}

impl DeviceKeys {
    /// Get the Ed25519 fingerprint key of the device, if it's present and
    /// valid.
    pub fn ed25519_key(&self) -> Option<Ed25519PublicKey> {
        let key = self.keys.get(&ed25519_key_id(self.device_id.as_str()))?;
        Ed25519PublicKey::from_base64(key).ok()
    }

    /// Get the Curve25519 identity key of the device, if it's present and
    /// valid.
    pub fn curve25519_key(&self) -> Option<Curve25519PublicKey> {
        let key = self.keys.get(&curve25519_key_id(self.device_id.as_str()))?;
        Curve25519PublicKey::from_base64(key).ok()
    }
}

impl SignedJsonObject for DeviceKeys {
    fn signatures(&self) -> &Signatures {
        &self.signatures
    }
}

/// A signed Curve25519 one-time key, as uploaded to and claimed from the
/// server.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct SignedKey {
    /// The base64 encoded public key.
    pub key: String,

    /// Signatures for the key object.
    #[serde(default)]
    pub signatures: Signatures,
}

impl SignedKey {
    /// Create a new, unsigned, one-time key object.
    pub fn new(key: Curve25519PublicKey) -> Self {
        Self { key: key.to_base64(), signatures: Signatures::new() }
    }

    /// Get the decoded public key, if it's valid.
    pub fn curve25519_key(&self) -> Option<Curve25519PublicKey> {
        Curve25519PublicKey::from_base64(&self.key).ok()
    }
}

impl SignedJsonObject for SignedKey {
    fn signatures(&self) -> &Signatures {
        &self.signatures
    }
}
