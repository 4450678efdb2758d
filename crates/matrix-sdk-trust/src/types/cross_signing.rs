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

use std::{collections::BTreeMap, fmt};

use ruma::{OwnedUserId, UserId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use vodozemac::Ed25519PublicKey;

use super::{ed25519_key_id, DeviceKeys, Signatures, ED25519_PREFIX};
use crate::{
    error::SignatureError,
    olm::{SignedJsonObject, VerifyJson},
};

/// The role of a cross-signing key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyUsage {
    /// The master key, the root of a user's cross-signing identity.
    Master,
    /// The self-signing key, signs the user's own devices.
    SelfSigning,
    /// The user-signing key, signs the master keys of other users.
    UserSigning,
}

impl fmt::Display for KeyUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let usage = match self {
            KeyUsage::Master => "master",
            KeyUsage::SelfSigning => "self_signing",
            KeyUsage::UserSigning => "user_signing",
        };

        f.write_str(usage)
    }
}

/// A cross-signing key as uploaded to and returned by the server.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CrossSigningKey {
    /// The ID of the user the key belongs to.
    pub user_id: OwnedUserId,

    /// What the key is used for.
    pub usage: Vec<KeyUsage>,

    /// The public key, a map from `ed25519:{public key}` to the base64 encoded
    /// public key.
    pub keys: BTreeMap<String, String>,

    /// Signatures of the key.
    #[serde(default)]
    pub signatures: Signatures,
}

impl CrossSigningKey {
    /// Create a new cross-signing key with a single usage for the given
    /// public key.
    pub fn new(user_id: OwnedUserId, usage: KeyUsage, public_key: Ed25519PublicKey) -> Self {
        let public_key = public_key.to_base64();
        let keys = BTreeMap::from([(ed25519_key_id(&public_key), public_key)]);

        Self { user_id, usage: vec![usage], keys, signatures: Signatures::new() }
    }

    /// Get the first Ed25519 key and its key ID.
    ///
    /// There's usually only a single key so this will usually fetch the
    /// only key. Keys that fail to decode are skipped.
    pub fn get_first_key_and_id(&self) -> Option<(&str, Ed25519PublicKey)> {
        self.keys.iter().find_map(|(key_id, key)| {
            key_id
                .starts_with(ED25519_PREFIX)
                .then(|| Ed25519PublicKey::from_base64(key).ok())
                .flatten()
                .map(|key| (key_id.as_str(), key))
        })
    }

    /// Check that this key carries a valid signature of the given signing
    /// key, made by the owner of this key.
    pub(crate) fn verify_signature_of(
        &self,
        signer: &CrossSigningKey,
    ) -> Result<(), SignatureError> {
        if self.user_id != signer.user_id {
            return Err(SignatureError::UserIdMismatch);
        }

        let (key_id, key) =
            signer.get_first_key_and_id().ok_or(SignatureError::UnsupportedAlgorithm)?;
        key.verify_json(&signer.user_id, key_id, self)
    }
}

impl SignedJsonObject for CrossSigningKey {
    fn signatures(&self) -> &Signatures {
        &self.signatures
    }
}

/// Error returned when a cross-signing key is used in a role its usage
/// doesn't allow.
#[derive(Debug, Error)]
#[error("Expected cross signing key usage {expected} was not found")]
pub struct InvalidKeyUsage {
    /// The usage the key should have had.
    pub expected: KeyUsage,
}

macro_rules! cross_signing_key_wrapper {
    ($(#[$meta:meta])* $name:ident, $usage:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Serialize, Deserialize)]
        #[serde(try_from = "CrossSigningKey")]
        pub struct $name(CrossSigningKey);

        impl $name {
            /// Wrap a freshly created public key of the given user.
            pub(crate) fn from_public_key(user_id: OwnedUserId, public_key: Ed25519PublicKey) -> Self {
                Self(CrossSigningKey::new(user_id, $usage, public_key))
            }

            /// Get the user id of the key's owner.
            pub fn user_id(&self) -> &UserId {
                &self.0.user_id
            }

            /// Get the keys map of the key.
            pub fn keys(&self) -> &BTreeMap<String, String> {
                &self.0.keys
            }

            /// Get the list of `KeyUsage` that is set for this key.
            pub fn usage(&self) -> &[KeyUsage] {
                &self.0.usage
            }

            /// Get the signatures of the key.
            pub fn signatures(&self) -> &Signatures {
                &self.0.signatures
            }

            /// Get the first available public key.
            pub fn get_first_key(&self) -> Option<Ed25519PublicKey> {
                self.0.get_first_key_and_id().map(|(_, k)| k)
            }

            /// Get the ID of the first available public key.
            pub fn key_id(&self) -> Option<&str> {
                self.0.get_first_key_and_id().map(|(id, _)| id)
            }
        }

        impl TryFrom<CrossSigningKey> for $name {
            type Error = InvalidKeyUsage;

            fn try_from(key: CrossSigningKey) -> Result<Self, Self::Error> {
                if key.usage == [$usage] {
                    Ok(Self(key))
                } else {
                    Err(InvalidKeyUsage { expected: $usage })
                }
            }
        }

        impl AsRef<CrossSigningKey> for $name {
            fn as_ref(&self) -> &CrossSigningKey {
                &self.0
            }
        }

        impl AsMut<CrossSigningKey> for $name {
            fn as_mut(&mut self) -> &mut CrossSigningKey {
                &mut self.0
            }
        }

        impl PartialEq for $name {
            /// Compares the user ID, the usage and the key material, signatures
            /// are provided by others and don't alter the identity of the key.
            fn eq(&self, other: &Self) -> bool {
                self.user_id() == other.user_id()
                    && self.keys() == other.keys()
                    && self.usage() == other.usage()
            }
        }

        impl Eq for $name {}
    };
}

cross_signing_key_wrapper!(
    /// Wrapper for a cross signing key marking it as the master key.
    ///
    /// Master keys are the root of a user's cross-signing identity, they sign
    /// the self-signing and user-signing keys.
    MasterPubkey,
    KeyUsage::Master
);

cross_signing_key_wrapper!(
    /// Wrapper for a cross signing key marking it as a self signing key.
    ///
    /// Self signing keys are used to sign the user's own devices.
    SelfSigningPubkey,
    KeyUsage::SelfSigning
);

cross_signing_key_wrapper!(
    /// Wrapper for a cross signing key marking it as a user signing key.
    ///
    /// User signing keys are used to sign the master keys of other users.
    UserSigningPubkey,
    KeyUsage::UserSigning
);

impl MasterPubkey {
    /// Check that the given subkey carries a valid signature of this master
    /// key.
    pub fn verify_subkey(&self, subkey: &impl AsRef<CrossSigningKey>) -> Result<(), SignatureError> {
        subkey.as_ref().verify_signature_of(&self.0)
    }
}

impl SelfSigningPubkey {
    /// Verify that the [`DeviceKeys`] have a valid signature from this
    /// self-signing key.
    pub fn verify_device_keys(&self, device_keys: &DeviceKeys) -> Result<(), SignatureError> {
        if device_keys.user_id != self.0.user_id {
            return Err(SignatureError::UserIdMismatch);
        }

        let (key_id, key) =
            self.0.get_first_key_and_id().ok_or(SignatureError::UnsupportedAlgorithm)?;
        key.verify_json(&self.0.user_id, key_id, device_keys)
    }
}

impl UserSigningPubkey {
    /// Check if the given master key is signed by this user signing key.
    ///
    /// The master key usually belongs to another user.
    pub fn verify_master_key(&self, master_key: &MasterPubkey) -> Result<(), SignatureError> {
        let (key_id, key) =
            self.0.get_first_key_and_id().ok_or(SignatureError::UnsupportedAlgorithm)?;
        key.verify_json(&self.0.user_id, key_id, master_key.as_ref())
    }
}
