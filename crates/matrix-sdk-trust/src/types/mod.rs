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

//! Module containing the types modeling Matrix device and cross-signing keys
//! as well as the to-device and room contents this crate exchanges.
//!
//! Keys deserialize directly into vodozemac key types where that is possible,
//! signatures that can't be decoded are kept around as
//! [`Signature::Invalid`] so they simply fail to verify later on.

mod cross_signing;
mod device_keys;
pub mod events;

use std::collections::BTreeMap;

use as_variant::as_variant;
pub use cross_signing::*;
pub use device_keys::*;
use ruma::{OwnedUserId, UserId};
use serde::{Deserialize, Serialize, Serializer};
use vodozemac::Ed25519Signature;

/// The prefix of every Ed25519 key ID.
pub(crate) const ED25519_PREFIX: &str = "ed25519:";
/// The prefix of every Curve25519 key ID.
pub(crate) const CURVE25519_PREFIX: &str = "curve25519:";

/// Build the ID of an Ed25519 key, `ed25519:{key_name}`.
pub fn ed25519_key_id(key_name: &str) -> String {
    format!("{ED25519_PREFIX}{key_name}")
}

/// Build the ID of a Curve25519 key, `curve25519:{key_name}`.
pub fn curve25519_key_id(key_name: &str) -> String {
    format!("{CURVE25519_PREFIX}{key_name}")
}

/// A single signature of a signed JSON object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Signature {
    /// A decoded Ed25519 signature.
    Ed25519(Ed25519Signature),
    /// A signature of an algorithm we don't know, kept as it was.
    Other(String),
    /// An `ed25519:` signature that isn't valid base64 or has the wrong
    /// length, kept as it was.
    Invalid(String),
}

impl Signature {
    /// The decoded Ed25519 signature.
    pub fn ed25519(&self) -> Option<Ed25519Signature> {
        as_variant!(self, Self::Ed25519).copied()
    }

    /// The signature the way it appears in JSON.
    pub fn to_base64(&self) -> String {
        match self {
            Signature::Ed25519(s) => s.to_base64(),
            Signature::Other(s) => s.to_owned(),
            Signature::Invalid(s) => s.to_owned(),
        }
    }
}

impl From<Ed25519Signature> for Signature {
    fn from(signature: Ed25519Signature) -> Self {
        Self::Ed25519(signature)
    }
}

/// The `signatures` field of a signed object, signatures keyed by the
/// signing user and then by the key ID.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Signatures(BTreeMap<OwnedUserId, BTreeMap<String, Signature>>);

impl Signatures {
    /// No signatures.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a signature, returns the one it replaced.
    pub fn add_signature(
        &mut self,
        signer: OwnedUserId,
        key_id: String,
        signature: Ed25519Signature,
    ) -> Option<Signature> {
        self.0.entry(signer).or_default().insert(key_id, signature.into())
    }

    /// Is there a signature of the given key, valid or not.
    pub fn contains(&self, signer: &UserId, key_id: &str) -> bool {
        self.get(signer).is_some_and(|s| s.contains_key(key_id))
    }

    /// The signatures of one signer.
    pub fn get(&self, signer: &UserId) -> Option<&BTreeMap<String, Signature>> {
        self.0.get(signer)
    }

    /// Add the signatures of another collection, overwriting ours on
    /// conflicts.
    pub fn merge(&mut self, other: Signatures) {
        for (user_id, signatures) in other.0 {
            self.0.entry(user_id).or_default().extend(signatures);
        }
    }

    /// Is nothing signed.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'de> Deserialize<'de> for Signatures {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let map: BTreeMap<OwnedUserId, BTreeMap<String, String>> =
            Deserialize::deserialize(deserializer)?;

        let map = map
            .into_iter()
            .map(|(user, signatures)| {
                let signatures = signatures
                    .into_iter()
                    .map(|(key_id, s)| {
                        let signature = if key_id.starts_with(ED25519_PREFIX) {
                            Ed25519Signature::from_base64(&s)
                                .map(Signature::from)
                                .unwrap_or(Signature::Invalid(s))
                        } else {
                            Signature::Other(s)
                        };

                        (key_id, signature)
                    })
                    .collect();

                (user, signatures)
            })
            .collect();

        Ok(Signatures(map))
    }
}

impl Serialize for Signatures {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let signatures: BTreeMap<&OwnedUserId, BTreeMap<&String, String>> = self
            .0
            .iter()
            .map(|(u, m)| (u, m.iter().map(|(d, s)| (d, s.to_base64())).collect()))
            .collect();

        Serialize::serialize(&signatures, serializer)
    }
}
