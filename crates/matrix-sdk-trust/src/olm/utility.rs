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

use ruma::{CanonicalJsonValue, UserId};
use serde::Serialize;
use vodozemac::{Ed25519Keypair, Ed25519PublicKey, Ed25519Signature};

use crate::{error::SignatureError, types::Signatures};

/// An object that carries signatures over its canonical JSON form.
pub trait SignedJsonObject: Serialize {
    /// The signatures of the object.
    fn signatures(&self) -> &Signatures;
}

/// Convert the object into the canonical JSON string that gets signed.
///
/// The `signatures` and `unsigned` fields aren't part of the signed data.
pub(crate) fn to_signable_json(object: &impl Serialize) -> Result<String, SignatureError> {
    let mut json = serde_json::to_value(object)?;

    let json_object = json.as_object_mut().ok_or(SignatureError::NotAnObject)?;
    json_object.remove("signatures");
    json_object.remove("unsigned");

    let canonical_json: CanonicalJsonValue = json.try_into()?;

    Ok(canonical_json.to_string())
}

/// Sign the canonical JSON form of the given object.
pub(crate) fn sign_json(
    key: &Ed25519Keypair,
    object: &impl Serialize,
) -> Result<Ed25519Signature, SignatureError> {
    let canonical_json = to_signable_json(object)?;
    Ok(key.sign(canonical_json.as_bytes()))
}

/// Verify signatures of signed JSON objects.
pub trait VerifyJson {
    /// Verify a signed JSON object.
    ///
    /// The object must have a signatures field of the form
    /// `user_id: {key_id: signature}`.
    ///
    /// Returns Ok if the signature was successfully verified, otherwise an
    /// SignatureError.
    ///
    /// # Arguments
    ///
    /// * `user_id` - The user who signed the JSON object.
    ///
    /// * `key_id` - The id of the key that signed the JSON object.
    ///
    /// * `signed_object` - The object that should be verified.
    fn verify_json(
        &self,
        user_id: &UserId,
        key_id: &str,
        signed_object: &impl SignedJsonObject,
    ) -> Result<(), SignatureError>;
}

impl VerifyJson for Ed25519PublicKey {
    fn verify_json(
        &self,
        user_id: &UserId,
        key_id: &str,
        signed_object: &impl SignedJsonObject,
    ) -> Result<(), SignatureError> {
        let signatures = signed_object.signatures();

        let signature = match signatures.get(user_id).and_then(|s| s.get(key_id)) {
            Some(signature) => signature.ed25519().ok_or(SignatureError::InvalidSignature)?,
            None => return Err(SignatureError::NoSignatureFound),
        };

        let canonical_json = to_signable_json(signed_object)?;
        self.verify(canonical_json.as_bytes(), &signature)?;

        Ok(())
    }
}
