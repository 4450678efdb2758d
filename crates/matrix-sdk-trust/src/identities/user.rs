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

use ruma::UserId;
use serde::{Deserialize, Serialize};

use crate::{
    error::SignatureError,
    types::{MasterPubkey, SelfSigningPubkey, UserSigningPubkey},
};

/// The public cross-signing identity of a user.
///
/// The identity itself carries no trust, whether it can be trusted is
/// computed by the [`TrustEngine`](super::TrustEngine) every time it's
/// needed. The user-signing key of other users is usually not visible to us.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossSigningIdentity {
    master_key: MasterPubkey,
    self_signing_key: SelfSigningPubkey,
    user_signing_key: Option<UserSigningPubkey>,
}

impl CrossSigningIdentity {
    /// Create a new cross-signing identity from its public keys.
    ///
    /// Only checks that all keys belong to the same user, the signatures
    /// between the keys aren't checked.
    pub fn new(
        master_key: MasterPubkey,
        self_signing_key: SelfSigningPubkey,
        user_signing_key: Option<UserSigningPubkey>,
    ) -> Result<Self, SignatureError> {
        let same_user = master_key.user_id() == self_signing_key.user_id()
            && user_signing_key.as_ref().is_none_or(|k| k.user_id() == master_key.user_id());

        if same_user {
            Ok(Self { master_key, self_signing_key, user_signing_key })
        } else {
            Err(SignatureError::UserIdMismatch)
        }
    }

    /// Get the user id of this identity.
    pub fn user_id(&self) -> &UserId {
        self.master_key.user_id()
    }

    /// Get the public master key of the identity.
    pub fn master_key(&self) -> &MasterPubkey {
        &self.master_key
    }

    /// Get the public self-signing key of the identity.
    pub fn self_signing_key(&self) -> &SelfSigningPubkey {
        &self.self_signing_key
    }

    /// Get the public user-signing key of the identity, if we know it.
    pub fn user_signing_key(&self) -> Option<&UserSigningPubkey> {
        self.user_signing_key.as_ref()
    }

    /// Check that the subkeys we know of carry a valid signature of the
    /// master key.
    pub(crate) fn verify_subkeys(&self) -> Result<(), SignatureError> {
        self.master_key.verify_subkey(&self.self_signing_key)?;

        if let Some(user_signing_key) = &self.user_signing_key {
            self.master_key.verify_subkey(user_signing_key)?;
        }

        Ok(())
    }
}
