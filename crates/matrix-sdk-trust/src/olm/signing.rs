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

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use ruma::{OwnedUserId, UserId};
use serde::Serialize;
use vodozemac::{Ed25519Keypair, Ed25519Signature};

use super::{sign_json, Account};
use crate::{
    error::SignatureError,
    identities::CrossSigningIdentity,
    requests::{SignatureUploadRequest, UploadSigningKeys},
    types::{ed25519_key_id, DeviceKeys, MasterPubkey, SelfSigningPubkey, UserSigningPubkey},
};

/// A single private cross-signing key together with its signed public part.
struct Signing<P> {
    keypair: Ed25519Keypair,
    public_key: P,
}

impl<P> Signing<P> {
    fn key_id(&self) -> String {
        ed25519_key_id(&self.keypair.public_key().to_base64())
    }

    fn sign(&self, object: &impl Serialize) -> Result<Ed25519Signature, SignatureError> {
        sign_json(&self.keypair, object)
    }
}

/// Private cross signing identity.
///
/// This object holds the private and public ed25519 key triplet that is used
/// for cross signing.
///
/// It can be used to sign our own devices and the identities of other users.
#[derive(Clone)]
pub struct PrivateCrossSigningIdentity {
    user_id: OwnedUserId,
    shared: Arc<AtomicBool>,
    master_key: Arc<Signing<MasterPubkey>>,
    user_signing_key: Arc<Signing<UserSigningPubkey>>,
    self_signing_key: Arc<Signing<SelfSigningPubkey>>,
}

impl fmt::Debug for PrivateCrossSigningIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateCrossSigningIdentity")
            .field("user_id", &self.user_id)
            .field("master_key", &self.master_key.keypair.public_key())
            .field("shared", &self.shared())
            .finish_non_exhaustive()
    }
}

impl PrivateCrossSigningIdentity {
    fn new_helper(
        user_id: OwnedUserId,
        master: Ed25519Keypair,
        master_public: MasterPubkey,
    ) -> Result<Self, SignatureError> {
        let master = Signing { keypair: master, public_key: master_public };
        let self_signing = Ed25519Keypair::new();
        let user_signing = Ed25519Keypair::new();

        let mut self_signing_public =
            SelfSigningPubkey::from_public_key(user_id.clone(), self_signing.public_key());
        let mut user_signing_public =
            UserSigningPubkey::from_public_key(user_id.clone(), user_signing.public_key());

        for subkey in [self_signing_public.as_mut(), user_signing_public.as_mut()] {
            let signature = master.sign(&*subkey)?;
            subkey.signatures.add_signature(user_id.clone(), master.key_id(), signature);
        }

        Ok(Self {
            user_id,
            shared: Arc::new(AtomicBool::new(false)),
            master_key: Arc::new(master),
            user_signing_key: Arc::new(Signing {
                keypair: user_signing,
                public_key: user_signing_public,
            }),
            self_signing_key: Arc::new(Signing {
                keypair: self_signing,
                public_key: self_signing_public,
            }),
        })
    }

    /// Create a new cross signing identity without signing the device that
    /// created it.
    ///
    /// The self-signing and user-signing keys are signed by the new master
    /// key.
    pub fn new(user_id: OwnedUserId) -> Result<Self, SignatureError> {
        let master = Ed25519Keypair::new();
        let master_public = MasterPubkey::from_public_key(user_id.clone(), master.public_key());

        Self::new_helper(user_id, master, master_public)
    }

    /// Create a new private identity for the given [`Account`].
    ///
    /// The master key will additionally be signed by the account. The device
    /// of the account itself isn't signed by the self-signing key yet, use
    /// [`PrivateCrossSigningIdentity::sign_device_keys`] for that.
    pub fn for_account(account: &Account) -> Result<Self, SignatureError> {
        let user_id = account.user_id().to_owned();
        let master = Ed25519Keypair::new();
        let mut master_public = MasterPubkey::from_public_key(user_id.clone(), master.public_key());

        account.sign_cross_signing_key(master_public.as_mut())?;

        Self::new_helper(user_id, master, master_public)
    }

    /// Get the user id that this identity belongs to.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Mark the identity as shared.
    pub fn mark_as_shared(&self) {
        self.shared.store(true, Ordering::SeqCst)
    }

    /// Has the identity been shared.
    ///
    /// A shared identity here means that the public keys of the identity have
    /// been uploaded to the server.
    pub fn shared(&self) -> bool {
        self.shared.load(Ordering::SeqCst)
    }

    /// Get the public part of the master key.
    pub fn master_public_key(&self) -> MasterPubkey {
        self.master_key.public_key.clone()
    }

    /// Get the public part of the self-signing key.
    pub fn self_signing_public_key(&self) -> SelfSigningPubkey {
        self.self_signing_key.public_key.clone()
    }

    /// Get the public part of the user-signing key.
    pub fn user_signing_public_key(&self) -> UserSigningPubkey {
        self.user_signing_key.public_key.clone()
    }

    /// Get the public identity that belongs to this private identity.
    pub fn to_public_identity(&self) -> Result<CrossSigningIdentity, SignatureError> {
        CrossSigningIdentity::new(
            self.master_public_key(),
            self.self_signing_public_key(),
            Some(self.user_signing_public_key()),
        )
    }

    /// Add a signature of our self-signing key to the given device keys.
    pub fn sign_device_keys(&self, device_keys: &mut DeviceKeys) -> Result<(), SignatureError> {
        if device_keys.user_id != self.user_id {
            return Err(SignatureError::UserIdMismatch);
        }

        let signature = self.self_signing_key.sign(device_keys)?;
        device_keys.signatures.add_signature(
            self.user_id.clone(),
            self.self_signing_key.key_id(),
            signature,
        );

        Ok(())
    }

    /// Sign the given device keys with this identity, producing a request
    /// that uploads the new signature.
    pub(crate) fn sign_device(
        &self,
        device_keys: &DeviceKeys,
    ) -> Result<SignatureUploadRequest, SignatureError> {
        let mut device_keys = device_keys.clone();
        device_keys.signatures = Default::default();
        self.sign_device_keys(&mut device_keys)?;

        let mut request = SignatureUploadRequest::default();
        request.add_signed_object(
            self.user_id.clone(),
            device_keys.device_id.to_string(),
            serde_json::to_value(&device_keys)?,
        );

        Ok(request)
    }

    /// Sign the master key of the given user identity with our user-signing
    /// key, producing a request that uploads the new signature.
    pub(crate) fn sign_user(
        &self,
        identity: &CrossSigningIdentity,
    ) -> Result<SignatureUploadRequest, SignatureError> {
        let mut master_key = identity.master_key().as_ref().clone();
        master_key.signatures = Default::default();

        let public_key =
            identity.master_key().get_first_key().ok_or(SignatureError::MissingSigningKey)?;

        let signature = self.user_signing_key.sign(&master_key)?;
        master_key.signatures.add_signature(
            self.user_id.clone(),
            self.user_signing_key.key_id(),
            signature,
        );

        let mut request = SignatureUploadRequest::default();
        request.add_signed_object(
            identity.user_id().to_owned(),
            public_key.to_base64(),
            serde_json::to_value(&master_key)?,
        );

        Ok(request)
    }

    /// Does this private identity hold the private part of the given master
    /// key.
    pub fn owns_master_key(&self, master_key: &MasterPubkey) -> bool {
        master_key.user_id() == self.user_id
            && master_key.get_first_key() == Some(self.master_key.keypair.public_key())
    }

    /// Get the public cross-signing keys, ready to be uploaded.
    pub(crate) fn as_upload_request(&self) -> UploadSigningKeys {
        UploadSigningKeys {
            master_key: self.master_public_key(),
            self_signing_key: self.self_signing_public_key(),
            user_signing_key: self.user_signing_public_key(),
        }
    }
}
