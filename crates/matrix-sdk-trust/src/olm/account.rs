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

use std::{collections::BTreeMap, fmt, sync::Arc};

use ruma::{DeviceId, OwnedDeviceId, OwnedRoomId, OwnedUserId, UserId};
use serde::Serialize;
use tracing::debug;
use vodozemac::{
    olm::{Account as InnerAccount, IdentityKeys},
    Curve25519PublicKey, Ed25519Signature,
};

use super::{utility::to_signable_json, InboundGroupSession, OutboundGroupSession};
use crate::{
    error::SignatureError,
    types::{
        curve25519_key_id, ed25519_key_id, CrossSigningKey, DeviceKeys, SignedKey,
        SUPPORTED_ALGORITHMS,
    },
};

/// The algorithm prefix of uploaded one-time keys.
pub(crate) const SIGNED_CURVE25519: &str = "signed_curve25519";

/// The data of an account that never changes, cheap to clone and usable
/// without locking the account.
#[derive(Clone, Debug)]
pub struct StaticAccountData {
    /// The user_id this account belongs to.
    pub user_id: OwnedUserId,
    /// The device_id of this entry.
    pub device_id: OwnedDeviceId,
    /// The associated identity keys.
    pub identity_keys: Arc<IdentityKeys>,
}

impl StaticAccountData {
    /// Create a group session pair.
    ///
    /// The outbound session is used to encrypt messages while the inbound one
    /// is used to decrypt messages encrypted by the outbound one, it's the
    /// session other devices of ours may later request.
    pub fn create_group_session_pair(
        &self,
        room_id: OwnedRoomId,
    ) -> (OutboundGroupSession, InboundGroupSession) {
        debug!(?room_id, "Creating a new outbound group session");

        let outbound = OutboundGroupSession::new(
            self.device_id.clone(),
            self.identity_keys.curve25519,
            room_id.clone(),
        );

        let inbound = InboundGroupSession::new(
            self.identity_keys.curve25519,
            self.identity_keys.ed25519,
            room_id,
            &outbound.session_key(),
        );

        (outbound, inbound)
    }

    /// Get the device keys of this account, without any signatures.
    pub fn unsigned_device_keys(&self) -> DeviceKeys {
        let keys = BTreeMap::from([
            (
                curve25519_key_id(self.device_id.as_str()),
                self.identity_keys.curve25519.to_base64(),
            ),
            (ed25519_key_id(self.device_id.as_str()), self.identity_keys.ed25519.to_base64()),
        ]);

        DeviceKeys {
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            algorithms: SUPPORTED_ALGORITHMS.iter().map(|a| (*a).to_owned()).collect(),
            keys,
            signatures: Default::default(),
        }
    }
}

/// The Olm account of this device.
///
/// It holds the long-lived identity keys of the device and the one-time keys
/// other devices claim to establish secure channels with us.
pub struct Account {
    static_data: StaticAccountData,
    inner: InnerAccount,
    shared: bool,
    uploaded_signed_key_count: u64,
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("identity_keys", &self.identity_keys())
            .field("shared", &self.shared())
            .finish()
    }
}

impl Account {
    /// Create a fresh new account, this will generate the identity key-pair.
    pub fn new(user_id: &UserId, device_id: &DeviceId) -> Self {
        let inner = InnerAccount::new();
        let identity_keys = inner.identity_keys();

        Self {
            static_data: StaticAccountData {
                user_id: user_id.to_owned(),
                device_id: device_id.to_owned(),
                identity_keys: Arc::new(identity_keys),
            },
            inner,
            shared: false,
            uploaded_signed_key_count: 0,
        }
    }

    /// Get the immutable data of the account.
    pub fn static_data(&self) -> &StaticAccountData {
        &self.static_data
    }

    /// Get the user id of the owner of the account.
    pub fn user_id(&self) -> &UserId {
        &self.static_data.user_id
    }

    /// Get the device ID that owns this account.
    pub fn device_id(&self) -> &DeviceId {
        &self.static_data.device_id
    }

    /// Get the public parts of the identity keys for the account.
    pub fn identity_keys(&self) -> IdentityKeys {
        *self.static_data.identity_keys
    }

    /// Has the account been shared with the server.
    pub fn shared(&self) -> bool {
        self.shared
    }

    /// Mark the account as shared, the device keys are now published.
    pub fn mark_as_shared(&mut self) {
        self.shared = true;
    }

    /// Update the number of one-time keys the server holds for us and
    /// generate new keys if the server is running low.
    pub fn update_uploaded_key_count(&mut self, one_time_key_counts: &BTreeMap<String, u64>) {
        if let Some(count) = one_time_key_counts.get(SIGNED_CURVE25519) {
            if *count != self.uploaded_signed_key_count {
                debug!(
                    "Updated uploaded one-time key count {} -> {count}.",
                    self.uploaded_signed_key_count
                );
            }

            self.uploaded_signed_key_count = *count;
            self.generate_one_time_keys_if_needed();
        }
    }

    /// Generate new one-time keys so the server holds half of the maximum
    /// amount of keys the account can hold.
    ///
    /// Returns the number of newly generated keys, `None` if the server holds
    /// enough keys already.
    pub fn generate_one_time_keys_if_needed(&mut self) -> Option<u64> {
        // Only generate one-time keys if there aren't any, otherwise the caller
        // might have failed to upload them the last time this method was
        // called.
        if !self.inner.one_time_keys().is_empty() {
            return Some(0);
        }

        let max_keys = self.inner.max_number_of_one_time_keys() as u64 / 2;

        if self.uploaded_signed_key_count >= max_keys {
            return None;
        }

        let key_count = max_keys - self.uploaded_signed_key_count;
        let result = self.inner.generate_one_time_keys(key_count as usize);

        debug!(
            count = key_count,
            discarded_keys = ?result.removed,
            created_keys = ?result.created,
            "Generated new one-time keys"
        );

        Some(key_count)
    }

    /// Sign the one-time keys that weren't published yet.
    pub fn signed_one_time_keys(&self) -> Result<BTreeMap<String, SignedKey>, SignatureError> {
        self.inner
            .one_time_keys()
            .into_iter()
            .map(|(key_id, key)| {
                let key_id = format!("{SIGNED_CURVE25519}:{}", key_id.to_base64());
                Ok((key_id, self.sign_key(key)?))
            })
            .collect()
    }

    fn sign_key(&self, key: Curve25519PublicKey) -> Result<SignedKey, SignatureError> {
        let mut key = SignedKey::new(key);
        let signature = self.sign_json(&key)?;

        key.signatures.add_signature(
            self.user_id().to_owned(),
            ed25519_key_id(self.device_id().as_str()),
            signature,
        );

        Ok(key)
    }

    /// Mark the current set of one-time keys as being published.
    pub fn mark_keys_as_published(&mut self) {
        self.inner.mark_keys_as_published();
    }

    /// Sign the given string using the accounts signing key.
    pub fn sign(&self, string: &str) -> Ed25519Signature {
        self.inner.sign(string)
    }

    /// Sign the canonical JSON form of the given object.
    pub fn sign_json(&self, object: &impl Serialize) -> Result<Ed25519Signature, SignatureError> {
        let canonical_json = to_signable_json(object)?;
        Ok(self.sign(&canonical_json))
    }

    /// Get the signed device keys of this account.
    pub fn device_keys(&self) -> Result<DeviceKeys, SignatureError> {
        let mut device_keys = self.static_data.unsigned_device_keys();
        let signature = self.sign_json(&device_keys)?;

        device_keys.signatures.add_signature(
            self.user_id().to_owned(),
            ed25519_key_id(self.device_id().as_str()),
            signature,
        );

        Ok(device_keys)
    }

    /// Add a signature of our device to the given cross-signing key.
    pub(crate) fn sign_cross_signing_key(
        &self,
        key: &mut CrossSigningKey,
    ) -> Result<(), SignatureError> {
        let signature = self.sign_json(key)?;

        key.signatures.add_signature(
            self.user_id().to_owned(),
            ed25519_key_id(self.device_id().as_str()),
            signature,
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ruma::{device_id, user_id};

    use super::Account;
    use crate::olm::VerifyJson;

    #[test]
    fn device_keys_are_self_signed() {
        let account = Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));
        let device_keys = account.device_keys().unwrap();

        assert_eq!(device_keys.ed25519_key(), Some(account.identity_keys().ed25519));
        assert_eq!(device_keys.curve25519_key(), Some(account.identity_keys().curve25519));

        account
            .identity_keys()
            .ed25519
            .verify_json(account.user_id(), "ed25519:ALICEDEVICE", &device_keys)
            .unwrap();
    }

    #[test]
    fn one_time_keys_are_generated_once() {
        let mut account = Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));

        let generated = account.generate_one_time_keys_if_needed().unwrap();
        assert!(generated > 0);
        assert_eq!(account.generate_one_time_keys_if_needed(), Some(0));

        let keys = account.signed_one_time_keys().unwrap();
        assert_eq!(keys.len() as u64, generated);
        assert!(keys.keys().all(|k| k.starts_with("signed_curve25519:")));

        for key in keys.values() {
            account
                .identity_keys()
                .ed25519
                .verify_json(account.user_id(), "ed25519:ALICEDEVICE", key)
                .unwrap();
        }

        account.mark_keys_as_published();
        assert!(account.signed_one_time_keys().unwrap().is_empty());
    }
}
