// Copyright 2021 The Matrix.org Foundation C.I.C.
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

//! Interactive verification of devices.
//!
//! Two devices verify each other by exchanging ephemeral keys and comparing a
//! short authentication string derived from the shared secret, see [`Sas`].
//! A flow can be preceded by an `m.key.verification.request`, represented by a
//! [`VerificationRequest`], which lets the other side pick the device and the
//! method used for the verification.
//!
//! Flows either use to-device messages or, for verifications with other users,
//! messages in a direct message room. The [`FlowId`] tells them apart.
//!
//! All the live flows are owned by the [`VerificationRegistry`], which routes
//! incoming messages to them and notifies listeners about their progress.

mod cache;
mod machine;
mod requests;
mod sas;

use std::time::Duration;

pub(crate) use cache::VerificationCache;
pub use machine::VerificationRegistry;
pub use requests::{VerificationRequest, VerificationRequestState};
use ruma::{
    DeviceId, MilliSecondsSinceUnixEpoch, OwnedDeviceId, OwnedEventId, OwnedRoomId,
    OwnedTransactionId, OwnedUserId, RoomId, UserId,
};
pub(crate) use sas::SasIds;
pub use sas::{Sas, SasState};
use tracing::{info, trace, warn};

use crate::{
    identities::{CrossSigningIdentity, Device, LocalTrust, SignatureGraph, TrustEngine},
    olm::StaticAccountData,
    requests::SignatureUploadRequest,
    store::{Changes, DeviceChanges, Result as StoreResult, Store},
    types::events::{CancelCode, CancelContent, Reference, Relation, VerificationContent},
};

/// An emoji that is used for interactive verification using a short auth
/// string.
///
/// A single emoji and its description, out of the SAS emoji table of the
/// [Matrix client-server API].
///
/// [Matrix client-server API]: https://spec.matrix.org/unstable/client-server-api/#sas-method-emoji
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Emoji {
    /// The emoji symbol that represents a part of the short auth string, for
    /// example: 🐶
    pub symbol: &'static str,
    /// The description of the emoji, for example 'Dog'.
    pub description: &'static str,
}

/// The ID of a verification flow.
///
/// To-device flows are identified by the transaction ID of their messages,
/// in-room flows by the event ID of the request event.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FlowId {
    /// The flow uses to-device messages.
    ToDevice(OwnedTransactionId),
    /// The flow uses messages in the given room.
    InRoom(OwnedRoomId, OwnedEventId),
}

impl FlowId {
    /// The room of the flow, if it's an in-room flow.
    pub fn room_id(&self) -> Option<&RoomId> {
        as_variant::as_variant!(self, Self::InRoom(room_id, _) => room_id)
    }

    /// Get the flow id as a string.
    pub fn as_str(&self) -> &str {
        match self {
            FlowId::ToDevice(transaction_id) => transaction_id.as_str(),
            FlowId::InRoom(_, event_id) => event_id.as_str(),
        }
    }

    /// The relation that ties a content to this flow.
    pub(crate) fn relation(&self) -> Relation {
        match self {
            FlowId::ToDevice(transaction_id) => {
                Relation::ToDevice { transaction_id: transaction_id.clone() }
            }
            FlowId::InRoom(_, event_id) => {
                Relation::InRoom { relates_to: Reference::new(event_id.clone()) }
            }
        }
    }
}

impl From<OwnedTransactionId> for FlowId {
    fn from(transaction_id: OwnedTransactionId) -> Self {
        FlowId::ToDevice(transaction_id)
    }
}

impl From<(OwnedRoomId, OwnedEventId)> for FlowId {
    fn from((room_id, event_id): (OwnedRoomId, OwnedEventId)) -> Self {
        FlowId::InRoom(room_id, event_id)
    }
}

/// Information about the cancellation of a verification request or
/// verification flow.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CancelInfo {
    cancelled_by_us: bool,
    cancel_code: CancelCode,
    reason: String,
}

impl CancelInfo {
    pub(crate) fn new(cancelled_by_us: bool, cancel_code: CancelCode) -> Self {
        let reason = match cancel_code {
            CancelCode::User => "The user cancelled the verification.",
            CancelCode::Timeout => "The verification process timed out.",
            CancelCode::UnknownTransaction => {
                "The device does not know about the given transaction ID."
            }
            CancelCode::UnknownMethod => {
                "The device doesn't know how to handle the requested method."
            }
            CancelCode::UnexpectedMessage => "The device received an unexpected message.",
            CancelCode::KeyMismatch => "The key was not verified.",
            CancelCode::UserMismatch => "The expected user did not match the user in the event.",
            CancelCode::InvalidMessage => "The received message was invalid.",
            CancelCode::Accepted => {
                "A m.key.verification.request was accepted by a different device."
            }
            CancelCode::MismatchedCommitment => "The hash commitment did not match.",
            CancelCode::MismatchedSas => "The SAS did not match.",
            CancelCode::Other(_) => "Unknown cancel reason",
        };

        Self { cancelled_by_us, cancel_code, reason: reason.to_owned() }
    }

    pub(crate) fn from_content(content: &CancelContent) -> Self {
        Self {
            cancelled_by_us: false,
            cancel_code: content.code.clone(),
            reason: content.reason.clone(),
        }
    }

    /// Get the human readable reason of the cancellation.
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Get the `CancelCode` that cancelled this verification.
    pub fn cancel_code(&self) -> &CancelCode {
        &self.cancel_code
    }

    /// Was the verification cancelled by us?
    pub fn cancelled_by_us(&self) -> bool {
        self.cancelled_by_us
    }

    /// The cancel message we send to the other side.
    pub(crate) fn as_content(&self, flow_id: &FlowId) -> VerificationContent {
        VerificationContent::Cancel(CancelContent {
            code: self.cancel_code.clone(),
            reason: self.reason.clone(),
            relation: flow_id.relation(),
        })
    }
}

/// Notifications about the progress of verifications, see
/// [`VerificationRegistry::subscribe`].
#[derive(Clone, Debug)]
pub enum VerificationEvent {
    /// A new SAS flow was created, either by us or by the other side.
    TransactionCreated {
        /// The flow of the transaction.
        flow_id: FlowId,
        /// The user we are verifying.
        other_user_id: OwnedUserId,
    },
    /// A SAS flow changed its state.
    TransactionUpdated {
        /// The flow of the transaction.
        flow_id: FlowId,
        /// The user we are verifying.
        other_user_id: OwnedUserId,
        /// The new state of the flow.
        state: SasState,
    },
    /// A device was marked as verified outside of an interactive
    /// verification.
    MarkedAsManuallyVerified {
        /// The owner of the device.
        user_id: OwnedUserId,
        /// The device that was verified.
        device_id: OwnedDeviceId,
    },
    /// A new verification request was created, either by us or by the other
    /// side.
    VerificationRequestCreated {
        /// The flow of the request.
        flow_id: FlowId,
        /// The user we are verifying.
        other_user_id: OwnedUserId,
    },
    /// A verification request changed its state.
    VerificationRequestUpdated {
        /// The flow of the request.
        flow_id: FlowId,
        /// The user we are verifying.
        other_user_id: OwnedUserId,
        /// The new state of the request.
        state: VerificationRequestState,
    },
}

/// The outcome of storing the result of a successful SAS flow.
#[derive(Clone, Debug)]
pub(crate) enum VerificationResult {
    Ok,
    Cancel(CancelCode),
    SignatureUpload(SignatureUploadRequest),
}

/// Is the timestamp of a verification request recent enough to act on it.
pub(crate) fn is_timestamp_valid(
    timestamp: MilliSecondsSinceUnixEpoch,
    now: MilliSecondsSinceUnixEpoch,
    max_age: Duration,
    max_future: Duration,
) -> bool {
    let timestamp = u64::from(timestamp.get());
    let now = u64::from(now.get());

    let max_age = u64::try_from(max_age.as_millis()).unwrap_or(u64::MAX);
    let max_future = u64::try_from(max_future.as_millis()).unwrap_or(u64::MAX);

    if timestamp <= now {
        now - timestamp <= max_age
    } else {
        timestamp - now <= max_future
    }
}

/// The store as the verification flows see it.
#[derive(Clone, Debug)]
pub(crate) struct VerificationStore {
    store: Store,
}

impl VerificationStore {
    pub(crate) fn new(store: Store) -> Self {
        Self { store }
    }

    pub(crate) fn account(&self) -> &StaticAccountData {
        self.store.static_account()
    }

    pub(crate) fn is_own_device(&self, user_id: &UserId, device_id: &DeviceId) -> bool {
        user_id == self.store.user_id() && device_id == self.store.device_id()
    }

    /// Get a device we can verify, our own device and deleted devices are
    /// never returned.
    pub(crate) async fn get_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> StoreResult<Option<Device>> {
        if self.is_own_device(user_id, device_id) {
            return Ok(None);
        }

        Ok(self.store.get_device(user_id, device_id).await?.filter(|d| !d.is_deleted()))
    }

    /// Collect the identities a SAS flow with the given device exchanges MACs
    /// for.
    ///
    /// Our own master key is only sent if we trust it ourselves.
    pub(crate) async fn sas_ids(&self, other_device: Device) -> StoreResult<SasIds> {
        let graph = self.store.signature_graph(other_device.user_id()).await?;
        let own_identity = Self::trusted_own_identity(&graph);

        let other_identity = if other_device.user_id() == self.store.user_id() {
            graph.own_identity.clone()
        } else {
            graph.identities.get(other_device.user_id()).cloned()
        };

        Ok(SasIds { account: self.account().clone(), other_device, own_identity, other_identity })
    }

    fn trusted_own_identity(graph: &SignatureGraph) -> Option<CrossSigningIdentity> {
        let trusted = TrustEngine::new(graph).compute_user_trust(&graph.own_user_id).is_verified();
        graph.own_identity.clone().filter(|_| trusted)
    }

    /// Store the outcome of a successful SAS flow.
    ///
    /// The device is only marked as verified if its keys didn't change while
    /// the flow was running. If we hold the private cross-signing keys, the
    /// verified objects get signed as well.
    pub(crate) async fn mark_as_verified(
        &self,
        ids: &SasIds,
        verified_devices: &[Device],
        verified_identities: &[CrossSigningIdentity],
    ) -> StoreResult<VerificationResult> {
        let other_user_id = ids.other_device.user_id();
        let other_device_id = ids.other_device.device_id();

        let private_identity = self.store.load_identity().await?;
        let mut signature_request = SignatureUploadRequest::default();
        let mut changes = Changes::default();

        if verified_devices.iter().any(|d| d.device_id() == other_device_id) {
            match self.store.get_device(other_user_id, other_device_id).await? {
                Some(mut device) if device.has_same_keys(ids.other_device.keys()) => {
                    info!(user_id = ?other_user_id, device_id = ?other_device_id, "Marking the device as verified");
                    device.set_trust_state(LocalTrust::Verified);

                    if other_user_id == self.store.user_id() {
                        self.store.mark_device_as_recently_verified(other_device_id);

                        if let Some(identity) = &private_identity {
                            match identity.sign_device(device.keys()) {
                                Ok(request) => signature_request.merge(request),
                                Err(error) => {
                                    warn!(?error, "Couldn't sign the verified device")
                                }
                            }
                        }
                    }

                    changes.devices = DeviceChanges { changed: vec![device], ..Default::default() };
                }
                Some(_) => {
                    warn!(
                        user_id = ?other_user_id,
                        device_id = ?other_device_id,
                        "The device keys changed while verifying, not marking the device as verified",
                    );
                    return Ok(VerificationResult::Cancel(CancelCode::KeyMismatch));
                }
                None => {
                    warn!(
                        user_id = ?other_user_id,
                        device_id = ?other_device_id,
                        "The device was deleted while verifying, cancelling the verification",
                    );
                    return Ok(VerificationResult::Cancel(CancelCode::KeyMismatch));
                }
            }
        }

        let mut verified_identity = false;

        for identity in verified_identities.iter().filter(|i| i.user_id() == other_user_id) {
            let Some(stored) = self.store.get_user_identity(other_user_id).await? else {
                continue;
            };

            if stored.master_key() != identity.master_key() {
                warn!(user_id = ?other_user_id, "The master key changed while verifying");
                continue;
            }

            verified_identity = true;

            if other_user_id != self.store.user_id() {
                if let Some(private_identity) = &private_identity {
                    info!(user_id = ?other_user_id, "Signing the master key of the verified user");

                    match private_identity.sign_user(&stored) {
                        Ok(request) => signature_request.merge(request),
                        Err(error) => warn!(?error, "Couldn't sign the verified user"),
                    }
                }
            }
        }

        if changes.devices.is_empty() && !verified_identity {
            warn!(
                user_id = ?other_user_id,
                device_id = ?other_device_id,
                "Nothing was verified, cancelling the verification",
            );
            return Ok(VerificationResult::Cancel(CancelCode::KeyMismatch));
        }

        if !changes.is_empty() {
            self.store.save_changes(changes).await?;
        }

        trace!(signatures = signature_request.signed_keys.len(), "Stored the verification result");

        Ok(if signature_request.is_empty() {
            VerificationResult::Ok
        } else {
            VerificationResult::SignatureUpload(signature_request)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use proptest::prelude::*;
    use ruma::{MilliSecondsSinceUnixEpoch, UInt};

    use super::is_timestamp_valid;

    const MAX_AGE: Duration = Duration::from_secs(10 * 60);
    const MAX_FUTURE: Duration = Duration::from_secs(5 * 60);

    fn ts(millis: u64) -> MilliSecondsSinceUnixEpoch {
        MilliSecondsSinceUnixEpoch(UInt::new(millis).expect("the timestamp should fit"))
    }

    #[test]
    fn timestamp_boundaries() {
        let now = 1_000_000_000;

        assert!(is_timestamp_valid(ts(now), ts(now), MAX_AGE, MAX_FUTURE));
        assert!(is_timestamp_valid(ts(now - 600_000), ts(now), MAX_AGE, MAX_FUTURE));
        assert!(!is_timestamp_valid(ts(now - 600_001), ts(now), MAX_AGE, MAX_FUTURE));
        assert!(is_timestamp_valid(ts(now + 300_000), ts(now), MAX_AGE, MAX_FUTURE));
        assert!(!is_timestamp_valid(ts(now + 300_001), ts(now), MAX_AGE, MAX_FUTURE));
    }

    proptest! {
        #[test]
        fn timestamps_inside_the_window_are_valid(
            now in 1_000_000u64..1_000_000_000_000,
            offset in -600_000i64..=300_000,
        ) {
            let timestamp = now.checked_add_signed(offset).unwrap();
            prop_assert!(is_timestamp_valid(ts(timestamp), ts(now), MAX_AGE, MAX_FUTURE));
        }

        #[test]
        fn stale_timestamps_are_invalid(
            now in 1_000_000u64..1_000_000_000_000,
            age in 600_001u64..1_000_000,
        ) {
            prop_assert!(!is_timestamp_valid(ts(now - age), ts(now), MAX_AGE, MAX_FUTURE));
        }

        #[test]
        fn future_timestamps_are_invalid(
            now in 1_000_000u64..1_000_000_000_000,
            ahead in 300_001u64..1_000_000_000,
        ) {
            prop_assert!(!is_timestamp_valid(ts(now + ahead), ts(now), MAX_AGE, MAX_FUTURE));
        }
    }
}
