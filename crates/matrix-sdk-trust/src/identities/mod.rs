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

//! Collection of public identities used in Matrix.
//!
//! Matrix supports two main types of identities, a per-device identity and a
//! per-user identity.
//!
//! ## Device
//!
//! Every E2EE capable Matrix client will create a new Olm account and upload
//! the public keys of the Olm account to the server. This is represented as a
//! [`Device`].
//!
//! Devices can have a local trust state which is needs to be saved in our
//! store, the trust state can be set during the verification of the device.
//!
//! ## User
//!
//! Cross-signing capable devices will upload 3 additional Ed25519 keys which
//! represent the [`CrossSigningIdentity`] of the user. The master key signs the
//! self-signing key, which signs the devices of the user, and the
//! user-signing key, which signs the master keys of other users.
//!
//! Whether an identity or a device can be trusted is computed by the
//! [`TrustEngine`] from these signatures, trust is never stored.

mod device;
pub(crate) mod manager;
mod trust;
mod user;

pub use device::{Device, DeviceTrustLevel, LocalTrust};
pub(crate) use manager::IdentityManager;
pub use trust::{DeviceTrustResult, SignatureGraph, TrustEngine, UserTrustResult};
pub use user::CrossSigningIdentity;
