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

//! The crypto primitives this crate builds on.
//!
//! The account, the private cross-signing keys and the Megolm group sessions
//! are thin wrappers around their vodozemac counterparts that tie them to the
//! Matrix user, device and room they belong to.

mod account;
mod group_sessions;
mod signing;
mod utility;

pub(crate) use account::SIGNED_CURVE25519;
pub use account::{Account, StaticAccountData};
pub use group_sessions::{InboundGroupSession, OutboundGroupSession};
pub use signing::PrivateCrossSigningIdentity;
pub(crate) use utility::{sign_json, to_signable_json};
pub use utility::{SignedJsonObject, VerifyJson};
