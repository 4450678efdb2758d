// Copyright 2024 The Matrix.org Foundation C.I.C.
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

use std::time::Duration;

use serde::{Deserialize, Serialize};

const VERIFICATION_MAX_AGE: Duration = Duration::from_secs(10 * 60);
const VERIFICATION_MAX_FUTURE: Duration = Duration::from_secs(5 * 60);
const MAX_CONCURRENT_REQUESTS: usize = 20;
const SECRET_SHARE_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Settings for a [`TrustMachine`](crate::TrustMachine).
///
/// The verification age bounds default to the ones the Matrix
/// specification mandates and should only be changed in tests.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TrustMachineSettings {
    /// How old a verification request may be before we refuse to act on it.
    pub verification_max_age: Duration,
    /// How far in the future the timestamp of a verification request may be
    /// before we refuse to act on it.
    pub verification_max_future: Duration,
    /// How many outgoing requests may be in flight at once while the
    /// outgoing requests are processed.
    pub max_concurrent_requests: usize,
    /// Should a room key request be sent out automatically when an event
    /// can't be decrypted because the room key is missing.
    #[serde(default)]
    pub automatic_key_requests: bool,
    /// For how long after an interactive verification one of our devices may
    /// request secrets from us.
    #[serde(default = "default_secret_share_window")]
    pub secret_share_window: Duration,
}

fn default_secret_share_window() -> Duration {
    SECRET_SHARE_WINDOW
}

impl Default for TrustMachineSettings {
    fn default() -> Self {
        Self {
            verification_max_age: VERIFICATION_MAX_AGE,
            verification_max_future: VERIFICATION_MAX_FUTURE,
            max_concurrent_requests: MAX_CONCURRENT_REQUESTS,
            automatic_key_requests: false,
            secret_share_window: SECRET_SHARE_WINDOW,
        }
    }
}
