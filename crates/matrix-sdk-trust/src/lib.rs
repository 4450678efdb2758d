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

#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations)]

mod error;
mod gossiping;
mod identities;
mod locks;
mod machine;
pub mod olm;
pub mod processor;
pub mod requests;
mod settings;
pub mod store;
#[cfg(test)]
mod testing;
pub mod types;
mod verification;

pub use error::{
    CrossSigningError, MegolmError, MegolmResult, SignatureError, TransportError,
    VerificationError,
};
pub use gossiping::{
    GossippedSecret, IncomingKeyRequest, IncomingRequestState, KeyReplyResult, KeyRequestReply,
    OutgoingKeyRequest, OutgoingRequestState, RejectionReason,
};
pub use identities::{
    CrossSigningIdentity, Device, DeviceTrustLevel, DeviceTrustResult, LocalTrust, SignatureGraph,
    TrustEngine, UserTrustResult,
};
pub use machine::{DecryptedRoomEvent, TrustMachine};
pub use processor::{OutgoingRequestProcessor, RequestFilter, RequestKind, RequestSender};
pub use requests::{IncomingResponse, OutgoingRequest, OutgoingRequests};
pub use settings::TrustMachineSettings;
pub use store::{CryptoStoreError, TrackedUser};
pub use verification::{
    CancelInfo, Emoji, FlowId, Sas, SasState, VerificationEvent, VerificationRegistry,
    VerificationRequest, VerificationRequestState,
};
#[doc(no_inline)]
pub use vodozemac;

/// Version of this crate.
pub static VERSION: &str = env!("CARGO_PKG_VERSION");

// Test logs are filtered with RUST_LOG.
#[cfg(test)]
#[ctor::ctor]
fn init_logging() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .init();
}
