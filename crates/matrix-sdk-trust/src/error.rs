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

use ruma::{CanonicalJsonError, OwnedDeviceId, OwnedRoomId, OwnedUserId};
use serde_json::Error as SerdeError;
use thiserror::Error;

use crate::{store::CryptoStoreError, types::events::WithheldCode};

/// Result type for group encryption and decryption operations.
pub type MegolmResult<T> = Result<T, MegolmError>;

/// Error representing a failure during a group encryption or decryption
/// operation.
#[derive(Error, Debug)]
pub enum MegolmError {
    /// The received decrypted event couldn't be deserialized.
    #[error(transparent)]
    JsonError(#[from] SerdeError),

    /// Decryption failed because we're missing the room key that was used to
    /// encrypt the event.
    #[error("Can't find the room key to decrypt the event, withheld code: {0:?}")]
    MissingRoomKey(Option<WithheldCode>),

    /// The encrypted megolm message couldn't be decoded.
    #[error(transparent)]
    Decode(#[from] vodozemac::DecodeError),

    /// The event could not have been decrypted.
    #[error(transparent)]
    Decryption(#[from] vodozemac::megolm::DecryptionError),

    /// A forwarded session key couldn't be decoded.
    #[error(transparent)]
    SessionKey(#[from] vodozemac::megolm::SessionKeyDecodeError),

    /// A key of a forwarded session isn't valid.
    #[error(transparent)]
    InvalidKey(#[from] vodozemac::KeyError),

    /// The session ID of a forwarded room key doesn't match the session key.
    #[error("the session ID of the forwarded room key doesn't match the session key")]
    MismatchedSessionId,

    /// The decrypted event claims to belong to a different room than the
    /// session that decrypted it.
    #[error("the decrypted event belongs to a different room: {0}")]
    MismatchedRoom(OwnedRoomId),

    /// The storage layer returned an error.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),
}

/// Error type describing why a signed object couldn't be checked or signed.
#[derive(Error, Debug)]
pub enum SignatureError {
    /// The signature was made using an unsupported algorithm.
    #[error("the signature used an unsupported algorithm")]
    UnsupportedAlgorithm,

    /// The signing key that should create or check a signature is missing.
    #[error("the signing key is missing from the object that signed the message")]
    MissingSigningKey,

    /// The user id of signing key differs from the user id that provided the
    /// signature.
    #[error("the user id of the signing key differs user id that provided the signature")]
    UserIdMismatch,

    /// The provided JSON value that was signed and the signature should be
    /// checked isn't a valid JSON object.
    #[error("the provided JSON value isn't an object")]
    NotAnObject,

    /// The object doesn't contain a signature made by the given key.
    #[error("the provided JSON object doesn't contain a matching signature")]
    NoSignatureFound,

    /// The signature couldn't be verified.
    #[error(transparent)]
    VerificationError(#[from] vodozemac::SignatureError),

    /// The public key isn't a valid ed25519 key.
    #[error(transparent)]
    InvalidKey(#[from] vodozemac::KeyError),

    /// The signature could not be decoded.
    #[error("the given signature is not valid and can't be decoded")]
    InvalidSignature,

    /// The signed object couldn't be serialized.
    #[error(transparent)]
    JsonError(#[from] SerdeError),

    /// The signed object couldn't be converted into canonical JSON.
    #[error(transparent)]
    CanonicalJson(#[from] CanonicalJsonError),
}

/// Error type for the interactive verification API.
#[derive(Error, Debug)]
pub enum VerificationError {
    /// The requested verification method isn't supported.
    #[error("the verification method {0} is not supported")]
    UnsupportedMethod(String),

    /// We don't know the device we should verify.
    #[error("the device {1} of user {0} is unknown")]
    UnknownDevice(OwnedUserId, OwnedDeviceId),

    /// No verification request or transaction with the given flow id exists.
    #[error("no verification flow {0} exists")]
    UnknownFlow(String),

    /// The verification request is in a state that doesn't allow the given
    /// action.
    #[error("the verification request is in the wrong state for this action")]
    InvalidState,

    /// The storage layer returned an error.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),
}

/// Error type for the cross-signing bootstrap and signature uploads.
#[derive(Error, Debug)]
pub enum CrossSigningError {
    /// Cross-signing keys already exist for this session.
    #[error("a cross-signing identity already exists")]
    AlreadyInitialized,

    /// The private cross-signing keys aren't available.
    #[error("the private cross-signing keys are missing")]
    MissingPrivateKeys,

    /// Signing an object failed.
    #[error(transparent)]
    Signature(#[from] SignatureError),

    /// The storage layer returned an error.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),
}

/// Error type for the network boundary, a request couldn't be delivered.
///
/// The request stays pending and is retried on the next drain of the
/// outgoing requests.
#[derive(Error, Debug)]
#[error("the request couldn't be sent: {message}")]
pub struct TransportError {
    message: String,
}

impl TransportError {
    /// Create a new transport error with the given description.
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}
