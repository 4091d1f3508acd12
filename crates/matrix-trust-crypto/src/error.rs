// Copyright 2023 The Matrix.org Foundation C.I.C.
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

use thiserror::Error;

/// Error type describing the ways signing or verifying a signed JSON object
/// can fail.
#[derive(Debug, Error)]
pub enum SignatureError {
    /// The value that should be signed or verified isn't a JSON object.
    #[error("the JSON value that should be signed or verified isn't an object")]
    NotAnObject,

    /// The signed JSON object doesn't contain the expected signature.
    #[error("the signed JSON object doesn't contain the expected signature")]
    NoSignatureFound,

    /// The signature was made with an unsupported algorithm, only `ed25519`
    /// signatures are supported.
    #[error("the signature uses an unsupported algorithm")]
    UnsupportedAlgorithm,

    /// The signing key isn't valid base64 or isn't a valid Ed25519 key.
    #[error("the signing key is malformed: {0}")]
    InvalidKey(#[from] vodozemac::KeyError),

    /// The signature is malformed or the cryptographic check failed.
    #[error("the signature is malformed or doesn't verify: {0}")]
    InvalidSignature(#[from] vodozemac::SignatureError),

    /// The object couldn't be serialized for signing or verification.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
