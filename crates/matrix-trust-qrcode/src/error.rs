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

use thiserror::Error;

/// Error type describing the ways a QR verification payload can fail to
/// decode.
#[derive(Error, Debug)]
pub enum DecodingError {
    /// The decoded QR code is missing the Matrix header.
    #[error("the decoded QR code is missing the Matrix header")]
    Header,
    /// The QR code contains an invalid or unsupported version.
    #[error("the QR code contains an invalid or unsupported version: {0}")]
    Version(u8),
    /// The QR code contains an invalid verification mode.
    #[error("the QR code contains an invalid verification mode: {0}")]
    Mode(u8),
    /// The flow id of the QR code isn't valid UTF-8.
    #[error(transparent)]
    Utf8(#[from] std::string::FromUtf8Error),
    /// One of the keys in the QR code isn't a valid Ed25519 key.
    #[error("the QR code contains an invalid ed25519 key: {0}")]
    Keys(#[from] vodozemac::KeyError),
    /// The QR code ran out of bytes before all fields were read.
    #[error(transparent)]
    Read(#[from] std::io::Error),
    /// The shared secret embedded in the QR code is too short.
    #[error("the QR code contains a too short shared secret, length: {0}")]
    SharedSecret(usize),
    /// The string representation of the QR code contains a character that
    /// doesn't map back to a single byte.
    #[error("the QR code string contains a non Latin-1 character: {0:?}")]
    Charset(char),
}

/// Error type describing the ways a QR verification payload can fail to
/// encode.
#[derive(Error, Debug)]
pub enum EncodingError {
    /// The payload doesn't fit into a QR code.
    #[error(transparent)]
    Qr(#[from] qrcode::types::QrError),
    /// The verification flow id is too long for the length prefix.
    #[error("the verification flow id length can't be converted into a u16: {0}")]
    FlowId(#[from] std::num::TryFromIntError),
}
