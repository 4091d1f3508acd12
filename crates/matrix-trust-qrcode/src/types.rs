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

use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt};
use qrcode::QrCode;
use ruma::serde::Base64;
use vodozemac::Ed25519PublicKey;

use crate::{
    error::{DecodingError, EncodingError},
    utils::{to_bytes, to_qr_code, HEADER, MAX_MODE, MIN_SECRET_LEN, VERSION},
};

/// The decoded payload of a verification QR code, one variant per
/// verification mode.
///
/// The binary layout is shared between the modes; only the meaning of the two
/// embedded keys changes:
///
/// * mode `0x00` ([`VerificationData`]) - verifying another user, the keys
///   are the master cross-signing keys of both users.
/// * mode `0x01` ([`SelfVerificationData`]) - verifying one of our own
///   devices while the displaying device trusts the master key, the keys are
///   our master key and the other device's key.
/// * mode `0x02` ([`SelfVerificationNoMasterKey`]) - verifying one of our own
///   devices while the displaying device does *not* yet trust the master key.
///   The key order is swapped compared to mode `0x01`: the device key comes
///   first. This asymmetry is part of the wire format and must be kept.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QrVerificationData {
    /// Verification of another user using master cross-signing keys.
    Verification(VerificationData),
    /// Verification of one of our own devices, the displaying side trusting
    /// the master key.
    SelfVerification(SelfVerificationData),
    /// Verification of one of our own devices, the displaying side not yet
    /// trusting the master key.
    SelfVerificationNoMasterKey(SelfVerificationNoMasterKey),
}

impl TryFrom<&[u8]> for QrVerificationData {
    type Error = DecodingError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        Self::from_bytes(value)
    }
}

impl TryFrom<Vec<u8>> for QrVerificationData {
    type Error = DecodingError;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        Self::from_bytes(value)
    }
}

impl QrVerificationData {
    /// Parse the raw bytes of a decoded QR code as a `QrVerificationData`.
    pub fn from_bytes(bytes: impl AsRef<[u8]>) -> Result<Self, DecodingError> {
        Self::decode_bytes(bytes)
    }

    /// Parse the string representation of a QR code payload.
    ///
    /// The payload travels inside URL fragments as a string where every byte
    /// of the binary payload is mapped to the Unicode code point of the same
    /// value, i.e. a Latin-1 style decoding. This is the inverse of
    /// [`QrVerificationData::to_encoded_string()`].
    pub fn from_encoded_string(text: &str) -> Result<Self, DecodingError> {
        let bytes: Vec<u8> = text
            .chars()
            .map(|c| u8::try_from(u32::from(c)).map_err(|_| DecodingError::Charset(c)))
            .collect::<Result<_, _>>()?;

        Self::from_bytes(bytes)
    }

    /// Encode the payload as a string where each byte becomes one character.
    pub fn to_encoded_string(&self) -> Result<String, EncodingError> {
        Ok(self.to_bytes()?.into_iter().map(char::from).collect())
    }

    /// Encode the payload into a [`QrCode`] that can be rendered and
    /// presented to be scanned.
    pub fn to_qr_code(&self) -> Result<QrCode, EncodingError> {
        match self {
            QrVerificationData::Verification(v) => v.to_qr_code(),
            QrVerificationData::SelfVerification(v) => v.to_qr_code(),
            QrVerificationData::SelfVerificationNoMasterKey(v) => v.to_qr_code(),
        }
    }

    /// Encode the payload into the raw bytes that get embedded into a QR
    /// code.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodingError> {
        match self {
            QrVerificationData::Verification(v) => v.to_bytes(),
            QrVerificationData::SelfVerification(v) => v.to_bytes(),
            QrVerificationData::SelfVerificationNoMasterKey(v) => v.to_bytes(),
        }
    }

    /// Decode the byte slice containing the decoded QR code data.
    ///
    /// The payload consists of, in order:
    ///
    /// * the ASCII string `MATRIX`
    /// * one version byte, must be `0x02`
    /// * one mode byte, `0x00`, `0x01` or `0x02`
    /// * the length of the flow id as a big-endian u16, followed by the flow
    ///   id itself (an event id or a transaction id, UTF-8)
    /// * the first key, 32 bytes
    /// * the second key, 32 bytes
    /// * the remainder of the payload as the shared secret, at least 8 bytes
    ///
    /// The declared flow id length is trusted as-is. A wrong length shifts
    /// every subsequent field but can still yield a "successful" parse with
    /// garbage keys; other clients ship the same lenient parser, so this is
    /// kept for wire compatibility rather than tightened.
    fn decode_bytes(bytes: impl AsRef<[u8]>) -> Result<Self, DecodingError> {
        let mut decoded = Cursor::new(bytes);

        let mut header = [0u8; 6];
        let mut first_key = [0u8; 32];
        let mut second_key = [0u8; 32];

        decoded.read_exact(&mut header)?;
        let version = decoded.read_u8()?;
        let mode = decoded.read_u8()?;

        if header != HEADER {
            return Err(DecodingError::Header);
        } else if version != VERSION {
            return Err(DecodingError::Version(version));
        } else if mode > MAX_MODE {
            return Err(DecodingError::Mode(mode));
        }

        let flow_id_len = decoded.read_u16::<BigEndian>()?;
        let mut flow_id = vec![0; flow_id_len.into()];

        decoded.read_exact(&mut flow_id)?;
        decoded.read_exact(&mut first_key)?;
        decoded.read_exact(&mut second_key)?;

        let mut shared_secret = Vec::new();
        decoded.read_to_end(&mut shared_secret)?;

        if shared_secret.len() < MIN_SECRET_LEN {
            return Err(DecodingError::SharedSecret(shared_secret.len()));
        }

        let first_key = Ed25519PublicKey::from_slice(&first_key)?;
        let second_key = Ed25519PublicKey::from_slice(&second_key)?;

        QrVerificationData::new(mode, flow_id, first_key, second_key, shared_secret)
    }

    fn new(
        mode: u8,
        flow_id: Vec<u8>,
        first_key: Ed25519PublicKey,
        second_key: Ed25519PublicKey,
        shared_secret: Vec<u8>,
    ) -> Result<Self, DecodingError> {
        let flow_id = String::from_utf8(flow_id)?;
        let shared_secret = Base64::new(shared_secret);

        match mode {
            VerificationData::QR_MODE => {
                Ok(VerificationData::new(flow_id, first_key, second_key, shared_secret).into())
            }
            SelfVerificationData::QR_MODE => {
                Ok(SelfVerificationData::new(flow_id, first_key, second_key, shared_secret).into())
            }
            SelfVerificationNoMasterKey::QR_MODE => {
                Ok(SelfVerificationNoMasterKey::new(flow_id, first_key, second_key, shared_secret)
                    .into())
            }
            m => Err(DecodingError::Mode(m)),
        }
    }

    /// The wire-format mode byte of this payload.
    pub fn mode(&self) -> u8 {
        match self {
            QrVerificationData::Verification(_) => VerificationData::QR_MODE,
            QrVerificationData::SelfVerification(_) => SelfVerificationData::QR_MODE,
            QrVerificationData::SelfVerificationNoMasterKey(_) => {
                SelfVerificationNoMasterKey::QR_MODE
            }
        }
    }

    /// The flow id this payload belongs to, an event id or a transaction id.
    pub fn flow_id(&self) -> &str {
        match self {
            QrVerificationData::Verification(v) => &v.flow_id,
            QrVerificationData::SelfVerification(v) => &v.transaction_id,
            QrVerificationData::SelfVerificationNoMasterKey(v) => &v.transaction_id,
        }
    }

    /// The first embedded key, the meaning depends on the mode.
    pub fn first_key(&self) -> Ed25519PublicKey {
        match self {
            QrVerificationData::Verification(v) => v.first_master_key,
            QrVerificationData::SelfVerification(v) => v.master_key,
            QrVerificationData::SelfVerificationNoMasterKey(v) => v.device_key,
        }
    }

    /// The second embedded key, the meaning depends on the mode.
    pub fn second_key(&self) -> Ed25519PublicKey {
        match self {
            QrVerificationData::Verification(v) => v.second_master_key,
            QrVerificationData::SelfVerification(v) => v.device_key,
            QrVerificationData::SelfVerificationNoMasterKey(v) => v.master_key,
        }
    }

    /// The random shared secret embedded into the payload.
    pub fn secret(&self) -> &Base64 {
        match self {
            QrVerificationData::Verification(v) => &v.shared_secret,
            QrVerificationData::SelfVerification(v) => &v.shared_secret,
            QrVerificationData::SelfVerificationNoMasterKey(v) => &v.shared_secret,
        }
    }
}

/// Payload for mode `0x00`, verifying another user.
///
/// The first key is the master cross-signing key of the user displaying the
/// QR code, the second is what the displaying user believes the scanning
/// user's master cross-signing key to be.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerificationData {
    flow_id: String,
    first_master_key: Ed25519PublicKey,
    second_master_key: Ed25519PublicKey,
    shared_secret: Base64,
}

impl VerificationData {
    const QR_MODE: u8 = 0x00;

    /// Create a new `VerificationData` from the event id of the verification
    /// request, the two master cross-signing keys, and a random shared
    /// secret.
    pub fn new(
        flow_id: String,
        first_master_key: Ed25519PublicKey,
        second_master_key: Ed25519PublicKey,
        shared_secret: Base64,
    ) -> Self {
        Self { flow_id, first_master_key, second_master_key, shared_secret }
    }

    /// Encode into the raw bytes of a QR code payload.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodingError> {
        to_bytes(
            Self::QR_MODE,
            &self.flow_id,
            self.first_master_key,
            self.second_master_key,
            &self.shared_secret,
        )
    }

    /// Encode into a [`QrCode`].
    pub fn to_qr_code(&self) -> Result<QrCode, EncodingError> {
        to_qr_code(
            Self::QR_MODE,
            &self.flow_id,
            self.first_master_key,
            self.second_master_key,
            &self.shared_secret,
        )
    }
}

impl From<VerificationData> for QrVerificationData {
    fn from(data: VerificationData) -> Self {
        Self::Verification(data)
    }
}

/// Payload for mode `0x01`, self-verification where the displaying device
/// trusts or owns the master cross-signing key.
///
/// The first key is the master cross-signing key, the second is what the
/// displaying device believes the scanning device's key to be.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelfVerificationData {
    transaction_id: String,
    master_key: Ed25519PublicKey,
    device_key: Ed25519PublicKey,
    shared_secret: Base64,
}

impl SelfVerificationData {
    const QR_MODE: u8 = 0x01;

    /// Create a new `SelfVerificationData` from the transaction id of the
    /// verification flow, our master cross-signing key, the other device's
    /// key, and a random shared secret.
    pub fn new(
        transaction_id: String,
        master_key: Ed25519PublicKey,
        device_key: Ed25519PublicKey,
        shared_secret: Base64,
    ) -> Self {
        Self { transaction_id, master_key, device_key, shared_secret }
    }

    /// Encode into the raw bytes of a QR code payload.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodingError> {
        to_bytes(
            Self::QR_MODE,
            &self.transaction_id,
            self.master_key,
            self.device_key,
            &self.shared_secret,
        )
    }

    /// Encode into a [`QrCode`].
    pub fn to_qr_code(&self) -> Result<QrCode, EncodingError> {
        to_qr_code(
            Self::QR_MODE,
            &self.transaction_id,
            self.master_key,
            self.device_key,
            &self.shared_secret,
        )
    }
}

impl From<SelfVerificationData> for QrVerificationData {
    fn from(data: SelfVerificationData) -> Self {
        Self::SelfVerification(data)
    }
}

/// Payload for mode `0x02`, self-verification where the displaying device
/// does not yet trust the master cross-signing key.
///
/// Here the key order is swapped compared to the other modes: the first key
/// is the displaying device's own key, the second is what the displaying
/// device believes the master cross-signing key to be.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelfVerificationNoMasterKey {
    transaction_id: String,
    device_key: Ed25519PublicKey,
    master_key: Ed25519PublicKey,
    shared_secret: Base64,
}

impl SelfVerificationNoMasterKey {
    const QR_MODE: u8 = 0x02;

    /// Create a new `SelfVerificationNoMasterKey` from the transaction id of
    /// the verification flow, our own device key, the master cross-signing
    /// key, and a random shared secret.
    pub fn new(
        transaction_id: String,
        device_key: Ed25519PublicKey,
        master_key: Ed25519PublicKey,
        shared_secret: Base64,
    ) -> Self {
        Self { transaction_id, device_key, master_key, shared_secret }
    }

    /// Encode into the raw bytes of a QR code payload.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodingError> {
        to_bytes(
            Self::QR_MODE,
            &self.transaction_id,
            self.device_key,
            self.master_key,
            &self.shared_secret,
        )
    }

    /// Encode into a [`QrCode`].
    pub fn to_qr_code(&self) -> Result<QrCode, EncodingError> {
        to_qr_code(
            Self::QR_MODE,
            &self.transaction_id,
            self.device_key,
            self.master_key,
            &self.shared_secret,
        )
    }
}

impl From<SelfVerificationNoMasterKey> for QrVerificationData {
    fn from(data: SelfVerificationNoMasterKey) -> Self {
        Self::SelfVerificationNoMasterKey(data)
    }
}
