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

use qrcode::QrCode;
use ruma::serde::Base64;
use vodozemac::Ed25519PublicKey;

use crate::error::EncodingError;

pub(crate) const HEADER: &[u8] = b"MATRIX";
pub(crate) const VERSION: u8 = 0x2;
pub(crate) const MAX_MODE: u8 = 0x2;
pub(crate) const MIN_SECRET_LEN: usize = 8;

pub(crate) fn to_bytes(
    mode: u8,
    flow_id: &str,
    first_key: Ed25519PublicKey,
    second_key: Ed25519PublicKey,
    shared_secret: &Base64,
) -> Result<Vec<u8>, EncodingError> {
    let flow_id_len: u16 = flow_id.len().try_into()?;
    let flow_id_len = flow_id_len.to_be_bytes();

    let mut encoded = Vec::with_capacity(
        HEADER.len()
            + 2
            + flow_id_len.len()
            + flow_id.len()
            + first_key.as_bytes().len()
            + second_key.as_bytes().len()
            + shared_secret.as_bytes().len(),
    );

    encoded.extend_from_slice(HEADER);
    encoded.push(VERSION);
    encoded.push(mode);
    encoded.extend_from_slice(&flow_id_len);
    encoded.extend_from_slice(flow_id.as_bytes());
    encoded.extend_from_slice(first_key.as_bytes());
    encoded.extend_from_slice(second_key.as_bytes());
    encoded.extend_from_slice(shared_secret.as_bytes());

    Ok(encoded)
}

pub(crate) fn to_qr_code(
    mode: u8,
    flow_id: &str,
    first_key: Ed25519PublicKey,
    second_key: Ed25519PublicKey,
    shared_secret: &Base64,
) -> Result<QrCode, EncodingError> {
    let data = to_bytes(mode, flow_id, first_key, second_key, shared_secret)?;
    Ok(QrCode::new(data)?)
}
