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

#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_debug_implementations, missing_docs)]

mod error;
mod types;
mod utils;

pub use error::{DecodingError, EncodingError};
pub use qrcode;
pub use types::{
    QrVerificationData, SelfVerificationData, SelfVerificationNoMasterKey, VerificationData,
};

#[cfg(test)]
mod tests {
    use ruma::serde::Base64;
    use vodozemac::Ed25519PublicKey;

    use crate::{DecodingError, QrVerificationData, SelfVerificationData};

    const FIRST_KEY: &[u8; 32] = b"kS /\x92i\x1e6\xcd'g\xf9#\x11\xd8\x8a\xa2\xf61\x05\x1b6\xef\xfc\xa4%\x80\x1a\x0c\xd2\xe8\x04";
    const SECOND_KEY: &[u8; 32] = b"\xbdR|\xf8n\x07\xa4\x1f\xb4\xcc3\x0eBT\xe7[~\xfd\x87\xd06B\xdfoVv%\x9b\x86\xae\xbcM";

    fn first_key() -> Ed25519PublicKey {
        Ed25519PublicKey::from_slice(FIRST_KEY).unwrap()
    }

    fn second_key() -> Ed25519PublicKey {
        Ed25519PublicKey::from_slice(SECOND_KEY).unwrap()
    }

    fn secret() -> Base64 {
        Base64::new(b"SHARED_SECRET".to_vec())
    }

    #[test]
    fn decode_invalid_header() {
        for data in [b"NonMatrixCode".as_slice(), b"MATRI", b""] {
            let result = QrVerificationData::from_bytes(data);
            assert!(
                matches!(result, Err(DecodingError::Header) | Err(DecodingError::Read(_))),
                "{data:?} should not decode"
            );
        }
    }

    #[test]
    fn decode_invalid_version() {
        for version in [0u8, 1, 3] {
            let mut data = b"MATRIX".to_vec();
            data.push(version);
            data.push(0x00);

            let result = QrVerificationData::from_bytes(data);
            assert!(matches!(result, Err(DecodingError::Version(v)) if v == version));
        }

        // A payload that ends right after the header is missing the version
        // byte entirely.
        let result = QrVerificationData::from_bytes(b"MATRIX");
        assert!(matches!(result, Err(DecodingError::Read(_))));
    }

    #[test]
    fn decode_invalid_mode() {
        let result = QrVerificationData::from_bytes(b"MATRIX\x02\x03");
        assert!(matches!(result, Err(DecodingError::Mode(3))));
    }

    #[test]
    fn decode_invalid_keys() {
        let data = b"MATRIX\
                   \x02\x00\x00\x0f\
                   $test:localhost\
                   AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA\
                   BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB\
                   SECRETISLONGENOUGH";
        let result = QrVerificationData::from_bytes(data);
        assert!(matches!(result, Err(DecodingError::Keys(_))));
    }

    #[test]
    fn secret_length_boundary() {
        // A seven byte secret is one below the minimum and gets rejected.
        let mut data = b"MATRIX\x02\x01\x00\x07FLOW_ID".to_vec();
        data.extend_from_slice(FIRST_KEY);
        data.extend_from_slice(SECOND_KEY);
        data.extend_from_slice(b"2SHORT!");

        let result = QrVerificationData::from_bytes(&data);
        assert!(matches!(result, Err(DecodingError::SharedSecret(7))));

        // One more byte and the payload decodes.
        data.push(b'!');
        let result = QrVerificationData::from_bytes(&data)
            .expect("a payload with an eight byte secret should decode");
        assert_eq!(result.secret().as_bytes(), b"2SHORT!!");
    }

    #[test]
    fn encode_decode_roundtrip() {
        let payloads: [QrVerificationData; 3] = [
            crate::VerificationData::new(
                "$event_id:localhost".to_owned(),
                first_key(),
                second_key(),
                secret(),
            )
            .into(),
            SelfVerificationData::new("FLOW_ID".to_owned(), first_key(), second_key(), secret())
                .into(),
            crate::SelfVerificationNoMasterKey::new(
                "FLOW_ID".to_owned(),
                first_key(),
                second_key(),
                secret(),
            )
            .into(),
        ];

        for payload in payloads {
            let encoded = payload.to_bytes().unwrap();
            let decoded = QrVerificationData::from_bytes(encoded)
                .expect("an encoded payload should always decode");

            assert_eq!(payload, decoded);
        }
    }

    #[test]
    fn encoded_string_roundtrip() {
        let payload: QrVerificationData =
            SelfVerificationData::new("FLOW_ID".to_owned(), first_key(), second_key(), secret())
                .into();

        let text = payload.to_encoded_string().unwrap();
        let decoded = QrVerificationData::from_encoded_string(&text)
            .expect("the string representation should decode");

        assert_eq!(payload, decoded);
    }

    #[test]
    fn mode_dependent_key_order() {
        // With a 13 byte flow id the first key occupies the bytes [23, 55)
        // and the second key the bytes [55, 87).
        let flow_id = "$verification";
        assert_eq!(flow_id.len(), 13);

        let device_key = first_key();
        let master_key = second_key();

        let trusted: QrVerificationData =
            SelfVerificationData::new(flow_id.to_owned(), master_key, device_key, secret()).into();
        let encoded = trusted.to_bytes().unwrap();

        assert_eq!(&encoded[23..55], master_key.as_bytes());
        assert_eq!(&encoded[55..87], device_key.as_bytes());

        // Mode 0x02 swaps the order, the device key comes first on the wire.
        let untrusted: QrVerificationData = crate::SelfVerificationNoMasterKey::new(
            flow_id.to_owned(),
            device_key,
            master_key,
            secret(),
        )
        .into();
        let encoded = untrusted.to_bytes().unwrap();

        assert_eq!(&encoded[23..55], device_key.as_bytes());
        assert_eq!(&encoded[55..87], master_key.as_bytes());
    }

    #[test]
    fn decode_wrong_flow_id_length() {
        // The declared flow id length is trusted as-is. A length that is too
        // short shifts every later field, which still "successfully" decodes
        // into a truncated flow id and garbage keys. Other clients parse the
        // payload the same way, so the leniency is kept for compatibility.
        let mut data = b"MATRIX\x02\x01\x00\x04FLOW\x00\x00".to_vec();
        data.extend_from_slice(&[0u8; 64]);
        data.extend_from_slice(b"SHAREDSECRET");

        let result = QrVerificationData::from_bytes(&data)
            .expect("a wrong flow id length still decodes as long as enough bytes remain");

        assert_eq!(result.flow_id(), "FLOW");
        assert_eq!(result.first_key().as_bytes(), &[0u8; 32]);
        assert_eq!(result.secret().as_bytes().len(), 14);
    }
}
