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

use std::collections::BTreeMap;

use hmac::Hmac;
use pbkdf2::pbkdf2;
use rand::{thread_rng, RngCore};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::Sha512;
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{
    ciphers::calculate_key_check,
    error::SignatureError,
    types::canonical_json,
    utilities::{decode, encode},
};

/// The algorithm of the secret storage keys and ciphertexts this crate
/// produces.
pub const SSSS_ALGORITHM_AES_HMAC_SHA2: &str = "m.secret_storage.v1.aes-hmac-sha2";

/// The passphrase key derivation algorithm.
pub const PBKDF2_ALGORITHM: &str = "m.pbkdf2";

/// The default PBKDF2 iteration count for newly created passphrase keys.
pub const DEFAULT_PBKDF2_ITERATIONS: u32 = 500_000;

/// The default size of a derived passphrase key, in bits.
pub const DEFAULT_KEY_BITS: u32 = 256;

const RECOVERY_KEY_PREFIX: [u8; 2] = [0x8b, 0x01];

/// Error type describing the ways a recovery key can fail to parse.
#[derive(Debug, Error)]
pub enum RecoveryKeyError {
    /// The recovery key isn't valid base58.
    #[error(transparent)]
    Base58(#[from] bs58::decode::Error),

    /// The decoded recovery key has an unexpected length.
    #[error("the decoded recovery key has an invalid length, expected 35 bytes, got {0}")]
    Length(usize),

    /// The recovery key is missing the two-byte prefix.
    #[error("the decoded recovery key doesn't start with the expected prefix")]
    Prefix,

    /// The parity byte of the recovery key doesn't match.
    #[error("the parity byte of the recovery key doesn't match its content")]
    Parity,
}

/// How a secret storage key was derived from a passphrase.
///
/// Stored inside the key descriptor so that clients can re-derive the key
/// when the user types the passphrase in.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassphraseInfo {
    /// The key derivation algorithm, `m.pbkdf2`.
    pub algorithm: String,
    /// The salt the key was derived with.
    pub salt: String,
    /// The PBKDF2 iteration count.
    pub iterations: u32,
    /// The size of the derived key in bits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bits: Option<u32>,
}

/// The descriptor of a secret storage key, stored as account data under
/// `m.secret_storage.key.<key id>`.
///
/// The `iv`/`mac` pair is the key check: the result of encrypting 32 zero
/// bytes under the key with an empty secret name. It must validate against
/// the raw key bytes derivable from this descriptor, which is how a wrong
/// passphrase or recovery key is detected without decrypting any real
/// secret.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SecretStorageKeyContent {
    /// A human readable name for the key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// The algorithm the key is used with.
    pub algorithm: String,

    /// Derivation parameters if the key was created from a passphrase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<PassphraseInfo>,

    /// The initialization vector of the key check.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iv: Option<String>,

    /// The MAC of the key check.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,

    /// Detached signatures over the descriptor, usually made by a
    /// cross-signing key so the descriptor itself can be trusted after a
    /// recovery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signatures: Option<BTreeMap<String, BTreeMap<String, String>>>,
}

impl SecretStorageKeyContent {
    /// The JSON object that detached signatures over this descriptor are
    /// computed over, everything except the signatures themselves.
    pub fn signable_json(&self) -> Value {
        let mut value = json!({
            "algorithm": self.algorithm,
        });

        let object = value.as_object_mut().expect("a json! object literal is always an object");

        if let Some(name) = &self.name {
            object.insert("name".to_owned(), json!(name));
        }
        if let Some(passphrase) = &self.passphrase {
            object.insert("passphrase".to_owned(), json!(passphrase));
        }
        if let Some(iv) = &self.iv {
            object.insert("iv".to_owned(), json!(iv));
        }
        if let Some(mac) = &self.mac {
            object.insert("mac".to_owned(), json!(mac));
        }

        value
    }

    /// The canonical JSON string that detached signatures over this
    /// descriptor are computed over.
    pub fn canonical_signable(&self) -> Result<String, SignatureError> {
        canonical_json(self.signable_json())
    }
}

/// A signer producing detached signatures over a key descriptor's canonical
/// JSON, typically backed by a cross-signing key.
pub trait KeySigner: Send + Sync {
    /// Sign the canonical JSON of a key descriptor.
    ///
    /// Returns the signature map to attach, or `None` to store the
    /// descriptor unsigned.
    fn sign(&self, canonical_json: &str) -> Option<BTreeMap<String, BTreeMap<String, String>>>;
}

/// The raw 32 bytes of a secret storage key.
///
/// The bytes are zeroized when the value is dropped.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SsssKeySpec(Box<[u8; 32]>);

impl std::fmt::Debug for SsssKeySpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SsssKeySpec(..)")
    }
}

impl SsssKeySpec {
    /// Create a key spec from raw key bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self(Box::new(*bytes))
    }

    /// Generate a new key from 32 cryptographically random bytes.
    pub fn generate() -> Self {
        let mut bytes = Box::new([0u8; 32]);
        thread_rng().fill_bytes(bytes.as_mut_slice());

        Self(bytes)
    }

    /// Re-create a key from its recovery key representation.
    pub fn from_recovery_key(recovery_key: &str) -> Result<Self, RecoveryKeyError> {
        let stripped: String = recovery_key.chars().filter(|c| !c.is_whitespace()).collect();
        let mut decoded = bs58::decode(stripped.as_str()).into_vec()?;

        if decoded.len() != 35 {
            let length = decoded.len();
            decoded.zeroize();
            return Err(RecoveryKeyError::Length(length));
        }

        if decoded[0..2] != RECOVERY_KEY_PREFIX {
            decoded.zeroize();
            return Err(RecoveryKeyError::Prefix);
        }

        let parity = decoded[..34].iter().fold(0u8, |acc, byte| acc ^ byte);
        if parity != decoded[34] {
            decoded.zeroize();
            return Err(RecoveryKeyError::Parity);
        }

        let mut bytes = Box::new([0u8; 32]);
        bytes.copy_from_slice(&decoded[2..34]);
        decoded.zeroize();

        Ok(Self(bytes))
    }

    /// Derive a key from a passphrase with PBKDF2-HMAC-SHA-512.
    pub fn from_passphrase(passphrase: &str, salt: &str, iterations: u32) -> Self {
        let mut bytes = Box::new([0u8; 32]);

        pbkdf2::<Hmac<Sha512>>(
            passphrase.as_bytes(),
            salt.as_bytes(),
            iterations,
            bytes.as_mut_slice(),
        )
        .expect("PBKDF2 can expand a passphrase of any length into 32 bytes");

        Self(bytes)
    }

    /// The raw key bytes.
    pub(crate) fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Encode the key in the recovery key format: a two byte prefix, the key
    /// itself and a parity byte, base58 encoded and grouped into blocks of
    /// four characters.
    pub fn to_recovery_key(&self) -> String {
        let mut bytes = Vec::with_capacity(35);
        bytes.extend_from_slice(&RECOVERY_KEY_PREFIX);
        bytes.extend_from_slice(self.0.as_slice());

        let parity = bytes.iter().fold(0u8, |acc, byte| acc ^ byte);
        bytes.push(parity);

        let base58 = bs58::encode(&bytes).into_string();
        bytes.zeroize();

        base58
            .as_bytes()
            .chunks(4)
            .map(|chunk| std::str::from_utf8(chunk).expect("base58 output is ASCII"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Check this key against the key check stored in a descriptor.
    ///
    /// Returns `false` for a descriptor without a key check or with a
    /// malformed one; a wrong key never validates.
    pub fn matches_key_check(&self, content: &SecretStorageKeyContent) -> bool {
        let (Some(iv), Some(mac)) = (&content.iv, &content.mac) else {
            return false;
        };

        let Ok(iv) = decode(iv) else { return false };
        let Ok(iv) = <[u8; 16]>::try_from(iv.as_slice()) else { return false };
        let Ok(mac) = decode(mac) else { return false };

        let check = calculate_key_check(self.as_bytes(), Some(iv));

        bool::from(check.mac.as_bytes().as_slice().ct_eq(&mac))
    }
}

/// The outcome of creating a new secret storage key.
#[derive(Debug)]
pub struct SsssKeyCreationInfo {
    /// The id of the new key.
    pub key_id: String,
    /// The descriptor that was stored in account data.
    pub content: SecretStorageKeyContent,
    /// The recovery key representation of the raw key, to be shown to the
    /// user exactly once.
    pub recovery_key: String,
    /// The raw key, ready for encrypting and decrypting secrets.
    pub key_spec: SsssKeySpec,
}

/// A reference to a secret storage key for a [`store_secret`] call: the key
/// to encrypt under plus the raw key bytes to do it with.
///
/// [`store_secret`]: super::SharedSecretStorageService::store_secret
#[derive(Clone, Debug)]
pub struct KeyRef {
    /// The key id, `None` means the current default key.
    pub key_id: Option<String>,
    /// The raw key bytes.
    pub key_spec: SsssKeySpec,
}

/// One encrypted copy of a secret, stored per key id in a secret's
/// account data event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedSecretContent {
    /// The AES-CTR encrypted payload, unpadded base64.
    pub ciphertext: String,
    /// The HMAC-SHA-256 tag over the raw ciphertext, unpadded base64.
    pub mac: String,
    /// The initialization vector, unpadded base64.
    #[serde(rename = "iv")]
    pub initialization_vector: String,
}

/// Generate a random salt for a new passphrase-derived key.
pub(crate) fn generate_salt() -> String {
    let mut salt = [0u8; 32];
    thread_rng().fill_bytes(&mut salt);

    encode(salt)
}
