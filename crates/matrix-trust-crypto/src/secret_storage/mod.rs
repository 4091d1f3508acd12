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

//! Shared secret storage, the encrypted key/value store living in the
//! account data of a user.
//!
//! Secrets, typically private cross-signing keys and backup keys, are
//! encrypted with `m.secret_storage.v1.aes-hmac-sha2` under one or more
//! storage keys and uploaded as account data events. A storage key in turn
//! is either 32 random bytes, handed to the user as a recovery key, or
//! derived from a passphrase.
//!
//! The name of a secret doubles as its account data event type *and* as the
//! HKDF context of its encryption; renaming a secret without re-encrypting
//! it invalidates every stored ciphertext for it.

mod keys;

use std::{collections::BTreeMap, sync::Arc};

use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

pub use keys::{
    EncryptedSecretContent, KeyRef, KeySigner, PassphraseInfo, RecoveryKeyError,
    SecretStorageKeyContent, SsssKeyCreationInfo, SsssKeySpec, DEFAULT_KEY_BITS,
    DEFAULT_PBKDF2_ITERATIONS, PBKDF2_ALGORITHM, SSSS_ALGORITHM_AES_HMAC_SHA2,
};

use crate::{
    ciphers::{calculate_key_check, AesHmacSha2Key},
    store::{AccountDataStore, StoreError},
    utilities::{decode, encode},
};

/// The account data type prefix the key descriptors are stored under.
pub const KEY_ID_BASE: &str = "m.secret_storage.key";

/// The account data type holding the id of the default key.
pub const DEFAULT_KEY_ID: &str = "m.secret_storage.default_key";

const ENCRYPTED: &str = "encrypted";

/// A `Result` type alias for secret storage operations.
pub type Result<T, E = SecretStorageError> = std::result::Result<T, E>;

/// Error type for the secret storage subsystem.
#[derive(Debug, Error)]
pub enum SecretStorageError {
    /// No secret storage key with the given id exists.
    #[error("unknown secret storage key: {0}")]
    UnknownKey(String),

    /// No secret with the given name exists.
    #[error("unknown secret: {0}")]
    UnknownSecret(String),

    /// The secret's account data event carries no `encrypted` map.
    #[error("the secret {0} is not encrypted")]
    SecretNotEncrypted(String),

    /// The secret exists but has no copy encrypted under the given key.
    #[error("the secret {0} is not encrypted with the key {1}")]
    SecretNotEncryptedWithKey(String, String),

    /// The MAC of the ciphertext doesn't verify. This is what a wrong
    /// recovery key or passphrase surfaces as, the UI should offer
    /// re-entering it.
    #[error("could not decrypt the secret, invalid MAC")]
    BadMac,

    /// The ciphertext or its metadata is malformed.
    #[error("the encrypted secret content is malformed")]
    BadCipherText,

    /// The key descriptor uses an algorithm this crate doesn't support.
    #[error("unknown or unsupported secret storage algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// The decrypted secret isn't valid UTF-8.
    #[error("could not decode the decrypted secret, it is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),

    /// An account data event could not be serialized or deserialized.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// The account data store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Signing the key descriptor failed.
    #[error(transparent)]
    Signature(#[from] crate::error::SignatureError),
}

/// A secret storage key descriptor together with its id.
#[derive(Clone, Debug)]
pub struct KeyInfo {
    /// The id of the key.
    pub id: String,
    /// The stored descriptor.
    pub content: SecretStorageKeyContent,
}

/// The outcome of checking whether a set of secrets is reachable with a
/// given key.
#[derive(Debug)]
pub enum IntegrityResult {
    /// Every requested secret has a copy encrypted under the key.
    Success {
        /// Whether the key is passphrase based, deciding which entry UI to
        /// show.
        passphrase_based: bool,
    },
    /// Something is missing, the contained error names the first problem.
    Error(SecretStorageError),
}

/// The service managing secret storage keys and secrets, "QuadS".
///
/// All state lives in the account data store handed in at construction;
/// local writes are immediately visible to local reads, independently of
/// any server round-trip.
#[derive(Debug)]
pub struct SharedSecretStorageService {
    account_data: Arc<dyn AccountDataStore>,
}

impl SharedSecretStorageService {
    /// Create a new service on top of the given account data store.
    pub fn new(account_data: Arc<dyn AccountDataStore>) -> Self {
        Self { account_data }
    }

    /// Create a new secret storage key and store its descriptor.
    ///
    /// 32 random bytes are generated unless `key` is provided. The
    /// descriptor includes a key check so a candidate key can later be
    /// validated, and is optionally signed by `key_signer`.
    pub async fn generate_key(
        &self,
        key_id: &str,
        key: Option<SsssKeySpec>,
        key_name: &str,
        key_signer: Option<&dyn KeySigner>,
    ) -> Result<SsssKeyCreationInfo> {
        let key_spec = key.unwrap_or_else(SsssKeySpec::generate);

        let check = calculate_key_check(key_spec.as_bytes(), None);

        let content = SecretStorageKeyContent {
            name: Some(key_name.to_owned()),
            algorithm: SSSS_ALGORITHM_AES_HMAC_SHA2.to_owned(),
            passphrase: None,
            iv: Some(encode(check.iv)),
            mac: Some(encode(check.mac.as_bytes())),
            signatures: None,
        };

        self.store_key_content(key_id, &content, key_signer).await?;

        Ok(SsssKeyCreationInfo {
            key_id: key_id.to_owned(),
            content,
            recovery_key: key_spec.to_recovery_key(),
            key_spec,
        })
    }

    /// Create a new secret storage key derived from a passphrase.
    ///
    /// The derivation parameters are recorded in the descriptor so the key
    /// can be re-derived when the user types the passphrase in again.
    pub async fn generate_key_with_passphrase(
        &self,
        key_id: &str,
        key_name: &str,
        passphrase: &str,
        key_signer: Option<&dyn KeySigner>,
    ) -> Result<SsssKeyCreationInfo> {
        let salt = keys::generate_salt();
        let key_spec =
            SsssKeySpec::from_passphrase(passphrase, &salt, DEFAULT_PBKDF2_ITERATIONS);

        let check = calculate_key_check(key_spec.as_bytes(), None);

        let content = SecretStorageKeyContent {
            name: Some(key_name.to_owned()),
            algorithm: SSSS_ALGORITHM_AES_HMAC_SHA2.to_owned(),
            passphrase: Some(PassphraseInfo {
                algorithm: PBKDF2_ALGORITHM.to_owned(),
                salt,
                iterations: DEFAULT_PBKDF2_ITERATIONS,
                bits: Some(DEFAULT_KEY_BITS),
            }),
            iv: Some(encode(check.iv)),
            mac: Some(encode(check.mac.as_bytes())),
            signatures: None,
        };

        self.store_key_content(key_id, &content, key_signer).await?;

        Ok(SsssKeyCreationInfo {
            key_id: key_id.to_owned(),
            content,
            recovery_key: key_spec.to_recovery_key(),
            key_spec,
        })
    }

    async fn store_key_content(
        &self,
        key_id: &str,
        content: &SecretStorageKeyContent,
        key_signer: Option<&dyn KeySigner>,
    ) -> Result<()> {
        let signed = match key_signer.and_then(|s| {
            content.canonical_signable().ok().and_then(|canonical| s.sign(&canonical))
        }) {
            Some(signatures) => {
                let mut signed = content.clone();
                signed.signatures = Some(signatures);
                signed
            }
            None => content.clone(),
        };

        debug!(key_id, "Storing a new secret storage key descriptor");

        self.account_data
            .set_account_data(&format!("{KEY_ID_BASE}.{key_id}"), serde_json::to_value(&signed)?)
            .await?;

        Ok(())
    }

    /// Does a key with the given id exist?
    pub async fn has_key(&self, key_id: &str) -> Result<bool> {
        Ok(self
            .account_data
            .get_account_data(&format!("{KEY_ID_BASE}.{key_id}"))
            .await?
            .is_some())
    }

    /// Fetch the descriptor of the key with the given id.
    pub async fn get_key(&self, key_id: &str) -> Result<KeyInfo> {
        let content = self
            .account_data
            .get_account_data(&format!("{KEY_ID_BASE}.{key_id}"))
            .await?
            .ok_or_else(|| SecretStorageError::UnknownKey(key_id.to_owned()))?;

        let content: SecretStorageKeyContent = serde_json::from_value(content)?;

        Ok(KeyInfo { id: key_id.to_owned(), content })
    }

    /// Make the key with the given id the default key.
    ///
    /// The key must exist. The new default is readable locally as soon as
    /// this returns, no sync round-trip is needed.
    pub async fn set_default_key(&self, key_id: &str) -> Result<()> {
        // Only an existing key may become the default.
        self.get_key(key_id).await?;

        self.account_data
            .set_account_data(DEFAULT_KEY_ID, json!({ "key": key_id }))
            .await?;

        Ok(())
    }

    /// Fetch the descriptor of the current default key.
    pub async fn get_default_key(&self) -> Result<KeyInfo> {
        let content = self
            .account_data
            .get_account_data(DEFAULT_KEY_ID)
            .await?
            .ok_or_else(|| SecretStorageError::UnknownKey(DEFAULT_KEY_ID.to_owned()))?;

        let key_id = content
            .get("key")
            .and_then(Value::as_str)
            .ok_or_else(|| SecretStorageError::UnknownKey(DEFAULT_KEY_ID.to_owned()))?;

        self.get_key(key_id).await
    }

    /// Encrypt a secret under each of the given keys and store it.
    ///
    /// The same cleartext may be stored redundantly under several keys so
    /// that, for example, both a passphrase and a recovery key can unlock
    /// it; every copy uses an independently random IV. A `KeyRef` without a
    /// key id refers to the current default key.
    pub async fn store_secret(
        &self,
        name: &str,
        secret_base64: &str,
        keys: &[KeyRef],
    ) -> Result<()> {
        let mut encrypted = BTreeMap::new();

        for key_ref in keys {
            let key_info = match &key_ref.key_id {
                Some(key_id) => self.get_key(key_id).await?,
                None => self.get_default_key().await?,
            };

            if key_info.content.algorithm != SSSS_ALGORITHM_AES_HMAC_SHA2 {
                return Err(SecretStorageError::UnsupportedAlgorithm(
                    key_info.content.algorithm,
                ));
            }

            let content = encrypt_aes_hmac_sha2(&key_ref.key_spec, name, secret_base64);
            encrypted.insert(key_info.id, content);
        }

        debug!(name, keys = encrypted.len(), "Storing an encrypted secret");

        self.account_data
            .set_account_data(name, json!({ ENCRYPTED: encrypted }))
            .await?;

        Ok(())
    }

    /// Fetch and decrypt a secret.
    ///
    /// A missing key id means the current default key. A wrong key
    /// surfaces as [`SecretStorageError::BadMac`], not as a generic
    /// failure, so callers can prompt for re-entry.
    pub async fn get_secret(
        &self,
        name: &str,
        key_id: Option<&str>,
        key_spec: &SsssKeySpec,
    ) -> Result<String> {
        let account_data = self
            .account_data
            .get_account_data(name)
            .await?
            .ok_or_else(|| SecretStorageError::UnknownSecret(name.to_owned()))?;

        let encrypted = account_data
            .get(ENCRYPTED)
            .and_then(Value::as_object)
            .ok_or_else(|| SecretStorageError::SecretNotEncrypted(name.to_owned()))?;

        let key_info = match key_id {
            Some(key_id) => self.get_key(key_id).await?,
            None => self.get_default_key().await?,
        };

        if key_info.content.algorithm != SSSS_ALGORITHM_AES_HMAC_SHA2 {
            return Err(SecretStorageError::UnsupportedAlgorithm(key_info.content.algorithm));
        }

        let secret_content = encrypted.get(&key_info.id).ok_or_else(|| {
            SecretStorageError::SecretNotEncryptedWithKey(name.to_owned(), key_info.id.clone())
        })?;

        let secret_content: EncryptedSecretContent =
            serde_json::from_value(secret_content.clone())?;

        decrypt_aes_hmac_sha2(key_spec, name, &secret_content)
    }

    /// The descriptors of every key a secret is encrypted under.
    ///
    /// Keys referenced by the secret but missing from account data are
    /// reported as per-entry errors.
    pub async fn get_algorithms_for_secret(
        &self,
        name: &str,
    ) -> Result<Vec<Result<KeyInfo>>> {
        let account_data = self
            .account_data
            .get_account_data(name)
            .await?
            .ok_or_else(|| SecretStorageError::UnknownSecret(name.to_owned()))?;

        let encrypted = account_data
            .get(ENCRYPTED)
            .and_then(Value::as_object)
            .ok_or_else(|| SecretStorageError::SecretNotEncrypted(name.to_owned()))?;

        let mut results = Vec::new();
        for key_id in encrypted.keys() {
            results.push(self.get_key(key_id).await);
        }

        Ok(results)
    }

    /// Check that every one of the given secrets has a copy encrypted under
    /// the given key, without decrypting anything.
    pub async fn check_can_access_secrets(
        &self,
        secret_names: &[&str],
        key_id: Option<&str>,
    ) -> Result<IntegrityResult> {
        if secret_names.is_empty() {
            return Ok(IntegrityResult::Error(SecretStorageError::UnknownSecret(
                "none".to_owned(),
            )));
        }

        let key_info = match key_id {
            Some(key_id) => self.get_key(key_id).await,
            None => self.get_default_key().await,
        };

        let key_info = match key_info {
            Ok(info) => info,
            Err(e) => return Ok(IntegrityResult::Error(e)),
        };

        if key_info.content.algorithm != SSSS_ALGORITHM_AES_HMAC_SHA2 {
            return Ok(IntegrityResult::Error(SecretStorageError::UnsupportedAlgorithm(
                key_info.content.algorithm,
            )));
        }

        for name in secret_names {
            let Some(event) = self.account_data.get_account_data(name).await? else {
                return Ok(IntegrityResult::Error(SecretStorageError::UnknownSecret(
                    (*name).to_owned(),
                )));
            };

            let has_copy = event
                .get(ENCRYPTED)
                .and_then(Value::as_object)
                .is_some_and(|encrypted| encrypted.contains_key(&key_info.id));

            if !has_copy {
                return Ok(IntegrityResult::Error(
                    SecretStorageError::SecretNotEncryptedWithKey(
                        (*name).to_owned(),
                        key_info.id,
                    ),
                ));
            }
        }

        Ok(IntegrityResult::Success {
            passphrase_based: key_info.content.passphrase.is_some(),
        })
    }
}

/// Encrypt a secret with the `m.secret_storage.v1.aes-hmac-sha2` scheme.
///
/// The name of the secret is the HKDF context of the key expansion, tying
/// the ciphertext to the account data type it will be stored under.
fn encrypt_aes_hmac_sha2(
    key_spec: &SsssKeySpec,
    secret_name: &str,
    clear_data_base64: &str,
) -> EncryptedSecretContent {
    let key = AesHmacSha2Key::from_secret_storage_key(key_spec.as_bytes(), secret_name);

    let (ciphertext, iv) = key.encrypt(clear_data_base64.as_bytes().to_vec(), None);
    let mac = key.create_mac_tag(&ciphertext);

    EncryptedSecretContent {
        ciphertext: encode(ciphertext),
        mac: encode(mac.as_bytes()),
        initialization_vector: encode(iv),
    }
}

/// Decrypt a secret with the `m.secret_storage.v1.aes-hmac-sha2` scheme.
///
/// The MAC is verified before any decryption happens; on a MAC mismatch no
/// plaintext is produced.
fn decrypt_aes_hmac_sha2(
    key_spec: &SsssKeySpec,
    secret_name: &str,
    content: &EncryptedSecretContent,
) -> Result<String> {
    let key = AesHmacSha2Key::from_secret_storage_key(key_spec.as_bytes(), secret_name);

    let ciphertext =
        decode(&content.ciphertext).map_err(|_| SecretStorageError::BadCipherText)?;

    let iv = decode(&content.initialization_vector)
        .map_err(|_| SecretStorageError::BadCipherText)?;
    let iv = <[u8; 16]>::try_from(iv.as_slice()).map_err(|_| SecretStorageError::BadCipherText)?;

    let mac = decode(&content.mac).map_err(|_| SecretStorageError::BadMac)?;
    let mac = <[u8; 32]>::try_from(mac.as_slice()).map_err(|_| SecretStorageError::BadMac)?;

    key.verify_mac(&ciphertext, &mac).map_err(|_| SecretStorageError::BadMac)?;

    let plaintext = key.decrypt(ciphertext, &iv);

    Ok(String::from_utf8(plaintext)?)
}
