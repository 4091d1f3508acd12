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

//! The data model for cross-signing keys and devices.
//!
//! Every type here is a value: signature attachment and trust updates produce
//! new instances instead of mutating shared state, so concurrent trust
//! computations never observe a partially updated signature map.

use std::collections::BTreeMap;

use ruma::{encryption::KeyUsage, CanonicalJsonValue, OwnedDeviceId, OwnedUserId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use vodozemac::Ed25519PublicKey;

use crate::error::SignatureError;

/// Signatures over a key: the user that made the signature, mapped to the
/// signing key id (`ed25519:<key id>`) mapped to the signature itself.
pub type SignatureMap = BTreeMap<OwnedUserId, BTreeMap<String, String>>;

/// Convert a JSON value into the canonical string form that Matrix
/// signatures are computed over.
pub(crate) fn canonical_json(value: Value) -> Result<String, SignatureError> {
    let canonical: CanonicalJsonValue =
        value.try_into().map_err(|_| SignatureError::NotAnObject)?;

    Ok(canonical.to_string())
}

/// The local trust state of a key or device.
///
/// A `TrustLevel` is an immutable value, it gets recomputed and replaced when
/// new signature evidence arrives.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustLevel {
    /// Whether the trust was established through the cross-signing key
    /// graph.
    pub cross_signing_verified: bool,
    /// Whether the user verified the key on this device, for example by
    /// scanning a QR code or comparing emoji.
    pub locally_verified: Option<bool>,
}

impl TrustLevel {
    /// Create a new `TrustLevel` with the given verification states.
    pub fn new(cross_signing_verified: bool, locally_verified: Option<bool>) -> Self {
        Self { cross_signing_verified, locally_verified }
    }

    /// Is the key verified through either of the two trust paths?
    pub fn is_verified(&self) -> bool {
        self.cross_signing_verified || self.locally_verified == Some(true)
    }

    /// Has the key been verified through the cross-signing key graph?
    pub fn is_cross_signing_verified(&self) -> bool {
        self.cross_signing_verified
    }

    /// Has the key been verified locally on this device?
    pub fn is_locally_verified(&self) -> bool {
        self.locally_verified == Some(true)
    }
}

/// A single cross-signing key of a user, as uploaded to the homeserver.
///
/// The key id in the `keys` map is `ed25519:` followed by the unpadded
/// base64 of the public key itself. `trust_level` is local state and never
/// leaves this device.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CrossSigningKey {
    /// The ID of the user the key belongs to.
    pub user_id: OwnedUserId,

    /// What the key is used for. A well-formed key carries at least one
    /// usage and is only ever used for the purposes declared here.
    pub usage: Vec<KeyUsage>,

    /// The public key, the map must have exactly one entry.
    pub keys: BTreeMap<String, String>,

    /// Signatures that other keys and devices have made over this key.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub signatures: SignatureMap,

    /// The local trust state of this key.
    #[serde(skip)]
    pub trust_level: TrustLevel,
}

impl CrossSigningKey {
    /// Create a new `CrossSigningKey` for the given user, usages and public
    /// key.
    pub fn new(user_id: OwnedUserId, usage: Vec<KeyUsage>, public_key_base64: &str) -> Self {
        let keys = BTreeMap::from([(
            format!("ed25519:{public_key_base64}"),
            public_key_base64.to_owned(),
        )]);

        Self { user_id, usage, keys, signatures: SignatureMap::new(), trust_level: TrustLevel::default() }
    }

    /// The unpadded base64 representation of the public key.
    pub fn public_key_base64(&self) -> Option<&str> {
        self.keys.values().next().map(String::as_str)
    }

    /// The public key as an Ed25519 key.
    pub fn public_key(&self) -> Result<Ed25519PublicKey, SignatureError> {
        let key = self.public_key_base64().ok_or(SignatureError::UnsupportedAlgorithm)?;
        Ok(Ed25519PublicKey::from_base64(key)?)
    }

    /// Is this a master key?
    pub fn is_master_key(&self) -> bool {
        self.usage.contains(&KeyUsage::Master)
    }

    /// Is this a self-signing key?
    pub fn is_self_signing_key(&self) -> bool {
        self.usage.contains(&KeyUsage::SelfSigning)
    }

    /// Is this a user-signing key?
    pub fn is_user_signing_key(&self) -> bool {
        self.usage.contains(&KeyUsage::UserSigning)
    }

    /// The JSON object that signatures over this key are computed over.
    ///
    /// Signatures and local trust state are not part of the signed data.
    pub fn signable_json(&self) -> Value {
        json!({
            "user_id": self.user_id,
            "usage": self.usage,
            "keys": self.keys,
        })
    }

    /// The canonical JSON string that signatures over this key are computed
    /// over.
    pub fn canonical_signable(&self) -> Result<String, SignatureError> {
        canonical_json(self.signable_json())
    }

    /// Return a copy of this key with an additional signature attached.
    ///
    /// The signature is recorded under the given user as
    /// `ed25519:<key id>`. The original value is left untouched so readers
    /// holding it never observe the new signature map in a half-written
    /// state.
    pub fn add_signature_and_copy(
        &self,
        user_id: OwnedUserId,
        key_id: &str,
        signature: String,
    ) -> Self {
        let mut copy = self.clone();
        copy.signatures.entry(user_id).or_default().insert(format!("ed25519:{key_id}"), signature);

        copy
    }
}

/// The complete set of cross-signing keys that is known for a user.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserCrossSigningKeys {
    /// The ID of the user the keys belong to.
    pub user_id: OwnedUserId,
    /// The keys, at most one per usage in a well-formed set.
    pub keys: Vec<CrossSigningKey>,
}

impl UserCrossSigningKeys {
    /// Create a new set of cross-signing keys for the given user.
    pub fn new(user_id: OwnedUserId, keys: Vec<CrossSigningKey>) -> Self {
        Self { user_id, keys }
    }

    /// The master key, if one is known.
    pub fn master_key(&self) -> Option<&CrossSigningKey> {
        self.keys.iter().find(|k| k.is_master_key())
    }

    /// The self-signing key, if one is known.
    pub fn self_signing_key(&self) -> Option<&CrossSigningKey> {
        self.keys.iter().find(|k| k.is_self_signing_key())
    }

    /// The user-signing key, if one is known.
    pub fn user_signing_key(&self) -> Option<&CrossSigningKey> {
        self.keys.iter().find(|k| k.is_user_signing_key())
    }

    /// Is this user trusted?
    ///
    /// Trust requires both the master key and the self-signing key to be
    /// independently marked as verified.
    pub fn is_trusted(&self) -> bool {
        self.master_key().is_some_and(|k| k.trust_level.is_verified())
            && self.self_signing_key().is_some_and(|k| k.trust_level.is_verified())
    }
}

/// The identity keys and signatures of a single device.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CryptoDevice {
    /// The ID of the user the device belongs to.
    pub user_id: OwnedUserId,

    /// The unique ID of the device.
    pub device_id: OwnedDeviceId,

    /// The encryption algorithms the device supports.
    pub algorithms: Vec<String>,

    /// The public identity keys of the device, keyed by `<algorithm>:<device
    /// id>`.
    pub keys: BTreeMap<String, String>,

    /// Signatures over the device keys.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub signatures: SignatureMap,

    /// The local trust state of this device.
    #[serde(skip)]
    pub trust_level: TrustLevel,
}

impl CryptoDevice {
    /// Create a new `CryptoDevice` with the given Ed25519 identity key.
    pub fn new(user_id: OwnedUserId, device_id: OwnedDeviceId, ed25519_key_base64: &str) -> Self {
        let keys =
            BTreeMap::from([(format!("ed25519:{device_id}"), ed25519_key_base64.to_owned())]);

        Self {
            user_id,
            device_id,
            algorithms: vec![
                "m.olm.v1.curve25519-aes-sha2".to_owned(),
                "m.megolm.v1.aes-sha2".to_owned(),
            ],
            keys,
            signatures: SignatureMap::new(),
            trust_level: TrustLevel::default(),
        }
    }

    /// The Ed25519 fingerprint key of the device, as unpadded base64.
    pub fn fingerprint(&self) -> Option<&str> {
        self.keys.get(&format!("ed25519:{}", self.device_id)).map(String::as_str)
    }

    /// The JSON object that signatures over this device are computed over.
    pub fn signable_json(&self) -> Value {
        json!({
            "user_id": self.user_id,
            "device_id": self.device_id,
            "algorithms": self.algorithms,
            "keys": self.keys,
        })
    }

    /// The canonical JSON string that signatures over this device are
    /// computed over.
    pub fn canonical_signable(&self) -> Result<String, SignatureError> {
        canonical_json(self.signable_json())
    }

    /// Return a copy of this device with an additional signature attached.
    pub fn add_signature_and_copy(
        &self,
        user_id: OwnedUserId,
        key_id: &str,
        signature: String,
    ) -> Self {
        let mut copy = self.clone();
        copy.signatures.entry(user_id).or_default().insert(format!("ed25519:{key_id}"), signature);

        copy
    }

    /// The signature that the given user's key made over this device, if
    /// any.
    pub fn signature_by(&self, user_id: &UserId, key_id: &str) -> Option<&str> {
        self.signatures
            .get(user_id)
            .and_then(|sigs| sigs.get(&format!("ed25519:{key_id}")))
            .map(String::as_str)
    }
}
