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

//! Trust computations over the cross-signing key graph.
//!
//! A user is trusted when their master key carries a valid signature from
//! our user-signing key; a device is trusted when its keys carry a valid
//! signature from its owner's self-signing key, and the owner is trusted.
//! The walks never mutate the key graph, trust marks are written back
//! through the [`IdentityStore`] as whole-value replacements.

use std::sync::Arc;

use ruma::{DeviceId, OwnedDeviceId, OwnedUserId, UserId};
use thiserror::Error;
use tracing::{debug, trace, warn};
use vodozemac::{Ed25519PublicKey, Ed25519SecretKey, Ed25519Signature};

use crate::{
    error::SignatureError,
    store::IdentityStore,
    types::{CrossSigningKey, CryptoDevice, TrustLevel, UserCrossSigningKeys},
};

/// Verify an Ed25519 signature over a canonical JSON string.
pub(crate) fn verify_signature(
    signing_key_base64: &str,
    canonical_json: &str,
    signature_base64: &str,
) -> Result<(), SignatureError> {
    let key = Ed25519PublicKey::from_base64(signing_key_base64)?;
    let signature = Ed25519Signature::from_base64(signature_base64)?;

    Ok(key.verify(canonical_json.as_bytes(), &signature)?)
}

/// The outcome of checking whether we trust another user.
///
/// Everything except [`UserTrustResult::Success`] is an expected, common
/// outcome for a user that simply hasn't been verified yet; callers branch
/// on the variant to decide what to surface in the UI.
#[derive(Clone, Debug)]
pub enum UserTrustResult {
    /// The trust chain is intact, the user is verified.
    Success,
    /// We don't have cross-signing keys of our own, so we can't vouch for
    /// anyone.
    CrossSigningNotConfigured(OwnedUserId),
    /// We don't know any cross-signing keys for the queried user.
    UnknownCrossSigningInfo(OwnedUserId),
    /// Our own keys aren't trusted, so none of our signatures count.
    KeysNotTrusted(UserCrossSigningKeys),
    /// The user's master key carries no signature from our user-signing
    /// key.
    KeyNotSigned(CrossSigningKey),
    /// A signature is present but cryptographically invalid.
    InvalidSignature(CrossSigningKey, String),
}

impl UserTrustResult {
    /// Does this result mean the user is verified?
    pub fn is_verified(&self) -> bool {
        matches!(self, UserTrustResult::Success)
    }
}

/// The outcome of checking whether we trust a specific device.
#[derive(Debug)]
pub enum DeviceTrustResult {
    /// The trust chain is intact, the resulting trust level is attached.
    Success(TrustLevel),
    /// The device is not known at all.
    UnknownDevice(OwnedDeviceId),
    /// One of the two users doesn't have cross-signing keys.
    CrossSigningNotConfigured(OwnedUserId),
    /// The relevant cross-signing keys exist but aren't trusted.
    KeysNotTrusted(UserCrossSigningKeys),
    /// The device carries no signature from its owner's self-signing key.
    MissingDeviceSignature(OwnedDeviceId, String),
    /// The device signature is present but cryptographically invalid.
    InvalidDeviceSignature(OwnedDeviceId, String, SignatureError),
}

impl DeviceTrustResult {
    /// Does this result mean the device is verified through cross-signing?
    pub fn is_cross_signed_verified(&self) -> bool {
        match self {
            DeviceTrustResult::Success(level) => level.is_cross_signing_verified(),
            _ => false,
        }
    }

    /// Does this result mean the device is verified at all?
    pub fn is_verified(&self) -> bool {
        match self {
            DeviceTrustResult::Success(level) => level.is_verified(),
            _ => false,
        }
    }
}

/// Error type for the operations that create new signatures.
#[derive(Debug, Error)]
pub enum TrustError {
    /// Cross-signing is not set up for the given user.
    #[error("cross-signing is not set up for {0}")]
    NotConfigured(OwnedUserId),

    /// The key that should be signed is not known.
    #[error("the master key of {0} is not known")]
    UnknownMasterKey(OwnedUserId),

    /// The device that should be signed is not known.
    #[error("the device {0} is not known, or not ours")]
    UnknownDevice(OwnedDeviceId),

    /// We don't have the private key that would be needed for this
    /// signature.
    #[error("the private {0} key is not available for signing")]
    MissingPrivateKey(&'static str),

    /// Serializing the object to be signed failed.
    #[error(transparent)]
    Signature(#[from] SignatureError),
}

/// The private parts of our own cross-signing identity.
///
/// Any of the keys may be missing, a device that never completed
/// verification typically only learns them after a successful secret
/// storage recovery.
#[derive(Default)]
pub struct CrossSigningPrivateKeys {
    /// The private master key.
    pub master: Option<Ed25519SecretKey>,
    /// The private user-signing key, used to sign other users' master keys.
    pub user_signing: Option<Ed25519SecretKey>,
    /// The private self-signing key, used to sign our own devices.
    pub self_signing: Option<Ed25519SecretKey>,
}

impl std::fmt::Debug for CrossSigningPrivateKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrossSigningPrivateKeys")
            .field("master", &self.master.is_some())
            .field("user_signing", &self.user_signing.is_some())
            .field("self_signing", &self.self_signing.is_some())
            .finish()
    }
}

/// The engine computing trust states from the cross-signing key graph.
#[derive(Debug)]
pub struct CrossSigningService {
    user_id: OwnedUserId,
    store: Arc<dyn IdentityStore>,
    private_keys: CrossSigningPrivateKeys,
}

impl CrossSigningService {
    /// Create a new `CrossSigningService` for the given user without any
    /// private key material.
    pub fn new(user_id: OwnedUserId, store: Arc<dyn IdentityStore>) -> Self {
        Self { user_id, store, private_keys: CrossSigningPrivateKeys::default() }
    }

    /// Create a new `CrossSigningService` that owns (some of) the private
    /// cross-signing keys and can thus create new signatures.
    pub fn with_private_keys(
        user_id: OwnedUserId,
        store: Arc<dyn IdentityStore>,
        private_keys: CrossSigningPrivateKeys,
    ) -> Self {
        Self { user_id, store, private_keys }
    }

    /// The user this service computes trust for.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Is the given user trusted, going by the trust marks in the store?
    pub fn is_user_trusted(&self, user_id: &UserId) -> bool {
        self.store.get_cross_signing_info(user_id).is_some_and(|i| i.is_trusted())
    }

    /// Walk the signature chain to decide whether we trust the given user.
    ///
    /// This verifies signatures, it does not consult the cached trust marks.
    pub fn check_user_trust(&self, other_user_id: &UserId) -> UserTrustResult {
        trace!(user_id = %other_user_id, "Checking user trust");

        if other_user_id == self.user_id {
            return self.check_self_trust();
        }

        let Some(my_info) = self.store.get_cross_signing_info(&self.user_id) else {
            return UserTrustResult::CrossSigningNotConfigured(self.user_id.clone());
        };

        let Some(my_user_key_base64) =
            my_info.user_signing_key().and_then(|k| k.public_key_base64()).map(ToOwned::to_owned)
        else {
            return UserTrustResult::CrossSigningNotConfigured(self.user_id.clone());
        };

        if !my_info.is_trusted() {
            return UserTrustResult::KeysNotTrusted(my_info);
        }

        let other_master = match self
            .store
            .get_cross_signing_info(other_user_id)
            .as_ref()
            .and_then(|i| i.master_key())
        {
            Some(key) => key.clone(),
            None => return UserTrustResult::UnknownCrossSigningInfo(other_user_id.to_owned()),
        };

        let signature = other_master
            .signatures
            .get(&self.user_id)
            .and_then(|sigs| sigs.get(&format!("ed25519:{my_user_key_base64}")))
            .cloned();

        let Some(signature) = signature else {
            debug!(
                user_id = %other_user_id,
                "The master key is not signed by our user-signing key"
            );
            return UserTrustResult::KeyNotSigned(other_master);
        };

        let canonical = match other_master.canonical_signable() {
            Ok(canonical) => canonical,
            Err(_) => return UserTrustResult::InvalidSignature(other_master, signature),
        };

        if verify_signature(&my_user_key_base64, &canonical, &signature).is_err() {
            return UserTrustResult::InvalidSignature(other_master, signature);
        }

        UserTrustResult::Success
    }

    /// Check the trust chain of our own identity: the master key must be
    /// trusted, and it must have signed both the user-signing and the
    /// self-signing key.
    ///
    /// The master key counts as trusted if it was locally verified, if we
    /// hold a private key matching it, or if a locally verified device of
    /// ours has validly signed it.
    pub fn check_self_trust(&self) -> UserTrustResult {
        let Some(my_info) = self.store.get_cross_signing_info(&self.user_id) else {
            return UserTrustResult::CrossSigningNotConfigured(self.user_id.clone());
        };

        let Some(master) = my_info.master_key().cloned() else {
            return UserTrustResult::CrossSigningNotConfigured(self.user_id.clone());
        };

        let Some(master_base64) = master.public_key_base64().map(ToOwned::to_owned) else {
            return UserTrustResult::KeysNotTrusted(my_info);
        };

        let mut master_trusted = master.trust_level.is_locally_verified();

        if !master_trusted {
            if let Some(private_master) = &self.private_keys.master {
                master_trusted = private_master.public_key().to_base64() == master_base64;
            } else if let Some(signatures) = master.signatures.get(&self.user_id) {
                // Maybe a locally verified device of ours has signed it.
                for (key_id, signature) in signatures {
                    let device_id = key_id.trim_start_matches("ed25519:");
                    let Some(device) = self.store.get_device(&self.user_id, device_id.into())
                    else {
                        continue;
                    };

                    if !device.trust_level.is_locally_verified() {
                        continue;
                    }

                    let (Some(fingerprint), Ok(canonical)) =
                        (device.fingerprint(), master.canonical_signable())
                    else {
                        continue;
                    };

                    match verify_signature(fingerprint, &canonical, signature) {
                        Ok(()) => {
                            master_trusted = true;
                            break;
                        }
                        Err(e) => warn!(device_id, "Device signature over our master key does not verify: {e}"),
                    }
                }
            }
        }

        if !master_trusted {
            return UserTrustResult::KeysNotTrusted(my_info);
        }

        let Some(user_key) = my_info.user_signing_key().cloned() else {
            return UserTrustResult::CrossSigningNotConfigured(self.user_id.clone());
        };

        if let Some(result) = self.check_subkey_signature(&master_base64, &user_key) {
            return result;
        }

        let Some(self_signing_key) = my_info.self_signing_key().cloned() else {
            return UserTrustResult::CrossSigningNotConfigured(self.user_id.clone());
        };

        if let Some(result) = self.check_subkey_signature(&master_base64, &self_signing_key) {
            return result;
        }

        UserTrustResult::Success
    }

    /// Check that the master key has validly signed the given subkey.
    /// Returns `None` if the chain is intact.
    fn check_subkey_signature(
        &self,
        master_base64: &str,
        subkey: &CrossSigningKey,
    ) -> Option<UserTrustResult> {
        let signature = subkey
            .signatures
            .get(&self.user_id)
            .and_then(|sigs| sigs.get(&format!("ed25519:{master_base64}")))
            .cloned();

        let Some(signature) = signature else {
            return Some(UserTrustResult::KeyNotSigned(subkey.clone()));
        };

        let canonical = match subkey.canonical_signable() {
            Ok(canonical) => canonical,
            Err(_) => return Some(UserTrustResult::InvalidSignature(subkey.clone(), signature)),
        };

        if verify_signature(master_base64, &canonical, &signature).is_err() {
            return Some(UserTrustResult::InvalidSignature(subkey.clone(), signature));
        }

        None
    }

    /// Walk the signature chain to decide whether we trust the given
    /// device.
    ///
    /// The device must carry a valid signature from its owner's self-signing
    /// key and both our and the owner's cross-signing keys must be trusted.
    /// If the chain is broken but the device was verified locally, the local
    /// verification wins as a legacy fallback.
    pub fn check_device_trust(
        &self,
        other_user_id: &UserId,
        other_device_id: &DeviceId,
        locally_trusted: Option<bool>,
    ) -> DeviceTrustResult {
        let Some(other_device) = self.store.get_device(other_user_id, other_device_id) else {
            return DeviceTrustResult::UnknownDevice(other_device_id.to_owned());
        };

        let Some(my_keys) = self.store.get_cross_signing_info(&self.user_id) else {
            return Self::legacy_fallback_trust(
                locally_trusted,
                DeviceTrustResult::CrossSigningNotConfigured(self.user_id.clone()),
            );
        };

        if !my_keys.is_trusted() {
            return Self::legacy_fallback_trust(
                locally_trusted,
                DeviceTrustResult::KeysNotTrusted(my_keys),
            );
        }

        let Some(other_keys) = self.store.get_cross_signing_info(other_user_id) else {
            return Self::legacy_fallback_trust(
                locally_trusted,
                DeviceTrustResult::CrossSigningNotConfigured(other_user_id.to_owned()),
            );
        };

        if !other_keys.is_trusted() {
            return Self::legacy_fallback_trust(
                locally_trusted,
                DeviceTrustResult::KeysNotTrusted(other_keys),
            );
        }

        let Some(ssk_base64) =
            other_keys.self_signing_key().and_then(|k| k.public_key_base64()).map(ToOwned::to_owned)
        else {
            return Self::legacy_fallback_trust(
                locally_trusted,
                DeviceTrustResult::CrossSigningNotConfigured(other_user_id.to_owned()),
            );
        };

        let Some(signature) =
            other_device.signature_by(other_user_id, &ssk_base64).map(ToOwned::to_owned)
        else {
            return Self::legacy_fallback_trust(
                locally_trusted,
                DeviceTrustResult::MissingDeviceSignature(
                    other_device_id.to_owned(),
                    ssk_base64,
                ),
            );
        };

        let canonical = match other_device.canonical_signable() {
            Ok(canonical) => canonical,
            Err(e) => {
                return Self::legacy_fallback_trust(
                    locally_trusted,
                    DeviceTrustResult::InvalidDeviceSignature(
                        other_device_id.to_owned(),
                        signature,
                        e,
                    ),
                )
            }
        };

        if let Err(e) = verify_signature(&ssk_base64, &canonical, &signature) {
            return Self::legacy_fallback_trust(
                locally_trusted,
                DeviceTrustResult::InvalidDeviceSignature(other_device_id.to_owned(), signature, e),
            );
        }

        DeviceTrustResult::Success(TrustLevel::new(true, locally_trusted))
    }

    fn legacy_fallback_trust(
        locally_trusted: Option<bool>,
        result: DeviceTrustResult,
    ) -> DeviceTrustResult {
        if locally_trusted == Some(true) {
            DeviceTrustResult::Success(TrustLevel::new(false, Some(true)))
        } else {
            result
        }
    }

    /// Sign the given user's master key with our user-signing key and mark
    /// the user as trusted.
    ///
    /// Returns the newly signed master key; uploading the signature to the
    /// homeserver is the caller's concern.
    pub fn trust_user(&self, other_user_id: &UserId) -> Result<CrossSigningKey, TrustError> {
        debug!(user_id = %other_user_id, "Marking user as trusted");

        let other_info = self
            .store
            .get_cross_signing_info(other_user_id)
            .ok_or_else(|| TrustError::UnknownMasterKey(other_user_id.to_owned()))?;
        let other_master = other_info
            .master_key()
            .cloned()
            .ok_or_else(|| TrustError::UnknownMasterKey(other_user_id.to_owned()))?;

        let my_info = self
            .store
            .get_cross_signing_info(&self.user_id)
            .ok_or_else(|| TrustError::NotConfigured(self.user_id.clone()))?;
        let user_key_base64 = my_info
            .user_signing_key()
            .and_then(|k| k.public_key_base64())
            .map(ToOwned::to_owned)
            .ok_or_else(|| TrustError::NotConfigured(self.user_id.clone()))?;

        let signing_key = self
            .private_keys
            .user_signing
            .as_ref()
            .ok_or(TrustError::MissingPrivateKey("user-signing"))?;

        let canonical = other_master.canonical_signable()?;
        let signature = signing_key.sign(canonical.as_bytes());

        let signed = other_master.add_signature_and_copy(
            self.user_id.clone(),
            &user_key_base64,
            signature.to_base64(),
        );

        let mut updated = other_info;
        for key in &mut updated.keys {
            if key.is_master_key() {
                *key = signed.clone();
            }
        }
        self.store.store_cross_signing_info(updated);
        self.store.set_user_keys_as_trusted(other_user_id, true);

        Ok(signed)
    }

    /// Sign one of our own devices with our self-signing key and mark it as
    /// trusted.
    ///
    /// Returns the newly signed device; uploading the signature to the
    /// homeserver is the caller's concern.
    pub fn trust_device(&self, device_id: &DeviceId) -> Result<CryptoDevice, TrustError> {
        debug!(%device_id, "Marking own device as trusted");

        let device = self
            .store
            .get_device(&self.user_id, device_id)
            .ok_or_else(|| TrustError::UnknownDevice(device_id.to_owned()))?;

        let my_info = self
            .store
            .get_cross_signing_info(&self.user_id)
            .ok_or_else(|| TrustError::NotConfigured(self.user_id.clone()))?;
        let ssk_base64 = my_info
            .self_signing_key()
            .and_then(|k| k.public_key_base64())
            .map(ToOwned::to_owned)
            .ok_or_else(|| TrustError::NotConfigured(self.user_id.clone()))?;

        let signing_key = self
            .private_keys
            .self_signing
            .as_ref()
            .ok_or(TrustError::MissingPrivateKey("self-signing"))?;

        let canonical = device.canonical_signable()?;
        let signature = signing_key.sign(canonical.as_bytes());

        let signed = device.add_signature_and_copy(
            self.user_id.clone(),
            &ssk_base64,
            signature.to_base64(),
        );

        self.store.store_device(signed.clone());
        self.store.set_device_trust(
            &self.user_id,
            device_id,
            TrustLevel::new(true, Some(device.trust_level.is_locally_verified())),
        );

        Ok(signed)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use ruma::{encryption::KeyUsage, OwnedUserId, UserId};
    use vodozemac::Ed25519SecretKey;

    use crate::types::{CrossSigningKey, CryptoDevice, UserCrossSigningKeys};

    /// A freshly generated, internally consistent cross-signing identity.
    pub(crate) struct TestIdentity {
        pub user_id: OwnedUserId,
        pub master: Ed25519SecretKey,
        pub user_signing: Ed25519SecretKey,
        pub self_signing: Ed25519SecretKey,
        pub info: UserCrossSigningKeys,
    }

    impl TestIdentity {
        pub(crate) fn new(user_id: &UserId) -> Self {
            let master = Ed25519SecretKey::new();
            let user_signing = Ed25519SecretKey::new();
            let self_signing = Ed25519SecretKey::new();

            let master_base64 = master.public_key().to_base64();

            let master_key = CrossSigningKey::new(
                user_id.to_owned(),
                vec![KeyUsage::Master],
                &master_base64,
            );

            let mut subkeys = Vec::new();
            for (usage, secret) in
                [(KeyUsage::UserSigning, &user_signing), (KeyUsage::SelfSigning, &self_signing)]
            {
                let key = CrossSigningKey::new(
                    user_id.to_owned(),
                    vec![usage],
                    &secret.public_key().to_base64(),
                );
                let canonical = key.canonical_signable().unwrap();
                let signature = master.sign(canonical.as_bytes());
                subkeys.push(key.add_signature_and_copy(
                    user_id.to_owned(),
                    &master_base64,
                    signature.to_base64(),
                ));
            }

            let mut keys = vec![master_key];
            keys.append(&mut subkeys);

            Self {
                user_id: user_id.to_owned(),
                master,
                user_signing,
                self_signing,
                info: UserCrossSigningKeys::new(user_id.to_owned(), keys),
            }
        }

        pub(crate) fn master_base64(&self) -> String {
            self.master.public_key().to_base64()
        }

        /// Create a device of this user, validly signed by the self-signing
        /// key.
        pub(crate) fn signed_device(&self, device_id: &ruma::DeviceId) -> CryptoDevice {
            let device_secret = Ed25519SecretKey::new();
            let device = CryptoDevice::new(
                self.user_id.clone(),
                device_id.to_owned(),
                &device_secret.public_key().to_base64(),
            );

            let canonical = device.canonical_signable().unwrap();
            let signature = self.self_signing.sign(canonical.as_bytes());

            device.add_signature_and_copy(
                self.user_id.clone(),
                &self.self_signing.public_key().to_base64(),
                signature.to_base64(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches::assert_matches;
    use ruma::{device_id, user_id};
    use vodozemac::Ed25519SecretKey;

    use super::{testing::TestIdentity, *};
    use crate::store::MemoryIdentityStore;

    fn service_for(
        identity: &TestIdentity,
        store: Arc<MemoryIdentityStore>,
    ) -> CrossSigningService {
        store.store_cross_signing_info(identity.info.clone());
        store.set_user_keys_as_trusted(&identity.user_id, true);

        CrossSigningService::with_private_keys(
            identity.user_id.clone(),
            store,
            CrossSigningPrivateKeys {
                master: None,
                user_signing: Some(Ed25519SecretKey::from_slice(
                    &identity.user_signing.to_bytes(),
                )),
                self_signing: Some(Ed25519SecretKey::from_slice(
                    &identity.self_signing.to_bytes(),
                )),
            },
        )
    }

    #[test]
    fn unsigned_master_key_is_not_trusted() {
        let store = Arc::new(MemoryIdentityStore::new());
        let alice = TestIdentity::new(user_id!("@alice:localhost"));
        let bob = TestIdentity::new(user_id!("@bob:localhost"));

        let service = service_for(&alice, store.clone());
        store.store_cross_signing_info(bob.info.clone());

        let result = service.check_user_trust(&bob.user_id);
        assert_matches!(result, UserTrustResult::KeyNotSigned(_));
    }

    #[test]
    fn missing_own_keys_means_not_configured() {
        let store = Arc::new(MemoryIdentityStore::new());
        let service =
            CrossSigningService::new(user_id!("@alice:localhost").to_owned(), store.clone());

        let bob = TestIdentity::new(user_id!("@bob:localhost"));
        store.store_cross_signing_info(bob.info.clone());

        let result = service.check_user_trust(&bob.user_id);
        assert_matches!(result, UserTrustResult::CrossSigningNotConfigured(user) => {
            assert_eq!(user, user_id!("@alice:localhost"));
        });
    }

    #[test]
    fn unknown_other_user() {
        let store = Arc::new(MemoryIdentityStore::new());
        let alice = TestIdentity::new(user_id!("@alice:localhost"));
        let service = service_for(&alice, store);

        let result = service.check_user_trust(user_id!("@bob:localhost"));
        assert_matches!(result, UserTrustResult::UnknownCrossSigningInfo(_));
    }

    #[test]
    fn valid_signature_establishes_trust() {
        let store = Arc::new(MemoryIdentityStore::new());
        let alice = TestIdentity::new(user_id!("@alice:localhost"));
        let bob = TestIdentity::new(user_id!("@bob:localhost"));

        let service = service_for(&alice, store.clone());
        store.store_cross_signing_info(bob.info.clone());

        assert!(!service.is_user_trusted(&bob.user_id));

        let signed = service.trust_user(&bob.user_id).expect("We should be able to sign Bob");
        assert_eq!(signed.user_id, bob.user_id);

        let result = service.check_user_trust(&bob.user_id);
        assert_matches!(result, UserTrustResult::Success);
        assert!(service.is_user_trusted(&bob.user_id));
    }

    #[test]
    fn tampered_signature_is_invalid() {
        let store = Arc::new(MemoryIdentityStore::new());
        let alice = TestIdentity::new(user_id!("@alice:localhost"));
        let bob = TestIdentity::new(user_id!("@bob:localhost"));

        let service = service_for(&alice, store.clone());

        // Sign something that isn't Bob's master key.
        let signature = alice.user_signing.sign(b"not the canonical master key");
        let master = bob.info.master_key().unwrap().add_signature_and_copy(
            alice.user_id.clone(),
            &alice.user_signing.public_key().to_base64(),
            signature.to_base64(),
        );

        let mut info = bob.info.clone();
        info.keys = vec![master];
        store.store_cross_signing_info(info);

        let result = service.check_user_trust(&bob.user_id);
        assert_matches!(result, UserTrustResult::InvalidSignature(..));
    }

    #[test]
    fn self_signing_key_is_not_accepted_as_a_master_key() {
        let store = Arc::new(MemoryIdentityStore::new());
        let alice = TestIdentity::new(user_id!("@alice:localhost"));
        let bob = TestIdentity::new(user_id!("@bob:localhost"));

        let service = service_for(&alice, store.clone());

        // Bob's identity only contains keys tagged for self-signing; no key
        // may stand in for a master key it wasn't declared as.
        let mut info = bob.info.clone();
        info.keys.retain(|k| k.is_self_signing_key());
        store.store_cross_signing_info(info);

        let result = service.check_user_trust(&bob.user_id);
        assert_matches!(result, UserTrustResult::UnknownCrossSigningInfo(_));
    }

    #[test]
    fn device_trust_chain() {
        let store = Arc::new(MemoryIdentityStore::new());
        let alice = TestIdentity::new(user_id!("@alice:localhost"));
        let bob = TestIdentity::new(user_id!("@bob:localhost"));

        let service = service_for(&alice, store.clone());
        store.store_cross_signing_info(bob.info.clone());
        store.set_user_keys_as_trusted(&bob.user_id, true);

        let device_id = device_id!("BOBDEVICE");

        let result = service.check_device_trust(&bob.user_id, device_id, None);
        assert_matches!(result, DeviceTrustResult::UnknownDevice(_));

        // An unsigned device is missing its self-signing signature.
        let device_secret = Ed25519SecretKey::new();
        store.store_device(CryptoDevice::new(
            bob.user_id.clone(),
            device_id.to_owned(),
            &device_secret.public_key().to_base64(),
        ));
        let result = service.check_device_trust(&bob.user_id, device_id, None);
        assert_matches!(result, DeviceTrustResult::MissingDeviceSignature(..));

        // The local verification fallback still applies.
        let result = service.check_device_trust(&bob.user_id, device_id, Some(true));
        assert_matches!(result, DeviceTrustResult::Success(level) => {
            assert!(!level.is_cross_signing_verified());
            assert!(level.is_locally_verified());
        });

        // A properly signed device completes the chain.
        store.store_device(bob.signed_device(device_id));
        let result = service.check_device_trust(&bob.user_id, device_id, None);
        assert_matches!(result, DeviceTrustResult::Success(level) => {
            assert!(level.is_cross_signing_verified());
        });
    }

    #[test]
    fn self_trust_needs_a_trusted_master_key() {
        let store = Arc::new(MemoryIdentityStore::new());
        let alice = TestIdentity::new(user_id!("@alice:localhost"));

        store.store_cross_signing_info(alice.info.clone());
        let service = CrossSigningService::new(alice.user_id.clone(), store.clone());

        // Nothing marks the master key as trusted yet.
        let result = service.check_self_trust();
        assert_matches!(result, UserTrustResult::KeysNotTrusted(_));

        // Holding the matching private master key is enough.
        let service = CrossSigningService::with_private_keys(
            alice.user_id.clone(),
            store.clone(),
            CrossSigningPrivateKeys {
                master: Some(Ed25519SecretKey::from_slice(&alice.master.to_bytes())),
                user_signing: None,
                self_signing: None,
            },
        );
        let result = service.check_self_trust();
        assert_matches!(result, UserTrustResult::Success);

        // So is a locally verified master key.
        store.mark_master_key_locally_trusted(&alice.user_id, true);
        let service = CrossSigningService::new(alice.user_id.clone(), store);
        let result = service.check_self_trust();
        assert_matches!(result, UserTrustResult::Success);
    }
}
