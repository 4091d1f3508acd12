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

use aes::{
    cipher::{generic_array::GenericArray, IvSizeUser, KeyIvInit, KeySizeUser, StreamCipher},
    Aes256,
};
use ctr::Ctr128BE;
use hkdf::Hkdf;
use hmac::{
    digest::{FixedOutput, MacError},
    Hmac, Mac as _,
};
use rand::{thread_rng, RngCore};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub(crate) const IV_SIZE: usize = 16;
pub(crate) const KEY_SIZE: usize = 32;
pub(crate) const MAC_SIZE: usize = 32;

type Aes256Ctr = Ctr128BE<Aes256>;

type Aes256Key = GenericArray<u8, <Aes256Ctr as KeySizeUser>::KeySize>;
type Aes256Iv = GenericArray<u8, <Aes256Ctr as IvSizeUser>::IvSize>;
type HmacSha256Key = [u8; KEY_SIZE];

/// Derive key material from a master secret using HKDF-SHA-256 (RFC 5869).
///
/// A missing salt is treated as 32 zero bytes, the `info` bytes bind the
/// derived keys to their usage context. The derivation is deterministic and
/// side-effect free.
///
/// # Panics
///
/// Panics if more than `255 * 32` output bytes are requested, which RFC 5869
/// forbids. All callers in this crate request 64 bytes.
pub(crate) fn derive_secret(
    input_key_material: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    output_length: usize,
) -> Vec<u8> {
    let hkdf = Hkdf::<Sha256>::new(salt, input_key_material);
    let mut output = vec![0u8; output_length];

    hkdf.expand(info, &mut output)
        .expect("the requested HKDF output length must be at most 255 * 32 bytes");

    output
}

/// An authentication tag for the HMAC-SHA-256 message authentication
/// algorithm.
#[derive(Debug)]
pub(crate) struct HmacSha256Mac([u8; MAC_SIZE]);

impl HmacSha256Mac {
    /// Represent the MAC tag as an array of bytes.
    pub(crate) fn as_bytes(&self) -> &[u8; MAC_SIZE] {
        &self.0
    }
}

/// The result of encrypting 32 zero bytes under a candidate key, used to
/// check that a key is correct without touching any real secret.
#[derive(Debug)]
pub(crate) struct KeyCheck {
    pub(crate) iv: [u8; IV_SIZE],
    pub(crate) mac: HmacSha256Mac,
}

/// Keys used for our combination of AES-CTR-256 and HMAC-SHA-256, the
/// `m.secret_storage.v1.aes-hmac-sha2` algorithm.
///
/// ⚠️  This struct provides low-level cryptographic primitives. The MAC tag
/// must be created after encrypting and verified before decrypting, the
/// methods don't enforce the order themselves.
#[derive(Zeroize, ZeroizeOnDrop)]
pub(crate) struct AesHmacSha2Key {
    aes_key: Box<[u8; KEY_SIZE]>,
    mac_key: Box<[u8; KEY_SIZE]>,
}

impl AesHmacSha2Key {
    /// Expand a secret storage key into an encryption and an authentication
    /// key.
    ///
    /// The 64 bytes of key material are derived with HKDF-SHA-256 using a
    /// salt of 32 zero bytes and the name of the secret as the info. The
    /// name binds the ciphertext to the account data type it is stored
    /// under; moving a secret to a different type invalidates it.
    pub(crate) fn from_secret_storage_key(key: &[u8; KEY_SIZE], secret_name: &str) -> Self {
        let mut expanded_keys = [0u8; KEY_SIZE * 2];
        expanded_keys
            .copy_from_slice(&derive_secret(key, None, secret_name.as_bytes(), KEY_SIZE * 2));

        let (aes_key, mac_key) = Self::split_keys(&expanded_keys);

        expanded_keys.zeroize();

        Self { aes_key, mac_key }
    }

    /// Encrypt the given plaintext and return the ciphertext and the
    /// initialization vector that was used.
    ///
    /// A random initialization vector is generated unless one is provided;
    /// either way the vector is clamped before use, see
    /// [`AesHmacSha2Key::clamp_iv()`].
    ///
    /// The method does not provide authenticity. You *must* call the
    /// [`AesHmacSha2Key::create_mac_tag()`] method after the encryption step
    /// to create an authentication tag.
    pub(crate) fn encrypt(
        &self,
        mut plaintext: Vec<u8>,
        iv_override: Option<[u8; IV_SIZE]>,
    ) -> (Vec<u8>, [u8; IV_SIZE]) {
        let initialization_vector = match iv_override {
            Some(iv) => Self::clamp_iv(iv),
            None => Self::generate_iv(),
        };

        let mut cipher =
            Aes256Ctr::new(self.aes_key(), Aes256Iv::from_slice(&initialization_vector));
        cipher.apply_keystream(&mut plaintext);

        (plaintext, initialization_vector)
    }

    /// Create an authentication tag for the given ciphertext.
    ///
    /// This method *must* be called after a call to
    /// [`AesHmacSha2Key::encrypt()`]. The authentication tag must be
    /// provided besides the ciphertext for a decryption attempt.
    pub(crate) fn create_mac_tag(&self, ciphertext: &[u8]) -> HmacSha256Mac {
        let mut mac = [0u8; MAC_SIZE];
        let mac_array = GenericArray::from_mut_slice(&mut mac);

        let mut hmac = Hmac::<Sha256>::new_from_slice(self.mac_key())
            .expect("We should be able to create a new HMAC object from our 32 byte MAC key");

        hmac.update(ciphertext);
        hmac.finalize_into(mac_array);

        HmacSha256Mac(mac)
    }

    /// Verify an authentication tag for the given, encrypted, message.
    ///
    /// You *must* use this method to compare authentication tags, it provides
    /// a constant-time comparison. It *must* be called before a call to
    /// [`AesHmacSha2Key::decrypt()`]; on failure no plaintext may be
    /// produced.
    pub(crate) fn verify_mac(&self, message: &[u8], mac: &[u8; MAC_SIZE]) -> Result<(), MacError> {
        let mac_array = GenericArray::from_slice(mac);

        let mut hmac = Hmac::<Sha256>::new_from_slice(self.mac_key())
            .expect("We should be able to create a new HMAC object from our 32 byte MAC key");

        hmac.update(message);
        hmac.verify(mac_array)
    }

    /// Decrypt the given ciphertext and return the decrypted plaintext.
    ///
    /// The method does not provide authenticity. You *must* call the
    /// [`AesHmacSha2Key::verify_mac()`] method before the decryption step to
    /// verify the authentication tag.
    pub(crate) fn decrypt(
        &self,
        mut ciphertext: Vec<u8>,
        initialization_vector: &[u8; IV_SIZE],
    ) -> Vec<u8> {
        let initialization_vector = Aes256Iv::from_slice(initialization_vector.as_slice());
        let mut cipher = Aes256Ctr::new(self.aes_key(), initialization_vector);
        cipher.apply_keystream(&mut ciphertext);

        ciphertext
    }

    fn split_keys(
        expanded_keys: &[u8; KEY_SIZE * 2],
    ) -> (Box<[u8; KEY_SIZE]>, Box<[u8; KEY_SIZE]>) {
        let mut aes_key = Box::new([0u8; KEY_SIZE]);
        let mut mac_key = Box::new([0u8; KEY_SIZE]);

        aes_key.copy_from_slice(&expanded_keys[0..32]);
        mac_key.copy_from_slice(&expanded_keys[32..64]);

        (aes_key, mac_key)
    }

    /// Generate a new, random, clamped initialization vector.
    fn generate_iv() -> [u8; IV_SIZE] {
        let mut rng = thread_rng();
        let mut iv = [0u8; IV_SIZE];

        rng.fill_bytes(&mut iv);

        Self::clamp_iv(iv)
    }

    /// Clear the high bit of byte 9 of the initialization vector.
    ///
    /// The spec tells us to zero out this bit "in order to work around
    /// differences in AES-CTR implementations", some of which wrap at a
    /// 64-bit counter boundary. The loss of a single bit of IV entropy is the
    /// price for interoperability; every client has to clamp the exact same
    /// bit.
    fn clamp_iv(mut iv: [u8; IV_SIZE]) -> [u8; IV_SIZE] {
        iv[9] &= 0x7f;
        iv
    }

    /// Get the encryption key.
    fn aes_key(&self) -> &Aes256Key {
        Aes256Key::from_slice(self.aes_key.as_slice())
    }

    /// Get the authentication key.
    fn mac_key(&self) -> &HmacSha256Key {
        &self.mac_key
    }
}

/// Encrypt 32 zero bytes under the given key with an empty secret name.
///
/// The resulting MAC and IV are stored alongside a secret storage key
/// descriptor and let clients check whether a candidate key, for example one
/// that was just derived from a typed-in passphrase, is the correct one
/// without decrypting any real secret.
pub(crate) fn calculate_key_check(
    key: &[u8; KEY_SIZE],
    iv_override: Option<[u8; IV_SIZE]>,
) -> KeyCheck {
    const ZERO_PLAINTEXT: [u8; 32] = [0u8; 32];

    let cipher_key = AesHmacSha2Key::from_secret_storage_key(key, "");
    let (ciphertext, iv) = cipher_key.encrypt(ZERO_PLAINTEXT.to_vec(), iv_override);
    let mac = cipher_key.create_mac_tag(&ciphertext);

    KeyCheck { iv, mac }
}
