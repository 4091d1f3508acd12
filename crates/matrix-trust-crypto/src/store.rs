// Copyright 2020 The Matrix.org Foundation C.I.C.
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

//! The collaborator boundaries towards the persistence layer.
//!
//! Two stores are consumed by this crate: the [`IdentityStore`] holding the
//! locally known device and cross-signing keys, and the [`AccountDataStore`]
//! holding the account data events that back secret storage. Both are
//! supplied by the embedding client; in-memory implementations are provided
//! for tests and light-weight embedders.

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use dashmap::DashMap;
use ruma::{DeviceId, OwnedDeviceId, OwnedUserId, UserId};
use serde_json::Value;
use thiserror::Error;

use crate::types::{CryptoDevice, TrustLevel, UserCrossSigningKeys};

/// A `Result` type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Error type for the store boundaries.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A value in the store could not be serialized or deserialized.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// The underlying store implementation failed.
    #[error("the underlying store failed: {0}")]
    Backend(String),
}

/// Read and write access to the locally known device and cross-signing keys.
///
/// Lookups return owned snapshots; trust updates replace whole values so
/// concurrent readers never observe partially applied changes. All methods
/// are synchronous, implementations are expected to serve them from memory.
pub trait IdentityStore: Send + Sync + std::fmt::Debug {
    /// Get the cross-signing keys that are known for the given user.
    fn get_cross_signing_info(&self, user_id: &UserId) -> Option<UserCrossSigningKeys>;

    /// Store, or replace, the cross-signing keys of a user.
    fn store_cross_signing_info(&self, info: UserCrossSigningKeys);

    /// Get a device of the given user.
    fn get_device(&self, user_id: &UserId, device_id: &DeviceId) -> Option<CryptoDevice>;

    /// Get all known devices of the given user.
    fn get_user_devices(&self, user_id: &UserId) -> Vec<CryptoDevice>;

    /// Store, or replace, a device.
    fn store_device(&self, device: CryptoDevice);

    /// Mark the user's master and self-signing keys as cross-signing
    /// verified, or remove that mark.
    fn set_user_keys_as_trusted(&self, user_id: &UserId, trusted: bool);

    /// Mark the user's master key as locally verified.
    fn mark_master_key_locally_trusted(&self, user_id: &UserId, trusted: bool);

    /// Replace the trust level of a device.
    fn set_device_trust(&self, user_id: &UserId, device_id: &DeviceId, trust: TrustLevel);
}

/// Access to the account data events of our own user.
///
/// Writes must be visible to subsequent local reads as soon as the returned
/// future resolves, independently of any server round-trip; the secret
/// storage service relies on reading a key descriptor right after storing
/// it. Implementations serialize concurrent writers per event type.
#[async_trait]
pub trait AccountDataStore: Send + Sync + std::fmt::Debug {
    /// Get the content of the account data event with the given type.
    async fn get_account_data(&self, event_type: &str) -> StoreResult<Option<Value>>;

    /// Set the content of the account data event with the given type.
    async fn set_account_data(&self, event_type: &str, content: Value) -> StoreResult<()>;
}

/// An in-memory only [`IdentityStore`] that forgets everything once dropped.
#[derive(Debug, Clone, Default)]
pub struct MemoryIdentityStore {
    identities: Arc<DashMap<OwnedUserId, UserCrossSigningKeys>>,
    devices: Arc<DashMap<OwnedUserId, BTreeMap<OwnedDeviceId, CryptoDevice>>>,
}

impl MemoryIdentityStore {
    /// Create a new empty `MemoryIdentityStore`.
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn get_cross_signing_info(&self, user_id: &UserId) -> Option<UserCrossSigningKeys> {
        self.identities.get(user_id).map(|i| i.clone())
    }

    fn store_cross_signing_info(&self, info: UserCrossSigningKeys) {
        self.identities.insert(info.user_id.clone(), info);
    }

    fn get_device(&self, user_id: &UserId, device_id: &DeviceId) -> Option<CryptoDevice> {
        self.devices.get(user_id).and_then(|d| d.get(device_id).cloned())
    }

    fn get_user_devices(&self, user_id: &UserId) -> Vec<CryptoDevice> {
        self.devices.get(user_id).map(|d| d.values().cloned().collect()).unwrap_or_default()
    }

    fn store_device(&self, device: CryptoDevice) {
        self.devices
            .entry(device.user_id.clone())
            .or_default()
            .insert(device.device_id.clone(), device);
    }

    fn set_user_keys_as_trusted(&self, user_id: &UserId, trusted: bool) {
        if let Some(mut entry) = self.identities.get_mut(user_id) {
            let mut info = entry.clone();

            for key in &mut info.keys {
                if key.is_master_key() || key.is_self_signing_key() {
                    key.trust_level.cross_signing_verified = trusted;
                }
            }

            *entry = info;
        }
    }

    fn mark_master_key_locally_trusted(&self, user_id: &UserId, trusted: bool) {
        if let Some(mut entry) = self.identities.get_mut(user_id) {
            let mut info = entry.clone();

            for key in &mut info.keys {
                if key.is_master_key() {
                    key.trust_level.locally_verified = Some(trusted);
                }
            }

            *entry = info;
        }
    }

    fn set_device_trust(&self, user_id: &UserId, device_id: &DeviceId, trust: TrustLevel) {
        if let Some(mut devices) = self.devices.get_mut(user_id) {
            if let Some(device) = devices.get_mut(device_id) {
                device.trust_level = trust;
            }
        }
    }
}

/// An in-memory only [`AccountDataStore`].
///
/// Writes are visible to reads as soon as `set_account_data` resolves, which
/// satisfies the local-echo requirement of the secret storage service.
#[derive(Debug, Clone, Default)]
pub struct MemoryAccountDataStore {
    events: Arc<DashMap<String, Value>>,
}

impl MemoryAccountDataStore {
    /// Create a new empty `MemoryAccountDataStore`.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AccountDataStore for MemoryAccountDataStore {
    async fn get_account_data(&self, event_type: &str) -> StoreResult<Option<Value>> {
        Ok(self.events.get(event_type).map(|v| v.clone()))
    }

    async fn set_account_data(&self, event_type: &str, content: Value) -> StoreResult<()> {
        self.events.insert(event_type.to_owned(), content);
        Ok(())
    }
}
