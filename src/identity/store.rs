//! Identity store
//!
//! Device identifiers are created once per (user, proxy) pair and never
//! mutated afterwards. Session tokens are overwritten on every successful
//! authentication.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::types::Result;

/// Record name used for identities without a proxy
const DIRECT: &str = "direct";

/// Minimal key-value contract the identity store needs from a backend.
///
/// Implementations must be safe to call concurrently. Atomicity is only
/// required per key.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a record
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a record, replacing any previous value
    async fn put(&self, key: &str, value: &str) -> Result<()>;

    /// Write a record only if none exists. Returns the value stored after the
    /// call, which is the existing one when another writer got there first.
    async fn put_if_absent(&self, key: &str, value: &str) -> Result<String>;
}

/// Lookup key for a device identity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    pub user_id: String,
    /// Proxy URI as configured, `None` for a direct connection
    pub proxy: Option<String>,
}

impl IdentityKey {
    pub fn new(user_id: impl Into<String>, proxy: Option<String>) -> Self {
        Self {
            user_id: user_id.into(),
            proxy,
        }
    }

    pub fn direct(user_id: impl Into<String>) -> Self {
        Self::new(user_id, None)
    }

    fn device_record(&self) -> String {
        format!(
            "device/{}/{}",
            self.user_id,
            self.proxy.as_deref().unwrap_or(DIRECT)
        )
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}",
            self.user_id,
            self.proxy.as_deref().unwrap_or(DIRECT)
        )
    }
}

/// A resolved device identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub proxy: Option<String>,
    pub device_id: String,
}

/// Durable identity and token storage shared by all supervisors
#[derive(Clone)]
pub struct IdentityStore {
    backend: Arc<dyn KeyValueStore>,
}

impl IdentityStore {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self { backend }
    }

    /// Resolve the device identifier for `key`, creating and persisting a
    /// fresh one on first use.
    pub async fn get_or_create(&self, key: &IdentityKey) -> Result<String> {
        let record = key.device_record();

        if let Some(existing) = self.backend.get(&record).await? {
            debug!("Loaded device id for {}", key);
            return Ok(existing);
        }

        let fresh = Uuid::new_v4().to_string();
        let stored = self.backend.put_if_absent(&record, &fresh).await?;
        if stored == fresh {
            info!("Created device id {} for {}", stored, key);
        }
        Ok(stored)
    }

    /// Resolve the full identity for `key`
    pub async fn resolve(&self, key: &IdentityKey) -> Result<Identity> {
        let device_id = self.get_or_create(key).await?;
        Ok(Identity {
            user_id: key.user_id.clone(),
            proxy: key.proxy.clone(),
            device_id,
        })
    }

    /// Last session token issued to `user_id`, if any
    pub async fn load_token(&self, user_id: &str) -> Result<Option<String>> {
        self.backend.get(&token_record(user_id)).await
    }

    /// Persist a session token, replacing the previous one
    pub async fn save_token(&self, user_id: &str, token: &str) -> Result<()> {
        self.backend.put(&token_record(user_id), token).await?;
        debug!("Saved session token for {}", user_id);
        Ok(())
    }
}

fn token_record(user_id: &str) -> String {
    format!("token/{}", user_id)
}
