//! Persistent signing keys.
//!
//! [`KeyStore`] keeps the in-process [`KeyRing`] in step with
//! [`KeyStorage`]. A version is written to storage before it signs anything,
//! so every token in circulation names a version a restarted process or a
//! peer instance can load.

use std::sync::Arc;
use std::time::{Duration, Instant};

use time::OffsetDateTime;

use crate::AuthResult;
use crate::config::AuthConfig;
use crate::error::AuthError;
use crate::storage::{KeyStorage, StoredKey, bounded};

use super::{KeyRing, KeyVersion};

/// Shortest gap between storage reads triggered by unknown key ids.
pub const MIN_SYNC_INTERVAL: Duration = Duration::from_secs(1);

/// The key ring plus the storage it is persisted in.
pub struct KeyStore {
    ring: Arc<KeyRing>,
    storage: Arc<dyn KeyStorage>,
    storage_timeout: Duration,
    rotation: tokio::sync::Mutex<()>,
    last_sync: parking_lot::Mutex<Option<Instant>>,
}

impl KeyStore {
    /// Wraps an existing ring. Versions already in the ring are not written
    /// to `storage`; only later rotations are.
    #[must_use]
    pub fn new(ring: Arc<KeyRing>, storage: Arc<dyn KeyStorage>, storage_timeout: Duration) -> Self {
        Self {
            ring,
            storage,
            storage_timeout,
            rotation: tokio::sync::Mutex::new(()),
            last_sync: parking_lot::Mutex::new(None),
        }
    }

    /// Loads the ring from `storage`, or seeds storage from the configured
    /// key source when it holds no versions yet.
    ///
    /// If the newest stored version uses a different algorithm than the
    /// configuration names, a new version is rotated in.
    ///
    /// # Errors
    ///
    /// - [`AuthError::Configuration`] if the configured key source is invalid
    /// - [`AuthError::Integrity`] if a stored version cannot be decoded
    /// - [`AuthError::Transient`] if storage is unavailable
    pub async fn open(
        storage: Arc<dyn KeyStorage>,
        config: &AuthConfig,
        now: OffsetDateTime,
    ) -> AuthResult<Self> {
        let timeout = config.sessions.storage_timeout;
        let algorithm = config.signing.algorithm()?;
        let stored = bounded(timeout, "key list", storage.list()).await?;

        let ring = if stored.is_empty() {
            let ring = KeyRing::from_config(&config.signing, now)?;
            let initial = ring.current().to_stored(None);
            if bounded(timeout, "key insert", storage.insert_if_absent(&initial)).await? {
                tracing::info!(
                    version = %initial.version,
                    algorithm = %algorithm,
                    "Persisted initial signing key"
                );
                ring
            } else {
                // Another instance seeded the backend first.
                let stored = bounded(timeout, "key list", storage.list()).await?;
                restore(algorithm_of(&stored).unwrap_or(algorithm), &stored)?
            }
        } else {
            if config.signing.secret.is_some() || config.signing.private_key_path.is_some() {
                tracing::warn!("Stored signing keys take precedence over the configured key source");
            }
            tracing::info!(versions = stored.len(), "Loaded signing keys");
            restore(algorithm, &stored)?
        };

        let store = Self::new(Arc::new(ring), storage, timeout);
        let current = store.ring.current().algorithm();
        if current != algorithm {
            tracing::info!(
                stored = %current,
                configured = %algorithm,
                "Signing algorithm changed; rotating"
            );
            store.rotate(now).await?;
        }
        Ok(store)
    }

    /// The in-process ring.
    #[must_use]
    pub fn ring(&self) -> &Arc<KeyRing> {
        &self.ring
    }

    /// Generates, persists and installs a new version.
    ///
    /// # Errors
    ///
    /// - [`AuthError::Transient`] if storage is unavailable or a peer claimed
    ///   the same version number first
    /// - [`AuthError::Internal`] if key generation fails
    pub async fn rotate(&self, now: OffsetDateTime) -> AuthResult<KeyVersion> {
        let _rotating = self.rotation.lock().await;
        self.sync().await?;

        let ring = Arc::clone(&self.ring);
        // RSA generation takes long enough to stall a runtime worker.
        let material = tokio::task::spawn_blocking(move || ring.prepare_next(now))
            .await
            .map_err(|e| AuthError::internal(format!("key rotation task failed: {e}")))?
            .map_err(|e| AuthError::internal(e.to_string()))?;
        let version = material.version();

        let stored = material.to_stored(None);
        if !self.bounded("key insert", self.storage.insert_if_absent(&stored)).await? {
            self.sync().await?;
            return Err(AuthError::transient(format!(
                "key version {version} was claimed concurrently"
            )));
        }
        let previous = self.ring.install(material, now);
        self.bounded("key supersede", self.storage.mark_superseded(previous, now))
            .await?;
        Ok(version)
    }

    /// Merges versions other processes have written. Returns how many were
    /// new.
    pub async fn sync(&self) -> AuthResult<usize> {
        let stored = self.bounded("key list", self.storage.list()).await?;
        let added = self
            .ring
            .absorb(&stored)
            .map_err(|e| AuthError::integrity(e.to_string()))?;
        *self.last_sync.lock() = Some(Instant::now());
        Ok(added)
    }

    /// Syncs if `version` is newer than anything the ring holds and the last
    /// sync is at least [`MIN_SYNC_INTERVAL`] old. Returns `true` if the
    /// version is known afterwards.
    pub async fn sync_for(&self, version: KeyVersion) -> AuthResult<bool> {
        if version <= self.ring.latest_version() {
            return Ok(self.ring.get(version).is_some());
        }
        let recent = self
            .last_sync
            .lock()
            .is_some_and(|at| at.elapsed() < MIN_SYNC_INTERVAL);
        if recent {
            return Ok(false);
        }
        self.sync().await?;
        Ok(self.ring.get(version).is_some())
    }

    /// Retires superseded versions older than `retention` from the ring and
    /// from storage.
    pub async fn retire_expired(
        &self,
        now: OffsetDateTime,
        retention: time::Duration,
    ) -> AuthResult<Vec<KeyVersion>> {
        let retired = self.ring.retire_expired(now, retention);
        for version in &retired {
            self.bounded("key delete", self.storage.delete(*version))
                .await?;
        }
        Ok(retired)
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = AuthResult<T>>,
    ) -> AuthResult<T> {
        bounded(self.storage_timeout, operation, call).await
    }
}

fn algorithm_of(stored: &[StoredKey]) -> Option<super::SigningAlgorithm> {
    stored.iter().max_by_key(|k| k.version).map(|k| k.algorithm)
}

fn restore(algorithm: super::SigningAlgorithm, stored: &[StoredKey]) -> AuthResult<KeyRing> {
    KeyRing::restore(algorithm, stored).map_err(|e| AuthError::integrity(e.to_string()))
}
