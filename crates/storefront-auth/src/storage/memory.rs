//! In-memory storage backends.
//!
//! Backed by `DashMap`, so operations on different keys never contend.
//! Entry-API operations hold the shard lock for the duration of the check
//! and insert, which gives the atomicity the traits require.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use time::OffsetDateTime;

use crate::AuthResult;
use crate::credential::{Credential, KeyVersion};
use crate::error::AuthError;
use crate::revocation::RevocationEntry;
use crate::verification::VerificationToken;

use super::{
    CredentialStorage, KeyStorage, RevocationStorage, SessionRecord, SessionStorage, StoredKey,
    VerificationStorage,
};

// =============================================================================
// Credentials
// =============================================================================

/// In-memory [`CredentialStorage`].
#[derive(Debug, Default)]
pub struct MemoryCredentialStorage {
    credentials: DashMap<String, Credential>,
}

impl MemoryCredentialStorage {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStorage for MemoryCredentialStorage {
    async fn insert(&self, credential: &Credential) -> AuthResult<()> {
        match self.credentials.entry(credential.subject.clone()) {
            Entry::Occupied(_) => Err(AuthError::duplicate_subject(&credential.subject)),
            Entry::Vacant(slot) => {
                slot.insert(credential.clone());
                Ok(())
            }
        }
    }

    async fn find(&self, subject: &str) -> AuthResult<Option<Credential>> {
        Ok(self.credentials.get(subject).map(|c| c.value().clone()))
    }

    async fn update(&self, credential: &Credential) -> AuthResult<()> {
        match self.credentials.get_mut(&credential.subject) {
            Some(mut existing) => {
                *existing = credential.clone();
                Ok(())
            }
            None => Err(AuthError::unknown_subject(&credential.subject)),
        }
    }
}

// =============================================================================
// Revocations
// =============================================================================

/// In-memory [`RevocationStorage`].
#[derive(Debug, Default)]
pub struct MemoryRevocationStorage {
    entries: DashMap<String, RevocationEntry>,
}

impl MemoryRevocationStorage {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl RevocationStorage for MemoryRevocationStorage {
    async fn insert_if_absent(&self, entry: &RevocationEntry) -> AuthResult<bool> {
        match self.entries.entry(entry.token_id.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(entry.clone());
                Ok(true)
            }
        }
    }

    async fn find(&self, token_id: &str) -> AuthResult<Option<RevocationEntry>> {
        Ok(self.entries.get(token_id).map(|e| e.value().clone()))
    }

    async fn delete_expired_before(&self, cutoff: OffsetDateTime) -> AuthResult<u64> {
        let mut removed = 0u64;
        self.entries.retain(|_, entry| {
            let keep = entry.expires_at >= cutoff;
            removed += u64::from(!keep);
            keep
        });
        Ok(removed)
    }
}

// =============================================================================
// Sessions
// =============================================================================

/// In-memory [`SessionStorage`].
#[derive(Debug, Default)]
pub struct MemorySessionStorage {
    sessions: DashMap<String, SessionRecord>,
}

impl MemorySessionStorage {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStorage for MemorySessionStorage {
    async fn upsert(&self, record: &SessionRecord) -> AuthResult<()> {
        self.sessions
            .insert(record.session_id.clone(), record.clone());
        Ok(())
    }

    async fn find(&self, session_id: &str) -> AuthResult<Option<SessionRecord>> {
        Ok(self.sessions.get(session_id).map(|r| r.value().clone()))
    }

    async fn list_by_subject(&self, subject: &str) -> AuthResult<Vec<SessionRecord>> {
        let mut records: Vec<SessionRecord> = self
            .sessions
            .iter()
            .filter(|r| r.subject == subject)
            .map(|r| r.value().clone())
            .collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    async fn delete(&self, session_id: &str) -> AuthResult<bool> {
        Ok(self.sessions.remove(session_id).is_some())
    }

    async fn delete_expired_before(&self, cutoff: OffsetDateTime) -> AuthResult<u64> {
        let mut removed = 0u64;
        self.sessions.retain(|_, record| {
            let keep = record.expires_at >= cutoff;
            removed += u64::from(!keep);
            keep
        });
        Ok(removed)
    }
}

// =============================================================================
// Signing keys
// =============================================================================

/// In-memory [`KeyStorage`].
#[derive(Debug, Default)]
pub struct MemoryKeyStorage {
    keys: DashMap<KeyVersion, StoredKey>,
}

impl MemoryKeyStorage {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyStorage for MemoryKeyStorage {
    async fn insert_if_absent(&self, key: &StoredKey) -> AuthResult<bool> {
        match self.keys.entry(key.version) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(key.clone());
                Ok(true)
            }
        }
    }

    async fn list(&self) -> AuthResult<Vec<StoredKey>> {
        let mut keys: Vec<StoredKey> = self.keys.iter().map(|k| k.value().clone()).collect();
        keys.sort_by_key(|k| k.version);
        Ok(keys)
    }

    async fn mark_superseded(&self, version: KeyVersion, at: OffsetDateTime) -> AuthResult<()> {
        if let Some(mut key) = self.keys.get_mut(&version) {
            key.superseded_at = Some(key.superseded_at.map_or(at, |prev| prev.min(at)));
        }
        Ok(())
    }

    async fn delete(&self, version: KeyVersion) -> AuthResult<bool> {
        Ok(self.keys.remove(&version).is_some())
    }
}

// =============================================================================
// Verification tokens
// =============================================================================

/// In-memory [`VerificationStorage`].
#[derive(Debug, Default)]
pub struct MemoryVerificationStorage {
    tokens: DashMap<String, VerificationToken>,
}

impl MemoryVerificationStorage {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored tokens.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Returns `true` if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl VerificationStorage for MemoryVerificationStorage {
    async fn insert(&self, token: &VerificationToken) -> AuthResult<()> {
        self.tokens.insert(token.token.clone(), token.clone());
        Ok(())
    }

    async fn find(&self, token: &str) -> AuthResult<Option<VerificationToken>> {
        Ok(self.tokens.get(token).map(|t| t.value().clone()))
    }

    async fn mark_used(&self, token: &str, at: OffsetDateTime) -> AuthResult<bool> {
        match self.tokens.get_mut(token) {
            Some(mut stored) if stored.used_at.is_none() => {
                stored.used_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_expired_before(&self, cutoff: OffsetDateTime) -> AuthResult<u64> {
        let mut removed = 0u64;
        self.tokens.retain(|_, token| {
            let keep = token.expires_at >= cutoff;
            removed += u64::from(!keep);
            keep
        });
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::{KeyVersion, Role};
    use crate::revocation::RevocationReason;
    use std::sync::Arc;
    use time::Duration;

    fn credential(subject: &str) -> Credential {
        let now = OffsetDateTime::now_utc();
        Credential {
            subject: subject.to_string(),
            password_hash: "hash".to_string(),
            salt: "salt".to_string(),
            key_version: KeyVersion::INITIAL,
            role: Role::User,
            enabled: true,
            verified_at: Some(now),
            created_at: now,
            updated_at: now,
        }
    }

    fn revocation(id: &str, expires_at: OffsetDateTime) -> RevocationEntry {
        RevocationEntry {
            token_id: id.to_string(),
            subject: "alice".to_string(),
            reason: RevocationReason::Logout,
            revoked_at: OffsetDateTime::now_utc(),
            expires_at,
        }
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let store = MemoryCredentialStorage::new();
        store.insert(&credential("alice")).await.unwrap();
        let err = store.insert(&credential("alice")).await.unwrap_err();
        assert!(matches!(err, AuthError::DuplicateSubject { .. }));
    }

    #[tokio::test]
    async fn test_update_unknown_subject() {
        let store = MemoryCredentialStorage::new();
        let err = store.update(&credential("ghost")).await.unwrap_err();
        assert!(matches!(err, AuthError::UnknownSubject { .. }));
    }

    #[tokio::test]
    async fn test_update_replaces_record() {
        let store = MemoryCredentialStorage::new();
        store.insert(&credential("alice")).await.unwrap();
        let mut updated = credential("alice");
        updated.enabled = false;
        store.update(&updated).await.unwrap();
        assert!(!store.find("alice").await.unwrap().unwrap().enabled);
    }

    #[tokio::test]
    async fn test_concurrent_insert_if_absent_has_one_winner() {
        let store = Arc::new(MemoryRevocationStorage::new());
        let exp = OffsetDateTime::now_utc() + Duration::hours(1);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.insert_if_absent(&revocation("r-1", exp)).await.unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_expired_before() {
        let store = MemoryRevocationStorage::new();
        let now = OffsetDateTime::now_utc();
        store
            .insert_if_absent(&revocation("old", now - Duration::hours(2)))
            .await
            .unwrap();
        store
            .insert_if_absent(&revocation("fresh", now + Duration::hours(2)))
            .await
            .unwrap();

        assert_eq!(store.delete_expired_before(now).await.unwrap(), 1);
        assert!(store.find("old").await.unwrap().is_none());
        assert!(store.find("fresh").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sessions_listed_by_subject() {
        let store = MemorySessionStorage::new();
        let now = OffsetDateTime::now_utc();
        for (sid, subject) in [("s1", "alice"), ("s2", "bob"), ("s3", "alice")] {
            store
                .upsert(&SessionRecord {
                    session_id: sid.to_string(),
                    subject: subject.to_string(),
                    device: None,
                    refresh_token_id: format!("r-{sid}"),
                    expires_at: now + Duration::days(1),
                    created_at: now,
                    updated_at: now,
                })
                .await
                .unwrap();
        }
        let alice = store.list_by_subject("alice").await.unwrap();
        assert_eq!(alice.len(), 2);
        assert!(store.delete("s1").await.unwrap());
        assert!(!store.delete("s1").await.unwrap());
        assert_eq!(store.list_by_subject("alice").await.unwrap().len(), 1);
    }

    fn stored_key(version: u32) -> StoredKey {
        StoredKey {
            version: KeyVersion::new(version),
            algorithm: crate::credential::SigningAlgorithm::HS256,
            secret: vec![7; 32],
            created_at: OffsetDateTime::now_utc(),
            superseded_at: None,
        }
    }

    #[tokio::test]
    async fn test_key_versions_are_claimed_once() {
        let store = MemoryKeyStorage::new();
        assert!(store.insert_if_absent(&stored_key(2)).await.unwrap());
        assert!(store.insert_if_absent(&stored_key(1)).await.unwrap());
        assert!(!store.insert_if_absent(&stored_key(2)).await.unwrap());

        let versions: Vec<u32> = store
            .list()
            .await
            .unwrap()
            .iter()
            .map(|k| k.version.get())
            .collect();
        assert_eq!(versions, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_mark_superseded_keeps_earliest() {
        let store = MemoryKeyStorage::new();
        store.insert_if_absent(&stored_key(1)).await.unwrap();
        let first = OffsetDateTime::now_utc();
        store
            .mark_superseded(KeyVersion::new(1), first)
            .await
            .unwrap();
        store
            .mark_superseded(KeyVersion::new(1), first + Duration::hours(1))
            .await
            .unwrap();
        let keys = store.list().await.unwrap();
        assert_eq!(keys[0].superseded_at, Some(first));

        assert!(store.delete(KeyVersion::new(1)).await.unwrap());
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_verification_token_consumed_once() {
        let store = Arc::new(MemoryVerificationStorage::new());
        let now = OffsetDateTime::now_utc();
        store
            .insert(&VerificationToken {
                token: "t-1".to_string(),
                subject: "alice".to_string(),
                created_at: now,
                expires_at: now + Duration::minutes(15),
                used_at: None,
            })
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.mark_used("t-1", now).await.unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            winners += usize::from(handle.await.unwrap());
        }
        assert_eq!(winners, 1);
        assert!(!store.mark_used("missing", now).await.unwrap());

        assert_eq!(
            store
                .delete_expired_before(now + Duration::hours(1))
                .await
                .unwrap(),
            1
        );
    }
}
