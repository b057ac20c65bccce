//! Session / document association store
//!
//! A session is alive while its header flag `SessionHeader:<id>` exists.
//! Documents uploaded in the session are members of `Session_Files:<id>`,
//! and objects derived from a document are members of
//! `Document_Blobs:<doc_id>`. `Document_Owner:<doc_id>` names the one
//! session allowed to hold a document, so no session can pull another
//! session's document into its own cleanup cascade.
//!
//! The association set outlives the header by a grace period. Deleting or
//! expiring the header is what the cleaner reacts to, and it needs the set
//! to still be readable at that point.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::StoreError;
use crate::keys::{validate_identifier, KeyError, Tag};
use crate::store::{JsonStorage, KeyedStore, Namespace, SetStorage, StringStorage};

/// Session store errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is missing or expired")]
    InvalidSession,

    #[error("document {0} belongs to another session")]
    DocumentOwned(String),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Value held by a session's header flag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub created_at: DateTime<Utc>,
}

type IdGenerator = Arc<dyn Fn() -> String + Send + Sync>;

/// Tracks which documents belong to which session
#[derive(Clone)]
pub struct SessionStore {
    headers: JsonStorage<SessionInfo>,
    documents: SetStorage,
    blobs: SetStorage,
    owners: StringStorage,
    generate_id: IdGenerator,
}

/// Random 32-character hex id
pub fn random_session_id() -> String {
    Uuid::new_v4().simple().to_string()
}

impl SessionStore {
    pub fn new(store: Arc<dyn KeyedStore>, config: &SessionConfig) -> Self {
        Self::with_ttl(store, config.ttl, config.grace)
    }

    pub fn with_ttl(store: Arc<dyn KeyedStore>, ttl: Duration, grace: Duration) -> Self {
        Self {
            headers: JsonStorage::new(
                store.clone(),
                Namespace::new(Tag::SessionHeader.prefix()).with_ttl(ttl),
            ),
            documents: SetStorage::new(
                store.clone(),
                Namespace::new(Tag::SessionFiles.prefix()).with_ttl(ttl + grace),
            ),
            blobs: SetStorage::new(store.clone(), Namespace::new(Tag::DocumentBlobs.prefix())),
            owners: StringStorage::new(store, Namespace::new(Tag::DocumentOwner.prefix())),
            generate_id: Arc::new(random_session_id),
        }
    }

    /// Replace the id generator
    pub fn with_id_generator(
        mut self,
        generate: impl Fn() -> String + Send + Sync + 'static,
    ) -> Self {
        self.generate_id = Arc::new(generate);
        self
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.headers.namespace().default_ttl()
    }

    /// A fresh id not used by any live session
    pub async fn generate_session_id(&self) -> Result<String, SessionError> {
        loop {
            let candidate = (self.generate_id)();
            if self.is_taken(&candidate).await? {
                tracing::debug!(candidate = %candidate, "Session id collision, regenerating");
                continue;
            }
            return Ok(candidate);
        }
    }

    async fn is_taken(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.headers.exists(id).await? || self.documents.exists(id).await?)
    }

    /// Create a session and return its id.
    ///
    /// The header is claimed with set-if-absent, so two concurrent creators
    /// can never end up sharing an id.
    pub async fn create_session(&self) -> Result<String, SessionError> {
        let info = SessionInfo {
            created_at: Utc::now(),
        };
        loop {
            let id = self.generate_session_id().await?;
            if self.headers.set_if_absent(&id, &info).await? {
                tracing::info!(session_id = %id, "Created session");
                return Ok(id);
            }
        }
    }

    /// Whether the id denotes a live session
    pub async fn validate(&self, session_id: &str) -> Result<bool, SessionError> {
        if session_id.is_empty() {
            return Ok(false);
        }
        Ok(self.headers.exists(session_id).await?)
    }

    /// Whether the session is live and owns the document.
    ///
    /// Callers must treat `false` as access denied without telling the
    /// client which half failed.
    pub async fn validate_pair(&self, session_id: &str, doc_id: &str) -> Result<bool, SessionError> {
        if !self.validate(session_id).await? {
            return Ok(false);
        }
        let owned = self.documents.contains(session_id, doc_id).await?;
        if owned {
            self.headers.touch(session_id).await?;
        }
        Ok(owned)
    }

    /// Header contents. `CorruptData` if the stored JSON no longer decodes.
    pub async fn info(&self, session_id: &str) -> Result<Option<SessionInfo>, SessionError> {
        if session_id.is_empty() {
            return Ok(None);
        }
        Ok(self.headers.get(session_id).await?)
    }

    /// Add a document to a live session. Idempotent.
    ///
    /// Only the upload path calls this, before any object is derived from
    /// the document. `DocumentOwned` if another session still holds the
    /// document, or if objects were derived from it under no owner.
    pub async fn append_document(&self, session_id: &str, doc_id: &str) -> Result<bool, SessionError> {
        validate_identifier(doc_id)?;
        if !self.headers.touch(session_id).await? {
            return Err(SessionError::InvalidSession);
        }
        self.claim_document(session_id, doc_id).await?;
        let added = self.documents.add(session_id, doc_id).await?;
        tracing::debug!(session_id = %session_id, doc_id = %doc_id, added, "Appended document");
        Ok(added)
    }

    async fn claim_document(&self, session_id: &str, doc_id: &str) -> Result<(), SessionError> {
        let refused = || SessionError::DocumentOwned(doc_id.to_string());

        if self.owners.set_if_absent(doc_id, session_id).await? {
            if self.blobs.exists(doc_id).await? {
                self.owners.delete(doc_id).await?;
                return Err(refused());
            }
            return Ok(());
        }

        match self.owners.get(doc_id).await? {
            Some(owner) if owner == session_id => Ok(()),
            Some(owner) if self.holds_documents(&owner).await? => {
                tracing::warn!(
                    session_id = %session_id,
                    doc_id = %doc_id,
                    "Refused document owned by another session"
                );
                Err(refused())
            }
            // Previous owner is gone and its cascade has run or never will
            _ => {
                if self.blobs.exists(doc_id).await? {
                    return Err(refused());
                }
                self.owners.set(doc_id, session_id).await?;
                Ok(())
            }
        }
    }

    /// Live, or ended with its cleanup cascade still pending. Does not
    /// extend the other session's TTLs.
    async fn holds_documents(&self, session_id: &str) -> Result<bool, StoreError> {
        Ok(self.headers.exists(session_id).await? || self.documents.exists(session_id).await?)
    }

    /// Remove a document. Removing a non-member, or from a dead session, is a no-op.
    pub async fn remove_document(&self, session_id: &str, doc_id: &str) -> Result<bool, SessionError> {
        if !self.validate(session_id).await? {
            return Ok(false);
        }
        self.headers.touch(session_id).await?;
        let removed = self.documents.remove(session_id, doc_id).await?;
        if removed && self.owners.get(doc_id).await?.as_deref() == Some(session_id) {
            self.owners.delete(doc_id).await?;
        }
        tracing::debug!(session_id = %session_id, doc_id = %doc_id, removed, "Removed document");
        Ok(removed)
    }

    /// Documents of a session. Reading keeps the session alive.
    pub async fn documents(&self, session_id: &str) -> Result<Vec<String>, SessionError> {
        if !self.validate(session_id).await? {
            return Ok(Vec::new());
        }
        self.headers.touch(session_id).await?;
        Ok(self.documents.members(session_id).await?)
    }

    /// End a session explicitly.
    ///
    /// Only the header is removed: its deletion notification drives the same
    /// cascade as a natural expiry, which still needs the association set.
    pub async fn delete_session(&self, session_id: &str) -> Result<bool, SessionError> {
        if session_id.is_empty() {
            return Ok(false);
        }
        let deleted = self.headers.delete(session_id).await?;
        if deleted {
            tracing::info!(session_id = %session_id, "Deleted session");
        }
        Ok(deleted)
    }

    /// Record a blob object derived from a document
    pub async fn attach_blob(&self, doc_id: &str, object_key: &str) -> Result<bool, SessionError> {
        Ok(self.blobs.add(doc_id, object_key).await?)
    }

    /// Blob objects derived from a document
    pub async fn blobs(&self, doc_id: &str) -> Result<Vec<String>, SessionError> {
        Ok(self.blobs.snapshot(doc_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TTL: Duration = Duration::from_secs(100);
    const GRACE: Duration = Duration::from_secs(10);

    fn sessions(store: &MemoryStore) -> SessionStore {
        SessionStore::with_ttl(Arc::new(store.clone()), TTL, GRACE)
    }

    #[tokio::test]
    async fn test_generate_skips_live_ids() {
        let store = MemoryStore::new();
        let seeded: Vec<String> = (0..5).map(|i| format!("taken{}", i)).collect();
        for id in &seeded {
            store
                .set(&format!("SessionHeader:{}", id), "{}", None)
                .await
                .unwrap();
        }
        store.add_member("Session_Files:orphan", "doc", None).await.unwrap();

        // Replays every taken id before producing fresh ones
        let mut candidates = seeded.clone();
        candidates.push("orphan".to_string());
        let counter = Arc::new(AtomicUsize::new(0));
        let generator_counter = counter.clone();
        let sessions = sessions(&store).with_id_generator(move || {
            let n = generator_counter.fetch_add(1, Ordering::SeqCst);
            candidates
                .get(n % (candidates.len() + 3))
                .cloned()
                .unwrap_or_else(|| format!("fresh{}", n))
        });

        let mut issued = Vec::new();
        for _ in 0..3 {
            let id = sessions.create_session().await.unwrap();
            assert!(!seeded.contains(&id));
            assert_ne!(id, "orphan");
            assert!(!issued.contains(&id));
            issued.push(id);
        }
    }

    #[tokio::test]
    async fn test_create_and_validate() {
        let store = MemoryStore::new();
        let sessions = sessions(&store);

        let id = sessions.create_session().await.unwrap();
        assert_eq!(id.len(), 32);
        assert!(sessions.validate(&id).await.unwrap());
        assert!(!sessions.validate("").await.unwrap());
        assert!(!sessions.validate("nope").await.unwrap());
        assert!(sessions.info(&id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_membership_is_idempotent() {
        let store = MemoryStore::new();
        let sessions = sessions(&store);
        let id = sessions.create_session().await.unwrap();

        assert!(sessions.append_document(&id, "d1").await.unwrap());
        assert!(!sessions.append_document(&id, "d1").await.unwrap());
        assert_eq!(sessions.documents(&id).await.unwrap(), vec!["d1".to_string()]);

        assert!(!sessions.remove_document(&id, "other").await.unwrap());
        assert_eq!(sessions.documents(&id).await.unwrap(), vec!["d1".to_string()]);

        assert!(sessions.remove_document(&id, "d1").await.unwrap());
        assert!(sessions.documents(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_append_requires_live_session() {
        let store = MemoryStore::new();
        let sessions = sessions(&store);
        assert!(matches!(
            sessions.append_document("ghost", "d1").await,
            Err(SessionError::InvalidSession)
        ));
        assert!(!sessions.remove_document("ghost", "d1").await.unwrap());
    }

    #[tokio::test]
    async fn test_document_belongs_to_one_session() {
        let store = MemoryStore::new();
        let sessions = sessions(&store);
        let owner = sessions.create_session().await.unwrap();
        let other = sessions.create_session().await.unwrap();
        sessions.append_document(&owner, "d1").await.unwrap();

        assert!(matches!(
            sessions.append_document(&other, "d1").await,
            Err(SessionError::DocumentOwned(_))
        ));
        assert!(sessions.documents(&other).await.unwrap().is_empty());
        assert_eq!(
            store.get("Document_Owner:d1").await.unwrap(),
            Some(owner.clone())
        );

        // Still refused after the owner ends, until its cascade has run
        sessions.delete_session(&owner).await.unwrap();
        assert!(matches!(
            sessions.append_document(&other, "d1").await,
            Err(SessionError::DocumentOwned(_))
        ));

        store.delete(&format!("Session_Files:{}", owner)).await.unwrap();
        assert!(sessions.append_document(&other, "d1").await.unwrap());
        assert_eq!(store.get("Document_Owner:d1").await.unwrap(), Some(other));
    }

    #[tokio::test]
    async fn test_document_with_objects_cannot_be_claimed() {
        let store = MemoryStore::new();
        let sessions = sessions(&store);
        let id = sessions.create_session().await.unwrap();
        sessions.attach_blob("d1", "d1/page-1.png").await.unwrap();

        assert!(matches!(
            sessions.append_document(&id, "d1").await,
            Err(SessionError::DocumentOwned(_))
        ));
        assert!(!store.exists("Document_Owner:d1").await.unwrap());
        assert!(sessions.documents(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_releases_ownership() {
        let store = MemoryStore::new();
        let sessions = sessions(&store);
        let first = sessions.create_session().await.unwrap();
        let second = sessions.create_session().await.unwrap();
        sessions.append_document(&first, "d1").await.unwrap();

        assert!(sessions.remove_document(&first, "d1").await.unwrap());
        assert!(!store.exists("Document_Owner:d1").await.unwrap());
        assert!(sessions.append_document(&second, "d1").await.unwrap());
    }

    #[tokio::test]
    async fn test_append_rejects_tagged_ids() {
        let store = MemoryStore::new();
        let sessions = sessions(&store);
        let id = sessions.create_session().await.unwrap();
        assert!(matches!(
            sessions.append_document(&id, "a:b").await,
            Err(SessionError::Key(_))
        ));
    }

    #[tokio::test]
    async fn test_validate_pair() {
        let store = MemoryStore::new();
        let sessions = sessions(&store);
        let id = sessions.create_session().await.unwrap();
        sessions.append_document(&id, "d1").await.unwrap();

        assert!(sessions.validate_pair(&id, "d1").await.unwrap());
        assert!(!sessions.validate_pair(&id, "d2").await.unwrap());
        assert!(!sessions.validate_pair("ghost", "d1").await.unwrap());

        sessions.delete_session(&id).await.unwrap();
        assert!(!sessions.validate_pair(&id, "d1").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reads_keep_session_alive() {
        let store = MemoryStore::new();
        let sessions = sessions(&store);
        let id = sessions.create_session().await.unwrap();
        sessions.append_document(&id, "d1").await.unwrap();

        tokio::time::advance(TTL.mul_f64(0.9)).await;
        assert_eq!(sessions.documents(&id).await.unwrap().len(), 1);

        tokio::time::advance(TTL.mul_f64(0.9)).await;
        assert!(sessions.validate(&id).await.unwrap());
        assert_eq!(sessions.documents(&id).await.unwrap().len(), 1);

        // Left alone, it expires
        tokio::time::advance(TTL + Duration::from_secs(1)).await;
        assert!(!sessions.validate(&id).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_association_outlives_header() {
        let store = MemoryStore::new();
        let sessions = sessions(&store);
        let id = sessions.create_session().await.unwrap();
        sessions.append_document(&id, "d1").await.unwrap();

        tokio::time::advance(TTL + Duration::from_secs(1)).await;
        assert!(!sessions.validate(&id).await.unwrap());
        assert!(store.exists(&format!("Session_Files:{}", id)).await.unwrap());

        tokio::time::advance(GRACE).await;
        assert!(!store.exists(&format!("Session_Files:{}", id)).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_keeps_association_for_cleanup() {
        let store = MemoryStore::new();
        let sessions = sessions(&store);
        let id = sessions.create_session().await.unwrap();
        sessions.append_document(&id, "d1").await.unwrap();

        assert!(sessions.delete_session(&id).await.unwrap());
        assert!(!sessions.delete_session(&id).await.unwrap());
        assert!(!sessions.validate(&id).await.unwrap());
        assert_eq!(
            store.members(&format!("Session_Files:{}", id)).await.unwrap(),
            vec!["d1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_corrupt_header_is_reported() {
        let store = MemoryStore::new();
        let sessions = sessions(&store);
        store
            .set("SessionHeader:broken", "not json", None)
            .await
            .unwrap();

        assert!(sessions.validate("broken").await.unwrap());
        assert!(matches!(
            sessions.info("broken").await,
            Err(SessionError::Store(StoreError::CorruptData { .. }))
        ));
    }

    #[tokio::test]
    async fn test_blob_registration() {
        let store = MemoryStore::new();
        let sessions = sessions(&store);
        sessions.attach_blob("d1", "d1/page-1.png").await.unwrap();
        sessions.attach_blob("d1", "d1/page-1.png").await.unwrap();
        sessions.attach_blob("d1", "d1/tables.json").await.unwrap();

        assert_eq!(sessions.blobs("d1").await.unwrap().len(), 2);
    }
}
