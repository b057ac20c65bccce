//! Tag to cleanup handler table
//!
//! Every handler is idempotent: a resource that is already gone counts as
//! cleaned, so duplicate or replayed notifications are harmless.

use std::sync::Arc;

use serde::Serialize;

use crate::keys::{Tag, TaggedKey};
use crate::storage::BlobStore;
use crate::store::{KeyedStore, Namespace, SetStorage, StringStorage};

use super::CleanupError;

/// What ending a tagged key's life should clean up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cleanup {
    /// Cascade over every document of the session
    Session,
    /// Delete every object derived from a document, then the set naming them
    BlobSet,
    /// Delete one blob object
    BlobObject,
    /// Delete one keyed-store entry
    StoreEntry,
    /// Vector index entries; not managed by this service yet
    VectorIndex,
    /// Bookkeeping keys whose end needs no action
    None,
}

impl Tag {
    pub fn cleanup(&self) -> Cleanup {
        match self {
            Tag::SessionHeader => Cleanup::Session,
            Tag::S3Key => Cleanup::BlobSet,
            Tag::S3File => Cleanup::BlobObject,
            Tag::RedisKey => Cleanup::StoreEntry,
            Tag::ChromaDbKey => Cleanup::VectorIndex,
            Tag::SessionFiles | Tag::DocumentBlobs | Tag::DocumentOwner => Cleanup::None,
        }
    }
}

/// What a handler removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub objects_deleted: usize,
    pub entries_deleted: usize,
}

impl CleanupReport {
    fn merge(&mut self, other: CleanupReport) {
        self.objects_deleted += other.objects_deleted;
        self.entries_deleted += other.entries_deleted;
    }
}

/// Runs cleanup handlers against the keyed store and blob storage
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn KeyedStore>,
    blobs: Arc<dyn BlobStore>,
    session_documents: SetStorage,
    document_blobs: SetStorage,
    document_owners: StringStorage,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn KeyedStore>, blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            session_documents: SetStorage::new(
                store.clone(),
                Namespace::new(Tag::SessionFiles.prefix()),
            ),
            document_blobs: SetStorage::new(
                store.clone(),
                Namespace::new(Tag::DocumentBlobs.prefix()),
            ),
            document_owners: StringStorage::new(
                store.clone(),
                Namespace::new(Tag::DocumentOwner.prefix()),
            ),
            store,
            blobs,
        }
    }

    /// Clean up the resource a tagged key stood for
    pub async fn dispatch(&self, key: &TaggedKey) -> Result<CleanupReport, CleanupError> {
        let id = key.identifier();
        match key.tag().cleanup() {
            Cleanup::Session => self.cleanup_session(id).await,
            Cleanup::BlobSet => self.cleanup_blob_set(id).await,
            Cleanup::BlobObject => self.cleanup_object(id).await,
            Cleanup::StoreEntry => self.cleanup_entry(id).await,
            Cleanup::VectorIndex => {
                tracing::info!(identifier = %id, "Vector index cleanup not handled");
                Ok(CleanupReport::default())
            }
            Cleanup::None => Ok(CleanupReport::default()),
        }
    }

    /// Remove every document of an ended session.
    ///
    /// Documents whose owner record names another session are skipped. The
    /// association set is deleted last. If any step fails the set is left in
    /// place, still carrying its grace TTL.
    async fn cleanup_session(&self, session_id: &str) -> Result<CleanupReport, CleanupError> {
        let documents = self.session_documents.snapshot(session_id).await?;
        tracing::info!(
            session_id = %session_id,
            documents = documents.len(),
            "Cleaning up session"
        );

        let mut report = CleanupReport::default();
        for doc_id in &documents {
            let owner = self.document_owners.get(doc_id).await?;
            if owner.as_deref().is_some_and(|owner| owner != session_id) {
                tracing::warn!(
                    session_id = %session_id,
                    doc_id = %doc_id,
                    "Skipping document owned by another session"
                );
                continue;
            }

            if self.blobs.delete_object(doc_id).await? {
                report.objects_deleted += 1;
            }
            report.merge(self.cleanup_blob_set(doc_id).await?);
            if owner.is_some() && self.document_owners.delete(doc_id).await? {
                report.entries_deleted += 1;
            }
        }

        if self.session_documents.delete(session_id).await? {
            report.entries_deleted += 1;
        }
        Ok(report)
    }

    async fn cleanup_blob_set(&self, doc_id: &str) -> Result<CleanupReport, CleanupError> {
        let objects = self.document_blobs.snapshot(doc_id).await?;

        let mut report = CleanupReport::default();
        for object in &objects {
            if self.blobs.delete_object(object).await? {
                report.objects_deleted += 1;
            }
        }
        if self.document_blobs.delete(doc_id).await? {
            report.entries_deleted += 1;
        }

        tracing::debug!(doc_id = %doc_id, objects = objects.len(), "Cleaned up blob set");
        Ok(report)
    }

    async fn cleanup_object(&self, object_key: &str) -> Result<CleanupReport, CleanupError> {
        let deleted = self.blobs.delete_object(object_key).await?;
        Ok(CleanupReport {
            objects_deleted: usize::from(deleted),
            ..Default::default()
        })
    }

    async fn cleanup_entry(&self, key: &str) -> Result<CleanupReport, CleanupError> {
        let deleted = self.store.delete(key).await?;
        if deleted {
            tracing::debug!(key = %key, "Deleted store entry");
        }
        Ok(CleanupReport {
            entries_deleted: usize::from(deleted),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBlobStore;
    use crate::store::MemoryStore;

    fn dispatcher(store: &MemoryStore, blobs: &MemoryBlobStore) -> Dispatcher {
        Dispatcher::new(Arc::new(store.clone()), Arc::new(blobs.clone()))
    }

    fn key(tag: Tag, id: &str) -> TaggedKey {
        TaggedKey::new(tag, id).unwrap()
    }

    #[test]
    fn test_every_tag_has_a_cleanup() {
        assert_eq!(Tag::SessionHeader.cleanup(), Cleanup::Session);
        assert_eq!(Tag::S3Key.cleanup(), Cleanup::BlobSet);
        assert_eq!(Tag::S3File.cleanup(), Cleanup::BlobObject);
        assert_eq!(Tag::RedisKey.cleanup(), Cleanup::StoreEntry);
        assert_eq!(Tag::ChromaDbKey.cleanup(), Cleanup::VectorIndex);
        assert_eq!(Tag::SessionFiles.cleanup(), Cleanup::None);
        assert_eq!(Tag::DocumentBlobs.cleanup(), Cleanup::None);
        assert_eq!(Tag::DocumentOwner.cleanup(), Cleanup::None);
    }

    #[tokio::test]
    async fn test_session_cascade() {
        let store = MemoryStore::new();
        let blobs = MemoryBlobStore::new();
        for object in ["d1", "d2", "o1", "o2", "unrelated"] {
            blobs.put(object, b"x".to_vec());
        }
        store.add_member("Session_Files:s1", "d1", None).await.unwrap();
        store.add_member("Session_Files:s1", "d2", None).await.unwrap();
        store.add_member("Document_Blobs:d1", "o1", None).await.unwrap();
        store.add_member("Document_Blobs:d1", "o2", None).await.unwrap();

        let dispatcher = dispatcher(&store, &blobs);
        let report = dispatcher
            .dispatch(&key(Tag::SessionHeader, "s1"))
            .await
            .unwrap();

        assert_eq!(report.objects_deleted, 4);
        assert_eq!(report.entries_deleted, 2);
        assert_eq!(blobs.keys(), vec!["unrelated".to_string()]);
        assert!(store.is_empty());

        // Replayed notification: nothing left to do, still a success
        let again = dispatcher
            .dispatch(&key(Tag::SessionHeader, "s1"))
            .await
            .unwrap();
        assert_eq!(again, CleanupReport::default());
    }

    #[tokio::test]
    async fn test_session_cascade_skips_documents_owned_elsewhere() {
        let store = MemoryStore::new();
        let blobs = MemoryBlobStore::new();
        for object in ["victim-doc", "victim-doc/page-1.png", "mine"] {
            blobs.put(object, b"x".to_vec());
        }
        store.set("Document_Owner:victim-doc", "victim", None).await.unwrap();
        store
            .add_member("Document_Blobs:victim-doc", "victim-doc/page-1.png", None)
            .await
            .unwrap();
        store.set("Document_Owner:mine", "intruder", None).await.unwrap();
        // Membership written behind the session store's back
        store
            .add_member("Session_Files:intruder", "victim-doc", None)
            .await
            .unwrap();
        store.add_member("Session_Files:intruder", "mine", None).await.unwrap();

        let report = dispatcher(&store, &blobs)
            .dispatch(&key(Tag::SessionHeader, "intruder"))
            .await
            .unwrap();

        assert_eq!(report.objects_deleted, 1);
        assert_eq!(report.entries_deleted, 2);
        assert!(!blobs.contains("mine"));
        assert!(!store.exists("Document_Owner:mine").await.unwrap());
        assert!(blobs.contains("victim-doc"));
        assert!(blobs.contains("victim-doc/page-1.png"));
        assert_eq!(
            store.get("Document_Owner:victim-doc").await.unwrap(),
            Some("victim".to_string())
        );
        assert!(store.exists("Document_Blobs:victim-doc").await.unwrap());
    }

    #[tokio::test]
    async fn test_session_cascade_failure_keeps_association() {
        let store = MemoryStore::new();
        let blobs = MemoryBlobStore::new();
        blobs.put("d1", b"x".to_vec());
        store.add_member("Session_Files:s1", "d1", None).await.unwrap();
        blobs.set_unavailable(true);

        let result = dispatcher(&store, &blobs)
            .dispatch(&key(Tag::SessionHeader, "s1"))
            .await;

        assert!(matches!(result, Err(CleanupError::Storage(_))));
        assert!(store.exists("Session_Files:s1").await.unwrap());

        // Retried once storage is back
        blobs.set_unavailable(false);
        dispatcher(&store, &blobs)
            .dispatch(&key(Tag::SessionHeader, "s1"))
            .await
            .unwrap();
        assert!(!blobs.contains("d1"));
        assert!(!store.exists("Session_Files:s1").await.unwrap());
    }

    #[tokio::test]
    async fn test_blob_set_and_object() {
        let store = MemoryStore::new();
        let blobs = MemoryBlobStore::new();
        blobs.put("doc1/page-1.png", b"png".to_vec());
        blobs.put("doc1/tables.json", b"{}".to_vec());
        blobs.put("single.pdf", b"pdf".to_vec());
        store
            .add_member("Document_Blobs:doc1", "doc1/page-1.png", None)
            .await
            .unwrap();
        store
            .add_member("Document_Blobs:doc1", "doc1/tables.json", None)
            .await
            .unwrap();

        let dispatcher = dispatcher(&store, &blobs);
        let report = dispatcher.dispatch(&key(Tag::S3Key, "doc1")).await.unwrap();
        assert_eq!(report.objects_deleted, 2);
        assert!(!store.exists("Document_Blobs:doc1").await.unwrap());

        let report = dispatcher
            .dispatch(&key(Tag::S3File, "single.pdf"))
            .await
            .unwrap();
        assert_eq!(report.objects_deleted, 1);
        assert!(blobs.keys().is_empty());

        // Missing object is not an error
        let report = dispatcher
            .dispatch(&key(Tag::S3File, "single.pdf"))
            .await
            .unwrap();
        assert_eq!(report.objects_deleted, 0);
    }

    #[tokio::test]
    async fn test_store_entry_and_noops() {
        let store = MemoryStore::new();
        let blobs = MemoryBlobStore::new();
        store.set("sess1", "cached", None).await.unwrap();

        let dispatcher = dispatcher(&store, &blobs);
        let report = dispatcher
            .dispatch(&key(Tag::RedisKey, "sess1"))
            .await
            .unwrap();
        assert_eq!(report.entries_deleted, 1);
        assert!(!store.exists("sess1").await.unwrap());

        for tag in [
            Tag::ChromaDbKey,
            Tag::SessionFiles,
            Tag::DocumentBlobs,
            Tag::DocumentOwner,
        ] {
            let report = dispatcher.dispatch(&key(tag, "x")).await.unwrap();
            assert_eq!(report, CleanupReport::default());
        }
        assert!(blobs.deletions().is_empty());
    }
}
