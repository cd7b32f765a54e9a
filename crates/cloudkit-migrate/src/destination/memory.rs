//! In-memory stores used for dry runs and tests.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::destination::{Document, DocumentStore, ObjectStore};
use crate::error::{Error, Result};

type DocumentKey = (String, String);

/// Document store kept in a map keyed by collection and id.
#[derive(Default)]
pub struct MemoryDocumentStore {
    documents: Mutex<BTreeMap<DocumentKey, Document>>,
    failing_ids: HashSet<String>,
    writes: AtomicUsize,
}

impl MemoryDocumentStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects every write to a document with one of these ids.
    #[cfg(test)]
    #[must_use]
    pub(crate) fn with_failing_ids(mut self, ids: &[&str]) -> Self {
        self.failing_ids = ids.iter().map(|id| (*id).to_string()).collect();
        self
    }

    /// Returns a copy of a stored document.
    pub fn get(&self, collection: &str, id: &str) -> Option<Document> {
        self.documents
            .lock()
            .ok()?
            .get(&(collection.to_string(), id.to_string()))
            .cloned()
    }

    /// Number of documents in a collection.
    pub fn count(&self, collection: &str) -> usize {
        self.documents
            .lock()
            .map(|docs| docs.keys().filter(|(c, _)| c == collection).count())
            .unwrap_or(0)
    }

    /// Number of accepted writes.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    fn write(&self, collection: &str, document: &Document, merge: bool) -> Result<()> {
        if self.failing_ids.contains(&document.id) {
            return Err(Error::RecordWrite(format!(
                "write of '{}' rejected",
                document.id
            )));
        }

        let mut documents = self
            .documents
            .lock()
            .map_err(|_| Error::RecordWrite("document store poisoned".to_string()))?;
        let key = (collection.to_string(), document.id.clone());

        match documents.get_mut(&key) {
            Some(existing) if merge => {
                existing
                    .fields
                    .extend(document.fields.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            _ => {
                documents.insert(key, document.clone());
            }
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn set(&self, collection: &str, document: &Document) -> Result<()> {
        self.write(collection, document, false)
    }

    async fn merge(&self, collection: &str, document: &Document) -> Result<()> {
        self.write(collection, document, true)
    }
}

/// An object held by [`MemoryObjectStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    /// Raw bytes.
    pub data: Vec<u8>,
    /// Declared content type.
    pub content_type: String,
    /// Whether the object was made public.
    pub public: bool,
}

/// Object store kept in a map keyed by path.
pub struct MemoryObjectStore {
    bucket: String,
    objects: Mutex<BTreeMap<String, StoredObject>>,
    fail_uploads: bool,
    uploads: AtomicUsize,
}

impl MemoryObjectStore {
    /// Creates an empty store for `bucket`.
    #[must_use]
    pub fn new(bucket: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            objects: Mutex::new(BTreeMap::new()),
            fail_uploads: false,
            uploads: AtomicUsize::new(0),
        }
    }

    /// Rejects every upload.
    #[cfg(test)]
    #[must_use]
    pub(crate) fn failing(mut self) -> Self {
        self.fail_uploads = true;
        self
    }

    /// Returns a copy of a stored object.
    pub fn get(&self, path: &str) -> Option<StoredObject> {
        self.objects.lock().ok()?.get(path).cloned()
    }

    /// Number of accepted uploads.
    pub fn uploads(&self) -> usize {
        self.uploads.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn upload(&self, path: &str, data: Vec<u8>, content_type: &str) -> Result<()> {
        if self.fail_uploads {
            return Err(Error::AssetTransfer(format!("upload of '{}' rejected", path)));
        }
        let mut objects = self
            .objects
            .lock()
            .map_err(|_| Error::AssetTransfer("object store poisoned".to_string()))?;
        objects.insert(
            path.to_string(),
            StoredObject {
                data,
                content_type: content_type.to_string(),
                public: false,
            },
        );
        self.uploads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn make_public(&self, path: &str) -> Result<()> {
        let mut objects = self
            .objects
            .lock()
            .map_err(|_| Error::AssetTransfer("object store poisoned".to_string()))?;
        match objects.get_mut(path) {
            Some(object) => {
                object.public = true;
                Ok(())
            }
            None => Err(Error::AssetTransfer(format!("no such object '{}'", path))),
        }
    }

    fn public_url(&self, path: &str) -> String {
        format!("memory://{}/{}", self.bucket, path)
    }
}
