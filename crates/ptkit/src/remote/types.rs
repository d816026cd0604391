//! Remote-store types: the store trait, change-feed snapshots, references and
//! the decoder that turns raw records into domain elements.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::{
    error::{DecodeError, RemoteError},
    reactive::Element,
};

// ============================================================================
// RemoteStore — user-provided store client
// ============================================================================

/// Stream of collection snapshots, in the order the store delivers them.
///
/// An `Err` item is terminal for the subscription: the consumer stops
/// applying updates until it subscribes again.
pub type SnapshotFeed = mpsc::UnboundedReceiver<Result<Snapshot, RemoteError>>;

/// Stream of single-document snapshots.
pub type DocumentFeed = mpsc::UnboundedReceiver<Result<DocumentSnapshot, RemoteError>>;

/// User-implemented client for the remote record store.
///
/// Implementations handle the wire protocol and document encoding; the
/// mirrors only see ordered snapshots of raw `serde_json::Value` records.
/// Writes never touch a local mirror: their effect shows up when it comes
/// back through the subscription feed.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Subscribe to a collection, optionally narrowed by an opaque `query`.
    async fn subscribe(
        &self,
        collection: &CollectionRef,
        query: Option<&Value>,
    ) -> Result<SnapshotFeed, RemoteError>;

    /// Subscribe to a single document.
    async fn subscribe_document(&self, document: &DocumentRef)
        -> Result<DocumentFeed, RemoteError>;

    /// Add a record under a store-assigned id and return that id.
    async fn add_record(
        &self,
        collection: &CollectionRef,
        record: Value,
    ) -> Result<String, RemoteError>;

    /// Write a record under `id`. With `merge`, only the given fields are
    /// overwritten; otherwise the record is replaced.
    async fn set_record(
        &self,
        collection: &CollectionRef,
        id: &str,
        record: Value,
        merge: bool,
    ) -> Result<(), RemoteError>;

    async fn delete_record(&self, collection: &CollectionRef, id: &str)
        -> Result<(), RemoteError>;
}

// ============================================================================
// References
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionRef {
    pub path: String,
}

impl CollectionRef {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    pub fn doc(&self, id: impl Into<String>) -> DocumentRef {
        DocumentRef {
            collection: self.clone(),
            id: id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentRef {
    pub collection: CollectionRef,
    pub id: String,
}

impl DocumentRef {
    pub fn path(&self) -> String {
        format!("{}/{}", self.collection.path, self.id)
    }
}

// ============================================================================
// Snapshots
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Added,
    Modified,
    Removed,
}

/// One record change inside a [`Snapshot`].
#[derive(Debug, Clone)]
pub struct SnapshotEntry {
    pub kind: EntryKind,
    pub id: String,
    pub data: Value,
}

impl SnapshotEntry {
    pub fn added(id: impl Into<String>, data: Value) -> Self {
        Self {
            kind: EntryKind::Added,
            id: id.into(),
            data,
        }
    }

    pub fn modified(id: impl Into<String>, data: Value) -> Self {
        Self {
            kind: EntryKind::Modified,
            id: id.into(),
            data,
        }
    }

    pub fn removed(id: impl Into<String>, data: Value) -> Self {
        Self {
            kind: EntryKind::Removed,
            id: id.into(),
            data,
        }
    }
}

/// One ordered batch of record changes delivered together by the store.
pub type Snapshot = Vec<SnapshotEntry>;

/// Current state of a single document; `data` is `None` when it does not exist.
#[derive(Debug, Clone)]
pub struct DocumentSnapshot {
    pub id: String,
    pub data: Option<Value>,
}

// ============================================================================
// Records and decoding
// ============================================================================

/// An element that carries the id of the remote record it mirrors.
pub trait RemoteRecord: Element {
    fn record_id(&self) -> &str;
}

/// Turns a raw record (with its id) into a domain element.
pub type Decoder<T> = Arc<dyn Fn(&str, &Value) -> Result<T, DecodeError> + Send + Sync>;

/// Build a [`Decoder`] from `T`'s serde implementation; `assign_id` stores the
/// record id on the decoded value.
pub fn serde_decoder<T>(assign_id: fn(&mut T, &str)) -> Decoder<T>
where
    T: DeserializeOwned + 'static,
{
    Arc::new(move |id: &str, data: &Value| {
        let mut value: T =
            serde_json::from_value(data.clone()).map_err(|e| DecodeError::new(id, e.to_string()))?;
        assign_id(&mut value, id);
        Ok(value)
    })
}
