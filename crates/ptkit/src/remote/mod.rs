//! Remote layer — keeps mirrors in step with an external record store.
//!
//! - [`types`] — [`RemoteStore`] trait, snapshots, references, decoders.
//! - [`collection`] — [`RemoteCollection<T>`]: a sorted mirror of a collection.
//! - [`document`] — [`RemoteDocument<T>`]: a mirror of a single document.

pub mod collection;
pub mod document;
pub mod types;

pub use collection::{RemoteCollection, RemoteCollectionOptions, SnapshotReport};
pub use document::{RemoteDocument, RemoteDocumentOptions};
pub use types::{
    serde_decoder, CollectionRef, Decoder, DocumentFeed, DocumentRef, DocumentSnapshot, EntryKind,
    RemoteRecord, RemoteStore, Snapshot, SnapshotEntry, SnapshotFeed,
};
