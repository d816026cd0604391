//! RemoteCollection<T> — keeps a [`SortedMirror`] in step with a remote
//! collection's change feed.
//!
//! Each snapshot from the feed is decoded off the mirror task, then applied
//! on it as one job: for every entry the previous local version is resolved
//! by record id, the entry is applied as add / modify / remove, and once the
//! whole snapshot is in, exactly one batch is delivered to batch listeners.
//!
//! Outbound writes (`insert`, `remove_by_id`, `update`) go to the store only.
//! The mirror changes when the write comes back through the feed, the same
//! path remote-origin writes take.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;

use crate::{
    error::{PtkitError, Rejection, Result},
    reactive::{sorted_mirror::BatchMode, Outcome, SortedMirror},
};

use super::types::{
    CollectionRef, Decoder, EntryKind, RemoteRecord, RemoteStore, Snapshot, SnapshotFeed,
};

// ============================================================================
// Options / report
// ============================================================================

/// Configuration for [`RemoteCollection`].
pub struct RemoteCollectionOptions<T> {
    pub store: Arc<dyn RemoteStore>,
    /// Where writes go.
    pub collection: CollectionRef,
    /// Narrows the subscription; writes still target `collection`.
    pub query: Option<Value>,
    pub decoder: Decoder<T>,
    /// Records failing this check are dropped before they reach the mirror.
    pub sanity_filter: Option<Arc<dyn Fn(&T) -> bool + Send + Sync>>,
    /// Applied to every decoded record before the sanity filter.
    pub prepare: Option<Arc<dyn Fn(T) -> T + Send + Sync>>,
    /// Turn a MODIFIED entry whose sort key changed into remove + add
    /// (default: false, the modify is ignored by the mirror).
    ///
    /// A resorted entry fires two per-event notifications, REMOVE(before)
    /// then ADD(after), and counts once in [`SnapshotReport::applied`]. With
    /// this enabled a snapshot of N entries can fire up to 2N per-event
    /// notifications; it still fires exactly one batch.
    pub resort_on_key_change: Option<bool>,
}

impl<T> RemoteCollectionOptions<T> {
    pub fn new(store: Arc<dyn RemoteStore>, collection: CollectionRef, decoder: Decoder<T>) -> Self {
        Self {
            store,
            collection,
            query: None,
            decoder,
            sanity_filter: None,
            prepare: None,
            resort_on_key_change: None,
        }
    }
}

/// What applying one snapshot did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotReport {
    /// Entries that changed the mirror.
    pub applied: usize,
    /// Entries the mirror ignored (duplicates, absent removals, key changes).
    pub ignored: usize,
    /// Entries dropped by the sanity filter.
    pub rejected: usize,
    /// Entries that failed to decode.
    pub failed: usize,
}

// ============================================================================
// RemoteCollection
// ============================================================================

struct Inner<T> {
    store: Arc<dyn RemoteStore>,
    collection: CollectionRef,
    query: Option<Value>,
    decoder: Decoder<T>,
    sanity_filter: Option<Arc<dyn Fn(&T) -> bool + Send + Sync>>,
    prepare: Option<Arc<dyn Fn(T) -> T + Send + Sync>>,
    resort_on_key_change: bool,
}

pub struct RemoteCollection<T: RemoteRecord> {
    mirror: SortedMirror<T>,
    inner: Arc<Inner<T>>,
    subscription: Mutex<Option<JoinHandle<()>>>,
}

impl<T: RemoteRecord> RemoteCollection<T> {
    /// Create the adapter with an empty mirror ordered by `cmp`. Call
    /// [`subscribe`](Self::subscribe) to start following the feed.
    pub fn new(
        name: impl Into<String>,
        cmp: impl Fn(&T, &T) -> Ordering + Send + Sync + 'static,
        options: RemoteCollectionOptions<T>,
    ) -> Self {
        Self {
            mirror: SortedMirror::new(name, cmp),
            inner: Arc::new(Inner {
                store: options.store,
                collection: options.collection,
                query: options.query,
                decoder: options.decoder,
                sanity_filter: options.sanity_filter,
                prepare: options.prepare,
                resort_on_key_change: options.resort_on_key_change.unwrap_or(false),
            }),
            subscription: Mutex::new(None),
        }
    }

    /// [`new`](Self::new) followed by [`subscribe`](Self::subscribe).
    pub async fn open(
        name: impl Into<String>,
        cmp: impl Fn(&T, &T) -> Ordering + Send + Sync + 'static,
        options: RemoteCollectionOptions<T>,
    ) -> Result<Self> {
        let collection = Self::new(name, cmp, options);
        collection.subscribe().await?;
        Ok(collection)
    }

    pub fn mirror(&self) -> &SortedMirror<T> {
        &self.mirror
    }

    pub fn elems(&self) -> Arc<Vec<T>> {
        self.mirror.elems()
    }

    pub fn collection(&self) -> &CollectionRef {
        &self.inner.collection
    }

    pub fn get_by_id(&self, id: &str) -> Option<T> {
        self.mirror.find(|e| e.record_id() == id)
    }

    // -----------------------------------------------------------------------
    // Subscription lifecycle
    // -----------------------------------------------------------------------

    /// Start following the store's feed. A no-op when already subscribed.
    ///
    /// The subscription lives until [`unsubscribe`](Self::unsubscribe) or
    /// [`clean`](Self::clean). An error item on the feed stops it; call
    /// `subscribe` again to resume.
    pub async fn subscribe(&self) -> Result<()> {
        if self.is_subscribed() {
            tracing::warn!(mirror = %self.mirror.name(), "already subscribed");
            return Ok(());
        }

        let feed = self
            .inner
            .store
            .subscribe(&self.inner.collection, self.inner.query.as_ref())
            .await
            .map_err(|e| {
                tracing::error!(
                    mirror = %self.mirror.name(),
                    collection = %self.inner.collection.path,
                    error = %e,
                    "failed to subscribe to collection"
                );
                e
            })?;

        let mut slot = self.subscription.lock();
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            tracing::warn!(mirror = %self.mirror.name(), "concurrent subscribe, dropping duplicate feed");
            return Ok(());
        }
        *slot = Some(tokio::spawn(follow(
            self.mirror.clone(),
            Arc::clone(&self.inner),
            feed,
        )));
        tracing::debug!(
            mirror = %self.mirror.name(),
            collection = %self.inner.collection.path,
            "subscribed"
        );
        Ok(())
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Stop following the feed. The mirror keeps its contents.
    pub fn unsubscribe(&self) {
        if let Some(handle) = self.subscription.lock().take() {
            handle.abort();
            tracing::debug!(mirror = %self.mirror.name(), "unsubscribed");
        }
    }

    /// Unsubscribe, then empty the mirror and drop all its listeners.
    pub async fn clean(&self) -> Result<()> {
        self.unsubscribe();
        self.mirror.clean().await
    }

    /// Apply one snapshot directly, as if it had arrived on the feed.
    pub async fn apply_snapshot(&self, snapshot: Snapshot) -> Result<SnapshotReport> {
        apply_snapshot(&self.mirror, &self.inner, snapshot).await
    }

    // -----------------------------------------------------------------------
    // Outbound writes
    // -----------------------------------------------------------------------

    pub async fn remove_by_id(&self, id: &str) -> Result<()> {
        tracing::debug!(mirror = %self.mirror.name(), id = %id, "removing by id");
        self.inner
            .store
            .delete_record(&self.inner.collection, id)
            .await
            .map_err(|e| self.write_failed("delete", id, e))
    }

    pub async fn remove(&self, elem: &T) -> Result<()> {
        self.remove_by_id(elem.record_id()).await
    }

    /// Delete the record currently at `index` in the mirror.
    pub async fn remove_at(&self, index: usize) -> Result<()> {
        let elem = self.mirror.get(index).ok_or(PtkitError::IndexOutOfRange {
            index,
            len: self.mirror.len(),
        })?;
        self.remove_by_id(elem.record_id()).await
    }

    /// Merge `fields` into the record `id`.
    pub async fn update(&self, id: &str, fields: Map<String, Value>) -> Result<()> {
        self.inner
            .store
            .set_record(&self.inner.collection, id, Value::Object(fields), true)
            .await
            .map_err(|e| self.write_failed("update", id, e))
    }

    fn write_failed(&self, op: &str, id: &str, e: crate::error::RemoteError) -> PtkitError {
        tracing::error!(
            mirror = %self.mirror.name(),
            op,
            id = %id,
            error = %e,
            "remote write failed"
        );
        e.into()
    }
}

impl<T: RemoteRecord + Serialize> RemoteCollection<T> {
    /// Write `elem` to the store, under `with_id` or a store-assigned id.
    /// Returns the id the record was written under.
    pub async fn insert(&self, elem: &T, with_id: Option<&str>) -> Result<String> {
        let record = serde_json::to_value(elem)?;
        match with_id {
            None => self
                .inner
                .store
                .add_record(&self.inner.collection, record)
                .await
                .map_err(|e| self.write_failed("add", "<new>", e)),
            Some(id) => {
                self.inner
                    .store
                    .set_record(&self.inner.collection, id, record, false)
                    .await
                    .map_err(|e| self.write_failed("set", id, e))?;
                Ok(id.to_string())
            }
        }
    }
}

impl<T: RemoteRecord> fmt::Debug for RemoteCollection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteCollection")
            .field("collection", &self.inner.collection)
            .field("subscribed", &self.is_subscribed())
            .field("mirror", &self.mirror)
            .finish()
    }
}

// ============================================================================
// Feed processing
// ============================================================================

async fn follow<T: RemoteRecord>(mirror: SortedMirror<T>, inner: Arc<Inner<T>>, mut feed: SnapshotFeed) {
    while let Some(item) = feed.recv().await {
        match item {
            Ok(snapshot) => {
                if let Err(e) = apply_snapshot(&mirror, &inner, snapshot).await {
                    tracing::error!(mirror = %mirror.name(), error = %e, "mirror stopped, ending subscription");
                    return;
                }
            }
            Err(e) => {
                tracing::error!(
                    mirror = %mirror.name(),
                    collection = %inner.collection.path,
                    error = %e,
                    "error listening to collection, updates halted until re-subscribed"
                );
                return;
            }
        }
    }
    tracing::debug!(mirror = %mirror.name(), "feed closed");
}

async fn apply_snapshot<T: RemoteRecord>(
    mirror: &SortedMirror<T>,
    inner: &Inner<T>,
    snapshot: Snapshot,
) -> Result<SnapshotReport> {
    let mut report = SnapshotReport::default();
    let mut entries = Vec::with_capacity(snapshot.len());

    for entry in snapshot {
        let record = match (inner.decoder)(&entry.id, &entry.data) {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(mirror = %mirror.name(), id = %entry.id, error = %e, "error decoding record, skipping");
                report.failed += 1;
                continue;
            }
        };
        let record = match &inner.prepare {
            Some(prepare) => prepare(record),
            None => record,
        };
        if let Some(sanity) = &inner.sanity_filter {
            if !sanity(&record) {
                let rejection = Rejection::SanityCheckRejected { id: entry.id };
                tracing::warn!(mirror = %mirror.name(), record = ?record, "{rejection}");
                report.rejected += 1;
                continue;
            }
        }
        entries.push((entry.kind, record));
    }

    let resort = inner.resort_on_key_change;
    let name = mirror.name().to_string();
    mirror
        .transact(BatchMode::Always, move |state| {
            for (kind, record) in entries {
                let before = state.find(|e| e.record_id() == record.record_id()).cloned();
                let outcome = match kind {
                    EntryKind::Added => state.add(record),
                    EntryKind::Modified => {
                        let before = before.unwrap_or_else(|| stale_before(&name, &record));
                        if resort && state.compare(&before, &record) != Ordering::Equal {
                            state.remove(&before);
                            state.add(record)
                        } else {
                            state.modify(before, record)
                        }
                    }
                    EntryKind::Removed => {
                        let before = before.unwrap_or_else(|| stale_before(&name, &record));
                        state.remove(&before)
                    }
                };
                match outcome {
                    Outcome::Applied(_) => report.applied += 1,
                    Outcome::Ignored(_) => report.ignored += 1,
                }
            }
            tracing::debug!(mirror = %name, ?report, "snapshot applied");
            report
        })
        .await
}

fn stale_before<T: RemoteRecord>(mirror: &str, record: &T) -> T {
    tracing::warn!(
        mirror = %mirror,
        id = %record.record_id(),
        "no local version of record, using incoming record as before"
    );
    record.clone()
}
