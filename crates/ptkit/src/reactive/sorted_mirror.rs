//! SortedMirror<T> — an always-sorted, deduplicated observable sequence.
//!
//! # Threading model
//!
//! `SortedMirror<T>` is a cheap, cloneable handle. The sequence and both
//! listener registries live on a single mirror task (its mailbox);
//! every mutation and every (de)registration is a job on that task, so
//! mutations never race and listeners observe events in mutation order.
//!
//! Readers do not go through the task. After each job that changes the
//! contents, the task publishes the new sequence as an immutable
//! `Arc<Vec<T>>`; [`SortedMirror::elems`] hands out that snapshot, which is
//! always fully applied.
//!
//! # Listener channels
//!
//! - Per-event listeners ([`SortedMirror::register_listener`]) receive one
//!   [`Event`] per applied ADD / REMOVE / MODIFY. Registering replays the
//!   current contents as ADD events first.
//! - Batch listeners ([`SortedMirror::register_all_change_listener`]) receive
//!   one `&[Change<T>]` per logical group of mutations. Registering replays
//!   the current contents as one synthetic batch of ADDs.
//!
//! Callbacks run on the mirror task after the mutation is complete. A
//! callback that needs to mutate the same mirror must use
//! [`SortedMirror::enqueue`]; awaiting a mutation of the same mirror from
//! inside its own callback deadlocks.

use std::cmp::Ordering;
use std::fmt;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::{
    error::{Rejection, Result},
    mailbox::Mailbox,
};

use super::{
    change::{tally, Change, Event},
    event_bus::{EventBus, ListenerFn},
};

// ============================================================================
// Element / Comparator / Position
// ============================================================================

/// Bound shared by everything a mirror can hold.
pub trait Element: Clone + fmt::Debug + Send + Sync + 'static {}

impl<T: Clone + fmt::Debug + Send + Sync + 'static> Element for T {}

/// The total order a mirror maintains; `Equal` means "same element".
pub type Comparator<T> = Arc<dyn Fn(&T, &T) -> Ordering + Send + Sync>;

/// Result of a binary search over a mirror's contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    /// `elems[i]` compares equal to the searched value.
    Found(usize),
    /// Everything before `i` compares less, everything from `i` on greater.
    InsertAt(usize),
}

impl Position {
    pub fn index(self) -> usize {
        match self {
            Self::Found(i) | Self::InsertAt(i) => i,
        }
    }

    pub fn is_found(self) -> bool {
        matches!(self, Self::Found(_))
    }
}

/// Locate `v` in the strictly increasing slice `elems`.
pub fn position_of<T>(elems: &[T], v: &T, cmp: &dyn Fn(&T, &T) -> Ordering) -> Position {
    match elems.binary_search_by(|e| cmp(e, v)) {
        Ok(i) => Position::Found(i),
        Err(i) => Position::InsertAt(i),
    }
}

// ============================================================================
// Outcome / Mutation
// ============================================================================

/// What a single mutation did.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Applied(Change<T>),
    Ignored(Rejection),
}

impl<T> Outcome<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    pub fn change(&self) -> Option<&Change<T>> {
        match self {
            Self::Applied(c) => Some(c),
            Self::Ignored(_) => None,
        }
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Self::Applied(_) => None,
            Self::Ignored(r) => Some(r),
        }
    }
}

/// A mutation request, for [`SortedMirror::apply_batch`] and
/// [`SortedMirror::enqueue`].
#[derive(Debug, Clone)]
pub enum Mutation<T> {
    Insert(T),
    /// The index is a hint only; the element still lands at its sorted position.
    InsertAt(usize, T),
    Remove(T),
    RemoveAt(usize),
    Modify { before: T, after: T },
}

/// Whether a job reports its changes to batch listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BatchMode {
    None,
    IfNonEmpty,
    Always,
}

// ============================================================================
// MirrorState — owned by the mirror task
// ============================================================================

pub(crate) struct MirrorState<T> {
    name: Arc<str>,
    cmp: Comparator<T>,
    elems: Arc<Vec<T>>,
    published: Arc<RwLock<Arc<Vec<T>>>>,
    pending: Vec<Event<T>>,
    events: EventBus<Event<T>>,
    batches: EventBus<Vec<Change<T>>>,
}

impl<T: Element> MirrorState<T> {
    fn new(name: Arc<str>, cmp: Comparator<T>, published: Arc<RwLock<Arc<Vec<T>>>>) -> Self {
        Self {
            events: EventBus::new(Arc::clone(&name)),
            batches: EventBus::new(format!("{name}/batch")),
            name,
            cmp,
            elems: Arc::new(Vec::new()),
            published,
            pending: Vec::new(),
        }
    }

    pub(crate) fn elems(&self) -> &[T] {
        &self.elems
    }

    pub(crate) fn position_of(&self, v: &T) -> Position {
        position_of(self.elems.as_slice(), v, self.cmp.as_ref())
    }

    pub(crate) fn compare(&self, a: &T, b: &T) -> Ordering {
        (self.cmp)(a, b)
    }

    pub(crate) fn find(&self, pred: impl Fn(&T) -> bool) -> Option<&T> {
        self.elems.iter().find(|e| pred(e))
    }

    pub(crate) fn add(&mut self, elem: T) -> Outcome<T> {
        match self.position_of(&elem) {
            Position::Found(_) => {
                tracing::warn!(mirror = %self.name, elem = ?elem, "element already exists, ignoring");
                Outcome::Ignored(Rejection::DuplicateInsert)
            }
            Position::InsertAt(i) => self.splice_in(i, elem),
        }
    }

    pub(crate) fn remove(&mut self, elem: &T) -> Outcome<T> {
        match self.position_of(elem) {
            Position::Found(i) => {
                let removed = Arc::make_mut(&mut self.elems).remove(i);
                tracing::debug!(mirror = %self.name, elem = ?removed, index = i, "remove");
                self.pending.push(Event {
                    change: Change::remove(removed.clone()),
                    index: i,
                });
                Outcome::Applied(Change::remove(removed))
            }
            Position::InsertAt(_) => {
                tracing::debug!(mirror = %self.name, elem = ?elem, "remove of absent element, ignoring");
                Outcome::Ignored(Rejection::NotFoundOnRemove)
            }
        }
    }

    pub(crate) fn remove_at(&mut self, index: usize) -> Outcome<T> {
        match self.elems.get(index).cloned() {
            Some(elem) => self.remove(&elem),
            None => {
                let len = self.elems.len();
                tracing::warn!(mirror = %self.name, index, len, "remove_at out of range");
                Outcome::Ignored(Rejection::IndexOutOfRange { index, len })
            }
        }
    }

    pub(crate) fn modify(&mut self, before: T, after: T) -> Outcome<T> {
        let len = self.elems.len();
        match self.position_of(&after) {
            Position::InsertAt(i) if i >= len => {
                tracing::debug!(mirror = %self.name, elem = ?after, "modify past the end, adding");
                self.splice_in(i, after)
            }
            _ if self.compare(&before, &after) != Ordering::Equal => {
                tracing::warn!(
                    mirror = %self.name,
                    before = ?before,
                    after = ?after,
                    "modify changes the sort key, ignoring"
                );
                Outcome::Ignored(Rejection::InconsistentModify)
            }
            Position::Found(i) => {
                tracing::debug!(mirror = %self.name, before = ?before, after = ?after, "modify");
                Arc::make_mut(&mut self.elems)[i] = after.clone();
                self.pending.push(Event {
                    change: Change::modify(before.clone(), after.clone()),
                    index: i,
                });
                Outcome::Applied(Change::modify(before, after))
            }
            Position::InsertAt(i) => {
                // `before` was never tracked here; overwriting elems[i] would drop a neighbour.
                tracing::warn!(mirror = %self.name, elem = ?after, "modified element not tracked, adding");
                self.splice_in(i, after)
            }
        }
    }

    pub(crate) fn apply(&mut self, mutation: Mutation<T>) -> Outcome<T> {
        match mutation {
            Mutation::Insert(elem) => self.add(elem),
            Mutation::InsertAt(hint, elem) => {
                let outcome = self.add(elem);
                if let Some(event) = self.pending.last() {
                    if outcome.is_applied() && event.index != hint {
                        tracing::debug!(
                            mirror = %self.name,
                            hint,
                            index = event.index,
                            "insert_at hint differs from sorted position"
                        );
                    }
                }
                outcome
            }
            Mutation::Remove(elem) => self.remove(&elem),
            Mutation::RemoveAt(index) => self.remove_at(index),
            Mutation::Modify { before, after } => self.modify(before, after),
        }
    }

    /// Publish the new contents and deliver everything applied since the last
    /// commit: per-event listeners first, in order, then one batch per `mode`.
    pub(crate) fn commit(&mut self, mode: BatchMode) {
        let pending = std::mem::take(&mut self.pending);
        if !pending.is_empty() {
            *self.published.write() = Arc::clone(&self.elems);
        }

        for event in &pending {
            self.events.dispatch(event);
        }

        let emit = match mode {
            BatchMode::None => false,
            BatchMode::IfNonEmpty => !pending.is_empty(),
            BatchMode::Always => true,
        };
        if emit {
            let batch: Vec<Change<T>> = pending.into_iter().map(|e| e.change).collect();
            self.dispatch_batch(batch);
        }
    }

    /// Run `job`, then commit whatever it applied, even if it panicked part
    /// way through. The panic is re-raised after the commit so the mailbox
    /// reports it; no events carry over into the next job.
    fn run<R>(&mut self, mode: BatchMode, job: impl FnOnce(&mut Self) -> R) -> R {
        let result = catch_unwind(AssertUnwindSafe(|| job(self)));
        self.commit(mode);
        match result {
            Ok(value) => value,
            Err(panic) => resume_unwind(panic),
        }
    }

    pub(crate) fn dispatch_batch(&self, batch: Vec<Change<T>>) {
        let (added, modified, removed) = tally(&batch);
        tracing::debug!(
            mirror = %self.name,
            total = batch.len(),
            added,
            modified,
            removed,
            "all changes"
        );
        self.batches.dispatch(&batch);
    }

    fn register_listener(&mut self, name: String, callback: Box<ListenerFn<Event<T>>>) {
        let bootstrap: Vec<Event<T>> = self
            .elems
            .iter()
            .enumerate()
            .map(|(index, e)| Event {
                change: Change::add(e.clone()),
                index,
            })
            .collect();
        self.events.register_with(name, callback, bootstrap);
    }

    fn register_all_change_listener(
        &mut self,
        name: String,
        callback: Box<ListenerFn<Vec<Change<T>>>>,
    ) {
        let snapshot: Vec<Change<T>> = self.elems.iter().cloned().map(Change::add).collect();
        self.batches
            .register_with(name, callback, std::iter::once(snapshot));
    }

    fn clean(&mut self) {
        tracing::debug!(mirror = %self.name, "clean");
        self.events.clear();
        self.batches.clear();
        self.pending.clear();
        self.elems = Arc::new(Vec::new());
        *self.published.write() = Arc::clone(&self.elems);
    }

    fn splice_in(&mut self, index: usize, elem: T) -> Outcome<T> {
        tracing::debug!(mirror = %self.name, elem = ?elem, index, "add");
        Arc::make_mut(&mut self.elems).insert(index, elem.clone());
        self.pending.push(Event {
            change: Change::add(elem.clone()),
            index,
        });
        Outcome::Applied(Change::add(elem))
    }
}

// ============================================================================
// SortedMirror — public handle
// ============================================================================

pub struct SortedMirror<T: Element> {
    name: Arc<str>,
    cmp: Comparator<T>,
    published: Arc<RwLock<Arc<Vec<T>>>>,
    mailbox: Mailbox<MirrorState<T>>,
}

impl<T: Element> Clone for SortedMirror<T> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            cmp: Arc::clone(&self.cmp),
            published: Arc::clone(&self.published),
            mailbox: self.mailbox.clone(),
        }
    }
}

impl<T: Element> fmt::Debug for SortedMirror<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SortedMirror")
            .field("name", &self.name)
            .field("elems", &self.elems())
            .finish()
    }
}

impl<T: Element> SortedMirror<T> {
    /// Create an empty mirror ordered by `cmp`.
    ///
    /// # Panics
    /// Panics when called outside a Tokio runtime (the mirror task is spawned here).
    pub fn new(
        name: impl Into<String>,
        cmp: impl Fn(&T, &T) -> Ordering + Send + Sync + 'static,
    ) -> Self {
        let name: Arc<str> = Arc::from(name.into());
        let cmp: Comparator<T> = Arc::new(cmp);
        let published = Arc::new(RwLock::new(Arc::new(Vec::new())));
        let state = MirrorState::new(Arc::clone(&name), Arc::clone(&cmp), Arc::clone(&published));
        Self {
            mailbox: Mailbox::spawn(Arc::clone(&name), state),
            name,
            cmp,
            published,
        }
    }

    /// Create an empty mirror ordered by `T`'s natural order.
    pub fn natural(name: impl Into<String>) -> Self
    where
        T: Ord,
    {
        Self::new(name, |a: &T, b: &T| a.cmp(b))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn comparator(&self) -> &Comparator<T> {
        &self.cmp
    }

    // -----------------------------------------------------------------------
    // Reads — served from the published snapshot
    // -----------------------------------------------------------------------

    /// The current contents, in sorted order.
    pub fn elems(&self) -> Arc<Vec<T>> {
        Arc::clone(&self.published.read())
    }

    pub fn len(&self) -> usize {
        self.published.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<T> {
        self.published.read().get(index).cloned()
    }

    /// Binary-search `v` in the current contents.
    pub fn insertion_index_of(&self, v: &T) -> Position {
        position_of(self.elems().as_slice(), v, self.cmp.as_ref())
    }

    pub fn find(&self, pred: impl Fn(&T) -> bool) -> Option<T> {
        self.published.read().iter().find(|e| pred(e)).cloned()
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    pub async fn insert(&self, elem: T) -> Result<Outcome<T>> {
        self.mutate(Mutation::Insert(elem)).await
    }

    /// Insert with a position hint. The element is still placed at its
    /// sorted position; a mismatching hint is only logged.
    pub async fn insert_at(&self, index: usize, elem: T) -> Result<Outcome<T>> {
        self.mutate(Mutation::InsertAt(index, elem)).await
    }

    pub async fn remove(&self, elem: T) -> Result<Outcome<T>> {
        self.mutate(Mutation::Remove(elem)).await
    }

    pub async fn remove_at(&self, index: usize) -> Result<Outcome<T>> {
        self.mutate(Mutation::RemoveAt(index)).await
    }

    /// Replace `before` with `after` in place.
    ///
    /// Only valid when both compare equal. A sort-key change is ignored and
    /// must be expressed as `remove(before)` + `insert(after)`.
    pub async fn modify(&self, before: T, after: T) -> Result<Outcome<T>> {
        self.mutate(Mutation::Modify { before, after }).await
    }

    /// Apply `mutations` as one logical group: each applied change fires its
    /// per-event notification, then exactly one batch is delivered.
    pub async fn apply_batch(&self, mutations: Vec<Mutation<T>>) -> Result<Vec<Outcome<T>>> {
        self.transact(BatchMode::Always, move |state| {
            mutations.into_iter().map(|m| state.apply(m)).collect()
        })
        .await
    }

    /// Queue a mutation without waiting for it. Safe to call from inside a
    /// listener of this mirror: the mutation runs after the current dispatch.
    pub fn enqueue(&self, mutation: Mutation<T>) -> Result<()> {
        self.post_transact(BatchMode::None, move |state| {
            state.apply(mutation);
        })
    }

    /// Deliver `batch` to the batch listeners as-is, without mutating.
    pub async fn dispatch_batch(&self, batch: Vec<Change<T>>) -> Result<()> {
        self.mailbox
            .call(move |state| state.dispatch_batch(batch))
            .await
    }

    /// Resolve once every job queued before this call has run.
    pub async fn flush(&self) -> Result<()> {
        self.mailbox.call(|_| ()).await
    }

    /// Reset to empty and drop every listener on both channels. No events fire.
    pub async fn clean(&self) -> Result<()> {
        self.mailbox.call(MirrorState::clean).await
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    /// Register a per-event listener under `name`, replacing any listener
    /// with the same name. The current contents are replayed to it as ADD
    /// events before any later event.
    pub fn register_listener(
        &self,
        name: impl Into<String>,
        callback: impl Fn(&Event<T>) + Send + Sync + 'static,
    ) -> Result<()> {
        let name = name.into();
        let callback: Box<ListenerFn<Event<T>>> = Box::new(callback);
        self.mailbox
            .post(move |state| state.register_listener(name, callback))
    }

    pub fn remove_listener(&self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        self.mailbox.post(move |state| {
            state.events.remove(&name);
        })
    }

    /// Register a batch listener under `name`. The current contents are
    /// replayed to it as one batch of ADDs.
    pub fn register_all_change_listener(
        &self,
        name: impl Into<String>,
        callback: impl Fn(&[Change<T>]) + Send + Sync + 'static,
    ) -> Result<()> {
        let name = name.into();
        let callback: Box<ListenerFn<Vec<Change<T>>>> =
            Box::new(move |batch: &Vec<Change<T>>| callback(batch));
        self.mailbox
            .post(move |state| state.register_all_change_listener(name, callback))
    }

    pub fn remove_all_change_listener(&self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        self.mailbox.post(move |state| {
            state.batches.remove(&name);
        })
    }

    // -----------------------------------------------------------------------
    // Crate-internal job entry points
    // -----------------------------------------------------------------------

    /// Run `job` on the mirror task, then commit with `mode`.
    pub(crate) async fn transact<R, F>(&self, mode: BatchMode, job: F) -> Result<R>
    where
        F: FnOnce(&mut MirrorState<T>) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.mailbox
            .call(move |state| state.run(mode, job))
            .await
    }

    /// Fire-and-forget variant of [`transact`](Self::transact).
    pub(crate) fn post_transact<F>(&self, mode: BatchMode, job: F) -> Result<()>
    where
        F: FnOnce(&mut MirrorState<T>) + Send + 'static,
    {
        self.mailbox.post(move |state| state.run(mode, job))
    }

    async fn mutate(&self, mutation: Mutation<T>) -> Result<Outcome<T>> {
        self.transact(BatchMode::None, move |state| state.apply(mutation))
            .await
    }
}
