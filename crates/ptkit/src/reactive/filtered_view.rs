//! FilteredView<T> — a derived mirror holding the predicate- and
//! limit-constrained subset of a source mirror.
//!
//! The view owns its own [`SortedMirror`] and subscribes once, at build time,
//! to the source's per-event channel. Every source event is forwarded to the
//! view's task and classified there, strictly in arrival order:
//!
//! | event              | downstream                                              |
//! |--------------------|---------------------------------------------------------|
//! | ADD(e)             | ADD(e) if `pred(e)` and the view has room               |
//! | REMOVE(e)          | REMOVE(e) if `pred(e)` and e is surfaced in the view     |
//! | MODIFY(b, a)       | by `(pred(b), pred(a))`, see below                       |
//!
//! MODIFY: `(true, false)` removes `b` and `(true, true)` modifies, both only
//! when `b` is surfaced; `(false, true)` adds `a` if the view has room;
//! `(false, false)` does nothing. "Surfaced" means `b` sits inside the limit
//! window of the view itself: an element the view never showed produces no
//! downstream removal or modification.
//!
//! Classified changes are applied to the view's own state and reported to
//! the view's batch listeners as one batch per source event.
//!
//! Because the view is itself a `SortedMirror`, views chain: another view can
//! use [`FilteredView::view`] as its source.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::{
    error::{PtkitError, Rejection, Result},
    reactive::{
        change::{Change, ChangeKind, Event},
        sorted_mirror::{
            position_of, BatchMode, Comparator, Element, MirrorState, Mutation, Outcome,
            Position, SortedMirror,
        },
    },
};

/// Membership test for a [`FilteredView`].
pub type Predicate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Where a removal requested on a [`FilteredView`] is applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RemovalPolicy {
    /// Remove from the view's own state only; the source keeps the element.
    Local,
    /// Forward the removal to the source; the view follows through the
    /// normal event path.
    #[default]
    Delegate,
}

struct FilterSpec<T> {
    predicate: Predicate<T>,
    limit: usize,
}

impl<T> FilterSpec<T> {
    fn within(&self, index: usize) -> bool {
        self.limit == 0 || index < self.limit
    }

    fn has_room(&self, len: usize) -> bool {
        self.within(len)
    }
}

// ============================================================================
// Builder
// ============================================================================

pub struct FilteredViewBuilder<T: Element> {
    name: String,
    limit: Option<usize>,
    predicate: Option<Predicate<T>>,
    source: Option<SortedMirror<T>>,
    contents: Option<(Vec<T>, Comparator<T>)>,
    removal: Option<RemovalPolicy>,
}

impl<T: Element> FilteredViewBuilder<T> {
    /// Derive the view from a live source mirror.
    pub fn source(mut self, source: &SortedMirror<T>) -> Self {
        self.source = Some(source.clone());
        self
    }

    /// Derive the view from a fixed list, ordered by `cmp`.
    pub fn contents(
        mut self,
        items: Vec<T>,
        cmp: impl Fn(&T, &T) -> std::cmp::Ordering + Send + Sync + 'static,
    ) -> Self {
        self.contents = Some((items, Arc::new(cmp)));
        self
    }

    pub fn predicate(mut self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Maximum view size; `0` means unbounded.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn removal(mut self, policy: RemovalPolicy) -> Self {
        self.removal = Some(policy);
        self
    }

    /// Build the view and subscribe it to its source.
    ///
    /// # Errors
    /// - [`PtkitError::ConflictingConfiguration`] when both a source and
    ///   static contents were given.
    /// - [`PtkitError::MissingSource`] when neither was given.
    pub fn build(self) -> Result<FilteredView<T>> {
        let source = match (self.source, self.contents) {
            (Some(_), Some(_)) => {
                return Err(PtkitError::ConflictingConfiguration(format!(
                    "view \"{}\" cannot have both a source mirror and static contents",
                    self.name
                )))
            }
            (None, None) => return Err(PtkitError::MissingSource(self.name)),
            (Some(source), None) => source,
            (None, Some((items, cmp))) => {
                let source = SortedMirror::new(
                    format!("{}/contents", self.name),
                    move |a: &T, b: &T| cmp(a, b),
                );
                for item in items {
                    source.enqueue(Mutation::Insert(item))?;
                }
                source
            }
        };

        let accept_all: Predicate<T> = Arc::new(|_: &T| true);
        let spec = Arc::new(RwLock::new(FilterSpec {
            predicate: self.predicate.unwrap_or(accept_all),
            limit: self.limit.unwrap_or(0),
        }));

        let cmp = Arc::clone(source.comparator());
        let view = SortedMirror::new(format!("FilteredView/{}", self.name), move |a: &T, b: &T| {
            cmp(a, b)
        });
        let listener = format!("filter:{}", self.name);

        {
            let view = view.clone();
            let spec = Arc::clone(&spec);
            source.register_listener(listener.clone(), move |event: &Event<T>| {
                let spec = Arc::clone(&spec);
                let event = event.clone();
                if let Err(e) = view.post_transact(BatchMode::IfNonEmpty, move |state| {
                    classify(state, &spec.read(), event)
                }) {
                    tracing::warn!(error = %e, "filtered view dropped a source event");
                }
            })?;
        }

        tracing::debug!(view = %self.name, source = %source.name(), "filtered view attached");

        Ok(FilteredView {
            name: self.name,
            source,
            view,
            spec,
            removal: self.removal.unwrap_or_default(),
            listener,
        })
    }
}

// ============================================================================
// FilteredView
// ============================================================================

pub struct FilteredView<T: Element> {
    name: String,
    source: SortedMirror<T>,
    view: SortedMirror<T>,
    spec: Arc<RwLock<FilterSpec<T>>>,
    removal: RemovalPolicy,
    listener: String,
}

impl<T: Element> FilteredView<T> {
    pub fn builder(name: impl Into<String>) -> FilteredViewBuilder<T> {
        FilteredViewBuilder {
            name: name.into(),
            limit: None,
            predicate: None,
            source: None,
            contents: None,
            removal: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The view's own mirror; subscribe to it, or chain another view off it.
    pub fn view(&self) -> &SortedMirror<T> {
        &self.view
    }

    pub fn source(&self) -> &SortedMirror<T> {
        &self.source
    }

    pub fn elems(&self) -> Arc<Vec<T>> {
        self.view.elems()
    }

    pub fn len(&self) -> usize {
        self.view.len()
    }

    pub fn is_empty(&self) -> bool {
        self.view.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.spec.read().limit
    }

    pub fn removal_policy(&self) -> RemovalPolicy {
        self.removal
    }

    pub fn register_listener(
        &self,
        name: impl Into<String>,
        callback: impl Fn(&Event<T>) + Send + Sync + 'static,
    ) -> Result<()> {
        self.view.register_listener(name, callback)
    }

    pub fn register_all_change_listener(
        &self,
        name: impl Into<String>,
        callback: impl Fn(&[Change<T>]) + Send + Sync + 'static,
    ) -> Result<()> {
        self.view.register_all_change_listener(name, callback)
    }

    /// Replace the predicate and resync against the source.
    ///
    /// This is a full rescan: every view element outside the new target set
    /// is removed, then every element of the target set not yet present is
    /// added. The target set is the first `limit` (or all) source elements
    /// satisfying the predicate, in source order. The resulting changes are
    /// delivered as one batch and returned.
    pub async fn change_filter(
        &self,
        predicate: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> Result<Vec<Change<T>>> {
        tracing::info!(view = %self.name, "changing filter");
        let predicate: Predicate<T> = Arc::new(predicate);
        let spec = Arc::clone(&self.spec);
        let source = self.source.clone();

        self.view
            .transact(BatchMode::IfNonEmpty, move |state| {
                let limit = {
                    let mut spec = spec.write();
                    spec.predicate = Arc::clone(&predicate);
                    spec.limit
                };
                resync(state, &source.elems(), predicate.as_ref(), limit)
            })
            .await
    }

    /// Remove `elem` according to the view's [`RemovalPolicy`].
    pub async fn remove(&self, elem: T) -> Result<Outcome<T>> {
        match self.removal {
            RemovalPolicy::Local => {
                self.view
                    .transact(BatchMode::IfNonEmpty, move |state| state.remove(&elem))
                    .await
            }
            RemovalPolicy::Delegate => self.source.remove(elem).await,
        }
    }

    pub async fn remove_at(&self, index: usize) -> Result<Outcome<T>> {
        match self.view.get(index) {
            Some(elem) => self.remove(elem).await,
            None => Ok(Outcome::Ignored(Rejection::IndexOutOfRange {
                index,
                len: self.view.len(),
            })),
        }
    }

    /// Wait until every source event dispatched so far has been classified.
    pub async fn flush(&self) -> Result<()> {
        self.source.flush().await?;
        self.view.flush().await
    }

    /// Detach from the source, then empty the view and drop its listeners.
    pub async fn clean(&self) -> Result<()> {
        self.source.remove_listener(self.listener.clone())?;
        self.view.clean().await
    }
}

impl<T: Element> Drop for FilteredView<T> {
    fn drop(&mut self) {
        let _ = self.source.remove_listener(self.listener.clone());
    }
}

impl<T: Element> fmt::Debug for FilteredView<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilteredView")
            .field("name", &self.name)
            .field("limit", &self.limit())
            .field("removal", &self.removal)
            .field("elems", &self.elems())
            .finish()
    }
}

// ============================================================================
// Classification
// ============================================================================

fn classify<T: Element>(state: &mut MirrorState<T>, spec: &FilterSpec<T>, event: Event<T>) {
    let change = event.change;
    let pred = spec.predicate.as_ref();

    match change.kind {
        ChangeKind::Add => {
            let Some(elem) = change.after else { return };
            if pred(&elem) && spec.has_room(state.elems().len()) {
                state.add(elem);
            }
        }
        ChangeKind::Remove => {
            let Some(elem) = change.before else { return };
            if pred(&elem) && surfaced(state, spec, &elem) {
                state.remove(&elem);
            }
        }
        ChangeKind::Modify => {
            let (Some(before), Some(after)) = (change.before, change.after) else {
                return;
            };
            match (pred(&before), pred(&after)) {
                (true, false) if surfaced(state, spec, &before) => {
                    state.remove(&before);
                }
                (false, true) if spec.has_room(state.elems().len()) => {
                    state.add(after);
                }
                (true, true) if surfaced(state, spec, &before) => {
                    state.modify(before, after);
                }
                _ => {}
            }
        }
    }
}

/// Whether `elem` is currently shown by the view, inside its limit window.
fn surfaced<T: Element>(state: &MirrorState<T>, spec: &FilterSpec<T>, elem: &T) -> bool {
    match state.position_of(elem) {
        Position::Found(i) => spec.within(i),
        Position::InsertAt(_) => false,
    }
}

fn resync<T: Element>(
    state: &mut MirrorState<T>,
    source: &[T],
    predicate: &(dyn Fn(&T) -> bool + Send + Sync),
    limit: usize,
) -> Vec<Change<T>> {
    let take = if limit == 0 { usize::MAX } else { limit };
    let target: Vec<T> = source
        .iter()
        .filter(|e| predicate(e))
        .take(take)
        .cloned()
        .collect();

    let stale: Vec<T> = state
        .elems()
        .iter()
        .filter(|e| !position_of(&target, *e, &|a, b| state.compare(a, b)).is_found())
        .cloned()
        .collect();

    let mut changes = Vec::new();
    for elem in &stale {
        if let Outcome::Applied(change) = state.remove(elem) {
            changes.push(change);
        }
    }
    for elem in target {
        if !state.position_of(&elem).is_found() {
            if let Outcome::Applied(change) = state.add(elem) {
                changes.push(change);
            }
        }
    }
    changes
}
