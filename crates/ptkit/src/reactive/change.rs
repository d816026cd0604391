//! Change — a single ADD / REMOVE / MODIFY applied to a mirror.
//!
//! Per-event listeners receive an [`Event`] (the change plus the index it took
//! effect at); batch listeners receive a `Vec<Change<T>>`.

/// The kind of mutation a [`Change`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Add,
    Remove,
    Modify,
}

/// One mutation of a mirror.
///
/// `Add` has no `before`, `Remove` has no `after`. `Modify` normally has
/// both; a single-document mirror may report either side as absent.
#[derive(Debug, Clone, PartialEq)]
pub struct Change<T> {
    pub kind: ChangeKind,
    pub before: Option<T>,
    pub after: Option<T>,
}

impl<T> Change<T> {
    pub fn add(after: T) -> Self {
        Self {
            kind: ChangeKind::Add,
            before: None,
            after: Some(after),
        }
    }

    pub fn remove(before: T) -> Self {
        Self {
            kind: ChangeKind::Remove,
            before: Some(before),
            after: None,
        }
    }

    pub fn modify(before: T, after: T) -> Self {
        Self {
            kind: ChangeKind::Modify,
            before: Some(before),
            after: Some(after),
        }
    }

    /// The element this change is about: `after` when present, else `before`.
    pub fn subject(&self) -> Option<&T> {
        self.after.as_ref().or(self.before.as_ref())
    }
}

/// A [`Change`] together with the index at which it took effect in the
/// mirror that emitted it.
///
/// For `Add` this is the insertion index, for `Remove` the index the element
/// occupied before removal, for `Modify` the (unchanged) index of the element.
#[derive(Debug, Clone, PartialEq)]
pub struct Event<T> {
    pub change: Change<T>,
    pub index: usize,
}

/// Count of each change kind in a batch, used for batch logging.
pub(crate) fn tally<T>(changes: &[Change<T>]) -> (usize, usize, usize) {
    changes.iter().fold((0, 0, 0), |(a, m, r), c| match c.kind {
        ChangeKind::Add => (a + 1, m, r),
        ChangeKind::Modify => (a, m + 1, r),
        ChangeKind::Remove => (a, m, r + 1),
    })
}
