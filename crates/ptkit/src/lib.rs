//! Sorted, deduplicated observable mirrors of a remote record store.
//!
//! - [`reactive`] — [`SortedMirror`](reactive::SortedMirror), its event
//!   channels and [`FilteredView`](reactive::FilteredView)s derived from it.
//! - [`remote`] — adapters feeding mirrors from a store's change feed.
//! - [`error`] — error taxonomy.

pub mod error;
mod mailbox;
pub mod reactive;
pub mod remote;
