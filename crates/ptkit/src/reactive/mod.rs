//! Reactive layer — sorted observable mirrors and views derived from them.
//!
//! # Overview
//!
//! [`SortedMirror`] keeps a strictly increasing, deduplicated sequence under a
//! caller-supplied comparator and notifies per-event and batch listeners of
//! every change. [`FilteredView`] subscribes to a mirror and maintains the
//! predicate- and limit-constrained subset of it as a mirror of its own.
//!
//! # Modules
//!
//! - [`change`] — [`Change`], [`ChangeKind`] and [`Event`].
//! - [`event_bus`] — name-keyed listener registry ([`EventBus<E>`]).
//! - [`sorted_mirror`] — [`SortedMirror<T>`], [`Position`], [`Outcome`].
//! - [`filtered_view`] — [`FilteredView<T>`] and its builder.

pub mod change;
pub mod event_bus;
pub mod filtered_view;
pub mod sorted_mirror;

pub use change::{Change, ChangeKind, Event};
pub use event_bus::{EventBus, ListenerFn};
pub use filtered_view::{FilteredView, FilteredViewBuilder, Predicate, RemovalPolicy};
pub use sorted_mirror::{
    position_of, Comparator, Element, Mutation, Outcome, Position, SortedMirror,
};
