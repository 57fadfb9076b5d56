//! Reactive Primitives
//!
//! This module implements the core reactive system: observable values, the
//! dependency tracker, and side effects. These primitives form the foundation
//! of Trellis's implicit dependency discovery.
//!
//! # Concepts
//!
//! ## Observables
//!
//! An ObservableValue is a container for mutable state. When its value is read
//! inside a tracking scope (such as a side effect body), the read is recorded
//! automatically. When the value changes, every registered listener is
//! notified.
//!
//! ## Side Effects
//!
//! A SideEffect is a computation that re-runs whenever one of the observables
//! it read last time changes. Dependencies are discovered fresh on every run,
//! so a body that branches is only ever subscribed to the observables its
//! current branch touches. Side effects are used to synchronize reactive state
//! with external systems, such as updating a widget or logging.
//!
//! ## Composites and Factories
//!
//! A CompositeSideEffect groups side effects so one pause, resume, or dispose
//! reaches all of them. A SideEffectFactory creates side effects and routes
//! each one into a sink, typically a composite that owns the batch.
//!
//! # Implementation Notes
//!
//! The reactive system uses a thread-local stack of tracking frames to detect
//! dependencies. When an observable is read, we check if there is an active
//! frame and, if so, record the read in the innermost one. Re-runs are
//! deferred: a dependency change marks the effect dirty and posts one wake-up
//! to the effect's realm, and further changes before the wake-up coalesce
//! into that single run.
//!
//! This approach (sometimes called "automatic dependency tracking" or
//! "transparent reactivity") is used by SolidJS, Vue 3, and Leptos.

mod observable;
mod context;
mod side_effect;
mod composite;
mod factory;

pub use observable::{
    ChangeListener, DynObservable, ListenerKey, Observable, ObservableId, ObservableValue,
    Subscription,
};
pub use context::{is_tracking, run_and_monitor, track_read, untracked, TrackingScope};
pub use side_effect::{DisposeKey, ReactiveError, SideEffect};
pub use composite::CompositeSideEffect;
pub use factory::SideEffectFactory;
