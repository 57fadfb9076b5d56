//! Observable Values
//!
//! An observable is the fundamental reactive input. It holds state, reports
//! a process-unique identity, and notifies registered listeners after every
//! change.
//!
//! # How Observables Work
//!
//! 1. When an observable is read inside a tracking scope, the read is
//!    reported to the tracker and the scope records the observable as a
//!    dependency of the computation it wraps.
//!
//! 2. When an observable's value changes, all change listeners run
//!    synchronously, after the new value is in place.
//!
//! 3. Listener registration hands back a [`ListenerKey`]; wrapping the key
//!    in a [`Subscription`] detaches the listener automatically on drop.
//!
//! # Threading
//!
//! Observables belong to the thread that created them. State lives in
//! `Rc`/`RefCell`, so handles are `!Send`; cross-thread hand-off goes
//! through an execution realm instead of a lock.

use std::cell::RefCell;
use std::fmt::Debug;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use smallvec::SmallVec;

use super::context;

/// Counter for generating unique observable IDs.
static OBSERVABLE_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Counter for generating unique listener keys.
static LISTENER_KEY_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Identity of an observable, stable for the life of the process.
///
/// Ids are allocated from a global counter, so they are unique across
/// threads and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObservableId(u64);

impl ObservableId {
    /// Allocate a fresh id.
    pub fn new() -> Self {
        Self(OBSERVABLE_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw counter value, mainly for log events.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Key identifying one registered change listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerKey(u64);

impl ListenerKey {
    /// Allocate a fresh key. Implementors of [`Observable`] call this when
    /// registering a listener.
    pub fn new() -> Self {
        Self(LISTENER_KEY_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// A change listener, shared so notification can run without holding the
/// listener table borrowed.
pub type ChangeListener = Rc<dyn Fn()>;

/// A shared handle to any observable.
pub type DynObservable = Rc<dyn Observable>;

/// The contract every reactive input implements.
///
/// Custom containers only need identity plus keyed listener registration;
/// dependency tracking is layered on top by reporting reads through
/// [`context::track_read`](super::track_read).
pub trait Observable {
    /// Process-unique identity of this observable.
    fn observable_id(&self) -> ObservableId;

    /// Register a listener to run after every change. Returns the key that
    /// removes it again.
    fn add_change_listener(&self, listener: ChangeListener) -> ListenerKey;

    /// Remove a previously registered listener. Unknown keys are ignored.
    fn remove_change_listener(&self, key: ListenerKey);
}

/// RAII guard tying a registered listener to a scope.
///
/// Dropping the subscription removes the listener from its observable.
/// Notification snapshots the listener table first, so a listener removed
/// mid-notification still sees the cycle that was already underway.
pub struct Subscription {
    target: DynObservable,
    key: ListenerKey,
}

impl Subscription {
    pub fn new(target: DynObservable, key: ListenerKey) -> Self {
        Self { target, key }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.target.remove_change_listener(self.key);
    }
}

impl Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("observable", &self.target.observable_id())
            .field("key", &self.key)
            .finish()
    }
}

/// Shared state behind an [`ObservableValue`].
struct ValueInner<T> {
    id: ObservableId,
    value: RefCell<T>,
    listeners: RefCell<SmallVec<[(ListenerKey, ChangeListener); 2]>>,
}

impl<T: 'static> Observable for ValueInner<T> {
    fn observable_id(&self) -> ObservableId {
        self.id
    }

    fn add_change_listener(&self, listener: ChangeListener) -> ListenerKey {
        let key = ListenerKey::new();
        self.listeners.borrow_mut().push((key, listener));
        key
    }

    fn remove_change_listener(&self, key: ListenerKey) {
        self.listeners.borrow_mut().retain(|(k, _)| *k != key);
    }
}

/// A reactive container holding a value of type `T`.
///
/// # Example
///
/// ```rust,ignore
/// let count = ObservableValue::new(0);
///
/// // Read the value (tracked when inside a tracking scope)
/// let value = count.get();
///
/// // Update the value (notifies listeners)
/// count.set(5);
/// ```
pub struct ObservableValue<T: 'static> {
    inner: Rc<ValueInner<T>>,
}

impl<T: 'static> ObservableValue<T> {
    /// Create a new observable with the given initial value.
    pub fn new(value: T) -> Self {
        Self {
            inner: Rc::new(ValueInner {
                id: ObservableId::new(),
                value: RefCell::new(value),
                listeners: RefCell::new(SmallVec::new()),
            }),
        }
    }

    /// This observable's identity.
    pub fn id(&self) -> ObservableId {
        self.inner.id
    }

    /// Get the current value.
    ///
    /// Inside a tracking scope this also records the observable as a
    /// dependency of the current computation.
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        if context::is_tracking() {
            context::track_read(&self.as_observable());
        }
        self.inner.value.borrow().clone()
    }

    /// Get the current value without recording a dependency.
    pub fn get_untracked(&self) -> T
    where
        T: Clone,
    {
        self.inner.value.borrow().clone()
    }

    /// Run `f` against a borrow of the current value. Tracked like [`get`],
    /// but avoids the clone, which also makes non-`Clone` values usable.
    ///
    /// [`get`]: ObservableValue::get
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        if context::is_tracking() {
            context::track_read(&self.as_observable());
        }
        f(&self.inner.value.borrow())
    }

    /// Replace the value and notify listeners.
    pub fn set(&self, value: T) {
        *self.inner.value.borrow_mut() = value;
        self.notify_listeners();
    }

    /// Mutate the value in place, then notify listeners.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        f(&mut *self.inner.value.borrow_mut());
        self.notify_listeners();
    }

    /// Register a plain change listener. The listener stays attached until
    /// the returned [`Subscription`] is dropped.
    pub fn subscribe(&self, listener: impl Fn() + 'static) -> Subscription {
        let key = self.inner.add_change_listener(Rc::new(listener));
        Subscription::new(self.as_observable(), key)
    }

    /// This value as a type-erased observable handle.
    pub fn as_observable(&self) -> DynObservable {
        Rc::clone(&self.inner) as DynObservable
    }

    /// Number of attached change listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.borrow().len()
    }

    /// Notify all listeners that the value has changed.
    ///
    /// The table is snapshotted first: listeners may attach or detach other
    /// listeners while the notification runs.
    fn notify_listeners(&self) {
        let snapshot: SmallVec<[ChangeListener; 2]> = self
            .inner
            .listeners
            .borrow()
            .iter()
            .map(|(_, listener)| Rc::clone(listener))
            .collect();
        for listener in snapshot {
            listener();
        }
    }
}

impl<T: 'static> Clone for ObservableValue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: Debug + 'static> Debug for ObservableValue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservableValue")
            .field("id", &self.inner.id)
            .field("value", &self.inner.value.borrow())
            .field("listener_count", &self.listener_count())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn value_get_and_set() {
        let value = ObservableValue::new(0);
        assert_eq!(value.get(), 0);

        value.set(42);
        assert_eq!(value.get(), 42);
    }

    #[test]
    fn value_update_in_place() {
        let value = ObservableValue::new(10);
        value.update(|v| *v += 5);
        assert_eq!(value.get(), 15);
    }

    #[test]
    fn value_notifies_listeners() {
        let value = ObservableValue::new(0);
        let calls = Rc::new(Cell::new(0));

        let calls_in_listener = Rc::clone(&calls);
        let _subscription = value.subscribe(move || {
            calls_in_listener.set(calls_in_listener.get() + 1);
        });

        assert_eq!(calls.get(), 0);

        value.set(1);
        assert_eq!(calls.get(), 1);

        value.set(2);
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn dropping_subscription_detaches_listener() {
        let value = ObservableValue::new(0);
        let calls = Rc::new(Cell::new(0));

        let calls_in_listener = Rc::clone(&calls);
        let subscription = value.subscribe(move || {
            calls_in_listener.set(calls_in_listener.get() + 1);
        });
        assert_eq!(value.listener_count(), 1);

        value.set(1);
        assert_eq!(calls.get(), 1);

        drop(subscription);
        assert_eq!(value.listener_count(), 0);

        value.set(2);
        // Should not have been called again
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn remove_unknown_listener_is_ignored() {
        let value = ObservableValue::new(0);
        let _subscription = value.subscribe(|| {});

        value.as_observable().remove_change_listener(ListenerKey::new());
        assert_eq!(value.listener_count(), 1);
    }

    #[test]
    fn with_borrows_without_clone() {
        struct Opaque(i32);

        let value = ObservableValue::new(Opaque(7));
        let seen = value.with(|v| v.0);
        assert_eq!(seen, 7);
    }

    #[test]
    fn clone_shares_state() {
        let value1 = ObservableValue::new(0);
        let value2 = value1.clone();

        value1.set(42);
        assert_eq!(value2.get(), 42);

        value2.set(100);
        assert_eq!(value1.get(), 100);
        assert_eq!(value1.id(), value2.id());
    }

    #[test]
    fn ids_are_unique() {
        let v1 = ObservableValue::new(0);
        let v2 = ObservableValue::new(0);
        let v3 = ObservableValue::new(0);

        assert_ne!(v1.id(), v2.id());
        assert_ne!(v2.id(), v3.id());
        assert_ne!(v1.id(), v3.id());
    }
}
