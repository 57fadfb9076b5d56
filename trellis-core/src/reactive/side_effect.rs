//! Side Effects
//!
//! A side effect is a computation that re-runs whenever something it read
//! changes. Dependencies are never declared: each run executes the body
//! inside a tracking scope and subscribes to exactly the observables that
//! run touched.
//!
//! # How Side Effects Work
//!
//! 1. The body runs once to discover its initial dependencies
//!    (synchronously for [`SideEffect::create`], deferred for the async
//!    forms).
//!
//! 2. A dependency change marks the effect dirty. The first change after a
//!    completed run posts one wake-up task to the effect's realm; further
//!    changes before that task runs are absorbed by the dirty flag.
//!
//! 3. The deferred run executes the body in a fresh tracking scope and
//!    re-subscribes: stale observables are released, new ones attached,
//!    unchanged ones kept. A branch that stops reading an observable
//!    therefore stops reacting to it.
//!
//! # Lifecycle
//!
//! Pause and resume nest: while the pause depth is positive, changes only
//! accumulate in the dirty flag, and the resume that returns the depth to
//! zero schedules (or, for [`SideEffect::resume_and_run_if_dirty`], runs)
//! a pending dirty body. Disposal is terminal and idempotent: it detaches
//! every subscription, drops the body, and notifies dispose listeners in
//! registration order.
//!
//! # Liveness
//!
//! `SideEffect` is a cheap handle, and dropping it does not dispose the
//! effect. Undisposed effects are pinned by a thread-local registry so
//! fire-and-forget creation keeps reacting; observables only ever hold weak
//! references back to effects, so pinning is the single strong anchor and
//! `dispose` releases everything.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;
use smallvec::SmallVec;
use thiserror::Error;

use crate::exec::{self, Realm};
use super::context::{self, TrackingScope};
use super::observable::{ChangeListener, DynObservable, ObservableId, Subscription};

/// Counter for generating unique side-effect IDs.
static EFFECT_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a new unique side-effect ID.
pub(crate) fn next_effect_id() -> u64 {
    EFFECT_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Counter for generating dispose-listener keys.
static DISPOSE_KEY_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Key identifying one registered dispose listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DisposeKey(u64);

impl DisposeKey {
    pub(crate) fn new() -> Self {
        Self(DISPOSE_KEY_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Errors reported for reactive lifecycle misuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReactiveError {
    /// `resume` was called on a side effect that is not paused.
    #[error("side effect resumed more times than it was paused")]
    UnbalancedResume,
}

type Body = Box<dyn FnMut()>;
type DisposeListener = Box<dyn FnOnce(&SideEffect)>;

thread_local! {
    /// Undisposed side effects, pinned so dependency changes keep reaching
    /// them after the creator drops its handle.
    static LIVE_EFFECTS: RefCell<HashMap<u64, Rc<EffectCore>>> =
        RefCell::new(HashMap::new());

    /// The shared handle returned for bodies that finish with no reads.
    static NOOP_EFFECT: SideEffect = SideEffect::new_noop();
}

/// Shared state of one side effect.
struct EffectCore {
    id: u64,
    realm: Rc<dyn Realm>,
    body: RefCell<Body>,
    /// Live subscriptions, keyed by observable identity.
    dependencies: RefCell<IndexMap<ObservableId, Subscription>>,
    /// Number of unmatched `pause` calls.
    pause_depth: Cell<u32>,
    /// A dependency changed since the last run started.
    dirty: Cell<bool>,
    /// The body is currently on the stack.
    running: Cell<bool>,
    /// A wake-up task is queued on the realm.
    scheduled: Cell<bool>,
    disposed: Cell<bool>,
    dispose_listeners: RefCell<SmallVec<[(DisposeKey, DisposeListener); 1]>>,
}

/// Handle to a side effect.
///
/// Clones share the same effect. Dropping every handle does *not* dispose
/// it; call [`dispose`](SideEffect::dispose) (directly, through a
/// composite, or via the one-shot form) to end its lifecycle.
///
/// # Example
///
/// ```rust,ignore
/// let name = ObservableValue::new("world".to_string());
///
/// let effect = SideEffect::create(move || {
///     println!("hello, {}", name.get());
/// });
///
/// name.set("trellis".to_string()); // re-runs on the next realm turn
/// effect.dispose();
/// ```
#[derive(Clone)]
pub struct SideEffect {
    core: Rc<EffectCore>,
}

impl SideEffect {
    /// Create a side effect and run it once, synchronously, to discover its
    /// initial dependencies. Re-runs are deferred to the effect's realm.
    ///
    /// When the first run reads nothing, nothing can ever re-trigger the
    /// body. The effect is released immediately and the shared no-op handle
    /// is returned, so callers must not rely on handle identity being
    /// unique.
    pub fn create(body: impl FnMut() + 'static) -> SideEffect {
        let effect = Self::create_paused(body);
        effect.activate_sync();
        if effect.core.dependencies.borrow().is_empty() {
            effect.dispose();
            return Self::noop();
        }
        effect
    }

    /// Create a side effect in the paused state, with the dirty flag set.
    /// The first run happens when `resume` (deferred) or
    /// `resume_and_run_if_dirty` (synchronous) releases it.
    pub fn create_paused(body: impl FnMut() + 'static) -> SideEffect {
        Self::create_paused_in(exec::current_realm(), body)
    }

    /// [`create_paused`](SideEffect::create_paused) with an explicit realm
    /// instead of the ambient one.
    pub fn create_paused_in(realm: Rc<dyn Realm>, body: impl FnMut() + 'static) -> SideEffect {
        let core = Rc::new(EffectCore {
            id: next_effect_id(),
            realm,
            body: RefCell::new(Box::new(body)),
            dependencies: RefCell::new(IndexMap::new()),
            pause_depth: Cell::new(1),
            dirty: Cell::new(true),
            running: Cell::new(false),
            scheduled: Cell::new(false),
            disposed: Cell::new(false),
            dispose_listeners: RefCell::new(SmallVec::new()),
        });
        LIVE_EFFECTS.with(|live| {
            live.borrow_mut().insert(core.id, Rc::clone(&core));
        });
        tracing::debug!(effect = core.id, "side effect created (paused)");
        SideEffect { core }
    }

    /// Run `supplier` tracked and pass its value to `consumer` untracked.
    ///
    /// Only what the supplier reads becomes a dependency; the consumer can
    /// freely read observables without subscribing to them. Runs once
    /// synchronously, like [`create`](SideEffect::create).
    pub fn consume<T: 'static>(
        supplier: impl FnMut() -> T + 'static,
        consumer: impl FnMut(T) + 'static,
    ) -> SideEffect {
        Self::create(consume_body(supplier, consumer))
    }

    /// [`consume`](SideEffect::consume), but with the first run deferred to
    /// the realm like every later one.
    pub fn consume_async<T: 'static>(
        supplier: impl FnMut() -> T + 'static,
        consumer: impl FnMut(T) + 'static,
    ) -> SideEffect {
        let effect = Self::create_paused(consume_body(supplier, consumer));
        effect.activate_deferred();
        effect
    }

    /// One-shot form: each run polls `supplier` (tracked) and the first
    /// non-`None` value is handed to `consumer` (untracked), after which
    /// the effect disposes itself.
    ///
    /// The first attempt is always deferred, so the returned handle exists
    /// before the body can possibly run; disposing it early cancels the
    /// wait and the consumer never runs.
    pub fn consume_once_async<T: 'static>(
        mut supplier: impl FnMut() -> Option<T> + 'static,
        consumer: impl FnOnce(T) + 'static,
    ) -> SideEffect {
        let own: Rc<RefCell<Option<SideEffect>>> = Rc::new(RefCell::new(None));
        let body = {
            let own = Rc::clone(&own);
            let mut consumer = Some(consumer);
            move || {
                let value = match supplier() {
                    Some(value) => value,
                    None => return,
                };
                if let Some(consumer) = consumer.take() {
                    context::untracked(|| consumer(value));
                }
                let handle = own.borrow_mut().take();
                if let Some(handle) = handle {
                    handle.dispose();
                }
            }
        };
        let effect = Self::create_paused(body);
        *own.borrow_mut() = Some(effect.clone());
        effect.activate_deferred();
        effect
    }

    /// The shared do-nothing handle: reports disposed, never runs, never
    /// notifies. Every lifecycle call on it is legal and inert.
    pub fn noop() -> SideEffect {
        NOOP_EFFECT.with(SideEffect::clone)
    }

    fn new_noop() -> SideEffect {
        SideEffect {
            core: Rc::new(EffectCore {
                id: next_effect_id(),
                realm: exec::current_realm(),
                body: RefCell::new(Box::new(|| {})),
                dependencies: RefCell::new(IndexMap::new()),
                pause_depth: Cell::new(0),
                dirty: Cell::new(false),
                running: Cell::new(false),
                scheduled: Cell::new(false),
                disposed: Cell::new(true),
                dispose_listeners: RefCell::new(SmallVec::new()),
            }),
        }
    }

    /// Release a freshly created effect and run a pending body in place.
    fn activate_sync(&self) {
        self.core.pause_depth.set(0);
        self.run_if_dirty();
    }

    /// Release a freshly created effect; a pending body goes to the realm.
    fn activate_deferred(&self) {
        self.core.pause_depth.set(0);
        if self.core.dirty.get() {
            EffectCore::schedule(&self.core);
        }
    }

    /// Process-unique id, also used in log events.
    pub fn id(&self) -> u64 {
        self.core.id
    }

    /// Same underlying effect? Handles compare by identity.
    pub fn ptr_eq(&self, other: &SideEffect) -> bool {
        Rc::ptr_eq(&self.core, &other.core)
    }

    pub fn is_disposed(&self) -> bool {
        self.core.disposed.get()
    }

    /// True when a dependency changed since the last run started.
    pub fn is_dirty(&self) -> bool {
        self.core.dirty.get()
    }

    /// Number of observables the last run subscribed to.
    pub fn dependency_count(&self) -> usize {
        self.core.dependencies.borrow().len()
    }

    /// Suspend re-runs. Pauses nest; while paused, dependency changes only
    /// mark the effect dirty and subscriptions stay attached, so pausing is
    /// cheap and resume needs no re-discovery.
    pub fn pause(&self) {
        if self.core.disposed.get() {
            return;
        }
        let depth = self.core.pause_depth.get();
        self.core.pause_depth.set(depth + 1);
        if depth == 0 {
            tracing::trace!(effect = self.core.id, "side effect paused");
        }
    }

    /// Undo one `pause`. On the transition back to active, a pending dirty
    /// flag schedules one deferred run on the effect's realm.
    ///
    /// Calling this on an effect that is not paused is a balance bug in the
    /// caller and reports [`ReactiveError::UnbalancedResume`]. Disposed
    /// effects ignore the call.
    pub fn resume(&self) -> Result<(), ReactiveError> {
        if self.core.disposed.get() {
            return Ok(());
        }
        let depth = self.core.pause_depth.get();
        if depth == 0 {
            return Err(ReactiveError::UnbalancedResume);
        }
        self.core.pause_depth.set(depth - 1);
        if depth == 1 && self.core.dirty.get() {
            EffectCore::schedule(&self.core);
        }
        Ok(())
    }

    /// Like [`resume`](SideEffect::resume), but the transition back to
    /// active runs a pending dirty body synchronously instead of
    /// scheduling it. Useful when the caller needs the effect's output
    /// before continuing.
    pub fn resume_and_run_if_dirty(&self) -> Result<(), ReactiveError> {
        if self.core.disposed.get() {
            return Ok(());
        }
        let depth = self.core.pause_depth.get();
        if depth == 0 {
            return Err(ReactiveError::UnbalancedResume);
        }
        self.core.pause_depth.set(depth - 1);
        if depth == 1 {
            self.run_if_dirty();
        }
        Ok(())
    }

    /// Run the body now if the effect is active, dirty, and not already on
    /// the stack; otherwise do nothing. Batch coordinators call this to
    /// bring an effect up to date without waiting for the realm.
    pub fn run_if_dirty(&self) {
        EffectCore::run_if_dirty(&self.core);
    }

    /// Permanently stop the effect: detach every subscription, drop the
    /// body, then notify dispose listeners in registration order. Safe to
    /// call from inside the body; idempotent.
    pub fn dispose(&self) {
        if self.core.disposed.replace(true) {
            return;
        }
        self.core.dependencies.borrow_mut().clear();
        if !self.core.running.get() {
            // Dropping the body releases everything it captured. When the
            // body disposes itself this is deferred to the end of the run,
            // where the borrow is released.
            *self.core.body.borrow_mut() = Box::new(|| {});
        }
        LIVE_EFFECTS.with(|live| {
            live.borrow_mut().remove(&self.core.id);
        });
        let listeners = std::mem::take(&mut *self.core.dispose_listeners.borrow_mut());
        for (_, listener) in listeners {
            if panic::catch_unwind(AssertUnwindSafe(|| listener(self))).is_err() {
                tracing::error!(effect = self.core.id, "dispose listener panicked");
            }
        }
        tracing::debug!(effect = self.core.id, "side effect disposed");
    }

    /// Register `listener` to run when this effect is disposed.
    ///
    /// Listeners run once, in registration order; a listener added after
    /// disposal never runs and its key is inert.
    pub fn add_dispose_listener(&self, listener: impl FnOnce(&SideEffect) + 'static) -> DisposeKey {
        let key = DisposeKey::new();
        if self.core.disposed.get() {
            return key;
        }
        self.core
            .dispose_listeners
            .borrow_mut()
            .push((key, Box::new(listener)));
        key
    }

    /// Remove a dispose listener before it has fired. Unknown keys are
    /// ignored.
    pub fn remove_dispose_listener(&self, key: DisposeKey) {
        self.core
            .dispose_listeners
            .borrow_mut()
            .retain(|(k, _)| *k != key);
    }
}

impl EffectCore {
    /// A dependency changed. Repeat notifications coalesce into the dirty
    /// flag; only the clean-to-dirty edge of an active effect posts a
    /// wake-up task.
    fn mark_dirty(core: &Rc<EffectCore>) {
        if core.disposed.get() {
            return;
        }
        if core.dirty.replace(true) {
            return;
        }
        if core.pause_depth.get() == 0 {
            Self::schedule(core);
        }
    }

    fn schedule(core: &Rc<EffectCore>) {
        if core.scheduled.replace(true) {
            return;
        }
        let weak = Rc::downgrade(core);
        core.realm.post(Box::new(move || {
            if let Some(core) = weak.upgrade() {
                core.scheduled.set(false);
                EffectCore::run_if_dirty(&core);
            }
        }));
        tracing::trace!(effect = core.id, "deferred run scheduled");
    }

    fn run_if_dirty(core: &Rc<EffectCore>) {
        if core.disposed.get()
            || core.running.get()
            || core.pause_depth.get() > 0
            || !core.dirty.get()
        {
            return;
        }
        Self::execute(core);
    }

    /// One tracked run of the body, followed by re-subscription to exactly
    /// the observables that run read.
    ///
    /// The dirty flag clears as the run starts, so changes made *during*
    /// the run re-arm it and schedule another pass. A body panic keeps the
    /// partial read set subscribed and resumes unwinding; the next
    /// dependency change schedules a fresh run, so one failure never wedges
    /// the effect.
    fn execute(core: &Rc<EffectCore>) {
        core.dirty.set(false);
        core.running.set(true);
        let scope = TrackingScope::enter();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut body = core.body.borrow_mut();
            (*body)()
        }));
        let observed = scope.finish();
        core.running.set(false);
        if core.disposed.get() {
            // Disposed mid-run: finish the teardown dispose() deferred
            // while the body was borrowed. The reads of this run are
            // discarded.
            *core.body.borrow_mut() = Box::new(|| {});
        } else {
            Self::update_subscriptions(core, observed);
        }
        if let Err(payload) = outcome {
            panic::resume_unwind(payload);
        }
    }

    /// Diff the previous subscription set against this run's reads: drop
    /// what went stale, subscribe what is new, keep the overlap untouched.
    fn update_subscriptions(core: &Rc<EffectCore>, observed: Vec<DynObservable>) {
        let fresh: IndexMap<ObservableId, DynObservable> = observed
            .into_iter()
            .map(|observable| (observable.observable_id(), observable))
            .collect();
        let mut dependencies = core.dependencies.borrow_mut();
        dependencies.retain(|id, _| fresh.contains_key(id));
        for (id, observable) in fresh {
            if !dependencies.contains_key(&id) {
                let key = observable.add_change_listener(Self::change_listener(core));
                dependencies.insert(id, Subscription::new(observable, key));
            }
        }
    }

    /// The listener attached to each dependency. Holds the effect weakly:
    /// observables never keep an effect alive.
    fn change_listener(core: &Rc<EffectCore>) -> ChangeListener {
        let weak = Rc::downgrade(core);
        Rc::new(move || {
            if let Some(core) = weak.upgrade() {
                EffectCore::mark_dirty(&core);
            }
        })
    }
}

/// Body shared by the supplier/consumer forms.
fn consume_body<T>(
    mut supplier: impl FnMut() -> T,
    mut consumer: impl FnMut(T),
) -> impl FnMut() {
    move || {
        let value = supplier();
        context::untracked(|| consumer(value));
    }
}

impl std::fmt::Debug for SideEffect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SideEffect")
            .field("id", &self.core.id)
            .field("dirty", &self.core.dirty.get())
            .field("pause_depth", &self.core.pause_depth.get())
            .field("dependency_count", &self.dependency_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
