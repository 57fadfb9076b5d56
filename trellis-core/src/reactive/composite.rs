//! Composite Side Effects
//!
//! A composite groups side effects so one lifecycle call fans out to all of
//! them: pausing pauses every child, disposing disposes every child, and
//! `run_if_dirty` brings the whole group up to date. Widgets and similar
//! aggregates use one composite as the single thing to tear down.
//!
//! # Membership
//!
//! Children are held in insertion order and compared by handle identity. A
//! child disposed on its own removes itself from the composite through a
//! dispose listener the composite registers at `add`; removing a child
//! detaches that listener again. The composite's own pause counter stays
//! independent of each child's, so a paused composite hands every incoming
//! child exactly one pause and every departing child the matching resume.

use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use smallvec::SmallVec;

use super::factory::SideEffectFactory;
use super::side_effect::{next_effect_id, DisposeKey, ReactiveError, SideEffect};

type CompositeDisposeListener = Box<dyn FnOnce(&CompositeSideEffect)>;

/// Shared state of one composite.
struct CompositeCore {
    id: u64,
    /// Children in insertion order, each with the key of the auto-removal
    /// dispose listener registered on it.
    children: RefCell<Vec<(SideEffect, DisposeKey)>>,
    pause_depth: Cell<u32>,
    disposed: Cell<bool>,
    dispose_listeners: RefCell<SmallVec<[(DisposeKey, CompositeDisposeListener); 1]>>,
}

/// A group of side effects with a shared lifecycle.
///
/// # Example
///
/// ```rust,ignore
/// let group = CompositeSideEffect::new();
/// group.add(&label_effect);
/// group.add(&tooltip_effect);
///
/// group.pause();        // both stop re-running
/// group.resume()?;      // both catch up
/// group.dispose();      // both are gone
/// ```
#[derive(Clone)]
pub struct CompositeSideEffect {
    core: Rc<CompositeCore>,
}

impl CompositeSideEffect {
    pub fn new() -> Self {
        let core = Rc::new(CompositeCore {
            id: next_effect_id(),
            children: RefCell::new(Vec::new()),
            pause_depth: Cell::new(0),
            disposed: Cell::new(false),
            dispose_listeners: RefCell::new(SmallVec::new()),
        });
        tracing::debug!(composite = core.id, "composite created");
        Self { core }
    }

    /// Process-unique id, also used in log events.
    pub fn id(&self) -> u64 {
        self.core.id
    }

    pub fn is_disposed(&self) -> bool {
        self.core.disposed.get()
    }

    /// Number of children currently in the group.
    pub fn child_count(&self) -> usize {
        self.core.children.borrow().len()
    }

    /// Adopt `child`: lifecycle calls on the composite now reach it too.
    ///
    /// Already-disposed children are ignored. Adding to a disposed
    /// composite disposes the child immediately, so ownership handed to a
    /// composite always ends in disposal. While the composite is paused,
    /// the incoming child receives one pause, matching the resume it gets
    /// on removal or when the composite resumes.
    pub fn add(&self, child: &SideEffect) {
        if child.is_disposed() {
            return;
        }
        if self.core.disposed.get() {
            child.dispose();
            return;
        }
        let weak = Rc::downgrade(&self.core);
        let key = child.add_dispose_listener(move |disposed| {
            // The child ended on its own; forget it without touching its
            // pause balance.
            if let Some(core) = weak.upgrade() {
                core.children
                    .borrow_mut()
                    .retain(|(c, _)| !c.ptr_eq(disposed));
            }
        });
        self.core.children.borrow_mut().push((child.clone(), key));
        if self.core.pause_depth.get() > 0 {
            child.pause();
        }
        tracing::trace!(composite = self.core.id, child = child.id(), "child added");
    }

    /// Detach `child` without disposing it. The auto-removal listener is
    /// dropped, and a child leaving a paused composite gets the matching
    /// resume so membership never leaks a pause. Unknown children are
    /// ignored.
    pub fn remove(&self, child: &SideEffect) {
        let entry = {
            let mut children = self.core.children.borrow_mut();
            match children.iter().position(|(c, _)| c.ptr_eq(child)) {
                Some(index) => Some(children.remove(index)),
                None => None,
            }
        };
        if let Some((child, key)) = entry {
            child.remove_dispose_listener(key);
            if self.core.pause_depth.get() > 0 && child.resume().is_err() {
                tracing::error!(
                    composite = self.core.id,
                    child = child.id(),
                    "child resume unbalanced during removal"
                );
            }
        }
    }

    /// Counted pause; only the first one pauses the children.
    pub fn pause(&self) {
        if self.core.disposed.get() {
            return;
        }
        let depth = self.core.pause_depth.get();
        self.core.pause_depth.set(depth + 1);
        if depth == 0 {
            for (child, _) in self.core.children.borrow().iter() {
                child.pause();
            }
        }
    }

    /// Undo one `pause`; the transition back to active resumes every child,
    /// which schedules deferred runs for the dirty ones.
    ///
    /// A child whose own counter is unbalanced is logged and skipped; only
    /// the composite's own counter produces
    /// [`ReactiveError::UnbalancedResume`] here.
    pub fn resume(&self) -> Result<(), ReactiveError> {
        self.release(SideEffect::resume)
    }

    /// Like [`resume`](CompositeSideEffect::resume), but dirty children run
    /// synchronously on the transition back to active.
    pub fn resume_and_run_if_dirty(&self) -> Result<(), ReactiveError> {
        self.release(SideEffect::resume_and_run_if_dirty)
    }

    fn release(
        &self,
        release_child: fn(&SideEffect) -> Result<(), ReactiveError>,
    ) -> Result<(), ReactiveError> {
        if self.core.disposed.get() {
            return Ok(());
        }
        let depth = self.core.pause_depth.get();
        if depth == 0 {
            return Err(ReactiveError::UnbalancedResume);
        }
        self.core.pause_depth.set(depth - 1);
        if depth == 1 {
            for child in self.children_snapshot() {
                if release_child(&child).is_err() {
                    tracing::error!(
                        composite = self.core.id,
                        child = child.id(),
                        "child resume unbalanced"
                    );
                }
            }
        }
        Ok(())
    }

    /// Forward `run_if_dirty` to every child. A paused or disposed
    /// composite ignores the poke; each child additionally applies its own
    /// gating, so paused or clean children stay untouched.
    pub fn run_if_dirty(&self) {
        if self.core.disposed.get() || self.core.pause_depth.get() > 0 {
            return;
        }
        for child in self.children_snapshot() {
            child.run_if_dirty();
        }
    }

    /// Dispose every child in insertion order, then notify the composite's
    /// own dispose listeners. Idempotent. The disposed flag flips first, so
    /// a child body that adds to this composite during teardown sees a
    /// disposed composite and the incoming effect is disposed rather than
    /// leaked.
    pub fn dispose(&self) {
        if self.core.disposed.replace(true) {
            return;
        }
        let children = std::mem::take(&mut *self.core.children.borrow_mut());
        for (child, key) in children {
            child.remove_dispose_listener(key);
            child.dispose();
        }
        let listeners = std::mem::take(&mut *self.core.dispose_listeners.borrow_mut());
        for (_, listener) in listeners {
            if panic::catch_unwind(AssertUnwindSafe(|| listener(self))).is_err() {
                tracing::error!(composite = self.core.id, "dispose listener panicked");
            }
        }
        tracing::debug!(composite = self.core.id, "composite disposed");
    }

    /// Register `listener` to run when the composite itself is disposed.
    /// Listeners added after disposal never run.
    pub fn add_dispose_listener(
        &self,
        listener: impl FnOnce(&CompositeSideEffect) + 'static,
    ) -> DisposeKey {
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

    /// A factory whose products this composite owns: every side effect it
    /// creates is added here. Products created after the composite is gone
    /// or disposed are disposed immediately.
    pub fn factory(&self) -> SideEffectFactory {
        let weak = Rc::downgrade(&self.core);
        SideEffectFactory::new(move |effect: SideEffect| match weak.upgrade() {
            Some(core) => CompositeSideEffect { core }.add(&effect),
            None => effect.dispose(),
        })
    }

    fn children_snapshot(&self) -> Vec<SideEffect> {
        self.core
            .children
            .borrow()
            .iter()
            .map(|(child, _)| child.clone())
            .collect()
    }
}

impl Default for CompositeSideEffect {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CompositeSideEffect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeSideEffect")
            .field("id", &self.core.id)
            .field("child_count", &self.child_count())
            .field("pause_depth", &self.core.pause_depth.get())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec;
    use crate::reactive::observable::ObservableValue;
    use std::cell::Cell;

    fn pump() -> usize {
        exec::thread_realm().pump()
    }

    fn counting_effect(value: &ObservableValue<i32>) -> (SideEffect, Rc<Cell<i32>>) {
        let runs = Rc::new(Cell::new(0));
        let value = value.clone();
        let runs_in_body = Rc::clone(&runs);
        let effect = SideEffect::create(move || {
            let _ = value.get();
            runs_in_body.set(runs_in_body.get() + 1);
        });
        (effect, runs)
    }

    #[test]
    fn dispose_cascades_in_insertion_order() {
        let value = ObservableValue::new(0);
        let (first, _) = counting_effect(&value);
        let (second, _) = counting_effect(&value);
        let order = Rc::new(RefCell::new(Vec::new()));

        let order_first = Rc::clone(&order);
        first.add_dispose_listener(move |_| order_first.borrow_mut().push("first"));
        let order_second = Rc::clone(&order);
        second.add_dispose_listener(move |_| order_second.borrow_mut().push("second"));

        let group = CompositeSideEffect::new();
        group.add(&first);
        group.add(&second);
        assert_eq!(group.child_count(), 2);

        group.dispose();
        assert!(group.is_disposed());
        assert!(first.is_disposed());
        assert!(second.is_disposed());
        assert_eq!(*order.borrow(), vec!["first", "second"]);
        assert_eq!(group.child_count(), 0);

        group.dispose();
        assert_eq!(order.borrow().len(), 2);
    }

    #[test]
    fn pause_and_resume_cascade() {
        let value = ObservableValue::new(0);
        let (effect, runs) = counting_effect(&value);
        let group = CompositeSideEffect::new();
        group.add(&effect);

        group.pause();
        value.set(1);
        assert_eq!(pump(), 0);
        assert_eq!(runs.get(), 1);

        group.resume().unwrap();
        pump();
        assert_eq!(runs.get(), 2);
        group.dispose();
    }

    #[test]
    fn composite_pauses_nest() {
        let value = ObservableValue::new(0);
        let (effect, runs) = counting_effect(&value);
        let group = CompositeSideEffect::new();
        group.add(&effect);

        group.pause();
        group.pause();
        value.set(1);

        group.resume().unwrap();
        pump();
        assert_eq!(runs.get(), 1);

        group.resume().unwrap();
        pump();
        assert_eq!(runs.get(), 2);
        group.dispose();
    }

    #[test]
    fn resume_and_run_if_dirty_is_synchronous() {
        let value = ObservableValue::new(0);
        let (effect, runs) = counting_effect(&value);
        let group = CompositeSideEffect::new();
        group.add(&effect);

        group.pause();
        value.set(1);
        group.resume_and_run_if_dirty().unwrap();
        assert_eq!(runs.get(), 2);
        assert_eq!(exec::thread_realm().pending(), 0);
        group.dispose();
    }

    #[test]
    fn child_disposed_on_its_own_is_forgotten() {
        let value = ObservableValue::new(0);
        let (first, _) = counting_effect(&value);
        let (second, second_runs) = counting_effect(&value);
        let group = CompositeSideEffect::new();
        group.add(&first);
        group.add(&second);

        first.dispose();
        assert_eq!(group.child_count(), 1);

        // The rest of the group is unaffected.
        value.set(1);
        pump();
        assert_eq!(second_runs.get(), 2);
        group.dispose();
        assert!(second.is_disposed());
    }

    #[test]
    fn remove_detaches_without_disposing() {
        let value = ObservableValue::new(0);
        let (effect, runs) = counting_effect(&value);
        let group = CompositeSideEffect::new();
        group.add(&effect);

        group.remove(&effect);
        assert_eq!(group.child_count(), 0);

        group.dispose();
        assert!(!effect.is_disposed());

        value.set(1);
        pump();
        assert_eq!(runs.get(), 2);
        effect.dispose();
    }

    #[test]
    fn remove_from_paused_composite_resumes_child() {
        let value = ObservableValue::new(0);
        let (effect, runs) = counting_effect(&value);
        let group = CompositeSideEffect::new();
        group.pause();
        group.add(&effect);

        value.set(1);
        assert_eq!(pump(), 0);

        // Leaving the paused group returns the pause it received at add.
        group.remove(&effect);
        pump();
        assert_eq!(runs.get(), 2);
        effect.dispose();
        group.dispose();
    }

    #[test]
    fn add_while_paused_pauses_child_once() {
        let value = ObservableValue::new(0);
        let (effect, runs) = counting_effect(&value);
        let group = CompositeSideEffect::new();
        group.pause();
        group.add(&effect);

        value.set(1);
        assert_eq!(pump(), 0);
        assert_eq!(runs.get(), 1);

        group.resume().unwrap();
        pump();
        assert_eq!(runs.get(), 2);
        group.dispose();
    }

    #[test]
    fn disposed_child_is_not_added() {
        let value = ObservableValue::new(0);
        let (effect, _) = counting_effect(&value);
        effect.dispose();

        let group = CompositeSideEffect::new();
        group.add(&effect);
        assert_eq!(group.child_count(), 0);

        // The shared no-op handle reports disposed, so it is ignored too.
        group.add(&SideEffect::create(|| {}));
        assert_eq!(group.child_count(), 0);
        group.dispose();
    }

    #[test]
    fn add_to_disposed_composite_disposes_child() {
        let value = ObservableValue::new(0);
        let (effect, _) = counting_effect(&value);

        let group = CompositeSideEffect::new();
        group.dispose();
        group.add(&effect);

        assert!(effect.is_disposed());
        assert_eq!(group.child_count(), 0);
    }

    #[test]
    fn shared_child_disposed_by_one_composite_leaves_the_other() {
        let value = ObservableValue::new(0);
        let (child, _) = counting_effect(&value);
        let first = CompositeSideEffect::new();
        let second = CompositeSideEffect::new();
        first.add(&child);
        second.add(&child);

        // Each composite pauses the child independently.
        first.pause();
        assert!(!child.is_disposed());

        // The first disposer wins; the other composite just forgets the
        // child instead of disposing it a second time.
        second.dispose();
        assert!(child.is_disposed());
        assert_eq!(first.child_count(), 0);
        assert!(!first.is_disposed());

        first.resume().unwrap();
        first.dispose();
    }

    #[test]
    fn unbalanced_composite_resume_is_an_error() {
        let group = CompositeSideEffect::new();
        assert_eq!(group.resume(), Err(ReactiveError::UnbalancedResume));

        group.pause();
        assert!(group.resume().is_ok());
        assert_eq!(group.resume(), Err(ReactiveError::UnbalancedResume));
        group.dispose();
    }

    #[test]
    fn run_if_dirty_brings_group_up_to_date() {
        let value = ObservableValue::new(0);
        let (first, first_runs) = counting_effect(&value);
        let (second, second_runs) = counting_effect(&value);
        let group = CompositeSideEffect::new();
        group.add(&first);
        group.add(&second);

        value.set(1);
        group.run_if_dirty();
        assert_eq!(first_runs.get(), 2);
        assert_eq!(second_runs.get(), 2);

        // The deferred wake-ups find nothing left to do.
        pump();
        assert_eq!(first_runs.get(), 2);
        assert_eq!(second_runs.get(), 2);
        group.dispose();
    }

    #[test]
    fn composite_dispose_listener_fires_once() {
        let group = CompositeSideEffect::new();
        let fired = Rc::new(Cell::new(0));

        let fired_in_listener = Rc::clone(&fired);
        group.add_dispose_listener(move |_| fired_in_listener.set(fired_in_listener.get() + 1));

        group.dispose();
        group.dispose();
        assert_eq!(fired.get(), 1);

        let _key = group.add_dispose_listener(|_| panic!("listener after disposal ran"));
    }
}
