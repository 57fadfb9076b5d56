//! Execution Realms
//!
//! A realm is the single logical context a group of reactive objects lives
//! on. Deferred side-effect runs are posted to the owning realm instead of
//! running inline, which is what lets many dependency changes coalesce into
//! one re-run.
//!
//! # How Realms Work
//!
//! 1. Every side effect captures a realm at creation, either explicitly or
//!    from the ambient default.
//!
//! 2. A dependency change marks the effect dirty and posts one wake-up task
//!    to its realm; further changes before that task runs are absorbed by
//!    the dirty flag.
//!
//! 3. The realm runs posted tasks later, in post order: [`LocalRealm`] when
//!    its queue is pumped, [`TokioRealm`] on the current `LocalSet`.
//!
//! # The ambient default
//!
//! [`current_realm`] resolves to the innermost [`with_realm`] scope, and
//! outside any scope to the per-thread [`thread_realm`] queue. Code that
//! never mentions realms therefore still gets deterministic, same-thread
//! deferral.

use std::cell::{OnceCell, RefCell};
use std::rc::Rc;

mod local;
mod tokio;

pub use local::LocalRealm;
pub use self::tokio::TokioRealm;

/// A deferred unit of work posted to a realm.
pub type Task = Box<dyn FnOnce() + 'static>;

/// One logical execution context.
pub trait Realm {
    /// True when the caller is already executing inside this realm.
    fn is_current(&self) -> bool;

    /// Queue `task` to run inside the realm at some later point. Tasks run
    /// in post order and never inline.
    fn post(&self, task: Task);
}

thread_local! {
    /// Innermost-wins stack of ambient realms installed by [`with_realm`].
    static AMBIENT: RefCell<Vec<Rc<dyn Realm>>> = RefCell::new(Vec::new());

    /// Lazily created per-thread default realm.
    static THREAD_REALM: OnceCell<Rc<LocalRealm>> = OnceCell::new();
}

/// Install `realm` as the ambient default for the duration of `f`.
///
/// Nested installs shadow outer ones; the previous default is restored when
/// `f` returns, including by panic.
pub fn with_realm<R>(realm: Rc<dyn Realm>, f: impl FnOnce() -> R) -> R {
    AMBIENT.with(|stack| stack.borrow_mut().push(realm));
    let _guard = AmbientGuard;
    f()
}

struct AmbientGuard;

impl Drop for AmbientGuard {
    fn drop(&mut self) {
        AMBIENT.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// The realm new side effects capture when none is passed explicitly.
pub fn current_realm() -> Rc<dyn Realm> {
    if let Some(realm) = AMBIENT.with(|stack| stack.borrow().last().cloned()) {
        realm
    } else {
        let realm: Rc<dyn Realm> = thread_realm();
        realm
    }
}

/// This thread's default [`LocalRealm`], created on first use.
///
/// Tests and simple programs drive deferred runs by calling
/// [`LocalRealm::pump`] on it.
pub fn thread_realm() -> Rc<LocalRealm> {
    THREAD_REALM.with(|cell| Rc::clone(cell.get_or_init(|| Rc::new(LocalRealm::new()))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn thread_realm_is_stable() {
        let first = thread_realm();
        let second = thread_realm();
        assert!(Rc::ptr_eq(&first, &second));
    }

    #[test]
    fn current_realm_defaults_to_thread_realm() {
        let ambient = current_realm();
        let counter = Rc::new(Cell::new(0));

        let counter_in_task = Rc::clone(&counter);
        ambient.post(Box::new(move || {
            counter_in_task.set(counter_in_task.get() + 1);
        }));

        assert_eq!(counter.get(), 0);
        thread_realm().pump();
        assert_eq!(counter.get(), 1);
    }

    #[test]
    fn with_realm_shadows_and_restores() {
        let inner = Rc::new(LocalRealm::new());
        let counter = Rc::new(Cell::new(0));

        with_realm(inner.clone(), || {
            let counter_in_task = Rc::clone(&counter);
            current_realm().post(Box::new(move || {
                counter_in_task.set(counter_in_task.get() + 1);
            }));
        });

        // The task went to the scoped realm, not the thread default.
        thread_realm().pump();
        assert_eq!(counter.get(), 0);
        inner.pump();
        assert_eq!(counter.get(), 1);
    }

    #[test]
    fn with_realm_nests_innermost_wins() {
        let outer = Rc::new(LocalRealm::new());
        let inner = Rc::new(LocalRealm::new());

        with_realm(outer.clone(), || {
            with_realm(inner.clone(), || {
                current_realm().post(Box::new(|| {}));
            });
            current_realm().post(Box::new(|| {}));
        });

        assert_eq!(inner.pending(), 1);
        assert_eq!(outer.pending(), 1);
    }
}
