//! Dependency Tracking
//!
//! The tracker discovers dependencies implicitly: a computation runs inside
//! a tracking scope, observables report their reads, and when the scope ends
//! it yields exactly the observables that run touched. Nothing is declared
//! up front, so a computation's dependency set follows its control flow from
//! run to run.
//!
//! # Implementation
//!
//! We use a thread-local stack of frames. Entering a scope pushes a frame;
//! reads land in the innermost frame only, de-duplicated by observable
//! identity in first-read order. [`untracked`] bumps a suppression counter
//! on the innermost frame, so reads inside the region are dropped while a
//! nested scope opened inside that region still collects normally.
//!
//! This design supports arbitrary nesting: a scope inside an `untracked`
//! region inside another scope attributes every read to the right frame.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;

use super::observable::{DynObservable, ObservableId};

/// The tracking-frame stack.
///
/// Each thread has its own stack, so tracking needs no synchronization and
/// reads on one thread can never be attributed to a computation on another.
thread_local! {
    static FRAME_STACK: RefCell<Vec<Frame>> = RefCell::new(Vec::new());
}

/// Counter for frame identities, used to verify balanced enter/exit.
static FRAME_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// One entry in the tracking-frame stack.
struct Frame {
    id: u64,
    /// Observables read so far, keyed by identity in first-read order.
    observed: IndexMap<ObservableId, DynObservable>,
    /// Depth of `untracked` regions currently open inside this frame.
    suppress: u32,
}

/// Guard for one tracking frame.
///
/// [`finish`](TrackingScope::finish) pops the frame and yields the reads it
/// collected. If the scope is dropped instead (usually during unwinding),
/// the frame is popped and its reads are discarded, keeping the stack
/// balanced either way.
pub struct TrackingScope {
    frame_id: u64,
    active: bool,
}

impl TrackingScope {
    /// Push a fresh frame; subsequent reads are attributed to it until it
    /// is finished or an inner scope takes over.
    pub fn enter() -> Self {
        let id = FRAME_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        FRAME_STACK.with(|stack| {
            stack.borrow_mut().push(Frame {
                id,
                observed: IndexMap::new(),
                suppress: 0,
            });
        });
        Self {
            frame_id: id,
            active: true,
        }
    }

    /// Pop the frame and return the observables it recorded, in the order
    /// they were first read.
    pub fn finish(mut self) -> Vec<DynObservable> {
        self.active = false;
        Self::pop(self.frame_id)
            .map(|frame| frame.observed.into_values().collect())
            .unwrap_or_default()
    }

    fn pop(frame_id: u64) -> Option<Frame> {
        FRAME_STACK.with(|stack| {
            let popped = stack.borrow_mut().pop();
            if let Some(frame) = &popped {
                // Catches mismatched scope discipline early.
                debug_assert_eq!(
                    frame.id, frame_id,
                    "tracking scope mismatch: expected frame {}, got {}",
                    frame_id, frame.id
                );
            }
            popped
        })
    }
}

impl Drop for TrackingScope {
    fn drop(&mut self) {
        if self.active {
            let _ = Self::pop(self.frame_id);
        }
    }
}

/// Run `body` inside a tracking scope and return its result together with
/// the observables it read.
///
/// A panic in `body` propagates to the caller; the frame is popped on the
/// way out. Callers that need the partial read set of a failed run hold a
/// [`TrackingScope`] directly and catch the panic themselves.
pub fn run_and_monitor<R>(body: impl FnOnce() -> R) -> (R, Vec<DynObservable>) {
    let scope = TrackingScope::enter();
    let result = body();
    (result, scope.finish())
}

/// Run `body` with read tracking suppressed.
///
/// Reads inside the region are not attributed to the enclosing scope.
/// Regions nest, and a tracking scope entered *inside* the region starts
/// unsuppressed, so tracked and untracked code compose in both nesting
/// directions. Outside any scope this is a plain call.
pub fn untracked<R>(body: impl FnOnce() -> R) -> R {
    let _guard = SuppressGuard::engage();
    body()
}

struct SuppressGuard {
    engaged: bool,
}

impl SuppressGuard {
    fn engage() -> Self {
        let engaged = FRAME_STACK.with(|stack| {
            if let Some(frame) = stack.borrow_mut().last_mut() {
                frame.suppress += 1;
                true
            } else {
                false
            }
        });
        Self { engaged }
    }
}

impl Drop for SuppressGuard {
    fn drop(&mut self) {
        if self.engaged {
            FRAME_STACK.with(|stack| {
                if let Some(frame) = stack.borrow_mut().last_mut() {
                    frame.suppress -= 1;
                }
            });
        }
    }
}

/// Report a read of `observable` to the innermost frame.
///
/// Called by observables from their tracked accessors. No frame, or a
/// suppressed one, means the read is dropped. Repeat reads of the same
/// observable collapse into one entry.
pub fn track_read(observable: &DynObservable) {
    FRAME_STACK.with(|stack| {
        if let Some(frame) = stack.borrow_mut().last_mut() {
            if frame.suppress == 0 {
                frame
                    .observed
                    .entry(observable.observable_id())
                    .or_insert_with(|| Rc::clone(observable));
            }
        }
    });
}

/// True when a read at this point would be recorded: there is an innermost
/// frame and it is not suppressed.
pub fn is_tracking() -> bool {
    FRAME_STACK.with(|stack| {
        stack
            .borrow()
            .last()
            .map(|frame| frame.suppress == 0)
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::observable::ObservableValue;

    fn ids(observed: &[DynObservable]) -> Vec<ObservableId> {
        observed.iter().map(|o| o.observable_id()).collect()
    }

    #[test]
    fn monitor_collects_reads_in_order() {
        let a = ObservableValue::new(1);
        let b = ObservableValue::new(2);

        let (sum, observed) = run_and_monitor(|| a.get() + b.get());

        assert_eq!(sum, 3);
        assert_eq!(ids(&observed), vec![a.id(), b.id()]);
    }

    #[test]
    fn repeat_reads_are_deduplicated() {
        let a = ObservableValue::new(1);

        let (_, observed) = run_and_monitor(|| a.get() + a.get() + a.get());

        assert_eq!(ids(&observed), vec![a.id()]);
    }

    #[test]
    fn untracked_reads_are_dropped() {
        let a = ObservableValue::new(1);
        let b = ObservableValue::new(2);

        let (_, observed) = run_and_monitor(|| {
            let _ = a.get();
            untracked(|| b.get())
        });

        assert_eq!(ids(&observed), vec![a.id()]);
    }

    #[test]
    fn get_untracked_never_records() {
        let a = ObservableValue::new(1);

        let (_, observed) = run_and_monitor(|| a.get_untracked());

        assert!(observed.is_empty());
    }

    #[test]
    fn scope_inside_untracked_region_collects() {
        let a = ObservableValue::new(1);
        let b = ObservableValue::new(2);

        let (inner_observed, outer_observed) = run_and_monitor(|| {
            untracked(|| {
                let (_, inner) = run_and_monitor(|| b.get());
                let _ = a.get_untracked();
                inner
            })
        });

        // The nested scope starts unsuppressed even though it was opened
        // inside an untracked region; the outer frame sees nothing.
        assert_eq!(ids(&inner_observed), vec![b.id()]);
        assert!(outer_observed.is_empty());
    }

    #[test]
    fn nested_scopes_attribute_to_innermost() {
        let a = ObservableValue::new(1);
        let b = ObservableValue::new(2);

        let (_, outer_observed) = run_and_monitor(|| {
            let _ = a.get();
            let (_, inner_observed) = run_and_monitor(|| b.get());
            assert_eq!(ids(&inner_observed), vec![b.id()]);
        });

        assert_eq!(ids(&outer_observed), vec![a.id()]);
    }

    #[test]
    fn untracked_regions_nest() {
        let a = ObservableValue::new(1);

        let (_, observed) = run_and_monitor(|| {
            untracked(|| {
                untracked(|| {
                    let _ = a.get();
                });
                // Still suppressed after the inner region closes.
                let _ = a.get();
            });
            assert!(is_tracking());
        });

        assert!(observed.is_empty());
    }

    #[test]
    fn is_tracking_reflects_scope_and_suppression() {
        assert!(!is_tracking());

        let (_, _) = run_and_monitor(|| {
            assert!(is_tracking());
            untracked(|| {
                assert!(!is_tracking());
            });
            assert!(is_tracking());
        });

        assert!(!is_tracking());
    }

    #[test]
    fn panic_keeps_stack_balanced_and_partial_reads_reachable() {
        let a = ObservableValue::new(1);
        let b = ObservableValue::new(2);

        let scope = TrackingScope::enter();
        let _ = a.get();
        let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = b.get();
            panic!("boom");
        }));
        assert!(caught.is_err());

        // Everything read before the panic is still in the frame.
        let observed = scope.finish();
        assert_eq!(ids(&observed), vec![a.id(), b.id()]);
        assert!(!is_tracking());
    }
}
