//! Queue-Backed Local Realm
//!
//! The default realm: a FIFO task queue owned by one thread, drained
//! explicitly with [`LocalRealm::pump`]. Tests and manually driven event
//! loops use it to decide exactly when deferred side-effect runs happen.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::thread::{self, ThreadId};

use super::{Realm, Task};

/// A single-threaded FIFO realm.
pub struct LocalRealm {
    thread: ThreadId,
    queue: RefCell<VecDeque<Task>>,
    pumping: Cell<bool>,
}

impl LocalRealm {
    /// Create a realm owned by the current thread.
    pub fn new() -> Self {
        Self {
            thread: thread::current().id(),
            queue: RefCell::new(VecDeque::new()),
            pumping: Cell::new(false),
        }
    }

    /// Number of queued tasks that have not run yet.
    pub fn pending(&self) -> usize {
        self.queue.borrow().len()
    }

    /// Run queued tasks until the queue is idle. Returns how many ran.
    ///
    /// Tasks posted while pumping run in the same call. A reentrant pump
    /// (from inside a task) returns 0 immediately; the outermost pump keeps
    /// draining. If a task panics the panic propagates, the task counts as
    /// consumed, and the rest of the queue stays intact for the next pump.
    pub fn pump(&self) -> usize {
        if self.pumping.replace(true) {
            return 0;
        }
        let _guard = PumpGuard { flag: &self.pumping };
        let mut ran = 0;
        loop {
            let task = self.queue.borrow_mut().pop_front();
            match task {
                Some(task) => {
                    task();
                    ran += 1;
                }
                None => break,
            }
        }
        ran
    }
}

impl Default for LocalRealm {
    fn default() -> Self {
        Self::new()
    }
}

impl Realm for LocalRealm {
    fn is_current(&self) -> bool {
        thread::current().id() == self.thread
    }

    fn post(&self, task: Task) {
        self.queue.borrow_mut().push_back(task);
    }
}

impl std::fmt::Debug for LocalRealm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalRealm")
            .field("thread", &self.thread)
            .field("pending", &self.pending())
            .field("pumping", &self.pumping.get())
            .finish()
    }
}

/// Clears the pumping flag even when a task panics.
struct PumpGuard<'a> {
    flag: &'a Cell<bool>,
}

impl Drop for PumpGuard<'_> {
    fn drop(&mut self) {
        self.flag.set(false);
    }
}
