//! Tokio Adapter Realm
//!
//! Bridges deferred side-effect runs onto a tokio `LocalSet`, so reactive
//! code can live inside an async application without driving a queue by
//! hand: posted tasks become `spawn_local` futures and run when the
//! `LocalSet` is next polled.

use std::thread::{self, ThreadId};

use super::{Realm, Task};

/// Realm that posts tasks to the current thread's tokio `LocalSet`.
///
/// [`post`](Realm::post) hands the task to `tokio::task::spawn_local`, so a
/// `LocalSet` must be running on this thread whenever a dependency change
/// schedules a deferred run; outside one, `spawn_local` panics.
pub struct TokioRealm {
    thread: ThreadId,
}

impl TokioRealm {
    /// Capture the current thread as the realm's home.
    pub fn new() -> Self {
        Self {
            thread: thread::current().id(),
        }
    }
}

impl Default for TokioRealm {
    fn default() -> Self {
        Self::new()
    }
}

impl Realm for TokioRealm {
    fn is_current(&self) -> bool {
        thread::current().id() == self.thread
    }

    fn post(&self, task: Task) {
        ::tokio::task::spawn_local(async move { task() });
    }
}

impl std::fmt::Debug for TokioRealm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokioRealm")
            .field("thread", &self.thread)
            .finish()
    }
}
