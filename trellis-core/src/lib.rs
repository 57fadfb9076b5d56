//! Trellis Core
//!
//! This crate provides the core engine for the Trellis reactive side-effect
//! library. It implements:
//!
//! - Observable values with change notification
//! - Side effects with implicit dependency discovery
//! - Deferred, coalesced re-execution on execution realms
//! - Composite grouping and factory-based ownership
//!
//! Side effects discover their dependencies by running: every observable read
//! during a body execution is recorded, and the effect re-runs when any of
//! them changes. Subscriptions are rebuilt from scratch on each run, so an
//! effect only ever watches the observables its latest run actually touched.
//!
//! # Architecture
//!
//! The crate is organized into two modules:
//!
//! - `reactive`: Observable values, dependency tracking, and side effects
//! - `exec`: Execution realms that order and defer effect re-runs
//!
//! Everything here is single-threaded. Handles are not `Send`; an effect
//! lives on the thread of its realm, and cross-thread coordination is left
//! to the embedding application.
//!
//! # Example
//!
//! ```rust,ignore
//! use trellis_core::exec;
//! use trellis_core::reactive::{ObservableValue, SideEffect};
//!
//! // Create an observable value
//! let name = ObservableValue::new(String::from("world"));
//!
//! // Create a side effect; it runs once immediately
//! let greeter = SideEffect::create({
//!     let name = name.clone();
//!     move || println!("Hello, {}!", name.get())
//! });
//!
//! // Update the value
//! name.set(String::from("trellis"));
//!
//! // The re-run is deferred; pumping the realm prints "Hello, trellis!"
//! exec::thread_realm().pump();
//!
//! greeter.dispose();
//! ```

pub mod exec;
pub mod reactive;
