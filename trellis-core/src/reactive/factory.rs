//! Side Effect Factories
//!
//! A factory is a creation facade that routes every side effect it makes
//! into a sink chosen up front, so call sites can create effects without
//! also wiring up their ownership. The common sink is a
//! [`CompositeSideEffect`](super::CompositeSideEffect) that will dispose
//! the whole batch later, but any `Fn(SideEffect)` works.
//!
//! The factory mirrors the free constructors on [`SideEffect`] one-for-one.
//! Even the one-shot form goes through the sink: a composite owning it
//! simply sees it leave again when it disposes itself.

use std::rc::Rc;

use crate::exec::Realm;

use super::side_effect::SideEffect;

/// Creates side effects and hands each one to a fixed sink.
#[derive(Clone)]
pub struct SideEffectFactory {
    sink: Rc<dyn Fn(SideEffect)>,
}

impl SideEffectFactory {
    /// A factory delivering every created effect to `sink`. The sink runs
    /// after the effect's construction completes, so a synchronous first
    /// run has already happened by the time the sink sees the handle.
    pub fn new(sink: impl Fn(SideEffect) + 'static) -> Self {
        Self {
            sink: Rc::new(sink),
        }
    }

    /// [`SideEffect::create`] routed through the sink. The shared no-op
    /// handle produced by a dependency-free body is delivered like any
    /// other effect; sinks treat disposed handles as they see fit.
    pub fn create(&self, body: impl FnMut() + 'static) -> SideEffect {
        self.deliver(SideEffect::create(body))
    }

    /// [`SideEffect::create_paused`] routed through the sink.
    pub fn create_paused(&self, body: impl FnMut() + 'static) -> SideEffect {
        self.deliver(SideEffect::create_paused(body))
    }

    /// [`SideEffect::create_paused_in`] routed through the sink.
    pub fn create_paused_in(&self, realm: Rc<dyn Realm>, body: impl FnMut() + 'static) -> SideEffect {
        self.deliver(SideEffect::create_paused_in(realm, body))
    }

    /// [`SideEffect::consume`] routed through the sink.
    pub fn consume<T: 'static>(
        &self,
        supplier: impl FnMut() -> T + 'static,
        consumer: impl FnMut(T) + 'static,
    ) -> SideEffect {
        self.deliver(SideEffect::consume(supplier, consumer))
    }

    /// [`SideEffect::consume_async`] routed through the sink.
    pub fn consume_async<T: 'static>(
        &self,
        supplier: impl FnMut() -> T + 'static,
        consumer: impl FnMut(T) + 'static,
    ) -> SideEffect {
        self.deliver(SideEffect::consume_async(supplier, consumer))
    }

    /// [`SideEffect::consume_once_async`] routed through the sink.
    pub fn consume_once_async<T: 'static>(
        &self,
        supplier: impl FnMut() -> Option<T> + 'static,
        consumer: impl FnOnce(T) + 'static,
    ) -> SideEffect {
        self.deliver(SideEffect::consume_once_async(supplier, consumer))
    }

    fn deliver(&self, effect: SideEffect) -> SideEffect {
        (self.sink)(effect.clone());
        effect
    }
}

impl std::fmt::Debug for SideEffectFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SideEffectFactory").finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
