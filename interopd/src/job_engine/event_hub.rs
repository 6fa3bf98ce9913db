// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! Named-event publish/subscribe.
//!
//! Handlers run synchronously on the publishing thread, in registration
//! order. There is no isolation: a panicking handler unwinds into the
//! publisher and the remaining handlers for that event are skipped. The hub
//! itself holds no lock; owners that share it between threads wrap it.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

pub type Listener<A> = Arc<dyn Fn(&A) + Send + Sync>;

pub struct EventHub<E, A = ()> {
    handlers: HashMap<E, Vec<Listener<A>>>,
}

impl<E: Eq + Hash, A> EventHub<E, A> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn subscribe(&mut self, event: E, handler: Listener<A>) {
        self.handlers.entry(event).or_default().push(handler);
    }

    /// Wraps `f` into a [`Listener`], subscribes it and hands the listener
    /// back so it can be unsubscribed later.
    pub fn on(&mut self, event: E, f: impl Fn(&A) + Send + Sync + 'static) -> Listener<A> {
        let listener: Listener<A> = Arc::new(f);
        self.subscribe(event, listener.clone());
        listener
    }

    /// Removes the first registration of `handler` for `event`. Unknown
    /// events and handlers are ignored.
    pub fn unsubscribe(&mut self, event: &E, handler: &Listener<A>) {
        if let Some(handlers) = self.handlers.get_mut(event) {
            if let Some(pos) = handlers.iter().position(|h| Arc::ptr_eq(h, handler)) {
                handlers.remove(pos);
            }
        }
    }

    pub fn publish(&self, event: &E, args: &A) {
        if let Some(handlers) = self.handlers.get(event) {
            for handler in handlers {
                handler(args);
            }
        }
    }

    pub fn listener_count(&self, event: &E) -> usize {
        self.handlers.get(event).map_or(0, Vec::len)
    }
}

impl<E: Eq + Hash, A> Default for EventHub<E, A> {
    fn default() -> Self {
        Self::new()
    }
}

// Manual impl: listeners are shared, so `A` does not need to be `Clone`.
impl<E: Clone, A> Clone for EventHub<E, A> {
    fn clone(&self) -> Self {
        Self {
            handlers: self.handlers.clone(),
        }
    }
}
