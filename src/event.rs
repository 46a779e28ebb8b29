//! Minimal event-loop surface consumed by the pipeline.
//!
//! Cooperative clients register an [`EventHandler`] with a callback and
//! pass it (wrapped in [`Waiter::Handler`](crate::waitable::Waiter)) to
//! `get_buffer`/`add_buffer`/`finalize`. When the component signals
//! availability, a typed [`BufferEvent`] is queued here and delivered on
//! whatever thread drives the loop. Handlers receive events one at a
//! time; dispatch never holds the queue lock across a callback.
//!
//! A handler that withdraws as waiter gets its pending events purged, so
//! destruction cannot be followed by a stale delivery.

use crate::waitable::WaitableToken;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Availability announcement from a waitable, delivered via the loop.
#[derive(Debug, Clone, Copy)]
pub struct BufferEvent {
    /// Token of the waitable that signaled.
    pub source: WaitableToken,
}

type Callback = Box<dyn FnMut(BufferEvent) + Send>;

struct HandlerShared {
    queue: Arc<LoopShared>,
    callback: Mutex<Callback>,
}

/// A registered event-loop handler. Cloning yields another reference to
/// the same registration.
#[derive(Clone)]
pub struct EventHandler {
    shared: Arc<HandlerShared>,
}

impl EventHandler {
    /// True if both values reference the same registration.
    pub fn same_handler(&self, other: &EventHandler) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Queue an availability event for this handler.
    pub(crate) fn post_availability(&self, source: WaitableToken) {
        let mut state = self.shared.queue.state.lock().unwrap();
        state
            .events
            .push_back((self.clone(), BufferEvent { source }));
        drop(state);
        self.shared.queue.cond.notify_one();
    }

    /// Drop queued events for this handler that came from `source`.
    pub(crate) fn purge_events(&self, source: WaitableToken) {
        let mut state = self.shared.queue.state.lock().unwrap();
        state
            .events
            .retain(|(h, ev)| !(h.same_handler(self) && ev.source == source));
    }
}

#[derive(Default)]
struct LoopState {
    events: VecDeque<(EventHandler, BufferEvent)>,
}

#[derive(Default)]
struct LoopShared {
    state: Mutex<LoopState>,
    cond: Condvar,
}

/// A queue of typed events dispatched sequentially to handlers.
///
/// The loop is driven explicitly: call [`dispatch_one`](Self::dispatch_one)
/// or [`dispatch_pending`](Self::dispatch_pending) from the thread that
/// owns the cooperative handlers, or block with
/// [`wait_dispatch`](Self::wait_dispatch).
#[derive(Default)]
pub struct EventLoop {
    shared: Arc<LoopShared>,
}

impl EventLoop {
    /// An empty loop with no pending events.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler with the given callback.
    ///
    /// The callback runs on the dispatching thread. It may call back
    /// into readers, writers and the pool, but must not drive this loop
    /// recursively.
    pub fn handler(&self, callback: impl FnMut(BufferEvent) + Send + 'static) -> EventHandler {
        EventHandler {
            shared: Arc::new(HandlerShared {
                queue: self.shared.clone(),
                callback: Mutex::new(Box::new(callback)),
            }),
        }
    }

    /// Deliver the oldest pending event, if any. Returns whether one was
    /// delivered.
    pub fn dispatch_one(&self) -> bool {
        let popped = {
            let mut state = self.shared.state.lock().unwrap();
            state.events.pop_front()
        };
        match popped {
            Some((handler, event)) => {
                let mut callback = handler.shared.callback.lock().unwrap();
                (*callback)(event);
                true
            }
            None => false,
        }
    }

    /// Deliver every event currently pending. Returns the count.
    pub fn dispatch_pending(&self) -> usize {
        let mut dispatched = 0;
        while self.dispatch_one() {
            dispatched += 1;
        }
        dispatched
    }

    /// Block up to `timeout` for an event, then deliver it. Returns
    /// whether one was delivered.
    pub fn wait_dispatch(&self, timeout: Duration) -> bool {
        {
            let mut state = self.shared.state.lock().unwrap();
            while state.events.is_empty() {
                let (next, result) = self.shared.cond.wait_timeout(state, timeout).unwrap();
                state = next;
                if result.timed_out() && state.events.is_empty() {
                    return false;
                }
            }
        }
        self.dispatch_one()
    }

    /// Remove pending events matching the predicate.
    pub fn filter_events(&self, mut predicate: impl FnMut(&EventHandler, &BufferEvent) -> bool) {
        let mut state = self.shared.state.lock().unwrap();
        state.events.retain(|(h, ev)| !predicate(h, ev));
    }

    /// Number of undelivered events.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().unwrap().events.len()
    }
}
