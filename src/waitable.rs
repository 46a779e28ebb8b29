//! The availability-signal protocol.
//!
//! A [`Waitable`] is something that can announce "more work available":
//! the buffer pool when a lease returns, a reader when its queue gains a
//! buffer, a writer when its backlog drains. A [`Waiter`] is whoever
//! wants that announcement, either a raw callback sink invoked from the
//! signaling thread or an event-loop handler that receives a posted
//! [`BufferEvent`](crate::event::BufferEvent).
//!
//! Exactly one waiter is signaled per notification, latest-registered
//! first. Fairness between waiters is explicitly undefined.

use crate::event::EventHandler;
use std::sync::{Arc, Mutex};

/// Identity of a waitable, used to tell which component signaled.
///
/// Tokens are stable for the lifetime of the component and are only ever
/// compared, never dereferenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaitableToken(usize);

/// A raw availability sink.
///
/// The callback runs on an unspecified thread, possibly while the
/// signaling component holds its own state lock. Implementations must
/// only signal their own synchronization primitive (condition variable,
/// event post) and must never call back into the waitable.
pub trait WaiterSink: Send + Sync {
    /// One unit of availability from the waitable identified by `from`.
    fn on_buffer_availability(&self, from: WaitableToken);
}

/// A subscriber for availability announcements.
#[derive(Clone)]
pub enum Waiter {
    /// Raw callback sink, invoked synchronously from the signaling thread.
    Sink(Arc<dyn WaiterSink>),
    /// Event-loop handler; availability arrives as a posted event.
    Handler(EventHandler),
}

impl Waiter {
    /// Wrap a raw sink.
    pub fn sink(sink: Arc<dyn WaiterSink>) -> Self {
        Waiter::Sink(sink)
    }

    /// Wrap an event-loop handler.
    pub fn handler(handler: EventHandler) -> Self {
        Waiter::Handler(handler)
    }
}

fn sink_id(sink: &Arc<dyn WaiterSink>) -> usize {
    Arc::as_ptr(sink) as *const () as usize
}

#[derive(Default)]
struct WaitState {
    /// Raw sinks, signaled LIFO.
    sinks: Vec<Arc<dyn WaiterSink>>,
    /// Event-loop handlers, signaled LIFO after all raw sinks.
    handlers: Vec<EventHandler>,
    /// Identity of the sink currently being called back, if any.
    signaling: Option<usize>,
}

/// An object that can be waited on for availability.
///
/// Embedded in the pool, every reader and every writer. The queues are
/// guarded by their own mutex, separate from the owning component's
/// state lock, and that mutex is released around the sink callback.
#[derive(Default)]
pub struct Waitable {
    state: Mutex<WaitState>,
}

impl Waitable {
    /// A waitable with no registered waiters.
    pub fn new() -> Self {
        Self::default()
    }

    /// This waitable's identity token.
    pub fn token(&self) -> WaitableToken {
        WaitableToken(self as *const Self as usize)
    }

    /// Append a waiter. The same party may be registered once per
    /// outstanding wait; each registration consumes one signal.
    pub fn add_waiter(&self, waiter: Waiter) {
        let mut state = self.state.lock().unwrap();
        match waiter {
            Waiter::Sink(s) => state.sinks.push(s),
            Waiter::Handler(h) => state.handlers.push(h),
        }
    }

    /// Remove every registration of `waiter`.
    ///
    /// For a raw sink this returns only after any in-flight callback to
    /// it has returned, so the sink may be destroyed immediately
    /// afterwards. For a handler this also purges availability events
    /// from this waitable that are still queued in the handler's loop,
    /// so no stale delivery can follow.
    pub fn remove_waiter(&self, waiter: &Waiter) {
        match waiter {
            Waiter::Sink(s) => self.remove_sink(s),
            Waiter::Handler(h) => self.remove_handler(h),
        }
    }

    fn remove_sink(&self, sink: &Arc<dyn WaiterSink>) {
        let id = sink_id(sink);
        let mut state = self.state.lock().unwrap();
        while state.signaling == Some(id) {
            drop(state);
            std::thread::yield_now();
            state = self.state.lock().unwrap();
        }
        state.sinks.retain(|s| sink_id(s) != id);
    }

    fn remove_handler(&self, handler: &EventHandler) {
        let mut state = self.state.lock().unwrap();
        handler.purge_events(self.token());
        state.handlers.retain(|h| !h.same_handler(handler));
    }

    /// Remove every registered waiter. Called by components on close.
    pub(crate) fn remove_waiters(&self) {
        let mut state = self.state.lock().unwrap();
        while state.signaling.is_some() {
            drop(state);
            std::thread::yield_now();
            state = self.state.lock().unwrap();
        }
        state.sinks.clear();
        let token = self.token();
        for handler in state.handlers.drain(..) {
            handler.purge_events(token);
        }
    }

    /// Notify at most one waiter that more work is available.
    ///
    /// Raw sinks take precedence over handlers. The internal lock is
    /// released for the duration of a sink callback; a handler is
    /// notified by posting a [`BufferEvent`](crate::event::BufferEvent)
    /// to its loop.
    pub fn signal_availability(&self) {
        let mut state = self.state.lock().unwrap();
        if let Some(sink) = state.sinks.pop() {
            state.signaling = Some(sink_id(&sink));
            drop(state);
            sink.on_buffer_availability(self.token());
            self.state.lock().unwrap().signaling = None;
            return;
        }
        if let Some(handler) = state.handlers.pop() {
            handler.post_availability(self.token());
        }
    }

    #[cfg(test)]
    fn waiter_count(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.sinks.len() + state.handlers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::time::Duration;

    struct CountingSink {
        hits: AtomicUsize,
    }

    impl CountingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                hits: AtomicUsize::new(0),
            })
        }
    }

    impl WaiterSink for CountingSink {
        fn on_buffer_availability(&self, _from: WaitableToken) {
            self.hits.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn one_signal_wakes_one_waiter() {
        let w = Waitable::new();
        let a = CountingSink::new();
        let b = CountingSink::new();
        w.add_waiter(Waiter::sink(a.clone()));
        w.add_waiter(Waiter::sink(b.clone()));

        w.signal_availability();
        // Latest registration first.
        assert_eq!(a.hits.load(Ordering::SeqCst), 0);
        assert_eq!(b.hits.load(Ordering::SeqCst), 1);

        w.signal_availability();
        assert_eq!(a.hits.load(Ordering::SeqCst), 1);

        // No waiters left; signaling is a no-op.
        w.signal_availability();
        assert_eq!(a.hits.load(Ordering::SeqCst), 1);
        assert_eq!(b.hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn token_is_stable_and_distinct() {
        let a = Waitable::new();
        let b = Waitable::new();
        assert_eq!(a.token(), a.token());
        assert_ne!(a.token(), b.token());
    }

    #[test]
    fn remove_waiter_drops_registration() {
        let w = Waitable::new();
        let sink = CountingSink::new();
        w.add_waiter(Waiter::sink(sink.clone()));
        w.add_waiter(Waiter::sink(sink.clone()));
        assert_eq!(w.waiter_count(), 2);

        let waiter = Waiter::sink(sink.clone());
        w.remove_waiter(&waiter);
        assert_eq!(w.waiter_count(), 0);

        w.signal_availability();
        assert_eq!(sink.hits.load(Ordering::SeqCst), 0);
    }

    struct SlowSink {
        entered: Barrier,
        hold: Barrier,
    }

    impl WaiterSink for SlowSink {
        fn on_buffer_availability(&self, _from: WaitableToken) {
            self.entered.wait();
            self.hold.wait();
        }
    }

    #[test]
    fn remove_waiter_waits_for_inflight_callback() {
        let w = Arc::new(Waitable::new());
        let sink = Arc::new(SlowSink {
            entered: Barrier::new(2),
            hold: Barrier::new(2),
        });
        w.add_waiter(Waiter::sink(sink.clone()));

        let signaler = {
            let w = w.clone();
            std::thread::spawn(move || w.signal_availability())
        };

        // Callback is now in flight.
        sink.entered.wait();

        let removed = {
            let w = w.clone();
            let waiter = Waiter::sink(sink.clone() as Arc<dyn WaiterSink>);
            std::thread::spawn(move || w.remove_waiter(&waiter))
        };

        // remove_waiter must not return while the callback is blocked.
        std::thread::sleep(Duration::from_millis(50));
        assert!(!removed.is_finished());

        sink.hold.wait();
        removed.join().unwrap();
        signaler.join().unwrap();
    }
}
