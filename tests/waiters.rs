//! Waiter-protocol scenarios: competition for a dry pool, handler
//! withdrawal, and lease inventory accounting.

use aqueduct::event::EventLoop;
use aqueduct::pool::BufferPool;
use aqueduct::reader::{ReadResult, Reader, StringReader};
use aqueduct::waitable::{Waiter, WaiterSink, WaitableToken};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct CountingSink {
    hits: AtomicUsize,
}

impl CountingSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            hits: AtomicUsize::new(0),
        })
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl WaiterSink for CountingSink {
    fn on_buffer_availability(&self, _from: WaitableToken) {
        self.hits.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn one_release_resumes_exactly_one_of_two_waiting_readers() {
    let pool = BufferPool::with_config(1, 4096, false).unwrap();
    let reader_a = StringReader::new("a", &pool, vec![b'a'; 100]);
    let reader_b = StringReader::new("b", &pool, vec![b'b'; 100]);

    let sink_a = CountingSink::new();
    let sink_b = CountingSink::new();
    let waiter_a = Waiter::sink(sink_a.clone());
    let waiter_b = Waiter::sink(sink_b.clone());

    // Take the only buffer so both readers end up waiting.
    let outside = pool.try_get_buffer().unwrap();
    assert!(matches!(
        reader_a.get_buffer(&waiter_a).unwrap(),
        ReadResult::Wait
    ));
    assert!(matches!(
        reader_b.get_buffer(&waiter_b).unwrap(),
        ReadResult::Wait
    ));

    // Inventory: one lease outside, none free.
    assert_eq!(pool.free_buffers(), 0);

    // One release wakes exactly one reader.
    drop(outside);
    assert_eq!(sink_a.hits() + sink_b.hits(), 1);

    // The resumed reader gets data; the other still waits.
    let (resumed, parked, parked_waiter, parked_sink): (&StringReader, _, _, _) =
        if sink_a.hits() == 1 {
            (&reader_a, &reader_b, &waiter_b, &sink_b)
        } else {
            (&reader_b, &reader_a, &waiter_a, &sink_a)
        };
    let lease = match resumed.get_buffer(&Waiter::sink(CountingSink::new())).unwrap() {
        ReadResult::Data(lease) => lease,
        _ => panic!("resumed reader should produce data"),
    };

    assert!(matches!(
        parked.get_buffer(parked_waiter).unwrap(),
        ReadResult::Wait
    ));

    // The second release reaches the still-parked reader.
    drop(lease);
    assert_eq!(parked_sink.hits(), 1);
}

#[test]
fn withdrawn_handler_never_sees_the_stale_event() {
    let pool = BufferPool::with_config(1, 4096, false).unwrap();
    let el = EventLoop::new();
    let fired = Arc::new(AtomicUsize::new(0));
    let handler = {
        let fired = fired.clone();
        el.handler(move |_| {
            fired.fetch_add(1, Ordering::SeqCst);
        })
    };

    // Park the handler on the dry pool, then refill: an event is posted.
    let outside = pool.try_get_buffer().unwrap();
    let waiter = Waiter::handler(handler.clone());
    assert!(pool.get_buffer(&waiter).is_none());
    drop(outside);
    assert_eq!(el.pending(), 1);

    // Withdraw before the loop runs: the event must be purged.
    pool.remove_waiter(&waiter);
    assert_eq!(el.pending(), 0);
    assert_eq!(el.dispatch_pending(), 0);
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn handler_withdrawal_keeps_other_sources_pending() {
    let pool_a = BufferPool::with_config(1, 4096, false).unwrap();
    let pool_b = BufferPool::with_config(1, 4096, false).unwrap();
    let el = EventLoop::new();
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let handler = {
        let seen = seen.clone();
        el.handler(move |ev| seen.lock().unwrap().push(ev.source))
    };
    let waiter = Waiter::handler(handler);

    let hold_a = pool_a.try_get_buffer().unwrap();
    let hold_b = pool_b.try_get_buffer().unwrap();
    assert!(pool_a.get_buffer(&waiter).is_none());
    assert!(pool_b.get_buffer(&waiter).is_none());
    drop(hold_a);
    drop(hold_b);
    assert_eq!(el.pending(), 2);

    // Withdrawing from pool A only purges pool A's event.
    pool_a.remove_waiter(&waiter);
    assert_eq!(el.pending(), 1);
    el.dispatch_pending();
    assert_eq!(seen.lock().unwrap().as_slice(), &[pool_b.token()]);
}

#[test]
fn lease_inventory_is_conserved_across_a_pipeline() {
    let pool = BufferPool::with_config(3, 4096, false).unwrap();
    let reader = StringReader::new("src", &pool, vec![7u8; 10_000]);
    let waiter = Waiter::sink(CountingSink::new());

    let mut held = Vec::new();
    loop {
        match reader.get_buffer(&waiter).unwrap() {
            ReadResult::Data(lease) => held.push(lease),
            ReadResult::Eof => break,
            ReadResult::Wait => break,
        }
        assert_eq!(pool.free_buffers() + held.len(), 3);
    }

    held.clear();
    assert_eq!(pool.free_buffers(), 3);
}
