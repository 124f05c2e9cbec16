// Bounded load queue feeding the loader thread

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};

/// Instruction to decode `name` for the cache slot `index`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadRequest {
    pub index: u32,
    pub generation: u32,
    pub name: String,
}

/// Counting wake-up signal
///
/// Each `post` lets exactly one `wait` return.
#[derive(Debug, Default)]
pub struct WakeSignal {
    count: Mutex<usize>,
    cond: Condvar,
}

impl WakeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one unit and wake a waiter
    pub fn post(&self) {
        *self.count.lock() += 1;
        self.cond.notify_one();
    }

    /// Block until a unit is available, then consume it
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.cond.wait(&mut count);
        }
        *count -= 1;
    }

    /// Units posted but not yet consumed
    pub fn pending(&self) -> usize {
        *self.count.lock()
    }
}

#[derive(Debug)]
struct Ring {
    slots: Vec<Option<LoadRequest>>,
    head: usize,
    tail: usize,
    count: usize,
}

/// Circular buffer of load requests with a wake signal for the consumer
///
/// Holds at most `capacity - 1` requests.
#[derive(Debug)]
pub struct LoadQueue {
    capacity: usize,
    ring: Mutex<Ring>,
    wake: WakeSignal,
    done: AtomicBool,
}

impl LoadQueue {
    /// Create a queue backed by `capacity` slots
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 2, "load queue needs at least two slots");
        Self {
            capacity,
            ring: Mutex::new(Ring {
                slots: (0..capacity).map(|_| None).collect(),
                head: 0,
                tail: capacity - 1,
                count: 0,
            }),
            wake: WakeSignal::new(),
            done: AtomicBool::new(false),
        }
    }

    /// Append a request and wake the loader
    ///
    /// A full queue hands the request back untouched.
    pub fn enqueue(&self, request: LoadRequest) -> Result<(), LoadRequest> {
        {
            let mut ring = self.ring.lock();
            if ring.count + 1 >= self.capacity {
                return Err(request);
            }
            ring.tail = (ring.tail + 1) % self.capacity;
            let tail = ring.tail;
            ring.slots[tail] = Some(request);
            ring.count += 1;
        }
        // Count is visible before the wake-up
        self.wake.post();
        Ok(())
    }

    /// Take the oldest request, if any
    pub fn dequeue(&self) -> Option<LoadRequest> {
        let mut ring = self.ring.lock();
        if ring.count == 0 {
            return None;
        }
        let head = ring.head;
        let request = ring.slots[head].take();
        ring.head = (head + 1) % self.capacity;
        ring.count -= 1;
        request
    }

    /// Block until there is work or shutdown; `false` means stop
    pub fn wait_for_work(&self) -> bool {
        self.wake.wait();
        !self.done.load(Ordering::Acquire)
    }

    /// Tell the consumer to stop after its current request
    pub fn shutdown(&self) {
        self.done.store(true, Ordering::Release);
        self.wake.post();
    }

    pub fn is_shut_down(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Number of waiting requests
    pub fn len(&self) -> usize {
        self.ring.lock().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of ring slots
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Wake units not yet consumed by the loader
    pub fn pending_wakes(&self) -> usize {
        self.wake.pending()
    }
}
