//! Counting semaphore
//!
//! The pipeline threads rendezvous via counting semaphores (puller blocks
//! when the reservoir fills, the consumer blocks on the flywheel worker,
//! pre-roll blocks on occupancy). std has no semaphore, so this is the
//! usual Mutex + Condvar construction.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Counting semaphore.
pub struct Semaphore {
    count: Mutex<u32>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(initial: u32) -> Self {
        Self {
            count: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    /// Block until a signal is available, then consume it.
    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cond.wait(count).unwrap();
        }
        *count -= 1;
    }

    /// As `wait`, but gives up after `timeout`. Returns false on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            let (guard, result) = self.cond.wait_timeout(count, timeout).unwrap();
            count = guard;
            if result.timed_out() && *count == 0 {
                return false;
            }
        }
        *count -= 1;
        true
    }

    /// Make one signal available, waking a waiter if there is one.
    pub fn signal(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.cond.notify_one();
    }

    /// Discard all pending signals, returning how many were dropped.
    pub fn clear(&self) -> u32 {
        let mut count = self.count.lock().unwrap();
        let dropped = *count;
        *count = 0;
        dropped
    }
}
