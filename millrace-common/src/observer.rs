//! Notification thread
//!
//! Observer callbacks (buffering state changed, delay applied, ...) must
//! never run on the pipeline's puller or consumer threads: a callback that
//! re-entered the pipeline from there could deadlock or stall the
//! real-time path. Elements instead register a callback here and schedule
//! it by id; a dedicated thread delivers it.
//!
//! Scheduling is coalescing: scheduling an id that is already pending is a
//! no-op, so a burst of state changes produces at most one callback run
//! per edge the callback itself observes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::debug;

use crate::sync::Semaphore;

/// Handle returned by [`NotifierThread::register`], used to schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotifyId(usize);

struct Entry {
    pending: AtomicBool,
    callback: Box<dyn Fn() + Send + Sync>,
}

struct Shared {
    entries: Mutex<Vec<Arc<Entry>>>,
    sem: Semaphore,
    exit: AtomicBool,
}

/// Dedicated thread that delivers registered observer callbacks.
pub struct NotifierThread {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl NotifierThread {
    pub fn new(name: &str) -> Self {
        let shared = Arc::new(Shared {
            entries: Mutex::new(Vec::new()),
            sem: Semaphore::new(0),
            exit: AtomicBool::new(false),
        });
        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || Self::run(thread_shared))
            .expect("failed to spawn notifier thread");
        debug!("Notifier thread '{}' started", name);
        Self {
            shared,
            handle: Some(handle),
        }
    }

    /// Register a callback; the returned id is passed to [`schedule`].
    ///
    /// [`schedule`]: NotifierThread::schedule
    pub fn register(&self, callback: Box<dyn Fn() + Send + Sync>) -> NotifyId {
        let mut entries = self.shared.entries.lock().unwrap();
        entries.push(Arc::new(Entry {
            pending: AtomicBool::new(false),
            callback,
        }));
        NotifyId(entries.len() - 1)
    }

    /// Request that the callback for `id` runs (soon) on the notifier
    /// thread. Cheap and non-blocking; safe from any thread.
    pub fn schedule(&self, id: NotifyId) {
        let entry = {
            let entries = self.shared.entries.lock().unwrap();
            Arc::clone(&entries[id.0])
        };
        if !entry.pending.swap(true, Ordering::AcqRel) {
            self.shared.sem.signal();
        }
    }

    fn run(shared: Arc<Shared>) {
        loop {
            shared.sem.wait();
            if shared.exit.load(Ordering::Acquire) {
                break;
            }
            let entries: Vec<Arc<Entry>> = shared.entries.lock().unwrap().clone();
            for entry in entries {
                if entry.pending.swap(false, Ordering::AcqRel) {
                    (entry.callback)();
                }
            }
        }
    }
}

impl Drop for NotifierThread {
    fn drop(&mut self) {
        self.shared.exit.store(true, Ordering::Release);
        self.shared.sem.signal();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
