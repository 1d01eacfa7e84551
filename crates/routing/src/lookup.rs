use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
};

use codec::Key;
use parking_lot::{Condvar, Mutex};

/// One queued datastore probe.
pub struct LookupJob {
    pub block_type: u32,
    pub keys: Vec<Key>,
}

struct Inner {
    queue: Mutex<VecDeque<LookupJob>>,
    signal: Condvar,
    closed: AtomicBool,
}

/// A single background thread draining local-lookup jobs.
///
/// Datastore probes can be slow IO; running them here keeps them off the
/// transport receive path. Jobs run through the injected processor, which
/// typically probes the store and hands anything found straight to the
/// query manager.
///
/// Dropping the worker discards queued jobs and joins the thread.
///
/// # Test
///
/// ```
/// use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
/// use gap_server_routing::lookup::{LookupJob, LookupWorker};
///
/// let count = Arc::new(AtomicUsize::new(0));
/// let count_ = count.clone();
/// let worker = LookupWorker::new(move |_| {
///     count_.fetch_add(1, Ordering::SeqCst);
/// });
///
/// worker.queue(LookupJob {
///     block_type: 0,
///     keys: vec![[1u8; 64].into()],
/// });
///
/// drop(worker);
/// assert!(count.load(Ordering::SeqCst) <= 1);
/// ```
pub struct LookupWorker {
    inner: Arc<Inner>,
    handle: Option<JoinHandle<()>>,
}

impl LookupWorker {
    pub fn new<F>(processor: F) -> Self
    where
        F: Fn(LookupJob) + Send + 'static,
    {
        let inner = Arc::new(Inner {
            queue: Mutex::new(VecDeque::new()),
            signal: Condvar::new(),
            closed: AtomicBool::new(false),
        });

        let inner_ = inner.clone();
        let handle = thread::spawn(move || {
            loop {
                let job = {
                    let mut queue = inner_.queue.lock();
                    loop {
                        if let Some(job) = queue.pop_front() {
                            break job;
                        }

                        if inner_.closed.load(Ordering::Acquire) {
                            return;
                        }

                        inner_.signal.wait(&mut queue);
                    }
                };

                processor(job);
            }
        });

        Self {
            inner,
            handle: Some(handle),
        }
    }

    pub fn queue(&self, job: LookupJob) {
        if self.inner.closed.load(Ordering::Acquire) {
            return;
        }

        self.inner.queue.lock().push_back(job);
        self.inner.signal.notify_one();
    }
}

impl Drop for LookupWorker {
    fn drop(&mut self) {
        // Drain without processing: a lookup nobody waits for is wasted
        // IO.
        self.inner.closed.store(true, Ordering::Release);
        self.inner.queue.lock().clear();
        self.inner.signal.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
