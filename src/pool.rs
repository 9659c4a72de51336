//! Cooperative task pool with keyed-priority scheduling.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// A bounded set of cooperative workers running submitted tasks.
///
/// Tasks submitted through [`TaskPool::submit_ordered`] carry a key; a
/// pending task with a smaller key is always dequeued before one with a
/// larger key. Unkeyed tasks run in submission order after any keyed work
/// queued at the same time. Workers are tokio tasks fixed at construction;
/// a pool of size zero runs every submitted task inline on the submitting
/// context instead.
///
/// Dequeue order is start order, not completion order: a task that
/// suspends lets later tasks overtake it when the pool has more than one
/// worker.
pub struct TaskPool {
    inner: Arc<PoolInner>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Clone for TaskPool {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            workers: Arc::clone(&self.workers),
        }
    }
}

struct PoolInner {
    size: usize,
    run_queue: Mutex<BinaryHeap<Job>>,
    wakeup: Notify,
    stop: AtomicBool,
    next_seq: AtomicU64,
}

struct Job {
    key: u64,
    seq: u64,
    work: BoxFuture<'static, ()>,
}

impl Job {
    fn rank(&self) -> (u64, u64) {
        (self.key, self.seq)
    }
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.rank() == other.rank()
    }
}

impl Eq for Job {}

impl PartialOrd for Job {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Job {
    // BinaryHeap is a max-heap; invert so the smallest (key, seq) wins.
    fn cmp(&self, other: &Self) -> Ordering {
        other.rank().cmp(&self.rank())
    }
}

impl TaskPool {
    pub fn new(size: usize) -> Self {
        let inner = Arc::new(PoolInner {
            size,
            run_queue: Mutex::new(BinaryHeap::new()),
            wakeup: Notify::new(),
            stop: AtomicBool::new(false),
            next_seq: AtomicU64::new(0),
        });
        let workers = (0..size)
            .map(|_| {
                let inner = Arc::clone(&inner);
                tokio::spawn(worker_loop(inner))
            })
            .collect();
        Self {
            inner,
            workers: Arc::new(Mutex::new(workers)),
        }
    }

    /// Number of workers this pool was built with.
    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Submit an unkeyed task (FIFO among unkeyed tasks).
    pub async fn submit<F>(&self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.enqueue(u64::MAX, work).await;
    }

    /// Submit a task keyed for priority: pending tasks with smaller keys
    /// are dequeued first.
    pub async fn submit_ordered<F>(&self, key: u64, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.enqueue(key, work).await;
    }

    async fn enqueue<F>(&self, key: u64, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.inner.size == 0 {
            work.await;
            return;
        }
        let seq = self.inner.next_seq.fetch_add(1, AtomicOrdering::Relaxed);
        self.inner.run_queue.lock().push(Job {
            key,
            seq,
            work: Box::pin(work),
        });
        self.inner.wakeup.notify_one();
    }

    /// Run the queue dry, then stop and join every worker. Tasks submitted
    /// after this call will never run.
    pub async fn shutdown(&self) {
        self.inner.stop.store(true, AtomicOrdering::Release);
        self.inner.wakeup.notify_waiters();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let _ = worker.await;
        }
    }
}

impl fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskPool")
            .field("size", &self.inner.size)
            .field("pending", &self.inner.run_queue.lock().len())
            .finish()
    }
}

async fn worker_loop(inner: Arc<PoolInner>) {
    loop {
        let job = inner.run_queue.lock().pop();
        if let Some(job) = job {
            job.work.await;
            continue;
        }

        // Register interest before re-checking, so a notify between the
        // check and the await is not lost.
        let notified = inner.wakeup.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if inner.stop.load(AtomicOrdering::Acquire) {
            if inner.run_queue.lock().is_empty() {
                return;
            }
            continue;
        }
        if !inner.run_queue.lock().is_empty() {
            continue;
        }
        notified.await;
    }
}
