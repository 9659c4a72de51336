//! Producer-side pipeline.
//!
//! This module provides you:
//!
//! - **validation + routing:** every pushed event is checked by the topic's
//!   validator and routed to a partition by its selector, on the producer's
//!   task pool.
//! - **batching:** one active batch queue per partition packs events into
//!   bulk-exposable batches and sends them in FIFO order.
//! - **delivery tracking:** each push hands back a [`Delivery`] resolving
//!   to the server-assigned [`EventId`] (or the failure that stopped it).
//!
//! # Data Flow
//!
//! ```text
//! ---(push)----> [validate] --> [select partition] --> ActiveBatchQueue
//! <-(Delivery)-o                                         |  open batch
//!              ║                                         v
//!              ║                                   [sender worker]
//!              o-----------(EventId per event)-----------o send_batch RPC
//! ```
//!
//! With an adaptive batch size the sender coalesces whatever it finds on
//! every wakeup; with a fixed batch size only sealed batches are sent and
//! each returned [`Delivery`] carries a hook that forces a flush the first
//! time it is awaited, so a lone event cannot wait forever.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tracing::{debug, trace};

use crate::client::error::Error;
use crate::client::topic::TopicHandle;
use crate::data::Data;
use crate::event::EventId;
use crate::metadata::Metadata;
use crate::pool::TaskPool;
use crate::promise::{Delivery, Promise};
use crate::transport::PartitionIdentity;

mod batch;
mod queue;

use queue::ActiveBatchQueue;

/// How many events a batch accumulates before it is sealed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchSize {
    /// The sender decides: any push is a flush opportunity.
    Adaptive,
    /// Seal after exactly this many events.
    Fixed(NonZeroUsize),
}

impl BatchSize {
    pub fn is_adaptive(&self) -> bool {
        matches!(self, Self::Adaptive)
    }
}

impl Default for BatchSize {
    fn default() -> Self {
        Self::Adaptive
    }
}

/// Whether pushes of one producer keep their submission order through the
/// task pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PushOrdering {
    /// Routing tasks are keyed by push sequence, so they reach their
    /// partition queues in push order whenever the pool dequeues in order.
    Strict,
    /// Routing tasks run FIFO among themselves but may be overtaken by
    /// keyed work sharing the pool.
    #[default]
    Loose,
}

/// Builder for [`Producer`], obtained from
/// [`TopicHandle::producer`](crate::client::topic::TopicHandle::producer).
#[derive(Debug)]
pub struct ProducerBuilder {
    topic: TopicHandle,
    name: String,
    batch_size: BatchSize,
    ordering: PushOrdering,
    pool: Option<TaskPool>,
}

impl ProducerBuilder {
    pub(crate) fn new(topic: TopicHandle, name: String) -> Self {
        Self {
            topic,
            name,
            batch_size: BatchSize::Adaptive,
            ordering: PushOrdering::default(),
            pool: None,
        }
    }

    pub fn batch_size(self, batch_size: BatchSize) -> Self {
        Self { batch_size, ..self }
    }

    pub fn ordering(self, ordering: PushOrdering) -> Self {
        Self { ordering, ..self }
    }

    /// Pool running this producer's routing tasks. Defaults to a pool of
    /// size zero, which runs them inline on the pushing task.
    pub fn thread_pool(self, pool: TaskPool) -> Self {
        Self {
            pool: Some(pool),
            ..self
        }
    }

    pub fn build(self) -> Producer {
        Producer {
            inner: Arc::new(ProducerInner {
                name: self.name,
                topic: self.topic,
                batch_size: self.batch_size,
                ordering: self.ordering,
                pool: self.pool.unwrap_or_else(|| TaskPool::new(0)),
                queues: Mutex::new(HashMap::new()),
                posted: Mutex::new(0),
                posted_zero: Notify::new(),
                push_seq: AtomicU64::new(0),
            }),
        }
    }
}

/// Per-topic producer: validates, routes, and batches pushed events.
///
/// Cloning is cheap and clones share the same partition queues.
#[derive(Debug, Clone)]
pub struct Producer {
    inner: Arc<ProducerInner>,
}

#[derive(Debug)]
struct ProducerInner {
    name: String,
    topic: TopicHandle,
    batch_size: BatchSize,
    ordering: PushOrdering,
    pool: TaskPool,
    queues: Mutex<HashMap<PartitionIdentity, Arc<ActiveBatchQueue>>>,
    /// Routing tasks submitted but not yet deposited into a queue.
    posted: Mutex<u64>,
    posted_zero: Notify,
    push_seq: AtomicU64,
}

impl Producer {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn topic(&self) -> &TopicHandle {
        &self.inner.topic
    }

    pub fn batch_size(&self) -> BatchSize {
        self.inner.batch_size
    }

    pub fn thread_pool(&self) -> &TaskPool {
        &self.inner.pool
    }

    /// Queue one event for publication.
    ///
    /// The returned [`Delivery`] resolves with the server-assigned
    /// [`EventId`] once the event's batch has been accepted, or with the
    /// error that kept it out of a batch. The call itself only suspends for
    /// task submission (and runs the routing task inline when the pool has
    /// zero workers).
    pub async fn push(&self, metadata: Metadata, data: Data) -> Delivery<EventId> {
        let (promise, delivery) = match self.inner.batch_size {
            BatchSize::Adaptive => Promise::pair(),
            BatchSize::Fixed(_) => {
                let weak = Arc::downgrade(&self.inner);
                Promise::pair_with_hook(move || {
                    // Waiting on an unflushed event in fixed-size mode must
                    // force a flush or the wait could never end.
                    if let Some(inner) = weak.upgrade() {
                        trace!(producer = %inner.name, "delivery awaited, forcing flush");
                        tokio::spawn(async move { inner.flush().await });
                    }
                })
            }
        };

        *self.inner.posted.lock().await += 1;

        let inner = Arc::clone(&self.inner);
        let task = async move { inner.run_push(metadata, data, promise).await };
        match self.inner.ordering {
            PushOrdering::Strict => {
                let seq = self.inner.push_seq.fetch_add(1, AtomicOrdering::Relaxed);
                self.inner.pool.submit_ordered(seq, task).await;
            }
            PushOrdering::Loose => self.inner.pool.submit(task).await,
        }

        delivery
    }

    /// Wait until every already-submitted push has reached its partition
    /// queue, then ask every queue to drain. The drain itself is observed
    /// by awaiting the deliveries.
    pub async fn flush(&self) {
        self.inner.flush().await;
    }

    /// Flush, then stop every partition queue and wait for their workers
    /// to exit. All outstanding deliveries are settled first.
    pub async fn close(&self) {
        self.inner.flush().await;
        let queues: Vec<_> = {
            let queues = self.inner.queues.lock().await;
            queues.values().map(Arc::clone).collect()
        };
        for queue in queues {
            queue.stop().await;
        }
    }
}

impl ProducerInner {
    /// The body of one routing task. Never escapes with an error: every
    /// failure lands in the promise.
    async fn run_push(&self, metadata: Metadata, data: Data, promise: Promise<EventId>) {
        match self.route(&metadata, &data).await {
            Ok(queue) => {
                queue
                    .push(
                        &metadata,
                        self.topic.serializer().as_ref(),
                        &data,
                        promise,
                    )
                    .await;
            }
            Err(e) => promise.set_error(e),
        }

        let reached_zero = {
            let mut posted = self.posted.lock().await;
            *posted -= 1;
            *posted == 0
        };
        if reached_zero {
            self.posted_zero.notify_waiters();
        }
    }

    async fn route(&self, metadata: &Metadata, data: &Data) -> Result<Arc<ActiveBatchQueue>, Error> {
        self.topic.validator().validate(metadata, data)?;
        let target = self.topic.selector().select_target_for(metadata)?;

        let mut queues = self.queues.lock().await;
        let queue = queues.entry(target.identity()).or_insert_with(|| {
            debug!(
                topic = %self.topic.name(),
                partition = ?target.identity(),
                "creating batch queue",
            );
            Arc::new(ActiveBatchQueue::new(
                self.topic.name().to_owned(),
                self.name.clone(),
                Arc::clone(self.topic.engine()),
                target.clone(),
                self.batch_size,
            ))
        });
        Ok(Arc::clone(queue))
    }

    async fn flush(&self) {
        loop {
            let notified = self.posted_zero.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if *self.posted.lock().await == 0 {
                break;
            }
            notified.await;
        }

        let queues = self.queues.lock().await;
        for queue in queues.values() {
            queue.flush().await;
        }
    }
}
