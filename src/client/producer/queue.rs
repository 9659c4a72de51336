//! Per-partition batching pipeline and its sender worker.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex, Notify};
use tracing::{debug, trace};

use super::batch::EventBatch;
use super::BatchSize;
use crate::client::error::Error;
use crate::data::Data;
use crate::event::EventId;
use crate::metadata::Metadata;
use crate::promise::Promise;
use crate::serializer::Serializer;
use crate::transport::{BulkEngine, PartitionTarget, SendBatchArgs};

/// Producer-side pipeline of one partition: a FIFO of open and sealed
/// batches plus the worker that sends them.
///
/// Only the tail batch accepts events. The worker pops strictly from the
/// head, so batches leave in the order they were filled and every event of
/// a popped batch resolves before any event of the next one.
pub(crate) struct ActiveBatchQueue {
    shared: Arc<QueueShared>,
    terminated: Mutex<Option<oneshot::Receiver<()>>>,
}

struct QueueShared {
    topic_name: String,
    producer_name: String,
    engine: Arc<dyn BulkEngine>,
    target: PartitionTarget,
    batch_size: BatchSize,
    state: Mutex<QueueState>,
    wakeup: Notify,
    need_stop: AtomicBool,
    running: AtomicBool,
}

#[derive(Default)]
struct QueueState {
    batches: VecDeque<EventBatch>,
    request_flush: bool,
}

enum Step {
    Send(EventBatch),
    Wait,
    Exit,
}

impl ActiveBatchQueue {
    pub(crate) fn new(
        topic_name: String,
        producer_name: String,
        engine: Arc<dyn BulkEngine>,
        target: PartitionTarget,
        batch_size: BatchSize,
    ) -> Self {
        let shared = Arc::new(QueueShared {
            topic_name,
            producer_name,
            engine,
            target,
            batch_size,
            state: Mutex::new(QueueState::default()),
            wakeup: Notify::new(),
            need_stop: AtomicBool::new(false),
            running: AtomicBool::new(true),
        });
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(sender_loop(Arc::clone(&shared), done_tx));
        Self {
            shared,
            terminated: Mutex::new(Some(done_rx)),
        }
    }

    /// Append one event to the tail batch, sealing it first if a fixed
    /// batch size has been reached.
    pub(crate) async fn push(
        &self,
        metadata: &Metadata,
        serializer: &dyn Serializer,
        data: &Data,
        promise: Promise<EventId>,
    ) {
        let adaptive = self.shared.batch_size.is_adaptive();
        let mut need_notification = adaptive;
        {
            let mut state = self.shared.state.lock().await;
            if state.batches.is_empty() {
                state.batches.push_back(EventBatch::new());
            }
            if let BatchSize::Fixed(limit) = self.shared.batch_size {
                let tail_full = state
                    .batches
                    .back()
                    .is_some_and(|b| b.count() as usize >= limit.get());
                if tail_full {
                    state.batches.push_back(EventBatch::new());
                    need_notification = true;
                }
            }
            let tail = state
                .batches
                .back_mut()
                .expect("tail batch was just ensured");
            // A push failure has already been routed to the promise.
            let _ = tail.push(metadata, serializer, data, promise);
        }
        if need_notification {
            self.shared.wakeup.notify_one();
        }
    }

    /// Ask the worker to drain whatever is queued, sealed or not. Returns
    /// immediately; the drain is observed by waiting on the deliveries.
    pub(crate) async fn flush(&self) {
        if !self.shared.running.load(Ordering::Acquire) {
            return;
        }
        self.shared.state.lock().await.request_flush = true;
        self.shared.wakeup.notify_one();
    }

    /// Stop the worker once the FIFO is empty and wait for it to exit.
    pub(crate) async fn stop(&self) {
        self.shared.need_stop.store(true, Ordering::Release);
        self.shared.wakeup.notify_one();
        let terminated = self.terminated.lock().await.take();
        if let Some(terminated) = terminated {
            let _ = terminated.await;
        }
    }
}

impl Drop for ActiveBatchQueue {
    fn drop(&mut self) {
        // Cannot wait here; the worker drains the FIFO and exits on its own.
        self.shared.need_stop.store(true, Ordering::Release);
        self.shared.wakeup.notify_one();
    }
}

impl std::fmt::Debug for ActiveBatchQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveBatchQueue")
            .field("topic", &self.shared.topic_name)
            .field("target", &self.shared.target.identity())
            .field("batch_size", &self.shared.batch_size)
            .finish()
    }
}

async fn sender_loop(shared: Arc<QueueShared>, terminated: oneshot::Sender<()>) {
    debug!(
        topic = %shared.topic_name,
        partition = ?shared.target.identity(),
        "sender worker started",
    );
    loop {
        // Register interest before inspecting state so a notification
        // between the check and the await is not lost.
        let notified = shared.wakeup.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let step = {
            let stop = shared.need_stop.load(Ordering::Acquire);
            let mut state = shared.state.lock().await;
            let head_ready = match state.batches.front() {
                None => false,
                Some(head) => match shared.batch_size {
                    BatchSize::Adaptive => true,
                    BatchSize::Fixed(limit) => head.count() as usize >= limit.get(),
                },
            };
            if !(stop || state.request_flush || head_ready) {
                Step::Wait
            } else if let Some(batch) = state.batches.pop_front() {
                Step::Send(batch)
            } else {
                state.request_flush = false;
                if stop {
                    Step::Exit
                } else {
                    Step::Wait
                }
            }
        };

        match step {
            Step::Send(batch) => {
                send_batch(&shared, batch).await;
                shared.state.lock().await.request_flush = false;
            }
            Step::Wait => notified.await,
            Step::Exit => break,
        }
    }
    shared.running.store(false, Ordering::Release);
    debug!(
        topic = %shared.topic_name,
        partition = ?shared.target.identity(),
        "sender worker stopped",
    );
    let _ = terminated.send(());
}

/// Send one batch and settle all of its promises. Failures never escape:
/// they are delivered through the promises.
async fn send_batch(shared: &QueueShared, batch: EventBatch) {
    let bulk = match batch.expose(shared.engine.as_ref()) {
        Ok(Some(bulk)) => bulk,
        Ok(None) => return,
        Err(e) => {
            batch.fail(Error::Exposure(e));
            return;
        }
    };
    let args = SendBatchArgs {
        topic_name: shared.topic_name.clone(),
        producer_name: shared.producer_name.clone(),
        count: batch.count(),
        total_data_size: batch.total_data_size(),
        data_offset: batch.data_offset(),
        bulk,
    };
    trace!(count = args.count, data = args.total_data_size, "sending batch");
    match shared.target.endpoint().send_batch(args).await {
        Ok(Ok(first_id)) => batch.complete(first_id),
        Ok(Err(server)) => batch.fail(Error::Server(server)),
        Err(rpc) => batch.fail(Error::Rpc(rpc)),
    }
}
