//! Consumer-side pipeline.
//!
//! One pull worker per partition target keeps a long-lived `request_events`
//! RPC open; the server streams batches back through [`EventSink`]. Each
//! received batch fans out into per-event deserialize tasks keyed by
//! [`EventId`], and finished events meet user [`Consumer::pull`] calls in a
//! single deque that buffers whichever side is ahead.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::{Buf, Bytes};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::client::error::Error;
use crate::client::producer::BatchSize;
use crate::client::topic::TopicHandle;
use crate::data::{Data, DataBroker, DataDescriptor, DataSelector, NullDataBroker, NullDataSelector};
use crate::event::{Event, EventId};
use crate::pool::TaskPool;
use crate::promise::{Delivery, Promise};
use crate::serializer::CodecError;
use crate::transport::{
    BatchDelivery, EventSink, PartitionTarget, RequestEventsArgs, RpcError, TransportError,
};

/// Builder for [`Consumer`], obtained from
/// [`TopicHandle::consumer`](crate::client::topic::TopicHandle::consumer).
#[derive(Debug)]
pub struct ConsumerBuilder {
    topic: TopicHandle,
    name: String,
    batch_size: BatchSize,
    pool: Option<TaskPool>,
    data_broker: Arc<dyn DataBroker>,
    data_selector: Arc<dyn DataSelector>,
    targets: Option<Vec<PartitionTarget>>,
}

impl ConsumerBuilder {
    pub(crate) fn new(topic: TopicHandle, name: String) -> Self {
        Self {
            topic,
            name,
            batch_size: BatchSize::Adaptive,
            pool: None,
            data_broker: Arc::new(NullDataBroker),
            data_selector: Arc::new(NullDataSelector),
            targets: None,
        }
    }

    /// Preferred number of events per streamed batch.
    pub fn batch_size(self, batch_size: BatchSize) -> Self {
        Self { batch_size, ..self }
    }

    /// Pool running this consumer's deserialize tasks. Defaults to a pool
    /// of size zero, which runs them inline in reception order.
    pub fn thread_pool(self, pool: TaskPool) -> Self {
        Self {
            pool: Some(pool),
            ..self
        }
    }

    pub fn data_broker(self, broker: Arc<dyn DataBroker>) -> Self {
        Self {
            data_broker: broker,
            ..self
        }
    }

    pub fn data_selector(self, selector: Arc<dyn DataSelector>) -> Self {
        Self {
            data_selector: selector,
            ..self
        }
    }

    /// Subscribe to a subset of the topic's partition targets. Defaults to
    /// all of them.
    pub fn targets(self, targets: Vec<PartitionTarget>) -> Self {
        Self {
            targets: Some(targets),
            ..self
        }
    }

    /// Build the consumer and start one pull worker per target.
    pub fn build(self) -> Consumer {
        let targets = self
            .targets
            .unwrap_or_else(|| self.topic.targets().to_vec());
        let inner = Arc::new(ConsumerInner {
            name: self.name,
            id: Uuid::new_v4(),
            topic: self.topic,
            batch_size: self.batch_size,
            pool: self.pool.unwrap_or_else(|| TaskPool::new(0)),
            data_broker: self.data_broker,
            data_selector: self.data_selector,
            targets,
            queue: Mutex::new(CreditQueue::default()),
            completions: Mutex::new(Vec::new()),
        });

        for index in 0..inner.targets.len() {
            let (done_tx, done_rx) = oneshot::channel();
            inner.completions.lock().push(done_rx);
            tokio::spawn(pull_from(Arc::clone(&inner), index, done_tx));
        }

        Consumer { inner }
    }
}

/// Per-topic consumer pulling events from a set of partition targets.
#[derive(Debug, Clone)]
pub struct Consumer {
    inner: Arc<ConsumerInner>,
}

#[derive(Debug)]
struct ConsumerInner {
    name: String,
    id: Uuid,
    topic: TopicHandle,
    batch_size: BatchSize,
    pool: TaskPool,
    data_broker: Arc<dyn DataBroker>,
    data_selector: Arc<dyn DataSelector>,
    targets: Vec<PartitionTarget>,
    queue: Mutex<CreditQueue>,
    completions: Mutex<Vec<oneshot::Receiver<()>>>,
}

/// The rendezvous between arriving events and [`Consumer::pull`] calls.
///
/// When `user_credit` is set every slot is a promise created by a pull that
/// has not seen an event yet; otherwise every slot is a ready delivery
/// created by an event that has not seen a pull yet. The deque never mixes
/// the two regimes.
#[derive(Debug, Default)]
struct CreditQueue {
    slots: VecDeque<Slot>,
    user_credit: bool,
}

#[derive(Debug)]
enum Slot {
    /// Pending promise, created by a `pull`.
    Waiting(Promise<Event>),
    /// Fulfilled delivery, created by an arriving event.
    Ready(Delivery<Event>),
}

impl Consumer {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Identity sent to topic managers; `remove_consumer` targets it.
    pub fn id(&self) -> Uuid {
        self.inner.id
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

    pub fn data_broker(&self) -> &Arc<dyn DataBroker> {
        &self.inner.data_broker
    }

    pub fn data_selector(&self) -> &Arc<dyn DataSelector> {
        &self.inner.data_selector
    }

    /// Obtain the next event.
    ///
    /// If events are already buffered the returned [`Delivery`] is
    /// immediately ready; otherwise it resolves when the next event
    /// arrives. Concurrent pulls are served oldest first.
    pub fn pull(&self) -> Delivery<Event> {
        let mut queue = self.inner.queue.lock();
        if queue.user_credit || queue.slots.is_empty() {
            let (promise, delivery) = Promise::pair();
            queue.slots.push_back(Slot::Waiting(promise));
            queue.user_credit = true;
            delivery
        } else {
            match queue.slots.pop_front() {
                Some(Slot::Ready(delivery)) => {
                    queue.user_credit = false;
                    delivery
                }
                _ => unreachable!("transport-credit queue must hold ready deliveries"),
            }
        }
    }

    /// Ask every partition to end this consumer's event stream, then wait
    /// for all pull workers to finish.
    pub async fn join(&self) {
        for target in &self.inner.targets {
            match target.endpoint().remove_consumer(self.inner.id).await {
                Ok(Ok(())) => {}
                Ok(Err(server)) => {
                    warn!(partition = ?target.identity(), error = %server, "remove_consumer rejected")
                }
                Err(rpc) => {
                    warn!(partition = ?target.identity(), error = %rpc, "remove_consumer failed")
                }
            }
        }
        let completions = std::mem::take(&mut *self.inner.completions.lock());
        for done in completions {
            let _ = done.await;
        }
    }
}

impl ConsumerInner {
    /// Hand one settled event (or arrival failure) to the credit queue.
    fn deliver(&self, result: Result<Event, Error>) {
        let mut queue = self.queue.lock();
        if !queue.user_credit || queue.slots.is_empty() {
            let (promise, delivery) = Promise::pair();
            promise.settle(result);
            queue.slots.push_back(Slot::Ready(delivery));
            queue.user_credit = false;
        } else {
            match queue.slots.pop_front() {
                Some(Slot::Waiting(promise)) => promise.settle(result),
                _ => unreachable!("user-credit queue must hold pending promises"),
            }
            queue.user_credit = true;
        }
    }

    /// Reconstruct one event from the pulled batch regions.
    fn deserialize_event(
        &self,
        batch: &ConsumerBatch,
        index: usize,
        event_id: EventId,
        partition: usize,
    ) -> Result<Event, Error> {
        let meta_bytes = batch.meta_slice(index)?;
        let metadata = self.topic.serializer().deserialize(&meta_bytes)?;
        let desc_bytes = batch.desc_slice(index)?;
        let descriptor = DataDescriptor::decode(&desc_bytes)?;

        // Data provisioning: the selector narrows the described region and
        // the broker reserves memory for it. The bulk pull of the selected
        // bytes is not wired up yet.
        let data = match self.data_selector.select(&metadata, &descriptor) {
            Some(wanted) => self.data_broker.allocate(&metadata, &wanted)?,
            None => Data::new(),
        };

        Ok(Event::new(event_id, partition, metadata, descriptor, data))
    }
}

/// Body of one pull worker.
async fn pull_from(inner: Arc<ConsumerInner>, index: usize, completed: oneshot::Sender<()>) {
    let target = inner.targets[index].clone();
    debug!(
        topic = %inner.topic.name(),
        partition = ?target.identity(),
        "pull worker started",
    );
    let args = RequestEventsArgs {
        topic_name: inner.topic.name().to_owned(),
        target_index: index,
        consumer_id: inner.id,
        consumer_name: inner.name.clone(),
        max_events: 0,
        batch_size: match inner.batch_size {
            BatchSize::Adaptive => 0,
            BatchSize::Fixed(limit) => limit.get() as u64,
        },
    };
    let sink: Arc<dyn EventSink> = Arc::new(ConsumerSink {
        inner: Arc::clone(&inner),
    });
    match target.endpoint().request_events(args, sink).await {
        Ok(Ok(())) => {}
        Ok(Err(server)) => {
            warn!(partition = ?target.identity(), error = %server, "event stream rejected")
        }
        Err(rpc) => warn!(partition = ?target.identity(), error = %rpc, "event stream failed"),
    }
    debug!(
        topic = %inner.topic.name(),
        partition = ?target.identity(),
        "pull worker stopped",
    );
    let _ = completed.send(());
}

/// The callback handle given to `request_events`.
struct ConsumerSink {
    inner: Arc<ConsumerInner>,
}

impl EventSink for ConsumerSink {
    fn recv_batch(&self, batch: BatchDelivery) -> BoxFuture<'_, Result<(), RpcError>> {
        Box::pin(handle_batch(Arc::clone(&self.inner), batch))
    }
}

/// Pull a streamed batch locally, then fan out one ordered deserialize task
/// per event. Returns once every event of the batch has been delivered.
async fn handle_batch(inner: Arc<ConsumerInner>, delivery: BatchDelivery) -> Result<(), RpcError> {
    let count = delivery.count as usize;
    trace!(count, first_id = delivery.first_id, "receiving batch");
    if count == 0 {
        return Ok(());
    }

    let batch = match ConsumerBatch::pull(&delivery, count).await {
        Ok(batch) => Arc::new(batch),
        Err(e) => {
            // Arrival failures surface through the next pulled delivery.
            warn!(error = %e, "failed to pull batch regions");
            inner.deliver(Err(Error::Exposure(e)));
            return Ok(());
        }
    };

    let mut completions = Vec::with_capacity(count);
    for index in 0..count {
        let event_id = delivery.first_id + index as u64;
        let (done_tx, done_rx) = oneshot::channel();
        completions.push(done_rx);
        let task_inner = Arc::clone(&inner);
        let task_batch = Arc::clone(&batch);
        let partition = delivery.target_index;
        inner
            .pool
            .submit_ordered(event_id, async move {
                let result =
                    task_inner.deserialize_event(&task_batch, index, event_id, partition);
                task_inner.deliver(result);
                let _ = done_tx.send(());
            })
            .await;
    }
    for done in completions {
        let _ = done.await;
    }
    Ok(())
}

/// The four batch regions pulled from the sender, plus per-event offsets.
#[derive(Debug)]
struct ConsumerBatch {
    meta_sizes: Vec<u64>,
    meta_buffer: Bytes,
    meta_offsets: Vec<usize>,
    desc_sizes: Vec<u64>,
    desc_buffer: Bytes,
    desc_offsets: Vec<usize>,
}

impl ConsumerBatch {
    async fn pull(delivery: &BatchDelivery, count: usize) -> Result<Self, TransportError> {
        let meta_sizes = parse_u64_le(delivery.meta_sizes.pull().await?);
        let meta_buffer = delivery.meta.pull().await?;
        let desc_sizes = parse_u64_le(delivery.data_desc_sizes.pull().await?);
        let desc_buffer = delivery.data_desc.pull().await?;
        if meta_sizes.len() != count || desc_sizes.len() != count {
            return Err(TransportError::Transfer(format!(
                "size arrays do not match the event count ({} and {} vs {count})",
                meta_sizes.len(),
                desc_sizes.len(),
            )));
        }
        let meta_offsets = prefix_sums(&meta_sizes);
        let desc_offsets = prefix_sums(&desc_sizes);
        Ok(Self {
            meta_sizes,
            meta_buffer,
            meta_offsets,
            desc_sizes,
            desc_buffer,
            desc_offsets,
        })
    }

    fn meta_slice(&self, index: usize) -> Result<Bytes, CodecError> {
        slice_region(
            &self.meta_buffer,
            self.meta_offsets[index],
            self.meta_sizes[index] as usize,
            "metadata",
        )
    }

    fn desc_slice(&self, index: usize) -> Result<Bytes, CodecError> {
        slice_region(
            &self.desc_buffer,
            self.desc_offsets[index],
            self.desc_sizes[index] as usize,
            "data descriptor",
        )
    }
}

fn slice_region(
    buffer: &Bytes,
    offset: usize,
    len: usize,
    what: &str,
) -> Result<Bytes, CodecError> {
    if offset + len > buffer.len() {
        return Err(CodecError::new(format!(
            "{what} region [{offset}, {offset}+{len}) exceeds the {} byte buffer",
            buffer.len()
        )));
    }
    Ok(buffer.slice(offset..offset + len))
}

fn parse_u64_le(mut bytes: Bytes) -> Vec<u64> {
    let mut values = Vec::with_capacity(bytes.len() / 8);
    while bytes.remaining() >= 8 {
        values.push(bytes.get_u64_le());
    }
    values
}

fn prefix_sums(sizes: &[u64]) -> Vec<usize> {
    let mut offsets = Vec::with_capacity(sizes.len());
    let mut at = 0usize;
    for size in sizes {
        offsets.push(at);
        at += *size as usize;
    }
    offsets
}
