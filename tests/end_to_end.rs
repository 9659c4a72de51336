//! End-to-end produce/consume tests against an in-process topic manager.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::future::BoxFuture;
use serde_json::json;
use tokio::sync::Notify;
use uuid::Uuid;

use evstream::client::error::Error;
use evstream::client::producer::{BatchSize, PushOrdering};
use evstream::client::topic::TopicConfig;
use evstream::client::Client;
use evstream::data::{Data, DataDescriptor};
use evstream::event::EventId;
use evstream::metadata::Metadata;
use evstream::pool::TaskPool;
use evstream::transport::mem::{MemBulk, MemEngine};
use evstream::transport::{
    BatchDelivery, BulkRef, EventSink, PartitionTarget, Reply, RequestEventsArgs, RpcError,
    SendBatchArgs, ServerError, TopicAccept, TopicManagerEndpoint,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// One received `send_batch` frame, kept verbatim for wire assertions.
#[derive(Debug, Clone)]
struct ReceivedBatch {
    producer: String,
    count: u64,
    total_data_size: u64,
    data_offset: u64,
    frame: Bytes,
}

#[derive(Debug, Clone)]
struct StoredEvent {
    meta: Bytes,
    data: Bytes,
    desc: Bytes,
}

#[derive(Debug, Default)]
struct TopicStore {
    accept: Option<(Metadata, Metadata, Metadata)>,
    events: Vec<StoredEvent>,
}

/// In-process topic manager hosting one partition.
///
/// Events are appended to per-topic stores; consumers stream them back in
/// batches sized by their own hint.
#[derive(Debug)]
struct MemPartition {
    addr: String,
    topics: parking_lot::Mutex<HashMap<String, TopicStore>>,
    received: parking_lot::Mutex<Vec<ReceivedBatch>>,
    removed: parking_lot::Mutex<HashSet<Uuid>>,
    wakeup: Notify,
    fail_sends: bool,
}

impl MemPartition {
    fn new(addr: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            addr: addr.into(),
            topics: Default::default(),
            received: Default::default(),
            removed: Default::default(),
            wakeup: Notify::new(),
            fail_sends: false,
        })
    }

    fn failing(addr: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            addr: addr.into(),
            topics: Default::default(),
            received: Default::default(),
            removed: Default::default(),
            wakeup: Notify::new(),
            fail_sends: true,
        })
    }

    fn stored(&self, topic: &str) -> Vec<StoredEvent> {
        self.topics
            .lock()
            .get(topic)
            .map(|t| t.events.clone())
            .unwrap_or_default()
    }

    fn ingest(&self, args: &SendBatchArgs, frame: &Bytes) -> Result<EventId, ServerError> {
        let count = args.count as usize;
        let frame_len = frame.len() as u64;
        if args.data_offset + 2 * args.count * 8 + args.total_data_size != frame_len {
            return Err(ServerError::new(format!(
                "inconsistent frame: {frame_len} bytes for count={} data_offset={} total={}",
                args.count, args.data_offset, args.total_data_size
            )));
        }

        let mut meta_sizes = &frame[..count * 8];
        let meta_sizes: Vec<usize> =
            (0..count).map(|_| meta_sizes.get_u64_le() as usize).collect();
        let meta_region = &frame[count * 8..args.data_offset as usize];

        let mut offsets = &frame[args.data_offset as usize..args.data_offset as usize + count * 8];
        let offsets: Vec<usize> = (0..count).map(|_| offsets.get_u64_le() as usize).collect();
        let mut data_sizes =
            &frame[args.data_offset as usize + count * 8..args.data_offset as usize + 2 * count * 8];
        let data_sizes: Vec<usize> = (0..count).map(|_| data_sizes.get_u64_le() as usize).collect();
        let data_region = &frame[args.data_offset as usize + 2 * count * 8..];

        let mut topics = self.topics.lock();
        let store = topics.entry(args.topic_name.clone()).or_default();
        let first_id = store.events.len() as EventId;
        let mut meta_at = 0;
        for i in 0..count {
            let meta = Bytes::copy_from_slice(&meta_region[meta_at..meta_at + meta_sizes[i]]);
            meta_at += meta_sizes[i];
            let data = Bytes::copy_from_slice(&data_region[offsets[i]..offsets[i] + data_sizes[i]]);
            // The descriptor records where the payload landed in the store.
            let mut loc = BytesMut::new();
            loc.put_u64_le(first_id + i as u64);
            loc.put_u64_le(data.len() as u64);
            let mut desc = BytesMut::new();
            DataDescriptor::new(loc.freeze(), data.len() as u64).encode(&mut desc);
            store.events.push(StoredEvent {
                meta,
                data,
                desc: desc.freeze(),
            });
        }
        Ok(first_id)
    }
}

impl TopicManagerEndpoint for MemPartition {
    fn addr(&self) -> &str {
        &self.addr
    }

    fn create_topic(
        &self,
        name: &str,
        _config: Metadata,
        validator: Metadata,
        selector: Metadata,
        serializer: Metadata,
    ) -> BoxFuture<'_, Reply<TopicAccept>> {
        let name = name.to_owned();
        Box::pin(async move {
            let mut topics = self.topics.lock();
            let store = topics.entry(name).or_default();
            store.accept = Some((validator.clone(), selector.clone(), serializer.clone()));
            Ok(Ok(TopicAccept {
                validator,
                selector,
                serializer,
            }))
        })
    }

    fn open_topic(&self, name: &str) -> BoxFuture<'_, Reply<TopicAccept>> {
        let name = name.to_owned();
        Box::pin(async move {
            let topics = self.topics.lock();
            let accept = topics.get(&name).and_then(|t| t.accept.clone());
            let (validator, selector, serializer) = accept.unwrap_or_default();
            Ok(Ok(TopicAccept {
                validator,
                selector,
                serializer,
            }))
        })
    }

    fn send_batch(&self, args: SendBatchArgs) -> BoxFuture<'_, Reply<EventId>> {
        Box::pin(async move {
            if self.fail_sends {
                return Ok(Err(ServerError::new("partition is draining")));
            }
            let frame = BulkRef::whole(Arc::clone(&args.bulk))
                .pull()
                .await
                .map_err(|e| RpcError::Request(e.to_string()))?;
            let result = self.ingest(&args, &frame);
            self.received.lock().push(ReceivedBatch {
                producer: args.producer_name.clone(),
                count: args.count,
                total_data_size: args.total_data_size,
                data_offset: args.data_offset,
                frame,
            });
            if result.is_ok() {
                self.wakeup.notify_waiters();
            }
            Ok(result)
        })
    }

    fn request_events(
        &self,
        args: RequestEventsArgs,
        sink: Arc<dyn EventSink>,
    ) -> BoxFuture<'_, Reply<()>> {
        Box::pin(async move {
            let mut cursor = 0usize;
            loop {
                let notified = self.wakeup.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if self.removed.lock().contains(&args.consumer_id) {
                    return Ok(Ok(()));
                }

                let pending: Vec<StoredEvent> = {
                    let topics = self.topics.lock();
                    topics
                        .get(&args.topic_name)
                        .map(|t| t.events[cursor.min(t.events.len())..].to_vec())
                        .unwrap_or_default()
                };
                if pending.is_empty() {
                    notified.await;
                    continue;
                }

                let chunk = if args.batch_size == 0 {
                    pending.len()
                } else {
                    args.batch_size as usize
                };
                for events in pending.chunks(chunk) {
                    let first_id = cursor as EventId;
                    sink.recv_batch(stream_batch(args.target_index, first_id, events))
                        .await?;
                    cursor += events.len();
                }
            }
        })
    }

    fn remove_consumer(&self, consumer_id: Uuid) -> BoxFuture<'_, Reply<()>> {
        Box::pin(async move {
            self.removed.lock().insert(consumer_id);
            self.wakeup.notify_waiters();
            Ok(Ok(()))
        })
    }
}

/// Pack stored events into the four regions of a `recv_batch` callback.
fn stream_batch(target_index: usize, first_id: EventId, events: &[StoredEvent]) -> BatchDelivery {
    let mut meta_sizes = BytesMut::new();
    let mut meta = BytesMut::new();
    let mut desc_sizes = BytesMut::new();
    let mut desc = BytesMut::new();
    for event in events {
        meta_sizes.put_u64_le(event.meta.len() as u64);
        meta.put_slice(&event.meta);
        desc_sizes.put_u64_le(event.desc.len() as u64);
        desc.put_slice(&event.desc);
    }
    let to_bulk = |bytes: BytesMut| BulkRef::whole(Arc::new(MemBulk::new(vec![bytes.freeze()])));
    BatchDelivery {
        target_index,
        count: events.len() as u64,
        first_id,
        meta_sizes: to_bulk(meta_sizes),
        meta: to_bulk(meta),
        data_desc_sizes: to_bulk(desc_sizes),
        data_desc: to_bulk(desc),
    }
}

async fn setup_topic(partitions: &[Arc<MemPartition>], name: &str) -> evstream::client::topic::TopicHandle {
    let client = Client::new(Arc::new(MemEngine));
    let targets: Vec<PartitionTarget> = partitions
        .iter()
        .enumerate()
        .map(|(i, p)| PartitionTarget::new(Arc::clone(p) as _, i as u16))
        .collect();
    let service = client.connect(targets);
    service.create_topic(name, TopicConfig::default()).await.unwrap()
}

#[tokio::test]
async fn lone_event_roundtrips_with_exact_framing() {
    init_tracing();
    let partition = MemPartition::new("node-0");
    let topic = setup_topic(std::slice::from_ref(&partition), "mytopic").await;
    let producer = topic.producer("myproducer").build();

    let delivery = producer
        .push(
            Metadata::from_json_str(r#"{"name":"alice"}"#).unwrap(),
            Data::new(),
        )
        .await;
    producer.flush().await;
    assert_eq!(delivery.await.unwrap(), 0);

    let received = partition.received.lock().clone();
    assert_eq!(received.len(), 1);
    let batch = &received[0];
    assert_eq!(batch.producer, "myproducer");
    assert_eq!(batch.count, 1);
    assert_eq!(batch.total_data_size, 0);
    // 8 bytes of meta_sizes + 16 bytes of serialized metadata.
    assert_eq!(batch.data_offset, 24);

    let mut frame = batch.frame.clone();
    assert_eq!(frame.len(), 24 + 16);
    assert_eq!(frame.get_u64_le(), 16);
    assert_eq!(&frame[..16], br#"{"name":"alice"}"#);
    frame.advance(16);
    assert_eq!(frame.get_u64_le(), 0); // data_offsets[0]
    assert_eq!(frame.get_u64_le(), 0); // data_sizes[0]
    assert!(frame.is_empty());

    producer.close().await;
}

#[tokio::test]
async fn payload_segments_land_in_the_store() {
    init_tracing();
    let partition = MemPartition::new("node-0");
    let topic = setup_topic(std::slice::from_ref(&partition), "mytopic").await;
    let producer = topic
        .producer("p")
        .thread_pool(TaskPool::new(2))
        .ordering(PushOrdering::Strict)
        .build();

    let payloads: [&[u8]; 3] = [b"abc", b"", b"xy"];
    let mut deliveries = Vec::new();
    for (n, payload) in payloads.iter().enumerate() {
        deliveries.push(
            producer
                .push(Metadata::from(json!({ "n": n })), Data::from(*payload))
                .await,
        );
    }
    producer.flush().await;

    let mut ids = HashSet::new();
    for delivery in deliveries {
        ids.insert(delivery.await.unwrap());
    }
    assert_eq!(ids, HashSet::from([0, 1, 2]));

    // Each event's payload is stored against the metadata it traveled with.
    let stored = partition.stored("mytopic");
    assert_eq!(stored.len(), 3);
    let mut total = 0;
    for event in &stored {
        let n = serde_json::from_slice::<serde_json::Value>(&event.meta).unwrap()["n"]
            .as_u64()
            .unwrap() as usize;
        assert_eq!(&event.data[..], payloads[n]);
        total += event.data.len();
    }
    assert_eq!(total, 5);

    producer.close().await;
}

#[tokio::test]
async fn fixed_batches_send_on_seal_and_on_wait() {
    init_tracing();
    let partition = MemPartition::new("node-0");
    let topic = setup_topic(std::slice::from_ref(&partition), "mytopic").await;
    let producer = topic
        .producer("p")
        .batch_size(BatchSize::Fixed(NonZeroUsize::new(2).unwrap()))
        .thread_pool(TaskPool::new(1))
        .build();

    let d1 = producer.push(Metadata::from(json!({"e": 1})), Data::new()).await;
    let d2 = producer.push(Metadata::from(json!({"e": 2})), Data::new()).await;
    let d3 = producer.push(Metadata::from(json!({"e": 3})), Data::new()).await;

    assert_eq!(d1.await.unwrap(), 0);
    assert_eq!(d2.await.unwrap(), 1);

    // No flush was called: awaiting the stranded delivery must trigger one.
    let id3 = tokio::time::timeout(Duration::from_secs(5), d3)
        .await
        .expect("on-wait hook must flush the open batch")
        .unwrap();
    assert_eq!(id3, 2);

    let counts: Vec<u64> = partition.received.lock().iter().map(|b| b.count).collect();
    assert_eq!(counts, vec![2, 1]);
    producer.close().await;
}

#[tokio::test]
async fn server_rejection_fails_the_whole_batch() {
    init_tracing();
    let partition = MemPartition::failing("node-0");
    let topic = setup_topic(std::slice::from_ref(&partition), "mytopic").await;
    let producer = topic
        .producer("p")
        .batch_size(BatchSize::Fixed(NonZeroUsize::new(4).unwrap()))
        .build();

    let mut deliveries = Vec::new();
    for n in 0..4 {
        deliveries.push(
            producer
                .push(Metadata::from(json!({ "n": n })), Data::new())
                .await,
        );
    }
    producer.flush().await;

    for delivery in deliveries {
        let err = delivery.await.unwrap_err();
        assert_matches!(&err, Error::Server(s) if s.message.contains("draining"));
    }
    producer.close().await;
}

#[tokio::test]
async fn consumer_covers_all_partitions_in_order_within_each() {
    init_tracing();
    let p0 = MemPartition::new("node-0");
    let p1 = MemPartition::new("node-1");

    // Deterministic placement: produce through single-partition handles.
    let topic0 = setup_topic(std::slice::from_ref(&p0), "mytopic").await;
    let topic1 = setup_topic(std::slice::from_ref(&p1), "mytopic").await;
    let producer0 = topic0.producer("p").build();
    let producer1 = topic1.producer("p").build();

    for n in 0..2 {
        producer0
            .push(Metadata::from(json!({ "n": n })), Data::new())
            .await;
    }
    producer1
        .push(Metadata::from(json!({ "n": 10 })), Data::new())
        .await;
    producer0.close().await;
    producer1.close().await;

    let both = setup_topic(&[Arc::clone(&p0), Arc::clone(&p1)], "mytopic").await;
    let consumer = both.consumer("c").build();

    let mut per_partition: HashMap<usize, Vec<EventId>> = HashMap::new();
    for _ in 0..3 {
        let event = tokio::time::timeout(Duration::from_secs(5), consumer.pull())
            .await
            .expect("three events must arrive")
            .unwrap();
        per_partition.entry(event.partition()).or_default().push(event.id());
    }
    consumer.join().await;

    assert_eq!(per_partition[&0], vec![0, 1]);
    assert_eq!(per_partition[&1], vec![0]);
}

#[tokio::test]
async fn pulls_queued_before_any_event_resolve_in_order() {
    init_tracing();
    let partition = MemPartition::new("node-0");
    let topic = setup_topic(std::slice::from_ref(&partition), "mytopic").await;

    // Consumer first: its pull worker blocks on an empty store.
    let consumer = topic
        .consumer("c")
        .batch_size(BatchSize::Fixed(NonZeroUsize::new(5).unwrap()))
        .build();
    let early: Vec<_> = (0..3).map(|_| consumer.pull()).collect();

    // One batch of five events arrives afterwards.
    let producer = topic
        .producer("p")
        .batch_size(BatchSize::Fixed(NonZeroUsize::new(5).unwrap()))
        .build();
    let mut deliveries = Vec::new();
    for n in 0..5 {
        deliveries.push(
            producer
                .push(Metadata::from(json!({ "n": n })), Data::new())
                .await,
        );
    }
    producer.flush().await;
    for delivery in deliveries {
        delivery.await.unwrap();
    }

    let mut seen = Vec::new();
    for delivery in early {
        seen.push(delivery.await.unwrap().id());
    }
    // The remaining two events were buffered; fresh pulls drain them.
    for _ in 3..5 {
        seen.push(consumer.pull().await.unwrap().id());
    }
    assert_eq!(seen, vec![0, 1, 2, 3, 4]);

    consumer.join().await;
    producer.close().await;
}

#[tokio::test]
async fn consumed_events_expose_stored_descriptors() {
    init_tracing();
    let partition = MemPartition::new("node-0");
    let topic = setup_topic(std::slice::from_ref(&partition), "mytopic").await;
    let producer = topic.producer("p").build();

    let delivery = producer
        .push(
            Metadata::from(json!({"name": "alice"})),
            Data::from(&b"payload"[..]),
        )
        .await;
    producer.close().await;
    delivery.await.unwrap();

    let consumer = topic.consumer("c").build();
    let event = consumer.pull().await.unwrap();
    assert_eq!(event.id(), 0);
    assert_eq!(event.metadata().field("name").unwrap(), "alice");
    assert_eq!(event.descriptor().size(), 7);
    // No selector asked for data, so none was provisioned.
    assert!(event.data().is_empty());
    consumer.join().await;
}

#[tokio::test]
async fn zero_worker_pools_run_the_whole_path_inline() {
    init_tracing();
    let partition = MemPartition::new("node-0");
    let topic = setup_topic(std::slice::from_ref(&partition), "mytopic").await;
    let producer = topic.producer("p").thread_pool(TaskPool::new(0)).build();

    let mut deliveries = Vec::new();
    for n in 0..4 {
        deliveries.push(
            producer
                .push(Metadata::from(json!({ "n": n })), Data::new())
                .await,
        );
    }
    producer.flush().await;

    let mut ids = Vec::new();
    for delivery in deliveries {
        ids.push(delivery.await.unwrap());
    }
    assert_eq!(ids, vec![0, 1, 2, 3]);

    let consumer = topic.consumer("c").thread_pool(TaskPool::new(0)).build();
    for expected in 0..4 {
        let event = consumer.pull().await.unwrap();
        assert_eq!(event.id(), expected);
    }
    consumer.join().await;
    producer.close().await;
}
