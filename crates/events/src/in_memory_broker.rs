//! In-memory broker for tests/dev.
//!
//! Models the parts of a partitioned log broker the rest of the system relies on:
//! provisioned topics with a fixed partition count, key-hashed partitioning,
//! consumer groups with per-record commits, and redelivery of uncommitted records
//! when a group member re-subscribes. Faults can be queued to exercise retry and
//! failure paths.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::broker::{
    AdminConnection, AdminConnector, BrokerError, ConsumedRecord, ConsumerConnector,
    DeliveryReceipt, NewTopic, ProducerRecord, RecordPosition, RecordProducer, Subscription,
    SubscriptionRequest, TopicOutcome, partition_for_key,
};
use crate::headers::RecordHeaders;
use crate::topic::QualifiedTopicName;

/// Admin connection accounting, for asserting connection discipline in tests.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct AdminStats {
    pub connections_opened: usize,
    /// Every `close()` call is counted, including repeated ones.
    pub close_calls: usize,
    pub create_calls: usize,
    pub delete_calls: usize,
}

#[derive(Debug, Clone)]
struct StoredRecord {
    key: String,
    headers: RecordHeaders,
    payload: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CursorKey {
    group: String,
    topic: String,
    partition: u32,
}

/// Group progress on one partition.
#[derive(Debug, Default)]
struct GroupCursor {
    /// Next offset to hand out.
    next: u64,
    /// Every offset below this is committed.
    low_watermark: u64,
    /// Committed offsets above the watermark (out-of-order commits).
    committed: BTreeSet<u64>,
}

#[derive(Debug, Default)]
struct BrokerState {
    topics: BTreeMap<String, Vec<Vec<StoredRecord>>>,
    cursors: HashMap<CursorKey, GroupCursor>,
    connect_faults: VecDeque<BrokerError>,
    admin_faults: VecDeque<BrokerError>,
    send_faults: VecDeque<BrokerError>,
    stats: AdminStats,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<BrokerState>,
    appended: Notify,
}

impl Inner {
    fn state(&self) -> Result<MutexGuard<'_, BrokerState>, BrokerError> {
        self.state
            .lock()
            .map_err(|_| BrokerError::Unavailable("in-memory broker lock poisoned".to_string()))
    }
}

/// In-memory broker implementing every broker capability.
///
/// Cloning shares the same broker.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `connect()` calls with these errors, in order.
    pub fn fail_next_connects(&self, errors: impl IntoIterator<Item = BrokerError>) {
        if let Ok(mut s) = self.inner.state() {
            s.connect_faults.extend(errors);
        }
    }

    /// Fail the next create/delete batch calls with these errors, in order.
    pub fn fail_next_admin_calls(&self, errors: impl IntoIterator<Item = BrokerError>) {
        if let Ok(mut s) = self.inner.state() {
            s.admin_faults.extend(errors);
        }
    }

    /// Fail the next sends with these errors, in order.
    pub fn fail_next_sends(&self, errors: impl IntoIterator<Item = BrokerError>) {
        if let Ok(mut s) = self.inner.state() {
            s.send_faults.extend(errors);
        }
    }

    pub fn admin_stats(&self) -> AdminStats {
        self.inner.state().map(|s| s.stats).unwrap_or_default()
    }

    /// Names of all provisioned topics, sorted.
    pub fn topics(&self) -> Vec<String> {
        self.inner
            .state()
            .map(|s| s.topics.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn partition_count(&self, topic: &str) -> Option<u32> {
        let s = self.inner.state().ok()?;
        s.topics.get(topic).map(|p| p.len() as u32)
    }

    /// Every record of a topic, partition by partition in append order.
    pub fn records(&self, topic: &str) -> Vec<ConsumedRecord> {
        let Ok(s) = self.inner.state() else {
            return vec![];
        };
        let Some(partitions) = s.topics.get(topic) else {
            return vec![];
        };

        partitions
            .iter()
            .enumerate()
            .flat_map(|(p, log)| {
                log.iter()
                    .enumerate()
                    .map(move |(offset, r)| to_consumed(topic, p as u32, offset as u64, r))
            })
            .collect()
    }

    /// Offset below which everything is committed for `group`.
    pub fn committed_watermark(&self, group: &str, topic: &str, partition: u32) -> u64 {
        let key = CursorKey {
            group: group.to_string(),
            topic: topic.to_string(),
            partition,
        };
        self.inner
            .state()
            .ok()
            .and_then(|s| s.cursors.get(&key).map(|c| c.low_watermark))
            .unwrap_or(0)
    }
}

fn to_consumed(topic: &str, partition: u32, offset: u64, record: &StoredRecord) -> ConsumedRecord {
    ConsumedRecord {
        position: RecordPosition {
            topic: topic.to_string(),
            partition,
            offset: offset.to_string(),
        },
        key: record.key.clone(),
        headers: record.headers.clone(),
        payload: record.payload.clone(),
    }
}

#[async_trait]
impl AdminConnector for InMemoryBroker {
    async fn connect(&self) -> Result<Box<dyn AdminConnection>, BrokerError> {
        let mut s = self.inner.state()?;
        if let Some(fault) = s.connect_faults.pop_front() {
            return Err(fault);
        }
        s.stats.connections_opened += 1;

        Ok(Box::new(InMemoryAdmin {
            inner: self.inner.clone(),
            open: true,
        }))
    }
}

struct InMemoryAdmin {
    inner: Arc<Inner>,
    open: bool,
}

#[async_trait]
impl AdminConnection for InMemoryAdmin {
    async fn create_topics(&mut self, topics: &[NewTopic]) -> Result<Vec<TopicOutcome>, BrokerError> {
        if !self.open {
            return Err(BrokerError::Closed);
        }
        let mut s = self.inner.state()?;
        s.stats.create_calls += 1;
        if let Some(fault) = s.admin_faults.pop_front() {
            return Err(fault);
        }

        let outcomes = topics
            .iter()
            .map(|t| {
                let name = t.name.as_str();
                if s.topics.contains_key(name) {
                    TopicOutcome::failed(name, BrokerError::TopicAlreadyExists(name.to_string()))
                } else if t.partitions == 0 || t.replication_factor == 0 {
                    TopicOutcome::failed(
                        name,
                        BrokerError::Rejected("partitions and replication factor must be positive".to_string()),
                    )
                } else {
                    s.topics
                        .insert(name.to_string(), vec![Vec::new(); t.partitions as usize]);
                    TopicOutcome::ok(name)
                }
            })
            .collect();

        Ok(outcomes)
    }

    async fn delete_topics(
        &mut self,
        topics: &[QualifiedTopicName],
    ) -> Result<Vec<TopicOutcome>, BrokerError> {
        if !self.open {
            return Err(BrokerError::Closed);
        }
        let mut s = self.inner.state()?;
        s.stats.delete_calls += 1;
        if let Some(fault) = s.admin_faults.pop_front() {
            return Err(fault);
        }

        let outcomes = topics
            .iter()
            .map(|t| {
                let name = t.as_str();
                if s.topics.remove(name).is_some() {
                    s.cursors.retain(|k, _| k.topic != name);
                    TopicOutcome::ok(name)
                } else {
                    TopicOutcome::failed(name, BrokerError::UnknownTopic(name.to_string()))
                }
            })
            .collect();

        Ok(outcomes)
    }

    async fn close(&mut self) {
        self.open = false;
        if let Ok(mut s) = self.inner.state() {
            s.stats.close_calls += 1;
        }
    }
}

#[async_trait]
impl RecordProducer for InMemoryBroker {
    async fn send(&self, record: ProducerRecord) -> Result<DeliveryReceipt, BrokerError> {
        let receipt = {
            let mut s = self.inner.state()?;
            if let Some(fault) = s.send_faults.pop_front() {
                return Err(fault);
            }

            let topic = record.topic.as_str();
            let partitions = s
                .topics
                .get_mut(topic)
                .ok_or_else(|| BrokerError::UnknownTopic(topic.to_string()))?;

            let partition = partition_for_key(&record.key, partitions.len() as u32);
            let log = &mut partitions[partition as usize];
            log.push(StoredRecord {
                key: record.key,
                headers: record.headers,
                payload: record.payload,
            });

            DeliveryReceipt {
                topic: topic.to_string(),
                partition,
                offset: (log.len() - 1).to_string(),
            }
        };

        self.inner.appended.notify_waiters();
        Ok(receipt)
    }
}

#[async_trait]
impl ConsumerConnector for InMemoryBroker {
    async fn subscribe(
        &self,
        request: SubscriptionRequest,
    ) -> Result<Arc<dyn Subscription>, BrokerError> {
        {
            let mut s = self.inner.state()?;
            // A (re)joining member starts from the committed watermark, so
            // anything fetched but never committed is delivered again.
            for (key, cursor) in s.cursors.iter_mut() {
                if key.group == request.group_id {
                    cursor.next = cursor.low_watermark;
                    cursor.committed.clear();
                }
            }
        }

        Ok(Arc::new(InMemorySubscription {
            inner: self.inner.clone(),
            request,
            closed: AtomicBool::new(false),
        }))
    }
}

struct InMemorySubscription {
    inner: Arc<Inner>,
    request: SubscriptionRequest,
    closed: AtomicBool,
}

impl InMemorySubscription {
    fn take_ready(&self, max_records: usize) -> Result<Vec<ConsumedRecord>, BrokerError> {
        let mut guard = self.inner.state()?;
        let BrokerState { topics, cursors, .. } = &mut *guard;

        let mut batch = Vec::new();
        for (topic, partitions) in topics.iter() {
            if !self.request.pattern.matches(topic) {
                continue;
            }
            for (p, log) in partitions.iter().enumerate() {
                let cursor = cursors
                    .entry(CursorKey {
                        group: self.request.group_id.clone(),
                        topic: topic.clone(),
                        partition: p as u32,
                    })
                    .or_default();

                while batch.len() < max_records && (cursor.next as usize) < log.len() {
                    let offset = cursor.next;
                    batch.push(to_consumed(topic, p as u32, offset, &log[offset as usize]));
                    cursor.next += 1;
                }
            }
        }

        Ok(batch)
    }
}

#[async_trait]
impl Subscription for InMemorySubscription {
    async fn poll(
        &self,
        max_records: usize,
        wait: Duration,
    ) -> Result<Vec<ConsumedRecord>, BrokerError> {
        let deadline = Instant::now() + wait;

        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(BrokerError::Closed);
            }

            // Register for wake-ups before looking, so an append between the
            // check and the wait is not missed.
            let appended = self.inner.appended.notified();

            let batch = self.take_ready(max_records)?;
            if !batch.is_empty() || max_records == 0 {
                return Ok(batch);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(batch);
            }
            if tokio::time::timeout(deadline - now, appended).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn commit(&self, position: &RecordPosition) -> Result<(), BrokerError> {
        let offset: u64 = position
            .offset
            .parse()
            .map_err(|_| BrokerError::Rejected(format!("invalid offset {:?}", position.offset)))?;

        let mut s = self.inner.state()?;
        let cursor = s
            .cursors
            .entry(CursorKey {
                group: self.request.group_id.clone(),
                topic: position.topic.clone(),
                partition: position.partition,
            })
            .or_default();

        if offset >= cursor.low_watermark {
            cursor.committed.insert(offset);
        }
        while cursor.committed.remove(&cursor.low_watermark) {
            cursor.low_watermark += 1;
        }

        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.inner.appended.notify_waiters();
    }
}
