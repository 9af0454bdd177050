//! Redis Streams-backed broker (durable, at-least-once delivery).
//!
//! ## Layout
//!
//! - **Topic registry**: hash `{namespace}:topics`, topic name → partition count.
//!   A topic exists exactly when it has a registry entry.
//! - **Partitions**: one stream per partition, `{namespace}:{topic}:{partition}`.
//!   Records are appended with XADD; the entry id is the offset.
//! - **Consumer groups**: one Redis consumer group per subscription group id,
//!   created lazily on each matching partition stream (`XGROUP CREATE ... MKSTREAM`).
//! - **Commit**: XACK of the entry. Unacknowledged entries stay in the pending
//!   list and are replayed to the same client id when it subscribes again.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, RedisError};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, instrument, warn};

use circstore_events::{
    AdminConnection, AdminConnector, BrokerError, ConsumedRecord, ConsumerConnector,
    DeliveryReceipt, NewTopic, ProducerRecord, QualifiedTopicName, RecordHeaders, RecordPosition,
    RecordProducer, Subscription, SubscriptionPattern, SubscriptionRequest, TopicOutcome,
    partition_for_key,
};

/// Default key namespace.
pub const DEFAULT_NAMESPACE: &str = "circstore";

const KEY_FIELD: &str = "key";
const PAYLOAD_FIELD: &str = "payload";
const HEADER_PREFIX: &str = "h:";

#[derive(Clone)]
pub struct RedisStreamsBroker {
    client: Arc<redis::Client>,
    namespace: Arc<str>,
    producer: Arc<OnceCell<MultiplexedConnection>>,
}

impl core::fmt::Debug for RedisStreamsBroker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisStreamsBroker")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl RedisStreamsBroker {
    /// Create a broker for `redis_url` (e.g. `redis://localhost:6379`).
    ///
    /// No connection is made until the first call.
    pub fn open(redis_url: impl AsRef<str>, namespace: Option<String>) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| BrokerError::Rejected(format!("invalid redis url: {e}")))?;

        Ok(Self {
            client: Arc::new(client),
            namespace: namespace
                .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string())
                .into(),
            producer: Arc::new(OnceCell::new()),
        })
    }

    fn keys(&self) -> Keys {
        Keys {
            namespace: self.namespace.clone(),
        }
    }

    async fn connection(&self) -> Result<MultiplexedConnection, BrokerError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_redis_error)
    }

    async fn producer_connection(&self) -> Result<MultiplexedConnection, BrokerError> {
        self.producer
            .get_or_try_init(|| self.connection())
            .await
            .cloned()
    }
}

/// Key derivation for one namespace.
#[derive(Debug, Clone)]
struct Keys {
    namespace: Arc<str>,
}

impl Keys {
    fn registry(&self) -> String {
        format!("{}:topics", self.namespace)
    }

    fn stream(&self, topic: &str, partition: u32) -> String {
        format!("{}:{topic}:{partition}", self.namespace)
    }

    fn streams(&self, topic: &str, partitions: u32) -> Vec<String> {
        (0..partitions).map(|p| self.stream(topic, p)).collect()
    }
}

fn map_redis_error(err: RedisError) -> BrokerError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_timeout() {
        BrokerError::Unavailable(err.to_string())
    } else {
        BrokerError::Rejected(err.to_string())
    }
}

fn is_busy_group(err: &RedisError) -> bool {
    err.code() == Some("BUSYGROUP")
}

#[async_trait]
impl AdminConnector for RedisStreamsBroker {
    async fn connect(&self) -> Result<Box<dyn AdminConnection>, BrokerError> {
        let connection = self.connection().await?;
        Ok(Box::new(RedisAdmin {
            connection: Some(connection),
            keys: self.keys(),
        }))
    }
}

struct RedisAdmin {
    connection: Option<MultiplexedConnection>,
    keys: Keys,
}

impl RedisAdmin {
    fn live(&mut self) -> Result<&mut MultiplexedConnection, BrokerError> {
        self.connection.as_mut().ok_or(BrokerError::Closed)
    }
}

#[async_trait]
impl AdminConnection for RedisAdmin {
    #[instrument(skip(self, topics), fields(count = topics.len()), err)]
    async fn create_topics(&mut self, topics: &[NewTopic]) -> Result<Vec<TopicOutcome>, BrokerError> {
        let registry = self.keys.registry();
        let conn = self.live()?;

        let mut outcomes = Vec::with_capacity(topics.len());
        for topic in topics {
            let name = topic.name.as_str();
            if topic.partitions == 0 {
                outcomes.push(TopicOutcome::failed(
                    name,
                    BrokerError::Rejected("partition count must be positive".to_string()),
                ));
                continue;
            }

            let created: bool = conn
                .hset_nx(&registry, name, topic.partitions)
                .await
                .map_err(map_redis_error)?;
            if created {
                debug!(topic = name, partitions = topic.partitions, "topic registered");
                outcomes.push(TopicOutcome::ok(name));
            } else {
                outcomes.push(TopicOutcome::failed(
                    name,
                    BrokerError::TopicAlreadyExists(name.to_string()),
                ));
            }
        }
        Ok(outcomes)
    }

    #[instrument(skip(self, topics), fields(count = topics.len()), err)]
    async fn delete_topics(
        &mut self,
        topics: &[QualifiedTopicName],
    ) -> Result<Vec<TopicOutcome>, BrokerError> {
        let keys = self.keys.clone();
        let registry = keys.registry();
        let conn = self.live()?;

        let mut outcomes = Vec::with_capacity(topics.len());
        for topic in topics {
            let name = topic.as_str();
            let partitions: Option<u32> = conn.hget(&registry, name).await.map_err(map_redis_error)?;
            let Some(partitions) = partitions else {
                outcomes.push(TopicOutcome::failed(
                    name,
                    BrokerError::UnknownTopic(name.to_string()),
                ));
                continue;
            };

            let _: i64 = conn.hdel(&registry, name).await.map_err(map_redis_error)?;
            let _: i64 = conn
                .del(keys.streams(name, partitions))
                .await
                .map_err(map_redis_error)?;
            outcomes.push(TopicOutcome::ok(name));
        }
        Ok(outcomes)
    }

    async fn close(&mut self) {
        self.connection = None;
    }
}

#[async_trait]
impl RecordProducer for RedisStreamsBroker {
    #[instrument(skip(self, record), fields(topic = %record.topic, key = %record.key), err)]
    async fn send(&self, record: ProducerRecord) -> Result<DeliveryReceipt, BrokerError> {
        let keys = self.keys();
        let mut conn = self.producer_connection().await?;
        let topic = record.topic.as_str();

        let partitions: Option<u32> = conn
            .hget(keys.registry(), topic)
            .await
            .map_err(map_redis_error)?;
        let partitions = partitions.ok_or_else(|| BrokerError::UnknownTopic(topic.to_string()))?;
        let partition = partition_for_key(&record.key, partitions);

        let mut fields: Vec<(String, String)> = Vec::with_capacity(record.headers.len() + 2);
        fields.push((KEY_FIELD.to_string(), record.key));
        fields.push((PAYLOAD_FIELD.to_string(), record.payload));
        fields.extend(
            record
                .headers
                .into_iter()
                .map(|(name, value)| (format!("{HEADER_PREFIX}{name}"), value)),
        );

        let offset: String = conn
            .xadd(keys.stream(topic, partition), "*", fields.as_slice())
            .await
            .map_err(map_redis_error)?;

        Ok(DeliveryReceipt {
            topic: topic.to_string(),
            partition,
            offset,
        })
    }
}

#[async_trait]
impl ConsumerConnector for RedisStreamsBroker {
    async fn subscribe(
        &self,
        request: SubscriptionRequest,
    ) -> Result<Arc<dyn Subscription>, BrokerError> {
        let connection = self.connection().await?;
        Ok(Arc::new(RedisStreamsSubscription {
            connection,
            keys: self.keys(),
            pattern: request.pattern,
            group: request.group_id,
            consumer: request.client_id,
            streams: Mutex::new(StreamTable::default()),
            cursor: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }))
    }
}

/// Read id for entries never delivered to this group.
const NEW_ENTRIES: &str = ">";

/// Partition streams this subscription has joined.
#[derive(Default)]
struct StreamTable {
    joined: HashMap<String, Partition>,
    /// Joined streams still replaying pending entries, with the id of the last
    /// pending entry handed out (`0` before the first read).
    replay: HashMap<String, String>,
}

impl StreamTable {
    /// Id to read `stream` from.
    fn read_from(&self, stream: &str) -> &str {
        self.replay.get(stream).map_or(NEW_ENTRIES, String::as_str)
    }

    /// Move the replay cursor past entries just read. A short read means the
    /// pending list is exhausted and the stream switches to new entries.
    fn advance(&mut self, stream: &str, last_id: Option<&str>, returned: usize, requested: usize) {
        let Some(cursor) = self.replay.get_mut(stream) else {
            return;
        };
        match last_id {
            Some(id) if returned >= requested => *cursor = id.to_string(),
            _ => {
                self.replay.remove(stream);
            }
        }
    }
}

#[derive(Debug, Clone)]
struct Partition {
    topic: String,
    index: u32,
}

pub struct RedisStreamsSubscription {
    connection: MultiplexedConnection,
    keys: Keys,
    pattern: SubscriptionPattern,
    group: String,
    consumer: String,
    streams: Mutex<StreamTable>,
    cursor: AtomicUsize,
    closed: AtomicBool,
}

impl RedisStreamsSubscription {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        Ok(())
    }

    /// Join the group on partitions of newly matching topics.
    async fn refresh(&self, table: &mut StreamTable) -> Result<(), BrokerError> {
        let mut conn = self.connection.clone();
        let registry: HashMap<String, u32> = conn
            .hgetall(self.keys.registry())
            .await
            .map_err(map_redis_error)?;

        let live: HashSet<String> = registry
            .iter()
            .filter(|(topic, _)| self.pattern.matches(topic))
            .flat_map(|(topic, partitions)| self.keys.streams(topic, *partitions))
            .collect();
        table.joined.retain(|stream, _| live.contains(stream));
        table.replay.retain(|stream, _| live.contains(stream));

        for (topic, partitions) in registry {
            if !self.pattern.matches(&topic) {
                continue;
            }
            for index in 0..partitions {
                let stream = self.keys.stream(&topic, index);
                if table.joined.contains_key(&stream) {
                    continue;
                }

                let created: Result<(), RedisError> = conn
                    .xgroup_create_mkstream(&stream, &self.group, "0")
                    .await;
                match created {
                    Ok(()) => {}
                    Err(e) if is_busy_group(&e) => {}
                    Err(e) => return Err(map_redis_error(e)),
                }

                debug!(stream = %stream, group = %self.group, "joined partition stream");
                table.replay.insert(stream.clone(), "0".to_string());
                table.joined.insert(
                    stream,
                    Partition {
                        topic: topic.clone(),
                        index,
                    },
                );
            }
        }
        Ok(())
    }

    /// Read up to `count` entries from one stream. `from` is an entry id to
    /// replay this consumer's pending entries after it, `>` for new ones.
    async fn read(&self, stream: &str, from: &str, count: usize) -> Result<Vec<StreamId>, BrokerError> {
        let mut conn = self.connection.clone();
        let options = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(count);
        let reply: StreamReadReply = conn
            .xread_options(&[stream], &[from], &options)
            .await
            .map_err(map_redis_error)?;

        Ok(reply.keys.into_iter().flat_map(|key| key.ids).collect())
    }

    fn to_consumed(partition: &Partition, entry: StreamId) -> Option<ConsumedRecord> {
        let mut key = None;
        let mut payload = None;
        let mut headers = RecordHeaders::new();
        for (field, value) in &entry.map {
            let Ok(value) = redis::from_redis_value::<String>(value) else {
                continue;
            };
            match field.as_str() {
                KEY_FIELD => key = Some(value),
                PAYLOAD_FIELD => payload = Some(value),
                other => {
                    if let Some(name) = other.strip_prefix(HEADER_PREFIX) {
                        headers.insert(name.to_string(), value);
                    }
                }
            }
        }

        Some(ConsumedRecord {
            position: RecordPosition {
                topic: partition.topic.clone(),
                partition: partition.index,
                offset: entry.id,
            },
            key: key?,
            headers,
            payload: payload?,
        })
    }
}

#[async_trait]
impl Subscription for RedisStreamsSubscription {
    async fn poll(
        &self,
        max_records: usize,
        wait: Duration,
    ) -> Result<Vec<ConsumedRecord>, BrokerError> {
        self.ensure_open()?;
        if max_records == 0 {
            return Ok(Vec::new());
        }

        let mut table = self.streams.lock().await;
        self.refresh(&mut table).await?;

        let mut streams: Vec<String> = table.joined.keys().cloned().collect();
        streams.sort();
        if !streams.is_empty() {
            let start = self.cursor.fetch_add(1, Ordering::Relaxed) % streams.len();
            streams.rotate_left(start);
        }

        let mut out = Vec::new();
        for stream in streams {
            let remaining = max_records - out.len();
            if remaining == 0 {
                break;
            }
            let Some(partition) = table.joined.get(&stream).cloned() else {
                continue;
            };

            let from = table.read_from(&stream).to_string();
            let entries = self.read(&stream, &from, remaining).await?;
            let last_id = entries.last().map(|entry| entry.id.clone());
            table.advance(&stream, last_id.as_deref(), entries.len(), remaining);

            for entry in entries {
                let id = entry.id.clone();
                match Self::to_consumed(&partition, entry) {
                    Some(record) => out.push(record),
                    None => {
                        warn!(stream = %stream, entry = %id, "dropping stream entry without key or payload");
                        let mut conn = self.connection.clone();
                        let _: i64 = conn
                            .xack(&stream, &self.group, &[&id])
                            .await
                            .map_err(map_redis_error)?;
                    }
                }
            }
        }
        drop(table);

        if out.is_empty() {
            tokio::time::sleep(wait).await;
        }
        Ok(out)
    }

    async fn commit(&self, position: &RecordPosition) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let stream = self.keys.stream(&position.topic, position.partition);
        let mut conn = self.connection.clone();
        let _: i64 = conn
            .xack(&stream, &self.group, &[&position.offset])
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
