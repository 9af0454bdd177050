//! Message-broker seam (mechanics only).
//!
//! The broker is split into three narrow capabilities so each component only
//! sees what it needs:
//!
//! - **Administration** ([`AdminConnector`] / [`AdminConnection`]): batch topic
//!   create/delete over a short-lived connection the caller must close.
//! - **Production** ([`RecordProducer`]): keyed sends that resolve once the broker
//!   acknowledges the record.
//! - **Consumption** ([`ConsumerConnector`] / [`Subscription`]): pattern-based
//!   group subscriptions with explicit per-record commits.
//!
//! ## Delivery guarantees
//!
//! - **At-least-once**: a record is redelivered to the group until it is committed,
//!   and a producer retry may append a duplicate. Consumers must be idempotent.
//! - **Per-key ordering**: records with the same key land on the same partition
//!   and are fetched in append order. Nothing is promised across keys or topics.
//!
//! Implementations: [`crate::InMemoryBroker`] for tests/dev and the Redis Streams
//! broker in `circstore-infra`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::headers::RecordHeaders;
use crate::topic::{QualifiedTopicName, SubscriptionPattern};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The topic is already provisioned (benign during creation races).
    #[error("topic already exists: {0}")]
    TopicAlreadyExists(String),

    /// The topic is not provisioned.
    #[error("unknown topic: {0}")]
    UnknownTopic(String),

    /// Broker unreachable or not answering (transient).
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// The broker refused the request (bad arguments, policy, size limits).
    #[error("broker rejected request: {0}")]
    Rejected(String),

    /// The connection or subscription was already closed.
    #[error("connection closed")]
    Closed,
}

/// Topic creation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTopic {
    pub name: QualifiedTopicName,
    pub partitions: u32,
    pub replication_factor: u16,
}

/// Per-topic result of a batch admin call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicOutcome {
    pub topic: String,
    pub result: Result<(), BrokerError>,
}

impl TopicOutcome {
    pub fn ok(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            result: Ok(()),
        }
    }

    pub fn failed(topic: impl Into<String>, error: BrokerError) -> Self {
        Self {
            topic: topic.into(),
            result: Err(error),
        }
    }
}

/// A record ready to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerRecord {
    pub topic: QualifiedTopicName,
    /// Partition key; all records sharing a key are strictly ordered.
    pub key: String,
    pub headers: RecordHeaders,
    pub payload: String,
}

/// Broker acknowledgement of a produced record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub topic: String,
    pub partition: u32,
    pub offset: String,
}

/// Where a consumed record lives; handed back to [`Subscription::commit`].
///
/// `offset` is broker-assigned and opaque to callers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordPosition {
    pub topic: String,
    pub partition: u32,
    pub offset: String,
}

impl core::fmt::Display for RecordPosition {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}[{}]@{}", self.topic, self.partition, self.offset)
    }
}

/// A record fetched by a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedRecord {
    pub position: RecordPosition,
    pub key: String,
    pub headers: RecordHeaders,
    pub payload: String,
}

/// Parameters of a group subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionRequest {
    /// Topics are matched by name, so newly provisioned tenants are picked up.
    pub pattern: SubscriptionPattern,
    /// Consumer group: members share the work and the committed progress.
    pub group_id: String,
    /// Unique per module instance (broker-side client identification).
    pub client_id: String,
}

/// Opens admin connections against the broker's administrative endpoint.
#[async_trait]
pub trait AdminConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn AdminConnection>, BrokerError>;
}

/// A live admin connection. Callers must call [`AdminConnection::close`] exactly
/// once, on every exit path.
#[async_trait]
pub trait AdminConnection: Send {
    /// Create all topics in one call. A call-level error means nothing is known
    /// about the individual topics.
    async fn create_topics(&mut self, topics: &[NewTopic]) -> Result<Vec<TopicOutcome>, BrokerError>;

    /// Delete all topics in one call.
    async fn delete_topics(
        &mut self,
        topics: &[QualifiedTopicName],
    ) -> Result<Vec<TopicOutcome>, BrokerError>;

    async fn close(&mut self);
}

/// Sends keyed records.
#[async_trait]
pub trait RecordProducer: Send + Sync {
    /// Resolves when the broker has acknowledged the record.
    async fn send(&self, record: ProducerRecord) -> Result<DeliveryReceipt, BrokerError>;
}

#[async_trait]
impl<P> RecordProducer for Arc<P>
where
    P: RecordProducer + ?Sized,
{
    async fn send(&self, record: ProducerRecord) -> Result<DeliveryReceipt, BrokerError> {
        (**self).send(record).await
    }
}

/// Opens group subscriptions.
#[async_trait]
pub trait ConsumerConnector: Send + Sync {
    async fn subscribe(
        &self,
        request: SubscriptionRequest,
    ) -> Result<Arc<dyn Subscription>, BrokerError>;
}

/// A live group subscription.
///
/// `poll` is driven by a single fetch loop; `commit` may be called concurrently
/// from handler tasks, in any order.
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Fetch at most `max_records`, waiting up to `wait` when nothing is ready.
    async fn poll(&self, max_records: usize, wait: Duration)
    -> Result<Vec<ConsumedRecord>, BrokerError>;

    /// Mark one record as processed for the group.
    async fn commit(&self, position: &RecordPosition) -> Result<(), BrokerError>;

    async fn close(&self);
}

/// Stable key → partition mapping (FNV-1a).
pub fn partition_for_key(key: &str, partitions: u32) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;

    let hash = key
        .bytes()
        .fold(OFFSET_BASIS, |h, b| (h ^ u32::from(b)).wrapping_mul(PRIME));
    hash % partitions.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partitioning_is_stable_and_bounded() {
        for key in ["a", "b", "0b2f6c3e-8a1f-4c53-9d41-6f3e1d2f7a10", ""] {
            let p = partition_for_key(key, 10);
            assert!(p < 10);
            assert_eq!(p, partition_for_key(key, 10));
        }
        assert_eq!(partition_for_key("anything", 0), 0);
    }
}
