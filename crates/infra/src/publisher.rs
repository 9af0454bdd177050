//! Change-event publishing.
//!
//! [`EnvelopeBuilder`] turns a before/after pair into a transport record;
//! [`EventPublisher`] sends it and resolves once the broker acknowledges.
//! Delivery is at-least-once: a retried send may duplicate a record, which
//! consumers tolerate.

use std::sync::Arc;

use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, instrument};

use circstore_core::TenantId;
use circstore_events::{
    BrokerError, DeliveryReceipt, Environment, EventEnvelope, ForwardedHeaders, ProducerRecord,
    RecordProducer, TopicIdentity,
};

use crate::config::ServiceConfig;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// The envelope could not be encoded. Never retried.
    #[error("failed to serialize event: {0}")]
    Serialization(String),

    /// The encoded record exceeds the configured request size.
    #[error("event of {size} bytes exceeds the {limit} byte request limit")]
    TooLarge { size: usize, limit: usize },

    #[error("broker did not accept event: {0}")]
    Broker(#[from] BrokerError),
}

/// Builds transport records for change events.
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    environment: Environment,
    okapi_url: Option<String>,
    max_request_size: usize,
}

impl EnvelopeBuilder {
    pub fn new(environment: Environment, okapi_url: Option<String>, max_request_size: usize) -> Self {
        Self {
            environment,
            okapi_url,
            max_request_size,
        }
    }

    pub fn from_config(config: &ServiceConfig) -> Self {
        Self::new(
            config.environment.clone(),
            config.okapi_url.clone(),
            config.broker.max_request_size,
        )
    }

    /// Envelope + allow-listed headers, addressed to the tenant's topic and
    /// keyed by `key`.
    pub fn build(
        &self,
        topic: TopicIdentity,
        tenant: &TenantId,
        key: &str,
        before: Option<&JsonValue>,
        after: Option<&JsonValue>,
        caller: &ForwardedHeaders,
    ) -> Result<ProducerRecord, PublishError> {
        let envelope = EventEnvelope::new(tenant.clone(), before.cloned(), after.cloned());
        let payload = envelope
            .to_json()
            .map_err(|e| PublishError::Serialization(e.to_string()))?;

        if payload.len() > self.max_request_size {
            return Err(PublishError::TooLarge {
                size: payload.len(),
                limit: self.max_request_size,
            });
        }

        let headers = caller
            .clone()
            .with_fallback_url(self.okapi_url.as_deref())
            .with_tenant(tenant)
            .to_record_headers();

        Ok(ProducerRecord {
            topic: topic.qualify(&self.environment, tenant),
            key: key.to_string(),
            headers,
            payload,
        })
    }
}

/// Publishes change events for stored records.
#[derive(Clone)]
pub struct EventPublisher {
    producer: Arc<dyn RecordProducer>,
    builder: EnvelopeBuilder,
}

impl EventPublisher {
    pub fn new(producer: Arc<dyn RecordProducer>, builder: EnvelopeBuilder) -> Self {
        Self { producer, builder }
    }

    pub fn builder(&self) -> &EnvelopeBuilder {
        &self.builder
    }

    /// Publish one change event; the event type follows from which of
    /// `before`/`after` are present.
    #[instrument(
        skip(self, before, after, caller),
        fields(topic = %topic.logical_name(), tenant = %tenant, key = %key),
        err
    )]
    pub async fn publish(
        &self,
        topic: TopicIdentity,
        tenant: &TenantId,
        key: &str,
        before: Option<&JsonValue>,
        after: Option<&JsonValue>,
        caller: &ForwardedHeaders,
    ) -> Result<DeliveryReceipt, PublishError> {
        let record = self.builder.build(topic, tenant, key, before, after, caller)?;
        let receipt = self.producer.send(record).await?;

        debug!(
            partition = receipt.partition,
            offset = %receipt.offset,
            "event acknowledged"
        );
        Ok(receipt)
    }

    pub async fn publish_created(
        &self,
        topic: TopicIdentity,
        tenant: &TenantId,
        key: &str,
        created: &JsonValue,
        caller: &ForwardedHeaders,
    ) -> Result<DeliveryReceipt, PublishError> {
        self.publish(topic, tenant, key, None, Some(created), caller).await
    }

    pub async fn publish_updated(
        &self,
        topic: TopicIdentity,
        tenant: &TenantId,
        key: &str,
        before: &JsonValue,
        after: &JsonValue,
        caller: &ForwardedHeaders,
    ) -> Result<DeliveryReceipt, PublishError> {
        self.publish(topic, tenant, key, Some(before), Some(after), caller)
            .await
    }

    pub async fn publish_removed(
        &self,
        topic: TopicIdentity,
        tenant: &TenantId,
        key: &str,
        removed: &JsonValue,
        caller: &ForwardedHeaders,
    ) -> Result<DeliveryReceipt, PublishError> {
        self.publish(topic, tenant, key, Some(removed), None, caller).await
    }

    /// A whole collection was cleared. There is no single entity, so the
    /// record is keyed by the tenant id.
    pub async fn publish_all_removed(
        &self,
        topic: TopicIdentity,
        tenant: &TenantId,
        caller: &ForwardedHeaders,
    ) -> Result<DeliveryReceipt, PublishError> {
        self.publish(topic, tenant, tenant.as_str(), None, None, caller)
            .await
    }
}
