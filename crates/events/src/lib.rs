//! Change events: topic naming, envelopes, forwarded headers and the broker seam.

pub mod broker;
pub mod envelope;
pub mod handler;
pub mod headers;
pub mod in_memory_broker;
pub mod topic;

pub use broker::{
    AdminConnection, AdminConnector, BrokerError, ConsumedRecord, ConsumerConnector,
    DeliveryReceipt, NewTopic, ProducerRecord, RecordPosition, RecordProducer, Subscription,
    SubscriptionRequest, TopicOutcome, partition_for_key,
};
pub use envelope::{EnvelopeError, EventEnvelope, EventType};
pub use handler::{HandlerError, RecordHandler};
pub use headers::{
    FORWARDED_HEADERS, ForwardedHeaders, OKAPI_TENANT_HEADER, OKAPI_URL_HEADER, RecordHeaders,
};
pub use in_memory_broker::{AdminStats, InMemoryBroker};
pub use topic::{
    Environment, QualifiedTopicName, SubscriptionPattern, TopicIdentity, TopicNameParts,
    qualified_name,
};
