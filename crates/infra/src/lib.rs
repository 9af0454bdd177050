//! Infrastructure layer: config, storage, topic provisioning, publishing and
//! consumption of change events.

pub mod broker;
pub mod config;
pub mod consumer;
pub mod handlers;
pub mod provisioning;
pub mod publisher;
pub mod repository;
pub mod store;

#[cfg(test)]
mod integration_tests;

pub use config::{BrokerConfig, ConfigError, ServiceConfig};
pub use consumer::{ConsumerError, ConsumerGroup, ConsumerSettings, ConsumerStatus, LoadSensor};
pub use handlers::{ItemUpdateHandler, PropagationReport, ServicePointUpdateHandler, handler_for};
pub use provisioning::{ProvisionError, RetryPolicy, TopicProvisioner};
pub use publisher::{EnvelopeBuilder, EventPublisher, PublishError};
pub use repository::{RecordRepository, RepositoryError};
pub use store::{DocumentStore, InMemoryDocumentStore, PostgresDocumentStore, StoreError, StoredDocument};
