//! Per-tenant topic lifecycle.
//!
//! Provisioning is idempotent: "already exists" on create and "unknown topic"
//! on delete count as success, so concurrent enable/disable requests for the
//! same tenant converge. Any other failure retries the whole batch on a fresh
//! admin connection.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, instrument, warn};

use circstore_core::TenantId;
use circstore_events::{
    AdminConnection, AdminConnector, BrokerError, Environment, NewTopic, QualifiedTopicName,
    TopicIdentity,
};

use crate::config::ServiceConfig;

pub const DEFAULT_PROVISION_ATTEMPTS: u32 = 3;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProvisionError {
    #[error("topic provisioning gave up after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: BrokerError,
    },
}

/// Bounded retry with a fixed pause between attempts.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(DEFAULT_PROVISION_ATTEMPTS, Duration::from_millis(500))
    }
}

/// One admin batch, replayed as a whole on every attempt.
#[derive(Debug, Clone)]
enum Batch {
    Create(Vec<NewTopic>),
    Delete(Vec<QualifiedTopicName>),
}

impl Batch {
    fn name(&self) -> &'static str {
        match self {
            Batch::Create(_) => "create",
            Batch::Delete(_) => "delete",
        }
    }

    fn len(&self) -> usize {
        match self {
            Batch::Create(topics) => topics.len(),
            Batch::Delete(topics) => topics.len(),
        }
    }

    fn is_benign(&self, error: &BrokerError) -> bool {
        matches!(
            (self, error),
            (Batch::Create(_), BrokerError::TopicAlreadyExists(_))
                | (Batch::Delete(_), BrokerError::UnknownTopic(_))
        )
    }

    async fn submit(&self, admin: &mut dyn AdminConnection) -> Result<(), BrokerError> {
        let outcomes = match self {
            Batch::Create(topics) => admin.create_topics(topics).await?,
            Batch::Delete(names) => admin.delete_topics(names).await?,
        };

        for outcome in outcomes {
            match outcome.result {
                Ok(()) => {}
                Err(e) if self.is_benign(&e) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Creates and deletes a tenant's produced topics.
#[derive(Clone)]
pub struct TopicProvisioner {
    admin: Arc<dyn AdminConnector>,
    topics: Vec<TopicIdentity>,
    replication_factor: u16,
    retry: RetryPolicy,
}

impl TopicProvisioner {
    pub fn new(
        admin: Arc<dyn AdminConnector>,
        topics: Vec<TopicIdentity>,
        replication_factor: u16,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            admin,
            topics,
            replication_factor,
            retry,
        }
    }

    pub fn from_config(
        admin: Arc<dyn AdminConnector>,
        topics: Vec<TopicIdentity>,
        config: &ServiceConfig,
    ) -> Self {
        Self::new(
            admin,
            topics,
            config.broker.replication_factor,
            RetryPolicy::fixed(DEFAULT_PROVISION_ATTEMPTS, config.provision_retry_delay),
        )
    }

    /// Qualified names of every topic provisioned for `tenant`.
    pub fn topic_names(&self, tenant: &TenantId, environment: &Environment) -> Vec<QualifiedTopicName> {
        self.topics
            .iter()
            .map(|t| t.qualify(environment, tenant))
            .collect()
    }

    /// Make sure every produced topic exists for `tenant`.
    #[instrument(skip(self), fields(tenant = %tenant, environment = %environment), err)]
    pub async fn ensure_topics(
        &self,
        tenant: &TenantId,
        environment: &Environment,
    ) -> Result<(), ProvisionError> {
        let batch = self
            .topics
            .iter()
            .map(|t| NewTopic {
                name: t.qualify(environment, tenant),
                partitions: t.partitions(),
                replication_factor: self.replication_factor,
            })
            .collect();

        self.submit_with_retry(Batch::Create(batch)).await
    }

    /// Remove every produced topic of `tenant`.
    #[instrument(skip(self), fields(tenant = %tenant, environment = %environment), err)]
    pub async fn drop_topics(
        &self,
        tenant: &TenantId,
        environment: &Environment,
    ) -> Result<(), ProvisionError> {
        let names = self.topic_names(tenant, environment);
        self.submit_with_retry(Batch::Delete(names)).await
    }

    /// Every attempt opens its own connection and closes it before the next
    /// attempt starts. A failed connect is an attempt with nothing to close.
    async fn submit_with_retry(&self, batch: Batch) -> Result<(), ProvisionError> {
        let mut attempt = 0;
        loop {
            attempt += 1;

            let error = match self.admin.connect().await {
                Ok(mut admin) => {
                    let result = batch.submit(admin.as_mut()).await;
                    admin.close().await;
                    match result {
                        Ok(()) => {
                            info!(
                                operation = batch.name(),
                                topics = batch.len(),
                                attempt,
                                "tenant topics reconciled"
                            );
                            return Ok(());
                        }
                        Err(e) => e,
                    }
                }
                Err(e) => e,
            };

            if attempt >= self.retry.max_attempts {
                return Err(ProvisionError::Exhausted {
                    attempts: attempt,
                    source: error,
                });
            }

            warn!(
                operation = batch.name(),
                attempt,
                max_attempts = self.retry.max_attempts,
                error = %error,
                "topic provisioning attempt failed; retrying"
            );
            tokio::time::sleep(self.retry.delay).await;
        }
    }
}
