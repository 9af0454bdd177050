use std::sync::Arc;

use thiserror::Error;
use tracing::{info, instrument, warn};

use circstore_circulation::{ConsumedTopic, produced_topics};
use circstore_core::TenantId;
use circstore_events::{AdminConnector, ConsumerConnector, RecordProducer};
use circstore_infra::consumer::ConsumerState;
use circstore_infra::{
    ConsumerError, ConsumerGroup, ConsumerSettings, ConsumerStatus, DocumentStore, EnvelopeBuilder,
    EventPublisher, LoadSensor, ProvisionError, RecordRepository, ServiceConfig, TopicProvisioner,
    handler_for,
};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("tenant topic provisioning failed: {0}")]
    Provision(#[from] ProvisionError),

    #[error("consumer {topic} failed: {source}")]
    Consumer {
        topic: String,
        #[source]
        source: ConsumerError,
    },
}

/// The three broker capabilities, usually all backed by one client.
#[derive(Clone)]
pub struct BrokerHandles {
    pub admin: Arc<dyn AdminConnector>,
    pub producer: Arc<dyn RecordProducer>,
    pub consumer: Arc<dyn ConsumerConnector>,
}

impl BrokerHandles {
    pub fn shared<B>(broker: B) -> Self
    where
        B: AdminConnector + RecordProducer + ConsumerConnector + 'static,
    {
        let broker = Arc::new(broker);
        Self {
            admin: broker.clone(),
            producer: broker.clone(),
            consumer: broker,
        }
    }
}

/// Tenant topic lifecycle plus one consumer per upstream topic.
///
/// Every consumer shares one [`LoadSensor`] sized by `GLOBAL_LOAD_LIMIT`.
pub struct CirculationEventsService {
    config: ServiceConfig,
    provisioner: TopicProvisioner,
    repository: RecordRepository,
    consumers: Vec<(ConsumedTopic, ConsumerGroup)>,
    load: Arc<LoadSensor>,
}

impl CirculationEventsService {
    pub fn new(config: ServiceConfig, broker: BrokerHandles, store: Arc<dyn DocumentStore>) -> Self {
        let provisioner = TopicProvisioner::from_config(broker.admin, produced_topics(), &config);
        let publisher = EventPublisher::new(broker.producer, EnvelopeBuilder::from_config(&config));
        let repository = RecordRepository::new(store, publisher);
        let load = Arc::new(LoadSensor::new(config.global_load_limit));

        let consumers = ConsumedTopic::ALL
            .into_iter()
            .map(|consumed| {
                let topic = consumed.topic();
                let group = ConsumerGroup::new(
                    topic,
                    config.environment.clone(),
                    ConsumerSettings::from_config(topic, &config),
                    broker.consumer.clone(),
                    load.clone(),
                );
                (consumed, group)
            })
            .collect();

        Self {
            config,
            provisioner,
            repository,
            consumers,
            load,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn repository(&self) -> &RecordRepository {
        &self.repository
    }

    pub fn load(&self) -> &LoadSensor {
        &self.load
    }

    /// Provision the tenant's produced topics. Safe to repeat.
    #[instrument(skip(self), fields(tenant = %tenant), err)]
    pub async fn enable_tenant(&self, tenant: &TenantId) -> Result<(), ServiceError> {
        self.provisioner
            .ensure_topics(tenant, &self.config.environment)
            .await?;
        info!("tenant enabled");
        Ok(())
    }

    /// Remove the tenant's produced topics.
    #[instrument(skip(self), fields(tenant = %tenant), err)]
    pub async fn disable_tenant(&self, tenant: &TenantId) -> Result<(), ServiceError> {
        self.provisioner
            .drop_topics(tenant, &self.config.environment)
            .await?;
        info!("tenant disabled");
        Ok(())
    }

    /// Start every consumer. If one fails, those already started are stopped
    /// again before the error is returned.
    pub async fn start(&self) -> Result<(), ServiceError> {
        for (index, (consumed, group)) in self.consumers.iter().enumerate() {
            let handler = handler_for(*consumed, self.repository.clone());
            if let Err(source) = group.start(handler).await {
                for (_, started) in &self.consumers[..index] {
                    if let Err(e) = started.stop().await {
                        warn!(topic = %started.topic().logical_name(), error = %e, "rollback stop failed");
                    }
                }
                return Err(ServiceError::Consumer {
                    topic: group.topic().logical_name(),
                    source,
                });
            }
        }
        info!(consumers = self.consumers.len(), "consumers started");
        Ok(())
    }

    /// Stop every running consumer and wait for in-flight records to finish.
    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        let mut first_error = None;
        for (_, group) in &self.consumers {
            if group.status() == ConsumerStatus::Stopped {
                continue;
            }
            if let Err(source) = group.stop().await {
                warn!(topic = %group.topic().logical_name(), error = %source, "consumer stop failed");
                first_error.get_or_insert(ServiceError::Consumer {
                    topic: group.topic().logical_name(),
                    source,
                });
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!("consumers stopped");
                Ok(())
            }
        }
    }

    pub fn consumer_states(&self) -> Vec<(ConsumedTopic, ConsumerState)> {
        self.consumers
            .iter()
            .map(|(consumed, group)| (*consumed, group.state()))
            .collect()
    }
}
