use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;

use circstore_core::TenantId;
use circstore_infra::broker::RedisStreamsBroker;
use circstore_infra::{PostgresDocumentStore, ServiceConfig};
use circstore_service::{BrokerHandles, CirculationEventsService};

const DATABASE_URL: &str = "DATABASE_URL";
/// Comma-separated tenants whose topics are provisioned at startup.
const ENABLED_TENANTS: &str = "ENABLED_TENANTS";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    circstore_observability::init();

    let config = ServiceConfig::from_env().context("invalid configuration")?;
    let database_url = std::env::var(DATABASE_URL).context("DATABASE_URL must be set")?;
    let tenants = enabled_tenants(std::env::var(ENABLED_TENANTS).ok().as_deref())?;

    let pool = PgPool::connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;
    let broker = RedisStreamsBroker::open(format!("redis://{}", config.broker.address()), None)
        .context("failed to create Redis Streams broker")?;

    tracing::info!(
        broker = %config.broker.address(),
        environment = %config.environment,
        module = %config.module_name,
        instance = %config.instance_id,
        "starting circulation events service"
    );

    let service = CirculationEventsService::new(
        config,
        BrokerHandles::shared(broker),
        Arc::new(PostgresDocumentStore::new(pool)),
    );

    for tenant in &tenants {
        service
            .enable_tenant(tenant)
            .await
            .with_context(|| format!("failed to enable tenant {tenant}"))?;
    }
    service.start().await.context("failed to start consumers")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");

    service.shutdown().await.context("shutdown failed")?;
    Ok(())
}

fn enabled_tenants(raw: Option<&str>) -> anyhow::Result<Vec<TenantId>> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| TenantId::parse(t).with_context(|| format!("invalid tenant id {t:?}")))
        .collect()
}
