use async_trait::async_trait;
use tracing::{debug, info};

use circstore_circulation::{PICKUP_SERVICE_POINT_ID_FIELD, ServicePointSnapshot};
use circstore_events::{ConsumedRecord, EventType, HandlerError, RecordHandler};

use super::propagation::{Incoming, PropagationReport, propagate};
use crate::repository::RecordRepository;

/// Copies renamed service points onto requests picked up there.
#[derive(Clone)]
pub struct ServicePointUpdateHandler {
    repository: RecordRepository,
}

impl ServicePointUpdateHandler {
    pub fn new(repository: RecordRepository) -> Self {
        Self { repository }
    }

    pub async fn apply(
        &self,
        record: &ConsumedRecord,
    ) -> Result<Option<PropagationReport>, HandlerError> {
        let incoming = Incoming::decode(record)?;
        if incoming.envelope.event_type() != EventType::Updated {
            return Ok(None);
        }

        let old: ServicePointSnapshot = incoming.envelope.decode_old()?;
        let new: ServicePointSnapshot = incoming.envelope.decode_new()?;
        if !old.name_changed(&new) {
            debug!(service_point_id = %new.id, "service point name unchanged");
            return Ok(None);
        }

        let name = new.name.as_deref();
        let report = propagate(
            &self.repository,
            &incoming,
            PICKUP_SERVICE_POINT_ID_FIELD,
            &new.id,
            |index| index.with_pickup_service_point_name(name),
        )
        .await?;

        info!(
            tenant = %incoming.tenant,
            service_point_id = %new.id,
            updated = report.updated,
            failed = report.failed,
            "service point rename propagated to requests"
        );
        Ok(Some(report))
    }
}

#[async_trait]
impl RecordHandler for ServicePointUpdateHandler {
    async fn handle(&self, record: &ConsumedRecord) -> Result<(), HandlerError> {
        self.apply(record).await.map(|_| ())
    }
}
