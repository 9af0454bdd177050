use async_trait::async_trait;
use tracing::{debug, info};

use circstore_circulation::{ITEM_ID_FIELD, ItemSnapshot, shelving_changed};
use circstore_events::{ConsumedRecord, EventType, HandlerError, RecordHandler};

use super::propagation::{Incoming, PropagationReport, propagate};
use crate::repository::RecordRepository;

/// Keeps the item-derived part of request search indexes current.
///
/// On an item `UPDATED` event whose call number or shelving order changed,
/// every request for the item gets `callNumberComponents` and
/// `shelvingOrder` rebuilt from the new snapshot. Other event types are
/// ignored.
#[derive(Clone)]
pub struct ItemUpdateHandler {
    repository: RecordRepository,
}

impl ItemUpdateHandler {
    pub fn new(repository: RecordRepository) -> Self {
        Self { repository }
    }

    /// Handle one record. `None` means nothing needed doing.
    pub async fn apply(
        &self,
        record: &ConsumedRecord,
    ) -> Result<Option<PropagationReport>, HandlerError> {
        let incoming = Incoming::decode(record)?;
        if incoming.envelope.event_type() != EventType::Updated {
            debug!(event_type = %incoming.envelope.event_type(), "ignoring item event");
            return Ok(None);
        }

        let old: ItemSnapshot = incoming.envelope.decode_old()?;
        let new: ItemSnapshot = incoming.envelope.decode_new()?;
        if !shelving_changed(&old, &new) {
            debug!(item_id = %new.id, "item shelving location unchanged");
            return Ok(None);
        }

        let location = new.shelving_location();
        let report = propagate(&self.repository, &incoming, ITEM_ID_FIELD, &new.id, |index| {
            index.with_shelving_location(&location)
        })
        .await?;

        info!(
            tenant = %incoming.tenant,
            item_id = %new.id,
            matched = report.matched,
            updated = report.updated,
            unchanged = report.unchanged,
            failed = report.failed,
            "item change propagated to requests"
        );
        Ok(Some(report))
    }
}

#[async_trait]
impl RecordHandler for ItemUpdateHandler {
    async fn handle(&self, record: &ConsumedRecord) -> Result<(), HandlerError> {
        self.apply(record).await.map(|_| ())
    }
}
