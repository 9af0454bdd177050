//! Handlers for consumed upstream topics, and the table that picks them.

pub mod item_update;
pub mod propagation;
pub mod service_point_update;

use std::sync::Arc;

use circstore_circulation::ConsumedTopic;
use circstore_events::RecordHandler;

use crate::repository::RecordRepository;

pub use item_update::ItemUpdateHandler;
pub use propagation::PropagationReport;
pub use service_point_update::ServicePointUpdateHandler;

/// The handler for a consumed topic. Resolved once, when consumers start.
pub fn handler_for(topic: ConsumedTopic, repository: RecordRepository) -> Arc<dyn RecordHandler> {
    match topic {
        ConsumedTopic::InventoryItem => Arc::new(ItemUpdateHandler::new(repository)),
        ConsumedTopic::InventoryServicePoint => Arc::new(ServicePointUpdateHandler::new(repository)),
    }
}
