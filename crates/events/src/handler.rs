use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::broker::ConsumedRecord;
use crate::envelope::EnvelopeError;

/// Failure of a single record's handling.
///
/// Handler failures are isolated per record: the consumer logs them and moves
/// on, they never stop the consumer loop.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The record could not be decoded into what the handler expects.
    #[error("malformed record: {0}")]
    Malformed(String),

    /// The handler could not complete its work.
    #[error("handler failed: {0}")]
    Failed(String),
}

impl From<EnvelopeError> for HandlerError {
    fn from(value: EnvelopeError) -> Self {
        HandlerError::Malformed(value.to_string())
    }
}

/// Processes consumed records (dispatch target of a consumer group).
///
/// Delivery is at-least-once, so implementations must be idempotent: handling
/// the same record twice must leave the same state as handling it once.
#[async_trait]
pub trait RecordHandler: Send + Sync {
    async fn handle(&self, record: &ConsumedRecord) -> Result<(), HandlerError>;
}

#[async_trait]
impl<H> RecordHandler for Arc<H>
where
    H: RecordHandler + ?Sized,
{
    async fn handle(&self, record: &ConsumedRecord) -> Result<(), HandlerError> {
        (**self).handle(record).await
    }
}
