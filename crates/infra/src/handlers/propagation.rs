//! Applying an upstream change to every dependent request.

use circstore_circulation::{Collection, SearchIndex};
use circstore_core::TenantId;
use circstore_events::{ConsumedRecord, EventEnvelope, ForwardedHeaders, HandlerError, TopicNameParts};
use tracing::{debug, warn};

use crate::repository::{RecordRepository, RepositoryError};
use crate::store::StoredDocument;

/// Outcome of one propagation pass.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct PropagationReport {
    /// Requests referencing the upstream record.
    pub matched: usize,
    /// Requests rewritten (each one published its own `UPDATED` event).
    pub updated: usize,
    /// Requests whose projection was already current.
    pub unchanged: usize,
    /// Requests that could not be rewritten; logged and skipped.
    pub failed: usize,
}

/// Decoded envelope plus the context it was consumed in.
pub(crate) struct Incoming {
    pub tenant: TenantId,
    pub envelope: EventEnvelope,
    pub caller: ForwardedHeaders,
}

impl Incoming {
    /// The tenant comes from the topic name; an envelope claiming another
    /// tenant is rejected.
    pub fn decode(record: &ConsumedRecord) -> Result<Self, HandlerError> {
        let envelope = EventEnvelope::from_json(&record.payload)?;
        let parts = TopicNameParts::parse(&record.position.topic)
            .map_err(|e| HandlerError::Malformed(e.to_string()))?;

        if envelope.tenant() != &parts.tenant {
            return Err(HandlerError::Malformed(format!(
                "envelope tenant {} does not match topic tenant {}",
                envelope.tenant(),
                parts.tenant
            )));
        }

        Ok(Self {
            tenant: parts.tenant,
            envelope,
            caller: ForwardedHeaders::from_record(&record.headers),
        })
    }
}

/// Rewrite attempts per request before a run of concurrent changes counts as a failure.
const MAX_REWRITE_ATTEMPTS: usize = 5;

enum Rewrite {
    Updated,
    Unchanged,
    Failed,
}

/// Rebuild the search index of every request whose `field` equals `value`.
///
/// Only a failing lookup fails the pass. Per-request failures are counted and
/// the remaining requests are still processed.
///
/// Each rewrite is conditional on the document it was rebuilt from. When
/// another writer got there first, the request is re-read and rebuilt on top
/// of that write.
pub(crate) async fn propagate<F>(
    repository: &RecordRepository,
    incoming: &Incoming,
    field: &str,
    value: &str,
    rebuild: F,
) -> Result<PropagationReport, HandlerError>
where
    F: Fn(&SearchIndex) -> SearchIndex,
{
    let requests = repository
        .find_by_field(&incoming.tenant, Collection::Request, field, value)
        .await
        .map_err(|e| HandlerError::Failed(e.to_string()))?;

    let mut report = PropagationReport {
        matched: requests.len(),
        ..PropagationReport::default()
    };

    for request in requests {
        match rewrite(repository, incoming, request, &rebuild).await {
            Rewrite::Updated => report.updated += 1,
            Rewrite::Unchanged => report.unchanged += 1,
            Rewrite::Failed => report.failed += 1,
        }
    }

    Ok(report)
}

async fn rewrite<F>(
    repository: &RecordRepository,
    incoming: &Incoming,
    request: StoredDocument,
    rebuild: &F,
) -> Rewrite
where
    F: Fn(&SearchIndex) -> SearchIndex,
{
    let id = request.id;
    let mut read = request.document;

    for attempt in 1..=MAX_REWRITE_ATTEMPTS {
        let current = match SearchIndex::of_record(&read) {
            Ok(index) => index,
            Err(e) => {
                warn!(request_id = %id, error = %e, "skipping request with unreadable search index");
                return Rewrite::Failed;
            }
        };

        let rebuilt = rebuild(&current);
        if rebuilt == current {
            return Rewrite::Unchanged;
        }

        let mut document = read.clone();
        if let Err(e) = rebuilt.write_to(&mut document) {
            warn!(request_id = %id, error = %e, "could not write search index");
            return Rewrite::Failed;
        }

        match repository
            .update_if_unchanged(
                &incoming.tenant,
                Collection::Request,
                id,
                &read,
                document,
                &incoming.caller,
            )
            .await
        {
            Ok(_) => return Rewrite::Updated,
            Err(RepositoryError::Conflict { .. }) => {
                debug!(request_id = %id, attempt, "request changed concurrently; re-reading");
            }
            Err(e) => {
                warn!(request_id = %id, error = %e, "request update failed");
                return Rewrite::Failed;
            }
        }

        read = match repository
            .get(&incoming.tenant, Collection::Request, id)
            .await
        {
            Ok(Some(latest)) => latest.document,
            Ok(None) => {
                debug!(request_id = %id, "request removed before it could be rewritten");
                return Rewrite::Unchanged;
            }
            Err(e) => {
                warn!(request_id = %id, error = %e, "request re-read failed");
                return Rewrite::Failed;
            }
        };
    }

    warn!(request_id = %id, attempts = MAX_REWRITE_ATTEMPTS, "request kept changing; giving up");
    Rewrite::Failed
}
