use ulid::Ulid;

use crate::model::*;

use super::store::Store;
use super::EngineError;

/// A candidate allocation. `span: None` means "the event's span".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Proposal {
    pub resource_id: Ulid,
    pub event_id: Ulid,
    pub span: Option<Span>,
    /// The allocation being edited, left out of the comparison set.
    pub exclude: Option<Ulid>,
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.start() < MIN_VALID_TIMESTAMP_MS || span.end() > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

/// Decide `span` for (`resource_id`, `event_id`) against `existing`.
///
/// `existing` must be sorted ascending by id so the reported conflict is the
/// lowest-id one. An identical (resource, event, span) triple is a duplicate,
/// checked across the whole set before any overlap is reported.
pub fn check_allocation(
    existing: &[Allocation],
    resource_id: Ulid,
    event_id: Ulid,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    let candidates: Vec<&Allocation> = existing
        .iter()
        .filter(|a| a.resource_id == resource_id && Some(a.id) != exclude)
        .collect();

    if let Some(dup) = candidates.iter().find(|a| a.event_id == event_id && a.span == *span) {
        return Err(EngineError::DuplicateAllocation(dup.id));
    }
    match candidates.iter().find(|a| a.span.overlaps(span)) {
        Some(hit) => Err(EngineError::Conflict(hit.id)),
        None => Ok(()),
    }
}

/// Resolve a proposal against the store and decide it.
///
/// Returns the effective span on acceptance. Allocations whose event no
/// longer exists are not compared against.
pub fn validate_allocation<S: Store + ?Sized>(store: &S, proposal: &Proposal) -> Result<Span, EngineError> {
    store
        .get_resource(proposal.resource_id)
        .ok_or(EngineError::NotFound(proposal.resource_id))?;
    let event = store
        .get_event(proposal.event_id)
        .ok_or(EngineError::NotFound(proposal.event_id))?;

    let span = match proposal.span {
        Some(span) => {
            if !event.span.contains_span(&span) {
                return Err(EngineError::OutsideEvent {
                    allocation: span,
                    event: event.span,
                });
            }
            span
        }
        None => event.span,
    };

    let existing = live_allocations_for_resource(store, proposal.resource_id);
    check_allocation(&existing, proposal.resource_id, proposal.event_id, &span, proposal.exclude)?;
    Ok(span)
}

/// Allocations on a resource whose event still resolves, ascending by id.
pub(crate) fn live_allocations_for_resource<S: Store + ?Sized>(store: &S, resource_id: Ulid) -> Vec<Allocation> {
    let mut allocs = store.allocations_for_resource(resource_id);
    allocs.retain(|a| store.get_event(a.event_id).is_some());
    allocs
}
