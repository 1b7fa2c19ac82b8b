use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{live_allocations_for_resource, validate_span, Proposal};
use super::store::Store;
use super::{dashboard, detect, usage, Engine, EngineError};

fn check_window(range_start: Ms, range_end: Ms) -> Result<(), EngineError> {
    if range_end.saturating_sub(range_start) > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(())
}

impl Engine {
    pub fn get_event(&self, id: Ulid) -> Option<Event> {
        self.store.get_event(id)
    }

    pub fn get_resource(&self, id: Ulid) -> Option<Resource> {
        self.store.get_resource(id)
    }

    pub fn get_allocation(&self, id: Ulid) -> Option<Allocation> {
        self.store.get_allocation(&id)
    }

    pub fn list_events(&self) -> Vec<Event> {
        self.store.list_events()
    }

    pub fn list_resources(&self) -> Vec<Resource> {
        self.store.list_resources()
    }

    /// All allocations, or those on one resource; ascending by id.
    pub fn list_allocations(&self, resource_id: Option<Ulid>) -> Vec<Allocation> {
        match resource_id {
            Some(rid) => self.store.allocations_for_resource(rid),
            None => self.store.list_allocations(),
        }
    }

    /// Dry run: would this allocation be accepted right now? Returns the
    /// span it would occupy.
    pub fn validate_allocation(&self, proposal: &Proposal) -> Result<Span, EngineError> {
        if let Some(ref s) = proposal.span {
            validate_span(s)?;
        }
        super::validate_allocation(&self.store, proposal)
    }

    pub fn detect_conflicts(&self, scope: Scope) -> Result<Vec<ConflictPair>, EngineError> {
        let pairs = detect::detect_in_store(&self.store, scope)?;
        metrics::gauge!(crate::observability::CONFLICTS_FOUND).set(pairs.len() as f64);
        Ok(pairs)
    }

    pub fn usage_report(
        &self,
        resource_id: Ulid,
        range_start: Ms,
        range_end: Ms,
        now: Ms,
    ) -> Result<UsageReport, EngineError> {
        check_window(range_start, range_end)?;
        usage::usage_report(&self.store, resource_id, range_start, range_end, now)
    }

    pub fn usage_report_all(&self, range_start: Ms, range_end: Ms, now: Ms) -> Result<Vec<UsageReport>, EngineError> {
        check_window(range_start, range_end)?;
        Ok(usage::usage_report_all(&self.store, range_start, range_end, now))
    }

    /// Allocations on a resource starting at or after `now`, soonest first.
    pub fn upcoming(&self, resource_id: Ulid, now: Ms) -> Result<Vec<Allocation>, EngineError> {
        self.store
            .get_resource(resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let mut upcoming: Vec<Allocation> = live_allocations_for_resource(&self.store, resource_id)
            .into_iter()
            .filter(|a| a.span.start() >= now)
            .collect();
        upcoming.sort_by_key(|a| (a.span.start(), a.id));
        Ok(upcoming)
    }

    pub fn dashboard_summary(&self, now: Ms) -> DashboardSummary {
        dashboard::summarize(&self.store, now, &self.options)
    }
}
