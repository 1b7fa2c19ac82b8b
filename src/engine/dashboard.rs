use crate::model::*;

use super::conflict::live_allocations_for_resource;
use super::detect::detect_conflicts;
use super::store::Store;
use super::usage::summarize_usage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DashboardOptions {
    /// Trailing window for utilization, ending at `now`.
    pub window_ms: Ms,
    /// How many of the newest allocations to return.
    pub recent_limit: usize,
}

impl Default for DashboardOptions {
    fn default() -> Self {
        Self {
            window_ms: 30 * 24 * MS_PER_HOUR,
            recent_limit: 5,
        }
    }
}

/// Headline numbers for the landing page.
///
/// Never fails: an empty store yields zero counts, zero utilization and an
/// empty recent list.
pub fn summarize<S: Store + ?Sized>(store: &S, now: Ms, options: &DashboardOptions) -> DashboardSummary {
    let active_event_count = store
        .list_events()
        .iter()
        .filter(|e| e.span.contains_instant(now))
        .count();

    let resources = store.list_resources();
    let window_start = now.saturating_sub(options.window_ms);

    let mut all_allocations = Vec::new();
    let mut utilization_sum = 0.0;
    for r in &resources {
        let allocations = live_allocations_for_resource(store, r.id);
        utilization_sum += summarize_usage(&allocations, r.id, window_start, now, now).utilization;
        all_allocations.extend(allocations);
    }
    let overall_utilization = if resources.is_empty() {
        0.0
    } else {
        utilization_sum / resources.len() as f64
    };

    let conflict_count = detect_conflicts(&all_allocations, Scope::AllResources).len();

    all_allocations.sort_by(|a, b| b.seq.cmp(&a.seq).then(b.id.cmp(&a.id)));
    all_allocations.truncate(options.recent_limit);

    DashboardSummary {
        active_event_count,
        resource_count: resources.len(),
        overall_utilization,
        conflict_count,
        recent_allocations: all_allocations,
    }
}
