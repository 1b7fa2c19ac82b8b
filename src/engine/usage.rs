use ulid::Ulid;

use crate::model::*;

use super::conflict::live_allocations_for_resource;
use super::store::Store;
use super::EngineError;

/// `total_hours` as a share of `[range_start, range_end)`, clamped to
/// `0..=100`. Zero for an empty or inverted range.
pub fn utilization_percentage(total_hours: f64, range_start: Ms, range_end: Ms) -> f64 {
    if range_end <= range_start {
        return 0.0;
    }
    let range_hours = (range_end - range_start) as f64 / MS_PER_HOUR as f64;
    (total_hours / range_hours * 100.0).clamp(0.0, 100.0)
}

/// Usage of one resource over `[range_start, range_end)`.
///
/// Allocations are clipped to the range before summing; only those with a
/// non-empty clip are counted. `upcoming` is independent of the range: every
/// allocation starting at or after `now`, ascending by start then id.
pub fn summarize_usage(
    allocations: &[Allocation],
    resource_id: Ulid,
    range_start: Ms,
    range_end: Ms,
    now: Ms,
) -> UsageReport {
    let mut total_hours = 0.0;
    let mut allocation_count = 0;
    let mut upcoming = Vec::new();

    for a in allocations.iter().filter(|a| a.resource_id == resource_id) {
        if let Some(clipped) = a.span.within_range(range_start, range_end) {
            total_hours += clipped.duration_hours();
            allocation_count += 1;
        }
        if a.span.start() >= now {
            upcoming.push(a.clone());
        }
    }
    upcoming.sort_by_key(|a| (a.span.start(), a.id));

    UsageReport {
        resource_id,
        total_hours,
        allocation_count,
        utilization: utilization_percentage(total_hours, range_start, range_end),
        upcoming,
    }
}

pub fn usage_report<S: Store + ?Sized>(
    store: &S,
    resource_id: Ulid,
    range_start: Ms,
    range_end: Ms,
    now: Ms,
) -> Result<UsageReport, EngineError> {
    store
        .get_resource(resource_id)
        .ok_or(EngineError::NotFound(resource_id))?;
    let allocations = live_allocations_for_resource(store, resource_id);
    Ok(summarize_usage(&allocations, resource_id, range_start, range_end, now))
}

/// One report per resource, ascending by resource id.
pub fn usage_report_all<S: Store + ?Sized>(store: &S, range_start: Ms, range_end: Ms, now: Ms) -> Vec<UsageReport> {
    store
        .list_resources()
        .into_iter()
        .map(|r| {
            let allocations = live_allocations_for_resource(store, r.id);
            summarize_usage(&allocations, r.id, range_start, range_end, now)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = MS_PER_HOUR;
    const DAY: Ms = 24 * H;
    const ROOM: Ulid = Ulid(1);
    /// 2024-01-01T00:00:00Z
    const JAN_1_2024: Ms = 1_704_067_200_000;

    fn alloc(id: u128, resource: Ulid, start: Ms, end: Ms) -> Allocation {
        Allocation {
            id: Ulid(id),
            event_id: Ulid(1000 + id),
            resource_id: resource,
            span: Span::new(start, end).unwrap(),
            custom_span: false,
            seq: id as u64,
        }
    }

    #[test]
    fn clipping_counts_only_the_window() {
        let jan = |d: Ms| JAN_1_2024 + (d - 1) * DAY;
        let allocs = [alloc(1, ROOM, jan(1), jan(10))];
        let report = summarize_usage(&allocs, ROOM, jan(5), jan(8), 0);
        assert_eq!(report.total_hours, 72.0);
        assert_eq!(report.allocation_count, 1);
        assert_eq!(report.utilization, 100.0);
    }

    #[test]
    fn allocations_outside_window_not_counted() {
        let allocs = [
            alloc(1, ROOM, 0, 2 * H),
            alloc(2, ROOM, 10 * H, 12 * H),
            alloc(3, ROOM, 20 * H, 30 * H),
        ];
        let report = summarize_usage(&allocs, ROOM, 2 * H, 20 * H, 0);
        assert_eq!(report.allocation_count, 1);
        assert_eq!(report.total_hours, 2.0);
    }

    #[test]
    fn utilization_is_a_share_of_the_window() {
        let allocs = [alloc(1, ROOM, 0, 6 * H)];
        let report = summarize_usage(&allocs, ROOM, 0, 24 * H, 0);
        assert_eq!(report.utilization, 25.0);
    }

    #[test]
    fn overlapping_allocations_clamp_at_hundred() {
        let allocs = [alloc(1, ROOM, 0, 10 * H), alloc(2, ROOM, 0, 10 * H)];
        let report = summarize_usage(&allocs, ROOM, 0, 10 * H, 0);
        assert_eq!(report.total_hours, 20.0);
        assert_eq!(report.utilization, 100.0);
    }

    #[test]
    fn degenerate_ranges_degrade_to_zero() {
        let allocs = [alloc(1, ROOM, 0, 10 * H)];
        let empty = summarize_usage(&allocs, ROOM, 5 * H, 5 * H, 0);
        assert_eq!(empty.total_hours, 0.0);
        assert_eq!(empty.allocation_count, 0);
        assert_eq!(empty.utilization, 0.0);

        let inverted = summarize_usage(&allocs, ROOM, 8 * H, 2 * H, 0);
        assert_eq!(inverted.total_hours, 0.0);
        assert_eq!(inverted.utilization, 0.0);
    }

    #[test]
    fn utilization_percentage_guards() {
        assert_eq!(utilization_percentage(5.0, 0, 0), 0.0);
        assert_eq!(utilization_percentage(5.0, 10, 0), 0.0);
        assert_eq!(utilization_percentage(0.0, 0, 10 * H), 0.0);
        assert_eq!(utilization_percentage(5.0, 0, 10 * H), 50.0);
        assert_eq!(utilization_percentage(50.0, 0, 10 * H), 100.0);
    }

    #[test]
    fn upcoming_sorted_and_inclusive_of_now() {
        let allocs = [
            alloc(3, ROOM, 30 * H, 31 * H),
            alloc(1, ROOM, 5 * H, 6 * H),
            alloc(2, ROOM, 10 * H, 11 * H),
            alloc(4, ROOM, 10 * H, 12 * H),
        ];
        let report = summarize_usage(&allocs, ROOM, 0, DAY, 10 * H);
        let ids: Vec<Ulid> = report.upcoming.iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![Ulid(2), Ulid(4), Ulid(3)]);
    }

    #[test]
    fn upcoming_ignores_the_window() {
        let allocs = [alloc(1, ROOM, 100 * DAY, 101 * DAY)];
        let report = summarize_usage(&allocs, ROOM, 0, DAY, 0);
        assert_eq!(report.allocation_count, 0);
        assert_eq!(report.upcoming.len(), 1);
    }

    #[test]
    fn other_resources_ignored() {
        let allocs = [alloc(1, Ulid(2), 0, 10 * H)];
        let report = summarize_usage(&allocs, ROOM, 0, 10 * H, 0);
        assert_eq!(report.allocation_count, 0);
        assert!(report.upcoming.is_empty());
    }
}
