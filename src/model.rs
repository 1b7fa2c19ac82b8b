use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::EngineError;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub const MS_PER_HOUR: Ms = 3_600_000;

/// Half-open interval `[start, end)` with `start < end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawSpan")]
pub struct Span {
    start: Ms,
    end: Ms,
}

#[derive(Deserialize)]
struct RawSpan {
    start: Ms,
    end: Ms,
}

impl TryFrom<RawSpan> for Span {
    type Error = EngineError;

    fn try_from(raw: RawSpan) -> Result<Self, Self::Error> {
        Span::new(raw.start, raw.end)
    }
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Result<Self, EngineError> {
        if start >= end {
            return Err(EngineError::InvalidInterval { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> Ms {
        self.start
    }

    pub fn end(&self) -> Ms {
        self.end
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn duration_hours(&self) -> f64 {
        self.duration_ms() as f64 / MS_PER_HOUR as f64
    }

    /// Touching endpoints do not overlap: `[9, 10)` and `[10, 11)` are disjoint.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Clip to `[range_start, range_end)`. `None` when nothing is left,
    /// including for empty or inverted ranges.
    pub fn within_range(&self, range_start: Ms, range_end: Ms) -> Option<Span> {
        let start = self.start.max(range_start);
        let end = self.end.min(range_end);
        (start < end).then_some(Span { start, end })
    }
}

// ── Records ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: Ulid,
    pub title: String,
    pub description: Option<String>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: Ulid,
    pub name: String,
    /// Free-form category, e.g. "room" or "projector".
    pub kind: Option<String>,
    /// Informational only. Any two overlapping allocations conflict regardless.
    pub capacity: Option<u32>,
}

/// Binding of one resource to one event for an interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: Ulid,
    pub event_id: Ulid,
    pub resource_id: Ulid,
    pub span: Span,
    /// False while the span mirrors the event's span; such allocations move
    /// with the event when it is rescheduled.
    pub custom_span: bool,
    /// Store-assigned creation sequence.
    pub seq: u64,
}

/// The log record types. Flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change {
    EventCreated {
        id: Ulid,
        title: String,
        description: Option<String>,
        span: Span,
    },
    /// One record per edit so a reschedule is all-or-nothing on disk.
    /// `moved` holds the allocations whose span changes with the event.
    EventUpdated {
        id: Ulid,
        title: String,
        description: Option<String>,
        span: Span,
        moved: Vec<(Ulid, Span)>,
    },
    EventDeleted {
        id: Ulid,
    },
    ResourceCreated {
        id: Ulid,
        name: String,
        kind: Option<String>,
        capacity: Option<u32>,
    },
    ResourceUpdated {
        id: Ulid,
        name: String,
        kind: Option<String>,
        capacity: Option<u32>,
    },
    ResourceDeleted {
        id: Ulid,
    },
    AllocationCreated {
        id: Ulid,
        event_id: Ulid,
        resource_id: Ulid,
        span: Span,
        custom_span: bool,
        seq: u64,
    },
    AllocationUpdated {
        id: Ulid,
        resource_id: Ulid,
        span: Span,
        custom_span: bool,
    },
    AllocationDeleted {
        id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

/// Which allocations a conflict scan looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    AllResources,
    SingleResource(Ulid),
}

/// Two allocations on the same resource whose spans overlap.
/// `first < second`; the derived ordering is resource, then first, then second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConflictPair {
    pub resource_id: Ulid,
    pub first: Ulid,
    pub second: Ulid,
}

impl ConflictPair {
    pub fn new(resource_id: Ulid, a: Ulid, b: Ulid) -> Self {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        Self { resource_id, first, second }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UsageReport {
    pub resource_id: Ulid,
    pub total_hours: f64,
    pub allocation_count: usize,
    /// Percentage of the range covered, `0..=100`.
    pub utilization: f64,
    /// Allocations starting at or after `now`, ascending by start.
    pub upcoming: Vec<Allocation>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DashboardSummary {
    pub active_event_count: usize,
    pub resource_count: usize,
    pub overall_utilization: f64,
    pub conflict_count: usize,
    /// Newest first.
    pub recent_allocations: Vec<Allocation>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = MS_PER_HOUR;

    fn span(start: Ms, end: Ms) -> Span {
        Span::new(start, end).unwrap()
    }

    #[test]
    fn span_basics() {
        let s = span(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn span_rejects_empty_and_inverted() {
        assert!(matches!(
            Span::new(100, 100),
            Err(EngineError::InvalidInterval { start: 100, end: 100 })
        ));
        assert!(matches!(
            Span::new(200, 100),
            Err(EngineError::InvalidInterval { .. })
        ));
    }

    #[test]
    fn span_overlap() {
        let a = span(100, 200);
        let b = span(150, 250);
        let c = span(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn overlap_is_symmetric() {
        let spans = [
            span(0, 10),
            span(5, 15),
            span(10, 20),
            span(2, 3),
            span(-5, 0),
            span(0, 100),
        ];
        for a in &spans {
            for b in &spans {
                assert_eq!(a.overlaps(b), b.overlaps(a), "{a:?} vs {b:?}");
            }
        }
    }

    #[test]
    fn back_to_back_hours_do_not_overlap() {
        assert!(!span(9 * H, 10 * H).overlaps(&span(10 * H, 11 * H)));
        assert!(span(9 * H, 11 * H).overlaps(&span(10 * H, 12 * H)));
    }

    #[test]
    fn duration_in_hours() {
        assert_eq!(span(9 * H, 11 * H).duration_hours(), 2.0);
        assert_eq!(span(0, H / 4).duration_hours(), 0.25);
    }

    #[test]
    fn span_contains_span() {
        let outer = span(100, 400);
        let inner = span(150, 300);
        let partial = span(50, 200);
        assert!(outer.contains_span(&inner));
        assert!(outer.contains_span(&outer)); // self-containment
        assert!(!outer.contains_span(&partial));
    }

    #[test]
    fn within_range_clips() {
        let s = span(100, 400);
        assert_eq!(s.within_range(200, 300), Some(span(200, 300)));
        assert_eq!(s.within_range(0, 150), Some(span(100, 150)));
        assert_eq!(s.within_range(0, 1000), Some(s));
    }

    #[test]
    fn within_range_disjoint_or_degenerate() {
        let s = span(100, 200);
        assert_eq!(s.within_range(200, 300), None); // touching
        assert_eq!(s.within_range(0, 100), None);
        assert_eq!(s.within_range(150, 150), None); // empty range
        assert_eq!(s.within_range(180, 120), None); // inverted range
    }

    #[test]
    fn conflict_pair_normalizes_order() {
        let r = Ulid::from(1u128);
        let a = Ulid::from(5u128);
        let b = Ulid::from(3u128);
        let p = ConflictPair::new(r, a, b);
        assert_eq!(p.first, b);
        assert_eq!(p.second, a);
        assert_eq!(p, ConflictPair::new(r, b, a));
    }

    #[test]
    fn change_serialization_roundtrip() {
        let change = Change::EventCreated {
            id: Ulid::new(),
            title: "Standup".into(),
            description: None,
            span: span(9 * H, 10 * H),
        };
        let bytes = bincode::serialize(&change).unwrap();
        let decoded: Change = bincode::deserialize(&bytes).unwrap();
        assert_eq!(change, decoded);
    }

    #[test]
    fn inverted_span_fails_to_deserialize() {
        let bytes = bincode::serialize(&(500i64, 100i64)).unwrap();
        assert!(bincode::deserialize::<Span>(&bytes).is_err());
    }
}
