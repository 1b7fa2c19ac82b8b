//! Hard limits applied at the engine boundary.

use crate::model::{Ms, MS_PER_HOUR};

const DAY_MS: Ms = 24 * MS_PER_HOUR;

pub const MAX_TITLE_LEN: usize = 200;
pub const MAX_NAME_LEN: usize = 100;
pub const MAX_KIND_LEN: usize = 50;
pub const MAX_DESCRIPTION_LEN: usize = 4096;

/// 1970-01-01.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 2200-01-01.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;
/// Events and allocations may span up to ten years.
pub const MAX_SPAN_DURATION_MS: Ms = 3_660 * DAY_MS;
/// Report windows may span up to twenty years.
pub const MAX_QUERY_WINDOW_MS: Ms = 7_320 * DAY_MS;

pub const MAX_EVENTS: usize = 1_000_000;
pub const MAX_RESOURCES: usize = 100_000;
pub const MAX_ALLOCATIONS_PER_RESOURCE: usize = 100_000;
pub const MAX_BATCH_SIZE: usize = 1_000;
pub const MAX_RECENT_ALLOCATIONS: usize = 100;
