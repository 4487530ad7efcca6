use crate::model::Ms;

const DAY_MS: Ms = 86_400_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_ADDRESS_LEN: usize = 1024;
pub const MAX_DETAILS_LEN: usize = 8192;
/// Serialized size of a workspace property map.
pub const MAX_PROPERTIES_BYTES: usize = 64 * 1024;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

/// Widest booking, offering or assignment accepted.
pub const MAX_SPAN_DURATION_MS: Ms = 3660 * DAY_MS;
/// Widest window an availability query may ask about.
pub const MAX_QUERY_WINDOW_MS: Ms = 400 * DAY_MS;

/// Floor-plan uploads.
pub const MAX_FLOOR_PLAN_BYTES: usize = 6 << 20;

/// Largest WAL frame written or accepted on replay.
pub const MAX_WAL_FRAME_BYTES: usize = 16 << 20;
