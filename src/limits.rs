use crate::model::Ms;

pub const MAX_PROVIDERS: usize = 10_000;
pub const MAX_BOOKINGS_PER_PROVIDER: usize = 100_000;
pub const MAX_WAITLIST_PER_PROVIDER: usize = 10_000;
pub const MAX_NAME_LEN: usize = 256;

/// 2100-01-01.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
