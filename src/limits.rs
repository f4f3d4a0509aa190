/// Longest bookable rehearsal, in minutes.
pub const MAX_BOOKING_MINUTES: i64 = 24 * 60;

pub const MAX_NAME_LEN: usize = 256;

pub const MAX_BANDS: usize = 10_000;

pub const MAX_MUSICIANS: usize = 100_000;

pub const MAX_BOOKINGS_PER_ROOM: usize = 200_000;

/// Widest window the schedule listing accepts.
pub const MAX_SCHEDULE_DAYS: i64 = 366;

/// Default row count of the rehearsal-hours report.
pub const DEFAULT_REPORT_LIMIT: usize = 10;

/// Window of the schedule listing when no `days` filter is given.
pub const DEFAULT_SCHEDULE_DAYS: i64 = 7;

/// Bookable calendar years, inclusive.
pub const MIN_BOOKING_YEAR: i32 = 1900;
pub const MAX_BOOKING_YEAR: i32 = 9999;
