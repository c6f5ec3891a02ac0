//! Hard bounds. Every untrusted input is checked against one of these before
//! it can grow state or produce an unbounded scan.

use crate::model::Ms;

/// How far in the past a booking may start (clock-skew tolerance).
pub const START_GRACE_MS: Ms = 60_000;

/// How far ahead a booking may start.
pub const BOOKING_HORIZON_MS: Ms = 90 * 24 * 3_600_000;

/// An approved booking whose window ended more than this long ago, without a
/// check-in, is a no-show.
pub const NO_SHOW_GRACE_MS: Ms = 15 * 60_000;

/// Bookings marked per no-show sweep run.
pub const NO_SHOW_BATCH: usize = 50;

/// Notifications delivered per dispatch run.
pub const DISPATCH_BATCH: usize = 25;

/// Machines a single booking may name (also bounds the lock set at approval).
pub const MAX_MACHINES_PER_BOOKING: usize = 32;

pub const MAX_NAME_LEN: usize = 120;
pub const MAX_EMAIL_LEN: usize = 255;
pub const MAX_TEAM_LEN: usize = 120;
pub const MAX_CATEGORY_LEN: usize = 80;
pub const MAX_PURPOSE_LEN: usize = 300;

/// Decision notes are truncated, not rejected.
pub const MAX_NOTE_LEN: usize = 300;

pub const DAY_MS: Ms = 24 * 3_600_000;

/// Sanity bounds on any timestamp accepted from a caller.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000; // 2100-01-01

pub const INVENTORY_LIMIT: usize = 200;
pub const PENDING_QUEUE_LIMIT: usize = 100;
pub const UPCOMING_LIMIT: usize = 50;
pub const AUDIT_TAIL_LIMIT: usize = 200;
pub const ACTIVE_USERS_LIMIT: usize = 50;
pub const UTILISATION_TOP_MACHINES: usize = 15;

/// Trailing window for dashboard counters.
pub const DASHBOARD_WINDOW_MS: Ms = 30 * 24 * 3_600_000;
