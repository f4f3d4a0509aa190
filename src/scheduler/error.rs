use std::fmt;

use ulid::Ulid;

use crate::model::Booking;

use super::validate::{Field, ValidationError};

/// Failures reported by a `BookingStore`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Unreachable, timed out, or failed to persist.
    Unavailable(String),
    /// The store's exclusion guard found an overlapping booking in the same room.
    ExclusionViolation(Booking),
    NotFound(Ulid),
    UnknownBand(Ulid),
    /// Refused for a reason unrelated to scheduling (limits, malformed input).
    Rejected(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Unavailable(e) => write!(f, "storage unavailable: {e}"),
            StoreError::ExclusionViolation(b) => write!(f, "overlaps {b}"),
            StoreError::NotFound(id) => write!(f, "not found: {id}"),
            StoreError::UnknownBand(id) => write!(f, "unknown band: {id}"),
            StoreError::Rejected(e) => write!(f, "rejected: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Why a propose, reschedule or cancel was refused. Every variant is per-request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    Validation(ValidationError),
    /// The pre-check found an overlapping booking.
    Conflict(Booking),
    /// Storage could not be consulted; the reserve path refuses rather than guess.
    StorageUnavailable(String),
    /// The storage guard refused a write that passed the pre-check (a concurrent request won).
    ConstraintViolation(Booking),
    NotFound(Ulid),
    /// Storage refused the write for a reason other than an overlap, such as a size limit.
    Rejected(String),
}

impl ScheduleError {
    /// The booking that blocks the request. Same for `Conflict` and `ConstraintViolation`.
    pub fn conflicting_booking(&self) -> Option<&Booking> {
        match self {
            ScheduleError::Conflict(b) | ScheduleError::ConstraintViolation(b) => Some(b),
            _ => None,
        }
    }

    /// Label for the rejection metric.
    pub fn reason(&self) -> &'static str {
        match self {
            ScheduleError::Validation(_) => "validation",
            ScheduleError::Conflict(_) => "conflict",
            ScheduleError::StorageUnavailable(_) => "storage_unavailable",
            ScheduleError::ConstraintViolation(_) => "constraint_violation",
            ScheduleError::NotFound(_) => "not_found",
            ScheduleError::Rejected(_) => "rejected",
        }
    }
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleError::Validation(e) => write!(f, "{e}"),
            ScheduleError::Conflict(b) | ScheduleError::ConstraintViolation(b) => write!(
                f,
                "{} is taken by band {} from {} to {}",
                b.room.display_name(),
                b.band_id,
                b.start.format("%Y-%m-%d %H:%M"),
                b.end().format("%H:%M"),
            ),
            ScheduleError::StorageUnavailable(e) => write!(f, "storage unavailable: {e}"),
            ScheduleError::NotFound(id) => write!(f, "booking not found: {id}"),
            ScheduleError::Rejected(e) => write!(f, "rejected by storage: {e}"),
        }
    }
}

impl std::error::Error for ScheduleError {}

impl From<ValidationError> for ScheduleError {
    fn from(e: ValidationError) -> Self {
        ScheduleError::Validation(e)
    }
}

impl From<StoreError> for ScheduleError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(msg) => ScheduleError::StorageUnavailable(msg),
            StoreError::ExclusionViolation(b) => ScheduleError::ConstraintViolation(b),
            StoreError::NotFound(id) => ScheduleError::NotFound(id),
            StoreError::UnknownBand(_) => {
                ScheduleError::Validation(ValidationError::new(Field::BandId, "no such band"))
            }
            StoreError::Rejected(msg) => ScheduleError::Rejected(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_refusals_keep_their_kind() {
        let limit = ScheduleError::from(StoreError::Rejected("too many bookings in room".into()));
        assert_eq!(limit, ScheduleError::Rejected("too many bookings in room".into()));
        assert_eq!(limit.reason(), "rejected");

        let down = ScheduleError::from(StoreError::Unavailable("timeout".into()));
        assert_eq!(down.reason(), "storage_unavailable");

        let band = Ulid::new();
        assert!(matches!(
            ScheduleError::from(StoreError::UnknownBand(band)),
            ScheduleError::Validation(v) if v.field == Field::BandId
        ));
    }
}
