mod conflict;
mod error;
mod occupancy;
mod validate;

pub use conflict::{check_conflict, Candidate, ConflictResult};
pub use error::{ScheduleError, StoreError};
pub use occupancy::{day_window, group_by_room, reserve_window, sort_for_display};
pub use validate::{
    check_duration, check_start, parse_band_id, parse_timestamp, validate_fields,
    validate_reschedule, BookingDraft, Field, Reschedule, ValidationError,
};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::MAX_SCHEDULE_DAYS;
use crate::model::*;
use crate::observability;

/// The storage collaborator. `insert_booking` and `update_booking` must enforce the
/// same-room no-overlap rule atomically; the scheduler's own check is only a pre-check.
#[async_trait]
pub trait BookingStore: Send + Sync {
    /// Bookings whose start lies in the closed range `[from, to]`, sorted by `(start, room)`.
    async fn list_bookings(
        &self,
        room: Option<Room>,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> Result<Vec<Booking>, StoreError>;

    async fn get_booking(&self, id: Ulid) -> Result<Option<Booking>, StoreError>;

    async fn insert_booking(&self, booking: NewBooking) -> Result<Booking, StoreError>;

    /// Move `id` to the room and interval of `fields`. The band is kept.
    async fn update_booking(&self, id: Ulid, fields: NewBooking) -> Result<Booking, StoreError>;

    async fn delete_booking(&self, id: Ulid) -> Result<Booking, StoreError>;

    async fn band_exists(&self, band_id: Ulid) -> Result<bool, StoreError>;
}

/// Optional narrowing of the schedule listing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleFilter {
    pub room: Option<Room>,
    pub band_id: Option<Ulid>,
}

/// Propose, reschedule and cancel rehearsals; render occupancy.
///
/// Every store call is bounded by `timeout`. A timeout counts as storage unavailable:
/// display reads answer empty, the reserve path refuses.
pub struct Scheduler<S> {
    store: Arc<S>,
    timeout: Duration,
}

impl<S: BookingStore> Scheduler<S> {
    pub fn new(store: Arc<S>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Unavailable(format!(
                "no answer within {}ms",
                self.timeout.as_millis()
            ))),
        }
    }

    pub async fn propose_booking(&self, draft: &BookingDraft) -> Result<Booking, ScheduleError> {
        let result = self.try_propose(draft).await;
        match &result {
            Ok(b) => info!("accepted {b}"),
            Err(e) => rejected("propose", e),
        }
        result
    }

    async fn try_propose(&self, draft: &BookingDraft) -> Result<Booking, ScheduleError> {
        let band_id = parse_band_id(&draft.band_id)?;
        if !self.bounded(self.store.band_exists(band_id)).await? {
            return Err(ValidationError::new(Field::BandId, "no such band").into());
        }
        let new = validate_fields(draft)?;
        self.precheck(&new, None).await?;
        Ok(self.bounded(self.store.insert_booking(new)).await?)
    }

    pub async fn reschedule_booking(
        &self,
        id: Ulid,
        changes: &Reschedule,
    ) -> Result<Booking, ScheduleError> {
        let result = self.try_reschedule(id, changes).await;
        match &result {
            Ok(b) => info!("rescheduled {b}"),
            Err(e) => rejected("reschedule", e),
        }
        result
    }

    async fn try_reschedule(
        &self,
        id: Ulid,
        changes: &Reschedule,
    ) -> Result<Booking, ScheduleError> {
        let current = self
            .bounded(self.store.get_booking(id))
            .await?
            .ok_or(ScheduleError::NotFound(id))?;
        let new = validate_reschedule(&current, changes)?;
        self.precheck(&new, Some(id)).await?;
        Ok(self.bounded(self.store.update_booking(id, new)).await?)
    }

    pub async fn cancel_booking(&self, id: Ulid) -> Result<Booking, ScheduleError> {
        match self.bounded(self.store.delete_booking(id)).await {
            Ok(b) => {
                info!("cancelled {b}");
                Ok(b)
            }
            Err(e) => {
                let e = ScheduleError::from(e);
                rejected("cancel", &e);
                Err(e)
            }
        }
    }

    /// Advisory overlap check over the candidate's neighbourhood. Fails closed.
    async fn precheck(&self, new: &NewBooking, exclude: Option<Ulid>) -> Result<(), ScheduleError> {
        let candidate = new.candidate();
        let (from, to) = reserve_window(&candidate);
        let existing = self
            .bounded(self.store.list_bookings(Some(candidate.room), from, to))
            .await?;
        match check_conflict(&candidate, &existing, exclude) {
            ConflictResult::NoConflict => Ok(()),
            ConflictResult::Conflict(b) => Err(ScheduleError::Conflict(b)),
        }
    }

    /// Bookings starting on `date`, by start then room. Empty if storage fails.
    pub async fn get_day_occupancy(&self, date: NaiveDate) -> Vec<Booking> {
        let (from, to) = day_window(date);
        let mut day = self.read_or_empty("occupancy", None, from, to).await;
        sort_for_display(&mut day);
        day
    }

    /// Bookings starting in `[from, from + days)`. `days` is clamped to `1..=MAX_SCHEDULE_DAYS`.
    pub async fn upcoming(
        &self,
        from: NaiveDateTime,
        days: i64,
        filter: ScheduleFilter,
    ) -> Vec<Booking> {
        let days = days.clamp(1, MAX_SCHEDULE_DAYS);
        let until = from
            .checked_add_signed(chrono::Duration::days(days))
            .unwrap_or(NaiveDateTime::MAX);
        let mut rows = self.read_or_empty("schedule", filter.room, from, until).await;
        rows.retain(|b| b.start < until && filter.band_id.is_none_or(|id| b.band_id == id));
        sort_for_display(&mut rows);
        rows
    }

    async fn read_or_empty(
        &self,
        what: &'static str,
        room: Option<Room>,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> Vec<Booking> {
        match self.bounded(self.store.list_bookings(room, from, to)).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!("{what} read failed open: {e}");
                metrics::counter!(observability::OCCUPANCY_FAIL_OPEN_TOTAL).increment(1);
                Vec::new()
            }
        }
    }
}

fn rejected(op: &'static str, e: &ScheduleError) {
    metrics::counter!(observability::BOOKINGS_REJECTED_TOTAL, "reason" => e.reason()).increment(1);
    match e {
        ScheduleError::StorageUnavailable(_) | ScheduleError::Rejected(_) => {
            warn!("{op} refused: {e}")
        }
        _ => debug!("{op} rejected: {e}"),
    }
}
