use async_trait::async_trait;
use chrono::NaiveDateTime;
use ulid::Ulid;

use crate::model::*;
use crate::scheduler::{BookingStore, StoreError};

use super::{Engine, EngineError};

impl From<EngineError> for StoreError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::ExclusionViolation(b) => StoreError::ExclusionViolation(b),
            EngineError::NotFound(id) => StoreError::NotFound(id),
            EngineError::UnknownBand(id) => StoreError::UnknownBand(id),
            EngineError::WalError(msg) => StoreError::Unavailable(msg),
            other => StoreError::Rejected(other.to_string()),
        }
    }
}

/// The engine is the authoritative store: its inserts and updates run the overlap
/// check under the room's write lock.
#[async_trait]
impl BookingStore for Engine {
    async fn list_bookings(
        &self,
        room: Option<Room>,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> Result<Vec<Booking>, StoreError> {
        Ok(Engine::list_bookings(self, room, from, to).await)
    }

    async fn get_booking(&self, id: Ulid) -> Result<Option<Booking>, StoreError> {
        Ok(Engine::get_booking(self, id).await)
    }

    async fn insert_booking(&self, booking: NewBooking) -> Result<Booking, StoreError> {
        Ok(Engine::insert_booking(self, booking).await?)
    }

    async fn update_booking(&self, id: Ulid, fields: NewBooking) -> Result<Booking, StoreError> {
        Ok(self.reschedule_booking(id, fields).await?)
    }

    async fn delete_booking(&self, id: Ulid) -> Result<Booking, StoreError> {
        Ok(self.cancel_booking(id).await?)
    }

    async fn band_exists(&self, band_id: Ulid) -> Result<bool, StoreError> {
        Ok(Engine::band_exists(self, band_id))
    }
}
