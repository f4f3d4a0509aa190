use chrono::Datelike;
use tokio::sync::oneshot;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::scheduler::{check_conflict, ConflictResult};

use super::{Engine, EngineError, OnDelete, RoomGuard, WalCommand};

fn check_name(name: &str, what: &'static str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::Invalid(what));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

fn check_optional(value: &Option<String>) -> Result<(), EngineError> {
    match value {
        Some(v) if v.len() > MAX_NAME_LEN => Err(EngineError::LimitExceeded("field too long")),
        _ => Ok(()),
    }
}

/// `+375` followed by exactly nine digits.
pub fn valid_phone(phone: &str) -> bool {
    phone
        .strip_prefix("+375")
        .is_some_and(|rest| rest.len() == 9 && rest.bytes().all(|b| b.is_ascii_digit()))
}

fn check_band(band: &Band) -> Result<(), EngineError> {
    check_name(&band.name, "band name must not be empty")?;
    check_optional(&band.genre)
}

fn check_musician(m: &Musician) -> Result<(), EngineError> {
    check_name(&m.last_name, "last name must not be empty")?;
    check_optional(&m.first_name)?;
    check_optional(&m.telegram)?;
    if m.instrument.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("instrument too long"));
    }
    if !valid_phone(&m.phone) {
        return Err(EngineError::Invalid("phone must be +375 followed by 9 digits"));
    }
    Ok(())
}

fn check_interval(b: &NewBooking) -> Result<(), EngineError> {
    if b.duration_minutes <= 0 {
        return Err(EngineError::Invalid("duration must be positive"));
    }
    if b.duration_minutes > MAX_BOOKING_MINUTES {
        return Err(EngineError::Invalid("duration longer than a day"));
    }
    if !(MIN_BOOKING_YEAR..=MAX_BOOKING_YEAR).contains(&b.start.year()) {
        return Err(EngineError::Invalid("start outside the bookable years"));
    }
    Ok(())
}

/// First booking in `guards` that `new` would overlap, `exclude` aside.
fn first_overlap(
    guards: &[RoomGuard<'_>],
    new: &NewBooking,
    exclude: Option<Ulid>,
) -> Option<Booking> {
    let candidate = new.candidate();
    let span = candidate.span();
    guards
        .iter()
        .filter(|rs| rs.room == new.room)
        .find_map(|rs| match check_conflict(&candidate, rs.overlapping(&span), exclude) {
            ConflictResult::Conflict(b) => Some(b),
            ConflictResult::NoConflict => None,
        })
}

impl Engine {
    // ── Bands ───────────────────────────────────────────────

    pub async fn create_band(&self, band: Band) -> Result<(), EngineError> {
        check_band(&band)?;
        let _catalog = self.catalog_lock.lock().await;
        if self.catalog.bands.len() >= MAX_BANDS {
            return Err(EngineError::LimitExceeded("too many bands"));
        }
        if self.catalog.bands.contains_key(&band.id) {
            return Err(EngineError::AlreadyExists(band.id));
        }
        let event = Event::BandCreated {
            id: band.id,
            name: band.name,
            genre: band.genre,
            founded: band.founded,
        };
        self.commit_catalog(&event).await
    }

    pub async fn update_band(&self, band: Band) -> Result<(), EngineError> {
        check_band(&band)?;
        let _catalog = self.catalog_lock.lock().await;
        if !self.catalog.bands.contains_key(&band.id) {
            return Err(EngineError::NotFound(band.id));
        }
        let event = Event::BandUpdated {
            id: band.id,
            name: band.name,
            genre: band.genre,
            founded: band.founded,
        };
        self.commit_catalog(&event).await
    }

    /// Delete a band under the engine's `OnDelete` policy. Returns the bookings cancelled
    /// by the cascade.
    ///
    /// Every room is write-locked for the duration, so no booking for this band can be
    /// inserted between the dependents check and the delete.
    pub async fn delete_band(&self, id: Ulid) -> Result<Vec<Booking>, EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        if !self.catalog.bands.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        let mut guards = self.lock_rooms(&Room::ALL).await;
        let owned: Vec<Booking> = guards
            .iter()
            .flat_map(|rs| rs.bookings.iter())
            .filter(|b| b.band_id == id)
            .cloned()
            .collect();
        let members: Vec<Ulid> = self
            .catalog
            .members
            .get(&id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();

        if self.on_delete == OnDelete::Restrict && (!owned.is_empty() || !members.is_empty()) {
            return Err(EngineError::HasDependents(id));
        }

        for b in &owned {
            let event = Event::BookingCancelled { id: b.id, room: b.room };
            self.commit_booking(&mut guards, &event).await?;
        }
        for musician_id in &members {
            let event = Event::MemberRemoved { band_id: id, musician_id: *musician_id };
            self.commit_catalog(&event).await?;
        }
        self.commit_catalog(&Event::BandDeleted { id }).await?;
        info!(
            "deleted band {id}: cancelled {} bookings, dropped {} members",
            owned.len(),
            members.len()
        );
        Ok(owned)
    }

    // ── Musicians ───────────────────────────────────────────

    pub async fn create_musician(&self, musician: Musician) -> Result<(), EngineError> {
        check_musician(&musician)?;
        let _catalog = self.catalog_lock.lock().await;
        if self.catalog.musicians.len() >= MAX_MUSICIANS {
            return Err(EngineError::LimitExceeded("too many musicians"));
        }
        if self.catalog.musicians.contains_key(&musician.id) {
            return Err(EngineError::AlreadyExists(musician.id));
        }
        self.commit_catalog(&Event::musician_created(&musician)).await
    }

    pub async fn update_musician(&self, m: Musician) -> Result<(), EngineError> {
        check_musician(&m)?;
        let _catalog = self.catalog_lock.lock().await;
        if !self.catalog.musicians.contains_key(&m.id) {
            return Err(EngineError::NotFound(m.id));
        }
        let event = Event::MusicianUpdated {
            id: m.id,
            first_name: m.first_name,
            last_name: m.last_name,
            instrument: m.instrument,
            phone: m.phone,
            telegram: m.telegram,
        };
        self.commit_catalog(&event).await
    }

    /// Delete a musician and every membership that names them.
    pub async fn delete_musician(&self, id: Ulid) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        if !self.catalog.musicians.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        let bands: Vec<Ulid> = self
            .catalog
            .members
            .iter()
            .filter(|e| e.value().contains(&id))
            .map(|e| *e.key())
            .collect();
        for band_id in bands {
            let event = Event::MemberRemoved { band_id, musician_id: id };
            self.commit_catalog(&event).await?;
        }
        self.commit_catalog(&Event::MusicianDeleted { id }).await
    }

    // ── Membership ──────────────────────────────────────────

    pub async fn add_member(&self, band_id: Ulid, musician_id: Ulid) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        if !self.catalog.bands.contains_key(&band_id) {
            return Err(EngineError::UnknownBand(band_id));
        }
        if !self.catalog.musicians.contains_key(&musician_id) {
            return Err(EngineError::UnknownMusician(musician_id));
        }
        if self.is_member(band_id, musician_id) {
            return Err(EngineError::AlreadyExists(musician_id));
        }
        self.commit_catalog(&Event::MemberAdded { band_id, musician_id }).await
    }

    pub async fn remove_member(&self, band_id: Ulid, musician_id: Ulid) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        if !self.is_member(band_id, musician_id) {
            return Err(EngineError::NotFound(musician_id));
        }
        self.commit_catalog(&Event::MemberRemoved { band_id, musician_id }).await
    }

    // ── Bookings ────────────────────────────────────────────

    /// Insert under the room's write lock: band check, overlap check, WAL append and
    /// apply happen as one step with respect to other writers of that room.
    pub async fn insert_booking(&self, new: NewBooking) -> Result<Booking, EngineError> {
        check_interval(&new)?;
        let mut guards = self.lock_rooms(&[new.room]).await;
        if !self.catalog.bands.contains_key(&new.band_id) {
            return Err(EngineError::UnknownBand(new.band_id));
        }
        if guards.iter().any(|rs| rs.bookings.len() >= MAX_BOOKINGS_PER_ROOM) {
            return Err(EngineError::LimitExceeded("too many bookings in room"));
        }
        if let Some(existing) = first_overlap(&guards, &new, None) {
            return Err(EngineError::ExclusionViolation(existing));
        }
        let booking = new.with_id(Ulid::new());
        self.commit_booking(&mut guards, &Event::booking_created(&booking))
            .await?;
        Ok(booking)
    }

    /// Move booking `id` to `to.room` / `to.start` / `to.duration_minutes`. The band is kept.
    pub async fn reschedule_booking(
        &self,
        id: Ulid,
        to: NewBooking,
    ) -> Result<Booking, EngineError> {
        check_interval(&to)?;
        let (from_room, mut guards) = self.lock_booking(id, Some(to.room)).await?;
        let current = guards
            .iter()
            .find_map(|rs| rs.get(id))
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        if let Some(existing) = first_overlap(&guards, &to, Some(id)) {
            return Err(EngineError::ExclusionViolation(existing));
        }
        if from_room != to.room
            && guards
                .iter()
                .any(|rs| rs.room == to.room && rs.bookings.len() >= MAX_BOOKINGS_PER_ROOM)
        {
            return Err(EngineError::LimitExceeded("too many bookings in room"));
        }
        let moved = Booking {
            id,
            band_id: current.band_id,
            room: to.room,
            start: to.start,
            duration_minutes: to.duration_minutes,
        };
        let event = Event::BookingRescheduled {
            id,
            band_id: moved.band_id,
            from_room,
            room: moved.room,
            start: moved.start,
            duration_minutes: moved.duration_minutes,
        };
        self.commit_booking(&mut guards, &event).await?;
        Ok(moved)
    }

    pub async fn cancel_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let (room, mut guards) = self.lock_booking(id, None).await?;
        let booking = guards
            .iter()
            .find_map(|rs| rs.get(id))
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        self.commit_booking(&mut guards, &Event::BookingCancelled { id, room })
            .await?;
        Ok(booking)
    }

    /// Write-lock the room holding booking `id`, plus `extra`. Retries if the booking
    /// moved between the index lookup and the lock.
    async fn lock_booking(
        &self,
        id: Ulid,
        extra: Option<Room>,
    ) -> Result<(Room, Vec<RoomGuard<'_>>), EngineError> {
        loop {
            let room = self.booking_room(id).ok_or(EngineError::NotFound(id))?;
            let mut rooms = vec![room];
            rooms.extend(extra);
            let guards = self.lock_rooms(&rooms).await;
            if self.booking_room(id) == Some(room) {
                return Ok((room, guards));
            }
        }
    }

    // ── Compaction ──────────────────────────────────────────

    /// Rewrite the WAL as the minimal event set that recreates the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        let mut events = Vec::new();
        for band in self.catalog.bands.iter() {
            events.push(Event::BandCreated {
                id: band.id,
                name: band.name.clone(),
                genre: band.genre.clone(),
                founded: band.founded,
            });
        }
        for m in self.catalog.musicians.iter() {
            events.push(Event::musician_created(m.value()));
        }
        for entry in self.catalog.members.iter() {
            for musician_id in entry.value() {
                events.push(Event::MemberAdded {
                    band_id: *entry.key(),
                    musician_id: *musician_id,
                });
            }
        }
        // Read locks stay held until the writer has swapped the file, so no booking
        // append can land in the old log after the snapshot.
        let mut guards = Vec::new();
        for lock in self.room_locks() {
            guards.push(lock.read().await);
        }
        for rs in &guards {
            events.extend(rs.bookings.iter().map(Event::booking_created));
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
