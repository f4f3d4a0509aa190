use std::collections::HashMap;

use chrono::NaiveDateTime;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    pub fn booking_room(&self, id: Ulid) -> Option<Room> {
        self.booking_rooms.get(&id).map(|r| *r.value())
    }

    pub async fn get_booking(&self, id: Ulid) -> Option<Booking> {
        loop {
            let room = self.booking_room(id)?;
            let guard = self.room(room).read().await;
            if let Some(b) = guard.get(id) {
                return Some(b.clone());
            }
            // moved to another room while we waited for the lock
            if self.booking_room(id) == Some(room) {
                return None;
            }
        }
    }

    pub fn band_exists(&self, id: Ulid) -> bool {
        self.catalog.bands.contains_key(&id)
    }

    pub fn get_band(&self, id: Ulid) -> Option<Band> {
        self.catalog.bands.get(&id).map(|b| b.value().clone())
    }

    pub fn get_musician(&self, id: Ulid) -> Option<Musician> {
        self.catalog.musicians.get(&id).map(|m| m.value().clone())
    }

    pub fn is_member(&self, band_id: Ulid, musician_id: Ulid) -> bool {
        self.catalog
            .members
            .get(&band_id)
            .is_some_and(|set| set.contains(&musician_id))
    }

    /// Bookings whose start lies in `[from, to]`, in one room or all, by start then room.
    pub async fn list_bookings(
        &self,
        room: Option<Room>,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> Vec<Booking> {
        let mut out = Vec::new();
        for r in Room::ALL.into_iter().filter(|r| room.is_none_or(|want| want == *r)) {
            let guard = self.room(r).read().await;
            out.extend(guard.starting_between(from, to).cloned());
        }
        out.sort_by(|a, b| a.start.cmp(&b.start).then(a.room.cmp(&b.room)));
        out
    }

    /// All bookings of every room, read under each room's lock in turn.
    async fn all_bookings(&self) -> Vec<Booking> {
        let mut out = Vec::new();
        for lock in self.room_locks() {
            out.extend(lock.read().await.bookings.iter().cloned());
        }
        out
    }

    /// Bands by name, with member and booking counts.
    pub async fn list_bands(&self) -> Vec<BandSummary> {
        let mut bookings: HashMap<Ulid, usize> = HashMap::new();
        for b in self.all_bookings().await {
            *bookings.entry(b.band_id).or_default() += 1;
        }
        let mut out: Vec<BandSummary> = self
            .catalog
            .bands
            .iter()
            .map(|band| BandSummary {
                band: band.value().clone(),
                members: self.catalog.members.get(band.key()).map_or(0, |m| m.len()),
                bookings: bookings.get(band.key()).copied().unwrap_or(0),
            })
            .collect();
        out.sort_by(|a, b| a.band.name.cmp(&b.band.name).then(a.band.id.cmp(&b.band.id)));
        out
    }

    /// Musicians by last then first name; only members of `band_id` if given.
    pub fn list_musicians(&self, band_id: Option<Ulid>) -> Result<Vec<Musician>, EngineError> {
        let mut out: Vec<Musician> = match band_id {
            None => self.catalog.musicians.iter().map(|m| m.value().clone()).collect(),
            Some(id) => {
                if !self.band_exists(id) {
                    return Err(EngineError::UnknownBand(id));
                }
                let ids: Vec<Ulid> = self
                    .catalog
                    .members
                    .get(&id)
                    .map(|set| set.iter().copied().collect())
                    .unwrap_or_default();
                ids.into_iter().filter_map(|m| self.get_musician(m)).collect()
            }
        };
        sort_musicians(&mut out);
        Ok(out)
    }

    /// Musicians that play in no band.
    pub fn free_musicians(&self) -> Vec<Musician> {
        let mut out: Vec<Musician> = self
            .catalog
            .musicians
            .iter()
            .filter(|m| !self.catalog.members.iter().any(|set| set.contains(m.key())))
            .map(|m| m.value().clone())
            .collect();
        sort_musicians(&mut out);
        out
    }

    /// Per band: bookings starting at or after `since` and their total minutes.
    /// Most minutes first, at most `limit` rows.
    pub async fn rehearsal_hours(&self, since: NaiveDateTime, limit: usize) -> Vec<BandHours> {
        let mut totals: HashMap<Ulid, (usize, i64)> = HashMap::new();
        for b in self.all_bookings().await.into_iter().filter(|b| b.start >= since) {
            let entry = totals.entry(b.band_id).or_default();
            entry.0 += 1;
            entry.1 += b.duration_minutes;
        }
        let mut out: Vec<BandHours> = totals
            .into_iter()
            .filter_map(|(band_id, (bookings, minutes))| {
                let band = self.get_band(band_id)?;
                Some(BandHours {
                    band_id,
                    band_name: band.name,
                    bookings,
                    minutes,
                })
            })
            .collect();
        out.sort_by(|a, b| b.minutes.cmp(&a.minutes).then(a.band_name.cmp(&b.band_name)));
        out.truncate(limit);
        out
    }

    /// Band count per genre, largest first; ties by genre, bands without one last.
    pub fn genre_distribution(&self) -> Vec<GenreCount> {
        let mut counts: HashMap<Option<String>, usize> = HashMap::new();
        for band in self.catalog.bands.iter() {
            *counts.entry(band.genre.clone()).or_default() += 1;
        }
        let mut out: Vec<GenreCount> = counts
            .into_iter()
            .map(|(genre, bands)| GenreCount { genre, bands })
            .collect();
        out.sort_by(|a, b| {
            b.bands
                .cmp(&a.bands)
                .then_with(|| a.genre.is_none().cmp(&b.genre.is_none()))
                .then_with(|| a.genre.cmp(&b.genre))
        });
        out
    }

    pub fn stats(&self) -> StudioStats {
        StudioStats {
            bands: self.catalog.bands.len(),
            musicians: self.catalog.musicians.len(),
            bookings: self.booking_rooms.len(),
        }
    }
}

fn sort_musicians(list: &mut [Musician]) {
    list.sort_by(|a, b| {
        a.last_name
            .cmp(&b.last_name)
            .then_with(|| a.first_name.cmp(&b.first_name))
            .then(a.id.cmp(&b.id))
    });
}
