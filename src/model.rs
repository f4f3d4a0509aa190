use std::fmt;

use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Milliseconds on the studio's naive local timeline. Not UTC-normalized.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn between(start: NaiveDateTime, end: NaiveDateTime) -> Self {
        Self::new(to_ms(start), to_ms(end))
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Back-to-back spans (`a.end == b.start`) do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Encode a naive local timestamp on the linear `Ms` axis.
pub fn to_ms(t: NaiveDateTime) -> Ms {
    t.and_utc().timestamp_millis()
}

/// The studio's physical rooms. Closed set; the declaration order is the display order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Room {
    GreatHall,
    SmallHall,
    StudioA,
    StudioB,
}

impl Room {
    pub const ALL: [Room; 4] = [Room::GreatHall, Room::SmallHall, Room::StudioA, Room::StudioB];

    pub fn code(&self) -> &'static str {
        match self {
            Room::GreatHall => "great_hall",
            Room::SmallHall => "small_hall",
            Room::StudioA => "studio_a",
            Room::StudioB => "studio_b",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Room::GreatHall => "Great Hall",
            Room::SmallHall => "Small Hall",
            Room::StudioA => "Studio A",
            Room::StudioB => "Studio B",
        }
    }

    /// Accepts the code or the display name, case-insensitively.
    pub fn parse(s: &str) -> Option<Room> {
        let s = s.trim();
        Room::ALL
            .into_iter()
            .find(|r| r.code().eq_ignore_ascii_case(s) || r.display_name().eq_ignore_ascii_case(s))
    }
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Band {
    pub id: Ulid,
    pub name: String,
    pub genre: Option<String>,
    pub founded: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Musician {
    pub id: Ulid,
    pub first_name: Option<String>,
    pub last_name: String,
    pub instrument: String,
    pub phone: String,
    pub telegram: Option<String>,
}

impl Musician {
    pub fn display_name(&self) -> String {
        match &self.first_name {
            Some(first) => format!("{} {first}", self.last_name),
            None => self.last_name.clone(),
        }
    }
}

/// A rehearsal reservation of one room for one band.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub band_id: Ulid,
    pub room: Room,
    pub start: NaiveDateTime,
    pub duration_minutes: i64,
}

impl Booking {
    pub fn end(&self) -> NaiveDateTime {
        self.start + Duration::minutes(self.duration_minutes)
    }

    pub fn span(&self) -> Span {
        Span::between(self.start, self.end())
    }
}

impl fmt::Display for Booking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "booking {} of band {} in {} [{}, {})",
            self.id,
            self.band_id,
            self.room,
            self.start.format("%Y-%m-%d %H:%M"),
            self.end().format("%Y-%m-%d %H:%M"),
        )
    }
}

/// A booking not yet persisted; the store assigns its id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBooking {
    pub band_id: Ulid,
    pub room: Room,
    pub start: NaiveDateTime,
    pub duration_minutes: i64,
}

impl NewBooking {
    pub fn with_id(self, id: Ulid) -> Booking {
        Booking {
            id,
            band_id: self.band_id,
            room: self.room,
            start: self.start,
            duration_minutes: self.duration_minutes,
        }
    }
}

/// All bookings of one room, sorted by `start`.
#[derive(Debug, Clone)]
pub struct RoomState {
    pub room: Room,
    pub bookings: Vec<Booking>,
}

impl RoomState {
    pub fn new(room: Room) -> Self {
        Self {
            room,
            bookings: Vec::new(),
        }
    }

    /// Insert keeping the sort order by start.
    pub fn insert(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.start, |b| b.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn remove(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn get(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    /// Bookings whose interval overlaps `query`.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| to_ms(b.start) < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span().end > query.start)
    }

    /// Bookings whose start lies in the closed range `[from, to]`.
    pub fn starting_between(
        &self,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> impl Iterator<Item = &Booking> {
        let lo = self.bookings.partition_point(|b| b.start < from);
        let hi = self.bookings.partition_point(|b| b.start <= to);
        self.bookings[lo..hi.max(lo)].iter()
    }
}

/// WAL record format. Flat, one variant per state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BandCreated {
        id: Ulid,
        name: String,
        genre: Option<String>,
        founded: Option<NaiveDate>,
    },
    BandUpdated {
        id: Ulid,
        name: String,
        genre: Option<String>,
        founded: Option<NaiveDate>,
    },
    BandDeleted {
        id: Ulid,
    },
    MusicianCreated {
        id: Ulid,
        first_name: Option<String>,
        last_name: String,
        instrument: String,
        phone: String,
        telegram: Option<String>,
    },
    MusicianUpdated {
        id: Ulid,
        first_name: Option<String>,
        last_name: String,
        instrument: String,
        phone: String,
        telegram: Option<String>,
    },
    MusicianDeleted {
        id: Ulid,
    },
    MemberAdded {
        band_id: Ulid,
        musician_id: Ulid,
    },
    MemberRemoved {
        band_id: Ulid,
        musician_id: Ulid,
    },
    BookingCreated {
        id: Ulid,
        band_id: Ulid,
        room: Room,
        start: NaiveDateTime,
        duration_minutes: i64,
    },
    BookingRescheduled {
        id: Ulid,
        band_id: Ulid,
        from_room: Room,
        room: Room,
        start: NaiveDateTime,
        duration_minutes: i64,
    },
    BookingCancelled {
        id: Ulid,
        room: Room,
    },
}

impl Event {
    pub fn booking_created(b: &Booking) -> Self {
        Event::BookingCreated {
            id: b.id,
            band_id: b.band_id,
            room: b.room,
            start: b.start,
            duration_minutes: b.duration_minutes,
        }
    }

    pub fn musician_created(m: &Musician) -> Self {
        Event::MusicianCreated {
            id: m.id,
            first_name: m.first_name.clone(),
            last_name: m.last_name.clone(),
            instrument: m.instrument.clone(),
            phone: m.phone.clone(),
            telegram: m.telegram.clone(),
        }
    }

    /// Rooms whose state this event touches. Empty for catalog events.
    pub fn rooms(&self) -> Vec<Room> {
        match self {
            Event::BookingCreated { room, .. } | Event::BookingCancelled { room, .. } => {
                vec![*room]
            }
            Event::BookingRescheduled { from_room, room, .. } => {
                if from_room == room {
                    vec![*room]
                } else {
                    vec![*from_room, *room]
                }
            }
            _ => Vec::new(),
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BandSummary {
    pub band: Band,
    pub members: usize,
    pub bookings: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BandHours {
    pub band_id: Ulid,
    pub band_name: String,
    pub bookings: usize,
    pub minutes: i64,
}

/// Bands per genre; `genre: None` counts bands without one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenreCount {
    pub genre: Option<String>,
    pub bands: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StudioStats {
    pub bands: usize,
    pub musicians: usize,
    pub bookings: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, 14)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn booking(room: Room, start: NaiveDateTime, minutes: i64) -> Booking {
        Booking {
            id: Ulid::new(),
            band_id: Ulid::new(),
            room,
            start,
            duration_minutes: minutes,
        }
    }

    #[test]
    fn span_overlap_is_half_open() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent
    }

    #[test]
    fn booking_end_and_span() {
        let b = booking(Room::StudioA, at(18, 0), 90);
        assert_eq!(b.end(), at(19, 30));
        assert_eq!(b.span().duration_ms(), 90 * 60_000);
    }

    #[test]
    fn room_parse_accepts_code_and_name() {
        assert_eq!(Room::parse("studio_a"), Some(Room::StudioA));
        assert_eq!(Room::parse("Great Hall"), Some(Room::GreatHall));
        assert_eq!(Room::parse(" SMALL_HALL "), Some(Room::SmallHall));
        assert_eq!(Room::parse("basement"), None);
    }

    #[test]
    fn room_order_is_declaration_order() {
        let mut rooms = vec![Room::StudioB, Room::GreatHall, Room::StudioA, Room::SmallHall];
        rooms.sort();
        assert_eq!(rooms, Room::ALL.to_vec());
    }

    #[test]
    fn room_state_keeps_start_order() {
        let mut rs = RoomState::new(Room::StudioB);
        rs.insert(booking(Room::StudioB, at(20, 0), 60));
        rs.insert(booking(Room::StudioB, at(10, 0), 60));
        rs.insert(booking(Room::StudioB, at(14, 0), 60));
        let starts: Vec<_> = rs.bookings.iter().map(|b| b.start).collect();
        assert_eq!(starts, vec![at(10, 0), at(14, 0), at(20, 0)]);
    }

    #[test]
    fn room_state_remove() {
        let mut rs = RoomState::new(Room::StudioA);
        let b = booking(Room::StudioA, at(10, 0), 60);
        let id = b.id;
        rs.insert(b);
        assert!(rs.remove(Ulid::new()).is_none());
        assert_eq!(rs.remove(id).map(|b| b.id), Some(id));
        assert!(rs.bookings.is_empty());
    }

    #[test]
    fn overlapping_skips_adjacent_and_far() {
        let mut rs = RoomState::new(Room::GreatHall);
        rs.insert(booking(Room::GreatHall, at(8, 0), 60)); // ends 9:00
        rs.insert(booking(Room::GreatHall, at(9, 30), 60)); // overlaps
        rs.insert(booking(Room::GreatHall, at(11, 0), 60)); // starts at query end
        let query = Span::between(at(9, 0), at(11, 0));
        let hits: Vec<_> = rs.overlapping(&query).map(|b| b.start).collect();
        assert_eq!(hits, vec![at(9, 30)]);
    }

    #[test]
    fn overlapping_catches_long_earlier_booking() {
        let mut rs = RoomState::new(Room::GreatHall);
        rs.insert(booking(Room::GreatHall, at(8, 0), 8 * 60));
        let query = Span::between(at(12, 0), at(13, 0));
        assert_eq!(rs.overlapping(&query).count(), 1);
    }

    #[test]
    fn starting_between_is_closed_range() {
        let mut rs = RoomState::new(Room::StudioA);
        rs.insert(booking(Room::StudioA, at(8, 0), 60));
        rs.insert(booking(Room::StudioA, at(12, 0), 60));
        rs.insert(booking(Room::StudioA, at(16, 0), 60));
        let hits: Vec<_> = rs
            .starting_between(at(8, 0), at(12, 0))
            .map(|b| b.start)
            .collect();
        assert_eq!(hits, vec![at(8, 0), at(12, 0)]);
        assert_eq!(rs.starting_between(at(13, 0), at(15, 0)).count(), 0);
    }

    #[test]
    fn event_rooms() {
        let id = Ulid::new();
        let moved = Event::BookingRescheduled {
            id,
            band_id: Ulid::new(),
            from_room: Room::StudioA,
            room: Room::StudioB,
            start: at(10, 0),
            duration_minutes: 60,
        };
        assert_eq!(moved.rooms(), vec![Room::StudioA, Room::StudioB]);
        assert!(Event::BandDeleted { id }.rooms().is_empty());
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::booking_created(&booking(Room::SmallHall, at(19, 0), 120));
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
