use std::fmt;

use chrono::{Datelike, Duration, NaiveDateTime};
use ulid::Ulid;

use crate::limits::{MAX_BOOKING_MINUTES, MAX_BOOKING_YEAR, MIN_BOOKING_YEAR};
use crate::model::*;

use super::conflict::Candidate;

/// A booking as submitted by a form or a SQL statement: nothing checked yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingDraft {
    pub band_id: String,
    pub room: String,
    pub start: String,
    pub duration_minutes: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    BandId,
    Room,
    Start,
    DurationMinutes,
}

impl Field {
    pub fn name(&self) -> &'static str {
        match self {
            Field::BandId => "band_id",
            Field::Room => "room",
            Field::Start => "start",
            Field::DurationMinutes => "duration_minutes",
        }
    }
}

/// The first failing field of a draft.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: Field,
    pub reason: &'static str,
}

impl ValidationError {
    pub fn new(field: Field, reason: &'static str) -> Self {
        Self { field, reason }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {}", self.field.name(), self.reason)
    }
}

impl std::error::Error for ValidationError {}

const TIMESTAMP_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
];

/// Parse a naive local timestamp; fractional seconds are not accepted.
pub fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
}

pub fn check_start(start: NaiveDateTime) -> Result<(), ValidationError> {
    if !(MIN_BOOKING_YEAR..=MAX_BOOKING_YEAR).contains(&start.year()) {
        return Err(ValidationError::new(Field::Start, "outside the bookable years"));
    }
    Ok(())
}

fn parse_start(s: &str) -> Result<NaiveDateTime, ValidationError> {
    let start =
        parse_timestamp(s).ok_or(ValidationError::new(Field::Start, "not a date and time"))?;
    check_start(start)?;
    Ok(start)
}

pub fn parse_band_id(s: &str) -> Result<Ulid, ValidationError> {
    Ulid::from_string(s.trim()).map_err(|_| ValidationError::new(Field::BandId, "not a valid id"))
}

pub fn check_duration(minutes: i64) -> Result<(), ValidationError> {
    if minutes <= 0 {
        return Err(ValidationError::new(Field::DurationMinutes, "must be positive"));
    }
    if minutes > MAX_BOOKING_MINUTES {
        return Err(ValidationError::new(Field::DurationMinutes, "longer than a day"));
    }
    Ok(())
}

/// Every check that needs no storage, in field order: band id, room, duration, start.
/// The scheduler checks band existence between the id and the room.
pub fn validate_fields(draft: &BookingDraft) -> Result<NewBooking, ValidationError> {
    let band_id = parse_band_id(&draft.band_id)?;
    let room = Room::parse(&draft.room)
        .ok_or(ValidationError::new(Field::Room, "not a studio room"))?;
    check_duration(draft.duration_minutes)?;
    let start = parse_start(&draft.start)?;
    Ok(NewBooking {
        band_id,
        room,
        start,
        duration_minutes: draft.duration_minutes,
    })
}

impl NewBooking {
    pub fn candidate(&self) -> Candidate {
        Candidate {
            room: self.room,
            start: self.start,
            end: self.start + Duration::minutes(self.duration_minutes),
        }
    }
}

/// Partial change set for an existing booking. `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reschedule {
    pub room: Option<String>,
    pub start: Option<String>,
    pub duration_minutes: Option<i64>,
}

/// Merge `changes` into `current` and validate the result. The band is not re-checked.
pub fn validate_reschedule(
    current: &Booking,
    changes: &Reschedule,
) -> Result<NewBooking, ValidationError> {
    let room = match &changes.room {
        Some(r) => Room::parse(r).ok_or(ValidationError::new(Field::Room, "not a studio room"))?,
        None => current.room,
    };
    let duration_minutes = changes.duration_minutes.unwrap_or(current.duration_minutes);
    check_duration(duration_minutes)?;
    let start = match &changes.start {
        Some(s) => parse_start(s)?,
        None => current.start,
    };
    Ok(NewBooking {
        band_id: current.band_id,
        room,
        start,
        duration_minutes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn draft() -> BookingDraft {
        BookingDraft {
            band_id: Ulid::new().to_string(),
            room: "studio_a".into(),
            start: "2026-10-17 18:00".into(),
            duration_minutes: 90,
        }
    }

    #[test]
    fn valid_draft_parses() {
        let d = draft();
        let nb = validate_fields(&d).unwrap();
        assert_eq!(nb.room, Room::StudioA);
        assert_eq!(nb.duration_minutes, 90);
        let c = nb.candidate();
        assert_eq!(c.end - c.start, Duration::minutes(90));
    }

    #[test]
    fn zero_and_negative_duration_rejected() {
        for minutes in [0, -30] {
            let d = BookingDraft { duration_minutes: minutes, ..draft() };
            let err = validate_fields(&d).unwrap_err();
            assert_eq!(err.field, Field::DurationMinutes);
        }
    }

    #[test]
    fn overlong_duration_rejected() {
        let d = BookingDraft { duration_minutes: MAX_BOOKING_MINUTES + 1, ..draft() };
        assert_eq!(validate_fields(&d).unwrap_err().field, Field::DurationMinutes);
    }

    #[test]
    fn unknown_room_rejected() {
        let d = BookingDraft { room: "attic".into(), ..draft() };
        assert_eq!(validate_fields(&d).unwrap_err().field, Field::Room);
    }

    #[test]
    fn malformed_start_rejected() {
        for bad in ["2026-13-01 10:00", "tomorrow", "2026-10-17", ""] {
            let d = BookingDraft { start: bad.into(), ..draft() };
            assert_eq!(validate_fields(&d).unwrap_err().field, Field::Start, "{bad}");
        }
    }

    #[test]
    fn malformed_band_id_rejected() {
        let d = BookingDraft { band_id: "42".into(), ..draft() };
        assert_eq!(validate_fields(&d).unwrap_err().field, Field::BandId);
    }

    #[test]
    fn first_failing_field_wins() {
        let d = BookingDraft {
            band_id: Ulid::new().to_string(),
            room: "attic".into(),
            start: "never".into(),
            duration_minutes: 0,
        };
        assert_eq!(validate_fields(&d).unwrap_err().field, Field::Room);
    }

    #[test]
    fn timestamp_formats() {
        let expected = NaiveDate::from_ymd_opt(2026, 10, 17)
            .unwrap()
            .and_hms_opt(18, 30, 0)
            .unwrap();
        for s in [
            "2026-10-17 18:30",
            "2026-10-17 18:30:00",
            "2026-10-17T18:30",
            " 2026-10-17T18:30:00 ",
        ] {
            assert_eq!(parse_timestamp(s), Some(expected), "{s}");
        }
    }

    #[test]
    fn reschedule_keeps_unchanged_fields() {
        let current = Booking {
            id: Ulid::new(),
            band_id: Ulid::new(),
            room: Room::GreatHall,
            start: parse_timestamp("2026-10-17 10:00").unwrap(),
            duration_minutes: 120,
        };
        let changes = Reschedule { start: Some("2026-10-18 12:00".into()), ..Default::default() };
        let nb = validate_reschedule(&current, &changes).unwrap();
        assert_eq!(nb.room, Room::GreatHall);
        assert_eq!(nb.duration_minutes, 120);
        assert_eq!(nb.band_id, current.band_id);
        assert_eq!(nb.start, parse_timestamp("2026-10-18 12:00").unwrap());

        let bad = Reschedule { duration_minutes: Some(0), ..Default::default() };
        assert_eq!(
            validate_reschedule(&current, &bad).unwrap_err().field,
            Field::DurationMinutes
        );
    }

    #[test]
    fn start_outside_bookable_years_rejected() {
        for far in [
            "+262142-12-31 23:30",
            "-262143-01-01 00:30",
            "1899-12-31 23:00",
            "+10000-01-01 00:00",
        ] {
            let d = BookingDraft { start: far.into(), ..draft() };
            let err = validate_fields(&d).unwrap_err();
            assert_eq!(err.field, Field::Start, "{far}");
        }
        let edge = BookingDraft {
            start: "9999-12-31 23:00".into(),
            duration_minutes: 60,
            ..draft()
        };
        let c = validate_fields(&edge).unwrap().candidate();
        let next_year = NaiveDate::from_ymd_opt(10_000, 1, 1).unwrap();
        assert_eq!(c.end, next_year.and_hms_opt(0, 0, 0).unwrap());
    }

    #[test]
    fn reschedule_to_far_start_rejected() {
        let current = Booking {
            id: Ulid::new(),
            band_id: Ulid::new(),
            room: Room::StudioB,
            start: parse_timestamp("2026-10-17 10:00").unwrap(),
            duration_minutes: 60,
        };
        let changes = Reschedule {
            start: Some("+262142-12-31 23:30".into()),
            ..Default::default()
        };
        assert_eq!(validate_reschedule(&current, &changes).unwrap_err().field, Field::Start);
    }
}
