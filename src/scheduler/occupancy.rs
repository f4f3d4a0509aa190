use std::collections::BTreeMap;

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};

use crate::limits::MAX_BOOKING_MINUTES;
use crate::model::*;

use super::conflict::Candidate;

/// The closed calendar day `[date 00:00:00, date 23:59:59]` on the naive local timeline.
pub fn day_window(date: NaiveDate) -> (NaiveDateTime, NaiveDateTime) {
    let start = date.and_time(NaiveTime::MIN);
    let end = date.and_hms_opt(23, 59, 59).unwrap_or(NaiveDateTime::MAX);
    (start, end)
}

/// Start range whose bookings can overlap `candidate`: anything starting after its end
/// cannot, and nothing lasts longer than `MAX_BOOKING_MINUTES`. Clamped to chrono's range.
pub fn reserve_window(candidate: &Candidate) -> (NaiveDateTime, NaiveDateTime) {
    let from = candidate
        .start
        .checked_sub_signed(Duration::minutes(MAX_BOOKING_MINUTES))
        .unwrap_or(NaiveDateTime::MIN);
    (from, candidate.end)
}

/// Ascending by start, ties by room order.
pub fn sort_for_display(bookings: &mut [Booking]) {
    bookings.sort_by(|a, b| a.start.cmp(&b.start).then(a.room.cmp(&b.room)));
}

/// Per-room timeline rows. Every room is present, empty ones included.
pub fn group_by_room(bookings: &[Booking]) -> BTreeMap<Room, Vec<Booking>> {
    let mut rooms: BTreeMap<Room, Vec<Booking>> =
        Room::ALL.into_iter().map(|r| (r, Vec::new())).collect();
    for b in bookings {
        rooms.entry(b.room).or_default().push(b.clone());
    }
    rooms
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 17).unwrap()
    }

    fn booking(room: Room, h: u32) -> Booking {
        Booking {
            id: Ulid::new(),
            band_id: Ulid::new(),
            room,
            start: date().and_hms_opt(h, 0, 0).unwrap(),
            duration_minutes: 60,
        }
    }

    #[test]
    fn day_window_is_closed_day() {
        let (from, to) = day_window(date());
        assert_eq!(from, date().and_hms_opt(0, 0, 0).unwrap());
        assert_eq!(to, date().and_hms_opt(23, 59, 59).unwrap());
    }

    #[test]
    fn display_order_breaks_ties_by_room() {
        let mut day = vec![
            booking(Room::StudioB, 10),
            booking(Room::GreatHall, 12),
            booking(Room::GreatHall, 10),
            booking(Room::SmallHall, 10),
        ];
        sort_for_display(&mut day);
        let order: Vec<_> = day.iter().map(|b| (b.start, b.room)).collect();
        let h = |h| date().and_hms_opt(h, 0, 0).unwrap();
        assert_eq!(
            order,
            vec![
                (h(10), Room::GreatHall),
                (h(10), Room::SmallHall),
                (h(10), Room::StudioB),
                (h(12), Room::GreatHall),
            ]
        );
    }

    #[test]
    fn grouping_lists_every_room() {
        let day = vec![booking(Room::StudioA, 9), booking(Room::StudioA, 11)];
        let grouped = group_by_room(&day);
        assert_eq!(grouped.len(), Room::ALL.len());
        assert_eq!(grouped[&Room::StudioA].len(), 2);
        assert!(grouped[&Room::GreatHall].is_empty());
        assert_eq!(grouped.keys().copied().collect::<Vec<_>>(), Room::ALL.to_vec());
    }

    #[test]
    fn reserve_window_reaches_back_one_max_duration() {
        let start = date().and_hms_opt(1, 0, 0).unwrap();
        let c = Candidate {
            room: Room::StudioA,
            start,
            end: start + Duration::hours(1),
        };
        let (from, to) = reserve_window(&c);
        assert_eq!(from, start - Duration::minutes(MAX_BOOKING_MINUTES));
        assert_eq!(to, c.end);
    }

    #[test]
    fn windows_at_the_calendar_limits_do_not_overflow() {
        let (from, to) = day_window(NaiveDate::MAX);
        assert!(from < to);

        let start = NaiveDateTime::MIN + Duration::minutes(30);
        let c = Candidate {
            room: Room::StudioA,
            start,
            end: start + Duration::hours(1),
        };
        assert_eq!(reserve_window(&c), (NaiveDateTime::MIN, c.end));
    }
}
