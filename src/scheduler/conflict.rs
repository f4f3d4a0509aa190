use chrono::NaiveDateTime;
use ulid::Ulid;

use crate::model::*;

/// A proposed room occupation, already validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub room: Room,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl Candidate {
    pub fn span(&self) -> Span {
        Span::between(self.start, self.end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictResult {
    NoConflict,
    /// The first overlapping booking found.
    Conflict(Booking),
}

impl ConflictResult {
    pub fn is_conflict(&self) -> bool {
        matches!(self, ConflictResult::Conflict(_))
    }
}

/// Half-open overlap test of `candidate` against `existing`.
///
/// Only bookings in the candidate's room count, and `exclude_id` is skipped so a
/// reschedule never collides with its own previous slot. `[c.start, c.end)` and
/// `[b.start, b.end)` conflict iff `c.start < b.end && c.end > b.start`.
pub fn check_conflict<'a, I>(
    candidate: &Candidate,
    existing: I,
    exclude_id: Option<Ulid>,
) -> ConflictResult
where
    I: IntoIterator<Item = &'a Booking>,
{
    let span = candidate.span();
    existing
        .into_iter()
        .filter(|b| b.room == candidate.room && Some(b.id) != exclude_id)
        .find(|b| b.span().overlaps(&span))
        .map_or(ConflictResult::NoConflict, |b| {
            ConflictResult::Conflict(b.clone())
        })
}
