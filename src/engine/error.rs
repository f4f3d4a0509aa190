use ulid::Ulid;

use crate::model::Booking;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    UnknownBand(Ulid),
    UnknownMusician(Ulid),
    /// Another booking already occupies part of the interval in that room.
    ExclusionViolation(Booking),
    /// Delete refused under `OnDelete::Restrict`.
    HasDependents(Ulid),
    Invalid(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::UnknownBand(id) => write!(f, "unknown band: {id}"),
            EngineError::UnknownMusician(id) => write!(f, "unknown musician: {id}"),
            EngineError::ExclusionViolation(b) => write!(f, "overlaps {b}"),
            EngineError::HasDependents(id) => {
                write!(f, "cannot delete {id}: bookings or members still refer to it")
            }
            EngineError::Invalid(msg) => write!(f, "invalid: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
