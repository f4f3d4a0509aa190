mod error;
mod mutations;
mod queries;
mod store;

pub use error::EngineError;

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock, RwLockWriteGuard};
use tracing::info;
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

/// What deleting a band does to the rows that refer to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnDelete {
    /// Cancel the band's bookings and drop its memberships first.
    #[default]
    Cascade,
    /// Refuse while bookings or members remain.
    Restrict,
}

impl OnDelete {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cascade" => Some(OnDelete::Cascade),
            "restrict" => Some(OnDelete::Restrict),
            _ => None,
        }
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Pending = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain every Append already queued behind it.
/// 3. One flush_sync for the whole batch, then answer every sender.
/// A non-append command ends the batch; it runs after the flush.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }
        commit_batch(&mut wal, batch);
        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<Pending>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, &batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[Pending]) -> io::Result<()> {
    let appended = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so a half-written batch is not carried into the next one.
    let flushed = wal.flush_sync();
    appended.and(flushed)
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = wal.compact(&events);
            if result.is_ok() {
                info!("compacted {} to {} events", wal.path().display(), events.len());
            }
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// Bands, musicians and who plays in which band.
#[derive(Default)]
pub(super) struct Catalog {
    pub(super) bands: DashMap<Ulid, Band>,
    pub(super) musicians: DashMap<Ulid, Musician>,
    /// band id → musician ids
    pub(super) members: DashMap<Ulid, BTreeSet<Ulid>>,
}

impl Catalog {
    fn apply(&self, event: &Event) {
        match event {
            Event::BandCreated { id, name, genre, founded }
            | Event::BandUpdated { id, name, genre, founded } => {
                self.bands.insert(
                    *id,
                    Band {
                        id: *id,
                        name: name.clone(),
                        genre: genre.clone(),
                        founded: *founded,
                    },
                );
            }
            Event::BandDeleted { id } => {
                self.bands.remove(id);
                self.members.remove(id);
            }
            Event::MusicianCreated { id, first_name, last_name, instrument, phone, telegram }
            | Event::MusicianUpdated { id, first_name, last_name, instrument, phone, telegram } => {
                self.musicians.insert(
                    *id,
                    Musician {
                        id: *id,
                        first_name: first_name.clone(),
                        last_name: last_name.clone(),
                        instrument: instrument.clone(),
                        phone: phone.clone(),
                        telegram: telegram.clone(),
                    },
                );
            }
            Event::MusicianDeleted { id } => {
                self.musicians.remove(id);
                for mut band in self.members.iter_mut() {
                    band.remove(id);
                }
            }
            Event::MemberAdded { band_id, musician_id } => {
                self.members.entry(*band_id).or_default().insert(*musician_id);
            }
            Event::MemberRemoved { band_id, musician_id } => {
                if let Some(mut set) = self.members.get_mut(band_id) {
                    set.remove(musician_id);
                }
            }
            Event::BookingCreated { .. }
            | Event::BookingRescheduled { .. }
            | Event::BookingCancelled { .. } => {}
        }
    }
}

/// Apply a booking event to one room. No locking: the caller holds the lock.
/// Events for other rooms are ignored, so a reschedule is applied to both its rooms in turn.
fn apply_to_room(rs: &mut RoomState, event: &Event, index: &DashMap<Ulid, Room>) {
    match event {
        Event::BookingCreated {
            id,
            band_id,
            room,
            start,
            duration_minutes,
        } if *room == rs.room => {
            rs.insert(Booking {
                id: *id,
                band_id: *band_id,
                room: *room,
                start: *start,
                duration_minutes: *duration_minutes,
            });
            index.insert(*id, *room);
        }
        Event::BookingRescheduled { id, band_id, from_room, room, start, duration_minutes } => {
            if *from_room == rs.room {
                rs.remove(*id);
            }
            if *room == rs.room {
                rs.insert(Booking {
                    id: *id,
                    band_id: *band_id,
                    room: *room,
                    start: *start,
                    duration_minutes: *duration_minutes,
                });
                index.insert(*id, *room);
            }
        }
        Event::BookingCancelled { id, room } if *room == rs.room => {
            rs.remove(*id);
            index.remove(id);
        }
        _ => {}
    }
}

pub(super) type RoomGuard<'a> = RwLockWriteGuard<'a, RoomState>;

/// The studio's authoritative state: one lock per room, a catalog, and a WAL.
///
/// Every booking write holds its room's write lock across the overlap check, the WAL
/// append and the apply, which makes the no-overlap rule a storage-level constraint.
pub struct Engine {
    rooms: BTreeMap<Room, RwLock<RoomState>>,
    /// booking id → room
    pub(super) booking_rooms: DashMap<Ulid, Room>,
    pub(super) catalog: Catalog,
    /// Serializes catalog writes. Taken before any room lock.
    pub(super) catalog_lock: Mutex<()>,
    pub(super) on_delete: OnDelete,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, on_delete: OnDelete) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let catalog = Catalog::default();
        let booking_rooms = DashMap::new();
        let mut rooms: BTreeMap<Room, RoomState> =
            Room::ALL.into_iter().map(|r| (r, RoomState::new(r))).collect();
        for event in &events {
            catalog.apply(event);
            for room in event.rooms() {
                if let Some(rs) = rooms.get_mut(&room) {
                    apply_to_room(rs, event, &booking_rooms);
                }
            }
        }
        if !events.is_empty() {
            info!(
                "replayed {} events: {} bands, {} bookings",
                events.len(),
                catalog.bands.len(),
                booking_rooms.len()
            );
        }

        Ok(Self {
            rooms: rooms.into_iter().map(|(r, rs)| (r, RwLock::new(rs))).collect(),
            booking_rooms,
            catalog,
            catalog_lock: Mutex::new(()),
            on_delete,
            wal_tx,
            notify,
        })
    }

    pub fn on_delete(&self) -> OnDelete {
        self.on_delete
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub(super) fn room(&self, room: Room) -> &RwLock<RoomState> {
        &self.rooms[&room]
    }

    pub(super) fn room_locks(&self) -> impl Iterator<Item = &RwLock<RoomState>> {
        self.rooms.values()
    }

    /// Write-lock `rooms` in `Room` order, so two callers never wait on each other crosswise.
    pub(super) async fn lock_rooms(&self, rooms: &[Room]) -> Vec<RoomGuard<'_>> {
        let mut sorted = rooms.to_vec();
        sorted.sort();
        sorted.dedup();
        let mut guards = Vec::with_capacity(sorted.len());
        for room in sorted {
            guards.push(self.room(room).write().await);
        }
        guards
    }

    /// WAL-append, apply to every locked room the event touches, notify.
    pub(super) async fn commit_booking(
        &self,
        guards: &mut [RoomGuard<'_>],
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        for rs in guards.iter_mut() {
            apply_to_room(rs, event, &self.booking_rooms);
        }
        self.notify.send(event);
        Ok(())
    }

    /// WAL-append, apply, notify for a catalog event. Caller holds `catalog_lock`.
    pub(super) async fn commit_catalog(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.catalog.apply(event);
        self.notify.send(event);
        Ok(())
    }
}
