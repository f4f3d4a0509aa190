use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::NaiveDateTime;
use dashmap::DashMap;
use tokio::sync::broadcast::{self, error::TryRecvError};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability;
use crate::scheduler::{BookingStore, StoreError};

type ListKey = (Option<Room>, NaiveDateTime, NaiveDateTime);

struct Entry<T> {
    value: T,
    stored: Instant,
}

/// Read cache in front of a `BookingStore`.
///
/// `list_bookings` and `band_exists` answers are reused for at most `ttl`. Every event the
/// store publishes drops the entries it could have changed before the next read is served,
/// so a reader never sees a slot as taken after its cancellation returned. A fetch that
/// overlaps any invalidation is served but not kept. Writes and `get_booking` always go
/// to the store.
pub struct CachedStore<S> {
    inner: Arc<S>,
    ttl: Duration,
    listings: DashMap<ListKey, Entry<Vec<Booking>>>,
    bands: DashMap<Ulid, Entry<bool>>,
    events: Mutex<broadcast::Receiver<Event>>,
    /// Bumped by every invalidation.
    generation: AtomicU64,
}

impl<S: BookingStore> CachedStore<S> {
    pub fn new(inner: Arc<S>, notify: &NotifyHub, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            listings: DashMap::new(),
            bands: DashMap::new(),
            events: Mutex::new(notify.subscribe()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn inner(&self) -> &Arc<S> {
        &self.inner
    }

    pub fn len(&self) -> usize {
        self.listings.len() + self.bands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.listings.clear();
        self.bands.clear();
    }

    /// Apply every invalidation published since the last read.
    fn drain(&self) {
        let Ok(mut rx) = self.events.lock() else {
            self.clear();
            return;
        };
        loop {
            match rx.try_recv() {
                Ok(event) => self.invalidate(&event),
                Err(TryRecvError::Lagged(_)) => self.clear(),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
    }

    fn invalidate(&self, event: &Event) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        match event {
            Event::BandCreated { id, .. } | Event::BandDeleted { id } => {
                self.bands.remove(id);
            }
            _ => {}
        }
        let rooms = event.rooms();
        if !rooms.is_empty() {
            self.listings
                .retain(|(room, _, _), _| room.is_some_and(|r| !rooms.contains(&r)));
        }
    }

    fn fresh<K, T: Clone>(&self, map: &DashMap<K, Entry<T>>, key: &K) -> Option<T>
    where
        K: Eq + std::hash::Hash,
    {
        let hit = map
            .get(key)
            .filter(|e| e.stored.elapsed() < self.ttl)
            .map(|e| e.value.clone());
        if hit.is_some() {
            metrics::counter!(observability::CACHE_HITS_TOTAL).increment(1);
        } else {
            metrics::counter!(observability::CACHE_MISSES_TOTAL).increment(1);
        }
        hit
    }

    /// Keep `value` unless an invalidation ran since `seen`. The second look catches one
    /// that bumped after the first but cleared before the insert landed.
    fn keep<K, T>(&self, map: &DashMap<K, Entry<T>>, key: K, value: T, seen: u64)
    where
        K: Eq + std::hash::Hash + Clone,
    {
        if self.generation.load(Ordering::SeqCst) != seen {
            return;
        }
        map.insert(
            key.clone(),
            Entry {
                value,
                stored: Instant::now(),
            },
        );
        if self.generation.load(Ordering::SeqCst) != seen {
            map.remove(&key);
        }
    }
}

#[async_trait]
impl<S: BookingStore> BookingStore for CachedStore<S> {
    async fn list_bookings(
        &self,
        room: Option<Room>,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> Result<Vec<Booking>, StoreError> {
        self.drain();
        let key = (room, from, to);
        if let Some(rows) = self.fresh(&self.listings, &key) {
            return Ok(rows);
        }
        let seen = self.generation.load(Ordering::SeqCst);
        let rows = self.inner.list_bookings(room, from, to).await?;
        self.keep(&self.listings, key, rows.clone(), seen);
        Ok(rows)
    }

    async fn get_booking(&self, id: Ulid) -> Result<Option<Booking>, StoreError> {
        self.inner.get_booking(id).await
    }

    async fn insert_booking(&self, booking: NewBooking) -> Result<Booking, StoreError> {
        let b = self.inner.insert_booking(booking).await?;
        self.invalidate(&Event::booking_created(&b));
        Ok(b)
    }

    async fn update_booking(&self, id: Ulid, fields: NewBooking) -> Result<Booking, StoreError> {
        let from_room = self.inner.get_booking(id).await?.map(|b| b.room);
        let b = self.inner.update_booking(id, fields).await?;
        self.invalidate(&Event::BookingRescheduled {
            id,
            band_id: b.band_id,
            from_room: from_room.unwrap_or(b.room),
            room: b.room,
            start: b.start,
            duration_minutes: b.duration_minutes,
        });
        Ok(b)
    }

    async fn delete_booking(&self, id: Ulid) -> Result<Booking, StoreError> {
        let b = self.inner.delete_booking(id).await?;
        self.invalidate(&Event::BookingCancelled { id, room: b.room });
        Ok(b)
    }

    async fn band_exists(&self, band_id: Ulid) -> Result<bool, StoreError> {
        self.drain();
        if let Some(exists) = self.fresh(&self.bands, &band_id) {
            return Ok(exists);
        }
        let seen = self.generation.load(Ordering::SeqCst);
        let exists = self.inner.band_exists(band_id).await?;
        self.keep(&self.bands, band_id, exists, seen);
        Ok(exists)
    }
}
