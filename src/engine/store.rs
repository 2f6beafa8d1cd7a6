use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

pub type SharedSlot = Arc<RwLock<Slot>>;

/// Slots keyed by id. Each slot sits behind its own lock so unrelated slots
/// never contend; the lock is the single-writer unit for the slot and every
/// booking that references it.
#[derive(Default)]
pub struct SlotStore {
    slots: DashMap<Ulid, SharedSlot>,
    by_owner: DashMap<Ulid, Vec<Ulid>>,
}

impl SlotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, id: &Ulid) -> bool {
        self.slots.contains_key(id)
    }

    pub fn get(&self, id: &Ulid) -> Option<SharedSlot> {
        self.slots.get(id).map(|e| e.value().clone())
    }

    /// Insert or replace. Replacing keeps the owner index stable.
    pub fn put(&self, slot: Slot) {
        let (id, owner) = (slot.id, slot.owner_id);
        match self.get(&id) {
            Some(existing) => match existing.try_write() {
                Ok(mut guard) => *guard = slot,
                Err(_) => {
                    self.slots.insert(id, Arc::new(RwLock::new(slot)));
                }
            },
            None => {
                self.slots.insert(id, Arc::new(RwLock::new(slot)));
                self.by_owner.entry(owner).or_default().push(id);
            }
        }
    }

    pub async fn snapshot(&self, id: &Ulid) -> Option<Slot> {
        let shared = self.get(id)?;
        let guard = shared.read().await;
        Some(guard.clone())
    }

    pub fn ids(&self) -> Vec<Ulid> {
        self.slots.iter().map(|e| *e.key()).collect()
    }

    pub fn ids_for_owner(&self, owner_id: &Ulid) -> Vec<Ulid> {
        self.by_owner
            .get(owner_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }
}

/// Bookings keyed by id, with slot and student indexes.
///
/// Rows are only mutated by a caller holding the write lock of the booking's
/// slot, so a reader that holds the slot's read lock sees a consistent pair.
#[derive(Default)]
pub struct BookingStore {
    bookings: DashMap<Ulid, Booking>,
    by_slot: DashMap<Ulid, Vec<Ulid>>,
    by_student: DashMap<Ulid, Vec<Ulid>>,
}

impl BookingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bookings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bookings.is_empty()
    }

    pub fn get(&self, id: &Ulid) -> Option<Booking> {
        self.bookings.get(id).map(|e| e.value().clone())
    }

    /// Insert a new row, or overwrite an existing one (compaction restore).
    pub fn put(&self, booking: Booking) {
        let (id, slot_id, student_id) = (booking.id, booking.slot_id, booking.student_id);
        if self.bookings.insert(id, booking).is_none() {
            self.by_slot.entry(slot_id).or_default().push(id);
            self.by_student.entry(student_id).or_default().push(id);
        }
    }

    /// Mutate a row in place. Returns false if it doesn't exist.
    pub fn update(&self, id: &Ulid, f: impl FnOnce(&mut Booking)) -> bool {
        match self.bookings.get_mut(id) {
            Some(mut entry) => {
                f(entry.value_mut());
                true
            }
            None => false,
        }
    }

    fn collect(&self, ids: Option<Vec<Ulid>>) -> Vec<Booking> {
        let mut out: Vec<Booking> = ids
            .unwrap_or_default()
            .iter()
            .filter_map(|id| self.get(id))
            .collect();
        out.sort_by_key(|b| (b.created_at, b.id));
        out
    }

    /// Every booking that ever referenced the slot, oldest first.
    pub fn for_slot(&self, slot_id: &Ulid) -> Vec<Booking> {
        self.collect(self.by_slot.get(slot_id).map(|e| e.value().clone()))
    }

    pub fn for_student(&self, student_id: &Ulid) -> Vec<Booking> {
        self.collect(self.by_student.get(student_id).map(|e| e.value().clone()))
    }

    pub fn active_for_slot(&self, slot_id: &Ulid) -> Vec<Booking> {
        self.for_slot(slot_id)
            .into_iter()
            .filter(|b| b.status.is_active())
            .collect()
    }

    pub fn all(&self) -> Vec<Booking> {
        self.bookings.iter().map(|e| e.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(owner: Ulid, start: Ms) -> Slot {
        Slot {
            id: Ulid::new(),
            owner_id: owner,
            span: Span::new(start, start + 1_800_000),
            status: SlotStatus::Available,
            version: 0,
            created_at: 0,
            cancellation_notice_ms: None,
        }
    }

    #[tokio::test]
    async fn slot_put_replaces_in_place() {
        let store = SlotStore::new();
        let owner = Ulid::new();
        let mut s = slot(owner, 10_000);
        store.put(s.clone());
        s.status = SlotStatus::Booked;
        s.version = 3;
        store.put(s.clone());

        assert_eq!(store.len(), 1);
        assert_eq!(store.ids_for_owner(&owner), vec![s.id]);
        assert_eq!(store.snapshot(&s.id).await.unwrap(), s);
    }

    #[test]
    fn booking_indexes() {
        let store = BookingStore::new();
        let slot_id = Ulid::new();
        let student = Ulid::new();
        let a = Booking::pending(Ulid::new(), slot_id, student, 1);
        let mut b = Booking::pending(Ulid::new(), slot_id, Ulid::new(), 2);
        b.status = BookingStatus::Cancelled;
        store.put(a.clone());
        store.put(b.clone());
        // Overwrite must not duplicate index entries.
        store.put(a.clone());

        assert_eq!(store.for_slot(&slot_id), vec![a.clone(), b]);
        assert_eq!(store.for_student(&student), vec![a.clone()]);
        assert_eq!(store.active_for_slot(&slot_id), vec![a.clone()]);

        assert!(store.update(&a.id, |bk| bk.status = BookingStatus::Confirmed));
        assert_eq!(store.get(&a.id).unwrap().status, BookingStatus::Confirmed);
        assert!(!store.update(&Ulid::new(), |_| {}));
    }
}
