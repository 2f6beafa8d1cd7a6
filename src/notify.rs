use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{BookingStatus, SlotStatus};

const CHANNEL_CAPACITY: usize = 256;

/// A committed change to a slot or the booking holding it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotChange {
    pub slot_id: Ulid,
    pub slot_status: SlotStatus,
    pub version: u64,
    pub booking_id: Option<Ulid>,
    pub booking_status: Option<BookingStatus>,
}

/// Broadcast hub of committed changes per slot.
#[derive(Default)]
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<SlotChange>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to changes for a slot. Creates the channel if needed.
    pub fn subscribe(&self, slot_id: Ulid) -> broadcast::Receiver<SlotChange> {
        let sender = self
            .channels
            .entry(slot_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a change. No-op if nobody is listening; a channel whose
    /// subscribers have all gone is dropped here.
    pub fn send(&self, change: SlotChange) {
        let slot_id = change.slot_id;
        let orphaned = match self.channels.get(&slot_id) {
            Some(sender) => sender.send(change).is_err(),
            None => return,
        };
        if orphaned {
            self.prune(&slot_id);
        }
    }

    /// Drop the channel once the last subscriber has gone.
    pub fn prune(&self, slot_id: &Ulid) {
        self.channels
            .remove_if(slot_id, |_, sender| sender.receiver_count() == 0);
    }
}
