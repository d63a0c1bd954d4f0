//! Live-update fan-out: one bounded queue per subscriber.
//!
//! Publishing never blocks. A subscriber whose queue is full is disconnected
//! (its sender is dropped) and flagged as overflowed; other subscribers and
//! the writer are unaffected.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use tracing::{debug, warn};

use crate::model::message::Event;

struct Slot {
    id: u64,
    sender: SyncSender<Event>,
    overflowed: Arc<AtomicBool>,
}

/// Registry of live subscribers.
#[derive(Default)]
pub(crate) struct Hub {
    next_slot: u64,
    slots: Vec<Slot>,
}

impl Hub {
    /// Queue `event` to every subscriber, dropping the ones that are gone or full.
    ///
    /// Each call takes exactly one queue slot per subscriber, however many
    /// messages the event covers.
    pub(crate) fn publish(&mut self, event: &Event) {
        self.slots.retain(|slot| match slot.sender.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(subscriber = slot.id, "Subscriber fell behind, disconnecting");
                slot.overflowed.store(true, Ordering::Release);
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!(subscriber = slot.id, "Subscriber gone");
                false
            }
        });
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }
}

/// Lock the hub even if a previous holder panicked; its state is always
/// consistent between statements.
pub(crate) fn lock_hub(hub: &Mutex<Hub>) -> std::sync::MutexGuard<'_, Hub> {
    hub.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Register a new subscriber with a queue of `capacity` events.
pub(crate) fn subscribe(hub: &Arc<Mutex<Hub>>, capacity: usize) -> Subscription {
    let (sender, receiver) = mpsc::sync_channel(capacity.max(1));
    let overflowed = Arc::new(AtomicBool::new(false));

    let mut guard = lock_hub(hub);
    guard.next_slot += 1;
    let id = guard.next_slot;
    guard.slots.push(Slot {
        id,
        sender,
        overflowed: Arc::clone(&overflowed),
    });
    debug!(subscriber = id, total = guard.len(), "Subscriber attached");

    Subscription {
        id,
        receiver,
        overflowed,
        hub: Arc::downgrade(hub),
    }
}

/// A live stream of store events for one consumer.
///
/// Dropping the subscription releases its slot immediately.
pub struct Subscription {
    id: u64,
    receiver: Receiver<Event>,
    overflowed: Arc<AtomicBool>,
    hub: Weak<Mutex<Hub>>,
}

impl Subscription {
    /// Block until the next event. `None` once the subscription has been
    /// disconnected (overflow or store dropped) and the queue is drained.
    pub fn recv(&self) -> Option<Event> {
        self.receiver.recv().ok()
    }

    /// Wait up to `timeout` for the next event.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Event, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    pub fn try_recv(&self) -> Option<Event> {
        self.receiver.try_recv().ok()
    }

    /// `true` if this subscriber was disconnected for falling behind.
    pub fn is_overflowed(&self) -> bool {
        self.overflowed.load(Ordering::Acquire)
    }
}

impl Iterator for Subscription {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        self.recv()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            let mut guard = lock_hub(&hub);
            guard.slots.retain(|slot| slot.id != self.id);
            debug!(subscriber = self.id, total = guard.len(), "Subscriber detached");
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("overflowed", &self.is_overflowed())
            .finish()
    }
}
