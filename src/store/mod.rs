//! In-memory message store shared by the ingestion and query paths.
//!
//! One `RwLock` guards the collection. Writers hold it only for the
//! structural change itself; parsing happens on the message, outside any
//! store lock. Events are handed to the subscriber hub after the hub lock is
//! taken but before the store lock is released, so subscribers see events in
//! the same order the changes were applied.

pub mod subscription;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use tracing::debug;

use crate::error::{Result, StoreError};
use crate::model::message::{Envelope, Event, Message, MessageId, MessageSummary, Part};

pub use subscription::Subscription;
use subscription::{lock_hub, Hub};

/// Default per-subscriber queue length.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 64;

#[derive(Default)]
struct Collection {
    last_id: u64,
    messages: BTreeMap<MessageId, Arc<Message>>,
}

/// The authoritative set of captured messages.
pub struct MessageStore {
    collection: RwLock<Collection>,
    hub: Arc<Mutex<Hub>>,
    subscriber_buffer: usize,
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_BUFFER)
    }
}

impl MessageStore {
    /// Create an empty store whose subscribers each buffer `subscriber_buffer` events.
    pub fn new(subscriber_buffer: usize) -> Self {
        Self {
            collection: RwLock::new(Collection::default()),
            hub: Arc::new(Mutex::new(Hub::default())),
            subscriber_buffer,
        }
    }

    /// Append a message and return its freshly assigned id.
    pub fn insert(&self, envelope: Envelope, raw: Vec<u8>) -> Result<MessageId> {
        let mut message = Message::new(envelope, raw);

        let mut collection = self
            .collection
            .write()
            .map_err(|_| StoreError::Unavailable)?;
        collection.last_id += 1;
        let id = MessageId(collection.last_id);
        message.assign_id(id);
        collection.messages.insert(id, Arc::new(message));
        let total = collection.messages.len();

        let mut hub = lock_hub(&self.hub);
        drop(collection);
        hub.publish(&Event::Added(id));

        debug!(%id, total, "Message stored");
        Ok(id)
    }

    /// Point-in-time list of all messages, oldest first.
    pub fn list(&self) -> Result<Vec<MessageSummary>> {
        let collection = self
            .collection
            .read()
            .map_err(|_| StoreError::Unavailable)?;
        Ok(collection.messages.values().map(|m| m.summary()).collect())
    }

    pub fn get(&self, id: MessageId) -> Result<Arc<Message>> {
        let collection = self
            .collection
            .read()
            .map_err(|_| StoreError::Unavailable)?;
        collection
            .messages
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    /// Fetch part `index` of message `id`, parsing the message on first use.
    pub fn get_part(&self, id: MessageId, index: usize) -> Result<Part> {
        let message = self.get(id)?;
        let parsed = message.parsed()?;
        parsed
            .part(index)
            .cloned()
            .ok_or_else(|| StoreError::PartNotFound {
                id,
                part: index.to_string(),
            })
    }

    /// Fetch the part of message `id` whose `Content-ID` is `cid`.
    pub fn get_part_by_cid(&self, id: MessageId, cid: &str) -> Result<Part> {
        let message = self.get(id)?;
        let parsed = message.parsed()?;
        parsed
            .part_by_cid(cid)
            .cloned()
            .ok_or_else(|| StoreError::PartNotFound {
                id,
                part: format!("cid:{cid}"),
            })
    }

    pub fn delete(&self, id: MessageId) -> Result<()> {
        let mut collection = self
            .collection
            .write()
            .map_err(|_| StoreError::Unavailable)?;
        if collection.messages.remove(&id).is_none() {
            return Err(StoreError::NotFound(id));
        }
        let total = collection.messages.len();

        let mut hub = lock_hub(&self.hub);
        drop(collection);
        hub.publish(&Event::Removed(id));

        debug!(%id, total, "Message deleted");
        Ok(())
    }

    /// Remove every message; returns how many were removed.
    ///
    /// Subscribers get a single `Cleared` event listing the removed ids in
    /// ascending order. Nothing is published when the store was already empty.
    pub fn delete_all(&self) -> Result<usize> {
        let mut collection = self
            .collection
            .write()
            .map_err(|_| StoreError::Unavailable)?;
        let removed = std::mem::take(&mut collection.messages);

        let ids: Vec<MessageId> = removed.keys().copied().collect();
        let count = ids.len();

        let mut hub = lock_hub(&self.hub);
        drop(collection);
        if count > 0 {
            hub.publish(&Event::Cleared(ids));
        }

        debug!(count, "All messages deleted");
        Ok(count)
    }

    /// Attach a new live subscriber.
    pub fn subscribe(&self) -> Subscription {
        subscription::subscribe(&self.hub, self.subscriber_buffer)
    }

    /// Number of currently attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        lock_hub(&self.hub).len()
    }

    pub fn len(&self) -> Result<usize> {
        let collection = self
            .collection
            .read()
            .map_err(|_| StoreError::Unavailable)?;
        Ok(collection.messages.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.len().map(|n| n == 0)
    }

    #[cfg(test)]
    pub(crate) fn poison_for_test(&self) {
        let _guard = self.collection.write();
        panic!("poisoning the collection lock");
    }
}

impl std::fmt::Debug for MessageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageStore")
            .field("subscriber_buffer", &self.subscriber_buffer)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope() -> Envelope {
        Envelope::new("from@example.com", vec!["to@example.com".into()]).unwrap()
    }

    fn insert(store: &MessageStore, body: &str) -> MessageId {
        store
            .insert(envelope(), format!("Subject: test\r\n\r\n{body}").into_bytes())
            .unwrap()
    }

    #[test]
    fn test_ids_increase_and_are_not_reused() {
        let store = MessageStore::default();
        let a = insert(&store, "a");
        let b = insert(&store, "b");
        assert!(b > a);
        store.delete(b).unwrap();
        let c = insert(&store, "c");
        assert!(c > b);
    }

    #[test]
    fn test_delete_then_get_is_not_found() {
        let store = MessageStore::default();
        let id = insert(&store, "x");
        assert!(store.list().unwrap().iter().any(|m| m.id == id));
        store.delete(id).unwrap();
        assert!(store.list().unwrap().is_empty());
        assert_eq!(store.get(id).unwrap_err(), StoreError::NotFound(id));
        assert_eq!(store.delete(id).unwrap_err(), StoreError::NotFound(id));
    }

    #[test]
    fn test_delete_all_counts() {
        let store = MessageStore::default();
        for i in 0..5 {
            insert(&store, &i.to_string());
        }
        assert_eq!(store.delete_all().unwrap(), 5);
        assert!(store.is_empty().unwrap());
        assert_eq!(store.delete_all().unwrap(), 0);
    }

    #[test]
    fn test_get_part_out_of_range() {
        let store = MessageStore::default();
        let id = insert(&store, "Hello");
        assert_eq!(store.get_part(id, 0).unwrap().body, b"Hello");
        assert!(store.get_part(id, 1).unwrap_err().is_not_found());
        assert!(store.get_part(MessageId(99), 0).unwrap_err().is_not_found());
    }

    #[test]
    fn test_events_in_order() {
        let store = MessageStore::default();
        let sub = store.subscribe();
        let a = insert(&store, "a");
        let b = insert(&store, "b");
        store.delete(a).unwrap();
        store.delete_all().unwrap();
        let events: Vec<_> = std::iter::from_fn(|| sub.try_recv()).collect();
        assert_eq!(
            events,
            vec![
                Event::Added(a),
                Event::Added(b),
                Event::Removed(a),
                Event::Cleared(vec![b])
            ]
        );
    }

    #[test]
    fn test_delete_all_does_not_overflow_caught_up_subscriber() {
        let store = MessageStore::new(4);
        let sub = store.subscribe();
        let ids: Vec<MessageId> = (0..20)
            .map(|i| {
                let id = insert(&store, &i.to_string());
                assert_eq!(sub.try_recv(), Some(Event::Added(id)));
                id
            })
            .collect();

        assert_eq!(store.delete_all().unwrap(), 20);
        assert_eq!(sub.try_recv(), Some(Event::Cleared(ids)));
        assert!(!sub.is_overflowed());
        assert_eq!(store.subscriber_count(), 1);

        // An empty store publishes nothing
        assert_eq!(store.delete_all().unwrap(), 0);
        assert_eq!(sub.try_recv(), None);
    }
}
