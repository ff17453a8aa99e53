//! Aggregation of continuous-scan results for polling consumers.
//!
//! While a continuous inventory runs and nobody subscribed to the inventory
//! callback, every batch is merged into an [`InventoryStore`] keyed by tag
//! identifier. [`InventoryStore::fetch`] drains the store atomically.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::tag::Tag;

#[derive(Debug, Default)]
struct Entries {
    tags: Vec<Tag>,
    index: HashMap<String, usize>,
}

impl Entries {
    fn drain(&mut self) -> Vec<Tag> {
        self.index.clear();
        std::mem::take(&mut self.tags)
    }
}

/// Deduplicating tag accumulator shared by the event producer and `fetch` callers.
#[derive(Debug, Default)]
pub struct InventoryStore {
    entries: Mutex<Entries>,
    notify: Notify,
}

impl InventoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a batch into the store and wake any waiting `fetch`.
    ///
    /// A known identifier gets its seen count increased by the new
    /// observation's count and its last-seen time moved to the new
    /// timestamp. An unknown identifier is inserted with first-seen and
    /// last-seen set to its timestamp.
    pub fn merge(&self, batch: Vec<Tag>) {
        if batch.is_empty() {
            return;
        }
        {
            let mut entries = self.entries.lock();
            for mut tag in batch {
                match entries.index.get(tag.id()).copied() {
                    Some(pos) => {
                        let current = &mut entries.tags[pos];
                        current.seen_count += tag.seen_count;
                        current.last_seen = Some(tag.timestamp);
                    }
                    None => {
                        tag.first_seen = Some(tag.timestamp);
                        tag.last_seen = Some(tag.timestamp);
                        let pos = entries.tags.len();
                        entries.index.insert(tag.id().to_string(), pos);
                        entries.tags.push(tag);
                    }
                }
            }
        }
        self.notify.notify_waiters();
    }

    /// Drain the store.
    ///
    /// With `wait_for_tags` set and the store empty, suspends until a
    /// producer merges at least one tag. Tags are returned in first-seen order.
    pub async fn fetch(&self, wait_for_tags: bool) -> Vec<Tag> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut entries = self.entries.lock();
                if !wait_for_tags || !entries.tags.is_empty() {
                    return entries.drain();
                }
            }
            notified.await;
        }
    }

    /// Discard everything.
    pub fn clear(&self) {
        self.entries.lock().drain();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{TimeZone, Utc};

    use super::*;

    fn tag_at(id: &str, secs: i64, seen: u32) -> Tag {
        let mut tag = Tag::uhf(id, Utc.timestamp_opt(secs, 0).unwrap());
        tag.seen_count = seen;
        tag
    }

    #[tokio::test]
    async fn fetch_without_wait_on_empty_returns_immediately() {
        let store = InventoryStore::new();
        let tags = tokio::time::timeout(Duration::from_millis(50), store.fetch(false))
            .await
            .expect("fetch(false) must not suspend");
        assert!(tags.is_empty());
    }

    #[tokio::test]
    async fn fetch_with_wait_suspends_until_tags_arrive() {
        let store = Arc::new(InventoryStore::new());
        let consumer = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.fetch(true).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!consumer.is_finished());

        store.merge(vec![tag_at("A", 10, 1)]);
        let tags = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].id(), "A");
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn empty_batch_does_not_wake_waiter() {
        let store = Arc::new(InventoryStore::new());
        let consumer = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.fetch(true).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        store.merge(Vec::new());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!consumer.is_finished());
        consumer.abort();
    }

    #[tokio::test]
    async fn merge_accumulates_seen_count_and_last_seen() {
        let store = InventoryStore::new();
        store.merge(vec![tag_at("A", 10, 2), tag_at("B", 10, 1)]);
        store.merge(vec![tag_at("A", 15, 3)]);

        let tags = store.fetch(false).await;
        assert_eq!(tags.len(), 2);
        let a = &tags[0];
        assert_eq!(a.id(), "A");
        assert_eq!(a.seen_count, 5);
        assert_eq!(a.first_seen, Some(Utc.timestamp_opt(10, 0).unwrap()));
        assert_eq!(a.last_seen, Some(Utc.timestamp_opt(15, 0).unwrap()));
        assert_eq!(tags[1].id(), "B");
    }

    #[tokio::test]
    async fn fetch_drains_store() {
        let store = InventoryStore::new();
        store.merge(vec![tag_at("A", 1, 1)]);
        assert_eq!(store.fetch(false).await.len(), 1);
        assert!(store.fetch(false).await.is_empty());

        store.merge(vec![tag_at("A", 2, 1)]);
        let tags = store.fetch(false).await;
        assert_eq!(tags[0].seen_count, 1);
    }

    #[test]
    fn clear_discards_entries() {
        let store = InventoryStore::new();
        store.merge(vec![tag_at("A", 1, 1)]);
        store.clear();
        assert!(store.is_empty());
    }
}
