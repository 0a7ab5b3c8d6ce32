//! The per-room song queue
//!
//! A FIFO of [`Entry`] values with blocking read semantics: `peek` and
//! `pop_front` suspend until the queue is non-empty. The entry count is
//! tracked by a semaphore so blocked readers wake exactly when work
//! arrives, and a read lock serializes the blocking readers themselves.
//! Structural mutation always happens under the entries lock.

use std::collections::VecDeque;

use tokio::sync::{Mutex, Semaphore};
use uuid::Uuid;

use crate::models::Entry;

pub struct SongQueue {
    entries: Mutex<VecDeque<Entry>>,
    count: Semaphore,
    read_lock: Mutex<()>,
}

impl SongQueue {
    /// Construct a queue seeded with `initial` entries, e.g. the snapshot a
    /// playback client carries across a reconnect.
    pub fn new(initial: Vec<Entry>) -> Self {
        let count = Semaphore::new(initial.len());
        Self {
            entries: Mutex::new(VecDeque::from(initial)),
            count,
            read_lock: Mutex::new(()),
        }
    }

    /// Push to the tail and wake one blocked reader.
    pub async fn append(&self, entry: Entry) {
        self.entries.lock().await.push_back(entry);
        self.count.add_permits(1);
    }

    /// Bulk append.
    pub async fn extend(&self, entries: impl IntoIterator<Item = Entry>) {
        for entry in entries {
            self.append(entry).await;
        }
    }

    /// Return the head without consuming it, suspending until the queue is
    /// non-empty. Two peeks without an intervening pop return the same
    /// entry.
    pub async fn peek(&self) -> Entry {
        let _read = self.read_lock.lock().await;
        let permit = self.count.acquire().await.expect("queue semaphore closed");
        let entries = self.entries.lock().await;
        drop(permit);
        entries.front().cloned().expect("permit held on empty queue")
    }

    /// Non-blocking head inspection.
    pub async fn try_peek(&self) -> Option<Entry> {
        self.entries.lock().await.front().cloned()
    }

    /// Remove and return the head, suspending until the queue is non-empty.
    pub async fn pop_front(&self) -> Entry {
        let _read = self.read_lock.lock().await;
        let permit = self.count.acquire().await.expect("queue semaphore closed");
        let mut entries = self.entries.lock().await;
        permit.forget();
        entries.pop_front().expect("permit held on empty queue")
    }

    /// Remove the first entry with this uuid. Succeeds silently when no
    /// such entry exists.
    pub async fn remove(&self, uuid: &Uuid) -> Option<Entry> {
        let _read = self.read_lock.lock().await;
        let mut entries = self.entries.lock().await;
        let pos = entries.iter().position(|e| e.uuid == *uuid)?;
        if let Ok(permit) = self.count.try_acquire() {
            permit.forget();
        }
        entries.remove(pos)
    }

    /// Find an entry by uuid. O(n).
    pub async fn find_by_uuid(&self, uuid: &Uuid) -> Option<Entry> {
        self.entries
            .lock()
            .await
            .iter()
            .find(|e| e.uuid == *uuid)
            .cloned()
    }

    /// Swap the entry with the one before it. The head ("now playing") and
    /// position 1 (being buffered) never move, so this is a no-op for
    /// indices 0 and 1.
    pub async fn move_up(&self, uuid: &Uuid) {
        let _read = self.read_lock.lock().await;
        let mut entries = self.entries.lock().await;
        if let Some(idx) = entries.iter().position(|e| e.uuid == *uuid) {
            if idx > 1 {
                entries.swap(idx, idx - 1);
            }
        }
    }

    /// Remove the entry and reinsert it at `target`. When the target lies
    /// beyond the original index it is decremented by one so the entry
    /// lands where the caller saw the slot before removal.
    pub async fn move_to(&self, uuid: &Uuid, target: usize) {
        let _read = self.read_lock.lock().await;
        let mut entries = self.entries.lock().await;
        let Some(idx) = entries.iter().position(|e| e.uuid == *uuid) else {
            return;
        };
        if idx == target {
            return;
        }
        let Some(entry) = entries.remove(idx) else {
            return;
        };
        let target = if target > idx { target - 1 } else { target };
        let target = target.min(entries.len());
        entries.insert(target, entry);
    }

    /// Apply `mutator` to the first entry with this uuid and return the
    /// updated copy.
    pub async fn update<F>(&self, uuid: &Uuid, mutator: F) -> Option<Entry>
    where
        F: FnOnce(&mut Entry),
    {
        let mut entries = self.entries.lock().await;
        let entry = entries.iter_mut().find(|e| e.uuid == *uuid)?;
        mutator(entry);
        Some(entry.clone())
    }

    /// Suspend until the queue has a head, apply `mutator` to it and
    /// return the updated copy. The read and the write happen in one
    /// exclusion region, so no concurrent removal can slip between them.
    pub async fn update_head<F>(&self, mutator: F) -> Entry
    where
        F: FnOnce(&mut Entry),
    {
        let _read = self.read_lock.lock().await;
        let permit = self.count.acquire().await.expect("queue semaphore closed");
        let mut entries = self.entries.lock().await;
        drop(permit);
        let entry = entries.front_mut().expect("permit held on empty queue");
        mutator(entry);
        entry.clone()
    }

    /// Snapshot copy for serialization.
    pub async fn to_list(&self) -> Vec<Entry> {
        self.entries.lock().await.iter().cloned().collect()
    }

    /// Left fold over the entries in queue order.
    pub async fn fold<T, F>(&self, init: T, mut f: F) -> T
    where
        F: FnMut(T, &Entry) -> T,
    {
        let entries = self.entries.lock().await;
        let mut acc = init;
        for entry in entries.iter() {
            acc = f(acc, entry);
        }
        acc
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

impl Default for SongQueue {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn entry(title: &str) -> Entry {
        Entry::new(title, "files", "tester", title, "", "", 60)
    }

    #[tokio::test]
    async fn peek_is_stable_until_pop() {
        let queue = SongQueue::default();
        queue.append(entry("one")).await;
        queue.append(entry("two")).await;

        let first = queue.peek().await;
        let second = queue.peek().await;
        assert_eq!(first.uuid, second.uuid);

        let popped = queue.pop_front().await;
        assert_eq!(popped.uuid, first.uuid);
        assert_eq!(queue.peek().await.title, "two");
    }

    #[tokio::test]
    async fn peek_blocks_until_append() {
        let queue = SongQueue::default();

        let mut waiter = tokio_test::task::spawn(queue.peek());
        tokio_test::assert_pending!(waiter.poll());

        queue.append(entry("late")).await;
        let peeked = timeout(Duration::from_secs(1), &mut waiter)
            .await
            .expect("peek should wake after append");
        assert_eq!(peeked.title, "late");
    }

    #[tokio::test]
    async fn update_head_waits_and_mutates_in_place() {
        let queue = SongQueue::default();

        let mut waiter = tokio_test::task::spawn(queue.update_head(|e| e.failed = true));
        tokio_test::assert_pending!(waiter.poll());

        queue.append(entry("first")).await;
        let updated = timeout(Duration::from_secs(1), &mut waiter)
            .await
            .expect("update_head should wake after append");
        assert!(updated.failed);
        assert!(queue.peek().await.failed);
    }

    #[tokio::test]
    async fn move_up_protects_head_and_next() {
        let queue = SongQueue::default();
        let entries: Vec<_> = ["a", "b", "c", "d"].iter().map(|t| entry(t)).collect();
        let uuids: Vec<_> = entries.iter().map(|e| e.uuid).collect();
        queue.extend(entries).await;

        queue.move_up(&uuids[0]).await;
        queue.move_up(&uuids[1]).await;
        let titles: Vec<_> = queue.to_list().await.into_iter().map(|e| e.title).collect();
        assert_eq!(titles, ["a", "b", "c", "d"]);

        queue.move_up(&uuids[2]).await;
        let titles: Vec<_> = queue.to_list().await.into_iter().map(|e| e.title).collect();
        assert_eq!(titles, ["a", "c", "b", "d"]);
    }

    #[tokio::test]
    async fn move_to_is_idempotent() {
        let queue = SongQueue::default();
        let entries: Vec<_> = ["a", "b", "c", "d"].iter().map(|t| entry(t)).collect();
        let moved = entries[1].uuid;
        queue.extend(entries).await;

        queue.move_to(&moved, 3).await;
        let titles: Vec<_> = queue.to_list().await.into_iter().map(|e| e.title).collect();
        assert_eq!(titles, ["a", "c", "d", "b"]);

        queue.move_to(&moved, 3).await;
        let titles: Vec<_> = queue.to_list().await.into_iter().map(|e| e.title).collect();
        assert_eq!(titles, ["a", "c", "d", "b"]);
    }

    #[tokio::test]
    async fn remove_missing_is_silent() {
        let queue = SongQueue::default();
        queue.append(entry("only")).await;
        assert!(queue.remove(&Uuid::new_v4()).await.is_none());
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn remove_releases_count() {
        let queue = SongQueue::default();
        let e = entry("gone");
        let uuid = e.uuid;
        queue.append(e).await;
        assert!(queue.remove(&uuid).await.is_some());
        assert!(queue.is_empty().await);

        // A pop after remove must block rather than return stale state.
        let popped = timeout(Duration::from_millis(50), queue.pop_front()).await;
        assert!(popped.is_err());
    }

    #[tokio::test]
    async fn fold_accumulates_in_order() {
        let queue = SongQueue::default();
        queue.extend(["a", "b", "c"].iter().map(|t| entry(t))).await;
        let joined = queue
            .fold(String::new(), |acc, e| acc + &e.title)
            .await;
        assert_eq!(joined, "abc");
    }
}
