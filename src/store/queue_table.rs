use std::cmp::Reverse;

use crate::sync::SyncQueueItem;

/// The persisted sync queue: items plus the enqueue sequence counter.
#[derive(Debug, Clone, Default)]
pub struct QueueTable {
    items: Vec<SyncQueueItem>,
    next_seq: u64,
}

impl QueueTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an item, assigning the next sequence number.
    pub fn append(&mut self, mut item: SyncQueueItem) -> SyncQueueItem {
        self.next_seq += 1;
        item.seq = self.next_seq;
        self.items.push(item.clone());
        item
    }

    pub fn get(&self, id: &str) -> Option<&SyncQueueItem> {
        self.items.iter().find(|item| item.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut SyncQueueItem> {
        self.items.iter_mut().find(|item| item.id == id)
    }

    pub fn remove(&mut self, id: &str) -> Option<SyncQueueItem> {
        let index = self.items.iter().position(|item| item.id == id)?;
        Some(self.items.remove(index))
    }

    /// Remove every item matching `predicate`, returning them.
    pub fn remove_where(&mut self, predicate: impl Fn(&SyncQueueItem) -> bool) -> Vec<SyncQueueItem> {
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.items)
            .into_iter()
            .partition(|item| predicate(item));
        self.items = kept;
        removed
    }

    /// Remove item `id` and every queued item that depends on it.
    ///
    /// Returns the removed items, `id` first.
    pub fn remove_with_dependents(&mut self, id: &str) -> Vec<SyncQueueItem> {
        let Some(dropped) = self.remove(id) else {
            return Vec::new();
        };
        let dependents = self.remove_where(|item| !item.is_in_flight() && dropped.is_required_by(item));
        std::iter::once(dropped).chain(dependents).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SyncQueueItem> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut SyncQueueItem> {
        self.items.iter_mut()
    }

    /// Items by priority (highest first), then enqueue order.
    pub fn ordered(&self) -> Vec<&SyncQueueItem> {
        let mut items: Vec<&SyncQueueItem> = self.items.iter().collect();
        items.sort_by_key(|item| (Reverse(item.priority), item.seq));
        items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
