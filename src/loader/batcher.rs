//! Key Batcher Module
//!
//! Accumulates the keys requested within a scope into at most one open batch
//! per entity type. A batch moves through `EMPTY -> OPEN -> FLUSHING`; once it
//! is taken for flushing a fresh batch starts collecting new keys.

use std::collections::{HashMap, HashSet};

use crate::loader::{EntityType, Key};

// == Batch ==
/// Deduplicated, ordered keys handed to exactly one fetcher invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch<K> {
    pub id: u64,
    pub entity_type: EntityType,
    pub keys: Vec<K>,
}

impl<K> Batch<K> {
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

// == Batch State ==
/// Observable state of the batch slot of one entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Empty,
    Open { batch_id: u64, len: usize, flush_scheduled: bool },
}

// == Enqueue Result ==
#[derive(Debug)]
pub enum Enqueued<K> {
    /// The key sits in the open batch with this id
    Queued { batch_id: u64 },
    /// The key filled the batch to `max_batch_size`; it must be flushed now
    Full(Batch<K>),
}

#[derive(Debug)]
struct OpenBatch<K> {
    id: u64,
    keys: Vec<K>,
    members: HashSet<K>,
    flush_scheduled: bool,
}

// == Key Batcher ==
#[derive(Debug)]
pub struct KeyBatcher<K: Key> {
    open: HashMap<EntityType, OpenBatch<K>>,
    max_batch_size: usize,
    next_id: u64,
}

impl<K: Key> KeyBatcher<K> {
    pub fn new(max_batch_size: usize) -> Self {
        Self {
            open: HashMap::new(),
            max_batch_size: max_batch_size.max(1),
            next_id: 1,
        }
    }

    // == Enqueue ==
    /// Adds a key to the open batch of its entity type, opening one if needed.
    ///
    /// A key already present is not appended again.
    pub fn enqueue(&mut self, entity_type: &EntityType, key: K) -> Enqueued<K> {
        let next_id = &mut self.next_id;
        let batch = self.open.entry(entity_type.clone()).or_insert_with(|| {
            let id = *next_id;
            *next_id += 1;
            OpenBatch {
                id,
                keys: Vec::new(),
                members: HashSet::new(),
                flush_scheduled: false,
            }
        });

        if batch.members.insert(key.clone()) {
            batch.keys.push(key);
        }
        let batch_id = batch.id;
        let is_full = batch.keys.len() >= self.max_batch_size;

        if is_full {
            if let Some(full) = self.take_open(entity_type) {
                return Enqueued::Full(full);
            }
        }
        Enqueued::Queued { batch_id }
    }

    // == Schedule ==
    /// Marks the batch as having a flush scheduled.
    ///
    /// Returns true only for the call that made the transition, so exactly
    /// one flush task is spawned per batch.
    pub fn mark_scheduled(&mut self, entity_type: &EntityType, batch_id: u64) -> bool {
        match self.open.get_mut(entity_type) {
            Some(batch) if batch.id == batch_id && !batch.flush_scheduled => {
                batch.flush_scheduled = true;
                true
            }
            _ => false,
        }
    }

    // == Take ==
    /// Removes the open batch if it is still the one with `batch_id`.
    ///
    /// Returns None if that batch was already taken, e.g. because it filled up.
    pub fn take(&mut self, entity_type: &EntityType, batch_id: u64) -> Option<Batch<K>> {
        match self.open.get(entity_type) {
            Some(batch) if batch.id == batch_id => self.take_open(entity_type),
            _ => None,
        }
    }

    fn take_open(&mut self, entity_type: &EntityType) -> Option<Batch<K>> {
        self.open.remove(entity_type).map(|batch| Batch {
            id: batch.id,
            entity_type: entity_type.clone(),
            keys: batch.keys,
        })
    }

    /// Returns true if `batch_id` is the open (not yet flushing) batch.
    pub fn is_open(&self, entity_type: &EntityType, batch_id: u64) -> bool {
        self.open
            .get(entity_type)
            .map(|batch| batch.id == batch_id)
            .unwrap_or(false)
    }

    pub fn state(&self, entity_type: &EntityType) -> BatchState {
        match self.open.get(entity_type) {
            Some(batch) => BatchState::Open {
                batch_id: batch.id,
                len: batch.keys.len(),
                flush_scheduled: batch.flush_scheduled,
            },
            None => BatchState::Empty,
        }
    }

    /// Drops every open batch, returning how many keys they held.
    pub fn clear(&mut self) -> usize {
        let keys = self.open.values().map(|batch| batch.keys.len()).sum();
        self.open.clear();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> EntityType {
        EntityType::from("User")
    }

    fn queued_id(enqueued: Enqueued<u64>) -> u64 {
        match enqueued {
            Enqueued::Queued { batch_id } => batch_id,
            Enqueued::Full(batch) => panic!("unexpected full batch {:?}", batch),
        }
    }

    #[test]
    fn test_first_key_opens_batch() {
        let mut batcher = KeyBatcher::new(10);
        assert_eq!(batcher.state(&user()), BatchState::Empty);

        let id = queued_id(batcher.enqueue(&user(), 1));

        assert_eq!(
            batcher.state(&user()),
            BatchState::Open {
                batch_id: id,
                len: 1,
                flush_scheduled: false
            }
        );
    }

    #[test]
    fn test_duplicate_keys_are_not_appended() {
        let mut batcher = KeyBatcher::new(10);

        let a = queued_id(batcher.enqueue(&user(), 1));
        let b = queued_id(batcher.enqueue(&user(), 1));
        queued_id(batcher.enqueue(&user(), 2));

        assert_eq!(a, b);
        let batch = batcher.take(&user(), a).unwrap();
        assert_eq!(batch.keys, vec![1, 2]);
    }

    #[test]
    fn test_entity_types_batch_separately() {
        let mut batcher = KeyBatcher::new(10);

        let users = queued_id(batcher.enqueue(&user(), 1));
        let posts = queued_id(batcher.enqueue(&EntityType::from("Post"), 1));

        assert_ne!(users, posts);
        assert_eq!(batcher.take(&user(), users).unwrap().keys, vec![1]);
        assert!(batcher.is_open(&EntityType::from("Post"), posts));
    }

    #[test]
    fn test_full_batch_is_returned_immediately() {
        let mut batcher = KeyBatcher::new(2);

        queued_id(batcher.enqueue(&user(), 1));
        match batcher.enqueue(&user(), 2) {
            Enqueued::Full(batch) => assert_eq!(batch.keys, vec![1, 2]),
            other => panic!("expected full batch, got {:?}", other),
        }

        // The next key opens a fresh batch
        assert_eq!(batcher.state(&user()), BatchState::Empty);
        let id = queued_id(batcher.enqueue(&user(), 3));
        assert!(batcher.is_open(&user(), id));
    }

    #[test]
    fn test_take_after_flush_opens_fresh_batch() {
        let mut batcher = KeyBatcher::new(10);

        let first = queued_id(batcher.enqueue(&user(), 1));
        let batch = batcher.take(&user(), first).unwrap();
        assert_eq!(batch.id, first);

        let second = queued_id(batcher.enqueue(&user(), 2));
        assert_ne!(first, second);
        assert!(batcher.take(&user(), first).is_none());
        assert_eq!(batcher.take(&user(), second).unwrap().keys, vec![2]);
    }

    #[test]
    fn test_mark_scheduled_only_once() {
        let mut batcher = KeyBatcher::new(10);
        let id = queued_id(batcher.enqueue(&user(), 1));

        assert!(batcher.mark_scheduled(&user(), id));
        assert!(!batcher.mark_scheduled(&user(), id));
        assert!(!batcher.mark_scheduled(&user(), id + 100));
    }

    #[test]
    fn test_clear_counts_keys() {
        let mut batcher = KeyBatcher::new(10);
        batcher.enqueue(&user(), 1);
        batcher.enqueue(&user(), 2);
        batcher.enqueue(&EntityType::from("Post"), 7);

        assert_eq!(batcher.clear(), 3);
        assert_eq!(batcher.state(&user()), BatchState::Empty);
    }
}
