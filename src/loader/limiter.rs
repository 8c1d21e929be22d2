//! Concurrency Limiter Module
//!
//! Counting limiter bounding simultaneous fetcher invocations, globally and
//! per entity type. Permits are released on drop.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::loader::EntityType;

// == Limiter Permit ==
/// Slot held for the duration of one fetch call.
#[derive(Debug)]
pub struct LimiterPermit {
    _entity: Option<OwnedSemaphorePermit>,
    _global: Option<OwnedSemaphorePermit>,
}

// == Concurrency Limiter ==
#[derive(Debug, Default)]
pub struct ConcurrencyLimiter {
    global: Option<Arc<Semaphore>>,
    per_entity: HashMap<EntityType, Arc<Semaphore>>,
}

impl ConcurrencyLimiter {
    /// Creates a limiter. A limit of 0 means unbounded.
    pub fn new(max_concurrent: usize, per_entity: &HashMap<String, usize>) -> Self {
        let global = (max_concurrent > 0).then(|| Arc::new(Semaphore::new(max_concurrent)));
        let per_entity = per_entity
            .iter()
            .filter(|(_, limit)| **limit > 0)
            .map(|(name, limit)| (EntityType::from(name.as_str()), Arc::new(Semaphore::new(*limit))))
            .collect();

        Self { global, per_entity }
    }

    /// A limiter that never blocks.
    pub fn unbounded() -> Self {
        Self::default()
    }

    // == Acquire ==
    /// Waits until both the entity type's slot and a global slot are free.
    ///
    /// The entity slot is taken first so that a fetch blocked on its own
    /// entity type never sits on a global slot.
    pub async fn acquire(&self, entity_type: &EntityType) -> LimiterPermit {
        let entity = match self.per_entity.get(entity_type) {
            Some(semaphore) => semaphore.clone().acquire_owned().await.ok(),
            None => None,
        };
        let global = match &self.global {
            Some(semaphore) => semaphore.clone().acquire_owned().await.ok(),
            None => None,
        };
        debug!(entity_type = %entity_type, "acquired fetch slot");

        LimiterPermit {
            _entity: entity,
            _global: global,
        }
    }

    /// Free global slots, None if unbounded.
    pub fn available_global(&self) -> Option<usize> {
        self.global.as_ref().map(|s| s.available_permits())
    }

    /// Free slots for an entity type, None if it has no dedicated bound.
    pub fn available_for(&self, entity_type: &EntityType) -> Option<usize> {
        self.per_entity
            .get(entity_type)
            .map(|s| s.available_permits())
    }
}
