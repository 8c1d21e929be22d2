//! Load futures.
//!
//! A [`LoadFuture`] is either already settled (a cache hit) or waits on the
//! outcome of the batch its key was queued in. The first poll of a waiting
//! future asks the scope to flush that batch; the flush itself is deferred
//! until every load issued in the same step has joined the batch.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::cache::Outcome;
use crate::error::{LoadError, Result};
use crate::loader::scope::ScopeInner;
use crate::loader::{EntityType, Key, Value};

pub(crate) struct FlushTrigger<K: Key, V: Value> {
    pub(crate) scope: Arc<ScopeInner<K, V>>,
    pub(crate) batch_id: u64,
}

enum LoadState<K: Key, V: Value> {
    Ready(Option<Outcome<V>>),
    Waiting {
        rx: oneshot::Receiver<Outcome<V>>,
        trigger: Option<FlushTrigger<K, V>>,
    },
}

// == Load Future ==
/// Eventual value or error of one `load()`.
#[must_use = "a load is only flushed once its future is polled"]
pub struct LoadFuture<K: Key, V: Value> {
    entity_type: EntityType,
    state: LoadState<K, V>,
}

impl<K: Key, V: Value> LoadFuture<K, V> {
    pub(crate) fn ready(entity_type: EntityType, outcome: Outcome<V>) -> Self {
        Self {
            entity_type,
            state: LoadState::Ready(Some(outcome)),
        }
    }

    pub(crate) fn waiting(
        entity_type: EntityType,
        rx: oneshot::Receiver<Outcome<V>>,
        trigger: Option<FlushTrigger<K, V>>,
    ) -> Self {
        Self {
            entity_type,
            state: LoadState::Waiting { rx, trigger },
        }
    }

    /// True for futures that were answered from the cache.
    pub fn is_ready(&self) -> bool {
        matches!(self.state, LoadState::Ready(Some(_)))
    }

    pub fn entity_type(&self) -> &EntityType {
        &self.entity_type
    }
}

impl<K: Key, V: Value> Unpin for LoadFuture<K, V> {}

impl<K: Key, V: Value> Future for LoadFuture<K, V> {
    type Output = Result<Arc<V>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            LoadState::Ready(outcome) => Poll::Ready(outcome.take().unwrap_or_else(|| {
                Err(LoadError::Cancelled {
                    entity_type: this.entity_type.clone(),
                })
            })),
            LoadState::Waiting { rx, trigger } => {
                if let Some(trigger) = trigger.take() {
                    trigger
                        .scope
                        .schedule_flush(&this.entity_type, trigger.batch_id);
                }
                match Pin::new(rx).poll(cx) {
                    Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
                    // Sender dropped without an answer: the scope went away
                    Poll::Ready(Err(_)) => Poll::Ready(Err(LoadError::Cancelled {
                        entity_type: this.entity_type.clone(),
                    })),
                    Poll::Pending => Poll::Pending,
                }
            }
        }
    }
}
