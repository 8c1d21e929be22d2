//! Keys and entity types.

use std::borrow::Borrow;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

// == Key Trait ==
/// Bounds every lookup key must satisfy: hashable for dedup, cloneable into
/// batches and displayable for error messages.
pub trait Key: Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static {}

impl<T> Key for T where T: Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static {}

/// Bounds on resolved values, which are shared between tasks as `Arc<V>`.
pub trait Value: Send + Sync + 'static {}

impl<T> Value for T where T: Send + Sync + 'static {}

// == Entity Type ==
/// Name of a kind of record ("User", "Post"), cheap to clone.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityType(Arc<str>);

impl EntityType {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", &*self.0)
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for EntityType {
    fn from(name: String) -> Self {
        Self(Arc::from(name))
    }
}

impl From<&EntityType> for EntityType {
    fn from(entity_type: &EntityType) -> Self {
        entity_type.clone()
    }
}

impl Borrow<str> for EntityType {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for EntityType {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// == Load Key ==
/// Identifies one lookup: a key within an entity type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LoadKey<K> {
    pub entity_type: EntityType,
    pub key: K,
}

impl<K> LoadKey<K> {
    pub fn new(entity_type: impl Into<EntityType>, key: K) -> Self {
        Self {
            entity_type: entity_type.into(),
            key,
        }
    }
}

impl<K: fmt::Display> fmt::Display for LoadKey<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.key)
    }
}
