use std::fmt::Debug;
use std::hash::Hash;

use crate::error::ClassificationError;

/// A located item the search engine can test and cache.
pub trait Entity: Clone + Send + Sync + Debug + 'static {
    type Member: Clone + Send + Sync + Debug + Eq + Hash + 'static;

    /// Identity used to group collected members.
    fn key(&self) -> &str;

    fn members(&self) -> &[Self::Member];

    /// Where the entity sits relative to the class path element holding it,
    /// e.g. `org/example/Foo.class`. `None` when the type has no such layout.
    fn relative_path(&self) -> Option<String> {
        None
    }
}

/// Turns raw bytes into an entity. Must be deterministic for identical bytes.
pub trait EntityClassifier: Send + Sync {
    type Entity: Entity;

    fn classify(&self, bytes: &[u8], declared_path: &str) -> Result<Self::Entity, ClassificationError>;
}
