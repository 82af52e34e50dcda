use parking_lot::{Mutex, ReentrantMutex};
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Per-path reentrant locks.
///
/// Handles are created on first use and dropped from the registry once no
/// caller holds them, so the table only grows with the number of paths that
/// are locked at the same time.
#[derive(Debug, Default)]
pub struct PathSynchronizer {
    handles: Mutex<HashMap<String, Weak<ReentrantMutex<()>>>>,
}

impl PathSynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `body` while holding the lock for `key`. The same thread may
    /// re-enter the lock for a key it already holds.
    pub fn with_lock<R>(&self, key: &str, body: impl FnOnce() -> R) -> R {
        let handle = self.handle_for(key);
        let outcome = {
            let _guard = handle.lock();
            body()
        };
        drop(handle);
        self.prune(key);
        outcome
    }

    /// Number of lock handles currently referenced by some caller.
    pub fn len(&self) -> usize {
        self.handles
            .lock()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn handle_for(&self, key: &str) -> Arc<ReentrantMutex<()>> {
        let mut handles = self.handles.lock();
        if let Some(existing) = handles.get(key).and_then(Weak::upgrade) {
            return existing;
        }
        let handle = Arc::new(ReentrantMutex::new(()));
        handles.insert(key.to_string(), Arc::downgrade(&handle));
        handle
    }

    fn prune(&self, key: &str) {
        let mut handles = self.handles.lock();
        if handles.get(key).is_some_and(|weak| weak.strong_count() == 0) {
            handles.remove(key);
        }
    }
}
