//! Path-keyed store of immutable content buffers.
//!
//! `get_or_compute` runs the supplier for a key at most once at a time:
//! concurrent callers for the same key park on the in-flight computation and
//! receive the same buffer, or the same failure. A failed computation leaves
//! the key empty so a later call can retry.

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::ThreadId;

use crate::error::{HuntError, Result};

pub type Content = Arc<[u8]>;

#[derive(Debug, Default)]
pub struct ContentCache {
    slots: Mutex<HashMap<String, Slot>>,
}

#[derive(Debug)]
enum Slot {
    Ready(Content),
    Pending(Arc<Pending>),
}

#[derive(Debug)]
struct Pending {
    owner: ThreadId,
    outcome: Mutex<Option<std::result::Result<Content, String>>>,
    done: Condvar,
}

impl Pending {
    fn new() -> Self {
        Self {
            owner: std::thread::current().id(),
            outcome: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    fn complete(&self, outcome: std::result::Result<Content, String>) {
        let mut slot = self.outcome.lock();
        if slot.is_none() {
            *slot = Some(outcome);
        }
        self.done.notify_all();
    }

    fn wait(&self) -> std::result::Result<Content, String> {
        let mut slot = self.outcome.lock();
        loop {
            if let Some(outcome) = slot.as_ref() {
                return outcome.clone();
            }
            self.done.wait(&mut slot);
        }
    }
}

// Releases waiters with an error if the supplier unwinds.
struct CompletionGuard<'a> {
    cache: &'a ContentCache,
    key: &'a str,
    pending: Arc<Pending>,
    finished: bool,
}

impl CompletionGuard<'_> {
    fn finish(mut self, outcome: &Result<Content>) {
        self.publish(outcome.as_ref().map(Arc::clone).map_err(|e| e.to_string()));
        self.finished = true;
    }

    fn publish(&self, outcome: std::result::Result<Content, String>) {
        {
            let mut slots = self.cache.slots.lock();
            let ours = matches!(
                slots.get(self.key),
                Some(Slot::Pending(p)) if Arc::ptr_eq(p, &self.pending)
            );
            if ours {
                match &outcome {
                    Ok(content) => {
                        slots.insert(self.key.to_string(), Slot::Ready(Arc::clone(content)));
                    }
                    Err(_) => {
                        slots.remove(self.key);
                    }
                }
            }
        }
        self.pending.complete(outcome);
    }
}

impl Drop for CompletionGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.publish(Err("content supplier panicked".to_string()));
        }
    }
}

impl ContentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Content> {
        match self.slots.lock().get(key) {
            Some(Slot::Ready(content)) => Some(Arc::clone(content)),
            _ => None,
        }
    }

    pub fn get_or_compute<F>(&self, key: &str, supplier: F) -> Result<Content>
    where
        F: FnOnce() -> Result<Content>,
    {
        let pending = {
            let mut slots = self.slots.lock();
            match slots.get(key) {
                Some(Slot::Ready(content)) => return Ok(Arc::clone(content)),
                Some(Slot::Pending(pending)) => {
                    let pending = Arc::clone(pending);
                    drop(slots);
                    return self.wait_for(key, &pending);
                }
                None => {
                    let pending = Arc::new(Pending::new());
                    slots.insert(key.to_string(), Slot::Pending(Arc::clone(&pending)));
                    pending
                }
            }
        };

        let guard = CompletionGuard {
            cache: self,
            key,
            pending,
            finished: false,
        };
        let outcome = supplier();
        guard.finish(&outcome);
        outcome.map_err(|err| match err {
            err @ HuntError::CacheComputation { .. } => err,
            other => HuntError::CacheComputation {
                key: key.to_string(),
                message: other.to_string(),
            },
        })
    }

    /// Stores `content` unless the key already holds a value, without ever
    /// blocking on an in-flight computation of the same key.
    pub fn put_if_absent(&self, key: &str, content: Content) -> Content {
        let mut slots = self.slots.lock();
        match slots.get(key) {
            Some(Slot::Ready(existing)) => Arc::clone(existing),
            Some(Slot::Pending(_)) => content,
            None => {
                slots.insert(key.to_string(), Slot::Ready(Arc::clone(&content)));
                content
            }
        }
    }

    pub fn remove(&self, key: &str) -> bool {
        self.slots.lock().remove(key).is_some()
    }

    /// Drops `prefix` and every key located inside it.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let prefix = prefix.trim_end_matches('/');
        let nested = format!("{prefix}/");
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|key, _| key != prefix && !key.starts_with(&nested));
        before - slots.len()
    }

    pub fn clear(&self) {
        self.slots.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn wait_for(&self, key: &str, pending: &Pending) -> Result<Content> {
        if pending.owner == std::thread::current().id() {
            return Err(HuntError::CacheComputation {
                key: key.to_string(),
                message: "recursive computation of the same key".to_string(),
            });
        }
        pending.wait().map_err(|message| HuntError::CacheComputation {
            key: key.to_string(),
            message,
        })
    }
}
