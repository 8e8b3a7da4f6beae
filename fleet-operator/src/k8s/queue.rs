//! Pass bookkeeping of the controller.
//!
//! At most one pass per object runs at any time. Work arriving for an object with a pass in flight
//! is folded into a single pending flag, which starts a new pass once the running one is done.
//! Delayed re-enqueues are stamped with a token, and only the most recently scheduled one for an
//! object is honored.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// The key of an object handled by the controller.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Key {
    Pool(Arc<String>),
    Machine(Arc<String>),
}

#[derive(Default)]
pub struct WorkQueue {
    in_flight: HashSet<Key>,
    pending: HashSet<Key>,
    schedule_tokens: HashMap<Key, u64>,
    next_token: u64,
}

impl WorkQueue {
    /// Request a pass over the given object, returning true if it should be started now.
    pub fn enqueue(&mut self, key: &Key) -> bool {
        if self.in_flight.contains(key) {
            self.pending.insert(key.clone());
            return false;
        }
        // Any delayed re-enqueue is superseded by this pass.
        self.schedule_tokens.remove(key);
        self.in_flight.insert(key.clone());
        true
    }

    /// Mark the pass over the given object as done, returning true if another pass should be
    /// started right away.
    pub fn finish(&mut self, key: &Key) -> bool {
        self.in_flight.remove(key);
        if self.pending.remove(key) {
            self.schedule_tokens.remove(key);
            self.in_flight.insert(key.clone());
            return true;
        }
        false
    }

    /// Record a delayed re-enqueue of the given object, returning its token.
    pub fn schedule(&mut self, key: &Key) -> u64 {
        self.next_token += 1;
        self.schedule_tokens.insert(key.clone(), self.next_token);
        self.next_token
    }

    /// Check if the given token is the latest scheduled for the given object, consuming it if so.
    pub fn take_scheduled(&mut self, key: &Key, token: u64) -> bool {
        match self.schedule_tokens.get(key) {
            Some(current) if *current == token => {
                self.schedule_tokens.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Forget all state of the given object.
    pub fn forget(&mut self, key: &Key) {
        self.pending.remove(key);
        self.schedule_tokens.remove(key);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}
