//! Short-lived cache of recently relayed transactions.
//!
//! Entries are shared handles; callers copy the handle out under the pool
//! lock and serialize without holding it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bchd_primitives::Transaction;

use crate::inv::Inv;

/// Seconds a relayed transaction stays fetchable.
const RELAY_EXPIRY_SECS: i64 = 15 * 60;

#[derive(Default)]
pub struct RelayPool {
    map: HashMap<Inv, Arc<Transaction>>,
    expiry: VecDeque<(i64, Inv)>,
}

impl RelayPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, inv: Inv, tx: Arc<Transaction>, now: i64) {
        self.expire(now);
        if self.map.insert(inv, tx).is_none() {
            self.expiry.push_back((now + RELAY_EXPIRY_SECS, inv));
        }
    }

    pub fn get(&self, inv: &Inv) -> Option<Arc<Transaction>> {
        self.map.get(inv).cloned()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn expire(&mut self, now: i64) {
        while let Some((deadline, inv)) = self.expiry.front().copied() {
            if deadline > now {
                break;
            }
            self.expiry.pop_front();
            self.map.remove(&inv);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inv::MSG_TX;

    fn tx() -> Arc<Transaction> {
        Arc::new(Transaction {
            version: 1,
            inputs: Vec::new(),
            outputs: Vec::new(),
            lock_time: 0,
        })
    }

    #[test]
    fn entries_expire() {
        let mut pool = RelayPool::new();
        let inv = Inv::new(MSG_TX, [9u8; 32]);
        pool.insert(inv, tx(), 1_000);
        assert!(pool.get(&inv).is_some());
        pool.expire(1_000 + RELAY_EXPIRY_SECS - 1);
        assert!(pool.get(&inv).is_some());
        pool.expire(1_000 + RELAY_EXPIRY_SECS);
        assert!(pool.get(&inv).is_none());
    }
}
