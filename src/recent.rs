//! Bounded sets of recently handled store ids (FIFO eviction)
//!
//! One set per message class, shared by every path that can pull the same
//! record: in-band arrival, reconciliation and catch-up sync.

use crate::message::MessageClass;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

pub struct RecentIds {
    capacity: usize,
    order: VecDeque<i64>,
    members: HashSet<i64>,
}

impl RecentIds {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            members: HashSet::with_capacity(capacity),
        }
    }

    pub fn contains(&self, id: i64) -> bool {
        self.members.contains(&id)
    }

    /// Record `id`. Returns false if it was already present.
    pub fn insert(&mut self, id: i64) -> bool {
        if !self.members.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.members.remove(&evicted);
            }
        }
        true
    }
}

/// Per-class recently-handled ids, cheap to clone
#[derive(Clone)]
pub struct RecentRegistry {
    direct: Arc<Mutex<RecentIds>>,
    enveloped: Arc<Mutex<RecentIds>>,
}

impl RecentRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            direct: Arc::new(Mutex::new(RecentIds::new(capacity))),
            enveloped: Arc::new(Mutex::new(RecentIds::new(capacity))),
        }
    }

    fn set(&self, class: MessageClass) -> &Mutex<RecentIds> {
        match class {
            MessageClass::Direct => &self.direct,
            MessageClass::Enveloped => &self.enveloped,
        }
    }

    /// Claim `id` for handling. False if another path already did.
    pub fn insert(&self, class: MessageClass, id: i64) -> bool {
        self.set(class)
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id)
    }

    pub fn contains(&self, class: MessageClass, id: i64) -> bool {
        self.set(class)
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(id)
    }
}
