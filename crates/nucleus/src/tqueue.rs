//! Ordered timer queues.
//!
//! One queue exists per (clock, CPU). Entries sort by date ascending, then
//! priority descending, then insertion order, so timers sharing a date and
//! priority fire first-in first-out. Two backing structures implement
//! [`TimerQueue`] with the same contract: a sorted vector ([`ListQueue`],
//! cheap for short queues and allocation-free once reserved) and a
//! `BTreeMap` ([`TreeQueue`]). The `tree-queue` feature selects the tree as
//! [`DefaultQueue`].

use alloc::collections::{BTreeMap, TryReserveError};
use alloc::vec::Vec;
use core::cmp::Ordering;

use crate::timer::TimerId;

/// Position of an entry in a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueKey {
    pub date: u64,
    pub prio: i32,
    pub seq: u64,
}

impl Ord for QueueKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.date
            .cmp(&other.date)
            .then_with(|| other.prio.cmp(&self.prio))
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for QueueKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub trait TimerQueue {
    /// Creates a queue with room for `capacity` entries where the backing
    /// structure supports reservation.
    fn with_capacity(capacity: usize) -> Result<Self, TryReserveError>
    where
        Self: Sized;

    fn insert(&mut self, date: u64, prio: i32, timer: TimerId) -> QueueKey;
    fn remove(&mut self, key: &QueueKey) -> Option<TimerId>;
    fn head(&self) -> Option<(QueueKey, TimerId)>;
    fn second(&self) -> Option<(QueueKey, TimerId)>;
    fn iter(&self) -> impl Iterator<Item = (QueueKey, TimerId)> + '_;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Sorted vector queue.
#[derive(Debug, Default)]
pub struct ListQueue {
    entries: Vec<(QueueKey, TimerId)>,
    seq: u64,
}

impl ListQueue {
    fn position(&self, key: &QueueKey) -> Result<usize, usize> {
        self.entries.binary_search_by(|(k, _)| k.cmp(key))
    }
}

impl TimerQueue for ListQueue {
    fn with_capacity(capacity: usize) -> Result<Self, TryReserveError> {
        let mut entries = Vec::new();
        entries.try_reserve_exact(capacity)?;
        Ok(Self { entries, seq: 0 })
    }

    fn insert(&mut self, date: u64, prio: i32, timer: TimerId) -> QueueKey {
        let key = QueueKey {
            date,
            prio,
            seq: self.seq,
        };
        self.seq += 1;
        let at = self.entries.partition_point(|(k, _)| *k < key);
        self.entries.insert(at, (key, timer));
        key
    }

    fn remove(&mut self, key: &QueueKey) -> Option<TimerId> {
        let at = self.position(key).ok()?;
        Some(self.entries.remove(at).1)
    }

    fn head(&self) -> Option<(QueueKey, TimerId)> {
        self.entries.first().copied()
    }

    fn second(&self) -> Option<(QueueKey, TimerId)> {
        self.entries.get(1).copied()
    }

    fn iter(&self) -> impl Iterator<Item = (QueueKey, TimerId)> + '_ {
        self.entries.iter().copied()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Balanced tree queue.
#[derive(Debug, Default)]
pub struct TreeQueue {
    entries: BTreeMap<QueueKey, TimerId>,
    seq: u64,
}

impl TimerQueue for TreeQueue {
    fn with_capacity(_capacity: usize) -> Result<Self, TryReserveError> {
        Ok(Self::default())
    }

    fn insert(&mut self, date: u64, prio: i32, timer: TimerId) -> QueueKey {
        let key = QueueKey {
            date,
            prio,
            seq: self.seq,
        };
        self.seq += 1;
        self.entries.insert(key, timer);
        key
    }

    fn remove(&mut self, key: &QueueKey) -> Option<TimerId> {
        self.entries.remove(key)
    }

    fn head(&self) -> Option<(QueueKey, TimerId)> {
        self.entries.first_key_value().map(|(k, t)| (*k, *t))
    }

    fn second(&self) -> Option<(QueueKey, TimerId)> {
        self.entries.iter().nth(1).map(|(k, t)| (*k, *t))
    }

    fn iter(&self) -> impl Iterator<Item = (QueueKey, TimerId)> + '_ {
        self.entries.iter().map(|(k, t)| (*k, *t))
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(not(feature = "tree-queue"))]
pub type DefaultQueue = ListQueue;
#[cfg(feature = "tree-queue")]
pub type DefaultQueue = TreeQueue;

#[cfg(test)]
mod tests {
    use super::*;

    fn ordering_contract<Q: TimerQueue>() {
        let mut q = Q::with_capacity(8).unwrap();
        let late = q.insert(300, 0, TimerId(1));
        q.insert(100, 0, TimerId(2));
        q.insert(100, 5, TimerId(3));
        q.insert(100, 0, TimerId(4));

        let order: Vec<TimerId> = q.iter().map(|(_, t)| t).collect();
        assert_eq!(order, vec![TimerId(3), TimerId(2), TimerId(4), TimerId(1)]);
        assert_eq!(q.head().map(|(_, t)| t), Some(TimerId(3)));
        assert_eq!(q.second().map(|(_, t)| t), Some(TimerId(2)));

        assert_eq!(q.remove(&late), Some(TimerId(1)));
        assert_eq!(q.remove(&late), None);
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn list_queue_orders_by_date_then_priority() {
        ordering_contract::<ListQueue>();
    }

    #[test]
    fn tree_queue_orders_by_date_then_priority() {
        ordering_contract::<TreeQueue>();
    }

    #[test]
    fn empty_queue() {
        let q = ListQueue::with_capacity(0).unwrap();
        assert!(q.is_empty());
        assert!(q.head().is_none());
        assert!(q.second().is_none());
    }
}
