//! A single-threaded, cooperative event queue keyed by [`VirtualTime`].
//!
//! Targets are small `Copy` keys (a track, a cleanup job, a relay timer)
//! rather than callbacks, so the queue never owns the things it wakes up.
//! [`Scheduler::tick`] hands each due key to a closure supplied by the
//! owner of the targets, and a periodic entry is re-armed with whatever
//! time that closure returns. Returning `None` ends the series, which is
//! also how a vanished target gets silently dropped.

use crate::clock::VirtualTime;
use log::warn;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::hash::Hash;

/// Position of an entry in the queue: due time first, insertion order second.
#[derive(Debug, Clone, Copy)]
struct DueKey {
    at: VirtualTime,
    seq: u64,
}

impl PartialEq for DueKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for DueKey {}

impl PartialOrd for DueKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DueKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.at
            .total_cmp(&other.at)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

#[derive(Debug, Clone, Copy)]
struct Pending<K> {
    target: K,
    periodic: bool,
}

/// Pending events, at most one per target.
#[derive(Debug)]
pub struct Scheduler<K> {
    queue: BTreeMap<DueKey, Pending<K>>,
    index: HashMap<K, DueKey>,
    next_seq: u64,
}

impl<K> Default for Scheduler<K>
where
    K: Copy + Eq + Hash + Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Scheduler<K>
where
    K: Copy + Eq + Hash + Debug,
{
    /// An empty queue.
    pub fn new() -> Self {
        Self {
            queue: BTreeMap::new(),
            index: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Registers `target` to fire at `at`. Any entry already pending for the
    /// same target is replaced.
    pub fn schedule(&mut self, target: K, at: VirtualTime, periodic: bool) {
        self.cancel(target);

        let key = DueKey {
            at,
            seq: self.next_seq,
        };
        self.next_seq += 1;

        self.queue.insert(key, Pending { target, periodic });
        self.index.insert(target, key);
    }

    /// Removes the pending entry for `target`, returning whether there was one.
    pub fn cancel(&mut self, target: K) -> bool {
        match self.index.remove(&target) {
            Some(key) => {
                self.queue.remove(&key);
                true
            }
            None => false,
        }
    }

    /// Drops every pending entry.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.index.clear();
    }

    /// When `target` is due, if it is pending at all.
    pub fn due_at(&self, target: K) -> Option<VirtualTime> {
        self.index.get(&target).map(|key| key.at)
    }

    /// The earliest pending due time.
    pub fn next_due(&self) -> Option<VirtualTime> {
        self.queue.keys().next().map(|key| key.at)
    }

    /// Number of pending entries.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Fires every entry due at or before `now`, in ascending due time with
    /// ties broken by insertion order. `fire` receives the target and the
    /// time it was due (not `now`), so periodic targets can derive their
    /// next boundary without accumulating lateness. For periodic entries a
    /// returned time strictly later than the due time re-arms the target;
    /// anything else retires it.
    ///
    /// Returns how many entries fired.
    pub fn tick<F>(&mut self, now: VirtualTime, mut fire: F) -> usize
    where
        F: FnMut(K, VirtualTime) -> Option<VirtualTime>,
    {
        let mut fired = 0;

        loop {
            match self.queue.first_key_value() {
                Some((key, _)) if key.at <= now => {}
                _ => break,
            }
            let Some((key, pending)) = self.queue.pop_first() else {
                break;
            };
            self.index.remove(&pending.target);
            fired += 1;

            let next = fire(pending.target, key.at);
            if !pending.periodic {
                continue;
            }
            match next {
                Some(next) if next > key.at => self.schedule(pending.target, next, true),
                Some(next) => warn!(
                    "Scheduler : {:?} asked to re-arm at {next}, not after {}; retiring it.",
                    pending.target, key.at
                ),
                None => {}
            }
        }

        fired
    }
}
