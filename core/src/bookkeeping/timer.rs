/// Cancelable timers on a caller-supplied millisecond clock
///
/// Nothing here reads the wall clock. The owner passes `now_ms` in, asks for the
/// next deadline, and pops whatever has expired, so tests advance time by
/// calling `pop_expired` with a larger value instead of sleeping.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

/// Handle of a scheduled timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

/// Deadline-ordered set of pending timers carrying a payload `K`
#[derive(Debug)]
pub struct TimerQueue<K> {
    next_id: u64,
    by_deadline: BTreeMap<(u64, TimerId), K>,
    deadlines: HashMap<TimerId, u64>,
}

impl<K> TimerQueue<K> {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            by_deadline: BTreeMap::new(),
            deadlines: HashMap::new(),
        }
    }

    /// Schedule `kind` to fire `delay` after `now_ms`
    pub fn schedule(&mut self, now_ms: u64, delay: Duration, kind: K) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        let deadline = now_ms.saturating_add(delay.as_millis() as u64);
        self.by_deadline.insert((deadline, id), kind);
        self.deadlines.insert(id, deadline);
        id
    }

    /// Cancel a timer; returns false if it already fired or was cancelled
    pub fn cancel(&mut self, id: TimerId) -> bool {
        match self.deadlines.remove(&id) {
            Some(deadline) => self.by_deadline.remove(&(deadline, id)).is_some(),
            None => false,
        }
    }

    /// Cancel every timer whose payload matches
    pub fn cancel_where<F: Fn(&K) -> bool>(&mut self, predicate: F) -> usize {
        let doomed: Vec<(u64, TimerId)> = self
            .by_deadline
            .iter()
            .filter(|(_, kind)| predicate(kind))
            .map(|(key, _)| *key)
            .collect();
        for key in &doomed {
            self.by_deadline.remove(key);
            self.deadlines.remove(&key.1);
        }
        doomed.len()
    }

    pub fn cancel_all(&mut self) {
        self.by_deadline.clear();
        self.deadlines.clear();
    }

    pub fn is_pending(&self, id: TimerId) -> bool {
        self.deadlines.contains_key(&id)
    }

    pub fn deadline(&self, id: TimerId) -> Option<u64> {
        self.deadlines.get(&id).copied()
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<u64> {
        self.by_deadline.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Remove and return every timer due at `now_ms`, earliest first
    pub fn pop_expired(&mut self, now_ms: u64) -> Vec<(TimerId, K)> {
        let mut fired = Vec::new();
        while let Some(entry) = self.by_deadline.first_entry() {
            if entry.key().0 > now_ms {
                break;
            }
            let ((_, id), kind) = entry.remove_entry();
            self.deadlines.remove(&id);
            fired.push((id, kind));
        }
        fired
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

impl<K> Default for TimerQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}
