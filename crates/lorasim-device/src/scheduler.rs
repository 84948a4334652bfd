//! ---
//! sim_section: "02-device-model"
//! sim_subsection: "module"
//! sim_type: "source"
//! sim_scope: "code"
//! sim_description: "Min-heap of device due times driven by simulated time."
//! sim_version: "v0.1.0"
//! sim_owner: "tbd"
//! ---
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Entry {
    due: DateTime<Utc>,
    device_id: String,
    generation: u64,
}

/// Decides which devices fire on a tick.
///
/// Ordering is by due time, then device id. Removing or rescheduling a device
/// bumps its generation; heap entries with an older generation are dropped
/// when they surface.
#[derive(Debug, Default)]
pub struct Scheduler {
    queue: BinaryHeap<Reverse<Entry>>,
    live: HashMap<String, u64>,
    next_generation: u64,
    paused: bool,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `device_id` at `due`, replacing any earlier schedule.
    pub fn schedule(&mut self, device_id: &str, due: DateTime<Utc>) {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.live.insert(device_id.to_owned(), generation);
        self.queue.push(Reverse(Entry {
            due,
            device_id: device_id.to_owned(),
            generation,
        }));
    }

    /// Register a device so that it is first due one interval after `now`.
    pub fn add(&mut self, device_id: &str, now: DateTime<Utc>, interval: Duration) {
        self.schedule(device_id, due_after(now, interval));
    }

    /// Reschedule after a fire. Due times never lag behind `now`, so a late
    /// tick does not cause a burst of catch-up fires.
    pub fn reschedule(&mut self, device_id: &str, now: DateTime<Utc>, interval: Duration) {
        if self.live.contains_key(device_id) {
            self.schedule(device_id, due_after(now, interval));
        }
    }

    pub fn remove(&mut self, device_id: &str) -> bool {
        self.live.remove(device_id).is_some()
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.live.contains_key(device_id)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Remove and return every device due at or before `now`, earliest first.
    /// Returns nothing while paused; the schedule itself is kept.
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let mut fired = Vec::new();
        if self.paused {
            return fired;
        }
        while let Some(Reverse(entry)) = self.queue.peek() {
            if !self.is_current(entry) {
                self.queue.pop();
                continue;
            }
            if entry.due > now {
                break;
            }
            if let Some(Reverse(entry)) = self.queue.pop() {
                fired.push(entry.device_id);
            }
        }
        fired
    }

    /// Earliest pending due time, `None` when nothing is scheduled or paused.
    pub fn next_due(&mut self) -> Option<DateTime<Utc>> {
        if self.paused {
            return None;
        }
        while let Some(Reverse(entry)) = self.queue.peek() {
            if self.is_current(entry) {
                return Some(entry.due);
            }
            self.queue.pop();
        }
        None
    }

    fn is_current(&self, entry: &Entry) -> bool {
        self.live.get(&entry.device_id) == Some(&entry.generation)
    }
}

/// `now + interval`, saturating at the latest representable instant.
pub fn due_after(now: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(interval)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
