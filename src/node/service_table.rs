//! Per-(peer, type) transfer-ID slots for outstanding service requests.
//!
//! Each key owns 32 slots tracked by a bitmask (a set bit marks a free
//! slot). A claimed slot records its claim timestamp and owns the
//! continuation to be resolved. Exhaustion of a key's slots is the
//! designed-for overload signal; a claimed slot that never resolves is
//! reclaimed by the expiry sweep, which fires the continuation's timeout
//! path instead.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::{ModlinkError, Result};
use crate::node::continuation::{Continuation, Task};

/// Number of concurrently outstanding transfer IDs per key.
pub(crate) const SLOTS_PER_KEY: usize = 32;

struct Entry {
    /// Bit set means the slot is free.
    occupations: u32,
    timestamps: [Option<Instant>; SLOTS_PER_KEY],
    continuations: [Option<Arc<dyn Continuation>>; SLOTS_PER_KEY],
}

impl Entry {
    fn new() -> Self {
        Self {
            occupations: u32::MAX,
            timestamps: [None; SLOTS_PER_KEY],
            continuations: std::array::from_fn(|_| None),
        }
    }
}

pub(crate) struct ServiceTable {
    size: usize,
    state: Mutex<HashMap<u16, Entry>>,
    expiry: Duration,
}

impl ServiceTable {
    pub(crate) fn new(size: usize, expiry: Duration) -> Self {
        Self {
            size,
            state: Mutex::new(HashMap::new()),
            expiry,
        }
    }

    /// Claim a transfer ID under `key`, storing the claim timestamp and
    /// the continuation. Fails with the backoff signal when all 32 slots
    /// are occupied. Thread-safe.
    pub(crate) fn claim(
        &self,
        key: u16,
        timestamp: Instant,
        continuation: Arc<dyn Continuation>,
    ) -> Result<u8> {
        debug_assert!((key as usize) < self.size, "invalid key");
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let entry = state.entry(key).or_insert_with(Entry::new);
        let id = entry.occupations.leading_zeros() as usize;
        if id == SLOTS_PER_KEY {
            return Err(ModlinkError::Backoff);
        }
        entry.occupations &= !(1 << (31 - id));
        entry.timestamps[id] = Some(timestamp);
        entry.continuations[id] = Some(continuation);
        Ok(id as u8)
    }

    /// Release a transfer ID, returning its continuation. Fails when the
    /// slot is not claimed. Thread-safe.
    pub(crate) fn release(&self, key: u16, id: u8) -> Result<Arc<dyn Continuation>> {
        debug_assert!((key as usize) < self.size, "invalid key");
        let id = id as usize;
        if id >= SLOTS_PER_KEY {
            return Err(ModlinkError::Unclaimed);
        }
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let entry = state.entry(key).or_insert_with(Entry::new);
        let mask = 1 << (31 - id);
        if entry.occupations & mask != 0 {
            return Err(ModlinkError::Unclaimed);
        }
        let continuation = entry.continuations[id].take();
        entry.occupations |= mask;
        entry.timestamps[id] = None;
        continuation.ok_or(ModlinkError::Unclaimed)
    }

    /// Reclaim every slot older than the expiry, handing each
    /// continuation's timeout task to `spawn`. Returns the number of
    /// reclaimed slots. Thread-safe.
    pub(crate) fn abort_expired(&self, spawn: impl Fn(Task)) -> usize {
        let mut accumulator = 0;
        let now = Instant::now();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        for entry in state.values_mut() {
            if entry.occupations == u32::MAX {
                continue;
            }
            for id in 0..SLOTS_PER_KEY {
                let mask = 1 << (31 - id);
                if entry.occupations & mask != 0 {
                    continue;
                }
                let expired = entry.timestamps[id]
                    .map(|timestamp| now.duration_since(timestamp) > self.expiry)
                    .unwrap_or(false);
                if !expired {
                    continue;
                }
                let continuation = entry.continuations[id].take();
                entry.occupations |= mask;
                entry.timestamps[id] = None;
                if let Some(continuation) = continuation {
                    if let Some(task) = continuation.timeout() {
                        spawn(task);
                    }
                }
                accumulator += 1;
            }
        }
        accumulator
    }

    /// Number of currently claimed slots across all keys. Thread-safe.
    pub(crate) fn occupancy_count(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .values()
            .map(|entry| entry.occupations.count_zeros() as usize)
            .sum()
    }
}
