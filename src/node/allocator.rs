//! Dynamic node ID allocation.
//!
//! Anonymous peers obtain a bus address through a three-round broadcast
//! exchange with the one designated allocator node: each round carries a
//! chunk of the peer's 16-byte unique identifier, and the allocator
//! echoes back everything collected so far to confirm receipt. After the
//! final round the allocator resolves the full identifier against its
//! allocation table and broadcasts the assigned ID. Rounds arriving after
//! an inactivity timeout reset the exchange.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Priority given to allocation broadcasts.
pub(crate) const ALLOCATION_PRIORITY: u8 = 20;

/// Highest dynamically assignable node ID.
const MAX_DYNAMIC_ID: u8 = 125;

/// A peer's 16-byte unique hardware identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UniqueId(pub [u8; 16]);

impl fmt::Display for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, byte) in self.0.iter().enumerate() {
            if matches!(index, 4 | 6 | 8 | 10) {
                write!(f, "-")?;
            }
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Reply broadcast produced by an allocation round.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AllocationReply {
    payload: [u8; 17],
    length: usize,
}

impl AllocationReply {
    pub(crate) fn as_slice(&self) -> &[u8] {
        &self.payload[..self.length]
    }
}

struct AllocationTable {
    // The identifier may be absent for IDs claimed without one.
    map: HashMap<u8, Option<UniqueId>>,
}

impl AllocationTable {
    fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    fn allocate(&mut self, node_id: u8, unique_id: UniqueId) {
        debug_assert!((1..=127).contains(&node_id), "invalid node ID");
        debug_assert!(!self.map.contains_key(&node_id), "node ID already allocated");
        self.map.insert(node_id, Some(unique_id));
    }

    fn node_id(&self, unique_id: &UniqueId) -> u8 {
        for (&node_id, allocated) in &self.map {
            if allocated.as_ref() == Some(unique_id) {
                return node_id; // Allocated.
            }
        }
        0 // Unallocated.
    }

    fn is_allocated(&self, node_id: u8) -> bool {
        self.map.contains_key(&node_id)
    }
}

struct ExchangeState {
    table: AllocationTable,
    /// 1-byte header plus the 16-byte identifier collected so far.
    exchange: [u8; 17],
    cursor: usize,
    timestamp: Option<Instant>,
}

pub(crate) struct Allocator {
    state: Mutex<ExchangeState>,
    timeout: Duration,
}

impl Allocator {
    pub(crate) fn new(timeout: Duration) -> Self {
        Self {
            state: Mutex::new(ExchangeState {
                table: AllocationTable::new(),
                exchange: [0u8; 17],
                cursor: 0,
                timestamp: None,
            }),
            timeout,
        }
    }

    /// Process one allocation broadcast, returning the reply broadcast to
    /// send, if any.
    pub(crate) fn handle_message(
        &self,
        source_id: u8,
        payload: &[u8],
    ) -> Option<AllocationReply> {
        if source_id != 0 {
            tracing::warn!(source_id, "more than one allocator exists on this network");
            return None;
        }
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let elapsed = state
            .timestamp
            .map(|timestamp| now.duration_since(timestamp))
            .unwrap_or(Duration::MAX);
        if state.cursor > 0 && elapsed > self.timeout {
            tracing::info!("allocation timeout");
            state.cursor = 0;
        }
        let new_query = !payload.is_empty() && payload[0] & 0x01 != 0;
        if new_query && payload.len() == 7 {
            Some(Self::first_stage(&mut state, now, payload))
        } else if state.cursor == 7 && payload.len() == 7 {
            Some(Self::second_stage(&mut state, now, payload))
        } else if state.cursor == 13 && payload.len() == 5 {
            Self::final_stage(&mut state, now, payload)
        } else {
            tracing::warn!(length = payload.len(), "invalid allocation query");
            None
        }
    }

    fn first_stage(state: &mut ExchangeState, now: Instant, payload: &[u8]) -> AllocationReply {
        state.timestamp = Some(now);
        state.exchange[0] = 0; // Allocation incomplete.
        state.exchange[1..7].copy_from_slice(&payload[1..7]);
        state.cursor = 7;
        tracing::debug!("completed first allocation stage");
        AllocationReply {
            payload: state.exchange,
            length: state.cursor,
        }
    }

    fn second_stage(state: &mut ExchangeState, now: Instant, payload: &[u8]) -> AllocationReply {
        state.timestamp = Some(now);
        state.exchange[7..13].copy_from_slice(&payload[1..7]);
        state.cursor = 13;
        tracing::debug!("completed second allocation stage");
        AllocationReply {
            payload: state.exchange,
            length: state.cursor,
        }
    }

    fn final_stage(
        state: &mut ExchangeState,
        now: Instant,
        payload: &[u8],
    ) -> Option<AllocationReply> {
        state.timestamp = Some(now);
        state.exchange[13..17].copy_from_slice(&payload[1..5]);
        state.cursor = 17;
        let mut unique_id = [0u8; 16];
        unique_id.copy_from_slice(&state.exchange[1..17]);
        let unique_id = UniqueId(unique_id);
        let requested_id = (payload[0] & 0xFE) >> 1;
        tracing::info!(%unique_id, requested_id, "allocation query completed");
        let allocated_id = Self::allocate_id(&mut state.table, requested_id, unique_id);
        if allocated_id != 0 {
            tracing::info!(allocated_id, "allocatee given ID");
            state.exchange[0] = (allocated_id << 1) & 0xFE;
            let reply = AllocationReply {
                payload: state.exchange,
                length: state.cursor,
            };
            state.cursor = 0;
            tracing::debug!("completed final allocation stage");
            Some(reply)
        } else {
            tracing::error!("node ID exhaustion");
            None
        }
    }

    /// Resolve an identifier to a node ID: reuse a known identifier's ID,
    /// otherwise pick the highest unused ID, or the first unused ID at or
    /// above an explicit request.
    fn allocate_id(table: &mut AllocationTable, requested_id: u8, unique_id: UniqueId) -> u8 {
        let existing = table.node_id(&unique_id);
        if existing != 0 {
            return existing;
        }
        let mut id = 0;
        if requested_id == 0 {
            for candidate in (1..=MAX_DYNAMIC_ID).rev() {
                if !table.is_allocated(candidate) {
                    id = candidate;
                    break;
                }
            }
        } else {
            for candidate in requested_id.min(MAX_DYNAMIC_ID)..=MAX_DYNAMIC_ID {
                if !table.is_allocated(candidate) {
                    id = candidate;
                    break;
                }
            }
        }
        if id != 0 {
            table.allocate(id, unique_id);
        }
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator() -> Allocator {
        Allocator::new(Duration::from_millis(500))
    }

    fn identifier(seed: u8) -> [u8; 16] {
        std::array::from_fn(|index| seed.wrapping_add(index as u8))
    }

    /// Run the three-round exchange, returning the final reply.
    fn run_exchange(
        allocator: &Allocator,
        unique_id: [u8; 16],
        requested_id: u8,
    ) -> Option<AllocationReply> {
        let mut round1 = vec![0x01];
        round1.extend_from_slice(&unique_id[0..6]);
        let reply = allocator.handle_message(0, &round1).unwrap();
        assert_eq!(&reply.as_slice()[1..7], &unique_id[0..6]);
        assert_eq!(reply.as_slice().len(), 7);

        let mut round2 = vec![0x00];
        round2.extend_from_slice(&unique_id[6..12]);
        let reply = allocator.handle_message(0, &round2).unwrap();
        assert_eq!(&reply.as_slice()[1..13], &unique_id[0..12]);
        assert_eq!(reply.as_slice().len(), 13);

        let mut round3 = vec![(requested_id << 1) & 0xFE];
        round3.extend_from_slice(&unique_id[12..16]);
        allocator.handle_message(0, &round3)
    }

    fn allocated_id(reply: &AllocationReply) -> u8 {
        (reply.as_slice()[0] & 0xFE) >> 1
    }

    #[test]
    fn test_unseen_identifier_gets_highest_unused_id() {
        let allocator = allocator();
        let reply = run_exchange(&allocator, identifier(1), 0).unwrap();
        assert_eq!(allocated_id(&reply), 125);
        assert_eq!(&reply.as_slice()[1..17], &identifier(1));

        let reply = run_exchange(&allocator, identifier(2), 0).unwrap();
        assert_eq!(allocated_id(&reply), 124);
    }

    #[test]
    fn test_known_identifier_reuses_its_id() {
        let allocator = allocator();
        let first = run_exchange(&allocator, identifier(7), 0).unwrap();
        let second = run_exchange(&allocator, identifier(7), 0).unwrap();
        assert_eq!(allocated_id(&first), allocated_id(&second));
    }

    #[test]
    fn test_requested_id_is_honoured() {
        let allocator = allocator();
        let reply = run_exchange(&allocator, identifier(3), 40).unwrap();
        assert_eq!(allocated_id(&reply), 40);
        // The next peer requesting the same ID gets the next free one up.
        let reply = run_exchange(&allocator, identifier(4), 40).unwrap();
        assert_eq!(allocated_id(&reply), 41);
    }

    #[test]
    fn test_nonzero_source_is_ignored() {
        let allocator = allocator();
        let mut round1 = vec![0x01];
        round1.extend_from_slice(&identifier(1)[0..6]);
        assert!(allocator.handle_message(9, &round1).is_none());
    }

    #[test]
    fn test_out_of_order_round_is_rejected() {
        let allocator = allocator();
        // Round 2 without a round 1.
        let mut round2 = vec![0x00];
        round2.extend_from_slice(&identifier(1)[6..12]);
        assert!(allocator.handle_message(0, &round2).is_none());
    }

    #[test]
    fn test_stale_exchange_resets() {
        let allocator = Allocator::new(Duration::from_millis(0));
        let mut round1 = vec![0x01];
        round1.extend_from_slice(&identifier(1)[0..6]);
        allocator.handle_message(0, &round1).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        // The in-progress exchange has expired; round 2 is now invalid.
        let mut round2 = vec![0x00];
        round2.extend_from_slice(&identifier(1)[6..12]);
        assert!(allocator.handle_message(0, &round2).is_none());
    }

    #[test]
    fn test_unique_id_display() {
        let unique_id = UniqueId([
            0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xAA, 0xBB, 0xCC, 0xDD,
            0xEE, 0xFF,
        ]);
        assert_eq!(
            unique_id.to_string(),
            "00112233-4455-6677-8899-aabbccddeeff"
        );
    }
}
