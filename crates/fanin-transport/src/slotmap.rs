//! # Per-application slot map
//!
//! Maps a logical aggregator index within one application onto a physical
//! switch slot. Built once at startup by CRC-32 hashing `(app_id, i)` into
//! the slot space, resolving conflicts by linear probing. The map is
//! injective and immutable — runtime rehash would make slot selection
//! nondeterministic across retransmissions.

use crate::error::FaninError;
use crate::seq::SeqNum;

/// Precomputed injective mapping `[0, used_slots) → [0, capacity)`.
#[derive(Debug, Clone)]
pub struct SlotMap {
    slots: Vec<u16>,
}

impl SlotMap {
    /// Hash `(app_id, i)` for every logical index into the physical table.
    ///
    /// Fails when the application asks for more logical slots than the
    /// table holds — probing cannot make an oversubscribed map injective.
    pub fn build(app_id: u16, used_slots: usize, capacity: usize) -> Result<Self, FaninError> {
        if used_slots > capacity {
            return Err(FaninError::SlotMapOversubscribed {
                needed: used_slots,
                capacity,
            });
        }

        let mut taken = vec![false; capacity];
        let mut slots = Vec::with_capacity(used_slots);

        for i in 0..used_slots {
            let mut key = [0u8; 6];
            key[..2].copy_from_slice(&app_id.to_be_bytes());
            key[2..].copy_from_slice(&(i as u32).to_be_bytes());
            let mut pos = crc32fast::hash(&key) as usize % capacity;
            while taken[pos] {
                pos = (pos + 1) % capacity;
            }
            taken[pos] = true;
            slots.push(pos as u16);
        }

        Ok(SlotMap { slots })
    }

    /// Physical slot for a logical index (used by the initial burst).
    #[inline]
    pub fn slot_for_index(&self, index: usize) -> u16 {
        self.slots[index % self.slots.len()]
    }

    /// Physical slot for a sequence number: `slot_of[seq mod used_slots]`.
    #[inline]
    pub fn slot_for_seq(&self, seq: SeqNum) -> u16 {
        self.slots[usize::from(seq.value()) % self.slots.len()]
    }

    /// Number of logical slots this application cycles through.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
