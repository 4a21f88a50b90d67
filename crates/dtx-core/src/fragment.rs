//! Reassembly of fragmented incoming messages.
//!
//! Fragments of one logical message share its identifier. Fragment 0 is
//! header-only and announces the count; fragments 1..n carry body slices
//! and may arrive in any order.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;

/// Accumulates fragments per message identifier until each set completes.
#[derive(Debug, Default)]
pub struct FragmentAssembler {
    pending: Mutex<HashMap<u32, FragmentState>>,
}

#[derive(Debug, Default)]
struct FragmentState {
    expected_count: u16,
    received_count: u16,
    fragments: BTreeMap<u16, Vec<u8>>,
    total: usize,
}

impl FragmentAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one fragment. Returns the assembled body once the final
    /// fragment of the set lands; the set is removed at that point.
    pub fn push(
        &self,
        identifier: u32,
        fragment_index: u16,
        fragment_count: u16,
        data: Vec<u8>,
    ) -> Option<Vec<u8>> {
        let mut pending = self.pending.lock();
        let state = pending.entry(identifier).or_default();

        if fragment_index == 0 {
            state.expected_count = fragment_count;
            state.received_count = state.fragments.len() as u16 + 1;
            tracing::trace!(identifier, fragment_count, "fragment set started");
        } else {
            state.total += data.len();
            state.fragments.insert(fragment_index, data);
            state.received_count += 1;
            tracing::trace!(
                identifier,
                fragment_index,
                expected = state.expected_count,
                "fragment buffered"
            );
        }

        if state.expected_count == 0 || state.received_count < state.expected_count {
            return None;
        }

        let state = pending.remove(&identifier)?;
        let mut assembled = Vec::with_capacity(state.total);
        for (_, fragment) in state.fragments {
            assembled.extend_from_slice(&fragment);
        }
        Some(assembled)
    }

    /// Number of incomplete fragment sets.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Drop all partial state (connection teardown).
    pub fn clear(&self) {
        self.pending.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_fragment_completes_immediately() {
        let assembler = FragmentAssembler::new();
        let out = assembler.push(1, 0, 1, Vec::new());
        assert_eq!(out, Some(Vec::new()));
        assert_eq!(assembler.pending_count(), 0);
    }

    #[test]
    fn fragments_assemble_in_index_order_regardless_of_arrival() {
        let assembler = FragmentAssembler::new();
        assert!(assembler.push(7, 0, 4, Vec::new()).is_none());
        // Out-of-order arrival: 3, 1, 2.
        assert!(assembler.push(7, 3, 4, b"cc".to_vec()).is_none());
        assert!(assembler.push(7, 1, 4, b"aa".to_vec()).is_none());
        let out = assembler.push(7, 2, 4, b"bb".to_vec()).unwrap();
        assert_eq!(out, b"aabbcc");
        assert_eq!(assembler.pending_count(), 0);
    }

    #[test]
    fn interleaved_identifiers_do_not_mix() {
        let assembler = FragmentAssembler::new();
        assert!(assembler.push(1, 0, 2, Vec::new()).is_none());
        assert!(assembler.push(2, 0, 2, Vec::new()).is_none());
        let first = assembler.push(1, 1, 2, b"one".to_vec()).unwrap();
        let second = assembler.push(2, 1, 2, b"two".to_vec()).unwrap();
        assert_eq!(first, b"one");
        assert_eq!(second, b"two");
    }

    #[test]
    fn clear_discards_partial_sets() {
        let assembler = FragmentAssembler::new();
        assert!(assembler.push(9, 0, 3, Vec::new()).is_none());
        assert!(assembler.push(9, 1, 3, b"x".to_vec()).is_none());
        assembler.clear();
        assert_eq!(assembler.pending_count(), 0);
    }
}
