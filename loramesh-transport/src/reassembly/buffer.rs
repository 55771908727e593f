use crate::bitset::BitSet;
use crate::error::TransportError;
use crate::frame::BITSET_WORDS;

/// Payload storage for one in-flight message.
///
/// Fragments are stored individually to support the shorter final chunk;
/// the bitmap is the single source of truth for which sequences have been
/// accepted, and the fragment map is kept in agreement with it.
#[derive(Debug, Clone)]
pub struct FragmentBuffer {
    fragments: Vec<Option<Vec<u8>>>,
    total_fragments: u16,
    received_mask: BitSet<BITSET_WORDS>,
    received_count: u16,
    current_size: usize,
}

impl FragmentBuffer {
    pub fn new(total_fragments: u16) -> Self {
        Self {
            fragments: vec![None; total_fragments as usize],
            total_fragments,
            received_mask: BitSet::new(),
            received_count: 0,
            current_size: 0,
        }
    }

    /// Stores a fragment payload. Returns `Ok(false)` for a duplicate.
    pub fn insert(&mut self, sequence: u16, data: Vec<u8>) -> Result<bool, TransportError> {
        if sequence >= self.total_fragments {
            return Err(TransportError::InvalidFragment("sequence out of range"));
        }
        if !self.received_mask.set(sequence as usize) {
            return Ok(false);
        }
        self.current_size += data.len();
        self.fragments[sequence as usize] = Some(data);
        self.received_count += 1;
        Ok(true)
    }

    pub fn is_received(&self, sequence: u16) -> bool {
        self.received_mask.get(sequence as usize)
    }

    pub fn is_complete(&self) -> bool {
        self.received_count == self.total_fragments
    }

    pub fn received_count(&self) -> u16 {
        self.received_count
    }

    pub fn total_fragments(&self) -> u16 {
        self.total_fragments
    }

    pub fn current_size(&self) -> usize {
        self.current_size
    }

    /// Sequences not yet received, in order.
    pub fn missing(&self) -> Vec<u16> {
        self.received_mask.zeros(self.total_fragments as usize)
    }

    /// Highest sequence below which everything has been received.
    pub fn contiguous_prefix(&self) -> u16 {
        self.received_mask.first_zero(self.total_fragments as usize) as u16
    }

    /// Concatenates the payloads in sequence order. Only valid when complete.
    pub fn assemble(self) -> Option<Vec<u8>> {
        if !self.is_complete() {
            return None;
        }
        let mut out = Vec::with_capacity(self.current_size);
        for fragment in self.fragments.into_iter().flatten() {
            out.extend_from_slice(&fragment);
        }
        Some(out)
    }
}
