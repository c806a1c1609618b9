use crate::safe_converter::SafeCast;
use crate::sequence::{sequence_greater_than, sequence_less_than};

/// A fixed-capacity table of entries keyed by 16-bit sequence numbers, storing sequence `s` in
///  slot `s % capacity`.
///
/// The buffer tracks the sequence *after* the newest entry it has seen. Its window is
///  `sequence - capacity ..< sequence` (with wrap-around semantics): inserting a sequence older
///  than that window fails, and inserting a newer sequence slides the window forward, clearing
///  every slot that was skipped over.
///
/// Lookups compare the slot's tag with the requested sequence, so an entry is only visible while
///  its sequence is still the one occupying its slot.
pub struct SequenceBuffer<T> {
    sequence: u16,
    entry_sequences: Vec<Option<u16>>,
    entries: Vec<T>,
}

impl<T: Default> SequenceBuffer<T> {
    /// half the sequence number space - larger windows would make "older than" ambiguous
    pub const MAX_CAPACITY: usize = 32768;

    pub fn new(capacity: usize) -> SequenceBuffer<T> {
        assert!(capacity > 0 && capacity <= Self::MAX_CAPACITY, "sequence buffer capacity out of range: {}", capacity);

        SequenceBuffer {
            sequence: 0,
            entry_sequences: vec![None; capacity],
            entries: (0..capacity).map(|_| T::default()).collect(),
        }
    }

    /// Returns a freshly reset entry for `sequence`, or `None` if the sequence is older than the
    ///  buffer's window.
    pub fn insert(&mut self, sequence: u16) -> Option<&mut T> {
        if !self.test_insert(sequence) {
            return None;
        }

        if sequence_greater_than(sequence.wrapping_add(1), self.sequence) {
            self.remove_entries(self.sequence, sequence);
            self.sequence = sequence.wrapping_add(1);
        }

        let index = self.index_of(sequence);
        self.entry_sequences[index] = Some(sequence);
        self.entries[index] = T::default();
        Some(&mut self.entries[index])
    }
}

impl<T> SequenceBuffer<T> {
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// the sequence after the newest one inserted so far
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    /// Checks if `sequence` is inside (or ahead of) the window, i.e. if inserting it would succeed.
    pub fn test_insert(&self, sequence: u16) -> bool {
        !sequence_less_than(sequence, self.oldest_in_window())
    }

    pub fn exists(&self, sequence: u16) -> bool {
        self.entry_sequences[self.index_of(sequence)] == Some(sequence)
    }

    pub fn find(&self, sequence: u16) -> Option<&T> {
        let index = self.index_of(sequence);
        if self.entry_sequences[index] == Some(sequence) {
            Some(&self.entries[index])
        }
        else {
            None
        }
    }

    pub fn find_mut(&mut self, sequence: u16) -> Option<&mut T> {
        let index = self.index_of(sequence);
        if self.entry_sequences[index] == Some(sequence) {
            Some(&mut self.entries[index])
        }
        else {
            None
        }
    }

    pub fn remove(&mut self, sequence: u16) {
        let index = self.index_of(sequence);
        if self.entry_sequences[index] == Some(sequence) {
            self.entry_sequences[index] = None;
        }
    }

    pub fn reset(&mut self) {
        self.sequence = 0;
        self.entry_sequences.fill(None);
    }

    /// Returns the newest received sequence (`ack`) and a bitmask with bit `i` set if `ack - i`
    ///  is present.
    pub fn generate_ack_bits(&self) -> (u16, u32) {
        let ack = self.sequence.wrapping_sub(1);
        let mut ack_bits = 0u32;
        for i in 0..32u16 {
            if self.exists(ack.wrapping_sub(i)) {
                ack_bits |= 1 << i;
            }
        }
        (ack, ack_bits)
    }

    fn oldest_in_window(&self) -> u16 {
        self.sequence.wrapping_sub(self.capacity() as u16)
    }

    fn index_of(&self, sequence: u16) -> usize {
        sequence.safe_cast() % self.capacity()
    }

    /// clears the slots for `start ..= finish`, which may span the entire buffer
    fn remove_entries(&mut self, start: u16, finish: u16) {
        let span = finish.wrapping_sub(start).safe_cast() + 1;
        if span >= self.capacity() {
            self.entry_sequences.fill(None);
        }
        else {
            for offset in 0..span {
                let index = self.index_of(start.wrapping_add(offset as u16));
                self.entry_sequences[index] = None;
            }
        }
    }
}
