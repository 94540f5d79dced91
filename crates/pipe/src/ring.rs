//! # Lapped Ring Buffer
//!
//! The reader and writer positions alone cannot tell an empty buffer from a
//! full one, so each position also counts its laps: the number of times it
//! wrapped past the end of the buffer.
//!
//! ## Invariants
//! - Empty iff `write_pos == read_pos && write_laps == read_laps`.
//! - Full iff `write_pos == read_pos && write_laps == read_laps + 1`.
//! - The writer is never more than one lap ahead of the reader.

pub(crate) struct Ring {
    buf: Box<[u8]>,
    read_pos: usize,
    read_laps: u64,
    write_pos: usize,
    write_laps: u64,
}

impl Ring {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            read_pos: 0,
            read_laps: 0,
            write_pos: 0,
            write_laps: 0,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Number of buffered bytes, computed from the four counters.
    pub(crate) fn available(&self) -> usize {
        if self.write_pos > self.read_pos {
            // Same lap.
            self.write_pos - self.read_pos
        } else if self.write_pos < self.read_pos {
            // Writer is on the next lap.
            self.capacity() - self.read_pos + self.write_pos
        } else if self.write_laps > self.read_laps {
            self.capacity()
        } else {
            0
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.write_pos == self.read_pos && self.write_laps == self.read_laps
    }

    pub(crate) fn is_full(&self) -> bool {
        self.write_pos == self.read_pos && self.write_laps > self.read_laps
    }

    /// Copies as many bytes as fit contiguously into `out`, returning the count.
    pub(crate) fn read_into(&mut self, out: &mut [u8]) -> usize {
        if self.is_empty() {
            return 0;
        }

        let end = if self.write_pos > self.read_pos { self.write_pos } else { self.capacity() };
        let amount = out.len().min(end - self.read_pos);
        out[..amount].copy_from_slice(&self.buf[self.read_pos..self.read_pos + amount]);

        self.read_pos += amount;
        if self.read_pos == self.capacity() {
            self.read_pos = 0;
            self.read_laps += 1;
        }
        amount
    }

    /// Accepts as many bytes from `data` as fit contiguously, returning the count.
    pub(crate) fn write_from(&mut self, data: &[u8]) -> usize {
        if self.is_full() {
            return 0;
        }

        let end = if self.write_laps == self.read_laps { self.capacity() } else { self.read_pos };
        let amount = data.len().min(end - self.write_pos);
        self.buf[self.write_pos..self.write_pos + amount].copy_from_slice(&data[..amount]);

        self.write_pos += amount;
        if self.write_pos == self.capacity() {
            self.write_pos = 0;
            self.write_laps += 1;
        }
        amount
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(ring: &mut Ring, mut data: &[u8]) {
        while !data.is_empty() {
            let n = ring.write_from(data);
            assert!(n > 0, "ring unexpectedly full");
            data = &data[n..];
        }
    }

    fn drain(ring: &mut Ring, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = ring.read_into(&mut out[filled..]);
            assert!(n > 0, "ring unexpectedly empty");
            filled += n;
        }
        out
    }

    #[test]
    fn test_empty_ring() {
        let ring = Ring::new(8);
        assert!(ring.is_empty());
        assert!(!ring.is_full());
        assert_eq!(ring.available(), 0);
    }

    #[test]
    fn test_fill_to_capacity() {
        let mut ring = Ring::new(8);
        fill(&mut ring, &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(ring.is_full());
        assert_eq!(ring.available(), 8);
        assert_eq!(ring.write_from(&[9]), 0);
    }

    #[test]
    fn test_available_across_lap_boundary() {
        let mut ring = Ring::new(8);
        fill(&mut ring, &[0, 1, 2, 3, 4, 5]);
        assert_eq!(drain(&mut ring, 4), vec![0, 1, 2, 3]);
        assert_eq!(ring.available(), 2);

        // Wraps past the end of the buffer.
        fill(&mut ring, &[6, 7, 8, 9, 10]);
        assert_eq!(ring.available(), 7);

        assert_eq!(drain(&mut ring, 7), vec![4, 5, 6, 7, 8, 9, 10]);
        assert_eq!(ring.available(), 0);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_full_after_wrap() {
        let mut ring = Ring::new(4);
        fill(&mut ring, &[1, 2, 3]);
        drain(&mut ring, 3);
        fill(&mut ring, &[4, 5, 6, 7]);
        assert!(ring.is_full());
        assert_eq!(ring.available(), 4);
        assert_eq!(drain(&mut ring, 4), vec![4, 5, 6, 7]);
    }

    #[test]
    fn test_reads_are_contiguous() {
        let mut ring = Ring::new(4);
        fill(&mut ring, &[1, 2, 3]);
        drain(&mut ring, 2);
        fill(&mut ring, &[4, 5, 6]);

        // Only the tail segment is returned by a single read.
        let mut out = [0u8; 4];
        assert_eq!(ring.read_into(&mut out), 2);
        assert_eq!(&out[..2], &[3, 4]);
        assert_eq!(ring.read_into(&mut out), 2);
        assert_eq!(&out[..2], &[5, 6]);
    }
}
