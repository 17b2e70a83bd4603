//! Fixed-capacity byte ring used to hold pending frame bytes (`spec.md` §4.1).
//!
//! `ByteRing` never grows and never overwrites: every operation that would
//! not fit is refused outright and leaves the ring unchanged. Callers are
//! expected to check the return value rather than relying on a panic or a
//! truncated copy.

/// A fixed-capacity circular byte buffer.
///
/// ```
/// use lumen_proto::ByteRing;
///
/// let mut ring = ByteRing::new(8);
/// assert!(ring.enqueue(&[1, 2, 3]));
/// assert_eq!(ring.len(), 3);
///
/// let mut out = [0u8; 3];
/// assert!(ring.dequeue_into(&mut out));
/// assert_eq!(out, [1, 2, 3]);
/// assert_eq!(ring.len(), 0);
/// ```
#[derive(Debug, Clone)]
pub struct ByteRing {
    buf: Vec<u8>,
    /// Index of the first occupied byte.
    front: usize,
    /// Number of occupied bytes.
    len: usize,
}

impl ByteRing {
    /// Creates an empty ring with room for exactly `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity],
            front: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn free(&self) -> usize {
        self.capacity() - self.len
    }

    /// Copies `data` into the ring. Refuses and returns `false` if `data`
    /// does not fit in the remaining free space, leaving the ring untouched.
    pub fn enqueue(&mut self, data: &[u8]) -> bool {
        if data.len() > self.free() {
            return false;
        }
        if self.buf.is_empty() {
            return data.is_empty();
        }

        let cap = self.capacity();
        let back = (self.front + self.len) % cap;
        let first_chunk = (cap - back).min(data.len());
        self.buf[back..back + first_chunk].copy_from_slice(&data[..first_chunk]);
        if first_chunk < data.len() {
            let rest = &data[first_chunk..];
            self.buf[..rest.len()].copy_from_slice(rest);
        }
        self.len += data.len();
        true
    }

    /// Copies exactly `out.len()` bytes out of the ring into `out`, removing
    /// them. Refuses and returns `false` if fewer than `out.len()` bytes are
    /// held, leaving the ring untouched.
    pub fn dequeue_into(&mut self, out: &mut [u8]) -> bool {
        if out.len() > self.len {
            return false;
        }
        self.copy_out(out);
        self.front = (self.front + out.len()) % self.capacity().max(1);
        self.len -= out.len();
        true
    }

    /// Discards `count` bytes from the front without copying them out.
    /// Refuses and returns `false` if fewer than `count` bytes are held.
    pub fn drop(&mut self, count: usize) -> bool {
        if count > self.len {
            return false;
        }
        self.front = (self.front + count) % self.capacity().max(1);
        self.len -= count;
        true
    }

    /// Copies the first `out.len()` bytes held into `out` without removing
    /// them. Refuses and returns `false` if fewer than `out.len()` bytes are
    /// held.
    pub fn peek(&self, out: &mut [u8]) -> bool {
        if out.len() > self.len {
            return false;
        }
        self.copy_out(out);
        true
    }

    fn copy_out(&self, out: &mut [u8]) {
        if out.is_empty() {
            return;
        }
        let cap = self.capacity();
        let first_chunk = (cap - self.front).min(out.len());
        out[..first_chunk].copy_from_slice(&self.buf[self.front..self.front + first_chunk]);
        if first_chunk < out.len() {
            out[first_chunk..].copy_from_slice(&self.buf[..out.len() - first_chunk]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn enqueue_refuses_when_it_would_overflow() {
        let mut ring = ByteRing::new(4);
        assert!(!ring.enqueue(&[1, 2, 3, 4, 5]));
        assert_eq!(ring.len(), 0);
    }

    #[test]
    fn dequeue_refuses_when_not_enough_buffered() {
        let mut ring = ByteRing::new(4);
        ring.enqueue(&[1, 2]);
        let mut out = [0u8; 3];
        assert!(!ring.dequeue_into(&mut out));
        assert_eq!(ring.len(), 2);
    }

    #[test]
    fn drop_refuses_when_not_enough_buffered() {
        let mut ring = ByteRing::new(4);
        ring.enqueue(&[1, 2]);
        assert!(!ring.drop(3));
        assert_eq!(ring.len(), 2);
    }

    #[test]
    fn peek_does_not_consume() {
        let mut ring = ByteRing::new(4);
        ring.enqueue(&[1, 2, 3]);
        let mut out = [0u8; 2];
        assert!(ring.peek(&mut out));
        assert_eq!(out, [1, 2]);
        assert_eq!(ring.len(), 3);
    }

    #[test]
    fn wraps_across_the_end_of_the_backing_buffer() {
        let mut ring = ByteRing::new(4);
        assert!(ring.enqueue(&[1, 2, 3]));
        let mut out = [0u8; 2];
        assert!(ring.dequeue_into(&mut out));
        assert_eq!(out, [1, 2]);
        // front is now at index 2, len 1; enqueueing 3 more wraps the back
        // pointer around the end of the backing Vec.
        assert!(ring.enqueue(&[4, 5, 6]));
        assert_eq!(ring.len(), 4);
        let mut out = [0u8; 4];
        assert!(ring.dequeue_into(&mut out));
        assert_eq!(out, [3, 4, 5, 6]);
    }

    #[test]
    fn fuzz_matches_a_plain_vecdeque() {
        let mut rng = rand::rng();
        for _ in 0..64 {
            let cap = rng.random_range(1..64);
            let mut ring = ByteRing::new(cap);
            let mut model: std::collections::VecDeque<u8> = std::collections::VecDeque::new();

            for _ in 0..256 {
                match rng.random_range(0..3) {
                    0 => {
                        let n = rng.random_range(0..=cap);
                        let data: Vec<u8> = (0..n).map(|_| rng.random()).collect();
                        let accepted = ring.enqueue(&data);
                        assert_eq!(accepted, model.len() + data.len() <= cap);
                        if accepted {
                            model.extend(data);
                        }
                    }
                    1 => {
                        let n = rng.random_range(0..=cap);
                        let mut out = vec![0u8; n];
                        let accepted = ring.dequeue_into(&mut out);
                        assert_eq!(accepted, model.len() >= n);
                        if accepted {
                            let expected: Vec<u8> = (0..n).map(|_| model.pop_front().unwrap()).collect();
                            assert_eq!(out, expected);
                        }
                    }
                    _ => {
                        let n = rng.random_range(0..=cap);
                        let accepted = ring.drop(n);
                        assert_eq!(accepted, model.len() >= n);
                        if accepted {
                            for _ in 0..n {
                                model.pop_front();
                            }
                        }
                    }
                }
                assert_eq!(ring.len(), model.len());
            }
        }
    }
}
