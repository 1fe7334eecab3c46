//! Growable byte buffer used to assemble child-process output.
//!
//! The buffer maintains three counters: bytes used, bytes remaining, and a
//! headroom floor. After every mutation `remaining() >= headroom()` holds,
//! restored by geometric growth (`headroom * 2` at a time) whenever a
//! commit eats into the floor. Growth therefore happens before a read is
//! issued, so large outputs avoid pathological reallocation while small
//! outputs stay cheap.

/// A growable byte vector with a headroom invariant.
#[derive(Debug)]
pub struct ElasticBuffer {
    data: Vec<u8>,
    used: usize,
    headroom: usize,
}

impl ElasticBuffer {
    /// Create a buffer with `capacity` reserved bytes and the given
    /// headroom floor.
    pub fn new(capacity: usize, headroom: usize) -> Self {
        let capacity = capacity.max(headroom);
        Self {
            data: vec![0; capacity],
            used: 0,
            headroom,
        }
    }

    /// Bytes of payload committed so far.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Bytes still writable without growing.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.used
    }

    /// The headroom floor the buffer maintains.
    pub fn headroom(&self) -> usize {
        self.headroom
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Restore the `remaining >= headroom` invariant, growing by
    /// `headroom * 2` per step.
    pub fn reserve_headroom(&mut self) {
        while self.remaining() < self.headroom {
            let grown = self.data.len() + self.headroom * 2;
            self.data.resize(grown, 0);
        }
    }

    /// The writable tail of the buffer. Call [`reserve_headroom`] first so
    /// at least `headroom` bytes are available.
    ///
    /// [`reserve_headroom`]: ElasticBuffer::reserve_headroom
    pub fn spare_mut(&mut self) -> &mut [u8] {
        let used = self.used;
        &mut self.data[used..]
    }

    /// Record that `n` bytes of the spare region were filled.
    pub fn commit(&mut self, n: usize) {
        debug_assert!(n <= self.remaining());
        self.used += n;
    }

    /// The committed payload.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.used]
    }

    /// Hand the payload to the caller, consuming the buffer.
    pub fn into_contents(mut self) -> Vec<u8> {
        self.data.truncate(self.used);
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_buffer_is_empty_with_full_remaining() {
        let buf = ElasticBuffer::new(16 * 1024, 2 * 1024);
        assert_eq!(buf.used(), 0);
        assert_eq!(buf.remaining(), 16 * 1024);
        assert!(buf.is_empty());
    }

    #[test]
    fn invariant_holds_after_every_commit() {
        let mut buf = ElasticBuffer::new(64, 16);
        for _ in 0..100 {
            buf.reserve_headroom();
            assert!(buf.remaining() >= buf.headroom());
            let n = buf.spare_mut().len().min(10);
            buf.spare_mut()[..n].fill(0xAB);
            buf.commit(n);
        }
        assert_eq!(buf.used(), 1000);
        assert!(buf.as_slice().iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn growth_steps_are_twice_the_headroom() {
        let mut buf = ElasticBuffer::new(32, 16);
        buf.commit(20); // remaining = 12 < headroom
        let before = buf.remaining();
        buf.reserve_headroom();
        assert_eq!(buf.remaining(), before + 32);
    }

    #[test]
    fn into_contents_trims_to_used() {
        let mut buf = ElasticBuffer::new(32, 8);
        buf.spare_mut()[..5].copy_from_slice(b"hello");
        buf.commit(5);
        assert_eq!(buf.into_contents(), b"hello");
    }

    #[test]
    fn capacity_never_below_headroom() {
        let buf = ElasticBuffer::new(0, 64);
        assert!(buf.remaining() >= buf.headroom());
    }
}
