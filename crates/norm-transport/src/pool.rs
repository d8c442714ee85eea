//! # Segment Pool
//!
//! Pre-allocated fixed-size payload buffers with an explicit free list:
//! O(1) get/put with zero heap churn on the hot path. The pool is sized from
//! the session's `buffer_space / segment_size`; exhaustion is non-fatal —
//! callers fall back to back-pressure — but is logged once per episode and
//! counted.

use tracing::warn;

/// A fixed-size payload buffer drawn from a [`SegmentPool`].
///
/// The buffer is allocated at the pool's segment size; `len` tracks the
/// meaningful prefix (short final segments, partially filled stream
/// segments).
#[derive(Debug, Clone)]
pub struct Segment {
    data: Box<[u8]>,
    len: usize,
}

impl Segment {
    fn new(size: usize) -> Self {
        Segment {
            data: vec![0u8; size].into_boxed_slice(),
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Capacity of the underlying buffer.
    #[inline]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// The meaningful prefix.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Full backing buffer, zero-padded past `len`.
    #[inline]
    pub fn raw(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn raw_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Set the meaningful length. Clamped to capacity.
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.data.len());
    }

    /// Overwrite the segment contents from a slice.
    pub fn fill_from(&mut self, src: &[u8]) {
        let n = src.len().min(self.data.len());
        self.data[..n].copy_from_slice(&src[..n]);
        // Zero the tail so parity math over the full buffer stays correct.
        self.data[n..].fill(0);
        self.len = n;
    }

    fn reset(&mut self) {
        self.data.fill(0);
        self.len = 0;
    }
}

/// Free-list arena of equal-sized segments.
pub struct SegmentPool {
    free: Vec<Segment>,
    seg_size: usize,
    total: usize,
    peak_usage: usize,
    overruns: u64,
    overrun_flag: bool,
}

impl SegmentPool {
    /// Create a pool of `count` segments of `size` bytes each.
    pub fn new(count: usize, size: usize) -> Self {
        SegmentPool {
            free: (0..count).map(|_| Segment::new(size)).collect(),
            seg_size: size,
            total: count,
            peak_usage: 0,
            overruns: 0,
            overrun_flag: false,
        }
    }

    /// Take a zeroed segment. `None` when the pool is exhausted — the first
    /// failure of an episode is logged, subsequent ones only counted.
    pub fn get(&mut self) -> Option<Segment> {
        match self.free.pop() {
            Some(seg) => {
                self.overrun_flag = false;
                let usage = self.total - self.free.len();
                if usage > self.peak_usage {
                    self.peak_usage = usage;
                }
                Some(seg)
            }
            None => {
                if !self.overrun_flag {
                    warn!(
                        total = self.total,
                        "segment pool exhausted, operating with constrained buffering"
                    );
                    self.overruns += 1;
                    self.overrun_flag = true;
                }
                None
            }
        }
    }

    /// Return a segment to the free list.
    pub fn put(&mut self, mut seg: Segment) {
        debug_assert_eq!(seg.size(), self.seg_size);
        seg.reset();
        if self.free.len() < self.total {
            self.free.push(seg);
        }
    }

    /// Segments currently available.
    pub fn vacancy(&self) -> usize {
        self.free.len()
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn segment_size(&self) -> usize {
        self.seg_size
    }

    /// High-water mark of segments in use.
    pub fn peak_usage(&self) -> usize {
        self.peak_usage
    }

    /// Number of exhaustion episodes.
    pub fn overruns(&self) -> u64 {
        self.overruns
    }
}
