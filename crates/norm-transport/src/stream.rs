//! # Stream Objects
//!
//! An open-ended byte stream carried over a ring of fixed-size segments.
//! The writer side ([`TxStream`]) packs application bytes into segments with
//! an 8-byte stream payload header; the reader side ([`RxStream`]) re-orders
//! arriving segments by absolute index and exposes a byte-oriented `read`
//! with message-boundary support.
//!
//! Absolute segment index `i` maps onto FEC coordinates as
//! `block = i / ndata`, `symbol = i % ndata`; parity symbols never enter the
//! stream ring.

use std::collections::VecDeque;

use bytes::{Buf, BufMut, BytesMut};

use crate::seq::BlockId;

/// Stream payload header: `flags, reserved, payload_len (u16), stream_offset
/// (u32)`. The length rides inside the FEC-protected region so recovered
/// segments know their true fill.
pub const STREAM_HEADER_LEN: usize = 8;

/// Stream segment flag bits.
pub mod stream_flags {
    /// Segment begins an application message.
    pub const MSG_START: u8 = 0x01;
    /// Segment ends an application message.
    pub const EOM: u8 = 0x02;
}

/// Flush behavior for stream writers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushMode {
    /// Never flush early; segments go out when full.
    None,
    /// Close the partial segment at object boundaries only.
    #[default]
    Passive,
    /// Close the partial segment and actively advertise the flush point.
    Active,
}

// ─── Writer ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct TxSeg {
    data: Vec<u8>,
    msg_start: bool,
    eom: bool,
    stream_offset: u32,
    closed: bool,
}

/// Sender-side circular stream buffer.
#[derive(Debug)]
pub struct TxStream {
    ring: VecDeque<TxSeg>,
    /// Absolute index of `ring[0]`.
    tail_index: u64,
    /// Max segments buffered at once.
    capacity: usize,
    /// Bytes of payload per segment (segment size minus stream header).
    seg_payload_max: usize,
    ndata: u16,
    /// Next absolute index to transmit first-pass.
    next_tx_index: u64,
    /// Byte offset of the next written byte.
    stream_offset: u64,
    /// Overwrite un-transmitted segments instead of blocking.
    push_mode: bool,
    /// Next write starts a new application message.
    at_msg_start: bool,
    closed: bool,
}

impl TxStream {
    /// `buffer_segments` ring slots carrying `segment_size - header` payload
    /// bytes each.
    pub fn new(buffer_segments: usize, segment_size: u16, ndata: u16, push_mode: bool) -> Self {
        TxStream {
            ring: VecDeque::new(),
            tail_index: 0,
            capacity: buffer_segments.max(1),
            seg_payload_max: (segment_size as usize).saturating_sub(STREAM_HEADER_LEN).max(1),
            ndata: ndata.max(1),
            next_tx_index: 0,
            stream_offset: 0,
            push_mode,
            at_msg_start: true,
            closed: false,
        }
    }

    /// Absolute index of the segment currently being written (or the next
    /// one to be created).
    pub fn write_index(&self) -> u64 {
        match self.ring.back() {
            Some(seg) if !seg.closed => self.tail_index + self.ring.len() as u64 - 1,
            _ => self.tail_index + self.ring.len() as u64,
        }
    }

    /// FEC coordinates of the current write position.
    pub fn write_position(&self) -> (BlockId, u16) {
        let idx = self.write_index();
        (
            BlockId((idx / self.ndata as u64) as u32),
            (idx % self.ndata as u64) as u16,
        )
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Mark the stream closed; no further writes accepted.
    pub fn close(&mut self) {
        self.flush_segment();
        self.closed = true;
    }

    /// Fresh segment slots available before the writer would block: free ring
    /// slots plus tail segments that have already been transmitted (or the
    /// whole ring in push mode).
    pub fn vacancy_segments(&self) -> usize {
        let droppable = if self.push_mode {
            self.ring.len()
        } else {
            (self.next_tx_index.saturating_sub(self.tail_index) as usize).min(self.ring.len())
        };
        self.capacity - self.ring.len() + droppable
    }

    /// Bytes writable before blocking, counting the partially filled current
    /// segment.
    pub fn vacancy_bytes(&self) -> usize {
        let partial = match self.ring.back() {
            Some(seg) if !seg.closed => self.seg_payload_max - seg.data.len(),
            _ => 0,
        };
        self.vacancy_segments() * self.seg_payload_max + partial
    }

    pub fn has_vacancy(&self) -> bool {
        self.vacancy_bytes() > 0
    }

    /// Copy up to `buf.len()` bytes into the stream. Returns the number of
    /// bytes accepted: short (or zero) when the ring is full and the stream
    /// is not in push mode. With `eom` the segment holding the final byte is
    /// closed and marked end-of-message.
    pub fn write(&mut self, buf: &[u8], eom: bool) -> usize {
        if self.closed {
            return 0;
        }
        let mut written = 0usize;
        while written < buf.len() {
            if !self.ensure_open_segment() {
                break;
            }
            let seg = self.ring.back_mut().expect("open segment");
            let room = self.seg_payload_max - seg.data.len();
            let n = room.min(buf.len() - written);
            seg.data.extend_from_slice(&buf[written..written + n]);
            written += n;
            self.stream_offset += n as u64;
            if seg.data.len() == self.seg_payload_max {
                seg.closed = true;
            }
        }
        if eom && written == buf.len() {
            self.mark_eom();
        }
        written
    }

    /// Set the end-of-message flag on the segment being written and close it,
    /// so the next write starts a fresh segment with `msg_start`.
    pub fn mark_eom(&mut self) {
        if let Some(seg) = self.ring.back_mut() {
            if !seg.closed || !seg.data.is_empty() {
                seg.eom = true;
                seg.closed = true;
                self.at_msg_start = true;
            }
        }
    }

    /// Close the current partial segment so it becomes transmittable.
    /// Returns the flush point (current write position) when anything was
    /// flushed.
    pub fn flush_segment(&mut self) -> Option<(BlockId, u16)> {
        let seg = self.ring.back_mut()?;
        if seg.closed || seg.data.is_empty() {
            return None;
        }
        seg.closed = true;
        let idx = self.tail_index + self.ring.len() as u64 - 1;
        Some((
            BlockId((idx / self.ndata as u64) as u32),
            (idx % self.ndata as u64) as u16,
        ))
    }

    /// Whether a first-pass segment is ready for transmission.
    pub fn tx_ready(&self) -> bool {
        let idx = self.next_tx_index;
        idx >= self.tail_index
            && ((idx - self.tail_index) as usize) < self.ring.len()
            && self.ring[(idx - self.tail_index) as usize].closed
    }

    /// Claim the next first-pass segment index for transmission.
    pub fn take_tx_index(&mut self) -> Option<u64> {
        if self.tx_ready() {
            let idx = self.next_tx_index;
            self.next_tx_index += 1;
            Some(idx)
        } else {
            None
        }
    }

    /// Serialize the wire payload (header + data) for an absolute segment
    /// index. `None` once the segment has left the ring (unrepairable).
    pub fn segment_payload(&self, abs_index: u64) -> Option<Vec<u8>> {
        if abs_index < self.tail_index {
            return None;
        }
        let seg = self.ring.get((abs_index - self.tail_index) as usize)?;
        let mut out = BytesMut::with_capacity(STREAM_HEADER_LEN + seg.data.len());
        let mut flags = 0u8;
        if seg.msg_start {
            flags |= stream_flags::MSG_START;
        }
        if seg.eom {
            flags |= stream_flags::EOM;
        }
        out.put_u8(flags);
        out.put_u8(0);
        out.put_u16(seg.data.len() as u16);
        out.put_u32(seg.stream_offset);
        out.extend_from_slice(&seg.data);
        Some(out.to_vec())
    }

    /// Whether every segment of `block` is closed (parity may be computed).
    pub fn block_closed(&self, block: BlockId) -> bool {
        let first = block.value() as u64 * self.ndata as u64;
        (0..self.ndata as u64).all(|s| {
            let idx = first + s;
            idx >= self.tail_index
                && ((idx - self.tail_index) as usize) < self.ring.len()
                && self.ring[(idx - self.tail_index) as usize].closed
        })
    }

    fn ensure_open_segment(&mut self) -> bool {
        if matches!(self.ring.back(), Some(seg) if !seg.closed) {
            return true;
        }
        if self.ring.len() >= self.capacity {
            // Ring full: drop the tail if it has been transmitted, or
            // unconditionally in push mode.
            let tail_sent = self.tail_index < self.next_tx_index;
            if tail_sent || self.push_mode {
                self.ring.pop_front();
                self.tail_index += 1;
                if self.next_tx_index < self.tail_index {
                    self.next_tx_index = self.tail_index;
                }
            } else {
                return false;
            }
        }
        let msg_start = self.at_msg_start;
        self.at_msg_start = false;
        self.ring.push_back(TxSeg {
            data: Vec::with_capacity(self.seg_payload_max),
            msg_start,
            eom: false,
            stream_offset: (self.stream_offset & 0xFFFF_FFFF) as u32,
            closed: false,
        });
        true
    }
}

// ─── Reader ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct RxSeg {
    data: Vec<u8>,
    msg_start: bool,
    eom: bool,
}

/// The reader fell outside the live window: the sender advanced past
/// un-received data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamBreak;

/// Receiver-side reassembly ring.
#[derive(Debug)]
pub struct RxStream {
    ring: VecDeque<Option<RxSeg>>,
    /// Absolute index of `ring[0]`.
    base_index: u64,
    capacity: usize,
    /// Absolute index the reader is positioned at.
    read_index: u64,
    /// Byte offset within the read segment.
    read_offset: usize,
    started: bool,
}

impl RxStream {
    pub fn new(buffer_segments: usize) -> Self {
        RxStream {
            ring: VecDeque::new(),
            base_index: 0,
            capacity: buffer_segments.max(1),
            read_index: 0,
            read_offset: 0,
            started: false,
        }
    }

    /// Store an arriving segment payload (header + data) at its absolute
    /// index. Returns false if the payload is malformed.
    pub fn insert(&mut self, abs_index: u64, payload: &[u8]) -> bool {
        if payload.len() < STREAM_HEADER_LEN {
            return false;
        }
        let mut hdr = &payload[..STREAM_HEADER_LEN];
        let flags = hdr.get_u8();
        let _reserved = hdr.get_u8();
        let len = hdr.get_u16() as usize;
        let _stream_offset = hdr.get_u32();
        if STREAM_HEADER_LEN + len > payload.len() {
            return false;
        }
        let seg = RxSeg {
            data: payload[STREAM_HEADER_LEN..STREAM_HEADER_LEN + len].to_vec(),
            msg_start: flags & stream_flags::MSG_START != 0,
            eom: flags & stream_flags::EOM != 0,
        };

        if !self.started {
            self.base_index = abs_index;
            self.read_index = abs_index;
            self.started = true;
        }
        if abs_index < self.base_index {
            return true; // stale, already slid past
        }
        let slot = (abs_index - self.base_index) as usize;
        // Slide the window forward if the new segment lands past the ring.
        while (abs_index - self.base_index) as usize >= self.capacity {
            self.ring.pop_front();
            self.base_index += 1;
        }
        let slot = slot.min((abs_index - self.base_index) as usize);
        while self.ring.len() <= slot {
            self.ring.push_back(None);
        }
        self.ring[slot] = Some(seg);
        true
    }

    /// Whether the read position has been overrun by the sliding window.
    pub fn is_broken(&self) -> bool {
        self.started && self.read_index < self.base_index
    }

    /// Bytes contiguously readable from the current position.
    pub fn bytes_readable(&self) -> usize {
        if self.is_broken() || !self.started {
            return 0;
        }
        let mut total = 0usize;
        let mut idx = self.read_index;
        let mut offset = self.read_offset;
        loop {
            let slot = (idx - self.base_index) as usize;
            match self.ring.get(slot).and_then(|s| s.as_ref()) {
                Some(seg) => {
                    total += seg.data.len().saturating_sub(offset);
                    if seg.eom {
                        break;
                    }
                    idx += 1;
                    offset = 0;
                }
                None => break,
            }
        }
        total
    }

    /// Copy up to `buf.len()` contiguous bytes, stopping after a segment
    /// flagged end-of-message. Returns `(bytes_read, hit_eom)`.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<(usize, bool), StreamBreak> {
        if self.is_broken() {
            return Err(StreamBreak);
        }
        let mut read = 0usize;
        let mut eom = false;
        while read < buf.len() {
            let slot = match self.slot_of(self.read_index) {
                Some(s) => s,
                None => break,
            };
            let Some(seg) = self.ring.get(slot).and_then(|s| s.as_ref()) else {
                break;
            };
            let avail = seg.data.len() - self.read_offset;
            let n = avail.min(buf.len() - read);
            buf[read..read + n].copy_from_slice(&seg.data[self.read_offset..self.read_offset + n]);
            read += n;
            self.read_offset += n;
            if self.read_offset >= seg.data.len() {
                let was_eom = seg.eom;
                self.advance_read();
                if was_eom {
                    eom = true;
                    break;
                }
            }
        }
        Ok((read, eom))
    }

    /// Advance the read position to the next received segment flagged as a
    /// message start. Returns true if one was found.
    pub fn seek_msg_start(&mut self) -> Result<bool, StreamBreak> {
        if self.is_broken() {
            return Err(StreamBreak);
        }
        let mut idx = self.read_index;
        loop {
            let slot = match self.slot_of(idx) {
                Some(s) => s,
                None => return Ok(false),
            };
            match self.ring.get(slot).and_then(|s| s.as_ref()) {
                Some(seg) if seg.msg_start && !(idx == self.read_index && self.read_offset > 0) => {
                    self.read_index = idx;
                    self.read_offset = 0;
                    return Ok(true);
                }
                Some(_) => idx += 1,
                None => return Ok(false),
            }
        }
    }

    /// Byte offset consumed so far, for `StreamGetReadOffset`.
    pub fn read_position(&self) -> (u64, usize) {
        (self.read_index, self.read_offset)
    }

    fn slot_of(&self, idx: u64) -> Option<usize> {
        if idx < self.base_index {
            return None;
        }
        let slot = (idx - self.base_index) as usize;
        (slot < self.ring.len()).then_some(slot)
    }

    fn advance_read(&mut self) {
        self.read_index += 1;
        self.read_offset = 0;
        // Release consumed slots once the reader moves past them.
        while self.base_index < self.read_index {
            if self.ring.front().is_some() {
                self.ring.pop_front();
                self.base_index += 1;
            } else {
                break;
            }
        }
    }
}
