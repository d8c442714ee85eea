//! # FEC Block State
//!
//! A [`Block`] tracks one FEC coding block's worth of symbols for either
//! role: the sender uses the `pending` mask as its transmission schedule and
//! caches computed parity segments; the receiver uses it to track missing
//! source symbols and accumulate suppression state from overheard repair
//! requests.
//!
//! [`BlockBuffer`] is the sliding window of live blocks within one object,
//! keyed by wrapping block id with a bounded span.

use std::collections::HashMap;

use crate::bitmask::Bitmask;
use crate::pool::{Segment, SegmentPool};
use crate::seq::BlockId;

// ─── Block ──────────────────────────────────────────────────────────────────

/// One FEC block: `block_len` source symbols (≤ K) plus up to P parity.
#[derive(Debug)]
pub struct Block {
    id: BlockId,
    /// Symbol table: source at [0, ndata), parity at [ndata, ndata+nparity).
    symbols: Vec<Option<Segment>>,
    /// Sender: symbols scheduled for transmission. Receiver: missing source.
    pending: Bitmask,
    /// Sender: repairs accumulated since the last repair cycle.
    /// Receiver: symbols overheard in peer NACKs this backoff round.
    repair: Bitmask,
    /// Number of source symbols actually in this block (short final block).
    block_len: u16,
    /// Receiver: source symbols received or recovered.
    received_source: u16,
    /// Receiver: parity symbols received.
    parity_count: u16,
    /// Sender: next fresh parity index for repair service.
    parity_offset: u16,
    /// Receiver: highest erasure count overheard this suppression round.
    repair_erasures: u16,
    /// Block has been decoded / fully served.
    complete: bool,
}

impl Block {
    /// Create an empty block sized for `ndata + nparity` symbols.
    pub fn new(id: BlockId, block_len: u16, ndata: u16, nparity: u16) -> Self {
        let total = (ndata + nparity) as usize;
        Block {
            id,
            symbols: (0..total).map(|_| None).collect(),
            pending: Bitmask::new(total),
            repair: Bitmask::new(total),
            block_len,
            received_source: 0,
            parity_count: 0,
            parity_offset: 0,
            repair_erasures: 0,
            complete: false,
        }
    }

    #[inline]
    pub fn id(&self) -> BlockId {
        self.id
    }

    #[inline]
    pub fn block_len(&self) -> u16 {
        self.block_len
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn set_complete(&mut self) {
        self.complete = true;
        self.pending.clear();
        self.repair.clear();
    }

    /// Any symbol scheduled / missing.
    #[inline]
    pub fn is_pending(&self) -> bool {
        self.pending.any_set()
    }

    /// Any repair accumulated since the last cycle.
    #[inline]
    pub fn is_repair_pending(&self) -> bool {
        self.repair.any_set() || self.repair_erasures > 0
    }

    pub fn segment(&self, symbol_id: u16) -> Option<&Segment> {
        self.symbols.get(symbol_id as usize)?.as_ref()
    }

    pub fn set_segment(&mut self, symbol_id: u16, seg: Segment) {
        self.symbols[symbol_id as usize] = Some(seg);
    }

    pub fn take_segment(&mut self, symbol_id: u16) -> Option<Segment> {
        self.symbols.get_mut(symbol_id as usize)?.take()
    }

    /// Return every held segment to the pool.
    pub fn empty_to_pool(&mut self, pool: &mut SegmentPool) {
        for slot in self.symbols.iter_mut() {
            if let Some(seg) = slot.take() {
                pool.put(seg);
            }
        }
    }

    // ─── Sender role ────────────────────────────────────────────────────

    /// First-pass schedule: all source symbols plus `auto_parity` proactive
    /// parity segments.
    pub fn tx_reset(&mut self, ndata: u16, auto_parity: u16) {
        self.pending.clear();
        self.repair.clear();
        self.pending.set_bits(0, self.block_len as usize);
        self.pending
            .set_bits(ndata as usize, auto_parity as usize);
        self.parity_offset = auto_parity;
        self.complete = false;
    }

    /// Lowest symbol scheduled for transmission.
    pub fn next_tx_symbol(&self) -> Option<u16> {
        self.pending.first_set().map(|i| i as u16)
    }

    pub fn mark_sent(&mut self, symbol_id: u16) {
        self.pending.unset(symbol_id as usize);
    }

    /// Record an ERASURES-form repair request: serve `count` fresh parity
    /// symbols, falling back to explicit source once parity is spent.
    pub fn request_erasure_repair(&mut self, count: u16, ndata: u16, nparity: u16) {
        let fresh = nparity.saturating_sub(self.parity_offset).min(count);
        self.repair
            .set_bits((ndata + self.parity_offset) as usize, fresh as usize);
        self.parity_offset += fresh;
        let overflow = count.saturating_sub(fresh);
        if overflow > 0 {
            self.repair.set_bits(0, overflow.min(self.block_len) as usize);
        }
    }

    /// Record an explicit symbol repair request.
    pub fn request_symbol_repair(&mut self, symbol_id: u16) {
        if (symbol_id as usize) < self.repair.len() {
            self.repair.set(symbol_id as usize);
        }
    }

    /// Record a whole-block repair request: the full source set plus fresh
    /// auto parity, as on the first pass.
    pub fn request_block_repair(&mut self, ndata: u16, nparity: u16) {
        if self.parity_offset < nparity {
            // Serve remaining parity first; it repairs any loss pattern.
            self.request_erasure_repair(self.block_len, ndata, nparity);
        } else {
            self.repair.set_bits(0, self.block_len as usize);
        }
    }

    /// Promote accumulated repairs into the transmission schedule.
    /// Returns true if anything was newly scheduled.
    pub fn activate_repairs(&mut self) -> bool {
        let activated = self.pending.add(&self.repair);
        self.repair.clear();
        activated
    }

    // ─── Receiver role ──────────────────────────────────────────────────

    /// Mark every source symbol missing (fresh receive block).
    pub fn rx_init(&mut self) {
        self.pending.clear();
        self.pending.set_bits(0, self.block_len as usize);
        self.received_source = 0;
        self.parity_count = 0;
        self.complete = false;
    }

    /// Store an arriving symbol. A duplicate (or out-of-range) symbol is
    /// handed back so the caller can return it to the pool.
    pub fn rx_symbol(&mut self, symbol_id: u16, seg: Segment, ndata: u16) -> Result<(), Segment> {
        let idx = symbol_id as usize;
        if idx >= self.symbols.len() || self.symbols[idx].is_some() {
            return Err(seg);
        }
        if symbol_id < ndata {
            // Source symbols beyond block_len never appear on the wire.
            if symbol_id >= self.block_len {
                return Err(seg);
            }
            self.received_source += 1;
            self.pending.unset(idx);
        } else {
            self.parity_count += 1;
        }
        self.symbols[idx] = Some(seg);
        Ok(())
    }

    /// Missing source symbols.
    #[inline]
    pub fn erasure_count(&self) -> u16 {
        self.block_len - self.received_source
    }

    #[inline]
    pub fn parity_count(&self) -> u16 {
        self.parity_count
    }

    /// Enough symbols in hand for erasure decoding.
    #[inline]
    pub fn is_decodable(&self) -> bool {
        self.received_source + self.parity_count >= self.block_len
    }

    /// Repair still needed after the parity already in hand.
    #[inline]
    pub fn repair_needed(&self) -> u16 {
        self.erasure_count().saturating_sub(self.parity_count)
    }

    /// Indices of missing source symbols, ascending.
    pub fn missing_source(&self) -> Vec<u16> {
        self.pending.iter_set().map(|i| i as u16).collect()
    }

    /// Overheard an ERASURES request covering `count` erasures of this block.
    pub fn overheard_erasures(&mut self, count: u16) {
        self.repair_erasures = self.repair_erasures.max(count);
    }

    /// Overheard an explicit request for one symbol of this block.
    pub fn overheard_symbol(&mut self, symbol_id: u16) {
        if (symbol_id as usize) < self.repair.len() {
            self.repair.set(symbol_id as usize);
        }
    }

    /// Whether a peer already requested this symbol this round.
    pub fn symbol_overheard(&self, symbol_id: u16) -> bool {
        (symbol_id as usize) < self.repair.len() && self.repair.test(symbol_id as usize)
    }

    /// Highest erasure count overheard this round.
    pub fn overheard_erasure_count(&self) -> u16 {
        self.repair_erasures
    }

    /// Whether peers' overheard requests already cover our residual need.
    /// The explicit portion is covered when `pending & !repair` is empty.
    pub fn repair_suppressed(&self, needed: u16) -> bool {
        if self.repair_erasures >= needed {
            return true;
        }
        // Check residual = pending & !repair bit by bit.
        let mut residual = self.pending.clone();
        let mut inverse = self.repair.clone();
        inverse.xcopy(&residual); // inverse = pending & !repair
        residual = inverse;
        !residual.any_set()
    }

    /// Reset overheard state for the next backoff round.
    pub fn clear_repair_round(&mut self) {
        self.repair.clear();
        self.repair_erasures = 0;
    }

    /// Build the decoder's vector list: source slots [0, block_len), parity
    /// slots [block_len, block_len + nparity), missing entries zero-filled.
    /// Returns `(vectors, erasure_locs)` in the decoder's physical layout.
    pub fn decode_vectors(
        &self,
        ndata: u16,
        nparity: u16,
        seg_size: usize,
    ) -> (Vec<Vec<u8>>, Vec<usize>) {
        let num_data = self.block_len as usize;
        let mut vectors = Vec::with_capacity(num_data + nparity as usize);
        let mut erasures = Vec::new();
        for i in 0..num_data {
            match &self.symbols[i] {
                Some(seg) => vectors.push(seg.raw()[..seg_size].to_vec()),
                None => {
                    erasures.push(i);
                    vectors.push(vec![0u8; seg_size]);
                }
            }
        }
        for j in 0..nparity as usize {
            match &self.symbols[ndata as usize + j] {
                Some(seg) => vectors.push(seg.raw()[..seg_size].to_vec()),
                None => {
                    erasures.push(num_data + j);
                    vectors.push(vec![0u8; seg_size]);
                }
            }
        }
        (vectors, erasures)
    }
}

// ─── BlockBuffer ────────────────────────────────────────────────────────────

/// Sliding window of live blocks keyed by wrapping [`BlockId`].
///
/// The span `range_hi - range_lo + 1` never exceeds `range_max`; inserts that
/// would stretch it fail. Removing the head or tail advances the respective
/// bound to the next occupied slot.
#[derive(Debug)]
pub struct BlockBuffer {
    blocks: HashMap<u32, Block>,
    range_lo: BlockId,
    range_hi: BlockId,
    range_max: u32,
}

impl BlockBuffer {
    pub fn new(range_max: u32) -> Self {
        BlockBuffer {
            blocks: HashMap::new(),
            range_lo: BlockId(0),
            range_hi: BlockId(0),
            range_max: range_max.max(1),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn range_lo(&self) -> Option<BlockId> {
        (!self.blocks.is_empty()).then_some(self.range_lo)
    }

    pub fn range_hi(&self) -> Option<BlockId> {
        (!self.blocks.is_empty()).then_some(self.range_hi)
    }

    /// Whether a block with this id could be inserted without breaking the
    /// span bound.
    pub fn can_insert(&self, id: BlockId) -> bool {
        if self.blocks.is_empty() {
            return true;
        }
        let lo = if id.compare(self.range_lo).is_lt() {
            id
        } else {
            self.range_lo
        };
        let hi = if id.compare(self.range_hi).is_gt() {
            id
        } else {
            self.range_hi
        };
        let span = hi.diff(lo);
        span >= 0 && (span as u32) < self.range_max
    }

    /// Insert a block. Fails (returning it) if the span bound would be
    /// exceeded or the slot is occupied.
    pub fn insert(&mut self, block: Block) -> Result<(), Block> {
        let id = block.id();
        if self.blocks.contains_key(&id.value()) || !self.can_insert(id) {
            return Err(block);
        }
        if self.blocks.is_empty() {
            self.range_lo = id;
            self.range_hi = id;
        } else {
            if id.compare(self.range_lo).is_lt() {
                self.range_lo = id;
            }
            if id.compare(self.range_hi).is_gt() {
                self.range_hi = id;
            }
        }
        self.blocks.insert(id.value(), block);
        Ok(())
    }

    pub fn find(&self, id: BlockId) -> Option<&Block> {
        self.blocks.get(&id.value())
    }

    pub fn find_mut(&mut self, id: BlockId) -> Option<&mut Block> {
        self.blocks.get_mut(&id.value())
    }

    /// Remove a block, advancing the range bounds past any gap it leaves.
    pub fn remove(&mut self, id: BlockId) -> Option<Block> {
        let block = self.blocks.remove(&id.value())?;
        if self.blocks.is_empty() {
            return Some(block);
        }
        if id == self.range_lo {
            let mut lo = self.range_lo.next();
            while !self.blocks.contains_key(&lo.value()) {
                lo = lo.next();
            }
            self.range_lo = lo;
        } else if id == self.range_hi {
            let mut hi = self.range_hi.prev();
            while !self.blocks.contains_key(&hi.value()) {
                hi = hi.prev();
            }
            self.range_hi = hi;
        }
        Some(block)
    }

    /// Remove and return the lowest block.
    pub fn remove_head(&mut self) -> Option<Block> {
        let lo = self.range_lo()?;
        self.remove(lo)
    }

    /// Iterate blocks in ascending id order.
    pub fn iter_ordered(&self) -> impl Iterator<Item = &Block> + '_ {
        let mut ids: Vec<BlockId> = self.blocks.values().map(|b| b.id()).collect();
        ids.sort_by(|a, b| a.compare(*b));
        ids.into_iter().filter_map(move |id| self.blocks.get(&id.value()))
    }

    /// Drain every block into the segment pool.
    pub fn empty_to_pool(&mut self, pool: &mut SegmentPool) {
        for (_, mut block) in self.blocks.drain() {
            block.empty_to_pool(pool);
        }
    }
}
