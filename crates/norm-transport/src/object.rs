//! # Transport Objects
//!
//! One [`TxObject`]/[`RxObject`] per FILE, DATA, or STREAM being carried.
//! Objects own their block window and sink/source plumbing; the sender and
//! receiver engines drive them through narrow method surfaces.
//!
//! Block/segment geometry: an object of `size` bytes is cut into blocks of
//! `ndata` segments of `segment_size` bytes; the final block may hold fewer
//! segments and its final segment fewer bytes.

use std::collections::BTreeSet;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::block::{Block, BlockBuffer};
use crate::fec::{RsDecoder, RsEncoder};
use crate::pool::SegmentPool;
use crate::seq::{BlockId, ObjectId};
use crate::store::StoreFile;
use crate::stream::{RxStream, TxStream, STREAM_HEADER_LEN};

// ─── Parameters ─────────────────────────────────────────────────────────────

/// How hard the receiver works to complete an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NackingMode {
    /// Never request repair.
    None,
    /// Request only the INFO blob.
    InfoOnly,
    /// Full reliability.
    #[default]
    Normal,
}

/// FEC/segmentation parameters shared by every object of a sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FecParams {
    pub segment_size: u16,
    pub ndata: u16,
    pub nparity: u16,
    pub fec_id: u8,
}

impl FecParams {
    /// Bytes covered by one full block.
    pub fn block_bytes(&self) -> u64 {
        self.segment_size as u64 * self.ndata as u64
    }

    /// Number of blocks an object of `size` bytes occupies.
    pub fn block_count(&self, size: u64) -> u32 {
        size.div_ceil(self.block_bytes()).max(1) as u32
    }

    /// Source symbols in a given block (short final block).
    pub fn block_len(&self, block: u32, size: u64) -> u16 {
        let count = self.block_count(size);
        if block + 1 < count {
            self.ndata
        } else {
            let remaining = size - (count as u64 - 1) * self.block_bytes();
            remaining.div_ceil(self.segment_size as u64).max(1) as u16
        }
    }

    /// Byte offset of a source symbol within the object.
    pub fn offset_of(&self, block: u32, symbol: u16) -> u64 {
        block as u64 * self.block_bytes() + symbol as u64 * self.segment_size as u64
    }

    /// True byte length of a source symbol (short final segment).
    pub fn segment_len(&self, block: u32, symbol: u16, size: u64) -> usize {
        let offset = self.offset_of(block, symbol);
        (size.saturating_sub(offset)).min(self.segment_size as u64) as usize
    }
}

// ─── TxObject ───────────────────────────────────────────────────────────────

/// Where a tx object's source bytes come from.
pub enum TxData {
    Data(Bytes),
    File(Box<dyn StoreFile>),
    Stream(TxStream),
}

/// One item the object scheduler is ready to emit.
#[derive(Debug, Clone)]
pub enum TxItem {
    Info,
    Segment {
        block_id: BlockId,
        symbol_id: u16,
        block_len: u16,
        payload: Vec<u8>,
        is_parity: bool,
        is_repair: bool,
        msg_start: bool,
    },
}

/// Sender-side transport object.
pub struct TxObject {
    pub id: ObjectId,
    pub info: Option<Bytes>,
    pub size: u64,
    params: FecParams,
    auto_parity: u16,
    data: TxData,
    blocks: BlockBuffer,
    /// Next block to activate for first-pass transmission (static objects).
    first_pass_block: u32,
    info_pending: bool,
    info_repair: bool,
    /// Set once the whole object has been transmitted at least once.
    first_pass_done: bool,
}

impl TxObject {
    pub fn new(
        id: ObjectId,
        params: FecParams,
        auto_parity: u16,
        data: TxData,
        info: Option<Bytes>,
        block_window: u32,
    ) -> Self {
        let size = match &data {
            TxData::Data(bytes) => bytes.len() as u64,
            TxData::File(file) => file.size(),
            TxData::Stream(_) => 0,
        };
        TxObject {
            id,
            info_pending: info.is_some(),
            info,
            size,
            params,
            auto_parity: auto_parity.min(params.nparity),
            data,
            blocks: BlockBuffer::new(block_window),
            first_pass_block: 0,
            info_repair: false,
            first_pass_done: false,
        }
    }

    pub fn params(&self) -> FecParams {
        self.params
    }

    pub fn is_stream(&self) -> bool {
        matches!(self.data, TxData::Stream(_))
    }

    pub fn is_file(&self) -> bool {
        matches!(self.data, TxData::File(_))
    }

    pub fn has_info(&self) -> bool {
        self.info.is_some()
    }

    pub fn stream(&self) -> Option<&TxStream> {
        match &self.data {
            TxData::Stream(s) => Some(s),
            _ => None,
        }
    }

    pub fn stream_mut(&mut self) -> Option<&mut TxStream> {
        match &mut self.data {
            TxData::Stream(s) => Some(s),
            _ => None,
        }
    }

    pub fn block_count(&self) -> u32 {
        match &self.data {
            TxData::Stream(_) => u32::MAX,
            _ => self.params.block_count(self.size),
        }
    }

    /// Any transmission (first pass or activated repair) outstanding.
    pub fn is_pending(&self) -> bool {
        if self.info_pending {
            return true;
        }
        if self.blocks.iter_ordered().any(|b| b.is_pending()) {
            return true;
        }
        match &self.data {
            TxData::Stream(s) => s.tx_ready(),
            _ => self.first_pass_block < self.block_count(),
        }
    }

    /// Repair accumulated since the last repair cycle.
    pub fn is_repair_pending(&self) -> bool {
        self.info_repair || self.blocks.iter_ordered().any(|b| b.is_repair_pending())
    }

    /// Whether the first full pass over the object has finished.
    pub fn first_pass_done(&self) -> bool {
        self.first_pass_done
    }

    /// Promote accumulated repair requests into the transmit schedule.
    pub fn activate_repairs(&mut self) -> bool {
        let mut activated = false;
        if self.info_repair {
            self.info_pending = true;
            self.info_repair = false;
            activated = true;
        }
        let ids: Vec<BlockId> = self.blocks.iter_ordered().map(|b| b.id()).collect();
        for id in ids {
            if let Some(block) = self.blocks.find_mut(id) {
                activated |= block.activate_repairs();
            }
        }
        activated
    }

    pub fn request_info_repair(&mut self) {
        if self.info.is_some() {
            self.info_repair = true;
        }
    }

    /// Whole-object repair: schedule a fresh pass.
    pub fn request_object_repair(&mut self) {
        self.request_info_repair();
        if !self.is_stream() {
            self.first_pass_block = 0;
        }
    }

    pub fn request_erasure_repair(&mut self, block_id: BlockId, count: u16, pool: &mut SegmentPool, encoder: &RsEncoder) {
        if self.ensure_block(block_id, pool, encoder) {
            let (ndata, nparity) = (self.params.ndata, self.params.nparity);
            if let Some(block) = self.blocks.find_mut(block_id) {
                block.request_erasure_repair(count, ndata, nparity);
            }
        }
    }

    pub fn request_symbol_repair(&mut self, block_id: BlockId, symbol_id: u16, pool: &mut SegmentPool, encoder: &RsEncoder) {
        if self.ensure_block(block_id, pool, encoder) {
            if let Some(block) = self.blocks.find_mut(block_id) {
                block.request_symbol_repair(symbol_id);
            }
        }
    }

    pub fn request_block_repair(&mut self, block_id: BlockId, pool: &mut SegmentPool, encoder: &RsEncoder) {
        if self.ensure_block(block_id, pool, encoder) {
            let (ndata, nparity) = (self.params.ndata, self.params.nparity);
            if let Some(block) = self.blocks.find_mut(block_id) {
                block.request_block_repair(ndata, nparity);
            }
        }
    }

    /// Next item to transmit, in (info, ascending block, ascending symbol)
    /// order. `None` when nothing is scheduled.
    pub fn next_tx_item(&mut self, pool: &mut SegmentPool, encoder: &RsEncoder) -> Option<TxItem> {
        if self.info_pending {
            self.info_pending = false;
            return Some(TxItem::Info);
        }

        // Serve the lowest active block with scheduled symbols.
        let next = self
            .blocks
            .iter_ordered()
            .find(|b| b.is_pending())
            .map(|b| (b.id(), b.next_tx_symbol()));
        if let Some((block_id, Some(symbol_id))) = next {
            return self.emit_symbol(block_id, symbol_id);
        }

        // First pass: pull the next closed stream segment or activate the
        // next static block.
        if self.is_stream() {
            self.next_stream_tx(pool, encoder)
        } else {
            let count = self.block_count();
            while self.first_pass_block < count {
                let block_id = BlockId(self.first_pass_block);
                self.first_pass_block += 1;
                if self.activate_block(block_id, true, pool, encoder) {
                    let symbol = self.blocks.find(block_id)?.next_tx_symbol()?;
                    return self.emit_symbol(block_id, symbol);
                }
            }
            self.first_pass_done = true;
            None
        }
    }

    fn next_stream_tx(&mut self, pool: &mut SegmentPool, encoder: &RsEncoder) -> Option<TxItem> {
        let (abs, payload) = {
            let stream = self.stream_mut()?;
            let abs = stream.take_tx_index()?;
            let payload = stream.segment_payload(abs)?;
            (abs, payload)
        };
        let ndata = self.params.ndata;
        let block_id = BlockId((abs / ndata as u64) as u32);
        let symbol_id = (abs % ndata as u64) as u16;
        let msg_start = payload
            .first()
            .is_some_and(|&f| f & crate::stream::stream_flags::MSG_START != 0);
        // Completing a block schedules its proactive parity.
        if symbol_id + 1 == ndata && self.auto_parity > 0 && self.params.nparity > 0 {
            self.schedule_stream_parity(block_id, pool, encoder);
        }
        Some(TxItem::Segment {
            block_id,
            symbol_id,
            block_len: ndata,
            payload,
            is_parity: false,
            is_repair: false,
            msg_start,
        })
    }

    /// Read one source segment's true bytes from the backing data.
    pub fn read_source(&mut self, block_id: BlockId, symbol_id: u16) -> Option<Vec<u8>> {
        match &mut self.data {
            TxData::Data(bytes) => {
                let offset = self.params.offset_of(block_id.value(), symbol_id) as usize;
                let len = self.params.segment_len(block_id.value(), symbol_id, self.size);
                (offset < bytes.len()).then(|| bytes[offset..offset + len].to_vec())
            }
            TxData::File(file) => {
                let offset = self.params.offset_of(block_id.value(), symbol_id);
                let len = self.params.segment_len(block_id.value(), symbol_id, self.size);
                let mut buf = vec![0u8; len];
                match file.read_at(offset, &mut buf) {
                    Ok(n) => {
                        buf.truncate(n);
                        Some(buf)
                    }
                    Err(err) => {
                        warn!(object = %self.id, %err, "file read failed");
                        None
                    }
                }
            }
            TxData::Stream(stream) => {
                let abs = block_id.value() as u64 * self.params.ndata as u64 + symbol_id as u64;
                stream.segment_payload(abs)
            }
        }
    }

    /// Drop all block state back into the pool (object eviction).
    pub fn release(&mut self, pool: &mut SegmentPool) {
        self.blocks.empty_to_pool(pool);
    }

    // ─── internal ───────────────────────────────────────────────────────

    fn emit_symbol(&mut self, block_id: BlockId, symbol_id: u16) -> Option<TxItem> {
        let is_parity = symbol_id >= self.params.ndata;
        let block_len = self.blocks.find(block_id)?.block_len();
        // Stream source symbols only reach this path for repair; static
        // symbols are repairs once the first pass has drained.
        let is_repair = if self.is_stream() {
            !is_parity
        } else {
            self.first_pass_done
        };
        let payload = if is_parity {
            self.blocks
                .find(block_id)
                .and_then(|b| b.segment(symbol_id))
                .map(|seg| seg.raw().to_vec())
        } else {
            self.read_source(block_id, symbol_id)
        };
        let Some(payload) = payload else {
            // Source no longer retrievable (stream ring slid past, file read
            // failure): clear the schedule bit so the scheduler progresses.
            if let Some(block) = self.blocks.find_mut(block_id) {
                block.mark_sent(symbol_id);
            }
            return None;
        };
        let msg_start = self.is_stream()
            && !is_parity
            && payload
                .first()
                .is_some_and(|&f| f & crate::stream::stream_flags::MSG_START != 0);
        if let Some(block) = self.blocks.find_mut(block_id) {
            block.mark_sent(symbol_id);
        }
        if !self.is_stream()
            && self.first_pass_block >= self.block_count()
            && !self.blocks.iter_ordered().any(|b| b.is_pending())
        {
            self.first_pass_done = true;
        }
        Some(TxItem::Segment {
            block_id,
            symbol_id,
            block_len,
            payload,
            is_parity,
            is_repair,
            msg_start,
        })
    }

    /// Make sure a block's state (and cached parity) exists.
    fn ensure_block(&mut self, block_id: BlockId, pool: &mut SegmentPool, encoder: &RsEncoder) -> bool {
        if self.blocks.find(block_id).is_some() {
            return true;
        }
        self.activate_block(block_id, false, pool, encoder)
    }

    /// Create block state; on the first pass the full source schedule is set.
    fn activate_block(
        &mut self,
        block_id: BlockId,
        first_pass: bool,
        pool: &mut SegmentPool,
        encoder: &RsEncoder,
    ) -> bool {
        if let Some(existing) = self.blocks.find_mut(block_id) {
            if first_pass {
                let auto = self.auto_parity;
                existing.tx_reset(self.params.ndata, auto);
            }
            return true;
        }
        let block_len = match &self.data {
            TxData::Stream(_) => self.params.ndata,
            _ => self.params.block_len(block_id.value(), self.size),
        };
        let mut block = Block::new(block_id, block_len, self.params.ndata, self.params.nparity);
        if first_pass {
            block.tx_reset(self.params.ndata, self.auto_parity);
        }

        // Cache parity segments now; repair passes depend on them.
        if self.params.nparity > 0 && self.compute_parity(&mut block, pool, encoder).is_none() {
            // Pool exhausted: carry the block without parity service.
            debug!(object = %self.id, block = %block_id, "parity caching skipped");
        }

        // Make room in the sliding window.
        while !self.blocks.can_insert(block_id) {
            match self.blocks.remove_head() {
                Some(mut old) => old.empty_to_pool(pool),
                None => break,
            }
        }
        self.blocks.insert(block).is_ok()
    }

    fn compute_parity(
        &mut self,
        block: &mut Block,
        pool: &mut SegmentPool,
        encoder: &RsEncoder,
    ) -> Option<()> {
        let seg_size = self.params.segment_size as usize;
        let nparity = self.params.nparity as usize;
        let mut parity = vec![vec![0u8; seg_size]; nparity];
        for symbol in 0..block.block_len() {
            let data = self.read_source(block.id(), symbol)?;
            encoder.encode(symbol as usize, &data, &mut parity);
        }
        for (j, pvec) in parity.into_iter().enumerate() {
            let mut seg = pool.get()?;
            seg.fill_from(&pvec);
            block.set_segment(self.params.ndata + j as u16, seg);
        }
        Some(())
    }

    fn schedule_stream_parity(&mut self, block_id: BlockId, pool: &mut SegmentPool, encoder: &RsEncoder) {
        let closed = match &self.data {
            TxData::Stream(s) => s.block_closed(block_id),
            _ => false,
        };
        if !closed {
            return;
        }
        if self.ensure_block(block_id, pool, encoder) {
            let (ndata, auto) = (self.params.ndata, self.auto_parity);
            if let Some(block) = self.blocks.find_mut(block_id) {
                block.tx_reset(ndata, auto);
                // Source segments already went out via the stream path.
                for s in 0..ndata {
                    block.mark_sent(s);
                }
            }
        }
    }
}

// ─── RxObject ───────────────────────────────────────────────────────────────

/// Receive-side object lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxState {
    /// Heard of (via a gap or repair adv) but no parameters yet.
    Placeholder,
    Active,
    Complete,
    Aborted,
}

/// Where completed source segments land.
pub enum RxSink {
    Data(Vec<u8>),
    File(Box<dyn StoreFile>),
    Stream(RxStream),
    /// SIM objects and unreliable reception: bytes are discarded.
    Discard,
}

/// Outcome of feeding one message into an rx object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxOutcome {
    /// State advanced; more to come.
    Updated,
    /// Nothing new (duplicate or stale).
    Duplicate,
    /// The object just completed.
    Completed,
    /// Unusable (no parameters yet, buffer exhausted).
    Dropped,
    /// Fatal for this object (block window exceeded, stream break).
    Abort,
}

/// Receiver-side transport object.
pub struct RxObject {
    pub id: ObjectId,
    pub state: RxState,
    params: Option<FecParams>,
    pub size: u64,
    pub has_info: bool,
    pub info: Option<Bytes>,
    blocks: BlockBuffer,
    /// All blocks below this are complete.
    complete_low: u32,
    /// Blocks completed out of order above `complete_low`.
    completed_above: BTreeSet<u32>,
    /// Highest (block, symbol) coordinate heard, for NACK scoping.
    max_heard: Option<(u32, u16)>,
    sink: RxSink,
    decoder: Option<RsDecoder>,
    pub nacking_mode: NackingMode,
    pub bytes_completed: u64,
    /// True once FLUSH/EOT (or a later object) marked this object's end.
    pub end_heard: bool,
    /// A peer requested this whole object (or its INFO) this backoff round.
    pub peer_requested: bool,
}

impl RxObject {
    /// A placeholder for an object we only know exists.
    pub fn placeholder(id: ObjectId, nacking_mode: NackingMode) -> Self {
        RxObject {
            id,
            state: RxState::Placeholder,
            params: None,
            size: 0,
            has_info: false,
            info: None,
            blocks: BlockBuffer::new(1),
            complete_low: 0,
            completed_above: BTreeSet::new(),
            max_heard: None,
            sink: RxSink::Discard,
            decoder: None,
            nacking_mode,
            bytes_completed: 0,
            end_heard: false,
            peer_requested: false,
        }
    }

    /// Learn the object's parameters (first DATA/INFO with FTI) and attach
    /// its sink.
    pub fn activate(
        &mut self,
        params: FecParams,
        size: u64,
        has_info: bool,
        sink: RxSink,
        block_window: u32,
    ) -> Result<(), crate::fec::FecError> {
        self.decoder = Some(RsDecoder::new(params.ndata, params.nparity)?);
        self.params = Some(params);
        self.size = size;
        self.has_info = has_info;
        self.sink = sink;
        self.blocks = BlockBuffer::new(block_window.max(2));
        self.state = RxState::Active;
        Ok(())
    }

    pub fn is_placeholder(&self) -> bool {
        self.state == RxState::Placeholder
    }

    pub fn params(&self) -> Option<FecParams> {
        self.params
    }

    pub fn stream_mut(&mut self) -> Option<&mut RxStream> {
        match &mut self.sink {
            RxSink::Stream(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_stream(&self) -> bool {
        matches!(self.sink, RxSink::Stream(_))
    }

    /// Assembled bytes of a completed DATA object.
    pub fn data(&self) -> Option<&[u8]> {
        match &self.sink {
            RxSink::Data(buf) => Some(buf),
            _ => None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state == RxState::Complete
    }

    /// Bytes not yet completed, for the `ObjectBytesPending` API.
    pub fn bytes_pending(&self) -> u64 {
        self.size.saturating_sub(self.bytes_completed)
    }

    pub fn handle_info(&mut self, info: Bytes) -> RxOutcome {
        if self.info.is_some() {
            return RxOutcome::Duplicate;
        }
        self.has_info = true;
        self.info = Some(info.clone());
        if let RxSink::File(file) = &mut self.sink {
            // INFO conventionally carries the file name.
            if let Ok(name) = std::str::from_utf8(&info) {
                let _ = file.rename(name);
            }
        }
        if self.check_complete() {
            RxOutcome::Completed
        } else {
            RxOutcome::Updated
        }
    }

    /// Feed one DATA segment.
    pub fn handle_data(
        &mut self,
        payload_id: crate::wire::PayloadId,
        payload: &[u8],
        pool: &mut SegmentPool,
        stats: &mut crate::stats::ReceiverStats,
    ) -> RxOutcome {
        let Some(params) = self.params else {
            return RxOutcome::Dropped;
        };
        if self.state != RxState::Active {
            return RxOutcome::Duplicate;
        }
        let block_val = payload_id.block_id.value();
        let symbol_id = payload_id.symbol_id;

        // Track the transmission frontier.
        match self.max_heard {
            Some((b, s))
                if BlockId(block_val).compare(BlockId(b)).is_lt()
                    || (block_val == b && symbol_id <= s) => {}
            _ => self.max_heard = Some((block_val, symbol_id)),
        }

        if self.block_done(block_val) {
            stats.duplicates += 1;
            return RxOutcome::Duplicate;
        }

        // Find or create block state.
        if self.blocks.find(payload_id.block_id).is_none() {
            let block_len = if payload_id.block_len > 0 {
                payload_id.block_len.min(params.ndata)
            } else {
                params.ndata
            };
            let mut block = Block::new(payload_id.block_id, block_len, params.ndata, params.nparity);
            block.rx_init();
            if self.blocks.insert(block).is_err() {
                // Window exceeded: the sender ran past our buffering.
                warn!(object = %self.id, block = block_val, "rx block window exceeded");
                return RxOutcome::Abort;
            }
        }

        let Some(seg) = pool.get() else {
            stats.buffer_drops += 1;
            return RxOutcome::Dropped;
        };
        let mut seg = seg;
        seg.fill_from(payload);

        let block = self.blocks.find_mut(payload_id.block_id).expect("just inserted");
        if let Err(seg) = block.rx_symbol(symbol_id, seg, params.ndata) {
            stats.duplicates += 1;
            pool.put(seg);
            return RxOutcome::Duplicate;
        }

        // Streams deliver in-order source data immediately.
        if symbol_id < params.ndata {
            if let RxSink::Stream(stream) = &mut self.sink {
                let abs = block_val as u64 * params.ndata as u64 + symbol_id as u64;
                if !stream.insert(abs, payload) {
                    stats.parse_errors += 1;
                }
                if stream.is_broken() {
                    return RxOutcome::Abort;
                }
            }
        }

        // Attempt completion.
        if self.blocks.find(payload_id.block_id).is_some_and(|b| b.is_decodable()) {
            match self.complete_block(payload_id.block_id, pool, stats) {
                Ok(()) => {}
                Err(()) => return RxOutcome::Updated, // decode failed, stays pending
            }
        }

        if self.check_complete() {
            RxOutcome::Completed
        } else {
            RxOutcome::Updated
        }
    }

    /// Whether a block is already fully delivered.
    fn block_done(&self, block: u32) -> bool {
        BlockId(block).compare(BlockId(self.complete_low)).is_lt()
            || self.completed_above.contains(&block)
    }

    fn complete_block(
        &mut self,
        block_id: BlockId,
        pool: &mut SegmentPool,
        stats: &mut crate::stats::ReceiverStats,
    ) -> Result<(), ()> {
        let params = self.params.expect("active object has params");
        let decoder = self.decoder.as_ref().expect("active object has decoder");

        let (erasures, block_len) = {
            let block = self.blocks.find(block_id).ok_or(())?;
            (block.erasure_count(), block.block_len())
        };

        if erasures > 0 {
            // decode_vectors already yields the decoder's physical layout:
            // [0, block_len) source then parity, with physical erasure locs.
            let (mut vectors, erasure_locs) = {
                let block = self.blocks.find(block_id).ok_or(())?;
                block.decode_vectors(params.ndata, params.nparity, params.segment_size as usize)
            };
            match decoder.decode(&mut vectors, block_len as usize, &erasure_locs) {
                Ok(n) => stats.fec_recoveries += n as u64,
                Err(err) => {
                    stats.decode_failures += 1;
                    warn!(object = %self.id, block = %block_id, %err, "decode failed");
                    return Err(());
                }
            }
            for symbol in 0..block_len {
                self.deliver_segment(block_id, symbol, &vectors[symbol as usize], params);
            }
        } else {
            // All source symbols arrived verbatim.
            for symbol in 0..block_len {
                let data = {
                    let block = self.blocks.find(block_id).ok_or(())?;
                    block.segment(symbol).map(|s| s.raw().to_vec()).ok_or(())?
                };
                self.deliver_segment(block_id, symbol, &data, params);
            }
        }

        if let Some(mut block) = self.blocks.remove(block_id) {
            block.empty_to_pool(pool);
        }
        self.mark_block_complete(block_id.value(), block_len, params);
        Ok(())
    }

    fn deliver_segment(&mut self, block_id: BlockId, symbol: u16, data: &[u8], params: FecParams) {
        match &mut self.sink {
            RxSink::Data(buf) => {
                let offset = params.offset_of(block_id.value(), symbol) as usize;
                let len = params.segment_len(block_id.value(), symbol, self.size);
                if buf.len() < offset + len {
                    buf.resize(offset + len, 0);
                }
                buf[offset..offset + len].copy_from_slice(&data[..len]);
            }
            RxSink::File(file) => {
                let offset = params.offset_of(block_id.value(), symbol);
                let len = params.segment_len(block_id.value(), symbol, self.size);
                if let Err(err) = file.write_at(offset, &data[..len.min(data.len())]) {
                    warn!(object = %self.id, %err, "file write failed");
                }
            }
            RxSink::Stream(stream) => {
                // Recovered stream segments re-enter the ring; in-order ones
                // were inserted at arrival and insert() ignores duplicates.
                let abs = block_id.value() as u64 * params.ndata as u64 + symbol as u64;
                if data.len() >= STREAM_HEADER_LEN {
                    stream.insert(abs, data);
                }
            }
            RxSink::Discard => {}
        }
    }

    fn mark_block_complete(&mut self, block: u32, block_len: u16, params: FecParams) {
        self.bytes_completed += (block_len as u64 * params.segment_size as u64)
            .min(self.size.saturating_sub(block as u64 * params.block_bytes()));
        if block == self.complete_low {
            self.complete_low = self.complete_low.wrapping_add(1);
            while self.completed_above.remove(&self.complete_low) {
                self.complete_low = self.complete_low.wrapping_add(1);
            }
        } else {
            self.completed_above.insert(block);
        }
    }

    fn check_complete(&mut self) -> bool {
        let Some(params) = self.params else {
            return false;
        };
        if self.is_stream() {
            return false; // streams only end by EOT/close
        }
        let info_done = !self.has_info || self.info.is_some();
        if info_done && self.complete_low >= params.block_count(self.size) {
            self.state = RxState::Complete;
            return true;
        }
        false
    }

    /// Release every buffered segment (abort/eviction).
    pub fn release(&mut self, pool: &mut SegmentPool) {
        self.blocks.empty_to_pool(pool);
    }

    // ─── NACK support ───────────────────────────────────────────────────

    pub fn max_heard(&self) -> Option<(u32, u16)> {
        self.max_heard
    }

    /// A FLUSH named this coordinate as the transmission frontier: symbols
    /// up to and including it are fair game for repair requests.
    pub fn note_flush_point(&mut self, block: u32, symbol: u16) {
        let frontier = symbol.saturating_add(1);
        match self.max_heard {
            Some((b, s))
                if BlockId(block).compare(BlockId(b)).is_lt()
                    || (block == b && frontier <= s) => {}
            _ => self.max_heard = Some((block, frontier)),
        }
    }

    /// Whether anything in this object still needs repair.
    pub fn needs_repair(&self) -> bool {
        match self.nacking_mode {
            NackingMode::None => false,
            NackingMode::InfoOnly => self.has_info && self.info.is_none(),
            NackingMode::Normal => {
                if self.state != RxState::Active {
                    return self.is_placeholder();
                }
                (self.has_info && self.info.is_none()) || self.has_missing_blocks()
            }
        }
    }

    fn has_missing_blocks(&self) -> bool {
        let Some((max_block, max_sym)) = self.max_heard else {
            return false;
        };
        let mut b = self.complete_low;
        while BlockId(b).compare(BlockId(max_block)).is_le() {
            if !self.block_done(b) {
                if BlockId(b).compare(BlockId(max_block)).is_lt() || self.end_heard {
                    return true;
                }
                // The block at the transmission frontier is only actionable
                // once a symbol below the frontier is missing.
                match self.blocks.find(BlockId(b)) {
                    Some(block) => {
                        if !block.is_decodable()
                            && block.missing_source().iter().any(|&s| s < max_sym)
                        {
                            return true;
                        }
                    }
                    None => return true,
                }
            }
            b = b.wrapping_add(1);
        }
        false
    }

    /// Incomplete block ids in `[complete_low, max_heard]`, ascending, with
    /// whether each has live state in the buffer.
    pub fn repair_scope(&self) -> Vec<(u32, bool)> {
        let Some((max_block, _)) = self.max_heard else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let mut b = self.complete_low;
        while BlockId(b).compare(BlockId(max_block)).is_le() {
            if !self.block_done(b) {
                out.push((b, self.blocks.find(BlockId(b)).is_some()));
            }
            b = b.wrapping_add(1);
        }
        out
    }

    pub fn block(&self, id: BlockId) -> Option<&Block> {
        self.blocks.find(id)
    }

    pub fn block_mut(&mut self, id: BlockId) -> Option<&mut Block> {
        self.blocks.find_mut(id)
    }

    /// Reset per-round suppression state on every live block.
    pub fn clear_repair_round(&mut self) {
        self.peer_requested = false;
        let ids: Vec<BlockId> = self.blocks.iter_ordered().map(|b| b.id()).collect();
        for id in ids {
            if let Some(block) = self.blocks.find_mut(id) {
                block.clear_repair_round();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::ReceiverStats;
    use crate::wire::PayloadId;

    fn params() -> FecParams {
        FecParams {
            segment_size: 64,
            ndata: 4,
            nparity: 2,
            fec_id: crate::wire::FEC_ID_RS8,
        }
    }

    fn encoder() -> RsEncoder {
        RsEncoder::new(4, 2).unwrap()
    }

    #[test]
    fn blocking_geometry() {
        let p = params();
        // 64 * 4 = 256 bytes per block.
        assert_eq!(p.block_count(1), 1);
        assert_eq!(p.block_count(256), 1);
        assert_eq!(p.block_count(257), 2);
        assert_eq!(p.block_len(0, 600), 4);
        assert_eq!(p.block_len(2, 600), 2, "88 bytes -> 2 segments");
        assert_eq!(p.segment_len(2, 1, 600), 24, "final partial segment");
        assert_eq!(p.segment_len(0, 0, 600), 64);
    }

    #[test]
    fn tx_emits_in_order_with_auto_parity() {
        let data = Bytes::from(vec![0x5Au8; 300]); // 2 blocks: 4 + 1 segments
        let mut pool = SegmentPool::new(32, 64);
        let enc = encoder();
        let mut obj = TxObject::new(ObjectId(0), params(), 1, TxData::Data(data), None, 8);

        let mut coords = Vec::new();
        while let Some(item) = obj.next_tx_item(&mut pool, &enc) {
            if let TxItem::Segment {
                block_id,
                symbol_id,
                is_parity,
                ..
            } = item
            {
                coords.push((block_id.value(), symbol_id, is_parity));
            }
        }
        assert_eq!(
            coords,
            vec![
                (0, 0, false),
                (0, 1, false),
                (0, 2, false),
                (0, 3, false),
                (0, 4, true), // auto parity
                (1, 0, false),
                (1, 4, true),
            ]
        );
        assert!(obj.first_pass_done());
    }

    #[test]
    fn tx_info_comes_first() {
        let mut pool = SegmentPool::new(8, 64);
        let enc = encoder();
        let mut obj = TxObject::new(
            ObjectId(0),
            params(),
            0,
            TxData::Data(Bytes::from(vec![1u8; 10])),
            Some(Bytes::from_static(b"name")),
            8,
        );
        assert!(matches!(obj.next_tx_item(&mut pool, &enc), Some(TxItem::Info)));
        assert!(matches!(
            obj.next_tx_item(&mut pool, &enc),
            Some(TxItem::Segment { .. })
        ));
    }

    #[test]
    fn repair_is_served_from_cached_parity() {
        let data = Bytes::from(vec![9u8; 256]);
        let mut pool = SegmentPool::new(32, 64);
        let enc = encoder();
        let mut obj = TxObject::new(ObjectId(0), params(), 0, TxData::Data(data), None, 8);
        while obj.next_tx_item(&mut pool, &enc).is_some() {}

        obj.request_erasure_repair(BlockId(0), 2, &mut pool, &enc);
        assert!(obj.is_repair_pending());
        assert!(obj.activate_repairs());

        let mut parity_syms = Vec::new();
        while let Some(TxItem::Segment {
            symbol_id,
            is_parity,
            is_repair,
            ..
        }) = obj.next_tx_item(&mut pool, &enc)
        {
            assert!(is_parity);
            assert!(is_repair);
            parity_syms.push(symbol_id);
        }
        assert_eq!(parity_syms, vec![4, 5]);
    }

    #[test]
    fn rx_assembles_without_loss() {
        let p = params();
        let src: Vec<u8> = (0..300u32).map(|i| i as u8).collect();
        let mut pool = SegmentPool::new(32, 64);
        let mut stats = ReceiverStats::default();

        let mut obj = RxObject::placeholder(ObjectId(0), NackingMode::Normal);
        obj.activate(p, 300, false, RxSink::Data(Vec::new()), 8).unwrap();

        let mut outcome = RxOutcome::Updated;
        for block in 0..p.block_count(300) {
            for sym in 0..p.block_len(block, 300) {
                let off = p.offset_of(block, sym) as usize;
                let len = p.segment_len(block, sym, 300);
                outcome = obj.handle_data(
                    PayloadId::new(BlockId(block), sym, p.block_len(block, 300)),
                    &src[off..off + len],
                    &mut pool,
                    &mut stats,
                );
            }
        }
        assert_eq!(outcome, RxOutcome::Completed);
        assert_eq!(obj.data().unwrap(), &src[..]);
        assert_eq!(obj.bytes_pending(), 0);
    }

    #[test]
    fn rx_recovers_with_parity() {
        let p = params();
        let src: Vec<u8> = (0..256u32).map(|i| (i * 7) as u8).collect();
        let enc = encoder();
        let mut pool = SegmentPool::new(32, 64);
        let mut stats = ReceiverStats::default();

        // Encode parity over the 4 source segments.
        let mut parity = vec![vec![0u8; 64]; 2];
        for s in 0..4usize {
            enc.encode(s, &src[s * 64..(s + 1) * 64], &mut parity);
        }

        let mut obj = RxObject::placeholder(ObjectId(0), NackingMode::Normal);
        obj.activate(p, 256, false, RxSink::Data(Vec::new()), 8).unwrap();

        // Lose segments 1 and 2; deliver 0, 3 and both parity symbols.
        for (sym, payload) in [(0u16, &src[0..64]), (3, &src[192..256])] {
            obj.handle_data(
                PayloadId::new(BlockId(0), sym, 4),
                payload,
                &mut pool,
                &mut stats,
            );
        }
        obj.handle_data(PayloadId::new(BlockId(0), 4, 4), &parity[0], &mut pool, &mut stats);
        let outcome =
            obj.handle_data(PayloadId::new(BlockId(0), 5, 4), &parity[1], &mut pool, &mut stats);
        assert_eq!(outcome, RxOutcome::Completed);
        assert_eq!(stats.fec_recoveries, 2);
        assert_eq!(obj.data().unwrap(), &src[..]);
    }

    #[test]
    fn rx_repair_scope_reports_gaps() {
        let p = params();
        let mut pool = SegmentPool::new(64, 64);
        let mut stats = ReceiverStats::default();
        let mut obj = RxObject::placeholder(ObjectId(0), NackingMode::Normal);
        obj.activate(p, 256 * 4, false, RxSink::Data(Vec::new()), 8).unwrap();

        // Hear only block 2, symbol 1: blocks 0..=2 are all incomplete.
        obj.handle_data(PayloadId::new(BlockId(2), 1, 4), &[0u8; 64], &mut pool, &mut stats);
        let scope = obj.repair_scope();
        assert_eq!(
            scope,
            vec![(0, false), (1, false), (2, true)],
            "unheard blocks have no live state"
        );
        assert!(obj.needs_repair());
    }

    #[test]
    fn rx_duplicate_counted() {
        let p = params();
        let mut pool = SegmentPool::new(16, 64);
        let mut stats = ReceiverStats::default();
        let mut obj = RxObject::placeholder(ObjectId(0), NackingMode::Normal);
        obj.activate(p, 256, false, RxSink::Data(Vec::new()), 8).unwrap();

        obj.handle_data(PayloadId::new(BlockId(0), 0, 4), &[1u8; 64], &mut pool, &mut stats);
        let outcome =
            obj.handle_data(PayloadId::new(BlockId(0), 0, 4), &[1u8; 64], &mut pool, &mut stats);
        assert_eq!(outcome, RxOutcome::Duplicate);
        assert_eq!(stats.duplicates, 1);
    }

    #[test]
    fn rx_info_completion() {
        let p = params();
        let mut pool = SegmentPool::new(16, 64);
        let mut stats = ReceiverStats::default();
        let mut obj = RxObject::placeholder(ObjectId(0), NackingMode::Normal);
        obj.activate(p, 64, true, RxSink::Data(Vec::new()), 8).unwrap();

        // All data delivered, but info still missing.
        let outcome =
            obj.handle_data(PayloadId::new(BlockId(0), 0, 1), &[7u8; 64], &mut pool, &mut stats);
        assert_eq!(outcome, RxOutcome::Updated);
        assert!(obj.needs_repair());

        let outcome = obj.handle_info(Bytes::from_static(b"meta"));
        assert_eq!(outcome, RxOutcome::Completed);
    }
}
