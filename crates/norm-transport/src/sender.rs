//! # Sender Engine
//!
//! Pure logic — no I/O. Owns the transmit cache of objects, the segment
//! scheduler, rate pacing, the GRTT probe loop, and the watermark/flush state
//! machines. The session drives it with three calls: `handle_*` for inbound
//! control traffic, `on_timeout` for timer expiry, and `poll_transmit` to
//! pull the next paced wire message.
//!
//! Scheduling order: control messages first, then objects in ascending id
//! order, within an object ascending (block, symbol). Repairs accumulate
//! during a GRTT-long aggregation window, then are activated into the
//! transmit masks ahead of new data.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use bytes::Bytes;
use quanta::Instant;
use tracing::{debug, trace, warn};

use crate::congestion::{CcMode, FeedbackSample, RateController};
use crate::event::{AckStatus, Event};
use crate::fec::{FecError, RsEncoder};
use crate::object::{FecParams, TxData, TxItem, TxObject};
use crate::pool::SegmentPool;
use crate::quantize;
use crate::seq::{BlockId, ObjectId};
use crate::stats::SenderStats;
use crate::store::StoreFile;
use crate::stream::{FlushMode, TxStream};
use crate::wire::{
    object_flags, repair_flags, AckMsg, AckPayload, AckType, CcFeedback, CmdBody, CmdMsg, DataMsg,
    EchoTime, FtiExt, InfoMsg, Message, NackMsg, ObjectMsgBase, PayloadId, RepairItem, RequestForm,
};

// ─── Configuration ──────────────────────────────────────────────────────────

/// When the sender services accumulated repair requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RepairStrategy {
    /// Aggregate NACKs for one GRTT before serving (default).
    #[default]
    AckLater,
    /// Serve each NACK as it arrives.
    ShootFirst,
}

/// Transmit cache bounds.
#[derive(Debug, Clone, Copy)]
pub struct TxCacheBounds {
    /// Never evict below this many objects.
    pub count_min: usize,
    pub count_max: usize,
    pub size_max: u64,
}

impl Default for TxCacheBounds {
    fn default() -> Self {
        TxCacheBounds {
            count_min: 8,
            count_max: 256,
            size_max: 20 * 1024 * 1024,
        }
    }
}

/// Sender configuration.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Session instance id, changes on sender restart.
    pub instance_id: u16,
    pub segment_size: u16,
    pub ndata: u16,
    pub nparity: u16,
    /// Proactive parity per block on the first pass.
    pub auto_parity: u16,
    pub fec_id: u8,
    /// Segment pool sizing, bytes.
    pub buffer_space: u64,
    /// Initial (or fixed) transmit rate, bytes/sec.
    pub tx_rate: f64,
    pub cc_mode: CcMode,
    pub grtt_estimate: f64,
    pub grtt_max: f64,
    /// Whether the GRTT probe loop runs.
    pub grtt_probing: bool,
    /// Advertised backoff scaling (0..=15).
    pub backoff_factor: u8,
    pub group_size: f64,
    pub cache: TxCacheBounds,
    pub flush_mode: FlushMode,
    /// Redundancy for control transmissions.
    pub robust_factor: u32,
    pub repair_strategy: RepairStrategy,
    /// GRTT multiples of buffering reserved before back-pressure.
    pub flow_control_factor: f64,
    /// Refuse new objects once this many enqueued objects are unacked.
    pub tx_queue_max: usize,
}

impl Default for SenderConfig {
    fn default() -> Self {
        SenderConfig {
            instance_id: 0,
            segment_size: 1400,
            ndata: 16,
            nparity: 4,
            auto_parity: 0,
            fec_id: crate::wire::FEC_ID_RS8,
            buffer_space: 1024 * 1024,
            tx_rate: 64_000.0,
            cc_mode: CcMode::Fixed,
            grtt_estimate: 0.5,
            grtt_max: 10.0,
            grtt_probing: true,
            backoff_factor: 4,
            group_size: 10.0,
            cache: TxCacheBounds::default(),
            flush_mode: FlushMode::Passive,
            robust_factor: 20,
            repair_strategy: RepairStrategy::AckLater,
            flow_control_factor: 2.0,
            tx_queue_max: 64,
        }
    }
}

/// Why an enqueue was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    /// Ack-based flow control: too many unacked objects.
    QueueFull,
    /// The object or FEC parameters are unusable.
    BadParams,
}

// ─── Internal state machines ────────────────────────────────────────────────

#[derive(Debug)]
struct WatermarkState {
    object_id: ObjectId,
    block_id: BlockId,
    symbol_id: u16,
    round: u32,
    next_round: Instant,
    finished: bool,
    app_data: Option<Bytes>,
}

#[derive(Debug)]
struct FlushState {
    rounds_left: u32,
    next_at: Instant,
    point: (ObjectId, BlockId, u16),
}

// ─── Sender ─────────────────────────────────────────────────────────────────

/// The session's transmit role.
pub struct Sender {
    config: SenderConfig,
    node_id: u32,
    params: FecParams,
    sequence: u16,
    next_object_id: ObjectId,
    tx_cache: VecDeque<TxObject>,
    cache_bytes: u64,
    pool: SegmentPool,
    encoder: RsEncoder,
    rate: RateController,
    epoch: Instant,
    /// Pacing cursor: no transmission before this time.
    next_tx_time: Option<Instant>,
    // GRTT probing.
    grtt: f64,
    probe_interval: f64,
    next_probe: Option<Instant>,
    cc_sequence: u16,
    /// Peak RTT observed since the last probe (drives the advertisement).
    peak_rtt: f64,
    /// Per-receiver congestion feedback echoed in probes.
    receiver_feedback: BTreeMap<u32, CcFeedback>,
    cc_active: bool,
    watermark: Option<WatermarkState>,
    acking_nodes: BTreeMap<u32, AckStatus>,
    /// Enroll feedback-visible receivers into the acking set automatically.
    auto_acking: bool,
    flush: Option<FlushState>,
    flush_completed: bool,
    /// Repair aggregation deadline (AckLater).
    repair_at: Option<Instant>,
    /// Everything is acked through this object id (watermark completions).
    acked_through: Option<ObjectId>,
    pending_cmds: VecDeque<Message>,
    events: VecDeque<Event>,
    /// Last (object, block, symbol) emitted, the default flush point.
    last_emitted: Option<(ObjectId, BlockId, u16)>,
    queue_empty_reported: bool,
    pub stats: SenderStats,
}

/// Floor for the inter-packet pacing delay.
const MIN_PACKET_SPACING: Duration = Duration::from_micros(1);

/// GRTT probe interval bounds, seconds.
const PROBE_INTERVAL_MIN: f64 = 1.0;
const PROBE_INTERVAL_MAX: f64 = 30.0;

impl Sender {
    pub fn new(node_id: u32, config: SenderConfig, now: Instant) -> Result<Self, FecError> {
        if PayloadId::encoded_len(config.fec_id).is_none() {
            return Err(FecError::CodeTooLarge);
        }
        let encoder = RsEncoder::new(config.ndata, config.nparity)?;
        let pool_count =
            (config.buffer_space / config.segment_size.max(1) as u64).max(32) as usize;
        let params = FecParams {
            segment_size: config.segment_size,
            ndata: config.ndata,
            nparity: config.nparity,
            fec_id: config.fec_id,
        };
        let rate = RateController::new(config.cc_mode, config.tx_rate, config.segment_size);
        let next_probe = config
            .grtt_probing
            .then(|| now + Duration::from_secs_f64(PROBE_INTERVAL_MIN));
        Ok(Sender {
            grtt: config.grtt_estimate,
            probe_interval: PROBE_INTERVAL_MIN,
            pool: SegmentPool::new(pool_count, config.segment_size as usize),
            encoder,
            rate,
            params,
            config,
            node_id,
            sequence: 0,
            next_object_id: ObjectId(0),
            tx_cache: VecDeque::new(),
            cache_bytes: 0,
            epoch: now,
            next_tx_time: None,
            next_probe,
            cc_sequence: 0,
            peak_rtt: 0.0,
            receiver_feedback: BTreeMap::new(),
            cc_active: false,
            watermark: None,
            acking_nodes: BTreeMap::new(),
            auto_acking: false,
            flush: None,
            flush_completed: false,
            repair_at: None,
            acked_through: None,
            pending_cmds: VecDeque::new(),
            events: VecDeque::new(),
            last_emitted: None,
            queue_empty_reported: false,
            stats: SenderStats::default(),
        })
    }

    pub fn grtt(&self) -> f64 {
        self.grtt
    }

    pub fn rate(&self) -> f64 {
        self.rate.rate()
    }

    /// Set the fixed transmit rate (authoritative outside CC modes).
    pub fn set_tx_rate(&mut self, rate: f64) {
        if let Some(new_rate) = self.rate.set_fixed_rate(rate) {
            self.events.push_back(Event::TxRateChanged(new_rate));
        }
    }

    /// Configure rate bounds for the congestion controller.
    pub fn set_rate_bounds(&mut self, min: Option<f64>, max: Option<f64>) {
        self.rate.set_bounds(min, max);
    }

    pub fn params(&self) -> FecParams {
        self.params
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = Event> + '_ {
        self.events.drain(..)
    }

    // ─── Enqueue ────────────────────────────────────────────────────────

    pub fn enqueue_data(
        &mut self,
        data: Bytes,
        info: Option<Bytes>,
    ) -> Result<ObjectId, EnqueueError> {
        if data.is_empty() {
            return Err(EnqueueError::BadParams);
        }
        self.enqueue(TxData::Data(data), info)
    }

    pub fn enqueue_file(
        &mut self,
        file: Box<dyn StoreFile>,
        info: Option<Bytes>,
    ) -> Result<ObjectId, EnqueueError> {
        if file.size() == 0 {
            return Err(EnqueueError::BadParams);
        }
        self.enqueue(TxData::File(file), info)
    }

    /// Open a stream object with `buffer_size` bytes of ring.
    pub fn open_stream(
        &mut self,
        buffer_size: u64,
        info: Option<Bytes>,
        push_mode: bool,
    ) -> Result<ObjectId, EnqueueError> {
        let segments = (buffer_size / self.config.segment_size.max(1) as u64).max(2) as usize;
        let stream = TxStream::new(
            segments,
            self.config.segment_size,
            self.config.ndata,
            push_mode,
        );
        self.enqueue(TxData::Stream(stream), info)
    }

    /// Schedule a fresh transmission pass over an already-cached object.
    pub fn requeue_object(&mut self, id: ObjectId) -> bool {
        match self.object_mut(id) {
            Some(obj) => {
                obj.request_object_repair();
                obj.activate_repairs();
                self.queue_empty_reported = false;
                true
            }
            None => false,
        }
    }

    fn enqueue(&mut self, data: TxData, info: Option<Bytes>) -> Result<ObjectId, EnqueueError> {
        if self.unacked_count() >= self.config.tx_queue_max {
            self.stats.enqueue_rejected += 1;
            return Err(EnqueueError::QueueFull);
        }
        let id = self.next_object_id;
        self.next_object_id = self.next_object_id.next();
        let block_window = (self.config.buffer_space / self.params.block_bytes().max(1))
            .clamp(2, 1 << 20) as u32;
        let obj = TxObject::new(
            id,
            self.params,
            self.config.auto_parity,
            data,
            info,
            block_window,
        );
        self.cache_bytes += obj.size;
        self.tx_cache.push_back(obj);
        self.queue_empty_reported = false;
        self.flush = None;
        self.flush_completed = false;
        self.enforce_cache_bounds();

        // Half-full ack window nudges an automatic watermark so flow control
        // credit keeps returning.
        if !self.acking_nodes.is_empty()
            && self.watermark.is_none()
            && self.unacked_count() * 2 >= self.config.tx_queue_max
        {
            if let Some(last) = self.tx_cache.back() {
                let size = last.size.max(1);
                let block_count = last.params().block_count(size);
                let final_block = BlockId(block_count.saturating_sub(1));
                let final_len = last.params().block_len(final_block.value(), size);
                let target = (last.id, final_block, final_len.saturating_sub(1));
                self.start_watermark(target.0, target.1, target.2, None, self.epoch);
            }
        }
        Ok(id)
    }

    fn unacked_count(&self) -> usize {
        match self.acked_through {
            None => self.tx_cache.len(),
            Some(acked) => self
                .tx_cache
                .iter()
                .filter(|o| o.id.compare(acked).is_gt())
                .count(),
        }
    }

    fn enforce_cache_bounds(&mut self) {
        let bounds = self.config.cache;
        loop {
            let count = self.tx_cache.len();
            let over_count = count > bounds.count_max;
            let over_size = self.cache_bytes > bounds.size_max && count > bounds.count_min;
            if !(over_count || over_size) {
                break;
            }
            let Some(mut evicted) = self.tx_cache.pop_front() else {
                break;
            };
            self.cache_bytes -= evicted.size;
            evicted.release(&mut self.pool);
            self.stats.objects_purged += 1;
            self.events.push_back(Event::TxObjectPurged(evicted.id));
            debug!(object = %evicted.id, "tx cache eviction");
        }
    }

    /// Cancel an enqueued object.
    pub fn cancel_object(&mut self, id: ObjectId) -> bool {
        if let Some(pos) = self.tx_cache.iter().position(|o| o.id == id) {
            let mut obj = self.tx_cache.remove(pos).expect("position valid");
            self.cache_bytes -= obj.size;
            obj.release(&mut self.pool);
            self.events.push_back(Event::TxObjectPurged(id));
            true
        } else {
            false
        }
    }

    pub fn object(&self, id: ObjectId) -> Option<&TxObject> {
        self.tx_cache.iter().find(|o| o.id == id)
    }

    pub fn object_mut(&mut self, id: ObjectId) -> Option<&mut TxObject> {
        self.tx_cache.iter_mut().find(|o| o.id == id)
    }

    // ─── Stream API ─────────────────────────────────────────────────────

    pub fn stream_write(&mut self, id: ObjectId, buf: &[u8], eom: bool) -> usize {
        let n = match self.object_mut(id).and_then(|o| o.stream_mut()) {
            Some(stream) => stream.write(buf, eom),
            None => 0,
        };
        if n > 0 {
            self.queue_empty_reported = false;
        }
        n
    }

    /// Close the stream's partial segment; in ACTIVE flush mode also start
    /// advertising the flush point.
    pub fn stream_flush(&mut self, id: ObjectId, now: Instant) -> bool {
        let Some(point) = self
            .object_mut(id)
            .and_then(|o| o.stream_mut())
            .and_then(|s| s.flush_segment())
        else {
            return false;
        };
        if self.config.flush_mode == FlushMode::Active {
            self.flush = Some(FlushState {
                rounds_left: self.config.robust_factor.max(1),
                next_at: now,
                point: (id, point.0, point.1),
            });
            self.flush_completed = false;
        }
        true
    }

    pub fn stream_mark_eom(&mut self, id: ObjectId) {
        if let Some(stream) = self.object_mut(id).and_then(|o| o.stream_mut()) {
            stream.mark_eom();
        }
    }

    pub fn stream_close(&mut self, id: ObjectId) {
        if let Some(stream) = self.object_mut(id).and_then(|o| o.stream_mut()) {
            stream.close();
        }
    }

    // ─── Watermark / acking ─────────────────────────────────────────────

    pub fn add_acking_node(&mut self, node_id: u32) {
        self.acking_nodes.entry(node_id).or_insert(AckStatus::Pending);
        self.events.push_back(Event::AckingNodeNew(node_id));
    }

    /// Automatically enroll receivers heard via congestion feedback.
    pub fn set_auto_acking(&mut self, on: bool) {
        self.auto_acking = on;
    }

    pub fn remove_acking_node(&mut self, node_id: u32) {
        self.acking_nodes.remove(&node_id);
    }

    pub fn acking_status(&self, node_id: u32) -> AckStatus {
        self.acking_nodes
            .get(&node_id)
            .copied()
            .unwrap_or(AckStatus::Invalid)
    }

    pub fn acking_nodes(&self) -> impl Iterator<Item = (u32, AckStatus)> + '_ {
        self.acking_nodes.iter().map(|(&n, &s)| (n, s))
    }

    /// Demand positive acknowledgment of the given coordinate from the
    /// acking set.
    pub fn set_watermark(
        &mut self,
        object_id: ObjectId,
        block_id: BlockId,
        symbol_id: u16,
        app_data: Option<Bytes>,
        now: Instant,
    ) {
        self.start_watermark(object_id, block_id, symbol_id, app_data, now);
    }

    /// Keep the current target but restart the round count.
    pub fn reset_watermark(&mut self, now: Instant) {
        if let Some(wm) = self.watermark.as_mut() {
            wm.round = 0;
            wm.next_round = now;
            wm.finished = false;
            for status in self.acking_nodes.values_mut() {
                if *status != AckStatus::Success {
                    *status = AckStatus::Pending;
                }
            }
        }
    }

    fn start_watermark(
        &mut self,
        object_id: ObjectId,
        block_id: BlockId,
        symbol_id: u16,
        app_data: Option<Bytes>,
        now: Instant,
    ) {
        for status in self.acking_nodes.values_mut() {
            *status = AckStatus::Pending;
        }
        self.watermark = Some(WatermarkState {
            object_id,
            block_id,
            symbol_id,
            round: 0,
            next_round: now,
            finished: false,
            app_data,
        });
    }

    /// Robustly transmit an application-defined command.
    pub fn send_command(&mut self, data: Bytes, robust: bool) {
        let repeats = if robust {
            self.config.robust_factor.max(1)
        } else {
            1
        };
        for _ in 0..repeats {
            let msg = self.make_cmd(CmdBody::Application(data.clone()));
            self.pending_cmds.push_back(msg);
        }
        self.events.push_back(Event::TxCmdSent);
    }

    // ─── Inbound control ────────────────────────────────────────────────

    /// Process a NACK addressed to this sender.
    pub fn handle_nack(&mut self, nack: &NackMsg, now: Instant) {
        self.stats.nacks_received += 1;
        self.note_rtt(&nack.grtt_response, now);

        let mut unknown_objects: Vec<ObjectId> = Vec::new();
        for req in &nack.requests {
            let coords: Vec<(ObjectId, PayloadId)> = if req.form == RequestForm::Ranges {
                req.items
                    .chunks_exact(2)
                    .flat_map(|pair| expand_range(&pair[0], &pair[1], req.flags))
                    .collect()
            } else {
                req.items
                    .iter()
                    .map(|it| (it.object_id, it.payload_id))
                    .collect()
            };
            for (object_id, payload_id) in coords {
                let Some(obj) = self.tx_cache.iter_mut().find(|o| o.id == object_id) else {
                    if !unknown_objects.contains(&object_id) {
                        unknown_objects.push(object_id);
                    }
                    continue;
                };
                if req.flags & repair_flags::OBJECT != 0 {
                    obj.request_object_repair();
                } else if req.flags & repair_flags::INFO != 0 {
                    obj.request_info_repair();
                } else if req.flags & repair_flags::BLOCK != 0 {
                    obj.request_block_repair(payload_id.block_id, &mut self.pool, &self.encoder);
                } else if req.form == RequestForm::Erasures {
                    obj.request_erasure_repair(
                        payload_id.block_id,
                        payload_id.symbol_id,
                        &mut self.pool,
                        &self.encoder,
                    );
                } else {
                    obj.request_symbol_repair(
                        payload_id.block_id,
                        payload_id.symbol_id,
                        &mut self.pool,
                        &self.encoder,
                    );
                }
            }
        }

        if !unknown_objects.is_empty() {
            self.send_squelch(unknown_objects);
        }

        // Repair service: immediate or aggregated for a GRTT.
        match self.config.repair_strategy {
            RepairStrategy::ShootFirst => self.activate_repairs(),
            RepairStrategy::AckLater => {
                if self.repair_at.is_none() {
                    self.repair_at = Some(now + Duration::from_secs_f64(self.grtt));
                }
            }
        }

        // Repair demand restarts an active flush.
        if let Some(flush) = self.flush.as_mut() {
            flush.rounds_left = self.config.robust_factor.max(1);
        }
        self.queue_empty_reported = false;
    }

    /// Process an ACK addressed to this sender.
    pub fn handle_ack(&mut self, ack: &AckMsg, now: Instant) {
        self.stats.acks_received += 1;
        self.note_rtt(&ack.grtt_response, now);

        if let Some(fb) = &ack.cc_feedback {
            if self.auto_acking && !self.acking_nodes.contains_key(&ack.source_id) {
                self.add_acking_node(ack.source_id);
            }
            let rtt = self
                .measure_rtt(&ack.grtt_response, now)
                .unwrap_or(self.grtt);
            let loss = quantize::unquantize_loss(fb.loss_q);
            let sample = FeedbackSample {
                node_id: ack.source_id,
                rtt,
                loss,
                ecn: loss,
                recv_rate: quantize::unquantize_rate(fb.rate_q),
            };
            self.receiver_feedback.insert(
                ack.source_id,
                CcFeedback {
                    node_id: ack.source_id,
                    flags: fb.flags | crate::wire::cc_flags::RTT,
                    rtt_q: quantize::quantize_rtt(rtt),
                    rate_q: fb.rate_q,
                },
            );
            if !self.cc_active && self.rate.mode() != CcMode::Fixed {
                self.cc_active = true;
                self.events.push_back(Event::CcActive);
            }
            if let Some(new_rate) = self.rate.on_feedback(sample) {
                self.events.push_back(Event::TxRateChanged(new_rate));
            }
        }

        if ack.ack_type == AckType::Watermark {
            let matched = match (&ack.payload, &self.watermark) {
                (AckPayload::Watermark(w), Some(wm)) => {
                    w.object_id == wm.object_id
                        && w.payload_id.block_id == wm.block_id
                        && w.payload_id.symbol_id == wm.symbol_id
                }
                _ => false,
            };
            if matched {
                if let Some(status) = self.acking_nodes.get_mut(&ack.source_id) {
                    *status = AckStatus::Success;
                }
                self.check_watermark_done();
            }
        }
    }

    // ─── Timers ─────────────────────────────────────────────────────────

    /// Nearest pending sender deadline.
    pub fn next_timeout(&self) -> Option<Instant> {
        let mut next: Option<Instant> = None;
        let mut fold = |t: Option<Instant>| {
            if let Some(t) = t {
                next = Some(match next {
                    Some(cur) if cur <= t => cur,
                    _ => t,
                });
            }
        };
        fold(self.next_probe);
        fold(self.repair_at);
        fold(
            self.watermark
                .as_ref()
                .filter(|w| !w.finished)
                .map(|w| w.next_round),
        );
        fold(self.flush.as_ref().map(|f| f.next_at));
        drop(fold);
        if self.has_tx_work() {
            // The pacing cursor is the data-path wakeup.
            let t = self.next_tx_time.unwrap_or(self.epoch);
            next = Some(match next {
                Some(cur) if cur <= t => cur,
                _ => t,
            });
        }
        next
    }

    /// Drive the probe, repair, watermark, and flush timers.
    pub fn on_timeout(&mut self, now: Instant) {
        if let Some(probe_at) = self.next_probe {
            if now >= probe_at {
                self.emit_probe(now);
            }
        }
        if let Some(repair_at) = self.repair_at {
            if now >= repair_at {
                self.repair_at = None;
                self.activate_repairs();
            }
        }
        self.drive_watermark(now);
        self.drive_flush(now);
    }

    fn drive_watermark(&mut self, now: Instant) {
        let robust = self.config.robust_factor.max(1);
        let Some(wm) = self.watermark.as_mut() else {
            return;
        };
        if wm.finished || now < wm.next_round {
            return;
        }
        if wm.round >= robust {
            // Out of rounds: whoever has not answered has failed.
            wm.finished = true;
            let object_id = wm.object_id;
            let mut success = true;
            for status in self.acking_nodes.values_mut() {
                if *status == AckStatus::Pending {
                    *status = AckStatus::Failure;
                    success = false;
                }
            }
            self.events
                .push_back(Event::TxWatermarkCompleted { object_id, success });
            if success {
                self.acked_through = Some(object_id);
                self.events.push_back(Event::TxQueueVacancy);
            }
            return;
        }
        wm.round += 1;
        wm.next_round = now + Duration::from_secs_f64(self.grtt.max(1.0e-3));
        let pending: Vec<u32> = self
            .acking_nodes
            .iter()
            .filter(|(_, s)| **s == AckStatus::Pending)
            .map(|(&n, _)| n)
            .collect();
        let body = CmdBody::Flush {
            fec_id: self.params.fec_id,
            object_id: wm.object_id,
            payload_id: PayloadId::new(wm.block_id, wm.symbol_id, self.params.ndata),
            acking_nodes: pending,
        };
        let app_data = wm.app_data.clone();
        let msg = self.make_cmd(body);
        self.pending_cmds.push_back(msg);
        if let Some(data) = app_data {
            // Extended watermark: the app payload rides along each round.
            let msg = self.make_cmd(CmdBody::Application(data));
            self.pending_cmds.push_back(msg);
        }
    }

    fn check_watermark_done(&mut self) {
        let all_done = !self.acking_nodes.is_empty()
            && self
                .acking_nodes
                .values()
                .all(|s| *s == AckStatus::Success);
        if !all_done {
            return;
        }
        if let Some(wm) = self.watermark.as_mut() {
            if !wm.finished {
                wm.finished = true;
                let object_id = wm.object_id;
                self.acked_through = Some(object_id);
                self.events.push_back(Event::TxWatermarkCompleted {
                    object_id,
                    success: true,
                });
                self.events.push_back(Event::TxQueueVacancy);
            }
        }
    }

    fn drive_flush(&mut self, now: Instant) {
        let grtt = self.grtt.max(1.0e-3);
        let Some(flush) = self.flush.as_mut() else {
            return;
        };
        if now < flush.next_at {
            return;
        }
        if flush.rounds_left == 0 {
            self.flush = None;
            if !self.flush_completed {
                self.flush_completed = true;
                self.events.push_back(Event::TxFlushCompleted);
            }
            return;
        }
        flush.rounds_left -= 1;
        flush.next_at = now + Duration::from_secs_f64(grtt);
        let (object_id, block_id, symbol_id) = flush.point;
        let body = CmdBody::Flush {
            fec_id: self.params.fec_id,
            object_id,
            payload_id: PayloadId::new(block_id, symbol_id, self.params.ndata),
            acking_nodes: vec![],
        };
        let msg = self.make_cmd(body);
        self.pending_cmds.push_back(msg);
    }

    fn emit_probe(&mut self, now: Instant) {
        self.probe_interval = self
            .probe_interval
            .clamp(PROBE_INTERVAL_MIN, PROBE_INTERVAL_MAX)
            .max(self.grtt);
        self.next_probe = Some(now + Duration::from_secs_f64(self.probe_interval));

        // Decay toward the recent peak so the advertisement can shrink again.
        if self.peak_rtt > 0.0 {
            let target = self.peak_rtt.min(self.config.grtt_max);
            let updated = if target >= self.grtt {
                target
            } else {
                self.grtt * 0.9 + target * 0.1
            };
            if quantize::quantize_rtt(updated) != quantize::quantize_rtt(self.grtt) {
                self.grtt = updated;
                self.events.push_back(Event::GrttUpdated(self.grtt));
            } else {
                self.grtt = updated;
            }
            self.peak_rtt = 0.0;
        }

        self.cc_sequence = self.cc_sequence.wrapping_add(1);
        let feedback: Vec<CcFeedback> = self.receiver_feedback.values().cloned().collect();
        let body = CmdBody::Cc {
            cc_sequence: self.cc_sequence,
            send_time: EchoTime::from_seconds(self.seconds_since_epoch(now)),
            rate_q: quantize::quantize_rate(self.rate.rate()),
            feedback,
        };
        let msg = self.make_cmd(body);
        self.pending_cmds.push_back(msg);
        self.stats.probes_sent += 1;
        trace!(interval = self.probe_interval, grtt = self.grtt, "probe queued");
    }

    fn note_rtt(&mut self, echo: &EchoTime, now: Instant) {
        let Some(rtt) = self.measure_rtt(echo, now) else {
            return;
        };
        if rtt > self.peak_rtt {
            // A sharply larger RTT speeds probing back up.
            if self.peak_rtt > 0.0 && rtt > 1.5 * self.peak_rtt {
                self.probe_interval = (self.probe_interval / 2.0).max(PROBE_INTERVAL_MIN);
            }
            self.peak_rtt = rtt;
        }
        if rtt > self.grtt {
            self.grtt = rtt.min(self.config.grtt_max);
            self.events.push_back(Event::GrttUpdated(self.grtt));
        } else {
            // Stable feedback slows the probe cadence.
            self.probe_interval = (self.probe_interval * 2.0).min(PROBE_INTERVAL_MAX);
        }
    }

    fn measure_rtt(&self, echo: &EchoTime, now: Instant) -> Option<f64> {
        if echo.sec == 0 && echo.usec == 0 {
            return None;
        }
        let rtt = self.seconds_since_epoch(now) - echo.as_seconds();
        (rtt >= 0.0 && rtt < 1000.0).then_some(rtt)
    }

    fn seconds_since_epoch(&self, now: Instant) -> f64 {
        now.saturating_duration_since(self.epoch).as_secs_f64()
    }

    fn activate_repairs(&mut self) {
        for obj in self.tx_cache.iter_mut() {
            obj.activate_repairs();
        }
    }

    fn send_squelch(&mut self, mut stale: Vec<ObjectId>) {
        stale.truncate(64);
        let earliest = self
            .tx_cache
            .front()
            .map(|o| o.id)
            .unwrap_or(self.next_object_id);
        let body = CmdBody::Squelch {
            fec_id: self.params.fec_id,
            object_id: earliest,
            payload_id: PayloadId::new(BlockId(0), 0, self.params.ndata),
            stale_objects: stale,
        };
        let msg = self.make_cmd(body);
        self.pending_cmds.push_back(msg);
        warn!("squelch queued for stale repair requests");
    }

    fn make_cmd(&mut self, body: CmdBody) -> Message {
        let msg = Message::Cmd(CmdMsg {
            sequence: self.sequence,
            source_id: self.node_id,
            instance_id: self.config.instance_id,
            grtt_q: quantize::quantize_rtt(self.grtt),
            backoff: self.config.backoff_factor.min(15),
            gsize_q: quantize::quantize_group_size(self.config.group_size),
            body,
        });
        self.sequence = self.sequence.wrapping_add(1);
        msg
    }

    // ─── Transmission ───────────────────────────────────────────────────

    fn has_tx_work(&self) -> bool {
        !self.pending_cmds.is_empty() || self.tx_cache.iter().any(|o| o.is_pending())
    }

    /// Pull the next wire message if the pacing cursor allows. Advances the
    /// cursor by the serialized size over the current rate.
    pub fn poll_transmit(&mut self, now: Instant) -> Option<Message> {
        if let Some(next) = self.next_tx_time {
            if now < next {
                return None;
            }
        }

        let msg = match self.pending_cmds.pop_front() {
            Some(cmd) => Some(cmd),
            None => self.next_data_message(),
        }?;

        let wire_len = msg.encode().len();
        let delay = Duration::from_secs_f64(wire_len as f64 / self.rate.rate().max(1.0))
            .max(MIN_PACKET_SPACING);
        self.next_tx_time = Some(now + delay);
        self.stats.messages_sent += 1;

        // Queue-empty edge: report once, arm the flush protocol.
        if !self.has_tx_work() && !self.queue_empty_reported {
            self.queue_empty_reported = true;
            self.events.push_back(Event::TxQueueEmpty);
            if self.config.flush_mode != FlushMode::None && self.flush.is_none() {
                if let Some(point) = self.last_emitted {
                    let rounds = match self.config.flush_mode {
                        FlushMode::Active => self.config.robust_factor.max(1),
                        _ => 1,
                    };
                    self.flush = Some(FlushState {
                        rounds_left: rounds,
                        next_at: now,
                        point,
                    });
                    self.flush_completed = false;
                }
            }
        }
        Some(msg)
    }

    fn next_data_message(&mut self) -> Option<Message> {
        let idx = (0..self.tx_cache.len()).find(|&i| self.tx_cache[i].is_pending())?;
        let was_done = self.tx_cache[idx].first_pass_done();
        let (item, object_id, has_info, is_stream, is_file, size) = {
            let obj = &mut self.tx_cache[idx];
            let item = obj.next_tx_item(&mut self.pool, &self.encoder)?;
            (
                item,
                obj.id,
                obj.has_info(),
                obj.is_stream(),
                obj.is_file(),
                obj.size,
            )
        };

        let mut flags = 0u8;
        if has_info {
            flags |= object_flags::INFO;
        }
        if is_stream {
            flags |= object_flags::STREAM;
        }
        if is_file {
            flags |= object_flags::FILE;
        }
        let fti = FtiExt {
            object_size: size,
            fec_instance: 0,
            segment_size: self.params.segment_size,
            ndata: self.params.ndata,
            nparity: self.params.nparity,
        };

        let msg = match item {
            TxItem::Info => {
                let info = self.tx_cache[idx]
                    .info
                    .clone()
                    .unwrap_or_else(Bytes::new);
                Message::Info(InfoMsg {
                    base: self.object_base(object_id, flags, Some(fti)),
                    info,
                })
            }
            TxItem::Segment {
                block_id,
                symbol_id,
                block_len,
                payload,
                is_parity,
                is_repair,
                msg_start,
            } => {
                if is_repair {
                    flags |= object_flags::REPAIR;
                    if !is_parity {
                        flags |= object_flags::EXPLICIT;
                    }
                }
                if msg_start {
                    flags |= object_flags::MSG_START;
                }
                if is_parity {
                    self.stats.parity_sent += 1;
                } else if is_repair {
                    self.stats.repairs_sent += 1;
                } else {
                    self.stats.segments_sent += 1;
                }
                self.stats.bytes_sent += payload.len() as u64;
                self.last_emitted = Some((object_id, block_id, symbol_id));
                Message::Data(DataMsg {
                    base: self.object_base(object_id, flags, Some(fti)),
                    payload_id: PayloadId::new(block_id, symbol_id, block_len),
                    payload: Bytes::from(payload),
                })
            }
        };

        // First-pass completion edge.
        if !was_done && !is_stream && self.tx_cache[idx].first_pass_done() {
            self.events.push_back(Event::TxObjectSent(object_id));
        }
        Some(msg)
    }

    fn object_base(&mut self, object_id: ObjectId, flags: u8, fti: Option<FtiExt>) -> ObjectMsgBase {
        let base = ObjectMsgBase {
            sequence: self.sequence,
            source_id: self.node_id,
            instance_id: self.config.instance_id,
            segment_size: self.params.segment_size,
            flags,
            fec_id: self.params.fec_id,
            object_id,
            fti,
        };
        self.sequence = self.sequence.wrapping_add(1);
        base
    }
}

/// Expand one RANGES start/end pair into individual coordinates, bounded to
/// keep a hostile range from ballooning.
fn expand_range(start: &RepairItem, end: &RepairItem, flags: u8) -> Vec<(ObjectId, PayloadId)> {
    const LIMIT: usize = 4096;
    let mut out = Vec::new();
    if flags & repair_flags::OBJECT != 0 {
        let mut id = start.object_id;
        loop {
            out.push((id, start.payload_id));
            if id == end.object_id || out.len() >= LIMIT {
                break;
            }
            id = id.next();
        }
    } else if flags & repair_flags::BLOCK != 0 {
        let mut b = start.payload_id.block_id;
        loop {
            out.push((
                start.object_id,
                PayloadId::new(b, 0, start.payload_id.block_len),
            ));
            if b == end.payload_id.block_id || out.len() >= LIMIT {
                break;
            }
            b = b.next();
        }
    } else {
        let mut s = start.payload_id.symbol_id;
        loop {
            out.push((
                start.object_id,
                PayloadId::new(start.payload_id.block_id, s, start.payload_id.block_len),
            ));
            if s == end.payload_id.symbol_id || out.len() >= LIMIT {
                break;
            }
            s += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{RepairRequest, WatermarkId};

    fn test_config() -> SenderConfig {
        SenderConfig {
            instance_id: 1,
            segment_size: 64,
            ndata: 4,
            nparity: 2,
            auto_parity: 0,
            tx_rate: 1.0e9, // effectively unpaced unless a test lowers it
            grtt_probing: false,
            grtt_estimate: 0.1,
            ..Default::default()
        }
    }

    fn drain_all(sender: &mut Sender, now: Instant) -> Vec<Message> {
        let mut out = Vec::new();
        let mut t = now;
        for _ in 0..10_000 {
            match sender.poll_transmit(t) {
                Some(msg) => out.push(msg),
                None => {
                    if !sender.has_tx_work() {
                        break;
                    }
                    t += Duration::from_millis(1);
                }
            }
        }
        out
    }

    #[test]
    fn data_object_emits_info_then_ordered_segments() {
        let now = Instant::now();
        let mut tx = Sender::new(10, test_config(), now).unwrap();
        tx.enqueue_data(
            Bytes::from(vec![7u8; 300]),
            Some(Bytes::from_static(b"meta")),
        )
        .unwrap();

        let msgs = drain_all(&mut tx, now);
        assert!(matches!(msgs[0], Message::Info(_)), "INFO first");
        let coords: Vec<(u32, u16)> = msgs[1..]
            .iter()
            .filter_map(|m| match m {
                Message::Data(d) => {
                    Some((d.payload_id.block_id.value(), d.payload_id.symbol_id))
                }
                _ => None,
            })
            .collect();
        assert_eq!(coords, vec![(0, 0), (0, 1), (0, 2), (0, 3), (1, 0)]);

        // Every message carries the FTI for late joiners.
        for m in &msgs {
            match m {
                Message::Data(d) => assert!(d.base.fti.is_some()),
                Message::Info(i) => assert!(i.base.fti.is_some()),
                _ => {}
            }
        }
        let events: Vec<Event> = tx.drain_events().collect();
        assert!(events.iter().any(|e| matches!(e, Event::TxObjectSent(_))));
        assert!(events.iter().any(|e| matches!(e, Event::TxQueueEmpty)));
    }

    #[test]
    fn auto_parity_follows_block() {
        let now = Instant::now();
        let mut tx = Sender::new(
            10,
            SenderConfig {
                auto_parity: 2,
                ..test_config()
            },
            now,
        )
        .unwrap();
        tx.enqueue_data(Bytes::from(vec![1u8; 256]), None).unwrap();

        let msgs = drain_all(&mut tx, now);
        let syms: Vec<u16> = msgs
            .iter()
            .filter_map(|m| match m {
                Message::Data(d) => Some(d.payload_id.symbol_id),
                _ => None,
            })
            .collect();
        assert_eq!(syms, vec![0, 1, 2, 3, 4, 5], "source then parity 4,5");
    }

    #[test]
    fn pacing_spaces_messages() {
        let now = Instant::now();
        let mut tx = Sender::new(
            10,
            SenderConfig {
                tx_rate: 1000.0, // 1 KB/s: a ~100B message takes ~0.1s
                ..test_config()
            },
            now,
        )
        .unwrap();
        tx.enqueue_data(Bytes::from(vec![0u8; 256]), None).unwrap();

        assert!(tx.poll_transmit(now).is_some());
        assert!(tx.poll_transmit(now).is_none(), "cursor blocks");
        let later = now + Duration::from_millis(200);
        assert!(tx.poll_transmit(later).is_some());
    }

    #[test]
    fn cache_eviction_in_order() {
        let now = Instant::now();
        let mut tx = Sender::new(
            10,
            SenderConfig {
                cache: TxCacheBounds {
                    count_min: 2,
                    count_max: 4,
                    size_max: 10 * 1024,
                },
                ..test_config()
            },
            now,
        )
        .unwrap();

        // Six 2 KiB objects through a (2, 4, 10 KiB) cache.
        for _ in 0..5 {
            tx.enqueue_data(Bytes::from(vec![0u8; 2048]), None).unwrap();
        }
        let events: Vec<Event> = tx.drain_events().collect();
        assert!(
            events.iter().any(|e| *e == Event::TxObjectPurged(ObjectId(0))),
            "count bound evicts the oldest"
        );
        assert!(tx.object(ObjectId(1)).is_some());

        tx.enqueue_data(Bytes::from(vec![0u8; 2048]), None).unwrap();
        let events: Vec<Event> = tx.drain_events().collect();
        assert!(events.iter().any(|e| *e == Event::TxObjectPurged(ObjectId(1))));
        assert!(tx.object(ObjectId(2)).is_some());
        assert!(tx.object(ObjectId(5)).is_some());
    }

    #[test]
    fn nack_erasure_served_with_parity_after_aggregation() {
        let now = Instant::now();
        let mut tx = Sender::new(10, test_config(), now).unwrap();
        tx.enqueue_data(Bytes::from(vec![3u8; 256]), None).unwrap();
        drain_all(&mut tx, now);

        let nack = NackMsg {
            sequence: 0,
            source_id: 2,
            server_id: 10,
            instance_id: 1,
            grtt_response: EchoTime::default(),
            requests: vec![RepairRequest {
                form: RequestForm::Erasures,
                flags: repair_flags::SEGMENT,
                items: vec![RepairItem {
                    fec_id: crate::wire::FEC_ID_RS8,
                    object_id: ObjectId(0),
                    payload_id: PayloadId::new(BlockId(0), 2, 4),
                }],
            }],
        };
        let t1 = now + Duration::from_secs(1);
        tx.handle_nack(&nack, t1);
        assert!(tx.poll_transmit(t1 + Duration::from_millis(1)).is_none(), "aggregating");

        // After one GRTT the repair activates.
        let t2 = t1 + Duration::from_secs_f64(tx.grtt() + 0.01);
        tx.on_timeout(t2);
        let msgs = drain_all(&mut tx, t2);
        let parity: Vec<u16> = msgs
            .iter()
            .filter_map(|m| match m {
                Message::Data(d) if d.base.flags & object_flags::REPAIR != 0 => {
                    Some(d.payload_id.symbol_id)
                }
                _ => None,
            })
            .collect();
        assert_eq!(parity, vec![4, 5], "two fresh parity symbols");
        assert_eq!(tx.stats.nacks_received, 1);
    }

    #[test]
    fn shoot_first_serves_immediately() {
        let now = Instant::now();
        let mut tx = Sender::new(
            10,
            SenderConfig {
                repair_strategy: RepairStrategy::ShootFirst,
                ..test_config()
            },
            now,
        )
        .unwrap();
        tx.enqueue_data(Bytes::from(vec![3u8; 256]), None).unwrap();
        drain_all(&mut tx, now);

        let nack = NackMsg {
            sequence: 0,
            source_id: 2,
            server_id: 10,
            instance_id: 1,
            grtt_response: EchoTime::default(),
            requests: vec![RepairRequest {
                form: RequestForm::Erasures,
                flags: repair_flags::SEGMENT,
                items: vec![RepairItem {
                    fec_id: crate::wire::FEC_ID_RS8,
                    object_id: ObjectId(0),
                    payload_id: PayloadId::new(BlockId(0), 1, 4),
                }],
            }],
        };
        let t1 = now + Duration::from_secs(1);
        tx.handle_nack(&nack, t1);
        assert!(tx.poll_transmit(t1).is_some(), "served without aggregation");
    }

    #[test]
    fn nack_for_evicted_object_triggers_squelch() {
        let now = Instant::now();
        let mut tx = Sender::new(10, test_config(), now).unwrap();
        tx.enqueue_data(Bytes::from(vec![1u8; 64]), None).unwrap();

        let nack = NackMsg {
            sequence: 0,
            source_id: 2,
            server_id: 10,
            instance_id: 1,
            grtt_response: EchoTime::default(),
            requests: vec![RepairRequest {
                form: RequestForm::Items,
                flags: repair_flags::OBJECT,
                items: vec![RepairItem {
                    fec_id: crate::wire::FEC_ID_RS8,
                    object_id: ObjectId(40), // never existed
                    payload_id: PayloadId::default(),
                }],
            }],
        };
        tx.handle_nack(&nack, now);
        let msg = tx.poll_transmit(now).expect("squelch first");
        match msg {
            Message::Cmd(cmd) => assert!(matches!(cmd.body, CmdBody::Squelch { .. })),
            other => panic!("expected squelch, got {other:?}"),
        }
    }

    #[test]
    fn watermark_rounds_and_failure() {
        let now = Instant::now();
        let mut tx = Sender::new(
            10,
            SenderConfig {
                robust_factor: 4,
                ..test_config()
            },
            now,
        )
        .unwrap();
        tx.enqueue_data(Bytes::from(vec![0u8; 256]), None).unwrap();
        drain_all(&mut tx, now);
        for node in [1u32, 2, 3] {
            tx.add_acking_node(node);
        }
        tx.set_watermark(ObjectId(0), BlockId(0), 3, None, now);

        // Nodes 1 and 2 answer, node 3 stays silent across all rounds.
        let ack = |node: u32| AckMsg {
            sequence: 0,
            source_id: node,
            server_id: 10,
            instance_id: 1,
            ack_type: AckType::Watermark,
            ack_id: 0,
            grtt_response: EchoTime::default(),
            cc_feedback: None,
            payload: AckPayload::Watermark(WatermarkId {
                fec_id: crate::wire::FEC_ID_RS8,
                object_id: ObjectId(0),
                payload_id: PayloadId::new(BlockId(0), 3, 4),
            }),
        };

        let mut t = now;
        let mut flushes = 0;
        for round in 0..6 {
            tx.on_timeout(t);
            while let Some(msg) = tx.poll_transmit(t) {
                if let Message::Cmd(cmd) = &msg {
                    if let CmdBody::Flush { acking_nodes, .. } = &cmd.body {
                        flushes += 1;
                        if round == 0 {
                            assert_eq!(acking_nodes, &vec![1, 2, 3]);
                        }
                    }
                }
            }
            if round == 0 {
                tx.handle_ack(&ack(1), t);
                tx.handle_ack(&ack(2), t);
            }
            t += Duration::from_secs_f64(tx.grtt() + 0.01);
        }

        assert!(flushes >= 4, "robust_factor rounds of ack requests");
        let events: Vec<Event> = tx.drain_events().collect();
        assert!(events.iter().any(|e| matches!(
            e,
            Event::TxWatermarkCompleted {
                success: false,
                ..
            }
        )));
        assert_eq!(tx.acking_status(1), AckStatus::Success);
        assert_eq!(tx.acking_status(2), AckStatus::Success);
        assert_eq!(tx.acking_status(3), AckStatus::Failure);
        assert_eq!(tx.acking_status(99), AckStatus::Invalid);
    }

    #[test]
    fn watermark_all_acked_completes_early() {
        let now = Instant::now();
        let mut tx = Sender::new(10, test_config(), now).unwrap();
        tx.enqueue_data(Bytes::from(vec![0u8; 64]), None).unwrap();
        tx.add_acking_node(5);
        tx.set_watermark(ObjectId(0), BlockId(0), 0, None, now);
        tx.on_timeout(now);

        let ack = AckMsg {
            sequence: 0,
            source_id: 5,
            server_id: 10,
            instance_id: 1,
            ack_type: AckType::Watermark,
            ack_id: 0,
            grtt_response: EchoTime::default(),
            cc_feedback: None,
            payload: AckPayload::Watermark(WatermarkId {
                fec_id: crate::wire::FEC_ID_RS8,
                object_id: ObjectId(0),
                payload_id: PayloadId::new(BlockId(0), 0, 4),
            }),
        };
        tx.handle_ack(&ack, now);
        let events: Vec<Event> = tx.drain_events().collect();
        assert!(events.iter().any(|e| matches!(
            e,
            Event::TxWatermarkCompleted { success: true, .. }
        )));
    }

    #[test]
    fn grtt_probe_emitted_and_rtt_learned() {
        let now = Instant::now();
        let mut tx = Sender::new(
            10,
            SenderConfig {
                grtt_probing: true,
                grtt_estimate: 0.01,
                ..test_config()
            },
            now,
        )
        .unwrap();

        let probe_at = tx.next_timeout().expect("probe armed");
        tx.on_timeout(probe_at);
        let msg = tx.poll_transmit(probe_at).expect("probe message");
        let send_time = match msg {
            Message::Cmd(cmd) => match cmd.body {
                CmdBody::Cc { send_time, .. } => send_time,
                other => panic!("expected CC probe, got {other:?}"),
            },
            other => panic!("expected CMD, got {other:?}"),
        };
        assert_eq!(tx.stats.probes_sent, 1);

        // A receiver echoes the probe 0.2s later: GRTT grows to the RTT.
        let echo_at = probe_at + Duration::from_millis(200);
        let ack = AckMsg {
            sequence: 0,
            source_id: 2,
            server_id: 10,
            instance_id: 1,
            ack_type: AckType::Cc,
            ack_id: 0,
            grtt_response: send_time,
            cc_feedback: Some(crate::wire::CcFeedbackExt::default()),
            payload: AckPayload::None,
        };
        tx.handle_ack(&ack, echo_at);
        assert!(tx.grtt() > 0.15, "grtt tracks the observed rtt");
    }

    #[test]
    fn flow_control_rejects_when_queue_full() {
        let now = Instant::now();
        let mut tx = Sender::new(
            10,
            SenderConfig {
                tx_queue_max: 2,
                ..test_config()
            },
            now,
        )
        .unwrap();
        tx.enqueue_data(Bytes::from(vec![0u8; 64]), None).unwrap();
        tx.enqueue_data(Bytes::from(vec![0u8; 64]), None).unwrap();
        let err = tx
            .enqueue_data(Bytes::from(vec![0u8; 64]), None)
            .unwrap_err();
        assert_eq!(err, EnqueueError::QueueFull);
        assert_eq!(tx.stats.enqueue_rejected, 1);
    }

    #[test]
    fn passive_flush_after_queue_empty() {
        let now = Instant::now();
        let mut tx = Sender::new(10, test_config(), now).unwrap();
        tx.enqueue_data(Bytes::from(vec![0u8; 64]), None).unwrap();
        drain_all(&mut tx, now);

        let t = now + Duration::from_secs(1);
        tx.on_timeout(t);
        let msgs = drain_all(&mut tx, t);
        assert!(
            msgs.iter().any(|m| matches!(
                m,
                Message::Cmd(CmdMsg {
                    body: CmdBody::Flush { .. },
                    ..
                })
            )),
            "one flush after the queue drains"
        );
        tx.on_timeout(t + Duration::from_secs(1));
        let events: Vec<Event> = tx.drain_events().collect();
        assert!(events.iter().any(|e| matches!(e, Event::TxFlushCompleted)));
    }

    #[test]
    fn stream_write_and_emit() {
        let now = Instant::now();
        let mut tx = Sender::new(10, test_config(), now).unwrap();
        let id = tx.open_stream(1024, None, false).unwrap();

        // 64-byte segments leave 56 payload bytes; two messages with EOM.
        assert_eq!(tx.stream_write(id, &[1u8; 20], true), 20);
        assert_eq!(tx.stream_write(id, &[2u8; 10], true), 10);

        let msgs = drain_all(&mut tx, now);
        let datas: Vec<&DataMsg> = msgs
            .iter()
            .filter_map(|m| match m {
                Message::Data(d) => Some(d),
                _ => None,
            })
            .collect();
        assert_eq!(datas.len(), 2);
        assert!(datas[0].base.flags & object_flags::STREAM != 0);
        assert!(datas[0].base.flags & object_flags::MSG_START != 0);
        assert_eq!(
            datas[0].payload_id.symbol_id, 0,
            "stream symbols are sequential"
        );
        assert_eq!(datas[1].payload_id.symbol_id, 1);
    }

    #[test]
    fn cancel_object_purges() {
        let now = Instant::now();
        let mut tx = Sender::new(10, test_config(), now).unwrap();
        let id = tx.enqueue_data(Bytes::from(vec![0u8; 64]), None).unwrap();
        assert!(tx.cancel_object(id));
        assert!(!tx.cancel_object(id), "second cancel is a no-op");
        let events: Vec<Event> = tx.drain_events().collect();
        assert!(events.iter().any(|e| *e == Event::TxObjectPurged(id)));
        assert!(tx.poll_transmit(now).is_none(), "nothing left to send");
    }

    #[test]
    fn cache_bounds_hold_under_any_enqueue_sequence() {
        use proptest::prelude::*;
        let mut runner = proptest::test_runner::TestRunner::default();
        runner
            .run(
                &prop::collection::vec(1usize..=4096, 1..=48),
                |sizes| {
                    let now = Instant::now();
                    let bounds = TxCacheBounds {
                        count_min: 2,
                        count_max: 8,
                        size_max: 16 * 1024,
                    };
                    let mut tx = Sender::new(
                        10,
                        SenderConfig {
                            cache: bounds,
                            tx_queue_max: 1024,
                            ..test_config()
                        },
                        now,
                    )
                    .unwrap();
                    for (i, &size) in sizes.iter().enumerate() {
                        tx.enqueue_data(Bytes::from(vec![0u8; size]), None).unwrap();
                        // Ids are assigned sequentially from zero.
                        let live: Vec<u64> = (0..=i as u16)
                            .filter_map(|v| tx.object(ObjectId(v)).map(|o| o.size))
                            .collect();
                        let count = live.len();
                        let bytes: u64 = live.iter().sum();
                        prop_assert!(count <= bounds.count_max);
                        prop_assert!(
                            bytes <= bounds.size_max || count <= bounds.count_min,
                            "bytes {bytes} with {count} objects"
                        );
                    }
                    Ok(())
                },
            )
            .unwrap();
    }

    #[test]
    fn app_command_robust_repeats() {
        let now = Instant::now();
        let mut tx = Sender::new(
            10,
            SenderConfig {
                robust_factor: 3,
                ..test_config()
            },
            now,
        )
        .unwrap();
        tx.send_command(Bytes::from_static(b"cmd"), true);
        let msgs = drain_all(&mut tx, now);
        let cmds = msgs
            .iter()
            .filter(|m| {
                matches!(
                    m,
                    Message::Cmd(CmdMsg {
                        body: CmdBody::Application(_),
                        ..
                    })
                )
            })
            .count();
        assert_eq!(cmds, 3);
    }
}
