//! # Receiver Engine
//!
//! Pure logic — no I/O. One [`RemoteSender`] state machine per sender heard,
//! owning that sender's segment pool, object window, NACK backoff/suppression
//! cycle, and congestion feedback. The [`Receiver`] dispatches parsed
//! messages, collects outbound control messages, and queues events for the
//! application.
//!
//! ## NACK cycle
//!
//! ```text
//!   Idle ──gap detected──▶ Backoff(uniform 0..k·GRTT·ln(gsize))
//!                               │ timer expiry
//!                               ▼
//!                residual = pending & !overheard
//!               ├─ empty: suppress, back to Idle
//!               └─ else: emit NACK ──▶ Holdoff((k+1)·GRTT) ──▶ Idle
//! ```

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::Duration;

use quanta::Instant;
use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};
use tracing::{debug, trace, warn};

use crate::congestion::tcp_friendly_rate;
use crate::event::Event;
use crate::object::{FecParams, NackingMode, RxObject, RxOutcome, RxSink};
use crate::pool::SegmentPool;
use crate::quantize;
use crate::seq::{BlockId, ObjectId};
use crate::stats::ReceiverStats;
use crate::store::ObjectStore;
use crate::stream::RxStream;
use crate::wire::{
    cc_flags, object_flags, repair_flags, AckMsg, AckPayload, AckType, CcFeedbackExt, CmdBody,
    CmdMsg, DataMsg, EchoTime, InfoMsg, Message, NackMsg, PayloadId, RepairItem, RepairRequest,
    RequestForm,
};

// ─── Configuration ──────────────────────────────────────────────────────────

/// Which of a sender's past objects a newly-joining receiver recovers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncPolicy {
    /// Only objects first heard after joining.
    #[default]
    Current,
    /// Like `Current`, but a stream object rewinds to its earliest
    /// available data.
    Stream,
    /// Accept any object still visible in the sender's transmit cache.
    All,
}

/// Whether NACKs are held until an object boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RepairBoundary {
    #[default]
    Block,
    Object,
}

/// Receiver configuration.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Buffer space per remote sender, bytes.
    pub buffer_space: u64,
    pub sync_policy: SyncPolicy,
    pub repair_boundary: RepairBoundary,
    pub default_nacking_mode: NackingMode,
    /// Send NACKs to the sender's unicast address instead of the group.
    pub unicast_nacks: bool,
    /// Fully passive: no NACK/ACK traffic at all.
    pub silent: bool,
    /// Backoff scaling used before a sender advertises one.
    pub default_backoff_factor: f64,
    /// GRTT assumed before the first probe arrives.
    pub default_grtt: f64,
    /// Redundancy for control responses.
    pub robust_factor: u32,
    /// Maximum simultaneously tracked objects per sender.
    pub rx_cache_count_max: usize,
    /// Seed for the backoff jitter (tests pin this).
    pub rng_seed: Option<u64>,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        ReceiverConfig {
            buffer_space: 1024 * 1024,
            sync_policy: SyncPolicy::Current,
            repair_boundary: RepairBoundary::Block,
            default_nacking_mode: NackingMode::Normal,
            unicast_nacks: false,
            silent: false,
            default_backoff_factor: 4.0,
            default_grtt: 0.5,
            robust_factor: 20,
            rx_cache_count_max: 256,
            rng_seed: None,
        }
    }
}

// ─── Outgoing ───────────────────────────────────────────────────────────────

/// Where an outbound control message should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// The session's multicast group.
    Group,
    /// Unicast to the named remote sender.
    Sender(u32),
}

/// A control message the engine wants transmitted.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub message: Message,
    pub to: Destination,
}

// ─── Loss estimation ────────────────────────────────────────────────────────

/// Loss-event fraction from gaps in the sender's message sequence space.
#[derive(Debug, Default)]
struct LossEstimator {
    last_seq: Option<u16>,
    received: u64,
    lost: u64,
}

impl LossEstimator {
    fn on_sequence(&mut self, seq: u16) {
        if let Some(last) = self.last_seq {
            let delta = seq.wrapping_sub(last) as i16;
            if delta > 0 {
                self.lost += (delta as u64).saturating_sub(1);
                self.received += 1;
                self.last_seq = Some(seq);
            }
            // Reordered/duplicate messages refill earlier gaps.
            if delta < 0 && self.lost > 0 {
                self.lost -= 1;
                self.received += 1;
            }
        } else {
            self.last_seq = Some(seq);
            self.received = 1;
        }
    }

    fn fraction(&self) -> f64 {
        let total = self.received + self.lost;
        if total == 0 {
            0.0
        } else {
            self.lost as f64 / total as f64
        }
    }

    /// Age the history so the estimate tracks current conditions.
    fn decay(&mut self) {
        self.received /= 2;
        self.lost /= 2;
    }
}

// ─── NACK cycle state ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NackState {
    Idle,
    Backoff { fire_at: Instant },
    Holdoff { until: Instant },
}

// ─── RemoteSender ───────────────────────────────────────────────────────────

/// Everything tracked for one remote sender.
pub struct RemoteSender {
    pub node_id: u32,
    pub addr: SocketAddr,
    instance_id: Option<u16>,
    /// Learned from the sender's FTI / probes.
    params: Option<FecParams>,
    grtt: f64,
    backoff_factor: f64,
    gsize: f64,
    pool: Option<SegmentPool>,
    objects: HashMap<u16, RxObject>,
    /// Lower bound of interest in object-id space.
    sync_id: Option<ObjectId>,
    /// Ids below this are gone for good (evicted or completed-and-freed).
    low_water: ObjectId,
    /// One past the highest object id heard.
    next_expected: Option<ObjectId>,
    nack_state: NackState,
    /// Last GRTT probe heard: (cc_sequence, send_time, arrival).
    last_probe: Option<(u16, EchoTime, Instant)>,
    /// Our RTT as measured by the sender (seconds).
    rtt: Option<f64>,
    loss: LossEstimator,
    last_heard: Instant,
    active: bool,
    closing: bool,
    pub stats: ReceiverStats,
}

impl RemoteSender {
    fn new(node_id: u32, addr: SocketAddr, config: &ReceiverConfig, now: Instant) -> Self {
        RemoteSender {
            node_id,
            addr,
            instance_id: None,
            params: None,
            grtt: config.default_grtt,
            backoff_factor: config.default_backoff_factor,
            gsize: 10.0,
            pool: None,
            objects: HashMap::new(),
            sync_id: None,
            low_water: ObjectId(0),
            next_expected: None,
            nack_state: NackState::Idle,
            last_probe: None,
            rtt: None,
            loss: LossEstimator::default(),
            last_heard: now,
            active: true,
            closing: false,
            stats: ReceiverStats::default(),
        }
    }

    /// Advertised GRTT in seconds.
    pub fn grtt(&self) -> f64 {
        self.grtt
    }

    pub fn object(&self, id: ObjectId) -> Option<&RxObject> {
        self.objects.get(&id.value())
    }

    pub fn object_mut(&mut self, id: ObjectId) -> Option<&mut RxObject> {
        self.objects.get_mut(&id.value())
    }

    pub fn object_ids(&self) -> Vec<ObjectId> {
        let mut ids: Vec<ObjectId> = self.objects.keys().map(|&v| ObjectId(v)).collect();
        ids.sort_by(|a, b| a.compare(*b));
        ids
    }

    fn any_repair_needed(&self, boundary: RepairBoundary) -> bool {
        self.objects.values().any(|obj| {
            obj.needs_repair()
                && (boundary == RepairBoundary::Block || obj.end_heard || obj.is_placeholder())
        })
    }

    fn backoff_window(&self) -> f64 {
        let spread = self.gsize.max(std::f64::consts::E).ln();
        (self.backoff_factor * self.grtt * spread).max(1.0e-4)
    }

    fn holdoff_window(&self) -> f64 {
        ((self.backoff_factor + 1.0) * self.grtt).max(1.0e-3)
    }

    /// Echo of the latest probe's send time, advanced by our hold time.
    fn grtt_response(&self, now: Instant) -> EchoTime {
        match self.last_probe {
            Some((_, send_time, arrival)) => {
                let held = now.saturating_duration_since(arrival).as_secs_f64();
                EchoTime::from_seconds(send_time.as_seconds() + held)
            }
            None => EchoTime::default(),
        }
    }
}

// ─── Receiver ───────────────────────────────────────────────────────────────

/// The session's receive role: all remote senders plus outbound queues.
pub struct Receiver {
    config: ReceiverConfig,
    local_node_id: u32,
    senders: HashMap<u32, RemoteSender>,
    store: Box<dyn ObjectStore>,
    events: VecDeque<Event>,
    outputs: VecDeque<OutgoingMessage>,
    sequence: u16,
    rng: StdRng,
}

impl Receiver {
    pub fn new(local_node_id: u32, config: ReceiverConfig, store: Box<dyn ObjectStore>) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => rand::make_rng::<StdRng>(),
        };
        Receiver {
            config,
            local_node_id,
            senders: HashMap::new(),
            store,
            events: VecDeque::new(),
            outputs: VecDeque::new(),
            sequence: 0,
            rng,
        }
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = Event> + '_ {
        self.events.drain(..)
    }

    pub fn drain_outputs(&mut self) -> impl Iterator<Item = OutgoingMessage> + '_ {
        self.outputs.drain(..)
    }

    pub fn remote_sender(&self, node_id: u32) -> Option<&RemoteSender> {
        self.senders.get(&node_id)
    }

    pub fn remote_sender_mut(&mut self, node_id: u32) -> Option<&mut RemoteSender> {
        self.senders.get_mut(&node_id)
    }

    pub fn sender_ids(&self) -> Vec<u32> {
        self.senders.keys().copied().collect()
    }

    /// Free one remote sender's buffers entirely.
    pub fn purge_sender(&mut self, node_id: u32) {
        if let Some(mut sender) = self.senders.remove(&node_id) {
            if let Some(pool) = sender.pool.as_mut() {
                let ids: Vec<u16> = sender.objects.keys().copied().collect();
                for id in ids {
                    if let Some(mut obj) = sender.objects.remove(&id) {
                        obj.release(pool);
                    }
                }
            }
            self.events.push_back(Event::RemoteSenderPurged(node_id));
        }
    }

    // ─── Dispatch ───────────────────────────────────────────────────────

    /// Feed one parsed message into the receive state.
    pub fn handle_message(&mut self, msg: Message, from: SocketAddr, now: Instant) {
        match msg {
            Message::Info(info) => self.handle_info(info, from, now),
            Message::Data(data) => self.handle_data(data, from, now),
            Message::Cmd(cmd) => self.handle_cmd(cmd, from, now),
            // NACKs from peer receivers feed suppression.
            Message::Nack(nack) => self.handle_peer_nack(&nack),
            // Peer ACKs and reports carry nothing we act on.
            Message::Ack(_) | Message::Report(_) => {}
        }
    }

    /// Deadline of the nearest pending receiver timer.
    pub fn next_timeout(&self) -> Option<Instant> {
        self.senders
            .values()
            .filter_map(|s| match s.nack_state {
                NackState::Idle => None,
                NackState::Backoff { fire_at } => Some(fire_at),
                NackState::Holdoff { until } => Some(until),
            })
            .min()
    }

    /// Drive timers: NACK backoff expiry, holdoff completion, activity.
    pub fn on_timeout(&mut self, now: Instant) {
        let ids: Vec<u32> = self.senders.keys().copied().collect();
        for node_id in ids {
            self.drive_nack_cycle(node_id, now);
            self.check_activity(node_id, now);
        }
    }

    // ─── Sender message paths ───────────────────────────────────────────

    fn handle_info(&mut self, info: InfoMsg, from: SocketAddr, now: Instant) {
        let node_id = info.base.source_id;
        self.touch_sender(node_id, from, info.base.instance_id, info.base.sequence, now);
        let Some(object_id) = self.admit_object(node_id, info.base.object_id, &info.base, now)
        else {
            return;
        };
        let sender = self.senders.get_mut(&node_id).expect("touched");
        let Some(obj) = sender.objects.get_mut(&object_id.value()) else {
            return;
        };
        match obj.handle_info(info.info.clone()) {
            RxOutcome::Updated => {
                self.events.push_back(Event::RxObjectInfo {
                    sender_id: node_id,
                    object_id,
                    info: info.info,
                });
            }
            RxOutcome::Completed => {
                self.events.push_back(Event::RxObjectInfo {
                    sender_id: node_id,
                    object_id,
                    info: info.info,
                });
                self.events.push_back(Event::RxObjectCompleted {
                    sender_id: node_id,
                    object_id,
                });
                sender.stats.objects_completed += 1;
            }
            _ => {}
        }
    }

    fn handle_data(&mut self, data: DataMsg, from: SocketAddr, now: Instant) {
        let node_id = data.base.source_id;
        self.touch_sender(node_id, from, data.base.instance_id, data.base.sequence, now);
        let Some(object_id) = self.admit_object(node_id, data.base.object_id, &data.base, now)
        else {
            return;
        };

        let sender = self.senders.get_mut(&node_id).expect("touched");
        sender.stats.bytes_received += data.payload.len() as u64;

        let Some(pool) = sender.pool.as_mut() else {
            sender.stats.buffer_drops += 1;
            return;
        };
        let Some(obj) = sender.objects.get_mut(&object_id.value()) else {
            return;
        };
        let outcome = obj.handle_data(data.payload_id, &data.payload, pool, &mut sender.stats);
        match outcome {
            RxOutcome::Updated => {
                self.events.push_back(Event::RxObjectUpdated {
                    sender_id: node_id,
                    object_id,
                });
                self.maybe_start_nack_cycle(node_id, now);
            }
            RxOutcome::Completed => {
                self.events.push_back(Event::RxObjectUpdated {
                    sender_id: node_id,
                    object_id,
                });
                self.events.push_back(Event::RxObjectCompleted {
                    sender_id: node_id,
                    object_id,
                });
                sender.stats.objects_completed += 1;
            }
            RxOutcome::Abort => {
                self.abort_object(node_id, object_id);
            }
            RxOutcome::Duplicate | RxOutcome::Dropped => {
                self.maybe_start_nack_cycle(node_id, now);
            }
        }
    }

    fn handle_cmd(&mut self, cmd: CmdMsg, from: SocketAddr, now: Instant) {
        let node_id = cmd.source_id;
        self.touch_sender(node_id, from, cmd.instance_id, cmd.sequence, now);
        let sender = self.senders.get_mut(&node_id).expect("touched");

        // Every command refreshes the timing parameters.
        sender.grtt = quantize::unquantize_rtt(cmd.grtt_q);
        sender.backoff_factor = cmd.backoff as f64;
        sender.gsize = quantize::unquantize_group_size(cmd.gsize_q);

        match cmd.body {
            CmdBody::Cc {
                cc_sequence,
                send_time,
                feedback,
                ..
            } => {
                sender.last_probe = Some((cc_sequence, send_time, now));
                for fb in &feedback {
                    if fb.node_id == self.local_node_id && fb.flags & cc_flags::RTT != 0 {
                        sender.rtt = Some(quantize::unquantize_rtt(fb.rtt_q));
                    }
                }
                sender.loss.decay();
                if !self.config.silent {
                    self.send_cc_feedback(node_id, cc_sequence, now);
                }
                self.events.push_back(Event::GrttUpdated(
                    self.senders[&node_id].grtt,
                ));
            }
            CmdBody::Flush {
                object_id,
                payload_id,
                acking_nodes,
                ..
            } => {
                self.mark_end_heard(node_id, object_id, payload_id);
                let watermark_ack = acking_nodes.contains(&self.local_node_id);
                if watermark_ack && !self.config.silent {
                    self.answer_watermark(node_id, object_id, payload_id, now);
                } else {
                    self.maybe_start_nack_cycle(node_id, now);
                }
            }
            CmdBody::Squelch {
                object_id,
                stale_objects,
                ..
            } => {
                self.apply_squelch(node_id, object_id, &stale_objects);
            }
            CmdBody::Eot => {
                if let Some(sender) = self.senders.get_mut(&node_id) {
                    sender.closing = true;
                    let ids: Vec<u16> = sender.objects.keys().copied().collect();
                    for id in ids {
                        if let Some(obj) = sender.objects.get_mut(&id) {
                            obj.end_heard = true;
                        }
                    }
                }
                self.maybe_start_nack_cycle(node_id, now);
            }
            CmdBody::RepairAdv { requests, .. } => {
                self.note_peer_requests(node_id, &requests);
            }
            CmdBody::AckReq {
                ack_type: AckType::App(code),
                ack_id,
                ..
            } => {
                let _ = code;
                self.events.push_back(Event::RxAckRequest {
                    sender_id: node_id,
                    ack_id,
                });
            }
            CmdBody::AckReq { .. } => {}
            CmdBody::Application(data) => {
                self.events.push_back(Event::RxCmdNew {
                    sender_id: node_id,
                    data,
                });
            }
        }
    }

    // ─── Sender bookkeeping ─────────────────────────────────────────────

    fn touch_sender(
        &mut self,
        node_id: u32,
        from: SocketAddr,
        instance_id: u16,
        sequence: u16,
        now: Instant,
    ) {
        let is_new = !self.senders.contains_key(&node_id);
        if is_new {
            self.senders.insert(
                node_id,
                RemoteSender::new(node_id, from, &self.config, now),
            );
            self.events.push_back(Event::RemoteSenderNew(node_id));
            debug!(node_id, %from, "new remote sender");
        }
        let sender = self.senders.get_mut(&node_id).expect("inserted");
        sender.stats.messages_received += 1;
        sender.loss.on_sequence(sequence);
        sender.last_heard = now;
        if !sender.active {
            sender.active = true;
            self.events.push_back(Event::RemoteSenderActive(node_id));
        }
        let sender = self.senders.get_mut(&node_id).expect("inserted");
        if sender.addr != from {
            sender.addr = from;
            self.events.push_back(Event::RemoteSenderAddress(node_id));
        }
        match sender.instance_id {
            None => sender.instance_id = Some(instance_id),
            Some(current) if current != instance_id => {
                // The sender restarted: drop everything and resync.
                sender.instance_id = Some(instance_id);
                let ids: Vec<u16> = sender.objects.keys().copied().collect();
                if let Some(pool) = sender.pool.as_mut() {
                    for id in ids {
                        if let Some(mut obj) = sender.objects.remove(&id) {
                            obj.release(pool);
                        }
                    }
                } else {
                    sender.objects.clear();
                }
                sender.sync_id = None;
                sender.next_expected = None;
                sender.nack_state = NackState::Idle;
                self.events.push_back(Event::RemoteSenderReset(node_id));
            }
            _ => {}
        }
    }

    /// Admit an object id into the window, creating placeholders for any gap
    /// and activating the object when its parameters are known. Returns
    /// `None` when the id is outside our interest.
    fn admit_object(
        &mut self,
        node_id: u32,
        object_id: ObjectId,
        base: &crate::wire::ObjectMsgBase,
        now: Instant,
    ) -> Option<ObjectId> {
        let boundary_gap = self.config.rx_cache_count_max as i16;
        let sender = self.senders.get_mut(&node_id)?;

        // First traffic decides the sync point.
        if sender.sync_id.is_none() {
            let sync = match self.config.sync_policy {
                SyncPolicy::Current | SyncPolicy::Stream => object_id,
                // ALL: reach back as far as our cache allows; the sender's
                // squelch will trim whatever is already gone.
                SyncPolicy::All => {
                    ObjectId(object_id.value().wrapping_sub(boundary_gap as u16 / 2))
                }
            };
            sender.sync_id = Some(sync);
            sender.low_water = sync;
            sender.next_expected = Some(object_id);
        }
        let sync_id = sender.sync_id.expect("set above");
        if object_id.compare(sync_id).is_lt() || object_id.compare(sender.low_water).is_lt() {
            return None; // stale traffic from before we joined
        }

        // Fill the gap up to this object with placeholders so the NACK
        // builder knows what is missing.
        let next = sender.next_expected.unwrap_or(object_id);
        if object_id.compare(next).is_ge() {
            let gap = object_id.diff(next);
            if gap > boundary_gap {
                // Far jump: resync rather than materializing thousands of
                // placeholders.
                warn!(node_id, gap, "object id jump, resyncing");
                sender.sync_id = Some(object_id);
                sender.low_water = object_id;
            } else {
                let mut id = next;
                while id.compare(object_id).is_lt() {
                    sender
                        .objects
                        .entry(id.value())
                        .or_insert_with(|| RxObject::placeholder(id, self.config.default_nacking_mode));
                    id = id.next();
                }
                // Earlier objects are now known to be fully transmitted.
                for (&v, obj) in sender.objects.iter_mut() {
                    if ObjectId(v).compare(object_id).is_lt() {
                        obj.end_heard = true;
                    }
                }
            }
            sender.next_expected = Some(object_id.next());
        }

        let is_new = !sender.objects.contains_key(&object_id.value());
        let obj = sender
            .objects
            .entry(object_id.value())
            .or_insert_with(|| RxObject::placeholder(object_id, self.config.default_nacking_mode));

        // Activate once the FTI tells us the geometry.
        if obj.is_placeholder() {
            if let Some(fti) = base.fti {
                let params = FecParams {
                    segment_size: fti.segment_size,
                    ndata: fti.ndata,
                    nparity: fti.nparity,
                    fec_id: base.fec_id,
                };
                if PayloadId::encoded_len(base.fec_id).is_none() {
                    sender.stats.parse_errors += 1;
                    return None;
                }
                sender.params = Some(params);
                if sender.pool.is_none() {
                    let count =
                        (self.config.buffer_space / params.segment_size.max(1) as u64).max(16);
                    sender.pool = Some(SegmentPool::new(count as usize, params.segment_size as usize));
                }
                let has_info = base.flags & object_flags::INFO != 0;
                let mut nacking = self.config.default_nacking_mode;
                if base.flags & object_flags::UNRELIABLE != 0 {
                    nacking = NackingMode::None;
                }
                let window =
                    (self.config.buffer_space / params.block_bytes().max(1)).clamp(2, 1 << 20) as u32;
                let sink = if base.flags & object_flags::STREAM != 0 {
                    let ring = (self.config.buffer_space / params.segment_size.max(1) as u64 / 2)
                        .clamp(4, 1 << 16) as usize;
                    RxSink::Stream(RxStream::new(ring))
                } else if base.flags & object_flags::FILE != 0 {
                    let path = format!("norm_rx_{:08x}_{}", node_id, object_id.value());
                    match self.store.open_write(&path) {
                        Ok(file) => RxSink::File(file),
                        Err(err) => {
                            warn!(node_id, %err, "rx file open failed");
                            RxSink::Discard
                        }
                    }
                } else {
                    RxSink::Data(Vec::with_capacity(fti.object_size.min(1 << 20) as usize))
                };
                if obj
                    .activate(params, fti.object_size, has_info, sink, window)
                    .is_err()
                {
                    sender.stats.parse_errors += 1;
                    return None;
                }
                obj.nacking_mode = nacking;
                self.events.push_back(Event::RxObjectNew {
                    sender_id: node_id,
                    object_id,
                });
            } else if is_new {
                // No FTI yet: keep the placeholder and let NACKs ask for it.
                trace!(node_id, object = %object_id, "object without FTI held as placeholder");
            }
        }

        self.enforce_cache_limit(node_id);
        let _ = now;
        Some(object_id)
    }

    fn enforce_cache_limit(&mut self, node_id: u32) {
        let max = self.config.rx_cache_count_max.max(1);
        loop {
            let sender = match self.senders.get_mut(&node_id) {
                Some(s) => s,
                None => return,
            };
            if sender.objects.len() <= max {
                return;
            }
            // Evict the oldest object.
            let oldest = sender
                .objects
                .keys()
                .map(|&v| ObjectId(v))
                .min_by(|a, b| a.compare(*b))
                .expect("non-empty");
            let was_complete = sender
                .objects
                .get(&oldest.value())
                .is_some_and(|o| o.is_complete());
            if let Some(mut obj) = sender.objects.remove(&oldest.value()) {
                if let Some(pool) = sender.pool.as_mut() {
                    obj.release(pool);
                }
            }
            if oldest.compare(sender.low_water).is_ge() {
                sender.low_water = oldest.next();
            }
            if !was_complete {
                sender.stats.objects_aborted += 1;
                self.events.push_back(Event::RxObjectAborted {
                    sender_id: node_id,
                    object_id: oldest,
                });
            }
        }
    }

    fn abort_object(&mut self, node_id: u32, object_id: ObjectId) {
        if let Some(sender) = self.senders.get_mut(&node_id) {
            if let Some(mut obj) = sender.objects.remove(&object_id.value()) {
                if let Some(pool) = sender.pool.as_mut() {
                    obj.release(pool);
                }
                if object_id.compare(sender.low_water).is_ge() {
                    sender.low_water = object_id.next();
                }
                sender.stats.objects_aborted += 1;
                self.events.push_back(Event::RxObjectAborted {
                    sender_id: node_id,
                    object_id,
                });
            }
        }
    }

    fn mark_end_heard(&mut self, node_id: u32, through: ObjectId, point: PayloadId) {
        if let Some(sender) = self.senders.get_mut(&node_id) {
            for (&v, obj) in sender.objects.iter_mut() {
                if ObjectId(v).compare(through).is_lt() {
                    obj.end_heard = true;
                } else if v == through.value() {
                    if obj.is_stream() {
                        // A stream's flush point only advances the repair
                        // frontier; the block may still be filling.
                        obj.note_flush_point(point.block_id.value(), point.symbol_id);
                    } else {
                        obj.end_heard = true;
                    }
                }
            }
        }
    }

    fn apply_squelch(&mut self, node_id: u32, earliest: ObjectId, stale: &[ObjectId]) {
        let to_abort: Vec<ObjectId> = {
            let Some(sender) = self.senders.get_mut(&node_id) else {
                return;
            };
            sender
                .objects
                .keys()
                .map(|&v| ObjectId(v))
                .filter(|id| {
                    id.compare(earliest).is_lt() || stale.iter().any(|s| s == id)
                })
                .collect()
        };
        for id in to_abort {
            self.abort_object(node_id, id);
        }
        if let Some(sender) = self.senders.get_mut(&node_id) {
            if earliest.compare(sender.low_water).is_gt() {
                sender.low_water = earliest;
            }
            if sender
                .sync_id
                .map_or(true, |s| earliest.compare(s).is_gt())
            {
                sender.sync_id = Some(earliest);
            }
        }
    }

    fn check_activity(&mut self, node_id: u32, now: Instant) {
        let Some(sender) = self.senders.get_mut(&node_id) else {
            return;
        };
        let timeout = (sender.grtt * self.config.robust_factor as f64).max(5.0);
        if sender.active
            && now.saturating_duration_since(sender.last_heard) > Duration::from_secs_f64(timeout)
        {
            sender.active = false;
            self.events.push_back(Event::RemoteSenderInactive(node_id));
        }
    }

    // ─── NACK construction ──────────────────────────────────────────────

    fn maybe_start_nack_cycle(&mut self, node_id: u32, now: Instant) {
        if self.config.silent {
            return;
        }
        let boundary = self.config.repair_boundary;
        let Some(sender) = self.senders.get_mut(&node_id) else {
            return;
        };
        if sender.nack_state != NackState::Idle || !sender.any_repair_needed(boundary) {
            return;
        }
        let window = sender.backoff_window();
        let delay = self.rng.random_range(0.0..window);
        let fire_at = now + Duration::from_secs_f64(delay);
        sender.nack_state = NackState::Backoff { fire_at };
        trace!(node_id, delay, "nack backoff armed");
    }

    fn drive_nack_cycle(&mut self, node_id: u32, now: Instant) {
        let boundary = self.config.repair_boundary;
        let state = match self.senders.get(&node_id) {
            Some(s) => s.nack_state,
            None => return,
        };
        match state {
            NackState::Idle => {
                // A gap may be sitting without a timer (e.g. events drained).
                self.maybe_start_nack_cycle(node_id, now);
            }
            NackState::Backoff { fire_at } if now >= fire_at => {
                let requests = self.build_requests(node_id, boundary);
                let sender = self.senders.get_mut(&node_id).expect("present");
                if requests.is_empty() {
                    sender.stats.nacks_suppressed += 1;
                    sender.nack_state = NackState::Idle;
                    for obj in sender.objects.values_mut() {
                        obj.clear_repair_round();
                    }
                    return;
                }
                let nack = NackMsg {
                    sequence: self.sequence,
                    source_id: self.local_node_id,
                    server_id: node_id,
                    instance_id: sender.instance_id.unwrap_or(0),
                    grtt_response: sender.grtt_response(now),
                    requests,
                };
                self.sequence = self.sequence.wrapping_add(1);
                sender.stats.nacks_sent += 1;
                let holdoff = sender.holdoff_window();
                sender.nack_state = NackState::Holdoff {
                    until: now + Duration::from_secs_f64(holdoff),
                };
                for obj in sender.objects.values_mut() {
                    obj.clear_repair_round();
                }
                let to = if self.config.unicast_nacks {
                    Destination::Sender(node_id)
                } else {
                    Destination::Group
                };
                self.outputs.push_back(OutgoingMessage {
                    message: Message::Nack(nack),
                    to,
                });
            }
            NackState::Holdoff { until } if now >= until => {
                let sender = self.senders.get_mut(&node_id).expect("present");
                sender.nack_state = NackState::Idle;
                self.maybe_start_nack_cycle(node_id, now);
            }
            _ => {}
        }
    }

    /// Build this sender's repair requests from residual (unsuppressed) need.
    fn build_requests(&mut self, node_id: u32, boundary: RepairBoundary) -> Vec<RepairRequest> {
        let Some(sender) = self.senders.get_mut(&node_id) else {
            return Vec::new();
        };
        let Some(params) = sender.params else {
            return Vec::new(); // nothing heard yet that we can name
        };
        let fec_id = params.fec_id;
        let mut requests = Vec::new();

        // Whole objects we have only heard *of*.
        let mut missing_objects: Vec<ObjectId> = sender
            .objects
            .values()
            .filter(|o| o.is_placeholder() && !o.peer_requested)
            .map(|o| o.id)
            .collect();
        missing_objects.sort_by(|a, b| a.compare(*b));
        push_coalesced(
            &mut requests,
            fec_id,
            repair_flags::OBJECT | repair_flags::INFO,
            &missing_objects
                .iter()
                .map(|&id| (id, PayloadId::new(BlockId(0), 0, params.ndata)))
                .collect::<Vec<_>>(),
        );

        let mut object_ids: Vec<ObjectId> = sender
            .objects
            .values()
            .filter(|o| o.needs_repair() && !o.is_placeholder())
            .filter(|o| {
                boundary == RepairBoundary::Block || o.end_heard
            })
            .map(|o| o.id)
            .collect();
        object_ids.sort_by(|a, b| a.compare(*b));

        for object_id in object_ids {
            let obj = sender.objects.get(&object_id.value()).expect("listed");

            // INFO first.
            if obj.has_info && obj.info.is_none() && !obj.peer_requested {
                requests.push(RepairRequest {
                    form: RequestForm::Items,
                    flags: repair_flags::INFO,
                    items: vec![RepairItem {
                        fec_id,
                        object_id,
                        payload_id: PayloadId::new(BlockId(0), 0, params.ndata),
                    }],
                });
            }
            if obj.nacking_mode != NackingMode::Normal {
                continue;
            }

            let Some((max_block, max_sym)) = obj.max_heard() else {
                continue;
            };
            let scope = obj.repair_scope();

            // Blocks never heard at all.
            let unheard: Vec<(ObjectId, PayloadId)> = scope
                .iter()
                .filter(|(b, live)| !live && BlockId(*b).compare(BlockId(max_block)).is_lt())
                .map(|(b, _)| {
                    (
                        object_id,
                        PayloadId::new(BlockId(*b), 0, params.ndata),
                    )
                })
                .collect();
            push_coalesced(&mut requests, fec_id, repair_flags::BLOCK, &unheard);

            // Blocks with live state.
            for (b, live) in scope {
                if !live {
                    continue;
                }
                let Some(block) = obj.block(BlockId(b)) else {
                    continue;
                };
                if block.is_decodable() {
                    continue;
                }
                if BlockId(b).compare(BlockId(max_block)).is_lt() || obj.end_heard {
                    // Past blocks: erasure-count request.
                    let needed = block.repair_needed();
                    if needed == 0 || block.repair_suppressed(needed) {
                        continue;
                    }
                    requests.push(RepairRequest {
                        form: RequestForm::Erasures,
                        flags: repair_flags::SEGMENT,
                        items: vec![RepairItem {
                            fec_id,
                            object_id,
                            payload_id: PayloadId::new(BlockId(b), needed, block.block_len()),
                        }],
                    });
                    let overflow = needed.saturating_sub(params.nparity);
                    if overflow > 0 {
                        let items: Vec<RepairItem> = block
                            .missing_source()
                            .into_iter()
                            .take(overflow as usize)
                            .map(|sym| RepairItem {
                                fec_id,
                                object_id,
                                payload_id: PayloadId::new(BlockId(b), sym, block.block_len()),
                            })
                            .collect();
                        if !items.is_empty() {
                            requests.push(RepairRequest {
                                form: RequestForm::Items,
                                flags: repair_flags::SEGMENT,
                                items,
                            });
                        }
                    }
                } else {
                    // The block currently being transmitted: only symbols we
                    // should already have seen, minus what peers asked for.
                    let missing: Vec<u16> = block
                        .missing_source()
                        .into_iter()
                        .filter(|&sym| sym < max_sym && !block.symbol_overheard(sym))
                        .collect();
                    if missing.is_empty()
                        || block.overheard_erasure_count() as usize >= missing.len()
                    {
                        continue;
                    }
                    let items: Vec<RepairItem> = missing
                        .into_iter()
                        .map(|sym| RepairItem {
                            fec_id,
                            object_id,
                            payload_id: PayloadId::new(BlockId(b), sym, block.block_len()),
                        })
                        .collect();
                    requests.push(RepairRequest {
                        form: RequestForm::Items,
                        flags: repair_flags::SEGMENT,
                        items,
                    });
                }
            }
        }
        requests
    }

    /// Fold a peer's (or the sender's advertised) repair requests into our
    /// suppression state.
    fn handle_peer_nack(&mut self, nack: &NackMsg) {
        if nack.source_id == self.local_node_id {
            return;
        }
        self.note_peer_requests(nack.server_id, &nack.requests);
    }

    fn note_peer_requests(&mut self, node_id: u32, requests: &[RepairRequest]) {
        let Some(sender) = self.senders.get_mut(&node_id) else {
            return;
        };
        for req in requests {
            if req.form == RequestForm::Ranges {
                for pair in req.items.chunks_exact(2) {
                    let (start, end) = (&pair[0], &pair[1]);
                    if req.flags & repair_flags::OBJECT != 0 {
                        let mut id = start.object_id;
                        loop {
                            if let Some(obj) = sender.objects.get_mut(&id.value()) {
                                obj.peer_requested = true;
                            }
                            if id == end.object_id {
                                break;
                            }
                            id = id.next();
                        }
                    } else if req.flags & repair_flags::BLOCK != 0 {
                        if let Some(obj) = sender.objects.get_mut(&start.object_id.value()) {
                            let mut b = start.payload_id.block_id;
                            loop {
                                if let Some(block) = obj.block_mut(b) {
                                    let len = block.block_len();
                                    block.overheard_erasures(len);
                                }
                                if b == end.payload_id.block_id {
                                    break;
                                }
                                b = b.next();
                            }
                        }
                    }
                }
                continue;
            }
            for item in &req.items {
                let Some(obj) = sender.objects.get_mut(&item.object_id.value()) else {
                    continue;
                };
                if req.flags & repair_flags::OBJECT != 0 {
                    obj.peer_requested = true;
                } else if req.flags & repair_flags::BLOCK != 0 {
                    if let Some(block) = obj.block_mut(item.payload_id.block_id) {
                        let len = block.block_len();
                        block.overheard_erasures(len);
                    }
                } else if req.form == RequestForm::Erasures {
                    if let Some(block) = obj.block_mut(item.payload_id.block_id) {
                        block.overheard_erasures(item.payload_id.symbol_id);
                    }
                } else if req.flags & repair_flags::INFO != 0 {
                    obj.peer_requested = true;
                } else if let Some(block) = obj.block_mut(item.payload_id.block_id) {
                    block.overheard_symbol(item.payload_id.symbol_id);
                }
            }
        }
    }

    // ─── Feedback ───────────────────────────────────────────────────────

    fn send_cc_feedback(&mut self, node_id: u32, cc_sequence: u16, now: Instant) {
        let sender = match self.senders.get(&node_id) {
            Some(s) => s,
            None => return,
        };
        let rtt = sender.rtt.unwrap_or(sender.grtt);
        let loss = sender.loss.fraction();
        let seg = sender
            .params
            .map(|p| p.segment_size as f64)
            .unwrap_or(1024.0);
        // Advertise the rate we could sustain at our measured (rtt, loss).
        let rate = if loss > 0.0 {
            tcp_friendly_rate(seg, rtt, loss)
        } else {
            0.0
        };
        let mut flags = 0u8;
        if sender.rtt.is_some() {
            flags |= cc_flags::RTT;
        }
        let ack = AckMsg {
            sequence: self.sequence,
            source_id: self.local_node_id,
            server_id: node_id,
            instance_id: sender.instance_id.unwrap_or(0),
            ack_type: AckType::Cc,
            ack_id: 0,
            grtt_response: sender.grtt_response(now),
            cc_feedback: Some(CcFeedbackExt {
                flags,
                rtt_q: quantize::quantize_rtt(rtt),
                loss_q: quantize::quantize_loss(loss),
                rate_q: quantize::quantize_rate(rate),
                cc_sequence,
            }),
            payload: AckPayload::None,
        };
        self.sequence = self.sequence.wrapping_add(1);
        self.outputs.push_back(OutgoingMessage {
            message: Message::Ack(ack),
            to: Destination::Sender(node_id),
        });
    }

    /// Application-extended acknowledgment back to a remote sender.
    pub fn send_app_ack(&mut self, node_id: u32, ack_id: u8, data: bytes::Bytes) -> bool {
        if self.config.silent {
            return false;
        }
        let Some(sender) = self.senders.get(&node_id) else {
            return false;
        };
        let ack = AckMsg {
            sequence: self.sequence,
            source_id: self.local_node_id,
            server_id: node_id,
            instance_id: sender.instance_id.unwrap_or(0),
            ack_type: AckType::App(16),
            ack_id,
            grtt_response: EchoTime::default(),
            cc_feedback: None,
            payload: AckPayload::App(data),
        };
        self.sequence = self.sequence.wrapping_add(1);
        self.outputs.push_back(OutgoingMessage {
            message: Message::Ack(ack),
            to: Destination::Sender(node_id),
        });
        true
    }

    fn answer_watermark(
        &mut self,
        node_id: u32,
        object_id: ObjectId,
        payload_id: PayloadId,
        now: Instant,
    ) {
        if self.watermark_satisfied(node_id, object_id, payload_id) {
            let sender = self.senders.get(&node_id).expect("present");
            let fec_id = sender.params.map(|p| p.fec_id).unwrap_or(crate::wire::FEC_ID_RS8);
            let ack = AckMsg {
                sequence: self.sequence,
                source_id: self.local_node_id,
                server_id: node_id,
                instance_id: sender.instance_id.unwrap_or(0),
                ack_type: AckType::Watermark,
                ack_id: 0,
                grtt_response: sender.grtt_response(now),
                cc_feedback: None,
                payload: AckPayload::Watermark(crate::wire::WatermarkId {
                    fec_id,
                    object_id,
                    payload_id,
                }),
            };
            self.sequence = self.sequence.wrapping_add(1);
            self.outputs.push_back(OutgoingMessage {
                message: Message::Ack(ack),
                to: Destination::Sender(node_id),
            });
        } else {
            self.maybe_start_nack_cycle(node_id, now);
        }
    }

    fn watermark_satisfied(&self, node_id: u32, object_id: ObjectId, payload_id: PayloadId) -> bool {
        let Some(sender) = self.senders.get(&node_id) else {
            return false;
        };
        // Nothing heard yet: the watermark point cannot be ours to confirm.
        if sender.sync_id.is_none() {
            return false;
        }
        if sender.objects.get(&object_id.value()).is_none() {
            // Unknown watermark object: satisfied only if it predates our
            // window (long since freed), never if it lies ahead of what we
            // have heard.
            let heard = sender
                .next_expected
                .is_some_and(|next| object_id.compare(next).is_lt());
            if !heard {
                return false;
            }
        }
        for obj in sender.objects.values() {
            if obj.is_placeholder() && obj.id.compare(object_id).is_le() {
                return false;
            }
            match obj.id.compare(object_id) {
                std::cmp::Ordering::Less => {
                    if !obj.is_complete() && obj.needs_repair() {
                        return false;
                    }
                }
                std::cmp::Ordering::Equal => {
                    if obj.is_complete() {
                        continue;
                    }
                    if obj.is_stream() {
                        // Streams never "complete"; the watermark block must
                        // be fully delivered.
                        let done = obj.block(payload_id.block_id).is_none()
                            && obj
                                .max_heard()
                                .is_some_and(|(b, _)| {
                                    BlockId(b).compare(payload_id.block_id).is_ge()
                                });
                        if !done {
                            return false;
                        }
                    } else {
                        return false;
                    }
                }
                std::cmp::Ordering::Greater => {}
            }
        }
        true
    }
}

/// Coalesce an ascending coordinate list into ITEMS (runs of 1-2) and RANGES
/// (runs of 3+) records. Never mixes forms within a record.
fn push_coalesced(
    requests: &mut Vec<RepairRequest>,
    fec_id: u8,
    flags: u8,
    coords: &[(ObjectId, PayloadId)],
) {
    if coords.is_empty() {
        return;
    }
    let consecutive = |a: &(ObjectId, PayloadId), b: &(ObjectId, PayloadId)| {
        if flags & repair_flags::OBJECT != 0 {
            b.0 == a.0.next()
        } else {
            b.0 == a.0 && b.1.block_id == a.1.block_id.next()
        }
    };

    let mut items_form: Vec<RepairItem> = Vec::new();
    let mut run_start = 0usize;
    let flush_run = |requests: &mut Vec<RepairRequest>,
                     items_form: &mut Vec<RepairItem>,
                     run: &[(ObjectId, PayloadId)]| {
        if run.len() >= 3 {
            let make = |c: &(ObjectId, PayloadId)| RepairItem {
                fec_id,
                object_id: c.0,
                payload_id: c.1,
            };
            requests.push(RepairRequest {
                form: RequestForm::Ranges,
                flags,
                items: vec![make(&run[0]), make(run.last().expect("non-empty"))],
            });
        } else {
            for c in run {
                items_form.push(RepairItem {
                    fec_id,
                    object_id: c.0,
                    payload_id: c.1,
                });
            }
        }
    };

    for i in 1..=coords.len() {
        let run_over = i == coords.len() || !consecutive(&coords[i - 1], &coords[i]);
        if run_over {
            flush_run(requests, &mut items_form, &coords[run_start..i]);
            run_start = i;
        }
    }
    if !items_form.is_empty() {
        requests.push(RepairRequest {
            form: RequestForm::Items,
            flags,
            items: items_form,
        });
    }
}
