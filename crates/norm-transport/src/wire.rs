//! # NORM Wire Format
//!
//! Pack/unpack for every NORM message type. All multi-byte fields are network
//! byte order; `hdr_len` counts 32-bit words.
//!
//! ## Common Header (8 bytes)
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=1 | Type  |    hdr_len    |           sequence            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                          source_id                            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Header extensions chain after each message's base header up to
//! `hdr_len * 4` bytes; parsers skip unknown extension types. The FEC payload
//! id for block/symbol coordinates is parameterized by `fec_id`: 8 bytes for
//! id 5, 4 bytes for the 8-bit small-block variant (id 129).

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::seq::{BlockId, ObjectId};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Every message starts with the 8-byte common header.
pub const COMMON_HEADER_LEN: usize = 8;

/// RFC 5510 fully-specified Reed-Solomon GF(2^8) scheme.
pub const FEC_ID_RS8: u8 = 5;

/// 8-bit "small block" systematic variant.
pub const FEC_ID_SB8: u8 = 129;

// ─── Message Type ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    Info = 1,
    Data = 2,
    Cmd = 3,
    Nack = 4,
    Ack = 5,
    Report = 6,
}

impl MsgType {
    pub fn from_nibble(b: u8) -> Option<Self> {
        match b {
            1 => Some(MsgType::Info),
            2 => Some(MsgType::Data),
            3 => Some(MsgType::Cmd),
            4 => Some(MsgType::Nack),
            5 => Some(MsgType::Ack),
            6 => Some(MsgType::Report),
            _ => None,
        }
    }
}

// ─── Object Flags ────────────────────────────────────────────────────────────

/// Flag bits carried in the INFO/DATA `flags` byte.
pub mod object_flags {
    /// This DATA message is a repair transmission.
    pub const REPAIR: u8 = 0x01;
    /// Explicit source repair (not first-pass transmission).
    pub const EXPLICIT: u8 = 0x02;
    /// The object has an INFO blob.
    pub const INFO: u8 = 0x04;
    /// Best-effort object: receivers do not NACK for it.
    pub const UNRELIABLE: u8 = 0x08;
    /// FILE object.
    pub const FILE: u8 = 0x10;
    /// STREAM object.
    pub const STREAM: u8 = 0x20;
    /// Stream segment begins an application message.
    pub const MSG_START: u8 = 0x40;
}

// ─── FEC Payload Id ──────────────────────────────────────────────────────────

/// Block/symbol coordinates of a DATA segment (or FLUSH/SQUELCH/watermark
/// point). The wire layout depends on `fec_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PayloadId {
    pub block_id: BlockId,
    pub symbol_id: u16,
    pub block_len: u16,
}

impl PayloadId {
    pub fn new(block_id: BlockId, symbol_id: u16, block_len: u16) -> Self {
        PayloadId {
            block_id,
            symbol_id,
            block_len,
        }
    }

    /// Wire length of the payload id for a given `fec_id`, or `None` for an
    /// unsupported scheme.
    pub fn encoded_len(fec_id: u8) -> Option<usize> {
        match fec_id {
            FEC_ID_RS8 => Some(8),
            FEC_ID_SB8 => Some(4),
            _ => None,
        }
    }

    pub fn encode(&self, fec_id: u8, buf: &mut BytesMut) {
        match fec_id {
            FEC_ID_RS8 => {
                // block_id:24 | symbol_id:8, then block_len, then reserved.
                buf.put_u32((self.block_id.value() << 8) | (self.symbol_id as u32 & 0xFF));
                buf.put_u16(self.block_len);
                buf.put_u16(0);
            }
            FEC_ID_SB8 => {
                buf.put_u16(self.block_id.value() as u16);
                buf.put_u8(self.block_len as u8);
                buf.put_u8(self.symbol_id as u8);
            }
            _ => unreachable!("unsupported fec_id {fec_id} must be rejected before encode"),
        }
    }

    pub fn decode(fec_id: u8, buf: &mut impl Buf) -> Option<Self> {
        let len = Self::encoded_len(fec_id)?;
        if buf.remaining() < len {
            return None;
        }
        match fec_id {
            FEC_ID_RS8 => {
                let w0 = buf.get_u32();
                let block_len = buf.get_u16();
                let _reserved = buf.get_u16();
                Some(PayloadId {
                    block_id: BlockId(w0 >> 8),
                    symbol_id: (w0 & 0xFF) as u16,
                    block_len,
                })
            }
            FEC_ID_SB8 => {
                let block_id = buf.get_u16() as u32;
                let block_len = buf.get_u8() as u16;
                let symbol_id = buf.get_u8() as u16;
                Some(PayloadId {
                    block_id: BlockId(block_id),
                    symbol_id,
                    block_len,
                })
            }
            _ => None,
        }
    }
}

// ─── Header Extensions ───────────────────────────────────────────────────────

/// Extension type codes. Types >= 128 are fixed single-word extensions;
/// lower types carry an explicit length byte (in words).
pub mod ext_type {
    /// Receiver congestion feedback (carried in ACK(CC) responses).
    pub const CC_FEEDBACK: u8 = 3;
    /// FEC object transmission information (RFC 5510 OTI).
    pub const FTI: u8 = 64;
    /// Quantized rate advertisement (single word).
    pub const CC_RATE: u8 = 128;
}

/// FEC object transmission information: everything a receiver needs to
/// instantiate the object and its codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FtiExt {
    /// Total object size in bytes (48-bit field).
    pub object_size: u64,
    /// FEC instance id (zero for fully-specified schemes).
    pub fec_instance: u16,
    pub segment_size: u16,
    pub ndata: u16,
    pub nparity: u16,
}

impl FtiExt {
    pub const ENCODED_LEN: usize = 16; // 4 words

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(ext_type::FTI);
        buf.put_u8((Self::ENCODED_LEN / 4) as u8);
        buf.put_u16((self.object_size >> 32) as u16);
        buf.put_u32(self.object_size as u32);
        buf.put_u16(self.fec_instance);
        buf.put_u16(self.segment_size);
        buf.put_u16(self.ndata);
        buf.put_u16(self.nparity);
    }

    fn decode_body(buf: &mut impl Buf) -> Option<Self> {
        // Caller consumed the (type, len) prefix.
        if buf.remaining() < Self::ENCODED_LEN - 2 {
            return None;
        }
        let size_hi = buf.get_u16() as u64;
        let size_lo = buf.get_u32() as u64;
        Some(FtiExt {
            object_size: (size_hi << 32) | size_lo,
            fec_instance: buf.get_u16(),
            segment_size: buf.get_u16(),
            ndata: buf.get_u16(),
            nparity: buf.get_u16(),
        })
    }
}

/// A receiver's congestion state, echoed back to the sender inside ACK(CC).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CcFeedbackExt {
    pub flags: u8,
    pub rtt_q: u8,
    /// Loss event fraction, 16-bit fixed point.
    pub loss_q: u16,
    /// Receive rate, quantized.
    pub rate_q: u16,
    /// Echo of the probe's cc_sequence.
    pub cc_sequence: u16,
}

impl CcFeedbackExt {
    pub const ENCODED_LEN: usize = 12; // 3 words

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(ext_type::CC_FEEDBACK);
        buf.put_u8((Self::ENCODED_LEN / 4) as u8);
        buf.put_u8(self.flags);
        buf.put_u8(self.rtt_q);
        buf.put_u16(self.loss_q);
        buf.put_u16(self.rate_q);
        buf.put_u16(self.cc_sequence);
        buf.put_u16(0);
    }

    fn decode_body(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < Self::ENCODED_LEN - 2 {
            return None;
        }
        let flags = buf.get_u8();
        let rtt_q = buf.get_u8();
        let loss_q = buf.get_u16();
        let rate_q = buf.get_u16();
        let cc_sequence = buf.get_u16();
        let _pad = buf.get_u16();
        Some(CcFeedbackExt {
            flags,
            rtt_q,
            loss_q,
            rate_q,
            cc_sequence,
        })
    }
}

/// Result of walking the extension area of a header.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct Extensions {
    fti: Option<FtiExt>,
    cc_rate: Option<u16>,
    cc_feedback: Option<CcFeedbackExt>,
}

impl Extensions {
    fn encoded_len(&self) -> usize {
        let mut n = 0;
        if self.fti.is_some() {
            n += FtiExt::ENCODED_LEN;
        }
        if self.cc_rate.is_some() {
            n += 4;
        }
        if self.cc_feedback.is_some() {
            n += CcFeedbackExt::ENCODED_LEN;
        }
        n
    }

    fn encode(&self, buf: &mut BytesMut) {
        if let Some(fb) = &self.cc_feedback {
            fb.encode(buf);
        }
        if let Some(fti) = &self.fti {
            fti.encode(buf);
        }
        if let Some(rate) = self.cc_rate {
            buf.put_u8(ext_type::CC_RATE);
            buf.put_u8(0);
            buf.put_u16(rate);
        }
    }

    /// Walk `ext_len` bytes of extension area, tolerating unknown types.
    fn decode(buf: &mut Bytes, ext_len: usize) -> Option<Extensions> {
        if buf.remaining() < ext_len {
            return None;
        }
        let mut area = buf.split_to(ext_len);
        let mut exts = Extensions::default();
        while area.has_remaining() {
            let et = area.get_u8();
            if et >= 128 {
                // Fixed single-word extension.
                if area.remaining() < 3 {
                    return None;
                }
                let _reserved = area.get_u8();
                let value = area.get_u16();
                if et == ext_type::CC_RATE {
                    exts.cc_rate = Some(value);
                }
            } else {
                if !area.has_remaining() {
                    return None;
                }
                let words = area.get_u8() as usize;
                let body_len = words.checked_mul(4)?.checked_sub(2)?;
                if area.remaining() < body_len {
                    return None;
                }
                if et == ext_type::FTI && words == FtiExt::ENCODED_LEN / 4 {
                    exts.fti = FtiExt::decode_body(&mut area);
                } else if et == ext_type::CC_FEEDBACK && words == CcFeedbackExt::ENCODED_LEN / 4 {
                    exts.cc_feedback = CcFeedbackExt::decode_body(&mut area);
                } else {
                    area.advance(body_len);
                }
            }
        }
        Some(exts)
    }
}

// ─── INFO / DATA ─────────────────────────────────────────────────────────────

/// Fields common to INFO and DATA messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMsgBase {
    pub sequence: u16,
    pub source_id: u32,
    pub instance_id: u16,
    pub segment_size: u16,
    pub flags: u8,
    pub fec_id: u8,
    pub object_id: ObjectId,
    pub fti: Option<FtiExt>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoMsg {
    pub base: ObjectMsgBase,
    pub info: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataMsg {
    pub base: ObjectMsgBase,
    pub payload_id: PayloadId,
    pub payload: Bytes,
}

fn encode_object_base(base: &ObjectMsgBase, buf: &mut BytesMut) {
    buf.put_u16(base.instance_id);
    buf.put_u16(base.segment_size);
    buf.put_u8(base.flags);
    buf.put_u8(base.fec_id);
    buf.put_u16(base.object_id.value());
}

fn decode_object_base(
    sequence: u16,
    source_id: u32,
    buf: &mut Bytes,
) -> Option<(ObjectMsgBase, u8)> {
    if buf.remaining() < 8 {
        return None;
    }
    let instance_id = buf.get_u16();
    let segment_size = buf.get_u16();
    let flags = buf.get_u8();
    let fec_id = buf.get_u8();
    let object_id = ObjectId(buf.get_u16());
    Some((
        ObjectMsgBase {
            sequence,
            source_id,
            instance_id,
            segment_size,
            flags,
            fec_id,
            object_id,
            fti: None,
        },
        fec_id,
    ))
}

// ─── CMD ─────────────────────────────────────────────────────────────────────

/// Command flavor codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CmdFlavor {
    Flush = 1,
    Eot = 2,
    Squelch = 3,
    Cc = 4,
    RepairAdv = 5,
    AckReq = 6,
    Application = 7,
}

/// Positive-ack request classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckType {
    Cc,
    Flush,
    Watermark,
    /// Application-extended ack (code >= 16).
    App(u8),
}

impl AckType {
    pub fn to_byte(self) -> u8 {
        match self {
            AckType::Cc => 1,
            AckType::Flush => 2,
            AckType::Watermark => 3,
            AckType::App(code) => code,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(AckType::Cc),
            2 => Some(AckType::Flush),
            3 => Some(AckType::Watermark),
            code if code >= 16 => Some(AckType::App(code)),
            _ => None,
        }
    }
}

/// A send-time or echo timestamp carried on the wire (seconds + microseconds).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EchoTime {
    pub sec: u32,
    pub usec: u32,
}

impl EchoTime {
    pub fn as_seconds(&self) -> f64 {
        self.sec as f64 + self.usec as f64 * 1.0e-6
    }

    pub fn from_seconds(t: f64) -> Self {
        let sec = t.floor().max(0.0) as u32;
        let usec = ((t - sec as f64) * 1.0e6) as u32;
        EchoTime { sec, usec }
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.sec);
        buf.put_u32(self.usec);
    }

    fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < 8 {
            return None;
        }
        Some(EchoTime {
            sec: buf.get_u32(),
            usec: buf.get_u32(),
        })
    }
}

/// A (fec_id, object, block, symbol) coordinate named by a watermark request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatermarkId {
    pub fec_id: u8,
    pub object_id: ObjectId,
    pub payload_id: PayloadId,
}

impl WatermarkId {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.fec_id);
        buf.put_u8(0);
        buf.put_u16(self.object_id.value());
        self.payload_id.encode(self.fec_id, buf);
    }

    fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < 4 {
            return None;
        }
        let fec_id = buf.get_u8();
        let _reserved = buf.get_u8();
        let object_id = ObjectId(buf.get_u16());
        let payload_id = PayloadId::decode(fec_id, buf)?;
        Some(WatermarkId {
            fec_id,
            object_id,
            payload_id,
        })
    }
}

/// One per-receiver entry in a CC probe's feedback list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CcFeedback {
    pub node_id: u32,
    pub flags: u8,
    pub rtt_q: u8,
    pub rate_q: u16,
}

/// CC feedback flag bits.
pub mod cc_flags {
    /// Node is the current limiting receiver.
    pub const CLR: u8 = 0x01;
    /// Node is a potential limiting receiver.
    pub const PLR: u8 = 0x02;
    /// The rtt field holds a measured (not default) value.
    pub const RTT: u8 = 0x04;
    /// Sender is in slow start.
    pub const START: u8 = 0x08;
    /// Node has left the group.
    pub const LEAVE: u8 = 0x10;
    /// Rate is operating at a configured bound.
    pub const LIMIT: u8 = 0x20;
}

impl CcFeedback {
    pub const ENCODED_LEN: usize = 8;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.node_id);
        buf.put_u8(self.flags);
        buf.put_u8(self.rtt_q);
        buf.put_u16(self.rate_q);
    }

    fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < Self::ENCODED_LEN {
            return None;
        }
        Some(CcFeedback {
            node_id: buf.get_u32(),
            flags: buf.get_u8(),
            rtt_q: buf.get_u8(),
            rate_q: buf.get_u16(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CmdBody {
    Flush {
        fec_id: u8,
        object_id: ObjectId,
        payload_id: PayloadId,
        acking_nodes: Vec<u32>,
    },
    Eot,
    Squelch {
        fec_id: u8,
        object_id: ObjectId,
        payload_id: PayloadId,
        stale_objects: Vec<ObjectId>,
    },
    Cc {
        cc_sequence: u16,
        send_time: EchoTime,
        rate_q: u16,
        feedback: Vec<CcFeedback>,
    },
    RepairAdv {
        flags: u8,
        rate_q: Option<u16>,
        requests: Vec<RepairRequest>,
    },
    AckReq {
        ack_type: AckType,
        ack_id: u8,
        watermark: Option<WatermarkId>,
        acking_nodes: Vec<u32>,
    },
    Application(Bytes),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmdMsg {
    pub sequence: u16,
    pub source_id: u32,
    pub instance_id: u16,
    pub grtt_q: u8,
    /// Backoff factor, 0..=15.
    pub backoff: u8,
    /// Quantized group size, 0..=15.
    pub gsize_q: u8,
    pub body: CmdBody,
}

impl CmdMsg {
    pub fn flavor(&self) -> CmdFlavor {
        match &self.body {
            CmdBody::Flush { .. } => CmdFlavor::Flush,
            CmdBody::Eot => CmdFlavor::Eot,
            CmdBody::Squelch { .. } => CmdFlavor::Squelch,
            CmdBody::Cc { .. } => CmdFlavor::Cc,
            CmdBody::RepairAdv { .. } => CmdFlavor::RepairAdv,
            CmdBody::AckReq { .. } => CmdFlavor::AckReq,
            CmdBody::Application(_) => CmdFlavor::Application,
        }
    }
}

// ─── NACK / ACK ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NackMsg {
    pub sequence: u16,
    pub source_id: u32,
    /// The sender this NACK addresses.
    pub server_id: u32,
    pub instance_id: u16,
    /// Echo of the sender's most recent probe send-time, adjusted for hold.
    pub grtt_response: EchoTime,
    pub requests: Vec<RepairRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckPayload {
    None,
    Watermark(WatermarkId),
    App(Bytes),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckMsg {
    pub sequence: u16,
    pub source_id: u32,
    pub server_id: u32,
    pub instance_id: u16,
    pub ack_type: AckType,
    pub ack_id: u8,
    pub grtt_response: EchoTime,
    /// Congestion feedback, present on ACK(CC) responses.
    pub cc_feedback: Option<CcFeedbackExt>,
    pub payload: AckPayload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportMsg {
    pub sequence: u16,
    pub source_id: u32,
}

// ─── Repair Requests ─────────────────────────────────────────────────────────

/// Repair-request record forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestForm {
    Items = 1,
    Ranges = 2,
    Erasures = 3,
}

impl RequestForm {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(RequestForm::Items),
            2 => Some(RequestForm::Ranges),
            3 => Some(RequestForm::Erasures),
            _ => None,
        }
    }
}

/// Repair-request level flags.
pub mod repair_flags {
    /// Request names individual segments.
    pub const SEGMENT: u8 = 0x01;
    /// Request names whole blocks.
    pub const BLOCK: u8 = 0x02;
    /// Object INFO is requested.
    pub const INFO: u8 = 0x04;
    /// Request names whole objects.
    pub const OBJECT: u8 = 0x08;
    /// Stream receiver only needs data from the next message boundary.
    pub const MSG_START: u8 = 0x10;
}

/// One repair coordinate. For ERASURES records `payload_id.symbol_id` carries
/// the erasure count instead of a symbol index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepairItem {
    pub fec_id: u8,
    pub object_id: ObjectId,
    pub payload_id: PayloadId,
}

impl RepairItem {
    pub fn encoded_len(fec_id: u8) -> Option<usize> {
        PayloadId::encoded_len(fec_id).map(|n| n + 4)
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.fec_id);
        buf.put_u8(0);
        buf.put_u16(self.object_id.value());
        self.payload_id.encode(self.fec_id, buf);
    }

    fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < 4 {
            return None;
        }
        let fec_id = buf.get_u8();
        let _reserved = buf.get_u8();
        let object_id = ObjectId(buf.get_u16());
        let payload_id = PayloadId::decode(fec_id, buf)?;
        Some(RepairItem {
            fec_id,
            object_id,
            payload_id,
        })
    }
}

/// A single repair-request record: form + flags + packed item list. A RANGES
/// record holds items in start/end pairs; forms are never mixed in a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairRequest {
    pub form: RequestForm,
    pub flags: u8,
    pub items: Vec<RepairItem>,
}

impl RepairRequest {
    pub fn encoded_len(&self) -> usize {
        4 + self
            .items
            .iter()
            .map(|it| RepairItem::encoded_len(it.fec_id).unwrap_or(0))
            .sum::<usize>()
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.form as u8);
        buf.put_u8(self.flags);
        let items_len: usize = self
            .items
            .iter()
            .map(|it| RepairItem::encoded_len(it.fec_id).unwrap_or(0))
            .sum();
        buf.put_u16(items_len as u16);
        for item in &self.items {
            item.encode(buf);
        }
    }

    /// Consume one record from the buffer.
    pub fn decode(buf: &mut Bytes) -> Option<Self> {
        if buf.remaining() < 4 {
            return None;
        }
        let form = RequestForm::from_byte(buf.get_u8())?;
        let flags = buf.get_u8();
        let items_len = buf.get_u16() as usize;
        if buf.remaining() < items_len {
            return None;
        }
        let mut area = buf.split_to(items_len);
        let mut items = Vec::new();
        while area.has_remaining() {
            items.push(RepairItem::decode(&mut area)?);
        }
        if form == RequestForm::Ranges && items.len() % 2 != 0 {
            return None;
        }
        Some(RepairRequest { form, flags, items })
    }

    fn decode_list(buf: &mut Bytes) -> Option<Vec<RepairRequest>> {
        let mut requests = Vec::new();
        while buf.has_remaining() {
            requests.push(RepairRequest::decode(buf)?);
        }
        Some(requests)
    }
}

// ─── Message ─────────────────────────────────────────────────────────────────

/// A decoded NORM message of any type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Info(InfoMsg),
    Data(DataMsg),
    Cmd(CmdMsg),
    Nack(NackMsg),
    Ack(AckMsg),
    Report(ReportMsg),
}

impl Message {
    pub fn msg_type(&self) -> MsgType {
        match self {
            Message::Info(_) => MsgType::Info,
            Message::Data(_) => MsgType::Data,
            Message::Cmd(_) => MsgType::Cmd,
            Message::Nack(_) => MsgType::Nack,
            Message::Ack(_) => MsgType::Ack,
            Message::Report(_) => MsgType::Report,
        }
    }

    pub fn source_id(&self) -> u32 {
        match self {
            Message::Info(m) => m.base.source_id,
            Message::Data(m) => m.base.source_id,
            Message::Cmd(m) => m.source_id,
            Message::Nack(m) => m.source_id,
            Message::Ack(m) => m.source_id,
            Message::Report(m) => m.source_id,
        }
    }

    pub fn sequence(&self) -> u16 {
        match self {
            Message::Info(m) => m.base.sequence,
            Message::Data(m) => m.base.sequence,
            Message::Cmd(m) => m.sequence,
            Message::Nack(m) => m.sequence,
            Message::Ack(m) => m.sequence,
            Message::Report(m) => m.sequence,
        }
    }

    /// Serialize into wire bytes.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(COMMON_HEADER_LEN + 64);
        match self {
            Message::Info(m) => {
                let exts = Extensions {
                    fti: m.base.fti,
                    cc_rate: None,
                    cc_feedback: None,
                };
                let hdr_len = 16 + exts.encoded_len();
                put_common(&mut buf, MsgType::Info, hdr_len, m.base.sequence, m.base.source_id);
                encode_object_base(&m.base, &mut buf);
                exts.encode(&mut buf);
                buf.extend_from_slice(&m.info);
            }
            Message::Data(m) => {
                let id_len = PayloadId::encoded_len(m.base.fec_id)
                    .expect("unsupported fec_id must be rejected at construction");
                let exts = Extensions {
                    fti: m.base.fti,
                    cc_rate: None,
                    cc_feedback: None,
                };
                let hdr_len = 16 + id_len + exts.encoded_len();
                put_common(&mut buf, MsgType::Data, hdr_len, m.base.sequence, m.base.source_id);
                encode_object_base(&m.base, &mut buf);
                m.payload_id.encode(m.base.fec_id, &mut buf);
                exts.encode(&mut buf);
                buf.extend_from_slice(&m.payload);
            }
            Message::Cmd(m) => encode_cmd(m, &mut buf),
            Message::Nack(m) => {
                put_common(&mut buf, MsgType::Nack, 24, m.sequence, m.source_id);
                buf.put_u32(m.server_id);
                buf.put_u16(m.instance_id);
                buf.put_u16(0);
                m.grtt_response.encode(&mut buf);
                for req in &m.requests {
                    req.encode(&mut buf);
                }
            }
            Message::Ack(m) => {
                let exts = Extensions {
                    fti: None,
                    cc_rate: None,
                    cc_feedback: m.cc_feedback,
                };
                put_common(
                    &mut buf,
                    MsgType::Ack,
                    24 + exts.encoded_len(),
                    m.sequence,
                    m.source_id,
                );
                buf.put_u32(m.server_id);
                buf.put_u16(m.instance_id);
                buf.put_u8(m.ack_type.to_byte());
                buf.put_u8(m.ack_id);
                m.grtt_response.encode(&mut buf);
                exts.encode(&mut buf);
                match &m.payload {
                    AckPayload::None => {}
                    AckPayload::Watermark(w) => w.encode(&mut buf),
                    AckPayload::App(data) => buf.extend_from_slice(data),
                }
            }
            Message::Report(m) => {
                put_common(&mut buf, MsgType::Report, 8, m.sequence, m.source_id);
            }
        }
        buf
    }

    /// Parse one message from a datagram. Returns `None` on any malformation:
    /// bad version, unknown type/flavor/fec_id, or truncation short of the
    /// computed header length.
    pub fn decode(mut buf: Bytes) -> Option<Message> {
        if buf.remaining() < COMMON_HEADER_LEN {
            return None;
        }
        let vt = buf.get_u8();
        if vt >> 4 != PROTOCOL_VERSION {
            return None;
        }
        let msg_type = MsgType::from_nibble(vt & 0x0F)?;
        let hdr_len = buf.get_u8() as usize * 4;
        if hdr_len < COMMON_HEADER_LEN {
            return None;
        }
        let sequence = buf.get_u16();
        let source_id = buf.get_u32();

        match msg_type {
            MsgType::Info => {
                let (mut base, _) = decode_object_base(sequence, source_id, &mut buf)?;
                let exts = Extensions::decode(&mut buf, hdr_len.checked_sub(16)?)?;
                base.fti = exts.fti;
                Some(Message::Info(InfoMsg {
                    base,
                    info: buf,
                }))
            }
            MsgType::Data => {
                let (mut base, fec_id) = decode_object_base(sequence, source_id, &mut buf)?;
                let id_len = PayloadId::encoded_len(fec_id)?;
                let payload_id = PayloadId::decode(fec_id, &mut buf)?;
                let exts = Extensions::decode(&mut buf, hdr_len.checked_sub(16 + id_len)?)?;
                base.fti = exts.fti;
                Some(Message::Data(DataMsg {
                    base,
                    payload_id,
                    payload: buf,
                }))
            }
            MsgType::Cmd => decode_cmd(sequence, source_id, hdr_len, buf),
            MsgType::Nack => {
                if buf.remaining() < 16 {
                    return None;
                }
                let server_id = buf.get_u32();
                let instance_id = buf.get_u16();
                let _reserved = buf.get_u16();
                let grtt_response = EchoTime::decode(&mut buf)?;
                let ext_len = hdr_len.checked_sub(24)?;
                if buf.remaining() < ext_len {
                    return None;
                }
                buf.advance(ext_len);
                let requests = RepairRequest::decode_list(&mut buf)?;
                Some(Message::Nack(NackMsg {
                    sequence,
                    source_id,
                    server_id,
                    instance_id,
                    grtt_response,
                    requests,
                }))
            }
            MsgType::Ack => {
                if buf.remaining() < 16 {
                    return None;
                }
                let server_id = buf.get_u32();
                let instance_id = buf.get_u16();
                let ack_type = AckType::from_byte(buf.get_u8())?;
                let ack_id = buf.get_u8();
                let grtt_response = EchoTime::decode(&mut buf)?;
                let exts = Extensions::decode(&mut buf, hdr_len.checked_sub(24)?)?;
                let payload = match ack_type {
                    AckType::Watermark => AckPayload::Watermark(WatermarkId::decode(&mut buf)?),
                    AckType::App(_) => AckPayload::App(buf),
                    _ => AckPayload::None,
                };
                Some(Message::Ack(AckMsg {
                    sequence,
                    source_id,
                    server_id,
                    instance_id,
                    ack_type,
                    ack_id,
                    grtt_response,
                    cc_feedback: exts.cc_feedback,
                    payload,
                }))
            }
            MsgType::Report => Some(Message::Report(ReportMsg {
                sequence,
                source_id,
            })),
        }
    }
}

fn put_common(buf: &mut BytesMut, msg_type: MsgType, hdr_len_bytes: usize, sequence: u16, source_id: u32) {
    debug_assert_eq!(hdr_len_bytes % 4, 0);
    buf.put_u8((PROTOCOL_VERSION << 4) | msg_type as u8);
    buf.put_u8((hdr_len_bytes / 4) as u8);
    buf.put_u16(sequence);
    buf.put_u32(source_id);
}

fn encode_cmd(m: &CmdMsg, buf: &mut BytesMut) {
    // Base header length per flavor, before extensions.
    let (flavor, base_len): (CmdFlavor, usize) = match &m.body {
        CmdBody::Flush { fec_id, .. } | CmdBody::Squelch { fec_id, .. } => {
            let flavor = if matches!(m.body, CmdBody::Flush { .. }) {
                CmdFlavor::Flush
            } else {
                CmdFlavor::Squelch
            };
            (flavor, 16 + PayloadId::encoded_len(*fec_id).expect("fec_id"))
        }
        CmdBody::Eot => (CmdFlavor::Eot, 16),
        CmdBody::Cc { .. } => (CmdFlavor::Cc, 24),
        CmdBody::RepairAdv { .. } => (CmdFlavor::RepairAdv, 16),
        CmdBody::AckReq { .. } => (CmdFlavor::AckReq, 16),
        CmdBody::Application(_) => (CmdFlavor::Application, 16),
    };
    let exts = Extensions {
        fti: None,
        cc_rate: match &m.body {
            CmdBody::Cc { rate_q, .. } => Some(*rate_q),
            CmdBody::RepairAdv { rate_q, .. } => *rate_q,
            _ => None,
        },
        cc_feedback: None,
    };
    put_common(buf, MsgType::Cmd, base_len + exts.encoded_len(), m.sequence, m.source_id);
    buf.put_u16(m.instance_id);
    buf.put_u8(m.grtt_q);
    buf.put_u8((m.backoff << 4) | (m.gsize_q & 0x0F));
    buf.put_u8(flavor as u8);

    match &m.body {
        CmdBody::Flush {
            fec_id,
            object_id,
            payload_id,
            acking_nodes,
        } => {
            buf.put_u8(*fec_id);
            buf.put_u16(object_id.value());
            payload_id.encode(*fec_id, buf);
            exts.encode(buf);
            for node in acking_nodes {
                buf.put_u32(*node);
            }
        }
        CmdBody::Squelch {
            fec_id,
            object_id,
            payload_id,
            stale_objects,
        } => {
            buf.put_u8(*fec_id);
            buf.put_u16(object_id.value());
            payload_id.encode(*fec_id, buf);
            exts.encode(buf);
            for obj in stale_objects {
                buf.put_u16(obj.value());
            }
        }
        CmdBody::Eot => {
            buf.put_u8(0);
            buf.put_u16(0);
            exts.encode(buf);
        }
        CmdBody::Cc {
            cc_sequence,
            send_time,
            feedback,
            ..
        } => {
            buf.put_u8(0);
            buf.put_u16(*cc_sequence);
            send_time.encode(buf);
            exts.encode(buf);
            for fb in feedback {
                fb.encode(buf);
            }
        }
        CmdBody::RepairAdv {
            flags, requests, ..
        } => {
            buf.put_u8(*flags);
            buf.put_u16(0);
            exts.encode(buf);
            for req in requests {
                req.encode(buf);
            }
        }
        CmdBody::AckReq {
            ack_type,
            ack_id,
            watermark,
            acking_nodes,
        } => {
            buf.put_u8(0);
            buf.put_u8(ack_type.to_byte());
            buf.put_u8(*ack_id);
            exts.encode(buf);
            if let Some(w) = watermark {
                w.encode(buf);
            }
            for node in acking_nodes {
                buf.put_u32(*node);
            }
        }
        CmdBody::Application(data) => {
            buf.put_u8(0);
            buf.put_u16(0);
            exts.encode(buf);
            buf.extend_from_slice(data);
        }
    }
}

fn decode_cmd(sequence: u16, source_id: u32, hdr_len: usize, mut buf: Bytes) -> Option<Message> {
    if buf.remaining() < 5 {
        return None;
    }
    let instance_id = buf.get_u16();
    let grtt_q = buf.get_u8();
    let bg = buf.get_u8();
    let backoff = bg >> 4;
    let gsize_q = bg & 0x0F;
    let flavor = buf.get_u8();

    let body = match flavor {
        f if f == CmdFlavor::Flush as u8 || f == CmdFlavor::Squelch as u8 => {
            if buf.remaining() < 3 {
                return None;
            }
            let fec_id = buf.get_u8();
            let object_id = ObjectId(buf.get_u16());
            let payload_id = PayloadId::decode(fec_id, &mut buf)?;
            let base_len = 16 + PayloadId::encoded_len(fec_id)?;
            let _exts = Extensions::decode(&mut buf, hdr_len.checked_sub(base_len)?)?;
            if f == CmdFlavor::Flush as u8 {
                let mut acking_nodes = Vec::with_capacity(buf.remaining() / 4);
                while buf.remaining() >= 4 {
                    acking_nodes.push(buf.get_u32());
                }
                CmdBody::Flush {
                    fec_id,
                    object_id,
                    payload_id,
                    acking_nodes,
                }
            } else {
                let mut stale_objects = Vec::with_capacity(buf.remaining() / 2);
                while buf.remaining() >= 2 {
                    stale_objects.push(ObjectId(buf.get_u16()));
                }
                CmdBody::Squelch {
                    fec_id,
                    object_id,
                    payload_id,
                    stale_objects,
                }
            }
        }
        f if f == CmdFlavor::Eot as u8 => {
            if buf.remaining() < 3 {
                return None;
            }
            buf.advance(3);
            let _exts = Extensions::decode(&mut buf, hdr_len.checked_sub(16)?)?;
            CmdBody::Eot
        }
        f if f == CmdFlavor::Cc as u8 => {
            if buf.remaining() < 11 {
                return None;
            }
            let _reserved = buf.get_u8();
            let cc_sequence = buf.get_u16();
            let send_time = EchoTime::decode(&mut buf)?;
            let exts = Extensions::decode(&mut buf, hdr_len.checked_sub(24)?)?;
            let mut feedback = Vec::new();
            while buf.remaining() >= CcFeedback::ENCODED_LEN {
                feedback.push(CcFeedback::decode(&mut buf)?);
            }
            CmdBody::Cc {
                cc_sequence,
                send_time,
                rate_q: exts.cc_rate.unwrap_or(0),
                feedback,
            }
        }
        f if f == CmdFlavor::RepairAdv as u8 => {
            if buf.remaining() < 3 {
                return None;
            }
            let flags = buf.get_u8();
            let _reserved = buf.get_u16();
            let exts = Extensions::decode(&mut buf, hdr_len.checked_sub(16)?)?;
            let requests = RepairRequest::decode_list(&mut buf)?;
            CmdBody::RepairAdv {
                flags,
                rate_q: exts.cc_rate,
                requests,
            }
        }
        f if f == CmdFlavor::AckReq as u8 => {
            if buf.remaining() < 3 {
                return None;
            }
            let _reserved = buf.get_u8();
            let ack_type = AckType::from_byte(buf.get_u8())?;
            let ack_id = buf.get_u8();
            let _exts = Extensions::decode(&mut buf, hdr_len.checked_sub(16)?)?;
            let watermark = if ack_type == AckType::Watermark {
                Some(WatermarkId::decode(&mut buf)?)
            } else {
                None
            };
            let mut acking_nodes = Vec::with_capacity(buf.remaining() / 4);
            while buf.remaining() >= 4 {
                acking_nodes.push(buf.get_u32());
            }
            CmdBody::AckReq {
                ack_type,
                ack_id,
                watermark,
                acking_nodes,
            }
        }
        f if f == CmdFlavor::Application as u8 => {
            if buf.remaining() < 3 {
                return None;
            }
            buf.advance(3);
            let _exts = Extensions::decode(&mut buf, hdr_len.checked_sub(16)?)?;
            CmdBody::Application(buf)
        }
        _ => return None,
    };

    Some(Message::Cmd(CmdMsg {
        sequence,
        source_id,
        instance_id,
        grtt_q,
        backoff,
        gsize_q,
        body,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message) -> Message {
        let encoded = msg.encode().freeze();
        Message::decode(encoded).expect("decode")
    }

    fn sample_base(fec_id: u8) -> ObjectMsgBase {
        ObjectMsgBase {
            sequence: 42,
            source_id: 0xAABBCCDD,
            instance_id: 7,
            segment_size: 1400,
            flags: object_flags::INFO | object_flags::FILE,
            fec_id,
            object_id: ObjectId(9),
            fti: None,
        }
    }

    #[test]
    fn payload_id_lengths() {
        assert_eq!(PayloadId::encoded_len(FEC_ID_RS8), Some(8));
        assert_eq!(PayloadId::encoded_len(FEC_ID_SB8), Some(4));
        assert_eq!(PayloadId::encoded_len(0), None);
        assert_eq!(PayloadId::encoded_len(77), None);
    }

    #[test]
    fn payload_id_roundtrip_rs8() {
        let id = PayloadId::new(BlockId(0x00ABCDEF), 200, 128);
        let mut buf = BytesMut::new();
        id.encode(FEC_ID_RS8, &mut buf);
        assert_eq!(buf.len(), 8);
        let decoded = PayloadId::decode(FEC_ID_RS8, &mut buf.freeze()).unwrap();
        assert_eq!(decoded, id);
    }

    #[test]
    fn payload_id_roundtrip_sb8() {
        let id = PayloadId::new(BlockId(0x1234), 17, 64);
        let mut buf = BytesMut::new();
        id.encode(FEC_ID_SB8, &mut buf);
        assert_eq!(buf.len(), 4);
        let decoded = PayloadId::decode(FEC_ID_SB8, &mut buf.freeze()).unwrap();
        assert_eq!(decoded, id);
    }

    #[test]
    fn data_roundtrip_with_fti() {
        let mut base = sample_base(FEC_ID_RS8);
        base.fti = Some(FtiExt {
            object_size: 0x0000_1234_5678_9ABC,
            fec_instance: 0,
            segment_size: 1400,
            ndata: 8,
            nparity: 4,
        });
        let msg = Message::Data(DataMsg {
            base,
            payload_id: PayloadId::new(BlockId(3), 5, 8),
            payload: Bytes::from_static(b"segment payload bytes"),
        });
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn info_roundtrip() {
        let msg = Message::Info(InfoMsg {
            base: sample_base(FEC_ID_RS8),
            info: Bytes::from_static(b"file-name.dat"),
        });
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn data_hdr_len_is_exact() {
        let msg = Message::Data(DataMsg {
            base: sample_base(FEC_ID_RS8),
            payload_id: PayloadId::new(BlockId(0), 0, 8),
            payload: Bytes::from_static(b"xyz"),
        });
        let encoded = msg.encode();
        // hdr_len = 16 base + 8 payload id = 24 bytes = 6 words.
        assert_eq!(encoded[1], 6);
    }

    #[test]
    fn truncated_header_rejected() {
        let msg = Message::Data(DataMsg {
            base: sample_base(FEC_ID_RS8),
            payload_id: PayloadId::new(BlockId(0), 0, 8),
            payload: Bytes::new(),
        });
        let encoded = msg.encode().freeze();
        for cut in 1..encoded.len() {
            // Any prefix shorter than the full header must fail cleanly.
            assert!(
                Message::decode(encoded.slice(..cut)).is_none(),
                "prefix of {cut} bytes decoded"
            );
        }
    }

    #[test]
    fn bad_version_rejected() {
        let msg = Message::Report(ReportMsg {
            sequence: 0,
            source_id: 1,
        });
        let mut encoded = msg.encode();
        encoded[0] = (2 << 4) | MsgType::Report as u8;
        assert!(Message::decode(encoded.freeze()).is_none());
    }

    #[test]
    fn unknown_fec_id_rejected() {
        let msg = Message::Data(DataMsg {
            base: sample_base(FEC_ID_RS8),
            payload_id: PayloadId::new(BlockId(0), 0, 8),
            payload: Bytes::new(),
        });
        let mut encoded = msg.encode();
        encoded[13] = 17; // unsupported fec_id
        assert!(Message::decode(encoded.freeze()).is_none());
    }

    #[test]
    fn unknown_extension_skipped() {
        // Hand-build an INFO message with an unknown variable extension
        // before the payload.
        let mut buf = BytesMut::new();
        // 16 base + 8 unknown ext = 24 bytes = 6 words.
        put_common(&mut buf, MsgType::Info, 24, 1, 2);
        buf.put_u16(0); // instance
        buf.put_u16(64); // segment size
        buf.put_u8(0); // flags
        buf.put_u8(FEC_ID_RS8);
        buf.put_u16(5); // object id
        buf.put_u8(30); // unknown ext type
        buf.put_u8(2); // 2 words
        buf.extend_from_slice(&[0u8; 6]);
        buf.extend_from_slice(b"info!");

        match Message::decode(buf.freeze()).expect("decode") {
            Message::Info(m) => {
                assert_eq!(m.base.object_id, ObjectId(5));
                assert_eq!(&m.info[..], b"info!");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_fixed_extension_skipped() {
        let mut buf = BytesMut::new();
        put_common(&mut buf, MsgType::Info, 20, 1, 2);
        buf.put_u16(0);
        buf.put_u16(64);
        buf.put_u8(0);
        buf.put_u8(FEC_ID_RS8);
        buf.put_u16(5);
        buf.put_u8(200); // unknown fixed ext
        buf.put_u8(0);
        buf.put_u16(0xBEEF);
        buf.extend_from_slice(b"ok");

        assert!(Message::decode(buf.freeze()).is_some());
    }

    #[test]
    fn cmd_flush_roundtrip() {
        let msg = Message::Cmd(CmdMsg {
            sequence: 3,
            source_id: 10,
            instance_id: 1,
            grtt_q: 100,
            backoff: 4,
            gsize_q: 2,
            body: CmdBody::Flush {
                fec_id: FEC_ID_RS8,
                object_id: ObjectId(2),
                payload_id: PayloadId::new(BlockId(7), 7, 8),
                acking_nodes: vec![11, 22, 33],
            },
        });
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn cmd_eot_roundtrip() {
        let msg = Message::Cmd(CmdMsg {
            sequence: 0,
            source_id: 10,
            instance_id: 1,
            grtt_q: 0,
            backoff: 0,
            gsize_q: 0,
            body: CmdBody::Eot,
        });
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn cmd_squelch_roundtrip() {
        let msg = Message::Cmd(CmdMsg {
            sequence: 9,
            source_id: 10,
            instance_id: 1,
            grtt_q: 50,
            backoff: 4,
            gsize_q: 1,
            body: CmdBody::Squelch {
                fec_id: FEC_ID_RS8,
                object_id: ObjectId(40),
                payload_id: PayloadId::new(BlockId(0), 0, 8),
                stale_objects: vec![ObjectId(1), ObjectId(2)],
            },
        });
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn cmd_cc_roundtrip() {
        let msg = Message::Cmd(CmdMsg {
            sequence: 77,
            source_id: 10,
            instance_id: 1,
            grtt_q: 90,
            backoff: 4,
            gsize_q: 3,
            body: CmdBody::Cc {
                cc_sequence: 5,
                send_time: EchoTime {
                    sec: 1234,
                    usec: 567890,
                },
                rate_q: crate::quantize::quantize_rate(125_000.0),
                feedback: vec![
                    CcFeedback {
                        node_id: 101,
                        flags: cc_flags::CLR | cc_flags::RTT,
                        rtt_q: 88,
                        rate_q: 1600,
                    },
                    CcFeedback {
                        node_id: 102,
                        flags: 0,
                        rtt_q: 0,
                        rate_q: 0,
                    },
                ],
            },
        });
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn cmd_ack_req_watermark_roundtrip() {
        let msg = Message::Cmd(CmdMsg {
            sequence: 5,
            source_id: 10,
            instance_id: 1,
            grtt_q: 80,
            backoff: 4,
            gsize_q: 0,
            body: CmdBody::AckReq {
                ack_type: AckType::Watermark,
                ack_id: 3,
                watermark: Some(WatermarkId {
                    fec_id: FEC_ID_RS8,
                    object_id: ObjectId(0),
                    payload_id: PayloadId::new(BlockId(0), 7, 8),
                }),
                acking_nodes: vec![1, 2, 3],
            },
        });
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn cmd_application_roundtrip() {
        let msg = Message::Cmd(CmdMsg {
            sequence: 1,
            source_id: 10,
            instance_id: 1,
            grtt_q: 0,
            backoff: 0,
            gsize_q: 0,
            body: CmdBody::Application(Bytes::from_static(b"app command payload")),
        });
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn cmd_repair_adv_roundtrip() {
        let msg = Message::Cmd(CmdMsg {
            sequence: 2,
            source_id: 10,
            instance_id: 1,
            grtt_q: 30,
            backoff: 4,
            gsize_q: 0,
            body: CmdBody::RepairAdv {
                flags: 0,
                rate_q: Some(320),
                requests: vec![RepairRequest {
                    form: RequestForm::Items,
                    flags: repair_flags::SEGMENT,
                    items: vec![RepairItem {
                        fec_id: FEC_ID_RS8,
                        object_id: ObjectId(1),
                        payload_id: PayloadId::new(BlockId(2), 3, 8),
                    }],
                }],
            },
        });
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn nack_roundtrip_with_ranges() {
        let start = RepairItem {
            fec_id: FEC_ID_RS8,
            object_id: ObjectId(4),
            payload_id: PayloadId::new(BlockId(10), 0, 16),
        };
        let end = RepairItem {
            fec_id: FEC_ID_RS8,
            object_id: ObjectId(4),
            payload_id: PayloadId::new(BlockId(14), 0, 16),
        };
        let msg = Message::Nack(NackMsg {
            sequence: 8,
            source_id: 55,
            server_id: 10,
            instance_id: 1,
            grtt_response: EchoTime {
                sec: 99,
                usec: 12345,
            },
            requests: vec![
                RepairRequest {
                    form: RequestForm::Ranges,
                    flags: repair_flags::BLOCK,
                    items: vec![start, end],
                },
                RepairRequest {
                    form: RequestForm::Erasures,
                    flags: repair_flags::SEGMENT,
                    items: vec![RepairItem {
                        fec_id: FEC_ID_RS8,
                        object_id: ObjectId(4),
                        payload_id: PayloadId::new(BlockId(20), 3, 16),
                    }],
                },
            ],
        });
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn ranges_record_with_odd_items_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(RequestForm::Ranges as u8);
        buf.put_u8(repair_flags::BLOCK);
        buf.put_u16(12); // one 12-byte item: not a pair
        RepairItem {
            fec_id: FEC_ID_RS8,
            object_id: ObjectId(1),
            payload_id: PayloadId::new(BlockId(0), 0, 8),
        }
        .encode(&mut buf);
        assert!(RepairRequest::decode(&mut buf.freeze()).is_none());
    }

    #[test]
    fn ack_watermark_roundtrip() {
        let msg = Message::Ack(AckMsg {
            sequence: 12,
            source_id: 2,
            server_id: 10,
            instance_id: 1,
            ack_type: AckType::Watermark,
            ack_id: 4,
            grtt_response: EchoTime { sec: 1, usec: 2 },
            cc_feedback: None,
            payload: AckPayload::Watermark(WatermarkId {
                fec_id: FEC_ID_RS8,
                object_id: ObjectId(0),
                payload_id: PayloadId::new(BlockId(0), 7, 8),
            }),
        });
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn ack_app_roundtrip() {
        let msg = Message::Ack(AckMsg {
            sequence: 12,
            source_id: 2,
            server_id: 10,
            instance_id: 1,
            ack_type: AckType::App(16),
            ack_id: 0,
            grtt_response: EchoTime::default(),
            cc_feedback: None,
            payload: AckPayload::App(Bytes::from_static(b"ack data")),
        });
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn ack_cc_feedback_roundtrip() {
        let msg = Message::Ack(AckMsg {
            sequence: 1,
            source_id: 2,
            server_id: 10,
            instance_id: 1,
            ack_type: AckType::Cc,
            ack_id: 0,
            grtt_response: EchoTime { sec: 5, usec: 6 },
            cc_feedback: Some(CcFeedbackExt {
                flags: cc_flags::RTT,
                rtt_q: 120,
                loss_q: 655,
                rate_q: 3200,
                cc_sequence: 9,
            }),
            payload: AckPayload::None,
        });
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn echo_time_seconds_conversion() {
        let t = EchoTime::from_seconds(12.345678);
        assert_eq!(t.sec, 12);
        assert!((t.usec as i64 - 345678).abs() <= 1);
        assert!((t.as_seconds() - 12.345678).abs() < 2e-6);
    }
}
