//! # Protocol Events
//!
//! Everything the engine reports to the application flows through this enum,
//! delivered in occurrence order from the session's event queue.

use bytes::Bytes;

use crate::seq::ObjectId;

/// Final status of one acking node when a watermark round ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStatus {
    /// No response yet (round still in progress).
    Pending,
    /// Node acknowledged the watermark point.
    Success,
    /// Node never acknowledged within the robust-factor rounds.
    Failure,
    /// Node is not part of the acking set.
    Invalid,
}

/// An event delivered to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    // ─── Sender side ────────────────────────────────────────────────────
    /// Room returned to the transmit queue after back-pressure.
    TxQueueVacancy,
    /// Every enqueued object has been sent at least once.
    TxQueueEmpty,
    /// A flush cycle ran to completion without new repair requests.
    TxFlushCompleted,
    /// The watermark round finished; statuses are per acking node.
    TxWatermarkCompleted {
        object_id: ObjectId,
        success: bool,
    },
    /// An application command finished its robust transmissions.
    TxCmdSent,
    /// First-pass transmission of an object finished.
    TxObjectSent(ObjectId),
    /// An object was evicted from the tx cache.
    TxObjectPurged(ObjectId),
    /// Congestion control changed the transmit rate (bytes/sec).
    TxRateChanged(f64),
    /// The local sender role was closed.
    LocalSenderClosed,

    // ─── Remote sender lifecycle ────────────────────────────────────────
    /// First traffic heard from a new remote sender.
    RemoteSenderNew(u32),
    /// A remote sender restarted (instance id changed).
    RemoteSenderReset(u32),
    /// A remote sender's source address changed.
    RemoteSenderAddress(u32),
    /// A remote sender resumed activity.
    RemoteSenderActive(u32),
    /// A remote sender went quiet past the activity timeout.
    RemoteSenderInactive(u32),
    /// Remote sender state was freed.
    RemoteSenderPurged(u32),

    // ─── Receive side ───────────────────────────────────────────────────
    /// An application command arrived from a remote sender.
    RxCmdNew {
        sender_id: u32,
        data: Bytes,
    },
    /// Reception of a new object began.
    RxObjectNew {
        sender_id: u32,
        object_id: ObjectId,
    },
    /// The object's INFO blob arrived.
    RxObjectInfo {
        sender_id: u32,
        object_id: ObjectId,
        info: Bytes,
    },
    /// New data was delivered for an in-progress object.
    RxObjectUpdated {
        sender_id: u32,
        object_id: ObjectId,
    },
    /// The object completed.
    RxObjectCompleted {
        sender_id: u32,
        object_id: ObjectId,
    },
    /// The object was aborted (stream break, eviction, cancel).
    RxObjectAborted {
        sender_id: u32,
        object_id: ObjectId,
    },
    /// An application-extended ack request arrived.
    RxAckRequest {
        sender_id: u32,
        ack_id: u8,
    },

    // ─── Shared ─────────────────────────────────────────────────────────
    /// The GRTT estimate changed (seconds).
    GrttUpdated(f64),
    /// Congestion control took rate authority.
    CcActive,
    /// Congestion control released rate authority.
    CcInactive,
    /// A new node joined the acking set automatically.
    AckingNodeNew(u32),
    /// The transport reported a send failure.
    SendError,
    /// The application's user timeout elapsed.
    UserTimeout,
}
