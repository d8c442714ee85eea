//! # Public API Facade
//!
//! Handle-based surface mirroring the classic NORM C API shape: an instance
//! owns sessions in a slab, and every operation takes plain handles so
//! bindings never hold references into the engine. Misuse (stale handle,
//! wrong role) returns a failure sentinel instead of panicking.

use bytes::Bytes;
use quanta::Instant;
use slab::Slab;

use crate::event::{AckStatus, Event};
use crate::object::NackingMode;
use crate::receiver::ReceiverConfig;
use crate::sender::SenderConfig;
use crate::seq::{BlockId, ObjectId};
use crate::session::{DatagramTransport, Session, SessionConfig};
use crate::store::ObjectStore;
use crate::stream::StreamBreak;

/// Opaque session handle.
pub type SessionHandle = usize;

/// Identifies one transmit object within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxObjectHandle {
    pub session: SessionHandle,
    pub object_id: ObjectId,
}

/// Identifies one receive object (per remote sender) within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxObjectHandle {
    pub session: SessionHandle,
    pub sender_id: u32,
    pub object_id: ObjectId,
}

/// Top-level engine instance: a set of sessions driven by one loop.
pub struct Instance {
    sessions: Slab<Session>,
    store: Box<dyn ObjectStore>,
    suspended: bool,
    cache_path: Option<String>,
}

impl Instance {
    /// Create an instance; `store` backs FILE object transmission.
    pub fn new(store: Box<dyn ObjectStore>) -> Self {
        Instance {
            sessions: Slab::new(),
            store,
            suspended: false,
            cache_path: None,
        }
    }

    /// Where received files should be staged (advisory, passed to stores).
    pub fn set_cache_directory(&mut self, path: &str) {
        self.cache_path = Some(path.to_string());
    }

    pub fn cache_directory(&self) -> Option<&str> {
        self.cache_path.as_deref()
    }

    /// Pause dispatch so the application can inspect state.
    pub fn suspend(&mut self) {
        self.suspended = true;
    }

    pub fn resume(&mut self) {
        self.suspended = false;
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Halt all dispatch. With no worker thread of its own, an instance stops
    /// by refusing packets and timer service until restarted.
    pub fn stop(&mut self) {
        self.suspended = true;
    }

    pub fn restart(&mut self) {
        self.suspended = false;
    }

    // ─── Sessions ───────────────────────────────────────────────────────

    pub fn create_session(
        &mut self,
        config: SessionConfig,
        transport: Box<dyn DatagramTransport>,
    ) -> SessionHandle {
        self.sessions.insert(Session::new(config, transport))
    }

    pub fn destroy_session(&mut self, handle: SessionHandle) -> bool {
        if self.sessions.contains(handle) {
            self.sessions.remove(handle);
            true
        } else {
            false
        }
    }

    pub fn session(&self, handle: SessionHandle) -> Option<&Session> {
        self.sessions.get(handle)
    }

    pub fn session_mut(&mut self, handle: SessionHandle) -> Option<&mut Session> {
        self.sessions.get_mut(handle)
    }

    pub fn start_sender(
        &mut self,
        handle: SessionHandle,
        config: SenderConfig,
        now: Instant,
    ) -> bool {
        match self.sessions.get_mut(handle) {
            Some(session) => session.start_sender(config, now).is_ok(),
            None => false,
        }
    }

    pub fn stop_sender(&mut self, handle: SessionHandle) -> bool {
        match self.sessions.get_mut(handle) {
            Some(session) => {
                session.stop_sender();
                true
            }
            None => false,
        }
    }

    pub fn start_receiver(
        &mut self,
        handle: SessionHandle,
        config: ReceiverConfig,
        store: Box<dyn ObjectStore>,
    ) -> bool {
        match self.sessions.get_mut(handle) {
            Some(session) => {
                session.start_receiver(config, store);
                true
            }
            None => false,
        }
    }

    pub fn stop_receiver(&mut self, handle: SessionHandle) -> bool {
        match self.sessions.get_mut(handle) {
            Some(session) => {
                session.stop_receiver();
                true
            }
            None => false,
        }
    }

    // ─── Loop integration ───────────────────────────────────────────────

    /// Feed a datagram received for one session.
    pub fn handle_packet(
        &mut self,
        handle: SessionHandle,
        data: Bytes,
        from: std::net::SocketAddr,
        now: Instant,
    ) {
        if self.suspended {
            return;
        }
        if let Some(session) = self.sessions.get_mut(handle) {
            session.handle_packet(data, from, now);
        }
    }

    /// Earliest deadline across every session.
    pub fn next_timeout(&self) -> Option<Instant> {
        self.sessions
            .iter()
            .filter_map(|(_, s)| s.next_timeout())
            .min()
    }

    /// Drive every session's timers.
    pub fn on_timeout(&mut self, now: Instant) {
        if self.suspended {
            return;
        }
        for (_, session) in self.sessions.iter_mut() {
            session.on_timeout(now);
        }
    }

    /// Pop the next event from any session, round-robin by slab order.
    pub fn get_next_event(&mut self) -> Option<(SessionHandle, Event)> {
        for (handle, session) in self.sessions.iter_mut() {
            if let Some(event) = session.get_next_event() {
                return Some((handle, event));
            }
        }
        None
    }

    // ─── Object enqueue ─────────────────────────────────────────────────

    /// Enqueue a FILE object by store path; the INFO defaults to the name.
    pub fn file_enqueue(
        &mut self,
        handle: SessionHandle,
        path: &str,
        info: Option<Bytes>,
    ) -> Option<TxObjectHandle> {
        let file = self.store.open_read(path).ok()?;
        let info = info.or_else(|| Some(Bytes::copy_from_slice(path.as_bytes())));
        let sender = self.sessions.get_mut(handle)?.sender_mut()?;
        let object_id = sender.enqueue_file(file, info).ok()?;
        Some(TxObjectHandle {
            session: handle,
            object_id,
        })
    }

    /// Enqueue an in-memory DATA object.
    pub fn data_enqueue(
        &mut self,
        handle: SessionHandle,
        data: Bytes,
        info: Option<Bytes>,
    ) -> Option<TxObjectHandle> {
        let sender = self.sessions.get_mut(handle)?.sender_mut()?;
        let object_id = sender.enqueue_data(data, info).ok()?;
        Some(TxObjectHandle {
            session: handle,
            object_id,
        })
    }

    /// Open a STREAM object.
    pub fn stream_open(
        &mut self,
        handle: SessionHandle,
        buffer_size: u64,
        info: Option<Bytes>,
        push_mode: bool,
    ) -> Option<TxObjectHandle> {
        let sender = self.sessions.get_mut(handle)?.sender_mut()?;
        let object_id = sender.open_stream(buffer_size, info, push_mode).ok()?;
        Some(TxObjectHandle {
            session: handle,
            object_id,
        })
    }

    /// Whether the last enqueue failure was flow control (for back-pressure
    /// handling the caller can distinguish via the sender stats).
    pub fn enqueue_rejected(&self, handle: SessionHandle) -> u64 {
        self.sessions
            .get(handle)
            .and_then(|s| s.sender())
            .map(|s| s.stats.enqueue_rejected)
            .unwrap_or(0)
    }

    /// Schedule a fresh pass over a cached object.
    pub fn requeue_object(&mut self, obj: TxObjectHandle) -> bool {
        match self.sessions.get_mut(obj.session).and_then(|s| s.sender_mut()) {
            Some(sender) => sender.requeue_object(obj.object_id),
            None => false,
        }
    }

    /// Cancel a transmit object.
    pub fn object_cancel(&mut self, obj: TxObjectHandle) -> bool {
        match self.sessions.get_mut(obj.session).and_then(|s| s.sender_mut()) {
            Some(sender) => sender.cancel_object(obj.object_id),
            None => false,
        }
    }

    /// Size of a transmit object, `None` for a stale handle.
    pub fn object_size(&self, obj: TxObjectHandle) -> Option<u64> {
        self.sessions
            .get(obj.session)?
            .sender()?
            .object(obj.object_id)
            .map(|o| o.size)
    }

    // ─── Stream operations ──────────────────────────────────────────────

    pub fn stream_write(&mut self, obj: TxObjectHandle, buf: &[u8], eom: bool) -> usize {
        match self.sessions.get_mut(obj.session).and_then(|s| s.sender_mut()) {
            Some(sender) => sender.stream_write(obj.object_id, buf, eom),
            None => 0,
        }
    }

    pub fn stream_flush(&mut self, obj: TxObjectHandle, now: Instant) -> bool {
        match self.sessions.get_mut(obj.session).and_then(|s| s.sender_mut()) {
            Some(sender) => sender.stream_flush(obj.object_id, now),
            None => false,
        }
    }

    pub fn stream_mark_eom(&mut self, obj: TxObjectHandle) {
        if let Some(sender) = self.sessions.get_mut(obj.session).and_then(|s| s.sender_mut()) {
            sender.stream_mark_eom(obj.object_id);
        }
    }

    pub fn stream_close(&mut self, obj: TxObjectHandle) {
        if let Some(sender) = self.sessions.get_mut(obj.session).and_then(|s| s.sender_mut()) {
            sender.stream_close(obj.object_id);
        }
    }

    pub fn stream_has_vacancy(&self, obj: TxObjectHandle) -> bool {
        self.sessions
            .get(obj.session)
            .and_then(|s| s.sender())
            .and_then(|s| s.object(obj.object_id))
            .and_then(|o| o.stream())
            .is_some_and(|s| s.has_vacancy())
    }

    /// Read from a received stream. `Err` reports a stream break.
    pub fn stream_read(
        &mut self,
        obj: RxObjectHandle,
        buf: &mut [u8],
    ) -> Result<(usize, bool), StreamBreak> {
        let stream = self
            .sessions
            .get_mut(obj.session)
            .and_then(|s| s.receiver_mut())
            .and_then(|r| r.remote_sender_mut(obj.sender_id))
            .and_then(|s| s.object_mut(obj.object_id))
            .and_then(|o| o.stream_mut());
        match stream {
            Some(stream) => stream.read(buf),
            None => Ok((0, false)),
        }
    }

    pub fn stream_seek_msg_start(&mut self, obj: RxObjectHandle) -> Result<bool, StreamBreak> {
        let stream = self
            .sessions
            .get_mut(obj.session)
            .and_then(|s| s.receiver_mut())
            .and_then(|r| r.remote_sender_mut(obj.sender_id))
            .and_then(|s| s.object_mut(obj.object_id))
            .and_then(|o| o.stream_mut());
        match stream {
            Some(stream) => stream.seek_msg_start(),
            None => Ok(false),
        }
    }

    // ─── Rx object accessors ────────────────────────────────────────────

    /// Completed DATA object contents.
    pub fn object_data(&self, obj: RxObjectHandle) -> Option<Vec<u8>> {
        self.sessions
            .get(obj.session)?
            .receiver()?
            .remote_sender(obj.sender_id)?
            .object(obj.object_id)?
            .data()
            .map(|d| d.to_vec())
    }

    pub fn object_info(&self, obj: RxObjectHandle) -> Option<Bytes> {
        self.sessions
            .get(obj.session)?
            .receiver()?
            .remote_sender(obj.sender_id)?
            .object(obj.object_id)?
            .info
            .clone()
    }

    pub fn object_bytes_pending(&self, obj: RxObjectHandle) -> Option<u64> {
        self.sessions
            .get(obj.session)?
            .receiver()?
            .remote_sender(obj.sender_id)?
            .object(obj.object_id)
            .map(|o| o.bytes_pending())
    }

    /// Default nacking mode applied to new rx objects.
    pub fn set_default_nacking_mode(&mut self, _handle: SessionHandle, _mode: NackingMode) {
        // Configured via ReceiverConfig at StartReceiver; retained for
        // surface parity.
    }

    // ─── Acking / watermark ─────────────────────────────────────────────

    pub fn add_acking_node(&mut self, handle: SessionHandle, node_id: u32) -> bool {
        match self.sessions.get_mut(handle).and_then(|s| s.sender_mut()) {
            Some(sender) => {
                sender.add_acking_node(node_id);
                true
            }
            None => false,
        }
    }

    pub fn remove_acking_node(&mut self, handle: SessionHandle, node_id: u32) -> bool {
        match self.sessions.get_mut(handle).and_then(|s| s.sender_mut()) {
            Some(sender) => {
                sender.remove_acking_node(node_id);
                true
            }
            None => false,
        }
    }

    pub fn set_watermark(
        &mut self,
        obj: TxObjectHandle,
        block_id: BlockId,
        symbol_id: u16,
        now: Instant,
    ) -> bool {
        match self.sessions.get_mut(obj.session).and_then(|s| s.sender_mut()) {
            Some(sender) => {
                sender.set_watermark(obj.object_id, block_id, symbol_id, None, now);
                true
            }
            None => false,
        }
    }

    /// Watermark with an application payload echoed alongside each round.
    pub fn set_watermark_ex(
        &mut self,
        obj: TxObjectHandle,
        block_id: BlockId,
        symbol_id: u16,
        app_data: Bytes,
        now: Instant,
    ) -> bool {
        match self.sessions.get_mut(obj.session).and_then(|s| s.sender_mut()) {
            Some(sender) => {
                sender.set_watermark(obj.object_id, block_id, symbol_id, Some(app_data), now);
                true
            }
            None => false,
        }
    }

    pub fn reset_watermark(&mut self, handle: SessionHandle, now: Instant) -> bool {
        match self.sessions.get_mut(handle).and_then(|s| s.sender_mut()) {
            Some(sender) => {
                sender.reset_watermark(now);
                true
            }
            None => false,
        }
    }

    pub fn acking_status(&self, handle: SessionHandle, node_id: u32) -> AckStatus {
        self.sessions
            .get(handle)
            .and_then(|s| s.sender())
            .map(|s| s.acking_status(node_id))
            .unwrap_or(AckStatus::Invalid)
    }

    pub fn acking_nodes(&self, handle: SessionHandle) -> Vec<(u32, AckStatus)> {
        self.sessions
            .get(handle)
            .and_then(|s| s.sender())
            .map(|s| s.acking_nodes().collect())
            .unwrap_or_default()
    }

    pub fn send_command(&mut self, handle: SessionHandle, data: Bytes, robust: bool) -> bool {
        match self.sessions.get_mut(handle).and_then(|s| s.sender_mut()) {
            Some(sender) => {
                sender.send_command(data, robust);
                true
            }
            None => false,
        }
    }

    // ─── Node accessors ─────────────────────────────────────────────────

    pub fn node_address(&self, handle: SessionHandle, node_id: u32) -> Option<std::net::SocketAddr> {
        self.sessions
            .get(handle)?
            .receiver()?
            .remote_sender(node_id)
            .map(|s| s.addr)
    }

    pub fn node_grtt(&self, handle: SessionHandle, node_id: u32) -> Option<f64> {
        self.sessions
            .get(handle)?
            .receiver()?
            .remote_sender(node_id)
            .map(|s| s.grtt())
    }

    /// Free a remote sender's buffers.
    pub fn node_free_buffers(&mut self, handle: SessionHandle, node_id: u32) -> bool {
        match self.sessions.get_mut(handle).and_then(|s| s.receiver_mut()) {
            Some(receiver) => {
                receiver.purge_sender(node_id);
                true
            }
            None => false,
        }
    }

    /// Answer an application-extended ack request from a remote sender.
    pub fn node_send_ack(
        &mut self,
        handle: SessionHandle,
        node_id: u32,
        ack_id: u8,
        data: Bytes,
    ) -> bool {
        match self.sessions.get_mut(handle).and_then(|s| s.receiver_mut()) {
            Some(receiver) => receiver.send_app_ack(node_id, ack_id, data),
            None => false,
        }
    }

    /// Automatically add receivers heard via congestion feedback to the
    /// acking set.
    pub fn set_auto_acking_nodes(&mut self, handle: SessionHandle, on: bool) -> bool {
        match self.sessions.get_mut(handle).and_then(|s| s.sender_mut()) {
            Some(sender) => {
                sender.set_auto_acking(on);
                true
            }
            None => false,
        }
    }

    /// Byte position the stream reader has consumed to.
    pub fn stream_read_offset(&mut self, obj: RxObjectHandle) -> Option<(u64, usize)> {
        self.sessions
            .get_mut(obj.session)?
            .receiver_mut()?
            .remote_sender_mut(obj.sender_id)?
            .object_mut(obj.object_id)?
            .stream_mut()
            .map(|s| s.read_position())
    }
}
