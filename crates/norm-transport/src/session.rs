//! # Session
//!
//! One session owns at most one local sender role plus the receive state for
//! any number of remote senders, all driven from a single cooperative loop:
//! the owner feeds inbound datagrams to [`Session::handle_packet`], calls
//! [`Session::on_timeout`] at the deadline reported by
//! [`Session::next_timeout`], and drains application events with
//! [`Session::get_next_event`].
//!
//! All I/O goes through the [`DatagramTransport`] collaborator; the session
//! never touches sockets itself.

use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, SocketAddr};

use bytes::Bytes;
use quanta::Instant;
use tracing::{trace, warn};

use crate::event::Event;
use crate::fec::FecError;
use crate::receiver::{Destination, Receiver, ReceiverConfig};
use crate::sender::{Sender, SenderConfig};
use crate::store::ObjectStore;
use crate::wire::{CmdBody, Message, MsgType};

// ─── Transport collaborator ─────────────────────────────────────────────────

/// The datagram plumbing a session runs over. Implementations wrap a UDP
/// socket (or an in-memory pipe in tests); the engine stays I/O-free.
pub trait DatagramTransport {
    /// Send one datagram. Partial sends are treated as failures.
    fn send_to(&mut self, payload: &[u8], to: SocketAddr) -> io::Result<usize>;

    fn join_multicast(&mut self, group: IpAddr, iface: Option<IpAddr>) -> io::Result<()>;

    fn leave_multicast(&mut self, group: IpAddr) -> io::Result<()>;

    fn set_ttl(&mut self, _ttl: u8) -> io::Result<()> {
        Ok(())
    }

    fn set_tos(&mut self, _tos: u8) -> io::Result<()> {
        Ok(())
    }

    fn set_loopback(&mut self, _on: bool) -> io::Result<()> {
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr;
}

// ─── Session ────────────────────────────────────────────────────────────────

/// Session identity and socket-level options.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Destination group (or unicast peer) address and port.
    pub group_addr: SocketAddr,
    pub local_node_id: u32,
    pub ttl: u8,
    pub tos: u8,
    /// Log one line per packet under the `norm::pkt` target.
    pub packet_trace: bool,
}

impl SessionConfig {
    pub fn new(group_addr: SocketAddr, local_node_id: u32) -> Self {
        SessionConfig {
            group_addr,
            local_node_id,
            ttl: 255,
            tos: 0,
            packet_trace: false,
        }
    }
}

/// A NORM protocol session.
pub struct Session {
    config: SessionConfig,
    transport: Box<dyn DatagramTransport>,
    sender: Option<Sender>,
    receiver: Option<Receiver>,
    events: VecDeque<Event>,
    /// Malformed datagrams dropped (logged once per episode).
    parse_errors: u64,
    parse_error_flag: bool,
}

impl Session {
    pub fn new(config: SessionConfig, mut transport: Box<dyn DatagramTransport>) -> Self {
        let _ = transport.set_ttl(config.ttl);
        let _ = transport.set_tos(config.tos);
        if config.group_addr.ip().is_multicast() {
            if let Err(err) = transport.join_multicast(config.group_addr.ip(), None) {
                warn!(%err, "multicast join failed");
            }
        }
        Session {
            config,
            transport,
            sender: None,
            receiver: None,
            events: VecDeque::new(),
            parse_errors: 0,
            parse_error_flag: false,
        }
    }

    pub fn local_node_id(&self) -> u32 {
        self.config.local_node_id
    }

    pub fn set_packet_trace(&mut self, on: bool) {
        self.config.packet_trace = on;
    }

    /// Datagrams dropped as malformed.
    pub fn parse_errors(&self) -> u64 {
        self.parse_errors
    }

    // ─── Roles ──────────────────────────────────────────────────────────

    /// Take on the sender role. Only one local sender per session.
    pub fn start_sender(&mut self, config: SenderConfig, now: Instant) -> Result<(), FecError> {
        let sender = Sender::new(self.config.local_node_id, config, now)?;
        self.sender = Some(sender);
        Ok(())
    }

    pub fn stop_sender(&mut self) {
        if self.sender.take().is_some() {
            self.events.push_back(Event::LocalSenderClosed);
        }
    }

    pub fn start_receiver(&mut self, config: ReceiverConfig, store: Box<dyn ObjectStore>) {
        self.receiver = Some(Receiver::new(self.config.local_node_id, config, store));
    }

    pub fn stop_receiver(&mut self) {
        self.receiver = None;
    }

    pub fn sender(&self) -> Option<&Sender> {
        self.sender.as_ref()
    }

    pub fn sender_mut(&mut self) -> Option<&mut Sender> {
        self.sender.as_mut()
    }

    pub fn receiver(&self) -> Option<&Receiver> {
        self.receiver.as_ref()
    }

    pub fn receiver_mut(&mut self) -> Option<&mut Receiver> {
        self.receiver.as_mut()
    }

    // ─── Event queue ────────────────────────────────────────────────────

    /// Pop the next application event, in occurrence order.
    pub fn get_next_event(&mut self) -> Option<Event> {
        self.collect_events();
        self.events.pop_front()
    }

    fn collect_events(&mut self) {
        if let Some(sender) = self.sender.as_mut() {
            self.events.extend(sender.drain_events());
        }
        if let Some(receiver) = self.receiver.as_mut() {
            self.events.extend(receiver.drain_events());
        }
    }

    // ─── Packet path ────────────────────────────────────────────────────

    /// Feed one received datagram into the session.
    pub fn handle_packet(&mut self, data: Bytes, from: SocketAddr, now: Instant) {
        let len = data.len();
        let Some(msg) = Message::decode(data) else {
            self.parse_errors += 1;
            if !self.parse_error_flag {
                self.parse_error_flag = true;
                warn!(%from, len, "malformed datagram dropped");
            }
            return;
        };
        self.parse_error_flag = false;
        if self.config.packet_trace {
            trace_packet("recv", &msg, from, len);
        }

        let local = self.config.local_node_id;
        match msg {
            // Control addressed to our sender role. Peer receivers still
            // overhear group-addressed NACKs for suppression.
            Message::Nack(nack) if nack.server_id == local => {
                if let Some(sender) = self.sender.as_mut() {
                    sender.handle_nack(&nack, now);
                }
                if let Some(receiver) = self.receiver.as_mut() {
                    receiver.handle_message(Message::Nack(nack), from, now);
                }
            }
            Message::Ack(ack) if ack.server_id == local => {
                if let Some(sender) = self.sender.as_mut() {
                    sender.handle_ack(&ack, now);
                }
            }
            other => {
                if let Some(receiver) = self.receiver.as_mut() {
                    receiver.handle_message(other, from, now);
                }
            }
        }
        self.pump_transmit(now);
    }

    // ─── Timers ─────────────────────────────────────────────────────────

    /// Deadline of the nearest session timer.
    pub fn next_timeout(&self) -> Option<Instant> {
        let s = self.sender.as_ref().and_then(|s| s.next_timeout());
        let r = self.receiver.as_ref().and_then(|r| r.next_timeout());
        match (s, r) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Drive all timers and flush any transmissions they release.
    pub fn on_timeout(&mut self, now: Instant) {
        if let Some(sender) = self.sender.as_mut() {
            sender.on_timeout(now);
        }
        if let Some(receiver) = self.receiver.as_mut() {
            receiver.on_timeout(now);
        }
        self.pump_transmit(now);
    }

    /// Send everything the roles have released, honoring the sender's pacing.
    fn pump_transmit(&mut self, now: Instant) {
        // Sender path: paced messages to the group address.
        loop {
            let Some(sender) = self.sender.as_mut() else {
                break;
            };
            let Some(msg) = sender.poll_transmit(now) else {
                break;
            };
            self.send_message(&msg, self.config.group_addr);
        }

        // Receiver path: NACK/ACK feedback, unpaced control traffic.
        let outputs: Vec<crate::receiver::OutgoingMessage> = match self.receiver.as_mut() {
            Some(receiver) => receiver.drain_outputs().collect(),
            None => Vec::new(),
        };
        for out in outputs {
            let to = match out.to {
                Destination::Group => self.config.group_addr,
                Destination::Sender(node) => self
                    .receiver
                    .as_ref()
                    .and_then(|r| r.remote_sender(node))
                    .map(|s| s.addr)
                    .unwrap_or(self.config.group_addr),
            };
            self.send_message(&out.message, to);
        }
    }

    fn send_message(&mut self, msg: &Message, to: SocketAddr) {
        let encoded = msg.encode();
        if self.config.packet_trace {
            trace_packet("send", msg, to, encoded.len());
        }
        match self.transport.send_to(&encoded, to) {
            Ok(n) if n == encoded.len() => {}
            Ok(_) | Err(_) => {
                self.events.push_back(Event::SendError);
            }
        }
    }
}

/// One-line packet trace: direction, peer, type, flavor, coordinates, length.
fn trace_packet(direction: &str, msg: &Message, peer: SocketAddr, len: usize) {
    let (flavor, obj, blk, seg) = match msg {
        Message::Data(d) => (
            String::new(),
            d.base.object_id.value() as i64,
            d.payload_id.block_id.value() as i64,
            d.payload_id.symbol_id as i64,
        ),
        Message::Info(i) => (String::new(), i.base.object_id.value() as i64, -1, -1),
        Message::Cmd(c) => {
            let flavor = format!("{:?}", c.flavor());
            match &c.body {
                CmdBody::Flush { object_id, payload_id, .. }
                | CmdBody::Squelch { object_id, payload_id, .. } => (
                    flavor,
                    object_id.value() as i64,
                    payload_id.block_id.value() as i64,
                    payload_id.symbol_id as i64,
                ),
                _ => (flavor, -1, -1, -1),
            }
        }
        _ => (String::new(), -1, -1, -1),
    };
    trace!(
        target: "norm::pkt",
        "{direction} peer={peer} type={:?} flavor={flavor} obj={obj} blk={blk} seg={seg} len={len}",
        msg_type_of(msg),
    );
}

fn msg_type_of(msg: &Message) -> MsgType {
    msg.msg_type()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Test transport that records every datagram it is asked to send.
    struct RecordingTransport {
        sent: Rc<RefCell<Vec<(Vec<u8>, SocketAddr)>>>,
        addr: SocketAddr,
    }

    impl DatagramTransport for RecordingTransport {
        fn send_to(&mut self, payload: &[u8], to: SocketAddr) -> io::Result<usize> {
            self.sent.borrow_mut().push((payload.to_vec(), to));
            Ok(payload.len())
        }

        fn join_multicast(&mut self, _group: IpAddr, _iface: Option<IpAddr>) -> io::Result<()> {
            Ok(())
        }

        fn leave_multicast(&mut self, _group: IpAddr) -> io::Result<()> {
            Ok(())
        }

        fn local_addr(&self) -> SocketAddr {
            self.addr
        }
    }

    fn make_session(node_id: u32) -> (Session, Rc<RefCell<Vec<(Vec<u8>, SocketAddr)>>>) {
        let sent = Rc::new(RefCell::new(Vec::new()));
        let transport = RecordingTransport {
            sent: sent.clone(),
            addr: "127.0.0.1:0".parse().unwrap(),
        };
        let config = SessionConfig::new("224.1.2.3:6003".parse().unwrap(), node_id);
        (Session::new(config, Box::new(transport)), sent)
    }

    #[test]
    fn sender_transmits_through_transport() {
        let now = Instant::now();
        let (mut session, sent) = make_session(10);
        session
            .start_sender(
                SenderConfig {
                    segment_size: 64,
                    ndata: 4,
                    nparity: 0,
                    grtt_probing: false,
                    tx_rate: 1.0e9,
                    ..Default::default()
                },
                now,
            )
            .unwrap();

        session
            .sender_mut()
            .unwrap()
            .enqueue_data(Bytes::from(vec![1u8; 100]), None)
            .unwrap();

        // Pump until the queue drains.
        let mut t = now;
        for _ in 0..64 {
            session.on_timeout(t);
            t += std::time::Duration::from_millis(1);
        }
        assert!(!sent.borrow().is_empty());
        // Everything went to the group address.
        for (_, to) in sent.borrow().iter() {
            assert_eq!(*to, "224.1.2.3:6003".parse().unwrap());
        }
        // And each datagram parses back.
        for (payload, _) in sent.borrow().iter() {
            assert!(Message::decode(Bytes::from(payload.clone())).is_some());
        }
    }

    #[test]
    fn malformed_packet_counted_not_fatal() {
        let now = Instant::now();
        let (mut session, _sent) = make_session(2);
        session.start_receiver(ReceiverConfig::default(), Box::new(MemoryStore::new()));

        session.handle_packet(
            Bytes::from_static(&[0xFF, 0x00, 0x01]),
            "10.0.0.9:1".parse().unwrap(),
            now,
        );
        assert_eq!(session.parse_errors(), 1);
        assert!(session.get_next_event().is_none());
    }

    #[test]
    fn stop_sender_reports_closed() {
        let now = Instant::now();
        let (mut session, _sent) = make_session(10);
        session.start_sender(SenderConfig::default(), now).unwrap();
        session.stop_sender();
        assert_eq!(session.get_next_event(), Some(Event::LocalSenderClosed));
    }

    #[test]
    fn events_flow_from_roles() {
        let now = Instant::now();
        let (mut session, _sent) = make_session(10);
        session
            .start_sender(
                SenderConfig {
                    grtt_probing: false,
                    ..Default::default()
                },
                now,
            )
            .unwrap();
        let id = session
            .sender_mut()
            .unwrap()
            .enqueue_data(Bytes::from(vec![0u8; 10]), None)
            .unwrap();
        session.sender_mut().unwrap().cancel_object(id);
        let mut saw_purge = false;
        while let Some(event) = session.get_next_event() {
            if matches!(event, Event::TxObjectPurged(_)) {
                saw_purge = true;
            }
        }
        assert!(saw_purge);
    }
}
