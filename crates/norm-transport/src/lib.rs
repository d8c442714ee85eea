//! # norm-transport
//!
//! Pure-Rust NACK-Oriented Reliable Multicast protocol engine.
//!
//! Reliable bulk delivery of files, memory objects, and byte streams from
//! senders to receiver groups over best-effort datagrams: systematic
//! Reed-Solomon FEC over GF(2^8), timer-suppressed negative acknowledgment,
//! positive watermark acknowledgment from a named receiver set, GRTT probing,
//! and a TCP-friendly rate loop.
//!
//! ## Crate structure
//!
//! - [`wire`] — NORM message pack/unpack, header extensions, repair requests
//! - [`quantize`] — RTT / group-size / rate wire-field quantization
//! - [`fec`] — systematic Reed-Solomon erasure codec over GF(2^8)
//! - [`bitmask`] — dense bitmaps for pending/repair symbol tracking
//! - [`seq`] — wrapping object and block identifier arithmetic
//! - [`pool`] — fixed-size segment arena with overrun accounting
//! - [`block`] — per-block state and the sliding block window
//! - [`object`] — FILE/DATA/STREAM transport objects, both roles
//! - [`stream`] — circular stream segment ring with message boundaries
//! - [`sender`] — tx cache, scheduler, pacing, GRTT probe, watermark/flush
//! - [`receiver`] — per-remote-sender state, NACK backoff and suppression
//! - [`congestion`] — TCP-friendly rate controller (FIXED/CC/CCE/CCL)
//! - [`session`] — one sender + N remote senders over a datagram transport
//! - [`store`] — random-access object store collaborator for FILE objects
//! - [`event`] — the application event enum
//! - [`api`] — handle-based facade over instances, sessions, and objects
//! - [`stats`] — sender/receiver counters

pub mod api;
pub mod bitmask;
pub mod block;
pub mod congestion;
pub mod event;
pub mod fec;
pub mod object;
pub mod pool;
pub mod quantize;
pub mod receiver;
pub mod sender;
pub mod seq;
pub mod session;
pub mod stats;
pub mod store;
pub mod stream;
pub mod wire;
