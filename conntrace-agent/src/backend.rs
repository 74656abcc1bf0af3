//! Outbound interface to the aggregation layer
//!
//! The tracer decides *what* happened; a [`Backend`] owns accumulation,
//! the closed-connection buffer and its export policy. Every method is
//! called synchronously from a hook and must not block.

use crate::sock::{Sock, SockId};
use crate::telemetry::MissCounter;
use conntrace_common::{direction, ConnTuple, TcpStats};

/// How the backend should apply the packet counters of an observation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketCountMode {
    /// Counters are running totals read off the socket; replace
    Absolute,
    /// Counters are deltas; add
    Increment,
    /// Counters carry no packet information
    None,
}

/// One normalized byte/packet observation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub tuple: ConnTuple,
    pub sent_bytes: u64,
    pub recv_bytes: u64,
    pub direction: u8,
    pub packets_out: u32,
    pub packets_in: u32,
    pub mode: PacketCountMode,
    pub sock: SockId,
}

impl Observation {
    /// Zero-byte observation with no packet information
    pub fn new(tuple: ConnTuple, sock: SockId) -> Self {
        Self {
            tuple,
            sent_bytes: 0,
            recv_bytes: 0,
            direction: direction::UNKNOWN,
            packets_out: 0,
            packets_in: 0,
            mode: PacketCountMode::None,
            sock,
        }
    }
}

pub trait Backend: Send + Sync {
    fn forward_observation(&self, observation: &Observation);

    fn update_tcp_stats(&self, tuple: &ConnTuple, stats: TcpStats);

    /// Read RTT and state off the socket; `state_hint` is a `tcp_state::*`
    /// transition to record, or zero
    fn notify_tcp_stats(&self, tuple: &ConnTuple, sk: &Sock, state_hint: u8);

    fn finalize_close(&self, tuple: &ConnTuple, sock: SockId);

    fn flush_if_full(&self);

    fn increment_miss_counter(&self, counter: MissCounter);
}

impl<B: Backend + ?Sized> Backend for std::sync::Arc<B> {
    fn forward_observation(&self, observation: &Observation) {
        (**self).forward_observation(observation)
    }

    fn update_tcp_stats(&self, tuple: &ConnTuple, stats: TcpStats) {
        (**self).update_tcp_stats(tuple, stats)
    }

    fn notify_tcp_stats(&self, tuple: &ConnTuple, sk: &Sock, state_hint: u8) {
        (**self).notify_tcp_stats(tuple, sk, state_hint)
    }

    fn finalize_close(&self, tuple: &ConnTuple, sock: SockId) {
        (**self).finalize_close(tuple, sock)
    }

    fn flush_if_full(&self) {
        (**self).flush_if_full()
    }

    fn increment_miss_counter(&self, counter: MissCounter) {
        (**self).increment_miss_counter(counter)
    }
}
