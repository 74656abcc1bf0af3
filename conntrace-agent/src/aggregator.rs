//! In-memory aggregation backend
//!
//! Accumulates observations into per-connection statistics keyed by the
//! resolved tuple, keeps TCP protocol counters alongside, and hands closed
//! connections to a consumer in batches over a bounded channel.

use crate::backend::{Backend, Observation, PacketCountMode};
use crate::config::TracerConfig;
use crate::error::Result;
use crate::sock::{Sock, SockId};
use crate::telemetry::{MissCounter, Telemetry};
use conntrace_common::{direction, family, protocol, ConnTuple, TcpStats};
use dashmap::DashMap;
use log::{debug, info, warn};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, Receiver, Sender};

/// Aggregated connection statistics
#[derive(Debug, Clone)]
pub struct ConnStats {
    pub sent_bytes: u64,
    pub recv_bytes: u64,
    pub sent_packets: u64,
    pub recv_packets: u64,
    pub direction: u8,
    pub sock: SockId,
    pub first_seen: Instant,
    pub last_seen: Instant,
}

impl ConnStats {
    fn new(sock: SockId) -> Self {
        let now = Instant::now();
        Self {
            sent_bytes: 0,
            recv_bytes: 0,
            sent_packets: 0,
            recv_packets: 0,
            direction: direction::UNKNOWN,
            sock,
            first_seen: now,
            last_seen: now,
        }
    }

    fn update(&mut self, obs: &Observation) {
        self.sent_bytes += obs.sent_bytes;
        self.recv_bytes += obs.recv_bytes;

        match obs.mode {
            PacketCountMode::Absolute => {
                self.sent_packets = obs.packets_out as u64;
                self.recv_packets = obs.packets_in as u64;
            }
            PacketCountMode::Increment => {
                self.sent_packets += obs.packets_out as u64;
                self.recv_packets += obs.packets_in as u64;
            }
            PacketCountMode::None => {}
        }

        if self.direction == direction::UNKNOWN {
            self.direction = obs.direction;
        }
        self.last_seen = Instant::now();
    }
}

/// TCP counters with the time they were last touched
#[derive(Debug, Clone, Copy)]
struct TcpEntry {
    stats: TcpStats,
    last_seen: Instant,
}

/// A finalized connection handed to the consumer
#[derive(Debug, Clone)]
pub struct ClosedConn {
    pub tuple: ConnTuple,
    pub stats: Option<ConnStats>,
    pub tcp: Option<TcpStats>,
}

/// Connection aggregator that groups observations by tuple
#[derive(Clone)]
pub struct ConnAggregator {
    conns: Arc<DashMap<ConnTuple, ConnStats>>,
    tcp_stats: Arc<DashMap<ConnTuple, TcpEntry>>,
    closed: Arc<Mutex<Vec<ClosedConn>>>,
    closed_tx: Sender<Vec<ClosedConn>>,
    batch_size: usize,
    telemetry: Arc<Telemetry>,
    events_processed: Arc<AtomicU64>,
    batches_dropped: Arc<AtomicU64>,
    conn_timeout: Duration,
}

impl ConnAggregator {
    /// Create an aggregator and the receiving end of its closed-connection channel
    pub fn new(config: &TracerConfig) -> Result<(Self, Receiver<Vec<ClosedConn>>)> {
        config.validate()?;

        let (closed_tx, closed_rx) = mpsc::channel(config.closed_channel_capacity);
        let aggregator = Self {
            conns: Arc::new(DashMap::new()),
            tcp_stats: Arc::new(DashMap::new()),
            closed: Arc::new(Mutex::new(Vec::with_capacity(config.closed_batch_size))),
            closed_tx,
            batch_size: config.closed_batch_size,
            telemetry: Arc::new(Telemetry::new()),
            events_processed: Arc::new(AtomicU64::new(0)),
            batches_dropped: Arc::new(AtomicU64::new(0)),
            conn_timeout: Duration::from_secs(config.conn_timeout_secs),
        };
        Ok((aggregator, closed_rx))
    }

    pub fn get(&self, tuple: &ConnTuple) -> Option<ConnStats> {
        self.conns.get(tuple).map(|r| r.clone())
    }

    pub fn get_tcp_stats(&self, tuple: &ConnTuple) -> Option<TcpStats> {
        self.tcp_stats.get(&tcp_key(tuple)).map(|r| r.stats)
    }

    /// All open connections
    pub fn connections(&self) -> Vec<(ConnTuple, ConnStats)> {
        self.conns
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    pub fn active_connection_count(&self) -> usize {
        self.conns.len()
    }

    /// Closed connections waiting for the next flush
    pub fn pending_closed(&self) -> usize {
        self.lock_closed().len()
    }

    pub fn events_processed(&self) -> u64 {
        self.events_processed.load(Ordering::Relaxed)
    }

    pub fn batches_dropped(&self) -> u64 {
        self.batches_dropped.load(Ordering::Relaxed)
    }

    /// Drop connections idle for longer than the configured timeout.
    ///
    /// Connections that never see a close (per-peer tuples of an unconnected
    /// UDP socket) are only ever removed here; call it periodically.
    pub fn expire_idle_connections(&self) -> usize {
        match Instant::now().checked_sub(self.conn_timeout) {
            Some(cutoff) => self.expire_idle_since(cutoff),
            None => 0,
        }
    }

    /// Drop connections and TCP counters last touched at or before `cutoff`
    pub fn expire_idle_since(&self, cutoff: Instant) -> usize {
        let before = self.conns.len();
        self.conns.retain(|_, stats| stats.last_seen > cutoff);
        self.tcp_stats.retain(|_, entry| entry.last_seen > cutoff);

        let expired = before.saturating_sub(self.conns.len());
        if expired > 0 {
            info!("Expired {} idle connections", expired);
        }
        expired
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    fn send_batch(&self, batch: Vec<ClosedConn>) {
        if let Err(e) = self.closed_tx.try_send(batch) {
            self.batches_dropped.fetch_add(1, Ordering::Relaxed);
            warn!("Dropped closed connection batch: {}", e);
        }
    }

    fn lock_closed(&self) -> std::sync::MutexGuard<'_, Vec<ClosedConn>> {
        self.closed.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Backend for ConnAggregator {
    fn forward_observation(&self, obs: &Observation) {
        self.events_processed.fetch_add(1, Ordering::Relaxed);

        self.conns
            .entry(obs.tuple)
            .or_insert_with(|| ConnStats::new(obs.sock))
            .update(obs);
    }

    fn update_tcp_stats(&self, tuple: &ConnTuple, stats: TcpStats) {
        let mut entry = self.tcp_stats.entry(tcp_key(tuple)).or_insert_with(|| TcpEntry {
            stats: TcpStats::default(),
            last_seen: Instant::now(),
        });
        entry.last_seen = Instant::now();
        let current = &mut entry.stats;

        current.retransmits += stats.retransmits;
        current.state_transitions |= stats.state_transitions;
        if stats.rtt > 0 {
            current.rtt = stats.rtt;
            current.rtt_var = stats.rtt_var;
        }
    }

    fn notify_tcp_stats(&self, tuple: &ConnTuple, sk: &Sock, state_hint: u8) {
        let state_transitions = if state_hint > 0 { 1 << state_hint } else { 0 };
        let stats = TcpStats {
            rtt: sk.rtt,
            rtt_var: sk.rtt_var,
            state_transitions,
            ..Default::default()
        };
        self.update_tcp_stats(tuple, stats);
    }

    fn finalize_close(&self, tuple: &ConnTuple, sock: SockId) {
        let stats = self.conns.remove(tuple).map(|(_, v)| v);
        let tcp = if tuple.is_tcp() {
            self.tcp_stats.remove(&tcp_key(tuple)).map(|(_, v)| v.stats)
        } else {
            None
        };

        if stats.is_none() && tcp.is_none() {
            debug!("close of untracked connection {} (sock {:?})", format_tuple(tuple), sock);
            return;
        }

        let conn = ClosedConn {
            tuple: *tuple,
            stats,
            tcp,
        };

        let mut closed = self.lock_closed();
        if closed.len() >= self.batch_size {
            drop(closed);
            // batch is waiting for a flush; ship this one on its own
            self.send_batch(vec![conn]);
            return;
        }
        closed.push(conn);
    }

    fn flush_if_full(&self) {
        let batch = {
            let mut closed = self.lock_closed();
            if closed.len() < self.batch_size {
                return;
            }
            std::mem::replace(&mut *closed, Vec::with_capacity(self.batch_size))
        };
        self.send_batch(batch);
    }

    fn increment_miss_counter(&self, counter: MissCounter) {
        self.telemetry.increment(counter);
    }
}

/// TCP counters are kept per connection regardless of the owning pid, so
/// retransmits observed outside process context land on the same entry
fn tcp_key(tuple: &ConnTuple) -> ConnTuple {
    ConnTuple {
        pid: 0,
        direction: direction::UNKNOWN,
        ..*tuple
    }
}

/// Format one side of a tuple's address
pub fn format_addr(fam: u8, h: u64, l: u64) -> String {
    match fam {
        family::V4 => Ipv4Addr::from(l as u32).to_string(),
        _ => Ipv6Addr::from(((h as u128) << 64) | l as u128).to_string(),
    }
}

/// Format a tuple as `PROTO src:port -> dst:port`
pub fn format_tuple(t: &ConnTuple) -> String {
    format!(
        "{} {}:{} -> {}:{} (pid {}, netns {}, {})",
        format_protocol(t.protocol),
        format_addr(t.family, t.saddr_h, t.saddr_l),
        t.sport,
        format_addr(t.family, t.daddr_h, t.daddr_l),
        t.dport,
        t.pid,
        t.netns,
        format_direction(t.direction)
    )
}

/// Format protocol number to string
pub fn format_protocol(proto: u8) -> &'static str {
    match proto {
        protocol::TCP => "TCP",
        protocol::UDP => "UDP",
        _ => "OTHER",
    }
}

/// Format direction to string
pub fn format_direction(dir: u8) -> &'static str {
    match dir {
        direction::INCOMING => "incoming",
        direction::OUTGOING => "outgoing",
        _ => "unknown",
    }
}
