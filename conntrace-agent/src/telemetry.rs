//! Diagnostic counters for the engine's own drop and miss rates
//!
//! Counters are monotonic and fire-and-forget: incrementing one never
//! changes control flow.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Bounded tables owned by the tracer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    OngoingConnect,
    UdpSendArgs,
    TcpPortBindings,
    UdpPortBindings,
    SockByPidFd,
    PidFdBySock,
}

impl Table {
    pub const ALL: [Table; 6] = [
        Table::OngoingConnect,
        Table::UdpSendArgs,
        Table::TcpPortBindings,
        Table::UdpPortBindings,
        Table::SockByPidFd,
        Table::PidFdBySock,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Table::OngoingConnect => "tcp_ongoing_connect_pid",
            Table::UdpSendArgs => "udp_send_skb_args",
            Table::TcpPortBindings => "port_bindings",
            Table::UdpPortBindings => "udp_port_bindings",
            Table::SockByPidFd => "sock_by_pid_fd",
            Table::PidFdBySock => "pid_fd_by_sock",
        }
    }

    const fn index(&self) -> usize {
        match self {
            Table::OngoingConnect => 0,
            Table::UdpSendArgs => 1,
            Table::TcpPortBindings => 2,
            Table::UdpPortBindings => 3,
            Table::SockByPidFd => 4,
            Table::PidFdBySock => 5,
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named diagnostic counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MissCounter {
    /// Neither the socket nor the flow descriptor produced a tuple at UDP send
    UdpSendMissed,
    /// A UDP send returned without a staged tuple for its thread
    UdpSendUnmatched,
    /// A bind or unbind could not determine the local port
    UnknownPort,
    /// An insert into a full table was dropped
    MapFull(Table),
}

impl MissCounter {
    pub const COUNT: usize = 3 + Table::ALL.len();

    const fn index(&self) -> usize {
        match self {
            MissCounter::UdpSendMissed => 0,
            MissCounter::UdpSendUnmatched => 1,
            MissCounter::UnknownPort => 2,
            MissCounter::MapFull(table) => 3 + table.index(),
        }
    }

    pub fn name(&self) -> String {
        match self {
            MissCounter::UdpSendMissed => "udp_send_missed".to_string(),
            MissCounter::UdpSendUnmatched => "udp_send_unmatched".to_string(),
            MissCounter::UnknownPort => "unknown_port".to_string(),
            MissCounter::MapFull(table) => format!("{}_full", table),
        }
    }
}

/// Fixed block of relaxed atomic counters, one per [`MissCounter`]
#[derive(Debug)]
pub struct Telemetry {
    counters: [AtomicU64; MissCounter::COUNT],
}

impl Telemetry {
    pub fn new() -> Self {
        Self {
            counters: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    pub fn increment(&self, counter: MissCounter) {
        self.counters[counter.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, counter: MissCounter) -> u64 {
        self.counters[counter.index()].load(Ordering::Relaxed)
    }

    /// Snapshot of every nonzero counter, for logging or export
    pub fn snapshot(&self) -> Vec<(String, u64)> {
        let mut all = vec![
            MissCounter::UdpSendMissed,
            MissCounter::UdpSendUnmatched,
            MissCounter::UnknownPort,
        ];
        all.extend(Table::ALL.iter().copied().map(MissCounter::MapFull));

        all.into_iter()
            .map(|c| (c.name(), self.get(c)))
            .filter(|(_, n)| *n > 0)
            .collect()
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}
