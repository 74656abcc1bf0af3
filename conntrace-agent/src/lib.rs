//! Connection tracer engine for conntrace
//!
//! Responsibilities:
//! - Resolve connection tuples from socket, flow and sockaddr snapshots
//! - Correlate entry/exit hook pairs through bounded pending tables
//! - Track bound TCP and UDP ports for direction inference
//! - Index `(pid, fd)` to sockets for descriptor-only hooks
//! - Forward normalized observations to an aggregation backend

pub mod aggregator;
pub mod backend;
pub mod bindings;
pub mod bounded;
pub mod config;
pub mod error;
pub mod pending;
pub mod resolver;
pub mod sock;
pub mod sockfd;
pub mod telemetry;
pub mod tracer;

pub use aggregator::{ClosedConn, ConnAggregator, ConnStats};
pub use backend::{Backend, Observation, PacketCountMode};
pub use config::TracerConfig;
pub use error::{ConnTraceError, Result};
pub use sock::{Flow4, Flow6, Sock, SockAddr, SockId, Socket};
pub use telemetry::{MissCounter, Table, Telemetry};
pub use tracer::Tracer;
