//! conntrace: connection tuple resolution for kernel socket tracing
//!
//! Re-exports the shared tuple types and the tracer engine.

#[cfg(feature = "common")]
pub use conntrace_common as common;

#[cfg(feature = "agent")]
pub use conntrace_agent as agent;

#[cfg(feature = "agent")]
pub use conntrace_agent::{
    Backend, ConnAggregator, ConnTraceError, Observation, Result, Tracer, TracerConfig,
};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
