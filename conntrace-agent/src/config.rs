//! Tracer configuration
//!
//! Every table is fixed-capacity; these settings size them. All fields
//! have defaults so a partial YAML document is valid.

use crate::error::{ConnTraceError, Result};
use anyhow::Context;
use log::info;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TracerConfig {
    /// Sockets with a connect in flight
    pub ongoing_connect_capacity: usize,
    /// Threads with a UDP send between `udp_send_skb` and `udp_sendmsg` exit
    pub udp_send_capacity: usize,
    /// Bound TCP listening ports
    pub port_bindings_capacity: usize,
    /// Bound UDP ports
    pub udp_port_bindings_capacity: usize,
    /// Indexed descriptors, per direction
    pub sockfd_capacity: usize,
    /// Closed connections buffered before a flush
    pub closed_batch_size: usize,
    /// Closed-connection batches queued for the consumer
    pub closed_channel_capacity: usize,
    /// Idle time after which the aggregator forgets an unclosed connection
    pub conn_timeout_secs: u64,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            ongoing_connect_capacity: 10240,
            udp_send_capacity: 1024,
            port_bindings_capacity: 8192,
            udp_port_bindings_capacity: 8192,
            sockfd_capacity: 1024,
            closed_batch_size: 4,
            closed_channel_capacity: 1024,
            conn_timeout_secs: 30,
        }
    }
}

impl TracerConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::from_yaml_str(&yaml)
            .with_context(|| format!("Invalid config file {}", path.display()))?;

        info!("Loaded tracer config from {}", path.display());
        Ok(config)
    }

    /// Reject settings that would make a table unusable
    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("ongoing_connect_capacity", self.ongoing_connect_capacity),
            ("udp_send_capacity", self.udp_send_capacity),
            ("port_bindings_capacity", self.port_bindings_capacity),
            ("udp_port_bindings_capacity", self.udp_port_bindings_capacity),
            ("sockfd_capacity", self.sockfd_capacity),
            ("closed_batch_size", self.closed_batch_size),
            ("closed_channel_capacity", self.closed_channel_capacity),
        ];

        for (name, value) in sizes {
            if value == 0 {
                return Err(ConnTraceError::ConfigError(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }

        if self.conn_timeout_secs == 0 {
            return Err(ConnTraceError::ConfigError(
                "conn_timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
