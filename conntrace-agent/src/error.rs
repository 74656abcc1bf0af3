use crate::telemetry::Table;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConnTraceError {
    #[error("{table} map is full (capacity {capacity})")]
    MapFull { table: Table, capacity: usize },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConnTraceError>;
