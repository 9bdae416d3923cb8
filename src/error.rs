use crate::packet::DecodeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed message: {0}")]
    Decode(#[from] DecodeError),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Flow table full: {capacity} flows tracked")]
    FlowTableFull { capacity: usize },
}

pub type Result<T> = std::result::Result<T, Error>;
