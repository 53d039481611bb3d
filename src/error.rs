use thiserror::Error;

use crate::pool::spawner::SpawnError;
use crate::rpc::codec::CodecError;

#[derive(Error, Debug)]
pub enum SlipwayError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Spawn error: {0}")]
    Spawn(#[from] SpawnError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, SlipwayError>;
