//! Error types for the positions crate

use pubsub_client::ClientError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PositionsError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Client error: {0}")]
    Client(#[from] ClientError),
}

/// Unknown value in the `status` column
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown position status: {0}")]
pub struct UnknownStatus(pub String);

pub type Result<T> = std::result::Result<T, PositionsError>;
