//! Crate-wide error type.
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the relay core.
///
/// Variants are grouped by how they ultimately surface: some end up in a
/// `NOTICE`, some in an `OK`/`CLOSED` reply, some are fatal to the process.
#[derive(Error, Debug)]
pub enum Error {
    #[error("could not parse message")]
    ProtoParseError,
    #[error("event is larger than max size ({0} bytes)")]
    EventMaxLengthError(usize),
    #[error("invalid event id: {0}")]
    InvalidEventId(String),
    #[error("invalid event signature")]
    InvalidSignature,
    #[error("event id does not match contents")]
    EventIdMismatch,
    #[error("event blocked: {0}")]
    Blocked(String),
    #[error("event rejected: {0}")]
    Invalid(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("event has expired")]
    Expired,
    #[error("invalid filter: {0}")]
    InvalidFilter(String),
    #[error("invalid subscription id")]
    InvalidSubscriptionId,
    #[error("too many subscriptions")]
    SubscriptionLimitExceeded,
    #[error("sql error: {0}")]
    SqlError(#[from] sqlx::Error),
    #[error("config error: {0}")]
    ConfigError(#[from] config::ConfigError),
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("json error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("hex decode error: {0}")]
    HexError(#[from] hex::FromHexError),
    #[error("secp256k1 error: {0}")]
    Secp256k1Error(#[from] secp256k1::Error),
    #[error("custom error: {0}")]
    CustomError(String),
}
