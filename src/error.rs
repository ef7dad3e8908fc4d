use std::time::Duration;
use thiserror::Error;

/// Frame-level failures from parsing, building or unpacking LoRaWAN payloads
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("invalid gateway EUI: {0}")]
    InvalidGateway(String),

    #[error("invalid rxpk: {0}")]
    InvalidRxpk(String),

    #[error("port 29 container truncated: message declares {declared} bytes, {remaining} remain")]
    TruncatedContainer { declared: usize, remaining: usize },

    #[error("port 29 container holds no messages")]
    EmptyContainer,

    #[error("{field} must be valid hex")]
    InvalidHex { field: String },

    #[error("{field} must be {expected} bytes, got {actual}")]
    InvalidLength {
        field: String,
        expected: usize,
        actual: usize,
    },
}

#[derive(Debug, Error)]
pub enum DecoderError {
    #[error("decoder failed: {0}")]
    Failed(String),

    #[error("decoder did not finish within {0:?}")]
    Timeout(Duration),

    #[error("decoder returned malformed output: {0}")]
    MalformedOutput(String),

    #[error("invalid decoder selection: {0}")]
    InvalidSelection(String),

    #[error("decoder file not found: {0}")]
    NotFound(String),

    #[error("uploaded decoders are disabled")]
    UploadsDisabled,

    #[error("failed to run decoder process: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("missing session keys for {}", .0.join(", "))]
    MissingKeys(Vec<String>),

    #[error(transparent)]
    Decoder(#[from] DecoderError),
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("no valid uplinks found ({} validation errors)", .errors.len())]
    NoValidRecords { errors: Vec<String> },

    #[error("failed to read log: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReplayError {
    #[error("replay job not found")]
    NotFound,

    #[error("replay job is {0}, only stopped jobs can be resumed")]
    NotResumable(String),

    #[error("nothing to replay")]
    NoRecords,
}

#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("{0}")]
    Invalid(String),

    #[error(transparent)]
    Codec(#[from] CodecError),
}
