use crate::foundation::types::Address;
use std::io;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Config,
    ChainTransient,
    ChainPermanent,
    KeepNotFound,
    KeepExists,
    Transport,
    UnknownPeer,
    Protocol,
    ReadinessTimeout,
    Persistence,
    Serialization,
    InvalidMember,
    InvalidGroup,
    Cancelled,
    Message,
}

#[derive(Debug, Error)]
pub enum OperatorError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("chain error during {operation}: {details}")]
    ChainTransient { operation: String, details: String },

    #[error("chain rejected {operation}: {details}")]
    ChainPermanent { operation: String, details: String },

    #[error("failed to find keep with address: [{0}]")]
    KeepNotFound(Address),

    #[error("keep already exists for address [{0}]")]
    KeepExists(Address),

    #[error("transport error during {operation}: {details}")]
    Transport { operation: String, details: String },

    #[error("unknown peer: [{0}]")]
    UnknownPeer(String),

    #[error("protocol failure in {phase}: {details}")]
    Protocol { phase: String, details: String },

    #[error("readiness barrier expired after {waited_secs}s; missing ready from [{missing}]")]
    ReadinessTimeout { waited_secs: u64, missing: String },

    #[error("persistence error during {operation}: {details}")]
    Persistence { operation: String, details: String },

    #[error("{format} serialization error: {details}")]
    Serialization { format: String, details: String },

    #[error("member ID must be greater than 0, but found [{0}]")]
    InvalidMember(String),

    #[error("invalid group: {0}")]
    InvalidGroup(String),

    #[error("session cancelled")]
    Cancelled,

    #[error("{0}")]
    Message(String),
}

pub type Result<T> = std::result::Result<T, OperatorError>;

impl OperatorError {
    pub fn code(&self) -> ErrorCode {
        match self {
            OperatorError::Config(_) => ErrorCode::Config,
            OperatorError::ChainTransient { .. } => ErrorCode::ChainTransient,
            OperatorError::ChainPermanent { .. } => ErrorCode::ChainPermanent,
            OperatorError::KeepNotFound(_) => ErrorCode::KeepNotFound,
            OperatorError::KeepExists(_) => ErrorCode::KeepExists,
            OperatorError::Transport { .. } => ErrorCode::Transport,
            OperatorError::UnknownPeer(_) => ErrorCode::UnknownPeer,
            OperatorError::Protocol { .. } => ErrorCode::Protocol,
            OperatorError::ReadinessTimeout { .. } => ErrorCode::ReadinessTimeout,
            OperatorError::Persistence { .. } => ErrorCode::Persistence,
            OperatorError::Serialization { .. } => ErrorCode::Serialization,
            OperatorError::InvalidMember(_) => ErrorCode::InvalidMember,
            OperatorError::InvalidGroup(_) => ErrorCode::InvalidGroup,
            OperatorError::Cancelled => ErrorCode::Cancelled,
            OperatorError::Message(_) => ErrorCode::Message,
        }
    }

    /// Chain submissions are retried only for transient failures.
    pub fn is_transient_chain_error(&self) -> bool {
        matches!(self, OperatorError::ChainTransient { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, OperatorError::Cancelled)
    }

    pub fn protocol(phase: impl Into<String>, details: impl Into<String>) -> Self {
        OperatorError::Protocol { phase: phase.into(), details: details.into() }
    }

    pub fn transport(operation: impl Into<String>, details: impl Into<String>) -> Self {
        OperatorError::Transport { operation: operation.into(), details: details.into() }
    }

    pub fn persistence(operation: impl Into<String>, details: impl Into<String>) -> Self {
        OperatorError::Persistence { operation: operation.into(), details: details.into() }
    }
}

impl From<io::Error> for OperatorError {
    fn from(err: io::Error) -> Self {
        OperatorError::Persistence { operation: "io".to_string(), details: err.to_string() }
    }
}

impl From<hex::FromHexError> for OperatorError {
    fn from(err: hex::FromHexError) -> Self {
        OperatorError::Serialization { format: "hex".to_string(), details: err.to_string() }
    }
}

impl From<toml::de::Error> for OperatorError {
    fn from(err: toml::de::Error) -> Self {
        OperatorError::Config(format!("TOML parsing error: {}", err))
    }
}

impl From<bincode::Error> for OperatorError {
    fn from(err: bincode::Error) -> Self {
        OperatorError::Serialization { format: "bincode".to_string(), details: err.to_string() }
    }
}

impl From<serde_json::Error> for OperatorError {
    fn from(err: serde_json::Error) -> Self {
        OperatorError::Serialization { format: "json".to_string(), details: err.to_string() }
    }
}

impl From<k256::ecdsa::Error> for OperatorError {
    fn from(err: k256::ecdsa::Error) -> Self {
        OperatorError::Protocol { phase: "ecdsa".to_string(), details: err.to_string() }
    }
}
