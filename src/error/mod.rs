//! Error types for the client runtime
//!
//! Every fallible operation returns [`ClientError`]. Errors are grouped into
//! classes ([`ErrorClass`]) that decide how the runtime reacts: transient
//! errors are retried with backoff, fencing errors end the current session,
//! handler and codec errors are confined to the record that raised them.

use thiserror::Error;

use crate::codec::CodecError;
use crate::record::{Epoch, TopicPartition};

mod domain;
mod error_code;

pub use domain::ConfigError;
pub use error_code::ErrorCode;

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// Main error type for the client runtime
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Request timeout: {0}")]
    Timeout(String),

    #[error("Broker not available: {0}")]
    BrokerNotAvailable(String),

    #[error("Coordinator not available for group {0}")]
    CoordinatorNotAvailable(String),

    #[error("Rebalance in progress for group {0}")]
    RebalanceInProgress(String),

    #[error("Group {group_id} unreachable after {attempts} join attempts")]
    GroupUnreachable { group_id: String, attempts: u32 },

    #[error("Unknown member {member_id} in group {group_id}")]
    UnknownMember { group_id: String, member_id: String },

    #[error("Stale epoch for {partition}: current {current}, request {requested}")]
    StaleEpoch {
        partition: TopicPartition,
        current: Epoch,
        requested: Epoch,
    },

    #[error("Producer fenced: producer_id={producer_id}, epoch={epoch}")]
    ProducerFenced { producer_id: i64, epoch: i16 },

    #[error("Sequence gap on {partition}: expected {expected}, received {received}")]
    SequenceGap {
        partition: TopicPartition,
        expected: i32,
        received: i32,
    },

    #[error("Transaction already active: {0}")]
    AlreadyActive(String),

    #[error("Invalid transaction state: cannot {operation} while {state}")]
    InvalidTransactionState { state: String, operation: String },

    #[error("Transaction aborted: {0}")]
    TransactionAborted(String),

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    #[error("No committed offset and no reset policy for {0}")]
    NoOffsetForPartition(TopicPartition),

    #[error("Partition {0} is not assigned to this consumer")]
    NotAssigned(TopicPartition),

    #[error("{operation} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last: Box<ClientError>,
    },

    #[error("Client is shutting down")]
    ShuttingDown,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// How the runtime reacts to an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retried with backoff up to a bound
    Transient,
    /// Ends the current session; never retried
    Fencing,
    /// Raised while processing a record
    Handler,
    /// Payload could not be encoded or decoded
    Codec,
    /// Caller misuse or misconfiguration
    Usage,
    /// Anything else
    Fatal,
}

impl ClientError {
    /// Create a transaction state error
    pub fn invalid_txn_state(state: impl ToString, operation: impl Into<String>) -> Self {
        ClientError::InvalidTransactionState {
            state: state.to_string(),
            operation: operation.into(),
        }
    }

    /// Map the error onto a wire-level error code
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ClientError::Timeout(_) => ErrorCode::RequestTimedOut,
            ClientError::BrokerNotAvailable(_) => ErrorCode::BrokerNotAvailable,
            ClientError::Io(_) => ErrorCode::NetworkException,
            ClientError::CoordinatorNotAvailable(_) | ClientError::GroupUnreachable { .. } => {
                ErrorCode::CoordinatorNotAvailable
            }
            ClientError::RebalanceInProgress(_) => ErrorCode::RebalanceInProgress,
            ClientError::UnknownMember { .. } => ErrorCode::UnknownMemberId,
            ClientError::StaleEpoch { .. } => ErrorCode::IllegalGeneration,
            ClientError::ProducerFenced { .. } => ErrorCode::ProducerFenced,
            ClientError::SequenceGap { .. } => ErrorCode::OutOfOrderSequenceNumber,
            ClientError::AlreadyActive(_) | ClientError::InvalidTransactionState { .. } => {
                ErrorCode::InvalidTxnState
            }
            ClientError::Codec(_) => ErrorCode::InvalidRecord,
            ClientError::Config(_) => ErrorCode::InvalidConfig,
            ClientError::UnknownTopic(_) | ClientError::NotAssigned(_) => {
                ErrorCode::UnknownTopicOrPartition
            }
            ClientError::RetriesExhausted { last, .. } => last.error_code(),
            _ => ErrorCode::UnknownServerError,
        }
    }

    /// Returns true if the error may succeed on retry
    pub fn is_retriable(&self) -> bool {
        match self {
            ClientError::RetriesExhausted { .. } | ClientError::GroupUnreachable { .. } => false,
            _ => self.error_code().is_retriable(),
        }
    }

    /// Returns true if the error fences the current member or producer session
    pub fn is_fencing(&self) -> bool {
        matches!(
            self,
            ClientError::StaleEpoch { .. }
                | ClientError::UnknownMember { .. }
                | ClientError::ProducerFenced { .. }
        )
    }

    pub fn class(&self) -> ErrorClass {
        if self.is_fencing() {
            return ErrorClass::Fencing;
        }
        if self.is_retriable() {
            return ErrorClass::Transient;
        }
        match self {
            ClientError::Handler(_) => ErrorClass::Handler,
            ClientError::Codec(_) => ErrorClass::Codec,
            ClientError::Config(_)
            | ClientError::AlreadyActive(_)
            | ClientError::InvalidTransactionState { .. }
            | ClientError::NotAssigned(_)
            | ClientError::UnknownTopic(_)
            | ClientError::NoOffsetForPartition(_) => ErrorClass::Usage,
            _ => ErrorClass::Fatal,
        }
    }
}

impl From<&ClientError> for i16 {
    fn from(err: &ClientError) -> i16 {
        err.error_code().as_i16()
    }
}
