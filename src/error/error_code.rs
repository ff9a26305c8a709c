//! Kafka-compatible error codes for client errors

/// Wire-level error codes the runtime maps its errors onto.
/// See: <https://kafka.apache.org/protocol.html#protocol_error_codes>
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum ErrorCode {
    /// No error
    None = 0,
    /// Unknown server error
    UnknownServerError = -1,
    /// Unknown topic or partition
    UnknownTopicOrPartition = 3,
    /// Request timed out
    RequestTimedOut = 7,
    /// Broker not available
    BrokerNotAvailable = 8,
    /// Network exception
    NetworkException = 13,
    /// Coordinator not available
    CoordinatorNotAvailable = 15,
    /// Illegal generation
    IllegalGeneration = 22,
    /// Unknown member id
    UnknownMemberId = 25,
    /// Rebalance in progress
    RebalanceInProgress = 27,
    /// Record payload could not be decoded
    InvalidRecord = 87,
    /// Sequence number out of order
    OutOfOrderSequenceNumber = 45,
    /// Duplicate sequence number
    DuplicateSequenceNumber = 46,
    /// Producer epoch is stale
    InvalidProducerEpoch = 47,
    /// Transaction state does not allow the operation
    InvalidTxnState = 48,
    /// Another transactional producer with the same id is active
    ProducerFenced = 90,
    /// Concurrent transactions
    ConcurrentTransactions = 51,
    /// Invalid configuration
    InvalidConfig = 40,
}

impl ErrorCode {
    /// Returns true if this error is retriable
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ErrorCode::RequestTimedOut
                | ErrorCode::BrokerNotAvailable
                | ErrorCode::NetworkException
                | ErrorCode::CoordinatorNotAvailable
                | ErrorCode::RebalanceInProgress
                | ErrorCode::ConcurrentTransactions
        )
    }

    /// Returns the error code as i16
    pub fn as_i16(&self) -> i16 {
        *self as i16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_match_protocol_values() {
        assert_eq!(ErrorCode::None.as_i16(), 0);
        assert_eq!(ErrorCode::IllegalGeneration.as_i16(), 22);
        assert_eq!(ErrorCode::ProducerFenced.as_i16(), 90);
    }

    #[test]
    fn test_fencing_codes_are_not_retriable() {
        assert!(!ErrorCode::IllegalGeneration.is_retriable());
        assert!(!ErrorCode::UnknownMemberId.is_retriable());
        assert!(!ErrorCode::ProducerFenced.is_retriable());
        assert!(ErrorCode::RequestTimedOut.is_retriable());
    }
}
