//! Client-side transaction state machine

use serde::Serialize;
use std::fmt;

/// Lifecycle of the transaction owned by a [`super::TransactionManager`]
///
/// ```text
/// Empty -> Begun -> Committing -> Committed -> Empty
///             \          |
///              +---> Aborting -> Aborted -> Empty
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransactionState {
    /// No transaction open
    Empty,
    /// Accepting sends and offset commits
    Begun,
    /// Writing commit markers
    Committing,
    Committed,
    /// Writing abort markers
    Aborting,
    Aborted,
}

impl TransactionState {
    /// Check if a transaction is open for this session
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TransactionState::Begun | TransactionState::Committing | TransactionState::Aborting
        )
    }

    pub fn can_send(&self) -> bool {
        matches!(self, TransactionState::Begun)
    }

    pub fn can_abort(&self) -> bool {
        matches!(self, TransactionState::Begun | TransactionState::Aborting)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::Aborted)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionState::Empty => write!(f, "Empty"),
            TransactionState::Begun => write!(f, "Begun"),
            TransactionState::Committing => write!(f, "Committing"),
            TransactionState::Committed => write!(f, "Committed"),
            TransactionState::Aborting => write!(f, "Aborting"),
            TransactionState::Aborted => write!(f, "Aborted"),
        }
    }
}
