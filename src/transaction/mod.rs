//! Transactions for atomic multi-partition writes
//!
//! A [`TransactionManager`] owns one transactional producer session. Writes
//! and consumer offsets sent inside a transaction become visible to
//! read-committed readers together on commit, or never on abort. Opening a
//! new session for the same transactional id fences the previous one and
//! aborts whatever it left open.

mod manager;
mod state;

pub use manager::{StagedOffsets, TransactionManager, TransactionScope, TransactionStatsSnapshot};
pub use state::TransactionState;
