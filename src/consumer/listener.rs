//! Rebalance listener hooks
//!
//! Hooks run on the consume loop between polls, each bounded by the
//! configured revoke grace. A hook that overruns is abandoned and the
//! rebalance continues without it.

use async_trait::async_trait;
use tracing::info;

use crate::record::TopicPartition;

/// Callbacks invoked around assignment changes
#[async_trait]
pub trait RebalanceListener: Send + Sync {
    /// Partitions are about to be taken away; handled offsets have already
    /// been committed
    async fn on_partitions_revoked(&self, partitions: &[TopicPartition]);

    async fn on_partitions_assigned(&self, partitions: &[TopicPartition]);

    /// Partitions were taken away without an orderly revoke. Their offsets
    /// were not committed and another member may already own them.
    async fn on_partitions_lost(&self, partitions: &[TopicPartition]) {
        self.on_partitions_revoked(partitions).await
    }
}

/// Listener that only logs
#[derive(Debug, Default)]
pub struct LoggingRebalanceListener;

#[async_trait]
impl RebalanceListener for LoggingRebalanceListener {
    async fn on_partitions_revoked(&self, partitions: &[TopicPartition]) {
        info!(partitions = ?partitions, "Partitions revoked");
    }

    async fn on_partitions_assigned(&self, partitions: &[TopicPartition]) {
        info!(partitions = ?partitions, "Partitions assigned");
    }

    async fn on_partitions_lost(&self, partitions: &[TopicPartition]) {
        info!(partitions = ?partitions, "Partitions lost");
    }
}
