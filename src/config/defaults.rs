//! Default constants for client configuration
//!
//! These constants define the default values used throughout the configuration
//! system when no explicit value is provided.

/// Default client id reported to the log service
pub const DEFAULT_CLIENT_ID: &str = "streamline-client";

/// Default group session timeout in milliseconds
pub const DEFAULT_SESSION_TIMEOUT_MS: u64 = 10_000;

/// Default heartbeat interval in milliseconds (must stay below the session timeout)
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 3_000;

/// Default time the coordinator waits for members to rejoin during a rebalance
pub const DEFAULT_REBALANCE_TIMEOUT_MS: u64 = 60_000;

/// Default bound on a single join attempt before it is retried
pub const DEFAULT_JOIN_TIMEOUT_MS: u64 = 30_000;

/// Default number of consecutive failed join attempts before the group is unreachable
pub const DEFAULT_MAX_JOIN_FAILURES: u32 = 5;

/// Default pause between polls of a pending join or sync
pub const DEFAULT_JOIN_POLL_INTERVAL_MS: u64 = 10;

/// Default bound on rebalance listener hooks
pub const DEFAULT_REVOKE_GRACE_MS: u64 = 5_000;

/// Default maximum records returned by one poll
pub const DEFAULT_MAX_POLL_RECORDS: usize = 100;

/// Default maximum gap between polls before the member gives up its assignment
pub const DEFAULT_MAX_POLL_INTERVAL_MS: u64 = 300_000;

/// Default maximum bytes per partition fetch
pub const DEFAULT_FETCH_MAX_BYTES: usize = 1024 * 1024;

/// Default wait of each poll issued by a running consume loop
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 100;

/// Default pause between empty fetch rounds inside one poll
pub const DEFAULT_FETCH_BACKOFF_MS: u64 = 5;

/// Default metadata refresh interval used to detect partition-count changes
pub const DEFAULT_METADATA_MAX_AGE_MS: u64 = 300_000;

/// Default commit batch size for batched commits
pub const DEFAULT_COMMIT_BATCH_RECORDS: usize = 100;

/// Default commit batch interval in milliseconds for batched commits
pub const DEFAULT_COMMIT_BATCH_INTERVAL_MS: u64 = 5_000;

/// Default handler attempts for one record before it is dead-lettered
pub const DEFAULT_MAX_HANDLER_ATTEMPTS: u32 = 3;

/// Default records per batch in batch mode
pub const DEFAULT_BATCH_MAX_RECORDS: usize = 50;

/// Default retry attempts for transient failures
pub const DEFAULT_RETRY_MAX_RETRIES: u32 = 5;

/// Default initial retry backoff in milliseconds
pub const DEFAULT_RETRY_INITIAL_BACKOFF_MS: u64 = 100;

/// Default maximum retry backoff in milliseconds
pub const DEFAULT_RETRY_MAX_BACKOFF_MS: u64 = 10_000;

/// Default retry backoff multiplier
pub const DEFAULT_RETRY_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Default producer retries for a single send
pub const DEFAULT_PRODUCER_RETRIES: u32 = 3;

/// Default per-attempt request timeout in milliseconds
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Default transaction timeout in milliseconds
pub const DEFAULT_TRANSACTION_TIMEOUT_MS: u64 = 60_000;

/// Prefix for generated transactional ids
pub const DEFAULT_TRANSACTIONAL_ID_PREFIX: &str = "tx-producer-";

/// Default suffix appended to a topic name to form its dead-letter topic
pub const DEFAULT_DLQ_SUFFIX: &str = ".dlq";
