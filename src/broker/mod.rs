//! Outbound log-service interface
//!
//! [`LogService`] is everything the runtime needs from the broker side:
//! fetching, offset commits, group membership, idempotent appends and
//! transaction markers. The transport behind it is not this crate's
//! concern; [`memory::InMemoryLogService`] implements it in-process.
//!
//! Group membership follows the two-step join/sync protocol:
//!
//! ```text
//! member                       coordinator
//!   | join_group ------------------> |  waits for every member to rejoin
//!   | <------------ Pending / Joined |  generation bumped on completion
//!   | sync_group (leader: plan) ---> |
//!   | <------------ Pending / Assigned
//!   | heartbeat -------------------> |  RebalanceInProgress => rejoin
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;

use crate::config::IsolationLevel;
use crate::consumer::assignor::{MemberId, MemberSubscription};
use crate::error::Result;
use crate::record::{ConsumerRecord, Epoch, Header, TopicPartition};

pub mod memory;

pub use memory::InMemoryLogService;

/// Identity of a producer session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProducerSession {
    pub producer_id: i64,
    pub epoch: i16,
}

/// Sequence stamp carried by idempotent appends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceStamp {
    pub producer_id: i64,
    pub epoch: i16,
    pub sequence: i32,
}

/// One record to append
#[derive(Debug, Clone)]
pub struct AppendRequest {
    pub key: Option<Bytes>,
    pub value: Bytes,
    pub headers: Vec<Header>,
    pub timestamp: i64,
    /// Absent for non-idempotent producers
    pub stamp: Option<SequenceStamp>,
    /// Set when the append belongs to an open transaction
    pub transactional_id: Option<String>,
}

/// Broker verdict on an append
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended { offset: i64 },
    /// Sequence already accepted; `offset` is where it landed
    Duplicate { offset: i64 },
    /// Sequence skipped ahead of the next expected one
    SequenceGap { expected: i32, received: i32 },
}

/// Records returned by one fetch
#[derive(Debug, Clone, Default)]
pub struct FetchResponse {
    pub records: Vec<ConsumerRecord>,
    /// Where the next fetch should start; skips filtered and control records
    pub next_offset: i64,
    pub high_watermark: i64,
}

/// First and next-to-be-written offsets of a partition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogBounds {
    pub start: i64,
    pub end: i64,
}

/// A commit of one partition's offset on behalf of a group member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetCommit {
    pub group_id: String,
    /// `None` for consumers without group membership
    pub member_id: Option<MemberId>,
    pub epoch: Epoch,
    pub partition: TopicPartition,
    /// Next offset to consume
    pub offset: i64,
}

#[derive(Debug, Clone)]
pub struct JoinGroupRequest {
    pub group_id: String,
    /// `None` on first join; the coordinator assigns one
    pub member_id: Option<MemberId>,
    pub client_id: String,
    /// Assignor name; all members must agree
    pub protocol: String,
    pub subscription: MemberSubscription,
    pub session_timeout_ms: u64,
    pub rebalance_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinGroupResponse {
    /// Other members have not rejoined yet; retry with the same member id
    Pending { member_id: MemberId },
    Joined {
        member_id: MemberId,
        generation: Epoch,
        leader_id: MemberId,
        /// Populated for the leader only
        members: BTreeMap<MemberId, MemberSubscription>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncGroupResponse {
    /// Leader has not delivered the assignment yet
    Pending,
    Assigned(Vec<TopicPartition>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResponse {
    Ok,
    RebalanceInProgress,
    /// Member was evicted; its partitions are gone
    UnknownMember,
    IllegalGeneration,
}

/// Transaction marker written to participant partitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerKind {
    Commit,
    Abort,
}

/// Log service the runtime talks to
#[async_trait]
pub trait LogService: Send + Sync {
    async fn partition_count(&self, topic: &str) -> Result<i32>;

    async fn log_bounds(&self, partition: &TopicPartition) -> Result<LogBounds>;

    async fn fetch(
        &self,
        partition: &TopicPartition,
        from_offset: i64,
        max_bytes: usize,
        isolation: IsolationLevel,
    ) -> Result<FetchResponse>;

    async fn committed_offset(&self, group_id: &str, partition: &TopicPartition)
        -> Result<Option<i64>>;

    /// Rejects commits whose epoch is not the group's current generation
    async fn commit_offset(&self, commit: &OffsetCommit) -> Result<()>;

    async fn join_group(&self, request: JoinGroupRequest) -> Result<JoinGroupResponse>;

    /// The leader passes the full plan; other members pass an empty map
    async fn sync_group(
        &self,
        group_id: &str,
        member_id: &str,
        generation: Epoch,
        assignments: BTreeMap<MemberId, Vec<TopicPartition>>,
    ) -> Result<SyncGroupResponse>;

    async fn heartbeat(
        &self,
        group_id: &str,
        member_id: &str,
        generation: Epoch,
    ) -> Result<HeartbeatResponse>;

    async fn leave_group(&self, group_id: &str, member_id: &str) -> Result<()>;

    /// Start a producer session; re-initializing a transactional id fences its
    /// previous session
    async fn init_producer(&self, transactional_id: Option<&str>) -> Result<ProducerSession>;

    async fn append(
        &self,
        partition: &TopicPartition,
        request: AppendRequest,
    ) -> Result<AppendOutcome>;

    async fn begin_transaction(&self, transactional_id: &str, session: ProducerSession)
        -> Result<()>;

    async fn add_partitions_to_transaction(
        &self,
        transactional_id: &str,
        session: ProducerSession,
        partitions: &[TopicPartition],
    ) -> Result<()>;

    /// Stage group offsets that become visible only if the transaction commits
    async fn commit_transactional_offsets(
        &self,
        transactional_id: &str,
        session: ProducerSession,
        group_id: &str,
        epoch: Epoch,
        offsets: &[(TopicPartition, i64)],
    ) -> Result<()>;

    async fn write_marker(
        &self,
        transactional_id: &str,
        session: ProducerSession,
        partition: &TopicPartition,
        marker: MarkerKind,
    ) -> Result<()>;

    /// Record the transaction's final outcome once all markers are durable
    async fn end_transaction(
        &self,
        transactional_id: &str,
        session: ProducerSession,
        outcome: MarkerKind,
    ) -> Result<()>;
}
