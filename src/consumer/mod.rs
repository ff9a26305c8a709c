//! Consumer side: group membership, assignment, offsets and the consume loop
//!
//! A [`Consumer`] joins a group through its [`GroupCoordinator`], which
//! elects a leader to run the configured [`PartitionAssignor`] and keeps the
//! membership alive with heartbeats. Positions and commits live in the
//! [`OffsetStore`]; commits are fenced by the group generation so a member
//! that lost its partitions cannot overwrite the new owner's progress.

pub mod assignor;
mod client;
pub mod coordinator;
pub mod handler;
pub mod listener;
pub mod offset_store;
mod runner;
mod stats;

pub use assignor::{
    Assignment, CooperativeStickyAssignor, MemberId, MemberSubscription, PartitionAssignor,
    PartitionMove, RangeAssignor, RebalanceProtocol, RoundRobinAssignor, StickyAssignor,
};
pub use client::Consumer;
pub use coordinator::{AssignmentChange, GroupCoordinator, MemberState, RejoinReason};
pub use handler::{
    handler_fn, BatchHandler, FnHandler, Handler, HandlerContext, HandlerError, RecordHandler,
    TypedHandler,
};
pub use listener::{LoggingRebalanceListener, RebalanceListener};
pub use offset_store::{CommitCallback, CommitRequest, OffsetStore};
pub use runner::{ConsumerHandle, ShutdownReport};
pub use stats::{ConsumerEvent, ConsumerStats, ConsumerStatsSnapshot};
