//! Group coordinator client
//!
//! Owns this member's view of the group: membership identity, generation,
//! and the set of partitions it currently owns. It is the only place the
//! assignment changes.
//!
//! ## Member states
//!
//! ```text
//! Unjoined -> Joining -> Stable -> Revoking -> Joining -> Stable ... -> Left
//! ```
//!
//! A background heartbeat task keeps the session alive while the member is
//! stable. It never touches the assignment; it only flags that a rejoin is
//! needed. The consume loop picks the flag up on its next poll and runs the
//! rebalance there, so listener hooks and commits always happen between
//! handler invocations.
//!
//! ## Protocols
//!
//! - Eager: every owned partition is revoked (offsets flushed first) before
//!   joining; the new assignment arrives whole.
//! - Cooperative: the member keeps its partitions while joining. Afterwards
//!   only partitions missing from the new assignment are revoked; if any
//!   were, the member rejoins once more so the group can hand them over.

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::broker::{
    HeartbeatResponse, JoinGroupRequest, JoinGroupResponse, LogService, SyncGroupResponse,
};
use crate::config::defaults::DEFAULT_JOIN_POLL_INTERVAL_MS;
use crate::config::{ConsumerConfig, DeliverySemantics};
use crate::consumer::assignor::{
    MemberId, MemberSubscription, PartitionAssignor, RebalanceProtocol,
};
use crate::consumer::listener::RebalanceListener;
use crate::consumer::offset_store::OffsetStore;
use crate::error::{ClientError, Result};
use crate::record::{Epoch, TopicPartition, NO_EPOCH};

/// Membership state of this consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberState {
    /// Never joined, or the last join failed
    Unjoined,
    /// Join or sync in progress
    Joining,
    /// Owns its assignment and heartbeats
    Stable,
    /// Running revoke hooks
    Revoking,
    /// Left the group for good
    Left,
}

/// Why the member has to rejoin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejoinReason {
    RebalanceInProgress,
    IllegalGeneration,
    /// The coordinator no longer knows this member
    MemberLost,
    /// A commit was rejected for a stale generation
    Fenced,
    /// No heartbeat acknowledged within the session timeout
    SessionTimeout,
    PollIntervalExceeded,
    MetadataChanged,
    /// Cooperative follow-up after revoking moved partitions
    PendingRevocation,
    Requested,
}

impl RejoinReason {
    /// Partitions were taken without an orderly revoke
    pub fn is_lost(self) -> bool {
        matches!(self, RejoinReason::MemberLost | RejoinReason::Fenced)
    }

    /// The member's generation no longer holds, so it cannot keep its
    /// partitions through the rejoin under any protocol
    pub fn invalidates_generation(self) -> bool {
        matches!(
            self,
            RejoinReason::SessionTimeout
                | RejoinReason::PollIntervalExceeded
                | RejoinReason::IllegalGeneration
        )
    }
}

/// Assignment delta produced by one rebalance
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssignmentChange {
    pub assigned: Vec<TopicPartition>,
    pub revoked: Vec<TopicPartition>,
    pub lost: Vec<TopicPartition>,
}

impl AssignmentChange {
    pub fn is_empty(&self) -> bool {
        self.assigned.is_empty() && self.revoked.is_empty() && self.lost.is_empty()
    }
}

#[derive(Debug)]
struct Membership {
    member_id: Option<MemberId>,
    generation: Epoch,
    stable: bool,
    rejoin: Option<RejoinReason>,
    last_ack: Instant,
    last_poll: Instant,
}

impl Membership {
    fn request_rejoin(&mut self, reason: RejoinReason) {
        match self.rejoin {
            Some(current) if current.is_lost() => {}
            _ => self.rejoin = Some(reason),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Hook {
    Revoked,
    Assigned,
    Lost,
}

pub struct GroupCoordinator {
    service: Arc<dyn LogService>,
    config: ConsumerConfig,
    assignor: Box<dyn PartitionAssignor>,
    listener: Arc<dyn RebalanceListener>,
    subscription: Vec<String>,
    membership: Arc<Mutex<Membership>>,
    state: MemberState,
    owned: BTreeSet<TopicPartition>,
    partition_counts: BTreeMap<String, i32>,
    metadata_checked: Instant,
    heartbeat: Option<JoinHandle<()>>,
    rebalances: u64,
}

impl std::fmt::Debug for GroupCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupCoordinator")
            .field("group_id", &self.config.group_id)
            .field("state", &self.state)
            .field("member_id", &self.member_id())
            .field("generation", &self.generation())
            .field("owned", &self.owned)
            .finish()
    }
}

impl GroupCoordinator {
    pub fn new(
        service: Arc<dyn LogService>,
        config: ConsumerConfig,
        listener: Arc<dyn RebalanceListener>,
    ) -> Self {
        let now = Instant::now();
        Self {
            service,
            assignor: config.assignment_strategy.assignor(),
            config,
            listener,
            subscription: Vec::new(),
            membership: Arc::new(Mutex::new(Membership {
                member_id: None,
                generation: NO_EPOCH,
                stable: false,
                rejoin: None,
                last_ack: now,
                last_poll: now,
            })),
            state: MemberState::Unjoined,
            owned: BTreeSet::new(),
            partition_counts: BTreeMap::new(),
            metadata_checked: now,
            heartbeat: None,
            rebalances: 0,
        }
    }

    pub fn set_listener(&mut self, listener: Arc<dyn RebalanceListener>) {
        self.listener = listener;
    }

    /// Replace the subscription; takes effect on the next rebalance
    pub fn subscribe(&mut self, topics: Vec<String>) {
        if topics == self.subscription {
            return;
        }
        self.subscription = topics;
        if self.state != MemberState::Unjoined {
            self.request_rejoin(RejoinReason::MetadataChanged);
        }
    }

    pub fn subscription(&self) -> &[String] {
        &self.subscription
    }

    pub fn state(&self) -> MemberState {
        self.state
    }

    pub fn member_id(&self) -> Option<MemberId> {
        self.membership.lock().member_id.clone()
    }

    pub fn generation(&self) -> Epoch {
        self.membership.lock().generation
    }

    pub fn protocol(&self) -> RebalanceProtocol {
        self.assignor.protocol()
    }

    pub fn assignment(&self) -> Vec<TopicPartition> {
        self.owned.iter().cloned().collect()
    }

    pub fn owns(&self, partition: &TopicPartition) -> bool {
        self.owned.contains(partition)
    }

    pub fn rebalance_count(&self) -> u64 {
        self.rebalances
    }

    pub fn request_rejoin(&self, reason: RejoinReason) {
        self.membership.lock().request_rejoin(reason);
    }

    /// Called on every poll; feeds the max-poll-interval check
    pub fn record_poll(&self) {
        self.membership.lock().last_poll = Instant::now();
    }

    /// React to a commit rejected for this member's identity or generation
    pub fn handle_fencing(&self, err: &ClientError) {
        let reason = match err {
            ClientError::UnknownMember { .. } => RejoinReason::MemberLost,
            _ => RejoinReason::Fenced,
        };
        warn!(
            group_id = %self.config.group_id,
            error = %err,
            reason = ?reason,
            "Member fenced; rejoining"
        );
        self.request_rejoin(reason);
    }

    pub fn needs_rejoin(&self) -> bool {
        matches!(self.state, MemberState::Unjoined) || self.membership.lock().rejoin.is_some()
    }

    /// Run a rebalance if one is due. Returns the assignment delta when one ran.
    pub async fn ensure_active(&mut self, offsets: &mut OffsetStore) -> Result<Option<AssignmentChange>> {
        if self.state == MemberState::Left {
            return Err(ClientError::ShuttingDown);
        }
        self.refresh_metadata().await;
        if !self.needs_rejoin() {
            return Ok(None);
        }
        self.rebalance(offsets).await.map(Some)
    }

    /// Revoke everything cleanly and leave the group
    pub async fn leave(&mut self, offsets: &mut OffsetStore) -> Result<()> {
        if self.state == MemberState::Left {
            return Ok(());
        }
        self.stop_heartbeat();
        let owned = self.assignment();
        if !owned.is_empty() {
            self.state = MemberState::Revoking;
            self.commit_before_revoke(offsets, &owned).await;
            self.notify(Hook::Revoked, &owned).await;
            offsets.remove(&owned);
            self.owned.clear();
        }
        let member_id = {
            let mut membership = self.membership.lock();
            membership.stable = false;
            membership.rejoin = None;
            membership.member_id.take()
        };
        self.state = MemberState::Left;
        if let Some(member_id) = member_id {
            self.service
                .leave_group(&self.config.group_id, &member_id)
                .await?;
            info!(
                group_id = %self.config.group_id,
                member_id = %member_id,
                "Left consumer group"
            );
        }
        Ok(())
    }

    async fn rebalance(&mut self, offsets: &mut OffsetStore) -> Result<AssignmentChange> {
        let reason = {
            let mut membership = self.membership.lock();
            membership.stable = false;
            if membership.rejoin == Some(RejoinReason::MemberLost) {
                membership.member_id = None;
            }
            membership.rejoin.take()
        };
        let protocol = self.assignor.protocol();
        let owned = self.assignment();
        let mut change = AssignmentChange::default();
        info!(
            group_id = %self.config.group_id,
            reason = ?reason,
            owned = owned.len(),
            protocol = ?protocol,
            "Rebalancing"
        );

        if !owned.is_empty() {
            if reason.is_some_and(RejoinReason::is_lost) {
                match protocol {
                    RebalanceProtocol::Eager => {
                        self.notify(Hook::Lost, &owned).await;
                        change.lost = owned.clone();
                    }
                    RebalanceProtocol::Cooperative => {
                        self.notify(Hook::Revoked, &owned).await;
                        change.revoked = owned.clone();
                    }
                }
                offsets.remove(&owned);
                self.owned.clear();
            } else if protocol == RebalanceProtocol::Eager
                || reason.is_some_and(RejoinReason::invalidates_generation)
            {
                self.state = MemberState::Revoking;
                self.commit_before_revoke(offsets, &owned).await;
                self.notify(Hook::Revoked, &owned).await;
                offsets.remove(&owned);
                self.owned.clear();
                change.revoked = owned.clone();
            }
        }

        self.state = MemberState::Joining;
        let (generation, assigned) = match self.join_and_sync().await {
            Ok(joined) => joined,
            Err(e) => {
                self.state = MemberState::Unjoined;
                return Err(e);
            }
        };
        let member_id = self.member_id();
        offsets.set_membership(member_id.clone(), generation);

        let assigned: BTreeSet<TopicPartition> = assigned.into_iter().collect();
        let revoked: Vec<TopicPartition> = self.owned.difference(&assigned).cloned().collect();
        if !revoked.is_empty() {
            self.state = MemberState::Revoking;
            self.commit_before_revoke(offsets, &revoked).await;
            self.notify(Hook::Revoked, &revoked).await;
            offsets.remove(&revoked);
            self.request_rejoin(RejoinReason::PendingRevocation);
            change.revoked.extend(revoked);
        }
        let added: Vec<TopicPartition> = assigned.difference(&self.owned).cloned().collect();
        self.owned = assigned;

        self.record_metadata().await;
        {
            let mut membership = self.membership.lock();
            membership.stable = true;
            membership.last_ack = Instant::now();
        }
        self.state = MemberState::Stable;
        self.rebalances += 1;
        self.start_heartbeat();

        if !added.is_empty() || protocol == RebalanceProtocol::Eager {
            self.notify(Hook::Assigned, &added).await;
        }
        change.assigned = added;
        info!(
            group_id = %self.config.group_id,
            member_id = ?member_id,
            generation,
            assigned = ?change.assigned,
            revoked = ?change.revoked,
            lost = ?change.lost,
            "Rebalance complete"
        );
        Ok(change)
    }

    /// Join and sync, retrying failed attempts with backoff
    async fn join_and_sync(&mut self) -> Result<(Epoch, Vec<TopicPartition>)> {
        let poll_interval = Duration::from_millis(DEFAULT_JOIN_POLL_INTERVAL_MS);
        let mut failures = 0u32;
        loop {
            let err = match timeout(self.config.join_timeout(), self.join_once()).await {
                Ok(Ok(joined)) => return Ok(joined),
                Ok(Err(ClientError::RebalanceInProgress(_))) => {
                    debug!(group_id = %self.config.group_id, "Rebalance restarted during sync");
                    sleep(poll_interval).await;
                    continue;
                }
                Ok(Err(ClientError::UnknownMember { .. })) => {
                    debug!(group_id = %self.config.group_id, "Evicted during join; joining as a new member");
                    self.membership.lock().member_id = None;
                    sleep(poll_interval).await;
                    continue;
                }
                Ok(Err(e)) if !e.is_retriable() => return Err(e),
                Ok(Err(e)) => e,
                Err(_) => ClientError::Timeout(format!("join group {}", self.config.group_id)),
            };

            failures += 1;
            if failures >= self.config.max_join_failures {
                error!(
                    group_id = %self.config.group_id,
                    attempts = failures,
                    error = %err,
                    "Giving up on joining group"
                );
                return Err(ClientError::GroupUnreachable {
                    group_id: self.config.group_id.clone(),
                    attempts: failures,
                });
            }
            let backoff = self.config.retry.backoff_for_attempt(failures - 1);
            warn!(
                group_id = %self.config.group_id,
                attempt = failures,
                backoff_ms = backoff.as_millis() as u64,
                error = %err,
                "Join attempt failed"
            );
            sleep(backoff).await;
        }
    }

    async fn join_once(&mut self) -> Result<(Epoch, Vec<TopicPartition>)> {
        let poll_interval = Duration::from_millis(DEFAULT_JOIN_POLL_INTERVAL_MS);
        let (member_id, generation, leader_id, members) = loop {
            let (current_id, current_generation) = {
                let membership = self.membership.lock();
                (membership.member_id.clone(), membership.generation)
            };
            let request = JoinGroupRequest {
                group_id: self.config.group_id.clone(),
                member_id: current_id,
                client_id: self.config.client_id.clone(),
                protocol: self.assignor.name().to_string(),
                subscription: MemberSubscription::new(self.subscription.clone())
                    .with_owned(self.assignment(), current_generation),
                session_timeout_ms: self.config.session_timeout_ms,
                rebalance_timeout_ms: self.config.rebalance_timeout_ms,
            };
            match self.service.join_group(request).await? {
                JoinGroupResponse::Pending { member_id } => {
                    self.membership.lock().member_id = Some(member_id);
                    sleep(poll_interval).await;
                }
                JoinGroupResponse::Joined {
                    member_id,
                    generation,
                    leader_id,
                    members,
                } => {
                    self.membership.lock().member_id = Some(member_id.clone());
                    break (member_id, generation, leader_id, members);
                }
            }
        };

        let plan = if member_id == leader_id {
            self.compute_plan(&members).await?
        } else {
            BTreeMap::new()
        };
        loop {
            let response = self
                .service
                .sync_group(&self.config.group_id, &member_id, generation, plan.clone())
                .await?;
            match response {
                SyncGroupResponse::Assigned(partitions) => {
                    self.membership.lock().generation = generation;
                    return Ok((generation, partitions));
                }
                SyncGroupResponse::Pending => sleep(poll_interval).await,
            }
        }
    }

    /// Leader only: run the assignor over every member's subscription
    async fn compute_plan(
        &mut self,
        members: &BTreeMap<MemberId, MemberSubscription>,
    ) -> Result<BTreeMap<MemberId, Vec<TopicPartition>>> {
        let topics: BTreeSet<&String> = members.values().flat_map(|s| s.topics.iter()).collect();
        let mut partitions = Vec::new();
        for topic in topics {
            match self.service.partition_count(topic).await {
                Ok(count) => {
                    self.partition_counts.insert(topic.clone(), count);
                    partitions.extend((0..count).map(|p| TopicPartition::new(topic.clone(), p)));
                }
                Err(ClientError::UnknownTopic(_)) => {
                    warn!(group_id = %self.config.group_id, topic = %topic, "Subscribed topic does not exist");
                }
                Err(e) => return Err(e),
            }
        }

        let plan = self.assignor.assign(members, &partitions);
        for (tp, movement) in plan.in_transition() {
            debug!(
                partition = %tp,
                from = %movement.from,
                to = %movement.to,
                "Partition withheld until revoked"
            );
        }
        info!(
            group_id = %self.config.group_id,
            assignor = self.assignor.name(),
            members = plan.member_count(),
            partitions = plan.assigned_count(),
            in_transition = plan.in_transition().len(),
            "Computed group assignment"
        );
        Ok(plan.into_member_lists())
    }

    async fn record_metadata(&mut self) {
        for topic in &self.subscription {
            if let Ok(count) = self.service.partition_count(topic).await {
                self.partition_counts.insert(topic.clone(), count);
            }
        }
        self.metadata_checked = Instant::now();
    }

    /// Rejoin when a subscribed topic's partition count changed
    async fn refresh_metadata(&mut self) {
        if self.state != MemberState::Stable
            || self.metadata_checked.elapsed() < self.config.metadata_max_age()
        {
            return;
        }
        self.metadata_checked = Instant::now();
        let mut changed = false;
        for topic in &self.subscription {
            if let Ok(count) = self.service.partition_count(topic).await {
                let previous = self.partition_counts.insert(topic.clone(), count);
                if previous != Some(count) {
                    info!(topic = %topic, previous = ?previous, count, "Partition count changed");
                    changed = true;
                }
            }
        }
        if changed {
            self.request_rejoin(RejoinReason::MetadataChanged);
        }
    }

    async fn commit_before_revoke(&self, offsets: &mut OffsetStore, partitions: &[TopicPartition]) {
        if self.config.delivery == DeliverySemantics::ExactlyOnce {
            return;
        }
        if let Err(e) = offsets.commit_partitions(Some(partitions)).await {
            warn!(
                group_id = %self.config.group_id,
                partitions = ?partitions,
                error = %e,
                "Commit before revoke failed; uncommitted records will be redelivered"
            );
        }
    }

    async fn notify(&self, hook: Hook, partitions: &[TopicPartition]) {
        let listener = &self.listener;
        let call = async {
            match hook {
                Hook::Revoked => listener.on_partitions_revoked(partitions).await,
                Hook::Assigned => listener.on_partitions_assigned(partitions).await,
                Hook::Lost => listener.on_partitions_lost(partitions).await,
            }
        };
        let grace = self.config.revoke_grace();
        if timeout(grace, call).await.is_err() {
            warn!(
                group_id = %self.config.group_id,
                hook = ?hook,
                grace_ms = grace.as_millis() as u64,
                "Rebalance listener exceeded its grace period"
            );
        }
    }

    fn start_heartbeat(&mut self) {
        if self.heartbeat.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let service = self.service.clone();
        let group_id = self.config.group_id.clone();
        let membership = self.membership.clone();
        let interval = self.config.heartbeat_interval();
        let session_timeout = self.config.session_timeout();
        let max_poll_interval = self.config.max_poll_interval();

        self.heartbeat = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let (member_id, generation) = {
                    let mut m = membership.lock();
                    let Some(member_id) = m.member_id.clone() else {
                        continue;
                    };
                    if !m.stable || m.rejoin.is_some() {
                        continue;
                    }
                    if m.last_poll.elapsed() > max_poll_interval {
                        warn!(
                            group_id = %group_id,
                            member_id = %member_id,
                            max_poll_interval_ms = max_poll_interval.as_millis() as u64,
                            "No poll within max poll interval; giving up assignment"
                        );
                        m.request_rejoin(RejoinReason::PollIntervalExceeded);
                        continue;
                    }
                    (member_id, m.generation)
                };

                let response = service.heartbeat(&group_id, &member_id, generation).await;
                let mut m = membership.lock();
                match response {
                    Ok(HeartbeatResponse::Ok) => m.last_ack = Instant::now(),
                    Ok(HeartbeatResponse::RebalanceInProgress) => {
                        debug!(group_id = %group_id, member_id = %member_id, "Group is rebalancing");
                        m.request_rejoin(RejoinReason::RebalanceInProgress);
                    }
                    Ok(HeartbeatResponse::IllegalGeneration) => {
                        m.request_rejoin(RejoinReason::IllegalGeneration);
                    }
                    Ok(HeartbeatResponse::UnknownMember) => {
                        warn!(group_id = %group_id, member_id = %member_id, "Coordinator dropped this member");
                        m.request_rejoin(RejoinReason::MemberLost);
                    }
                    Err(e) => {
                        let silent = m.last_ack.elapsed();
                        if silent > session_timeout {
                            warn!(
                                group_id = %group_id,
                                member_id = %member_id,
                                silent_ms = silent.as_millis() as u64,
                                error = %e,
                                "Heartbeats unacknowledged past session timeout"
                            );
                            m.request_rejoin(RejoinReason::SessionTimeout);
                        } else {
                            debug!(group_id = %group_id, error = %e, "Heartbeat failed");
                        }
                    }
                }
            }
        }));
    }

    fn stop_heartbeat(&mut self) {
        if let Some(handle) = self.heartbeat.take() {
            handle.abort();
        }
    }
}

impl Drop for GroupCoordinator {
    fn drop(&mut self) {
        self.stop_heartbeat();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryLogService;
    use crate::config::AssignmentStrategy;
    use crate::consumer::listener::LoggingRebalanceListener;
    use crate::retry::RetryPolicy;
    use async_trait::async_trait;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(&'static str, Vec<TopicPartition>)>>,
    }

    #[async_trait]
    impl RebalanceListener for Recorder {
        async fn on_partitions_revoked(&self, partitions: &[TopicPartition]) {
            self.events.lock().push(("revoked", partitions.to_vec()));
        }

        async fn on_partitions_assigned(&self, partitions: &[TopicPartition]) {
            self.events.lock().push(("assigned", partitions.to_vec()));
        }

        async fn on_partitions_lost(&self, partitions: &[TopicPartition]) {
            self.events.lock().push(("lost", partitions.to_vec()));
        }
    }

    fn config(strategy: AssignmentStrategy) -> ConsumerConfig {
        let mut config = ConsumerConfig::new("group-a");
        config.assignment_strategy = strategy;
        config.heartbeat_interval_ms = 50;
        config.session_timeout_ms = 500;
        config.rebalance_timeout_ms = 1_000;
        config.join_timeout_ms = 2_000;
        config.max_join_failures = 3;
        config.retry = RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(20), 2.0);
        config
    }

    fn member(
        service: &Arc<InMemoryLogService>,
        config: &ConsumerConfig,
        listener: Arc<dyn RebalanceListener>,
    ) -> (GroupCoordinator, OffsetStore) {
        let mut coordinator = GroupCoordinator::new(service.clone(), config.clone(), listener);
        coordinator.subscribe(vec!["orders".to_string()]);
        (coordinator, OffsetStore::new(service.clone(), config))
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_member_gets_everything() {
        let service = Arc::new(InMemoryLogService::new());
        service.create_topic("orders", 3);
        let recorder = Arc::new(Recorder::default());
        let (mut coordinator, mut offsets) =
            member(&service, &config(AssignmentStrategy::Range), recorder.clone());

        assert_eq!(coordinator.state(), MemberState::Unjoined);
        let change = coordinator.ensure_active(&mut offsets).await.unwrap().unwrap();
        assert_eq!(change.assigned.len(), 3);
        assert_eq!(coordinator.state(), MemberState::Stable);
        assert_eq!(coordinator.generation(), 1);
        assert_eq!(offsets.epoch(), 1);
        assert!(coordinator.ensure_active(&mut offsets).await.unwrap().is_none());
        assert_eq!(recorder.events.lock()[0].0, "assigned");
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_gives_up_after_consecutive_failures() {
        let service = Arc::new(InMemoryLogService::new());
        service.create_topic("orders", 1);
        service.set_coordinator_available(false);
        let (mut coordinator, mut offsets) = member(
            &service,
            &config(AssignmentStrategy::Range),
            Arc::new(LoggingRebalanceListener),
        );

        let err = coordinator.ensure_active(&mut offsets).await.unwrap_err();
        assert!(matches!(err, ClientError::GroupUnreachable { attempts: 3, .. }));
        assert_eq!(coordinator.state(), MemberState::Unjoined);

        service.set_coordinator_available(true);
        assert!(coordinator.ensure_active(&mut offsets).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_reports_lost_partitions_under_eager() {
        let service = Arc::new(InMemoryLogService::new());
        service.create_topic("orders", 2);
        let recorder = Arc::new(Recorder::default());
        let (mut coordinator, mut offsets) =
            member(&service, &config(AssignmentStrategy::Range), recorder.clone());
        coordinator.ensure_active(&mut offsets).await.unwrap();
        offsets.assign(TopicPartition::new("orders", 0), 0, None);
        offsets.mark_handled(&TopicPartition::new("orders", 0), 4);

        let member_id = coordinator.member_id().unwrap();
        assert!(service.expire_member("group-a", &member_id));
        sleep(Duration::from_millis(120)).await;
        assert!(coordinator.needs_rejoin());

        let change = coordinator.ensure_active(&mut offsets).await.unwrap().unwrap();
        assert_eq!(change.lost.len(), 2);
        assert_eq!(change.assigned.len(), 2);
        assert_ne!(coordinator.member_id().unwrap(), member_id);
        // no commit attempted for lost partitions
        assert_eq!(service.committed("group-a", &TopicPartition::new("orders", 0)), None);
        let kinds: Vec<&str> = recorder.events.lock().iter().map(|(k, _)| *k).collect();
        assert_eq!(kinds, vec!["assigned", "lost", "assigned"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eager_revoke_flushes_offsets_first() {
        let service = Arc::new(InMemoryLogService::new());
        service.create_topic("orders", 2);
        let recorder = Arc::new(Recorder::default());
        let (mut coordinator, mut offsets) =
            member(&service, &config(AssignmentStrategy::Range), recorder.clone());
        let change = coordinator.ensure_active(&mut offsets).await.unwrap().unwrap();
        for tp in &change.assigned {
            offsets.assign(tp.clone(), 0, None);
        }
        let p0 = TopicPartition::new("orders", 0);
        offsets.mark_handled(&p0, 2);

        coordinator.request_rejoin(RejoinReason::Requested);
        let change = coordinator.ensure_active(&mut offsets).await.unwrap().unwrap();
        assert_eq!(change.revoked.len(), 2);
        assert_eq!(service.committed("group-a", &p0), Some(3));
        assert_eq!(coordinator.generation(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooperative_session_timeout_revokes_before_rejoin() {
        let service = Arc::new(InMemoryLogService::new());
        service.create_topic("orders", 2);
        let recorder = Arc::new(Recorder::default());
        let (mut coordinator, mut offsets) = member(
            &service,
            &config(AssignmentStrategy::CooperativeSticky),
            recorder.clone(),
        );
        let change = coordinator.ensure_active(&mut offsets).await.unwrap().unwrap();
        for tp in &change.assigned {
            offsets.assign(tp.clone(), 0, None);
        }
        let p1 = TopicPartition::new("orders", 1);
        offsets.mark_handled(&p1, 5);

        // heartbeats go unanswered past the session timeout
        service.set_coordinator_available(false);
        sleep(Duration::from_millis(700)).await;
        assert!(coordinator.needs_rejoin());
        service.set_coordinator_available(true);

        let change = coordinator.ensure_active(&mut offsets).await.unwrap().unwrap();
        assert_eq!(change.revoked.len(), 2);
        assert!(change.lost.is_empty());
        assert_eq!(change.assigned.len(), 2);
        assert_eq!(service.committed("group-a", &p1), Some(6));
        let kinds: Vec<&str> = recorder.events.lock().iter().map(|(k, _)| *k).collect();
        assert_eq!(kinds, vec!["assigned", "revoked", "assigned"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooperative_members_share_partitions() {
        let service = Arc::new(InMemoryLogService::new());
        service.create_topic("orders", 4);
        let config = config(AssignmentStrategy::CooperativeSticky);
        let (mut first, mut first_offsets) =
            member(&service, &config, Arc::new(LoggingRebalanceListener));
        first.ensure_active(&mut first_offsets).await.unwrap();
        assert_eq!(first.assignment().len(), 4);

        let (mut second, mut second_offsets) =
            member(&service, &config, Arc::new(LoggingRebalanceListener));
        let (joined, rejoined) = tokio::join!(
            second.ensure_active(&mut second_offsets),
            async {
                sleep(Duration::from_millis(120)).await;
                first.ensure_active(&mut first_offsets).await
            }
        );
        joined.unwrap();
        let handed_over = rejoined.unwrap().unwrap();
        // two partitions are withheld until the first member revokes them
        assert_eq!(handed_over.revoked.len(), 2);
        assert!(first.needs_rejoin());

        let (joined, rejoined) = tokio::join!(
            async {
                sleep(Duration::from_millis(120)).await;
                second.ensure_active(&mut second_offsets).await
            },
            first.ensure_active(&mut first_offsets)
        );
        joined.unwrap();
        rejoined.unwrap();
        assert_eq!(first.assignment().len(), 2);
        assert_eq!(second.assignment().len(), 2);
        assert_eq!(first.generation(), second.generation());
        assert!(first.assignment().iter().all(|p| !second.owns(p)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_revokes_and_empties_group() {
        let service = Arc::new(InMemoryLogService::new());
        service.create_topic("orders", 1);
        let recorder = Arc::new(Recorder::default());
        let (mut coordinator, mut offsets) =
            member(&service, &config(AssignmentStrategy::Sticky), recorder.clone());
        coordinator.ensure_active(&mut offsets).await.unwrap();
        coordinator.leave(&mut offsets).await.unwrap();

        assert_eq!(coordinator.state(), MemberState::Left);
        assert!(service.group_members("group-a").is_empty());
        assert_eq!(recorder.events.lock().last().unwrap().0, "revoked");
        assert!(matches!(
            coordinator.ensure_active(&mut offsets).await,
            Err(ClientError::ShuttingDown)
        ));
    }
}
