//! Coordinator-side group state for the in-memory log service

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::broker::{
    HeartbeatResponse, JoinGroupRequest, JoinGroupResponse, OffsetCommit, SyncGroupResponse,
};
use crate::consumer::assignor::{MemberId, MemberSubscription};
use crate::error::{ClientError, ConfigError, Result};
use crate::record::{Epoch, TopicPartition, NO_EPOCH};

/// Consumer group state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum GroupPhase {
    /// Group has no members
    Empty,
    /// Waiting for every member to rejoin
    PreparingRebalance,
    /// Waiting for the leader's assignment
    CompletingRebalance,
    Stable,
}

#[derive(Debug, Clone)]
struct GroupMember {
    subscription: MemberSubscription,
    session_timeout: Duration,
    rebalance_timeout: Duration,
    last_heartbeat: Instant,
    assignment: Vec<TopicPartition>,
}

#[derive(Debug)]
pub(super) struct CoordinatorGroup {
    group_id: String,
    generation: Epoch,
    phase: GroupPhase,
    protocol: Option<String>,
    leader: Option<MemberId>,
    members: BTreeMap<MemberId, GroupMember>,
    joined: BTreeSet<MemberId>,
    /// Joined this generation but not yet handed their join response
    awaiting_join: BTreeSet<MemberId>,
    rebalance_started: Instant,
    offsets: HashMap<TopicPartition, i64>,
}

impl CoordinatorGroup {
    pub(super) fn new(group_id: &str) -> Self {
        Self {
            group_id: group_id.to_string(),
            generation: 0,
            phase: GroupPhase::Empty,
            protocol: None,
            leader: None,
            members: BTreeMap::new(),
            joined: BTreeSet::new(),
            awaiting_join: BTreeSet::new(),
            rebalance_started: Instant::now(),
            offsets: HashMap::new(),
        }
    }

    pub(super) fn generation(&self) -> Epoch {
        self.generation
    }

    pub(super) fn phase(&self) -> GroupPhase {
        self.phase
    }

    pub(super) fn member_ids(&self) -> Vec<MemberId> {
        self.members.keys().cloned().collect()
    }

    fn prepare_rebalance(&mut self, now: Instant, reason: &str) {
        if self.phase == GroupPhase::PreparingRebalance {
            return;
        }
        info!(group_id = %self.group_id, generation = self.generation, reason, "Preparing rebalance");
        self.phase = GroupPhase::PreparingRebalance;
        self.joined.clear();
        self.awaiting_join.clear();
        self.rebalance_started = now;
    }

    /// Drop members whose session expired; returns how many were removed
    pub(super) fn expire_members(&mut self, now: Instant) -> usize {
        let expired: Vec<MemberId> = self
            .members
            .iter()
            .filter(|(_, m)| now.duration_since(m.last_heartbeat) > m.session_timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for member_id in &expired {
            warn!(group_id = %self.group_id, member_id = %member_id, "Member session expired");
            self.remove_member(member_id, now, "session timeout");
        }
        expired.len()
    }

    pub(super) fn remove_member(&mut self, member_id: &str, now: Instant, reason: &str) -> bool {
        if self.members.remove(member_id).is_none() {
            return false;
        }
        self.joined.remove(member_id);
        self.awaiting_join.remove(member_id);
        if self.leader.as_deref() == Some(member_id) {
            self.leader = None;
        }
        if self.members.is_empty() {
            self.phase = GroupPhase::Empty;
            self.joined.clear();
            self.protocol = None;
        } else {
            self.prepare_rebalance(now, reason);
            self.try_complete_join(now);
        }
        true
    }

    fn try_complete_join(&mut self, now: Instant) {
        if self.phase != GroupPhase::PreparingRebalance {
            return;
        }
        let mut all_joined = self.members.keys().all(|m| self.joined.contains(m));
        if !all_joined {
            let timeout = self
                .members
                .values()
                .map(|m| m.rebalance_timeout)
                .max()
                .unwrap_or_default();
            if now.duration_since(self.rebalance_started) >= timeout {
                let stragglers: Vec<MemberId> = self
                    .members
                    .keys()
                    .filter(|m| !self.joined.contains(*m))
                    .cloned()
                    .collect();
                for member_id in stragglers {
                    warn!(group_id = %self.group_id, member_id = %member_id, "Member missed rebalance deadline");
                    self.members.remove(&member_id);
                }
                all_joined = true;
            }
        }
        if !all_joined {
            return;
        }
        if self.members.is_empty() {
            self.phase = GroupPhase::Empty;
            return;
        }

        self.generation += 1;
        self.phase = GroupPhase::CompletingRebalance;
        if !matches!(&self.leader, Some(l) if self.members.contains_key(l)) {
            self.leader = self.members.keys().next().cloned();
        }
        for member in self.members.values_mut() {
            member.assignment.clear();
        }
        self.awaiting_join = self.members.keys().cloned().collect();
        info!(
            group_id = %self.group_id,
            generation = self.generation,
            members = self.members.len(),
            leader = ?self.leader,
            "Join phase complete"
        );
    }

    pub(super) fn join(&mut self, request: JoinGroupRequest, now: Instant) -> Result<JoinGroupResponse> {
        self.expire_members(now);

        if let Some(protocol) = &self.protocol {
            if !self.members.is_empty() && protocol != &request.protocol {
                return Err(ConfigError::invalid_setting(
                    "assignment_strategy",
                    format!("group {} uses {}, member asked for {}", self.group_id, protocol, request.protocol),
                )
                .into());
            }
        }
        self.protocol = Some(request.protocol.clone());

        let member_id = request
            .member_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", request.client_id, uuid::Uuid::new_v4()));

        let changed = match self.members.get(&member_id) {
            Some(existing) => existing.subscription.topics != request.subscription.topics,
            None => true,
        };
        let assignment = self
            .members
            .get(&member_id)
            .map(|m| m.assignment.clone())
            .unwrap_or_default();
        self.members.insert(
            member_id.clone(),
            GroupMember {
                subscription: request.subscription,
                session_timeout: Duration::from_millis(request.session_timeout_ms),
                rebalance_timeout: Duration::from_millis(request.rebalance_timeout_ms),
                last_heartbeat: now,
                assignment,
            },
        );

        // a member still polling for the response of a completed join is not rejoining,
        // even if the leader's sync already made the group stable
        let collecting = !changed
            && self.phase != GroupPhase::PreparingRebalance
            && self.awaiting_join.contains(&member_id);
        if !collecting {
            if changed || self.phase != GroupPhase::PreparingRebalance {
                debug!(group_id = %self.group_id, member_id = %member_id, changed, "Member joining");
                self.prepare_rebalance(now, if changed { "membership change" } else { "rejoin" });
            }
            self.joined.insert(member_id.clone());
            self.try_complete_join(now);
        }

        if self.phase != GroupPhase::PreparingRebalance && self.awaiting_join.remove(&member_id) {
            let leader_id = self.leader.clone().unwrap_or_default();
            let members = if leader_id == member_id {
                self.members
                    .iter()
                    .map(|(id, m)| (id.clone(), m.subscription.clone()))
                    .collect()
            } else {
                BTreeMap::new()
            };
            Ok(JoinGroupResponse::Joined {
                member_id,
                generation: self.generation,
                leader_id,
                members,
            })
        } else {
            Ok(JoinGroupResponse::Pending { member_id })
        }
    }

    pub(super) fn sync(
        &mut self,
        member_id: &str,
        generation: Epoch,
        assignments: BTreeMap<MemberId, Vec<TopicPartition>>,
        now: Instant,
    ) -> Result<SyncGroupResponse> {
        self.expire_members(now);
        let Some(member) = self.members.get_mut(member_id) else {
            return Err(ClientError::UnknownMember {
                group_id: self.group_id.clone(),
                member_id: member_id.to_string(),
            });
        };
        member.last_heartbeat = now;

        if generation != self.generation || self.phase == GroupPhase::PreparingRebalance {
            return Err(ClientError::RebalanceInProgress(self.group_id.clone()));
        }

        match self.phase {
            GroupPhase::CompletingRebalance if self.leader.as_deref() == Some(member_id) => {
                for (id, m) in self.members.iter_mut() {
                    m.assignment = assignments.get(id).cloned().unwrap_or_default();
                }
                self.phase = GroupPhase::Stable;
                info!(group_id = %self.group_id, generation, "Group stable");
                Ok(SyncGroupResponse::Assigned(
                    assignments.get(member_id).cloned().unwrap_or_default(),
                ))
            }
            GroupPhase::CompletingRebalance => Ok(SyncGroupResponse::Pending),
            _ => Ok(SyncGroupResponse::Assigned(
                self.members
                    .get(member_id)
                    .map(|m| m.assignment.clone())
                    .unwrap_or_default(),
            )),
        }
    }

    pub(super) fn heartbeat(&mut self, member_id: &str, generation: Epoch, now: Instant) -> HeartbeatResponse {
        self.expire_members(now);
        self.try_complete_join(now);
        let Some(member) = self.members.get_mut(member_id) else {
            return HeartbeatResponse::UnknownMember;
        };
        member.last_heartbeat = now;

        if self.phase == GroupPhase::PreparingRebalance {
            return HeartbeatResponse::RebalanceInProgress;
        }
        if generation != self.generation {
            return HeartbeatResponse::IllegalGeneration;
        }
        HeartbeatResponse::Ok
    }

    /// Validate that a commit belongs to the current generation
    pub(super) fn validate_commit(&self, member_id: Option<&str>, epoch: Epoch, tp: &TopicPartition) -> Result<()> {
        match member_id {
            None if self.members.is_empty() && epoch == NO_EPOCH => Ok(()),
            Some(id) if !self.members.contains_key(id) => Err(ClientError::UnknownMember {
                group_id: self.group_id.clone(),
                member_id: id.to_string(),
            }),
            _ if epoch != self.generation => Err(ClientError::StaleEpoch {
                partition: tp.clone(),
                current: self.generation,
                requested: epoch,
            }),
            _ => Ok(()),
        }
    }

    pub(super) fn commit(&mut self, commit: &OffsetCommit) -> Result<()> {
        self.validate_commit(commit.member_id.as_deref(), commit.epoch, &commit.partition)?;
        self.store_offset(&commit.partition, commit.offset);
        Ok(())
    }

    pub(super) fn store_offset(&mut self, tp: &TopicPartition, offset: i64) {
        debug!(group_id = %self.group_id, partition = %tp, offset, "Offset stored");
        self.offsets.insert(tp.clone(), offset);
    }

    pub(super) fn committed(&self, tp: &TopicPartition) -> Option<i64> {
        self.offsets.get(tp).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn join_request(member_id: Option<&str>, topics: &[&str]) -> JoinGroupRequest {
        JoinGroupRequest {
            group_id: "g".to_string(),
            member_id: member_id.map(str::to_string),
            client_id: "client".to_string(),
            protocol: "range".to_string(),
            subscription: MemberSubscription::new(topics.iter().map(|t| t.to_string()).collect()),
            session_timeout_ms: 10_000,
            rebalance_timeout_ms: 1_000,
        }
    }

    fn member_id_of(resp: &JoinGroupResponse) -> String {
        match resp {
            JoinGroupResponse::Pending { member_id } | JoinGroupResponse::Joined { member_id, .. } => {
                member_id.clone()
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_member_join_and_sync() {
        let mut group = CoordinatorGroup::new("g");
        let now = Instant::now();
        let resp = group.join(join_request(None, &["t"]), now).unwrap();
        let member = member_id_of(&resp);
        assert!(member.starts_with("client-"));
        assert!(matches!(resp, JoinGroupResponse::Joined { generation: 1, ref leader_id, .. } if *leader_id == member));

        let plan = BTreeMap::from([(member.clone(), vec![TopicPartition::new("t", 0)])]);
        let sync = group.sync(&member, 1, plan, now).unwrap();
        assert_eq!(sync, SyncGroupResponse::Assigned(vec![TopicPartition::new("t", 0)]));
        assert_eq!(group.phase(), GroupPhase::Stable);
        assert_eq!(group.heartbeat(&member, 1, now), HeartbeatResponse::Ok);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_member_triggers_rebalance() {
        let mut group = CoordinatorGroup::new("g");
        let now = Instant::now();
        let a = member_id_of(&group.join(join_request(None, &["t"]), now).unwrap());
        group.sync(&a, 1, BTreeMap::new(), now).unwrap();

        let pending = group.join(join_request(None, &["t"]), now).unwrap();
        let b = member_id_of(&pending);
        assert!(matches!(pending, JoinGroupResponse::Pending { .. }));
        assert_eq!(group.heartbeat(&a, 1, now), HeartbeatResponse::RebalanceInProgress);

        // Commits from the old generation are still accepted until the join completes
        assert!(group.validate_commit(Some(&a), 1, &TopicPartition::new("t", 0)).is_ok());

        let rejoin = group.join(join_request(Some(&a), &["t"]), now).unwrap();
        assert!(matches!(rejoin, JoinGroupResponse::Joined { generation: 2, .. }));
        let b_again = group.join(join_request(Some(&b), &["t"]), now).unwrap();
        assert!(matches!(b_again, JoinGroupResponse::Joined { generation: 2, .. }));

        let stale = group.validate_commit(Some(&a), 1, &TopicPartition::new("t", 0));
        assert!(matches!(stale, Err(ClientError::StaleEpoch { current: 2, requested: 1, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_follower_collects_join_after_leader_sync() {
        let mut group = CoordinatorGroup::new("g");
        let now = Instant::now();
        let a = member_id_of(&group.join(join_request(None, &["t"]), now).unwrap());
        group.sync(&a, 1, BTreeMap::new(), now).unwrap();
        let b = member_id_of(&group.join(join_request(None, &["t"]), now).unwrap());

        let leader = group.join(join_request(Some(&a), &["t"]), now).unwrap();
        let JoinGroupResponse::Joined { generation, leader_id, members, .. } = leader else {
            panic!("leader should complete the join: {leader:?}");
        };
        assert_eq!((generation, leader_id.as_str()), (2, a.as_str()));
        assert_eq!(members.len(), 2);

        let plan = BTreeMap::from([
            (a.clone(), vec![TopicPartition::new("t", 0)]),
            (b.clone(), vec![TopicPartition::new("t", 1)]),
        ]);
        group.sync(&a, 2, plan, now).unwrap();
        assert_eq!(group.phase(), GroupPhase::Stable);

        // the follower's next poll picks up generation 2 instead of restarting the round
        let follower = group.join(join_request(Some(&b), &["t"]), now).unwrap();
        assert!(matches!(follower, JoinGroupResponse::Joined { generation: 2, ref members, .. } if members.is_empty()));
        assert_eq!(group.generation(), 2);
        assert_eq!(
            group.sync(&b, 2, BTreeMap::new(), now).unwrap(),
            SyncGroupResponse::Assigned(vec![TopicPartition::new("t", 1)])
        );
        assert_eq!(group.heartbeat(&a, 2, now), HeartbeatResponse::Ok);
        assert_eq!(group.heartbeat(&b, 2, now), HeartbeatResponse::Ok);

        // once collected, another join is a real rejoin
        let again = group.join(join_request(Some(&b), &["t"]), now).unwrap();
        assert!(matches!(again, JoinGroupResponse::Pending { .. }));
        assert_eq!(group.phase(), GroupPhase::PreparingRebalance);
    }

    #[tokio::test(start_paused = true)]
    async fn test_straggler_evicted_after_rebalance_timeout() {
        let mut group = CoordinatorGroup::new("g");
        let now = Instant::now();
        let a = member_id_of(&group.join(join_request(None, &["t"]), now).unwrap());
        group.sync(&a, 1, BTreeMap::new(), now).unwrap();

        let b = member_id_of(&group.join(join_request(None, &["t"]), now).unwrap());
        let later = now + Duration::from_millis(1_500);
        let resp = group.join(join_request(Some(&b), &["t"]), later).unwrap();
        assert!(matches!(resp, JoinGroupResponse::Joined { generation: 2, .. }));
        assert_eq!(group.member_ids(), vec![b]);
        assert_eq!(group.heartbeat(&a, 1, later), HeartbeatResponse::UnknownMember);
    }

    #[tokio::test(start_paused = true)]
    async fn test_standalone_commits_need_empty_group() {
        let mut group = CoordinatorGroup::new("g");
        let tp = TopicPartition::new("t", 0);
        assert!(group.validate_commit(None, NO_EPOCH, &tp).is_ok());
        group.join(join_request(None, &["t"]), Instant::now()).unwrap();
        assert!(group.validate_commit(None, NO_EPOCH, &tp).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_inconsistent_protocol_rejected() {
        let mut group = CoordinatorGroup::new("g");
        let now = Instant::now();
        group.join(join_request(None, &["t"]), now).unwrap();
        let mut other = join_request(None, &["t"]);
        other.protocol = "sticky".to_string();
        assert!(matches!(group.join(other, now), Err(ClientError::Config(_))));
    }
}
