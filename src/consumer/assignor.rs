//! Partition assignment strategies for consumer groups
//!
//! - `RangeAssignor`: contiguous per-topic ranges, earlier members take the remainder
//! - `RoundRobinAssignor`: all partitions sorted by (topic, index), dealt out in turn
//! - `StickyAssignor`: balanced (max difference 1) with minimal movement
//! - `CooperativeStickyAssignor`: sticky target reached in two rounds
//!
//! Every strategy is a pure function of its inputs. An empty member set yields
//! an empty assignment.
//!
//! ## Cooperative assignment
//!
//! When a partition must move from member X to member Y, the first round
//! removes it from X and withholds it from Y, recording it as in transition.
//! X revokes it and rejoins, and the follow-up round hands it to Y because
//! nobody owns it any more. Partitions that do not move stay owned
//! throughout.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::record::{Epoch, TopicPartition};

/// Group member identity
pub type MemberId = String;

/// Rebalance protocol implied by an assignor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebalanceProtocol {
    /// Members revoke everything before each rebalance
    Eager,
    /// Members revoke only partitions that move
    Cooperative,
}

/// What the group leader knows about a member when assigning
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberSubscription {
    pub topics: Vec<String>,
    /// Partitions the member held in its last generation
    pub owned_partitions: Vec<TopicPartition>,
    /// Generation the owned partitions were assigned in
    pub generation: Epoch,
}

impl MemberSubscription {
    pub fn new(topics: Vec<String>) -> Self {
        Self {
            topics,
            owned_partitions: Vec::new(),
            generation: -1,
        }
    }

    pub fn with_owned(mut self, owned: Vec<TopicPartition>, generation: Epoch) -> Self {
        self.owned_partitions = owned;
        self.generation = generation;
        self
    }

    fn subscribes_to(&self, topic: &str) -> bool {
        self.topics.iter().any(|t| t == topic)
    }
}

/// A partition withheld from its new owner until the old owner revokes it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMove {
    pub from: MemberId,
    pub to: MemberId,
}

/// Mapping from members to the partitions they own for one generation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Assignment {
    members: BTreeMap<MemberId, BTreeSet<TopicPartition>>,
    in_transition: BTreeMap<TopicPartition, PartitionMove>,
}

impl Assignment {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_members<'a>(members: impl IntoIterator<Item = &'a MemberId>) -> Self {
        Self {
            members: members
                .into_iter()
                .map(|m| (m.clone(), BTreeSet::new()))
                .collect(),
            in_transition: BTreeMap::new(),
        }
    }

    /// Build the previous assignment from members' ownership claims.
    ///
    /// A partition claimed by several members goes to the claim with the
    /// highest generation; ties go to the lowest member id.
    pub fn from_owned(members: &BTreeMap<MemberId, MemberSubscription>) -> Self {
        let mut claims: BTreeMap<&TopicPartition, (Epoch, &MemberId)> = BTreeMap::new();
        for (member_id, sub) in members {
            for tp in &sub.owned_partitions {
                let replace = match claims.get(tp) {
                    Some((generation, _)) => sub.generation > *generation,
                    None => true,
                };
                if replace {
                    claims.insert(tp, (sub.generation, member_id));
                }
            }
        }
        let mut assignment = Self::with_members(members.keys());
        for (tp, (_, member_id)) in claims {
            assignment.insert(member_id, tp.clone());
        }
        assignment
    }

    pub fn insert(&mut self, member_id: &str, tp: TopicPartition) {
        self.members.entry(member_id.to_string()).or_default().insert(tp);
    }

    fn remove(&mut self, member_id: &str, tp: &TopicPartition) -> bool {
        self.members
            .get_mut(member_id)
            .map(|set| set.remove(tp))
            .unwrap_or(false)
    }

    /// Partitions owned by a member; empty for unknown members
    pub fn partitions_for(&self, member_id: &str) -> BTreeSet<TopicPartition> {
        self.members.get(member_id).cloned().unwrap_or_default()
    }

    pub fn owner_of(&self, tp: &TopicPartition) -> Option<&str> {
        self.members
            .iter()
            .find(|(_, set)| set.contains(tp))
            .map(|(m, _)| m.as_str())
    }

    pub fn members(&self) -> impl Iterator<Item = (&MemberId, &BTreeSet<TopicPartition>)> {
        self.members.iter()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn in_transition(&self) -> &BTreeMap<TopicPartition, PartitionMove> {
        &self.in_transition
    }

    pub fn is_empty(&self) -> bool {
        self.members.values().all(BTreeSet::is_empty) && self.in_transition.is_empty()
    }

    /// Number of owned partitions across all members
    pub fn assigned_count(&self) -> usize {
        self.members.values().map(BTreeSet::len).sum()
    }

    /// Largest difference between any two members' partition counts,
    /// counting in-transition partitions toward their destination
    pub fn max_imbalance(&self) -> usize {
        let counts: Vec<usize> = self
            .members
            .iter()
            .map(|(m, set)| set.len() + self.in_transition.values().filter(|mv| &mv.to == m).count())
            .collect();
        match (counts.iter().max(), counts.iter().min()) {
            (Some(max), Some(min)) => max - min,
            _ => 0,
        }
    }

    /// Flatten into per-member partition lists for the wire
    pub fn into_member_lists(self) -> BTreeMap<MemberId, Vec<TopicPartition>> {
        self.members
            .into_iter()
            .map(|(m, set)| (m, set.into_iter().collect()))
            .collect()
    }
}

/// Trait for partition assignment strategies
pub trait PartitionAssignor: Send + Sync {
    /// Protocol name advertised when joining
    fn name(&self) -> &'static str;

    fn protocol(&self) -> RebalanceProtocol {
        RebalanceProtocol::Eager
    }

    /// Assign `partitions` to `members`
    fn assign(
        &self,
        members: &BTreeMap<MemberId, MemberSubscription>,
        partitions: &[TopicPartition],
    ) -> Assignment;
}

/// Partitions grouped by topic, each topic's partitions sorted
fn by_topic(partitions: &[TopicPartition]) -> BTreeMap<&str, Vec<&TopicPartition>> {
    let mut topics: BTreeMap<&str, Vec<&TopicPartition>> = BTreeMap::new();
    for tp in partitions {
        topics.entry(tp.topic.as_str()).or_default().push(tp);
    }
    for list in topics.values_mut() {
        list.sort();
        list.dedup();
    }
    topics
}

/// Range assignment strategy
pub struct RangeAssignor;

impl PartitionAssignor for RangeAssignor {
    fn name(&self) -> &'static str {
        "range"
    }

    fn assign(
        &self,
        members: &BTreeMap<MemberId, MemberSubscription>,
        partitions: &[TopicPartition],
    ) -> Assignment {
        let mut assignment = Assignment::with_members(members.keys());

        for (topic, topic_partitions) in by_topic(partitions) {
            // BTreeMap keys are already sorted
            let subscribers: Vec<&MemberId> = members
                .iter()
                .filter(|(_, sub)| sub.subscribes_to(topic))
                .map(|(id, _)| id)
                .collect();
            if subscribers.is_empty() {
                continue;
            }

            let per_member = topic_partitions.len() / subscribers.len();
            let extra = topic_partitions.len() % subscribers.len();

            let mut next = topic_partitions.into_iter();
            for (i, member_id) in subscribers.into_iter().enumerate() {
                let take = per_member + usize::from(i < extra);
                for tp in next.by_ref().take(take) {
                    assignment.insert(member_id, tp.clone());
                }
            }
        }

        assignment
    }
}

/// Round-robin assignment strategy
pub struct RoundRobinAssignor;

impl PartitionAssignor for RoundRobinAssignor {
    fn name(&self) -> &'static str {
        "roundrobin"
    }

    fn assign(
        &self,
        members: &BTreeMap<MemberId, MemberSubscription>,
        partitions: &[TopicPartition],
    ) -> Assignment {
        let mut assignment = Assignment::with_members(members.keys());
        let member_list: Vec<(&MemberId, &MemberSubscription)> = members.iter().collect();
        if member_list.is_empty() {
            return assignment;
        }

        let mut sorted: Vec<&TopicPartition> = partitions.iter().collect();
        sorted.sort();
        sorted.dedup();

        let mut cursor = 0usize;
        for tp in sorted {
            // Next member in circular order that subscribes to the topic
            let chosen = (0..member_list.len())
                .map(|step| (cursor + step) % member_list.len())
                .find(|&idx| member_list[idx].1.subscribes_to(&tp.topic));
            if let Some(idx) = chosen {
                assignment.insert(member_list[idx].0, tp.clone());
                cursor = idx + 1;
            }
        }

        assignment
    }
}

/// Sticky partition assignor
///
/// Keeps partitions with their previous owner while the owner stays within
/// its quota. Quotas are `total / members` with the `total % members` extra
/// slots going to the members that already own the most, so the result is
/// balanced to within one partition and nothing moves that does not have to.
#[derive(Debug, Default)]
pub struct StickyAssignor;

impl StickyAssignor {
    /// Assign relative to an explicit previous assignment
    pub fn assign_with_previous(
        &self,
        members: &BTreeMap<MemberId, MemberSubscription>,
        partitions: &[TopicPartition],
        previous: &Assignment,
    ) -> Assignment {
        let mut assignment = Assignment::with_members(members.keys());
        if members.is_empty() {
            return assignment;
        }

        let mut all: Vec<&TopicPartition> = partitions
            .iter()
            .filter(|tp| members.values().any(|sub| sub.subscribes_to(&tp.topic)))
            .collect();
        all.sort();
        all.dedup();
        let live: BTreeSet<&TopicPartition> = all.iter().copied().collect();

        let base = all.len() / members.len();
        let extra = all.len() % members.len();

        let retained: BTreeMap<&MemberId, Vec<TopicPartition>> = members
            .iter()
            .map(|(id, sub)| {
                let kept = previous
                    .partitions_for(id)
                    .into_iter()
                    .filter(|tp| live.contains(tp) && sub.subscribes_to(&tp.topic))
                    .collect();
                (id, kept)
            })
            .collect();

        let mut order: Vec<&MemberId> = members.keys().collect();
        order.sort_by(|a, b| retained[b].len().cmp(&retained[a].len()).then(a.cmp(b)));
        let quota: BTreeMap<&MemberId, usize> = order
            .iter()
            .enumerate()
            .map(|(i, id)| (*id, base + usize::from(i < extra)))
            .collect();

        let mut counts: BTreeMap<&MemberId, usize> = members.keys().map(|id| (id, 0)).collect();
        let mut taken: BTreeSet<TopicPartition> = BTreeSet::new();

        for id in &order {
            for tp in &retained[id] {
                if counts[id] < quota[id] && taken.insert(tp.clone()) {
                    assignment.insert(id, tp.clone());
                    *counts.entry(*id).or_default() += 1;
                }
            }
        }

        for tp in all {
            if taken.contains(tp) {
                continue;
            }
            let subscribers: Vec<&MemberId> = members
                .iter()
                .filter(|(_, sub)| sub.subscribes_to(&tp.topic))
                .map(|(id, _)| id)
                .collect();
            let pick = subscribers
                .iter()
                .copied()
                .filter(|id| counts[id] < quota[id])
                .min_by_key(|id| (counts[id], *id))
                .or_else(|| subscribers.iter().copied().min_by_key(|id| (counts[id], *id)));
            if let Some(id) = pick {
                assignment.insert(id, tp.clone());
                *counts.entry(id).or_default() += 1;
                taken.insert(tp.clone());
            }
        }

        assignment
    }
}

impl PartitionAssignor for StickyAssignor {
    fn name(&self) -> &'static str {
        "sticky"
    }

    fn assign(
        &self,
        members: &BTreeMap<MemberId, MemberSubscription>,
        partitions: &[TopicPartition],
    ) -> Assignment {
        let previous = Assignment::from_owned(members);
        self.assign_with_previous(members, partitions, &previous)
    }
}

/// Cooperative sticky assignor
#[derive(Debug, Default)]
pub struct CooperativeStickyAssignor;

impl PartitionAssignor for CooperativeStickyAssignor {
    fn name(&self) -> &'static str {
        "cooperative-sticky"
    }

    fn protocol(&self) -> RebalanceProtocol {
        RebalanceProtocol::Cooperative
    }

    fn assign(
        &self,
        members: &BTreeMap<MemberId, MemberSubscription>,
        partitions: &[TopicPartition],
    ) -> Assignment {
        let previous = Assignment::from_owned(members);
        let target = StickyAssignor.assign_with_previous(members, partitions, &previous);

        let mut plan = target.clone();
        for (from, owned) in previous.members() {
            for tp in owned {
                match target.owner_of(tp) {
                    Some(to) if to != from.as_str() => {
                        let to = to.to_string();
                        plan.remove(&to, tp);
                        plan.in_transition.insert(
                            tp.clone(),
                            PartitionMove {
                                from: from.clone(),
                                to,
                            },
                        );
                    }
                    _ => {}
                }
            }
        }
        plan
    }
}
