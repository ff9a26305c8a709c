//! Property-based tests for partition assignment
//!
//! For any group size and partition count:
//! - every partition has exactly one owner
//! - owners differ by at most one partition
//! - sticky assignors keep survivors' partitions when a member leaves

use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

use streamline_client::consumer::{
    Assignment, CooperativeStickyAssignor, MemberId, MemberSubscription, PartitionAssignor,
    RangeAssignor, RoundRobinAssignor, StickyAssignor,
};
use streamline_client::TopicPartition;

fn members(count: usize) -> BTreeMap<MemberId, MemberSubscription> {
    (0..count)
        .map(|i| (format!("member-{i:02}"), MemberSubscription::new(vec!["t".to_string()])))
        .collect()
}

fn partitions(count: i32) -> Vec<TopicPartition> {
    (0..count).map(|p| TopicPartition::new("t", p)).collect()
}

fn assert_complete(assignment: &Assignment, partitions: &[TopicPartition]) {
    let mut seen = BTreeSet::new();
    for (_, owned) in assignment.members() {
        for tp in owned {
            assert!(seen.insert(tp.clone()), "{tp} assigned twice");
        }
    }
    for tp in assignment.in_transition().keys() {
        assert!(seen.insert(tp.clone()), "{tp} both owned and moving");
    }
    assert_eq!(seen.len(), partitions.len());
}

/// Owned partitions reported back on the next join
fn with_owned(
    members: &BTreeMap<MemberId, MemberSubscription>,
    previous: &Assignment,
) -> BTreeMap<MemberId, MemberSubscription> {
    members
        .iter()
        .map(|(id, sub)| {
            let owned = previous.partitions_for(id).into_iter().collect();
            (id.clone(), sub.clone().with_owned(owned, 1))
        })
        .collect()
}

proptest! {
    #[test]
    fn prop_every_assignor_covers_and_balances(member_count in 1usize..8, partition_count in 0i32..40) {
        let group = members(member_count);
        let all = partitions(partition_count);
        let assignors: Vec<Box<dyn PartitionAssignor>> = vec![
            Box::new(RangeAssignor),
            Box::new(RoundRobinAssignor),
            Box::new(StickyAssignor),
            Box::new(CooperativeStickyAssignor),
        ];
        for assignor in assignors {
            let assignment = assignor.assign(&group, &all);
            assert_complete(&assignment, &all);
            prop_assert!(assignment.max_imbalance() <= 1, "{} imbalance", assignor.name());
            prop_assert_eq!(assignment.member_count(), member_count);
        }
    }

    #[test]
    fn prop_sticky_keeps_survivor_partitions(member_count in 2usize..8, partition_count in 1i32..40, leaver in 0usize..8) {
        let group = members(member_count);
        let all = partitions(partition_count);
        let first = StickyAssignor.assign(&group, &all);

        let leaver = format!("member-{:02}", leaver % member_count);
        let mut survivors = with_owned(&group, &first);
        survivors.remove(&leaver);

        let second = CooperativeStickyAssignor.assign(&survivors, &all);
        assert_complete(&second, &all);
        prop_assert!(second.in_transition().is_empty());
        for id in survivors.keys() {
            let before = first.partitions_for(id);
            let after = second.partitions_for(id);
            prop_assert!(before.is_subset(&after), "{} lost partitions", id);
        }
        prop_assert!(second.max_imbalance() <= 1);
    }

    #[test]
    fn prop_sticky_is_stable_without_membership_change(member_count in 1usize..8, partition_count in 0i32..40) {
        let group = members(member_count);
        let all = partitions(partition_count);
        let first = StickyAssignor.assign(&group, &all);
        let second = StickyAssignor.assign(&with_owned(&group, &first), &all);
        prop_assert_eq!(first, second);
    }
}
