//! Pure queue-ordering helpers.
//!
//! Kept free of I/O so the ordering laws can be property-tested directly.
//! The contract: for any two enqueued PRs A, B with `A.seq < B.seq`,
//! `A.priority >= B.priority`. Appends preserve it when the tail's priority
//! is not lower than the newcomer's; otherwise the queue is rebuilt from the
//! first position that violates it.

use crate::store::EnqueueRecord;

/// Index at which a PR of `new_priority` enters an ordered queue: the first
/// position holding a strictly lower priority, or the end. Equal priorities
/// stay ahead of the newcomer (FIFO among equals).
pub fn insertion_point(priorities: &[i64], new_priority: i64) -> usize {
    priorities
        .iter()
        .position(|&p| p < new_priority)
        .unwrap_or(priorities.len())
}

/// Length of the maximal queue prefix whose records have all finished and
/// passed CI. Only such a prefix may be dequeued.
pub fn passing_prefix(records: &[&EnqueueRecord]) -> usize {
    records
        .iter()
        .take_while(|record| record.finished && record.passed)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn record(finished: bool, passed: bool) -> EnqueueRecord {
        EnqueueRecord {
            pr_id: 0,
            merge_queue_id: 0,
            seq: 0,
            associated_branch: "merge-queue".to_string(),
            mq_commit: String::new(),
            ci_number: None,
            finished,
            passed,
            enqueued_at: String::new(),
        }
    }

    #[test]
    fn insertion_point_appends_on_equal_priority() {
        assert_eq!(insertion_point(&[5, 5, 0], 0), 3);
        assert_eq!(insertion_point(&[5, 5, 0], 5), 2);
        assert_eq!(insertion_point(&[], 3), 0);
        assert_eq!(insertion_point(&[0, 0], 1), 0);
    }

    #[test]
    fn passing_prefix_stops_at_first_unfinished() {
        let records = vec![record(true, true), record(false, false), record(true, true)];
        let refs: Vec<&EnqueueRecord> = records.iter().collect();
        assert_eq!(passing_prefix(&refs), 1);
    }

    #[test]
    fn passing_prefix_ignores_latched_later_passes() {
        let records = vec![record(false, false), record(true, true)];
        let refs: Vec<&EnqueueRecord> = records.iter().collect();
        assert_eq!(passing_prefix(&refs), 0);
    }

    proptest! {
        /// Folding any insertion sequence through `insertion_point` keeps
        /// the queue's priorities non-increasing, which is exactly the
        /// ordering contract.
        #[test]
        fn insertions_preserve_ordering_contract(priorities in prop::collection::vec(0i64..10, 0..40)) {
            let mut queue: Vec<i64> = Vec::new();
            for p in priorities {
                let at = insertion_point(&queue, p);
                // All entries ahead of the insertion point outrank (or tie
                // with) the newcomer, everything after is strictly lower.
                prop_assert!(queue[..at].iter().all(|&q| q >= p));
                prop_assert!(queue[at..].iter().all(|&q| q < p));
                queue.insert(at, p);
                prop_assert!(queue.windows(2).all(|w| w[0] >= w[1]));
            }
        }

        #[test]
        fn passing_prefix_is_a_prefix(flags in prop::collection::vec((any::<bool>(), any::<bool>()), 0..20)) {
            let records: Vec<EnqueueRecord> =
                flags.iter().map(|&(f, p)| record(f, p)).collect();
            let refs: Vec<&EnqueueRecord> = records.iter().collect();
            let n = passing_prefix(&refs);
            prop_assert!(refs[..n].iter().all(|r| r.finished && r.passed));
            if n < refs.len() {
                prop_assert!(!(refs[n].finished && refs[n].passed));
            }
        }
    }
}
