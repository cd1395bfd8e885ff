// tests/property/queue_test.rs

//! Bounded-memory properties of the outbound queue and the deduplicator.

use proptest::prelude::*;
use std::collections::HashSet;
use std::time::Duration;
use tidegate::connection::OutboundQueue;
use tidegate::core::dedup::Deduplicator;

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 200,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_queue_keeps_the_newest_frames_in_order(
        capacity in 1usize..32,
        pushes in 0usize..100,
    ) {
        let mut queue = OutboundQueue::new(capacity);
        let mut evicted = Vec::new();
        for i in 0..pushes {
            if let Some(old) = queue.push(format!("frame-{i}")) {
                evicted.push(old);
            }
            prop_assert!(queue.len() <= capacity);
        }

        let kept = pushes.min(capacity);
        prop_assert_eq!(queue.len(), kept);
        prop_assert_eq!(evicted.len(), pushes - kept);

        // Evicted frames are the oldest ones, oldest first.
        let expected_evicted: Vec<String> =
            (0..pushes - kept).map(|i| format!("frame-{i}")).collect();
        prop_assert_eq!(evicted, expected_evicted);

        let expected: Vec<String> = (pushes - kept..pushes).map(|i| format!("frame-{i}")).collect();
        prop_assert_eq!(queue.take_all(), expected);
        prop_assert!(queue.is_empty());
    }

    #[test]
    fn test_dedup_reports_exactly_the_repeats(
        frames in prop::collection::vec("[a-z]{1,4}", 1..80),
    ) {
        let dedup = Deduplicator::new(Duration::from_secs(3600), 4096);
        let mut seen = HashSet::new();
        for frame in &frames {
            let duplicate = dedup.check_and_record("conn-1", frame.as_bytes());
            prop_assert_eq!(duplicate, !seen.insert(frame.clone()));
        }
        prop_assert_eq!(dedup.len(), seen.len());
        prop_assert_eq!(dedup.suppressed() as usize, frames.len() - seen.len());
    }

    #[test]
    fn test_dedup_memory_is_bounded(
        capacity in 1usize..16,
        distinct in 0usize..64,
    ) {
        let dedup = Deduplicator::new(Duration::from_secs(3600), capacity);
        for i in 0..distinct {
            prop_assert!(!dedup.check_and_record("scope", &i.to_le_bytes()));
        }
        prop_assert_eq!(dedup.len(), distinct.min(capacity));
    }
}
