//! End-to-end tests for candidate selection across instances
//!
//! Two handles on one database file stand in for two instances. Claims
//! must never overlap and must respect the process delay.

mod common;

use common::{seed_pattern_policy, seed_repositories, ts, SharedDb, DAY};
use repo_upkeep::policy::ScanKind;
use repo_upkeep::scan::{CandidateSelector, ScanOptions, SqliteCandidateSelector};
use repo_upkeep::staleness::{SqliteStalenessStore, StalenessStore};
use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

const PREFIX: &str = "github.com/fleet";

fn options(limit: usize) -> ScanOptions {
    ScanOptions {
        process_delay: DAY,
        limit,
        allow_global_policies: false,
        repository_match_limit: None,
    }
}

#[test]
fn test_concurrent_instances_never_claim_the_same_repository() {
    let shared = SharedDb::new();
    seed_repositories(&shared.first, 1..=60, PREFIX);
    seed_pattern_policy(&shared.first, ScanKind::Indexing, PREFIX);

    let barrier = Arc::new(Barrier::new(2));
    let workers: Vec<_> = [shared.first.clone(), shared.second.clone()]
        .into_iter()
        .map(|db| {
            let barrier = barrier.clone();
            thread::spawn(move || {
                let selector = SqliteCandidateSelector::new(db);
                barrier.wait();
                let mut claimed = Vec::new();
                loop {
                    let batch = selector
                        .select_and_claim(ScanKind::Indexing, &options(7), ts(0))
                        .unwrap();
                    if batch.is_empty() {
                        break;
                    }
                    claimed.extend(batch);
                }
                claimed
            })
        })
        .collect();

    let results: Vec<Vec<i64>> = workers.into_iter().map(|w| w.join().unwrap()).collect();

    let first: HashSet<i64> = results[0].iter().copied().collect();
    let second: HashSet<i64> = results[1].iter().copied().collect();
    assert!(first.is_disjoint(&second), "overlap: {:?}", first.intersection(&second));
    assert_eq!(results[0].len() + results[1].len(), 60);
    assert_eq!(first.union(&second).count(), 60);
}

#[test]
fn test_claims_from_one_instance_are_visible_to_the_other() {
    let shared = SharedDb::new();
    seed_repositories(&shared.first, 1..=3, PREFIX);
    seed_pattern_policy(&shared.first, ScanKind::Indexing, PREFIX);

    let first = SqliteCandidateSelector::new(shared.first.clone());
    let second = SqliteCandidateSelector::new(shared.second.clone());

    assert_eq!(
        first
            .select_and_claim(ScanKind::Indexing, &options(10), ts(0))
            .unwrap(),
        vec![1, 2, 3]
    );
    // Within the delay for the other instance too
    assert!(second
        .select_and_claim(ScanKind::Indexing, &options(10), ts(3600))
        .unwrap()
        .is_empty());
    // Exactly at the delay boundary nothing is due yet
    assert!(second
        .select_and_claim(ScanKind::Indexing, &options(10), ts(DAY.as_secs() as i64))
        .unwrap()
        .is_empty());
    assert_eq!(
        second
            .select_and_claim(ScanKind::Indexing, &options(10), ts(DAY.as_secs() as i64 + 1))
            .unwrap(),
        vec![1, 2, 3]
    );
}

#[test]
fn test_retention_waits_for_fresh_permissions() {
    let shared = SharedDb::new();
    seed_repositories(&shared.first, 1..=4, PREFIX);
    seed_pattern_policy(&shared.first, ScanKind::Retention, PREFIX);

    let staleness = SqliteStalenessStore::new(shared.second.clone());
    let token = staleness.mark_dirty(2, ts(0)).unwrap();

    let selector = SqliteCandidateSelector::new(shared.first.clone());
    assert_eq!(
        selector
            .select_and_claim(ScanKind::Retention, &options(10), ts(10))
            .unwrap(),
        vec![1, 3, 4]
    );

    staleness.consume(2, token).unwrap();
    assert_eq!(
        selector
            .select_and_claim(ScanKind::Retention, &options(10), ts(20))
            .unwrap(),
        vec![2]
    );

    // Indexing has its own ledger and no policy, so nothing is eligible
    assert!(selector
        .select_and_claim(ScanKind::Indexing, &options(10), ts(30))
        .unwrap()
        .is_empty());
}
