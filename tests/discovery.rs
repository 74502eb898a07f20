//! Discovery behavior against an in-memory repository fake.

mod common;

use chrono::NaiveDate;
use proptest::prelude::*;
use tokio_util::sync::CancellationToken;
use url::Url;

use common::{FakeRepo, make_zip};
use wincore::BuildCoordinate;
use wincore::clock::FixedClock;
use wincore::error::{ProbeError, SourceError};
use wincore::jfrog::{Discovery, RetryPolicy, build_artifact_url};
use wincore::types::Component;

fn component() -> Component {
    Component {
        id: 1,
        guid: "aaaa-0001".to_string(),
        name: "Svc".to_string(),
        project_key: "acme".to_string(),
        url_pattern: None,
    }
}

fn base() -> Url {
    Url::parse("https://jfrog.example.com/artifactory").unwrap()
}

fn day(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn publish(repo: &FakeRepo, date: NaiveDate, seq: u32) {
    let coord = BuildCoordinate::new(date, seq).unwrap();
    let url = build_artifact_url(&base(), &component(), "main", &coord).unwrap();
    repo.publish(&url, make_zip(&[("f.txt", b"x".as_slice())]));
}

async fn discover(
    repo: &FakeRepo,
    today: NaiveDate,
    hint: Option<BuildCoordinate>,
) -> Result<Option<BuildCoordinate>, ProbeError> {
    let clock = FixedClock(today);
    let discovery = Discovery {
        source: repo,
        clock: &clock,
        lookback_days: 7,
        retry: RetryPolicy::with_attempts(0),
    };
    discovery
        .latest_for(&base(), &component(), "main", hint, &CancellationToken::new())
        .await
}

#[tokio::test]
async fn fresh_tuple_finds_the_latest_of_today() {
    let repo = FakeRepo::new();
    let today = day(2025, 1, 2);
    publish(&repo, today, 1);
    publish(&repo, today, 2);

    let found = discover(&repo, today, None).await.unwrap();
    assert_eq!(found, Some(BuildCoordinate::new(today, 2).unwrap()));
}

#[tokio::test]
async fn hint_seeds_the_ramp_and_finds_the_increment() {
    let repo = FakeRepo::new();
    let today = day(2025, 1, 2);
    for seq in 1..=3 {
        publish(&repo, today, seq);
    }
    let hint = BuildCoordinate::new(today, 2).unwrap();
    let found = discover(&repo, today, Some(hint)).await.unwrap();
    assert_eq!(found, Some(BuildCoordinate::new(today, 3).unwrap()));
}

#[tokio::test]
async fn hint_with_no_newer_build_returns_the_hint() {
    let repo = FakeRepo::new();
    let today = day(2025, 1, 2);
    for seq in 1..=2 {
        publish(&repo, today, seq);
    }
    let hint = BuildCoordinate::new(today, 2).unwrap();
    let found = discover(&repo, today, Some(hint)).await.unwrap();
    // The caller compares against tracking and records "no new build".
    assert_eq!(found, Some(hint));
}

#[tokio::test]
async fn walks_back_to_the_most_recent_prior_date_with_builds() {
    let repo = FakeRepo::new();
    let today = day(2025, 1, 10);
    let three_days_ago = day(2025, 1, 7);
    for seq in 1..=5 {
        publish(&repo, three_days_ago, seq);
    }
    let found = discover(&repo, today, None).await.unwrap();
    assert_eq!(found, Some(BuildCoordinate::new(three_days_ago, 5).unwrap()));
}

#[tokio::test]
async fn empty_lookback_window_discovers_nothing() {
    let repo = FakeRepo::new();
    let today = day(2025, 1, 10);
    // A build exists, but outside the seven-day window.
    publish(&repo, day(2025, 1, 1), 3);

    let found = discover(&repo, today, None).await.unwrap();
    assert_eq!(found, None);
    // One probe per examined date: today plus seven days back.
    assert_eq!(repo.probe_count(), 8);
}

#[tokio::test]
async fn large_sequence_counts_stay_within_the_probe_budget() {
    let repo = FakeRepo::new();
    let today = day(2025, 1, 2);
    let n = 137;
    for seq in 1..=n {
        publish(&repo, today, seq);
    }
    repo.reset_probe_count();
    let found = discover(&repo, today, None).await.unwrap();
    assert_eq!(found, Some(BuildCoordinate::new(today, n).unwrap()));
    // Exponential ramp plus binary search: generously under one probe per
    // build.
    assert!(
        repo.probe_count() <= 32,
        "expected O(log n) probes, got {}",
        repo.probe_count()
    );
}

#[tokio::test]
async fn auth_failure_surfaces_immediately() {
    let repo = FakeRepo::new();
    repo.deny_prefix("https://jfrog.example.com/");
    let result = discover(&repo, day(2025, 1, 2), None).await;
    assert!(matches!(
        result,
        Err(ProbeError::Source(SourceError::Unauthorized(_)))
    ));
    // No retries, no date walk: one probe was enough to give up.
    assert_eq!(repo.probe_count(), 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Whatever the number of builds published today, discovery finds
    /// exactly the greatest sequence.
    #[test]
    fn discovery_finds_the_greatest_sequence(n in 1u32..200) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let repo = FakeRepo::new();
            let today = day(2025, 3, 15);
            for seq in 1..=n {
                publish(&repo, today, seq);
            }
            let found = discover(&repo, today, None).await.unwrap();
            prop_assert_eq!(found, Some(BuildCoordinate::new(today, n).unwrap()));
            Ok(())
        })?;
    }

    /// A hint anywhere at or below the latest build never changes the
    /// answer.
    #[test]
    fn hints_do_not_change_the_answer(n in 2u32..120, hint_seq in 1u32..120) {
        prop_assume!(hint_seq <= n);
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let repo = FakeRepo::new();
            let today = day(2025, 3, 15);
            for seq in 1..=n {
                publish(&repo, today, seq);
            }
            let hint = BuildCoordinate::new(today, hint_seq).unwrap();
            let found = discover(&repo, today, Some(hint)).await.unwrap();
            prop_assert_eq!(found, Some(BuildCoordinate::new(today, n).unwrap()));
            Ok(())
        })?;
    }
}
