use qf_indexer::chain::{ChainSourceError, MockChainSource, RetryPolicy};
use qf_indexer::db::init_db;
use qf_indexer::decode::SchemaRegistry;
use qf_indexer::domain::{ContractAddress, Decimal, ProposalId, RawLog, RoundStatus};
use qf_indexer::ingest::{BackfillWorker, EventRecorder, IngestConfig, IngestError, RecordOutcome};
use qf_indexer::metrics::Metrics;
use qf_indexer::testing::LogFactory;
use qf_indexer::Repository;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Harness {
    repo: Arc<Repository>,
    recorder: Arc<EventRecorder>,
    worker: BackfillWorker,
    _temp: TempDir,
}

async fn setup(mock: Arc<MockChainSource>, batch_size: u64) -> Harness {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir
        .path()
        .join("test.db")
        .to_string_lossy()
        .to_string();
    let pool = init_db(&db_path).await.expect("init_db failed");
    let repo = Arc::new(Repository::new(pool));
    let recorder = Arc::new(EventRecorder::new(
        repo.clone(),
        Arc::new(SchemaRegistry::default()),
        Arc::new(Metrics::new()),
    ));
    let config = IngestConfig {
        batch_size,
        confirmation_depth: 0,
        retry: RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2)),
        heartbeat_timeout: Duration::from_secs(5),
    };
    let worker = BackfillWorker::new(mock, recorder.clone(), config);
    Harness {
        repo,
        recorder,
        worker,
        _temp: temp_dir,
    }
}

fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

async fn total(repo: &Repository, proposal: &str) -> Decimal {
    repo.get_proposal(&ProposalId::new(proposal))
        .await
        .unwrap()
        .expect("proposal exists")
        .total_donations
}

/// A funded round spread over blocks 1..=9.
fn round_history(f: &mut LogFactory) -> Vec<RawLog> {
    let mut logs = f.open_round("r1", "1000", &["p1", "p2"]);
    logs.push(f.donation("r1", "p1", "0xd1", "100", None));
    logs.push(f.donation("r1", "p1", "0xd2", "400", None));
    logs.push(f.donation("r1", "p2", "0xd1", "100", Some("0.5")));
    logs.push(f.donation("r1", "p2", "0xd3", "2.5", None));
    logs.push(f.status("r1", RoundStatus::Closed));
    logs
}

#[tokio::test]
async fn test_overlapping_backfill_and_live_delivery_applies_once() {
    let mut f = LogFactory::new("0xc0");
    let logs = round_history(&mut f);
    let donation = logs[3].clone();
    let mock = Arc::new(MockChainSource::new().with_head(20).with_logs(logs));
    let h = setup(mock, 4).await;
    let contract = f.contract().clone();

    h.worker.run(&contract, 1, 20).await.unwrap();
    // The same log arrives again from the live side.
    assert_eq!(
        h.recorder.record_event(&donation).await.unwrap(),
        RecordOutcome::Duplicate
    );
    // And once more through an overlapping re-scan.
    let report = h.worker.run(&contract, 1, 20).await.unwrap();
    assert_eq!(report.inserted, 0);
    assert_eq!(report.duplicates, 9);

    assert_eq!(total(&h.repo, "p1").await, dec("500"));
    assert_eq!(h.repo.count_raw_events(&contract, false).await.unwrap(), 9);
    let snapshot = h.recorder.metrics().snapshot();
    assert_eq!(snapshot.events_processed, 9);
    assert_eq!(snapshot.events_duplicate, 10);
}

#[tokio::test]
async fn test_same_block_logs_apply_in_log_index_order() {
    let mut f = LogFactory::new("0xc0");
    let mut logs = f.open_round("r1", "10", &["p1"]);
    f.at_block(10);
    let first = f.donation("r1", "p1", "0xd1", "1", None);
    let close = f.status("r1", RoundStatus::Closed);
    let late = f.donation("r1", "p1", "0xd2", "2", None);
    logs.extend([late.clone(), close, first]);

    let mock = Arc::new(MockChainSource::new().with_head(10));
    let h = setup(mock, 100).await;
    let contract = f.contract().clone();

    let summary = h
        .recorder
        .record_batch_and_advance(&contract, logs, 1, 10)
        .await
        .unwrap();
    assert_eq!(summary.inserted, 5);
    assert_eq!(summary.rejected, 1);
    assert_eq!(summary.cursor, 10);

    // Log index 0 landed before the close at index 1; index 2 came after it.
    assert_eq!(total(&h.repo, "p1").await, dec("1"));
    let stored = h
        .repo
        .get_raw_event(&late.tx_hash, late.log_index)
        .await
        .unwrap()
        .unwrap();
    assert!(!stored.processed);
    assert!(stored.error.is_some());
}

#[tokio::test]
async fn test_interrupted_backfill_resumes_to_same_state() {
    let mut f = LogFactory::new("0xc0");
    let logs = round_history(&mut f);
    let contract = f.contract().clone();

    let clean_mock = Arc::new(MockChainSource::new().with_head(12).with_logs(logs.clone()));
    let clean = setup(clean_mock, 3).await;
    clean.worker.run(&contract, 1, 12).await.unwrap();

    let flaky_mock = Arc::new(MockChainSource::new().with_head(12).with_logs(logs));
    let flaky = setup(flaky_mock.clone(), 3).await;
    flaky.worker.run(&contract, 1, 3).await.unwrap();
    flaky_mock.fail_get_logs(ChainSourceError::Timeout, 3);
    let err = flaky.worker.catch_up(&contract).await.unwrap_err();
    assert!(matches!(
        err,
        IngestError::RangeFailed {
            from_block: 4,
            to_block: 6,
            ..
        }
    ));
    assert!(err.is_retryable());
    assert_eq!(
        flaky
            .repo
            .get_cursor(&contract)
            .await
            .unwrap()
            .unwrap()
            .last_processed_block,
        3
    );
    assert_eq!(flaky.repo.list_failed_ranges(&contract).await.unwrap().len(), 1);

    let resumed = flaky.worker.catch_up(&contract).await.unwrap();
    assert_eq!(resumed.cursor, Some(12));

    for p in ["p1", "p2"] {
        assert_eq!(total(&flaky.repo, p).await, total(&clean.repo, p).await);
    }
    let clean_events = clean.repo.list_raw_events(&contract, None, None).await.unwrap();
    let flaky_events = flaky.repo.list_raw_events(&contract, None, None).await.unwrap();
    let keys = |events: &[qf_indexer::domain::RawEvent]| {
        events
            .iter()
            .map(|e| (e.tx_hash.clone(), e.log_index, e.processed))
            .collect::<Vec<_>>()
    };
    assert_eq!(keys(&clean_events), keys(&flaky_events));
    assert_eq!(
        clean.repo.get_cursor(&contract).await.unwrap().unwrap().last_processed_block,
        12
    );
}

#[tokio::test]
async fn test_bad_logs_are_isolated_from_the_batch() {
    let mut f = LogFactory::new("0xc0");
    let mut logs = f.open_round("r1", "10", &["p1"]);
    logs.push(f.raw("0xdeadbeef".to_string(), b"{}".to_vec()));
    let selector = SchemaRegistry::default()
        .selector_of("DonationReceived")
        .unwrap();
    logs.push(f.raw(selector, b"not json".to_vec()));
    logs.push(f.donation("r1", "p1", "0xd1", "-5", None));
    logs.push(f.donation("r1", "p1", "0xd1", "7", None));
    let mock = Arc::new(MockChainSource::new().with_head(50).with_logs(logs));
    let h = setup(mock, 100).await;
    let contract: ContractAddress = f.contract().clone();

    let report = h.worker.run(&contract, 1, 50).await.unwrap();
    assert_eq!(report.rejected, 3);
    assert_eq!(report.inserted, 4);
    assert_eq!(report.cursor, Some(50));

    assert_eq!(total(&h.repo, "p1").await, dec("7"));
    assert_eq!(h.repo.count_raw_events(&contract, true).await.unwrap(), 3);
    assert_eq!(h.recorder.metrics().snapshot().events_error, 3);
    assert!(!h.repo.list_audit(Some("decode_error"), 10).await.unwrap().is_empty());
}
