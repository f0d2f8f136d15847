use qf_indexer::db::init_db;
use qf_indexer::decode::SchemaRegistry;
use qf_indexer::domain::{ContractAddress, Decimal, ProposalId, RawLog, RoundId, RoundStatus};
use qf_indexer::ingest::{EventRecorder, RecordOutcome};
use qf_indexer::metrics::Metrics;
use qf_indexer::qf::{QfError, QfOptions, QfService};
use qf_indexer::testing::LogFactory;
use qf_indexer::Repository;
use std::str::FromStr;
use std::sync::Arc;
use tempfile::TempDir;

async fn setup() -> (Arc<Repository>, EventRecorder, QfService, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir
        .path()
        .join("test.db")
        .to_string_lossy()
        .to_string();
    let pool = init_db(&db_path).await.expect("init_db failed");
    let repo = Arc::new(Repository::new(pool));
    let metrics = Arc::new(Metrics::new());
    let recorder = EventRecorder::new(
        repo.clone(),
        Arc::new(SchemaRegistry::default()),
        metrics.clone(),
    );
    let qf = QfService::new(repo.clone(), metrics);
    (repo, recorder, qf, temp_dir)
}

async fn record_all(recorder: &EventRecorder, logs: &[RawLog]) {
    for log in logs {
        let outcome = recorder.record_event(log).await.unwrap();
        assert_eq!(outcome, RecordOutcome::Inserted, "log at block {}", log.block_number);
    }
}

fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

const CLOSED: QfOptions = QfOptions {
    weighted: false,
    dry_run: false,
};

#[tokio::test]
async fn test_closed_round_distributes_whole_pool() {
    let (_repo, recorder, qf, _temp) = setup().await;
    let mut f = LogFactory::new("0xc0");
    let mut logs = f.open_round("r1", "1000", &["A", "B"]);
    logs.push(f.donation("r1", "A", "0xd1", "100", None));
    logs.push(f.donation("r1", "A", "0xd2", "400", None));
    logs.push(f.donation("r1", "B", "0xd3", "100", None));
    logs.push(f.status("r1", RoundStatus::Closed));
    record_all(&recorder, &logs).await;

    let report = qf.trigger(&RoundId::new("r1"), CLOSED).await.unwrap();
    assert_eq!(report.version, Some(1));
    assert_eq!(report.outcome.total_score, dec("400"));
    assert_eq!(report.outcome.total_matched(), dec("1000"));

    let matches = qf.list_match_results(&RoundId::new("r1")).await.unwrap();
    let amount = |p: &str| {
        matches
            .iter()
            .find(|m| m.proposal_id.as_str() == p)
            .map(|m| m.amount)
            .unwrap()
    };
    assert_eq!(amount("A"), dec("1000"));
    assert_eq!(amount("B"), dec("0"));
}

#[tokio::test]
async fn test_many_small_donors_outscore_one_large() {
    let (_repo, recorder, qf, _temp) = setup().await;
    let mut f = LogFactory::new("0xc0");
    let mut logs = f.open_round("r1", "90", &["crowd", "whale"]);
    logs.push(f.donation("r1", "crowd", "0xd1", "25", None));
    logs.push(f.donation("r1", "crowd", "0xd2", "25", None));
    logs.push(f.donation("r1", "whale", "0xd3", "50", None));
    logs.push(f.status("r1", RoundStatus::Closed));
    record_all(&recorder, &logs).await;

    let report = qf.trigger(&RoundId::new("r1"), CLOSED).await.unwrap();
    let crowd = &report.outcome.matches[0];
    let whale = &report.outcome.matches[1];
    assert_eq!(crowd.proposal_id, ProposalId::new("crowd"));
    assert_eq!(crowd.raw_score, dec("50"));
    assert_eq!(whale.raw_score, dec("0"));
    assert_eq!(crowd.amount, dec("90"));
}

#[tokio::test]
async fn test_no_qualifying_proposal_matches_nothing() {
    let (_repo, recorder, qf, _temp) = setup().await;
    let mut f = LogFactory::new("0xc0");
    let mut logs = f.open_round("r1", "500", &["A", "B", "C"]);
    logs.push(f.donation("r1", "A", "0xd1", "10", None));
    logs.push(f.donation("r1", "A", "0xd1", "30", None));
    logs.push(f.donation("r1", "B", "0xd2", "7", None));
    logs.push(f.status("r1", RoundStatus::Closed));
    record_all(&recorder, &logs).await;

    let report = qf.trigger(&RoundId::new("r1"), CLOSED).await.unwrap();
    assert_eq!(report.outcome.total_score, Decimal::zero());
    assert_eq!(report.outcome.matches.len(), 3);
    assert!(report.outcome.matches.iter().all(|m| m.amount.is_zero()));
}

#[tokio::test]
async fn test_recalculation_versions_and_keeps_verified_rows() {
    let (repo, recorder, qf, _temp) = setup().await;
    let round = RoundId::new("r1");
    let mut f = LogFactory::new("0xc0");
    let mut logs = f.open_round("r1", "300", &["A", "B"]);
    logs.push(f.donation("r1", "A", "0xd1", "1", None));
    logs.push(f.donation("r1", "A", "0xd2", "1", None));
    logs.push(f.donation("r1", "B", "0xd1", "4", None));
    logs.push(f.donation("r1", "B", "0xd2", "1", None));
    logs.push(f.status("r1", RoundStatus::Closed));
    record_all(&recorder, &logs).await;

    let first = qf.trigger(&round, CLOSED).await.unwrap();
    assert_eq!(first.version, Some(1));
    assert!(qf
        .verify_match_result(&round, &ProposalId::new("A"), 1)
        .await
        .unwrap());
    assert!(!qf
        .verify_match_result(&round, &ProposalId::new("A"), 7)
        .await
        .unwrap());

    let second = qf
        .trigger(
            &round,
            QfOptions {
                weighted: true,
                dry_run: false,
            },
        )
        .await
        .unwrap();
    assert_eq!(second.version, Some(2));

    let results = qf.list_match_results(&round).await.unwrap();
    let versions: Vec<(String, i64, bool)> = results
        .iter()
        .map(|m| (m.proposal_id.as_str().to_string(), m.version, m.verified))
        .collect();
    assert_eq!(
        versions,
        vec![
            ("A".to_string(), 2, false),
            ("B".to_string(), 2, false),
            ("A".to_string(), 1, true),
        ]
    );
    assert!(results.iter().filter(|m| m.version == 2).all(|m| m.weighted));

    let runs = repo.list_qf_runs(&round).await.unwrap();
    assert_eq!(runs.iter().map(|r| r.version).collect::<Vec<_>>(), vec![1, 2]);
    assert!(runs[1].weighted);
}

#[tokio::test]
async fn test_open_round_needs_dry_run() {
    let (repo, recorder, qf, _temp) = setup().await;
    let round = RoundId::new("r1");
    let mut f = LogFactory::new("0xc0");
    let mut logs = f.open_round("r1", "10", &["A"]);
    logs.push(f.donation("r1", "A", "0xd1", "1", None));
    logs.push(f.donation("r1", "A", "0xd2", "1", None));
    record_all(&recorder, &logs).await;

    let err = qf.trigger(&round, CLOSED).await.unwrap_err();
    assert!(matches!(
        err,
        QfError::RoundNotClosed {
            status: RoundStatus::Active,
            ..
        }
    ));

    let preview = qf
        .trigger(
            &round,
            QfOptions {
                weighted: false,
                dry_run: true,
            },
        )
        .await
        .unwrap();
    assert_eq!(preview.version, None);
    assert_eq!(preview.outcome.total_matched(), dec("10"));
    assert!(repo.list_match_results(&round).await.unwrap().is_empty());

    // Late donations after close never reach the calculation.
    let close = f.status("r1", RoundStatus::Closed);
    let late = f.donation("r1", "A", "0xd3", "1000", None);
    record_all(&recorder, &[close]).await;
    assert!(matches!(
        recorder.record_event(&late).await.unwrap(),
        RecordOutcome::Rejected(_)
    ));
    let report = qf.trigger(&round, CLOSED).await.unwrap();
    assert_eq!(report.outcome.matches[0].contributed, dec("2"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_matching_runs_while_other_contracts_ingest() {
    let (repo, recorder, qf, _temp) = setup().await;
    let round = RoundId::new("r1");
    let mut closed = LogFactory::new("0xc0");
    let mut logs = closed.open_round("r1", "100", &["A"]);
    logs.push(closed.donation("r1", "A", "0xd1", "1", None));
    logs.push(closed.donation("r1", "A", "0xd2", "4", None));
    logs.push(closed.status("r1", RoundStatus::Closed));
    record_all(&recorder, &logs).await;

    let mut busy = LogFactory::new("0xc1");
    record_all(&recorder, &busy.open_round("r2", "10", &[])).await;
    let proposals: Vec<RawLog> = (0..200)
        .map(|i| busy.proposal("r2", &format!("p{}", i)))
        .collect();
    let idle = ContractAddress::new("0xc2");

    let ingest = async {
        let mut failures = Vec::new();
        for log in &proposals {
            if let Err(e) = recorder.record_event(log).await {
                failures.push(e.to_string());
            }
        }
        failures
    };
    let matching = async {
        let mut failures = Vec::new();
        for _ in 0..30 {
            if let Err(e) = qf.trigger(&round, CLOSED).await {
                failures.push(e.to_string());
            }
        }
        failures
    };
    let empty_windows = async {
        let mut failures = Vec::new();
        for block in 1..=60u64 {
            if let Err(e) = recorder
                .record_batch_and_advance(&idle, Vec::new(), block, block)
                .await
            {
                failures.push(e.to_string());
            }
        }
        failures
    };
    let (ingest_failures, qf_failures, window_failures) =
        tokio::join!(ingest, matching, empty_windows);

    assert!(ingest_failures.is_empty(), "{:?}", ingest_failures);
    assert!(qf_failures.is_empty(), "{:?}", qf_failures);
    assert!(window_failures.is_empty(), "{:?}", window_failures);

    assert_eq!(repo.list_qf_runs(&round).await.unwrap().len(), 30);
    assert_eq!(repo.list_proposals(&RoundId::new("r2")).await.unwrap().len(), 200);
    let cursor = repo.get_cursor(&idle).await.unwrap().unwrap();
    assert_eq!(cursor.last_processed_block, 60);
}
