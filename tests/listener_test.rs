use qf_indexer::chain::{ChainSource, MockChainSource, RetryPolicy};
use qf_indexer::db::init_db;
use qf_indexer::decode::SchemaRegistry;
use qf_indexer::domain::{BlockNumber, ContractAddress, Decimal, ProposalId};
use qf_indexer::ingest::{BackfillWorker, ContractIndexer, EventRecorder, IngestConfig, LiveListener};
use qf_indexer::metrics::Metrics;
use qf_indexer::testing::LogFactory;
use qf_indexer::Repository;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::watch;
use tokio::task::JoinHandle;

struct Running {
    repo: Arc<Repository>,
    metrics: Arc<Metrics>,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
    _temp: TempDir,
}

async fn start(mock: Arc<MockChainSource>, contract: &ContractAddress, heartbeat: Duration) -> Running {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir
        .path()
        .join("test.db")
        .to_string_lossy()
        .to_string();
    let pool = init_db(&db_path).await.expect("init_db failed");
    let repo = Arc::new(Repository::new(pool));
    let metrics = Arc::new(Metrics::new());
    let recorder = Arc::new(EventRecorder::new(
        repo.clone(),
        Arc::new(SchemaRegistry::default()),
        metrics.clone(),
    ));
    let config = IngestConfig {
        batch_size: 50,
        confirmation_depth: 2,
        retry: RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5)),
        heartbeat_timeout: heartbeat,
    };
    let source: Arc<dyn ChainSource> = mock;
    let backfill = BackfillWorker::new(source.clone(), recorder.clone(), config);
    let listener = LiveListener::new(source.clone(), recorder, backfill.clone());
    let indexer = ContractIndexer::new(contract.clone(), Some(1), source, backfill, listener);

    let (shutdown, rx) = watch::channel(false);
    let handle = indexer.spawn(rx);
    Running {
        repo,
        metrics,
        shutdown,
        handle,
        _temp: temp_dir,
    }
}

async fn wait_for_cursor(repo: &Repository, contract: &ContractAddress, block: BlockNumber) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let cursor = repo
            .get_cursor(contract)
            .await
            .unwrap()
            .map(|c| c.last_processed_block);
        if cursor == Some(block) {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "cursor stuck at {:?}, expected {}",
            cursor,
            block
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_for_subscriptions(mock: &MockChainSource, count: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while mock.subscribe_calls() < count {
        assert!(
            Instant::now() < deadline,
            "only {} subscriptions, expected {}",
            mock.subscribe_calls(),
            count
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn total(repo: &Repository, proposal: &str) -> Decimal {
    repo.get_proposal(&ProposalId::new(proposal))
        .await
        .unwrap()
        .expect("proposal exists")
        .total_donations
}

#[tokio::test]
async fn test_live_blocks_wait_for_confirmation_depth() {
    let mut f = LogFactory::new("0xc0");
    let logs = f.open_round("r1", "100", &["p1"]);
    let contract = f.contract().clone();
    let mock = Arc::new(MockChainSource::new().with_head(5).with_logs(logs));
    let run = start(mock.clone(), &contract, Duration::from_secs(10)).await;

    wait_for_cursor(&run.repo, &contract, 3).await;
    wait_for_subscriptions(&mock, 1).await;

    f.at_block(6);
    mock.emit_log(f.donation("r1", "p1", "0xd1", "4", None));
    mock.set_head(7);
    wait_for_cursor(&run.repo, &contract, 5).await;
    assert_eq!(total(&run.repo, "p1").await, Decimal::zero());

    mock.set_head(8);
    wait_for_cursor(&run.repo, &contract, 6).await;
    assert_eq!(total(&run.repo, "p1").await, Decimal::from(4u64));

    // A head repeat re-finalises nothing.
    mock.set_head(8);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(total(&run.repo, "p1").await, Decimal::from(4u64));

    run.shutdown.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), run.handle)
        .await
        .expect("indexer stops on shutdown")
        .unwrap();
}

#[tokio::test]
async fn test_disconnect_recovers_blocks_mined_meanwhile() {
    let mut f = LogFactory::new("0xc0");
    let logs = f.open_round("r1", "100", &["p1"]);
    let contract = f.contract().clone();
    let mock = Arc::new(MockChainSource::new().with_head(5).with_logs(logs));
    let run = start(mock.clone(), &contract, Duration::from_secs(10)).await;

    wait_for_cursor(&run.repo, &contract, 3).await;
    wait_for_subscriptions(&mock, 1).await;

    mock.disconnect_all();
    mock.set_head(10);
    f.at_block(6);
    mock.emit_log(f.donation("r1", "p1", "0xd1", "9", None));

    wait_for_subscriptions(&mock, 2).await;
    wait_for_cursor(&run.repo, &contract, 8).await;
    assert_eq!(total(&run.repo, "p1").await, Decimal::from(9u64));
    assert!(run.metrics.snapshot().resubscriptions >= 1);

    run.shutdown.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), run.handle)
        .await
        .expect("indexer stops on shutdown")
        .unwrap();
}

#[tokio::test]
async fn test_silent_subscription_is_replaced() {
    let contract = ContractAddress::new("0xc0");
    let mock = Arc::new(MockChainSource::new().with_head(5));
    let run = start(mock.clone(), &contract, Duration::from_millis(50)).await;

    wait_for_subscriptions(&mock, 3).await;
    assert!(run.metrics.snapshot().resubscriptions >= 2);
    assert_eq!(
        run.repo
            .get_cursor(&contract)
            .await
            .unwrap()
            .map(|c| c.last_processed_block),
        Some(3)
    );

    run.shutdown.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), run.handle)
        .await
        .expect("indexer stops on shutdown")
        .unwrap();
}
