//! In-memory chain source for tests and local runs.

use super::{ChainSource, ChainSourceError, LogStream, SubscriptionEvent};
use crate::domain::{sort_logs_deterministic, BlockNumber, ContractAddress, RawLog};
use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

type Subscriber = (ContractAddress, mpsc::UnboundedSender<Result<SubscriptionEvent, ChainSourceError>>);

/// Mock chain source with scripted logs, head and failures.
#[derive(Debug, Default)]
pub struct MockChainSource {
    logs: Mutex<Vec<RawLog>>,
    head: AtomicU64,
    get_logs_failures: Mutex<VecDeque<ChainSourceError>>,
    requested_ranges: Mutex<Vec<(BlockNumber, BlockNumber)>>,
    subscribers: Mutex<Vec<Subscriber>>,
    subscribe_calls: AtomicUsize,
}

impl MockChainSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_head(self, head: BlockNumber) -> Self {
        self.head.store(head, Ordering::SeqCst);
        self
    }

    pub fn with_log(self, log: RawLog) -> Self {
        lock(&self.logs).push(log);
        self
    }

    pub fn with_logs(self, logs: Vec<RawLog>) -> Self {
        lock(&self.logs).extend(logs);
        self
    }

    /// Make the next `times` calls to `get_logs` fail with `error`.
    pub fn fail_get_logs(&self, error: ChainSourceError, times: usize) {
        let mut failures = lock(&self.get_logs_failures);
        for _ in 0..times {
            failures.push_back(error.clone());
        }
    }

    /// Block ranges passed to `get_logs`, in call order, including failed calls.
    pub fn requested_ranges(&self) -> Vec<(BlockNumber, BlockNumber)> {
        lock(&self.requested_ranges).clone()
    }

    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    /// Append a log to the chain and push it to live subscribers of its contract.
    pub fn emit_log(&self, log: RawLog) {
        lock(&self.logs).push(log.clone());
        let contract = log.contract_address.clone();
        self.broadcast(Some(&contract), SubscriptionEvent::Log(log));
    }

    /// Move the head and notify every subscriber.
    pub fn set_head(&self, head: BlockNumber) {
        self.head.store(head, Ordering::SeqCst);
        self.broadcast(None, SubscriptionEvent::NewHead(head));
    }

    /// Close all live subscriptions, as a dropped connection would.
    pub fn disconnect_all(&self) {
        lock(&self.subscribers).clear();
    }

    fn broadcast(&self, contract: Option<&ContractAddress>, event: SubscriptionEvent) {
        let mut subscribers = lock(&self.subscribers);
        subscribers.retain(|(addr, tx)| {
            if contract.map_or(true, |c| c == addr) {
                tx.unbounded_send(Ok(event.clone())).is_ok()
            } else {
                !tx.is_closed()
            }
        });
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl ChainSource for MockChainSource {
    async fn get_logs(
        &self,
        contract: &ContractAddress,
        from_block: BlockNumber,
        to_block: BlockNumber,
    ) -> Result<Vec<RawLog>, ChainSourceError> {
        lock(&self.requested_ranges).push((from_block, to_block));
        if let Some(err) = lock(&self.get_logs_failures).pop_front() {
            return Err(err);
        }

        let mut logs: Vec<RawLog> = lock(&self.logs)
            .iter()
            .filter(|l| {
                &l.contract_address == contract
                    && l.block_number >= from_block
                    && l.block_number <= to_block
            })
            .cloned()
            .collect();
        sort_logs_deterministic(&mut logs);
        Ok(logs)
    }

    async fn subscribe_logs(&self, contract: &ContractAddress) -> Result<LogStream, ChainSourceError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded();
        lock(&self.subscribers).push((contract.clone(), tx));
        Ok(rx.boxed())
    }

    async fn get_chain_head(&self) -> Result<BlockNumber, ChainSourceError> {
        Ok(self.head.load(Ordering::SeqCst))
    }
}
