//! JSON-RPC chain source (`eth_getLogs` / `eth_blockNumber` compatible nodes).

use super::{ChainSource, ChainSourceError, LogStream, SubscriptionEvent};
use crate::domain::{BlockNumber, ContractAddress, RawLog, TxHash};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::Client;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Chain source talking JSON-RPC over HTTP.
///
/// Live subscriptions are implemented by polling the head every `poll_interval`;
/// every poll yields a `NewHead`, which the listener uses as its heartbeat.
#[derive(Debug, Clone)]
pub struct JsonRpcChainSource {
    client: Client,
    url: String,
    poll_interval: Duration,
    next_id: Arc<AtomicU64>,
}

impl JsonRpcChainSource {
    /// Create a new source. `request_timeout` bounds every HTTP round trip.
    pub fn new(url: String, request_timeout: Duration, poll_interval: Duration) -> Self {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            url,
            poll_interval,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, ChainSourceError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ChainSourceError::Timeout
                } else {
                    ChainSourceError::NetworkError(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ChainSourceError::HttpError {
                status: status.as_u16(),
                message: status
                    .canonical_reason()
                    .unwrap_or("unexpected status")
                    .to_string(),
            });
        }

        let body = response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| ChainSourceError::ParseError(e.to_string()))?;

        if let Some(error) = body.get("error") {
            return Err(ChainSourceError::RpcError {
                code: error.get("code").and_then(|c| c.as_i64()).unwrap_or(0),
                message: error
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("unknown")
                    .to_string(),
            });
        }

        body.get("result")
            .cloned()
            .ok_or_else(|| ChainSourceError::ParseError("Missing result field".to_string()))
    }
}

#[async_trait]
impl ChainSource for JsonRpcChainSource {
    async fn get_logs(
        &self,
        contract: &ContractAddress,
        from_block: BlockNumber,
        to_block: BlockNumber,
    ) -> Result<Vec<RawLog>, ChainSourceError> {
        debug!(
            contract = %contract,
            from_block,
            to_block,
            "Fetching logs"
        );

        let result = self
            .call(
                "eth_getLogs",
                serde_json::json!([{
                    "address": contract.as_str(),
                    "fromBlock": format!("0x{:x}", from_block),
                    "toBlock": format!("0x{:x}", to_block),
                }]),
            )
            .await?;

        let logs_json = result
            .as_array()
            .ok_or_else(|| ChainSourceError::ParseError("Expected array response".to_string()))?;

        let mut logs = logs_json
            .iter()
            .map(parse_log)
            .collect::<Result<Vec<_>, _>>()?;
        crate::domain::sort_logs_deterministic(&mut logs);
        Ok(logs)
    }

    async fn subscribe_logs(&self, contract: &ContractAddress) -> Result<LogStream, ChainSourceError> {
        let start = self.get_chain_head().await?;
        let source = self.clone();
        let contract = contract.clone();
        let interval = self.poll_interval;

        let polled = stream::unfold(
            (source, contract, start),
            move |(source, contract, last)| async move {
                tokio::time::sleep(interval).await;
                let (items, next) = match source.get_chain_head().await {
                    Ok(head) if head > last => {
                        match source.get_logs(&contract, last + 1, head).await {
                            Ok(logs) => {
                                let mut items: Vec<_> = logs
                                    .into_iter()
                                    .map(|l| Ok(SubscriptionEvent::Log(l)))
                                    .collect();
                                items.push(Ok(SubscriptionEvent::NewHead(head)));
                                (items, head)
                            }
                            Err(e) => (vec![Err(e)], last),
                        }
                    }
                    Ok(head) => (vec![Ok(SubscriptionEvent::NewHead(head))], last),
                    Err(e) => (vec![Err(e)], last),
                };
                Some((items, (source, contract, next)))
            },
        )
        .flat_map(stream::iter);

        Ok(polled.boxed())
    }

    async fn get_chain_head(&self) -> Result<BlockNumber, ChainSourceError> {
        let result = self.call("eth_blockNumber", serde_json::json!([])).await?;
        let hex = result
            .as_str()
            .ok_or_else(|| ChainSourceError::ParseError("Expected hex block number".to_string()))?;
        parse_quantity(hex)
    }
}

fn parse_quantity(s: &str) -> Result<u64, ChainSourceError> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(digits, 16)
        .map_err(|e| ChainSourceError::ParseError(format!("Invalid quantity {}: {}", s, e)))
}

fn str_field<'a>(log_json: &'a serde_json::Value, name: &str) -> Result<&'a str, ChainSourceError> {
    log_json
        .get(name)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ChainSourceError::ParseError(format!("Missing {} field", name)))
}

fn parse_log(log_json: &serde_json::Value) -> Result<RawLog, ChainSourceError> {
    let tx_hash = str_field(log_json, "transactionHash")?;
    let tx_index = parse_quantity(str_field(log_json, "transactionIndex")?)?;
    let log_index = parse_quantity(str_field(log_json, "logIndex")?)?;
    let block_number = parse_quantity(str_field(log_json, "blockNumber")?)?;
    let address = str_field(log_json, "address")?;

    let topic = log_json
        .get("topics")
        .and_then(|t| t.as_array())
        .and_then(|t| t.first())
        .and_then(|t| t.as_str())
        .ok_or_else(|| ChainSourceError::ParseError("Missing topics[0]".to_string()))?;

    let data_hex = str_field(log_json, "data")?;
    let data = hex::decode(data_hex.strip_prefix("0x").unwrap_or(data_hex))
        .map_err(|e| ChainSourceError::ParseError(format!("Invalid data: {}", e)))?;

    Ok(RawLog {
        tx_hash: TxHash::new(tx_hash),
        tx_index,
        log_index,
        block_number,
        contract_address: ContractAddress::new(address),
        topic: topic.to_ascii_lowercase(),
        data,
    })
}
