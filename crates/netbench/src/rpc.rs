//! JSON-RPC over HTTP transport for chain endpoints.
//!
//! [`RpcClient`] serves as a monitoring [`DataSource`]; [`RpcTarget`] maps
//! named operations to JSON-RPC calls for the load generator.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use url::Url;

use crate::error::{ConfigError, OperationError, SourceError};
use crate::source::DataSource;
use crate::target::{OperationOutcome, Target};
use crate::types::BlockInfo;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const RECEIPT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const RECEIPT_MAX_POLLS: u32 = 240;

/// Minimal async JSON-RPC client bound to one endpoint.
#[derive(Debug, Clone)]
pub struct RpcClient {
    http: reqwest::Client,
    name: String,
    url: Url,
    timeout: Duration,
}

impl RpcClient {
    pub fn new(name: impl Into<String>, url: Url) -> Result<Self, ConfigError> {
        Self::with_timeout(name, url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(
        name: impl Into<String>,
        url: Url,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            name: name.into(),
            url,
            timeout,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Single attempt at an RPC call, no retry. Failover is the caller's job.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, SourceError> {
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        });

        let response = self
            .http
            .post(self.url.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(method, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Connection {
                url: self.url.to_string(),
                cause: format!("HTTP {status}"),
            });
        }

        let mut payload: Value = response
            .json()
            .await
            .map_err(|e| self.transport_error(method, e))?;

        if let Some(error) = payload.get("error") {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or(-1);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            return Err(SourceError::JsonRpc {
                method: method.into(),
                code,
                message,
            });
        }

        payload
            .get_mut("result")
            .map(Value::take)
            .ok_or_else(|| SourceError::MissingField {
                method: method.into(),
                field: "result".into(),
            })
    }

    fn transport_error(&self, method: &str, error: reqwest::Error) -> SourceError {
        if error.is_timeout() {
            SourceError::Timeout {
                method: method.into(),
            }
        } else if error.is_decode() {
            SourceError::Malformed {
                method: method.into(),
                field: "response_body".into(),
                value: error.to_string(),
            }
        } else {
            SourceError::Connection {
                url: self.url.to_string(),
                cause: error.to_string(),
            }
        }
    }
}

#[async_trait::async_trait]
impl DataSource for RpcClient {
    fn id(&self) -> &str {
        &self.name
    }

    async fn current_height(&self) -> Result<u64, SourceError> {
        let result = self.call("eth_blockNumber", json!([])).await?;
        parse_quantity("eth_blockNumber", "result", &result)
    }

    async fn block_at(&self, height: u64) -> Result<BlockInfo, SourceError> {
        let method = "eth_getBlockByNumber";
        let block = self
            .call(method, json!([format!("0x{height:x}"), false]))
            .await?;
        if block.is_null() {
            return Err(SourceError::BlockNotFound(height));
        }
        parse_block(method, &block)
    }

    async fn current_unit_price(&self) -> Result<Option<u64>, SourceError> {
        let result = self.call("eth_gasPrice", json!([])).await?;
        parse_quantity("eth_gasPrice", "result", &result).map(Some)
    }
}

/// How one named operation is issued against a target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationCall {
    pub method: String,
    #[serde(default = "empty_params")]
    pub params: Value,
    /// Treat the result as a transaction hash and wait for its receipt.
    #[serde(default)]
    pub await_receipt: bool,
}

fn empty_params() -> Value {
    json!([])
}

pub struct RpcTarget {
    client: RpcClient,
    operations: BTreeMap<String, OperationCall>,
}

impl RpcTarget {
    pub fn new(client: RpcClient, operations: BTreeMap<String, OperationCall>) -> Self {
        Self { client, operations }
    }

    async fn wait_for_receipt(&self, tx_hash: &str) -> Result<OperationOutcome, OperationError> {
        let method = "eth_getTransactionReceipt";
        for _ in 0..RECEIPT_MAX_POLLS {
            let receipt = self
                .client
                .call(method, json!([tx_hash]))
                .await
                .map_err(|e| operation_error(e, self.client.timeout))?;
            if !receipt.is_null() {
                return parse_receipt(method, &receipt);
            }
            tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
        }
        Err(OperationError::Timeout(
            (RECEIPT_POLL_INTERVAL * RECEIPT_MAX_POLLS).as_millis() as u64,
        ))
    }
}

#[async_trait::async_trait]
impl Target for RpcTarget {
    fn id(&self) -> &str {
        &self.client.name
    }

    fn operations(&self) -> Vec<String> {
        self.operations.keys().cloned().collect()
    }

    async fn execute(&self, operation: &str) -> Result<OperationOutcome, OperationError> {
        let call = self
            .operations
            .get(operation)
            .ok_or_else(|| OperationError::Unsupported(operation.to_owned()))?;

        let result = self
            .client
            .call(&call.method, call.params.clone())
            .await
            .map_err(|e| operation_error(e, self.client.timeout))?;

        if !call.await_receipt {
            return Ok(OperationOutcome::default());
        }
        let tx_hash = result.as_str().ok_or_else(|| {
            OperationError::Transport(format!("{} did not return a transaction hash", call.method))
        })?;
        self.wait_for_receipt(tx_hash).await
    }
}

fn operation_error(error: SourceError, timeout: Duration) -> OperationError {
    match error {
        SourceError::Timeout { .. } => OperationError::Timeout(timeout.as_millis() as u64),
        SourceError::JsonRpc { message, .. } => OperationError::Rejected(message),
        other => OperationError::Transport(other.to_string()),
    }
}

// --- Parsing helpers ---

fn parse_quantity(method: &str, field: &str, value: &Value) -> Result<u64, SourceError> {
    let malformed = || SourceError::Malformed {
        method: method.into(),
        field: field.into(),
        value: value.to_string(),
    };
    let s = value.as_str().ok_or_else(malformed)?;
    let digits = s.strip_prefix("0x").ok_or_else(malformed)?;
    u64::from_str_radix(digits, 16).map_err(|_| malformed())
}

fn field<'a>(method: &str, object: &'a Value, name: &str) -> Result<&'a Value, SourceError> {
    object.get(name).ok_or_else(|| SourceError::MissingField {
        method: method.into(),
        field: name.into(),
    })
}

fn parse_block(method: &str, block: &Value) -> Result<BlockInfo, SourceError> {
    let number = parse_quantity(method, "number", field(method, block, "number")?)?;
    let timestamp = parse_quantity(method, "timestamp", field(method, block, "timestamp")?)?;
    let transactions = field(method, block, "transactions")?;
    let tx_count = transactions
        .as_array()
        .map(|txs| txs.len() as u64)
        .ok_or_else(|| SourceError::Malformed {
            method: method.into(),
            field: "transactions".into(),
            value: transactions.to_string(),
        })?;
    Ok(BlockInfo {
        number,
        timestamp,
        tx_count,
    })
}

fn parse_receipt(method: &str, receipt: &Value) -> Result<OperationOutcome, OperationError> {
    let quantity = |name: &str| -> Result<u64, OperationError> {
        let value = field(method, receipt, name).map_err(|e| OperationError::Transport(e.to_string()))?;
        parse_quantity(method, name, value).map_err(|e| OperationError::Transport(e.to_string()))
    };

    if quantity("status")? == 0 {
        return Err(OperationError::Reverted);
    }
    Ok(OperationOutcome {
        cost: quantity("gasUsed")?,
        unit_price: receipt
            .get("effectiveGasPrice")
            .and_then(|v| parse_quantity(method, "effectiveGasPrice", v).ok()),
        sequence_id: quantity("blockNumber").ok(),
    })
}
