//! # Node RPC Collaborator
//!
//! The checks only need three calls against a node:
//!
//! ```text
//! get_info()                             → ChainInfoSnapshot
//! get_platform_state(platform)           → Option<PlatformState>
//! get_users(platform, position, limit)   → rows (len ≤ limit)
//! ```
//!
//! [`NodeRpc`] is the seam. [`HttpNodeRpc`] speaks the chain HTTP API,
//! [`MockNodeRpc`] serves canned answers to tests.
//!
//! Chain APIs are loose about JSON types: 64-bit counters may arrive as
//! strings and table booleans as `0`/`1`. Decoding accepts both.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use parking_lot::Mutex;
use reqwest::Client;
use serde::de::{self, DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::RpcError;

/// Upper bound on how much of an error body is kept in an error.
const MAX_ERROR_BODY: usize = 512;

// ════════════════════════════════════════════════════════════════════════════
// WIRE TYPES
// ════════════════════════════════════════════════════════════════════════════

/// A node's view of the chain at one moment.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChainInfoSnapshot {
    #[serde(deserialize_with = "de_u64")]
    pub head_block_num: u64,
    #[serde(deserialize_with = "de_block_time")]
    pub head_block_time: DateTime<Utc>,
    #[serde(deserialize_with = "de_u64")]
    pub last_irreversible_block_num: u64,
    pub last_irreversible_block_id: String,
}

/// Update-round bookkeeping of the sampled platform.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PlatformState {
    #[serde(deserialize_with = "de_u64")]
    pub total_user_count: u64,
    #[serde(deserialize_with = "de_u64")]
    pub round_updated_account_count: u64,
    #[serde(deserialize_with = "de_u64")]
    pub step_number: u64,
    #[serde(deserialize_with = "de_flag")]
    pub updating: bool,
}

/// One row of the sampled user table. Its content is never inspected.
pub type UserRow = Value;

#[derive(Debug, Deserialize)]
struct TableRows<T> {
    #[serde(default = "Vec::new")]
    rows: Vec<T>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LooseNumber {
    Number(u64),
    Text(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LooseFlag {
    Flag(bool),
    Number(u64),
    Text(String),
}

fn de_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    match LooseNumber::deserialize(deserializer)? {
        LooseNumber::Number(n) => Ok(n),
        LooseNumber::Text(s) => s.trim().parse().map_err(de::Error::custom),
    }
}

fn de_flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    match LooseFlag::deserialize(deserializer)? {
        LooseFlag::Flag(b) => Ok(b),
        LooseFlag::Number(n) => Ok(n != 0),
        LooseFlag::Text(s) => match s.trim() {
            "1" | "true" => Ok(true),
            "0" | "false" => Ok(false),
            other => Err(de::Error::custom(format!("invalid flag {other:?}"))),
        },
    }
}

fn de_block_time<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
    let raw = String::deserialize(deserializer)?;
    parse_block_time(&raw).ok_or_else(|| de::Error::custom(format!("invalid block time {raw:?}")))
}

/// Parses a block timestamp. Chain APIs omit the zone suffix; the value is UTC.
pub fn parse_block_time(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

// ════════════════════════════════════════════════════════════════════════════
// NODE RPC TRAIT
// ════════════════════════════════════════════════════════════════════════════

/// Calls the checks make against one node.
///
/// Implementations report failures as [`RpcError`] and never panic.
/// Timeouts are applied by the caller.
#[async_trait]
pub trait NodeRpc: Send + Sync {
    /// Fetches head and last irreversible block information.
    async fn get_info(&self) -> Result<ChainInfoSnapshot, RpcError>;

    /// Fetches the platform state row, `None` when the table is empty.
    async fn get_platform_state(&self, platform: &str) -> Result<Option<PlatformState>, RpcError>;

    /// Fetches up to `limit` user rows starting at `position`
    /// (negative positions read from the start of the index).
    async fn get_users(&self, platform: &str, position: i128, limit: u64) -> Result<Vec<UserRow>, RpcError>;
}

// ════════════════════════════════════════════════════════════════════════════
// HTTP IMPLEMENTATION
// ════════════════════════════════════════════════════════════════════════════

/// [`NodeRpc`] over the chain HTTP API.
#[derive(Debug, Clone)]
pub struct HttpNodeRpc {
    base: String,
    client: Client,
}

impl HttpNodeRpc {
    /// Creates a client for the node at `base` over a shared connection
    /// pool. No network call is made.
    pub fn with_client(base: impl Into<String>, client: Client) -> Self {
        let base = base.into().trim_end_matches('/').to_string();
        Self { base, client }
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: &Value) -> Result<T, RpcError> {
        let url = format!("{}{}", self.base, path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            body.truncate(MAX_ERROR_BODY);
            return Err(RpcError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let text = response
            .text()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        serde_json::from_str(&text).map_err(|e| RpcError::Decode(e.to_string()))
    }
}

#[async_trait]
impl NodeRpc for HttpNodeRpc {
    async fn get_info(&self) -> Result<ChainInfoSnapshot, RpcError> {
        self.post("/v1/chain/get_info", &json!({})).await
    }

    async fn get_platform_state(&self, platform: &str) -> Result<Option<PlatformState>, RpcError> {
        let body = json!({
            "json": true,
            "code": platform,
            "scope": platform,
            "table": "state",
            "limit": 1,
        });
        let table: TableRows<PlatformState> = self.post("/v1/chain/get_table_rows", &body).await?;
        Ok(table.rows.into_iter().next())
    }

    async fn get_users(&self, platform: &str, position: i128, limit: u64) -> Result<Vec<UserRow>, RpcError> {
        let body = json!({
            "json": true,
            "code": platform,
            "scope": platform,
            "table": "pusers",
            "index_position": 2,
            "key_type": "i64",
            "lower_bound": position.max(0).to_string(),
            "limit": limit,
        });
        let table: TableRows<UserRow> = self.post("/v1/chain/get_table_rows", &body).await?;
        Ok(table.rows)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// MOCK IMPLEMENTATION
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
struct MockState {
    head_block_num: u64,
    head_lag: Duration,
    irreversible_num: u64,
    irreversible_id: String,
    info_error: Option<RpcError>,
    platform: Result<Option<PlatformState>, RpcError>,
    page_len: Option<usize>,
    delay: Duration,
    last_position: Option<i128>,
}

/// Scriptable [`NodeRpc`] for tests.
///
/// Starts healthy: a fresh head block, a populated platform state and full
/// pages. Each setter changes one aspect of the next answers.
#[derive(Debug)]
pub struct MockNodeRpc {
    state: Mutex<MockState>,
    info_calls: AtomicU64,
}

impl MockNodeRpc {
    /// A node reporting `(irreversible_num, irreversible_id)` with a head
    /// ten blocks ahead.
    pub fn healthy(irreversible_num: u64, irreversible_id: &str) -> Self {
        Self {
            state: Mutex::new(MockState {
                head_block_num: irreversible_num + 10,
                head_lag: Duration::ZERO,
                irreversible_num,
                irreversible_id: irreversible_id.to_string(),
                info_error: None,
                platform: Ok(Some(PlatformState {
                    total_user_count: 10_000,
                    round_updated_account_count: 0,
                    step_number: 1,
                    updating: false,
                })),
                page_len: None,
                delay: Duration::ZERO,
                last_position: None,
            }),
            info_calls: AtomicU64::new(0),
        }
    }

    pub fn set_irreversible(&self, num: u64, id: &str) {
        let mut state = self.state.lock();
        state.irreversible_num = num;
        state.irreversible_id = id.to_string();
        state.head_block_num = state.head_block_num.max(num);
    }

    /// Age of the reported head block relative to the moment of the call.
    pub fn set_head_lag(&self, lag: Duration) {
        self.state.lock().head_lag = lag;
    }

    pub fn set_info_error(&self, error: Option<RpcError>) {
        self.state.lock().info_error = error;
    }

    pub fn set_platform_state(&self, platform: Result<Option<PlatformState>, RpcError>) {
        self.state.lock().platform = platform;
    }

    /// Fixed page length; `None` returns full pages.
    pub fn set_page_len(&self, len: Option<usize>) {
        self.state.lock().page_len = len;
    }

    /// Delay applied before answering any call.
    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().delay = delay;
    }

    pub fn info_calls(&self) -> u64 {
        self.info_calls.load(Ordering::SeqCst)
    }

    pub fn last_users_position(&self) -> Option<i128> {
        self.state.lock().last_position
    }

    async fn pause(&self) {
        let delay = self.state.lock().delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl NodeRpc for MockNodeRpc {
    async fn get_info(&self) -> Result<ChainInfoSnapshot, RpcError> {
        self.info_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;

        let state = self.state.lock().clone();
        if let Some(err) = state.info_error {
            return Err(err);
        }
        let lag = chrono::Duration::from_std(state.head_lag)
            .map_err(|e| RpcError::Decode(e.to_string()))?;
        Ok(ChainInfoSnapshot {
            head_block_num: state.head_block_num,
            head_block_time: Utc::now() - lag,
            last_irreversible_block_num: state.irreversible_num,
            last_irreversible_block_id: state.irreversible_id,
        })
    }

    async fn get_platform_state(&self, _platform: &str) -> Result<Option<PlatformState>, RpcError> {
        self.pause().await;
        self.state.lock().platform.clone()
    }

    async fn get_users(&self, _platform: &str, position: i128, limit: u64) -> Result<Vec<UserRow>, RpcError> {
        self.pause().await;
        let len = {
            let mut state = self.state.lock();
            state.last_position = Some(position);
            state.page_len.unwrap_or(limit as usize)
        };
        Ok((0..len).map(|i| json!({ "id": i })).collect())
    }
}
