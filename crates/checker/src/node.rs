//! # Monitored Nodes
//!
//! A [`Node`] is one backend registered behind the load balancer. Nodes are
//! built once from the discovered server groups and stay immutable for the
//! life of the loop; the server key is their identity everywhere else.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{RpcError, StoreError};

// ════════════════════════════════════════════════════════════════════════════
// NODE
// ════════════════════════════════════════════════════════════════════════════

/// One backend RPC node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Stable identity, the server group name in the store.
    pub server_key: String,
    /// RPC base URL.
    pub url: String,
    /// Weight declared in the store at discovery time, if parseable.
    pub weight: Option<u64>,
    /// Timeout applied to every call against this node.
    pub request_timeout: Duration,
}

impl Node {
    pub fn new(server_key: impl Into<String>, url: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            server_key: server_key.into(),
            url: url.into(),
            weight: None,
            request_timeout,
        }
    }

    /// Builds a node from one discovered server group (`field -> value`).
    ///
    /// Returns `None` when the group carries no `url`.
    pub fn from_server_params(
        server_key: &str,
        params: &BTreeMap<String, String>,
        request_timeout: Duration,
    ) -> Option<Self> {
        let url = params.get("url").map(|u| u.trim()).filter(|u| !u.is_empty())?;
        Some(Self {
            server_key: server_key.to_string(),
            url: url.trim_end_matches('/').to_string(),
            weight: params.get("weight").and_then(|w| parse_weight(w)),
            request_timeout,
        })
    }

    /// Builds the fleet from the discovered server map, skipping groups
    /// without an endpoint.
    pub fn fleet_from_servers(
        servers: &BTreeMap<String, BTreeMap<String, String>>,
        request_timeout: Duration,
    ) -> Vec<Self> {
        servers
            .iter()
            .filter_map(|(key, params)| {
                let node = Self::from_server_params(key, params, request_timeout);
                if node.is_none() {
                    warn!(server = %key, "server group has no url, skipping");
                }
                node
            })
            .collect()
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.server_key, self.url)
    }
}

/// Parses a stored weight value. Anything that is not an unsigned integer
/// yields `None`, which never equals a target weight.
pub fn parse_weight(raw: &str) -> Option<u64> {
    raw.trim().parse().ok()
}

// ════════════════════════════════════════════════════════════════════════════
// TIMEOUT HELPERS
// ════════════════════════════════════════════════════════════════════════════

/// Races an RPC call against `limit`. Expiry becomes [`RpcError::Timeout`].
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, RpcError>
where
    F: Future<Output = Result<T, RpcError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(RpcError::Timeout(limit.as_millis() as u64)),
    }
}

/// Races a store call against `limit`. Expiry becomes [`StoreError::Timeout`].
pub async fn store_timeout<T, F>(limit: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(limit.as_millis() as u64)),
    }
}
