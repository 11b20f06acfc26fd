//! # Weight Store Collaborator
//!
//! The load balancer reads its backends from a key-value store:
//!
//! ```text
//! <prefix><server_key>/url     = http://10.0.0.1:8888
//! <prefix><server_key>/weight  = 100
//! ```
//!
//! [`WeightStore`] discovers the registered servers and reads/writes their
//! weights. [`EtcdWeightStore`] talks to the etcd v3 JSON gateway,
//! [`MemoryWeightStore`] keeps everything in a map for tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use parking_lot::{Mutex, RwLock};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::EtcdParams;
use crate::error::StoreError;
use crate::node::Node;

/// Discovered servers: `server_key -> (field -> value)`.
pub type ServerMap = BTreeMap<String, BTreeMap<String, String>>;

/// Group name that never denotes a real server.
const UNDEFINED_GROUP: &str = "undefined";

const MAX_ERROR_BODY: usize = 512;

// ════════════════════════════════════════════════════════════════════════════
// WEIGHT STORE TRAIT
// ════════════════════════════════════════════════════════════════════════════

/// Access to the load balancer's backend registry.
#[async_trait]
pub trait WeightStore: Send + Sync {
    /// All servers registered under the configured prefix.
    async fn get_servers(&self) -> Result<ServerMap, StoreError>;

    /// Raw stored weight of `node`, `None` when the key is absent.
    async fn get_weight(&self, node: &Node) -> Result<Option<String>, StoreError>;

    /// Overwrites the weight of `node`.
    async fn set_weight(&self, node: &Node, weight: u64) -> Result<(), StoreError>;
}

/// Key holding the weight of `server_key`.
pub fn weight_key(prefix: &str, server_key: &str) -> String {
    format!("{prefix}{server_key}/weight")
}

/// Groups flat `key -> value` entries by the second-to-last path segment
/// of the key, naming each field after the last segment.
///
/// Keys with fewer than two segments and groups named `undefined` are
/// dropped.
pub fn group_servers<I>(entries: I) -> ServerMap
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut servers = ServerMap::new();
    for (key, value) in entries {
        let segments: Vec<&str> = key.split('/').collect();
        let [.., group, field] = segments.as_slice() else {
            continue;
        };
        if *group == UNDEFINED_GROUP {
            continue;
        }
        servers
            .entry((*group).to_string())
            .or_default()
            .insert((*field).to_string(), value);
    }
    servers
}

// ════════════════════════════════════════════════════════════════════════════
// ETCD IMPLEMENTATION
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
struct RangeResponse {
    #[serde(default)]
    kvs: Vec<KeyValue>,
}

#[derive(Debug, Deserialize)]
struct KeyValue {
    key: String,
    #[serde(default)]
    value: String,
}

fn encode(raw: &[u8]) -> String {
    general_purpose::STANDARD.encode(raw)
}

fn decode(encoded: &str) -> Result<String, StoreError> {
    let bytes = general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| StoreError::Decode(format!("base64: {e}")))?;
    String::from_utf8(bytes).map_err(|e| StoreError::Decode(format!("utf-8: {e}")))
}

/// Smallest key greater than every key starting with `prefix`.
fn prefix_range_end(prefix: &str) -> Vec<u8> {
    let mut end = prefix.as_bytes().to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return end;
        }
    }
    // Every byte was 0xff: range over all keys.
    vec![0]
}

/// [`WeightStore`] backed by etcd through its v3 JSON gateway.
///
/// Hosts are tried in order; a host is skipped only on transport failure.
#[derive(Debug, Clone)]
pub struct EtcdWeightStore {
    hosts: Vec<String>,
    prefix: String,
    client: Client,
}

impl EtcdWeightStore {
    pub fn new(params: &EtcdParams, prefix: impl Into<String>, timeout: Duration) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::Transport(format!("client build failed: {e}")))?;
        Ok(Self {
            hosts: params.hosts.clone(),
            prefix: prefix.into(),
            client,
        })
    }

    async fn call<T: DeserializeOwned>(&self, path: &str, body: &Value) -> Result<T, StoreError> {
        let mut last_error = StoreError::Transport("no etcd hosts configured".to_string());

        for host in &self.hosts {
            let url = format!("{host}{path}");
            let response = match self.client.post(&url).json(body).send().await {
                Ok(response) => response,
                Err(e) => {
                    warn!(host = %host, error = %e, "etcd host unreachable");
                    last_error = StoreError::Transport(format!("{host}: {e}"));
                    continue;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let mut body = response.text().await.unwrap_or_default();
                body.truncate(MAX_ERROR_BODY);
                return Err(StoreError::Status {
                    status: status.as_u16(),
                    body,
                });
            }

            let text = response
                .text()
                .await
                .map_err(|e| StoreError::Transport(e.to_string()))?;
            return serde_json::from_str(&text).map_err(|e| StoreError::Decode(e.to_string()));
        }

        Err(last_error)
    }

    async fn range(&self, body: Value) -> Result<Vec<(String, String)>, StoreError> {
        let response: RangeResponse = self.call("/v3/kv/range", &body).await?;
        response
            .kvs
            .iter()
            .map(|kv| Ok((decode(&kv.key)?, decode(&kv.value)?)))
            .collect()
    }
}

#[async_trait]
impl WeightStore for EtcdWeightStore {
    async fn get_servers(&self) -> Result<ServerMap, StoreError> {
        let entries = self
            .range(json!({
                "key": encode(self.prefix.as_bytes()),
                "range_end": encode(&prefix_range_end(&self.prefix)),
            }))
            .await?;
        debug!(prefix = %self.prefix, keys = entries.len(), "fetched server keys");
        Ok(group_servers(entries))
    }

    async fn get_weight(&self, node: &Node) -> Result<Option<String>, StoreError> {
        let key = weight_key(&self.prefix, &node.server_key);
        let entries = self.range(json!({ "key": encode(key.as_bytes()) })).await?;
        Ok(entries.into_iter().next().map(|(_, value)| value))
    }

    async fn set_weight(&self, node: &Node, weight: u64) -> Result<(), StoreError> {
        let key = weight_key(&self.prefix, &node.server_key);
        let _: Value = self
            .call(
                "/v3/kv/put",
                &json!({
                    "key": encode(key.as_bytes()),
                    "value": encode(weight.to_string().as_bytes()),
                }),
            )
            .await?;
        Ok(())
    }
}

// ════════════════════════════════════════════════════════════════════════════
// IN-MEMORY IMPLEMENTATION
// ════════════════════════════════════════════════════════════════════════════

/// [`WeightStore`] over an in-memory map, recording every write.
#[derive(Debug)]
pub struct MemoryWeightStore {
    prefix: String,
    entries: RwLock<BTreeMap<String, String>>,
    writes: Mutex<Vec<(String, u64)>>,
    unavailable: AtomicBool,
}

impl MemoryWeightStore {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            entries: RwLock::new(BTreeMap::new()),
            writes: Mutex::new(Vec::new()),
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn insert(&self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.write().insert(key.into(), value.into());
    }

    /// Registers a server the way the load balancer expects it.
    pub fn register_server(&self, server_key: &str, url: &str, weight: Option<u64>) {
        self.insert(format!("{}{server_key}/url", self.prefix), url);
        if let Some(weight) = weight {
            self.insert(weight_key(&self.prefix, server_key), weight.to_string());
        }
    }

    pub fn weight_of(&self, server_key: &str) -> Option<String> {
        self.entries
            .read()
            .get(&weight_key(&self.prefix, server_key))
            .cloned()
    }

    /// `(server_key, weight)` of every write so far, in order.
    pub fn writes(&self) -> Vec<(String, u64)> {
        self.writes.lock().clone()
    }

    pub fn clear_writes(&self) {
        self.writes.lock().clear();
    }

    /// Makes every call fail with a transport error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Transport("store unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl WeightStore for MemoryWeightStore {
    async fn get_servers(&self) -> Result<ServerMap, StoreError> {
        self.ensure_available()?;
        let entries: Vec<(String, String)> = self
            .entries
            .read()
            .iter()
            .filter(|(key, _)| key.starts_with(&self.prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(group_servers(entries))
    }

    async fn get_weight(&self, node: &Node) -> Result<Option<String>, StoreError> {
        self.ensure_available()?;
        Ok(self.weight_of(&node.server_key))
    }

    async fn set_weight(&self, node: &Node, weight: u64) -> Result<(), StoreError> {
        self.ensure_available()?;
        self.insert(weight_key(&self.prefix, &node.server_key), weight.to_string());
        self.writes.lock().push((node.server_key.clone(), weight));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PREFIX: &str = "/traefik/backends/backend2/servers/";

    #[test]
    fn test_group_servers_by_second_to_last_segment() {
        let entries = vec![
            (format!("{PREFIX}server1/url"), "http://a:8888".to_string()),
            (format!("{PREFIX}server1/weight"), "100".to_string()),
            (format!("{PREFIX}server2/url"), "http://b:8888".to_string()),
            (format!("{PREFIX}undefined/url"), "http://ghost".to_string()),
            ("lonely".to_string(), "x".to_string()),
        ];
        let servers = group_servers(entries);

        assert_eq!(servers.len(), 2);
        assert_eq!(servers["server1"]["url"], "http://a:8888");
        assert_eq!(servers["server1"]["weight"], "100");
        assert_eq!(servers["server2"].len(), 1);
        assert!(!servers.contains_key("undefined"));
    }

    #[test]
    fn test_weight_key_layout() {
        assert_eq!(weight_key(PREFIX, "server7"), format!("{PREFIX}server7/weight"));
    }

    #[test]
    fn test_prefix_range_end() {
        assert_eq!(prefix_range_end("/a/"), b"/a0".to_vec());
        assert_eq!(prefix_range_end("ab\u{7f}"), b"ab\x80".to_vec());
        assert_eq!(prefix_range_end(""), vec![0]);
    }

    #[test]
    fn test_base64_round_trip_of_keys() {
        let encoded = encode(b"/traefik/x/weight");
        assert_eq!(decode(&encoded).expect("decodes"), "/traefik/x/weight");
        assert!(decode("***").is_err());
    }

    #[tokio::test]
    async fn test_memory_store_discovery_and_writes() {
        let store = MemoryWeightStore::new(PREFIX);
        store.register_server("server1", "http://a:8888", Some(100));
        store.register_server("server2", "http://b:8888", None);
        store.insert("/elsewhere/server9/url", "http://c:8888");

        let servers = store.get_servers().await.expect("servers");
        assert_eq!(servers.keys().collect::<Vec<_>>(), vec!["server1", "server2"]);

        let node = Node::new("server2", "http://b:8888", Duration::from_secs(1));
        assert_eq!(store.get_weight(&node).await.expect("read"), None);
        store.set_weight(&node, 0).await.expect("write");
        assert_eq!(store.get_weight(&node).await.expect("read"), Some("0".to_string()));
        assert_eq!(store.writes(), vec![("server2".to_string(), 0)]);

        store.set_unavailable(true);
        assert!(matches!(store.get_servers().await, Err(StoreError::Transport(_))));
    }
}
