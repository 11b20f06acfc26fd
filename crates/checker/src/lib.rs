//! # Node Checker
//!
//! Health checker for a fleet of blockchain RPC nodes sitting behind a
//! weighted load balancer. Every tick each node is checked for freshness,
//! for a consistent sample of the platform's user table, and for agreement
//! with the fleet on the last irreversible block. Nodes that fail get
//! weight zero in the balancer's key-value store; healthy nodes get full
//! weight back.
//!
//! ## Modules
//!
//! | Module | Role |
//! |--------|------|
//! | [`config`] | environment configuration |
//! | [`error`] | error types per boundary |
//! | [`node`] | monitored nodes, timeout helpers |
//! | [`rpc`] | chain RPC client seam |
//! | [`store`] | weight store seam |
//! | [`check`] | per-node checks |
//! | [`quorum`] | canonical irreversible block |
//! | [`hysteresis`] | per-node records and weight decisions |
//! | [`runner`] | tick, paced loop, supervisor |

pub mod check;
pub mod config;
pub mod error;
pub mod hysteresis;
pub mod node;
pub mod quorum;
pub mod rpc;
pub mod runner;
pub mod store;

pub use check::{CheckFailure, CheckResult, Checker};
pub use config::{CheckerConfig, ConfigError, EtcdParams};
pub use error::{CheckerError, RpcError, StoreError};
pub use hysteresis::{HysteresisPolicy, NodeLedger, Verdict, WeightAction, WeightTargets};
pub use node::Node;
pub use quorum::{canonical_block, CanonicalBlock};
pub use rpc::{HttpNodeRpc, MockNodeRpc, NodeRpc};
pub use runner::{supervise, Connect, MonitoredNode, Runner, TickReport};
pub use store::{EtcdWeightStore, MemoryWeightStore, WeightStore};
