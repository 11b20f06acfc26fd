//! # Error Types
//!
//! One error enum per boundary:
//!
//! | Boundary | Type | Crosses into |
//! |----------|------|--------------|
//! | Node RPC | [`RpcError`] | check failures (never further) |
//! | Weight store | [`StoreError`] | tick errors / bootstrap errors |
//! | Configuration | [`ConfigError`](crate::config::ConfigError) | startup only |
//! | Control loop | [`CheckerError`] | tick log / supervisor restart |
//!
//! Check-level outcomes are not errors; see [`crate::check::CheckFailure`].

use thiserror::Error;

// ════════════════════════════════════════════════════════════════════════════
// RPC ERROR
// ════════════════════════════════════════════════════════════════════════════

/// Failure of a single call against a node's RPC endpoint.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    /// The call did not complete within the per-call timeout.
    #[error("timeout exceeded after {0} ms")]
    Timeout(u64),

    /// Connection, TLS or I/O failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The node answered with a non-success HTTP status.
    #[error("unexpected status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, possibly truncated.
        body: String,
    },

    /// The response body could not be decoded.
    #[error("malformed response: {0}")]
    Decode(String),
}

// ════════════════════════════════════════════════════════════════════════════
// STORE ERROR
// ════════════════════════════════════════════════════════════════════════════

/// Failure of a call against the key-value weight store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The call did not complete within the per-call timeout.
    #[error("store timeout exceeded after {0} ms")]
    Timeout(u64),

    /// No configured host could be reached.
    #[error("store transport error: {0}")]
    Transport(String),

    /// The store answered with a non-success HTTP status.
    #[error("store returned status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, possibly truncated.
        body: String,
    },

    /// The store response could not be decoded.
    #[error("malformed store response: {0}")]
    Decode(String),
}

// ════════════════════════════════════════════════════════════════════════════
// CHECKER ERROR
// ════════════════════════════════════════════════════════════════════════════

/// Errors that escape a check boundary.
///
/// A tick that returns one of these is logged and the loop moves on;
/// an error escaping bootstrap makes the supervisor restart the loop.
#[derive(Debug, Error)]
pub enum CheckerError {
    /// A store call outside the per-node weight phase failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Fleet discovery returned no usable server.
    #[error("no servers found under prefix {0}")]
    EmptyFleet(String),

    /// One or more weight reads/writes failed during a tick.
    #[error("weight store failed for {} node(s): {}", .0.len(), summarize(.0))]
    WeightStore(Vec<(String, StoreError)>),

    /// Anything else that aborted a tick or the loop.
    #[error("unexpected tick error: {0}")]
    UnexpectedTick(String),
}

fn summarize(failures: &[(String, StoreError)]) -> String {
    failures
        .iter()
        .map(|(server, err)| format!("{server}: {err}"))
        .collect::<Vec<_>>()
        .join("; ")
}
