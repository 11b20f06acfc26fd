//! # Per-Node Health Checks
//!
//! Three stateless predicates evaluated for every node on every tick:
//!
//! | Check | Input | Fails with |
//! |-------|-------|------------|
//! | freshness | `get_info` | `StaleHead`, `IrreversibleTooFarBehind` |
//! | consistency sample | `get_platform_state` + `get_users` | `ShortPage`, `MissingPlatformState` |
//! | irreversibility match | snapshot + canonical block | `InvalidIrreversibleId`, `IrreversibleBehind`, `IrreversibleAhead` |
//!
//! Network failures and timeouts inside a check become
//! `CheckFailure::NetworkOrTimeout`; nothing escapes a check as an error.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;
use thiserror::Error;

use crate::config::CheckerConfig;
use crate::error::RpcError;
use crate::node::{with_timeout, Node};
use crate::quorum::CanonicalBlock;
use crate::rpc::{ChainInfoSnapshot, NodeRpc, PlatformState, UserRow};

/// Step multiplier of the sampling window. Kept bit-for-bit with the
/// deployed checker; it pushes windows far past realistic table sizes.
/// TODO: confirm with the platform owners whether this should be the page
/// size before changing which rows get sampled.
pub const STEP_WINDOW_MULTIPLIER: i128 = 0xFFFF_FFFF;

// ════════════════════════════════════════════════════════════════════════════
// CHECK FAILURE
// ════════════════════════════════════════════════════════════════════════════

/// Why a single check failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CheckFailure {
    #[error(
        "head block is {lag_ms} ms old, more than {max_ms} ms (head block time {head_block_time}, checked at {checked_at}, request took {request_ms} ms)"
    )]
    StaleHead {
        lag_ms: i64,
        max_ms: u64,
        head_block_time: DateTime<Utc>,
        checked_at: DateTime<Utc>,
        request_ms: u64,
    },

    #[error("head block {head} is more than {max} blocks ahead of irreversible block {irreversible}")]
    IrreversibleTooFarBehind { head: u64, irreversible: u64, max: u64 },

    #[error("table fragment has {actual} rows, expected {expected} (requested from position {position})")]
    ShortPage {
        actual: usize,
        expected: u64,
        position: i128,
    },

    #[error("platform state table is empty")]
    MissingPlatformState,

    #[error("irreversible block id {provided} differs from canonical {expected}")]
    InvalidIrreversibleId { provided: String, expected: String },

    #[error("irreversible block {provided} is behind canonical {canonical}")]
    IrreversibleBehind { provided: u64, canonical: u64 },

    #[error("irreversible block {provided} is ahead of canonical {canonical}")]
    IrreversibleAhead { provided: u64, canonical: u64 },

    #[error("request rejected: {0}")]
    NetworkOrTimeout(RpcError),
}

/// Direction of an irreversible block number disagreement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LagDirection {
    Less,
    Greater,
}

impl CheckFailure {
    /// The node could not be asked at all (network, timeout, empty state).
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::NetworkOrTimeout(_) | Self::MissingPlatformState)
    }

    /// Hard disagreement on the id of an agreed block number.
    pub fn is_invalid_id(&self) -> bool {
        matches!(self, Self::InvalidIrreversibleId { .. })
    }

    /// Tolerable irreversible number disagreement, if this is one.
    pub fn lag_direction(&self) -> Option<LagDirection> {
        match self {
            Self::IrreversibleBehind { .. } => Some(LagDirection::Less),
            Self::IrreversibleAhead { .. } => Some(LagDirection::Greater),
            _ => None,
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// CHECK RESULT
// ════════════════════════════════════════════════════════════════════════════

/// Outcome of one check: the payload later stages need, or the failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckResult<T> {
    Passed(T),
    Failed(CheckFailure),
}

impl<T> CheckResult<T> {
    pub fn is_passed(&self) -> bool {
        matches!(self, Self::Passed(_))
    }

    pub fn is_failed(&self) -> bool {
        !self.is_passed()
    }

    pub fn passed(&self) -> Option<&T> {
        match self {
            Self::Passed(value) => Some(value),
            Self::Failed(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&CheckFailure> {
        match self {
            Self::Passed(_) => None,
            Self::Failed(failure) => Some(failure),
        }
    }

    /// Human-readable reason, present only on failure.
    pub fn reason(&self) -> Option<String> {
        self.failure().map(|f| f.to_string())
    }
}

/// Payload of a passed consistency check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSample {
    pub state: PlatformState,
    pub position: i128,
    pub rows: Vec<UserRow>,
}

// ════════════════════════════════════════════════════════════════════════════
// SAMPLING WINDOW
// ════════════════════════════════════════════════════════════════════════════

/// Start position of the consistency sample.
///
/// While an update round is running and has already touched more than one
/// page, the offset is drawn from the updated accounts; otherwise from the
/// accounts not yet updated. The offset is aligned down to a page boundary
/// and shifted by the step window.
pub fn sampling_position<R: Rng + ?Sized>(state: &PlatformState, page_size: u64, rng: &mut R) -> i128 {
    let page = i128::from(page_size.max(1));
    let total = i128::from(state.total_user_count);
    let updated = i128::from(state.round_updated_account_count);
    let step = i128::from(state.step_number);

    let (range, step_modifier) = if state.updating && updated > page {
        (updated - page, step)
    } else {
        (total - updated - page, step - 1)
    };

    let offset = if range > 0 { rng.gen_range(0..range) } else { 0 };
    let window_modifier = if state.updating {
        step_modifier
    } else {
        step_modifier - 1
    };

    (offset.max(0) / page) * page + STEP_WINDOW_MULTIPLIER * window_modifier + 1
}

// ════════════════════════════════════════════════════════════════════════════
// CHECKER
// ════════════════════════════════════════════════════════════════════════════

/// Evaluates the per-node checks with the configured bounds.
#[derive(Debug, Clone)]
pub struct Checker {
    max_head_block_lag: Duration,
    max_irreversible_block_lag: u64,
    table_limit: u64,
    test_platform: String,
}

impl Checker {
    pub fn new(
        max_head_block_lag: Duration,
        max_irreversible_block_lag: u64,
        table_limit: u64,
        test_platform: impl Into<String>,
    ) -> Self {
        Self {
            max_head_block_lag,
            max_irreversible_block_lag,
            table_limit,
            test_platform: test_platform.into(),
        }
    }

    pub fn from_config(config: &CheckerConfig) -> Self {
        Self::new(
            config.max_head_block_lag,
            config.max_irreversible_block_lag,
            config.table_limit,
            config.test_platform.clone(),
        )
    }

    /// Freshness check against the node.
    pub async fn check_info(&self, node: &Node, rpc: &dyn NodeRpc) -> CheckResult<ChainInfoSnapshot> {
        let started_at = Utc::now();
        let clock = Instant::now();

        match with_timeout(node.request_timeout, rpc.get_info()).await {
            Ok(info) => {
                let request_ms = clock.elapsed().as_millis() as u64;
                self.evaluate_info(info, started_at, request_ms)
            }
            Err(err) => CheckResult::Failed(CheckFailure::NetworkOrTimeout(err)),
        }
    }

    /// Freshness rule applied to a fetched snapshot. `request_ms` only
    /// feeds the failure message.
    pub fn evaluate_info(
        &self,
        info: ChainInfoSnapshot,
        started_at: DateTime<Utc>,
        request_ms: u64,
    ) -> CheckResult<ChainInfoSnapshot> {
        let max_ms = self.max_head_block_lag.as_millis() as u64;
        let lag_ms = (started_at - info.head_block_time).num_milliseconds();

        if lag_ms > 0 && lag_ms as u64 > max_ms {
            return CheckResult::Failed(CheckFailure::StaleHead {
                lag_ms,
                max_ms,
                head_block_time: info.head_block_time,
                checked_at: started_at,
                request_ms,
            });
        }

        let distance = info
            .head_block_num
            .saturating_sub(info.last_irreversible_block_num);
        if distance > self.max_irreversible_block_lag {
            return CheckResult::Failed(CheckFailure::IrreversibleTooFarBehind {
                head: info.head_block_num,
                irreversible: info.last_irreversible_block_num,
                max: self.max_irreversible_block_lag,
            });
        }

        CheckResult::Passed(info)
    }

    /// Consistency sample against the node's user table.
    pub async fn check_users(&self, node: &Node, rpc: &dyn NodeRpc) -> CheckResult<TableSample> {
        let timeout = node.request_timeout;

        let state = match with_timeout(timeout, rpc.get_platform_state(&self.test_platform)).await {
            Ok(Some(state)) => state,
            Ok(None) => return CheckResult::Failed(CheckFailure::MissingPlatformState),
            Err(err) => return CheckResult::Failed(CheckFailure::NetworkOrTimeout(err)),
        };

        let position = {
            let mut rng = rand::thread_rng();
            sampling_position(&state, self.table_limit, &mut rng)
        };

        let rows = match with_timeout(
            timeout,
            rpc.get_users(&self.test_platform, position, self.table_limit),
        )
        .await
        {
            Ok(rows) => rows,
            Err(err) => return CheckResult::Failed(CheckFailure::NetworkOrTimeout(err)),
        };

        if rows.len() as u64 != self.table_limit {
            return CheckResult::Failed(CheckFailure::ShortPage {
                actual: rows.len(),
                expected: self.table_limit,
                position,
            });
        }

        CheckResult::Passed(TableSample {
            state,
            position,
            rows,
        })
    }

    /// Compares a node's irreversible block with the tick's canonical one.
    pub fn check_irreversible(&self, info: &ChainInfoSnapshot, canonical: &CanonicalBlock) -> CheckResult<()> {
        let provided = info.last_irreversible_block_num;

        if provided == canonical.num {
            if info.last_irreversible_block_id == canonical.id {
                CheckResult::Passed(())
            } else {
                CheckResult::Failed(CheckFailure::InvalidIrreversibleId {
                    provided: info.last_irreversible_block_id.clone(),
                    expected: canonical.id.clone(),
                })
            }
        } else if provided < canonical.num {
            CheckResult::Failed(CheckFailure::IrreversibleBehind {
                provided,
                canonical: canonical.num,
            })
        } else {
            CheckResult::Failed(CheckFailure::IrreversibleAhead {
                provided,
                canonical: canonical.num,
            })
        }
    }
}
