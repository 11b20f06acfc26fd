//! # Weight Hysteresis
//!
//! Turns noisy per-tick check results into stable weight decisions.
//!
//! ## Classification (per tick)
//!
//! ```text
//! freshness/consistency failed ──────────────────────────▶ Invalid
//! irreversible id differs ───────────────────────────────▶ Invalid
//! irreversible num differs ──▶ counter += 1 ──▶ > max? ──▶ Invalid
//!                                                  └─────▶ Lagging
//! irreversible block matches ──▶ lag counters = 0 ───────▶ Valid
//! ```
//!
//! ## Weight decision
//!
//! | Verdict | Current weight | Action |
//! |---------|----------------|--------|
//! | Invalid | zero | keep |
//! | Invalid | other | set zero |
//! | Valid | full | keep, records cleared |
//! | Valid | other, recovering from a table failure | count success, set full once the streak exceeds the minimum |
//! | Valid | other | set full |
//!
//! `Lagging` is decided like `Valid` except that its lag counters survive
//! every clear, so the tolerance keeps running down.
//!
//! Records live for the whole process and are keyed by server key. The
//! ledger is owned by the control loop and only touched between the
//! fan-in of one tick and its writes.

use std::collections::HashMap;

use crate::check::{CheckResult, LagDirection};
use crate::config::CheckerConfig;

// ════════════════════════════════════════════════════════════════════════════
// POLICY
// ════════════════════════════════════════════════════════════════════════════

/// Thresholds of the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HysteresisPolicy {
    /// Lag disagreements tolerated before a node is failed.
    pub max_irreversible_lag_steps: u32,
    /// Clean samples a recovering node must exceed before promotion.
    pub min_success_table_steps: u32,
}

impl HysteresisPolicy {
    pub fn from_config(config: &CheckerConfig) -> Self {
        Self {
            max_irreversible_lag_steps: config.max_irreversible_lag_steps,
            min_success_table_steps: config.min_success_table_steps,
        }
    }
}

/// The only two weights the engine ever writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeightTargets {
    pub zero: u64,
    pub full: u64,
}

impl WeightTargets {
    pub fn from_config(config: &CheckerConfig) -> Self {
        Self {
            zero: config.zero_weight,
            full: config.full_weight,
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// RECORDS
// ════════════════════════════════════════════════════════════════════════════

/// Accumulated failure counters of one node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailRecord {
    pub irreversible_less: u32,
    pub irreversible_greater: u32,
    pub invalid_table_size: u32,
    pub invalid_info: u32,
}

/// Clean samples seen while recovering from a table-size failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SuccessRecord {
    pub valid_table_size: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeRecord {
    pub fail: FailRecord,
    pub success: SuccessRecord,
}

impl NodeRecord {
    fn clear(&mut self) {
        *self = Self::default();
    }

    fn clear_keeping_lag(&mut self) {
        *self = Self {
            fail: FailRecord {
                irreversible_less: self.fail.irreversible_less,
                irreversible_greater: self.fail.irreversible_greater,
                ..FailRecord::default()
            },
            success: SuccessRecord::default(),
        };
    }
}

/// Classification of a node for one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Every check passed.
    Valid,
    /// Irreversible number disagreement still within tolerance; weighted
    /// like a valid node.
    Lagging,
    /// Must receive no traffic.
    Invalid,
}

/// Store write decided for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightAction {
    Keep,
    SetFull,
    SetZero,
}

// ════════════════════════════════════════════════════════════════════════════
// LEDGER
// ════════════════════════════════════════════════════════════════════════════

/// Per-node records for the life of the process.
#[derive(Debug, Clone, Default)]
pub struct NodeLedger {
    records: HashMap<String, NodeRecord>,
}

impl NodeLedger {
    /// Creates one empty record per known node.
    pub fn new<I, S>(server_keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            records: server_keys
                .into_iter()
                .map(|key| (key.into(), NodeRecord::default()))
                .collect(),
        }
    }

    pub fn get(&self, server_key: &str) -> Option<&NodeRecord> {
        self.records.get(server_key)
    }

    fn record_mut(&mut self, server_key: &str) -> &mut NodeRecord {
        self.records.entry(server_key.to_string()).or_default()
    }

    /// Records a freshness and/or consistency failure.
    pub fn record_check_failures(&mut self, server_key: &str, info_failed: bool, table_failed: bool) -> Verdict {
        let record = self.record_mut(server_key);
        if info_failed {
            record.fail.invalid_info = record.fail.invalid_info.saturating_add(1);
        }
        if table_failed {
            record.fail.invalid_table_size = record.fail.invalid_table_size.saturating_add(1);
        }
        record.success = SuccessRecord::default();
        Verdict::Invalid
    }

    /// Applies the irreversibility comparison of a node that passed the
    /// freshness and consistency checks.
    pub fn apply_irreversibility(
        &mut self,
        server_key: &str,
        result: &CheckResult<()>,
        policy: &HysteresisPolicy,
    ) -> Verdict {
        let record = self.record_mut(server_key);

        let failure = match result {
            CheckResult::Passed(()) => {
                record.fail.irreversible_less = 0;
                record.fail.irreversible_greater = 0;
                return Verdict::Valid;
            }
            CheckResult::Failed(failure) => failure,
        };

        match failure.lag_direction() {
            Some(direction) => {
                let counter = match direction {
                    LagDirection::Less => &mut record.fail.irreversible_less,
                    LagDirection::Greater => &mut record.fail.irreversible_greater,
                };
                *counter = counter.saturating_add(1);

                let max = policy.max_irreversible_lag_steps;
                if record.fail.irreversible_less > max || record.fail.irreversible_greater > max {
                    record.success = SuccessRecord::default();
                    Verdict::Invalid
                } else {
                    Verdict::Lagging
                }
            }
            None => {
                record.success = SuccessRecord::default();
                Verdict::Invalid
            }
        }
    }

    /// Decides the store write for a classified node given its current
    /// store weight (`None` when missing or unparseable).
    pub fn decide_weight(
        &mut self,
        server_key: &str,
        verdict: Verdict,
        current: Option<u64>,
        targets: &WeightTargets,
        policy: &HysteresisPolicy,
    ) -> WeightAction {
        match verdict {
            Verdict::Invalid => {
                if current == Some(targets.zero) {
                    WeightAction::Keep
                } else {
                    WeightAction::SetZero
                }
            }
            Verdict::Valid | Verdict::Lagging => {
                let lagging = verdict == Verdict::Lagging;
                let record = self.record_mut(server_key);
                if current == Some(targets.full) {
                    if !lagging {
                        record.clear();
                    }
                    return WeightAction::Keep;
                }

                if record.fail.invalid_table_size > 0 {
                    record.success.valid_table_size = record.success.valid_table_size.saturating_add(1);
                    if record.success.valid_table_size <= policy.min_success_table_steps {
                        return WeightAction::Keep;
                    }
                }

                if lagging {
                    record.clear_keeping_lag();
                } else {
                    record.clear();
                }
                WeightAction::SetFull
            }
        }
    }
}
