//! Append-only cost ledger and budget thresholds.
//!
//! Aggregations are pure folds over the entry list; there are no cached
//! running totals that could drift from the entries themselves.

use std::collections::HashMap;

use chrono::{Datelike, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::task::{CostEntry, Phase};

/// What spend to aggregate for a budget check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetScope {
    Task(Uuid),
    Global,
}

/// Window over which spend is accumulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetPeriod {
    Day,
    Month,
    AllTime,
}

/// Whether crossing the threshold blocks phase starts or only warns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetPolicy {
    HardStop,
    SoftWarn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetStatus {
    Ok,
    /// Spend is at or above 80% of the threshold.
    Warning,
    /// Spend is at or above the threshold.
    Exceeded,
}

/// Budget configuration, injected once at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    pub threshold_micros: u64,
    pub period: BudgetPeriod,
    pub policy: BudgetPolicy,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            // $50
            threshold_micros: 50_000_000,
            period: BudgetPeriod::Month,
            policy: BudgetPolicy::SoftWarn,
        }
    }
}

/// Spend snapshot returned by budget checks and the budget endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetReport {
    pub spent_micros: u64,
    pub threshold_micros: u64,
    pub period: BudgetPeriod,
    pub policy: BudgetPolicy,
    pub status: BudgetStatus,
}

/// Append-only record of billed usage across all tasks.
///
/// Entries for different tasks are independent; a single RwLock suffices
/// because appends are short and reads are folds.
pub struct CostLedger {
    entries: RwLock<Vec<(Uuid, CostEntry)>>,
    budget: BudgetConfig,
}

impl CostLedger {
    pub fn new(budget: BudgetConfig) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            budget,
        }
    }

    pub fn budget_config(&self) -> &BudgetConfig {
        &self.budget
    }

    /// Append an entry. Entries are never overwritten or removed.
    pub async fn record(&self, task_id: Uuid, entry: CostEntry) {
        tracing::debug!(
            task_id = %task_id,
            phase = %entry.phase,
            model = %entry.model_id,
            cost_micros = entry.cost_micros,
            "Recorded cost entry"
        );
        self.entries.write().await.push((task_id, entry));
    }

    /// Total spend for a task, in micro-dollars.
    pub async fn total(&self, task_id: Uuid) -> u64 {
        self.entries
            .read()
            .await
            .iter()
            .filter(|(id, _)| *id == task_id)
            .map(|(_, e)| e.cost_micros)
            .sum()
    }

    /// Spend per phase for a task.
    pub async fn breakdown_by_phase(&self, task_id: Uuid) -> HashMap<Phase, u64> {
        let entries = self.entries.read().await;
        let mut breakdown = HashMap::new();
        for (_, entry) in entries.iter().filter(|(id, _)| *id == task_id) {
            *breakdown.entry(entry.phase).or_insert(0) += entry.cost_micros;
        }
        breakdown
    }

    /// Spend per model for a task.
    pub async fn breakdown_by_model(&self, task_id: Uuid) -> HashMap<String, u64> {
        let entries = self.entries.read().await;
        let mut breakdown = HashMap::new();
        for (_, entry) in entries.iter().filter(|(id, _)| *id == task_id) {
            *breakdown.entry(entry.model_id.clone()).or_insert(0) += entry.cost_micros;
        }
        breakdown
    }

    /// Cumulative spend in the configured period versus the threshold.
    pub async fn budget_status(&self, scope: BudgetScope, period: BudgetPeriod) -> BudgetReport {
        let now = Utc::now();
        let entries = self.entries.read().await;
        let spent: u64 = entries
            .iter()
            .filter(|(id, _)| match scope {
                BudgetScope::Task(task_id) => *id == task_id,
                BudgetScope::Global => true,
            })
            .filter(|(_, e)| match period {
                BudgetPeriod::Day => e.timestamp.date_naive() == now.date_naive(),
                BudgetPeriod::Month => {
                    e.timestamp.year() == now.year() && e.timestamp.month() == now.month()
                }
                BudgetPeriod::AllTime => true,
            })
            .map(|(_, e)| e.cost_micros)
            .sum();

        let status = if spent >= self.budget.threshold_micros {
            BudgetStatus::Exceeded
        } else if spent * 10 >= self.budget.threshold_micros * 8 {
            BudgetStatus::Warning
        } else {
            BudgetStatus::Ok
        };

        BudgetReport {
            spent_micros: spent,
            threshold_micros: self.budget.threshold_micros,
            period,
            policy: self.budget.policy,
            status,
        }
    }
}
