//! Core task types: the pipeline state machine, phase outputs, and cost entries.
//!
//! Invariants enforced here rather than at call sites:
//! - `TaskStatus` transitions go through an exhaustive table; illegal edges
//!   are unrepresentable at runtime and caught in one place.
//! - `phase_outputs` only ever holds phases in canonical order.
//! - `refinement_count <= max_refinements` is guarded by the only mutator.
//! - `cost_entries` is append-only; entries are never rewritten.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// One discrete pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Research,
    Outline,
    Draft,
    Assess,
    Refine,
    Image,
    Finalize,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Research => "research",
            Self::Outline => "outline",
            Self::Draft => "draft",
            Self::Assess => "assess",
            Self::Refine => "refine",
            Self::Image => "image",
            Self::Finalize => "finalize",
        };
        write!(f, "{}", s)
    }
}

/// Order in which completed phases may appear in `phase_outputs`.
///
/// Refine does not appear: its output overwrites the Draft entry.
pub const OUTPUT_ORDER: [Phase; 6] = [
    Phase::Research,
    Phase::Outline,
    Phase::Draft,
    Phase::Assess,
    Phase::Image,
    Phase::Finalize,
];

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Researching,
    Outlining,
    Drafting,
    Assessing,
    Refining,
    GeneratingImage,
    Finalizing,
    AwaitingApproval,
    Approved,
    Rejected,
    Failed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Researching => "researching",
            Self::Outlining => "outlining",
            Self::Drafting => "drafting",
            Self::Assessing => "assessing",
            Self::Refining => "refining",
            Self::GeneratingImage => "generating_image",
            Self::Finalizing => "finalizing",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

impl TaskStatus {
    /// Terminal states are never left again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Approved | Self::Rejected | Self::Failed)
    }

    /// States in which the orchestrator is (or may start) executing a phase.
    ///
    /// `AwaitingApproval` is deliberately excluded: only the approval
    /// gateway transitions out of it, and never to `Failed`.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Pending
                | Self::Researching
                | Self::Outlining
                | Self::Drafting
                | Self::Assessing
                | Self::Refining
                | Self::GeneratingImage
                | Self::Finalizing
        )
    }

    /// The phase being executed in this state, if any.
    pub fn active_phase(&self) -> Option<Phase> {
        match self {
            Self::Researching => Some(Phase::Research),
            Self::Outlining => Some(Phase::Outline),
            Self::Drafting => Some(Phase::Draft),
            Self::Assessing => Some(Phase::Assess),
            Self::Refining => Some(Phase::Refine),
            Self::GeneratingImage => Some(Phase::Image),
            Self::Finalizing => Some(Phase::Finalize),
            _ => None,
        }
    }

    /// The exhaustive transition table.
    pub fn can_transition(&self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        if to == Failed {
            return self.is_active();
        }
        matches!(
            (self, to),
            (Pending, Researching)
                | (Researching, Outlining)
                | (Outlining, Drafting)
                | (Drafting, Assessing)
                | (Assessing, Refining)
                | (Assessing, Finalizing)
                | (Refining, Assessing)
                | (Finalizing, GeneratingImage)
                | (GeneratingImage, AwaitingApproval)
                | (AwaitingApproval, Approved)
                | (AwaitingApproval, Rejected)
        )
    }
}

/// Cost/quality tier used to resolve `auto` model selections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityPreference {
    Fast,
    Balanced,
    Quality,
}

impl Default for QualityPreference {
    fn default() -> Self {
        Self::Balanced
    }
}

/// Per-phase model choice: an explicit id, or the `auto` sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ModelSelection {
    Auto,
    Explicit(String),
}

impl From<String> for ModelSelection {
    fn from(s: String) -> Self {
        if s == "auto" {
            Self::Auto
        } else {
            Self::Explicit(s)
        }
    }
}

impl From<ModelSelection> for String {
    fn from(sel: ModelSelection) -> String {
        match sel {
            ModelSelection::Auto => "auto".to_string(),
            ModelSelection::Explicit(id) => id,
        }
    }
}

impl Default for ModelSelection {
    fn default() -> Self {
        Self::Auto
    }
}

/// Authoring constraints; opaque to the engine beyond token projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConstraints {
    /// Target length in words.
    pub target_words: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tone: Option<String>,
}

impl Default for TaskConstraints {
    fn default() -> Self {
        Self {
            target_words: 1000,
            audience: None,
            tone: None,
        }
    }
}

/// Immutable record of one billed model call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostEntry {
    pub phase: Phase,
    pub model_id: String,
    pub provider: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Billed amount in micro-dollars; integer so folds stay exact.
    pub cost_micros: u64,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of the human approval decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

/// One completed phase output, kept in insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseOutput {
    pub phase: Phase,
    pub content: String,
}

/// Ordered phase-name -> artifact map.
///
/// Serialized as an array of `{phase, content}` pairs so insertion order
/// round-trips exactly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhaseOutputs {
    entries: Vec<PhaseOutput>,
}

impl PhaseOutputs {
    /// Record a phase output.
    ///
    /// Appends when `phase` is the next one in canonical order; overwrites
    /// in place when the phase was already completed (Assess re-runs).
    /// `Refine` output always overwrites the Draft entry.
    pub fn record(&mut self, phase: Phase, content: String) -> Result<(), TaskError> {
        let slot = match phase {
            Phase::Refine => Phase::Draft,
            p => p,
        };
        if phase == Phase::Refine && !self.contains(Phase::Draft) {
            return Err(TaskError::NoDraftToRefine);
        }
        if let Some(existing) = self.entries.iter_mut().find(|e| e.phase == slot) {
            existing.content = content;
            return Ok(());
        }
        let expected = OUTPUT_ORDER
            .iter()
            .copied()
            .find(|p| !self.contains(*p))
            .unwrap_or(Phase::Finalize);
        if slot != expected {
            return Err(TaskError::OutOfOrder {
                phase: slot,
                expected,
            });
        }
        self.entries.push(PhaseOutput {
            phase: slot,
            content,
        });
        Ok(())
    }

    pub fn get(&self, phase: Phase) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.phase == phase)
            .map(|e| e.content.as_str())
    }

    pub fn contains(&self, phase: Phase) -> bool {
        self.entries.iter().any(|e| e.phase == phase)
    }

    /// Completed phases in insertion order.
    pub fn phases(&self) -> Vec<Phase> {
        self.entries.iter().map(|e| e.phase).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PhaseOutput> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Errors from task construction and mutation.
#[derive(Debug, Error, PartialEq)]
pub enum TaskError {
    #[error("illegal transition from {from} to {to}")]
    IllegalTransition { from: TaskStatus, to: TaskStatus },
    #[error("phase {phase} recorded out of order (expected {expected})")]
    OutOfOrder { phase: Phase, expected: Phase },
    #[error("refine output recorded before a draft exists")]
    NoDraftToRefine,
    #[error("refinement cap of {0} already reached")]
    RefinementCapReached(u32),
    #[error("topic must not be empty")]
    EmptyTopic,
}

/// Condensed task view for listings and the approval queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: Uuid,
    pub topic: String,
    pub status: TaskStatus,
    pub quality_preference: QualityPreference,
    pub refinement_count: u32,
    pub total_cost_micros: u64,
    pub approval_status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The unit of work: one long-form piece moving through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub topic: String,
    pub constraints: TaskConstraints,
    pub status: TaskStatus,
    pub phase_outputs: PhaseOutputs,
    #[serde(default)]
    pub model_selections: BTreeMap<Phase, ModelSelection>,
    pub quality_preference: QualityPreference,
    pub refinement_count: u32,
    pub max_refinements: u32,
    pub cost_entries: Vec<CostEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qa_feedback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub human_feedback: Option<String>,
    pub approval_status: ApprovalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_phase: Option<Phase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Advisory flag set when spend crosses the budget threshold.
    #[serde(default)]
    pub budget_flagged: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        topic: String,
        constraints: TaskConstraints,
        model_selections: BTreeMap<Phase, ModelSelection>,
        quality_preference: QualityPreference,
        max_refinements: u32,
    ) -> Result<Self, TaskError> {
        if topic.trim().is_empty() {
            return Err(TaskError::EmptyTopic);
        }
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            topic,
            constraints,
            status: TaskStatus::Pending,
            phase_outputs: PhaseOutputs::default(),
            model_selections,
            quality_preference,
            refinement_count: 0,
            max_refinements,
            cost_entries: Vec::new(),
            qa_feedback: None,
            human_feedback: None,
            approval_status: ApprovalStatus::Pending,
            approved_by: None,
            approval_timestamp: None,
            external_id: None,
            published_url: None,
            failed_phase: None,
            last_error: None,
            budget_flagged: false,
            created_at: now,
            updated_at: now,
        })
    }

    /// The model selection for a phase, defaulting to `auto`.
    pub fn selection_for(&self, phase: Phase) -> ModelSelection {
        self.model_selections
            .get(&phase)
            .cloned()
            .unwrap_or(ModelSelection::Auto)
    }

    /// Move to a new status, validated against the transition table.
    pub fn transition(&mut self, to: TaskStatus) -> Result<(), TaskError> {
        if !self.status.can_transition(to) {
            return Err(TaskError::IllegalTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.touch();
        Ok(())
    }

    /// Record a phase artifact, honoring canonical ordering.
    pub fn record_output(&mut self, phase: Phase, content: String) -> Result<(), TaskError> {
        self.phase_outputs.record(phase, content)?;
        self.touch();
        Ok(())
    }

    /// Append a billed usage entry. Entries are never mutated afterwards.
    pub fn push_cost(&mut self, entry: CostEntry) {
        self.cost_entries.push(entry);
        self.touch();
    }

    /// Sum of all billed entries, in micro-dollars.
    pub fn total_cost_micros(&self) -> u64 {
        self.cost_entries.iter().map(|e| e.cost_micros).sum()
    }

    /// Enter one more Assess->Refine cycle.
    ///
    /// The sole mutator of `refinement_count`; rejects when the cap is
    /// already reached so the invariant holds at every observed state.
    pub fn begin_refinement(&mut self) -> Result<(), TaskError> {
        if self.refinement_count >= self.max_refinements {
            return Err(TaskError::RefinementCapReached(self.max_refinements));
        }
        self.refinement_count += 1;
        self.touch();
        Ok(())
    }

    /// Mark the task terminally failed, preserving outputs and cost entries.
    pub fn fail(&mut self, phase: Option<Phase>, cause: String) -> Result<(), TaskError> {
        self.transition(TaskStatus::Failed)?;
        self.failed_phase = phase;
        self.last_error = Some(cause);
        Ok(())
    }

    pub fn summary(&self) -> TaskSummary {
        TaskSummary {
            id: self.id,
            topic: self.topic.clone(),
            status: self.status,
            quality_preference: self.quality_preference,
            refinement_count: self.refinement_count,
            total_cost_micros: self.total_cost_micros(),
            approval_status: self.approval_status,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task::new(
            "Why heat pumps win".to_string(),
            TaskConstraints::default(),
            BTreeMap::new(),
            QualityPreference::Balanced,
            2,
        )
        .unwrap()
    }

    #[test]
    fn empty_topic_rejected() {
        let err = Task::new(
            "   ".to_string(),
            TaskConstraints::default(),
            BTreeMap::new(),
            QualityPreference::Fast,
            1,
        )
        .unwrap_err();
        assert_eq!(err, TaskError::EmptyTopic);
    }

    #[test]
    fn linear_transitions_accepted() {
        let mut t = task();
        for status in [
            TaskStatus::Researching,
            TaskStatus::Outlining,
            TaskStatus::Drafting,
            TaskStatus::Assessing,
            TaskStatus::Refining,
            TaskStatus::Assessing,
            TaskStatus::Finalizing,
            TaskStatus::GeneratingImage,
            TaskStatus::AwaitingApproval,
            TaskStatus::Approved,
        ] {
            t.transition(status).unwrap();
        }
        assert!(t.status.is_terminal());
    }

    #[test]
    fn illegal_transitions_rejected() {
        let mut t = task();
        assert!(t.transition(TaskStatus::Drafting).is_err());
        assert!(t.transition(TaskStatus::Approved).is_err());

        t.transition(TaskStatus::Researching).unwrap();
        // Skipping Outlining is not allowed.
        assert!(t.transition(TaskStatus::Drafting).is_err());
    }

    #[test]
    fn awaiting_approval_never_fails() {
        let mut t = task();
        for status in [
            TaskStatus::Researching,
            TaskStatus::Outlining,
            TaskStatus::Drafting,
            TaskStatus::Assessing,
            TaskStatus::Finalizing,
            TaskStatus::GeneratingImage,
            TaskStatus::AwaitingApproval,
        ] {
            t.transition(status).unwrap();
        }
        assert!(t.transition(TaskStatus::Failed).is_err());
    }

    #[test]
    fn active_phases_can_fail() {
        let mut t = task();
        t.transition(TaskStatus::Researching).unwrap();
        t.transition(TaskStatus::Outlining).unwrap();
        t.fail(Some(Phase::Outline), "provider down".to_string())
            .unwrap();
        assert_eq!(t.status, TaskStatus::Failed);
        assert_eq!(t.failed_phase, Some(Phase::Outline));
        assert_eq!(t.last_error.as_deref(), Some("provider down"));
    }

    #[test]
    fn outputs_enforce_canonical_order() {
        let mut outputs = PhaseOutputs::default();
        assert!(outputs.record(Phase::Draft, "d".into()).is_err());
        outputs.record(Phase::Research, "r".into()).unwrap();
        assert!(outputs.record(Phase::Assess, "a".into()).is_err());
        outputs.record(Phase::Outline, "o".into()).unwrap();
        outputs.record(Phase::Draft, "d1".into()).unwrap();
        assert_eq!(
            outputs.phases(),
            vec![Phase::Research, Phase::Outline, Phase::Draft]
        );
    }

    #[test]
    fn refine_overwrites_draft_in_place() {
        let mut outputs = PhaseOutputs::default();
        outputs.record(Phase::Research, "r".into()).unwrap();
        outputs.record(Phase::Outline, "o".into()).unwrap();
        outputs.record(Phase::Draft, "v1".into()).unwrap();
        outputs.record(Phase::Refine, "v2".into()).unwrap();
        assert_eq!(outputs.get(Phase::Draft), Some("v2"));
        assert_eq!(outputs.len(), 3);
        assert!(!outputs.contains(Phase::Refine));
    }

    #[test]
    fn refine_without_draft_rejected() {
        let mut outputs = PhaseOutputs::default();
        assert_eq!(
            outputs.record(Phase::Refine, "v2".into()),
            Err(TaskError::NoDraftToRefine)
        );
    }

    #[test]
    fn refinement_cap_enforced() {
        let mut t = task();
        t.begin_refinement().unwrap();
        t.begin_refinement().unwrap();
        assert_eq!(
            t.begin_refinement(),
            Err(TaskError::RefinementCapReached(2))
        );
        assert_eq!(t.refinement_count, 2);
    }

    #[test]
    fn selection_sentinel_round_trips() {
        let auto: ModelSelection = serde_json::from_str("\"auto\"").unwrap();
        assert_eq!(auto, ModelSelection::Auto);
        let explicit: ModelSelection = serde_json::from_str("\"openai/gpt-4o\"").unwrap();
        assert_eq!(explicit, ModelSelection::Explicit("openai/gpt-4o".into()));
        assert_eq!(serde_json::to_string(&ModelSelection::Auto).unwrap(), "\"auto\"");
    }

    #[test]
    fn snapshot_round_trip_is_identical() {
        let mut t = task();
        t.transition(TaskStatus::Researching).unwrap();
        t.record_output(Phase::Research, "notes".into()).unwrap();
        t.push_cost(CostEntry {
            phase: Phase::Research,
            model_id: "openai/gpt-4o-mini".into(),
            provider: "openrouter".into(),
            input_tokens: 900,
            output_tokens: 400,
            cost_micros: 1234,
            timestamp: Utc::now(),
        });
        let json = serde_json::to_string(&t).unwrap();
        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(back, t);
        assert_eq!(serde_json::to_string(&back).unwrap(), json);
    }
}
