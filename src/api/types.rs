//! Request and response bodies for the HTTP API.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::task::{
    CostEntry, ModelSelection, Phase, QualityPreference, TaskConstraints, TaskStatus,
};

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub topic: String,
    #[serde(default)]
    pub target_words: Option<u32>,
    #[serde(default)]
    pub audience: Option<String>,
    #[serde(default)]
    pub tone: Option<String>,
    /// Per-phase model overrides; omitted phases use `auto`.
    #[serde(default)]
    pub model_selections: BTreeMap<Phase, ModelSelection>,
    #[serde(default)]
    pub quality_preference: Option<QualityPreference>,
    #[serde(default)]
    pub max_refinements: Option<u32>,
}

impl CreateTaskRequest {
    pub fn constraints(&self) -> TaskConstraints {
        let mut constraints = TaskConstraints::default();
        if let Some(words) = self.target_words {
            constraints.target_words = words;
        }
        constraints.audience = self.audience.clone();
        constraints.tone = self.tone.clone();
        constraints
    }
}

#[derive(Debug, Serialize)]
pub struct CreateTaskResponse {
    pub id: Uuid,
    pub status: TaskStatus,
    /// Pre-execution cost preview in micro-dollars; a floor, since
    /// refinement cycles add to it.
    pub estimated_cost_micros: u64,
}

#[derive(Debug, Deserialize)]
pub struct ListTasksQuery {
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub per_page: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct CostsResponse {
    pub task_id: Uuid,
    pub total_micros: u64,
    pub by_phase: std::collections::HashMap<Phase, u64>,
    pub by_model: std::collections::HashMap<String, u64>,
    pub entries: Vec<CostEntry>,
}
