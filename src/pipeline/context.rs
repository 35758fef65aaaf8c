//! Context a phase executor sees: accumulated outputs plus the resolved
//! model. Assembled by the orchestrator from the task snapshot; executors
//! never touch the task itself.

use crate::task::{Phase, PhaseOutputs, Task, TaskConstraints};

#[derive(Debug, Clone)]
pub struct PhaseContext {
    pub topic: String,
    pub constraints: TaskConstraints,
    pub outputs: PhaseOutputs,
    /// Feedback from the most recent Assess verdict, for Refine.
    pub qa_feedback: Option<String>,
    /// Model id resolved by the selector for this phase.
    pub model_id: String,
    pub max_tokens: u64,
}

impl PhaseContext {
    pub fn from_task(task: &Task, model_id: String, max_tokens: u64) -> Self {
        Self {
            topic: task.topic.clone(),
            constraints: task.constraints.clone(),
            outputs: task.phase_outputs.clone(),
            qa_feedback: task.qa_feedback.clone(),
            model_id,
            max_tokens,
        }
    }

    pub fn output(&self, phase: Phase) -> Option<&str> {
        self.outputs.get(phase)
    }

    /// Constraint lines shared by every prompt.
    pub fn constraint_block(&self) -> String {
        let mut block = format!("Target length: {} words.", self.constraints.target_words);
        if let Some(audience) = &self.constraints.audience {
            block.push_str(&format!("\nAudience: {}.", audience));
        }
        if let Some(tone) = &self.constraints.tone {
            block.push_str(&format!("\nTone: {}.", tone));
        }
        block
    }
}
