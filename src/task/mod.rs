//! Task module - the pipeline state machine and task data model.
//!
//! - All types are algebraic data types with exhaustive matching
//! - Invariants are documented and enforced in constructors/mutators
//! - Pure state-machine logic is separated from IO

mod task;

pub use task::{
    ApprovalStatus, CostEntry, ModelSelection, Phase, PhaseOutput, PhaseOutputs,
    QualityPreference, Task, TaskConstraints, TaskError, TaskStatus, TaskSummary, OUTPUT_ORDER,
};
