//! Phase executors.
//!
//! One executor per pipeline stage. Each reads the outputs accumulated so
//! far, builds a prompt, and makes a single model call; retries and state
//! transitions belong to the orchestrator.

mod context;
mod executors;
mod verdict;

pub use context::PhaseContext;
pub use executors::{
    AssessExecutor, DraftExecutor, FinalizeExecutor, ImageExecutor, OutlineExecutor,
    RefineExecutor, ResearchExecutor,
};
pub use verdict::{parse_verdict, AssessVerdict};

use std::sync::Arc;

use async_trait::async_trait;

use crate::llm::{ModelClient, ProviderError};
use crate::task::Phase;

/// What a phase produced: prose for most phases, a structured verdict
/// for Assess.
#[derive(Debug, Clone)]
pub enum PhaseOutcome {
    Text(String),
    Verdict(AssessVerdict),
}

/// A phase outcome together with the token usage it was billed at.
#[derive(Debug, Clone)]
pub struct PhaseProduction {
    pub outcome: PhaseOutcome,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Capability shared by all pipeline stages.
#[async_trait]
pub trait PhaseExecutor: Send + Sync {
    fn phase(&self) -> Phase;

    /// Projected token usage for deadline and preview sizing.
    fn estimate_tokens(&self, ctx: &PhaseContext) -> u64;

    /// Execute the phase once. Never retries internally.
    async fn produce(&self, ctx: &PhaseContext) -> Result<PhaseProduction, ProviderError>;
}

/// Construct the executor for a phase.
pub fn executor_for(phase: Phase, client: Arc<dyn ModelClient>) -> Box<dyn PhaseExecutor> {
    match phase {
        Phase::Research => Box::new(ResearchExecutor::new(client)),
        Phase::Outline => Box::new(OutlineExecutor::new(client)),
        Phase::Draft => Box::new(DraftExecutor::new(client)),
        Phase::Assess => Box::new(AssessExecutor::new(client)),
        Phase::Refine => Box::new(RefineExecutor::new(client)),
        Phase::Image => Box::new(ImageExecutor::new(client)),
        Phase::Finalize => Box::new(FinalizeExecutor::new(client)),
    }
}
