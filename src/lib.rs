//! # Draftworks
//!
//! A long-form content pipeline engine. One task moves a topic through
//! research, outlining, drafting, a bounded self-critique loop, image
//! generation, and copy-editing, then parks at a human approval gate
//! before anything is published.
//!
//! ## Task Flow
//! 1. Receive a task via the API with a topic and constraints
//! 2. Resolve a model per phase from the quality preference and rate card
//! 3. Run the phases in order, billing actual token usage as it goes
//! 4. Assess the draft and refine it up to the configured cap
//! 5. Park at the approval gate; a reviewer decision publishes or closes
//!
//! ## Modules
//! - `task`: the phase state machine and task data model
//! - `orchestrator`: drives tasks through the pipeline, owns retries
//! - `pipeline`: one executor per phase, prompts and verdict parsing
//! - `selector`: model catalog, permissions, and cost estimation
//! - `ledger`: append-only cost record and budget thresholds
//! - `approval`: the human gate and external publishing

pub mod api;
pub mod approval;
pub mod config;
pub mod error;
pub mod events;
pub mod ledger;
pub mod llm;
pub mod orchestrator;
pub mod pipeline;
pub mod selector;
pub mod store;
pub mod task;

pub use config::Config;
pub use error::EngineError;
