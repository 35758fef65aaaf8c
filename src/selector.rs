//! Model selection and cost estimation.
//!
//! The catalog is an immutable configuration value built once and injected at
//! orchestrator construction, so concurrent tasks can never observe a
//! mid-flight configuration change. All functions here are pure over that
//! configuration; side effects live in the orchestrator and ledger.

use std::collections::HashMap;

use serde::Serialize;
use thiserror::Error;

use crate::task::{ModelSelection, Phase, QualityPreference, TaskConstraints};

/// Per-model rate card, in micro-dollars per 1000 tokens.
#[derive(Debug, Clone, Serialize)]
pub struct ModelRate {
    pub provider: String,
    pub prompt_micros_per_1k: u64,
    pub completion_micros_per_1k: u64,
}

/// Projected token usage for a phase call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TokenProjection {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenProjection {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum SelectorError {
    #[error("model '{model}' is not permitted for phase {phase}")]
    NotPermitted { phase: Phase, model: String },
    #[error("unknown model '{0}'")]
    UnknownModel(String),
    #[error("no default model configured for phase {phase}")]
    NoDefault { phase: Phase },
}

/// Immutable model catalog: allowed sets, tier defaults, and rates.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    rates: HashMap<String, ModelRate>,
    allowed: HashMap<Phase, Vec<String>>,
    defaults: HashMap<(Phase, QualityPreference), String>,
}

impl ModelCatalog {
    pub fn new(
        rates: HashMap<String, ModelRate>,
        allowed: HashMap<Phase, Vec<String>>,
        defaults: HashMap<(Phase, QualityPreference), String>,
    ) -> Self {
        Self {
            rates,
            allowed,
            defaults,
        }
    }

    /// Resolve a selection to a concrete model id.
    ///
    /// Explicit ids are validated against the phase's allowed set; `auto`
    /// looks up the `(phase, quality)` default.
    pub fn resolve(
        &self,
        phase: Phase,
        selection: &ModelSelection,
        quality: QualityPreference,
    ) -> Result<&str, SelectorError> {
        match selection {
            // Return the id owned by the allowed set, so the result borrows
            // from the catalog rather than the caller's selection.
            ModelSelection::Explicit(model) => self
                .allowed
                .get(&phase)
                .and_then(|models| models.iter().find(|m| *m == model))
                .map(String::as_str)
                .ok_or_else(|| SelectorError::NotPermitted {
                    phase,
                    model: model.clone(),
                }),
            ModelSelection::Auto => self
                .defaults
                .get(&(phase, quality))
                .map(String::as_str)
                .ok_or(SelectorError::NoDefault { phase }),
        }
    }

    /// Rate card entry for a model.
    pub fn rate(&self, model_id: &str) -> Result<&ModelRate, SelectorError> {
        self.rates
            .get(model_id)
            .ok_or_else(|| SelectorError::UnknownModel(model_id.to_string()))
    }

    /// Estimated cost in micro-dollars for one phase call.
    ///
    /// Pure over the rate card; used both for the pre-execution preview and
    /// for billing actual token counts after the call.
    pub fn estimate_cost(
        &self,
        phase: Phase,
        model_id: &str,
        projection: TokenProjection,
    ) -> Result<u64, SelectorError> {
        let permitted = self
            .allowed
            .get(&phase)
            .map(|models| models.iter().any(|m| m == model_id))
            .unwrap_or(false);
        if !permitted {
            return Err(SelectorError::NotPermitted {
                phase,
                model: model_id.to_string(),
            });
        }
        let rate = self.rate(model_id)?;
        let prompt = projection.input_tokens * rate.prompt_micros_per_1k / 1000;
        let completion = projection.output_tokens * rate.completion_micros_per_1k / 1000;
        Ok(prompt + completion)
    }

    /// Projected token usage for a phase, derived from the target length.
    ///
    /// Rough heuristic (~4/3 tokens per word for output, prompt grows with
    /// accumulated context). Only used for the preview and deadline sizing;
    /// billing uses real counts from the provider.
    pub fn project_tokens(phase: Phase, constraints: &TaskConstraints) -> TokenProjection {
        let target_tokens = (constraints.target_words as u64) * 4 / 3;
        let (input, output) = match phase {
            Phase::Research => (400, target_tokens / 2),
            Phase::Outline => (target_tokens / 2 + 400, target_tokens / 4),
            Phase::Draft => (target_tokens + 800, target_tokens),
            Phase::Assess => (target_tokens + 400, 300),
            Phase::Refine => (target_tokens + 700, target_tokens),
            Phase::Image => (target_tokens / 4, 200),
            Phase::Finalize => (target_tokens + 400, target_tokens),
        };
        TokenProjection {
            input_tokens: input,
            output_tokens: output,
        }
    }

    /// Pre-execution cost preview for an entire pipeline run.
    ///
    /// Sums the estimate for each phase's resolved model, counting the
    /// Assess/Refine pair once. Refinement cycles make the real figure
    /// higher; the preview is a floor, not a ceiling.
    pub fn preview_pipeline_cost(
        &self,
        selections: &std::collections::BTreeMap<Phase, ModelSelection>,
        quality: QualityPreference,
        constraints: &TaskConstraints,
    ) -> Result<u64, SelectorError> {
        let mut total = 0u64;
        for phase in [
            Phase::Research,
            Phase::Outline,
            Phase::Draft,
            Phase::Assess,
            Phase::Image,
            Phase::Finalize,
        ] {
            let selection = selections.get(&phase).cloned().unwrap_or_default();
            let model = self.resolve(phase, &selection, quality)?.to_string();
            total += self.estimate_cost(phase, &model, Self::project_tokens(phase, constraints))?;
        }
        Ok(total)
    }
}

impl Default for ModelCatalog {
    /// Built-in catalog over OpenRouter model ids.
    ///
    /// Rates mirror published list prices at build time; they only need to
    /// be internally consistent (quality tier strictly pricier than fast).
    fn default() -> Self {
        let mut rates = HashMap::new();
        let mut add = |id: &str, prompt: u64, completion: u64| {
            rates.insert(
                id.to_string(),
                ModelRate {
                    provider: "openrouter".to_string(),
                    prompt_micros_per_1k: prompt,
                    completion_micros_per_1k: completion,
                },
            );
        };
        add("openai/gpt-4o-mini", 150, 600);
        add("openai/gpt-4o", 2500, 10_000);
        add("anthropic/claude-3.5-haiku", 800, 4000);
        add("anthropic/claude-3.5-sonnet", 3000, 15_000);
        add("anthropic/claude-3-opus", 15_000, 75_000);
        add("google/gemini-flash-1.5", 75, 300);
        add("black-forest-labs/flux-schnell", 1000, 3000);
        add("black-forest-labs/flux-1.1-pro", 4000, 40_000);

        let text_models = vec![
            "openai/gpt-4o-mini".to_string(),
            "openai/gpt-4o".to_string(),
            "anthropic/claude-3.5-haiku".to_string(),
            "anthropic/claude-3.5-sonnet".to_string(),
            "anthropic/claude-3-opus".to_string(),
            "google/gemini-flash-1.5".to_string(),
        ];
        let image_models = vec![
            "black-forest-labs/flux-schnell".to_string(),
            "black-forest-labs/flux-1.1-pro".to_string(),
        ];

        let mut allowed = HashMap::new();
        for phase in [
            Phase::Research,
            Phase::Outline,
            Phase::Draft,
            Phase::Assess,
            Phase::Refine,
            Phase::Finalize,
        ] {
            allowed.insert(phase, text_models.clone());
        }
        allowed.insert(Phase::Image, image_models);

        let mut defaults = HashMap::new();
        let mut tier = |phase: Phase, fast: &str, balanced: &str, quality: &str| {
            defaults.insert((phase, QualityPreference::Fast), fast.to_string());
            defaults.insert((phase, QualityPreference::Balanced), balanced.to_string());
            defaults.insert((phase, QualityPreference::Quality), quality.to_string());
        };
        tier(
            Phase::Research,
            "google/gemini-flash-1.5",
            "openai/gpt-4o-mini",
            "anthropic/claude-3.5-sonnet",
        );
        tier(
            Phase::Outline,
            "openai/gpt-4o-mini",
            "anthropic/claude-3.5-haiku",
            "anthropic/claude-3.5-sonnet",
        );
        tier(
            Phase::Draft,
            "openai/gpt-4o-mini",
            "anthropic/claude-3.5-sonnet",
            "anthropic/claude-3-opus",
        );
        tier(
            Phase::Assess,
            "openai/gpt-4o-mini",
            "openai/gpt-4o",
            "anthropic/claude-3.5-sonnet",
        );
        tier(
            Phase::Refine,
            "openai/gpt-4o-mini",
            "anthropic/claude-3.5-sonnet",
            "anthropic/claude-3-opus",
        );
        tier(
            Phase::Image,
            "black-forest-labs/flux-schnell",
            "black-forest-labs/flux-schnell",
            "black-forest-labs/flux-1.1-pro",
        );
        tier(
            Phase::Finalize,
            "openai/gpt-4o-mini",
            "anthropic/claude-3.5-haiku",
            "anthropic/claude-3.5-sonnet",
        );

        Self::new(rates, allowed, defaults)
    }
}
