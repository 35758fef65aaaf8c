//! The seven pipeline stage executors.
//!
//! Prompt text is deliberately plain; the engine's contract is the shape of
//! the context each stage consumes and the artifact it emits, not the
//! wording sent to the provider.

use std::sync::Arc;

use async_trait::async_trait;

use crate::llm::{Generation, GenerationRequest, ModelClient, ProviderError};
use crate::selector::ModelCatalog;
use crate::task::Phase;

use super::verdict::parse_verdict;
use super::{PhaseContext, PhaseExecutor, PhaseOutcome, PhaseProduction};

async fn generate(
    client: &dyn ModelClient,
    ctx: &PhaseContext,
    prompt: String,
) -> Result<Generation, ProviderError> {
    client
        .generate(&GenerationRequest {
            model_id: ctx.model_id.clone(),
            prompt,
            max_tokens: ctx.max_tokens,
        })
        .await
}

fn text_production(generation: Generation) -> PhaseProduction {
    PhaseProduction {
        outcome: PhaseOutcome::Text(generation.text),
        input_tokens: generation.input_tokens,
        output_tokens: generation.output_tokens,
    }
}

/// Gather background material for the topic.
pub struct ResearchExecutor {
    client: Arc<dyn ModelClient>,
}

impl ResearchExecutor {
    pub fn new(client: Arc<dyn ModelClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PhaseExecutor for ResearchExecutor {
    fn phase(&self) -> Phase {
        Phase::Research
    }

    fn estimate_tokens(&self, ctx: &PhaseContext) -> u64 {
        ModelCatalog::project_tokens(Phase::Research, &ctx.constraints).total()
    }

    async fn produce(&self, ctx: &PhaseContext) -> Result<PhaseProduction, ProviderError> {
        let prompt = format!(
            "Research the topic below for a long-form article. List the key facts, \
             angles, open debates, and concrete examples a writer should draw on. \
             Cite the kind of source each point would come from.\n\n\
             Topic: {}\n{}",
            ctx.topic,
            ctx.constraint_block(),
        );
        Ok(text_production(generate(&*self.client, ctx, prompt).await?))
    }
}

/// Turn research notes into a section-by-section outline.
pub struct OutlineExecutor {
    client: Arc<dyn ModelClient>,
}

impl OutlineExecutor {
    pub fn new(client: Arc<dyn ModelClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PhaseExecutor for OutlineExecutor {
    fn phase(&self) -> Phase {
        Phase::Outline
    }

    fn estimate_tokens(&self, ctx: &PhaseContext) -> u64 {
        ModelCatalog::project_tokens(Phase::Outline, &ctx.constraints).total()
    }

    async fn produce(&self, ctx: &PhaseContext) -> Result<PhaseProduction, ProviderError> {
        let research = ctx.output(Phase::Research).unwrap_or_default();
        let prompt = format!(
            "Build a section-by-section outline for an article on \"{}\".\n{}\n\n\
             Research notes:\n{}",
            ctx.topic,
            ctx.constraint_block(),
            research,
        );
        Ok(text_production(generate(&*self.client, ctx, prompt).await?))
    }
}

/// Write the full draft from the outline.
pub struct DraftExecutor {
    client: Arc<dyn ModelClient>,
}

impl DraftExecutor {
    pub fn new(client: Arc<dyn ModelClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PhaseExecutor for DraftExecutor {
    fn phase(&self) -> Phase {
        Phase::Draft
    }

    fn estimate_tokens(&self, ctx: &PhaseContext) -> u64 {
        ModelCatalog::project_tokens(Phase::Draft, &ctx.constraints).total()
    }

    async fn produce(&self, ctx: &PhaseContext) -> Result<PhaseProduction, ProviderError> {
        let prompt = format!(
            "Write the complete article on \"{}\" following the outline. \
             Use the research notes for specifics.\n{}\n\n\
             Outline:\n{}\n\nResearch notes:\n{}",
            ctx.topic,
            ctx.constraint_block(),
            ctx.output(Phase::Outline).unwrap_or_default(),
            ctx.output(Phase::Research).unwrap_or_default(),
        );
        Ok(text_production(generate(&*self.client, ctx, prompt).await?))
    }
}

/// Self-critique: returns a structured verdict, not prose.
pub struct AssessExecutor {
    client: Arc<dyn ModelClient>,
}

impl AssessExecutor {
    pub fn new(client: Arc<dyn ModelClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PhaseExecutor for AssessExecutor {
    fn phase(&self) -> Phase {
        Phase::Assess
    }

    fn estimate_tokens(&self, ctx: &PhaseContext) -> u64 {
        ModelCatalog::project_tokens(Phase::Assess, &ctx.constraints).total()
    }

    async fn produce(&self, ctx: &PhaseContext) -> Result<PhaseProduction, ProviderError> {
        let prompt = format!(
            "You are a strict editor. Assess the draft below against the brief. \
             Respond with only a JSON object: \
             {{\"approved\": bool, \"feedback\": string, \"score\": number 0-10}}. \
             Approve only if the draft needs no structural rework.\n\n\
             Brief: article on \"{}\".\n{}\n\nDraft:\n{}",
            ctx.topic,
            ctx.constraint_block(),
            ctx.output(Phase::Draft).unwrap_or_default(),
        );
        let generation = generate(&*self.client, ctx, prompt).await?;
        Ok(PhaseProduction {
            outcome: PhaseOutcome::Verdict(parse_verdict(&generation.text)),
            input_tokens: generation.input_tokens,
            output_tokens: generation.output_tokens,
        })
    }
}

/// Rework the draft against the assessor's feedback.
pub struct RefineExecutor {
    client: Arc<dyn ModelClient>,
}

impl RefineExecutor {
    pub fn new(client: Arc<dyn ModelClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PhaseExecutor for RefineExecutor {
    fn phase(&self) -> Phase {
        Phase::Refine
    }

    fn estimate_tokens(&self, ctx: &PhaseContext) -> u64 {
        ModelCatalog::project_tokens(Phase::Refine, &ctx.constraints).total()
    }

    async fn produce(&self, ctx: &PhaseContext) -> Result<PhaseProduction, ProviderError> {
        let prompt = format!(
            "Revise the article below to address the editor feedback. Keep what \
             works; return the full revised article, not a diff.\n{}\n\n\
             Editor feedback:\n{}\n\nCurrent draft:\n{}",
            ctx.constraint_block(),
            ctx.qa_feedback.as_deref().unwrap_or("(none)"),
            ctx.output(Phase::Draft).unwrap_or_default(),
        );
        Ok(text_production(generate(&*self.client, ctx, prompt).await?))
    }
}

/// Produce the header image brief/artifact.
pub struct ImageExecutor {
    client: Arc<dyn ModelClient>,
}

impl ImageExecutor {
    pub fn new(client: Arc<dyn ModelClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PhaseExecutor for ImageExecutor {
    fn phase(&self) -> Phase {
        Phase::Image
    }

    fn estimate_tokens(&self, ctx: &PhaseContext) -> u64 {
        ModelCatalog::project_tokens(Phase::Image, &ctx.constraints).total()
    }

    async fn produce(&self, ctx: &PhaseContext) -> Result<PhaseProduction, ProviderError> {
        let prompt = format!(
            "Generate a header image for an article titled \"{}\". \
             Return the image reference and alt text.",
            ctx.topic,
        );
        Ok(text_production(generate(&*self.client, ctx, prompt).await?))
    }
}

/// Final polish pass: headline, subheads, formatting.
pub struct FinalizeExecutor {
    client: Arc<dyn ModelClient>,
}

impl FinalizeExecutor {
    pub fn new(client: Arc<dyn ModelClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PhaseExecutor for FinalizeExecutor {
    fn phase(&self) -> Phase {
        Phase::Finalize
    }

    fn estimate_tokens(&self, ctx: &PhaseContext) -> u64 {
        ModelCatalog::project_tokens(Phase::Finalize, &ctx.constraints).total()
    }

    async fn produce(&self, ctx: &PhaseContext) -> Result<PhaseProduction, ProviderError> {
        let prompt = format!(
            "Copy-edit the article for publication: headline, subheads, \
             consistent formatting, no content changes beyond polish.\n{}\n\n\
             Article:\n{}",
            ctx.constraint_block(),
            ctx.output(Phase::Draft).unwrap_or_default(),
        );
        Ok(text_production(generate(&*self.client, ctx, prompt).await?))
    }
}
