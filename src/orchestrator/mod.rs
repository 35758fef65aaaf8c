//! The pipeline orchestrator.
//!
//! Drives one task through the phase state machine: strictly linear up to
//! Assess, the bounded Assess<->Refine loop, then Finalize/Image (the one
//! allowed concurrency) and the approval gate. Owns the retry budget for
//! transient provider errors, the per-phase deadline, budget enforcement,
//! and cooperative cancellation. Phase executors stay free of all of it.

mod refine;

pub use refine::{decide, run_refine_loop, RefineDecision, RefineOutcome, RefineSteps};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::EngineError;
use crate::events::{EventBus, ProgressEvent};
use crate::ledger::{BudgetPolicy, BudgetScope, BudgetStatus, CostLedger};
use crate::llm::{ModelClient, ProviderError};
use crate::pipeline::{
    executor_for, parse_verdict, AssessVerdict, PhaseContext, PhaseExecutor, PhaseOutcome,
    PhaseProduction,
};
use crate::selector::{ModelCatalog, TokenProjection};
use crate::store::TaskStore;
use crate::task::{CostEntry, Phase, Task, TaskStatus};

/// Retry and deadline knobs, fixed at construction.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries per phase beyond the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Deadline for a single phase call; elapse counts as transient.
    pub phase_deadline: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            phase_deadline: Duration::from_secs(120),
        }
    }
}

/// Drives tasks through the pipeline. One instance serves all tasks;
/// per-task state lives on the task itself.
pub struct Orchestrator {
    client: Arc<dyn ModelClient>,
    catalog: Arc<ModelCatalog>,
    ledger: Arc<CostLedger>,
    store: TaskStore,
    events: Arc<EventBus>,
    retry: RetryPolicy,
}

impl Orchestrator {
    pub fn new(
        client: Arc<dyn ModelClient>,
        catalog: Arc<ModelCatalog>,
        ledger: Arc<CostLedger>,
        store: TaskStore,
        events: Arc<EventBus>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            client,
            catalog,
            ledger,
            store,
            events,
            retry,
        }
    }

    /// Drive a task until it parks (approval gate, budget stop) or
    /// terminates. Never panics on provider or storage trouble; failures
    /// land on the task itself.
    pub async fn run(&self, mut task: Task, cancel: CancellationToken) -> Task {
        let task_id = task.id;
        match self.drive(&mut task, &cancel).await {
            Ok(()) => {
                info!(task_id = %task_id, status = %task.status, "Pipeline run complete");
            }
            Err(EngineError::BudgetExceeded {
                spent_micros,
                threshold_micros,
            }) => {
                // Parked, not failed: the task keeps its current status and
                // waits for operator action.
                warn!(
                    task_id = %task_id,
                    spent_micros,
                    threshold_micros,
                    "Budget hard stop; task parked in {}",
                    task.status
                );
            }
            Err(EngineError::Cancelled) => {
                self.fail_task(&mut task, "task cancelled".to_string()).await;
            }
            Err(e) => {
                self.fail_task(&mut task, e.to_string()).await;
            }
        }
        if task.status.is_terminal() {
            self.events.close(task_id).await;
        }
        task
    }

    async fn drive(&self, task: &mut Task, cancel: &CancellationToken) -> Result<(), EngineError> {
        self.persist(task).await?;

        self.run_linear_phase(task, cancel, Phase::Research, TaskStatus::Researching)
            .await?;
        self.run_linear_phase(task, cancel, Phase::Outline, TaskStatus::Outlining)
            .await?;
        self.run_linear_phase(task, cancel, Phase::Draft, TaskStatus::Drafting)
            .await?;

        let max_refinements = task.max_refinements;
        let outcome = {
            let mut steps = PipelineSteps {
                orch: self,
                task: &mut *task,
                cancel,
            };
            run_refine_loop(&mut steps, max_refinements).await?
        };
        if outcome.cap_reached {
            info!(
                task_id = %task.id,
                refinements = outcome.refinements_used,
                score = outcome.verdict.score,
                "Refinement cap reached; finalizing with the last refined draft"
            );
        }

        self.checkpoint(cancel)?;
        self.check_budget(task).await?;
        self.set_status(task, TaskStatus::Finalizing).await?;

        // Finalize and the header image are data-independent; this is the
        // one place two phase calls overlap within a task.
        let (finalize_model, finalize_ctx) = self.prepare(task, Phase::Finalize)?;
        let (image_model, image_ctx) = self.prepare(task, Phase::Image)?;
        let finalize_exec = executor_for(Phase::Finalize, Arc::clone(&self.client));
        let image_exec = executor_for(Phase::Image, Arc::clone(&self.client));
        self.events
            .publish(
                task.id,
                ProgressEvent::PhaseStarted {
                    phase: Phase::Finalize,
                    model_id: finalize_model.clone(),
                },
            )
            .await;
        self.events
            .publish(
                task.id,
                ProgressEvent::PhaseStarted {
                    phase: Phase::Image,
                    model_id: image_model.clone(),
                },
            )
            .await;
        let (finalize_res, image_res) = tokio::join!(
            self.execute_with_retry(task.id, finalize_exec.as_ref(), &finalize_ctx, cancel),
            self.execute_with_retry(task.id, image_exec.as_ref(), &image_ctx, cancel),
        );

        // A one-sided failure must not discard the partner's finished work.
        // Failure attribution: a finalize error surfaces while the task is
        // still Finalizing; an image error after the transition to
        // GeneratingImage.
        let (finalize_production, image_production) = match (finalize_res, image_res) {
            (Ok(finalize_production), Ok(image_production)) => {
                (finalize_production, image_production)
            }
            (Err(e), Ok(image_production)) => {
                self.settle_text(task, Phase::Image, &image_model, image_production)
                    .await?;
                return Err(e);
            }
            (Ok(finalize_production), Err(e)) => {
                // Canonical output order needs the Image entry before the
                // Finalize one, so the finalize text cannot be recorded
                // here; its billed usage still lands on the task and ledger.
                self.bill(task, Phase::Finalize, &finalize_model, &finalize_production)
                    .await?;
                self.persist(task).await?;
                self.set_status(task, TaskStatus::GeneratingImage).await?;
                return Err(e);
            }
            (Err(e), Err(_)) => return Err(e),
        };

        self.set_status(task, TaskStatus::GeneratingImage).await?;
        self.settle_text(task, Phase::Image, &image_model, image_production)
            .await?;
        self.settle_text(task, Phase::Finalize, &finalize_model, finalize_production)
            .await?;

        self.checkpoint(cancel)?;
        self.set_status(task, TaskStatus::AwaitingApproval).await?;
        self.events
            .publish(task.id, ProgressEvent::AwaitingApproval)
            .await;
        Ok(())
    }

    /// One strictly-linear stage: budget gate, status move, execute, bill,
    /// record, persist.
    async fn run_linear_phase(
        &self,
        task: &mut Task,
        cancel: &CancellationToken,
        phase: Phase,
        status: TaskStatus,
    ) -> Result<(), EngineError> {
        self.checkpoint(cancel)?;
        self.check_budget(task).await?;
        self.set_status(task, status).await?;

        let (model, ctx) = self.prepare(task, phase)?;
        let executor = executor_for(phase, Arc::clone(&self.client));
        self.events
            .publish(
                task.id,
                ProgressEvent::PhaseStarted {
                    phase,
                    model_id: model.clone(),
                },
            )
            .await;
        let production = self
            .execute_with_retry(task.id, executor.as_ref(), &ctx, cancel)
            .await?;
        self.settle_text(task, phase, &model, production).await
    }

    /// One Assess pass; returns the structured verdict.
    async fn assess_step(
        &self,
        task: &mut Task,
        cancel: &CancellationToken,
    ) -> Result<AssessVerdict, EngineError> {
        self.checkpoint(cancel)?;
        self.check_budget(task).await?;
        self.set_status(task, TaskStatus::Assessing).await?;

        let (model, ctx) = self.prepare(task, Phase::Assess)?;
        let executor = executor_for(Phase::Assess, Arc::clone(&self.client));
        self.events
            .publish(
                task.id,
                ProgressEvent::PhaseStarted {
                    phase: Phase::Assess,
                    model_id: model.clone(),
                },
            )
            .await;
        let production = self
            .execute_with_retry(task.id, executor.as_ref(), &ctx, cancel)
            .await?;
        let verdict = match &production.outcome {
            PhaseOutcome::Verdict(v) => v.clone(),
            PhaseOutcome::Text(t) => parse_verdict(t),
        };
        self.bill(task, Phase::Assess, &model, &production).await?;
        let artifact = serde_json::json!({
            "approved": verdict.approved,
            "feedback": verdict.feedback,
            "score": verdict.score,
        })
        .to_string();
        task.record_output(Phase::Assess, artifact)?;
        task.qa_feedback = Some(verdict.feedback.clone());
        self.persist(task).await?;
        Ok(verdict)
    }

    /// One Refine pass; overwrites the Draft entry.
    async fn refine_step(
        &self,
        task: &mut Task,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        self.checkpoint(cancel)?;
        self.check_budget(task).await?;
        // The Assessing -> Refining edge carries the counter increment.
        task.begin_refinement()?;
        self.set_status(task, TaskStatus::Refining).await?;

        let (model, ctx) = self.prepare(task, Phase::Refine)?;
        let executor = executor_for(Phase::Refine, Arc::clone(&self.client));
        self.events
            .publish(
                task.id,
                ProgressEvent::PhaseStarted {
                    phase: Phase::Refine,
                    model_id: model.clone(),
                },
            )
            .await;
        let production = self
            .execute_with_retry(task.id, executor.as_ref(), &ctx, cancel)
            .await?;
        self.settle_text(task, Phase::Refine, &model, production)
            .await
    }

    /// Resolve the model and assemble the executor context for a phase.
    fn prepare(&self, task: &Task, phase: Phase) -> Result<(String, PhaseContext), EngineError> {
        let model = self
            .catalog
            .resolve(phase, &task.selection_for(phase), task.quality_preference)?
            .to_string();
        let projection = ModelCatalog::project_tokens(phase, &task.constraints);
        let max_tokens = projection.output_tokens.max(512);
        Ok((model.clone(), PhaseContext::from_task(task, model, max_tokens)))
    }

    /// Bill a production and record its text artifact.
    async fn settle_text(
        &self,
        task: &mut Task,
        phase: Phase,
        model: &str,
        production: PhaseProduction,
    ) -> Result<(), EngineError> {
        self.bill(task, phase, model, &production).await?;
        let text = match production.outcome {
            PhaseOutcome::Text(t) => t,
            PhaseOutcome::Verdict(v) => v.feedback,
        };
        task.record_output(phase, text)?;
        self.persist(task).await
    }

    /// Append the cost entry for actual token usage, to both the task and
    /// the ledger, and announce phase completion.
    async fn bill(
        &self,
        task: &mut Task,
        phase: Phase,
        model: &str,
        production: &PhaseProduction,
    ) -> Result<(), EngineError> {
        let cost_micros = self.catalog.estimate_cost(
            phase,
            model,
            TokenProjection {
                input_tokens: production.input_tokens,
                output_tokens: production.output_tokens,
            },
        )?;
        let entry = CostEntry {
            phase,
            model_id: model.to_string(),
            provider: self.client.provider().to_string(),
            input_tokens: production.input_tokens,
            output_tokens: production.output_tokens,
            cost_micros,
            timestamp: Utc::now(),
        };
        task.push_cost(entry.clone());
        self.ledger.record(task.id, entry).await;
        self.events
            .publish(task.id, ProgressEvent::PhaseCompleted { phase, cost_micros })
            .await;
        Ok(())
    }

    /// Execute a phase call under the deadline and bounded retry budget.
    ///
    /// Cancellation here drops the in-flight call; a late provider result
    /// is discarded with the future, never applied.
    async fn execute_with_retry(
        &self,
        task_id: Uuid,
        executor: &dyn PhaseExecutor,
        ctx: &PhaseContext,
        cancel: &CancellationToken,
    ) -> Result<PhaseProduction, EngineError> {
        let phase = executor.phase();
        tracing::debug!(
            task_id = %task_id,
            phase = %phase,
            model = %ctx.model_id,
            projected_tokens = executor.estimate_tokens(ctx),
            "Executing phase"
        );
        let mut attempt = 0u32;
        loop {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                res = tokio::time::timeout(self.retry.phase_deadline, executor.produce(ctx)) => res,
            };
            let err = match outcome {
                Ok(Ok(production)) => return Ok(production),
                Ok(Err(e)) => e,
                Err(_) => ProviderError::transient(format!(
                    "phase {} exceeded deadline of {:?}",
                    phase, self.retry.phase_deadline
                )),
            };
            if !err.is_transient() || attempt >= self.retry.max_retries {
                return Err(err.into());
            }
            let delay = self.backoff_delay(attempt, err.retry_after);
            warn!(
                task_id = %task_id,
                phase = %phase,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "Transient provider error, retrying: {}",
                err.message
            );
            self.events
                .publish(
                    task_id,
                    ProgressEvent::RetryScheduled {
                        phase,
                        attempt: attempt + 1,
                        delay_ms: delay.as_millis() as u64,
                    },
                )
                .await;
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Exponential backoff with jitter, deferring to Retry-After when the
    /// server asked for longer.
    fn backoff_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let base_ms = self.retry.base_delay.as_millis() as u64;
        let backoff = base_ms.saturating_mul(1 << attempt.min(16));
        let jitter = rand::thread_rng().gen_range(0..=base_ms / 2 + 1);
        let computed = Duration::from_millis(backoff + jitter);
        match retry_after {
            Some(ra) if ra > computed => ra,
            _ => computed,
        }
    }

    /// Budget gate before a phase start.
    async fn check_budget(&self, task: &mut Task) -> Result<(), EngineError> {
        let period = self.ledger.budget_config().period;
        let report = self.ledger.budget_status(BudgetScope::Global, period).await;
        match report.status {
            BudgetStatus::Ok => Ok(()),
            BudgetStatus::Warning => {
                task.budget_flagged = true;
                self.events
                    .publish(
                        task.id,
                        ProgressEvent::BudgetWarning {
                            spent_micros: report.spent_micros,
                            threshold_micros: report.threshold_micros,
                        },
                    )
                    .await;
                Ok(())
            }
            BudgetStatus::Exceeded => {
                task.budget_flagged = true;
                match report.policy {
                    BudgetPolicy::SoftWarn => {
                        self.events
                            .publish(
                                task.id,
                                ProgressEvent::BudgetWarning {
                                    spent_micros: report.spent_micros,
                                    threshold_micros: report.threshold_micros,
                                },
                            )
                            .await;
                        Ok(())
                    }
                    BudgetPolicy::HardStop => {
                        self.events
                            .publish(
                                task.id,
                                ProgressEvent::BudgetStopped {
                                    spent_micros: report.spent_micros,
                                    threshold_micros: report.threshold_micros,
                                },
                            )
                            .await;
                        self.persist(task).await?;
                        Err(EngineError::BudgetExceeded {
                            spent_micros: report.spent_micros,
                            threshold_micros: report.threshold_micros,
                        })
                    }
                }
            }
        }
    }

    async fn set_status(&self, task: &mut Task, status: TaskStatus) -> Result<(), EngineError> {
        task.transition(status)?;
        self.events
            .publish(task.id, ProgressEvent::StatusChanged { status })
            .await;
        self.persist(task).await
    }

    async fn persist(&self, task: &Task) -> Result<(), EngineError> {
        self.store.upsert(task).await?;
        Ok(())
    }

    /// Cooperative cancellation check, phase boundaries only.
    fn checkpoint(&self, cancel: &CancellationToken) -> Result<(), EngineError> {
        if cancel.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Terminal failure: record the cause, keep every output and cost
    /// entry already produced.
    async fn fail_task(&self, task: &mut Task, cause: String) {
        let phase = task.status.active_phase();
        if let Err(e) = task.fail(phase, cause.clone()) {
            // Already terminal or parked at the gate; nothing to mark.
            warn!(task_id = %task.id, "Could not mark task failed: {}", e);
            return;
        }
        error!(
            task_id = %task.id,
            failed_phase = ?phase,
            "Task failed: {}",
            cause
        );
        self.events
            .publish(
                task.id,
                ProgressEvent::Failed {
                    phase,
                    error: cause,
                },
            )
            .await;
        if let Err(e) = self.persist(task).await {
            error!(task_id = %task.id, "Failed to persist failed task: {}", e);
        }
    }
}

/// Adapter binding the refine-loop combinator to the pipeline.
struct PipelineSteps<'a> {
    orch: &'a Orchestrator,
    task: &'a mut Task,
    cancel: &'a CancellationToken,
}

#[async_trait]
impl RefineSteps for PipelineSteps<'_> {
    type Error = EngineError;

    async fn assess(&mut self, _refinement_count: u32) -> Result<AssessVerdict, EngineError> {
        self.orch.assess_step(self.task, self.cancel).await
    }

    async fn refine(&mut self, _feedback: String) -> Result<(), EngineError> {
        // Feedback already lives on the task as qa_feedback.
        self.orch.refine_step(self.task, self.cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::ledger::{BudgetConfig, BudgetPeriod};
    use crate::llm::{Generation, GenerationRequest};
    use crate::task::{ModelSelection, QualityPreference, TaskConstraints};
    use std::collections::{BTreeMap, HashMap, VecDeque};
    use std::sync::Mutex as StdMutex;

    /// Scripted provider: responses keyed by which phase's prompt arrived,
    /// with optional queued failures per phase.
    struct MockClient {
        fail: StdMutex<HashMap<&'static str, VecDeque<ProviderError>>>,
        assess_script: StdMutex<VecDeque<bool>>,
        calls: StdMutex<Vec<&'static str>>,
    }

    impl MockClient {
        fn new() -> Self {
            Self {
                fail: StdMutex::new(HashMap::new()),
                assess_script: StdMutex::new(VecDeque::new()),
                calls: StdMutex::new(Vec::new()),
            }
        }

        fn script_assess(&self, approvals: &[bool]) {
            self.assess_script.lock().unwrap().extend(approvals);
        }

        fn fail_phase(&self, tag: &'static str, errors: Vec<ProviderError>) {
            self.fail.lock().unwrap().insert(tag, errors.into());
        }

        fn calls_for(&self, tag: &str) -> usize {
            self.calls.lock().unwrap().iter().filter(|t| **t == tag).count()
        }

        fn tag(prompt: &str) -> &'static str {
            if prompt.starts_with("Research") {
                "research"
            } else if prompt.starts_with("Build a section") {
                "outline"
            } else if prompt.starts_with("Write the complete") {
                "draft"
            } else if prompt.starts_with("You are a strict editor") {
                "assess"
            } else if prompt.starts_with("Revise") {
                "refine"
            } else if prompt.starts_with("Generate a header image") {
                "image"
            } else {
                "finalize"
            }
        }
    }

    #[async_trait]
    impl ModelClient for MockClient {
        async fn generate(
            &self,
            request: &GenerationRequest,
        ) -> Result<Generation, ProviderError> {
            let tag = Self::tag(&request.prompt);
            self.calls.lock().unwrap().push(tag);
            if let Some(queue) = self.fail.lock().unwrap().get_mut(tag) {
                if let Some(err) = queue.pop_front() {
                    return Err(err);
                }
            }
            let text = if tag == "assess" {
                let approved = self.assess_script.lock().unwrap().pop_front().unwrap_or(true);
                format!(
                    "{{\"approved\": {}, \"feedback\": \"tighten the intro\", \"score\": {}}}",
                    approved,
                    if approved { 8.0 } else { 3.0 }
                )
            } else if tag == "refine" {
                "refined draft".to_string()
            } else {
                format!("{} output", tag)
            };
            Ok(Generation {
                text,
                input_tokens: 1000,
                output_tokens: 500,
            })
        }

        fn provider(&self) -> &str {
            "mock"
        }
    }

    fn orchestrator(client: Arc<MockClient>) -> Orchestrator {
        orchestrator_with_budget(client, 1_000_000_000, BudgetPolicy::SoftWarn)
    }

    fn orchestrator_with_budget(
        client: Arc<MockClient>,
        threshold_micros: u64,
        policy: BudgetPolicy,
    ) -> Orchestrator {
        Orchestrator::new(
            client,
            Arc::new(ModelCatalog::default()),
            Arc::new(CostLedger::new(BudgetConfig {
                threshold_micros,
                period: BudgetPeriod::AllTime,
                policy,
            })),
            TaskStore::open_in_memory().unwrap(),
            Arc::new(EventBus::new()),
            RetryPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
                phase_deadline: Duration::from_secs(5),
            },
        )
    }

    fn new_task(max_refinements: u32) -> Task {
        Task::new(
            "the quiet rise of district heating".to_string(),
            TaskConstraints::default(),
            BTreeMap::new(),
            QualityPreference::Balanced,
            max_refinements,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn happy_path_reaches_awaiting_approval() {
        let client = Arc::new(MockClient::new());
        let orch = orchestrator(Arc::clone(&client));
        let done = orch.run(new_task(2), CancellationToken::new()).await;

        assert_eq!(done.status, TaskStatus::AwaitingApproval);
        assert_eq!(
            done.phase_outputs.phases(),
            vec![
                Phase::Research,
                Phase::Outline,
                Phase::Draft,
                Phase::Assess,
                Phase::Image,
                Phase::Finalize
            ]
        );
        assert_eq!(done.refinement_count, 0);
        assert_eq!(done.cost_entries.len(), 6);
        assert!(done.total_cost_micros() > 0);
        assert_eq!(orch.ledger.total(done.id).await, done.total_cost_micros());
        // Stored snapshot matches the in-flight task.
        let stored = orch.store.get(done.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::AwaitingApproval);
    }

    #[tokio::test]
    async fn permanent_error_in_drafting_fails_with_partial_outputs() {
        let client = Arc::new(MockClient::new());
        client.fail_phase("draft", vec![ProviderError::permanent("model gone")]);
        let orch = orchestrator(Arc::clone(&client));
        let done = orch.run(new_task(2), CancellationToken::new()).await;

        assert_eq!(done.status, TaskStatus::Failed);
        assert_eq!(done.failed_phase, Some(Phase::Draft));
        assert!(done.last_error.as_deref().unwrap().contains("model gone"));
        // Earlier outputs and their cost entries survive for diagnosis.
        assert_eq!(done.phase_outputs.phases(), vec![Phase::Research, Phase::Outline]);
        assert_eq!(done.cost_entries.len(), 2);
        // No retry was attempted for a permanent error.
        assert_eq!(client.calls_for("draft"), 1);
    }

    #[tokio::test]
    async fn image_failure_still_bills_the_finished_finalize_pass() {
        let client = Arc::new(MockClient::new());
        client.fail_phase("image", vec![ProviderError::permanent("image model gone")]);
        let orch = orchestrator(Arc::clone(&client));
        let done = orch.run(new_task(2), CancellationToken::new()).await;

        assert_eq!(done.status, TaskStatus::Failed);
        assert_eq!(done.failed_phase, Some(Phase::Image));
        // Finalize completed alongside; its spend is on the books even
        // though the run failed before its output could be recorded.
        assert_eq!(client.calls_for("finalize"), 1);
        assert!(done.cost_entries.iter().any(|e| e.phase == Phase::Finalize));
        assert!(!done.cost_entries.iter().any(|e| e.phase == Phase::Image));
        assert_eq!(
            done.phase_outputs.phases(),
            vec![Phase::Research, Phase::Outline, Phase::Draft, Phase::Assess]
        );
    }

    #[tokio::test]
    async fn finalize_failure_keeps_the_image_output() {
        let client = Arc::new(MockClient::new());
        client.fail_phase("finalize", vec![ProviderError::permanent("editor model gone")]);
        let orch = orchestrator(Arc::clone(&client));
        let done = orch.run(new_task(2), CancellationToken::new()).await;

        assert_eq!(done.status, TaskStatus::Failed);
        assert_eq!(done.failed_phase, Some(Phase::Finalize));
        // The image finished alongside and is recorded and billed.
        assert!(done.cost_entries.iter().any(|e| e.phase == Phase::Image));
        assert_eq!(
            done.phase_outputs.phases(),
            vec![
                Phase::Research,
                Phase::Outline,
                Phase::Draft,
                Phase::Assess,
                Phase::Image
            ]
        );
    }

    #[tokio::test]
    async fn transient_errors_are_retried_within_budget() {
        let client = Arc::new(MockClient::new());
        client.fail_phase(
            "outline",
            vec![
                ProviderError::transient("overloaded"),
                ProviderError::transient("still overloaded"),
            ],
        );
        let orch = orchestrator(Arc::clone(&client));
        let done = orch.run(new_task(2), CancellationToken::new()).await;

        assert_eq!(done.status, TaskStatus::AwaitingApproval);
        assert_eq!(client.calls_for("outline"), 3);
        // Only the successful attempt is billed.
        assert_eq!(done.cost_entries.len(), 6);
    }

    #[tokio::test]
    async fn retry_budget_exhaustion_fails_the_phase() {
        let client = Arc::new(MockClient::new());
        client.fail_phase(
            "research",
            vec![
                ProviderError::transient("a"),
                ProviderError::transient("b"),
                ProviderError::transient("c"),
            ],
        );
        let orch = orchestrator(Arc::clone(&client));
        let done = orch.run(new_task(2), CancellationToken::new()).await;

        assert_eq!(done.status, TaskStatus::Failed);
        assert_eq!(done.failed_phase, Some(Phase::Research));
        assert_eq!(client.calls_for("research"), 3);
        assert!(done.phase_outputs.is_empty());
    }

    #[tokio::test]
    async fn refine_cap_finalizes_with_last_refined_draft() {
        let client = Arc::new(MockClient::new());
        // Assess rejects twice; cap of one allows a single refine cycle.
        client.script_assess(&[false, false]);
        let orch = orchestrator(Arc::clone(&client));
        let done = orch.run(new_task(1), CancellationToken::new()).await;

        assert_eq!(done.status, TaskStatus::AwaitingApproval);
        assert_eq!(done.refinement_count, 1);
        assert!(done.refinement_count <= done.max_refinements);
        assert_eq!(client.calls_for("assess"), 2);
        assert_eq!(client.calls_for("refine"), 1);
        // The cap-reached draft is the refine output, overwritten in place.
        assert_eq!(done.phase_outputs.get(Phase::Draft), Some("refined draft"));
        assert_eq!(
            done.phase_outputs.phases(),
            vec![
                Phase::Research,
                Phase::Outline,
                Phase::Draft,
                Phase::Assess,
                Phase::Image,
                Phase::Finalize
            ]
        );
    }

    #[tokio::test]
    async fn rejection_then_approval_stops_refining() {
        let client = Arc::new(MockClient::new());
        client.script_assess(&[false, true]);
        let orch = orchestrator(Arc::clone(&client));
        let done = orch.run(new_task(3), CancellationToken::new()).await;

        assert_eq!(done.status, TaskStatus::AwaitingApproval);
        assert_eq!(done.refinement_count, 1);
        assert_eq!(client.calls_for("assess"), 2);
        assert_eq!(client.calls_for("refine"), 1);
    }

    #[tokio::test]
    async fn cancellation_checked_at_phase_boundary() {
        let client = Arc::new(MockClient::new());
        let orch = orchestrator(Arc::clone(&client));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let done = orch.run(new_task(2), cancel).await;

        assert_eq!(done.status, TaskStatus::Failed);
        assert_eq!(done.last_error.as_deref(), Some("task cancelled"));
        assert_eq!(client.calls_for("research"), 0);
        assert!(done.phase_outputs.is_empty());
    }

    #[tokio::test]
    async fn hard_stop_parks_the_task_without_failing() {
        let client = Arc::new(MockClient::new());
        let orch = orchestrator_with_budget(Arc::clone(&client), 10, BudgetPolicy::HardStop);
        // Prior spend from another task already blew the global budget.
        orch.ledger
            .record(
                Uuid::new_v4(),
                CostEntry {
                    phase: Phase::Draft,
                    model_id: "openai/gpt-4o".into(),
                    provider: "mock".into(),
                    input_tokens: 1,
                    output_tokens: 1,
                    cost_micros: 1000,
                    timestamp: Utc::now(),
                },
            )
            .await;
        let done = orch.run(new_task(2), CancellationToken::new()).await;

        assert_eq!(done.status, TaskStatus::Pending);
        assert!(done.budget_flagged);
        assert!(!done.status.is_terminal());
        assert_eq!(client.calls_for("research"), 0);
    }

    #[tokio::test]
    async fn soft_warn_flags_and_continues() {
        let client = Arc::new(MockClient::new());
        let orch = orchestrator_with_budget(Arc::clone(&client), 10, BudgetPolicy::SoftWarn);
        orch.ledger
            .record(
                Uuid::new_v4(),
                CostEntry {
                    phase: Phase::Draft,
                    model_id: "openai/gpt-4o".into(),
                    provider: "mock".into(),
                    input_tokens: 1,
                    output_tokens: 1,
                    cost_micros: 1000,
                    timestamp: Utc::now(),
                },
            )
            .await;
        let done = orch.run(new_task(2), CancellationToken::new()).await;

        assert_eq!(done.status, TaskStatus::AwaitingApproval);
        assert!(done.budget_flagged);
    }

    #[tokio::test]
    async fn invalid_explicit_selection_fails_before_any_call() {
        let client = Arc::new(MockClient::new());
        let orch = orchestrator(Arc::clone(&client));
        let mut selections = BTreeMap::new();
        selections.insert(
            Phase::Research,
            ModelSelection::Explicit("nobody/mystery-model".to_string()),
        );
        let task = Task::new(
            "topic".to_string(),
            TaskConstraints::default(),
            selections,
            QualityPreference::Fast,
            2,
        )
        .unwrap();
        let done = orch.run(task, CancellationToken::new()).await;

        assert_eq!(done.status, TaskStatus::Failed);
        assert!(done
            .last_error
            .as_deref()
            .unwrap()
            .contains("not permitted"));
        assert_eq!(client.calls_for("research"), 0);
    }
}
