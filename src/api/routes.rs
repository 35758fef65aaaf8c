//! HTTP route handlers.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, Sse},
        Json,
    },
    routing::{get, post},
    Router,
};
use futures::stream::Stream;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::approval::{ApprovalGateway, Decision, LogPublisher, Publisher, WebhookPublisher};
use crate::config::Config;
use crate::error::EngineError;
use crate::events::EventBus;
use crate::ledger::{BudgetReport, BudgetScope, CostLedger};
use crate::llm::OpenRouterClient;
use crate::orchestrator::Orchestrator;
use crate::selector::ModelCatalog;
use crate::store::{Page, TaskStore};
use crate::task::{Task, TaskSummary};

use super::types::*;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub store: TaskStore,
    pub catalog: Arc<ModelCatalog>,
    pub ledger: Arc<CostLedger>,
    pub events: Arc<EventBus>,
    pub orchestrator: Arc<Orchestrator>,
    pub approvals: ApprovalGateway,
    /// Cancellation tokens for in-flight runs, removed when a run ends.
    pub running: RwLock<HashMap<Uuid, CancellationToken>>,
}

type ApiError = (StatusCode, String);

fn engine_error(err: EngineError) -> ApiError {
    let status = match &err {
        EngineError::Validation(_) | EngineError::Task(_) => StatusCode::BAD_REQUEST,
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::Conflict(_) => StatusCode::CONFLICT,
        EngineError::BudgetExceeded { .. } => StatusCode::CONFLICT,
        EngineError::Publish(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string())
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let client = Arc::new(OpenRouterClient::new(config.openrouter_api_key.clone()));
    let store = TaskStore::open(&config.db_path)?;
    let catalog = Arc::new(ModelCatalog::default());
    let ledger = Arc::new(CostLedger::new(config.budget.clone()));
    let events = Arc::new(EventBus::new());

    let orchestrator = Arc::new(Orchestrator::new(
        client,
        Arc::clone(&catalog),
        Arc::clone(&ledger),
        store.clone(),
        Arc::clone(&events),
        config.retry.clone(),
    ));

    let publisher: Arc<dyn Publisher> = match &config.publish_url {
        Some(url) => Arc::new(WebhookPublisher::new(
            url.clone(),
            config.publish_token.clone(),
        )),
        None => Arc::new(LogPublisher),
    };
    let approvals = ApprovalGateway::new(store.clone(), Arc::clone(&events), publisher);

    let state = Arc::new(AppState {
        config: config.clone(),
        store,
        catalog,
        ledger,
        events,
        orchestrator,
        approvals,
        running: RwLock::new(HashMap::new()),
    });

    let app = router(Arc::clone(&state));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    let shutdown_state = Arc::clone(&state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal(shutdown_state).await;
        })
        .await?;

    Ok(())
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/tasks", post(create_task))
        .route("/api/tasks", get(list_tasks))
        .route("/api/tasks/:id", get(get_task))
        .route("/api/tasks/:id/stream", get(stream_task))
        .route("/api/tasks/:id/costs", get(get_costs))
        .route("/api/tasks/:id/cancel", post(cancel_task))
        .route("/api/tasks/:id/decision", post(decide_task))
        .route("/api/approvals", get(list_approvals))
        .route("/api/budget", get(get_budget))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Wait for SIGTERM/SIGINT, then cancel in-flight runs so they park at a
/// phase boundary before the process exits.
async fn shutdown_signal(state: Arc<AppState>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    let running = state.running.read().await;
    if !running.is_empty() {
        tracing::info!(
            "Shutdown signal received, cancelling {} running task(s)",
            running.len()
        );
        for token in running.values() {
            token.cancel();
        }
    }
    tracing::info!("Graceful shutdown complete");
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Create a task and start its pipeline run in the background.
async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<Json<CreateTaskResponse>, ApiError> {
    let quality = req.quality_preference.unwrap_or_default();
    let constraints = req.constraints();

    // Validates every explicit selection up front; a bad model id is a 400
    // here, never a mid-pipeline failure.
    let estimated_cost_micros = state
        .catalog
        .preview_pipeline_cost(&req.model_selections, quality, &constraints)
        .map_err(|e| engine_error(e.into()))?;

    let task = Task::new(
        req.topic,
        constraints,
        req.model_selections,
        quality,
        req.max_refinements
            .unwrap_or(state.config.default_max_refinements),
    )
    .map_err(|e| engine_error(e.into()))?;
    state
        .store
        .upsert(&task)
        .await
        .map_err(|e| engine_error(e.into()))?;

    let id = task.id;
    let status = task.status;
    let cancel = CancellationToken::new();
    state.running.write().await.insert(id, cancel.clone());

    let orchestrator = Arc::clone(&state.orchestrator);
    let state_clone = Arc::clone(&state);
    tokio::spawn(async move {
        orchestrator.run(task, cancel).await;
        state_clone.running.write().await.remove(&id);
    });

    Ok(Json(CreateTaskResponse {
        id,
        status,
        estimated_cost_micros,
    }))
}

async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Task>, ApiError> {
    state
        .store
        .get(id)
        .await
        .map_err(|e| engine_error(e.into()))?
        .map(Json)
        .ok_or_else(|| engine_error(EngineError::NotFound(id)))
}

async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListTasksQuery>,
) -> Result<Json<Page<TaskSummary>>, ApiError> {
    state
        .store
        .list(
            query.status,
            query.page.unwrap_or(1),
            query.per_page.unwrap_or(50),
        )
        .await
        .map(Json)
        .map_err(|e| engine_error(e.into()))
}

/// Stream task progress via SSE.
async fn stream_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>>, ApiError> {
    let task = state
        .store
        .get(id)
        .await
        .map_err(|e| engine_error(e.into()))?
        .ok_or_else(|| engine_error(EngineError::NotFound(id)))?;

    let mut rx = state.events.subscribe(id).await;
    let snapshot = task.summary();

    let stream = async_stream::stream! {
        // Current state first, so a late subscriber is not blind until the
        // next transition.
        if let Ok(event) = Event::default().event("snapshot").json_data(&snapshot) {
            yield Ok(event);
        }
        loop {
            match rx.recv().await {
                Ok(progress) => {
                    if let Ok(event) = Event::default().event("progress").json_data(&progress) {
                        yield Ok(event);
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(task_id = %id, skipped, "SSE subscriber lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Ok(Sse::new(stream))
}

async fn get_costs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<CostsResponse>, ApiError> {
    let task = state
        .store
        .get(id)
        .await
        .map_err(|e| engine_error(e.into()))?
        .ok_or_else(|| engine_error(EngineError::NotFound(id)))?;

    Ok(Json(CostsResponse {
        task_id: id,
        total_micros: task.total_cost_micros(),
        by_phase: state.ledger.breakdown_by_phase(id).await,
        by_model: state.ledger.breakdown_by_model(id).await,
        entries: task.cost_entries,
    }))
}

/// Cancel a running task; observed at the next phase boundary.
async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let running = state.running.read().await;
    match running.get(&id) {
        Some(token) => {
            token.cancel();
            Ok(Json(serde_json::json!({ "cancelled": true })))
        }
        None => {
            drop(running);
            // Distinguish "no such task" from "not running".
            match state
                .store
                .get(id)
                .await
                .map_err(|e| engine_error(e.into()))?
            {
                Some(task) => Err(engine_error(EngineError::Conflict(format!(
                    "task is {}, not running",
                    task.status
                )))),
                None => Err(engine_error(EngineError::NotFound(id))),
            }
        }
    }
}

async fn list_approvals(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<TaskSummary>>, ApiError> {
    state
        .approvals
        .queue()
        .await
        .map(Json)
        .map_err(engine_error)
}

async fn decide_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(decision): Json<Decision>,
) -> Result<Json<Task>, ApiError> {
    state
        .approvals
        .decide(id, decision)
        .await
        .map(Json)
        .map_err(engine_error)
}

async fn get_budget(State(state): State<Arc<AppState>>) -> Json<BudgetReport> {
    let period = state.ledger.budget_config().period;
    Json(state.ledger.budget_status(BudgetScope::Global, period).await)
}
