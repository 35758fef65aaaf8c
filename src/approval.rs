//! Human approval gateway.
//!
//! Tasks park at the approval gate until a reviewer decides. Approval
//! publishes the finalized article to the external channel and only then
//! mutates the task, so a publish failure leaves it parked and the
//! decision retryable. Decisions are serialized through one mutex; a
//! second decision on the same task gets a conflict, never a second
//! publish.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::EngineError;
use crate::events::{EventBus, ProgressEvent};
use crate::store::TaskStore;
use crate::task::{ApprovalStatus, Phase, Task, TaskStatus, TaskSummary};

/// A reviewer's verdict on a finished piece.
#[derive(Debug, Clone, Deserialize)]
pub struct Decision {
    pub approved: bool,
    pub reviewer_id: String,
    #[serde(default)]
    pub notes: Option<String>,
}

/// What the external channel handed back for a published piece.
#[derive(Debug, Clone)]
pub struct PublishReceipt {
    pub external_id: String,
    pub url: Option<String>,
}

/// External publication channel. Called at most once per task.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, task: &Task) -> Result<PublishReceipt, EngineError>;
}

/// Publishes by POSTing the finalized article to a configured endpoint.
pub struct WebhookPublisher {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl WebhookPublisher {
    pub fn new(endpoint: String, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            token,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WebhookResponse {
    id: String,
    #[serde(default)]
    url: Option<String>,
}

#[async_trait]
impl Publisher for WebhookPublisher {
    async fn publish(&self, task: &Task) -> Result<PublishReceipt, EngineError> {
        let content = task
            .phase_outputs
            .get(Phase::Finalize)
            .ok_or_else(|| EngineError::Publish("no finalized content to publish".to_string()))?;
        let body = serde_json::json!({
            "task_id": task.id,
            "topic": task.topic,
            "content": content,
            "image": task.phase_outputs.get(Phase::Image),
        });

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| EngineError::Publish(format!("publish request failed: {}", e)))?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(EngineError::Publish(format!(
                "publish endpoint returned {}: {}",
                status, detail
            )));
        }
        let receipt: WebhookResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Publish(format!("malformed publish response: {}", e)))?;
        Ok(PublishReceipt {
            external_id: receipt.id,
            url: receipt.url,
        })
    }
}

/// Fallback when no publish endpoint is configured: approval just marks
/// the task published locally.
pub struct LogPublisher;

#[async_trait]
impl Publisher for LogPublisher {
    async fn publish(&self, task: &Task) -> Result<PublishReceipt, EngineError> {
        info!(task_id = %task.id, topic = %task.topic, "No publish endpoint configured, recording approval locally");
        Ok(PublishReceipt {
            external_id: task.id.to_string(),
            url: None,
        })
    }
}

/// Applies reviewer decisions to parked tasks.
pub struct ApprovalGateway {
    store: TaskStore,
    events: Arc<EventBus>,
    publisher: Arc<dyn Publisher>,
    // Serializes concurrent decisions on the same queue.
    decide_lock: tokio::sync::Mutex<()>,
}

impl ApprovalGateway {
    pub fn new(store: TaskStore, events: Arc<EventBus>, publisher: Arc<dyn Publisher>) -> Self {
        Self {
            store,
            events,
            publisher,
            decide_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Tasks parked at the gate, oldest first.
    pub async fn queue(&self) -> Result<Vec<TaskSummary>, EngineError> {
        let tasks = self.store.list_awaiting_approval().await?;
        Ok(tasks.iter().map(Task::summary).collect())
    }

    /// Apply one reviewer decision.
    ///
    /// Approve publishes first and records the external id; reject closes
    /// the task with the reviewer's notes. Either way the outcome is
    /// final, and a repeat decision gets a conflict.
    pub async fn decide(&self, task_id: Uuid, decision: Decision) -> Result<Task, EngineError> {
        let _guard = self.decide_lock.lock().await;

        let mut task = self
            .store
            .get(task_id)
            .await?
            .ok_or(EngineError::NotFound(task_id))?;
        if task.status != TaskStatus::AwaitingApproval {
            return Err(EngineError::Conflict(format!(
                "task is {}, not awaiting approval",
                task.status
            )));
        }

        if decision.approved {
            let receipt = self.publisher.publish(&task).await.map_err(|e| {
                warn!(task_id = %task_id, "Publish failed, task stays parked: {}", e);
                e
            })?;
            task.external_id = Some(receipt.external_id);
            task.published_url = receipt.url;
            task.transition(TaskStatus::Approved)?;
            task.approval_status = ApprovalStatus::Approved;
            task.approved_by = Some(decision.reviewer_id.clone());
            task.approval_timestamp = Some(Utc::now());
            info!(
                task_id = %task_id,
                reviewer = %decision.reviewer_id,
                external_id = task.external_id.as_deref().unwrap_or(""),
                "Task approved and published"
            );
        } else {
            task.transition(TaskStatus::Rejected)?;
            task.approval_status = ApprovalStatus::Rejected;
            info!(task_id = %task_id, reviewer = %decision.reviewer_id, "Task rejected");
        }
        // A rejection keeps only the reviewer's notes; the approval
        // attribution fields stay empty.
        task.human_feedback = decision.notes;

        self.store.upsert(&task).await?;
        self.events
            .publish(
                task_id,
                ProgressEvent::Decided {
                    approved: decision.approved,
                    reviewer_id: decision.reviewer_id,
                },
            )
            .await;
        self.events.close(task_id).await;
        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{QualityPreference, TaskConstraints};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingPublisher {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingPublisher {
        fn new(fail: bool) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail,
            }
        }
    }

    #[async_trait]
    impl Publisher for CountingPublisher {
        async fn publish(&self, _task: &Task) -> Result<PublishReceipt, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(EngineError::Publish("endpoint down".to_string()));
            }
            Ok(PublishReceipt {
                external_id: "ext-42".to_string(),
                url: Some("https://example.com/posts/42".to_string()),
            })
        }
    }

    async fn parked_task(store: &TaskStore) -> Task {
        let mut t = Task::new(
            "tidal energy".to_string(),
            TaskConstraints::default(),
            BTreeMap::new(),
            QualityPreference::Fast,
            2,
        )
        .unwrap();
        for (status, phase) in [
            (TaskStatus::Researching, Phase::Research),
            (TaskStatus::Outlining, Phase::Outline),
            (TaskStatus::Drafting, Phase::Draft),
            (TaskStatus::Assessing, Phase::Assess),
        ] {
            t.transition(status).unwrap();
            t.record_output(phase, format!("{} text", phase)).unwrap();
        }
        t.transition(TaskStatus::Finalizing).unwrap();
        t.transition(TaskStatus::GeneratingImage).unwrap();
        t.record_output(Phase::Image, "image prompt".into()).unwrap();
        t.record_output(Phase::Finalize, "final article".into())
            .unwrap();
        t.transition(TaskStatus::AwaitingApproval).unwrap();
        store.upsert(&t).await.unwrap();
        t
    }

    fn gateway(store: TaskStore, publisher: Arc<CountingPublisher>) -> ApprovalGateway {
        ApprovalGateway::new(store, Arc::new(EventBus::new()), publisher)
    }

    fn approve(reviewer: &str) -> Decision {
        Decision {
            approved: true,
            reviewer_id: reviewer.to_string(),
            notes: None,
        }
    }

    #[tokio::test]
    async fn approval_publishes_exactly_once_and_records_receipt() {
        let store = TaskStore::open_in_memory().unwrap();
        let task = parked_task(&store).await;
        let publisher = Arc::new(CountingPublisher::new(false));
        let gate = gateway(store.clone(), Arc::clone(&publisher));

        let decided = gate.decide(task.id, approve("sam")).await.unwrap();
        assert_eq!(decided.status, TaskStatus::Approved);
        assert_eq!(decided.approval_status, ApprovalStatus::Approved);
        assert_eq!(decided.external_id.as_deref(), Some("ext-42"));
        assert_eq!(
            decided.published_url.as_deref(),
            Some("https://example.com/posts/42")
        );
        assert_eq!(decided.approved_by.as_deref(), Some("sam"));
        assert_eq!(publisher.calls.load(Ordering::SeqCst), 1);

        // A second decision conflicts and never re-publishes.
        let err = gate.decide(task.id, approve("sam")).await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
        assert_eq!(publisher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rejection_closes_without_publishing() {
        let store = TaskStore::open_in_memory().unwrap();
        let task = parked_task(&store).await;
        let publisher = Arc::new(CountingPublisher::new(false));
        let gate = gateway(store.clone(), Arc::clone(&publisher));

        let decided = gate
            .decide(
                task.id,
                Decision {
                    approved: false,
                    reviewer_id: "sam".to_string(),
                    notes: Some("tone is off".to_string()),
                },
            )
            .await
            .unwrap();
        assert_eq!(decided.status, TaskStatus::Rejected);
        assert_eq!(decided.human_feedback.as_deref(), Some("tone is off"));
        assert!(decided.external_id.is_none());
        // Approval attribution is only written on approve.
        assert!(decided.approved_by.is_none());
        assert!(decided.approval_timestamp.is_none());
        assert_eq!(publisher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn publish_failure_leaves_task_parked() {
        let store = TaskStore::open_in_memory().unwrap();
        let task = parked_task(&store).await;
        let publisher = Arc::new(CountingPublisher::new(true));
        let gate = gateway(store.clone(), Arc::clone(&publisher));

        let err = gate.decide(task.id, approve("sam")).await.unwrap_err();
        assert!(matches!(err, EngineError::Publish(_)));

        // Still awaiting approval; the decision can be retried later.
        let stored = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::AwaitingApproval);
        assert!(stored.external_id.is_none());
    }

    #[tokio::test]
    async fn deciding_an_active_task_conflicts() {
        let store = TaskStore::open_in_memory().unwrap();
        let mut t = Task::new(
            "geothermal".to_string(),
            TaskConstraints::default(),
            BTreeMap::new(),
            QualityPreference::Fast,
            2,
        )
        .unwrap();
        t.transition(TaskStatus::Researching).unwrap();
        store.upsert(&t).await.unwrap();
        let gate = gateway(store, Arc::new(CountingPublisher::new(false)));

        let err = gate.decide(t.id, approve("sam")).await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let store = TaskStore::open_in_memory().unwrap();
        let gate = gateway(store, Arc::new(CountingPublisher::new(false)));
        let err = gate.decide(Uuid::new_v4(), approve("sam")).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn queue_lists_parked_tasks() {
        let store = TaskStore::open_in_memory().unwrap();
        let parked = parked_task(&store).await;
        let active = Task::new(
            "microgrids".to_string(),
            TaskConstraints::default(),
            BTreeMap::new(),
            QualityPreference::Fast,
            2,
        )
        .unwrap();
        store.upsert(&active).await.unwrap();
        let gate = gateway(store, Arc::new(CountingPublisher::new(false)));

        let queue = gate.queue().await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].id, parked.id);
    }
}
