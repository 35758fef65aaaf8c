//! Per-task progress event stream.
//!
//! Observers (the UI collaborator) subscribe by task id; phase executors
//! know nothing about who is watching. Broadcast channels drop events for
//! slow subscribers rather than blocking the pipeline.

use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::task::{Phase, TaskStatus};

const CHANNEL_CAPACITY: usize = 64;

/// One observable step in a task's progress.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    StatusChanged { status: TaskStatus },
    PhaseStarted { phase: Phase, model_id: String },
    PhaseCompleted { phase: Phase, cost_micros: u64 },
    RetryScheduled { phase: Phase, attempt: u32, delay_ms: u64 },
    BudgetWarning { spent_micros: u64, threshold_micros: u64 },
    BudgetStopped { spent_micros: u64, threshold_micros: u64 },
    AwaitingApproval,
    Decided { approved: bool, reviewer_id: String },
    Failed { phase: Option<Phase>, error: String },
}

/// Registry of per-task broadcast channels.
#[derive(Default)]
pub struct EventBus {
    channels: RwLock<HashMap<Uuid, broadcast::Sender<ProgressEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a task's progress stream, creating it if needed.
    pub async fn subscribe(&self, task_id: Uuid) -> broadcast::Receiver<ProgressEvent> {
        let mut channels = self.channels.write().await;
        channels
            .entry(task_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish an event; a task with no subscribers drops it silently.
    pub async fn publish(&self, task_id: Uuid, event: ProgressEvent) {
        let channels = self.channels.read().await;
        if let Some(tx) = channels.get(&task_id) {
            let _ = tx.send(event);
        }
    }

    /// Drop the channel for a finished task. Existing receivers see the
    /// stream end; late subscribers get a fresh, silent channel.
    pub async fn close(&self, task_id: Uuid) {
        self.channels.write().await.remove(&task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let task_id = Uuid::new_v4();
        let mut rx = bus.subscribe(task_id).await;

        bus.publish(
            task_id,
            ProgressEvent::StatusChanged {
                status: TaskStatus::Researching,
            },
        )
        .await;

        match rx.recv().await.unwrap() {
            ProgressEvent::StatusChanged { status } => {
                assert_eq!(status, TaskStatus::Researching)
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn tasks_are_isolated() {
        let bus = EventBus::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut rx_a = bus.subscribe(a).await;
        let _rx_b = bus.subscribe(b).await;

        bus.publish(b, ProgressEvent::AwaitingApproval).await;
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn close_ends_the_stream() {
        let bus = EventBus::new();
        let task_id = Uuid::new_v4();
        let mut rx = bus.subscribe(task_id).await;
        bus.close(task_id).await;
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }
}
