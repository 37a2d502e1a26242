/*
 * BMS Equipment Control Orchestrator
 * Licensed under the GNU General Public License, version 3 or later.
 */

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock, Semaphore};
use uuid::Uuid;

use crate::control::{CommandSource, NeuralCommand, Value};
use crate::equipment::{EquipmentId, LocationId};
use crate::gateway::timeseries::TimeSeriesGateway;
use crate::state_store::StateStore;

pub type JobId = String;

/// Bounded concurrency for the `equipment-controls` queue (§4.10), independent
/// of the tick-driven per-location pool.
const QUEUE_CONCURRENCY: usize = 5;
const QUEUE_CAPACITY: usize = 1024;

/// Immutable once enqueued (§3 "UI command"). The `priority` field is carried
/// through and persisted but does not influence queue order (§9 open
/// question, resolved as advisory-only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiCommand {
    pub equipment_id: EquipmentId,
    pub location_id: LocationId,
    pub user_id: String,
    pub user_name: String,
    pub command: String,
    pub settings: HashMap<String, Value>,
    pub priority: Option<i64>,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub status: JobStatus,
    pub progress: u8,
    pub message: Option<String>,
}

impl JobRecord {
    fn pending() -> Self {
        JobRecord {
            status: JobStatus::Pending,
            progress: 0,
            message: None,
        }
    }
}

struct QueueItem {
    job_id: JobId,
    command: UiCommand,
}

/// C10: one logical queue, drained by a bounded-concurrency worker pool
/// (§4.10, §4.11 "independent pool"). `enqueue` never blocks the caller past
/// the channel send; job progress is polled via `status`.
pub struct UiCommandQueue {
    sender: mpsc::Sender<QueueItem>,
    jobs: Arc<RwLock<HashMap<JobId, JobRecord>>>,
}

impl UiCommandQueue {
    pub fn start(timeseries: Arc<TimeSeriesGateway>, state: Arc<StateStore>) -> Self {
        let (sender, receiver) = mpsc::channel(QUEUE_CAPACITY);
        let jobs = Arc::new(RwLock::new(HashMap::new()));
        let worker = Worker {
            timeseries,
            state,
            jobs: Arc::clone(&jobs),
        };
        tokio::spawn(worker.run(receiver));
        UiCommandQueue { sender, jobs }
    }

    /// Enqueues a command and returns its job id immediately (§4.11, the
    /// Command API's `{jobId}` response).
    pub async fn enqueue(&self, command: UiCommand) -> JobId {
        let job_id = Uuid::new_v4().to_string();
        self.jobs.write().await.insert(job_id.clone(), JobRecord::pending());
        let item = QueueItem {
            job_id: job_id.clone(),
            command,
        };
        if self.sender.send(item).await.is_err() {
            warn!("ui command queue closed, job {job_id} will never be processed");
            if let Some(record) = self.jobs.write().await.get_mut(&job_id) {
                record.status = JobStatus::Failed;
                record.message = Some("queue unavailable".to_string());
            }
        }
        job_id
    }

    pub async fn status(&self, job_id: &str) -> Option<JobRecord> {
        self.jobs.read().await.get(job_id).cloned()
    }
}

struct Worker {
    timeseries: Arc<TimeSeriesGateway>,
    state: Arc<StateStore>,
    jobs: Arc<RwLock<HashMap<JobId, JobRecord>>>,
}

impl Worker {
    async fn run(self, mut receiver: mpsc::Receiver<QueueItem>) {
        let semaphore = Arc::new(Semaphore::new(QUEUE_CONCURRENCY));
        while let Some(item) = receiver.recv().await {
            let permit = Arc::clone(&semaphore);
            let timeseries = Arc::clone(&self.timeseries);
            let state = Arc::clone(&self.state);
            let jobs = Arc::clone(&self.jobs);
            tokio::spawn(async move {
                let _permit = permit.acquire_owned().await;
                apply(&timeseries, &state, &jobs, item.job_id, item.command).await;
            });
        }
    }
}

/// The three-step apply sequence from §4.10, with progress checkpoints at
/// 40%, 70%, and 100%.
async fn apply(
    timeseries: &TimeSeriesGateway,
    state: &StateStore,
    jobs: &RwLock<HashMap<JobId, JobRecord>>,
    job_id: JobId,
    command: UiCommand,
) {
    set_status(jobs, &job_id, JobStatus::Processing, 0, None).await;

    if let Err(err) = timeseries
        .write_ui_command(
            &command.equipment_id,
            &command.location_id,
            &command.user_id,
            &command.command,
            &command.settings,
        )
        .await
    {
        fail(jobs, &job_id, format!("failed to write UI command: {err}")).await;
        return;
    }
    set_status(jobs, &job_id, JobStatus::Processing, 40, None).await;

    state
        .record_ui_command(
            &command.equipment_id,
            command.command.clone(),
            command.user_name.clone(),
            command.settings.clone(),
        )
        .await;
    set_status(jobs, &job_id, JobStatus::Processing, 70, None).await;

    let audit = settings_to_audit_batch(&command);
    if let Err(err) = timeseries.write_commands(&audit).await {
        fail(jobs, &job_id, format!("failed to write audit record: {err}")).await;
        return;
    }

    set_status(jobs, &job_id, JobStatus::Completed, 100, None).await;
}

fn settings_to_audit_batch(command: &UiCommand) -> Vec<NeuralCommand> {
    let kind = crate::equipment::EquipmentKind::FanCoil;
    if command.settings.is_empty() {
        return vec![NeuralCommand::new(
            command.equipment_id.clone(),
            command.location_id.clone(),
            kind,
            command.command.clone(),
            Value::Bool(true),
            CommandSource::UiCommand,
        )];
    }
    command
        .settings
        .iter()
        .map(|(name, value)| {
            NeuralCommand::new(
                command.equipment_id.clone(),
                command.location_id.clone(),
                kind,
                name.clone(),
                value.clone(),
                CommandSource::UiCommand,
            )
        })
        .collect()
}

async fn set_status(
    jobs: &RwLock<HashMap<JobId, JobRecord>>,
    job_id: &str,
    status: JobStatus,
    progress: u8,
    message: Option<String>,
) {
    if let Some(record) = jobs.write().await.get_mut(job_id) {
        record.status = status;
        record.progress = progress;
        record.message = message;
    }
}

async fn fail(jobs: &RwLock<HashMap<JobId, JobRecord>>, job_id: &str, message: String) {
    warn!("ui command job {job_id} failed: {message}");
    set_status(jobs, job_id, JobStatus::Failed, 0, Some(message)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::timeseries::GatewayConfig;
    use crate::state_store::InMemorySharedCache;
    use std::time::Duration;

    fn test_gateway() -> Arc<TimeSeriesGateway> {
        Arc::new(TimeSeriesGateway::new(GatewayConfig {
            base_url: "http://127.0.0.1:0".to_string(),
            query_timeout: Duration::from_millis(50),
            write_timeout: Duration::from_millis(50),
            max_retries: 0,
            retry_delay: Duration::from_millis(1),
            deadline: Duration::from_millis(100),
        }))
    }

    #[tokio::test]
    async fn unknown_job_id_returns_none() {
        let queue = UiCommandQueue::start(test_gateway(), Arc::new(StateStore::new(Arc::new(InMemorySharedCache::new()))));
        assert!(queue.status("does-not-exist").await.is_none());
    }

    #[tokio::test]
    async fn enqueue_assigns_a_pending_job() {
        let queue = UiCommandQueue::start(test_gateway(), Arc::new(StateStore::new(Arc::new(InMemorySharedCache::new()))));
        let command = UiCommand {
            equipment_id: "eq-1".to_string(),
            location_id: "4".to_string(),
            user_id: "user-1".to_string(),
            user_name: "Alex".to_string(),
            command: "setMode".to_string(),
            settings: HashMap::new(),
            priority: None,
            enqueued_at: Utc::now(),
        };
        let job_id = queue.enqueue(command).await;
        let record = queue.status(&job_id).await;
        assert!(record.is_some());
    }

    #[test]
    fn audit_batch_has_one_entry_per_setting() {
        let mut settings = HashMap::new();
        settings.insert("heatingSetpoint".to_string(), Value::Number(72.0));
        settings.insert("mode".to_string(), Value::Text("auto".to_string()));
        let command = UiCommand {
            equipment_id: "eq-1".to_string(),
            location_id: "4".to_string(),
            user_id: "user-1".to_string(),
            user_name: "Alex".to_string(),
            command: "setMode".to_string(),
            settings,
            priority: None,
            enqueued_at: Utc::now(),
        };
        let batch = settings_to_audit_batch(&command);
        assert_eq!(batch.len(), 2);
        assert!(batch.iter().all(|c| c.source == CommandSource::UiCommand));
    }
}
