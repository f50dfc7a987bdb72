//! Distributed unit-scan contract.
//!
//! With a [`TaskQueue`] configured, the orchestrator turns every unit into a
//! [`UnitScanTask`] and waits for the matching [`UnitScanResult`]. Both are
//! plain serde values so any transport (message broker, RPC, job table) can
//! carry them; workers call [`execute_task`] to run one.
//!
//! # Security
//! Tasks carry the full [`AdapterConfig`], password included, because workers
//! must reconnect to the source. Only use transports you would trust with the
//! credentials themselves.
//!
//! [`LocalTaskQueue`] is the in-process transport: tasks are JSON-encoded,
//! executed on spawned tokio workers bounded by a semaphore, and their
//! results decoded on the way back.

use crate::Result;
use crate::adapters::{AdapterConfig, AdapterFactory, ScanOptions};
use crate::error::{ErrorKind, ScanError};
use crate::models::{SourceType, Unit};
use crate::report::Match;
use crate::rules::RuleSet;
use crate::scan::scan_unit;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Semaphore, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// One unit-scan shipped to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitScanTask {
    pub task_id: Uuid,
    pub adapter_type: SourceType,
    pub adapter_config: AdapterConfig,
    pub unit: Unit,
    /// Active rule ids, `custom` included when a custom pattern is set
    pub rule_ids: Vec<String>,
    pub scan_options: ScanOptions,
}

/// How a task ended on the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    Matches {
        matches: Vec<Match>,
        records_sampled: u64,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        fields: Vec<String>,
    },
    Failed {
        error_kind: ErrorKind,
        message: String,
    },
}

/// Worker reply for one [`UnitScanTask`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitScanResult {
    pub task_id: Uuid,
    pub unit: String,
    pub outcome: TaskOutcome,
}

/// Handle for a submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskTicket {
    pub task_id: Uuid,
}

/// Transport between the orchestrator and workers.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Hands a task to the transport.
    async fn submit(&self, task: UnitScanTask) -> Result<TaskTicket>;

    /// Resolves once a worker has picked the task up.
    ///
    /// The orchestrator starts the task timeout here, so time spent queued
    /// behind busy workers is not charged to the task. Transports that cannot
    /// observe pickup keep the default, which resolves immediately.
    async fn wait_started(&self, _ticket: &TaskTicket) -> Result<()> {
        Ok(())
    }

    /// Waits for the result of a submitted task.
    ///
    /// An error means the task was lost; the orchestrator bounds this call
    /// with its task timeout.
    async fn wait(&self, ticket: TaskTicket) -> Result<UnitScanResult>;

    /// Withdraws a task whose result is no longer wanted, stopping its worker
    /// if the transport can. The default does nothing.
    async fn cancel(&self, _ticket: &TaskTicket) {}
}

/// Worker-side entry point: rebuilds the adapter and rules a task names,
/// scans the unit, and always answers with a result.
pub async fn execute_task(
    task: &UnitScanTask,
    factory: &dyn AdapterFactory,
    rules: &RuleSet,
) -> UnitScanResult {
    let abort = CancellationToken::new();
    execute_task_until(task, factory, rules, &abort).await
}

/// [`execute_task`] that stops early with a `Cancelled` outcome once `abort`
/// fires. The worker adapter is closed either way.
pub async fn execute_task_until(
    task: &UnitScanTask,
    factory: &dyn AdapterFactory,
    rules: &RuleSet,
    abort: &CancellationToken,
) -> UnitScanResult {
    let outcome = match run_task(task, factory, rules, abort).await {
        Ok(output) => TaskOutcome::Matches {
            matches: output.matches,
            records_sampled: output.records_sampled,
            fields: output.fields,
        },
        Err(e) => {
            tracing::warn!("Task {} for unit '{}' failed: {}", task.task_id, task.unit.name, e);
            TaskOutcome::Failed {
                error_kind: e.kind(),
                message: e.to_string(),
            }
        }
    };

    UnitScanResult {
        task_id: task.task_id,
        unit: task.unit.name.clone(),
        outcome,
    }
}

async fn run_task(
    task: &UnitScanTask,
    factory: &dyn AdapterFactory,
    rules: &RuleSet,
    abort: &CancellationToken,
) -> Result<crate::scan::UnitScanOutput> {
    let active = rules.select_ids(&task.rule_ids, task.scan_options.custom_pattern.as_deref())?;
    let config = task.adapter_config.clone().with_source_type(task.adapter_type);
    let adapter = factory.create(&config)?;

    let scanned = async {
        adapter.connect().await?;
        let scan = scan_unit(adapter.as_ref(), &task.unit, &active, &task.scan_options, abort);
        match task.scan_options.unit_timeout() {
            Some(limit) => tokio::time::timeout(limit, scan).await.map_err(|_| {
                ScanError::timeout(format!("Scan of unit '{}'", task.unit.name), limit)
            })?,
            None => scan.await,
        }
    }
    .await;

    if let Err(e) = adapter.close().await {
        tracing::warn!("Failed to close worker adapter: {}", e);
    }
    scanned
}

/// Bookkeeping for a task submitted to a [`LocalTaskQueue`].
struct PendingTask {
    started: Option<oneshot::Receiver<()>>,
    reply: oneshot::Receiver<String>,
    abort: CancellationToken,
}

/// In-process [`TaskQueue`] backed by spawned tokio workers.
pub struct LocalTaskQueue {
    factory: Arc<dyn AdapterFactory>,
    rules: Arc<RuleSet>,
    workers: Arc<Semaphore>,
    pending: Mutex<HashMap<Uuid, PendingTask>>,
}

impl std::fmt::Debug for LocalTaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTaskQueue")
            .field("idle_workers", &self.workers.available_permits())
            .finish_non_exhaustive()
    }
}

impl LocalTaskQueue {
    /// Creates a queue running at most `workers` tasks at once.
    pub fn new(factory: Arc<dyn AdapterFactory>, rules: Arc<RuleSet>, workers: usize) -> Self {
        Self {
            factory,
            rules,
            workers: Arc::new(Semaphore::new(workers.max(1))),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn pending_tasks(&self) -> usize {
        self.lock_pending().len()
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<Uuid, PendingTask>> {
        match self.pending.lock() {
            Ok(pending) => pending,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl TaskQueue for LocalTaskQueue {
    async fn submit(&self, task: UnitScanTask) -> Result<TaskTicket> {
        let ticket = TaskTicket {
            task_id: task.task_id,
        };
        let encoded = serde_json::to_string(&task).map_err(|e| ScanError::Serialization {
            context: format!("Failed to encode task {}", task.task_id),
            source: e,
        })?;

        let (started_tx, started_rx) = oneshot::channel();
        let (reply_tx, reply_rx) = oneshot::channel();
        let abort = CancellationToken::new();
        self.lock_pending().insert(
            ticket.task_id,
            PendingTask {
                started: Some(started_rx),
                reply: reply_rx,
                abort: abort.clone(),
            },
        );

        let factory = Arc::clone(&self.factory);
        let rules = Arc::clone(&self.rules);
        let workers = Arc::clone(&self.workers);
        tokio::spawn(async move {
            let permit = tokio::select! {
                biased;
                _ = abort.cancelled() => return,
                permit = workers.acquire_owned() => permit,
            };
            let Ok(_permit) = permit else {
                return;
            };
            let task: UnitScanTask = match serde_json::from_str(&encoded) {
                Ok(task) => task,
                Err(e) => {
                    tracing::error!("Worker could not decode task: {}", e);
                    return;
                }
            };
            let _ = started_tx.send(());

            let result = execute_task_until(&task, factory.as_ref(), &rules, &abort).await;
            match serde_json::to_string(&result) {
                Ok(reply) => {
                    let _ = reply_tx.send(reply);
                }
                Err(e) => tracing::error!("Worker could not encode result: {}", e),
            }
        });

        Ok(ticket)
    }

    async fn wait_started(&self, ticket: &TaskTicket) -> Result<()> {
        let started = self
            .lock_pending()
            .get_mut(&ticket.task_id)
            .ok_or_else(|| unknown_ticket(ticket))?
            .started
            .take();

        match started {
            Some(started) => started.await.map_err(|_| {
                ScanError::unit_scan(
                    ticket.task_id.to_string(),
                    "worker dropped the task before starting it",
                )
            }),
            None => Ok(()),
        }
    }

    async fn wait(&self, ticket: TaskTicket) -> Result<UnitScanResult> {
        let pending = self
            .lock_pending()
            .remove(&ticket.task_id)
            .ok_or_else(|| unknown_ticket(&ticket))?;

        let reply = pending.reply.await.map_err(|_| {
            ScanError::unit_scan(
                ticket.task_id.to_string(),
                "worker dropped the task without replying",
            )
        })?;

        serde_json::from_str(&reply).map_err(|e| ScanError::Serialization {
            context: format!("Failed to decode result of task {}", ticket.task_id),
            source: e,
        })
    }

    async fn cancel(&self, ticket: &TaskTicket) {
        if let Some(pending) = self.lock_pending().remove(&ticket.task_id) {
            tracing::debug!("Cancelling task {}", ticket.task_id);
            pending.abort.cancel();
        }
    }
}

fn unknown_ticket(ticket: &TaskTicket) -> ScanError {
    ScanError::configuration(format!("Unknown task ticket {}", ticket.task_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_serialization_tags() {
        let failed = TaskOutcome::Failed {
            error_kind: ErrorKind::ConnectionError,
            message: "refused".to_string(),
        };
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["error_kind"], "ConnectionError");

        let ok = TaskOutcome::Matches {
            matches: Vec::new(),
            records_sampled: 3,
            fields: Vec::new(),
        };
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["status"], "matches");
        assert!(json.get("fields").is_none());
    }

    #[test]
    fn test_task_carries_credentials_through_json() {
        let task = UnitScanTask {
            task_id: Uuid::new_v4(),
            adapter_type: SourceType::PostgreSQL,
            adapter_config: AdapterConfig::from_url("postgres://db.internal/app")
                .with_credentials("scanner", Some("s3cret".to_string())),
            unit: Unit::table(Some("public"), "users"),
            rule_ids: vec!["email".to_string()],
            scan_options: ScanOptions::default(),
        };
        let json = serde_json::to_string(&task).unwrap();
        let back: UnitScanTask = serde_json::from_str(&json).unwrap();
        assert_eq!(back.adapter_config.password.as_deref(), Some("s3cret"));
        assert_eq!(back.unit, task.unit);
    }

    #[tokio::test]
    async fn test_execute_task_reports_unknown_rule() {
        let task = UnitScanTask {
            task_id: Uuid::new_v4(),
            adapter_type: SourceType::Filesystem,
            adapter_config: AdapterConfig::filesystem("/nonexistent"),
            unit: Unit::directory(".", "/nonexistent"),
            rule_ids: vec!["no_such_rule".to_string()],
            scan_options: ScanOptions::default(),
        };
        let rules = RuleSet::builtin().unwrap();
        let result = execute_task(&task, &crate::adapters::DefaultAdapterFactory, &rules).await;
        assert_eq!(result.task_id, task.task_id);
        assert!(matches!(
            result.outcome,
            TaskOutcome::Failed {
                error_kind: ErrorKind::ConfigurationError,
                ..
            }
        ));
    }

    fn directory_task(dir: &std::path::Path) -> UnitScanTask {
        UnitScanTask {
            task_id: Uuid::new_v4(),
            adapter_type: SourceType::Filesystem,
            adapter_config: AdapterConfig::filesystem(dir.to_string_lossy()),
            unit: Unit::directory(".", dir),
            rule_ids: vec!["email".to_string()],
            scan_options: ScanOptions::default(),
        }
    }

    fn local_queue(workers: usize) -> LocalTaskQueue {
        LocalTaskQueue::new(
            Arc::new(crate::adapters::DefaultAdapterFactory),
            Arc::new(RuleSet::builtin().unwrap()),
            workers,
        )
    }

    #[tokio::test]
    async fn test_local_queue_reports_start_then_result() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("users.csv"), "a@example.com\nb@example.com\n").unwrap();
        let queue = local_queue(1);

        let ticket = queue.submit(directory_task(dir.path())).await?;
        queue.wait_started(&ticket).await?;
        // a second call after pickup resolves at once
        queue.wait_started(&ticket).await?;
        let result = queue.wait(ticket).await?;

        match result.outcome {
            TaskOutcome::Matches { matches, .. } => assert_eq!(matches[0].count, 2),
            other => panic!("expected matches, got {:?}", other),
        }
        assert_eq!(queue.pending_tasks(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_withdraws_task() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let queue = local_queue(1);

        let ticket = queue.submit(directory_task(dir.path())).await?;
        assert_eq!(queue.pending_tasks(), 1);
        queue.cancel(&ticket).await;

        assert_eq!(queue.pending_tasks(), 0);
        assert!(queue.wait(ticket).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_execute_task_until_stops_when_aborted() {
        let dir = tempfile::tempdir().unwrap();
        let abort = CancellationToken::new();
        abort.cancel();

        let rules = RuleSet::builtin().unwrap();
        let result = execute_task_until(
            &directory_task(dir.path()),
            &crate::adapters::DefaultAdapterFactory,
            &rules,
            &abort,
        )
        .await;

        assert!(matches!(
            result.outcome,
            TaskOutcome::Failed {
                error_kind: ErrorKind::Cancelled,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_wait_unknown_ticket_is_error() {
        let queue = LocalTaskQueue::new(
            Arc::new(crate::adapters::DefaultAdapterFactory),
            Arc::new(RuleSet::builtin().unwrap()),
            2,
        );
        let ticket = TaskTicket {
            task_id: Uuid::new_v4(),
        };
        assert!(queue.wait(ticket).await.is_err());
        assert_eq!(queue.pending_tasks(), 0);
    }
}
