//! Scan orchestration.
//!
//! [`ScanOrchestrator`] drives one scan invocation through
//! `Created → Enumerating → Scanning → Aggregating → Completed | Failed`:
//! it validates options, connects, enumerates units, dispatches unit-scans
//! (sequentially, bounded-parallel or through a [`TaskQueue`]), isolates
//! per-unit failures and merges everything into a [`Report`].
//!
//! # Cancellation
//! Cancelling the token from [`ScanOrchestrator::cancellation_token`] (or
//! hitting `scan_timeout_secs`) stops dispatching. Unit-scans already running
//! get `cancel_grace_ms` to finish and are then dropped, which releases their
//! connections. Aborted and undispatched units are reported as `Cancelled`.

mod aggregate;
mod unit;

pub use aggregate::ReportBuilder;
pub use unit::{UnitAccumulator, UnitScanOutput, scan_unit};

use crate::Result;
use crate::adapters::{ScanOptions, SourceAdapter, UnitFilter};
use crate::distributed::{TaskOutcome, TaskQueue, UnitScanTask};
use crate::error::{ErrorKind, ScanError};
use crate::events::{NoopSink, ScanEvent, ScanEventSink};
use crate::models::Unit;
use crate::report::{Report, UnitFailure};
use crate::rules::{ActiveRules, RuleSet};
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::Sleep;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Default wait for one distributed task.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(300);

/// Lifecycle state of a scan invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    Created,
    Enumerating,
    Scanning,
    Aggregating,
    Completed,
    Failed,
}

impl ScanState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Result of one unit-scan as seen by the aggregation loop.
#[derive(Debug)]
pub struct UnitResult {
    pub unit: String,
    pub outcome: std::result::Result<UnitScanOutput, UnitFailure>,
}

impl UnitResult {
    fn failed(unit: &Unit, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            unit: unit.name.clone(),
            outcome: Err(UnitFailure {
                unit: unit.name.clone(),
                error_kind: kind,
                message: message.into(),
            }),
        }
    }

    fn from_error(unit: &Unit, error: &ScanError) -> Self {
        Self::failed(unit, error.kind(), error.to_string())
    }
}

/// Coordinates one scan over one adapter.
///
/// The adapter is connected at the start of [`scan`](Self::scan) and closed
/// on every exit path, so an orchestrator runs a single scan.
pub struct ScanOrchestrator {
    adapter: Arc<dyn SourceAdapter>,
    rules: Arc<RuleSet>,
    events: Arc<dyn ScanEventSink>,
    queue: Option<(Arc<dyn TaskQueue>, Duration)>,
    cancel: CancellationToken,
    state: watch::Sender<ScanState>,
}

impl ScanOrchestrator {
    pub fn new(adapter: Arc<dyn SourceAdapter>, rules: Arc<RuleSet>) -> Self {
        let (state, _) = watch::channel(ScanState::Created);
        Self {
            adapter,
            rules,
            events: Arc::new(NoopSink),
            queue: None,
            cancel: CancellationToken::new(),
            state,
        }
    }

    /// Sends lifecycle events to `sink`.
    pub fn with_event_sink(mut self, sink: Arc<dyn ScanEventSink>) -> Self {
        self.events = sink;
        self
    }

    /// Dispatches unit-scans through `queue`, waiting at most `task_timeout`
    /// for each result.
    pub fn with_task_queue(mut self, queue: Arc<dyn TaskQueue>, task_timeout: Duration) -> Self {
        self.queue = Some((queue, task_timeout));
        self
    }

    /// Token that cancels the running scan.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> watch::Receiver<ScanState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ScanState) {
        tracing::trace!("Scan state -> {:?}", state);
        self.state.send_replace(state);
    }

    /// Runs the scan.
    ///
    /// # Errors
    /// Returns a configuration error for invalid options, or the adapter's
    /// error when connecting or enumerating fails. Unit failures never
    /// surface here; they are recorded in the report.
    pub async fn scan(&self, options: &ScanOptions) -> Result<Report> {
        let scan_id = Uuid::new_v4();
        let result = self.run(scan_id, options).await;

        if let Err(e) = self.adapter.close().await {
            tracing::warn!("Failed to close adapter for {}: {}", self.adapter.source_name(), e);
        }

        match result {
            Ok(report) => {
                self.set_state(ScanState::Completed);
                self.events.emit(ScanEvent::ScanCompleted {
                    scan_id,
                    matches: report.matches.len(),
                    units_scanned: report.units_scanned.len(),
                    units_failed: report.units_failed.len(),
                    cancelled: report.cancelled,
                });
                Ok(report)
            }
            Err(e) => {
                self.set_state(ScanState::Failed);
                self.events.emit(ScanEvent::ScanFailed {
                    scan_id,
                    error_kind: e.kind(),
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn run(&self, scan_id: Uuid, options: &ScanOptions) -> Result<Report> {
        let started = Instant::now();
        options.validate()?;
        let active = Arc::new(self.rules.select(options)?);
        let source = self.adapter.source_name();

        self.set_state(ScanState::Enumerating);
        let filter = UnitFilter::from_options(options);
        let units = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(ScanError::Cancelled),
            units = async {
                self.adapter.connect().await?;
                self.adapter.enumerate_units(&filter).await
            } => units?,
        };

        tracing::info!(
            "Scanning {} units of {} with {} rules",
            units.len(),
            source,
            active.len()
        );
        self.events.emit(ScanEvent::ScanStarted {
            scan_id,
            source: source.clone(),
            units: units.len(),
        });

        self.set_state(ScanState::Scanning);
        let mut builder = ReportBuilder::new(scan_id, source, options, active.ids());
        let cancelled = self.dispatch(scan_id, units, &active, options, &mut builder).await;

        self.set_state(ScanState::Aggregating);
        Ok(builder.finish(cancelled, started))
    }

    /// Runs every unit-scan and feeds the results to `builder`.
    ///
    /// Returns whether the scan was cancelled.
    async fn dispatch(
        &self,
        scan_id: Uuid,
        units: Vec<Unit>,
        active: &Arc<ActiveRules>,
        options: &ScanOptions,
        builder: &mut ReportBuilder,
    ) -> bool {
        let abort = CancellationToken::new();
        let concurrency = match &self.queue {
            Some(_) => units.len().max(1),
            None => usize::try_from(options.processes).unwrap_or(1).max(1),
        };

        let mut results = stream::iter(units)
            .map(|unit| self.unit_future(scan_id, unit, active, options, &abort))
            .buffer_unordered(concurrency);

        let mut deadline: Option<Pin<Box<Sleep>>> =
            options.scan_timeout().map(|d| Box::pin(tokio::time::sleep(d)));
        let mut grace: Option<Pin<Box<Sleep>>> = None;
        let mut cancel_seen = false;

        loop {
            tokio::select! {
                next = results.next() => match next {
                    Some(result) => self.record(scan_id, result, options, builder),
                    None => break,
                },
                _ = self.cancel.cancelled(), if !cancel_seen => {
                    cancel_seen = true;
                    tracing::info!(
                        "Scan cancelled, waiting up to {:?} for running units",
                        options.cancel_grace()
                    );
                    grace = Some(Box::pin(tokio::time::sleep(options.cancel_grace())));
                },
                _ = wait_for(&mut deadline) => {
                    deadline = None;
                    tracing::warn!("Scan timeout elapsed, cancelling");
                    self.cancel.cancel();
                },
                _ = wait_for(&mut grace) => {
                    grace = None;
                    tracing::debug!("Grace period over, aborting running units");
                    abort.cancel();
                },
            }
        }

        self.cancel.is_cancelled()
    }

    fn record(
        &self,
        scan_id: Uuid,
        result: UnitResult,
        options: &ScanOptions,
        builder: &mut ReportBuilder,
    ) {
        match &result.outcome {
            Ok(output) => {
                let min_count = u64::from(options.min_count);
                self.events.emit(ScanEvent::UnitCompleted {
                    scan_id,
                    unit: result.unit.clone(),
                    matches: output.matches.iter().filter(|m| m.count >= min_count).count(),
                    records_sampled: output.records_sampled,
                });
            }
            Err(failure) => {
                tracing::warn!(
                    "Unit '{}' failed ({}): {}",
                    failure.unit,
                    failure.error_kind,
                    failure.message
                );
                self.events.emit(ScanEvent::UnitFailed {
                    scan_id,
                    unit: failure.unit.clone(),
                    error_kind: failure.error_kind,
                    message: failure.message.clone(),
                });
            }
        }
        builder.add(result);
    }

    /// Future for one unit. Resolves immediately to a `Cancelled` failure
    /// when the scan was cancelled before the unit was dispatched.
    fn unit_future<'a>(
        &'a self,
        scan_id: Uuid,
        unit: Unit,
        active: &'a Arc<ActiveRules>,
        options: &'a ScanOptions,
        abort: &'a CancellationToken,
    ) -> BoxFuture<'a, UnitResult> {
        Box::pin(async move {
            if self.cancel.is_cancelled() {
                return UnitResult::failed(&unit, ErrorKind::Cancelled, "scan cancelled before dispatch");
            }
            match &self.queue {
                Some((queue, task_timeout)) => {
                    self.remote_unit(scan_id, unit, active, options, abort, queue.as_ref(), *task_timeout)
                        .await
                }
                None => self.local_unit(unit, active, options, abort).await,
            }
        })
    }

    async fn local_unit(
        &self,
        unit: Unit,
        active: &ActiveRules,
        options: &ScanOptions,
        abort: &CancellationToken,
    ) -> UnitResult {
        tracing::debug!("Scanning unit '{}'", unit.name);
        let scan = scan_unit(self.adapter.as_ref(), &unit, active, options, abort);
        let outcome = match options.unit_timeout() {
            Some(limit) => match tokio::time::timeout(limit, scan).await {
                Ok(outcome) => outcome,
                Err(_) => Err(ScanError::timeout(
                    format!("Scan of unit '{}'", unit.name),
                    limit,
                )),
            },
            None => scan.await,
        };

        match outcome {
            Ok(output) => UnitResult {
                unit: unit.name,
                outcome: Ok(output),
            },
            Err(e) => UnitResult::from_error(&unit, &e),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn remote_unit(
        &self,
        scan_id: Uuid,
        unit: Unit,
        active: &ActiveRules,
        options: &ScanOptions,
        abort: &CancellationToken,
        queue: &dyn TaskQueue,
        task_timeout: Duration,
    ) -> UnitResult {
        let started = Instant::now();
        let task = UnitScanTask {
            task_id: Uuid::new_v4(),
            adapter_type: self.adapter.source_type(),
            adapter_config: self.adapter.config().clone(),
            unit: unit.clone(),
            rule_ids: active.ids().into_iter().collect(),
            scan_options: options.clone(),
        };
        tracing::debug!(
            "Submitting task {} for unit '{}' (scan {})",
            task.task_id,
            unit.name,
            scan_id
        );

        let ticket = match queue.submit(task).await {
            Ok(ticket) => ticket,
            Err(e) => return UnitResult::from_error(&unit, &e),
        };

        // The task timeout runs from pickup, not from submission.
        let reply = tokio::select! {
            biased;
            _ = abort.cancelled() => None,
            reply = async {
                queue.wait_started(&ticket).await?;
                Ok::<_, ScanError>(tokio::time::timeout(task_timeout, queue.wait(ticket)).await)
            } => Some(reply),
        };

        let reply = match reply {
            Some(Ok(Ok(Ok(result)))) => Ok(Ok(result)),
            Some(Ok(Ok(Err(lost))) | Err(lost)) => {
                queue.cancel(&ticket).await;
                Ok(Err(lost))
            }
            Some(Ok(Err(elapsed))) => {
                queue.cancel(&ticket).await;
                Err(elapsed)
            }
            None => {
                queue.cancel(&ticket).await;
                return UnitResult::failed(&unit, ErrorKind::Cancelled, ScanError::Cancelled.to_string());
            }
        };

        match reply {
            Ok(Ok(result)) => match result.outcome {
                TaskOutcome::Matches {
                    matches,
                    records_sampled,
                    fields,
                } => UnitResult {
                    unit: unit.name.clone(),
                    outcome: Ok(UnitScanOutput {
                        unit: unit.name,
                        matches,
                        records_sampled,
                        fields,
                        duration_ms: unit::elapsed_ms(started),
                    }),
                },
                TaskOutcome::Failed {
                    error_kind,
                    message,
                } => UnitResult::failed(&unit, error_kind, message),
            },
            Ok(Err(e)) => UnitResult::failed(
                &unit,
                ErrorKind::Timeout,
                format!("task {} lost: {}", ticket.task_id, e),
            ),
            Err(_) => UnitResult::failed(
                &unit,
                ErrorKind::Timeout,
                ScanError::timeout(format!("Task {}", ticket.task_id), task_timeout).to_string(),
            ),
        }
    }
}

async fn wait_for(sleep: &mut Option<Pin<Box<Sleep>>>) {
    match sleep {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}
