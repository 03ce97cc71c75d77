use assess::{AssessmentResult, Assessor, ProcessingStatus, Stage, UsageSnapshot, NO_EVIDENCE_NOTE};
use chrono::{DateTime, Utc};
use evidence::{Aggregator, Control, QualitySummary};
use futures::{FutureExt, StreamExt, stream};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const CANCELLED_ERROR: &str = "cancelled before processing";

/// Where one control is in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Pending,
    Extracting,
    Requesting,
    Parsing,
    Done(ProcessingStatus),
}

impl ControlState {
    /// Forward-only; `Parsing -> Requesting` is a corrective re-prompt.
    pub fn can_advance_to(self, next: ControlState) -> bool {
        use ControlState::*;
        matches!(
            (self, next),
            (Pending, Extracting)
                | (Pending, Done(_))
                | (Extracting, Requesting)
                | (Extracting, Done(_))
                | (Requesting, Parsing)
                | (Requesting, Done(_))
                | (Parsing, Requesting)
                | (Parsing, Done(_))
        )
    }
}

impl From<Stage> for ControlState {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::Requesting => Self::Requesting,
            Stage::Parsing => Self::Parsing,
        }
    }
}

impl fmt::Display for ControlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Extracting => f.write_str("extracting"),
            Self::Requesting => f.write_str("requesting"),
            Self::Parsing => f.write_str("parsing"),
            Self::Done(status) => write!(f, "done({})", status),
        }
    }
}

/// State of one control, owned by the worker processing it.
struct ControlProgress {
    control_id: String,
    state: ControlState,
}

impl ControlProgress {
    fn new(control_id: &str) -> Self {
        Self {
            control_id: control_id.to_string(),
            state: ControlState::Pending,
        }
    }

    fn advance(&mut self, next: ControlState) {
        if !self.state.can_advance_to(next) {
            warn!(control_id = %self.control_id, from = %self.state, to = %next, "Unexpected state transition");
        }
        debug!(control_id = %self.control_id, from = %self.state, to = %next, "Control state");
        self.state = next;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub success: usize,
    pub partial: usize,
    pub failed: usize,
    /// Controls answered without any usable evidence.
    pub no_evidence: usize,
}

impl StatusCounts {
    pub fn tally(results: &[AssessmentResult]) -> Self {
        let mut counts = Self::default();
        for result in results {
            match result.status {
                ProcessingStatus::Success => counts.success += 1,
                ProcessingStatus::Partial => counts.partial += 1,
                ProcessingStatus::Failed => counts.failed += 1,
            }
            if result.notes.iter().any(|n| n == NO_EVIDENCE_NOTE) {
                counts.no_evidence += 1;
            }
        }
        counts
    }
}

/// One batch run: results in input order plus run-level statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRun {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub model: String,
    pub results: Vec<AssessmentResult>,
    pub counts: StatusCounts,
    pub usage: UsageSnapshot,
    pub estimated_cost_usd: f64,
    /// Set when the batch was cut short by cancellation or the batch timeout.
    pub cancelled: bool,
}

impl BatchRun {
    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

/// Runs every control through aggregation and assessment with bounded
/// parallelism. Controls share nothing but the model call limiter and usage
/// counters inside the assessor.
pub struct BatchOrchestrator {
    aggregator: Arc<Aggregator>,
    assessor: Arc<Assessor>,
    max_concurrent_controls: usize,
    batch_timeout: Option<Duration>,
    usd_per_million_tokens: f64,
}

impl BatchOrchestrator {
    pub fn new(aggregator: Arc<Aggregator>, assessor: Arc<Assessor>, max_concurrent_controls: usize) -> Self {
        Self {
            aggregator,
            assessor,
            max_concurrent_controls: max_concurrent_controls.max(1),
            batch_timeout: None,
            usd_per_million_tokens: 0.0,
        }
    }

    pub fn with_batch_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.batch_timeout = timeout;
        self
    }

    pub fn with_token_price(mut self, usd_per_million_tokens: f64) -> Self {
        self.usd_per_million_tokens = usd_per_million_tokens;
        self
    }

    pub fn assessor(&self) -> &Assessor {
        &self.assessor
    }

    /// Process `controls` and return exactly one result per control, in input
    /// order. Once `cancel` fires no new control starts; controls already in
    /// flight finish and the rest are reported as cancelled.
    pub async fn run(&self, controls: Vec<Control>, cancel: CancellationToken) -> BatchRun {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let total = controls.len();

        info!(
            %run_id,
            controls = total,
            max_concurrent_controls = self.max_concurrent_controls,
            model = %self.assessor.invoker().model_name(),
            "Starting batch"
        );

        let deadline = self.batch_timeout.map(|timeout| {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => {
                        warn!(timeout_secs = timeout.as_secs(), "Batch timeout reached, no new controls will start");
                        cancel.cancel();
                    }
                    _ = cancel.cancelled() => {}
                }
            })
        });

        let completed = AtomicUsize::new(0);
        let mut slots: Vec<Option<AssessmentResult>> = vec![None; total];

        let outcomes: Vec<(usize, Option<AssessmentResult>)> = stream::iter(controls.iter().enumerate())
            .map(|(index, control)| {
                let cancel = &cancel;
                let completed = &completed;
                async move {
                    if cancel.is_cancelled() {
                        return (index, None);
                    }
                    let result = self.process_isolated(control).await;
                    let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
                    info!(
                        control_id = %control.control_id,
                        status = %result.status,
                        verdict = %result.verdict,
                        done,
                        total,
                        "Control finished"
                    );
                    (index, Some(result))
                }
            })
            .buffer_unordered(self.max_concurrent_controls)
            .collect()
            .await;

        if let Some(handle) = deadline {
            handle.abort();
        }

        for (index, result) in outcomes {
            slots[index] = result;
        }

        let mut skipped = 0;
        let results: Vec<AssessmentResult> = slots
            .into_iter()
            .zip(controls)
            .map(|(slot, control)| {
                slot.unwrap_or_else(|| {
                    skipped += 1;
                    AssessmentResult::failed(control, CANCELLED_ERROR, QualitySummary::default())
                })
            })
            .collect();

        let usage = self.assessor.invoker().usage().snapshot();
        let counts = StatusCounts::tally(&results);
        let run = BatchRun {
            run_id,
            started_at,
            finished_at: Utc::now(),
            model: self.assessor.invoker().model_name().to_string(),
            estimated_cost_usd: usage.estimated_cost_usd(self.usd_per_million_tokens),
            usage,
            counts,
            results,
            cancelled: skipped > 0 || cancel.is_cancelled(),
        };

        info!(
            %run_id,
            success = counts.success,
            partial = counts.partial,
            failed = counts.failed,
            no_evidence = counts.no_evidence,
            skipped,
            model_calls = run.usage.calls,
            retries = run.usage.retries,
            total_tokens = run.usage.total_tokens,
            estimated_cost_usd = run.estimated_cost_usd,
            elapsed_ms = run.elapsed().num_milliseconds(),
            "Batch finished"
        );

        run
    }

    /// A panic inside one control's pipeline becomes that control's failure.
    async fn process_isolated(&self, control: &Control) -> AssessmentResult {
        match AssertUnwindSafe(self.process(control)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(control_id = %control.control_id, panic = %message, "Control pipeline panicked");
                AssessmentResult::failed(control.clone(), format!("internal error: {}", message), QualitySummary::default())
            }
        }
    }

    async fn process(&self, control: &Control) -> AssessmentResult {
        let progress = Mutex::new(ControlProgress::new(&control.control_id));
        let advance = |next: ControlState| {
            if let Ok(mut progress) = progress.lock() {
                progress.advance(next);
            }
        };

        advance(ControlState::Extracting);
        let bundle = self.aggregator.aggregate(control).await;

        let result = self
            .assessor
            .assess(control, &bundle, &|stage: Stage| advance(stage.into()))
            .await;

        advance(ControlState::Done(result.status));
        result
    }
}
