//! Top-level run state machine.
//!
//! INIT -> PLANNED -> DISCOVERED -> EXECUTED -> RECONCILED -> DONE, with a
//! CANCELLED branch reachable between any two phases. Each phase flushes the
//! writer before the next one reads, so every phase observes everything its
//! predecessor produced. Phase failures leave the database consistent; the
//! next run picks up from the recorded task statuses.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use chrono::NaiveDate;
use log::{info, warn};

use tokio_util::sync::CancellationToken;

use crate::client::PageFetcher;
use crate::config::Config;
use crate::data_structures::{Granularity, RunStats, StatsSnapshot, TaskStatus};
use crate::discovery;
use crate::error::{ExtractError, ExtractResult};
use crate::executor;
use crate::planner;
use crate::reconciler;
use crate::storage::Database;
use crate::writer::{Writer, WriterHandle};

const WRITER_QUEUE_DEPTH: usize = 256;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    Init,
    Planned,
    Discovered,
    Executed,
    Reconciled,
    Done,
    Cancelled,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Init => "INIT",
            Phase::Planned => "PLANNED",
            Phase::Discovered => "DISCOVERED",
            Phase::Executed => "EXECUTED",
            Phase::Reconciled => "RECONCILED",
            Phase::Done => "DONE",
            Phase::Cancelled => "CANCELLED",
        }
    }
}

#[derive(Clone, Debug)]
pub struct CoordinatorSettings {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub granularity_override: Option<Granularity>,
    pub concurrency: usize,
    pub allow_replan: bool,
    pub endpoint_filter: Vec<String>,
}

#[derive(Debug)]
pub struct RunReport {
    pub phase: Phase,
    pub run_id: String,
    pub fingerprint: String,
    pub status_counts: Vec<(String, i64)>,
    pub error_counts: Vec<(String, i64)>,
    pub stats: StatsSnapshot,
}

impl RunReport {
    /// End-of-run summary block.
    pub fn summary(&self) -> String {
        let statuses = if self.status_counts.is_empty() {
            "none".to_string()
        } else {
            self.status_counts
                .iter()
                .map(|(status, n)| format!("{} {}", status, n))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let errors = if self.error_counts.is_empty() {
            "none".to_string()
        } else {
            self.error_counts
                .iter()
                .map(|(endpoint, n)| format!("{} {}", endpoint, n))
                .collect::<Vec<_>>()
                .join(", ")
        };
        format!(
            "\
Run {} finished ({})||
Tasks: {}||
Tasks discovered: {}||
Tasks failed in discovery: {}||
Pages attempted: {}||
Pages persisted: {}||
Pages failed: {}||
Pages skipped: {}||
Payload bytes stored: {}||
Dedup hits: {}||
Errors by endpoint: {}",
            self.run_id,
            self.phase.as_str(),
            statuses,
            self.stats.tasks_discovered,
            self.stats.tasks_failed,
            self.stats.pages_attempted,
            self.stats.pages_persisted,
            self.stats.pages_failed,
            self.stats.pages_skipped,
            self.stats.bytes_downloaded,
            self.stats.dedup_hits,
            errors,
        )
    }
}

pub struct Coordinator {
    config: Config,
    settings: CoordinatorSettings,
    db: Database,
    fetcher: Arc<dyn PageFetcher>,
    writer: Writer,
    cancel: CancellationToken,
    stats: Arc<RunStats>,
    run_id: String,
}

impl Coordinator {
    /// Initialize storage and the writer. Schema problems surface here as
    /// fatal storage errors before any phase runs.
    pub async fn new(
        config: Config,
        settings: CoordinatorSettings,
        db_path: PathBuf,
        fetcher: Arc<dyn PageFetcher>,
        cancel: CancellationToken,
        run_id: String,
    ) -> ExtractResult<Coordinator> {
        let stats = Arc::new(RunStats::default());
        let writer = Writer::spawn(
            db_path.clone(),
            run_id.clone(),
            stats.clone(),
            cancel.clone(),
            WRITER_QUEUE_DEPTH,
        )
        .await?;
        Ok(Coordinator {
            config,
            settings,
            db: Database::new(db_path),
            fetcher,
            writer,
            cancel,
            stats,
            run_id,
        })
    }

    pub async fn run(self) -> ExtractResult<RunReport> {
        let Coordinator { config, settings, db, fetcher, writer, cancel, stats, run_id } = self;

        let outcome = drive(
            &config,
            &settings,
            &db,
            fetcher,
            writer.handle(),
            &cancel,
            &stats,
            &run_id,
        )
        .await;

        // Drain and close the store no matter how the phases ended; a fatal
        // writer error is the root cause and wins over queue-closed noise.
        let shutdown = writer.shutdown().await;
        let result = match (outcome, shutdown) {
            (Ok(report), Ok(())) => Ok(report),
            (Ok(_), Err(e)) => Err(e),
            (Err(ExtractError::Storage(_)), Err(root)) => Err(root),
            (Err(e), _) => Err(e),
        };
        if matches!(&result, Err(e) if e.is_cancelled()) {
            info!(
                "run {} ended in phase {}; recorded task state resumes on the next run",
                run_id,
                Phase::Cancelled.as_str()
            );
        }
        result
    }
}

fn phase_transition(phase: Phase, started: Instant, stats: &RunStats) {
    let snap = stats.snapshot();
    let elapsed = started.elapsed().as_secs_f64().max(0.001);
    info!(
        "phase {}: {} pages persisted, {} failed, {:.1} pages/s",
        phase.as_str(),
        snap.pages_persisted,
        snap.pages_failed,
        snap.pages_persisted as f64 / elapsed
    );
}

fn ensure_live(cancel: &CancellationToken) -> ExtractResult<()> {
    if cancel.is_cancelled() {
        Err(ExtractError::Cancelled)
    } else {
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
async fn drive(
    config: &Config,
    settings: &CoordinatorSettings,
    db: &Database,
    fetcher: Arc<dyn PageFetcher>,
    writer: &WriterHandle,
    cancel: &CancellationToken,
    stats: &Arc<RunStats>,
    run_id: &str,
) -> ExtractResult<RunReport> {
    let started = Instant::now();
    info!(
        "run {} starting: {}..{} with {} workers",
        run_id, settings.start, settings.end, settings.concurrency
    );
    phase_transition(Phase::Init, started, stats);

    let endpoints = config.select_endpoints(&settings.endpoint_filter)?;
    let fingerprint = planner::plan_fingerprint(
        &endpoints,
        settings.start,
        settings.end,
        settings.granularity_override,
    );

    // Plan-drift gate: tasks persisted under a different fingerprint mean
    // the catalog or the range changed since they were planned.
    let existing = db.fingerprints().await?;
    let drifted: Vec<String> =
        existing.into_iter().filter(|fp| *fp != fingerprint).collect();
    if !drifted.is_empty() {
        if settings.allow_replan {
            warn!(
                "plan drift approved by operator: existing fingerprints {:?}, current {}",
                drifted, fingerprint
            );
        } else {
            return Err(ExtractError::PlanDrift(format!(
                "stored tasks carry fingerprint(s) {:?} but this run plans {}; \
                 pass --allow-replan to proceed anyway",
                drifted, fingerprint
            )));
        }
    }
    ensure_live(cancel)?;

    let plan_summary = planner::plan(
        &endpoints,
        settings.start,
        settings.end,
        settings.granularity_override,
        &fingerprint,
        writer,
    )
    .await?;
    writer.flush().await?;
    info!(
        "plan holds {} tasks, {} newly created",
        plan_summary.tasks_planned, plan_summary.tasks_inserted
    );
    phase_transition(Phase::Planned, started, stats);
    ensure_live(cancel)?;

    // Tasks stranded in DISCOVERING by a previous crash get probed again.
    let pending = db
        .tasks_in(vec![TaskStatus::Pending, TaskStatus::Discovering])
        .await?;
    discovery::discover(
        pending,
        config,
        settings.granularity_override,
        settings.end,
        fetcher.clone(),
        writer,
        settings.concurrency,
        cancel,
        stats,
    )
    .await?;
    writer.flush().await?;
    phase_transition(Phase::Discovered, started, stats);
    ensure_live(cancel)?;

    let active = db
        .tasks_in(vec![TaskStatus::Fetching, TaskStatus::Partial])
        .await?;
    executor::execute(
        active,
        config,
        settings.granularity_override,
        settings.end,
        fetcher,
        writer,
        settings.concurrency,
        cancel,
        stats,
    )
    .await?;
    writer.flush().await?;
    phase_transition(Phase::Executed, started, stats);
    ensure_live(cancel)?;

    reconciler::reconcile(db, writer, cancel).await?;
    phase_transition(Phase::Reconciled, started, stats);
    ensure_live(cancel)?;

    let report = RunReport {
        phase: Phase::Done,
        run_id: run_id.to_string(),
        fingerprint,
        status_counts: db.task_status_counts().await?,
        error_counts: db.error_counts_for(run_id.to_string()).await?,
        stats: stats.snapshot(),
    };
    info!("{}", report.summary());
    Ok(report)
}
