use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use chrono::{DateTime, NaiveDate, Utc};
use clap::Parser;
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;

pub type ArbitraryJson = serde_json::Map<String, Value>;

/// Query parameter names fixed by the PNCP consultation API.
pub const PAGE_PARAM: &str = "pagina";
pub const PAGE_SIZE_PARAM: &str = "tamanhoPagina";
pub const MODALITY_PARAM: &str = "codigoModalidadeContratacao";

/// Dates on the wire are always 8-digit YYYYMMDD, regardless of input form.
pub const WIRE_DATE_FORMAT: &str = "%Y%m%d";

#[derive(Parser, Clone, Debug)]
#[command(name = "baliza", version, about = "Resumable backup engine for the PNCP procurement portal")]
pub struct CliArgs {
    /// Path to the endpoint catalog (YAML)
    #[arg(long, env = "CONFIG_PATH", default_value = "endpoints.yaml")]
    pub config: String,

    /// Path to the extraction database
    #[arg(long, env = "DB_PATH", default_value = "baliza.db")]
    pub db: String,

    /// First day of the extraction range, inclusive (e.g. 2024-01-01)
    #[arg(long)]
    pub from: NaiveDate,

    /// Last day of the extraction range, inclusive
    #[arg(long)]
    pub to: NaiveDate,

    /// Override the time bucket of every endpoint for this run
    #[arg(long, value_enum)]
    pub granularity: Option<Granularity>,

    /// Identifier recorded on every request row; generated when absent
    #[arg(long, env = "RUN_ID")]
    pub run_id: Option<String>,

    /// Global page-download worker count
    #[arg(long, env = "EXTRACT_CONCURRENCY", default_value_t = 16)]
    pub concurrency: usize,

    #[arg(long, env = "MAX_RPS")]
    pub max_rps: Option<u32>,

    #[arg(long, env = "MIN_RPS")]
    pub min_rps: Option<u32>,

    #[arg(long, env = "HTTP_TIMEOUT_SECONDS")]
    pub http_timeout_seconds: Option<u64>,

    /// Proceed even when persisted tasks were planned with different inputs
    #[arg(long)]
    pub allow_replan: bool,

    /// Restrict the run to these endpoint names (repeatable)
    #[arg(long = "endpoint")]
    pub endpoints: Vec<String>,

    /// Log to this file instead of stderr
    #[arg(long)]
    pub log_file: Option<String>,

    #[arg(long)]
    pub debug: bool,
}

/// Time bucket an endpoint is extracted in. Daily endpoints get one task per
/// day, monthly endpoints one task per calendar month touched by the range.
#[derive(Deserialize, Serialize, Copy, Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Day,
    Month,
}

/// Inclusive date window a task covers, derived from its endpoint's
/// granularity and clipped to the requested range.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DateBucket {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Discovering,
    Fetching,
    Partial,
    Complete,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Discovering => "DISCOVERING",
            TaskStatus::Fetching => "FETCHING",
            TaskStatus::Partial => "PARTIAL",
            TaskStatus::Complete => "COMPLETE",
            TaskStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<TaskStatus> {
        match s {
            "PENDING" => Some(TaskStatus::Pending),
            "DISCOVERING" => Some(TaskStatus::Discovering),
            "FETCHING" => Some(TaskStatus::Fetching),
            "PARTIAL" => Some(TaskStatus::Partial),
            "COMPLETE" => Some(TaskStatus::Complete),
            "FAILED" => Some(TaskStatus::Failed),
            _ => None,
        }
    }
}

/// One unit of extraction work: endpoint + time bucket + optional modality.
#[derive(Clone, Debug)]
pub struct ExtractionTask {
    pub task_id: String,
    pub endpoint_name: String,
    pub data_date: NaiveDate,
    pub modality: Option<i64>,
    pub status: TaskStatus,
    pub total_pages: Option<i64>,
    pub total_records: Option<i64>,
    pub missing_pages: BTreeSet<u32>,
    pub plan_fingerprint: String,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExtractionTask {
    /// Deterministic task identity. Recomputing for the same inputs always
    /// yields the same id; a null and a concrete modality never collide.
    pub fn make_id(endpoint: &str, data_date: NaiveDate, modality: Option<i64>) -> String {
        match modality {
            Some(m) => format!("{}-{}-m{}", endpoint, data_date.format(WIRE_DATE_FORMAT), m),
            None => format!("{}-{}", endpoint, data_date.format(WIRE_DATE_FORMAT)),
        }
    }

    pub fn new(
        endpoint: &str,
        data_date: NaiveDate,
        modality: Option<i64>,
        plan_fingerprint: &str,
    ) -> Self {
        let now = Utc::now();
        ExtractionTask {
            task_id: Self::make_id(endpoint, data_date, modality),
            endpoint_name: endpoint.to_string(),
            data_date,
            modality,
            status: TaskStatus::Pending,
            total_pages: None,
            total_records: None,
            missing_pages: BTreeSet::new(),
            plan_fingerprint: plan_fingerprint.to_string(),
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Full-row task mutation applied by the writer. Carries the complete new
/// value of every mutable field so updates are commutative across tasks.
#[derive(Clone, Debug)]
pub struct TaskUpdate {
    pub task_id: String,
    pub status: TaskStatus,
    pub total_pages: Option<i64>,
    pub total_records: Option<i64>,
    pub missing_pages: BTreeSet<u32>,
    pub last_error: Option<String>,
}

impl TaskUpdate {
    /// Start from the task's current fields; callers then change what moved.
    pub fn from_task(task: &ExtractionTask) -> Self {
        TaskUpdate {
            task_id: task.task_id.clone(),
            status: task.status,
            total_pages: task.total_pages,
            total_records: task.total_records,
            missing_pages: task.missing_pages.clone(),
            last_error: task.last_error.clone(),
        }
    }
}

/// Pagination metadata decoded once per response. Every other field of the
/// payload passes through untouched as raw bytes.
#[derive(Deserialize, Debug, Default)]
pub struct PageEnvelope {
    #[serde(rename = "totalRegistros")]
    pub total_registros: Option<i64>,
    #[serde(rename = "totalPaginas")]
    pub total_paginas: Option<i64>,
}

impl PageEnvelope {
    pub fn decode(body: &[u8]) -> Option<PageEnvelope> {
        serde_json::from_slice(body).ok()
    }
}

/// A fully built page request: canonical URL plus the structured parameters
/// that end up in the request log.
#[derive(Clone, Debug)]
pub struct PageRequest {
    pub endpoint_name: String,
    pub url: String,
    pub parameters: ArbitraryJson,
    pub data_date: NaiveDate,
    pub page: u32,
    pub page_size: u32,
}

/// Outcome of one page fetch, success or error. Errors still carry enough to
/// be logged so reconciliation can see the page was attempted.
#[derive(Clone, Debug)]
pub struct PageResponse {
    pub request: PageRequest,
    /// HTTP status, or 0 when no response was obtained after retries.
    pub status: u16,
    pub headers: ArbitraryJson,
    pub body: Option<Vec<u8>>,
    pub total_records: Option<i64>,
    pub total_pages: Option<i64>,
    pub elapsed: Duration,
    pub error: Option<String>,
}

impl PageResponse {
    pub fn is_persistable_success(&self) -> bool {
        self.status == 200
    }

    pub fn is_empty_success(&self) -> bool {
        self.status == 204
    }
}

/// Counters shared across all workers for progress reporting. Plain atomics;
/// snapshots are taken at phase boundaries and for the end-of-run summary.
#[derive(Default)]
pub struct RunStats {
    pub pages_attempted: AtomicU64,
    pub pages_persisted: AtomicU64,
    pub pages_failed: AtomicU64,
    pub pages_skipped: AtomicU64,
    pub bytes_downloaded: AtomicU64,
    pub dedup_hits: AtomicU64,
    pub tasks_discovered: AtomicU64,
    pub tasks_failed: AtomicU64,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub pages_attempted: u64,
    pub pages_persisted: u64,
    pub pages_failed: u64,
    pub pages_skipped: u64,
    pub bytes_downloaded: u64,
    pub dedup_hits: u64,
    pub tasks_discovered: u64,
    pub tasks_failed: u64,
}

impl RunStats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            pages_attempted: self.pages_attempted.load(Ordering::Relaxed),
            pages_persisted: self.pages_persisted.load(Ordering::Relaxed),
            pages_failed: self.pages_failed.load(Ordering::Relaxed),
            pages_skipped: self.pages_skipped.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            dedup_hits: self.dedup_hits.load(Ordering::Relaxed),
            tasks_discovered: self.tasks_discovered.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
        }
    }
}
