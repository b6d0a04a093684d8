//! Pagination discovery.
//!
//! Every pending task gets a page-1 probe to learn `totalPaginas` and
//! `totalRegistros` and to seed its missing-pages list. Probes run in
//! parallel up to a bounded concurrency; results land in any order, each
//! task update independent of the others. Within one task the page-1 write
//! is acknowledged by the writer before the task leaves DISCOVERING, so a
//! FETCHING task always has its first page on disk.

use std::collections::BTreeSet;
use std::sync::Arc;
use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::client::{build_page_request, PageFetcher};
use crate::config::Config;
use crate::data_structures::{
    ExtractionTask, Granularity, RunStats, TaskStatus, TaskUpdate,
};
use crate::error::{ExtractError, ExtractResult};
use crate::planner::bucket_for;
use crate::writer::WriterHandle;

#[derive(Default, Debug)]
pub struct DiscoveryOutcome {
    /// Tasks that moved to FETCHING with pagination metadata.
    pub discovered: usize,
    /// Tasks completed directly because the bucket holds no data.
    pub completed_empty: usize,
    pub failed: usize,
    /// Left for the next run (open breaker or cancellation).
    pub deferred: usize,
}

enum OneOutcome {
    Fetching,
    CompletedEmpty,
    Failed,
    Deferred,
}

#[allow(clippy::too_many_arguments)]
pub async fn discover(
    tasks: Vec<ExtractionTask>,
    config: &Config,
    granularity_override: Option<Granularity>,
    range_end: NaiveDate,
    fetcher: Arc<dyn PageFetcher>,
    writer: &WriterHandle,
    concurrency: usize,
    cancel: &CancellationToken,
    stats: &RunStats,
) -> ExtractResult<DiscoveryOutcome> {
    let total = tasks.len();
    let results: Vec<ExtractResult<OneOutcome>> = stream::iter(tasks)
        .map(|task| {
            let fetcher = fetcher.clone();
            async move {
                discover_one(
                    task,
                    config,
                    granularity_override,
                    range_end,
                    fetcher,
                    writer,
                    cancel,
                    stats,
                )
                .await
            }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let mut outcome = DiscoveryOutcome::default();
    for result in results {
        match result? {
            OneOutcome::Fetching => outcome.discovered += 1,
            OneOutcome::CompletedEmpty => outcome.completed_empty += 1,
            OneOutcome::Failed => outcome.failed += 1,
            OneOutcome::Deferred => outcome.deferred += 1,
        }
    }
    info!(
        "discovery: {} tasks probed ({} fetching, {} empty, {} failed, {} deferred)",
        total, outcome.discovered, outcome.completed_empty, outcome.failed, outcome.deferred
    );
    Ok(outcome)
}

#[allow(clippy::too_many_arguments)]
async fn discover_one(
    task: ExtractionTask,
    config: &Config,
    granularity_override: Option<Granularity>,
    range_end: NaiveDate,
    fetcher: Arc<dyn PageFetcher>,
    writer: &WriterHandle,
    cancel: &CancellationToken,
    stats: &RunStats,
) -> ExtractResult<OneOutcome> {
    let Some(endpoint) = config.endpoint(&task.endpoint_name) else {
        warn!(
            "task {} references an endpoint missing from the catalog, failing it",
            task.task_id
        );
        let mut update = TaskUpdate::from_task(&task);
        update.status = TaskStatus::Failed;
        update.last_error = Some("endpoint missing from catalog".to_string());
        writer.update_task(update, false).await?;
        RunStats::bump(&stats.tasks_failed);
        return Ok(OneOutcome::Failed);
    };

    let mut update = TaskUpdate::from_task(&task);
    update.status = TaskStatus::Discovering;
    writer.update_task(update, false).await?;

    let granularity = granularity_override.unwrap_or(endpoint.granularity);
    let bucket = bucket_for(task.data_date, granularity, range_end);
    let request = build_page_request(&config.base_url, endpoint, bucket, task.modality, 1);
    debug!(
        "probing {} ({}) {}..{}",
        task.task_id,
        endpoint.category.as_deref().unwrap_or("uncategorized"),
        bucket.start,
        bucket.end
    );

    let response = match fetcher.fetch_page(&request, cancel).await {
        Ok(response) => response,
        Err(ExtractError::CircuitOpen { endpoint }) => {
            debug!("discovery of {} deferred: breaker open for '{}'", task.task_id, endpoint);
            let mut update = TaskUpdate::from_task(&task);
            update.status = TaskStatus::Pending;
            writer.update_task(update, false).await?;
            return Ok(OneOutcome::Deferred);
        }
        Err(ExtractError::Cancelled) => {
            // Left DISCOVERING; the next run probes it again.
            return Ok(OneOutcome::Deferred);
        }
        Err(e) => return Err(e),
    };

    if response.status == 204
        || (response.status == 200 && response.total_pages == Some(0))
    {
        writer.submit(response).await?;
        let mut update = TaskUpdate::from_task(&task);
        update.status = TaskStatus::Complete;
        update.total_pages = Some(0);
        update.total_records = Some(0);
        update.missing_pages = BTreeSet::new();
        writer.update_task(update, false).await?;
        RunStats::bump(&stats.tasks_discovered);
        return Ok(OneOutcome::CompletedEmpty);
    }

    if response.status == 200 {
        match response.total_pages {
            Some(total_pages) if total_pages >= 1 => {
                let total_records = response.total_records;
                let missing: BTreeSet<u32> = (2..=total_pages as u32).collect();
                // FIFO on the writer queue plus the ack below order the
                // page-1 commit before the FETCHING transition.
                writer.submit(response).await?;
                let mut update = TaskUpdate::from_task(&task);
                update.status = TaskStatus::Fetching;
                update.total_pages = Some(total_pages);
                update.total_records = total_records;
                update.missing_pages = missing;
                update.last_error = None;
                writer.update_task(update, true).await?;
                RunStats::bump(&stats.tasks_discovered);
                return Ok(OneOutcome::Fetching);
            }
            _ => {
                // 200 whose body yields no usable pagination metadata.
                writer.submit(response).await?;
                let mut update = TaskUpdate::from_task(&task);
                update.status = TaskStatus::Failed;
                update.last_error = Some(
                    ExtractError::Parse("pagination metadata missing or unparseable".to_string())
                        .to_string(),
                );
                writer.update_task(update, false).await?;
                RunStats::bump(&stats.tasks_failed);
                return Ok(OneOutcome::Failed);
            }
        }
    }

    // Unrecoverable probe: transport exhaustion, lingering 429/5xx, or a
    // permanent 4xx. Log the attempt, mark the task.
    let last_error = response
        .error
        .clone()
        .unwrap_or_else(|| format!("discovery failed with HTTP {}", response.status));
    writer.submit(response).await?;
    let mut update = TaskUpdate::from_task(&task);
    update.status = TaskStatus::Failed;
    update.last_error = Some(last_error);
    writer.update_task(update, false).await?;
    RunStats::bump(&stats.tasks_failed);
    Ok(OneOutcome::Failed)
}
