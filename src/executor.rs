//! Concurrent page download across all active tasks.
//!
//! The work set is one item per (task, missing page), interleaved
//! round-robin across tasks so a single large task cannot starve the rest.
//! Workers fan out up to the configured global concurrency; every outcome,
//! success or error, goes to the writer so reconciliation can see the page
//! was attempted. Task state is never touched here; the reconciler owns
//! those transitions.

use std::collections::VecDeque;
use std::sync::Arc;
use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::client::{build_page_request, PageFetcher};
use crate::config::Config;
use crate::data_structures::{ExtractionTask, Granularity, PageRequest, RunStats};
use crate::error::{ExtractError, ExtractResult};
use crate::planner::bucket_for;
use crate::writer::WriterHandle;

const PROGRESS_EVERY: usize = 100;
/// Ready results are submitted to the writer in chunks of at most this size.
const SUBMIT_BATCH: usize = 16;

#[derive(Default, Debug)]
pub struct ExecutionOutcome {
    pub attempted: usize,
    /// Fail-fast rejections (open breaker) and cancellations.
    pub skipped: usize,
}

/// Flatten tasks into a fair work list: round-robin one page per task.
fn build_work_set(
    tasks: &[ExtractionTask],
    config: &Config,
    granularity_override: Option<Granularity>,
    range_end: NaiveDate,
) -> Vec<PageRequest> {
    let mut per_task: Vec<VecDeque<PageRequest>> = Vec::with_capacity(tasks.len());
    for task in tasks {
        let Some(endpoint) = config.endpoint(&task.endpoint_name) else {
            warn!(
                "task {} references an endpoint missing from the catalog, skipping its pages",
                task.task_id
            );
            continue;
        };
        let granularity = granularity_override.unwrap_or(endpoint.granularity);
        let bucket = bucket_for(task.data_date, granularity, range_end);
        let pages: VecDeque<PageRequest> = task
            .missing_pages
            .iter()
            .map(|page| build_page_request(&config.base_url, endpoint, bucket, task.modality, *page))
            .collect();
        if !pages.is_empty() {
            per_task.push(pages);
        }
    }

    let total: usize = per_task.iter().map(|q| q.len()).sum();
    let mut work = Vec::with_capacity(total);
    while work.len() < total {
        for queue in per_task.iter_mut() {
            if let Some(request) = queue.pop_front() {
                work.push(request);
            }
        }
    }
    work
}

#[allow(clippy::too_many_arguments)]
pub async fn execute(
    tasks: Vec<ExtractionTask>,
    config: &Config,
    granularity_override: Option<Granularity>,
    range_end: NaiveDate,
    fetcher: Arc<dyn PageFetcher>,
    writer: &WriterHandle,
    concurrency: usize,
    cancel: &CancellationToken,
    stats: &RunStats,
) -> ExtractResult<ExecutionOutcome> {
    let work = build_work_set(&tasks, config, granularity_override, range_end);
    let total = work.len();
    if total == 0 {
        info!("executor: nothing to fetch");
        return Ok(ExecutionOutcome::default());
    }
    info!(
        "executor: {} pages across {} tasks, {} workers",
        total,
        tasks.len(),
        concurrency.max(1)
    );

    let fetches = stream::iter(work)
        .map(|request| {
            let fetcher = fetcher.clone();
            async move {
                if cancel.is_cancelled() {
                    return Ok(None);
                }
                match fetcher.fetch_page(&request, cancel).await {
                    Ok(response) => {
                        RunStats::bump(&stats.pages_attempted);
                        debug!(
                            "{} page {}: HTTP {} in {:?}",
                            request.endpoint_name, request.page, response.status, response.elapsed
                        );
                        Ok(Some(response))
                    }
                    Err(ExtractError::CircuitOpen { endpoint }) => {
                        debug!(
                            "skipping {} page {}: breaker open for '{}'",
                            request.endpoint_name, request.page, endpoint
                        );
                        RunStats::bump(&stats.pages_skipped);
                        Ok(None)
                    }
                    Err(ExtractError::Cancelled) => Ok(None),
                    Err(e) => Err(e),
                }
            }
        })
        .buffer_unordered(concurrency.max(1))
        .ready_chunks(SUBMIT_BATCH);
    futures::pin_mut!(fetches);

    // Whatever completed together is submitted together; the writer's
    // bounded queue is what slows the fan-out when disk falls behind.
    let mut outcome = ExecutionOutcome::default();
    let mut dispatched = 0usize;
    while let Some(chunk) = fetches.next().await {
        let mut batch = Vec::with_capacity(chunk.len());
        for fetched in chunk {
            match fetched? {
                Some(response) => batch.push(response),
                None => outcome.skipped += 1,
            }
        }
        outcome.attempted += batch.len();
        let before = dispatched;
        dispatched = outcome.attempted + outcome.skipped;
        if dispatched / PROGRESS_EVERY > before / PROGRESS_EVERY {
            info!("executor: {}/{} pages dispatched", dispatched, total);
        }
        writer.submit_batch(batch).await?;
    }

    info!(
        "executor: done, {} pages attempted, {} skipped",
        outcome.attempted, outcome.skipped
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_structures::TaskStatus;
    use crate::storage;
    use crate::testing::{catalog, date, endpoint_config, page_body, spawn_writer, MockFetcher, Scripted};

    fn fetching_task(endpoint: &str, missing: &[u32]) -> ExtractionTask {
        let mut task = ExtractionTask::new(endpoint, date("2024-01-01"), None, "fp");
        task.status = TaskStatus::Fetching;
        task.total_pages = Some(*missing.iter().max().unwrap_or(&1) as i64);
        task.missing_pages = missing.iter().copied().collect();
        task
    }

    #[test]
    fn work_set_interleaves_tasks_round_robin() {
        let config = catalog(vec![
            endpoint_config("a", Granularity::Day, vec![]),
            endpoint_config("b", Granularity::Day, vec![]),
        ]);
        let tasks = vec![fetching_task("a", &[2, 3, 4]), fetching_task("b", &[2, 3])];
        let work = build_work_set(&tasks, &config, None, date("2024-01-01"));
        let order: Vec<(String, u32)> =
            work.iter().map(|r| (r.endpoint_name.clone(), r.page)).collect();
        assert_eq!(
            order,
            vec![
                ("a".to_string(), 2),
                ("b".to_string(), 2),
                ("a".to_string(), 3),
                ("b".to_string(), 3),
                ("a".to_string(), 4),
            ]
        );
    }

    #[tokio::test]
    async fn fetches_exactly_the_missing_pages() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, stats, cancel) = spawn_writer(&dir, "run-x").await;
        let config = catalog(vec![endpoint_config("contratos", Granularity::Day, vec![])]);
        let fetcher = Arc::new(MockFetcher::with_default(Scripted::Page {
            total_records: 9,
            total_pages: 3,
            body: page_body(9, 3, "page"),
        }));

        let outcome = execute(
            vec![fetching_task("contratos", &[2, 3])],
            &config,
            None,
            date("2024-01-01"),
            fetcher.clone(),
            writer.handle(),
            4,
            &cancel,
            &stats,
        )
        .await
        .unwrap();
        assert_eq!(outcome.attempted, 2);
        assert_eq!(fetcher.calls_for("contratos", 1), 0);
        assert_eq!(fetcher.calls_for("contratos", 2), 1);
        assert_eq!(fetcher.calls_for("contratos", 3), 1);

        writer.handle().flush().await.unwrap();
        writer.shutdown().await.unwrap();
        let conn = storage::open_connection(&dir.path().join("test.db")).unwrap();
        let pages: Vec<i64> = conn
            .prepare("SELECT current_page FROM pncp_requests ORDER BY current_page")
            .unwrap()
            .query_map([], |r| r.get(0))
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(pages, vec![2, 3]);
    }

    #[tokio::test]
    async fn error_pages_are_still_logged_for_reconciliation() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, stats, cancel) = spawn_writer(&dir, "run-x").await;
        let config = catalog(vec![endpoint_config("contratos", Granularity::Day, vec![])]);
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.script_page("contratos", 2, vec![Scripted::Status(500)]);

        execute(
            vec![fetching_task("contratos", &[2])],
            &config,
            None,
            date("2024-01-01"),
            fetcher,
            writer.handle(),
            2,
            &cancel,
            &stats,
        )
        .await
        .unwrap();

        writer.handle().flush().await.unwrap();
        writer.shutdown().await.unwrap();
        let conn = storage::open_connection(&dir.path().join("test.db")).unwrap();
        let (code, content): (i64, Option<String>) = conn
            .query_row(
                "SELECT response_code, content_id FROM pncp_requests WHERE current_page = 2",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(code, 500);
        assert!(content.is_none());
    }

    #[tokio::test]
    async fn open_breaker_skips_without_logging_rows() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, stats, cancel) = spawn_writer(&dir, "run-x").await;
        let config = catalog(vec![endpoint_config("contratos", Granularity::Day, vec![])]);
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.script_endpoint("contratos", Scripted::Open);

        let outcome = execute(
            vec![fetching_task("contratos", &[2, 3])],
            &config,
            None,
            date("2024-01-01"),
            fetcher,
            writer.handle(),
            2,
            &cancel,
            &stats,
        )
        .await
        .unwrap();
        assert_eq!(outcome.attempted, 0);
        assert_eq!(outcome.skipped, 2);
        assert_eq!(stats.snapshot().pages_skipped, 2);

        writer.handle().flush().await.unwrap();
        writer.shutdown().await.unwrap();
        let conn = storage::open_connection(&dir.path().join("test.db")).unwrap();
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM pncp_requests", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 0);
    }

    #[tokio::test]
    async fn cancellation_short_circuits_the_work_set() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, stats, cancel) = spawn_writer(&dir, "run-x").await;
        let config = catalog(vec![endpoint_config("contratos", Granularity::Day, vec![])]);
        let fetcher = Arc::new(MockFetcher::new());
        cancel.cancel();

        let outcome = execute(
            vec![fetching_task("contratos", &[2, 3, 4])],
            &config,
            None,
            date("2024-01-01"),
            fetcher.clone(),
            writer.handle(),
            2,
            &cancel,
            &stats,
        )
        .await
        .unwrap();
        assert_eq!(outcome.attempted, 0);
        assert_eq!(fetcher.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
        writer.shutdown().await.unwrap();
    }
}
