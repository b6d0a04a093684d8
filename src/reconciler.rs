//! Plan-versus-disk reconciliation.
//!
//! The reconciler is the only authority for FETCHING/PARTIAL -> COMPLETE.
//! For each active task it recomputes the missing set from scratch: planned
//! pages `[1..=total_pages]` minus the pages with a 200 row in the request
//! log. Recomputing from the plan (not from the previous missing set) makes
//! the pass idempotent and lets it heal any drift left by an interrupted
//! run.

use std::collections::BTreeSet;
use log::{debug, info};
use tokio_util::sync::CancellationToken;

use crate::data_structures::{TaskStatus, TaskUpdate};
use crate::error::ExtractResult;
use crate::storage::Database;
use crate::writer::WriterHandle;

#[derive(Default, Debug, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub examined: usize,
    pub completed: usize,
    pub now_partial: usize,
    pub unchanged: usize,
}

pub async fn reconcile(
    db: &Database,
    writer: &WriterHandle,
    cancel: &CancellationToken,
) -> ExtractResult<ReconcileSummary> {
    // Observe everything the executor managed to enqueue.
    writer.flush().await?;

    let tasks = db
        .tasks_in(vec![TaskStatus::Fetching, TaskStatus::Partial])
        .await?;
    let mut summary = ReconcileSummary { examined: tasks.len(), ..Default::default() };

    for task in tasks {
        if cancel.is_cancelled() {
            break;
        }
        let Some(total_pages) = task.total_pages else {
            // Discovery never finished for this one; nothing to compare.
            summary.unchanged += 1;
            continue;
        };

        let persisted = db.persisted_pages_for(task.clone()).await?;
        let planned: BTreeSet<u32> = (1..=total_pages.max(0) as u32).collect();
        let new_missing: BTreeSet<u32> = planned.difference(&persisted).copied().collect();

        let new_status = if new_missing.is_empty() {
            TaskStatus::Complete
        } else if new_missing != task.missing_pages {
            TaskStatus::Partial
        } else {
            task.status
        };

        if new_status == task.status && new_missing == task.missing_pages {
            summary.unchanged += 1;
            continue;
        }

        debug!(
            "reconcile {}: {} -> {}, {} pages still missing",
            task.task_id,
            task.status.as_str(),
            new_status.as_str(),
            new_missing.len()
        );
        match new_status {
            TaskStatus::Complete => summary.completed += 1,
            TaskStatus::Partial => summary.now_partial += 1,
            _ => summary.unchanged += 1,
        }

        let mut update = TaskUpdate::from_task(&task);
        update.status = new_status;
        update.missing_pages = new_missing;
        writer.update_task(update, false).await?;
    }

    writer.flush().await?;
    info!(
        "reconciler: {} tasks examined, {} completed, {} partial, {} unchanged",
        summary.examined, summary.completed, summary.now_partial, summary.unchanged
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use crate::data_structures::{ArbitraryJson, ExtractionTask, PageRequest, PageResponse};
    use crate::storage;
    use crate::testing::{date, page_body, spawn_writer};

    fn success_response(endpoint: &str, page: u32) -> PageResponse {
        let mut parameters = ArbitraryJson::new();
        parameters.insert("pagina".into(), page.into());
        PageResponse {
            request: PageRequest {
                endpoint_name: endpoint.to_string(),
                url: format!("https://example.test/v1/{}?pagina={}", endpoint, page),
                parameters,
                data_date: date("2024-01-01"),
                page,
                page_size: 500,
            },
            status: 200,
            headers: ArbitraryJson::new(),
            body: Some(page_body(9, 3, &format!("p{}", page)).into_bytes()),
            total_records: Some(9),
            total_pages: Some(3),
            elapsed: Duration::from_millis(1),
            error: None,
        }
    }

    fn fetching_task(missing: &[u32]) -> ExtractionTask {
        let mut task = ExtractionTask::new("contratos", date("2024-01-01"), None, "fp");
        task.status = TaskStatus::Fetching;
        task.total_pages = Some(3);
        task.total_records = Some(9);
        task.missing_pages = missing.iter().copied().collect();
        task
    }

    async fn harness(
        persisted_pages: &[u32],
        task: ExtractionTask,
    ) -> (tempfile::TempDir, ReconcileSummary, ExtractionTask) {
        let dir = tempfile::tempdir().unwrap();
        let (writer, _stats, cancel) = spawn_writer(&dir, "run-r").await;
        writer.handle().insert_tasks(vec![task]).await.unwrap();
        for page in persisted_pages {
            writer.handle().submit(success_response("contratos", *page)).await.unwrap();
        }

        let db = Database::new(dir.path().join("test.db"));
        let summary = reconcile(&db, writer.handle(), &cancel).await.unwrap();
        writer.shutdown().await.unwrap();

        let conn = storage::open_connection(&dir.path().join("test.db")).unwrap();
        let tasks = storage::load_tasks(
            &conn,
            &[
                TaskStatus::Fetching,
                TaskStatus::Partial,
                TaskStatus::Complete,
                TaskStatus::Failed,
            ],
        )
        .unwrap();
        (dir, summary, tasks.into_iter().next().unwrap())
    }

    #[tokio::test]
    async fn all_pages_persisted_means_complete() {
        let (_dir, summary, task) = harness(&[1, 2, 3], fetching_task(&[2, 3])).await;
        assert_eq!(summary.completed, 1);
        assert_eq!(task.status, TaskStatus::Complete);
        assert!(task.missing_pages.is_empty());
    }

    #[tokio::test]
    async fn shrunk_missing_set_means_partial() {
        let (_dir, summary, task) = harness(&[1, 2], fetching_task(&[2, 3])).await;
        assert_eq!(summary.now_partial, 1);
        assert_eq!(task.status, TaskStatus::Partial);
        assert_eq!(task.missing_pages, [3].into_iter().collect());
    }

    #[tokio::test]
    async fn no_progress_keeps_fetching() {
        let (_dir, summary, task) = harness(&[1], fetching_task(&[2, 3])).await;
        assert_eq!(summary.unchanged, 1);
        assert_eq!(task.status, TaskStatus::Fetching);
        assert_eq!(task.missing_pages, [2, 3].into_iter().collect());
    }

    #[tokio::test]
    async fn reconciliation_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, _stats, cancel) = spawn_writer(&dir, "run-r").await;
        writer.handle().insert_tasks(vec![fetching_task(&[2, 3])]).await.unwrap();
        for page in [1, 2, 3] {
            writer.handle().submit(success_response("contratos", page)).await.unwrap();
        }

        let db = Database::new(dir.path().join("test.db"));
        let first = reconcile(&db, writer.handle(), &cancel).await.unwrap();
        assert_eq!(first.completed, 1);

        // A second pass sees no active tasks at all.
        let second = reconcile(&db, writer.handle(), &cancel).await.unwrap();
        assert_eq!(second.examined, 0);
        writer.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn tasks_without_discovery_metadata_are_left_alone() {
        let mut task = fetching_task(&[]);
        task.total_pages = None;
        let (_dir, summary, loaded) = harness(&[], task).await;
        assert_eq!(summary.unchanged, 1);
        assert_eq!(loaded.status, TaskStatus::Fetching);
    }
}
