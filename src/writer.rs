//! Single-writer persistence pipeline.
//!
//! All mutations of the content store, request log and task store funnel
//! through one worker thread that owns the only writable connection.
//! Producers enqueue commands on a bounded channel; a full queue blocks them,
//! which is the backpressure that keeps the fetch pipeline honest when disk
//! cannot keep up. Commands are committed in batches, one transaction per
//! batch, and every submitted result is committed exactly once: transient
//! database errors retry the whole batch, and exhaustion cancels the run.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use log::{debug, error, info, warn};
use lru::LruCache;
use rusqlite::Connection;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::data_structures::{ExtractionTask, PageResponse, RunStats, TaskUpdate};
use crate::error::{ExtractError, ExtractResult};
use crate::storage;

const RECENT_HASH_CAPACITY: usize = 4096;
const WRITE_RETRY_ATTEMPTS: u32 = 5;
const WRITE_RETRY_BASE: Duration = Duration::from_millis(100);
const BATCH_LIMIT: usize = 64;

pub enum WriteCommand {
    Result(Box<PageResponse>),
    ResultBatch(Vec<PageResponse>),
    InsertTasks(Vec<ExtractionTask>, oneshot::Sender<usize>),
    UpdateTask(TaskUpdate, Option<oneshot::Sender<()>>),
    Flush(oneshot::Sender<()>),
}

/// Cheap clone handed to every producer.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<WriteCommand>,
}

impl WriterHandle {
    fn closed() -> ExtractError {
        ExtractError::Storage("writer queue closed".to_string())
    }

    /// Enqueue one fetch result. Blocks once the queue bound is reached.
    pub async fn submit(&self, response: PageResponse) -> ExtractResult<()> {
        self.tx
            .send(WriteCommand::Result(Box::new(response)))
            .await
            .map_err(|_| Self::closed())
    }

    pub async fn submit_batch(&self, responses: Vec<PageResponse>) -> ExtractResult<()> {
        if responses.is_empty() {
            return Ok(());
        }
        self.tx
            .send(WriteCommand::ResultBatch(responses))
            .await
            .map_err(|_| Self::closed())
    }

    /// Insert-if-absent; resolves to the number of newly created tasks.
    pub async fn insert_tasks(&self, tasks: Vec<ExtractionTask>) -> ExtractResult<usize> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(WriteCommand::InsertTasks(tasks, ack_tx))
            .await
            .map_err(|_| Self::closed())?;
        ack_rx.await.map_err(|_| Self::closed())
    }

    /// Apply a task mutation. With `ack`, resolves only after the update has
    /// been committed, which callers use for happens-before sequencing.
    pub async fn update_task(&self, update: TaskUpdate, ack: bool) -> ExtractResult<()> {
        if ack {
            let (ack_tx, ack_rx) = oneshot::channel();
            self.tx
                .send(WriteCommand::UpdateTask(update, Some(ack_tx)))
                .await
                .map_err(|_| Self::closed())?;
            ack_rx.await.map_err(|_| Self::closed())
        } else {
            self.tx
                .send(WriteCommand::UpdateTask(update, None))
                .await
                .map_err(|_| Self::closed())
        }
    }

    /// Wait until everything enqueued before this call is committed.
    pub async fn flush(&self) -> ExtractResult<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(WriteCommand::Flush(ack_tx))
            .await
            .map_err(|_| Self::closed())?;
        ack_rx.await.map_err(|_| Self::closed())
    }
}

pub struct Writer {
    handle: WriterHandle,
    join: thread::JoinHandle<ExtractResult<()>>,
}

impl Writer {
    /// Start the worker thread. Resolves once the database is open and the
    /// schema exists; schema-init failures are fatal and surface here.
    pub async fn spawn(
        db_path: PathBuf,
        run_id: String,
        stats: Arc<RunStats>,
        cancel: CancellationToken,
        queue_depth: usize,
    ) -> ExtractResult<Writer> {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let (ready_tx, ready_rx) = oneshot::channel();

        let join = thread::Builder::new()
            .name("baliza-writer".to_string())
            .spawn(move || writer_loop(db_path, run_id, stats, cancel, rx, ready_tx))
            .map_err(|e| ExtractError::Storage(format!("writer thread spawn failed: {}", e)))?;

        match ready_rx.await {
            Ok(Ok(())) => Ok(Writer { handle: WriterHandle { tx }, join }),
            Ok(Err(msg)) => Err(ExtractError::Storage(msg)),
            Err(_) => Err(ExtractError::Storage("writer thread died during init".to_string())),
        }
    }

    pub fn handle(&self) -> &WriterHandle {
        &self.handle
    }

    /// Drain the queue, close the database and surface any fatal error the
    /// worker hit.
    pub async fn shutdown(self) -> ExtractResult<()> {
        let Writer { handle, join } = self;
        drop(handle);
        tokio::task::spawn_blocking(move || join.join())
            .await
            .map_err(|e| ExtractError::Storage(format!("writer join task failed: {}", e)))?
            .map_err(|_| ExtractError::Storage("writer thread panicked".to_string()))?
    }
}

fn writer_loop(
    db_path: PathBuf,
    run_id: String,
    stats: Arc<RunStats>,
    cancel: CancellationToken,
    mut rx: mpsc::Receiver<WriteCommand>,
    ready_tx: oneshot::Sender<Result<(), String>>,
) -> ExtractResult<()> {
    let mut conn = match storage::open_connection(&db_path) {
        Ok(conn) => {
            let _ = ready_tx.send(Ok(()));
            conn
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e.to_string()));
            return Err(e);
        }
    };

    let mut recent = LruCache::new(
        NonZeroUsize::new(RECENT_HASH_CAPACITY).unwrap_or(NonZeroUsize::MIN),
    );
    let mut committed: u64 = 0;

    while let Some(first) = rx.blocking_recv() {
        let mut batch = vec![first];
        while batch.len() < BATCH_LIMIT {
            match rx.try_recv() {
                Ok(cmd) => batch.push(cmd),
                Err(_) => break,
            }
        }

        match commit_batch(&mut conn, &run_id, &stats, &mut recent, &batch) {
            Ok(replies) => {
                committed += batch.len() as u64;
                debug!("writer: committed batch of {} ({} total)", batch.len(), committed);
                send_acks(batch, replies);
            }
            Err(e) => {
                error!("writer: fatal storage failure, cancelling run: {}", e);
                cancel.cancel();
                return Err(e);
            }
        }
    }

    info!("writer: queue drained after {} commands", committed);
    Ok(())
}

enum Reply {
    None,
    Inserted(usize),
}

/// One transaction per attempt; transient busy/locked errors roll back and
/// retry the whole batch with backoff.
fn commit_batch(
    conn: &mut Connection,
    run_id: &str,
    stats: &RunStats,
    recent: &mut LruCache<String, String>,
    batch: &[WriteCommand],
) -> ExtractResult<Vec<Reply>> {
    let mut attempt = 1;
    loop {
        match apply_batch(conn, run_id, stats, recent, batch) {
            Ok(replies) => return Ok(replies),
            Err(e) if storage::is_transient(&e) && attempt < WRITE_RETRY_ATTEMPTS => {
                let delay = WRITE_RETRY_BASE * (1u32 << attempt.min(5));
                warn!(
                    "writer: transient storage error (attempt {}/{}), retrying in {:?}: {}",
                    attempt, WRITE_RETRY_ATTEMPTS, delay, e
                );
                thread::sleep(delay);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[derive(Default)]
struct BatchCounters {
    persisted: u64,
    failed: u64,
    dedup_hits: u64,
    bytes: u64,
}

fn apply_batch(
    conn: &mut Connection,
    run_id: &str,
    stats: &RunStats,
    recent: &mut LruCache<String, String>,
    batch: &[WriteCommand],
) -> ExtractResult<Vec<Reply>> {
    let tx = conn.transaction().map_err(storage::db_err)?;
    let mut replies = Vec::with_capacity(batch.len());
    let mut counters = BatchCounters::default();

    for cmd in batch {
        match cmd {
            WriteCommand::Result(response) => {
                apply_result(&tx, run_id, recent, response, &mut counters)?;
                replies.push(Reply::None);
            }
            WriteCommand::ResultBatch(responses) => {
                for response in responses {
                    apply_result(&tx, run_id, recent, response, &mut counters)?;
                }
                replies.push(Reply::None);
            }
            WriteCommand::InsertTasks(tasks, _) => {
                let inserted = storage::upsert_tasks(&tx, tasks)?;
                replies.push(Reply::Inserted(inserted));
            }
            WriteCommand::UpdateTask(update, _) => {
                storage::update_task(&tx, update)?;
                replies.push(Reply::None);
            }
            WriteCommand::Flush(_) => {
                replies.push(Reply::None);
            }
        }
    }

    tx.commit().map_err(storage::db_err)?;

    // Counters move only after the commit so retried batches never double.
    RunStats::add(&stats.pages_persisted, counters.persisted);
    RunStats::add(&stats.pages_failed, counters.failed);
    RunStats::add(&stats.dedup_hits, counters.dedup_hits);
    RunStats::add(&stats.bytes_downloaded, counters.bytes);
    Ok(replies)
}

fn apply_result(
    conn: &Connection,
    run_id: &str,
    recent: &mut LruCache<String, String>,
    response: &PageResponse,
    counters: &mut BatchCounters,
) -> ExtractResult<()> {
    let outcome = storage::persist_result(conn, response, run_id, recent)?;
    if response.is_persistable_success() || response.is_empty_success() {
        counters.persisted += 1;
    } else {
        counters.failed += 1;
    }
    if outcome.dedup_hit {
        counters.dedup_hits += 1;
    }
    counters.bytes += outcome.content_bytes;
    Ok(())
}

fn send_acks(batch: Vec<WriteCommand>, replies: Vec<Reply>) {
    for (cmd, reply) in batch.into_iter().zip(replies) {
        match (cmd, reply) {
            (WriteCommand::InsertTasks(_, ack), Reply::Inserted(n)) => {
                let _ = ack.send(n);
            }
            (WriteCommand::UpdateTask(_, Some(ack)), _) => {
                let _ = ack.send(());
            }
            (WriteCommand::Flush(ack), _) => {
                let _ = ack.send(());
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::time::Duration as StdDuration;
    use crate::data_structures::{ArbitraryJson, PageRequest, TaskStatus};

    fn response(page: u32, status: u16, body: Option<&[u8]>) -> PageResponse {
        let mut parameters = ArbitraryJson::new();
        parameters.insert("pagina".into(), page.into());
        PageResponse {
            request: PageRequest {
                endpoint_name: "contratos".to_string(),
                url: format!("https://example.test/v1/contratos?pagina={}", page),
                parameters,
                data_date: "2024-01-01".parse().unwrap(),
                page,
                page_size: 500,
            },
            status,
            headers: ArbitraryJson::new(),
            body: body.map(|b| b.to_vec()),
            total_records: Some(3),
            total_pages: Some(2),
            elapsed: StdDuration::from_millis(5),
            error: if status == 200 { None } else { Some("boom".to_string()) },
        }
    }

    async fn spawn_writer(dir: &tempfile::TempDir) -> (Writer, Arc<RunStats>, CancellationToken) {
        let stats = Arc::new(RunStats::default());
        let cancel = CancellationToken::new();
        let writer = Writer::spawn(
            dir.path().join("test.db"),
            "run-1".to_string(),
            stats.clone(),
            cancel.clone(),
            32,
        )
        .await
        .unwrap();
        (writer, stats, cancel)
    }

    #[tokio::test]
    async fn every_submitted_result_is_committed_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, stats, _cancel) = spawn_writer(&dir).await;
        let body = br#"{"totalRegistros": 3, "totalPaginas": 2, "data": [1]}"#;

        writer.handle().submit(response(1, 200, Some(body))).await.unwrap();
        writer.handle().submit(response(2, 200, Some(body))).await.unwrap();
        writer.handle().submit(response(3, 500, None)).await.unwrap();
        writer.handle().flush().await.unwrap();

        let conn = storage::open_connection(&dir.path().join("test.db")).unwrap();
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM pncp_requests", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 3);

        // Identical payloads deduplicate into one blob with refcount 2.
        let (blobs, refs): (i64, i64) = conn
            .query_row(
                "SELECT COUNT(*), SUM(reference_count) FROM pncp_content",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(blobs, 1);
        assert_eq!(refs, 2);

        let snap = stats.snapshot();
        assert_eq!(snap.pages_persisted, 2);
        assert_eq!(snap.pages_failed, 1);
        assert_eq!(snap.dedup_hits, 1);

        writer.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn task_inserts_are_idempotent_through_the_queue() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, _stats, _cancel) = spawn_writer(&dir).await;
        let task = ExtractionTask::new("contratos", "2024-01-01".parse().unwrap(), None, "fp");

        assert_eq!(writer.handle().insert_tasks(vec![task.clone()]).await.unwrap(), 1);
        assert_eq!(writer.handle().insert_tasks(vec![task]).await.unwrap(), 0);
        writer.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn acked_update_lands_after_earlier_submissions() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, _stats, _cancel) = spawn_writer(&dir).await;
        let task = ExtractionTask::new("contratos", "2024-01-01".parse().unwrap(), None, "fp");
        writer.handle().insert_tasks(vec![task.clone()]).await.unwrap();

        // FIFO on one queue: the page-1 row is committed no later than the
        // acked status flip that follows it.
        writer
            .handle()
            .submit(response(1, 200, Some(br#"{"totalPaginas": 1}"#)))
            .await
            .unwrap();
        let mut update = TaskUpdate::from_task(&task);
        update.status = TaskStatus::Fetching;
        update.total_pages = Some(1);
        update.missing_pages = BTreeSet::new();
        writer.handle().update_task(update, true).await.unwrap();

        let conn = storage::open_connection(&dir.path().join("test.db")).unwrap();
        let page_rows: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM pncp_requests WHERE current_page = 1 AND response_code = 200",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(page_rows, 1);
        let status: String = conn
            .query_row("SELECT status FROM pncp_extraction_tasks", [], |r| r.get(0))
            .unwrap();
        assert_eq!(status, "FETCHING");

        writer.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_drains_everything_still_queued() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, _stats, _cancel) = spawn_writer(&dir).await;
        for page in 1..=20 {
            let body = format!("{{\"pagina\": {}}}", page);
            writer.handle().submit(response(page, 200, Some(body.as_bytes()))).await.unwrap();
        }
        writer.shutdown().await.unwrap();

        let conn = storage::open_connection(&dir.path().join("test.db")).unwrap();
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM pncp_requests", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 20);
    }
}
