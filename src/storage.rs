//! Embedded extraction database: content store, request log, task store.
//!
//! Single-file SQLite with WAL journaling. The writer thread owns the only
//! mutating connection; every other component opens short-lived read
//! connections through [`Database`]. DDL is idempotent so startup can always
//! run it.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use chrono::{DateTime, NaiveDate, Utc};
use lru::LruCache;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::data_structures::{ExtractionTask, PageResponse, TaskStatus, TaskUpdate};
use crate::error::{ExtractError, ExtractResult};

/// Namespace for v5 content ids. Fixed forever: changing it would re-key
/// every blob ever persisted.
pub const CONTENT_NAMESPACE: Uuid = Uuid::from_u128(0xb41a_a5a0_52cf_4f2a_9e2b_7c91_d3a8_14f7);

const DATA_DATE_FORMAT: &str = "%Y-%m-%d";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS pncp_content (
    id              TEXT PRIMARY KEY,
    payload         BLOB NOT NULL,
    content_sha256  TEXT NOT NULL UNIQUE,
    byte_size       INTEGER NOT NULL,
    first_seen_at   TEXT NOT NULL,
    last_seen_at    TEXT NOT NULL,
    reference_count INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS pncp_requests (
    id                 TEXT PRIMARY KEY,
    extracted_at       TEXT NOT NULL,
    endpoint_url       TEXT NOT NULL,
    endpoint_name      TEXT NOT NULL,
    request_parameters TEXT NOT NULL,
    response_code      INTEGER NOT NULL,
    response_headers   TEXT,
    data_date          TEXT NOT NULL,
    run_id             TEXT NOT NULL,
    total_records      INTEGER,
    total_pages        INTEGER,
    current_page       INTEGER NOT NULL,
    page_size          INTEGER NOT NULL,
    content_id         TEXT REFERENCES pncp_content(id)
);

CREATE INDEX IF NOT EXISTS idx_requests_endpoint_date_page
    ON pncp_requests(endpoint_name, data_date, current_page);

CREATE INDEX IF NOT EXISTS idx_requests_content
    ON pncp_requests(content_id);

CREATE TABLE IF NOT EXISTS pncp_extraction_tasks (
    task_id          TEXT PRIMARY KEY,
    endpoint_name    TEXT NOT NULL,
    data_date        TEXT NOT NULL,
    modality         INTEGER,
    status           TEXT NOT NULL,
    total_pages      INTEGER,
    total_records    INTEGER,
    missing_pages    TEXT NOT NULL DEFAULT '[]',
    plan_fingerprint TEXT NOT NULL,
    last_error       TEXT,
    created_at       TEXT NOT NULL,
    updated_at       TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_status
    ON pncp_extraction_tasks(status);
"#;

pub fn db_err(e: rusqlite::Error) -> ExtractError {
    ExtractError::Storage(e.to_string())
}

/// Busy/locked failures clear up on their own; the writer retries them.
pub fn is_transient(e: &ExtractError) -> bool {
    match e {
        ExtractError::Storage(msg) => {
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

pub fn open_connection(path: &Path) -> ExtractResult<Connection> {
    let conn = Connection::open(path).map_err(db_err)?;
    conn.execute_batch(
        "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
    )
    .map_err(db_err)?;
    conn.execute_batch(SCHEMA).map_err(db_err)?;
    Ok(conn)
}

/// Trim-only canonicalization. No JSON re-serialization, so the content id
/// stays byte-stable across runs.
pub fn normalize_payload(body: &[u8]) -> &[u8] {
    let start = body
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(body.len());
    let end = body
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|i| i + 1)
        .unwrap_or(start);
    &body[start..end]
}

pub fn content_sha256_hex(normalized: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized);
    hex::encode(hasher.finalize())
}

/// Name-hash id over the content namespace and the payload digest.
pub fn content_id_for(sha256_hex: &str) -> String {
    Uuid::new_v5(&CONTENT_NAMESPACE, sha256_hex.as_bytes()).to_string()
}

fn date_str(d: NaiveDate) -> String {
    d.format(DATA_DATE_FORMAT).to_string()
}

fn parse_date(s: &str) -> ExtractResult<NaiveDate> {
    NaiveDate::parse_from_str(s, DATA_DATE_FORMAT)
        .map_err(|e| ExtractError::Storage(format!("bad data_date '{}': {}", s, e)))
}

fn parse_timestamp(s: &str) -> ExtractResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| ExtractError::Storage(format!("bad timestamp '{}': {}", s, e)))
}

pub fn encode_pages(pages: &BTreeSet<u32>) -> String {
    let v: Vec<u32> = pages.iter().copied().collect();
    serde_json::to_string(&v).unwrap_or_else(|_| "[]".to_string())
}

pub fn decode_pages(raw: &str) -> ExtractResult<BTreeSet<u32>> {
    let v: Vec<u32> = serde_json::from_str(raw)
        .map_err(|e| ExtractError::Storage(format!("bad missing_pages '{}': {}", raw, e)))?;
    Ok(v.into_iter().collect())
}

pub struct PersistOutcome {
    pub dedup_hit: bool,
    pub content_bytes: u64,
}

/// Persist one fetch result: content row (dedup by sha) plus request-log row
/// in the caller's transaction. A 200 always ends up referencing a blob.
pub fn persist_result(
    conn: &Connection,
    resp: &PageResponse,
    run_id: &str,
    recent: &mut LruCache<String, String>,
) -> ExtractResult<PersistOutcome> {
    let now = Utc::now().to_rfc3339();
    let mut content_id: Option<String> = None;
    let mut outcome = PersistOutcome { dedup_hit: false, content_bytes: 0 };

    if resp.is_persistable_success() {
        let body = resp.body.as_deref().unwrap_or_default();
        let normalized = normalize_payload(body);
        let sha = content_sha256_hex(normalized);

        // Recently-written hashes skip the lookup; the refcount bump still
        // happens in SQL either way.
        let cached = recent.get(&sha).cloned();
        let resolved = match cached {
            Some(id) => {
                let n = conn
                    .execute(
                        "UPDATE pncp_content
                            SET reference_count = reference_count + 1, last_seen_at = ?2
                          WHERE id = ?1",
                        params![id, now],
                    )
                    .map_err(db_err)?;
                if n == 1 {
                    outcome.dedup_hit = true;
                    Some(id)
                } else {
                    None
                }
            }
            None => None,
        };

        let id = match resolved {
            Some(id) => id,
            None => {
                let existing: Option<String> = conn
                    .query_row(
                        "SELECT id FROM pncp_content WHERE content_sha256 = ?1",
                        params![sha],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(db_err)?;
                match existing {
                    Some(id) => {
                        conn.execute(
                            "UPDATE pncp_content
                                SET reference_count = reference_count + 1, last_seen_at = ?2
                              WHERE id = ?1",
                            params![id, now],
                        )
                        .map_err(db_err)?;
                        outcome.dedup_hit = true;
                        id
                    }
                    None => {
                        let id = content_id_for(&sha);
                        conn.execute(
                            "INSERT INTO pncp_content
                                (id, payload, content_sha256, byte_size,
                                 first_seen_at, last_seen_at, reference_count)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?5, 1)",
                            params![id, normalized, sha, normalized.len() as i64, now],
                        )
                        .map_err(db_err)?;
                        outcome.content_bytes = normalized.len() as u64;
                        id
                    }
                }
            }
        };
        recent.put(sha, id.clone());
        content_id = Some(id);
    }

    let parameters = serde_json::to_string(&resp.request.parameters)
        .map_err(|e| ExtractError::Storage(format!("unserializable parameters: {}", e)))?;
    let headers = serde_json::to_string(&resp.headers)
        .map_err(|e| ExtractError::Storage(format!("unserializable headers: {}", e)))?;

    conn.execute(
        "INSERT INTO pncp_requests
            (id, extracted_at, endpoint_url, endpoint_name, request_parameters,
             response_code, response_headers, data_date, run_id,
             total_records, total_pages, current_page, page_size, content_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            Uuid::new_v4().to_string(),
            now,
            resp.request.url,
            resp.request.endpoint_name,
            parameters,
            resp.status as i64,
            headers,
            date_str(resp.request.data_date),
            run_id,
            resp.total_records,
            resp.total_pages,
            resp.request.page as i64,
            resp.request.page_size as i64,
            content_id,
        ],
    )
    .map_err(db_err)?;

    Ok(outcome)
}

/// Insert-if-absent, so planning the same range twice is a no-op. Returns
/// how many rows were actually created.
pub fn upsert_tasks(conn: &Connection, tasks: &[ExtractionTask]) -> ExtractResult<usize> {
    let mut inserted = 0;
    for task in tasks {
        inserted += conn
            .execute(
                "INSERT OR IGNORE INTO pncp_extraction_tasks
                    (task_id, endpoint_name, data_date, modality, status,
                     total_pages, total_records, missing_pages, plan_fingerprint,
                     last_error, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    task.task_id,
                    task.endpoint_name,
                    date_str(task.data_date),
                    task.modality,
                    task.status.as_str(),
                    task.total_pages,
                    task.total_records,
                    encode_pages(&task.missing_pages),
                    task.plan_fingerprint,
                    task.last_error,
                    task.created_at.to_rfc3339(),
                    task.updated_at.to_rfc3339(),
                ],
            )
            .map_err(db_err)?;
    }
    Ok(inserted)
}

pub fn update_task(conn: &Connection, update: &TaskUpdate) -> ExtractResult<()> {
    conn.execute(
        "UPDATE pncp_extraction_tasks
            SET status = ?2, total_pages = ?3, total_records = ?4,
                missing_pages = ?5, last_error = ?6, updated_at = ?7
          WHERE task_id = ?1",
        params![
            update.task_id,
            update.status.as_str(),
            update.total_pages,
            update.total_records,
            encode_pages(&update.missing_pages),
            update.last_error,
            Utc::now().to_rfc3339(),
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

struct RawTaskRow {
    task_id: String,
    endpoint_name: String,
    data_date: String,
    modality: Option<i64>,
    status: String,
    total_pages: Option<i64>,
    total_records: Option<i64>,
    missing_pages: String,
    plan_fingerprint: String,
    last_error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RawTaskRow {
    fn into_task(self) -> ExtractResult<ExtractionTask> {
        let status = TaskStatus::parse(&self.status)
            .ok_or_else(|| ExtractError::Storage(format!("unknown task status '{}'", self.status)))?;
        Ok(ExtractionTask {
            data_date: parse_date(&self.data_date)?,
            status,
            missing_pages: decode_pages(&self.missing_pages)?,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            task_id: self.task_id,
            endpoint_name: self.endpoint_name,
            modality: self.modality,
            total_pages: self.total_pages,
            total_records: self.total_records,
            plan_fingerprint: self.plan_fingerprint,
            last_error: self.last_error,
        })
    }
}

pub fn load_tasks(conn: &Connection, statuses: &[TaskStatus]) -> ExtractResult<Vec<ExtractionTask>> {
    let placeholders: Vec<&str> = statuses.iter().map(|_| "?").collect();
    let sql = format!(
        "SELECT task_id, endpoint_name, data_date, modality, status,
                total_pages, total_records, missing_pages, plan_fingerprint,
                last_error, created_at, updated_at
           FROM pncp_extraction_tasks
          WHERE status IN ({})
          ORDER BY task_id",
        placeholders.join(", ")
    );
    let mut stmt = conn.prepare(&sql).map_err(db_err)?;
    let rows = stmt
        .query_map(params_from_iter(statuses.iter().map(|s| s.as_str())), |row| {
            Ok(RawTaskRow {
                task_id: row.get(0)?,
                endpoint_name: row.get(1)?,
                data_date: row.get(2)?,
                modality: row.get(3)?,
                status: row.get(4)?,
                total_pages: row.get(5)?,
                total_records: row.get(6)?,
                missing_pages: row.get(7)?,
                plan_fingerprint: row.get(8)?,
                last_error: row.get(9)?,
                created_at: row.get(10)?,
                updated_at: row.get(11)?,
            })
        })
        .map_err(db_err)?;

    let mut tasks = Vec::new();
    for row in rows {
        tasks.push(row.map_err(db_err)?.into_task()?);
    }
    Ok(tasks)
}

/// Pages of this task that already have a 200 row. The modality predicate
/// matches the task exactly: a null-modality task never adopts rows written
/// for a concrete modality.
pub fn persisted_pages(conn: &Connection, task: &ExtractionTask) -> ExtractResult<BTreeSet<u32>> {
    let mut stmt = conn
        .prepare(
            "SELECT DISTINCT current_page
               FROM pncp_requests
              WHERE endpoint_name = ?1
                AND data_date = ?2
                AND response_code = 200
                AND ((?3 IS NULL
                      AND json_extract(request_parameters, '$.codigoModalidadeContratacao') IS NULL)
                     OR json_extract(request_parameters, '$.codigoModalidadeContratacao') = ?3)",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map(params![task.endpoint_name, date_str(task.data_date), task.modality], |row| {
            row.get::<_, i64>(0)
        })
        .map_err(db_err)?;

    let mut pages = BTreeSet::new();
    for row in rows {
        let page = row.map_err(db_err)?;
        if page > 0 {
            pages.insert(page as u32);
        }
    }
    Ok(pages)
}

pub fn distinct_fingerprints(conn: &Connection) -> ExtractResult<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT DISTINCT plan_fingerprint FROM pncp_extraction_tasks ORDER BY 1")
        .map_err(db_err)?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0)).map_err(db_err)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(db_err)?);
    }
    Ok(out)
}

pub fn status_counts(conn: &Connection) -> ExtractResult<Vec<(String, i64)>> {
    let mut stmt = conn
        .prepare("SELECT status, COUNT(*) FROM pncp_extraction_tasks GROUP BY status ORDER BY status")
        .map_err(db_err)?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
        .map_err(db_err)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(db_err)?);
    }
    Ok(out)
}

/// Non-success request rows per endpoint for this run, for the end summary.
pub fn error_counts(conn: &Connection, run_id: &str) -> ExtractResult<Vec<(String, i64)>> {
    let mut stmt = conn
        .prepare(
            "SELECT endpoint_name, COUNT(*)
               FROM pncp_requests
              WHERE run_id = ?1 AND response_code NOT IN (200, 204)
              GROUP BY endpoint_name
              ORDER BY endpoint_name",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map(params![run_id], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
        .map_err(db_err)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(db_err)?);
    }
    Ok(out)
}

/// Read handle for everything that is not the writer. Opens a short-lived
/// connection per call on the blocking pool.
#[derive(Clone)]
pub struct Database {
    path: PathBuf,
}

impl Database {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Database { path: path.into() }
    }

    pub async fn with_conn<T, F>(&self, f: F) -> ExtractResult<T>
    where
        F: FnOnce(&Connection) -> ExtractResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&path)?;
            f(&conn)
        })
        .await
        .map_err(|e| ExtractError::Storage(format!("read task panicked: {}", e)))?
    }

    pub async fn tasks_in(&self, statuses: Vec<TaskStatus>) -> ExtractResult<Vec<ExtractionTask>> {
        self.with_conn(move |conn| load_tasks(conn, &statuses)).await
    }

    pub async fn persisted_pages_for(&self, task: ExtractionTask) -> ExtractResult<BTreeSet<u32>> {
        self.with_conn(move |conn| persisted_pages(conn, &task)).await
    }

    pub async fn fingerprints(&self) -> ExtractResult<Vec<String>> {
        self.with_conn(distinct_fingerprints).await
    }

    pub async fn task_status_counts(&self) -> ExtractResult<Vec<(String, i64)>> {
        self.with_conn(status_counts).await
    }

    pub async fn error_counts_for(&self, run_id: String) -> ExtractResult<Vec<(String, i64)>> {
        self.with_conn(move |conn| error_counts(conn, &run_id)).await
    }
}
