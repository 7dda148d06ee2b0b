use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use super::models::*;
use crate::delta::PassDelta;
use crate::document::{Document, content_hash};
use crate::orchestrator::report::QualityReport;
use crate::pass::PassDefinition;
use crate::snapshot::{RuleSnapshot, SnapshotKind};

/// Async-safe handle to the pipeline database.
///
/// Wraps `PipelineDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<PipelineDb>>,
}

impl DbHandle {
    pub fn new(db: PipelineDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&PipelineDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Only for startup code and tests.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, PipelineDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct PipelineDb {
    conn: Connection,
}

const JOB_COLUMNS: &str = "id, document_ref, passes, current_pass_index, status, document, quality_report, error, cancel_requested, created_at, updated_at, started_at, completed_at, claim_token";

const VERSION_COLUMNS: &str = "id, job_id, section_key, pass_number, position, content, content_hash, rule_snapshot, is_best, created_at";

const SNAPSHOT_COLUMNS: &str = "job_id, pass_number, kind, rules, content_hash, taken_at";

const DELTA_COLUMNS: &str = "job_id, pass_number, pass_name, rules_fixed, rules_regressed, rules_unchanged, score_before, score_after, auto_reverted, revert_reason, section_order";

impl PipelineDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS jobs (
                    id TEXT PRIMARY KEY,
                    document_ref TEXT NOT NULL,
                    passes TEXT NOT NULL,
                    current_pass_index INTEGER NOT NULL DEFAULT 0,
                    status TEXT NOT NULL DEFAULT 'pending',
                    document TEXT NOT NULL,
                    quality_report TEXT,
                    error TEXT,
                    cancel_requested INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                    started_at TEXT,
                    completed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS section_versions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                    section_key TEXT NOT NULL,
                    pass_number INTEGER NOT NULL,
                    position INTEGER NOT NULL,
                    content TEXT NOT NULL,
                    content_hash TEXT NOT NULL,
                    rule_snapshot TEXT,
                    is_best INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE(job_id, section_key, pass_number)
                );

                CREATE TABLE IF NOT EXISTS rule_snapshots (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                    pass_number INTEGER NOT NULL,
                    kind TEXT NOT NULL CHECK (kind IN ('before', 'after')),
                    rules TEXT NOT NULL,
                    content_hash TEXT NOT NULL,
                    passed_count INTEGER NOT NULL,
                    total_count INTEGER NOT NULL,
                    taken_at TEXT NOT NULL,
                    UNIQUE(job_id, pass_number, kind)
                );

                CREATE TABLE IF NOT EXISTS pass_deltas (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                    pass_number INTEGER NOT NULL,
                    pass_name TEXT NOT NULL,
                    rules_fixed TEXT NOT NULL,
                    rules_regressed TEXT NOT NULL,
                    rules_unchanged TEXT NOT NULL,
                    score_before REAL NOT NULL,
                    score_after REAL NOT NULL,
                    auto_reverted INTEGER NOT NULL DEFAULT 0,
                    revert_reason TEXT,
                    section_order TEXT NOT NULL DEFAULT '[]',
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE(job_id, pass_number)
                );

                CREATE UNIQUE INDEX IF NOT EXISTS idx_section_versions_best
                    ON section_versions(job_id, section_key) WHERE is_best = 1;
                CREATE INDEX IF NOT EXISTS idx_section_versions_job
                    ON section_versions(job_id, section_key, pass_number);
                CREATE INDEX IF NOT EXISTS idx_rule_snapshots_job ON rule_snapshots(job_id);
                CREATE INDEX IF NOT EXISTS idx_pass_deltas_job ON pass_deltas(job_id);
                CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);

                CREATE TRIGGER IF NOT EXISTS section_versions_immutable
                BEFORE UPDATE OF job_id, section_key, pass_number, position, content, content_hash, rule_snapshot
                ON section_versions
                BEGIN
                    SELECT RAISE(ABORT, 'section versions are immutable');
                END;

                CREATE TRIGGER IF NOT EXISTS rule_snapshots_immutable
                BEFORE UPDATE ON rule_snapshots
                BEGIN
                    SELECT RAISE(ABORT, 'rule snapshots are immutable');
                END;
                ",
            )
            .context("Failed to create tables")?;

        // Additive migration for stores created before claim tokens.
        match self
            .conn
            .execute("ALTER TABLE jobs ADD COLUMN claim_token TEXT", [])
        {
            Ok(_) => {}
            Err(e) if e.to_string().contains("duplicate column") => {}
            Err(e) => return Err(anyhow::anyhow!("Failed to add claim_token column: {}", e)),
        }
        Ok(())
    }

    // ── Jobs ──────────────────────────────────────────────────────────

    /// Insert a pending job and record its initial sections as pass-0 versions.
    pub fn create_job(
        &self,
        id: &str,
        document_ref: &str,
        passes: &[PassDefinition],
        document: &Document,
    ) -> Result<Job> {
        let passes_json = serde_json::to_string(passes).context("Failed to serialize passes")?;
        let document_json =
            serde_json::to_string(document).context("Failed to serialize document")?;

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "INSERT INTO jobs (id, document_ref, passes, document) VALUES (?1, ?2, ?3, ?4)",
            params![id, document_ref, passes_json, document_json],
        )
        .context("Failed to insert job")?;

        for (position, section) in document.sections.iter().enumerate() {
            let baseline = NewSectionVersion {
                section_key: section.key.clone(),
                position,
                content: section.text(),
                rule_snapshot: None,
                mark_best: true,
            };
            insert_version(&tx, id, 0, &baseline)?;
        }
        tx.commit().context("Failed to commit job creation")?;

        self.get_job(id)?.context("Job not found after insert")
    }

    pub fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
                params![id],
                read_job_row,
            )
            .optional()
            .context("Failed to query job")?;
        row.map(JobRow::into_job).transpose()
    }

    pub fn list_jobs(&self) -> Result<Vec<Job>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM jobs ORDER BY created_at, id",
                JOB_COLUMNS
            ))
            .context("Failed to prepare list_jobs")?;
        let rows = stmt
            .query_map([], read_job_row)
            .context("Failed to query jobs")?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row.context("Failed to read job row")?.into_job()?);
        }
        Ok(jobs)
    }

    /// Atomically move a job into `running` under a fresh claim token.
    ///
    /// `paused` jobs can always be claimed; `pending` jobs only when
    /// `allow_pending` is set. The conditional update is the single point
    /// where "at most one active executor per job" is decided, and every
    /// later write by the executor must present the returned job's token.
    pub fn claim_job(&self, id: &str, allow_pending: bool) -> Result<ClaimOutcome> {
        let token = uuid::Uuid::new_v4().to_string();
        let updated = self
            .conn
            .execute(
                "UPDATE jobs
                 SET status = 'running', cancel_requested = 0, error = NULL, claim_token = ?3,
                     started_at = COALESCE(started_at, datetime('now')),
                     updated_at = datetime('now')
                 WHERE id = ?1 AND (status = 'paused' OR (?2 AND status = 'pending'))",
                params![id, allow_pending, token],
            )
            .context("Failed to claim job")?;

        match self.get_job(id)? {
            Some(job) if updated == 1 => Ok(ClaimOutcome::Claimed(job)),
            Some(job) => Ok(ClaimOutcome::Rejected(job)),
            None => Ok(ClaimOutcome::NotFound),
        }
    }

    /// Pause an idle job, or flag a running one to pause before its next pass.
    pub fn request_pause(&self, id: &str) -> Result<PauseOutcome> {
        let paused = self
            .conn
            .execute(
                "UPDATE jobs SET status = 'paused', updated_at = datetime('now')
                 WHERE id = ?1 AND status IN ('pending', 'paused')",
                params![id],
            )
            .context("Failed to pause job")?;
        if paused == 1 {
            return Ok(PauseOutcome::Paused);
        }

        let flagged = self
            .conn
            .execute(
                "UPDATE jobs SET cancel_requested = 1, updated_at = datetime('now')
                 WHERE id = ?1 AND status = 'running'",
                params![id],
            )
            .context("Failed to flag job for pause")?;
        if flagged == 1 {
            return Ok(PauseOutcome::Requested);
        }

        match self.get_job(id)? {
            Some(job) => Ok(PauseOutcome::Rejected(job.status)),
            None => Ok(PauseOutcome::NotFound),
        }
    }

    pub fn is_cancel_requested(&self, id: &str) -> Result<bool> {
        let flag: Option<bool> = self
            .conn
            .query_row(
                "SELECT cancel_requested FROM jobs WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read cancel flag")?;
        Ok(flag.unwrap_or(false))
    }

    /// Whether `token` still holds the running claim on the job.
    pub fn holds_claim(&self, id: &str, token: &str) -> Result<bool> {
        let held: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM jobs WHERE id = ?1 AND status = 'running' AND claim_token = ?2",
                params![id, token],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to check job claim")?;
        Ok(held.is_some())
    }

    /// Refresh `updated_at` for a claim that is still held.
    pub fn heartbeat(&self, id: &str, token: &str) -> Result<bool> {
        let updated = self
            .conn
            .execute(
                "UPDATE jobs SET updated_at = datetime('now')
                 WHERE id = ?1 AND status = 'running' AND claim_token = ?2",
                params![id, token],
            )
            .context("Failed to record heartbeat")?;
        Ok(updated == 1)
    }

    /// Release the claim into `paused`. Returns false if `token` no longer holds it.
    pub fn mark_paused(&self, id: &str, token: &str) -> Result<bool> {
        let updated = self
            .conn
            .execute(
                "UPDATE jobs SET status = 'paused', cancel_requested = 0, claim_token = NULL,
                     updated_at = datetime('now')
                 WHERE id = ?1 AND status = 'running' AND claim_token = ?2",
                params![id, token],
            )
            .context("Failed to mark job paused")?;
        Ok(updated == 1)
    }

    /// Record a failure. Only the executor holding the claim can fail a job.
    pub fn mark_failed(&self, id: &str, token: &str, error: &str) -> Result<bool> {
        let updated = self
            .conn
            .execute(
                "UPDATE jobs SET status = 'failed', error = ?1, cancel_requested = 0, claim_token = NULL,
                     updated_at = datetime('now'), completed_at = datetime('now')
                 WHERE id = ?2 AND status = 'running' AND claim_token = ?3",
                params![error, id, token],
            )
            .context("Failed to mark job failed")?;
        Ok(updated == 1)
    }

    pub fn mark_completed(&self, id: &str, token: &str, report: &QualityReport) -> Result<()> {
        let report_json =
            serde_json::to_string(report).context("Failed to serialize quality report")?;
        let updated = self
            .conn
            .execute(
                "UPDATE jobs SET status = 'completed', quality_report = ?1, cancel_requested = 0,
                     claim_token = NULL,
                     updated_at = datetime('now'), completed_at = datetime('now')
                 WHERE id = ?2 AND status = 'running' AND claim_token = ?3",
                params![report_json, id, token],
            )
            .context("Failed to mark job completed")?;
        if updated != 1 {
            anyhow::bail!("Job {} is no longer claimed by this executor", id);
        }
        Ok(())
    }

    /// Replace the job's current document without touching its pass index.
    /// Refused while the job is running.
    pub fn replace_document(&self, id: &str, document: &Document) -> Result<bool> {
        let document_json =
            serde_json::to_string(document).context("Failed to serialize document")?;
        let updated = self
            .conn
            .execute(
                "UPDATE jobs SET document = ?1, updated_at = datetime('now')
                 WHERE id = ?2 AND status != 'running'",
                params![document_json, id],
            )
            .context("Failed to replace job document")?;
        Ok(updated == 1)
    }

    /// Turn jobs left `running` by a dead process into `paused`.
    ///
    /// A job counts as interrupted only when nothing has refreshed its
    /// `updated_at` for `stale_after`; live executors heartbeat well inside
    /// that window. Recovery drops the claim token, so a late write from
    /// the old executor is refused.
    pub fn recover_interrupted(&self, stale_after: Duration) -> Result<Vec<String>> {
        let cutoff = format!("-{} seconds", stale_after.as_secs());
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let ids = {
            let mut stmt = tx
                .prepare(
                    "SELECT id FROM jobs
                     WHERE status = 'running' AND updated_at <= datetime('now', ?1)
                     ORDER BY id",
                )
                .context("Failed to prepare recover_interrupted")?;
            let rows = stmt
                .query_map(params![cutoff], |row| row.get::<_, String>(0))
                .context("Failed to query running jobs")?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row.context("Failed to read job id")?);
            }
            ids
        };
        for id in &ids {
            tx.execute(
                "UPDATE jobs SET status = 'paused', cancel_requested = 0, claim_token = NULL,
                     updated_at = datetime('now')
                 WHERE id = ?1 AND status = 'running'",
                params![id],
            )
            .context("Failed to pause interrupted job")?;
        }
        tx.commit().context("Failed to commit recovery")?;
        Ok(ids)
    }

    // ── Pass commit ───────────────────────────────────────────────────

    /// Persist one pass's artifacts and advance the checkpoint, all or nothing.
    ///
    /// The update is guarded on `status = 'running'`, the executor's claim
    /// token and the expected pass index, so the index can only ever move
    /// forward by one and only for the executor that holds the job.
    pub fn commit_pass(
        &self,
        job_id: &str,
        token: &str,
        expected_index: usize,
        commit: &PassCommit,
    ) -> Result<()> {
        let document_json =
            serde_json::to_string(&commit.document).context("Failed to serialize document")?;
        let expected = i64::try_from(expected_index)?;

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let updated = tx
            .execute(
                "UPDATE jobs SET document = ?1, current_pass_index = ?2, updated_at = datetime('now')
                 WHERE id = ?3 AND status = 'running' AND current_pass_index = ?4
                     AND claim_token = ?5",
                params![document_json, expected + 1, job_id, expected, token],
            )
            .context("Failed to advance job checkpoint")?;
        if updated != 1 {
            anyhow::bail!(
                "Job {} is not claimed at pass index {}; refusing to commit pass {}",
                job_id,
                expected_index,
                commit.delta.pass_number
            );
        }

        insert_snapshot(&tx, &commit.before)?;
        insert_snapshot(&tx, &commit.after)?;
        insert_delta(&tx, &commit.delta)?;
        for version in &commit.versions {
            insert_version(&tx, job_id, commit.delta.pass_number, version)?;
        }

        tx.commit().context("Failed to commit pass")?;
        Ok(())
    }

    // ── Rule snapshots ────────────────────────────────────────────────

    pub fn get_snapshot(
        &self,
        job_id: &str,
        pass_number: u32,
        kind: SnapshotKind,
    ) -> Result<Option<RuleSnapshot>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM rule_snapshots WHERE job_id = ?1 AND pass_number = ?2 AND kind = ?3",
                    SNAPSHOT_COLUMNS
                ),
                params![job_id, pass_number, kind.as_str()],
                read_snapshot_row,
            )
            .optional()
            .context("Failed to query rule snapshot")?;
        row.map(SnapshotRow::into_snapshot).transpose()
    }

    pub fn list_snapshots(&self, job_id: &str) -> Result<Vec<RuleSnapshot>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM rule_snapshots WHERE job_id = ?1 ORDER BY pass_number, kind DESC",
                SNAPSHOT_COLUMNS
            ))
            .context("Failed to prepare list_snapshots")?;
        let rows = stmt
            .query_map(params![job_id], read_snapshot_row)
            .context("Failed to query rule snapshots")?;
        let mut snapshots = Vec::new();
        for row in rows {
            snapshots.push(row.context("Failed to read snapshot row")?.into_snapshot()?);
        }
        Ok(snapshots)
    }

    // ── Pass deltas ───────────────────────────────────────────────────

    pub fn get_delta(&self, job_id: &str, pass_number: u32) -> Result<Option<PassDelta>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM pass_deltas WHERE job_id = ?1 AND pass_number = ?2",
                    DELTA_COLUMNS
                ),
                params![job_id, pass_number],
                read_delta_row,
            )
            .optional()
            .context("Failed to query pass delta")?;
        row.map(DeltaRow::into_delta).transpose()
    }

    pub fn list_deltas(&self, job_id: &str) -> Result<Vec<PassDelta>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM pass_deltas WHERE job_id = ?1 ORDER BY pass_number",
                DELTA_COLUMNS
            ))
            .context("Failed to prepare list_deltas")?;
        let rows = stmt
            .query_map(params![job_id], read_delta_row)
            .context("Failed to query pass deltas")?;
        let mut deltas = Vec::new();
        for row in rows {
            deltas.push(row.context("Failed to read delta row")?.into_delta()?);
        }
        Ok(deltas)
    }

    pub fn last_delta(&self, job_id: &str) -> Result<Option<PassDelta>> {
        Ok(self.list_deltas(job_id)?.pop())
    }

    // ── Section versions ──────────────────────────────────────────────

    /// Append a version. Fails if one already exists for (job, section, pass).
    pub fn insert_version(
        &self,
        job_id: &str,
        pass_number: u32,
        version: &NewSectionVersion,
    ) -> Result<SectionVersion> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let id = insert_version(&tx, job_id, pass_number, version)?;
        tx.commit().context("Failed to commit section version")?;
        self.get_version_by_id(id)?
            .context("Section version not found after insert")
    }

    /// Move the best flag of (job, section) to the version of `pass_number`.
    /// Returns false when no such version exists; nothing changes in that case.
    pub fn mark_best(&self, job_id: &str, section_key: &str, pass_number: u32) -> Result<bool> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let found = mark_best(&tx, job_id, section_key, pass_number)?;
        tx.commit().context("Failed to commit best-version flag")?;
        Ok(found)
    }

    fn get_version_by_id(&self, id: i64) -> Result<Option<SectionVersion>> {
        self.query_version(
            &format!("SELECT {} FROM section_versions WHERE id = ?1", VERSION_COLUMNS),
            params![id],
        )
    }

    /// The flagged best version, or the latest version when none is flagged.
    pub fn best_or_latest_version(
        &self,
        job_id: &str,
        section_key: &str,
    ) -> Result<Option<SectionVersion>> {
        self.query_version(
            &format!(
                "SELECT {} FROM section_versions WHERE job_id = ?1 AND section_key = ?2
                 ORDER BY is_best DESC, pass_number DESC LIMIT 1",
                VERSION_COLUMNS
            ),
            params![job_id, section_key],
        )
    }

    /// Latest version recorded at or before `pass_number`.
    pub fn version_at_or_before(
        &self,
        job_id: &str,
        section_key: &str,
        pass_number: u32,
    ) -> Result<Option<SectionVersion>> {
        self.query_version(
            &format!(
                "SELECT {} FROM section_versions
                 WHERE job_id = ?1 AND section_key = ?2 AND pass_number <= ?3
                 ORDER BY pass_number DESC LIMIT 1",
                VERSION_COLUMNS
            ),
            params![job_id, section_key, pass_number],
        )
    }

    /// Latest version of every section recorded strictly before `pass_number`.
    pub fn latest_versions_before(
        &self,
        job_id: &str,
        pass_number: u32,
    ) -> Result<Vec<SectionVersion>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM section_versions v
                 WHERE v.job_id = ?1 AND v.pass_number = (
                     SELECT MAX(pass_number) FROM section_versions
                     WHERE job_id = v.job_id AND section_key = v.section_key AND pass_number < ?2
                 )
                 ORDER BY v.position, v.section_key",
                VERSION_COLUMNS
            ))
            .context("Failed to prepare latest_versions_before")?;
        let rows = stmt
            .query_map(params![job_id, pass_number], read_version_row)
            .context("Failed to query latest section versions")?;
        let mut versions = Vec::new();
        for row in rows {
            versions.push(row.context("Failed to read section version row")?.into_version()?);
        }
        Ok(versions)
    }

    pub fn list_versions(&self, job_id: &str, section_key: &str) -> Result<Vec<SectionVersion>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM section_versions WHERE job_id = ?1 AND section_key = ?2
                 ORDER BY pass_number",
                VERSION_COLUMNS
            ))
            .context("Failed to prepare list_versions")?;
        let rows = stmt
            .query_map(params![job_id, section_key], read_version_row)
            .context("Failed to query section versions")?;
        let mut versions = Vec::new();
        for row in rows {
            versions.push(row.context("Failed to read section version row")?.into_version()?);
        }
        Ok(versions)
    }

    /// Section keys with a version recorded exactly at `pass_number`, by position.
    pub fn section_keys_at_pass(&self, job_id: &str, pass_number: u32) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT section_key FROM section_versions WHERE job_id = ?1 AND pass_number = ?2
                 ORDER BY position, section_key",
            )
            .context("Failed to prepare section_keys_at_pass")?;
        let rows = stmt
            .query_map(params![job_id, pass_number], |row| row.get::<_, String>(0))
            .context("Failed to query section keys")?;
        let mut keys = Vec::new();
        for row in rows {
            keys.push(row.context("Failed to read section key")?);
        }
        Ok(keys)
    }

    fn query_version(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Option<SectionVersion>> {
        let row = self
            .conn
            .query_row(sql, params, read_version_row)
            .optional()
            .context("Failed to query section version")?;
        row.map(VersionRow::into_version).transpose()
    }
}

// ── Statement helpers shared by plain calls and transactions ──────────

fn insert_version(
    conn: &Connection,
    job_id: &str,
    pass_number: u32,
    version: &NewSectionVersion,
) -> Result<i64> {
    let rule_snapshot = version
        .rule_snapshot
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .context("Failed to serialize section rule snapshot")?;

    if version.mark_best {
        conn.execute(
            "UPDATE section_versions SET is_best = 0
             WHERE job_id = ?1 AND section_key = ?2 AND is_best = 1",
            params![job_id, version.section_key],
        )
        .context("Failed to clear best-version flag")?;
    }

    conn.execute(
        "INSERT INTO section_versions
            (job_id, section_key, pass_number, position, content, content_hash, rule_snapshot, is_best)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            job_id,
            version.section_key,
            pass_number,
            i64::try_from(version.position)?,
            version.content,
            content_hash(&version.content),
            rule_snapshot,
            version.mark_best,
        ],
    )
    .with_context(|| {
        format!(
            "Failed to insert version of section '{}' for pass {}",
            version.section_key, pass_number
        )
    })?;
    Ok(conn.last_insert_rowid())
}

fn mark_best(conn: &Connection, job_id: &str, section_key: &str, pass_number: u32) -> Result<bool> {
    let exists: Option<i64> = conn
        .query_row(
            "SELECT id FROM section_versions WHERE job_id = ?1 AND section_key = ?2 AND pass_number = ?3",
            params![job_id, section_key, pass_number],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to look up section version")?;
    let Some(id) = exists else {
        return Ok(false);
    };

    conn.execute(
        "UPDATE section_versions SET is_best = 0
         WHERE job_id = ?1 AND section_key = ?2 AND is_best = 1",
        params![job_id, section_key],
    )
    .context("Failed to clear best-version flag")?;
    conn.execute(
        "UPDATE section_versions SET is_best = 1 WHERE id = ?1",
        params![id],
    )
    .context("Failed to set best-version flag")?;
    Ok(true)
}

fn insert_snapshot(conn: &Connection, snapshot: &RuleSnapshot) -> Result<()> {
    let rules = serde_json::to_string(&snapshot.rules).context("Failed to serialize rules")?;
    conn.execute(
        "INSERT INTO rule_snapshots
            (job_id, pass_number, kind, rules, content_hash, passed_count, total_count, taken_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            snapshot.job_id,
            snapshot.pass_number,
            snapshot.kind.as_str(),
            rules,
            snapshot.content_hash,
            i64::try_from(snapshot.passed_count())?,
            i64::try_from(snapshot.rules.len())?,
            snapshot.taken_at.to_rfc3339(),
        ],
    )
    .with_context(|| {
        format!(
            "Failed to insert {} snapshot for pass {}",
            snapshot.kind, snapshot.pass_number
        )
    })?;
    Ok(())
}

fn insert_delta(conn: &Connection, delta: &PassDelta) -> Result<()> {
    conn.execute(
        "INSERT INTO pass_deltas
            (job_id, pass_number, pass_name, rules_fixed, rules_regressed, rules_unchanged,
             score_before, score_after, auto_reverted, revert_reason, section_order)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            delta.job_id,
            delta.pass_number,
            delta.pass_name,
            serde_json::to_string(&delta.rules_fixed)?,
            serde_json::to_string(&delta.rules_regressed)?,
            serde_json::to_string(&delta.rules_unchanged)?,
            delta.score_before,
            delta.score_after,
            delta.auto_reverted,
            delta.revert_reason,
            serde_json::to_string(&delta.section_order)?,
        ],
    )
    .with_context(|| format!("Failed to insert delta for pass {}", delta.pass_number))?;
    Ok(())
}

// ── Row mapping ───────────────────────────────────────────────────────

fn read_job_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRow> {
    Ok(JobRow {
        id: row.get(0)?,
        document_ref: row.get(1)?,
        passes: row.get(2)?,
        current_pass_index: row.get(3)?,
        status: row.get(4)?,
        document: row.get(5)?,
        quality_report: row.get(6)?,
        error: row.get(7)?,
        cancel_requested: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
        started_at: row.get(11)?,
        completed_at: row.get(12)?,
        claim_token: row.get(13)?,
    })
}

struct VersionRow {
    id: i64,
    job_id: String,
    section_key: String,
    pass_number: u32,
    position: i64,
    content: String,
    content_hash: String,
    rule_snapshot: Option<String>,
    is_best: bool,
    created_at: String,
}

impl VersionRow {
    fn into_version(self) -> Result<SectionVersion> {
        let rule_snapshot = self
            .rule_snapshot
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("Invalid section rule snapshot JSON")?;
        Ok(SectionVersion {
            id: self.id,
            job_id: self.job_id,
            section_key: self.section_key,
            pass_number: self.pass_number,
            position: usize::try_from(self.position)?,
            content: self.content,
            content_hash: self.content_hash,
            rule_snapshot,
            is_best: self.is_best,
            created_at: self.created_at,
        })
    }
}

fn read_version_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<VersionRow> {
    Ok(VersionRow {
        id: row.get(0)?,
        job_id: row.get(1)?,
        section_key: row.get(2)?,
        pass_number: row.get(3)?,
        position: row.get(4)?,
        content: row.get(5)?,
        content_hash: row.get(6)?,
        rule_snapshot: row.get(7)?,
        is_best: row.get(8)?,
        created_at: row.get(9)?,
    })
}

struct SnapshotRow {
    job_id: String,
    pass_number: u32,
    kind: String,
    rules: String,
    content_hash: String,
    taken_at: String,
}

impl SnapshotRow {
    fn into_snapshot(self) -> Result<RuleSnapshot> {
        Ok(RuleSnapshot {
            kind: SnapshotKind::from_str(&self.kind).map_err(|e| anyhow::anyhow!(e))?,
            rules: serde_json::from_str(&self.rules).context("Invalid rules JSON")?,
            taken_at: DateTime::parse_from_rfc3339(&self.taken_at)
                .context("Invalid snapshot timestamp")?
                .with_timezone(&Utc),
            job_id: self.job_id,
            pass_number: self.pass_number,
            content_hash: self.content_hash,
        })
    }
}

fn read_snapshot_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SnapshotRow> {
    Ok(SnapshotRow {
        job_id: row.get(0)?,
        pass_number: row.get(1)?,
        kind: row.get(2)?,
        rules: row.get(3)?,
        content_hash: row.get(4)?,
        taken_at: row.get(5)?,
    })
}

struct DeltaRow {
    job_id: String,
    pass_number: u32,
    pass_name: String,
    rules_fixed: String,
    rules_regressed: String,
    rules_unchanged: String,
    score_before: f64,
    score_after: f64,
    auto_reverted: bool,
    revert_reason: Option<String>,
    section_order: String,
}

impl DeltaRow {
    fn into_delta(self) -> Result<PassDelta> {
        Ok(PassDelta {
            job_id: self.job_id,
            pass_number: self.pass_number,
            pass_name: self.pass_name,
            rules_fixed: serde_json::from_str(&self.rules_fixed).context("Invalid rules_fixed")?,
            rules_regressed: serde_json::from_str(&self.rules_regressed)
                .context("Invalid rules_regressed")?,
            rules_unchanged: serde_json::from_str(&self.rules_unchanged)
                .context("Invalid rules_unchanged")?,
            score_before: self.score_before,
            score_after: self.score_after,
            auto_reverted: self.auto_reverted,
            revert_reason: self.revert_reason,
            section_order: serde_json::from_str(&self.section_order)
                .context("Invalid section_order")?,
        })
    }
}

fn read_delta_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeltaRow> {
    Ok(DeltaRow {
        job_id: row.get(0)?,
        pass_number: row.get(1)?,
        pass_name: row.get(2)?,
        rules_fixed: row.get(3)?,
        rules_regressed: row.get(4)?,
        rules_unchanged: row.get(5)?,
        score_before: row.get(6)?,
        score_after: row.get(7)?,
        auto_reverted: row.get(8)?,
        revert_reason: row.get(9)?,
        section_order: row.get(10)?,
    })
}
