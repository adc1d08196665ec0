//! # Stage: Store
//!
//! ## Responsibility
//! SQLite persistence for experiments, variants, snapshots, the optimization
//! action log, the job run log, and the collaborator input tables (content,
//! insights, members, subscriptions, conversion attempts).
//!
//! ## Guarantees
//! - Atomic: multi-row writes (test + variants) run inside one transaction and
//!   roll back together
//! - Idempotent snapshots: `UNIQUE(period_type, snapshot_day)` backs the
//!   one-snapshot-per-day rule even if two writers race
//! - Non-panicking: a poisoned connection mutex is recovered, not propagated
//!
//! ## NOT Responsible For
//! - Aggregation logic (performance tracker)
//! - Inter-process locking

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::models::{
    AttemptStatus, ContentRecord, ConversionAttempt, ExperimentTest, ExperimentVariant,
    InsightRecord, JobRunRecord, MemberRecord, MemberTier, OptimizationAction, PerformanceSnapshot,
    PeriodType, SubscriptionRecord, SubscriptionStatus, TestStatus,
};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json column error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not found: {0}")]
    NotFound(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Time helpers
// ---------------------------------------------------------------------------

pub(crate) fn to_ms(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

pub(crate) fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn opt_ms(t: Option<DateTime<Utc>>) -> Option<i64> {
    t.map(to_ms)
}

fn json_col<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

// ---------------------------------------------------------------------------
// Column lists + row mappers
// ---------------------------------------------------------------------------

const TEST_COLS: &str = "id, name, hypothesis, variable, insight_id, asset, status, started_at, \
     completed_at, winning_variant_id, confidence_level, improvement_percentage, updated_at";

fn row_to_test(row: &Row<'_>) -> rusqlite::Result<ExperimentTest> {
    let status: String = row.get(6)?;
    Ok(ExperimentTest {
        id: row.get(0)?,
        name: row.get(1)?,
        hypothesis: row.get(2)?,
        variable: row.get(3)?,
        insight_id: row.get(4)?,
        asset: row.get(5)?,
        status: TestStatus::from_str(&status),
        started_at: from_ms(row.get(7)?),
        completed_at: row.get::<_, Option<i64>>(8)?.map(from_ms),
        winning_variant_id: row.get(9)?,
        confidence_level: row.get(10)?,
        improvement_percentage: row.get(11)?,
        updated_at: from_ms(row.get(12)?),
    })
}

const VARIANT_COLS: &str = "id, test_id, name, is_control, config, impressions, engagement_count, \
     sample_size, engagement_rate, click_through_rate, updated_at";

fn row_to_variant(row: &Row<'_>) -> rusqlite::Result<ExperimentVariant> {
    Ok(ExperimentVariant {
        id: row.get(0)?,
        test_id: row.get(1)?,
        name: row.get(2)?,
        is_control: row.get(3)?,
        config: json_col(row, 4)?,
        impressions: row.get::<_, i64>(5)? as u64,
        engagement_count: row.get::<_, i64>(6)? as u64,
        sample_size: row.get::<_, i64>(7)? as u64,
        engagement_rate: row.get(8)?,
        click_through_rate: row.get(9)?,
        updated_at: from_ms(row.get(10)?),
    })
}

const SNAPSHOT_COLS: &str = "id, period_type, snapshot_date, snapshot_day, content_published_count, \
     avg_engagement_rate, total_impressions, total_clicks, new_conversions, total_paying_members, \
     revenue, conversion_rate, top_performing_format, top_performing_asset, \
     top_performing_insight_type, avg_insight_confidence";

fn row_to_snapshot(row: &Row<'_>) -> rusqlite::Result<PerformanceSnapshot> {
    let period: String = row.get(1)?;
    Ok(PerformanceSnapshot {
        id: row.get(0)?,
        period_type: PeriodType::from_str(&period),
        snapshot_date: from_ms(row.get(2)?),
        snapshot_day: row.get(3)?,
        content_published_count: row.get::<_, i64>(4)? as u64,
        avg_engagement_rate: row.get(5)?,
        total_impressions: row.get::<_, i64>(6)? as u64,
        total_clicks: row.get::<_, i64>(7)? as u64,
        new_conversions: row.get::<_, i64>(8)? as u64,
        total_paying_members: row.get::<_, i64>(9)? as u64,
        revenue: row.get(10)?,
        conversion_rate: row.get(11)?,
        top_performing_format: row.get(12)?,
        top_performing_asset: row.get(13)?,
        top_performing_insight_type: row.get(14)?,
        avg_insight_confidence: row.get(15)?,
    })
}

const CONTENT_COLS: &str = "id, variant_id, format, asset, insight_type, views, likes, comments, \
     shares, engagement_rate, published_at";

fn row_to_content(row: &Row<'_>) -> rusqlite::Result<ContentRecord> {
    Ok(ContentRecord {
        id: row.get(0)?,
        variant_id: row.get(1)?,
        format: row.get(2)?,
        asset: row.get(3)?,
        insight_type: row.get(4)?,
        views: row.get::<_, i64>(5)? as u64,
        likes: row.get::<_, i64>(6)? as u64,
        comments: row.get::<_, i64>(7)? as u64,
        shares: row.get::<_, i64>(8)? as u64,
        engagement_rate: row.get(9)?,
        published_at: from_ms(row.get(10)?),
    })
}

const INSIGHT_COLS: &str = "id, asset, insight_type, confidence, is_published, details, timestamp";

fn row_to_insight(row: &Row<'_>) -> rusqlite::Result<InsightRecord> {
    Ok(InsightRecord {
        id: row.get(0)?,
        asset: row.get(1)?,
        insight_type: row.get(2)?,
        confidence: row.get(3)?,
        is_published: row.get(4)?,
        details: json_col(row, 5)?,
        timestamp: from_ms(row.get(6)?),
    })
}

fn row_to_attempt(row: &Row<'_>) -> rusqlite::Result<ConversionAttempt> {
    let status: String = row.get(2)?;
    Ok(ConversionAttempt {
        id: row.get(0)?,
        discount_percentage: row.get::<_, i64>(1)? as u32,
        status: AttemptStatus::from_str(&status),
        clicked_at: row.get::<_, Option<i64>>(3)?.map(from_ms),
        sent_at: from_ms(row.get(4)?),
    })
}

fn row_to_action(row: &Row<'_>) -> rusqlite::Result<OptimizationAction> {
    Ok(OptimizationAction {
        id: row.get(0)?,
        timestamp: from_ms(row.get(1)?),
        action: row.get(2)?,
        component: row.get(3)?,
        parameters: json_col(row, 4)?,
        rationale: row.get(5)?,
        confidence: row.get(6)?,
    })
}

fn row_to_job_run(row: &Row<'_>) -> rusqlite::Result<JobRunRecord> {
    Ok(JobRunRecord {
        id: row.get(0)?,
        job_id: row.get(1)?,
        status: row.get(2)?,
        started_at: from_ms(row.get(3)?),
        duration_ms: row.get::<_, i64>(4)? as u64,
        error: row.get(5)?,
        steps: json_col(row, 6)?,
    })
}

/// Insert or replace a variant row on an open connection or transaction.
fn write_variant(conn: &Connection, v: &ExperimentVariant) -> StoreResult<()> {
    conn.execute(
        &format!("INSERT OR REPLACE INTO experiment_variants ({VARIANT_COLS}) \
                  VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"),
        params![
            v.id,
            v.test_id,
            v.name,
            v.is_control,
            serde_json::to_string(&v.config)?,
            v.impressions as i64,
            v.engagement_count as i64,
            v.sample_size as i64,
            v.engagement_rate,
            v.click_through_rate,
            to_ms(v.updated_at),
        ],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Shared handle to the optimizer database. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) a database at `path`. `:memory:` opens a private
    /// in-memory database.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if path.as_os_str() == ":memory:" {
            return Self::open_in_memory();
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             PRAGMA busy_timeout=5000;",
        )?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::create_tables(&conn)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// Lock the connection. A poisoned lock is recovered: the connection
    /// itself is still consistent because every write is transactional.
    fn with_conn<F, R>(&self, f: F) -> StoreResult<R>
    where
        F: FnOnce(&mut Connection) -> StoreResult<R>,
    {
        let mut guard = self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    fn create_tables(conn: &Connection) -> StoreResult<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS experiment_tests (\
               id TEXT PRIMARY KEY,\
               name TEXT NOT NULL,\
               hypothesis TEXT NOT NULL,\
               variable TEXT NOT NULL,\
               insight_id TEXT,\
               asset TEXT,\
               status TEXT NOT NULL DEFAULT 'active',\
               started_at INTEGER NOT NULL,\
               completed_at INTEGER,\
               winning_variant_id TEXT,\
               confidence_level REAL,\
               improvement_percentage REAL,\
               updated_at INTEGER NOT NULL\
             );\
             CREATE TABLE IF NOT EXISTS experiment_variants (\
               id TEXT PRIMARY KEY,\
               test_id TEXT NOT NULL REFERENCES experiment_tests(id) ON DELETE CASCADE,\
               name TEXT NOT NULL,\
               is_control INTEGER NOT NULL DEFAULT 0,\
               config TEXT NOT NULL DEFAULT '{}',\
               impressions INTEGER NOT NULL DEFAULT 0,\
               engagement_count INTEGER NOT NULL DEFAULT 0,\
               sample_size INTEGER NOT NULL DEFAULT 0,\
               engagement_rate REAL NOT NULL DEFAULT 0,\
               click_through_rate REAL NOT NULL DEFAULT 0,\
               updated_at INTEGER NOT NULL\
             );\
             CREATE TABLE IF NOT EXISTS performance_snapshots (\
               id TEXT PRIMARY KEY,\
               period_type TEXT NOT NULL,\
               snapshot_date INTEGER NOT NULL,\
               snapshot_day TEXT NOT NULL,\
               content_published_count INTEGER NOT NULL DEFAULT 0,\
               avg_engagement_rate REAL NOT NULL DEFAULT 0,\
               total_impressions INTEGER NOT NULL DEFAULT 0,\
               total_clicks INTEGER NOT NULL DEFAULT 0,\
               new_conversions INTEGER NOT NULL DEFAULT 0,\
               total_paying_members INTEGER NOT NULL DEFAULT 0,\
               revenue REAL NOT NULL DEFAULT 0,\
               conversion_rate REAL NOT NULL DEFAULT 0,\
               top_performing_format TEXT,\
               top_performing_asset TEXT,\
               top_performing_insight_type TEXT,\
               avg_insight_confidence REAL NOT NULL DEFAULT 0,\
               UNIQUE(period_type, snapshot_day)\
             );\
             CREATE TABLE IF NOT EXISTS optimization_actions (\
               id TEXT PRIMARY KEY,\
               timestamp INTEGER NOT NULL,\
               action TEXT NOT NULL,\
               component TEXT NOT NULL,\
               parameters TEXT NOT NULL DEFAULT '{}',\
               rationale TEXT NOT NULL DEFAULT '',\
               confidence REAL NOT NULL DEFAULT 0\
             );\
             CREATE TABLE IF NOT EXISTS job_runs (\
               id TEXT PRIMARY KEY,\
               job_id TEXT NOT NULL,\
               status TEXT NOT NULL,\
               started_at INTEGER NOT NULL,\
               duration_ms INTEGER NOT NULL DEFAULT 0,\
               error TEXT,\
               steps TEXT NOT NULL DEFAULT '[]'\
             );\
             CREATE TABLE IF NOT EXISTS published_content (\
               id TEXT PRIMARY KEY,\
               variant_id TEXT,\
               format TEXT NOT NULL,\
               asset TEXT,\
               insight_type TEXT,\
               views INTEGER NOT NULL DEFAULT 0,\
               likes INTEGER NOT NULL DEFAULT 0,\
               comments INTEGER NOT NULL DEFAULT 0,\
               shares INTEGER NOT NULL DEFAULT 0,\
               engagement_rate REAL NOT NULL DEFAULT 0,\
               published_at INTEGER NOT NULL\
             );\
             CREATE TABLE IF NOT EXISTS insights (\
               id TEXT PRIMARY KEY,\
               asset TEXT NOT NULL,\
               insight_type TEXT NOT NULL,\
               confidence REAL NOT NULL,\
               is_published INTEGER NOT NULL DEFAULT 0,\
               details TEXT NOT NULL DEFAULT '{}',\
               timestamp INTEGER NOT NULL\
             );\
             CREATE TABLE IF NOT EXISTS members (\
               id TEXT PRIMARY KEY,\
               tier TEXT NOT NULL DEFAULT 'free',\
               converted_at INTEGER,\
               joined_at INTEGER NOT NULL\
             );\
             CREATE TABLE IF NOT EXISTS subscriptions (\
               id TEXT PRIMARY KEY,\
               amount REAL NOT NULL,\
               status TEXT NOT NULL,\
               created_at INTEGER NOT NULL\
             );\
             CREATE TABLE IF NOT EXISTS conversion_attempts (\
               id TEXT PRIMARY KEY,\
               discount_percentage INTEGER NOT NULL DEFAULT 0,\
               status TEXT NOT NULL,\
               clicked_at INTEGER,\
               sent_at INTEGER NOT NULL\
             );\
             CREATE INDEX IF NOT EXISTS idx_tests_status ON experiment_tests(status);\
             CREATE INDEX IF NOT EXISTS idx_variants_test ON experiment_variants(test_id);\
             CREATE INDEX IF NOT EXISTS idx_snapshots_period ON performance_snapshots(period_type, snapshot_date);\
             CREATE INDEX IF NOT EXISTS idx_actions_ts ON optimization_actions(timestamp);\
             CREATE INDEX IF NOT EXISTS idx_job_runs_job ON job_runs(job_id, started_at);\
             CREATE INDEX IF NOT EXISTS idx_content_published ON published_content(published_at);\
             CREATE INDEX IF NOT EXISTS idx_content_variant ON published_content(variant_id);\
             CREATE INDEX IF NOT EXISTS idx_insights_ts ON insights(timestamp);",
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Experiments
    // -------------------------------------------------------------------------

    pub fn count_active_tests(&self) -> StoreResult<usize> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM experiment_tests WHERE status = ?1",
                params![TestStatus::Active.as_str()],
                |r| r.get(0),
            )?;
            Ok(n as usize)
        })
    }

    /// Insert a test and all of its variants atomically.
    pub fn insert_test_with_variants(
        &self,
        test: &ExperimentTest,
        variants: &[ExperimentVariant],
    ) -> StoreResult<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                &format!("INSERT INTO experiment_tests ({TEST_COLS}) \
                          VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"),
                params![
                    test.id,
                    test.name,
                    test.hypothesis,
                    test.variable,
                    test.insight_id,
                    test.asset,
                    test.status.as_str(),
                    to_ms(test.started_at),
                    opt_ms(test.completed_at),
                    test.winning_variant_id,
                    test.confidence_level,
                    test.improvement_percentage,
                    to_ms(test.updated_at),
                ],
            )?;
            for v in variants {
                write_variant(&tx, v)?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    pub fn get_test(&self, test_id: &str) -> StoreResult<ExperimentTest> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {TEST_COLS} FROM experiment_tests WHERE id = ?1"),
                params![test_id],
                row_to_test,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    StoreError::NotFound(format!("test {test_id}"))
                }
                other => StoreError::Sqlite(other),
            })
        })
    }

    pub fn tests_with_status(&self, status: TestStatus) -> StoreResult<Vec<ExperimentTest>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TEST_COLS} FROM experiment_tests WHERE status = ?1 ORDER BY started_at ASC"
            ))?;
            let rows = stmt.query_map(params![status.as_str()], row_to_test)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// Completed tests whose `completed_at` is at or after `cutoff`.
    pub fn tests_completed_since(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<ExperimentTest>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TEST_COLS} FROM experiment_tests \
                 WHERE status = ?1 AND completed_at >= ?2 ORDER BY completed_at DESC"
            ))?;
            let rows = stmt.query_map(
                params![TestStatus::Completed.as_str(), to_ms(cutoff)],
                row_to_test,
            )?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// Persist the terminal state of a test. Refuses to touch a test that is
    /// already completed.
    pub fn complete_test(&self, test: &ExperimentTest) -> StoreResult<()> {
        self.with_conn(|conn| {
            let rows = conn.execute(
                "UPDATE experiment_tests SET status = ?1, completed_at = ?2, \
                 winning_variant_id = ?3, confidence_level = ?4, improvement_percentage = ?5, \
                 updated_at = ?6 WHERE id = ?7 AND status = ?8",
                params![
                    TestStatus::Completed.as_str(),
                    opt_ms(test.completed_at),
                    test.winning_variant_id,
                    test.confidence_level,
                    test.improvement_percentage,
                    to_ms(test.updated_at),
                    test.id,
                    TestStatus::Active.as_str(),
                ],
            )?;
            if rows == 0 {
                return Err(StoreError::NotFound(format!("active test {}", test.id)));
            }
            Ok(())
        })
    }

    pub fn variants_for_test(&self, test_id: &str) -> StoreResult<Vec<ExperimentVariant>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {VARIANT_COLS} FROM experiment_variants WHERE test_id = ?1 ORDER BY rowid ASC"
            ))?;
            let rows = stmt.query_map(params![test_id], row_to_variant)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    pub fn get_variant(&self, variant_id: &str) -> StoreResult<Option<ExperimentVariant>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {VARIANT_COLS} FROM experiment_variants WHERE id = ?1"),
                    params![variant_id],
                    row_to_variant,
                )
                .optional()?)
        })
    }

    pub fn save_variant(&self, variant: &ExperimentVariant) -> StoreResult<()> {
        self.with_conn(|conn| write_variant(conn, variant))
    }

    // -------------------------------------------------------------------------
    // Snapshots
    // -------------------------------------------------------------------------

    pub fn snapshot_for_day(
        &self,
        period: PeriodType,
        day: &str,
    ) -> StoreResult<Option<PerformanceSnapshot>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {SNAPSHOT_COLS} FROM performance_snapshots \
                         WHERE period_type = ?1 AND snapshot_day = ?2"
                    ),
                    params![period.as_str(), day],
                    row_to_snapshot,
                )
                .optional()?)
        })
    }

    /// Insert `snap` unless a row for its (period, day) exists, then return
    /// whichever row is stored.
    pub fn insert_snapshot(&self, snap: &PerformanceSnapshot) -> StoreResult<PerformanceSnapshot> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                &format!(
                    "INSERT OR IGNORE INTO performance_snapshots ({SNAPSHOT_COLS}) VALUES \
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
                ),
                params![
                    snap.id,
                    snap.period_type.as_str(),
                    to_ms(snap.snapshot_date),
                    snap.snapshot_day,
                    snap.content_published_count as i64,
                    snap.avg_engagement_rate,
                    snap.total_impressions as i64,
                    snap.total_clicks as i64,
                    snap.new_conversions as i64,
                    snap.total_paying_members as i64,
                    snap.revenue,
                    snap.conversion_rate,
                    snap.top_performing_format,
                    snap.top_performing_asset,
                    snap.top_performing_insight_type,
                    snap.avg_insight_confidence,
                ],
            )?;
            let stored = tx.query_row(
                &format!(
                    "SELECT {SNAPSHOT_COLS} FROM performance_snapshots \
                     WHERE period_type = ?1 AND snapshot_day = ?2"
                ),
                params![snap.period_type.as_str(), snap.snapshot_day],
                row_to_snapshot,
            )?;
            tx.commit()?;
            Ok(stored)
        })
    }

    /// Snapshots of `period` dated at or after `cutoff`. `newest_first`
    /// controls ordering; `limit` caps the row count.
    pub fn snapshots_since(
        &self,
        period: PeriodType,
        cutoff: DateTime<Utc>,
        newest_first: bool,
        limit: Option<usize>,
    ) -> StoreResult<Vec<PerformanceSnapshot>> {
        let order = if newest_first { "DESC" } else { "ASC" };
        let limit = limit.map(|n| n as i64).unwrap_or(-1);
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SNAPSHOT_COLS} FROM performance_snapshots \
                 WHERE period_type = ?1 AND snapshot_date >= ?2 \
                 ORDER BY snapshot_date {order} LIMIT ?3"
            ))?;
            let rows = stmt.query_map(params![period.as_str(), to_ms(cutoff), limit], row_to_snapshot)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// Most recent snapshot of any period dated at or after `cutoff`.
    pub fn latest_snapshot_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Option<PerformanceSnapshot>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {SNAPSHOT_COLS} FROM performance_snapshots \
                         WHERE snapshot_date >= ?1 ORDER BY snapshot_date DESC LIMIT 1"
                    ),
                    params![to_ms(cutoff)],
                    row_to_snapshot,
                )
                .optional()?)
        })
    }

    /// Delete snapshots dated before `cutoff`; returns the number removed.
    pub fn prune_snapshots(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        self.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM performance_snapshots WHERE snapshot_date < ?1",
                params![to_ms(cutoff)],
            )?)
        })
    }

    // -------------------------------------------------------------------------
    // Action log + job runs
    // -------------------------------------------------------------------------

    pub fn append_action(&self, action: &OptimizationAction) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO optimization_actions \
                 (id, timestamp, action, component, parameters, rationale, confidence) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    action.id,
                    to_ms(action.timestamp),
                    action.action,
                    action.component,
                    serde_json::to_string(&action.parameters)?,
                    action.rationale,
                    action.confidence,
                ],
            )?;
            Ok(())
        })
    }

    /// Actions logged at or after `cutoff`, newest first.
    pub fn actions_since(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<OptimizationAction>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, timestamp, action, component, parameters, rationale, confidence \
                 FROM optimization_actions WHERE timestamp >= ?1 ORDER BY timestamp DESC, rowid DESC",
            )?;
            let rows = stmt.query_map(params![to_ms(cutoff)], row_to_action)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    pub fn append_job_run(&self, run: &JobRunRecord) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO job_runs (id, job_id, status, started_at, duration_ms, error, steps) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    run.id,
                    run.job_id,
                    run.status,
                    to_ms(run.started_at),
                    run.duration_ms as i64,
                    run.error,
                    serde_json::to_string(&run.steps)?,
                ],
            )?;
            Ok(())
        })
    }

    /// Most recent runs of `job_id`, newest first.
    pub fn recent_job_runs(&self, job_id: &str, limit: usize) -> StoreResult<Vec<JobRunRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, job_id, status, started_at, duration_ms, error, steps FROM job_runs \
                 WHERE job_id = ?1 ORDER BY started_at DESC, rowid DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![job_id, limit as i64], row_to_job_run)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    // -------------------------------------------------------------------------
    // Collaborator ingest
    // -------------------------------------------------------------------------

    pub fn record_content(&self, c: &ContentRecord) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                &format!("INSERT OR REPLACE INTO published_content ({CONTENT_COLS}) \
                          VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"),
                params![
                    c.id,
                    c.variant_id,
                    c.format,
                    c.asset,
                    c.insight_type,
                    c.views as i64,
                    c.likes as i64,
                    c.comments as i64,
                    c.shares as i64,
                    c.engagement_rate,
                    to_ms(c.published_at),
                ],
            )?;
            Ok(())
        })
    }

    pub fn record_insight(&self, i: &InsightRecord) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                &format!("INSERT OR REPLACE INTO insights ({INSIGHT_COLS}) \
                          VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
                params![
                    i.id,
                    i.asset,
                    i.insight_type,
                    i.confidence,
                    i.is_published,
                    serde_json::to_string(&i.details)?,
                    to_ms(i.timestamp),
                ],
            )?;
            Ok(())
        })
    }

    pub fn record_member(&self, m: &MemberRecord) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO members (id, tier, converted_at, joined_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![m.id, m.tier.as_str(), opt_ms(m.converted_at), to_ms(m.joined_at)],
            )?;
            Ok(())
        })
    }

    pub fn record_subscription(&self, s: &SubscriptionRecord) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO subscriptions (id, amount, status, created_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![s.id, s.amount, s.status.as_str(), to_ms(s.created_at)],
            )?;
            Ok(())
        })
    }

    pub fn record_conversion_attempt(&self, a: &ConversionAttempt) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO conversion_attempts \
                 (id, discount_percentage, status, clicked_at, sent_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    a.id,
                    a.discount_percentage as i64,
                    a.status.as_str(),
                    opt_ms(a.clicked_at),
                    to_ms(a.sent_at),
                ],
            )?;
            Ok(())
        })
    }

    // -------------------------------------------------------------------------
    // Collaborator queries
    // -------------------------------------------------------------------------

    pub fn content_for_variant(&self, variant_id: &str) -> StoreResult<Vec<ContentRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CONTENT_COLS} FROM published_content WHERE variant_id = ?1"
            ))?;
            let rows = stmt.query_map(params![variant_id], row_to_content)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    pub fn content_since(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<ContentRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CONTENT_COLS} FROM published_content \
                 WHERE published_at >= ?1 ORDER BY published_at ASC"
            ))?;
            let rows = stmt.query_map(params![to_ms(cutoff)], row_to_content)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    pub fn insights_since(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<InsightRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {INSIGHT_COLS} FROM insights WHERE timestamp >= ?1 ORDER BY timestamp DESC"
            ))?;
            let rows = stmt.query_map(params![to_ms(cutoff)], row_to_insight)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// Unpublished insights at or after `cutoff` with confidence >= `min_confidence`
    /// that no experiment has been created for yet.
    pub fn testable_insights(
        &self,
        cutoff: DateTime<Utc>,
        min_confidence: f64,
        limit: usize,
    ) -> StoreResult<Vec<InsightRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {INSIGHT_COLS} FROM insights \
                 WHERE timestamp >= ?1 AND confidence >= ?2 AND is_published = 0 \
                 AND NOT EXISTS (SELECT 1 FROM experiment_tests t WHERE t.insight_id = insights.id) \
                 ORDER BY confidence DESC, timestamp DESC LIMIT ?3"
            ))?;
            let rows = stmt.query_map(
                params![to_ms(cutoff), min_confidence, limit as i64],
                row_to_insight,
            )?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// (total members, paying members).
    pub fn member_counts(&self) -> StoreResult<(u64, u64)> {
        self.with_conn(|conn| {
            let (total, paying): (i64, i64) = conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(CASE WHEN tier = ?1 THEN 1 ELSE 0 END), 0) FROM members",
                params![MemberTier::Paid.as_str()],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )?;
            Ok((total as u64, paying as u64))
        })
    }

    /// Paying members whose conversion happened at or after `cutoff`.
    pub fn conversions_since(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM members WHERE tier = ?1 AND converted_at >= ?2",
                params![MemberTier::Paid.as_str(), to_ms(cutoff)],
                |r| r.get(0),
            )?;
            Ok(n as u64)
        })
    }

    /// Σ amount over every active subscription.
    pub fn active_revenue(&self) -> StoreResult<f64> {
        self.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COALESCE(SUM(amount), 0.0) FROM subscriptions WHERE status = ?1",
                params![SubscriptionStatus::Active.as_str()],
                |r| r.get(0),
            )?)
        })
    }

    /// (count, Σ amount) of active subscriptions created at or after `cutoff`.
    pub fn active_subscriptions_since(&self, cutoff: DateTime<Utc>) -> StoreResult<(u64, f64)> {
        self.with_conn(|conn| {
            let (n, sum): (i64, f64) = conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(amount), 0.0) FROM subscriptions \
                 WHERE status = ?1 AND created_at >= ?2",
                params![SubscriptionStatus::Active.as_str(), to_ms(cutoff)],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )?;
            Ok((n as u64, sum))
        })
    }

    pub fn conversion_attempts_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<ConversionAttempt>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, discount_percentage, status, clicked_at, sent_at \
                 FROM conversion_attempts WHERE sent_at >= ?1",
            )?;
            let rows = stmt.query_map(params![to_ms(cutoff)], row_to_attempt)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
