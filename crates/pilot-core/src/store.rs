//! Persistent state store (§4.7): SQLite-backed, crash-safe PR tracking.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use crate::error::{Error, Result};
use crate::pr::PrRecord;
use crate::release_decider::BumpKind;
use crate::state_machine::{CiStatus, Stage};

pub struct StoreConfig {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// Crash-safe storage for tracked PRs, per-PR failure counters, the
/// adapter-processed-issue ledger, and free-form metadata.
#[derive(Clone)]
pub struct Store {
    #[cfg(test)]
    pub(crate) pool: SqlitePool,
    #[cfg(not(test))]
    pool: SqlitePool,
}

impl Store {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_config(path, StoreConfig::default()).await
    }

    pub async fn with_config(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&url)
            .await?;

        Self::init(pool).await
    }

    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::init(pool).await
    }

    async fn init(pool: SqlitePool) -> Result<Self> {
        sqlx::query("PRAGMA journal_mode=WAL").execute(&pool).await?;
        sqlx::query("PRAGMA foreign_keys=ON").execute(&pool).await?;
        sqlx::query("PRAGMA busy_timeout=5000").execute(&pool).await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Applies each numbered migration in order. `CREATE TABLE IF NOT
    /// EXISTS`/`CREATE INDEX IF NOT EXISTS` are naturally idempotent; any
    /// migration relying on a non-idempotent `ALTER TABLE` would be run
    /// best-effort the way the corpus's own migration runner does, tolerating
    /// an already-applied failure rather than aborting startup. None of the
    /// current migrations need that escape hatch.
    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(include_str!("../../../migrations/001_pr_state.sql"))
            .execute(&self.pool)
            .await?;
        sqlx::query(include_str!("../../../migrations/002_pr_failures.sql"))
            .execute(&self.pool)
            .await?;
        sqlx::query(include_str!("../../../migrations/003_adapter_processed.sql"))
            .execute(&self.pool)
            .await?;
        sqlx::query(include_str!("../../../migrations/004_metadata.sql"))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ==================== PR state ====================

    pub async fn upsert_pr(&self, pr: &PrRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO pr_state (
                pr_id, url, title, target_branch, linked_task_id, branch_name, head_sha,
                stage, ci_status, last_polled_at, ci_wait_start, merge_attempts, last_error,
                created_at, release_version, bump_kind, discovered_checks,
                consecutive_api_failures, environment_label
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(pr_id) DO UPDATE SET
                url = excluded.url,
                title = excluded.title,
                target_branch = excluded.target_branch,
                linked_task_id = excluded.linked_task_id,
                branch_name = excluded.branch_name,
                head_sha = excluded.head_sha,
                stage = excluded.stage,
                ci_status = excluded.ci_status,
                last_polled_at = excluded.last_polled_at,
                ci_wait_start = excluded.ci_wait_start,
                merge_attempts = excluded.merge_attempts,
                last_error = excluded.last_error,
                release_version = excluded.release_version,
                bump_kind = excluded.bump_kind,
                discovered_checks = excluded.discovered_checks,
                consecutive_api_failures = excluded.consecutive_api_failures,
                environment_label = excluded.environment_label
            "#,
        )
        .bind(pr.pr_id)
        .bind(&pr.url)
        .bind(&pr.title)
        .bind(&pr.target_branch)
        .bind(pr.linked_task_id)
        .bind(&pr.branch_name)
        .bind(&pr.head_sha)
        .bind(pr.stage.as_str())
        .bind(pr.ci_status.as_str())
        .bind(pr.last_polled_at.map(|t| t.to_rfc3339()))
        .bind(pr.ci_wait_start.map(|t| t.to_rfc3339()))
        .bind(pr.merge_attempts)
        .bind(&pr.last_error)
        .bind(pr.created_at.to_rfc3339())
        .bind(&pr.release_version)
        .bind(pr.bump_kind.map(|b| serde_json::to_string(&b).unwrap_or_default()))
        .bind(serde_json::to_string(&pr.discovered_checks)?)
        .bind(pr.consecutive_api_failures)
        .bind(&pr.environment_label)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_pr(&self, pr_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM pr_state WHERE pr_id = ?")
            .bind(pr_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Active (non-terminal-failed) PRs, restored into the controller's
    /// in-memory map on startup (§4.9).
    pub async fn load_active_prs(&self) -> Result<Vec<PrRecord>> {
        let rows = sqlx::query_as::<_, PrRow>("SELECT * FROM pr_state WHERE stage != 'failed'")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Terminal-failed rows, kept for bounded introspection until purged.
    pub async fn load_failed_prs(&self) -> Result<Vec<PrRecord>> {
        let rows = sqlx::query_as::<_, PrRow>("SELECT * FROM pr_state WHERE stage = 'failed'")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    pub async fn get_pr(&self, pr_id: i64) -> Result<Option<PrRecord>> {
        let row = sqlx::query_as::<_, PrRow>("SELECT * FROM pr_state WHERE pr_id = ?")
            .bind(pr_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    /// Deletes terminal-failed rows older than `older_than`.
    pub async fn purge_failed_prs(&self, older_than: Duration) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::seconds(older_than.as_secs() as i64);
        let result = sqlx::query("DELETE FROM pr_state WHERE stage = 'failed' AND created_at < ?")
            .bind(cutoff.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // ==================== PR failures ====================

    pub async fn record_pr_failure(&self, pr_id: i64, count: u32, last_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO pr_failures (pr_id, count, last_at)
            VALUES (?, ?, ?)
            ON CONFLICT(pr_id) DO UPDATE SET count = excluded.count, last_at = excluded.last_at
            "#,
        )
        .bind(pr_id)
        .bind(count)
        .bind(last_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn clear_pr_failure(&self, pr_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM pr_failures WHERE pr_id = ?")
            .bind(pr_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn load_pr_failures(&self) -> Result<Vec<(i64, u32, DateTime<Utc>)>> {
        let rows: Vec<(i64, i64, String)> = sqlx::query_as("SELECT pr_id, count, last_at FROM pr_failures")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|(pr_id, count, last_at)| {
                let parsed = DateTime::parse_from_rfc3339(&last_at)
                    .map_err(|e| Error::Other(e.to_string()))?
                    .with_timezone(&Utc);
                Ok((pr_id, count as u32, parsed))
            })
            .collect()
    }

    // ==================== Adapter processed ledger ====================

    pub async fn mark_processed(&self, adapter: &str, issue_id: &str, result: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO adapter_processed (adapter, issue_id, result, processed_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(adapter, issue_id) DO UPDATE SET
                result = excluded.result,
                processed_at = excluded.processed_at
            "#,
        )
        .bind(adapter)
        .bind(issue_id)
        .bind(result)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn is_processed(&self, adapter: &str, issue_id: &str) -> Result<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM adapter_processed WHERE adapter = ? AND issue_id = ?")
                .bind(adapter)
                .bind(issue_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    pub async fn purge_processed_older_than(&self, older_than: Duration) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::seconds(older_than.as_secs() as i64);
        let result = sqlx::query("DELETE FROM adapter_processed WHERE processed_at < ?")
            .bind(cutoff.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // ==================== Metadata ====================

    pub async fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        let value: Option<(String,)> = sqlx::query_as("SELECT value FROM metadata WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value.map(|(v,)| v))
    }

    pub async fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO metadata (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct PrRow {
    pr_id: i64,
    url: String,
    title: String,
    target_branch: String,
    linked_task_id: i64,
    branch_name: String,
    head_sha: String,
    stage: String,
    ci_status: String,
    last_polled_at: Option<String>,
    ci_wait_start: Option<String>,
    merge_attempts: i64,
    last_error: String,
    created_at: String,
    release_version: Option<String>,
    bump_kind: Option<String>,
    discovered_checks: String,
    consecutive_api_failures: i64,
    environment_label: String,
}

fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s).map_err(|e| Error::Other(e.to_string()))?.with_timezone(&Utc))
}

impl TryFrom<PrRow> for PrRecord {
    type Error = Error;

    fn try_from(row: PrRow) -> Result<Self> {
        Ok(PrRecord {
            pr_id: row.pr_id,
            url: row.url,
            title: row.title,
            target_branch: row.target_branch,
            linked_task_id: row.linked_task_id,
            branch_name: row.branch_name,
            head_sha: row.head_sha,
            stage: Stage::from_str(&row.stage)?,
            ci_status: CiStatus::from_str(&row.ci_status)?,
            last_polled_at: row.last_polled_at.map(|s| parse_rfc3339(&s)).transpose()?,
            ci_wait_start: row.ci_wait_start.map(|s| parse_rfc3339(&s)).transpose()?,
            merge_attempts: row.merge_attempts as u32,
            last_error: row.last_error,
            created_at: parse_rfc3339(&row.created_at)?,
            release_version: row.release_version,
            bump_kind: row
                .bump_kind
                .map(|s| serde_json::from_str::<BumpKind>(&s))
                .transpose()
                .map_err(Error::Json)?,
            discovered_checks: serde_json::from_str(&row.discovered_checks)?,
            consecutive_api_failures: row.consecutive_api_failures as u32,
            environment_label: row.environment_label,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_pr() -> PrRecord {
        PrRecord::new(1, "https://example/pr/1", "Add widget", "main", "pilot/issue-1", "dev")
    }

    #[tokio::test]
    async fn round_trips_a_pr_through_upsert_and_load() {
        let store = Store::in_memory().await.unwrap();
        let pr = sample_pr();
        store.upsert_pr(&pr).await.unwrap();

        let loaded = store.get_pr(1).await.unwrap().unwrap();
        assert_eq!(loaded.pr_id, pr.pr_id);
        assert_eq!(loaded.stage, pr.stage);
        assert_eq!(loaded.branch_name, pr.branch_name);
    }

    #[tokio::test]
    async fn upsert_is_idempotent_on_pr_id() {
        let store = Store::in_memory().await.unwrap();
        let mut pr = sample_pr();
        store.upsert_pr(&pr).await.unwrap();

        pr.transition(Stage::WaitingCi);
        store.upsert_pr(&pr).await.unwrap();

        let active = store.load_active_prs().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].stage, Stage::WaitingCi);
    }

    #[tokio::test]
    async fn failed_prs_are_excluded_from_active_set() {
        let store = Store::in_memory().await.unwrap();
        let mut pr = sample_pr();
        pr.fail("CI timed out");
        store.upsert_pr(&pr).await.unwrap();

        assert!(store.load_active_prs().await.unwrap().is_empty());
        assert_eq!(store.load_failed_prs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_removes_the_row() {
        let store = Store::in_memory().await.unwrap();
        let pr = sample_pr();
        store.upsert_pr(&pr).await.unwrap();
        store.delete_pr(pr.pr_id).await.unwrap();

        assert!(store.get_pr(pr.pr_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pr_failures_round_trip() {
        let store = Store::in_memory().await.unwrap();
        let now = Utc::now();
        store.record_pr_failure(1, 3, now).await.unwrap();

        let failures = store.load_pr_failures().await.unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, 1);
        assert_eq!(failures[0].1, 3);

        store.clear_pr_failure(1).await.unwrap();
        assert!(store.load_pr_failures().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn adapter_processed_is_idempotent_per_issue() {
        let store = Store::in_memory().await.unwrap();
        assert!(!store.is_processed("github", "42").await.unwrap());

        store.mark_processed("github", "42", "fix-created").await.unwrap();
        store.mark_processed("github", "42", "fix-created").await.unwrap();

        assert!(store.is_processed("github", "42").await.unwrap());
    }

    #[tokio::test]
    async fn metadata_round_trips() {
        let store = Store::in_memory().await.unwrap();
        assert!(store.get_metadata("last_scan_at").await.unwrap().is_none());

        store.set_metadata("last_scan_at", "2026-01-01T00:00:00Z").await.unwrap();
        assert_eq!(store.get_metadata("last_scan_at").await.unwrap().unwrap(), "2026-01-01T00:00:00Z");
    }
}
