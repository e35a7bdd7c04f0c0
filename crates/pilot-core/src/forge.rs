//! Forge adapter contract.
//!
//! The core never talks to a hosting service directly; it depends on the
//! `Forge` trait defined here. A concrete implementation (HTTP client against
//! GitHub's REST API, for example) lives in a separate crate and is injected
//! into the controller as `Arc<dyn Forge>`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by a `Forge` implementation.
///
/// `Conflict` is split out from the generic `ApiError` so the merge gate can
/// match on it directly instead of sniffing HTTP status codes or message
/// text.
#[derive(Debug, Clone, Error)]
pub enum ForgeError {
    #[error("authentication required")]
    AuthRequired,

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rate limited")]
    RateLimited,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),
}

impl ForgeError {
    /// `true` when this error should be treated as a transient hiccup rather
    /// than an authoritative answer (counts toward `ConsecutiveApiFailures`).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ForgeError::RateLimited | ForgeError::NetworkError(_) | ForgeError::ApiError { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrState {
    Open,
    Closed,
}

/// Mergeability as reported by the forge. `Unknown` means the forge has not
/// finished computing it yet and must never be treated as a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeableState {
    Clean,
    Dirty,
    Unknown,
}

impl MergeableState {
    /// `mergeable_state=dirty` is authoritative; `mergeable=false` alone also
    /// counts. `Unknown` never does.
    pub fn is_conflicting(&self, mergeable: Option<bool>) -> bool {
        matches!(self, MergeableState::Dirty) || mergeable == Some(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemotePr {
    pub id: i64,
    pub state: PrState,
    pub merged: bool,
    pub mergeable: Option<bool>,
    pub mergeable_state: MergeableState,
    pub head_sha: String,
    pub head_ref: String,
    pub merge_commit_sha: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Queued,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckConclusion {
    Success,
    Failure,
    Cancelled,
    TimedOut,
    Skipped,
    Neutral,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRun {
    pub name: String,
    pub status: CheckStatus,
    pub conclusion: Option<CheckConclusion>,
    pub external_job_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMethod {
    Merge,
    Squash,
    Rebase,
}

impl Default for MergeMethod {
    fn default() -> Self {
        MergeMethod::Squash
    }
}

impl std::fmt::Display for MergeMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MergeMethod::Merge => write!(f, "merge"),
            MergeMethod::Squash => write!(f, "squash"),
            MergeMethod::Rebase => write!(f, "rebase"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteCommit {
    pub sha: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteRelease {
    pub tag_name: String,
    pub target_sha: String,
}

pub type ForgeResult<T> = std::result::Result<T, ForgeError>;

/// Operations the core requires of a hosting-service adapter. Wire-level
/// detail (REST vs. GraphQL, pagination, auth headers) is entirely the
/// implementor's concern.
#[async_trait]
pub trait Forge: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get_pr(&self, id: i64) -> ForgeResult<RemotePr>;
    async fn list_checks(&self, sha: &str) -> ForgeResult<Vec<CheckRun>>;
    async fn get_check_logs(&self, job_id: &str) -> ForgeResult<Vec<u8>>;

    /// Errors from this call that stem from conflicts must be
    /// `ForgeError::Conflict`, never a generic `ApiError`.
    async fn merge_pr(&self, id: i64, method: MergeMethod, title: &str) -> ForgeResult<String>;

    /// Rebase/update the PR branch onto its base. A 4xx "unprocessable"
    /// response means a true conflict and must surface as
    /// `ForgeError::Conflict`.
    async fn update_pr_branch(&self, id: i64) -> ForgeResult<()>;

    async fn close_pr(&self, id: i64) -> ForgeResult<()>;
    async fn approve_pr(&self, id: i64, body: &str) -> ForgeResult<()>;
    async fn comment_on_pr(&self, id: i64, body: &str) -> ForgeResult<()>;

    async fn get_branch_sha(&self, name: &str) -> ForgeResult<String>;
    async fn update_ref(&self, name: &str, sha: &str) -> ForgeResult<()>;

    async fn get_latest_release(&self) -> ForgeResult<Option<RemoteRelease>>;
    async fn list_tags(&self, limit: u32) -> ForgeResult<Vec<String>>;
    async fn create_ref(&self, refname: &str, sha: &str) -> ForgeResult<()>;
    async fn get_tag_for_sha(&self, sha: &str) -> ForgeResult<Option<String>>;

    async fn list_open_prs(&self) -> ForgeResult<Vec<RemotePr>>;
    async fn list_closed_prs(&self, since: DateTime<Utc>) -> ForgeResult<Vec<RemotePr>>;
    async fn get_pr_commits(&self, id: i64) -> ForgeResult<Vec<RemoteCommit>>;
}

/// Task/issue adapter: the other half of an external collaborator, covering
/// the upstream work item a PR is linked to. Separate from `Forge` because a
/// deployment may use GitHub for PRs and Linear or Jira for tasks.
#[async_trait]
pub trait TaskAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get_issue_body(&self, id: &str) -> ForgeResult<String>;
    async fn create_fix_issue(&self, parent_id: &str, body: &str) -> ForgeResult<String>;
    async fn add_labels(&self, id: &str, labels: &[String]) -> ForgeResult<()>;
    async fn remove_label(&self, id: &str, label: &str) -> ForgeResult<()>;
    async fn close_issue(&self, id: &str) -> ForgeResult<()>;

    /// Result tag recorded alongside a processed mark (see `ProcessedMark`).
    async fn mark_processed(&self, issue_id: &str, result: &str) -> ForgeResult<()>;
}

#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub task_id: String,
    pub stage: String,
    pub title: String,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approved,
    Rejected,
}

#[derive(Debug, Clone)]
pub struct ApprovalOutcome {
    pub decision: ApprovalDecision,
    pub approver: String,
}

/// Blocks until a human (or an auto-approval policy) reaches a decision.
#[async_trait]
pub trait ApprovalManager: Send + Sync {
    async fn request_approval(
        &self,
        request: ApprovalRequest,
        timeout_secs: u64,
    ) -> ForgeResult<ApprovalOutcome>;

    fn stage_enabled(&self, stage: &str) -> bool;
}

/// Side-effect sink consumed by the controller loop. All methods are
/// best-effort: a failing notification is logged and discarded by the
/// caller, never propagated as a PR failure.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn merged(&self, pr_id: i64) -> ForgeResult<()>;
    async fn ci_failed(&self, pr_id: i64, failed_checks: &[String]) -> ForgeResult<()>;
    async fn approval_required(&self, pr_id: i64) -> ForgeResult<()>;
    async fn fix_task_created(&self, pr_id: i64, task_id: &str) -> ForgeResult<()>;
    async fn released(&self, pr_id: i64, url: &str) -> ForgeResult<()>;
    async fn pipeline_complete(&self, pr_id: i64) -> ForgeResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_method_default_is_squash() {
        assert_eq!(MergeMethod::default(), MergeMethod::Squash);
    }

    #[test]
    fn merge_method_display() {
        assert_eq!(format!("{}", MergeMethod::Merge), "merge");
        assert_eq!(format!("{}", MergeMethod::Squash), "squash");
        assert_eq!(format!("{}", MergeMethod::Rebase), "rebase");
    }

    #[test]
    fn mergeable_state_dirty_is_authoritative() {
        assert!(MergeableState::Dirty.is_conflicting(None));
        assert!(MergeableState::Dirty.is_conflicting(Some(true)));
    }

    #[test]
    fn mergeable_false_alone_counts() {
        assert!(MergeableState::Unknown.is_conflicting(Some(false)));
    }

    #[test]
    fn mergeable_unknown_is_not_a_conflict() {
        assert!(!MergeableState::Unknown.is_conflicting(None));
        assert!(!MergeableState::Unknown.is_conflicting(Some(true)));
    }

    #[test]
    fn forge_error_is_transient() {
        assert!(ForgeError::RateLimited.is_transient());
        assert!(ForgeError::NetworkError("reset".into()).is_transient());
        assert!(!ForgeError::NotFound("pr".into()).is_transient());
        assert!(!ForgeError::Conflict("dirty".into()).is_transient());
    }
}
