//! The PR record: the unit of tracking for the controller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::release_decider::BumpKind;
use crate::state_machine::{CiStatus, Stage};

/// Branch-naming convention the controller recognizes on startup recovery
/// (§4.9): `pilot/<taskPrefix>-<id>`.
pub fn matches_branch_convention(branch_name: &str) -> bool {
    let Some(rest) = branch_name.strip_prefix("pilot/") else {
        return false;
    };
    match rest.rsplit_once('-') {
        Some((prefix, id)) => !prefix.is_empty() && !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()),
        None => false,
    }
}

/// The unit of tracking for the controller (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrRecord {
    pub pr_id: i64,
    pub url: String,
    pub title: String,
    pub target_branch: String,
    /// Upstream task/issue id; 0 if none.
    pub linked_task_id: i64,
    pub branch_name: String,
    pub head_sha: String,
    pub stage: Stage,
    pub ci_status: CiStatus,
    pub last_polled_at: Option<DateTime<Utc>>,
    /// Zero exactly when `stage` has never been `WaitingCi`.
    pub ci_wait_start: Option<DateTime<Utc>>,
    pub merge_attempts: u32,
    /// Empty unless `stage` is terminal-failed.
    pub last_error: String,
    pub created_at: DateTime<Utc>,
    pub release_version: Option<String>,
    pub bump_kind: Option<BumpKind>,
    pub discovered_checks: Vec<String>,
    pub consecutive_api_failures: u32,
    pub environment_label: String,
}

impl PrRecord {
    pub fn new(
        pr_id: i64,
        url: impl Into<String>,
        title: impl Into<String>,
        target_branch: impl Into<String>,
        branch_name: impl Into<String>,
        environment_label: impl Into<String>,
    ) -> Self {
        Self {
            pr_id,
            url: url.into(),
            title: title.into(),
            target_branch: target_branch.into(),
            linked_task_id: 0,
            branch_name: branch_name.into(),
            head_sha: String::new(),
            stage: Stage::PrCreated,
            ci_status: CiStatus::Pending,
            last_polled_at: None,
            ci_wait_start: None,
            merge_attempts: 0,
            last_error: String::new(),
            created_at: Utc::now(),
            release_version: None,
            bump_kind: None,
            discovered_checks: Vec::new(),
            consecutive_api_failures: 0,
            environment_label: environment_label.into(),
        }
    }

    pub fn with_linked_task(mut self, task_id: i64) -> Self {
        self.linked_task_id = task_id;
        self
    }

    /// Transition to a new stage, bookkeeping `ci_wait_start` per the
    /// invariant that it is set exactly once, on first entry to `WaitingCi`.
    pub fn transition(&mut self, next: Stage) {
        if next == Stage::WaitingCi && self.ci_wait_start.is_none() {
            self.ci_wait_start = Some(Utc::now());
        }
        self.stage = next;
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.stage = Stage::Failed;
        self.last_error = error.into();
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    pub fn record_success(&mut self) {
        self.consecutive_api_failures = 0;
    }

    pub fn record_api_failure(&mut self) -> u32 {
        self.consecutive_api_failures += 1;
        self.consecutive_api_failures
    }
}
