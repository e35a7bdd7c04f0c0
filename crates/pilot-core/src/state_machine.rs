//! Per-PR stage transitions (§4.2).
//!
//! The state machine is deliberately not a single monolithic `transition`
//! function: each stage's contract is handled by a small method on
//! [`StateMachine`], which borrows the CI aggregator, merge gate, release
//! decider, and the external collaborator traits. The controller loop calls
//! [`StateMachine::handle`] once per tracked PR per tick.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::autopilot_meta::parse_autopilot_meta;
use crate::ci_aggregator::{CiAggregateOutcome, CiAggregator};
use crate::config::{Config, EnvironmentConfig};
use crate::error::{Error, Result};
use crate::forge::{ApprovalManager, Forge, MergeableState, Notifier, TaskAdapter};
use crate::merge_gate::MergeGate;
use crate::pr::PrRecord;
use crate::release_decider::ReleaseDecider;

const MAX_CONSECUTIVE_API_FAILURES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    PrCreated,
    WaitingCi,
    CiPassed,
    CiFailed,
    AwaitingApproval,
    Merging,
    Merged,
    PostMergeCi,
    Releasing,
    Failed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::PrCreated => "pr_created",
            Stage::WaitingCi => "waiting_ci",
            Stage::CiPassed => "ci_passed",
            Stage::CiFailed => "ci_failed",
            Stage::AwaitingApproval => "awaiting_approval",
            Stage::Merging => "merging",
            Stage::Merged => "merged",
            Stage::PostMergeCi => "post_merge_ci",
            Stage::Releasing => "releasing",
            Stage::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Failed)
    }
}

impl std::str::FromStr for Stage {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pr_created" => Ok(Stage::PrCreated),
            "waiting_ci" => Ok(Stage::WaitingCi),
            "ci_passed" => Ok(Stage::CiPassed),
            "ci_failed" => Ok(Stage::CiFailed),
            "awaiting_approval" => Ok(Stage::AwaitingApproval),
            "merging" => Ok(Stage::Merging),
            "merged" => Ok(Stage::Merged),
            "post_merge_ci" => Ok(Stage::PostMergeCi),
            "releasing" => Ok(Stage::Releasing),
            "failed" => Ok(Stage::Failed),
            other => Err(Error::Other(format!("invalid stage: {other}"))),
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CiStatus {
    Pending,
    Running,
    Success,
    Failure,
}

impl CiStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CiStatus::Pending => "pending",
            CiStatus::Running => "running",
            CiStatus::Success => "success",
            CiStatus::Failure => "failure",
        }
    }
}

impl std::str::FromStr for CiStatus {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CiStatus::Pending),
            "running" => Ok(CiStatus::Running),
            "success" => Ok(CiStatus::Success),
            "failure" => Ok(CiStatus::Failure),
            other => Err(Error::Other(format!("invalid CI status: {other}"))),
        }
    }
}

impl std::fmt::Display for CiStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What the driver should do with the PR after a tick handled it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Keep tracking the PR; it may or may not have changed stage.
    Keep,
    /// Drop the PR from the active set (terminal success or externally
    /// closed); the store row is deleted by the caller.
    Remove,
}

pub struct StateMachine {
    forge: Arc<dyn Forge>,
    task_adapter: Arc<dyn TaskAdapter>,
    approval_manager: Option<Arc<dyn ApprovalManager>>,
    notifier: Arc<dyn Notifier>,
    ci_aggregator: CiAggregator,
    merge_gate: MergeGate,
    release_decider: ReleaseDecider,
}

impl StateMachine {
    pub fn new(
        forge: Arc<dyn Forge>,
        task_adapter: Arc<dyn TaskAdapter>,
        approval_manager: Option<Arc<dyn ApprovalManager>>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let ci_aggregator = CiAggregator::new(forge.clone());
        let merge_gate = MergeGate::new(forge.clone(), approval_manager.clone(), ci_aggregator.clone());
        let release_decider = ReleaseDecider::new(forge.clone());
        Self {
            forge,
            task_adapter,
            approval_manager,
            notifier,
            ci_aggregator,
            merge_gate,
            release_decider,
        }
    }

    pub async fn handle(
        &self,
        pr: &mut PrRecord,
        config: &Config,
        env_label: &str,
        env: &EnvironmentConfig,
    ) -> Result<TickOutcome> {
        match pr.stage {
            Stage::PrCreated => self.handle_pr_created(pr).await,
            Stage::WaitingCi => self.handle_waiting_ci(pr, config, env_label, env).await,
            Stage::CiPassed => self.handle_ci_passed(pr, env).await,
            Stage::CiFailed => self.handle_ci_failed(pr, config).await,
            Stage::AwaitingApproval => self.handle_awaiting_approval(pr, config, env).await,
            Stage::Merging => self.handle_merging(pr, config, env).await,
            Stage::Merged => self.handle_merged(pr, env),
            Stage::PostMergeCi => self.handle_post_merge_ci(pr, config).await,
            Stage::Releasing => self.handle_releasing(pr, env).await,
            Stage::Failed => Ok(TickOutcome::Keep),
        }
    }

    async fn handle_pr_created(&self, pr: &mut PrRecord) -> Result<TickOutcome> {
        let remote = self.forge.get_pr(pr.pr_id).await?;
        if remote.mergeable_state.is_conflicting(remote.mergeable) {
            return self.remediate_conflict(pr).await;
        }
        pr.head_sha = remote.head_sha;
        pr.transition(Stage::WaitingCi);
        Ok(TickOutcome::Keep)
    }

    async fn handle_waiting_ci(
        &self,
        pr: &mut PrRecord,
        config: &Config,
        env_label: &str,
        env: &EnvironmentConfig,
    ) -> Result<TickOutcome> {
        if pr.ci_wait_start.is_none() {
            pr.ci_wait_start = Some(Utc::now());
        }
        let timeout_secs = config.ci_timeout_secs(env_label, env);
        let waited = Utc::now() - pr.ci_wait_start.unwrap();
        if waited.num_seconds() as u64 > timeout_secs {
            pr.fail(format!("CI wait timed out after {timeout_secs}s"));
            return Ok(TickOutcome::Keep);
        }

        let remote = match self.forge.get_pr(pr.pr_id).await {
            Ok(remote) => {
                pr.record_success();
                remote
            }
            Err(e) => {
                return self.account_api_failure(pr, e.into()).await;
            }
        };
        if remote.head_sha.is_empty() {
            return Ok(TickOutcome::Keep);
        }
        if remote.head_sha != pr.head_sha {
            pr.head_sha = remote.head_sha.clone();
        }
        if remote.mergeable_state.is_conflicting(remote.mergeable) {
            return self.remediate_conflict(pr).await;
        }

        match self.ci_aggregator.check(&pr.head_sha, config).await {
            Ok(outcome) => {
                pr.record_success();
                pr.discovered_checks = outcome.checks.clone();
                match outcome.status {
                    CiStatus::Success => {
                        info!(pr_id = pr.pr_id, "CI passed, advancing to ci_passed");
                        pr.ci_status = CiStatus::Success;
                        pr.transition(Stage::CiPassed);
                    }
                    CiStatus::Failure => {
                        pr.ci_status = CiStatus::Failure;
                        let failed: Vec<String> = outcome.failed_checks.clone();
                        pr.transition(Stage::CiFailed);
                        let _ = self.notifier.ci_failed(pr.pr_id, &failed).await;
                    }
                    CiStatus::Running | CiStatus::Pending => {
                        pr.ci_status = outcome.status;
                    }
                }
                Ok(TickOutcome::Keep)
            }
            Err(e) => self.account_api_failure(pr, e).await,
        }
    }

    async fn account_api_failure(&self, pr: &mut PrRecord, err: Error) -> Result<TickOutcome> {
        let count = pr.record_api_failure();
        if count >= MAX_CONSECUTIVE_API_FAILURES {
            pr.fail(format!("forge unreachable after {count} consecutive failures: {err}"));
        } else {
            warn!(pr_id = pr.pr_id, count, %err, "transient forge error while waiting on CI");
        }
        Ok(TickOutcome::Keep)
    }

    async fn handle_ci_passed(&self, pr: &mut PrRecord, env: &EnvironmentConfig) -> Result<TickOutcome> {
        if env.requires_approval {
            pr.transition(Stage::AwaitingApproval);
            let _ = self.notifier.approval_required(pr.pr_id).await;
        } else {
            pr.transition(Stage::Merging);
        }
        Ok(TickOutcome::Keep)
    }

    async fn handle_ci_failed(&self, pr: &mut PrRecord, config: &Config) -> Result<TickOutcome> {
        let body = self
            .task_adapter
            .get_issue_body(&pr.linked_task_id.to_string())
            .await
            .unwrap_or_default();
        let meta = parse_autopilot_meta(&body);
        let iteration = meta.map(|m| m.iteration).unwrap_or(0);

        if iteration >= config.max_ci_fix_iterations {
            let _ = self.forge.close_pr(pr.pr_id).await;
            pr.fail(format!("iteration limit reached ({iteration})"));
            return Ok(TickOutcome::Keep);
        }

        let next_iteration = iteration + 1;
        let fix_body = format!(
            "<!-- autopilot-meta branch:{} pr:{} iteration:{} -->",
            pr.branch_name, pr.pr_id, next_iteration
        );
        let task_id = self
            .task_adapter
            .create_fix_issue(&pr.linked_task_id.to_string(), &fix_body)
            .await?;
        let _ = self.forge.close_pr(pr.pr_id).await;
        let _ = self.notifier.fix_task_created(pr.pr_id, &task_id).await;
        pr.fail("CI failed, fix task created");
        Ok(TickOutcome::Keep)
    }

    async fn handle_awaiting_approval(&self, pr: &mut PrRecord, config: &Config, env: &EnvironmentConfig) -> Result<TickOutcome> {
        match self.merge_gate.merge(pr, config, env, self.approval_manager.as_deref()).await {
            Ok(()) => {
                pr.transition(Stage::Merged);
                let _ = self.notifier.merged(pr.pr_id).await;
                Ok(TickOutcome::Keep)
            }
            Err(Error::ApprovalDenied(by)) => {
                pr.fail(format!("approval denied by {by}"));
                Ok(TickOutcome::Keep)
            }
            Err(Error::MergeConflict) => self.remediate_conflict(pr).await,
            Err(e) => Err(e),
        }
    }

    async fn handle_merging(&self, pr: &mut PrRecord, config: &Config, env: &EnvironmentConfig) -> Result<TickOutcome> {
        pr.merge_attempts += 1;
        match self.merge_gate.merge(pr, config, env, self.approval_manager.as_deref()).await {
            Ok(()) => {
                pr.transition(Stage::Merged);
                let _ = self.notifier.merged(pr.pr_id).await;
                Ok(TickOutcome::Keep)
            }
            Err(Error::MergeConflict) => self.remediate_conflict(pr).await,
            Err(e) => Err(e),
        }
    }

    fn handle_merged(&self, pr: &mut PrRecord, env: &EnvironmentConfig) -> Result<TickOutcome> {
        let is_dev = pr.environment_label.eq_ignore_ascii_case("dev")
            || pr.environment_label.eq_ignore_ascii_case("development");
        if is_dev {
            if !env.release.require_ci {
                pr.transition(Stage::Releasing);
                Ok(TickOutcome::Keep)
            } else {
                Ok(TickOutcome::Remove)
            }
        } else {
            pr.transition(Stage::PostMergeCi);
            Ok(TickOutcome::Keep)
        }
    }

    async fn handle_post_merge_ci(&self, pr: &mut PrRecord, config: &Config) -> Result<TickOutcome> {
        let outcome = self
            .ci_aggregator
            .wait_for_completion(&pr.head_sha, config, std::time::Duration::from_secs(config.dev_ci_timeout_secs))
            .await;
        match outcome {
            Ok(CiAggregateOutcome { status: CiStatus::Success, .. }) => {
                pr.transition(Stage::Releasing);
                let _ = self.notifier.pipeline_complete(pr.pr_id).await;
                Ok(TickOutcome::Keep)
            }
            Ok(CiAggregateOutcome { status: CiStatus::Failure, failed_checks, .. }) => {
                let _ = self.notifier.ci_failed(pr.pr_id, &failed_checks).await;
                let fix_body = "<!-- autopilot-meta post-merge-ci-failure -->".to_string();
                let _ = self
                    .task_adapter
                    .create_fix_issue(&pr.linked_task_id.to_string(), &fix_body)
                    .await;
                Ok(TickOutcome::Remove)
            }
            _ => Ok(TickOutcome::Remove),
        }
    }

    async fn handle_releasing(&self, pr: &mut PrRecord, env: &EnvironmentConfig) -> Result<TickOutcome> {
        let sha = pr.head_sha.clone();
        if self.forge.get_tag_for_sha(&sha).await?.is_some() {
            return Ok(TickOutcome::Remove);
        }
        match self.release_decider.release_for_pr(pr, &env.release).await? {
            Some(release) => {
                pr.release_version = Some(release.version.to_string());
                pr.bump_kind = Some(release.bump);
                let _ = self.notifier.released(pr.pr_id, &release.tag_name).await;
            }
            None => {}
        }
        Ok(TickOutcome::Remove)
    }

    /// Shared conflict-remediation path used from `PrCreated`, `WaitingCi`
    /// (the second conflict probe), `AwaitingApproval`, and `Merging`.
    async fn remediate_conflict(&self, pr: &mut PrRecord) -> Result<TickOutcome> {
        match self.forge.update_pr_branch(pr.pr_id).await {
            Ok(()) => {
                pr.head_sha.clear();
                pr.transition(Stage::WaitingCi);
                pr.ci_wait_start = None;
                pr.ci_wait_start = Some(Utc::now());
                Ok(TickOutcome::Keep)
            }
            Err(_) => {
                let _ = self
                    .forge
                    .comment_on_pr(pr.pr_id, "Unable to automatically resolve merge conflicts with the base branch.")
                    .await;
                let _ = self.forge.close_pr(pr.pr_id).await;
                let _ = self
                    .task_adapter
                    .remove_label(&pr.linked_task_id.to_string(), "in-progress")
                    .await;
                pr.fail("merge conflict with base branch");
                Ok(TickOutcome::Keep)
            }
        }
    }
}
