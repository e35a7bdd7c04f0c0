//! Controller loop (§4.1) and startup recovery (§4.9).
//!
//! A single cooperative driver task ticks every tracked PR once per
//! `ciPollInterval`. All active-map and failure-map mutation happens on that
//! task under one lock; forge calls happen off-lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::circuit_breaker::CircuitBreaker;
use crate::config::Config;
use crate::deployer::Deployer;
use crate::error::Result;
use crate::forge::{ApprovalManager, Forge, Notifier, PrState, TaskAdapter};
use crate::pr::{matches_branch_convention, PrRecord};
use crate::state_machine::{Stage, StateMachine, TickOutcome};
use crate::store::Store;

/// Shared driver state: the collaborators, the shared store, and the
/// cancellation signal. Cloning is cheap — everything inside is `Arc`-backed.
#[derive(Clone)]
pub struct Controller {
    forge: Arc<dyn Forge>,
    state_machine: Arc<StateMachine>,
    deployer: Arc<Deployer>,
    notifier: Arc<dyn Notifier>,
    store: Arc<Store>,
    breaker: Arc<CircuitBreaker>,
    config: Arc<Config>,
    active: Arc<Mutex<HashMap<i64, PrRecord>>>,
    cancel: watch::Receiver<bool>,
}

impl Controller {
    pub fn new(
        forge: Arc<dyn Forge>,
        task_adapter: Arc<dyn TaskAdapter>,
        approval_manager: Option<Arc<dyn ApprovalManager>>,
        notifier: Arc<dyn Notifier>,
        store: Arc<Store>,
        config: Config,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(
            config.max_failures,
            Duration::from_secs(config.failure_reset_timeout_secs),
        ));
        let state_machine = Arc::new(StateMachine::new(forge.clone(), task_adapter, approval_manager, notifier.clone()));
        Self {
            forge,
            state_machine,
            deployer: Arc::new(Deployer::new()),
            notifier,
            store,
            breaker,
            config: Arc::new(config),
            active: Arc::new(Mutex::new(HashMap::new())),
            cancel,
        }
    }

    fn cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Runs the startup recovery sequence (§4.9), then ticks until cancelled.
    pub async fn run(&self) -> Result<()> {
        self.recover().await?;

        let interval = Duration::from_secs(self.config.ci_poll_interval_secs.max(1));
        while !self.cancelled() {
            if let Err(e) = self.tick().await {
                error!(error = %e, "controller tick failed");
            }
            sleep(interval).await;
        }
        info!("controller loop cancelled, exiting");
        Ok(())
    }

    /// Loads persisted state, then discovers PRs the store doesn't know about
    /// yet: open PRs on the forge matching the branch convention, and
    /// recently merged PRs missing a release tag.
    async fn recover(&self) -> Result<()> {
        let restored = self.store.load_active_prs().await?;
        {
            let mut active = self.active.lock().await;
            for pr in restored {
                active.insert(pr.pr_id, pr);
            }
        }
        for (pr_id, count, last_at) in self.store.load_pr_failures().await? {
            self.breaker.seed(pr_id, count, Some(last_at));
        }

        let open_prs = self.forge.list_open_prs().await?;
        let mut active = self.active.lock().await;
        for remote in open_prs {
            if active.contains_key(&remote.id) {
                continue;
            }
            if !matches_branch_convention(&remote.head_ref) {
                continue;
            }
            let mut pr = PrRecord::new(remote.id, String::new(), String::new(), String::new(), remote.head_ref.clone(), "dev");
            pr.head_sha = remote.head_sha;
            info!(pr_id = remote.id, "recovered untracked open PR matching branch convention");
            active.insert(pr.pr_id, pr);
        }
        drop(active);

        let window = chrono::Duration::seconds(self.config.merged_pr_scan_window_secs as i64);
        let since = Utc::now() - window;
        let closed_prs = self.forge.list_closed_prs(since).await?;
        for remote in closed_prs {
            if !remote.merged {
                continue;
            }
            let Some(merge_sha) = &remote.merge_commit_sha else { continue };
            if self.forge.get_tag_for_sha(merge_sha).await?.is_some() {
                continue;
            }
            let mut active = self.active.lock().await;
            if active.contains_key(&remote.id) {
                continue;
            }
            let mut pr = PrRecord::new(remote.id, String::new(), String::new(), String::new(), remote.head_ref.clone(), "dev");
            pr.head_sha = merge_sha.clone();
            pr.transition(Stage::Releasing);
            info!(pr_id = remote.id, "recovered merged PR missing a release tag");
            active.insert(pr.pr_id, pr);
        }

        Ok(())
    }

    /// One pass over the active set (§4.1).
    pub async fn tick(&self) -> Result<()> {
        let snapshot: Vec<PrRecord> = {
            let active = self.active.lock().await;
            active.values().cloned().collect()
        };

        for mut pr in snapshot {
            if self.cancelled() {
                break;
            }
            if self.breaker.is_open(pr.pr_id) {
                warn!(pr_id = pr.pr_id, "circuit breaker open, skipping this tick");
                continue;
            }

            match self.forge.get_pr(pr.pr_id).await {
                Ok(remote) if remote.merged => {
                    let _ = self.notifier.merged(pr.pr_id).await;
                    let release_enabled = self
                        .config
                        .resolve_environment(&pr.environment_label)
                        .map(|env| env.release.enabled)
                        .unwrap_or(false);
                    if release_enabled && remote.merge_commit_sha.is_some() {
                        pr.head_sha = remote.merge_commit_sha.unwrap();
                        pr.transition(Stage::Releasing);
                        self.persist(pr).await;
                    } else {
                        self.remove(pr.pr_id).await;
                    }
                    continue;
                }
                Ok(remote) if remote.state == PrState::Closed => {
                    self.remove(pr.pr_id).await;
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(pr_id = pr.pr_id, error = %e, "forge fetch failed this tick, retrying next tick");
                    continue;
                }
            }

            let env_label = pr.environment_label.clone();
            let env = match self.config.resolve_environment(&env_label) {
                Ok(env) => env,
                Err(e) => {
                    pr.fail(format!("unknown environment: {e}"));
                    self.breaker.record_failure(pr.pr_id);
                    self.persist(pr).await;
                    continue;
                }
            };

            match self.state_machine.handle(&mut pr, &self.config, &env_label, &env).await {
                Ok(TickOutcome::Keep) => {
                    self.breaker.record_success(pr.pr_id);
                    if pr.stage == Stage::Merged {
                        self.run_deployer(&pr, &env).await;
                    }
                    self.persist(pr).await;
                }
                Ok(TickOutcome::Remove) => {
                    self.breaker.record_success(pr.pr_id);
                    self.remove(pr.pr_id).await;
                }
                Err(e) => {
                    self.breaker.record_failure(pr.pr_id);
                    let count = self.breaker.failure_count(pr.pr_id);
                    let _ = self.store.record_pr_failure(pr.pr_id, count, Utc::now()).await;
                    warn!(pr_id = pr.pr_id, error = %e, "tick handler error");
                    if e.is_terminal() {
                        pr.fail(e.to_string());
                    }
                    self.persist(pr).await;
                }
            }
        }
        Ok(())
    }

    async fn run_deployer(&self, pr: &PrRecord, env: &crate::config::EnvironmentConfig) {
        if let Err(e) = self
            .deployer
            .deploy(self.forge.as_ref(), &env.post_merge, pr.pr_id, &pr.branch_name, &pr.head_sha, &pr.environment_label)
            .await
        {
            warn!(pr_id = pr.pr_id, error = %e, "post-merge deploy action failed");
        }
    }

    async fn persist(&self, pr: PrRecord) {
        if let Err(e) = self.store.upsert_pr(&pr).await {
            error!(pr_id = pr.pr_id, error = %e, "failed to persist PR state, continuing in memory");
        }
        let mut active = self.active.lock().await;
        active.insert(pr.pr_id, pr);
    }

    async fn remove(&self, pr_id: i64) {
        if let Err(e) = self.store.delete_pr(pr_id).await {
            error!(pr_id, error = %e, "failed to delete PR row, continuing in memory");
        }
        let _ = self.store.clear_pr_failure(pr_id).await;
        self.breaker.record_success(pr_id);
        let mut active = self.active.lock().await;
        active.remove(&pr_id);
    }

    /// Registers a newly-created PR under tracking (called by whatever drives
    /// PR creation — outside this crate's scope, but the hook the caller uses
    /// to hand a PR to the controller).
    pub async fn track(&self, pr: PrRecord) {
        self.persist(pr).await;
    }

    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::DateTime;
    use std::sync::Mutex as StdMutex;

    use crate::forge::{
        CheckRun, ForgeResult, MergeMethod, MergeableState, RemoteCommit, RemotePr, RemoteRelease,
    };

    struct FakeForge {
        prs: StdMutex<HashMap<i64, RemotePr>>,
    }

    #[async_trait]
    impl Forge for FakeForge {
        fn name(&self) -> &'static str {
            "fake"
        }
        async fn get_pr(&self, id: i64) -> ForgeResult<RemotePr> {
            self.prs.lock().unwrap().get(&id).cloned().ok_or_else(|| crate::forge::ForgeError::NotFound(id.to_string()))
        }
        async fn list_checks(&self, _sha: &str) -> ForgeResult<Vec<CheckRun>> {
            Ok(vec![])
        }
        async fn get_check_logs(&self, _job_id: &str) -> ForgeResult<Vec<u8>> {
            Ok(vec![])
        }
        async fn merge_pr(&self, _id: i64, _method: MergeMethod, _title: &str) -> ForgeResult<String> {
            unimplemented!()
        }
        async fn update_pr_branch(&self, _id: i64) -> ForgeResult<()> {
            Ok(())
        }
        async fn close_pr(&self, _id: i64) -> ForgeResult<()> {
            Ok(())
        }
        async fn approve_pr(&self, _id: i64, _body: &str) -> ForgeResult<()> {
            Ok(())
        }
        async fn comment_on_pr(&self, _id: i64, _body: &str) -> ForgeResult<()> {
            Ok(())
        }
        async fn get_branch_sha(&self, _name: &str) -> ForgeResult<String> {
            unimplemented!()
        }
        async fn update_ref(&self, _name: &str, _sha: &str) -> ForgeResult<()> {
            Ok(())
        }
        async fn get_latest_release(&self) -> ForgeResult<Option<RemoteRelease>> {
            Ok(None)
        }
        async fn list_tags(&self, _limit: u32) -> ForgeResult<Vec<String>> {
            Ok(vec![])
        }
        async fn create_ref(&self, _refname: &str, _sha: &str) -> ForgeResult<()> {
            Ok(())
        }
        async fn get_tag_for_sha(&self, _sha: &str) -> ForgeResult<Option<String>> {
            Ok(None)
        }
        async fn list_open_prs(&self) -> ForgeResult<Vec<RemotePr>> {
            Ok(self.prs.lock().unwrap().values().cloned().collect())
        }
        async fn list_closed_prs(&self, _since: DateTime<Utc>) -> ForgeResult<Vec<RemotePr>> {
            Ok(vec![])
        }
        async fn get_pr_commits(&self, _id: i64) -> ForgeResult<Vec<RemoteCommit>> {
            Ok(vec![])
        }
    }

    struct FakeTaskAdapter;
    #[async_trait]
    impl TaskAdapter for FakeTaskAdapter {
        fn name(&self) -> &'static str {
            "fake"
        }
        async fn get_issue_body(&self, _id: &str) -> ForgeResult<String> {
            Ok(String::new())
        }
        async fn create_fix_issue(&self, _parent_id: &str, _body: &str) -> ForgeResult<String> {
            Ok("fix-1".to_string())
        }
        async fn add_labels(&self, _id: &str, _labels: &[String]) -> ForgeResult<()> {
            Ok(())
        }
        async fn remove_label(&self, _id: &str, _label: &str) -> ForgeResult<()> {
            Ok(())
        }
        async fn close_issue(&self, _id: &str) -> ForgeResult<()> {
            Ok(())
        }
        async fn mark_processed(&self, _issue_id: &str, _result: &str) -> ForgeResult<()> {
            Ok(())
        }
    }

    struct NullNotifier;
    #[async_trait]
    impl Notifier for NullNotifier {
        async fn merged(&self, _pr_id: i64) -> ForgeResult<()> {
            Ok(())
        }
        async fn ci_failed(&self, _pr_id: i64, _failed_checks: &[String]) -> ForgeResult<()> {
            Ok(())
        }
        async fn approval_required(&self, _pr_id: i64) -> ForgeResult<()> {
            Ok(())
        }
        async fn fix_task_created(&self, _pr_id: i64, _task_id: &str) -> ForgeResult<()> {
            Ok(())
        }
        async fn released(&self, _pr_id: i64, _url: &str) -> ForgeResult<()> {
            Ok(())
        }
        async fn pipeline_complete(&self, _pr_id: i64) -> ForgeResult<()> {
            Ok(())
        }
    }

    fn remote_pr(id: i64, state: PrState, merged: bool, head_ref: &str) -> RemotePr {
        RemotePr {
            id,
            state,
            merged,
            mergeable: Some(true),
            mergeable_state: MergeableState::Clean,
            head_sha: "sha1".to_string(),
            head_ref: head_ref.to_string(),
            merge_commit_sha: None,
        }
    }

    async fn test_controller(forge: Arc<FakeForge>) -> Controller {
        let store = Arc::new(Store::in_memory().await.unwrap());
        let (_tx, rx) = watch::channel(false);
        let mut config = Config::default();
        config.environments.insert("dev".to_string(), Default::default());
        Controller::new(forge, Arc::new(FakeTaskAdapter), None, Arc::new(NullNotifier), store, config, rx)
    }

    #[tokio::test]
    async fn closed_pr_is_dropped_from_tracking() {
        let forge = Arc::new(FakeForge { prs: StdMutex::new(HashMap::from([(1, remote_pr(1, PrState::Closed, false, "pilot/x-1"))])) });
        let controller = test_controller(forge).await;

        let mut pr = PrRecord::new(1, "u", "t", "main", "pilot/x-1", "dev");
        pr.transition(Stage::WaitingCi);
        controller.track(pr).await;

        controller.tick().await.unwrap();
        assert_eq!(controller.active_count().await, 0);
    }

    #[tokio::test]
    async fn open_pr_is_handed_to_the_state_machine() {
        let forge = Arc::new(FakeForge { prs: StdMutex::new(HashMap::from([(1, remote_pr(1, PrState::Open, false, "pilot/x-1"))])) });
        let controller = test_controller(forge).await;

        let pr = PrRecord::new(1, "u", "t", "main", "pilot/x-1", "dev");
        controller.track(pr).await;

        controller.tick().await.unwrap();
        assert_eq!(controller.active_count().await, 1);
    }

    #[tokio::test]
    async fn circuit_breaker_skips_tripped_prs() {
        let forge = Arc::new(FakeForge { prs: StdMutex::new(HashMap::new()) });
        let controller = test_controller(forge).await;

        let pr = PrRecord::new(7, "u", "t", "main", "pilot/x-7", "dev");
        controller.track(pr).await;
        for _ in 0..controller.config.max_failures {
            controller.breaker.record_failure(7);
        }

        controller.tick().await.unwrap();
        assert_eq!(controller.active_count().await, 1);
    }
}
