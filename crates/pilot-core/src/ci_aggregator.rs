//! CI aggregator (§4.3): resolves a commit's check status, with auto-mode
//! discovery-with-grace-period and manual-mode fixed check lists.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use glob::Pattern;
use tokio::sync::Mutex;
use tokio::time::sleep;

use crate::config::{CiChecksConfig, CiChecksMode, Config};
use crate::error::{Error, Result};
use crate::forge::{CheckConclusion, CheckRun, CheckStatus, Forge};
use crate::state_machine::CiStatus;

#[derive(Debug, Clone)]
pub struct CiAggregateOutcome {
    pub status: CiStatus,
    pub checks: Vec<String>,
    pub failed_checks: Vec<String>,
}

struct FrozenSet {
    first_observed_at: DateTime<Utc>,
    frozen_checks: Option<Vec<String>>,
}

/// Discovery state kept per SHA for auto-mode (grace period + freeze).
#[derive(Default)]
struct DiscoveryState {
    by_sha: HashMap<String, FrozenSet>,
}

#[derive(Clone)]
pub struct CiAggregator {
    forge: Arc<dyn Forge>,
    discovery: Arc<Mutex<DiscoveryState>>,
}

fn map_check(check: &CheckRun) -> CiStatus {
    match check.status {
        CheckStatus::Queued | CheckStatus::InProgress => CiStatus::Running,
        CheckStatus::Completed => match &check.conclusion {
            Some(CheckConclusion::Success) | Some(CheckConclusion::Skipped) | Some(CheckConclusion::Neutral) => {
                CiStatus::Success
            }
            Some(CheckConclusion::Failure) | Some(CheckConclusion::Cancelled) | Some(CheckConclusion::TimedOut) => {
                CiStatus::Failure
            }
            None => CiStatus::Pending,
        },
    }
}

fn is_excluded(name: &str, excludes: &[String]) -> bool {
    excludes
        .iter()
        .any(|pattern| Pattern::new(pattern).map(|p| p.matches(name)).unwrap_or(false))
}

impl CiAggregator {
    pub fn new(forge: Arc<dyn Forge>) -> Self {
        Self {
            forge,
            discovery: Arc::new(Mutex::new(DiscoveryState::default())),
        }
    }

    pub async fn check(&self, sha: &str, config: &Config) -> Result<CiAggregateOutcome> {
        let checks = self.forge.list_checks(sha).await?;

        match config.ci_checks.mode {
            CiChecksMode::Manual => Ok(self.aggregate_manual(&checks, &config.ci_checks)),
            CiChecksMode::Auto => self.aggregate_auto(sha, &checks, &config.ci_checks).await,
        }
    }

    fn aggregate_manual(&self, checks: &[CheckRun], cfg: &CiChecksConfig) -> CiAggregateOutcome {
        let by_name: HashMap<&str, &CheckRun> = checks.iter().map(|c| (c.name.as_str(), c)).collect();
        let mut failed = Vec::new();
        let mut any_pending = false;

        for required in &cfg.required {
            match by_name.get(required.as_str()) {
                Some(check) => match map_check(check) {
                    CiStatus::Failure => failed.push(required.clone()),
                    CiStatus::Success => {}
                    _ => any_pending = true,
                },
                None => any_pending = true,
            }
        }

        let status = if !failed.is_empty() {
            CiStatus::Failure
        } else if any_pending {
            CiStatus::Pending
        } else {
            CiStatus::Success
        };

        CiAggregateOutcome {
            status,
            checks: cfg.required.clone(),
            failed_checks: failed,
        }
    }

    async fn aggregate_auto(
        &self,
        sha: &str,
        checks: &[CheckRun],
        cfg: &CiChecksConfig,
    ) -> Result<CiAggregateOutcome> {
        let candidate_names: Vec<String> = checks
            .iter()
            .map(|c| c.name.clone())
            .filter(|name| !is_excluded(name, &cfg.exclude))
            .collect();

        let mut discovery = self.discovery.lock().await;
        let entry = discovery.by_sha.entry(sha.to_string()).or_insert_with(|| FrozenSet {
            first_observed_at: Utc::now(),
            frozen_checks: None,
        });

        let grace_elapsed =
            (Utc::now() - entry.first_observed_at).num_seconds() as u64 >= cfg.discovery_grace_period_secs;

        let tracked: Vec<String> = if let Some(frozen) = &entry.frozen_checks {
            frozen.clone()
        } else if grace_elapsed {
            entry.frozen_checks = Some(candidate_names.clone());
            candidate_names.clone()
        } else {
            candidate_names.clone()
        };
        drop(discovery);

        if tracked.is_empty() {
            return Ok(CiAggregateOutcome {
                status: CiStatus::Pending,
                checks: Vec::new(),
                failed_checks: Vec::new(),
            });
        }

        let by_name: HashMap<&str, &CheckRun> = checks.iter().map(|c| (c.name.as_str(), c)).collect();
        let mut failed = Vec::new();
        let mut any_pending = false;

        for name in &tracked {
            match by_name.get(name.as_str()) {
                Some(check) => match map_check(check) {
                    CiStatus::Failure => failed.push(name.clone()),
                    CiStatus::Success => {}
                    _ => any_pending = true,
                },
                None => any_pending = true,
            }
        }

        let status = if !failed.is_empty() {
            CiStatus::Failure
        } else if any_pending {
            CiStatus::Pending
        } else {
            CiStatus::Success
        };

        Ok(CiAggregateOutcome { status, checks: tracked, failed_checks: failed })
    }

    /// Blocking waiter (§4.3, §9): polls until `Success`/`Failure` or
    /// `timeout` elapses. Used only where a synchronous wait simplifies the
    /// caller (post-merge CI); the primary per-tick path is `check`.
    pub async fn wait_for_completion(&self, sha: &str, config: &Config, timeout: Duration) -> Result<CiAggregateOutcome> {
        let poll_interval = Duration::from_secs(config.ci_poll_interval_secs.max(1));
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let outcome = self.check(sha, config).await?;
            if matches!(outcome.status, CiStatus::Success | CiStatus::Failure) {
                return Ok(outcome);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::CiTimeout(timeout.as_secs()));
            }
            sleep(poll_interval.min(deadline - tokio::time::Instant::now())).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    use crate::forge::{ForgeResult, MergeMethod, RemoteCommit, RemotePr, RemoteRelease};

    struct FakeForge {
        checks: StdMutex<Vec<CheckRun>>,
    }

    #[async_trait]
    impl Forge for FakeForge {
        fn name(&self) -> &'static str {
            "fake"
        }
        async fn get_pr(&self, _id: i64) -> ForgeResult<RemotePr> {
            unimplemented!()
        }
        async fn list_checks(&self, _sha: &str) -> ForgeResult<Vec<CheckRun>> {
            Ok(self.checks.lock().unwrap().clone())
        }
        async fn get_check_logs(&self, _job_id: &str) -> ForgeResult<Vec<u8>> {
            Ok(vec![])
        }
        async fn merge_pr(&self, _id: i64, _method: MergeMethod, _title: &str) -> ForgeResult<String> {
            unimplemented!()
        }
        async fn update_pr_branch(&self, _id: i64) -> ForgeResult<()> {
            unimplemented!()
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
            Ok(vec![])
        }
        async fn list_closed_prs(&self, _since: DateTime<Utc>) -> ForgeResult<Vec<RemotePr>> {
            Ok(vec![])
        }
        async fn get_pr_commits(&self, _id: i64) -> ForgeResult<Vec<RemoteCommit>> {
            Ok(vec![])
        }
    }

    fn check(name: &str, status: CheckStatus, conclusion: Option<CheckConclusion>) -> CheckRun {
        CheckRun { name: name.to_string(), status, conclusion, external_job_id: None }
    }

    #[tokio::test]
    async fn manual_mode_requires_all_listed_checks_to_succeed() {
        let forge = Arc::new(FakeForge {
            checks: StdMutex::new(vec![
                check("build", CheckStatus::Completed, Some(CheckConclusion::Success)),
                check("test", CheckStatus::Completed, Some(CheckConclusion::Success)),
            ]),
        });
        let aggregator = CiAggregator::new(forge);
        let mut config = Config::default();
        config.ci_checks.mode = CiChecksMode::Manual;
        config.ci_checks.required = vec!["build".to_string(), "test".to_string()];

        let outcome = aggregator.check("abc", &config).await.unwrap();
        assert_eq!(outcome.status, CiStatus::Success);
    }

    #[tokio::test]
    async fn manual_mode_any_failure_fails_aggregate() {
        let forge = Arc::new(FakeForge {
            checks: StdMutex::new(vec![
                check("build", CheckStatus::Completed, Some(CheckConclusion::Success)),
                check("test", CheckStatus::Completed, Some(CheckConclusion::Failure)),
            ]),
        });
        let aggregator = CiAggregator::new(forge);
        let mut config = Config::default();
        config.ci_checks.mode = CiChecksMode::Manual;
        config.ci_checks.required = vec!["build".to_string(), "test".to_string()];

        let outcome = aggregator.check("abc", &config).await.unwrap();
        assert_eq!(outcome.status, CiStatus::Failure);
        assert_eq!(outcome.failed_checks, vec!["test".to_string()]);
    }

    #[tokio::test]
    async fn auto_mode_excludes_glob_matches() {
        let forge = Arc::new(FakeForge {
            checks: StdMutex::new(vec![
                check("build", CheckStatus::Completed, Some(CheckConclusion::Success)),
                check("codecov/project", CheckStatus::InProgress, None),
            ]),
        });
        let aggregator = CiAggregator::new(forge);
        let mut config = Config::default();
        config.ci_checks.mode = CiChecksMode::Auto;
        config.ci_checks.exclude = vec!["codecov/*".to_string()];
        config.ci_checks.discovery_grace_period_secs = 0;

        let outcome = aggregator.check("abc", &config).await.unwrap();
        assert_eq!(outcome.status, CiStatus::Success);
        assert!(!outcome.checks.iter().any(|c| c == "codecov/project"));
    }

    #[tokio::test]
    async fn auto_mode_freezes_the_set_after_grace_period() {
        let forge = Arc::new(FakeForge {
            checks: StdMutex::new(vec![check("build", CheckStatus::InProgress, None)]),
        });
        let aggregator = CiAggregator::new(forge.clone());
        let mut config = Config::default();
        config.ci_checks.mode = CiChecksMode::Auto;
        config.ci_checks.discovery_grace_period_secs = 0;

        let first = aggregator.check("abc", &config).await.unwrap();
        assert_eq!(first.checks, vec!["build".to_string()]);

        forge.checks.lock().unwrap().push(check("late-job", CheckStatus::Completed, Some(CheckConclusion::Success)));
        let second = aggregator.check("abc", &config).await.unwrap();
        assert_eq!(second.checks, vec!["build".to_string()]);
    }

    #[tokio::test]
    async fn empty_candidate_set_is_pending() {
        let forge = Arc::new(FakeForge { checks: StdMutex::new(vec![]) });
        let aggregator = CiAggregator::new(forge);
        let mut config = Config::default();
        config.ci_checks.mode = CiChecksMode::Auto;
        config.ci_checks.discovery_grace_period_secs = 120;

        let outcome = aggregator.check("abc", &config).await.unwrap();
        assert_eq!(outcome.status, CiStatus::Pending);
    }
}
