//! Configuration types.
//!
//! The core only defines these structs and validates them; reading YAML or
//! TOML off disk and applying environment-variable overrides is the caller's
//! job (see the `pilot-cli` crate).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::forge::MergeMethod;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CiChecksMode {
    Auto,
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CiChecksConfig {
    pub mode: CiChecksMode,
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default = "default_discovery_grace_period_secs")]
    pub discovery_grace_period_secs: u64,
}

fn default_discovery_grace_period_secs() -> u64 {
    60
}

impl Default for CiChecksConfig {
    fn default() -> Self {
        Self {
            mode: CiChecksMode::Auto,
            required: Vec::new(),
            exclude: Vec::new(),
            discovery_grace_period_secs: default_discovery_grace_period_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseTrigger {
    OnMerge,
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_release_trigger")]
    pub trigger: ReleaseTrigger,
    #[serde(default = "default_tag_prefix")]
    pub tag_prefix: String,
    #[serde(default = "default_true")]
    pub require_ci: bool,
}

fn default_release_trigger() -> ReleaseTrigger {
    ReleaseTrigger::OnMerge
}

fn default_tag_prefix() -> String {
    "v".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            trigger: default_release_trigger(),
            tag_prefix: default_tag_prefix(),
            require_ci: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum PostMergeAction {
    None,
    Tag,
    Webhook,
    BranchPush,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostMergeConfig {
    #[serde(default = "default_post_merge_action")]
    pub action: PostMergeAction,
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub webhook_headers: HashMap<String, String>,
    pub webhook_secret: Option<String>,
    pub deploy_branch: Option<String>,
}

fn default_post_merge_action() -> PostMergeAction {
    PostMergeAction::None
}

impl Default for PostMergeConfig {
    fn default() -> Self {
        Self {
            action: default_post_merge_action(),
            webhook_url: None,
            webhook_headers: HashMap::new(),
            webhook_secret: None,
            deploy_branch: None,
        }
    }
}

/// Per-environment policy overrides (dev / stage / prod, or a user-defined
/// name under `environments`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentConfig {
    #[serde(default = "default_ci_wait_timeout_secs")]
    pub ci_wait_timeout_secs: u64,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default)]
    pub release: ReleaseConfig,
    #[serde(default)]
    pub post_merge: PostMergeConfig,
}

fn default_ci_wait_timeout_secs() -> u64 {
    3600
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            ci_wait_timeout_secs: default_ci_wait_timeout_secs(),
            requires_approval: false,
            release: ReleaseConfig::default(),
            post_merge: PostMergeConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Legacy single-environment label, kept for backward compatibility with
    /// deployments that have not migrated to `environments`.
    pub environment: Option<String>,

    /// Named per-environment overrides. Takes precedence over `environment`
    /// when the active label is present here.
    #[serde(default)]
    pub environments: HashMap<String, EnvironmentConfig>,

    #[serde(default)]
    pub merge_method: MergeMethod,

    #[serde(default = "default_dev_ci_timeout_secs")]
    pub dev_ci_timeout_secs: u64,

    #[serde(default = "default_ci_poll_interval_secs")]
    pub ci_poll_interval_secs: u64,

    #[serde(default)]
    pub ci_checks: CiChecksConfig,

    #[serde(default = "default_max_failures")]
    pub max_failures: u32,

    #[serde(default = "default_max_ci_fix_iterations")]
    pub max_ci_fix_iterations: u32,

    #[serde(default = "default_failure_reset_timeout_secs")]
    pub failure_reset_timeout_secs: u64,

    #[serde(default = "default_merged_pr_scan_window_secs")]
    pub merged_pr_scan_window_secs: u64,
}

fn default_dev_ci_timeout_secs() -> u64 {
    600
}

fn default_ci_poll_interval_secs() -> u64 {
    30
}

fn default_max_failures() -> u32 {
    5
}

fn default_max_ci_fix_iterations() -> u32 {
    3
}

fn default_failure_reset_timeout_secs() -> u64 {
    3600
}

fn default_merged_pr_scan_window_secs() -> u64 {
    86_400
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            environment: None,
            environments: HashMap::new(),
            merge_method: MergeMethod::default(),
            dev_ci_timeout_secs: default_dev_ci_timeout_secs(),
            ci_poll_interval_secs: default_ci_poll_interval_secs(),
            ci_checks: CiChecksConfig::default(),
            max_failures: default_max_failures(),
            max_ci_fix_iterations: default_max_ci_fix_iterations(),
            failure_reset_timeout_secs: default_failure_reset_timeout_secs(),
            merged_pr_scan_window_secs: default_merged_pr_scan_window_secs(),
        }
    }
}

impl Config {
    pub fn from_str(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_failures == 0 {
            return Err(Error::Config("maxFailures must be at least 1".to_string()));
        }
        if self.ci_poll_interval_secs == 0 {
            return Err(Error::Config("ciPollInterval must be positive".to_string()));
        }
        Ok(())
    }

    /// Resolves the active environment's policy per the named-map-overrides-
    /// legacy precedence rule: `environments` is checked first; if the active
    /// label is not a key there but matches the legacy `environment` label,
    /// the legacy default config is used. An active label matching neither
    /// is rejected explicitly rather than silently defaulted.
    pub fn resolve_environment(&self, active: &str) -> Result<EnvironmentConfig> {
        if let Some(cfg) = self.environments.get(active) {
            return Ok(cfg.clone());
        }
        if self.environment.as_deref() == Some(active) {
            return Ok(EnvironmentConfig::default());
        }
        Err(Error::UnknownEnvironment(active.to_string()))
    }

    pub fn ci_timeout_secs(&self, env_label: &str, env: &EnvironmentConfig) -> u64 {
        if env_label.eq_ignore_ascii_case("dev") || env_label.eq_ignore_ascii_case("development") {
            self.dev_ci_timeout_secs
        } else {
            env.ci_wait_timeout_secs
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.merge_method, MergeMethod::Squash);
    }

    #[test]
    fn resolve_environment_prefers_named_map() {
        let mut config = Config::default();
        config.environment = Some("stage".to_string());
        let mut stage_cfg = EnvironmentConfig::default();
        stage_cfg.requires_approval = true;
        config.environments.insert("stage".to_string(), stage_cfg);

        let resolved = config.resolve_environment("stage").unwrap();
        assert!(resolved.requires_approval);
    }

    #[test]
    fn resolve_environment_falls_back_to_legacy() {
        let mut config = Config::default();
        config.environment = Some("prod".to_string());

        let resolved = config.resolve_environment("prod").unwrap();
        assert!(!resolved.requires_approval);
    }

    #[test]
    fn resolve_environment_rejects_unknown_label() {
        let config = Config::default();
        let result = config.resolve_environment("staging-2");
        assert!(matches!(result, Err(Error::UnknownEnvironment(_))));
    }

    #[test]
    fn from_str_rejects_zero_max_failures() {
        let yaml = "maxFailures: 0\n";
        let result = Config::from_str(yaml);
        assert!(result.is_err());
    }
}
