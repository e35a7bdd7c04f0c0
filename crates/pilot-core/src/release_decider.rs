//! Release decider (§4.6): conventional-commit bump classification, version
//! computation, and idempotent tag creation.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::ReleaseConfig;
use crate::error::{Error, Result};
use crate::forge::Forge;
use crate::pr::PrRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BumpKind {
    None,
    Patch,
    Minor,
    Major,
}

impl BumpKind {
    /// Classifies the first line of a conventional-commit message (§4.6).
    pub fn from_commit_message(message: &str) -> Self {
        let first_line = message.lines().next().unwrap_or("").to_lowercase();

        if first_line.contains("breaking change") || first_line.contains("!:") {
            return BumpKind::Major;
        }

        let after_colon = first_line.split_once(':').map(|(t, _)| t);
        let Some(type_part) = after_colon else {
            return BumpKind::None;
        };
        let type_part = type_part.trim();
        let type_part = type_part.split('(').next().unwrap_or(type_part).trim();

        match type_part {
            "feat" | "feature" => BumpKind::Minor,
            "fix" | "bugfix" | "perf" => BumpKind::Patch,
            "docs" | "style" | "refactor" | "test" | "chore" | "ci" | "build" => BumpKind::None,
            _ => BumpKind::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub const ZERO: Version = Version { major: 0, minor: 0, patch: 0 };

    /// Parses `major.minor.patch`, stripping any pre-release (`-...`) or
    /// build metadata (`+...`) suffix, and an optional leading tag prefix
    /// (handled by the caller via `strip_prefix`).
    pub fn parse(s: &str) -> Result<Self> {
        let without_build = s.split('+').next().unwrap_or(s);
        let core = without_build.split('-').next().unwrap_or(without_build);
        let parts: Vec<&str> = core.split('.').collect();
        if parts.len() != 3 {
            return Err(Error::Other(format!("invalid version: {s}")));
        }
        let major = parts[0].parse().map_err(|_| Error::Other(format!("invalid major version: {s}")))?;
        let minor = parts[1].parse().map_err(|_| Error::Other(format!("invalid minor version: {s}")))?;
        let patch = parts[2].parse().map_err(|_| Error::Other(format!("invalid patch version: {s}")))?;
        Ok(Self { major, minor, patch })
    }

    pub fn bump(&self, kind: BumpKind) -> Self {
        match kind {
            BumpKind::Major => Version { major: self.major + 1, minor: 0, patch: 0 },
            BumpKind::Minor => Version { major: self.major, minor: self.minor + 1, patch: 0 },
            BumpKind::Patch => Version { major: self.major, minor: self.minor, patch: self.patch + 1 },
            BumpKind::None => self.clone(),
        }
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

pub struct Release {
    pub bump: BumpKind,
    pub version: Version,
    pub tag_name: String,
}

pub struct ReleaseDecider {
    forge: Arc<dyn Forge>,
}

impl ReleaseDecider {
    pub fn new(forge: Arc<dyn Forge>) -> Self {
        Self { forge }
    }

    async fn current_version(&self, tag_prefix: &str) -> Result<Version> {
        if let Some(release) = self.forge.get_latest_release().await? {
            if let Some(stripped) = release.tag_name.strip_prefix(tag_prefix) {
                if let Ok(v) = Version::parse(stripped) {
                    return Ok(v);
                }
            }
        }

        let tags = self.forge.list_tags(100).await?;
        let best = tags
            .iter()
            .filter_map(|t| t.strip_prefix(tag_prefix))
            .filter_map(|t| Version::parse(t).ok())
            .max_by_key(|v| (v.major, v.minor, v.patch));

        Ok(best.unwrap_or(Version::ZERO))
    }

    /// Computes `(BumpKind, NewVersion)` from this PR's commits and creates
    /// the tag, idempotently. Returns `None` when no release is warranted
    /// (bump is `None`, or the target SHA is already tagged — that guard
    /// also lives in the state machine's `Releasing` handler, which checks
    /// before calling this at all; this method re-checks for direct callers).
    pub async fn release_for_pr(&self, pr: &PrRecord, release: &ReleaseConfig) -> Result<Option<Release>> {
        self.decide(pr.pr_id, &pr.head_sha, release).await
    }

    pub async fn decide(&self, pr_id: i64, sha: &str, release: &ReleaseConfig) -> Result<Option<Release>> {
        if !release.enabled {
            return Ok(None);
        }
        if self.forge.get_tag_for_sha(sha).await?.is_some() {
            return Ok(None);
        }

        let commits = self.forge.get_pr_commits(pr_id).await?;
        let bump = commits
            .iter()
            .map(|c| BumpKind::from_commit_message(&c.message))
            .max()
            .unwrap_or(BumpKind::None);

        if bump == BumpKind::None {
            return Ok(None);
        }

        let current = self.current_version(&release.tag_prefix).await?;
        let next = current.bump(bump);
        let tag_name = format!("{}{}", release.tag_prefix, next);

        self.forge.create_ref(&format!("refs/tags/{tag_name}"), sha).await?;

        Ok(Some(Release { bump, version: next, tag_name }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_breaking_change_as_major() {
        assert_eq!(BumpKind::from_commit_message("feat!: drop legacy api"), BumpKind::Major);
        assert_eq!(
            BumpKind::from_commit_message("feat: new thing\n\nBREAKING CHANGE: old behavior removed"),
            BumpKind::None
        );
    }

    #[test]
    fn classifies_feat_as_minor() {
        assert_eq!(BumpKind::from_commit_message("feat: add widget"), BumpKind::Minor);
        assert_eq!(BumpKind::from_commit_message("feature: add widget"), BumpKind::Minor);
    }

    #[test]
    fn classifies_scoped_feat_as_minor() {
        assert_eq!(BumpKind::from_commit_message("feat(api): add endpoint"), BumpKind::Minor);
        assert_eq!(BumpKind::from_commit_message("fix(parser): handle empty input"), BumpKind::Patch);
    }

    #[test]
    fn classifies_fix_perf_as_patch() {
        assert_eq!(BumpKind::from_commit_message("fix: off by one"), BumpKind::Patch);
        assert_eq!(BumpKind::from_commit_message("bugfix: off by one"), BumpKind::Patch);
        assert_eq!(BumpKind::from_commit_message("perf: faster hashing"), BumpKind::Patch);
    }

    #[test]
    fn classifies_chore_like_types_as_none() {
        for t in ["docs", "style", "refactor", "test", "chore", "ci", "build"] {
            assert_eq!(BumpKind::from_commit_message(&format!("{t}: tidy up")), BumpKind::None);
        }
    }

    #[test]
    fn non_conforming_message_is_none() {
        assert_eq!(BumpKind::from_commit_message("quick fix for thing"), BumpKind::None);
    }

    #[test]
    fn strongest_bump_wins() {
        let bumps = vec![BumpKind::Patch, BumpKind::Major, BumpKind::None, BumpKind::Minor];
        assert_eq!(bumps.into_iter().max().unwrap(), BumpKind::Major);
    }

    #[test]
    fn version_parse_strips_prerelease_and_build() {
        let v = Version::parse("1.2.3-beta.1+build.7").unwrap();
        assert_eq!(v, Version { major: 1, minor: 2, patch: 3 });
    }

    #[test]
    fn version_bump_resets_lower_components() {
        let v = Version { major: 1, minor: 2, patch: 3 };
        assert_eq!(v.bump(BumpKind::Major), Version { major: 2, minor: 0, patch: 0 });
        assert_eq!(v.bump(BumpKind::Minor), Version { major: 1, minor: 3, patch: 0 });
        assert_eq!(v.bump(BumpKind::Patch), Version { major: 1, minor: 2, patch: 4 });
    }

    #[test]
    fn version_display_round_trips() {
        let v = Version { major: 1, minor: 2, patch: 3 };
        assert_eq!(v.to_string(), "1.2.3");
    }
}
