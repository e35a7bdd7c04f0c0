//! [`pilot_core::forge::Forge`] implementation against the GitHub REST API.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pilot_core::forge::{
    CheckConclusion, CheckRun, CheckStatus, Forge, ForgeError, ForgeResult, MergeMethod,
    MergeableState, PrState, RemoteCommit, RemotePr, RemoteRelease,
};
use serde::{Deserialize, Serialize};

use crate::client::GitHubClient;

pub struct GitHubForge {
    client: GitHubClient,
}

impl GitHubForge {
    pub fn new(client: GitHubClient) -> Self {
        Self { client }
    }
}

#[derive(Deserialize)]
struct HeadRef {
    sha: String,
    #[serde(rename = "ref")]
    r#ref: String,
}

#[derive(Deserialize)]
struct PrResponse {
    number: i64,
    state: String,
    #[serde(default)]
    merged: bool,
    mergeable: Option<bool>,
    mergeable_state: Option<String>,
    head: HeadRef,
    merge_commit_sha: Option<String>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

fn parse_mergeable_state(s: Option<&str>) -> MergeableState {
    match s {
        Some("dirty") => MergeableState::Dirty,
        Some("clean") | Some("unstable") | Some("blocked") | Some("behind") | Some("has_hooks") => MergeableState::Clean,
        _ => MergeableState::Unknown,
    }
}

impl From<PrResponse> for RemotePr {
    fn from(pr: PrResponse) -> Self {
        RemotePr {
            id: pr.number,
            state: if pr.state == "closed" { PrState::Closed } else { PrState::Open },
            merged: pr.merged,
            mergeable: pr.mergeable,
            mergeable_state: parse_mergeable_state(pr.mergeable_state.as_deref()),
            head_sha: pr.head.sha,
            head_ref: pr.head.r#ref,
            merge_commit_sha: pr.merge_commit_sha,
        }
    }
}

#[derive(Deserialize)]
struct CheckRunsResponse {
    check_runs: Vec<CheckRunDto>,
}

#[derive(Deserialize)]
struct CheckRunDto {
    name: String,
    status: String,
    conclusion: Option<String>,
    id: i64,
}

fn parse_check_status(s: &str) -> CheckStatus {
    match s {
        "queued" => CheckStatus::Queued,
        "in_progress" => CheckStatus::InProgress,
        _ => CheckStatus::Completed,
    }
}

fn parse_check_conclusion(s: &str) -> CheckConclusion {
    match s {
        "success" => CheckConclusion::Success,
        "cancelled" => CheckConclusion::Cancelled,
        "timed_out" => CheckConclusion::TimedOut,
        "skipped" => CheckConclusion::Skipped,
        "neutral" => CheckConclusion::Neutral,
        _ => CheckConclusion::Failure,
    }
}

impl From<CheckRunDto> for CheckRun {
    fn from(dto: CheckRunDto) -> Self {
        CheckRun {
            name: dto.name,
            status: parse_check_status(&dto.status),
            conclusion: dto.conclusion.as_deref().map(parse_check_conclusion),
            external_job_id: Some(dto.id.to_string()),
        }
    }
}

#[derive(Serialize)]
struct MergeRequest {
    merge_method: String,
    commit_title: String,
}

#[derive(Deserialize)]
struct RefResponse {
    object: ObjectInfo,
}

#[derive(Deserialize)]
struct ObjectInfo {
    sha: String,
}

#[derive(Serialize)]
struct UpdateRefRequest {
    sha: String,
    force: bool,
}

#[derive(Deserialize)]
struct ReleaseResponse {
    tag_name: String,
}

#[derive(Deserialize)]
struct TagResponse {
    name: String,
    commit: TagCommit,
}

#[derive(Deserialize)]
struct TagCommit {
    sha: String,
}

#[derive(Serialize)]
struct CreateRefRequest {
    #[serde(rename = "ref")]
    r#ref: String,
    sha: String,
}

#[derive(Deserialize)]
struct CommitResponse {
    sha: String,
    commit: CommitDetail,
}

#[derive(Deserialize)]
struct CommitDetail {
    message: String,
}

#[async_trait]
impl Forge for GitHubForge {
    fn name(&self) -> &'static str {
        "github"
    }

    async fn get_pr(&self, id: i64) -> ForgeResult<RemotePr> {
        self.client.get::<PrResponse>(&format!("pulls/{id}")).await.map(Into::into)
    }

    async fn list_checks(&self, sha: &str) -> ForgeResult<Vec<CheckRun>> {
        let response: CheckRunsResponse = self.client.get(&format!("commits/{sha}/check-runs?per_page=100")).await?;
        Ok(response.check_runs.into_iter().map(Into::into).collect())
    }

    async fn get_check_logs(&self, job_id: &str) -> ForgeResult<Vec<u8>> {
        self.client.get_bytes(&format!("actions/jobs/{job_id}/logs")).await
    }

    async fn merge_pr(&self, id: i64, method: MergeMethod, title: &str) -> ForgeResult<String> {
        #[derive(Deserialize)]
        struct MergeResponse {
            sha: String,
        }
        let body = MergeRequest { merge_method: method.to_string(), commit_title: title.to_string() };
        let response: MergeResponse = self.client.put(&format!("pulls/{id}/merge"), &body).await?;
        Ok(response.sha)
    }

    async fn update_pr_branch(&self, id: i64) -> ForgeResult<()> {
        self.client.put::<_, serde_json::Value>(&format!("pulls/{id}/update-branch"), &serde_json::json!({})).await.map(|_| ())
    }

    async fn close_pr(&self, id: i64) -> ForgeResult<()> {
        self.client
            .patch::<_, serde_json::Value>(&format!("pulls/{id}"), &serde_json::json!({"state": "closed"}))
            .await
            .map(|_| ())
    }

    async fn approve_pr(&self, id: i64, body: &str) -> ForgeResult<()> {
        self.client
            .post::<_, serde_json::Value>(&format!("pulls/{id}/reviews"), &serde_json::json!({"event": "APPROVE", "body": body}))
            .await
            .map(|_| ())
    }

    async fn comment_on_pr(&self, id: i64, body: &str) -> ForgeResult<()> {
        self.client
            .post::<_, serde_json::Value>(&format!("issues/{id}/comments"), &serde_json::json!({"body": body}))
            .await
            .map(|_| ())
    }

    async fn get_branch_sha(&self, name: &str) -> ForgeResult<String> {
        let response: RefResponse = self.client.get(&format!("git/ref/heads/{name}")).await?;
        Ok(response.object.sha)
    }

    async fn update_ref(&self, name: &str, sha: &str) -> ForgeResult<()> {
        let path = name.strip_prefix("refs/").unwrap_or(name);
        let body = UpdateRefRequest { sha: sha.to_string(), force: false };
        self.client.patch::<_, serde_json::Value>(&format!("git/refs/{path}"), &body).await.map(|_| ())
    }

    async fn get_latest_release(&self) -> ForgeResult<Option<RemoteRelease>> {
        let release: Option<ReleaseResponse> = self.client.get_optional("releases/latest").await?;
        Ok(release.map(|r| RemoteRelease { tag_name: r.tag_name, target_sha: String::new() }))
    }

    async fn list_tags(&self, limit: u32) -> ForgeResult<Vec<String>> {
        let tags: Vec<TagResponse> = self.client.get(&format!("tags?per_page={limit}")).await?;
        Ok(tags.into_iter().map(|t| t.name).collect())
    }

    async fn create_ref(&self, refname: &str, sha: &str) -> ForgeResult<()> {
        let body = CreateRefRequest { r#ref: refname.to_string(), sha: sha.to_string() };
        self.client.post::<_, serde_json::Value>("git/refs", &body).await.map(|_| ())
    }

    async fn get_tag_for_sha(&self, sha: &str) -> ForgeResult<Option<String>> {
        let tags: Vec<TagResponse> = self.client.get("tags?per_page=100").await?;
        Ok(tags.into_iter().find(|t| t.commit.sha == sha).map(|t| t.name))
    }

    async fn list_open_prs(&self) -> ForgeResult<Vec<RemotePr>> {
        let prs: Vec<PrResponse> = self.client.get("pulls?state=open&per_page=100").await?;
        Ok(prs.into_iter().map(Into::into).collect())
    }

    async fn list_closed_prs(&self, since: DateTime<Utc>) -> ForgeResult<Vec<RemotePr>> {
        let prs: Vec<PrResponse> = self.client.get("pulls?state=closed&sort=updated&direction=desc&per_page=100").await?;
        Ok(prs
            .into_iter()
            .filter(|p| p.updated_at.map(|u| u >= since).unwrap_or(false))
            .map(Into::into)
            .collect())
    }

    async fn get_pr_commits(&self, id: i64) -> ForgeResult<Vec<RemoteCommit>> {
        let commits: Vec<CommitResponse> = self.client.get(&format!("pulls/{id}/commits?per_page=250")).await?;
        Ok(commits.into_iter().map(|c| RemoteCommit { sha: c.sha, message: c.commit.message }).collect())
    }
}
