//! [`pilot_core::forge::TaskAdapter`] implementation against GitHub Issues.
//!
//! There is no first-class "processed" marker in the Issues API, so
//! `mark_processed` records the result as a label (`pilot-processed:<result>`)
//! — adapter-specific bookkeeping the core deliberately stays agnostic to.

use async_trait::async_trait;
use pilot_core::forge::{ForgeResult, TaskAdapter};
use serde::{Deserialize, Serialize};

use crate::client::GitHubClient;

pub struct GitHubTaskAdapter {
    client: GitHubClient,
}

impl GitHubTaskAdapter {
    pub fn new(client: GitHubClient) -> Self {
        Self { client }
    }
}

#[derive(Deserialize)]
struct IssueResponse {
    #[serde(default)]
    body: Option<String>,
}

#[derive(Deserialize)]
struct CreatedIssue {
    number: i64,
}

#[derive(Serialize)]
struct CreateIssueRequest<'a> {
    title: String,
    body: &'a str,
}

#[derive(Serialize)]
struct LabelsRequest<'a> {
    labels: &'a [String],
}

#[async_trait]
impl TaskAdapter for GitHubTaskAdapter {
    fn name(&self) -> &'static str {
        "github"
    }

    async fn get_issue_body(&self, id: &str) -> ForgeResult<String> {
        let issue: IssueResponse = self.client.get(&format!("issues/{id}")).await?;
        Ok(issue.body.unwrap_or_default())
    }

    async fn create_fix_issue(&self, parent_id: &str, body: &str) -> ForgeResult<String> {
        let request = CreateIssueRequest { title: format!("Fix for #{parent_id}"), body };
        let issue: CreatedIssue = self.client.post("issues", &request).await?;
        Ok(issue.number.to_string())
    }

    async fn add_labels(&self, id: &str, labels: &[String]) -> ForgeResult<()> {
        self.client
            .post::<_, serde_json::Value>(&format!("issues/{id}/labels"), &LabelsRequest { labels })
            .await
            .map(|_| ())
    }

    async fn remove_label(&self, id: &str, label: &str) -> ForgeResult<()> {
        self.client.delete(&format!("issues/{id}/labels/{label}")).await
    }

    async fn close_issue(&self, id: &str) -> ForgeResult<()> {
        self.client
            .patch::<_, serde_json::Value>(&format!("issues/{id}"), &serde_json::json!({"state": "closed"}))
            .await
            .map(|_| ())
    }

    async fn mark_processed(&self, issue_id: &str, result: &str) -> ForgeResult<()> {
        let label = format!("pilot-processed:{result}");
        self.add_labels(issue_id, std::slice::from_ref(&label)).await
    }
}
