//! Post-merge deployer (§4.8): fires the configured side effect after a PR
//! merges into a deploy-triggering branch.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::config::PostMergeConfig;
use crate::error::{Error, Result};
use crate::forge::Forge;

type HmacSha256 = Hmac<Sha256>;

#[derive(serde::Serialize)]
struct WebhookPayload<'a> {
    pr_id: i64,
    branch: &'a str,
    sha: &'a str,
    environment: &'a str,
}

pub struct Deployer {
    http: reqwest::Client,
}

impl Default for Deployer {
    fn default() -> Self {
        Self { http: reqwest::Client::new() }
    }
}

impl Deployer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn deploy(
        &self,
        forge: &dyn Forge,
        post_merge: &PostMergeConfig,
        pr_id: i64,
        branch: &str,
        sha: &str,
        environment: &str,
    ) -> Result<()> {
        use crate::config::PostMergeAction;

        match post_merge.action {
            PostMergeAction::None | PostMergeAction::Tag => Ok(()),
            PostMergeAction::Webhook => self.fire_webhook(post_merge, pr_id, branch, sha, environment).await,
            PostMergeAction::BranchPush => {
                let deploy_branch = post_merge
                    .deploy_branch
                    .as_deref()
                    .ok_or_else(|| Error::Config("postMerge.deployBranch required for branch-push".to_string()))?;
                forge
                    .update_ref(&format!("refs/heads/{deploy_branch}"), sha)
                    .await
                    .map_err(Error::Forge)
            }
        }
    }

    async fn fire_webhook(
        &self,
        post_merge: &PostMergeConfig,
        pr_id: i64,
        branch: &str,
        sha: &str,
        environment: &str,
    ) -> Result<()> {
        let url = post_merge
            .webhook_url
            .as_deref()
            .ok_or_else(|| Error::Config("postMerge.webhookUrl required for webhook action".to_string()))?;

        let payload = WebhookPayload { pr_id, branch, sha, environment };
        let body = serde_json::to_vec(&payload)?;

        let mut request = self.http.post(url).header("Content-Type", "application/json");
        for (name, value) in &post_merge.webhook_headers {
            request = request.header(name, value);
        }
        if let Some(secret) = &post_merge.webhook_secret {
            request = request.header("X-Signature-256", format!("sha256={}", sign(secret, &body)));
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Other(format!("webhook request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::Other(format!("webhook returned non-2xx status: {}", response.status())));
        }
        Ok(())
    }
}

/// Computes the hex-encoded HMAC-SHA256 of `payload` under `secret`, the
/// same construction GitHub's own webhook signatures use, just generating
/// instead of verifying.
fn sign(secret: &str, payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic_and_hex_encoded() {
        let sig = sign("secret", b"{\"hello\":\"world\"}");
        assert_eq!(sig.len(), 64);
        assert_eq!(sig, sign("secret", b"{\"hello\":\"world\"}"));
    }

    #[test]
    fn different_secrets_produce_different_signatures() {
        assert_ne!(sign("secret-a", b"payload"), sign("secret-b", b"payload"));
    }
}
