//! Merge gate (§4.4): approval, pre-merge re-verification, and the actual
//! merge call.

use std::sync::Arc;

use crate::ci_aggregator::CiAggregator;
use crate::config::{Config, EnvironmentConfig};
use crate::error::{Error, Result};
use crate::forge::{ApprovalDecision, ApprovalManager, ApprovalRequest, Forge, ForgeError};
use crate::pr::PrRecord;
use crate::state_machine::CiStatus;

#[derive(Clone)]
pub struct MergeGate {
    forge: Arc<dyn Forge>,
    ci_aggregator: CiAggregator,
}

impl MergeGate {
    pub fn new(forge: Arc<dyn Forge>, _approval_manager: Option<Arc<dyn ApprovalManager>>, ci_aggregator: CiAggregator) -> Self {
        Self { forge, ci_aggregator }
    }

    pub async fn merge(
        &self,
        pr: &mut PrRecord,
        config: &Config,
        env: &EnvironmentConfig,
        approval_manager: Option<&dyn ApprovalManager>,
    ) -> Result<()> {
        if env.requires_approval && approval_manager.is_none() {
            return Err(Error::ApprovalManagerNotConfigured);
        }

        if env.requires_approval {
            let manager = approval_manager.expect("checked above");
            let request = ApprovalRequest {
                task_id: pr.linked_task_id.to_string(),
                stage: "merge".to_string(),
                title: pr.title.clone(),
                description: pr.url.clone(),
            };
            let outcome = manager
                .request_approval(request, env.ci_wait_timeout_secs)
                .await
                .map_err(Error::Forge)?;
            if outcome.decision == ApprovalDecision::Rejected {
                return Err(Error::ApprovalDenied(outcome.approver));
            }
            if let Err(e) = self.forge.approve_pr(pr.pr_id, "Auto-approved by pilot").await {
                tracing::warn!(pr_id = pr.pr_id, error = %e, "auto-approval review comment failed, ignoring");
            }
        }

        if env.release.require_ci {
            let outcome = self.ci_aggregator.check(&pr.head_sha, config).await?;
            if outcome.status != CiStatus::Success {
                return Err(Error::CiStatusChangedBeforeMerge);
            }
        }

        let method = config.merge_method;
        match self.forge.merge_pr(pr.pr_id, method, &pr.title).await {
            Ok(_commit_sha) => Ok(()),
            Err(ForgeError::Conflict(_)) => Err(Error::MergeConflict),
            Err(e) => Err(Error::Forge(e)),
        }
    }
}
