//! GitHub REST API adapter: implements `pilot_core`'s `Forge` and
//! `TaskAdapter` traits so the controller can drive real PRs and issues.

mod client;
mod forge;
mod task;

pub use client::GitHubClient;
pub use forge::GitHubForge;
pub use task::GitHubTaskAdapter;
