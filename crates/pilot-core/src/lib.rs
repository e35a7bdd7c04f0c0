//! pilot-core - PR lifecycle automation: CI aggregation, merge gating,
//! release tagging, circuit breaking, and the persistent state store behind
//! the controller loop.
//!
//! Hosting-service and task-tracker specifics live behind the [`forge::Forge`]
//! and [`forge::TaskAdapter`] traits; this crate only knows their contracts.

pub mod autopilot_meta;
pub mod ci_aggregator;
pub mod circuit_breaker;
pub mod config;
pub mod controller;
pub mod deployer;
pub mod error;
pub mod forge;
pub mod merge_gate;
pub mod pr;
pub mod release_decider;
pub mod state_machine;
pub mod store;

pub use ci_aggregator::{CiAggregateOutcome, CiAggregator};
pub use circuit_breaker::CircuitBreaker;
pub use config::{CiChecksConfig, CiChecksMode, Config, EnvironmentConfig, PostMergeConfig, ReleaseConfig, ReleaseTrigger};
pub use controller::Controller;
pub use deployer::Deployer;
pub use error::{Error, Result};
pub use forge::{
    ApprovalDecision, ApprovalManager, ApprovalOutcome, ApprovalRequest, CheckConclusion, CheckRun,
    CheckStatus, Forge, ForgeError, ForgeResult, MergeMethod, MergeableState, Notifier, PrState,
    RemoteCommit, RemotePr, RemoteRelease, TaskAdapter,
};
pub use merge_gate::MergeGate;
pub use pr::{matches_branch_convention, PrRecord};
pub use release_decider::{BumpKind, Release, ReleaseDecider, Version};
pub use state_machine::{CiStatus, Stage, StateMachine, TickOutcome};
pub use store::{Store, StoreConfig};
