//! Bootstrap states, in execution order.

use serde::Serialize;
use std::fmt;

/// Each state names what has been established once it is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum BootstrapState {
    Init,
    RepoEnsured,
    CredentialEnsured,
    InstallCommitted,
    InstallApplied,
    ControllersReady,
    SyncCommitted,
    SourceReady,
    Done,
    Failed,
}

impl BootstrapState {
    /// States reached by a successful run, after `Init`
    pub const STEPS: [BootstrapState; 8] = [
        BootstrapState::RepoEnsured,
        BootstrapState::CredentialEnsured,
        BootstrapState::InstallCommitted,
        BootstrapState::InstallApplied,
        BootstrapState::ControllersReady,
        BootstrapState::SyncCommitted,
        BootstrapState::SourceReady,
        BootstrapState::Done,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            BootstrapState::Init => "Init",
            BootstrapState::RepoEnsured => "RepoEnsured",
            BootstrapState::CredentialEnsured => "CredentialEnsured",
            BootstrapState::InstallCommitted => "InstallCommitted",
            BootstrapState::InstallApplied => "InstallApplied",
            BootstrapState::ControllersReady => "ControllersReady",
            BootstrapState::SyncCommitted => "SyncCommitted",
            BootstrapState::SourceReady => "SourceReady",
            BootstrapState::Done => "Done",
            BootstrapState::Failed => "Failed",
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, BootstrapState::Done | BootstrapState::Failed)
    }
}

impl fmt::Display for BootstrapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
