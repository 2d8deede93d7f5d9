//! # Bootstrap Report
//!
//! Structured result of a run, printed by the CLI as JSON or YAML.

use super::state::BootstrapState;
use crate::credentials::DeployCredential;
use crate::error::Error;
use crate::manifests::CommitResult;
use serde::Serialize;

/// How a step ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum StepOutcome {
    /// Remote state already matched; nothing was written
    Satisfied,
    Mutated,
    /// Dry run: a mutation would have been made
    Planned,
    /// Not applicable to this run (e.g. waits during a dry run)
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepReport {
    pub state: BootstrapState,
    pub outcome: StepOutcome,
    pub detail: String,
    pub duration_ms: u64,
}

/// Commit made (or planned) during the run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitReport {
    pub step: BootstrapState,
    pub sha: Option<String>,
    pub skipped: bool,
    pub files: Vec<String>,
}

impl CommitReport {
    #[must_use]
    pub fn new(step: BootstrapState, result: &CommitResult) -> Self {
        Self {
            step,
            sha: result.sha.clone(),
            skipped: result.skipped,
            files: result.files.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureReport {
    /// Step that failed
    pub step: BootstrapState,
    pub last_completed: BootstrapState,
    /// Classified error kind, see [`Error::kind`]
    pub error_kind: String,
    pub message: String,
    /// Unsatisfied targets of a readiness timeout
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<String>,
}

impl FailureReport {
    #[must_use]
    pub fn new(step: BootstrapState, last_completed: BootstrapState, err: &Error) -> Self {
        Self {
            step,
            last_completed,
            error_kind: err.kind().to_string(),
            message: err.to_string(),
            targets: match err {
                Error::Timeout { targets } => targets.clone(),
                _ => Vec::new(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapReport {
    pub run_id: String,
    pub dry_run: bool,
    /// States visited, starting with `Init`
    pub states: Vec<BootstrapState>,
    pub steps: Vec<StepReport>,
    pub commits: Vec<CommitReport>,
    pub credential: Option<DeployCredential>,
    pub failure: Option<FailureReport>,
}

impl BootstrapReport {
    #[must_use]
    pub fn new(run_id: String, dry_run: bool) -> Self {
        Self {
            run_id,
            dry_run,
            states: vec![BootstrapState::Init],
            steps: Vec::new(),
            commits: Vec::new(),
            credential: None,
            failure: None,
        }
    }

    /// Last state reached
    #[must_use]
    pub fn final_state(&self) -> BootstrapState {
        self.states
            .last()
            .copied()
            .unwrap_or(BootstrapState::Init)
    }

    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.final_state() == BootstrapState::Done
    }

    /// Steps that wrote to the provider or the cluster
    #[must_use]
    pub fn mutations(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.outcome == StepOutcome::Mutated)
            .count()
    }

    #[must_use]
    pub fn step(&self, state: BootstrapState) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.state == state)
    }

    /// Last non-failed state reached
    #[must_use]
    pub fn last_completed(&self) -> BootstrapState {
        self.states
            .iter()
            .rev()
            .find(|s| **s != BootstrapState::Failed)
            .copied()
            .unwrap_or(BootstrapState::Init)
    }
}
