//! # Readiness Poller
//!
//! Waits until a set of cluster objects report the state that means "the
//! controllers are running" or "the source has been fetched".
//!
//! Every round reads all unsatisfied targets concurrently (bounded by
//! `max_parallel`), then sleeps one interval. The wait ends when:
//!
//! - every target holds its predicate (success)
//! - any target reports a fatal condition ([`Error::FatalCondition`])
//! - the deadline passes ([`Error::Timeout`] naming the unsatisfied targets)
//! - the run is cancelled ([`Error::Cancelled`])
//!
//! Objects that do not exist yet and transient read errors simply count as
//! "not ready" for the round.

use crate::cluster::{ObjectRef, ObjectStatus, StatusReader};
use crate::config::deadline_after;
use crate::constants::{CONDITION_AVAILABLE, CONDITION_READY, CONDITION_STALLED, STATUS_TRUE};
use crate::error::{Error, Result};
use crate::observability::metrics;
use futures::stream::{self, StreamExt};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What "ready" means for a target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessPredicate {
    /// Condition of this type has status `True`
    ConditionTrue(String),
    /// `status.observedGeneration` has caught up with `metadata.generation`
    ObservedGenerationCurrent,
    All(Vec<ReadinessPredicate>),
}

impl ReadinessPredicate {
    #[must_use]
    pub fn holds(&self, status: &ObjectStatus) -> bool {
        match self {
            ReadinessPredicate::ConditionTrue(type_) => status
                .condition(type_)
                .is_some_and(|c| c.status == STATUS_TRUE),
            ReadinessPredicate::ObservedGenerationCurrent => {
                match (status.generation, status.observed_generation) {
                    (Some(generation), Some(observed)) => observed >= generation,
                    // Objects without a generation have nothing to observe
                    (None, _) => true,
                    (Some(_), None) => false,
                }
            }
            ReadinessPredicate::All(predicates) => predicates.iter().all(|p| p.holds(status)),
        }
    }
}

/// Condition that ends the wait immediately when present with the given status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatalCondition {
    pub type_: String,
    pub status: String,
}

impl FatalCondition {
    pub fn new(type_: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            type_: type_.into(),
            status: status.into(),
        }
    }

    /// `Stalled=True`
    #[must_use]
    pub fn stalled() -> Self {
        Self::new(CONDITION_STALLED, STATUS_TRUE)
    }
}

/// An object and the state it must reach
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvergenceTarget {
    pub object: ObjectRef,
    pub predicate: ReadinessPredicate,
    pub fatal_conditions: Vec<FatalCondition>,
}

impl ConvergenceTarget {
    #[must_use]
    pub fn new(object: ObjectRef, predicate: ReadinessPredicate) -> Self {
        Self {
            object,
            predicate,
            fatal_conditions: vec![FatalCondition::stalled()],
        }
    }

    /// Controller deployment: rolled out and available
    #[must_use]
    pub fn deployment(namespace: &str, name: &str) -> Self {
        Self::new(
            ObjectRef::new("apps/v1", "Deployment", Some(namespace), name),
            ReadinessPredicate::All(vec![
                ReadinessPredicate::ObservedGenerationCurrent,
                ReadinessPredicate::ConditionTrue(CONDITION_AVAILABLE.to_string()),
            ]),
        )
    }

    /// Flux object reporting `Ready=True` for its current generation
    #[must_use]
    pub fn ready(object: ObjectRef) -> Self {
        Self::new(
            object,
            ReadinessPredicate::All(vec![
                ReadinessPredicate::ObservedGenerationCurrent,
                ReadinessPredicate::ConditionTrue(CONDITION_READY.to_string()),
            ]),
        )
    }

    /// The fatal condition currently reported by the object, if any
    fn fatal(&self, status: &ObjectStatus) -> Option<Error> {
        self.fatal_conditions.iter().find_map(|fatal| {
            let condition = status.condition(&fatal.type_)?;
            (condition.status == fatal.status).then(|| Error::FatalCondition {
                target: self.object.to_string(),
                condition: format!("{}={}", fatal.type_, fatal.status),
                message: condition
                    .message
                    .clone()
                    .or_else(|| condition.reason.clone())
                    .unwrap_or_default(),
            })
        })
    }
}

/// Result of reading one target in one round
enum Probe {
    Ready,
    NotReady,
    Fatal(Error),
}

#[derive(Debug, Clone)]
pub struct ReadinessPoller {
    reader: Arc<dyn StatusReader>,
    interval: Duration,
    max_parallel: usize,
}

impl ReadinessPoller {
    #[must_use]
    pub fn new(reader: Arc<dyn StatusReader>, interval: Duration, max_parallel: usize) -> Self {
        Self {
            reader,
            interval,
            max_parallel: max_parallel.max(1),
        }
    }

    /// Wait until every target holds its predicate
    pub async fn wait_ready(
        &self,
        targets: &[ConvergenceTarget],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let deadline = deadline_after(timeout);
        let mut pending: Vec<&ConvergenceTarget> = targets.iter().collect();
        let mut round = 0u32;

        info!(
            targets = pending.len(),
            timeout_secs = timeout.as_secs(),
            "Waiting for convergence"
        );

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled("cancelled while waiting for readiness".into()));
            }

            round += 1;
            metrics::increment_readiness_polls();
            let probes: Vec<(usize, Probe)> = stream::iter(pending.iter().enumerate())
                .map(|(index, target)| async move { (index, self.probe(target).await) })
                .buffer_unordered(self.max_parallel)
                .collect()
                .await;

            let mut ready = BTreeSet::new();
            for (index, probe) in probes {
                match probe {
                    Probe::Ready => {
                        ready.insert(index);
                    }
                    Probe::NotReady => {}
                    Probe::Fatal(err) => return Err(err),
                }
            }
            pending = pending
                .into_iter()
                .enumerate()
                .filter(|(index, _)| !ready.contains(index))
                .map(|(_, target)| target)
                .collect();

            if pending.is_empty() {
                info!(rounds = round, "All targets ready");
                return Ok(());
            }
            debug!(
                round,
                pending = ?pending.iter().map(|t| t.object.to_string()).collect::<Vec<_>>(),
                "Targets not ready yet"
            );

            let now = Instant::now();
            if now >= deadline {
                let mut names: Vec<String> = pending.iter().map(|t| t.object.to_string()).collect();
                names.sort();
                warn!(targets = ?names, "Readiness deadline elapsed");
                return Err(Error::Timeout { targets: names });
            }

            let sleep = self.interval.min(deadline - now);
            tokio::select! {
                () = cancel.cancelled() => {
                    return Err(Error::Cancelled("cancelled while waiting for readiness".into()));
                }
                () = tokio::time::sleep(sleep) => {}
            }
        }
    }

    async fn probe(&self, target: &ConvergenceTarget) -> Probe {
        match self.reader.read_status(&target.object).await {
            Ok(Some(status)) => {
                if let Some(err) = target.fatal(&status) {
                    return Probe::Fatal(err);
                }
                if target.predicate.holds(&status) {
                    Probe::Ready
                } else {
                    Probe::NotReady
                }
            }
            Ok(None) => Probe::NotReady,
            Err(err) if err.is_transient() => {
                debug!(target = %target.object, error = %err, "Transient status read failure");
                Probe::NotReady
            }
            Err(err) => Probe::Fatal(err),
        }
    }
}
