//! Per resource type status tracking
//!
//! Every tracked kind starts a cycle `Progressing` and ends it `Synced` or
//! `Error`. The tracker folds those outcomes into an [`ApplicationStatus`],
//! carrying over timestamps of entries whose state did not change so that
//! an unchanged outcome produces an identical status.

use std::collections::BTreeMap;

use keel_common::crd::{
    ApplicationStatus, Condition, ConditionStatus, ControllerStatus, SyncPhase,
};

use crate::apply::ApplyOutcome;
use crate::error::{FailedStep, StepError};
use crate::resources::ResourceKind;

/// Condition type summarising the whole Application
pub const READY_CONDITION: &str = "Ready";

const PROGRESSING_MESSAGE: &str = "reconciling";

/// Outcome of every tracked resource type for one cycle
#[derive(Clone, Debug)]
pub struct StatusTracker {
    entries: BTreeMap<ResourceKind, ControllerStatus>,
    failed: Vec<FailedStep>,
}

impl StatusTracker {
    /// Mark every kind in `kinds` `Progressing`
    pub fn start(kinds: &[ResourceKind]) -> Self {
        Self {
            entries: kinds
                .iter()
                .map(|k| {
                    (
                        *k,
                        ControllerStatus::new(SyncPhase::Progressing, PROGRESSING_MESSAGE),
                    )
                })
                .collect(),
            failed: Vec::new(),
        }
    }

    /// Record how the step for `kind` ended
    pub fn finish(&mut self, kind: ResourceKind, result: &Result<ApplyOutcome, StepError>) {
        let entry = match result {
            Ok(ApplyOutcome::Absent) => {
                ControllerStatus::new(SyncPhase::Synced, format!("{kind} not required"))
            }
            Ok(_) => ControllerStatus::new(SyncPhase::Synced, format!("{kind} synced successfully")),
            Err(e) => {
                self.failed.retain(|f| f.kind != kind);
                self.failed.push(FailedStep {
                    kind,
                    message: e.to_string(),
                    retryable: e.is_retryable(),
                });
                ControllerStatus::new(SyncPhase::Error, e.to_string())
            }
        };
        self.entries.insert(kind, entry);
    }

    pub fn phase(&self, kind: ResourceKind) -> Option<SyncPhase> {
        self.entries.get(&kind).map(|e| e.status)
    }

    /// Every tracked kind finished `Synced`
    pub fn is_ready(&self) -> bool {
        self.entries.values().all(|e| e.status == SyncPhase::Synced)
    }

    /// Kinds that ended in error, in tracking order
    pub fn failed(&self) -> Vec<FailedStep> {
        let mut failed = self.failed.clone();
        failed.sort_by_key(|f| f.kind);
        failed
    }

    /// Application-level entry summarising every kind
    pub fn summary(&self) -> ControllerStatus {
        if !self.failed.is_empty() {
            let kinds = self
                .failed()
                .iter()
                .map(|f| f.kind.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            return ControllerStatus::new(
                SyncPhase::Error,
                format!("{} of {} resource types failed: {kinds}", self.failed.len(), self.entries.len()),
            );
        }
        if self.is_ready() {
            ControllerStatus::new(SyncPhase::Synced, "all resource types synced")
        } else {
            ControllerStatus::new(SyncPhase::Progressing, PROGRESSING_MESSAGE)
        }
    }

    /// Status to persist for this cycle. `previous` supplies timestamps
    /// for entries whose phase and message are unchanged.
    pub fn to_status(
        &self,
        generation: Option<i64>,
        previous: Option<&ApplicationStatus>,
    ) -> ApplicationStatus {
        let keep = |previous: Option<&ControllerStatus>, next: ControllerStatus| match previous {
            Some(p) if p.same_state(&next) => p.clone(),
            _ => next,
        };

        let controllers = self
            .entries
            .iter()
            .map(|(kind, entry)| {
                let prev = previous.and_then(|p| p.controllers.get(kind.as_str()));
                (kind.as_str().to_string(), keep(prev, entry.clone()))
            })
            .collect();

        let summary = self.summary();
        let application = keep(previous.and_then(|p| p.application.as_ref()), summary.clone());

        let ready = ready_condition(&summary);
        let ready = match previous.and_then(|p| find_ready(&p.conditions)) {
            Some(prev) if prev.same_state(&ready) => prev.clone(),
            Some(prev) if prev.status == ready.status => Condition {
                last_transition_time: prev.last_transition_time,
                ..ready
            },
            _ => ready,
        };

        ApplicationStatus {
            observed_generation: generation,
            application: Some(application),
            controllers,
            conditions: vec![ready],
        }
    }
}

fn ready_condition(summary: &ControllerStatus) -> Condition {
    let status = match summary.status {
        SyncPhase::Synced => ConditionStatus::True,
        _ => ConditionStatus::False,
    };
    Condition::new(
        READY_CONDITION,
        status,
        summary.status.to_string(),
        summary.message.clone(),
    )
}

fn find_ready(conditions: &[Condition]) -> Option<&Condition> {
    conditions.iter().find(|c| c.type_ == READY_CONDITION)
}

/// Whether the Ready condition of `status` is true
pub fn is_ready(status: &ApplicationStatus) -> bool {
    find_ready(&status.conditions).is_some_and(|c| c.status == ConditionStatus::True)
}

/// Whether writing `desired` would change any phase or message of `current`
pub fn differs(desired: &ApplicationStatus, current: Option<&ApplicationStatus>) -> bool {
    let Some(current) = current else {
        return true;
    };
    let same_entry = |a: Option<&ControllerStatus>, b: Option<&ControllerStatus>| match (a, b) {
        (Some(a), Some(b)) => a.same_state(b),
        (None, None) => true,
        _ => false,
    };

    desired.observed_generation != current.observed_generation
        || !same_entry(desired.application.as_ref(), current.application.as_ref())
        || desired.controllers.len() != current.controllers.len()
        || desired
            .controllers
            .iter()
            .any(|(k, d)| !same_entry(Some(d), current.controllers.get(k)))
        || desired.conditions.len() != current.conditions.len()
        || desired
            .conditions
            .iter()
            .zip(&current.conditions)
            .any(|(d, c)| !d.same_state(c))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;

    fn finished_tracker() -> StatusTracker {
        let mut tracker = StatusTracker::start(&ResourceKind::ALL);
        for kind in ResourceKind::ALL {
            tracker.finish(kind, &Ok(ApplyOutcome::Unchanged));
        }
        tracker
    }

    #[test]
    fn story_cycle_starts_with_everything_progressing() {
        let tracker = StatusTracker::start(&ResourceKind::ALL);
        let status = tracker.to_status(Some(3), None);

        assert_eq!(status.observed_generation, Some(3));
        assert_eq!(status.controllers.len(), 10);
        assert!(status
            .controllers
            .values()
            .all(|c| c.status == SyncPhase::Progressing));
        assert!(!is_ready(&status));
        assert_eq!(status.conditions[0].reason, "Progressing");
    }

    #[test]
    fn story_one_failure_leaves_siblings_synced() {
        let mut tracker = finished_tracker();
        tracker.finish(
            ResourceKind::PodDisruptionBudget,
            &Err(StepError::Validation("min must be at least 1".to_string())),
        );

        assert_eq!(tracker.phase(ResourceKind::Service), Some(SyncPhase::Synced));
        assert_eq!(
            tracker.phase(ResourceKind::HorizontalPodAutoscaler),
            Some(SyncPhase::Synced)
        );
        assert_eq!(
            tracker.phase(ResourceKind::PodDisruptionBudget),
            Some(SyncPhase::Error)
        );
        assert!(!tracker.is_ready());

        let failed = tracker.failed();
        assert_eq!(failed.len(), 1);
        assert!(!failed[0].retryable);

        let summary = tracker.summary();
        assert_eq!(summary.status, SyncPhase::Error);
        assert_eq!(
            summary.message,
            "1 of 10 resource types failed: PodDisruptionBudget"
        );
    }

    #[test]
    fn story_all_synced_is_ready() {
        let tracker = finished_tracker();
        assert!(tracker.is_ready());
        let status = tracker.to_status(Some(1), None);
        assert!(is_ready(&status));
        assert_eq!(
            status.controllers["Deployment"].message,
            "Deployment synced successfully"
        );
    }

    #[test]
    fn absent_children_are_synced_as_not_required() {
        let mut tracker = finished_tracker();
        tracker.finish(ResourceKind::NetworkPolicy, &Ok(ApplyOutcome::Absent));
        let status = tracker.to_status(Some(1), None);
        assert_eq!(status.controllers["NetworkPolicy"].status, SyncPhase::Synced);
        assert_eq!(
            status.controllers["NetworkPolicy"].message,
            "NetworkPolicy not required"
        );
        assert!(tracker.is_ready());
    }

    #[test]
    fn retryable_failures_are_reported() {
        let mut tracker = finished_tracker();
        tracker.finish(
            ResourceKind::Service,
            &Err(StepError::Store(StoreError::unavailable("etcd down"))),
        );
        assert!(tracker.failed()[0].retryable);
    }

    #[test]
    fn unchanged_outcome_keeps_previous_timestamps() {
        let first = finished_tracker().to_status(Some(1), None);
        let second = finished_tracker().to_status(Some(1), Some(&first));

        assert_eq!(first, second);
        assert!(!differs(&second, Some(&first)));
    }

    #[test]
    fn phase_or_message_changes_are_detected() {
        let first = finished_tracker().to_status(Some(1), None);

        let mut tracker = finished_tracker();
        tracker.finish(
            ResourceKind::Service,
            &Err(StepError::OwnerReference("owned elsewhere".to_string())),
        );
        let second = tracker.to_status(Some(1), Some(&first));
        assert!(differs(&second, Some(&first)));
        assert!(differs(&first, None));

        let bumped = finished_tracker().to_status(Some(2), Some(&first));
        assert!(differs(&bumped, Some(&first)));
    }
}
