use std::time::Instant;

use thiserror::Error;
use uuid::Uuid;

use crate::state::match_session::MatchStatus;

/// Events that move a match through its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchEvent {
    /// Kick-off: the match starts accepting writes.
    Start,
    /// Final whistle. Applied at most once.
    Finish,
}

/// Error returned when attempting to apply an invalid transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition: {event:?} cannot be applied while {from:?}")]
pub struct InvalidTransition {
    /// Status the event was raised in.
    pub from: MatchStatus,
    /// The rejected event.
    pub event: MatchEvent,
}

/// Errors that can occur when planning a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    /// A transition is already pending and must be applied or aborted.
    AlreadyPending,
    /// The event is not allowed from the current status.
    InvalidTransition(InvalidTransition),
}

/// Errors that can occur when applying a planned transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    /// Nothing was planned.
    NoPending,
    /// Another plan is pending.
    IdMismatch {
        /// Id of the pending plan.
        expected: PlanId,
        /// Id passed by the caller.
        got: PlanId,
    },
    /// The lifecycle moved since the plan was made.
    VersionMismatch {
        /// Version the plan was made for.
        expected: usize,
        /// Version the lifecycle would move to now.
        actual: usize,
    },
}

/// Errors that can occur when aborting a planned transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortError {
    /// Nothing was planned.
    NoPending,
    /// Another plan is pending.
    IdMismatch {
        /// Id of the pending plan.
        expected: PlanId,
        /// Id passed by the caller.
        got: PlanId,
    },
}

/// Identifier of a planned transition.
pub type PlanId = Uuid;

/// A validated transition that has not been applied yet.
#[derive(Debug, Clone)]
pub struct Plan {
    /// Plan id, required to apply or abort.
    pub id: PlanId,
    /// Status before the transition.
    pub from: MatchStatus,
    /// Status after the transition.
    pub to: MatchStatus,
    /// Event that triggered it.
    pub event: MatchEvent,
    /// Lifecycle version once applied.
    pub version_next: usize,
    /// When the plan was made.
    pub pending_since: Instant,
}

/// Per-match lifecycle: `scheduled -> in_progress -> finished`.
///
/// Transitions are two-phase. The caller plans, performs the storage work, then applies the
/// plan or aborts it when the work failed, so a failed write never advances the status.
#[derive(Debug, Clone)]
pub struct MatchLifecycle {
    status: MatchStatus,
    version: usize,
    pending: Option<Plan>,
}

impl MatchLifecycle {
    /// Lifecycle resumed at `status`.
    pub fn new(status: MatchStatus) -> Self {
        Self {
            status,
            version: 0,
            pending: None,
        }
    }

    /// Current status.
    pub fn status(&self) -> MatchStatus {
        self.status
    }

    /// Validate `event` and reserve the transition.
    pub fn plan(&mut self, event: MatchEvent) -> Result<Plan, PlanError> {
        if self.pending.is_some() {
            return Err(PlanError::AlreadyPending);
        }

        let next = Self::compute_transition(self.status, event).map_err(PlanError::InvalidTransition)?;
        let plan = Plan {
            id: Uuid::new_v4(),
            from: self.status,
            to: next,
            event,
            version_next: self.version + 1,
            pending_since: Instant::now(),
        };
        self.pending = Some(plan.clone());
        Ok(plan)
    }

    /// Commit the pending plan.
    pub fn apply(&mut self, plan_id: PlanId) -> Result<MatchStatus, ApplyError> {
        let plan = self.pending.take().ok_or(ApplyError::NoPending)?;

        if plan.id != plan_id {
            let expected = plan.id;
            self.pending = Some(plan);
            return Err(ApplyError::IdMismatch {
                expected,
                got: plan_id,
            });
        }

        if self.version + 1 != plan.version_next {
            return Err(ApplyError::VersionMismatch {
                expected: plan.version_next,
                actual: self.version + 1,
            });
        }

        self.status = plan.to;
        self.version = plan.version_next;
        Ok(self.status)
    }

    /// Drop the pending plan; the status stays put.
    pub fn abort(&mut self, plan_id: PlanId) -> Result<(), AbortError> {
        let plan = self.pending.as_ref().ok_or(AbortError::NoPending)?;
        if plan.id != plan_id {
            return Err(AbortError::IdMismatch {
                expected: plan.id,
                got: plan_id,
            });
        }
        self.pending = None;
        Ok(())
    }

    fn compute_transition(
        from: MatchStatus,
        event: MatchEvent,
    ) -> Result<MatchStatus, InvalidTransition> {
        match (from, event) {
            (MatchStatus::Scheduled, MatchEvent::Start) => Ok(MatchStatus::InProgress),
            (MatchStatus::InProgress, MatchEvent::Finish) => Ok(MatchStatus::Finished),
            (from, event) => Err(InvalidTransition { from, event }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(lifecycle: &mut MatchLifecycle, event: MatchEvent) -> MatchStatus {
        let plan = lifecycle.plan(event).unwrap();
        lifecycle.apply(plan.id).unwrap()
    }

    #[test]
    fn happy_path_reaches_finished() {
        let mut lifecycle = MatchLifecycle::new(MatchStatus::Scheduled);
        assert_eq!(apply(&mut lifecycle, MatchEvent::Start), MatchStatus::InProgress);
        assert_eq!(apply(&mut lifecycle, MatchEvent::Finish), MatchStatus::Finished);
    }

    #[test]
    fn finish_is_terminal() {
        let mut lifecycle = MatchLifecycle::new(MatchStatus::InProgress);
        apply(&mut lifecycle, MatchEvent::Finish);

        let err = lifecycle.plan(MatchEvent::Finish).unwrap_err();
        assert_eq!(
            err,
            PlanError::InvalidTransition(InvalidTransition {
                from: MatchStatus::Finished,
                event: MatchEvent::Finish,
            })
        );
    }

    #[test]
    fn second_plan_while_pending_is_rejected() {
        let mut lifecycle = MatchLifecycle::new(MatchStatus::InProgress);
        let plan = lifecycle.plan(MatchEvent::Finish).unwrap();
        assert_eq!(lifecycle.plan(MatchEvent::Finish).unwrap_err(), PlanError::AlreadyPending);

        lifecycle.abort(plan.id).unwrap();
        assert_eq!(lifecycle.status(), MatchStatus::InProgress);
        assert!(lifecycle.plan(MatchEvent::Finish).is_ok());
    }

    #[test]
    fn apply_with_foreign_plan_id_keeps_pending() {
        let mut lifecycle = MatchLifecycle::new(MatchStatus::Scheduled);
        let plan = lifecycle.plan(MatchEvent::Start).unwrap();
        assert!(matches!(
            lifecycle.apply(Uuid::new_v4()),
            Err(ApplyError::IdMismatch { .. })
        ));
        assert_eq!(lifecycle.apply(plan.id), Ok(MatchStatus::InProgress));
    }
}
