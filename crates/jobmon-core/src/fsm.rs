// Transition legality for every entity the server owns.
//
// The storage layer is the sole writer of status columns; before every write
// it consults this module with the (observed, requested) pair it read under a
// row lock. Idempotency rule: observed == requested is absorbed as success,
// any other illegal pair is a hard error the caller must not retry.

use crate::error::JobmonError;
use crate::states::{TaskInstanceStatus, TaskStatus, WorkflowRunStatus, WorkflowStatus};

/// Outcome of validating a requested transition against an observed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Apply the write and append the audit row.
    Legal,
    /// Observed state already equals the requested one; absorb without a write.
    Idempotent,
    /// Reject; the caller must not retry.
    Illegal,
}

impl Transition {
    /// Collapse into a result, mapping `Illegal` to an `InvalidTransition`
    /// error for the given entity.
    pub fn into_result(
        self,
        entity: &'static str,
        id: i64,
        from: &str,
        to: &str,
    ) -> Result<Transition, JobmonError> {
        match self {
            Transition::Illegal => Err(JobmonError::InvalidTransition {
                entity,
                id,
                from: from.to_string(),
                to: to.to_string(),
            }),
            other => Ok(other),
        }
    }
}

/// Validate a task transition.
///
/// The `D|F|H -> G` resume edge is intentionally absent: resume bypasses the
/// table inside its own transaction and is the only legal regression.
pub fn validate_task(observed: TaskStatus, requested: TaskStatus) -> Transition {
    use TaskStatus::*;

    if observed == requested {
        return Transition::Idempotent;
    }

    let legal = matches!(
        (observed, requested),
        // dispatch path
        (Registering, Queued)
            | (AdjustingResources, Queued)
            | (Queued, Instantiating)
            | (Instantiating, Launched)
            | (Launched, Running)
            | (Running, Done)
            // resource exhaustion with retries remaining
            | (Launched, AdjustingResources)
            | (Running, AdjustingResources)
            // recoverable non-resource error with retries remaining
            | (Instantiating, Queued)
            | (Launched, Queued)
            | (Running, Queued)
            // attempts exhausted, or killed mid-flight
            | (Queued, ErrorFatal)
            | (Instantiating, ErrorFatal)
            | (Launched, ErrorFatal)
            | (Running, ErrorFatal)
            | (AdjustingResources, ErrorFatal)
            // workflow stop before dispatch
            | (Registering, Halted)
            | (Queued, Halted)
            | (AdjustingResources, Halted)
    );

    if legal {
        Transition::Legal
    } else {
        Transition::Illegal
    }
}

/// Validate a task-instance transition.
pub fn validate_task_instance(
    observed: TaskInstanceStatus,
    requested: TaskInstanceStatus,
) -> Transition {
    use TaskInstanceStatus::*;

    if observed == requested {
        return Transition::Idempotent;
    }

    // Kill request is legal from any non-terminal state.
    if requested == KillSelf {
        return if observed.is_terminal() {
            Transition::Illegal
        } else {
            Transition::Legal
        };
    }

    let legal = matches!(
        (observed, requested),
        (Queued, Instantiated)
            | (Instantiated, BatchSubmitted)
            | (Instantiated, Launched)
            | (Instantiated, NoDistributorId)
            | (BatchSubmitted, Launched)
            | (BatchSubmitted, Running)
            | (Launched, Running)
            // worker-reported terminals
            | (Running, Done)
            | (Running, Error)
            | (Running, ResourceError)
            | (Running, UnknownError)
            // cluster died before the worker ever reported in
            | (Launched, Error)
            | (Launched, ResourceError)
            | (Launched, UnknownError)
            | (BatchSubmitted, ResourceError)
            | (BatchSubmitted, UnknownError)
            // kill sweep confirmation
            | (KillSelf, ErrorFatal)
            // reaper on heartbeat expiry; Q and I only fall here when the
            // owning workflow run died before dispatch
            | (Queued, NoHeartbeat)
            | (Instantiated, NoHeartbeat)
            | (BatchSubmitted, NoHeartbeat)
            | (Launched, NoHeartbeat)
            | (Running, NoHeartbeat)
    );

    if legal {
        Transition::Legal
    } else {
        Transition::Illegal
    }
}

/// Validate a workflow-run transition.
pub fn validate_workflow_run(
    observed: WorkflowRunStatus,
    requested: WorkflowRunStatus,
) -> Transition {
    use WorkflowRunStatus::*;

    if observed == requested {
        return Transition::Idempotent;
    }

    // Resume signals may land on any live run.
    if matches!(requested, ColdResume | HotResume) {
        return if observed.is_terminal() {
            Transition::Illegal
        } else {
            Transition::Legal
        };
    }

    let legal = matches!(
        (observed, requested),
        (Registered, Linking)
            | (Linking, Bound)
            | (Bound, Instantiated)
            | (Instantiated, Launched)
            | (Launched, Running)
            // terminals from any bound-or-later state
            | (Bound, Done)
            | (Instantiated, Done)
            | (Launched, Done)
            | (Running, Done)
            | (Bound, Error)
            | (Instantiated, Error)
            | (Launched, Error)
            | (Running, Error)
            | (Bound, Stopped)
            | (Instantiated, Stopped)
            | (Launched, Stopped)
            | (Running, Stopped)
            | (Bound, Terminated)
            | (Instantiated, Terminated)
            | (Launched, Terminated)
            | (Running, Terminated)
            // resume takeover / reaper on a run already flagged for resume
            | (ColdResume, Terminated)
            | (HotResume, Terminated)
            | (HotResume, Done)
            | (HotResume, Error)
            // never got off the ground
            | (Registered, Aborted)
            | (Linking, Aborted)
            | (Bound, Aborted)
    );

    if legal {
        Transition::Legal
    } else {
        Transition::Illegal
    }
}

/// Validate a workflow transition. Workflows shadow the progress of their
/// live run; the `D|F|H -> G` resume edge bypasses the table like it does
/// for tasks.
pub fn validate_workflow(observed: WorkflowStatus, requested: WorkflowStatus) -> Transition {
    use WorkflowStatus::*;

    if observed == requested {
        return Transition::Idempotent;
    }

    let legal = matches!(
        (observed, requested),
        (Registering, Queued)
            | (Queued, Instantiating)
            | (Instantiating, Launched)
            | (Launched, Running)
            // a later run may re-enter the dispatch path after resume reset
            | (Running, Queued)
            // terminals
            | (Queued, Done)
            | (Instantiating, Done)
            | (Launched, Done)
            | (Running, Done)
            | (Queued, Failed)
            | (Instantiating, Failed)
            | (Launched, Failed)
            | (Running, Failed)
            | (Queued, Halted)
            | (Instantiating, Halted)
            | (Launched, Halted)
            | (Running, Halted)
            | (Registering, Aborted)
            | (Queued, Aborted)
    );

    if legal {
        Transition::Legal
    } else {
        Transition::Illegal
    }
}

/// The aggregation rule: what a parent task becomes when one of its
/// instances reaches a terminal state.
///
/// Callers must hold the task row lock before the instance's own status is
/// written; this function only decides, it never writes.
pub fn task_status_on_instance_end(
    instance_status: TaskInstanceStatus,
    retries_remaining: bool,
) -> Option<TaskStatus> {
    use TaskInstanceStatus::*;

    match instance_status {
        Done => Some(TaskStatus::Done),
        ResourceError if retries_remaining => Some(TaskStatus::AdjustingResources),
        Error | UnknownError | NoHeartbeat | NoDistributorId if retries_remaining => {
            Some(TaskStatus::Queued)
        }
        Error | ResourceError | UnknownError | NoHeartbeat | NoDistributorId => {
            Some(TaskStatus::ErrorFatal)
        }
        // Non-terminal instance states never move the parent here; the
        // dispatch path and the kill sweep have their own bulk transitions.
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_dispatch_path_is_legal() {
        use TaskStatus::*;
        let path = [Registering, Queued, Instantiating, Launched, Running, Done];
        for pair in path.windows(2) {
            assert_eq!(
                validate_task(pair[0], pair[1]),
                Transition::Legal,
                "{:?} -> {:?}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn task_same_state_is_idempotent() {
        assert_eq!(
            validate_task(TaskStatus::Done, TaskStatus::Done),
            Transition::Idempotent
        );
        assert_eq!(
            validate_task_instance(TaskInstanceStatus::Done, TaskInstanceStatus::Done),
            Transition::Idempotent
        );
    }

    #[test]
    fn task_never_regresses_from_done() {
        use TaskStatus::*;
        for requested in [
            Registering,
            Queued,
            Instantiating,
            Launched,
            Running,
            AdjustingResources,
            ErrorFatal,
            Halted,
        ] {
            assert_eq!(validate_task(Done, requested), Transition::Illegal);
        }
    }

    #[test]
    fn terminal_instance_absorbs_nothing() {
        // Scenario: log_error then log_done returns InvalidTransition.
        assert_eq!(
            validate_task_instance(TaskInstanceStatus::Error, TaskInstanceStatus::Done),
            Transition::Illegal
        );
        assert_eq!(
            validate_task_instance(TaskInstanceStatus::ErrorFatal, TaskInstanceStatus::Done),
            Transition::Illegal
        );
    }

    #[test]
    fn kill_is_legal_from_any_non_terminal_instance_state() {
        use TaskInstanceStatus::*;
        for observed in [Queued, Instantiated, BatchSubmitted, Launched, Running] {
            assert_eq!(validate_task_instance(observed, KillSelf), Transition::Legal);
        }
        for observed in [Done, Error, ResourceError, UnknownError, ErrorFatal] {
            assert_eq!(
                validate_task_instance(observed, KillSelf),
                Transition::Illegal
            );
        }
    }

    #[test]
    fn kill_sweep_confirms_kill_self() {
        assert_eq!(
            validate_task_instance(TaskInstanceStatus::KillSelf, TaskInstanceStatus::ErrorFatal),
            Transition::Legal
        );
        // but never skips the K state
        assert_eq!(
            validate_task_instance(TaskInstanceStatus::Running, TaskInstanceStatus::ErrorFatal),
            Transition::Illegal
        );
    }

    #[test]
    fn aggregation_resource_error_adjusts_with_retries() {
        assert_eq!(
            task_status_on_instance_end(TaskInstanceStatus::ResourceError, true),
            Some(TaskStatus::AdjustingResources)
        );
        assert_eq!(
            task_status_on_instance_end(TaskInstanceStatus::ResourceError, false),
            Some(TaskStatus::ErrorFatal)
        );
    }

    #[test]
    fn aggregation_recoverable_errors_requeue_with_retries() {
        for kind in [
            TaskInstanceStatus::Error,
            TaskInstanceStatus::UnknownError,
            TaskInstanceStatus::NoHeartbeat,
            TaskInstanceStatus::NoDistributorId,
        ] {
            assert_eq!(
                task_status_on_instance_end(kind, true),
                Some(TaskStatus::Queued),
                "{:?}",
                kind
            );
            assert_eq!(
                task_status_on_instance_end(kind, false),
                Some(TaskStatus::ErrorFatal),
                "{:?}",
                kind
            );
        }
    }

    #[test]
    fn aggregation_done_wins_regardless_of_retries() {
        assert_eq!(
            task_status_on_instance_end(TaskInstanceStatus::Done, false),
            Some(TaskStatus::Done)
        );
    }

    #[test]
    fn aggregation_ignores_non_terminal_instance_states() {
        assert_eq!(
            task_status_on_instance_end(TaskInstanceStatus::Running, true),
            None
        );
        assert_eq!(
            task_status_on_instance_end(TaskInstanceStatus::KillSelf, true),
            None
        );
    }

    #[test]
    fn workflow_run_lifecycle() {
        use WorkflowRunStatus::*;
        let path = [Registered, Linking, Bound, Instantiated, Launched, Running, Done];
        for pair in path.windows(2) {
            assert_eq!(
                validate_workflow_run(pair[0], pair[1]),
                Transition::Legal,
                "{:?} -> {:?}",
                pair[0],
                pair[1]
            );
        }
        // terminal runs reject resume flags
        assert_eq!(validate_workflow_run(Done, ColdResume), Transition::Illegal);
        assert_eq!(validate_workflow_run(Running, HotResume), Transition::Legal);
    }

    #[test]
    fn illegal_transition_maps_to_error() {
        let err = validate_task(TaskStatus::Done, TaskStatus::Running)
            .into_result("task", 7, "D", "R")
            .unwrap_err();
        match err {
            JobmonError::InvalidTransition { entity, id, from, to } => {
                assert_eq!(entity, "task");
                assert_eq!(id, 7);
                assert_eq!(from, "D");
                assert_eq!(to, "R");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
