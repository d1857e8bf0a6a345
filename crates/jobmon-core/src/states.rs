// State spaces for workflows, workflow runs, tasks and task instances.
//
// Every status is persisted as a single-letter code; the enums here are the
// only place those codes are interpreted. Transition legality lives in the
// `fsm` module, not here.

use serde::{Deserialize, Serialize};

/// Status of a workflow (the bound DAG, across all of its runs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum WorkflowStatus {
    /// Entities are being created, no run bound yet
    Registering,
    /// Tasks queued for a run
    Queued,
    /// Task instances being created
    Instantiating,
    /// Submitted to the cluster
    Launched,
    /// At least one task running
    Running,
    /// All tasks done
    Done,
    /// A task exhausted its attempts
    Failed,
    /// Stopped by an operator
    Halted,
    /// Abandoned before any run launched
    Aborted,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Registering => "G",
            WorkflowStatus::Queued => "Q",
            WorkflowStatus::Instantiating => "I",
            WorkflowStatus::Launched => "O",
            WorkflowStatus::Running => "R",
            WorkflowStatus::Done => "D",
            WorkflowStatus::Failed => "F",
            WorkflowStatus::Halted => "H",
            WorkflowStatus::Aborted => "A",
        }
    }

    /// Terminal states only leave via resume.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Done
                | WorkflowStatus::Failed
                | WorkflowStatus::Halted
                | WorkflowStatus::Aborted
        )
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "G" => Ok(WorkflowStatus::Registering),
            "Q" => Ok(WorkflowStatus::Queued),
            "I" => Ok(WorkflowStatus::Instantiating),
            "O" => Ok(WorkflowStatus::Launched),
            "R" => Ok(WorkflowStatus::Running),
            "D" => Ok(WorkflowStatus::Done),
            "F" => Ok(WorkflowStatus::Failed),
            "H" => Ok(WorkflowStatus::Halted),
            "A" => Ok(WorkflowStatus::Aborted),
            _ => Err(format!("Unknown workflow status: {}", s)),
        }
    }
}

/// Status of a single attempt to execute a workflow.
///
/// At most one run per workflow may be in a non-terminal state at a time;
/// the resume protocol is the only way to hand over from one run to the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum WorkflowRunStatus {
    /// Created, not yet linked to the distributor
    Registered,
    /// Negotiating ownership of the workflow
    Linking,
    /// Owns the workflow, tasks bound
    Bound,
    /// Task instances being created
    Instantiated,
    /// Work submitted to the cluster
    Launched,
    /// At least one task running
    Running,
    /// All tasks done
    Done,
    /// A task exhausted its attempts
    Error,
    /// Stopped cleanly by an operator
    Stopped,
    /// Terminated by the reaper or a resume takeover
    Terminated,
    /// Cold resume requested: relinquish without waiting
    ColdResume,
    /// Hot resume requested: finish in-flight work, then relinquish
    HotResume,
    /// Abandoned before binding completed
    Aborted,
}

impl WorkflowRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowRunStatus::Registered => "G",
            WorkflowRunStatus::Linking => "L",
            WorkflowRunStatus::Bound => "B",
            WorkflowRunStatus::Instantiated => "I",
            WorkflowRunStatus::Launched => "O",
            WorkflowRunStatus::Running => "R",
            WorkflowRunStatus::Done => "D",
            WorkflowRunStatus::Error => "E",
            WorkflowRunStatus::Stopped => "S",
            WorkflowRunStatus::Terminated => "T",
            WorkflowRunStatus::ColdResume => "C",
            WorkflowRunStatus::HotResume => "H",
            WorkflowRunStatus::Aborted => "A",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowRunStatus::Done
                | WorkflowRunStatus::Error
                | WorkflowRunStatus::Stopped
                | WorkflowRunStatus::Terminated
                | WorkflowRunStatus::Aborted
        )
    }

    /// States in which the run still owns its workflow and must heartbeat.
    pub fn is_live(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for WorkflowRunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for WorkflowRunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "G" => Ok(WorkflowRunStatus::Registered),
            "L" => Ok(WorkflowRunStatus::Linking),
            "B" => Ok(WorkflowRunStatus::Bound),
            "I" => Ok(WorkflowRunStatus::Instantiated),
            "O" => Ok(WorkflowRunStatus::Launched),
            "R" => Ok(WorkflowRunStatus::Running),
            "D" => Ok(WorkflowRunStatus::Done),
            "E" => Ok(WorkflowRunStatus::Error),
            "S" => Ok(WorkflowRunStatus::Stopped),
            "T" => Ok(WorkflowRunStatus::Terminated),
            "C" => Ok(WorkflowRunStatus::ColdResume),
            "H" => Ok(WorkflowRunStatus::HotResume),
            "A" => Ok(WorkflowRunStatus::Aborted),
            _ => Err(format!("Unknown workflow run status: {}", s)),
        }
    }
}

/// Status of a task (the unit of retry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum TaskStatus {
    /// Bound to the workflow, not yet queued
    Registering,
    /// Queued for dispatch
    Queued,
    /// Instance creation in progress
    Instantiating,
    /// Submitted to the cluster
    Launched,
    /// An instance reported running
    Running,
    /// Resource request being adjusted before a retry
    AdjustingResources,
    /// An instance finished successfully
    Done,
    /// Attempts exhausted or killed mid-flight
    ErrorFatal,
    /// Halted by a workflow stop before dispatch
    Halted,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Registering => "G",
            TaskStatus::Queued => "Q",
            TaskStatus::Instantiating => "I",
            TaskStatus::Launched => "O",
            TaskStatus::Running => "R",
            TaskStatus::AdjustingResources => "A",
            TaskStatus::Done => "D",
            TaskStatus::ErrorFatal => "F",
            TaskStatus::Halted => "H",
        }
    }

    /// Terminal for the task's own lifecycle; only resume regresses these.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::ErrorFatal | TaskStatus::Halted
        )
    }

    /// States counted against a workflow's / array's concurrency cap.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TaskStatus::Instantiating | TaskStatus::Launched | TaskStatus::Running
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "G" => Ok(TaskStatus::Registering),
            "Q" => Ok(TaskStatus::Queued),
            "I" => Ok(TaskStatus::Instantiating),
            "O" => Ok(TaskStatus::Launched),
            "R" => Ok(TaskStatus::Running),
            "A" => Ok(TaskStatus::AdjustingResources),
            "D" => Ok(TaskStatus::Done),
            "F" => Ok(TaskStatus::ErrorFatal),
            "H" => Ok(TaskStatus::Halted),
            _ => Err(format!("Unknown task status: {}", s)),
        }
    }
}

/// Status of a task instance (one execution attempt, the unit of heartbeat
/// and cluster submission).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum TaskInstanceStatus {
    /// Created by a queue batch
    Queued,
    /// Claimed by the distributor
    Instantiated,
    /// Cluster accepted the submission, distributor id recorded
    BatchSubmitted,
    /// Launched on a node
    Launched,
    /// Worker reported running
    Running,
    /// Worker reported success
    Done,
    /// Worker reported a known error
    Error,
    /// Cluster killed it for resource exhaustion
    ResourceError,
    /// Disappeared without a result
    UnknownError,
    /// Marked for kill, awaiting the sweep
    KillSelf,
    /// Kill confirmed
    ErrorFatal,
    /// Heartbeat deadline passed
    NoHeartbeat,
    /// Submission never produced a distributor id
    NoDistributorId,
}

impl TaskInstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskInstanceStatus::Queued => "Q",
            TaskInstanceStatus::Instantiated => "I",
            TaskInstanceStatus::BatchSubmitted => "B",
            TaskInstanceStatus::Launched => "O",
            TaskInstanceStatus::Running => "R",
            TaskInstanceStatus::Done => "D",
            TaskInstanceStatus::Error => "E",
            TaskInstanceStatus::ResourceError => "Z",
            TaskInstanceStatus::UnknownError => "U",
            TaskInstanceStatus::KillSelf => "K",
            TaskInstanceStatus::ErrorFatal => "F",
            TaskInstanceStatus::NoHeartbeat => "X",
            TaskInstanceStatus::NoDistributorId => "W",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskInstanceStatus::Done
                | TaskInstanceStatus::Error
                | TaskInstanceStatus::ResourceError
                | TaskInstanceStatus::UnknownError
                | TaskInstanceStatus::ErrorFatal
                | TaskInstanceStatus::NoHeartbeat
                | TaskInstanceStatus::NoDistributorId
        )
    }

    /// Error kinds that feed the parent-task aggregation rule.
    pub fn is_recoverable_error(&self) -> bool {
        matches!(
            self,
            TaskInstanceStatus::Error
                | TaskInstanceStatus::ResourceError
                | TaskInstanceStatus::UnknownError
                | TaskInstanceStatus::NoHeartbeat
                | TaskInstanceStatus::NoDistributorId
        )
    }

    /// States the reaper polices with `report_by_date`.
    pub fn needs_heartbeat(&self) -> bool {
        matches!(
            self,
            TaskInstanceStatus::BatchSubmitted
                | TaskInstanceStatus::Launched
                | TaskInstanceStatus::Running
        )
    }
}

impl std::fmt::Display for TaskInstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskInstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Q" => Ok(TaskInstanceStatus::Queued),
            "I" => Ok(TaskInstanceStatus::Instantiated),
            "B" => Ok(TaskInstanceStatus::BatchSubmitted),
            "O" => Ok(TaskInstanceStatus::Launched),
            "R" => Ok(TaskInstanceStatus::Running),
            "D" => Ok(TaskInstanceStatus::Done),
            "E" => Ok(TaskInstanceStatus::Error),
            "Z" => Ok(TaskInstanceStatus::ResourceError),
            "U" => Ok(TaskInstanceStatus::UnknownError),
            "K" => Ok(TaskInstanceStatus::KillSelf),
            "F" => Ok(TaskInstanceStatus::ErrorFatal),
            "X" => Ok(TaskInstanceStatus::NoHeartbeat),
            "W" => Ok(TaskInstanceStatus::NoDistributorId),
            _ => Err(format!("Unknown task instance status: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn task_status_round_trips_through_codes() {
        for status in [
            TaskStatus::Registering,
            TaskStatus::Queued,
            TaskStatus::Instantiating,
            TaskStatus::Launched,
            TaskStatus::Running,
            TaskStatus::AdjustingResources,
            TaskStatus::Done,
            TaskStatus::ErrorFatal,
            TaskStatus::Halted,
        ] {
            assert_eq!(TaskStatus::from_str(status.as_str()), Ok(status));
        }
        assert!(TaskStatus::from_str("Z").is_err());
    }

    #[test]
    fn terminal_task_states() {
        assert!(TaskStatus::Done.is_terminal());
        assert!(TaskStatus::ErrorFatal.is_terminal());
        assert!(TaskStatus::Halted.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::AdjustingResources.is_terminal());
    }

    #[test]
    fn instance_error_kinds_are_terminal() {
        for code in ["E", "Z", "U", "X", "W"] {
            let status = TaskInstanceStatus::from_str(code).unwrap();
            assert!(status.is_terminal(), "{} should be terminal", code);
            assert!(status.is_recoverable_error());
        }
        // Kill-self is neither: the sweep still has to confirm it.
        assert!(!TaskInstanceStatus::KillSelf.is_terminal());
        assert!(!TaskInstanceStatus::KillSelf.is_recoverable_error());
    }

    #[test]
    fn live_run_states_need_heartbeats() {
        assert!(WorkflowRunStatus::Running.is_live());
        assert!(WorkflowRunStatus::HotResume.is_live());
        assert!(!WorkflowRunStatus::Terminated.is_live());
        assert!(!WorkflowRunStatus::Done.is_live());
    }
}
