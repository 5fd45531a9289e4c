//! Job state machine - pure transition rules
//!
//! The engine performs the runtime call for a job's current stage, reduces
//! what it saw to an [`Outcome`], and asks [`transition`] for the next status.
//! Nothing here touches the container runtime or the filesystem.

use thiserror::Error;

use super::models::ComputeJobStatus;

/// Result of running the effectful step for the current stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Stage still in progress
    Wait,
    /// Stage completed
    Advance,
    Fail(Failure),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    PullImage,
    VolumeCreation,
    ContainerCreation,
    DataProvisioning,
    AlgorithmProvisioning,
    DataUpload,
    Algorithm,
    ResultsFetch,
}

impl Failure {
    pub fn status(self) -> ComputeJobStatus {
        match self {
            Failure::PullImage => ComputeJobStatus::PullImageFailed,
            Failure::VolumeCreation => ComputeJobStatus::VolumeCreationFailed,
            Failure::ContainerCreation => ComputeJobStatus::ContainerCreationFailed,
            Failure::DataProvisioning => ComputeJobStatus::DataProvisioningFailed,
            Failure::AlgorithmProvisioning => ComputeJobStatus::AlgorithmProvisioningFailed,
            Failure::DataUpload => ComputeJobStatus::DataUploadFailed,
            Failure::Algorithm => ComputeJobStatus::AlgorithmFailed,
            Failure::ResultsFetch => ComputeJobStatus::ResultsFetchFailed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("job is already in terminal status {0:?}")]
    Terminal(ComputeJobStatus),
    #[error("{failure:?} cannot happen while in {from:?}")]
    UnexpectedFailure {
        from: ComputeJobStatus,
        failure: Failure,
    },
}

/// Next status on the happy path.
pub fn successor(status: ComputeJobStatus) -> Option<ComputeJobStatus> {
    use ComputeJobStatus::*;
    match status {
        JobStarted => Some(PullImage),
        PullImage => Some(ConfiguringVolumes),
        ConfiguringVolumes => Some(Provisioning),
        Provisioning => Some(RunningAlgorithm),
        RunningAlgorithm => Some(PublishingResults),
        PublishingResults => Some(JobFinished),
        _ => None,
    }
}

/// Failures the effectful step of `status` can produce.
pub fn stage_failures(status: ComputeJobStatus) -> &'static [Failure] {
    use ComputeJobStatus::*;
    match status {
        PullImage => &[Failure::PullImage],
        ConfiguringVolumes => &[Failure::VolumeCreation, Failure::ContainerCreation],
        Provisioning => &[
            Failure::AlgorithmProvisioning,
            Failure::DataProvisioning,
            Failure::DataUpload,
        ],
        RunningAlgorithm => &[Failure::Algorithm],
        PublishingResults => &[Failure::ResultsFetch],
        _ => &[],
    }
}

pub fn transition(current: ComputeJobStatus, outcome: Outcome) -> Result<ComputeJobStatus, TransitionError> {
    if current.is_terminal() {
        return Err(TransitionError::Terminal(current));
    }
    match outcome {
        Outcome::Wait => Ok(current),
        Outcome::Advance => Ok(successor(current).unwrap_or(current)),
        Outcome::Fail(failure) if stage_failures(current).contains(&failure) => Ok(failure.status()),
        Outcome::Fail(failure) => Err(TransitionError::UnexpectedFailure { from: current, failure }),
    }
}

/// Whether `from -> to` is a move the state machine can make.
pub fn is_valid_transition(from: ComputeJobStatus, to: ComputeJobStatus) -> bool {
    if from == to {
        return true;
    }
    if from.is_terminal() {
        return false;
    }
    successor(from) == Some(to) || stage_failures(from).iter().any(|f| f.status() == to)
}

//=============================================================================
// RUNNING STAGE
//=============================================================================

/// What the engine saw of a job's container while `RunningAlgorithm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunningObservation {
    /// The engine already started the container
    pub started: bool,
    pub container_running: bool,
    pub expired: bool,
    pub stop_requested: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunningAction {
    Start,
    /// Stop the container, then collect results
    StopAndPublish,
    /// Container exited on its own
    Publish,
    Wait,
}

pub fn running_action(obs: RunningObservation) -> RunningAction {
    if obs.stop_requested || (obs.started && obs.expired) {
        return if obs.container_running {
            RunningAction::StopAndPublish
        } else {
            RunningAction::Publish
        };
    }
    match (obs.started, obs.container_running) {
        (false, false) => RunningAction::Start,
        (true, false) => RunningAction::Publish,
        _ => RunningAction::Wait,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ComputeJobStatus::*;

    #[test]
    fn test_happy_path() {
        let mut status = JobStarted;
        let mut seen = vec![status];
        while !status.is_terminal() {
            status = transition(status, Outcome::Advance).unwrap();
            seen.push(status);
        }
        assert_eq!(
            seen,
            vec![
                JobStarted,
                PullImage,
                ConfiguringVolumes,
                Provisioning,
                RunningAlgorithm,
                PublishingResults,
                JobFinished
            ]
        );
    }

    #[test]
    fn test_failures_absorb() {
        let failed = transition(Provisioning, Outcome::Fail(Failure::DataUpload)).unwrap();
        assert_eq!(failed, DataUploadFailed);
        assert_eq!(transition(failed, Outcome::Advance), Err(TransitionError::Terminal(failed)));
        assert!(transition(PullImage, Outcome::Fail(Failure::DataUpload)).is_err());
    }

    #[test]
    fn test_never_moves_backwards() {
        let outcomes = [
            Outcome::Wait,
            Outcome::Advance,
            Outcome::Fail(Failure::PullImage),
            Outcome::Fail(Failure::VolumeCreation),
            Outcome::Fail(Failure::ContainerCreation),
            Outcome::Fail(Failure::DataProvisioning),
            Outcome::Fail(Failure::AlgorithmProvisioning),
            Outcome::Fail(Failure::DataUpload),
            Outcome::Fail(Failure::Algorithm),
            Outcome::Fail(Failure::ResultsFetch),
        ];
        for from in ComputeJobStatus::ALL {
            for outcome in outcomes {
                if let Ok(to) = transition(from, outcome) {
                    assert!(to >= from, "{:?} -> {:?}", from, to);
                    assert!(is_valid_transition(from, to));
                }
            }
        }
        assert!(!is_valid_transition(RunningAlgorithm, Provisioning));
        assert!(!is_valid_transition(JobFinished, PublishingResults));
    }

    #[test]
    fn test_running_actions() {
        let obs = |started, container_running, expired, stop_requested| RunningObservation {
            started,
            container_running,
            expired,
            stop_requested,
        };
        assert_eq!(running_action(obs(false, false, false, false)), RunningAction::Start);
        assert_eq!(running_action(obs(true, true, false, false)), RunningAction::Wait);
        assert_eq!(running_action(obs(true, false, false, false)), RunningAction::Publish);
        assert_eq!(running_action(obs(true, true, true, false)), RunningAction::StopAndPublish);
        assert_eq!(running_action(obs(true, true, false, true)), RunningAction::StopAndPublish);
        assert_eq!(running_action(obs(false, false, false, true)), RunningAction::Publish);
    }
}
