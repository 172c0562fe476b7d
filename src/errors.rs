// src/errors.rs

//! Crate-wide job error surface.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::job::StepInstanceMeta;
use crate::task::TaskError;

/// Stable classification of a [`JobError`], independent of its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobErrorCode {
    StepFailed,
    PrecedentStepFailure,
    JobSealed,
    DuplicateStep,
    StepNotFound,
    JobCanceled,
}

impl fmt::Display for JobErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobErrorCode::StepFailed => "StepFailed",
            JobErrorCode::PrecedentStepFailure => "PrecedentStepFailure",
            JobErrorCode::JobSealed => "JobSealed",
            JobErrorCode::DuplicateStep => "DuplicateStep",
            JobErrorCode::StepNotFound => "StepNotFound",
            JobErrorCode::JobCanceled => "JobCanceled",
        };
        f.write_str(name)
    }
}

/// Error returned by the step builders and by [`JobInstance::wait`].
///
/// Runtime variants carry a handle to the affected step instance and the
/// underlying [`TaskError`]; [`JobError::user_error`] unwraps the chain down
/// to the original user error for downcasting.
///
/// [`JobInstance::wait`]: crate::job::JobInstance::wait
#[derive(Error, Debug, Clone)]
pub enum JobError {
    #[error("duplicate step [{0}] in job definition")]
    DuplicateStep(String),

    #[error("step [{0}] not found in job definition")]
    StepNotFound(String),

    #[error("job definition [{0}] is sealed; no steps can be added")]
    JobSealed(String),

    #[error("step [{}] failed: {cause}", .step.name())]
    StepFailed {
        step: Arc<dyn StepInstanceMeta>,
        cause: TaskError,
    },

    #[error("step [{}] skipped: {cause}", .step.name())]
    PrecedentStepFailure {
        step: Arc<dyn StepInstanceMeta>,
        cause: TaskError,
    },

    #[error("job canceled while step [{}] was in flight", .step.name())]
    JobCanceled { step: Arc<dyn StepInstanceMeta> },
}

impl JobError {
    pub fn code(&self) -> JobErrorCode {
        match self {
            JobError::DuplicateStep(_) => JobErrorCode::DuplicateStep,
            JobError::StepNotFound(_) => JobErrorCode::StepNotFound,
            JobError::JobSealed(_) => JobErrorCode::JobSealed,
            JobError::StepFailed { .. } => JobErrorCode::StepFailed,
            JobError::PrecedentStepFailure { .. } => JobErrorCode::PrecedentStepFailure,
            JobError::JobCanceled { .. } => JobErrorCode::JobCanceled,
        }
    }

    /// The step instance this error is attributed to, for runtime errors.
    pub fn step_instance(&self) -> Option<&Arc<dyn StepInstanceMeta>> {
        match self {
            JobError::StepFailed { step, .. }
            | JobError::PrecedentStepFailure { step, .. }
            | JobError::JobCanceled { step } => Some(step),
            _ => None,
        }
    }

    /// The underlying task error, for runtime errors.
    pub fn cause(&self) -> Option<&TaskError> {
        match self {
            JobError::StepFailed { cause, .. } | JobError::PrecedentStepFailure { cause, .. } => {
                Some(cause)
            }
            _ => None,
        }
    }

    /// The original user error at the bottom of the chain, if any.
    pub fn user_error(&self) -> Option<&anyhow::Error> {
        self.cause().and_then(TaskError::user_error)
    }

    /// Attribute a task error to a step instance.
    pub(crate) fn from_task_error(step: Arc<dyn StepInstanceMeta>, err: TaskError) -> Self {
        match err {
            TaskError::Canceled => JobError::JobCanceled { step },
            err @ TaskError::PrecedentFailure(_) => {
                JobError::PrecedentStepFailure { step, cause: err }
            }
            err => JobError::StepFailed { step, cause: err },
        }
    }
}
