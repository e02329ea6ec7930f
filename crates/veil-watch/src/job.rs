//! One file's journey from the input directory to its terminal placement.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum JobError {
    #[error("illegal job transition {from:?} -> {to:?}")]
    IllegalTransition { from: JobState, to: JobState },
}

/// Processing state of a job. States only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobState {
    Pending,
    Detecting,
    Anonymizing,
    Done,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    fn can_advance_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Detecting)
                | (Pending, Failed)
                | (Detecting, Anonymizing)
                | (Detecting, Failed)
                | (Anonymizing, Done)
                | (Anonymizing, Failed)
        )
    }

    /// Stage a failure in this state is attributed to.
    pub fn stage(self) -> Stage {
        match self {
            Self::Pending => Stage::Intake,
            Self::Detecting => Stage::Detection,
            Self::Anonymizing | Self::Done | Self::Failed => Stage::Anonymization,
        }
    }
}

/// Pipeline stage, used to attribute failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Reading, format check and archiving of the original.
    Intake,
    Detection,
    Anonymization,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Intake => "intake",
            Self::Detection => "detection",
            Self::Anonymization => "anonymization",
        })
    }
}

/// A unit of work for one discovered input file.
#[derive(Debug, Clone)]
pub struct PipelineJob {
    pub id: Uuid,
    pub source: PathBuf,
    pub file_name: String,
    pub discovered_at: DateTime<Utc>,
    state: JobState,
}

impl PipelineJob {
    pub fn new(source: PathBuf, file_name: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            source,
            file_name,
            discovered_at: Utc::now(),
            state: JobState::Pending,
        }
    }

    pub fn for_path(source: &Path) -> Option<Self> {
        let file_name = source.file_name()?.to_str()?.to_string();
        Some(Self::new(source.to_path_buf(), file_name))
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn advance(&mut self, next: JobState) -> Result<(), JobError> {
        if !self.state.can_advance_to(next) {
            return Err(JobError::IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        tracing::trace!(job = %self.id, from = ?self.state, to = ?next, "job transition");
        self.state = next;
        Ok(())
    }
}

/// How a job ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    /// Both outputs written and the input removed.
    Done {
        faces: usize,
        detection_output: PathBuf,
        anonymization_output: PathBuf,
    },
    /// The original now lives in the error directory (when `error_path` is set).
    /// Without an error path the file could not be moved and stays in the input
    /// directory for another attempt.
    Failed {
        stage: Stage,
        reason: String,
        error_path: Option<PathBuf>,
    },
    /// Outputs from an earlier run already match this input; only the input was removed.
    AlreadyProcessed,
    /// The input could not be read right now; it is retried on a later scan.
    Deferred { reason: String },
}

impl JobOutcome {
    /// Whether the file reached a terminal placement and must not be picked up again.
    pub fn is_settled(&self) -> bool {
        match self {
            Self::Done { .. } | Self::AlreadyProcessed => true,
            Self::Failed { error_path, .. } => error_path.is_some(),
            Self::Deferred { .. } => false,
        }
    }
}

/// Result of running one job, sent back from the pipeline engine.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub id: Uuid,
    pub file_name: String,
    pub outcome: JobOutcome,
    pub elapsed: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> PipelineJob {
        PipelineJob::for_path(Path::new("/in/a.jpg")).unwrap()
    }

    #[test]
    fn test_new_job_is_pending() {
        let job = job();
        assert_eq!(job.state(), JobState::Pending);
        assert_eq!(job.file_name, "a.jpg");
        assert!(!job.state().is_terminal());
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut job = job();
        job.advance(JobState::Detecting).unwrap();
        job.advance(JobState::Anonymizing).unwrap();
        job.advance(JobState::Done).unwrap();
        assert!(job.state().is_terminal());
    }

    #[test]
    fn test_failure_from_any_active_state() {
        for path in [
            vec![],
            vec![JobState::Detecting],
            vec![JobState::Detecting, JobState::Anonymizing],
        ] {
            let mut job = job();
            for state in path {
                job.advance(state).unwrap();
            }
            job.advance(JobState::Failed).unwrap();
        }
    }

    #[test]
    fn test_no_backward_or_skipping_transitions() {
        let mut job = job();
        assert_eq!(
            job.advance(JobState::Anonymizing),
            Err(JobError::IllegalTransition { from: JobState::Pending, to: JobState::Anonymizing })
        );
        job.advance(JobState::Detecting).unwrap();
        assert!(job.advance(JobState::Pending).is_err());
        job.advance(JobState::Failed).unwrap();
        assert!(job.advance(JobState::Done).is_err());
        assert!(job.advance(JobState::Detecting).is_err());
    }

    #[test]
    fn test_stage_attribution() {
        assert_eq!(JobState::Pending.stage(), Stage::Intake);
        assert_eq!(JobState::Detecting.stage(), Stage::Detection);
        assert_eq!(JobState::Anonymizing.stage(), Stage::Anonymization);
    }

    #[test]
    fn test_outcome_settlement() {
        assert!(JobOutcome::AlreadyProcessed.is_settled());
        assert!(!JobOutcome::Deferred { reason: "locked".into() }.is_settled());
        assert!(!JobOutcome::Failed {
            stage: Stage::Detection,
            reason: "x".into(),
            error_path: None,
        }
        .is_settled());
    }

    #[test]
    fn test_outcome_serializes_with_tag() {
        let json = serde_json::to_value(JobOutcome::Failed {
            stage: Stage::Detection,
            reason: "bad".into(),
            error_path: Some(PathBuf::from("err/a.jpg")),
        })
        .unwrap();
        assert_eq!(json["outcome"], "failed");
        assert_eq!(json["stage"], "detection");
    }
}
