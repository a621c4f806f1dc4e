// src/runs/record.rs

//! Run records and the per-attempt state machine.
//!
//! ```text
//! queued -> running -> succeeded
//!    |         |
//!    +---------+-----> failed
//! ```
//!
//! `queued -> failed` only happens through [`RunRecord::fail`] (a dispatcher
//! error before the process started). Terminal records never change again.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{Result, TrackerError};
use crate::types::{PipelineKey, UnitId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an attempt ended up `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The process exited non-zero.
    Exit,
    /// Left `running` longer than the staleness threshold.
    Stale,
    /// The dispatcher reported an error.
    Error,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Exit => write!(f, "exit"),
            FailureReason::Stale => write!(f, "stale"),
            FailureReason::Error => write!(f, "error"),
        }
    }
}

/// Identifies one attempt.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RunKey {
    pub unit: UnitId,
    pub pipeline: PipelineKey,
    pub attempt: u32,
}

impl RunKey {
    pub fn new(unit: UnitId, pipeline: PipelineKey, attempt: u32) -> Self {
        Self {
            unit,
            pipeline,
            attempt,
        }
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} #{}", self.unit, self.pipeline, self.attempt)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub unit: UnitId,
    pub pipeline: PipelineKey,
    pub attempt: u32,
    pub status: RunStatus,
    /// Fingerprint of the invocation this attempt runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    pub queued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl RunRecord {
    pub fn queued(key: RunKey, fingerprint: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            unit: key.unit,
            pipeline: key.pipeline,
            attempt: key.attempt,
            status: RunStatus::Queued,
            fingerprint,
            queued_at: now,
            started_at: None,
            finished_at: None,
            exit_code: None,
            failure: None,
            message: None,
        }
    }

    pub fn key(&self) -> RunKey {
        RunKey::new(self.unit.clone(), self.pipeline.clone(), self.attempt)
    }

    fn transition_error(&self, to: RunStatus) -> TrackerError {
        TrackerError::InvalidTransition {
            key: self.key().to_string(),
            from: self.status.to_string(),
            to: to.to_string(),
        }
    }

    /// queued -> running
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status != RunStatus::Queued {
            return Err(self.transition_error(RunStatus::Running));
        }
        self.status = RunStatus::Running;
        self.started_at = Some(now);
        Ok(())
    }

    /// running -> succeeded (exit 0) or failed with reason `exit`.
    pub fn complete(&mut self, exit_code: i32, now: DateTime<Utc>) -> Result<()> {
        let to = if exit_code == 0 {
            RunStatus::Succeeded
        } else {
            RunStatus::Failed
        };
        if self.status != RunStatus::Running {
            return Err(self.transition_error(to));
        }
        self.status = to;
        self.finished_at = Some(now);
        self.exit_code = Some(exit_code);
        if to == RunStatus::Failed {
            self.failure = Some(FailureReason::Exit);
        }
        Ok(())
    }

    /// queued|running -> failed.
    pub fn fail(
        &mut self,
        reason: FailureReason,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if self.status.is_terminal() {
            return Err(self.transition_error(RunStatus::Failed));
        }
        self.status = RunStatus::Failed;
        self.finished_at = Some(now);
        self.failure = Some(reason);
        self.message = Some(message.into());
        Ok(())
    }
}
