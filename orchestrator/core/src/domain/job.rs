// Copyright (c) 2026 SecFlow Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Job aggregate
//!
//! One execution of a [`RunSpec`](crate::domain::run_spec::RunSpec) for one
//! workflow step. The job owns its platform resources until it reaches
//! `Cleaned`.
//!
//! ```text
//! Created -> Scheduled -> Running -> { Succeeded | Failed | TimedOut } -> Cleaned
//! ```
//!
//! A job that never got scheduled may fail straight from `Created`, and a
//! job may finish (or time out) before a `Running` status was ever observed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::naming;

/// DNS-1123 job name, at most 63 characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobName(String);

impl JobName {
    /// `sf-<run>-<node>-<suffix>`; the random suffix keeps retried steps of
    /// the same run from colliding.
    pub fn generate(run_id: &str, node_ref: &str) -> Self {
        let run = naming::sanitize_dns_label(run_id, 20);
        Self(naming::resource_name(
            "sf",
            &[&run, node_ref],
            &naming::random_suffix(6),
        ))
    }

    /// Wraps an existing platform name (used when reattaching from a handle).
    pub fn from_existing(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Created,
    Scheduled,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cleaned,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed | JobState::TimedOut)
    }

    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Created, Scheduled) | (Created, Failed) => true,
            (Scheduled, Running) => true,
            (Scheduled, s) | (Running, s) if s.is_terminal() => true,
            (s, Cleaned) if s.is_terminal() => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobState::Created => "created",
            JobState::Scheduled => "scheduled",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::TimedOut => "timed_out",
            JobState::Cleaned => "cleaned",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobStateError {
    #[error("Illegal job state transition for {job}: {from} -> {to}")]
    InvalidTransition {
        job: String,
        from: JobState,
        to: JobState,
    },
}

#[derive(Debug, Clone)]
pub struct Job {
    pub name: JobName,
    pub namespace: String,
    state: JobState,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(name: JobName, namespace: impl Into<String>) -> Self {
        Self {
            name,
            namespace: namespace.into(),
            state: JobState::Created,
            created_at: Utc::now(),
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn transition(&mut self, next: JobState) -> Result<(), JobStateError> {
        if !self.state.can_transition_to(next) {
            return Err(JobStateError::InvalidTransition {
                job: self.name.to_string(),
                from: self.state,
                to: next,
            });
        }
        tracing::debug!(job = %self.name, from = %self.state, to = %next, "Job state transition");
        self.state = next;
        Ok(())
    }
}

/// Status as reported by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded { exit_code: i64 },
    Failed { exit_code: Option<i64>, reason: String },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded { .. } | JobStatus::Failed { .. })
    }

    pub fn exit_code(&self) -> Option<i64> {
        match self {
            JobStatus::Succeeded { exit_code } => Some(*exit_code),
            JobStatus::Failed { exit_code, .. } => *exit_code,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::naming::MAX_LABEL_LEN;

    #[test]
    fn test_job_name_is_dns_label() {
        let name = JobName::generate(
            "Run_0123456789abcdefghijklmnop",
            "Nuclei Scanner / node #7 with a very long display name indeed",
        );
        let s = name.as_str();
        assert!(s.len() <= MAX_LABEL_LEN);
        assert!(s.starts_with("sf-run-0123456789abcdef"));
        assert!(s
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
        assert!(!s.ends_with('-'));
    }

    #[test]
    fn test_job_names_do_not_collide() {
        assert_ne!(JobName::generate("r", "n"), JobName::generate("r", "n"));
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut job = Job::new(JobName::generate("r", "n"), "default");
        job.transition(JobState::Scheduled).unwrap();
        job.transition(JobState::Running).unwrap();
        job.transition(JobState::Succeeded).unwrap();
        job.transition(JobState::Cleaned).unwrap();
        assert_eq!(job.state(), JobState::Cleaned);
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let mut job = Job::new(JobName::generate("r", "n"), "default");
        assert!(job.transition(JobState::Running).is_err());
        assert!(job.transition(JobState::Cleaned).is_err());

        job.transition(JobState::Scheduled).unwrap();
        job.transition(JobState::TimedOut).unwrap();
        assert!(job.transition(JobState::Running).is_err());
        assert!(job.transition(JobState::Succeeded).is_err());
        job.transition(JobState::Cleaned).unwrap();
        assert!(job.transition(JobState::Cleaned).is_err());
    }

    #[test]
    fn test_submit_failure_path() {
        let mut job = Job::new(JobName::generate("r", "n"), "default");
        job.transition(JobState::Failed).unwrap();
        job.transition(JobState::Cleaned).unwrap();
    }
}
