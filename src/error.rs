// Copyright (c) 2024-present, vinyl-scheduler
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::sync::Arc;

/// Represents errors that can occur in the write scheduler
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// A run file is malformed or its checksum does not match
    Corrupted(&'static str),

    /// The task was cancelled (shutdown, or a failed deferred DELETE batch)
    Cancelled,

    /// Deterministic fault inserted by the error-injection harness
    Injected(&'static str),

    /// The scheduler is backing off after a failed task; carries the error
    /// that caused the back-off
    Throttled(Arc<Error>),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "SchedulerError: io: {e}"),
            Self::Corrupted(msg) => write!(f, "SchedulerError: corrupted run: {msg}"),
            Self::Cancelled => write!(f, "SchedulerError: cancelled"),
            Self::Injected(what) => write!(f, "SchedulerError: error injection: {what}"),
            Self::Throttled(e) => write!(f, "SchedulerError: scheduler is throttled: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Throttled(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// Scheduler result
pub type Result<T> = std::result::Result<T, Error>;
