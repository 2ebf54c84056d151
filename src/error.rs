use std::time::Duration;

use crate::queue::Task;

/// Episode error messages are capped at this many characters in the store.
pub const ERROR_MESSAGE_MAX_CHARS: usize = 500;

/// How a queue task invocation ended when it did not succeed. The worker
/// honors `Retry` only while the task's per-task retry limit has headroom;
/// after that the job is dropped (the handler has already persisted whatever
/// failure state the episode should show).
#[derive(Debug)]
pub enum TaskError {
    Retry {
        countdown: Duration,
        /// Payload for the next attempt. `None` re-runs the same payload;
        /// enrichment substitutes one carrying the advanced start index.
        replacement: Option<Task>,
        reason: String,
    },
    Fatal(anyhow::Error),
}

pub type TaskResult = Result<(), TaskError>;

impl TaskError {
    pub fn retry_in(seconds: u64, reason: impl Into<String>) -> Self {
        Self::Retry {
            countdown: Duration::from_secs(seconds),
            replacement: None,
            reason: reason.into(),
        }
    }

    pub fn retry_with(countdown: Duration, replacement: Task, reason: impl Into<String>) -> Self {
        Self::Retry {
            countdown,
            replacement: Some(replacement),
            reason: reason.into(),
        }
    }

    pub fn fatal(err: impl Into<anyhow::Error>) -> Self {
        Self::Fatal(err.into())
    }
}

impl From<rusqlite::Error> for TaskError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Fatal(err.into())
    }
}

pub fn clip_error_message(message: &str) -> String {
    message.chars().take(ERROR_MESSAGE_MAX_CHARS).collect()
}
