use std::fmt;

/// Whether a failed run should be attempted again.
///
/// Every error that escapes the pipeline executor carries a classification;
/// the worker's retry decision switches on it and nothing else.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorClass {
    Retryable,
    Terminal,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::Retryable => f.write_str("retryable"),
            ErrorClass::Terminal => f.write_str("terminal"),
        }
    }
}

/// A classified run failure, annotated with the step it came from.
///
/// The `Display` form (`<classification>: <message>`) is what lands in
/// `task_run.error` and is surfaced verbatim on run reads.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{class}: {message}")]
pub struct RunError {
    pub class: ErrorClass,
    pub message: String,
    pub step_id: Option<String>,
    pub step_index: Option<usize>,
}

impl RunError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Retryable,
            message: message.into(),
            step_id: None,
            step_index: None,
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Terminal,
            message: message.into(),
            step_id: None,
            step_index: None,
        }
    }

    pub fn at_step(mut self, id: &str, index: usize) -> Self {
        self.message = format!("step {id:?} (index {index}): {}", self.message);
        self.step_id = Some(id.to_string());
        self.step_index = Some(index);
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.class == ErrorClass::Retryable
    }
}
