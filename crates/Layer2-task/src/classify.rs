//! Failure classification
//!
//! Decides whether a failed attempt is retried on the same agent
//! (`Transient`), handed to the next agent (`Config`) or ends the run
//! (`Fatal`). Configured rules are consulted before the built-in table:
//! exit-code rules first, then message rules in order.

use crate::container::ContainerError;
use crate::worker::{AttemptExit, WorkerError};
use caravel_foundation::{Error, ErrorClass, Result, SupervisorSettings};
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;

/// Exit code reported when an attempt failed before its container ran
pub const NO_EXIT_CODE: i64 = -1;

/// A failed attempt, as seen by the supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptFailure {
    /// Container ran and exited non-zero
    Exit(AttemptExit),

    /// Attempt failed before producing an exit code
    Error(WorkerError),
}

impl AttemptFailure {
    pub fn exit_code(&self) -> i64 {
        match self {
            AttemptFailure::Exit(exit) => exit.exit_code,
            AttemptFailure::Error(_) => NO_EXIT_CODE,
        }
    }

    /// Text that message rules are matched against
    pub fn message(&self) -> String {
        match self {
            AttemptFailure::Exit(exit) => {
                let mut text = format!("agent exited with code {}", exit.exit_code);
                for line in &exit.output {
                    text.push('\n');
                    text.push_str(line);
                }
                text
            }
            AttemptFailure::Error(e) => e.to_string(),
        }
    }
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptFailure::Exit(exit) => write!(f, "agent exited with code {}", exit.exit_code),
            AttemptFailure::Error(e) => write!(f, "{}", e),
        }
    }
}

/// Configurable failure classifier
#[derive(Debug, Clone, Default)]
pub struct ErrorClassifier {
    exit_rules: BTreeMap<i64, ErrorClass>,
    message_rules: Vec<(Regex, ErrorClass)>,
}

impl ErrorClassifier {
    /// Classifier with the built-in table only
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settings(settings: &SupervisorSettings) -> Result<Self> {
        let mut classifier = Self::new();
        for (code, class) in &settings.exit_code_rules {
            classifier = classifier.with_exit_rule(*code, *class);
        }
        for rule in &settings.message_rules {
            classifier = classifier.with_message_rule(&rule.pattern, rule.class)?;
        }
        Ok(classifier)
    }

    pub fn with_exit_rule(mut self, code: i64, class: ErrorClass) -> Self {
        self.exit_rules.insert(code, class);
        self
    }

    /// Append a message rule; earlier rules win
    pub fn with_message_rule(mut self, pattern: &str, class: ErrorClass) -> Result<Self> {
        let regex = Regex::new(pattern)
            .map_err(|e| Error::Config(format!("invalid message rule '{}': {}", pattern, e)))?;
        self.message_rules.push((regex, class));
        Ok(self)
    }

    pub fn classify(&self, failure: &AttemptFailure) -> ErrorClass {
        if let AttemptFailure::Exit(exit) = failure {
            if let Some(class) = self.exit_rules.get(&exit.exit_code) {
                return *class;
            }
        }

        if !self.message_rules.is_empty() {
            let message = failure.message();
            if let Some((_, class)) = self.message_rules.iter().find(|(re, _)| re.is_match(&message)) {
                return *class;
            }
        }

        default_class(failure)
    }
}

/// Built-in classification table
pub fn default_class(failure: &AttemptFailure) -> ErrorClass {
    match failure {
        // 126: not executable, 127: command not found
        AttemptFailure::Exit(exit) => match exit.exit_code {
            126 | 127 => ErrorClass::Config,
            _ => ErrorClass::Transient,
        },
        AttemptFailure::Error(WorkerError::Config(_)) => ErrorClass::Config,
        AttemptFailure::Error(WorkerError::Container(e)) => container_class(e),
        AttemptFailure::Error(WorkerError::Cancelled) | AttemptFailure::Error(WorkerError::Internal(_)) => {
            ErrorClass::Fatal
        }
    }
}

fn container_class(error: &ContainerError) -> ErrorClass {
    match error {
        ContainerError::InvalidMount(_) => ErrorClass::Config,
        ContainerError::Api { status, .. } if (400..500).contains(status) && *status != 409 => ErrorClass::Config,
        ContainerError::Unavailable(_)
        | ContainerError::PullFailed { .. }
        | ContainerError::NotFound(_)
        | ContainerError::Timeout(_)
        | ContainerError::Connection(_)
        | ContainerError::Api { .. } => ErrorClass::Transient,
        ContainerError::Other(_) => ErrorClass::Fatal,
    }
}
