//! Failure classification at the worker boundary

use crate::auth::TokenError;
use crate::docs::AppendError;

/// How the worker reacts to a collaborator failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Stay RUNNING, back off, retry
    Transient,
    /// Move to PAUSED; needs intervention before resume
    Terminal,
}

/// A classified collaborator failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub class: FailureClass,
    pub message: String,
}

impl Failure {
    pub fn is_terminal(&self) -> bool {
        self.class == FailureClass::Terminal
    }
}

impl From<TokenError> for Failure {
    fn from(err: TokenError) -> Self {
        let class = if err.is_retryable() {
            FailureClass::Transient
        } else {
            FailureClass::Terminal
        };
        Self {
            class,
            message: err.to_string(),
        }
    }
}

impl From<AppendError> for Failure {
    fn from(err: AppendError) -> Self {
        let class = if err.is_retryable() {
            FailureClass::Transient
        } else {
            FailureClass::Terminal
        };
        Self {
            class,
            message: err.to_string(),
        }
    }
}
