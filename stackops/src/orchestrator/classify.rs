//! Turning failures into something the operator can act on.

use std::fmt::Display;

use stackops_core::stack_api::{RemoteError, RemoteErrorKind, StackLifecycleState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Running the same deploy again may succeed.
    Retryable,
    Terminal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recommendation {
    Retry,
    RollbackAndRetry,
    FixConfiguration,
    ContactSupport,
}

impl Display for Recommendation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Recommendation::Retry => "retry the deploy",
            Recommendation::RollbackAndRetry => {
                "roll the stack back (or redeploy with --force), then retry"
            }
            Recommendation::FixConfiguration => "fix the configuration, then redeploy",
            Recommendation::ContactSupport => "contact support",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub class: FailureClass,
    pub recommendation: Recommendation,
}

impl Classification {
    const fn new(class: FailureClass, recommendation: Recommendation) -> Self {
        Classification {
            class,
            recommendation,
        }
    }
}

/// Reasons that mean a resource was still settling or the service pushed
/// back, not that the configuration is wrong.
const SETTLING_MARKERS: &[&str] = &[
    "in progress",
    "_in_progress",
    "still stabilizing",
    "not stabilized",
    "rate exceeded",
    "throttling",
    "try again",
];

const INTERNAL_MARKERS: &[&str] = &["internal failure", "internal error"];

fn mentions(reason: &str, markers: &[&str]) -> bool {
    let reason = reason.to_lowercase();
    markers.iter().any(|m| reason.contains(m))
}

/// Classify a stack that ended in `state` for `reason`.
pub fn classify_execution(state: StackLifecycleState, reason: &str) -> Classification {
    use FailureClass::*;
    use Recommendation::*;
    if mentions(reason, INTERNAL_MARKERS) {
        return Classification::new(Terminal, ContactSupport);
    }
    match state {
        // Rolled back stacks are back on the old template.
        StackLifecycleState::RolledBack if mentions(reason, SETTLING_MARKERS) => {
            Classification::new(Retryable, Retry)
        }
        StackLifecycleState::RolledBack => Classification::new(Terminal, FixConfiguration),
        // Failed stacks are stuck half way; a plain retry will be refused.
        _ => Classification::new(Terminal, RollbackAndRetry),
    }
}

/// Classify a change set that the service refused to compute.
pub fn classify_change_set(reason: &str) -> Classification {
    if mentions(reason, INTERNAL_MARKERS) {
        Classification::new(FailureClass::Terminal, Recommendation::ContactSupport)
    } else if mentions(reason, SETTLING_MARKERS) {
        Classification::new(FailureClass::Retryable, Recommendation::Retry)
    } else {
        Classification::new(FailureClass::Terminal, Recommendation::FixConfiguration)
    }
}

pub fn classify_remote(error: &RemoteError) -> Classification {
    use FailureClass::*;
    use Recommendation::*;
    match error.kind {
        RemoteErrorKind::Transient | RemoteErrorKind::Throttled => {
            Classification::new(Retryable, Retry)
        }
        // Someone else's operation on the stack; wait for it.
        RemoteErrorKind::Conflict => Classification::new(Retryable, Retry),
        RemoteErrorKind::Validation | RemoteErrorKind::NotFound => {
            Classification::new(Terminal, FixConfiguration)
        }
        RemoteErrorKind::Internal => Classification::new(Terminal, ContactSupport),
    }
}
