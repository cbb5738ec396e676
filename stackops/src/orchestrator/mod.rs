//! Drives one deployment request to a terminal stack state.
//!
//! A deploy goes through three phases:
//!
//! 1. artifact uploads, run concurrently,
//! 2. change computation; an empty change set ends the deploy successfully,
//! 3. execution, polled until the stack settles.
//!
//! Only one deploy per stack runs at a time within this process.

pub mod classify;
#[cfg(test)]
pub(crate) mod fake;
pub mod retry;
pub mod upload;

use std::{collections::HashMap, sync::Arc, time::Duration};

use stackops_core::stack_api::{
    ChangeSetId, ChangeSetRequest, ChangeSetStatus, DeploymentRequest, RemoteError,
    RemoteErrorKind, StackLifecycleState, StackName, StackService, StackStatus,
};
use tokio::{sync::Mutex, time::Instant};
use tracing::Instrument as _;

use crate::{interrupt::InterruptState, manifest::DeploySettings};
use classify::{
    classify_change_set, classify_execution, classify_remote, FailureClass, Recommendation,
};
use retry::{with_backoff, RetryPolicy};
use upload::UploadStep;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorSettings {
    pub retry: RetryPolicy,
    pub poll_interval: Duration,
    /// Covers all polling of one deploy.
    pub timeout: Duration,
}

impl From<&DeploySettings> for OrchestratorSettings {
    fn from(settings: &DeploySettings) -> Self {
        OrchestratorSettings {
            retry: settings.retry_policy(),
            poll_interval: settings.poll_interval(),
            timeout: settings.timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployOutcome {
    /// The stack already matches; nothing was executed.
    NoChanges { stack: StackName },
    Deployed {
        stack: StackName,
        change_set: ChangeSetId,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("upload {step} failed")]
    Upload {
        step: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("{operation} on stack {stack} failed; recommendation: {recommendation}")]
    Remote {
        stack: StackName,
        operation: &'static str,
        #[source]
        source: RemoteError,
        class: FailureClass,
        recommendation: Recommendation,
    },
    #[error("change set {change_set} for stack {stack} failed: {reason}; recommendation: {recommendation}")]
    ChangeSetFailed {
        stack: StackName,
        change_set: ChangeSetId,
        reason: String,
        class: FailureClass,
        recommendation: Recommendation,
    },
    #[error("stack {stack} ended in {state}: {reason}; recommendation: {recommendation}")]
    ExecutionFailed {
        stack: StackName,
        state: StackLifecycleState,
        reason: String,
        class: FailureClass,
        recommendation: Recommendation,
    },
    #[error("stack {stack} did not settle within {waited:?}; check the stack state before deploying again")]
    Timeout { stack: StackName, waited: Duration },
    #[error("deploy interrupted")]
    Interrupted,
    #[error("stack {stack}: unexpected transition from {from} to {to}")]
    InvalidTransition {
        stack: StackName,
        from: StackLifecycleState,
        to: StackLifecycleState,
    },
}

impl DeployError {
    pub fn recommendation(&self) -> Option<Recommendation> {
        match self {
            DeployError::Remote { recommendation, .. }
            | DeployError::ChangeSetFailed { recommendation, .. }
            | DeployError::ExecutionFailed { recommendation, .. } => Some(*recommendation),
            _ => None,
        }
    }

    pub fn class(&self) -> Option<FailureClass> {
        match self {
            DeployError::Remote { class, .. }
            | DeployError::ChangeSetFailed { class, .. }
            | DeployError::ExecutionFailed { class, .. } => Some(*class),
            _ => None,
        }
    }

    fn remote(stack: &StackName, operation: &'static str, source: RemoteError) -> Self {
        let classification = classify_remote(&source);
        DeployError::Remote {
            stack: stack.clone(),
            operation,
            source,
            class: classification.class,
            recommendation: classification.recommendation,
        }
    }
}

impl From<upload::UploadFailure> for DeployError {
    fn from(failure: upload::UploadFailure) -> Self {
        DeployError::Upload {
            step: failure.step,
            source: failure.error,
        }
    }
}

/// A change set the service has finished computing.
#[derive(Debug)]
enum SettledChangeSet {
    Empty,
    Ready { changes: Vec<String> },
    Failed { reason: String },
}

impl SettledChangeSet {
    fn from_status(status: ChangeSetStatus) -> Option<Self> {
        match status {
            ChangeSetStatus::Pending => None,
            ChangeSetStatus::Empty => Some(SettledChangeSet::Empty),
            ChangeSetStatus::Ready { changes } => Some(SettledChangeSet::Ready { changes }),
            ChangeSetStatus::Failed { reason } => Some(SettledChangeSet::Failed { reason }),
        }
    }
}

/// A stack that is no longer being changed.
#[derive(Debug)]
enum SettledStack {
    Complete,
    Failed { reason: String },
    RolledBack { reason: String },
    NotFound,
}

impl SettledStack {
    fn from_status(status: StackStatus) -> Option<Self> {
        match status {
            StackStatus::InProgress => None,
            StackStatus::Complete => Some(SettledStack::Complete),
            StackStatus::Failed { reason } => Some(SettledStack::Failed { reason }),
            StackStatus::RolledBack { reason } => Some(SettledStack::RolledBack { reason }),
            StackStatus::NotFound => Some(SettledStack::NotFound),
        }
    }
}

/// The lifecycle of one deploy, checked on every step.
struct Lifecycle<'a> {
    stack: &'a StackName,
    state: StackLifecycleState,
}

impl<'a> Lifecycle<'a> {
    fn new(stack: &'a StackName) -> Self {
        Lifecycle {
            stack,
            state: StackLifecycleState::None,
        }
    }

    fn advance(&mut self, next: StackLifecycleState) -> Result<(), DeployError> {
        if !self.state.can_transition_to(next) {
            return Err(DeployError::InvalidTransition {
                stack: self.stack.clone(),
                from: self.state,
                to: next,
            });
        }
        tracing::info!(from = %self.state, to = %next, "stack state");
        self.state = next;
        Ok(())
    }
}

pub struct Orchestrator {
    service: Arc<dyn StackService>,
    settings: OrchestratorSettings,
    interrupt: InterruptState,
    locks: Mutex<HashMap<StackName, Arc<Mutex<()>>>>,
}

impl Orchestrator {
    pub fn new(
        service: Arc<dyn StackService>,
        settings: OrchestratorSettings,
        interrupt: InterruptState,
    ) -> Self {
        Orchestrator {
            service,
            settings,
            interrupt,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn service(&self) -> &Arc<dyn StackService> {
        &self.service
    }

    pub async fn deploy(
        &self,
        request: &DeploymentRequest,
        uploads: Vec<Arc<dyn UploadStep>>,
    ) -> Result<DeployOutcome, DeployError> {
        let span = tracing::info_span!("deploy", stack = %request.stack_name);
        let result = self.deploy_impl(request, uploads).instrument(span).await;
        if let Err(e) = &result {
            if let (Some(class), Some(recommendation)) = (e.class(), e.recommendation()) {
                tracing::warn!(stack = %request.stack_name, ?class, %recommendation, "deploy failed");
            }
        }
        result
    }

    async fn deploy_impl(
        &self,
        request: &DeploymentRequest,
        uploads: Vec<Arc<dyn UploadStep>>,
    ) -> Result<DeployOutcome, DeployError> {
        let stack = &request.stack_name;
        let mut lifecycle = Lifecycle::new(stack);

        self.check_interrupted()?;
        if !uploads.is_empty() {
            upload::run_all(uploads, self.interrupt.token().child_token())
                .await
                .map_err(|failure| {
                    if failure.was_cancelled() && self.interrupt.is_interrupted() {
                        DeployError::Interrupted
                    } else {
                        failure.into()
                    }
                })?;
        }
        self.check_interrupted()?;

        let lock = self.stack_lock(stack).await;
        let _guard = lock.lock().await;

        let change_set = ChangeSetId::generate();
        let change_set_request = ChangeSetRequest::for_deployment(request, change_set.clone());
        lifecycle.advance(StackLifecycleState::ChangeSetPending)?;
        self.create_change_set(&change_set_request).await?;
        let deadline = Instant::now() + self.settings.timeout;

        match self.wait_for_change_set(stack, &change_set, deadline).await? {
            SettledChangeSet::Empty => {
                lifecycle.advance(StackLifecycleState::ChangeSetEmpty)?;
                tracing::info!("no changes");
                return Ok(DeployOutcome::NoChanges {
                    stack: stack.clone(),
                });
            }
            SettledChangeSet::Ready { changes } => {
                lifecycle.advance(StackLifecycleState::ChangeSetReady)?;
                tracing::info!(changes = changes.len(), "change set ready");
                for change in &changes {
                    tracing::debug!(path = %change, "change");
                }
            }
            SettledChangeSet::Failed { reason } => {
                lifecycle.advance(StackLifecycleState::Failed)?;
                let classification = classify_change_set(&reason);
                return Err(DeployError::ChangeSetFailed {
                    stack: stack.clone(),
                    change_set,
                    reason,
                    class: classification.class,
                    recommendation: classification.recommendation,
                });
            }
        }

        self.check_interrupted()?;
        lifecycle.advance(StackLifecycleState::Executing)?;
        // Not idempotent, so never retried.
        self.service
            .execute_change_set(stack, &change_set, request.flags)
            .await
            .map_err(|e| DeployError::remote(stack, "executeChangeSet", e))?;

        let (state, reason) = match self.wait_for_stack(stack, deadline).await? {
            SettledStack::Complete => {
                lifecycle.advance(StackLifecycleState::Complete)?;
                return Ok(DeployOutcome::Deployed {
                    stack: stack.clone(),
                    change_set,
                });
            }
            SettledStack::Failed { reason } => (StackLifecycleState::Failed, reason),
            SettledStack::RolledBack { reason } => (StackLifecycleState::RolledBack, reason),
            SettledStack::NotFound => (
                StackLifecycleState::Failed,
                "the stack disappeared during execution".to_string(),
            ),
        };
        lifecycle.advance(state)?;
        let classification = classify_execution(state, &reason);
        Err(DeployError::ExecutionFailed {
            stack: stack.clone(),
            state,
            reason,
            class: classification.class,
            recommendation: classification.recommendation,
        })
    }

    fn check_interrupted(&self) -> Result<(), DeployError> {
        self.interrupt
            .check_interrupted_raw()
            .map_err(|_| DeployError::Interrupted)
    }

    async fn stack_lock(&self, stack: &StackName) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(stack.clone()).or_default().clone()
    }

    /// Create the change set, retrying transient failures only while the
    /// service has no record of it.
    async fn create_change_set(&self, request: &ChangeSetRequest) -> Result<(), DeployError> {
        let service = &self.service;
        let stack = &request.stack_name;
        let id = &request.change_set_id;
        with_backoff(&self.settings.retry, "createChangeSet", move || async move {
            match service.create_change_set(request).await {
                Err(e) if e.is_transient() => match service.describe_change_set(stack, id).await {
                    Ok(_) => {
                        tracing::debug!(change_set = %id, "change set was created despite {}", e);
                        Ok(())
                    }
                    Err(lookup) if lookup.kind == RemoteErrorKind::NotFound => Err(e),
                    Err(lookup) => Err(RemoteError::new(
                        RemoteErrorKind::Conflict,
                        format!(
                            "{}; could not tell whether change set {} exists: {}",
                            e.message, id, lookup
                        ),
                    )),
                },
                other => other,
            }
        })
        .await
        .map_err(|e| DeployError::remote(stack, "createChangeSet", e))
    }

    async fn wait_for_change_set(
        &self,
        stack: &StackName,
        id: &ChangeSetId,
        deadline: Instant,
    ) -> Result<SettledChangeSet, DeployError> {
        let service = &self.service;
        self.poll(stack, deadline, "describeChangeSet", move || async move {
            let status = service.describe_change_set(stack, id).await?;
            Ok(SettledChangeSet::from_status(status))
        })
        .await
    }

    async fn wait_for_stack(
        &self,
        stack: &StackName,
        deadline: Instant,
    ) -> Result<SettledStack, DeployError> {
        let service = &self.service;
        self.poll(stack, deadline, "describeStack", move || async move {
            let description = service.describe_stack(stack).await?;
            Ok(SettledStack::from_status(description.status))
        })
        .await
    }

    /// Call `check` until it yields a value, the deadline passes or the
    /// operator interrupts. Each check is retried on transient errors.
    async fn poll<T, F, Fut>(
        &self,
        stack: &StackName,
        deadline: Instant,
        operation: &'static str,
        mut check: F,
    ) -> Result<T, DeployError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<Option<T>, RemoteError>>,
    {
        let started = Instant::now();
        let polling = async {
            loop {
                let settled = with_backoff(&self.settings.retry, operation, &mut check)
                    .await
                    .map_err(|e| DeployError::remote(stack, operation, e))?;
                if let Some(v) = settled {
                    return Ok(v);
                }
                tokio::select! {
                    _ = tokio::time::sleep(self.settings.poll_interval) => {}
                    _ = self.interrupt.interrupted() => return Err(DeployError::Interrupted),
                }
            }
        };
        match tokio::time::timeout_at(deadline, polling).await {
            Ok(r) => r,
            Err(_) => Err(DeployError::Timeout {
                stack: stack.clone(),
                waited: started.elapsed(),
            }),
        }
    }
}
