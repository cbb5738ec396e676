//! An in-memory stack service for orchestrator tests.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Mutex,
    time::Duration,
};

use async_trait::async_trait;
use stackops_core::stack_api::{
    ChangeSetId, ChangeSetRequest, ChangeSetStatus, DeployFlags, RemoteError, RemoteErrorKind,
    StackDescription, StackName, StackService, StackStatus,
};

#[derive(Clone)]
struct Deployed {
    template: String,
    parameters: BTreeMap<String, String>,
}

struct PendingChangeSet {
    request: ChangeSetRequest,
    status: ChangeSetStatus,
    pending_polls: u32,
}

struct Running {
    proposed: Deployed,
    remaining_polls: u32,
    outcome: StackStatus,
}

#[derive(Default)]
pub(super) struct Inner {
    deployed: HashMap<StackName, Deployed>,
    change_sets: HashMap<ChangeSetId, PendingChangeSet>,
    running: HashMap<StackName, Running>,
    /// Scripted transient failures per operation.
    failures: HashMap<&'static str, u32>,
    /// Failures that happen after the change set was stored.
    lost_replies: u32,
    next_outcome: Option<StackStatus>,
    calls: Vec<String>,
    overlapping: HashSet<StackName>,
}

#[derive(Default)]
pub(crate) struct FakeStackService {
    pub(super) inner: Mutex<Inner>,
    /// Number of `InProgress` answers before an execution settles.
    pub execution_polls: u32,
    pub change_set_polls: u32,
    /// Never let executions finish.
    pub hang: bool,
    pub latency: Duration,
}

impl FakeStackService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, operation: &'static str, times: u32) {
        self.inner.lock().unwrap().failures.insert(operation, times);
    }

    /// Make the next `create_change_set` store the change set but report a
    /// transient failure.
    pub fn lose_next_create_reply(&self) {
        self.inner.lock().unwrap().lost_replies = 1;
    }

    pub fn set_next_outcome(&self, outcome: StackStatus) {
        self.inner.lock().unwrap().next_outcome = Some(outcome);
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn count(&self, operation: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.as_str() == operation)
            .count()
    }

    pub fn deployed_template(&self, stack: &StackName) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .deployed
            .get(stack)
            .map(|d| d.template.clone())
    }

    pub fn deployed_parameters(&self, stack: &StackName) -> Option<BTreeMap<String, String>> {
        self.inner
            .lock()
            .unwrap()
            .deployed
            .get(stack)
            .map(|d| d.parameters.clone())
    }

    /// Pretend `stack` was deployed earlier.
    pub fn seed(&self, stack: &StackName, template: &str, parameters: BTreeMap<String, String>) {
        self.inner.lock().unwrap().deployed.insert(
            stack.clone(),
            Deployed {
                template: template.to_string(),
                parameters,
            },
        );
    }

    /// Whether a change set was created while an execution was running.
    pub fn saw_overlap(&self, stack: &StackName) -> bool {
        self.inner.lock().unwrap().overlapping.contains(stack)
    }

    async fn enter(&self, operation: &'static str) -> Result<(), RemoteError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(operation.to_string());
        if let Some(n) = inner.failures.get_mut(operation) {
            if *n > 0 {
                *n -= 1;
                return Err(RemoteError::new(
                    RemoteErrorKind::Throttled,
                    format!("{}: Rate exceeded", operation),
                ));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StackService for FakeStackService {
    async fn read_template(&self, stack: &StackName) -> Result<Option<String>, RemoteError> {
        self.enter("readTemplate").await?;
        Ok(self.deployed_template(stack))
    }

    async fn create_change_set(&self, request: &ChangeSetRequest) -> Result<(), RemoteError> {
        self.enter("createChangeSet").await?;
        let mut inner = self.inner.lock().unwrap();
        if inner.running.contains_key(&request.stack_name) {
            inner.overlapping.insert(request.stack_name.clone());
            return Err(RemoteError::new(
                RemoteErrorKind::Conflict,
                format!("stack {} is being updated", request.stack_name),
            ));
        }
        if inner.change_sets.contains_key(&request.change_set_id) {
            return Err(RemoteError::new(
                RemoteErrorKind::Conflict,
                format!("change set {} already exists", request.change_set_id),
            ));
        }
        let unchanged = inner.deployed.get(&request.stack_name).is_some_and(|d| {
            d.template == request.template_body && d.parameters == request.parameters
        });
        let status = if request.template_body.trim().is_empty() {
            ChangeSetStatus::Failed {
                reason: "Template format error: template is empty".to_string(),
            }
        } else if unchanged {
            ChangeSetStatus::Empty
        } else {
            ChangeSetStatus::Ready {
                changes: vec!["/template".to_string()],
            }
        };
        inner.change_sets.insert(
            request.change_set_id.clone(),
            PendingChangeSet {
                request: request.clone(),
                status,
                pending_polls: self.change_set_polls,
            },
        );
        if inner.lost_replies > 0 {
            inner.lost_replies -= 1;
            return Err(RemoteError::new(
                RemoteErrorKind::Transient,
                "connection reset by peer",
            ));
        }
        Ok(())
    }

    async fn describe_change_set(
        &self,
        _stack: &StackName,
        id: &ChangeSetId,
    ) -> Result<ChangeSetStatus, RemoteError> {
        self.enter("describeChangeSet").await?;
        let mut inner = self.inner.lock().unwrap();
        let Some(cs) = inner.change_sets.get_mut(id) else {
            return Err(RemoteError::new(
                RemoteErrorKind::NotFound,
                format!("change set {} does not exist", id),
            ));
        };
        if cs.pending_polls > 0 {
            cs.pending_polls -= 1;
            return Ok(ChangeSetStatus::Pending);
        }
        Ok(cs.status.clone())
    }

    async fn execute_change_set(
        &self,
        stack: &StackName,
        id: &ChangeSetId,
        flags: DeployFlags,
    ) -> Result<(), RemoteError> {
        self.enter("executeChangeSet").await?;
        let mut inner = self.inner.lock().unwrap();
        let Some(cs) = inner.change_sets.remove(id) else {
            return Err(RemoteError::new(
                RemoteErrorKind::NotFound,
                format!("change set {} does not exist", id),
            ));
        };
        let outcome = match inner.next_outcome.take() {
            Some(StackStatus::RolledBack { reason }) if flags.disable_rollback => {
                StackStatus::Failed { reason }
            }
            Some(outcome) => outcome,
            None => StackStatus::Complete,
        };
        inner.running.insert(
            stack.clone(),
            Running {
                proposed: Deployed {
                    template: cs.request.template_body,
                    parameters: cs.request.parameters,
                },
                remaining_polls: self.execution_polls,
                outcome,
            },
        );
        Ok(())
    }

    async fn describe_stack(&self, stack: &StackName) -> Result<StackDescription, RemoteError> {
        self.enter("describeStack").await?;
        let mut inner = self.inner.lock().unwrap();
        if let Some(running) = inner.running.get_mut(stack) {
            if self.hang || running.remaining_polls > 0 {
                running.remaining_polls = running.remaining_polls.saturating_sub(1);
                return Ok(StackDescription {
                    status: StackStatus::InProgress,
                    parameters: running.proposed.parameters.clone(),
                });
            }
            let running = inner.running.remove(stack).unwrap();
            if running.outcome == StackStatus::Complete {
                inner.deployed.insert(stack.clone(), running.proposed);
            }
            let parameters = inner
                .deployed
                .get(stack)
                .map(|d| d.parameters.clone())
                .unwrap_or_default();
            return Ok(StackDescription {
                status: running.outcome,
                parameters,
            });
        }
        Ok(match inner.deployed.get(stack) {
            Some(d) => StackDescription {
                status: StackStatus::Complete,
                parameters: d.parameters.clone(),
            },
            None => StackDescription {
                status: StackStatus::NotFound,
                parameters: BTreeMap::new(),
            },
        })
    }
}
