//! The remote stack service, as seen by the deployment orchestrator.
//!
//! The service is the durable source of truth for a workload's deployed
//! configuration. Nothing here talks to a network; [`StackService`] is
//! implemented by the provider client and by test fakes.

use std::{
    collections::BTreeMap,
    fmt::Display,
    sync::atomic::{AtomicU64, Ordering},
};

use anyhow::bail;
use serde::{Deserialize, Serialize};

/// Name of a remote stack: `<app>-<env>-<workload>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StackName(String);

const MAX_STACK_NAME_LEN: usize = 128;

impl StackName {
    pub fn new(name: impl Into<String>) -> anyhow::Result<Self> {
        let name = name.into();
        if name.is_empty() || name.len() > MAX_STACK_NAME_LEN {
            bail!(
                "stack name {:?} must be between 1 and {} characters long",
                name,
                MAX_STACK_NAME_LEN
            );
        }
        if !name.starts_with(|c: char| c.is_ascii_alphabetic()) {
            bail!("stack name {:?} must start with a letter", name);
        }
        if let Some(c) = name.chars().find(|c| !(c.is_ascii_alphanumeric() || *c == '-')) {
            bail!("stack name {:?} contains invalid character {:?}", name, c);
        }
        Ok(StackName(name))
    }

    pub fn for_workload(app: &str, env: &str, workload: &str) -> anyhow::Result<Self> {
        Self::new(format!("{}-{}-{}", app, env, workload))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for StackName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for StackName {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        StackName::new(value)
    }
}

impl From<StackName> for String {
    fn from(name: StackName) -> Self {
        name.0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployFlags {
    /// Leave a failed stack in its failed state instead of rolling back.
    #[serde(default)]
    pub disable_rollback: bool,
    /// Bypass the service's drift and ownership checks.
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRequest {
    pub stack_name: StackName,
    pub template_body: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_arn: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub flags: DeployFlags,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeSetId(pub String);

static CHANGE_SET_COUNTER: AtomicU64 = AtomicU64::new(0);

impl ChangeSetId {
    /// A fresh, process-unique id for a change set name.
    pub fn generate() -> Self {
        let n = CHANGE_SET_COUNTER.fetch_add(1, Ordering::Relaxed);
        ChangeSetId(format!(
            "stackops-{}-{}",
            chrono::Utc::now().format("%Y%m%d%H%M%S%3f"),
            n
        ))
    }
}

impl Display for ChangeSetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSetRequest {
    pub stack_name: StackName,
    pub change_set_id: ChangeSetId,
    pub template_body: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_arn: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl ChangeSetRequest {
    pub fn for_deployment(request: &DeploymentRequest, change_set_id: ChangeSetId) -> Self {
        ChangeSetRequest {
            stack_name: request.stack_name.clone(),
            change_set_id,
            template_body: request.template_body.clone(),
            parameters: request.parameters.clone(),
            role_arn: request.role_arn.clone(),
            tags: request.tags.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum ChangeSetStatus {
    Pending,
    /// No drift between the deployed stack and the proposed template.
    Empty,
    Ready { changes: Vec<String> },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum StackStatus {
    NotFound,
    InProgress,
    Complete,
    Failed { reason: String },
    RolledBack { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackDescription {
    #[serde(flatten)]
    pub status: StackStatus,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

/// Where a single deployment is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StackLifecycleState {
    None,
    ChangeSetPending,
    /// Terminal success: nothing to apply.
    ChangeSetEmpty,
    ChangeSetReady,
    Executing,
    Complete,
    Failed,
    RolledBack,
}

impl StackLifecycleState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StackLifecycleState::ChangeSetEmpty
                | StackLifecycleState::Complete
                | StackLifecycleState::Failed
                | StackLifecycleState::RolledBack
        )
    }

    pub fn can_transition_to(self, next: StackLifecycleState) -> bool {
        use StackLifecycleState::*;
        matches!(
            (self, next),
            (None, ChangeSetPending)
                | (ChangeSetPending, ChangeSetEmpty)
                | (ChangeSetPending, ChangeSetReady)
                | (ChangeSetPending, Failed)
                | (ChangeSetReady, Executing)
                | (Executing, Complete)
                | (Executing, Failed)
                | (Executing, RolledBack)
        )
    }
}

impl Display for StackLifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StackLifecycleState::None => "NONE",
            StackLifecycleState::ChangeSetPending => "CHANGESET_PENDING",
            StackLifecycleState::ChangeSetEmpty => "CHANGESET_EMPTY",
            StackLifecycleState::ChangeSetReady => "CHANGESET_READY",
            StackLifecycleState::Executing => "EXECUTING",
            StackLifecycleState::Complete => "COMPLETE",
            StackLifecycleState::Failed => "FAILED",
            StackLifecycleState::RolledBack => "ROLLED_BACK",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RemoteErrorKind {
    /// Network trouble or an unavailable service.
    Transient,
    Throttled,
    Validation,
    NotFound,
    /// Another operation holds the stack.
    Conflict,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        RemoteError {
            kind,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            RemoteErrorKind::Transient | RemoteErrorKind::Throttled
        )
    }
}

#[async_trait::async_trait]
pub trait StackService: Send + Sync {
    /// The template the stack currently runs, as the service stores it.
    /// `None` when the stack does not exist.
    async fn read_template(&self, stack: &StackName) -> Result<Option<String>, RemoteError>;

    async fn create_change_set(&self, request: &ChangeSetRequest) -> Result<(), RemoteError>;

    /// `NotFound` when no change set by that id exists.
    async fn describe_change_set(
        &self,
        stack: &StackName,
        change_set: &ChangeSetId,
    ) -> Result<ChangeSetStatus, RemoteError>;

    async fn execute_change_set(
        &self,
        stack: &StackName,
        change_set: &ChangeSetId,
        flags: DeployFlags,
    ) -> Result<(), RemoteError>;

    async fn describe_stack(&self, stack: &StackName) -> Result<StackDescription, RemoteError>;
}
