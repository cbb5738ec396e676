use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stackops_core::{
    document::parse_document,
    stack_api::{
        ChangeSetId, ChangeSetRequest, ChangeSetStatus, DeployFlags, RemoteError, RemoteErrorKind,
        StackDescription, StackName, StackService, StackStatus,
    },
};

use crate::state::Journal;

/// Resources of this type fail on execution, so that failure handling can
/// be exercised without a cloud.
pub const FAILING_RESOURCE_TYPE: &str = "Stackops::Test::Fail";

const DOCUMENT_TYPE: &str = "stackopsStack";

/// Unexecuted change sets kept per stack; older ones are discarded.
const MAX_PENDING_CHANGE_SETS: usize = 8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StackDocument {
    #[serde(rename = "_type")]
    type_: String,
    #[serde(flatten)]
    status: StackStatus,
    #[serde(default)]
    template_body: Option<String>,
    #[serde(default)]
    template: Value,
    #[serde(default)]
    parameters: BTreeMap<String, String>,
    #[serde(default)]
    tags: BTreeMap<String, String>,
    #[serde(default)]
    change_sets: BTreeMap<String, ChangeSetRecord>,
    #[serde(default)]
    next_sequence: u64,
}

/// A change set. Only pending ones keep their proposal; settled ones are
/// remembered by status so their ids stay single-use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangeSetRecord {
    #[serde(flatten)]
    status: ChangeSetStatus,
    #[serde(default)]
    sequence: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    proposal: Option<Proposal>,
    #[serde(default)]
    executed: bool,
}

impl ChangeSetRecord {
    fn is_pending(&self) -> bool {
        !self.executed && self.proposal.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Proposal {
    template_body: String,
    template: Value,
    parameters: BTreeMap<String, String>,
    tags: BTreeMap<String, String>,
}

impl StackDocument {
    fn new() -> Self {
        StackDocument {
            type_: DOCUMENT_TYPE.to_string(),
            status: StackStatus::NotFound,
            template_body: None,
            template: Value::Null,
            parameters: BTreeMap::new(),
            tags: BTreeMap::new(),
            change_sets: BTreeMap::new(),
            next_sequence: 0,
        }
    }

    /// Forget settled change sets, and the oldest pending ones beyond the
    /// limit, to make room for one more.
    fn prune_change_sets(&mut self) {
        self.change_sets.retain(|_, record| record.is_pending());
        while self.change_sets.len() >= MAX_PENDING_CHANGE_SETS {
            let oldest = self
                .change_sets
                .iter()
                .min_by_key(|(_, record)| record.sequence)
                .map(|(id, _)| id.clone());
            match oldest {
                Some(id) => {
                    tracing::debug!(change_set = %id, "discarding an abandoned change set");
                    self.change_sets.remove(&id);
                }
                None => break,
            }
        }
    }

    /// What a change set compares: the deployed template and parameters.
    fn deployed(&self) -> Value {
        serde_json::json!({"template": self.template, "parameters": self.parameters})
    }
}

/// Stacks kept as journals in a local directory, one file per stack.
pub struct LocalStackProvider {
    dir: PathBuf,
}

fn internal(e: anyhow::Error) -> RemoteError {
    RemoteError::new(RemoteErrorKind::Internal, format!("{:#}", e))
}

fn validation(message: impl Into<String>) -> RemoteError {
    RemoteError::new(RemoteErrorKind::Validation, message)
}

impl LocalStackProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        LocalStackProvider { dir: dir.into() }
    }

    fn journal_path(&self, stack: &StackName) -> PathBuf {
        self.dir.join(format!("{}.json", stack))
    }

    fn load(&self, stack: &StackName) -> Result<Option<(Journal, StackDocument)>, RemoteError> {
        let Some(journal) = Journal::open(&self.journal_path(stack)).map_err(internal)? else {
            return Ok(None);
        };
        let document = serde_json::from_value(journal.state().clone())
            .with_context(|| format!("stack {} has an unreadable state document", stack))
            .map_err(internal)?;
        Ok(Some((journal, document)))
    }

    fn load_or_create(&self, stack: &StackName) -> Result<(Journal, StackDocument), RemoteError> {
        if let Some(loaded) = self.load(stack)? {
            return Ok(loaded);
        }
        ensure_dir(&self.dir).map_err(internal)?;
        let document = StackDocument::new();
        let journal = Journal::create(&self.journal_path(stack), to_value(&document)?)
            .map_err(internal)?;
        Ok((journal, document))
    }
}

fn ensure_dir(dir: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))
}

fn to_value(document: &StackDocument) -> Result<Value, RemoteError> {
    serde_json::to_value(document)
        .context("encoding stack document")
        .map_err(internal)
}

fn commit(journal: &mut Journal, document: &StackDocument, cause: &str) -> Result<(), RemoteError> {
    journal.commit(to_value(document)?, cause).map_err(internal)
}

/// The name of the first resource of the failing test type, if any.
fn failing_resource(template: &Value) -> Option<String> {
    template
        .get("Resources")?
        .as_object()?
        .iter()
        .find(|(_, resource)| {
            resource.get("Type").and_then(Value::as_str) == Some(FAILING_RESOURCE_TYPE)
        })
        .map(|(name, _)| name.clone())
}

#[async_trait::async_trait]
impl StackService for LocalStackProvider {
    async fn read_template(&self, stack: &StackName) -> Result<Option<String>, RemoteError> {
        Ok(self
            .load(stack)?
            .and_then(|(_, document)| document.template_body))
    }

    async fn create_change_set(&self, request: &ChangeSetRequest) -> Result<(), RemoteError> {
        let template = parse_document(&request.template_body)
            .map_err(|e| validation(format!("Template format error: {}", e)))?;
        if template.get("Resources").and_then(Value::as_object).is_none() {
            return Err(validation(
                "Template format error: At least one Resources member must be defined",
            ));
        }

        let (mut journal, mut document) = self.load_or_create(&request.stack_name)?;
        let id = request.change_set_id.to_string();
        if document.change_sets.contains_key(&id) {
            return Err(RemoteError::new(
                RemoteErrorKind::Conflict,
                format!("change set {} already exists", id),
            ));
        }
        if document.status == StackStatus::InProgress {
            return Err(RemoteError::new(
                RemoteErrorKind::Conflict,
                format!("stack {} has an operation in progress", request.stack_name),
            ));
        }

        let proposed = serde_json::json!({"template": template, "parameters": request.parameters});
        let changes: Vec<String> = json_patch::diff(&document.deployed(), &proposed)
            .0
            .iter()
            .map(|op| op.path().to_string())
            .collect();
        let (status, proposal) = if changes.is_empty() {
            (ChangeSetStatus::Empty, None)
        } else {
            let proposal = Proposal {
                template_body: request.template_body.clone(),
                template,
                parameters: request.parameters.clone(),
                tags: request.tags.clone(),
            };
            (ChangeSetStatus::Ready { changes }, Some(proposal))
        };
        tracing::info!(stack = %request.stack_name, change_set = %id, ?status, "created change set");
        document.prune_change_sets();
        document.next_sequence += 1;
        document.change_sets.insert(
            id,
            ChangeSetRecord {
                status,
                sequence: document.next_sequence,
                proposal,
                executed: false,
            },
        );
        commit(&mut journal, &document, "createChangeSet")
    }

    async fn describe_change_set(
        &self,
        stack: &StackName,
        change_set: &ChangeSetId,
    ) -> Result<ChangeSetStatus, RemoteError> {
        let not_found = || {
            RemoteError::new(
                RemoteErrorKind::NotFound,
                format!("change set {} does not exist for stack {}", change_set, stack),
            )
        };
        let (_, document) = self.load(stack)?.ok_or_else(not_found)?;
        document
            .change_sets
            .get(&change_set.0)
            .map(|record| record.status.clone())
            .ok_or_else(not_found)
    }

    async fn execute_change_set(
        &self,
        stack: &StackName,
        change_set: &ChangeSetId,
        flags: DeployFlags,
    ) -> Result<(), RemoteError> {
        let not_found = || {
            RemoteError::new(
                RemoteErrorKind::NotFound,
                format!("change set {} does not exist for stack {}", change_set, stack),
            )
        };
        let (mut journal, mut document) = self.load(stack)?.ok_or_else(not_found)?;
        let record = document
            .change_sets
            .get(&change_set.0)
            .cloned()
            .ok_or_else(not_found)?;
        if record.executed {
            return Err(RemoteError::new(
                RemoteErrorKind::Conflict,
                format!("change set {} was already executed", change_set),
            ));
        }
        let proposal = match (&record.status, record.proposal) {
            (ChangeSetStatus::Ready { .. }, Some(proposal)) => proposal,
            (other, _) => {
                return Err(validation(format!(
                    "change set {} cannot be executed in status {:?}",
                    change_set, other
                )))
            }
        };
        match &document.status {
            StackStatus::InProgress => {
                return Err(RemoteError::new(
                    RemoteErrorKind::Conflict,
                    format!("stack {} has an operation in progress", stack),
                ))
            }
            StackStatus::Failed { .. } if !flags.force => {
                return Err(RemoteError::new(
                    RemoteErrorKind::Conflict,
                    format!(
                        "stack {} is in a failed state and was not rolled back; inspect it, then deploy with force",
                        stack
                    ),
                ))
            }
            _ => {}
        }

        // Executing a change set invalidates the stack's other change sets.
        document.change_sets.retain(|id, _| *id == change_set.0);
        if let Some(entry) = document.change_sets.get_mut(&change_set.0) {
            entry.executed = true;
            entry.proposal = None;
        }
        document.status = StackStatus::InProgress;
        commit(&mut journal, &document, "executeChangeSet")?;

        match failing_resource(&proposal.template) {
            Some(resource) => {
                let reason = format!("Resource {} failed to create", resource);
                document.status = if flags.disable_rollback {
                    StackStatus::Failed { reason }
                } else {
                    StackStatus::RolledBack { reason }
                };
            }
            None => {
                document.status = StackStatus::Complete;
                document.template_body = Some(proposal.template_body);
                document.template = proposal.template;
                document.parameters = proposal.parameters;
                document.tags = proposal.tags;
            }
        }
        tracing::info!(%stack, change_set = %change_set, status = ?document.status, "executed change set");
        commit(&mut journal, &document, "executeChangeSet")
    }

    async fn describe_stack(&self, stack: &StackName) -> Result<StackDescription, RemoteError> {
        Ok(match self.load(stack)? {
            None => StackDescription {
                status: StackStatus::NotFound,
                parameters: BTreeMap::new(),
            },
            Some((_, document)) => StackDescription {
                status: document.status,
                parameters: document.parameters,
            },
        })
    }
}
