use serde::{Deserialize, Serialize};
use serde_json::Value;
use stackops_core::stack_api::{ChangeSetId, ChangeSetRequest, DeployFlags, RemoteError, StackName};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackRef {
    pub stack_name: StackName,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSetRef {
    pub stack_name: StackName,
    pub change_set_id: ChangeSetId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteChangeSet {
    pub stack_name: StackName,
    pub change_set_id: ChangeSetId,
    #[serde(default)]
    pub flags: DeployFlags,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "camelCase")]
pub enum Request {
    ReadTemplate(StackRef),
    CreateChangeSet(ChangeSetRequest),
    DescribeChangeSet(ChangeSetRef),
    ExecuteChangeSet(ExecuteChangeSet),
    DescribeStack(StackRef),
}

impl Request {
    pub fn method(&self) -> &'static str {
        match self {
            Request::ReadTemplate(_) => "readTemplate",
            Request::CreateChangeSet(_) => "createChangeSet",
            Request::DescribeChangeSet(_) => "describeChangeSet",
            Request::ExecuteChangeSet(_) => "executeChangeSet",
            Request::DescribeStack(_) => "describeStack",
        }
    }
}

/// The shape of `result` depends on the request it answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Response {
    Result(Value),
    Error(RemoteError),
}

/// Correlates a response with its request. The client numbers requests
/// from 1; the provider echoes the number back.
pub type RequestId = u64;

/// One line on the provider's stdin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMessage {
    pub id: RequestId,
    #[serde(flatten)]
    pub request: Request,
}

/// One line on the provider's stdout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMessage {
    /// `0` when the request was too malformed to carry an id.
    pub id: RequestId,
    #[serde(flatten)]
    pub response: Response,
}
