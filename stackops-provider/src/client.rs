use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use stackops_core::stack_api::{
    ChangeSetId, ChangeSetRequest, ChangeSetStatus, DeployFlags, RemoteError, RemoteErrorKind,
    StackDescription, StackName, StackService,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    process,
    sync::Mutex,
};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

use crate::schema::{
    ChangeSetRef, ExecuteChangeSet, Request, RequestId, RequestMessage, Response, ResponseMessage,
    StackRef,
};

pub struct ProviderConfig {
    pub provider_executable: String,
    pub provider_args: Vec<String>,
}

type Reader = FramedRead<Box<dyn AsyncRead + Send + Unpin>, LinesCodec>;
type Writer = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, LinesCodec>;

struct Connection {
    reader: Reader,
    writer: Writer,
    last_id: RequestId,
}

/// A `StackService` backed by a provider process.
///
/// Requests are serialized. A call that is dropped while waiting (for
/// instance by a timeout) leaves its response in the pipe; the next call
/// skips it by id.
pub struct StackProviderClient {
    name: String,
    connection: Mutex<Option<Connection>>,
    child: Mutex<Option<process::Child>>,
}

impl StackProviderClient {
    pub fn spawn(config: &ProviderConfig) -> Result<Self> {
        let mut child = process::Command::new(&config.provider_executable)
            .args(&config.provider_args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| {
                format!(
                    "Could not spawn provider process {}",
                    config.provider_executable
                )
            })?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            bail!("provider process {} has no stdio pipes", config.provider_executable);
        };
        let mut client = Self::from_io(config.provider_executable.clone(), stdout, stdin);
        client.child = Mutex::new(Some(child));
        Ok(client)
    }

    /// Talk to a provider over an existing pair of streams.
    pub fn from_io(
        name: String,
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(reader);
        let writer: Box<dyn AsyncWrite + Send + Unpin> = Box::new(writer);
        StackProviderClient {
            name,
            connection: Mutex::new(Some(Connection {
                reader: FramedRead::new(reader, LinesCodec::new()),
                writer: FramedWrite::new(writer, LinesCodec::new()),
                last_id: 0,
            })),
            child: Mutex::new(None),
        }
    }

    /// Close the provider's stdin and wait for it to exit.
    pub async fn close(&self) -> Result<()> {
        drop(self.connection.lock().await.take());
        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            let status = child
                .wait()
                .await
                .with_context(|| format!("waiting for provider {}", self.name))?;
            if !status.success() {
                bail!("provider {} exited with {}", self.name, status);
            }
        }
        Ok(())
    }

    async fn call<T: DeserializeOwned>(&self, request: Request) -> Result<T, RemoteError> {
        let method = request.method();
        let transport = |e: String| {
            RemoteError::new(
                RemoteErrorKind::Internal,
                format!("provider {}: {}: {}", self.name, method, e),
            )
        };

        let mut guard = self.connection.lock().await;
        let connection = guard
            .as_mut()
            .ok_or_else(|| transport("connection is closed".to_string()))?;
        connection.last_id += 1;
        let id = connection.last_id;
        let line = serde_json::to_string(&RequestMessage { id, request })
            .map_err(|e| transport(e.to_string()))?;
        connection
            .writer
            .send(line)
            .await
            .map_err(|e| transport(e.to_string()))?;
        let response = loop {
            let line = match connection.reader.next().await {
                Some(line) => line.map_err(|e| transport(e.to_string()))?,
                None => return Err(transport("provider closed its output".to_string())),
            };
            let message: ResponseMessage =
                serde_json::from_str(&line).map_err(|e| transport(e.to_string()))?;
            match message.id.cmp(&id) {
                std::cmp::Ordering::Equal => break message.response,
                std::cmp::Ordering::Less => {
                    tracing::debug!(
                        provider = %self.name,
                        stale = message.id,
                        expected = id,
                        "discarding the response to an abandoned request"
                    );
                }
                std::cmp::Ordering::Greater => {
                    return Err(transport(format!(
                        "response to request {} arrived while waiting for {}",
                        message.id, id
                    )))
                }
            }
        };
        drop(guard);

        match response {
            Response::Result(value) => {
                serde_json::from_value(value).map_err(|e| transport(e.to_string()))
            }
            Response::Error(e) => Err(e),
        }
    }
}

#[async_trait::async_trait]
impl StackService for StackProviderClient {
    async fn read_template(&self, stack: &StackName) -> Result<Option<String>, RemoteError> {
        self.call(Request::ReadTemplate(StackRef {
            stack_name: stack.clone(),
        }))
        .await
    }

    async fn create_change_set(&self, request: &ChangeSetRequest) -> Result<(), RemoteError> {
        self.call(Request::CreateChangeSet(request.clone())).await
    }

    async fn describe_change_set(
        &self,
        stack: &StackName,
        change_set: &ChangeSetId,
    ) -> Result<ChangeSetStatus, RemoteError> {
        self.call(Request::DescribeChangeSet(ChangeSetRef {
            stack_name: stack.clone(),
            change_set_id: change_set.clone(),
        }))
        .await
    }

    async fn execute_change_set(
        &self,
        stack: &StackName,
        change_set: &ChangeSetId,
        flags: DeployFlags,
    ) -> Result<(), RemoteError> {
        self.call(Request::ExecuteChangeSet(ExecuteChangeSet {
            stack_name: stack.clone(),
            change_set_id: change_set.clone(),
            flags,
        }))
        .await
    }

    async fn describe_stack(&self, stack: &StackName) -> Result<StackDescription, RemoteError> {
        self.call(Request::DescribeStack(StackRef {
            stack_name: stack.clone(),
        }))
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::framework::{serve, tests::MemoryService};
    use stackops_core::stack_api::StackStatus;

    /// A client wired to an in-process provider.
    fn connect() -> (StackProviderClient, Arc<MemoryService>, tokio::task::JoinHandle<()>) {
        let service = Arc::new(MemoryService::default());
        let (client_side, provider_side) = tokio::io::duplex(1 << 16);
        let (client_read, client_write) = tokio::io::split(client_side);
        let (provider_read, provider_write) = tokio::io::split(provider_side);
        let served = service.clone();
        let handle = tokio::spawn(async move {
            serve(served.as_ref(), provider_read, provider_write)
                .await
                .unwrap();
        });
        (
            StackProviderClient::from_io("memory".to_string(), client_read, client_write),
            service,
            handle,
        )
    }

    #[tokio::test]
    async fn round_trips_through_the_provider() {
        let (client, service, handle) = connect();
        let stack = StackName::new("app-test-web").unwrap();

        assert_eq!(client.read_template(&stack).await.unwrap(), None);
        let id = ChangeSetId("cs-1".to_string());
        client
            .create_change_set(&ChangeSetRequest {
                stack_name: stack.clone(),
                change_set_id: id.clone(),
                template_body: "Resources: {}\n".to_string(),
                parameters: Default::default(),
                role_arn: None,
                tags: Default::default(),
            })
            .await
            .unwrap();
        assert_eq!(
            client.read_template(&stack).await.unwrap().as_deref(),
            Some("Resources: {}\n")
        );
        assert!(matches!(
            client.describe_change_set(&stack, &id).await.unwrap(),
            ChangeSetStatus::Ready { .. }
        ));
        let flags = DeployFlags {
            disable_rollback: false,
            force: true,
        };
        client.execute_change_set(&stack, &id, flags).await.unwrap();
        assert_eq!(
            service.executed.lock().unwrap().as_slice(),
            &[("app-test-web".to_string(), flags)]
        );
        assert_eq!(
            client.describe_stack(&stack).await.unwrap().status,
            StackStatus::Complete
        );

        client.close().await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn remote_errors_pass_through() {
        let (client, _service, _handle) = connect();
        let stack = StackName::new("app-test-web").unwrap();
        let err = client
            .describe_change_set(&stack, &ChangeSetId("missing".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.kind, RemoteErrorKind::NotFound);
    }

    /// Answers every request after `delay`.
    struct SlowService {
        inner: MemoryService,
        delay: std::time::Duration,
    }

    #[async_trait::async_trait]
    impl StackService for SlowService {
        async fn read_template(&self, stack: &StackName) -> Result<Option<String>, RemoteError> {
            tokio::time::sleep(self.delay).await;
            self.inner.read_template(stack).await
        }

        async fn create_change_set(&self, request: &ChangeSetRequest) -> Result<(), RemoteError> {
            tokio::time::sleep(self.delay).await;
            self.inner.create_change_set(request).await
        }

        async fn describe_change_set(
            &self,
            stack: &StackName,
            change_set: &ChangeSetId,
        ) -> Result<ChangeSetStatus, RemoteError> {
            tokio::time::sleep(self.delay).await;
            self.inner.describe_change_set(stack, change_set).await
        }

        async fn execute_change_set(
            &self,
            stack: &StackName,
            change_set: &ChangeSetId,
            flags: DeployFlags,
        ) -> Result<(), RemoteError> {
            tokio::time::sleep(self.delay).await;
            self.inner.execute_change_set(stack, change_set, flags).await
        }

        async fn describe_stack(&self, stack: &StackName) -> Result<StackDescription, RemoteError> {
            tokio::time::sleep(self.delay).await;
            self.inner.describe_stack(stack).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_calls_do_not_answer_later_ones() {
        let service = Arc::new(SlowService {
            inner: MemoryService::default(),
            delay: std::time::Duration::from_millis(100),
        });
        for name in ["stack-a", "stack-b"] {
            service
                .inner
                .templates
                .lock()
                .unwrap()
                .insert(name.to_string(), format!("template-of-{}", name));
        }
        let (client_side, provider_side) = tokio::io::duplex(1 << 16);
        let (client_read, client_write) = tokio::io::split(client_side);
        let (provider_read, provider_write) = tokio::io::split(provider_side);
        let served = service.clone();
        let _handle = tokio::spawn(async move {
            serve(served.as_ref(), provider_read, provider_write)
                .await
                .unwrap();
        });
        let client = StackProviderClient::from_io("slow".to_string(), client_read, client_write);

        let a = StackName::new("stack-a").unwrap();
        let b = StackName::new("stack-b").unwrap();
        let abandoned =
            tokio::time::timeout(std::time::Duration::from_millis(10), client.read_template(&a))
                .await;
        assert!(abandoned.is_err());

        assert_eq!(
            client.read_template(&b).await.unwrap().as_deref(),
            Some("template-of-stack-b")
        );
        assert_eq!(
            client.read_template(&a).await.unwrap().as_deref(),
            Some("template-of-stack-a")
        );
    }

    #[tokio::test]
    async fn responses_from_the_future_are_rejected() {
        let (client_side, provider_side) = tokio::io::duplex(1 << 16);
        let (client_read, client_write) = tokio::io::split(client_side);
        let (provider_read, mut provider_write) = tokio::io::split(provider_side);
        let _handle = tokio::spawn(async move {
            use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
            let mut lines = tokio::io::BufReader::new(provider_read).lines();
            while lines.next_line().await.unwrap().is_some() {
                provider_write
                    .write_all(b"{\"id\": 9, \"result\": null}\n")
                    .await
                    .unwrap();
            }
        });
        let client = StackProviderClient::from_io("confused".to_string(), client_read, client_write);
        let err = client
            .read_template(&StackName::new("stack-a").unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.kind, RemoteErrorKind::Internal);
        assert!(err.message.contains("request 9"), "{}", err.message);
    }

    #[tokio::test]
    async fn calls_after_close_fail() {
        let (client, _service, _handle) = connect();
        client.close().await.unwrap();
        let err = client
            .read_template(&StackName::new("app-test-web").unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.kind, RemoteErrorKind::Internal);
        assert!(err.message.contains("closed"), "{}", err.message);
    }
}
