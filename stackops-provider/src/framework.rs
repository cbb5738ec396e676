use std::os::fd::{AsRawFd, FromRawFd};

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use nix::unistd::{dup, dup2};
use serde::Serialize;
use stackops_core::stack_api::{RemoteError, RemoteErrorKind, StackService};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

use crate::schema::{Request, RequestId, RequestMessage, Response, ResponseMessage};

/// Run a provider executable: serve requests from `stackops` until it
/// closes our stdin.
pub fn run_main(provider: impl StackService) {
    let pipe = init_stdio()
        .and_then(pipe_fds_to_files)
        .unwrap_or_exit();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Could not start the tokio runtime")
        .unwrap_or_exit();

    runtime
        .block_on(serve(
            &provider,
            tokio::fs::File::from_std(pipe.in_),
            tokio::fs::File::from_std(pipe.out),
        ))
        .unwrap_or_exit();
}

/// Answer requests in order until the reader reaches end of file.
///
/// Each response carries the id of its request. A request that does not
/// parse gets a `validation` error response; the connection stays usable.
pub async fn serve<R, W>(service: &dyn StackService, reader: R, writer: W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut requests = FramedRead::new(reader, LinesCodec::new());
    let mut responses = FramedWrite::new(writer, LinesCodec::new());

    while let Some(line) = requests.next().await {
        let line = line.context("Could not read request line")?;
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<RequestMessage>(&line) {
            Ok(RequestMessage { id, request }) => {
                tracing::debug!(id, method = request.method(), "request");
                ResponseMessage {
                    id,
                    response: handle(service, request).await,
                }
            }
            Err(e) => ResponseMessage {
                id: salvage_id(&line),
                response: Response::Error(RemoteError::new(
                    RemoteErrorKind::Validation,
                    format!("Could not parse request message: {}", e),
                )),
            },
        };
        let line = serde_json::to_string(&response).context("Could not encode response")?;
        responses
            .send(line)
            .await
            .context("Could not write response line")?;
    }
    Ok(())
}

fn salvage_id(line: &str) -> RequestId {
    serde_json::from_str::<serde_json::Value>(line)
        .ok()
        .and_then(|v| v.get("id")?.as_u64())
        .unwrap_or(0)
}

pub async fn handle(service: &dyn StackService, request: Request) -> Response {
    match request {
        Request::ReadTemplate(r) => respond(service.read_template(&r.stack_name).await),
        Request::CreateChangeSet(r) => respond(service.create_change_set(&r).await),
        Request::DescribeChangeSet(r) => respond(
            service
                .describe_change_set(&r.stack_name, &r.change_set_id)
                .await,
        ),
        Request::ExecuteChangeSet(r) => respond(
            service
                .execute_change_set(&r.stack_name, &r.change_set_id, r.flags)
                .await,
        ),
        Request::DescribeStack(r) => respond(service.describe_stack(&r.stack_name).await),
    }
}

fn respond<T: Serialize>(result: Result<T, RemoteError>) -> Response {
    match result.and_then(|value| {
        serde_json::to_value(value)
            .map_err(|e| RemoteError::new(RemoteErrorKind::Internal, e.to_string()))
    }) {
        Ok(value) => Response::Result(value),
        Err(e) => {
            eprintln!("Error: {}", e);
            Response::Error(e)
        }
    }
}

/// A pair of `T` values: one for input and one for output.
struct InOut<T> {
    in_: T,
    out: T,
}

/// A file descriptor
type Fd = i32;

/// Configure the standard input/output streams for the process.
/// This returns the communication channels with stackops, and reconfigures
/// the stdio file descriptors as follows:
///
/// ```text
/// 0: /dev/null
/// 1: stderr
/// 2: stderr
/// ```
///
/// so that a stray `println!` cannot corrupt the protocol.
fn init_stdio() -> Result<InOut<Fd>> {
    let r = InOut {
        in_: dup(0).context("dup(0)")?,
        out: dup(1).context("dup(1)")?,
    };

    let dev_null = std::fs::File::open("/dev/null").context("Could not open /dev/null")?;
    dup2(dev_null.as_raw_fd(), 0).context("Could not dup2(/dev/null, 0)")?;

    dup2(2, 1).context("Could not dup2(2, 1)")?;

    Ok(r)
}

fn pipe_fds_to_files(pipe: InOut<Fd>) -> Result<InOut<std::fs::File>> {
    // SAFETY: both descriptors were just returned by dup and are owned by
    // nothing else.
    Ok(InOut {
        in_: unsafe { std::fs::File::from_raw_fd(pipe.in_) },
        out: unsafe { std::fs::File::from_raw_fd(pipe.out) },
    })
}

trait ProviderMainError<T> {
    type V;
    fn unwrap_or_exit(self) -> Self::V;
}
impl<T> ProviderMainError<Result<T>> for Result<T> {
    type V = T;
    fn unwrap_or_exit(self) -> T {
        match self {
            Ok(v) => v,
            Err(e) => {
                eprintln!("Error: {:?}", e);
                std::process::exit(1);
            }
        }
    }
}
