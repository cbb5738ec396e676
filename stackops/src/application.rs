use anyhow::Result;
use stackops_core::stack_api::StackService;
use stackops_provider::client::{ProviderConfig, StackProviderClient};
use std::future::Future;
use std::process::exit;
use std::sync::Arc;

/// Create the single-threaded tokio runtime used by the CLI.
///
/// Panics if the runtime cannot be created.
pub fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to initialize tokio runtime")
}

/// Handle a Result, printing the error and exiting with code 1 on failure.
pub fn handle_result(r: Result<()>) {
    match r {
        Ok(()) => {}
        Err(e) => {
            eprintln!("stackops error: {:?}", e);
            exit(1);
        }
    }
}

/// Run `f` against a stack provider process, and shut the provider down
/// afterwards.
pub async fn with_provider<F, Fut, R>(config: &ProviderConfig, f: F) -> Result<R>
where
    F: FnOnce(Arc<dyn StackService>) -> Fut,
    Fut: Future<Output = Result<R>>,
{
    let client = Arc::new(StackProviderClient::spawn(config)?);
    tracing::debug!(provider = %config.provider_executable, "provider started");
    let result = f(client.clone()).await;
    let cleanup_result = client.close().await;
    and_cleanup(result, cleanup_result)
}

/// Combine a primary result with a cleanup result, preserving both errors if both fail.
pub fn and_cleanup<T>(primary: Result<T>, cleanup: Result<()>) -> Result<T> {
    match (primary, cleanup) {
        (Ok(r), Ok(())) => Ok(r),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e1), Err(e2)) => Err(e1.context(format!("Additionally, cleanup failed: {}", e2))),
    }
}
