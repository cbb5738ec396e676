use std::{path::PathBuf, time::Duration};

use anyhow::Result;

use crate::{interrupt::InterruptState, watching::ChangeFeed};

#[derive(clap::Parser, Debug)]
pub(crate) struct Args {
    /// Files or directories to watch; directories are watched recursively
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// How many events to buffer while the output is blocked
    #[arg(long, default_value_t = 1024)]
    buffer: usize,
}

/// Run the `watch` command: print one line per filesystem event until
/// interrupted.
pub(crate) async fn watch(interrupt_state: &InterruptState, args: &Args) -> Result<()> {
    let mut feed = ChangeFeed::start(&args.paths, args.buffer)?;
    loop {
        let batch = tokio::select! {
            batch = feed.next_batch(Duration::ZERO) => batch,
            _ = interrupt_state.interrupted() => break,
        };
        let Some(batch) = batch else { break };
        for event in batch {
            println!("{}\t{}", event.kind, event.path.display());
        }
    }
    feed.stop();
    Ok(())
}
