//! A stack provider that keeps each stack as a journal file in
//! `$STACKOPS_LOCAL_STATE_DIR` (default `./.stackops-state`).

use std::path::PathBuf;

use stackops_provider::framework::run_main;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

mod stacks;
mod state;

use stacks::LocalStackProvider;

const STATE_DIR_VAR: &str = "STACKOPS_LOCAL_STATE_DIR";
const DEFAULT_STATE_DIR: &str = ".stackops-state";

fn main() {
    // stdout belongs to the protocol; logs go to stderr.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .init();

    let dir = std::env::var_os(STATE_DIR_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR));
    tracing::debug!(dir = %dir.display(), "serving stacks");
    run_main(LocalStackProvider::new(dir))
}
