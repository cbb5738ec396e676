use std::path::PathBuf;

use anyhow::Result;
use stackops_core::document::{load_document, render_yaml};

use crate::template::{apply_patch_files, display_paths, write_output};

#[derive(clap::Parser, Debug)]
pub(crate) struct Args {
    /// The template to patch, as JSON or YAML
    template: PathBuf,

    /// A patch set file; repeat to apply several, in order
    #[arg(long = "patch", short = 'p', required = true)]
    patches: Vec<PathBuf>,

    /// Write the result to this file instead of stdout
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,
}

/// Run the `patch` command.
pub(crate) fn patch(args: &Args) -> Result<()> {
    let document = load_document(&args.template)?;
    tracing::info!(patches = %display_paths(&args.patches), "patching {}", args.template.display());
    let document = apply_patch_files(document, &args.patches)?;
    write_output(&render_yaml(&document)?, args.output.as_deref())
}
