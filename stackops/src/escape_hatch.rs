//! The escape hatch: an operator-supplied program that may rewrite the
//! rendered template in any way it likes.
//!
//! The program gets the template at `$STACKOPS_TEMPLATE_IN` and must write
//! its result to `$STACKOPS_TEMPLATE_OUT`. Both live in a fresh temporary
//! directory that is removed afterwards.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde_json::Value;
use stackops_core::document::parse_document;
use tokio::process::Command;

pub const TEMPLATE_IN_VAR: &str = "STACKOPS_TEMPLATE_IN";
pub const TEMPLATE_OUT_VAR: &str = "STACKOPS_TEMPLATE_OUT";

/// Run `argv` on `body` and return the document it produced.
pub async fn transform(argv: &[String], working_dir: &Path, body: &str) -> Result<Value> {
    let Some((program, args)) = argv.split_first() else {
        bail!("the transform command is empty");
    };
    let scratch = tempfile::Builder::new()
        .prefix("stackops-transform-")
        .tempdir()
        .context("creating a directory for the transform")?;
    let in_path = scratch.path().join("template.in.yaml");
    let out_path = scratch.path().join("template.out.yaml");
    tokio::fs::write(&in_path, body)
        .await
        .with_context(|| format!("writing {}", in_path.display()))?;

    tracing::info!(program = %program, "running template transform");
    let status = Command::new(program)
        .args(args)
        .current_dir(working_dir)
        .env(TEMPLATE_IN_VAR, &in_path)
        .env(TEMPLATE_OUT_VAR, &out_path)
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true)
        .status()
        .await
        .with_context(|| format!("Could not run transform {}", program))?;
    if !status.success() {
        bail!("transform {} failed with {}", program, status);
    }

    let out = match tokio::fs::read_to_string(&out_path).await {
        Ok(out) => out,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            bail!("transform {} did not write ${}", program, TEMPLATE_OUT_VAR)
        }
        Err(e) => return Err(e).with_context(|| format!("reading {}", out_path.display())),
    };
    parse_document(&out).with_context(|| format!("transform {} produced a malformed template", program))
}
