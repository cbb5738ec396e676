//! Turning the compiled template and the operator's adjustments into the
//! body that is submitted to the stack service.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;
use stackops_core::{
    document::{load_document, render_yaml},
    overrides::{apply_overrides, load_override_rules, Denylist},
    patch::{apply_patch_set, load_patch_set, PatchOperation},
    pointer::{self, Pointer},
};

use crate::{escape_hatch, manifest::Manifest};

#[derive(Debug, Clone)]
pub struct TemplateInputs {
    pub template: PathBuf,
    pub patches: Vec<PathBuf>,
    pub overrides: Vec<PathBuf>,
    pub override_base: Pointer,
    pub transform: Option<Vec<String>>,
    /// Where the transform runs.
    pub working_dir: PathBuf,
}

impl TemplateInputs {
    pub fn from_manifest(manifest: &Manifest) -> Self {
        TemplateInputs {
            template: manifest.template_path(),
            patches: manifest.patch_paths(),
            overrides: manifest.override_paths(),
            override_base: manifest.override_base.clone(),
            transform: manifest.transform.clone(),
            working_dir: manifest.base_dir.clone(),
        }
    }
}

/// Apply every patch file in order.
pub fn apply_patch_files(mut document: Value, files: &[PathBuf]) -> Result<Value> {
    for file in files {
        let patch_set = load_patch_set(file)?;
        document = apply_patch_set(&document, &patch_set)
            .with_context(|| format!("applying patch file {}", file.display()))?;
    }
    Ok(document)
}

/// Apply every override file in order, with paths rooted at `base`.
pub fn apply_override_files(mut document: Value, files: &[PathBuf], base: &Pointer) -> Result<Value> {
    if files.is_empty() {
        return Ok(document);
    }
    let denylist = Denylist::task_definition();
    for file in files {
        let rules = load_override_rules(file)?;
        let target = pointer::get(&document, base)
            .with_context(|| format!("override base {} is not in the template", base))?;
        let updated = apply_overrides(target, &rules, &denylist)
            .with_context(|| format!("applying override file {}", file.display()))?;
        document = replace_at(&document, base, updated)?;
    }
    Ok(document)
}

fn replace_at(document: &Value, at: &Pointer, value: Value) -> Result<Value> {
    let replace = PatchOperation::Replace {
        path: at.clone(),
        value,
    };
    Ok(apply_patch_set(document, &[replace])?)
}

/// Load, patch, override and transform the template, then render the body.
pub async fn prepare_template(inputs: &TemplateInputs) -> Result<String> {
    let document = load_document(&inputs.template)?;
    let document = apply_patch_files(document, &inputs.patches)?;
    let document = apply_override_files(document, &inputs.overrides, &inputs.override_base)?;
    let document = match &inputs.transform {
        Some(argv) => {
            let body = render_yaml(&document)?;
            escape_hatch::transform(argv, &inputs.working_dir, &body).await?
        }
        None => document,
    };
    Ok(render_yaml(&document)?)
}

pub fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn write_output(body: &str, output: Option<&Path>) -> Result<()> {
    match output {
        Some(path) => {
            std::fs::write(path, body).with_context(|| format!("writing {}", path.display()))
        }
        None => {
            print!("{}", body);
            Ok(())
        }
    }
}
