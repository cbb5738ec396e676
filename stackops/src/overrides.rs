use std::path::PathBuf;

use anyhow::Result;
use stackops_core::{
    document::{load_document, render_yaml},
    pointer::Pointer,
};

use crate::template::{apply_override_files, write_output};

#[derive(clap::Parser, Debug)]
pub(crate) struct Args {
    /// The template to modify, as JSON or YAML
    template: PathBuf,

    /// An override file; repeat to apply several, in order
    #[arg(long = "file", short = 'f', required = true)]
    files: Vec<PathBuf>,

    /// Where override paths start, as a JSON pointer
    #[arg(long, default_value = "/Resources/TaskDefinition/Properties")]
    base: Pointer,

    /// Write the result to this file instead of stdout
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,
}

/// Run the `override` command.
pub(crate) fn apply(args: &Args) -> Result<()> {
    let document = load_document(&args.template)?;
    let document = apply_override_files(document, &args.files, &args.base)?;
    write_output(&render_yaml(&document)?, args.output.as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stackops_core::document::parse_document;

    #[test]
    fn overrides_below_the_base() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("t.json");
        std::fs::write(&template, r#"{"Resources": {"Svc": {"Properties": {}}}}"#).unwrap();
        let rules = dir.path().join("o.yaml");
        std::fs::write(&rules, "- path: a.b[-].c\n  value: 1\n").unwrap();
        let output = dir.path().join("out.yaml");
        apply(&Args {
            template,
            files: vec![rules],
            base: "/Resources/Svc/Properties".parse().unwrap(),
            output: Some(output.clone()),
        })
        .unwrap();
        let doc = parse_document(&std::fs::read_to_string(output).unwrap()).unwrap();
        assert_eq!(
            doc["Resources"]["Svc"]["Properties"],
            json!({"a": {"b": [{"c": 1}]}})
        );
    }
}
