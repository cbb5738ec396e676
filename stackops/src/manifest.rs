//! The deployment manifest, `stackops.yaml`.
//!
//! ```yaml
//! app: shop
//! env: prod
//! workload: api
//! template: build/api.yaml
//! patches: [patches/sidecar.yaml]
//! overrides: [overrides/ulimits.yaml]
//! parameters:
//!   ImageTag: v42
//! uploads:
//!   - kind: command
//!     name: image
//!     argv: [docker, push, registry.example/shop/api:v42]
//! transform: [python3, hatch.py]
//! ```
//!
//! Relative paths are resolved against the manifest's directory.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use stackops_core::{pointer::Pointer, stack_api::StackName};
use stackops_provider::client::ProviderConfig;

use crate::orchestrator::retry::RetryPolicy;

pub const DEFAULT_MANIFEST: &str = "stackops.yaml";
pub const PROVIDER_ENV_VAR: &str = "STACKOPS_PROVIDER";
const DEFAULT_PROVIDER: &str = "stackops-provider-local";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Manifest {
    pub app: String,
    pub env: String,
    pub workload: String,
    /// The compiled template.
    pub template: PathBuf,
    #[serde(default)]
    pub patches: Vec<PathBuf>,
    #[serde(default)]
    pub overrides: Vec<PathBuf>,
    /// Where override paths are rooted in the template.
    #[serde(default = "default_override_base")]
    pub override_base: Pointer,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub role_arn: Option<String>,
    #[serde(default)]
    pub uploads: Vec<UploadSpec>,
    /// Escape hatch: a command that rewrites the rendered template.
    #[serde(default)]
    pub transform: Option<Vec<String>>,
    #[serde(default)]
    pub provider: Option<ProviderSpec>,
    #[serde(default)]
    pub deploy: DeploySettings,
    #[serde(default)]
    pub watch: WatchSettings,

    /// Directory of the manifest file; relative paths are resolved against it.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

/// Selects the manifest for commands that work on a workload.
#[derive(clap::Args, Debug, Clone)]
pub struct ManifestArgs {
    /// The deployment manifest
    #[arg(long, short = 'm', default_value = DEFAULT_MANIFEST)]
    pub manifest: PathBuf,
}

impl ManifestArgs {
    pub fn load(&self) -> Result<Manifest> {
        Manifest::load(&self.manifest)
    }
}

fn default_override_base() -> Pointer {
    Pointer::from_tokens(["Resources", "TaskDefinition", "Properties"])
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", deny_unknown_fields)]
pub enum UploadSpec {
    /// Run a command, e.g. an image push.
    Command { name: String, argv: Vec<String> },
    /// Copy files into an artifact directory.
    Files {
        name: String,
        files: Vec<PathBuf>,
        destination: PathBuf,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProviderSpec {
    pub executable: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct DeploySettings {
    pub timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub retry_attempts: u32,
    pub retry_initial_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for DeploySettings {
    fn default() -> Self {
        DeploySettings {
            timeout_secs: 30 * 60,
            poll_interval_ms: 2_000,
            retry_attempts: 5,
            retry_initial_delay_ms: 500,
            retry_max_delay_ms: 10_000,
        }
    }
}

impl DeploySettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retry_attempts.max(1),
            initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct WatchSettings {
    /// Extra paths whose changes trigger a redeploy.
    pub paths: Vec<PathBuf>,
    pub debounce_ms: u64,
    pub buffer: usize,
}

impl Default for WatchSettings {
    fn default() -> Self {
        WatchSettings {
            paths: Vec::new(),
            debounce_ms: 300,
            buffer: 1024,
        }
    }
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Manifest> {
        let body = std::fs::read_to_string(path)
            .with_context(|| format!("reading manifest {}", path.display()))?;
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Self::parse(&body, base_dir).with_context(|| format!("parsing manifest {}", path.display()))
    }

    pub fn parse(body: &str, base_dir: PathBuf) -> Result<Manifest> {
        let mut manifest: Manifest = serde_yaml::from_str(body)?;
        manifest.base_dir = base_dir;
        if let Some(argv) = &manifest.transform {
            if argv.is_empty() {
                bail!("transform must name a command");
            }
        }
        for upload in &manifest.uploads {
            if let UploadSpec::Command { name, argv } = upload {
                if argv.is_empty() {
                    bail!("upload {} must name a command", name);
                }
            }
        }
        manifest.stack_name()?;
        Ok(manifest)
    }

    pub fn stack_name(&self) -> Result<StackName> {
        StackName::for_workload(&self.app, &self.env, &self.workload)
    }

    /// The stack that holds the environment's shared resources.
    pub fn environment_stack_name(&self) -> Result<StackName> {
        StackName::new(format!("{}-{}", self.app, self.env))
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        self.base_dir.join(path)
    }

    pub fn template_path(&self) -> PathBuf {
        self.resolve(&self.template)
    }

    pub fn patch_paths(&self) -> Vec<PathBuf> {
        self.patches.iter().map(|p| self.resolve(p)).collect()
    }

    pub fn override_paths(&self) -> Vec<PathBuf> {
        self.overrides.iter().map(|p| self.resolve(p)).collect()
    }

    /// Every file the rendered template is made from.
    pub fn input_files(&self) -> Vec<PathBuf> {
        let mut files = vec![self.template_path()];
        files.extend(self.patch_paths());
        files.extend(self.override_paths());
        files
    }

    /// The manifest's provider, else `$STACKOPS_PROVIDER`, else the local
    /// provider.
    pub fn provider_config(&self) -> ProviderConfig {
        provider_config(self.provider.as_ref())
    }
}

pub fn provider_config(spec: Option<&ProviderSpec>) -> ProviderConfig {
    match spec {
        Some(spec) => ProviderConfig {
            provider_executable: spec.executable.clone(),
            provider_args: spec.args.clone(),
        },
        None => ProviderConfig {
            provider_executable: std::env::var(PROVIDER_ENV_VAR)
                .unwrap_or_else(|_| DEFAULT_PROVIDER.to_string()),
            provider_args: Vec::new(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_manifest() {
        let manifest = Manifest::parse(
            "app: shop\nenv: prod\nworkload: api\ntemplate: build/api.yaml\n",
            PathBuf::from("/work"),
        )
        .unwrap();
        assert_eq!(manifest.stack_name().unwrap().as_str(), "shop-prod-api");
        assert_eq!(manifest.environment_stack_name().unwrap().as_str(), "shop-prod");
        assert_eq!(manifest.template_path(), PathBuf::from("/work/build/api.yaml"));
        assert_eq!(
            manifest.override_base.to_string(),
            "/Resources/TaskDefinition/Properties"
        );
        assert_eq!(manifest.deploy, DeploySettings::default());
        assert_eq!(manifest.watch.debounce_ms, 300);
    }

    #[test]
    fn full_manifest() {
        let manifest = Manifest::parse(
            r#"
app: shop
env: test
workload: worker
template: build/worker.yaml
patches: [patches/a.yaml, patches/b.json]
overrides: [overrides/c.yaml]
overrideBase: ""
parameters:
  ImageTag: v42
roleArn: arn:aws:iam::123456789012:role/deploy
uploads:
  - kind: command
    name: image
    argv: [docker, push, example/worker:v42]
  - kind: files
    name: assets
    files: [static/app.js]
    destination: artifacts
transform: [python3, hatch.py]
provider:
  executable: my-provider
  args: [--region, eu-west-1]
deploy:
  timeoutSecs: 60
  retryAttempts: 2
"#,
            PathBuf::from("proj"),
        )
        .unwrap();
        assert!(manifest.override_base.is_root());
        assert_eq!(
            manifest.input_files(),
            vec![
                PathBuf::from("proj/build/worker.yaml"),
                PathBuf::from("proj/patches/a.yaml"),
                PathBuf::from("proj/patches/b.json"),
                PathBuf::from("proj/overrides/c.yaml"),
            ]
        );
        assert_eq!(manifest.uploads.len(), 2);
        assert_eq!(manifest.deploy.timeout(), Duration::from_secs(60));
        assert_eq!(manifest.deploy.poll_interval(), Duration::from_secs(2));
        assert_eq!(manifest.deploy.retry_policy().attempts, 2);
        let provider = manifest.provider_config();
        assert_eq!(provider.provider_executable, "my-provider");
        assert_eq!(provider.provider_args, vec!["--region", "eu-west-1"]);
    }

    #[test]
    fn rejects_bad_manifests() {
        let base = || PathBuf::from(".");
        // invalid stack name
        assert!(Manifest::parse("app: shop\nenv: prod\nworkload: a_b\ntemplate: t\n", base()).is_err());
        // unknown field
        assert!(Manifest::parse(
            "app: shop\nenv: prod\nworkload: api\ntemplate: t\ntemplates: []\n",
            base()
        )
        .is_err());
        // empty transform
        assert!(Manifest::parse(
            "app: shop\nenv: prod\nworkload: api\ntemplate: t\ntransform: []\n",
            base()
        )
        .is_err());
        // bad pointer
        assert!(Manifest::parse(
            "app: shop\nenv: prod\nworkload: api\ntemplate: t\noverrideBase: Resources\n",
            base()
        )
        .is_err());
    }
}
