use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use stackops_core::{
    stack_api::{DeployFlags, DeploymentRequest, StackName},
    text_patch::{ensure_permission, Anchor, PermissionPatch, TextPatch, Version},
};

use crate::{
    application::with_provider,
    interrupt::InterruptState,
    manifest::{Manifest, ManifestArgs},
    orchestrator::{retry::with_backoff, DeployOutcome, Orchestrator},
};

/// Environment templates before this version lack the listener permission.
const DEFAULT_THRESHOLD: &str = "v1.3.0";

const DEFAULT_STATEMENT: &str = "\
- Sid: DeleteLBListener
  Effect: Allow
  Action:
    - elasticloadbalancing:DeleteListener
  Resource: '*'
";

#[derive(clap::Parser, Debug)]
pub(crate) struct Args {
    #[command(flatten)]
    manifest: ManifestArgs,

    /// Templates older than this version get the statement
    #[arg(long, default_value = DEFAULT_THRESHOLD)]
    threshold: Version,

    /// A YAML file holding the statement to insert, written at column 0
    #[arg(long)]
    statement: Option<PathBuf>,

    /// Insert in front of this field instead of the environment manager
    /// role's first policy statement
    #[arg(long)]
    anchor: Option<Anchor>,

    /// Print the patched template instead of deploying it
    #[arg(long)]
    dry_run: bool,
}

impl Args {
    fn permission_patch(&self) -> Result<PermissionPatch> {
        let statement = match &self.statement {
            Some(path) => std::fs::read_to_string(path)
                .with_context(|| format!("reading statement {}", path.display()))?,
            None => DEFAULT_STATEMENT.to_string(),
        };
        let mut patch = PermissionPatch::environment_manager_statement(self.threshold, &statement);
        if let Some(anchor) = &self.anchor {
            patch.anchor = anchor.clone();
        }
        Ok(patch)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PermissionOutcome {
    AlreadyPresent,
    Patched(String),
    Deployed(DeployOutcome),
}

/// Run the `ensure-permission` command.
pub(crate) async fn run(interrupt_state: &InterruptState, args: &Args) -> Result<()> {
    let manifest = args.manifest.load()?;
    let patch = args.permission_patch()?;
    let stack = manifest.environment_stack_name()?;
    with_provider(&manifest.provider_config(), |service| async move {
        let orchestrator =
            Orchestrator::new(service, (&manifest.deploy).into(), interrupt_state.clone());
        let outcome = ensure(&orchestrator, &manifest, &stack, &patch, args.dry_run).await?;
        match outcome {
            PermissionOutcome::AlreadyPresent => eprintln!(
                "Stack {} already grants the permission (version {} or later); nothing to do.",
                stack, patch.gate.threshold
            ),
            PermissionOutcome::Patched(body) => print!("{}", body),
            PermissionOutcome::Deployed(_) => {
                eprintln!("Stack {} now grants the permission.", stack)
            }
        }
        Ok(())
    })
    .await
}

/// Add the permission to the deployed environment template unless it is
/// already there.
pub(crate) async fn ensure(
    orchestrator: &Orchestrator,
    manifest: &Manifest,
    stack: &StackName,
    patch: &PermissionPatch,
    dry_run: bool,
) -> Result<PermissionOutcome> {
    let service = orchestrator.service();
    let retry = manifest.deploy.retry_policy();
    let current = with_backoff(&retry, "readTemplate", || service.read_template(stack))
        .await
        .with_context(|| format!("reading the template of stack {}", stack))?;
    let Some(current) = current else {
        bail!("stack {} does not exist; deploy the environment first", stack);
    };

    let updated = match ensure_permission(&current, patch)
        .with_context(|| format!("patching the template of stack {}", stack))?
    {
        TextPatch::Noop => {
            tracing::info!(stack = %stack, threshold = %patch.gate.threshold, "permission already present");
            return Ok(PermissionOutcome::AlreadyPresent);
        }
        TextPatch::Updated(body) => body,
    };
    if dry_run {
        return Ok(PermissionOutcome::Patched(updated));
    }

    let description = with_backoff(&retry, "describeStack", || service.describe_stack(stack))
        .await
        .with_context(|| format!("describing stack {}", stack))?;
    let request = DeploymentRequest {
        stack_name: stack.clone(),
        template_body: updated,
        // Keep whatever the environment was deployed with.
        parameters: description.parameters,
        role_arn: manifest.role_arn.clone(),
        tags: manifest.tags.clone(),
        flags: DeployFlags::default(),
    };
    let outcome = orchestrator.deploy(&request, Vec::new()).await?;
    Ok(PermissionOutcome::Deployed(outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{fake::FakeStackService, OrchestratorSettings};
    use std::{path::Path, sync::Arc};

    const ENV_TEMPLATE: &str = "\
Metadata:
  Version: v1.2.0
Resources:
  # managed by the environment
  EnvironmentManagerRole:
    Type: AWS::IAM::Role
    Properties:
      Policies:
        - PolicyName: root
          PolicyDocument:
            Version: '2012-10-17'
            Statement:
              - Sid: CloudwatchLogs
                Effect: Allow
                Action: ['logs:*']
                Resource: '*'
";

    fn manifest() -> Manifest {
        Manifest::parse(
            "app: shop\nenv: prod\nworkload: api\ntemplate: t.yaml\n",
            Path::new(".").to_path_buf(),
        )
        .unwrap()
    }

    fn setup(template: Option<&str>) -> (Arc<FakeStackService>, Orchestrator, StackName) {
        let service = Arc::new(FakeStackService::new());
        let stack = manifest().environment_stack_name().unwrap();
        if let Some(template) = template {
            service.seed(&stack, template, [("Env".to_string(), "prod".to_string())].into());
        }
        let orchestrator = Orchestrator::new(
            service.clone(),
            OrchestratorSettings::from(&manifest().deploy),
            InterruptState::new(),
        );
        (service, orchestrator, stack)
    }

    fn patch(threshold: &str) -> PermissionPatch {
        PermissionPatch::environment_manager_statement(threshold.parse().unwrap(), DEFAULT_STATEMENT)
    }

    #[tokio::test(start_paused = true)]
    async fn patches_and_redeploys_old_templates() {
        let (service, orchestrator, stack) = setup(Some(ENV_TEMPLATE));
        let outcome = ensure(&orchestrator, &manifest(), &stack, &patch("v1.3.0"), false)
            .await
            .unwrap();
        assert!(matches!(outcome, PermissionOutcome::Deployed(DeployOutcome::Deployed { .. })));
        let deployed = service.deployed_template(&stack).unwrap();
        assert!(deployed.contains("              - Sid: DeleteLBListener\n"), "{}", deployed);
        // comments survive
        assert!(deployed.contains("# managed by the environment"));
        assert_eq!(service.deployed_parameters(&stack).unwrap()["Env"], "prod");
    }

    #[tokio::test(start_paused = true)]
    async fn current_templates_are_left_alone() {
        let (service, orchestrator, stack) = setup(Some(ENV_TEMPLATE));
        let outcome = ensure(&orchestrator, &manifest(), &stack, &patch("v1.2.0"), false)
            .await
            .unwrap();
        assert_eq!(outcome, PermissionOutcome::AlreadyPresent);
        assert_eq!(service.count("createChangeSet"), 0);
        assert_eq!(service.deployed_template(&stack).as_deref(), Some(ENV_TEMPLATE));
    }

    #[tokio::test(start_paused = true)]
    async fn dry_run_only_prints() {
        let (service, orchestrator, stack) = setup(Some(ENV_TEMPLATE));
        let outcome = ensure(&orchestrator, &manifest(), &stack, &patch("v2.0.0"), true)
            .await
            .unwrap();
        assert!(matches!(outcome, PermissionOutcome::Patched(ref body) if body.contains("DeleteLBListener")));
        assert_eq!(service.count("createChangeSet"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_stack_or_anchor() {
        let (_, orchestrator, stack) = setup(None);
        let err = ensure(&orchestrator, &manifest(), &stack, &patch("v1.3.0"), false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));

        let (service, orchestrator, stack) = setup(Some("Metadata:\n  Version: v1.0.0\nResources: {}\n"));
        let err = ensure(&orchestrator, &manifest(), &stack, &patch("v1.3.0"), false)
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("not found"), "{:#}", err);
        assert_eq!(service.count("createChangeSet"), 0);
    }
}
