use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use stackops_core::stack_api::{DeployFlags, DeploymentRequest};

use crate::{
    application::with_provider,
    interrupt::InterruptState,
    manifest::{Manifest, ManifestArgs},
    orchestrator::{upload::steps_from_manifest, DeployOutcome, Orchestrator},
    template::{prepare_template, TemplateInputs},
    watching::{ChangeFeed, Relevance},
};

#[derive(clap::Parser, Debug)]
pub(crate) struct Args {
    #[command(flatten)]
    manifest: ManifestArgs,

    /// Leave a failed stack as it is instead of rolling it back, so that it
    /// can be inspected
    #[arg(long)]
    disable_rollback: bool,

    /// Bypass the stack's drift and ownership checks
    #[arg(long)]
    force: bool,

    /// Keep running, and redeploy whenever an input file changes
    #[arg(long)]
    watch: bool,
}

impl Args {
    fn flags(&self) -> DeployFlags {
        DeployFlags {
            disable_rollback: self.disable_rollback,
            force: self.force,
        }
    }
}

/// Run the `deploy` command.
pub(crate) async fn deploy(interrupt_state: &InterruptState, args: &Args) -> Result<()> {
    let manifest = args.manifest.load()?;
    with_provider(&manifest.provider_config(), |service| async move {
        let orchestrator = Orchestrator::new(
            service,
            (&manifest.deploy).into(),
            interrupt_state.clone(),
        );
        if args.watch {
            watch_and_redeploy(
                interrupt_state,
                &orchestrator,
                &args.manifest.manifest,
                manifest,
                args.flags(),
            )
            .await
        } else {
            deploy_once(&orchestrator, &manifest, args.flags())
                .await
                .map(|_| ())
        }
    })
    .await
}

/// Prepare the template and drive one deployment of the manifest's stack.
pub(crate) async fn deploy_once(
    orchestrator: &Orchestrator,
    manifest: &Manifest,
    flags: DeployFlags,
) -> Result<DeployOutcome> {
    let stack_name = manifest.stack_name()?;
    let template_body = prepare_template(&TemplateInputs::from_manifest(manifest))
        .await
        .with_context(|| format!("preparing the template for stack {}", stack_name))?;
    let request = DeploymentRequest {
        stack_name,
        template_body,
        parameters: manifest.parameters.clone(),
        role_arn: manifest.role_arn.clone(),
        tags: manifest.tags.clone(),
        flags,
    };
    let uploads = steps_from_manifest(&manifest.uploads, &manifest.base_dir);
    let outcome = orchestrator.deploy(&request, uploads).await?;
    report(&outcome);
    Ok(outcome)
}

fn report(outcome: &DeployOutcome) {
    match outcome {
        DeployOutcome::NoChanges { stack } => {
            eprintln!("Stack {} is up to date; nothing to deploy.", stack)
        }
        DeployOutcome::Deployed { stack, change_set } => {
            eprintln!("Deployed stack {} (change set {}).", stack, change_set)
        }
    }
}

/// The files a manifest's deploy depends on, and how to watch them.
#[derive(Debug, Clone, PartialEq, Eq)]
struct WatchPlan {
    relevance: Relevance,
    roots: Vec<PathBuf>,
    buffer: usize,
    debounce: Duration,
}

impl WatchPlan {
    fn for_manifest(manifest: &Manifest, manifest_path: &Path) -> Self {
        let mut files = manifest.input_files();
        files.push(manifest_path.to_path_buf());
        let trees: Vec<_> = manifest.watch.paths.iter().map(|p| manifest.resolve(p)).collect();
        let relevance = Relevance::new(&files, &trees);
        WatchPlan {
            roots: relevance.watch_roots(),
            relevance,
            buffer: manifest.watch.buffer,
            debounce: Duration::from_millis(manifest.watch.debounce_ms),
        }
    }

    fn start(&self) -> Result<ChangeFeed> {
        ChangeFeed::start(&self.roots, self.buffer)
    }
}

async fn watch_and_redeploy(
    interrupt_state: &InterruptState,
    orchestrator: &Orchestrator,
    manifest_path: &Path,
    mut manifest: Manifest,
    flags: DeployFlags,
) -> Result<()> {
    // A failed deploy does not end the watch.
    if let Err(e) = deploy_once(orchestrator, &manifest, flags).await {
        eprintln!("stackops error: {:?}", e);
    }

    let mut plan = WatchPlan::for_manifest(&manifest, manifest_path);
    let mut feed = plan.start()?;
    eprintln!("Watching for changes; press Ctrl-C to stop.");

    loop {
        let batch = tokio::select! {
            batch = feed.next_batch(plan.debounce) => batch,
            _ = interrupt_state.interrupted() => break,
        };
        let Some(batch) = batch else {
            tracing::warn!("the file watcher stopped");
            break;
        };
        let changed: Vec<_> = batch.iter().filter(|e| plan.relevance.matches(e)).collect();
        if changed.is_empty() {
            continue;
        }
        for event in &changed {
            tracing::info!(path = %event.path.display(), kind = %event.kind, "input changed");
        }

        match Manifest::load(manifest_path) {
            Ok(reloaded) => {
                manifest = reloaded;
                let next = WatchPlan::for_manifest(&manifest, manifest_path);
                if next != plan {
                    match next.start() {
                        Ok(next_feed) => {
                            tracing::info!(roots = ?next.roots, "watching the reloaded manifest's inputs");
                            // Dropping the old feed stops it.
                            feed = next_feed;
                            plan = next;
                        }
                        Err(e) => eprintln!(
                            "stackops error: {:?}",
                            e.context("keeping the previous set of watched files")
                        ),
                    }
                }
            }
            Err(e) => {
                eprintln!("stackops error: {:?}", e.context("keeping the previous manifest"));
            }
        }
        if let Err(e) = deploy_once(orchestrator, &manifest, flags).await {
            eprintln!("stackops error: {:?}", e);
        }
    }
    feed.stop();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{fake::FakeStackService, OrchestratorSettings};
    use stackops_watch::{WatchEvent, WatchEventKind};
    use std::sync::Arc;

    fn project(dir: &Path) -> Manifest {
        std::fs::create_dir_all(dir.join("build")).unwrap();
        std::fs::write(
            dir.join("build/api.yaml"),
            "Resources:\n  TaskDefinition:\n    Type: AWS::ECS::TaskDefinition\n    Properties:\n      Family: shop-prod-api\n",
        )
        .unwrap();
        std::fs::write(
            dir.join("cpu.yaml"),
            "- op: add\n  path: /Resources/TaskDefinition/Properties/Cpu\n  value: 256\n",
        )
        .unwrap();
        Manifest::parse(
            "app: shop\nenv: prod\nworkload: api\ntemplate: build/api.yaml\npatches: [cpu.yaml]\nparameters:\n  ImageTag: v1\n",
            dir.to_path_buf(),
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn deploys_the_prepared_template_once() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = project(dir.path());
        let service = Arc::new(FakeStackService::new());
        let orchestrator = Orchestrator::new(
            service.clone(),
            OrchestratorSettings::from(&manifest.deploy),
            InterruptState::new(),
        );

        let outcome = deploy_once(&orchestrator, &manifest, DeployFlags::default())
            .await
            .unwrap();
        assert!(matches!(outcome, DeployOutcome::Deployed { .. }));
        let deployed = service
            .deployed_template(&manifest.stack_name().unwrap())
            .unwrap();
        assert!(deployed.contains("Cpu: 256"), "{}", deployed);

        let outcome = deploy_once(&orchestrator, &manifest, DeployFlags::default())
            .await
            .unwrap();
        assert!(matches!(outcome, DeployOutcome::NoChanges { .. }));
    }

    #[tokio::test]
    async fn authoring_errors_stop_before_the_remote() {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = project(dir.path());
        manifest.patches = vec![PathBuf::from("missing.yaml")];
        let service = Arc::new(FakeStackService::new());
        let orchestrator = Orchestrator::new(
            service.clone(),
            OrchestratorSettings::from(&manifest.deploy),
            InterruptState::new(),
        );
        let err = deploy_once(&orchestrator, &manifest, DeployFlags::default())
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("shop-prod-api"), "{:#}", err);
        assert!(service.calls().is_empty());
    }

    #[test]
    fn watch_plan_follows_the_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let manifest_path = dir.path().join("stackops.yaml");
        let mut manifest = project(dir.path());
        let plan = WatchPlan::for_manifest(&manifest, &manifest_path);
        let event = |path: PathBuf| WatchEvent {
            path,
            kind: WatchEventKind::Write,
        };
        assert!(plan.relevance.matches(&event(dir.path().join("cpu.yaml"))));
        assert!(plan.relevance.matches(&event(manifest_path.clone())));
        assert!(!plan.relevance.matches(&event(dir.path().join("overrides/mem.yaml"))));
        assert_eq!(plan, WatchPlan::for_manifest(&manifest, &manifest_path));

        manifest.overrides = vec![PathBuf::from("overrides/mem.yaml")];
        manifest.watch.paths = vec![PathBuf::from("assets")];
        manifest.watch.debounce_ms = 50;
        let next = WatchPlan::for_manifest(&manifest, &manifest_path);
        assert_ne!(next, plan);
        assert!(next.relevance.matches(&event(dir.path().join("overrides/mem.yaml"))));
        assert!(next.relevance.matches(&event(dir.path().join("assets/logo.png"))));
        assert!(next.roots.contains(&dir.path().join("overrides")));
        assert!(next.roots.contains(&dir.path().join("assets")));
        assert_eq!(next.debounce, Duration::from_millis(50));
    }
}
