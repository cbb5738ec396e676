//! Artifact uploads that must land before the stack can reference them.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::{process::Command, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::Instrument as _;

use crate::manifest::UploadSpec;

#[async_trait]
pub trait UploadStep: Send + Sync {
    fn name(&self) -> &str;

    /// Perform the upload. Must return promptly once `cancel` fires.
    async fn run(&self, cancel: CancellationToken) -> Result<()>;
}

#[derive(Debug, thiserror::Error)]
#[error("upload cancelled")]
pub struct Cancelled;

/// Runs an external command, such as a container image push.
pub struct CommandStep {
    pub name: String,
    pub argv: Vec<String>,
    pub working_dir: PathBuf,
}

#[async_trait]
impl UploadStep for CommandStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let Some((program, args)) = self.argv.split_first() else {
            bail!("upload {} has an empty command", self.name);
        };
        let mut child = Command::new(program)
            .args(args)
            .current_dir(&self.working_dir)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Could not start {}", program))?;
        tokio::select! {
            status = child.wait() => {
                let status = status.with_context(|| format!("waiting for {}", program))?;
                if !status.success() {
                    bail!("{} failed with {}", program, status);
                }
                Ok(())
            }
            _ = cancel.cancelled() => {
                tracing::info!(step = %self.name, "stopping {}", program);
                child.kill().await.with_context(|| format!("killing {}", program))?;
                Err(Cancelled.into())
            }
        }
    }
}

/// Copies files into an artifact directory.
pub struct FileUploadStep {
    pub name: String,
    pub files: Vec<PathBuf>,
    pub destination: PathBuf,
}

#[async_trait]
impl UploadStep for FileUploadStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        tokio::fs::create_dir_all(&self.destination)
            .await
            .with_context(|| format!("creating {}", self.destination.display()))?;
        for file in &self.files {
            if cancel.is_cancelled() {
                return Err(Cancelled.into());
            }
            let Some(file_name) = file.file_name() else {
                bail!("{} does not name a file", file.display());
            };
            let target = self.destination.join(file_name);
            tokio::fs::copy(file, &target)
                .await
                .with_context(|| format!("copying {} to {}", file.display(), target.display()))?;
            tracing::debug!(step = %self.name, file = %file.display(), "uploaded");
        }
        Ok(())
    }
}

/// Build the steps a manifest asks for.
pub fn steps_from_manifest(uploads: &[UploadSpec], base_dir: &Path) -> Vec<Arc<dyn UploadStep>> {
    uploads
        .iter()
        .map(|spec| -> Arc<dyn UploadStep> {
            match spec {
                UploadSpec::Command { name, argv } => Arc::new(CommandStep {
                    name: name.clone(),
                    argv: argv.clone(),
                    working_dir: base_dir.to_path_buf(),
                }),
                UploadSpec::Files {
                    name,
                    files,
                    destination,
                } => Arc::new(FileUploadStep {
                    name: name.clone(),
                    files: files.iter().map(|f| base_dir.join(f)).collect(),
                    destination: base_dir.join(destination),
                }),
            }
        })
        .collect()
}

#[derive(Debug)]
pub struct UploadFailure {
    pub step: String,
    pub error: anyhow::Error,
}

impl UploadFailure {
    /// The step stopped because it was told to, not because it failed.
    pub fn was_cancelled(&self) -> bool {
        self.error.is::<Cancelled>()
    }
}

/// Run all steps concurrently. The first failure cancels the others; every
/// task is joined before returning, and the first failure is reported.
pub async fn run_all(
    steps: Vec<Arc<dyn UploadStep>>,
    cancel: CancellationToken,
) -> Result<(), UploadFailure> {
    let mut tasks = JoinSet::new();
    for step in steps {
        let cancel = cancel.clone();
        let span = tracing::info_span!("upload", step = %step.name());
        tasks.spawn(
            async move {
                let r = step.run(cancel).await;
                (step.name().to_string(), r)
            }
            .instrument(span),
        );
    }

    let mut first_failure: Option<UploadFailure> = None;
    while let Some(joined) = tasks.join_next().await {
        let (step, result) = match joined {
            Ok(r) => r,
            Err(e) => ("<task>".to_string(), Err(anyhow::Error::new(e))),
        };
        match result {
            Ok(()) => tracing::info!(step = %step, "upload done"),
            Err(error) => {
                if first_failure.is_none() {
                    tracing::warn!(step = %step, "upload failed, cancelling the others");
                    cancel.cancel();
                    first_failure = Some(UploadFailure { step, error });
                } else {
                    tracing::debug!(step = %step, "upload stopped: {:#}", error);
                }
            }
        }
    }
    match first_failure {
        Some(failure) => Err(failure),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::atomic::{AtomicBool, Ordering},
        time::Duration,
    };

    struct Failing;

    #[async_trait]
    impl UploadStep for Failing {
        fn name(&self) -> &str {
            "failing"
        }
        async fn run(&self, _cancel: CancellationToken) -> Result<()> {
            tokio::time::sleep(Duration::from_millis(10)).await;
            bail!("registry refused the image")
        }
    }

    #[derive(Default)]
    struct Patient {
        saw_cancel: AtomicBool,
    }

    #[async_trait]
    impl UploadStep for Patient {
        fn name(&self) -> &str {
            "patient"
        }
        async fn run(&self, cancel: CancellationToken) -> Result<()> {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(3600)) => Ok(()),
                _ = cancel.cancelled() => {
                    self.saw_cancel.store(true, Ordering::SeqCst);
                    Err(Cancelled.into())
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_failure_cancels_siblings() {
        let patient = Arc::new(Patient::default());
        let cancel = CancellationToken::new();
        let steps: Vec<Arc<dyn UploadStep>> = vec![patient.clone(), Arc::new(Failing)];
        let failure = run_all(steps, cancel.clone()).await.unwrap_err();
        assert_eq!(failure.step, "failing");
        assert!(failure.error.to_string().contains("registry refused"));
        // joined, not abandoned
        assert!(patient.saw_cancel.load(Ordering::SeqCst));
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn all_succeed() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("app.js");
        std::fs::write(&src, "console.log(1)").unwrap();
        let steps: Vec<Arc<dyn UploadStep>> = vec![
            Arc::new(FileUploadStep {
                name: "assets".to_string(),
                files: vec![src],
                destination: dir.path().join("out/static"),
            }),
            Arc::new(CommandStep {
                name: "image".to_string(),
                argv: vec!["true".to_string()],
                working_dir: dir.path().to_path_buf(),
            }),
        ];
        run_all(steps, CancellationToken::new()).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("out/static/app.js")).unwrap(),
            "console.log(1)"
        );
    }

    #[tokio::test]
    async fn command_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let step: Arc<dyn UploadStep> = Arc::new(CommandStep {
            name: "image".to_string(),
            argv: vec!["sh".to_string(), "-c".to_string(), "exit 4".to_string()],
            working_dir: dir.path().to_path_buf(),
        });
        let failure = run_all(vec![step], CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(failure.step, "image");
        assert!(failure.error.to_string().contains("failed"));
    }

    #[tokio::test]
    async fn cancelled_command_is_killed() {
        let dir = tempfile::tempdir().unwrap();
        let step = CommandStep {
            name: "slow".to_string(),
            argv: vec!["sleep".to_string(), "600".to_string()],
            working_dir: dir.path().to_path_buf(),
        };
        let cancel = CancellationToken::new();
        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();
            })
        };
        let err = step.run(cancel).await.unwrap_err();
        assert!(err.is::<Cancelled>());
        canceller.await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_file_upload_stops_early() {
        let dir = tempfile::tempdir().unwrap();
        let step = FileUploadStep {
            name: "assets".to_string(),
            files: vec![dir.path().join("does-not-matter")],
            destination: dir.path().join("out"),
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = step.run(cancel).await.unwrap_err();
        assert!(err.is::<Cancelled>());
    }

    #[test]
    fn manifest_steps() {
        let steps = steps_from_manifest(
            &[
                UploadSpec::Command {
                    name: "image".to_string(),
                    argv: vec!["docker".to_string(), "push".to_string()],
                },
                UploadSpec::Files {
                    name: "assets".to_string(),
                    files: vec![PathBuf::from("a.js")],
                    destination: PathBuf::from("out"),
                },
            ],
            Path::new("/proj"),
        );
        let names: Vec<_> = steps.iter().map(|s| s.name().to_string()).collect();
        assert_eq!(names, vec!["image", "assets"]);
    }
}
