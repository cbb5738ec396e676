//! Feeding filesystem changes into the async redeploy loop.

use std::{
    collections::HashSet,
    path::{Component, Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::RecvTimeoutError,
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use anyhow::{Context, Result};
use stackops_watch::{RecursiveWatcher, WatchError, WatchEvent};
use tokio::sync::mpsc;

const STOP_TICK: Duration = Duration::from_millis(100);

/// Drop `.` components so that paths reported under a `.` root compare
/// equal to the paths they were derived from.
pub fn normalize(path: &Path) -> PathBuf {
    let normalized: PathBuf = path
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect();
    if normalized.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        normalized
    }
}

/// Which changes matter for a deploy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Relevance {
    files: HashSet<PathBuf>,
    trees: Vec<PathBuf>,
}

impl Relevance {
    pub fn new(files: &[PathBuf], trees: &[PathBuf]) -> Self {
        Relevance {
            files: files.iter().map(|f| normalize(f)).collect(),
            trees: trees.iter().map(|t| normalize(t)).collect(),
        }
    }

    pub fn matches(&self, event: &WatchEvent) -> bool {
        let path = normalize(&event.path);
        self.files.contains(&path) || self.trees.iter().any(|t| path.starts_with(t))
    }

    /// Directories to subscribe. Files are watched through their parent,
    /// since editors tend to replace files rather than write them.
    pub fn watch_roots(&self) -> Vec<PathBuf> {
        let mut roots: Vec<PathBuf> = Vec::new();
        let parents = self.files.iter().map(|f| match f.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        });
        for root in parents.chain(self.trees.iter().cloned()) {
            if !roots.contains(&root) {
                roots.push(root);
            }
        }
        roots.sort();
        roots
    }
}

/// A [`RecursiveWatcher`] running on its own thread, forwarding events to
/// async code.
pub struct ChangeFeed {
    events: mpsc::Receiver<WatchEvent>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ChangeFeed {
    pub fn start(roots: &[PathBuf], buffer: usize) -> Result<ChangeFeed> {
        let watcher = RecursiveWatcher::new(buffer).context("starting the file watcher")?;
        for root in roots {
            watcher
                .add(root)
                .with_context(|| format!("watching {}", root.display()))?;
            tracing::debug!(root = %root.display(), "watching");
        }
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let stop = Arc::new(AtomicBool::new(false));
        let thread = std::thread::Builder::new()
            .name("stackops-changes".to_string())
            .spawn({
                let stop = stop.clone();
                move || forward(watcher, tx, stop)
            })
            .context("starting the change forwarder")?;
        Ok(ChangeFeed {
            events: rx,
            stop,
            thread: Some(thread),
        })
    }

    /// Wait for a change, then keep collecting until nothing happened for
    /// `debounce`. `None` once the feed has ended.
    pub async fn next_batch(&mut self, debounce: Duration) -> Option<Vec<WatchEvent>> {
        let first = self.events.recv().await?;
        let mut batch = vec![first];
        loop {
            match tokio::time::timeout(debounce, self.events.recv()).await {
                Ok(Some(event)) => batch.push(event),
                Ok(None) | Err(_) => return Some(batch),
            }
        }
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        // Unblocks a forwarder stuck on a full channel.
        self.events.close();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("change forwarder panicked");
            }
        }
    }
}

impl Drop for ChangeFeed {
    fn drop(&mut self) {
        self.stop();
    }
}

fn forward(mut watcher: RecursiveWatcher, tx: mpsc::Sender<WatchEvent>, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::Acquire) {
        while let Ok(error) = watcher.errors().try_recv() {
            report(&error);
        }
        match watcher.events().recv_timeout(STOP_TICK) {
            Ok(event) => {
                tracing::debug!(path = %event.path.display(), kind = %event.kind, "change");
                if tx.blocking_send(event).is_err() {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    if let Err(e) = watcher.close() {
        tracing::warn!("closing the file watcher: {}", e);
    }
}

fn report(error: &WatchError) {
    match error {
        WatchError::Overflow => {
            tracing::warn!("{}; save a file again to trigger a redeploy", error)
        }
        _ => tracing::warn!("file watcher: {}", error),
    }
}
