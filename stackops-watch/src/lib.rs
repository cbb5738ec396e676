//! A directory watcher that follows the tree as it grows.
//!
//! `add(root)` subscribes every directory below `root`. When a directory is
//! created later, its subtree is subscribed before the create event is
//! handed to the consumer, and whatever already landed inside it is
//! reported as synthetic create events. A consumer therefore never misses
//! `D/f` because `D` was subscribed too late.
//!
//! All inotify state lives on one owner thread. The public handle talks to
//! it over channels:
//!
//! ```text
//!   add/close ──commands──▶ owner thread ──events──▶ events()
//!                                        ──errors──▶ errors()
//! ```
//!
//! The event and error channels are bounded. When the consumer falls
//! behind, the owner thread stops reading from the kernel, and the kernel
//! queue overflows into an [`WatchError::Overflow`].

use std::{
    collections::{HashMap, HashSet},
    fmt::Display,
    io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TryRecvError, TrySendError},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use nix::{
    errno::Errno,
    sys::inotify::{AddWatchFlags, InitFlags, Inotify, InotifyEvent, WatchDescriptor},
};
use tracing::{debug, trace};

/// How long the owner thread waits for commands when the kernel has
/// nothing for it.
const IDLE_TICK: Duration = Duration::from_millis(20);
const BACKPRESSURE_TICK: Duration = Duration::from_millis(1);
/// How often a read error that keeps recurring is reported again.
const READ_ERROR_REPEAT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchEventKind {
    Create,
    Write,
    Remove,
    Rename,
    Chmod,
}

impl Display for WatchEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WatchEventKind::Create => "create",
            WatchEventKind::Write => "write",
            WatchEventKind::Remove => "remove",
            WatchEventKind::Rename => "rename",
            WatchEventKind::Chmod => "chmod",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: PathBuf,
    pub kind: WatchEventKind,
}

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("watcher is closed")]
    Closed,
    #[error("could not initialize inotify: {0}")]
    Init(#[source] Errno),
    #[error("could not start the watcher thread: {0}")]
    Spawn(#[source] io::Error),
    #[error("could not watch {path}: {source}")]
    Subscribe {
        path: PathBuf,
        #[source]
        source: Errno,
    },
    #[error("could not scan {path}: {source}")]
    Scan {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("could not read inotify events: {0}")]
    Read(#[source] Errno),
    #[error("kernel event queue overflowed; events were lost")]
    Overflow,
}

enum Command {
    Add(PathBuf, mpsc::Sender<Result<(), WatchError>>),
    Close,
}

pub struct RecursiveWatcher {
    commands: mpsc::Sender<Command>,
    events: Receiver<WatchEvent>,
    errors: Receiver<WatchError>,
    closing: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl RecursiveWatcher {
    /// Start a watcher whose event and error channels buffer up to
    /// `capacity` items each.
    pub fn new(capacity: usize) -> Result<Self, WatchError> {
        let inotify = Inotify::init(InitFlags::IN_CLOEXEC | InitFlags::IN_NONBLOCK)
            .map_err(WatchError::Init)?;
        let (commands_tx, commands_rx) = mpsc::channel();
        let (events_tx, events_rx) = mpsc::sync_channel(capacity);
        let (errors_tx, errors_rx) = mpsc::sync_channel(capacity);
        let closing = Arc::new(AtomicBool::new(false));
        let owner = Owner {
            inotify,
            watches: HashMap::new(),
            roots: HashSet::new(),
            commands: commands_rx,
            events: events_tx,
            errors: errors_tx,
            closing: closing.clone(),
            read_errors: ReadErrors::default(),
        };
        let thread = thread::Builder::new()
            .name("stackops-watch".to_string())
            .spawn(move || owner.run())
            .map_err(WatchError::Spawn)?;
        Ok(RecursiveWatcher {
            commands: commands_tx,
            events: events_rx,
            errors: errors_rx,
            closing,
            thread: Some(thread),
        })
    }

    /// Watch `path` and, if it is a directory, everything below it.
    ///
    /// Blocks until the subtree is subscribed. While the event channel is
    /// full the owner thread cannot take the command, so do not call this
    /// from the only thread that drains [`events`](Self::events).
    pub fn add(&self, path: impl Into<PathBuf>) -> Result<(), WatchError> {
        if self.closing.load(Ordering::Acquire) {
            return Err(WatchError::Closed);
        }
        let (reply_tx, reply_rx) = mpsc::channel();
        self.commands
            .send(Command::Add(path.into(), reply_tx))
            .map_err(|_| WatchError::Closed)?;
        reply_rx.recv().map_err(|_| WatchError::Closed)?
    }

    /// Filesystem events, in the order the kernel reported them. The
    /// stream ends once the watcher is closed and the buffer is drained.
    pub fn events(&self) -> &Receiver<WatchEvent> {
        &self.events
    }

    pub fn errors(&self) -> &Receiver<WatchError> {
        &self.errors
    }

    /// Stop watching and release every subscription. Idempotent.
    pub fn close(&mut self) -> Result<(), WatchError> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        self.closing.store(true, Ordering::Release);
        // A send failure means the owner already exited.
        let _ = self.commands.send(Command::Close);
        thread.join().map_err(|_| WatchError::Closed)
    }
}

impl Drop for RecursiveWatcher {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

struct Owner {
    inotify: Inotify,
    watches: HashMap<WatchDescriptor, PathBuf>,
    roots: HashSet<PathBuf>,
    commands: Receiver<Command>,
    events: SyncSender<WatchEvent>,
    errors: SyncSender<WatchError>,
    closing: Arc<AtomicBool>,
    read_errors: ReadErrors,
}

/// Remembers the last read error so that a persistent one is not reported
/// on every tick.
#[derive(Default)]
struct ReadErrors {
    last: Option<(Errno, Instant)>,
}

impl ReadErrors {
    fn should_report(&mut self, errno: Errno, now: Instant) -> bool {
        match self.last {
            Some((last, at)) if last == errno && now.duration_since(at) < READ_ERROR_REPEAT => {
                false
            }
            _ => {
                self.last = Some((errno, now));
                true
            }
        }
    }

    fn clear(&mut self) {
        self.last = None;
    }
}

fn watch_mask() -> AddWatchFlags {
    AddWatchFlags::IN_CREATE
        | AddWatchFlags::IN_MODIFY
        | AddWatchFlags::IN_ATTRIB
        | AddWatchFlags::IN_DELETE
        | AddWatchFlags::IN_DELETE_SELF
        | AddWatchFlags::IN_MOVED_FROM
        | AddWatchFlags::IN_MOVED_TO
        | AddWatchFlags::IN_MOVE_SELF
}

fn event_kind(mask: AddWatchFlags) -> Option<WatchEventKind> {
    if mask.intersects(AddWatchFlags::IN_CREATE | AddWatchFlags::IN_MOVED_TO) {
        Some(WatchEventKind::Create)
    } else if mask.intersects(AddWatchFlags::IN_DELETE | AddWatchFlags::IN_DELETE_SELF) {
        Some(WatchEventKind::Remove)
    } else if mask.intersects(AddWatchFlags::IN_MOVED_FROM | AddWatchFlags::IN_MOVE_SELF) {
        Some(WatchEventKind::Rename)
    } else if mask.contains(AddWatchFlags::IN_MODIFY) {
        Some(WatchEventKind::Write)
    } else if mask.contains(AddWatchFlags::IN_ATTRIB) {
        Some(WatchEventKind::Chmod)
    } else {
        None
    }
}

impl Owner {
    fn run(mut self) {
        loop {
            let idle = match self.inotify.read_events() {
                Ok(events) => {
                    self.read_errors.clear();
                    for event in events {
                        self.handle(event);
                    }
                    false
                }
                Err(Errno::EAGAIN) => true,
                Err(e) => {
                    if self.read_errors.should_report(e, Instant::now()) {
                        self.report(WatchError::Read(e));
                    }
                    true
                }
            };
            let command = if idle {
                self.commands.recv_timeout(IDLE_TICK)
            } else {
                self.commands.try_recv().map_err(|e| match e {
                    TryRecvError::Empty => RecvTimeoutError::Timeout,
                    TryRecvError::Disconnected => RecvTimeoutError::Disconnected,
                })
            };
            match command {
                Ok(Command::Add(path, reply)) => {
                    let result = self.add_root(&path);
                    let _ = reply.send(result);
                }
                Ok(Command::Close) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
        debug!(watches = self.watches.len(), "closing watcher");
        // Dropping the inotify fd releases every watch descriptor, and
        // dropping the senders ends both streams.
    }

    fn add_root(&mut self, path: &Path) -> Result<(), WatchError> {
        if path.is_dir() {
            self.subscribe_tree(path)?;
        } else {
            self.subscribe(path)?;
        }
        // Only recorded once everything below it is subscribed.
        self.roots.insert(path.to_path_buf());
        Ok(())
    }

    /// Returns the descriptor if the path was not watched before.
    fn subscribe(&mut self, path: &Path) -> Result<Option<WatchDescriptor>, WatchError> {
        let wd = self
            .inotify
            .add_watch(path, watch_mask())
            .map_err(|source| WatchError::Subscribe {
                path: path.to_path_buf(),
                source,
            })?;
        trace!(path = %path.display(), "subscribed");
        Ok(self
            .watches
            .insert(wd, path.to_path_buf())
            .is_none()
            .then_some(wd))
    }

    /// Subscribe `dir` and every directory below it, or nothing at all.
    fn subscribe_tree(&mut self, dir: &Path) -> Result<(), WatchError> {
        let mut dirs = vec![dir.to_path_buf()];
        let mut pending = vec![dir.to_path_buf()];
        while let Some(next) = pending.pop() {
            let below = match subdirectories(&next) {
                Ok(below) => below,
                Err(e) if next != dir && vanished(&e) => continue,
                Err(e) => return Err(e),
            };
            dirs.extend(below.iter().cloned());
            pending.extend(below);
        }
        self.subscribe_all(&dirs)
    }

    /// Subscribe the first path and whichever of the others still exist.
    /// On failure every subscription made here is undone.
    fn subscribe_all(&mut self, dirs: &[PathBuf]) -> Result<(), WatchError> {
        let mut added = Vec::new();
        for (i, dir) in dirs.iter().enumerate() {
            match self.subscribe(dir) {
                Ok(new) => added.extend(new),
                Err(e) if i > 0 && vanished(&e) => {}
                Err(e) => {
                    debug!(path = %dir.display(), undone = added.len(), "subscription failed");
                    for wd in added {
                        self.watches.remove(&wd);
                        let _ = self.inotify.rm_watch(wd);
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn handle(&mut self, event: InotifyEvent) {
        if event.mask.contains(AddWatchFlags::IN_Q_OVERFLOW) {
            self.report(WatchError::Overflow);
            return;
        }
        if event.mask.contains(AddWatchFlags::IN_IGNORED) {
            self.watches.remove(&event.wd);
            return;
        }
        let Some(dir) = self.watches.get(&event.wd) else {
            return;
        };
        let path = match &event.name {
            Some(name) => dir.join(name),
            None if self.roots.contains(dir) => dir.clone(),
            // The parent's watch reports this one.
            None => return,
        };
        let Some(kind) = event_kind(event.mask) else {
            return;
        };
        let is_dir = event.mask.contains(AddWatchFlags::IN_ISDIR);

        if is_dir && event.mask.contains(AddWatchFlags::IN_MOVED_FROM) {
            self.forget_tree(&path);
        }
        let grew = is_dir && kind == WatchEventKind::Create && event.name.is_some();
        if grew {
            if let Err(e) = self.subscribe_tree(&path) {
                if !vanished(&e) {
                    self.report(e);
                }
            }
        }
        self.deliver(WatchEvent { path: path.clone(), kind });
        if grew {
            self.announce_contents(&path);
        }
    }

    /// Report everything inside a freshly subscribed directory as created.
    fn announce_contents(&mut self, dir: &Path) {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return,
            Err(source) => {
                self.report(WatchError::Scan {
                    path: dir.to_path_buf(),
                    source,
                });
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            self.deliver(WatchEvent {
                path: path.clone(),
                kind: WatchEventKind::Create,
            });
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                self.announce_contents(&path);
            }
        }
    }

    /// Drop the watches below a directory that moved away; their paths
    /// are stale.
    fn forget_tree(&mut self, dir: &Path) {
        let stale: Vec<WatchDescriptor> = self
            .watches
            .iter()
            .filter(|(_, path)| path.starts_with(dir))
            .map(|(wd, _)| *wd)
            .collect();
        for wd in stale {
            self.watches.remove(&wd);
            // Fails when the kernel already dropped it.
            let _ = self.inotify.rm_watch(wd);
        }
    }

    fn deliver(&self, event: WatchEvent) {
        trace!(path = %event.path.display(), kind = %event.kind, "event");
        send_with_backpressure(&self.events, event, &self.closing);
    }

    fn report(&self, error: WatchError) {
        debug!(%error, "watch error");
        send_with_backpressure(&self.errors, error, &self.closing);
    }
}

/// Block while the consumer catches up, unless the watcher is closing.
fn send_with_backpressure<T>(channel: &SyncSender<T>, mut item: T, closing: &AtomicBool) {
    loop {
        match channel.try_send(item) {
            Ok(()) => return,
            Err(TrySendError::Full(back)) => {
                if closing.load(Ordering::Acquire) {
                    return;
                }
                item = back;
                thread::sleep(BACKPRESSURE_TICK);
            }
            Err(TrySendError::Disconnected(_)) => return,
        }
    }
}

fn subdirectories(dir: &Path) -> Result<Vec<PathBuf>, WatchError> {
    let scan_error = |source| WatchError::Scan {
        path: dir.to_path_buf(),
        source,
    };
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(scan_error)? {
        let entry = entry.map_err(scan_error)?;
        // Symlinks are not followed.
        if entry.file_type().map_err(scan_error)?.is_dir() {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

/// The directory disappeared before we got to it. Its removal is reported
/// as an event of its own.
fn vanished(error: &WatchError) -> bool {
    match error {
        WatchError::Subscribe { source, .. } => *source == Errno::ENOENT,
        WatchError::Scan { source, .. } => source.kind() == io::ErrorKind::NotFound,
        _ => false,
    }
}
