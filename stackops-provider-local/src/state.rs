//! A stack's state is a journal of JSON patches. Replaying the journal
//! yields the current stack document.
//!
//! The journal is append-only: one pretty-printed event per write, each
//! holding the RFC 6902 patch from the previous document to the next one.
//! That keeps a human-readable history of every change set and execution
//! next to the stack, and a crashed write can only ever lose its own tail.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde_json::{de::IoRead, Deserializer, StreamDeserializer, Value};
use std::{
    fs::{File, OpenOptions},
    io::{self, Seek as _, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct StateEvent {
    pub index: u64,
    pub meta: StateEventMeta,
    pub patch: json_patch::Patch,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct StateEventMeta {
    pub time: String,
    /// What caused the change, e.g. `createChangeSet`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

pub struct StateEventStream<'a, R: io::Read> {
    iter: StreamDeserializer<'a, IoRead<R>, StateEvent>,
    /// The validated first event, handed out before the rest of the stream.
    first_event: Option<StateEvent>,
}
impl<'a, R: io::Read> StateEventStream<'a, R> {
    pub fn open_from_reader(reader: R) -> Result<StateEventStream<'a, R>> {
        let deserializer = Deserializer::from_reader(reader);
        let mut iter = deserializer.into_iter();
        let first_event = match iter.next() {
            Some(Ok(ev @ StateEvent { index, .. })) => {
                if index != 0 {
                    bail!("Expected initial state event with index 0, got {}", index);
                }
                ev
            }
            Some(Err(e)) => bail!(
                "State file invalid: error parsing initial state event: {}",
                e
            ),
            None => bail!("State file invalid: no initial state event"),
        };
        Ok(StateEventStream {
            iter,
            first_event: Some(first_event),
        })
    }
}

impl<'a, R: io::Read> Iterator for StateEventStream<'a, R> {
    type Item = Result<StateEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.first_event.is_some() {
            self.first_event.take().map(Ok)
        } else {
            self.iter.next().map(|r| r.map_err(Into::into))
        }
    }
}

/// Log a wait that may take a long time: once after SILENT_INTERVAL, then
/// every LOG_INTERVAL with the elapsed time.
pub struct WaitMonitor {
    done: Arc<AtomicBool>,
}
impl WaitMonitor {
    const SILENT_INTERVAL: Duration = Duration::from_millis(500);
    const LOG_INTERVAL: Duration = Duration::from_secs(5);

    pub fn new(activity: String) -> WaitMonitor {
        let done = Arc::new(AtomicBool::new(false));
        let r = WaitMonitor { done: done.clone() };
        std::thread::spawn(move || WaitMonitor::run(done, activity));
        r
    }
    fn run(done: Arc<AtomicBool>, activity: String) {
        let start = Instant::now();
        let mut next_log = start + Self::SILENT_INTERVAL;
        loop {
            std::thread::sleep(next_log.saturating_duration_since(Instant::now()));
            if done.load(Ordering::Relaxed) {
                break;
            }
            tracing::info!(
                waited_secs = next_log.duration_since(start).as_secs(),
                "{}",
                activity
            );
            next_log += Self::LOG_INTERVAL;
        }
    }
    pub fn done(&self) {
        self.done.store(true, Ordering::Relaxed);
    }
}
impl Drop for WaitMonitor {
    fn drop(&mut self) {
        self.done()
    }
}

/// An open journal and the document it currently replays to.
pub struct Journal {
    path: PathBuf,
    file: Arc<File>,
    locking: fd_lock::RwLock<Arc<File>>,
    expected_size: Option<u64>,
    next_index: u64,
    state: Value,
}

impl Journal {
    /// Start a journal whose first event sets the document to `initial`.
    pub fn create(path: &Path, initial: Value) -> Result<Journal> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create_new(true)
            .open(path)
            .with_context(|| format!("creating state file {}", path.display()))?;
        let mut journal = Self::from_file(path, file, Value::Null, 0);
        journal.commit(initial, "init")?;
        Ok(journal)
    }

    /// Open and replay an existing journal. `None` if there is no file.
    pub fn open(path: &Path) -> Result<Option<Journal>> {
        let file = match OpenOptions::new().read(true).append(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("opening state file {}", path.display()))
            }
        };
        let reader = io::BufReader::new(&file);
        let stream = StateEventStream::open_from_reader(reader)
            .with_context(|| format!("reading state file {}", path.display()))?;
        let mut state = Value::Null;
        let mut next_index = 0;
        for event in stream {
            let event = event.with_context(|| format!("reading state file {}", path.display()))?;
            apply_state_event(&mut state, &event)?;
            next_index = event.index + 1;
        }
        Ok(Some(Self::from_file(path, file, state, next_index)))
    }

    fn from_file(path: &Path, file: File, state: Value, next_index: u64) -> Journal {
        let file = Arc::new(file);
        Journal {
            path: path.to_path_buf(),
            locking: fd_lock::RwLock::new(file.clone()),
            file,
            expected_size: None,
            next_index,
            state,
        }
    }

    pub fn state(&self) -> &Value {
        &self.state
    }

    /// Record the change from the current document to `next`. Nothing is
    /// written when they are equal.
    pub fn commit(&mut self, next: Value, cause: &str) -> Result<()> {
        let patch = json_patch::diff(&self.state, &next);
        if patch.0.is_empty() && self.next_index > 0 {
            return Ok(());
        }
        let event = StateEvent {
            index: self.next_index,
            meta: StateEventMeta {
                time: Utc::now().to_rfc3339(),
                cause: Some(cause.to_string()),
            },
            patch,
        };
        self.append(&[&event])?;
        self.next_index += 1;
        self.state = next;
        Ok(())
    }

    fn lock_write(
        locking: &mut fd_lock::RwLock<Arc<File>>,
    ) -> Result<fd_lock::RwLockWriteGuard<'_, Arc<File>>> {
        let lock_wait_mon = WaitMonitor::new("Waiting for state file write lock".to_owned());
        let lock = locking.write()?;
        lock_wait_mon.done();
        Ok(lock)
    }

    fn append(&mut self, events: &[&StateEvent]) -> Result<()> {
        let lock_guard = Self::lock_write(&mut self.locking)?;
        let pos = (&*self.file).seek(io::SeekFrom::End(0))?;
        match self.expected_size {
            None => self.expected_size = Some(pos),
            Some(expected_size) => {
                if pos != expected_size {
                    tracing::error!(
                        path = %self.path.display(),
                        foreign_bytes = ?(expected_size..pos),
                        "Detected concurrent writing to a stack journal; the stack may need manual inspection"
                    );
                }
            }
        }
        let mut writer = io::BufWriter::new(&*self.file);

        for event in events {
            // Pretty, because people read these when a deploy goes wrong.
            serde_json::to_writer_pretty(&mut writer, event)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        drop(writer);

        self.expected_size = Some((&*self.file).stream_position()?);

        drop(lock_guard);
        Ok(())
    }
}

pub fn apply_state_event(state: &mut Value, event: &StateEvent) -> Result<()> {
    json_patch::patch(state, event.patch.0.as_slice())
        .with_context(|| format!("applying state event {}", event.index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const BASIC_EXAMPLE: &str = r#"
    {
        "index": 0,
        "meta": {"time":"2024-03-04T07:40:00Z", "cause": "init"},
        "patch": [
            {
                "op": "add",
                "value": { "_type": "stackopsStack", "status": "notFound", "changeSets": {} },
                "path": ""
            }
        ]
    }
    {
        "index": 1,
        "meta": {"time":"2024-03-04T07:41:00Z"},
        "patch": [
            {
                "op": "add",
                "value": { "status": "ready", "changes": ["/template/Resources/A"] },
                "path": "/changeSets/cs-1"
            }
        ]
    }
"#;

    #[test]
    fn test_open_state_stream() {
        let stream = StateEventStream::open_from_reader(BASIC_EXAMPLE.as_bytes()).unwrap();
        let events: Vec<_> = stream.collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].as_ref().unwrap().index, 0);
        assert_eq!(
            events[0].as_ref().unwrap().meta.cause.as_deref(),
            Some("init")
        );
        assert_eq!(events[1].as_ref().unwrap().meta.cause, None);
    }

    #[test]
    fn test_resolve_state() {
        let stream = StateEventStream::open_from_reader(BASIC_EXAMPLE.as_bytes()).unwrap();
        let mut state = json!({});
        for event in stream {
            apply_state_event(&mut state, &event.unwrap()).unwrap();
        }
        assert_eq!(
            state,
            json!({
                "_type": "stackopsStack",
                "status": "notFound",
                "changeSets": {
                    "cs-1": { "status": "ready", "changes": ["/template/Resources/A"] }
                }
            })
        );
    }

    #[test]
    fn test_open_state_stream_rejects_bad_starts() {
        for input in [
            r#"{"index":1,"meta":{"time":"2024-06-04T07:40:00Z"},"patch":[]}"#,
            r#"{"meta":{"time":"2024-06-04T07:40:00Z"},"patch":[]}"#,
            r#"{"index":0,"meta":{"time":"2024-06-04T07:40:00Z"},"patch":[]"#,
            "",
            "[]",
            r#"{"index":0,"meta":{"time":"2024-06-04T07:40:00Z"}}"#,
            r#"{"index":0,"patch":[{}]}"#,
        ] {
            assert!(
                StateEventStream::open_from_reader(input.as_bytes()).is_err(),
                "{}",
                input
            );
        }
    }

    #[test]
    fn test_invalid_second_event() {
        let input = r#"{"index":0,"meta":{"time":"2024-06-04T07:40:00Z"},"patch":[]}
{"meta":{"time":"2024-06-04T07:40:00Z"}}"#;
        let stream = StateEventStream::open_from_reader(input.as_bytes()).unwrap();
        let vec: Vec<Result<StateEvent>> = stream.collect();
        assert!(vec[1].is_err());
    }

    #[test]
    fn test_journal_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app-env-web.json");
        assert!(Journal::open(&path).unwrap().is_none());

        let mut journal = Journal::create(&path, json!({"status": "notFound"})).unwrap();
        journal
            .commit(json!({"status": "complete", "parameters": {"Tag": "v1"}}), "execute")
            .unwrap();
        // no-op commits leave no trace
        journal
            .commit(json!({"status": "complete", "parameters": {"Tag": "v1"}}), "execute")
            .unwrap();

        let reopened = Journal::open(&path).unwrap().unwrap();
        assert_eq!(
            reopened.state(),
            &json!({"status": "complete", "parameters": {"Tag": "v1"}})
        );
        assert_eq!(reopened.next_index, 2);

        let events: Vec<StateEvent> =
            StateEventStream::open_from_reader(File::open(&path).unwrap())
                .unwrap()
                .map(|e| e.unwrap())
                .collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].meta.cause.as_deref(), Some("execute"));
    }

    #[test]
    fn test_create_refuses_existing_journal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.json");
        Journal::create(&path, json!({})).unwrap();
        assert!(Journal::create(&path, json!({})).is_err());
    }

    #[test]
    fn test_two_handles_append_in_turn() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.json");
        let mut first = Journal::create(&path, json!({"n": 0})).unwrap();
        let mut second = Journal::open(&path).unwrap().unwrap();
        second.commit(json!({"n": 1}), "second").unwrap();
        // `first` replays nothing of `second`'s write; its patch still
        // applies on top because it only touches the same key.
        first.commit(json!({"n": 2}), "first").unwrap();
        let replayed = Journal::open(&path).unwrap().unwrap();
        assert_eq!(replayed.state(), &json!({"n": 2}));
    }
}
