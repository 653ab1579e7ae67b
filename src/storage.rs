//! File-backed [`EventJournal`] using one JSON-lines file per identity.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::journal::{BoxFuture, EventJournal, PersistenceId, StoredEvent};

/// One line of a journal file: a batch appended atomically.
#[derive(Serialize, Deserialize)]
#[serde(bound(serialize = "Ev: Serialize", deserialize = "Ev: DeserializeOwned"))]
struct JournalRecord<Ev> {
    events: Vec<StoredEvent<Ev>>,
}

/// [`EventJournal`] that stores histories as JSON-lines files.
///
/// The layout follows this structure:
/// ```text
/// <base_dir>/
///     streams/
///         <entity_type>/
///             <stream_uuid>.jsonl     -- one line per atomic batch
///     meta/
///         streams.jsonl               -- identity registry
/// ```
///
/// Each append writes exactly one line and syncs it before returning, so a
/// batch is either fully present or, after a crash mid-write, a torn
/// trailing line without its newline. Torn lines are ignored on read and
/// truncated before the next append.
///
/// Cheap to clone; clones share the sequence number cache. A single
/// process must be the only writer of a given identity.
#[derive(Debug, Clone)]
pub struct JsonlJournal {
    base_dir: PathBuf,
    /// Last sequence number per identity, loaded lazily from disk.
    sequence_nrs: Arc<Mutex<HashMap<PersistenceId, u64>>>,
    /// Makes the next sync fail after its line has been written.
    #[cfg(test)]
    fail_next_sync: Arc<std::sync::atomic::AtomicBool>,
}

impl JsonlJournal {
    /// Create a journal rooted at `base_dir`.
    ///
    /// The directory does not need to exist yet; it is created on the first
    /// append.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            sequence_nrs: Arc::new(Mutex::new(HashMap::new())),
            #[cfg(test)]
            fail_next_sync: Arc::default(),
        }
    }

    /// Returns the root directory of this journal.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Returns the path of the journal file for `id`.
    ///
    /// `<base_dir>/streams/<entity_type>/<stream_uuid>.jsonl`
    pub fn stream_path(&self, id: &PersistenceId) -> PathBuf {
        self.base_dir
            .join("streams")
            .join(id.entity_type())
            .join(format!("{}.jsonl", id.stream_uuid()))
    }

    fn registry_path(&self) -> PathBuf {
        self.base_dir.join("meta").join("streams.jsonl")
    }

    /// Lists the entity ids that have a history for `entity_type`.
    ///
    /// # Returns
    ///
    /// A sorted, de-duplicated `Vec<String>`. Empty if nothing was ever
    /// appended.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the registry cannot be read.
    pub fn entity_ids(&self, entity_type: &str) -> Result<Vec<String>, StorageError> {
        let file = match fs::File::open(self.registry_path()) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            if let Ok(id) = serde_json::from_str::<PersistenceId>(&line)
                && id.entity_type() == entity_type
            {
                ids.push(id.entity_id().to_owned());
            }
        }
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    /// Record `id` in the registry. Called once, after its first batch is
    /// durable.
    fn register(&self, id: &PersistenceId) -> Result<(), StorageError> {
        let path = self.registry_path();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(file, "{}", serde_json::to_string(id)?)?;
        Ok(())
    }

    fn append_blocking<Ev: Serialize + DeserializeOwned>(
        &self,
        id: &PersistenceId,
        events: Vec<Ev>,
    ) -> Result<u64, StorageError> {
        let path = self.stream_path(id);
        let mut cache = self
            .sequence_nrs
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let created = !path.exists();
        let last = match cache.get(id) {
            Some(last) => *last,
            None => repair_and_count::<Ev>(&path)?,
        };

        let record = JournalRecord {
            events: events
                .into_iter()
                .enumerate()
                .map(|(offset, event)| StoredEvent::new(last + offset as u64 + 1, event))
                .collect(),
        };
        let count = record.events.len() as u64;
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let previous_len = if created { 0 } else { fs::metadata(&path)?.len() };

        // A stream left holding only a torn first batch is still unregistered.
        let first_batch = last == 0;
        let written = self
            .write_line(&path, &line)
            .map_err(StorageError::from)
            .and_then(|()| if first_batch { self.register(id) } else { Ok(()) });

        match written {
            Ok(()) => {
                cache.insert(id.clone(), last + count);
                Ok(last + count)
            }
            Err(e) => {
                cache.remove(id);
                if let Err(rollback) = roll_back(&path, previous_len, created) {
                    tracing::error!(
                        persistence_id = %id,
                        error = %rollback,
                        "failed to roll back journal after a failed append"
                    );
                }
                Err(e)
            }
        }
    }

    fn write_line(&self, path: &Path, line: &str) -> io::Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(line.as_bytes())?;
        self.injected_sync_failure()?;
        file.sync_data()
    }

    #[cfg(test)]
    fn injected_sync_failure(&self) -> io::Result<()> {
        use std::sync::atomic::Ordering;

        if self.fail_next_sync.swap(false, Ordering::SeqCst) {
            return Err(io::Error::other("injected sync failure"));
        }
        Ok(())
    }

    #[cfg(not(test))]
    fn injected_sync_failure(&self) -> io::Result<()> {
        Ok(())
    }
}

/// Undo a failed append: cut the file back to `len`, or remove it if the
/// append created it.
fn roll_back(path: &Path, len: u64, created: bool) -> io::Result<()> {
    if created {
        return match fs::remove_file(path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        };
    }
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(len)?;
    file.sync_data()
}

/// Parse a journal file into stored events.
///
/// Returns the events and the byte length of the complete-line prefix.
fn parse_journal<Ev: DeserializeOwned>(
    contents: &str,
) -> Result<(Vec<StoredEvent<Ev>>, usize), StorageError> {
    let complete_len = contents.rfind('\n').map_or(0, |pos| pos + 1);
    if complete_len < contents.len() {
        tracing::warn!(
            torn_bytes = contents.len() - complete_len,
            "ignoring torn trailing journal record"
        );
    }

    let mut events = Vec::new();
    for (index, line) in contents[..complete_len].lines().enumerate() {
        if line.is_empty() {
            continue;
        }
        let record: JournalRecord<Ev> =
            serde_json::from_str(line).map_err(|e| StorageError::Corrupted {
                line: index + 1,
                reason: e.to_string(),
            })?;
        events.extend(record.events);
    }
    Ok((events, complete_len))
}

fn read_file(path: &Path) -> Result<Option<String>, StorageError> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Truncate a torn trailing record and return the last sequence number.
fn repair_and_count<Ev: DeserializeOwned>(path: &Path) -> Result<u64, StorageError> {
    let Some(contents) = read_file(path)? else {
        return Ok(0);
    };
    let (events, complete_len) = parse_journal::<Ev>(&contents)?;
    if complete_len < contents.len() {
        OpenOptions::new()
            .write(true)
            .open(path)?
            .set_len(complete_len as u64)?;
    }
    Ok(events.last().map_or(0, |stored| stored.sequence_nr))
}

fn join_error(e: tokio::task::JoinError) -> StorageError {
    StorageError::Unavailable(format!("journal task failed: {e}"))
}

impl<Ev> EventJournal<Ev> for JsonlJournal
where
    Ev: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn append_atomic<'a>(
        &'a self,
        id: &'a PersistenceId,
        events: &'a [Ev],
    ) -> BoxFuture<'a, Result<u64, StorageError>> {
        let journal = self.clone();
        let id = id.clone();
        let events = events.to_vec();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || journal.append_blocking(&id, events))
                .await
                .map_err(join_error)?
        })
    }

    fn read_events<'a>(
        &'a self,
        id: &'a PersistenceId,
    ) -> BoxFuture<'a, Result<Vec<StoredEvent<Ev>>, StorageError>> {
        let path = self.stream_path(id);
        Box::pin(async move {
            tokio::task::spawn_blocking(move || match read_file(&path)? {
                Some(contents) => parse_journal(&contents).map(|(events, _)| events),
                None => Ok(Vec::new()),
            })
            .await
            .map_err(join_error)?
        })
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::entity::test_fixtures::CounterEvent;

    fn id(entity_id: &str) -> PersistenceId {
        PersistenceId::new("counter", entity_id)
    }

    #[test]
    fn stream_path_uses_stream_uuid() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let journal = JsonlJournal::new(tmp.path());
        let pid = id("c-1");

        assert_eq!(journal.base_dir(), tmp.path());
        assert_eq!(
            journal.stream_path(&pid),
            tmp.path()
                .join("streams/counter")
                .join(format!("{}.jsonl", pid.stream_uuid()))
        );
    }

    #[tokio::test]
    async fn append_then_read_back_in_order() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let journal = JsonlJournal::new(tmp.path());
        let pid = id("c-1");

        let last = journal
            .append_atomic(
                &pid,
                &[CounterEvent::Incremented, CounterEvent::Added { amount: 5 }],
            )
            .await
            .expect("append should succeed");
        assert_eq!(last, 2);
        let last = journal
            .append_atomic(&pid, &[CounterEvent::Decremented])
            .await
            .expect("append should succeed");
        assert_eq!(last, 3);

        let stored: Vec<StoredEvent<CounterEvent>> =
            journal.read_events(&pid).await.expect("read should succeed");
        let events: Vec<_> = stored.iter().map(|s| s.event.clone()).collect();
        assert_eq!(
            events,
            vec![
                CounterEvent::Incremented,
                CounterEvent::Added { amount: 5 },
                CounterEvent::Decremented,
            ]
        );
        let seqs: Vec<u64> = stored.iter().map(|s| s.sequence_nr).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn one_line_per_batch() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let journal = JsonlJournal::new(tmp.path());
        let pid = id("c-1");

        journal
            .append_atomic(&pid, &[CounterEvent::Incremented, CounterEvent::Incremented])
            .await
            .expect("append should succeed");

        let contents = fs::read_to_string(journal.stream_path(&pid)).expect("file should exist");
        assert_eq!(contents.lines().count(), 1);
        assert!(contents.ends_with('\n'));
    }

    #[tokio::test]
    async fn sequence_numbers_survive_reopen() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let pid = id("c-1");

        JsonlJournal::new(tmp.path())
            .append_atomic(&pid, &[CounterEvent::Incremented])
            .await
            .expect("append should succeed");

        let reopened = JsonlJournal::new(tmp.path());
        let last = reopened
            .append_atomic(&pid, &[CounterEvent::Incremented])
            .await
            .expect("append should succeed");
        assert_eq!(last, 2);
    }

    #[tokio::test]
    async fn torn_trailing_record_is_ignored_and_repaired() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let pid = id("c-1");
        let journal = JsonlJournal::new(tmp.path());
        journal
            .append_atomic(&pid, &[CounterEvent::Incremented])
            .await
            .expect("append should succeed");

        // Simulate a crash halfway through writing a second batch.
        let path = journal.stream_path(&pid);
        let mut file = OpenOptions::new()
            .append(true)
            .open(&path)
            .expect("file should open");
        file.write_all(br#"{"events":[{"sequence_nr":2,"#)
            .expect("write should succeed");
        drop(file);

        let reopened = JsonlJournal::new(tmp.path());
        let stored: Vec<StoredEvent<CounterEvent>> =
            reopened.read_events(&pid).await.expect("read should succeed");
        assert_eq!(stored.len(), 1);

        let last = reopened
            .append_atomic(&pid, &[CounterEvent::Decremented])
            .await
            .expect("append should succeed");
        assert_eq!(last, 2);

        let stored: Vec<StoredEvent<CounterEvent>> =
            reopened.read_events(&pid).await.expect("read should succeed");
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].event, CounterEvent::Decremented);
    }

    #[tokio::test]
    async fn stream_with_only_a_torn_batch_is_registered_on_repair() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let pid = id("c-1");
        let journal = JsonlJournal::new(tmp.path());

        // Crash during the very first write: the file exists, nothing is durable.
        let path = journal.stream_path(&pid);
        fs::create_dir_all(path.parent().expect("stream dir")).expect("mkdir");
        fs::write(&path, br#"{"events":[{"sequence_nr":1,"#).expect("write should succeed");
        assert!(journal.entity_ids("counter").expect("listing").is_empty());

        let last = journal
            .append_atomic(&pid, &[CounterEvent::Incremented])
            .await
            .expect("append should succeed");
        assert_eq!(last, 1);
        assert_eq!(journal.entity_ids("counter").expect("listing"), vec!["c-1"]);
    }

    #[tokio::test]
    async fn corrupted_middle_record_is_an_error() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let pid = id("c-1");
        let journal = JsonlJournal::new(tmp.path());
        journal
            .append_atomic(&pid, &[CounterEvent::Incremented])
            .await
            .expect("append should succeed");

        let path = journal.stream_path(&pid);
        let mut contents = fs::read_to_string(&path).expect("file should exist");
        contents.insert_str(0, "not json\n");
        fs::write(&path, contents).expect("write should succeed");

        let result: Result<Vec<StoredEvent<CounterEvent>>, _> = journal.read_events(&pid).await;
        assert!(
            matches!(result, Err(StorageError::Corrupted { line: 1, .. })),
            "expected Corrupted at line 1, got: {result:?}"
        );
    }

    #[tokio::test]
    async fn unknown_identity_reads_empty() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let journal = JsonlJournal::new(tmp.path());
        let stored: Vec<StoredEvent<CounterEvent>> = journal
            .read_events(&id("missing"))
            .await
            .expect("read should succeed");
        assert!(stored.is_empty());
    }

    #[tokio::test]
    async fn entity_ids_lists_each_identity_once() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let journal = JsonlJournal::new(tmp.path());

        for entity_id in ["charlie", "alpha", "charlie", "bravo"] {
            journal
                .append_atomic(&id(entity_id), &[CounterEvent::Incremented])
                .await
                .expect("append should succeed");
        }
        journal
            .append_atomic(
                &PersistenceId::new("account", "zulu"),
                &[CounterEvent::Incremented],
            )
            .await
            .expect("append should succeed");

        assert_eq!(
            journal.entity_ids("counter").expect("listing should succeed"),
            vec!["alpha", "bravo", "charlie"]
        );
        assert_eq!(
            journal.entity_ids("account").expect("listing should succeed"),
            vec!["zulu"]
        );
    }

    #[tokio::test]
    async fn failed_sync_rolls_back_the_written_batch() {
        use std::sync::atomic::Ordering;

        let tmp = TempDir::new().expect("failed to create temp dir");
        let pid = id("c-1");
        let journal = JsonlJournal::new(tmp.path());
        journal
            .append_atomic(&pid, &[CounterEvent::Incremented])
            .await
            .expect("append should succeed");

        // The whole line reaches the file before the sync fails.
        journal.fail_next_sync.store(true, Ordering::SeqCst);
        let result = journal
            .append_atomic(
                &pid,
                &[CounterEvent::Incremented, CounterEvent::Added { amount: 5 }],
            )
            .await;
        assert!(matches!(result, Err(StorageError::Io(_))));

        let contents = fs::read_to_string(journal.stream_path(&pid)).expect("file should exist");
        assert_eq!(contents.lines().count(), 1);

        let reopened = JsonlJournal::new(tmp.path());
        let stored: Vec<StoredEvent<CounterEvent>> =
            reopened.read_events(&pid).await.expect("read should succeed");
        assert_eq!(stored.len(), 1);

        let last = journal
            .append_atomic(&pid, &[CounterEvent::Decremented])
            .await
            .expect("append should succeed");
        assert_eq!(last, 2);
    }

    #[tokio::test]
    async fn failed_first_append_leaves_no_trace() {
        use std::sync::atomic::Ordering;

        let tmp = TempDir::new().expect("failed to create temp dir");
        let pid = id("c-1");
        let journal = JsonlJournal::new(tmp.path());

        journal.fail_next_sync.store(true, Ordering::SeqCst);
        let result = journal
            .append_atomic(&pid, &[CounterEvent::Incremented])
            .await;
        assert!(result.is_err());

        assert!(!journal.stream_path(&pid).exists());
        let stored: Vec<StoredEvent<CounterEvent>> =
            journal.read_events(&pid).await.expect("read should succeed");
        assert!(stored.is_empty());
        assert!(journal.entity_ids("counter").expect("listing").is_empty());

        let last = journal
            .append_atomic(&pid, &[CounterEvent::Incremented])
            .await
            .expect("retry should succeed");
        assert_eq!(last, 1);
        assert_eq!(journal.entity_ids("counter").expect("listing"), vec!["c-1"]);
    }

    #[test]
    fn entity_ids_empty_before_any_append() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let journal = JsonlJournal::new(tmp.path());
        assert!(journal.entity_ids("counter").unwrap().is_empty());
    }
}
