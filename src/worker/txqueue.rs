use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex};

use anyhow::{Context, Result};

use crate::types::step::Transaction;

/// A durable FIFO of pending result reports. Items are appended to a
/// JSON-lines log and a sidecar file records how many have been consumed, so
/// the queue survives worker restarts. `get` blocks until an item arrives.
///
/// A `None` item is the shutdown sentinel for the drainer; it is never
/// persisted, so a crash between sentinel and exit cannot wedge the next
/// process's drainer.
pub struct TransactionQueue {
    log_path: PathBuf,
    offset_path: PathBuf,
    state: Mutex<State>,
    available: Condvar,
}

struct State {
    items: VecDeque<Option<Transaction>>,
    log: File,
    /// Persisted entries consumed so far.
    consumed: u64,
    /// Entries ever appended to the log file.
    appended: u64,
}

impl TransactionQueue {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let log_path: PathBuf = path.into();
        if let Some(parent) = log_path.parent() {
            if parent != Path::new("") {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
        }
        let offset_path = log_path.with_extension("offset");

        let consumed: u64 = match std::fs::read_to_string(&offset_path) {
            Ok(text) => text.trim().parse().unwrap_or(0),
            Err(_) => 0,
        };

        let mut items = VecDeque::new();
        let mut appended = 0u64;
        if let Ok(file) = File::open(&log_path) {
            for (i, line) in BufReader::new(file).lines().enumerate() {
                let line = line.context("reading queue log")?;
                if line.is_empty() {
                    continue;
                }
                appended += 1;
                if (i as u64) < consumed {
                    continue;
                }
                let txn: Transaction = serde_json::from_str(&line)
                    .with_context(|| format!("corrupt queue entry {i}"))?;
                items.push_back(Some(txn));
            }
        }

        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("opening {}", log_path.display()))?;

        Ok(Self {
            log_path,
            offset_path,
            state: Mutex::new(State {
                items,
                log,
                consumed,
                appended,
            }),
            available: Condvar::new(),
        })
    }

    /// Appends an item. `Some` items are durable before this returns.
    pub fn put(&self, item: Option<Transaction>) -> Result<()> {
        let mut state = self.state.lock().unwrap();

        if let Some(txn) = &item {
            let mut line = serde_json::to_vec(txn)?;
            line.push(b'\n');
            state.log.write_all(&line).context("appending to queue log")?;
            state.log.sync_data().context("syncing queue log")?;
            state.appended += 1;
        }

        state.items.push_back(item);
        self.available.notify_one();

        Ok(())
    }

    /// Removes and returns the oldest item, blocking until one exists.
    pub fn get(&self) -> Result<Option<Transaction>> {
        let mut state = self.state.lock().unwrap();
        while state.items.is_empty() {
            state = self.available.wait(state).unwrap();
        }

        let item = state.items.pop_front().unwrap();
        if item.is_some() {
            state.consumed += 1;
            std::fs::write(&self.offset_path, state.consumed.to_string())
                .context("writing queue offset")?;
        }

        // Once fully drained, start the log over rather than replaying a
        // growing prefix on every open.
        if state.items.is_empty() && state.consumed == state.appended {
            state.log.set_len(0).context("truncating queue log")?;
            state.consumed = 0;
            state.appended = 0;
            std::fs::write(&self.offset_path, "0")
                .context("writing queue offset")?;
        }

        Ok(item)
    }

    pub fn qsize(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::status::ResultStatus;
    use crate::types::step::{Outcome, Step, StepResult};

    fn txn(id: &str) -> Transaction {
        Transaction {
            step: Step {
                id: id.into(),
                name: id.into(),
                scope: "default".into(),
                priority: 0,
                timeout: None,
                parents: vec![],
                code: String::new(),
            },
            outcome: Outcome::Finished(StepResult {
                status: ResultStatus::Success,
                data: vec![1, 2, 3],
            }),
        }
    }

    #[test]
    fn test_fifo_order() {
        let dir = tempfile::tempdir().unwrap();
        let queue =
            TransactionQueue::open(dir.path().join("q.queue")).unwrap();

        for id in ["a", "b", "c"] {
            queue.put(Some(txn(id))).unwrap();
        }
        assert_eq!(queue.qsize(), 3);

        for id in ["a", "b", "c"] {
            assert_eq!(queue.get().unwrap().unwrap().step.id, id);
        }
        assert_eq!(queue.qsize(), 0);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q.queue");

        {
            let queue = TransactionQueue::open(&path).unwrap();
            for id in ["a", "b", "c"] {
                queue.put(Some(txn(id))).unwrap();
            }
            // consume one so the offset sidecar is exercised too
            assert_eq!(queue.get().unwrap().unwrap().step.id, "a");
        }

        let queue = TransactionQueue::open(&path).unwrap();
        assert_eq!(queue.qsize(), 2);
        assert_eq!(queue.get().unwrap().unwrap().step.id, "b");
        assert_eq!(queue.get().unwrap().unwrap().step.id, "c");
    }

    #[test]
    fn test_sentinel_is_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q.queue");

        {
            let queue = TransactionQueue::open(&path).unwrap();
            queue.put(Some(txn("a"))).unwrap();
            queue.put(None).unwrap();
        }

        let queue = TransactionQueue::open(&path).unwrap();
        assert_eq!(queue.qsize(), 1);
        assert!(queue.get().unwrap().is_some());
    }

    #[test]
    fn test_log_compacts_when_drained() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q.queue");

        let queue = TransactionQueue::open(&path).unwrap();
        for id in ["a", "b"] {
            queue.put(Some(txn(id))).unwrap();
        }
        queue.get().unwrap();
        queue.get().unwrap();

        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);

        // and the queue keeps working after compaction
        queue.put(Some(txn("c"))).unwrap();
        assert_eq!(queue.get().unwrap().unwrap().step.id, "c");
    }

    #[test]
    fn test_blocking_get_wakes_on_put() {
        let dir = tempfile::tempdir().unwrap();
        let queue = std::sync::Arc::new(
            TransactionQueue::open(dir.path().join("q.queue")).unwrap(),
        );

        let consumer = {
            let queue = queue.clone();
            std::thread::spawn(move || queue.get().unwrap())
        };

        std::thread::sleep(std::time::Duration::from_millis(50));
        queue.put(Some(txn("late"))).unwrap();

        assert_eq!(consumer.join().unwrap().unwrap().step.id, "late");
    }
}
