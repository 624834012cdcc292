/// Durable FIFO of completed activations awaiting acknowledgment.
///
/// Every mutation is written through to the store before returning, so an
/// event survives power loss until the service has acknowledged it.
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::clock::MonotonicTime;
use crate::event::{ActivationEvent, EventId};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("outbox i/o on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("outbox file {path} is corrupt (moved to {quarantined}): {reason}")]
    Corrupt {
        path: PathBuf,
        quarantined: PathBuf,
        reason: String,
    },
    #[error("outbox encode: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("outbox storage unavailable")]
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Pending,
    InFlight,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEntry {
    pub event: ActivationEvent,
    pub attempts: u32,
    pub next_attempt_at: MonotonicTime,
    pub state: EntryState,
}

/// On-disk form. Monotonic deadlines do not survive a reboot, so they are
/// not stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntry {
    pub event: ActivationEvent,
    pub attempts: u32,
    pub state: EntryState,
}

pub trait OutboxStore {
    fn load(&mut self) -> Result<Vec<StoredEntry>, StoreError>;
    fn save(&mut self, entries: &[StoredEntry]) -> Result<(), StoreError>;
}

#[derive(Serialize, Deserialize)]
struct OutboxFile {
    version: u32,
    entries: Vec<StoredEntry>,
}

const FILE_VERSION: u32 = 1;

/// JSON file replaced atomically (write temp, fsync, rename) on each save.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(suffix);
        PathBuf::from(name)
    }

    fn io_err(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl OutboxStore for JsonFileStore {
    fn load(&mut self) -> Result<Vec<StoredEntry>, StoreError> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_err(e)),
        };

        match serde_json::from_slice::<OutboxFile>(&raw) {
            Ok(file) if file.version == FILE_VERSION => Ok(file.entries),
            Ok(file) => self.quarantine(format!("unsupported version {}", file.version)),
            Err(e) => self.quarantine(e.to_string()),
        }
    }

    fn save(&mut self, entries: &[StoredEntry]) -> Result<(), StoreError> {
        let body = serde_json::to_vec(&OutboxFile {
            version: FILE_VERSION,
            entries: entries.to_vec(),
        })?;

        let tmp = self.sibling(".tmp");
        let write = || -> std::io::Result<()> {
            let mut f = File::create(&tmp)?;
            f.write_all(&body)?;
            f.sync_all()?;
            fs::rename(&tmp, &self.path)?;
            // The rename is only durable once the directory entry is.
            let dir = match self.path.parent() {
                Some(dir) if !dir.as_os_str().is_empty() => dir,
                _ => Path::new("."),
            };
            File::open(dir)?.sync_all()
        };
        write().map_err(|e| self.io_err(e))
    }
}

impl JsonFileStore {
    /// Keep unreadable contents aside for manual recovery instead of
    /// overwriting them with the next save.
    fn quarantine(&self, reason: String) -> Result<Vec<StoredEntry>, StoreError> {
        let mut quarantined = self.sibling(".corrupt");
        let mut n = 0;
        while quarantined.exists() {
            n += 1;
            quarantined = self.sibling(&format!(".corrupt.{n}"));
        }
        fs::rename(&self.path, &quarantined).map_err(|e| self.io_err(e))?;
        Err(StoreError::Corrupt {
            path: self.path.clone(),
            quarantined,
            reason,
        })
    }
}

/// In-memory store. Clones share contents, which lets tests simulate a
/// restart by opening a second outbox on the same store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Rc<RefCell<Vec<StoredEntry>>>,
    fail_writes: Rc<RefCell<bool>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<StoredEntry> {
        self.entries.borrow().clone()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        *self.fail_writes.borrow_mut() = fail;
    }
}

impl OutboxStore for MemoryStore {
    fn load(&mut self) -> Result<Vec<StoredEntry>, StoreError> {
        Ok(self.entries.borrow().clone())
    }

    fn save(&mut self, entries: &[StoredEntry]) -> Result<(), StoreError> {
        if *self.fail_writes.borrow() {
            return Err(StoreError::Unavailable);
        }
        *self.entries.borrow_mut() = entries.to_vec();
        Ok(())
    }
}

const LOAD_ATTEMPTS: u32 = 3;
const LOAD_RETRY_DELAY: Duration = Duration::from_millis(100);

pub struct EventOutbox {
    entries: VecDeque<OutboxEntry>,
    capacity: usize,
    store: Box<dyn OutboxStore>,
    dropped: u64,
    persist_failures: u64,
}

impl EventOutbox {
    /// Load whatever survived the last run. Entries that were in flight
    /// when power was lost are offered again immediately.
    ///
    /// A corrupt file has already been moved aside, so the outbox starts
    /// empty. Any other load failure is retried and then returned: saving
    /// over a file that could not be read would erase its events.
    pub fn open(
        mut store: Box<dyn OutboxStore>,
        capacity: usize,
        now: MonotonicTime,
    ) -> Result<Self, StoreError> {
        let capacity = capacity.max(1);
        let stored = load_with_retry(store.as_mut())?;

        let mut outbox = Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            store,
            dropped: 0,
            persist_failures: 0,
        };

        let mut changed = false;
        for s in stored {
            if outbox.contains(s.event.id) {
                changed = true;
                continue;
            }
            changed |= s.state != EntryState::Pending;
            outbox.entries.push_back(OutboxEntry {
                event: s.event,
                attempts: s.attempts,
                next_attempt_at: now,
                state: EntryState::Pending,
            });
        }
        while outbox.entries.len() > capacity {
            outbox.evict_oldest();
            changed = true;
        }
        if !outbox.entries.is_empty() {
            info!(pending = outbox.entries.len(), "restored undelivered events");
        }
        if changed {
            outbox.persist();
        }
        Ok(outbox)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Events lost to capacity eviction since start.
    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }

    pub fn persist_failures(&self) -> u64 {
        self.persist_failures
    }

    pub fn entries(&self) -> impl Iterator<Item = &OutboxEntry> {
        self.entries.iter()
    }

    pub fn get(&self, id: EventId) -> Option<&OutboxEntry> {
        self.entries.iter().find(|e| e.event.id == id)
    }

    fn contains(&self, id: EventId) -> bool {
        self.get(id).is_some()
    }

    fn get_mut(&mut self, id: EventId) -> Option<&mut OutboxEntry> {
        self.entries.iter_mut().find(|e| e.event.id == id)
    }

    pub fn enqueue(&mut self, event: ActivationEvent, now: MonotonicTime) {
        if self.contains(event.id) {
            warn!(id = %event.id, "event already queued, ignoring duplicate");
            return;
        }
        if self.entries.len() >= self.capacity {
            self.evict_oldest();
        }
        self.entries.push_back(OutboxEntry {
            event,
            attempts: 0,
            next_attempt_at: now,
            state: EntryState::Pending,
        });
        self.persist();
    }

    /// Oldest pending entry whose retry time has come.
    pub fn peek_ready(&self, now: MonotonicTime) -> Option<&OutboxEntry> {
        self.entries
            .iter()
            .find(|e| e.state == EntryState::Pending && e.next_attempt_at <= now)
    }

    /// Earliest time any pending entry becomes ready.
    pub fn next_ready_at(&self) -> Option<MonotonicTime> {
        self.entries
            .iter()
            .filter(|e| e.state == EntryState::Pending)
            .map(|e| e.next_attempt_at)
            .min()
    }

    pub fn mark_in_flight(&mut self, id: EventId) -> bool {
        let Some(entry) = self.get_mut(id) else {
            return false;
        };
        if entry.state != EntryState::Pending {
            return false;
        }
        entry.state = EntryState::InFlight;
        self.persist();
        true
    }

    /// Remove an acknowledged event. Unknown ids are a no-op, so a repeated
    /// acknowledgment changes nothing.
    pub fn mark_delivered(&mut self, id: EventId) -> bool {
        let Some(pos) = self.entries.iter().position(|e| e.event.id == id) else {
            return false;
        };
        self.entries.remove(pos);
        self.persist();
        true
    }

    pub fn mark_failed(&mut self, id: EventId, now: MonotonicTime, backoff: Duration) -> bool {
        let Some(entry) = self.get_mut(id) else {
            return false;
        };
        entry.state = EntryState::Pending;
        entry.attempts += 1;
        entry.next_attempt_at = now + backoff;
        self.persist();
        true
    }

    fn evict_oldest(&mut self) {
        let pos = self
            .entries
            .iter()
            .position(|e| e.state == EntryState::Pending)
            .unwrap_or(0);
        if let Some(lost) = self.entries.remove(pos) {
            self.dropped += 1;
            warn!(
                id = %lost.event.id,
                started_at = %lost.event.started_at,
                attempts = lost.attempts,
                dropped_total = self.dropped,
                "outbox full, dropped oldest undelivered event"
            );
        }
    }

    fn persist(&mut self) {
        let stored: Vec<StoredEntry> = self
            .entries
            .iter()
            .map(|e| StoredEntry {
                event: e.event.clone(),
                attempts: e.attempts,
                state: e.state,
            })
            .collect();
        if let Err(e) = self.store.save(&stored) {
            self.persist_failures += 1;
            error!(error = %e, failures = self.persist_failures, "failed to persist outbox");
        }
    }
}

fn load_with_retry(store: &mut dyn OutboxStore) -> Result<Vec<StoredEntry>, StoreError> {
    let mut attempt = 1;
    loop {
        match store.load() {
            Ok(entries) => return Ok(entries),
            Err(e @ StoreError::Corrupt { .. }) => {
                error!(error = %e, "outbox unreadable, starting empty");
                return Ok(Vec::new());
            }
            Err(e) if attempt < LOAD_ATTEMPTS => {
                warn!(error = %e, attempt, "outbox load failed, retrying");
                attempt += 1;
                thread::sleep(LOAD_RETRY_DELAY);
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};

    fn event(clock: &ManualClock) -> ActivationEvent {
        let started_at = clock.wall_clock_now();
        ActivationEvent {
            id: EventId::new(),
            started_at,
            ended_at: started_at + chrono::Duration::seconds(30),
            duration: Duration::from_secs(30),
            peak_magnitude: 0.5,
            clock_synced: true,
        }
    }

    fn at(ms: u64) -> MonotonicTime {
        MonotonicTime::from_millis(ms)
    }

    fn memory_outbox(capacity: usize) -> (EventOutbox, MemoryStore) {
        let store = MemoryStore::new();
        (EventOutbox::open(Box::new(store.clone()), capacity, at(0)).unwrap(), store)
    }

    #[test]
    fn peek_ready_returns_oldest_pending() {
        let clock = ManualClock::starting_at_default();
        let (mut outbox, _) = memory_outbox(8);
        let a = event(&clock);
        let b = event(&clock);
        outbox.enqueue(a.clone(), at(0));
        outbox.enqueue(b.clone(), at(0));

        assert_eq!(outbox.peek_ready(at(0)).unwrap().event.id, a.id);
        assert!(outbox.mark_in_flight(a.id));
        // In-flight entries are not offered again.
        assert_eq!(outbox.peek_ready(at(0)).unwrap().event.id, b.id);
    }

    #[test]
    fn failed_entry_waits_for_backoff() {
        let clock = ManualClock::starting_at_default();
        let (mut outbox, _) = memory_outbox(8);
        let a = event(&clock);
        outbox.enqueue(a.clone(), at(0));

        outbox.mark_in_flight(a.id);
        assert!(outbox.mark_failed(a.id, at(1_000), Duration::from_secs(5)));

        let entry = outbox.get(a.id).unwrap();
        assert_eq!(entry.attempts, 1);
        assert_eq!(entry.state, EntryState::Pending);
        assert_eq!(entry.next_attempt_at, at(6_000));
        assert!(outbox.peek_ready(at(5_999)).is_none());
        assert!(outbox.peek_ready(at(6_000)).is_some());
        assert_eq!(outbox.next_ready_at(), Some(at(6_000)));
    }

    #[test]
    fn later_entry_may_go_while_earlier_backs_off() {
        let clock = ManualClock::starting_at_default();
        let (mut outbox, _) = memory_outbox(8);
        let a = event(&clock);
        let b = event(&clock);
        outbox.enqueue(a.clone(), at(0));
        outbox.enqueue(b.clone(), at(0));
        outbox.mark_failed(a.id, at(0), Duration::from_secs(60));

        assert_eq!(outbox.peek_ready(at(1)).unwrap().event.id, b.id);
        assert_eq!(outbox.peek_ready(at(60_000)).unwrap().event.id, a.id);
    }

    #[test]
    fn delivered_entry_is_removed_once() {
        let clock = ManualClock::starting_at_default();
        let (mut outbox, store) = memory_outbox(8);
        let a = event(&clock);
        outbox.enqueue(a.clone(), at(0));

        assert!(outbox.mark_delivered(a.id));
        assert!(outbox.is_empty());
        assert!(store.snapshot().is_empty());

        // Repeated acknowledgment is a no-op.
        assert!(!outbox.mark_delivered(a.id));
        assert!(!outbox.mark_failed(a.id, at(0), Duration::from_secs(1)));
        assert!(outbox.is_empty());
    }

    #[test]
    fn duplicate_ids_are_not_queued_twice() {
        let clock = ManualClock::starting_at_default();
        let (mut outbox, _) = memory_outbox(8);
        let a = event(&clock);
        outbox.enqueue(a.clone(), at(0));
        outbox.enqueue(a.clone(), at(10));
        assert_eq!(outbox.len(), 1);
    }

    #[test]
    fn full_outbox_drops_oldest_and_counts_it() {
        let clock = ManualClock::starting_at_default();
        let (mut outbox, store) = memory_outbox(3);
        let events: Vec<_> = (0..4).map(|_| event(&clock)).collect();
        for e in &events {
            outbox.enqueue(e.clone(), at(0));
        }

        assert_eq!(outbox.len(), 3);
        assert_eq!(outbox.dropped_count(), 1);
        assert!(outbox.get(events[0].id).is_none());
        assert!(outbox.get(events[3].id).is_some());
        assert_eq!(store.snapshot().len(), 3);
    }

    #[test]
    fn eviction_skips_entry_in_flight() {
        let clock = ManualClock::starting_at_default();
        let (mut outbox, _) = memory_outbox(2);
        let a = event(&clock);
        let b = event(&clock);
        let c = event(&clock);
        outbox.enqueue(a.clone(), at(0));
        outbox.enqueue(b.clone(), at(0));
        outbox.mark_in_flight(a.id);
        outbox.enqueue(c.clone(), at(0));

        assert!(outbox.get(a.id).is_some());
        assert!(outbox.get(b.id).is_none());
        assert!(outbox.get(c.id).is_some());
    }

    #[test]
    fn restart_reoffers_pending_and_in_flight() {
        let clock = ManualClock::starting_at_default();
        let (mut outbox, store) = memory_outbox(8);
        let a = event(&clock);
        let b = event(&clock);
        outbox.enqueue(a.clone(), at(0));
        outbox.enqueue(b.clone(), at(0));
        outbox.mark_in_flight(a.id);
        outbox.mark_failed(b.id, at(0), Duration::from_secs(600));
        drop(outbox);

        let reopened = EventOutbox::open(Box::new(store.clone()), 8, at(0)).unwrap();
        assert_eq!(reopened.len(), 2);
        let first = reopened.peek_ready(at(0)).unwrap();
        assert_eq!(first.event.id, a.id);
        assert_eq!(first.state, EntryState::Pending);
        let second = reopened.get(b.id).unwrap();
        assert_eq!(second.attempts, 1);
        assert_eq!(second.next_attempt_at, at(0));
        assert!(store.snapshot().iter().all(|s| s.state == EntryState::Pending));
    }

    #[test]
    fn persist_failure_keeps_event_in_memory() {
        let clock = ManualClock::starting_at_default();
        let (mut outbox, store) = memory_outbox(8);
        store.set_fail_writes(true);
        outbox.enqueue(event(&clock), at(0));

        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox.persist_failures(), 1);
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outbox.json");
        let clock = ManualClock::starting_at_default();
        let a = event(&clock);

        {
            let mut outbox =
                EventOutbox::open(Box::new(JsonFileStore::new(&path)), 8, at(0)).unwrap();
            outbox.enqueue(a.clone(), at(0));
            outbox.mark_in_flight(a.id);
        }

        let reopened = EventOutbox::open(Box::new(JsonFileStore::new(&path)), 8, at(0)).unwrap();
        let entry = reopened.peek_ready(at(0)).unwrap();
        assert_eq!(entry.event, a);
        assert_eq!(entry.state, EntryState::Pending);
        assert!(!dir.path().join("outbox.json.tmp").exists());
    }

    #[test]
    fn corrupt_file_is_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outbox.json");
        fs::write(&path, b"{not json").unwrap();

        let mut store = JsonFileStore::new(&path);
        assert!(matches!(store.load(), Err(StoreError::Corrupt { .. })));
        assert!(dir.path().join("outbox.json.corrupt").exists());
        assert!(!path.exists());

        // Next open starts clean.
        let outbox = EventOutbox::open(Box::new(JsonFileStore::new(&path)), 8, at(0)).unwrap();
        assert!(outbox.is_empty());
    }

    #[test]
    fn second_corruption_keeps_first_quarantined_copy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outbox.json");
        let mut store = JsonFileStore::new(&path);

        fs::write(&path, b"first").unwrap();
        assert!(store.load().is_err());
        fs::write(&path, b"second").unwrap();
        assert!(store.load().is_err());

        assert_eq!(fs::read(dir.path().join("outbox.json.corrupt")).unwrap(), b"first");
        assert_eq!(fs::read(dir.path().join("outbox.json.corrupt.1")).unwrap(), b"second");
    }

    /// Fails the first `failures` loads, then behaves like the wrapped store.
    struct UnreadableAtBoot {
        inner: MemoryStore,
        failures: u32,
    }

    impl OutboxStore for UnreadableAtBoot {
        fn load(&mut self) -> Result<Vec<StoredEntry>, StoreError> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(StoreError::Unavailable);
            }
            self.inner.load()
        }

        fn save(&mut self, entries: &[StoredEntry]) -> Result<(), StoreError> {
            self.inner.save(entries)
        }
    }

    #[test]
    fn transient_load_failure_keeps_stored_events() {
        let clock = ManualClock::starting_at_default();
        let (mut outbox, store) = memory_outbox(8);
        outbox.enqueue(event(&clock), at(0));
        outbox.enqueue(event(&clock), at(0));
        drop(outbox);

        let flaky = UnreadableAtBoot {
            inner: store.clone(),
            failures: 1,
        };
        let mut reopened = EventOutbox::open(Box::new(flaky), 8, at(0)).unwrap();
        assert_eq!(reopened.len(), 2);
        reopened.enqueue(event(&clock), at(0));
        assert_eq!(store.snapshot().len(), 3);
    }

    #[test]
    fn unreadable_store_fails_open_without_overwriting() {
        let clock = ManualClock::starting_at_default();
        let (mut outbox, store) = memory_outbox(8);
        outbox.enqueue(event(&clock), at(0));
        outbox.enqueue(event(&clock), at(0));
        drop(outbox);

        let dead = UnreadableAtBoot {
            inner: store.clone(),
            failures: u32::MAX,
        };
        let result = EventOutbox::open(Box::new(dead), 8, at(0));
        assert!(matches!(result, Err(StoreError::Unavailable)));
        assert_eq!(store.snapshot().len(), 2);
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonFileStore::new(dir.path().join("absent.json"));
        assert!(store.load().unwrap().is_empty());
    }
}
