//! Round-robin condition assignment backed by a shared counter record.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error};

use crate::{atomic_write_json_pretty, ensure_dir, Error, Result};

/// Outcome of one participant allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConditionAssignment {
    pub condition: String,
    pub counter: u64,
}

/// Map a counter value onto the ordered condition list.
///
/// The new participant advances the counter by one and receives
/// `conditions[new_counter % len]`, so consecutive participants walk the
/// list round-robin. The caller owns persisting `counter` back to the
/// shared record; see [`allocate`] for the indivisible form.
pub fn assign_condition(counter: u64, conditions: &[String]) -> Result<ConditionAssignment> {
    if conditions.is_empty() {
        return Err(Error::InvalidConfig(
            "condition list is empty".to_string(),
        ));
    }
    let next = counter + 1;
    let idx = (next % conditions.len() as u64) as usize;
    Ok(ConditionAssignment {
        condition: conditions[idx].clone(),
        counter: next,
    })
}

/// The shared counter record: one integer at a well-known location, read at
/// session start and advanced once per new participant.
pub trait CounterStore {
    fn read(&self) -> Result<u64>;
    fn write(&self, value: u64) -> Result<()>;
    /// Advance the counter as a single indivisible step and return the new
    /// value.
    fn increment_and_fetch(&self) -> Result<u64>;
}

/// Read-then-write allocation as the browser scripts performed it. Two
/// sessions that both read before either writes receive the same condition
/// and leave the counter advanced by one instead of two. Kept so the hazard
/// stays visible; sessions use [`allocate`].
pub fn allocate_naive(
    store: &dyn CounterStore,
    conditions: &[String],
) -> Result<ConditionAssignment> {
    let current = store.read()?;
    let assignment = assign_condition(current, conditions)?;
    store.write(assignment.counter)?;
    Ok(assignment)
}

/// Allocate the next participant's condition through the store's atomic
/// increment, so concurrent sessions can never observe the same counter.
pub fn allocate(store: &dyn CounterStore, conditions: &[String]) -> Result<ConditionAssignment> {
    if conditions.is_empty() {
        return Err(Error::InvalidConfig(
            "condition list is empty".to_string(),
        ));
    }
    let counter = store.increment_and_fetch()?;
    let idx = (counter % conditions.len() as u64) as usize;
    Ok(ConditionAssignment {
        condition: conditions[idx].clone(),
        counter,
    })
}

#[derive(Debug)]
struct CounterLock {
    path: PathBuf,
}

impl Drop for CounterLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Counter record persisted as a JSON file under a state directory.
///
/// `read` and `write` are deliberately lock-free, matching the remote
/// record the browser scripts mutated; `increment_and_fetch` holds an
/// exclusive lock file across the whole read-modify-write.
#[derive(Debug, Clone)]
pub struct FileCounterStore {
    state_dir: PathBuf,
}

impl FileCounterStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    fn counter_path(&self) -> PathBuf {
        self.state_dir.join("condition_counter.json")
    }

    fn lock_path(&self) -> PathBuf {
        self.state_dir.join("condition_counter.lock")
    }

    fn acquire_lock(&self, deadline: Instant) -> Result<CounterLock> {
        let lock_path = self.lock_path();
        if let Some(parent) = lock_path.parent() {
            ensure_dir(parent)?;
        }
        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(mut file) => {
                    let payload = format!(
                        "{{\"pid\":{},\"acquired_at\":\"{}\"}}\n",
                        std::process::id(),
                        Utc::now().to_rfc3339()
                    );
                    let _ = file.write_all(payload.as_bytes());
                    return Ok(CounterLock { path: lock_path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if Instant::now() >= deadline {
                        return Err(Error::CounterContention(format!(
                            "counter lock held too long: {}",
                            lock_path.display()
                        )));
                    }
                    thread::sleep(Duration::from_millis(5));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn read_record(&self) -> Result<u64> {
        let path = self.counter_path();
        if !path.exists() {
            return Ok(0);
        }
        let value: Value = serde_json::from_slice(&fs::read(&path)?)?;
        Ok(value
            .pointer("/condition")
            .and_then(|v| v.as_u64())
            .unwrap_or(0))
    }

    fn write_record(&self, value: u64) -> Result<()> {
        let payload = json!({
            "condition": value,
            "updated_at": Utc::now().to_rfc3339(),
        });
        atomic_write_json_pretty(&self.counter_path(), &payload)
    }
}

impl CounterStore for FileCounterStore {
    fn read(&self) -> Result<u64> {
        self.read_record()
    }

    fn write(&self, value: u64) -> Result<()> {
        self.write_record(value)
    }

    fn increment_and_fetch(&self) -> Result<u64> {
        let _lock = self.acquire_lock(Instant::now() + Duration::from_secs(10))?;
        let next = self.read_record()? + 1;
        self.write_record(next)?;
        debug!(counter = next, "advanced condition counter");
        Ok(next)
    }
}

/// Counter record held by a remote backend.
///
/// `increment_and_fetch` posts to an allocation endpoint so the backend
/// performs the increment transactionally; plain GET/PUT of the record
/// stays available for inspection and seeding.
#[derive(Debug, Clone)]
pub struct HttpCounterStore {
    client: reqwest::blocking::Client,
    record_url: String,
    allocate_url: String,
}

impl HttpCounterStore {
    pub fn new(record_url: impl Into<String>, allocate_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::blocking::Client::new(),
            record_url: record_url.into(),
            allocate_url: allocate_url.into(),
        }
    }
}

impl CounterStore for HttpCounterStore {
    fn read(&self) -> Result<u64> {
        let value: Value = self
            .client
            .get(&self.record_url)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| {
                error!("counter_read_failed: {}", e);
                e
            })?
            .json()?;
        Ok(value
            .pointer("/condition")
            .and_then(|v| v.as_u64())
            .unwrap_or(0))
    }

    fn write(&self, value: u64) -> Result<()> {
        self.client
            .put(&self.record_url)
            .json(&json!({ "condition": value }))
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| {
                error!("counter_write_failed: {}", e);
                e
            })?;
        Ok(())
    }

    fn increment_and_fetch(&self) -> Result<u64> {
        let value: Value = self
            .client
            .post(&self.allocate_url)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| {
                error!("counter_allocation_failed: {}", e);
                e
            })?
            .json()?;
        value
            .pointer("/condition")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| {
                Error::InvalidConfig("allocation response missing condition field".to_string())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn conditions(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn temp_store(tag: &str) -> (FileCounterStore, PathBuf) {
        let dir = std::env::temp_dir().join(format!(
            "perlab_rotation_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&dir).expect("temp dir");
        (FileCounterStore::new(&dir), dir)
    }

    #[test]
    fn assignment_follows_the_rotation_formula() {
        let list = conditions(&["condE", "condA", "condC"]);
        for counter in [0u64, 1, 2, 3, 17, 299] {
            let assignment = assign_condition(counter, &list).expect("assignment");
            assert_eq!(assignment.counter, counter + 1);
            assert_eq!(
                assignment.condition,
                list[((counter + 1) % 3) as usize],
                "wrong condition for counter {}",
                counter
            );
        }
    }

    #[test]
    fn full_cycle_visits_every_condition_exactly_once() {
        let list = conditions(&["a", "b", "c", "d", "e"]);
        for start in [0u64, 3, 11] {
            let mut seen = Vec::new();
            let mut counter = start;
            for _ in 0..list.len() {
                let assignment = assign_condition(counter, &list).expect("assignment");
                counter = assignment.counter;
                seen.push(assignment.condition);
            }
            let mut sorted = seen.clone();
            sorted.sort();
            sorted.dedup();
            assert_eq!(sorted.len(), list.len(), "repeat within cycle from {}: {:?}", start, seen);
        }
    }

    #[test]
    fn empty_condition_list_is_invalid() {
        let err = assign_condition(0, &[]).expect_err("should fail");
        assert!(err.to_string().contains("invalid_config"));
        let (store, dir) = temp_store("empty");
        assert!(allocate(&store, &[]).is_err());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn file_store_reads_zero_before_first_participant() {
        let (store, dir) = temp_store("fresh");
        assert_eq!(store.read().expect("read"), 0);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn naive_read_then_write_duplicates_the_assignment() {
        // Two sessions interleave: both read the counter before either
        // writes it back. This is the check-then-act race of the original
        // design, reproduced deterministically.
        let (store, dir) = temp_store("race");
        let list = conditions(&["condE", "condA", "condC"]);

        let seen_by_first = store.read().expect("first read");
        let seen_by_second = store.read().expect("second read");
        let first = assign_condition(seen_by_first, &list).expect("first assignment");
        store.write(first.counter).expect("first write");
        let second = assign_condition(seen_by_second, &list).expect("second assignment");
        store.write(second.counter).expect("second write");

        assert_eq!(first.condition, second.condition, "race did not reproduce");
        assert_eq!(store.read().expect("final read"), 1, "one increment lost");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn atomic_allocation_never_duplicates() {
        let (store, dir) = temp_store("atomic");
        let list = conditions(&["condE", "condA", "condC"]);
        let first = allocate(&store, &list).expect("first allocation");
        let second = allocate(&store, &list).expect("second allocation");
        assert_ne!(first.counter, second.counter);
        assert_ne!(first.condition, second.condition);
        assert_eq!(store.read().expect("final read"), 2);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn concurrent_atomic_increments_stay_distinct() {
        let (store, dir) = temp_store("threads");
        let store = Arc::new(store);
        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = Arc::clone(&store);
            handles.push(thread::spawn(move || {
                let mut values = Vec::new();
                for _ in 0..10 {
                    values.push(store.increment_and_fetch().expect("increment"));
                }
                values
            }));
        }
        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().expect("thread join"))
            .collect();
        all.sort_unstable();
        let expected: Vec<u64> = (1..=40).collect();
        assert_eq!(all, expected, "lost or duplicated increments");
        assert_eq!(store.read().expect("final read"), 40);
        let _ = fs::remove_dir_all(dir);
    }
}
