//! Timeline construction for browser-run speech perception experiments.
//!
//! The library turns a stimulus configuration document into an ordered
//! sequence of trial specifications (consent, instructions, audio trials,
//! breaks, upload, redirect) that an external presentation runtime executes.
//! Participants are counterbalanced across conditions through a shared
//! rotating counter, and recorded trial events are exported as a CSV
//! artifact stored under a path keyed by experiment, date, and participant.

pub mod breaks;
pub mod config;
pub mod results;
pub mod rotation;
pub mod session;
pub mod timeline;

pub use breaks::{should_insert_break, BreakPolicy};
pub use config::{parse_data_string, QueryParams, StimulusConfig};
pub use results::{events_to_csv, load_events, storage_key, SessionProperties, TrialEvent};
pub use rotation::{allocate, assign_condition, ConditionAssignment, CounterStore};
pub use session::{bootstrap_session, finish_session, Session};
pub use timeline::{build_timeline, TimelineEntry, TrialRole, TrialSpec};

use std::fs;
use std::io::Write;
use std::path::Path;

use chrono::Utc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or incomplete configuration. Aborts timeline construction
    /// rather than producing undefined trial counts.
    #[error("invalid_config: {0}")]
    InvalidConfig(String),
    /// The shared counter could not be locked for an allocation.
    #[error("counter_contention: {0}")]
    CounterContention(String),
    /// The participant already has a recorded completion for this experiment.
    #[error("already_participated: {0}")]
    AlreadyParticipated(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

pub(crate) fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// Write through a sibling temp file and rename, so a concurrent reader
/// never observes a partially written record.
pub(crate) fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(
        ".{}.tmp.{}.{}",
        name,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub(crate) fn atomic_write_json_pretty(path: &Path, value: &serde_json::Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}
