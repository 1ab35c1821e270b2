//! Recorded trial events and the CSV results artifact.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::{atomic_write_bytes, Result};

/// One presentation-plus-response event recorded by the runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialEvent {
    pub trial_index: u64,
    pub trial_role: String,
    #[serde(default)]
    pub stimulus: Option<String>,
    #[serde(default)]
    pub key_response: Option<String>,
    #[serde(default)]
    pub correct: Option<bool>,
    #[serde(default)]
    pub rt_ms: Option<u64>,
    /// Stimulus metadata stamped onto the trial; values stay strings.
    #[serde(flatten)]
    pub data: BTreeMap<String, String>,
}

/// Session-wide properties added to every exported row.
#[derive(Debug, Clone, Serialize)]
pub struct SessionProperties {
    pub participant_id: String,
    pub condition: String,
}

/// Read a JSONL event log, one event per non-empty line.
pub fn load_events(path: &Path) -> Result<Vec<TrialEvent>> {
    let data = fs::read_to_string(path)?;
    let mut events = Vec::new();
    for line in data.lines() {
        if line.trim().is_empty() {
            continue;
        }
        events.push(serde_json::from_str(line)?);
    }
    Ok(events)
}

const FIXED_COLUMNS: [&str; 8] = [
    "participantId",
    "condition",
    "trial_index",
    "trial_role",
    "stimulus",
    "key_response",
    "correct",
    "rt_ms",
];

/// Export all recorded events as comma-separated values: the fixed columns
/// first, then every metadata key in first-seen order across the run.
pub fn events_to_csv(events: &[TrialEvent], props: &SessionProperties) -> String {
    let mut extra_columns: Vec<String> = Vec::new();
    for event in events {
        for key in event.data.keys() {
            if !extra_columns.iter().any(|c| c == key) {
                extra_columns.push(key.clone());
            }
        }
    }

    let mut out = String::new();
    let header: Vec<&str> = FIXED_COLUMNS
        .iter()
        .copied()
        .chain(extra_columns.iter().map(String::as_str))
        .collect();
    push_row(&mut out, &header);

    for event in events {
        let trial_index = event.trial_index.to_string();
        let correct = event.correct.map(|c| c.to_string()).unwrap_or_default();
        let rt = event.rt_ms.map(|v| v.to_string()).unwrap_or_default();
        let mut row: Vec<&str> = vec![
            &props.participant_id,
            &props.condition,
            &trial_index,
            &event.trial_role,
            event.stimulus.as_deref().unwrap_or(""),
            event.key_response.as_deref().unwrap_or(""),
            &correct,
            &rt,
        ];
        for column in &extra_columns {
            row.push(event.data.get(column).map(String::as_str).unwrap_or(""));
        }
        push_row(&mut out, &row);
    }
    out
}

fn push_row(out: &mut String, cells: &[&str]) {
    for (i, cell) in cells.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&csv_escape(cell));
    }
    out.push('\n');
}

fn csv_escape(cell: &str) -> String {
    if cell.contains(',') || cell.contains('"') || cell.contains('\n') || cell.contains('\r') {
        format!("\"{}\"", cell.replace('"', "\"\""))
    } else {
        cell.to_string()
    }
}

/// Storage path for a results artifact, keyed by experiment, date, and
/// participant. Month and day are unpadded, as the legacy uploader wrote
/// them.
pub fn storage_key(experiment: &str, participant: &str, at: DateTime<Utc>) -> String {
    format!(
        "results/{}/{}/{}_{}.csv",
        experiment,
        at.format("%Y-%-m-%-d"),
        participant,
        at.timestamp_millis()
    )
}

/// Remote content store for results artifacts. Upload failure is logged
/// and terminal; there is no retry.
pub trait ResultsStore {
    /// Store the blob under `key` and return its final location.
    fn store(&self, key: &str, bytes: &[u8]) -> Result<String>;
}

/// Results kept on the local filesystem under a root directory.
#[derive(Debug, Clone)]
pub struct FsResultsStore {
    root: PathBuf,
}

impl FsResultsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ResultsStore for FsResultsStore {
    fn store(&self, key: &str, bytes: &[u8]) -> Result<String> {
        let path = self.root.join(key);
        atomic_write_bytes(&path, bytes)?;
        info!("stored results at {}", path.display());
        Ok(path.display().to_string())
    }
}

/// Results uploaded to a remote content store.
#[derive(Debug, Clone)]
pub struct HttpResultsStore {
    client: reqwest::blocking::Client,
    base_url: String,
}

impl HttpResultsStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::blocking::Client::new(),
            base_url: base_url.into(),
        }
    }
}

impl ResultsStore for HttpResultsStore {
    fn store(&self, key: &str, bytes: &[u8]) -> Result<String> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), key);
        self.client
            .put(&url)
            .body(bytes.to_vec())
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| {
                error!("results_upload_failed: {} ({})", url, e);
                e
            })?;
        info!("uploaded results to {}", url);
        Ok(url)
    }
}
