//! Session bootstrap: the linear sequence of fallible stages that turns a
//! loaded configuration and the page's query parameters into a runnable
//! session, and the finish stage that exports and stores its results.

use std::fs;
use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::info;

use crate::config::{QueryParams, StimulusConfig};
use crate::results::{
    events_to_csv, storage_key, ResultsStore, SessionProperties, TrialEvent,
};
use crate::rotation::{allocate, CounterStore};
use crate::timeline::{build_timeline, TimelineEntry};
use crate::{atomic_write_json_pretty, Error, Result};

/// Tracks which participants already completed an experiment; the same
/// person never runs the same stimuli twice.
pub trait CompletionStore {
    fn is_complete(&self, experiment_id: &str, participant_id: &str) -> Result<bool>;
    fn mark_complete(&self, experiment_id: &str, participant_id: &str) -> Result<()>;
}

/// Completions kept as one JSON document under the state directory,
/// keyed experiment then participant.
#[derive(Debug, Clone)]
pub struct FileCompletionStore {
    state_dir: PathBuf,
}

impl FileCompletionStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    fn path(&self) -> PathBuf {
        self.state_dir.join("completions.json")
    }

    fn read_all(&self) -> Result<Value> {
        let path = self.path();
        if !path.exists() {
            return Ok(json!({}));
        }
        Ok(serde_json::from_slice(&fs::read(&path)?)?)
    }
}

impl CompletionStore for FileCompletionStore {
    fn is_complete(&self, experiment_id: &str, participant_id: &str) -> Result<bool> {
        let all = self.read_all()?;
        Ok(all
            .get(experiment_id)
            .and_then(|exp| exp.get(participant_id))
            .is_some())
    }

    fn mark_complete(&self, experiment_id: &str, participant_id: &str) -> Result<()> {
        // The demo identity is for piloting and is never recorded.
        if participant_id == "demo" {
            return Ok(());
        }
        let mut all = match self.read_all()? {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        let entry = all
            .entry(experiment_id.to_string())
            .or_insert_with(|| json!({}));
        if let Some(map) = entry.as_object_mut() {
            map.insert(participant_id.to_string(), json!({ "complete": 1 }));
        }
        atomic_write_json_pretty(&self.path(), &Value::Object(all))
    }
}

/// A bootstrapped session, ready to hand to the presentation runtime.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub participant_id: String,
    pub study_id: Option<String>,
    pub condition: String,
    /// Counter value that produced the condition; `None` when the condition
    /// came from a query override.
    pub counter: Option<u64>,
    pub storage_key: String,
    pub timeline: Vec<TimelineEntry>,
}

/// Bootstrap one session: check the participant is new, resolve the
/// condition (query override wins, otherwise one atomic counter
/// allocation), assemble the timeline, and fix the results location.
pub fn bootstrap_session(
    config: &StimulusConfig,
    query: &QueryParams,
    counters: &dyn CounterStore,
    completions: &dyn CompletionStore,
) -> Result<Session> {
    let participant_id = query
        .participant_id
        .clone()
        .ok_or_else(|| Error::InvalidConfig("missing participant identifier".to_string()))?;

    if completions.is_complete(&config.experiment.id, &participant_id)? {
        return Err(Error::AlreadyParticipated(format!(
            "participant {} already completed {}",
            participant_id, config.experiment.id
        )));
    }

    let (condition, counter) = match &query.condition {
        Some(name) => {
            if !config.conditions.sets.contains_key(name) {
                return Err(Error::InvalidConfig(format!(
                    "condition override names unknown condition: {}",
                    name
                )));
            }
            (name.clone(), None)
        }
        None => {
            let assignment = allocate(counters, &config.conditions.rotation)?;
            (assignment.condition, Some(assignment.counter))
        }
    };

    let timeline = build_timeline(config, &condition, &participant_id)?;
    let storage_key = storage_key(&config.experiment.id, &participant_id, Utc::now());
    info!(
        participant = %participant_id,
        condition = %condition,
        entries = timeline.len(),
        "session ready"
    );

    Ok(Session {
        participant_id,
        study_id: query.study_id.clone(),
        condition,
        counter,
        storage_key,
        timeline,
    })
}

/// Export the recorded events as CSV, store the artifact under its key,
/// and record the participant's completion.
pub fn finish_session(
    experiment_id: &str,
    props: &SessionProperties,
    key: &str,
    events: &[TrialEvent],
    results: &dyn ResultsStore,
    completions: &dyn CompletionStore,
) -> Result<String> {
    let csv = events_to_csv(events, props);
    let location = results.store(key, csv.as_bytes())?;
    completions.mark_complete(experiment_id, &props.participant_id)?;
    Ok(location)
}

#[derive(Debug, Clone, Serialize)]
pub struct ConditionSummary {
    pub name: String,
    pub blocks: usize,
    pub scored_trials: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigSummary {
    pub experiment_id: String,
    pub rotation: Vec<String>,
    pub break_interval: u32,
    pub practice_trials: usize,
    pub headphone_tones: usize,
    pub conditions: Vec<ConditionSummary>,
}

pub fn summarize_config(config: &StimulusConfig) -> ConfigSummary {
    ConfigSummary {
        experiment_id: config.experiment.id.clone(),
        rotation: config.conditions.rotation.clone(),
        break_interval: config.breaks.interval,
        practice_trials: config.practice.stimuli.len(),
        headphone_tones: config
            .headphone_check
            .as_ref()
            .map(|c| c.tones.len())
            .unwrap_or(0),
        conditions: config
            .conditions
            .sets
            .iter()
            .map(|(name, set)| ConditionSummary {
                name: name.clone(),
                blocks: set.blocks.len(),
                scored_trials: set.scored_trials(),
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_config;
    use crate::results::FsResultsStore;
    use crate::rotation::FileCounterStore;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "perlab_session_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        crate::ensure_dir(&dir).expect("temp dir");
        dir
    }

    fn query(participant: &str) -> QueryParams {
        QueryParams {
            participant_id: Some(participant.to_string()),
            study_id: Some("study1".to_string()),
            condition: None,
        }
    }

    #[test]
    fn override_skips_the_counter() {
        let dir = temp_dir("override");
        let counters = FileCounterStore::new(&dir);
        let completions = FileCompletionStore::new(&dir);
        let config = sample_config();
        let mut q = query("p1");
        q.condition = Some("condA".to_string());
        let session =
            bootstrap_session(&config, &q, &counters, &completions).expect("session");
        assert_eq!(session.condition, "condA");
        assert_eq!(session.counter, None);
        assert_eq!(counters.read().expect("read"), 0, "counter was touched");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn unknown_override_is_invalid() {
        let dir = temp_dir("bad_override");
        let counters = FileCounterStore::new(&dir);
        let completions = FileCompletionStore::new(&dir);
        let config = sample_config();
        let mut q = query("p1");
        q.condition = Some("condZ".to_string());
        let err = bootstrap_session(&config, &q, &counters, &completions)
            .expect_err("should fail");
        assert!(err.to_string().contains("unknown condition"));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn consecutive_sessions_rotate_conditions() {
        let dir = temp_dir("rotate");
        let counters = FileCounterStore::new(&dir);
        let completions = FileCompletionStore::new(&dir);
        let config = sample_config();
        let first =
            bootstrap_session(&config, &query("p1"), &counters, &completions).expect("first");
        let second =
            bootstrap_session(&config, &query("p2"), &counters, &completions).expect("second");
        assert_eq!(first.counter, Some(1));
        assert_eq!(second.counter, Some(2));
        assert_eq!(first.condition, config.conditions.rotation[1]);
        assert_eq!(second.condition, config.conditions.rotation[0]);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn missing_participant_id_is_invalid() {
        let dir = temp_dir("no_pid");
        let counters = FileCounterStore::new(&dir);
        let completions = FileCompletionStore::new(&dir);
        let config = sample_config();
        let err = bootstrap_session(&config, &QueryParams::default(), &counters, &completions)
            .expect_err("should fail");
        assert!(err.to_string().contains("participant"));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn repeat_participants_are_rejected() {
        let dir = temp_dir("repeat");
        let counters = FileCounterStore::new(&dir);
        let completions = FileCompletionStore::new(&dir);
        let config = sample_config();
        completions
            .mark_complete(&config.experiment.id, "p1")
            .expect("mark");
        let err = bootstrap_session(&config, &query("p1"), &counters, &completions)
            .expect_err("should fail");
        assert!(err.to_string().contains("already_participated"));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn finish_stores_the_artifact_and_records_completion() {
        let dir = temp_dir("finish");
        let completions = FileCompletionStore::new(&dir);
        let results = FsResultsStore::new(dir.join("uploads"));
        let props = SessionProperties {
            participant_id: "p9".to_string(),
            condition: "condE".to_string(),
        };
        let events = vec![TrialEvent {
            trial_index: 1,
            trial_role: "test".to_string(),
            stimulus: Some("stim/e1.wav".to_string()),
            key_response: Some("1".to_string()),
            correct: Some(true),
            rt_ms: Some(712),
            data: Default::default(),
        }];
        let key = "results/vowels-online/2026-3-5/p9_17.csv";
        let location = finish_session(
            "vowels-online",
            &props,
            key,
            &events,
            &results,
            &completions,
        )
        .expect("finish");
        assert!(location.ends_with("p9_17.csv"));
        assert!(completions
            .is_complete("vowels-online", "p9")
            .expect("check"));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn demo_participant_is_never_recorded() {
        let dir = temp_dir("demo");
        let completions = FileCompletionStore::new(&dir);
        completions.mark_complete("vowels-online", "demo").expect("mark");
        assert!(!completions
            .is_complete("vowels-online", "demo")
            .expect("check"));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn summary_counts_blocks_and_trials() {
        let config = sample_config();
        let summary = summarize_config(&config);
        assert_eq!(summary.experiment_id, "vowels-online");
        assert_eq!(summary.rotation, vec!["condE", "condA"]);
        assert_eq!(summary.break_interval, 2);
        assert_eq!(summary.practice_trials, 2);
        assert_eq!(summary.headphone_tones, 3);
        let cond_e = summary
            .conditions
            .iter()
            .find(|c| c.name == "condE")
            .expect("condE");
        assert_eq!(cond_e.blocks, 2);
        assert_eq!(cond_e.scored_trials, 8);
    }
}
