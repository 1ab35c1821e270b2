//! Stimulus configuration: the structured document fetched once per
//! session, plus the URL query parameters merged into it at load time.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::{Error, Result};

/// Parse the delimited `key:value` metadata string carried by legacy
/// stimulus lists: pairs split on `", "`, key and value split on `":"`.
/// Later duplicate keys overwrite earlier ones; segments past the first
/// colon's value are dropped. A pair without a colon silently maps to an
/// empty value. No validation happens here; a malformed string produces an
/// incomplete mapping, never an error.
pub fn parse_data_string(raw: &str) -> BTreeMap<String, String> {
    let mut fields = BTreeMap::new();
    if raw.is_empty() {
        return fields;
    }
    for pair in raw.split(", ") {
        let mut parts = pair.split(':');
        let key = parts.next().unwrap_or("").to_string();
        let value = parts.next().unwrap_or("").to_string();
        fields.insert(key, value);
    }
    fields
}

/// Auxiliary metadata on a stimulus record: either the legacy delimited
/// string or an already-structured mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StimulusData {
    Encoded(String),
    Fields(BTreeMap<String, String>),
}

impl StimulusData {
    /// The parsed key-value view; values stay strings, no numeric coercion.
    pub fn fields(&self) -> BTreeMap<String, String> {
        match self {
            StimulusData::Encoded(raw) => parse_data_string(raw),
            StimulusData::Fields(map) => map.clone(),
        }
    }
}

impl Default for StimulusData {
    fn default() -> Self {
        StimulusData::Fields(BTreeMap::new())
    }
}

/// One stimulus: an audio file plus the metadata propagated onto the trial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StimulusRecord {
    pub audio: String,
    #[serde(default)]
    pub data: StimulusData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentInfo {
    pub id: String,
    #[serde(default)]
    pub survey_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentSettings {
    pub url: String,
    #[serde(default = "default_consent_button")]
    pub button_id: String,
}

fn default_consent_button() -> String {
    "start".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Instructions {
    #[serde(default)]
    pub preparation: Vec<String>,
    #[serde(default)]
    pub main: Vec<String>,
    #[serde(default, rename = "final")]
    pub closing: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Messages {
    pub fixation_cross: String,
    pub prompt: String,
    #[serde(rename = "break")]
    pub break_message: String,
    pub halfway: String,
    pub completion: String,
}

/// Headphone screening: tone triplets with a known quietest member,
/// sampled with replacement up to `sample_size`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadphoneCheck {
    pub prompt: String,
    pub choices: Vec<String>,
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,
    pub tones: Vec<ToneStimulus>,
}

fn default_sample_size() -> usize {
    6
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToneStimulus {
    pub audio: String,
    pub correct_choice: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PracticeBlock {
    #[serde(default)]
    pub info: Option<String>,
    #[serde(default)]
    pub stimuli: Vec<StimulusRecord>,
}

/// One block of scored trials under a named speaker guise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockSpec {
    pub name: String,
    pub speaker_info: String,
    #[serde(default)]
    pub guise: Option<String>,
    pub stimuli: Vec<StimulusRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionSet {
    pub blocks: Vec<BlockSpec>,
}

impl ConditionSet {
    /// Count of scored trials a session in this condition runs.
    pub fn scored_trials(&self) -> u32 {
        self.blocks.iter().map(|b| b.stimuli.len() as u32).sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionPlan {
    /// Ordered list the shared counter rotates through.
    pub rotation: Vec<String>,
    pub sets: BTreeMap<String, ConditionSet>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakSettings {
    pub interval: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseSettings {
    #[serde(default = "default_response_choices")]
    pub choices: Vec<String>,
}

fn default_response_choices() -> Vec<String> {
    vec!["1".to_string(), "0".to_string()]
}

impl Default for ResponseSettings {
    fn default() -> Self {
        Self {
            choices: default_response_choices(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DesignSettings {
    #[serde(default)]
    pub shuffle: bool,
    #[serde(default)]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Preload {
    #[serde(default)]
    pub audio: Vec<String>,
    #[serde(default)]
    pub images: Vec<String>,
}

/// The stimulus configuration document, validated at load time so timeline
/// construction never works from an untyped property bag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StimulusConfig {
    pub experiment: ExperimentInfo,
    pub consent: ConsentSettings,
    #[serde(default)]
    pub instructions: Instructions,
    pub messages: Messages,
    #[serde(default)]
    pub headphone_check: Option<HeadphoneCheck>,
    #[serde(default)]
    pub practice: PracticeBlock,
    pub conditions: ConditionPlan,
    pub breaks: BreakSettings,
    #[serde(default)]
    pub response: ResponseSettings,
    #[serde(default)]
    pub design: DesignSettings,
    #[serde(default)]
    pub preload: Preload,
}

impl StimulusConfig {
    /// Load from a local YAML or JSON document and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let config: StimulusConfig = if path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("json"))
            .unwrap_or(false)
        {
            serde_json::from_str(&raw)?
        } else {
            serde_yaml::from_str(&raw)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Fetch the configuration from a remote resource. A failed fetch is
    /// logged and terminal for the session; there is no retry.
    pub fn fetch(url: &str) -> Result<Self> {
        let config: StimulusConfig = reqwest::blocking::get(url)
            .and_then(|r| r.error_for_status())
            .map_err(|e| {
                error!("stimulus_config_fetch_failed: {} ({})", url, e);
                e
            })?
            .json()
            .map_err(|e| {
                error!("stimulus_config_decode_failed: {} ({})", url, e);
                e
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Every problem is collected before reporting, so a bad document is
    /// fixed in one pass.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        if self.experiment.id.trim().is_empty() {
            problems.push("experiment.id is empty".to_string());
        }
        if self.conditions.rotation.is_empty() {
            problems.push("conditions.rotation is empty".to_string());
        }
        for name in &self.conditions.rotation {
            if !self.conditions.sets.contains_key(name) {
                problems.push(format!("conditions.sets has no entry for {}", name));
            }
        }
        for (name, set) in &self.conditions.sets {
            if set.blocks.is_empty() {
                problems.push(format!("condition {} has no blocks", name));
            }
            for block in &set.blocks {
                if block.stimuli.is_empty() {
                    problems.push(format!(
                        "block {} of condition {} has no stimuli",
                        block.name, name
                    ));
                }
            }
        }
        if self.breaks.interval == 0 {
            problems.push("breaks.interval must be positive".to_string());
        }
        if self.response.choices.is_empty() {
            problems.push("response.choices is empty".to_string());
        }
        if let Some(check) = &self.headphone_check {
            if check.tones.is_empty() {
                problems.push("headphone_check.tones is empty".to_string());
            }
            if check.sample_size == 0 {
                problems.push("headphone_check.sample_size must be positive".to_string());
            }
            for tone in &check.tones {
                if tone.correct_choice as usize >= check.choices.len() {
                    problems.push(format!(
                        "headphone_check tone {} answer out of range",
                        tone.audio
                    ));
                }
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidConfig(format!(
                "stimulus configuration invalid:\n{}",
                problems
                    .iter()
                    .map(|p| format!("  - {}", p))
                    .collect::<Vec<_>>()
                    .join("\n")
            )))
        }
    }
}

/// Parameters read from the page URL at load time and injected into the
/// session before use.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams {
    pub participant_id: Option<String>,
    pub study_id: Option<String>,
    pub condition: Option<String>,
}

impl QueryParams {
    /// Parse a raw query string (`PROLIFIC_PID=p1&STUDY_ID=s1&condition=condA`).
    /// Unknown keys are ignored; pairs without `=` are skipped.
    pub fn parse(query: &str) -> Self {
        let mut params = Self::default();
        for pair in query.trim_start_matches('?').split('&') {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            if value.is_empty() {
                continue;
            }
            match key {
                "PROLIFIC_PID" => params.participant_id = Some(value.to_string()),
                "STUDY_ID" => params.study_id = Some(value.to_string()),
                "condition" => params.condition = Some(value.to_string()),
                _ => {}
            }
        }
        params
    }
}
