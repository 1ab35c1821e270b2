//! Assembly of the ordered trial sequence handed to the presentation
//! runtime.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::breaks::BreakPolicy;
use crate::config::{StimulusConfig, StimulusRecord};
use crate::{Error, Result};

/// How an entry counts toward session arithmetic. Only `Test` entries are
/// scored: break intervals and completion are computed over them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialRole {
    Consent,
    Instruction,
    ToneCheck,
    Feedback,
    Fullscreen,
    Info,
    Fixation,
    Practice,
    Test,
    Break,
    Halfway,
    Upload,
    Redirect,
}

/// One trial specification. The `type` tag names the plugin the
/// presentation runtime dispatches on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TrialSpec {
    Consent {
        url: String,
        button_id: String,
    },
    Instructions {
        pages: Vec<String>,
    },
    Fullscreen {
        enter: bool,
    },
    HtmlScreen {
        stimulus: String,
        #[serde(default)]
        advance_key: Option<String>,
        #[serde(default)]
        duration_ms: Option<u64>,
    },
    AudioKeyboardResponse {
        audio: String,
        prompt: String,
        choices: Vec<String>,
        post_trial_gap_ms: u64,
        #[serde(default)]
        data: BTreeMap<String, String>,
    },
    AudioButtonResponse {
        audio: String,
        prompt: String,
        choices: Vec<String>,
        correct_choice: u32,
    },
    /// Rendered by the runtime as "your score was N out of `out_of`",
    /// counting correct responses among entries of `counts_role`.
    ScoreFeedback {
        counts_role: TrialRole,
        out_of: usize,
        advance_key: String,
    },
    BreakScreen {
        message: String,
    },
    HalfwayScreen {
        message: String,
        save_interim_results: bool,
    },
    UploadResults {
        message: String,
    },
    Redirect {
        url: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub role: TrialRole,
    #[serde(flatten)]
    pub spec: TrialSpec,
}

impl TimelineEntry {
    fn new(role: TrialRole, spec: TrialSpec) -> Self {
        Self { role, spec }
    }
}

/// Build the complete session timeline for one participant in one
/// condition: consent and instructions, headphone check, practice, the
/// condition's blocks with interval breaks woven in, then upload and
/// redirect.
pub fn build_timeline(
    config: &StimulusConfig,
    condition: &str,
    participant_id: &str,
) -> Result<Vec<TimelineEntry>> {
    let set = config.conditions.sets.get(condition).ok_or_else(|| {
        Error::InvalidConfig(format!("unknown condition: {}", condition))
    })?;
    let scored_total = set.scored_trials();
    let policy = BreakPolicy::new(config.breaks.interval, scored_total)?;
    let mut rng = match config.design.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };

    let mut entries = Vec::new();

    entries.push(TimelineEntry::new(
        TrialRole::Consent,
        TrialSpec::Consent {
            url: config.consent.url.clone(),
            button_id: config.consent.button_id.clone(),
        },
    ));
    push_instructions(&mut entries, &config.instructions.preparation);

    if let Some(check) = &config.headphone_check {
        for _ in 0..check.sample_size {
            let tone = &check.tones[rng.random_range(0..check.tones.len())];
            entries.push(TimelineEntry::new(
                TrialRole::ToneCheck,
                TrialSpec::AudioButtonResponse {
                    audio: tone.audio.clone(),
                    prompt: check.prompt.clone(),
                    choices: check.choices.clone(),
                    correct_choice: tone.correct_choice,
                },
            ));
        }
        entries.push(TimelineEntry::new(
            TrialRole::Feedback,
            TrialSpec::ScoreFeedback {
                counts_role: TrialRole::ToneCheck,
                out_of: check.sample_size,
                advance_key: " ".to_string(),
            },
        ));
    }

    entries.push(TimelineEntry::new(
        TrialRole::Fullscreen,
        TrialSpec::Fullscreen { enter: true },
    ));
    push_instructions(&mut entries, &config.instructions.main);

    if let Some(info) = &config.practice.info {
        entries.push(info_screen(info));
    }
    for stimulus in ordered(&config.practice.stimuli, config.design.shuffle, &mut rng) {
        push_stimulus_trial(&mut entries, config, &stimulus, TrialRole::Practice);
    }
    push_instructions(&mut entries, &config.instructions.closing);

    let block_count = set.blocks.len();
    let mut scored = 0u32;
    for (i, block) in set.blocks.iter().enumerate() {
        entries.push(info_screen(&block.speaker_info));
        for stimulus in ordered(&block.stimuli, config.design.shuffle, &mut rng) {
            push_stimulus_trial(&mut entries, config, &stimulus, TrialRole::Test);
            scored += 1;
            if policy.offers_break_after(scored) {
                entries.push(TimelineEntry::new(
                    TrialRole::Break,
                    TrialSpec::BreakScreen {
                        message: config.messages.break_message.clone(),
                    },
                ));
            }
        }
        if i + 1 < block_count {
            // A two-block session pauses on the dedicated halfway screen;
            // longer runs get a plain rest screen between blocks.
            if block_count == 2 {
                entries.push(TimelineEntry::new(
                    TrialRole::Halfway,
                    TrialSpec::HalfwayScreen {
                        message: config.messages.halfway.clone(),
                        save_interim_results: true,
                    },
                ));
            } else {
                entries.push(TimelineEntry::new(
                    TrialRole::Break,
                    TrialSpec::BreakScreen {
                        message: config.messages.break_message.clone(),
                    },
                ));
            }
        }
    }

    entries.push(TimelineEntry::new(
        TrialRole::Fullscreen,
        TrialSpec::Fullscreen { enter: false },
    ));
    entries.push(TimelineEntry::new(
        TrialRole::Upload,
        TrialSpec::UploadResults {
            message: config.messages.completion.clone(),
        },
    ));
    if let Some(survey_url) = &config.experiment.survey_url {
        entries.push(TimelineEntry::new(
            TrialRole::Redirect,
            TrialSpec::Redirect {
                url: redirect_url(survey_url, participant_id),
            },
        ));
    }

    Ok(entries)
}

fn push_instructions(entries: &mut Vec<TimelineEntry>, pages: &[String]) {
    if pages.is_empty() {
        return;
    }
    entries.push(TimelineEntry::new(
        TrialRole::Instruction,
        TrialSpec::Instructions {
            pages: pages.to_vec(),
        },
    ));
}

fn info_screen(stimulus: &str) -> TimelineEntry {
    TimelineEntry::new(
        TrialRole::Info,
        TrialSpec::HtmlScreen {
            stimulus: stimulus.to_string(),
            advance_key: Some(" ".to_string()),
            duration_ms: None,
        },
    )
}

/// The fixed inter-trial template: a brief prompt screen, then the audio
/// stimulus with keyboard response capture, annotated with the stimulus's
/// own metadata.
fn push_stimulus_trial(
    entries: &mut Vec<TimelineEntry>,
    config: &StimulusConfig,
    stimulus: &StimulusRecord,
    role: TrialRole,
) {
    entries.push(TimelineEntry::new(
        TrialRole::Fixation,
        TrialSpec::HtmlScreen {
            stimulus: config.messages.prompt.clone(),
            advance_key: None,
            duration_ms: Some(500),
        },
    ));
    entries.push(TimelineEntry::new(
        role,
        TrialSpec::AudioKeyboardResponse {
            audio: stimulus.audio.clone(),
            prompt: config.messages.prompt.clone(),
            choices: config.response.choices.clone(),
            post_trial_gap_ms: 500,
            data: stimulus.data.fields(),
        },
    ));
}

fn ordered(records: &[StimulusRecord], shuffle: bool, rng: &mut StdRng) -> Vec<StimulusRecord> {
    let mut out = records.to_vec();
    if shuffle {
        out.shuffle(rng);
    }
    out
}

fn redirect_url(survey_url: &str, participant_id: &str) -> String {
    let sep = if survey_url.contains('?') { '&' } else { '?' };
    format!("{}{}PROLIFIC_PID={}", survey_url, sep, participant_id)
}
