use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};

use perlab_timeline::config::{QueryParams, StimulusConfig};
use perlab_timeline::results::{load_events, storage_key, FsResultsStore, SessionProperties};
use perlab_timeline::rotation::{allocate, FileCounterStore};
use perlab_timeline::session::{
    bootstrap_session, finish_session, summarize_config, ConfigSummary, FileCompletionStore,
    Session,
};
use perlab_timeline::events_to_csv;

#[derive(Parser)]
#[command(
    name = "perlab",
    version = "0.2.0",
    about = "Timeline builder for browser-run perception experiments"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Summarize a stimulus configuration
    Describe {
        /// Path or URL of the stimulus configuration
        config: String,
        #[arg(long)]
        json: bool,
    },
    /// Allocate the next participant's condition from the shared counter
    Assign {
        config: String,
        #[arg(long, default_value = ".perlab")]
        state_dir: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Bootstrap a session and write its timeline artifact
    Build {
        config: String,
        #[arg(long)]
        participant: String,
        #[arg(long)]
        study: Option<String>,
        /// Skip the counter and force this condition
        #[arg(long)]
        condition: Option<String>,
        #[arg(long, default_value = ".perlab")]
        state_dir: PathBuf,
        #[arg(long, default_value = "timeline.json")]
        out: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Export recorded trial events as the CSV results artifact
    Export {
        #[arg(long)]
        events: PathBuf,
        #[arg(long)]
        participant: String,
        #[arg(long)]
        condition: String,
        #[arg(long)]
        experiment: String,
        #[arg(long, default_value = "results.csv")]
        out: PathBuf,
        /// Also store the artifact under its storage key below this root
        /// and record the participant's completion
        #[arg(long)]
        upload_root: Option<PathBuf>,
        #[arg(long, default_value = ".perlab")]
        state_dir: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Write a template stimulus configuration
    Init {
        #[arg(long, default_value = "stimuli.yaml")]
        out: PathBuf,
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string()));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Describe { config, json } => {
            let config = load_config(&config)?;
            let summary = summarize_config(&config);
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "summary": summary,
                })));
            }
            print_summary(&summary);
        }
        Commands::Assign {
            config,
            state_dir,
            json,
        } => {
            let config = load_config(&config)?;
            let counters = FileCounterStore::new(&state_dir);
            let assignment = allocate(&counters, &config.conditions.rotation)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "assign",
                    "condition": assignment.condition,
                    "counter": assignment.counter,
                })));
            }
            println!("condition: {}", assignment.condition);
            println!("counter: {}", assignment.counter);
        }
        Commands::Build {
            config,
            participant,
            study,
            condition,
            state_dir,
            out,
            json,
        } => {
            let config = load_config(&config)?;
            let query = QueryParams {
                participant_id: Some(participant),
                study_id: study,
                condition,
            };
            let counters = FileCounterStore::new(&state_dir);
            let completions = FileCompletionStore::new(&state_dir);
            let session = bootstrap_session(&config, &query, &counters, &completions)?;
            write_session_artifact(&out, &session)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "build",
                    "participant": session.participant_id,
                    "condition": session.condition,
                    "counter": session.counter,
                    "storage_key": session.storage_key,
                    "entries": session.timeline.len(),
                    "out": out.display().to_string(),
                })));
            }
            println!("participant: {}", session.participant_id);
            println!("condition: {}", session.condition);
            match session.counter {
                Some(counter) => println!("counter: {}", counter),
                None => println!("counter: overridden"),
            }
            println!("entries: {}", session.timeline.len());
            println!("storage_key: {}", session.storage_key);
            println!("out: {}", out.display());
        }
        Commands::Export {
            events,
            participant,
            condition,
            experiment,
            out,
            upload_root,
            state_dir,
            json,
        } => {
            let events = load_events(&events)?;
            let props = SessionProperties {
                participant_id: participant,
                condition,
            };
            let csv = events_to_csv(&events, &props);
            fs::write(&out, &csv)?;
            let stored = match upload_root {
                Some(root) => {
                    let key = storage_key(&experiment, &props.participant_id, Utc::now());
                    let store = FsResultsStore::new(root);
                    let completions = FileCompletionStore::new(&state_dir);
                    Some(finish_session(
                        &experiment,
                        &props,
                        &key,
                        &events,
                        &store,
                        &completions,
                    )?)
                }
                None => None,
            };
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "export",
                    "events": events.len(),
                    "out": out.display().to_string(),
                    "stored": stored,
                })));
            }
            println!("events: {}", events.len());
            println!("out: {}", out.display());
            if let Some(location) = stored {
                println!("stored: {}", location);
            }
        }
        Commands::Init { out, force } => {
            if !force && out.exists() {
                return Err(anyhow::anyhow!(format!(
                    "init file already exists (use --force): {}",
                    out.display()
                )));
            }
            fs::write(&out, TEMPLATE_CONFIG)?;
            println!("wrote: {}", out.display());
            println!(
                "next: edit {} \u{2014} fill in all fields marked REQUIRED",
                out.display()
            );
            println!("next: perlab describe {}", out.display());
        }
    }
    Ok(None)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn load_config(source: &str) -> Result<StimulusConfig> {
    if source.starts_with("http://") || source.starts_with("https://") {
        Ok(StimulusConfig::fetch(source)?)
    } else {
        Ok(StimulusConfig::load(Path::new(source))?)
    }
}

fn write_session_artifact(path: &Path, session: &Session) -> Result<()> {
    let payload = json!({
        "participant_id": session.participant_id,
        "study_id": session.study_id,
        "condition": session.condition,
        "counter": session.counter,
        "storage_key": session.storage_key,
        "timeline": session.timeline,
    });
    fs::write(path, serde_json::to_vec_pretty(&payload)?)?;
    Ok(())
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\"}}}}"
        ),
    }
}

fn json_error(code: &str, message: String) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Describe { json, .. }
        | Commands::Assign { json, .. }
        | Commands::Build { json, .. }
        | Commands::Export { json, .. } => *json,
        Commands::Init { .. } => false,
    }
}

fn print_summary(summary: &ConfigSummary) {
    println!("experiment: {}", summary.experiment_id);
    println!("rotation: {}", summary.rotation.join(", "));
    println!("break_interval: {}", summary.break_interval);
    println!("practice_trials: {}", summary.practice_trials);
    println!("headphone_tones: {}", summary.headphone_tones);
    for condition in &summary.conditions {
        println!(
            "condition {}: {} blocks, {} scored trials",
            condition.name, condition.blocks, condition.scored_trials
        );
    }
}

const TEMPLATE_CONFIG: &str = "\
experiment:
  id: ''                            # REQUIRED
  survey_url: ''                    # optional post-session survey redirect
consent:
  url: consent.html                 # REQUIRED
  button_id: start
instructions:
  preparation: []
  main: []
  final: []
messages:
  fixation_cross: '<div class=\"fixation\">+</div>'
  prompt: ''                        # REQUIRED: shown with every stimulus
  break: '<p>Take a short break. Press SPACE to continue.</p>'
  halfway: '<p>You are halfway done.</p>'
  completion: '<p>Saving your responses...</p>'
headphone_check:
  prompt: '<p>Which sound is the quietest?</p>'
  choices: ['FIRST sound is QUIETEST', 'SECOND sound is QUIETEST', 'THIRD sound is QUIETEST']
  sample_size: 6
  tones: []                         # REQUIRED: { audio, correct_choice } entries
practice:
  info: ''
  stimuli: []
conditions:
  rotation: []                      # REQUIRED: ordered condition names
  sets: {}                          # REQUIRED: one entry per rotation name
breaks:
  interval: 0                       # REQUIRED: set > 0
response:
  choices: ['1', '0']
design:
  shuffle: true
  seed: null
preload:
  audio: []
  images: []
";
