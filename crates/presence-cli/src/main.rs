use anyhow::{bail, Context, Result};
use chrono::{Local, NaiveDate, NaiveDateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use presence_core::liveness::{ChallengeStatus, LivenessChallenge, PoseAction};
use presence_core::pose::{solve_head_angles, FaceLandmarks, HeadDirection, PoseResult};
use presence_core::{AttendanceService, AttendanceStore, Embedding, EmbeddingRepository};
use presence_store::{Database, SqliteAttendanceStore, SqliteEmbeddingRepository};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

mod config;

use config::Config;

type Service = AttendanceService<SqliteEmbeddingRepository, SqliteAttendanceStore>;

#[derive(Parser)]
#[command(name = "presence", about = "Face-based attendance CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll an identity from pre-extracted embedding files
    Enroll {
        /// Identity id (e.g. employee number)
        #[arg(long)]
        id: String,
        /// Display name recorded with attendance sessions
        #[arg(long)]
        name: String,
        /// JSON files, each holding one vector or a list of vectors
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Match an embedding against enrolled identities without recording attendance
    Identify {
        file: PathBuf,
    },
    /// Match an embedding and toggle check-in/check-out for the matched identity
    Checkin {
        file: PathBuf,
        /// Local timestamp to record instead of now (e.g. 2025-03-03T08:00:00)
        #[arg(long)]
        at: Option<NaiveDateTime>,
        /// Pose samples from the same capture; check-in is refused unless they pass a challenge
        #[arg(long)]
        liveness: Option<PathBuf>,
    },
    /// List attendance sessions in a date range (defaults to today)
    Report {
        #[arg(long)]
        from: Option<NaiveDate>,
        #[arg(long)]
        to: Option<NaiveDate>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// List enrolled identities
    Identities,
    /// Solve head pose from a landmarks JSON file
    Pose {
        landmarks: PathBuf,
        #[arg(long, default_value_t = 640)]
        width: u32,
        #[arg(long, default_value_t = 480)]
        height: u32,
    },
    /// Replay recorded pose samples through a liveness challenge
    Challenge {
        /// JSON list of {yaw, pitch, motion, offset_ms}
        samples: PathBuf,
        /// Fixed action sequence; random when omitted
        #[arg(long, value_delimiter = ',')]
        actions: Vec<ActionArg>,
    },
    /// Show configuration and database status
    Status,
}

#[derive(Clone, Copy, ValueEnum)]
enum ActionArg {
    Center,
    Left,
    Right,
    Up,
    Down,
}

impl From<ActionArg> for PoseAction {
    fn from(arg: ActionArg) -> Self {
        match arg {
            ActionArg::Center => PoseAction::LookCenter,
            ActionArg::Left => PoseAction::LookLeft,
            ActionArg::Right => PoseAction::LookRight,
            ActionArg::Up => PoseAction::LookUp,
            ActionArg::Down => PoseAction::LookDown,
        }
    }
}

/// Embedding file contents: a single vector or a list of vectors.
#[derive(Deserialize)]
#[serde(untagged)]
enum EmbeddingFile {
    One(Vec<f32>),
    Many(Vec<Vec<f32>>),
}

#[derive(Deserialize)]
struct PoseSample {
    yaw: f32,
    pitch: f32,
    motion: f32,
    #[serde(default)]
    offset_ms: u64,
}

#[derive(Serialize)]
struct PoseReport {
    yaw: f32,
    pitch: f32,
    roll: f32,
    direction: HeadDirection,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command {
        Commands::Enroll { id, name, files } => {
            let service = open_service(&config)?;
            let mut embeddings = Vec::new();
            for file in &files {
                embeddings.extend(read_embeddings(file)?);
            }
            let record = service
                .enroll(&id, &name, embeddings, Utc::now())
                .with_context(|| format!("enrolling {id}"))?;
            println!(
                "Enrolled {} ({}) with {} embedding(s), record {}",
                record.id,
                record.display_name,
                record.embeddings.len(),
                record.record_id
            );
        }
        Commands::Identify { file } => {
            let service = open_service(&config)?;
            let probe = read_probe(&file)?;
            let outcome = service.identify(&probe)?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Checkin { file, at, liveness } => {
            let service = open_service(&config)?;
            let probe = read_probe(&file)?;
            let now = at.unwrap_or_else(|| Local::now().naive_local());
            let outcome = match liveness {
                Some(path) => {
                    let samples: Vec<PoseSample> = read_json(&path)?;
                    let challenge = replay_challenge(&config, &samples, Vec::new());
                    service.checkin_live(&challenge, &probe, now)?
                }
                None => service.checkin_embedding(&probe, now)?,
            };
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Report { from, to, json } => {
            let service = open_service(&config)?;
            let today = Local::now().date_naive();
            let from = from.unwrap_or(today);
            let to = to.unwrap_or(from.max(today));
            let sessions = service.report(from, to)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&sessions)?);
            } else if sessions.is_empty() {
                println!("No sessions between {from} and {to}");
            } else {
                println!(
                    "{:<10}  {:>3}  {:<12}  {:<20}  {:<8}  {:<8}",
                    "DAY", "#", "ID", "NAME", "IN", "OUT"
                );
                for s in &sessions {
                    let out = s
                        .check_out
                        .map(|t| t.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "{:<10}  {:>3}  {:<12}  {:<20}  {:<8}  {:<8}",
                        s.day.to_string(),
                        s.session_index,
                        s.identity_id,
                        s.display_name,
                        s.check_in.to_string(),
                        out
                    );
                }
            }
        }
        Commands::Identities => {
            let db = open_database(&config)?;
            let records = db.embeddings().snapshot()?;
            if records.is_empty() {
                println!("No identities enrolled");
            }

            // id -> (latest name, records, embeddings)
            let mut summary: BTreeMap<String, (String, usize, usize)> = BTreeMap::new();
            for record in &records {
                let entry = summary
                    .entry(record.id.clone())
                    .or_insert_with(|| (String::new(), 0, 0));
                entry.0 = record.display_name.clone();
                entry.1 += 1;
                entry.2 += record.embeddings.len();
            }
            for (id, (name, record_count, embedding_count)) in &summary {
                println!("{id}  {name}  records={record_count} embeddings={embedding_count}");
            }
        }
        Commands::Pose {
            landmarks,
            width,
            height,
        } => {
            let landmarks: FaceLandmarks = read_json(&landmarks)?;
            let angles = solve_head_angles(&landmarks, width, height)
                .context("solving head pose")?;
            let report = PoseReport {
                yaw: angles.yaw,
                pitch: angles.pitch,
                roll: angles.roll,
                direction: HeadDirection::classify(angles.yaw, angles.pitch),
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Challenge { samples, actions } => {
            let samples: Vec<PoseSample> = read_json(&samples)?;
            if !replay_challenge(&config, &samples, actions).is_passed() {
                bail!("liveness challenge not passed");
            }
        }
        Commands::Status => {
            println!("database:          {}", config.db_path.display());
            println!("match threshold:   {}", config.match_threshold);
            println!("toggle attempts:   {}", config.toggle_attempts);
            println!("motion threshold:  {}", config.motion_threshold);
            println!("liveness timeout:  {}s", config.liveness_timeout_secs);

            if !config.db_path.exists() {
                println!("status:            no database yet");
                return Ok(());
            }
            let db = open_database(&config)?;
            let records = db.embeddings().snapshot()?;
            let identities: BTreeSet<&str> =
                records.iter().map(|r| r.id.as_str()).collect();
            let today = Local::now().date_naive();
            let today_sessions = db.attendance().sessions_between(today, today)?;

            println!("schema version:    {}", db.schema_version()?);
            println!("identities:        {}", identities.len());
            println!("records:           {}", records.len());
            println!("sessions today:    {}", today_sessions.len());
        }
    }

    Ok(())
}

/// Feed recorded samples through a challenge until it passes, expires or runs out.
fn replay_challenge(
    config: &Config,
    samples: &[PoseSample],
    actions: Vec<ActionArg>,
) -> LivenessChallenge {
    let start = Instant::now();
    let mut challenge = if actions.is_empty() {
        LivenessChallenge::start(config.liveness_config(), start)
    } else {
        let actions = actions.into_iter().map(PoseAction::from).collect();
        LivenessChallenge::with_actions(actions, config.liveness_config(), start)
    };

    let steps: Vec<&str> = challenge.actions().iter().map(|a| a.instruction()).collect();
    println!("challenge: {}", steps.join(", then "));

    for (i, sample) in samples.iter().enumerate() {
        let pose = PoseResult {
            yaw: sample.yaw,
            pitch: sample.pitch,
            roll: 0.0,
            motion: sample.motion,
            direction: HeadDirection::classify(sample.yaw, sample.pitch),
        };
        let status = challenge.submit(&pose, start + Duration::from_millis(sample.offset_ms));
        println!("sample {i}: {status:?}");
        match status {
            ChallengeStatus::Passed => {
                println!("liveness passed");
                break;
            }
            ChallengeStatus::Expired => break,
            _ => {}
        }
    }

    challenge
}

fn open_database(config: &Config) -> Result<Database> {
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    tracing::debug!(path = %config.db_path.display(), "opening database");
    Database::open(&config.db_path)
        .with_context(|| format!("opening database {}", config.db_path.display()))
}

fn open_service(config: &Config) -> Result<Service> {
    let db = open_database(config)?;
    Ok(AttendanceService::new(
        db.embeddings(),
        db.attendance(),
        config.service_config(),
    ))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn read_embeddings(path: &Path) -> Result<Vec<Embedding>> {
    let vectors = match read_json::<EmbeddingFile>(path)? {
        EmbeddingFile::One(v) => vec![v],
        EmbeddingFile::Many(vs) => vs,
    };
    Ok(vectors.into_iter().map(Embedding::new).collect())
}

fn read_probe(path: &Path) -> Result<Embedding> {
    let mut embeddings = read_embeddings(path)?;
    if embeddings.len() != 1 {
        bail!(
            "{} holds {} embeddings, expected exactly one",
            path.display(),
            embeddings.len()
        );
    }
    Ok(embeddings.remove(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_fixture(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn test_config(dir: &Path) -> Config {
        Config {
            db_path: dir.join("presence.db"),
            match_threshold: 0.55,
            toggle_attempts: 8,
            motion_threshold: 3.0,
            liveness_timeout_secs: 40,
        }
    }

    #[test]
    fn test_embedding_file_accepts_single_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let one = write_fixture(dir.path(), "one.json", "[0.1, 0.2, 0.3]");
        let many = write_fixture(dir.path(), "many.json", "[[1.0, 0.0], [0.0, 1.0]]");

        assert_eq!(read_embeddings(&one).unwrap().len(), 1);
        assert_eq!(read_embeddings(&many).unwrap().len(), 2);
        assert_eq!(read_probe(&one).unwrap().dim(), 3);
        assert!(read_probe(&many).is_err());
    }

    #[test]
    fn test_replayed_samples_gate_checkin() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let service = open_service(&config).unwrap();
        service
            .enroll("nv01", "Alice", vec![Embedding::new(vec![1.0, 0.0])], Utc::now())
            .unwrap();
        let probe = Embedding::new(vec![1.0, 0.0]);
        let now = NaiveDate::from_ymd_opt(2025, 3, 3)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap();

        let still = write_fixture(
            dir.path(),
            "still.json",
            r#"[{"yaw": 0.0, "pitch": 0.0, "motion": 0.5}, {"yaw": -30.0, "pitch": 0.0, "motion": 0.5}]"#,
        );
        let samples: Vec<PoseSample> = read_json(&still).unwrap();
        let challenge =
            replay_challenge(&config, &samples, vec![ActionArg::Center, ActionArg::Left]);
        assert!(!challenge.is_passed());
        assert!(service.checkin_live(&challenge, &probe, now).is_err());

        let live = write_fixture(
            dir.path(),
            "live.json",
            r#"[{"yaw": 0.0, "pitch": 0.0, "motion": 8.0, "offset_ms": 500},
                {"yaw": -30.0, "pitch": 0.0, "motion": 8.0, "offset_ms": 1500}]"#,
        );
        let samples: Vec<PoseSample> = read_json(&live).unwrap();
        let challenge =
            replay_challenge(&config, &samples, vec![ActionArg::Center, ActionArg::Left]);
        assert!(challenge.is_passed());
        let outcome = service.checkin_live(&challenge, &probe, now).unwrap();
        assert!(matches!(outcome, presence_core::CheckinOutcome::Recorded { .. }));
    }

    #[test]
    fn test_cli_parses_checkin_liveness() {
        let cli = Cli::try_parse_from([
            "presence", "checkin", "face.json", "--liveness", "poses.json",
        ])
        .unwrap();
        match cli.command {
            Commands::Checkin { file, liveness, at } => {
                assert_eq!(file, PathBuf::from("face.json"));
                assert_eq!(liveness, Some(PathBuf::from("poses.json")));
                assert!(at.is_none());
            }
            _ => panic!("expected checkin"),
        }
    }

    #[test]
    fn test_cli_parses_report_range() {
        let cli = Cli::try_parse_from([
            "presence", "report", "--from", "2025-03-01", "--to", "2025-03-31", "--json",
        ])
        .unwrap();
        match cli.command {
            Commands::Report { from, to, json } => {
                assert_eq!(from, NaiveDate::from_ymd_opt(2025, 3, 1));
                assert_eq!(to, NaiveDate::from_ymd_opt(2025, 3, 31));
                assert!(json);
            }
            _ => panic!("expected report"),
        }
    }

    #[test]
    fn test_cli_parses_challenge_actions() {
        let cli = Cli::try_parse_from([
            "presence", "challenge", "poses.json", "--actions", "left,center,down",
        ])
        .unwrap();
        match cli.command {
            Commands::Challenge { actions, .. } => {
                let actions: Vec<PoseAction> = actions.into_iter().map(PoseAction::from).collect();
                assert_eq!(
                    actions,
                    vec![PoseAction::LookLeft, PoseAction::LookCenter, PoseAction::LookDown]
                );
            }
            _ => panic!("expected challenge"),
        }
    }
}
