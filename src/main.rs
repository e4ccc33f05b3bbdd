//! # Emotune
//!
//! Command-line front end: runs emotion sessions and shows what they stored.
//!
//! ## Usage
//!
//! ```bash
//! # Watch the webcam while MPD plays
//! emotune run
//!
//! # Replay recorded frames against Spotify
//! SPOTIFY_ACCESS_TOKEN=... emotune run --frames ./frames --now-playing spotify
//!
//! # Look at the results
//! emotune list
//! emotune stats
//! ```

use anyhow::{bail, Context, Result};
use clap::Parser;
use emotune::aggregator::{CommitOutcome, EmotionAggregator};
use emotune::camera::{CameraSource, FfmpegSource, FrameDirSource};
use emotune::cli::{self, Command};
use emotune::completion;
use emotune::config::{NowPlayingKind, Settings};
use emotune::db::{self, SqliteGateway};
use emotune::now_playing::{MpdNowPlaying, NowPlaying, SpotifyNowPlaying};
use emotune::sampler::{CommandClassifier, EmotionSampler};
use emotune::session::{Session, SessionConfig, SessionHandle, SessionReport};
use log::{debug, info, warn};
use std::io::{self, BufRead};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread;
use std::time::Duration;

/// What the user asked a running session to do.
enum Control {
    Status,
    Commit,
    Stop,
    Interrupt,
}

/// Main entry point.
///
/// Logging is controlled via `RUST_LOG`:
/// - `RUST_LOG=info emotune run` - Song changes and commits
/// - `RUST_LOG=emotune::sampler=trace emotune run` - Every discarded frame
fn main() -> Result<()> {
    env_logger::init();

    let args = cli::Args::parse();
    let mut settings = load_settings(&args)?;

    match args.command {
        Command::Run {
            frames,
            device,
            now_playing,
            min_confidence,
            frame_interval,
            poll_interval,
            classifier,
        } => {
            if let Some(device) = device {
                settings.camera_device = device;
            }
            if let Some(kind) = now_playing {
                settings.now_playing = kind;
            }
            if let Some(value) = min_confidence {
                settings.min_confidence = value;
            }
            if let Some(ms) = frame_interval {
                settings.frame_interval_ms = ms;
            }
            if let Some(ms) = poll_interval {
                settings.poll_interval_ms = ms;
            }
            if let Some(command) = classifier {
                settings.classifier_command = command;
            }
            settings.validate()?;

            let camera: Box<dyn CameraSource> = match frames {
                Some(dir) => Box::new(FrameDirSource::new(dir)),
                None => Box::new(FfmpegSource::new(
                    settings.camera_device.clone(),
                    framerate(&settings),
                )),
            };
            run_session(&settings, camera)?;
        }
        Command::List { json } => {
            settings.validate()?;
            let conn = db::open(&settings.resolved_db_path()?)?;
            let rows = db::list_song_emotions(&conn, &settings.user_id)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else if rows.is_empty() {
                println!("No songs recorded for {} yet", settings.user_id);
            } else {
                println!(
                    "{:<32} {:<24} {:<10} {:>7}  {}",
                    "Song", "Artist", "Emotion", "Samples", "Recorded"
                );
                for row in rows {
                    println!(
                        "{:<32} {:<24} {:<10} {:>7}  {}",
                        truncate(&row.song_name, 32),
                        truncate(&row.artist_name, 24),
                        row.emotion,
                        row.sample_count,
                        row.recorded_at
                    );
                }
            }
        }
        Command::Stats { json } => {
            settings.validate()?;
            let conn = db::open(&settings.resolved_db_path()?)?;
            let counts = db::emotion_counts(&conn, &settings.user_id)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&counts)?);
            } else {
                let total: u32 = counts.iter().map(|(_, n)| n).sum();
                for (emotion, songs) in counts {
                    println!("{emotion:<10} {songs:>5}  {}", bar(songs, total));
                }
            }
        }
        Command::NowPlaying { source } => {
            if let Some(kind) = source {
                settings.now_playing = kind;
            }
            let mut now_playing = now_playing_source(&settings)?;
            match now_playing.current_track()? {
                Some(track) => println!("{track} [{}]", track.provider_track_id),
                None => println!("Nothing is playing"),
            }
        }
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
        Command::Completion { shell } => {
            completion::write_completions(shell, &mut io::stdout());
        }
    }

    Ok(())
}

/// Settings file and environment, then the global flags.
fn load_settings(args: &cli::Args) -> Result<Settings> {
    let mut settings = match &args.settings {
        Some(path) => {
            let mut settings = Settings::from_file(path)?;
            settings.apply_env(|key| std::env::var(key).ok())?;
            settings
        }
        None => Settings::load()?,
    };

    if let Some(user) = &args.user {
        settings.user_id = user.clone();
    }
    if let Some(db) = &args.db {
        settings.db_path = Some(db.clone());
    }
    Ok(settings)
}

fn now_playing_source(settings: &Settings) -> Result<Box<dyn NowPlaying>> {
    Ok(match settings.now_playing {
        NowPlayingKind::Mpd => Box::new(MpdNowPlaying::new()),
        NowPlayingKind::Spotify => {
            let token = settings
                .spotify_access_token
                .clone()
                .context("Spotify needs an access token. Set SPOTIFY_ACCESS_TOKEN.")?;
            Box::new(SpotifyNowPlaying::new(token, settings.poll_timeout())?)
        }
    })
}

fn framerate(settings: &Settings) -> u32 {
    u32::try_from(1000 / settings.frame_interval_ms.max(1))
        .unwrap_or(u32::MAX)
        .max(1)
}

fn run_session(settings: &Settings, camera: Box<dyn CameraSource>) -> Result<()> {
    let db_path = settings.resolved_db_path()?;
    let gateway = SqliteGateway::open(&db_path)?;
    let aggregator = EmotionAggregator::new(
        settings.user_id.clone(),
        settings.precedence.clone(),
        gateway,
    );

    let Some((program, classifier_args)) = settings.classifier_command.split_first() else {
        bail!("No classifier command configured");
    };
    let classifier = CommandClassifier::spawn(program, classifier_args)?;
    let sampler = EmotionSampler::new(classifier, settings.min_confidence)?;
    let now_playing = now_playing_source(settings)?;

    let handle = Session::start(
        SessionConfig::from(settings),
        camera,
        sampler,
        now_playing,
        aggregator,
    )?;

    let (control_tx, control_rx) = mpsc::channel();
    {
        let control_tx = control_tx.clone();
        ctrlc::set_handler(move || {
            let _ = control_tx.send(Control::Interrupt);
        })
        .context("Failed to install Ctrl-C handler")?;
    }
    spawn_stdin_reader(control_tx);

    println!("Session running. Commands: status, commit, stop (Ctrl-C to quit)");

    let report = loop {
        if handle.is_finished() {
            break handle.wait()?;
        }
        match control_rx.recv_timeout(Duration::from_millis(250)) {
            Ok(Control::Status) => print_status(&handle),
            Ok(Control::Commit) => {
                if let Err(e) = handle.commit_now() {
                    warn!("{e:#}");
                }
            }
            Ok(Control::Stop) => break handle.stop()?,
            Ok(Control::Interrupt) => break handle.interrupt()?,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break handle.stop()?,
        }
    };

    print_report(&report);
    Ok(())
}

fn spawn_stdin_reader(control_tx: Sender<Control>) {
    let spawned = thread::Builder::new()
        .name("emotune-stdin".into())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                let control = match line.trim() {
                    "status" | "s" => Control::Status,
                    "commit" | "c" => Control::Commit,
                    "stop" | "q" | "quit" => Control::Stop,
                    "" => continue,
                    other => {
                        eprintln!("Unknown command `{other}`. Try status, commit or stop.");
                        continue;
                    }
                };
                if control_tx.send(control).is_err() {
                    break;
                }
            }
            debug!("stdin closed; session keeps running until stopped");
        });
    if let Err(e) = spawned {
        warn!("Interactive commands unavailable: {e}");
    }
}

fn print_status(handle: &SessionHandle) {
    let snapshot = handle.snapshot();
    match &snapshot.current_track {
        Some(track) => println!("Playing: {track}"),
        None => println!("Nothing playing"),
    }
    if snapshot.counts.is_empty() {
        println!("  no samples yet");
    }
    for (emotion, count) in &snapshot.counts {
        println!("  {emotion:<10} {count:>5}  {}", bar(*count, snapshot.total));
    }
    if let Some(sample) = &snapshot.last_sample {
        println!(
            "  last: {} ({:.0}%)",
            sample.label,
            sample.confidence * 100.0
        );
    }
    if !snapshot.camera_active {
        println!("  camera released");
    }
}

fn print_report(report: &SessionReport) {
    for outcome in &report.outcomes {
        match outcome {
            CommitOutcome::Saved(record) => println!(
                "Saved {} -> {} ({}/{} samples)",
                record.track, record.emotion, record.dominant_count, record.sample_count
            ),
            CommitOutcome::Dropped { record, error } => {
                eprintln!("Could not save {}: {error:#}", record.track)
            }
            CommitOutcome::Empty { track } => info!("No samples for {track}"),
            CommitOutcome::Idle => {}
        }
    }
    println!(
        "Session ended: {} songs saved, {} samples counted, {} while nothing played",
        report.saved(),
        report.samples_recorded,
        report.samples_discarded
    );
}

fn bar(count: u32, total: u32) -> String {
    if total == 0 {
        return String::new();
    }
    "#".repeat(((count as f64 / total as f64) * 30.0).round() as usize)
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        text.to_string()
    } else {
        let mut cut: String = text.chars().take(width.saturating_sub(1)).collect();
        cut.push('…');
        cut
    }
}
