//! Per-song facial emotion tracking for whatever music is playing.
//!
//! A webcam is sampled while music plays. Every frame with a confident
//! facial-emotion reading counts toward the song playing at that moment, and
//! when the song changes (or the stream stops) the most frequent emotion is
//! stored as that song's dominant emotion.
//!
//! Core modules:
//! - [`session`] - The stream loop tying everything together
//! - [`aggregator`] - Per-song tallies and dominant-emotion commits
//! - [`sampler`] - Frame to emotion sample, classifier collaborators
//! - [`tracker`] - Song-change detection over a now-playing source
//! - [`now_playing`] - MPD and Spotify now-playing sources
//! - [`camera`] - Webcam and recorded-frame sources
//! - [`db`] - SQLite persistence
//!
//! ### Supporting Modules
//!
//! - [`emotion`] - The label set and tie-break precedence
//! - [`config`] - Data directory and layered settings
//! - [`cli`] - Command-line interface definitions
//! - [`completion`] - Shell completion generation
//!
//! ## Quick Start Example
//!
//! ```no_run
//! use emotune::aggregator::EmotionAggregator;
//! use emotune::camera::FfmpegSource;
//! use emotune::db::SqliteGateway;
//! use emotune::emotion::Precedence;
//! use emotune::now_playing::MpdNowPlaying;
//! use emotune::sampler::{CommandClassifier, EmotionSampler};
//! use emotune::session::{Session, SessionConfig};
//!
//! let db_path = emotune::config::get_db_path()?;
//! let aggregator = EmotionAggregator::new(
//!     "alice",
//!     Precedence::default(),
//!     SqliteGateway::open(&db_path)?,
//! );
//! let classifier = CommandClassifier::spawn("emotune-classifier", &[])?;
//! let sampler = EmotionSampler::new(classifier, 0.4)?;
//!
//! let handle = Session::start(
//!     SessionConfig::default(),
//!     Box::new(FfmpegSource::new("/dev/video0", 10)),
//!     sampler,
//!     MpdNowPlaying::new(),
//!     aggregator,
//! )?;
//!
//! std::thread::sleep(std::time::Duration::from_secs(60));
//! let report = handle.stop()?;
//! println!("Saved {} songs", report.saved());
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! ## Dominant Emotion
//!
//! The dominant emotion of a song is the label with the highest count among
//! the samples taken while it played. Equal counts resolve through a fixed
//! [`emotion::Precedence`]; by default `neutral` loses every tie. A song with
//! no samples stores nothing.

pub mod aggregator;
pub mod camera;
pub mod cli;
pub mod completion;
pub mod config;
pub mod db;
pub mod emotion;
pub mod now_playing;
pub mod sampler;
pub mod session;
pub mod tracker;
