//! # Command-Line Interface Module
//!
//! Clap derive definitions for the `emotune` binary.
//!
//! ## Commands
//!
//! - `run`: Watch the webcam and commit a dominant emotion per song
//! - `list`: Show the stored emotion of every song
//! - `stats`: Show how many songs landed on each emotion
//! - `now-playing`: Print what the configured player is playing
//! - `config`: Print the effective settings
//! - `completion`: Generate shell completions
//!
//! ## Examples
//!
//! ```bash
//! emotune run
//! emotune run --frames ./recorded --now-playing spotify
//! emotune list --user alice --json
//! ```

use crate::config::NowPlayingKind;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Shell types supported for completion generation
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Shell {
    /// Bash shell
    Bash,
    /// Zsh shell
    Zsh,
    /// Fish shell
    Fish,
    /// PowerShell
    PowerShell,
    /// Elvish shell
    Elvish,
}

/// Main application arguments structure.
///
/// Options shared by every command sit here; each one overrides the settings
/// file and the environment.
#[derive(Parser, Debug)]
#[command(name = "emotune")]
#[command(about = "Emotune: the feeling behind every song you play")]
#[command(version)]
pub struct Args {
    /// User the records belong to
    #[arg(long, global = true)]
    pub user: Option<String>,

    /// Database file (defaults to the data directory)
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Settings file (defaults to settings.json in the data directory)
    #[arg(long, global = true)]
    pub settings: Option<PathBuf>,

    /// The subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Enumeration of all available subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start an emotion session
    ///
    /// Samples the webcam, follows the playing song and stores the dominant
    /// emotion of each song when it changes. While running, type `status`,
    /// `commit` or `stop` on stdin; Ctrl-C ends the session and still saves
    /// the song that was playing.
    Run {
        /// Replay JPEG/PNG frames from a directory instead of the webcam
        #[arg(long)]
        frames: Option<PathBuf>,

        /// Webcam device
        #[arg(long)]
        device: Option<String>,

        /// Where the playing song comes from
        #[arg(long, value_enum)]
        now_playing: Option<NowPlayingKind>,

        /// Minimum classifier confidence for a sample to count
        #[arg(long)]
        min_confidence: Option<f32>,

        /// Milliseconds between sampled frames
        #[arg(long)]
        frame_interval: Option<u64>,

        /// Milliseconds between now-playing polls
        #[arg(long)]
        poll_interval: Option<u64>,

        /// Classifier program and arguments
        #[arg(long, num_args = 1.., value_delimiter = ' ')]
        classifier: Option<Vec<String>>,
    },

    /// List stored song emotions, most recent first
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Count songs per dominant emotion
    Stats {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Print the song the configured player is playing
    NowPlaying {
        /// Where the playing song comes from
        #[arg(long, value_enum)]
        source: Option<NowPlayingKind>,
    },

    /// Print the effective settings as JSON
    Config,

    /// Generate shell completion scripts
    ///
    /// ```bash
    /// emotune completion bash > ~/.local/share/bash-completion/completions/emotune
    /// emotune completion fish > ~/.config/fish/completions/emotune.fish
    /// ```
    Completion {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}
