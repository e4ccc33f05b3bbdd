//! # Now-Playing Sources
//!
//! The music-service collaborator: something that can tell us which track is
//! playing *right now*, or that nothing is.
//!
//! Two sources are provided:
//!
//! - [`MpdNowPlaying`] shells out to `mpc status` (no MPD protocol
//!   implementation of its own).
//! - [`SpotifyNowPlaying`] asks the Spotify Web API with an access token that
//!   was obtained elsewhere. Obtaining or refreshing that token is not this
//!   crate's business; an expired token simply surfaces as a poll error.
//!
//! Errors are returned, never swallowed here: deciding that a failed poll
//! means "no change" is the job of [`crate::tracker::SongTracker`].

use anyhow::{bail, Context, Result};
use log::debug;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::process::Command;
use std::time::Duration;

/// Placeholder for tags the service did not report.
pub const UNKNOWN_TAG: &str = "N/A";

/// A track as reported by the music service.
///
/// Two identities are the same track when their `provider_track_id` matches;
/// title and artist are display data only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackIdentity {
    pub provider_track_id: String,
    pub title: String,
    pub artist: String,
}

impl TrackIdentity {
    pub fn new(
        provider_track_id: impl Into<String>,
        title: impl Into<String>,
        artist: impl Into<String>,
    ) -> Self {
        Self {
            provider_track_id: provider_track_id.into(),
            title: title.into(),
            artist: artist.into(),
        }
    }
}

impl PartialEq for TrackIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.provider_track_id == other.provider_track_id
    }
}

impl Eq for TrackIdentity {}

impl Hash for TrackIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.provider_track_id.hash(state);
    }
}

impl fmt::Display for TrackIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.artist, self.title)
    }
}

/// Anything that can report the currently playing track.
///
/// `Ok(None)` means nothing is playing (stopped or paused).
pub trait NowPlaying: Send {
    fn current_track(&mut self) -> Result<Option<TrackIdentity>>;
}

impl<T: NowPlaying + ?Sized> NowPlaying for Box<T> {
    fn current_track(&mut self) -> Result<Option<TrackIdentity>> {
        (**self).current_track()
    }
}

/// `mpc` format string: file, title and artist separated by tabs.
const MPC_FORMAT: &str = "%file%\t%title%\t%artist%";

/// Reads the playing track from MPD through `mpc`.
#[derive(Debug, Default)]
pub struct MpdNowPlaying;

impl MpdNowPlaying {
    pub fn new() -> Self {
        Self
    }
}

impl NowPlaying for MpdNowPlaying {
    fn current_track(&mut self) -> Result<Option<TrackIdentity>> {
        let output = Command::new("mpc")
            .args(["status", "-f", MPC_FORMAT])
            .output()
            .context("Failed to run `mpc status`. Is mpc installed?")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("MPD status command failed: {}", stderr.trim());
        }

        let text = String::from_utf8_lossy(&output.stdout);
        Ok(parse_mpc_status(&text))
    }
}

/// Parses `mpc status -f "%file%\t%title%\t%artist%"` output.
///
/// ```text
/// artist/album/song.flac\tSong\tArtist
/// [playing] #5/20   1:23/3:45 (37%)
/// volume: 80%   repeat: on    random: off   single: off   consume: off
/// ```
///
/// When MPD is stopped only the volume line is printed. A paused song is
/// reported as nothing playing.
pub fn parse_mpc_status(text: &str) -> Option<TrackIdentity> {
    let lines: Vec<&str> = text.lines().collect();

    let playing = lines.iter().skip(1).any(|line| line.contains("[playing]"));
    if !playing {
        return None;
    }

    let mut fields = lines.first()?.split('\t');
    let file = fields.next().map(str::trim).filter(|f| !f.is_empty())?;
    let title = fields.next().map(str::trim).unwrap_or_default();
    let artist = fields.next().map(str::trim).unwrap_or_default();

    // Untagged files: fall back to the file name.
    let title = if title.is_empty() {
        file.rsplit('/').next().unwrap_or(file)
    } else {
        title
    };
    let artist = if artist.is_empty() { UNKNOWN_TAG } else { artist };

    Some(TrackIdentity::new(file, title, artist))
}

const SPOTIFY_CURRENTLY_PLAYING: &str = "https://api.spotify.com/v1/me/player/currently-playing";

/// Reads the playing track from the Spotify Web API.
pub struct SpotifyNowPlaying {
    client: Client,
    access_token: String,
    endpoint: String,
}

impl SpotifyNowPlaying {
    /// `timeout` bounds every request so a hung API cannot stall the poller.
    pub fn new(access_token: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client for Spotify")?;

        Ok(Self {
            client,
            access_token: access_token.into(),
            endpoint: SPOTIFY_CURRENTLY_PLAYING.to_string(),
        })
    }

    /// Points the source at another base URL (local mocks).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

impl NowPlaying for SpotifyNowPlaying {
    fn current_track(&mut self) -> Result<Option<TrackIdentity>> {
        let response = self
            .client
            .get(&self.endpoint)
            .bearer_auth(&self.access_token)
            .send()
            .context("Spotify currently-playing request failed")?;

        match response.status() {
            StatusCode::NO_CONTENT => {
                debug!("Spotify reports no active playback");
                Ok(None)
            }
            StatusCode::OK => {
                let body: CurrentlyPlaying = response
                    .json()
                    .context("Failed to decode Spotify currently-playing response")?;
                Ok(body.into_track())
            }
            StatusCode::UNAUTHORIZED => bail!("Spotify access token expired or was revoked"),
            status => bail!("Spotify currently-playing returned HTTP {status}"),
        }
    }
}

/// Subset of the Spotify "currently playing" object we read.
#[derive(Debug, Deserialize)]
pub struct CurrentlyPlaying {
    #[serde(default)]
    pub is_playing: bool,
    pub item: Option<SpotifyItem>,
}

#[derive(Debug, Deserialize)]
pub struct SpotifyItem {
    pub id: Option<String>,
    pub name: Option<String>,
    #[serde(default)]
    pub artists: Vec<SpotifyArtist>,
}

#[derive(Debug, Deserialize)]
pub struct SpotifyArtist {
    pub name: Option<String>,
}

impl CurrentlyPlaying {
    /// Paused playback, ads and local files without an id count as nothing
    /// playing.
    pub fn into_track(self) -> Option<TrackIdentity> {
        if !self.is_playing {
            return None;
        }
        let item = self.item?;
        let id = item.id.filter(|id| !id.is_empty())?;
        let title = item.name.unwrap_or_else(|| UNKNOWN_TAG.to_string());
        let artist = item
            .artists
            .into_iter()
            .next()
            .and_then(|a| a.name)
            .unwrap_or_else(|| UNKNOWN_TAG.to_string());

        Some(TrackIdentity::new(id, title, artist))
    }
}
