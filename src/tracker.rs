//! # Song Tracker
//!
//! Turns a [`NowPlaying`] source into a stream of track transitions.
//!
//! A transition is any change of the playing track identity, *including*
//! stopping and resuming: `A -> nothing -> A` is two transitions, so a tally
//! is never carried across a pause.
//!
//! Poll failures (service unreachable, expired token, timeout) never escape
//! the tracker. They are reported as "no change" and the last known track is
//! kept until a poll succeeds again.

use crate::now_playing::{NowPlaying, TrackIdentity};
use log::{debug, info, warn};

/// Result of one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackPoll {
    /// Track believed to be playing after this poll.
    pub track: Option<TrackIdentity>,
    /// Whether `track` differs from the previous poll's track.
    pub changed: bool,
}

/// Whether going from `previous` to `current` is a track transition.
///
/// Identity is compared by provider track id; a boundary between a track and
/// nothing playing is always a change, nothing to nothing never is.
pub fn has_changed(previous: Option<&TrackIdentity>, current: Option<&TrackIdentity>) -> bool {
    match (previous, current) {
        (None, None) => false,
        (Some(prev), Some(cur)) => prev.provider_track_id != cur.provider_track_id,
        _ => true,
    }
}

/// Polls a now-playing source and remembers the last known track.
pub struct SongTracker<P: NowPlaying> {
    source: P,
    current: Option<TrackIdentity>,
    consecutive_failures: u32,
}

impl<P: NowPlaying> SongTracker<P> {
    pub fn new(source: P) -> Self {
        Self {
            source,
            current: None,
            consecutive_failures: 0,
        }
    }

    /// Last known track.
    pub fn current(&self) -> Option<&TrackIdentity> {
        self.current.as_ref()
    }

    /// Number of failed polls since the last successful one.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Asks the source for the playing track.
    pub fn poll(&mut self) -> TrackPoll {
        let polled = match self.source.current_track() {
            Ok(track) => track,
            Err(e) => {
                self.consecutive_failures += 1;
                if self.consecutive_failures == 1 {
                    warn!("Now-playing poll failed, keeping last known track: {e:#}");
                } else {
                    debug!(
                        "Now-playing poll failed ({} in a row): {e:#}",
                        self.consecutive_failures
                    );
                }
                return TrackPoll {
                    track: self.current.clone(),
                    changed: false,
                };
            }
        };

        if self.consecutive_failures > 0 {
            info!(
                "Now-playing source recovered after {} failed polls",
                self.consecutive_failures
            );
            self.consecutive_failures = 0;
        }

        let changed = has_changed(self.current.as_ref(), polled.as_ref());
        if changed {
            match &polled {
                Some(track) => debug!("Track transition: now playing {track}"),
                None => debug!("Track transition: playback stopped"),
            }
            self.current = polled;
        }

        TrackPoll {
            track: self.current.clone(),
            changed,
        }
    }
}
