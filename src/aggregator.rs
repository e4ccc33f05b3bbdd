//! # Emotion Aggregator
//!
//! The per-song state machine. It owns at most one open [`EmotionTally`],
//! bound to the track that is playing, and turns it into a single
//! [`DominantEmotionRecord`] when playback moves on.
//!
//! ```text
//!            bind(A)                 bind(B) / release()
//!   Idle ─────────────► Accumulating(A) ─────────► Committing ──► Accumulating(B)
//!    ▲                                                    │
//!    └────────────────────────── release() ───────────────┘
//! ```
//!
//! ## Commit rules
//!
//! - The dominant emotion is the label with the strictly highest count.
//!   Ties go to the label ranked first by the configured [`Precedence`],
//!   never to insertion order.
//! - A tally with no samples (camera covered, nobody in frame) commits
//!   nothing and calls nobody.
//! - The gateway is called at most once per tally. Whatever the gateway
//!   answers, the tally is cleared afterwards, so a record can never be
//!   written twice and a failed write cannot poison the next song.
//! - Failed writes are dropped, not retried: by the time a commit happens
//!   the song has already changed.

use crate::emotion::{Emotion, EmotionSample, Precedence};
use crate::now_playing::TrackIdentity;
use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{debug, error, info, trace};
use serde::Serialize;
use std::fmt;

/// Durable sink for committed records.
pub trait PersistenceGateway: Send {
    /// Single best-effort write.
    fn save(&mut self, user_id: &str, record: &DominantEmotionRecord) -> Result<()>;
}

impl<T: PersistenceGateway + ?Sized> PersistenceGateway for Box<T> {
    fn save(&mut self, user_id: &str, record: &DominantEmotionRecord) -> Result<()> {
        (**self).save(user_id, record)
    }
}

/// Per-label sample counts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmotionTally {
    counts: [u32; Emotion::COUNT],
}

impl EmotionTally {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&mut self, emotion: Emotion) {
        self.counts[emotion.index()] = self.counts[emotion.index()].saturating_add(1);
    }

    pub fn count(&self, emotion: Emotion) -> u32 {
        self.counts[emotion.index()]
    }

    /// Sum of all counts, saturating at `u32::MAX`.
    pub fn total(&self) -> u32 {
        self.counts.iter().fold(0u32, |acc, n| acc.saturating_add(*n))
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Non-zero counts in canonical label order.
    pub fn counts(&self) -> Vec<(Emotion, u32)> {
        Emotion::ALL
            .iter()
            .map(|e| (*e, self.count(*e)))
            .filter(|(_, n)| *n > 0)
            .collect()
    }

    /// Label with the highest count, ties broken by `precedence`.
    ///
    /// `None` for an empty tally.
    pub fn dominant(&self, precedence: &Precedence) -> Option<(Emotion, u32)> {
        Emotion::ALL
            .iter()
            .map(|e| (*e, self.count(*e)))
            .filter(|(_, n)| *n > 0)
            .min_by(|(a, a_count), (b, b_count)| {
                b_count
                    .cmp(a_count)
                    .then_with(|| precedence.rank(*a).cmp(&precedence.rank(*b)))
            })
    }
}

/// What ends an open tally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitReason {
    /// Another track started, or playback stopped.
    TrackChanged,
    /// The camera stream ended or was stopped.
    StreamStopped,
    /// The user session is going away (interrupt, shutdown).
    SessionEnd,
    /// Explicit "commit now" from the caller.
    Requested,
}

impl fmt::Display for CommitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CommitReason::TrackChanged => "track changed",
            CommitReason::StreamStopped => "stream stopped",
            CommitReason::SessionEnd => "session end",
            CommitReason::Requested => "requested",
        };
        f.write_str(text)
    }
}

/// The unit written to the persistence gateway.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DominantEmotionRecord {
    pub track: TrackIdentity,
    pub emotion: Emotion,
    /// Samples recorded for the track, all labels.
    pub sample_count: u32,
    /// Samples of the dominant label.
    pub dominant_count: u32,
    pub recorded_at: DateTime<Utc>,
}

/// Result of [`EmotionAggregator::commit_and_reset`].
#[derive(Debug)]
pub enum CommitOutcome {
    /// No track was bound.
    Idle,
    /// The track got no usable samples; nothing was written.
    Empty { track: TrackIdentity },
    /// The record was written.
    Saved(DominantEmotionRecord),
    /// The gateway failed; the record is lost.
    Dropped {
        record: DominantEmotionRecord,
        error: anyhow::Error,
    },
}

impl CommitOutcome {
    /// Record handed to the gateway, whether or not it was stored.
    pub fn record(&self) -> Option<&DominantEmotionRecord> {
        match self {
            CommitOutcome::Saved(record) | CommitOutcome::Dropped { record, .. } => Some(record),
            CommitOutcome::Idle | CommitOutcome::Empty { .. } => None,
        }
    }

    pub fn is_saved(&self) -> bool {
        matches!(self, CommitOutcome::Saved(_))
    }
}

/// Read-only view of the aggregator for display.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregatorSnapshot {
    pub current_track: Option<TrackIdentity>,
    pub counts: Vec<(Emotion, u32)>,
    pub total: u32,
}

#[derive(Debug)]
struct OpenTally {
    track: TrackIdentity,
    tally: EmotionTally,
}

/// Per-session aggregation state. Not shared: exactly one writer.
pub struct EmotionAggregator<G: PersistenceGateway> {
    user_id: String,
    precedence: Precedence,
    gateway: G,
    open: Option<OpenTally>,
}

impl<G: PersistenceGateway> EmotionAggregator<G> {
    pub fn new(user_id: impl Into<String>, precedence: Precedence, gateway: G) -> Self {
        Self {
            user_id: user_id.into(),
            precedence,
            gateway,
            open: None,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Track the open tally belongs to, `None` while idle.
    pub fn current_track(&self) -> Option<&TrackIdentity> {
        self.open.as_ref().map(|open| &open.track)
    }

    pub fn is_idle(&self) -> bool {
        self.open.is_none()
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    /// Attributes subsequent samples to `track`.
    ///
    /// Binding the track that is already bound does nothing. Binding another
    /// track commits the open tally first and returns that commit's outcome.
    pub fn bind(&mut self, track: TrackIdentity) -> Option<CommitOutcome> {
        if self.current_track() == Some(&track) {
            trace!("Rebinding {track}: already bound, tally kept");
            return None;
        }

        let outcome = if self.open.is_some() {
            Some(self.commit_and_reset(CommitReason::TrackChanged))
        } else {
            None
        };

        debug!("Opening tally for {track}");
        self.open = Some(OpenTally {
            track,
            tally: EmotionTally::new(),
        });

        outcome
    }

    /// Playback stopped: commits the open tally and goes idle.
    pub fn release(&mut self) -> CommitOutcome {
        self.commit_and_reset(CommitReason::TrackChanged)
    }

    /// Counts `sample` towards the bound track.
    ///
    /// Returns `false` when idle; such samples are discarded, not buffered.
    pub fn record(&mut self, sample: &EmotionSample) -> bool {
        match &mut self.open {
            Some(open) => {
                open.tally.increment(sample.label);
                trace!(
                    "Recorded {} ({:.2}) for {}",
                    sample.label,
                    sample.confidence,
                    open.track
                );
                true
            }
            None => false,
        }
    }

    /// Finalizes the open tally and detaches it from its track.
    pub fn commit_and_reset(&mut self, reason: CommitReason) -> CommitOutcome {
        let Some(OpenTally { track, tally }) = self.open.take() else {
            return CommitOutcome::Idle;
        };

        let Some((emotion, dominant_count)) = tally.dominant(&self.precedence) else {
            debug!("No samples for {track} ({reason}), nothing to commit");
            return CommitOutcome::Empty { track };
        };

        let record = DominantEmotionRecord {
            track,
            emotion,
            sample_count: tally.total(),
            dominant_count,
            recorded_at: Utc::now(),
        };

        match self.gateway.save(&self.user_id, &record) {
            Ok(()) => {
                info!(
                    "Committed {} for {} ({}/{} samples, {reason})",
                    record.emotion, record.track, record.dominant_count, record.sample_count
                );
                CommitOutcome::Saved(record)
            }
            Err(error) => {
                error!(
                    "Dropping {} for {} ({reason}): {error:#}",
                    record.emotion, record.track
                );
                CommitOutcome::Dropped { record, error }
            }
        }
    }

    /// Commits now and keeps accumulating for the same track on a fresh
    /// tally.
    pub fn commit_now(&mut self) -> CommitOutcome {
        let track = self.current_track().cloned();
        let outcome = self.commit_and_reset(CommitReason::Requested);
        if let Some(track) = track {
            self.open = Some(OpenTally {
                track,
                tally: EmotionTally::new(),
            });
        }
        outcome
    }

    pub fn snapshot(&self) -> AggregatorSnapshot {
        match &self.open {
            Some(open) => AggregatorSnapshot {
                current_track: Some(open.track.clone()),
                counts: open.tally.counts(),
                total: open.tally.total(),
            },
            None => AggregatorSnapshot::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;

    /// Gateway that remembers every save and can be told to fail.
    #[derive(Default)]
    struct RecordingGateway {
        saved: Vec<(String, DominantEmotionRecord)>,
        calls: usize,
        fail: bool,
    }

    impl PersistenceGateway for RecordingGateway {
        fn save(&mut self, user_id: &str, record: &DominantEmotionRecord) -> Result<()> {
            self.calls += 1;
            if self.fail {
                bail!("database unreachable");
            }
            self.saved.push((user_id.to_string(), record.clone()));
            Ok(())
        }
    }

    fn track(id: &str) -> TrackIdentity {
        TrackIdentity::new(id, format!("Song {id}"), "Artist")
    }

    fn aggregator() -> EmotionAggregator<RecordingGateway> {
        EmotionAggregator::new("user-1", Precedence::default(), RecordingGateway::default())
    }

    fn record_n(agg: &mut EmotionAggregator<RecordingGateway>, emotion: Emotion, n: usize) {
        for _ in 0..n {
            agg.record(&EmotionSample::new(emotion, 0.9));
        }
    }

    #[test]
    fn test_total_saturates_instead_of_overflowing() {
        let mut tally = EmotionTally::new();
        tally.counts = [u32::MAX; Emotion::COUNT];
        tally.increment(Emotion::Happy);

        assert_eq!(tally.total(), u32::MAX);
        assert_eq!(tally.count(Emotion::Happy), u32::MAX);
    }

    #[test]
    fn test_dominant_is_strict_maximum() {
        let mut agg = aggregator();
        agg.bind(track("a"));
        record_n(&mut agg, Emotion::Happy, 3);
        record_n(&mut agg, Emotion::Sad, 5);
        record_n(&mut agg, Emotion::Neutral, 1);

        let outcome = agg.commit_and_reset(CommitReason::TrackChanged);
        let record = outcome.record().expect("record expected");
        assert_eq!(record.emotion, Emotion::Sad);
        assert_eq!(record.sample_count, 9);
        assert_eq!(record.dominant_count, 5);
        assert!(outcome.is_saved());
    }

    #[test]
    fn test_tie_follows_configured_precedence() -> Result<()> {
        let precedence = Precedence::new(vec![
            Emotion::Sad,
            Emotion::Happy,
            Emotion::Angry,
            Emotion::Neutral,
        ])?;
        let mut agg = EmotionAggregator::new("user-1", precedence, RecordingGateway::default());
        agg.bind(track("a"));
        // Happy first, so insertion order would pick it.
        record_n(&mut agg, Emotion::Happy, 2);
        record_n(&mut agg, Emotion::Sad, 2);

        let outcome = agg.commit_and_reset(CommitReason::TrackChanged);
        assert_eq!(outcome.record().map(|r| r.emotion), Some(Emotion::Sad));
        Ok(())
    }

    #[test]
    fn test_tie_is_deterministic_across_runs() {
        let results: Vec<Emotion> = (0..20)
            .map(|_| {
                let mut tally = EmotionTally::new();
                for emotion in [Emotion::Neutral, Emotion::Surprised, Emotion::Fearful] {
                    tally.increment(emotion);
                    tally.increment(emotion);
                }
                tally.dominant(&Precedence::default()).map(|(e, _)| e).unwrap()
            })
            .collect();

        assert!(results.iter().all(|e| *e == Emotion::Fearful));
    }

    #[test]
    fn test_rebinding_same_track_keeps_tally() {
        let mut agg = aggregator();
        assert!(agg.bind(track("a")).is_none());
        record_n(&mut agg, Emotion::Happy, 4);

        assert!(agg.bind(TrackIdentity::new("a", "retitled", "someone")).is_none());
        assert_eq!(agg.snapshot().total, 4);
        assert_eq!(agg.gateway().calls, 0);
    }

    #[test]
    fn test_binding_new_track_commits_previous() {
        let mut agg = aggregator();
        agg.bind(track("a"));
        record_n(&mut agg, Emotion::Angry, 2);

        let outcome = agg.bind(track("b")).expect("implicit commit expected");
        assert_eq!(outcome.record().map(|r| r.track.clone()), Some(track("a")));
        assert_eq!(agg.current_track(), Some(&track("b")));
        assert_eq!(agg.snapshot().total, 0);
    }

    #[test]
    fn test_empty_tally_commits_nothing() {
        let mut agg = aggregator();
        agg.bind(track("a"));

        let outcome = agg.commit_and_reset(CommitReason::TrackChanged);
        assert!(matches!(outcome, CommitOutcome::Empty { .. }));
        assert_eq!(agg.gateway().calls, 0);
        assert!(agg.is_idle());
    }

    #[test]
    fn test_commit_while_idle() {
        let mut agg = aggregator();
        assert!(matches!(
            agg.commit_and_reset(CommitReason::StreamStopped),
            CommitOutcome::Idle
        ));
        assert_eq!(agg.gateway().calls, 0);
    }

    #[test]
    fn test_samples_while_idle_are_discarded() {
        let mut agg = aggregator();
        assert!(!agg.record(&EmotionSample::new(Emotion::Happy, 0.8)));

        agg.bind(track("a"));
        assert_eq!(agg.snapshot().total, 0);
    }

    #[test]
    fn test_failed_save_still_clears_and_rebinds() {
        let mut agg = aggregator();
        agg.gateway.fail = true;
        agg.bind(track("a"));
        record_n(&mut agg, Emotion::Sad, 3);

        let outcome = agg.bind(track("b")).expect("implicit commit expected");
        assert!(matches!(outcome, CommitOutcome::Dropped { .. }));
        assert_eq!(agg.current_track(), Some(&track("b")));
        assert_eq!(agg.snapshot().total, 0);

        agg.gateway.fail = false;
        record_n(&mut agg, Emotion::Happy, 1);
        let outcome = agg.release();
        assert_eq!(outcome.record().map(|r| r.emotion), Some(Emotion::Happy));
        assert_eq!(agg.gateway().calls, 2);
        assert_eq!(agg.gateway().saved.len(), 1);
    }

    #[test]
    fn test_pause_boundary_produces_two_commits() {
        let mut agg = aggregator();
        agg.bind(track("a"));
        record_n(&mut agg, Emotion::Happy, 2);
        agg.release();
        assert!(agg.is_idle());

        agg.bind(track("a"));
        record_n(&mut agg, Emotion::Sad, 1);
        agg.release();

        let saved = &agg.gateway().saved;
        assert_eq!(saved.len(), 2);
        assert_eq!(saved[0].1.emotion, Emotion::Happy);
        assert_eq!(saved[1].1.emotion, Emotion::Sad);
    }

    #[test]
    fn test_commit_happens_exactly_once() {
        let mut agg = aggregator();
        agg.bind(track("a"));
        record_n(&mut agg, Emotion::Surprised, 4);

        agg.commit_and_reset(CommitReason::StreamStopped);
        agg.commit_and_reset(CommitReason::StreamStopped);
        assert_eq!(agg.gateway().calls, 1);
        assert_eq!(agg.gateway().saved[0].0, "user-1");
    }

    #[test]
    fn test_commit_now_keeps_track_bound() {
        let mut agg = aggregator();
        agg.bind(track("a"));
        record_n(&mut agg, Emotion::Neutral, 2);

        let outcome = agg.commit_now();
        assert!(outcome.is_saved());
        assert_eq!(agg.current_track(), Some(&track("a")));
        assert_eq!(agg.snapshot().total, 0);

        assert!(agg.record(&EmotionSample::new(Emotion::Happy, 0.7)));
    }

    #[test]
    fn test_snapshot_lists_non_zero_counts() {
        let mut agg = aggregator();
        agg.bind(track("a"));
        record_n(&mut agg, Emotion::Sad, 2);
        record_n(&mut agg, Emotion::Angry, 1);

        let snapshot = agg.snapshot();
        assert_eq!(snapshot.current_track, Some(track("a")));
        assert_eq!(snapshot.counts, vec![(Emotion::Angry, 1), (Emotion::Sad, 2)]);
        assert_eq!(snapshot.total, 3);
    }
}
