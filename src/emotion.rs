//! # Emotion Labels
//!
//! The closed set of facial-emotion labels produced by the classifier, a single
//! observation of one of them ([`EmotionSample`]), and the fixed tie-break
//! order ([`Precedence`]) used when two labels end a song with the same count.
//!
//! Label parsing is lenient about the spellings classifiers actually emit
//! (`disgust`, `fear`, `surprise`), so a model script does not need to be
//! adapted to our naming.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A facial-emotion label.
///
/// The declaration order is the canonical order: it is the order labels are
/// stored in a tally and the fallback order for labels a custom
/// [`Precedence`] does not mention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Emotion {
    Angry,
    Disgusted,
    Fearful,
    Happy,
    Sad,
    Surprised,
    Neutral,
}

impl Emotion {
    /// Number of labels.
    pub const COUNT: usize = 7;

    /// All labels in canonical order.
    pub const ALL: [Emotion; Emotion::COUNT] = [
        Emotion::Angry,
        Emotion::Disgusted,
        Emotion::Fearful,
        Emotion::Happy,
        Emotion::Sad,
        Emotion::Surprised,
        Emotion::Neutral,
    ];

    /// Position in canonical order, used as a dense array index.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Stable lowercase name, as stored in the database.
    pub fn as_str(self) -> &'static str {
        match self {
            Emotion::Angry => "angry",
            Emotion::Disgusted => "disgusted",
            Emotion::Fearful => "fearful",
            Emotion::Happy => "happy",
            Emotion::Sad => "sad",
            Emotion::Surprised => "surprised",
            Emotion::Neutral => "neutral",
        }
    }
}

impl fmt::Display for Emotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Emotion {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let emotion = match s.trim().to_ascii_lowercase().as_str() {
            "angry" | "anger" => Emotion::Angry,
            "disgusted" | "disgust" => Emotion::Disgusted,
            "fearful" | "fear" => Emotion::Fearful,
            "happy" | "happiness" => Emotion::Happy,
            "sad" | "sadness" => Emotion::Sad,
            "surprised" | "surprise" => Emotion::Surprised,
            "neutral" => Emotion::Neutral,
            other => bail!("Unknown emotion label: {other:?}"),
        };
        Ok(emotion)
    }
}

impl Serialize for Emotion {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Emotion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// One classifier observation that passed the confidence threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmotionSample {
    pub label: Emotion,
    /// Always within `[0, 1]`.
    pub confidence: f32,
    pub timestamp: DateTime<Utc>,
}

impl EmotionSample {
    pub fn new(label: Emotion, confidence: f32) -> Self {
        Self {
            label,
            confidence,
            timestamp: Utc::now(),
        }
    }
}

/// Fixed tie-break order for dominant-emotion selection.
///
/// Earlier labels win ties. Labels missing from the list rank after every
/// listed label, among themselves in canonical order, so any subset is a
/// valid precedence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Precedence {
    order: Vec<Emotion>,
}

impl Precedence {
    /// Builds a precedence, rejecting repeated labels.
    pub fn new(order: Vec<Emotion>) -> Result<Self> {
        for (i, emotion) in order.iter().enumerate() {
            if order[..i].contains(emotion) {
                bail!("Emotion `{emotion}` appears more than once in the precedence order");
            }
        }
        Ok(Self { order })
    }

    /// Rank of `emotion`; lower wins a tie.
    pub fn rank(&self, emotion: Emotion) -> usize {
        match self.order.iter().position(|e| *e == emotion) {
            Some(pos) => pos,
            None => self.order.len() + emotion.index(),
        }
    }

    pub fn labels(&self) -> &[Emotion] {
        &self.order
    }
}

impl Default for Precedence {
    /// Canonical classifier order; neutral is last so any expressive label
    /// beats it on a tie.
    fn default() -> Self {
        Self {
            order: Emotion::ALL.to_vec(),
        }
    }
}

impl Serialize for Precedence {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.order.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Precedence {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let order = Vec::<Emotion>::deserialize(deserializer)?;
        Precedence::new(order).map_err(serde::de::Error::custom)
    }
}
