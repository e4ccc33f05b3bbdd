//! # Emotion Sampler
//!
//! Turns one raw video frame into zero or one [`EmotionSample`].
//!
//! A frame yields nothing when it cannot be decoded, when the classifier sees
//! no face, when the classifier fails, or when the best label is below the
//! configured confidence. None of these are errors: a missed frame is the
//! normal case, not an exceptional one.
//!
//! The classifier itself is a collaborator behind the [`Classifier`] trait.
//! [`CommandClassifier`] runs a model as a long-lived external process so the
//! model is loaded once per session, not once per frame.

use crate::emotion::{Emotion, EmotionSample};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use image::{DynamicImage, ImageFormat};
use log::{debug, info, trace, warn};
use serde::Deserialize;
use std::io::{BufRead, BufReader, Cursor, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

/// Default minimum classifier confidence for a sample to count.
pub const DEFAULT_MIN_CONFIDENCE: f32 = 0.40;

/// One encoded video frame (JPEG or PNG) as delivered by a camera.
#[derive(Debug, Clone)]
pub struct Frame {
    pub bytes: Vec<u8>,
    pub captured_at: DateTime<Utc>,
}

impl Frame {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            captured_at: Utc::now(),
        }
    }
}

/// One `(label, confidence)` pair reported by a classifier.
///
/// Labels are kept as strings: the model may know labels we do not.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClassifierScore {
    pub label: String,
    pub confidence: f32,
}

impl ClassifierScore {
    pub fn new(label: impl Into<String>, confidence: f32) -> Self {
        Self {
            label: label.into(),
            confidence,
        }
    }
}

/// Facial-emotion model collaborator.
///
/// An empty result means no face was found.
pub trait Classifier: Send {
    fn classify(&mut self, image: &DynamicImage) -> Result<Vec<ClassifierScore>>;
}

impl<T: Classifier + ?Sized> Classifier for Box<T> {
    fn classify(&mut self, image: &DynamicImage) -> Result<Vec<ClassifierScore>> {
        (**self).classify(image)
    }
}

/// Frame-to-sample step of the stream loop.
pub struct EmotionSampler<C: Classifier> {
    classifier: C,
    min_confidence: f32,
}

impl<C: Classifier> EmotionSampler<C> {
    /// `min_confidence` must lie within `[0, 1]`.
    pub fn new(classifier: C, min_confidence: f32) -> Result<Self> {
        if !(0.0..=1.0).contains(&min_confidence) {
            bail!("min_confidence must be within [0, 1], got {min_confidence}");
        }
        Ok(Self {
            classifier,
            min_confidence,
        })
    }

    pub fn min_confidence(&self) -> f32 {
        self.min_confidence
    }

    /// Samples one frame.
    pub fn sample(&mut self, frame: &Frame) -> Option<EmotionSample> {
        let image = match image::load_from_memory(&frame.bytes) {
            Ok(image) => image,
            Err(e) => {
                debug!("Skipping undecodable frame ({} bytes): {e}", frame.bytes.len());
                return None;
            }
        };

        let scores = match self.classifier.classify(&image) {
            Ok(scores) => scores,
            Err(e) => {
                warn!("Classifier failed on frame: {e:#}");
                return None;
            }
        };

        let (label, confidence) = best_score(&scores)?;
        if confidence < self.min_confidence {
            trace!("Discarding {label} ({confidence:.2} < {:.2})", self.min_confidence);
            return None;
        }

        Some(EmotionSample {
            label,
            confidence,
            timestamp: frame.captured_at,
        })
    }
}

/// Highest-confidence known label; equal confidences resolve to canonical
/// label order.
fn best_score(scores: &[ClassifierScore]) -> Option<(Emotion, f32)> {
    scores
        .iter()
        .filter(|s| s.confidence.is_finite() && (0.0..=1.0).contains(&s.confidence))
        .filter_map(|s| match s.label.parse::<Emotion>() {
            Ok(emotion) => Some((emotion, s.confidence)),
            Err(_) => {
                trace!("Ignoring unknown classifier label {:?}", s.label);
                None
            }
        })
        .min_by(|(a, a_conf), (b, b_conf)| {
            b_conf
                .total_cmp(a_conf)
                .then_with(|| a.index().cmp(&b.index()))
        })
}

/// Handshake line a classifier process prints once its model is loaded.
const READY_LINE: &str = "ready";

/// Classifier running as an external process.
///
/// Protocol, per frame: a 4-byte big-endian length followed by the frame as
/// PNG on stdin; one JSON array of `{"label", "confidence"}` objects on a
/// single stdout line in reply. Before the first frame the process prints
/// `ready`.
///
/// The child is killed when the classifier is dropped.
pub struct CommandClassifier {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl CommandClassifier {
    /// Starts `program` and waits for its model to load.
    ///
    /// Fails if the program cannot be started or does not report ready.
    pub fn spawn(program: &str, args: &[String]) -> Result<Self> {
        info!("Starting classifier: {program} {}", args.join(" "));

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("Failed to start classifier `{program}`"))?;

        let stdin = child
            .stdin
            .take()
            .context("Failed to capture classifier stdin")?;
        let stdout = child
            .stdout
            .take()
            .context("Failed to capture classifier stdout")?;

        let mut classifier = Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        };

        let mut line = String::new();
        let read = classifier
            .stdout
            .read_line(&mut line)
            .context("Failed to read classifier handshake")?;
        if read == 0 {
            bail!("Classifier `{program}` exited before loading its model");
        }
        if line.trim() != READY_LINE {
            bail!(
                "Classifier `{program}` failed to load its model: {}",
                line.trim()
            );
        }

        info!("Classifier model loaded");
        Ok(classifier)
    }
}

impl Classifier for CommandClassifier {
    fn classify(&mut self, image: &DynamicImage) -> Result<Vec<ClassifierScore>> {
        let mut png = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .context("Failed to encode frame for classifier")?;

        let len = u32::try_from(png.len()).context("Frame too large for classifier protocol")?;
        self.stdin
            .write_all(&len.to_be_bytes())
            .and_then(|_| self.stdin.write_all(&png))
            .and_then(|_| self.stdin.flush())
            .context("Failed to send frame to classifier")?;

        let mut line = String::new();
        let read = self
            .stdout
            .read_line(&mut line)
            .context("Failed to read classifier reply")?;
        if read == 0 {
            bail!("Classifier process closed its output");
        }

        serde_json::from_str(line.trim())
            .with_context(|| format!("Malformed classifier reply: {}", line.trim()))
    }
}

impl Drop for CommandClassifier {
    fn drop(&mut self) {
        if let Err(e) = self.child.kill() {
            debug!("Classifier already exited: {e}");
        }
        let _ = self.child.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    /// Classifier returning a fixed answer.
    struct FixedClassifier(Result<Vec<ClassifierScore>, String>);

    impl Classifier for FixedClassifier {
        fn classify(&mut self, _image: &DynamicImage) -> Result<Vec<ClassifierScore>> {
            match &self.0 {
                Ok(scores) => Ok(scores.clone()),
                Err(message) => bail!("{message}"),
            }
        }
    }

    fn png_frame() -> Frame {
        let image: ImageBuffer<Rgb<u8>, Vec<u8>> = ImageBuffer::from_pixel(4, 4, Rgb([200, 200, 200]));
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(image)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .expect("encode test frame");
        Frame::new(bytes)
    }

    fn sampler(scores: Vec<ClassifierScore>) -> EmotionSampler<FixedClassifier> {
        EmotionSampler::new(FixedClassifier(Ok(scores)), 0.4).expect("valid threshold")
    }

    #[test]
    fn test_picks_highest_confidence_label() {
        let mut sampler = sampler(vec![
            ClassifierScore::new("happy", 0.2),
            ClassifierScore::new("sad", 0.7),
            ClassifierScore::new("neutral", 0.1),
        ]);

        let sample = sampler.sample(&png_frame()).expect("sample expected");
        assert_eq!(sample.label, Emotion::Sad);
        assert!((sample.confidence - 0.7).abs() < f32::EPSILON);
    }

    #[test]
    fn test_below_threshold_is_discarded() {
        let mut sampler = sampler(vec![ClassifierScore::new("angry", 0.39)]);
        assert!(sampler.sample(&png_frame()).is_none());
    }

    #[test]
    fn test_no_face_yields_nothing() {
        let mut sampler = sampler(Vec::new());
        assert!(sampler.sample(&png_frame()).is_none());
    }

    #[test]
    fn test_undecodable_frame_yields_nothing() {
        let mut sampler = sampler(vec![ClassifierScore::new("happy", 0.9)]);
        let garbage = Frame::new(vec![0xde, 0xad, 0xbe, 0xef]);
        assert!(sampler.sample(&garbage).is_none());
    }

    #[test]
    fn test_classifier_error_yields_nothing() {
        let mut sampler =
            EmotionSampler::new(FixedClassifier(Err("model crashed".into())), 0.4).unwrap();
        assert!(sampler.sample(&png_frame()).is_none());
    }

    #[test]
    fn test_unknown_labels_and_bad_confidences_ignored() {
        let mut sampler = sampler(vec![
            ClassifierScore::new("contempt", 0.99),
            ClassifierScore::new("fear", f32::NAN),
            ClassifierScore::new("surprise", 1.5),
            ClassifierScore::new("disgust", 0.6),
        ]);

        let sample = sampler.sample(&png_frame()).expect("sample expected");
        assert_eq!(sample.label, Emotion::Disgusted);
    }

    #[test]
    fn test_equal_confidence_uses_canonical_order() {
        let scores = vec![
            ClassifierScore::new("neutral", 0.5),
            ClassifierScore::new("happy", 0.5),
        ];
        assert_eq!(best_score(&scores).map(|(e, _)| e), Some(Emotion::Happy));
    }

    #[test]
    fn test_threshold_is_validated() {
        assert!(EmotionSampler::new(FixedClassifier(Ok(Vec::new())), 1.2).is_err());
        assert!(EmotionSampler::new(FixedClassifier(Ok(Vec::new())), -0.1).is_err());
        assert!(EmotionSampler::new(FixedClassifier(Ok(Vec::new())), 0.0).is_ok());
    }

    #[test]
    fn test_scores_parse_from_classifier_json() -> Result<()> {
        let scores: Vec<ClassifierScore> =
            serde_json::from_str(r#"[{"label": "happy", "confidence": 0.82}]"#)?;
        assert_eq!(scores, vec![ClassifierScore::new("happy", 0.82)]);
        Ok(())
    }

    #[test]
    fn test_spawn_missing_program_fails() {
        assert!(CommandClassifier::spawn("emotune-no-such-classifier", &[]).is_err());
    }
}
