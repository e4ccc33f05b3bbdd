//! # Emotune Performance Benchmarks
//!
//! The per-frame and per-song hot paths.
//!
//! - **Aggregation**: recording samples and committing tallies
//! - **Sampling**: best-label selection over classifier output
//! - **Database**: upserts of committed records
//!
//! ```bash
//! cargo bench
//! cargo bench aggregation
//! ```

use anyhow::Result;
use chrono::Utc;
use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use emotune::aggregator::{
    CommitReason, DominantEmotionRecord, EmotionAggregator, EmotionTally, PersistenceGateway,
};
use emotune::db::SqliteGateway;
use emotune::emotion::{Emotion, EmotionSample, Precedence};
use emotune::now_playing::TrackIdentity;
use emotune::sampler::{Classifier, ClassifierScore, EmotionSampler, Frame};
use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};
use rand::prelude::*;
use std::hint::black_box;
use std::io::Cursor;
use tempfile::TempDir;

struct NullGateway;

impl PersistenceGateway for NullGateway {
    fn save(&mut self, _user_id: &str, _record: &DominantEmotionRecord) -> Result<()> {
        Ok(())
    }
}

/// Classifier answering with a fixed score list.
struct FixedScores(Vec<ClassifierScore>);

impl Classifier for FixedScores {
    fn classify(&mut self, _image: &DynamicImage) -> Result<Vec<ClassifierScore>> {
        Ok(self.0.clone())
    }
}

fn random_samples(count: usize) -> Vec<EmotionSample> {
    let mut rng = StdRng::seed_from_u64(7);
    (0..count)
        .map(|_| {
            let emotion = Emotion::ALL[rng.gen_range(0..Emotion::COUNT)];
            EmotionSample::new(emotion, rng.gen_range(0.4..1.0))
        })
        .collect()
}

fn benchmark_aggregation(c: &mut Criterion) {
    let mut group = c.benchmark_group("aggregation");
    let precedence = Precedence::default();

    for size in [10, 100, 1000, 10_000].iter() {
        let samples = random_samples(*size);

        group.bench_with_input(
            BenchmarkId::new("record_then_commit", size),
            &samples,
            |b, samples| {
                b.iter_batched(
                    || {
                        let mut agg =
                            EmotionAggregator::new("bench", precedence.clone(), NullGateway);
                        agg.bind(TrackIdentity::new("t", "Track", "Artist"));
                        agg
                    },
                    |mut agg| {
                        for sample in samples {
                            agg.record(black_box(sample));
                        }
                        agg.commit_and_reset(CommitReason::StreamStopped)
                    },
                    BatchSize::SmallInput,
                )
            },
        );
    }

    let mut tally = EmotionTally::new();
    for sample in random_samples(500) {
        tally.increment(sample.label);
    }
    group.bench_function("dominant", |b| {
        b.iter(|| black_box(&tally).dominant(black_box(&precedence)))
    });

    group.finish();
}

fn benchmark_sampling(c: &mut Criterion) {
    let mut group = c.benchmark_group("sampling");

    let image: ImageBuffer<Rgb<u8>, Vec<u8>> = ImageBuffer::from_pixel(64, 48, Rgb([90, 80, 70]));
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(image)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .expect("Failed to encode benchmark frame");
    let frame = Frame::new(bytes);

    let scores = Emotion::ALL
        .iter()
        .enumerate()
        .map(|(i, e)| ClassifierScore::new(e.as_str(), 0.1 + i as f32 * 0.1))
        .collect();
    let mut sampler =
        EmotionSampler::new(FixedScores(scores), 0.4).expect("Failed to create sampler");

    group.bench_function("decode_and_pick", |b| {
        b.iter(|| sampler.sample(black_box(&frame)))
    });

    group.finish();
}

fn benchmark_database(c: &mut Criterion) {
    let mut group = c.benchmark_group("database");

    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let db_path = temp_dir.path().join("benchmark.db");
    let mut gateway = SqliteGateway::open(&db_path).expect("Failed to open database");
    let mut rng = StdRng::seed_from_u64(11);

    group.bench_function("upsert_record", |b| {
        b.iter(|| {
            let id = rng.gen_range(0..200).to_string();
            let record = DominantEmotionRecord {
                track: TrackIdentity::new(id.clone(), format!("Song {id}"), "Artist"),
                emotion: Emotion::ALL[rng.gen_range(0..Emotion::COUNT)],
                sample_count: 10,
                dominant_count: 4,
                recorded_at: Utc::now(),
            };
            gateway
                .save("bench", black_box(&record))
                .expect("Failed to save record")
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_aggregation,
    benchmark_sampling,
    benchmark_database
);

criterion_main!(benches);
