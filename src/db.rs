//! # Database
//!
//! SQLite storage for committed dominant emotions, and the
//! [`PersistenceGateway`] the aggregator writes through.
//!
//! One row per `(user_id, song_id)`: committing a song that already has a
//! row updates it, so the table always holds the latest verdict for every
//! song a user listened to.

use crate::aggregator::{DominantEmotionRecord, PersistenceGateway};
use anyhow::{Context, Result};
use chrono::SecondsFormat;
use log::{debug, info};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::path::Path;

/// Opens (creating if needed) the database at `db_path`.
pub fn open(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)
        .with_context(|| format!("Failed to open database at {}", db_path.display()))?;
    init_schema(&conn)?;
    debug!("Opened database {}", db_path.display());
    Ok(conn)
}

/// Creates the table if it does not exist yet.
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS song_emotions (
            id             INTEGER PRIMARY KEY,
            user_id        TEXT    NOT NULL,
            song_id        TEXT    NOT NULL,
            song_name      TEXT    NOT NULL,
            artist_name    TEXT    NOT NULL,
            emotion        TEXT    NOT NULL,
            sample_count   INTEGER NOT NULL CHECK (sample_count > 0),
            dominant_count INTEGER NOT NULL CHECK (dominant_count > 0),
            recorded_at    TEXT    NOT NULL,
            UNIQUE(user_id, song_id)
        );
        CREATE INDEX IF NOT EXISTS idx_song_emotions_user ON song_emotions(user_id);",
    )
    .context("Failed to create song_emotions table")?;
    Ok(())
}

/// Inserts or replaces the row for the record's song.
pub fn upsert_song_emotion(
    conn: &Connection,
    user_id: &str,
    record: &DominantEmotionRecord,
) -> Result<()> {
    conn.execute(
        "INSERT INTO song_emotions
            (user_id, song_id, song_name, artist_name, emotion, sample_count, dominant_count, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(user_id, song_id) DO UPDATE SET
            song_name      = excluded.song_name,
            artist_name    = excluded.artist_name,
            emotion        = excluded.emotion,
            sample_count   = excluded.sample_count,
            dominant_count = excluded.dominant_count,
            recorded_at    = excluded.recorded_at",
        params![
            user_id,
            record.track.provider_track_id,
            record.track.title,
            record.track.artist,
            record.emotion.as_str(),
            record.sample_count,
            record.dominant_count,
            record.recorded_at.to_rfc3339_opts(SecondsFormat::Micros, true),
        ],
    )
    .with_context(|| {
        format!(
            "Failed to store emotion for song {} of user {user_id}",
            record.track.provider_track_id
        )
    })?;
    Ok(())
}

/// A stored row, as shown on the dashboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SongEmotionRow {
    pub song_id: String,
    pub song_name: String,
    pub artist_name: String,
    pub emotion: String,
    pub sample_count: u32,
    pub recorded_at: String,
}

/// All rows of `user_id`, most recent first.
pub fn list_song_emotions(conn: &Connection, user_id: &str) -> Result<Vec<SongEmotionRow>> {
    let mut stmt = conn
        .prepare(
            "SELECT song_id, song_name, artist_name, emotion, sample_count, recorded_at
             FROM song_emotions
             WHERE user_id = ?1
             ORDER BY recorded_at DESC, id DESC",
        )
        .context("Invalid SQL statement when SELECTing song emotions")?;

    let rows = stmt
        .query_map([user_id], |row| {
            Ok(SongEmotionRow {
                song_id: row.get(0)?,
                song_name: row.get(1)?,
                artist_name: row.get(2)?,
                emotion: row.get(3)?,
                sample_count: row.get(4)?,
                recorded_at: row.get(5)?,
            })
        })
        .context("Cannot query song emotions")?;

    let mut result = Vec::new();
    for row in rows {
        result.push(row.context("Failed to read song emotion row")?);
    }
    Ok(result)
}

/// Number of songs per dominant emotion for `user_id`, most common first.
pub fn emotion_counts(conn: &Connection, user_id: &str) -> Result<Vec<(String, u32)>> {
    let mut stmt = conn
        .prepare(
            "SELECT emotion, COUNT(*) AS songs
             FROM song_emotions
             WHERE user_id = ?1
             GROUP BY emotion
             ORDER BY songs DESC, emotion ASC",
        )
        .context("Invalid SQL statement when counting emotions")?;

    let rows = stmt
        .query_map([user_id], |row| Ok((row.get(0)?, row.get(1)?)))
        .context("Cannot count emotions")?;

    let mut result = Vec::new();
    for row in rows {
        result.push(row.context("Failed to read emotion count")?);
    }
    Ok(result)
}

/// Gateway writing committed records into SQLite.
pub struct SqliteGateway {
    conn: Connection,
}

impl SqliteGateway {
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = open(db_path)?;
        info!("Storing song emotions in {}", db_path.display());
        Ok(Self { conn })
    }

    /// Wraps an already opened connection.
    pub fn from_connection(conn: Connection) -> Result<Self> {
        init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl PersistenceGateway for SqliteGateway {
    fn save(&mut self, user_id: &str, record: &DominantEmotionRecord) -> Result<()> {
        upsert_song_emotion(&self.conn, user_id, record)
    }
}
