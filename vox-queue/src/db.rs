//! Synchronous SQLite storage for queue state, following the generic cache
//! database's style of a single `Mutex<Connection>` wrapped in a small
//! struct of plain methods — callers on the async side push these onto a
//! blocking task rather than the db layer spawning its own.

use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use vox_core::{Artist, GlobalHistoryEntry, QueuedTrack, Track, TrackSource, UserHistoryEntry};

#[derive(Debug)]
pub struct QueueDb {
    conn: Mutex<Connection>,
}

fn track_source_str(source: TrackSource) -> &'static str {
    match source {
        TrackSource::Yandex => "yandex",
        TrackSource::YouTube => "youtube",
        TrackSource::Other => "other",
    }
}

fn track_source_from_str(s: &str) -> TrackSource {
    match s {
        "yandex" => TrackSource::Yandex,
        "youtube" => TrackSource::YouTube,
        _ => TrackSource::Other,
    }
}

impl QueueDb {
    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS queues (
                channel_id TEXT PRIMARY KEY,
                guild_id TEXT NOT NULL,
                last_track_id TEXT,
                wave_status INTEGER NOT NULL DEFAULT 0,
                loop_enabled INTEGER NOT NULL DEFAULT 0,
                volume INTEGER
            );
            CREATE TABLE IF NOT EXISTS tracks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                channel_id TEXT NOT NULL,
                priority INTEGER NOT NULL,
                added_at INTEGER NOT NULL,
                track_id TEXT NOT NULL,
                title TEXT NOT NULL,
                artists TEXT NOT NULL,
                albums TEXT NOT NULL,
                duration_ms INTEGER NOT NULL,
                cover_uri TEXT,
                generation INTEGER NOT NULL,
                source TEXT NOT NULL,
                requested_by TEXT
            );
            CREATE TABLE IF NOT EXISTS queue_snapshots (
                channel_id TEXT NOT NULL,
                key TEXT NOT NULL,
                payload TEXT NOT NULL,
                PRIMARY KEY (channel_id, key)
            );
            CREATE TABLE IF NOT EXISTS global_history (
                track_id TEXT PRIMARY KEY,
                info TEXT NOT NULL,
                played_at INTEGER NOT NULL,
                play_count INTEGER NOT NULL DEFAULT 1
            );
            CREATE TABLE IF NOT EXISTS user_history (
                requested_by TEXT NOT NULL,
                track_id TEXT NOT NULL,
                info TEXT NOT NULL,
                played_at INTEGER NOT NULL,
                play_count INTEGER NOT NULL DEFAULT 1,
                PRIMARY KEY (requested_by, track_id)
            );",
        )
    }

    pub fn set_guild_channel_id(&self, guild_id: &str, channel_id: &str) -> rusqlite::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO queues (channel_id, guild_id) VALUES (?1, ?2)
             ON CONFLICT(channel_id) DO UPDATE SET guild_id = excluded.guild_id",
            params![channel_id, guild_id],
        )?;
        Ok(())
    }

    fn ensure_queue_row(conn: &Connection, channel_id: &str) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT OR IGNORE INTO queues (channel_id, guild_id) VALUES (?1, ?1)",
            params![channel_id],
        )?;
        Ok(())
    }

    pub fn insert_track(&self, channel_id: &str, priority: bool, track: &QueuedTrack) -> rusqlite::Result<()> {
        let conn = self.conn.lock().unwrap();
        Self::ensure_queue_row(&conn, channel_id)?;
        Self::insert_track_locked(&conn, channel_id, priority, track)
    }

    fn insert_track_locked(conn: &Connection, channel_id: &str, priority: bool, track: &QueuedTrack) -> rusqlite::Result<()> {
        let artists = serde_json::to_string(&track.info.artists).unwrap_or_default();
        let albums = serde_json::to_string(&track.info.albums).unwrap_or_default();
        conn.execute(
            "INSERT INTO tracks (channel_id, priority, added_at, track_id, title, artists, albums, duration_ms, cover_uri, generation, source, requested_by)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                channel_id,
                priority as i64,
                track.added_at,
                track.track_id,
                track.info.title,
                artists,
                albums,
                track.info.duration_ms,
                track.info.cover_uri,
                track.info.generation as i64,
                track_source_str(track.source),
                track.requested_by,
            ],
        )?;
        Ok(())
    }

    pub fn add_multiple_tracks(&self, channel_id: &str, priority: bool, tracks: &[QueuedTrack]) -> rusqlite::Result<()> {
        let mut conn = self.conn.lock().unwrap();
        Self::ensure_queue_row(&conn, channel_id)?;
        let tx = conn.transaction()?;
        for t in tracks {
            Self::insert_track_locked(&tx, channel_id, priority, t)?;
        }
        tx.commit()
    }

    fn row_to_queued_track(row: &rusqlite::Row) -> rusqlite::Result<QueuedTrack> {
        let artists_json: String = row.get("artists")?;
        let albums_json: String = row.get("albums")?;
        let artists: Vec<Artist> = serde_json::from_str(&artists_json).unwrap_or_default();
        let albums: Vec<vox_core::Album> = serde_json::from_str(&albums_json).unwrap_or_default();
        let source_str: String = row.get("source")?;
        Ok(QueuedTrack {
            track_id: row.get("track_id")?,
            added_at: row.get("added_at")?,
            priority: row.get::<_, i64>("priority")? != 0,
            info: Track {
                id: row.get("track_id")?,
                title: row.get("title")?,
                artists,
                albums,
                duration_ms: row.get::<_, i64>("duration_ms")? as u32,
                cover_uri: row.get("cover_uri")?,
                source: track_source_from_str(&source_str),
                generation: row.get::<_, i64>("generation")? != 0,
            },
            source: track_source_from_str(&source_str),
            requested_by: row.get("requested_by")?,
        })
    }

    pub fn list_tracks(&self, channel_id: &str, priority: bool) -> rusqlite::Result<Vec<QueuedTrack>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM tracks WHERE channel_id = ?1 AND priority = ?2 ORDER BY added_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![channel_id, priority as i64], Self::row_to_queued_track)?;
        rows.collect()
    }

    /// Removes and returns the oldest track for `(channel_id, priority)`.
    pub fn pop_front(&self, channel_id: &str, priority: bool) -> rusqlite::Result<Option<QueuedTrack>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let id: Option<i64> = tx
            .query_row(
                "SELECT id FROM tracks WHERE channel_id = ?1 AND priority = ?2 ORDER BY added_at ASC, id ASC LIMIT 1",
                params![channel_id, priority as i64],
                |r| r.get(0),
            )
            .optional()?;
        let Some(id) = id else {
            tx.commit()?;
            return Ok(None);
        };
        let track = tx.query_row("SELECT * FROM tracks WHERE id = ?1", params![id], Self::row_to_queued_track)?;
        tx.execute("DELETE FROM tracks WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(Some(track))
    }

    pub fn count_tracks(&self, channel_id: &str, priority: bool) -> rusqlite::Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COUNT(*) FROM tracks WHERE channel_id = ?1 AND priority = ?2",
            params![channel_id, priority as i64],
            |r| r.get(0),
        )
    }

    pub fn remove_track(&self, channel_id: &str, track_id: &str) -> rusqlite::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let affected = conn.execute(
            "DELETE FROM tracks WHERE channel_id = ?1 AND track_id = ?2 AND id = (
                SELECT id FROM tracks WHERE channel_id = ?1 AND track_id = ?2 ORDER BY added_at ASC LIMIT 1
            )",
            params![channel_id, track_id],
        )?;
        Ok(affected > 0)
    }

    pub fn clear_tracks(&self, channel_id: &str, priority: bool) -> rusqlite::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM tracks WHERE channel_id = ?1 AND priority = ?2",
            params![channel_id, priority as i64],
        )?;
        Ok(())
    }

    pub fn clear_queue(&self, channel_id: &str, priority: bool) -> rusqlite::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM tracks WHERE channel_id = ?1 AND priority = ?2",
            params![channel_id, priority as i64],
        )?;
        conn.execute(
            "UPDATE queues SET last_track_id = NULL WHERE channel_id = ?1",
            params![channel_id],
        )?;
        Ok(())
    }

    pub fn set_last_track_id(&self, channel_id: &str, track_id: Option<&str>) -> rusqlite::Result<()> {
        let conn = self.conn.lock().unwrap();
        Self::ensure_queue_row(&conn, channel_id)?;
        conn.execute(
            "UPDATE queues SET last_track_id = ?2 WHERE channel_id = ?1",
            params![channel_id, track_id],
        )?;
        Ok(())
    }

    pub fn get_last_track_id(&self, channel_id: &str) -> rusqlite::Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT last_track_id FROM queues WHERE channel_id = ?1",
            params![channel_id],
            |r| r.get(0),
        )
        .optional()
        .map(|v| v.flatten())
    }

    pub fn get_wave_status(&self, channel_id: &str) -> rusqlite::Result<bool> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT wave_status FROM queues WHERE channel_id = ?1",
            params![channel_id],
            |r| r.get::<_, i64>(0),
        )
        .optional()
        .map(|v| v.unwrap_or(0) != 0)
    }

    pub fn set_wave_status(&self, channel_id: &str, enabled: bool) -> rusqlite::Result<()> {
        let conn = self.conn.lock().unwrap();
        Self::ensure_queue_row(&conn, channel_id)?;
        conn.execute(
            "UPDATE queues SET wave_status = ?2 WHERE channel_id = ?1",
            params![channel_id, enabled as i64],
        )?;
        Ok(())
    }

    pub fn save_snapshot(&self, channel_id: &str, key: &str, payload: &str) -> rusqlite::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO queue_snapshots (channel_id, key, payload) VALUES (?1, ?2, ?3)
             ON CONFLICT(channel_id, key) DO UPDATE SET payload = excluded.payload",
            params![channel_id, key, payload],
        )?;
        Ok(())
    }

    pub fn load_snapshot(&self, channel_id: &str, key: &str) -> rusqlite::Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT payload FROM queue_snapshots WHERE channel_id = ?1 AND key = ?2",
            params![channel_id, key],
            |r| r.get(0),
        )
        .optional()
    }

    pub fn get_volume(&self, channel_id: &str) -> rusqlite::Result<Option<u8>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT volume FROM queues WHERE channel_id = ?1",
            params![channel_id],
            |r| r.get::<_, Option<i64>>(0),
        )
        .optional()
        .map(|v| v.flatten().map(|n| n as u8))
    }

    pub fn set_volume(&self, channel_id: &str, volume: Option<u8>) -> rusqlite::Result<()> {
        let conn = self.conn.lock().unwrap();
        Self::ensure_queue_row(&conn, channel_id)?;
        conn.execute(
            "UPDATE queues SET volume = ?2 WHERE channel_id = ?1",
            params![channel_id, volume.map(|v| v as i64)],
        )?;
        Ok(())
    }

    /// Records a track start for history: always bumps the global play
    /// count, and if `requested_by` is known, bumps that user's count too.
    pub fn record_play(
        &self,
        requested_by: Option<&str>,
        track_id: &str,
        info: &Track,
        played_at: i64,
    ) -> rusqlite::Result<()> {
        let conn = self.conn.lock().unwrap();
        let info_json = serde_json::to_string(info).unwrap_or_default();
        conn.execute(
            "INSERT INTO global_history (track_id, info, played_at, play_count) VALUES (?1, ?2, ?3, 1)
             ON CONFLICT(track_id) DO UPDATE SET info = excluded.info, played_at = excluded.played_at, play_count = play_count + 1",
            params![track_id, info_json, played_at],
        )?;
        if let Some(requested_by) = requested_by {
            conn.execute(
                "INSERT INTO user_history (requested_by, track_id, info, played_at, play_count) VALUES (?1, ?2, ?3, ?4, 1)
                 ON CONFLICT(requested_by, track_id) DO UPDATE SET info = excluded.info, played_at = excluded.played_at, play_count = play_count + 1",
                params![requested_by, track_id, info_json, played_at],
            )?;
        }
        Ok(())
    }

    pub fn get_global_history(&self, track_id: &str) -> rusqlite::Result<Option<GlobalHistoryEntry>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT track_id, info, played_at, play_count FROM global_history WHERE track_id = ?1",
            params![track_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, i64>(2)?,
                    r.get::<_, i64>(3)?,
                ))
            },
        )
        .optional()?
        .map(|(track_id, info_json, played_at, play_count)| {
            Ok(GlobalHistoryEntry {
                track_id,
                info: serde_json::from_str(&info_json).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
                })?,
                played_at,
                play_count: play_count as u32,
            })
        })
        .transpose()
    }

    pub fn get_user_history(&self, requested_by: &str, track_id: &str) -> rusqlite::Result<Option<UserHistoryEntry>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT requested_by, track_id, info, played_at, play_count FROM user_history
             WHERE requested_by = ?1 AND track_id = ?2",
            params![requested_by, track_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, i64>(3)?,
                    r.get::<_, i64>(4)?,
                ))
            },
        )
        .optional()?
        .map(|(requested_by, track_id, info_json, played_at, play_count)| {
            Ok(UserHistoryEntry {
                requested_by,
                track_id,
                info: serde_json::from_str(&info_json).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
                })?,
                played_at,
                play_count: play_count as u32,
            })
        })
        .transpose()
    }
}
