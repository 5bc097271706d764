//! # VoxQueue
//!
//! Per-guild queue storage: priority and regular track lists, last-played
//! tracking, wave/loop/volume flags, backed by SQLite and fronted by an
//! in-memory cache. Persistence follows the generic cache database's
//! `Mutex<Connection>` style; the cache-then-store layering follows the
//! provider client's check-cache-then-fetch pattern, applied here to reads
//! instead of network calls.

mod db;

use db::QueueDb;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;
use vox_cache::KeyCache;
use vox_config::CacheConfig;
use vox_core::{Error, GlobalHistoryEntry, QueuedTrack, Track, UserHistoryEntry};

fn cache_key(channel_id: &str, priority: bool) -> String {
    format!("queue_{channel_id}_{priority}")
}

/// A read-optimized view of one priority tier of a channel's queue.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct QueueView {
    pub tracks: Vec<QueuedTrack>,
    pub last_track_id: Option<String>,
    pub wave_status: bool,
    pub volume: Option<u8>,
}

fn to_rusqlite_err(e: rusqlite::Error) -> Error {
    Error::QueueConflict(e.to_string())
}

async fn blocking<T, F>(f: F) -> Result<T, Error>
where
    F: FnOnce() -> rusqlite::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::InvariantViolation(format!("blocking queue task panicked: {e}")))?
        .map_err(to_rusqlite_err)
}

/// Per-guild queue store: SQLite-backed, cache-fronted, with per-channel
/// mutation serialization so concurrent enqueue/dequeue calls for the same
/// channel cannot interleave.
pub struct QueueStore {
    db: Arc<QueueDb>,
    cache: KeyCache<QueueView>,
    channel_locks: AsyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl QueueStore {
    pub fn open(path: &Path, cache_config: &CacheConfig) -> Result<Self, Error> {
        let db = QueueDb::open(path).map_err(to_rusqlite_err)?;
        Ok(Self {
            db: Arc::new(db),
            cache: vox_cache::from_config(cache_config, true),
            channel_locks: AsyncMutex::new(HashMap::new()),
        })
    }

    pub fn open_in_memory(cache_config: &CacheConfig) -> Result<Self, Error> {
        let db = QueueDb::open_in_memory().map_err(to_rusqlite_err)?;
        Ok(Self {
            db: Arc::new(db),
            cache: vox_cache::from_config(cache_config, true),
            channel_locks: AsyncMutex::new(HashMap::new()),
        })
    }

    async fn lock_for(&self, channel_id: &str) -> Arc<AsyncMutex<()>> {
        let mut map = self.channel_locks.lock().await;
        map.entry(channel_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    async fn invalidate(&self, channel_id: &str) {
        self.cache.invalidate(&cache_key(channel_id, true)).await;
        self.cache.invalidate(&cache_key(channel_id, false)).await;
    }

    pub async fn set_guild_channel_id(&self, guild_id: &str, channel_id: &str) -> Result<(), Error> {
        let db = self.db.clone();
        let (guild, channel) = (guild_id.to_string(), channel_id.to_string());
        blocking(move || db.set_guild_channel_id(&guild, &channel)).await
    }

    /// Upserts `track` into the queue keyed by `(channel_id, priority)`.
    /// Matches the existing repository's replace-in-place semantics: a
    /// track already present for this channel at this priority tier is
    /// replaced rather than duplicated (see the open question in the
    /// design notes about whether this dedup is intentional).
    pub async fn set_track(&self, channel_id: &str, track: QueuedTrack, priority: bool) -> Result<(), Error> {
        let guard = self.lock_for(channel_id).await;
        let _permit = guard.lock().await;
        let db = self.db.clone();
        let channel = channel_id.to_string();
        let existing = blocking({
            let db = db.clone();
            let channel = channel.clone();
            move || db.list_tracks(&channel, priority)
        })
        .await?;
        if let Some(dup) = existing.iter().find(|t| t.track_id == track.track_id) {
            let dup_track_id = dup.track_id.clone();
            blocking({
                let db = db.clone();
                let channel = channel.clone();
                move || db.remove_track(&channel, &dup_track_id)
            })
            .await?;
        }
        blocking(move || db.insert_track(&channel, priority, &track)).await?;
        self.invalidate(channel_id).await;
        Ok(())
    }

    /// Pops the head of the non-priority queue.
    pub async fn get_track(&self, channel_id: &str) -> Result<Option<QueuedTrack>, Error> {
        let guard = self.lock_for(channel_id).await;
        let _permit = guard.lock().await;
        let db = self.db.clone();
        let channel = channel_id.to_string();
        let popped = blocking(move || db.pop_front(&channel, false)).await?;
        self.invalidate(channel_id).await;
        Ok(popped)
    }

    /// Pops the head of the priority queue. The session layer drains this
    /// fully before falling back to `get_track`.
    pub async fn get_priority_track(&self, channel_id: &str) -> Result<Option<QueuedTrack>, Error> {
        let guard = self.lock_for(channel_id).await;
        let _permit = guard.lock().await;
        let db = self.db.clone();
        let channel = channel_id.to_string();
        let popped = blocking(move || db.pop_front(&channel, true)).await?;
        self.invalidate(channel_id).await;
        Ok(popped)
    }

    pub async fn get_queue(&self, channel_id: &str, priority: bool) -> Result<QueueView, Error> {
        let key = cache_key(channel_id, priority);
        if let Some(hit) = self.cache.get(&key).await {
            return Ok(hit);
        }
        let db = self.db.clone();
        let channel = channel_id.to_string();
        let tracks = blocking({
            let channel = channel.clone();
            move || db.list_tracks(&channel, priority)
        })
        .await?;

        let db2 = self.db.clone();
        let channel2 = channel_id.to_string();
        let last_track_id = blocking(move || db2.get_last_track_id(&channel2)).await?;
        let db3 = self.db.clone();
        let channel3 = channel_id.to_string();
        let wave_status = blocking(move || db3.get_wave_status(&channel3)).await?;
        let db4 = self.db.clone();
        let channel4 = channel_id.to_string();
        let volume = blocking(move || db4.get_volume(&channel4)).await?;

        let view = QueueView {
            tracks,
            last_track_id,
            wave_status,
            volume,
        };
        self.cache.put(key, view.clone()).await;
        Ok(view)
    }

    pub async fn set_last_track_id(&self, channel_id: &str, track_id: Option<&str>) -> Result<(), Error> {
        let db = self.db.clone();
        let channel = channel_id.to_string();
        let track_id = track_id.map(|s| s.to_string());
        blocking(move || db.set_last_track_id(&channel, track_id.as_deref())).await?;
        self.invalidate(channel_id).await;
        Ok(())
    }

    pub async fn get_last_track_id(&self, channel_id: &str) -> Result<Option<String>, Error> {
        let db = self.db.clone();
        let channel = channel_id.to_string();
        blocking(move || db.get_last_track_id(&channel)).await
    }

    /// Deletes tracks and nullifies `last_track_id`; preserves wave/loop/volume.
    pub async fn clear_queue(&self, channel_id: &str, priority: bool) -> Result<(), Error> {
        let guard = self.lock_for(channel_id).await;
        let _permit = guard.lock().await;
        let db = self.db.clone();
        let channel = channel_id.to_string();
        blocking(move || db.clear_queue(&channel, priority)).await?;
        self.invalidate(channel_id).await;
        Ok(())
    }

    /// Deletes tracks only; preserves `last_track_id` and `wave_status`.
    pub async fn clear_tracks_queue(&self, channel_id: &str, priority: bool) -> Result<(), Error> {
        let guard = self.lock_for(channel_id).await;
        let _permit = guard.lock().await;
        let db = self.db.clone();
        let channel = channel_id.to_string();
        blocking(move || db.clear_tracks(&channel, priority)).await?;
        self.invalidate(channel_id).await;
        Ok(())
    }

    pub async fn get_wave_status(&self, channel_id: &str) -> Result<bool, Error> {
        let db = self.db.clone();
        let channel = channel_id.to_string();
        blocking(move || db.get_wave_status(&channel)).await
    }

    pub async fn set_wave_status(&self, channel_id: &str, enabled: bool) -> Result<(), Error> {
        let db = self.db.clone();
        let channel = channel_id.to_string();
        blocking(move || db.set_wave_status(&channel, enabled)).await?;
        self.invalidate(channel_id).await;
        Ok(())
    }

    pub async fn get_volume(&self, channel_id: &str) -> Result<Option<u8>, Error> {
        let db = self.db.clone();
        let channel = channel_id.to_string();
        blocking(move || db.get_volume(&channel)).await
    }

    pub async fn set_volume(&self, channel_id: &str, volume: Option<u8>) -> Result<(), Error> {
        let db = self.db.clone();
        let channel = channel_id.to_string();
        blocking(move || db.set_volume(&channel, volume)).await?;
        self.invalidate(channel_id).await;
        Ok(())
    }

    pub async fn count_music_tracks(&self, channel_id: &str, priority: bool) -> Result<i64, Error> {
        let db = self.db.clone();
        let channel = channel_id.to_string();
        blocking(move || db.count_tracks(&channel, priority)).await
    }

    pub async fn remove_track(&self, channel_id: &str, track_id: &str) -> Result<bool, Error> {
        let guard = self.lock_for(channel_id).await;
        let _permit = guard.lock().await;
        let db = self.db.clone();
        let (channel, track) = (channel_id.to_string(), track_id.to_string());
        let removed = blocking(move || db.remove_track(&channel, &track)).await?;
        self.invalidate(channel_id).await;
        Ok(removed)
    }

    pub async fn add_multiple_tracks(&self, channel_id: &str, tracks: Vec<QueuedTrack>, priority: bool) -> Result<(), Error> {
        let guard = self.lock_for(channel_id).await;
        let _permit = guard.lock().await;
        let db = self.db.clone();
        let channel = channel_id.to_string();
        blocking(move || db.add_multiple_tracks(&channel, priority, &tracks)).await?;
        self.invalidate(channel_id).await;
        Ok(())
    }

    /// Reorders a track within its priority tier by removing and
    /// re-inserting the whole list in the new order. Simpler than an
    /// in-place SQL reorder and the list sizes here are small (a guild's
    /// queue, not a global index).
    pub async fn move_track(&self, channel_id: &str, from: usize, to: usize, priority: bool) -> Result<(), Error> {
        let guard = self.lock_for(channel_id).await;
        let _permit = guard.lock().await;
        let db = self.db.clone();
        let channel = channel_id.to_string();
        let mut tracks = blocking({
            let channel = channel.clone();
            move || db.list_tracks(&channel, priority)
        })
        .await?;
        if from >= tracks.len() || to >= tracks.len() {
            return Err(Error::InvariantViolation(format!(
                "move_track index out of range: from={from} to={to} len={}",
                tracks.len()
            )));
        }
        let item = tracks.remove(from);
        tracks.insert(to, item);

        let db2 = self.db.clone();
        let channel2 = channel.clone();
        blocking(move || db2.clear_tracks(&channel2, priority)).await?;
        let db3 = self.db.clone();
        let channel3 = channel.clone();
        blocking(move || db3.add_multiple_tracks(&channel3, priority, &tracks)).await?;
        self.invalidate(channel_id).await;
        Ok(())
    }

    pub async fn save_queue_state(&self, channel_id: &str, key: &str) -> Result<(), Error> {
        let regular = self.get_queue(channel_id, false).await?;
        let priority = self.get_queue(channel_id, true).await?;
        let payload = serde_json::to_string(&(regular, priority))
            .map_err(|e| Error::InvariantViolation(format!("snapshot serialize failed: {e}")))?;
        let db = self.db.clone();
        let (channel, key) = (channel_id.to_string(), key.to_string());
        blocking(move || db.save_snapshot(&channel, &key, &payload)).await
    }

    pub async fn restore_queue_state(&self, channel_id: &str, key: &str) -> Result<Option<(QueueView, QueueView)>, Error> {
        let db = self.db.clone();
        let (channel, key) = (channel_id.to_string(), key.to_string());
        let Some(payload) = blocking(move || db.load_snapshot(&channel, &key)).await? else {
            return Ok(None);
        };
        let (regular, priority): (QueueView, QueueView) = serde_json::from_str(&payload)
            .map_err(|e| Error::InvariantViolation(format!("snapshot deserialize failed: {e}")))?;

        let guard = self.lock_for(channel_id).await;
        let _permit = guard.lock().await;
        let db2 = self.db.clone();
        let channel2 = channel_id.to_string();
        let regular_tracks = regular.tracks.clone();
        blocking(move || db2.clear_tracks(&channel2, false)).await?;
        let db3 = self.db.clone();
        let channel3 = channel_id.to_string();
        blocking(move || db3.add_multiple_tracks(&channel3, false, &regular_tracks)).await?;

        let db4 = self.db.clone();
        let channel4 = channel_id.to_string();
        let priority_tracks = priority.tracks.clone();
        blocking(move || db4.clear_tracks(&channel4, true)).await?;
        let db5 = self.db.clone();
        let channel5 = channel_id.to_string();
        blocking(move || db5.add_multiple_tracks(&channel5, true, &priority_tracks)).await?;

        debug!(channel_id, key, "restored queue snapshot");
        self.invalidate(channel_id).await;
        Ok(Some((regular, priority)))
    }

    /// Records a track start for playback history: always increments the
    /// global play count for `info`, and additionally increments the
    /// requester's own count when `requested_by` is known.
    pub async fn record_track_played(
        &self,
        info: &Track,
        requested_by: Option<&str>,
        played_at: i64,
    ) -> Result<(), Error> {
        let db = self.db.clone();
        let track_id = info.id.clone();
        let info = info.clone();
        let requested_by = requested_by.map(|s| s.to_string());
        blocking(move || db.record_play(requested_by.as_deref(), &track_id, &info, played_at)).await
    }

    pub async fn get_global_history(&self, track_id: &str) -> Result<Option<GlobalHistoryEntry>, Error> {
        let db = self.db.clone();
        let track_id = track_id.to_string();
        blocking(move || db.get_global_history(&track_id)).await
    }

    pub async fn get_user_history(&self, requested_by: &str, track_id: &str) -> Result<Option<UserHistoryEntry>, Error> {
        let db = self.db.clone();
        let (requested_by, track_id) = (requested_by.to_string(), track_id.to_string());
        blocking(move || db.get_user_history(&requested_by, &track_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vox_core::{Track, TrackSource};

    fn track(id: &str, added_at: i64) -> QueuedTrack {
        QueuedTrack {
            track_id: id.to_string(),
            added_at,
            priority: false,
            info: Track::new(id, format!("Track {id}")),
            source: TrackSource::Other,
            requested_by: None,
        }
    }

    fn store() -> QueueStore {
        QueueStore::open_in_memory(&CacheConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn count_tracks_reflects_enqueue_and_dequeue() {
        let s = store();
        s.set_track("c1", track("a", 1), false).await.unwrap();
        s.set_track("c1", track("b", 2), false).await.unwrap();
        assert_eq!(s.count_music_tracks("c1", false).await.unwrap(), 2);
        s.get_track("c1").await.unwrap();
        assert_eq!(s.count_music_tracks("c1", false).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn clear_tracks_queue_preserves_last_track_and_wave() {
        let s = store();
        s.set_track("c1", track("a", 1), false).await.unwrap();
        s.set_last_track_id("c1", Some("a")).await.unwrap();
        s.set_wave_status("c1", true).await.unwrap();

        s.clear_tracks_queue("c1", false).await.unwrap();

        assert_eq!(s.count_music_tracks("c1", false).await.unwrap(), 0);
        assert_eq!(s.get_last_track_id("c1").await.unwrap(), Some("a".to_string()));
        assert!(s.get_wave_status("c1").await.unwrap());
    }

    #[tokio::test]
    async fn clear_queue_nullifies_last_track() {
        let s = store();
        s.set_track("c1", track("a", 1), false).await.unwrap();
        s.set_last_track_id("c1", Some("a")).await.unwrap();

        s.clear_queue("c1", false).await.unwrap();

        assert_eq!(s.get_last_track_id("c1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn dequeue_order_is_priority_first_then_regular_fifo() {
        let s = store();
        s.set_track("c1", track("reg-1", 1), false).await.unwrap();
        s.set_track("c1", track("reg-2", 2), false).await.unwrap();

        let mut pri1 = track("pri-1", 1);
        pri1.priority = true;
        let mut pri2 = track("pri-2", 2);
        pri2.priority = true;
        s.set_track("c1", pri1, true).await.unwrap();
        s.set_track("c1", pri2, true).await.unwrap();

        let priority_queue = s.get_queue("c1", true).await.unwrap();
        assert_eq!(priority_queue.tracks[0].track_id, "pri-1");
        assert_eq!(priority_queue.tracks[1].track_id, "pri-2");

        let regular_queue = s.get_queue("c1", false).await.unwrap();
        assert_eq!(regular_queue.tracks[0].track_id, "reg-1");
        assert_eq!(regular_queue.tracks[1].track_id, "reg-2");
    }

    #[tokio::test]
    async fn set_track_replaces_existing_entry_for_same_track_id() {
        let s = store();
        s.set_track("c1", track("a", 1), false).await.unwrap();
        s.set_track("c1", track("a", 2), false).await.unwrap();
        assert_eq!(s.count_music_tracks("c1", false).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn volume_persists_through_get_queue() {
        let s = store();
        assert_eq!(s.get_queue("c1", false).await.unwrap().volume, None);
        s.set_volume("c1", Some(42)).await.unwrap();
        assert_eq!(s.get_volume("c1").await.unwrap(), Some(42));
        assert_eq!(s.get_queue("c1", false).await.unwrap().volume, Some(42));
    }

    #[tokio::test]
    async fn record_track_played_increments_global_and_user_history() {
        let s = store();
        let info = Track::new("song-1", "A Song");

        s.record_track_played(&info, Some("user-1"), 1000).await.unwrap();
        s.record_track_played(&info, Some("user-1"), 2000).await.unwrap();
        s.record_track_played(&info, None, 3000).await.unwrap();

        let global = s.get_global_history("song-1").await.unwrap().unwrap();
        assert_eq!(global.play_count, 3);
        assert_eq!(global.played_at, 3000);

        let user = s.get_user_history("user-1", "song-1").await.unwrap().unwrap();
        assert_eq!(user.play_count, 2);
        assert_eq!(user.played_at, 2000);
    }

    #[tokio::test]
    async fn save_and_restore_queue_state_roundtrips() {
        let s = store();
        s.set_track("c1", track("a", 1), false).await.unwrap();
        s.save_queue_state("c1", "pre-skip").await.unwrap();
        s.clear_tracks_queue("c1", false).await.unwrap();
        assert_eq!(s.count_music_tracks("c1", false).await.unwrap(), 0);

        s.restore_queue_state("c1", "pre-skip").await.unwrap();
        assert_eq!(s.count_music_tracks("c1", false).await.unwrap(), 1);
    }
}
