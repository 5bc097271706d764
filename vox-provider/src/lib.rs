//! # VoxProvider
//!
//! Music provider adapter: search, URL resolution, playlist/album fetch,
//! and the station/rotor radio state machine, all sitting in front of a
//! cache-first client the way the Qobuz client checks its cache before
//! calling the low-level API.
//!
//! The concrete HTTP client for a given provider is injected as a
//! `ProviderApi` implementation; `ProviderAdapter` itself only knows about
//! caching, retrying, URL dispatch, and radio-session bookkeeping.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use vox_cache::KeyCache;
use vox_config::CacheConfig;
use vox_core::{Error, RadioSession, Track};

/// A provider-returned track before schema validation. Fields the wire
/// format may omit are optional here; `validate_track` drops anything
/// missing the fields a playable `Track` requires.
#[derive(Debug, Clone, Default)]
pub struct RawTrack {
    pub id: Option<String>,
    pub title: Option<String>,
    pub artists: Vec<String>,
    pub albums: Vec<Option<String>>,
    pub duration_ms: Option<u32>,
    pub cover_uri: Option<String>,
}

fn validate_track(raw: RawTrack) -> Option<Track> {
    let id = raw.id?;
    let title = raw.title?;
    Some(Track {
        id,
        title,
        artists: raw
            .artists
            .into_iter()
            .map(|name| vox_core::Artist { name })
            .collect(),
        albums: raw
            .albums
            .into_iter()
            .map(|title| vox_core::Album { title })
            .collect(),
        duration_ms: raw.duration_ms.unwrap_or(0),
        cover_uri: raw.cover_uri,
        source: vox_core::TrackSource::Other,
        generation: false,
    })
}

/// A freshly created or continued rotor/station session.
#[derive(Debug, Clone)]
pub struct RotorSession {
    pub session_id: String,
    pub batch_id: String,
}

/// The result of posting the current queue to a rotor session.
#[derive(Debug, Clone, Default)]
pub struct RotorBatch {
    pub tracks: Vec<RawTrack>,
    pub next_batch_id: Option<String>,
}

/// Low-level network surface a provider implements. Everything above this
/// trait (caching, retry, validation, radio bookkeeping) is generic over
/// it.
#[async_trait]
pub trait ProviderApi: Send + Sync {
    async fn authenticate(&self) -> Result<(), Error>;
    async fn search_tracks(&self, query: &str) -> Result<Vec<RawTrack>, Error>;
    async fn get_track(&self, id: &str) -> Result<RawTrack, Error>;
    async fn get_album_tracks(&self, album_id: &str) -> Result<Vec<RawTrack>, Error>;
    async fn get_playlist_tracks(&self, playlist_id: &str, user: Option<&str>) -> Result<Vec<RawTrack>, Error>;
    async fn get_similar_tracks(&self, track_id: &str) -> Result<Vec<RawTrack>, Error>;
    async fn create_rotor_session(&self, seed_track_id: &str) -> Result<RotorSession, Error>;
    async fn post_rotor_session_tracks(
        &self,
        session_id: &str,
        batch_id: &str,
        queue: &[String],
    ) -> Result<RotorBatch, Error>;
    async fn get_track_url(&self, track_id: &str) -> Result<Option<String>, Error>;
}

fn is_bad_request(err: &Error) -> bool {
    matches!(err, Error::ProviderFatal(msg) if msg.contains("400"))
}

async fn retry_transient<T, F, Fut>(max_retries: u32, mut op: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, Error>>,
{
    let mut delay = std::time::Duration::from_millis(1000);
    let cap = std::time::Duration::from_millis(5000);
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt < max_retries => {
                attempt += 1;
                warn!(attempt, "retrying transient provider error");
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, cap);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Music provider adapter, combining a `ProviderApi` client with caching,
/// retry, URL dispatch, and radio-session state.
pub struct ProviderAdapter<A: ProviderApi> {
    api: A,
    host: String,
    initialized: AtomicBool,
    init_lock: Mutex<()>,
    search_cache: KeyCache<Vec<Track>>,
    track_url_cache: KeyCache<String>,
    playlist_cache: KeyCache<Vec<Track>>,
    album_cache: KeyCache<Vec<Track>>,
    recommendation_cache: KeyCache<Vec<Track>>,
    radio_sessions: Mutex<HashMap<String, Arc<Mutex<RadioSession>>>>,
    cleanup_tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl<A: ProviderApi> ProviderAdapter<A> {
    pub fn new(api: A, host: impl Into<String>, cache_config: &CacheConfig, cache_enabled: bool) -> Self {
        let search_cache = vox_cache::from_config(cache_config, cache_enabled);
        let track_url_cache = vox_cache::from_config(cache_config, cache_enabled);
        let playlist_cache = vox_cache::from_config(cache_config, cache_enabled);
        let album_cache = vox_cache::from_config(cache_config, cache_enabled);
        let recommendation_cache = vox_cache::from_config(cache_config, cache_enabled);

        let cleanup_tasks = vec![
            vox_cache::spawn_cleanup_tick(
                search_cache.clone(),
                cache_config.cleanup_interval,
                cache_config.cleanup_threshold,
            ),
            vox_cache::spawn_cleanup_tick(
                track_url_cache.clone(),
                cache_config.cleanup_interval,
                cache_config.cleanup_threshold,
            ),
            vox_cache::spawn_cleanup_tick(
                playlist_cache.clone(),
                cache_config.cleanup_interval,
                cache_config.cleanup_threshold,
            ),
            vox_cache::spawn_cleanup_tick(
                album_cache.clone(),
                cache_config.cleanup_interval,
                cache_config.cleanup_threshold,
            ),
            vox_cache::spawn_cleanup_tick(
                recommendation_cache.clone(),
                cache_config.cleanup_interval,
                cache_config.cleanup_threshold,
            ),
        ];

        Self {
            api,
            host: host.into(),
            initialized: AtomicBool::new(false),
            init_lock: Mutex::new(()),
            search_cache,
            track_url_cache,
            playlist_cache,
            album_cache,
            recommendation_cache,
            radio_sessions: Mutex::new(HashMap::new()),
            cleanup_tasks,
        }
    }

    /// Idempotent bootstrap, serialized so concurrent callers only trigger
    /// one authentication attempt.
    pub async fn ensure_initialized(&self) -> Result<(), Error> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        let _guard = self.init_lock.lock().await;
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        self.api.authenticate().await?;
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    pub fn includes_url(&self, url: &str) -> bool {
        let Ok(parsed) = url::Url::parse(url) else {
            return false;
        };
        if parsed.host_str() != Some(self.host.as_str()) {
            return false;
        }
        let segments: Vec<&str> = parsed.path_segments().map(|s| s.collect()).unwrap_or_default();
        matches!(
            segments.as_slice(),
            ["album", _] | ["album", _, "track", _] | ["track", _] | ["playlists", _] | ["users", _, "playlists", _]
        )
    }

    pub async fn search_name(&self, query: &str) -> Result<Vec<Track>, Error> {
        let key = format!("search:{query}");
        if let Some(hit) = self.search_cache.get(&key).await {
            return Ok(hit);
        }
        let tracks = retry_transient(3, || self.api.search_tracks(query)).await?;
        let valid: Vec<Track> = tracks.into_iter().filter_map(validate_track).collect();
        if !valid.is_empty() {
            self.search_cache.put(key, valid.clone()).await;
        }
        Ok(valid)
    }

    /// Dispatches a provider URL by shape. Returns an empty list (not an
    /// error) for a foreign host or an unrecognized path.
    pub async fn search_url(&self, url: &str) -> Result<Vec<Track>, Error> {
        let Ok(parsed) = url::Url::parse(url) else {
            return Ok(Vec::new());
        };
        if parsed.host_str() != Some(self.host.as_str()) {
            return Ok(Vec::new());
        }
        let segments: Vec<&str> = parsed.path_segments().map(|s| s.collect()).unwrap_or_default();
        match segments.as_slice() {
            ["album", album_id, "track", track_id] => {
                let _ = album_id;
                let raw = self.api.get_track(track_id).await?;
                Ok(validate_track(raw).into_iter().collect())
            }
            ["track", track_id] => {
                let raw = self.api.get_track(track_id).await?;
                Ok(validate_track(raw).into_iter().collect())
            }
            ["users", user, "playlists", playlist_id] => {
                self.get_playlist_tracks(playlist_id, Some(user)).await
            }
            ["playlists", kind] => self.get_playlist_tracks(kind, None).await,
            ["album", album_id] => self.get_album_tracks(album_id).await,
            _ => Ok(Vec::new()),
        }
    }

    pub async fn get_track_url(&self, track_id: &str) -> Result<Option<String>, Error> {
        if let Some(hit) = self.track_url_cache.get(track_id).await {
            return Ok(Some(hit));
        }
        let url = retry_transient(3, || self.api.get_track_url(track_id)).await?;
        if let Some(url) = &url {
            self.track_url_cache.put(track_id.to_string(), url.clone()).await;
        }
        Ok(url)
    }

    pub async fn get_playlist_tracks(&self, playlist_id: &str, user: Option<&str>) -> Result<Vec<Track>, Error> {
        let key = format!("playlist:{}:{}", user.unwrap_or(""), playlist_id);
        if let Some(hit) = self.playlist_cache.get(&key).await {
            return Ok(hit);
        }
        let raw = self.api.get_playlist_tracks(playlist_id, user).await?;
        let valid: Vec<Track> = raw.into_iter().filter_map(validate_track).collect();
        self.playlist_cache.put(key, valid.clone()).await;
        Ok(valid)
    }

    pub async fn get_album_tracks(&self, album_id: &str) -> Result<Vec<Track>, Error> {
        let key = format!("album:{album_id}");
        if let Some(hit) = self.album_cache.get(&key).await {
            return Ok(hit);
        }
        let raw = self.api.get_album_tracks(album_id).await?;
        let valid: Vec<Track> = raw.into_iter().filter_map(validate_track).collect();
        self.album_cache.put(key, valid.clone()).await;
        Ok(valid)
    }

    async fn seed_lock(&self, seed: &str) -> Arc<Mutex<RadioSession>> {
        let mut map = self.radio_sessions.lock().await;
        map.entry(seed.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(RadioSession {
                    seed_track_id: seed.to_string(),
                    ..Default::default()
                }))
            })
            .clone()
    }

    /// Station/rotor recommendation, single-flight per seed track: a
    /// per-seed lock is held for the whole operation, so concurrent callers
    /// for the same seed serialize and the second sees the first's result
    /// rather than creating a second session.
    pub async fn get_recommendations(&self, seed_track_id: &str) -> Result<Vec<Track>, Error> {
        let lock = self.seed_lock(seed_track_id).await;
        let mut session = lock.lock().await;
        self.get_recommendations_inner(seed_track_id, &mut session, false).await
    }

    async fn get_recommendations_inner(
        &self,
        seed_track_id: &str,
        session: &mut RadioSession,
        retried: bool,
    ) -> Result<Vec<Track>, Error> {
        if session.session_id.is_none() {
            let created = self.api.create_rotor_session(seed_track_id).await?;
            session.session_id = Some(created.session_id);
            session.batch_id = Some(created.batch_id);
            session.played_ids.clear();
            session.queued_ids.clear();
        }
        let session_id = session.session_id.clone().unwrap_or_default();
        let batch_id = session.batch_id.clone().unwrap_or_default();
        let queue = session.queued_ids.clone();

        match self.api.post_rotor_session_tracks(&session_id, &batch_id, &queue).await {
            Ok(batch) => {
                let Some(mut track) = batch.tracks.into_iter().find_map(validate_track) else {
                    return Err(Error::ProviderInvalidData("rotor batch had no valid track".into()));
                };
                track.generation = true;
                session.queued_ids.push(track.id.clone());
                let album_tag = track.albums.first().and_then(|a| a.title.clone()).unwrap_or_default();
                session.played_ids.insert(format!("{}:{}", track.id, album_tag));
                if let Some(next) = batch.next_batch_id {
                    session.batch_id = Some(next);
                }
                Ok(vec![track])
            }
            Err(e) if is_bad_request(&e) && !retried => {
                debug!(seed_track_id, "rotor session rejected, invalidating and retrying once");
                *session = RadioSession {
                    seed_track_id: seed_track_id.to_string(),
                    ..Default::default()
                };
                Box::pin(self.get_recommendations_inner(seed_track_id, session, true)).await
            }
            Err(e) => {
                warn!(seed_track_id, error = %e, "station path failed, falling back to similar tracks");
                self.similar_tracks_fallback(seed_track_id).await
            }
        }
    }

    async fn similar_tracks_fallback(&self, seed_track_id: &str) -> Result<Vec<Track>, Error> {
        let key = format!("similar:{seed_track_id}");
        if let Some(hit) = self.recommendation_cache.get(&key).await {
            return Ok(hit);
        }
        let raw = self.api.get_similar_tracks(seed_track_id).await?;
        let valid: Vec<Track> = raw
            .into_iter()
            .filter_map(validate_track)
            .take(5)
            .map(|mut t| {
                t.generation = true;
                t
            })
            .collect();
        self.recommendation_cache.put(key, valid.clone()).await;
        Ok(valid)
    }

    /// Clears all radio/rotor session state, for every seed track.
    pub async fn reset_radio_session(&self) {
        let mut map = self.radio_sessions.lock().await;
        map.clear();
    }

    /// Clears session state for a single seed track, leaving other seeds'
    /// sessions intact.
    pub async fn reset_radio_session_for_seed(&self, seed_track_id: &str) {
        let mut map = self.radio_sessions.lock().await;
        map.remove(seed_track_id);
    }

    pub async fn clear_cache(&self) {
        self.search_cache.invalidate_all();
        self.track_url_cache.invalidate_all();
        self.playlist_cache.invalidate_all();
        self.album_cache.invalidate_all();
        self.recommendation_cache.invalidate_all();
    }

    /// Cancels the periodic cache cleanup ticks and drops all cached
    /// entries. Call once when the adapter is being torn down; the adapter
    /// itself is unusable afterward (caches still work, but nothing will
    /// clear them again).
    pub async fn destroy(&self) {
        for task in &self.cleanup_tasks {
            task.abort();
        }
        self.clear_cache().await;
        self.reset_radio_session().await;
    }
}

#[async_trait]
impl<A: ProviderApi> vox_core::RadioProvider for ProviderAdapter<A> {
    async fn search_name(&self, query: &str) -> Result<Vec<Track>, Error> {
        self.ensure_initialized().await?;
        ProviderAdapter::search_name(self, query).await
    }

    async fn search_url(&self, url: &str) -> Result<Vec<Track>, Error> {
        self.ensure_initialized().await?;
        ProviderAdapter::search_url(self, url).await
    }

    async fn get_track_url(&self, track_id: &str) -> Result<Option<String>, Error> {
        self.ensure_initialized().await?;
        ProviderAdapter::get_track_url(self, track_id).await
    }

    async fn get_recommendations(&self, seed_track_id: &str) -> Result<Vec<Track>, Error> {
        self.ensure_initialized().await?;
        ProviderAdapter::get_recommendations(self, seed_track_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[derive(Default)]
    struct MockApi {
        rotor_calls: AtomicU32,
        post_calls: AtomicU32,
        reject_first_post: bool,
        fail_station: bool,
    }

    #[async_trait]
    impl ProviderApi for MockApi {
        async fn authenticate(&self) -> Result<(), Error> {
            Ok(())
        }

        async fn search_tracks(&self, query: &str) -> Result<Vec<RawTrack>, Error> {
            Ok(vec![
                RawTrack {
                    id: Some("1".into()),
                    title: Some(format!("song about {query}")),
                    ..Default::default()
                },
                RawTrack::default(), // invalid: dropped
            ])
        }

        async fn get_track(&self, id: &str) -> Result<RawTrack, Error> {
            Ok(RawTrack {
                id: Some(id.to_string()),
                title: Some("Track".to_string()),
                ..Default::default()
            })
        }

        async fn get_album_tracks(&self, _album_id: &str) -> Result<Vec<RawTrack>, Error> {
            Ok(vec![])
        }

        async fn get_playlist_tracks(&self, _playlist_id: &str, _user: Option<&str>) -> Result<Vec<RawTrack>, Error> {
            Ok(vec![])
        }

        async fn get_similar_tracks(&self, track_id: &str) -> Result<Vec<RawTrack>, Error> {
            Ok(vec![RawTrack {
                id: Some(format!("similar-{track_id}")),
                title: Some("Similar".into()),
                ..Default::default()
            }])
        }

        async fn create_rotor_session(&self, seed_track_id: &str) -> Result<RotorSession, Error> {
            self.rotor_calls.fetch_add(1, Ordering::SeqCst);
            Ok(RotorSession {
                session_id: format!("session-{seed_track_id}"),
                batch_id: "batch-0".to_string(),
            })
        }

        async fn post_rotor_session_tracks(
            &self,
            _session_id: &str,
            _batch_id: &str,
            queue: &[String],
        ) -> Result<RotorBatch, Error> {
            if self.fail_station {
                return Err(Error::ProviderTransient("unavailable".into()));
            }
            let call_index = self.post_calls.fetch_add(1, Ordering::SeqCst);
            if self.reject_first_post && call_index == 0 {
                return Err(Error::ProviderFatal("400 bad request".into()));
            }
            Ok(RotorBatch {
                tracks: vec![RawTrack {
                    id: Some(format!("rotor-{}", queue.len())),
                    title: Some("Rotor Track".into()),
                    ..Default::default()
                }],
                next_batch_id: Some("batch-1".to_string()),
            })
        }

        async fn get_track_url(&self, _track_id: &str) -> Result<Option<String>, Error> {
            Ok(Some("https://cdn.example/stream".to_string()))
        }
    }

    fn adapter(api: MockApi) -> ProviderAdapter<MockApi> {
        ProviderAdapter::new(api, "music.example", &CacheConfig::default(), true)
    }

    #[tokio::test]
    async fn search_url_resolves_album_track_path() {
        let a = adapter(MockApi::default());
        let tracks = a.search_url("https://music.example/album/1/track/2").await.unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].id, "2");
    }

    #[tokio::test]
    async fn search_url_returns_empty_for_foreign_host() {
        let a = adapter(MockApi::default());
        let tracks = a.search_url("https://other.example/album/1/track/2").await.unwrap();
        assert!(tracks.is_empty());
    }

    #[tokio::test]
    async fn search_name_drops_invalid_entries() {
        let a = adapter(MockApi::default());
        let tracks = a.search_name("hello").await.unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].id, "1");
    }

    #[tokio::test]
    async fn recommendations_invalidate_session_on_bad_request_then_retry() {
        let api = MockApi {
            reject_first_post: true,
            ..Default::default()
        };
        let a = adapter(api);
        let tracks = a.get_recommendations("seed-1").await.unwrap();
        assert_eq!(tracks.len(), 1);
        assert!(tracks[0].generation);
        // two create_rotor_session calls: the initial one (rejected) and the retry.
        assert_eq!(a.api.rotor_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn recommendations_fall_back_to_similar_on_persistent_station_failure() {
        let api = MockApi {
            fail_station: true,
            ..Default::default()
        };
        let a = adapter(api);
        let tracks = a.get_recommendations("seed-2").await.unwrap();
        assert_eq!(tracks.len(), 1);
        assert!(tracks[0].id.starts_with("similar-"));
    }

    #[tokio::test]
    async fn reset_radio_session_clears_every_seed() {
        let a = adapter(MockApi::default());
        a.get_recommendations("seed-a").await.unwrap();
        a.get_recommendations("seed-b").await.unwrap();
        assert_eq!(a.radio_sessions.lock().await.len(), 2);

        a.reset_radio_session().await;
        assert!(a.radio_sessions.lock().await.is_empty());
    }

    #[tokio::test]
    async fn destroy_clears_caches_and_sessions() {
        let a = adapter(MockApi::default());
        a.search_name("hello").await.unwrap();
        a.get_recommendations("seed-c").await.unwrap();

        a.destroy().await;
        assert!(a.radio_sessions.lock().await.is_empty());
        assert_eq!(a.search_cache.entry_count().await, 0);
    }

    #[tokio::test]
    async fn concurrent_recommendations_share_one_session_creation() {
        let api = Arc::new(adapter(MockApi::default()));
        let a1 = api.clone();
        let a2 = api.clone();
        let (r1, r2) = tokio::join!(
            a1.get_recommendations("seed-shared"),
            a2.get_recommendations("seed-shared"),
        );
        r1.unwrap();
        r2.unwrap();
        assert_eq!(api.api.rotor_calls.load(Ordering::SeqCst), 1);
    }
}
