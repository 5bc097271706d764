//! # VoxSession
//!
//! Per-guild playback state machine and the orchestrator that owns one
//! session per guild. Each session runs as a command-channel-fed background
//! task, the same shape the radio worker uses to serialize state mutations
//! behind a single owning task instead of a shared lock around everything.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vox_core::{Error, RadioProvider};
use vox_pipeline::{DspOptions, PipelineBuilder, StreamKind};
use vox_queue::QueueStore;

/// A playing stream attached to the voice sink.
pub trait PlaybackHandle: Send + Sync {
    /// Requests that playback stop; idempotent.
    fn stop(&self);
    /// Resolves when the stream has finished delivering audio, whether
    /// because it ran out, errored, or was stopped.
    fn done(&self) -> BoxFuture<'static, ()>;
}

/// The voice output surface a session attaches its stream to. Exactly one
/// attachment is active per guild at a time.
#[async_trait]
pub trait VoiceSink: Send + Sync {
    async fn attach(
        &self,
        guild_id: &str,
        kind: StreamKind,
        reader: Box<dyn tokio::io::AsyncRead + Unpin + Send>,
    ) -> Result<Arc<dyn PlaybackHandle>, Error>;
}

#[derive(Debug)]
enum SessionCommand {
    Play { ack: oneshot::Sender<Result<(), Error>> },
    Skip { ack: oneshot::Sender<Result<(), Error>> },
    Stop { ack: oneshot::Sender<Result<(), Error>> },
    Seek { position_ms: u64, ack: oneshot::Sender<Result<(), Error>> },
    SetVolume { volume: f32 },
    SetEqualizer { bass: f32, treble: f32, compressor: bool },
    SetWaveStatus { enabled: bool },
    TrackEnded { track_id: String },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlaybackState {
    Idle,
    Playing,
    Stopped,
}

struct CurrentTrack {
    track: vox_core::QueuedTrack,
    cancel: CancellationToken,
    dsp: Option<vox_dsp::AudioProcessorHandle>,
    playback: Arc<dyn PlaybackHandle>,
}

/// Handle returned to callers; commands are posted over a channel so all
/// mutation of a guild's session happens on that session's own task.
pub struct PlaybackSessionHandle {
    guild_id: String,
    tx: mpsc::Sender<SessionCommand>,
    join: Mutex<Option<JoinHandle<()>>>,
    last_activity: std::sync::Mutex<Instant>,
}

impl PlaybackSessionHandle {
    fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().unwrap().elapsed()
    }

    pub async fn play(&self) -> Result<(), Error> {
        self.touch();
        let (ack, rx) = oneshot::channel();
        self.send(SessionCommand::Play { ack }).await?;
        rx.await.map_err(|_| Error::InvariantViolation("session task gone".into()))?
    }

    pub async fn skip(&self) -> Result<(), Error> {
        self.touch();
        let (ack, rx) = oneshot::channel();
        self.send(SessionCommand::Skip { ack }).await?;
        rx.await.map_err(|_| Error::InvariantViolation("session task gone".into()))?
    }

    pub async fn stop(&self) -> Result<(), Error> {
        self.touch();
        let (ack, rx) = oneshot::channel();
        self.send(SessionCommand::Stop { ack }).await?;
        rx.await.map_err(|_| Error::InvariantViolation("session task gone".into()))?
    }

    /// Restarts the currently playing track from `position_ms`. A no-op
    /// (returns an error) if nothing is currently playing.
    pub async fn seek(&self, position_ms: u64) -> Result<(), Error> {
        self.touch();
        let (ack, rx) = oneshot::channel();
        self.send(SessionCommand::Seek { position_ms, ack }).await?;
        rx.await.map_err(|_| Error::InvariantViolation("session task gone".into()))?
    }

    pub async fn set_volume(&self, volume: f32) -> Result<(), Error> {
        self.touch();
        self.send(SessionCommand::SetVolume { volume }).await
    }

    pub async fn set_equalizer(&self, bass: f32, treble: f32, compressor: bool) -> Result<(), Error> {
        self.touch();
        self.send(SessionCommand::SetEqualizer { bass, treble, compressor }).await
    }

    pub async fn set_wave_status(&self, enabled: bool) -> Result<(), Error> {
        self.touch();
        self.send(SessionCommand::SetWaveStatus { enabled }).await
    }

    async fn send(&self, cmd: SessionCommand) -> Result<(), Error> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| Error::InvariantViolation("session task gone".into()))
    }

    async fn shutdown(&self) {
        let _ = self.tx.send(SessionCommand::Shutdown).await;
        if let Some(join) = self.join.lock().await.take() {
            let _ = join.await;
        }
    }
}

struct SessionWorker {
    guild_id: String,
    channel_id: String,
    queue: Arc<QueueStore>,
    provider: Arc<dyn RadioProvider>,
    pipeline: Arc<PipelineBuilder>,
    sink: Arc<dyn VoiceSink>,
    self_tx: mpsc::Sender<SessionCommand>,
    current: Option<CurrentTrack>,
    state: PlaybackState,
    wave_status: bool,
    volume: f32,
    bass: f32,
    treble: f32,
    compressor: bool,
}

impl SessionWorker {
    async fn handle_command(&mut self, cmd: SessionCommand) -> bool {
        match cmd {
            SessionCommand::Play { ack } => {
                let result = if self.current.is_none() {
                    self.advance().await
                } else {
                    Ok(())
                };
                if let Err(e) = &result {
                    warn!(guild_id = %self.guild_id, error = %e, "play failed");
                }
                let _ = ack.send(result);
            }
            SessionCommand::Skip { ack } => {
                self.stop_current();
                let result = self.advance().await;
                let _ = ack.send(result);
            }
            SessionCommand::Stop { ack } => {
                self.stop_current();
                if let Err(e) = self.queue.clear_queue(&self.channel_id, false).await {
                    warn!(guild_id = %self.guild_id, error = %e, "failed clearing queue on stop");
                }
                if let Err(e) = self.queue.clear_queue(&self.channel_id, true).await {
                    warn!(guild_id = %self.guild_id, error = %e, "failed clearing priority queue on stop");
                }
                self.state = PlaybackState::Stopped;
                let _ = ack.send(Ok(()));
                return false;
            }
            SessionCommand::Seek { position_ms, ack } => {
                let result = self.seek_current(position_ms).await;
                if let Err(e) = &result {
                    warn!(guild_id = %self.guild_id, error = %e, "seek failed");
                }
                let _ = ack.send(result);
            }
            SessionCommand::SetVolume { volume } => {
                self.volume = volume;
                if let Some(cur) = &self.current {
                    if let Some(dsp) = &cur.dsp {
                        dsp.set_volume(volume);
                    }
                }
                let pct = (volume.clamp(0.0, 1.0) * 100.0).round() as u8;
                if let Err(e) = self.queue.set_volume(&self.channel_id, Some(pct)).await {
                    warn!(guild_id = %self.guild_id, error = %e, "failed persisting volume");
                }
            }
            SessionCommand::SetEqualizer { bass, treble, compressor } => {
                self.bass = bass;
                self.treble = treble;
                self.compressor = compressor;
                if let Some(cur) = &self.current {
                    if let Some(dsp) = &cur.dsp {
                        dsp.set_equalizer(bass, treble, compressor);
                    }
                }
            }
            SessionCommand::SetWaveStatus { enabled } => {
                self.wave_status = enabled;
                if let Err(e) = self.queue.set_wave_status(&self.channel_id, enabled).await {
                    warn!(guild_id = %self.guild_id, error = %e, "failed persisting wave status");
                }
            }
            SessionCommand::TrackEnded { track_id } => {
                let is_current = matches!(&self.current, Some(cur) if cur.track.track_id == track_id);
                if is_current {
                    self.current = None;
                    if let Err(e) = self.advance().await {
                        warn!(guild_id = %self.guild_id, error = %e, "advance after track end failed");
                    }
                }
            }
            SessionCommand::Shutdown => {
                self.stop_current();
                return false;
            }
        }
        true
    }

    fn stop_current(&mut self) {
        if let Some(cur) = self.current.take() {
            cur.playback.stop();
            cur.cancel.cancel();
        }
    }

    /// Dequeues the next track (priority first, then regular); if both are
    /// empty and wave mode is on, pulls one recommendation and tries once
    /// more. Failure on a single track is logged and treated as that track
    /// ending: the session keeps advancing rather than stopping.
    async fn advance(&mut self) -> Result<(), Error> {
        self.advance_with_wave_retry(true).await
    }

    async fn advance_with_wave_retry(&mut self, allow_wave_fill: bool) -> Result<(), Error> {
        let next = self.dequeue_next(allow_wave_fill).await?;
        let Some(track) = next else {
            self.state = PlaybackState::Idle;
            return Ok(());
        };

        match self.start_track(&track).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(guild_id = %self.guild_id, track_id = %track.track_id, error = %e, "track failed to start, advancing");
                Box::pin(self.advance_with_wave_retry(allow_wave_fill)).await
            }
        }
    }

    async fn dequeue_next(&mut self, allow_wave_fill: bool) -> Result<Option<vox_core::QueuedTrack>, Error> {
        if let Some(track) = self.queue.get_priority_track(&self.channel_id).await? {
            return Ok(Some(track));
        }
        if let Some(track) = self.queue.get_track(&self.channel_id).await? {
            return Ok(Some(track));
        }
        if !self.wave_status || !allow_wave_fill {
            return Ok(None);
        }
        let Some(last_track_id) = self.queue.get_last_track_id(&self.channel_id).await? else {
            return Ok(None);
        };
        let recs = self.provider.get_recommendations(&last_track_id).await?;
        if recs.is_empty() {
            return Ok(None);
        }
        let queued: Vec<vox_core::QueuedTrack> = recs
            .into_iter()
            .map(|info| vox_core::QueuedTrack {
                track_id: info.id.clone(),
                added_at: 0,
                priority: false,
                source: info.source,
                info,
                requested_by: None,
            })
            .collect();
        self.queue.add_multiple_tracks(&self.channel_id, queued, false).await?;
        // Don't allow a second wave fill in the same advance — one
        // recommendation per empty-queue event.
        Box::pin(self.dequeue_next(false)).await
    }

    async fn start_track(&mut self, track: &vox_core::QueuedTrack) -> Result<(), Error> {
        self.start_track_at(track, None).await
    }

    /// Starts `track`, optionally from `seek_seconds` into it. Records the
    /// play in global/user history on every start, including re-seeks of the
    /// same track, matching the play-count semantics of a track start.
    async fn start_track_at(&mut self, track: &vox_core::QueuedTrack, seek_seconds: Option<f64>) -> Result<(), Error> {
        let Some(url) = self.provider.get_track_url(&track.track_id).await? else {
            return Err(Error::ProviderNotFound(format!("no stream url for {}", track.track_id)));
        };

        let opts = DspOptions {
            volume: self.volume,
            bass: self.bass,
            treble: self.treble,
            compressor: self.compressor,
            low_pass_frequency: None,
        };
        let built = self.pipeline.build_for_voice_at(&url, opts, seek_seconds).await?;
        let playback = self.sink.attach(&self.guild_id, built.kind, built.reader).await?;

        self.queue.set_last_track_id(&self.channel_id, Some(&track.track_id)).await?;

        let played_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        if let Err(e) = self
            .queue
            .record_track_played(&track.info, track.requested_by.as_deref(), played_at)
            .await
        {
            warn!(guild_id = %self.guild_id, track_id = %track.track_id, error = %e, "failed recording play history");
        }

        info!(guild_id = %self.guild_id, track_id = %track.track_id, "track started");

        let done = playback.done();
        let track_id = track.track_id.clone();
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            done.await;
            let _ = tx.send(SessionCommand::TrackEnded { track_id }).await;
        });

        self.current = Some(CurrentTrack {
            track: track.clone(),
            cancel: built.cancel,
            dsp: built.dsp,
            playback,
        });
        self.state = PlaybackState::Playing;
        Ok(())
    }

    /// Re-builds the pipeline for the currently playing track starting at
    /// `position_ms`, replacing the in-flight stream. Errors if nothing is
    /// currently playing.
    async fn seek_current(&mut self, position_ms: u64) -> Result<(), Error> {
        let Some(cur) = self.current.take() else {
            return Err(Error::InvariantViolation("seek with nothing playing".into()));
        };
        let track = cur.track.clone();
        cur.playback.stop();
        cur.cancel.cancel();
        self.start_track_at(&track, Some(position_ms as f64 / 1000.0)).await
    }
}

/// Spawns a per-guild session task and returns the handle callers interact
/// with.
pub fn spawn_session(
    guild_id: impl Into<String>,
    channel_id: impl Into<String>,
    queue: Arc<QueueStore>,
    provider: Arc<dyn RadioProvider>,
    pipeline: Arc<PipelineBuilder>,
    sink: Arc<dyn VoiceSink>,
) -> Arc<PlaybackSessionHandle> {
    let guild_id = guild_id.into();
    let channel_id = channel_id.into();
    let (tx, mut rx) = mpsc::channel(32);
    let self_tx = tx.clone();
    let worker_guild = guild_id.clone();

    let join = tokio::spawn(async move {
        let wave_status = queue.get_wave_status(&channel_id).await.unwrap_or(false);
        let volume = match queue.get_volume(&channel_id).await {
            Ok(Some(pct)) => (pct as f32 / 100.0).clamp(0.0, 1.0),
            _ => 1.0,
        };
        let mut worker = SessionWorker {
            guild_id: worker_guild.clone(),
            channel_id,
            queue,
            provider,
            pipeline,
            sink,
            self_tx,
            current: None,
            state: PlaybackState::Idle,
            wave_status,
            volume,
            bass: vox_dsp::BASS_NEUTRAL,
            treble: vox_dsp::TREBLE_NEUTRAL,
            compressor: false,
        };

        while let Some(cmd) = rx.recv().await {
            if !worker.handle_command(cmd).await {
                break;
            }
        }
        debug!(guild_id = %worker_guild, "session task stopped");
    });

    Arc::new(PlaybackSessionHandle {
        guild_id,
        tx,
        join: Mutex::new(Some(join)),
        last_activity: std::sync::Mutex::new(Instant::now()),
    })
}

/// Binary-level wiring component: holds shared adapters and a per-guild
/// session map, lazily creating sessions and reaping idle ones. Mirrors the
/// teacher's shared playlist state, which is also an `RwLock`-guarded map
/// mutated by short critical sections rather than held across I/O.
pub struct Orchestrator {
    queue: Arc<QueueStore>,
    provider: Arc<dyn RadioProvider>,
    pipeline: Arc<PipelineBuilder>,
    sink: Arc<dyn VoiceSink>,
    sessions: RwLock<HashMap<String, Arc<PlaybackSessionHandle>>>,
    idle_timeout: Duration,
    reaping: AtomicBool,
}

impl Orchestrator {
    pub fn new(
        queue: Arc<QueueStore>,
        provider: Arc<dyn RadioProvider>,
        pipeline: Arc<PipelineBuilder>,
        sink: Arc<dyn VoiceSink>,
        idle_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue,
            provider,
            pipeline,
            sink,
            sessions: RwLock::new(HashMap::new()),
            idle_timeout,
            reaping: AtomicBool::new(false),
        })
    }

    async fn session_for(&self, guild_id: &str, channel_id: &str) -> Arc<PlaybackSessionHandle> {
        if let Some(existing) = self.sessions.read().await.get(guild_id) {
            return existing.clone();
        }
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(guild_id) {
            return existing.clone();
        }
        let handle = spawn_session(
            guild_id,
            channel_id,
            self.queue.clone(),
            self.provider.clone(),
            self.pipeline.clone(),
            self.sink.clone(),
        );
        sessions.insert(guild_id.to_string(), handle.clone());
        handle
    }

    pub async fn play(&self, guild_id: &str, channel_id: &str) -> Result<(), Error> {
        self.session_for(guild_id, channel_id).await.play().await
    }

    pub async fn skip(&self, guild_id: &str, channel_id: &str) -> Result<(), Error> {
        self.session_for(guild_id, channel_id).await.skip().await
    }

    pub async fn stop(&self, guild_id: &str, channel_id: &str) -> Result<(), Error> {
        self.session_for(guild_id, channel_id).await.stop().await
    }

    pub async fn seek(&self, guild_id: &str, channel_id: &str, position_ms: u64) -> Result<(), Error> {
        self.session_for(guild_id, channel_id).await.seek(position_ms).await
    }

    pub async fn set_volume(&self, guild_id: &str, channel_id: &str, volume: f32) -> Result<(), Error> {
        self.session_for(guild_id, channel_id).await.set_volume(volume).await
    }

    pub async fn set_equalizer(
        &self,
        guild_id: &str,
        channel_id: &str,
        bass: f32,
        treble: f32,
        compressor: bool,
    ) -> Result<(), Error> {
        self.session_for(guild_id, channel_id)
            .await
            .set_equalizer(bass, treble, compressor)
            .await
    }

    pub async fn set_wave_status(&self, guild_id: &str, channel_id: &str, enabled: bool) -> Result<(), Error> {
        self.session_for(guild_id, channel_id).await.set_wave_status(enabled).await
    }

    /// Runs forever, evicting sessions idle past `idle_timeout`. Spawn once
    /// per orchestrator; the `reaping` guard makes a second call a no-op so
    /// callers don't need to track whether it was already started.
    pub async fn run_idle_sweep(self: Arc<Self>) {
        if self.reaping.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        loop {
            ticker.tick().await;
            let idle_guilds: Vec<String> = {
                let sessions = self.sessions.read().await;
                sessions
                    .iter()
                    .filter(|(_, handle)| handle.idle_for() >= self.idle_timeout)
                    .map(|(guild_id, _)| guild_id.clone())
                    .collect()
            };
            for guild_id in idle_guilds {
                let handle = {
                    let mut sessions = self.sessions.write().await;
                    sessions.remove(&guild_id)
                };
                if let Some(handle) = handle {
                    debug!(guild_id = %guild_id, "reaping idle session");
                    handle.shutdown().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use vox_config::{CacheConfig, FfmpegConfig, HttpConfig};
    use vox_core::{Artist, Track, TrackSource};

    struct StubHandle {
        stopped: Arc<AtomicBool>,
        notify: Arc<tokio::sync::Notify>,
    }

    impl PlaybackHandle for StubHandle {
        fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
            self.notify.notify_waiters();
        }

        fn done(&self) -> BoxFuture<'static, ()> {
            let notify = self.notify.clone();
            Box::pin(async move {
                notify.notified().await;
            })
        }
    }

    struct StubSink {
        attach_count: AtomicUsize,
    }

    #[async_trait]
    impl VoiceSink for StubSink {
        async fn attach(
            &self,
            _guild_id: &str,
            _kind: StreamKind,
            _reader: Box<dyn tokio::io::AsyncRead + Unpin + Send>,
        ) -> Result<Arc<dyn PlaybackHandle>, Error> {
            self.attach_count.fetch_add(1, Ordering::SeqCst);
            let notify = Arc::new(tokio::sync::Notify::new());
            Ok(Arc::new(StubHandle {
                stopped: Arc::new(AtomicBool::new(false)),
                notify,
            }))
        }
    }

    struct StubProvider;

    #[async_trait]
    impl RadioProvider for StubProvider {
        async fn search_name(&self, _query: &str) -> Result<Vec<Track>, Error> {
            Ok(vec![])
        }
        async fn search_url(&self, _url: &str) -> Result<Vec<Track>, Error> {
            Ok(vec![])
        }
        async fn get_track_url(&self, track_id: &str) -> Result<Option<String>, Error> {
            Ok(Some(format!("https://cdn.example/{track_id}.opus")))
        }
        async fn get_recommendations(&self, seed_track_id: &str) -> Result<Vec<Track>, Error> {
            Ok(vec![Track {
                id: format!("rec-{seed_track_id}"),
                title: "Recommended".into(),
                artists: vec![Artist { name: "Someone".into() }],
                albums: vec![],
                duration_ms: 1000,
                cover_uri: None,
                source: TrackSource::Other,
                generation: true,
            }])
        }
    }

    fn track(id: &str) -> vox_core::QueuedTrack {
        vox_core::QueuedTrack {
            track_id: id.to_string(),
            added_at: 0,
            priority: false,
            info: Track::new(id, format!("Song {id}")),
            source: TrackSource::Other,
            requested_by: None,
        }
    }

    #[tokio::test]
    async fn idle_queue_with_wave_off_leaves_session_idle() {
        let queue = Arc::new(QueueStore::open_in_memory(&CacheConfig::default()).unwrap());
        let pipeline = Arc::new(PipelineBuilder::new(HttpConfig::default(), FfmpegConfig::default()).unwrap());
        let sink = Arc::new(StubSink { attach_count: AtomicUsize::new(0) });
        let provider: Arc<dyn RadioProvider> = Arc::new(StubProvider);

        let orchestrator = Orchestrator::new(queue, provider, pipeline, sink, Duration::from_secs(600));
        let result = orchestrator.play("guild-1", "chan-1").await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn set_volume_before_play_is_accepted() {
        let queue = Arc::new(QueueStore::open_in_memory(&CacheConfig::default()).unwrap());
        let pipeline = Arc::new(PipelineBuilder::new(HttpConfig::default(), FfmpegConfig::default()).unwrap());
        let sink = Arc::new(StubSink { attach_count: AtomicUsize::new(0) });
        let provider: Arc<dyn RadioProvider> = Arc::new(StubProvider);

        let orchestrator = Orchestrator::new(queue, provider, pipeline, sink, Duration::from_secs(600));
        assert!(orchestrator.set_volume("guild-2", "chan-2", 0.5).await.is_ok());
    }

    #[tokio::test]
    async fn seek_with_nothing_playing_errors() {
        let queue = Arc::new(QueueStore::open_in_memory(&CacheConfig::default()).unwrap());
        let pipeline = Arc::new(PipelineBuilder::new(HttpConfig::default(), FfmpegConfig::default()).unwrap());
        let sink = Arc::new(StubSink { attach_count: AtomicUsize::new(0) });
        let provider: Arc<dyn RadioProvider> = Arc::new(StubProvider);

        let orchestrator = Orchestrator::new(queue, provider, pipeline, sink, Duration::from_secs(600));
        assert!(orchestrator.seek("guild-6", "chan-6", 5000).await.is_err());
    }

    #[tokio::test]
    async fn dequeue_prefers_priority_over_regular() {
        let queue = Arc::new(QueueStore::open_in_memory(&CacheConfig::default()).unwrap());
        queue.set_track("chan-3", track("regular-1"), false).await.unwrap();
        let mut prio = track("priority-1");
        prio.priority = true;
        queue.set_track("chan-3", prio, true).await.unwrap();

        let popped = queue.get_priority_track("chan-3").await.unwrap().unwrap();
        assert_eq!(popped.track_id, "priority-1");
        let popped_regular = queue.get_track("chan-3").await.unwrap().unwrap();
        assert_eq!(popped_regular.track_id, "regular-1");
    }

    #[tokio::test]
    async fn stop_clears_queue_and_reports_stopped_state() {
        let queue = Arc::new(QueueStore::open_in_memory(&CacheConfig::default()).unwrap());
        queue.set_track("chan-4", track("a"), false).await.unwrap();
        let pipeline = Arc::new(PipelineBuilder::new(HttpConfig::default(), FfmpegConfig::default()).unwrap());
        let sink = Arc::new(StubSink { attach_count: AtomicUsize::new(0) });
        let provider: Arc<dyn RadioProvider> = Arc::new(StubProvider);

        let orchestrator = Orchestrator::new(queue.clone(), provider, pipeline, sink, Duration::from_secs(600));
        orchestrator.stop("guild-5", "chan-4").await.unwrap();
        assert_eq!(queue.count_music_tracks("chan-4", false).await.unwrap(), 0);
    }
}
