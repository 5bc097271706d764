//! Composition root for the voice music streaming engine.
//!
//! Wires configuration, storage, the streaming pipeline, the provider
//! adapter, and the per-guild orchestrator together, the same phased-startup
//! shape the original media server binary uses: infrastructure first,
//! business wiring second, then start serving and wait for a shutdown
//! signal.
//!
//! The provider's concrete wire client and the voice gateway are external
//! collaborators (see the scope notes in `SPEC_FULL.md` / `DESIGN.md`); this
//! binary wires placeholder implementations of both so the engine starts
//! and the orchestrator's plumbing is exercised end-to-end, while a real
//! deployment swaps them for a provider HTTP client and a voice gateway
//! connection.

use anyhow::Context;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;
use vox_config::VoxConfig;
use vox_core::{Error, RadioProvider};
use vox_pipeline::{PipelineBuilder, StreamKind};
use vox_provider::{ProviderAdapter, ProviderApi, RawTrack, RotorBatch, RotorSession};
use vox_queue::QueueStore;
use vox_session::{Orchestrator, PlaybackHandle, VoiceSink};

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Stands in for a real provider HTTP client until one is wired in. Every
/// call fails with `ProviderInit` so the gap is visible rather than silent.
struct UnwiredProviderApi;

#[async_trait]
impl ProviderApi for UnwiredProviderApi {
    async fn authenticate(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn search_tracks(&self, _query: &str) -> Result<Vec<RawTrack>, Error> {
        Err(Error::ProviderInit("no provider client configured".into()))
    }

    async fn get_track(&self, _id: &str) -> Result<RawTrack, Error> {
        Err(Error::ProviderInit("no provider client configured".into()))
    }

    async fn get_album_tracks(&self, _album_id: &str) -> Result<Vec<RawTrack>, Error> {
        Err(Error::ProviderInit("no provider client configured".into()))
    }

    async fn get_playlist_tracks(&self, _playlist_id: &str, _user: Option<&str>) -> Result<Vec<RawTrack>, Error> {
        Err(Error::ProviderInit("no provider client configured".into()))
    }

    async fn get_similar_tracks(&self, _track_id: &str) -> Result<Vec<RawTrack>, Error> {
        Err(Error::ProviderInit("no provider client configured".into()))
    }

    async fn create_rotor_session(&self, _seed_track_id: &str) -> Result<RotorSession, Error> {
        Err(Error::ProviderInit("no provider client configured".into()))
    }

    async fn post_rotor_session_tracks(
        &self,
        _session_id: &str,
        _batch_id: &str,
        _queue: &[String],
    ) -> Result<RotorBatch, Error> {
        Err(Error::ProviderInit("no provider client configured".into()))
    }

    async fn get_track_url(&self, _track_id: &str) -> Result<Option<String>, Error> {
        Err(Error::ProviderInit("no provider client configured".into()))
    }
}

struct DrainHandle {
    cancel: CancellationToken,
    notify: Arc<Notify>,
}

impl PlaybackHandle for DrainHandle {
    fn stop(&self) {
        self.cancel.cancel();
    }

    fn done(&self) -> BoxFuture<'static, ()> {
        let notify = self.notify.clone();
        Box::pin(async move {
            notify.notified().await;
        })
    }
}

/// Stands in for a real voice gateway connection: drains the stream to EOF
/// and reports done, so a session can run end-to-end without a Discord (or
/// other) voice client attached.
struct LoggingVoiceSink;

#[async_trait]
impl VoiceSink for LoggingVoiceSink {
    async fn attach(
        &self,
        guild_id: &str,
        kind: StreamKind,
        mut reader: Box<dyn AsyncRead + Unpin + Send>,
    ) -> Result<Arc<dyn PlaybackHandle>, Error> {
        info!(guild_id, ?kind, "attaching stream (no voice gateway wired, draining to EOF)");
        let cancel = CancellationToken::new();
        let notify = Arc::new(Notify::new());
        let task_cancel = cancel.clone();
        let task_notify = notify.clone();

        tokio::spawn(async move {
            let mut buf = [0u8; 8192];
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    n = reader.read(&mut buf) => match n {
                        Ok(0) | Err(_) => break,
                        Ok(_) => continue,
                    },
                }
            }
            task_notify.notify_waiters();
        });

        Ok(Arc::new(DrainHandle { cancel, notify }))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = VoxConfig::from_env();
    init_tracing(&config.log_level);

    info!("phase 1: configuration loaded");
    info!(
        ffmpeg_path = %config.ffmpeg.ffmpeg_path,
        cache_max_entries = config.cache.max_entries,
        session_idle_secs = config.queue.session_idle.as_secs(),
        "effective configuration"
    );

    info!("phase 2: opening queue storage");
    let db_path = std::env::var("VOXMUSIC_DB_PATH").unwrap_or_else(|_| "voxmusic.sqlite3".to_string());
    let queue = Arc::new(
        QueueStore::open(Path::new(&db_path), &config.cache).context("failed to open queue store")?,
    );

    info!("phase 3: building streaming pipeline and provider adapter");
    let pipeline = Arc::new(PipelineBuilder::new(config.http.clone(), config.ffmpeg.clone())?);
    let provider: Arc<dyn RadioProvider> = Arc::new(ProviderAdapter::new(
        UnwiredProviderApi,
        "music.example",
        &config.cache,
        config.provider.use_cache,
    ));

    info!("phase 4: starting orchestrator");
    let sink: Arc<dyn VoiceSink> = Arc::new(LoggingVoiceSink);
    let orchestrator = Orchestrator::new(queue, provider, pipeline, sink, config.queue.session_idle);
    let sweep = tokio::spawn(orchestrator.clone().run_idle_sweep());

    info!("voxmusic engine ready, waiting for shutdown signal");
    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;

    info!("shutdown signal received, stopping");
    sweep.abort();
    Ok(())
}
