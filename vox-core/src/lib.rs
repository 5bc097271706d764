//! # VoxCore
//!
//! Shared data model and error taxonomy for the voice music streaming engine.
//!
//! This crate provides the foundational types used across the pipeline,
//! provider, queue, and session crates: `Track`, `QueuedTrack`, `Queue`,
//! history records, and the umbrella `Error` enum that every other crate's
//! error type converts into at its boundary.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a track originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackSource {
    Yandex,
    YouTube,
    Other,
}

impl fmt::Display for TrackSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TrackSource::Yandex => "yandex",
            TrackSource::YouTube => "youtube",
            TrackSource::Other => "other",
        };
        f.write_str(s)
    }
}

/// An artist credit on a track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artist {
    pub name: String,
}

/// An album credit on a track.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Album {
    pub title: Option<String>,
}

/// A single playable track, as returned by a provider adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    pub title: String,
    pub artists: Vec<Artist>,
    pub albums: Vec<Album>,
    pub duration_ms: u32,
    pub cover_uri: Option<String>,
    pub source: TrackSource,
    /// Set when this track was produced by radio/recommendation rather than
    /// directly requested by a user.
    pub generation: bool,
}

impl Track {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            artists: Vec::new(),
            albums: Vec::new(),
            duration_ms: 0,
            cover_uri: None,
            source: TrackSource::Other,
            generation: false,
        }
    }
}

/// A track sitting in a guild's queue, along with queue-local metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedTrack {
    pub track_id: String,
    /// Monotonic insertion timestamp in milliseconds, strictly increasing
    /// per (guild, priority) list.
    pub added_at: i64,
    pub priority: bool,
    pub info: Track,
    pub source: TrackSource,
    pub requested_by: Option<String>,
}

/// The full per-guild queue state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Queue {
    pub guild_id: String,
    pub channel_id: String,
    pub tracks: Vec<QueuedTrack>,
    pub priority_tracks: Vec<QueuedTrack>,
    pub last_track_id: Option<String>,
    pub wave_status: bool,
    pub r#loop: bool,
    pub volume: Option<u8>,
}

/// Per-seed rotor/station state for radio mode.
#[derive(Debug, Clone, Default)]
pub struct RadioSession {
    pub seed_track_id: String,
    pub session_id: Option<String>,
    pub batch_id: Option<String>,
    pub played_ids: std::collections::HashSet<String>,
    pub queued_ids: Vec<String>,
}

/// One play of a track, recorded globally regardless of who requested it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalHistoryEntry {
    pub track_id: String,
    pub info: Track,
    pub played_at: i64,
    pub play_count: u32,
}

/// One play of a track, recorded against the requesting user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserHistoryEntry {
    pub requested_by: String,
    pub track_id: String,
    pub info: Track,
    pub played_at: i64,
    pub play_count: u32,
}

/// Umbrella error taxonomy. Each crate defines its own narrower
/// `thiserror` enum and converts into this one at its public boundary;
/// `anyhow` is reserved for the application/binary layer where errors are
/// only ever displayed, never matched on.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("provider not initialized: {0}")]
    ProviderInit(String),

    #[error("resource not found: {0}")]
    ProviderNotFound(String),

    #[error("invalid provider data: {0}")]
    ProviderInvalidData(String),

    #[error("transient provider error: {0}")]
    ProviderTransient(String),

    #[error("fatal provider error: {0}")]
    ProviderFatal(String),

    #[error("too many redirects (limit {limit})")]
    HttpRedirectLimit { limit: u32 },

    #[error("http timeout after {0}ms")]
    HttpTimeout(u64),

    #[error("http io error: {0}")]
    HttpIo(String),

    #[error("pipeline failed: {0}")]
    PipelineFailed(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("queue conflict: {0}")]
    QueueConflict(String),

    #[error("internal invariant violated: {0}")]
    InvariantViolation(String),
}

impl Error {
    /// `true` for errors the provider adapter's retry loop should retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ProviderTransient(_) | Error::HttpTimeout(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// The surface a playback session needs from a music provider: URL
/// resolution and radio recommendations. `ProviderAdapter<A>` implements
/// this directly so the session/orchestrator layer can hold a trait object
/// instead of being generic over the concrete `ProviderApi`.
#[async_trait::async_trait]
pub trait RadioProvider: Send + Sync {
    async fn search_name(&self, query: &str) -> Result<Vec<Track>>;
    async fn search_url(&self, url: &str) -> Result<Vec<Track>>;
    async fn get_track_url(&self, track_id: &str) -> Result<Option<String>>;
    async fn get_recommendations(&self, seed_track_id: &str) -> Result<Vec<Track>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn track_new_defaults() {
        let t = Track::new("1", "Song");
        assert_eq!(t.id, "1");
        assert!(!t.generation);
        assert_eq!(t.source, TrackSource::Other);
    }

    #[test]
    fn retryable_classification() {
        assert!(Error::ProviderTransient("503".into()).is_retryable());
        assert!(!Error::ProviderFatal("404".into()).is_retryable());
    }

    #[test]
    fn track_serde_roundtrip() {
        let t = Track::new("7", "Title");
        let json = serde_json::to_string(&t).unwrap();
        let back: Track = serde_json::from_str(&json).unwrap();
        assert_eq!(t, back);
    }
}
