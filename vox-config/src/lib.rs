//! # VoxConfig
//!
//! Environment-variable configuration for the voice music streaming engine.
//!
//! Unlike a global-singleton configuration module, `VoxConfig::from_env()` is
//! called exactly once at startup and the resulting struct is passed down to
//! every component that needs it. There is no process-wide mutable
//! configuration state.
//!
//! Recognized variables all use the `VOXMUSIC_` prefix except the provider
//! credentials, which are named after the provider itself so they can be
//! shared with other tooling.

use std::env;
use std::time::Duration;

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => !matches!(v.to_ascii_lowercase().as_str(), "false" | "0" | "no"),
        Err(_) => default,
    }
}

/// Provider authentication and identity.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub user_id: Option<String>,
    pub user_name: Option<String>,
    pub user_password: Option<String>,
    pub use_cache: bool,
}

impl ProviderConfig {
    fn from_env() -> Self {
        Self {
            api_key: env_string("PROVIDER_API_KEY"),
            user_id: env_string("PROVIDER_USER_ID"),
            user_name: env_string("PROVIDER_USER_NAME"),
            user_password: env_string("PROVIDER_USER_PASSWORD"),
            use_cache: env_bool("USE_CACHE", true),
        }
    }
}

/// HTTP fetcher timeouts and retry policy.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub headers_timeout: Duration,
    pub body_timeout: Duration,
    pub stream_timeout: Duration,
    pub max_redirects: u32,
    pub max_retries: u32,
    pub base_retry_delay: Duration,
    pub max_retry_delay: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            headers_timeout: Duration::from_secs(15),
            body_timeout: Duration::from_secs(30),
            stream_timeout: Duration::from_secs(120),
            max_redirects: 5,
            max_retries: 3,
            base_retry_delay: Duration::from_millis(1000),
            max_retry_delay: Duration::from_millis(5000),
        }
    }
}

impl HttpConfig {
    fn from_env() -> Self {
        let d = Self::default();
        Self {
            headers_timeout: Duration::from_millis(env_parsed(
                "VOXMUSIC_HTTP_HEADERS_TIMEOUT_MS",
                d.headers_timeout.as_millis() as u64,
            )),
            body_timeout: Duration::from_millis(env_parsed(
                "VOXMUSIC_HTTP_BODY_TIMEOUT_MS",
                d.body_timeout.as_millis() as u64,
            )),
            stream_timeout: Duration::from_millis(env_parsed(
                "VOXMUSIC_HTTP_STREAM_TIMEOUT_MS",
                d.stream_timeout.as_millis() as u64,
            )),
            max_redirects: env_parsed("VOXMUSIC_HTTP_MAX_REDIRECTS", d.max_redirects),
            max_retries: env_parsed("VOXMUSIC_HTTP_MAX_RETRIES", d.max_retries),
            base_retry_delay: d.base_retry_delay,
            max_retry_delay: d.max_retry_delay,
        }
    }
}

/// FFmpeg child-process defaults.
#[derive(Debug, Clone)]
pub struct FfmpegConfig {
    pub ffmpeg_path: String,
    pub fail_fast: bool,
    pub timeout: Option<Duration>,
    pub max_stderr_buffer_bytes: usize,
    pub stderr_log: bool,
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            fail_fast: true,
            timeout: None,
            max_stderr_buffer_bytes: 1024 * 1024,
            stderr_log: false,
        }
    }
}

impl FfmpegConfig {
    fn from_env() -> Self {
        let d = Self::default();
        Self {
            ffmpeg_path: env_string("VOXMUSIC_FFMPEG_PATH").unwrap_or(d.ffmpeg_path),
            fail_fast: d.fail_fast,
            timeout: env::var("VOXMUSIC_FFMPEG_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|&v| v > 0)
                .map(Duration::from_millis),
            max_stderr_buffer_bytes: env_parsed(
                "VOXMUSIC_FFMPEG_MAX_STDERR_BYTES",
                d.max_stderr_buffer_bytes,
            ),
            stderr_log: env_bool("STDERR_LOG", d.stderr_log),
        }
    }
}

/// Provider/query cache shape.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_entries: u64,
    pub ttl: Duration,
    pub cleanup_interval: Duration,
    pub cleanup_threshold: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            ttl: Duration::from_secs(600),
            cleanup_interval: Duration::from_secs(120),
            cleanup_threshold: 800,
        }
    }
}

impl CacheConfig {
    fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_entries: env_parsed("VOXMUSIC_CACHE_MAX_ENTRIES", d.max_entries),
            ttl: Duration::from_secs(env_parsed(
                "VOXMUSIC_CACHE_TTL_SECS",
                d.ttl.as_secs(),
            )),
            cleanup_interval: d.cleanup_interval,
            cleanup_threshold: d.cleanup_threshold,
        }
    }
}

/// Per-guild session and queue behavior.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub session_idle: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            session_idle: Duration::from_secs(600),
        }
    }
}

impl QueueConfig {
    fn from_env() -> Self {
        let d = Self::default();
        Self {
            session_idle: Duration::from_secs(env_parsed(
                "VOXMUSIC_SESSION_IDLE_SECS",
                d.session_idle.as_secs(),
            )),
        }
    }
}

/// Top-level configuration, resolved once at startup and handed down to
/// every component by constructor injection.
#[derive(Debug, Clone)]
pub struct VoxConfig {
    pub provider: ProviderConfig,
    pub http: HttpConfig,
    pub ffmpeg: FfmpegConfig,
    pub cache: CacheConfig,
    pub queue: QueueConfig,
    pub log_level: String,
}

impl VoxConfig {
    pub fn from_env() -> Self {
        Self {
            provider: ProviderConfig::from_env(),
            http: HttpConfig::from_env(),
            ffmpeg: FfmpegConfig::from_env(),
            cache: CacheConfig::from_env(),
            queue: QueueConfig::from_env(),
            log_level: env_string("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let http = HttpConfig::default();
        assert_eq!(http.headers_timeout, Duration::from_secs(15));
        assert_eq!(http.body_timeout, Duration::from_secs(30));
        assert_eq!(http.stream_timeout, Duration::from_secs(120));
        assert_eq!(http.max_redirects, 5);

        let cache = CacheConfig::default();
        assert_eq!(cache.max_entries, 1000);
        assert_eq!(cache.ttl, Duration::from_secs(600));
        assert_eq!(cache.cleanup_threshold, 800);

        let queue = QueueConfig::default();
        assert_eq!(queue.session_idle, Duration::from_secs(600));

        let ffmpeg = FfmpegConfig::default();
        assert_eq!(ffmpeg.ffmpeg_path, "ffmpeg");
        assert!(ffmpeg.timeout.is_none());
    }

    #[test]
    fn env_bool_treats_unset_as_default_true() {
        env::remove_var("USE_CACHE_TEST_KEY");
        assert!(env_bool("USE_CACHE_TEST_KEY", true));
    }
}
