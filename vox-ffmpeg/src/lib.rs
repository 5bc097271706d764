//! # VoxFfmpeg
//!
//! Fluent FFmpeg child-process wrapper: argument builder, piped
//! stdin/stdout/stderr, progress parsing, and cooperative cancellation.
//!
//! The child-process lifecycle (spawn, pipe, `kill()` on drop/cancel,
//! ignoring broken-pipe noise from a disconnected consumer) follows the
//! pattern used to wrap a child reader for a streamed audio source; the
//! command-builder shape follows a typical fluent FFmpeg frontend.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use vox_config::FfmpegConfig;
use vox_core::Error;

/// Exit codes FFmpeg (or the platform) uses for what amounts to "the
/// downstream consumer hung up" rather than a real failure.
const CONSUMER_CLOSED_CODES: [i32; 3] = [152, 183, 255];

/// Substrings of I/O errors on the stdin pipe that indicate the consumer or
/// the process already went away, and should not be escalated once we're
/// terminating anyway.
const IGNORABLE_TERMINATION_SUBSTRINGS: [&str; 9] = [
    "broken pipe",
    "premature close",
    "stream premature close",
    "other side closed",
    "econnreset",
    "timeout",
    "aborted",
    "sigterm",
    "sigkill",
];

fn is_ignorable_termination_error(msg: &str) -> bool {
    let lower = msg.to_ascii_lowercase();
    IGNORABLE_TERMINATION_SUBSTRINGS.iter().any(|s| lower.contains(s))
}

/// Fluent argument builder. Mirrors the handful of options the pipeline
/// actually needs (inputs, outputs, filters, codecs) rather than the full
/// FFmpeg CLI surface.
#[derive(Debug, Clone, Default)]
pub struct FfmpegCommand {
    global_args: Vec<String>,
    input_options: Vec<String>,
    input: Option<String>,
    output_options: Vec<String>,
    output: Option<String>,
    audio_filters: Vec<String>,
}

impl FfmpegCommand {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn input(mut self, path_or_pipe: impl Into<String>) -> Self {
        self.input = Some(path_or_pipe.into());
        self
    }

    pub fn input_options(mut self, args: &[&str]) -> Self {
        self.input_options.extend(args.iter().map(|s| s.to_string()));
        self
    }

    pub fn output(mut self, path_or_pipe: impl Into<String>) -> Self {
        self.output = Some(path_or_pipe.into());
        self
    }

    pub fn output_options(mut self, args: &[&str]) -> Self {
        self.output_options.extend(args.iter().map(|s| s.to_string()));
        self
    }

    pub fn audio_codec(mut self, codec: impl Into<String>) -> Self {
        self.output_options.push("-c:a".to_string());
        self.output_options.push(codec.into());
        self
    }

    pub fn audio_bitrate(mut self, bitrate: impl Into<String>) -> Self {
        self.output_options.push("-b:a".to_string());
        self.output_options.push(bitrate.into());
        self
    }

    pub fn format(mut self, fmt: impl Into<String>) -> Self {
        self.output_options.push("-f".to_string());
        self.output_options.push(fmt.into());
        self
    }

    pub fn sample_rate(mut self, hz: u32) -> Self {
        self.output_options.push("-ar".to_string());
        self.output_options.push(hz.to_string());
        self
    }

    pub fn channels(mut self, n: u32) -> Self {
        self.output_options.push("-ac".to_string());
        self.output_options.push(n.to_string());
        self
    }

    pub fn no_video(mut self) -> Self {
        self.output_options.push("-vn".to_string());
        self
    }

    /// Seeks the input to `seconds` before decoding starts (`-ss` placed
    /// before `-i`, the accurate-but-slower input seek rather than the fast
    /// output seek).
    pub fn seek(mut self, seconds: f64) -> Self {
        self.input_options.push("-ss".to_string());
        self.input_options.push(format!("{seconds}"));
        self
    }

    /// Caps how much of the input is transcoded, measured from the seek
    /// point if one was set.
    pub fn duration(mut self, seconds: f64) -> Self {
        self.output_options.push("-t".to_string());
        self.output_options.push(format!("{seconds}"));
        self
    }

    pub fn audio_filter(mut self, filter: impl Into<String>) -> Self {
        self.audio_filters.push(filter.into());
        self
    }

    pub fn overwrite(mut self) -> Self {
        self.global_args.push("-y".to_string());
        self
    }

    fn build_args(&self, fail_fast: bool, enable_progress: bool) -> Vec<String> {
        let mut args = self.global_args.clone();
        if fail_fast {
            args.push("-xerror".to_string());
        }
        if enable_progress {
            args.push("-progress".to_string());
            args.push("pipe:2".to_string());
        }
        args.extend(self.input_options.clone());
        if let Some(input) = &self.input {
            args.push("-i".to_string());
            args.push(input.clone());
        }
        args.extend(self.output_options.clone());
        if !self.audio_filters.is_empty() {
            args.push("-af".to_string());
            args.push(self.audio_filters.join(","));
        }
        if let Some(output) = &self.output {
            args.push(output.clone());
        }
        args
    }
}

/// One parsed block of `-progress pipe:2` key=value output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Progress {
    pub frame: Option<u64>,
    pub fps: Option<f32>,
    pub bitrate: Option<String>,
    pub total_size: Option<u64>,
    pub out_time_us: Option<i64>,
    pub out_time: Option<String>,
    pub dup_frames: Option<u64>,
    pub drop_frames: Option<u64>,
    pub speed: Option<String>,
    pub progress: Option<String>,
}

impl Progress {
    fn apply_kv(&mut self, key: &str, value: &str) {
        match key {
            "frame" => self.frame = value.parse().ok(),
            "fps" => self.fps = value.parse().ok(),
            "bitrate" => self.bitrate = Some(value.to_string()),
            "total_size" => self.total_size = value.parse().ok(),
            "out_time_us" => self.out_time_us = value.parse().ok(),
            "out_time" => self.out_time = Some(value.to_string()),
            "dup_frames" => self.dup_frames = value.parse().ok(),
            "drop_frames" => self.drop_frames = value.parse().ok(),
            "speed" => self.speed = Some(value.to_string()),
            "progress" => self.progress = Some(value.to_string()),
            _ => {}
        }
    }
}

/// Parses arbitrary FFmpeg `-progress` text into discrete `Progress` blocks,
/// each terminated by a `progress=continue|end` line. Built incrementally so
/// it tolerates input split across arbitrary chunk boundaries.
#[derive(Default)]
struct ProgressParser {
    current: Progress,
    line_remainder: String,
}

impl ProgressParser {
    fn feed(&mut self, chunk: &str) -> Vec<Progress> {
        self.line_remainder.push_str(chunk);
        let mut completed = Vec::new();
        loop {
            let Some(pos) = self.line_remainder.find('\n') else {
                break;
            };
            let line: String = self.line_remainder.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some((k, v)) = line.split_once('=') {
                self.current.apply_kv(k.trim(), v.trim());
                if k.trim() == "progress" {
                    completed.push(std::mem::take(&mut self.current));
                }
            }
        }
        completed
    }
}

/// Bounded accumulator used for both the failure-snippet stderr tail and the
/// progress parser's raw input; oldest bytes are dropped once the configured
/// cap is exceeded so a runaway process cannot grow memory unbounded.
struct BoundedBuffer {
    buf: VecDeque<u8>,
    cap: usize,
}

impl BoundedBuffer {
    fn new(cap: usize) -> Self {
        Self { buf: VecDeque::with_capacity(cap.min(4096)), cap }
    }

    fn push(&mut self, bytes: &[u8]) {
        self.buf.extend(bytes.iter().copied());
        while self.buf.len() > self.cap {
            self.buf.pop_front();
        }
    }

    fn tail_as_string(&self, max_bytes: usize) -> String {
        let start = self.buf.len().saturating_sub(max_bytes);
        let slice: Vec<u8> = self.buf.iter().skip(start).copied().collect();
        String::from_utf8_lossy(&slice).replace('\n', " ")
    }
}

/// Outcome of a completed FFmpeg run.
#[derive(Debug, Clone, PartialEq)]
pub enum FfmpegOutcome {
    Success,
    Terminated,
}

/// A spawned FFmpeg child: piped stdio plus channels for progress and
/// completion. `stdin`/`stdout` are taken out for the caller to drive
/// directly (feeding HTTP bytes in, reading PCM out).
pub struct FfmpegHandle {
    pub stdin: Option<ChildStdin>,
    pub stdout: Option<ChildStdout>,
    pub progress_rx: mpsc::UnboundedReceiver<Progress>,
    done_rx: oneshot::Receiver<Result<FfmpegOutcome, Error>>,
    cancel: CancellationToken,
}

impl FfmpegHandle {
    /// Requests termination. Idempotent; safe to call more than once.
    pub fn kill(&self) {
        self.cancel.cancel();
    }

    /// Awaits process completion, returning the classified outcome or the
    /// first failure.
    pub async fn wait(self) -> Result<FfmpegOutcome, Error> {
        self.done_rx
            .await
            .unwrap_or(Err(Error::InvariantViolation("ffmpeg wait channel dropped".into())))
    }

    /// Writes `data` to the process's stdin, suppressing the class of
    /// broken-pipe style errors that are expected once the process is
    /// terminating or the downstream consumer has already closed.
    pub async fn write_stdin(&mut self, data: &[u8]) -> Result<(), Error> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Ok(());
        };
        match stdin.write_all(data).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let msg = e.to_string();
                if self.cancel.is_cancelled() || is_ignorable_termination_error(&msg) {
                    debug!(error = %msg, "ignoring stdin write error during termination");
                    Ok(())
                } else {
                    Err(Error::PipelineFailed(format!("stdin write failed: {msg}")))
                }
            }
        }
    }

    pub fn close_stdin(&mut self) {
        self.stdin.take();
    }
}

/// Spawns and manages a single FFmpeg child process. Each instance may be
/// run exactly once; a second `run()` call fails.
pub struct FfmpegRunner {
    config: FfmpegConfig,
    command: FfmpegCommand,
    enable_progress: bool,
    spawned: AtomicBool,
}

impl FfmpegRunner {
    pub fn new(config: FfmpegConfig, command: FfmpegCommand) -> Self {
        Self {
            config,
            command,
            enable_progress: true,
            spawned: AtomicBool::new(false),
        }
    }

    pub fn enable_progress(mut self, on: bool) -> Self {
        self.enable_progress = on;
        self
    }

    pub fn run(&self) -> Result<FfmpegHandle, Error> {
        if self.spawned.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            return Err(Error::InvariantViolation("ffmpeg runner already spawned".into()));
        }

        let args = self.command.build_args(self.config.fail_fast, self.enable_progress);
        debug!(?args, path = %self.config.ffmpeg_path, "spawning ffmpeg");

        let mut cmd = Command::new(&self.config.ffmpeg_path);
        cmd.args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child: Child = cmd
            .spawn()
            .map_err(|e| Error::PipelineFailed(format!("failed to spawn ffmpeg: {e}")))?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();
        let cancel = CancellationToken::new();

        let max_stderr = self.config.max_stderr_buffer_bytes;
        let stderr_log = self.config.stderr_log;
        let timeout = self.config.timeout;
        let cancel_for_task = cancel.clone();

        tokio::spawn(async move {
            let stderr_tail = Arc::new(tokio::sync::Mutex::new(BoundedBuffer::new(max_stderr)));
            let stderr_tail_reader = stderr_tail.clone();

            let stderr_task = tokio::spawn(async move {
                if let Some(stderr) = stderr {
                    let mut reader = BufReader::new(stderr);
                    let mut parser = ProgressParser::default();
                    let mut line = String::new();
                    loop {
                        line.clear();
                        match reader.read_line(&mut line).await {
                            Ok(0) => break,
                            Ok(_) => {
                                if stderr_log {
                                    debug!(line = %line.trim_end(), "ffmpeg stderr");
                                }
                                stderr_tail_reader.lock().await.push(line.as_bytes());
                                for progress in parser.feed(&line) {
                                    let _ = progress_tx.send(progress);
                                }
                            }
                            Err(_) => break,
                        }
                    }
                }
            });

            let wait_result = if let Some(d) = timeout {
                tokio::select! {
                    _ = cancel_for_task.cancelled() => {
                        let _ = child.start_kill();
                        child.wait().await
                    }
                    _ = tokio::time::sleep(d) => {
                        warn!("ffmpeg timed out, terminating");
                        let _ = child.start_kill();
                        child.wait().await
                    }
                    status = child.wait() => status,
                }
            } else {
                tokio::select! {
                    _ = cancel_for_task.cancelled() => {
                        let _ = child.start_kill();
                        child.wait().await
                    }
                    status = child.wait() => status,
                }
            };

            let _ = stderr_task.await;
            let is_terminating = cancel_for_task.is_cancelled();

            let outcome = match wait_result {
                Ok(status) if status.success() => Ok(FfmpegOutcome::Success),
                Ok(status) => {
                    let code = status.code();
                    if is_terminating {
                        Ok(FfmpegOutcome::Terminated)
                    } else if code.map(|c| CONSUMER_CLOSED_CODES.contains(&c)).unwrap_or(false) {
                        Ok(FfmpegOutcome::Success)
                    } else {
                        let snippet = stderr_tail.lock().await.tail_as_string(2000);
                        Err(Error::PipelineFailed(format!(
                            "ffmpeg exited with code {:?}, stderr: {snippet}",
                            code
                        )))
                    }
                }
                Err(e) => {
                    if is_terminating {
                        Ok(FfmpegOutcome::Terminated)
                    } else {
                        Err(Error::PipelineFailed(format!("failed to wait on ffmpeg: {e}")))
                    }
                }
            };

            let _ = done_tx.send(outcome);
        });

        Ok(FfmpegHandle {
            stdin,
            stdout,
            progress_rx,
            done_rx,
            cancel,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_produces_expected_args() {
        let cmd = FfmpegCommand::new()
            .input("pipe:0")
            .no_video()
            .audio_codec("pcm_s16le")
            .format("s16le")
            .sample_rate(48000)
            .channels(2)
            .audio_filter("volume=1")
            .output("pipe:1");
        let args = cmd.build_args(true, true);
        assert!(args.contains(&"-xerror".to_string()));
        assert!(args.contains(&"-i".to_string()));
        assert!(args.contains(&"pipe:0".to_string()));
        assert!(args.contains(&"-af".to_string()));
        assert!(args.contains(&"volume=1".to_string()));
        assert_eq!(args.last(), Some(&"pipe:1".to_string()));
    }

    #[test]
    fn seek_places_ss_before_input() {
        let cmd = FfmpegCommand::new().input("pipe:0").seek(12.5).duration(30.0).output("pipe:1");
        let args = cmd.build_args(false, false);
        let ss_pos = args.iter().position(|a| a == "-ss").unwrap();
        let i_pos = args.iter().position(|a| a == "-i").unwrap();
        assert!(ss_pos < i_pos);
        assert_eq!(args[ss_pos + 1], "12.5");
        assert!(args.contains(&"-t".to_string()));
        assert!(args.contains(&"30".to_string()));
    }

    #[test]
    fn progress_parser_handles_split_chunks() {
        let mut parser = ProgressParser::default();
        let full = "frame=10\nfps=24.5\nout_time=00:00:01.0\nprogress=continue\n";
        let (first, second) = full.split_at(20);
        let mut out = parser.feed(first);
        out.extend(parser.feed(second));
        assert_eq!(out.len(), 1);
        let p = &out[0];
        assert_eq!(p.frame, Some(10));
        assert_eq!(p.fps, Some(24.5));
        assert_eq!(p.out_time.as_deref(), Some("00:00:01.0"));
        assert_eq!(p.progress.as_deref(), Some("continue"));
    }

    #[test]
    fn bounded_buffer_drops_oldest() {
        let mut buf = BoundedBuffer::new(4);
        buf.push(b"abcdef");
        assert_eq!(buf.tail_as_string(10), "cdef");
    }

    #[test]
    fn ignorable_termination_errors_recognized() {
        assert!(is_ignorable_termination_error("Broken pipe (os error 32)"));
        assert!(is_ignorable_termination_error("stream premature close"));
        assert!(!is_ignorable_termination_error("permission denied"));
    }

    #[tokio::test]
    async fn second_run_on_same_instance_fails() {
        let config = FfmpegConfig {
            ffmpeg_path: "/bin/echo".to_string(),
            ..FfmpegConfig::default()
        };
        let runner = FfmpegRunner::new(config, FfmpegCommand::new());
        let first = runner.run();
        // First call may fail to spawn `/bin/echo` meaningfully as ffmpeg,
        // but the spawn guard must still flip regardless of downstream
        // success, so the second call is rejected before ever touching the
        // process table.
        let _ = first;
        let second = runner.run();
        assert!(second.is_err());
    }
}
