//! # VoxPipeline
//!
//! Assembles the fetch → (optional transcode) → DSP chain that turns a
//! provider-resolved URL into the stream shape the voice sink expects.
//! Passthrough detection and chunked decode-then-forward follow the HTTP
//! source node's approach of deciding format up front and streaming
//! incrementally rather than buffering the whole track.

pub mod format;

use bytes::Bytes;
use futures::StreamExt;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use vox_config::{FfmpegConfig, HttpConfig};
use vox_core::Error;
use vox_dsp::{AudioProcessor, AudioProcessorHandle};
use vox_ffmpeg::{FfmpegCommand, FfmpegRunner};
use vox_http::HttpFetcher;

pub use format::AudioFormat;

/// The wire shape the voice sink receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Signed 16-bit little-endian stereo PCM at 48 kHz.
    RawPcm,
    OggOpus,
    WebmOpus,
}

/// Initial DSP settings applied when building a pipeline; mutable
/// afterward via the returned `AudioProcessorHandle`.
#[derive(Debug, Clone)]
pub struct DspOptions {
    pub volume: f32,
    pub bass: f32,
    pub treble: f32,
    pub compressor: bool,
    pub low_pass_frequency: Option<f32>,
}

impl Default for DspOptions {
    fn default() -> Self {
        Self {
            volume: 1.0,
            bass: vox_dsp::BASS_NEUTRAL,
            treble: vox_dsp::TREBLE_NEUTRAL,
            compressor: false,
            low_pass_frequency: None,
        }
    }
}

/// A byte stream ready to hand to the voice sink, plus the controls needed
/// to steer it (cancellation, and — for `RawPcm` — live DSP parameters).
pub struct BuiltPipeline {
    pub kind: StreamKind,
    pub reader: Box<dyn tokio::io::AsyncRead + Unpin + Send>,
    pub cancel: CancellationToken,
    /// `Some` only for `RawPcm`; passthrough kinds have no DSP stage.
    pub dsp: Option<AudioProcessorHandle>,
}

/// Builds playback pipelines: HTTP fetch, format detection, optional
/// FFmpeg transcode, optional DSP.
pub struct PipelineBuilder {
    fetcher: HttpFetcher,
    ffmpeg_config: FfmpegConfig,
}

impl PipelineBuilder {
    pub fn new(http_config: HttpConfig, ffmpeg_config: FfmpegConfig) -> Result<Self, Error> {
        Ok(Self {
            fetcher: HttpFetcher::new(http_config)?,
            ffmpeg_config,
        })
    }

    /// Resolves `url` into a stream for the voice sink. Opus-in-Ogg and
    /// Opus-in-WebM are passed through untouched; everything else is piped
    /// through FFmpeg to 48 kHz stereo s16le PCM and then through the DSP
    /// transform. Equivalent to `build_for_voice_at(url, opts, None)`.
    pub async fn build_for_voice(&self, url: &str, opts: DspOptions) -> Result<BuiltPipeline, Error> {
        self.build_for_voice_at(url, opts, None).await
    }

    /// Like `build_for_voice`, but starts playback `seek_seconds` into the
    /// track. A seek always forces a transcode: passthrough streaming has no
    /// way to resume mid-stream without refetching at a byte offset, so a
    /// seek request bypasses Opus/WebM passthrough even when the source
    /// format would otherwise qualify.
    pub async fn build_for_voice_at(
        &self,
        url: &str,
        opts: DspOptions,
        seek_seconds: Option<f64>,
    ) -> Result<BuiltPipeline, Error> {
        let (headers, body) = self.fetcher.fetch_with_retry(url).await?;
        let format = format::detect(headers.content_type.as_deref(), url);
        let cancel = CancellationToken::new();

        if seek_seconds.is_none() {
            match format {
                AudioFormat::Opus | AudioFormat::Ogg => {
                    debug!(url, "passthrough ogg/opus stream");
                    let reader = StreamReader::new(body.map(|r| r.map_err(std::io::Error::other)));
                    return Ok(BuiltPipeline {
                        kind: StreamKind::OggOpus,
                        reader: Box::new(reader),
                        cancel,
                        dsp: None,
                    });
                }
                AudioFormat::WebM => {
                    debug!(url, "passthrough webm/opus stream");
                    let reader = StreamReader::new(body.map(|r| r.map_err(std::io::Error::other)));
                    return Ok(BuiltPipeline {
                        kind: StreamKind::WebmOpus,
                        reader: Box::new(reader),
                        cancel,
                        dsp: None,
                    });
                }
                _ => {}
            }
        }
        self.build_transcoded(body, opts, cancel, seek_seconds).await
    }

    async fn build_transcoded(
        &self,
        body: impl futures::Stream<Item = Result<Bytes, Error>> + Send + Unpin + 'static,
        opts: DspOptions,
        cancel: CancellationToken,
        seek_seconds: Option<f64>,
    ) -> Result<BuiltPipeline, Error> {
        // Gain lives entirely in the DSP stage (AudioProcessor::set_volume
        // below); an `-af volume=` filter here would double-apply it.
        let mut filters = Vec::new();
        if let Some(freq) = opts.low_pass_frequency {
            filters.push(format!("lowpass=f={freq}"));
        }

        let mut command = FfmpegCommand::new()
            .input("pipe:0")
            .no_video()
            .audio_codec("pcm_s16le")
            .format("s16le")
            .sample_rate(48_000)
            .channels(2)
            .output("pipe:1");
        if let Some(seconds) = seek_seconds {
            command = command.seek(seconds);
        }
        for filter in &filters {
            command = command.audio_filter(filter.clone());
        }

        let runner = FfmpegRunner::new(self.ffmpeg_config.clone(), command);
        let mut handle = runner.run()?;
        let stdout = handle
            .stdout
            .take()
            .ok_or_else(|| Error::PipelineFailed("ffmpeg stdout not piped".into()))?;

        let feed_cancel = cancel.clone();
        let mut body = body;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = feed_cancel.cancelled() => break,
                    chunk = body.next() => {
                        match chunk {
                            Some(Ok(bytes)) => {
                                if handle.write_stdin(&bytes).await.is_err() {
                                    break;
                                }
                            }
                            Some(Err(e)) => {
                                warn!(error = %e, "http source errored while feeding ffmpeg");
                                break;
                            }
                            None => break,
                        }
                    }
                }
            }
            handle.close_stdin();
            if let Err(e) = handle.wait().await {
                if !feed_cancel.is_cancelled() {
                    warn!(error = %e, "ffmpeg transcode failed");
                }
            }
        });

        let processor = AudioProcessor::new();
        let dsp_handle = processor.handle();
        dsp_handle.set_volume(opts.volume);
        dsp_handle.set_equalizer(opts.bass, opts.treble, opts.compressor);

        let dsp_cancel = cancel.clone();
        let rx = spawn_dsp_stage(stdout, processor, dsp_cancel);
        let reader = StreamReader::new(ReceiverStream::new(rx));

        Ok(BuiltPipeline {
            kind: StreamKind::RawPcm,
            reader: Box::new(reader),
            cancel,
            dsp: Some(dsp_handle),
        })
    }
}

const CHUNK_FRAMES: usize = 2048;
const FRAME_BYTES: usize = 4;

/// Reads raw PCM from `stdout`, runs it through `processor` frame-aligned,
/// and republishes it on a channel so the caller can wrap it back into an
/// `AsyncRead` via `StreamReader` — the same decode-then-forward shape the
/// HTTP source node uses for its subscriber fan-out, collapsed to a single
/// consumer here since exactly one voice sink attaches per track.
fn spawn_dsp_stage(
    mut stdout: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    mut processor: AudioProcessor,
    cancel: CancellationToken,
) -> mpsc::Receiver<Result<Bytes, std::io::Error>> {
    let (tx, rx) = mpsc::channel(8);
    tokio::spawn(async move {
        let mut leftover: Vec<u8> = Vec::new();
        let mut read_buf = vec![0u8; CHUNK_FRAMES * FRAME_BYTES];
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let n = tokio::select! {
                _ = cancel.cancelled() => break,
                n = stdout.read(&mut read_buf) => match n {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                },
            };

            leftover.extend_from_slice(&read_buf[..n]);
            let usable = (leftover.len() / FRAME_BYTES) * FRAME_BYTES;
            if usable == 0 {
                continue;
            }
            let mut frame_data: Vec<u8> = leftover.drain(..usable).collect();
            processor.process(&mut frame_data);
            if tx.send(Ok(Bytes::from(frame_data))).await.is_err() {
                break;
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn opus_passthrough_skips_ffmpeg() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/track.opus"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "audio/ogg; codecs=opus")
                    .set_body_bytes(b"OggS-fake-opus-bytes".to_vec()),
            )
            .mount(&server)
            .await;

        let builder = PipelineBuilder::new(HttpConfig::default(), FfmpegConfig::default()).unwrap();
        let built = builder
            .build_for_voice(&format!("{}/track.opus", server.uri()), DspOptions::default())
            .await
            .unwrap();

        assert_eq!(built.kind, StreamKind::OggOpus);
        assert!(built.dsp.is_none());

        let mut reader = built.reader;
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"OggS-fake-opus-bytes");
    }
}
