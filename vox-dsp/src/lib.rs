//! # VoxDsp
//!
//! Real-time DSP transform for interleaved stereo signed 16-bit
//! little-endian PCM at 48 kHz: volume ramping, a bass shelf/limiter chain,
//! a treble shelf, a compressor, and time-based fades.
//!
//! Structured the way the pipeline's per-sample nodes are structured
//! (small struct holding gain/state, a `process` entry point that mutates a
//! buffer in place) but expressed as a single synchronous transform rather
//! than a channel-driven node, since the math here has no `.await` points
//! and the pipeline crate drives it on whatever task owns the FFmpeg
//! stdout reader.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const BASS_MIN: f32 = 0.0;
pub const BASS_MAX: f32 = 2.0;
pub const BASS_NEUTRAL: f32 = 1.0;
pub const TREBLE_MIN: f32 = 0.0;
pub const TREBLE_MAX: f32 = 2.0;
pub const TREBLE_NEUTRAL: f32 = 1.0;

const SAMPLE_RATE: f32 = 48_000.0;
const TWO_PI: f32 = std::f32::consts::TAU;

fn sign(x: f32) -> f32 {
    if x >= 0.0 {
        1.0
    } else {
        -1.0
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct BassChannelState {
    s60: f32,
    s120: f32,
    s_lp: f32,
}

#[derive(Debug, Clone, Copy, Default)]
struct TrebleChannelState {
    lp: f32,
}

#[derive(Debug, Clone, Copy, Default)]
struct ChannelState {
    bass: BassChannelState,
    treble: TrebleChannelState,
}

#[derive(Debug, Clone, Copy)]
struct FadeState {
    start_volume: f32,
    target_volume: f32,
    started_at: Instant,
    duration: Duration,
}

/// Mutable DSP parameters, guarded by a lock so setters can be called from
/// another thread than the one driving `process`.
#[derive(Debug, Clone)]
struct Params {
    /// Volume at the end of the previous buffer; the start point of this
    /// buffer's per-frame interpolation.
    prev_volume: f32,
    /// Target volume for the current buffer.
    volume: f32,
    bass: f32,
    treble: f32,
    compressor: bool,
    normalize: bool,
    low_pass_frequency: Option<f32>,
    fade: Option<FadeState>,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            prev_volume: 1.0,
            volume: 1.0,
            bass: BASS_NEUTRAL,
            treble: TREBLE_NEUTRAL,
            compressor: false,
            normalize: false,
            low_pass_frequency: None,
            fade: None,
        }
    }
}

/// A snapshot of parameters resolved for exactly one buffer's worth of
/// processing, so the hot loop never re-acquires the lock mid-buffer.
struct ResolvedParams {
    prev_volume: f32,
    curr_volume: f32,
    bass: f32,
    treble: f32,
    compressor: bool,
    fade_complete: bool,
}

/// Streaming audio transform. Construct once per track; `process` mutates
/// buffers in place as they flow from the FFmpeg/HTTP source to the voice
/// sink.
pub struct AudioProcessor {
    params: Arc<Mutex<Params>>,
    left: ChannelState,
    right: ChannelState,
}

impl Default for AudioProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioProcessor {
    pub fn new() -> Self {
        Self {
            params: Arc::new(Mutex::new(Params::default())),
            left: ChannelState::default(),
            right: ChannelState::default(),
        }
    }

    /// A cheap, cloneable handle for setters to be called from another
    /// task/thread without sharing the processor itself (which owns the
    /// non-`Send`-across-calls filter state used only by `process`).
    pub fn handle(&self) -> AudioProcessorHandle {
        AudioProcessorHandle {
            params: self.params.clone(),
        }
    }

    pub fn set_volume(&self, volume: f32) {
        self.handle().set_volume(volume);
    }

    pub fn start_fade(&self, target: f32, duration_ms: u64) {
        self.handle().start_fade(target, duration_ms);
    }

    pub fn set_equalizer(&self, bass: f32, treble: f32, compressor: bool) {
        self.handle().set_equalizer(bass, treble, compressor);
    }

    pub fn set_compressor(&self, on: bool) {
        self.handle().set_compressor(on);
    }

    pub fn set_low_pass_frequency(&self, freq: Option<f32>) {
        self.handle().set_low_pass_frequency(freq);
    }

    fn resolve_params(&self) -> ResolvedParams {
        let mut guard = self.params.lock().expect("dsp params mutex poisoned");
        let mut fade_complete = false;
        if let Some(fade) = guard.fade {
            let elapsed = fade.started_at.elapsed().as_secs_f32() * 1000.0;
            let progress = (elapsed / fade.duration.as_millis().max(1) as f32).clamp(0.0, 1.0);
            guard.volume = fade.start_volume + (fade.target_volume - fade.start_volume) * progress;
            if progress >= 1.0 {
                fade_complete = true;
            }
        }
        let resolved = ResolvedParams {
            prev_volume: guard.prev_volume,
            curr_volume: guard.volume,
            bass: guard.bass,
            treble: guard.treble,
            compressor: guard.compressor,
            fade_complete,
        };
        guard.prev_volume = guard.volume;
        if fade_complete {
            guard.fade = None;
        }
        resolved
    }

    /// Processes `data` in place, interpreted/produced as interleaved
    /// stereo signed 16-bit little-endian PCM. Trailing bytes that don't
    /// complete a full stereo frame are left untouched at the buffer's end
    /// boundary (callers should size buffers to whole frames).
    pub fn process(&mut self, data: &mut [u8]) {
        let frame_bytes = 4;
        let frame_count = data.len() / frame_bytes;
        if frame_count == 0 {
            return;
        }
        let p = self.resolve_params();

        let bass_norm = 2.0 * (p.bass - BASS_MIN) / (BASS_MAX - BASS_MIN) - 1.0;
        let bass_active = bass_norm.abs() > 1e-3;
        let treble_norm = 2.0 * (p.treble - TREBLE_MIN) / (TREBLE_MAX - TREBLE_MIN) - 1.0;
        let treble_active = treble_norm.abs() > 1e-3;

        let (f_lp, q, g60, g120, limiter_active) = if bass_active {
            let bass_db = sign(bass_norm) * bass_norm.abs().sqrt() * 18.0;
            let f_lp = if bass_db >= 0.0 {
                4000.0 - (bass_db / 18.0) * 110.0
            } else {
                4000.0 + (bass_db.abs() / 18.0) * 1000.0
            };
            let q = if bass_db >= 0.0 {
                0.7 + (bass_db / 18.0) * 1.8
            } else {
                0.7 - (bass_db.abs() / 18.0) * 0.4
            };
            let g60 = 10f32.powf((sign(bass_norm) * (0.7 * bass_norm).abs().sqrt() * 18.0) / 20.0);
            let g120 = 10f32.powf((sign(bass_norm) * (0.5 * bass_norm).abs().sqrt() * 18.0) / 20.0);
            (f_lp, q, g60, g120, bass_db.abs() > 6.0)
        } else {
            (4000.0, 0.7, 1.0, 1.0, false)
        };

        let g_tr = if treble_active {
            10f32.powf((sign(treble_norm) * treble_norm.abs().sqrt() * 12.0) / 20.0)
        } else {
            1.0
        };

        let alpha60 = TWO_PI * 60.0 / SAMPLE_RATE;
        let alpha120 = TWO_PI * 120.0 / SAMPLE_RATE;
        let alpha_lp = TWO_PI * f_lp / SAMPLE_RATE;
        let qi = (0.5 * q).min(0.95);
        let alpha_tr = TWO_PI * 4000.0 / SAMPLE_RATE;

        for i in 0..frame_count {
            let base = i * frame_bytes;
            let l_raw = i16::from_le_bytes([data[base], data[base + 1]]);
            let r_raw = i16::from_le_bytes([data[base + 2], data[base + 3]]);

            let vol = if frame_count > 1 {
                p.prev_volume + (p.curr_volume - p.prev_volume) * (i as f32 / (frame_count - 1) as f32)
            } else {
                p.curr_volume
            };

            let mut l = (l_raw as f32 / 32768.0) * vol;
            let mut r = (r_raw as f32 / 32768.0) * vol;

            if bass_active {
                l = Self::apply_bass(l, &mut self.left.bass, alpha60, alpha120, alpha_lp, qi, q, g60, g120, limiter_active);
                r = Self::apply_bass(r, &mut self.right.bass, alpha60, alpha120, alpha_lp, qi, q, g60, g120, limiter_active);
            }

            if treble_active {
                l = Self::apply_treble(l, &mut self.left.treble, alpha_tr, g_tr);
                r = Self::apply_treble(r, &mut self.right.treble, alpha_tr, g_tr);
            }

            if p.compressor {
                l = Self::apply_compressor(l);
                r = Self::apply_compressor(r);
            }

            l = l.clamp(-1.0, 1.0);
            r = r.clamp(-1.0, 1.0);

            let l_i16 = (l * 32767.0).round().clamp(-32768.0, 32767.0) as i16;
            let r_i16 = (r * 32767.0).round().clamp(-32768.0, 32767.0) as i16;

            let lb = l_i16.to_le_bytes();
            let rb = r_i16.to_le_bytes();
            data[base] = lb[0];
            data[base + 1] = lb[1];
            data[base + 2] = rb[0];
            data[base + 3] = rb[1];
        }

        let _ = p.fade_complete;
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_bass(
        x: f32,
        state: &mut BassChannelState,
        alpha60: f32,
        alpha120: f32,
        alpha_lp: f32,
        qi: f32,
        q: f32,
        g60: f32,
        g120: f32,
        limiter_active: bool,
    ) -> f32 {
        state.s60 += alpha60 * (x - state.s60);
        let mut y = x + state.s60 * (g60 - 1.0);

        state.s120 += alpha120 * (y - state.s120);
        y += state.s120 * (g120 - 1.0);

        state.s_lp = state.s_lp * (1.0 - alpha_lp * qi) + y * alpha_lp * qi;
        let mut out = state.s_lp + (y - state.s_lp) * (0.3 + (q - 0.7) * 0.2);

        if limiter_active && out.abs() > 0.85 {
            out = sign(out) * (0.85 + (out.abs() - 0.85) / 8.0);
        }
        out
    }

    fn apply_treble(x: f32, state: &mut TrebleChannelState, alpha_tr: f32, g_tr: f32) -> f32 {
        state.lp += alpha_tr * (x - state.lp);
        let hp = x - state.lp;
        x + hp * (g_tr - 1.0)
    }

    fn apply_compressor(x: f32) -> f32 {
        if x.abs() > 0.8 {
            sign(x) * (0.8 + (x.abs() - 0.8) / 4.0)
        } else {
            x
        }
    }
}

/// Cloneable setter handle, separated from `AudioProcessor` so the voice
/// session can hand it to whatever issues volume/EQ commands without
/// exposing the per-channel filter state that only `process` touches.
#[derive(Clone)]
pub struct AudioProcessorHandle {
    params: Arc<Mutex<Params>>,
}

impl AudioProcessorHandle {
    pub fn set_volume(&self, volume: f32) {
        let mut guard = self.params.lock().expect("dsp params mutex poisoned");
        guard.fade = None;
        guard.volume = volume.clamp(0.0, 1.0);
    }

    pub fn start_fade(&self, target: f32, duration_ms: u64) {
        let mut guard = self.params.lock().expect("dsp params mutex poisoned");
        guard.fade = Some(FadeState {
            start_volume: guard.volume,
            target_volume: target.clamp(0.0, 1.0),
            started_at: Instant::now(),
            duration: Duration::from_millis(duration_ms.max(1)),
        });
    }

    pub fn set_equalizer(&self, bass: f32, treble: f32, compressor: bool) {
        let mut guard = self.params.lock().expect("dsp params mutex poisoned");
        guard.bass = bass;
        guard.treble = treble;
        guard.compressor = compressor;
    }

    pub fn set_compressor(&self, on: bool) {
        let mut guard = self.params.lock().expect("dsp params mutex poisoned");
        guard.compressor = on;
    }

    pub fn set_low_pass_frequency(&self, freq: Option<f32>) {
        let mut guard = self.params.lock().expect("dsp params mutex poisoned");
        guard.low_pass_frequency = freq;
    }

    pub fn set_normalize(&self, on: bool) {
        let mut guard = self.params.lock().expect("dsp params mutex poisoned");
        guard.normalize = on;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone_buffer(frames: usize, amplitude: i16) -> Vec<u8> {
        let mut buf = Vec::with_capacity(frames * 4);
        for i in 0..frames {
            let s = if i % 2 == 0 { amplitude } else { -amplitude };
            buf.extend_from_slice(&s.to_le_bytes());
            buf.extend_from_slice(&s.to_le_bytes());
        }
        buf
    }

    #[test]
    fn identity_transform_is_exact() {
        let mut proc = AudioProcessor::new();
        let original = tone_buffer(64, 10_000);
        let mut data = original.clone();
        proc.process(&mut data);
        assert_eq!(data, original);
    }

    #[test]
    fn constant_volume_scales_within_one_lsb() {
        let mut proc = AudioProcessor::new();
        proc.set_volume(0.5);
        // Drive one buffer so prev_volume catches up to 0.5, then measure
        // on a second buffer where prev==curr==0.5 (no interpolation drift).
        let mut warm = tone_buffer(8, 10_000);
        proc.process(&mut warm);

        let original = tone_buffer(64, 10_000);
        let mut data = original.clone();
        proc.process(&mut data);

        for frame in 0..64 {
            let base = frame * 4;
            let orig_l = i16::from_le_bytes([original[base], original[base + 1]]) as f32;
            let got_l = i16::from_le_bytes([data[base], data[base + 1]]) as f32;
            let expected = orig_l * 0.5;
            assert!((got_l - expected).abs() <= 1.0, "frame {frame}: {got_l} vs {expected}");
        }
    }

    #[test]
    fn fade_progresses_monotonically_toward_target() {
        let mut proc = AudioProcessor::new();
        proc.set_volume(1.0);
        proc.start_fade(0.0, 40);

        let mut last = 1.0_f32;
        for _ in 0..4 {
            std::thread::sleep(Duration::from_millis(12));
            let mut data = tone_buffer(4, 20_000);
            proc.process(&mut data);
            let l = i16::from_le_bytes([data[0], data[1]]).abs() as f32;
            let orig = 20_000f32;
            let implied_vol = l / orig;
            assert!(implied_vol <= last + 0.05, "volume should not increase during fade-out");
            last = implied_vol;
        }
        assert!(last < 0.6, "volume should have dropped substantially by end of fade");
    }

    #[test]
    fn compressor_reduces_loud_samples_without_flipping_sign() {
        let mut proc = AudioProcessor::new();
        proc.set_compressor(true);
        let mut data = tone_buffer(16, 30_000);
        proc.process(&mut data);
        for frame in 0..16 {
            let base = frame * 4;
            let l = i16::from_le_bytes([data[base], data[base + 1]]);
            let input_sign = if frame % 2 == 0 { 1 } else { -1 };
            if l != 0 {
                assert_eq!(l.signum() as i32, input_sign);
            }
            assert!((l as f32 / 32767.0).abs() < (30_000f32 / 32768.0));
        }
    }

    #[test]
    fn bass_limiter_bounds_output_when_engaged() {
        let mut proc = AudioProcessor::new();
        // bass = BASS_MAX pushes bass_norm to 1.0, bass_db = 18, well above
        // the 6 dB limiter-engagement threshold.
        proc.set_equalizer(BASS_MAX, TREBLE_NEUTRAL, false);
        let mut data = tone_buffer(256, 32_000);
        proc.process(&mut data);
        let limit = 0.85 + (1.0 - 0.85) / 8.0;
        for frame in 0..256 {
            let base = frame * 4;
            let l = i16::from_le_bytes([data[base], data[base + 1]]) as f32 / 32767.0;
            assert!(l.abs() <= limit + 0.02, "sample {frame} exceeded limiter bound: {l}");
        }
    }

    #[test]
    fn parameter_change_applies_no_later_than_next_buffer() {
        let mut proc = AudioProcessor::new();
        let mut first = tone_buffer(4, 10_000);
        proc.process(&mut first);
        let first_l = i16::from_le_bytes([first[0], first[1]]);
        assert_eq!(first_l, 10_000);

        proc.set_volume(0.0);
        let mut second = tone_buffer(16, 10_000);
        proc.process(&mut second);
        let last_base = 15 * 4;
        let last_l = i16::from_le_bytes([second[last_base], second[last_base + 1]]);
        assert_eq!(last_l, 0, "by the final frame of the next buffer, volume should be fully applied");
    }
}
