// Conversion of decoded frames into the canonical PCM layout
// 16-bit little-endian interleaved, mono or stereo, source rate unless a target rate is configured

use rubato::{
    Resampler as _, SincFixedIn, SincInterpolationParameters, SincInterpolationType,
    WindowFunction,
};
use tracing::{debug, info};

use crate::audio::decoder::DecodedFrame;
use crate::error::{AudioError, Result};

pub const BYTES_PER_SAMPLE: usize = 2;

const RATE_CHUNK_FRAMES: usize = 1024;
const MAX_FLUSH_PASSES: usize = 64;
const SURROUND_GAIN: f32 = std::f32::consts::FRAC_1_SQRT_2;

/// The fixed sample layout every PCM buffer uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanonicalFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl CanonicalFormat {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.channels as usize * BYTES_PER_SAMPLE
    }

    pub fn bytes_per_second(&self) -> usize {
        self.bytes_per_frame() * self.sample_rate as usize
    }
}

/// Turns native frames into canonical bytes.
///
/// Channel reduction uses a fixed mixing matrix built for the source channel
/// count. Rate conversion only runs when the target rate differs from the
/// source; its filter delay is trimmed and its tail drained by [`finish`].
///
/// [`finish`]: Resampler::finish
pub struct Resampler {
    target: CanonicalFormat,
    source_channels: usize,
    matrix: Vec<Vec<f32>>,
    rate: Option<RateConverter>,
}

impl Resampler {
    pub fn new(source_rate: u32, source_channels: usize, target: CanonicalFormat) -> Result<Self> {
        if source_rate == 0 || source_channels == 0 {
            return Err(AudioError::decoding_failed("Invalid source format"));
        }
        if !(1..=2).contains(&target.channels) || target.sample_rate == 0 {
            return Err(AudioError::invalid_parameters(format!(
                "Unsupported canonical format: {} Hz, {} channels",
                target.sample_rate, target.channels
            )));
        }

        let rate = if source_rate != target.sample_rate {
            info!(
                from = source_rate,
                to = target.sample_rate,
                "Sample rate conversion enabled"
            );
            Some(RateConverter::new(
                source_rate,
                target.sample_rate,
                target.channels as usize,
            )?)
        } else {
            None
        };

        Ok(Self {
            target,
            source_channels,
            matrix: mix_matrix(source_channels, target.channels as usize),
            rate,
        })
    }

    pub fn target(&self) -> CanonicalFormat {
        self.target
    }

    /// Convert one frame, appending canonical bytes to `out`.
    pub fn process(&mut self, frame: &DecodedFrame, out: &mut Vec<u8>) -> Result<()> {
        if frame.channels == 0 || frame.samples.is_empty() {
            return Ok(());
        }
        if frame.channels != self.source_channels {
            debug!(
                from = self.source_channels,
                to = frame.channels,
                "Source channel count changed, rebuilding mix matrix"
            );
            self.source_channels = frame.channels;
            self.matrix = mix_matrix(frame.channels, self.target.channels as usize);
        }

        let planes = self.mix(frame);
        match self.rate.as_mut() {
            Some(rate) => rate.push(planes, out),
            None => write_interleaved(&planes, out),
        }
    }

    /// Drain whatever the rate converter still holds.
    pub fn finish(&mut self, out: &mut Vec<u8>) -> Result<()> {
        match self.rate.as_mut() {
            Some(rate) => rate.flush(out),
            None => Ok(()),
        }
    }

    fn mix(&self, frame: &DecodedFrame) -> Vec<Vec<f32>> {
        let frames = frame.frames();
        let mut planes = vec![vec![0.0f32; frames]; self.matrix.len()];
        for (plane, row) in planes.iter_mut().zip(&self.matrix) {
            for (n, out) in plane.iter_mut().enumerate() {
                let input = &frame.samples[n * frame.channels..(n + 1) * frame.channels];
                *out = input.iter().zip(row).map(|(s, g)| s * g).sum();
            }
        }
        planes
    }
}

/// Gains from each source channel (standard WAVE order) to each output channel.
///
/// Rows are normalised to unit sum, so a full-scale source never clips.
fn mix_matrix(source_channels: usize, target_channels: usize) -> Vec<Vec<f32>> {
    let mut left = vec![0.0f32; source_channels];
    let mut right = vec![0.0f32; source_channels];

    if source_channels == 1 {
        left[0] = 1.0;
        right[0] = 1.0;
    } else {
        for ch in 0..source_channels {
            match ch {
                0 => left[ch] = 1.0,
                1 => right[ch] = 1.0,
                2 => {
                    left[ch] = SURROUND_GAIN;
                    right[ch] = SURROUND_GAIN;
                }
                // LFE
                3 => {}
                4 | 6 => left[ch] = SURROUND_GAIN,
                5 | 7 => right[ch] = SURROUND_GAIN,
                n if n % 2 == 0 => left[ch] = 0.5,
                _ => right[ch] = 0.5,
            }
        }
    }

    let rows = if target_channels == 1 {
        vec![left.iter().zip(&right).map(|(l, r)| (l + r) / 2.0).collect()]
    } else {
        vec![left, right]
    };

    rows.into_iter()
        .map(|row: Vec<f32>| {
            let sum: f32 = row.iter().sum();
            if sum > 0.0 {
                row.iter().map(|g| g / sum).collect()
            } else {
                row
            }
        })
        .collect()
}

#[inline]
fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16
}

fn write_interleaved(planes: &[Vec<f32>], out: &mut Vec<u8>) -> Result<()> {
    let frames = planes.first().map(|p| p.len()).unwrap_or(0);
    out.try_reserve(frames * planes.len() * BYTES_PER_SAMPLE)?;
    for n in 0..frames {
        for plane in planes {
            out.extend_from_slice(&to_i16(plane[n]).to_le_bytes());
        }
    }
    Ok(())
}

struct RateConverter {
    inner: SincFixedIn<f32>,
    ratio: f64,
    pending: Vec<Vec<f32>>,
    frames_in: u64,
    frames_out: u64,
    delay_remaining: usize,
}

impl RateConverter {
    fn new(from: u32, to: u32, channels: usize) -> Result<Self> {
        let ratio = to as f64 / from as f64;
        let params = SincInterpolationParameters {
            sinc_len: 256,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 256,
            window: WindowFunction::BlackmanHarris2,
        };
        let inner = SincFixedIn::<f32>::new(ratio, 1.0, params, RATE_CHUNK_FRAMES, channels)?;
        let delay_remaining = inner.output_delay();

        Ok(Self {
            inner,
            ratio,
            pending: vec![Vec::new(); channels],
            frames_in: 0,
            frames_out: 0,
            delay_remaining,
        })
    }

    fn push(&mut self, planes: Vec<Vec<f32>>, out: &mut Vec<u8>) -> Result<()> {
        for (pending, plane) in self.pending.iter_mut().zip(planes) {
            pending.extend(plane);
        }

        loop {
            let needed = self.inner.input_frames_next();
            if self.pending[0].len() < needed {
                return Ok(());
            }
            let chunk: Vec<Vec<f32>> = self
                .pending
                .iter_mut()
                .map(|p| p.drain(..needed).collect())
                .collect();
            self.frames_in += needed as u64;
            let produced = self.inner.process(&chunk, None)?;
            self.emit(produced, u64::MAX, out)?;
        }
    }

    fn flush(&mut self, out: &mut Vec<u8>) -> Result<()> {
        let expected = (self.frames_in as f64 + self.pending[0].len() as f64) * self.ratio;
        let expected = expected.round() as u64;

        if !self.pending[0].is_empty() {
            let rest = std::mem::take(&mut self.pending);
            self.frames_in += rest[0].len() as u64;
            let produced = self.inner.process_partial(Some(rest.as_slice()), None)?;
            self.pending = vec![Vec::new(); rest.len()];
            self.emit(produced, expected, out)?;
        }

        let mut passes = 0;
        while self.frames_out < expected && passes < MAX_FLUSH_PASSES {
            let produced = self.inner.process_partial::<Vec<f32>>(None, None)?;
            self.emit(produced, expected, out)?;
            passes += 1;
        }

        debug!(
            frames_in = self.frames_in,
            frames_out = self.frames_out,
            "Rate converter drained"
        );
        Ok(())
    }

    /// Skip the filter delay, then write at most `limit - frames_out` frames.
    fn emit(&mut self, mut planes: Vec<Vec<f32>>, limit: u64, out: &mut Vec<u8>) -> Result<()> {
        let len = planes.first().map(|p| p.len()).unwrap_or(0);
        let skip = self.delay_remaining.min(len);
        self.delay_remaining -= skip;

        let room = limit.saturating_sub(self.frames_out) as usize;
        let take = (len - skip).min(room);
        if take == 0 {
            return Ok(());
        }
        for plane in planes.iter_mut() {
            plane.drain(..skip);
            plane.truncate(take);
        }
        self.frames_out += take as u64;
        write_interleaved(&planes, out)
    }
}
