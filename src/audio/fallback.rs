// Degraded decoder used when the symphonia pipeline is not wanted
// Plain WAV only; duration comes from the file's tag properties and may be unknown

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use hound::{SampleFormat, WavReader};
use lofty::prelude::AudioFile;
use lofty::probe::Probe;
use tracing::{debug, info, warn};

use crate::audio::decoder::{DecodedFrame, DecoderBackend, MediaSource, UNKNOWN_DURATION};
use crate::error::{AudioError, Result};

const FRAMES_PER_READ: usize = 4096;

pub struct FallbackDecoder {
    reader: WavReader<BufReader<File>>,
    media: MediaSource,
    scale: f32,
    float_samples: bool,
    remaining_frames: u32,
}

impl FallbackDecoder {
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(AudioError::file_not_found(format!(
                "Audio file not found: {}",
                path.display()
            )));
        }

        let reader = WavReader::open(path)?;
        let spec = reader.spec();
        if spec.channels == 0 || spec.sample_rate == 0 {
            return Err(AudioError::decoding_failed("Could not find stream information"));
        }

        let float_samples = spec.sample_format == SampleFormat::Float;
        let scale = if float_samples {
            1.0
        } else {
            1.0 / (1u64 << (spec.bits_per_sample.saturating_sub(1) as u32)) as f32
        };

        let media = MediaSource {
            path: path.to_path_buf(),
            container: "wav".to_string(),
            codec: if float_samples {
                format!("pcm_f{}le", spec.bits_per_sample)
            } else {
                format!("pcm_s{}le", spec.bits_per_sample)
            },
            sample_rate: spec.sample_rate,
            channels: spec.channels as usize,
            duration_ms: estimate_duration_ms(path),
            valid: true,
        };

        info!(
            path = %path.display(),
            codec = %media.codec,
            sample_rate = media.sample_rate,
            channels = media.channels,
            duration_ms = media.duration_ms,
            "Opened audio stream with fallback decoder"
        );

        Ok(Self {
            remaining_frames: reader.duration(),
            reader,
            media,
            scale,
            float_samples,
        })
    }
}

impl DecoderBackend for FallbackDecoder {
    fn media(&self) -> &MediaSource {
        &self.media
    }

    fn next_frame(&mut self) -> Result<Option<DecodedFrame>> {
        if self.remaining_frames == 0 {
            return Ok(None);
        }

        let channels = self.media.channels;
        let frames = (self.remaining_frames as usize).min(FRAMES_PER_READ);
        let wanted = frames * channels;

        let (mut samples, truncated) = if self.float_samples {
            read_samples(self.reader.samples::<f32>().take(wanted), wanted, |v| v)?
        } else {
            let scale = self.scale;
            read_samples(self.reader.samples::<i32>().take(wanted), wanted, |v| {
                v as f32 * scale
            })?
        };

        // A truncated data chunk ends the stream early rather than failing the load
        let whole = samples.len() - samples.len() % channels;
        if truncated || whole < wanted {
            warn!(
                expected = wanted,
                got = samples.len(),
                "WAV data chunk shorter than its header claims"
            );
            self.remaining_frames = 0;
        } else {
            self.remaining_frames -= frames as u32;
        }

        if whole == 0 {
            return Ok(None);
        }

        samples.truncate(whole);
        Ok(Some(DecodedFrame {
            samples,
            channels,
            sample_rate: self.media.sample_rate,
        }))
    }
}

/// Collect up to `wanted` samples. Running out of bytes mid-chunk is reported
/// as truncation; any other read error fails the decode.
fn read_samples<S, I>(
    samples: I,
    wanted: usize,
    convert: impl Fn(S) -> f32,
) -> Result<(Vec<f32>, bool)>
where
    I: Iterator<Item = hound::Result<S>>,
{
    let mut out = Vec::new();
    out.try_reserve(wanted)?;
    for sample in samples {
        match sample {
            Ok(value) => out.push(convert(value)),
            Err(hound::Error::IoError(e)) if is_short_read(&e) => {
                debug!(error = %e, "WAV data ended early");
                return Ok((out, true));
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok((out, false))
}

// hound reports a short read as `Other` rather than `UnexpectedEof`
fn is_short_read(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::Other
    )
}

/// Millisecond duration from file properties, or UNKNOWN_DURATION when the file
/// cannot be probed. Coarser than counting decoded frames.
fn estimate_duration_ms(path: &Path) -> i64 {
    match Probe::open(path).and_then(|p| p.read()) {
        Ok(tagged_file) => tagged_file.properties().duration().as_millis() as i64,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Duration estimate unavailable");
            UNKNOWN_DURATION
        }
    }
}
