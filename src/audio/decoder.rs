// Audio decoder using Symphonia
// Opens a container, picks the first audio track and yields decoded frames as interleaved f32

use std::fs::File;
use std::path::{Path, PathBuf};

use symphonia::core::audio::{AudioBuffer, AudioBufferRef, Signal};
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::conv::IntoSample;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::sample::Sample;
use tracing::{debug, info, warn};

use crate::audio::fallback::FallbackDecoder;
use crate::error::{AudioError, Result};
use crate::settings::DecoderKind;

/// Sentinel for "duration could not be estimated".
pub const UNKNOWN_DURATION: i64 = -1;

/// Corrupt packets are skipped, but a stream that never decodes is a failure.
const MAX_CONSECUTIVE_DECODE_ERRORS: usize = 32;

/// Identity of one loaded audio asset.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaSource {
    pub path: PathBuf,
    pub container: String,
    pub codec: String,
    pub sample_rate: u32,
    pub channels: usize,
    /// Duration as reported by the decoder, or [`UNKNOWN_DURATION`].
    pub duration_ms: i64,
    pub valid: bool,
}

impl MediaSource {
    pub fn has_known_duration(&self) -> bool {
        self.duration_ms >= 0
    }
}

/// One block of decoded audio in the source's native rate and channel count.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    /// Interleaved samples in `[-1.0, 1.0]`.
    pub samples: Vec<f32>,
    pub channels: usize,
    pub sample_rate: u32,
}

impl DecodedFrame {
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels
        }
    }
}

/// Contract shared by every decoder strategy.
///
/// A backend owns all of its decode state; dropping it releases everything,
/// so a failed or abandoned load can never leak into the next `open`.
pub trait DecoderBackend: Send {
    fn media(&self) -> &MediaSource;

    fn duration_ms(&self) -> i64 {
        self.media().duration_ms
    }

    /// Next decoded frame, `Ok(None)` at end of stream.
    fn next_frame(&mut self) -> Result<Option<DecodedFrame>>;
}

/// Open `path` with the configured strategy.
pub fn open_decoder(kind: DecoderKind, path: &Path) -> Result<Box<dyn DecoderBackend>> {
    match kind {
        DecoderKind::Symphonia => Ok(Box::new(SymphoniaDecoder::open(path)?)),
        DecoderKind::Fallback => Ok(Box::new(FallbackDecoder::open(path)?)),
    }
}

pub struct SymphoniaDecoder {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    media: MediaSource,
}

impl SymphoniaDecoder {
    /// Open an audio file and prepare for decoding
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;

        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        // Create a hint using the file extension
        let mut hint = Hint::new();
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        if let Some(ext) = extension.as_deref() {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .map_err(|e| match e {
                SymphoniaError::IoError(io) => AudioError::from(io),
                other => AudioError::unsupported_format(format!(
                    "Could not open audio container: {}",
                    other
                )),
            })?;

        let format = probed.format;

        // Find the first audio track
        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| AudioError::unsupported_format("Could not find audio stream"))?;

        let track_id = track.id;
        let params = track.codec_params.clone();

        let sample_rate = params
            .sample_rate
            .ok_or_else(|| AudioError::decoding_failed("Could not find stream information"))?;
        let channels = params.channels.map(|c| c.count()).unwrap_or(2);

        let duration_ms = params
            .n_frames
            .map(|frames| frames_to_ms(frames, sample_rate))
            .unwrap_or(UNKNOWN_DURATION);

        let codecs = symphonia::default::get_codecs();
        let codec = codecs
            .get_codec(params.codec)
            .map(|d| d.short_name.to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let decoder = codecs
            .make(&params, &DecoderOptions::default())
            .map_err(|e| AudioError::unsupported_format(format!("Unsupported codec: {}", e)))?;

        let media = MediaSource {
            path: path.to_path_buf(),
            container: extension.unwrap_or_else(|| "unknown".to_string()),
            codec,
            sample_rate,
            channels,
            duration_ms,
            valid: true,
        };

        info!(
            path = %path.display(),
            codec = %media.codec,
            sample_rate,
            channels,
            duration_ms,
            "Opened audio stream"
        );

        Ok(Self {
            format,
            decoder,
            track_id,
            media,
        })
    }
}

impl DecoderBackend for SymphoniaDecoder {
    fn media(&self) -> &MediaSource {
        &self.media
    }

    fn next_frame(&mut self) -> Result<Option<DecodedFrame>> {
        let mut consecutive_errors = 0;
        loop {
            let packet = match self.format.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(None);
                }
                Err(SymphoniaError::ResetRequired) => {
                    self.decoder.reset();
                    continue;
                }
                Err(e) => {
                    return Err(AudioError::decoding_failed(format!(
                        "Failed to read packet: {}",
                        e
                    )))
                }
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    let spec = *decoded.spec();
                    let samples = audio_buf_to_f32(&decoded);
                    if samples.is_empty() {
                        continue;
                    }
                    return Ok(Some(DecodedFrame {
                        samples,
                        channels: spec.channels.count(),
                        sample_rate: spec.rate,
                    }));
                }
                Err(SymphoniaError::DecodeError(e)) => {
                    consecutive_errors += 1;
                    warn!(error = e, consecutive_errors, "Skipping corrupt packet");
                    if consecutive_errors >= MAX_CONSECUTIVE_DECODE_ERRORS {
                        return Err(AudioError::decoding_failed(format!(
                            "Too many corrupt packets, last error: {}",
                            e
                        )));
                    }
                }
                Err(e) => {
                    return Err(AudioError::decoding_failed(format!("Decode failed: {}", e)))
                }
            }
        }
    }
}

impl Drop for SymphoniaDecoder {
    fn drop(&mut self) {
        debug!(path = %self.media.path.display(), "Releasing decoder");
    }
}

pub(crate) fn frames_to_ms(frames: u64, sample_rate: u32) -> i64 {
    if sample_rate == 0 {
        return UNKNOWN_DURATION;
    }
    (frames as f64 / sample_rate as f64 * 1000.0).round() as i64
}

/// Convert any AudioBufferRef to interleaved f32 samples
fn audio_buf_to_f32(buf: &AudioBufferRef) -> Vec<f32> {
    match buf {
        AudioBufferRef::U8(b) => interleave(&**b),
        AudioBufferRef::U16(b) => interleave(&**b),
        AudioBufferRef::U24(b) => interleave(&**b),
        AudioBufferRef::U32(b) => interleave(&**b),
        AudioBufferRef::S8(b) => interleave(&**b),
        AudioBufferRef::S16(b) => interleave(&**b),
        AudioBufferRef::S24(b) => interleave(&**b),
        AudioBufferRef::S32(b) => interleave(&**b),
        AudioBufferRef::F32(b) => interleave(&**b),
        AudioBufferRef::F64(b) => interleave(&**b),
    }
}

fn interleave<S>(buf: &AudioBuffer<S>) -> Vec<f32>
where
    S: Sample + IntoSample<f32>,
{
    let num_channels = buf.spec().channels.count();
    let frames = buf.frames();
    if num_channels == 0 || frames == 0 {
        return vec![];
    }

    let mut interleaved = Vec::with_capacity(frames * num_channels);
    for frame in 0..frames {
        for ch in 0..num_channels {
            interleaved.push(buf.chan(ch)[frame].into_sample());
        }
    }
    interleaved
}
