// Amplitude preview for timeline clips
// One normalised peak per bucket; drawing it is the caller's business

use std::path::Path;

use tracing::debug;

use crate::audio::decoder::open_decoder;
use crate::error::{AudioError, Result};
use crate::settings::DecoderKind;

/// Decode `path` and reduce it to `buckets` peaks in `[0, 1]`.
///
/// Peaks are scaled by the loudest sample in the file. A silent file yields
/// zeros rather than being amplified.
pub fn generate_preview(path: &Path, kind: DecoderKind, buckets: usize) -> Result<Vec<f32>> {
    if buckets == 0 {
        return Err(AudioError::invalid_parameters("Preview needs at least one bucket"));
    }

    let mut decoder = open_decoder(kind, path)?;
    let mut mono = Vec::new();
    while let Some(frame) = decoder.next_frame()? {
        let channels = frame.channels.max(1);
        mono.try_reserve(frame.frames())?;
        mono.extend(
            frame
                .samples
                .chunks_exact(channels)
                .map(|f| f.iter().sum::<f32>() / channels as f32),
        );
    }
    drop(decoder);

    let peaks = bucket_peaks(&mono, buckets);
    debug!(
        path = %path.display(),
        samples = mono.len(),
        buckets,
        "Generated waveform preview"
    );
    Ok(peaks)
}

fn bucket_peaks(samples: &[f32], buckets: usize) -> Vec<f32> {
    let mut peaks = vec![0.0f32; buckets];
    if samples.is_empty() {
        return peaks;
    }

    for (i, peak) in peaks.iter_mut().enumerate() {
        let start = i * samples.len() / buckets;
        let end = ((i + 1) * samples.len() / buckets).max(start + 1).min(samples.len());
        if start >= samples.len() {
            break;
        }
        *peak = samples[start..end]
            .iter()
            .fold(0.0f32, |acc, s| acc.max(s.abs()));
    }

    let max = peaks.iter().cloned().fold(0.0f32, f32::max);
    if max > 0.0 {
        for peak in peaks.iter_mut() {
            *peak /= max;
        }
    }
    peaks
}
