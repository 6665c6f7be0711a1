// Fixture writers for tests
// Audio files are generated on the fly so the test suite carries no binary assets

use std::f32::consts::PI;
use std::fs;
use std::path::{Path, PathBuf};

use hound::{SampleFormat, WavSpec, WavWriter};

/// 16-bit PCM WAV with a 440 Hz sine at half scale on every channel.
pub fn write_sine_wav(
    dir: &Path,
    name: &str,
    sample_rate: u32,
    channels: u16,
    duration_ms: u32,
) -> PathBuf {
    write_wav(dir, name, sample_rate, channels, duration_ms, |t| {
        0.5 * (2.0 * PI * 440.0 * t).sin()
    })
}

/// 16-bit PCM WAV of digital silence.
pub fn write_silent_wav(
    dir: &Path,
    name: &str,
    sample_rate: u32,
    channels: u16,
    duration_ms: u32,
) -> PathBuf {
    write_wav(dir, name, sample_rate, channels, duration_ms, |_| 0.0)
}

/// A file that no decoder will accept.
pub fn write_garbage(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    let bytes: Vec<u8> = (0..4096u32).map(|i| (i.wrapping_mul(31) % 251) as u8).collect();
    fs::write(&path, bytes).unwrap();
    path
}

/// Cut `path` down to `len` bytes, leaving the header's length fields as they were.
pub fn truncate(path: &Path, len: u64) {
    fs::OpenOptions::new()
        .write(true)
        .open(path)
        .unwrap()
        .set_len(len)
        .unwrap();
}

fn write_wav(
    dir: &Path,
    name: &str,
    sample_rate: u32,
    channels: u16,
    duration_ms: u32,
    signal: impl Fn(f32) -> f32,
) -> PathBuf {
    let path = dir.join(name);
    let spec = WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(&path, spec).unwrap();
    let frames = (sample_rate as u64 * duration_ms as u64 / 1000) as u32;
    for n in 0..frames {
        let value = signal(n as f32 / sample_rate as f32);
        let sample = (value * i16::MAX as f32) as i16;
        for _ in 0..channels {
            writer.write_sample(sample).unwrap();
        }
    }
    writer.finalize().unwrap();
    path
}
