// In-memory PCM buffer for one loaded track
// Filled once during load, then shared read-only with the hardware callback

use crate::audio::resampler::CanonicalFormat;
use crate::error::Result;

/// Fully decoded audio in the canonical format.
///
/// Appends keep the length a whole number of frames; a trailing partial frame
/// is held back until the rest of it arrives.
#[derive(Debug)]
pub struct PcmStore {
    format: CanonicalFormat,
    bytes: Vec<u8>,
    partial: Vec<u8>,
}

impl PcmStore {
    pub fn new(format: CanonicalFormat) -> Self {
        Self {
            format,
            bytes: Vec::new(),
            partial: Vec::new(),
        }
    }

    pub fn format(&self) -> CanonicalFormat {
        self.format
    }

    /// Append canonical bytes. Growth failure surfaces as a memory error.
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        let frame = self.format.bytes_per_frame();
        let mut data = data;

        if !self.partial.is_empty() {
            let need = frame - self.partial.len();
            let take = need.min(data.len());
            self.partial.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.partial.len() < frame {
                return Ok(());
            }
            self.bytes.try_reserve(frame)?;
            self.bytes.append(&mut self.partial);
        }

        let whole = data.len() - data.len() % frame;
        self.bytes.try_reserve(whole)?;
        self.bytes.extend_from_slice(&data[..whole]);
        self.partial.extend_from_slice(&data[whole..]);
        Ok(())
    }

    pub fn total_bytes(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Up to `max_len` bytes starting at `offset`, clamped to the end of the buffer.
    pub fn read(&self, offset: usize, max_len: usize) -> &[u8] {
        let start = offset.min(self.bytes.len());
        let end = start.saturating_add(max_len).min(self.bytes.len());
        &self.bytes[start..end]
    }

    /// Frame-aligned byte offset for a timeline position, clamped to the buffer.
    pub fn offset_for_time(&self, ms: i64) -> usize {
        if ms <= 0 {
            return 0;
        }
        let frame = self.format.bytes_per_frame();
        let exact = (ms as f64 / 1000.0 * self.format.bytes_per_second() as f64).round() as usize;
        let aligned = exact - exact % frame;
        aligned.min(self.bytes.len())
    }

    /// Timeline position of a byte offset.
    pub fn time_for_offset(&self, offset: usize) -> i64 {
        let per_second = self.format.bytes_per_second();
        if per_second == 0 {
            return 0;
        }
        (offset as f64 * 1000.0 / per_second as f64).round() as i64
    }

    /// Duration implied by the byte length.
    pub fn duration_ms(&self) -> i64 {
        self.time_for_offset(self.bytes.len())
    }

    /// Release spare capacity once loading is complete.
    pub fn seal(&mut self) {
        self.partial.clear();
        self.bytes.shrink_to_fit();
    }
}
