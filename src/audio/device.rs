// Pull-based output device
// The hardware callback reads PCM through here; it never blocks and never waits for data

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::audio::pcm_store::PcmStore;
use crate::audio::resampler::CanonicalFormat;
use crate::audio::worker::WorkerMessage;

/// Something the hardware side needs the engine to act on.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// The cursor reached the end of the PCM buffer.
    EndOfStream,
    /// The output stream failed after it was started.
    StreamError(String),
}

/// Read position into the PCM buffer, shared between the command path and the callback.
#[derive(Debug, Default)]
pub struct PlaybackCursor {
    offset: AtomicUsize,
    exhausted: AtomicBool,
}

impl PlaybackCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offset(&self) -> usize {
        self.offset.load(Ordering::Acquire)
    }

    /// Move the cursor and re-arm the end-of-stream signal.
    pub fn set(&self, offset: usize) {
        self.offset.store(offset, Ordering::Release);
        self.exhausted.store(false, Ordering::Release);
    }

    pub fn reset(&self) {
        self.set(0);
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::Acquire)
    }
}

/// Sequential read-only view of the PCM store at the shared cursor.
#[derive(Clone)]
pub struct PcmReader {
    store: Arc<PcmStore>,
    cursor: Arc<PlaybackCursor>,
    events: UnboundedSender<WorkerMessage>,
}

impl PcmReader {
    pub fn new(
        store: Arc<PcmStore>,
        cursor: Arc<PlaybackCursor>,
        events: UnboundedSender<WorkerMessage>,
    ) -> Self {
        Self {
            store,
            cursor,
            events,
        }
    }

    pub fn format(&self) -> CanonicalFormat {
        self.store.format()
    }

    /// Fill `buf` from the cursor and advance it by what was copied.
    ///
    /// Only whole frames are copied. Returns 0 once the buffer is exhausted;
    /// the first such read posts [`DeviceEvent::EndOfStream`], later ones stay quiet
    /// until the cursor is moved again.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let frame = self.store.format().bytes_per_frame();
        let want = buf.len() - buf.len() % frame;
        if want == 0 {
            return 0;
        }

        loop {
            let offset = self.cursor.offset.load(Ordering::Acquire);
            let chunk = self.store.read(offset, want);

            if chunk.is_empty() {
                if offset >= self.store.total_bytes()
                    && !self.cursor.exhausted.swap(true, Ordering::AcqRel)
                {
                    self.report(DeviceEvent::EndOfStream);
                }
                return 0;
            }

            let n = chunk.len();
            // A seek may land between the load and here; retry from its offset
            if self
                .cursor
                .offset
                .compare_exchange(offset, offset + n, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                buf[..n].copy_from_slice(chunk);
                return n;
            }
        }
    }

    /// Post an event to the engine worker. Never blocks.
    pub fn report(&self, event: DeviceEvent) {
        if self.events.send(WorkerMessage::Device(event)).is_err() {
            debug!("Engine worker gone, dropping device event");
        }
    }
}
