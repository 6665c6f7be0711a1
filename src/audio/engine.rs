// Playback engine
// Transport state machine, command surface and notifications.
// Position is anchor based: while playing it is `now - anchor`, clamped to the duration.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::audio::clock::{Clock, MonotonicClock};
use crate::audio::decoder::{open_decoder, DecoderBackend, MediaSource};
use crate::audio::device::{DeviceEvent, PcmReader, PlaybackCursor};
use crate::audio::output::{AudioSink, CpalSink, NullSink, SinkState};
use crate::audio::pcm_store::PcmStore;
use crate::audio::resampler::{CanonicalFormat, Resampler};
use crate::audio::worker::{spawn_worker, WorkerMessage, WorkerSettings, WorkerTarget};
use crate::error::{AudioError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::settings::{EngineConfig, OutputKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransportState {
    Stopped = 0,
    Playing = 1,
    Paused = 2,
}

impl TransportState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => TransportState::Playing,
            2 => TransportState::Paused,
            _ => TransportState::Stopped,
        }
    }
}

/// Transport buttons as the UI sends them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransportCommand {
    /// Start, or resume from pause.
    Play,
    Pause,
    /// Pause without returning to the start.
    Stop,
    /// Stop and rewind to 0.
    StopAndReturn,
    /// Seek to a timeline position in seconds.
    Seek(f64),
}

/// Guarded by the engine lock.
struct EngineInner {
    media: Option<MediaSource>,
    pcm: Option<Arc<PcmStore>>,
    cursor: Arc<PlaybackCursor>,
    sink: Option<Box<dyn AudioSink>>,
    /// Why there is no sink, when startup could not open one.
    sink_error: Option<AudioError>,
    volume: f32,
    muted: bool,
}

impl EngineInner {
    fn effective_gain(&self) -> f32 {
        if self.muted {
            0.0
        } else {
            self.volume
        }
    }
}

/// State shared between the command path and the worker.
///
/// Everything the position tick reads is atomic; the tick never takes `inner`.
pub(crate) struct Shared {
    inner: Mutex<EngineInner>,
    state: AtomicU8,
    position_ms: AtomicI64,
    anchor_ms: AtomicI64,
    duration_ms: AtomicI64,
    suppress_next_tick: AtomicBool,
    /// Transport state leaves Playing only while this is held, and ticks emit under it.
    tick_gate: Mutex<()>,
    /// Serialises loads; the engine lock is released while decoding.
    load_lock: Mutex<()>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    worker_tx: mpsc::UnboundedSender<WorkerMessage>,
    config: EngineConfig,
}

impl Shared {
    fn state(&self) -> TransportState {
        TransportState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: TransportState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn live_position(&self) -> i64 {
        let duration = self.duration_ms.load(Ordering::Acquire).max(0);
        let elapsed = self.clock.now_ms() - self.anchor_ms.load(Ordering::Acquire);
        elapsed.clamp(0, duration)
    }

    fn position(&self) -> i64 {
        match self.state() {
            TransportState::Playing => self.live_position(),
            _ => self.position_ms.load(Ordering::Acquire),
        }
    }

    fn post(&self, message: WorkerMessage) {
        if self.worker_tx.send(message).is_err() {
            debug!("Engine worker gone, message dropped");
        }
    }

    fn emit_position(&self, ms: i64) {
        self.events.emit(EngineEvent::PositionChanged {
            seconds: ms as f64 / 1000.0,
        });
    }

    fn emit_error(&self, err: &AudioError) {
        self.events.emit(EngineEvent::AudioError {
            kind: err.kind(),
            message: err.message().to_string(),
        });
    }

    /// Stop output and rewind to 0. Emits a state change only on a real transition.
    fn halt(&self, inner: &mut EngineInner) -> bool {
        let was = {
            let _gate = self.tick_gate.lock();
            let was = self.state();
            self.set_state(TransportState::Stopped);
            was
        };
        self.suppress_next_tick.store(false, Ordering::Release);
        self.post(WorkerMessage::StopTimer);

        if let Some(sink) = inner.sink.as_mut() {
            sink.stop();
        }
        inner.cursor.reset();
        self.position_ms.store(0, Ordering::Release);
        self.anchor_ms.store(self.clock.now_ms(), Ordering::Release);

        if was != TransportState::Stopped {
            self.events
                .emit(EngineEvent::PlaybackStateChanged { is_playing: false });
            true
        } else {
            false
        }
    }

    fn release_audio(&self, inner: &mut EngineInner) -> bool {
        let had_audio = inner.pcm.is_some();
        inner.pcm = None;
        inner.media = None;
        self.duration_ms.store(0, Ordering::Release);
        had_audio
    }

    fn apply_device_event(&self, inner: &mut EngineInner, event: DeviceEvent) {
        match event {
            DeviceEvent::EndOfStream => {
                // A replay or seek since the event was posted re-arms the cursor
                if self.state() != TransportState::Playing || !inner.cursor.is_exhausted() {
                    debug!("Ignoring stale end of stream");
                    return;
                }
                info!("Playback reached end of audio");
                self.halt(inner);
                self.emit_position(0);
            }
            DeviceEvent::StreamError(message) => {
                if self.state() == TransportState::Stopped {
                    debug!(error = %message, "Output error while stopped");
                    return;
                }
                error!(error = %message, "Audio output failed during playback");
                self.halt(inner);
                self.emit_position(0);
                self.emit_error(&AudioError::device(message));
            }
        }
    }
}

impl WorkerTarget for Shared {
    fn on_tick(&self) {
        let _gate = self.tick_gate.lock();
        if self.state() != TransportState::Playing {
            return;
        }
        if self.suppress_next_tick.swap(false, Ordering::AcqRel) {
            return;
        }
        self.emit_position(self.live_position());
    }

    fn try_device_event(&self, event: &DeviceEvent) -> bool {
        match self.inner.try_lock() {
            Some(mut inner) => {
                self.apply_device_event(&mut inner, event.clone());
                true
            }
            None => false,
        }
    }

    fn device_event(&self, event: DeviceEvent) {
        let mut inner = self.inner.lock();
        self.apply_device_event(&mut inner, event);
    }
}

/// The audio playback and decode synchronisation engine.
///
/// All commands take `&self`; the engine can be shared behind an `Arc` between
/// the UI thread and anything else that issues commands.
pub struct AudioEngine {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl AudioEngine {
    /// Engine with the sink chosen by `config.output`.
    ///
    /// A missing output device is not fatal: it is logged once and `play()`
    /// reports it as a device error.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| AudioError::invalid_parameters(e.to_string()))?;

        let (sink, sink_error): (Option<Box<dyn AudioSink>>, Option<AudioError>) =
            match config.output {
                OutputKind::Cpal => {
                    match CpalSink::new(config.buffer_frames, config.device_start_timeout()) {
                        Ok(sink) => (Some(Box::new(sink) as Box<dyn AudioSink>), None),
                        Err(e) => {
                            error!(error = %e, "Audio output unavailable, playback disabled");
                            (None, Some(e))
                        }
                    }
                }
                OutputKind::Null => (
                    Some(Box::new(NullSink::new(config.buffer_frames)) as Box<dyn AudioSink>),
                    None,
                ),
            };

        Self::build(config, sink, sink_error, Arc::new(MonotonicClock::new()))
    }

    /// Engine driving a caller-supplied sink and clock.
    pub fn with_sink(
        config: EngineConfig,
        sink: Box<dyn AudioSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| AudioError::invalid_parameters(e.to_string()))?;
        Self::build(config, Some(sink), None, clock)
    }

    fn build(
        config: EngineConfig,
        sink: Option<Box<dyn AudioSink>>,
        sink_error: Option<AudioError>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let (worker_tx, worker_rx) = mpsc::unbounded_channel();
        let volume = config.initial_volume.clamp(0.0, 1.0);
        if let Some(sink) = sink.as_ref() {
            sink.set_gain(volume);
        }

        let settings = WorkerSettings {
            tick_interval: config.position_update_interval(),
            retry_delay: config.lock_retry_delay(),
            retry_limit: config.lock_retry_limit,
        };

        let shared = Arc::new(Shared {
            inner: Mutex::new(EngineInner {
                media: None,
                pcm: None,
                cursor: Arc::new(PlaybackCursor::new()),
                sink,
                sink_error,
                volume,
                muted: false,
            }),
            state: AtomicU8::new(TransportState::Stopped as u8),
            position_ms: AtomicI64::new(0),
            anchor_ms: AtomicI64::new(clock.now_ms()),
            duration_ms: AtomicI64::new(0),
            suppress_next_tick: AtomicBool::new(false),
            tick_gate: Mutex::new(()),
            load_lock: Mutex::new(()),
            clock,
            events: EventBus::default(),
            worker_tx: worker_tx.clone(),
            config,
        });

        let worker = spawn_worker(shared.clone(), worker_tx, worker_rx, settings)
            .map_err(|e| AudioError::device(format!("Failed to start engine worker: {}", e)))?;

        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.shared.events.subscribe()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Decode `path` completely into a fresh PCM buffer.
    ///
    /// Errors are returned and also broadcast as [`EngineEvent::AudioError`].
    pub fn load_audio_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let kind = self.shared.config.decoder;
        self.load_with(path.as_ref(), |path| open_decoder(kind, path))
    }

    fn load_with<F>(&self, path: &Path, open: F) -> Result<()>
    where
        F: FnOnce(&Path) -> Result<Box<dyn DecoderBackend>>,
    {
        let result = self.load_inner(path, open);
        if let Err(e) = &result {
            warn!(path = %path.display(), error = %e, "Failed to load audio");
            self.shared.emit_error(e);
        }
        result
    }

    fn load_inner<F>(&self, path: &Path, open: F) -> Result<()>
    where
        F: FnOnce(&Path) -> Result<Box<dyn DecoderBackend>>,
    {
        if path.as_os_str().is_empty() {
            return Err(AudioError::invalid_parameters("Empty file path"));
        }
        if !path.exists() {
            return Err(AudioError::file_not_found(format!(
                "Audio file not found: {}",
                path.display()
            )));
        }

        let shared = &self.shared;
        let _loading = shared.load_lock.lock();
        {
            let mut inner = shared.inner.lock();
            shared.halt(&mut inner);
            shared.emit_position(0);
            if shared.release_audio(&mut inner) {
                shared.events.emit(EngineEvent::DurationChanged { ms: 0 });
            }
        }

        // Decode without the engine lock held; `load_lock` keeps loads from overlapping
        let (media, pcm) = decode_to_pcm(&shared.config, open(path)?)?;
        if pcm.is_empty() {
            return Err(AudioError::decoding_failed("No audio data decoded"));
        }

        let duration = pcm.duration_ms();
        info!(
            path = %path.display(),
            duration_ms = duration,
            bytes = pcm.total_bytes(),
            "Audio loaded"
        );

        {
            let mut inner = shared.inner.lock();
            inner.media = Some(media);
            inner.pcm = Some(Arc::new(pcm));
            shared.duration_ms.store(duration, Ordering::Release);
        }

        shared
            .events
            .emit(EngineEvent::DurationChanged { ms: duration });
        shared.events.emit(EngineEvent::AudioLoaded {
            path: path.to_path_buf(),
        });
        Ok(())
    }

    /// Start or resume playback from the current position.
    pub fn play(&self) -> Result<()> {
        let result = self.play_inner();
        if let Err(e) = &result {
            warn!(error = %e, "Failed to start playback");
            self.shared.emit_error(e);
        }
        result
    }

    fn play_inner(&self) -> Result<()> {
        let shared = &self.shared;
        let mut inner = shared.inner.lock();
        let state = shared.state();
        if state == TransportState::Playing {
            return Ok(());
        }

        let pcm = match inner.pcm.as_ref() {
            Some(pcm) if !pcm.is_empty() => pcm.clone(),
            _ => return Err(AudioError::file_not_found("No audio loaded")),
        };

        let duration = shared.duration_ms.load(Ordering::Acquire);
        let mut position = shared.position_ms.load(Ordering::Acquire).clamp(0, duration);
        if position >= duration {
            position = 0;
        }
        inner.cursor.set(pcm.offset_for_time(position));

        let gain = inner.effective_gain();
        let reader = PcmReader::new(pcm, inner.cursor.clone(), shared.worker_tx.clone());
        let no_sink = inner.sink_error.clone();
        let sink = inner
            .sink
            .as_mut()
            .ok_or_else(|| no_sink.unwrap_or_else(|| AudioError::device("No audio output")))?;

        sink.set_gain(gain);
        if state == TransportState::Paused && sink.state() == SinkState::Suspended {
            sink.resume()?;
        } else {
            sink.start(reader)?;
        }
        if sink.state() != SinkState::Active {
            sink.stop();
            return Err(AudioError::device("Audio output is not active"));
        }

        shared
            .anchor_ms
            .store(shared.clock.now_ms() - position, Ordering::Release);
        shared.position_ms.store(position, Ordering::Release);
        shared.suppress_next_tick.store(true, Ordering::Release);
        shared.set_state(TransportState::Playing);
        shared.post(WorkerMessage::StartTimer);

        debug!(position_ms = position, "Playback started");
        shared
            .events
            .emit(EngineEvent::PlaybackStateChanged { is_playing: true });
        shared.emit_position(position);
        Ok(())
    }

    /// Suspend output, keeping the position. Does nothing unless playing.
    pub fn pause(&self) {
        let shared = &self.shared;
        let mut inner = shared.inner.lock();
        if shared.state() != TransportState::Playing {
            return;
        }

        let position = shared.live_position();
        shared.position_ms.store(position, Ordering::Release);
        {
            let _gate = shared.tick_gate.lock();
            shared.set_state(TransportState::Paused);
        }
        shared.post(WorkerMessage::StopTimer);
        if let Some(sink) = inner.sink.as_mut() {
            sink.suspend();
        }

        debug!(position_ms = position, "Playback paused");
        shared
            .events
            .emit(EngineEvent::PlaybackStateChanged { is_playing: false });
    }

    /// Stop and return to the start.
    pub fn stop(&self) {
        let shared = &self.shared;
        let mut inner = shared.inner.lock();
        shared.halt(&mut inner);
        shared.emit_position(0);
    }

    /// Drop the loaded audio entirely.
    pub fn clear_audio(&self) {
        let shared = &self.shared;
        let mut inner = shared.inner.lock();
        shared.halt(&mut inner);
        shared.release_audio(&mut inner);
        debug!("Audio cleared");
        shared.events.emit(EngineEvent::DurationChanged { ms: 0 });
        shared.emit_position(0);
    }

    /// Seek to `ms`, clamped to the loaded duration. Ignored while playing.
    pub fn set_position(&self, ms: i64) {
        let shared = &self.shared;
        let inner = shared.inner.lock();
        if shared.state() == TransportState::Playing {
            debug!(requested_ms = ms, "Seek ignored while playing");
            return;
        }

        let duration = shared.duration_ms.load(Ordering::Acquire).max(0);
        let position = ms.clamp(0, duration);
        if let Some(pcm) = inner.pcm.as_ref() {
            inner.cursor.set(pcm.offset_for_time(position));
        }
        shared.position_ms.store(position, Ordering::Release);
        shared
            .anchor_ms
            .store(shared.clock.now_ms() - position, Ordering::Release);
        shared.emit_position(position);
    }

    pub fn position(&self) -> i64 {
        self.shared.position()
    }

    pub fn duration(&self) -> i64 {
        self.shared.duration_ms.load(Ordering::Acquire)
    }

    pub fn set_timeline_position(&self, seconds: f64) {
        if !seconds.is_finite() {
            warn!(seconds, "Ignoring non-finite seek");
            return;
        }
        self.set_position((seconds * 1000.0).round() as i64);
    }

    pub fn timeline_position(&self) -> f64 {
        self.position() as f64 / 1000.0
    }

    pub fn duration_seconds(&self) -> f64 {
        self.duration() as f64 / 1000.0
    }

    pub fn set_volume(&self, volume: f32) {
        let mut inner = self.shared.inner.lock();
        inner.volume = if volume.is_nan() {
            0.0
        } else {
            volume.clamp(0.0, 1.0)
        };
        let gain = inner.effective_gain();
        if let Some(sink) = inner.sink.as_ref() {
            sink.set_gain(gain);
        }
    }

    pub fn volume(&self) -> f32 {
        self.shared.inner.lock().volume
    }

    pub fn set_muted(&self, muted: bool) {
        let mut inner = self.shared.inner.lock();
        inner.muted = muted;
        let gain = inner.effective_gain();
        if let Some(sink) = inner.sink.as_ref() {
            sink.set_gain(gain);
        }
    }

    pub fn is_muted(&self) -> bool {
        self.shared.inner.lock().muted
    }

    pub fn state(&self) -> TransportState {
        self.shared.state()
    }

    pub fn is_playing(&self) -> bool {
        self.state() == TransportState::Playing
    }

    pub fn is_paused(&self) -> bool {
        self.state() == TransportState::Paused
    }

    /// Canonical rate of the loaded audio, or the configured default.
    pub fn sample_rate(&self) -> u32 {
        self.shared
            .inner
            .lock()
            .pcm
            .as_ref()
            .map(|pcm| pcm.format().sample_rate)
            .unwrap_or(self.shared.config.default_sample_rate)
    }

    pub fn media(&self) -> Option<MediaSource> {
        self.shared.inner.lock().media.clone()
    }

    pub fn handle_transport(&self, command: TransportCommand) -> Result<()> {
        match command {
            TransportCommand::Play => self.play()?,
            TransportCommand::Pause | TransportCommand::Stop => self.pause(),
            TransportCommand::StopAndReturn => self.stop(),
            TransportCommand::Seek(seconds) => self.set_timeline_position(seconds),
        }
        Ok(())
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        if let Some(sink) = self.shared.inner.lock().sink.as_mut() {
            sink.stop();
        }

        self.shared.post(WorkerMessage::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Engine worker panicked");
            }
        }

        let mut inner = self.shared.inner.lock();
        inner.media = None;
        inner.pcm = None;
        inner.sink = None;
    }
}

/// Run the whole stream through the resampler into a fresh PCM buffer.
///
/// The decoder is dropped before returning, on success and on every error path.
fn decode_to_pcm(
    config: &EngineConfig,
    mut decoder: Box<dyn DecoderBackend>,
) -> Result<(MediaSource, PcmStore)> {
    let media = decoder.media().clone();

    let target = CanonicalFormat::new(
        config.output_sample_rate.unwrap_or(media.sample_rate),
        config.output_channels,
    );
    let mut resampler = Resampler::new(media.sample_rate, media.channels, target)?;
    let mut pcm = PcmStore::new(target);
    let mut scratch = Vec::new();

    while let Some(frame) = decoder.next_frame()? {
        scratch.clear();
        resampler.process(&frame, &mut scratch)?;
        pcm.append(&scratch)?;
    }
    scratch.clear();
    resampler.finish(&mut scratch)?;
    pcm.append(&scratch)?;
    pcm.seal();

    if media.has_known_duration() {
        let drift = (media.duration_ms - pcm.duration_ms()).abs();
        if drift > 50 {
            debug!(
                reported_ms = media.duration_ms,
                decoded_ms = pcm.duration_ms(),
                "Decoder duration differs from decoded length"
            );
        }
    }

    Ok((media, pcm))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::clock::ManualClock;
    use crate::audio::decoder::{DecodedFrame, UNKNOWN_DURATION};
    use crate::error::ErrorKind;
    use crate::events::drain;
    use crate::settings::DecoderKind;
    use crate::test_support::{truncate, write_garbage, write_sine_wav};
    use std::path::PathBuf;
    use std::sync::mpsc as std_mpsc;
    use std::thread;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn test_config() -> EngineConfig {
        EngineConfig {
            output: OutputKind::Null,
            buffer_frames: Some(256),
            position_update_interval_ms: 5,
            lock_retry_delay_ms: 1,
            ..Default::default()
        }
    }

    fn engine_with(config: EngineConfig) -> (AudioEngine, ManualClock) {
        let clock = ManualClock::new();
        let sink = Box::new(NullSink::new(config.buffer_frames));
        let engine = AudioEngine::with_sink(config, sink, Arc::new(clock.clone())).unwrap();
        (engine, clock)
    }

    fn engine() -> (AudioEngine, ManualClock) {
        engine_with(test_config())
    }

    fn clip(dir: &TempDir, duration_ms: u32) -> PathBuf {
        write_sine_wav(dir.path(), "clip.wav", 8000, 2, duration_ms)
    }

    fn state_changes(events: &[EngineEvent]) -> Vec<bool> {
        events
            .iter()
            .filter_map(|e| match e {
                EngineEvent::PlaybackStateChanged { is_playing } => Some(*is_playing),
                _ => None,
            })
            .collect()
    }

    fn errors(events: &[EngineEvent]) -> Vec<(ErrorKind, String)> {
        events
            .iter()
            .filter_map(|e| match e {
                EngineEvent::AudioError { kind, message } => Some((*kind, message.clone())),
                _ => None,
            })
            .collect()
    }

    fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    /// Yields 100 ms stereo blocks at 8 kHz, then ends or fails.
    struct ScriptedDecoder {
        media: MediaSource,
        blocks_left: usize,
        fail_at_end: bool,
        gate: Option<std_mpsc::Receiver<()>>,
    }

    impl ScriptedDecoder {
        fn new(path: &Path, blocks: usize, fail_at_end: bool) -> Self {
            Self {
                media: MediaSource {
                    path: path.to_path_buf(),
                    container: "wav".to_string(),
                    codec: "pcm_s16le".to_string(),
                    sample_rate: 8000,
                    channels: 2,
                    duration_ms: UNKNOWN_DURATION,
                    valid: true,
                },
                blocks_left: blocks,
                fail_at_end,
                gate: None,
            }
        }
    }

    impl DecoderBackend for ScriptedDecoder {
        fn media(&self) -> &MediaSource {
            &self.media
        }

        fn next_frame(&mut self) -> Result<Option<DecodedFrame>> {
            if let Some(gate) = self.gate.take() {
                let _ = gate.recv();
            }
            if self.blocks_left == 0 {
                return if self.fail_at_end {
                    Err(AudioError::decoding_failed(
                        "Failed to read packet: sector read failed",
                    ))
                } else {
                    Ok(None)
                };
            }
            self.blocks_left -= 1;
            Ok(Some(DecodedFrame {
                samples: vec![0.25; 800 * 2],
                channels: 2,
                sample_rate: 8000,
            }))
        }
    }

    fn sink_gain(engine: &AudioEngine) -> f32 {
        engine.shared.inner.lock().sink.as_ref().unwrap().gain()
    }

    #[test]
    fn test_load_reports_duration_and_media() {
        let dir = tempfile::tempdir().unwrap();
        let path = clip(&dir, 1500);
        let (engine, _clock) = engine();
        let mut events = engine.subscribe();

        engine.load_audio_file(&path).unwrap();

        assert_eq!(engine.duration(), 1500);
        assert_eq!(engine.duration_seconds(), 1.5);
        assert_eq!(engine.sample_rate(), 8000);
        assert_eq!(engine.state(), TransportState::Stopped);
        assert_eq!(engine.position(), 0);

        let media = engine.media().unwrap();
        assert_eq!(media.path, path);
        assert_eq!(media.channels, 2);

        let pcm_ms = engine.shared.inner.lock().pcm.as_ref().unwrap().duration_ms();
        assert!(engine.duration() >= pcm_ms);

        let events = drain(&mut events);
        assert!(events.contains(&EngineEvent::DurationChanged { ms: 1500 }));
        assert!(events.contains(&EngineEvent::AudioLoaded { path }));
        assert!(errors(&events).is_empty());
    }

    #[test]
    fn test_sample_rate_before_load_is_configured_default() {
        let (engine, _clock) = engine();
        assert_eq!(engine.sample_rate(), 44100);
        assert!(engine.media().is_none());
        assert_eq!(engine.duration(), 0);
    }

    #[test]
    fn test_fallback_decoder_yields_same_duration() {
        let dir = tempfile::tempdir().unwrap();
        let path = clip(&dir, 1500);
        let (engine, _clock) = engine_with(EngineConfig {
            decoder: DecoderKind::Fallback,
            ..test_config()
        });

        engine.load_audio_file(&path).unwrap();
        assert_eq!(engine.duration(), 1500);
    }

    #[test]
    fn test_configured_rate_and_mono_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = clip(&dir, 1000);
        let (engine, _clock) = engine_with(EngineConfig {
            output_sample_rate: Some(16000),
            output_channels: 1,
            ..test_config()
        });

        engine.load_audio_file(&path).unwrap();
        assert_eq!(engine.sample_rate(), 16000);
        assert!((engine.duration() - 1000).abs() <= 1);
        let format = engine.shared.inner.lock().pcm.as_ref().unwrap().format();
        assert_eq!(format, CanonicalFormat::new(16000, 1));
    }

    #[test]
    fn test_play_without_audio_fails_with_file_not_found() {
        let (engine, _clock) = engine();
        let mut events = engine.subscribe();

        let err = engine.play().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FileNotFound);
        assert!(!engine.is_playing());

        let errors = errors(&drain(&mut events));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, ErrorKind::FileNotFound);
    }

    #[test]
    fn test_load_error_kinds() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _clock) = engine();

        let err = engine.load_audio_file("").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameters);

        let err = engine
            .load_audio_file(dir.path().join("missing.wav"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FileNotFound);
    }

    #[test]
    fn test_corrupt_file_reports_error_and_stays_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let good = clip(&dir, 1000);
        let bad = write_garbage(dir.path(), "broken.wav");
        let (engine, _clock) = engine();

        engine.load_audio_file(&good).unwrap();
        let mut events = engine.subscribe();

        let err = engine.load_audio_file(&bad).unwrap_err();
        assert!(matches!(
            err.kind(),
            ErrorKind::UnsupportedFormat | ErrorKind::DecodingFailed
        ));

        let events = drain(&mut events);
        let errors = errors(&events);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, err.kind());
        assert!(!errors[0].1.is_empty());
        assert!(events.contains(&EngineEvent::DurationChanged { ms: 0 }));

        assert_eq!(engine.state(), TransportState::Stopped);
        assert_eq!(engine.duration(), 0);
        assert!(engine.media().is_none());
    }

    #[test]
    fn test_failure_partway_through_decode_leaves_nothing_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let good = clip(&dir, 1000);
        let (engine, _clock) = engine();
        engine.load_audio_file(&good).unwrap();
        let mut events = engine.subscribe();

        let err = engine
            .load_with(&good, |path| {
                Ok(Box::new(ScriptedDecoder::new(path, 3, true)) as Box<dyn DecoderBackend>)
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DecodingFailed);

        assert_eq!(engine.duration(), 0);
        assert!(engine.media().is_none());
        assert_eq!(engine.state(), TransportState::Stopped);
        assert_eq!(engine.play().unwrap_err().kind(), ErrorKind::FileNotFound);

        let events = drain(&mut events);
        assert!(events.contains(&EngineEvent::DurationChanged { ms: 0 }));
        assert_eq!(errors(&events)[0].0, ErrorKind::DecodingFailed);
    }

    #[test]
    fn test_truncated_wav_loads_with_either_decoder() {
        let dir = tempfile::tempdir().unwrap();
        let path = clip(&dir, 2000);
        let len = std::fs::metadata(&path).unwrap().len();
        truncate(&path, len / 2);

        for decoder in [DecoderKind::Symphonia, DecoderKind::Fallback] {
            let (engine, _clock) = engine_with(EngineConfig {
                decoder,
                ..test_config()
            });
            engine.load_audio_file(&path).unwrap();
            assert!(
                (800..=1000).contains(&engine.duration()),
                "{:?} loaded {} ms",
                decoder,
                engine.duration()
            );
        }
    }

    #[test]
    fn test_reload_while_playing_rewinds_position() {
        let dir = tempfile::tempdir().unwrap();
        let first = clip(&dir, 5000);
        let second = write_sine_wav(dir.path(), "second.wav", 8000, 2, 2000);
        let (engine, clock) = engine();
        engine.load_audio_file(&first).unwrap();
        engine.play().unwrap();
        clock.advance(300);

        let mut events = engine.subscribe();
        engine.load_audio_file(&second).unwrap();

        assert_eq!(engine.state(), TransportState::Stopped);
        assert_eq!(engine.position(), 0);
        assert_eq!(engine.duration(), 2000);

        let events = drain(&mut events);
        let stopped = events
            .iter()
            .position(|e| *e == EngineEvent::PlaybackStateChanged { is_playing: false })
            .unwrap();
        assert_eq!(
            &events[stopped + 1..],
            &[
                EngineEvent::PositionChanged { seconds: 0.0 },
                EngineEvent::DurationChanged { ms: 0 },
                EngineEvent::DurationChanged { ms: 2000 },
                EngineEvent::AudioLoaded { path: second },
            ][..]
        );
    }

    #[test]
    fn test_queries_answer_while_a_load_is_decoding() {
        let dir = tempfile::tempdir().unwrap();
        let path = clip(&dir, 500);
        let (engine, _clock) = engine();
        engine.set_volume(0.4);

        let (release, gate) = std_mpsc::channel();
        let engine_ref = &engine;
        let path_ref = path.as_path();
        thread::scope(|s| {
            let loading = s.spawn(move || {
                engine_ref.load_with(path_ref, move |path| {
                    let mut decoder = ScriptedDecoder::new(path, 5, false);
                    decoder.gate = Some(gate);
                    Ok(Box::new(decoder) as Box<dyn DecoderBackend>)
                })
            });

            thread::sleep(Duration::from_millis(50));
            assert_eq!(engine.volume(), 0.4);
            assert!(!engine.is_muted());
            assert!(engine.media().is_none());
            assert_eq!(engine.sample_rate(), 44100);

            release.send(()).unwrap();
            loading.join().unwrap().unwrap();
        });

        assert_eq!(engine.duration(), 500);
        assert_eq!(engine.media().unwrap().path, path);
    }

    #[test]
    fn test_no_tick_lands_after_stop_notification() {
        let dir = tempfile::tempdir().unwrap();
        let path = clip(&dir, 5000);
        let (engine, clock) = engine();
        engine.load_audio_file(&path).unwrap();

        for _ in 0..50 {
            engine.play().unwrap();
            clock.advance(100);
            let mut events = engine.subscribe();
            let done = AtomicBool::new(false);

            thread::scope(|s| {
                s.spawn(|| {
                    while !done.load(Ordering::Acquire) {
                        engine.shared.on_tick();
                    }
                });
                thread::sleep(Duration::from_millis(1));
                engine.stop();
                done.store(true, Ordering::Release);
            });

            let last = drain(&mut events)
                .into_iter()
                .filter(|e| matches!(e, EngineEvent::PositionChanged { .. }))
                .last();
            assert_eq!(last, Some(EngineEvent::PositionChanged { seconds: 0.0 }));
        }
    }

    #[test]
    fn test_position_follows_clock_across_pause_and_resume() {
        let dir = tempfile::tempdir().unwrap();
        let path = clip(&dir, 10_000);
        let (engine, clock) = engine();
        engine.load_audio_file(&path).unwrap();

        engine.play().unwrap();
        assert!(engine.is_playing());
        clock.advance(500);
        let at_pause = engine.position();
        assert!((450..=550).contains(&at_pause));

        engine.pause();
        assert!(engine.is_paused());
        clock.advance(300);
        assert_eq!(engine.position(), at_pause);

        engine.play().unwrap();
        let mut last = engine.position();
        assert_eq!(last, at_pause);
        for _ in 0..4 {
            clock.advance(50);
            let now = engine.position();
            assert!(now > last);
            last = now;
        }
        assert_eq!(last, at_pause + 200);
    }

    #[test]
    fn test_position_is_clamped_to_duration() {
        let dir = tempfile::tempdir().unwrap();
        let path = clip(&dir, 10_000);
        let (engine, clock) = engine();
        engine.load_audio_file(&path).unwrap();

        engine.play().unwrap();
        clock.advance(60_000);
        assert_eq!(engine.position(), 10_000);
    }

    #[test]
    fn test_pause_twice_notifies_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = clip(&dir, 5000);
        let (engine, clock) = engine();
        engine.load_audio_file(&path).unwrap();
        engine.play().unwrap();
        clock.advance(100);

        let mut events = engine.subscribe();
        engine.pause();
        let position = engine.position();
        engine.pause();

        assert!(engine.is_paused());
        assert_eq!(engine.position(), position);
        assert_eq!(state_changes(&drain(&mut events)), vec![false]);
    }

    #[test]
    fn test_stop_resets_from_every_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = clip(&dir, 5000);
        let (engine, clock) = engine();
        engine.load_audio_file(&path).unwrap();

        // Stopped with a seek applied
        engine.set_position(1200);
        engine.stop();
        assert_eq!(engine.position(), 0);
        assert!(!engine.is_playing() && !engine.is_paused());

        // Playing
        engine.play().unwrap();
        clock.advance(300);
        engine.stop();
        assert_eq!(engine.position(), 0);
        assert!(!engine.is_playing() && !engine.is_paused());

        // Paused
        engine.play().unwrap();
        clock.advance(300);
        engine.pause();
        let mut events = engine.subscribe();
        engine.stop();
        assert_eq!(engine.position(), 0);
        assert!(!engine.is_playing() && !engine.is_paused());

        let events = drain(&mut events);
        assert_eq!(state_changes(&events), vec![false]);
        assert_eq!(
            events.last(),
            Some(&EngineEvent::PositionChanged { seconds: 0.0 })
        );
    }

    #[test]
    fn test_seek_round_trip_while_stopped_and_paused() {
        let dir = tempfile::tempdir().unwrap();
        let path = clip(&dir, 5000);
        let (engine, clock) = engine();
        engine.load_audio_file(&path).unwrap();
        let mut events = engine.subscribe();

        engine.set_position(1234);
        assert_eq!(engine.position(), 1234);
        assert!(drain(&mut events).contains(&EngineEvent::PositionChanged { seconds: 1.234 }));

        engine.set_position(99_999);
        assert_eq!(engine.position(), 5000);
        engine.set_position(-20);
        assert_eq!(engine.position(), 0);

        engine.play().unwrap();
        clock.advance(100);
        engine.pause();
        engine.set_position(2500);
        assert_eq!(engine.position(), 2500);

        engine.play().unwrap();
        assert_eq!(engine.position(), 2500);
        clock.advance(100);
        assert_eq!(engine.position(), 2600);
    }

    #[test]
    fn test_seek_while_playing_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = clip(&dir, 5000);
        let (engine, clock) = engine();
        engine.load_audio_file(&path).unwrap();

        engine.play().unwrap();
        clock.advance(250);
        engine.set_position(4000);
        assert!(engine.is_playing());
        assert_eq!(engine.position(), 250);
    }

    #[test]
    fn test_playback_to_completion_stops_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = clip(&dir, 300);
        let (engine, clock) = engine();
        engine.load_audio_file(&path).unwrap();
        let mut events = engine.subscribe();

        engine.play().unwrap();
        clock.advance(150);
        assert!(wait_until(Duration::from_secs(5), || !engine.is_playing()));
        thread::sleep(Duration::from_millis(50));

        assert_eq!(engine.state(), TransportState::Stopped);
        assert_eq!(engine.position(), 0);
        assert_eq!(state_changes(&drain(&mut events)), vec![true, false]);

        // Can be played again from the start
        engine.play().unwrap();
        assert_eq!(engine.position(), 0);
        engine.stop();
    }

    #[test]
    fn test_timer_emits_position_only_while_playing() {
        let dir = tempfile::tempdir().unwrap();
        let path = clip(&dir, 5000);
        let (engine, clock) = engine();
        engine.load_audio_file(&path).unwrap();
        let mut events = engine.subscribe();

        engine.play().unwrap();
        clock.advance(400);
        thread::sleep(Duration::from_millis(100));

        let seen = drain(&mut events);
        assert!(seen.contains(&EngineEvent::PositionChanged { seconds: 0.4 }));

        engine.pause();
        thread::sleep(Duration::from_millis(20));
        drain(&mut events);
        thread::sleep(Duration::from_millis(60));
        let after_pause = drain(&mut events);
        assert!(after_pause
            .iter()
            .all(|e| !matches!(e, EngineEvent::PositionChanged { .. })));
    }

    #[test]
    fn test_volume_is_clamped_and_mute_keeps_it() {
        let (engine, _clock) = engine();

        engine.set_volume(1.5);
        assert_eq!(engine.volume(), 1.0);
        engine.set_volume(-0.5);
        assert_eq!(engine.volume(), 0.0);

        engine.set_volume(0.6);
        assert_eq!(sink_gain(&engine), 0.6);

        engine.set_muted(true);
        assert!(engine.is_muted());
        assert_eq!(engine.volume(), 0.6);
        assert_eq!(sink_gain(&engine), 0.0);

        engine.set_muted(false);
        assert_eq!(sink_gain(&engine), 0.6);
    }

    #[test]
    fn test_engine_without_output_device_stays_usable() {
        let dir = tempfile::tempdir().unwrap();
        let path = clip(&dir, 1000);
        let engine = AudioEngine::build(
            test_config(),
            None,
            Some(AudioError::device("No output device available")),
            Arc::new(ManualClock::new()),
        )
        .unwrap();

        engine.load_audio_file(&path).unwrap();
        let err = engine.play().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceError);
        assert!(!engine.is_playing());

        engine.pause();
        engine.stop();
        engine.set_volume(0.3);
        engine.set_position(500);
        assert_eq!(engine.position(), 500);
    }

    #[test]
    fn test_stale_end_of_stream_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = clip(&dir, 5000);
        let (engine, _clock) = engine();
        engine.load_audio_file(&path).unwrap();
        engine.play().unwrap();

        engine.shared.device_event(DeviceEvent::EndOfStream);
        assert!(engine.is_playing());
        engine.stop();
    }

    #[test]
    fn test_stream_error_stops_and_reports() {
        let dir = tempfile::tempdir().unwrap();
        let path = clip(&dir, 5000);
        let (engine, clock) = engine();
        engine.load_audio_file(&path).unwrap();
        engine.play().unwrap();
        clock.advance(200);
        let mut events = engine.subscribe();

        engine
            .shared
            .device_event(DeviceEvent::StreamError("device unplugged".into()));

        assert_eq!(engine.state(), TransportState::Stopped);
        assert_eq!(engine.position(), 0);
        let events = drain(&mut events);
        assert_eq!(state_changes(&events), vec![false]);
        assert_eq!(
            errors(&events),
            vec![(ErrorKind::DeviceError, "device unplugged".to_string())]
        );
    }

    #[test]
    fn test_contended_device_event_is_applied_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = clip(&dir, 5000);
        let (engine, _clock) = engine();
        engine.load_audio_file(&path).unwrap();
        engine.play().unwrap();

        {
            let _guard = engine.shared.inner.lock();
            engine
                .shared
                .post(WorkerMessage::Device(DeviceEvent::StreamError("lost".into())));
            thread::sleep(Duration::from_millis(20));
            assert!(engine.is_playing());
        }

        assert!(wait_until(Duration::from_secs(2), || !engine.is_playing()));
    }

    #[test]
    fn test_transport_commands() {
        let dir = tempfile::tempdir().unwrap();
        let path = clip(&dir, 5000);
        let (engine, clock) = engine();
        engine.load_audio_file(&path).unwrap();

        engine.handle_transport(TransportCommand::Play).unwrap();
        assert!(engine.is_playing());
        clock.advance(800);

        engine.handle_transport(TransportCommand::Stop).unwrap();
        assert!(engine.is_paused());
        assert_eq!(engine.position(), 800);

        engine.handle_transport(TransportCommand::Seek(1.5)).unwrap();
        assert_eq!(engine.timeline_position(), 1.5);

        engine.handle_transport(TransportCommand::Play).unwrap();
        engine.handle_transport(TransportCommand::Pause).unwrap();
        assert!(engine.is_paused());

        engine
            .handle_transport(TransportCommand::StopAndReturn)
            .unwrap();
        assert_eq!(engine.state(), TransportState::Stopped);
        assert_eq!(engine.position(), 0);
    }

    #[test]
    fn test_clear_audio_forces_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let path = clip(&dir, 5000);
        let (engine, clock) = engine();
        engine.load_audio_file(&path).unwrap();
        engine.play().unwrap();
        clock.advance(100);

        let mut events = engine.subscribe();
        engine.clear_audio();

        assert_eq!(engine.state(), TransportState::Stopped);
        assert_eq!(engine.duration(), 0);
        assert!(engine.media().is_none());
        let events = drain(&mut events);
        assert_eq!(state_changes(&events), vec![false]);
        assert!(events.contains(&EngineEvent::DurationChanged { ms: 0 }));

        assert_eq!(engine.play().unwrap_err().kind(), ErrorKind::FileNotFound);
    }

    #[test]
    fn test_new_with_null_output_and_invalid_config() {
        let engine = AudioEngine::new(test_config()).unwrap();
        assert!(!engine.is_playing());

        let err = AudioEngine::new(EngineConfig {
            output_channels: 6,
            ..test_config()
        })
        .err()
        .unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidParameters);
    }
}
