// Audio output sinks
// The hardware pulls PCM through a PcmReader on its own clock; sinks only start, pause and stop that pull

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleRate, Stream, StreamConfig};
use tracing::{debug, error, info, warn};

use crate::audio::device::{DeviceEvent, PcmReader};
use crate::error::{AudioError, Result};

const NULL_SINK_DEFAULT_FRAMES: u32 = 512;

/// What the sink reports about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SinkState {
    Stopped = 0,
    Active = 1,
    Suspended = 2,
}

impl SinkState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SinkState::Active,
            2 => SinkState::Suspended,
            _ => SinkState::Stopped,
        }
    }
}

/// A hardware (or simulated) output endpoint.
pub trait AudioSink: Send {
    /// Begin pulling from `reader`. Any previous stream is stopped first.
    fn start(&mut self, reader: PcmReader) -> Result<()>;
    fn suspend(&mut self);
    fn resume(&mut self) -> Result<()>;
    fn stop(&mut self);
    fn state(&self) -> SinkState;
    /// Effective gain in `[0, 1]`, applied on the next pull.
    fn set_gain(&self, gain: f32);
    fn gain(&self) -> f32;
}

/// State and gain shared with the pulling thread.
#[derive(Debug)]
struct SinkControl {
    state: AtomicU8,
    gain: AtomicU32,
}

impl SinkControl {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(SinkState::Stopped as u8),
            gain: AtomicU32::new(1.0f32.to_bits()),
        })
    }

    fn state(&self) -> SinkState {
        SinkState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: SinkState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn gain(&self) -> f32 {
        f32::from_bits(self.gain.load(Ordering::Relaxed))
    }

    fn set_gain(&self, gain: f32) {
        self.gain.store(gain.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }
}

enum StreamCommand {
    Pause,
    Play(mpsc::Sender<std::result::Result<(), String>>),
    Stop,
}

/// Output through the default cpal device.
///
/// `cpal::Stream` cannot leave the thread that built it, so each started
/// stream lives on its own thread and is driven by commands.
pub struct CpalSink {
    control: Arc<SinkControl>,
    buffer_frames: Option<u32>,
    start_timeout: Duration,
    commands: Option<mpsc::Sender<StreamCommand>>,
    thread: Option<JoinHandle<()>>,
}

impl CpalSink {
    /// Fails when the host has no output device at all.
    pub fn new(buffer_frames: Option<u32>, start_timeout: Duration) -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| AudioError::device("No output device available"))?;
        info!(
            device = %device.name().unwrap_or_else(|_| "unknown".to_string()),
            "Using audio output device"
        );

        Ok(Self {
            control: SinkControl::new(),
            buffer_frames,
            start_timeout,
            commands: None,
            thread: None,
        })
    }

    fn send(&self, command: StreamCommand) -> bool {
        match &self.commands {
            Some(tx) => tx.send(command).is_ok(),
            None => false,
        }
    }
}

impl AudioSink for CpalSink {
    fn start(&mut self, reader: PcmReader) -> Result<()> {
        self.stop();

        let format = reader.format();
        let config = StreamConfig {
            channels: format.channels,
            sample_rate: SampleRate(format.sample_rate),
            buffer_size: match self.buffer_frames {
                Some(frames) => BufferSize::Fixed(frames),
                None => BufferSize::Default,
            },
        };

        let (command_tx, command_rx) = mpsc::channel();
        let (reply_tx, reply_rx) = mpsc::channel();
        let control = self.control.clone();

        let handle = thread::Builder::new()
            .name("tempoline-output".into())
            .spawn(move || run_stream(config, reader, control, command_rx, reply_tx))
            .map_err(|e| AudioError::device(format!("Failed to spawn output thread: {}", e)))?;

        self.commands = Some(command_tx);
        self.thread = Some(handle);

        match reply_rx.recv_timeout(self.start_timeout) {
            Ok(Ok(())) => {
                self.control.set_state(SinkState::Active);
                Ok(())
            }
            Ok(Err(message)) => {
                self.stop();
                Err(AudioError::device(message))
            }
            Err(_) => {
                self.stop();
                Err(AudioError::device("Audio output did not start in time"))
            }
        }
    }

    fn suspend(&mut self) {
        if self.state() == SinkState::Active && self.send(StreamCommand::Pause) {
            self.control.set_state(SinkState::Suspended);
        }
    }

    fn resume(&mut self) -> Result<()> {
        if self.state() != SinkState::Suspended {
            return Ok(());
        }
        let (reply_tx, reply_rx) = mpsc::channel();
        if !self.send(StreamCommand::Play(reply_tx)) {
            return Err(AudioError::device("Audio output stream is gone"));
        }
        match reply_rx.recv_timeout(self.start_timeout) {
            Ok(Ok(())) => {
                self.control.set_state(SinkState::Active);
                Ok(())
            }
            Ok(Err(message)) => Err(AudioError::device(message)),
            Err(_) => Err(AudioError::device("Audio output did not resume in time")),
        }
    }

    fn stop(&mut self) {
        self.send(StreamCommand::Stop);
        self.commands = None;
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                error!("Audio output thread panicked");
            }
        }
        self.control.set_state(SinkState::Stopped);
    }

    fn state(&self) -> SinkState {
        self.control.state()
    }

    fn set_gain(&self, gain: f32) {
        self.control.set_gain(gain);
    }

    fn gain(&self) -> f32 {
        self.control.gain()
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_stream(
    config: StreamConfig,
    reader: PcmReader,
    control: Arc<SinkControl>,
    commands: mpsc::Receiver<StreamCommand>,
    reply: mpsc::Sender<std::result::Result<(), String>>,
) {
    let stream = match open_stream(&config, reader, control.clone()) {
        Ok(stream) => stream,
        Err(message) => {
            warn!(error = %message, "Audio output failed to start");
            let _ = reply.send(Err(message));
            return;
        }
    };
    let _ = reply.send(Ok(()));
    debug!(
        channels = config.channels,
        sample_rate = config.sample_rate.0,
        "Audio output stream running"
    );

    while let Ok(command) = commands.recv() {
        match command {
            StreamCommand::Pause => {
                if let Err(e) = stream.pause() {
                    warn!(error = %e, "Failed to pause output stream");
                }
            }
            StreamCommand::Play(reply) => {
                let _ = reply.send(
                    stream
                        .play()
                        .map_err(|e| format!("Failed to resume stream: {}", e)),
                );
            }
            StreamCommand::Stop => break,
        }
    }

    drop(stream);
    debug!("Audio output stream closed");
}

fn open_stream(
    config: &StreamConfig,
    reader: PcmReader,
    control: Arc<SinkControl>,
) -> std::result::Result<Stream, String> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or("No output device available")?;
    let default_config = device
        .default_output_config()
        .map_err(|e| format!("Failed to get default output config: {}", e))?;

    let stream = match default_config.sample_format() {
        cpal::SampleFormat::F32 => build_stream::<f32>(&device, config, reader, control)?,
        cpal::SampleFormat::I16 => build_stream::<i16>(&device, config, reader, control)?,
        cpal::SampleFormat::U16 => build_stream::<u16>(&device, config, reader, control)?,
        format => return Err(format!("Unsupported sample format: {:?}", format)),
    };

    stream
        .play()
        .map_err(|e| format!("Failed to start stream: {}", e))?;
    Ok(stream)
}

fn build_stream<T: cpal::SizedSample + cpal::FromSample<f32>>(
    device: &cpal::Device,
    config: &StreamConfig,
    reader: PcmReader,
    control: Arc<SinkControl>,
) -> std::result::Result<Stream, String> {
    let error_reader = reader.clone();
    let mut scratch: Vec<u8> = Vec::new();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                if scratch.len() < data.len() * 2 {
                    scratch.resize(data.len() * 2, 0);
                }
                let filled = reader.read(&mut scratch[..data.len() * 2]) / 2;
                let gain = control.gain();

                for (i, sample) in data.iter_mut().enumerate() {
                    let value = if i < filled {
                        i16::from_le_bytes([scratch[2 * i], scratch[2 * i + 1]]) as f32
                            / i16::MAX as f32
                            * gain
                    } else {
                        0.0
                    };
                    *sample = T::from_sample(value);
                }
            },
            move |err| {
                error!(error = %err, "Audio output error");
                error_reader.report(DeviceEvent::StreamError(err.to_string()));
            },
            None,
        )
        .map_err(|e| format!("Failed to build output stream: {}", e))
}

/// Headless sink that pulls one period at a time on its own clock.
pub struct NullSink {
    control: Arc<SinkControl>,
    period_frames: u32,
    pulled: Arc<AtomicU64>,
    running: Option<(Arc<AtomicBool>, JoinHandle<()>)>,
}

impl NullSink {
    pub fn new(buffer_frames: Option<u32>) -> Self {
        Self {
            control: SinkControl::new(),
            period_frames: buffer_frames.unwrap_or(NULL_SINK_DEFAULT_FRAMES).max(1),
            pulled: Arc::new(AtomicU64::new(0)),
            running: None,
        }
    }

    /// Total bytes consumed since creation.
    pub fn bytes_pulled(&self) -> u64 {
        self.pulled.load(Ordering::Acquire)
    }
}

impl AudioSink for NullSink {
    fn start(&mut self, reader: PcmReader) -> Result<()> {
        self.stop();

        let format = reader.format();
        let period = Duration::from_secs_f64(self.period_frames as f64 / format.sample_rate as f64);
        let mut buf = vec![0u8; self.period_frames as usize * format.bytes_per_frame()];

        let halt = Arc::new(AtomicBool::new(false));
        let thread_halt = halt.clone();
        let control = self.control.clone();
        let pulled = self.pulled.clone();

        control.set_state(SinkState::Active);
        let handle = thread::Builder::new()
            .name("tempoline-null-output".into())
            .spawn(move || {
                while !thread_halt.load(Ordering::Acquire) {
                    if control.state() == SinkState::Active {
                        let n = reader.read(&mut buf);
                        pulled.fetch_add(n as u64, Ordering::AcqRel);
                    }
                    thread::sleep(period);
                }
            })
            .map_err(|e| {
                self.control.set_state(SinkState::Stopped);
                AudioError::device(format!("Failed to spawn output thread: {}", e))
            })?;

        self.running = Some((halt, handle));
        Ok(())
    }

    fn suspend(&mut self) {
        if self.state() == SinkState::Active {
            self.control.set_state(SinkState::Suspended);
        }
    }

    fn resume(&mut self) -> Result<()> {
        if self.state() == SinkState::Suspended {
            self.control.set_state(SinkState::Active);
        }
        Ok(())
    }

    fn stop(&mut self) {
        if let Some((halt, handle)) = self.running.take() {
            halt.store(true, Ordering::Release);
            if handle.join().is_err() {
                error!("Null output thread panicked");
            }
        }
        self.control.set_state(SinkState::Stopped);
    }

    fn state(&self) -> SinkState {
        self.control.state()
    }

    fn set_gain(&self, gain: f32) {
        self.control.set_gain(gain);
    }

    fn gain(&self) -> f32 {
        self.control.gain()
    }
}

impl Drop for NullSink {
    fn drop(&mut self) {
        self.stop();
    }
}
