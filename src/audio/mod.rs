// Audio playback module
// Symphonia (or the WAV fallback) decodes, the resampler canonicalises, cpal pulls the result

pub mod clock;
pub mod decoder;
pub mod device;
pub mod engine;
pub mod fallback;
pub mod output;
pub mod pcm_store;
pub mod resampler;
pub mod waveform;
pub mod worker;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use decoder::{open_decoder, DecodedFrame, DecoderBackend, MediaSource, UNKNOWN_DURATION};
pub use engine::{AudioEngine, TransportCommand, TransportState};
pub use output::{AudioSink, CpalSink, NullSink, SinkState};
pub use resampler::CanonicalFormat;
