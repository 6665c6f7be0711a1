// Tempoline - audio timeline playback engine
// Module declarations
pub mod audio;
pub mod error;
pub mod events;
pub mod logging;
pub mod settings;

#[cfg(test)]
mod test_support;

pub use audio::{AudioEngine, TransportCommand, TransportState};
pub use error::{AudioError, ConfigError, ErrorKind, Result};
pub use events::{EngineEvent, EventBus};
pub use settings::{DecoderKind, EngineConfig, OutputKind};
