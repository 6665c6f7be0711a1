// Engine settings module

pub mod settings;

pub use settings::{DecoderKind, EngineConfig, OutputKind};
