// Engine notifications
// Broadcast to any number of subscribers; emitting never blocks the caller

use std::path::PathBuf;

use tokio::sync::broadcast;

use crate::error::ErrorKind;

/// Default number of undelivered events a slow subscriber may lag behind.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Notifications emitted by the playback engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Timeline position, emitted at the update cadence while playing and once on seek/stop.
    PositionChanged { seconds: f64 },
    /// Emitted on every transport transition.
    PlaybackStateChanged { is_playing: bool },
    /// Emitted once per successful load (and with 0 when audio is cleared).
    DurationChanged { ms: i64 },
    AudioLoaded { path: PathBuf },
    AudioError { kind: ErrorKind, message: String },
}

/// Thin wrapper around a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAPACITY)
    }
}

/// Drain everything currently queued on a receiver without waiting.
pub fn drain(receiver: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    use broadcast::error::TryRecvError;

    let mut events = Vec::new();
    loop {
        match receiver.try_recv() {
            Ok(event) => events.push(event),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
        }
    }
    events
}
