// Engine worker thread
// Runs the position timer and applies hardware events off the callback thread.
// Contended events are re-queued after a short delay instead of blocking.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::audio::device::DeviceEvent;

/// Messages accepted by the worker. Sending never blocks.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerMessage {
    StartTimer,
    StopTimer,
    Device(DeviceEvent),
    Retry { event: DeviceEvent, attempt: u32 },
    Shutdown,
}

/// What the worker drives.
pub(crate) trait WorkerTarget: Send + Sync + 'static {
    /// Periodic position update. Must not wait on the engine lock.
    fn on_tick(&self);

    /// Apply `event` if the engine lock is free; `false` means try again later.
    fn try_device_event(&self, event: &DeviceEvent) -> bool;

    /// Apply `event`, waiting for the lock.
    fn device_event(&self, event: DeviceEvent);
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct WorkerSettings {
    pub tick_interval: Duration,
    pub retry_delay: Duration,
    pub retry_limit: u32,
}

pub(crate) fn spawn_worker<T: WorkerTarget>(
    target: Arc<T>,
    sender: UnboundedSender<WorkerMessage>,
    receiver: UnboundedReceiver<WorkerMessage>,
    settings: WorkerSettings,
) -> io::Result<JoinHandle<()>> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()?;

    thread::Builder::new()
        .name("tempoline-engine".into())
        .spawn(move || {
            runtime.block_on(run(target, sender, receiver, settings));
            debug!("Engine worker stopped");
        })
}

async fn run<T: WorkerTarget>(
    target: Arc<T>,
    sender: UnboundedSender<WorkerMessage>,
    mut receiver: UnboundedReceiver<WorkerMessage>,
    settings: WorkerSettings,
) {
    let mut timer: Option<Interval> = None;

    loop {
        tokio::select! {
            message = receiver.recv() => match message {
                None | Some(WorkerMessage::Shutdown) => break,
                Some(WorkerMessage::StartTimer) => {
                    let mut interval = time::interval_at(
                        Instant::now() + settings.tick_interval,
                        settings.tick_interval,
                    );
                    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    timer = Some(interval);
                }
                Some(WorkerMessage::StopTimer) => timer = None,
                Some(WorkerMessage::Device(event)) => {
                    dispatch(&*target, &sender, &settings, event, 0);
                }
                Some(WorkerMessage::Retry { event, attempt }) => {
                    dispatch(&*target, &sender, &settings, event, attempt);
                }
            },
            _ = next_tick(&mut timer) => target.on_tick(),
        }
    }
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn dispatch<T: WorkerTarget>(
    target: &T,
    sender: &UnboundedSender<WorkerMessage>,
    settings: &WorkerSettings,
    event: DeviceEvent,
    attempt: u32,
) {
    if target.try_device_event(&event) {
        return;
    }

    if attempt >= settings.retry_limit {
        warn!(?event, attempt, "Engine lock still busy, waiting for it");
        target.device_event(event);
        return;
    }

    trace!(?event, attempt, "Engine lock busy, deferring device event");
    let sender = sender.clone();
    let delay = settings.retry_delay;
    tokio::spawn(async move {
        time::sleep(delay).await;
        let _ = sender.send(WorkerMessage::Retry {
            event,
            attempt: attempt + 1,
        });
    });
}
