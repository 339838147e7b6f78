//! Detection module framework.
//!
//! A detection module declares the topics it subscribes to, reacts to events
//! with one or more heuristics, and owns a per-(profile, window) cache that
//! is evicted when windows close. The generic loop in [`run_module`] gives
//! every module the same lifecycle: blocking receive in arrival order,
//! malformed payloads logged and skipped, and a stop message that completes
//! pending work before the module signals and returns.
//!
//! Each module instance owns its cache exclusively and is driven from a
//! single thread, so no synchronisation is needed inside a module.

pub mod arp;

use crossbeam_channel::{Receiver, Sender};
use std::thread;

use crate::bus::{BusMessage, SharedBus, Topic};
use crate::logger::{Event, SharedLogger};

/// The contract every concrete detection module implements.
pub trait DetectionModule: Send + 'static {
    /// Short stable name used in diagnostics and completion signalling.
    fn name(&self) -> &'static str;

    /// Topics this module subscribes to. Window-close notifications are
    /// routed to [`DetectionModule::on_window_closed`] by the framework, so
    /// modules that cache per-window state should include
    /// [`Topic::WindowClosed`] here.
    fn topics(&self) -> &'static [Topic];

    /// Handles one event payload. Returns `Err` with a short description
    /// when the payload cannot be decoded; the loop logs it and continues.
    fn on_event(&mut self, topic: Topic, payload: &str) -> std::result::Result<(), String>;

    /// Drops every cache entry belonging to the closed window. `closed` is
    /// the combined `profileid_twid` identity.
    fn on_window_closed(&mut self, closed: &str);
}

/// Whether a cache key belongs to a closed window.
///
/// Keys embed the window identity as a prefix; matching on the identity
/// rather than exact equality lets a close notification evict every key
/// shape a heuristic may have derived from it. The separator check keeps
/// `…_tw1` from also claiming `…_tw10`.
pub fn key_belongs_to(key: &str, closed: &str) -> bool {
    match key.strip_prefix(closed) {
        Some("") => true,
        Some(rest) => rest.starts_with('_'),
        None => false,
    }
}

/// Subscribes the module on the bus and spawns its processing thread.
pub fn spawn_module<M: DetectionModule>(
    module: M,
    bus: &SharedBus,
    logger: SharedLogger,
    finished: Sender<&'static str>,
) -> thread::JoinHandle<()> {
    let rx = bus.subscribe(module.topics());
    thread::spawn(move || run_module(module, rx, logger, finished))
}

/// The shared subscription loop.
///
/// Processes messages in arrival order until a stop message or a
/// disconnected channel, then signals completion. A malformed payload never
/// terminates the loop.
pub fn run_module<M: DetectionModule>(
    mut module: M,
    rx: Receiver<BusMessage>,
    logger: SharedLogger,
    finished: Sender<&'static str>,
) {
    loop {
        match rx.recv() {
            Ok(BusMessage::Event { topic: Topic::WindowClosed, payload }) => {
                module.on_window_closed(&payload);
            }
            Ok(BusMessage::Event { topic, payload }) => {
                if let Err(detail) = module.on_event(topic, &payload) {
                    logger.log(&Event::MalformedPayload {
                        worker: module.name(),
                        detail: &detail,
                    });
                }
            }
            Ok(BusMessage::Stop) | Err(_) => break,
        }
    }
    let _ = finished.send(module.name());
    logger.log(&Event::WorkerStopped { worker: module.name() });
}
