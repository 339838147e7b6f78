//! Flow profiling worker.
//!
//! Consumes raw flow and ARP records over a blocking channel, normalises
//! them, applies the home-network policy, resolves each record's profile and
//! time window, and writes through the injected [`ProfileStore`]. ARP records
//! are additionally republished on the bus as `new_arp` events for the
//! detection modules; window transitions are announced as `window_closed`.
//!
//! The worker owns no shared mutable state: everything it touches is either
//! its own (`Normalizer` layout cache) or behind the store/bus interfaces.

pub mod config;
pub mod normalizer;
pub mod types;
pub mod window;

use crossbeam_channel::{Receiver, Sender};
use std::sync::atomic::Ordering;
use std::thread;

use crate::bus::{SharedBus, Topic};
use crate::error::Result;
use crate::logger::{Event, SharedLogger};
use crate::store::SharedStore;
use crate::types::SharedStats;

use config::ProfilerConfig;
use normalizer::{parse_arp_record, Normalizer};
use types::{ArpEvent, CanonicalFlow};
use window::WindowAllocator;

/// Worker name used in diagnostics and completion signalling.
pub const WORKER_NAME: &str = "profiler";

/// A message on the profiler's ingestion channel.
#[derive(Debug)]
pub enum Input {
    /// One raw flow record (delimited row or self-describing JSON line).
    Flow(String),
    /// One raw ARP record (JSON line).
    Arp(String),
    /// Terminal control signal.
    Stop,
}

pub struct Profiler {
    cfg:        ProfilerConfig,
    normalizer: Normalizer,
    windows:    WindowAllocator,
    store:      SharedStore,
    bus:        SharedBus,
    logger:     SharedLogger,
    stats:      SharedStats,
}

impl Profiler {
    pub fn new(
        cfg: ProfilerConfig,
        store: SharedStore,
        bus: SharedBus,
        logger: SharedLogger,
        stats: SharedStats,
    ) -> Self {
        let normalizer = Normalizer::new(&cfg.time_format);
        let windows = WindowAllocator::new(cfg.width);
        Self { cfg, normalizer, windows, store, bus, logger, stats }
    }

    /// Spawns the worker thread. It blocks on `rx`, processes until a
    /// [`Input::Stop`] (or channel disconnect), then sends its name on
    /// `finished` and returns.
    pub fn spawn(
        self,
        rx: Receiver<Input>,
        finished: Sender<&'static str>,
    ) -> thread::JoinHandle<()> {
        thread::spawn(move || self.run(rx, finished))
    }

    fn run(mut self, rx: Receiver<Input>, finished: Sender<&'static str>) {
        loop {
            match rx.recv() {
                Ok(Input::Flow(line)) => {
                    if let Err(e) = self.ingest_flow(&line) {
                        // Only layout-establishment failures are fatal:
                        // report the reason, then complete like a normal stop.
                        self.logger.log(&Event::WorkerFatal {
                            worker: WORKER_NAME,
                            reason: &e.to_string(),
                        });
                        break;
                    }
                }
                Ok(Input::Arp(line)) => self.ingest_arp(&line),
                Ok(Input::Stop) | Err(_) => break,
            }
        }
        let _ = finished.send(WORKER_NAME);
        self.logger.log(&Event::WorkerStopped { worker: WORKER_NAME });
    }

    /// Normalises and profiles one raw flow record.
    ///
    /// Returns `Err` only for conditions that abort the stream; every
    /// per-record rejection is counted and swallowed here.
    pub fn ingest_flow(&mut self, line: &str) -> Result<()> {
        let flow = match self.normalizer.normalize(line)? {
            Some(flow) => flow,
            None => {
                self.stats.records_skipped.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        };
        self.profile_flow(&flow);
        Ok(())
    }

    fn profile_flow(&mut self, flow: &CanonicalFlow) {
        // MAC-only records are expected and dropped without comment.
        let src = match flow.source_ip() {
            Ok(ip) => ip,
            Err(_) => {
                self.stats.records_skipped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        if !self.cfg.profiles_source(src) {
            self.stats.records_skipped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let profile = self.store.ensure_profile(src);
        let ts = flow.unix_start();
        let alloc = self.windows.window_for(self.store.as_ref(), &profile, ts);
        self.note_allocation(&alloc);

        self.store.record_destination(&profile, &alloc.window.id, &flow.daddr);
        self.stats.flows_profiled.fetch_add(1, Ordering::Relaxed);
    }

    /// Profiles one raw ARP record and republishes it for the detectors.
    pub fn ingest_arp(&mut self, line: &str) {
        let arp = match parse_arp_record(line) {
            Some(arp) => arp,
            None => {
                self.stats.records_skipped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        let src = match arp.saddr.parse::<std::net::IpAddr>() {
            Ok(ip) => ip,
            Err(_) => {
                self.stats.records_skipped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        if !self.cfg.profiles_source(src) {
            self.stats.records_skipped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let profile = self.store.ensure_profile(src);
        let alloc = self.windows.window_for(self.store.as_ref(), &profile, arp.ts);
        self.note_allocation(&alloc);

        let event = ArpEvent {
            profileid: profile,
            twid:      alloc.window.id.clone(),
            flow:      arp,
        };
        if let Ok(payload) = serde_json::to_string(&event) {
            self.bus.publish(Topic::NewArp, payload);
            self.stats.arp_events.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Publishes window-close notifications and keeps the window counter.
    fn note_allocation(&self, alloc: &window::Allocation) {
        if alloc.opened {
            self.stats.windows_opened.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(closed) = &alloc.closed {
            self.bus.publish(Topic::WindowClosed, closed.clone());
        }
    }
}
