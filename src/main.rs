mod bus;
mod cli;
mod detector;
mod error;
mod logger;
mod profiler;
mod store;
mod types;

use clap::Parser;
use crossbeam_channel::{unbounded, Receiver, Sender};
use ipnetwork::IpNetwork;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bus::Bus;
use cli::Cli;
use detector::arp::ArpDetector;
use logger::{Event, Logger};
use profiler::config::ProfilerConfig;
use profiler::{Input, Profiler};
use store::MemoryStore;
use types::{SessionStats, SharedStats, ShutdownFlag};

fn main() {
    // Parse command-line arguments
    let cli = Cli::parse();

    // Initialize shutdown flag for graceful termination
    let shutdown: ShutdownFlag = Arc::new(AtomicBool::new(false));

    // Track session duration for summary reporting
    let session_start = Instant::now();

    // Initialize logger with optional JSON output and file logging
    let logger = Arc::new(
        Logger::new(cli.json, cli.log_file.as_deref())
            .expect("Failed to open log file"),
    );

    // Create session statistics tracker and the shared collaborators
    let stats = SessionStats::new();
    let store = MemoryStore::new(Arc::clone(&logger), Arc::clone(&stats));
    let bus = Bus::new();

    let home_nets = parse_home_networks(&cli.home_networks, &logger);

    register_shutdown_handler(Arc::clone(&shutdown));

    // ── Workers ───────────────────────────────────────────────────────────────
    // One thread per pipeline stage: the profiler consumes raw input lines;
    // each detection module consumes its own bus subscription. Every worker
    // reports its name on the supervisory `finished` channel when it returns.
    let (input_tx, input_rx) = unbounded();
    let (finished_tx, finished_rx) = unbounded();

    let arp_detector = ArpDetector::new(store.clone(), home_nets.clone());
    let detector_handle = detector::spawn_module(
        arp_detector,
        &bus,
        Arc::clone(&logger),
        finished_tx.clone(),
    );

    let cfg = ProfilerConfig::new(cli.width, home_nets, cli.time_format.clone());
    let profiler = Profiler::new(
        cfg,
        store.clone(),
        Arc::clone(&bus),
        Arc::clone(&logger),
        Arc::clone(&stats),
    );
    let profiler_handle = profiler.spawn(input_rx, finished_tx);

    logger.log(&Event::Info { message: "Flow profiling engine started" });

    // ── Input feeding ─────────────────────────────────────────────────────────
    // Flow records from --flows (or stdin when no input was named at all),
    // then ARP records from --arp. The feeder checks the shutdown flag
    // between lines and converts it into a stop message down the pipeline.
    if let Some(path) = &cli.flows {
        feed_file(path, Input::Flow, &input_tx, &shutdown, &logger);
    } else if cli.arp.is_none() {
        logger.log(&Event::Info { message: "Reading flow records from stdin" });
        feed_stdin(&input_tx, &shutdown);
    }
    if let Some(path) = &cli.arp {
        feed_file(path, Input::Arp, &input_tx, &shutdown, &logger);
    }

    // ── Shutdown sequence ─────────────────────────────────────────────────────
    // Stop the profiler first and wait for it, so every event it publishes is
    // already on the bus before the detectors are told to stop.
    let _ = input_tx.send(Input::Stop);
    wait_for(&finished_rx, profiler::WORKER_NAME);

    bus.stop();
    wait_for(&finished_rx, detector::arp::MODULE_NAME);

    let _ = profiler_handle.join();
    let _ = detector_handle.join();

    print_summary(&logger, &stats, session_start);
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Registers a signal handler for graceful shutdown on Ctrl+C
fn register_shutdown_handler(shutdown: ShutdownFlag) {
    ctrlc::set_handler(move || {
        println!("\n[!] Ctrl+C received — shutting down...");
        shutdown.store(true, Ordering::SeqCst);
    })
    .expect("Failed to register Ctrl+C handler");
}

/// Parses the configured home-network ranges, logging and skipping any
/// value that is not valid CIDR.
fn parse_home_networks(values: &[String], logger: &Arc<Logger>) -> Vec<IpNetwork> {
    let mut nets = Vec::new();
    for value in values {
        match value.parse::<IpNetwork>() {
            Ok(net) => nets.push(net),
            Err(e) => logger.log(&Event::Info {
                message: &format!("Ignoring invalid home network '{}': {}", value, e),
            }),
        }
    }
    nets
}

/// Streams one input file into the profiler channel, one message per
/// non-empty line.
fn feed_file(
    path:     &str,
    wrap:     fn(String) -> Input,
    tx:       &Sender<Input>,
    shutdown: &ShutdownFlag,
    logger:   &Arc<Logger>,
) {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) => {
            logger.log(&Event::Info {
                message: &format!("Cannot open '{}': {}", path, e),
            });
            return;
        }
    };
    for line in BufReader::new(file).lines() {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }
        let _ = tx.send(wrap(line));
    }
}

/// Streams stdin into the profiler channel as flow records.
fn feed_stdin(tx: &Sender<Input>, shutdown: &ShutdownFlag) {
    for line in io::stdin().lock().lines() {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }
        let _ = tx.send(Input::Flow(line));
    }
}

/// Blocks until the named worker reports completion.
fn wait_for(rx: &Receiver<&'static str>, worker: &str) {
    for name in rx.iter() {
        if name == worker {
            break;
        }
    }
}

/// Emits the session summary from the shared statistics counters.
fn print_summary(logger: &Arc<Logger>, stats: &SharedStats, session_start: Instant) {
    logger.log(&Event::SessionSummary {
        duration_secs:    session_start.elapsed().as_secs(),
        flows_profiled:   stats.flows_profiled.load(Ordering::Relaxed),
        records_skipped:  stats.records_skipped.load(Ordering::Relaxed),
        windows_opened:   stats.windows_opened.load(Ordering::Relaxed),
        arp_events:       stats.arp_events.load(Ordering::Relaxed),
        evidence_emitted: stats.evidence_emitted.load(Ordering::Relaxed),
    });
}
