//! miner daemon entrypoint.
//!
//! Wires the three monitors into the coordinator and exposes the result on
//! the control socket. The coordinator is the only writer of session state;
//! everything here is plumbing and lifecycle.
//!
//! Exit codes: 0 on SIGTERM/SIGINT, 1 on startup failure or when every
//! monitor has stopped.

use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use miner_core::patterns::ActivityMatcher;
use miner_core::storage::{socket_override, CONTROL_SOCKET_ENV};
use miner_core::{
    load_config, spawn_coordinator, spawn_monitor, CoordinatorHandle, FeedReceiver, LogWatcher,
    MinerConfig, MonitorSource, ResourceMonitor, SignalProcessControl, StopFlag, StoragePaths,
};
use miner_protocol::SessionEvent;
use tracing::{error, info, warn};

mod control;
mod logging;
mod signals;

use control::{ControlContext, ControlServer};

const MAIN_POLL_INTERVAL: Duration = Duration::from_millis(250);

fn main() {
    let paths = match StoragePaths::resolve() {
        Ok(paths) => paths,
        Err(err) => {
            eprintln!("miner-daemon: {}", err);
            std::process::exit(1);
        }
    };
    let _logging_guard = logging::init(&paths.logs_dir());

    let config_path = paths.config_file();
    let config = match load_config(&config_path) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, path = %config_path.display(), "Failed to load config; using defaults");
            MinerConfig::default()
        }
    };

    match run(&paths, config) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            error!(error = %err, "miner daemon failed to start");
            std::process::exit(1);
        }
    }
}

fn run(paths: &StoragePaths, config: MinerConfig) -> Result<i32, String> {
    signals::install();

    let (handle, coordinator) = spawn_coordinator(
        config.classifier.policy(),
        config.coordinator.clone(),
        SignalProcessControl,
    )
    .map_err(|err| format!("Failed to spawn coordinator: {}", err))?;
    let escalations = handle.subscribe();
    let stop = StopFlag::new();

    let started = start_monitors(paths, &config, &handle, &stop).and_then(|(monitors, stats)| {
        let control_path = socket_override(CONTROL_SOCKET_ENV, None, paths.control_socket());
        let context = ControlContext {
            handle: handle.clone(),
            receiver_stats: stats,
            stop: stop.clone(),
        };
        let server = ControlServer::bind(control_path, context)?;
        let control = thread::Builder::new()
            .name("miner-control".to_string())
            .spawn(move || server.serve())
            .map_err(|err| format!("Failed to spawn control server: {}", err))?;
        Ok((monitors, control))
    });

    let (code, threads) = match started {
        Ok((monitors, control)) => {
            info!(pid = std::process::id(), "miner daemon started");
            let code = wait_for_exit(&escalations);
            let mut threads = monitors;
            threads.push(control);
            (Ok(code), threads)
        }
        Err(err) => (Err(err), Vec::new()),
    };

    shutdown(&handle, coordinator, &stop, threads);
    code
}

fn start_monitors(
    paths: &StoragePaths,
    config: &MinerConfig,
    handle: &CoordinatorHandle,
    stop: &StopFlag,
) -> Result<(Vec<JoinHandle<()>>, std::sync::Arc<miner_core::ReceiverStats>), String> {
    let spawn_err = |source: MonitorSource| {
        move |err: std::io::Error| format!("Failed to spawn {}: {}", source, err)
    };
    let mut monitors = Vec::with_capacity(MonitorSource::ALL.len());

    let matcher = config.log_watcher.matcher().unwrap_or_else(|err| {
        warn!(error = %err, "Invalid activity markers; using defaults");
        ActivityMatcher::default()
    });
    let log_watcher = LogWatcher::new(
        config.log_watcher.resolved_log_dir(paths),
        config.log_watcher.clone(),
        matcher,
        handle.sender(),
        stop.clone(),
    );
    monitors.push(
        spawn_monitor(MonitorSource::LogWatcher, handle.sender(), move || {
            log_watcher.run()
        })
        .map_err(spawn_err(MonitorSource::LogWatcher))?,
    );

    let resource_monitor = ResourceMonitor::new(
        config.resource_monitor.clone(),
        handle.sender(),
        stop.clone(),
    );
    monitors.push(
        spawn_monitor(MonitorSource::ResourceMonitor, handle.sender(), move || {
            resource_monitor.run()
        })
        .map_err(spawn_err(MonitorSource::ResourceMonitor))?,
    );

    let receiver = FeedReceiver::new(
        config.event_receiver.resolved_socket_path(paths),
        config.event_receiver.clone(),
        handle.sender(),
        stop.clone(),
    );
    let stats = receiver.stats();
    monitors.push(
        spawn_monitor(MonitorSource::EventReceiver, handle.sender(), move || {
            receiver.run()
        })
        .map_err(spawn_err(MonitorSource::EventReceiver))?,
    );

    Ok((monitors, stats))
}

/// Blocks until a shutdown signal (exit 0) or monitor escalation (exit 1).
fn wait_for_exit(escalations: &Receiver<SessionEvent>) -> i32 {
    loop {
        if signals::shutdown_requested() {
            info!("Shutdown requested");
            return 0;
        }
        match escalations.recv_timeout(MAIN_POLL_INTERVAL) {
            Ok(SessionEvent::MonitorsUnreachable) => {
                error!("All monitors stopped; exiting");
                return 1;
            }
            Ok(_) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                error!("Coordinator event feed closed; exiting");
                return 1;
            }
        }
    }
}

/// Monitors first so nothing new is queued, then the coordinator drains.
fn shutdown(
    handle: &CoordinatorHandle,
    coordinator: JoinHandle<()>,
    stop: &StopFlag,
    threads: Vec<JoinHandle<()>>,
) {
    stop.stop();
    for thread in threads {
        if thread.join().is_err() {
            warn!("Monitor thread panicked during shutdown");
        }
    }
    if !handle.shutdown() {
        warn!("Coordinator already stopped");
    }
    if coordinator.join().is_err() {
        warn!("Coordinator thread panicked");
    }
    info!("miner daemon stopped");
}
