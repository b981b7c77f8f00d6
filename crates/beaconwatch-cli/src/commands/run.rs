use std::time::Duration;

use beaconwatch_core::{Controller, StopSignal, TemperatureReporter};
use log::{info, warn};

/// How often the foreground loop logs a status line.
const STATUS_INTERVAL: Duration = Duration::from_secs(60);

pub struct RunCommandConfig<'a> {
    pub config_path: &'a str,
    pub events: &'a str,
    pub repeat: bool,
    pub temperature: bool,
}

pub fn run(cfg: RunCommandConfig<'_>) {
    let loaded = super::load_config(cfg.config_path);
    let Some(beacons) = loaded.beacons else {
        eprintln!("Error: {} has no `beacons` section", cfg.config_path);
        std::process::exit(1);
    };
    let connector = super::make_connector();
    let scanner = super::make_scanner(cfg.events, cfg.repeat);

    let mut controller =
        match Controller::with_configuration(Box::new(scanner), connector.clone(), beacons) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Error: {e}");
                std::process::exit(1);
            }
        };

    let mut reporter = TemperatureReporter::new(connector);
    let temperature = match loaded.temperature {
        Some(t) if cfg.temperature => match reporter.reload_configuration(t) {
            Ok(()) => true,
            Err(e) => {
                warn!("temperature reporter disabled: {e}");
                false
            }
        },
        _ => false,
    };

    let shutdown = StopSignal::new();
    let signal = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || signal.stop()) {
        eprintln!("Error setting Ctrl+C handler: {e}");
        std::process::exit(1);
    }

    if let Err(e) = controller.start() {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
    if temperature {
        if let Err(e) = reporter.start() {
            warn!("temperature reporter not started: {e}");
        }
    }
    info!(
        "running config version {} (Ctrl+C to stop)",
        loaded.version.as_deref().unwrap_or("unversioned")
    );

    while !shutdown.wait_timeout(STATUS_INTERVAL) {
        let status = controller.status();
        info!(
            "{} cycles, {} published, {} failed, {} samples accepted, {} unknown dropped",
            status.cycles.cycles,
            status.cycles.published,
            status.cycles.publish_failures,
            status.ingest.accepted,
            status.ingest.dropped_unknown
        );
    }

    info!("shutting down");
    controller.stop();
    if temperature {
        reporter.stop();
    }
}
