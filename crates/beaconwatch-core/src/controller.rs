//! Lifecycle controller: `Idle --start--> Running --stop--> Idle`.
//!
//! While running, two threads touch shared state:
//!
//! - the scanner's delivery thread, feeding a [`SampleIngester`];
//! - the report loop spawned here, which opens a window, waits one
//!   interval on a [`StopSignal`] and publishes one statistic per tracked
//!   beacon.
//!
//! They only meet inside the [`Aggregator`]'s per-path locks. Publishing
//! happens on the report loop after the window has been copied out.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::Serialize;

use crate::aggregator::{Aggregator, Mode, WindowedStat};
use crate::config::RunConfiguration;
use crate::eddystone::NamespaceFilter;
use crate::error::{ControllerError, ScanError};
use crate::gateway::{GatewayConnector, PublisherSet, RunStatus};
use crate::ingest::{IngestSnapshot, SampleIngester};
use crate::mapping::SensorMapping;
use crate::scanner::{DetectionSink, ScanningCapability};
use crate::signal::StopSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Idle,
    Running,
}

/// Report-loop counters, reset on every start.
#[derive(Debug, Default)]
pub struct CycleStats {
    cycles: AtomicU64,
    published: AtomicU64,
    publish_failures: AtomicU64,
    skipped_empty: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleSnapshot {
    pub cycles: u64,
    pub published: u64,
    pub publish_failures: u64,
    pub skipped_empty: u64,
}

impl CycleStats {
    pub fn snapshot(&self) -> CycleSnapshot {
        CycleSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            skipped_empty: self.skipped_empty.load(Ordering::Relaxed),
        }
    }
}

/// What `GET /` and `beaconwatch run` report.
#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub state: LifecycleState,
    pub configured: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_ms: Option<u64>,
    pub tracked: usize,
    pub cycles: CycleSnapshot,
    pub ingest: IngestSnapshot,
}

/// Everything built from one configuration load. Replaced wholesale.
struct Wiring {
    config: RunConfiguration,
    mapping: Arc<SensorMapping>,
    aggregator: Arc<Aggregator>,
    publishers: Arc<PublisherSet>,
}

/// Wiring connected for a configuration but not yet installed.
pub struct PreparedConfiguration {
    wiring: Wiring,
}

struct ActiveRun {
    stop: StopSignal,
    handle: JoinHandle<()>,
    ingester: Arc<SampleIngester>,
}

/// Owns one scanner and one report loop.
pub struct Controller {
    scanner: Box<dyn ScanningCapability>,
    connector: Arc<dyn GatewayConnector>,
    wiring: Option<Wiring>,
    run: Option<ActiveRun>,
    cycles: Arc<CycleStats>,
    last_ingest: IngestSnapshot,
}

impl Controller {
    pub fn new(scanner: Box<dyn ScanningCapability>, connector: Arc<dyn GatewayConnector>) -> Self {
        Self {
            scanner,
            connector,
            wiring: None,
            run: None,
            cycles: Arc::new(CycleStats::default()),
            last_ingest: IngestSnapshot::default(),
        }
    }

    /// Build a controller with `config` already loaded.
    pub fn with_configuration(
        scanner: Box<dyn ScanningCapability>,
        connector: Arc<dyn GatewayConnector>,
        config: RunConfiguration,
    ) -> Result<Self, ControllerError> {
        let mut controller = Self::new(scanner, connector);
        controller.reload_configuration(config)?;
        Ok(controller)
    }

    pub fn state(&self) -> LifecycleState {
        if self.run.is_some() {
            LifecycleState::Running
        } else {
            LifecycleState::Idle
        }
    }

    pub fn is_running(&self) -> bool {
        self.run.is_some()
    }

    pub fn is_configured(&self) -> bool {
        self.wiring.is_some()
    }

    pub fn configuration(&self) -> Option<&RunConfiguration> {
        self.wiring.as_ref().map(|w| &w.config)
    }

    /// Replace mapping, mode, frequency and publisher wiring. Idle only.
    pub fn reload_configuration(&mut self, config: RunConfiguration) -> Result<(), ControllerError> {
        if self.run.is_some() {
            return Err(ControllerError::ReloadWhileRunning);
        }
        let prepared = self.prepare_configuration(config)?;
        self.install_configuration(prepared)
    }

    /// Connect publishers for `config` without touching the loaded wiring.
    pub fn prepare_configuration(
        &self,
        config: RunConfiguration,
    ) -> Result<PreparedConfiguration, ControllerError> {
        let paths = config.mapping.paths();
        let publishers = PublisherSet::connect(
            &config.name,
            self.connector.as_ref(),
            &config.publish_target,
            &config.topic_prefix,
            &paths,
        )?;
        Ok(PreparedConfiguration {
            wiring: Wiring {
                mapping: Arc::new(config.mapping.clone()),
                aggregator: Arc::new(Aggregator::new(paths)),
                publishers: Arc::new(publishers),
                config,
            },
        })
    }

    /// Swap in wiring built by [`prepare_configuration`](Self::prepare_configuration).
    pub fn install_configuration(
        &mut self,
        prepared: PreparedConfiguration,
    ) -> Result<(), ControllerError> {
        if self.run.is_some() {
            return Err(ControllerError::ReloadWhileRunning);
        }
        let config = &prepared.wiring.config;
        info!(
            "loaded configuration {:?}: mode {}, every {} ms, {} beacons on {} paths",
            config.name,
            config.mode,
            config.frequency.as_millis(),
            config.mapping.len(),
            prepared.wiring.publishers.len()
        );
        self.wiring = Some(prepared.wiring);
        Ok(())
    }

    /// Start the scanner, announce RUNNING and spawn the report loop.
    pub fn start(&mut self) -> Result<(), ControllerError> {
        if self.run.is_some() {
            return Err(ControllerError::AlreadyRunning);
        }
        let wiring = self.wiring.as_ref().ok_or(ControllerError::NotConfigured)?;
        if self.scanner.is_running() {
            return Err(ScanError::AlreadyRunning.into());
        }

        let filter = NamespaceFilter::new(wiring.config.namespace())?;
        let ingester = Arc::new(SampleIngester::new(
            Arc::clone(&wiring.mapping),
            Arc::clone(&wiring.aggregator),
        ));
        self.cycles = Arc::new(CycleStats::default());

        let report = ReportLoop {
            mode: wiring.config.mode,
            frequency: wiring.config.frequency,
            mapping: Arc::clone(&wiring.mapping),
            aggregator: Arc::clone(&wiring.aggregator),
            publishers: Arc::clone(&wiring.publishers),
            stats: Arc::clone(&self.cycles),
        };
        // Stale samples from a previous run must not leak into the first window.
        report.open_window();

        let sink: Arc<dyn DetectionSink> = ingester.clone();
        self.scanner.start(filter, sink)?;
        wiring.publishers.publish_status_all(RunStatus::Running);

        let stop = StopSignal::new();
        let loop_stop = stop.clone();
        let handle = match thread::Builder::new()
            .name("report-loop".to_string())
            .spawn(move || report.run(&loop_stop))
        {
            Ok(handle) => handle,
            Err(e) => {
                self.scanner.stop();
                wiring.publishers.publish_status_all(RunStatus::Error);
                return Err(ControllerError::Spawn(e));
            }
        };

        info!(
            "{} started, namespace {}",
            wiring.config.name,
            wiring.config.namespace()
        );
        self.run = Some(ActiveRun {
            stop,
            handle,
            ingester,
        });
        Ok(())
    }

    /// Stop the loop and the scanner, then announce NOT_RUNNING.
    ///
    /// Always safe. When idle it only repeats the NOT_RUNNING announcement,
    /// and only if a configuration has been loaded.
    pub fn stop(&mut self) {
        if let Some(run) = self.run.take() {
            run.stop.stop();
            if run.handle.join().is_err() {
                error!("report loop panicked");
            }
            self.last_ingest = run.ingester.stats();
            info!("report loop stopped");
        }
        if self.scanner.is_running() {
            self.scanner.stop();
        }
        if let Some(wiring) = &self.wiring {
            wiring.publishers.publish_status_all(RunStatus::NotRunning);
        }
    }

    pub fn status(&self) -> ControllerStatus {
        let config = self.configuration();
        ControllerStatus {
            state: self.state(),
            configured: config.is_some(),
            name: config.map(|c| c.name.clone()),
            mode: config.map(|c| c.mode),
            frequency_ms: config.map(|c| c.frequency.as_millis() as u64),
            tracked: config.map_or(0, |c| c.mapping.len()),
            cycles: self.cycles.snapshot(),
            ingest: self
                .run
                .as_ref()
                .map_or(self.last_ingest, |r| r.ingester.stats()),
        }
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        if self.run.is_some() {
            self.stop();
        }
    }
}

// ---------------------------------------------------------------------------
// Report loop
// ---------------------------------------------------------------------------

struct ReportLoop {
    mode: Mode,
    frequency: Duration,
    mapping: Arc<SensorMapping>,
    aggregator: Arc<Aggregator>,
    publishers: Arc<PublisherSet>,
    stats: Arc<CycleStats>,
}

impl ReportLoop {
    fn run(self, stop: &StopSignal) {
        debug!("report loop running every {} ms", self.frequency.as_millis());
        // A stop during the wait discards the partial window.
        while !stop.wait_timeout(self.frequency) {
            let window = self.close_window();
            self.publish_window(&window);
            self.stats.cycles.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn open_window(&self) {
        self.aggregator.reset_all(&self.mapping.paths());
    }

    /// Copy out every path's window and open the next one in the same step.
    fn close_window(&self) -> Vec<(String, WindowedStat)> {
        self.mapping
            .paths()
            .into_iter()
            .filter_map(|path| match self.aggregator.take(&path) {
                Ok(stat) => Some((path, stat)),
                Err(e) => {
                    error!("{e}: {path}");
                    None
                }
            })
            .collect()
    }

    fn publish_window(&self, window: &[(String, WindowedStat)]) {
        for sensor in self.mapping.tracked() {
            let Some((_, stat)) = window.iter().find(|(p, _)| *p == sensor.target.path) else {
                continue;
            };
            let Some(value) = stat.value(self.mode) else {
                self.stats.skipped_empty.fetch_add(1, Ordering::Relaxed);
                debug!("no samples from {} this window", sensor.source_id);
                continue;
            };
            match self
                .publishers
                .publish_reading(&sensor.source_id, &sensor.target, value)
            {
                Ok(()) => {
                    self.stats.published.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.stats.publish_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "{} {}:{} = {value} not published: {e}",
                        sensor.source_id, sensor.target.path, sensor.target.field
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerAddress;
    use crate::gateway::Channel;
    use crate::mapping::MappingEntry;
    use crate::testing::{ManualScanner, RecordingConnector};

    const NS: &str = "0xedd1ebeac04e5defa017";

    fn config(mode: Mode, frequency_ms: u64) -> RunConfiguration {
        let entries = [("0x0000000000a1", "lab/door"), ("0x0000000000a2", "lab/desk")]
            .iter()
            .map(|(sensor, path)| MappingEntry {
                sensor: sensor.to_string(),
                path: path.to_string(),
                field: "rssi".to_string(),
            })
            .collect::<Vec<_>>();
        RunConfiguration {
            name: "receiver-1".to_string(),
            mode,
            frequency: Duration::from_millis(frequency_ms),
            publish_target: "tcp://broker:1883".parse::<BrokerAddress>().unwrap(),
            topic_prefix: "sdw".to_string(),
            mapping: SensorMapping::new(NS, &entries).unwrap(),
        }
    }

    fn controller(cfg: RunConfiguration) -> (Controller, ManualScanner, RecordingConnector) {
        let scanner = ManualScanner::new();
        let connector = RecordingConnector::new();
        let c = Controller::with_configuration(
            Box::new(scanner.clone()),
            Arc::new(connector.clone()),
            cfg,
        )
        .unwrap();
        (c, scanner, connector)
    }

    fn report_loop(c: &Controller) -> ReportLoop {
        let w = c.wiring.as_ref().unwrap();
        ReportLoop {
            mode: w.config.mode,
            frequency: w.config.frequency,
            mapping: Arc::clone(&w.mapping),
            aggregator: Arc::clone(&w.aggregator),
            publishers: Arc::clone(&w.publishers),
            stats: Arc::clone(&c.cycles),
        }
    }

    fn statuses(connector: &RecordingConnector) -> Vec<String> {
        connector
            .published()
            .iter()
            .filter(|p| p.channel == Channel::Status)
            .map(|p| format!("{}={}", p.path, p.body["status"].as_str().unwrap()))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    #[test]
    fn start_without_configuration_is_refused() {
        let mut c = Controller::new(
            Box::new(ManualScanner::new()),
            Arc::new(RecordingConnector::new()),
        );
        assert!(matches!(c.start(), Err(ControllerError::NotConfigured)));
        assert_eq!(c.state(), LifecycleState::Idle);
    }

    #[test]
    fn stop_on_never_started_controller_announces_not_running_once_per_path() {
        let (mut c, scanner, connector) = controller(config(Mode::Mean, 1000));
        c.stop();
        let mut sent = statuses(&connector);
        sent.sort();
        assert_eq!(sent, vec!["lab/desk=NOT_RUNNING", "lab/door=NOT_RUNNING"]);
        assert_eq!(scanner.stops(), 0);
        assert_eq!(c.state(), LifecycleState::Idle);
    }

    #[test]
    fn stop_without_configuration_publishes_nothing() {
        let connector = RecordingConnector::new();
        let mut c = Controller::new(Box::new(ManualScanner::new()), Arc::new(connector.clone()));
        c.stop();
        assert!(connector.published().is_empty());
    }

    #[test]
    fn start_then_stop_round_trip() {
        let (mut c, scanner, connector) = controller(config(Mode::Mean, 60_000));
        c.start().unwrap();
        assert_eq!(c.state(), LifecycleState::Running);
        assert!(scanner.is_running());
        assert!(matches!(c.start(), Err(ControllerError::AlreadyRunning)));

        c.stop();
        assert_eq!(c.state(), LifecycleState::Idle);
        assert!(!scanner.is_running());
        assert_eq!(scanner.stops(), 1);

        let sent = statuses(&connector);
        assert_eq!(sent.len(), 4);
        assert!(sent[..2].iter().all(|s| s.ends_with("=RUNNING")));
        assert!(sent[2..].iter().all(|s| s.ends_with("=NOT_RUNNING")));
        // the interrupted window was discarded
        assert_eq!(c.status().cycles.cycles, 0);
    }

    #[test]
    fn busy_scanner_blocks_start() {
        let (mut c, mut scanner, _) = controller(config(Mode::Mean, 1000));
        struct Nothing;
        impl DetectionSink for Nothing {
            fn on_detection(&self, _: &crate::scanner::Detection) {}
        }
        scanner
            .start(NamespaceFilter::new(NS).unwrap(), Arc::new(Nothing))
            .unwrap();
        assert!(matches!(
            c.start(),
            Err(ControllerError::Scan(ScanError::AlreadyRunning))
        ));
        assert_eq!(c.state(), LifecycleState::Idle);
    }

    #[test]
    fn reload_is_refused_while_running() {
        let (mut c, _, _) = controller(config(Mode::Mean, 60_000));
        c.start().unwrap();
        assert!(matches!(
            c.reload_configuration(config(Mode::Max, 1000)),
            Err(ControllerError::ReloadWhileRunning)
        ));
        c.stop();
        c.reload_configuration(config(Mode::Max, 1000)).unwrap();
        assert_eq!(c.configuration().unwrap().mode, Mode::Max);
    }

    #[test]
    fn prepared_wiring_is_not_live_until_installed() {
        let (mut c, _, connector) = controller(config(Mode::Mean, 60_000));
        let prepared = c.prepare_configuration(config(Mode::Min, 1000)).unwrap();
        assert_eq!(c.configuration().unwrap().mode, Mode::Mean);

        connector.refuse_path("lab/desk");
        assert!(matches!(
            c.reload_configuration(config(Mode::Max, 1000)),
            Err(ControllerError::Publish(_))
        ));
        assert_eq!(c.configuration().unwrap().mode, Mode::Mean);

        c.install_configuration(prepared).unwrap();
        assert_eq!(c.configuration().unwrap().mode, Mode::Min);
    }

    #[test]
    fn samples_reach_the_aggregator_through_the_scanner() {
        let (mut c, scanner, _) = controller(config(Mode::Mean, 60_000));
        c.start().unwrap();
        assert!(scanner.emit_beacon(NS, "0x0000000000a1", -70));
        assert!(scanner.emit_beacon(NS, "0x00000000beef", -70));
        assert!(!scanner.emit_beacon("0x00000000000000000000", "0x0000000000a1", -70));

        let ingest = c.status().ingest;
        assert_eq!(ingest.accepted, 1);
        assert_eq!(ingest.dropped_unknown, 1);
        c.stop();
        assert_eq!(c.status().ingest.accepted, 1);
    }

    // -----------------------------------------------------------------------
    // Report cycle
    // -----------------------------------------------------------------------

    #[test]
    fn empty_window_skips_publication_for_that_beacon() {
        let (c, _, connector) = controller(config(Mode::Mean, 1000));
        let report = report_loop(&c);
        let agg = &c.wiring.as_ref().unwrap().aggregator;
        for v in [-70.0, -72.0, -68.0] {
            agg.update("lab/door", v);
        }

        let window = report.close_window();
        report.publish_window(&window);

        let values = connector.published_on("lab/door", Channel::Value);
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].body["values"][0]["amount"], -70.0);
        assert!(connector.published_on("lab/desk", Channel::Value).is_empty());

        let stats = c.cycles.snapshot();
        assert_eq!(stats.published, 1);
        assert_eq!(stats.skipped_empty, 1);
        // the next window starts empty
        assert!(agg.read("lab/door").unwrap().is_empty());
    }

    #[test]
    fn failing_path_does_not_stop_the_cycle() {
        let (c, _, connector) = controller(config(Mode::Last, 1000));
        connector.fail_path("lab/door");
        let report = report_loop(&c);
        let agg = &c.wiring.as_ref().unwrap().aggregator;
        agg.update("lab/door", -60.0);
        agg.update("lab/desk", -61.0);

        let window = report.close_window();
        report.publish_window(&window);

        let desk = connector.published_on("lab/desk", Channel::Value);
        assert_eq!(desk.len(), 1);
        assert_eq!(desk[0].body["values"][0]["amount"], -61.0);
        let stats = c.cycles.snapshot();
        assert_eq!(stats.published, 1);
        assert_eq!(stats.publish_failures, 1);
    }

    #[test]
    fn loop_publishes_each_elapsed_window() {
        let (mut c, scanner, connector) = controller(config(Mode::Max, 150));
        c.start().unwrap();
        scanner.emit_beacon(NS, "0x0000000000a2", -80);
        scanner.emit_beacon(NS, "0x0000000000a2", -75);
        std::thread::sleep(Duration::from_millis(400));
        c.stop();

        let desk = connector.published_on("lab/desk", Channel::Value);
        assert_eq!(desk.len(), 1);
        assert_eq!(desk[0].body["values"][0]["amount"], -75.0);
        assert_eq!(desk[0].body["values"][0]["attributes"]["beacon"], "0x0000000000a2");
        assert!(c.status().cycles.cycles >= 2);
    }
}
