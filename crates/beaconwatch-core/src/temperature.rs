//! Receiver self-monitoring: periodically publishes the host CPU
//! temperature on its own path, next to the beacon readings.

use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, error, info, warn};

use crate::config::{ProbeKind, TemperatureConfig};
use crate::controller::LifecycleState;
use crate::error::{ControllerError, ProbeError};
use crate::gateway::{GatewayConnector, PublishGateway, RunStatus};
use crate::signal::StopSignal;

/// A source of the host temperature in degrees Celsius.
pub trait TemperatureProbe: Send + Sync {
    fn name(&self) -> &'static str;

    fn read_celsius(&self) -> Result<f64, ProbeError>;
}

/// Linux thermal zone, reported in millidegrees.
#[derive(Debug, Clone)]
pub struct ThermalZoneProbe {
    path: PathBuf,
}

impl ThermalZoneProbe {
    pub const DEFAULT_PATH: &'static str = "/sys/class/thermal/thermal_zone0/temp";

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for ThermalZoneProbe {
    fn default() -> Self {
        Self::new(Self::DEFAULT_PATH)
    }
}

impl TemperatureProbe for ThermalZoneProbe {
    fn name(&self) -> &'static str {
        "thermal_zone"
    }

    fn read_celsius(&self) -> Result<f64, ProbeError> {
        parse_millidegrees(&fs::read_to_string(&self.path)?)
    }
}

/// Raspberry Pi firmware query.
#[derive(Debug, Clone, Default)]
pub struct VcgencmdProbe;

impl TemperatureProbe for VcgencmdProbe {
    fn name(&self) -> &'static str {
        "vcgencmd"
    }

    fn read_celsius(&self) -> Result<f64, ProbeError> {
        let output = Command::new("vcgencmd").arg("measure_temp").output()?;
        if !output.status.success() {
            return Err(ProbeError::Parse(format!(
                "vcgencmd exited with {}",
                output.status
            )));
        }
        parse_vcgencmd(&String::from_utf8_lossy(&output.stdout))
    }
}

/// `48312\n` → 48.312
pub fn parse_millidegrees(text: &str) -> Result<f64, ProbeError> {
    text.trim()
        .parse::<i64>()
        .map(|m| m as f64 / 1000.0)
        .map_err(|_| ProbeError::Parse(text.trim().to_string()))
}

/// `temp=48.3'C` → 48.3
pub fn parse_vcgencmd(text: &str) -> Result<f64, ProbeError> {
    let line = text.trim();
    line.strip_prefix("temp=")
        .and_then(|rest| rest.strip_suffix("'C"))
        .and_then(|v| v.parse::<f64>().ok())
        .ok_or_else(|| ProbeError::Parse(line.to_string()))
}

pub fn probe_for(kind: ProbeKind) -> Arc<dyn TemperatureProbe> {
    match kind {
        ProbeKind::ThermalZone => Arc::new(ThermalZoneProbe::default()),
        ProbeKind::Vcgencmd => Arc::new(VcgencmdProbe),
    }
}

struct Wiring {
    config: TemperatureConfig,
    gateway: Arc<dyn PublishGateway>,
    probe: Arc<dyn TemperatureProbe>,
}

/// Gateway and probe resolved for a configuration, not yet installed.
pub struct PreparedTemperature {
    wiring: Wiring,
}

struct ActiveRun {
    stop: StopSignal,
    handle: JoinHandle<()>,
}

/// Periodic temperature publisher with the same lifecycle as the beacon
/// [`Controller`](crate::Controller).
pub struct TemperatureReporter {
    connector: Arc<dyn GatewayConnector>,
    probe_override: Option<Arc<dyn TemperatureProbe>>,
    wiring: Option<Wiring>,
    run: Option<ActiveRun>,
}

impl TemperatureReporter {
    pub fn new(connector: Arc<dyn GatewayConnector>) -> Self {
        Self {
            connector,
            probe_override: None,
            wiring: None,
            run: None,
        }
    }

    /// Use `probe` regardless of what the configuration asks for.
    pub fn with_probe(mut self, probe: Arc<dyn TemperatureProbe>) -> Self {
        self.probe_override = Some(probe);
        self
    }

    pub fn state(&self) -> LifecycleState {
        if self.run.is_some() {
            LifecycleState::Running
        } else {
            LifecycleState::Idle
        }
    }

    pub fn is_configured(&self) -> bool {
        self.wiring.is_some()
    }

    pub fn configuration(&self) -> Option<&TemperatureConfig> {
        self.wiring.as_ref().map(|w| &w.config)
    }

    pub fn reload_configuration(&mut self, config: TemperatureConfig) -> Result<(), ControllerError> {
        if self.run.is_some() {
            return Err(ControllerError::ReloadWhileRunning);
        }
        let prepared = self.prepare_configuration(config)?;
        self.install_configuration(prepared)
    }

    /// Connect the gateway for `config` without touching the loaded one.
    pub fn prepare_configuration(
        &self,
        config: TemperatureConfig,
    ) -> Result<PreparedTemperature, ControllerError> {
        let gateway: Arc<dyn PublishGateway> = Arc::from(self.connector.connect(
            &config.publish_target,
            &config.topic_prefix,
            &config.path,
        )?);
        let probe = self
            .probe_override
            .clone()
            .unwrap_or_else(|| probe_for(config.probe));
        Ok(PreparedTemperature {
            wiring: Wiring {
                config,
                gateway,
                probe,
            },
        })
    }

    pub fn install_configuration(
        &mut self,
        prepared: PreparedTemperature,
    ) -> Result<(), ControllerError> {
        if self.run.is_some() {
            return Err(ControllerError::ReloadWhileRunning);
        }
        let wiring = &prepared.wiring;
        info!(
            "temperature: {} -> {}:{} every {} ms",
            wiring.probe.name(),
            wiring.config.path,
            wiring.config.field,
            wiring.config.frequency.as_millis()
        );
        self.wiring = Some(prepared.wiring);
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), ControllerError> {
        if self.run.is_some() {
            return Err(ControllerError::AlreadyRunning);
        }
        let wiring = self.wiring.as_ref().ok_or(ControllerError::NotConfigured)?;
        publish_status(wiring.gateway.as_ref(), RunStatus::Running);

        let stop = StopSignal::new();
        let loop_stop = stop.clone();
        let gateway = Arc::clone(&wiring.gateway);
        let probe = Arc::clone(&wiring.probe);
        let field = wiring.config.field.clone();
        let frequency = wiring.config.frequency;
        let handle = thread::Builder::new()
            .name("temperature".to_string())
            .spawn(move || {
                loop {
                    sample_once(probe.as_ref(), gateway.as_ref(), &field);
                    if loop_stop.wait_timeout(frequency) {
                        break;
                    }
                }
                debug!("temperature loop stopped");
            })
            .map_err(ControllerError::Spawn)?;

        self.run = Some(ActiveRun { stop, handle });
        Ok(())
    }

    /// Always safe; announces NOT_RUNNING whenever a configuration exists.
    pub fn stop(&mut self) {
        if let Some(run) = self.run.take() {
            run.stop.stop();
            if run.handle.join().is_err() {
                error!("temperature loop panicked");
            }
        }
        if let Some(wiring) = &self.wiring {
            publish_status(wiring.gateway.as_ref(), RunStatus::NotRunning);
        }
    }
}

impl Drop for TemperatureReporter {
    fn drop(&mut self) {
        if self.run.is_some() {
            self.stop();
        }
    }
}

fn publish_status(gateway: &dyn PublishGateway, status: RunStatus) {
    let payload = gateway.create_status_payload(status);
    if let Err(e) = gateway.publish_status(&payload) {
        error!("temperature status {status} not published: {e}");
    }
}

fn sample_once(probe: &dyn TemperatureProbe, gateway: &dyn PublishGateway, field: &str) -> bool {
    let celsius = match probe.read_celsius() {
        Ok(c) => c,
        Err(e) => {
            warn!("{} read failed: {e}", probe.name());
            return false;
        }
    };
    let published = gateway
        .create_value(field, celsius)
        .and_then(|value| gateway.publish_values(vec![value]));
    match published {
        Ok(()) => {
            debug!("temperature {celsius} published to {}:{field}", gateway.path());
            true
        }
        Err(e) => {
            error!("temperature {celsius} on {}:{field} not published: {e}", gateway.path());
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::Channel;
    use crate::testing::RecordingConnector;
    use std::io::Write;
    use std::sync::Mutex;
    use std::time::Duration;

    struct Fixed(Mutex<Vec<Result<f64, ProbeError>>>);

    impl TemperatureProbe for Fixed {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn read_celsius(&self) -> Result<f64, ProbeError> {
            let mut readings = self.0.lock().unwrap();
            if readings.len() > 1 {
                readings.remove(0)
            } else {
                match &readings[0] {
                    Ok(v) => Ok(*v),
                    Err(_) => Err(ProbeError::Parse("exhausted".to_string())),
                }
            }
        }
    }

    fn config() -> TemperatureConfig {
        TemperatureConfig {
            path: "lab/receiver-1".to_string(),
            field: "cpu_temp".to_string(),
            frequency: Duration::from_millis(50),
            publish_target: "broker:1883".parse().unwrap(),
            topic_prefix: "sdw".to_string(),
            probe: ProbeKind::ThermalZone,
        }
    }

    // -----------------------------------------------------------------------
    // Probe parsing
    // -----------------------------------------------------------------------

    #[test]
    fn parses_vcgencmd_output() {
        assert_eq!(parse_vcgencmd("temp=48.3'C\n").unwrap(), 48.3);
        assert!(parse_vcgencmd("error").is_err());
        assert!(parse_vcgencmd("temp=hot'C").is_err());
    }

    #[test]
    fn parses_thermal_zone_millidegrees() {
        assert_eq!(parse_millidegrees("48312\n").unwrap(), 48.312);
        assert!(parse_millidegrees("").is_err());
    }

    #[test]
    fn thermal_zone_probe_reads_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "51000").unwrap();
        let probe = ThermalZoneProbe::new(f.path());
        assert_eq!(probe.read_celsius().unwrap(), 51.0);
        assert!(ThermalZoneProbe::new("/nonexistent/zone").read_celsius().is_err());
    }

    // -----------------------------------------------------------------------
    // Reporter lifecycle
    // -----------------------------------------------------------------------

    #[test]
    fn start_requires_configuration() {
        let mut r = TemperatureReporter::new(Arc::new(RecordingConnector::new()));
        assert!(matches!(r.start(), Err(ControllerError::NotConfigured)));
    }

    #[test]
    fn publishes_readings_and_skips_failed_probes() {
        let connector = RecordingConnector::new();
        let probe = Arc::new(Fixed(Mutex::new(vec![
            Ok(45.5),
            Err(ProbeError::Parse("glitch".to_string())),
            Ok(46.0),
        ])));
        let mut r = TemperatureReporter::new(Arc::new(connector.clone())).with_probe(probe);
        r.reload_configuration(config()).unwrap();
        r.start().unwrap();
        assert_eq!(r.state(), LifecycleState::Running);
        std::thread::sleep(Duration::from_millis(180));
        r.stop();
        assert_eq!(r.state(), LifecycleState::Idle);

        let values = connector.published_on("lab/receiver-1", Channel::Value);
        assert!(values.len() >= 2);
        assert_eq!(values[0].body["values"][0]["amount"], 45.5);
        assert_eq!(values[0].body["values"][0]["field"], "cpu_temp");
        assert_eq!(values[1].body["values"][0]["amount"], 46.0);

        let status = connector.published_on("lab/receiver-1", Channel::Status);
        assert_eq!(status.first().unwrap().body["status"], "RUNNING");
        assert_eq!(status.last().unwrap().body["status"], "NOT_RUNNING");
    }

    #[test]
    fn reload_refused_while_running() {
        let probe = Arc::new(Fixed(Mutex::new(vec![Ok(40.0)])));
        let mut r =
            TemperatureReporter::new(Arc::new(RecordingConnector::new())).with_probe(probe);
        r.reload_configuration(config()).unwrap();
        r.start().unwrap();
        assert!(matches!(
            r.reload_configuration(config()),
            Err(ControllerError::ReloadWhileRunning)
        ));
        r.stop();
    }
}
