//! HTTP control surface for a beaconwatch receiver.
//!
//! ```text
//! GET  /                      running status and config version
//! POST /config                load a configuration document (JSON)
//! GET  /start/{all|beacons|temperature}
//! GET  /stop/{all|beacons|temperature}
//! ```
//!
//! Every mutating endpoint answers `{"status": "success"}` or
//! `{"status": "failure", "reason": …}`.

pub mod checkin;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
};
use log::{info, warn};
use serde::Serialize;
use tokio::sync::Mutex;

use beaconwatch_core::{
    ConfigDocument, ConfigError, Controller, ControllerError, ControllerStatus, LifecycleState,
    TemperatureReporter,
};

/// Which component a start/stop request addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    All,
    Beacons,
    Temperature,
}

impl Target {
    fn beacons(self) -> bool {
        matches!(self, Self::All | Self::Beacons)
    }

    fn temperature(self) -> bool {
        matches!(self, Self::All | Self::Temperature)
    }
}

impl FromStr for Target {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(Self::All),
            "beacons" => Ok(Self::Beacons),
            "temperature" => Ok(Self::Temperature),
            other => Err(format!(
                "unknown target `{other}` (expected all, beacons or temperature)"
            )),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::All => "all",
            Self::Beacons => "beacons",
            Self::Temperature => "temperature",
        })
    }
}

struct Components {
    beacons: Controller,
    temperature: TemperatureReporter,
    version: Option<String>,
}

/// Application context handed to every handler. Owns the one beacon
/// controller and the one temperature reporter of this process.
#[derive(Clone)]
pub struct AppContext {
    components: Arc<Mutex<Components>>,
    stash: Option<PathBuf>,
}

/// A refused request: HTTP status plus the reason reported to the client.
#[derive(Debug)]
pub struct Refusal {
    pub code: StatusCode,
    pub reason: String,
}

impl Refusal {
    fn conflict(reason: impl Into<String>) -> Self {
        Self {
            code: StatusCode::CONFLICT,
            reason: reason.into(),
        }
    }

    fn bad_request(reason: impl Into<String>) -> Self {
        Self {
            code: StatusCode::BAD_REQUEST,
            reason: reason.into(),
        }
    }
}

impl From<ControllerError> for Refusal {
    fn from(e: ControllerError) -> Self {
        match e {
            ControllerError::NotConfigured => Self::conflict("No configuration loaded"),
            ControllerError::Config(e) => Self::bad_request(e.to_string()),
            ControllerError::Spawn(_) | ControllerError::Publish(_) => Self {
                code: StatusCode::INTERNAL_SERVER_ERROR,
                reason: e.to_string(),
            },
            other => Self::conflict(other.to_string()),
        }
    }
}

impl From<ConfigError> for Refusal {
    fn from(e: ConfigError) -> Self {
        Self::bad_request(e.to_string())
    }
}

#[derive(Debug, Serialize)]
pub struct ComponentStates {
    pub beacons: &'static str,
    pub temperature: &'static str,
}

/// Body of `GET /`.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub status: ComponentStates,
    pub version: Option<String>,
    pub beacons: ControllerStatus,
}

fn label(state: LifecycleState) -> &'static str {
    match state {
        LifecycleState::Running => "running",
        LifecycleState::Idle => "stopped",
    }
}

impl AppContext {
    pub fn new(beacons: Controller, temperature: TemperatureReporter) -> Self {
        Self {
            components: Arc::new(Mutex::new(Components {
                beacons,
                temperature,
                version: None,
            })),
            stash: None,
        }
    }

    /// Persist every accepted configuration to `path`.
    pub fn with_stash(mut self, path: impl Into<PathBuf>) -> Self {
        self.stash = Some(path.into());
        self
    }

    /// Load the stashed configuration, if any, and check in with the fleet
    /// controller it names. A missing or invalid stash and a failed check-in
    /// are logged and otherwise ignored.
    pub async fn load_stash(&self) {
        let Some(path) = &self.stash else {
            return;
        };
        if !path.exists() {
            info!("no stashed configuration at {}", path.display());
            return;
        }
        let loaded = match ConfigDocument::from_path(path) {
            Ok(doc) => {
                checkin::check_in(&doc).await;
                self.apply(doc, false).await
            }
            Err(e) => Err(e.into()),
        };
        match loaded {
            Ok(()) => info!("restored configuration from {}", path.display()),
            Err(r) => warn!("stashed configuration not loaded: {}", r.reason),
        }
    }

    pub async fn status(&self) -> StatusReport {
        let c = self.components.lock().await;
        StatusReport {
            status: ComponentStates {
                beacons: label(c.beacons.state()),
                temperature: label(c.temperature.state()),
            },
            version: c.version.clone(),
            beacons: c.beacons.status(),
        }
    }

    /// Validate `doc` and hand each present section to its component.
    pub async fn apply_config(&self, doc: ConfigDocument) -> Result<(), Refusal> {
        self.apply(doc, true).await
    }

    async fn apply(&self, doc: ConfigDocument, persist: bool) -> Result<(), Refusal> {
        let loaded = doc.validate()?;
        if loaded.beacons.is_none() && loaded.temperature.is_none() {
            return Err(Refusal::bad_request(
                "configuration has neither a beacons nor a temperature section",
            ));
        }

        let mut c = self.components.lock().await;
        if c.beacons.state() == LifecycleState::Running
            || c.temperature.state() == LifecycleState::Running
        {
            return Err(Refusal::conflict("stop all components before reloading"));
        }
        // nothing is installed until every section has connected
        let beacons = loaded
            .beacons
            .map(|b| c.beacons.prepare_configuration(b))
            .transpose()?;
        let temperature = loaded
            .temperature
            .map(|t| c.temperature.prepare_configuration(t))
            .transpose()?;
        if let Some(path) = self.stash.as_ref().filter(|_| persist) {
            doc.save_json(path)?;
        }

        if let Some(prepared) = beacons {
            c.beacons.install_configuration(prepared)?;
        }
        if let Some(prepared) = temperature {
            c.temperature.install_configuration(prepared)?;
        }
        c.version = loaded.version;
        info!("configuration version {:?} loaded", c.version);
        Ok(())
    }

    pub async fn start(&self, target: Target) -> Result<(), Refusal> {
        let mut c = self.components.lock().await;
        let wants_beacons = target.beacons() && (target != Target::All || c.beacons.is_configured());
        let wants_temperature =
            target.temperature() && (target != Target::All || c.temperature.is_configured());
        if !wants_beacons && !wants_temperature {
            return Err(ControllerError::NotConfigured.into());
        }
        if wants_beacons {
            c.beacons.start()?;
        }
        if wants_temperature {
            if let Err(e) = c.temperature.start() {
                if wants_beacons {
                    c.beacons.stop();
                }
                return Err(e.into());
            }
        }
        info!("started {target}");
        Ok(())
    }

    pub async fn stop(&self, target: Target) {
        let mut c = self.components.lock().await;
        if target.beacons() {
            c.beacons.stop();
        }
        if target.temperature() {
            c.temperature.stop();
        }
        info!("stopped {target}");
    }
}

#[derive(Debug, Serialize)]
struct Outcome {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

type Reply = (StatusCode, Json<Outcome>);

fn reply(result: Result<(), Refusal>) -> Reply {
    match result {
        Ok(()) => (
            StatusCode::OK,
            Json(Outcome {
                status: "success",
                reason: None,
            }),
        ),
        Err(r) => {
            warn!("request refused: {}", r.reason);
            (
                r.code,
                Json(Outcome {
                    status: "failure",
                    reason: Some(r.reason),
                }),
            )
        }
    }
}

async fn handle_index(State(ctx): State<AppContext>) -> Json<StatusReport> {
    Json(ctx.status().await)
}

async fn handle_config(State(ctx): State<AppContext>, body: String) -> Reply {
    let result = match ConfigDocument::from_json_str(&body) {
        Ok(doc) => ctx.apply_config(doc).await,
        Err(e) => Err(e.into()),
    };
    reply(result)
}

async fn handle_start(State(ctx): State<AppContext>, Path(target): Path<String>) -> Reply {
    let result = match target.parse::<Target>() {
        Ok(target) => ctx.start(target).await,
        Err(reason) => Err(Refusal::bad_request(reason)),
    };
    reply(result)
}

async fn handle_stop(State(ctx): State<AppContext>, Path(target): Path<String>) -> Reply {
    let result = match target.parse::<Target>() {
        Ok(target) => {
            ctx.stop(target).await;
            Ok(())
        }
        Err(reason) => Err(Refusal::bad_request(reason)),
    };
    reply(result)
}

/// Build the axum router.
pub fn build_router(ctx: AppContext) -> Router {
    Router::new()
        .route("/", get(handle_index))
        .route("/config", post(handle_config))
        .route("/start/{target}", get(handle_start))
        .route("/stop/{target}", get(handle_stop))
        .with_state(ctx)
}

/// Serve the control surface until the listener fails.
pub async fn run_server(ctx: AppContext, host: &str, port: u16) -> std::io::Result<()> {
    ctx.load_stash().await;
    let app = build_router(ctx);
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("control surface listening on http://{addr}");
    axum::serve(listener, app).await
}
