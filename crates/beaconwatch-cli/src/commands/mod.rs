pub mod check;
pub mod run;
pub mod serve;

use std::sync::Arc;

use beaconwatch_core::{
    ConfigDocument, LoadedConfig, MqttConnector, ReplayScanner, ReplaySource,
};

/// `info` unless `filter` or `RUST_LOG` says otherwise. Logs go to stderr so
/// stdout stays free for command output.
pub fn init_logging(filter: Option<&str>) {
    let mut builder = match filter {
        Some(f) => {
            let mut b = env_logger::Builder::new();
            b.parse_filters(f);
            b
        }
        None => env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")),
    };
    builder.target(env_logger::Target::Stderr).init();
}

/// Read and validate a configuration document, exiting on failure.
pub fn load_config(path: &str) -> LoadedConfig {
    match ConfigDocument::from_path(path).and_then(|doc| doc.validate()) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}

pub fn make_scanner(events: &str, repeat: bool) -> ReplayScanner {
    ReplayScanner::new(ReplaySource::parse(events)).repeat(repeat)
}

pub fn make_connector() -> Arc<MqttConnector> {
    Arc::new(MqttConnector::new())
}
