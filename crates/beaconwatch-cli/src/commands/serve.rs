use beaconwatch_core::{Controller, TemperatureReporter};
use beaconwatch_server::AppContext;

pub fn run(host: &str, port: u16, stash: Option<&str>, events: &str) {
    let connector = super::make_connector();
    let controller = Controller::new(
        Box::new(super::make_scanner(events, false)),
        connector.clone(),
    );
    let mut ctx = AppContext::new(controller, TemperatureReporter::new(connector));
    if let Some(path) = stash {
        ctx = ctx.with_stash(path);
    }

    let base = format!("http://{host}:{port}");
    println!("beaconwatch v{}", beaconwatch_core::VERSION);
    println!("   {base}");
    println!();
    println!("   Endpoints:");
    println!("     GET  /                      Running status and config version");
    println!("     POST /config                Load a configuration document");
    println!("     GET  /start/{{target}}        target: all, beacons, temperature");
    println!("     GET  /stop/{{target}}");
    println!();
    println!("   Examples:");
    println!("     curl -X POST --data @config.json -H 'Content-Type: application/json' {base}/config");
    println!("     curl {base}/start/all");
    println!();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error starting runtime: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = rt.block_on(beaconwatch_server::run_server(ctx, host, port)) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
