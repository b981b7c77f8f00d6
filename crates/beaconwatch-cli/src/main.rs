//! CLI for beaconwatch: windowed RSSI aggregation for Eddystone beacons.

mod commands;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "beaconwatch")]
#[command(about = "beaconwatch: Eddystone RSSI windows published to MQTT")]
#[command(version = beaconwatch_core::VERSION)]
struct Cli {
    /// Log filter (overrides RUST_LOG), e.g. `debug` or `beaconwatch_core=trace`
    #[arg(long, global = true)]
    log: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the receiver in the foreground until Ctrl+C
    Run {
        /// Configuration document (JSON, or YAML for .yaml/.yml)
        #[arg(long)]
        config: String,

        /// JSON-lines detection feed, `-` for stdin
        #[arg(long, default_value = "-")]
        events: String,

        /// Start over from the top when the feed file ends
        #[arg(long)]
        repeat: bool,

        /// Do not start the temperature reporter even if configured
        #[arg(long)]
        no_temperature: bool,
    },

    /// Serve the HTTP control surface
    Serve {
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        #[arg(long, default_value = "5000")]
        port: u16,

        /// File the last accepted configuration is kept in and restored from
        #[arg(long)]
        stash: Option<String>,

        /// JSON-lines detection feed, `-` for stdin
        #[arg(long, default_value = "-")]
        events: String,
    },

    /// Validate a configuration document and print its sensor table
    Check {
        #[arg(long)]
        config: String,
    },
}

fn main() {
    let cli = Cli::parse();
    commands::init_logging(cli.log.as_deref());

    match cli.command {
        Commands::Run {
            config,
            events,
            repeat,
            no_temperature,
        } => commands::run::run(commands::run::RunCommandConfig {
            config_path: &config,
            events: &events,
            repeat,
            temperature: !no_temperature,
        }),
        Commands::Serve {
            host,
            port,
            stash,
            events,
        } => commands::serve::run(&host, port, stash.as_deref(), &events),
        Commands::Check { config } => commands::check::run(&config),
    }
}
