use beaconwatch_core::{LoadedConfig, RunConfiguration, TemperatureConfig};

pub fn run(config_path: &str) {
    let loaded = super::load_config(config_path);
    print!("{}", render(&loaded));
}

fn render(loaded: &LoadedConfig) -> String {
    let mut out = format!(
        "Configuration version {}\n",
        loaded.version.as_deref().unwrap_or("(none)")
    );
    match &loaded.beacons {
        Some(b) => out.push_str(&render_beacons(b)),
        None => out.push_str("\nNo beacons section.\n"),
    }
    if let Some(t) = &loaded.temperature {
        out.push_str(&render_temperature(t));
    }
    out
}

fn render_beacons(b: &RunConfiguration) -> String {
    let mut out = String::new();
    out.push_str(&format!("\nBeacons: {}\n", b.name));
    out.push_str(&format!("  Mode:       {}\n", b.mode));
    out.push_str(&format!("  Window:     {} ms\n", b.frequency.as_millis()));
    out.push_str(&format!("  Namespace:  {}\n", b.namespace()));
    out.push_str(&format!("  Broker:     {}\n", b.publish_target));
    out.push_str(&format!("  Topics:     {}/<path>/{{value,status}}\n", b.topic_prefix));
    out.push('\n');
    out.push_str(&format!("  {:<16} {:<28} {}\n", "Sensor", "Path", "Field"));
    out.push_str(&format!("  {:<16} {:<28} {}\n", "------", "----", "-----"));
    for s in b.mapping.tracked() {
        out.push_str(&format!(
            "  {:<16} {:<28} {}\n",
            s.source_id, s.target.path, s.target.field
        ));
    }
    out
}

fn render_temperature(t: &TemperatureConfig) -> String {
    format!(
        "\nTemperature\n  Target:     {}:{}\n  Every:      {} ms\n  Probe:      {:?}\n  Broker:     {}\n",
        t.path,
        t.field,
        t.frequency.as_millis(),
        t.probe,
        t.publish_target
    )
}
