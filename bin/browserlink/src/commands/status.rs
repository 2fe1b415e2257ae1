use super::load_config;

pub async fn run() -> anyhow::Result<()> {
    let (paths, config) = load_config()?;

    println!("browserlink status");
    println!("==================");
    println!();

    let config_path = paths.config_file();
    println!(
        "Config:    {} {}",
        config_path.display(),
        if config_path.exists() { "✓" } else { "✗ (defaults)" }
    );

    let captures = config.daemon.capture_dir(&paths);
    println!(
        "Captures:  {} {}",
        captures.display(),
        if captures.exists() { "✓" } else { "✗ (created on first capture)" }
    );
    println!();

    println!("Session:");
    println!("  server:   {}", config.session.server_url);
    println!(
        "  agent:    {} ({})",
        config.session.agent_name, config.session.agent_type
    );
    println!("  timeout:  {}s", config.session.request_timeout_secs);
    println!();

    let ports: Vec<String> = config
        .daemon
        .candidate_ports
        .iter()
        .map(|p| p.to_string())
        .collect();
    println!("Daemon:");
    println!("  debug:    {} [{}]", config.daemon.debug_host, ports.join(", "));
    println!("  capture:  {}s timeout", config.daemon.capture_timeout_secs);
    println!(
        "  reconnect: {}, forward logs: {}",
        if config.daemon.auto_reconnect { "on" } else { "off" },
        if config.daemon.forward_logs { "on" } else { "off" }
    );

    Ok(())
}
