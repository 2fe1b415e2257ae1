use browserlink_browser::{DaemonManager, DaemonState};

use super::load_config;

/// Start a daemon, take one screenshot, and stop it again.
pub async fn run(label: String, ports: Vec<u16>, target: Option<String>) -> anyhow::Result<()> {
    let (paths, config) = load_config()?;
    let manager = DaemonManager::from_config(&config, &paths);
    let target = target.unwrap_or_else(|| config.session.server_url.clone());

    let id = manager.start(&target, ports).await;
    let Some(daemon) = manager.get(&id).await else {
        anyhow::bail!("daemon {} vanished before it started", id);
    };

    let state = daemon.wait_ready().await;
    if state != DaemonState::Connected {
        let record = daemon.record().await;
        manager.stop(&id).await;
        anyhow::bail!(
            "daemon {} is {}: {}",
            id.short(),
            state,
            record.last_error.unwrap_or_default()
        );
    }

    let result = daemon.capture_screenshot(&label).await;
    let record = daemon.record().await;
    manager.stop(&id).await;

    let path = result?;
    println!("📸 {}", path.display());
    println!(
        "   port {} · {} log entries",
        record.active_port.map(|p| p.to_string()).unwrap_or_default(),
        record.log_count
    );
    Ok(())
}
