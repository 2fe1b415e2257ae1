use browserlink_browser::{DaemonManager, DaemonRecord, DaemonState};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::info;

use super::load_config;

const REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Keep a daemon attached to the browser and report on it until Ctrl-C.
pub async fn run(ports: Vec<u16>, target: Option<String>) -> anyhow::Result<()> {
    let (paths, config) = load_config()?;
    let manager = DaemonManager::from_config(&config, &paths);
    let target = target.unwrap_or_else(|| config.session.server_url.clone());

    let id = manager.start(&target, ports).await;
    info!(daemon = %id, "Watching browser, press Ctrl-C to stop");

    let mut ticker = tokio::time::interval(REPORT_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                let records = manager.list().await;
                if records.is_empty() {
                    break;
                }
                for record in &records {
                    print_record(record);
                }
                if records.iter().all(|r| r.state == DaemonState::Stopped) {
                    break;
                }
            }
        }
    }

    manager.stop_all().await;
    Ok(())
}

fn print_record(record: &DaemonRecord) {
    println!(
        "{}  {:<12} port={:<5} logs={:<6} last={}{}",
        record.id.short(),
        record.state.to_string(),
        record
            .active_port
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string()),
        record.log_count,
        record
            .last_capture
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "-".to_string()),
        record
            .last_error
            .as_ref()
            .map(|e| format!("  ({})", e))
            .unwrap_or_default(),
    );
}
