pub mod capture;
pub mod exec;
pub mod status;
pub mod watch;

use browserlink_core::{Config, Paths};

/// Load `~/.browserlink/config.json`, falling back to defaults when absent.
pub(crate) fn load_config() -> anyhow::Result<(Paths, Config)> {
    let paths = Paths::new();
    let config = Config::load_or_default(&paths)?;
    Ok((paths, config))
}
