use browserlink_session::Session;
use std::time::Duration;

use super::load_config;

/// Run a script in the remote browser and print its result.
pub async fn script(script: String, timeout: Option<u64>) -> anyhow::Result<()> {
    let (_, config) = load_config()?;
    let session = Session::connect(&config.session).await?;

    let result = session
        .execute_js(&script, timeout.map(Duration::from_secs))
        .await;
    session.close().await;

    println!("{}", serde_json::to_string_pretty(&result?)?);
    Ok(())
}

/// Send a free-form task and print the reply.
pub async fn task(text: String, timeout: Option<u64>) -> anyhow::Result<()> {
    let (_, config) = load_config()?;
    let session = Session::connect(&config.session).await?;

    let result = session
        .send_task(&text, timeout.map(Duration::from_secs))
        .await;
    session.close().await;

    println!("{}", serde_json::to_string_pretty(&result?)?);
    Ok(())
}
