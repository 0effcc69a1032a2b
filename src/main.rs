use anyhow::{Context, Result};
use llm_proxy::config::{LogFormat, Settings};
use llm_proxy::infrastructure::log_messages::application as msg;
use llm_proxy::Application;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load().context("loading settings")?;
    init_tracing(&settings);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        machine_id = %settings.machine_id,
        log_root = %settings.log_root.display(),
        "{}",
        msg::STARTING
    );

    let app = Application::build(settings)
        .await
        .context("starting llm-proxy")?;
    app.run().await?;

    Ok(())
}

/// Diagnostics go to stderr; `RUST_LOG` wins over `logging.level`
fn init_tracing(settings: &Settings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match settings.logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.pretty().init(),
    }
}
