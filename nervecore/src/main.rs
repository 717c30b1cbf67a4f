use std::sync::Arc;
use std::time::Duration;

use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use nervecore::heart::Heart;
use nervecore::runtime::NerveConfig;
use nervecore::senses::{CliSense, ClockSense, Sense};
use nervecore::signal::{types, Signal};

#[tokio::main]
async fn main() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = NerveConfig::from_env();
    tracing::info!(db = %config.db_path.display(), "nervecore starting");

    let senses: Vec<Arc<dyn Sense>> = vec![
        Arc::new(CliSense),
        Arc::new(ClockSense::new(Duration::from_secs(60))),
    ];

    let heart = Heart::start(config, senses).await.into_diagnostic()?;

    // Ctrl-C translates into the same shutdown signal any sense could send.
    let bus = heart.bus();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = bus
                .publish(Signal::new(
                    types::SHUTDOWN_REQUESTED,
                    "os",
                    serde_json::json!({}),
                ))
                .await;
        }
    });

    heart.run().await.into_diagnostic()?;
    tracing::info!("nervecore stopped");
    Ok(())
}
