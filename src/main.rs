pub mod actuator;
pub mod agent;
pub mod config;
pub mod mqtt;
pub mod network;
pub mod sensor;
#[cfg(test)]
mod testing;

use color_eyre::Result;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    setup()?;

    let config_path = config::config_path();
    let config = agent::load_config(&config_path).await?;

    info!("Initializing agent hardware");
    let control_loop = agent::build_agent(&config)?;

    let stats = agent::run_agent(control_loop, agent::shutdown_signal())
        .await
        .into_result()?;
    info!(
        "Agent stopped after {} cycles ({} published, {} skipped)",
        stats.cycles, stats.published, stats.skipped
    );
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    let directives = std::env::var("RUST_LOG").ok();

    FmtSubscriber::builder()
        .with_env_filter(log_filter(directives.as_deref()))
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .init();
}

fn log_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}
