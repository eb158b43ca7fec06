pub mod api;
pub mod app;
pub mod config;
pub mod logging;
pub mod net;
pub mod registry;
pub mod telemetry;
pub mod tunnel;

pub async fn run(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    app::run(config_path).await
}
