mod culvert;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "culvert",
    version,
    about = "Culvert - TCP tunnel server/client with an HTTP control plane"
)]
struct Cli {
    /// Path to Culvert config file (.toml/.yaml/.yml). If omitted, uses CULVERT_CONFIG; then auto-detects culvert.toml > culvert.yaml > culvert.yml from CWD; then falls back to the OS default path (Linux: /etc/culvert/culvert.toml; others: user config dir).
    #[arg(long, env = "CULVERT_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    culvert::run(cli.config).await
}
