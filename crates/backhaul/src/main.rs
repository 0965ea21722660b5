mod backhaul;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "backhaul",
    version,
    about = "Backhaul - reverse TCP tunnel over a single multiplexed control stream"
)]
struct Cli {
    /// Path to a config file (.toml/.yaml/.yml). If omitted, uses BACKHAUL_CONFIG; then auto-detects backhaul.toml > backhaul.yaml > backhaul.yml from CWD; otherwise built-in defaults.
    #[arg(long, global = true, env = "BACKHAUL_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Log at debug level unless RUST_LOG is set.
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    mode: backhaul::app::Mode,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    backhaul::run(cli.config, cli.debug, cli.mode).await
}
