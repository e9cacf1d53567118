mod commands;
mod session;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use model::Goal;
use std::path::PathBuf;
use stride_engine::EngineConfig;
use stride_link_core::DeviceProfile;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use commands::{parse_line, Command, HELP};
use session::AppSession;

#[derive(Debug, Parser)]
#[command(name = "stride-panel", version, about = "Console controller for a connected exercise machine")]
struct Cli {
    /// Engine configuration (JSON). Missing fields keep their defaults.
    #[arg(long, env = "STRIDE_CONFIG")]
    config: Option<PathBuf>,

    /// Product variant: `exercise` or `home`.
    #[arg(long, env = "STRIDE_PROFILE")]
    profile: Option<String>,

    #[arg(long, env = "STRIDE_DEVICE_ID")]
    device_id: Option<String>,

    /// Where the session archive lives. Defaults to the platform data directory.
    #[arg(long, env = "STRIDE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Session goal, e.g. `distance:1.5`, `time:30` (minutes) or `calories:200`.
    #[arg(long)]
    goal: Option<Goal>,

    /// Simulated machine reports sport state as 0/1/2.
    #[arg(long)]
    numeric_state: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let mut cfg = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
            EngineConfig::from_json(&text).with_context(|| format!("parse {}", path.display()))?
        }
        None => EngineConfig::default(),
    };
    if let Some(name) = &cli.profile {
        cfg.profile = DeviceProfile::by_name(name).ok_or_else(|| anyhow!("unknown profile `{name}`"))?;
    }
    if let Some(id) = &cli.device_id {
        cfg.device_id = id.clone();
    }
    if cfg.device_id.is_empty() {
        cfg.device_id = "sim-0".into();
    }
    if cli.goal.is_some() {
        cfg.goal = cli.goal;
    }
    Ok(cfg)
}

fn data_dir(cli: &Cli) -> PathBuf {
    cli.data_dir
        .clone()
        .or_else(|| dirs_next::data_dir().map(|d| d.join("stride")))
        .unwrap_or_else(|| PathBuf::from(".stride"))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let cfg = load_config(&cli)?;
    let dir = data_dir(&cli);
    info!(device = %cfg.device_id, data_dir = %dir.display(), goal = ?cfg.goal, "starting panel");

    let mut app = AppSession::start(cfg, &dir, cli.numeric_state).await?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("{HELP}");

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match parse_line(&line) {
                    Ok(Command::Quit) => break,
                    Ok(cmd) => {
                        if let Err(err) = app.execute(cmd).await {
                            warn!(error = %err, "command failed");
                            println!("error: {err:#}");
                        }
                    }
                    Err(err) => println!("{err}"),
                }
            }
            Some(event) = app.next_event() => app.on_event(event),
        }
    }

    app.shutdown().await;
    Ok(())
}
