use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use runprobe::bench::{variant_label, Harness};
use runprobe::config::{self, Config};
use runprobe::device::DeviceIdentity;
use runprobe::gateway::{ClientOptions, GatewayClient};

#[derive(Parser)]
#[command(name = "runprobe")]
#[command(about = "Drive agent runs on a gateway and record what they produce", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Load (or create) the device identity and print its device id.
    Device {
        /// Config file path (default: RUNPROBE_CONFIG_PATH or ~/.runprobe/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Send one prompt to the configured session and print the result as JSON.
    Prompt {
        /// Config file path (default: RUNPROBE_CONFIG_PATH or ~/.runprobe/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Reset the session before sending.
        #[arg(long)]
        reset: bool,

        message: String,
    },

    /// Print the session's token counters.
    Tokens {
        /// Config file path (default: RUNPROBE_CONFIG_PATH or ~/.runprobe/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Reset the configured session.
    Reset {
        /// Config file path (default: RUNPROBE_CONFIG_PATH or ~/.runprobe/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Run the bench prompts with the configured flag on, off, or both.
    Bench {
        /// Config file path (default: RUNPROBE_CONFIG_PATH or ~/.runprobe/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        #[arg(long, value_enum, default_value_t = Variant::Both)]
        variant: Variant,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Variant {
    On,
    Off,
    Both,
}

impl Variant {
    fn flags(self) -> &'static [bool] {
        match self {
            Variant::On => &[true],
            Variant::Off => &[false],
            Variant::Both => &[true, false],
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("runprobe {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Device { config }) => {
            if let Err(e) = run_device(config) {
                log::error!("device failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Prompt {
            config,
            reset,
            message,
        }) => {
            if let Err(e) = run_prompt(config, reset, &message).await {
                log::error!("prompt failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Tokens { config }) => {
            if let Err(e) = run_tokens(config).await {
                log::error!("tokens failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Reset { config }) => {
            if let Err(e) = run_reset(config).await {
                log::error!("reset failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Bench { config, variant }) => {
            if let Err(e) = run_bench(config, variant).await {
                log::error!("bench failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

/// Persisted identity when `device.persist` is set, otherwise a fresh one.
fn load_identity(config: &Config, config_path: &Path) -> anyhow::Result<DeviceIdentity> {
    if config.device.persist {
        let path = config::resolve_device_path(config, config_path);
        DeviceIdentity::load_or_create(&path)
    } else {
        DeviceIdentity::generate()
    }
}

async fn connect(config_path: Option<PathBuf>) -> anyhow::Result<GatewayClient> {
    let (config, path) = config::load_config(config_path)?;
    let identity = load_identity(&config, &path)?;
    let options = ClientOptions::from_config(&config);
    let url = options.url.clone();
    GatewayClient::connect(options, &identity)
        .await
        .with_context(|| format!("connecting to {}", url))
}

fn run_device(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let (config, path) = config::load_config(config_path)?;
    let identity = load_identity(&config, &path)?;
    println!("{}", identity.device_id());
    Ok(())
}

async fn run_prompt(config_path: Option<PathBuf>, reset: bool, message: &str) -> anyhow::Result<()> {
    let mut client = connect(config_path).await?;
    if reset {
        client.reset_session().await?;
    }
    let outcome = client.send_prompt(message).await;
    client.disconnect().await;
    let result = outcome?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn run_tokens(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let client = connect(config_path).await?;
    let snapshot = client.session_tokens().await;
    client.disconnect().await;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

async fn run_reset(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let client = connect(config_path).await?;
    let outcome = client.reset_session().await;
    client.disconnect().await;
    outcome?;
    println!("session {} reset", client.options().session_key);
    Ok(())
}

async fn run_bench(config_path: Option<PathBuf>, variant: Variant) -> anyhow::Result<()> {
    let (config, path) = config::load_config(config_path)?;
    let identity = load_identity(&config, &path)?;
    let harness = Harness::from_config(&config, &path, identity)?;
    for &enabled in variant.flags() {
        let records = harness
            .run_variant(enabled)
            .await
            .with_context(|| format!("variant {}", variant_label(enabled)))?;
        let failed = records.iter().filter(|r| r.error.is_some()).count();
        println!(
            "{}: {} prompts, {} failed",
            variant_label(enabled),
            records.len(),
            failed
        );
    }
    Ok(())
}
