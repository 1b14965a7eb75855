mod controller;

use anyhow::Context;
use clap::Parser;
use controller::PairingPolicy;
use kurome_core::tls::fingerprint;
use kurome_core::{KuromeConfig, KuromeService};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Headless Kurome peer: shares a directory with paired devices on the LAN.
#[derive(Debug, Parser)]
#[command(name = "kurome-desktop", version)]
struct Args {
    /// Config file; defaults to config.toml in the platform config directory.
    #[arg(long, env = "KUROME_CONFIG")]
    config: Option<PathBuf>,

    /// Directory to share, overriding the config.
    #[arg(long)]
    root: Option<PathBuf>,

    /// Device name announced to peers, overriding the config.
    #[arg(long)]
    name: Option<String>,

    /// Accept every incoming pair request.
    #[arg(long)]
    auto_accept: bool,

    /// Ask every newly connected unpaired peer to pair.
    #[arg(long)]
    request_pairing: bool,

    /// Write the effective config to the config path and exit.
    #[arg(long)]
    write_config: bool,

    /// Print the paired devices and exit.
    #[arg(long)]
    list_paired: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config_path = args.config.clone().unwrap_or_else(KuromeConfig::default_path);
    let mut config = KuromeConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    if let Some(root) = args.root {
        config.shared_root = root;
    }
    if let Some(name) = args.name {
        config.device_name = name;
    }

    // RUST_LOG wins over the configured level.
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("invalid log_level")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if args.write_config {
        config
            .save(&config_path)
            .with_context(|| format!("writing {}", config_path.display()))?;
        info!("Wrote {}", config_path.display());
        return Ok(());
    }

    let service = KuromeService::from_config(config).context("starting service")?;
    if args.list_paired {
        for device in service.saved_devices() {
            println!(
                "{}\t{}\t{:?}\t{}",
                device.id,
                device.name,
                device.platform,
                fingerprint(&device.certificate())
            );
        }
        return Ok(());
    }

    let events = service.subscribe();
    let address = service.start().await.context("binding sockets")?;
    info!("Kurome {} ready on {}", service.local_id(), address);

    let policy = PairingPolicy {
        auto_accept: args.auto_accept,
        request_on_connect: args.request_pairing,
    };
    let controller = tokio::spawn(controller::run(service.clone(), policy, events));

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    info!("Ctrl-C received");

    service.shutdown().await;
    controller.abort();
    Ok(())
}
