//! Operator CLI for the rupnp runtime.
//!
//! `search` issues an M-SEARCH and prints discoveries as they arrive;
//! `ifconfig` dumps the interface view the runtime would select from.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rupnp_core::netif::Interfaces;
use rupnp_core::{Runtime, RuntimeConfig, UpnpEvent};

#[derive(Parser)]
#[command(name = "rupnp-cli", about = "UPnP discovery/eventing runtime tools")]
struct Cli {
    /// TOML configuration file; defaults apply without one.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send an M-SEARCH and print responses until the search window closes.
    Search {
        /// Search target (ssdp:all, upnp:rootdevice, uuid:..., urn:...).
        #[arg(long, default_value = "ssdp:all")]
        target: String,
        /// MX seconds advertised in the request.
        #[arg(long, default_value_t = 5)]
        mx: u32,
    },
    /// Print the system's network interfaces.
    Ifconfig,
}

fn load_config(path: Option<&PathBuf>) -> Result<RuntimeConfig> {
    match path {
        Some(p) => RuntimeConfig::load(p).with_context(|| format!("loading {}", p.display())),
        None => Ok(RuntimeConfig::default()),
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Ifconfig => {
            for itf in Interfaces::from_system().list() {
                print!("{itf}");
            }
            Ok(())
        }
        Command::Search { target, mx } => {
            let config = load_config(cli.config.as_ref())?;
            let wait = mx.clamp(config.min_search_time, config.max_search_time);
            let rt = Runtime::new(config).context("starting runtime")?;

            let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
            let handle = rt
                .register_client(Arc::new(move |event| match event {
                    UpnpEvent::SearchResult { discovery, .. } => {
                        println!(
                            "{}  {}  max-age={}  {}",
                            discovery.device_id,
                            discovery.service_type,
                            discovery.expires,
                            discovery.location
                        );
                    }
                    UpnpEvent::SearchTimeout { .. } => {
                        done_tx.send(()).ok();
                    }
                    _ => {}
                }))
                .context("registering client")?;

            log::info!("searching for {target} (mx {mx})");
            rt.search(mx, &target, 0).context("sending search")?;

            // The runtime reports the end of the collection window itself.
            done_rx
                .recv_timeout(Duration::from_secs(u64::from(wait) + 5))
                .ok();
            rt.unregister(handle).ok();
            rt.shutdown();
            Ok(())
        }
    }
}
