use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use color_eyre::eyre::Result;
use parking_lot::RwLock;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use usb_relay_controller::*;

#[tokio::main]
async fn main() -> Result<()> {
    // Get an optional settings file path from command line arguments.
    let usage = "Usage: relayd [settings.json]";
    let args: Vec<_> = env::args().collect();
    if args.iter().any(|a| a == "-h" || a == "--help") {
        eprintln!("{usage}");
        std::process::exit(0);
    }
    let settings_path = args
        .get(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(config::DEFAULT_SETTINGS_FILE));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("RUST_LOG")
                .unwrap_or_else(|_| EnvFilter::new("usb_relay_controller=info")),
        )
        .compact()
        .init();
    color_eyre::install()?;

    // Settings, channel data, registry
    let store = ConfigStore::new(&settings_path);
    let settings = store.load_settings().materialize();
    let data_path = settings.data_file.clone();
    let records = match store.load_channel_data(&data_path) {
        Ok(records) => records,
        Err(err) => {
            info!(path = %data_path.display(), %err, "using default channel data");
            ConfigStore::default_channel_data(settings.channel_count)
        }
    };
    let registry = Arc::new(RwLock::new(ChannelRegistry::new(settings.channel_count)));
    if let Err(err) = registry.write().load(&records) {
        warn!(%err, "a stored schedule was rejected and disabled");
    }

    // Device session; a missing board leaves us in simulation mode
    let link = Arc::new(RelayLink::new(settings.vendor_id, settings.product_id));
    if link.discover() == Discovery::Found {
        if let Err(err) = link.open() {
            warn!(%err, "continuing without device control");
        }
    }
    if link.session().connection == Connection::Open {
        match link.query_status().await {
            Ok(mask) => registry.write().adopt_mask(mask),
            Err(err) => warn!(%err, "could not read device status"),
        }
    }
    info!("{}", link.describe());

    // Scheduler loop, cancelled through the watch channel on shutdown
    let (stop_tx, stop_rx) = watch::channel(false);
    let scheduler = Scheduler::new(registry.clone(), link.clone());
    let loop_task = tokio::spawn(scheduler.run(stop_rx));

    // Inform about successful initialization
    println!("OK");

    // Mainloop: wait for commands on stdin, line by line
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    handle_line(line.trim(), &registry, &link, &store, &data_path).await;
                }
                Ok(None) => {
                    info!("stdin closed, shutting down");
                    break;
                }
                Err(err) => {
                    warn!(%err, "stdin read failed, shutting down");
                    break;
                }
            }
        }
    }

    // Stop ticking; the scheduler closes the device link on its way out.
    let _ = stop_tx.send(true);
    loop_task.await?;
    Ok(())
}

/// Executes one line of the daemon command protocol.
///
/// Commands: `on:<ch>`, `off:<ch>`, `toggle:<ch>`, `all_on`, `all_off`,
/// `status`, `save`. Responds `OK` or `ERR <reason>`.
async fn handle_line(
    line: &str,
    registry: &Arc<RwLock<ChannelRegistry>>,
    link: &RelayLink,
    store: &ConfigStore,
    data_path: &std::path::Path,
) {
    if line.is_empty() {
        return;
    }
    let mut cmd = line.split(':');
    match cmd.next() {
        Some("on") => match parse_channel(cmd.next(), registry) {
            Ok(channel) => {
                let mask = {
                    let mut registry = registry.write();
                    registry.set_manual(channel, true);
                    registry.snapshot()
                };
                push_mask(link, mask).await;
                println!("OK");
            }
            Err(reason) => eprintln!("ERR {reason}"),
        },
        Some("off") => match parse_channel(cmd.next(), registry) {
            Ok(channel) => {
                let mask = {
                    let mut registry = registry.write();
                    registry.set_manual(channel, false);
                    registry.snapshot()
                };
                push_mask(link, mask).await;
                println!("OK");
            }
            Err(reason) => eprintln!("ERR {reason}"),
        },
        Some("toggle") => match parse_channel(cmd.next(), registry) {
            Ok(channel) => {
                let mask = {
                    let mut registry = registry.write();
                    registry.toggle(channel);
                    registry.snapshot()
                };
                push_mask(link, mask).await;
                println!("OK");
            }
            Err(reason) => eprintln!("ERR {reason}"),
        },
        Some("all_on") => {
            let mask = registry.write().set_all(true);
            push_mask(link, mask).await;
            println!("OK");
        }
        Some("all_off") => {
            let mask = registry.write().set_all(false);
            push_mask(link, mask).await;
            println!("OK");
        }
        Some("status") => {
            {
                let registry = registry.read();
                for channel in registry.channels() {
                    println!(
                        "{} {} {} {}",
                        channel.id,
                        if channel.effective_state { "on" } else { "off" },
                        channel.phase,
                        channel.label,
                    );
                }
            }
            println!("OK");
        }
        Some("save") => match store.save_channel_data(data_path, &registry.read().records()) {
            Ok(()) => println!("OK"),
            Err(err) => eprintln!("ERR {err}"),
        },
        Some(other) => {
            eprintln!("ERR Unknown command: {other}");
        }
        None => {
            eprintln!("ERR No command given");
        }
    }
}

/// Parses and range-checks a channel argument.
fn parse_channel(
    arg: Option<&str>,
    registry: &Arc<RwLock<ChannelRegistry>>,
) -> std::result::Result<u8, String> {
    let text = arg.ok_or_else(|| "no channel given".to_string())?;
    let channel: u8 = text
        .trim()
        .parse()
        .map_err(|_| format!("invalid channel: {text:?}"))?;
    let count = registry.read().channel_count();
    if channel < 1 || channel > count {
        return Err(format!("channel {channel} outside 1..={count}"));
    }
    Ok(channel)
}

/// Fire-and-forget device write; failures are reported, never fatal.
async fn push_mask(link: &RelayLink, mask: u8) {
    if let Err(err) = link.send_mask(mask).await {
        warn!(%err, "device write failed, state kept in memory");
    }
}
