use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, Result};
use parking_lot::RwLock;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use usb_relay_controller::*;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Settings file
    #[arg(short, long, default_value = "settings.json")]
    settings: PathBuf,

    /// Channel-data file (defaults to the one named in the settings)
    #[arg(short, long)]
    data: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show every channel and the device session
    Status,
    /// Switch a channel on
    On {
        /// Channel id (1-8)
        channel: u8,
    },
    /// Switch a channel off
    Off {
        /// Channel id (1-8)
        channel: u8,
    },
    /// Flip a channel
    Toggle {
        /// Channel id (1-8)
        channel: u8,
    },
    /// Switch every channel on
    AllOn,
    /// Switch every channel off
    AllOff,
    /// Set a channel's label
    Label {
        /// Channel id (1-8)
        channel: u8,
        /// New label text
        label: String,
    },
    /// Set or disable a channel's daily schedule
    Schedule {
        /// Channel id (1-8)
        channel: u8,
        /// Window start, HH:MM
        #[arg(long)]
        start: String,
        /// Window end, HH:MM
        #[arg(long)]
        end: String,
        /// Keep the window but leave it disarmed
        #[arg(long)]
        disable: bool,
    },
    /// Reset every channel to defaults
    Clear,
    /// Show or change stored settings
    Config {
        /// Vendor id text, decimal or 0x-prefixed hex
        #[arg(long)]
        vendor_id: Option<String>,
        /// Device id text, decimal or 0x-prefixed hex
        #[arg(long)]
        device_id: Option<String>,
        /// Number of channels (1-8)
        #[arg(long)]
        channels: Option<u8>,
        /// Default channel-data file
        #[arg(long)]
        data_file: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with pretty colors
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("RUST_LOG")
                .unwrap_or_else(|_| EnvFilter::new("usb_relay_controller=info")),
        )
        .compact()
        .init();

    // Initialize color-eyre for pretty error reporting
    color_eyre::install()?;

    let cli = Cli::parse();

    let store = ConfigStore::new(&cli.settings);
    let settings = store.load_settings().materialize();
    let data_path = cli.data.unwrap_or_else(|| settings.data_file.clone());

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

    let link = Arc::new(RelayLink::new(settings.vendor_id, settings.product_id));
    if link.discover() == Discovery::Found {
        if let Err(err) = link.open() {
            warn!(%err, "continuing without device control");
        }
    }
    // Pick up the board's power-on state so the view starts truthful.
    if link.session().connection == Connection::Open {
        match link.query_status().await {
            Ok(mask) => registry.write().adopt_mask(mask),
            Err(err) => warn!(%err, "could not read device status"),
        }
    }

    match cli.command.unwrap_or(Commands::Status) {
        Commands::Status => {
            print_status(&registry.read(), &link);
        }
        Commands::On { channel } => {
            check_channel(channel, &registry)?;
            let mask = {
                let mut registry = registry.write();
                registry.set_manual(channel, true);
                registry.snapshot()
            };
            push_mask(&link, mask).await;
        }
        Commands::Off { channel } => {
            check_channel(channel, &registry)?;
            let mask = {
                let mut registry = registry.write();
                registry.set_manual(channel, false);
                registry.snapshot()
            };
            push_mask(&link, mask).await;
        }
        Commands::Toggle { channel } => {
            check_channel(channel, &registry)?;
            let (on, mask) = {
                let mut registry = registry.write();
                let on = registry.toggle(channel);
                (on, registry.snapshot())
            };
            info!(channel, on, "channel toggled");
            push_mask(&link, mask).await;
        }
        Commands::AllOn => {
            let mask = registry.write().set_all(true);
            push_mask(&link, mask).await;
        }
        Commands::AllOff => {
            let mask = registry.write().set_all(false);
            push_mask(&link, mask).await;
        }
        Commands::Label { channel, label } => {
            check_channel(channel, &registry)?;
            registry.write().set_label(channel, label);
            store.save_channel_data(&data_path, &registry.read().records())?;
        }
        Commands::Schedule {
            channel,
            start,
            end,
            disable,
        } => {
            check_channel(channel, &registry)?;
            let sched = Schedule {
                start: parse_time(&start)?,
                end: parse_time(&end)?,
                enabled: !disable,
            };
            registry
                .write()
                .set_schedule(channel, sched)
                .map_err(|err| eyre!("channel {channel}: {err}"))?;
            store.save_channel_data(&data_path, &registry.read().records())?;
            info!(channel, start = %sched.start, end = %sched.end, "schedule stored");
        }
        Commands::Clear => {
            registry.write().clear_all();
            store.save_channel_data(&data_path, &registry.read().records())?;
        }
        Commands::Config {
            vendor_id,
            device_id,
            channels,
            data_file,
        } => {
            let mut current = store.load_settings();
            let mut dirty = false;
            if let Some(vendor_id) = vendor_id {
                current.vendor_id = vendor_id;
                dirty = true;
            }
            if let Some(device_id) = device_id {
                current.device_id = device_id;
                dirty = true;
            }
            if let Some(channels) = channels {
                current.channel_count = if (1..=8).contains(&channels) {
                    channels
                } else {
                    warn!(channels, "channel count out of range, storing 8");
                    8
                };
                dirty = true;
            }
            if let Some(data_file) = data_file {
                current.default_data_file = data_file;
                dirty = true;
            }
            if dirty {
                store.save_settings(&current)?;
                info!("settings saved; changes apply on the next start");
            } else {
                println!("vendor_id:         {}", current.vendor_id);
                println!("device_id:         {}", current.device_id);
                println!("channel_count:     {}", current.channel_count);
                println!("default_data_file: {}", current.default_data_file);
            }
        }
    }

    Ok(())
}

/// Rejects channel ids the registry would treat as a programming error.
fn check_channel(channel: u8, registry: &Arc<RwLock<ChannelRegistry>>) -> Result<()> {
    let count = registry.read().channel_count();
    if channel < 1 || channel > count {
        return Err(eyre!("channel {channel} outside 1..={count}"));
    }
    Ok(())
}

/// Fire-and-forget device write; failures are reported, never fatal.
async fn push_mask(link: &RelayLink, mask: u8) {
    if let Err(err) = link.send_mask(mask).await {
        warn!(%err, "device write failed, state kept in memory");
    }
}

/// Parse an HH:MM argument.
fn parse_time(text: &str) -> Result<TimeOfDay> {
    let (hour, minute) = text
        .split_once(':')
        .ok_or_else(|| eyre!("expected HH:MM, got {text:?}"))?;
    let hour = hour.trim().parse()?;
    let minute = minute.trim().parse()?;
    Ok(TimeOfDay::new(hour, minute))
}

fn print_status(registry: &ChannelRegistry, link: &RelayLink) {
    for channel in registry.channels() {
        let window = match channel.schedule {
            Some(sched) => format!("{}-{}", sched.start, sched.end),
            None => "--:-- - --:--".to_string(),
        };
        println!(
            "{}  {:<4} {:<8} {}  {}",
            channel.id,
            if channel.effective_state { "on" } else { "off" },
            channel.phase.to_string(),
            window,
            channel.label,
        );
    }
    println!("{}", link.describe());
}
