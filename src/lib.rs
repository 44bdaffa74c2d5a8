/*!
 # USB HID Relay Channel Controller Library

 A Rust library for controlling USB HID relay boards (1 to 8 channels),
 either immediately or on daily recurring time windows.

 ## Features

 * Manual per-channel and all-channel switching
 * Daily on/off schedule per channel with midnight wrap-around
 * Coalesced bitmask writes over a USB HID feature-report protocol
 * Simulation mode when no board is attached
 * JSON persistence for settings and channel data

 ## Example

 ```rust,no_run
 use std::sync::Arc;
 use parking_lot::RwLock;
 use usb_relay_controller::*;

 #[tokio::main]
 async fn main() -> Result<()> {
     // Initialize tracing for logs
     tracing_subscriber::fmt::init();

     // Settings and channel data from flat JSON files
     let store = ConfigStore::new("settings.json");
     let settings = store.load_settings().materialize();

     // Channel state and the device session
     let registry = Arc::new(RwLock::new(ChannelRegistry::new(settings.channel_count)));
     let link = Arc::new(RelayLink::new(settings.vendor_id, settings.product_id));
     if link.discover() == Discovery::Found {
         link.open()?;
     }

     // Switch channel 3 on right now
     let mask = {
         let mut registry = registry.write();
         registry.set_manual(3, true);
         registry.snapshot()
     };
     link.send_mask(mask).await?;

     Ok(())
 }
 ```
*/

use thiserror::Error;

/// Top-level error for the relay controller library.
#[derive(Error, Debug)]
pub enum Error {
    /// Schedule rejected at the validation boundary
    #[error(transparent)]
    Schedule(#[from] schedule::ScheduleError),

    /// Device discovery/open/I-O failure
    #[error(transparent)]
    Device(#[from] device::DeviceError),

    /// Save/load failure on a persisted document
    #[error(transparent)]
    Persistence(#[from] config::PersistenceError),

    /// Recoverable condition in persisted channel data
    #[error(transparent)]
    Config(#[from] config::ConfigError),
}

pub type Result<T> = std::result::Result<T, Error>;

// Re-export modules
pub mod config;
pub mod device;
pub mod registry;
pub mod schedule;
pub mod scheduler;

// Re-export key types
pub use config::{
    AppSettings, ChannelRecord, ConfigError, ConfigStore, PersistenceError, Settings, UsbId,
};
pub use device::{Connection, DeviceError, DeviceSession, Discovery, RelayLink};
pub use registry::{Channel, ChannelRegistry, TickOutcome};
pub use schedule::{Phase, Schedule, ScheduleError, TimeOfDay, ValidSchedule};
pub use scheduler::{local_time_of_day, Scheduler, TICK_INTERVAL};
