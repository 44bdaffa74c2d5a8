/*!
 # USB HID relay link

 Command encoder, status decoder and transport for the relay board. A
 logical channel bitmask goes in, fixed-length HID reports go out; a status
 report comes back and is folded into the session's last confirmed mask.

 A board that cannot be found is not an error: the link drops into
 simulation mode, where writes succeed as no-ops and the rest of the
 system behaves identically without hardware.
*/

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hidapi::{HidApi, HidDevice};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::task;
use tokio::time;
use tracing::{debug, error, info, instrument, warn};

use crate::config::UsbId;

/// Report length in bytes, HID report id included.
pub const REPORT_LEN: usize = 9;

/// Byte offset of the channel mask within a status report, as the
/// supported boards declare it.
pub const STATUS_MASK_OFFSET: usize = 8;

/// Channel byte addressing every channel at once.
pub const BROADCAST_CHANNEL: u8 = 0;

/// Upper bound on any single hardware exchange; the scheduler tick must
/// never block longer than this.
pub const IO_TIMEOUT: Duration = Duration::from_secs(2);

/// Command opcodes understood by the supported relay boards.
pub mod opcode {
    /// Switch the channel in byte 1 on
    pub const CHANNEL_ON: u8 = 0xff;
    /// Switch the channel in byte 1 off
    pub const CHANNEL_OFF: u8 = 0xfd;
    /// Switch every channel on (broadcast)
    pub const ALL_ON: u8 = 0xfe;
    /// Switch every channel off (broadcast)
    pub const ALL_OFF: u8 = 0xfc;
}

/// Failures talking to the relay board. All of them are non-fatal to the
/// caller: channel logic keeps running against the last confirmed mask.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// No board matching the configured ids
    #[error("no matching relay device found")]
    NotFound,

    /// Board present but could not be opened
    #[error("device open failed: {0}")]
    OpenFailed(String),

    /// A single command failed or timed out; retry on a later tick
    #[error("transient device I/O failure: {0}")]
    Transient(String),

    /// Session is not open and not simulated
    #[error("device unavailable")]
    Unavailable,
}

/// Connection state of the one device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connection {
    Closed,
    Open,
    /// Discovery succeeded but open failed; control is disabled
    Unavailable,
}

/// Result of scanning for the configured board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discovery {
    Found,
    NotFound,
}

/// The single device session owned by the link.
#[derive(Debug, Clone, Copy)]
pub struct DeviceSession {
    pub vendor_id: UsbId,
    pub product_id: UsbId,
    pub connection: Connection,
    /// Last confirmed physical state, one bit per channel. Used when
    /// polling fails so a transient error never flaps the operator's view.
    pub last_known_mask: u8,
}

/// Wire-level operations against one opened relay board.
///
/// The seam keeps the command encoder testable without hardware.
pub trait RelayTransport: Send + Sync {
    fn write_report(&self, report: &[u8; REPORT_LEN]) -> Result<(), DeviceError>;
    fn read_status(&self) -> Result<[u8; REPORT_LEN], DeviceError>;
}

/// hidapi-backed transport. The supported boards exchange feature reports
/// in both directions.
struct HidTransport {
    device: Mutex<HidDevice>,
}

impl HidTransport {
    fn new(device: HidDevice) -> Self {
        HidTransport {
            device: Mutex::new(device),
        }
    }
}

impl RelayTransport for HidTransport {
    fn write_report(&self, report: &[u8; REPORT_LEN]) -> Result<(), DeviceError> {
        self.device
            .lock()
            .send_feature_report(report)
            .map_err(|err| DeviceError::Transient(err.to_string()))
    }

    fn read_status(&self) -> Result<[u8; REPORT_LEN], DeviceError> {
        // Byte 0 carries the report id to request, zero for these boards.
        let mut report = [0u8; REPORT_LEN];
        self.device
            .lock()
            .get_feature_report(&mut report)
            .map_err(|err| DeviceError::Transient(err.to_string()))?;
        Ok(report)
    }
}

fn command_frame(op: u8, channel: u8, payload: u8) -> [u8; REPORT_LEN] {
    // Byte 0 is the HID report id, always zero; the opcode, channel index
    // and on/off payload follow, zero-padded to the report length.
    let mut frame = [0u8; REPORT_LEN];
    frame[1] = op;
    frame[2] = channel;
    frame[3] = payload;
    frame
}

/// Encodes the minimal frame sequence taking the board from `current` to
/// `target`. Full and empty masks collapse to one broadcast frame;
/// anything else becomes one frame per changed bit.
fn encode_mask_update(current: u8, target: u8) -> Vec<[u8; REPORT_LEN]> {
    if target == current {
        return Vec::new();
    }
    if target == 0xff {
        return vec![command_frame(opcode::ALL_ON, BROADCAST_CHANNEL, 1)];
    }
    if target == 0x00 {
        return vec![command_frame(opcode::ALL_OFF, BROADCAST_CHANNEL, 0)];
    }
    let mut frames = Vec::new();
    for bit in 0..8u8 {
        let want_on = target >> bit & 1 == 1;
        let is_on = current >> bit & 1 == 1;
        if want_on != is_on {
            let (op, payload) = if want_on {
                (opcode::CHANNEL_ON, 1)
            } else {
                (opcode::CHANNEL_OFF, 0)
            };
            frames.push(command_frame(op, bit + 1, payload));
        }
    }
    frames
}

/// Dispatches one blocking HID exchange off the async runtime and bounds
/// it with [`IO_TIMEOUT`]. A command that times out is reported transient;
/// its late completion is discarded.
async fn blocking_io<T, F>(op: F) -> Result<T, DeviceError>
where
    F: FnOnce() -> Result<T, DeviceError> + Send + 'static,
    T: Send + 'static,
{
    match time::timeout(IO_TIMEOUT, task::spawn_blocking(op)).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(DeviceError::Transient(join_err.to_string())),
        Err(_) => Err(DeviceError::Transient(format!(
            "device I/O timed out after {IO_TIMEOUT:?}"
        ))),
    }
}

/// Owns the device session and turns bitmask intents into wire commands.
///
/// The link never holds a reference into registry state; the scheduler
/// hands it masks by value and applies results back itself.
pub struct RelayLink {
    session: Mutex<DeviceSession>,
    api: Mutex<Option<HidApi>>,
    transport: Mutex<Option<Arc<dyn RelayTransport>>>,
    simulated: AtomicBool,
    /// Serializes open/close; the session is not reentrant.
    open_gate: Mutex<()>,
}

impl RelayLink {
    pub fn new(vendor_id: UsbId, product_id: UsbId) -> Self {
        RelayLink {
            session: Mutex::new(DeviceSession {
                vendor_id,
                product_id,
                connection: Connection::Closed,
                last_known_mask: 0,
            }),
            api: Mutex::new(None),
            transport: Mutex::new(None),
            simulated: AtomicBool::new(false),
            open_gate: Mutex::new(()),
        }
    }

    #[cfg(test)]
    fn with_transport(transport: Arc<dyn RelayTransport>) -> Self {
        let link = RelayLink::new(UsbId::Value(0x16c0), UsbId::Value(0x05df));
        link.session.lock().connection = Connection::Open;
        *link.transport.lock() = Some(transport);
        link
    }

    /// Scans for a board matching the configured ids.
    ///
    /// `NotFound` is not fatal: the link enters simulation mode and every
    /// later command succeeds as a no-op against the session mask.
    #[instrument(skip(self))]
    pub fn discover(&self) -> Discovery {
        let (vendor_id, product_id) = {
            let session = self.session.lock();
            (session.vendor_id, session.product_id)
        };
        let (Some(vid), Some(pid)) = (vendor_id.value(), product_id.value()) else {
            info!(
                %vendor_id,
                %product_id,
                "vendor or device id not usable, entering simulation mode"
            );
            self.simulated.store(true, Ordering::Relaxed);
            return Discovery::NotFound;
        };

        let api = match HidApi::new() {
            Ok(api) => api,
            Err(err) => {
                warn!(%err, "HID subsystem unavailable, entering simulation mode");
                self.simulated.store(true, Ordering::Relaxed);
                return Discovery::NotFound;
            }
        };

        let found = api
            .device_list()
            .any(|info| info.vendor_id() == vid && info.product_id() == pid);
        if found {
            info!(vendor_id = %vendor_id, product_id = %product_id, "relay board found");
            *self.api.lock() = Some(api);
            Discovery::Found
        } else {
            info!(
                vendor_id = %vendor_id,
                product_id = %product_id,
                "no relay board found, entering simulation mode"
            );
            self.simulated.store(true, Ordering::Relaxed);
            Discovery::NotFound
        }
    }

    /// Opens the discovered board. Failure is reported but non-fatal: the
    /// session becomes `Unavailable` and channel logic keeps operating
    /// against the last confirmed mask.
    #[instrument(skip(self))]
    pub fn open(&self) -> Result<(), DeviceError> {
        let _gate = self.open_gate.lock();
        if self.simulated.load(Ordering::Relaxed) {
            debug!("simulation mode, nothing to open");
            return Ok(());
        }
        if self.session.lock().connection == Connection::Open {
            debug!("device already open");
            return Ok(());
        }

        let (vid, pid) = {
            let session = self.session.lock();
            match (session.vendor_id.value(), session.product_id.value()) {
                (Some(vid), Some(pid)) => (vid, pid),
                _ => return Err(DeviceError::NotFound),
            }
        };

        let api_slot = self.api.lock();
        let Some(api) = api_slot.as_ref() else {
            return Err(DeviceError::NotFound);
        };
        match api.open(vid, pid) {
            Ok(device) => {
                *self.transport.lock() = Some(Arc::new(HidTransport::new(device)));
                self.session.lock().connection = Connection::Open;
                info!("relay board opened");
                Ok(())
            }
            Err(err) => {
                self.session.lock().connection = Connection::Unavailable;
                error!(%err, "could not open relay board, control disabled");
                Err(DeviceError::OpenFailed(err.to_string()))
            }
        }
    }

    /// Releases the board. Safe to call in any state; closing an already
    /// closed session is success.
    #[instrument(skip(self))]
    pub fn close(&self) {
        let _gate = self.open_gate.lock();
        let had_device = self.transport.lock().take().is_some();
        let mut session = self.session.lock();
        if had_device {
            info!("relay board closed");
        } else {
            debug!("close on a link with no open device");
        }
        session.connection = Connection::Closed;
    }

    /// Pushes a channel bitmask to the board as one coalesced update.
    ///
    /// At most one attempt per command: a transient failure is returned to
    /// the caller, the session keeps its previous confirmed mask, and the
    /// next tick simply retries with the then-current target.
    #[instrument(skip(self))]
    pub async fn send_mask(&self, mask: u8) -> Result<(), DeviceError> {
        let transport = self.transport.lock().clone();
        let Some(transport) = transport else {
            if self.simulated.load(Ordering::Relaxed) {
                self.session.lock().last_known_mask = mask;
                debug!("simulated mask write");
                return Ok(());
            }
            return Err(DeviceError::Unavailable);
        };

        let current = self.session.lock().last_known_mask;
        let frames = encode_mask_update(current, mask);
        if frames.is_empty() {
            debug!("mask unchanged, nothing to send");
            return Ok(());
        }

        debug!(frames = frames.len(), "writing mask update");
        blocking_io(move || {
            for frame in &frames {
                transport.write_report(frame)?;
            }
            Ok(())
        })
        .await?;

        self.session.lock().last_known_mask = mask;
        Ok(())
    }

    /// Reads the board's status report and returns the channel mask.
    ///
    /// Without an open device the last confirmed mask is returned, so
    /// callers in simulation or degraded sessions see a stable view.
    #[instrument(skip(self))]
    pub async fn query_status(&self) -> Result<u8, DeviceError> {
        let transport = self.transport.lock().clone();
        let Some(transport) = transport else {
            return Ok(self.session.lock().last_known_mask);
        };

        let report = blocking_io(move || transport.read_status()).await?;
        let mask = report[STATUS_MASK_OFFSET];
        self.session.lock().last_known_mask = mask;
        debug!(mask = format_args!("{mask:#010b}"), "status report read");
        Ok(mask)
    }

    /// A copy of the current session state.
    pub fn session(&self) -> DeviceSession {
        *self.session.lock()
    }

    pub fn is_simulated(&self) -> bool {
        self.simulated.load(Ordering::Relaxed)
    }

    /// Operator-facing one-line summary of the session.
    pub fn describe(&self) -> String {
        let session = self.session();
        let state = if self.is_simulated() {
            "no device found, running in simulation mode"
        } else {
            match session.connection {
                Connection::Open => "device open",
                Connection::Closed => "device closed",
                Connection::Unavailable => "device could not be opened, control disabled",
            }
        };
        format!(
            "vendor id {}  device id {}  {}",
            session.vendor_id, session.product_id, state
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Transport double that records frames and serves a canned status
    /// report; flips to failing when `fail` is set.
    struct FakeTransport {
        frames: Mutex<Vec<[u8; REPORT_LEN]>>,
        status: Mutex<[u8; REPORT_LEN]>,
        fail: AtomicBool,
    }

    impl FakeTransport {
        fn new() -> Arc<Self> {
            Arc::new(FakeTransport {
                frames: Mutex::new(Vec::new()),
                status: Mutex::new([0u8; REPORT_LEN]),
                fail: AtomicBool::new(false),
            })
        }

        fn with_status_mask(mask: u8) -> Arc<Self> {
            let transport = Self::new();
            transport.status.lock()[STATUS_MASK_OFFSET] = mask;
            transport
        }
    }

    impl RelayTransport for FakeTransport {
        fn write_report(&self, report: &[u8; REPORT_LEN]) -> Result<(), DeviceError> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(DeviceError::Transient("pipe error".into()));
            }
            self.frames.lock().push(*report);
            Ok(())
        }

        fn read_status(&self) -> Result<[u8; REPORT_LEN], DeviceError> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(DeviceError::Transient("pipe error".into()));
            }
            Ok(*self.status.lock())
        }
    }

    #[test]
    fn unchanged_mask_encodes_nothing() {
        assert!(encode_mask_update(0b0101, 0b0101).is_empty());
    }

    #[test]
    fn full_and_empty_masks_collapse_to_broadcast() {
        let frames = encode_mask_update(0b0000_0001, 0xff);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0][1], opcode::ALL_ON);
        assert_eq!(frames[0][2], BROADCAST_CHANNEL);

        let frames = encode_mask_update(0b0101_0000, 0x00);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0][1], opcode::ALL_OFF);
    }

    #[test]
    fn partial_update_encodes_one_frame_per_changed_bit() {
        // Channel 1 turns off, channel 3 turns on, channel 2 untouched.
        let frames = encode_mask_update(0b0000_0011, 0b0000_0110);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0][1], opcode::CHANNEL_OFF);
        assert_eq!(frames[0][2], 1);
        assert_eq!(frames[0][3], 0);
        assert_eq!(frames[1][1], opcode::CHANNEL_ON);
        assert_eq!(frames[1][2], 3);
        assert_eq!(frames[1][3], 1);
    }

    #[test]
    fn frames_are_fixed_length_and_zero_padded() {
        let frame = command_frame(opcode::CHANNEL_ON, 5, 1);
        assert_eq!(frame.len(), REPORT_LEN);
        assert_eq!(frame[0], 0);
        assert!(frame[4..].iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn send_mask_writes_and_confirms() {
        let transport = FakeTransport::new();
        let link = RelayLink::with_transport(transport.clone());
        link.send_mask(0b0000_0101).await.unwrap();
        assert_eq!(transport.frames.lock().len(), 2);
        assert_eq!(link.session().last_known_mask, 0b0000_0101);
    }

    #[tokio::test]
    async fn transient_failure_keeps_confirmed_mask() {
        let transport = FakeTransport::new();
        let link = RelayLink::with_transport(transport.clone());
        link.send_mask(0b0000_0001).await.unwrap();

        transport.fail.store(true, Ordering::Relaxed);
        let err = link.send_mask(0b0000_0011).await.unwrap_err();
        assert!(matches!(err, DeviceError::Transient(_)));
        assert_eq!(link.session().last_known_mask, 0b0000_0001);
    }

    #[tokio::test]
    async fn query_status_reads_mask_at_declared_offset() {
        let transport = FakeTransport::with_status_mask(0b1010_0000);
        let link = RelayLink::with_transport(transport);
        assert_eq!(link.query_status().await.unwrap(), 0b1010_0000);
        assert_eq!(link.session().last_known_mask, 0b1010_0000);
    }

    #[tokio::test]
    async fn simulation_mode_accepts_writes_as_noops() {
        let link = RelayLink::new(UsbId::Unset, UsbId::Unset);
        assert_eq!(link.discover(), Discovery::NotFound);
        assert!(link.is_simulated());

        link.send_mask(0b0001_0000).await.unwrap();
        assert_eq!(link.session().last_known_mask, 0b0001_0000);
        assert_eq!(link.query_status().await.unwrap(), 0b0001_0000);
    }

    #[tokio::test]
    async fn closed_link_without_simulation_is_unavailable() {
        let link = RelayLink::new(UsbId::Value(1), UsbId::Value(2));
        let err = link.send_mask(0xff).await.unwrap_err();
        assert!(matches!(err, DeviceError::Unavailable));
    }

    #[test]
    fn close_tolerates_every_state() {
        let link = RelayLink::new(UsbId::Unset, UsbId::Unset);
        link.close();
        link.close();
        assert_eq!(link.session().connection, Connection::Closed);
    }
}
