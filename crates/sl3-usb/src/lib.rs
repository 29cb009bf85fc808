//! Driver engine for the Rane SL3 USB audio interface.
//!
//! The SL3 is a class-vendor-specific device: audio travels over raw
//! isochronous endpoints with no audio-class descriptors, and configuration is
//! carried over a vendor HID report channel. This crate implements the
//! host-side transport engine and its coupling to the audio clock:
//!
//! - the isochronous streaming state machine with its ring-buffer copy,
//!   per-microframe packet sizing, and implicit feedback ([`stream`]);
//! - the HID request/response and asynchronous-notification channel ([`hid`]);
//! - the lifecycle that ties stream start/stop, rate changes, and device
//!   disconnection together ([`device`]).
//!
//! The host audio subsystem (PCM ring protocol, control-notification bus) and
//! the USB host controller are external collaborators, consumed through the
//! [`pcm::PcmSubstream`], [`control::ControlNotifier`], and
//! [`transport::UsbHostBus`] traits. The embedder routes URB completions into
//! the `on_*_complete` entry points on [`device::Sl3Device`]; those run on the
//! completion context and never block.

use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;

pub mod control;
pub mod device;
pub mod hid;
pub mod pcm;
pub mod status;
pub mod stream;
pub mod transport;

mod ratelimit;

pub use control::{ControlNotifier, Deck, RouteMode, StatusElement};
pub use device::{Config, Sl3Device, StatsSnapshot};
pub use pcm::{PcmPointer, PcmSubstream, Trigger};
pub use transport::{Direction, HidInUrb, IsoPacket, IsoUrb, TransportError, UrbStatus, UsbHostBus};

/// USB vendor id of the Rane SL3.
pub const VENDOR_ID: u16 = 0x1CC5;
/// USB product id of the Rane SL3.
pub const PRODUCT_ID: u16 = 0x0001;

/// Audio format: 6 channels of 24-bit little-endian packed samples.
pub const NUM_CHANNELS: usize = 6;
pub const BYTES_PER_SAMPLE: usize = 3;
pub const BYTES_PER_FRAME: usize = NUM_CHANNELS * BYTES_PER_SAMPLE;

/// Largest isochronous payload the device accepts: 7 frames.
pub const MAX_PACKET_SIZE: usize = 7 * BYTES_PER_FRAME;
pub const MAX_FRAMES_PER_PACKET: usize = MAX_PACKET_SIZE / BYTES_PER_FRAME;

/// URBs kept in flight per direction.
pub const NUM_URBS: usize = 16;
/// Isochronous packets per URB (one per microframe).
pub const ISO_PACKETS: usize = 8;
/// Consecutive failures on one URB before it is abandoned with an xrun.
pub const URB_MAX_RETRIES: u8 = 3;
/// Transfer buffer per URB: 8 packet slots of 126 bytes.
pub const URB_BUFFER_SIZE: usize = ISO_PACKETS * MAX_PACKET_SIZE;

/// Interface numbers. The driver binds to the audio-control interface and
/// claims the other three.
pub const INTF_AUDIO_CTRL: u8 = 0;
pub const INTF_AUDIO_OUT: u8 = 1;
pub const INTF_AUDIO_IN: u8 = 2;
pub const INTF_HID: u8 = 3;

/// Endpoint addresses.
pub const EP_AUDIO_OUT: u8 = 0x06;
/// Carries both capture audio and the implicit feedback reference.
pub const EP_AUDIO_IN: u8 = 0x82;
pub const EP_HID_OUT: u8 = 0x01;
pub const EP_HID_IN: u8 = 0x81;

/// Every HID report, in either direction, is exactly 64 bytes.
pub const HID_REPORT_SIZE: usize = 64;

/// Sample rates the device supports.
pub const SUPPORTED_RATES: [u32; 2] = [44_100, 48_000];

/// Errors reported to control and PCM callers.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// The device has left the bus; all user-visible operations short-circuit.
    #[error("device is not present")]
    NotPresent,
    /// A rate change was requested while a stream is running.
    #[error("stream is running")]
    Busy,
    /// The device did not answer a HID command within the response window.
    #[error("timed out waiting for device response")]
    Timeout,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Lock a mutex, ignoring poisoning: a panic on another thread must not wedge
/// the completion path or teardown.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn rate_is_supported(rate: u32) -> bool {
    SUPPORTED_RATES.contains(&rate)
}
