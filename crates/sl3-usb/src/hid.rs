//! HID command and notification channel.
//!
//! All configuration rides on 64-byte vendor HID reports. Host-to-device
//! commands go out over the interrupt OUT endpoint, serialized under the HID
//! mutex; a single persistent interrupt IN URB carries both synchronous
//! command responses and unsolicited device notifications, demultiplexed on
//! the first report byte. The serialization guarantees at most one command is
//! ever waiting, so a single-slot response mailbox is sufficient.

use std::sync::{Condvar, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use log::{info, warn};

use crate::control::StatusElement;
use crate::device::{Sl3Device, STABILIZE_DELAY};
use crate::transport::{HidInUrb, TransportError, UrbStatus};
use crate::{lock, rate_is_supported, Error, EP_HID_IN, EP_HID_OUT, HID_REPORT_SIZE, PRODUCT_ID, VENDOR_ID};

/// Command ids issued by the host.
pub const CMD_INIT: u8 = 0x03;
pub const CMD_SET_SAMPLE_RATE: u8 = 0x31;
pub const CMD_QUERY_PHONO: u8 = 0x32;
pub const CMD_SET_ROUTING: u8 = 0x33;
pub const CMD_STATUS: u8 = 0x36;

/// Notification ids pushed by the device.
pub const NOTIFY_OVERLOAD: u8 = 0x34;
pub const NOTIFY_PHONO: u8 = 0x38;
pub const NOTIFY_USB_PORT: u8 = 0x39;

/// USB-level timeout for an interrupt OUT transfer.
const USB_TIMEOUT: Duration = Duration::from_millis(1000);
/// How long a command waits on the response mailbox.
const RESPONSE_TIMEOUT: Duration = Duration::from_millis(500);

/// Build a 64-byte report: command id, VID/PID header, payload.
///
/// Bytes 1..5 carry the vendor and product ids in big-endian byte order (as
/// seen in USB captures of the vendor software). Payloads longer than the 59
/// available bytes are truncated; the remainder is zero.
pub fn build_report(cmd: u8, payload: &[u8]) -> [u8; HID_REPORT_SIZE] {
    let mut report = [0u8; HID_REPORT_SIZE];
    report[0] = cmd;
    report[1..3].copy_from_slice(&VENDOR_ID.to_be_bytes());
    report[3..5].copy_from_slice(&PRODUCT_ID.to_be_bytes());
    let len = payload.len().min(HID_REPORT_SIZE - 5);
    report[5..5 + len].copy_from_slice(&payload[..len]);
    report
}

/// Single-slot response mailbox with a completion signal.
#[derive(Default)]
struct ResponseSlot {
    slot: Mutex<Option<[u8; HID_REPORT_SIZE]>>,
    signal: Condvar,
}

impl ResponseSlot {
    fn reset(&self) {
        lock(&self.slot).take();
    }

    fn complete(&self, report: [u8; HID_REPORT_SIZE]) {
        *lock(&self.slot) = Some(report);
        self.signal.notify_all();
    }

    fn wait(&self, timeout: Duration) -> Option<[u8; HID_REPORT_SIZE]> {
        let guard = lock(&self.slot);
        let (mut guard, _timed_out) = self
            .signal
            .wait_timeout_while(guard, timeout, |slot| slot.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        guard.take()
    }
}

/// State of the HID channel.
///
/// The `out` mutex is the HID mutex: it owns the 64-byte OUT report scratch
/// and, by serializing commands, guards the response mailbox round-trip. It is
/// never held across the IN completion path.
pub(crate) struct HidChannel {
    out: Mutex<[u8; HID_REPORT_SIZE]>,
    response: ResponseSlot,
}

impl HidChannel {
    pub(crate) fn new() -> Self {
        Self {
            out: Mutex::new([0; HID_REPORT_SIZE]),
            response: ResponseSlot::default(),
        }
    }
}

/// Classification of a received IN report.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum InEvent {
    Overload([u8; 6]),
    Phono([u8; 3]),
    UsbPort([u8; 4]),
    /// Anything that is not a known notification is a command response.
    Response,
    /// Known notification code but too short; dropped and resubmitted.
    Runt,
}

pub(crate) fn classify(data: &[u8; HID_REPORT_SIZE], len: usize) -> InEvent {
    if len < 1 {
        return InEvent::Runt;
    }
    match data[0] {
        NOTIFY_OVERLOAD if len >= 11 => {
            let mut bytes = [0u8; 6];
            bytes.copy_from_slice(&data[5..11]);
            InEvent::Overload(bytes)
        }
        NOTIFY_PHONO if len >= 8 => {
            let mut bytes = [0u8; 3];
            bytes.copy_from_slice(&data[5..8]);
            InEvent::Phono(bytes)
        }
        NOTIFY_USB_PORT if len >= 9 => {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&data[5..9]);
            InEvent::UsbPort(bytes)
        }
        NOTIFY_OVERLOAD | NOTIFY_PHONO | NOTIFY_USB_PORT => InEvent::Runt,
        _ => InEvent::Response,
    }
}

impl Sl3Device {
    /// Send one command while already holding the HID mutex.
    ///
    /// With `wait`, resets the mailbox before the OUT transfer and blocks
    /// until the response arrives or the window elapses.
    fn hid_send_locked(
        &self,
        out: &mut [u8; HID_REPORT_SIZE],
        cmd: u8,
        payload: &[u8],
        wait: bool,
    ) -> Result<Option<[u8; HID_REPORT_SIZE]>, Error> {
        if self.is_disconnected() {
            return Err(Error::NotPresent);
        }

        *out = build_report(cmd, payload);
        if wait {
            self.hid.response.reset();
        }

        self.bus
            .interrupt_out(EP_HID_OUT, out, USB_TIMEOUT)
            .map_err(|err| {
                warn!("HID send cmd {cmd:#04x} failed: {err}");
                err
            })?;

        if !wait {
            return Ok(None);
        }
        match self.hid.response.wait(RESPONSE_TIMEOUT) {
            Some(response) => Ok(Some(response)),
            None => {
                warn!("HID cmd {cmd:#04x} response timeout");
                Err(Error::Timeout)
            }
        }
    }

    /// Send one command under the HID mutex.
    pub(crate) fn hid_send_command(
        &self,
        cmd: u8,
        payload: &[u8],
        wait: bool,
    ) -> Result<Option<[u8; HID_REPORT_SIZE]>, Error> {
        let mut out = lock(&self.hid.out);
        self.hid_send_locked(&mut out, cmd, payload, wait)
    }

    /// Tell the device to switch its sample clock. Updates the cached rate on
    /// success; the full user-facing sequence lives in
    /// [`Sl3Device::set_sample_rate`].
    pub(crate) fn hid_set_sample_rate(&self, rate: u32) -> Result<(), Error> {
        if !rate_is_supported(rate) {
            return Err(Error::Invalid("unsupported sample rate"));
        }
        let payload = (rate as u16).to_be_bytes();
        let mut out = lock(&self.hid.out);
        self.hid_send_locked(&mut out, CMD_SET_SAMPLE_RATE, &payload, true)?;
        self.store_current_rate(rate);
        Ok(())
    }

    /// Set output routing for one channel pair. Fire-and-forget: the device
    /// does not answer this command.
    pub(crate) fn hid_set_routing(&self, pair_id: u8, mode: u8) -> Result<(), Error> {
        // Second byte is a sub-command constant observed on the wire.
        let payload = [pair_id, 0x01, mode];
        self.hid_send_command(CMD_SET_ROUTING, &payload, false)?;
        Ok(())
    }

    /// Bring up the HID channel: arm the IN URB and run the init handshake.
    ///
    /// Handshake failures are logged and tolerated; the device frequently
    /// keeps working even when an init step times out.
    pub(crate) fn hid_init(&self) -> Result<(), Error> {
        self.bus.submit_hid_in(HidInUrb::new())?;

        {
            let mut out = lock(&self.hid.out);

            if let Err(err) = self.hid_send_locked(&mut out, CMD_INIT, &[0x00], true) {
                warn!("HID init query failed: {err} (continuing)");
            }
            if let Err(err) = self.hid_send_locked(&mut out, CMD_STATUS, &[0x01], true) {
                warn!("HID status query failed: {err} (continuing)");
            }
            let rate_payload = (self.current_rate() as u16).to_be_bytes();
            if let Err(err) = self.hid_send_locked(&mut out, CMD_SET_SAMPLE_RATE, &rate_payload, true) {
                warn!("HID set sample rate failed: {err} (continuing)");
            }
            match self.hid_send_locked(&mut out, CMD_QUERY_PHONO, &[], true) {
                Ok(Some(response)) => {
                    let mut cache = lock(&self.phono_status);
                    cache.copy_from_slice(&response[5..8]);
                }
                Ok(None) => {}
                Err(err) => warn!("HID phono query failed: {err} (continuing)"),
            }
        }

        // Device stabilization.
        thread::sleep(STABILIZE_DELAY);

        info!("HID interface initialized");
        Ok(())
    }

    /// Kill the persistent IN URB and drop its buffer. Idempotent.
    pub(crate) fn hid_cleanup(&self) {
        let _ = self.bus.cancel_hid_in();
    }

    /// Completion entry point for the persistent HID IN URB.
    ///
    /// Runs on the completion context: no blocking, no HID mutex.
    pub fn on_hid_in_complete(&self, mut urb: HidInUrb) {
        match urb.status {
            UrbStatus::Completed => {
                if urb.actual_length >= 1 {
                    self.dispatch_hid_report(&urb);
                }
            }
            UrbStatus::Cancelled => return,
            UrbStatus::DeviceGone => {
                self.mark_disconnected();
                return;
            }
            UrbStatus::Stall => {
                if self.warn_limit.allow() {
                    warn!("HID IN URB stall, clearing halt");
                }
                let _ = self.bus.clear_halt(EP_HID_IN);
            }
            UrbStatus::Overflow | UrbStatus::Error => {
                if self.warn_limit.allow() {
                    warn!("HID IN URB error: {:?}", urb.status);
                }
            }
        }

        if self.is_disconnected() {
            return;
        }
        urb.reset();
        if let Err(err) = self.bus.submit_hid_in(urb) {
            if err != TransportError::Disconnected {
                warn!("HID IN URB resubmit failed: {err}");
            }
        }
    }

    fn dispatch_hid_report(&self, urb: &HidInUrb) {
        match classify(&urb.buffer, urb.actual_length) {
            InEvent::Overload(bytes) => {
                *lock(&self.overload_status) = bytes;
                self.notifier.value_changed(StatusElement::Overload);
            }
            InEvent::Phono(bytes) => {
                *lock(&self.phono_status) = bytes;
                self.notifier.value_changed(StatusElement::PhonoSwitch);
            }
            InEvent::UsbPort(bytes) => {
                *lock(&self.usb_port_status) = bytes;
            }
            InEvent::Response => {
                self.hid.response.complete(urb.buffer);
            }
            InEvent::Runt => {}
        }
    }
}
