//! Transport primitives: URB objects and the host-bus seam.
//!
//! A URB owns its transfer buffer exclusively. Submission moves the URB to the
//! bus; the completion path hands it back with `status` and, for isochronous
//! transfers, per-packet actual lengths filled in. While a stream is idle its
//! URBs are parked in the owning stream's arena, so teardown never has to
//! chase raw pointers: a URB is either in the arena or on the bus, never both.

use std::time::Duration;

use thiserror::Error;

use crate::{
    EP_AUDIO_IN, EP_AUDIO_OUT, HID_REPORT_SIZE, ISO_PACKETS, MAX_PACKET_SIZE, URB_BUFFER_SIZE,
};

/// Bus-level failures surfaced by a [`UsbHostBus`] implementation.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("device is gone")]
    Disconnected,
    #[error("transfer timed out")]
    Timeout,
    #[error("endpoint stalled")]
    Stall,
    #[error("transfer rejected by host controller")]
    Rejected,
}

/// Completion status of a URB, as reported by the host controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UrbStatus {
    /// Transfer finished; packet actual lengths are valid.
    Completed,
    /// Killed by the driver. Normal shutdown, never resubmitted.
    Cancelled,
    /// The device left the bus.
    DeviceGone,
    /// The endpoint reported a halt condition.
    Stall,
    /// The device sent more data than the packet slot could hold.
    Overflow,
    /// Any other transport error.
    Error,
}

/// Direction of an audio stream, named from the host's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Playback,
    Capture,
}

impl Direction {
    pub fn endpoint(self) -> u8 {
        match self {
            Direction::Playback => EP_AUDIO_OUT,
            Direction::Capture => EP_AUDIO_IN,
        }
    }

    pub fn opposite(self) -> Direction {
        match self {
            Direction::Playback => Direction::Capture,
            Direction::Capture => Direction::Playback,
        }
    }

    pub(crate) fn label(self) -> &'static str {
        match self {
            Direction::Playback => "playback",
            Direction::Capture => "capture",
        }
    }
}

/// One isochronous packet slot within a URB.
///
/// `offset` and `length` are set by the driver before submission;
/// `actual_length` is reported by the controller on IN completions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IsoPacket {
    pub offset: usize,
    pub length: usize,
    pub actual_length: usize,
}

/// An isochronous URB: 8 packet descriptors over a 1008-byte transfer buffer,
/// scheduled at one packet per microframe, as soon as possible.
#[derive(Debug)]
pub struct IsoUrb {
    /// Slot in the owning stream's arena.
    pub index: usize,
    pub endpoint: u8,
    pub buffer: Box<[u8; URB_BUFFER_SIZE]>,
    pub packets: [IsoPacket; ISO_PACKETS],
    /// Sum of packet lengths for this submission.
    pub transfer_len: usize,
    pub status: UrbStatus,
    /// Consecutive errors without an intervening success.
    pub(crate) error_retries: u8,
}

impl IsoUrb {
    pub fn new(index: usize, endpoint: u8) -> Self {
        Self {
            index,
            endpoint,
            buffer: Box::new([0; URB_BUFFER_SIZE]),
            packets: [IsoPacket::default(); ISO_PACKETS],
            transfer_len: 0,
            status: UrbStatus::Completed,
            error_retries: 0,
        }
    }

    /// Size every packet slot to the maximum payload, ready to receive.
    pub fn prepare_capture(&mut self) {
        let mut offset = 0;
        for pkt in &mut self.packets {
            *pkt = IsoPacket {
                offset,
                length: MAX_PACKET_SIZE,
                actual_length: 0,
            };
            offset += MAX_PACKET_SIZE;
        }
        self.transfer_len = offset;
        self.status = UrbStatus::Completed;
    }
}

/// The persistent HID interrupt IN URB and its report buffer.
#[derive(Debug)]
pub struct HidInUrb {
    pub buffer: [u8; HID_REPORT_SIZE],
    pub actual_length: usize,
    pub status: UrbStatus,
}

impl HidInUrb {
    pub fn new() -> Self {
        Self {
            buffer: [0; HID_REPORT_SIZE],
            actual_length: 0,
            status: UrbStatus::Completed,
        }
    }

    pub fn reset(&mut self) {
        self.actual_length = 0;
        self.status = UrbStatus::Completed;
    }
}

impl Default for HidInUrb {
    fn default() -> Self {
        Self::new()
    }
}

/// A rejected submission. The bus hands the URB back so the caller can park it.
#[derive(Debug)]
pub struct SubmitError {
    pub urb: IsoUrb,
    pub error: TransportError,
}

/// Host-controller seam.
///
/// Implementations route completed URBs back into the driver's
/// `on_playback_complete` / `on_capture_complete` / `on_hid_in_complete`
/// entry points. `submit_iso` may be called from the completion context and
/// must not block; the blocking calls (`interrupt_out`) are only reached from
/// user/control context.
pub trait UsbHostBus: Send + Sync {
    fn claim_interface(&self, intf: u8) -> Result<(), TransportError>;

    fn release_interface(&self, intf: u8);

    /// Select an alternate setting on a claimed interface.
    fn set_interface(&self, intf: u8, alt_setting: u8) -> Result<(), TransportError>;

    /// Queue an isochronous URB. Must not block.
    fn submit_iso(&self, urb: IsoUrb) -> Result<(), SubmitError>;

    /// Cancel every in-flight isochronous URB on `endpoint` and hand them
    /// back. The driver drains the returned URBs through its completion path
    /// with [`UrbStatus::Cancelled`], which makes `stop` synchronous: when it
    /// returns, nothing is in flight.
    fn cancel_iso(&self, endpoint: u8) -> Vec<IsoUrb>;

    /// Arm (or re-arm) the persistent HID interrupt IN URB.
    fn submit_hid_in(&self, urb: HidInUrb) -> Result<(), TransportError>;

    /// Cancel the HID IN URB if armed.
    fn cancel_hid_in(&self) -> Option<HidInUrb>;

    /// Synchronous interrupt OUT transfer. Returns the number of bytes
    /// transferred. Blocking; user/control context only.
    fn interrupt_out(
        &self,
        endpoint: u8,
        report: &[u8; HID_REPORT_SIZE],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    /// Clear a halt (stall) condition on an endpoint.
    fn clear_halt(&self, endpoint: u8) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_preparation_sizes_every_slot_to_max() {
        let mut urb = IsoUrb::new(3, EP_AUDIO_IN);
        urb.packets[2].actual_length = 90;
        urb.prepare_capture();

        assert_eq!(urb.transfer_len, URB_BUFFER_SIZE);
        for (i, pkt) in urb.packets.iter().enumerate() {
            assert_eq!(pkt.offset, i * MAX_PACKET_SIZE);
            assert_eq!(pkt.length, MAX_PACKET_SIZE);
            assert_eq!(pkt.actual_length, 0);
        }
    }

    #[test]
    fn direction_endpoints() {
        assert_eq!(Direction::Playback.endpoint(), EP_AUDIO_OUT);
        assert_eq!(Direction::Capture.endpoint(), EP_AUDIO_IN);
        assert_eq!(Direction::Playback.opposite(), Direction::Capture);
    }
}
