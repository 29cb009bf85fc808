//! Mixer-style controls.
//!
//! Four writable enumerated controls (sample rate, per-pair output routing)
//! and two read-only volatile status arrays (overload, phono switches). Put
//! handlers report whether the write changed anything; the HID IN dispatch
//! raises change notifications for the volatile elements through
//! [`ControlNotifier`].

use std::sync::atomic::Ordering;

use crate::device::Sl3Device;
use crate::{lock, Error};

/// Value texts for the Sample Rate control, in item order.
pub const RATE_TEXTS: [&str; 2] = ["44100 Hz", "48000 Hz"];
/// Value texts for the Output Source controls, in item order.
pub const ROUTE_TEXTS: [&str; 2] = ["Analog", "USB"];

/// One of the three stereo channel pairs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Deck {
    /// Channels 1/2.
    A,
    /// Channels 3/4.
    B,
    /// Channels 5/6.
    C,
}

impl Deck {
    pub const ALL: [Deck; 3] = [Deck::A, Deck::B, Deck::C];

    pub fn index(self) -> usize {
        match self {
            Deck::A => 0,
            Deck::B => 1,
            Deck::C => 2,
        }
    }

    /// Channel-pair id carried in the routing command.
    pub fn pair_id(self) -> u8 {
        match self {
            Deck::A => 0x08,
            Deck::B => 0x0E,
            Deck::C => 0x14,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Deck::A => "Deck A",
            Deck::B => "Deck B",
            Deck::C => "Deck C",
        }
    }

    /// Mixer element name of this deck's routing control.
    pub fn control_name(self) -> &'static str {
        match self {
            Deck::A => "Deck A Output Source",
            Deck::B => "Deck B Output Source",
            Deck::C => "Deck C Output Source",
        }
    }
}

/// Output routing of one channel pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteMode {
    /// Pass the analog input straight through.
    Analog,
    /// Play the USB stream.
    Usb,
}

impl RouteMode {
    pub fn from_item(item: u32) -> Option<Self> {
        match item {
            0 => Some(RouteMode::Analog),
            1 => Some(RouteMode::Usb),
            _ => None,
        }
    }

    /// Byte value carried in the routing command.
    pub fn wire(self) -> u8 {
        match self {
            RouteMode::Analog => 0x00,
            RouteMode::Usb => 0x01,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            RouteMode::Analog => "Analog",
            RouteMode::Usb => "USB",
        }
    }
}

/// Volatile elements whose values change without host writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusElement {
    /// "Overload Status", boolean per channel.
    Overload,
    /// "Phono Switch Status", boolean per pair (1 = phono, 0 = line).
    PhonoSwitch,
}

impl StatusElement {
    pub fn control_name(self) -> &'static str {
        match self {
            StatusElement::Overload => "Overload Status",
            StatusElement::PhonoSwitch => "Phono Switch Status",
        }
    }
}

/// Host-side notification bus for volatile control elements.
pub trait ControlNotifier: Send + Sync {
    fn value_changed(&self, element: StatusElement);
}

impl Sl3Device {
    /// Item index of the Sample Rate control (see [`RATE_TEXTS`]).
    pub fn rate_control_get(&self) -> u32 {
        if self.current_rate() == 48_000 {
            1
        } else {
            0
        }
    }

    /// Write the Sample Rate control. Returns whether the value changed.
    pub fn rate_control_put(&self, item: u32) -> Result<bool, Error> {
        let rate = match item {
            0 => 44_100,
            1 => 48_000,
            _ => return Err(Error::Invalid("sample rate item out of range")),
        };
        if rate == self.current_rate() {
            return Ok(false);
        }
        self.set_sample_rate(rate)?;
        Ok(true)
    }

    /// Item index of one deck's Output Source control (see [`ROUTE_TEXTS`]).
    pub fn route_control_get(&self, deck: Deck) -> u32 {
        match lock(&self.routing)[deck.index()] {
            RouteMode::Analog => 0,
            RouteMode::Usb => 1,
        }
    }

    /// Write one deck's Output Source control. Returns whether the value
    /// changed; an unchanged write causes no USB traffic.
    pub fn route_control_put(&self, deck: Deck, item: u32) -> Result<bool, Error> {
        let mode = RouteMode::from_item(item)
            .ok_or(Error::Invalid("routing item out of range"))?;
        self.set_routing(deck, mode)
    }

    /// Per-channel overload flags, most recent notification.
    pub fn overload_control_get(&self) -> [bool; 6] {
        let cached = *lock(&self.overload_status);
        cached.map(|b| b != 0)
    }

    /// Per-pair phono flags (true = phono, false = line).
    pub fn phono_control_get(&self) -> [bool; 3] {
        let cached = *lock(&self.phono_status);
        cached.map(|b| b != 0)
    }

    /// Route one channel pair. Returns whether the cache changed; equal
    /// writes are a no-op without USB traffic.
    pub fn set_routing(&self, deck: Deck, mode: RouteMode) -> Result<bool, Error> {
        if self.is_disconnected() {
            return Err(Error::NotPresent);
        }
        if lock(&self.routing)[deck.index()] == mode {
            return Ok(false);
        }
        self.hid_set_routing(deck.pair_id(), mode.wire())?;
        lock(&self.routing)[deck.index()] = mode;
        Ok(true)
    }

    /// Cached routing of all three pairs.
    pub fn routing(&self) -> [RouteMode; 3] {
        *lock(&self.routing)
    }

    /// Raw bytes of the opaque USB-port notification (0x39).
    pub fn usb_port_status(&self) -> [u8; 4] {
        *lock(&self.usb_port_status)
    }

    pub fn current_rate(&self) -> u32 {
        self.current_rate.load(Ordering::Relaxed)
    }
}
