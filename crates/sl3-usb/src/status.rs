//! Human-readable status surfaces.
//!
//! Text renderers for the device status, overload and phono caches, the
//! opaque USB-port bytes, and the streaming statistics. The embedder exposes
//! these wherever it surfaces card information.

use std::fmt::{self, Write};

use crate::control::Deck;
use crate::device::Sl3Device;
use crate::transport::Direction;

const CHANNEL_NAMES: [&str; 6] = [
    "Deck A Left ",
    "Deck A Right",
    "Deck B Left ",
    "Deck B Right",
    "Deck C Left ",
    "Deck C Right",
];

fn running_label(running: bool) -> &'static str {
    if running {
        "running"
    } else {
        "stopped"
    }
}

impl Sl3Device {
    /// Overall device status: rate, routing, stream states.
    pub fn render_status(&self, out: &mut impl Write) -> fmt::Result {
        writeln!(out, "Rane SL3 USB Audio Interface")?;
        writeln!(out, "  Sample Rate:    {} Hz", self.current_rate())?;
        let routing = self.routing();
        for deck in Deck::ALL {
            writeln!(
                out,
                "  {} Routing: {}",
                deck.name(),
                routing[deck.index()].label()
            )?;
        }
        writeln!(
            out,
            "  Playback:       {}",
            running_label(self.stream_running(Direction::Playback))
        )?;
        writeln!(
            out,
            "  Capture:        {}",
            running_label(self.stream_running(Direction::Capture))
        )?;
        writeln!(
            out,
            "  Disconnected:   {}",
            if self.is_disconnected() { "yes" } else { "no" }
        )
    }

    /// Per-channel overload flags.
    pub fn render_overload(&self, out: &mut impl Write) -> fmt::Result {
        writeln!(out, "Overload Status")?;
        let overload = self.overload_control_get();
        for (name, &active) in CHANNEL_NAMES.iter().zip(overload.iter()) {
            writeln!(out, "  {name}: {}", if active { "OVERLOAD" } else { "OK" })?;
        }
        Ok(())
    }

    /// Per-pair phono/line switch positions.
    pub fn render_phono(&self, out: &mut impl Write) -> fmt::Result {
        writeln!(out, "Phono Switch Status")?;
        let phono = self.phono_control_get();
        for deck in Deck::ALL {
            writeln!(
                out,
                "  {}: {}",
                deck.name(),
                if phono[deck.index()] { "PHONO" } else { "LINE" }
            )?;
        }
        Ok(())
    }

    /// Raw bytes of the opaque USB-port notification.
    pub fn render_usb_port(&self, out: &mut impl Write) -> fmt::Result {
        writeln!(out, "USB Port Status")?;
        for (i, byte) in self.usb_port_status().iter().enumerate() {
            writeln!(out, "  Byte {i}: {byte:#04x}")?;
        }
        Ok(())
    }

    /// Streaming statistics.
    pub fn render_statistics(&self, out: &mut impl Write) -> fmt::Result {
        let stats = self.statistics();

        writeln!(out, "Streaming Statistics")?;
        writeln!(
            out,
            "  Playback URBs Completed: {}",
            stats.playback_urbs_completed
        )?;
        writeln!(
            out,
            "  Capture URBs Completed:  {}",
            stats.capture_urbs_completed
        )?;
        writeln!(out, "  Playback Underruns:      {}", stats.playback_underruns)?;
        writeln!(out, "  Capture Overruns:        {}", stats.capture_overruns)?;
        writeln!(out, "  Discontinuities:         {}", stats.discontinuities)?;
        writeln!(
            out,
            "  Implicit Feedback Samples: {}",
            stats.feedback_samples
        )?;
        writeln!(out, "  Nominal Rate:            {} Hz", stats.nominal_rate)
    }
}
