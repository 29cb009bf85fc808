//! Host-PCM collaborator seam and the PCM operations.
//!
//! The host audio subsystem owns the ring buffer and the period protocol;
//! this module defines the narrow trait the engine consumes and the PCM
//! operations the embedder wires up (open/close, parameter negotiation,
//! prepare, trigger, pointer). Both directions share one device clock, so a
//! custom rate rule pins an opening substream to the rate the other direction
//! already negotiated.

use std::sync::Arc;

use crate::device::Sl3Device;
use crate::transport::Direction;
use crate::{lock, BYTES_PER_FRAME, NUM_CHANNELS, Error};

/// Host PCM substream, as seen from the completion path.
///
/// Ring access is interior-mutable (the host side backs it with shared
/// mapped memory); the engine only touches the ring from the completion
/// context under the stream lock. `period_elapsed` and `stop_xrun` are
/// notifications delivered after the stream lock is dropped and must not call
/// back into the driver synchronously.
pub trait PcmSubstream: Send + Sync {
    /// Ring size in frames.
    fn buffer_frames(&self) -> usize;

    /// Period size in frames.
    fn period_frames(&self) -> usize;

    /// Copy out of the ring starting at byte `offset`.
    fn read_ring(&self, offset: usize, dst: &mut [u8]);

    /// Copy into the ring starting at byte `offset`.
    fn write_ring(&self, offset: usize, src: &[u8]);

    /// One or more period boundaries were crossed by the last completion.
    fn period_elapsed(&self);

    /// A persistent transport error ended the stream; report an xrun.
    fn stop_xrun(&self);
}

/// Sample layout of the audio endpoints.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PcmFormat {
    /// 24-bit little-endian, packed into 3 bytes.
    S24Packed3Le,
}

/// Capabilities of the PCM device this driver exposes.
#[derive(Clone, Copy, Debug)]
pub struct PcmHardware {
    pub format: PcmFormat,
    pub channels: usize,
    pub rates: [u32; 2],
    pub buffer_bytes_max: usize,
    pub period_bytes_min: usize,
    pub period_bytes_max: usize,
    pub periods_min: usize,
    pub periods_max: usize,
    pub interleaved: bool,
    pub mmap: bool,
    pub block_transfer: bool,
}

pub const PCM_HARDWARE: PcmHardware = PcmHardware {
    format: PcmFormat::S24Packed3Le,
    channels: NUM_CHANNELS,
    rates: crate::SUPPORTED_RATES,
    buffer_bytes_max: 256 * 1024,
    period_bytes_min: BYTES_PER_FRAME,
    period_bytes_max: 128 * 1024,
    periods_min: 2,
    periods_max: 1024,
    interleaved: true,
    mmap: true,
    block_transfer: true,
};

/// Closed integer interval used during PCM parameter negotiation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateInterval {
    pub min: u32,
    pub max: u32,
}

impl RateInterval {
    /// The full interval the hardware supports.
    pub fn hardware() -> Self {
        Self {
            min: crate::SUPPORTED_RATES[0],
            max: crate::SUPPORTED_RATES[1],
        }
    }

    /// Refine to the fixed point `rate`. Returns whether the interval
    /// changed; an empty result is an invalid-argument error.
    pub fn refine_to(&mut self, rate: u32) -> Result<bool, Error> {
        if rate < self.min || rate > self.max {
            return Err(Error::Invalid("rate interval is empty"));
        }
        let changed = self.min != rate || self.max != rate;
        self.min = rate;
        self.max = rate;
        Ok(changed)
    }
}

/// PCM trigger commands reachable from the host's atomic trigger context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trigger {
    Start,
    Stop,
}

/// Result of a pointer query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PcmPointer {
    /// Current hardware position, reduced modulo the ring size.
    Frames(u64),
    /// The stream is dead (device gone); the host should error out.
    Xrun,
}

impl Sl3Device {
    /// Attach a host substream to one direction.
    pub fn pcm_open(&self, direction: Direction, substream: Arc<dyn PcmSubstream>) -> Result<(), Error> {
        if self.is_disconnected() {
            return Err(Error::NotPresent);
        }
        let mut st = lock(&self.stream(direction).state);
        st.substream = Some(substream);
        st.rate = None;
        Ok(())
    }

    /// Detach the substream, killing any lingering URBs first.
    pub fn pcm_close(&self, direction: Direction) {
        self.stop_stream(direction);
        let mut st = lock(&self.stream(direction).state);
        st.substream = None;
        st.rate = None;
    }

    /// Parameter negotiation: runs the full rate-switch sequence, then
    /// records the rate for the cross-direction constraint.
    pub fn pcm_hw_params(&self, direction: Direction, rate: u32) -> Result<(), Error> {
        if self.is_disconnected() {
            return Err(Error::NotPresent);
        }
        self.set_sample_rate(rate)?;
        lock(&self.stream(direction).state).rate = Some(rate);
        Ok(())
    }

    /// Reset the stream position before a (re)start.
    pub fn pcm_prepare(&self, direction: Direction) -> Result<(), Error> {
        if self.is_disconnected() {
            return Err(Error::NotPresent);
        }
        let mut st = lock(&self.stream(direction).state);
        st.hwptr = 0;
        st.transfer_done = 0;
        Ok(())
    }

    /// Start or stop a stream from the host trigger callback.
    ///
    /// Stop runs in the host's atomic context and must not sleep, so it only
    /// clears the running flags; in-flight URBs park themselves as their
    /// completions observe the stopped stream. The draining stop belongs to
    /// `pcm_close`, rate changes, and disconnect.
    pub fn pcm_trigger(&self, direction: Direction, trigger: Trigger) -> Result<(), Error> {
        if self.is_disconnected() {
            return Err(Error::NotPresent);
        }
        match trigger {
            Trigger::Start => self.start_stream(direction),
            Trigger::Stop => {
                lock(&self.stream(direction).state).running = false;
                if direction == Direction::Playback {
                    let mut capture = lock(&self.capture.state);
                    if capture.running && capture.substream.is_none() {
                        capture.running = false;
                    }
                }
                Ok(())
            }
        }
    }

    /// Current hardware position in frames, modulo the ring size.
    pub fn pcm_pointer(&self, direction: Direction) -> PcmPointer {
        if self.is_disconnected() {
            return PcmPointer::Xrun;
        }
        let st = lock(&self.stream(direction).state);
        match st.substream.as_deref() {
            Some(substream) => {
                let frames = substream.buffer_frames() as u64;
                if frames == 0 {
                    PcmPointer::Frames(0)
                } else {
                    PcmPointer::Frames(st.hwptr % frames)
                }
            }
            None => PcmPointer::Frames(0),
        }
    }

    /// Rate already negotiated by the opposite direction, if its substream is
    /// open. Feeds the PCM rate rule.
    pub fn partner_rate(&self, direction: Direction) -> Option<u32> {
        let st = lock(&self.stream(direction.opposite()).state);
        if st.substream.is_some() {
            st.rate
        } else {
            None
        }
    }

    /// The custom rate rule: both directions must share one rate. Refines
    /// `interval` to the partner's rate when one is pinned; returns whether
    /// the interval changed.
    pub fn apply_rate_rule(
        &self,
        direction: Direction,
        interval: &mut RateInterval,
    ) -> Result<bool, Error> {
        match self.partner_rate(direction) {
            Some(rate) => interval.refine_to(rate),
            None => Ok(false),
        }
    }
}
