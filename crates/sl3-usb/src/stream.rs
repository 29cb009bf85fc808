//! Isochronous streaming engine.
//!
//! One URB ring per direction pumps audio between the host PCM ring buffer
//! and 8-packet isochronous URBs. Playback packet sizes follow the capture
//! stream's reported sample counts (implicit feedback) whenever capture runs;
//! otherwise a fractional accumulator spreads the nominal rate across the
//! 8000 microframes of each second. Completion handlers run on the completion
//! context: fixed-size copies only, stream lock held for the bookkeeping,
//! period notifications delivered after the lock is dropped.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use log::{debug, error, warn};

use crate::device::Sl3Device;
use crate::pcm::PcmSubstream;
use crate::transport::{Direction, IsoPacket, IsoUrb, TransportError, UrbStatus};
use crate::{
    lock, BYTES_PER_FRAME, ISO_PACKETS, MAX_FRAMES_PER_PACKET, NUM_URBS, URB_MAX_RETRIES,
};

/// Frames per packet at 48 kHz: 48000 / 8000 microframes.
const SAMPLES_48K: u32 = 6;
/// Base frames per packet at 44.1 kHz; the accumulator supplies the sixth.
const SAMPLES_44K_BASE: u32 = 5;
/// Fractional remainder: 44100 - 5 * 8000.
const FRAC_NUM: u32 = 4100;
/// Microframes per second at high speed.
const FRAC_DENOM: u32 = 8000;

/// Fractional-sample accumulator for 44.1 kHz packet sizing.
///
/// Emits 5 or 6 frames per microframe such that any prefix of the pattern
/// stays within one frame of the nominal rate: after N draws the sum is
/// exactly `floor(N * 44100 / 8000)`. Over 80 microframes that is 441 frames,
/// 10 ms of audio.
#[derive(Debug, Default)]
pub(crate) struct PacketCadence {
    accumulator: u32,
}

impl PacketCadence {
    /// Reset at every rate switch and at each playback start.
    pub(crate) fn reset(&mut self) {
        self.accumulator = 0;
    }

    /// Frame count for the next isochronous packet at `rate`.
    pub(crate) fn next_samples(&mut self, rate: u32) -> u32 {
        if rate == 48_000 {
            return SAMPLES_48K;
        }
        let mut samples = SAMPLES_44K_BASE;
        self.accumulator += FRAC_NUM;
        if self.accumulator >= FRAC_DENOM {
            self.accumulator -= FRAC_DENOM;
            samples += 1;
        }
        samples
    }
}

/// Mutable state of one stream direction, guarded by the stream lock.
pub(crate) struct StreamState {
    /// Parked URBs; a slot is `None` while the bus owns that transfer.
    pub(crate) urbs: [Option<IsoUrb>; NUM_URBS],
    /// Attached host substream while the PCM device is open.
    pub(crate) substream: Option<Arc<dyn PcmSubstream>>,
    /// Rate negotiated by hw_params, used by the cross-direction rate rule.
    pub(crate) rate: Option<u32>,
    /// Hardware pointer in frames; advances monotonically, the host reduces
    /// it modulo the ring size.
    pub(crate) hwptr: u64,
    /// Frames transferred since the last period notification.
    pub(crate) transfer_done: u64,
    pub(crate) running: bool,
    /// Playback only; capture never draws from it.
    pub(crate) cadence: PacketCadence,
}

impl StreamState {
    fn new() -> Self {
        Self {
            urbs: std::array::from_fn(|_| None),
            substream: None,
            rate: None,
            hwptr: 0,
            transfer_done: 0,
            running: false,
            cadence: PacketCadence::default(),
        }
    }
}

pub(crate) struct Stream {
    pub(crate) direction: Direction,
    pub(crate) state: Mutex<StreamState>,
}

impl Stream {
    pub(crate) fn new(direction: Direction) -> Self {
        Self {
            direction,
            state: Mutex::new(StreamState::new()),
        }
    }
}

/// Copy `dst.len()` bytes out of the PCM ring starting at frame `hwptr`,
/// splitting the copy at the ring boundary.
fn ring_copy_out(substream: &dyn PcmSubstream, hwptr: u64, dst: &mut [u8]) {
    let buffer_frames = substream.buffer_frames();
    if buffer_frames == 0 {
        dst.fill(0);
        return;
    }
    let buffer_bytes = buffer_frames * BYTES_PER_FRAME;
    debug_assert!(dst.len() <= buffer_bytes);
    let pos = (hwptr % buffer_frames as u64) as usize * BYTES_PER_FRAME;
    if pos + dst.len() <= buffer_bytes {
        substream.read_ring(pos, dst);
    } else {
        let first = buffer_bytes - pos;
        let (head, tail) = dst.split_at_mut(first);
        substream.read_ring(pos, head);
        substream.read_ring(0, tail);
    }
}

/// Copy `src` into the PCM ring starting at frame `hwptr`, splitting at the
/// ring boundary.
fn ring_copy_in(substream: &dyn PcmSubstream, hwptr: u64, src: &[u8]) {
    let buffer_frames = substream.buffer_frames();
    if buffer_frames == 0 {
        return;
    }
    let buffer_bytes = buffer_frames * BYTES_PER_FRAME;
    debug_assert!(src.len() <= buffer_bytes);
    let pos = (hwptr % buffer_frames as u64) as usize * BYTES_PER_FRAME;
    if pos + src.len() <= buffer_bytes {
        substream.write_ring(pos, src);
    } else {
        let first = buffer_bytes - pos;
        substream.write_ring(pos, &src[..first]);
        substream.write_ring(0, &src[first..]);
    }
}

/// Size a playback URB with silence, before the first submission.
pub(crate) fn prepare_playback_urb(cadence: &mut PacketCadence, urb: &mut IsoUrb, rate: u32) {
    urb.buffer.fill(0);
    let mut offset = 0;
    for pkt in &mut urb.packets {
        let bytes = cadence.next_samples(rate) as usize * BYTES_PER_FRAME;
        *pkt = IsoPacket {
            offset,
            length: bytes,
            actual_length: 0,
        };
        offset += bytes;
    }
    urb.transfer_len = offset;
    urb.status = UrbStatus::Completed;
}

/// Fill a playback URB from the host ring and size its packets.
///
/// `feedback` is `Some(total)` when capture is running; a positive total is
/// distributed ceiling-per-remaining across the 8 packets, clamped to the
/// 7-frame packet limit. Without feedback (or once it is exhausted) the
/// fractional accumulator sizes the remaining packets. Called under the
/// playback stream lock.
pub(crate) fn fill_playback_urb(
    state: &mut StreamState,
    urb: &mut IsoUrb,
    rate: u32,
    feedback: Option<u32>,
) {
    let feedback_driven = feedback.is_some();
    let mut feedback_total = feedback.unwrap_or(0);
    let mut offset = 0;

    for i in 0..ISO_PACKETS {
        let samples = if feedback_driven && feedback_total > 0 {
            let remaining = (ISO_PACKETS - i) as u32;
            let samples = feedback_total
                .div_ceil(remaining)
                .min(MAX_FRAMES_PER_PACKET as u32);
            feedback_total -= samples;
            samples
        } else {
            state.cadence.next_samples(rate)
        };

        let bytes = samples as usize * BYTES_PER_FRAME;
        urb.packets[i] = IsoPacket {
            offset,
            length: bytes,
            actual_length: 0,
        };

        match state.substream.as_deref() {
            Some(substream) => {
                ring_copy_out(substream, state.hwptr, &mut urb.buffer[offset..offset + bytes]);
                state.hwptr = state.hwptr.wrapping_add(samples as u64);
                state.transfer_done += samples as u64;
            }
            None => urb.buffer[offset..offset + bytes].fill(0),
        }
        offset += bytes;
    }
    urb.transfer_len = offset;
}

/// Copy received capture packets into the host ring.
///
/// Packet lengths are truncated to whole frames; a ragged packet counts one
/// discontinuity. Returns `(total_samples, discontinuities)`; the total also
/// covers packets received while no ring is attached, since it drives the
/// playback side as implicit feedback. Called under the capture stream lock.
pub(crate) fn intake_capture_urb(state: &mut StreamState, urb: &IsoUrb) -> (u32, u32) {
    let mut total_samples = 0u32;
    let mut discontinuities = 0u32;

    for pkt in &urb.packets {
        let samples = pkt.actual_length / BYTES_PER_FRAME;
        let bytes = samples * BYTES_PER_FRAME;
        if bytes != pkt.actual_length {
            discontinuities += 1;
        }
        total_samples += samples as u32;
        if bytes == 0 {
            continue;
        }
        if let Some(substream) = state.substream.as_deref() {
            ring_copy_in(substream, state.hwptr, &urb.buffer[pkt.offset..pkt.offset + bytes]);
            state.hwptr = state.hwptr.wrapping_add(samples as u64);
            state.transfer_done += samples as u64;
        }
    }
    (total_samples, discontinuities)
}

/// Consume whole periods from `transfer_done`, returning how many elapsed.
/// Leaves `transfer_done < period_size`.
pub(crate) fn take_elapsed_periods(state: &mut StreamState) -> u32 {
    let Some(substream) = state.substream.as_deref() else {
        return 0;
    };
    let period = substream.period_frames() as u64;
    if period == 0 {
        return 0;
    }
    let mut elapsed = 0;
    while state.transfer_done >= period {
        state.transfer_done -= period;
        elapsed += 1;
    }
    elapsed
}

impl Sl3Device {
    pub(crate) fn stream(&self, direction: Direction) -> &Stream {
        match direction {
            Direction::Playback => &self.playback,
            Direction::Capture => &self.capture,
        }
    }

    /// Populate both URB arenas. Runs at probe, before any streaming.
    pub(crate) fn alloc_urb_rings(&self) {
        for stream in [&self.playback, &self.capture] {
            let endpoint = stream.direction.endpoint();
            let mut st = lock(&stream.state);
            st.urbs = std::array::from_fn(|i| Some(IsoUrb::new(i, endpoint)));
        }
    }

    /// Drop both URB arenas. Idempotent and safe after disconnect.
    pub(crate) fn free_urb_rings(&self) {
        for stream in [&self.playback, &self.capture] {
            let mut st = lock(&stream.state);
            for slot in &mut st.urbs {
                *slot = None;
            }
        }
    }

    /// Prepare and submit the whole URB ring for one direction.
    ///
    /// Idempotent while running. Starting playback also starts capture when
    /// needed, since capture packets are the implicit feedback source. A
    /// submit failure marks the stream stopped and reports the error; parked
    /// and in-flight URBs stay allocated.
    pub(crate) fn start_stream(&self, direction: Direction) -> Result<(), crate::Error> {
        if self.is_disconnected() {
            return Err(crate::Error::NotPresent);
        }
        let stream = self.stream(direction);
        let rate = self.current_rate();

        let mut pending = Vec::with_capacity(NUM_URBS);
        {
            let mut st = lock(&stream.state);
            if st.running {
                return Ok(());
            }
            if direction == Direction::Playback {
                st.cadence.reset();
            }
            // Prepare everything before the first submission so completions
            // never race the preparation pass.
            for index in 0..NUM_URBS {
                let Some(mut urb) = st.urbs[index].take() else {
                    continue;
                };
                match direction {
                    Direction::Playback => prepare_playback_urb(&mut st.cadence, &mut urb, rate),
                    Direction::Capture => urb.prepare_capture(),
                }
                pending.push(urb);
            }
            st.running = true;
        }

        if direction == Direction::Playback && !lock(&self.capture.state).running {
            if let Err(err) = self.start_stream(Direction::Capture) {
                error!("implicit capture start failed: {err}");
                let mut st = lock(&stream.state);
                st.running = false;
                for urb in pending {
                    let index = urb.index;
                    st.urbs[index] = Some(urb);
                }
                return Err(err);
            }
        }

        let mut pending = pending.into_iter();
        while let Some(urb) = pending.next() {
            let index = urb.index;
            if let Err(rejected) = self.bus.submit_iso(urb) {
                error!(
                    "{} URB[{index}] submit failed: {}",
                    direction.label(),
                    rejected.error
                );
                let mut st = lock(&stream.state);
                st.running = false;
                st.urbs[index] = Some(rejected.urb);
                // Everything not yet submitted stays allocated and parked.
                for unsubmitted in pending {
                    let index = unsubmitted.index;
                    st.urbs[index] = Some(unsubmitted);
                }
                return Err(rejected.error.into());
            }
        }

        debug!("{} streaming started ({rate} Hz)", direction.label());
        Ok(())
    }

    /// Stop one direction and synchronously drain its in-flight URBs.
    ///
    /// When this returns, every URB of the direction is parked. Stopping
    /// playback also stops capture if it only ran as the feedback source.
    pub(crate) fn stop_stream(&self, direction: Direction) {
        let stream = self.stream(direction);
        {
            let mut st = lock(&stream.state);
            if !st.running {
                return;
            }
            st.running = false;
        }

        for mut urb in self.bus.cancel_iso(stream.direction.endpoint()) {
            urb.status = UrbStatus::Cancelled;
            match direction {
                Direction::Playback => self.on_playback_complete(urb),
                Direction::Capture => self.on_capture_complete(urb),
            }
        }

        if direction == Direction::Playback {
            let (capture_running, capture_open) = {
                let st = lock(&self.capture.state);
                (st.running, st.substream.is_some())
            };
            if capture_running && !capture_open {
                self.stop_stream(Direction::Capture);
            }
        }

        debug!("{} streaming stopped", direction.label());
    }

    fn park_urb(&self, stream: &Stream, urb: IsoUrb) {
        let index = urb.index;
        let mut st = lock(&stream.state);
        st.urbs[index] = Some(urb);
    }

    /// Resubmit a URB, or park it if the stream has stopped meanwhile. The
    /// running check and the submission happen under the stream lock so a
    /// concurrent `stop` either cancels this URB on the bus or sees it parked.
    fn resubmit_iso(&self, stream: &Stream, urb: IsoUrb) {
        let index = urb.index;
        let mut st = lock(&stream.state);
        if !st.running || self.is_disconnected() {
            st.urbs[index] = Some(urb);
            return;
        }
        if let Err(rejected) = self.bus.submit_iso(urb) {
            if rejected.error != TransportError::Disconnected && self.warn_limit.allow() {
                error!(
                    "{} URB[{index}] resubmit failed: {}",
                    stream.direction.label(),
                    rejected.error
                );
            }
            st.urbs[index] = Some(rejected.urb);
        }
    }

    /// Completion entry point for playback URBs.
    pub fn on_playback_complete(&self, mut urb: IsoUrb) {
        let stream = &self.playback;
        match urb.status {
            UrbStatus::Completed => urb.error_retries = 0,
            UrbStatus::Cancelled => {
                self.park_urb(stream, urb);
                return;
            }
            UrbStatus::DeviceGone => {
                self.mark_disconnected();
                self.park_urb(stream, urb);
                return;
            }
            UrbStatus::Stall => {
                if self.warn_limit.allow() {
                    warn!("playback URB[{}] stall, clearing halt", urb.index);
                }
                let _ = self.bus.clear_halt(stream.direction.endpoint());
                self.resubmit_iso(stream, urb);
                return;
            }
            UrbStatus::Overflow => {
                if self.warn_limit.allow() {
                    warn!("playback URB[{}] overflow", urb.index);
                }
                self.resubmit_iso(stream, urb);
                return;
            }
            UrbStatus::Error => {
                urb.error_retries += 1;
                if urb.error_retries >= URB_MAX_RETRIES {
                    error!(
                        "playback URB[{}] {} consecutive errors, stopping",
                        urb.index, urb.error_retries
                    );
                    let substream = lock(&stream.state).substream.clone();
                    if let Some(substream) = substream {
                        self.stats.playback_underruns.fetch_add(1, Ordering::Relaxed);
                        substream.stop_xrun();
                    }
                    self.park_urb(stream, urb);
                    return;
                }
                if self.warn_limit.allow() {
                    warn!("playback URB[{}] transfer error", urb.index);
                }
                self.resubmit_iso(stream, urb);
                return;
            }
        }

        let capture_running = lock(&self.capture.state).running;
        let rate = self.current_rate();

        let elapsed_substream;
        {
            let mut st = lock(&stream.state);
            if !st.running || self.is_disconnected() {
                let index = urb.index;
                st.urbs[index] = Some(urb);
                return;
            }
            self.stats.playback_urbs.fetch_add(1, Ordering::Relaxed);

            // Snapshot the implicit feedback published by the most recent
            // capture completion.
            let feedback = if capture_running {
                Some(*lock(&self.feedback_samples))
            } else {
                None
            };
            fill_playback_urb(&mut st, &mut urb, rate, feedback);
            let periods = take_elapsed_periods(&mut st);
            elapsed_substream = if periods > 0 { st.substream.clone() } else { None };
        }
        if let Some(substream) = elapsed_substream {
            substream.period_elapsed();
        }
        self.resubmit_iso(stream, urb);
    }

    /// Completion entry point for capture URBs.
    pub fn on_capture_complete(&self, mut urb: IsoUrb) {
        let stream = &self.capture;
        match urb.status {
            UrbStatus::Completed => urb.error_retries = 0,
            UrbStatus::Cancelled => {
                self.park_urb(stream, urb);
                return;
            }
            UrbStatus::DeviceGone => {
                self.mark_disconnected();
                self.park_urb(stream, urb);
                return;
            }
            UrbStatus::Stall => {
                if self.warn_limit.allow() {
                    warn!("capture URB[{}] stall, clearing halt", urb.index);
                }
                let _ = self.bus.clear_halt(stream.direction.endpoint());
                urb.prepare_capture();
                self.resubmit_iso(stream, urb);
                return;
            }
            UrbStatus::Overflow => {
                if self.warn_limit.allow() {
                    warn!("capture URB[{}] overflow", urb.index);
                }
                urb.prepare_capture();
                self.resubmit_iso(stream, urb);
                return;
            }
            UrbStatus::Error => {
                urb.error_retries += 1;
                if urb.error_retries >= URB_MAX_RETRIES {
                    error!(
                        "capture URB[{}] {} consecutive errors, stopping",
                        urb.index, urb.error_retries
                    );
                    let substream = lock(&stream.state).substream.clone();
                    if let Some(substream) = substream {
                        self.stats.capture_overruns.fetch_add(1, Ordering::Relaxed);
                        substream.stop_xrun();
                    }
                    self.park_urb(stream, urb);
                    return;
                }
                if self.warn_limit.allow() {
                    warn!("capture URB[{}] transfer error", urb.index);
                }
                urb.prepare_capture();
                self.resubmit_iso(stream, urb);
                return;
            }
        }

        let (total_samples, elapsed_substream);
        {
            let mut st = lock(&stream.state);
            if !st.running || self.is_disconnected() {
                let index = urb.index;
                st.urbs[index] = Some(urb);
                return;
            }
            self.stats.capture_urbs.fetch_add(1, Ordering::Relaxed);

            let (samples, discontinuities) = intake_capture_urb(&mut st, &urb);
            total_samples = samples;
            if discontinuities > 0 {
                self.stats
                    .discontinuities
                    .fetch_add(discontinuities, Ordering::Relaxed);
            }
            let periods = take_elapsed_periods(&mut st);
            elapsed_substream = if periods > 0 { st.substream.clone() } else { None };
        }

        // Publish the feedback total that drives the next playback fill.
        *lock(&self.feedback_samples) = total_samples;

        if let Some(substream) = elapsed_substream {
            substream.period_elapsed();
        }

        urb.prepare_capture();
        self.resubmit_iso(stream, urb);
    }
}
