//! Device lifecycle and the control plane.
//!
//! `Sl3Device` is the root object: it owns the bus handle, both streams, the
//! HID channel, the configuration caches, and the statistics. Construction is
//! two-phase: [`Sl3Device::new`] builds the object so the embedder can wire
//! completion routing, then [`Sl3Device::probe`] claims interfaces and brings
//! the device up. Outstanding `Arc` handles keep the object alive after
//! [`Sl3Device::disconnect`] until the last user drops out, which mirrors the
//! card-released-when-closed contract of the host audio subsystem.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{error, info};

use crate::control::{ControlNotifier, RouteMode};
use crate::hid::HidChannel;
use crate::ratelimit::RateLimit;
use crate::stream::Stream;
use crate::transport::{Direction, UsbHostBus};
use crate::{lock, rate_is_supported, Error, INTF_AUDIO_IN, INTF_AUDIO_OUT, INTF_HID};

/// Delay after rate switches and the init handshake while the device settles.
pub(crate) const STABILIZE_DELAY: Duration = Duration::from_millis(100);

/// Alternate setting that enables the isochronous endpoints.
const STREAM_ALT_SETTING: u8 = 1;

/// Interfaces this driver claims, in claim order. Unwinds run in reverse.
const CLAIMED_INTERFACES: [u8; 3] = [INTF_AUDIO_OUT, INTF_AUDIO_IN, INTF_HID];

/// Configuration supplied by the embedder at load time.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Rate programmed during the init handshake; 44100 or 48000.
    pub default_sample_rate: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_sample_rate: 48_000,
        }
    }
}

/// Streaming statistics counters, written from the completion context.
#[derive(Debug, Default)]
pub(crate) struct Statistics {
    pub(crate) playback_urbs: AtomicU64,
    pub(crate) capture_urbs: AtomicU64,
    pub(crate) playback_underruns: AtomicU32,
    pub(crate) capture_overruns: AtomicU32,
    pub(crate) discontinuities: AtomicU32,
}

/// Point-in-time view of the streaming statistics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub playback_urbs_completed: u64,
    pub capture_urbs_completed: u64,
    pub playback_underruns: u32,
    pub capture_overruns: u32,
    pub discontinuities: u32,
    /// Sample count of the most recent capture URB (the implicit feedback).
    pub feedback_samples: u32,
    pub nominal_rate: u32,
}

/// One Rane SL3 on the bus.
pub struct Sl3Device {
    pub(crate) bus: Arc<dyn UsbHostBus>,
    pub(crate) playback: Stream,
    pub(crate) capture: Stream,
    pub(crate) hid: HidChannel,

    pub(crate) current_rate: AtomicU32,
    pub(crate) routing: Mutex<[RouteMode; 3]>,

    /// Total samples of the most recent capture URB; read by playback fills.
    pub(crate) feedback_samples: Mutex<u32>,

    /// Caches updated from the HID IN dispatch.
    pub(crate) overload_status: Mutex<[u8; 6]>,
    pub(crate) phono_status: Mutex<[u8; 3]>,
    pub(crate) usb_port_status: Mutex<[u8; 4]>,

    pub(crate) notifier: Arc<dyn ControlNotifier>,
    pub(crate) stats: Statistics,
    pub(crate) warn_limit: RateLimit,

    disconnected: AtomicBool,
    /// Serializes rate-switch eligibility checks against stream starts from
    /// user context.
    stream_mutex: Mutex<()>,
}

impl Sl3Device {
    /// Build the device object. No bus traffic happens here; the embedder
    /// wires completion routing to the returned handle, then calls
    /// [`Sl3Device::probe`].
    pub fn new(
        bus: Arc<dyn UsbHostBus>,
        notifier: Arc<dyn ControlNotifier>,
        config: Config,
    ) -> Result<Arc<Self>, Error> {
        if !rate_is_supported(config.default_sample_rate) {
            return Err(Error::Invalid("default_sample_rate must be 44100 or 48000"));
        }
        Ok(Arc::new(Self {
            bus,
            playback: Stream::new(Direction::Playback),
            capture: Stream::new(Direction::Capture),
            hid: HidChannel::new(),
            current_rate: AtomicU32::new(config.default_sample_rate),
            routing: Mutex::new([RouteMode::Usb; 3]),
            feedback_samples: Mutex::new(0),
            overload_status: Mutex::new([0; 6]),
            phono_status: Mutex::new([0; 3]),
            usb_port_status: Mutex::new([0; 4]),
            notifier,
            stats: Statistics::default(),
            warn_limit: RateLimit::default(),
            disconnected: AtomicBool::new(false),
            stream_mutex: Mutex::new(()),
        }))
    }

    /// Claim the audio and HID interfaces, bring up the HID channel, and
    /// allocate the URB rings. Errors unwind every prior step in reverse.
    pub fn probe(&self) -> Result<(), Error> {
        self.claim_interfaces()?;

        if let Err(err) = self.select_stream_alt_settings() {
            self.release_interfaces();
            return Err(err);
        }

        if let Err(err) = self.hid_init() {
            error!("HID init failed: {err}");
            self.reset_stream_alt_settings();
            self.release_interfaces();
            return Err(err);
        }

        self.alloc_urb_rings();

        info!(
            "Rane SL3 probe complete ({} Hz)",
            self.current_rate()
        );
        Ok(())
    }

    /// Tear the device down after it leaves the bus. Idempotent; safe to call
    /// while streams are running. The object itself is freed when the last
    /// `Arc` drops.
    pub fn disconnect(&self) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Rane SL3 disconnecting");

        self.stop_stream(Direction::Playback);
        self.stop_stream(Direction::Capture);
        self.free_urb_rings();
        self.hid_cleanup();
        self.reset_stream_alt_settings();
        self.release_interfaces();

        info!("Rane SL3 disconnected");
    }

    /// Full rate-switch sequence.
    ///
    /// Refuses while either stream runs; otherwise programs the device,
    /// waits out the stabilization delay, and restarts the 44.1 kHz cadence.
    pub fn set_sample_rate(&self, rate: u32) -> Result<(), Error> {
        if !rate_is_supported(rate) {
            return Err(Error::Invalid("unsupported sample rate"));
        }
        if self.is_disconnected() {
            return Err(Error::NotPresent);
        }

        let _serial = lock(&self.stream_mutex);

        if rate == self.current_rate() {
            return Ok(());
        }
        // One stream lock at a time; completions take them in their own order.
        let playback_running = lock(&self.playback.state).running;
        let capture_running = lock(&self.capture.state).running;
        if playback_running || capture_running {
            return Err(Error::Busy);
        }

        self.hid_set_sample_rate(rate)?;
        thread::sleep(STABILIZE_DELAY);
        lock(&self.playback.state).cadence.reset();

        info!("sample rate switched to {rate} Hz");
        Ok(())
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_disconnected(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }

    pub(crate) fn store_current_rate(&self, rate: u32) {
        self.current_rate.store(rate, Ordering::Relaxed);
    }

    /// Whether one direction is actively streaming.
    pub fn stream_running(&self, direction: Direction) -> bool {
        lock(&self.stream(direction).state).running
    }

    /// Snapshot the streaming statistics.
    pub fn statistics(&self) -> StatsSnapshot {
        StatsSnapshot {
            playback_urbs_completed: self.stats.playback_urbs.load(Ordering::Relaxed),
            capture_urbs_completed: self.stats.capture_urbs.load(Ordering::Relaxed),
            playback_underruns: self.stats.playback_underruns.load(Ordering::Relaxed),
            capture_overruns: self.stats.capture_overruns.load(Ordering::Relaxed),
            discontinuities: self.stats.discontinuities.load(Ordering::Relaxed),
            feedback_samples: *lock(&self.feedback_samples),
            nominal_rate: self.current_rate(),
        }
    }

    fn claim_interfaces(&self) -> Result<(), Error> {
        for (claimed, &intf) in CLAIMED_INTERFACES.iter().enumerate() {
            if let Err(err) = self.bus.claim_interface(intf) {
                error!("failed to claim interface {intf}: {err}");
                for &prior in CLAIMED_INTERFACES[..claimed].iter().rev() {
                    self.bus.release_interface(prior);
                }
                return Err(err.into());
            }
        }
        Ok(())
    }

    fn release_interfaces(&self) {
        for &intf in CLAIMED_INTERFACES.iter().rev() {
            self.bus.release_interface(intf);
        }
    }

    fn select_stream_alt_settings(&self) -> Result<(), Error> {
        self.bus
            .set_interface(INTF_AUDIO_OUT, STREAM_ALT_SETTING)?;
        if let Err(err) = self.bus.set_interface(INTF_AUDIO_IN, STREAM_ALT_SETTING) {
            let _ = self.bus.set_interface(INTF_AUDIO_OUT, 0);
            return Err(err.into());
        }
        Ok(())
    }

    fn reset_stream_alt_settings(&self) {
        let _ = self.bus.set_interface(INTF_AUDIO_IN, 0);
        let _ = self.bus.set_interface(INTF_AUDIO_OUT, 0);
    }
}
