//! Test doubles: a scriptable host bus, a PCM ring, and a notifier sink.
//!
//! The tests play the host controller: they pop submitted URBs off the mock
//! bus, decorate them with a completion status (and capture lengths), and
//! feed them back through the driver's completion entry points.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use sl3_usb::transport::SubmitError;
use sl3_usb::{
    Config, ControlNotifier, Direction, HidInUrb, IsoUrb, PcmSubstream, Sl3Device, StatusElement,
    TransportError, UrbStatus, UsbHostBus, BYTES_PER_FRAME, EP_AUDIO_IN, EP_AUDIO_OUT,
    HID_REPORT_SIZE,
};

pub type Responder = Box<dyn Fn(&[u8; HID_REPORT_SIZE]) -> Option<[u8; HID_REPORT_SIZE]> + Send + Sync>;

#[derive(Default)]
pub struct BusState {
    pub claimed: Vec<u8>,
    pub released: Vec<u8>,
    pub alt_settings: Vec<(u8, u8)>,
    /// In-flight isochronous URBs, in submission order.
    pub iso_out: VecDeque<IsoUrb>,
    pub iso_in: VecDeque<IsoUrb>,
    /// The armed HID interrupt IN URB, if any.
    pub hid_in: Option<HidInUrb>,
    /// Every OUT report the driver sent, in order.
    pub out_reports: Vec<[u8; HID_REPORT_SIZE]>,
    pub cleared_halts: Vec<u8>,

    /// Fault injection.
    pub fail_claim: Option<u8>,
    pub fail_submit_iso: bool,
    pub fail_interrupt_out: Option<TransportError>,
}

pub struct MockBus {
    pub state: Mutex<BusState>,
    /// Completion sink; wired after `Sl3Device::new`.
    pub device: Mutex<Weak<Sl3Device>>,
    /// Synchronous auto-responder for OUT reports, standing in for the
    /// device's firmware.
    pub responder: Mutex<Option<Responder>>,
}

impl MockBus {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BusState::default()),
            device: Mutex::new(Weak::new()),
            responder: Mutex::new(None),
        }
    }

    fn device(&self) -> Option<Arc<Sl3Device>> {
        self.device.lock().unwrap().upgrade()
    }

    /// Complete the armed HID IN URB with `report` and `status`.
    pub fn deliver_hid(&self, report: &[u8; HID_REPORT_SIZE], actual_length: usize, status: UrbStatus) -> bool {
        let urb = self.state.lock().unwrap().hid_in.take();
        let Some(mut urb) = urb else {
            return false;
        };
        urb.buffer = *report;
        urb.actual_length = actual_length;
        urb.status = status;
        match self.device() {
            Some(device) => {
                device.on_hid_in_complete(urb);
                true
            }
            None => false,
        }
    }
}

impl UsbHostBus for MockBus {
    fn claim_interface(&self, intf: u8) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_claim == Some(intf) {
            return Err(TransportError::Rejected);
        }
        state.claimed.push(intf);
        Ok(())
    }

    fn release_interface(&self, intf: u8) {
        self.state.lock().unwrap().released.push(intf);
    }

    fn set_interface(&self, intf: u8, alt_setting: u8) -> Result<(), TransportError> {
        self.state.lock().unwrap().alt_settings.push((intf, alt_setting));
        Ok(())
    }

    fn submit_iso(&self, urb: IsoUrb) -> Result<(), SubmitError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_submit_iso {
            return Err(SubmitError {
                urb,
                error: TransportError::Rejected,
            });
        }
        match urb.endpoint {
            EP_AUDIO_OUT => state.iso_out.push_back(urb),
            EP_AUDIO_IN => state.iso_in.push_back(urb),
            other => panic!("unexpected iso endpoint {other:#04x}"),
        }
        Ok(())
    }

    fn cancel_iso(&self, endpoint: u8) -> Vec<IsoUrb> {
        let mut state = self.state.lock().unwrap();
        let queue = match endpoint {
            EP_AUDIO_OUT => &mut state.iso_out,
            EP_AUDIO_IN => &mut state.iso_in,
            other => panic!("unexpected iso endpoint {other:#04x}"),
        };
        queue.drain(..).collect()
    }

    fn submit_hid_in(&self, urb: HidInUrb) -> Result<(), TransportError> {
        self.state.lock().unwrap().hid_in = Some(urb);
        Ok(())
    }

    fn cancel_hid_in(&self) -> Option<HidInUrb> {
        self.state.lock().unwrap().hid_in.take()
    }

    fn interrupt_out(
        &self,
        _endpoint: u8,
        report: &[u8; HID_REPORT_SIZE],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(err) = state.fail_interrupt_out {
                return Err(err);
            }
            state.out_reports.push(*report);
        }
        let response = {
            let responder = self.responder.lock().unwrap();
            responder.as_ref().and_then(|respond| respond(report))
        };
        if let Some(response) = response {
            self.deliver_hid(&response, HID_REPORT_SIZE, UrbStatus::Completed);
        }
        Ok(HID_REPORT_SIZE)
    }

    fn clear_halt(&self, endpoint: u8) -> Result<(), TransportError> {
        self.state.lock().unwrap().cleared_halts.push(endpoint);
        Ok(())
    }
}

#[derive(Default)]
pub struct MockNotifier {
    pub events: Mutex<Vec<StatusElement>>,
}

impl MockNotifier {
    pub fn events(&self) -> Vec<StatusElement> {
        self.events.lock().unwrap().clone()
    }
}

impl ControlNotifier for MockNotifier {
    fn value_changed(&self, element: StatusElement) {
        self.events.lock().unwrap().push(element);
    }
}

pub struct MockPcm {
    data: Mutex<Vec<u8>>,
    period: usize,
    pub periods_elapsed: AtomicU32,
    pub xruns: AtomicU32,
}

impl MockPcm {
    pub fn new(buffer_frames: usize, period_frames: usize) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(vec![0; buffer_frames * BYTES_PER_FRAME]),
            period: period_frames,
            periods_elapsed: AtomicU32::new(0),
            xruns: AtomicU32::new(0),
        })
    }

    pub fn fill_pattern(&self) {
        let mut data = self.data.lock().unwrap();
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }

    pub fn periods_elapsed(&self) -> u32 {
        self.periods_elapsed.load(Ordering::Relaxed)
    }

    pub fn xruns(&self) -> u32 {
        self.xruns.load(Ordering::Relaxed)
    }
}

impl PcmSubstream for MockPcm {
    fn buffer_frames(&self) -> usize {
        self.data.lock().unwrap().len() / BYTES_PER_FRAME
    }

    fn period_frames(&self) -> usize {
        self.period
    }

    fn read_ring(&self, offset: usize, dst: &mut [u8]) {
        let data = self.data.lock().unwrap();
        dst.copy_from_slice(&data[offset..offset + dst.len()]);
    }

    fn write_ring(&self, offset: usize, src: &[u8]) {
        let mut data = self.data.lock().unwrap();
        data[offset..offset + src.len()].copy_from_slice(src);
    }

    fn period_elapsed(&self) {
        self.periods_elapsed.fetch_add(1, Ordering::Relaxed);
    }

    fn stop_xrun(&self) {
        self.xruns.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct Rig {
    pub bus: Arc<MockBus>,
    pub notifier: Arc<MockNotifier>,
    pub dev: Arc<Sl3Device>,
}

/// Firmware stand-in: answer every command with a generic response; the
/// phono query additionally reports the given switch positions.
pub fn default_responder(phono: [u8; 3]) -> Responder {
    Box::new(move |report| {
        let mut response = [0u8; HID_REPORT_SIZE];
        response[0] = 0xFF;
        if report[0] == sl3_usb::hid::CMD_QUERY_PHONO {
            response[5..8].copy_from_slice(&phono);
        }
        Some(response)
    })
}

pub fn probe_rig_with(config: Config, phono: [u8; 3]) -> Rig {
    let bus = Arc::new(MockBus::new());
    *bus.responder.lock().unwrap() = Some(default_responder(phono));
    let notifier = Arc::new(MockNotifier::default());
    let dev = Sl3Device::new(bus.clone(), notifier.clone(), config).expect("valid config");
    *bus.device.lock().unwrap() = Arc::downgrade(&dev);
    dev.probe().expect("probe");
    Rig { bus, notifier, dev }
}

pub fn probe_rig() -> Rig {
    probe_rig_with(Config::default(), [0, 0, 0])
}

pub fn in_flight(rig: &Rig, direction: Direction) -> usize {
    let state = rig.bus.state.lock().unwrap();
    match direction {
        Direction::Playback => state.iso_out.len(),
        Direction::Capture => state.iso_in.len(),
    }
}

/// Complete the oldest in-flight URB of `direction` with `status`.
pub fn complete_iso(rig: &Rig, direction: Direction, status: UrbStatus) -> bool {
    let urb = {
        let mut state = rig.bus.state.lock().unwrap();
        match direction {
            Direction::Playback => state.iso_out.pop_front(),
            Direction::Capture => state.iso_in.pop_front(),
        }
    };
    let Some(mut urb) = urb else {
        return false;
    };
    urb.status = status;
    match direction {
        Direction::Playback => rig.dev.on_playback_complete(urb),
        Direction::Capture => rig.dev.on_capture_complete(urb),
    }
    true
}

pub fn complete_playback(rig: &Rig) -> bool {
    complete_iso(rig, Direction::Playback, UrbStatus::Completed)
}

/// Complete the oldest capture URB, reporting `actual_frames[i]` whole frames
/// in packet `i` and filling the received bytes with a counting pattern.
pub fn complete_capture(rig: &Rig, actual_frames: &[usize]) -> bool {
    let urb = rig.bus.state.lock().unwrap().iso_in.pop_front();
    let Some(mut urb) = urb else {
        return false;
    };
    urb.status = UrbStatus::Completed;
    for (i, byte) in urb.buffer.iter_mut().enumerate() {
        *byte = (i % 251) as u8;
    }
    for (i, pkt) in urb.packets.iter_mut().enumerate() {
        pkt.actual_length = actual_frames.get(i).copied().unwrap_or(0) * BYTES_PER_FRAME;
    }
    rig.dev.on_capture_complete(urb);
    true
}

/// Frame counts of the most recently submitted playback URB's packets.
pub fn last_playback_packet_frames(rig: &Rig) -> Vec<usize> {
    let state = rig.bus.state.lock().unwrap();
    let urb = state.iso_out.back().expect("a playback URB in flight");
    urb.packets.iter().map(|p| p.length / BYTES_PER_FRAME).collect()
}

/// Command ids of every OUT report sent so far.
pub fn sent_commands(rig: &Rig) -> Vec<u8> {
    rig.bus
        .state
        .lock()
        .unwrap()
        .out_reports
        .iter()
        .map(|r| r[0])
        .collect()
}
