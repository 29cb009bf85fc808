mod util;

use pretty_assertions::assert_eq;
use sl3_usb::{Direction, Trigger, UrbStatus, EP_AUDIO_OUT, NUM_URBS};

use util::{complete_iso, in_flight, probe_rig, MockPcm};

fn start_playback(rig: &util::Rig) -> std::sync::Arc<MockPcm> {
    let pcm = MockPcm::new(4096, 441);
    rig.dev.pcm_open(Direction::Playback, pcm.clone()).unwrap();
    rig.dev.pcm_prepare(Direction::Playback).unwrap();
    rig.dev.pcm_trigger(Direction::Playback, Trigger::Start).unwrap();
    pcm
}

#[test]
fn a_stall_clears_the_halt_and_resubmits() {
    let rig = probe_rig();
    let _pcm = start_playback(&rig);

    assert!(complete_iso(&rig, Direction::Playback, UrbStatus::Stall));

    let state = rig.bus.state.lock().unwrap();
    assert!(state.cleared_halts.contains(&EP_AUDIO_OUT));
    assert_eq!(state.iso_out.len(), NUM_URBS);
}

#[test]
fn an_overflow_resubmits_without_counting_an_xrun() {
    let rig = probe_rig();
    let pcm = start_playback(&rig);

    assert!(complete_iso(&rig, Direction::Playback, UrbStatus::Overflow));

    assert_eq!(in_flight(&rig, Direction::Playback), NUM_URBS);
    assert_eq!(pcm.xruns(), 0);
    assert_eq!(rig.dev.statistics().playback_underruns, 0);
}

#[test]
fn three_consecutive_errors_abandon_the_urb_with_an_xrun() {
    let rig = probe_rig();
    let pcm = start_playback(&rig);

    // The same URB fails three times in a row: it cycles through the front
    // of the queue after each resubmission.
    assert!(complete_iso(&rig, Direction::Playback, UrbStatus::Error));
    assert_eq!(in_flight(&rig, Direction::Playback), NUM_URBS);
    assert_eq!(pcm.xruns(), 0);

    // Rotate the ring so the same URB comes back around twice more.
    for _ in 0..NUM_URBS - 1 {
        assert!(complete_iso(&rig, Direction::Playback, UrbStatus::Completed));
    }
    assert!(complete_iso(&rig, Direction::Playback, UrbStatus::Error));
    for _ in 0..NUM_URBS - 1 {
        assert!(complete_iso(&rig, Direction::Playback, UrbStatus::Completed));
    }
    assert!(complete_iso(&rig, Direction::Playback, UrbStatus::Error));

    // Abandoned: one URB left the rotation, the stream keeps limping.
    assert_eq!(in_flight(&rig, Direction::Playback), NUM_URBS - 1);
    assert_eq!(pcm.xruns(), 1);
    assert_eq!(rig.dev.statistics().playback_underruns, 1);
}

#[test]
fn a_success_resets_the_consecutive_error_count() {
    let rig = probe_rig();
    let pcm = start_playback(&rig);

    for _ in 0..2 {
        assert!(complete_iso(&rig, Direction::Playback, UrbStatus::Error));
        for _ in 0..NUM_URBS - 1 {
            assert!(complete_iso(&rig, Direction::Playback, UrbStatus::Completed));
        }
    }
    // Two errors, then a success on the same URB: the counter restarts.
    assert!(complete_iso(&rig, Direction::Playback, UrbStatus::Completed));
    for _ in 0..NUM_URBS - 1 {
        assert!(complete_iso(&rig, Direction::Playback, UrbStatus::Completed));
    }
    assert!(complete_iso(&rig, Direction::Playback, UrbStatus::Error));

    assert_eq!(in_flight(&rig, Direction::Playback), NUM_URBS);
    assert_eq!(pcm.xruns(), 0);
}

#[test]
fn capture_errors_count_overruns() {
    let rig = probe_rig();
    let pcm = MockPcm::new(4096, 441);
    rig.dev.pcm_open(Direction::Capture, pcm.clone()).unwrap();
    rig.dev.pcm_prepare(Direction::Capture).unwrap();
    rig.dev.pcm_trigger(Direction::Capture, Trigger::Start).unwrap();

    for round in 0..3 {
        assert!(complete_iso(&rig, Direction::Capture, UrbStatus::Error));
        if round < 2 {
            for _ in 0..NUM_URBS - 1 {
                assert!(complete_iso(&rig, Direction::Capture, UrbStatus::Completed));
            }
        }
    }

    assert_eq!(in_flight(&rig, Direction::Capture), NUM_URBS - 1);
    assert_eq!(pcm.xruns(), 1);
    assert_eq!(rig.dev.statistics().capture_overruns, 1);
}
