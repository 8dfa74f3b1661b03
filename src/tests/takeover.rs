use std::io::{self, Cursor, Read};

use insta::assert_snapshot;
use smithay::reexports::drm::control::connector::Interface;

use super::fixture::{large_mode, small_mode, Call, FakeDevice};
use crate::image::ImageSource;
use crate::surface::FILL_BYTE;
use crate::takeover::{Phase, Takeover};

fn stream(data: Vec<u8>) -> ImageSource {
    ImageSource::Stream(Box::new(Cursor::new(data)))
}

fn empty() -> ImageSource {
    stream(Vec::new())
}

fn summaries(takeover: &Takeover<FakeDevice>) -> String {
    let lines: Vec<String> = takeover.outputs().iter().map(|o| o.summary()).collect();
    lines.join("\n")
}

#[test]
fn two_outputs_get_distinct_crtcs() {
    let device = FakeDevice::new().with_crtcs(2);
    device.add_connector(Interface::HDMIA, true, vec![small_mode()], 0b11);
    device.add_connector(Interface::DisplayPort, true, vec![large_mode()], 0b11);

    let takeover = Takeover::start(device.clone(), &mut empty()).unwrap();

    let outputs = takeover.outputs();
    assert!(outputs.iter().all(|o| o.connected));
    assert_eq!(outputs[0].crtc, Some(device.crtc(0)));
    assert_eq!(outputs[1].crtc, Some(device.crtc(1)));
    assert_eq!(takeover.allocator().taken(), 0b11);

    for output in outputs {
        let crtc = output.crtc.unwrap();
        let state = device.crtc_state(crtc);
        assert_eq!(state.mode, output.mode);
        assert_eq!(
            state.framebuffer,
            output.surface.as_ref().unwrap().framebuffer()
        );
    }

    assert_snapshot!(summaries(&takeover), @r"
    HDMI-A-1: 8x4@60.000 Hz on CRTC 100, fb 1001
    DP-1: 16x8@60.000 Hz on CRTC 101, fb 1003
    ");
}

#[test]
fn unusable_connectors_are_kept_disconnected() {
    let device = FakeDevice::new().with_crtcs(2);
    device.add_connector(Interface::HDMIA, false, vec![small_mode()], 0b11);
    device.add_connector(Interface::DisplayPort, true, vec![], 0b11);
    device.add_broken_connector();
    device.add_connector(Interface::EmbeddedDisplayPort, true, vec![small_mode()], 0b11);

    let takeover = Takeover::start(device.clone(), &mut empty()).unwrap();

    assert_eq!(takeover.outputs().len(), 4);
    assert_eq!(takeover.active_outputs().count(), 1);
    assert_eq!(device.live_buffers(), 1);

    assert_snapshot!(summaries(&takeover), @r"
    HDMI-A-1: disconnected
    DP-1: disconnected
    Unknown-12: disconnected
    eDP-1: 8x4@60.000 Hz on CRTC 100, fb 1001
    ");
}

#[test]
fn output_without_free_crtc_is_skipped() {
    let device = FakeDevice::new().with_crtcs(1);
    device.add_connector(Interface::HDMIA, true, vec![small_mode()], 0b01);
    device.add_connector(Interface::HDMIA, true, vec![small_mode()], 0b01);

    let takeover = Takeover::start(device.clone(), &mut empty()).unwrap();

    let outputs = takeover.outputs();
    assert!(outputs[0].connected);
    assert!(!outputs[1].connected);
    assert!(outputs[1].crtc.is_none());
    assert!(outputs[1].surface.is_none());

    // Only the first output ever got a buffer.
    let created = device
        .calls()
        .iter()
        .filter(|call| **call == Call::CreateDumbBuffer)
        .count();
    assert_eq!(created, 1);
}

#[test]
fn first_fit_can_starve_a_later_output() {
    let device = FakeDevice::new().with_crtcs(2);
    device.add_connector(Interface::HDMIA, true, vec![small_mode()], 0b11);
    device.add_connector(Interface::DisplayPort, true, vec![small_mode()], 0b01);

    let takeover = Takeover::start(device.clone(), &mut empty()).unwrap();

    let outputs = takeover.outputs();
    assert_eq!(outputs[0].crtc, Some(device.crtc(0)));
    assert!(!outputs[1].connected);
}

#[test]
fn stream_image_is_split_between_outputs() {
    let device = FakeDevice::new().with_crtcs(2);
    device.add_connector(Interface::HDMIA, true, vec![small_mode()], 0b11);
    device.add_connector(Interface::HDMIA, true, vec![small_mode()], 0b11);

    // 8x4 at 4 bytes per pixel.
    let size = 128;
    let data: Vec<u8> = (0..size * 2).map(|i| (i / size) as u8 + 1).collect();
    let takeover = Takeover::start(device.clone(), &mut stream(data)).unwrap();

    let outputs = takeover.outputs();
    let first = outputs[0].surface.as_ref().unwrap().pixels().unwrap();
    let second = outputs[1].surface.as_ref().unwrap().pixels().unwrap();
    assert!(first.iter().all(|b| *b == 1));
    assert!(second.iter().all(|b| *b == 2));
}

#[test]
fn short_image_still_sets_mode() {
    let device = FakeDevice::new().with_crtcs(1);
    device.add_connector(Interface::HDMIA, true, vec![small_mode()], 0b1);

    let takeover = Takeover::start(device.clone(), &mut stream(vec![9; 10])).unwrap();

    let output = &takeover.outputs()[0];
    assert!(output.connected);
    let pixels = output.surface.as_ref().unwrap().pixels().unwrap();
    assert!(pixels[..10].iter().all(|b| *b == 9));
    assert!(pixels[10..].iter().all(|b| *b == FILL_BYTE));

    let fb = output.surface.as_ref().unwrap().framebuffer();
    assert!(device.calls().contains(&Call::SetCrtc(device.crtc(0), fb)));
}

#[test]
fn image_read_failure_releases_surface() {
    struct Broken;

    impl Read for Broken {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
        }
    }

    let device = FakeDevice::new().with_crtcs(2);
    device.add_connector(Interface::HDMIA, true, vec![small_mode()], 0b11);

    let mut image = ImageSource::Stream(Box::new(Broken));
    let takeover = Takeover::start(device.clone(), &mut image).unwrap();

    let output = &takeover.outputs()[0];
    assert!(!output.connected);
    assert!(output.surface.is_none());
    assert_eq!(device.live_buffers(), 0);
    assert_eq!(device.live_framebuffers(), 0);

    // The CRTC stays claimed for the rest of the run.
    assert!(takeover.allocator().is_taken(0));
}

#[test]
fn buffer_failure_disconnects_output() {
    let device = FakeDevice::new().with_crtcs(1);
    device.add_connector(Interface::HDMIA, true, vec![small_mode()], 0b1);
    device.state.borrow_mut().fail_create_dumb_buffer = true;

    let mut takeover = Takeover::start(device.clone(), &mut empty()).unwrap();

    assert_eq!(takeover.active_outputs().count(), 0);
    assert!(takeover.allocator().is_taken(0));

    device.clear_calls();
    takeover.restore().unwrap();
    assert!(device.calls().is_empty());
}

#[test]
fn restore_returns_prior_configuration() {
    let device = FakeDevice::new().with_crtcs(2);
    let prior = device.set_prior(0, large_mode());
    device.add_connector(Interface::HDMIA, true, vec![small_mode()], 0b01);
    device.add_connector(Interface::DisplayPort, true, vec![small_mode()], 0b10);
    let was_off = device.crtc_state(device.crtc(1));

    let mut takeover = Takeover::start(device.clone(), &mut empty()).unwrap();
    assert_eq!(takeover.outputs()[0].saved.as_ref(), Some(&prior));
    assert_ne!(device.crtc_state(device.crtc(0)), prior);

    takeover.restore().unwrap();

    assert_eq!(takeover.phase(), Phase::Done);
    assert_eq!(device.crtc_state(device.crtc(0)), prior);
    assert_eq!(device.crtc_state(device.crtc(1)), was_off);
    assert_eq!(device.live_buffers(), 0);
    assert_eq!(device.live_framebuffers(), 0);
}

#[test]
fn restore_releases_surface_before_crtc() {
    let device = FakeDevice::new().with_crtcs(1);
    device.set_prior(0, small_mode());
    device.add_connector(Interface::HDMIA, true, vec![small_mode()], 0b1);

    let mut takeover = Takeover::start(device.clone(), &mut empty()).unwrap();
    device.clear_calls();
    takeover.restore().unwrap();

    let crtc = device.crtc(0);
    let prior_fb = device.crtc_state(crtc).framebuffer;
    assert_eq!(
        device.calls(),
        [
            Call::DestroyFramebuffer,
            Call::DestroyDumbBuffer,
            Call::SetCrtc(crtc, prior_fb),
        ]
    );
}

#[test]
fn failed_modeset_still_releases_surface() {
    let device = FakeDevice::new().with_crtcs(1);
    device.add_connector(Interface::HDMIA, true, vec![small_mode()], 0b1);
    let crtc = device.crtc(0);
    device.state.borrow_mut().fail_set_crtc.insert(crtc);

    let mut takeover = Takeover::start(device.clone(), &mut empty()).unwrap();
    assert_eq!(takeover.active_outputs().count(), 1);
    assert_eq!(device.live_buffers(), 1);

    // The CRTC can't be put back either, but the buffer is still freed.
    assert!(takeover.restore().is_err());
    assert_eq!(device.live_buffers(), 0);
    assert_eq!(device.live_framebuffers(), 0);
}

#[test]
fn restore_failure_does_not_stop_other_outputs() {
    let device = FakeDevice::new().with_crtcs(2);
    device.add_connector(Interface::HDMIA, true, vec![small_mode()], 0b01);
    let prior = device.set_prior(1, small_mode());
    device.add_connector(Interface::DisplayPort, true, vec![small_mode()], 0b10);

    let mut takeover = Takeover::start(device.clone(), &mut empty()).unwrap();
    let crtc = device.crtc(0);
    device.state.borrow_mut().fail_set_crtc.insert(crtc);

    assert!(takeover.restore().is_err());
    assert_eq!(device.crtc_state(device.crtc(1)), prior);
    assert_eq!(device.live_buffers(), 0);
}

#[test]
fn unsaved_crtc_is_left_alone() {
    let device = FakeDevice::new().with_crtcs(1);
    device.add_connector(Interface::HDMIA, true, vec![small_mode()], 0b1);
    device.state.borrow_mut().fail_crtc_state = true;

    let mut takeover = Takeover::start(device.clone(), &mut empty()).unwrap();
    assert!(takeover.outputs()[0].saved.is_none());

    device.clear_calls();
    takeover.restore().unwrap();
    assert_eq!(
        device.calls(),
        [Call::DestroyFramebuffer, Call::DestroyDumbBuffer]
    );
}

#[test]
fn restore_runs_once() {
    let device = FakeDevice::new().with_crtcs(1);
    device.add_connector(Interface::HDMIA, true, vec![small_mode()], 0b1);

    let mut takeover = Takeover::start(device.clone(), &mut empty()).unwrap();
    assert_eq!(takeover.phase(), Phase::Active);
    takeover.restore().unwrap();

    device.clear_calls();
    takeover.restore().unwrap();
    drop(takeover);
    assert!(device.calls().is_empty());
}

#[test]
fn drop_restores() {
    let device = FakeDevice::new().with_crtcs(1);
    let prior = device.set_prior(0, large_mode());
    device.add_connector(Interface::HDMIA, true, vec![small_mode()], 0b1);

    let takeover = Takeover::start(device.clone(), &mut empty()).unwrap();
    assert_eq!(device.live_buffers(), 1);
    drop(takeover);

    assert_eq!(device.live_buffers(), 0);
    assert_eq!(device.crtc_state(device.crtc(0)), prior);
}

#[test]
fn resources_failure_is_fatal() {
    let device = FakeDevice::new().with_crtcs(1);
    device.add_connector(Interface::HDMIA, true, vec![small_mode()], 0b1);
    device.state.borrow_mut().fail_resources = true;

    assert!(Takeover::start(device.clone(), &mut empty()).is_err());
    assert!(device.calls().is_empty());
}

#[test]
fn no_connectors_is_not_an_error() {
    let device = FakeDevice::new().with_crtcs(2);

    let mut takeover = Takeover::start(device, &mut empty()).unwrap();
    assert!(takeover.outputs().is_empty());
    takeover.restore().unwrap();
}
