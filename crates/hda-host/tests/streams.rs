mod common;

use std::time::Duration;

use hda_host::bdl::BdlSegment;
use hda_host::dma::{EngineKind, EngineState};
use hda_host::regs::*;
use hda_host::status::StreamStatus;
use hda_host::verb::PIN_CTL_OUT_EN;
use hda_host::{
    Clock, Controller, ErrorClass, HdaConfig, HdaError, RegisterIo, Resource, RouteDirection,
    StatusMode, StreamFormat, StreamRequest, StreamState,
};
use hda_sim::SimMachine;

use common::{attach, bench, reference_machine, route_interrupts};

/// 48 kHz, 16-bit stereo: 192 bytes per millisecond.
fn stereo_48k() -> StreamFormat {
    StreamFormat::pcm(48_000, 16, 2).unwrap()
}

/// Two 10 ms segments, each raising buffer completion.
fn playback(pin: Option<u8>) -> StreamRequest {
    StreamRequest {
        codec: 0,
        direction: RouteDirection::Output,
        format: stereo_48k(),
        pin,
        segments: BdlSegment::uniform(2, 1920),
    }
}

fn engine_of(controller: &Controller, number: u8) -> usize {
    controller.stream(number).unwrap().engine()
}

#[test]
fn program_wires_the_route_and_the_engine() {
    let (machine, mut controller) = bench();
    let number = controller.program_stream(&playback(Some(0x14))).unwrap();
    assert_eq!(number, 1);

    let stream = controller.stream(number).unwrap();
    assert_eq!(stream.state(), StreamState::Programmed);
    assert_eq!(stream.bdl().cyclic_buffer_length(), 3840);
    assert_eq!(stream.bdl().last_valid_index(), 1);
    let engine = stream.engine();
    assert_eq!(controller.engines()[engine].kind(), EngineKind::Output);
    assert_eq!(controller.engines()[engine].stream(), Some(number));
    assert_eq!(controller.engines()[engine].state(), EngineState::Stop);
    let route = controller.codec(0).unwrap().route(stream.routes()[0]).unwrap();
    assert_eq!(route.nodes, vec![0x01, 0x02, 0x0C, 0x14]);
    assert_eq!(route.reserved_by, Some(u32::from(number)));

    // Descriptor registers.
    assert_eq!(machine.read32(sd_reg(engine, SD_CBL)), 3840);
    assert_eq!(machine.read16(sd_reg(engine, SD_LVI)), 1);
    assert_eq!(machine.read16(sd_reg(engine, SD_FMT)), stereo_48k().encode());
    let ctl = machine.read32(sd_reg(engine, SD_CTL));
    assert_eq!(ctl & SD_CTL_STRM_MASK, u32::from(number) << SD_CTL_STRM_SHIFT);
    assert_eq!(ctl & (SD_CTL_RUN | SD_CTL_SRST), 0);

    // Codec wiring.
    let sim = machine.controller();
    let codec = sim.codec(0).unwrap();
    let dac = codec.controls(0x02).unwrap();
    assert_eq!(dac.stream_channel, number << 4);
    assert_eq!(dac.converter_format, stereo_48k().encode());
    assert_eq!(dac.output_amp, 0x57);
    assert_eq!(codec.controls(0x0C).unwrap().input_amp.get(&0), Some(&0x17));
    let pin = codec.controls(0x14).unwrap();
    assert_eq!(pin.pin_control, PIN_CTL_OUT_EN);
    assert_eq!(pin.connection_select, 0);
    assert_eq!(pin.output_amp, 0x57);
}

#[test]
fn headphone_pin_gets_headphone_drive() {
    let (machine, mut controller) = bench();
    controller.program_stream(&playback(Some(0x15))).unwrap();
    let sim = machine.controller();
    let pin = sim.codec(0).unwrap().controls(0x15).unwrap().pin_control;
    assert_eq!(pin, PIN_CTL_OUT_EN | hda_host::verb::PIN_CTL_HP_EN);
}

#[test]
fn position_follows_elapsed_time() {
    let (machine, mut controller) = bench();
    let number = controller.program_stream(&playback(None)).unwrap();
    controller.start_stream(number).unwrap();
    assert_eq!(controller.stream(number).unwrap().state(), StreamState::Running);

    machine.sleep(Duration::from_millis(5));
    let report = controller.verify_position(number).unwrap();
    assert_eq!(report.position, 960);
    assert_eq!(report.expected, 960);
    assert!(!report.buffer_complete);

    // Past the first segment boundary at 1920 bytes.
    machine.sleep(Duration::from_millis(6));
    let report = controller.verify_position(number).unwrap();
    assert_eq!(report.position, 2112);
    assert!(report.buffer_complete);
    let engine = engine_of(&controller, number);
    assert!(!controller
        .stream_status(engine)
        .contains(StreamStatus::BUFFER_COMPLETE));

    // Around the end of the buffer and back to the start.
    machine.sleep(Duration::from_millis(10));
    let report = controller.verify_position(number).unwrap();
    assert_eq!(report.position, 192);
    assert_eq!(report.absolute, 4032);
    assert!(report.buffer_complete);
    let stats = controller.stream(number).unwrap().stats();
    assert_eq!(stats.loops, 1);
    assert_eq!(stats.checks, 3);
    assert_eq!(stats.next_ioc, Some(3840 + 1920));
}

#[test]
fn stop_restart_and_release() {
    let (machine, mut controller) = bench();
    let number = controller.program_stream(&playback(None)).unwrap();
    let engine = engine_of(&controller, number);
    controller.start_stream(number).unwrap();
    assert!(matches!(
        controller.start_stream(number).unwrap_err(),
        HdaError::InvalidOperation(_)
    ));

    machine.sleep(Duration::from_millis(3));
    controller.stop_stream(number).unwrap();
    assert_eq!(controller.stream(number).unwrap().state(), StreamState::Stopped);
    assert_eq!(machine.read32(sd_reg(engine, SD_CTL)) & SD_CTL_RUN, 0);
    let err = controller.verify_position(number).unwrap_err();
    assert_eq!(err.class(), ErrorClass::ProtocolMisuse);
    // Stopping twice is harmless.
    controller.stop_stream(number).unwrap();

    // A restart begins at the top of the buffer.
    controller.start_stream(number).unwrap();
    machine.sleep(Duration::from_millis(1));
    let report = controller.verify_position(number).unwrap();
    assert_eq!(report.position, 192);

    let transitions = controller.engines()[engine].transitions().to_vec();
    assert!(transitions.contains(&(EngineState::Run, EngineState::Stop)));
    assert!(transitions.contains(&(EngineState::Reset, EngineState::Stop)));

    controller.release_stream(number).unwrap();
    assert!(controller.stream(number).is_none());
    assert_eq!(controller.engines()[engine].stream(), None);
    assert!(controller
        .codec(0)
        .unwrap()
        .routes()
        .iter()
        .all(|route| !route.is_reserved()));
    assert_eq!(
        machine.controller().codec(0).unwrap().controls(0x02).unwrap().stream_channel,
        0
    );
    assert!(matches!(
        controller.release_stream(number).unwrap_err(),
        HdaError::InvalidOperation(_)
    ));

    // The number is handed out again.
    assert_eq!(controller.program_stream(&playback(None)).unwrap(), number);
}

#[test]
fn multichannel_stream_takes_one_route_per_pair() {
    let (machine, mut controller) = bench();
    let request = StreamRequest {
        format: StreamFormat::pcm(48_000, 16, 4).unwrap(),
        ..playback(None)
    };
    let number = controller.program_stream(&request).unwrap();
    let codec = controller.codec(0).unwrap();
    let routes: Vec<Vec<u8>> = controller
        .stream(number)
        .unwrap()
        .routes()
        .iter()
        .map(|&i| codec.route(i).unwrap().nodes.clone())
        .collect();
    assert_eq!(
        routes,
        vec![vec![0x01, 0x02, 0x0C, 0x14], vec![0x01, 0x03, 0x0D, 0x15]]
    );

    let sim = machine.controller();
    let codec = sim.codec(0).unwrap();
    assert_eq!(codec.controls(0x02).unwrap().stream_channel, number << 4);
    assert_eq!(codec.controls(0x03).unwrap().stream_channel, (number << 4) | 2);
    // Each converter carries one pair.
    let pair = StreamFormat::pcm(48_000, 16, 2).unwrap().encode();
    assert_eq!(codec.controls(0x03).unwrap().converter_format, pair);
}

#[test]
fn exhausted_routes_leave_nothing_reserved() {
    let (_machine, mut controller) = bench();
    controller.program_stream(&playback(None)).unwrap();
    controller.program_stream(&playback(None)).unwrap();
    // The digital output is the last free stereo 48 kHz route.
    let digital = controller.program_stream(&playback(None)).unwrap();
    let route = controller.stream(digital).unwrap().routes()[0];
    assert!(controller.codec(0).unwrap().route(route).unwrap().digital);

    let err = controller.program_stream(&playback(None)).unwrap_err();
    assert!(matches!(err, HdaError::ResourceExhausted(Resource::Route)));
    assert!(!err.is_fatal());
    let bound = controller
        .engines()
        .iter()
        .filter(|e| e.stream().is_some())
        .count();
    assert_eq!(bound, 3);
    assert_eq!(controller.streams().count(), 3);
}

#[test]
fn capture_uses_an_input_engine() {
    let (machine, mut controller) = bench();
    let request = StreamRequest {
        direction: RouteDirection::Input,
        pin: Some(0x19),
        ..playback(None)
    };
    let number = controller.program_stream(&request).unwrap();
    let engine = engine_of(&controller, number);
    assert_eq!(controller.engines()[engine].kind(), EngineKind::Input);
    let sim = machine.controller();
    let codec = sim.codec(0).unwrap();
    assert_eq!(codec.controls(0x07).unwrap().stream_channel, number << 4);
    // The selector picks its second input.
    assert_eq!(codec.controls(0x22).unwrap().connection_select, 1);
    assert_eq!(
        codec.controls(0x19).unwrap().pin_control,
        hda_host::verb::PIN_CTL_IN_EN
    );
}

#[test]
fn stalled_engine_is_reported_as_drift() {
    let (machine, mut controller) = bench();
    let number = controller.program_stream(&playback(None)).unwrap();
    let engine = engine_of(&controller, number);
    controller.start_stream(number).unwrap();
    machine.controller().stream_faults_mut(engine).unwrap().stalled = true;

    machine.sleep(Duration::from_millis(5));
    match controller.verify_position(number).unwrap_err() {
        HdaError::PositionDrift {
            stream,
            expected,
            actual,
            tolerance,
        } => {
            assert_eq!(stream, number);
            assert_eq!(expected, 960);
            assert_eq!(actual, 0);
            assert_eq!(tolerance, 384);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn crossed_boundary_without_buffer_completion_is_a_mismatch() {
    let (machine, mut controller) = bench();
    let number = controller.program_stream(&playback(None)).unwrap();
    let engine = engine_of(&controller, number);
    machine
        .controller()
        .stream_faults_mut(engine)
        .unwrap()
        .suppress_ioc = true;
    controller.start_stream(number).unwrap();

    machine.sleep(Duration::from_millis(5));
    controller.verify_position(number).unwrap();
    // Well past the boundary at 1920 bytes.
    machine.sleep(Duration::from_millis(6));
    let err = controller.verify_position(number).unwrap_err();
    assert!(matches!(
        err,
        HdaError::IocMismatch {
            stream,
            position: 2112,
            detail: "boundary crossed without buffer completion",
        } if stream == number
    ));
    assert_eq!(err.class(), ErrorClass::HardwareFault);
}

#[test]
fn buffer_completion_without_a_boundary_is_a_mismatch() {
    let (machine, mut controller) = bench();
    let number = controller.program_stream(&playback(None)).unwrap();
    let engine = engine_of(&controller, number);
    controller.start_stream(number).unwrap();

    machine.sleep(Duration::from_millis(5));
    controller.verify_position(number).unwrap();
    machine.sleep(Duration::from_millis(3));
    machine.controller().inject_buffer_complete(engine);
    assert_ne!(machine.read8(sd_reg(engine, SD_STS)) & SD_STS_BCIS, 0);
    let err = controller.verify_position(number).unwrap_err();
    assert!(matches!(
        err,
        HdaError::IocMismatch {
            position: 1536,
            detail: "buffer completion without a crossed boundary",
            ..
        }
    ));
}

#[test]
fn buffer_completion_right_after_start_is_a_mismatch() {
    let (machine, mut controller) = bench();
    let number = controller.program_stream(&playback(None)).unwrap();
    let engine = engine_of(&controller, number);
    controller.start_stream(number).unwrap();

    machine.controller().inject_buffer_complete(engine);
    machine.sleep(Duration::from_millis(1));
    assert!(matches!(
        controller.verify_position(number).unwrap_err(),
        HdaError::IocMismatch { position: 192, .. }
    ));
}

#[test]
fn descriptor_error_is_reported() {
    let (machine, mut controller) = bench();
    let number = controller.program_stream(&playback(None)).unwrap();
    let engine = engine_of(&controller, number);
    machine
        .controller()
        .stream_faults_mut(engine)
        .unwrap()
        .descriptor_error = true;
    controller.start_stream(number).unwrap();
    machine.sleep(Duration::from_millis(1));

    let err = controller.verify_position(number).unwrap_err();
    assert!(matches!(err, HdaError::DescriptorError { engine: e } if e == engine));
    assert_eq!(err.class(), ErrorClass::HardwareFault);
}

#[test]
fn fifo_error_is_reported() {
    let (machine, mut controller) = bench();
    let number = controller.program_stream(&playback(None)).unwrap();
    let engine = engine_of(&controller, number);
    controller.start_stream(number).unwrap();
    machine.sleep(Duration::from_millis(1));
    machine.controller().inject_fifo_error(engine);

    let err = controller.verify_position(number).unwrap_err();
    assert!(matches!(err, HdaError::FifoError { engine: e } if e == engine));
}

#[test]
fn engine_that_never_leaves_reset_times_out() {
    let (machine, mut controller) = bench();
    // The first output engine is the one the next playback stream gets.
    let engine = controller
        .engines()
        .iter()
        .position(|e| e.kind() == EngineKind::Output)
        .unwrap();
    machine
        .controller()
        .stream_faults_mut(engine)
        .unwrap()
        .stuck_reset = true;

    let err = controller.program_stream(&playback(Some(0x14))).unwrap_err();
    assert!(matches!(err, HdaError::Timeout { op: "stream reset entry", .. }));
    assert_eq!(controller.streams().count(), 0);
    assert_eq!(controller.engines()[engine].stream(), None);
    // The route reserved for the failed stream was returned.
    controller
        .find_route(0, RouteDirection::Output, &stereo_48k(), Some(0x14), None)
        .unwrap();
}

#[test]
fn invalid_buffer_layouts_are_rejected() {
    let (_machine, mut controller) = bench();
    let one = StreamRequest {
        segments: BdlSegment::uniform(1, 1920),
        ..playback(None)
    };
    assert_eq!(
        controller.program_stream(&one).unwrap_err().class(),
        ErrorClass::ProtocolMisuse
    );
    let empty = StreamRequest {
        segments: vec![
            BdlSegment { len: 1920, ioc: true },
            BdlSegment { len: 0, ioc: false },
        ],
        ..playback(None)
    };
    assert!(controller.program_stream(&empty).is_err());
    assert_eq!(controller.streams().count(), 0);
    assert!(controller
        .codec(0)
        .unwrap()
        .routes()
        .iter()
        .all(|route| !route.is_reserved()));
}

#[test]
fn interrupt_mode_collects_buffer_completion() {
    let machine: std::sync::Arc<SimMachine> = reference_machine();
    let config = HdaConfig {
        status_mode: StatusMode::Interrupt,
        ..HdaConfig::default()
    };
    let mut controller = attach(&machine, config);
    route_interrupts(&machine, &controller);

    let number = controller.program_stream(&playback(None)).unwrap();
    let engine = engine_of(&controller, number);
    controller.start_stream(number).unwrap();
    machine.sleep(Duration::from_millis(11));

    // The handler already acknowledged the hardware bit.
    assert_eq!(machine.read8(sd_reg(engine, SD_STS)) & SD_STS_BCIS, 0);
    assert!(controller
        .stream_status(engine)
        .contains(StreamStatus::BUFFER_COMPLETE));
    let report = controller.verify_position(number).unwrap();
    assert!(report.buffer_complete);
    assert!(!controller
        .stream_status(engine)
        .contains(StreamStatus::BUFFER_COMPLETE));
    controller.check_interrupt_consistency().unwrap();
}

#[test]
fn detach_releases_everything() {
    let (machine, mut controller) = bench();
    let number = controller.program_stream(&playback(None)).unwrap();
    controller.start_stream(number).unwrap();
    machine.sleep(Duration::from_millis(1));
    controller.detach().unwrap();
    assert_eq!(machine.read32(HDA_GCTL) & GCTL_CRST, 0);
}
