mod common;

use hda_host::regs::*;
use hda_host::verb::{Parameter, VERB_GET_PIN_WIDGET_CONTROL, VERB_SET_PIN_WIDGET_CONTROL};
use hda_host::{Clock, Command, ErrorClass, HdaConfig, HdaError, PciId, RegisterIo};
use hda_sim::{SimCodec, SimConfig, SimMachine};
use proptest::prelude::*;

use common::{attach, attach_as, bench, frames};

const REFERENCE_VENDOR: u32 = 0x10EC_0888;

fn vendor_query(codec: u8) -> Command {
    Command::get_parameter(codec, 0, Parameter::VendorId)
}

#[test]
fn push_advances_write_pointer_and_consumes_free_space() {
    let (_machine, mut controller) = bench();
    let rings = controller.rings_mut();
    assert_eq!(rings.capacity(), 256);
    assert_eq!(rings.free_space(), 256);

    let start = rings.corb_write_pointer();
    let verbs = [vendor_query(0); 10];
    assert_eq!(rings.push_verbs(&verbs).unwrap(), 10);
    assert_eq!(rings.corb_write_pointer(), (start + 10) % 256);
    // No link time has passed, so the controller has not fetched anything yet.
    assert_eq!(rings.free_space(), 246);
}

#[test]
fn single_verb_round_trip() {
    let (machine, mut controller) = bench();
    let before = machine.controller().commands_processed();
    assert_eq!(controller.send_verb(vendor_query(0)).unwrap(), REFERENCE_VENDOR);
    assert_eq!(machine.controller().commands_processed(), before + 1);
    assert!(controller.rings().is_idle());
}

#[test]
fn verb_to_absent_codec_times_out() {
    let (_machine, mut controller) = bench();
    let err = controller.send_verb(vendor_query(3)).unwrap_err();
    assert!(matches!(err, HdaError::Timeout { op: "single verb response", .. }));
    assert_eq!(err.class(), ErrorClass::Timeout);
}

#[test]
fn set_then_get_goes_through_the_codec() {
    let (machine, mut controller) = bench();
    controller
        .send_verb(Command::new(0, 0x15, VERB_SET_PIN_WIDGET_CONTROL, 0xC0))
        .unwrap();
    let value = controller
        .send_verb(Command::new(0, 0x15, VERB_GET_PIN_WIDGET_CONTROL, 0))
        .unwrap();
    assert_eq!(value, 0xC0);
    let sim = machine.controller();
    assert_eq!(sim.codec(0).unwrap().controls(0x15).unwrap().pin_control, 0xC0);
}

#[test]
fn batch_of_ring_capacity_minus_one() {
    let (_machine, mut controller) = bench();
    let max = controller.rings().max_batch();
    assert_eq!(max, 255);

    let cmds = vec![vendor_query(0); max];
    let payloads = controller.rings_mut().send_batch(&cmds).unwrap();
    assert_eq!(payloads.len(), max);
    assert!(payloads.iter().all(|&p| p == REFERENCE_VENDOR));

    let too_many = vec![vendor_query(0); max + 1];
    let err = controller.rings_mut().send_batch(&too_many).unwrap_err();
    assert!(matches!(err, HdaError::BatchTooLarge { len: 256, capacity: 255 }));
    assert_eq!(err.class(), ErrorClass::ProtocolMisuse);

    // Longer sequences are split into batches.
    let long = vec![vendor_query(0); 600];
    assert_eq!(controller.send_verbs(&long).unwrap().len(), 600);
}

#[test]
fn small_rings_still_discover_and_batch() {
    let machine = common::reference_machine();
    let config = HdaConfig {
        ring_entries: 16,
        ..HdaConfig::default()
    };
    let mut controller = attach(&machine, config);
    assert_eq!(controller.rings().capacity(), 16);
    assert_eq!(controller.rings().max_batch(), 15);
    assert!(controller.codec(0).is_some());
    let payloads = controller.send_verbs(&[vendor_query(0); 40]).unwrap();
    assert_eq!(payloads.len(), 40);
}

#[test]
fn sending_while_traffic_is_pending_is_misuse() {
    let (_machine, mut controller) = bench();
    controller.rings_mut().push_verbs(&[vendor_query(0)]).unwrap();
    let err = controller.send_verb(vendor_query(0)).unwrap_err();
    assert!(matches!(err, HdaError::ProtocolBusy { .. }));
}

#[test]
fn late_solicited_response_is_drained_before_the_next_transaction() {
    let (machine, mut controller) = bench();
    // A verb nobody waits for: its answer lands with no transaction to claim it.
    controller.rings_mut().push_verbs(&[vendor_query(0)]).unwrap();
    machine.sleep(frames(10));
    for _ in 0..3 {
        let err = controller.send_verb(vendor_query(0)).unwrap_err();
        assert!(matches!(err, HdaError::ProtocolBusy { .. }));
    }

    let stale = controller.take_solicited(0).unwrap();
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].payload, REFERENCE_VENDOR);
    assert!(!stale[0].unsolicited);
    assert!(controller.take_solicited(0).unwrap().is_empty());
    assert!(controller.rings().is_idle());
    assert_eq!(controller.send_verb(vendor_query(0)).unwrap(), REFERENCE_VENDOR);
}

#[test]
fn response_from_the_wrong_codec_is_rejected_on_the_rings() {
    let (machine, mut controller) = bench();
    machine.controller().misaddress_next_response(2);
    let err = controller.send_verb(vendor_query(0)).unwrap_err();
    assert!(matches!(
        err,
        HdaError::ResponseAddressMismatch {
            expected: 0,
            received: 2
        }
    ));
    assert!(controller.rings().is_idle());

    machine.controller().misaddress_next_response(1);
    let err = controller
        .rings_mut()
        .send_batch(&[vendor_query(0), vendor_query(0)])
        .unwrap_err();
    assert!(matches!(
        err,
        HdaError::ResponseAddressMismatch {
            expected: 0,
            received: 1
        }
    ));
    assert!(controller.rings().is_idle());
    assert_eq!(controller.send_verb(vendor_query(0)).unwrap(), REFERENCE_VENDOR);
}

#[test]
fn response_from_the_wrong_codec_is_rejected_on_the_immediate_channel() {
    let (machine, mut controller) = bench();
    machine.controller().misaddress_next_response(3);
    let err = controller
        .with_rings_quiesced(|imm| imm.send(vendor_query(0)))
        .unwrap_err();
    assert!(matches!(
        err,
        HdaError::ResponseAddressMismatch {
            expected: 0,
            received: 3
        }
    ));
    assert!(controller.rings().is_running());
}

#[test]
fn failed_ring_stop_restarts_the_corb() {
    let (machine, mut controller) = bench();
    machine.controller().set_rirb_dma_stuck(true);
    let mut ran = false;
    let err = controller
        .with_rings_quiesced(|imm| {
            ran = true;
            imm.send(vendor_query(0))
        })
        .unwrap_err();
    assert!(matches!(err, HdaError::Timeout { op: "RIRB DMA stop", .. }));
    assert!(!ran);
    assert!(controller.rings().corb_running());
    assert!(controller.rings().rirb_running());

    machine.controller().set_rirb_dma_stuck(false);
    assert_eq!(controller.send_verb(vendor_query(0)).unwrap(), REFERENCE_VENDOR);
}

#[test]
fn immediate_channel_requires_stopped_rings() {
    let (_machine, mut controller) = bench();
    let err = controller.send_immediate(vendor_query(0)).unwrap_err();
    assert!(matches!(err, HdaError::ImmediateWhileRingsActive));

    let vendor = controller
        .with_rings_quiesced(|imm| imm.send(vendor_query(0)))
        .unwrap();
    assert_eq!(vendor, REFERENCE_VENDOR);

    // The rings are running again and usable.
    assert!(controller.rings().corb_running());
    assert!(controller.rings().rirb_running());
    assert_eq!(controller.send_verb(vendor_query(0)).unwrap(), REFERENCE_VENDOR);
}

#[test]
fn immediate_failure_still_restarts_rings() {
    let (_machine, mut controller) = bench();
    let err = controller
        .with_rings_quiesced(|imm| imm.send(vendor_query(5)))
        .unwrap_err();
    assert!(matches!(err, HdaError::Timeout { .. }));
    assert!(controller.rings().is_running());
    assert_eq!(controller.send_verb(vendor_query(0)).unwrap(), REFERENCE_VENDOR);
}

fn busy_kick_machine() -> std::sync::Arc<SimMachine> {
    SimMachine::builder()
        .config(SimConfig {
            immediate_busy_kick: true,
            ..SimConfig::default()
        })
        .codec(0, SimCodec::reference())
        .build()
}

#[test]
fn busy_kick_controllers_need_the_quirk() {
    let machine = busy_kick_machine();
    let ati = PciId {
        vendor: 0x1002,
        device: 0x437B,
    };
    let mut controller = attach_as(&machine, HdaConfig::default(), ati);
    assert!(controller.quirks().immediate_busy_kick);
    let vendor = controller
        .with_rings_quiesced(|imm| imm.send(vendor_query(0)))
        .unwrap();
    assert_eq!(vendor, REFERENCE_VENDOR);

    // Without the quirk the command is never launched.
    let machine = busy_kick_machine();
    let mut controller = attach(&machine, HdaConfig::default());
    assert!(!controller.quirks().immediate_busy_kick);
    let err = controller
        .with_rings_quiesced(|imm| imm.send(vendor_query(0)))
        .unwrap_err();
    assert!(matches!(err, HdaError::Timeout { .. }));
}

#[test]
fn corb_memory_error_is_sticky_until_acknowledged() {
    let (machine, mut controller) = bench();
    machine.controller().fail_next_corb_fetch();
    let err = controller.send_verb(vendor_query(0)).unwrap_err();
    assert!(matches!(err, HdaError::Timeout { .. }));

    assert!(controller
        .controller_status()
        .faults()
        .contains(hda_host::status::RingStatus::CORB_MEMORY_ERROR));
    let err = controller.send_verb(vendor_query(0)).unwrap_err();
    assert!(matches!(err, HdaError::CorbMemoryError));
    assert_eq!(err.class(), ErrorClass::HardwareFault);

    // The controller stopped the CORB; acknowledging and resetting the rings recovers.
    controller.acknowledge_ring_faults();
    controller.rings_mut().setup().unwrap();
    assert_eq!(controller.send_verb(vendor_query(0)).unwrap(), REFERENCE_VENDOR);
}

fn overrun_ring(machine: &SimMachine, controller: &mut hda_host::Controller) {
    // Fill the RIRB without popping: fifteen responses, then one more.
    let rings = controller.rings_mut();
    rings.push_verbs(&[vendor_query(0); 15]).unwrap();
    machine.sleep(frames(20));
    rings.push_verbs(&[vendor_query(0)]).unwrap();
    machine.sleep(frames(4));
    assert!(machine.controller().rirb().overruns() >= 1);
}

#[test]
fn rirb_overrun_is_an_error_by_default() {
    let machine = common::reference_machine();
    let config = HdaConfig {
        ring_entries: 16,
        ..HdaConfig::default()
    };
    let mut controller = attach(&machine, config);
    overrun_ring(&machine, &mut controller);

    let err = controller.send_verb(vendor_query(0)).unwrap_err();
    assert!(matches!(err, HdaError::RirbOverrun));
    // Sticky until acknowledged.
    assert!(matches!(
        controller.send_verb(vendor_query(0)).unwrap_err(),
        HdaError::RirbOverrun
    ));
    controller.acknowledge_ring_faults();
    controller.rings_mut().stop().unwrap();
    controller.rings_mut().reset().unwrap();
    controller.rings_mut().start().unwrap();
    assert_eq!(controller.send_verb(vendor_query(0)).unwrap(), REFERENCE_VENDOR);
}

#[test]
fn intentional_overrun_mode_acknowledges_and_continues() {
    let machine = common::reference_machine();
    let config = HdaConfig {
        ring_entries: 16,
        intentional_overrun: true,
        ..HdaConfig::default()
    };
    let mut controller = attach(&machine, config);
    machine.controller().inject_rirb_overrun();
    assert_eq!(controller.send_verb(vendor_query(0)).unwrap(), REFERENCE_VENDOR);
    assert!(controller.controller_status().faults().is_empty());
}

#[test]
fn unsolicited_responses_are_tagged_per_route() {
    let (machine, mut controller) = bench();
    let route = controller
        .find_route(
            0,
            hda_host::RouteDirection::Output,
            &hda_host::StreamFormat::pcm(48_000, 16, 2).unwrap(),
            Some(0x14),
            None,
        )
        .unwrap();
    controller.set_route_unsolicited(0, route.index, true).unwrap();
    assert!(controller.codec(0).unwrap().route(route.index).unwrap().unsol_enabled);

    assert!(machine.controller().trigger_unsolicited(0, 0x14, 3));
    machine.sleep(frames(2));

    let events = controller.take_unsolicited(0).unwrap();
    assert_eq!(events.len(), 1);
    assert!(events[0].unsolicited);
    assert_eq!(events[0].codec, 0);
    assert_eq!(events[0].unsolicited_tag(), route.route.unsol_tag);
    assert_eq!(events[0].unsolicited_subtag(), 3);
    assert!(controller.take_unsolicited(0).unwrap().is_empty());

    // Unsolicited traffic does not disturb solicited exchanges.
    assert!(machine.controller().trigger_unsolicited(0, 0x14, 1));
    assert_eq!(controller.send_verb(vendor_query(0)).unwrap(), REFERENCE_VENDOR);
    machine.sleep(frames(2));
    assert_eq!(controller.take_unsolicited(0).unwrap().len(), 1);

    controller.set_route_unsolicited(0, route.index, false).unwrap();
    assert!(!machine.controller().trigger_unsolicited(0, 0x14, 1));
}

#[test]
fn unsolicited_needs_a_capable_pin() {
    let (_machine, mut controller) = bench();
    let route = controller
        .find_route(
            0,
            hda_host::RouteDirection::Output,
            &hda_host::StreamFormat::pcm(48_000, 16, 2).unwrap(),
            Some(0x15),
            None,
        )
        .unwrap();
    let err = controller
        .set_route_unsolicited(0, route.index, true)
        .unwrap_err();
    assert!(matches!(err, HdaError::Unsupported(_)));
}

#[test]
fn ring_registers_match_the_software_view() {
    let (machine, controller) = bench();
    let snapshot = controller.rings().snapshot();
    assert_eq!(snapshot.corb_wp, machine.read16(HDA_CORBWP) & 0xFF);
    assert_eq!(snapshot.corb_rp, snapshot.corb_wp);
    assert_eq!(snapshot.rirb_rp, snapshot.rirb_wp);
    assert_eq!(machine.read8(HDA_CORBCTL) & CORBCTL_RUN, CORBCTL_RUN);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn batch_responses_follow_command_order(nids in prop::collection::vec(
        prop::sample::select(vec![0x02u8, 0x03, 0x07, 0x0B, 0x14, 0x18, 0x1E, 0x22]),
        1..64,
    )) {
        let (_machine, mut controller) = bench();
        let cmds: Vec<Command> = nids
            .iter()
            .map(|&nid| Command::get_parameter(0, nid, Parameter::AudioWidgetCaps))
            .collect();
        let payloads = controller.send_verbs(&cmds).unwrap();
        let codec = controller.codec(0).unwrap();
        for (nid, payload) in nids.iter().zip(payloads) {
            prop_assert_eq!(payload, codec.node(*nid).unwrap().raw_caps);
        }
    }
}
