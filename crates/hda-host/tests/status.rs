mod common;

use hda_host::regs::*;
use hda_host::status::RingStatus;
use hda_host::verb::Parameter;
use hda_host::{Clock, Command, HdaConfig, HdaError, RegisterIo, StatusMode};

use common::{attach, bench, frames, reference_machine, route_interrupts};

fn interrupt_config() -> HdaConfig {
    HdaConfig {
        status_mode: StatusMode::Interrupt,
        ..HdaConfig::default()
    }
}

#[test]
fn attach_programs_interrupt_enables_per_mode() {
    let (machine, _controller) = bench();
    assert_eq!(machine.read32(HDA_INTCTL), 0);
    assert_eq!(machine.read16(HDA_STATESTS) & STATESTS_MASK, 0);
    assert_ne!(machine.read32(HDA_GCTL) & GCTL_UNSOL, 0);

    let machine = reference_machine();
    let _controller = attach(&machine, interrupt_config());
    let intctl = machine.read32(HDA_INTCTL);
    assert_eq!(intctl & (INTCTL_GIE | INTCTL_CIE), INTCTL_GIE | INTCTL_CIE);
    // Four input and four output engines.
    assert_eq!(intctl & INTCTL_SIE_MASK, 0xFF);
}

#[test]
fn idle_controller_is_consistent() {
    let (_machine, controller) = bench();
    controller.check_interrupt_consistency().unwrap();
    let status = controller.controller_status();
    assert!(status.faults().is_empty());
    assert_eq!(status.state_change, 0);
}

#[test]
fn glitched_intsts_is_detected() {
    let (machine, controller) = bench();
    machine
        .controller()
        .force_intsts(Some(INTSTS_GIS | INTSTS_CIS));
    match controller.check_interrupt_consistency().unwrap_err() {
        HdaError::InterruptInconsistency { intsts, expected } => {
            assert_eq!(intsts, INTSTS_GIS | INTSTS_CIS);
            assert_eq!(expected, 0);
        }
        other => panic!("unexpected error: {other}"),
    }
    machine.controller().force_intsts(None);
    controller.check_interrupt_consistency().unwrap();
}

#[test]
fn pending_response_interrupt_is_consistent() {
    let (machine, mut controller) = bench();
    // Leave a response in the RIRB without popping it.
    controller
        .rings_mut()
        .push_verbs(&[Command::get_parameter(0, 0, Parameter::VendorId)])
        .unwrap();
    machine.sleep(frames(2));
    assert_ne!(machine.read8(HDA_RIRBSTS) & RIRBSTS_RINTFL, 0);
    assert_ne!(machine.read32(HDA_INTSTS) & INTSTS_CIS, 0);
    controller.check_interrupt_consistency().unwrap();
    assert!(controller
        .controller_status()
        .ring
        .contains(RingStatus::RESPONSE_READY));
}

#[test]
fn state_change_reported_in_both_modes() {
    for config in [HdaConfig::default(), interrupt_config()] {
        let machine = reference_machine();
        let controller = attach(&machine, config);
        route_interrupts(&machine, &controller);
        machine.write16(HDA_WAKEEN, 0x2);

        machine.controller().signal_state_change(1);
        machine.sleep(frames(1));
        let status = controller.controller_status();
        assert_eq!(status.state_change, 0x2);
        controller.check_interrupt_consistency().unwrap();

        controller.clear_controller_status(RingStatus::empty(), 0x2);
        assert_eq!(controller.controller_status().state_change, 0);
        assert_eq!(machine.read16(HDA_STATESTS) & STATESTS_MASK, 0);
    }
}

#[test]
fn overrun_survives_interrupt_acknowledge() {
    let machine = reference_machine();
    let mut controller = attach(&machine, interrupt_config());
    route_interrupts(&machine, &controller);

    machine.controller().inject_rirb_overrun();
    machine.sleep(frames(1));
    // The handler acknowledged the hardware bit but kept the condition.
    assert_eq!(machine.read8(HDA_RIRBSTS) & RIRBSTS_OIS, 0);
    assert!(controller
        .controller_status()
        .faults()
        .contains(RingStatus::RIRB_OVERRUN));

    let err = controller
        .send_verb(Command::get_parameter(0, 0, Parameter::VendorId))
        .unwrap_err();
    assert!(matches!(err, HdaError::RirbOverrun));

    controller.acknowledge_ring_faults();
    assert!(controller.controller_status().faults().is_empty());
    controller
        .send_verb(Command::get_parameter(0, 0, Parameter::VendorId))
        .unwrap();
}

#[test]
fn poll_and_interrupt_modes_report_the_same_faults() {
    let mut seen = Vec::new();
    for config in [HdaConfig::default(), interrupt_config()] {
        let machine = reference_machine();
        let controller = attach(&machine, config);
        route_interrupts(&machine, &controller);
        machine.controller().inject_rirb_overrun();
        machine.sleep(frames(1));
        seen.push(controller.controller_status().faults());
    }
    assert_eq!(seen[0], seen[1]);
    assert_eq!(seen[0], RingStatus::RIRB_OVERRUN);
}
