//! Shared bench for the integration tests: a simulated machine with a host controller attached.

#![allow(dead_code)]

use std::sync::{Arc, Once};
use std::time::Duration;

use hda_host::config::LINK_FRAME;
use hda_host::{Controller, HdaConfig, PciId};
use hda_sim::{SimCodec, SimMachine};

static TRACING: Once = Once::new();

/// Route test logging through the test harness; `RUST_LOG` is not consulted.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    });
}

/// A machine with the reference codec at address 0.
pub fn reference_machine() -> Arc<SimMachine> {
    SimMachine::builder().codec(0, SimCodec::reference()).build()
}

pub fn attach(machine: &Arc<SimMachine>, config: HdaConfig) -> Controller {
    attach_as(machine, config, PciId::default())
}

pub fn attach_as(machine: &Arc<SimMachine>, config: HdaConfig, pci: PciId) -> Controller {
    init_tracing();
    match Controller::attach(machine.platform(), config, pci) {
        Ok(controller) => controller,
        Err(err) => panic!("attach failed: {err}"),
    }
}

/// The reference machine with a default-configured controller attached.
pub fn bench() -> (Arc<SimMachine>, Controller) {
    let machine = reference_machine();
    let controller = attach(&machine, HdaConfig::default());
    (machine, controller)
}

/// Have the machine's interrupt line serviced by the controller's handler.
pub fn route_interrupts(machine: &Arc<SimMachine>, controller: &Controller) {
    let handler = controller.interrupt_handler();
    machine.set_interrupt_hook(Some(Arc::new(move || handler.service())));
}

pub fn frames(count: u32) -> Duration {
    LINK_FRAME * count
}
