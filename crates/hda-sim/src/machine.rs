//! A whole simulated machine: controller, guest memory and a virtual clock behind the host's
//! platform traits.
//!
//! Time only moves when the driver sleeps, so every run is deterministic.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use hda_host::{Clock, Platform, RegisterIo};

use crate::codec::SimCodec;
use crate::controller::{SimConfig, SimController};
use crate::memory::GuestMemory;

/// Callback run after a clock step that left the interrupt line asserted.
pub type InterruptHook = Arc<dyn Fn() -> bool + Send + Sync>;

const DEFAULT_MEMORY: usize = 4 << 20;

pub struct SimMachine {
    controller: Mutex<SimController>,
    memory: Arc<GuestMemory>,
    interrupt: Mutex<Option<InterruptHook>>,
}

impl std::fmt::Debug for SimMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimMachine")
            .field("controller", &*self.controller())
            .finish_non_exhaustive()
    }
}

impl SimMachine {
    pub fn builder() -> SimMachineBuilder {
        SimMachineBuilder::default()
    }

    /// Lock the controller for inspection or fault injection.
    pub fn controller(&self) -> MutexGuard<'_, SimController> {
        match self.controller.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn memory(&self) -> &Arc<GuestMemory> {
        &self.memory
    }

    /// Platform handles for attaching a host controller to this machine.
    pub fn platform(self: &Arc<Self>) -> Platform {
        Platform::new(
            Arc::clone(self) as Arc<dyn RegisterIo>,
            Arc::clone(&self.memory) as Arc<dyn hda_host::DmaMemory>,
            Arc::clone(self) as Arc<dyn Clock>,
        )
    }

    /// Run `hook` whenever the interrupt line is asserted after time moves.
    pub fn set_interrupt_hook(&self, hook: Option<InterruptHook>) {
        let mut slot = match self.interrupt.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = hook;
    }

    /// Move time forward, then let the interrupt hook service the line.
    pub fn advance(&self, dt: Duration) {
        let irq = {
            let mut controller = self.controller();
            controller.advance(dt);
            controller.irq_line()
        };
        if !irq {
            return;
        }
        let hook = match self.interrupt.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        // The hook reads registers, so the controller lock must not be held here.
        if let Some(hook) = hook {
            if !hook() {
                tracing::trace!("interrupt hook did not claim the interrupt");
            }
        }
    }
}

impl RegisterIo for SimMachine {
    fn read8(&self, offset: u32) -> u8 {
        self.controller().mmio_read(offset, 1) as u8
    }

    fn read16(&self, offset: u32) -> u16 {
        self.controller().mmio_read(offset, 2) as u16
    }

    fn read32(&self, offset: u32) -> u32 {
        self.controller().mmio_read(offset, 4)
    }

    fn write8(&self, offset: u32, value: u8) {
        self.controller().mmio_write(offset, 1, u32::from(value));
    }

    fn write16(&self, offset: u32, value: u16) {
        self.controller().mmio_write(offset, 2, u32::from(value));
    }

    fn write32(&self, offset: u32, value: u32) {
        self.controller().mmio_write(offset, 4, value);
    }
}

impl Clock for SimMachine {
    fn now(&self) -> Duration {
        self.controller().now()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

#[derive(Debug, Default)]
pub struct SimMachineBuilder {
    config: SimConfig,
    codecs: BTreeMap<u8, SimCodec>,
    memory: Option<usize>,
}

impl SimMachineBuilder {
    pub fn config(mut self, config: SimConfig) -> Self {
        self.config = config;
        self
    }

    /// Attach `codec` at SDIN `address`.
    pub fn codec(mut self, address: u8, codec: SimCodec) -> Self {
        self.codecs.insert(address, codec);
        self
    }

    pub fn memory_size(mut self, bytes: usize) -> Self {
        self.memory = Some(bytes);
        self
    }

    pub fn build(self) -> Arc<SimMachine> {
        let memory = Arc::new(GuestMemory::new(self.memory.unwrap_or(DEFAULT_MEMORY)));
        let controller = SimController::new(self.config, memory.clone(), self.codecs);
        Arc::new(SimMachine {
            controller: Mutex::new(controller),
            memory,
            interrupt: Mutex::new(None),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use hda_host::regs::*;

    use super::*;

    #[test]
    fn sleeping_advances_the_controller_clock() {
        let machine = SimMachine::builder().codec(0, SimCodec::reference()).build();
        machine.sleep(Duration::from_micros(5));
        assert_eq!(machine.now(), Duration::from_micros(5));
        assert_eq!(machine.read32(HDA_WALCLK), 120);
    }

    #[test]
    fn interrupt_hook_runs_while_line_is_asserted() {
        let machine = SimMachine::builder().codec(0, SimCodec::reference()).build();
        let calls = Arc::new(AtomicUsize::new(0));
        let hook_machine = Arc::downgrade(&machine);
        let hook_calls = Arc::clone(&calls);
        machine.set_interrupt_hook(Some(Arc::new(move || {
            hook_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(machine) = hook_machine.upgrade() {
                machine.write16(HDA_STATESTS, STATESTS_MASK);
            }
            true
        })));

        machine.write32(HDA_GCTL, GCTL_CRST);
        machine.write16(HDA_WAKEEN, 0x1);
        machine.write32(HDA_INTCTL, INTCTL_GIE | INTCTL_CIE);
        machine.sleep(Duration::from_micros(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        machine.sleep(Duration::from_micros(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
