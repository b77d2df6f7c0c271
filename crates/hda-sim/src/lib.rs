//! Deterministic HD Audio controller and codec simulator.
//!
//! [`SimMachine`] implements the host crate's [`hda_host::RegisterIo`] and [`hda_host::Clock`]
//! over a register-accurate controller model and flat guest memory, so the whole bus core can be
//! exercised without hardware. Time advances only when the driver sleeps.

pub mod codec;
pub mod controller;
pub mod corb_rirb;
pub mod machine;
pub mod memory;
pub mod regs;
pub mod stream;

pub use codec::{CodecBuilder, NodeControls, SimCodec};
pub use controller::{SimConfig, SimController};
pub use machine::{InterruptHook, SimMachine, SimMachineBuilder};
pub use memory::{GuestMemory, GUEST_MEMORY_BASE};
pub use stream::StreamFaults;
