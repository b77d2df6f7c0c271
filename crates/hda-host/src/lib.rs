//! Host-side bus core for Intel High Definition Audio controllers.
//!
//! This crate drives an HDA controller through narrow platform traits ([`platform::RegisterIo`],
//! [`platform::DmaMemory`], [`platform::Clock`]): it runs the CORB/RIRB command rings and the
//! immediate command interface, discovers codec topology and signal routes, and binds routes,
//! stream DMA engines and buffer descriptor lists into verified streams.
//!
//! [`Controller`] is the entry point; everything it owns is reachable through `&mut Controller`
//! except the interrupt status accumulator, which is shared with [`status::InterruptHandler`].

pub mod bdl;
pub mod caps;
pub mod codec;
pub mod config;
pub mod controller;
pub mod dma;
pub mod error;
pub mod format;
pub mod immediate;
pub mod platform;
pub mod quirks;
pub mod regs;
pub mod ring;
pub mod route;
pub mod status;
pub mod stream;
pub mod verb;

pub use config::{HdaConfig, StatusMode};
pub use controller::{Controller, PciId, RouteMatch};
pub use error::{ErrorClass, HdaError, Resource, Result};
pub use format::StreamFormat;
pub use platform::{Clock, DmaMemory, DmaRegion, Platform, RegisterIo};
pub use route::{Route, RouteDirection};
pub use stream::{PositionReport, StreamRequest, StreamState};
pub use verb::{Command, NodeId, Response};
