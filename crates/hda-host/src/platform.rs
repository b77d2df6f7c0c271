//! Collaborator interfaces consumed by the bus core: register access, DMA-capable memory and a
//! monotonic clock.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{HdaError, Result};

/// Memory-mapped controller registers.
///
/// Offsets are byte offsets from BAR0. Accesses take `&self` because MMIO has no Rust-visible
/// state; implementations are shared between the polling caller and the interrupt handler.
pub trait RegisterIo: Send + Sync {
    fn read8(&self, offset: u32) -> u8;
    fn read16(&self, offset: u32) -> u16;
    fn read32(&self, offset: u32) -> u32;
    fn write8(&self, offset: u32, value: u8);
    fn write16(&self, offset: u32, value: u16);
    fn write32(&self, offset: u32, value: u32);
}

/// A physically contiguous, DMA-capable allocation.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DmaRegion {
    pub phys: u64,
    pub len: usize,
}

impl DmaRegion {
    pub fn end(&self) -> u64 {
        self.phys + self.len as u64
    }
}

/// Aligned DMA memory allocator with physical-address access.
pub trait DmaMemory: Send + Sync {
    /// Allocate `len` zeroed bytes aligned to `align` (a power of two).
    fn alloc(&self, len: usize, align: usize) -> Result<DmaRegion>;
    fn read_physical(&self, paddr: u64, buf: &mut [u8]);
    fn write_physical(&self, paddr: u64, buf: &[u8]);

    fn read_u32(&self, paddr: u64) -> u32 {
        let mut buf = [0u8; 4];
        self.read_physical(paddr, &mut buf);
        u32::from_le_bytes(buf)
    }

    fn read_u64(&self, paddr: u64) -> u64 {
        let mut buf = [0u8; 8];
        self.read_physical(paddr, &mut buf);
        u64::from_le_bytes(buf)
    }

    fn write_u32(&self, paddr: u64, val: u32) {
        self.write_physical(paddr, &val.to_le_bytes());
    }

    fn write_u64(&self, paddr: u64, val: u64) {
        self.write_physical(paddr, &val.to_le_bytes());
    }
}

/// Monotonic time source and sleep service.
pub trait Clock: Send + Sync {
    /// Time since an arbitrary, fixed origin.
    fn now(&self) -> Duration;
    fn sleep(&self, duration: Duration);
}

/// The set of collaborators a controller is attached with.
#[derive(Clone)]
pub struct Platform {
    pub regs: Arc<dyn RegisterIo>,
    pub mem: Arc<dyn DmaMemory>,
    pub clock: Arc<dyn Clock>,
}

impl fmt::Debug for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Platform").finish_non_exhaustive()
    }
}

impl Platform {
    pub fn new(
        regs: Arc<dyn RegisterIo>,
        mem: Arc<dyn DmaMemory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { regs, mem, clock }
    }
}

/// Bounded poll: evaluate `cond` until it returns true or `timeout` elapses.
///
/// The condition is always evaluated at least once, and once more after the deadline so a
/// condition that became true during the last sleep is not reported as a timeout.
pub fn poll_until<F>(
    clock: &dyn Clock,
    timeout: Duration,
    interval: Duration,
    op: &'static str,
    mut cond: F,
) -> Result<()>
where
    F: FnMut() -> bool,
{
    let start = clock.now();
    loop {
        if cond() {
            return Ok(());
        }
        if clock.now().saturating_sub(start) >= timeout {
            return if cond() {
                Ok(())
            } else {
                Err(HdaError::Timeout {
                    op,
                    timeout,
                    detail: String::new(),
                })
            };
        }
        clock.sleep(interval);
    }
}
