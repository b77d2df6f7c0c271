//! Guest physical memory shared between the driver and the simulated controller's DMA.

use std::sync::{Mutex, MutexGuard};

use hda_host::{DmaMemory, DmaRegion, HdaError, Result};

/// First physical address handed out; keeps address zero unused so a forgotten base register
/// never aliases a real allocation.
pub const GUEST_MEMORY_BASE: u64 = 0x1000;

#[derive(Debug)]
struct Inner {
    bytes: Vec<u8>,
    /// Offset of the next free byte.
    next: usize,
}

/// Flat guest memory with an aligned bump allocator.
///
/// Accesses outside the backing store read as zero and writes are dropped, the way an
/// unbacked bus region behaves.
#[derive(Debug)]
pub struct GuestMemory {
    inner: Mutex<Inner>,
}

impl GuestMemory {
    pub fn new(size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                bytes: vec![0; size],
                next: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn size(&self) -> usize {
        self.lock().bytes.len()
    }

    /// Bytes handed out so far, including alignment padding.
    pub fn allocated(&self) -> usize {
        self.lock().next
    }

    fn offset(paddr: u64, len: usize, size: usize) -> Option<usize> {
        let start = usize::try_from(paddr.checked_sub(GUEST_MEMORY_BASE)?).ok()?;
        let end = start.checked_add(len)?;
        (end <= size).then_some(start)
    }
}

impl DmaMemory for GuestMemory {
    fn alloc(&self, len: usize, align: usize) -> Result<DmaRegion> {
        if !align.is_power_of_two() {
            return Err(HdaError::DmaAllocation {
                len,
                reason: format!("alignment {align} is not a power of two"),
            });
        }
        let mut inner = self.lock();
        // GUEST_MEMORY_BASE is page aligned, so aligning the offset aligns the address.
        let start = inner.next.next_multiple_of(align);
        let end = start.checked_add(len).filter(|&end| end <= inner.bytes.len());
        let Some(end) = end else {
            return Err(HdaError::DmaAllocation {
                len,
                reason: format!(
                    "guest memory exhausted ({} of {} bytes used)",
                    inner.next,
                    inner.bytes.len()
                ),
            });
        };
        inner.bytes[start..end].fill(0);
        inner.next = end;
        Ok(DmaRegion {
            phys: GUEST_MEMORY_BASE + start as u64,
            len,
        })
    }

    fn read_physical(&self, paddr: u64, buf: &mut [u8]) {
        let inner = self.lock();
        match Self::offset(paddr, buf.len(), inner.bytes.len()) {
            Some(start) => buf.copy_from_slice(&inner.bytes[start..start + buf.len()]),
            None => buf.fill(0),
        }
    }

    fn write_physical(&self, paddr: u64, buf: &[u8]) {
        let mut inner = self.lock();
        let size = inner.bytes.len();
        if let Some(start) = Self::offset(paddr, buf.len(), size) {
            inner.bytes[start..start + buf.len()].copy_from_slice(buf);
        }
    }
}
