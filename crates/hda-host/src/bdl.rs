//! Buffer descriptor lists.

use crate::error::{HdaError, Result};
use crate::platform::{DmaMemory, DmaRegion};

pub const BDL_ENTRY_BYTES: usize = 16;
pub const BDL_ALIGN: usize = 128;
pub const BDL_MIN_ENTRIES: usize = 2;
pub const BDL_MAX_ENTRIES: usize = 256;
/// Buffer segments start on this boundary.
pub const SEGMENT_ALIGN: u64 = 128;

const BDL_FLAG_IOC: u32 = 1 << 0;

/// One requested buffer segment.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BdlSegment {
    pub len: u32,
    /// Raise buffer-complete when the engine finishes this segment.
    pub ioc: bool,
}

impl BdlSegment {
    /// `count` equal segments, each with IOC set.
    pub fn uniform(count: usize, len: u32) -> Vec<Self> {
        vec![BdlSegment { len, ioc: true }; count]
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BdlEntry {
    pub addr: u64,
    pub len: u32,
    pub ioc: bool,
}

#[derive(Debug, Clone)]
pub struct BufferDescriptorList {
    list: DmaRegion,
    buffer: DmaRegion,
    entries: Vec<BdlEntry>,
}

impl BufferDescriptorList {
    /// Allocate the data buffer and the descriptor list and write the entries.
    pub fn build(mem: &dyn DmaMemory, segments: &[BdlSegment]) -> Result<Self> {
        if !(BDL_MIN_ENTRIES..=BDL_MAX_ENTRIES).contains(&segments.len()) {
            return Err(HdaError::misuse(HdaError::InvalidOperation(
                "buffer descriptor list needs 2 to 256 entries",
            )));
        }
        if segments.iter().any(|s| s.len == 0) {
            return Err(HdaError::misuse(HdaError::InvalidOperation(
                "buffer descriptor entries must not be empty",
            )));
        }

        let padded: u64 = segments
            .iter()
            .map(|s| u64::from(s.len).next_multiple_of(SEGMENT_ALIGN))
            .sum();
        let buffer_len = usize::try_from(padded).map_err(|_| HdaError::DmaAllocation {
            len: usize::MAX,
            reason: "buffer too large".to_string(),
        })?;
        let buffer = mem.alloc(buffer_len, BDL_ALIGN)?;
        let list = mem.alloc(segments.len() * BDL_ENTRY_BYTES, BDL_ALIGN)?;

        let mut entries = Vec::with_capacity(segments.len());
        let mut offset = 0u64;
        for (i, segment) in segments.iter().enumerate() {
            let entry = BdlEntry {
                addr: buffer.phys + offset,
                len: segment.len,
                ioc: segment.ioc,
            };
            let mut raw = [0u8; BDL_ENTRY_BYTES];
            raw[0..8].copy_from_slice(&entry.addr.to_le_bytes());
            raw[8..12].copy_from_slice(&entry.len.to_le_bytes());
            let flags = if entry.ioc { BDL_FLAG_IOC } else { 0 };
            raw[12..16].copy_from_slice(&flags.to_le_bytes());
            mem.write_physical(list.phys + (i * BDL_ENTRY_BYTES) as u64, &raw);
            entries.push(entry);
            offset += u64::from(segment.len).next_multiple_of(SEGMENT_ALIGN);
        }

        Ok(Self {
            list,
            buffer,
            entries,
        })
    }

    pub fn base(&self) -> u64 {
        self.list.phys
    }

    pub fn buffer(&self) -> DmaRegion {
        self.buffer
    }

    pub fn entries(&self) -> &[BdlEntry] {
        &self.entries
    }

    /// Cyclic buffer length: the sum of all entry lengths.
    pub fn cyclic_buffer_length(&self) -> u32 {
        self.entries.iter().map(|e| e.len).sum()
    }

    pub fn last_valid_index(&self) -> u8 {
        (self.entries.len() - 1) as u8
    }

    /// Byte offsets within the cyclic buffer at which buffer-complete is raised.
    ///
    /// The end of the last entry is reported as `cyclic_buffer_length`.
    pub fn ioc_boundaries(&self) -> Vec<u32> {
        let mut end = 0;
        let mut out = Vec::new();
        for entry in &self.entries {
            end += entry.len;
            if entry.ioc {
                out.push(end);
            }
        }
        out
    }
}
