//! MMIO register layout and bit definitions for an Intel HDA controller.
//!
//! Offsets are byte offsets from BAR0. Sub-word registers (e.g. `CORBCTL`, `SDnSTS`) live at
//! fixed byte offsets inside a containing dword and are accessed with 8/16-bit operations.

pub const HDA_GCAP: u32 = 0x00;
pub const HDA_VMIN: u32 = 0x02;
pub const HDA_VMAJ: u32 = 0x03;
pub const HDA_OUTPAY: u32 = 0x04;
pub const HDA_INPAY: u32 = 0x06;
pub const HDA_GCTL: u32 = 0x08;
pub const HDA_WAKEEN: u32 = 0x0C;
pub const HDA_STATESTS: u32 = 0x0E;
pub const HDA_GSTS: u32 = 0x10;
pub const HDA_INTCTL: u32 = 0x20;
pub const HDA_INTSTS: u32 = 0x24;
pub const HDA_WALCLK: u32 = 0x30;
pub const HDA_SSYNC: u32 = 0x38;

pub const HDA_CORBLBASE: u32 = 0x40;
pub const HDA_CORBUBASE: u32 = 0x44;
pub const HDA_CORBWP: u32 = 0x48;
pub const HDA_CORBRP: u32 = 0x4A;
pub const HDA_CORBCTL: u32 = 0x4C;
pub const HDA_CORBSTS: u32 = 0x4D;
pub const HDA_CORBSIZE: u32 = 0x4E;

pub const HDA_RIRBLBASE: u32 = 0x50;
pub const HDA_RIRBUBASE: u32 = 0x54;
pub const HDA_RIRBWP: u32 = 0x58;
pub const HDA_RINTCNT: u32 = 0x5A;
pub const HDA_RIRBCTL: u32 = 0x5C;
pub const HDA_RIRBSTS: u32 = 0x5D;
pub const HDA_RIRBSIZE: u32 = 0x5E;

// Immediate command interface.
pub const HDA_IC: u32 = 0x60;
pub const HDA_IR: u32 = 0x64;
pub const HDA_ICS: u32 = 0x68;

pub const HDA_DPLBASE: u32 = 0x70;
pub const HDA_DPUBASE: u32 = 0x74;

/// First stream descriptor register block.
pub const HDA_SD_BASE: u32 = 0x80;
/// Stride between stream descriptor register blocks.
pub const HDA_SD_STRIDE: u32 = 0x20;

// Offsets inside a stream descriptor block.
pub const SD_CTL: u32 = 0x00;
pub const SD_STS: u32 = 0x03;
pub const SD_LPIB: u32 = 0x04;
pub const SD_CBL: u32 = 0x08;
pub const SD_LVI: u32 = 0x0C;
pub const SD_FIFOW: u32 = 0x0E;
pub const SD_FIFOS: u32 = 0x10;
pub const SD_FMT: u32 = 0x12;
pub const SD_BDPL: u32 = 0x18;
pub const SD_BDPU: u32 = 0x1C;

/// Maximum number of codec addresses on one link (STATESTS bits 14:0).
pub const MAX_CODECS: usize = 15;
/// Maximum number of stream descriptors addressable by INTCTL/INTSTS (bits 29:0).
pub const MAX_ENGINES: usize = 30;

pub const GCTL_CRST: u32 = 1 << 0;
pub const GCTL_FCNTRL: u32 = 1 << 1;
pub const GCTL_UNSOL: u32 = 1 << 8;

pub const STATESTS_MASK: u16 = 0x7FFF;

pub const INTCTL_GIE: u32 = 1 << 31;
pub const INTCTL_CIE: u32 = 1 << 30;
pub const INTCTL_SIE_MASK: u32 = 0x3FFF_FFFF;

pub const INTSTS_GIS: u32 = 1 << 31;
pub const INTSTS_CIS: u32 = 1 << 30;
pub const INTSTS_SIS_MASK: u32 = 0x3FFF_FFFF;

// CORBRP bit 15 is the read pointer reset handshake bit.
pub const CORBRP_RST: u16 = 1 << 15;
pub const CORBCTL_CMEIE: u8 = 1 << 0;
pub const CORBCTL_RUN: u8 = 1 << 1;
pub const CORBSTS_CMEI: u8 = 1 << 0;

// RIRBWP bit 15 resets the hardware write pointer (write-only).
pub const RIRBWP_RST: u16 = 1 << 15;
pub const RIRBCTL_RINTCTL: u8 = 1 << 0;
pub const RIRBCTL_DMAEN: u8 = 1 << 1;
pub const RIRBCTL_OIC: u8 = 1 << 2;
pub const RIRBSTS_RINTFL: u8 = 1 << 0;
pub const RIRBSTS_OIS: u8 = 1 << 2;

// CORBSIZE/RIRBSIZE capability bits (RO).
pub const RING_SIZE_CAP_2: u8 = 1 << 4;
pub const RING_SIZE_CAP_16: u8 = 1 << 5;
pub const RING_SIZE_CAP_256: u8 = 1 << 6;
pub const RING_SIZE_SEL_MASK: u8 = 0x3;

pub const ICS_ICB: u16 = 1 << 0;
pub const ICS_IRV: u16 = 1 << 1;
pub const ICS_IRRUNSOL: u16 = 1 << 3;
pub const ICS_IRRADD_SHIFT: u16 = 4;
pub const ICS_IRRADD_MASK: u16 = 0xF << ICS_IRRADD_SHIFT;

pub const SD_CTL_SRST: u32 = 1 << 0;
pub const SD_CTL_RUN: u32 = 1 << 1;
pub const SD_CTL_IOCE: u32 = 1 << 2;
pub const SD_CTL_FEIE: u32 = 1 << 3;
pub const SD_CTL_DEIE: u32 = 1 << 4;
pub const SD_CTL_STRIPE_SHIFT: u32 = 16;
pub const SD_CTL_STRIPE_MASK: u32 = 0x3 << SD_CTL_STRIPE_SHIFT;
pub const SD_CTL_TP: u32 = 1 << 18;
pub const SD_CTL_DIR: u32 = 1 << 19;
pub const SD_CTL_STRM_SHIFT: u32 = 20;
pub const SD_CTL_STRM_MASK: u32 = 0xF << SD_CTL_STRM_SHIFT;

pub const SD_STS_BCIS: u8 = 1 << 2;
pub const SD_STS_FIFOE: u8 = 1 << 3;
pub const SD_STS_DESE: u8 = 1 << 4;
pub const SD_STS_FIFORDY: u8 = 1 << 5;
/// Write-one-to-clear bits of SDnSTS.
pub const SD_STS_W1C_MASK: u8 = SD_STS_BCIS | SD_STS_FIFOE | SD_STS_DESE;

pub const DPLBASE_ENABLE: u32 = 1 << 0;

/// Base address of stream descriptor `index`.
pub const fn sd_base(index: usize) -> u32 {
    HDA_SD_BASE + HDA_SD_STRIDE * index as u32
}

/// Absolute offset of register `reg` (one of the `SD_*` offsets) for stream descriptor `index`.
pub const fn sd_reg(index: usize, reg: u32) -> u32 {
    sd_base(index) + reg
}

/// Global capabilities (GCAP) decoded into stream engine counts.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct GlobalCaps {
    pub output_streams: u8,
    pub input_streams: u8,
    pub bidir_streams: u8,
    pub sdo_lines: u8,
    pub addr64: bool,
}

impl GlobalCaps {
    pub fn decode(gcap: u16) -> Self {
        // Bits: 64OK[0], NSDO[2:1], BSS[7:3], ISS[11:8], OSS[15:12].
        let nsdo = match (gcap >> 1) & 0x3 {
            0 => 1,
            1 => 2,
            _ => 4,
        };
        Self {
            addr64: gcap & 1 != 0,
            sdo_lines: nsdo,
            bidir_streams: ((gcap >> 3) & 0x1F) as u8,
            input_streams: ((gcap >> 8) & 0xF) as u8,
            output_streams: ((gcap >> 12) & 0xF) as u8,
        }
    }

    pub fn encode(&self) -> u16 {
        let nsdo = match self.sdo_lines {
            0 | 1 => 0,
            2 => 1,
            _ => 2,
        };
        (self.addr64 as u16)
            | (nsdo << 1)
            | ((u16::from(self.bidir_streams) & 0x1F) << 3)
            | ((u16::from(self.input_streams) & 0xF) << 8)
            | ((u16::from(self.output_streams) & 0xF) << 12)
    }

    pub fn total_streams(&self) -> usize {
        usize::from(self.input_streams)
            + usize::from(self.output_streams)
            + usize::from(self.bidir_streams)
    }
}

/// Number of ring entries selected by a CORBSIZE/RIRBSIZE register value.
pub fn ring_entries(size_reg: u8) -> u16 {
    match size_reg & RING_SIZE_SEL_MASK {
        0 => 2,
        1 => 16,
        2 => 256,
        _ => 2,
    }
}

/// Largest supported ring size not exceeding `preferred`, as `(select bits, entries)`.
///
/// Falls back to the smallest supported size when nothing fits under `preferred`.
pub fn pick_ring_size(size_reg: u8, preferred: u16) -> Option<(u8, u16)> {
    let supported = [
        (RING_SIZE_CAP_256, 2u8, 256u16),
        (RING_SIZE_CAP_16, 1, 16),
        (RING_SIZE_CAP_2, 0, 2),
    ];
    let mut smallest = None;
    for (cap, sel, entries) in supported {
        if size_reg & cap == 0 {
            continue;
        }
        if entries <= preferred {
            return Some((sel, entries));
        }
        smallest = Some((sel, entries));
    }
    smallest
}
