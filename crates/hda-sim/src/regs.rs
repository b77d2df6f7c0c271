//! Byte-level decoding of the controller register block.
//!
//! Every MMIO access is split into bytes; consecutive bytes that land in the same register are
//! regrouped so a register sees one access with a byte mask, whatever width the driver used.

use hda_host::regs::*;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CorbReg {
    Lbase,
    Ubase,
    Wp,
    Rp,
    Ctl,
    Sts,
    Size,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RirbReg {
    Lbase,
    Ubase,
    Wp,
    RintCnt,
    Ctl,
    Sts,
    Size,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StreamReg {
    /// SDnCTL bits 23:0.
    Ctl,
    /// SDnSTS, the top byte of the SDnCTL dword.
    Sts,
    Lpib,
    Cbl,
    Lvi,
    Fifow,
    Fifos,
    Fmt,
    Bdpl,
    Bdpu,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SimReg {
    Gcap,
    Vmin,
    Vmaj,
    Outpay,
    Inpay,
    Gctl,
    Wakeen,
    Statests,
    Gsts,
    Intctl,
    Intsts,
    Walclk,
    Ssync,
    Corb(CorbReg),
    Rirb(RirbReg),
    Ic,
    Ir,
    Ics,
    Dplbase,
    Dpubase,
    Stream(usize, StreamReg),
}

/// A byte offset resolved to its register and the register's first byte.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DecodedByte {
    pub reg: SimReg,
    pub start: u32,
}

impl SimReg {
    /// Register width in bytes.
    pub fn width(self) -> u32 {
        match self {
            SimReg::Vmin | SimReg::Vmaj => 1,
            SimReg::Gcap
            | SimReg::Outpay
            | SimReg::Inpay
            | SimReg::Wakeen
            | SimReg::Statests
            | SimReg::Gsts
            | SimReg::Ics => 2,
            SimReg::Gctl
            | SimReg::Intctl
            | SimReg::Intsts
            | SimReg::Walclk
            | SimReg::Ssync
            | SimReg::Ic
            | SimReg::Ir
            | SimReg::Dplbase
            | SimReg::Dpubase => 4,
            SimReg::Corb(reg) => match reg {
                CorbReg::Lbase | CorbReg::Ubase => 4,
                CorbReg::Wp | CorbReg::Rp => 2,
                CorbReg::Ctl | CorbReg::Sts | CorbReg::Size => 1,
            },
            SimReg::Rirb(reg) => match reg {
                RirbReg::Lbase | RirbReg::Ubase => 4,
                RirbReg::Wp | RirbReg::RintCnt => 2,
                RirbReg::Ctl | RirbReg::Sts | RirbReg::Size => 1,
            },
            SimReg::Stream(_, reg) => match reg {
                StreamReg::Ctl => 3,
                StreamReg::Sts => 1,
                StreamReg::Lvi | StreamReg::Fifow | StreamReg::Fifos | StreamReg::Fmt => 2,
                StreamReg::Lpib | StreamReg::Cbl | StreamReg::Bdpl | StreamReg::Bdpu => 4,
            },
        }
    }

    fn at(offset: u32, engines: usize) -> Option<Self> {
        Some(match offset {
            HDA_GCAP => SimReg::Gcap,
            HDA_VMIN => SimReg::Vmin,
            HDA_VMAJ => SimReg::Vmaj,
            HDA_OUTPAY => SimReg::Outpay,
            HDA_INPAY => SimReg::Inpay,
            HDA_GCTL => SimReg::Gctl,
            HDA_WAKEEN => SimReg::Wakeen,
            HDA_STATESTS => SimReg::Statests,
            HDA_GSTS => SimReg::Gsts,
            HDA_INTCTL => SimReg::Intctl,
            HDA_INTSTS => SimReg::Intsts,
            HDA_WALCLK => SimReg::Walclk,
            HDA_SSYNC => SimReg::Ssync,
            HDA_CORBLBASE => SimReg::Corb(CorbReg::Lbase),
            HDA_CORBUBASE => SimReg::Corb(CorbReg::Ubase),
            HDA_CORBWP => SimReg::Corb(CorbReg::Wp),
            HDA_CORBRP => SimReg::Corb(CorbReg::Rp),
            HDA_CORBCTL => SimReg::Corb(CorbReg::Ctl),
            HDA_CORBSTS => SimReg::Corb(CorbReg::Sts),
            HDA_CORBSIZE => SimReg::Corb(CorbReg::Size),
            HDA_RIRBLBASE => SimReg::Rirb(RirbReg::Lbase),
            HDA_RIRBUBASE => SimReg::Rirb(RirbReg::Ubase),
            HDA_RIRBWP => SimReg::Rirb(RirbReg::Wp),
            HDA_RINTCNT => SimReg::Rirb(RirbReg::RintCnt),
            HDA_RIRBCTL => SimReg::Rirb(RirbReg::Ctl),
            HDA_RIRBSTS => SimReg::Rirb(RirbReg::Sts),
            HDA_RIRBSIZE => SimReg::Rirb(RirbReg::Size),
            HDA_IC => SimReg::Ic,
            HDA_IR => SimReg::Ir,
            HDA_ICS => SimReg::Ics,
            HDA_DPLBASE => SimReg::Dplbase,
            HDA_DPUBASE => SimReg::Dpubase,
            _ => {
                let rel = offset.checked_sub(HDA_SD_BASE)?;
                let index = (rel / HDA_SD_STRIDE) as usize;
                if index >= engines {
                    return None;
                }
                let reg = match rel % HDA_SD_STRIDE {
                    SD_CTL => StreamReg::Ctl,
                    SD_STS => StreamReg::Sts,
                    SD_LPIB => StreamReg::Lpib,
                    SD_CBL => StreamReg::Cbl,
                    SD_LVI => StreamReg::Lvi,
                    SD_FIFOW => StreamReg::Fifow,
                    SD_FIFOS => StreamReg::Fifos,
                    SD_FMT => StreamReg::Fmt,
                    SD_BDPL => StreamReg::Bdpl,
                    SD_BDPU => StreamReg::Bdpu,
                    _ => return None,
                };
                SimReg::Stream(index, reg)
            }
        })
    }

    /// Resolve one byte offset. Reserved bytes decode to `None`.
    pub fn decode_byte(offset: u32, engines: usize) -> Option<DecodedByte> {
        // No register is wider than four bytes.
        (0..4u32).find_map(|back| {
            let start = offset.checked_sub(back)?;
            let reg = Self::at(start, engines)?;
            (back < reg.width()).then_some(DecodedByte { reg, start })
        })
    }
}

/// One register touched by an access: the bytes written or read, positioned in the register.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RegAccess {
    pub reg: SimReg,
    /// Access value shifted into register bit positions.
    pub value: u32,
    /// Bits of the register covered by the access.
    pub mask: u32,
}

impl RegAccess {
    /// `old` with the accessed bytes replaced.
    pub fn merge(&self, old: u32) -> u32 {
        (old & !self.mask) | (self.value & self.mask)
    }

    /// Whether the access wrote `bits` as ones.
    pub fn sets(&self, bits: u32) -> bool {
        self.mask & bits == bits && self.value & bits == bits
    }
}

/// Split a write of `size` bytes at `offset` into per-register pieces.
pub fn split_access(offset: u32, size: u32, value: u32, engines: usize) -> Vec<RegAccess> {
    let mut out: Vec<RegAccess> = Vec::new();
    for i in 0..size {
        let Some(decoded) = SimReg::decode_byte(offset + i, engines) else {
            continue;
        };
        let byte_in_reg = offset + i - decoded.start;
        let byte = (value >> (i * 8)) & 0xFF;
        let bits = byte << (byte_in_reg * 8);
        let mask = 0xFF << (byte_in_reg * 8);
        match out.last_mut() {
            Some(last) if last.reg == decoded.reg => {
                last.value |= bits;
                last.mask |= mask;
            }
            _ => out.push(RegAccess {
                reg: decoded.reg,
                value: bits,
                mask,
            }),
        }
    }
    out
}
