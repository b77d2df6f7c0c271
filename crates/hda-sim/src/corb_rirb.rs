//! Command output and response input ring DMA engines.

use hda_host::regs::*;
use hda_host::DmaMemory;

use crate::regs::{CorbReg, RegAccess, RirbReg};

/// Ring bases are 128-byte aligned; bits 6:0 are reserved.
fn ring_base(lbase: u32, ubase: u32) -> u64 {
    (u64::from(ubase) << 32) | u64::from(lbase & !0x7F)
}

#[derive(Debug, Clone)]
pub struct Corb {
    lbase: u32,
    ubase: u32,
    wp: u16,
    rp: u16,
    ctl: u8,
    sts: u8,
    size: u8,
    caps: u8,
    /// Report CORBRP bit 15 as set until software clears it.
    latch_reset: bool,
    reset_latched: bool,
}

impl Corb {
    pub fn new(caps: u8, latch_reset: bool) -> Self {
        Self {
            lbase: 0,
            ubase: 0,
            wp: 0,
            rp: 0,
            ctl: 0,
            sts: 0,
            size: caps & (RING_SIZE_CAP_2 | RING_SIZE_CAP_16 | RING_SIZE_CAP_256),
            caps,
            latch_reset,
            reset_latched: false,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.caps, self.latch_reset);
    }

    pub fn is_running(&self) -> bool {
        self.ctl & CORBCTL_RUN != 0
    }

    pub fn entries(&self) -> u16 {
        ring_entries(self.size)
    }

    pub fn read_pointer(&self) -> u16 {
        self.rp
    }

    pub fn has_pending(&self) -> bool {
        self.rp != self.wp
    }

    fn sanitize_pointers(&mut self) {
        let mask = self.entries() - 1;
        self.wp &= mask;
        self.rp &= mask;
    }

    pub fn read(&self, reg: CorbReg) -> u32 {
        match reg {
            CorbReg::Lbase => self.lbase,
            CorbReg::Ubase => self.ubase,
            CorbReg::Wp => u32::from(self.wp),
            CorbReg::Rp => {
                let latched = if self.reset_latched { CORBRP_RST } else { 0 };
                u32::from(self.rp | latched)
            }
            CorbReg::Ctl => u32::from(self.ctl),
            CorbReg::Sts => u32::from(self.sts),
            CorbReg::Size => u32::from(self.size),
        }
    }

    pub fn write(&mut self, reg: CorbReg, access: &RegAccess) {
        let merged = access.merge(self.read(reg));
        match reg {
            CorbReg::Lbase => self.lbase = merged,
            CorbReg::Ubase => self.ubase = merged,
            CorbReg::Wp => self.wp = merged as u16 & (self.entries() - 1),
            CorbReg::Rp => {
                // Only the reset bit is writable; the pointer itself belongs to the DMA engine.
                if access.mask & u32::from(CORBRP_RST) != 0 {
                    if access.value & u32::from(CORBRP_RST) != 0 {
                        self.rp = 0;
                        self.reset_latched = self.latch_reset;
                    } else {
                        self.reset_latched = false;
                    }
                }
            }
            CorbReg::Ctl => {
                let ctl = merged as u8 & (CORBCTL_RUN | CORBCTL_CMEIE);
                if ctl & CORBCTL_RUN != self.ctl & CORBCTL_RUN {
                    tracing::trace!(running = ctl & CORBCTL_RUN != 0, "CORB DMA");
                }
                self.ctl = ctl;
            }
            CorbReg::Sts => self.sts &= !(access.value as u8 & CORBSTS_CMEI),
            CorbReg::Size => {
                let sel = merged as u8 & RING_SIZE_SEL_MASK;
                let old = self.size & RING_SIZE_SEL_MASK;
                self.size = (self.size & !RING_SIZE_SEL_MASK) | sel;
                if sel != old {
                    self.sanitize_pointers();
                }
            }
        }
    }

    /// Fetch the next command word, advancing the read pointer.
    pub fn fetch(&mut self, mem: &dyn DmaMemory) -> Option<u32> {
        if !self.has_pending() {
            return None;
        }
        let next = (self.rp + 1) % self.entries();
        // The pointer advances even when the address overflows, so a bad base cannot wedge us.
        self.rp = next;
        let addr = ring_base(self.lbase, self.ubase).checked_add(u64::from(next) * 4)?;
        Some(mem.read_u32(addr))
    }

    /// A failed command fetch stops the engine and flags CMEI.
    pub fn raise_memory_error(&mut self) {
        self.sts |= CORBSTS_CMEI;
        self.ctl &= !CORBCTL_RUN;
        tracing::warn!(rp = self.rp, wp = self.wp, "CORB memory error");
    }

    pub fn interrupt_pending(&self) -> bool {
        self.sts & CORBSTS_CMEI != 0 && self.ctl & CORBCTL_CMEIE != 0
    }
}

#[derive(Debug, Clone)]
pub struct Rirb {
    lbase: u32,
    ubase: u32,
    wp: u16,
    rintcnt: u16,
    ctl: u8,
    sts: u8,
    size: u8,
    caps: u8,
    responses_since_irq: u16,
    /// Responses written since software last acknowledged RINTFL or reset the write pointer.
    unacknowledged: u16,
    overruns: u64,
    /// DMAEN ignores writes that would clear it.
    pub stuck_dma: bool,
}

impl Rirb {
    pub fn new(caps: u8) -> Self {
        Self {
            lbase: 0,
            ubase: 0,
            wp: 0,
            rintcnt: 0,
            ctl: 0,
            sts: 0,
            size: caps & (RING_SIZE_CAP_2 | RING_SIZE_CAP_16 | RING_SIZE_CAP_256),
            caps,
            responses_since_irq: 0,
            unacknowledged: 0,
            overruns: 0,
            stuck_dma: false,
        }
    }

    pub fn reset(&mut self) {
        let stuck_dma = self.stuck_dma;
        *self = Self::new(self.caps);
        self.stuck_dma = stuck_dma;
    }

    pub fn is_running(&self) -> bool {
        self.ctl & RIRBCTL_DMAEN != 0
    }

    pub fn entries(&self) -> u16 {
        ring_entries(self.size)
    }

    pub fn write_pointer(&self) -> u16 {
        self.wp
    }

    /// Responses dropped because the ring was full.
    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    pub fn read(&self, reg: RirbReg) -> u32 {
        match reg {
            RirbReg::Lbase => self.lbase,
            RirbReg::Ubase => self.ubase,
            RirbReg::Wp => u32::from(self.wp),
            RirbReg::RintCnt => u32::from(self.rintcnt),
            RirbReg::Ctl => u32::from(self.ctl),
            RirbReg::Sts => u32::from(self.sts),
            RirbReg::Size => u32::from(self.size),
        }
    }

    pub fn write(&mut self, reg: RirbReg, access: &RegAccess) {
        let merged = access.merge(self.read(reg));
        match reg {
            RirbReg::Lbase => self.lbase = merged,
            RirbReg::Ubase => self.ubase = merged,
            RirbReg::Wp => {
                if access.sets(u32::from(RIRBWP_RST)) {
                    self.wp = 0;
                    self.responses_since_irq = 0;
                    self.unacknowledged = 0;
                }
            }
            RirbReg::RintCnt => self.rintcnt = merged as u16 & 0xFF,
            RirbReg::Ctl => {
                let mut ctl = merged as u8 & (RIRBCTL_RINTCTL | RIRBCTL_DMAEN | RIRBCTL_OIC);
                if self.stuck_dma {
                    ctl |= self.ctl & RIRBCTL_DMAEN;
                }
                self.ctl = ctl;
            }
            RirbReg::Sts => {
                let clear = access.value as u8 & (RIRBSTS_RINTFL | RIRBSTS_OIS);
                self.sts &= !clear;
                if clear & RIRBSTS_RINTFL != 0 {
                    self.unacknowledged = 0;
                }
            }
            RirbReg::Size => {
                self.size = (self.size & !RING_SIZE_SEL_MASK) | (merged as u8 & RING_SIZE_SEL_MASK);
                self.wp &= self.entries() - 1;
            }
        }
    }

    fn threshold(&self) -> u16 {
        // RINTCNT of zero means 256 responses.
        if self.rintcnt == 0 {
            256
        } else {
            self.rintcnt
        }
    }

    /// Write one response entry. Returns false when the ring is full and the response is lost.
    pub fn push(&mut self, mem: &dyn DmaMemory, response: u64) -> bool {
        let entries = self.entries();
        if self.unacknowledged + 1 >= entries {
            self.raise_overrun();
            return false;
        }
        let next = (self.wp + 1) % entries;
        if let Some(addr) = ring_base(self.lbase, self.ubase).checked_add(u64::from(next) * 8) {
            mem.write_u64(addr, response);
        }
        self.wp = next;
        self.unacknowledged += 1;
        self.responses_since_irq += 1;
        if self.responses_since_irq >= self.threshold() {
            self.responses_since_irq = 0;
            self.sts |= RIRBSTS_RINTFL;
        }
        true
    }

    /// End of a burst: responses written since the last flag raise RINTFL.
    pub fn flush(&mut self) {
        if self.responses_since_irq > 0 {
            self.responses_since_irq = 0;
            self.sts |= RIRBSTS_RINTFL;
        }
    }

    pub fn raise_overrun(&mut self) {
        self.sts |= RIRBSTS_OIS;
        self.overruns += 1;
        tracing::warn!(wp = self.wp, "RIRB overrun, response dropped");
    }

    pub fn interrupt_pending(&self) -> bool {
        (self.sts & RIRBSTS_RINTFL != 0 && self.ctl & RIRBCTL_RINTCTL != 0)
            || (self.sts & RIRBSTS_OIS != 0 && self.ctl & RIRBCTL_OIC != 0)
    }
}
