//! Stream descriptor engines: reset/run handshakes, BDL fetch and link-paced position.

use std::time::Duration;

use hda_host::bdl::BDL_ENTRY_BYTES;
use hda_host::regs::*;
use hda_host::status::stream_interrupt_active;
use hda_host::stream::bytes_after;
use hda_host::{DmaMemory, StreamFormat};

use crate::regs::{RegAccess, StreamReg};

const DEFAULT_FIFOS: u16 = 0x20;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct Descriptor {
    addr: u64,
    len: u32,
    ioc: bool,
}

/// DMA state captured when RUN is set.
#[derive(Debug, Clone)]
struct Running {
    /// IOC offsets within the cyclic buffer, `1..=cbl`.
    boundaries: Vec<u32>,
    cbl: u32,
    byte_rate: u64,
    /// Position is `anchor_pos` plus the bytes moved since `anchor_time`.
    anchor_time: Duration,
    anchor_pos: u64,
    /// Set when the descriptor list was rejected; the engine stays in RUN but moves nothing.
    halted: bool,
}

/// Faults a test can arm on one engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamFaults {
    /// SRST writes are ignored, so reset entry and exit never acknowledge.
    pub stuck_reset: bool,
    /// The next RUN transition reports a descriptor error.
    pub descriptor_error: bool,
    /// The DMA pointer stops moving while RUN stays set.
    pub stalled: bool,
    /// Boundary crossings no longer raise BCIS.
    pub suppress_ioc: bool,
}

#[derive(Debug, Clone)]
pub struct SimStream {
    index: usize,
    ctl: u32,
    sts: u8,
    lpib: u32,
    cbl: u32,
    lvi: u16,
    fifow: u16,
    fifos: u16,
    fmt: u16,
    bdpl: u32,
    bdpu: u32,
    /// Bytes moved since the last stream reset.
    position: u64,
    running: Option<Running>,
    pub faults: StreamFaults,
}

impl SimStream {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            ctl: 0,
            sts: 0,
            lpib: 0,
            cbl: 0,
            lvi: 0,
            fifow: 0,
            fifos: DEFAULT_FIFOS,
            fmt: 0,
            bdpl: 0,
            bdpu: 0,
            position: 0,
            running: None,
            faults: StreamFaults::default(),
        }
    }

    pub fn reset(&mut self) {
        let faults = self.faults;
        *self = Self::new(self.index);
        self.faults = faults;
    }

    pub fn lpib(&self) -> u32 {
        self.lpib
    }

    /// Bytes moved since the last stream reset.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn interrupt_pending(&self) -> bool {
        stream_interrupt_active(self.ctl, self.sts)
    }

    pub fn raise_buffer_complete(&mut self) {
        self.sts |= SD_STS_BCIS;
        tracing::warn!(engine = self.index, lpib = self.lpib, "spurious buffer completion");
    }

    pub fn raise_fifo_error(&mut self) {
        self.sts |= SD_STS_FIFOE;
        tracing::warn!(engine = self.index, "stream FIFO error");
    }

    fn bdl_base(&self) -> u64 {
        (u64::from(self.bdpu) << 32) | u64::from(self.bdpl & !0x7F)
    }

    pub fn read(&self, reg: StreamReg) -> u32 {
        match reg {
            StreamReg::Ctl => self.ctl,
            StreamReg::Sts => u32::from(self.sts),
            StreamReg::Lpib => self.lpib,
            StreamReg::Cbl => self.cbl,
            StreamReg::Lvi => u32::from(self.lvi),
            StreamReg::Fifow => u32::from(self.fifow),
            StreamReg::Fifos => u32::from(self.fifos),
            StreamReg::Fmt => u32::from(self.fmt),
            StreamReg::Bdpl => self.bdpl,
            StreamReg::Bdpu => self.bdpu,
        }
    }

    pub fn write(&mut self, reg: StreamReg, access: &RegAccess, now: Duration, mem: &dyn DmaMemory) {
        let merged = access.merge(self.read(reg));
        match reg {
            StreamReg::Ctl => self.write_ctl(merged & 0x00FF_FFFF, now, mem),
            StreamReg::Sts => self.sts &= !(access.value as u8 & SD_STS_W1C_MASK),
            // Read-only.
            StreamReg::Lpib | StreamReg::Fifos => {}
            StreamReg::Cbl => self.cbl = merged,
            StreamReg::Lvi => self.lvi = merged as u16 & 0xFF,
            StreamReg::Fifow => self.fifow = merged as u16 & 0x7,
            StreamReg::Fmt => self.fmt = merged as u16,
            StreamReg::Bdpl => self.bdpl = merged,
            StreamReg::Bdpu => self.bdpu = merged,
        }
    }

    fn write_ctl(&mut self, mut ctl: u32, now: Duration, mem: &dyn DmaMemory) {
        let old = self.ctl;
        if self.faults.stuck_reset {
            ctl = (ctl & !SD_CTL_SRST) | (old & SD_CTL_SRST);
        }
        if ctl & SD_CTL_SRST != 0 {
            // An engine in reset cannot run.
            ctl &= !SD_CTL_RUN;
        }
        self.ctl = ctl;

        if old & SD_CTL_SRST != 0 && ctl & SD_CTL_SRST == 0 {
            self.lpib = 0;
            self.sts = 0;
            self.position = 0;
            self.running = None;
            tracing::trace!(engine = self.index, "stream reset released");
        }

        let was_running = old & SD_CTL_RUN != 0;
        let runs = ctl & SD_CTL_RUN != 0;
        if !was_running && runs {
            self.start(now, mem);
        } else if was_running && !runs {
            self.advance(now);
            self.running = None;
            self.sts &= !SD_STS_FIFORDY;
            tracing::trace!(engine = self.index, lpib = self.lpib, "stream stopped");
        }
    }

    fn load_descriptors(&self, mem: &dyn DmaMemory) -> Option<Vec<Descriptor>> {
        let count = usize::from(self.lvi) + 1;
        if count < 2 {
            return None;
        }
        let base = self.bdl_base();
        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            let mut raw = [0u8; BDL_ENTRY_BYTES];
            mem.read_physical(base.checked_add((i * BDL_ENTRY_BYTES) as u64)?, &mut raw);
            let (addr, rest) = raw.split_at(8);
            let (len, flags) = rest.split_at(4);
            let entry = Descriptor {
                addr: u64::from_le_bytes(addr.try_into().ok()?),
                len: u32::from_le_bytes(len.try_into().ok()?),
                ioc: u32::from_le_bytes(flags.try_into().ok()?) & 1 != 0,
            };
            if entry.len == 0 || entry.addr == 0 {
                return None;
            }
            out.push(entry);
        }
        let total: u64 = out.iter().map(|e| u64::from(e.len)).sum();
        (total == u64::from(self.cbl)).then_some(out)
    }

    fn start(&mut self, now: Duration, mem: &dyn DmaMemory) {
        let descriptors = if std::mem::take(&mut self.faults.descriptor_error) {
            None
        } else {
            self.load_descriptors(mem)
        };
        let byte_rate = StreamFormat::decode(self.fmt).map(|f| f.byte_rate()).ok();

        let mut boundaries = Vec::new();
        let mut end = 0u32;
        for entry in descriptors.iter().flatten() {
            end += entry.len;
            if entry.ioc {
                boundaries.push(end);
            }
        }

        let halted = descriptors.is_none() || byte_rate.is_none();
        if halted {
            self.sts |= SD_STS_DESE;
            tracing::warn!(
                engine = self.index,
                cbl = self.cbl,
                lvi = self.lvi,
                "stream descriptor error"
            );
        } else {
            self.sts |= SD_STS_FIFORDY;
            tracing::trace!(engine = self.index, cbl = self.cbl, "stream running");
        }
        self.running = Some(Running {
            boundaries,
            cbl: self.cbl,
            byte_rate: byte_rate.unwrap_or(0),
            anchor_time: now,
            anchor_pos: self.position,
            halted,
        });
    }

    /// Move the DMA pointer to where the link has carried it by `now`.
    pub fn advance(&mut self, now: Duration) {
        let stalled = self.faults.stalled;
        let Some(run) = self.running.as_mut() else {
            return;
        };
        if run.halted || run.cbl == 0 {
            return;
        }
        if stalled {
            run.anchor_time = now;
            run.anchor_pos = self.position;
            return;
        }
        let elapsed = now.saturating_sub(run.anchor_time);
        let next = run.anchor_pos + bytes_after(elapsed, run.byte_rate);
        if next == self.position {
            return;
        }

        let cbl = u64::from(run.cbl);
        let crossed = run.boundaries.iter().any(|&b| {
            // First occurrence of this boundary after the old position.
            let b = u64::from(b);
            let cycle = self.position.saturating_sub(b) / cbl;
            let mut at = cycle * cbl + b;
            if at <= self.position {
                at += cbl;
            }
            at <= next
        });
        if crossed && !self.faults.suppress_ioc {
            self.sts |= SD_STS_BCIS;
        }
        self.position = next;
        self.lpib = (next % cbl) as u32;
    }
}
