//! Controller and stream status aggregation.
//!
//! In poll mode status getters re-read hardware. In interrupt mode the [`InterruptHandler`]
//! reads and write-one-clears the hardware bits it observes and folds them into a pending
//! accumulator; getters return the accumulator merged with whatever is still latched in
//! hardware. Both modes therefore report every sticky bit raised since the last explicit clear.

use std::sync::{Arc, Mutex, MutexGuard};

use bitflags::bitflags;

use crate::config::StatusMode;
use crate::error::{HdaError, Result};
use crate::platform::RegisterIo;
use crate::regs::*;

bitflags! {
    /// Controller-level sticky conditions.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct RingStatus: u8 {
        const CORB_MEMORY_ERROR = 1 << 0;
        const RIRB_OVERRUN = 1 << 1;
        const RESPONSE_READY = 1 << 2;
    }
}

bitflags! {
    /// Stream engine sticky conditions; bit positions match SDnSTS.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct StreamStatus: u8 {
        const BUFFER_COMPLETE = SD_STS_BCIS;
        const FIFO_ERROR = SD_STS_FIFOE;
        const DESCRIPTOR_ERROR = SD_STS_DESE;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControllerStatus {
    pub ring: RingStatus,
    /// STATESTS codec wake/state-change bits.
    pub state_change: u16,
    /// INTSTS bits observed by the interrupt handler (always zero in poll mode).
    pub intsts: u32,
}

impl ControllerStatus {
    /// Monotone OR of every sticky field.
    pub fn merge(self, other: Self) -> Self {
        Self {
            ring: self.ring | other.ring,
            state_change: self.state_change | other.state_change,
            intsts: self.intsts | other.intsts,
        }
    }

    pub fn faults(&self) -> RingStatus {
        self.ring & (RingStatus::CORB_MEMORY_ERROR | RingStatus::RIRB_OVERRUN)
    }
}

pub fn merge_stream(a: StreamStatus, b: StreamStatus) -> StreamStatus {
    a | b
}

#[derive(Debug, Default)]
struct Pending {
    controller: ControllerStatus,
    streams: Vec<StreamStatus>,
}

#[derive(Debug, Default)]
struct SharedPending {
    inner: Mutex<Pending>,
}

impl SharedPending {
    fn lock(&self) -> MutexGuard<'_, Pending> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn read_ring_status(regs: &dyn RegisterIo) -> RingStatus {
    let corbsts = regs.read8(HDA_CORBSTS);
    let rirbsts = regs.read8(HDA_RIRBSTS);
    let mut status = RingStatus::empty();
    status.set(RingStatus::CORB_MEMORY_ERROR, corbsts & CORBSTS_CMEI != 0);
    status.set(RingStatus::RIRB_OVERRUN, rirbsts & RIRBSTS_OIS != 0);
    status.set(RingStatus::RESPONSE_READY, rirbsts & RIRBSTS_RINTFL != 0);
    status
}

fn clear_ring_status(regs: &dyn RegisterIo, bits: RingStatus) {
    if bits.contains(RingStatus::CORB_MEMORY_ERROR) {
        regs.write8(HDA_CORBSTS, CORBSTS_CMEI);
    }
    let mut rirb = 0;
    if bits.contains(RingStatus::RIRB_OVERRUN) {
        rirb |= RIRBSTS_OIS;
    }
    if bits.contains(RingStatus::RESPONSE_READY) {
        rirb |= RIRBSTS_RINTFL;
    }
    if rirb != 0 {
        regs.write8(HDA_RIRBSTS, rirb);
    }
}

fn read_stream_status(regs: &dyn RegisterIo, engine: usize) -> StreamStatus {
    StreamStatus::from_bits_truncate(regs.read8(sd_reg(engine, SD_STS)))
}

/// Gathers controller and per-engine status in either poll or interrupt mode.
pub struct StatusAggregator {
    mode: StatusMode,
    regs: Arc<dyn RegisterIo>,
    engines: usize,
    pending: Arc<SharedPending>,
}

impl std::fmt::Debug for StatusAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusAggregator")
            .field("mode", &self.mode)
            .field("engines", &self.engines)
            .finish_non_exhaustive()
    }
}

impl StatusAggregator {
    pub fn new(mode: StatusMode, regs: Arc<dyn RegisterIo>, engines: usize) -> Self {
        let pending = SharedPending::default();
        pending.lock().streams = vec![StreamStatus::empty(); engines];
        Self {
            mode,
            regs,
            engines,
            pending: Arc::new(pending),
        }
    }

    pub fn mode(&self) -> StatusMode {
        self.mode
    }

    /// Handler to be invoked from the hardware interrupt context.
    pub fn interrupt_handler(&self) -> InterruptHandler {
        InterruptHandler {
            regs: Arc::clone(&self.regs),
            engines: self.engines,
            pending: Arc::clone(&self.pending),
        }
    }

    pub fn controller_status(&self) -> ControllerStatus {
        let hw = ControllerStatus {
            ring: read_ring_status(self.regs.as_ref()),
            state_change: self.regs.read16(HDA_STATESTS) & STATESTS_MASK,
            intsts: 0,
        };
        match self.mode {
            StatusMode::Poll => hw,
            StatusMode::Interrupt => self.pending.lock().controller.merge(hw),
        }
    }

    pub fn stream_status(&self, engine: usize) -> StreamStatus {
        let hw = read_stream_status(self.regs.as_ref(), engine);
        match self.mode {
            StatusMode::Poll => hw,
            StatusMode::Interrupt => {
                let pending = self.pending.lock();
                let acc = pending
                    .streams
                    .get(engine)
                    .copied()
                    .unwrap_or_default();
                merge_stream(acc, hw)
            }
        }
    }

    /// Pending CORB memory error / RIRB overrun, if any.
    pub fn ring_faults(&self) -> RingStatus {
        self.controller_status().faults()
    }

    /// Acknowledge controller conditions: write-one-clear in hardware and drop them from the
    /// accumulator, under the lock shared with the interrupt handler.
    pub fn clear_controller(&self, ring: RingStatus, state_change: u16) {
        let mut pending = self.pending.lock();
        clear_ring_status(self.regs.as_ref(), ring);
        if state_change != 0 {
            self.regs
                .write16(HDA_STATESTS, state_change & STATESTS_MASK);
        }
        pending.controller.ring.remove(ring);
        pending.controller.state_change &= !state_change;
        if pending.controller.ring.is_empty() && pending.controller.state_change == 0 {
            pending.controller.intsts &= !INTSTS_CIS;
        }
        if pending.controller.intsts & !INTSTS_GIS == 0 {
            pending.controller.intsts = 0;
        }
    }

    pub fn clear_stream(&self, engine: usize, bits: StreamStatus) {
        let mut pending = self.pending.lock();
        if bits.is_empty() {
            return;
        }
        self.regs.write8(sd_reg(engine, SD_STS), bits.bits());
        if let Some(acc) = pending.streams.get_mut(engine) {
            acc.remove(bits);
            if acc.is_empty() && engine < MAX_ENGINES {
                pending.controller.intsts &= !(1u32 << engine);
            }
        }
        if pending.controller.intsts & !INTSTS_GIS == 0 {
            pending.controller.intsts = 0;
        }
    }

    /// Check that INTSTS agrees with the sub-status registers and their enables.
    ///
    /// The aggregate interrupt bit must be set iff at least one enabled condition (CORB memory
    /// error, RIRB overrun, response interrupt, codec state change, per-stream status) is active.
    /// A mismatch is a fatal protocol inconsistency.
    pub fn check_consistency(&self) -> Result<()> {
        // Hold the lock so the interrupt handler cannot clear bits between the reads.
        let _pending = self.pending.lock();
        let regs = self.regs.as_ref();

        // A concurrent hardware event can tear the snapshot; only a stable INTSTS is compared.
        let mut last = None;
        for _ in 0..3 {
            let before = regs.read32(HDA_INTSTS);
            let expected = expected_intsts(regs, self.engines);
            let after = regs.read32(HDA_INTSTS);
            if before != after {
                continue;
            }
            if after == expected {
                return Ok(());
            }
            last = Some((after, expected));
            break;
        }
        let (intsts, expected) = match last {
            Some(pair) => pair,
            None => {
                let intsts = regs.read32(HDA_INTSTS);
                (intsts, expected_intsts(regs, self.engines))
            }
        };
        if intsts == expected {
            return Ok(());
        }
        tracing::error!(
            intsts = format_args!("{intsts:#010x}"),
            expected = format_args!("{expected:#010x}"),
            "interrupt status inconsistent with sub-status registers"
        );
        Err(HdaError::InterruptInconsistency { intsts, expected })
    }
}

/// INTSTS value implied by the controller and stream sub-status registers and their enables.
pub fn expected_intsts(regs: &dyn RegisterIo, engines: usize) -> u32 {
    let corbctl = regs.read8(HDA_CORBCTL);
    let corbsts = regs.read8(HDA_CORBSTS);
    let rirbctl = regs.read8(HDA_RIRBCTL);
    let rirbsts = regs.read8(HDA_RIRBSTS);
    let wakeen = regs.read16(HDA_WAKEEN);
    let statests = regs.read16(HDA_STATESTS);

    let cis = (corbsts & CORBSTS_CMEI != 0 && corbctl & CORBCTL_CMEIE != 0)
        || (rirbsts & RIRBSTS_RINTFL != 0 && rirbctl & RIRBCTL_RINTCTL != 0)
        || (rirbsts & RIRBSTS_OIS != 0 && rirbctl & RIRBCTL_OIC != 0)
        || (statests & wakeen & STATESTS_MASK) != 0;

    let mut intsts = if cis { INTSTS_CIS } else { 0 };
    for engine in 0..engines.min(MAX_ENGINES) {
        let ctl = regs.read32(sd_reg(engine, SD_CTL));
        let sts = regs.read8(sd_reg(engine, SD_STS));
        if stream_interrupt_active(ctl, sts) {
            intsts |= 1 << engine;
        }
    }
    if intsts != 0 {
        intsts |= INTSTS_GIS;
    }
    intsts
}

/// Whether a stream's status bits raise its INTSTS bit given the SDnCTL enables.
pub fn stream_interrupt_active(ctl: u32, sts: u8) -> bool {
    (sts & SD_STS_BCIS != 0 && ctl & SD_CTL_IOCE != 0)
        || (sts & SD_STS_FIFOE != 0 && ctl & SD_CTL_FEIE != 0)
        || (sts & SD_STS_DESE != 0 && ctl & SD_CTL_DEIE != 0)
}

/// Interrupt service routine state, safe to run on a separate execution context.
#[derive(Clone)]
pub struct InterruptHandler {
    regs: Arc<dyn RegisterIo>,
    engines: usize,
    pending: Arc<SharedPending>,
}

impl std::fmt::Debug for InterruptHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptHandler")
            .field("engines", &self.engines)
            .finish_non_exhaustive()
    }
}

impl InterruptHandler {
    /// Service one interrupt. Returns false when the controller did not raise it.
    pub fn service(&self) -> bool {
        let regs = self.regs.as_ref();
        let mut pending = self.pending.lock();
        let intsts = regs.read32(HDA_INTSTS);
        if intsts & INTSTS_GIS == 0 {
            return false;
        }

        if intsts & INTSTS_CIS != 0 {
            let ring = read_ring_status(regs);
            let state_change = regs.read16(HDA_STATESTS) & STATESTS_MASK;
            clear_ring_status(regs, ring);
            if state_change != 0 {
                regs.write16(HDA_STATESTS, state_change);
            }
            pending.controller.ring |= ring;
            pending.controller.state_change |= state_change;
        }

        for engine in 0..self.engines.min(MAX_ENGINES) {
            if intsts & (1 << engine) == 0 {
                continue;
            }
            let sts = read_stream_status(regs, engine);
            if !sts.is_empty() {
                regs.write8(sd_reg(engine, SD_STS), sts.bits());
            }
            if let Some(acc) = pending.streams.get_mut(engine) {
                *acc |= sts;
            }
        }

        pending.controller.intsts |= intsts;
        tracing::trace!(intsts = format_args!("{intsts:#010x}"), "serviced HDA interrupt");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_is_monotone_or() {
        let a = ControllerStatus {
            ring: RingStatus::RESPONSE_READY,
            state_change: 0b01,
            intsts: INTSTS_CIS,
        };
        let b = ControllerStatus {
            ring: RingStatus::RIRB_OVERRUN,
            state_change: 0b10,
            intsts: 0,
        };
        let merged = a.merge(b);
        assert_eq!(
            merged.ring,
            RingStatus::RESPONSE_READY | RingStatus::RIRB_OVERRUN
        );
        assert_eq!(merged.state_change, 0b11);
        assert_eq!(merged.intsts, INTSTS_CIS);
        assert_eq!(merged.merge(a), merged);
        assert_eq!(merged.faults(), RingStatus::RIRB_OVERRUN);

        let s = merge_stream(StreamStatus::BUFFER_COMPLETE, StreamStatus::FIFO_ERROR);
        assert!(s.contains(StreamStatus::BUFFER_COMPLETE | StreamStatus::FIFO_ERROR));
    }

    #[test]
    fn stream_interrupt_requires_enable() {
        assert!(!stream_interrupt_active(0, SD_STS_BCIS));
        assert!(stream_interrupt_active(SD_CTL_IOCE, SD_STS_BCIS));
        assert!(stream_interrupt_active(SD_CTL_DEIE, SD_STS_DESE));
        assert!(!stream_interrupt_active(SD_CTL_DEIE, SD_STS_FIFOE));
        // FIFORDY is not an interrupt source.
        assert!(!stream_interrupt_active(
            SD_CTL_IOCE | SD_CTL_FEIE | SD_CTL_DEIE,
            SD_STS_FIFORDY
        ));
    }

    #[test]
    fn stream_status_bits_match_register_layout() {
        let sts = StreamStatus::from_bits_truncate(SD_STS_BCIS | SD_STS_FIFORDY);
        assert_eq!(sts, StreamStatus::BUFFER_COMPLETE);
    }
}
