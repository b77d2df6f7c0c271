//! CORB/RIRB command/response ring protocol.
//!
//! The CORB is written by software (write pointer) and consumed by the controller (read
//! pointer). The RIRB is written by the controller (write pointer) and consumed by software
//! (read pointer). Both pointers always name the last slot written/consumed, so the next slot is
//! `(ptr + 1) mod capacity`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crate::config::HdaConfig;
use crate::error::{HdaError, Result};
use crate::platform::{poll_until, Clock, DmaMemory, DmaRegion, Platform, RegisterIo};
use crate::regs::*;
use crate::status::{RingStatus, StatusAggregator};
use crate::verb::{Command, Response};

pub const CORB_ENTRY_BYTES: u64 = 4;
pub const RIRB_ENTRY_BYTES: u64 = 8;
pub const RING_ALIGN: usize = 128;

/// Free CORB slots given the software write pointer and the controller read pointer.
pub fn ring_free_space(capacity: u16, wp: u16, rp: u16) -> u16 {
    capacity - ring_pending(capacity, wp, rp)
}

/// Entries written but not yet consumed.
pub fn ring_pending(capacity: u16, wp: u16, rp: u16) -> u16 {
    if capacity == 0 {
        return 0;
    }
    (wp % capacity + capacity - rp % capacity) % capacity
}

#[derive(Debug)]
struct RingState {
    base: Option<DmaRegion>,
    entries: u16,
    /// Software-owned pointer: CORB write pointer / RIRB read pointer.
    sw_ptr: u16,
}

impl RingState {
    fn new() -> Self {
        Self {
            base: None,
            entries: 0,
            sw_ptr: 0,
        }
    }

    fn slot(&self, index: u16, entry_bytes: u64) -> Result<u64> {
        let base = self.base.ok_or(HdaError::RingNotProgrammed)?;
        Ok(base.phys + u64::from(index) * entry_bytes)
    }
}

/// Pointer snapshot used in diagnostics.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RingSnapshot {
    pub corb_wp: u16,
    pub corb_rp: u16,
    pub rirb_wp: u16,
    pub rirb_rp: u16,
    pub entries: u16,
}

impl std::fmt::Display for RingSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "CORB wp={} rp={}, RIRB wp={} rp={}, {} entries",
            self.corb_wp, self.corb_rp, self.rirb_wp, self.rirb_rp, self.entries
        )
    }
}

pub struct RingBufferProtocol {
    regs: Arc<dyn RegisterIo>,
    mem: Arc<dyn DmaMemory>,
    clock: Arc<dyn Clock>,
    status: Arc<StatusAggregator>,
    config: HdaConfig,
    corb: RingState,
    rirb: RingState,
    solicited: Vec<VecDeque<Response>>,
    unsolicited: Vec<VecDeque<Response>>,
}

impl std::fmt::Debug for RingBufferProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBufferProtocol")
            .field("corb", &self.corb)
            .field("rirb", &self.rirb)
            .finish_non_exhaustive()
    }
}

impl RingBufferProtocol {
    pub fn new(platform: &Platform, status: Arc<StatusAggregator>, config: &HdaConfig) -> Self {
        Self {
            regs: Arc::clone(&platform.regs),
            mem: Arc::clone(&platform.mem),
            clock: Arc::clone(&platform.clock),
            status,
            config: config.clone(),
            corb: RingState::new(),
            rirb: RingState::new(),
            solicited: vec![VecDeque::new(); MAX_CODECS],
            unsolicited: vec![VecDeque::new(); MAX_CODECS],
        }
    }

    pub fn capacity(&self) -> u16 {
        self.corb.entries
    }

    /// Largest batch `send_batch` accepts.
    pub fn max_batch(&self) -> usize {
        usize::from(self.corb.entries.saturating_sub(1))
    }

    pub fn corb_write_pointer(&self) -> u16 {
        self.corb.sw_ptr
    }

    pub fn rirb_read_pointer(&self) -> u16 {
        self.rirb.sw_ptr
    }

    fn hw_corb_rp(&self) -> u16 {
        self.regs.read16(HDA_CORBRP) & 0xFF
    }

    fn hw_rirb_wp(&self) -> u16 {
        self.regs.read16(HDA_RIRBWP) & 0xFF
    }

    /// Free CORB slots as seen by the controller right now.
    pub fn free_space(&self) -> u16 {
        ring_free_space(self.corb.entries, self.corb.sw_ptr, self.hw_corb_rp())
    }

    /// Responses written by the controller and not yet popped.
    pub fn responses_available(&self) -> u16 {
        ring_pending(self.rirb.entries, self.hw_rirb_wp(), self.rirb.sw_ptr)
    }

    pub fn snapshot(&self) -> RingSnapshot {
        RingSnapshot {
            corb_wp: self.corb.sw_ptr,
            corb_rp: self.hw_corb_rp(),
            rirb_wp: self.hw_rirb_wp(),
            rirb_rp: self.rirb.sw_ptr,
            entries: self.corb.entries,
        }
    }

    pub fn corb_running(&self) -> bool {
        self.regs.read8(HDA_CORBCTL) & CORBCTL_RUN != 0
    }

    pub fn rirb_running(&self) -> bool {
        self.regs.read8(HDA_RIRBCTL) & RIRBCTL_DMAEN != 0
    }

    pub fn is_running(&self) -> bool {
        self.corb_running() || self.rirb_running()
    }

    /// Program both rings from scratch and start them.
    pub fn setup(&mut self) -> Result<()> {
        self.stop()?;

        let corb_size = self.regs.read8(HDA_CORBSIZE);
        let rirb_size = self.regs.read8(HDA_RIRBSIZE);
        let (corb_sel, corb_entries) = pick_ring_size(corb_size, self.config.ring_entries)
            .ok_or(HdaError::Unsupported("CORB size capability"))?;
        let (rirb_sel, rirb_entries) = pick_ring_size(rirb_size, self.config.ring_entries)
            .ok_or(HdaError::Unsupported("RIRB size capability"))?;
        if corb_entries != rirb_entries {
            tracing::warn!(corb_entries, rirb_entries, "CORB and RIRB sizes differ");
        }

        // Allocate the largest size once; smaller selections reuse the region.
        if self.corb.base.is_none() {
            self.corb.base = Some(
                self.mem
                    .alloc(256 * CORB_ENTRY_BYTES as usize, RING_ALIGN)?,
            );
        }
        if self.rirb.base.is_none() {
            self.rirb.base = Some(
                self.mem
                    .alloc(256 * RIRB_ENTRY_BYTES as usize, RING_ALIGN)?,
            );
        }
        self.corb.entries = corb_entries;
        self.rirb.entries = rirb_entries;

        self.regs
            .write8(HDA_CORBSIZE, (corb_size & !RING_SIZE_SEL_MASK) | corb_sel);
        self.regs
            .write8(HDA_RIRBSIZE, (rirb_size & !RING_SIZE_SEL_MASK) | rirb_sel);

        if let Some(corb) = self.corb.base {
            self.regs.write32(HDA_CORBLBASE, corb.phys as u32);
            self.regs.write32(HDA_CORBUBASE, (corb.phys >> 32) as u32);
        }
        if let Some(rirb) = self.rirb.base {
            self.regs.write32(HDA_RIRBLBASE, rirb.phys as u32);
            self.regs.write32(HDA_RIRBUBASE, (rirb.phys >> 32) as u32);
        }

        self.reset_pointers()?;
        self.regs
            .write16(HDA_RINTCNT, u16::from(self.config.rirb_interrupt_count.max(1)));

        tracing::debug!(
            corb_entries,
            rirb_entries,
            corb_base = format_args!("{:#x}", self.corb.base.map_or(0, |r| r.phys)),
            rirb_base = format_args!("{:#x}", self.rirb.base.map_or(0, |r| r.phys)),
            "command rings programmed"
        );
        self.start()
    }

    fn reset_pointers(&mut self) -> Result<()> {
        let clock = self.clock.as_ref();
        let regs = self.regs.as_ref();
        let timeout = self.config.ring_timeout();
        let interval = self.config.poll_interval();

        regs.write16(HDA_CORBWP, 0);
        regs.write16(HDA_CORBRP, CORBRP_RST);
        // Some controllers clear the pointer without latching the reset bit.
        poll_until(clock, timeout, interval, "CORB read pointer reset", || {
            let rp = regs.read16(HDA_CORBRP);
            rp & CORBRP_RST != 0 || rp == 0
        })?;
        regs.write16(HDA_CORBRP, 0);
        poll_until(clock, timeout, interval, "CORB read pointer reset release", || {
            regs.read16(HDA_CORBRP) & CORBRP_RST == 0
        })?;
        regs.write16(HDA_RIRBWP, RIRBWP_RST);

        self.corb.sw_ptr = 0;
        self.rirb.sw_ptr = 0;
        for queue in self.solicited.iter_mut() {
            queue.clear();
        }
        Ok(())
    }

    /// Start both rings (RIRB first so no response is dropped).
    pub fn start(&mut self) -> Result<()> {
        if self.corb.base.is_none() || self.rirb.base.is_none() {
            return Err(HdaError::RingNotProgrammed);
        }
        let regs = self.regs.as_ref();
        regs.write8(
            HDA_RIRBCTL,
            RIRBCTL_DMAEN | RIRBCTL_RINTCTL | RIRBCTL_OIC,
        );
        regs.write8(HDA_CORBCTL, CORBCTL_RUN | CORBCTL_CMEIE);
        poll_until(
            self.clock.as_ref(),
            self.config.ring_timeout(),
            self.config.poll_interval(),
            "CORB/RIRB DMA start",
            || {
                regs.read8(HDA_CORBCTL) & CORBCTL_RUN != 0
                    && regs.read8(HDA_RIRBCTL) & RIRBCTL_DMAEN != 0
            },
        )?;
        tracing::debug!("command rings running");
        Ok(())
    }

    /// Stop both rings; interrupt enables are left as programmed.
    pub fn stop(&mut self) -> Result<()> {
        self.stop_corb()?;
        self.stop_rirb()
    }

    pub fn stop_corb(&mut self) -> Result<()> {
        let regs = self.regs.as_ref();
        let ctl = regs.read8(HDA_CORBCTL);
        regs.write8(HDA_CORBCTL, ctl & !CORBCTL_RUN);
        poll_until(
            self.clock.as_ref(),
            self.config.ring_timeout(),
            self.config.poll_interval(),
            "CORB DMA stop",
            || regs.read8(HDA_CORBCTL) & CORBCTL_RUN == 0,
        )
    }

    pub fn stop_rirb(&mut self) -> Result<()> {
        let regs = self.regs.as_ref();
        let ctl = regs.read8(HDA_RIRBCTL);
        regs.write8(HDA_RIRBCTL, ctl & !RIRBCTL_DMAEN);
        poll_until(
            self.clock.as_ref(),
            self.config.ring_timeout(),
            self.config.poll_interval(),
            "RIRB DMA stop",
            || regs.read8(HDA_RIRBCTL) & RIRBCTL_DMAEN == 0,
        )
    }

    /// Restart whichever rings were running according to `corb`/`rirb`.
    pub(crate) fn restore(&mut self, corb: bool, rirb: bool) -> Result<()> {
        let regs = self.regs.as_ref();
        if rirb {
            let ctl = regs.read8(HDA_RIRBCTL);
            regs.write8(HDA_RIRBCTL, ctl | RIRBCTL_DMAEN);
        }
        if corb {
            let ctl = regs.read8(HDA_CORBCTL);
            regs.write8(HDA_CORBCTL, ctl | CORBCTL_RUN);
        }
        poll_until(
            self.clock.as_ref(),
            self.config.ring_timeout(),
            self.config.poll_interval(),
            "CORB/RIRB DMA restart",
            || {
                (!corb || regs.read8(HDA_CORBCTL) & CORBCTL_RUN != 0)
                    && (!rirb || regs.read8(HDA_RIRBCTL) & RIRBCTL_DMAEN != 0)
            },
        )
    }

    /// Reset both ring pointers. The rings must be stopped.
    pub fn reset(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(HdaError::misuse(HdaError::RingRunning("pointer reset")));
        }
        self.reset_pointers()
    }

    fn check_corb_fault(&self) -> Result<()> {
        if self
            .status
            .ring_faults()
            .contains(RingStatus::CORB_MEMORY_ERROR)
        {
            return Err(HdaError::CorbMemoryError);
        }
        Ok(())
    }

    fn check_overrun(&self) -> Result<()> {
        if !self
            .status
            .ring_faults()
            .contains(RingStatus::RIRB_OVERRUN)
        {
            return Ok(());
        }
        if self.config.intentional_overrun {
            tracing::warn!("RIRB overrun acknowledged (intentional overrun mode)");
            self.status
                .clear_controller(RingStatus::RIRB_OVERRUN, 0);
            return Ok(());
        }
        tracing::error!(snapshot = %self.snapshot(), "RIRB overrun");
        Err(HdaError::RirbOverrun)
    }

    /// Write-one-clear pending CORB memory error and RIRB overrun.
    pub fn acknowledge_faults(&mut self) {
        let faults = self.status.ring_faults();
        if !faults.is_empty() {
            tracing::warn!(?faults, "acknowledging ring faults");
            self.status.clear_controller(faults, 0);
        }
    }

    /// Queue as many of `verbs` as fit; returns how many were written.
    ///
    /// The controller write pointer is updated once for the whole push.
    pub fn push_verbs(&mut self, verbs: &[Command]) -> Result<usize> {
        self.check_corb_fault()?;
        if self.corb.base.is_none() {
            return Err(HdaError::RingNotProgrammed);
        }
        let free = usize::from(self.free_space());
        let count = verbs.len().min(free);
        if count == 0 {
            return Ok(0);
        }

        let entries = self.corb.entries;
        let mut wp = self.corb.sw_ptr;
        for verb in &verbs[..count] {
            wp = (wp + 1) % entries;
            let addr = self.corb.slot(wp, CORB_ENTRY_BYTES)?;
            self.mem.write_u32(addr, verb.encode());
            tracing::trace!(
                codec = verb.codec,
                nid = verb.nid,
                verb = format_args!("{:#07x}", verb.verb),
                slot = wp,
                "CORB push"
            );
        }
        self.corb.sw_ptr = wp;
        self.regs.write16(HDA_CORBWP, wp);
        // Read back to flush the posted write.
        let _ = self.regs.read16(HDA_CORBWP);
        Ok(count)
    }

    /// Pop up to `max` responses into the per-codec queues; returns how many were popped.
    pub fn pop_responses(&mut self, max: usize) -> Result<usize> {
        self.check_overrun()?;
        if self.rirb.base.is_none() {
            return Err(HdaError::RingNotProgrammed);
        }
        let available = usize::from(self.responses_available());
        let count = available.min(max);
        let entries = self.rirb.entries;
        let mut rp = self.rirb.sw_ptr;
        for _ in 0..count {
            rp = (rp + 1) % entries;
            let addr = self.rirb.slot(rp, RIRB_ENTRY_BYTES)?;
            let response = Response::decode(self.mem.read_u64(addr));
            self.demux(response);
        }
        self.rirb.sw_ptr = rp;
        if count > 0 {
            self.status
                .clear_controller(RingStatus::RESPONSE_READY, 0);
        }
        Ok(count)
    }

    fn demux(&mut self, response: Response) {
        let codec = usize::from(response.codec);
        if codec >= MAX_CODECS {
            tracing::warn!(codec, payload = response.payload, "response from invalid codec address dropped");
            return;
        }
        tracing::trace!(
            codec,
            payload = format_args!("{:#010x}", response.payload),
            unsolicited = response.unsolicited,
            "RIRB pop"
        );
        if response.unsolicited {
            self.unsolicited[codec].push_back(response);
        } else {
            self.solicited[codec].push_back(response);
        }
    }

    /// Drain unsolicited responses received from `codec`.
    pub fn take_unsolicited(&mut self, codec: u8) -> Vec<Response> {
        self.unsolicited
            .get_mut(usize::from(codec))
            .map(|queue| queue.drain(..).collect())
            .unwrap_or_default()
    }

    /// Drain solicited responses from `codec` that no transaction claimed, such as an answer
    /// that arrived after its command timed out. New transactions are refused while any are
    /// queued.
    pub fn take_solicited(&mut self, codec: u8) -> Vec<Response> {
        self.solicited
            .get_mut(usize::from(codec))
            .map(|queue| queue.drain(..).collect())
            .unwrap_or_default()
    }

    fn solicited_total(&self) -> usize {
        self.solicited.iter().map(VecDeque::len).sum()
    }

    /// Both rings are empty of pending traffic.
    pub fn is_idle(&self) -> bool {
        self.free_space() == self.corb.entries
            && self.responses_available() == 0
            && self.solicited_total() == 0
    }

    fn ensure_idle(&mut self) -> Result<()> {
        if self.corb.base.is_none() {
            return Err(HdaError::RingNotProgrammed);
        }
        // A fetch fault leaves the failed verb queued; report the fault, not the backlog.
        self.check_corb_fault()?;
        // Unsolicited responses may be waiting in the RIRB; move them to their queues.
        self.pop_responses(usize::MAX)?;
        if self.is_idle() {
            return Ok(());
        }
        Err(HdaError::misuse(HdaError::ProtocolBusy {
            detail: format!(
                "{}, {} queued solicited responses",
                self.snapshot(),
                self.solicited_total()
            ),
        }))
    }

    /// Pop until `expected` solicited responses are queued or `timeout` elapses; returns how
    /// many arrived.
    fn wait_solicited(&mut self, expected: usize, timeout: Duration) -> Result<usize> {
        let start = self.clock.now();
        loop {
            self.pop_responses(usize::MAX)?;
            let received = self.solicited_total();
            if received >= expected {
                return Ok(received);
            }
            if self.clock.now().saturating_sub(start) >= timeout {
                return Ok(received);
            }
            self.clock.sleep(self.config.poll_interval());
        }
    }

    fn drain_solicited(&mut self) {
        for queue in self.solicited.iter_mut() {
            queue.clear();
        }
    }

    /// Send one verb and wait (up to one link frame by default) for its response payload.
    pub fn send_single(&mut self, cmd: Command) -> Result<u32> {
        self.ensure_idle()?;
        let pushed = self.push_verbs(std::slice::from_ref(&cmd))?;
        if pushed != 1 {
            return Err(HdaError::misuse(HdaError::ShortPush {
                requested: 1,
                pushed,
            }));
        }

        let timeout = self.config.response_timeout();
        let received = self.wait_solicited(1, timeout)?;
        if received == 0 {
            return Err(HdaError::Timeout {
                op: "single verb response",
                timeout,
                detail: format!("codec {} node {:#04x}: {}", cmd.codec, cmd.nid, self.snapshot()),
            });
        }

        let codec = usize::from(cmd.codec);
        match self.solicited.get_mut(codec).and_then(VecDeque::pop_front) {
            Some(response) if received == 1 => Ok(response.payload),
            Some(_) => {
                self.drain_solicited();
                Err(HdaError::ResponseCountMismatch {
                    expected: 1,
                    received,
                })
            }
            None => {
                let from = self
                    .solicited
                    .iter()
                    .position(|queue| !queue.is_empty())
                    .unwrap_or(0) as u8;
                self.drain_solicited();
                Err(HdaError::ResponseAddressMismatch {
                    expected: cmd.codec,
                    received: from,
                })
            }
        }
    }

    /// Send a batch of verbs and return their response payloads in command order.
    pub fn send_batch(&mut self, cmds: &[Command]) -> Result<Vec<u32>> {
        if cmds.is_empty() {
            return Ok(Vec::new());
        }
        self.ensure_idle()?;
        if cmds.len() > self.max_batch() {
            return Err(HdaError::misuse(HdaError::BatchTooLarge {
                len: cmds.len(),
                capacity: self.max_batch(),
            }));
        }
        let pushed = self.push_verbs(cmds)?;
        if pushed != cmds.len() {
            return Err(HdaError::misuse(HdaError::ShortPush {
                requested: cmds.len(),
                pushed,
            }));
        }

        let timeout = self.config.batch_timeout(cmds.len());
        let received = self.wait_solicited(cmds.len(), timeout)?;
        if received != cmds.len() {
            tracing::error!(
                expected = cmds.len(),
                received,
                snapshot = %self.snapshot(),
                "batch response count mismatch"
            );
            self.drain_solicited();
            return Err(HdaError::ResponseCountMismatch {
                expected: cmds.len(),
                received,
            });
        }

        let mut payloads = Vec::with_capacity(cmds.len());
        for cmd in cmds {
            let Some(response) = self
                .solicited
                .get_mut(usize::from(cmd.codec))
                .and_then(VecDeque::pop_front)
            else {
                let from = self
                    .solicited
                    .iter()
                    .position(|queue| !queue.is_empty())
                    .unwrap_or(0) as u8;
                self.drain_solicited();
                return Err(HdaError::ResponseAddressMismatch {
                    expected: cmd.codec,
                    received: from,
                });
            };
            payloads.push(response.payload);
        }
        Ok(payloads)
    }

    /// Push a verb the codec does not answer, wait for the CORB to drain, then wait `settle`.
    /// A response that arrives anyway is logged and dropped.
    pub fn post_unanswered(&mut self, cmd: Command, settle: Duration) -> Result<()> {
        self.ensure_idle()?;
        let pushed = self.push_verbs(std::slice::from_ref(&cmd))?;
        if pushed != 1 {
            return Err(HdaError::misuse(HdaError::ShortPush {
                requested: 1,
                pushed,
            }));
        }
        let capacity = self.corb.entries;
        let clock = Arc::clone(&self.clock);
        poll_until(
            clock.as_ref(),
            self.config.ring_timeout(),
            self.config.poll_interval(),
            "CORB drain",
            || self.free_space() == capacity,
        )?;
        clock.sleep(settle);
        self.pop_responses(usize::MAX)?;
        let stray = self.solicited_total();
        if stray > 0 {
            tracing::warn!(
                codec = cmd.codec,
                nid = cmd.nid,
                stray,
                "codec answered a verb expected to be silent"
            );
            self.drain_solicited();
        }
        Ok(())
    }

    /// Send any number of verbs, split into batches that fit the CORB.
    pub fn send_chunked(&mut self, cmds: &[Command]) -> Result<Vec<u32>> {
        let chunk = self.max_batch().max(1);
        let mut payloads = Vec::with_capacity(cmds.len());
        for part in cmds.chunks(chunk) {
            payloads.extend(self.send_batch(part)?);
        }
        Ok(payloads)
    }
}
