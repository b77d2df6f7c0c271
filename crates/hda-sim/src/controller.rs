//! Register-level model of an HDA controller with codecs on its link.
//!
//! Register writes take effect immediately; everything the link or a DMA engine does (command
//! dispatch, response delivery, stream position) happens in [`SimController::advance`], one
//! command per link frame.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use hda_host::config::LINK_FRAME;
use hda_host::regs::*;
use hda_host::verb::Command;
use hda_host::{DmaMemory, NodeId, Response};

use crate::codec::SimCodec;
use crate::corb_rirb::{Corb, Rirb};
use crate::regs::{split_access, RegAccess, SimReg};
use crate::stream::{SimStream, StreamFaults};

/// Static properties of the simulated controller.
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub caps: GlobalCaps,
    pub corb_size_caps: u8,
    pub rirb_size_caps: u8,
    /// CORBRP reads back bit 15 after a pointer reset until software clears it.
    pub latch_corbrp_reset: bool,
    /// The immediate command is launched by writing ICB rather than by writing IC.
    pub immediate_busy_kick: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            caps: GlobalCaps {
                output_streams: 4,
                input_streams: 4,
                bidir_streams: 0,
                sdo_lines: 1,
                addr64: true,
            },
            corb_size_caps: RING_SIZE_CAP_2 | RING_SIZE_CAP_16 | RING_SIZE_CAP_256,
            rirb_size_caps: RING_SIZE_CAP_2 | RING_SIZE_CAP_16 | RING_SIZE_CAP_256,
            latch_corbrp_reset: false,
            immediate_busy_kick: false,
        }
    }
}

/// What the link carries in one frame.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum LinkWork {
    Corb,
    Immediate,
    Unsolicited,
}

pub struct SimController {
    config: SimConfig,
    mem: Arc<dyn DmaMemory>,
    now: Duration,

    gctl: u32,
    wakeen: u16,
    statests: u16,
    gsts: u16,
    intctl: u32,
    ssync: u32,
    dplbase: u32,
    dpubase: u32,

    corb: Corb,
    rirb: Rirb,

    ic: u32,
    ir: u32,
    ics: u16,
    immediate_queued: bool,

    streams: Vec<SimStream>,
    codecs: BTreeMap<u8, SimCodec>,
    unsolicited: VecDeque<Response>,

    corb_fetch_error: bool,
    /// Codec address reported with the next solicited response.
    misaddressed_response: Option<u8>,
    forced_intsts: Option<u32>,
    commands: u64,
}

impl std::fmt::Debug for SimController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimController")
            .field("now", &self.now)
            .field("gctl", &self.gctl)
            .field("codecs", &self.codecs.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl SimController {
    /// A controller held in reset, with `codecs` attached at their SDIN addresses.
    pub fn new(config: SimConfig, mem: Arc<dyn DmaMemory>, codecs: BTreeMap<u8, SimCodec>) -> Self {
        let engines = config.caps.total_streams().min(MAX_ENGINES);
        Self {
            corb: Corb::new(config.corb_size_caps, config.latch_corbrp_reset),
            rirb: Rirb::new(config.rirb_size_caps),
            streams: (0..engines).map(SimStream::new).collect(),
            config,
            mem,
            now: Duration::ZERO,
            gctl: 0,
            wakeen: 0,
            statests: 0,
            gsts: 0,
            intctl: 0,
            ssync: 0,
            dplbase: 0,
            dpubase: 0,
            ic: 0,
            ir: 0,
            ics: 0,
            immediate_queued: false,
            codecs: codecs
                .into_iter()
                .filter(|(addr, _)| usize::from(*addr) < MAX_CODECS)
                .collect(),
            unsolicited: VecDeque::new(),
            corb_fetch_error: false,
            misaddressed_response: None,
            forced_intsts: None,
            commands: 0,
        }
    }

    pub fn now(&self) -> Duration {
        self.now
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn codec(&self, address: u8) -> Option<&SimCodec> {
        self.codecs.get(&address)
    }

    pub fn stream(&self, engine: usize) -> Option<&SimStream> {
        self.streams.get(engine)
    }

    /// Commands fetched from the CORB since power-on.
    pub fn commands_processed(&self) -> u64 {
        self.commands
    }

    pub fn corb(&self) -> &Corb {
        &self.corb
    }

    pub fn rirb(&self) -> &Rirb {
        &self.rirb
    }

    fn present_codecs(&self) -> u16 {
        self.codecs
            .keys()
            .fold(0, |mask, &addr| mask | (1 << addr))
    }

    fn in_reset(&self) -> bool {
        self.gctl & GCTL_CRST == 0
    }

    /// Controller reset: every register and codec returns to its power-on state.
    fn reset_link(&mut self) {
        self.gctl = 0;
        self.wakeen = 0;
        self.statests = 0;
        self.gsts = 0;
        self.intctl = 0;
        self.ssync = 0;
        self.dplbase = 0;
        self.dpubase = 0;
        self.corb.reset();
        self.rirb.reset();
        self.ic = 0;
        self.ir = 0;
        self.ics = 0;
        self.immediate_queued = false;
        for stream in &mut self.streams {
            stream.reset();
        }
        for codec in self.codecs.values_mut() {
            codec.reset();
        }
        self.unsolicited.clear();
        tracing::debug!("controller reset");
    }

    /// INTSTS as derived from the sub-status registers and their enables.
    pub fn derived_intsts(&self) -> u32 {
        let cis = self.corb.interrupt_pending()
            || self.rirb.interrupt_pending()
            || self.statests & self.wakeen & STATESTS_MASK != 0;
        let mut intsts = if cis { INTSTS_CIS } else { 0 };
        for (i, stream) in self.streams.iter().enumerate() {
            if stream.interrupt_pending() {
                intsts |= 1 << i;
            }
        }
        if intsts != 0 {
            intsts |= INTSTS_GIS;
        }
        intsts
    }

    fn intsts(&self) -> u32 {
        self.forced_intsts.unwrap_or_else(|| self.derived_intsts())
    }

    /// Level of the controller's interrupt line.
    pub fn irq_line(&self) -> bool {
        let intsts = self.intsts();
        if self.intctl & INTCTL_GIE == 0 {
            return false;
        }
        (intsts & INTSTS_CIS != 0 && self.intctl & INTCTL_CIE != 0)
            || intsts & self.intctl & INTCTL_SIE_MASK != 0
    }

    fn read_reg(&self, reg: SimReg) -> u32 {
        match reg {
            SimReg::Gcap => u32::from(self.config.caps.encode()),
            SimReg::Vmin => 0x00,
            SimReg::Vmaj => 0x01,
            SimReg::Outpay => 0x3C,
            SimReg::Inpay => 0x1D,
            SimReg::Gctl => self.gctl,
            SimReg::Wakeen => u32::from(self.wakeen),
            SimReg::Statests => u32::from(self.statests),
            SimReg::Gsts => u32::from(self.gsts),
            SimReg::Intctl => self.intctl,
            SimReg::Intsts => self.intsts(),
            // 24 MHz wall clock.
            SimReg::Walclk => (self.now.as_nanos() * 24 / 1000) as u32,
            SimReg::Ssync => self.ssync,
            SimReg::Corb(reg) => self.corb.read(reg),
            SimReg::Rirb(reg) => self.rirb.read(reg),
            SimReg::Ic => self.ic,
            SimReg::Ir => self.ir,
            SimReg::Ics => u32::from(self.ics),
            SimReg::Dplbase => self.dplbase,
            SimReg::Dpubase => self.dpubase,
            SimReg::Stream(i, reg) => self.streams.get(i).map_or(0, |s| s.read(reg)),
        }
    }

    pub fn mmio_read(&self, offset: u32, size: u32) -> u32 {
        let engines = self.streams.len();
        (0..size.min(4)).fold(0, |out, i| {
            let Some(decoded) = SimReg::decode_byte(offset + i, engines) else {
                return out;
            };
            let shift = (offset + i - decoded.start) * 8;
            let byte = (self.read_reg(decoded.reg) >> shift) & 0xFF;
            out | (byte << (i * 8))
        })
    }

    pub fn mmio_write(&mut self, offset: u32, size: u32, value: u32) {
        for access in split_access(offset, size.min(4), value, self.streams.len()) {
            self.write_reg(&access);
        }
    }

    fn write_reg(&mut self, access: &RegAccess) {
        if let SimReg::Gctl = access.reg {
            self.write_gctl(access);
            return;
        }
        if self.in_reset() {
            tracing::trace!(reg = ?access.reg, "write ignored while in controller reset");
            return;
        }
        let merged = access.merge(self.read_reg(access.reg));
        match access.reg {
            SimReg::Gcap
            | SimReg::Vmin
            | SimReg::Vmaj
            | SimReg::Outpay
            | SimReg::Inpay
            | SimReg::Intsts
            | SimReg::Walclk
            | SimReg::Ir => {}
            SimReg::Gctl => {}
            SimReg::Wakeen => self.wakeen = merged as u16 & STATESTS_MASK,
            SimReg::Statests => self.statests &= !(access.value as u16),
            SimReg::Gsts => self.gsts &= !(access.value as u16),
            SimReg::Intctl => self.intctl = merged,
            SimReg::Ssync => self.ssync = merged,
            SimReg::Corb(reg) => self.corb.write(reg, access),
            SimReg::Rirb(reg) => self.rirb.write(reg, access),
            SimReg::Ic => {
                self.ic = merged;
                if !self.config.immediate_busy_kick && self.ics & ICS_ICB == 0 {
                    self.launch_immediate();
                }
            }
            SimReg::Ics => self.write_ics(access),
            SimReg::Dplbase => self.dplbase = merged,
            SimReg::Dpubase => self.dpubase = merged,
            SimReg::Stream(i, reg) => {
                let now = self.now;
                if let Some(stream) = self.streams.get_mut(i) {
                    stream.write(reg, access, now, self.mem.as_ref());
                }
            }
        }
    }

    fn write_gctl(&mut self, access: &RegAccess) {
        let old = self.gctl;
        let new = access.merge(old) & (GCTL_CRST | GCTL_FCNTRL | GCTL_UNSOL);
        if old & GCTL_CRST != 0 && new & GCTL_CRST == 0 {
            self.reset_link();
        } else if old & GCTL_CRST == 0 && new & GCTL_CRST != 0 {
            // Codecs signal presence as soon as the link leaves reset.
            self.statests |= self.present_codecs();
            tracing::debug!(present = format_args!("{:#06x}", self.statests), "link out of reset");
        }
        self.gctl = new;
    }

    fn write_ics(&mut self, access: &RegAccess) {
        let irv = u32::from(ICS_IRV);
        if access.sets(irv) {
            self.ics &= !ICS_IRV;
        }
        if !self.config.immediate_busy_kick || access.mask & u32::from(ICS_ICB) == 0 {
            return;
        }
        let busy = self.ics & ICS_ICB != 0;
        if access.value & u32::from(ICS_ICB) != 0 {
            if !busy {
                self.launch_immediate();
            }
        } else if busy {
            self.ics &= !ICS_ICB;
            self.immediate_queued = false;
            tracing::trace!("immediate command aborted");
        }
    }

    fn launch_immediate(&mut self) {
        self.ics |= ICS_ICB;
        self.immediate_queued = true;
    }

    /// Run the link and the DMA engines forward by `dt`.
    pub fn advance(&mut self, dt: Duration) {
        let before = self.now;
        self.now += dt;
        if self.in_reset() {
            return;
        }

        let frame = LINK_FRAME.as_nanos();
        let frames = self.now.as_nanos() / frame - before.as_nanos() / frame;
        let mut responded = false;
        for _ in 0..frames {
            let Some(work) = self.next_work() else {
                break;
            };
            responded |= match work {
                LinkWork::Corb => self.dispatch_corb(),
                LinkWork::Immediate => {
                    self.dispatch_immediate();
                    false
                }
                LinkWork::Unsolicited => self.deliver_unsolicited(),
            };
        }
        if responded {
            self.rirb.flush();
        }

        let now = self.now;
        for stream in &mut self.streams {
            stream.advance(now);
        }
        self.update_position_buffer();
    }

    fn next_work(&self) -> Option<LinkWork> {
        let rings = self.corb.is_running() && self.rirb.is_running();
        if rings && self.corb.has_pending() {
            Some(LinkWork::Corb)
        } else if self.immediate_queued && !self.corb.is_running() {
            Some(LinkWork::Immediate)
        } else if self.rirb.is_running() && !self.unsolicited.is_empty() {
            Some(LinkWork::Unsolicited)
        } else {
            None
        }
    }

    fn execute(&mut self, cmd: Command) -> Option<u32> {
        let Some(codec) = self.codecs.get_mut(&cmd.codec) else {
            tracing::trace!(codec = cmd.codec, "command to absent codec");
            return None;
        };
        codec.execute(cmd.nid, cmd.verb)
    }

    fn dispatch_corb(&mut self) -> bool {
        if std::mem::take(&mut self.corb_fetch_error) {
            self.corb.raise_memory_error();
            return false;
        }
        let Some(word) = self.corb.fetch(self.mem.as_ref()) else {
            return false;
        };
        self.commands += 1;
        let cmd = Command::decode(word);
        let Some(payload) = self.execute(cmd) else {
            return false;
        };
        let response = Response {
            payload,
            codec: self.response_address(cmd.codec),
            unsolicited: false,
        };
        self.rirb.push(self.mem.as_ref(), response.encode())
    }

    fn dispatch_immediate(&mut self) {
        self.immediate_queued = false;
        let cmd = Command::decode(self.ic);
        // Without an answer the busy bit stays set until software gives up.
        let Some(payload) = self.execute(cmd) else {
            return;
        };
        self.ir = payload;
        let codec = self.response_address(cmd.codec);
        self.ics &= !(ICS_ICB | ICS_IRRUNSOL | ICS_IRRADD_MASK);
        self.ics |= ICS_IRV | ((u16::from(codec) << ICS_IRRADD_SHIFT) & ICS_IRRADD_MASK);
    }

    fn response_address(&mut self, codec: u8) -> u8 {
        match self.misaddressed_response.take() {
            Some(wrong) => {
                tracing::warn!(codec, wrong, "response sent with the wrong codec address");
                wrong
            }
            None => codec,
        }
    }

    fn deliver_unsolicited(&mut self) -> bool {
        let Some(response) = self.unsolicited.pop_front() else {
            return false;
        };
        if self.gctl & GCTL_UNSOL == 0 {
            tracing::trace!(codec = response.codec, "unsolicited response dropped");
            return false;
        }
        self.rirb.push(self.mem.as_ref(), response.encode())
    }

    fn update_position_buffer(&self) {
        if self.dplbase & DPLBASE_ENABLE == 0 {
            return;
        }
        let base = (u64::from(self.dpubase) << 32) | u64::from(self.dplbase & !0x7F);
        for (i, stream) in self.streams.iter().enumerate() {
            if let Some(addr) = base.checked_add(i as u64 * 8) {
                self.mem.write_u32(addr, stream.lpib());
            }
        }
    }

    /// Jack event on `nid`: queues an unsolicited response if the node has them enabled.
    pub fn trigger_unsolicited(&mut self, codec: u8, nid: NodeId, subtag: u8) -> bool {
        let Some(payload) = self
            .codecs
            .get(&codec)
            .and_then(|c| c.unsolicited_payload(nid, subtag))
        else {
            return false;
        };
        self.unsolicited.push_back(Response {
            payload,
            codec,
            unsolicited: true,
        });
        true
    }

    /// Codec wake event: sets the codec's STATESTS bit.
    pub fn signal_state_change(&mut self, codec: u8) {
        if usize::from(codec) < MAX_CODECS {
            self.statests |= 1 << codec;
        }
    }

    /// The next CORB fetch fails with a memory error.
    pub fn fail_next_corb_fetch(&mut self) {
        self.corb_fetch_error = true;
    }

    pub fn inject_rirb_overrun(&mut self) {
        self.rirb.raise_overrun();
    }

    /// The next solicited response, on the rings or the immediate channel, reports `codec`
    /// as its source.
    pub fn misaddress_next_response(&mut self, codec: u8) {
        self.misaddressed_response = Some(codec & 0xF);
    }

    /// RIRB DMA keeps running when software tries to stop it.
    pub fn set_rirb_dma_stuck(&mut self, stuck: bool) {
        self.rirb.stuck_dma = stuck;
    }

    /// Raise buffer completion on `engine` without a boundary having been crossed.
    pub fn inject_buffer_complete(&mut self, engine: usize) {
        if let Some(stream) = self.streams.get_mut(engine) {
            stream.raise_buffer_complete();
        }
    }

    pub fn inject_fifo_error(&mut self, engine: usize) {
        if let Some(stream) = self.streams.get_mut(engine) {
            stream.raise_fifo_error();
        }
    }

    pub fn stream_faults_mut(&mut self, engine: usize) -> Option<&mut StreamFaults> {
        self.streams.get_mut(engine).map(|s| &mut s.faults)
    }

    /// Make INTSTS read `value` regardless of the sub-status registers.
    pub fn force_intsts(&mut self, value: Option<u32>) {
        self.forced_intsts = value;
    }
}

#[cfg(test)]
mod tests {
    use hda_host::verb::{Parameter, ROOT_NID};

    use super::*;
    use crate::memory::{GuestMemory, GUEST_MEMORY_BASE};

    fn controller(config: SimConfig) -> SimController {
        let mem = Arc::new(GuestMemory::new(0x4000));
        let codecs = BTreeMap::from([(0, SimCodec::reference())]);
        let mut hda = SimController::new(config, mem, codecs);
        hda.mmio_write(HDA_GCTL, 4, GCTL_CRST);
        hda
    }

    #[test]
    fn gcap_vmin_vmaj_read_as_one_dword() {
        let hda = controller(SimConfig::default());
        let gcap = hda.mmio_read(HDA_GCAP, 2);
        assert_eq!(gcap, 0x4401);
        assert_eq!(hda.mmio_read(HDA_GCAP, 4), gcap | (1 << 24));
    }

    #[test]
    fn leaving_reset_reports_present_codecs() {
        let mut hda = controller(SimConfig::default());
        assert_eq!(hda.mmio_read(HDA_STATESTS, 2), 0x1);
        hda.mmio_write(HDA_STATESTS, 2, 0x1);
        assert_eq!(hda.mmio_read(HDA_STATESTS, 2), 0);

        hda.mmio_write(HDA_INTCTL, 4, INTCTL_GIE);
        hda.mmio_write(HDA_GCTL, 4, 0);
        assert_eq!(hda.mmio_read(HDA_INTCTL, 4), 0);
        hda.mmio_write(HDA_INTCTL, 4, INTCTL_GIE);
        assert_eq!(hda.mmio_read(HDA_INTCTL, 4), 0, "writes ignored in reset");
    }

    #[test]
    fn immediate_command_completes_on_next_frame() {
        let mut hda = controller(SimConfig::default());
        let cmd = Command::get_parameter(0, ROOT_NID, Parameter::VendorId);
        hda.mmio_write(HDA_IC, 4, cmd.encode());
        assert_ne!(hda.mmio_read(HDA_ICS, 2) as u16 & ICS_ICB, 0);
        hda.advance(LINK_FRAME);
        let ics = hda.mmio_read(HDA_ICS, 2) as u16;
        assert_eq!(ics & (ICS_ICB | ICS_IRV), ICS_IRV);
        assert_eq!(hda.mmio_read(HDA_IR, 4), 0x10EC_0888);
    }

    #[test]
    fn busy_kick_launches_on_icb_and_aborts_on_clear() {
        let mut hda = controller(SimConfig {
            immediate_busy_kick: true,
            ..SimConfig::default()
        });
        let absent = Command::get_parameter(3, ROOT_NID, Parameter::VendorId);
        hda.mmio_write(HDA_IC, 4, absent.encode());
        assert_eq!(hda.mmio_read(HDA_ICS, 2) as u16 & ICS_ICB, 0);
        hda.mmio_write(HDA_ICS, 2, u32::from(ICS_ICB));
        hda.advance(LINK_FRAME * 4);
        assert_ne!(hda.mmio_read(HDA_ICS, 2) as u16 & ICS_ICB, 0);
        hda.mmio_write(HDA_ICS, 2, 0);
        assert_eq!(hda.mmio_read(HDA_ICS, 2) as u16 & ICS_ICB, 0);
    }

    #[test]
    fn corb_commands_are_paced_one_per_frame() {
        let mut hda = controller(SimConfig::default());
        let corb = GUEST_MEMORY_BASE;
        let rirb = GUEST_MEMORY_BASE + 0x400;
        hda.mmio_write(HDA_CORBLBASE, 4, corb as u32);
        hda.mmio_write(HDA_RIRBLBASE, 4, rirb as u32);
        hda.mmio_write(HDA_CORBSIZE, 1, 2);
        hda.mmio_write(HDA_RIRBSIZE, 1, 2);
        for slot in 1..=3u64 {
            let cmd = Command::get_parameter(0, ROOT_NID, Parameter::VendorId);
            hda.mem.write_u32(corb + slot * 4, cmd.encode());
        }
        hda.mmio_write(HDA_CORBWP, 2, 3);
        hda.mmio_write(HDA_RIRBCTL, 1, u32::from(RIRBCTL_DMAEN | RIRBCTL_RINTCTL));
        hda.mmio_write(HDA_CORBCTL, 1, u32::from(CORBCTL_RUN));

        hda.advance(LINK_FRAME * 2);
        assert_eq!(hda.mmio_read(HDA_CORBRP, 2), 2);
        assert_eq!(hda.mmio_read(HDA_RIRBWP, 2), 2);
        assert_eq!(hda.mem.read_u64(rirb + 8), 0x10EC_0888);
        assert_ne!(hda.derived_intsts() & INTSTS_CIS, 0);

        hda.advance(LINK_FRAME * 2);
        assert_eq!(hda.mmio_read(HDA_RIRBWP, 2), 3);
        assert_eq!(hda.commands_processed(), 3);
    }

    #[test]
    fn forced_intsts_overrides_derived_value() {
        let mut hda = controller(SimConfig::default());
        assert_eq!(hda.mmio_read(HDA_INTSTS, 4), 0);
        hda.force_intsts(Some(INTSTS_GIS | 1));
        assert_eq!(hda.mmio_read(HDA_INTSTS, 4), INTSTS_GIS | 1);
        assert_eq!(hda.derived_intsts(), 0);
    }
}
