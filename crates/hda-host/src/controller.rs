//! The controller aggregate: command rings, codecs, DMA engines and streams behind one owner.

use std::sync::Arc;

use crate::codec::{Codec, Node};
use crate::config::{HdaConfig, StatusMode};
use crate::dma::{engine_layout, DmaEngine};
use crate::error::{HdaError, Resource, Result};
use crate::format::StreamFormat;
use crate::immediate::ImmediateCommandChannel;
use crate::platform::{poll_until, Platform};
use crate::quirks::ControllerQuirks;
use crate::regs::*;
use crate::ring::RingBufferProtocol;
use crate::route::{Owner, Route, RouteDirection};
use crate::status::{ControllerStatus, InterruptHandler, RingStatus, StatusAggregator, StreamStatus};
use crate::stream::StreamCoordinator;
use crate::verb::{Command, NodeId, Response, UNSOL_ENABLE, UNSOL_TAG_MASK, VERB_SET_UNSOLICITED_ENABLE};

/// PCI identity of the controller function, used for quirk lookup.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct PciId {
    pub vendor: u16,
    pub device: u16,
}

/// A route found by [`Controller::find_route`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
    /// Index in the codec's route table.
    pub index: usize,
    pub route: Route,
}

pub struct Controller {
    pub(crate) platform: Platform,
    pub(crate) config: HdaConfig,
    caps: GlobalCaps,
    quirks: ControllerQuirks,
    pub(crate) status: Arc<StatusAggregator>,
    pub(crate) rings: RingBufferProtocol,
    immediate: ImmediateCommandChannel,
    pub(crate) codecs: Vec<Option<Codec>>,
    pub(crate) streams: StreamCoordinator,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("caps", &self.caps)
            .field("quirks", &self.quirks)
            .field("rings", &self.rings)
            .field(
                "codecs",
                &self.codecs().map(Codec::address).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

fn controller_reset(platform: &Platform, config: &HdaConfig, enter: bool) -> Result<()> {
    let regs = platform.regs.as_ref();
    let gctl = regs.read32(HDA_GCTL);
    let (value, op) = if enter {
        (gctl & !GCTL_CRST, "controller reset entry")
    } else {
        (gctl | GCTL_CRST, "controller reset exit")
    };
    regs.write32(HDA_GCTL, value);
    poll_until(
        platform.clock.as_ref(),
        config.controller_reset_timeout(),
        config.poll_interval(),
        op,
        || (regs.read32(HDA_GCTL) & GCTL_CRST == 0) == enter,
    )
}

impl Controller {
    /// Bring the controller out of reset, start the command rings and discover every codec
    /// that announced itself in STATESTS.
    pub fn attach(platform: Platform, config: HdaConfig, pci: PciId) -> Result<Self> {
        config.validate()?;
        let quirks = ControllerQuirks::lookup(pci.vendor, pci.device);
        let regs = Arc::clone(&platform.regs);

        regs.write8(HDA_CORBCTL, 0);
        regs.write8(HDA_RIRBCTL, 0);
        controller_reset(&platform, &config, true)?;
        controller_reset(&platform, &config, false)?;
        // Codecs need time after the link leaves reset before they request an address.
        platform.clock.sleep(config.codec_wake_delay());

        let caps = GlobalCaps::decode(regs.read16(HDA_GCAP));
        let layout = engine_layout(&caps);
        tracing::debug!(
            vmaj = regs.read8(HDA_VMAJ),
            vmin = regs.read8(HDA_VMIN),
            inputs = caps.input_streams,
            outputs = caps.output_streams,
            bidir = caps.bidir_streams,
            busy_kick = quirks.immediate_busy_kick,
            "controller out of reset"
        );

        let status = Arc::new(StatusAggregator::new(
            config.status_mode,
            Arc::clone(&regs),
            layout.len(),
        ));
        let mut rings = RingBufferProtocol::new(&platform, Arc::clone(&status), &config);
        rings.setup()?;
        regs.write32(HDA_GCTL, regs.read32(HDA_GCTL) | GCTL_UNSOL);

        let present = regs.read16(HDA_STATESTS) & STATESTS_MASK;
        status.clear_controller(RingStatus::empty(), present);

        let intctl = match config.status_mode {
            StatusMode::Poll => 0,
            StatusMode::Interrupt => {
                let streams = (1u32 << layout.len()).wrapping_sub(1) & INTCTL_SIE_MASK;
                INTCTL_GIE | INTCTL_CIE | streams
            }
        };
        regs.write32(HDA_INTCTL, intctl);

        let mut codecs: Vec<Option<Codec>> = (0..MAX_CODECS).map(|_| None).collect();
        for address in 0..MAX_CODECS as u8 {
            if present & (1 << address) == 0 {
                continue;
            }
            let codec = Codec::discover(address, &mut rings, config.silent_reset_delay())?;
            tracing::debug!(
                codec = address,
                vendor = format_args!("{:#010x}", codec.vendor_id()),
                "codec discovered"
            );
            codecs[usize::from(address)] = Some(codec);
        }
        if codecs.iter().all(Option::is_none) {
            tracing::warn!("no codec answered on the link");
        }

        let engines = layout
            .into_iter()
            .enumerate()
            .map(|(index, kind)| {
                DmaEngine::new(
                    index,
                    kind,
                    Arc::clone(&regs),
                    Arc::clone(&platform.clock),
                    config.engine_timeout(),
                    config.poll_interval(),
                )
            })
            .collect();

        let immediate = ImmediateCommandChannel::new(
            Arc::clone(&regs),
            Arc::clone(&platform.clock),
            config.immediate_timeout(),
            config.poll_interval(),
            quirks.immediate_busy_kick,
        );

        Ok(Self {
            platform,
            config,
            caps,
            quirks,
            status,
            rings,
            immediate,
            codecs,
            streams: StreamCoordinator::new(engines),
        })
    }

    /// Release every stream, stop the rings and put the controller back into reset.
    pub fn detach(mut self) -> Result<()> {
        let numbers: Vec<u8> = self.streams.streams().map(|s| s.number()).collect();
        for number in numbers {
            self.release_stream(number)?;
        }
        self.platform.regs.write32(HDA_INTCTL, 0);
        self.rings.stop()?;
        controller_reset(&self.platform, &self.config, true)?;
        tracing::debug!("controller detached");
        Ok(())
    }

    pub fn caps(&self) -> GlobalCaps {
        self.caps
    }

    pub fn quirks(&self) -> ControllerQuirks {
        self.quirks
    }

    pub fn config(&self) -> &HdaConfig {
        &self.config
    }

    pub fn interrupt_handler(&self) -> InterruptHandler {
        self.status.interrupt_handler()
    }

    pub fn rings(&self) -> &RingBufferProtocol {
        &self.rings
    }

    pub fn rings_mut(&mut self) -> &mut RingBufferProtocol {
        &mut self.rings
    }

    pub fn engines(&self) -> &[DmaEngine] {
        self.streams.engines()
    }

    pub fn codec(&self, address: u8) -> Option<&Codec> {
        self.codecs.get(usize::from(address)).and_then(Option::as_ref)
    }

    pub(crate) fn codec_mut(&mut self, address: u8) -> Result<&mut Codec> {
        self.codecs
            .get_mut(usize::from(address))
            .and_then(Option::as_mut)
            .ok_or(HdaError::NoSuchCodec(address))
    }

    pub fn codecs(&self) -> impl Iterator<Item = &Codec> {
        self.codecs.iter().flatten()
    }

    pub fn list_nodes(&self, address: u8) -> Result<&[Node]> {
        self.codec(address)
            .map(Codec::nodes)
            .ok_or(HdaError::NoSuchCodec(address))
    }

    pub fn find_route(
        &mut self,
        codec: u8,
        direction: RouteDirection,
        format: &StreamFormat,
        pin: Option<NodeId>,
        reserve: Option<Owner>,
    ) -> Result<RouteMatch> {
        let codec = self.codec_mut(codec)?;
        let index = codec.find_route(direction, format, pin, reserve)?;
        let route = codec
            .route(index)
            .cloned()
            .ok_or(HdaError::ResourceExhausted(Resource::Route))?;
        Ok(RouteMatch { index, route })
    }

    pub fn release_routes(&mut self, codec: u8, owner: Owner) -> Result<usize> {
        Ok(self.codec_mut(codec)?.release_routes(owner))
    }

    /// Enable or disable unsolicited responses from a route's pin, tagged with the route tag.
    pub fn set_route_unsolicited(&mut self, codec: u8, index: usize, enable: bool) -> Result<()> {
        let (pin, tag) = {
            let c = self.codec_mut(codec)?;
            let route = c
                .route(index)
                .ok_or(HdaError::InvalidOperation("no such route"))?;
            let pin = route.pin();
            let capable = c.node(pin).is_some_and(Node::unsolicited_capable);
            if !capable {
                return Err(HdaError::Unsupported("pin cannot send unsolicited responses"));
            }
            if route.unsol_tag == 0 {
                return Err(HdaError::Unsupported("route has no unsolicited tag"));
            }
            (pin, route.unsol_tag)
        };
        let payload = if enable {
            UNSOL_ENABLE | (tag & UNSOL_TAG_MASK)
        } else {
            0
        };
        self.rings.send_single(Command::new(
            codec,
            pin,
            VERB_SET_UNSOLICITED_ENABLE,
            payload,
        ))?;
        if let Some(route) = self.codec_mut(codec)?.route_mut(index) {
            route.unsol_enabled = enable;
        }
        Ok(())
    }

    pub fn send_verb(&mut self, cmd: Command) -> Result<u32> {
        self.rings.send_single(cmd)
    }

    pub fn send_verbs(&mut self, cmds: &[Command]) -> Result<Vec<u32>> {
        self.rings.send_chunked(cmds)
    }

    /// Send through the immediate command registers. The rings must already be stopped; see
    /// [`Controller::with_rings_quiesced`].
    pub fn send_immediate(&self, cmd: Command) -> Result<u32> {
        self.immediate.send(cmd)
    }

    /// Stop the rings, run `f` with the immediate channel, then restart whichever rings were
    /// running before, even when `f` fails.
    pub fn with_rings_quiesced<T>(
        &mut self,
        f: impl FnOnce(&ImmediateCommandChannel) -> Result<T>,
    ) -> Result<T> {
        let corb = self.rings.corb_running();
        let rirb = self.rings.rirb_running();
        if let Err(err) = self.rings.stop() {
            // The CORB may already be stopped when the RIRB fails to acknowledge.
            if let Err(restore) = self.rings.restore(corb, rirb) {
                tracing::error!(error = %restore, "command rings not restarted");
            }
            return Err(err);
        }
        let result = f(&self.immediate);
        let restored = self.rings.restore(corb, rirb);
        let value = result?;
        restored?;
        Ok(value)
    }

    pub fn controller_status(&self) -> ControllerStatus {
        self.status.controller_status()
    }

    pub fn stream_status(&self, engine: usize) -> StreamStatus {
        self.status.stream_status(engine)
    }

    pub fn clear_controller_status(&self, ring: RingStatus, state_change: u16) {
        self.status.clear_controller(ring, state_change);
    }

    pub fn clear_stream_status(&self, engine: usize, bits: StreamStatus) {
        self.status.clear_stream(engine, bits);
    }

    pub fn acknowledge_ring_faults(&mut self) {
        self.rings.acknowledge_faults();
    }

    pub fn check_interrupt_consistency(&self) -> Result<()> {
        self.status.check_consistency()
    }

    /// Unsolicited responses collected for `codec` since the last call.
    pub fn take_unsolicited(&mut self, codec: u8) -> Result<Vec<Response>> {
        self.rings.pop_responses(usize::MAX)?;
        Ok(self.rings.take_unsolicited(codec))
    }

    /// Solicited responses from `codec` left unclaimed, typically answers that arrived after
    /// their command timed out. Draining them lets the rings accept transactions again.
    pub fn take_solicited(&mut self, codec: u8) -> Result<Vec<Response>> {
        self.rings.pop_responses(usize::MAX)?;
        let stale = self.rings.take_solicited(codec);
        if !stale.is_empty() {
            tracing::warn!(codec, count = stale.len(), "discarding late solicited responses");
        }
        Ok(stale)
    }
}
