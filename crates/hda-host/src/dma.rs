//! Stream descriptor DMA engines.
//!
//! Each engine is a three-state machine. The only legal transitions are Stop <-> Reset and
//! Stop <-> Run; every transition is acknowledged by the controller and waited for with a
//! bounded poll.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{HdaError, Result};
use crate::platform::{poll_until, Clock, RegisterIo};
use crate::regs::*;
use crate::route::RouteDirection;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EngineState {
    Stop,
    Reset,
    Run,
}

impl EngineState {
    pub fn can_transition_to(self, to: EngineState) -> bool {
        use EngineState::*;
        matches!(
            (self, to),
            (Stop, Reset) | (Reset, Stop) | (Stop, Run) | (Run, Stop)
        )
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EngineKind {
    Input,
    Output,
    Bidirectional,
}

impl EngineKind {
    pub fn serves(self, direction: RouteDirection) -> bool {
        match self {
            EngineKind::Input => direction == RouteDirection::Input,
            EngineKind::Output => direction == RouteDirection::Output,
            EngineKind::Bidirectional => true,
        }
    }
}

/// Engine kinds in register order: inputs, then outputs, then bidirectional engines.
pub fn engine_layout(caps: &GlobalCaps) -> Vec<EngineKind> {
    std::iter::repeat_n(EngineKind::Input, usize::from(caps.input_streams))
        .chain(std::iter::repeat_n(EngineKind::Output, usize::from(caps.output_streams)))
        .chain(std::iter::repeat_n(
            EngineKind::Bidirectional,
            usize::from(caps.bidir_streams),
        ))
        .take(MAX_ENGINES)
        .collect()
}

/// Everything `program` writes into a stream descriptor.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct EngineProgram {
    pub stream: u8,
    pub direction: RouteDirection,
    pub traffic_priority: bool,
    /// SDO lines to stripe output across (1, 2 or 4).
    pub stripe_lines: u8,
    pub cyclic_buffer_length: u32,
    pub last_valid_index: u8,
    pub format: u16,
    pub bdl_base: u64,
    pub ioc_interrupt: bool,
    pub fifo_error_interrupt: bool,
    pub descriptor_error_interrupt: bool,
}

impl EngineProgram {
    fn control_word(&self, kind: EngineKind) -> u32 {
        let mut ctl = (u32::from(self.stream) << SD_CTL_STRM_SHIFT) & SD_CTL_STRM_MASK;
        if kind == EngineKind::Bidirectional && self.direction == RouteDirection::Output {
            ctl |= SD_CTL_DIR;
        }
        if self.traffic_priority {
            ctl |= SD_CTL_TP;
        }
        if self.direction == RouteDirection::Output {
            let stripe = match self.stripe_lines {
                4 => 2,
                2 => 1,
                _ => 0,
            };
            ctl |= stripe << SD_CTL_STRIPE_SHIFT;
        }
        if self.ioc_interrupt {
            ctl |= SD_CTL_IOCE;
        }
        if self.fifo_error_interrupt {
            ctl |= SD_CTL_FEIE;
        }
        if self.descriptor_error_interrupt {
            ctl |= SD_CTL_DEIE;
        }
        ctl
    }
}

pub struct DmaEngine {
    index: usize,
    kind: EngineKind,
    state: EngineState,
    stream: Option<u8>,
    fifo_size: u16,
    transitions: Vec<(EngineState, EngineState)>,
    regs: Arc<dyn RegisterIo>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
    interval: Duration,
}

impl std::fmt::Debug for DmaEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaEngine")
            .field("index", &self.index)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("stream", &self.stream)
            .finish_non_exhaustive()
    }
}

impl DmaEngine {
    pub fn new(
        index: usize,
        kind: EngineKind,
        regs: Arc<dyn RegisterIo>,
        clock: Arc<dyn Clock>,
        timeout: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            index,
            kind,
            state: EngineState::Stop,
            stream: None,
            fifo_size: 0,
            transitions: Vec::new(),
            regs,
            clock,
            timeout,
            interval,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn kind(&self) -> EngineKind {
        self.kind
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Stream number programmed into the descriptor, if any.
    pub fn stream(&self) -> Option<u8> {
        self.stream
    }

    /// FIFO size read back after programming.
    pub fn fifo_size(&self) -> u16 {
        self.fifo_size
    }

    /// Every acknowledged transition, oldest first.
    pub fn transitions(&self) -> &[(EngineState, EngineState)] {
        &self.transitions
    }

    fn reg(&self, reg: u32) -> u32 {
        sd_reg(self.index, reg)
    }

    pub fn position(&self) -> u32 {
        self.regs.read32(self.reg(SD_LPIB))
    }

    pub fn transition(&mut self, to: EngineState) -> Result<()> {
        let from = self.state;
        if !from.can_transition_to(to) {
            return Err(HdaError::misuse(HdaError::IllegalTransition {
                engine: self.index,
                from,
                to,
            }));
        }

        let regs = self.regs.as_ref();
        let ctl_reg = self.reg(SD_CTL);
        let ctl = regs.read32(ctl_reg) & 0x00FF_FFFF;
        // (value to write, operation, acknowledge bit, expected bit state)
        let (write, op, bit, set) = match to {
            EngineState::Reset => (ctl | SD_CTL_SRST, "stream reset entry", SD_CTL_SRST, true),
            EngineState::Stop if from == EngineState::Reset => {
                (ctl & !SD_CTL_SRST, "stream reset exit", SD_CTL_SRST, false)
            }
            EngineState::Stop => (ctl & !SD_CTL_RUN, "stream stop", SD_CTL_RUN, false),
            EngineState::Run => (ctl | SD_CTL_RUN, "stream start", SD_CTL_RUN, true),
        };
        regs.write32(ctl_reg, write);
        let acked = poll_until(self.clock.as_ref(), self.timeout, self.interval, op, || {
            (regs.read32(ctl_reg) & bit != 0) == set
        });
        match acked {
            Ok(()) => {}
            Err(HdaError::Timeout { op, timeout, .. }) => {
                tracing::error!(engine = self.index, ?from, ?to, "stream engine did not acknowledge");
                return Err(HdaError::Timeout {
                    op,
                    timeout,
                    detail: format!(
                        "engine {} CTL={:#08x} STS={:#04x}",
                        self.index,
                        regs.read32(ctl_reg) & 0x00FF_FFFF,
                        regs.read8(self.reg(SD_STS))
                    ),
                });
            }
            Err(err) => return Err(err),
        }

        tracing::debug!(engine = self.index, ?from, ?to, "stream engine transition");
        self.transitions.push((from, to));
        self.state = to;
        Ok(())
    }

    /// Pulse the engine through Reset and back to Stop.
    pub fn reset(&mut self) -> Result<()> {
        self.transition(EngineState::Reset)?;
        self.transition(EngineState::Stop)
    }

    /// Reset the engine and program its descriptor. The engine is left stopped.
    pub fn program(&mut self, program: &EngineProgram) -> Result<()> {
        if self.state != EngineState::Stop {
            return Err(HdaError::misuse(HdaError::InvalidOperation(
                "stream engine must be stopped to be programmed",
            )));
        }
        if !self.kind.serves(program.direction) {
            return Err(HdaError::misuse(HdaError::InvalidOperation(
                "stream engine cannot serve this direction",
            )));
        }
        self.reset()?;

        let regs = self.regs.as_ref();
        // The status byte shares the dword; writing zeros there clears nothing.
        regs.write32(self.reg(SD_CTL), program.control_word(self.kind));
        regs.write32(self.reg(SD_CBL), program.cyclic_buffer_length);
        regs.write16(self.reg(SD_LVI), u16::from(program.last_valid_index));
        regs.write16(self.reg(SD_FMT), program.format);
        regs.write32(self.reg(SD_BDPL), program.bdl_base as u32);
        regs.write32(self.reg(SD_BDPU), (program.bdl_base >> 32) as u32);
        regs.write8(self.reg(SD_STS), SD_STS_W1C_MASK);

        self.fifo_size = regs.read16(self.reg(SD_FIFOS));
        self.stream = Some(program.stream);
        tracing::debug!(
            engine = self.index,
            stream = program.stream,
            cbl = program.cyclic_buffer_length,
            lvi = program.last_valid_index,
            fmt = format_args!("{:#06x}", program.format),
            fifo = self.fifo_size,
            "stream engine programmed"
        );
        Ok(())
    }

    pub fn start(&mut self) -> Result<()> {
        self.transition(EngineState::Run)
    }

    pub fn stop(&mut self) -> Result<()> {
        self.transition(EngineState::Stop)
    }

    pub(crate) fn unbind(&mut self) {
        self.stream = None;
    }
}
