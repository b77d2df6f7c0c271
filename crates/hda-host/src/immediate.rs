//! Immediate command interface (IC/IR/ICS): one verb at a time, no DMA.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{HdaError, Result};
use crate::platform::{poll_until, Clock, RegisterIo};
use crate::regs::*;
use crate::verb::Command;

pub struct ImmediateCommandChannel {
    regs: Arc<dyn RegisterIo>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
    interval: Duration,
    /// Software must set ICB to launch the command.
    busy_kick: bool,
}

impl std::fmt::Debug for ImmediateCommandChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImmediateCommandChannel")
            .field("timeout", &self.timeout)
            .field("busy_kick", &self.busy_kick)
            .finish_non_exhaustive()
    }
}

impl ImmediateCommandChannel {
    pub fn new(
        regs: Arc<dyn RegisterIo>,
        clock: Arc<dyn Clock>,
        timeout: Duration,
        interval: Duration,
        busy_kick: bool,
    ) -> Self {
        Self {
            regs,
            clock,
            timeout,
            interval,
            busy_kick,
        }
    }

    fn rings_active(&self) -> bool {
        self.regs.read8(HDA_CORBCTL) & CORBCTL_RUN != 0
            || self.regs.read8(HDA_RIRBCTL) & RIRBCTL_DMAEN != 0
    }

    /// Send one verb through the immediate command registers and return its payload.
    ///
    /// Only valid while both command rings are stopped.
    pub fn send(&self, cmd: Command) -> Result<u32> {
        if self.rings_active() {
            return Err(HdaError::misuse(HdaError::ImmediateWhileRingsActive));
        }
        let regs = self.regs.as_ref();
        let clock = self.clock.as_ref();

        poll_until(clock, self.timeout, self.interval, "immediate command idle", || {
            regs.read16(HDA_ICS) & ICS_ICB == 0
        })
        .map_err(|err| self.with_ics(err))?;

        regs.write16(HDA_ICS, ICS_IRV);
        regs.write32(HDA_IC, cmd.encode());
        if self.busy_kick {
            regs.write16(HDA_ICS, ICS_ICB);
        }
        tracing::trace!(
            codec = cmd.codec,
            nid = cmd.nid,
            verb = format_args!("{:#07x}", cmd.verb),
            "immediate command"
        );

        let mut answer = None;
        let waited = poll_until(
            clock,
            self.timeout,
            self.interval,
            "immediate command response",
            || {
                let ics = regs.read16(HDA_ICS);
                if ics & ICS_IRV == 0 {
                    return false;
                }
                let payload = regs.read32(HDA_IR);
                regs.write16(HDA_ICS, ICS_IRV);
                if ics & ICS_IRRUNSOL != 0 {
                    tracing::warn!(
                        payload = format_args!("{payload:#010x}"),
                        "unsolicited response on immediate channel ignored"
                    );
                    return false;
                }
                answer = Some((ics, payload));
                true
            },
        );
        if let (Ok(()), Some((ics, payload))) = (&waited, answer) {
            let codec = ((ics & ICS_IRRADD_MASK) >> ICS_IRRADD_SHIFT) as u8;
            if codec != cmd.codec {
                return Err(HdaError::ResponseAddressMismatch {
                    expected: cmd.codec,
                    received: codec,
                });
            }
            return Ok(payload);
        }

        if self.busy_kick {
            let ics = regs.read16(HDA_ICS);
            regs.write16(HDA_ICS, ics & !(ICS_ICB | ICS_IRV));
        }
        Err(HdaError::Timeout {
            op: "immediate command response",
            timeout: self.timeout,
            detail: format!(
                "codec {} node {:#04x}, ICS={:#06x}",
                cmd.codec,
                cmd.nid,
                regs.read16(HDA_ICS)
            ),
        })
    }

    fn with_ics(&self, err: HdaError) -> HdaError {
        match err {
            HdaError::Timeout { op, timeout, .. } => HdaError::Timeout {
                op,
                timeout,
                detail: format!("ICS={:#06x}", self.regs.read16(HDA_ICS)),
            },
            other => other,
        }
    }
}
