//! Vendor quirk table.
//!
//! Quirks are looked up once (per codec at discovery, per controller at attach) and consulted at
//! fixed points: function group reset, connection list decoding, format support, and the
//! immediate command handshake.

use crate::caps::PcmSupport;

pub const VENDOR_VIA: u16 = 0x1106;
pub const VENDOR_ANALOG_DEVICES: u16 = 0x11D4;
pub const VENDOR_REALTEK: u16 = 0x10EC;
pub const VENDOR_ATI: u16 = 0x1002;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum CodecQuirk {
    /// Function group reset produces no response; wait a fixed delay instead.
    SilentFunctionReset,
    /// A zero entry inside a connection list is a placeholder, not a terminator.
    ConnectionZeroPlaceholder,
    /// Correct the advertised PCM size/rate word.
    PcmCorrection {
        remove: PcmSupport,
        add: PcmSupport,
    },
}

#[derive(Debug, Copy, Clone)]
struct CodecQuirkEntry {
    vendor: u16,
    /// `None` matches every device of the vendor.
    device: Option<u16>,
    quirk: CodecQuirk,
}

const CODEC_QUIRKS: &[CodecQuirkEntry] = &[
    CodecQuirkEntry {
        vendor: VENDOR_VIA,
        device: None,
        quirk: CodecQuirk::SilentFunctionReset,
    },
    CodecQuirkEntry {
        vendor: VENDOR_ANALOG_DEVICES,
        device: None,
        quirk: CodecQuirk::ConnectionZeroPlaceholder,
    },
    // ALC262 advertises 88.2/176.4 kHz which its converters do not clock.
    CodecQuirkEntry {
        vendor: VENDOR_REALTEK,
        device: Some(0x0262),
        quirk: CodecQuirk::PcmCorrection {
            remove: PcmSupport::RATE_88200.union(PcmSupport::RATE_176400),
            add: PcmSupport::empty(),
        },
    },
];

/// Effective quirks of one codec.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct CodecQuirks {
    pub silent_function_reset: bool,
    pub zero_placeholder: bool,
    pub pcm_remove: PcmSupport,
    pub pcm_add: PcmSupport,
}

impl CodecQuirks {
    /// Quirks for the codec whose `VendorId` parameter reads `vendor_id`.
    pub fn lookup(vendor_id: u32) -> Self {
        let vendor = (vendor_id >> 16) as u16;
        let device = vendor_id as u16;
        let mut quirks = Self::default();
        for entry in CODEC_QUIRKS {
            if entry.vendor != vendor || entry.device.is_some_and(|d| d != device) {
                continue;
            }
            match entry.quirk {
                CodecQuirk::SilentFunctionReset => quirks.silent_function_reset = true,
                CodecQuirk::ConnectionZeroPlaceholder => quirks.zero_placeholder = true,
                CodecQuirk::PcmCorrection { remove, add } => {
                    quirks.pcm_remove |= remove;
                    quirks.pcm_add |= add;
                }
            }
        }
        if quirks != Self::default() {
            tracing::debug!(
                vendor = format_args!("{vendor:#06x}"),
                device = format_args!("{device:#06x}"),
                ?quirks,
                "codec quirks applied"
            );
        }
        quirks
    }

    pub fn correct_pcm(&self, pcm: PcmSupport) -> PcmSupport {
        (pcm - self.pcm_remove) | self.pcm_add
    }
}

/// Effective quirks of the controller, keyed by its PCI id.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct ControllerQuirks {
    /// The immediate command busy bit (ICB) must be set by software to start a command.
    pub immediate_busy_kick: bool,
}

const BUSY_KICK_CONTROLLERS: &[(u16, u16)] = &[(VENDOR_ATI, 0x437B), (VENDOR_ATI, 0x4383)];

impl ControllerQuirks {
    pub fn lookup(pci_vendor: u16, pci_device: u16) -> Self {
        Self {
            immediate_busy_kick: BUSY_KICK_CONTROLLERS.contains(&(pci_vendor, pci_device)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_wide_entries_match_any_device() {
        let q = CodecQuirks::lookup(0x11D4_1984);
        assert!(q.zero_placeholder);
        assert!(!q.silent_function_reset);
        assert!(CodecQuirks::lookup(0x1106_E721).silent_function_reset);
    }

    #[test]
    fn device_specific_corrections() {
        let pcm = PcmSupport::RATE_48000 | PcmSupport::RATE_88200 | PcmSupport::BITS_16;
        let q = CodecQuirks::lookup(0x10EC_0262);
        assert_eq!(q.correct_pcm(pcm), PcmSupport::RATE_48000 | PcmSupport::BITS_16);
        assert_eq!(CodecQuirks::lookup(0x10EC_0888).correct_pcm(pcm), pcm);
    }

    #[test]
    fn controller_busy_kick() {
        assert!(ControllerQuirks::lookup(VENDOR_ATI, 0x437B).immediate_busy_kick);
        assert!(!ControllerQuirks::lookup(0x8086, 0x2668).immediate_busy_kick);
    }
}
