//! Capability words returned by `GET_PARAMETER`.

use bitflags::bitflags;

bitflags! {
    /// Audio widget capabilities (parameter 0x09), excluding the type and delay fields.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct WidgetCaps: u32 {
        const STEREO = 1 << 0;
        const IN_AMP = 1 << 1;
        const OUT_AMP = 1 << 2;
        const AMP_OVERRIDE = 1 << 3;
        const FORMAT_OVERRIDE = 1 << 4;
        const STRIPE = 1 << 5;
        const PROC_WIDGET = 1 << 6;
        const UNSOL_CAPABLE = 1 << 7;
        const CONN_LIST = 1 << 8;
        const DIGITAL = 1 << 9;
        const POWER_CTRL = 1 << 10;
        const LR_SWAP = 1 << 11;
        const CP_CAPS = 1 << 12;
    }
}

pub const WIDGET_TYPE_SHIFT: u32 = 20;
pub const WIDGET_TYPE_MASK: u32 = 0xF << WIDGET_TYPE_SHIFT;

/// Widget type field of the audio widget capabilities word.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum WidgetType {
    AudioOutput,
    AudioInput,
    Mixer,
    Selector,
    Pin,
    Power,
    VolumeKnob,
    Beep,
    VendorDefined,
}

impl WidgetType {
    pub fn from_caps(raw: u32) -> Option<Self> {
        Some(match (raw & WIDGET_TYPE_MASK) >> WIDGET_TYPE_SHIFT {
            0x0 => Self::AudioOutput,
            0x1 => Self::AudioInput,
            0x2 => Self::Mixer,
            0x3 => Self::Selector,
            0x4 => Self::Pin,
            0x5 => Self::Power,
            0x6 => Self::VolumeKnob,
            0x7 => Self::Beep,
            0xF => Self::VendorDefined,
            _ => return None,
        })
    }

    pub fn raw(self) -> u32 {
        match self {
            Self::AudioOutput => 0x0,
            Self::AudioInput => 0x1,
            Self::Mixer => 0x2,
            Self::Selector => 0x3,
            Self::Pin => 0x4,
            Self::Power => 0x5,
            Self::VolumeKnob => 0x6,
            Self::Beep => 0x7,
            Self::VendorDefined => 0xF,
        }
    }
}

/// Function group type (parameter 0x05, bits 7:0).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FunctionGroupType {
    Audio,
    Modem,
    Vendor(u8),
}

impl FunctionGroupType {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match (raw & 0xFF) as u8 {
            0x01 => Some(Self::Audio),
            0x02 => Some(Self::Modem),
            kind @ 0x80..=0xFF => Some(Self::Vendor(kind)),
            _ => None,
        }
    }

    pub fn raw(self) -> u8 {
        match self {
            Self::Audio => 0x01,
            Self::Modem => 0x02,
            Self::Vendor(kind) => kind,
        }
    }
}

bitflags! {
    /// Pin capabilities (parameter 0x0C).
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct PinCaps: u32 {
        const IMPEDANCE_SENSE = 1 << 0;
        const TRIGGER_REQUIRED = 1 << 1;
        const PRESENCE_DETECT = 1 << 2;
        const HEADPHONE_DRIVE = 1 << 3;
        const OUTPUT = 1 << 4;
        const INPUT = 1 << 5;
        const BALANCED = 1 << 6;
        const HDMI = 1 << 7;
        const EAPD = 1 << 16;
        const DISPLAY_PORT = 1 << 24;
        const HBR = 1 << 27;
    }
}

bitflags! {
    /// Supported PCM sizes and rates (parameter 0x0A).
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct PcmSupport: u32 {
        const RATE_8000 = 1 << 0;
        const RATE_11025 = 1 << 1;
        const RATE_16000 = 1 << 2;
        const RATE_22050 = 1 << 3;
        const RATE_32000 = 1 << 4;
        const RATE_44100 = 1 << 5;
        const RATE_48000 = 1 << 6;
        const RATE_88200 = 1 << 7;
        const RATE_96000 = 1 << 8;
        const RATE_176400 = 1 << 9;
        const RATE_192000 = 1 << 10;
        const RATE_384000 = 1 << 11;
        const BITS_8 = 1 << 16;
        const BITS_16 = 1 << 17;
        const BITS_20 = 1 << 18;
        const BITS_24 = 1 << 19;
        const BITS_32 = 1 << 20;
    }
}

/// Sample rates in the bit order of [`PcmSupport`].
pub const PCM_RATES: [(u32, PcmSupport); 12] = [
    (8_000, PcmSupport::RATE_8000),
    (11_025, PcmSupport::RATE_11025),
    (16_000, PcmSupport::RATE_16000),
    (22_050, PcmSupport::RATE_22050),
    (32_000, PcmSupport::RATE_32000),
    (44_100, PcmSupport::RATE_44100),
    (48_000, PcmSupport::RATE_48000),
    (88_200, PcmSupport::RATE_88200),
    (96_000, PcmSupport::RATE_96000),
    (176_400, PcmSupport::RATE_176400),
    (192_000, PcmSupport::RATE_192000),
    (384_000, PcmSupport::RATE_384000),
];

impl PcmSupport {
    pub fn rate_flag(rate: u32) -> Option<Self> {
        PCM_RATES
            .iter()
            .find(|(hz, _)| *hz == rate)
            .map(|(_, flag)| *flag)
    }

    pub fn bits_flag(bits: u8) -> Option<Self> {
        Some(match bits {
            8 => Self::BITS_8,
            16 => Self::BITS_16,
            20 => Self::BITS_20,
            24 => Self::BITS_24,
            32 => Self::BITS_32,
            _ => return None,
        })
    }
}

bitflags! {
    /// Supported stream formats (parameter 0x0B).
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct StreamFormats: u32 {
        const PCM = 1 << 0;
        const FLOAT32 = 1 << 1;
        const AC3 = 1 << 2;
    }
}

/// Connection list length word (parameter 0x0E).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ConnListLength {
    pub len: usize,
    pub long_form: bool,
}

impl ConnListLength {
    pub fn decode(raw: u32) -> Self {
        Self {
            len: (raw & 0x7F) as usize,
            long_form: raw & (1 << 7) != 0,
        }
    }

    pub fn encode(&self) -> u32 {
        (self.len as u32 & 0x7F) | if self.long_form { 1 << 7 } else { 0 }
    }

    /// Entries packed into one `GET_CONNECTION_LIST` response word.
    pub fn entries_per_word(&self) -> usize {
        if self.long_form {
            2
        } else {
            4
        }
    }

    /// Response words needed to read the whole list.
    pub fn words(&self) -> usize {
        self.len.div_ceil(self.entries_per_word())
    }
}
