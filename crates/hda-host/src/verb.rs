//! Verb/response wire format.
//!
//! A command word is `{codec address (31:28) | node id (27:20) | verb + payload (19:0)}`.
//! Verbs come in two shapes: a 12-bit verb id with an 8-bit payload, or a 4-bit verb id with a
//! 16-bit payload (converter format, amplifier gain/mute).
//!
//! A response is 64 bits: the low dword is the payload, the high dword carries the codec address
//! in bits 3:0 and the unsolicited flag in bit 4.

pub type NodeId = u8;

/// Root node of every codec.
pub const ROOT_NID: NodeId = 0;

pub const VERB_GET_PARAMETER: u16 = 0xF00;
pub const VERB_GET_CONNECTION_SELECT: u16 = 0xF01;
pub const VERB_SET_CONNECTION_SELECT: u16 = 0x701;
pub const VERB_GET_CONNECTION_LIST: u16 = 0xF02;
pub const VERB_GET_POWER_STATE: u16 = 0xF05;
pub const VERB_SET_POWER_STATE: u16 = 0x705;
pub const VERB_GET_STREAM_CHANNEL: u16 = 0xF06;
pub const VERB_SET_STREAM_CHANNEL: u16 = 0x706;
pub const VERB_GET_PIN_WIDGET_CONTROL: u16 = 0xF07;
pub const VERB_SET_PIN_WIDGET_CONTROL: u16 = 0x707;
pub const VERB_GET_UNSOLICITED_ENABLE: u16 = 0xF08;
pub const VERB_SET_UNSOLICITED_ENABLE: u16 = 0x708;
pub const VERB_GET_CONFIG_DEFAULT: u16 = 0xF1C;
pub const VERB_FUNCTION_RESET: u16 = 0x7FF;

// 4-bit verb ids carrying a 16-bit payload.
pub const VERB4_SET_CONVERTER_FORMAT: u8 = 0x2;
pub const VERB4_SET_AMP_GAIN_MUTE: u8 = 0x3;
pub const VERB4_GET_CONVERTER_FORMAT: u8 = 0xA;
pub const VERB4_GET_AMP_GAIN_MUTE: u8 = 0xB;

pub const PIN_CTL_IN_EN: u8 = 1 << 5;
pub const PIN_CTL_OUT_EN: u8 = 1 << 6;
pub const PIN_CTL_HP_EN: u8 = 1 << 7;

pub const UNSOL_ENABLE: u8 = 1 << 7;
pub const UNSOL_TAG_MASK: u8 = 0x3F;

// Amplifier gain/mute set payload.
pub const AMP_SET_OUTPUT: u16 = 1 << 15;
pub const AMP_SET_INPUT: u16 = 1 << 14;
pub const AMP_SET_LEFT: u16 = 1 << 13;
pub const AMP_SET_RIGHT: u16 = 1 << 12;
pub const AMP_SET_INDEX_SHIFT: u16 = 8;
pub const AMP_MUTE: u16 = 1 << 7;

/// `GET_PARAMETER` parameter ids.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Parameter {
    VendorId = 0x00,
    RevisionId = 0x02,
    SubordinateNodeCount = 0x04,
    FunctionGroupType = 0x05,
    AudioFunctionGroupCaps = 0x08,
    AudioWidgetCaps = 0x09,
    PcmSizeRates = 0x0A,
    StreamFormats = 0x0B,
    PinCaps = 0x0C,
    InputAmpCaps = 0x0D,
    ConnectionListLength = 0x0E,
    SupportedPowerStates = 0x0F,
    ProcessingCaps = 0x10,
    GpioCount = 0x11,
    OutputAmpCaps = 0x12,
    VolumeKnobCaps = 0x13,
}

/// One command word addressed to a codec node.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Command {
    pub codec: u8,
    pub nid: NodeId,
    /// Low 20 bits: verb id and payload.
    pub verb: u32,
}

impl Command {
    /// 12-bit verb id with an 8-bit payload.
    pub fn new(codec: u8, nid: NodeId, verb_id: u16, payload: u8) -> Self {
        Self {
            codec,
            nid,
            verb: ((u32::from(verb_id) & 0xFFF) << 8) | u32::from(payload),
        }
    }

    /// 4-bit verb id with a 16-bit payload.
    pub fn long(codec: u8, nid: NodeId, verb_id: u8, payload: u16) -> Self {
        Self {
            codec,
            nid,
            verb: ((u32::from(verb_id) & 0xF) << 16) | u32::from(payload),
        }
    }

    pub fn get_parameter(codec: u8, nid: NodeId, param: Parameter) -> Self {
        Self::new(codec, nid, VERB_GET_PARAMETER, param as u8)
    }

    pub fn encode(&self) -> u32 {
        (u32::from(self.codec & 0xF) << 28) | (u32::from(self.nid) << 20) | (self.verb & 0xFFFFF)
    }

    pub fn decode(word: u32) -> Self {
        Self {
            codec: ((word >> 28) & 0xF) as u8,
            nid: ((word >> 20) & 0xFF) as u8,
            verb: word & 0xFFFFF,
        }
    }

    /// The 12-bit verb id, assuming the 12/8 shape.
    pub fn verb_id(&self) -> u16 {
        ((self.verb >> 8) & 0xFFF) as u16
    }

    /// The 8-bit payload, assuming the 12/8 shape.
    pub fn payload8(&self) -> u8 {
        (self.verb & 0xFF) as u8
    }
}

pub const RESPONSE_EXT_CODEC_MASK: u32 = 0xF;
pub const RESPONSE_EXT_UNSOL: u32 = 1 << 4;

/// A decoded RIRB entry.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Response {
    pub payload: u32,
    pub codec: u8,
    pub unsolicited: bool,
}

impl Response {
    pub fn decode(raw: u64) -> Self {
        let ext = (raw >> 32) as u32;
        Self {
            payload: raw as u32,
            codec: (ext & RESPONSE_EXT_CODEC_MASK) as u8,
            unsolicited: ext & RESPONSE_EXT_UNSOL != 0,
        }
    }

    pub fn encode(&self) -> u64 {
        let mut ext = u32::from(self.codec) & RESPONSE_EXT_CODEC_MASK;
        if self.unsolicited {
            ext |= RESPONSE_EXT_UNSOL;
        }
        (u64::from(ext) << 32) | u64::from(self.payload)
    }

    /// Tag of an unsolicited response (bits 31:26).
    pub fn unsolicited_tag(&self) -> u8 {
        (self.payload >> 26) as u8 & UNSOL_TAG_MASK
    }

    /// Subtag of an unsolicited response (bits 25:21).
    pub fn unsolicited_subtag(&self) -> u8 {
        ((self.payload >> 21) & 0x1F) as u8
    }
}

/// Sub-node range as reported by `SubordinateNodeCount`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct NodeRange {
    pub start: NodeId,
    pub count: u8,
}

impl NodeRange {
    pub fn decode(word: u32) -> Self {
        Self {
            start: ((word >> 16) & 0xFF) as u8,
            count: (word & 0xFF) as u8,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = NodeId> {
        let start = u16::from(self.start);
        let end = (start + u16::from(self.count)).min(0x100);
        (start..end).map(|nid| nid as NodeId)
    }
}

/// Stream/channel payload for `SET_STREAM_CHANNEL`.
pub fn stream_channel_payload(stream: u8, channel: u8) -> u8 {
    ((stream & 0xF) << 4) | (channel & 0xF)
}

/// Payload for unmuting an amplifier at 0 dB offset on both channels.
pub fn amp_unmute_payload(output: bool, index: u8, gain: u8) -> u16 {
    let dir = if output { AMP_SET_OUTPUT } else { AMP_SET_INPUT };
    dir | AMP_SET_LEFT
        | AMP_SET_RIGHT
        | ((u16::from(index) & 0xF) << AMP_SET_INDEX_SHIFT)
        | u16::from(gain & 0x7F)
}
