//! Stream format word shared by converters (`SET_CONVERTER_FORMAT`) and stream descriptors
//! (SDnFMT).

use crate::caps::{PcmSupport, StreamFormats};
use crate::error::{HdaError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SampleKind {
    Pcm,
    NonPcm,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RateBase {
    Hz48000,
    Hz44100,
}

impl RateBase {
    pub fn hz(self) -> u32 {
        match self {
            RateBase::Hz48000 => 48_000,
            RateBase::Hz44100 => 44_100,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct StreamFormat {
    pub kind: SampleKind,
    pub base: RateBase,
    /// Rate multiplier, 1..=4.
    pub mult: u8,
    /// Rate divisor, 1..=8.
    pub div: u8,
    /// Sample depth in bits: 8, 16, 20, 24 or 32.
    pub bits: u8,
    /// Channel count, 1..=16.
    pub channels: u8,
}

const FMT_NON_PCM: u16 = 1 << 15;
const FMT_BASE_44K1: u16 = 1 << 14;
const FMT_MULT_SHIFT: u16 = 11;
const FMT_DIV_SHIFT: u16 = 8;
const FMT_BITS_SHIFT: u16 = 4;

impl StreamFormat {
    /// Plain PCM at 44.1 kHz or 48 kHz.
    pub fn pcm(rate: u32, bits: u8, channels: u8) -> Result<Self> {
        let base = match rate {
            48_000 => RateBase::Hz48000,
            44_100 => RateBase::Hz44100,
            _ => return Err(HdaError::Unsupported("sample rate without mult/div")),
        };
        let format = Self {
            kind: SampleKind::Pcm,
            base,
            mult: 1,
            div: 1,
            bits,
            channels,
        };
        format.validate()?;
        Ok(format)
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=4).contains(&self.mult) || !(1..=8).contains(&self.div) {
            return Err(HdaError::Unsupported("rate multiplier/divisor"));
        }
        if PcmSupport::bits_flag(self.bits).is_none() {
            return Err(HdaError::Unsupported("sample depth"));
        }
        if !(1..=16).contains(&self.channels) {
            return Err(HdaError::Unsupported("channel count"));
        }
        Ok(())
    }

    pub fn sample_rate(&self) -> u32 {
        self.base.hz() * u32::from(self.mult) / u32::from(self.div)
    }

    /// Bytes each sample occupies in memory; depths above 16 bits use 32-bit containers.
    pub fn container_bytes(&self) -> u32 {
        match self.bits {
            8 => 1,
            16 => 2,
            _ => 4,
        }
    }

    pub fn frame_bytes(&self) -> u32 {
        self.container_bytes() * u32::from(self.channels)
    }

    /// Average DMA byte rate.
    pub fn byte_rate(&self) -> u64 {
        u64::from(self.sample_rate()) * u64::from(self.frame_bytes())
    }

    /// Channel pairs needed to carry this format (one route per pair).
    pub fn channel_pairs(&self) -> usize {
        usize::from(self.channels).div_ceil(2)
    }

    pub fn encode(&self) -> u16 {
        let bits = match self.bits {
            8 => 0,
            16 => 1,
            20 => 2,
            24 => 3,
            _ => 4,
        };
        let mut word = 0u16;
        if self.kind == SampleKind::NonPcm {
            word |= FMT_NON_PCM;
        }
        if self.base == RateBase::Hz44100 {
            word |= FMT_BASE_44K1;
        }
        word |= (u16::from(self.mult.saturating_sub(1)) & 0x7) << FMT_MULT_SHIFT;
        word |= (u16::from(self.div.saturating_sub(1)) & 0x7) << FMT_DIV_SHIFT;
        word |= bits << FMT_BITS_SHIFT;
        word |= u16::from(self.channels.saturating_sub(1)) & 0xF;
        word
    }

    pub fn decode(word: u16) -> Result<Self> {
        let bits = match (word >> FMT_BITS_SHIFT) & 0x7 {
            0 => 8,
            1 => 16,
            2 => 20,
            3 => 24,
            4 => 32,
            _ => return Err(HdaError::Unsupported("reserved sample depth encoding")),
        };
        let mult = ((word >> FMT_MULT_SHIFT) & 0x7) as u8 + 1;
        if mult > 4 {
            return Err(HdaError::Unsupported("reserved rate multiplier encoding"));
        }
        Ok(Self {
            kind: if word & FMT_NON_PCM != 0 {
                SampleKind::NonPcm
            } else {
                SampleKind::Pcm
            },
            base: if word & FMT_BASE_44K1 != 0 {
                RateBase::Hz44100
            } else {
                RateBase::Hz48000
            },
            mult,
            div: ((word >> FMT_DIV_SHIFT) & 0x7) as u8 + 1,
            bits,
            channels: (word & 0xF) as u8 + 1,
        })
    }

    /// Whether a node advertising `pcm`/`formats` can carry this format.
    pub fn supported_by(&self, pcm: PcmSupport, formats: StreamFormats) -> bool {
        match self.kind {
            SampleKind::Pcm => {
                if !formats.contains(StreamFormats::PCM) {
                    return false;
                }
                let Some(rate) = PcmSupport::rate_flag(self.sample_rate()) else {
                    return false;
                };
                let Some(depth) = PcmSupport::bits_flag(self.bits) else {
                    return false;
                };
                pcm.contains(rate | depth)
            }
            SampleKind::NonPcm => formats.intersects(StreamFormats::AC3 | StreamFormats::FLOAT32),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_common_formats() {
        let fmt = StreamFormat::pcm(48_000, 16, 2).unwrap();
        assert_eq!(fmt.encode(), 0x0011);
        assert_eq!(fmt.byte_rate(), 192_000);

        let fmt = StreamFormat::pcm(44_100, 24, 2).unwrap();
        assert_eq!(fmt.encode(), 0x4031);
        assert_eq!(fmt.frame_bytes(), 8);
    }

    #[test]
    fn decodes_mult_and_div() {
        // 48k * 2 / 1, 16-bit, stereo.
        let fmt = StreamFormat::decode(0x0811).unwrap();
        assert_eq!(fmt.sample_rate(), 96_000);
        assert_eq!(StreamFormat::decode(fmt.encode()).unwrap(), fmt);

        // 48k / 6 = 8k.
        let fmt = StreamFormat::decode(0x0510).unwrap();
        assert_eq!(fmt.sample_rate(), 8_000);
        assert_eq!(fmt.channels, 1);
    }

    #[test]
    fn rejects_reserved_encodings() {
        assert!(StreamFormat::decode(0x0071).is_err());
        assert!(StreamFormat::decode(0x2011).is_err());
        assert!(StreamFormat::pcm(32_000, 16, 2).is_err());
        assert!(StreamFormat::pcm(48_000, 12, 2).is_err());
    }

    #[test]
    fn support_predicate_checks_rate_and_depth() {
        let pcm = PcmSupport::RATE_48000 | PcmSupport::BITS_16;
        let fmt = StreamFormat::pcm(48_000, 16, 2).unwrap();
        assert!(fmt.supported_by(pcm, StreamFormats::PCM));
        assert!(!fmt.supported_by(pcm, StreamFormats::AC3));
        let fmt24 = StreamFormat::pcm(48_000, 24, 2).unwrap();
        assert!(!fmt24.supported_by(pcm, StreamFormats::PCM));
        assert_eq!(StreamFormat::pcm(48_000, 16, 6).unwrap().channel_pairs(), 3);
    }
}
