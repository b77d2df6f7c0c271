//! Codec model: a node table answering verbs the way an HDA codec does.

use std::collections::{BTreeMap, HashMap};

use hda_host::caps::{
    ConnListLength, FunctionGroupType, PcmSupport, PinCaps, StreamFormats, WidgetCaps, WidgetType,
    WIDGET_TYPE_SHIFT,
};
use hda_host::codec::connection::encode_connection_list;
use hda_host::verb::{
    NodeId, Parameter, AMP_SET_INDEX_SHIFT, AMP_SET_INPUT, AMP_SET_OUTPUT, ROOT_NID, UNSOL_ENABLE, UNSOL_TAG_MASK, VERB4_GET_AMP_GAIN_MUTE,
    VERB4_GET_CONVERTER_FORMAT, VERB4_SET_AMP_GAIN_MUTE, VERB4_SET_CONVERTER_FORMAT,
    VERB_FUNCTION_RESET, VERB_GET_CONFIG_DEFAULT, VERB_GET_CONNECTION_LIST,
    VERB_GET_CONNECTION_SELECT, VERB_GET_PARAMETER, VERB_GET_PIN_WIDGET_CONTROL,
    VERB_GET_POWER_STATE, VERB_GET_STREAM_CHANNEL, VERB_GET_UNSOLICITED_ENABLE,
    VERB_SET_CONNECTION_SELECT, VERB_SET_PIN_WIDGET_CONTROL, VERB_SET_POWER_STATE,
    VERB_SET_STREAM_CHANNEL, VERB_SET_UNSOLICITED_ENABLE,
};

/// Amplifier capability word: mute capable, step size, step count and 0 dB offset.
pub fn amp_caps(offset: u8, steps: u8, step_size: u8) -> u32 {
    (1 << 31)
        | (u32::from(step_size & 0x7F) << 16)
        | (u32::from(steps & 0x7F) << 8)
        | u32::from(offset & 0x7F)
}

/// Verb-controlled state of one node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeControls {
    pub converter_format: u16,
    /// Stream (7:4) and channel (3:0).
    pub stream_channel: u8,
    pub connection_select: u8,
    pub pin_control: u8,
    pub unsolicited: u8,
    pub power_state: u8,
    /// Output amplifier gain/mute, left channel.
    pub output_amp: u8,
    /// Input amplifier gain/mute by connection index, left channel.
    pub input_amp: BTreeMap<u8, u8>,
}

impl NodeControls {
    pub fn unsolicited_tag(&self) -> Option<u8> {
        (self.unsolicited & UNSOL_ENABLE != 0).then_some(self.unsolicited & UNSOL_TAG_MASK)
    }
}

#[derive(Debug, Clone)]
struct SimNode {
    params: HashMap<u8, u32>,
    /// Words returned by `GET_CONNECTION_LIST`, in list order.
    connection_words: Vec<u32>,
    entries_per_word: usize,
    config_default: u32,
    controls: NodeControls,
}

impl SimNode {
    fn new() -> Self {
        Self {
            params: HashMap::new(),
            connection_words: Vec::new(),
            entries_per_word: 4,
            config_default: 0,
            controls: NodeControls::default(),
        }
    }

    fn param(&self, param: u8) -> u32 {
        self.params.get(&param).copied().unwrap_or(0)
    }
}

/// A codec on one SDIN line.
#[derive(Debug, Clone)]
pub struct SimCodec {
    nodes: BTreeMap<NodeId, SimNode>,
    /// Function group of every widget.
    owner: HashMap<NodeId, NodeId>,
    silent_function_reset: bool,
    verbs: u64,
}

impl SimCodec {
    pub fn builder(vendor_id: u32) -> CodecBuilder {
        CodecBuilder::new(vendor_id)
    }

    pub fn vendor_id(&self) -> u32 {
        self.nodes
            .get(&ROOT_NID)
            .map_or(0, |root| root.param(Parameter::VendorId as u8))
    }

    /// Verbs executed since power-on.
    pub fn verbs_executed(&self) -> u64 {
        self.verbs
    }

    pub fn controls(&self, nid: NodeId) -> Option<&NodeControls> {
        self.nodes.get(&nid).map(|node| &node.controls)
    }

    /// Link reset: every node loses its verb-controlled state.
    pub fn reset(&mut self) {
        for node in self.nodes.values_mut() {
            node.controls = NodeControls::default();
        }
    }

    fn reset_function_group(&mut self, fg: NodeId) {
        for (nid, node) in self.nodes.iter_mut() {
            if *nid == fg || self.owner.get(nid) == Some(&fg) {
                node.controls = NodeControls::default();
            }
        }
    }

    /// Execute one verb addressed to `nid`. `None` means the codec sends no response.
    pub fn execute(&mut self, nid: NodeId, verb: u32) -> Option<u32> {
        self.verbs += 1;
        let silent = self.silent_function_reset;
        let Some(node) = self.nodes.get_mut(&nid) else {
            tracing::trace!(nid, verb = format_args!("{verb:#07x}"), "verb to absent node");
            return Some(0);
        };

        let payload16 = (verb & 0xFFFF) as u16;
        match ((verb >> 16) & 0xF) as u8 {
            VERB4_SET_CONVERTER_FORMAT => {
                node.controls.converter_format = payload16;
                return Some(0);
            }
            VERB4_GET_CONVERTER_FORMAT => return Some(u32::from(node.controls.converter_format)),
            VERB4_SET_AMP_GAIN_MUTE => {
                let gain = payload16 as u8;
                if payload16 & AMP_SET_OUTPUT != 0 {
                    node.controls.output_amp = gain;
                }
                if payload16 & AMP_SET_INPUT != 0 {
                    let index = ((payload16 >> AMP_SET_INDEX_SHIFT) & 0xF) as u8;
                    node.controls.input_amp.insert(index, gain);
                }
                return Some(0);
            }
            VERB4_GET_AMP_GAIN_MUTE => {
                let gain = if payload16 & AMP_SET_OUTPUT != 0 {
                    node.controls.output_amp
                } else {
                    let index = (payload16 & 0xF) as u8;
                    node.controls.input_amp.get(&index).copied().unwrap_or(0)
                };
                return Some(u32::from(gain));
            }
            _ => {}
        }

        let verb_id = ((verb >> 8) & 0xFFF) as u16;
        let payload = verb as u8;
        let response = match verb_id {
            VERB_GET_PARAMETER => node.param(payload),
            VERB_GET_CONNECTION_SELECT => u32::from(node.controls.connection_select),
            VERB_SET_CONNECTION_SELECT => {
                node.controls.connection_select = payload;
                0
            }
            VERB_GET_CONNECTION_LIST => node
                .connection_words
                .get(usize::from(payload) / node.entries_per_word)
                .copied()
                .unwrap_or(0),
            VERB_GET_POWER_STATE => u32::from(node.controls.power_state),
            VERB_SET_POWER_STATE => {
                node.controls.power_state = payload & 0xF;
                0
            }
            VERB_GET_STREAM_CHANNEL => u32::from(node.controls.stream_channel),
            VERB_SET_STREAM_CHANNEL => {
                node.controls.stream_channel = payload;
                0
            }
            VERB_GET_PIN_WIDGET_CONTROL => u32::from(node.controls.pin_control),
            VERB_SET_PIN_WIDGET_CONTROL => {
                node.controls.pin_control = payload;
                0
            }
            VERB_GET_UNSOLICITED_ENABLE => u32::from(node.controls.unsolicited),
            VERB_SET_UNSOLICITED_ENABLE => {
                node.controls.unsolicited = payload & (UNSOL_ENABLE | UNSOL_TAG_MASK);
                0
            }
            VERB_GET_CONFIG_DEFAULT => node.config_default,
            VERB_FUNCTION_RESET => {
                self.reset_function_group(nid);
                if silent {
                    return None;
                }
                0
            }
            _ => 0,
        };
        Some(response)
    }

    /// Payload of the unsolicited response `nid` sends on a jack event, if it is enabled.
    pub fn unsolicited_payload(&self, nid: NodeId, subtag: u8) -> Option<u32> {
        let tag = self.nodes.get(&nid)?.controls.unsolicited_tag()?;
        Some((u32::from(tag) << 26) | (u32::from(subtag & 0x1F) << 21))
    }

    /// The reference desktop codec: two analog DACs behind mixers feeding a line-out and a
    /// headphone jack, two ADCs behind selectors, and an S/PDIF output.
    pub fn reference() -> Self {
        Self::reference_builder(0x10EC_0888).build()
    }

    fn reference_builder(vendor_id: u32) -> CodecBuilder {
        let stereo = WidgetCaps::STEREO;
        let mut b = Self::builder(vendor_id);
        b.function_group(
            0x01,
            FunctionGroupType::Audio,
            PcmSupport::RATE_44100
                | PcmSupport::RATE_48000
                | PcmSupport::RATE_96000
                | PcmSupport::BITS_16
                | PcmSupport::BITS_20
                | PcmSupport::BITS_24,
            StreamFormats::PCM,
        )
        .param(0x01, Parameter::OutputAmpCaps, amp_caps(0x57, 0x57, 0x02))
        .param(0x01, Parameter::InputAmpCaps, amp_caps(0x17, 0x1F, 0x05))
        .widget(0x02, WidgetType::AudioOutput, stereo | WidgetCaps::OUT_AMP)
        .widget(0x03, WidgetType::AudioOutput, stereo | WidgetCaps::OUT_AMP)
        .widget(
            0x06,
            WidgetType::AudioOutput,
            stereo | WidgetCaps::DIGITAL | WidgetCaps::FORMAT_OVERRIDE,
        )
        .formats(
            0x06,
            PcmSupport::RATE_48000 | PcmSupport::BITS_16,
            StreamFormats::PCM | StreamFormats::AC3,
        )
        .widget(0x07, WidgetType::AudioInput, stereo | WidgetCaps::IN_AMP)
        .connections(0x07, &[0x22])
        .widget(0x08, WidgetType::AudioInput, stereo | WidgetCaps::IN_AMP)
        .connections(0x08, &[0x23])
        .widget(
            0x0B,
            WidgetType::Mixer,
            stereo | WidgetCaps::IN_AMP | WidgetCaps::AMP_OVERRIDE,
        )
        .param(0x0B, Parameter::InputAmpCaps, amp_caps(0x0B, 0x1F, 0x05))
        .connections(0x0B, &[0x18, 0x19])
        .widget(0x0C, WidgetType::Mixer, stereo | WidgetCaps::IN_AMP)
        .connections(0x0C, &[0x02, 0x0B])
        .widget(0x0D, WidgetType::Mixer, stereo | WidgetCaps::IN_AMP)
        .connections(0x0D, &[0x03, 0x0B])
        .pin(
            0x14,
            stereo | WidgetCaps::OUT_AMP | WidgetCaps::UNSOL_CAPABLE,
            PinCaps::OUTPUT | PinCaps::PRESENCE_DETECT,
        )
        .connections(0x14, &[0x0C, 0x0D])
        .config_default(0x14, 0x0101_4010)
        .pin(
            0x15,
            stereo | WidgetCaps::OUT_AMP,
            PinCaps::OUTPUT | PinCaps::HEADPHONE_DRIVE | PinCaps::PRESENCE_DETECT,
        )
        .connections(0x15, &[0x0C, 0x0D])
        .config_default(0x15, 0x0221_4020)
        .pin(
            0x18,
            stereo | WidgetCaps::UNSOL_CAPABLE,
            PinCaps::INPUT | PinCaps::PRESENCE_DETECT,
        )
        .config_default(0x18, 0x01A1_9030)
        .pin(0x19, stereo, PinCaps::INPUT)
        .config_default(0x19, 0x0181_3040)
        .pin(0x1E, stereo | WidgetCaps::DIGITAL, PinCaps::OUTPUT)
        .connections(0x1E, &[0x06])
        .config_default(0x1E, 0x0144_1150)
        .widget(0x22, WidgetType::Selector, stereo)
        .connections(0x22, &[0x18, 0x19, 0x0B])
        .widget(0x23, WidgetType::Selector, stereo)
        .connections(0x23, &[0x18, 0x19]);
        b
    }

    /// A codec that answers nothing to a function group reset.
    pub fn via_silent_reset() -> Self {
        Self::reference_builder(0x1106_0397)
            .silent_function_reset()
            .build()
    }

    /// A codec whose selector lists a zero placeholder between real connections.
    pub fn with_zero_placeholder(vendor_id: u32) -> Self {
        let mut b = Self::reference_builder(vendor_id);
        b.raw_connections(
            0x23,
            ConnListLength {
                len: 3,
                long_form: false,
            },
            encode_connection_list(&[0x18, 0x00, 0x19], false),
        );
        b.build()
    }

    /// A codec advertising 88.2 kHz its converters cannot clock.
    pub fn alc262() -> Self {
        let mut b = Self::reference_builder(0x10EC_0262);
        b.param(
            0x01,
            Parameter::PcmSizeRates,
            (PcmSupport::RATE_44100
                | PcmSupport::RATE_48000
                | PcmSupport::RATE_88200
                | PcmSupport::BITS_16)
                .bits(),
        );
        b.build()
    }
}

/// Assembles a codec node table. Widgets belong to the function group declared before them.
#[derive(Debug, Clone)]
pub struct CodecBuilder {
    nodes: BTreeMap<NodeId, SimNode>,
    groups: Vec<NodeId>,
    owner: HashMap<NodeId, NodeId>,
    silent_function_reset: bool,
}

impl CodecBuilder {
    fn new(vendor_id: u32) -> Self {
        let mut root = SimNode::new();
        root.params.insert(Parameter::VendorId as u8, vendor_id);
        root.params.insert(Parameter::RevisionId as u8, 0x0010_0100);
        Self {
            nodes: BTreeMap::from([(ROOT_NID, root)]),
            groups: Vec::new(),
            owner: HashMap::new(),
            silent_function_reset: false,
        }
    }

    fn node(&mut self, nid: NodeId) -> &mut SimNode {
        self.nodes.entry(nid).or_insert_with(SimNode::new)
    }

    pub fn param(&mut self, nid: NodeId, param: Parameter, value: u32) -> &mut Self {
        self.node(nid).params.insert(param as u8, value);
        self
    }

    pub fn function_group(
        &mut self,
        nid: NodeId,
        kind: FunctionGroupType,
        pcm: PcmSupport,
        formats: StreamFormats,
    ) -> &mut Self {
        self.groups.push(nid);
        self.param(nid, Parameter::FunctionGroupType, u32::from(kind.raw()))
            .param(nid, Parameter::PcmSizeRates, pcm.bits())
            .param(nid, Parameter::StreamFormats, formats.bits())
    }

    pub fn widget(&mut self, nid: NodeId, kind: WidgetType, caps: WidgetCaps) -> &mut Self {
        if let Some(&fg) = self.groups.last() {
            self.owner.insert(nid, fg);
        }
        self.param(
            nid,
            Parameter::AudioWidgetCaps,
            (kind.raw() << WIDGET_TYPE_SHIFT) | caps.bits(),
        )
    }

    pub fn pin(&mut self, nid: NodeId, caps: WidgetCaps, pin_caps: PinCaps) -> &mut Self {
        self.widget(nid, WidgetType::Pin, caps)
            .param(nid, Parameter::PinCaps, pin_caps.bits())
    }

    pub fn formats(&mut self, nid: NodeId, pcm: PcmSupport, formats: StreamFormats) -> &mut Self {
        self.param(nid, Parameter::PcmSizeRates, pcm.bits())
            .param(nid, Parameter::StreamFormats, formats.bits())
    }

    pub fn config_default(&mut self, nid: NodeId, value: u32) -> &mut Self {
        self.node(nid).config_default = value;
        self
    }

    /// Short-form connection list; also sets the widget's connection list capability.
    pub fn connections(&mut self, nid: NodeId, list: &[NodeId]) -> &mut Self {
        let len = ConnListLength {
            len: list.len(),
            long_form: false,
        };
        self.raw_connections(nid, len, encode_connection_list(list, false))
    }

    /// Connection list words exactly as the codec reports them.
    pub fn raw_connections(
        &mut self,
        nid: NodeId,
        len: ConnListLength,
        words: Vec<u32>,
    ) -> &mut Self {
        let node = self.node(nid);
        let caps = node.param(Parameter::AudioWidgetCaps as u8);
        node.params
            .insert(Parameter::AudioWidgetCaps as u8, caps | WidgetCaps::CONN_LIST.bits());
        node.params
            .insert(Parameter::ConnectionListLength as u8, len.encode());
        node.entries_per_word = len.entries_per_word();
        node.connection_words = words;
        self
    }

    pub fn silent_function_reset(&mut self) -> &mut Self {
        self.silent_function_reset = true;
        self
    }

    /// Fill in the node counts and vendor-defined placeholders for unlisted node ids.
    pub fn build(&mut self) -> SimCodec {
        let mut nodes = self.nodes.clone();
        let mut owner = self.owner.clone();

        if let (Some(&first), Some(&last)) = (self.groups.iter().min(), self.groups.iter().max()) {
            if let Some(root) = nodes.get_mut(&ROOT_NID) {
                root.params.insert(
                    Parameter::SubordinateNodeCount as u8,
                    (u32::from(first) << 16) | u32::from(last - first + 1),
                );
            }
        }

        for &fg in &self.groups {
            let widgets: Vec<NodeId> = owner
                .iter()
                .filter(|(_, group)| **group == fg)
                .map(|(&nid, _)| nid)
                .collect();
            let (Some(&start), Some(&end)) = (widgets.iter().min(), widgets.iter().max()) else {
                continue;
            };
            if let Some(group) = nodes.get_mut(&fg) {
                group.params.insert(
                    Parameter::SubordinateNodeCount as u8,
                    (u32::from(start) << 16) | u32::from(end - start + 1),
                );
            }
            for nid in start..=end {
                if nodes.contains_key(&nid) {
                    continue;
                }
                let mut filler = SimNode::new();
                filler.params.insert(
                    Parameter::AudioWidgetCaps as u8,
                    WidgetType::VendorDefined.raw() << WIDGET_TYPE_SHIFT,
                );
                nodes.insert(nid, filler);
                owner.insert(nid, fg);
            }
        }

        SimCodec {
            nodes,
            owner,
            silent_function_reset: self.silent_function_reset,
            verbs: 0,
        }
    }
}
