use crate::caps::{
    ConnListLength, FunctionGroupType, PcmSupport, PinCaps, StreamFormats, WidgetCaps, WidgetType,
};
use crate::verb::NodeId;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum NodeKind {
    Root,
    FunctionGroup(FunctionGroupType),
    ConverterOut,
    ConverterIn,
    Mixer,
    Selector,
    Pin,
    Power,
    VolumeKnob,
    Beep,
    VendorDefined,
}

impl From<WidgetType> for NodeKind {
    fn from(value: WidgetType) -> Self {
        match value {
            WidgetType::AudioOutput => NodeKind::ConverterOut,
            WidgetType::AudioInput => NodeKind::ConverterIn,
            WidgetType::Mixer => NodeKind::Mixer,
            WidgetType::Selector => NodeKind::Selector,
            WidgetType::Pin => NodeKind::Pin,
            WidgetType::Power => NodeKind::Power,
            WidgetType::VolumeKnob => NodeKind::VolumeKnob,
            WidgetType::Beep => NodeKind::Beep,
            WidgetType::VendorDefined => NodeKind::VendorDefined,
        }
    }
}

/// One discovered node. Immutable once the codec reaches `Ready`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub nid: NodeId,
    /// Owning function group (the root owns itself and the groups own themselves).
    pub fg: NodeId,
    pub kind: NodeKind,
    /// Raw capability word (widget caps for widgets, group type for function groups).
    pub raw_caps: u32,
    pub caps: WidgetCaps,
    pub pin_caps: PinCaps,
    pub conn_len: ConnListLength,
    /// Ordered connection list; selection is by index.
    pub connections: Vec<NodeId>,
    /// Format words, present on function groups and on widgets with the format override bit.
    pub pcm: PcmSupport,
    pub formats: StreamFormats,
}

impl Node {
    pub(crate) fn new(nid: NodeId, fg: NodeId, kind: NodeKind) -> Self {
        Self {
            nid,
            fg,
            kind,
            raw_caps: 0,
            caps: WidgetCaps::empty(),
            pin_caps: PinCaps::empty(),
            conn_len: ConnListLength {
                len: 0,
                long_form: false,
            },
            connections: Vec::new(),
            pcm: PcmSupport::empty(),
            formats: StreamFormats::empty(),
        }
    }

    pub fn is_widget(&self) -> bool {
        !matches!(self.kind, NodeKind::Root | NodeKind::FunctionGroup(_))
    }

    pub fn is_audio_group(&self) -> bool {
        self.kind == NodeKind::FunctionGroup(FunctionGroupType::Audio)
    }

    pub fn is_pin(&self) -> bool {
        self.kind == NodeKind::Pin
    }

    pub fn is_output_pin(&self) -> bool {
        self.is_pin() && self.pin_caps.contains(PinCaps::OUTPUT)
    }

    pub fn is_input_pin(&self) -> bool {
        self.is_pin() && self.pin_caps.contains(PinCaps::INPUT)
    }

    /// Mixers and selectors may sit between a converter and a pin.
    pub fn is_route_intermediate(&self) -> bool {
        matches!(self.kind, NodeKind::Mixer | NodeKind::Selector)
    }

    pub fn is_digital(&self) -> bool {
        self.caps.contains(WidgetCaps::DIGITAL)
            || self
                .pin_caps
                .intersects(PinCaps::HDMI | PinCaps::DISPLAY_PORT)
    }

    pub fn has_connection_list(&self) -> bool {
        self.is_widget() && self.caps.contains(WidgetCaps::CONN_LIST)
    }

    pub fn has_format_override(&self) -> bool {
        self.is_widget() && self.caps.contains(WidgetCaps::FORMAT_OVERRIDE)
    }

    pub fn unsolicited_capable(&self) -> bool {
        self.is_widget() && self.caps.contains(WidgetCaps::UNSOL_CAPABLE)
    }

    /// Index of `source` in this node's connection list.
    pub fn connection_index(&self, source: NodeId) -> Option<usize> {
        self.connections.iter().position(|&nid| nid == source)
    }
}
