//! Batched topology discovery.

use std::time::Duration;

use super::connection::decode_connection_list;
use super::node::{Node, NodeKind};
use super::{Codec, DiscoveryState};
use crate::caps::{
    ConnListLength, FunctionGroupType, PcmSupport, PinCaps, StreamFormats, WidgetCaps, WidgetType,
    WIDGET_TYPE_MASK, WIDGET_TYPE_SHIFT,
};
use crate::error::{HdaError, Result};
use crate::ring::RingBufferProtocol;
use crate::route;
use crate::verb::{
    Command, NodeId, NodeRange, Parameter, ROOT_NID, VERB_FUNCTION_RESET,
    VERB_GET_CONNECTION_LIST, VERB_SET_UNSOLICITED_ENABLE,
};

/// How discovery talks to a codec.
pub trait VerbTransport {
    /// Send `cmds` and return the response payloads in command order.
    fn exchange(&mut self, cmds: &[Command]) -> Result<Vec<u32>>;

    /// Send a verb the codec does not answer, then wait `settle`.
    fn post_silent(&mut self, cmd: Command, settle: Duration) -> Result<()>;
}

impl VerbTransport for RingBufferProtocol {
    fn exchange(&mut self, cmds: &[Command]) -> Result<Vec<u32>> {
        self.send_chunked(cmds)
    }

    fn post_silent(&mut self, cmd: Command, settle: Duration) -> Result<()> {
        self.post_unanswered(cmd, settle)
    }
}

impl Codec {
    pub(crate) fn enumerate_function_groups(
        &mut self,
        transport: &mut dyn VerbTransport,
        silent_reset_delay: Duration,
    ) -> Result<()> {
        self.require_state(DiscoveryState::Uninitialized, "uninitialized")?;
        let addr = self.address;

        let root = transport.exchange(&[
            Command::get_parameter(addr, ROOT_NID, Parameter::VendorId),
            Command::get_parameter(addr, ROOT_NID, Parameter::RevisionId),
            Command::get_parameter(addr, ROOT_NID, Parameter::SubordinateNodeCount),
        ])?;
        let [vendor_id, revision_id, sub_nodes] = root[..] else {
            return Err(HdaError::ResponseCountMismatch {
                expected: 3,
                received: root.len(),
            });
        };
        self.vendor_id = vendor_id;
        self.revision_id = revision_id;
        self.quirks = crate::quirks::CodecQuirks::lookup(vendor_id);
        self.push_node(Node::new(ROOT_NID, ROOT_NID, NodeKind::Root));

        let groups: Vec<NodeId> = NodeRange::decode(sub_nodes).iter().collect();
        let cmds: Vec<Command> = groups
            .iter()
            .flat_map(|&nid| {
                [
                    Command::get_parameter(addr, nid, Parameter::FunctionGroupType),
                    Command::get_parameter(addr, nid, Parameter::SubordinateNodeCount),
                    Command::get_parameter(addr, nid, Parameter::PcmSizeRates),
                    Command::get_parameter(addr, nid, Parameter::StreamFormats),
                ]
            })
            .collect();
        let resp = transport.exchange(&cmds)?;

        for (i, &nid) in groups.iter().enumerate() {
            let words = &resp[i * 4..i * 4 + 4];
            let kind = FunctionGroupType::from_raw(words[0]).ok_or_else(|| {
                HdaError::UnknownFunctionGroup {
                    codec: addr,
                    nid,
                    kind: words[0] as u8,
                }
            })?;
            let mut node = Node::new(nid, nid, NodeKind::FunctionGroup(kind));
            node.raw_caps = words[0];
            node.pcm = PcmSupport::from_bits_truncate(words[2]);
            node.formats = StreamFormats::from_bits_truncate(words[3]);
            self.group_ranges.push((nid, NodeRange::decode(words[1])));
            self.push_node(node);
        }

        for &nid in &groups {
            let reset = Command::new(addr, nid, VERB_FUNCTION_RESET, 0);
            if self.quirks.silent_function_reset {
                transport.post_silent(reset, silent_reset_delay)?;
            } else {
                transport.exchange(&[reset])?;
            }
        }
        let disable: Vec<Command> = groups
            .iter()
            .map(|&nid| Command::new(addr, nid, VERB_SET_UNSOLICITED_ENABLE, 0))
            .collect();
        transport.exchange(&disable)?;

        tracing::debug!(
            codec = addr,
            vendor_id = format_args!("{vendor_id:#010x}"),
            groups = groups.len(),
            "function groups enumerated"
        );
        self.state = DiscoveryState::FunctionGroupsEnumerated;
        Ok(())
    }

    pub(crate) fn enumerate_nodes(&mut self, transport: &mut dyn VerbTransport) -> Result<()> {
        self.require_state(DiscoveryState::FunctionGroupsEnumerated, "function groups enumerated")?;
        let addr = self.address;

        for (fg, range) in self.group_ranges.clone() {
            if !self.node(fg).is_some_and(Node::is_audio_group) {
                tracing::debug!(codec = addr, fg, "skipping widgets of non-audio function group");
                continue;
            }
            let nids: Vec<NodeId> = range.iter().collect();

            // (1) capabilities of every widget
            let caps = transport.exchange(
                &nids
                    .iter()
                    .map(|&nid| Command::get_parameter(addr, nid, Parameter::AudioWidgetCaps))
                    .collect::<Vec<_>>(),
            )?;
            let mut widgets = Vec::with_capacity(nids.len());
            for (&nid, &raw) in nids.iter().zip(&caps) {
                let kind = WidgetType::from_caps(raw).ok_or(HdaError::UnknownNodeType {
                    codec: addr,
                    nid,
                    kind: ((raw & WIDGET_TYPE_MASK) >> WIDGET_TYPE_SHIFT) as u8,
                })?;
                let mut node = Node::new(nid, fg, kind.into());
                node.raw_caps = raw;
                node.caps = WidgetCaps::from_bits_truncate(raw);
                widgets.push(node);
            }

            // (2) pin capabilities
            let pins: Vec<usize> = indices(&widgets, Node::is_pin);
            let pin_caps = query(transport, addr, &widgets, &pins, Parameter::PinCaps)?;
            for (&i, &raw) in pins.iter().zip(&pin_caps) {
                widgets[i].pin_caps = PinCaps::from_bits_truncate(raw);
            }

            // (3) connection list lengths
            let linked: Vec<usize> = indices(&widgets, Node::has_connection_list);
            let lengths = query(
                transport,
                addr,
                &widgets,
                &linked,
                Parameter::ConnectionListLength,
            )?;
            for (&i, &raw) in linked.iter().zip(&lengths) {
                widgets[i].conn_len = ConnListLength::decode(raw);
            }

            // (4) connection list payloads, sized from the known lengths
            let mut cmds = Vec::new();
            let mut spans = Vec::new();
            for &i in &linked {
                let len = widgets[i].conn_len;
                let start = cmds.len();
                for word in 0..len.words() {
                    let index = (word * len.entries_per_word()) as u8;
                    cmds.push(Command::new(
                        addr,
                        widgets[i].nid,
                        VERB_GET_CONNECTION_LIST,
                        index,
                    ));
                }
                spans.push((i, start..cmds.len()));
            }
            let words = transport.exchange(&cmds)?;
            for (i, span) in spans {
                let node = &mut widgets[i];
                let decoded =
                    decode_connection_list(&words[span], node.conn_len, self.quirks.zero_placeholder);
                if decoded.len() < node.conn_len.len {
                    tracing::error!(
                        codec = addr,
                        nid = node.nid,
                        declared = node.conn_len.len,
                        decoded = decoded.len(),
                        "connection list shorter than declared"
                    );
                    return Err(HdaError::ConnectionListShort {
                        codec: addr,
                        nid: node.nid,
                        declared: node.conn_len.len,
                        decoded: decoded.len(),
                    });
                }
                node.connections = decoded;
            }

            // (5) format words of widgets overriding the group's
            let overriding: Vec<usize> = indices(&widgets, Node::has_format_override);
            let pcm = query(transport, addr, &widgets, &overriding, Parameter::PcmSizeRates)?;
            let formats = query(transport, addr, &widgets, &overriding, Parameter::StreamFormats)?;
            for ((&i, &pcm), &formats) in overriding.iter().zip(&pcm).zip(&formats) {
                widgets[i].pcm = PcmSupport::from_bits_truncate(pcm);
                widgets[i].formats = StreamFormats::from_bits_truncate(formats);
            }

            let unsol: Vec<Command> = widgets
                .iter()
                .filter(|node| node.unsolicited_capable())
                .map(|node| Command::new(addr, node.nid, VERB_SET_UNSOLICITED_ENABLE, 0))
                .collect();
            transport.exchange(&unsol)?;

            tracing::debug!(
                codec = addr,
                fg,
                widgets = widgets.len(),
                pins = pins.len(),
                "widgets enumerated"
            );
            for node in widgets {
                self.push_node(node);
            }
        }

        self.state = DiscoveryState::NodesEnumerated;
        Ok(())
    }

    pub(crate) fn build_routes(&mut self) -> Result<()> {
        self.require_state(DiscoveryState::NodesEnumerated, "nodes enumerated")?;
        self.routes = route::RouteTable::new(route::build_routes(&self.nodes));
        self.state = DiscoveryState::RoutesBuilt;
        Ok(())
    }

    pub(crate) fn finish(&mut self) -> Result<()> {
        self.require_state(DiscoveryState::RoutesBuilt, "routes built")?;
        self.state = DiscoveryState::Ready;
        tracing::debug!(
            codec = self.address,
            nodes = self.nodes.len(),
            routes = self.routes.routes().len(),
            "codec ready"
        );
        Ok(())
    }
}

fn indices(nodes: &[Node], pred: impl Fn(&Node) -> bool) -> Vec<usize> {
    nodes
        .iter()
        .enumerate()
        .filter(|(_, node)| pred(node))
        .map(|(i, _)| i)
        .collect()
}

fn query(
    transport: &mut dyn VerbTransport,
    addr: u8,
    nodes: &[Node],
    which: &[usize],
    param: Parameter,
) -> Result<Vec<u32>> {
    let cmds: Vec<Command> = which
        .iter()
        .map(|&i| Command::get_parameter(addr, nodes[i].nid, param))
        .collect();
    transport.exchange(&cmds)
}
