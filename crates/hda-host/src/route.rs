//! Route search and reservation.
//!
//! A route is an ordered node path `[function group, converter, intermediates.., pin]` of 3 to
//! [`MAX_ROUTE_NODES`] nodes. Input routes are found walking forward from each input converter
//! through connection lists until an input-capable pin is reached. Output routes are found
//! walking from each output-capable pin through connection lists until an output converter is
//! reached, then the function group is appended and the path reversed.

use std::collections::{HashMap, VecDeque};

use crate::codec::node::{Node, NodeKind};
use crate::error::{HdaError, Resource, Result};
use crate::format::StreamFormat;
use crate::quirks::CodecQuirks;
use crate::verb::{NodeId, UNSOL_TAG_MASK};

pub const MAX_ROUTE_NODES: usize = 5;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum RouteDirection {
    Input,
    Output,
}

/// Identifies the stream holding a reservation.
pub type Owner = u32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub direction: RouteDirection,
    pub nodes: Vec<NodeId>,
    pub digital: bool,
    pub reserved_by: Option<Owner>,
    /// Tag carried by unsolicited responses from this route's pin.
    pub unsol_tag: u8,
    pub unsol_enabled: bool,
}

impl Route {
    pub fn function_group(&self) -> NodeId {
        self.nodes[0]
    }

    pub fn converter(&self) -> NodeId {
        self.nodes[1]
    }

    pub fn pin(&self) -> NodeId {
        self.nodes[self.nodes.len() - 1]
    }

    pub fn is_reserved(&self) -> bool {
        self.reserved_by.is_some()
    }

    /// Whether the two routes share any widget. The function group is common to every route of
    /// a codec and is not compared.
    pub fn overlaps(&self, other: &Route) -> bool {
        self.nodes[1..]
            .iter()
            .any(|nid| other.nodes[1..].contains(nid))
    }
}

type NodeLookup<'a> = HashMap<NodeId, &'a Node>;

fn lookup(nodes: &[Node]) -> NodeLookup<'_> {
    nodes.iter().map(|node| (node.nid, node)).collect()
}

fn input_routes(fg: &Node, nodes: &NodeLookup<'_>, widgets: &[&Node]) -> Vec<Vec<NodeId>> {
    let mut found = Vec::new();
    for converter in widgets.iter().filter(|n| n.kind == NodeKind::ConverterIn) {
        let mut work = VecDeque::from([vec![fg.nid, converter.nid]]);
        while let Some(path) = work.pop_front() {
            let Some(tail) = path.last().and_then(|nid| nodes.get(nid)) else {
                continue;
            };
            for &next in &tail.connections {
                if path.contains(&next) {
                    continue;
                }
                let Some(node) = nodes.get(&next).filter(|n| n.fg == fg.nid) else {
                    continue;
                };
                if node.is_input_pin() {
                    let mut route = path.clone();
                    route.push(next);
                    found.push(route);
                } else if node.is_route_intermediate() && path.len() + 2 <= MAX_ROUTE_NODES {
                    let mut partial = path.clone();
                    partial.push(next);
                    work.push_back(partial);
                }
            }
        }
    }
    found
}

fn output_routes(fg: &Node, nodes: &NodeLookup<'_>, widgets: &[&Node]) -> Vec<Vec<NodeId>> {
    let mut found = Vec::new();
    for pin in widgets.iter().filter(|n| n.is_output_pin()) {
        let mut work = VecDeque::from([vec![pin.nid]]);
        while let Some(path) = work.pop_front() {
            let Some(tail) = path.last().and_then(|nid| nodes.get(nid)) else {
                continue;
            };
            for &next in &tail.connections {
                if path.contains(&next) {
                    continue;
                }
                let Some(node) = nodes.get(&next).filter(|n| n.fg == fg.nid) else {
                    continue;
                };
                // Room must remain for the converter and the function group.
                if node.kind == NodeKind::ConverterOut && path.len() + 2 <= MAX_ROUTE_NODES {
                    let mut route = path.clone();
                    route.push(next);
                    route.push(fg.nid);
                    route.reverse();
                    found.push(route);
                } else if node.is_route_intermediate() && path.len() + 3 <= MAX_ROUTE_NODES {
                    let mut partial = path.clone();
                    partial.push(next);
                    work.push_back(partial);
                }
            }
        }
    }
    found
}

/// Build the route candidates of every audio function group, in preference order.
pub fn build_routes(nodes: &[Node]) -> Vec<Route> {
    let by_id = lookup(nodes);
    let mut routes = Vec::new();
    for fg in nodes.iter().filter(|n| n.is_audio_group()) {
        let widgets: Vec<&Node> = nodes
            .iter()
            .filter(|n| n.is_widget() && n.fg == fg.nid)
            .collect();
        let paths = input_routes(fg, &by_id, &widgets)
            .into_iter()
            .map(|p| (RouteDirection::Input, p))
            .chain(
                output_routes(fg, &by_id, &widgets)
                    .into_iter()
                    .map(|p| (RouteDirection::Output, p)),
            );
        for (direction, path) in paths {
            let digital = path
                .last()
                .and_then(|nid| by_id.get(nid))
                .is_some_and(|pin| pin.is_digital());
            routes.push(Route {
                direction,
                nodes: path,
                digital,
                reserved_by: None,
                unsol_tag: 0,
                unsol_enabled: false,
            });
        }
    }
    // Stable: ties keep discovery order.
    routes.sort_by_key(|route| (route.digital, route.nodes.len()));
    for (i, route) in routes.iter_mut().enumerate() {
        route.unsol_tag = unsolicited_tag(i);
    }
    routes
}

/// Tag for the route at `index`. Only 63 non-zero tags exist; later routes get none (0).
pub fn unsolicited_tag(index: usize) -> u8 {
    u8::try_from(index + 1)
        .ok()
        .filter(|tag| *tag <= UNSOL_TAG_MASK)
        .unwrap_or(0)
}

/// What a caller is looking for in [`RouteTable::find`].
#[derive(Debug, Copy, Clone)]
pub struct RouteQuery<'a> {
    pub direction: RouteDirection,
    pub format: &'a StreamFormat,
    pub pin: Option<NodeId>,
    /// Reserve the route (and every unreserved route overlapping it) for this owner.
    pub reserve: Option<Owner>,
}

/// The routes of one codec with their reservation state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn new(routes: Vec<Route>) -> Self {
        Self { routes }
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn route(&self, index: usize) -> Option<&Route> {
        self.routes.get(index)
    }

    pub(crate) fn route_mut(&mut self, index: usize) -> Option<&mut Route> {
        self.routes.get_mut(index)
    }

    pub fn by_direction(&self, direction: RouteDirection) -> impl Iterator<Item = &Route> {
        self.routes
            .iter()
            .filter(move |route| route.direction == direction)
    }

    /// Find the first unreserved route matching `query`; returns its index.
    pub fn find(
        &mut self,
        nodes: &[Node],
        quirks: &CodecQuirks,
        query: RouteQuery<'_>,
    ) -> Result<usize> {
        let by_id = lookup(nodes);
        let index = self
            .routes
            .iter()
            .position(|route| {
                route.direction == query.direction
                    && !route.is_reserved()
                    && query.pin.is_none_or(|pin| route.pin() == pin)
                    && route_supports(route, &by_id, quirks, query.format)
            })
            .ok_or(HdaError::ResourceExhausted(Resource::Route))?;

        if let Some(owner) = query.reserve {
            self.reserve(index, owner);
        }
        Ok(index)
    }

    /// Reserve route `index` and every unreserved route sharing a widget with it.
    pub fn reserve(&mut self, index: usize, owner: Owner) {
        let Some(chosen) = self.routes.get(index).cloned() else {
            return;
        };
        let mut shared = 0;
        for (i, route) in self.routes.iter_mut().enumerate() {
            if i == index {
                route.reserved_by = Some(owner);
            } else if !route.is_reserved() && route.overlaps(&chosen) {
                route.reserved_by = Some(owner);
                shared += 1;
            }
        }
        tracing::debug!(
            route = ?chosen.nodes,
            owner,
            shared,
            "route reserved"
        );
    }

    /// Clear every reservation held by `owner`; returns how many routes were freed.
    pub fn release(&mut self, owner: Owner) -> usize {
        let mut freed = 0;
        for route in self
            .routes
            .iter_mut()
            .filter(|route| route.reserved_by == Some(owner))
        {
            route.reserved_by = None;
            freed += 1;
        }
        freed
    }
}

/// Format support comes from the converter when it overrides the group's format words.
fn route_supports(
    route: &Route,
    nodes: &NodeLookup<'_>,
    quirks: &CodecQuirks,
    format: &StreamFormat,
) -> bool {
    let source = nodes
        .get(&route.converter())
        .filter(|n| n.has_format_override())
        .or_else(|| nodes.get(&route.function_group()));
    match source {
        Some(node) => format.supported_by(quirks.correct_pcm(node.pcm), node.formats),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caps::{FunctionGroupType, PcmSupport, PinCaps, StreamFormats, WidgetCaps};

    fn fg() -> Node {
        let mut node = Node::new(0x01, 0x01, NodeKind::FunctionGroup(FunctionGroupType::Audio));
        node.pcm = PcmSupport::RATE_48000 | PcmSupport::BITS_16;
        node.formats = StreamFormats::PCM;
        node
    }

    fn widget(nid: NodeId, kind: NodeKind, connections: &[NodeId]) -> Node {
        let mut node = Node::new(nid, 0x01, kind);
        node.caps = WidgetCaps::CONN_LIST;
        node.connections = connections.to_vec();
        node
    }

    fn pin(nid: NodeId, caps: PinCaps, connections: &[NodeId]) -> Node {
        let mut node = widget(nid, NodeKind::Pin, connections);
        node.pin_caps = caps;
        node
    }

    /// Two DACs feeding two mixers that share pins 0x14/0x15.
    fn topology() -> Vec<Node> {
        vec![
            Node::new(0x00, 0x00, NodeKind::Root),
            fg(),
            widget(0x02, NodeKind::ConverterOut, &[]),
            widget(0x03, NodeKind::ConverterOut, &[]),
            widget(0x07, NodeKind::ConverterIn, &[0x22]),
            widget(0x0C, NodeKind::Mixer, &[0x02, 0x0B]),
            widget(0x0D, NodeKind::Mixer, &[0x03, 0x0B]),
            pin(0x14, PinCaps::OUTPUT, &[0x0C, 0x0D]),
            pin(0x15, PinCaps::OUTPUT, &[0x0D]),
            pin(0x18, PinCaps::INPUT, &[]),
            widget(0x22, NodeKind::Selector, &[0x18, 0x0C]),
        ]
    }

    fn format() -> StreamFormat {
        StreamFormat::pcm(48_000, 16, 2).unwrap()
    }

    #[test]
    fn tags_stop_before_they_would_wrap() {
        assert_eq!(unsolicited_tag(0), 1);
        assert_eq!(unsolicited_tag(62), 63);
        assert_eq!(unsolicited_tag(63), 0);
        assert_eq!(unsolicited_tag(64), 0);
        assert_eq!(unsolicited_tag(300), 0);
        let tags: Vec<u8> = (0..63).map(unsolicited_tag).collect();
        let mut unique = tags.clone();
        unique.dedup();
        assert_eq!(unique, tags);
        assert!(tags.iter().all(|&tag| tag != 0));
    }

    #[test]
    fn routes_are_fg_converter_pin_shaped() {
        let routes = build_routes(&topology());
        assert!(!routes.is_empty());
        for route in &routes {
            assert!((3..=MAX_ROUTE_NODES).contains(&route.nodes.len()));
            assert_eq!(route.function_group(), 0x01);
        }
        let outputs: Vec<_> = routes
            .iter()
            .filter(|r| r.direction == RouteDirection::Output)
            .map(|r| r.nodes.clone())
            .collect();
        assert_eq!(
            outputs,
            vec![
                vec![0x01, 0x02, 0x0C, 0x14],
                vec![0x01, 0x03, 0x0D, 0x14],
                vec![0x01, 0x03, 0x0D, 0x15],
            ]
        );
        let inputs: Vec<_> = routes
            .iter()
            .filter(|r| r.direction == RouteDirection::Input)
            .map(|r| r.nodes.clone())
            .collect();
        // 0x0C is a mixer but leads to no input pin; the branch is pruned.
        assert_eq!(inputs, vec![vec![0x01, 0x07, 0x22, 0x18]]);
    }

    #[test]
    fn reserving_marks_overlapping_routes() {
        let nodes = topology();
        let mut table = RouteTable::new(build_routes(&nodes));
        let fmt = format();
        let index = table
            .find(
                &nodes,
                &CodecQuirks::default(),
                RouteQuery {
                    direction: RouteDirection::Output,
                    format: &fmt,
                    pin: Some(0x14),
                    reserve: Some(7),
                },
            )
            .unwrap();
        assert_eq!(table.route(index).unwrap().nodes, vec![0x01, 0x02, 0x0C, 0x14]);
        // Shares pin 0x14.
        let other = table
            .routes()
            .iter()
            .find(|r| r.nodes == vec![0x01, 0x03, 0x0D, 0x14])
            .unwrap();
        assert_eq!(other.reserved_by, Some(7));
        // Does not share any widget.
        let free = table
            .routes()
            .iter()
            .find(|r| r.nodes == vec![0x01, 0x03, 0x0D, 0x15])
            .unwrap();
        assert_eq!(free.reserved_by, None);

        let err = table
            .find(
                &nodes,
                &CodecQuirks::default(),
                RouteQuery {
                    direction: RouteDirection::Output,
                    format: &fmt,
                    pin: Some(0x14),
                    reserve: Some(8),
                },
            )
            .unwrap_err();
        assert!(matches!(err, HdaError::ResourceExhausted(Resource::Route)));

        assert_eq!(table.release(7), 2);
        assert!(table.routes().iter().all(|r| !r.is_reserved()));
    }

    #[test]
    fn lookup_without_reservation_leaves_table_untouched() {
        let nodes = topology();
        let mut table = RouteTable::new(build_routes(&nodes));
        let before = table.clone();
        let fmt = format();
        table
            .find(
                &nodes,
                &CodecQuirks::default(),
                RouteQuery {
                    direction: RouteDirection::Input,
                    format: &fmt,
                    pin: None,
                    reserve: None,
                },
            )
            .unwrap();
        assert_eq!(table, before);
    }

    #[test]
    fn unsupported_format_is_not_matched() {
        let nodes = topology();
        let mut table = RouteTable::new(build_routes(&nodes));
        let fmt = StreamFormat::pcm(44_100, 16, 2).unwrap();
        let err = table
            .find(
                &nodes,
                &CodecQuirks::default(),
                RouteQuery {
                    direction: RouteDirection::Output,
                    format: &fmt,
                    pin: None,
                    reserve: None,
                },
            )
            .unwrap_err();
        assert!(!err.is_fatal());
    }

    #[test]
    fn digital_routes_sort_last() {
        let mut nodes = topology();
        let mut spdif = pin(0x1E, PinCaps::OUTPUT, &[0x06]);
        spdif.caps |= WidgetCaps::DIGITAL;
        nodes.push(widget(0x06, NodeKind::ConverterOut, &[]));
        nodes.push(spdif);
        let routes = build_routes(&nodes);
        let last = routes.last().unwrap();
        assert!(last.digital);
        assert_eq!(last.nodes, vec![0x01, 0x06, 0x1E]);
    }
}
