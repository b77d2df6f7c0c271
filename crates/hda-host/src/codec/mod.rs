//! Codec topology: node arena, discovery state and route table of one codec.

pub mod connection;
pub mod discovery;
pub mod node;

use std::collections::HashMap;

use crate::error::{HdaError, Result};
use crate::format::StreamFormat;
use crate::quirks::CodecQuirks;
use crate::route::{Owner, Route, RouteDirection, RouteQuery, RouteTable};
use crate::verb::{NodeId, NodeRange};

pub use discovery::VerbTransport;
pub use node::{Node, NodeKind};

#[derive(Debug, Copy, Clone, Eq, PartialEq, PartialOrd, Ord)]
pub enum DiscoveryState {
    Uninitialized,
    FunctionGroupsEnumerated,
    NodesEnumerated,
    RoutesBuilt,
    Ready,
}

/// A codec at one SDIN address.
#[derive(Debug, Clone)]
pub struct Codec {
    address: u8,
    vendor_id: u32,
    revision_id: u32,
    quirks: CodecQuirks,
    state: DiscoveryState,
    /// Discovery order; index 0 is the root node.
    nodes: Vec<Node>,
    index: HashMap<NodeId, usize>,
    /// Sub-node range of each function group, filled during group enumeration.
    group_ranges: Vec<(NodeId, NodeRange)>,
    routes: RouteTable,
}

impl Codec {
    pub(crate) fn new(address: u8) -> Self {
        Self {
            address,
            vendor_id: 0,
            revision_id: 0,
            quirks: CodecQuirks::default(),
            state: DiscoveryState::Uninitialized,
            nodes: Vec::new(),
            index: HashMap::new(),
            group_ranges: Vec::new(),
            routes: RouteTable::default(),
        }
    }

    /// Run discovery to completion.
    pub fn discover(
        address: u8,
        transport: &mut dyn VerbTransport,
        silent_reset_delay: std::time::Duration,
    ) -> Result<Self> {
        let mut codec = Self::new(address);
        codec.enumerate_function_groups(transport, silent_reset_delay)?;
        codec.enumerate_nodes(transport)?;
        codec.build_routes()?;
        codec.finish()?;
        Ok(codec)
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn vendor_id(&self) -> u32 {
        self.vendor_id
    }

    pub fn revision_id(&self) -> u32 {
        self.revision_id
    }

    pub fn quirks(&self) -> &CodecQuirks {
        &self.quirks
    }

    pub fn state(&self) -> DiscoveryState {
        self.state
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, nid: NodeId) -> Option<&Node> {
        self.index.get(&nid).map(|&i| &self.nodes[i])
    }

    pub fn function_groups(&self) -> impl Iterator<Item = &Node> {
        self.nodes
            .iter()
            .filter(|node| matches!(node.kind, NodeKind::FunctionGroup(_)))
    }

    pub fn routes(&self) -> &[Route] {
        self.routes.routes()
    }

    pub fn routes_by_direction(&self, direction: RouteDirection) -> impl Iterator<Item = &Route> {
        self.routes.by_direction(direction)
    }

    pub fn route(&self, index: usize) -> Option<&Route> {
        self.routes.route(index)
    }

    pub(crate) fn route_mut(&mut self, index: usize) -> Option<&mut Route> {
        self.routes.route_mut(index)
    }

    fn require_state(&self, expected: DiscoveryState, name: &'static str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(HdaError::TopologyState {
                codec: self.address,
                expected: name,
            })
        }
    }

    fn push_node(&mut self, node: Node) {
        self.index.insert(node.nid, self.nodes.len());
        self.nodes.push(node);
    }

    /// Find a route; see [`RouteTable::find`]. Requires a ready topology.
    pub fn find_route(
        &mut self,
        direction: RouteDirection,
        format: &StreamFormat,
        pin: Option<NodeId>,
        reserve: Option<Owner>,
    ) -> Result<usize> {
        self.require_state(DiscoveryState::Ready, "ready")?;
        self.routes.find(
            &self.nodes,
            &self.quirks,
            RouteQuery {
                direction,
                format,
                pin,
                reserve,
            },
        )
    }

    pub fn release_routes(&mut self, owner: Owner) -> usize {
        self.routes.release(owner)
    }
}
