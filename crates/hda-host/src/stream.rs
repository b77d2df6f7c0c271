//! Streams: a stream number, one DMA engine, a buffer descriptor list and the codec routes
//! carrying the channel pairs.
//!
//! Verification derives the position the engine should have reached from the time elapsed
//! since start and the format's byte rate, and compares it with the hardware link position.
//! Buffer-complete must be raised if and only if an IOC boundary was crossed since the last
//! check; boundaries within one FIFO depth of either end of the interval are ambiguous and
//! accepted either way.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use crate::bdl::{BdlSegment, BufferDescriptorList};
use crate::caps::{PinCaps, WidgetCaps};
use crate::codec::{Codec, DiscoveryState, Node, NodeKind};
use crate::controller::Controller;
use crate::dma::{DmaEngine, EngineKind, EngineProgram, EngineState};
use crate::error::{HdaError, Resource, Result};
use crate::format::StreamFormat;
use crate::route::{Owner, Route, RouteDirection};
use crate::status::StreamStatus;
use crate::verb::{
    amp_unmute_payload, stream_channel_payload, Command, NodeId, Parameter, PIN_CTL_HP_EN,
    PIN_CTL_IN_EN, PIN_CTL_OUT_EN, VERB4_SET_AMP_GAIN_MUTE, VERB4_SET_CONVERTER_FORMAT,
    VERB_SET_CONNECTION_SELECT, VERB_SET_PIN_WIDGET_CONTROL, VERB_SET_STREAM_CHANNEL,
};

/// Stream numbers on the link are 1..=15; 0 means "no stream".
pub const MAX_STREAM_NUMBER: u8 = 15;

/// What to stream, from where, through what buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub codec: u8,
    pub direction: RouteDirection,
    pub format: StreamFormat,
    /// Pin the first channel pair must use; any pin when `None`.
    pub pin: Option<NodeId>,
    pub segments: Vec<BdlSegment>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StreamState {
    Programmed,
    Running,
    Stopped,
}

#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct StreamStats {
    pub started_at: Option<Duration>,
    /// Absolute byte position at the last verification.
    pub last_position: u64,
    /// Completed passes over the cyclic buffer.
    pub loops: u64,
    /// Absolute byte position of the next IOC boundary.
    pub next_ioc: Option<u64>,
    pub checks: u64,
}

#[derive(Debug, Clone)]
pub struct Stream {
    number: u8,
    engine: usize,
    codec: u8,
    direction: RouteDirection,
    format: StreamFormat,
    routes: Vec<usize>,
    bdl: BufferDescriptorList,
    program: EngineProgram,
    state: StreamState,
    stats: StreamStats,
}

impl Stream {
    pub fn number(&self) -> u8 {
        self.number
    }

    /// Owner tag under which the stream's routes are reserved.
    pub fn owner(&self) -> Owner {
        Owner::from(self.number)
    }

    pub fn engine(&self) -> usize {
        self.engine
    }

    pub fn codec(&self) -> u8 {
        self.codec
    }

    pub fn direction(&self) -> RouteDirection {
        self.direction
    }

    pub fn format(&self) -> &StreamFormat {
        &self.format
    }

    /// Route table indices, one per channel pair.
    pub fn routes(&self) -> &[usize] {
        &self.routes
    }

    pub fn bdl(&self) -> &BufferDescriptorList {
        &self.bdl
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }
}

/// Result of one successful [`Controller::verify_position`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PositionReport {
    /// Link position in buffer (LPIB).
    pub position: u32,
    /// Position implied by elapsed time, within the cyclic buffer.
    pub expected: u32,
    /// Absolute byte count since start.
    pub absolute: u64,
    pub buffer_complete: bool,
}

/// Engines, streams and the stream-number allocator of one controller.
#[derive(Debug)]
pub struct StreamCoordinator {
    engines: Vec<DmaEngine>,
    streams: BTreeMap<u8, Stream>,
    /// Bit n set when stream number n is in use.
    numbers: u16,
}

impl StreamCoordinator {
    pub fn new(engines: Vec<DmaEngine>) -> Self {
        Self {
            engines,
            streams: BTreeMap::new(),
            numbers: 0,
        }
    }

    pub fn engines(&self) -> &[DmaEngine] {
        &self.engines
    }

    pub fn streams(&self) -> impl Iterator<Item = &Stream> {
        self.streams.values()
    }

    pub fn stream(&self, number: u8) -> Option<&Stream> {
        self.streams.get(&number)
    }

    fn allocate_number(&mut self) -> Result<u8> {
        let number = (1..=MAX_STREAM_NUMBER)
            .find(|n| self.numbers & (1 << n) == 0)
            .ok_or(HdaError::ResourceExhausted(Resource::StreamNumber))?;
        self.numbers |= 1 << number;
        Ok(number)
    }

    fn free_number(&mut self, number: u8) {
        self.numbers &= !(1 << number);
    }

    /// An idle engine serving `direction`; dedicated engines before bidirectional ones.
    fn pick_engine(&self, direction: RouteDirection) -> Result<usize> {
        let idle = |e: &&DmaEngine| {
            e.stream().is_none() && e.state() == EngineState::Stop && e.kind().serves(direction)
        };
        self.engines
            .iter()
            .filter(idle)
            .find(|e| e.kind() != EngineKind::Bidirectional)
            .or_else(|| self.engines.iter().find(idle))
            .map(DmaEngine::index)
            .ok_or(HdaError::ResourceExhausted(Resource::DmaEngine))
    }

    fn engine_mut(&mut self, index: usize) -> Result<&mut DmaEngine> {
        self.engines
            .get_mut(index)
            .ok_or(HdaError::InvalidOperation("no such DMA engine"))
    }

    fn stream_mut(&mut self, number: u8) -> Result<&mut Stream> {
        self.streams
            .get_mut(&number)
            .ok_or(HdaError::InvalidOperation("no such stream"))
    }
}

/// `(sink, source)` widget pairs whose connection selection carries the signal.
fn route_links(route: &Route) -> Vec<(NodeId, NodeId)> {
    let nodes = &route.nodes;
    match route.direction {
        // DAC -> .. -> pin: each node lists its upstream neighbour.
        RouteDirection::Output => (2..nodes.len()).map(|i| (nodes[i], nodes[i - 1])).collect(),
        // ADC <- .. <- pin: the converter lists the next node toward the pin.
        RouteDirection::Input => (1..nodes.len() - 1)
            .map(|i| (nodes[i], nodes[i + 1]))
            .collect(),
    }
}

/// Amplifier capability queries needed to wire `routes`: `(node, parameter, target)`.
fn amp_queries(codec: &Codec, routes: &[&Route]) -> Vec<(NodeId, Parameter, NodeId)> {
    let mut queries = Vec::new();
    for route in routes {
        let fg = route.function_group();
        for &nid in &route.nodes[1..] {
            let Some(node) = codec.node(nid) else {
                continue;
            };
            let target = if node.caps.contains(WidgetCaps::AMP_OVERRIDE) {
                nid
            } else {
                fg
            };
            if node.caps.contains(WidgetCaps::OUT_AMP) {
                queries.push((nid, Parameter::OutputAmpCaps, target));
            }
            if node.caps.contains(WidgetCaps::IN_AMP) {
                queries.push((nid, Parameter::InputAmpCaps, target));
            }
        }
    }
    queries
}

/// Verbs that bind `route` to `stream` for channel pair `pair`.
fn wiring_verbs(
    codec: &Codec,
    route: &Route,
    stream: u8,
    pair: usize,
    format: &StreamFormat,
    amp_offsets: &HashMap<(NodeId, bool), u8>,
) -> Vec<Command> {
    let addr = codec.address();
    let mut verbs = Vec::new();

    let remaining = usize::from(format.channels).saturating_sub(pair * 2);
    let pair_format = StreamFormat {
        channels: remaining.min(2) as u8,
        ..*format
    };
    let converter = route.converter();
    verbs.push(Command::long(
        addr,
        converter,
        VERB4_SET_CONVERTER_FORMAT,
        pair_format.encode(),
    ));
    verbs.push(Command::new(
        addr,
        converter,
        VERB_SET_STREAM_CHANNEL,
        stream_channel_payload(stream, (pair * 2) as u8),
    ));

    for (sink, source) in route_links(route) {
        let Some(node) = codec.node(sink) else {
            continue;
        };
        let Some(index) = node.connection_index(source) else {
            continue;
        };
        if node.caps.contains(WidgetCaps::IN_AMP) {
            let gain = amp_offsets.get(&(sink, false)).copied().unwrap_or(0);
            verbs.push(Command::long(
                addr,
                sink,
                VERB4_SET_AMP_GAIN_MUTE,
                amp_unmute_payload(false, index as u8, gain),
            ));
        }
        if node.kind != NodeKind::Mixer && node.connections.len() > 1 {
            verbs.push(Command::new(
                addr,
                sink,
                VERB_SET_CONNECTION_SELECT,
                index as u8,
            ));
        }
    }

    for &nid in &route.nodes[1..] {
        let Some(node) = codec.node(nid) else {
            continue;
        };
        if node.caps.contains(WidgetCaps::OUT_AMP) {
            let gain = amp_offsets.get(&(nid, true)).copied().unwrap_or(0);
            verbs.push(Command::long(
                addr,
                nid,
                VERB4_SET_AMP_GAIN_MUTE,
                amp_unmute_payload(true, 0, gain),
            ));
        }
    }

    let pin_ctl = pin_control(codec.node(route.pin()), route.direction);
    verbs.push(Command::new(
        addr,
        route.pin(),
        VERB_SET_PIN_WIDGET_CONTROL,
        pin_ctl,
    ));
    verbs
}

fn pin_control(pin: Option<&Node>, direction: RouteDirection) -> u8 {
    match direction {
        RouteDirection::Input => PIN_CTL_IN_EN,
        RouteDirection::Output => {
            let headphone = pin.is_some_and(|p| p.pin_caps.contains(PinCaps::HEADPHONE_DRIVE));
            if headphone {
                PIN_CTL_OUT_EN | PIN_CTL_HP_EN
            } else {
                PIN_CTL_OUT_EN
            }
        }
    }
}

/// Bytes transferred at `byte_rate` over `elapsed`.
pub fn bytes_after(elapsed: Duration, byte_rate: u64) -> u64 {
    let bytes = elapsed.as_nanos() * u128::from(byte_rate) / 1_000_000_000;
    u64::try_from(bytes).unwrap_or(u64::MAX)
}

/// Absolute position congruent to `lpib` modulo `cbl` nearest to `expected`, never below
/// `floor`.
pub fn unwrap_position(lpib: u32, cbl: u32, expected: u64, floor: u64) -> u64 {
    let cbl = u64::from(cbl.max(1));
    let lpib = u64::from(lpib) % cbl;
    let below = (expected.saturating_sub(lpib) / cbl) * cbl + lpib;
    let above = below + cbl;
    let mut abs = if expected.abs_diff(below) <= above.abs_diff(expected) {
        below
    } else {
        above
    };
    while abs < floor {
        abs += cbl;
    }
    abs
}

/// Distance between two positions in a ring of `cbl` bytes.
pub fn circular_distance(a: u32, b: u32, cbl: u32) -> u32 {
    let d = a.abs_diff(b);
    d.min(cbl.saturating_sub(d))
}

/// Whether any IOC boundary (offsets in `1..=cbl`, repeating every `cbl`) lies in `(lo, hi]`.
pub fn boundary_in(boundaries: &[u32], cbl: u32, lo: i128, hi: i128) -> bool {
    if boundaries.is_empty() || cbl == 0 || hi <= lo {
        return false;
    }
    let cbl = i128::from(cbl);
    let first_cycle = lo.div_euclid(cbl) - 1;
    let last_cycle = hi.div_euclid(cbl);
    (first_cycle..=last_cycle).any(|cycle| {
        boundaries.iter().any(|&b| {
            let abs = cycle * cbl + i128::from(b);
            abs > lo && abs <= hi
        })
    })
}

fn next_boundary(boundaries: &[u32], cbl: u32, after: u64) -> Option<u64> {
    let cbl64 = u64::from(cbl);
    if boundaries.is_empty() || cbl == 0 {
        return None;
    }
    let cycle = after / cbl64;
    (cycle..=cycle + 1)
        .flat_map(|c| boundaries.iter().map(move |&b| c * cbl64 + u64::from(b)))
        .filter(|&abs| abs > after)
        .min()
}

impl Controller {
    pub fn stream(&self, number: u8) -> Option<&Stream> {
        self.streams.stream(number)
    }

    pub fn streams(&self) -> impl Iterator<Item = &Stream> {
        self.streams.streams()
    }

    /// Reserve routes and an engine, build the BDL, program the engine and wire the codec.
    /// Returns the stream number. Nothing stays reserved when this fails.
    pub fn program_stream(&mut self, request: &StreamRequest) -> Result<u8> {
        request.format.validate()?;
        let codec = self
            .codec(request.codec)
            .ok_or(HdaError::NoSuchCodec(request.codec))?;
        if codec.state() != DiscoveryState::Ready {
            return Err(HdaError::TopologyState {
                codec: request.codec,
                expected: "ready",
            });
        }

        let number = self.streams.allocate_number()?;
        match self.program_stream_inner(request, number) {
            Ok(stream) => {
                tracing::debug!(
                    stream = number,
                    engine = stream.engine,
                    codec = stream.codec,
                    routes = ?stream.routes,
                    "stream programmed"
                );
                self.streams.streams.insert(number, stream);
                Ok(number)
            }
            Err(err) => {
                if let Ok(codec) = self.codec_mut(request.codec) {
                    codec.release_routes(Owner::from(number));
                }
                if let Some(engine) = self
                    .streams
                    .engines
                    .iter_mut()
                    .find(|e| e.stream() == Some(number))
                {
                    engine.unbind();
                }
                self.streams.free_number(number);
                Err(err)
            }
        }
    }

    fn program_stream_inner(&mut self, request: &StreamRequest, number: u8) -> Result<Stream> {
        let owner = Owner::from(number);
        let engine = self.streams.pick_engine(request.direction)?;

        let mut routes = Vec::with_capacity(request.format.channel_pairs());
        for pair in 0..request.format.channel_pairs() {
            let pin = if pair == 0 { request.pin } else { None };
            let codec = self.codec_mut(request.codec)?;
            routes.push(codec.find_route(request.direction, &request.format, pin, Some(owner))?);
        }

        let bdl = BufferDescriptorList::build(self.platform.mem.as_ref(), &request.segments)?;
        let program = EngineProgram {
            stream: number,
            direction: request.direction,
            traffic_priority: self.config.traffic_priority,
            stripe_lines: self.config.stripe_lines.min(self.caps().sdo_lines),
            cyclic_buffer_length: bdl.cyclic_buffer_length(),
            last_valid_index: bdl.last_valid_index(),
            format: request.format.encode(),
            bdl_base: bdl.base(),
            ioc_interrupt: self.config.ioc_interrupts,
            fifo_error_interrupt: self.config.fifo_error_interrupts,
            descriptor_error_interrupt: self.config.descriptor_error_interrupts,
        };
        self.streams.engine_mut(engine)?.program(&program)?;

        self.wire_routes(request.codec, &routes, number, &request.format)?;

        Ok(Stream {
            number,
            engine,
            codec: request.codec,
            direction: request.direction,
            format: request.format,
            routes,
            bdl,
            program,
            state: StreamState::Programmed,
            stats: StreamStats::default(),
        })
    }

    fn wire_routes(
        &mut self,
        address: u8,
        indices: &[usize],
        stream: u8,
        format: &StreamFormat,
    ) -> Result<()> {
        let codec = self
            .codecs
            .get(usize::from(address))
            .and_then(Option::as_ref)
            .ok_or(HdaError::NoSuchCodec(address))?;
        let rings = &mut self.rings;
        let routes: Vec<&Route> = indices.iter().filter_map(|&i| codec.route(i)).collect();

        let queries = amp_queries(codec, &routes);
        let cmds: Vec<Command> = queries
            .iter()
            .map(|&(_, param, target)| Command::get_parameter(address, target, param))
            .collect();
        let caps = rings.send_chunked(&cmds)?;
        let amp_offsets: HashMap<(NodeId, bool), u8> = queries
            .iter()
            .zip(caps)
            .map(|(&(nid, param, _), word)| {
                ((nid, param == Parameter::OutputAmpCaps), (word & 0x7F) as u8)
            })
            .collect();

        let verbs: Vec<Command> = routes
            .iter()
            .enumerate()
            .flat_map(|(pair, route)| wiring_verbs(codec, route, stream, pair, format, &amp_offsets))
            .collect();
        tracing::debug!(codec = address, stream, verbs = verbs.len(), "wiring routes");
        rings.send_chunked(&verbs)?;
        Ok(())
    }

    /// Start (or restart after a stop) a programmed stream.
    pub fn start_stream(&mut self, number: u8) -> Result<()> {
        let (engine, state, program) = {
            let stream = self.streams.stream_mut(number)?;
            (stream.engine, stream.state, stream.program)
        };
        match state {
            StreamState::Running => {
                return Err(HdaError::misuse(HdaError::InvalidOperation(
                    "stream is already running",
                )))
            }
            // A restart begins from the top of the buffer.
            StreamState::Stopped => self.streams.engine_mut(engine)?.program(&program)?,
            StreamState::Programmed => {}
        }

        self.status.clear_stream(engine, StreamStatus::all());
        self.streams.engine_mut(engine)?.start()?;
        let now = self.platform.clock.now();

        let stream = self.streams.stream_mut(number)?;
        stream.state = StreamState::Running;
        stream.stats = StreamStats {
            started_at: Some(now),
            next_ioc: next_boundary(
                &stream.bdl.ioc_boundaries(),
                stream.bdl.cyclic_buffer_length(),
                0,
            ),
            ..StreamStats::default()
        };
        tracing::debug!(stream = number, engine, "stream started");
        Ok(())
    }

    /// Compare the engine's position and buffer-complete flag with what elapsed time implies.
    pub fn verify_position(&mut self, number: u8) -> Result<PositionReport> {
        let now = self.platform.clock.now();
        let tolerance = self.config.position_tolerance();
        let stream = self
            .streams
            .stream(number)
            .ok_or(HdaError::InvalidOperation("no such stream"))?;
        if stream.state != StreamState::Running {
            return Err(HdaError::misuse(HdaError::InvalidOperation(
                "stream is not running",
            )));
        }
        let engine_index = stream.engine;
        let engine = &self.streams.engines[engine_index];

        // Status first: a boundary crossed after the LPIB read must not count.
        let status = self.status.stream_status(engine_index);
        if status.contains(StreamStatus::DESCRIPTOR_ERROR) {
            tracing::error!(stream = number, engine = engine_index, "descriptor error");
            return Err(HdaError::DescriptorError {
                engine: engine_index,
            });
        }
        if status.contains(StreamStatus::FIFO_ERROR) {
            tracing::error!(stream = number, engine = engine_index, "FIFO error");
            return Err(HdaError::FifoError {
                engine: engine_index,
            });
        }
        let lpib = engine.position();
        let fifo = u64::from(engine.fifo_size()) + 1;

        let cbl = stream.bdl.cyclic_buffer_length();
        let byte_rate = stream.format.byte_rate();
        let elapsed = now.saturating_sub(stream.stats.started_at.unwrap_or(now));
        let expected_abs = bytes_after(elapsed, byte_rate);
        let expected = (expected_abs % u64::from(cbl.max(1))) as u32;
        let allowed = u32::try_from(bytes_after(tolerance, byte_rate)).unwrap_or(u32::MAX);
        let drift = circular_distance(expected, lpib, cbl);
        if drift > allowed {
            tracing::error!(
                stream = number,
                expected,
                lpib,
                allowed,
                "stream position drifted"
            );
            return Err(HdaError::PositionDrift {
                stream: number,
                expected,
                actual: lpib,
                tolerance: allowed,
            });
        }

        let last = stream.stats.last_position;
        let abs = unwrap_position(lpib, cbl, expected_abs, last);
        let boundaries = stream.bdl.ioc_boundaries();
        let (lo, hi, margin) = (i128::from(last), i128::from(abs), i128::from(fifo));
        let definite = boundary_in(&boundaries, cbl, lo + margin, hi - margin);
        // Nothing precedes the start of the stream, so the buffer start is never a crossing.
        let possible = boundary_in(&boundaries, cbl, (lo - margin).max(0), hi + margin);
        let complete = status.contains(StreamStatus::BUFFER_COMPLETE);
        if definite && !complete {
            return Err(HdaError::IocMismatch {
                stream: number,
                position: abs,
                detail: "boundary crossed without buffer completion",
            });
        }
        if complete && !possible {
            return Err(HdaError::IocMismatch {
                stream: number,
                position: abs,
                detail: "buffer completion without a crossed boundary",
            });
        }
        if complete {
            self.status
                .clear_stream(engine_index, StreamStatus::BUFFER_COMPLETE);
        }

        let stream = self.streams.stream_mut(number)?;
        stream.stats.last_position = abs;
        stream.stats.loops = abs / u64::from(cbl.max(1));
        stream.stats.next_ioc = next_boundary(&boundaries, cbl, abs);
        stream.stats.checks += 1;
        tracing::trace!(stream = number, lpib, expected, abs, complete, "position verified");
        Ok(PositionReport {
            position: lpib,
            expected,
            absolute: abs,
            buffer_complete: complete,
        })
    }

    pub fn stop_stream(&mut self, number: u8) -> Result<()> {
        let (engine, state) = {
            let stream = self.streams.stream_mut(number)?;
            (stream.engine, stream.state)
        };
        if state != StreamState::Running {
            return Ok(());
        }
        self.streams.engine_mut(engine)?.stop()?;
        self.streams.stream_mut(number)?.state = StreamState::Stopped;
        tracing::debug!(stream = number, engine, "stream stopped");
        Ok(())
    }

    /// Stop the stream, detach its converters, release its routes, engine and number.
    pub fn release_stream(&mut self, number: u8) -> Result<()> {
        self.stop_stream(number)?;
        let Some(stream) = self.streams.streams.remove(&number) else {
            return Err(HdaError::InvalidOperation("no such stream"));
        };

        let converters: Vec<Command> = self
            .codec(stream.codec)
            .map(|codec| {
                stream
                    .routes
                    .iter()
                    .filter_map(|&i| codec.route(i))
                    .map(|route| {
                        Command::new(
                            stream.codec,
                            route.converter(),
                            VERB_SET_STREAM_CHANNEL,
                            0,
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();
        let detached = self.rings.send_chunked(&converters);

        let freed = self
            .codec_mut(stream.codec)
            .map(|codec| codec.release_routes(stream.owner()))
            .unwrap_or(0);
        let engine = self.streams.engine_mut(stream.engine)?;
        let reset = engine.reset();
        engine.unbind();
        self.streams.free_number(number);
        tracing::debug!(stream = number, freed, "stream released");
        detached?;
        reset
    }
}
