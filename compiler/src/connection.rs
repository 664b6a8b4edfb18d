// connection.rs — Edges between ports
//
// A Connection is the materialized (source port, sink port) pair. The
// constructor normalizes argument order by port direction and refuses
// pairs that do not contain exactly one source and one sink. Per-edge
// parameters come from the platform's domain descriptors, keyed by the
// (source domain, sink domain) pair — not from the endpoint blocks.
//
// Preconditions: endpoints reference live blocks/ports in one flow graph.
// Postconditions: equality and ordering are by the endpoint pair.
// Failure modes: direction mismatch at construction; type/size mismatch
//                is checked during validate(), not here.
// Side effects: none.

use std::collections::BTreeMap;
use std::fmt;

use crate::block::BlockId;
use crate::port::{PortDirection, PortId};

// ── Endpoints ────────────────────────────────────────────────────────────

/// One end of a connection, addressed by arena indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Endpoint {
    pub block: BlockId,
    pub port: PortId,
}

impl Endpoint {
    pub fn new(block: BlockId, port: PortId) -> Self {
        Endpoint { block, port }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}:p{}", self.block.0, self.port.0)
    }
}

// ── Errors ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// Both endpoints are sources or both are sinks.
    DirectionMismatch {
        first: PortDirection,
        second: PortDirection,
    },
    /// Endpoint refers to a block or port that does not exist.
    DanglingEndpoint { endpoint: String },
    /// The pair is already connected.
    Duplicate,
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectError::DirectionMismatch { first, second } => write!(
                f,
                "cannot connect {} to {}: need exactly one source and one sink",
                first.as_str(),
                second.as_str()
            ),
            ConnectError::DanglingEndpoint { endpoint } => {
                write!(f, "endpoint {} does not exist", endpoint)
            }
            ConnectError::Duplicate => write!(f, "connection already exists"),
        }
    }
}

impl std::error::Error for ConnectError {}

// ── Connection ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Connection {
    pub source: Endpoint,
    pub sink: Endpoint,
    /// Per-connection parameter bag (raw values), defined by the domain
    /// pair's descriptor. Empty for plain stream/message edges.
    pub params: BTreeMap<String, String>,
}

impl Connection {
    /// Build from two (endpoint, direction) pairs in either order.
    pub fn new(
        a: (Endpoint, PortDirection),
        b: (Endpoint, PortDirection),
    ) -> Result<Connection, ConnectError> {
        match (a.1, b.1) {
            (PortDirection::Source, PortDirection::Sink) => Ok(Connection {
                source: a.0,
                sink: b.0,
                params: BTreeMap::new(),
            }),
            (PortDirection::Sink, PortDirection::Source) => Ok(Connection {
                source: b.0,
                sink: a.0,
                params: BTreeMap::new(),
            }),
            (first, second) => Err(ConnectError::DirectionMismatch { first, second }),
        }
    }

    pub fn with_params(mut self, params: BTreeMap<String, String>) -> Self {
        self.params = params;
        self
    }

    /// True when this edge touches the given block.
    pub fn touches_block(&self, block: BlockId) -> bool {
        self.source.block == block || self.sink.block == block
    }

    /// True when this edge touches the given port.
    pub fn touches_port(&self, block: BlockId, port: PortId) -> bool {
        (self.source.block == block && self.source.port == port)
            || (self.sink.block == block && self.sink.port == port)
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source && self.sink == other.sink
    }
}

impl Eq for Connection {}

impl PartialOrd for Connection {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Connection {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.source, self.sink).cmp(&(other.source, other.sink))
    }
}

impl std::hash::Hash for Connection {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.source.hash(state);
        self.sink.hash(state);
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}→{}", self.source, self.sink)
    }
}
