use std::path::PathBuf;
use thiserror::Error;

use super::collector_status::CollectorStatus;
use super::constants::*;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventError {
    #[error("Invalid timestamp interval [{0}, {1}); the begin must be strictly less than the end")]
    BadInterval(u64, u64),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Connection failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Connection closed by peer")]
    ConnectionClosed,
    #[error("Frame of size {0} exceeds the limit of {max} bytes", max=MAX_FRAME_SIZE)]
    FrameTooLarge(u32),
    #[error("Frame of size {0} is too small to hold a frame type")]
    EmptyFrame(u32),
    #[error("Unknown frame type {0}; expected {text} or {event}", text=FRAME_TYPE_TEXT, event=FRAME_TYPE_EVENT)]
    UnknownFrameType(u8),
    #[error("Expected a frame of type {0} but received type {1}")]
    UnexpectedFrame(u8, u8),
    #[error("Event payload ended early while reading {0}")]
    Truncated(&'static str),
    #[error("Event payload has {0} unread trailing bytes")]
    TrailingBytes(usize),
    #[error("String field is not valid UTF-8: {0}")]
    BadUtf8(#[from] std::string::FromUtf8Error),
    #[error("Sub-events nested deeper than {max} levels", max=MAX_SUB_EVENT_DEPTH)]
    TooDeep,
    #[error("Malformed identification line: {0:?}")]
    BadHandshake(String),
    #[error("A producer named {0} is already connected")]
    DuplicateProducer(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("Source queue is full (capacity {0}) and rejects new events")]
    Overflow(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergerError {
    #[error("Ordering violation from source {source_id}: event begins at {begin}, before the last closed window end {last_end}")]
    BeforeLastEnd {
        source_id: u32,
        begin: u64,
        last_end: u64,
    },
    #[error("Ordering violation from source {source_id}: event begins at {begin}, overlapping its previous event ending at {previous_end}")]
    OverlapsPrevious {
        source_id: u32,
        begin: u64,
        previous_end: u64,
    },
    #[error("Ordering violation from source {source_id}: trigger {trigger} does not follow trigger {previous}")]
    TriggerOutOfOrder {
        source_id: u32,
        trigger: u32,
        previous: u32,
    },
    #[error("Ordering violation from source {0}: {1}")]
    BadInterval(u32, EventError),
    #[error("Malformed event from source {0}: {1}")]
    MalformedEvent(u32, &'static str),
    #[error("Event from source {0} which never connected")]
    UnknownSource(u32),
    #[error("Source {0} is already connected")]
    DuplicateSource(u32),
    #[error("Source {0} queue overflow: {1}")]
    QueueOverflow(u32, QueueError),
    #[error("Run {0} was aborted; events are refused until a new run starts")]
    RunAborted(u32),
    #[error("Event from source {0} while no run is open")]
    NotRunning(u32),
    #[error("Event from source {0} after its end-of-run event")]
    Retired(u32),
}

impl MergerError {
    /// Fatal errors abort the current run; everything else is handled locally
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::BeforeLastEnd { .. }
                | Self::OverlapsPrevious { .. }
                | Self::TriggerOutOfOrder { .. }
                | Self::BadInterval(..)
                | Self::MalformedEvent(..)
        )
    }
}

/// Errors a pipeline node reports out-of-band as fatal
#[derive(Debug, Error)]
pub enum StageError {
    #[error("{0}")]
    MergerError(#[from] MergerError),
    #[error("{0}")]
    SinkError(#[from] SinkError),
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Node id {0} does not exist in the graph")]
    UnknownNode(usize),
    #[error("Node {0} cannot be linked to itself")]
    SelfLink(String),
    #[error("The graph contains a cycle through node {0}")]
    Cycle(String),
    #[error("Failed to spawn hub thread for node {0}: {1}")]
    SpawnFailed(String, std::io::Error),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Node {0} has stopped and admits no new work")]
    Stopped(String),
    #[error("The dispatch queue of hub {0} is closed")]
    Disconnected(String),
    #[error("Node {0} is not a hub and has no dispatch queue")]
    NotAHub(String),
    #[error("Node {0} is not an inline root or its injector was already taken")]
    NoInjector(String),
    #[error("Hub thread {0} panicked")]
    HubPanicked(String),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("No stage kind named {0} is registered")]
    UnknownStageKind(String),
    #[error("Stage {stage} has an invalid parameter {param}: {reason}")]
    BadParam {
        stage: String,
        param: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("Empty command line")]
    Empty,
    #[error("Unknown command verb {0}")]
    UnknownVerb(String),
    #[error("Command {0} requires a parameter")]
    MissingParameter(&'static str),
    #[error("Command {0} has an invalid parameter {1:?}")]
    BadParameter(&'static str, String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Config field {0} is invalid: {1}")]
    InvalidValue(&'static str, String),
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Sink failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Sink received data for run {0} before its begin-of-run event")]
    NoOpenRun(u32),
    #[error("Sink failed due to config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Sink failed due to protocol error: {0}")]
    ProtocolError(#[from] ProtocolError),
}

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("Collector failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Collector failed due to graph error: {0}")]
    GraphError(#[from] GraphError),
    #[error("Collector failed due to pipeline error: {0}")]
    PipelineError(#[from] PipelineError),
    #[error("Collector failed due to registry error: {0}")]
    RegistryError(#[from] RegistryError),
    #[error("Collector failed due to configuration error: {0}")]
    ConfigError(#[from] ConfigError),
}

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("Processor failed due to Collector error: {0}")]
    CollectorError(#[from] CollectorError),
    #[error("Processor failed due to Config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Processor failed due to Send error: {0}")]
    SendError(#[from] std::sync::mpsc::SendError<CollectorStatus>),
}
