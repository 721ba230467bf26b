use std::fmt;

use super::error::StageError;
use super::event::EventRef;

/// What a node tells the pipeline after looking at an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Continue,
    /// Not interesting to this node; not an error
    SkipEvent,
    /// Not now. The pipeline keeps the event and offers it again on the next cycle
    BusyRetry,
    /// Too busy for this one event; it is dropped
    BusySkip,
    /// No new work for this node or anything feeding it. Work already in flight still drains
    Stop,
}

/// Run-control messages travelling in-band with the events. They reach the addressed node
/// and then every node downstream of it, in order with the events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    SourceConnected { id: u32, name: String },
    SourceDisconnected { id: u32 },
    StartRun(u32),
    StopRun,
}

/// A run-ending error raised inside a node, reported out-of-band
#[derive(Debug)]
pub struct FatalError {
    pub node: String,
    pub error: StageError,
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node {} failed: {}", self.node, self.error)
    }
}

/// Handed to a node for the duration of one call. Collects the events the node forwards
/// downstream and carries the fatal error channel.
pub struct Context<'a> {
    node: &'a str,
    forwarded: Vec<EventRef>,
    fatal_tx: &'a flume::Sender<FatalError>,
}

impl<'a> Context<'a> {
    pub fn new(node: &'a str, fatal_tx: &'a flume::Sender<FatalError>) -> Self {
        Self {
            node,
            forwarded: Vec::new(),
            fatal_tx,
        }
    }

    pub fn node(&self) -> &str {
        self.node
    }

    /// Send an event to every downstream node whose edge filter accepts it
    pub fn forward(&mut self, event: EventRef) {
        self.forwarded.push(event);
    }

    /// Report an error that ends the current run
    pub fn fatal(&mut self, error: impl Into<StageError>) {
        let error = error.into();
        spdlog::error!("Node {} raised a fatal error: {error}", self.node);
        let report = FatalError {
            node: self.node.to_string(),
            error,
        };
        if self.fatal_tx.send(report).is_err() {
            spdlog::warn!("Nobody is listening for fatal errors from {}", self.node);
        }
    }

    pub fn take_forwarded(&mut self) -> Vec<EventRef> {
        std::mem::take(&mut self.forwarded)
    }
}

/// A processing stage of the pipeline.
///
/// The pipeline guarantees that a node is never entered by two threads at once, so a node
/// keeps its state in plain fields.
pub trait Node: Send {
    fn name(&self) -> &str;

    fn process(&mut self, event: EventRef, ctx: &mut Context) -> Outcome;

    fn control(&mut self, _control: &Control, _ctx: &mut Context) {}

    /// Called on every cycle while `has_pending` is true
    fn flush(&mut self, _ctx: &mut Context) {}

    /// True if the node holds events it still has to deliver
    fn has_pending(&self) -> bool {
        false
    }
}

impl<N: Node + ?Sized> Node for Box<N> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn process(&mut self, event: EventRef, ctx: &mut Context) -> Outcome {
        (**self).process(event, ctx)
    }

    fn control(&mut self, control: &Control, ctx: &mut Context) {
        (**self).control(control, ctx)
    }

    fn flush(&mut self, ctx: &mut Context) {
        (**self).flush(ctx)
    }

    fn has_pending(&self) -> bool {
        (**self).has_pending()
    }
}
