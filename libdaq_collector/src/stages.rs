use std::io::ErrorKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::error::SinkError;
use super::event::EventRef;
use super::file_writer::EventSink;
use super::graph::KindFilter;
use super::node::{Context, Control, Node, Outcome};

/// Passes merged events whose trigger number lies in `[first, last]`. Begin and end of
/// run always pass; events without a trigger number are skipped.
#[derive(Debug, Clone)]
pub struct TriggerFilter {
    name: String,
    first: u32,
    last: u32,
}

impl TriggerFilter {
    pub fn new(name: &str, first: u32, last: u32) -> Self {
        Self {
            name: name.to_string(),
            first,
            last,
        }
    }
}

impl Node for TriggerFilter {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&mut self, event: EventRef, ctx: &mut Context) -> Outcome {
        let pass = event.is_framing()
            || event
                .trigger_number()
                .is_some_and(|trigger| trigger >= self.first && trigger <= self.last);
        if pass {
            ctx.forward(event);
            Outcome::Continue
        } else {
            Outcome::SkipEvent
        }
    }
}

/// Passes events of the selected kinds. A merged event also passes when one of its
/// sub-events is of a selected kind.
#[derive(Debug, Clone)]
pub struct KindFilterStage {
    name: String,
    filter: KindFilter,
}

impl KindFilterStage {
    pub fn new(name: &str, filter: KindFilter) -> Self {
        Self {
            name: name.to_string(),
            filter,
        }
    }
}

impl Node for KindFilterStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&mut self, event: EventRef, ctx: &mut Context) -> Outcome {
        let pass = event.is_framing()
            || self.filter.accepts(event.kind())
            || event
                .sub_events()
                .iter()
                .any(|sub_event| self.filter.accepts(sub_event.kind()));
        if pass {
            ctx.forward(event);
            Outcome::Continue
        } else {
            Outcome::SkipEvent
        }
    }
}

/// Keeps every n-th data event of a run
#[derive(Debug, Clone)]
pub struct Prescale {
    name: String,
    factor: u64,
    seen: u64,
}

impl Prescale {
    pub fn new(name: &str, factor: u64) -> Self {
        Self {
            name: name.to_string(),
            factor: factor.max(1),
            seen: 0,
        }
    }
}

impl Node for Prescale {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&mut self, event: EventRef, ctx: &mut Context) -> Outcome {
        if event.is_framing() {
            if event.is_bore() {
                self.seen = 0;
            }
            ctx.forward(event);
            return Outcome::Continue;
        }
        let keep = self.seen % self.factor == 0;
        self.seen += 1;
        if keep {
            ctx.forward(event);
            Outcome::Continue
        } else {
            Outcome::SkipEvent
        }
    }
}

/// End of the chain: hands every event to an [`EventSink`]
pub struct SinkNode {
    name: String,
    sink: Box<dyn EventSink>,
    bytes_written: Arc<AtomicU64>,
}

impl SinkNode {
    pub fn new(name: &str, sink: Box<dyn EventSink>) -> Self {
        Self {
            name: name.to_string(),
            sink,
            bytes_written: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Count written bytes into a shared counter
    pub fn with_counter(mut self, bytes_written: Arc<AtomicU64>) -> Self {
        self.bytes_written = bytes_written;
        self
    }
}

impl Node for SinkNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&mut self, event: EventRef, ctx: &mut Context) -> Outcome {
        match self.sink.write(&event) {
            Ok(written) => {
                self.bytes_written
                    .fetch_add(written as u64, Ordering::Relaxed);
                Outcome::Continue
            }
            Err(SinkError::IOError(e)) if e.kind() == ErrorKind::WouldBlock => Outcome::BusyRetry,
            Err(e) => {
                ctx.fatal(e);
                Outcome::SkipEvent
            }
        }
    }

    fn control(&mut self, control: &Control, _ctx: &mut Context) {
        if *control == Control::StopRun {
            spdlog::debug!("{}: stop requested; the file closes with the end-of-run event", self.name);
        }
    }
}

impl Drop for SinkNode {
    fn drop(&mut self) {
        if let Err(e) = self.sink.close() {
            spdlog::error!("{}: failed to close sink: {e}", self.name);
        }
    }
}
