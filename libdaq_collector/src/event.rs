use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::error::EventError;

/// Shared handle to a published (and therefore immutable) Event.
///
/// Merged events hold clones of these handles as their sub-events, so one original can be
/// referenced by several composites without copying its payload.
pub type EventRef = Arc<Event>;

bitflags::bitflags! {
    /// Independent per-event flags. TRIGGER and TIMESTAMP mirror whether the optional
    /// trigger number / timestamp fields are present.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EventFlags: u32 {
        const BORE = 0x0001;
        const EORE = 0x0002;
        const FAKE = 0x0004;
        const PACKET = 0x0008;
        const TRIGGER = 0x0010;
        const TIMESTAMP = 0x0020;
    }
}

/// The type tag of an Event. Per-edge filters in the node graph select on this.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    Raw,
    Sync,
    Trigger,
    Wrapper,
    Other(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Raw => "raw",
            Self::Sync => "sync",
            Self::Trigger => "trigger",
            Self::Wrapper => "wrapper",
            Self::Other(name) => name,
        }
    }
}

impl From<&str> for EventKind {
    fn from(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "raw" => Self::Raw,
            "sync" => Self::Sync,
            "trigger" => Self::Trigger,
            "wrapper" => Self::Wrapper,
            _ => Self::Other(s.to_string()),
        }
    }
}

impl From<String> for EventKind {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Half-open timestamp interval `[begin, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Interval {
    pub begin: u64,
    pub end: u64,
}

impl Interval {
    /// Create a checked interval; `begin` must be strictly less than `end`
    pub fn new(begin: u64, end: u64) -> Result<Self, EventError> {
        let interval = Self { begin, end };
        interval.validate()?;
        Ok(interval)
    }

    pub fn validate(&self) -> Result<(), EventError> {
        if self.begin < self.end {
            Ok(())
        } else {
            Err(EventError::BadInterval(self.begin, self.end))
        }
    }

    /// True if the two half-open intervals share at least one point
    pub fn overlaps(&self, begin: u64, end: u64) -> bool {
        self.begin < end && begin < self.end
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.begin, self.end)
    }
}

/// A named, opaque binary block of payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub name: String,
    pub data: Vec<u8>,
}

/// The unit of data moving through the collector.
///
/// Events are assembled with the `with_*` builder methods and published by wrapping them
/// in an [`EventRef`]. A merge never mutates its inputs; it creates a new Event that holds
/// them as sub-events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    kind: EventKind,
    source_id: u32,
    run_number: u32,
    event_number: u32,
    trigger_number: Option<u32>,
    timestamp: Option<Interval>,
    flags: EventFlags,
    tags: BTreeMap<String, String>,
    blocks: Vec<Block>,
    sub_events: Vec<EventRef>,
}

impl Event {
    pub fn new(kind: EventKind, source_id: u32, run_number: u32) -> Self {
        Self {
            kind,
            source_id,
            run_number,
            event_number: 0,
            trigger_number: None,
            timestamp: None,
            flags: EventFlags::empty(),
            tags: BTreeMap::new(),
            blocks: Vec::new(),
            sub_events: Vec::new(),
        }
    }

    /// Begin-of-run marker for a source
    pub fn bore(kind: EventKind, source_id: u32, run_number: u32) -> Self {
        Self::new(kind, source_id, run_number).with_flags(EventFlags::BORE)
    }

    /// End-of-run marker for a source
    pub fn eore(kind: EventKind, source_id: u32, run_number: u32) -> Self {
        Self::new(kind, source_id, run_number).with_flags(EventFlags::EORE)
    }

    pub fn into_ref(self) -> EventRef {
        Arc::new(self)
    }

    pub fn with_source(mut self, source_id: u32) -> Self {
        self.source_id = source_id;
        self
    }

    pub fn with_run(mut self, run_number: u32) -> Self {
        self.run_number = run_number;
        self
    }

    pub fn with_event_number(mut self, event_number: u32) -> Self {
        self.event_number = event_number;
        self
    }

    pub fn with_trigger(mut self, trigger_number: u32) -> Self {
        self.trigger_number = Some(trigger_number);
        self.flags.insert(EventFlags::TRIGGER);
        self
    }

    pub fn with_timestamp(mut self, interval: Interval) -> Self {
        self.timestamp = Some(interval);
        self.flags.insert(EventFlags::TIMESTAMP);
        self
    }

    /// Set framing/marker flags. TRIGGER and TIMESTAMP are ignored here; they follow the
    /// presence of the corresponding fields.
    pub fn with_flags(mut self, flags: EventFlags) -> Self {
        let derived = EventFlags::TRIGGER | EventFlags::TIMESTAMP;
        self.flags.insert(flags.difference(derived));
        self
    }

    pub fn with_tag(mut self, key: &str, value: &str) -> Self {
        self.tags.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_block(mut self, name: &str, data: Vec<u8>) -> Self {
        self.blocks.push(Block {
            name: name.to_string(),
            data,
        });
        self
    }

    pub fn with_sub_event(mut self, sub_event: EventRef) -> Self {
        self.sub_events.push(sub_event);
        self
    }

    pub(crate) fn push_sub_event(&mut self, sub_event: EventRef) {
        self.sub_events.push(sub_event);
    }

    pub fn kind(&self) -> &EventKind {
        &self.kind
    }

    pub fn source_id(&self) -> u32 {
        self.source_id
    }

    pub fn run_number(&self) -> u32 {
        self.run_number
    }

    pub fn event_number(&self) -> u32 {
        self.event_number
    }

    pub fn trigger_number(&self) -> Option<u32> {
        self.trigger_number
    }

    pub fn timestamp(&self) -> Option<Interval> {
        self.timestamp
    }

    pub fn flags(&self) -> EventFlags {
        self.flags
    }

    pub fn is_bore(&self) -> bool {
        self.flags.contains(EventFlags::BORE)
    }

    pub fn is_eore(&self) -> bool {
        self.flags.contains(EventFlags::EORE)
    }

    pub fn is_fake(&self) -> bool {
        self.flags.contains(EventFlags::FAKE)
    }

    pub fn is_packet(&self) -> bool {
        self.flags.contains(EventFlags::PACKET)
    }

    /// BORE and EORE are framing signals, not data
    pub fn is_framing(&self) -> bool {
        self.flags.intersects(EventFlags::BORE | EventFlags::EORE)
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(|v| v.as_str())
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn block(&self, name: &str) -> Option<&[u8]> {
        self.blocks
            .iter()
            .find(|b| b.name == name)
            .map(|b| b.data.as_slice())
    }

    pub fn sub_events(&self) -> &[EventRef] {
        &self.sub_events
    }

    /// Check the timestamp invariant for events that were not built through
    /// [`Interval::new`] (e.g. decoded from the wire).
    pub fn validate_timestamp(&self) -> Result<(), EventError> {
        match &self.timestamp {
            Some(ts) => ts.validate(),
            None => Ok(()),
        }
    }

    fn write_indented(&self, f: &mut fmt::Formatter<'_>, offset: usize) -> fmt::Result {
        let pad = " ".repeat(offset);
        writeln!(
            f,
            "{pad}Event {} source={} run={} event={} flags={:#06x}",
            self.kind,
            self.source_id,
            self.run_number,
            self.event_number,
            self.flags.bits()
        )?;
        if let Some(trigger) = self.trigger_number {
            writeln!(f, "{pad}  trigger={trigger}")?;
        }
        if let Some(ts) = &self.timestamp {
            writeln!(f, "{pad}  timestamp={ts}")?;
        }
        for (key, value) in &self.tags {
            writeln!(f, "{pad}  tag {key}={value}")?;
        }
        for block in &self.blocks {
            writeln!(f, "{pad}  block {} ({} bytes)", block.name, block.data.len())?;
        }
        for sub_event in &self.sub_events {
            sub_event.write_indented(f, offset + 4)?;
        }
        Ok(())
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_indented(f, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_rejects_empty() {
        assert!(Interval::new(5, 10).is_ok());
        assert_eq!(Interval::new(10, 10), Err(EventError::BadInterval(10, 10)));
        assert_eq!(Interval::new(11, 10), Err(EventError::BadInterval(11, 10)));
    }

    #[test]
    fn test_half_open_overlap() {
        let ts = Interval::new(10, 20).unwrap();
        assert!(ts.overlaps(0, 11));
        assert!(!ts.overlaps(0, 10));
        assert!(!ts.overlaps(20, 30));
        assert!(ts.overlaps(19, 30));
    }

    #[test]
    fn test_derived_flags_follow_fields() {
        let ev = Event::new(EventKind::Raw, 1, 7)
            .with_flags(EventFlags::TRIGGER | EventFlags::FAKE)
            .with_timestamp(Interval::new(0, 4).unwrap());
        assert!(ev.is_fake());
        assert!(!ev.flags().contains(EventFlags::TRIGGER));
        assert!(ev.flags().contains(EventFlags::TIMESTAMP));
        let ev = ev.with_trigger(3);
        assert!(ev.flags().contains(EventFlags::TRIGGER));
        assert_eq!(ev.trigger_number(), Some(3));
    }

    #[test]
    fn test_kind_spelling() {
        assert_eq!(EventKind::from("SYNC"), EventKind::Sync);
        assert_eq!(EventKind::from("tlu"), EventKind::Other("tlu".to_string()));
        assert_eq!(String::from(EventKind::Wrapper), "wrapper");
    }

    #[test]
    fn test_sub_events_are_shared() {
        let original = Event::new(EventKind::Raw, 2, 1).with_block("adc", vec![1, 2, 3]).into_ref();
        let a = Event::new(EventKind::Sync, 0, 1).with_sub_event(original.clone());
        let b = Event::new(EventKind::Wrapper, 0, 1).with_sub_event(original.clone());
        assert!(Arc::ptr_eq(&a.sub_events()[0], &b.sub_events()[0]));
        assert_eq!(a.sub_events()[0].block("adc"), Some(&[1u8, 2, 3][..]));
        assert_eq!(Arc::strong_count(&original), 3);
    }
}
