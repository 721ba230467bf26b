use fxhash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::config::{MergeMode, MergerConfig};
use super::error::MergerError;
use super::event::{Event, EventFlags, EventRef};
use super::event_builder::EventBuilder;
use super::node::{Context, Control, Node, Outcome};
use super::source_queue::{OverflowPolicy, SourceQueue};
use super::timestamp_merger::TimestampMatch;
use super::trigger_merger::TriggerMatch;

/// Lifecycle of the run a merger is assembling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergerState {
    /// No run open. A begin-of-run event (or `start_run`) opens one
    #[default]
    Idle,
    Running,
    /// A fatal error ended the run. Everything is refused until a new run starts
    Aborted,
}

/// The bookkeeping a merger keeps for one connected producer
#[derive(Debug)]
pub struct SourceSlot {
    pub id: u32,
    pub name: String,
    pub queue: SourceQueue,
    pub connected: bool,
    /// The source sent its end-of-run event
    pub retired: bool,
    pub bore: Option<EventRef>,
    pub eore: Option<EventRef>,
    pub previous_trigger: Option<u32>,
    pub previous_end: Option<u64>,
}

impl SourceSlot {
    fn new(id: u32, name: &str, capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            id,
            name: name.to_string(),
            queue: SourceQueue::new(capacity, policy),
            connected: true,
            retired: false,
            bore: None,
            eore: None,
            previous_trigger: None,
            previous_end: None,
        }
    }

    fn reset(&mut self) {
        self.queue.clear();
        self.retired = false;
        self.bore = None;
        self.eore = None;
        self.previous_trigger = None;
        self.previous_end = None;
    }

    /// Still expected to produce data in this run
    pub fn is_live(&self) -> bool {
        self.connected && !self.retired
    }

    /// Takes part in merging: live, or finished but with events left to contribute
    pub fn is_active(&self) -> bool {
        self.is_live() || !self.queue.is_empty()
    }
}

/// The matching half of a stream merger. The shared [`Merger`] handles sources, framing
/// and the run lifecycle; a strategy decides which queued events belong together.
pub trait MatchStrategy: Send {
    fn mode(&self) -> MergeMode;

    /// Check an event against the ordering rules before it is queued
    fn check(&self, slot: &SourceSlot, event: &Event) -> Result<(), MergerError>;

    /// Account for an event that was queued on `slot`
    fn commit(&mut self, slot: &mut SourceSlot, event: &Event);

    /// Build every merged event that can be completed with what is queued
    fn drain(&mut self, slots: &mut [SourceSlot], builder: &mut EventBuilder) -> Vec<EventRef>;

    /// Forget all window state
    fn reset(&mut self);
}

/// The operations common to both merge modes
pub trait StreamMerger: Send {
    fn connect(&mut self, source_id: u32, name: &str) -> Result<(), MergerError>;

    /// Mark a source as gone. May complete merges (or the run) that were waiting on it.
    fn disconnect(&mut self, source_id: u32) -> Result<Vec<EventRef>, MergerError>;

    fn start_run(&mut self, run_number: u32);

    /// Queue an event for its source and return whatever merged events it completed
    fn push(&mut self, source_id: u32, event: EventRef) -> Result<Vec<EventRef>, MergerError>;

    fn state(&self) -> MergerState;

    fn run_number(&self) -> u32;

    fn mode(&self) -> MergeMode;

    /// Number of events waiting in source queues
    fn pending(&self) -> usize;
}

/// Stream merger generic over how events are matched
pub struct Merger<S: MatchStrategy> {
    strategy: S,
    slots: Vec<SourceSlot>,
    index: FxHashMap<u32, usize>,
    builder: EventBuilder,
    state: MergerState,
    bore_sent: bool,
    required: Vec<String>,
    queue_capacity: usize,
    overflow_policy: OverflowPolicy,
}

impl<S: MatchStrategy> Merger<S> {
    pub fn new(strategy: S, config: &MergerConfig, collector_id: u32) -> Self {
        Self {
            strategy,
            slots: Vec::new(),
            index: FxHashMap::default(),
            builder: EventBuilder::new(collector_id),
            state: MergerState::Idle,
            bore_sent: false,
            required: config.required_sources.clone(),
            queue_capacity: config.queue_capacity,
            overflow_policy: config.overflow_policy,
        }
    }

    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    fn slot_index(&self, source_id: u32) -> Result<usize, MergerError> {
        self.index
            .get(&source_id)
            .copied()
            .ok_or(MergerError::UnknownSource(source_id))
    }

    fn required_connected(&self) -> bool {
        self.required.iter().all(|name| {
            self.slots
                .iter()
                .any(|slot| slot.connected && &slot.name == name)
        })
    }

    fn abort(&mut self, error: MergerError) -> MergerError {
        spdlog::error!(
            "Aborting run {}: {error}",
            self.builder.run_number()
        );
        for slot in self.slots.iter_mut() {
            slot.queue.clear();
        }
        self.strategy.reset();
        self.state = MergerState::Aborted;
        error
    }

    fn accept_bore(&mut self, index: usize, event: EventRef) -> Vec<EventRef> {
        let run_number = self.builder.run_number();
        let slot = &mut self.slots[index];
        if slot.retired {
            spdlog::info!(
                "Source {} ({}) rejoined run {run_number} after ending it",
                slot.id,
                slot.name
            );
            slot.retired = false;
            slot.eore = None;
        } else if slot.bore.is_some() {
            spdlog::warn!(
                "Source {} sent a second begin-of-run event; ignoring it",
                slot.id
            );
            return Vec::new();
        } else if self.bore_sent {
            spdlog::info!(
                "Source {} ({}) joined run {run_number} after it began",
                slot.id,
                slot.name
            );
        } else if event.run_number() != run_number {
            spdlog::warn!(
                "Source {} began run {} but the collector is in run {run_number}",
                slot.id,
                event.run_number()
            );
        }
        slot.bore = Some(event);
        self.advance()
    }

    /// Discard the leftovers of sources that vanished without an end-of-run event
    fn discard_stale(&mut self) {
        for slot in self.slots.iter_mut() {
            if !slot.connected && !slot.retired && !slot.queue.is_empty() {
                spdlog::warn!(
                    "Source {} ({}) disconnected with {} events queued and no live peers remain; discarding them",
                    slot.id,
                    slot.name,
                    slot.queue.len()
                );
                slot.queue.clear();
            }
        }
    }

    /// Emit the framing and merged events the current state allows
    fn advance(&mut self) -> Vec<EventRef> {
        let mut out = Vec::new();
        if self.state != MergerState::Running {
            return out;
        }

        if !self.bore_sent {
            let mut connected = self.slots.iter().filter(|slot| slot.connected).peekable();
            if connected.peek().is_none() || !self.required_connected() {
                return out;
            }
            if connected.any(|slot| slot.bore.is_none()) {
                return out;
            }
            let bores: Vec<EventRef> = self
                .slots
                .iter()
                .filter(|slot| slot.connected)
                .filter_map(|slot| slot.bore.clone())
                .collect();
            spdlog::info!(
                "Run {} begins with {} sources",
                self.builder.run_number(),
                bores.len()
            );
            out.push(self.builder.framing(EventFlags::BORE, bores));
            self.bore_sent = true;
        }

        out.extend(self.strategy.drain(&mut self.slots, &mut self.builder));

        if self.slots.iter().all(|slot| !slot.is_active()) {
            let eores: Vec<EventRef> = self
                .slots
                .iter()
                .filter_map(|slot| slot.eore.clone())
                .collect();
            spdlog::info!(
                "Run {} ended after {} merged events",
                self.builder.run_number(),
                self.builder.built().saturating_sub(1)
            );
            out.push(self.builder.framing(EventFlags::EORE, eores));
            self.bore_sent = false;
            self.state = MergerState::Idle;
        }
        out
    }
}

impl<S: MatchStrategy> StreamMerger for Merger<S> {
    fn connect(&mut self, source_id: u32, name: &str) -> Result<(), MergerError> {
        if let Some(&index) = self.index.get(&source_id) {
            let slot = &mut self.slots[index];
            if slot.connected {
                return Err(MergerError::DuplicateSource(source_id));
            }
            slot.connected = true;
            return Ok(());
        }
        spdlog::info!("Source {source_id} ({name}) registered with the merger");
        self.slots.push(SourceSlot::new(
            source_id,
            name,
            self.queue_capacity,
            self.overflow_policy,
        ));
        self.index.insert(source_id, self.slots.len() - 1);
        Ok(())
    }

    fn disconnect(&mut self, source_id: u32) -> Result<Vec<EventRef>, MergerError> {
        let index = self.slot_index(source_id)?;
        let slot = &mut self.slots[index];
        slot.connected = false;
        spdlog::info!(
            "Source {source_id} ({}) left the merger with {} events queued",
            slot.name,
            slot.queue.len()
        );
        if self.state != MergerState::Running {
            return Ok(Vec::new());
        }
        if !self.slots.iter().any(|slot| slot.is_live()) {
            self.discard_stale();
        }
        Ok(self.advance())
    }

    fn start_run(&mut self, run_number: u32) {
        if self.state == MergerState::Running && self.bore_sent {
            spdlog::warn!(
                "Starting run {run_number} while run {} is still open",
                self.builder.run_number()
            );
        }
        self.slots.retain(|slot| slot.connected);
        self.index = self
            .slots
            .iter()
            .enumerate()
            .map(|(index, slot)| (slot.id, index))
            .collect();
        for slot in self.slots.iter_mut() {
            slot.reset();
        }
        self.strategy.reset();
        self.builder.start_run(run_number);
        self.bore_sent = false;
        self.state = MergerState::Running;
        spdlog::info!(
            "Merger ready for run {run_number} in {:?} mode",
            self.strategy.mode()
        );
    }

    fn push(&mut self, source_id: u32, event: EventRef) -> Result<Vec<EventRef>, MergerError> {
        self.slot_index(source_id)?;
        match self.state {
            MergerState::Running => (),
            MergerState::Idle if event.is_bore() => self.start_run(event.run_number()),
            MergerState::Idle => return Err(MergerError::NotRunning(source_id)),
            MergerState::Aborted
                if event.is_bore() && event.run_number() != self.builder.run_number() =>
            {
                self.start_run(event.run_number())
            }
            MergerState::Aborted => {
                return Err(MergerError::RunAborted(self.builder.run_number()))
            }
        }
        // start_run may have compacted the slots
        let index = self.slot_index(source_id)?;

        if event.is_bore() {
            return Ok(self.accept_bore(index, event));
        }
        if self.slots[index].retired {
            return Err(MergerError::Retired(source_id));
        }
        if event.is_eore() {
            let slot = &mut self.slots[index];
            spdlog::debug!(
                "Source {source_id} ended its run with {} events queued",
                slot.queue.len()
            );
            slot.retired = true;
            slot.eore = Some(event);
            return Ok(self.advance());
        }

        if let Err(e) = self.strategy.check(&self.slots[index], &event) {
            return Err(self.abort(e));
        }
        let slot = &mut self.slots[index];
        match slot.queue.push(event.clone()) {
            Ok(None) => self.strategy.commit(slot, &event),
            Ok(Some(dropped)) if Arc::ptr_eq(&dropped, &event) => {
                spdlog::warn!(
                    "Source {source_id} queue is full; dropped incoming event {}",
                    event.event_number()
                );
            }
            Ok(Some(dropped)) => {
                spdlog::warn!(
                    "Source {source_id} queue is full; dropped oldest event {}",
                    dropped.event_number()
                );
                self.strategy.commit(slot, &event);
            }
            Err(e) => {
                spdlog::warn!("Source {source_id} refused event {}: {e}", event.event_number());
                return Err(MergerError::QueueOverflow(source_id, e));
            }
        }
        Ok(self.advance())
    }

    fn state(&self) -> MergerState {
        self.state
    }

    fn run_number(&self) -> u32 {
        self.builder.run_number()
    }

    fn mode(&self) -> MergeMode {
        self.strategy.mode()
    }

    fn pending(&self) -> usize {
        self.slots.iter().map(|slot| slot.queue.len()).sum()
    }
}

/// Create the merger the configuration asks for
pub fn create_merger(config: &MergerConfig, collector_id: u32) -> Box<dyn StreamMerger> {
    match config.mode {
        MergeMode::Trigger => Box::new(Merger::new(TriggerMatch::new(), config, collector_id)),
        MergeMode::Timestamp => {
            Box::new(Merger::new(TimestampMatch::new(), config, collector_id))
        }
    }
}

/// Hosts a [`StreamMerger`] in the pipeline. Events are routed to their source's queue by
/// their source id; connection lifecycle and run transitions arrive as control messages.
pub struct MergerNode {
    name: String,
    merger: Box<dyn StreamMerger>,
    merged: Arc<AtomicU64>,
}

impl MergerNode {
    pub fn new(name: &str, merger: Box<dyn StreamMerger>) -> Self {
        Self {
            name: name.to_string(),
            merger,
            merged: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Count merged data events into a shared counter
    pub fn with_counter(mut self, merged: Arc<AtomicU64>) -> Self {
        self.merged = merged;
        self
    }

    fn publish(&self, events: Vec<EventRef>, ctx: &mut Context) {
        for event in events {
            if !event.is_framing() {
                self.merged.fetch_add(1, Ordering::Relaxed);
            }
            ctx.forward(event);
        }
    }
}

impl Node for MergerNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&mut self, event: EventRef, ctx: &mut Context) -> Outcome {
        match self.merger.push(event.source_id(), event) {
            Ok(merged) => {
                self.publish(merged, ctx);
                Outcome::Continue
            }
            Err(e) if e.is_fatal() => {
                ctx.fatal(e);
                Outcome::Continue
            }
            Err(MergerError::QueueOverflow(..)) => Outcome::BusySkip,
            Err(e) => {
                spdlog::warn!("{}: dropped event: {e}", self.name);
                Outcome::SkipEvent
            }
        }
    }

    fn control(&mut self, control: &Control, ctx: &mut Context) {
        match control {
            Control::SourceConnected { id, name } => {
                if let Err(e) = self.merger.connect(*id, name) {
                    spdlog::warn!("{}: {e}", self.name);
                }
            }
            Control::SourceDisconnected { id } => match self.merger.disconnect(*id) {
                Ok(merged) => self.publish(merged, ctx),
                Err(e) => spdlog::warn!("{}: {e}", self.name),
            },
            Control::StartRun(run_number) => self.merger.start_run(*run_number),
            Control::StopRun => spdlog::info!(
                "{}: stop requested for run {}; waiting for end-of-run events ({} queued)",
                self.name,
                self.merger.run_number(),
                self.merger.pending()
            ),
        }
    }
}
