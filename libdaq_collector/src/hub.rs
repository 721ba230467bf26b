//! Delivery of events to pipeline nodes.
//!
//! Every node belongs to exactly one execution domain. A domain is either inline (a root
//! node and the chain that inherits from it, run on whichever thread calls its
//! [`Injector`]) or a hub (a thread draining one bounded dispatch queue). An [`Executor`]
//! owns the nodes of its domain, so a node is only ever entered from its domain's thread.
use bit_set::BitSet;
use flume::{RecvTimeoutError, Selector, SendTimeoutError};
use fxhash::FxHashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use super::constants::*;
use super::error::PipelineError;
use super::event::EventRef;
use super::graph::{KindFilter, NodeId};
use super::node::{Context, Control, FatalError, Node, Outcome};

#[derive(Debug, Clone)]
pub(crate) enum Message {
    Event(EventRef),
    Control(Control),
}

/// One entry of a dispatch queue: what to deliver and to whom
#[derive(Debug, Clone)]
pub(crate) struct Dispatch {
    pub target: NodeId,
    pub message: Message,
}

#[derive(Debug, Clone)]
pub(crate) struct Edge {
    pub to: NodeId,
    pub filter: KindFilter,
}

/// The read-only wiring shared by every domain
pub(crate) struct Routes {
    pub names: Vec<String>,
    pub edges: Vec<Vec<Edge>>,
    pub upstream: Vec<Vec<NodeId>>,
    pub domain: Vec<usize>,
    /// Dispatch queue of each domain; None for inline domains
    pub hub_tx: Vec<Option<flume::Sender<Dispatch>>>,
    /// Admission closed: set on a node that returned Stop and on all its ancestors
    pub closed: Vec<AtomicBool>,
    /// Set once the whole pipeline is shutting down
    pub shutting_down: AtomicBool,
}

impl Routes {
    pub fn is_closed(&self, node: NodeId) -> bool {
        self.closed[node].load(Ordering::Acquire)
    }

    pub fn close_all(&self) {
        self.shutting_down.store(true, Ordering::Release);
        for flag in &self.closed {
            flag.store(true, Ordering::Release);
        }
    }

    /// Close admission for a node and everything upstream of it. Deliveries already
    /// queued or in flight still reach it.
    fn stop(&self, node: NodeId) {
        let mut stack = vec![node];
        while let Some(id) = stack.pop() {
            if !self.closed[id].swap(true, Ordering::AcqRel) {
                stack.extend(self.upstream[id].iter().copied());
            }
        }
    }
}

/// Runs the nodes of one domain
pub(crate) struct Executor {
    domain: usize,
    nodes: FxHashMap<NodeId, Box<dyn Node>>,
    routes: Arc<Routes>,
    fatal_tx: flume::Sender<FatalError>,
    parked: VecDeque<Dispatch>,
    /// Targets with at least one parked delivery
    parked_targets: BitSet,
}

impl Executor {
    pub fn new(
        domain: usize,
        nodes: FxHashMap<NodeId, Box<dyn Node>>,
        routes: Arc<Routes>,
        fatal_tx: flume::Sender<FatalError>,
    ) -> Self {
        Self {
            domain,
            nodes,
            routes,
            fatal_tx,
            parked: VecDeque::new(),
            parked_targets: BitSet::new(),
        }
    }

    pub fn has_parked(&self) -> bool {
        !self.parked.is_empty()
    }

    /// Parked deliveries or buffered events are waiting
    pub fn is_busy(&self) -> bool {
        self.has_parked() || self.nodes.values().any(|node| node.has_pending())
    }

    /// Deliver a message and everything it causes inside this domain
    pub fn dispatch(&mut self, dispatch: Dispatch) {
        let mut work = VecDeque::from([dispatch]);
        self.run(&mut work);
    }

    fn run(&mut self, work: &mut VecDeque<Dispatch>) {
        while let Some(dispatch) = work.pop_front() {
            self.deliver(dispatch, work);
        }
    }

    fn deliver(&mut self, dispatch: Dispatch, work: &mut VecDeque<Dispatch>) {
        let target = dispatch.target;
        // a node with parked deliveries takes nothing else until they go through
        if self.parked_targets.contains(target) {
            self.park(dispatch);
            return;
        }
        let routes = self.routes.clone();
        let node = match self.nodes.get_mut(&target) {
            Some(node) => node,
            None => {
                spdlog::error!(
                    "Node {} was routed to the wrong domain",
                    routes.names[target]
                );
                return;
            }
        };

        let mut ctx = Context::new(&routes.names[target], &self.fatal_tx);
        match dispatch.message {
            Message::Event(event) => {
                let outcome = node.process(event.clone(), &mut ctx);
                let forwarded = ctx.take_forwarded();
                match outcome {
                    Outcome::Continue | Outcome::SkipEvent => (),
                    Outcome::BusySkip => spdlog::warn!(
                        "Node {} was busy; dropped event {} from source {}",
                        routes.names[target],
                        event.event_number(),
                        event.source_id()
                    ),
                    Outcome::BusyRetry => self.park(Dispatch {
                        target,
                        message: Message::Event(event),
                    }),
                    Outcome::Stop => {
                        spdlog::info!(
                            "Node {} stopped; closing admission upstream of it",
                            routes.names[target]
                        );
                        routes.stop(target);
                    }
                }
                for event in forwarded {
                    self.route(target, Message::Event(event), work);
                }
            }
            Message::Control(control) => {
                node.control(&control, &mut ctx);
                let forwarded = ctx.take_forwarded();
                for event in forwarded {
                    self.route(target, Message::Event(event), work);
                }
                self.route(target, Message::Control(control), work);
            }
        }
    }

    /// Hand a message to every downstream node of `from`
    fn route(&mut self, from: NodeId, message: Message, work: &mut VecDeque<Dispatch>) {
        let routes = self.routes.clone();
        for edge in &routes.edges[from] {
            if let Message::Event(event) = &message {
                if !edge.filter.accepts(event.kind()) {
                    continue;
                }
            }
            let dispatch = Dispatch {
                target: edge.to,
                message: message.clone(),
            };
            let domain = routes.domain[edge.to];
            if domain == self.domain {
                work.push_back(dispatch);
                continue;
            }
            match &routes.hub_tx[domain] {
                Some(tx) => {
                    if tx.send(dispatch).is_err() {
                        spdlog::error!(
                            "Dispatch queue of {} is closed; delivery lost",
                            routes.names[edge.to]
                        );
                    }
                }
                None => spdlog::error!(
                    "Node {} is in an inline domain and cannot be reached from {}",
                    routes.names[edge.to],
                    routes.names[from]
                ),
            }
        }
    }

    fn park(&mut self, dispatch: Dispatch) {
        self.parked_targets.insert(dispatch.target);
        self.parked.push_back(dispatch);
    }

    /// Offer parked deliveries again, oldest first
    pub fn retry_parked(&mut self) {
        let parked = std::mem::take(&mut self.parked);
        self.parked_targets.clear();
        let mut work = VecDeque::new();
        for dispatch in parked {
            self.deliver(dispatch, &mut work);
            self.run(&mut work);
        }
    }

    /// Give nodes holding events a chance to pass them on
    pub fn flush_pending(&mut self) {
        let routes = self.routes.clone();
        let pending: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.has_pending())
            .map(|(id, _)| *id)
            .collect();
        let mut work = VecDeque::new();
        for id in pending {
            let forwarded = match self.nodes.get_mut(&id) {
                Some(node) => {
                    let mut ctx = Context::new(&routes.names[id], &self.fatal_tx);
                    node.flush(&mut ctx);
                    ctx.take_forwarded()
                }
                None => continue,
            };
            for event in forwarded {
                self.route(id, Message::Event(event), &mut work);
            }
            self.run(&mut work);
        }
    }

    /// Keep offering parked and buffered events until they are gone or the grace period
    /// runs out
    pub fn settle(&mut self) {
        let deadline = Instant::now() + SHUTDOWN_GRACE;
        self.retry_parked();
        self.flush_pending();
        while self.is_busy() {
            if Instant::now() > deadline {
                spdlog::error!(
                    "Giving up on {} parked deliveries after {:?}",
                    self.parked.len(),
                    SHUTDOWN_GRACE
                );
                for dispatch in self.parked.drain(..) {
                    if let Message::Event(event) = dispatch.message {
                        spdlog::error!(
                            "Node {} never took event {} from source {}",
                            self.routes.names[dispatch.target],
                            event.event_number(),
                            event.source_id()
                        );
                    }
                }
                self.parked_targets.clear();
                return;
            }
            std::thread::sleep(RETRY_INTERVAL);
            self.retry_parked();
            self.flush_pending();
        }
    }
}

enum Signal {
    Work(Dispatch),
    Stop,
    Tick,
}

/// Body of a hub thread. Waits on the dispatch queue and the stop channel, waking every
/// retry interval only while work is pending. While a delivery is parked the dispatch
/// queue is left alone, so it fills up and blocks the senders. On stop, everything
/// already queued is processed before the thread exits.
pub(crate) fn run_hub(
    name: String,
    mut executor: Executor,
    rx: flume::Receiver<Dispatch>,
    stop_rx: flume::Receiver<()>,
) {
    spdlog::info!("Hub {name} started.");
    loop {
        // once shutting down, upstream hubs draining into this one must not block
        if executor.has_parked() && !executor.routes.shutting_down.load(Ordering::Acquire) {
            match stop_rx.recv_timeout(RETRY_INTERVAL) {
                Err(RecvTimeoutError::Timeout) => {
                    executor.retry_parked();
                    executor.flush_pending();
                    continue;
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        let selector = Selector::new()
            .recv(&rx, |message| match message {
                Ok(dispatch) => Signal::Work(dispatch),
                Err(_) => Signal::Stop,
            })
            .recv(&stop_rx, |_| Signal::Stop);
        let signal = if executor.is_busy() {
            selector.wait_timeout(RETRY_INTERVAL).unwrap_or(Signal::Tick)
        } else {
            selector.wait()
        };
        match signal {
            Signal::Work(dispatch) => executor.dispatch(dispatch),
            Signal::Tick => (),
            Signal::Stop => break,
        }
        if executor.is_busy() {
            executor.retry_parked();
            executor.flush_pending();
        }
    }

    let mut drained = 0;
    for dispatch in rx.try_iter() {
        executor.dispatch(dispatch);
        drained += 1;
    }
    executor.settle();
    spdlog::info!("Hub {name} stopped after draining {drained} queued deliveries.");
}

/// A cloneable handle feeding a hub's dispatch queue from any thread
#[derive(Clone)]
pub struct HubSender {
    target: NodeId,
    tx: flume::Sender<Dispatch>,
    routes: Arc<Routes>,
}

impl HubSender {
    pub(crate) fn new(target: NodeId, tx: flume::Sender<Dispatch>, routes: Arc<Routes>) -> Self {
        Self { target, tx, routes }
    }

    pub fn target(&self) -> NodeId {
        self.target
    }

    /// Queue an event for the target node. Blocks while the queue is full.
    pub fn send(&self, event: EventRef) -> Result<(), PipelineError> {
        self.enqueue(Message::Event(event))
    }

    pub fn control(&self, control: Control) -> Result<(), PipelineError> {
        self.enqueue(Message::Control(control))
    }

    fn enqueue(&self, message: Message) -> Result<(), PipelineError> {
        let name = &self.routes.names[self.target];
        let mut dispatch = Dispatch {
            target: self.target,
            message,
        };
        loop {
            if self.routes.is_closed(self.target) {
                return Err(PipelineError::Stopped(name.clone()));
            }
            // wake up now and then so a stopped pipeline cannot leave us blocked
            match self.tx.send_timeout(dispatch, ACCEPT_POLL_INTERVAL) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(back)) => dispatch = back,
                Err(SendTimeoutError::Disconnected(_)) => {
                    return Err(PipelineError::Disconnected(name.clone()))
                }
            }
        }
    }
}

/// Entry point of an inline root. Pushing runs the root and its inline chain on the
/// caller's thread before returning. Not Clone: one thread owns a root.
pub struct Injector {
    root: NodeId,
    executor: Executor,
}

impl Injector {
    pub(crate) fn new(root: NodeId, executor: Executor) -> Self {
        Self { root, executor }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn push(&mut self, event: EventRef) -> Result<(), PipelineError> {
        self.inject(Message::Event(event))
    }

    pub fn control(&mut self, control: Control) -> Result<(), PipelineError> {
        self.inject(Message::Control(control))
    }

    fn inject(&mut self, message: Message) -> Result<(), PipelineError> {
        let routes = self.executor.routes.clone();
        if routes.is_closed(self.root) {
            return Err(PipelineError::Stopped(routes.names[self.root].clone()));
        }
        if self.executor.is_busy() {
            self.executor.flush_pending();
        }
        self.executor.dispatch(Dispatch {
            target: self.root,
            message,
        });
        // a parked delivery holds the caller until the node accepts it
        while self.executor.has_parked() {
            if routes.is_closed(self.root) {
                return Err(PipelineError::Stopped(routes.names[self.root].clone()));
            }
            std::thread::sleep(RETRY_INTERVAL);
            self.executor.retry_parked();
        }
        Ok(())
    }

    /// Deliver everything buffered in this domain
    pub fn flush(&mut self) {
        self.executor.settle();
    }
}
