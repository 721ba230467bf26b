use fxhash::FxHashMap;
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::JoinHandle;

use super::constants::DEFAULT_HUB_CAPACITY;
use super::error::{GraphError, PipelineError};
use super::event::EventKind;
use super::hub::{run_hub, Dispatch, Edge, Executor, HubSender, Injector, Routes};
use super::node::{FatalError, Node};

pub type NodeId = usize;

/// The set of event kinds a node accepts over one edge. The default accepts everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KindFilter {
    kinds: Option<BTreeSet<EventKind>>,
}

impl KindFilter {
    pub fn all() -> Self {
        Self { kinds: None }
    }

    pub fn only<I: IntoIterator<Item = EventKind>>(kinds: I) -> Self {
        Self {
            kinds: Some(kinds.into_iter().collect()),
        }
    }

    pub fn accepts(&self, kind: &EventKind) -> bool {
        match &self.kinds {
            Some(kinds) => kinds.contains(kind),
            None => true,
        }
    }
}

/// How a node ended up being run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    /// Run on the thread of the root's injector
    Inline { root: NodeId },
    /// Run on the thread of this hub
    Hub { node: NodeId },
}

struct NodeSpec {
    node: Box<dyn Node>,
    queued: bool,
}

/// Builds a pipeline by composition: add nodes, link them, then elect hubs with `build`
pub struct GraphBuilder {
    nodes: Vec<NodeSpec>,
    edges: Vec<(NodeId, NodeId, KindFilter)>,
    hub_capacity: usize,
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            edges: Vec::new(),
            hub_capacity: DEFAULT_HUB_CAPACITY,
        }
    }

    /// Capacity of every hub dispatch queue
    pub fn with_hub_capacity(mut self, capacity: usize) -> Self {
        self.hub_capacity = capacity.max(1);
        self
    }

    /// Add a node. It runs inline unless its position in the graph makes it a hub
    pub fn add<N: Node + 'static>(&mut self, node: N) -> NodeId {
        self.push(Box::new(node), false)
    }

    /// Add a node that always gets its own queue and thread
    pub fn add_queued<N: Node + 'static>(&mut self, node: N) -> NodeId {
        self.push(Box::new(node), true)
    }

    fn push(&mut self, node: Box<dyn Node>, queued: bool) -> NodeId {
        self.nodes.push(NodeSpec { node, queued });
        self.nodes.len() - 1
    }

    fn name(&self, id: NodeId) -> String {
        self.nodes[id].node.name().to_string()
    }

    pub fn link(&mut self, from: NodeId, to: NodeId, filter: KindFilter) -> Result<(), GraphError> {
        for id in [from, to] {
            if id >= self.nodes.len() {
                return Err(GraphError::UnknownNode(id));
            }
        }
        if from == to {
            return Err(GraphError::SelfLink(self.name(from)));
        }
        if let Some(edge) = self.edges.iter_mut().find(|e| e.0 == from && e.1 == to) {
            edge.2 = filter;
        } else {
            self.edges.push((from, to, filter));
        }
        Ok(())
    }

    /// Link with the accept-everything filter. Returns `to` so chains read left to right
    pub fn then(&mut self, from: NodeId, to: NodeId) -> Result<NodeId, GraphError> {
        self.link(from, to, KindFilter::all())?;
        Ok(to)
    }

    /// Number of upstream nodes feeding a node
    pub fn fan_in(&self, id: NodeId) -> usize {
        self.edges.iter().filter(|e| e.1 == id).count()
    }

    fn topological_order(&self) -> Result<Vec<NodeId>, GraphError> {
        let mut in_degree: Vec<usize> = (0..self.nodes.len()).map(|id| self.fan_in(id)).collect();
        let mut ready: VecDeque<NodeId> = (0..self.nodes.len())
            .filter(|id| in_degree[*id] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = ready.pop_front() {
            order.push(id);
            for (_, to, _) in self.edges.iter().filter(|e| e.0 == id) {
                in_degree[*to] -= 1;
                if in_degree[*to] == 0 {
                    ready.push_back(*to);
                }
            }
        }
        match (0..self.nodes.len()).find(|id| in_degree[*id] > 0) {
            Some(id) => Err(GraphError::Cycle(self.name(id))),
            None => Ok(order),
        }
    }

    /// Validate the graph, elect hubs and start the hub threads.
    ///
    /// Roots become inline domains driven through an [`Injector`], unless added queued.
    /// A node added queued, or whose upstreams live in more than one domain, becomes a hub.
    /// Every other node joins the domain of its upstreams, so a region behind a hub shares
    /// that hub's thread.
    pub fn build(self) -> Result<Pipeline, GraphError> {
        let order = self.topological_order()?;
        let n_nodes = self.nodes.len();

        let mut upstream: Vec<Vec<NodeId>> = vec![Vec::new(); n_nodes];
        let mut edges: Vec<Vec<Edge>> = vec![Vec::new(); n_nodes];
        for (from, to, filter) in &self.edges {
            upstream[*to].push(*from);
            edges[*from].push(Edge {
                to: *to,
                filter: filter.clone(),
            });
        }

        let mut domains: Vec<Domain> = Vec::new();
        let mut domain_of: Vec<usize> = vec![0; n_nodes];
        for &id in &order {
            let mut parents: Vec<usize> = upstream[id].iter().map(|p| domain_of[*p]).collect();
            parents.sort_unstable();
            parents.dedup();
            domain_of[id] = match (self.nodes[id].queued, parents.as_slice()) {
                (false, [parent]) => *parent,
                (false, []) => {
                    domains.push(Domain::Inline { root: id });
                    domains.len() - 1
                }
                _ => {
                    domains.push(Domain::Hub { node: id });
                    domains.len() - 1
                }
            };
        }

        let mut channels: Vec<Option<(flume::Sender<Dispatch>, flume::Receiver<Dispatch>)>> =
            domains
                .iter()
                .map(|domain| match domain {
                    Domain::Hub { .. } => Some(flume::bounded(self.hub_capacity)),
                    Domain::Inline { .. } => None,
                })
                .collect();

        let names: Vec<String> = (0..n_nodes).map(|id| self.name(id)).collect();
        let routes = Arc::new(Routes {
            names,
            edges,
            upstream,
            domain: domain_of.clone(),
            hub_tx: channels
                .iter()
                .map(|c| c.as_ref().map(|(tx, _)| tx.clone()))
                .collect(),
            closed: (0..n_nodes).map(|_| AtomicBool::new(false)).collect(),
            shutting_down: AtomicBool::new(false),
        });

        let mut members: Vec<FxHashMap<NodeId, Box<dyn Node>>> =
            domains.iter().map(|_| FxHashMap::default()).collect();
        for (id, entry) in self.nodes.into_iter().enumerate() {
            members[domain_of[id]].insert(id, entry.node);
        }

        let (fatal_tx, fatal_rx) = flume::unbounded();
        let mut injectors = FxHashMap::default();
        let mut hubs = Vec::new();
        for (index, nodes) in members.into_iter().enumerate() {
            let executor = Executor::new(index, nodes, routes.clone(), fatal_tx.clone());
            match domains[index] {
                Domain::Inline { root } => {
                    injectors.insert(root, Injector::new(root, executor));
                }
                Domain::Hub { node } => {
                    let rx = match channels[index].take() {
                        Some((_, rx)) => rx,
                        None => continue,
                    };
                    let (stop_tx, stop_rx) = flume::bounded(1);
                    let name = routes.names[node].clone();
                    let thread = std::thread::Builder::new()
                        .name(format!("hub-{name}"))
                        .spawn({
                            let name = name.clone();
                            move || run_hub(name, executor, rx, stop_rx)
                        })
                        .map_err(|e| GraphError::SpawnFailed(name, e))?;
                    hubs.push(HubHandle {
                        node,
                        stop_tx,
                        thread,
                    });
                }
            }
        }

        for (index, domain) in domains.iter().enumerate() {
            spdlog::debug!("Pipeline domain {index}: {domain:?}");
        }

        Ok(Pipeline {
            routes,
            domains,
            injectors,
            hubs,
            fatal_rx,
        })
    }
}

struct HubHandle {
    node: NodeId,
    stop_tx: flume::Sender<()>,
    thread: JoinHandle<()>,
}

/// A running pipeline: hub threads started, inline roots waiting for their injectors
pub struct Pipeline {
    routes: Arc<Routes>,
    domains: Vec<Domain>,
    injectors: FxHashMap<NodeId, Injector>,
    /// In topological order of their hub nodes
    hubs: Vec<HubHandle>,
    fatal_rx: flume::Receiver<FatalError>,
}

impl Pipeline {
    pub fn domain(&self, id: NodeId) -> Option<Domain> {
        self.routes.domain.get(id).map(|d| self.domains[*d])
    }

    pub fn is_hub(&self, id: NodeId) -> bool {
        self.domain(id) == Some(Domain::Hub { node: id })
    }

    pub fn node_name(&self, id: NodeId) -> Option<&str> {
        self.routes.names.get(id).map(|n| n.as_str())
    }

    /// Admission to this node has been closed by a Stop
    pub fn is_stopped(&self, id: NodeId) -> bool {
        id < self.routes.names.len() && self.routes.is_closed(id)
    }

    /// Take the injector of an inline root. There is exactly one per root.
    pub fn take_injector(&mut self, id: NodeId) -> Result<Injector, PipelineError> {
        self.injectors.remove(&id).ok_or_else(|| {
            PipelineError::NoInjector(self.node_name(id).unwrap_or("?").to_string())
        })
    }

    /// A handle delivering to `id` through the dispatch queue of the hub that runs it
    pub fn sender(&self, id: NodeId) -> Result<HubSender, PipelineError> {
        let name = || self.node_name(id).unwrap_or("?").to_string();
        let domain = *self
            .routes
            .domain
            .get(id)
            .ok_or_else(|| PipelineError::NotAHub(name()))?;
        match &self.routes.hub_tx[domain] {
            Some(tx) => Ok(HubSender::new(id, tx.clone(), self.routes.clone())),
            None => Err(PipelineError::NotAHub(name())),
        }
    }

    /// Receiver of the fatal errors raised by nodes
    pub fn fatal_errors(&self) -> flume::Receiver<FatalError> {
        self.fatal_rx.clone()
    }

    /// Close admission everywhere, then stop the hubs from upstream to downstream so each
    /// drains into a hub that is still running.
    pub fn shutdown(self) -> Result<(), PipelineError> {
        self.routes.close_all();
        let mut result = Ok(());
        for hub in self.hubs {
            let name = self.routes.names[hub.node].clone();
            // a full stop channel already carries the signal
            let _ = hub.stop_tx.try_send(());
            if hub.thread.join().is_err() {
                spdlog::error!("Hub {name} panicked");
                result = Err(PipelineError::HubPanicked(name));
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, EventRef};
    use crate::node::{Context, Control, Outcome};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Forwards everything, recording what it saw
    struct Relay {
        name: String,
        seen: Arc<Mutex<Vec<EventRef>>>,
        controls: Arc<Mutex<Vec<Control>>>,
    }

    impl Relay {
        fn new(name: &str) -> (Self, Arc<Mutex<Vec<EventRef>>>) {
            let seen = Arc::new(Mutex::new(Vec::new()));
            let relay = Self {
                name: name.to_string(),
                seen: seen.clone(),
                controls: Arc::new(Mutex::new(Vec::new())),
            };
            (relay, seen)
        }
    }

    impl Node for Relay {
        fn name(&self) -> &str {
            &self.name
        }

        fn process(&mut self, event: EventRef, ctx: &mut Context) -> Outcome {
            self.seen.lock().unwrap().push(event.clone());
            ctx.forward(event);
            Outcome::Continue
        }

        fn control(&mut self, control: &Control, _ctx: &mut Context) {
            self.controls.lock().unwrap().push(control.clone());
        }
    }

    /// Counts how many threads are inside process() at once
    struct Reentrancy {
        inside: Arc<AtomicUsize>,
        max_inside: Arc<AtomicUsize>,
        count: Arc<AtomicUsize>,
    }

    impl Node for Reentrancy {
        fn name(&self) -> &str {
            "reentrancy"
        }

        fn process(&mut self, _event: EventRef, _ctx: &mut Context) -> Outcome {
            let now = self.inside.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_inside.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_micros(20));
            self.inside.fetch_sub(1, Ordering::SeqCst);
            self.count.fetch_add(1, Ordering::SeqCst);
            Outcome::Continue
        }
    }

    struct Stopper;

    impl Node for Stopper {
        fn name(&self) -> &str {
            "stopper"
        }

        fn process(&mut self, _event: EventRef, _ctx: &mut Context) -> Outcome {
            Outcome::Stop
        }
    }

    /// Waits for the gate on its first event, then stops on every event it sees
    struct GatedStopper {
        gate: flume::Receiver<()>,
        opened: bool,
        seen: Arc<AtomicUsize>,
    }

    impl Node for GatedStopper {
        fn name(&self) -> &str {
            "gated_stopper"
        }

        fn process(&mut self, _event: EventRef, _ctx: &mut Context) -> Outcome {
            if !self.opened {
                let _ = self.gate.recv();
                self.opened = true;
            }
            self.seen.fetch_add(1, Ordering::SeqCst);
            Outcome::Stop
        }
    }

    fn event(source: u32, number: u32) -> EventRef {
        Event::new(EventKind::Raw, source, 1)
            .with_event_number(number)
            .into_ref()
    }

    #[test]
    fn test_validation() {
        let mut graph = GraphBuilder::new();
        let a = graph.add(Relay::new("a").0);
        let b = graph.add(Relay::new("b").0);
        assert!(matches!(graph.link(a, 9, KindFilter::all()), Err(GraphError::UnknownNode(9))));
        assert!(matches!(graph.then(a, a), Err(GraphError::SelfLink(_))));
        graph.then(a, b).unwrap();
        graph.then(b, a).unwrap();
        assert!(matches!(graph.build(), Err(GraphError::Cycle(_))));
    }

    #[test]
    fn test_hub_election() {
        let mut graph = GraphBuilder::new();
        let a = graph.add(Relay::new("a").0);
        let a2 = graph.add(Relay::new("a2").0);
        let b = graph.add(Relay::new("b").0);
        let join = graph.add(Relay::new("join").0);
        let tail = graph.add(Relay::new("tail").0);
        let queued = graph.add_queued(Relay::new("queued").0);
        let chain = graph.then(a, a2).unwrap();
        graph.then(chain, join).unwrap();
        graph.then(b, join).unwrap();
        graph.then(join, tail).unwrap();
        graph.then(tail, queued).unwrap();
        assert_eq!(graph.fan_in(join), 2);

        let mut pipeline = graph.build().unwrap();
        assert_eq!(pipeline.domain(a2), Some(Domain::Inline { root: a }));
        assert!(pipeline.is_hub(join));
        assert_eq!(pipeline.domain(tail), Some(Domain::Hub { node: join }));
        assert!(pipeline.is_hub(queued));
        assert!(pipeline.take_injector(a).is_ok());
        assert!(pipeline.take_injector(a).is_err());
        assert!(pipeline.take_injector(join).is_err());
        assert!(pipeline.sender(tail).is_ok());
        assert!(pipeline.sender(a2).is_err());
        pipeline.shutdown().unwrap();
    }

    #[test]
    fn test_fan_in_within_one_domain_stays_inline() {
        let mut graph = GraphBuilder::new();
        let root = graph.add(Relay::new("root").0);
        let left = graph.add(Relay::new("left").0);
        let right = graph.add(Relay::new("right").0);
        let join = graph.add(Relay::new("join").0);
        graph.then(root, left).unwrap();
        graph.then(root, right).unwrap();
        graph.then(left, join).unwrap();
        graph.then(right, join).unwrap();
        let pipeline = graph.build().unwrap();
        assert_eq!(pipeline.domain(join), Some(Domain::Inline { root }));
    }

    #[test]
    fn test_filters_and_controls_travel_downstream() {
        let mut graph = GraphBuilder::new();
        let (root, _) = Relay::new("root");
        let (raw_only, raw_seen) = Relay::new("raw_only");
        let raw_controls = raw_only.controls.clone();
        let root = graph.add(root);
        let raw_only = graph.add(raw_only);
        graph
            .link(root, raw_only, KindFilter::only([EventKind::Raw]))
            .unwrap();
        let mut pipeline = graph.build().unwrap();
        let mut injector = pipeline.take_injector(root).unwrap();

        injector.push(event(1, 1)).unwrap();
        injector
            .push(Event::new(EventKind::Sync, 1, 1).into_ref())
            .unwrap();
        injector.control(Control::StartRun(3)).unwrap();
        assert_eq!(raw_seen.lock().unwrap().len(), 1);
        assert_eq!(*raw_controls.lock().unwrap(), vec![Control::StartRun(3)]);
    }

    #[test]
    fn test_at_most_one_concurrent_process() {
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));
        let count = Arc::new(AtomicUsize::new(0));

        let mut graph = GraphBuilder::new().with_hub_capacity(8);
        let counter = graph.add(Reentrancy {
            inside: inside.clone(),
            max_inside: max_inside.clone(),
            count: count.clone(),
        });
        let n_producers = 4;
        let roots: Vec<NodeId> = (0..n_producers)
            .map(|i| graph.add(Relay::new(&format!("producer{i}")).0))
            .collect();
        for root in &roots {
            graph.then(*root, counter).unwrap();
        }
        let mut pipeline = graph.build().unwrap();
        assert!(pipeline.is_hub(counter));

        let handles: Vec<_> = roots
            .iter()
            .map(|root| pipeline.take_injector(*root).unwrap())
            .enumerate()
            .map(|(i, mut injector)| {
                std::thread::spawn(move || {
                    for n in 0..200 {
                        injector.push(event(i as u32, n)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        pipeline.shutdown().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 800);
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stop_closes_admission_upstream() {
        let mut graph = GraphBuilder::new();
        let (root, root_seen) = Relay::new("root");
        let root = graph.add(root);
        let stopper = graph.add(Stopper);
        graph.then(root, stopper).unwrap();
        let mut pipeline = graph.build().unwrap();
        let mut injector = pipeline.take_injector(root).unwrap();

        injector.push(event(1, 1)).unwrap();
        assert!(pipeline.is_stopped(root));
        assert!(matches!(
            injector.push(event(1, 2)),
            Err(PipelineError::Stopped(_))
        ));
        assert_eq!(root_seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_stop_still_drains_queued_deliveries() {
        let (gate_tx, gate_rx) = flume::bounded(1);
        let seen = Arc::new(AtomicUsize::new(0));
        let mut graph = GraphBuilder::new().with_hub_capacity(16);
        let stopper = graph.add_queued(GatedStopper {
            gate: gate_rx,
            opened: false,
            seen: seen.clone(),
        });
        let pipeline = graph.build().unwrap();
        let sender = pipeline.sender(stopper).unwrap();
        for n in 0..10 {
            sender.send(event(1, n)).unwrap();
        }
        gate_tx.send(()).unwrap();

        let start = std::time::Instant::now();
        while seen.load(Ordering::SeqCst) < 10 {
            assert!(start.elapsed() < Duration::from_secs(10), "queued events were lost");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(pipeline.is_stopped(stopper));
        assert!(matches!(sender.send(event(1, 10)), Err(PipelineError::Stopped(_))));
        pipeline.shutdown().unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_hub_drains_on_shutdown() {
        let mut graph = GraphBuilder::new();
        let (sink, seen) = Relay::new("sink");
        let sink = graph.add_queued(sink);
        let pipeline = graph.build().unwrap();
        let sender = pipeline.sender(sink).unwrap();
        for n in 0..100 {
            sender.send(event(1, n)).unwrap();
        }
        pipeline.shutdown().unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 100);
        assert!(seen.windows(2).all(|w| w[0].event_number() < w[1].event_number()));
        assert!(matches!(sender.send(event(1, 100)), Err(PipelineError::Stopped(_))));
    }
}
