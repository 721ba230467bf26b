use fxhash::FxHashMap;
use std::io::ErrorKind;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use super::buffer_node::BufferingNode;
use super::collector_status::{CollectorStatus, RunState};
use super::config::Config;
use super::constants::*;
use super::error::{CollectorError, ProtocolError};
use super::file_writer::EventSink;
use super::graph::{GraphBuilder, Pipeline};
use super::hub::HubSender;
use super::merger::{create_merger, MergerNode};
use super::node::{Control, FatalError};
use super::registry::NodeRegistry;
use super::stages::SinkNode;
use super::wire::{decode_event, greeting, parse_identification, read_frame, read_text, write_text};

/// A producer that passed the handshake
struct Producer {
    name: String,
    stream: TcpStream,
}

/// State shared between the collector and its connection threads
struct Shared {
    collector_name: String,
    merger: HubSender,
    producers: Mutex<FxHashMap<u32, Producer>>,
    next_source: AtomicU32,
    stop: AtomicBool,
    connections: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    fn connected(&self) -> usize {
        self.producers.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Register a producer under a new source id. Names are unique among the connected.
    fn admit(&self, name: &str, stream: &TcpStream) -> Result<u32, ProtocolError> {
        let mut producers = match self.producers.lock() {
            Ok(producers) => producers,
            Err(poisoned) => poisoned.into_inner(),
        };
        if producers.values().any(|p| p.name == name) {
            return Err(ProtocolError::DuplicateProducer(name.to_string()));
        }
        let id = self.next_source.fetch_add(1, Ordering::Relaxed);
        producers.insert(
            id,
            Producer {
                name: name.to_string(),
                stream: stream.try_clone()?,
            },
        );
        Ok(id)
    }

    fn release(&self, id: u32) {
        if let Ok(mut producers) = self.producers.lock() {
            producers.remove(&id);
        }
    }

    /// Hang up on every producer so their threads see the end of their stream
    fn hang_up(&self) {
        if let Ok(producers) = self.producers.lock() {
            for producer in producers.values() {
                let _ = producer.stream.shutdown(Shutdown::Both);
            }
        }
    }
}

/// The data collector service.
///
/// Listens for producer connections, merges their streams and writes the merged stream to
/// the sink. Each producer gets its own reader thread. The merger runs on its own hub
/// followed inline by the configured stages; the buffered sink runs on a second hub.
pub struct Collector {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    pipeline: Option<Pipeline>,
    acceptor: Option<JoinHandle<()>>,
    events_merged: Arc<AtomicU64>,
    bytes_written: Arc<AtomicU64>,
    run_number: u32,
    state: RunState,
}

impl Collector {
    /// Start a collector with the built-in processing stages available
    pub fn start(config: &Config, sink: Box<dyn EventSink>) -> Result<Self, CollectorError> {
        Self::start_with_registry(config, sink, &NodeRegistry::with_builtin_stages())
    }

    pub fn start_with_registry(
        config: &Config,
        sink: Box<dyn EventSink>,
        registry: &NodeRegistry,
    ) -> Result<Self, CollectorError> {
        let events_merged = Arc::new(AtomicU64::new(0));
        let bytes_written = Arc::new(AtomicU64::new(0));

        let mut graph = GraphBuilder::new().with_hub_capacity(config.hub_capacity);
        let merger = graph.add_queued(
            MergerNode::new("merger", create_merger(&config.merger, config.collector_id))
                .with_counter(events_merged.clone()),
        );
        let mut last = merger;
        for stage in &config.stages {
            let node = graph.add(registry.create(stage)?);
            last = graph.then(last, node)?;
            spdlog::info!("Added stage {} ({})", stage.name, stage.kind);
        }
        let sink = graph.add_queued(BufferingNode::new(
            SinkNode::new("sink", sink).with_counter(bytes_written.clone()),
            config.sink_buffer_capacity,
        ));
        graph.then(last, sink)?;
        let pipeline = graph.build()?;

        let listener = TcpListener::bind(&config.listen_address)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(Shared {
            collector_name: config.collector_name.clone(),
            merger: pipeline.sender(merger)?,
            producers: Mutex::new(FxHashMap::default()),
            next_source: AtomicU32::new(1),
            stop: AtomicBool::new(false),
            connections: Mutex::new(Vec::new()),
        });
        let acceptor = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name(String::from("acceptor"))
                .spawn(move || accept_loop(listener, shared))?
        };
        spdlog::info!(
            "Collector {} listening on {local_addr} in {:?} mode",
            config.collector_name,
            config.merger.mode
        );

        Ok(Self {
            shared,
            local_addr,
            pipeline: Some(pipeline),
            acceptor: Some(acceptor),
            events_merged,
            bytes_written,
            run_number: 0,
            state: RunState::Idle,
        })
    }

    /// The address producers connect to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn start_run(&mut self, run_number: u32) -> Result<(), CollectorError> {
        self.shared.merger.control(Control::StartRun(run_number))?;
        self.run_number = run_number;
        self.state = RunState::Running;
        spdlog::info!("Run {run_number} started");
        Ok(())
    }

    /// Ask for the end of the run. The run file closes once every producer has sent its
    /// end-of-run event.
    pub fn stop_run(&mut self) -> Result<(), CollectorError> {
        self.shared.merger.control(Control::StopRun)?;
        if self.state == RunState::Running {
            self.state = RunState::Idle;
        }
        spdlog::info!("Run {} stopping", self.run_number);
        Ok(())
    }

    /// Mark the current run as ended by a fatal error
    pub fn abort_run(&mut self, reason: &FatalError) {
        spdlog::error!("Run {} aborted: {reason}", self.run_number);
        self.state = RunState::Aborted;
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn status(&self) -> CollectorStatus {
        CollectorStatus::new(
            self.run_number,
            self.events_merged.load(Ordering::Relaxed),
            self.bytes_written.load(Ordering::Relaxed),
            self.shared.connected(),
            self.state,
        )
    }

    /// Receiver of fatal errors raised inside the pipeline
    pub fn fatal_errors(&self) -> Option<flume::Receiver<FatalError>> {
        self.pipeline.as_ref().map(|p| p.fatal_errors())
    }

    /// Stop accepting, hang up on producers and drain the pipeline into the sink
    pub fn shutdown(mut self) -> Result<(), CollectorError> {
        self.halt();
        self.state = RunState::Terminated;
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.shutdown()?;
        }
        spdlog::info!("Collector shut down; {}", self.status());
        Ok(())
    }

    fn halt(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        if let Some(acceptor) = self.acceptor.take() {
            if acceptor.join().is_err() {
                spdlog::error!("Acceptor thread panicked");
            }
        }
        self.shared.hang_up();
        let connections = match self.shared.connections.lock() {
            Ok(mut connections) => std::mem::take(&mut *connections),
            Err(_) => Vec::new(),
        };
        for connection in connections {
            if connection.join().is_err() {
                spdlog::error!("A producer thread panicked");
            }
        }
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        if self.acceptor.is_some() {
            self.halt();
        }
    }
}

fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    while !shared.stop.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                spdlog::info!("Connection from {peer}");
                let thread_shared = shared.clone();
                let spawned = std::thread::Builder::new()
                    .name(format!("producer-{peer}"))
                    .spawn(move || serve_producer(stream, peer, thread_shared));
                match spawned {
                    Ok(handle) => {
                        if let Ok(mut connections) = shared.connections.lock() {
                            connections.retain(|c| !c.is_finished());
                            connections.push(handle);
                        }
                    }
                    Err(e) => spdlog::error!("Could not start a thread for {peer}: {e}"),
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL_INTERVAL)
            }
            Err(e) => {
                spdlog::warn!("Accept failed: {e}");
                std::thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }
    spdlog::debug!("Acceptor stopped");
}

fn serve_producer(mut stream: TcpStream, peer: SocketAddr, shared: Arc<Shared>) {
    let id = match handshake(&mut stream, &shared) {
        Ok(id) => id,
        Err(e) => {
            spdlog::warn!("Handshake with {peer} failed: {e}");
            return;
        }
    };
    match receive(&mut stream, id, &shared) {
        Ok(count) | Err((count, ProtocolError::ConnectionClosed)) => {
            spdlog::info!("Source {id} at {peer} disconnected after {count} events")
        }
        Err((count, e)) => {
            spdlog::warn!("Dropping source {id} at {peer} after {count} events: {e}")
        }
    }
    shared.release(id);
    if let Err(e) = shared.merger.control(Control::SourceDisconnected { id }) {
        spdlog::warn!("Could not report the disconnect of source {id}: {e}");
    }
}

fn handshake(stream: &mut TcpStream, shared: &Shared) -> Result<u32, ProtocolError> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
    write_text(stream, &greeting(&shared.collector_name))?;
    let line = read_text(stream)?;
    stream.set_read_timeout(None)?;
    let identity = match parse_identification(&line) {
        Ok(identity) => identity,
        Err(e) => {
            let _ = write_text(stream, &format!("ERROR {e}"));
            return Err(e);
        }
    };
    let id = match shared.admit(&identity.name, stream) {
        Ok(id) => id,
        Err(e) => {
            let _ = write_text(stream, &format!("ERROR {e}"));
            return Err(e);
        }
    };
    // the merger learns about the source before the producer may send anything
    if shared
        .merger
        .control(Control::SourceConnected {
            id,
            name: identity.name.clone(),
        })
        .is_err()
    {
        shared.release(id);
        return Err(ProtocolError::ConnectionClosed);
    }
    write_text(stream, HANDSHAKE_OK)?;
    spdlog::info!(
        "Producer {} ({}) connected as source {id}",
        identity.name,
        identity.producer_type
    );
    Ok(id)
}

/// Read frames until the stream ends. Returns the number of events received.
fn receive(stream: &mut TcpStream, id: u32, shared: &Shared) -> Result<u64, (u64, ProtocolError)> {
    let mut count = 0;
    loop {
        let (frame_type, payload) = read_frame(stream).map_err(|e| (count, e))?;
        if frame_type == FRAME_TYPE_TEXT {
            spdlog::debug!(
                "Source {id} says {:?}",
                String::from_utf8_lossy(&payload)
            );
            continue;
        }
        let event = decode_event(&payload)
            .map_err(|e| (count, e))?
            .with_source(id)
            .into_ref();
        spdlog::trace!("Source {id} sent event {}", event.event_number());
        if let Err(e) = shared.merger.send(event) {
            spdlog::warn!("Source {id}: pipeline refused event: {e}");
            return Ok(count);
        }
        count += 1;
    }
}
