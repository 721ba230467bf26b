use std::collections::VecDeque;

use super::event::EventRef;
use super::node::{Context, Control, Node, Outcome};

/// Puts a bounded FIFO in front of a node that is sometimes busy.
///
/// When the wrapped node answers `BusyRetry` the event is held here and offered again on
/// the next cycle, ahead of anything newer. Only when this FIFO is full does the
/// `BusyRetry` travel upstream. Nothing is ever discarded here. Controls arriving while
/// events are held wait in the same FIFO, so the wrapped node sees them in order.
pub struct BufferingNode<N: Node> {
    inner: N,
    buffer: VecDeque<Held>,
    capacity: usize,
    stop_requested: bool,
}

enum Held {
    Event(EventRef),
    Control(Control),
}

impl<N: Node> BufferingNode<N> {
    pub fn new(inner: N, capacity: usize) -> Self {
        Self {
            inner,
            buffer: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            stop_requested: false,
        }
    }

    /// Number of events held
    pub fn buffered(&self) -> usize {
        self.buffer
            .iter()
            .filter(|held| matches!(held, Held::Event(_)))
            .count()
    }

    pub fn inner(&self) -> &N {
        &self.inner
    }

    /// Offer the held events and controls in order until the inner node pushes back
    fn drain(&mut self, ctx: &mut Context) {
        while let Some(held) = self.buffer.front() {
            let front = match held {
                Held::Event(event) => event.clone(),
                Held::Control(control) => {
                    self.inner.control(control, ctx);
                    self.buffer.pop_front();
                    continue;
                }
            };
            match self.inner.process(front.clone(), ctx) {
                Outcome::BusyRetry => return,
                Outcome::BusySkip => {
                    spdlog::warn!(
                        "Node {} was busy; dropped buffered event {} from source {}",
                        self.inner.name(),
                        front.event_number(),
                        front.source_id()
                    );
                }
                Outcome::Stop => self.stop_requested = true,
                Outcome::Continue | Outcome::SkipEvent => (),
            }
            self.buffer.pop_front();
        }
    }
}

impl<N: Node> Node for BufferingNode<N> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn process(&mut self, event: EventRef, ctx: &mut Context) -> Outcome {
        self.drain(ctx);
        if self.stop_requested {
            return Outcome::Stop;
        }
        if !self.buffer.is_empty() {
            if self.buffered() >= self.capacity {
                return Outcome::BusyRetry;
            }
            self.buffer.push_back(Held::Event(event));
            return Outcome::Continue;
        }
        match self.inner.process(event.clone(), ctx) {
            Outcome::BusyRetry => {
                spdlog::debug!("Node {} is busy; buffering", self.inner.name());
                self.buffer.push_back(Held::Event(event));
                Outcome::Continue
            }
            outcome => outcome,
        }
    }

    fn control(&mut self, control: &Control, ctx: &mut Context) {
        self.drain(ctx);
        if self.buffer.is_empty() {
            self.inner.control(control, ctx);
        } else {
            self.buffer.push_back(Held::Control(control.clone()));
        }
    }

    fn flush(&mut self, ctx: &mut Context) {
        self.drain(ctx);
        if self.inner.has_pending() {
            self.inner.flush(ctx);
        }
    }

    fn has_pending(&self) -> bool {
        !self.buffer.is_empty() || self.inner.has_pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, EventKind};
    use crate::graph::GraphBuilder;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Refuses everything while `busy` is set
    struct Flaky {
        busy: Arc<AtomicBool>,
        accepted: Arc<Mutex<Vec<u32>>>,
    }

    impl Node for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        fn process(&mut self, event: EventRef, _ctx: &mut Context) -> Outcome {
            if self.busy.load(Ordering::SeqCst) {
                return Outcome::BusyRetry;
            }
            self.accepted.lock().unwrap().push(event.event_number());
            Outcome::Continue
        }
    }

    fn flaky() -> (Flaky, Arc<AtomicBool>, Arc<Mutex<Vec<u32>>>) {
        let busy = Arc::new(AtomicBool::new(true));
        let accepted = Arc::new(Mutex::new(Vec::new()));
        let node = Flaky {
            busy: busy.clone(),
            accepted: accepted.clone(),
        };
        (node, busy, accepted)
    }

    fn event(number: u32) -> EventRef {
        Event::new(EventKind::Raw, 1, 1)
            .with_event_number(number)
            .into_ref()
    }

    #[test]
    fn test_backpressure_without_loss() {
        let (inner, busy, accepted) = flaky();
        let mut node = BufferingNode::new(inner, 3);
        let (fatal_tx, _fatal_rx) = flume::unbounded();
        let mut ctx = Context::new("buffer", &fatal_tx);

        for n in 0..3 {
            assert_eq!(node.process(event(n), &mut ctx), Outcome::Continue);
        }
        assert_eq!(node.buffered(), 3);
        assert_eq!(node.process(event(3), &mut ctx), Outcome::BusyRetry);
        assert!(node.has_pending());

        busy.store(false, Ordering::SeqCst);
        // the refused event is offered again after the backlog
        assert_eq!(node.process(event(3), &mut ctx), Outcome::Continue);
        assert!(!node.has_pending());
        assert_eq!(*accepted.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    /// Logs events and controls in the order they arrive, refusing events while busy
    struct Journal {
        busy: Arc<AtomicBool>,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Node for Journal {
        fn name(&self) -> &str {
            "journal"
        }

        fn process(&mut self, event: EventRef, _ctx: &mut Context) -> Outcome {
            if self.busy.load(Ordering::SeqCst) {
                return Outcome::BusyRetry;
            }
            self.log.lock().unwrap().push(format!("event {}", event.event_number()));
            Outcome::Continue
        }

        fn control(&mut self, control: &Control, _ctx: &mut Context) {
            self.log.lock().unwrap().push(format!("{control:?}"));
        }
    }

    #[test]
    fn test_controls_wait_behind_held_events() {
        let busy = Arc::new(AtomicBool::new(true));
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut node = BufferingNode::new(
            Journal {
                busy: busy.clone(),
                log: log.clone(),
            },
            4,
        );
        let (fatal_tx, _fatal_rx) = flume::unbounded();
        let mut ctx = Context::new("buffer", &fatal_tx);

        node.process(event(0), &mut ctx);
        node.process(event(1), &mut ctx);
        node.control(&Control::StopRun, &mut ctx);
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(node.buffered(), 2);

        busy.store(false, Ordering::SeqCst);
        node.flush(&mut ctx);
        assert!(!node.has_pending());
        assert_eq!(*log.lock().unwrap(), vec!["event 0", "event 1", "StopRun"]);
    }

    #[test]
    fn test_backlog_drains_on_the_hub() {
        let (inner, busy, accepted) = flaky();
        let mut graph = GraphBuilder::new().with_hub_capacity(4);
        let sink = graph.add_queued(BufferingNode::new(inner, 2));
        let pipeline = graph.build().unwrap();
        let sender = pipeline.sender(sink).unwrap();

        let feeder = std::thread::spawn(move || {
            for n in 0..20 {
                sender.send(event(n)).unwrap();
            }
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        busy.store(false, Ordering::SeqCst);
        feeder.join().unwrap();
        pipeline.shutdown().unwrap();
        assert_eq!(*accepted.lock().unwrap(), (0..20).collect::<Vec<u32>>());
    }

    #[test]
    fn test_busy_sink_blocks_the_sender() {
        let (inner, busy, accepted) = flaky();
        let mut graph = GraphBuilder::new().with_hub_capacity(4);
        let sink = graph.add_queued(BufferingNode::new(inner, 2));
        let pipeline = graph.build().unwrap();
        let sender = pipeline.sender(sink).unwrap();
        let sent = Arc::new(AtomicUsize::new(0));

        let feeder = {
            let sent = sent.clone();
            std::thread::spawn(move || {
                for n in 0..500 {
                    sender.send(event(n)).unwrap();
                    sent.fetch_add(1, Ordering::SeqCst);
                }
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(300));
        // two buffered, one parked, four queued
        assert!(sent.load(Ordering::SeqCst) <= 8);
        assert!(!feeder.is_finished());

        busy.store(false, Ordering::SeqCst);
        feeder.join().unwrap();
        pipeline.shutdown().unwrap();
        assert_eq!(*accepted.lock().unwrap(), (0..500).collect::<Vec<u32>>());
    }
}
