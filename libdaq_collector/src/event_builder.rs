use super::event::{Event, EventFlags, EventKind, EventRef, Interval};

/// EventBuilder composes the merged events a merger emits.
///
/// Every merged event is a `Sync` packet stamped with the collector's id and the current run
/// number. Event numbers count up from 0 in emission order and restart with each run, so the
/// framing BORE of a run is always event 0.
#[derive(Debug, Clone)]
pub struct EventBuilder {
    collector_id: u32,
    run_number: u32,
    next_event_number: u32,
}

impl EventBuilder {
    /// Create a new EventBuilder.
    ///
    /// Requires the source id merged events are stamped with.
    pub fn new(collector_id: u32) -> Self {
        EventBuilder {
            collector_id,
            run_number: 0,
            next_event_number: 0,
        }
    }

    /// Restart numbering for a new run
    pub fn start_run(&mut self, run_number: u32) {
        self.run_number = run_number;
        self.next_event_number = 0;
    }

    pub fn run_number(&self) -> u32 {
        self.run_number
    }

    /// Number of events built in the current run
    pub fn built(&self) -> u32 {
        self.next_event_number
    }

    /// Start a merged event covering a timestamp window. Sub-events are attached by the
    /// caller before it is published.
    pub fn window(&mut self, window: Interval) -> Event {
        self.packet().with_timestamp(window)
    }

    /// Start a merged event for one trigger number
    pub fn trigger(&mut self, trigger_number: u32) -> Event {
        self.packet().with_trigger(trigger_number)
    }

    /// Build the aggregated framing event (BORE or EORE) out of the per-source markers
    pub fn framing(&mut self, marker: EventFlags, markers: Vec<EventRef>) -> EventRef {
        let mut event = self.packet().with_flags(marker);
        for sub_event in markers {
            event.push_sub_event(sub_event);
        }
        event.into_ref()
    }

    fn packet(&mut self) -> Event {
        let event = Event::new(EventKind::Sync, self.collector_id, self.run_number)
            .with_event_number(self.next_event_number)
            .with_flags(EventFlags::PACKET);
        self.next_event_number += 1;
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numbering_restarts_per_run() {
        let mut evb = EventBuilder::new(9);
        evb.start_run(12);
        let bore = evb.framing(EventFlags::BORE, vec![]);
        let first = evb.trigger(1);
        assert_eq!(bore.event_number(), 0);
        assert!(bore.is_bore() && bore.is_packet());
        assert_eq!(first.event_number(), 1);
        assert_eq!(first.run_number(), 12);
        assert_eq!(first.source_id(), 9);
        assert_eq!(first.kind(), &EventKind::Sync);

        evb.start_run(13);
        let window = evb.window(Interval::new(0, 10).unwrap());
        assert_eq!(window.event_number(), 0);
        assert_eq!(window.run_number(), 13);
        assert_eq!(window.timestamp(), Some(Interval { begin: 0, end: 10 }));
    }
}
