use super::config::MergeMode;
use super::error::MergerError;
use super::event::{Event, EventRef, Interval};
use super::event_builder::EventBuilder;
use super::merger::{MatchStrategy, Merger, SourceSlot};

/// Stream merger joining on overlapping timestamp intervals
pub type TimestampMerger = Merger<TimestampMatch>;

/// Matches events whose half-open timestamp intervals overlap a shared window.
///
/// The open window is `[cur_beg, cur_end)`. Every queued event widens its beginning and
/// narrows its end. A source is ready when its newest event ends at or after `cur_end`
/// (nothing it sends later can touch the window) or when it has finished and still holds
/// events. While every active source is ready the window is closed: each source's front is
/// dropped (stale), attached and popped (consumed), attached and kept (it extends into
/// the next window) or left alone (it begins at or after `cur_end`). The bounds of the
/// next window are collected while classifying.
#[derive(Debug)]
pub struct TimestampMatch {
    last_end: u64,
    /// `[cur_beg, cur_end)`, open while any event is waiting
    window: Option<Interval>,
}

impl Default for TimestampMatch {
    fn default() -> Self {
        Self::new()
    }
}

/// Widen the beginning and narrow the end of a window, opening it if needed
fn seed(window: &mut Option<Interval>, begin: u64, end: u64) {
    *window = Some(match *window {
        Some(open) => Interval {
            begin: open.begin.min(begin),
            end: open.end.min(end),
        },
        None => Interval { begin, end },
    });
}

impl TimestampMatch {
    pub fn new() -> Self {
        Self {
            last_end: 0,
            window: None,
        }
    }

    /// Right edge of the last closed window
    pub fn last_end(&self) -> u64 {
        self.last_end
    }

    /// The open window, if any event is waiting
    pub fn window(&self) -> Option<Interval> {
        self.window
    }

    fn is_ready(slot: &SourceSlot, window: Interval) -> bool {
        match slot.queue.back().and_then(|back| back.timestamp()) {
            Some(ts) => !slot.is_live() || ts.end >= window.end,
            None => false,
        }
    }

    /// Classify one source's queue against the open window, collecting what it contributes
    fn classify(
        window: Interval,
        slot: &mut SourceSlot,
        attached: &mut Vec<EventRef>,
        next: &mut Option<Interval>,
    ) {
        while let Some(front) = slot.queue.front() {
            let ts = match front.timestamp() {
                Some(ts) => ts,
                None => {
                    slot.queue.pop_front();
                    continue;
                }
            };
            if ts.end <= window.begin {
                spdlog::warn!(
                    "Source {} event {} at {ts} is older than window {window}; dropping it",
                    slot.id,
                    front.event_number()
                );
                slot.queue.pop_front();
            } else if ts.begin >= window.end {
                seed(next, ts.begin, ts.end);
                break;
            } else if ts.end <= window.end {
                if let Some(front) = slot.queue.pop_front() {
                    attached.push(front);
                }
            } else {
                attached.push(front.clone());
                seed(next, window.end, ts.end);
                if let Some(ts) = slot.queue.get(1).and_then(|following| following.timestamp()) {
                    seed(next, ts.begin, ts.end);
                }
                break;
            }
        }
    }
}

impl MatchStrategy for TimestampMatch {
    fn mode(&self) -> MergeMode {
        MergeMode::Timestamp
    }

    fn check(&self, slot: &SourceSlot, event: &Event) -> Result<(), MergerError> {
        let ts = match event.timestamp() {
            Some(ts) => ts,
            None => return Err(MergerError::MalformedEvent(slot.id, "missing timestamp")),
        };
        ts.validate()
            .map_err(|e| MergerError::BadInterval(slot.id, e))?;
        if ts.begin < self.last_end {
            return Err(MergerError::BeforeLastEnd {
                source_id: slot.id,
                begin: ts.begin,
                last_end: self.last_end,
            });
        }
        match slot.previous_end {
            Some(previous_end) if ts.begin < previous_end => Err(MergerError::OverlapsPrevious {
                source_id: slot.id,
                begin: ts.begin,
                previous_end,
            }),
            _ => Ok(()),
        }
    }

    fn commit(&mut self, slot: &mut SourceSlot, event: &Event) {
        if let Some(ts) = event.timestamp() {
            slot.previous_end = Some(ts.end);
            seed(&mut self.window, ts.begin, ts.end);
        }
    }

    fn drain(&mut self, slots: &mut [SourceSlot], builder: &mut EventBuilder) -> Vec<EventRef> {
        let mut merged = Vec::new();
        loop {
            let window = match self.window {
                Some(window) => window,
                None => return merged,
            };
            let mut any_active = false;
            for slot in slots.iter().filter(|slot| slot.is_active()) {
                if !Self::is_ready(slot, window) {
                    return merged;
                }
                any_active = true;
            }
            if !any_active {
                return merged;
            }

            let mut next = None;
            let mut attached = Vec::new();
            for slot in slots.iter_mut().filter(|slot| !slot.queue.is_empty()) {
                Self::classify(window, slot, &mut attached, &mut next);
            }
            // a window holding only stale events produces nothing
            if !attached.is_empty() {
                spdlog::trace!(
                    "Closed window {window} with {} sub-events",
                    attached.len()
                );
                let mut event = builder.window(window);
                for sub_event in attached {
                    event.push_sub_event(sub_event);
                }
                merged.push(event.into_ref());
            }

            self.last_end = window.end;
            self.window = next;
        }
    }

    fn reset(&mut self) {
        *self = Self::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MergerConfig;
    use crate::event::EventKind;
    use crate::merger::{MergerState, StreamMerger};
    use crate::wire::encode_event;

    fn running(sources: &[u32]) -> TimestampMerger {
        let mut merger =
            TimestampMerger::new(TimestampMatch::new(), &MergerConfig::default(), 50);
        for id in sources {
            merger.connect(*id, &format!("source{id}")).unwrap();
        }
        merger.start_run(2);
        for id in sources {
            merger
                .push(*id, Event::bore(EventKind::Raw, *id, 2).into_ref())
                .unwrap();
        }
        merger
    }

    fn data(source: u32, begin: u64, end: u64) -> EventRef {
        Event::new(EventKind::Raw, source, 2)
            .with_timestamp(Interval { begin, end })
            .into_ref()
    }

    fn parts(event: &EventRef) -> Vec<(u32, u64, u64)> {
        event
            .sub_events()
            .iter()
            .map(|s| {
                let ts = s.timestamp().unwrap();
                (s.source_id(), ts.begin, ts.end)
            })
            .collect()
    }

    #[test]
    fn test_two_source_windows() {
        let mut m = running(&[1, 2]);
        assert!(m.push(1, data(1, 0, 10)).unwrap().is_empty());
        assert!(m.push(1, data(1, 10, 25)).unwrap().is_empty());
        let out = m.push(2, data(2, 5, 20)).unwrap();
        assert_eq!(out.len(), 2);

        // b's [5, 20) cannot be followed by anything overlapping [0, 10), so it joins
        // the first window as well as the second
        assert_eq!(out[0].timestamp(), Some(Interval { begin: 0, end: 10 }));
        assert_eq!(parts(&out[0]), vec![(1, 0, 10), (2, 5, 20)]);
        assert_eq!(out[1].timestamp(), Some(Interval { begin: 10, end: 20 }));
        assert_eq!(parts(&out[1]), vec![(1, 10, 25), (2, 5, 20)]);

        // window 3 needs b to move past 25
        let second = out;
        let out = m.push(2, data(2, 20, 30)).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].timestamp(), Some(Interval { begin: 20, end: 25 }));
        assert_eq!(parts(&out[0]), vec![(1, 10, 25), (2, 20, 30)]);
        // a's [10, 25) is shared by two windows, not copied
        assert!(std::sync::Arc::ptr_eq(
            &second[1].sub_events()[0],
            &out[0].sub_events()[0]
        ));
        assert_eq!(m.strategy().last_end(), 25);
        assert_eq!(m.strategy().window(), Some(Interval { begin: 25, end: 30 }));
    }

    #[test]
    fn test_windows_never_overlap() {
        let mut m = running(&[1, 2, 3]);
        let mut windows = Vec::new();
        let streams: [&[(u64, u64)]; 3] = [
            &[(0, 7), (7, 9), (12, 30), (31, 40)],
            &[(2, 3), (3, 15), (15, 16), (20, 41)],
            &[(1, 11), (11, 22), (22, 23), (25, 39)],
        ];
        for step in 0..4 {
            for (index, stream) in streams.iter().enumerate() {
                let (begin, end) = stream[step];
                let source = index as u32 + 1;
                for event in m.push(source, data(source, begin, end)).unwrap() {
                    windows.push(event.timestamp().unwrap());
                }
            }
        }
        for source in 1..=3 {
            let eore = Event::eore(EventKind::Raw, source, 2).into_ref();
            for event in m.push(source, eore).unwrap() {
                if let Some(ts) = event.timestamp() {
                    windows.push(ts);
                }
            }
        }
        assert_eq!(m.state(), MergerState::Idle);
        assert!(windows.len() > 3);
        for pair in windows.windows(2) {
            assert!(pair[0].begin < pair[0].end);
            assert!(pair[0].end <= pair[1].begin);
        }
    }

    #[test]
    fn test_equal_end_is_consumed() {
        let mut m = running(&[1, 2]);
        m.push(1, data(1, 0, 10)).unwrap();
        let out = m.push(2, data(2, 4, 10)).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(parts(&out[0]), vec![(1, 0, 10), (2, 4, 10)]);
        assert_eq!(m.pending(), 0);
        // an event starting exactly at the old edge belongs to the next window only
        m.push(1, data(1, 10, 12)).unwrap();
        let out = m.push(2, data(2, 10, 12)).unwrap();
        assert_eq!(out[0].timestamp(), Some(Interval { begin: 10, end: 12 }));
        assert_eq!(out[0].sub_events().len(), 2);
    }

    #[test]
    fn test_ordering_violation_aborts_run() {
        let mut m = running(&[1, 2]);
        m.push(1, data(1, 0, 10)).unwrap();
        assert_eq!(m.push(2, data(2, 0, 10)).unwrap().len(), 1);
        m.push(1, data(1, 10, 20)).unwrap();
        let err = m.push(2, data(2, 5, 15)).unwrap_err();
        assert_eq!(
            err,
            MergerError::BeforeLastEnd {
                source_id: 2,
                begin: 5,
                last_end: 10
            }
        );
        assert_eq!(m.state(), MergerState::Aborted);
        assert_eq!(m.pending(), 0);
        assert_eq!(m.push(2, data(2, 20, 30)), Err(MergerError::RunAborted(2)));
    }

    #[test]
    fn test_bad_intervals_are_fatal() {
        let mut m = running(&[1]);
        let err = m.push(1, data(1, 8, 8)).unwrap_err();
        assert!(matches!(err, MergerError::BadInterval(1, _)));
        assert!(err.is_fatal());

        let mut m = running(&[1, 2]);
        m.push(1, data(1, 0, 10)).unwrap();
        let err = m.push(1, data(1, 9, 12)).unwrap_err();
        assert!(matches!(err, MergerError::OverlapsPrevious { source_id: 1, .. }));
    }

    #[test]
    fn test_window_reaching_the_end_of_time() {
        let mut m = running(&[1]);
        let out = m.push(1, data(1, 5, u64::MAX)).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].timestamp(), Some(Interval { begin: 5, end: u64::MAX }));
        assert_eq!(parts(&out[0]), vec![(1, 5, u64::MAX)]);
        assert_eq!(m.strategy().window(), None);
        assert_eq!(m.strategy().last_end(), u64::MAX);
    }

    #[test]
    fn test_replay_is_byte_identical() {
        let replay = || {
            let mut m = running(&[1, 2]);
            let mut bytes = Vec::new();
            for step in 0..20u64 {
                let begin = step * 10;
                for event in m.push(1, data(1, begin, begin + 10)).unwrap() {
                    bytes.extend(encode_event(&event));
                }
                if step % 2 == 0 {
                    let end = begin + 20;
                    for event in m.push(2, data(2, begin + 5, end)).unwrap() {
                        bytes.extend(encode_event(&event));
                    }
                }
            }
            bytes
        };
        let first = replay();
        assert!(!first.is_empty());
        assert_eq!(first, replay());
    }
}
