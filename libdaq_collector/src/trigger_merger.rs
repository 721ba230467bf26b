use super::config::MergeMode;
use super::error::MergerError;
use super::event::{Event, EventRef};
use super::event_builder::EventBuilder;
use super::merger::{MatchStrategy, Merger, SourceSlot};

/// Stream merger joining on trigger number
pub type TriggerMerger = Merger<TriggerMatch>;

/// Matches events that carry the same trigger number.
///
/// A merge is attempted only when every active source has something queued. The smallest
/// front trigger is merged, taking the fronts of all sources that carry it; a source whose
/// front is higher simply has a gap at that trigger. Sources that have finished (end of
/// run or disconnect) and run dry stop being waited on.
#[derive(Debug, Default)]
pub struct TriggerMatch;

impl TriggerMatch {
    pub fn new() -> Self {
        Self
    }
}

impl MatchStrategy for TriggerMatch {
    fn mode(&self) -> MergeMode {
        MergeMode::Trigger
    }

    fn check(&self, slot: &SourceSlot, event: &Event) -> Result<(), MergerError> {
        let trigger = match event.trigger_number() {
            Some(t) => t,
            None => return Err(MergerError::MalformedEvent(slot.id, "missing trigger number")),
        };
        match slot.previous_trigger {
            Some(previous) if trigger <= previous => Err(MergerError::TriggerOutOfOrder {
                source_id: slot.id,
                trigger,
                previous,
            }),
            _ => Ok(()),
        }
    }

    fn commit(&mut self, slot: &mut SourceSlot, event: &Event) {
        slot.previous_trigger = event.trigger_number();
    }

    fn drain(&mut self, slots: &mut [SourceSlot], builder: &mut EventBuilder) -> Vec<EventRef> {
        let mut merged = Vec::new();
        loop {
            let mut min_trigger: Option<u32> = None;
            for slot in slots.iter().filter(|slot| slot.is_active()) {
                // an active source with nothing queued blocks the join
                let trigger = match slot.queue.front() {
                    Some(front) => front.trigger_number().unwrap_or(u32::MAX),
                    None => return merged,
                };
                min_trigger = Some(min_trigger.map_or(trigger, |m| m.min(trigger)));
            }
            let trigger = match min_trigger {
                Some(t) => t,
                None => return merged,
            };

            let mut event = builder.trigger(trigger);
            for slot in slots.iter_mut() {
                let matches = slot
                    .queue
                    .front()
                    .is_some_and(|front| front.trigger_number() == Some(trigger));
                if matches {
                    if let Some(front) = slot.queue.pop_front() {
                        event.push_sub_event(front);
                    }
                }
            }
            spdlog::trace!(
                "Merged trigger {trigger} from {} sources",
                event.sub_events().len()
            );
            merged.push(event.into_ref());
        }
    }

    fn reset(&mut self) {}
}
