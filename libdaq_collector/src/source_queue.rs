use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use super::error::QueueError;
use super::event::EventRef;

/// What a SourceQueue does when a push would exceed its capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Discard the oldest queued event to make room
    DropOldest,
    /// Discard the incoming event
    DropNewest,
    /// Refuse the incoming event and report the overflow to the caller
    #[default]
    Reject,
}

/// The per-producer FIFO of pending events.
///
/// A SourceQueue is owned by exactly one merger. Events come out in the order they went in;
/// the only way an event leaves other than `pop_front` is the configured overflow policy.
/// A capacity of 0 means unbounded.
#[derive(Debug, Clone)]
pub struct SourceQueue {
    events: VecDeque<EventRef>,
    capacity: usize,
    policy: OverflowPolicy,
}

impl SourceQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            events: VecDeque::new(),
            capacity,
            policy,
        }
    }

    /// Append an event.
    ///
    /// Returns `Ok(Some(event))` if the overflow policy discarded an event (the oldest for
    /// DropOldest, the incoming one for DropNewest), `Ok(None)` if nothing was lost.
    pub fn push(&mut self, event: EventRef) -> Result<Option<EventRef>, QueueError> {
        if self.capacity == 0 || self.events.len() < self.capacity {
            self.events.push_back(event);
            return Ok(None);
        }
        match self.policy {
            OverflowPolicy::DropOldest => {
                let dropped = self.events.pop_front();
                self.events.push_back(event);
                Ok(dropped)
            }
            OverflowPolicy::DropNewest => Ok(Some(event)),
            OverflowPolicy::Reject => Err(QueueError::Overflow(self.capacity)),
        }
    }

    pub fn front(&self) -> Option<&EventRef> {
        self.events.front()
    }

    pub fn get(&self, index: usize) -> Option<&EventRef> {
        self.events.get(index)
    }

    pub fn back(&self) -> Option<&EventRef> {
        self.events.back()
    }

    pub fn pop_front(&mut self) -> Option<EventRef> {
        self.events.pop_front()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
