use std::sync::Mutex;

use tokio::sync::broadcast;

use crate::events::{OffsetEvent, SearchStringChanged};
use crate::query_builder::escape_string;

const EVENT_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy)]
struct OffsetState {
    offset: u32,
    count: u32,
}

/// Pagination state for the paged overview queries.
#[derive(Debug)]
pub struct OffsetController {
    step: u32,
    state: Mutex<OffsetState>,
    events: broadcast::Sender<OffsetEvent>,
}

impl OffsetController {
    pub fn new(step: u32) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            step,
            state: Mutex::new(OffsetState {
                offset: 0,
                count: 0,
            }),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OffsetEvent> {
        self.events.subscribe()
    }

    pub fn step(&self) -> u32 {
        self.step
    }

    pub fn offset(&self) -> u32 {
        self.state.lock().expect("offset mutex poisoned").offset
    }

    pub fn count(&self) -> u32 {
        self.state.lock().expect("offset mutex poisoned").count
    }

    /// Records the item count reported by a count query.
    pub fn set_count(&self, count: u32) {
        {
            let mut state = self.state.lock().expect("offset mutex poisoned");
            if state.count == count {
                return;
            }
            state.count = count;
        }
        let _ = self.events.send(OffsetEvent::CountChanged(count));
    }

    /// Number of items not loaded yet, capped at one step.
    pub fn remaining(&self) -> u32 {
        let state = *self.state.lock().expect("offset mutex poisoned");
        state
            .count
            .saturating_sub(state.offset + self.step)
            .min(self.step)
    }

    pub fn increase_offset(&self) -> u32 {
        let offset = {
            let mut state = self.state.lock().expect("offset mutex poisoned");
            state.offset += self.step;
            state.offset
        };
        let _ = self.events.send(OffsetEvent::OffsetChanged(offset));
        offset
    }

    pub fn set_offset(&self, offset: u32) {
        self.state.lock().expect("offset mutex poisoned").offset = offset;
        let _ = self.events.send(OffsetEvent::OffsetChanged(offset));
    }

    pub fn reset_offset(&self) {
        self.state.lock().expect("offset mutex poisoned").offset = 0;
        let _ = self.events.send(OffsetEvent::OffsetChanged(0));
    }
}

impl Default for OffsetController {
    fn default() -> Self {
        Self::new(crate::query::DEFAULT_STEP)
    }
}

/// Free-text search string typed by the user.
#[derive(Debug)]
pub struct SearchController {
    string: Mutex<String>,
    events: broadcast::Sender<SearchStringChanged>,
}

impl SearchController {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            string: Mutex::new(String::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SearchStringChanged> {
        self.events.subscribe()
    }

    pub fn string(&self) -> String {
        self.string.lock().expect("search mutex poisoned").clone()
    }

    pub fn set_string(&self, value: &str) {
        {
            let mut current = self.string.lock().expect("search mutex poisoned");
            if *current == value {
                return;
            }
            *current = value.to_string();
        }
        let _ = self
            .events
            .send(SearchStringChanged(value.to_string()));
    }

    /// Escaped, lower-cased search terms. Runs of spaces do not produce
    /// empty terms.
    pub fn terms(&self) -> Vec<String> {
        escape_string(&self.string())
            .to_lowercase()
            .split(' ')
            .filter(|term| !term.is_empty())
            .map(str::to_string)
            .collect()
    }
}

impl Default for SearchController {
    fn default() -> Self {
        Self::new()
    }
}
