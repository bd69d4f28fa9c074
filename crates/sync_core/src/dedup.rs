use std::collections::{HashSet, VecDeque};

use shared::{domain::EventId, event::RelayEvent};
use tokio::sync::Mutex;

/// Bounded, insertion-ordered set of processed event ids.
///
/// Once `capacity` is exceeded the oldest ids are evicted first. Shared by every
/// conversation task, so all access goes through one lock.
pub struct DedupTracker {
    capacity: usize,
    inner: Mutex<DedupState>,
}

#[derive(Default)]
struct DedupState {
    ids: HashSet<EventId>,
    order: VecDeque<EventId>,
}

impl DedupState {
    fn insert(&mut self, id: &EventId, capacity: usize) -> bool {
        if !self.ids.insert(id.clone()) {
            return false;
        }
        self.order.push_back(id.clone());
        while self.order.len() > capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }
}

impl DedupTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(DedupState::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn seen(&self, id: &EventId) -> bool {
        self.inner.lock().await.ids.contains(id)
    }

    pub async fn mark(&self, id: &EventId) {
        self.inner.lock().await.insert(id, self.capacity);
    }

    /// Marks `id` and reports whether it was new.
    pub async fn check_and_mark(&self, id: &EventId) -> bool {
        self.inner.lock().await.insert(id, self.capacity)
    }

    /// Keeps the events not seen before, marking them. Repeats within `events` are dropped too.
    pub async fn retain_fresh(&self, events: Vec<RelayEvent>) -> Vec<RelayEvent> {
        let mut state = self.inner.lock().await;
        events
            .into_iter()
            .filter(|event| state.insert(&event.id, self.capacity))
            .collect()
    }

    pub async fn forget<'a>(&self, ids: impl IntoIterator<Item = &'a EventId>) {
        let mut state = self.inner.lock().await;
        let mut removed = false;
        for id in ids {
            removed |= state.ids.remove(id);
        }
        if removed {
            let DedupState { ids, order } = &mut *state;
            order.retain(|id| ids.contains(id));
        }
    }

    pub async fn clear(&self) {
        let mut state = self.inner.lock().await;
        state.ids.clear();
        state.order.clear();
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.order.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Tracked ids, oldest first.
    pub async fn snapshot(&self) -> Vec<EventId> {
        self.inner.lock().await.order.iter().cloned().collect()
    }
}

#[cfg(test)]
#[path = "tests/dedup_tests.rs"]
mod tests;
