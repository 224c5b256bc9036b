use std::cmp::Reverse;
use std::collections::hash_map::Entry;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// Idle deadlines for every session of a registry, kept in one min-heap and
/// drained by the registry's sweep thread.
///
/// Each session has at most one live heap entry. Pushing a deadline later
/// only records it; the entry is re-armed when it comes due. Pulling it
/// earlier pushes a new entry and the old one is discarded when popped.
#[derive(Debug, Default)]
pub(crate) struct IdleTimers {
    state: Mutex<TimerState>,
    wake: Condvar,
}

#[derive(Debug, Default)]
struct TimerState {
    queue: BinaryHeap<Reverse<(Instant, String)>>,
    /// Per session: the deadline of its live heap entry and the latest one asked for.
    deadlines: HashMap<String, Deadline>,
    stopped: bool,
}

#[derive(Debug, Clone, Copy)]
struct Deadline {
    queued: Instant,
    wanted: Instant,
}

impl IdleTimers {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn schedule(&self, session_id: &str, at: Instant) {
        let mut state = self.lock();
        if state.stopped {
            return;
        }
        let earliest = state.queue.peek().map(|Reverse((next, _))| *next);
        match state.deadlines.entry(session_id.to_string()) {
            Entry::Occupied(mut entry) => {
                let deadline = entry.get_mut();
                deadline.wanted = at;
                if at >= deadline.queued {
                    return;
                }
                deadline.queued = at;
            }
            Entry::Vacant(entry) => {
                entry.insert(Deadline { queued: at, wanted: at });
            }
        }
        state.queue.push(Reverse((at, session_id.to_string())));
        drop(state);
        if earliest.is_none_or(|next| at < next) {
            self.wake.notify_all();
        }
    }

    pub(crate) fn stop(&self) {
        self.lock().stopped = true;
        self.wake.notify_all();
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.lock().queue.len()
    }

    /// Blocks until a deadline is due or `until` passes, returning the due
    /// session ids (possibly none). Returns `None` once stopped.
    pub(crate) fn wait_due(&self, until: Instant) -> Option<Vec<String>> {
        let mut state = self.lock();
        loop {
            if state.stopped {
                return None;
            }
            let now = Instant::now();
            let mut due = Vec::new();
            while let Some(Reverse((at, _))) = state.queue.peek() {
                if *at > now {
                    break;
                }
                let Some(Reverse((at, id))) = state.queue.pop() else {
                    break;
                };
                let Some(deadline) = state.deadlines.get(&id).copied() else {
                    continue;
                };
                if deadline.queued != at {
                    // Superseded by an earlier deadline.
                    continue;
                }
                if deadline.wanted > now {
                    state.queue.push(Reverse((deadline.wanted, id.clone())));
                    state.deadlines.insert(
                        id,
                        Deadline {
                            queued: deadline.wanted,
                            wanted: deadline.wanted,
                        },
                    );
                    continue;
                }
                state.deadlines.remove(&id);
                due.push(id);
            }
            if !due.is_empty() || now >= until {
                return Some(due);
            }
            let next = state
                .queue
                .peek()
                .map(|Reverse((at, _))| (*at).min(until))
                .unwrap_or(until);
            state = self
                .wake
                .wait_timeout(state, next.saturating_duration_since(now))
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn lock(&self) -> MutexGuard<'_, TimerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
