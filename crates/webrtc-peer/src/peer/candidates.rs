//! Outgoing ICE candidate buffering and delivery
//!
//! Candidates may be gathered before the application subscribes. Until the
//! first subscription arrives every candidate, and at most one end-of-gathering
//! marker per cycle, is queued. The first subscription flushes the queue in
//! production order and switches to direct delivery for good.

use super::events::{CandidateHandler, GatheringDoneHandler, Subscribers, SubscriptionId};
use crate::sdp::{IceCandidate, SdpTranslator};
use parking_lot::{Mutex, ReentrantMutex};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
enum Entry {
    Candidate(IceCandidate),
    GatheringDone,
}

struct State {
    buffering: bool,
    gathering_done: bool,
    queue: VecDeque<Entry>,
    candidate_subscribers: Subscribers<dyn Fn(IceCandidate) + Send + Sync>,
    done_subscribers: Subscribers<dyn Fn() + Send + Sync>,
}

pub(crate) struct CandidateDispatcher {
    /// Serializes deliveries so a flush and a live candidate never reorder.
    /// Reentrant so handlers may subscribe or unsubscribe.
    delivery: ReentrantMutex<()>,
    state: Mutex<State>,
    translator: Option<Arc<dyn SdpTranslator>>,
}

impl CandidateDispatcher {
    pub(crate) fn new(translator: Option<Arc<dyn SdpTranslator>>) -> Self {
        Self {
            delivery: ReentrantMutex::new(()),
            state: Mutex::new(State {
                buffering: true,
                gathering_done: false,
                queue: VecDeque::new(),
                candidate_subscribers: Subscribers::new(),
                done_subscribers: Subscribers::new(),
            }),
            translator,
        }
    }

    /// Handle a candidate event from the connection; `None` ends gathering
    pub(crate) fn handle(&self, candidate: Option<IceCandidate>) {
        let candidate = match candidate {
            Some(c) => match self.translate(c) {
                Some(c) => Some(c),
                None => return,
            },
            None => None,
        };

        let _delivery = self.delivery.lock();
        let mut state = self.state.lock();

        if state.buffering {
            match candidate {
                Some(c) => {
                    state.gathering_done = false;
                    state.queue.push_back(Entry::Candidate(c));
                }
                None if !state.gathering_done => {
                    state.gathering_done = true;
                    state.queue.push_back(Entry::GatheringDone);
                }
                None => {}
            }
            debug!(queued = state.queue.len(), "Buffered ICE event, no subscriber yet");
            return;
        }

        match candidate {
            Some(c) => {
                state.gathering_done = false;
                let handlers = state.candidate_subscribers.snapshot();
                drop(state);
                for handler in handlers {
                    handler(c.clone());
                }
            }
            None => {
                if state.gathering_done {
                    return;
                }
                state.gathering_done = true;
                let handlers = state.done_subscribers.snapshot();
                drop(state);
                debug!("ICE candidate gathering done");
                for handler in handlers {
                    handler();
                }
            }
        }
    }

    pub(crate) fn subscribe_candidates(&self, handler: CandidateHandler) -> SubscriptionId {
        let _delivery = self.delivery.lock();
        let mut state = self.state.lock();
        let id = state.candidate_subscribers.add(Arc::clone(&handler));
        let replay = Self::end_buffering(&mut state);
        drop(state);

        for entry in replay {
            match entry {
                Entry::Candidate(c) => handler(c),
                Entry::GatheringDone => {
                    debug!("Discarding buffered end-of-gathering marker: no gathering-done subscriber")
                }
            }
        }
        id
    }

    pub(crate) fn subscribe_gathering_done(&self, handler: GatheringDoneHandler) -> SubscriptionId {
        let _delivery = self.delivery.lock();
        let mut state = self.state.lock();
        let id = state.done_subscribers.add(Arc::clone(&handler));
        let replay = Self::end_buffering(&mut state);
        drop(state);

        let mut discarded = 0usize;
        for entry in replay {
            match entry {
                Entry::GatheringDone => handler(),
                Entry::Candidate(_) => discarded += 1,
            }
        }
        if discarded > 0 {
            debug!(discarded, "Discarding buffered candidates: no candidate subscriber");
        }
        id
    }

    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut state = self.state.lock();
        state.candidate_subscribers.remove(id) || state.done_subscribers.remove(id)
    }

    /// Start a new gathering cycle (fresh connection)
    pub(crate) fn reset_cycle(&self) {
        self.state.lock().gathering_done = false;
    }

    /// Drop every subscriber and anything still queued
    pub(crate) fn clear(&self) {
        let mut state = self.state.lock();
        state.queue.clear();
        state.candidate_subscribers.clear();
        state.done_subscribers.clear();
    }

    #[cfg(test)]
    fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    fn end_buffering(state: &mut State) -> Vec<Entry> {
        if !state.buffering {
            return Vec::new();
        }
        state.buffering = false;
        let replay: Vec<Entry> = state.queue.drain(..).collect();
        debug!(entries = replay.len(), "Flushing buffered ICE events to first subscriber");
        replay
    }

    fn translate(&self, candidate: IceCandidate) -> Option<IceCandidate> {
        let Some(translator) = &self.translator else {
            return Some(candidate);
        };
        match translator.candidate_to_unified_plan(&candidate) {
            Ok(c) => Some(c),
            Err(e) => {
                warn!("Dropping ICE candidate that failed translation: {}", e);
                None
            }
        }
    }
}
