//! Subscriber registries for peer events

use crate::connection::RemoteTrack;
use crate::media::MediaTrack;
use crate::sdp::IceCandidate;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_SUBSCRIPTION: AtomicU64 = AtomicU64::new(1);

/// Handle returned by every `on_*` registration, accepted by `Peer::unsubscribe`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    fn next() -> Self {
        SubscriptionId(NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed))
    }
}

pub type CandidateHandler = Arc<dyn Fn(IceCandidate) + Send + Sync>;
pub type GatheringDoneHandler = Arc<dyn Fn() + Send + Sync>;
pub type StreamEndedHandler = Arc<dyn Fn(MediaTrack) + Send + Sync>;
pub type TrackHandler = Arc<dyn Fn(RemoteTrack) + Send + Sync>;
pub type NegotiationNeededHandler = Arc<dyn Fn() + Send + Sync>;

/// Ordered set of handlers keyed by subscription id
///
/// Not synchronized; owners keep it behind their own lock and call the
/// handlers from a [`Subscribers::snapshot`] after releasing it.
pub(crate) struct Subscribers<T: ?Sized> {
    entries: Vec<(SubscriptionId, Arc<T>)>,
}

impl<T: ?Sized> Subscribers<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub(crate) fn add(&mut self, handler: Arc<T>) -> SubscriptionId {
        let id = SubscriptionId::next();
        self.entries.push((id, handler));
        id
    }

    pub(crate) fn remove(&mut self, id: SubscriptionId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry, _)| *entry != id);
        self.entries.len() != before
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<T>> {
        self.entries.iter().map(|(_, h)| Arc::clone(h)).collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}
