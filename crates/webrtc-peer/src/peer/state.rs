//! Peer lifecycle state machine and readiness contract

use crate::{Error, Result};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Lifecycle state of a [`crate::Peer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// The initialization routine is running (construction or recovery)
    Initializing,
    /// Local setup finished; negotiation may proceed
    Ready,
    /// At least one offer/answer exchange is in flight
    Negotiating,
    /// Disposed; terminal
    Closed,
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeerState::Initializing => "initializing",
            PeerState::Ready => "ready",
            PeerState::Negotiating => "negotiating",
            PeerState::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
enum Readiness {
    Pending,
    Ready,
    Failed(Arc<Error>),
}

#[derive(Debug)]
struct Flags {
    closed: bool,
    initialized: bool,
    negotiations: usize,
}

pub(crate) struct Lifecycle {
    flags: Mutex<Flags>,
    readiness: watch::Sender<Readiness>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        let (readiness, _) = watch::channel(Readiness::Pending);
        Self {
            flags: Mutex::new(Flags {
                closed: false,
                initialized: false,
                negotiations: 0,
            }),
            readiness,
        }
    }

    pub(crate) fn state(&self) -> PeerState {
        let flags = self.flags.lock();
        if flags.closed {
            PeerState::Closed
        } else if flags.negotiations > 0 {
            PeerState::Negotiating
        } else if flags.initialized {
            PeerState::Ready
        } else {
            PeerState::Initializing
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.flags.lock().closed
    }

    pub(crate) fn begin_initialization(&self) {
        self.flags.lock().initialized = false;
    }

    /// Record the outcome of an initialization run
    ///
    /// Readiness resolves at most once; later outcomes (recoveries) only
    /// move the state machine.
    pub(crate) fn finish_initialization(&self, outcome: Result<()>) {
        self.flags.lock().initialized = true;
        self.readiness.send_if_modified(|current| {
            if !matches!(current, Readiness::Pending) {
                return false;
            }
            *current = match outcome {
                Ok(()) => Readiness::Ready,
                Err(e) => Readiness::Failed(Arc::new(e)),
            };
            true
        });
    }

    /// Mark a negotiation in flight until the guard drops
    pub(crate) fn begin_negotiation(&self) -> Result<NegotiationGuard<'_>> {
        let mut flags = self.flags.lock();
        if flags.closed {
            return Err(Error::Disposed);
        }
        flags.negotiations += 1;
        Ok(NegotiationGuard { lifecycle: self })
    }

    /// Enter the terminal state; false if already closed
    pub(crate) fn close(&self) -> bool {
        {
            let mut flags = self.flags.lock();
            if flags.closed {
                return false;
            }
            flags.closed = true;
        }
        self.readiness.send_if_modified(|current| {
            if matches!(current, Readiness::Pending) {
                *current = Readiness::Failed(Arc::new(Error::Disposed));
                true
            } else {
                false
            }
        });
        true
    }

    pub(crate) async fn ready(&self) -> Result<()> {
        let mut rx = self.readiness.subscribe();
        let readiness = rx
            .wait_for(|r| !matches!(r, Readiness::Pending))
            .await
            .map_err(|_| Error::Disposed)?;
        match &*readiness {
            Readiness::Failed(e) => Err(e.replicate()),
            _ => Ok(()),
        }
    }
}

pub(crate) struct NegotiationGuard<'a> {
    lifecycle: &'a Lifecycle,
}

impl Drop for NegotiationGuard<'_> {
    fn drop(&mut self) {
        let mut flags = self.lifecycle.flags.lock();
        flags.negotiations = flags.negotiations.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_state_transitions() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), PeerState::Initializing);

        lifecycle.finish_initialization(Ok(()));
        assert_eq!(lifecycle.state(), PeerState::Ready);

        {
            let _a = lifecycle.begin_negotiation().unwrap();
            let _b = lifecycle.begin_negotiation().unwrap();
            assert_eq!(lifecycle.state(), PeerState::Negotiating);
        }
        assert_eq!(lifecycle.state(), PeerState::Ready);

        lifecycle.begin_initialization();
        assert_eq!(lifecycle.state(), PeerState::Initializing);

        assert!(lifecycle.close());
        assert!(!lifecycle.close());
        assert_eq!(lifecycle.state(), PeerState::Closed);
        assert!(matches!(lifecycle.begin_negotiation(), Err(Error::Disposed)));
    }

    #[tokio::test]
    async fn test_ready_resolves_once() {
        let lifecycle = Arc::new(Lifecycle::new());

        let waiter = {
            let lifecycle = Arc::clone(&lifecycle);
            tokio::spawn(async move { lifecycle.ready().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        lifecycle.finish_initialization(Ok(()));
        assert!(waiter.await.unwrap().is_ok());

        lifecycle.finish_initialization(Err(Error::MediaAcquisition("late".into())));
        assert!(lifecycle.ready().await.is_ok());
    }

    #[tokio::test]
    async fn test_ready_reports_failure() {
        let lifecycle = Lifecycle::new();
        lifecycle.finish_initialization(Err(Error::MediaAcquisition("denied".into())));
        let err = lifecycle.ready().await.unwrap_err();
        assert!(matches!(err, Error::MediaAcquisition(m) if m == "denied"));
        // Every waiter sees the same outcome
        assert!(lifecycle.ready().await.unwrap_err().is_media_error());
    }

    #[tokio::test]
    async fn test_close_fails_pending_readiness() {
        let lifecycle = Lifecycle::new();
        lifecycle.close();
        assert!(matches!(lifecycle.ready().await, Err(Error::Disposed)));
    }
}
