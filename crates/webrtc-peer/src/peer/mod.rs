//! The peer negotiation core

mod candidates;
mod negotiation;
pub mod events;
mod options;
mod state;

pub use negotiation::{Peer, TrackReplacement};
pub use events::SubscriptionId;
pub use options::PeerOptions;
pub use state::PeerState;
