//! Session descriptions, ICE candidates and SDP transforms

pub mod description;
pub mod interop;
pub mod simulcast;

pub use description::{IceCandidate, SdpType, SessionDescription};
pub use interop::SdpTranslator;
pub use simulcast::SimulcastMangler;
