//! Declarative WebRTC peer negotiation
//!
//! This crate wraps a native peer connection and takes care of the
//! negotiation boilerplate around it.
//!
//! # Features
//!
//! - **Modes**: `recvonly`, `sendonly` and `sendrecv` offer/answer semantics
//! - **ICE candidate buffering**: candidates gathered before anyone
//!   subscribes are replayed, in order, to the first subscriber
//! - **Simulcast SDP**: legacy `a=ssrc-group:SIM` mangling of local descriptions
//! - **Track replacement**: swap streams or single tracks without renegotiation
//! - **Recovery**: a connection that reaches `closed` is recreated in place
//! - **Data channels**: optional channel created at construction
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  Application (signaling, UI)                         │
//! │  ↓ generate_offer / process_answer / on_ice_candidate│
//! │  Peer                                                │
//! │  ├─ Lifecycle (Initializing → Ready ⇄ Negotiating)   │
//! │  ├─ CandidateDispatcher (buffer, then deliver)       │
//! │  ├─ SimulcastMangler (SDP line transform)            │
//! │  ├─ TrackSource / MediaSink (capture, rendering)     │
//! │  └─ DataChannel                                      │
//! │     ↓                                                │
//! │  PeerConnectionBackend (webrtc-rs by default)        │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use webrtc_peer::{PeerConfig, PeerMode};
//!
//! let config = PeerConfig::from_yaml_str("simulcast: true\ndata_channels: true\n").unwrap();
//! assert!(config.simulcast);
//! assert_eq!(config.data_channel.label, "dataChannel");
//! assert!(!PeerMode::RecvOnly.sends_media());
//! ```
//!
//! ## Async Usage
//!
//! ```no_run
//! use webrtc_peer::{Peer, PeerMode, PeerOptions};
//!
//! # async fn example(answer_sdp: String) -> webrtc_peer::Result<()> {
//! let peer = Peer::new(PeerMode::RecvOnly, PeerOptions::new()).await?;
//! peer.on_ice_candidate(|candidate| {
//!     // forward over signaling
//!     let _ = candidate.to_json();
//! });
//! peer.ready().await?;
//!
//! let offer = peer.generate_offer().await?;
//! # let _ = offer;
//! peer.process_answer(answer_sdp).await?;
//! peer.dispose().await;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod channels;
pub mod config;
pub mod connection;
pub mod error;
pub mod media;
pub mod sdp;

mod peer;

pub use channels::{DataChannel, DataChannelHandlers, DataChannelMessage, DataChannelState};
pub use config::{
    BundlePolicy, DataChannelConfig, DataChannelMode, IceServer, IceTransportPolicy,
    MediaConstraints, MediaRequest, PeerConfig, PeerMode, RtcConfiguration, SendSource,
    TrackConstraints,
};
pub use connection::{
    ConnectionEvent, ConnectionFactory, ConnectionState, PeerConnectionBackend, RemoteTrack,
    RtpReceiver, RtpSender, RtpTransceiver, TransceiverDirection, WebRtcConnectionFactory,
};
pub use error::{Error, Result};
pub use media::{
    FrameBufferSink, MediaKind, MediaSink, MediaStream, MediaTrack, SyntheticTrackSource,
    TrackSource, TrackState, VideoFrame,
};
pub use peer::{Peer, PeerOptions, PeerState, SubscriptionId, TrackReplacement};
pub use sdp::{IceCandidate, SdpTranslator, SdpType, SessionDescription};

use tracing_subscriber::EnvFilter;

/// Install a `fmt` subscriber filtered by `RUST_LOG` (default `webrtc_peer=info`)
///
/// Safe to call more than once; only the first call installs anything.
pub fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("webrtc_peer=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
