//! Configuration types for peers

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default STUN server used when the caller supplies none
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Default data channel label
pub const DEFAULT_DATA_CHANNEL_LABEL: &str = "dataChannel";

/// Negotiation mode of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerMode {
    /// Only receives remote media; no local capture
    RecvOnly,
    /// Only sends local media
    SendOnly,
    /// Sends and receives media
    SendRecv,
}

impl PeerMode {
    /// Whether this mode attaches local media
    pub fn sends_media(&self) -> bool {
        !matches!(self, PeerMode::RecvOnly)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PeerMode::RecvOnly => "recvonly",
            PeerMode::SendOnly => "sendonly",
            PeerMode::SendRecv => "sendrecv",
        }
    }
}

impl fmt::Display for PeerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PeerMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "recvonly" => Ok(PeerMode::RecvOnly),
            "sendonly" => Ok(PeerMode::SendOnly),
            "sendrecv" => Ok(PeerMode::SendRecv),
            other => Err(Error::InvalidConfig(format!("unknown peer mode '{}'", other))),
        }
    }
}

/// Where local video is captured from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendSource {
    /// Camera (and microphone) capture
    #[default]
    Webcam,
    /// Screen capture
    Screen,
}

impl FromStr for SendSource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "webcam" => Ok(SendSource::Webcam),
            "screen" => Ok(SendSource::Screen),
            other => Err(Error::InvalidConfig(format!("unknown send source '{}'", other))),
        }
    }
}

/// ICE server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceServer {
    /// Server URLs (stun:, stuns:, turn: or turns:)
    pub urls: Vec<String>,
    /// Username for TURN authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Credential for TURN authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// Create a STUN server entry
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    /// Create a TURN server entry with credentials
    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }

    fn is_turn(&self) -> bool {
        self.urls
            .iter()
            .any(|u| u.starts_with("turn:") || u.starts_with("turns:"))
    }
}

/// ICE transport policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceTransportPolicy {
    /// Use every candidate type
    #[default]
    All,
    /// Only relay (TURN) candidates
    Relay,
}

/// Bundle policy for the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BundlePolicy {
    #[default]
    Balanced,
    MaxCompat,
    MaxBundle,
}

/// Configuration handed to the underlying peer connection
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RtcConfiguration {
    /// ICE servers; empty means "use the defaults"
    pub ice_servers: Vec<IceServer>,
    pub ice_transport_policy: IceTransportPolicy,
    pub bundle_policy: BundlePolicy,
}

impl RtcConfiguration {
    /// The configuration used when the caller supplies nothing
    pub fn defaults() -> Self {
        Self {
            ice_servers: vec![IceServer::stun(DEFAULT_STUN_SERVER)],
            ..Default::default()
        }
    }

    /// Merge this (caller) configuration over the defaults
    ///
    /// Caller ICE servers replace the default list; an empty list keeps it.
    pub fn merged_with_defaults(&self) -> Self {
        let defaults = Self::defaults();
        Self {
            ice_servers: if self.ice_servers.is_empty() {
                defaults.ice_servers
            } else {
                self.ice_servers.clone()
            },
            ice_transport_policy: self.ice_transport_policy,
            bundle_policy: self.bundle_policy,
        }
    }

    fn validate(&self) -> Result<()> {
        for server in &self.ice_servers {
            if server.urls.is_empty() {
                return Err(Error::InvalidConfig(
                    "ICE server entry without URLs".to_string(),
                ));
            }
            for url in &server.urls {
                let known = ["stun:", "stuns:", "turn:", "turns:"]
                    .iter()
                    .any(|scheme| url.starts_with(scheme));
                if !known {
                    return Err(Error::InvalidConfig(format!(
                        "ICE server URL must use stun:, stuns:, turn: or turns:, got {}",
                        url
                    )));
                }
            }
            if server.is_turn() && (server.username.is_none() || server.credential.is_none()) {
                return Err(Error::InvalidConfig(format!(
                    "TURN server {:?} requires username and credential",
                    server.urls
                )));
            }
        }

        if self.ice_transport_policy == IceTransportPolicy::Relay
            && !self.ice_servers.is_empty()
            && !self.ice_servers.iter().any(IceServer::is_turn)
        {
            return Err(Error::InvalidConfig(
                "relay transport policy requires at least one TURN server".to_string(),
            ));
        }

        Ok(())
    }
}

/// Extra constraints for one media kind
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TrackConstraints {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<f64>,
    pub device_id: Option<String>,
}

/// Request for one media kind: a plain toggle or detailed constraints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MediaRequest {
    Enabled(bool),
    Constraints(TrackConstraints),
}

impl MediaRequest {
    /// Anything but an explicit `false` requests the media kind
    pub fn is_requested(&self) -> bool {
        !matches!(self, MediaRequest::Enabled(false))
    }

    pub fn constraints(&self) -> Option<&TrackConstraints> {
        match self {
            MediaRequest::Constraints(c) => Some(c),
            MediaRequest::Enabled(_) => None,
        }
    }
}

impl Default for MediaRequest {
    fn default() -> Self {
        MediaRequest::Enabled(true)
    }
}

/// Media constraints for capture and receive-only transceivers
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConstraints {
    pub audio: MediaRequest,
    pub video: MediaRequest,
}

impl MediaConstraints {
    pub fn wants_audio(&self) -> bool {
        self.audio.is_requested()
    }

    pub fn wants_video(&self) -> bool {
        self.video.is_requested()
    }

    /// Constraints with only audio requested
    pub fn audio_only() -> Self {
        Self {
            audio: MediaRequest::Enabled(true),
            video: MediaRequest::Enabled(false),
        }
    }

    /// Constraints with only video requested
    pub fn video_only() -> Self {
        Self {
            audio: MediaRequest::Enabled(false),
            video: MediaRequest::Enabled(true),
        }
    }
}

/// Data channel delivery mode
///
/// Determines the reliability of message delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataChannelMode {
    /// Reliable, ordered delivery (default)
    #[default]
    Reliable,
    /// Unreliable, unordered delivery (low latency)
    Unreliable,
}

impl DataChannelMode {
    /// Get the ordered setting
    pub fn ordered(&self) -> bool {
        match self {
            DataChannelMode::Reliable => true,
            DataChannelMode::Unreliable => false,
        }
    }

    /// Get the max retransmits setting
    pub fn max_retransmits(&self) -> Option<u16> {
        match self {
            DataChannelMode::Reliable => None,      // Unlimited retransmits
            DataChannelMode::Unreliable => Some(0), // No retransmits
        }
    }
}

/// Options of the data channel created at construction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataChannelConfig {
    /// Channel label (also used as the channel identifier)
    pub label: String,
    pub ordered: bool,
    pub max_retransmits: Option<u16>,
    pub max_packet_life_time: Option<u16>,
    pub protocol: String,
    /// Pre-negotiated channel id
    pub negotiated: Option<u16>,
    /// Threshold under which the buffered-amount-low event fires
    pub buffered_amount_low_threshold: Option<usize>,
}

impl Default for DataChannelConfig {
    fn default() -> Self {
        Self::from_mode(DataChannelMode::Reliable)
    }
}

impl DataChannelConfig {
    pub fn from_mode(mode: DataChannelMode) -> Self {
        Self {
            label: DEFAULT_DATA_CHANNEL_LABEL.to_string(),
            ordered: mode.ordered(),
            max_retransmits: mode.max_retransmits(),
            max_packet_life_time: None,
            protocol: String::new(),
            negotiated: None,
            buffered_amount_low_threshold: None,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.label.is_empty() {
            return Err(Error::InvalidConfig(
                "data channel label must not be empty".to_string(),
            ));
        }
        if self.max_retransmits.is_some() && self.max_packet_life_time.is_some() {
            return Err(Error::InvalidConfig(
                "max_retransmits and max_packet_life_time are mutually exclusive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Serializable peer configuration
///
/// Runtime collaborators (streams, callbacks, sinks) live in
/// [`crate::PeerOptions`]; this is the part that can be loaded from a file.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Peer identifier (auto-generated if None)
    pub id: Option<String>,

    /// Mangle local descriptions to advertise three simulcast layers
    pub simulcast: bool,

    /// Capture source for local video
    pub send_source: SendSource,

    pub media_constraints: MediaConstraints,

    /// ICE configuration, merged over the defaults
    pub configuration: RtcConfiguration,

    /// Create a data channel at construction
    pub data_channels: bool,

    pub data_channel: DataChannelConfig,
}

impl PeerConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `id` is present but empty
    /// - an ICE server URL has an unknown scheme or a TURN server lacks credentials
    /// - the data channel is requested with an empty label or conflicting reliability
    pub fn validate(&self) -> Result<()> {
        if matches!(self.id.as_deref(), Some("")) {
            return Err(Error::InvalidConfig("peer id must not be empty".to_string()));
        }

        self.configuration.validate()?;

        if self.data_channels {
            self.data_channel.validate()?;
        }

        Ok(())
    }

    /// Parse and validate a JSON configuration
    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a YAML configuration
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}
