//! Data channel payloads

use bytes::Bytes;

/// Maximum message size for data channels (16 MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// A message sent or received over a data channel
///
/// Text messages travel as UTF-8 string frames, binary messages as
/// binary frames, matching the two SCTP payload protocol identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataChannelMessage {
    Text(String),
    Binary(Bytes),
}

impl DataChannelMessage {
    pub fn text(text: impl Into<String>) -> Self {
        DataChannelMessage::Text(text.into())
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        DataChannelMessage::Binary(data.into())
    }

    /// Get the size of this message in bytes
    pub fn size(&self) -> usize {
        match self {
            DataChannelMessage::Text(t) => t.len(),
            DataChannelMessage::Binary(b) => b.len(),
        }
    }

    /// Check if this message exceeds the maximum size
    pub fn exceeds_max_size(&self) -> bool {
        self.size() > MAX_MESSAGE_SIZE
    }

    pub fn is_text(&self) -> bool {
        matches!(self, DataChannelMessage::Text(_))
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            DataChannelMessage::Text(t) => Some(t),
            DataChannelMessage::Binary(_) => None,
        }
    }

    /// Payload bytes regardless of frame type
    pub fn to_bytes(&self) -> Bytes {
        match self {
            DataChannelMessage::Text(t) => Bytes::copy_from_slice(t.as_bytes()),
            DataChannelMessage::Binary(b) => b.clone(),
        }
    }
}

impl From<&str> for DataChannelMessage {
    fn from(s: &str) -> Self {
        DataChannelMessage::Text(s.to_string())
    }
}

impl From<String> for DataChannelMessage {
    fn from(s: String) -> Self {
        DataChannelMessage::Text(s)
    }
}

impl From<Vec<u8>> for DataChannelMessage {
    fn from(v: Vec<u8>) -> Self {
        DataChannelMessage::Binary(Bytes::from(v))
    }
}

impl From<Bytes> for DataChannelMessage {
    fn from(b: Bytes) -> Self {
        DataChannelMessage::Binary(b)
    }
}
