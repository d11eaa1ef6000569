//! Data channel support

pub mod data_channel;
pub mod messages;

pub use data_channel::{DataChannel, DataChannelHandlers, DataChannelState, DataChannelStats};
pub use messages::{DataChannelMessage, MAX_MESSAGE_SIZE};
