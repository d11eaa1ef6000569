//! Peer integration test harness
//!
//! Provides:
//! - A scripted in-memory peer connection ([`MockConnection`]) and factory
//! - Synthetic local streams
//! - Polling helpers for events delivered from spawned tasks
//!
//! Basic usage pattern:
//!
//! 1. Create a `MockFactory` (optionally pre-configured)
//! 2. Build a `Peer` with `PeerOptions::with_connection_factory(factory.clone())`
//! 3. Drive negotiation and inspect `factory.latest()`
//! 4. Emit connection events with `MockConnection::emit`

#![allow(dead_code)]

pub mod media;
pub mod mock_connection;

use std::future::Future;
use std::time::Duration;

pub use media::{audio_stream, av_stream, video_stream};
pub use mock_connection::{MockConnection, MockDataChannel, MockFactory, MockOptions};

/// Initialize test logging (call once per test)
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,webrtc_peer=debug")
        .with_test_writer()
        .try_init();
}

/// Poll `condition` until it holds or `timeout` elapses
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Await `future` or panic after `timeout`
pub async fn within<T>(timeout: Duration, future: impl Future<Output = T>) -> T {
    tokio::time::timeout(timeout, future)
        .await
        .expect("operation timed out")
}
