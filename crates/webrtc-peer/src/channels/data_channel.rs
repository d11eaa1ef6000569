//! Data channel wrapper
//!
//! Wraps a [`DataChannelTransport`] created by the peer connection,
//! dispatches its lifecycle events to application handlers and keeps
//! traffic statistics.

use super::messages::{DataChannelMessage, MAX_MESSAGE_SIZE};
use crate::connection::{DataChannelEvent, DataChannelTransport};
use crate::{Error, Result};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Data channel state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataChannelState {
    /// Channel is being created
    Connecting,
    /// Channel is open and ready for messages
    Open,
    /// Channel is closing
    Closing,
    /// Channel is closed
    Closed,
}

type Callback = Arc<dyn Fn() + Send + Sync>;
type MessageCallback = Arc<dyn Fn(DataChannelMessage) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Application handlers for data channel events
///
/// Unset handlers are skipped, except errors which are logged when no
/// handler is installed.
#[derive(Clone, Default)]
pub struct DataChannelHandlers {
    on_open: Option<Callback>,
    on_close: Option<Callback>,
    on_message: Option<MessageCallback>,
    on_buffered_amount_low: Option<Callback>,
    on_error: Option<ErrorCallback>,
}

impl DataChannelHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_open(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_open = Some(Arc::new(f));
        self
    }

    pub fn on_close(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_close = Some(Arc::new(f));
        self
    }

    pub fn on_message(mut self, f: impl Fn(DataChannelMessage) + Send + Sync + 'static) -> Self {
        self.on_message = Some(Arc::new(f));
        self
    }

    pub fn on_buffered_amount_low(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_buffered_amount_low = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(String) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for DataChannelHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataChannelHandlers")
            .field("on_open", &self.on_open.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("on_message", &self.on_message.is_some())
            .field("on_buffered_amount_low", &self.on_buffered_amount_low.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

#[derive(Default)]
struct Counters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
}

/// Channel statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataChannelStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Messages sent count
    pub messages_sent: u64,
    /// Messages received count
    pub messages_received: u64,
}

/// Data channel owned by a peer
#[derive(Clone)]
pub struct DataChannel {
    label: String,
    transport: Arc<dyn DataChannelTransport>,
    counters: Arc<Counters>,
}

impl DataChannel {
    /// Wrap `transport` and route its events to `handlers`
    pub async fn new(
        transport: Arc<dyn DataChannelTransport>,
        handlers: DataChannelHandlers,
        buffered_amount_low_threshold: Option<usize>,
    ) -> Self {
        let label = transport.label();
        let counters = Arc::new(Counters::default());

        if let Some(threshold) = buffered_amount_low_threshold {
            transport.set_buffered_amount_low_threshold(threshold).await;
        }

        let event_counters = Arc::clone(&counters);
        let event_label = label.clone();
        transport
            .set_event_handler(Arc::new(move |event| {
                dispatch(&event_label, &handlers, &event_counters, event)
            }))
            .await;

        debug!("Data channel '{}' created", label);

        Self {
            label,
            transport,
            counters,
        }
    }

    /// Get the channel label
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> DataChannelState {
        self.transport.ready_state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == DataChannelState::Open
    }

    /// Send a message
    ///
    /// Fails when the channel is not open or the message exceeds
    /// [`MAX_MESSAGE_SIZE`].
    pub async fn send(&self, msg: &DataChannelMessage) -> Result<()> {
        if msg.exceeds_max_size() {
            return Err(Error::DataChannelError(format!(
                "Message size {} exceeds maximum {} bytes",
                msg.size(),
                MAX_MESSAGE_SIZE
            )));
        }

        let state = self.state();
        if state != DataChannelState::Open {
            return Err(Error::DataChannelError(format!(
                "Data channel '{}' is not open (state: {:?})",
                self.label, state
            )));
        }

        let sent = self.transport.send(msg).await?;
        self.counters
            .bytes_sent
            .fetch_add(sent as u64, Ordering::Relaxed);
        self.counters.messages_sent.fetch_add(1, Ordering::Relaxed);

        debug!("Sent {} bytes on data channel '{}'", sent, self.label);
        Ok(())
    }

    /// Close the data channel
    pub async fn close(&self) -> Result<()> {
        if self.state() == DataChannelState::Closed {
            return Ok(());
        }
        self.transport.close().await?;
        debug!("Data channel '{}' closed", self.label);
        Ok(())
    }

    /// Get channel statistics
    pub fn stats(&self) -> DataChannelStats {
        DataChannelStats {
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
            messages_sent: self.counters.messages_sent.load(Ordering::Relaxed),
            messages_received: self.counters.messages_received.load(Ordering::Relaxed),
        }
    }

    /// The transport this channel wraps
    pub fn transport(&self) -> &Arc<dyn DataChannelTransport> {
        &self.transport
    }
}

impl fmt::Debug for DataChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataChannel")
            .field("label", &self.label)
            .field("state", &self.state())
            .field("stats", &self.stats())
            .finish()
    }
}

fn dispatch(
    label: &str,
    handlers: &DataChannelHandlers,
    counters: &Counters,
    event: DataChannelEvent,
) {
    match event {
        DataChannelEvent::Open => {
            debug!("Data channel '{}' opened", label);
            if let Some(f) = &handlers.on_open {
                f();
            }
        }
        DataChannelEvent::Close => {
            debug!("Data channel '{}' closed by transport", label);
            if let Some(f) = &handlers.on_close {
                f();
            }
        }
        DataChannelEvent::Message(msg) => {
            counters
                .bytes_received
                .fetch_add(msg.size() as u64, Ordering::Relaxed);
            counters.messages_received.fetch_add(1, Ordering::Relaxed);
            match &handlers.on_message {
                Some(f) => f(msg),
                None => warn!("Dropping message on data channel '{}': no handler", label),
            }
        }
        DataChannelEvent::BufferedAmountLow => {
            if let Some(f) = &handlers.on_buffered_amount_low {
                f();
            }
        }
        DataChannelEvent::Error(err) => match &handlers.on_error {
            Some(f) => f(err),
            None => error!("Data channel '{}' error: {}", label, err),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::DataChannelEventHandler;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct LoopbackTransport {
        state: Mutex<DataChannelState>,
        handler: Mutex<Option<DataChannelEventHandler>>,
        sent: Mutex<Vec<DataChannelMessage>>,
        threshold: Mutex<Option<usize>>,
    }

    impl LoopbackTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                state: Mutex::new(DataChannelState::Connecting),
                handler: Mutex::new(None),
                sent: Mutex::new(Vec::new()),
                threshold: Mutex::new(None),
            })
        }

        fn emit(&self, event: DataChannelEvent) {
            if let DataChannelEvent::Open = event {
                *self.state.lock() = DataChannelState::Open;
            }
            let handler = self.handler.lock().clone();
            if let Some(h) = handler {
                h(event);
            }
        }
    }

    #[async_trait]
    impl DataChannelTransport for LoopbackTransport {
        fn label(&self) -> String {
            "test".to_string()
        }

        fn ready_state(&self) -> DataChannelState {
            *self.state.lock()
        }

        async fn send(&self, msg: &DataChannelMessage) -> Result<usize> {
            self.sent.lock().push(msg.clone());
            Ok(msg.size())
        }

        async fn close(&self) -> Result<()> {
            *self.state.lock() = DataChannelState::Closed;
            Ok(())
        }

        async fn set_event_handler(&self, handler: DataChannelEventHandler) {
            *self.handler.lock() = Some(handler);
        }

        async fn set_buffered_amount_low_threshold(&self, threshold: usize) {
            *self.threshold.lock() = Some(threshold);
        }
    }

    #[tokio::test]
    async fn test_send_requires_open() {
        let transport = LoopbackTransport::new();
        let channel = DataChannel::new(transport.clone(), DataChannelHandlers::new(), Some(1024)).await;
        assert_eq!(*transport.threshold.lock(), Some(1024));

        let err = channel.send(&"early".into()).await.unwrap_err();
        assert!(matches!(err, Error::DataChannelError(_)));

        transport.emit(DataChannelEvent::Open);
        channel.send(&"hello".into()).await.unwrap();
        assert_eq!(transport.sent.lock().len(), 1);
        assert_eq!(channel.stats().bytes_sent, 5);
        assert_eq!(channel.stats().messages_sent, 1);
    }

    #[tokio::test]
    async fn test_oversized_message_rejected() {
        let transport = LoopbackTransport::new();
        let channel = DataChannel::new(transport.clone(), DataChannelHandlers::new(), None).await;
        transport.emit(DataChannelEvent::Open);

        let big = DataChannelMessage::binary(vec![0u8; MAX_MESSAGE_SIZE + 1]);
        assert!(channel.send(&big).await.is_err());
        assert!(transport.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_events_reach_handlers() {
        let log = Arc::new(Mutex::new(Vec::<String>::new()));
        let (l1, l2, l3, l4, l5) = (
            log.clone(),
            log.clone(),
            log.clone(),
            log.clone(),
            log.clone(),
        );
        let handlers = DataChannelHandlers::new()
            .on_open(move || l1.lock().push("open".into()))
            .on_close(move || l2.lock().push("close".into()))
            .on_message(move |m| l3.lock().push(format!("msg:{}", m.as_text().unwrap_or("?"))))
            .on_buffered_amount_low(move || l4.lock().push("low".into()))
            .on_error(move |e| l5.lock().push(format!("err:{}", e)));

        let transport = LoopbackTransport::new();
        let channel = DataChannel::new(transport.clone(), handlers, None).await;

        transport.emit(DataChannelEvent::Open);
        transport.emit(DataChannelEvent::Message("hi".into()));
        transport.emit(DataChannelEvent::BufferedAmountLow);
        transport.emit(DataChannelEvent::Error("sctp reset".into()));
        transport.emit(DataChannelEvent::Close);

        assert_eq!(
            *log.lock(),
            vec!["open", "msg:hi", "low", "err:sctp reset", "close"]
        );
        assert_eq!(channel.stats().messages_received, 1);
        assert_eq!(channel.stats().bytes_received, 2);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let transport = LoopbackTransport::new();
        let channel = DataChannel::new(transport.clone(), DataChannelHandlers::new(), None).await;
        channel.close().await.unwrap();
        channel.close().await.unwrap();
        assert_eq!(channel.state(), DataChannelState::Closed);
    }
}
