//! # Transport Module
//!
//! The bidirectional message channel between a session and the speech service.
//! The session only sees a [`Channel`]: a bounded queue of outbound messages and a
//! queue of inbound [`ChannelEvent`]s. Sending is always `try_send`; a full queue is
//! surfaced to the caller instead of waiting.

pub mod protocol;  // JSON message types and content-type checks
pub mod websocket; // tokio-tungstenite connection task

pub use protocol::{ChannelEvent, ClientMessage, ServerMessage};
pub use websocket::WebSocketConnector;

use crate::config::ServiceConfig;
use crate::error::AppResult;
use tokio::sync::mpsc;

/// Both directions of an open (or opening) connection.
#[derive(Debug)]
pub struct Channel {
    pub outbound: mpsc::Sender<ClientMessage>,
    pub inbound: mpsc::Receiver<ChannelEvent>,
}

/// Opens channels to the speech service.
///
/// `connect` must return immediately; the handshake completes in the background and is
/// reported as [`ChannelEvent::Opened`].
pub trait Connector: Send + Sync {
    fn connect(&self, service: &ServiceConfig) -> AppResult<Channel>;
}

/// In-memory channel whose far end is driven by the test.
#[cfg(test)]
pub mod memory {
    use super::*;
    use crate::error::AppError;
    use std::sync::Mutex;

    /// The service side of an in-memory channel.
    pub struct Peer {
        pub events: mpsc::Sender<ChannelEvent>,
        pub received: mpsc::Receiver<ClientMessage>,
    }

    impl Peer {
        /// Everything the session has sent so far.
        pub fn drain_received(&mut self) -> Vec<ClientMessage> {
            let mut messages = Vec::new();
            while let Ok(message) = self.received.try_recv() {
                messages.push(message);
            }
            messages
        }
    }

    pub fn pair(outbound_queue: usize, inbound_queue: usize) -> (Channel, Peer) {
        let (outbound, received) = mpsc::channel(outbound_queue);
        let (events, inbound) = mpsc::channel(inbound_queue);
        (Channel { outbound, inbound }, Peer { events, received })
    }

    /// Hands out one prepared channel, then fails like an unreachable service.
    #[derive(Default)]
    pub struct MemoryConnector {
        channel: Mutex<Option<Channel>>,
    }

    impl MemoryConnector {
        pub fn with_peer(outbound_queue: usize) -> (Self, Peer) {
            let (channel, peer) = pair(outbound_queue, 64);
            let connector = Self {
                channel: Mutex::new(Some(channel)),
            };
            (connector, peer)
        }
    }

    impl Connector for MemoryConnector {
        fn connect(&self, _service: &ServiceConfig) -> AppResult<Channel> {
            self.channel
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| AppError::Initialization("service unreachable".to_string()))
        }
    }
}
