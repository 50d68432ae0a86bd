//! WebSocket connection to the conversational-audio service.
//!
//! One background task owns the socket. It reports `Opened` once the handshake completes,
//! forwards parsed service messages, and writes whatever the session queues. Dropping the
//! session's sender closes the socket after the queued messages are written.

use crate::config::ServiceConfig;
use crate::error::{AppError, AppResult};
use crate::transport::protocol::{ChannelEvent, ClientMessage, ServerMessage};
use crate::transport::{Channel, Connector};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

#[derive(Debug, Default)]
pub struct WebSocketConnector;

impl Connector for WebSocketConnector {
    fn connect(&self, service: &ServiceConfig) -> AppResult<Channel> {
        if !(service.url.starts_with("ws://") || service.url.starts_with("wss://")) {
            return Err(AppError::Initialization(format!(
                "Service URL must use ws:// or wss://, got '{}'",
                service.url
            )));
        }

        let (outbound_tx, outbound_rx) = mpsc::channel(service.outbound_queue);
        let (events_tx, events_rx) = mpsc::channel(service.inbound_queue);
        tokio::spawn(run_connection(service.url.clone(), outbound_rx, events_tx));

        Ok(Channel {
            outbound: outbound_tx,
            inbound: events_rx,
        })
    }
}

async fn run_connection(
    url: String,
    mut outbound: mpsc::Receiver<ClientMessage>,
    events: mpsc::Sender<ChannelEvent>,
) {
    info!("Connecting to speech service: {}", url);
    let ws_stream = match connect_async(url.as_str()).await {
        Ok((ws_stream, _)) => ws_stream,
        Err(e) => {
            error!("Failed to connect to {}: {}", url, e);
            let _ = events
                .send(ChannelEvent::Failed(format!("Failed to connect: {}", e)))
                .await;
            return;
        }
    };

    info!("Connected to speech service");
    if events.send(ChannelEvent::Opened).await.is_err() {
        return;
    }

    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            outgoing = outbound.recv() => match outgoing {
                Some(message) => {
                    let text = match serde_json::to_string(&message) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Failed to serialize {} message: {}", message.kind(), e);
                            continue;
                        }
                    };
                    if let Err(e) = write.send(Message::Text(text)).await {
                        error!("Failed to send WebSocket message: {}", e);
                        let _ = events.send(ChannelEvent::Failed(e.to_string())).await;
                        break;
                    }
                }
                None => {
                    debug!("Session released the channel, closing socket");
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
            },

            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(message) => {
                        if events.send(ChannelEvent::Message(message)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Ignoring malformed service message: {}", e),
                },
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame.map(|f| f.reason.to_string()).filter(|r| !r.is_empty());
                    info!(?reason, "Speech service closed the connection");
                    let _ = events.send(ChannelEvent::Closed { reason }).await;
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!("WebSocket error: {}", e);
                    let _ = events.send(ChannelEvent::Failed(e.to_string())).await;
                    break;
                }
                None => {
                    let _ = events.send(ChannelEvent::Closed { reason: None }).await;
                    break;
                }
            },
        }
    }

    debug!("WebSocket task terminated");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    #[test]
    fn test_rejects_non_websocket_url() {
        let mut service = AppConfig::default().service;
        service.url = "http://localhost:9000".to_string();
        let err = WebSocketConnector.connect(&service).unwrap_err();
        assert!(matches!(err, AppError::Initialization(_)));
    }

    #[tokio::test]
    async fn test_unreachable_service_reports_failure() {
        let mut service = AppConfig::default().service;
        service.url = "ws://127.0.0.1:1/ws".to_string();
        let mut channel = WebSocketConnector.connect(&service).unwrap();

        match channel.inbound.recv().await {
            Some(ChannelEvent::Failed(message)) => assert!(message.contains("Failed to connect")),
            other => panic!("Expected failure, got {:?}", other),
        }
    }
}
