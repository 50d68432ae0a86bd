//! # Session Task
//!
//! Runs a [`StreamSession`] on its own tokio task and exposes it through a cloneable
//! [`SessionHandle`].
//!
//! ## Loop priorities (biased `select!`):
//! 1. **Commands** from the handle. Barge-in must land before any audio already queued
//!    behind it, so commands always win.
//! 2. **Device faults** from the real-time threads.
//! 3. **Channel events**: one inbound message per iteration, so a burst of audio never
//!    starves the command queue.
//! 4. **Tick**: drain the capture ring, publish counter changes, check the
//!    processing timeout.
//!
//! The task ends once the session is `Disconnected` or every handle is dropped.

use crate::audio::buffer::AppendOutcome;
use crate::audio::device::{AudioBackend, DeviceFault};
use crate::audio::stats::{StatsSnapshot, StreamStats};
use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::session::event::StreamEvent;
use crate::session::state::SessionState;
use crate::session::stream::{SessionInfo, StreamSession};
use crate::transport::protocol::ChannelEvent;
use crate::transport::Connector;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

const COMMAND_QUEUE: usize = 32;

enum Command {
    BargeIn(oneshot::Sender<AppResult<()>>),
    StartRecording(oneshot::Sender<AppResult<()>>),
    StopRecording(oneshot::Sender<AppResult<()>>),
    SetPrebuffer {
        ms: u32,
        reply: oneshot::Sender<AppResult<usize>>,
    },
    PushAudio {
        data: String,
        content_type: String,
        reply: oneshot::Sender<AppResult<AppendOutcome>>,
    },
    Info(oneshot::Sender<SessionInfo>),
    End(oneshot::Sender<()>),
}

/// Control surface of a running session.
#[derive(Clone)]
pub struct SessionHandle {
    id: String,
    created_at: DateTime<Utc>,
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<SessionState>,
    events: broadcast::Sender<StreamEvent>,
    stats: Arc<StreamStats>,
    task: Arc<JoinHandle<()>>,
}

impl SessionHandle {
    /// Create a session, begin connecting and spawn its task.
    ///
    /// Fails with the connect error when the channel or the output device cannot be
    /// acquired; nothing is left running in that case.
    pub fn start(
        config: AppConfig,
        backend: Arc<dyn AudioBackend>,
        connector: Arc<dyn Connector>,
    ) -> AppResult<Self> {
        let (mut session, faults) = StreamSession::new(config, backend, connector);
        let inbound = session.begin_connect()?;

        let (commands, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let id = session.id().to_string();
        let created_at = session.info().created_at;
        let state = session.watch_state();
        let events = session.event_sender();
        let stats = session.stats();

        info!(session_id = %id, "Session started");
        let task = tokio::spawn(run(session, command_rx, inbound, faults));

        Ok(Self {
            id,
            created_at,
            commands,
            state,
            events,
            stats,
            task: Arc::new(task),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.events.subscribe()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn barge_in(&self) -> AppResult<()> {
        self.request(Command::BargeIn).await?
    }

    pub async fn start_recording(&self) -> AppResult<()> {
        self.request(Command::StartRecording).await?
    }

    pub async fn stop_recording(&self) -> AppResult<()> {
        self.request(Command::StopRecording).await?
    }

    pub async fn set_prebuffer_ms(&self, ms: u32) -> AppResult<usize> {
        self.request(|reply| Command::SetPrebuffer { ms, reply }).await?
    }

    /// Queue wire audio for playback as if it had arrived on the channel.
    pub async fn push_audio(&self, data: String, content_type: String) -> AppResult<AppendOutcome> {
        self.request(|reply| Command::PushAudio {
            data,
            content_type,
            reply,
        })
        .await?
    }

    /// Current snapshot; a finished session reports `Disconnected`.
    pub async fn info(&self) -> SessionInfo {
        match self.request(Command::Info).await {
            Ok(info) => info,
            Err(_) => SessionInfo {
                id: self.id.clone(),
                state: SessionState::Disconnected,
                created_at: self.created_at,
                recording: false,
                buffer: None,
                output: None,
                stats: self.stats.snapshot(),
                last_error: None,
            },
        }
    }

    /// End the session and wait until its resources are released.
    pub async fn end(&self) {
        if self.request(Command::End).await.is_err() {
            debug!(session_id = %self.id, "Session already finished");
        }
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> AppResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| AppError::InvalidState("Session has ended".to_string()))?;
        response
            .await
            .map_err(|_| AppError::InvalidState("Session has ended".to_string()))
    }
}

async fn run(
    mut session: StreamSession,
    mut commands: mpsc::Receiver<Command>,
    mut inbound: mpsc::Receiver<ChannelEvent>,
    mut faults: mpsc::UnboundedReceiver<DeviceFault>,
) {
    let mut tick = tokio::time::interval(session.poll_interval());
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            command = commands.recv() => match command {
                Some(command) => apply(&mut session, command),
                None => session.request_end_session(),
            },

            Some(fault) = faults.recv() => session.handle_device_fault(fault),

            event = inbound.recv() => match event {
                Some(event) => session.handle_channel_event(event),
                None => session.handle_channel_event(ChannelEvent::Closed { reason: None }),
            },

            _ = tick.tick() => {
                session.poll_capture();
                session.poll_observability();
                session.check_processing_timeout(Instant::now());
            }
        }

        if session.state() == SessionState::Disconnected {
            break;
        }
    }

    // Answer whatever was queued behind the final command
    commands.close();
    while let Ok(command) = commands.try_recv() {
        apply(&mut session, command);
    }
    info!(session_id = %session.id(), "Session task finished");
}

fn apply(session: &mut StreamSession, command: Command) {
    match command {
        Command::BargeIn(reply) => {
            let _ = reply.send(session.request_barge_in());
        }
        Command::StartRecording(reply) => {
            let _ = reply.send(session.request_start_recording());
        }
        Command::StopRecording(reply) => {
            let _ = reply.send(session.request_stop_recording());
        }
        Command::SetPrebuffer { ms, reply } => {
            let _ = reply.send(session.set_prebuffer_ms(ms));
        }
        Command::PushAudio {
            data,
            content_type,
            reply,
        } => {
            let _ = reply.send(session.push_inbound_audio(&data, &content_type));
        }
        Command::Info(reply) => {
            let _ = reply.send(session.info());
        }
        Command::End(reply) => {
            session.request_end_session();
            let _ = reply.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::SampleCodec;
    use crate::audio::device::virtual_device::VirtualBackend;
    use crate::transport::memory::MemoryConnector;
    use crate::transport::protocol::{ClientMessage, ServerMessage};
    use std::time::Duration;
    use tokio::time::timeout;

    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.playback.quantum = 4;
        config.playback.prebuffer_ms = 1;
        config.capture.quantum = 8;
        config.session.poll_interval_ms = 5;
        config
    }

    async fn wait_for(state: &mut watch::Receiver<SessionState>, wanted: SessionState) {
        timeout(Duration::from_secs(2), state.wait_for(|s| *s == wanted))
            .await
            .expect("timed out waiting for state")
            .expect("session dropped");
    }

    #[tokio::test]
    async fn test_session_lifecycle_over_handle() {
        let backend = VirtualBackend::new(24_000, 16_000);
        let (connector, mut peer) = MemoryConnector::with_peer(16);
        let handle = SessionHandle::start(test_config(), Arc::new(backend.clone()), Arc::new(connector)).unwrap();
        let mut state = handle.watch_state();
        assert_eq!(handle.state(), SessionState::Connecting);

        peer.events.send(ChannelEvent::Opened).await.unwrap();
        wait_for(&mut state, SessionState::Connected).await;

        handle.start_recording().await.unwrap();
        assert!(backend.input_open());
        backend.capture(&[0.5; 8]);

        // The tick flushes the capture ring
        let sent = timeout(Duration::from_secs(2), peer.received.recv()).await.unwrap().unwrap();
        assert!(matches!(sent, ClientMessage::Audio { .. }));

        handle.stop_recording().await.unwrap();
        assert_eq!(handle.state(), SessionState::Processing);
        assert_eq!(peer.received.recv().await, Some(ClientMessage::AudioEnd));

        handle.end().await;
        assert_eq!(handle.state(), SessionState::Disconnected);
        assert!(!backend.output_open());
        assert_eq!(peer.received.recv().await, Some(ClientMessage::SessionEnd));
    }

    #[tokio::test]
    async fn test_barge_in_clears_playback_over_handle() {
        let backend = VirtualBackend::new(24_000, 16_000);
        let (connector, mut peer) = MemoryConnector::with_peer(16);
        let handle = SessionHandle::start(test_config(), Arc::new(backend.clone()), Arc::new(connector)).unwrap();
        let mut state = handle.watch_state();
        peer.events.send(ChannelEvent::Opened).await.unwrap();
        wait_for(&mut state, SessionState::Connected).await;

        handle
            .push_audio(SampleCodec::default().encode(&[0.5; 64]), "audio/pcm".to_string())
            .await
            .unwrap();
        handle.barge_in().await.unwrap();

        assert_eq!(backend.render(4), Some(vec![0.0; 4]));
        assert_eq!(peer.received.recv().await, Some(ClientMessage::Interrupt));
        assert_eq!(handle.stats().barge_ins, 1);
    }

    #[tokio::test]
    async fn test_barge_in_overtakes_queued_service_audio() {
        let backend = VirtualBackend::new(24_000, 16_000);
        let (connector, mut peer) = MemoryConnector::with_peer(16);
        let handle = SessionHandle::start(test_config(), Arc::new(backend.clone()), Arc::new(connector)).unwrap();
        let mut state = handle.watch_state();
        peer.events.send(ChannelEvent::Opened).await.unwrap();
        wait_for(&mut state, SessionState::Connected).await;

        let codec = SampleCodec::default();
        for _ in 0..5 {
            peer.events
                .send(ChannelEvent::Message(ServerMessage::Audio {
                    data: codec.encode(&[0.5; 64]),
                    content_type: "audio/pcm".to_string(),
                    is_final: false,
                }))
                .await
                .unwrap();
        }
        handle.barge_in().await.unwrap();

        // The interrupt goes out before anything caused by the queued audio
        assert_eq!(peer.received.recv().await, Some(ClientMessage::Interrupt));

        // The reset ran first, so every queued frame is still buffered afterwards
        let buffered = timeout(Duration::from_secs(2), async {
            loop {
                let available = handle.info().await.buffer.map(|b| b.available);
                if available == Some(320) {
                    break available;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("queued audio was not kept after the barge-in");
        assert_eq!(buffered, Some(320));
        assert_eq!(handle.stats().barge_ins, 1);
        assert_eq!(handle.stats().inbound_frames, 5);
    }

    #[tokio::test]
    async fn test_service_close_ends_task() {
        let backend = VirtualBackend::new(24_000, 16_000);
        let (connector, peer) = MemoryConnector::with_peer(16);
        let handle = SessionHandle::start(test_config(), Arc::new(backend.clone()), Arc::new(connector)).unwrap();
        let mut state = handle.watch_state();

        peer.events.send(ChannelEvent::Opened).await.unwrap();
        peer.events
            .send(ChannelEvent::Message(ServerMessage::Text {
                text: "hi".to_string(),
                is_final: false,
            }))
            .await
            .unwrap();
        drop(peer);

        wait_for(&mut state, SessionState::Disconnected).await;
        assert!(!backend.output_open());

        let info = handle.info().await;
        assert_eq!(info.state, SessionState::Disconnected);
        assert!(matches!(
            handle.barge_in().await,
            Err(AppError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_start_fails_when_service_unreachable() {
        let backend = VirtualBackend::new(24_000, 16_000);
        let result = SessionHandle::start(
            test_config(),
            Arc::new(backend.clone()),
            Arc::new(MemoryConnector::default()),
        );
        assert!(matches!(result, Err(AppError::Initialization(_))));
        assert!(!backend.output_open());
    }
}
