//! # Stream Session
//!
//! Owns one conversation with the speech service: the channel, the render path, the
//! capture path while recording, and the state machine that ties them together.
//!
//! ## Ownership:
//! Every resource lives in an `Option` on the session and is released by `teardown`,
//! which runs on explicit close, channel close, fatal errors and drop. Nothing is global,
//! so several sessions can coexist (tests rely on this).
//!
//! ## Error handling:
//! - Decode problems and underflow are absorbed here: counted, logged, published.
//! - Rejected inbound audio is reported without touching the buffer.
//! - Device and channel failures are fatal: `Error`, then teardown to `Disconnected`.
//! - Commands in the wrong state return [`AppError::InvalidState`] and change nothing.
//!
//! All methods are synchronous and never wait on the network; the async loop in
//! [`crate::session::handle`] drives them.

use crate::audio::analyser::OutputAnalysis;
use crate::audio::buffer::{AppendOutcome, JitterBufferConfig};
use crate::audio::capture::CapturePath;
use crate::audio::codec::SampleCodec;
use crate::audio::device::{AudioBackend, DeviceFault};
use crate::audio::frame::AudioFrame;
use crate::audio::playback::{BufferStatus, RenderPath};
use crate::audio::stats::{StatsSnapshot, StreamStats};
use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::session::event::StreamEvent;
use crate::session::state::SessionState;
use crate::transport::protocol::{ensure_linear_pcm, ChannelEvent, ClientMessage, ServerMessage};
use crate::transport::Connector;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;

/// Snapshot of a session for the control API.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub recording: bool,
    pub buffer: Option<BufferStatus>,
    pub output: Option<OutputAnalysis>,
    pub stats: StatsSnapshot,
    pub last_error: Option<String>,
}

pub struct StreamSession {
    id: String,
    created_at: DateTime<Utc>,
    config: AppConfig,
    codec: SampleCodec,
    backend: Arc<dyn AudioBackend>,
    connector: Arc<dyn Connector>,

    state: SessionState,
    state_tx: watch::Sender<SessionState>,
    events: broadcast::Sender<StreamEvent>,
    stats: Arc<StreamStats>,
    fault_tx: mpsc::UnboundedSender<DeviceFault>,

    outbound: Option<mpsc::Sender<ClientMessage>>,
    render: Option<RenderPath>,
    capture: Option<CapturePath>,

    processing_since: Option<Instant>,
    reported_underflow: u64,
    last_error: Option<String>,
}

impl StreamSession {
    /// Create a disconnected session. Device faults from its streams arrive on the
    /// returned receiver and should be fed back through [`Self::handle_device_fault`].
    pub fn new(
        config: AppConfig,
        backend: Arc<dyn AudioBackend>,
        connector: Arc<dyn Connector>,
    ) -> (Self, mpsc::UnboundedReceiver<DeviceFault>) {
        let (fault_tx, fault_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let session = Self {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            codec: SampleCodec::new(config.playback.scale_mode),
            config,
            backend,
            connector,
            state: SessionState::Disconnected,
            state_tx,
            events,
            stats: Arc::new(StreamStats::new()),
            fault_tx,
            outbound: None,
            render: None,
            capture: None,
            processing_since: None,
            reported_underflow: 0,
            last_error: None,
        };
        (session, fault_rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn stats(&self) -> Arc<StreamStats> {
        self.stats.clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn event_sender(&self) -> broadcast::Sender<StreamEvent> {
        self.events.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.events.subscribe()
    }

    pub fn poll_interval(&self) -> Duration {
        self.config.session.poll_interval()
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            state: self.state,
            created_at: self.created_at,
            recording: self.capture.is_some(),
            buffer: self.render.as_ref().map(|render| render.scheduler().status()),
            output: self.render.as_ref().map(|render| render.analyser().analysis()),
            stats: self.stats.snapshot(),
            last_error: self.last_error.clone(),
        }
    }

    /// Open the channel and start the render path (pre-rolling).
    ///
    /// Returns the inbound event queue. `Connected` follows once the channel reports
    /// [`ChannelEvent::Opened`].
    pub fn begin_connect(&mut self) -> AppResult<mpsc::Receiver<ChannelEvent>> {
        self.require(&[SessionState::Disconnected], "connect")?;
        self.transition(SessionState::Connecting);

        let channel = match self.connector.connect(&self.config.service) {
            Ok(channel) => channel,
            Err(e) => {
                self.fail(e.clone());
                return Err(e);
            }
        };

        let render = RenderPath::start(
            self.backend.as_ref(),
            self.config.playback.spec(),
            JitterBufferConfig::from(&self.config.playback),
            self.config.playback.analyser_fft_size,
            self.stats.clone(),
            self.fault_tx.clone(),
        );
        let render = match render {
            Ok(render) => render,
            Err(e) => {
                drop(channel);
                self.fail(e.clone());
                return Err(e);
            }
        };

        self.outbound = Some(channel.outbound);
        self.render = Some(render);
        Ok(channel.inbound)
    }

    pub fn handle_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Opened => {
                if self.state == SessionState::Connecting {
                    self.transition(SessionState::Connected);
                } else {
                    debug!(state = %self.state, "Ignoring channel open outside Connecting");
                }
            }
            ChannelEvent::Message(message) => self.handle_server_message(message),
            ChannelEvent::Closed { reason } => {
                if self.state != SessionState::Disconnected {
                    info!(session_id = %self.id, ?reason, "Channel closed by service");
                    self.outbound = None;
                    self.teardown();
                }
            }
            ChannelEvent::Failed(message) => {
                if self.state != SessionState::Disconnected {
                    self.outbound = None;
                    self.fail(AppError::Channel(message));
                }
            }
        }
    }

    fn handle_server_message(&mut self, message: ServerMessage) {
        let completes = message.completes_response();
        match message {
            ServerMessage::Audio {
                data, content_type, ..
            } => {
                // A final frame may carry no audio at all
                if !data.is_empty() {
                    match self.push_inbound_audio(&data, &content_type) {
                        Ok(_) => {}
                        Err(e) if e.is_fatal() => self.fail(e),
                        Err(e) => {
                            warn!("Rejected inbound audio: {}", e);
                            self.publish_error(&e, false);
                        }
                    }
                }
            }
            ServerMessage::Text { text, is_final } => {
                debug!(is_final, "Service text: {}", text);
                self.publish(StreamEvent::Transcript { text, is_final });
            }
            ServerMessage::Status { status, message } => {
                info!(%status, ?message, "Service status");
                self.publish(StreamEvent::ServiceStatus { status, message });
            }
            ServerMessage::Tool { name, arguments } => {
                info!(tool = %name, "Service invoked tool");
                self.publish(StreamEvent::ToolCall { name, arguments });
            }
            ServerMessage::Error { code, message } => {
                warn!(%code, "Service reported error: {}", message);
                self.publish(StreamEvent::Error {
                    kind: code,
                    message,
                    fatal: false,
                });
            }
            ServerMessage::Ping { timestamp } => {
                let _ = self.send_control(ClientMessage::Pong { timestamp });
            }
        }

        if completes {
            self.complete_response();
        }
    }

    /// Decode one inbound wire frame and queue it for playback.
    pub fn push_inbound_audio(&mut self, wire_text: &str, content_type: &str) -> AppResult<AppendOutcome> {
        if !self.state.accepts_inbound_audio() {
            return Err(AppError::InvalidState(format!(
                "Cannot play audio while {}",
                self.state
            )));
        }
        let rate = self.config.playback.sample_rate;
        if let Err(e) = ensure_linear_pcm(content_type, rate) {
            StreamStats::bump(&self.stats.rejected_frames);
            return Err(e);
        }
        let Some(render) = self.render.as_ref() else {
            return Err(AppError::InvalidState("Render path is not running".to_string()));
        };

        let (frame, warning) = AudioFrame::from_wire(&self.codec, wire_text, rate);
        let outcome = render.scheduler().write_audio(frame.samples());
        StreamStats::bump(&self.stats.inbound_frames);
        StreamStats::add(&self.stats.inbound_samples, frame.len() as u64);

        if let Some(warning) = warning {
            StreamStats::bump(&self.stats.decode_warnings);
            warn!(samples = frame.len(), "Inbound audio decoded with loss: {}", warning);
            self.publish_error(&AppError::Decode(warning.to_string()), false);
        }
        if let AppendOutcome::Grown { capacity } = outcome {
            self.publish(StreamEvent::BufferGrown { capacity });
        }
        Ok(outcome)
    }

    /// Silence playback immediately and tell the service to stop its response.
    pub fn request_barge_in(&mut self) -> AppResult<()> {
        if !self.state.accepts_barge_in() {
            return Err(AppError::InvalidState(format!(
                "Cannot barge in while {}",
                self.state
            )));
        }
        if let Some(render) = self.render.as_ref() {
            render.scheduler().barge_in();
        }
        info!(session_id = %self.id, "Barge-in: playback cleared");
        self.send_control(ClientMessage::Interrupt)
    }

    pub fn request_start_recording(&mut self) -> AppResult<()> {
        self.require(&[SessionState::Connected], "start recording")?;

        match CapturePath::start(
            self.backend.as_ref(),
            &self.config.capture,
            self.codec,
            self.stats.clone(),
            self.fault_tx.clone(),
        ) {
            Ok(capture) => {
                self.capture = Some(capture);
                self.transition(SessionState::Recording);
                Ok(())
            }
            Err(e) => {
                self.fail(e.clone());
                Err(e)
            }
        }
    }

    /// Release the microphone, flush what it captured and mark the end of the utterance.
    pub fn request_stop_recording(&mut self) -> AppResult<()> {
        self.require(&[SessionState::Recording], "stop recording")?;

        if let Some(capture) = self.capture.take() {
            let mut drain = capture.stop();
            let frames: Vec<String> = std::iter::from_fn(|| drain.pop_wire()).collect();
            self.send_frames(frames)?;
        }
        self.send_control(ClientMessage::AudioEnd)?;

        self.processing_since = Some(Instant::now());
        self.transition(SessionState::Processing);
        Ok(())
    }

    /// Change the pre-roll threshold of the running render path.
    pub fn set_prebuffer_ms(&mut self, ms: u32) -> AppResult<usize> {
        let Some(render) = self.render.as_ref() else {
            return Err(AppError::InvalidState(format!(
                "No playback to configure while {}",
                self.state
            )));
        };
        let samples = self.config.playback.samples_for_ms(ms);
        render.scheduler().set_prebuffer_threshold(samples);
        info!(ms, samples, "Prebuffer threshold changed");
        Ok(samples)
    }

    /// Close the session from any state. Calling it again is a no-op.
    pub fn request_end_session(&mut self) {
        if self.state == SessionState::Disconnected {
            return;
        }
        info!(session_id = %self.id, "Ending session");
        self.teardown();
    }

    pub fn handle_device_fault(&mut self, fault: DeviceFault) {
        if self.state == SessionState::Disconnected {
            debug!(?fault, "Ignoring fault from a stopped stream");
            return;
        }
        self.fail(fault.into());
    }

    /// Encode and send everything the capture ring holds.
    pub fn poll_capture(&mut self) {
        let frames: Vec<String> = match self.capture.as_mut() {
            Some(capture) => {
                let drain = capture.drain();
                std::iter::from_fn(|| drain.pop_wire()).collect()
            }
            None => return,
        };
        if !frames.is_empty() {
            if let Err(e) = self.send_frames(frames) {
                debug!("Capture flush stopped: {}", e);
            }
        }
    }

    /// Turn counter changes from the real-time callbacks into events, and analyse the
    /// output rendered since the last tick. Silent output updates the snapshot only.
    pub fn poll_observability(&mut self) {
        let total = self.stats.underflow_samples.load(Ordering::Relaxed);
        let samples = total.saturating_sub(self.reported_underflow);
        if samples > 0 {
            self.reported_underflow = total;
            debug!(samples, total, "Playback underflow");
            self.publish(StreamEvent::Underflow { samples, total });
        }

        let level = self
            .render
            .as_mut()
            .and_then(|render| render.analyser_mut().update());
        if let Some(level) = level.filter(|level| level.peak > 0.0) {
            self.publish(StreamEvent::OutputLevel {
                peak: level.peak,
                rms: level.rms,
            });
        }
    }

    /// Give up waiting for a response. Returns whether the timeout fired.
    pub fn check_processing_timeout(&mut self, now: Instant) -> bool {
        if self.state != SessionState::Processing {
            return false;
        }
        let Some(since) = self.processing_since else {
            return false;
        };
        let timeout = self.config.session.processing_timeout();
        if now.saturating_duration_since(since) < timeout {
            return false;
        }

        warn!(session_id = %self.id, ?timeout, "No response from service, returning to Connected");
        self.publish(StreamEvent::Error {
            kind: "processing_timeout".to_string(),
            message: format!("No response within {:?}", timeout),
            fatal: false,
        });
        self.complete_response();
        true
    }

    fn complete_response(&mut self) {
        if self.state == SessionState::Processing {
            self.processing_since = None;
            self.transition(SessionState::Connected);
        }
    }

    fn require(&self, allowed: &[SessionState], action: &str) -> AppResult<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(AppError::InvalidState(format!(
                "Cannot {} while {}",
                action, self.state
            )))
        }
    }

    fn try_send(&self, message: ClientMessage) -> Result<(), TrySendError<ClientMessage>> {
        match self.outbound.as_ref() {
            Some(outbound) => outbound.try_send(message),
            None => Err(TrySendError::Closed(message)),
        }
    }

    /// Fire-and-forget control marker. A full queue drops it and reports a non-fatal
    /// error; a closed channel fails the session.
    fn send_control(&mut self, message: ClientMessage) -> AppResult<()> {
        match self.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(message)) => {
                let err = AppError::Channel(format!(
                    "Outbound queue full, dropped {} message",
                    message.kind()
                ));
                warn!("{}", err);
                self.publish_error(&err, false);
                Ok(())
            }
            Err(TrySendError::Closed(message)) => {
                let err = AppError::Channel(format!(
                    "Channel closed while sending {}",
                    message.kind()
                ));
                self.fail(err.clone());
                Err(err)
            }
        }
    }

    fn send_frames(&mut self, frames: Vec<String>) -> AppResult<()> {
        for data in frames {
            let event_copy = (self.events.receiver_count() > 0).then(|| data.clone());
            match self.try_send(ClientMessage::audio(data)) {
                Ok(()) => {
                    StreamStats::bump(&self.stats.frames_sent);
                    if let Some(data) = event_copy {
                        self.publish(StreamEvent::EncodedFrame { data });
                    }
                }
                Err(TrySendError::Full(_)) => StreamStats::bump(&self.stats.frames_dropped),
                Err(TrySendError::Closed(_)) => {
                    let err = AppError::Channel("Channel closed while streaming audio".to_string());
                    self.fail(err.clone());
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    fn publish(&self, event: StreamEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn publish_error(&self, err: &AppError, fatal: bool) {
        self.publish(StreamEvent::Error {
            kind: err.kind().to_string(),
            message: err.to_string(),
            fatal,
        });
    }

    fn transition(&mut self, next: SessionState) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition_to(next) {
            warn!(from = %self.state, to = %next, "Rejected state transition");
            return;
        }
        let from = std::mem::replace(&mut self.state, next);
        info!(session_id = %self.id, %from, to = %next, "Session state changed");
        self.state_tx.send_replace(next);
        self.publish(StreamEvent::StateChanged { from, to: next });
    }

    fn fail(&mut self, err: AppError) {
        error!(session_id = %self.id, kind = err.kind(), "Session failed: {}", err);
        self.last_error = Some(err.to_string());
        self.publish_error(&err, true);
        self.transition(SessionState::Error);
        self.teardown();
    }

    /// Release every resource and land in `Disconnected`.
    fn teardown(&mut self) {
        if let Some(capture) = self.capture.take() {
            let mut drain = capture.stop();
            let discarded = drain.discard();
            if discarded > 0 {
                debug!(discarded, "Discarded unsent capture frames");
            }
        }
        if let Some(render) = self.render.take() {
            render.stop();
        }
        if let Some(outbound) = self.outbound.take() {
            if outbound.try_send(ClientMessage::SessionEnd).is_err() {
                debug!("Channel not writable, skipping session end marker");
            }
        }
        self.processing_since = None;
        self.transition(SessionState::Disconnected);
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        if self.state != SessionState::Disconnected {
            self.teardown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::device::virtual_device::VirtualBackend;
    use crate::audio::device::Direction;
    use crate::transport::memory::{MemoryConnector, Peer};

    struct Fixture {
        session: StreamSession,
        backend: VirtualBackend,
        peer: Peer,
        _inbound: mpsc::Receiver<ChannelEvent>,
        faults: mpsc::UnboundedReceiver<DeviceFault>,
    }

    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.playback.quantum = 4;
        config.playback.prebuffer_ms = 1; // 24 samples
        config.capture.quantum = 8;
        config.capture.silence_prefix = 8;
        config.capture.ring_frames = 4;
        config
    }

    fn session_with(config: AppConfig, backend: VirtualBackend, outbound_queue: usize) -> (StreamSession, Peer, mpsc::UnboundedReceiver<DeviceFault>) {
        let (connector, peer) = MemoryConnector::with_peer(outbound_queue);
        let (session, faults) = StreamSession::new(config, Arc::new(backend), Arc::new(connector));
        (session, peer, faults)
    }

    fn connected_with_queue(outbound_queue: usize) -> Fixture {
        let backend = VirtualBackend::new(24_000, 16_000);
        let (mut session, peer, faults) = session_with(test_config(), backend.clone(), outbound_queue);
        let inbound = session.begin_connect().unwrap();
        session.handle_channel_event(ChannelEvent::Opened);
        assert_eq!(session.state(), SessionState::Connected);
        Fixture {
            session,
            backend,
            peer,
            _inbound: inbound,
            faults,
        }
    }

    fn connected() -> Fixture {
        connected_with_queue(16)
    }

    fn audio_message(samples: &[f32], is_final: bool) -> ChannelEvent {
        ChannelEvent::Message(ServerMessage::Audio {
            data: SampleCodec::default().encode(samples),
            content_type: "audio/pcm".to_string(),
            is_final,
        })
    }

    fn drain_events(rx: &mut broadcast::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_connect_walks_through_connecting() {
        let backend = VirtualBackend::new(24_000, 16_000);
        let (mut session, _peer, _faults) = session_with(test_config(), backend.clone(), 16);
        let mut events = session.subscribe();
        let state = session.watch_state();

        let _inbound = session.begin_connect().unwrap();
        assert_eq!(session.state(), SessionState::Connecting);
        assert!(backend.output_open());
        // Pre-rolling from the start
        assert_eq!(backend.render(4), Some(vec![0.0; 4]));

        session.handle_channel_event(ChannelEvent::Opened);
        assert_eq!(*state.borrow(), SessionState::Connected);
        assert_eq!(
            drain_events(&mut events),
            vec![
                StreamEvent::StateChanged {
                    from: SessionState::Disconnected,
                    to: SessionState::Connecting
                },
                StreamEvent::StateChanged {
                    from: SessionState::Connecting,
                    to: SessionState::Connected
                },
            ]
        );
    }

    #[test]
    fn test_inbound_audio_plays_after_preroll() {
        let mut fx = connected();
        fx.session.handle_channel_event(audio_message(&[0.5; 16], false));
        assert_eq!(fx.backend.render(4), Some(vec![0.0; 4]));

        fx.session.handle_channel_event(audio_message(&[0.5; 8], false));
        let out = fx.backend.render(4).unwrap();
        assert!(out.iter().all(|s| (s - 0.5).abs() <= 1.0 / 32767.0));

        let stats = fx.session.stats().snapshot();
        assert_eq!(stats.inbound_frames, 2);
        assert_eq!(stats.inbound_samples, 24);
    }

    #[test]
    fn test_unsupported_content_type_leaves_buffer_untouched() {
        let mut fx = connected();
        let wire = SampleCodec::default().encode(&[0.5; 64]);

        let err = fx.session.push_inbound_audio(&wire, "audio/opus").unwrap_err();
        assert!(matches!(err, AppError::UnsupportedContentType(_)));
        let info = fx.session.info();
        assert_eq!(info.buffer.unwrap().available, 0);
        assert_eq!(info.stats.rejected_frames, 1);
        assert_eq!(fx.session.state(), SessionState::Connected);
    }

    #[test]
    fn test_rejected_service_audio_is_reported_without_failing() {
        let mut fx = connected();
        let mut events = fx.session.subscribe();
        fx.session.handle_channel_event(ChannelEvent::Message(ServerMessage::Audio {
            data: SampleCodec::default().encode(&[0.5; 8]),
            content_type: "audio/mpeg".to_string(),
            is_final: false,
        }));

        assert_eq!(fx.session.state(), SessionState::Connected);
        let events = drain_events(&mut events);
        assert!(events.iter().any(|event| matches!(
            event,
            StreamEvent::Error { kind, fatal: false, .. } if kind == "unsupported_content_type"
        )));
    }

    #[test]
    fn test_decode_warning_is_counted_and_audio_kept() {
        let mut fx = connected();
        // Three bytes: one full sample plus a dangling byte
        let outcome = fx.session.push_inbound_audio("AEAA", "audio/pcm").unwrap();
        assert_eq!(outcome, AppendOutcome::InPlace);

        let info = fx.session.info();
        assert_eq!(info.stats.decode_warnings, 1);
        assert_eq!(info.buffer.unwrap().available, 1);
    }

    #[test]
    fn test_barge_in_silences_next_tick_and_sends_interrupt() {
        let mut fx = connected();
        fx.session.handle_channel_event(audio_message(&[0.5; 64], false));
        assert!(fx.backend.render(4).unwrap()[0] > 0.4);

        fx.session.request_barge_in().unwrap();
        assert_eq!(fx.backend.render(4), Some(vec![0.0; 4]));
        assert_eq!(fx.session.state(), SessionState::Connected);
        assert_eq!(fx.peer.drain_received(), vec![ClientMessage::Interrupt]);
        assert_eq!(fx.session.stats().snapshot().barge_ins, 1);
    }

    #[test]
    fn test_barge_in_rejected_when_disconnected() {
        let (mut session, _peer, _faults) = session_with(test_config(), VirtualBackend::new(24_000, 16_000), 4);
        let err = session.request_barge_in().unwrap_err();
        assert!(matches!(err, AppError::InvalidState(_)));
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_recording_round_trip() {
        let mut fx = connected();
        fx.session.request_start_recording().unwrap();
        assert_eq!(fx.session.state(), SessionState::Recording);
        assert!(fx.backend.input_open());
        assert_eq!(fx.backend.open_counts(), (1, 1));

        fx.backend.capture(&[0.3; 16]);
        fx.session.poll_capture();
        let sent = fx.peer.drain_received();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|m| matches!(m, ClientMessage::Audio { .. })));

        // Captured but not yet polled: flushed ahead of the end marker
        fx.backend.capture(&[0.3; 8]);
        fx.session.request_stop_recording().unwrap();
        assert_eq!(fx.session.state(), SessionState::Processing);
        assert!(!fx.backend.input_open());
        let sent = fx.peer.drain_received();
        assert!(matches!(sent[0], ClientMessage::Audio { .. }));
        assert_eq!(sent[1], ClientMessage::AudioEnd);

        fx.session.handle_channel_event(ChannelEvent::Message(ServerMessage::Text {
            text: "Hello".to_string(),
            is_final: true,
        }));
        assert_eq!(fx.session.state(), SessionState::Connected);
        assert_eq!(fx.session.stats().snapshot().frames_sent, 3);
    }

    #[test]
    fn test_final_audio_frame_completes_response() {
        let mut fx = connected();
        fx.session.request_start_recording().unwrap();
        fx.session.request_stop_recording().unwrap();

        fx.session.handle_channel_event(audio_message(&[0.2; 8], true));
        assert_eq!(fx.session.state(), SessionState::Connected);
    }

    #[test]
    fn test_silent_capture_is_not_sent() {
        let mut fx = connected();
        fx.session.request_start_recording().unwrap();
        fx.backend.capture(&[0.0; 16]);
        fx.session.poll_capture();

        assert!(fx.peer.drain_received().is_empty());
        assert_eq!(fx.session.stats().snapshot().silent_quanta, 2);
    }

    #[test]
    fn test_invalid_transition_is_rejected() {
        let mut fx = connected();
        fx.session.request_start_recording().unwrap();
        fx.session.request_stop_recording().unwrap();

        let err = fx.session.request_start_recording().unwrap_err();
        assert!(matches!(err, AppError::InvalidState(_)));
        assert_eq!(fx.session.state(), SessionState::Processing);
        assert!(fx.session.request_stop_recording().is_err());
    }

    #[test]
    fn test_processing_timeout_returns_to_connected() {
        let mut fx = connected();
        fx.session.request_start_recording().unwrap();
        fx.session.request_stop_recording().unwrap();

        assert!(!fx.session.check_processing_timeout(Instant::now()));
        assert_eq!(fx.session.state(), SessionState::Processing);

        let later = Instant::now() + Duration::from_secs(31);
        assert!(fx.session.check_processing_timeout(later));
        assert_eq!(fx.session.state(), SessionState::Connected);
    }

    #[test]
    fn test_channel_close_while_recording_releases_everything() {
        let mut fx = connected();
        fx.session.request_start_recording().unwrap();
        fx.session.handle_channel_event(ChannelEvent::Closed { reason: None });

        assert_eq!(fx.session.state(), SessionState::Disconnected);
        assert!(!fx.backend.input_open());
        assert!(!fx.backend.output_open());
        // Closed by the peer: no session-end marker
        assert!(fx.peer.drain_received().is_empty());
    }

    #[test]
    fn test_channel_failure_passes_through_error() {
        let mut fx = connected();
        let mut events = fx.session.subscribe();
        fx.session.handle_channel_event(ChannelEvent::Failed("reset by peer".to_string()));

        assert_eq!(fx.session.state(), SessionState::Disconnected);
        let events = drain_events(&mut events);
        assert!(events.contains(&StreamEvent::StateChanged {
            from: SessionState::Connected,
            to: SessionState::Error
        }));
        assert!(events.contains(&StreamEvent::StateChanged {
            from: SessionState::Error,
            to: SessionState::Disconnected
        }));
        assert!(fx.session.info().last_error.unwrap().contains("reset by peer"));
    }

    #[test]
    fn test_device_fault_tears_down_and_ends_session() {
        let mut fx = connected();
        fx.backend.raise_output_error("device unplugged");
        let fault = fx.faults.try_recv().unwrap();
        assert_eq!(fault.direction, Direction::Output);

        fx.session.handle_device_fault(fault);
        assert_eq!(fx.session.state(), SessionState::Disconnected);
        assert!(!fx.backend.output_open());
        // Channel still writable: best-effort session end
        assert_eq!(fx.peer.drain_received(), vec![ClientMessage::SessionEnd]);
    }

    #[test]
    fn test_capture_failure_releases_render_path() {
        let mut fx = connected();
        fx.backend.fail_input_open();

        let err = fx.session.request_start_recording().unwrap_err();
        assert!(matches!(err, AppError::Initialization(_)));
        assert_eq!(fx.session.state(), SessionState::Disconnected);
        assert!(!fx.backend.output_open());
    }

    #[test]
    fn test_connect_failures_release_partial_resources() {
        let backend = VirtualBackend::new(24_000, 16_000);
        let (mut session, _faults) = StreamSession::new(
            test_config(),
            Arc::new(backend.clone()),
            Arc::new(MemoryConnector::default()),
        );
        assert!(matches!(session.begin_connect(), Err(AppError::Initialization(_))));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!backend.output_open());

        // Output device at the wrong rate
        let backend = VirtualBackend::new(48_000, 16_000);
        let (mut session, mut peer, _faults) = session_with(test_config(), backend.clone(), 4);
        assert!(session.begin_connect().is_err());
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(peer.drain_received().is_empty());
    }

    #[test]
    fn test_end_session_is_idempotent() {
        let mut fx = connected();
        fx.session.request_end_session();
        fx.session.request_end_session();

        assert_eq!(fx.session.state(), SessionState::Disconnected);
        assert!(!fx.backend.output_open());
        assert_eq!(fx.peer.drain_received(), vec![ClientMessage::SessionEnd]);
    }

    #[test]
    fn test_full_outbound_queue_drops_frames() {
        let mut fx = connected_with_queue(1);
        fx.session.request_start_recording().unwrap();
        fx.backend.capture(&[0.4; 24]);
        fx.session.poll_capture();

        let stats = fx.session.stats().snapshot();
        assert_eq!(stats.frames_sent, 1);
        assert_eq!(stats.frames_dropped, 2);
        assert_eq!(fx.session.state(), SessionState::Recording);
    }

    #[test]
    fn test_ping_is_answered() {
        let mut fx = connected();
        fx.session
            .handle_channel_event(ChannelEvent::Message(ServerMessage::Ping { timestamp: 42 }));
        assert_eq!(
            fx.peer.drain_received(),
            vec![ClientMessage::Pong { timestamp: 42 }]
        );
    }

    #[test]
    fn test_underflow_and_growth_are_published() {
        let mut fx = connected();
        let mut events = fx.session.subscribe();

        // Larger than the one-second initial store: forces growth
        fx.session.handle_channel_event(audio_message(&vec![0.1; 30_000], false));
        fx.session.set_prebuffer_ms(1).unwrap();
        for _ in 0..7_501 {
            fx.backend.render(4);
        }
        fx.session.poll_observability();

        let events = drain_events(&mut events);
        assert!(events.contains(&StreamEvent::BufferGrown { capacity: 60_000 }));
        assert!(events.contains(&StreamEvent::Underflow { samples: 4, total: 4 }));
    }

    #[test]
    fn test_output_level_follows_rendered_audio() {
        let mut fx = connected();
        let mut events = fx.session.subscribe();
        assert_eq!(fx.session.info().output.unwrap().level.peak, 0.0);

        // Enough to fill one analysis window
        fx.session.handle_channel_event(audio_message(&[0.5; 600], false));
        for _ in 0..130 {
            fx.backend.render(4);
        }
        fx.session.poll_observability();

        let events = drain_events(&mut events);
        let level = events.iter().find_map(|event| match event {
            StreamEvent::OutputLevel { peak, rms } => Some((*peak, *rms)),
            _ => None,
        });
        let (peak, rms) = level.unwrap();
        assert!((peak - 0.5).abs() <= 1.0 / 32767.0);
        assert!((rms - 0.5).abs() <= 1.0 / 32767.0);

        let output = fx.session.info().output.unwrap();
        assert_eq!(output.fft_size, 512);
        assert_eq!(output.frequency_data.len(), 256);
        // A constant signal puts all its energy at DC
        assert_eq!(output.frequency_data[0], 255);
        assert_eq!(output.frequency_data[128], 0);

        // Silence after barge-in: the snapshot drops to zero, no event is published
        let mut events = fx.session.subscribe();
        fx.session.request_barge_in().unwrap();
        fx.backend.render(4);
        fx.session.poll_observability();
        assert_eq!(fx.session.info().output.unwrap().level.peak, 0.0);
        assert!(!drain_events(&mut events)
            .iter()
            .any(|event| matches!(event, StreamEvent::OutputLevel { .. })));
    }

    #[test]
    fn test_set_prebuffer_requires_render_path() {
        let (mut session, _peer, _faults) = session_with(test_config(), VirtualBackend::new(24_000, 16_000), 4);
        assert!(matches!(session.set_prebuffer_ms(500), Err(AppError::InvalidState(_))));

        let mut fx = connected();
        assert_eq!(fx.session.set_prebuffer_ms(500).unwrap(), 12_000);
        assert_eq!(fx.session.info().buffer.unwrap().prebuffer_threshold, 12_000);
    }
}
