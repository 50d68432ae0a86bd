//! # Application State
//!
//! Shared by every control API handler: the configuration, request metrics, the audio
//! backend and connector used to build sessions, and the slot holding the current
//! session.
//!
//! ## Thread Safety:
//! - `config` and `metrics` sit behind `RwLock`s. Handlers copy what they need out and
//!   release the lock before doing any work.
//! - The session slot is a `Mutex<SessionSlot>`. Only the handle lives there; the session
//!   itself runs on its own task. Starting a session first marks the slot `Starting`,
//!   then opens the channel and devices on the blocking pool with the lock released, so
//!   health checks never wait on a device.
//! - A poisoned lock still holds consistent data (every update is a single assignment
//!   or counter bump), so it is recovered instead of propagated.

use crate::audio::device::AudioBackend;
use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::session::{SessionHandle, SessionState};
use crate::transport::Connector;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    /// Applied to the next session; running sessions keep the config they started with
    pub config: Arc<RwLock<AppConfig>>,

    pub metrics: Arc<RwLock<AppMetrics>>,

    pub backend: Arc<dyn AudioBackend>,
    pub connector: Arc<dyn Connector>,

    session: Arc<Mutex<SessionSlot>>,

    pub start_time: Instant,
}

/// Single-session slot.
#[derive(Default)]
enum SessionSlot {
    #[default]
    Idle,
    /// Reserved while the channel and devices are being opened
    Starting,
    Active(SessionHandle),
}

/// Holds the `Starting` mark; frees the slot again unless a handle was installed.
struct StartReservation<'a> {
    state: &'a AppState,
    committed: bool,
}

impl StartReservation<'_> {
    fn commit(mut self, handle: SessionHandle) {
        *self.state.slot() = SessionSlot::Active(handle);
        self.committed = true;
    }
}

impl Drop for StartReservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            let mut slot = self.state.slot();
            if matches!(*slot, SessionSlot::Starting) {
                *slot = SessionSlot::Idle;
            }
        }
    }
}

/// Request metrics collected by [`crate::middleware::MetricsMiddleware`].
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,

    /// Sessions started since the server came up
    pub sessions_started: u64,

    /// Key: route pattern (e.g., "POST /api/v1/session")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        backend: Arc<dyn AudioBackend>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            backend,
            connector,
            session: Arc::new(Mutex::new(SessionSlot::Idle)),
            start_time: Instant::now(),
        }
    }

    pub fn get_config(&self) -> AppConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> AppResult<()> {
        new_config
            .validate()
            .map_err(|e| AppError::ValidationError(e.to_string()))?;
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = new_config;
        Ok(())
    }

    fn slot(&self) -> MutexGuard<'_, SessionSlot> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The live session, if any. A session that has finished on its own is cleared.
    pub fn current_session(&self) -> Option<SessionHandle> {
        let mut slot = self.slot();
        match &*slot {
            SessionSlot::Active(handle) if is_live(handle) => Some(handle.clone()),
            SessionSlot::Active(_) => {
                *slot = SessionSlot::Idle;
                None
            }
            SessionSlot::Idle | SessionSlot::Starting => None,
        }
    }

    /// Mark the slot as starting, or fail if a session is starting or running.
    fn reserve_start(&self) -> AppResult<StartReservation<'_>> {
        let mut slot = self.slot();
        match &*slot {
            SessionSlot::Starting => {
                return Err(AppError::InvalidState("A session is already starting".to_string()))
            }
            SessionSlot::Active(existing) if is_live(existing) => {
                return Err(AppError::InvalidState(format!(
                    "Session {} is already {}",
                    existing.id(),
                    existing.state()
                )))
            }
            _ => {}
        }
        *slot = SessionSlot::Starting;
        Ok(StartReservation {
            state: self,
            committed: false,
        })
    }

    /// Start a session with the current configuration.
    ///
    /// Only one session runs at a time; a second start is an [`AppError::InvalidState`].
    /// Opening the output device can block, so it runs on the blocking pool.
    pub async fn start_session(&self) -> AppResult<SessionHandle> {
        let reservation = self.reserve_start()?;

        let config = self.get_config();
        let backend = self.backend.clone();
        let connector = self.connector.clone();
        let handle = tokio::task::spawn_blocking(move || SessionHandle::start(config, backend, connector))
            .await
            .map_err(|e| AppError::Internal(format!("Session start task failed: {}", e)))??;

        reservation.commit(handle.clone());
        self.metrics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .sessions_started += 1;
        Ok(handle)
    }

    /// Remove and return the session so the caller can end it outside the lock.
    pub fn take_session(&self) -> Option<SessionHandle> {
        let mut slot = self.slot();
        match std::mem::take(&mut *slot) {
            SessionSlot::Active(handle) => Some(handle),
            SessionSlot::Starting => {
                *slot = SessionSlot::Starting;
                None
            }
            SessionSlot::Idle => None,
        }
    }

    pub fn has_active_session(&self) -> bool {
        self.current_session().is_some()
    }

    /// Record one finished request (called by the metrics middleware).
    pub fn record_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.request_count += 1;
        if is_error {
            metrics.error_count += 1;
        }

        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

fn is_live(handle: &SessionHandle) -> bool {
    !handle.is_finished() && handle.state() != SessionState::Disconnected
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of requests that failed (0.0 to 1.0).
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
