use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{ApiRequest, ApiResponse, AuthError};
use crate::auth::AuthSession;
use crate::models::{AnalysisReport, AnalysisStatus};

// ============================================================================
// Constants
// ============================================================================

/// Delay between a status response and the next poll.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(2000);

/// After a failed poll the next one waits this multiple of the interval.
const ERROR_BACKOFF_FACTOR: f64 = 1.5;

/// Buffer size for the event channel.
/// A job emits a handful of updates; 16 leaves room for a slow reader.
const EVENT_BUFFER_SIZE: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub enum PollEventKind {
    /// Job is `PENDING` or `PROCESSING`
    Update(AnalysisReport),
    Complete(AnalysisReport),
    Failed(AnalysisReport),
    /// A poll failed. Polling continues unless the session has ended.
    Error(String),
}

#[derive(Debug, Clone)]
pub struct PollEvent {
    pub job_id: String,
    pub kind: PollEventKind,
    pub received_at: DateTime<Utc>,
}

impl PollEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, PollEventKind::Complete(_) | PollEventKind::Failed(_))
    }

    pub fn report(&self) -> Option<&AnalysisReport> {
        match &self.kind {
            PollEventKind::Update(r) | PollEventKind::Complete(r) | PollEventKind::Failed(r) => {
                Some(r)
            }
            PollEventKind::Error(_) => None,
        }
    }
}

/// What one poll tick observed.
enum Tick {
    Status(AnalysisReport, AnalysisStatus),
    /// Empty body or no recognizable status: the job does not exist yet.
    NotStarted,
    /// Transient failure, poll again after backoff.
    Retry(String),
    /// The session is gone; polling cannot continue.
    Stop(String),
}

fn classify(result: Result<ApiResponse, AuthError>) -> Tick {
    let response = match result {
        Ok(response) => response,
        Err(e) if e.is_session_fatal() => return Tick::Stop(e.to_string()),
        Err(e) => return Tick::Retry(e.to_string()),
    };

    if !response.is_success() {
        return Tick::Retry(AuthError::from_status(response.status, &response.text()).to_string());
    }
    if response.is_empty() {
        return Tick::NotStarted;
    }

    let value: serde_json::Value = match response.json() {
        Ok(value) => value,
        Err(e) => return Tick::Retry(format!("Malformed analysis response: {}", e)),
    };
    let Some(state) = value
        .get("status")
        .and_then(|s| s.as_str())
        .and_then(AnalysisStatus::parse)
    else {
        return Tick::NotStarted;
    };

    // A known status wins over fields that fail to decode
    let report = match serde_json::from_value::<AnalysisReport>(value.clone()) {
        Ok(report) => report,
        Err(e) => {
            warn!(error = %e, status = state.as_str(), "Analysis report fields did not decode");
            AnalysisReport::status_only(state, value)
        }
    };
    Tick::Status(report, state)
}

struct PollTask {
    session: AuthSession,
    job_id: String,
    url: String,
    interval: Duration,
    cancel: CancellationToken,
    done: CancellationToken,
    events: mpsc::Sender<PollEvent>,
}

impl PollTask {
    /// Poll, wait, repeat. The next poll is armed only after the previous
    /// response arrived, so at most one request is in flight.
    async fn run(self) {
        info!(job_id = %self.job_id, "Monitoring analysis status");

        loop {
            let result = self
                .session
                .authenticated_fetch(ApiRequest::get(&self.url))
                .await;

            // The request is not aborted by disconnect, but its result is dropped
            if self.cancel.is_cancelled() {
                debug!(job_id = %self.job_id, "Disconnected while request in flight");
                break;
            }

            let delay = match classify(result) {
                Tick::Status(report, state) => {
                    debug!(job_id = %self.job_id, status = state.as_str(), "Analysis status");
                    let kind = match state {
                        AnalysisStatus::Pending | AnalysisStatus::Processing => {
                            PollEventKind::Update(report)
                        }
                        AnalysisStatus::Completed => PollEventKind::Complete(report),
                        AnalysisStatus::Failed => PollEventKind::Failed(report),
                    };
                    if !self.emit(kind).await || state.is_terminal() {
                        break;
                    }
                    self.interval
                }
                Tick::NotStarted => {
                    debug!(job_id = %self.job_id, "Analysis not started yet");
                    self.interval
                }
                Tick::Retry(message) => {
                    warn!(job_id = %self.job_id, error = %message, "Status poll failed");
                    if !self.emit(PollEventKind::Error(message)).await {
                        break;
                    }
                    self.interval.mul_f64(ERROR_BACKOFF_FACTOR)
                }
                Tick::Stop(message) => {
                    warn!(job_id = %self.job_id, error = %message, "Session ended, stopping status polling");
                    self.emit(PollEventKind::Error(message)).await;
                    break;
                }
            };

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.done.cancel();
        info!(job_id = %self.job_id, "Stopped monitoring analysis status");
    }

    /// Returns false once nobody is listening.
    async fn emit(&self, kind: PollEventKind) -> bool {
        let event = PollEvent {
            job_id: self.job_id.clone(),
            kind,
            received_at: Utc::now(),
        };
        if self.events.send(event).await.is_err() {
            debug!(job_id = %self.job_id, "Event receiver dropped");
            return false;
        }
        true
    }
}

/// Receiving end for one monitored job. Dropping it stops the polling.
pub struct PollHandle {
    job_id: String,
    events: mpsc::Receiver<PollEvent>,
    cancel: CancellationToken,
    done: CancellationToken,
}

impl PollHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Next event, or `None` once polling has stopped or was disconnected.
    /// Nothing is delivered after `disconnect()`, even if already buffered.
    pub async fn next(&mut self) -> Option<PollEvent> {
        if self.cancel.is_cancelled() {
            return None;
        }
        let event = tokio::select! {
            _ = self.cancel.cancelled() => None,
            event = self.events.recv() => event,
        };
        event.filter(|_| !self.cancel.is_cancelled())
    }

    /// Stop polling. Idempotent.
    pub fn disconnect(&self) {
        self.cancel.cancel();
    }

    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled() && !self.done.is_cancelled()
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct ActiveJob {
    job_id: String,
    cancel: CancellationToken,
    done: CancellationToken,
}

/// Watches analysis jobs through an `AuthSession`.
///
/// One job at a time: `monitor` disconnects whatever was being watched before.
pub struct StatusPoller {
    session: AuthSession,
    interval: Duration,
    active: Option<ActiveJob>,
}

impl StatusPoller {
    pub fn new(session: AuthSession) -> Self {
        Self {
            session,
            interval: DEFAULT_POLL_INTERVAL,
            active: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start polling `job_id` immediately. Must be called within a tokio runtime.
    pub fn monitor(&mut self, job_id: impl Into<String>) -> PollHandle {
        let job_id = job_id.into();
        if let Some(previous) = self.active.as_ref().filter(|_| self.is_active()) {
            warn!(previous = %previous.job_id, next = %job_id, "Replacing active status monitor");
        }
        self.disconnect();

        let cancel = CancellationToken::new();
        let done = CancellationToken::new();
        let (tx, rx) = mpsc::channel(EVENT_BUFFER_SIZE);

        let task = PollTask {
            session: self.session.clone(),
            job_id: job_id.clone(),
            url: self.session.api().analysis_url(&job_id),
            interval: self.interval,
            cancel: cancel.clone(),
            done: done.clone(),
            events: tx,
        };
        tokio::spawn(task.run());

        self.active = Some(ActiveJob {
            job_id: job_id.clone(),
            cancel: cancel.clone(),
            done: done.clone(),
        });

        PollHandle {
            job_id,
            events: rx,
            cancel,
            done,
        }
    }

    /// Cancel the current job's pending poll. Safe to call in any state.
    pub fn disconnect(&mut self) {
        if let Some(active) = self.active.take() {
            if !active.cancel.is_cancelled() {
                debug!(job_id = %active.job_id, "Disconnecting status monitor");
            }
            active.cancel.cancel();
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| !a.cancel.is_cancelled() && !a.done.is_cancelled())
    }

    pub fn job_id(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.job_id.as_str())
    }
}
