use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Stall detection for the worker's dequeue loop.
///
/// The loop records a beat once per iteration and the `/_liveness` probe
/// reads the status. The dequeue timeout bounds an idle iteration, so the
/// only way to miss the deadline is to be wedged mid-task (almost always
/// inside a checker call); the probe then fails and the process gets
/// restarted. This service runs exactly one such loop per process, so there
/// is no component registry, just the one beat.
#[derive(Clone)]
pub struct Liveness {
    deadline: Duration,
    last_beat: Arc<Mutex<Option<Instant>>>,
}

impl Liveness {
    /// `deadline` must comfortably exceed one loop iteration: the dequeue
    /// wait plus the slowest expected checker call including retries.
    pub fn new(deadline: Duration) -> Self {
        Self {
            deadline,
            last_beat: Arc::new(Mutex::new(None)),
        }
    }

    /// Record one completed loop iteration.
    pub fn beat(&self) {
        *self.lock() = Some(Instant::now());
    }

    pub fn status(&self) -> LivenessStatus {
        match *self.lock() {
            None => LivenessStatus::Starting,
            Some(at) if at.elapsed() <= self.deadline => LivenessStatus::Healthy,
            Some(_) => LivenessStatus::Stalled,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Instant>> {
        match self.last_beat.lock() {
            Ok(guard) => guard,
            // A panic between load and store cannot leave a torn Option;
            // keep serving the probe.
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Probe answer for `/_liveness`. `Starting` counts as live: a loop that
/// has not finished its first iteration yet is slow, not wedged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessStatus {
    Starting,
    Healthy,
    Stalled,
}

impl LivenessStatus {
    pub fn is_live(&self) -> bool {
        !matches!(self, LivenessStatus::Stalled)
    }
}

impl IntoResponse for LivenessStatus {
    fn into_response(self) -> Response {
        match self {
            LivenessStatus::Starting => (StatusCode::OK, "starting"),
            LivenessStatus::Healthy => (StatusCode::OK, "ok"),
            LivenessStatus::Stalled => {
                (StatusCode::INTERNAL_SERVER_ERROR, "worker loop stalled")
            }
        }
        .into_response()
    }
}
