use chrono::Utc;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{MonitorError, MonitorResult};
use crate::types::Session;

struct SessionState {
    current: Option<Session>,
    /// Bumped on every arm/cancel; a timer only fires for its own generation
    generation: u64,
    timer: Option<JoinHandle<()>>,
    started: u64,
}

impl SessionState {
    /// Timer expiry for `generation`; a no-op if the timer was re-armed or cancelled since.
    fn expire(&mut self, generation: u64) -> Option<Session> {
        if self.generation != generation {
            return None;
        }
        self.timer = None;
        self.current.take()
    }

    fn cancel_timer(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Owns the driving session (NO_SESSION / ACTIVE) and its inactivity timeout.
///
/// Cloning shares the same session. The timer task runs on the ambient tokio
/// runtime, so the mutating calls must be made from within one.
#[derive(Clone)]
pub struct SessionManager {
    state: Arc<Mutex<SessionState>>,
    timeout: Duration,
}

impl SessionManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(SessionState {
                current: None,
                generation: 0,
                timer: None,
                started: 0,
            })),
            timeout,
        }
    }

    fn lock(&self) -> MonitorResult<MutexGuard<'_, SessionState>> {
        self.state
            .lock()
            .map_err(|_| MonitorError::Internal("Failed to acquire session lock".to_string()))
    }

    /// Start a session, or return the active one without touching its timer.
    pub fn start_session(&self) -> MonitorResult<Uuid> {
        let mut state = self.lock()?;
        if let Some(session) = &state.current {
            return Ok(session.id);
        }

        let now = Utc::now();
        let session = Session { id: Uuid::new_v4(), start_time: now, last_activity_time: now };
        state.current = Some(session);
        state.started += 1;
        self.arm_timer(&mut state);
        log::info!("Session {} started", session.id);
        Ok(session.id)
    }

    /// Record activity on the active session and restart its timeout.
    /// Returns false when there is no session.
    pub fn update_activity(&self) -> MonitorResult<bool> {
        let mut state = self.lock()?;
        let Some(session) = state.current.as_mut() else {
            return Ok(false);
        };
        session.last_activity_time = Utc::now();
        self.arm_timer(&mut state);
        Ok(true)
    }

    /// End the active session, if any. Safe to call repeatedly.
    pub fn end_session(&self) -> MonitorResult<Option<Session>> {
        let mut state = self.lock()?;
        state.cancel_timer();
        let ended = state.current.take();
        if let Some(session) = &ended {
            log::info!("Session {} ended", session.id);
        }
        Ok(ended)
    }

    pub fn current_session(&self) -> MonitorResult<Option<Session>> {
        Ok(self.lock()?.current)
    }

    pub fn has_active_session(&self) -> MonitorResult<bool> {
        Ok(self.lock()?.current.is_some())
    }

    /// Sessions opened since construction.
    pub fn sessions_started(&self) -> MonitorResult<u64> {
        Ok(self.lock()?.started)
    }

    fn arm_timer(&self, state: &mut SessionState) {
        state.cancel_timer();
        let generation = state.generation;
        let weak: Weak<Mutex<SessionState>> = Arc::downgrade(&self.state);
        let timeout = self.timeout;

        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let Ok(mut state) = shared.lock() else {
                log::error!("Session lock poisoned, timeout dropped");
                return;
            };
            if let Some(session) = state.expire(generation) {
                log::info!("Session {} timed out after {:?} of inactivity", session.id, timeout);
            }
        }));
    }
}

impl Drop for SessionState {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}
