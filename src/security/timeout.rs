//! Last-activity session expiry.
//!
//! A session is active while `now - last_activity <= timeout`. Records are
//! evicted lazily by [`SessionTimeoutManager::is_active`] and eagerly by
//! [`SessionTimeoutManager::cleanup_expired`], which the optional background
//! sweeper calls on an interval.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{Error, Result};

struct TimeoutState {
    timeout: Duration,
    max_sessions: usize,
    sessions: Mutex<HashMap<String, Instant>>,
}

impl TimeoutState {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn expired(&self, last_activity: Instant, now: Instant) -> bool {
        now.saturating_duration_since(last_activity) > self.timeout
    }

    fn sweep(&self, sessions: &mut HashMap<String, Instant>) -> usize {
        let now = Instant::now();
        let before = sessions.len();
        sessions.retain(|_, last| !self.expired(*last, now));
        before - sessions.len()
    }

    /// Sweep under the lock; returns `(removed, remaining)`.
    fn sweep_now(&self) -> (usize, usize) {
        let mut sessions = self.lock();
        let removed = self.sweep(&mut sessions);
        (removed, sessions.len())
    }
}

struct Sweeper {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Tracks session liveness by last activity.
pub struct SessionTimeoutManager {
    state: Arc<TimeoutState>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl SessionTimeoutManager {
    pub fn new(timeout: Duration, max_sessions: usize) -> Self {
        Self {
            state: Arc::new(TimeoutState {
                timeout,
                max_sessions,
                sessions: Mutex::new(HashMap::new()),
            }),
            sweeper: Mutex::new(None),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.state.timeout
    }

    pub fn max_sessions(&self) -> usize {
        self.state.max_sessions
    }

    /// Register a session, sweeping expired ones before the capacity check.
    ///
    /// Re-registering a live id refreshes it without consuming capacity.
    pub fn register(&self, session_id: &str) -> Result<()> {
        let mut sessions = self.state.lock();
        let swept = self.state.sweep(&mut sessions);
        if swept > 0 {
            debug!(swept, "expired sessions removed during register");
        }

        if !sessions.contains_key(session_id) && sessions.len() >= self.state.max_sessions {
            warn!(
                session_id,
                max_sessions = self.state.max_sessions,
                "session capacity exceeded"
            );
            return Err(Error::CapacityExceeded {
                max: self.state.max_sessions,
            });
        }

        sessions.insert(session_id.to_string(), Instant::now());
        info!(session_id, active = sessions.len(), "session registered");
        Ok(())
    }

    /// Refresh the activity timestamp. Unknown ids are ignored.
    pub fn update_activity(&self, session_id: &str) {
        let mut sessions = self.state.lock();
        if let Some(last) = sessions.get_mut(session_id) {
            let now = Instant::now();
            if now > *last {
                *last = now;
            }
        }
    }

    /// Whether the session is live; an expired record is evicted.
    pub fn is_active(&self, session_id: &str) -> bool {
        let mut sessions = self.state.lock();
        let Some(last) = sessions.get(session_id).copied() else {
            return false;
        };
        if self.state.expired(last, Instant::now()) {
            sessions.remove(session_id);
            info!(session_id, "session expired");
            return false;
        }
        true
    }

    /// Returns `true` when a record was removed.
    pub fn unregister(&self, session_id: &str) -> bool {
        let removed = self.state.lock().remove(session_id).is_some();
        if removed {
            info!(session_id, "session unregistered");
        }
        removed
    }

    /// Remove every expired session and return how many were dropped.
    pub fn cleanup_expired(&self) -> usize {
        self.state.sweep_now().0
    }

    /// Number of live sessions (expired records are purged first).
    pub fn session_count(&self) -> usize {
        self.state.sweep_now().1
    }

    pub fn last_activity(&self, session_id: &str) -> Option<Instant> {
        self.state.lock().get(session_id).copied()
    }

    /// Time left before the session expires.
    pub fn remaining(&self, session_id: &str) -> Option<Duration> {
        let last = self.last_activity(session_id)?;
        let idle = Instant::now().saturating_duration_since(last);
        self.state.timeout.checked_sub(idle)
    }

    /// Start the periodic sweeper. A second call while running is a no-op.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_autocleanup(&self, interval: Duration) {
        let mut sweeper = self.sweeper.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = sweeper.as_ref() {
            if !existing.handle.is_finished() {
                debug!("session autocleanup already running");
                return;
            }
        }

        let (stop_tx, mut stop_rx) = oneshot::channel();
        let state = self.state.clone();
        let period = interval.max(Duration::from_millis(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let (removed, remaining) = state.sweep_now();
                        if removed > 0 {
                            info!(removed, remaining, "swept expired sessions");
                        }
                    }
                    _ = &mut stop_rx => break,
                }
            }
            debug!("session autocleanup stopped");
        });

        info!(interval = ?period, "session autocleanup started");
        *sweeper = Some(Sweeper {
            stop: stop_tx,
            handle,
        });
    }

    /// Stop the sweeper and wait for it to exit. Safe when not running.
    pub async fn stop_autocleanup(&self) {
        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(sweeper) = sweeper {
            let _ = sweeper.stop.send(());
            let _ = sweeper.handle.await;
        }
    }

    pub fn is_autocleanup_running(&self) -> bool {
        self.sweeper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|s| !s.handle.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for SessionTimeoutManager {
    fn drop(&mut self) {
        if let Some(sweeper) = self
            .sweeper
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            sweeper.handle.abort();
        }
    }
}
