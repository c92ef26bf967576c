//! Credential lifetime monitor.
//!
//! Given a credential, the monitor schedules three independent timers
//! relative to its `exp` claim: a warning, a refresh attempt and the final
//! expiry. Each timer is a spawned tokio task; [`SessionMonitor::stop`] aborts
//! all of them and bumps an epoch so a timer that has already woken up cannot
//! apply a transition for a credential that has since been replaced.
//!
//! Each stage fires at its own deadline, at most once per credential. When a
//! timer wakes, any earlier stage whose deadline has also passed but whose
//! timer has not run yet (several windows collapsing to zero delay) is fired
//! first, so stages that are due together still fire in order. A stage that
//! is not due yet is left to its own timer. The state never moves backwards:
//! a warning window shorter than the refresh window fires its warning after
//! the refresh and the state stays at `RefreshAttempted`.
//!
//! The expiry decisions here come from unverified claims and only drive the
//! user experience. The server still decides whether a request is authorized.

use crate::events::{EventBus, EventKind};
use crate::token::{Credential, now_ms};
use futures_util::future::BoxFuture;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Default lead time for the warning callback.
pub const DEFAULT_WARNING_WINDOW: Duration = Duration::from_secs(5 * 60);
/// Default lead time for the refresh attempt.
pub const DEFAULT_REFRESH_WINDOW: Duration = Duration::from_secs(2 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorConfig {
    /// How long before expiry the warning fires.
    pub warning_window: Duration,
    /// How long before expiry the refresh attempt fires.
    pub refresh_window: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            warning_window: DEFAULT_WARNING_WINDOW,
            refresh_window: DEFAULT_REFRESH_WINDOW,
        }
    }
}

/// Lifecycle of the monitored credential. Variants are ordered; a credential
/// only ever moves forward through them until it is replaced or cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionState {
    NoCredential,
    Monitoring,
    WarningIssued,
    RefreshAttempted,
    Expired,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::NoCredential => "no credential",
            SessionState::Monitoring => "monitoring",
            SessionState::WarningIssued => "warning issued",
            SessionState::RefreshAttempted => "refresh attempted",
            SessionState::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// Callbacks invoked by the monitor. Every method has a no-op default.
///
/// Callbacks run on the timer task with no monitor lock held, so they may
/// call back into the monitor (including `stop`).
pub trait SessionHooks: Send + Sync + 'static {
    /// The warning window was reached.
    fn on_warning(&self, remaining: Duration) {
        let _ = remaining;
    }

    /// Try to extend the session. Resolves `true` if it worked. The default
    /// has no refresh mechanism and always resolves `false`.
    fn refresh(&self) -> BoxFuture<'static, bool> {
        Box::pin(std::future::ready(false))
    }

    /// `refresh` resolved `true` while the same credential was still monitored.
    fn on_refreshed(&self) {}

    /// The credential expired. Runs after `expired` is published on the bus.
    fn on_expired(&self) {}
}

/// Hooks that do nothing.
pub struct NoHooks;

impl SessionHooks for NoHooks {}

struct Inner {
    state: SessionState,
    credential: Option<Credential>,
    deadline: Option<Instant>,
    /// When each timed stage is due for the current credential.
    schedule: Vec<(SessionState, Instant)>,
    fired: Vec<SessionState>,
    epoch: u64,
    timers: Vec<JoinHandle<()>>,
}

struct Shared {
    config: MonitorConfig,
    bus: Arc<EventBus>,
    hooks: Arc<dyn SessionHooks>,
    inner: Mutex<Inner>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.lock().epoch == epoch
    }
}

/// Watches one credential at a time. Timers need a tokio runtime, so
/// [`start`](Self::start) must be called from within one.
pub struct SessionMonitor {
    shared: Arc<Shared>,
}

impl SessionMonitor {
    pub fn new(config: MonitorConfig, bus: Arc<EventBus>, hooks: Arc<dyn SessionHooks>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                bus,
                hooks,
                inner: Mutex::new(Inner {
                    state: SessionState::NoCredential,
                    credential: None,
                    deadline: None,
                    schedule: Vec::new(),
                    fired: Vec::new(),
                    epoch: 0,
                    timers: Vec::new(),
                }),
            }),
        }
    }

    pub fn config(&self) -> MonitorConfig {
        self.shared.config
    }

    /// Pure expiry check. Undecodable credentials count as expired.
    pub fn is_expired(credential: &Credential) -> bool {
        credential.is_expired()
    }

    /// Begin monitoring `credential`, replacing any previous one.
    pub fn start(&self, credential: Credential) {
        self.start_at(credential, now_ms());
    }

    /// [`start`](Self::start) with an explicit wall-clock time in Unix millis.
    pub fn start_at(&self, credential: Credential, now_ms: u64) {
        self.stop();

        let Some(remaining) = credential.remaining_at(now_ms) else {
            let epoch = {
                let mut inner = self.shared.lock();
                inner.credential = Some(credential);
                inner.state = SessionState::Expired;
                inner.epoch
            };
            tracing::info!("credential already expired or unreadable");
            run_expired(&self.shared, epoch);
            return;
        };

        let start = Instant::now();
        let config = self.shared.config;
        let mut inner = self.shared.lock();
        let epoch = inner.epoch;
        inner.credential = Some(credential);
        inner.state = SessionState::Monitoring;
        inner.deadline = Some(start + remaining);

        let schedule = [
            (SessionState::WarningIssued, remaining.saturating_sub(config.warning_window)),
            (SessionState::RefreshAttempted, remaining.saturating_sub(config.refresh_window)),
            (SessionState::Expired, remaining),
        ];
        for (stage, delay) in schedule {
            let due = start + delay;
            inner.schedule.push((stage, due));
            let shared = Arc::clone(&self.shared);
            inner.timers.push(tokio::spawn(async move {
                tokio::time::sleep_until(due).await;
                fire(&shared, stage, epoch);
            }));
        }
        drop(inner);

        tracing::info!(
            remaining_secs = remaining.as_secs(),
            warning_secs = config.warning_window.as_secs(),
            refresh_secs = config.refresh_window.as_secs(),
            "monitoring credential"
        );
    }

    /// Cancel all timers and forget the credential. Idempotent.
    pub fn stop(&self) {
        let mut inner = self.shared.lock();
        inner.epoch += 1;
        for timer in inner.timers.drain(..) {
            timer.abort();
        }
        if inner.state != SessionState::NoCredential {
            tracing::debug!(from = %inner.state, "monitor stopped");
        }
        inner.state = SessionState::NoCredential;
        inner.credential = None;
        inner.deadline = None;
        inner.schedule.clear();
        inner.fired.clear();
    }

    pub fn state(&self) -> SessionState {
        self.shared.lock().state
    }

    pub fn credential(&self) -> Option<Credential> {
        self.shared.lock().credential.clone()
    }

    /// Time until the monitored credential expires, on the runtime clock.
    pub fn time_left(&self) -> Option<Duration> {
        let inner = self.shared.lock();
        if inner.state == SessionState::Expired {
            return None;
        }
        inner
            .deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// A credential is held, its expiry has not been reached and its claims
    /// do not say otherwise.
    pub fn is_authenticated(&self) -> bool {
        let inner = self.shared.lock();
        match (&inner.credential, inner.state) {
            (Some(_), SessionState::NoCredential | SessionState::Expired) => false,
            (Some(credential), _) => !credential.is_expired(),
            (None, _) => false,
        }
    }
}

impl Drop for SessionMonitor {
    fn drop(&mut self) {
        let mut inner = self.shared.lock();
        inner.epoch += 1;
        for timer in inner.timers.drain(..) {
            timer.abort();
        }
    }
}

/// Timer for `target` woke up. Fires `target` together with any earlier stage
/// that is already due but has not fired yet, in stage order.
fn fire(shared: &Arc<Shared>, target: SessionState, epoch: u64) {
    let entered = {
        let mut guard = shared.lock();
        let inner = &mut *guard;
        if inner.epoch != epoch {
            return;
        }
        let now = Instant::now();
        let entered: Vec<SessionState> = inner
            .schedule
            .iter()
            .filter(|(stage, due)| *stage == target || (*stage < target && *due <= now))
            .map(|(stage, _)| *stage)
            .filter(|stage| !inner.fired.contains(stage))
            .collect();
        for stage in &entered {
            inner.fired.push(*stage);
            inner.state = inner.state.max(*stage);
        }
        entered
    };

    for stage in entered {
        if !shared.is_current(epoch) {
            return;
        }
        match stage {
            SessionState::WarningIssued => {
                let remaining = shared
                    .lock()
                    .deadline
                    .map(|d| d.saturating_duration_since(Instant::now()))
                    .unwrap_or_default();
                tracing::info!(remaining_secs = remaining.as_secs(), "session expiring soon");
                shared.hooks.on_warning(remaining);
            }
            SessionState::RefreshAttempted => spawn_refresh(shared, epoch),
            SessionState::Expired => run_expired(shared, epoch),
            SessionState::NoCredential | SessionState::Monitoring => {}
        }
    }
}

/// Run the refresh hook on its own task so a slow refresh never delays the
/// expiry timer.
fn spawn_refresh(shared: &Arc<Shared>, epoch: u64) {
    tracing::debug!("attempting session refresh");
    let refresh = shared.hooks.refresh();
    let task_shared = Arc::clone(shared);
    let handle = tokio::spawn(async move {
        let refreshed = refresh.await;
        if !refreshed {
            tracing::debug!("session refresh unavailable");
            return;
        }
        if task_shared.is_current(epoch) {
            tracing::info!("session refreshed");
            task_shared.hooks.on_refreshed();
        }
    });
    let mut inner = shared.lock();
    if inner.epoch == epoch {
        inner.timers.push(handle);
    } else {
        handle.abort();
    }
}

/// Subscribers usually `stop` the monitor in response, so the epoch is only
/// checked before publishing.
fn run_expired(shared: &Arc<Shared>, epoch: u64) {
    if !shared.is_current(epoch) {
        return;
    }
    tracing::info!("session expired");
    shared.bus.publish(&EventKind::EXPIRED);
    shared.hooks.on_expired();
}
