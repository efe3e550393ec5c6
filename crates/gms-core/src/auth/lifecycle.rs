//! The session lifecycle: bearer token, hard expiry and idle watchdog.
//!
//! ```text
//! login() / restore() ──→ [LoggedIn] ──(idle or expiry timer)──→ [IdleWarned]
//!                            │    ▲                                   │
//!           touch_activity() └────┘ re-arms idle watchdog             │
//!                                                                      ▼
//!                      [LoggedOut] ◀──────────── logout() ◀────── prompt shown
//! ```
//!
//! All state sits behind one mutex that is never held across an await or
//! while calling into a [`PromptSurface`]. Each armed timer carries a
//! sequence number, so a timer that wakes after it was replaced, cancelled
//! or outlived its session does nothing.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::claims;
use super::verify::{TokenStatus, TokenVerifier};
use crate::config::Config;
use crate::storage::{
    KeyValueStore, LAST_ACTIVITY_KEY, TOKEN_EXPIRY_KEY, TOKEN_KEY, USER_ID_KEY, USER_TYPE_KEY,
};

/// Buffered session events per subscriber
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Deadline used when a configured delay does not fit in a clock value.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Keys owned by the session; removed one by one if clearing the store fails.
const SESSION_KEYS: [&str; 5] = [
    TOKEN_KEY,
    USER_ID_KEY,
    USER_TYPE_KEY,
    TOKEN_EXPIRY_KEY,
    LAST_ACTIVITY_KEY,
];

/// Why the re-login prompt was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum PromptReason {
    IdleTimeout,
    TokenExpired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum SessionState {
    LoggedOut,
    LoggedIn,
    /// The re-login prompt has been raised; activity is ignored until logout.
    IdleWarned(PromptReason),
}

/// Broadcast to hosts so they can navigate (e.g. back to a login screen).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    LoggedIn { user_id: Option<String> },
    PromptRelogin(PromptReason),
    LoggedOut { forced: bool },
}

/// The UI element currently able to show a modal prompt.
pub trait PromptSurface: Send + Sync {
    /// Show the re-login prompt. Returns false if the surface can no longer
    /// display anything, in which case the session is logged out instead.
    fn show_relogin_prompt(&self, reason: PromptReason) -> bool;
}

/// Persisted session fields.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    #[serde(skip_serializing)]
    pub token: String,
    pub user_id: Option<String>,
    pub user_type: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn is_expired(&self) -> bool {
        self.expires_at.map(|t| t <= Utc::now()).unwrap_or(true)
    }

    /// Get minutes remaining until expiry (for display)
    pub fn minutes_until_expiry(&self) -> i64 {
        self.expires_at
            .map(|t| (t - Utc::now()).num_minutes().max(0))
            .unwrap_or(0)
    }
}

/// In-memory watchdog state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutState {
    pub idle_deadline: Option<Instant>,
    pub dialog_shown: bool,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub token_ttl: Duration,
    pub idle_timeout: Duration,
    /// Persisted keys copied across a logout
    pub preserved_keys: Vec<String>,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            token_ttl: config.token_ttl(),
            idle_timeout: config.idle_timeout(),
            preserved_keys: config.preserved_keys.clone(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Expiry,
    Idle,
}

struct ArmedTimer {
    seq: u64,
    deadline: Instant,
    /// None when armed outside a tokio runtime; only `check_idle` can fire it.
    handle: Option<JoinHandle<()>>,
}

impl ArmedTimer {
    fn cancel(self) {
        if let Some(handle) = self.handle {
            handle.abort();
        }
    }
}

struct Inner {
    state: SessionState,
    /// Bumped whenever a session starts or ends.
    generation: u64,
    next_seq: u64,
    expiry: Option<ArmedTimer>,
    idle: Option<ArmedTimer>,
    surface: Option<Arc<dyn PromptSurface>>,
}

impl Inner {
    fn cancel_timers(&mut self) {
        if let Some(timer) = self.expiry.take() {
            timer.cancel();
        }
        if let Some(timer) = self.idle.take() {
            timer.cancel();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel_timers();
    }
}

struct Shared {
    store: Arc<dyn KeyValueStore>,
    settings: SessionSettings,
    inner: Mutex<Inner>,
    events: broadcast::Sender<SessionEvent>,
}

/// Owns the authenticated session. Cheap to clone; all clones share state.
///
/// Timers are tokio tasks, so `login`, `restore` and `touch_activity` should
/// run inside a runtime. Outside one, deadlines are still tracked and can be
/// enforced with [`SessionLifecycle::check_idle`].
#[derive(Clone)]
pub struct SessionLifecycle {
    shared: Arc<Shared>,
}

impl SessionLifecycle {
    pub fn new(store: Arc<dyn KeyValueStore>, settings: SessionSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                store,
                settings,
                inner: Mutex::new(Inner {
                    state: SessionState::LoggedOut,
                    generation: 0,
                    next_seq: 0,
                    expiry: None,
                    idle: None,
                    surface: None,
                }),
                events,
            }),
        }
    }

    pub fn from_config(store: Arc<dyn KeyValueStore>, config: &Config) -> Self {
        Self::new(store, SessionSettings::from_config(config))
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.shared.settings
    }

    // ===== Transitions =====

    /// Start a session with a freshly issued token.
    pub fn login(&self, token: &str) {
        let ttl = self.shared.settings.token_ttl;
        let now = Utc::now();
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or_else(|| now + chrono::Duration::days(365 * 30));
        let user_id = claims::extract_user_id(token);

        {
            let mut inner = self.lock();
            inner.cancel_timers();
            inner.state = SessionState::LoggedIn;
            inner.generation += 1;

            // Identity fields from a previous session must not leak into this one
            self.delete(USER_ID_KEY);
            self.delete(USER_TYPE_KEY);

            self.write(TOKEN_KEY, json!(token));
            self.write(TOKEN_EXPIRY_KEY, json!(expires_at.timestamp_millis()));
            self.write(LAST_ACTIVITY_KEY, json!(now.timestamp_millis()));
            match user_id {
                Some(ref id) => self.write(USER_ID_KEY, json!(id)),
                None => debug!("No userId in token payload"),
            }

            self.arm(&mut inner, TimerKind::Expiry, ttl);
            // A surface that is already showing counts as activity
            if inner.surface.is_some() {
                self.arm(&mut inner, TimerKind::Idle, self.shared.settings.idle_timeout);
            }
        }

        info!(user_id = ?user_id, ttl_secs = ttl.as_secs(), "Session started");
        self.emit(SessionEvent::LoggedIn { user_id });
    }

    /// Adopt a persisted session at start-up. Returns true if a live
    /// session was found; an expired one is logged out. Once a session is
    /// active this only reports whether it is still live.
    pub fn restore(&self) -> bool {
        if self.state() != SessionState::LoggedOut {
            debug!("Session already active, not restoring");
            return self.is_logged_in();
        }

        let store = &self.shared.store;
        let Some(_) = store.get_str(TOKEN_KEY) else {
            debug!("No persisted session");
            return false;
        };

        let remaining = store
            .get_i64(TOKEN_EXPIRY_KEY)
            .and_then(millis_to_datetime)
            .and_then(|expires_at| (expires_at - Utc::now()).to_std().ok())
            .filter(|d| !d.is_zero());

        let Some(remaining) = remaining else {
            info!("Persisted token already expired, logging out");
            self.logout_with(false);
            return false;
        };

        {
            let mut inner = self.lock();
            if inner.state != SessionState::LoggedOut {
                debug!("Session started while restoring, keeping it");
                return true;
            }
            inner.cancel_timers();
            inner.state = SessionState::LoggedIn;
            inner.generation += 1;
            self.arm(&mut inner, TimerKind::Expiry, remaining);
        }

        let user_id = store.get_str(USER_ID_KEY);
        info!(user_id = ?user_id, remaining_secs = remaining.as_secs(), "Restored persisted session");
        self.emit(SessionEvent::LoggedIn { user_id });
        true
    }

    /// Record user activity and re-arm the idle watchdog. Ignored while
    /// logged out or once the prompt has been raised.
    pub fn touch_activity(&self) {
        let mut inner = self.lock();
        match inner.state {
            SessionState::LoggedIn => {}
            SessionState::IdleWarned(_) => {
                debug!("Session timeout prompt is shown, not updating activity");
                return;
            }
            SessionState::LoggedOut => return,
        }

        self.write(LAST_ACTIVITY_KEY, json!(Utc::now().timestamp_millis()));
        self.arm(&mut inner, TimerKind::Idle, self.shared.settings.idle_timeout);
    }

    /// Raise the idle prompt. Returns true only for the call that actually
    /// raised it; repeats while already warned are dropped.
    pub fn idle_timeout_fired(&self) -> bool {
        self.raise_prompt(PromptReason::IdleTimeout)
    }

    /// Polling watchdog for hosts without a timer loop: fires the idle
    /// prompt if the idle deadline has passed.
    pub fn check_idle(&self) -> bool {
        let due = {
            let inner = self.lock();
            inner.state == SessionState::LoggedIn
                && inner
                    .idle
                    .as_ref()
                    .map(|t| t.deadline <= Instant::now())
                    .unwrap_or(false)
        };
        due && self.idle_timeout_fired()
    }

    /// End the session, keeping only the allow-listed persisted fields.
    pub fn logout(&self) {
        self.logout_with(false);
    }

    /// Confirm the token with the backend.
    ///
    /// Connectivity failures fail open (the session stays valid) unless the
    /// token's own `exp` claim has passed. Every other failure, and an
    /// explicit rejection, logs the session out. If another session started
    /// while the request was in flight, the result is reported but that
    /// session is left alone.
    pub async fn verify_remote<V: TokenVerifier>(&self, verifier: &V) -> TokenStatus {
        let generation = self.lock().generation;
        let Some(token) = self.shared.store.get_str(TOKEN_KEY) else {
            debug!("No token to verify");
            return TokenStatus::Invalid;
        };

        match verifier.verify(&token).await {
            Ok(true) => {
                debug!("Token accepted by backend");
                TokenStatus::Valid
            }
            Ok(false) => {
                warn!("Backend reports token invalid, logging out");
                self.end_session(true, Some(generation));
                TokenStatus::Invalid
            }
            Err(e) if e.is_connectivity() => {
                let expired = claims::decode_claims(&token)
                    .map(|c| c.is_expired())
                    .unwrap_or(false);
                if expired {
                    warn!(error = %e, "Backend unreachable and token exp has passed, logging out");
                    self.end_session(true, Some(generation));
                    TokenStatus::Invalid
                } else {
                    warn!(error = %e, "Backend unreachable, keeping session");
                    TokenStatus::Valid
                }
            }
            Err(e) => {
                if e.is_auth_rejection() {
                    warn!(error = %e, "Backend rejected token, logging out");
                } else {
                    warn!(error = %e, "Token verification failed, logging out");
                }
                self.end_session(true, Some(generation));
                TokenStatus::Invalid
            }
        }
    }

    /// Register the surface that receives prompts. Activating a surface
    /// counts as activity.
    pub fn set_active_surface(&self, surface: Option<Arc<dyn PromptSurface>>) {
        let activated = surface.is_some();
        self.lock().surface = surface;
        if activated {
            self.touch_activity();
        }
    }

    // ===== Accessors =====

    /// The bearer token, if present and not past its hard expiry.
    pub fn token(&self) -> Option<String> {
        self.session().filter(|s| !s.is_expired()).map(|s| s.token)
    }

    pub fn is_logged_in(&self) -> bool {
        self.token().is_some()
    }

    pub fn user_id(&self) -> Option<String> {
        self.shared.store.get_str(USER_ID_KEY)
    }

    pub fn user_type(&self) -> Option<String> {
        self.shared.store.get_str(USER_TYPE_KEY)
    }

    pub fn user_email(&self) -> Option<String> {
        self.shared
            .store
            .get_str(TOKEN_KEY)
            .and_then(|t| claims::extract_email(&t))
    }

    pub fn save_user_id(&self, user_id: &str) {
        self.write(USER_ID_KEY, json!(user_id));
        debug!(user_id, "UserId saved");
    }

    pub fn save_user_type(&self, user_type: &str) {
        self.write(USER_TYPE_KEY, json!(user_type));
        debug!(user_type, "User type saved");
    }

    pub fn session(&self) -> Option<Session> {
        let store = &self.shared.store;
        let token = store.get_str(TOKEN_KEY)?;
        Some(Session {
            token,
            user_id: store.get_str(USER_ID_KEY),
            user_type: store.get_str(USER_TYPE_KEY),
            expires_at: store.get_i64(TOKEN_EXPIRY_KEY).and_then(millis_to_datetime),
            last_activity_at: store.get_i64(LAST_ACTIVITY_KEY).and_then(millis_to_datetime),
        })
    }

    pub fn timeout_state(&self) -> TimeoutState {
        let inner = self.lock();
        TimeoutState {
            idle_deadline: inner.idle.as_ref().map(|t| t.deadline),
            dialog_shown: matches!(inner.state, SessionState::IdleWarned(_)),
        }
    }

    // ===== Internals =====

    fn arm(&self, inner: &mut Inner, kind: TimerKind, delay: Duration) {
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let now = Instant::now();
        let deadline = now
            .checked_add(delay)
            .unwrap_or_else(|| now + FAR_FUTURE);

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let weak: Weak<Shared> = Arc::downgrade(&self.shared);
                Some(runtime.spawn(async move {
                    tokio::time::sleep_until(deadline).await;
                    if let Some(shared) = weak.upgrade() {
                        SessionLifecycle { shared }.on_timer(kind, seq);
                    }
                }))
            }
            Err(_) => {
                warn!(?kind, "No async runtime, timer will only fire via check_idle");
                None
            }
        };

        let timer = ArmedTimer {
            seq,
            deadline,
            handle,
        };
        let previous = match kind {
            TimerKind::Expiry => inner.expiry.replace(timer),
            TimerKind::Idle => inner.idle.replace(timer),
        };
        if let Some(previous) = previous {
            previous.cancel();
        }
        debug!(?kind, seq, delay_secs = delay.as_secs(), "Timer armed");
    }

    fn on_timer(&self, kind: TimerKind, seq: u64) {
        let reason = match kind {
            TimerKind::Expiry => PromptReason::TokenExpired,
            TimerKind::Idle => PromptReason::IdleTimeout,
        };

        let begun = {
            let mut inner = self.lock();
            let slot = match kind {
                TimerKind::Expiry => &mut inner.expiry,
                TimerKind::Idle => &mut inner.idle,
            };
            if slot.as_ref().map(|t| t.seq) != Some(seq) {
                debug!(?kind, seq, "Stale timer fired, ignoring");
                return;
            }
            // This task is finishing; drop the handle without aborting it
            slot.take();
            Self::begin_prompt(&mut inner, reason)
        };

        if let Some(surface) = begun {
            self.finish_prompt(reason, surface);
        }
    }

    fn raise_prompt(&self, reason: PromptReason) -> bool {
        let begun = Self::begin_prompt(&mut self.lock(), reason);
        match begun {
            Some(surface) => {
                self.finish_prompt(reason, surface);
                true
            }
            None => false,
        }
    }

    /// Move to `IdleWarned` if the session is live. Returns the surface to
    /// prompt on, or None when the prompt must be dropped.
    fn begin_prompt(
        inner: &mut Inner,
        reason: PromptReason,
    ) -> Option<Option<Arc<dyn PromptSurface>>> {
        match inner.state {
            SessionState::LoggedIn => {}
            SessionState::IdleWarned(shown) => {
                debug!(?reason, ?shown, "Prompt already shown, not showing again");
                return None;
            }
            SessionState::LoggedOut => {
                debug!(?reason, "Not logged in, ignoring timeout");
                return None;
            }
        }
        inner.state = SessionState::IdleWarned(reason);
        // Whichever timer fired first owns the prompt
        inner.cancel_timers();
        Some(inner.surface.clone())
    }

    fn finish_prompt(&self, reason: PromptReason, surface: Option<Arc<dyn PromptSurface>>) {
        info!(?reason, "Session timeout reached, prompting for re-login");
        self.emit(SessionEvent::PromptRelogin(reason));

        let shown = surface
            .map(|s| s.show_relogin_prompt(reason))
            .unwrap_or(false);
        if !shown {
            warn!(?reason, "No surface could show the prompt, logging out");
            self.logout_with(true);
        }
    }

    fn logout_with(&self, forced: bool) {
        self.end_session(forced, None);
    }

    /// Log out, but only if the session is still the one identified by
    /// `expected` (when given). Returns whether the logout happened.
    fn end_session(&self, forced: bool, expected: Option<u64>) -> bool {
        {
            let mut inner = self.lock();
            if let Some(generation) = expected {
                if inner.generation != generation {
                    debug!(generation, current = inner.generation, "Session changed during verification, not logging out");
                    return false;
                }
            }
            inner.cancel_timers();
            inner.state = SessionState::LoggedOut;
            inner.generation += 1;

            let store = &self.shared.store;
            let preserved: Vec<(String, Value)> = self
                .shared
                .settings
                .preserved_keys
                .iter()
                .filter_map(|key| store.get(key).map(|v| (key.clone(), v)))
                .collect();

            if let Err(e) = store.clear() {
                warn!(error = %e, "Failed to clear session storage, removing session keys");
                for key in SESSION_KEYS {
                    self.delete(key);
                }
            }
            for (key, value) in preserved {
                self.write(&key, value);
            }
        }

        info!(forced, "Logged out");
        self.emit(SessionEvent::LoggedOut { forced });
        true
    }

    fn write(&self, key: &str, value: Value) {
        if let Err(e) = self.shared.store.set(key, value) {
            warn!(key, error = %e, "Failed to persist session field");
        }
    }

    fn delete(&self, key: &str) {
        if let Err(e) = self.shared.store.remove(key) {
            warn!(key, error = %e, "Failed to remove session field");
        }
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.shared.events.send(event);
    }
}

impl std::fmt::Debug for SessionLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLifecycle")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn millis_to_datetime(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}
