//! Bearer-token lifecycle and connection status tracking.
//!
//! The token is attached to every outgoing call. Once the refresh deadline has
//! passed, the next call kicks off a background refresh; the call itself never
//! waits for it. A failed refresh keeps the old token: if it really expired the
//! server will reject a later call, which flips the status to
//! `Unauthenticated`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{GraphError, Result};
use crate::transport::{CallMetadata, StatusCode, TransportStatus};

/// Connectivity as last observed by any call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// Last call reached the server.
    Ok,
    /// Last call could not reach the server.
    Disconnected,
    /// The server rejected the token.
    Unauthenticated,
}

#[derive(Debug, Deserialize)]
struct Claims {
    iat: Option<u64>,
    exp: Option<u64>,
    sub: Option<String>,
    login: Option<String>,
}

/// Bearer token plus the timestamps decoded from it. Timestamps are unix seconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthInformation {
    /// Raw token as sent in the `authorization` header.
    pub jwt: String,
    /// Issue time.
    pub issued_at: u64,
    /// Expiry time.
    pub expires_at: u64,
    /// Login claim, used to derive the client root name.
    pub login: Option<String>,
}

impl AuthInformation {
    /// Decodes the claims segment of a JWT. The signature is not checked.
    pub fn from_jwt(jwt: &str) -> Result<Self> {
        let mut segments = jwt.split('.');
        let payload = match (segments.next(), segments.next(), segments.next(), segments.next()) {
            (Some(_), Some(payload), Some(_), None) => payload,
            _ => return Err(GraphError::InvalidToken("expected three segments".into())),
        };
        let raw = URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .map_err(|e| GraphError::InvalidToken(format!("payload is not base64url: {e}")))?;
        let claims: Claims = serde_json::from_slice(&raw)
            .map_err(|e| GraphError::InvalidToken(format!("bad claims: {e}")))?;
        let issued_at = claims
            .iat
            .ok_or_else(|| GraphError::InvalidToken("missing iat".into()))?;
        let expires_at = claims
            .exp
            .ok_or_else(|| GraphError::InvalidToken("missing exp".into()))?;
        if expires_at < issued_at {
            return Err(GraphError::InvalidToken("exp precedes iat".into()));
        }
        Ok(Self {
            jwt: jwt.to_string(),
            issued_at,
            expires_at,
            login: claims.login.or(claims.sub),
        })
    }

    /// When to refresh, in unix milliseconds: halfway through the token's
    /// lifetime, but no later than `max_refresh` after issue.
    pub fn refresh_at_ms(&self, max_refresh: Duration) -> u64 {
        let midpoint = self.issued_at + (self.expires_at - self.issued_at) / 2;
        let capped = self.issued_at.saturating_add(max_refresh.as_secs());
        midpoint.min(capped).saturating_mul(1000)
    }

    /// True once `now_ms` is past the expiry.
    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at.saturating_mul(1000)
    }
}

/// Obtains a fresh token for the current one.
#[async_trait]
pub trait TokenRefresher: Send + Sync + 'static {
    /// Returns a new token valid for about `ttl`.
    async fn refresh(&self, current: &str, ttl: Duration) -> Result<String>;
}

/// Receives the outcome of every transport call.
pub trait StatusObserver: Send + Sync {
    /// The call reached the server.
    fn observe_ok(&self);
    /// The call failed with `status`.
    fn observe_failure(&self, status: &TransportStatus);
}

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Optional hooks fired by an [`AuthSession`].
#[derive(Clone, Default)]
pub struct AuthCallbacks {
    /// Called after a successful token refresh.
    pub on_update: Option<Callback<AuthInformation>>,
    /// Called when a refresh fails.
    pub on_update_error: Option<Callback<GraphError>>,
    /// Called when a call fails with an authentication status.
    pub on_auth_error: Option<Callback<TransportStatus>>,
    /// Called when the [`ConnectionStatus`] changes.
    pub on_status_change: Option<Callback<ConnectionStatus>>,
}

struct TokenState {
    info: Option<AuthInformation>,
    refresh_at_ms: u64,
}

/// Holds the current token and refreshes it in the background before it
/// expires. Also tracks [`ConnectionStatus`] for every call it authorizes.
pub struct AuthSession {
    token: Mutex<TokenState>,
    refreshing: AtomicBool,
    refresher: Option<Arc<dyn TokenRefresher>>,
    token_ttl: Duration,
    max_refresh: Duration,
    callbacks: AuthCallbacks,
    status: watch::Sender<ConnectionStatus>,
    /// Fixed clock for tests; 0 means wall-clock time.
    clock_ms: AtomicU64,
}

impl AuthSession {
    /// Creates a session. A refresher is only used when a token is present.
    pub fn new(
        info: Option<AuthInformation>,
        refresher: Option<Arc<dyn TokenRefresher>>,
        token_ttl: Duration,
        max_refresh: Duration,
        callbacks: AuthCallbacks,
    ) -> Self {
        let refresh_at_ms = info
            .as_ref()
            .map(|i| i.refresh_at_ms(max_refresh))
            .unwrap_or(u64::MAX);
        let (status, _) = watch::channel(ConnectionStatus::Ok);
        Self {
            token: Mutex::new(TokenState {
                info,
                refresh_at_ms,
            }),
            refreshing: AtomicBool::new(false),
            refresher,
            token_ttl,
            max_refresh,
            callbacks,
            status,
            clock_ms: AtomicU64::new(0),
        }
    }

    /// Session without a token. Calls go out unauthenticated.
    pub fn anonymous() -> Self {
        Self::new(
            None,
            None,
            Duration::from_secs(24 * 3600),
            Duration::from_secs(3600),
            AuthCallbacks::default(),
        )
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TokenState> {
        self.token.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn now_ms(&self) -> u64 {
        match self.clock_ms.load(Ordering::Relaxed) {
            0 => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
            fixed => fixed,
        }
    }

    /// Pins the clock used for refresh decisions. Test hook.
    pub fn set_clock_ms(&self, ms: u64) {
        self.clock_ms.store(ms, Ordering::Relaxed);
    }

    /// Current token, if any.
    pub fn info(&self) -> Option<AuthInformation> {
        self.lock().info.clone()
    }

    /// When the next refresh is due, in unix milliseconds.
    pub fn refresh_at_ms(&self) -> Option<u64> {
        let state = self.lock();
        state.info.as_ref().map(|_| state.refresh_at_ms)
    }

    /// Anonymous sessions are authenticated too; no login step is pending.
    pub fn is_anonymous(&self) -> bool {
        self.lock().info.is_none()
    }

    /// True while a refresh is in flight.
    pub fn is_refreshing(&self) -> bool {
        self.refreshing.load(Ordering::SeqCst)
    }

    /// Metadata for an outgoing call. Starts a background refresh when due.
    pub fn call_metadata(self: &Arc<Self>) -> CallMetadata {
        let (token, due) = {
            let state = self.lock();
            match &state.info {
                Some(info) => (
                    Some(info.jwt.clone()),
                    self.now_ms() >= state.refresh_at_ms,
                ),
                None => (None, false),
            }
        };
        match token {
            Some(token) => {
                if due {
                    self.spawn_refresh(token.clone());
                }
                CallMetadata::with_bearer(&token)
            }
            None => CallMetadata::anonymous(),
        }
    }

    fn spawn_refresh(self: &Arc<Self>, current: String) {
        let Some(refresher) = self.refresher.clone() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        debug!("starting background token refresh");
        let this = self.clone();
        runtime.spawn(async move {
            let outcome = refresher
                .refresh(&current, this.token_ttl)
                .await
                .and_then(|jwt| AuthInformation::from_jwt(&jwt));
            this.finish_refresh(outcome);
        });
    }

    fn finish_refresh(&self, outcome: Result<AuthInformation>) {
        match outcome {
            Ok(info) => {
                {
                    let mut state = self.lock();
                    state.refresh_at_ms = info.refresh_at_ms(self.max_refresh);
                    state.info = Some(info.clone());
                }
                info!(expires_at = info.expires_at, "auth token refreshed");
                if let Some(cb) = &self.callbacks.on_update {
                    cb(&info);
                }
            }
            Err(e) => {
                warn!(error = %e, "auth token refresh failed, keeping current token");
                if let Some(cb) = &self.callbacks.on_update_error {
                    cb(&e);
                }
            }
        }
        self.refreshing.store(false, Ordering::SeqCst);
    }

    /// Last observed connection status.
    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Receiver that observes every status change.
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// Records a status; listeners hear only about actual changes.
    pub fn set_status(&self, next: ConnectionStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            info!(status = ?next, "connection status changed");
            if let Some(cb) = &self.callbacks.on_status_change {
                cb(&next);
            }
        }
    }
}

impl StatusObserver for AuthSession {
    fn observe_ok(&self) {
        self.set_status(ConnectionStatus::Ok);
    }

    fn observe_failure(&self, status: &TransportStatus) {
        match status.code {
            StatusCode::Unauthenticated => {
                self.set_status(ConnectionStatus::Unauthenticated);
                if let Some(cb) = &self.callbacks.on_auth_error {
                    cb(status);
                }
            }
            StatusCode::Unavailable => self.set_status(ConnectionStatus::Disconnected),
            _ => {}
        }
    }
}

impl std::fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSession")
            .field("anonymous", &self.is_anonymous())
            .field("refreshing", &self.is_refreshing())
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
pub(crate) fn make_jwt(iat: u64, exp: u64, login: &str) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
    let claims = URL_SAFE_NO_PAD.encode(
        serde_json::json!({ "iat": iat, "exp": exp, "login": login })
            .to_string()
            .as_bytes(),
    );
    format!("{header}.{claims}.sig")
}
