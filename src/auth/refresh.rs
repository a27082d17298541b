//! Singleflight access-credential refresh.
//!
//! All mutable coordination state (`is_refreshing`, the waiter queue and the
//! failure counter) lives inside [`RefreshCoordinator`] behind one lock and is
//! only touched from its methods. The lock is never held across an await.

use std::collections::VecDeque;
use std::error::Error;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::auth::credentials::{CredentialError, CredentialKind, CredentialStore};
use crate::core::notice::Notice;
use crate::utils::url::construct_api_url;

pub const REFRESH_ENDPOINT: &str = "auth/refresh/";

/// Error handed to every request that needed a refreshed credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The refresh failed; credentials were cleared and a logout dispatched.
    SessionExpired,
    /// Too many refreshes failed in the current window; logout was forced
    /// without another refresh attempt.
    RetryLimitReached,
    /// The refresh this request queued behind did not finish in time.
    RefreshTimeout,
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::SessionExpired => write!(f, "Session expired. Please sign in again."),
            AuthError::RetryLimitReached => {
                write!(f, "Authentication failed repeatedly. Please sign in again.")
            }
            AuthError::RefreshTimeout => write!(f, "Timed out waiting for credential refresh"),
        }
    }
}

impl Error for AuthError {}

/// Why a single refresh call failed. Only logged; callers see
/// [`AuthError::SessionExpired`].
#[derive(Debug)]
pub enum RefreshError {
    MissingRefreshToken,
    Credentials(CredentialError),
    Http(reqwest::Error),
    Status(reqwest::StatusCode),
}

impl fmt::Display for RefreshError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefreshError::MissingRefreshToken => write!(f, "No refresh token available"),
            RefreshError::Credentials(err) => write!(f, "{err}"),
            RefreshError::Http(err) => write!(f, "Refresh request failed: {err}"),
            RefreshError::Status(status) => write!(f, "Refresh rejected with status {status}"),
        }
    }
}

impl Error for RefreshError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            RefreshError::Credentials(err) => Some(err),
            RefreshError::Http(err) => Some(err),
            RefreshError::MissingRefreshToken | RefreshError::Status(_) => None,
        }
    }
}

impl From<CredentialError> for RefreshError {
    fn from(err: CredentialError) -> Self {
        RefreshError::Credentials(err)
    }
}

impl From<reqwest::Error> for RefreshError {
    fn from(err: reqwest::Error) -> Self {
        RefreshError::Http(err)
    }
}

/// Exchanges a refresh credential for a new access credential.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<String, RefreshError>;
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh: &'a str,
}

#[derive(Deserialize)]
struct RefreshResponse {
    access: String,
}

/// Calls `POST {base}/auth/refresh/` directly, outside the dispatcher, so
/// the refresh can never recurse into refresh handling.
pub struct HttpTokenRefresher {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpTokenRefresher {
    pub fn new(client: reqwest::Client, base_url: &str, timeout: Duration) -> Self {
        Self {
            client,
            url: construct_api_url(base_url, REFRESH_ENDPOINT),
            timeout,
        }
    }
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(&self, refresh_token: &str) -> Result<String, RefreshError> {
        let response = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&RefreshRequest {
                refresh: refresh_token,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(RefreshError::Status(response.status()));
        }
        Ok(response.json::<RefreshResponse>().await?.access)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshPolicy {
    /// Refresh attempts allowed within one window before logout is forced.
    pub max_failed_requests: u32,
    /// How long a queued request waits for an in-flight refresh.
    pub waiter_timeout: Duration,
    /// Length of the window after which the failure counter starts over.
    pub failure_reset_interval: Duration,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            max_failed_requests: 3,
            waiter_timeout: Duration::from_secs(10),
            failure_reset_interval: Duration::from_secs(60),
        }
    }
}

type Waiter = oneshot::Sender<Result<String, AuthError>>;

#[derive(Debug)]
struct RefreshState {
    is_refreshing: bool,
    waiters: VecDeque<Waiter>,
    failed_request_count: u32,
    window_started: Instant,
}

impl RefreshState {
    fn roll_window(&mut self, now: Instant, interval: Duration) {
        if now.duration_since(self.window_started) >= interval {
            if self.failed_request_count > 0 {
                debug!(
                    forgiven = self.failed_request_count,
                    "auth failure window elapsed; counter reset"
                );
            }
            self.failed_request_count = 0;
            self.window_started = now;
        }
    }
}

enum Ticket {
    Lead(oneshot::Receiver<Result<String, AuthError>>),
    Wait(oneshot::Receiver<Result<String, AuthError>>),
    Exhausted,
}

pub struct RefreshCoordinator {
    state: Mutex<RefreshState>,
    refresher: Box<dyn TokenRefresher>,
    credentials: CredentialStore,
    policy: RefreshPolicy,
    notices: mpsc::UnboundedSender<Notice>,
}

impl RefreshCoordinator {
    pub fn new(
        refresher: Box<dyn TokenRefresher>,
        credentials: CredentialStore,
        policy: RefreshPolicy,
        notices: mpsc::UnboundedSender<Notice>,
    ) -> Self {
        Self {
            state: Mutex::new(RefreshState {
                is_refreshing: false,
                waiters: VecDeque::new(),
                failed_request_count: 0,
                window_started: Instant::now(),
            }),
            refresher,
            credentials,
            policy,
            notices,
        }
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    pub fn is_refreshing(&self) -> bool {
        self.lock().is_refreshing
    }

    pub fn failed_request_count(&self) -> u32 {
        let mut state = self.lock();
        state.roll_window(Instant::now(), self.policy.failure_reset_interval);
        state.failed_request_count
    }

    pub fn pending_waiters(&self) -> usize {
        self.lock().waiters.len()
    }

    /// Any successful response proves the current credential works.
    pub fn record_success(&self) {
        self.lock().failed_request_count = 0;
    }

    /// Handles a 401 on a request that has not been retried yet and returns
    /// the access credential to replay it with.
    ///
    /// The first caller starts the refresh; callers arriving while it is in
    /// flight queue behind it and get the same outcome.
    pub async fn handle_unauthorized(self: &Arc<Self>) -> Result<String, AuthError> {
        let ticket = {
            let mut state = self.lock();
            state.roll_window(Instant::now(), self.policy.failure_reset_interval);
            if state.failed_request_count >= self.policy.max_failed_requests {
                Ticket::Exhausted
            } else if state.is_refreshing {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                Ticket::Wait(rx)
            } else {
                let (tx, rx) = oneshot::channel();
                state.is_refreshing = true;
                state.failed_request_count += 1;
                state.waiters.push_back(tx);
                Ticket::Lead(rx)
            }
        };

        let rx = match ticket {
            Ticket::Exhausted => {
                warn!(
                    max = self.policy.max_failed_requests,
                    "auth retry ceiling reached; forcing logout"
                );
                self.logout("too many failed authentication attempts");
                return Err(AuthError::RetryLimitReached);
            }
            Ticket::Lead(rx) => {
                // Detached so a caller that goes away cannot strand the waiters.
                let coordinator = Arc::clone(self);
                tokio::spawn(async move { coordinator.run_refresh().await });
                rx
            }
            Ticket::Wait(rx) => rx,
        };

        // The leader is bounded like any waiter; the refresh itself keeps running.
        match tokio::time::timeout(self.policy.waiter_timeout, rx).await {
            Ok(outcome) => outcome.unwrap_or(Err(AuthError::SessionExpired)),
            Err(_) => {
                debug!("gave up waiting for in-flight refresh");
                Err(AuthError::RefreshTimeout)
            }
        }
    }

    async fn run_refresh(&self) {
        info!("refreshing access credential");
        let outcome = self.refresh_once().await;

        let waiters = {
            let mut state = self.lock();
            state.is_refreshing = false;
            if outcome.is_ok() {
                state.failed_request_count = 0;
            }
            std::mem::take(&mut state.waiters)
        };

        let result = match outcome {
            Ok(access) => {
                debug!(waiters = waiters.len(), "refresh succeeded; resuming waiters");
                Ok(access)
            }
            Err(err) => {
                warn!(error = %err, waiters = waiters.len(), "refresh failed; signing out");
                self.logout("session expired");
                Err(AuthError::SessionExpired)
            }
        };
        for waiter in waiters {
            // A waiter that already timed out has dropped its receiver.
            let _ = waiter.send(result.clone());
        }
    }

    async fn refresh_once(&self) -> Result<String, RefreshError> {
        let refresh_token = self
            .credentials
            .get(CredentialKind::Refresh)?
            .ok_or(RefreshError::MissingRefreshToken)?;
        let access = self.refresher.refresh(&refresh_token).await?;
        self.credentials.set(CredentialKind::Access, &access)?;
        Ok(access)
    }

    fn logout(&self, reason: &str) {
        if let Err(err) = self.credentials.clear() {
            warn!(error = %err, "failed to clear stored credentials");
        }
        let _ = self.notices.send(Notice::LoggedOut {
            reason: reason.to_string(),
        });
    }

    fn lock(&self) -> MutexGuard<'_, RefreshState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
