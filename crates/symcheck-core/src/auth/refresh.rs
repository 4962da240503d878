//! Single-flight access token refresh.
//!
//! `RefreshCoordinator::acquire` is the only way a refresh call is made. The
//! first caller to arrive while idle drives the refresh; everyone arriving while
//! it is in flight is queued on a oneshot channel and released, in arrival
//! order, with the same outcome once it settles.
//!
//! ```text
//! Idle --acquire--> Refreshing --settle--> Idle
//!                     |  ^
//!                     +--+ acquire (enqueue)
//! ```

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::api::{ApiError, ApiRequest, Transport};

use super::CredentialStore;

/// Refresh endpoint; authenticated with the refresh token
const REFRESH_PATH: &str = "/refresh";

/// Default bound on the refresh call
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(15);

/// Why a refresh cycle did not produce a new access token.
///
/// Cloned to every queued caller of the cycle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    #[error("No refresh token available")]
    NoRefreshToken,

    #[error("Refresh token is not a valid header value")]
    InvalidToken,

    #[error("Refresh rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Refresh request failed: {0}")]
    Network(String),

    #[error("Refresh timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid refresh response: {0}")]
    InvalidResponse(String),

    #[error("Session ended while refreshing")]
    SessionEnded,

    #[error("Refresh was abandoned before it completed")]
    Abandoned,
}

/// Told about the outcome of each refresh cycle that commits.
pub trait RefreshObserver: Send + Sync {
    fn refreshed(&self) {}

    /// Called once per failed cycle, after the store has been cleared and
    /// before any queued caller is released.
    fn session_expired(&self, error: &RefreshError);
}

#[derive(Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

type Waiter = oneshot::Sender<Result<String, RefreshError>>;

enum RefreshState {
    Idle,
    Refreshing { waiters: Vec<Waiter> },
}

pub struct RefreshCoordinator {
    store: Arc<CredentialStore>,
    transport: Arc<dyn Transport>,
    timeout: Duration,
    state: Mutex<RefreshState>,
    observer: Option<Arc<dyn RefreshObserver>>,
}

impl RefreshCoordinator {
    pub fn new(store: Arc<CredentialStore>, transport: Arc<dyn Transport>, refresh_timeout: Duration) -> Self {
        Self {
            store,
            transport,
            timeout: refresh_timeout,
            state: Mutex::new(RefreshState::Idle),
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn RefreshObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn is_refreshing(&self) -> bool {
        matches!(*self.state.lock(), RefreshState::Refreshing { .. })
    }

    /// Callers queued behind the in-flight refresh
    pub fn pending_waiters(&self) -> usize {
        match &*self.state.lock() {
            RefreshState::Refreshing { waiters } => waiters.len(),
            RefreshState::Idle => 0,
        }
    }

    /// Get a fresh access token, refreshing at most once across concurrent callers.
    pub async fn acquire(&self) -> Result<String, RefreshError> {
        let queued = {
            let mut state = self.state.lock();
            match &mut *state {
                RefreshState::Refreshing { waiters } => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    debug!(position = waiters.len(), "Refresh in flight, queued");
                    Some(rx)
                }
                RefreshState::Idle => {
                    *state = RefreshState::Refreshing { waiters: Vec::new() };
                    None
                }
            }
        };

        if let Some(rx) = queued {
            return rx.await.unwrap_or(Err(RefreshError::Abandoned));
        }

        let guard = CycleGuard {
            coordinator: self,
            armed: true,
        };
        let outcome = self.run_cycle().await;
        guard.settle(&outcome);
        outcome
    }

    async fn run_cycle(&self) -> Result<String, RefreshError> {
        let (credential, generation) = self.store.credential_with_generation();
        debug!(generation, "Starting token refresh");

        let result = match credential.and_then(|c| c.refresh_token) {
            Some(refresh_token) => self.request_new_tokens(&refresh_token).await,
            None => Err(RefreshError::NoRefreshToken),
        };

        match result {
            Ok(tokens) => {
                if self.store.update_tokens(
                    generation,
                    &tokens.access_token,
                    tokens.refresh_token.as_deref(),
                ) {
                    info!(rotated = tokens.refresh_token.is_some(), "Access token refreshed");
                    if let Some(ref observer) = self.observer {
                        observer.refreshed();
                    }
                    Ok(tokens.access_token)
                } else {
                    self.current_token_or(RefreshError::SessionEnded)
                }
            }
            Err(error) => {
                if self.store.clear_if(generation) {
                    warn!(error = %error, "Token refresh failed, session cleared");
                    if let Some(ref observer) = self.observer {
                        observer.session_expired(&error);
                    }
                    Err(error)
                } else {
                    self.current_token_or(error)
                }
            }
        }
    }

    /// The credential changed under a running cycle (logout or a new login).
    /// Hand out whatever is current rather than the stale cycle's result.
    fn current_token_or(&self, error: RefreshError) -> Result<String, RefreshError> {
        match self.store.access_token() {
            Some(token) => {
                debug!("Credential replaced during refresh, using current token");
                Ok(token)
            }
            None => {
                debug!(error = %error, "Session ended during refresh");
                Err(error)
            }
        }
    }

    async fn request_new_tokens(&self, refresh_token: &str) -> Result<RefreshResponse, RefreshError> {
        let mut request = ApiRequest::post(REFRESH_PATH).anonymous();
        request
            .set_bearer(refresh_token)
            .map_err(|_| RefreshError::InvalidToken)?;

        let response = match timeout(self.timeout, self.transport.execute(&request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(RefreshError::Network(e.to_string())),
            Err(_) => return Err(RefreshError::Timeout(self.timeout)),
        };

        if !response.is_success() {
            return Err(RefreshError::Rejected {
                status: response.status.as_u16(),
                message: ApiError::message_from_body(&response.body),
            });
        }

        let tokens: RefreshResponse = response
            .json()
            .map_err(|e| RefreshError::InvalidResponse(e.to_string()))?;
        if tokens.access_token.is_empty() {
            return Err(RefreshError::InvalidResponse("empty access_token".to_string()));
        }
        Ok(tokens)
    }

    /// Back to idle, handing `outcome` to every queued caller in FIFO order.
    fn release(&self, outcome: &Result<String, RefreshError>) {
        let waiters = match std::mem::replace(&mut *self.state.lock(), RefreshState::Idle) {
            RefreshState::Refreshing { waiters } => waiters,
            RefreshState::Idle => Vec::new(),
        };
        if !waiters.is_empty() {
            debug!(count = waiters.len(), success = outcome.is_ok(), "Releasing queued callers");
        }
        for waiter in waiters {
            // Receiver gone means that caller was cancelled; nothing to do.
            let _ = waiter.send(outcome.clone());
        }
    }
}

/// Releases queued callers even if the driving future is dropped mid-refresh.
struct CycleGuard<'a> {
    coordinator: &'a RefreshCoordinator,
    armed: bool,
}

impl CycleGuard<'_> {
    fn settle(mut self, outcome: &Result<String, RefreshError>) {
        self.armed = false;
        self.coordinator.release(outcome);
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!("Token refresh abandoned before completion");
            self.coordinator.release(&Err(RefreshError::Abandoned));
        }
    }
}
