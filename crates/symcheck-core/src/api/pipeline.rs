//! Authenticated request pipeline.
//!
//! Every backend call goes through `RequestPipeline::send`. Before sending, the
//! current access token is attached. After receiving, an authentication failure
//! (401, and 422 unless disabled) on a request that has not been retried yet
//! gets one refresh-and-replay; a second failure is returned as an error so a
//! request can never loop.

use std::sync::Arc;

use reqwest::StatusCode;
use tracing::{debug, instrument, warn};

use crate::auth::{CredentialStore, RefreshCoordinator};

use super::{ApiError, ApiRequest, ApiResponse, Transport};

pub struct RequestPipeline {
    transport: Arc<dyn Transport>,
    store: Arc<CredentialStore>,
    coordinator: Arc<RefreshCoordinator>,
    treat_422_as_auth_failure: bool,
}

impl RequestPipeline {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<CredentialStore>,
        coordinator: Arc<RefreshCoordinator>,
    ) -> Self {
        Self {
            transport,
            store,
            coordinator,
            treat_422_as_auth_failure: true,
        }
    }

    /// Some backends answer an expired JWT with 422; on by default.
    pub fn treat_422_as_auth_failure(mut self, enabled: bool) -> Self {
        self.treat_422_as_auth_failure = enabled;
        self
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.coordinator
    }

    fn is_auth_failure(&self, status: StatusCode) -> bool {
        status == StatusCode::UNAUTHORIZED
            || (self.treat_422_as_auth_failure && status == StatusCode::UNPROCESSABLE_ENTITY)
    }

    /// Send a request, refreshing and replaying it once on an auth failure.
    ///
    /// Non-auth statuses come back as `Ok` responses; deciding what a 404 or a
    /// 500 means is up to the caller.
    #[instrument(skip(self, request), fields(method = %request.method, path = %request.path))]
    pub async fn send(&self, mut request: ApiRequest) -> Result<ApiResponse, ApiError> {
        if request.anonymous {
            return self.transport.execute(&request).await;
        }

        if let Some(token) = self.store.access_token() {
            request.set_bearer(&token)?;
        }

        loop {
            let response = self.transport.execute(&request).await?;
            if !self.is_auth_failure(response.status) {
                return Ok(response);
            }

            if request.retried {
                warn!(status = response.status.as_u16(), "Authentication failed after refresh");
                return Err(ApiError::AuthRejected {
                    status: response.status.as_u16(),
                    message: ApiError::message_from_body(&response.body),
                });
            }

            debug!(status = response.status.as_u16(), "Authentication failed, refreshing");
            request.retried = true;
            let sent_with = request.bearer_token().map(str::to_owned);
            let token = self.fresh_token(sent_with.as_deref()).await?;
            request.set_bearer(&token)?;
        }
    }

    /// A token to replay with. If the stored token already moved on from the one
    /// this request carried, another cycle refreshed it and no call is needed.
    async fn fresh_token(&self, sent_with: Option<&str>) -> Result<String, ApiError> {
        if let Some(current) = self.store.access_token() {
            if sent_with != Some(current.as_str()) {
                debug!("Token changed while request was in flight, replaying");
                return Ok(current);
            }
        }
        Ok(self.coordinator.acquire().await?)
    }
}
