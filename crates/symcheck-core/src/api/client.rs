//! API client for the symptom-checker REST API.
//!
//! `ApiClient` is a thin typed layer over the `RequestPipeline`: it builds the
//! request, lets the pipeline deal with credentials, and turns non-2xx
//! responses into `ApiError`s.

use std::sync::Arc;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

use crate::models::{AuthResponse, Prediction, PredictionRecord, UserProfile};

use super::{ApiError, ApiRequest, ApiResponse, RequestPipeline};

// ============================================================================
// Endpoints
// ============================================================================

const USER_PATH: &str = "/user";
const SYMPTOMS_PATH: &str = "/symptoms";
const HISTORY_PATH: &str = "/history";
const PREDICT_PATH: &str = "/predict";

#[derive(Debug, Deserialize)]
struct UserEnvelope {
    user: UserProfile,
}

#[derive(Debug, Deserialize)]
struct SymptomsEnvelope {
    symptoms: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct HistoryEnvelope {
    history: Vec<PredictionRecord>,
}

#[derive(Debug, Serialize)]
struct PredictBody<'a> {
    symptoms: &'a [String],
}

/// Typed access to the backend.
/// Clone is cheap - the pipeline is shared.
#[derive(Clone)]
pub struct ApiClient {
    pipeline: Arc<RequestPipeline>,
}

impl ApiClient {
    pub fn new(pipeline: Arc<RequestPipeline>) -> Self {
        Self { pipeline }
    }

    pub fn pipeline(&self) -> &Arc<RequestPipeline> {
        &self.pipeline
    }

    /// Send through the pipeline and fail on any non-2xx status.
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        self.pipeline.send(request).await?.error_for_status()
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send(ApiRequest::get(path)).await?.json()
    }

    pub async fn post_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.send(ApiRequest::post(path).json(body)?).await?.json()
    }

    /// Unauthenticated call to one of the session-creating endpoints.
    pub async fn authenticate<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<AuthResponse, ApiError> {
        let request = ApiRequest::post(path).json(body)?.anonymous();
        let auth: AuthResponse = self.send(request).await?.json()?;
        if auth.access_token.is_empty() {
            return Err(ApiError::InvalidResponse("empty access_token".to_string()));
        }
        Ok(auth)
    }

    // ===== Data Fetching Methods =====

    /// Fetch the signed-in user's profile
    pub async fn fetch_user(&self) -> Result<UserProfile, ApiError> {
        let response = self.send(ApiRequest::get(USER_PATH)).await?;

        if let Ok(envelope) = response.json::<UserEnvelope>() {
            return Ok(envelope.user);
        }
        // Some deployments return the profile unwrapped
        debug!("User response not wrapped, parsing as bare profile");
        response.json()
    }

    /// Fetch the symptom vocabulary the model was trained on
    pub async fn fetch_symptoms(&self) -> Result<Vec<String>, ApiError> {
        let response = self.send(ApiRequest::get(SYMPTOMS_PATH)).await?;

        if let Ok(list) = response.json::<Vec<String>>() {
            return Ok(list);
        }
        match response.json::<SymptomsEnvelope>() {
            Ok(envelope) => Ok(envelope.symptoms),
            Err(e) => {
                warn!("Failed to parse symptoms response");
                Err(e)
            }
        }
    }

    /// Fetch the user's past predictions
    pub async fn fetch_history(&self) -> Result<Vec<PredictionRecord>, ApiError> {
        let response = self.send(ApiRequest::get(HISTORY_PATH)).await?;

        if let Ok(list) = response.json::<Vec<PredictionRecord>>() {
            debug!(count = list.len(), "Parsed history as direct array");
            return Ok(list);
        }
        match response.json::<HistoryEnvelope>() {
            Ok(envelope) => Ok(envelope.history),
            Err(e) => {
                warn!("Failed to parse history response");
                Err(e)
            }
        }
    }

    /// Run a symptom check
    pub async fn predict(&self, symptoms: &[String]) -> Result<Prediction, ApiError> {
        if symptoms.is_empty() {
            return Err(ApiError::InvalidRequest("at least one symptom is required".to_string()));
        }
        self.post_json(PREDICT_PATH, &PredictBody { symptoms }).await
    }
}
