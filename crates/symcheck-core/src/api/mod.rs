//! REST API client module for the symptom-checker backend.
//!
//! - `Transport`: sends one request, no policy
//! - `RequestPipeline`: bearer attachment and refresh-and-retry on 401/422
//! - `ApiClient`: typed calls for the service endpoints
//!
//! The backend uses JWT bearer authentication with short-lived access tokens
//! and rotating refresh tokens.

pub mod client;
pub mod error;
pub mod pipeline;
pub mod transport;

pub use client::ApiClient;
pub use error::ApiError;
pub use pipeline::RequestPipeline;
pub use transport::{ApiRequest, ApiResponse, ReqwestTransport, Transport};
