//! symcheck core - authenticated client for the symptom-checker service.
//!
//! The interesting part is the request pipeline: every call goes through
//! [`api::RequestPipeline`], which attaches the bearer token, and on an
//! authentication failure asks the [`auth::RefreshCoordinator`] for a new one.
//! The coordinator makes sure only one refresh call is ever in flight and hands
//! its outcome to everyone who was waiting. [`auth::SessionManager`] ties it
//! together with login, logout and session bootstrap.

pub mod api;
pub mod auth;
pub mod config;
pub mod models;

pub use api::{ApiClient, ApiError, ApiRequest, ApiResponse, RequestPipeline, ReqwestTransport, Transport};
pub use auth::{
    AuthEvent, AuthState, Credential, CredentialStore, LogoutReason, RefreshCoordinator, RefreshError,
    Session, SessionManager,
};
pub use config::Config;
