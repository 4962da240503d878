//! Data models for symptom-checker entities.
//!
//! - `UserProfile`: the signed-in account as returned by the backend
//! - `LoginRequest`, `RegisterRequest`, `OAuthProvider`: session creation inputs
//! - `Prediction`, `PredictionRecord`: results of a symptom check

pub mod prediction;
pub mod user;

pub use prediction::{Prediction, PredictionRecord};
pub use user::{AuthResponse, LoginRequest, OAuthProvider, RegisterRequest, UserProfile};
