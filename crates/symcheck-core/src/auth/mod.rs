//! Authentication and session management.
//!
//! - `credentials`: token storage (keyring, file or memory)
//! - `refresh`: single-flight access token refresh
//! - `session`: login, logout and session bootstrap

pub mod credentials;
pub mod refresh;
pub mod session;

pub use credentials::{Credential, CredentialStore, FileBackend, KeyringBackend, MemoryBackend, StoreBackend};
pub use refresh::{RefreshCoordinator, RefreshError, RefreshObserver};
pub use session::{AuthEvent, AuthState, LogoutReason, Session, SessionManager};
