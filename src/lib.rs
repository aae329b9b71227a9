//! Authenticated HTTP client that keeps bearer tokens fresh.
//!
//! Access tokens close to expiry are renewed before a request goes out, at most
//! one renewal runs at a time per client, and a request rejected with 401 is
//! replayed once with a renewed token.

pub mod auth;
pub mod cli;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod store;
pub mod token;
pub mod transport;
pub mod ui;

#[cfg(test)]
mod tests;

pub use client::{HttpClient, SessionInfo};
pub use config::{ClientConfig, TokenStorageConfig};
pub use coordinator::{LoggingSessionListener, RefreshPhase, SessionListener, TokenRefreshCoordinator};
pub use error::{ErrorCode, RelayError, Result};
pub use store::{CredentialStore, FileTokenStorage, MemoryTokenStorage, TokenStorage};
pub use token::{Clock, SystemClock};
pub use transport::{ApiRequest, AuthMode, HttpTransport, PreparedRequest, RawResponse, ReqwestTransport};
