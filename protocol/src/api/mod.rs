//! API DTOs module
//!
//! This module contains the request and response bodies of the session endpoints:
//! - `auth`: login, token refresh and logout

pub mod auth;

pub use auth::*;
