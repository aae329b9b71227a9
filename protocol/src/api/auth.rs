//! Authentication API DTOs
//!
//! Session endpoints speak camelCase JSON.

use serde::{Deserialize, Serialize};
use validator::Validate;

pub use crate::common::{Claims, TokenPair};

// ============================================================================
// Login DTOs
// ============================================================================

/// Username/password login request
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    #[validate(length(min = 1, max = 255))]
    pub username: String,
    #[validate(length(min = 1, max = 1024))]
    pub password: String,
}

/// Login response: a full token pair plus the account name when the server sends it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

// ============================================================================
// Token Refresh DTOs
// ============================================================================

/// Refresh access token request
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RefreshTokenRequest {
    #[validate(length(min = 1))]
    pub refresh_token: String,
}

/// Refresh response; `refresh_token` is only present when the server rotates it
pub type RefreshTokenResponse = TokenPair;

/// Logout request, revokes the refresh token server side
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogoutRequest {
    pub refresh_token: String,
}
