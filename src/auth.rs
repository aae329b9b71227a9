//! Session commands on top of [`HttpClient`]

use chrono::{DateTime, Duration, Utc};
use dialoguer::{theme::ColorfulTheme, Input, Password};
use tracing::debug;

use crate::client::HttpClient;
use crate::config::ClientConfig;
use crate::error::{RelayError, Result};
use crate::transport::{HttpTransport, ReqwestTransport};
use crate::ui::UI;

pub const CURRENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Everything `tokenrelay status` shows
#[derive(Debug, Clone)]
pub struct StatusInfo {
    pub version: String,
    pub endpoint: String,
    pub authenticated: bool,
    pub username: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub remaining: Option<Duration>,
    pub expiring_soon: bool,
    pub has_refresh_token: bool,
}

impl StatusInfo {
    pub fn expired(&self) -> bool {
        self.remaining.is_some_and(|r| r <= Duration::zero())
    }
}

/// Login, logout and status for the command line
pub struct AuthService<T = ReqwestTransport> {
    client: HttpClient<T>,
    ui: UI,
}

impl AuthService<ReqwestTransport> {
    pub fn new(config: ClientConfig) -> Result<Self> {
        Ok(Self::with_client(HttpClient::from_config(config)?))
    }
}

impl<T: HttpTransport> AuthService<T> {
    pub fn with_client(client: HttpClient<T>) -> Self {
        Self {
            client,
            ui: UI::new(),
        }
    }

    pub fn client(&self) -> &HttpClient<T> {
        &self.client
    }

    /// Log in, prompting for whatever was not given on the command line
    pub async fn login(
        &self,
        username: Option<String>,
        password: Option<String>,
    ) -> Result<String> {
        let username = match username {
            Some(username) => username,
            None => Input::<String>::with_theme(&ColorfulTheme::default())
                .with_prompt("Username")
                .interact_text()?,
        };
        let password = match password {
            Some(password) => password,
            None => Password::with_theme(&ColorfulTheme::default())
                .with_prompt("Password")
                .interact()?,
        };

        let username = self
            .client
            .login(username.trim(), &password)
            .await
            .inspect_err(|e| debug!("Login failed: {}", e))?;

        self.ui.success(&format!("Logged in as {}", username));
        Ok(username)
    }

    pub async fn logout(&self) -> Result<()> {
        if !self.client.is_authenticated() {
            self.ui.warning("Not logged in");
            return Ok(());
        }

        self.client.logout().await?;
        self.ui.success("Logged out");
        Ok(())
    }

    pub fn get_status(&self) -> StatusInfo {
        let session = self.client.session_info();

        StatusInfo {
            version: CURRENT_VERSION.to_string(),
            endpoint: self.client.config().base_url.clone(),
            authenticated: session.is_some(),
            username: session.as_ref().and_then(|s| s.username.clone()),
            expires_at: session.as_ref().and_then(|s| s.access_token_expires_at),
            remaining: session.as_ref().and_then(|s| s.remaining),
            expiring_soon: session.as_ref().is_some_and(|s| s.expiring_soon),
            has_refresh_token: session.as_ref().is_some_and(|s| s.has_refresh_token),
        }
    }

    /// Fail early with a readable message when no session is stored
    pub fn require_session(&self) -> Result<()> {
        if self.client.is_authenticated() {
            Ok(())
        } else {
            Err(RelayError::session_not_found(
                "Not logged in. Run 'tokenrelay login' first",
            ))
        }
    }
}
