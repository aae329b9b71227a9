use clap::{Args, Parser, Subcommand};
use reqwest::Method;
use std::path::PathBuf;

use crate::auth::{AuthService, CURRENT_VERSION};
use crate::client::HttpClient;
use crate::config::{default_config_path, ClientConfig};
use crate::error::{RelayError, Result};
use crate::transport::{ApiRequest, AuthMode};
use crate::ui::UI;

#[derive(Parser)]
#[command(
    name = "tokenrelay",
    about = "Authenticated HTTP client with automatic token refresh",
    long_about = "tokenrelay - Authenticated HTTP client with automatic token refresh

OVERVIEW:
  Keeps a bearer token session for a JSON API. Access tokens that are about to
  expire are renewed before use, and a request rejected with 401 is retried once
  with a renewed token.

QUICK START:
  tokenrelay login                         # Authenticate with username and password
  tokenrelay request GET /contracts        # Send an authenticated request
  tokenrelay status                        # Show session state
  tokenrelay logout                        # Revoke and forget the session",
    version = CURRENT_VERSION,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Use this configuration file instead of the default one
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Login with username and password
    Login(LoginArgs),

    /// Logout
    Logout,

    /// Show authentication status
    #[command(aliases = &["st"])]
    Status,

    /// Send a request to the API
    #[command(aliases = &["req"])]
    Request(RequestArgs),

    /// Configure settings
    #[command(aliases = &["cfg"])]
    Config(ConfigArgs),
}

#[derive(Args)]
pub struct LoginArgs {
    #[arg(short, long)]
    pub username: Option<String>,

    #[arg(short, long)]
    pub password: Option<String>,
}

#[derive(Args)]
pub struct RequestArgs {
    /// HTTP method, e.g. GET or POST
    pub method: String,

    /// Path relative to the configured endpoint
    pub path: String,

    /// JSON request body
    #[arg(short, long)]
    pub data: Option<String>,

    /// Send without the stored token
    #[arg(long)]
    pub anonymous: bool,
}

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    Show,
    SetEndpoint { url: String },
    SetTimeout { seconds: u64 },
    SetThreshold { seconds: u64 },
    Reset,
}

impl RequestArgs {
    pub fn to_request(&self) -> Result<ApiRequest> {
        let method = Method::from_bytes(self.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| RelayError::invalid_input(format!("Invalid HTTP method: {}", self.method)))?;

        let mut request = ApiRequest::new(method, self.path.clone()).with_auth(if self.anonymous {
            AuthMode::Anonymous
        } else {
            AuthMode::Optional
        });

        if let Some(data) = &self.data {
            let body = serde_json::from_str(data).map_err(|e| {
                RelayError::validation_field(format!("Request body is not valid JSON: {}", e), "data")
            })?;
            request = request.with_body(body);
        }

        Ok(request)
    }
}

/// Apply a `config set-*`/`reset` command to `config`
pub fn apply_config_command(config: &ClientConfig, command: &ConfigCommand) -> Result<ClientConfig> {
    let mut updated = config.clone();
    match command {
        ConfigCommand::Show => return Ok(updated),
        ConfigCommand::SetEndpoint { url } => updated.base_url = url.trim().to_string(),
        ConfigCommand::SetTimeout { seconds } => updated.timeout = *seconds,
        ConfigCommand::SetThreshold { seconds } => updated.refresh_threshold_secs = *seconds,
        ConfigCommand::Reset => updated = ClientConfig::default(),
    }
    updated.validate()?;
    Ok(updated)
}

/// Follow-up advice printed under a failed command
pub fn error_hint(error: &RelayError) -> Option<&'static str> {
    if error.is_auth_error() {
        Some("Run 'tokenrelay login' to start a new session")
    } else if error.is_network_error() {
        Some("Check the endpoint with 'tokenrelay config show'")
    } else {
        None
    }
}

/// CLI handler for processing commands
pub struct CliHandler {
    config_path: Option<PathBuf>,
    ui: UI,
}

impl CliHandler {
    pub fn with_config_path(config_path: Option<PathBuf>) -> Self {
        Self {
            config_path,
            ui: UI::new(),
        }
    }

    fn resolved_config_path(&self) -> PathBuf {
        self.config_path.clone().unwrap_or_else(default_config_path)
    }

    fn load_config(&self) -> Result<ClientConfig> {
        ClientConfig::load(Some(&self.resolved_config_path()))
    }

    /// Execute a CLI command
    pub async fn execute(&mut self, command: Commands) -> Result<()> {
        match command {
            Commands::Login(args) => self.handle_login(args).await,
            Commands::Logout => self.handle_logout().await,
            Commands::Status => self.handle_status(),
            Commands::Request(args) => self.handle_request(args).await,
            Commands::Config(args) => self.handle_config(args).await,
        }
    }

    async fn handle_login(&mut self, args: LoginArgs) -> Result<()> {
        let service = AuthService::new(self.load_config()?)?;
        service.login(args.username, args.password).await?;
        Ok(())
    }

    async fn handle_logout(&mut self) -> Result<()> {
        let service = AuthService::new(self.load_config()?)?;
        service.logout().await
    }

    fn handle_status(&mut self) -> Result<()> {
        let service = AuthService::new(self.load_config()?)?;
        let status_info = service.get_status();

        let mut status_info_vec = vec![
            ("Version", status_info.version.clone()),
            ("Endpoint", status_info.endpoint.clone()),
            (
                "Authentication",
                self.ui
                    .format_auth_status(status_info.authenticated, status_info.expired()),
            ),
        ];

        // Only show session details if authenticated
        if status_info.authenticated {
            status_info_vec.push((
                "Username",
                self.ui.format_user_field(status_info.username.clone()),
            ));
            status_info_vec.push((
                "Access token",
                self.ui.format_expiry(
                    status_info.expires_at,
                    status_info.remaining,
                    status_info.expiring_soon,
                ),
            ));
            status_info_vec.push((
                "Refresh token",
                self.ui.format_yes_no(status_info.has_refresh_token),
            ));
        }

        self.ui.card("Status", status_info_vec);
        Ok(())
    }

    async fn handle_request(&mut self, args: RequestArgs) -> Result<()> {
        let request = args.to_request()?;
        let client = HttpClient::from_config(self.load_config()?)?;

        let response = client.send(request).await?;
        let output = match serde_json::from_str::<serde_json::Value>(&response.body) {
            Ok(value) => serde_json::to_string_pretty(&value)?,
            Err(_) => response.body,
        };
        if !output.is_empty() {
            println!("{}", output);
        }
        Ok(())
    }

    async fn handle_config(&mut self, args: ConfigArgs) -> Result<()> {
        let path = self.resolved_config_path();
        let config = self.load_config()?;

        if let ConfigCommand::Show = args.command {
            self.ui.card(
                "Configuration",
                vec![
                    ("File", path.display().to_string()),
                    ("Endpoint", config.base_url.clone()),
                    ("Timeout", format!("{}s", config.timeout)),
                    ("Refresh path", config.refresh_path.clone()),
                    ("Refresh threshold", format!("{}s", config.refresh_threshold_secs)),
                    (
                        "Token storage",
                        if config.token_storage.enabled {
                            config.token_storage.resolved_path().display().to_string()
                        } else {
                            "Memory only".to_string()
                        },
                    ),
                ],
            );
            return Ok(());
        }

        let updated = apply_config_command(&config, &args.command)?;
        updated.save(&path).await?;
        self.ui
            .success(&format!("Configuration saved to {}", path.display()));
        Ok(())
    }
}
