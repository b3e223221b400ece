use std::{env, path::PathBuf, time::Duration};

use crate::{
    bridge::DEFAULT_CHUNK_SIZE,
    services::{OAuthEndpoints, ShellCommand},
};

pub(crate) const DEFAULT_SHELL_COMMAND: &str =
    r#"gcloud cloud-shell ssh --authorize-session --quiet "--ssh-flag=-L 9090:localhost:8080""#;
pub(crate) const DEFAULT_TOKEN_ENV: &str = "CLOUDSDK_AUTH_ACCESS_TOKEN";

#[derive(Debug, Clone)]
pub(crate) struct BridgeConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub client_secret: String,
    pub app_base_url: String,
    pub oauth_endpoints: OAuthEndpoints,
    pub credentials_path: Option<PathBuf>,
    pub store_timeout: Duration,
    pub session_ttl: Duration,
    pub secure_cookies: bool,
    pub shell_command: ShellCommand,
    pub shell_token_env: String,
    pub refresh_margin: Duration,
    pub chunk_size: usize,
    pub pty_cols: u16,
    pub pty_rows: u16,
    pub terminal_page: PathBuf,
}

impl BridgeConfig {
    pub(crate) fn from_env() -> Result<Self, String> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let read = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let missing = ["GOOGLE_CLIENT_ID", "GOOGLE_CLIENT_SECRET", "APP_BASE_URL"]
            .into_iter()
            .filter(|name| read(*name).is_none())
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(format!(
                "Required environment variables not set: {}",
                missing.join(", ")
            ));
        }

        let client_id = read("GOOGLE_CLIENT_ID").unwrap_or_default();
        let client_secret = read("GOOGLE_CLIENT_SECRET").unwrap_or_default();
        let app_base_url = read("APP_BASE_URL")
            .unwrap_or_default()
            .trim_end_matches('/')
            .to_string();

        let defaults = OAuthEndpoints::default();
        let oauth_endpoints = OAuthEndpoints {
            auth_url: read("OAUTH_AUTH_URL").unwrap_or(defaults.auth_url),
            token_url: read("OAUTH_TOKEN_URL").unwrap_or(defaults.token_url),
            userinfo_url: read("OAUTH_USERINFO_URL").unwrap_or(defaults.userinfo_url),
        };

        let template =
            read("BRIDGE_SHELL_COMMAND").unwrap_or_else(|| DEFAULT_SHELL_COMMAND.to_string());
        let shell_command = ShellCommand::parse(&template)
            .map_err(|error| format!("BRIDGE_SHELL_COMMAND: {error}"))?;

        let chunk_size = parse_or(
            "BRIDGE_PTY_CHUNK_BYTES",
            read("BRIDGE_PTY_CHUNK_BYTES"),
            DEFAULT_CHUNK_SIZE,
        )?;
        if chunk_size == 0 {
            return Err("BRIDGE_PTY_CHUNK_BYTES must be greater than zero".to_string());
        }

        Ok(Self {
            host: read("BRIDGE_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_or("BRIDGE_PORT", read("BRIDGE_PORT"), 8080)?,
            client_id,
            client_secret,
            app_base_url,
            oauth_endpoints,
            credentials_path: read("BRIDGE_CREDENTIALS_PATH").map(PathBuf::from),
            store_timeout: Duration::from_millis(parse_or(
                "BRIDGE_STORE_TIMEOUT_MS",
                read("BRIDGE_STORE_TIMEOUT_MS"),
                5_000,
            )?),
            session_ttl: Duration::from_secs(parse_or(
                "BRIDGE_SESSION_TTL_SECS",
                read("BRIDGE_SESSION_TTL_SECS"),
                7 * 24 * 60 * 60,
            )?),
            secure_cookies: parse_bool(read("BRIDGE_SECURE_COOKIES")),
            shell_command,
            shell_token_env: read("BRIDGE_SHELL_TOKEN_ENV")
                .unwrap_or_else(|| DEFAULT_TOKEN_ENV.to_string()),
            refresh_margin: Duration::from_secs(parse_or(
                "BRIDGE_REFRESH_MARGIN_SECS",
                read("BRIDGE_REFRESH_MARGIN_SECS"),
                60,
            )?),
            chunk_size,
            pty_cols: parse_or("BRIDGE_PTY_COLS", read("BRIDGE_PTY_COLS"), 80)?,
            pty_rows: parse_or("BRIDGE_PTY_ROWS", read("BRIDGE_PTY_ROWS"), 24)?,
            terminal_page: read("BRIDGE_TERMINAL_PAGE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("index.html")),
        })
    }

    pub(crate) fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub(crate) fn redirect_uri(&self) -> String {
        format!("{}/auth/google/callback", self.app_base_url)
    }
}

fn parse_bool(value: Option<String>) -> bool {
    value
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(false)
}

fn parse_or<T: std::str::FromStr>(
    name: &str,
    value: Option<String>,
    fallback: T,
) -> Result<T, String> {
    match value {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| format!("{name} has an invalid value: {raw}")),
        None => Ok(fallback),
    }
}
