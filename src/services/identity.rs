use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::Url;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

pub(crate) const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/auth";
pub(crate) const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub(crate) const GOOGLE_USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v2/userinfo";

const SCOPES: &str =
    "https://www.googleapis.com/auth/userinfo.email https://www.googleapis.com/auth/cloud-platform";

/// Tokens returned by a code exchange or a refresh grant.
#[derive(Clone)]
pub(crate) struct TokenGrant {
    pub access_token: String,
    /// `None` when the provider did not rotate the refresh token.
    pub refresh_token: Option<String>,
    pub expiry: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub(crate) enum ProviderError {
    #[error("identity provider request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("identity provider rejected request (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("invalid identity provider response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub(crate) trait IdentityProvider: Send + Sync {
    fn authorize_url(&self, state: &str) -> Result<String, ProviderError>;

    async fn exchange_code(&self, code: &str) -> Result<TokenGrant, ProviderError>;

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, ProviderError>;

    async fn user_email(&self, access_token: &str) -> Result<String, ProviderError>;
}

#[derive(Debug, Clone)]
pub(crate) struct OAuthEndpoints {
    pub auth_url: String,
    pub token_url: String,
    pub userinfo_url: String,
}

impl Default for OAuthEndpoints {
    fn default() -> Self {
        Self {
            auth_url: GOOGLE_AUTH_URL.to_string(),
            token_url: GOOGLE_TOKEN_URL.to_string(),
            userinfo_url: GOOGLE_USERINFO_URL.to_string(),
        }
    }
}

/// OAuth 2.0 authorization-code client for Google accounts.
pub(crate) struct GoogleOAuth {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    redirect_uri: String,
    endpoints: OAuthEndpoints,
}

impl GoogleOAuth {
    pub(crate) fn new(
        client_id: String,
        client_secret: String,
        redirect_uri: String,
        endpoints: OAuthEndpoints,
    ) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            client_id,
            client_secret,
            redirect_uri,
            endpoints,
        })
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<TokenGrant, ProviderError> {
        let response = self
            .http
            .post(&self.endpoints.token_url)
            .form(form)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ProviderError::Rejected {
                status: status.as_u16(),
                body: truncate(&body, 200),
            });
        }

        parse_token_response(&body, Utc::now())
    }
}

#[async_trait]
impl IdentityProvider for GoogleOAuth {
    fn authorize_url(&self, state: &str) -> Result<String, ProviderError> {
        let url = Url::parse_with_params(
            &self.endpoints.auth_url,
            &[
                ("client_id", self.client_id.as_str()),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("response_type", "code"),
                ("scope", SCOPES),
                ("state", state),
                ("access_type", "offline"),
                ("prompt", "consent"),
            ],
        )
        .map_err(|error| ProviderError::InvalidResponse(format!("bad auth url: {error}")))?;

        Ok(url.into())
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenGrant, ProviderError> {
        debug!("exchanging authorization code");
        self.token_request(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.redirect_uri.as_str()),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ])
        .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, ProviderError> {
        debug!("refreshing access token");
        self.token_request(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ])
        .await
    }

    async fn user_email(&self, access_token: &str) -> Result<String, ProviderError> {
        #[derive(Deserialize)]
        struct UserInfo {
            #[serde(default)]
            email: String,
        }

        let response = self
            .http
            .get(&self.endpoints.userinfo_url)
            .bearer_auth(access_token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Rejected {
                status: status.as_u16(),
                body: truncate(&body, 200),
            });
        }

        let info: UserInfo = response.json().await?;
        let email = info.email.trim().to_string();
        if email.is_empty() {
            return Err(ProviderError::InvalidResponse(
                "user info has no email".to_string(),
            ));
        }
        Ok(email)
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// A response without `expires_in` yields an already-due expiry, so the next
/// shell session refreshes before launching.
fn parse_token_response(body: &str, now: DateTime<Utc>) -> Result<TokenGrant, ProviderError> {
    let parsed: TokenResponse = serde_json::from_str(body)
        .map_err(|error| ProviderError::InvalidResponse(error.to_string()))?;

    if parsed.access_token.is_empty() {
        return Err(ProviderError::InvalidResponse(
            "empty access_token".to_string(),
        ));
    }

    let expires_in = parsed.expires_in.unwrap_or(0);
    let expiry = ChronoDuration::try_seconds(expires_in)
        .and_then(|lifetime| now.checked_add_signed(lifetime))
        .ok_or_else(|| {
            ProviderError::InvalidResponse(format!("expires_in out of range: {expires_in}"))
        })?;

    Ok(TokenGrant {
        access_token: parsed.access_token,
        refresh_token: parsed.refresh_token.filter(|token| !token.is_empty()),
        expiry,
    })
}

fn truncate(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Form, Json, Router};
    use serde_json::json;
    use std::collections::HashMap;

    fn client(token_url: String) -> GoogleOAuth {
        GoogleOAuth::new(
            "client-id".to_string(),
            "client-secret".to_string(),
            "https://app.example.com/auth/google/callback".to_string(),
            OAuthEndpoints {
                token_url,
                ..OAuthEndpoints::default()
            },
        )
        .expect("build client")
    }

    #[test]
    fn parses_rotating_and_non_rotating_responses() {
        let now = Utc::now();
        let grant = parse_token_response(
            r#"{"access_token":"T2","refresh_token":"R2","expires_in":3600}"#,
            now,
        )
        .expect("parse");
        assert_eq!(grant.access_token, "T2");
        assert_eq!(grant.refresh_token.as_deref(), Some("R2"));
        assert_eq!(grant.expiry, now + ChronoDuration::seconds(3600));

        let grant = parse_token_response(
            r#"{"access_token":"T3","refresh_token":"","expires_in":60}"#,
            now,
        )
        .expect("parse");
        assert!(grant.refresh_token.is_none());
    }

    #[test]
    fn rejects_response_without_access_token() {
        assert!(parse_token_response(r#"{"expires_in":3600}"#, Utc::now()).is_err());
        assert!(parse_token_response(r#"{"access_token":""}"#, Utc::now()).is_err());
    }

    #[test]
    fn rejects_out_of_range_lifetimes() {
        let now = Utc::now();
        for body in [
            r#"{"access_token":"x","expires_in":9223372036854775807}"#,
            r#"{"access_token":"x","expires_in":-9223372036854775808}"#,
            r#"{"access_token":"x","expires_in":9000000000000}"#,
        ] {
            assert!(
                matches!(
                    parse_token_response(body, now),
                    Err(ProviderError::InvalidResponse(_))
                ),
                "{body}"
            );
        }
    }

    #[test]
    fn authorize_url_requests_offline_access() {
        let url = client(GOOGLE_TOKEN_URL.to_string())
            .authorize_url("abc123")
            .expect("url");
        assert!(url.starts_with(GOOGLE_AUTH_URL));
        assert!(url.contains("state=abc123"));
        assert!(url.contains("access_type=offline"));
        assert!(url.contains("prompt=consent"));
        assert!(url.contains("client_id=client-id"));
    }

    #[tokio::test]
    async fn refresh_posts_refresh_grant() {
        let app = Router::new().route(
            "/token",
            post(|Form(form): Form<HashMap<String, String>>| async move {
                assert_eq!(form.get("grant_type").map(String::as_str), Some("refresh_token"));
                assert_eq!(form.get("client_secret").map(String::as_str), Some("client-secret"));
                let refresh = form.get("refresh_token").cloned().unwrap_or_default();
                Json(json!({
                    "access_token": format!("new-for-{refresh}"),
                    "expires_in": 3600,
                }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let grant = client(format!("http://{addr}/token"))
            .refresh("R1")
            .await
            .expect("refresh");
        assert_eq!(grant.access_token, "new-for-R1");
        assert!(grant.refresh_token.is_none());
    }

    #[tokio::test]
    async fn refresh_surfaces_provider_rejection() {
        let app = Router::new().route(
            "/token",
            post(|| async {
                (
                    axum::http::StatusCode::BAD_REQUEST,
                    Json(json!({ "error": "invalid_grant" })),
                )
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let error = client(format!("http://{addr}/token"))
            .refresh("revoked")
            .await
            .err()
            .expect("refresh fails");
        match error {
            ProviderError::Rejected { status, body } => {
                assert_eq!(status, 400);
                assert!(body.contains("invalid_grant"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
