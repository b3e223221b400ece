use std::{sync::Arc, time::Duration};

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{AppendHeaders, Html, IntoResponse, Redirect, Response},
};
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::{
    error::BridgeError,
    services::{
        session::{
            clear_cookie, cookie_value, random_token, set_cookie, SESSION_COOKIE, STATE_COOKIE,
        },
        store::DEFAULT_ROLE,
        CredentialRecord, Identity,
    },
    AppState,
};

/// How long a login attempt may sit at the provider before its state expires.
const STATE_TTL: Duration = Duration::from_secs(10 * 60);

const LOGIN_PAGE: &str = r#"<!doctype html>
<html>
  <head><meta charset="utf-8"><title>Cloud Shell</title></head>
  <body>
    <h1>Cloud Shell</h1>
    <p><a href="/auth/google">Sign in with Google</a></p>
  </body>
</html>
"#;

#[derive(Debug, Deserialize)]
pub(crate) struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

pub(crate) async fn login_page() -> Html<&'static str> {
    Html(LOGIN_PAGE)
}

/// Starts the authorization-code flow with a fresh anti-forgery state.
pub(crate) async fn start_login(State(state): State<Arc<AppState>>) -> Response {
    let login_state = match random_token() {
        Ok(token) => token,
        Err(error) => {
            error!(%error, "failed to generate oauth state");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let url = match state.provider.authorize_url(&login_state) {
        Ok(url) => url,
        Err(error) => return BridgeError::from(error).into_response(),
    };

    let cookie = set_cookie(
        STATE_COOKIE,
        &login_state,
        STATE_TTL,
        state.config.secure_cookies,
    );
    ([(header::SET_COOKIE, cookie)], Redirect::temporary(&url)).into_response()
}

pub(crate) async fn callback(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<CallbackQuery>,
) -> Response {
    if let Some(reason) = query.error.as_deref() {
        warn!(reason, "provider returned an authorization error");
        return failed_login();
    }

    let expected = cookie_value(&headers, STATE_COOKIE);
    let (Some(code), Some(returned)) = (query.code.as_deref(), query.state.as_deref()) else {
        warn!("callback without code or state");
        return failed_login();
    };
    if expected != Some(returned) {
        warn!("oauth state mismatch");
        return failed_login();
    }

    match complete_login(&state, code).await {
        Ok((identity, token)) => {
            info!(email = %identity.email, role = %identity.role, "login completed");
            let session = set_cookie(
                SESSION_COOKIE,
                &token,
                state.sessions.ttl(),
                state.config.secure_cookies,
            );
            (
                AppendHeaders([
                    (header::SET_COOKIE, session),
                    (header::SET_COOKIE, clear_cookie(STATE_COOKIE)),
                ]),
                Redirect::to("/terminal/"),
            )
                .into_response()
        }
        Err(error) => {
            warn!(%error, "login failed");
            failed_login()
        }
    }
}

/// Exchanges the code, records the grant under the user's email and opens a
/// session. An existing record keeps its role and, when the provider sends
/// none, its refresh token.
async fn complete_login(
    state: &AppState,
    code: &str,
) -> Result<(Identity, String), BridgeError> {
    let grant = state.provider.exchange_code(code).await?;
    let email = state.provider.user_email(&grant.access_token).await?;
    if email.trim().is_empty() {
        return Err(BridgeError::Unauthenticated);
    }

    let existing = state.credentials.get(&email).await?;
    let (role, previous_refresh) = match existing {
        Some(record) => (record.role, Some(record.refresh_token)),
        None => (DEFAULT_ROLE.to_string(), None),
    };

    let record = CredentialRecord {
        email: email.clone(),
        access_token: grant.access_token,
        refresh_token: grant
            .refresh_token
            .or(previous_refresh)
            .unwrap_or_default(),
        token_expiry: grant.expiry,
        role: role.clone(),
    };
    if record.refresh_token.is_empty() {
        warn!(email = %email, "provider issued no refresh token; shell access will fail once the token expires");
    }
    state.credentials.upsert(&record).await?;

    let identity = Identity { email, role };
    let token = state.sessions.create(identity.clone()).await.map_err(|error| {
        error!(%error, "failed to generate session token");
        BridgeError::Unauthenticated
    })?;
    Ok((identity, token))
}

pub(crate) async fn logout(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Some(token) = cookie_value(&headers, SESSION_COOKIE) {
        state.sessions.remove(token).await;
    }
    (
        [(header::SET_COOKIE, clear_cookie(SESSION_COOKIE))],
        Redirect::to("/"),
    )
        .into_response()
}

fn failed_login() -> Response {
    (
        [(header::SET_COOKIE, clear_cookie(STATE_COOKIE))],
        Redirect::to("/"),
    )
        .into_response()
}
