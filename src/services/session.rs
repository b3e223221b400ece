use std::{collections::HashMap, time::Duration};

use axum::http::{header, HeaderMap};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::BridgeError;

pub(crate) const SESSION_COOKIE: &str = "auth-session";
pub(crate) const STATE_COOKIE: &str = "oauth-state";

/// Who a session belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Identity {
    pub email: String,
    pub role: String,
}

struct SessionEntry {
    identity: Identity,
    expires_at: DateTime<Utc>,
}

/// Server-side sessions keyed by an opaque cookie token.
pub(crate) struct SessionStore {
    sessions: RwLock<HashMap<String, SessionEntry>>,
    ttl: Duration,
}

impl SessionStore {
    pub(crate) fn new(ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub(crate) fn ttl(&self) -> Duration {
        self.ttl
    }

    pub(crate) async fn create(&self, identity: Identity) -> Result<String, getrandom::Error> {
        let token = random_token()?;
        let ttl = chrono::Duration::from_std(self.ttl)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let now = Utc::now();
        let expires_at = now
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, entry| entry.expires_at > now);
        if sessions.len() < before {
            debug!(evicted = before - sessions.len(), "swept expired sessions");
        }
        sessions.insert(
            token.clone(),
            SessionEntry {
                identity,
                expires_at,
            },
        );
        Ok(token)
    }

    pub(crate) async fn lookup(&self, token: &str) -> Option<Identity> {
        let now = Utc::now();
        {
            let sessions = self.sessions.read().await;
            match sessions.get(token) {
                None => return None,
                Some(entry) if entry.expires_at > now => return Some(entry.identity.clone()),
                Some(_) => {}
            }
        }

        debug!("evicting expired session");
        self.sessions.write().await.remove(token);
        None
    }

    pub(crate) async fn remove(&self, token: &str) {
        self.sessions.write().await.remove(token);
    }

    /// Resolves the request's session cookie to a non-empty identity.
    pub(crate) async fn authenticate(&self, headers: &HeaderMap) -> Result<Identity, BridgeError> {
        let token = cookie_value(headers, SESSION_COOKIE).ok_or(BridgeError::Unauthenticated)?;
        let identity = self
            .lookup(token)
            .await
            .ok_or(BridgeError::Unauthenticated)?;

        if identity.email.trim().is_empty() {
            return Err(BridgeError::Unauthenticated);
        }
        Ok(identity)
    }
}

/// 32 random bytes, URL-safe base64.
pub(crate) fn random_token() -> Result<String, getrandom::Error> {
    let mut buf = [0u8; 32];
    getrandom::getrandom(&mut buf)?;
    Ok(URL_SAFE_NO_PAD.encode(buf))
}

pub(crate) fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|raw| raw.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim())
        .filter(|value| !value.is_empty())
}

pub(crate) fn set_cookie(name: &str, value: &str, max_age: Duration, secure: bool) -> String {
    let mut cookie = format!(
        "{name}={value}; Path=/; Max-Age={}; HttpOnly; SameSite=Lax",
        max_age.as_secs()
    );
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

pub(crate) fn clear_cookie(name: &str) -> String {
    format!("{name}=; Path=/; Max-Age=0; HttpOnly; SameSite=Lax")
}
