use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{info, warn};

use crate::{
    error::BridgeError,
    services::{
        identity::{IdentityProvider, TokenGrant},
        store::{CredentialRecord, Credentials},
    },
};

/// Makes sure a user's access token is usable before a shell is launched.
#[derive(Clone)]
pub(crate) struct RefreshGuard {
    provider: Arc<dyn IdentityProvider>,
    credentials: Credentials,
    margin: ChronoDuration,
}

impl RefreshGuard {
    pub(crate) fn new(
        provider: Arc<dyn IdentityProvider>,
        credentials: Credentials,
        margin: ChronoDuration,
    ) -> Self {
        Self {
            provider,
            credentials,
            margin,
        }
    }

    /// Loads the user's record and refreshes it if needed.
    pub(crate) async fn admit(&self, email: &str) -> Result<CredentialRecord, BridgeError> {
        let record = self
            .credentials
            .get(email)
            .await?
            .ok_or_else(|| BridgeError::UserNotFound(email.to_string()))?;

        self.ensure_fresh(record, Utc::now()).await
    }

    pub(crate) fn needs_refresh(&self, record: &CredentialRecord, now: DateTime<Utc>) -> bool {
        now >= record.token_expiry - self.margin
    }

    pub(crate) async fn ensure_fresh(
        &self,
        mut record: CredentialRecord,
        now: DateTime<Utc>,
    ) -> Result<CredentialRecord, BridgeError> {
        if !self.needs_refresh(&record, now) {
            return Ok(record);
        }

        info!(email = %record.email, expiry = %record.token_expiry, "access token expiring, refreshing");

        let grant = self
            .provider
            .refresh(&record.refresh_token)
            .await
            .map_err(|error| {
                warn!(email = %record.email, %error, "token refresh failed");
                BridgeError::RefreshFailed(error)
            })?;

        if !apply_grant(&mut record, grant) {
            return Ok(record);
        }

        info!(email = %record.email, expiry = %record.token_expiry, "token refreshed");
        if let Err(error) = self.credentials.upsert(&record).await {
            // The refreshed token is still good for this session.
            warn!(email = %record.email, %error, "failed to persist refreshed token");
        }

        Ok(record)
    }
}

/// Returns whether the record changed. A grant without a refresh token keeps
/// the stored one.
fn apply_grant(record: &mut CredentialRecord, grant: TokenGrant) -> bool {
    let mut changed = false;

    if grant.access_token != record.access_token {
        record.access_token = grant.access_token;
        changed = true;
    }
    if grant.expiry != record.token_expiry {
        record.token_expiry = grant.expiry;
        changed = true;
    }
    if let Some(refresh_token) = grant.refresh_token {
        if refresh_token != record.refresh_token {
            record.refresh_token = refresh_token;
            changed = true;
        }
    }

    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        identity::ProviderError,
        store::{tests::record, CredentialStore, MemoryCredentialStore, StoreError},
    };
    use async_trait::async_trait;
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
        time::Duration,
    };

    struct ScriptedProvider {
        calls: AtomicUsize,
        seen: Mutex<Vec<String>>,
        response: Mutex<Option<Result<TokenGrant, ProviderError>>>,
    }

    impl ScriptedProvider {
        fn returning(response: Result<TokenGrant, ProviderError>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
                response: Mutex::new(Some(response)),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl IdentityProvider for ScriptedProvider {
        fn authorize_url(&self, _state: &str) -> Result<String, ProviderError> {
            unreachable!("not used by the refresh guard")
        }

        async fn exchange_code(&self, _code: &str) -> Result<TokenGrant, ProviderError> {
            unreachable!("not used by the refresh guard")
        }

        async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(refresh_token.to_string());
            self.response
                .lock()
                .unwrap()
                .take()
                .expect("refresh called more than once")
        }

        async fn user_email(&self, _access_token: &str) -> Result<String, ProviderError> {
            unreachable!("not used by the refresh guard")
        }
    }

    struct FailingStore;

    #[async_trait]
    impl CredentialStore for FailingStore {
        async fn get(&self, _email: &str) -> Result<Option<CredentialRecord>, StoreError> {
            Ok(None)
        }

        async fn upsert(&self, _record: &CredentialRecord) -> Result<(), StoreError> {
            Err(StoreError::Io(std::io::Error::other("disk full")))
        }
    }

    fn guard(
        provider: Arc<ScriptedProvider>,
        store: Arc<dyn CredentialStore>,
    ) -> RefreshGuard {
        RefreshGuard::new(
            provider,
            Credentials::new(store, Duration::from_secs(5)),
            ChronoDuration::minutes(1),
        )
    }

    #[tokio::test]
    async fn fresh_token_skips_provider_and_store() {
        let now = Utc::now();
        let provider = ScriptedProvider::returning(Err(ProviderError::InvalidResponse(
            "unused".into(),
        )));
        let store = Arc::new(MemoryCredentialStore::new());
        let guard = guard(provider.clone(), store.clone());

        let mut stored = record("a@x.io", "T1", "R1");
        stored.token_expiry = now + ChronoDuration::minutes(5);

        let result = guard.ensure_fresh(stored.clone(), now).await.expect("fresh");
        assert_eq!(result, stored);
        assert_eq!(provider.calls(), 0);
        assert!(store.get("a@x.io").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expiring_token_is_refreshed_once_and_keeps_refresh_token() {
        let now = Utc::now();
        let new_expiry = now + ChronoDuration::seconds(3600);
        let provider = ScriptedProvider::returning(Ok(TokenGrant {
            access_token: "T2".into(),
            refresh_token: None,
            expiry: new_expiry,
        }));
        let store = Arc::new(MemoryCredentialStore::new());
        let guard = guard(provider.clone(), store.clone());

        let mut stored = record("a@x.io", "T1", "R-original");
        stored.token_expiry = now + ChronoDuration::seconds(30);
        store.upsert(&stored).await.unwrap();

        let result = guard.ensure_fresh(stored, now).await.expect("refreshed");
        assert_eq!(provider.calls(), 1);
        assert_eq!(provider.seen.lock().unwrap().as_slice(), ["R-original"]);
        assert_eq!(result.access_token, "T2");

        let persisted = store.get("a@x.io").await.unwrap().expect("persisted");
        assert_eq!(persisted.access_token, "T2");
        assert_eq!(persisted.refresh_token, "R-original");
        assert_eq!(persisted.token_expiry, new_expiry);
    }

    #[tokio::test]
    async fn rotated_refresh_token_is_stored() {
        let now = Utc::now();
        let provider = ScriptedProvider::returning(Ok(TokenGrant {
            access_token: "T2".into(),
            refresh_token: Some("R2".into()),
            expiry: now + ChronoDuration::hours(1),
        }));
        let store = Arc::new(MemoryCredentialStore::new());
        let guard = guard(provider, store.clone());

        let mut stored = record("a@x.io", "T1", "R1");
        stored.token_expiry = now - ChronoDuration::hours(2);

        guard.ensure_fresh(stored, now).await.expect("refreshed");
        let persisted = store.get("a@x.io").await.unwrap().expect("persisted");
        assert_eq!(persisted.refresh_token, "R2");
    }

    #[tokio::test]
    async fn margin_boundary_triggers_refresh() {
        let now = Utc::now();
        let provider = ScriptedProvider::returning(Ok(TokenGrant {
            access_token: "T2".into(),
            refresh_token: None,
            expiry: now + ChronoDuration::hours(1),
        }));
        let guard = guard(provider.clone(), Arc::new(MemoryCredentialStore::new()));

        let mut stored = record("a@x.io", "T1", "R1");
        stored.token_expiry = now + ChronoDuration::minutes(1);
        assert!(guard.needs_refresh(&stored, now));
        assert!(!guard.needs_refresh(&stored, now - ChronoDuration::seconds(1)));

        guard.ensure_fresh(stored, now).await.expect("refreshed");
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn provider_rejection_fails_admission() {
        let now = Utc::now();
        let provider = ScriptedProvider::returning(Err(ProviderError::Rejected {
            status: 400,
            body: "invalid_grant".into(),
        }));
        let guard = guard(provider, Arc::new(MemoryCredentialStore::new()));

        let mut stored = record("a@x.io", "T1", "R1");
        stored.token_expiry = now;

        let error = guard.ensure_fresh(stored, now).await.expect_err("rejected");
        assert!(matches!(error, BridgeError::RefreshFailed(_)));
    }

    #[tokio::test]
    async fn persistence_failure_still_returns_refreshed_record() {
        let now = Utc::now();
        let provider = ScriptedProvider::returning(Ok(TokenGrant {
            access_token: "T2".into(),
            refresh_token: None,
            expiry: now + ChronoDuration::hours(1),
        }));
        let guard = guard(provider, Arc::new(FailingStore));

        let mut stored = record("a@x.io", "T1", "R1");
        stored.token_expiry = now;

        let result = guard.ensure_fresh(stored, now).await.expect("still usable");
        assert_eq!(result.access_token, "T2");
    }

    #[tokio::test]
    async fn missing_record_is_user_not_found() {
        let provider = ScriptedProvider::returning(Err(ProviderError::InvalidResponse(
            "unused".into(),
        )));
        let guard = guard(provider.clone(), Arc::new(MemoryCredentialStore::new()));

        let error = guard.admit("ghost@x.io").await.expect_err("missing");
        assert!(matches!(error, BridgeError::UserNotFound(email) if email == "ghost@x.io"));
        assert_eq!(provider.calls(), 0);
    }
}
