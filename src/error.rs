use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::services::{identity::ProviderError, store::StoreError, terminal::LaunchError};

pub(crate) const LAUNCH_FAILED_MESSAGE: &str = "Failed to start remote shell.";

/// Failures that end a connection attempt before the bridge starts.
#[derive(Debug, Error)]
pub(crate) enum BridgeError {
    #[error("missing or invalid session")]
    Unauthenticated,

    #[error("user not found: {0}")]
    UserNotFound(String),

    #[error("credential refresh failed: {0}")]
    RefreshFailed(#[source] ProviderError),

    #[error("shell launch failed: {0}")]
    LaunchFailed(#[from] LaunchError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl BridgeError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Unauthenticated | Self::UserNotFound(_) | Self::RefreshFailed(_) => {
                StatusCode::UNAUTHORIZED
            }
            Self::Store(StoreError::Timeout { .. }) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Provider(_) => StatusCode::BAD_GATEWAY,
            Self::LaunchFailed(_) | Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthorized",
            Self::UserNotFound(_) => "user_not_found",
            Self::RefreshFailed(_) => "refresh_failed",
            Self::LaunchFailed(_) => "launch_failed",
            Self::Store(_) => "store_unavailable",
            Self::Provider(_) => "provider_error",
        }
    }

    /// Client-facing text. Provider and store detail stays in the logs.
    pub(crate) fn public_message(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "Missing or invalid session",
            Self::UserNotFound(_) => "User not found",
            Self::RefreshFailed(_) => "Failed to refresh session token",
            Self::LaunchFailed(_) => LAUNCH_FAILED_MESSAGE,
            Self::Store(_) => "Credential store unavailable",
            Self::Provider(_) => "Identity provider unavailable",
        }
    }
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        (
            self.status(),
            Json(json!({
                "error": self.code(),
                "message": self.public_message(),
            })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_failures_map_to_unauthorized() {
        assert_eq!(
            BridgeError::Unauthenticated.status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            BridgeError::UserNotFound("a@example.com".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            BridgeError::RefreshFailed(ProviderError::Rejected {
                status: 400,
                body: "invalid_grant".into()
            })
            .status(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn store_timeout_is_service_unavailable() {
        let error = BridgeError::from(StoreError::Timeout { operation: "get" });
        assert_eq!(error.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(error.code(), "store_unavailable");
    }

    #[test]
    fn launch_failure_is_internal_with_fixed_text() {
        let error = BridgeError::from(LaunchError::NoMasterFd);
        assert_eq!(error.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(error.code(), "launch_failed");
        assert_eq!(error.public_message(), LAUNCH_FAILED_MESSAGE);
    }
}
