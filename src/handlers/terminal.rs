use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{HeaderMap, StatusCode},
    response::{Html, IntoResponse, Redirect, Response},
};
use futures_util::SinkExt;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    bridge,
    error::BridgeError,
    services::{terminal::LaunchError, CredentialRecord, Identity},
    AppState,
};

/// Admits the caller before upgrading: a missing session or a token that
/// cannot be refreshed is answered with an HTTP error and no shell is started.
pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, BridgeError> {
    let identity = state
        .sessions
        .authenticate(&headers)
        .await
        .inspect_err(|_| warn!("terminal websocket rejected: no valid session"))?;

    let record = state
        .refresh
        .admit(&identity.email)
        .await
        .inspect_err(|error| warn!(email = %identity.email, %error, "terminal admission refused"))?;

    let tracker = state.tracker.clone();
    Ok(ws
        .on_upgrade(move |socket| {
            tracker.track_future(serve_terminal(socket, state, identity, record))
        })
        .into_response())
}

async fn serve_terminal(
    mut socket: WebSocket,
    state: Arc<AppState>,
    identity: Identity,
    record: CredentialRecord,
) {
    let span = info_span!("terminal", email = %identity.email);
    async move {
        debug!("upgraded, starting shell");
        let launched = state
            .launcher
            .launch(&record.access_token)
            .and_then(|mut process| match process.take_stream() {
                Some(stream) => Ok((process, stream)),
                None => Err(LaunchError::NoMasterFd),
            });
        drop(record);

        let (process, pty) = match launched {
            Ok(pair) => pair,
            Err(error) => {
                let error = BridgeError::from(error);
                error!(%error, "failed to start remote shell");
                if let Err(error) = socket
                    .send(Message::Text(error.public_message().into()))
                    .await
                {
                    debug!(%error, "could not deliver launch failure");
                }
                if let Err(error) = socket.close().await {
                    debug!(%error, "close after launch failure failed");
                }
                return;
            }
        };

        info!(pid = ?process.pid(), "shell started");
        let outcome = bridge::run(pty, socket, state.config.chunk_size, &state.shutdown).await;
        let status = process.terminate().await;

        info!(
            end = ?outcome.end,
            pty_to_socket_bytes = outcome.pty_to_socket_bytes,
            socket_to_pty_bytes = outcome.socket_to_pty_bytes,
            exit = ?status,
            "terminal session closed"
        );
    }
    .instrument(span)
    .await
}

/// Serves the terminal client page to signed-in users.
pub(crate) async fn terminal_page(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    if state.sessions.authenticate(&headers).await.is_err() {
        return Redirect::to("/login").into_response();
    }

    match tokio::fs::read_to_string(&state.config.terminal_page).await {
        Ok(page) => Html(page).into_response(),
        Err(error) => {
            warn!(
                path = %state.config.terminal_page.display(),
                %error,
                "terminal page unavailable"
            );
            (StatusCode::NOT_FOUND, "Terminal page not found").into_response()
        }
    }
}
