//! Authenticated HTTP client
//!
//! Request pipeline:
//! 1. read the current tokens from the credential store
//! 2. `interceptor::attach_credentials()` (bearer or refresh-token header)
//! 3. send through the `Transport`
//! 4. settle the response:
//!    - not a 401, or a public endpoint → delivered as-is
//!    - 401 from the refresh endpoint → credentials cleared, terminal error
//!    - 401 on a first attempt → refresh coordination (`recover`)
//!    - 401 on a replay → delivered as-is, never retried a second time
//!
//! `recover` either leads the single in-flight refresh or queues behind it.
//! Once the refresh settles every caller replays its own request with the new
//! access token: the leader first, then queued requests in enqueue order, each
//! starting as soon as the one before it has started. A failed refresh rejects
//! the leader and every queued request with the same error.
//!
//! `ClientConfig::refresh_wait_timeout` bounds only the wait for the refresh
//! outcome. A replay that has been sent is never cut short by it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::Secret;
use serde::Serialize;
use serde::de::DeserializeOwned;
use store_auth::CredentialStore;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};
use transport::{ApiRequest, ApiResponse, MultipartPart, StatusCode, Transport};

use crate::coordinator::{
    QueuedReplay, RefreshAdmission, RefreshCoordinator, RefreshGuard, ReplayTurn,
    RequestAdmission,
};
use crate::error::{AuthFailure, Error, Result};
use crate::interceptor::{Credentials, EndpointKind, attach_credentials, load_credentials};
use crate::metrics;
use crate::refresh::{RefreshedSession, rejection};

/// Tuning knobs of the client.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// How long a request queued behind an in-flight refresh waits for the
    /// refresh outcome before failing with `RefreshWaitTimeout`. `None` waits
    /// until the refresh settles. The replay itself is not covered.
    pub refresh_wait_timeout: Option<Duration>,
}

/// What to do with a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    /// Hand the response (or its status error) to the caller.
    Deliver,
    /// The refresh endpoint rejected us: clear credentials, terminal error.
    ExpireSession,
    /// First 401 on a protected endpoint: refresh and replay.
    Refresh,
}

/// Decide how a response is settled. `retried` is true for a replay, which
/// is never sent through another refresh.
pub(crate) fn disposition(
    request: &ApiRequest,
    response: &ApiResponse,
    retried: bool,
) -> Disposition {
    if !response.is_unauthorized() {
        return Disposition::Deliver;
    }
    match EndpointKind::of(request) {
        EndpointKind::Refresh => Disposition::ExpireSession,
        EndpointKind::Public => Disposition::Deliver,
        EndpointKind::Protected if retried => Disposition::Deliver,
        EndpointKind::Protected => Disposition::Refresh,
    }
}

/// Non-2xx responses become `Error::Status` carrying the server's message.
pub(crate) fn into_result(response: ApiResponse) -> Result<ApiResponse> {
    if response.is_success() {
        return Ok(response);
    }
    let message = response.error_message().unwrap_or_else(|| {
        StatusCode::from_u16(response.status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("unexpected status")
            .to_string()
    });
    Err(Error::Status {
        status: response.status,
        message,
    })
}

pub(crate) fn decode<T: DeserializeOwned>(response: &ApiResponse) -> Result<T> {
    response.json().map_err(|e| {
        Error::Decode(format!("decoding response (status {}): {e}", response.status))
    })
}

fn encode<B: Serialize + ?Sized>(body: &B) -> Result<serde_json::Value> {
    serde_json::to_value(body).map_err(|e| Error::Decode(format!("encoding request body: {e}")))
}

fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().as_simple())
}

struct Inner {
    transport: Arc<dyn Transport>,
    store: Arc<dyn CredentialStore>,
    coordinator: RefreshCoordinator,
    config: ClientConfig,
}

/// HTTP client that authenticates requests and recovers expired sessions.
///
/// Cheap to clone; clones share the transport, the credential store and the
/// refresh state, so a refresh started through one clone is joined by all.
#[derive(Clone)]
pub struct AuthenticatedHttpClient {
    inner: Arc<Inner>,
}

impl AuthenticatedHttpClient {
    pub fn new(transport: Arc<dyn Transport>, store: Arc<dyn CredentialStore>) -> Self {
        Self::with_config(transport, store, ClientConfig::default())
    }

    pub fn with_config(
        transport: Arc<dyn Transport>,
        store: Arc<dyn CredentialStore>,
        config: ClientConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                store,
                coordinator: RefreshCoordinator::new(),
                config,
            }),
        }
    }

    pub fn credential_store(&self) -> &Arc<dyn CredentialStore> {
        &self.inner.store
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Whether a refresh cycle is in flight.
    pub fn is_refreshing(&self) -> bool {
        self.inner.coordinator.is_refreshing()
    }

    /// Requests waiting on the in-flight refresh.
    pub fn queued_requests(&self) -> usize {
        self.inner.coordinator.queued()
    }

    /// Send a request through the full pipeline.
    ///
    /// Returns the final 2xx response. Intermediate 401s recovered by a
    /// refresh are never visible to the caller.
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
        let credentials = load_credentials(self.inner.store.as_ref()).await;
        let response = self.dispatch(&request, &credentials).await?;

        match disposition(&request, &response, false) {
            Disposition::Deliver => into_result(response),
            Disposition::ExpireSession => {
                self.expire_session().await;
                Err(Error::AuthenticationFailed(session_expired(&response)))
            }
            Disposition::Refresh => {
                debug!(path = %request.route(), "access token rejected, recovering");
                self.recover(request).await
            }
        }
    }

    /// Refresh the session explicitly.
    ///
    /// Joins the in-flight refresh when there is one, so at most one refresh
    /// call is ever outstanding.
    pub async fn refresh_session(&self) -> Result<RefreshedSession> {
        match self.inner.coordinator.admit_refresh() {
            RefreshAdmission::Joined(rx) => self.wait_for_cycle(rx).await,
            RefreshAdmission::Lead(guard) => self.lead_refresh(guard).await.0,
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send_json(ApiRequest::get(path)).await
    }

    pub async fn get_with_query<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let request = query
            .iter()
            .fold(ApiRequest::get(path), |r, (k, v)| r.with_query(*k, *v));
        self.send_json(request).await
    }

    pub async fn post<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.send_json(ApiRequest::post(path).with_json(encode(body)?))
            .await
    }

    /// POST without a body.
    pub async fn post_empty<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send_json(ApiRequest::post(path)).await
    }

    /// POST a multipart/form-data body (file imports).
    pub async fn post_multipart<T: DeserializeOwned>(
        &self,
        path: &str,
        parts: Vec<MultipartPart>,
    ) -> Result<T> {
        self.send_json(ApiRequest::post(path).with_multipart(parts))
            .await
    }

    pub async fn put<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.send_json(ApiRequest::put(path).with_json(encode(body)?))
            .await
    }

    pub async fn patch<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.send_json(ApiRequest::patch(path).with_json(encode(body)?))
            .await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send_json(ApiRequest::delete(path)).await
    }

    async fn send_json<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T> {
        let response = self.send(request).await?;
        decode(&response)
    }

    /// Prepare and send one request, with no 401 handling.
    pub(crate) async fn dispatch(
        &self,
        request: &ApiRequest,
        credentials: &Credentials,
    ) -> Result<ApiResponse> {
        let prepared = attach_credentials(request, credentials)?;
        self.execute(&prepared, &new_request_id()).await
    }

    #[instrument(
        level = "debug",
        name = "api_request",
        skip_all,
        fields(request_id = %request_id, method = %request.method, path = %request.route())
    )]
    async fn execute(&self, request: &ApiRequest, request_id: &str) -> Result<ApiResponse> {
        let started = Instant::now();
        let response = match self.inner.transport.send(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "transport error");
                return Err(Error::Transport(e));
            }
        };
        debug!(
            status = response.status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "response received"
        );
        metrics::record_response(response.status);
        Ok(response)
    }

    async fn recover(&self, request: ApiRequest) -> Result<ApiResponse> {
        let (session, mut turn) = match self.inner.coordinator.admit_request(request.route()) {
            RequestAdmission::Queued(rx) => {
                let QueuedReplay { session, turn } = self.wait_for_cycle(rx).await?;
                (session, turn)
            }
            RequestAdmission::Lead(guard) => {
                let (outcome, turn) = self.lead_refresh(guard).await;
                (outcome?, turn)
            }
        };

        turn.wait().await;
        turn.pass();
        self.replay(request, &session.access_token).await
    }

    /// Run the refresh of the cycle `guard` leads and hand its outcome to every
    /// waiter. Also returns the leader's replay turn.
    async fn lead_refresh(
        &self,
        guard: RefreshGuard<'_>,
    ) -> (Result<RefreshedSession>, ReplayTurn) {
        let outcome = self.perform_refresh().await;
        let turn = guard.settle().deliver(&outcome);
        (outcome, turn)
    }

    async fn replay(
        &self,
        request: ApiRequest,
        access_token: &Secret<String>,
    ) -> Result<ApiResponse> {
        metrics::record_replay();
        let response = self
            .dispatch(&request, &Credentials::bearer(access_token))
            .await?;

        match disposition(&request, &response, true) {
            Disposition::ExpireSession => {
                self.expire_session().await;
                Err(Error::AuthenticationFailed(session_expired(&response)))
            }
            Disposition::Deliver | Disposition::Refresh => {
                if response.is_unauthorized() {
                    debug!(
                        path = %request.route(),
                        "replayed request still unauthorized, not retrying"
                    );
                }
                into_result(response)
            }
        }
    }

    /// Wait for the outcome of the in-flight refresh.
    async fn wait_for_cycle<T>(&self, rx: oneshot::Receiver<Result<T>>) -> Result<T> {
        let received = match self.inner.config.refresh_wait_timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => {
                    warn!(
                        timeout_ms = limit.as_millis() as u64,
                        "gave up waiting for token refresh"
                    );
                    return Err(Error::RefreshWaitTimeout);
                }
            },
            None => rx.await,
        };
        received.unwrap_or(Err(Error::RefreshAbandoned))
    }

    /// Delete the stored session after a terminal auth failure.
    pub(crate) async fn expire_session(&self) {
        match self.inner.store.clear().await {
            Ok(()) => info!("session expired, credentials cleared"),
            Err(e) => warn!(error = %e, "failed to clear credentials"),
        }
    }

    /// `expire_session` for the session of `generation` only. A session that
    /// was started since is left in place.
    pub(crate) async fn expire_session_of(&self, generation: u64) {
        match self.inner.store.clear_session(generation).await {
            Ok(true) => info!("session expired, credentials cleared"),
            Ok(false) => debug!("session already replaced, nothing to clear"),
            Err(e) => warn!(error = %e, "failed to clear credentials"),
        }
    }
}

fn session_expired(response: &ApiResponse) -> AuthFailure {
    rejection(response)
        .unwrap_or_else(|| AuthFailure::SessionExpired(format!("status {}", response.status)))
}
