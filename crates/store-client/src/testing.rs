//! In-process backend double for client tests.
//!
//! Mimics the `/auth/*` endpoints and a handful of protected routes. The
//! backend accepts exactly one access token at a time; a refresh or login
//! issues `at_<n>` / `rt_<n>` for the next generation `n`.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use store_auth::{
    CredentialStore, LOGIN_PATH, LOGOUT_ALL_PATH, LOGOUT_PATH, MemoryCredentialStore, PROFILE_PATH,
    REFRESH_PATH, User, UserRole,
};
use tokio::sync::Semaphore;
use transport::{ApiRequest, ApiResponse, RequestBody, Transport};

use crate::client::AuthenticatedHttpClient;

/// Always answers 401, whatever the token.
pub(crate) const ALWAYS_UNAUTHORIZED: &str = "/always-unauthorized";
/// Always answers 500.
pub(crate) const SERVER_ERROR: &str = "/server-error";
/// Protected route that takes `SLOW_RESPONSE` to answer a valid token.
pub(crate) const SLOW: &str = "/slow-report";
pub(crate) const SLOW_RESPONSE: Duration = Duration::from_secs(10);
pub(crate) const GOOD_PASSWORD: &str = "correct-horse";

#[derive(Debug, Clone, Copy)]
pub(crate) enum RefreshBehavior {
    /// New access and refresh token.
    Rotate,
    /// New access token only.
    KeepRefreshToken,
    /// Answer with this status.
    Reject(u16),
    /// 200 with `{}`.
    EmptyBody,
}

struct BackendState {
    generation: u32,
    /// `None` once the current token has been expired by the test.
    valid_access: Option<String>,
    calls: Vec<ApiRequest>,
}

pub(crate) struct FakeBackend {
    behavior: RefreshBehavior,
    state: Mutex<BackendState>,
    refresh_gate: Option<Arc<Semaphore>>,
    reject_profiles: AtomicBool,
}

impl FakeBackend {
    /// Backend that currently accepts `at_1`.
    pub(crate) fn new(behavior: RefreshBehavior) -> Self {
        Self {
            behavior,
            state: Mutex::new(BackendState {
                generation: 1,
                valid_access: Some("at_1".into()),
                calls: Vec::new(),
            }),
            refresh_gate: None,
            reject_profiles: AtomicBool::new(false),
        }
    }

    /// Refresh calls block until the returned semaphore gets a permit.
    pub(crate) fn gated(behavior: RefreshBehavior) -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let mut backend = Self::new(behavior);
        backend.refresh_gate = Some(gate.clone());
        (backend, gate)
    }

    /// Stop accepting the current access token, as if it expired.
    pub(crate) fn expire_access_token(&self) {
        self.state.lock().unwrap().valid_access = None;
    }

    pub(crate) fn reject_profiles(&self, reject: bool) {
        self.reject_profiles.store(reject, Ordering::SeqCst);
    }

    pub(crate) fn calls(&self) -> Vec<ApiRequest> {
        self.state.lock().unwrap().calls.clone()
    }

    pub(crate) fn calls_to(&self, path: &str) -> Vec<ApiRequest> {
        self.calls().into_iter().filter(|r| r.targets(path)).collect()
    }

    pub(crate) fn refresh_calls(&self) -> usize {
        self.calls_to(REFRESH_PATH).len()
    }

    fn next_generation(&self) -> u32 {
        let mut state = self.state.lock().unwrap();
        state.generation += 1;
        state.valid_access = Some(format!("at_{}", state.generation));
        state.generation
    }

    fn bearer_is_valid(&self, request: &ApiRequest) -> bool {
        let state = self.state.lock().unwrap();
        let presented = request
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok());
        match (&state.valid_access, presented) {
            (Some(valid), Some(presented)) => presented == format!("Bearer {valid}"),
            _ => false,
        }
    }

    async fn respond(&self, request: &ApiRequest) -> ApiResponse {
        self.state.lock().unwrap().calls.push(request.clone());

        match request.route() {
            REFRESH_PATH => {
                if let Some(gate) = &self.refresh_gate {
                    gate.acquire().await.unwrap().forget();
                }
                self.refresh()
            }
            LOGIN_PATH => self.login(request),
            PROFILE_PATH => {
                if !self.reject_profiles.load(Ordering::SeqCst) && self.bearer_is_valid(request) {
                    let user = test_user(1);
                    ApiResponse::json_body(200, &serde_json::json!({ "user": user }))
                } else {
                    unauthorized()
                }
            }
            ALWAYS_UNAUTHORIZED => unauthorized(),
            SLOW => {
                if !self.bearer_is_valid(request) {
                    return unauthorized();
                }
                tokio::time::sleep(SLOW_RESPONSE).await;
                ApiResponse::json_body(200, &serde_json::json!({ "path": SLOW }))
            }
            SERVER_ERROR => ApiResponse::json_body(500, &serde_json::json!({"message": "boom"})),
            LOGOUT_PATH | LOGOUT_ALL_PATH => ApiResponse::json_body(201, &serde_json::json!({})),
            route => {
                if self.bearer_is_valid(request) {
                    ApiResponse::json_body(200, &serde_json::json!({ "path": route }))
                } else {
                    unauthorized()
                }
            }
        }
    }

    fn refresh(&self) -> ApiResponse {
        match self.behavior {
            RefreshBehavior::Rotate => {
                let n = self.next_generation();
                ApiResponse::json_body(
                    200,
                    &serde_json::json!({
                        "access_token": format!("at_{n}"),
                        "refresh_token": format!("rt_{n}"),
                    }),
                )
            }
            RefreshBehavior::KeepRefreshToken => {
                let n = self.next_generation();
                let body = serde_json::json!({ "access_token": format!("at_{n}") });
                ApiResponse::json_body(200, &body)
            }
            RefreshBehavior::Reject(status) => {
                let body = serde_json::json!({"message": "Invalid refresh token"});
                ApiResponse::json_body(status, &body)
            }
            RefreshBehavior::EmptyBody => ApiResponse::json_body(200, &serde_json::json!({})),
        }
    }

    fn login(&self, request: &ApiRequest) -> ApiResponse {
        let password = match &request.body {
            RequestBody::Json(body) => body["password"].as_str().unwrap_or_default().to_string(),
            _ => String::new(),
        };
        if password != GOOD_PASSWORD {
            let body = serde_json::json!({"message": "Invalid credentials"});
            return ApiResponse::json_body(401, &body);
        }
        let n = self.next_generation();
        ApiResponse::json_body(
            200,
            &serde_json::json!({
                "access_token": format!("at_{n}"),
                "refresh_token": format!("rt_{n}"),
                "message": "Login successful",
            }),
        )
    }
}

impl Transport for FakeBackend {
    fn send<'a>(
        &'a self,
        request: &'a ApiRequest,
    ) -> Pin<Box<dyn Future<Output = transport::Result<ApiResponse>> + Send + 'a>> {
        Box::pin(async move { Ok(self.respond(request).await) })
    }
}

fn unauthorized() -> ApiResponse {
    ApiResponse::json_body(401, &serde_json::json!({"message": "Unauthorized"}))
}

pub(crate) fn test_user(id: u64) -> User {
    User {
        id_user: id,
        user_name: format!("user-{id}"),
        email_address: format!("user{id}@example.com"),
        user_role: UserRole::Employee,
        is_active: true,
        last_login_at: None,
        store: None,
    }
}

/// Store holding `at_1` / `rt_1` and `test_user(1)`.
pub(crate) async fn session_store() -> Arc<MemoryCredentialStore> {
    let store = Arc::new(MemoryCredentialStore::new());
    store
        .save_session("at_1".into(), "rt_1".into(), test_user(1))
        .await
        .unwrap();
    store
}

pub(crate) async fn client_with_session(
    behavior: RefreshBehavior,
) -> (Arc<FakeBackend>, Arc<MemoryCredentialStore>, AuthenticatedHttpClient) {
    let backend = Arc::new(FakeBackend::new(behavior));
    let store = session_store().await;
    let client = AuthenticatedHttpClient::new(backend.clone(), store.clone());
    (backend, store, client)
}

/// Yield until `condition` holds. Panics after many rounds so a broken test
/// fails instead of hanging.
pub(crate) async fn until(mut condition: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}
