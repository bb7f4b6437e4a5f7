//! Request interceptor
//!
//! Attaches the right credential to every outgoing request:
//! - the refresh endpoint gets the raw refresh token in `x-refresh-token`
//!   and never an `Authorization` header
//! - public endpoints (login) go out without credentials
//! - every other endpoint gets `Authorization: Bearer <access token>` when an
//!   access token is stored
//!
//! JSON bodies get `Content-Type: application/json`. Multipart bodies have any
//! preset content type removed so the transport can write the boundary.

use common::Secret;
use store_auth::{CredentialStore, LOGIN_PATH, REFRESH_PATH, REFRESH_TOKEN_HEADER, StoredTokens};
use tracing::warn;
use transport::{ApiRequest, HeaderName, HeaderValue, RequestBody, header};

use crate::error::{Error, Result};

/// How the client authenticates a request, by route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    /// `/auth/refresh`: refresh-token header, exempt from refresh coordination.
    Refresh,
    /// No credentials; a 401 here is an ordinary failure (bad password).
    Public,
    /// Bearer-authenticated; a 401 triggers refresh coordination.
    Protected,
}

impl EndpointKind {
    pub fn of(request: &ApiRequest) -> Self {
        match request.route() {
            REFRESH_PATH => EndpointKind::Refresh,
            LOGIN_PATH => EndpointKind::Public,
            _ => EndpointKind::Protected,
        }
    }
}

/// Snapshot of the stored tokens taken right before a request is sent.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub access_token: Option<Secret<String>>,
    pub refresh_token: Option<Secret<String>>,
}

impl Credentials {
    pub fn none() -> Self {
        Self::default()
    }

    /// Only an access token, used to replay a request after a refresh.
    pub fn bearer(access_token: &Secret<String>) -> Self {
        Self {
            access_token: Some(access_token.clone()),
            refresh_token: None,
        }
    }

    /// Only a refresh token, used for the refresh call itself.
    pub fn refresh(refresh_token: Secret<String>) -> Self {
        Self {
            access_token: None,
            refresh_token: Some(refresh_token),
        }
    }
}

/// Read the current token pair from the store in one step.
///
/// A failing read is logged and treated as absent tokens: the request goes
/// out unauthenticated and any resulting 401 is handled by the coordinator.
pub async fn load_credentials(store: &dyn CredentialStore) -> Credentials {
    let tokens = store.tokens().await.unwrap_or_else(|e| {
        warn!(error = %e, "failed to read tokens");
        StoredTokens::default()
    });
    Credentials {
        access_token: tokens.access_token.map(Secret::new),
        refresh_token: tokens.refresh_token.map(Secret::new),
    }
}

/// Produce the request as it goes on the wire. `request` is not modified.
pub fn attach_credentials(request: &ApiRequest, credentials: &Credentials) -> Result<ApiRequest> {
    let mut prepared = request.clone();

    match EndpointKind::of(request) {
        EndpointKind::Refresh => {
            prepared.headers.remove(header::AUTHORIZATION);
            if let Some(refresh) = &credentials.refresh_token {
                prepared.headers.insert(
                    HeaderName::from_static(REFRESH_TOKEN_HEADER),
                    sensitive_value(refresh.expose(), "refresh token")?,
                );
            }
        }
        EndpointKind::Public => {}
        EndpointKind::Protected => {
            if let Some(access) = &credentials.access_token {
                prepared.headers.insert(
                    header::AUTHORIZATION,
                    sensitive_value(&format!("Bearer {}", access.expose()), "access token")?,
                );
            }
        }
    }

    match &prepared.body {
        RequestBody::Json(_) => {
            if !prepared.headers.contains_key(header::CONTENT_TYPE) {
                prepared.headers.insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("application/json"),
                );
            }
        }
        RequestBody::Multipart(_) => {
            prepared.headers.remove(header::CONTENT_TYPE);
        }
        RequestBody::Empty => {}
    }

    Ok(prepared)
}

fn sensitive_value(raw: &str, what: &str) -> Result<HeaderValue> {
    let mut value = HeaderValue::from_str(raw)
        .map_err(|e| Error::Credential(format!("stored {what} is not a valid header value: {e}")))?;
    value.set_sensitive(true);
    Ok(value)
}
