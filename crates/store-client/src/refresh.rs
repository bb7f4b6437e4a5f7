//! Token refresh operation
//!
//! Exchanges the stored refresh token for a new access token (and possibly a
//! rotated refresh token), persists the pair, then fetches and persists the
//! profile that belongs to the new token.
//!
//! Failure classification:
//! - no refresh token stored → terminal, no network call
//! - 401 from the refresh or profile endpoint → terminal (session expired)
//! - 403 from the refresh or profile endpoint → terminal (account inactive)
//! - anything else → transient, stored credentials left untouched
//!
//! Terminal failures clear the credential store before returning. The one
//! exception is a session that ended while the refresh was in flight (logout
//! or a new login): its results are discarded and the store is left alone.

use common::Secret;
use store_auth::{PROFILE_PATH, ProfileResponse, REFRESH_PATH, RefreshResponse, User};
use tracing::{debug, info, warn};
use transport::{ApiRequest, ApiResponse};

use crate::client::{AuthenticatedHttpClient, decode, into_result};
use crate::error::{AuthFailure, Error, Result};
use crate::interceptor::Credentials;
use crate::metrics::{self, RefreshOutcome};

/// The session produced by a successful refresh.
#[derive(Debug, Clone)]
pub struct RefreshedSession {
    pub access_token: Secret<String>,
    /// The rotated refresh token, or the previous one when not rotated.
    pub refresh_token: Secret<String>,
    pub user: User,
}

/// Terminal classification of an auth endpoint response.
pub(crate) fn rejection(response: &ApiResponse) -> Option<AuthFailure> {
    let message = || {
        response
            .error_message()
            .unwrap_or_else(|| format!("status {}", response.status))
    };
    match response.status {
        401 => Some(AuthFailure::SessionExpired(message())),
        403 => Some(AuthFailure::AccountInactive(message())),
        _ => None,
    }
}

impl AuthenticatedHttpClient {
    /// Run one refresh. Callers must hold the coordinator's leadership.
    pub(crate) async fn perform_refresh(&self) -> Result<RefreshedSession> {
        debug!("refreshing access token");
        let outcome = self.exchange_refresh_token().await;
        match &outcome {
            Ok(session) => {
                metrics::record_refresh(RefreshOutcome::Success);
                info!(user_id = session.user.id_user, "token refresh succeeded");
            }
            Err(Error::AuthenticationFailed(AuthFailure::SessionEnded)) => {
                metrics::record_refresh(RefreshOutcome::Terminal);
                info!("session ended during token refresh, result discarded");
            }
            Err(e) if e.is_terminal() => {
                metrics::record_refresh(RefreshOutcome::Terminal);
                warn!(error = %e, "token refresh rejected, session cleared");
            }
            Err(e) => {
                metrics::record_refresh(RefreshOutcome::Transient);
                warn!(error = %e, "token refresh failed (transient), credentials kept");
            }
        }
        outcome
    }

    async fn exchange_refresh_token(&self) -> Result<RefreshedSession> {
        let store = self.credential_store();

        // The generation ties every write below to the session being refreshed
        let tokens = store.tokens().await?;
        let generation = tokens.generation;
        let Some(refresh_token) = tokens.refresh_token else {
            self.expire_session_of(generation).await;
            return Err(Error::AuthenticationFailed(AuthFailure::NoRefreshToken));
        };
        let refresh_token = Secret::new(refresh_token);

        let response = self
            .dispatch(
                &ApiRequest::get(REFRESH_PATH),
                &Credentials::refresh(refresh_token.clone()),
            )
            .await?;

        if let Some(failure) = rejection(&response) {
            self.expire_session_of(generation).await;
            return Err(Error::AuthenticationFailed(failure));
        }
        if !response.is_success() {
            let message = response
                .error_message()
                .unwrap_or_else(|| response.text());
            return Err(Error::RefreshFailed(format!(
                "refresh endpoint returned {}: {message}",
                response.status
            )));
        }

        let body: RefreshResponse = response
            .json()
            .map_err(|e| Error::RefreshFailed(format!("invalid refresh response: {e}")))?;
        let access_token = body
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::RefreshFailed("no access token in refresh response".into()))?;
        let rotated = body.refresh_token.filter(|t| !t.is_empty());

        // Access and refresh token land together, before the profile fetch
        store
            .store_tokens(generation, access_token.clone(), rotated.clone())
            .await?;
        let access_token = Secret::new(access_token);

        let user = match self.fetch_profile_with(&access_token).await {
            Ok(user) => user,
            Err(e) => {
                if e.is_terminal() {
                    self.expire_session_of(generation).await;
                }
                return Err(e);
            }
        };
        store.store_user(generation, user.clone()).await?;

        Ok(RefreshedSession {
            access_token,
            refresh_token: rotated.map(Secret::new).unwrap_or(refresh_token),
            user,
        })
    }

    /// `GET /auth/profile` with an explicit access token, outside refresh
    /// coordination. 401/403 come back as `AuthenticationFailed`.
    pub(crate) async fn fetch_profile_with(&self, access_token: &Secret<String>) -> Result<User> {
        let response = self
            .dispatch(&ApiRequest::get(PROFILE_PATH), &Credentials::bearer(access_token))
            .await?;
        if let Some(failure) = rejection(&response) {
            return Err(Error::AuthenticationFailed(failure));
        }
        let response = into_result(response)?;
        let profile: ProfileResponse = decode(&response)?;
        Ok(profile.user)
    }
}
