//! Session lifecycle: bootstrap, login, logout and account operations

use common::Secret;
use store_auth::{
    CHANGE_PASSWORD_PATH, ChangePasswordRequest, CredentialStore, LOGIN_PATH, LOGOUT_ALL_PATH,
    LOGOUT_PATH, LoginRequest, LoginResponse, PROFILE_PATH, ProfileResponse, User,
};
use tracing::{debug, info, warn};
use transport::ApiRequest;

use crate::client::{AuthenticatedHttpClient, decode};
use crate::error::{Error, Result};
use crate::interceptor::Credentials;

/// What the persisted credentials say at process start.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    /// An access token and a profile are stored. The token may still have
    /// expired; the first 401 goes through refresh coordination.
    Authenticated { user: User },
    Anonymous,
}

impl SessionState {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, SessionState::Authenticated { .. })
    }

    pub fn user(&self) -> Option<&User> {
        match self {
            SessionState::Authenticated { user } => Some(user),
            SessionState::Anonymous => None,
        }
    }
}

/// Read the persisted session without any network call.
///
/// Unreadable entries (a profile that no longer parses, a failing store)
/// count as no session; they are logged and left for the next login to
/// overwrite.
pub async fn bootstrap(store: &dyn CredentialStore) -> SessionState {
    let access_token = match store.access_token().await {
        Ok(token) => token,
        Err(e) => {
            warn!(error = %e, "failed to read stored access token");
            return SessionState::Anonymous;
        }
    };
    if access_token.is_none() {
        debug!("no stored session");
        return SessionState::Anonymous;
    }

    match store.user().await {
        Ok(Some(user)) => {
            debug!(user_id = user.id_user, "restored stored session");
            SessionState::Authenticated { user }
        }
        Ok(None) => {
            debug!("access token stored without profile");
            SessionState::Anonymous
        }
        Err(e) => {
            warn!(error = %e, "stored profile unreadable, treating as signed out");
            SessionState::Anonymous
        }
    }
}

impl AuthenticatedHttpClient {
    /// `bootstrap()` over this client's credential store.
    pub async fn bootstrap(&self) -> SessionState {
        bootstrap(self.credential_store().as_ref()).await
    }
}

/// Account operations of the `/auth/*` endpoints.
#[derive(Clone)]
pub struct AuthService {
    client: AuthenticatedHttpClient,
}

impl AuthService {
    pub fn new(client: AuthenticatedHttpClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &AuthenticatedHttpClient {
        &self.client
    }

    /// Exchange email and password for a session.
    ///
    /// The token pair and the profile are persisted together once the profile
    /// fetch succeeds. A 401 here is a rejected password, returned as
    /// `Error::Status`; it never starts a refresh. When the server rejects the
    /// fresh token on the profile fetch, any previously stored session is
    /// cleared along with it.
    pub async fn login(&self, email: &str, password: &Secret<String>) -> Result<User> {
        let body = LoginRequest {
            email: email.to_string(),
            password: password.expose().clone(),
        };
        let body = serde_json::to_value(&body)
            .map_err(|e| Error::Decode(format!("encoding login request: {e}")))?;

        let response = self
            .client
            .dispatch(&ApiRequest::post(LOGIN_PATH).with_json(body), &Credentials::none())
            .await?;
        if !response.is_success() {
            return Err(Error::Status {
                status: response.status,
                message: response
                    .error_message()
                    .unwrap_or_else(|| "Login failed".to_string()),
            });
        }
        let login: LoginResponse = decode(&response)?;

        let access_token = Secret::new(login.access_token);
        let user = match self.client.fetch_profile_with(&access_token).await {
            Ok(user) => user,
            Err(e) => {
                if e.is_terminal() {
                    self.client.expire_session().await;
                }
                return Err(e);
            }
        };
        self.client
            .credential_store()
            .save_session(access_token.expose().clone(), login.refresh_token, user.clone())
            .await?;

        info!(user_id = user.id_user, role = user.user_role.label(), "logged in");
        Ok(user)
    }

    /// End the session. The server call is best-effort; local credentials
    /// are cleared whatever it returns.
    pub async fn logout(&self) -> Result<()> {
        self.end_session(LOGOUT_PATH).await
    }

    /// End every session of this user on every device.
    pub async fn logout_all(&self) -> Result<()> {
        self.end_session(LOGOUT_ALL_PATH).await
    }

    async fn end_session(&self, path: &str) -> Result<()> {
        if let Err(e) = self.client.send(ApiRequest::post(path)).await {
            warn!(path, error = %e, "server logout failed, clearing local session anyway");
        }
        self.client.credential_store().clear().await?;
        info!(path, "logged out");
        Ok(())
    }

    /// Fetch the profile and refresh the cached copy.
    ///
    /// The copy is not written when the session ended (logout, another login)
    /// while the fetch was in flight.
    pub async fn profile(&self) -> Result<User> {
        let store = self.client.credential_store();
        let generation = store.tokens().await?.generation;
        let profile: ProfileResponse = self.client.get(PROFILE_PATH).await?;
        store.store_user(generation, profile.user.clone()).await?;
        Ok(profile.user)
    }

    pub async fn change_password(
        &self,
        old_password: &Secret<String>,
        new_password: &Secret<String>,
    ) -> Result<()> {
        let body = ChangePasswordRequest {
            old_password: old_password.expose().clone(),
            new_password: new_password.expose().clone(),
        };
        let _: serde_json::Value = self.client.patch(CHANGE_PASSWORD_PATH, &body).await?;
        info!("password changed");
        Ok(())
    }
}
