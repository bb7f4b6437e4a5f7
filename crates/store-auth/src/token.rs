//! Wire types of the `/auth/*` endpoints
//!
//! Token responses use snake_case (`access_token`), the user profile uses
//! the backend's camelCase field names (`idUser`, `emailAddress`).

use serde::{Deserialize, Serialize};

/// Body of `POST /auth/login`.
#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// Response of `POST /auth/login`.
#[derive(Debug, Deserialize, Serialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub message: String,
}

/// Response of `GET /auth/refresh`.
///
/// Both fields are optional on the wire: a missing `access_token` is a
/// malformed response, a missing `refresh_token` means the server did not
/// rotate it and the stored one stays valid.
#[derive(Debug, Deserialize, Serialize)]
pub struct RefreshResponse {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// Response of `GET /auth/profile`.
#[derive(Debug, Deserialize, Serialize)]
pub struct ProfileResponse {
    pub user: User,
}

/// Body of `PATCH /auth/change-password`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePasswordRequest {
    pub old_password: String,
    pub new_password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    Manager,
    Employee,
}

impl UserRole {
    pub fn label(&self) -> &'static str {
        match self {
            UserRole::Admin => "admin",
            UserRole::Manager => "manager",
            UserRole::Employee => "employee",
        }
    }
}

/// Authenticated user as returned by `/auth/profile`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id_user: u64,
    pub user_name: String,
    pub email_address: String,
    pub user_role: UserRole,
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_login_at: Option<String>,
    /// Store the user is attached to, passed through untyped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store: Option<serde_json::Value>,
}
