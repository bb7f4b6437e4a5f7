//! StoreManager authentication data and credential storage
//!
//! Holds the auth endpoint and header constants, the JSON wire types of the
//! `/auth/*` endpoints, and the `CredentialStore` that owns the access token,
//! refresh token and cached user profile. The API client re-reads the store
//! before every request and is the only writer besides login/logout.
//!
//! Credential lifecycle:
//! 1. `POST /auth/login` → `CredentialStore::save_session()` (all three fields)
//! 2. Authenticated calls read `CredentialStore::access_token()`
//! 3. `GET /auth/refresh` → `store_tokens()` then `store_user()`, both refused once a logout
//!    or new login has started another session generation
//! 4. Logout or a rejected refresh → `CredentialStore::clear()` (all three fields)

pub mod constants;
pub mod credentials;
pub mod error;
pub mod token;

pub use constants::*;
pub use credentials::{CredentialStore, FileCredentialStore, MemoryCredentialStore, StoredTokens};
pub use error::{Error, Result};
pub use token::{
    ChangePasswordRequest, LoginRequest, LoginResponse, ProfileResponse, RefreshResponse, User,
    UserRole,
};
