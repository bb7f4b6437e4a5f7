//! Auth endpoint paths, header names and storage keys

/// Exchange email/password for a token pair. Never carries a bearer token.
pub const LOGIN_PATH: &str = "/auth/login";

/// Exchange the refresh token for a new pair. Authenticated by
/// `REFRESH_TOKEN_HEADER`, never by `Authorization`.
pub const REFRESH_PATH: &str = "/auth/refresh";

/// Current user profile, bearer-authenticated.
pub const PROFILE_PATH: &str = "/auth/profile";

/// Best-effort server-side session revocation.
pub const LOGOUT_PATH: &str = "/auth/logout";

/// Revoke every session of the current user.
pub const LOGOUT_ALL_PATH: &str = "/auth/logout-all";

pub const CHANGE_PASSWORD_PATH: &str = "/auth/change-password";

/// Header carrying the raw refresh token on `REFRESH_PATH`.
pub const REFRESH_TOKEN_HEADER: &str = "x-refresh-token";

/// Storage key of the access token.
pub const ACCESS_TOKEN_KEY: &str = "@access_token";

/// Storage key of the refresh token.
pub const REFRESH_TOKEN_KEY: &str = "@refresh_token";

/// Storage key of the JSON-serialized user profile.
pub const USER_DATA_KEY: &str = "@user_data";
