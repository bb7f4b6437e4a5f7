//! Authenticated HTTP client for the StoreManager API
//!
//! Every request goes through the same pipeline:
//! 1. The interceptor attaches the stored access token, or the refresh token
//!    for the refresh endpoint.
//! 2. The transport performs the call.
//! 3. A 401 from a protected endpoint enters refresh coordination. One
//!    refresh runs at a time, requests that fail meanwhile queue behind it,
//!    and every one of them is replayed once with the new token.
//!
//! A rejected refresh clears the stored session and surfaces
//! `Error::AuthenticationFailed` to every waiting caller. Network and server
//! errors during refresh leave the session intact.

pub mod client;
mod coordinator;
pub mod error;
pub mod interceptor;
pub mod metrics;
pub mod refresh;
pub mod session;

#[cfg(test)]
mod testing;

pub use client::{AuthenticatedHttpClient, ClientConfig};
pub use error::{AuthFailure, Error, Result};
pub use interceptor::{Credentials, EndpointKind};
pub use refresh::RefreshedSession;
pub use session::{AuthService, SessionState, bootstrap};
