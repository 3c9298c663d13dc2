//! Credential store & authenticator
//!
//! A pure function of the immutable credential table: no runtime mutation,
//! no interior mutability needed. Modeled as a sum type rather than a
//! trait-object hierarchy, since there are exactly two variants and neither
//! needs to be extended by downstream crates.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::AuthConfig;

/// The fixed 407 response body. `Content-Length: 39` matches this exact
/// byte count — do not reflow or otherwise change this string.
const PROXY_AUTH_REQUIRED_BODY: &str = "Proxy Authentication Required\r\n";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing or empty Proxy-Authorization header")]
    MissingHeader,
    #[error("Proxy-Authorization header is not well-formed Basic auth")]
    MalformedHeader,
}

/// Authenticator variants: either every credential is accepted, or
/// credentials are checked against a fixed username → password table.
#[derive(Debug, Clone)]
pub enum Authenticator {
    None,
    Basic {
        realm: String,
        users: Arc<HashMap<String, String>>,
    },
}

impl Authenticator {
    /// Build an authenticator from the optional `auth:` config block.
    /// A missing block, or one with `enabled: false`, yields `None`.
    pub fn from_config(config: Option<&AuthConfig>) -> Self {
        match config {
            Some(cfg) if cfg.enabled => Authenticator::Basic {
                realm: cfg.realm.clone(),
                users: Arc::new(cfg.users.clone()),
            },
            _ => Authenticator::None,
        }
    }

    pub fn enabled(&self) -> bool {
        matches!(self, Authenticator::Basic { .. })
    }

    /// Constant-shape lookup: true iff both are present and equal.
    pub fn verify(&self, username: &str, password: &str) -> bool {
        match self {
            Authenticator::None => true,
            Authenticator::Basic { users, .. } => {
                users.get(username).is_some_and(|expected| expected == password)
            }
        }
    }

    /// SOCKS5 username/password subauth delegates straight to `verify`.
    pub fn socks5_auth(&self, username: &str, password: &str) -> bool {
        self.verify(username, password)
    }

    /// Parse the `Proxy-Authorization` header value: `"Basic base64(user:pass)"`.
    ///
    /// Requires exactly two whitespace-separated tokens, the first matching
    /// `basic` case-insensitively. The second is base64-decoded, interpreted
    /// as UTF-8, then split on the *first* `:` only. Never panics on
    /// malformed input — every failure mode returns `Err`.
    pub fn parse_http_proxy_auth(header_value: &str) -> Result<(String, String), AuthError> {
        if header_value.trim().is_empty() {
            return Err(AuthError::MissingHeader);
        }
        let parts: Vec<&str> = header_value.split_whitespace().collect();
        if parts.len() != 2 || !parts[0].eq_ignore_ascii_case("basic") {
            return Err(AuthError::MalformedHeader);
        }
        let decoded = BASE64
            .decode(parts[1])
            .map_err(|_| AuthError::MalformedHeader)?;
        let decoded = String::from_utf8(decoded).map_err(|_| AuthError::MalformedHeader)?;
        let (user, pass) = decoded
            .split_once(':')
            .ok_or(AuthError::MalformedHeader)?;
        Ok((user.to_string(), pass.to_string()))
    }

    /// Authenticate an incoming HTTP proxy request against the
    /// `Proxy-Authorization` header, if auth is enabled. Returns the
    /// authenticated username on success, for access-log purposes; returns
    /// `Ok(None)` immediately when auth is disabled without inspecting the
    /// header at all.
    pub fn authenticate_http(
        &self,
        header_value: Option<&str>,
    ) -> Result<Option<String>, AuthError> {
        if !self.enabled() {
            return Ok(None);
        }
        let header = header_value.ok_or(AuthError::MissingHeader)?;
        let (user, pass) = Self::parse_http_proxy_auth(header)?;
        if self.verify(&user, &pass) {
            Ok(Some(user))
        } else {
            Err(AuthError::MalformedHeader)
        }
    }

    /// The literal 407 response, realm taken from this authenticator.
    ///
    /// `Content-Length: 39` is fixed by the wire contract, not derived from
    /// `PROXY_AUTH_REQUIRED_BODY.len()` (which is 31) — this mismatch is
    /// inherited verbatim from the source this proxy was built to match.
    pub fn build_407(&self) -> Vec<u8> {
        let realm = match self {
            Authenticator::Basic { realm, .. } => realm.as_str(),
            Authenticator::None => "Triproxy",
        };
        format!(
            "HTTP/1.1 407 Proxy Authentication Required\r\n\
             Proxy-Authenticate: Basic realm=\"{realm}\"\r\n\
             Content-Type: text/plain\r\n\
             Content-Length: 39\r\n\
             Connection: close\r\n\
             \r\n\
             {body}",
            body = PROXY_AUTH_REQUIRED_BODY,
        )
        .into_bytes()
    }
}
