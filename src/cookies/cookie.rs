//! Cookie core types.
//!
//! This module defines the [`Cookie`] record held by the domain tree and the
//! backing store, the [`CookieRecord`] returned to inspection APIs, and the
//! [`CookieFilter`] that decides whether `HttpOnly` cookies are visible.
//!
//! All timestamps are epoch milliseconds. A cookie without an expiry is a
//! **session** cookie: it lives in memory only and never expires there.
//!
//! ```rust
//! use gosub_cookies::cookies::Cookie;
//!
//! let c = Cookie::new("session", "abc123", ".example.com", "/", "https", 1_000);
//! assert!(c.is_session());
//! assert!(!c.is_host_only());
//! assert!(!c.has_expired(2_000));
//! ```

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Maximum combined length of name and value.
pub const MAX_COOKIE_SIZE: usize = 4096;

/// Which cookies a caller is allowed to see or touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CookieFilter {
    /// HTTP-originated access: every cookie is visible.
    #[default]
    WithHttpOnlyCookies,
    /// Script-originated access: `HttpOnly` cookies are hidden and protected.
    NoHttpOnlyCookie,
}

impl CookieFilter {
    pub fn allows_http_only(self) -> bool {
        self == CookieFilter::WithHttpOnlyCookies
    }
}

/// A cookie as stored by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cookie {
    /// Cookie name (case-sensitive, may be empty for bare-value cookies).
    pub name: String,

    /// Raw cookie value (not unquoted, not URL-decoded).
    pub value: String,

    /// Lower-cased domain. A leading dot marks a domain cookie; without it the
    /// cookie is host-only. Empty for hostless URLs such as `file:`.
    pub domain: String,

    /// Path scoping, always starts with `/`.
    pub path: String,

    /// URL scheme the cookie was set over.
    pub protocol: String,

    /// Absolute expiry in epoch millis. `None` means session cookie.
    pub expiry: Option<i64>,

    pub creation_time: i64,

    /// Updated on every match; drives LRU eviction.
    pub last_accessed: i64,

    pub secure: bool,

    pub http_only: bool,

    /// Tombstone: the cookie must be removed whatever its expiry says.
    #[serde(default)]
    pub force_expired: bool,

    /// The domain is a literal IP address and must not be split on dots.
    #[serde(default)]
    pub domain_is_ip: bool,
}

impl Cookie {
    /// Creates a session cookie created (and last accessed) at `now`.
    pub fn new(
        name: impl Into<String>,
        value: impl Into<String>,
        domain: impl Into<String>,
        path: impl Into<String>,
        protocol: impl Into<String>,
        now: i64,
    ) -> Self {
        let domain = domain.into();
        let domain_is_ip = is_ip_address(&domain);

        Self {
            name: name.into(),
            value: value.into(),
            domain,
            path: path.into(),
            protocol: protocol.into(),
            expiry: None,
            creation_time: now,
            last_accessed: now,
            secure: false,
            http_only: false,
            force_expired: false,
            domain_is_ip,
        }
    }

    pub fn is_session(&self) -> bool {
        self.expiry.is_none()
    }

    pub fn is_host_only(&self) -> bool {
        !self.domain.starts_with('.')
    }

    /// Session cookies never expire in memory.
    pub fn has_expired(&self, now: i64) -> bool {
        match self.expiry {
            Some(expiry) => expiry <= now,
            None => false,
        }
    }

    /// `true` when the cookie should be removed rather than stored.
    pub fn is_dead(&self, now: i64) -> bool {
        self.force_expired || self.has_expired(now)
    }

    pub fn is_too_large(&self) -> bool {
        self.name.len() + self.value.len() > MAX_COOKIE_SIZE
    }

    /// Replace identity within a single domain node.
    pub fn same_key(&self, other: &Cookie) -> bool {
        self.name == other.name && self.path == other.path
    }

    /// Serialized `name=value` pair for a request header.
    pub fn to_name_value(&self) -> String {
        if self.name.is_empty() {
            self.value.clone()
        } else {
            format!("{}={}", self.name, self.value)
        }
    }

    pub fn record(&self) -> CookieRecord {
        CookieRecord::from(self)
    }
}

/// Structured view of a cookie handed to inspection APIs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CookieRecord {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    /// Epoch millis, `-1` for session cookies.
    pub expiry_millis: i64,
    pub http_only: bool,
    pub secure: bool,
    pub session: bool,
}

impl From<&Cookie> for CookieRecord {
    fn from(c: &Cookie) -> Self {
        Self {
            name: c.name.clone(),
            value: c.value.clone(),
            domain: c.domain.clone(),
            path: c.path.clone(),
            expiry_millis: c.expiry.unwrap_or(-1),
            http_only: c.http_only,
            secure: c.secure,
            session: c.is_session(),
        }
    }
}

/// `true` for IPv4 / IPv6 literals, with or without IPv6 brackets.
pub fn is_ip_address(host: &str) -> bool {
    let host = host.trim_start_matches('.');
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    host.parse::<IpAddr>().is_ok()
}

/// Canonical textual form of an IP literal, or `None` for non-IP hosts.
pub fn canonical_ip(host: &str) -> Option<String> {
    let bare = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    bare.parse::<IpAddr>().ok().map(|ip| ip.to_string())
}
