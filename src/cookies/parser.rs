//! `Set-Cookie` parsing.
//!
//! A [`CookieParser`] is bound to the URL of the response (or document) that set
//! the cookies. It turns a raw header value into zero or more [`Cookie`]s,
//! applying RFC 6265 domain/path rules:
//!
//! - Several cookies may be concatenated in one value, separated by CR/LF.
//! - `;` separates the `NAME=VALUE` pair from the attributes. A `"`-quoted run is
//!   skipped while looking for `;`, but quotes are kept verbatim.
//! - `Max-Age` beats `Expires` regardless of order.
//! - A `Domain` must domain-match the host, contain an embedded dot and not be a
//!   public suffix. IP hosts only accept their own canonical address.
//! - Without a usable `Path`, the default path of the URL is used.
//!
//! A rejected cookie is logged and dropped; it never affects its siblings.
//!
//! ```rust
//! use gosub_cookies::cookies::CookieParser;
//! use url::Url;
//!
//! let url = Url::parse("http://a.b.com/x/y").unwrap();
//! let parser = CookieParser::new(&url, 0);
//! let cookies = parser.parse("id=1; Domain=b.com; Path=/x");
//! assert_eq!(cookies[0].domain, ".b.com");
//! assert_eq!(cookies[0].path, "/x");
//! ```

use log::{debug, warn};
use percent_encoding::percent_decode_str;
use url::Url;

use crate::cookies::cookie::{canonical_ip, Cookie, MAX_COOKIE_SIZE};
use crate::cookies::date::parse_cookie_date;
use crate::cookies::public_suffix::is_top_level_domain;
use crate::errors::CookieParseError;

/// Parser bound to the URL the cookies arrive from.
#[derive(Debug, Clone)]
pub struct CookieParser {
    scheme: String,
    host: String,
    /// Canonical form of `host` when it is an IP literal.
    host_ip: Option<String>,
    default_path: String,
    now: i64,
}

/// Attribute values collected before the cookie is validated.
#[derive(Debug, Default)]
struct Attributes {
    path: Option<String>,
    domain: Option<String>,
    expires: Option<i64>,
    max_age: Option<i64>,
    secure: bool,
    http_only: bool,
}

fn trim_ws(s: &str) -> &str {
    s.trim_matches(|c| c == ' ' || c == '\t')
}

fn strip_quotes(s: &str) -> &str {
    s.strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(s)
}

/// Splits on `;`, skipping over `"`-quoted runs.
fn split_unquoted(input: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;

    for (idx, c) in input.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ';' if !in_quotes => {
                parts.push(&input[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(&input[start..]);

    parts
}

/// RFC 6265 §5.1.4 default path of a request path.
pub fn default_path(url_path: &str) -> String {
    let decoded = percent_decode_str(url_path).decode_utf8_lossy();

    match decoded.rfind('/') {
        Some(idx) if idx > 0 => decoded[..idx].to_string(),
        _ => "/".to_string(),
    }
}

impl CookieParser {
    /// Creates a parser for cookies received from `url` at time `now`.
    pub fn new(url: &Url, now: i64) -> Self {
        let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
        let host_ip = canonical_ip(&host);

        Self {
            scheme: url.scheme().to_ascii_lowercase(),
            host,
            host_ip,
            default_path: default_path(url.path()),
            now,
        }
    }

    /// Parses a header value that may hold several CR/LF separated cookies.
    pub fn parse(&self, header: &str) -> Vec<Cookie> {
        header
            .split(['\r', '\n'])
            .filter(|segment| !trim_ws(segment).is_empty())
            .filter_map(|segment| self.parse_one(segment))
            .collect()
    }

    /// Parses every header value in `headers`.
    pub fn parse_all<S: AsRef<str>>(&self, headers: &[S]) -> Vec<Cookie> {
        headers
            .iter()
            .flat_map(|header| self.parse(header.as_ref()))
            .collect()
    }

    /// Parses a single cookie, logging and dropping it when rejected.
    pub fn parse_one(&self, segment: &str) -> Option<Cookie> {
        match self.try_parse_one(segment) {
            Ok(cookie) => Some(cookie),
            Err(e) => {
                warn!("Rejecting cookie from {}: {}", self.host, e);
                None
            }
        }
    }

    /// Parses a single cookie, returning why it was rejected.
    pub fn try_parse_one(&self, segment: &str) -> Result<Cookie, CookieParseError> {
        let segment = trim_ws(segment);
        if segment.is_empty() {
            return Err(CookieParseError::Empty);
        }

        let parts = split_unquoted(segment);
        let (name, value) = match parts[0].split_once('=') {
            Some((name, value)) => (trim_ws(name), trim_ws(value)),
            // Bare token: a value without a name.
            None => ("", trim_ws(parts[0])),
        };

        if name.is_empty() && value.is_empty() {
            return Err(CookieParseError::Empty);
        }
        if name.starts_with('$') || name.chars().any(|c| c.is_control()) {
            return Err(CookieParseError::MalformedName(name.to_string()));
        }

        let attrs = self.parse_attributes(&parts[1..])?;

        let mut cookie = Cookie::new(name, value, "", "/", self.scheme.clone(), self.now);
        self.apply_domain(&mut cookie, attrs.domain.as_deref())?;

        cookie.path = match attrs.path {
            Some(path) if path.starts_with('/') => path,
            _ => self.default_path.clone(),
        };

        cookie.expiry = match (attrs.max_age, attrs.expires) {
            (Some(max_age), _) if max_age <= 0 => Some(0),
            (Some(max_age), _) => Some(self.now.saturating_add(max_age.saturating_mul(1000))),
            (None, expires) => expires,
        };

        cookie.secure = attrs.secure;
        cookie.http_only = attrs.http_only;

        if cookie.is_too_large() {
            return Err(CookieParseError::TooLarge {
                size: cookie.name.len() + cookie.value.len(),
                max: MAX_COOKIE_SIZE,
            });
        }

        Ok(cookie)
    }

    fn parse_attributes(&self, parts: &[&str]) -> Result<Attributes, CookieParseError> {
        let mut attrs = Attributes::default();

        for part in parts {
            let part = trim_ws(part);
            if part.is_empty() {
                continue;
            }

            let (key, val) = match part.split_once('=') {
                Some((k, v)) => (trim_ws(k), trim_ws(v)),
                None => (part, ""),
            };

            let first = key.chars().next().map(|c| c.to_ascii_lowercase());
            match first {
                Some('p') if key.eq_ignore_ascii_case("path") => {
                    attrs.path = Some(val.to_string());
                }
                Some('d') if key.eq_ignore_ascii_case("domain") => {
                    // An empty Domain attribute is ignored.
                    if !val.is_empty() {
                        attrs.domain = Some(val.to_string());
                    }
                }
                Some('e') if key.eq_ignore_ascii_case("expires") => {
                    match parse_cookie_date(strip_quotes(val)) {
                        Some(ms) => attrs.expires = Some(ms),
                        None => debug!("Unparsable Expires '{}', keeping session cookie", val),
                    }
                }
                Some('m') if key.eq_ignore_ascii_case("max-age") => {
                    match strip_quotes(val).parse::<i64>() {
                        Ok(secs) => attrs.max_age = Some(secs),
                        Err(_) => debug!("Ignoring invalid Max-Age '{}'", val),
                    }
                }
                Some('c') if key.eq_ignore_ascii_case("comment") => {
                    debug!("Discarding cookie comment '{}'", val);
                }
                Some('v') if key.eq_ignore_ascii_case("version") => {
                    if strip_quotes(val).parse::<u32>().ok() != Some(1) {
                        return Err(CookieParseError::BadVersion(val.to_string()));
                    }
                }
                Some('s') if key.eq_ignore_ascii_case("secure") => attrs.secure = true,
                Some('h') if key.eq_ignore_ascii_case("httponly") => attrs.http_only = true,
                _ => debug!("Ignoring unknown cookie attribute '{}'", key),
            }
        }

        Ok(attrs)
    }

    fn apply_domain(&self, cookie: &mut Cookie, domain: Option<&str>) -> Result<(), CookieParseError> {
        let Some(domain) = domain else {
            // Host-only cookie
            match &self.host_ip {
                Some(ip) => {
                    cookie.domain = ip.clone();
                    cookie.domain_is_ip = true;
                }
                None => {
                    cookie.domain = self.host.clone();
                    cookie.domain_is_ip = false;
                }
            }
            return Ok(());
        };

        let mut domain = domain.to_ascii_lowercase();

        if let Some(ip) = &self.host_ip {
            if canonical_ip(domain.trim_start_matches('.')).as_deref() != Some(ip.as_str()) {
                return Err(CookieParseError::DomainMismatch {
                    domain,
                    host: self.host.clone(),
                });
            }
            cookie.domain = ip.clone();
            cookie.domain_is_ip = true;
            return Ok(());
        }

        if !domain.starts_with('.') {
            domain.insert(0, '.');
        }

        let inner = domain[1..].trim_end_matches('.');
        if inner.is_empty() || !inner.contains('.') {
            return Err(CookieParseError::InvalidDomain(domain));
        }

        if !format!(".{}", self.host).ends_with(&domain) {
            return Err(CookieParseError::DomainMismatch {
                domain,
                host: self.host.clone(),
            });
        }

        if is_top_level_domain(&domain) {
            return Err(CookieParseError::TopLevelDomain(domain));
        }

        cookie.domain = domain;
        cookie.domain_is_ip = false;
        Ok(())
    }
}
