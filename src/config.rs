use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Which documents may set cookies.
///
/// The engine only stores this; enforcing it is up to the HTTP layer that
/// decides whether to hand a `Set-Cookie` header to the manager at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CookiePolicy {
    /// Accept cookies from every response
    #[default]
    Always,
    /// Never accept cookies
    Never,
    /// Only accept cookies for the main document's domain
    OnlyFromMainDocumentDomain,
}

/// Cookie engine configuration.
#[derive(Debug, Clone)]
pub struct CookieConfig {
    /// Database file for persistent cookies. `None` keeps everything in memory.
    pub database_path: Option<PathBuf>,
    /// Maximum number of cookies a single domain node may hold
    pub max_cookies_per_host: usize,
    /// Maximum number of persistent cookies across all trees
    pub max_cookies_global: usize,
    /// How many extra cookies a deferred cleanup reclaims besides the overage
    pub cleanup_batch_size: usize,
    /// Delay before a scheduled cleanup runs
    pub cleanup_delay: Duration,
    /// Coalescing delay between the first queued write and the flush
    pub flush_delay: Duration,
    /// Allow cookies for `file:` and `local:` URLs
    pub support_local_cookies: bool,
    /// Start in private mode (nothing loaded or persisted)
    pub private_mode: bool,
    /// Acceptance policy handed back to the HTTP layer
    pub policy: CookiePolicy,
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            max_cookies_per_host: 60,
            max_cookies_global: 6000,
            cleanup_batch_size: 500,
            cleanup_delay: Duration::from_millis(10),
            flush_delay: Duration::from_secs(2),
            support_local_cookies: false,
            private_mode: false,
            policy: CookiePolicy::Always,
        }
    }
}
