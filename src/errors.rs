/// Reasons a single cookie string is rejected by the parser.
///
/// A rejection only ever drops the one cookie it concerns; the other cookies of
/// the same header are parsed independently.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CookieParseError {
    #[error("Empty cookie")]
    Empty,

    #[error("Malformed cookie name: {0}")]
    MalformedName(String),

    #[error("Cookie exceeds {max} bytes (got {size})")]
    TooLarge { size: usize, max: usize },

    #[error("Invalid domain: {0}")]
    InvalidDomain(String),

    #[error("Domain {domain} does not match host {host}")]
    DomainMismatch { domain: String, host: String },

    #[error("Domain {0} is a top-level domain")]
    TopLevelDomain(String),

    #[error("Unsupported cookie version: {0}")]
    BadVersion(String),
}

/// Errors raised by the persistence worker.
///
/// These never reach callers of the cookie manager; they are logged and the
/// engine degrades to "cookies not persisted".
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Cookie store worker is gone")]
    WorkerGone,

    #[error("Cannot start cookie store worker: {0}")]
    Spawn(#[from] std::io::Error),
}
