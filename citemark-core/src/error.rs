use thiserror::Error;

/// Failure of a single lookup attempt. Never terminal for a session.
#[derive(Debug, Error)]
pub enum LookupError {
    #[error("HTTP {0}")]
    Status(u16),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed lookup response: {0}")]
    Decode(String),
}

/// Terminal outcome of a resolution session that produced no highlight.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("no usable phrase or keyword could be derived from the citation")]
    NothingToSearch,
    #[error("the citation does not name a document")]
    MissingDocument,
    #[error("the lookup service rejected the request: {reason}")]
    Rejected { reason: String },
    #[error("no matching region was found on pages {tried:?}; check the neighbouring pages or a different document")]
    NotFound { tried: Vec<u32> },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ViewerError {
    #[error("failed to load document: {0}")]
    Render(String),
    #[error("no document is open")]
    NoDocument,
    #[error("the viewer has been disposed")]
    Disposed,
    #[error("document load was cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}
