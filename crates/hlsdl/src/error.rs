use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("download cancelled")]
    Cancelled,

    #[error("a download is already running")]
    AlreadyRunning,

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("proxy configuration error: {reason}")]
    ProxyConfiguration { reason: String },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} during {operation} for {url}")]
    HttpStatus {
        status: StatusCode,
        url: String,
        operation: &'static str,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("cache error: {reason}")]
    Cache { reason: String },

    #[error("not a playlist: {reason}")]
    Playlist { reason: String },

    #[error("invalid skip clause \"{clause}\"")]
    SkipExpression { clause: String },

    #[error("resource not found: {resource}")]
    NotFound { resource: String },

    #[error("no media resource found in {url}")]
    NoMedia { url: String },

    #[error("invalid key: {reason}")]
    InvalidKey { reason: String },

    #[error("unsupported encryption method `{method}`")]
    UnsupportedEncryption { method: String },

    #[error("unsupported content encoding `{encoding}`")]
    UnsupportedEncoding { encoding: String },

    #[error("decompression failed: {reason}")]
    Decompression { reason: String },

    #[error("decryption error: {reason}")]
    Decryption { reason: String },

    #[error("corrupt ciphertext: {reason}")]
    CorruptCiphertext { reason: String },

    #[error("no transport stream sync byte in {url}")]
    MissingSyncByte { url: String },

    #[error("{count} segment(s) skipped by tolerated HTTP status, assembly blocked")]
    SkippedByHttpCode { count: usize },

    #[error("assembly failed: {reason}")]
    Assembly { reason: String },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl DownloadError {
    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn proxy_configuration(reason: impl Into<String>) -> Self {
        Self::ProxyConfiguration {
            reason: reason.into(),
        }
    }

    pub fn http_status(
        status: StatusCode,
        url: impl Into<String>,
        operation: &'static str,
    ) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
            operation,
        }
    }

    pub fn playlist(reason: impl Into<String>) -> Self {
        Self::Playlist {
            reason: reason.into(),
        }
    }

    pub fn skip_expression(clause: impl Into<String>) -> Self {
        Self::SkipExpression {
            clause: clause.into(),
        }
    }

    pub fn invalid_key(reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            reason: reason.into(),
        }
    }

    pub fn corrupt_ciphertext(reason: impl Into<String>) -> Self {
        Self::CorruptCiphertext {
            reason: reason.into(),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// The status code carried by an HTTP status failure, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(status.as_u16()),
            _ => None,
        }
    }

    /// Whether another attempt at the same request may succeed.
    ///
    /// Any unexpected status is treated as transient, as are decode,
    /// decryption and alignment failures of an otherwise successful response.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { source } => !source.is_builder(),
            Self::HttpStatus { .. }
            | Self::Decompression { .. }
            | Self::Decryption { .. }
            | Self::CorruptCiphertext { .. }
            | Self::MissingSyncByte { .. } => true,
            Self::Cancelled
            | Self::AlreadyRunning
            | Self::InvalidUrl { .. }
            | Self::ProxyConfiguration { .. }
            | Self::Io { .. }
            | Self::Cache { .. }
            | Self::Playlist { .. }
            | Self::SkipExpression { .. }
            | Self::NotFound { .. }
            | Self::NoMedia { .. }
            | Self::InvalidKey { .. }
            | Self::UnsupportedEncryption { .. }
            | Self::UnsupportedEncoding { .. }
            | Self::SkippedByHttpCode { .. }
            | Self::Assembly { .. }
            | Self::Configuration { .. }
            | Self::Internal { .. } => false,
        }
    }
}
