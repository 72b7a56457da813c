use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use url::Url;

use crate::{DownloadError, proxy::ProxyConfig};

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

/// Configurable options for the HTTP side of the downloader
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Overall timeout for a single HTTP request; zero disables it
    pub timeout: Duration,

    /// Connection timeout (time to establish initial connection)
    pub connect_timeout: Duration,

    /// Read timeout (maximum time between receiving data chunks)
    pub read_timeout: Duration,

    /// Whether to follow redirects
    pub follow_redirects: bool,

    /// User agent string
    pub user_agent: String,

    /// HTTP headers sent with every request
    pub headers: HeaderMap,

    /// Proxy configuration (optional)
    pub proxy: Option<ProxyConfig>,

    pub danger_accept_invalid_certs: bool,

    /// Maximum idle connections to keep per host
    pub pool_max_idle_per_host: usize,

    /// Duration to keep idle connections alive before closing
    pub pool_idle_timeout: Duration,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(0),
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
            follow_redirects: true,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: DownloaderConfig::get_default_headers(),
            proxy: None,
            danger_accept_invalid_certs: false,
            pool_max_idle_per_host: 32,
            pool_idle_timeout: Duration::from_secs(30),
        }
    }
}

impl DownloaderConfig {
    /// Build a configuration for `target`: default headers plus a `Referer`
    /// pointing at the target's origin, overridden by `custom` headers.
    pub fn for_target(
        target: &Url,
        custom: &[(String, String)],
    ) -> Result<Self, DownloadError> {
        let mut headers = Self::get_default_headers();

        if let Some(host) = target.host_str() {
            let origin = match target.port() {
                Some(port) => format!("{}://{}:{}/", target.scheme(), host, port),
                None => format!("{}://{}/", target.scheme(), host),
            };
            if let Ok(value) = HeaderValue::from_str(&origin) {
                headers.insert(reqwest::header::REFERER, value);
            }
        }

        let mut config = Self::default();
        for (name, value) in custom {
            let name = HeaderName::from_bytes(name.trim().as_bytes()).map_err(|e| {
                DownloadError::configuration(format!("invalid header name `{name}`: {e}"))
            })?;
            let value = HeaderValue::from_str(value.trim()).map_err(|e| {
                DownloadError::configuration(format!("invalid value for header `{name}`: {e}"))
            })?;
            // User-Agent is applied through the client builder
            if name == reqwest::header::USER_AGENT {
                config.user_agent = value.to_str().unwrap_or(DEFAULT_USER_AGENT).to_owned();
                continue;
            }
            headers.insert(name, value);
        }

        config.headers = headers;
        Ok(config)
    }

    pub fn get_default_headers() -> HeaderMap {
        let mut default_headers = HeaderMap::new();

        default_headers.insert(
            reqwest::header::ACCEPT_ENCODING,
            HeaderValue::from_static("gzip, deflate, br"),
        );

        default_headers.insert(
            reqwest::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );

        default_headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static("*/*"));

        default_headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("en-US,en;q=0.5,zh-CN;q=0.3,zh;q=0.2"),
        );
        default_headers
    }
}
