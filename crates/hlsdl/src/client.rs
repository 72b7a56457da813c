use reqwest::Client;
use reqwest::redirect::Policy;
use tracing::debug;

use crate::proxy::build_proxy_from_config;
use crate::{DownloadError, DownloaderConfig};

/// Build the shared HTTP client for one download session.
///
/// Automatic decompression is disabled: playlist and segment bodies are
/// decoded explicitly from their `Content-Encoding` so unknown encodings
/// can be reported instead of silently passed through.
pub fn create_client(config: &DownloaderConfig) -> Result<Client, DownloadError> {
    let mut builder = Client::builder()
        .user_agent(&config.user_agent)
        .default_headers(config.headers.clone())
        .connect_timeout(config.connect_timeout)
        .read_timeout(config.read_timeout)
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .pool_idle_timeout(config.pool_idle_timeout)
        .danger_accept_invalid_certs(config.danger_accept_invalid_certs)
        .no_gzip()
        .no_brotli()
        .no_deflate();

    if !config.timeout.is_zero() {
        builder = builder.timeout(config.timeout);
    }

    builder = if config.follow_redirects {
        builder.redirect(Policy::limited(10))
    } else {
        builder.redirect(Policy::none())
    };

    match &config.proxy {
        Some(proxy_config) => {
            debug!(proxy = %proxy_config.url, "Using proxy");
            builder = builder.proxy(build_proxy_from_config(proxy_config)?);
        }
        None => {
            builder = builder.no_proxy();
        }
    }

    builder.build().map_err(DownloadError::from)
}
