// HLS Playlist Resolver: Fetches playlists and follows master playlists to a media playlist.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use url::Url;

use crate::DownloadError;
use crate::hls::codec::decode_content;
use crate::hls::config::HlsConfig;
use crate::hls::planner::resolve_uri;
use crate::hls::playlist::PlaylistDocument;
use crate::hls::retry::{RetryAction, retry_with_backoff};

static EMBEDDED_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://[^\s/$.?#].\S*").expect("valid regex"));

/// Raw playlist text together with the URL it was finally served from.
#[derive(Debug, Clone)]
pub struct FetchedPlaylist {
    pub body: String,
    pub url: Url,
}

#[async_trait]
pub trait PlaylistProvider: Send + Sync {
    async fn fetch_playlist(&self, url: &Url) -> Result<FetchedPlaylist, DownloadError>;
}

/// A media playlist and the effective URL its references resolve against.
#[derive(Debug, Clone)]
pub struct ResolvedPlaylist {
    pub document: PlaylistDocument,
    pub url: Url,
}

pub struct HttpPlaylistProvider {
    client: Client,
    config: Arc<HlsConfig>,
    token: CancellationToken,
}

impl HttpPlaylistProvider {
    pub fn new(client: Client, config: Arc<HlsConfig>, token: CancellationToken) -> Self {
        Self {
            client,
            config,
            token,
        }
    }
}

#[async_trait]
impl PlaylistProvider for HttpPlaylistProvider {
    #[instrument(skip(self), fields(url = %url))]
    async fn fetch_playlist(&self, url: &Url) -> Result<FetchedPlaylist, DownloadError> {
        let timeout = self.config.playlist_config.fetch_timeout;
        retry_with_backoff(&self.config.fetcher_config.retry, &self.token, None, |_| async move {
            let response = tokio::select! {
                _ = self.token.cancelled() => return RetryAction::Fail(DownloadError::Cancelled),
                response = self.client.get(url.clone()).timeout(timeout).send() => response,
            };
            let response = match response {
                Ok(response) => response,
                Err(e) => return network_failure(e),
            };
            if response.status() != StatusCode::OK {
                return RetryAction::Fail(DownloadError::http_status(
                    response.status(),
                    url.as_str(),
                    "playlist fetch",
                ));
            }

            let effective = response.url().clone();
            let encoding = response
                .headers()
                .get(reqwest::header::CONTENT_ENCODING)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned);
            let body = match response.bytes().await {
                Ok(body) => body,
                Err(e) => return network_failure(e),
            };
            match decode_content(encoding.as_deref(), body) {
                Ok(body) => RetryAction::Success(FetchedPlaylist {
                    body: String::from_utf8_lossy(&body).into_owned(),
                    url: effective,
                }),
                Err(e) if e.is_retryable() => RetryAction::Retry(e),
                Err(e) => RetryAction::Fail(e),
            }
        })
        .await
    }
}

fn network_failure<T>(e: reqwest::Error) -> RetryAction<T> {
    let err = DownloadError::from(e);
    if err.is_retryable() {
        RetryAction::Retry(err)
    } else {
        RetryAction::Fail(err)
    }
}

pub struct PlaylistResolver<P> {
    provider: P,
    max_hops: usize,
}

impl<P: PlaylistProvider> PlaylistResolver<P> {
    pub fn new(provider: P, max_hops: usize) -> Self {
        Self { provider, max_hops }
    }

    /// Resolve `url` to a media playlist that contains at least one segment.
    ///
    /// Every fetch counts as a hop, whether it followed a variant or a URL
    /// found inside an unparseable body.
    pub async fn resolve(&self, url: &Url) -> Result<ResolvedPlaylist, DownloadError> {
        let mut current = url.clone();

        for hop in 1..=self.max_hops {
            let fetched = self.provider.fetch_playlist(&current).await?;

            match PlaylistDocument::parse(&fetched.body) {
                Ok(document) if document.is_master() => {
                    let Some(variant) = document.best_variant() else {
                        return Err(DownloadError::NoMedia {
                            url: fetched.url.to_string(),
                        });
                    };
                    current = resolve_uri(&fetched.url, &variant.uri)?;
                    info!(
                        hop,
                        bandwidth = variant.bandwidth,
                        variant = %current,
                        "Following variant playlist"
                    );
                }
                Ok(document) => {
                    if document.segments().next().is_none() {
                        return Err(DownloadError::NoMedia {
                            url: fetched.url.to_string(),
                        });
                    }
                    debug!(hop, url = %fetched.url, "Resolved media playlist");
                    return Ok(ResolvedPlaylist {
                        document,
                        url: fetched.url,
                    });
                }
                Err(parse_error) => match find_embedded_url(&fetched.body) {
                    Some(next) => {
                        info!(hop, next = %next, "Following URL embedded in non-playlist body");
                        current = next;
                    }
                    None => return Err(parse_error),
                },
            }
        }

        Err(DownloadError::NotFound {
            resource: format!("media playlist for {url} within {} hops", self.max_hops),
        })
    }
}

fn find_embedded_url(body: &str) -> Option<Url> {
    EMBEDDED_URL
        .find_iter(body)
        .find_map(|m| Url::parse(m.as_str()).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct StaticProvider {
        pages: HashMap<String, String>,
        requested: Mutex<Vec<String>>,
    }

    impl StaticProvider {
        fn with(mut self, url: &str, body: &str) -> Self {
            self.pages.insert(url.to_string(), body.to_string());
            self
        }
    }

    #[async_trait]
    impl PlaylistProvider for StaticProvider {
        async fn fetch_playlist(&self, url: &Url) -> Result<FetchedPlaylist, DownloadError> {
            self.requested.lock().unwrap().push(url.to_string());
            match self.pages.get(url.as_str()) {
                Some(body) => Ok(FetchedPlaylist {
                    body: body.clone(),
                    url: url.clone(),
                }),
                None => Err(DownloadError::http_status(
                    StatusCode::NOT_FOUND,
                    url.as_str(),
                    "playlist fetch",
                )),
            }
        }
    }

    const MEDIA: &str = "#EXTM3U\n#EXTINF:4,\n0.ts\n#EXT-X-ENDLIST\n";

    #[tokio::test]
    async fn follows_best_variant() {
        let provider = StaticProvider::default()
            .with(
                "http://h/master.m3u8",
                "#EXTM3U
#EXT-X-STREAM-INF:BANDWIDTH=100,RESOLUTION=640x360
low/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=900,RESOLUTION=1920x1080
high/index.m3u8
",
            )
            .with("http://h/high/index.m3u8", MEDIA);
        let resolver = PlaylistResolver::new(provider, 5);

        let resolved = resolver
            .resolve(&Url::parse("http://h/master.m3u8").unwrap())
            .await
            .unwrap();
        assert_eq!(resolved.url.as_str(), "http://h/high/index.m3u8");
        assert_eq!(resolved.document.segments().count(), 1);
    }

    #[tokio::test]
    async fn follows_url_embedded_in_html() {
        let provider = StaticProvider::default()
            .with(
                "http://h/page",
                "<html><script>var src = 'x'; play( https://cdn.example/v/index.m3u8 )</script>",
            )
            .with("https://cdn.example/v/index.m3u8", MEDIA);
        let resolver = PlaylistResolver::new(provider, 5);

        let resolved = resolver
            .resolve(&Url::parse("http://h/page").unwrap())
            .await
            .unwrap();
        assert_eq!(resolved.url.as_str(), "https://cdn.example/v/index.m3u8");
    }

    #[tokio::test]
    async fn non_playlist_without_url_is_a_parse_error() {
        let provider = StaticProvider::default().with("http://h/page", "<html>nothing</html>");
        let resolver = PlaylistResolver::new(provider, 5);
        let err = resolver
            .resolve(&Url::parse("http://h/page").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Playlist { .. }));
    }

    #[tokio::test]
    async fn empty_media_playlist_has_no_media() {
        let provider =
            StaticProvider::default().with("http://h/index.m3u8", "#EXTM3U\n#EXT-X-ENDLIST\n");
        let resolver = PlaylistResolver::new(provider, 5);
        let err = resolver
            .resolve(&Url::parse("http://h/index.m3u8").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::NoMedia { .. }));
    }

    #[tokio::test]
    async fn gives_up_after_hop_limit() {
        let mut provider = StaticProvider::default();
        for n in 0..10 {
            provider = provider.with(
                &format!("http://h/{n}.m3u8"),
                &format!("#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1\n{}.m3u8\n", n + 1),
            );
        }
        let resolver = PlaylistResolver::new(provider, 5);
        let err = resolver
            .resolve(&Url::parse("http://h/0.m3u8").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::NotFound { .. }));
        assert_eq!(resolver.provider.requested.lock().unwrap().len(), 5);
    }
}
