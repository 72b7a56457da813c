use std::time::Duration;

use crate::DownloaderConfig;
use crate::hls::retry::RetryPolicy;

pub const MIN_CONCURRENCY: usize = 1;
pub const MAX_CONCURRENCY: usize = 1000;

#[derive(Debug, Clone)]
pub struct HlsPlaylistConfig {
    /// Maximum number of playlist fetches while following master playlists
    /// and embedded links
    pub max_hops: usize,
    pub fetch_timeout: Duration,
}

impl Default for HlsPlaylistConfig {
    fn default() -> Self {
        Self {
            max_hops: 5,
            fetch_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HlsFetcherConfig {
    pub segment_download_timeout: Duration,
    pub key_download_timeout: Duration,
    /// Attempt policy shared by segment and key fetches
    pub retry: RetryPolicy,
}

impl Default for HlsFetcherConfig {
    fn default() -> Self {
        Self {
            segment_download_timeout: Duration::from_secs(120),
            key_download_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HlsSchedulerConfig {
    /// Number of segments downloaded at the same time
    pub concurrency: usize,
}

impl Default for HlsSchedulerConfig {
    fn default() -> Self {
        Self { concurrency: 8 }
    }
}

#[derive(Debug, Clone)]
pub struct HlsDecryptionConfig {
    /// Maximum number of distinct keys kept in memory
    pub key_cache_capacity: u64,
}

impl Default for HlsDecryptionConfig {
    fn default() -> Self {
        Self {
            key_cache_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HlsConfig {
    pub base: DownloaderConfig,
    pub playlist_config: HlsPlaylistConfig,
    pub fetcher_config: HlsFetcherConfig,
    pub scheduler_config: HlsSchedulerConfig,
    pub decryption_config: HlsDecryptionConfig,
}
