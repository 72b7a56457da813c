// HLS Segment Fetcher: Downloads one segment, repairs its body and writes it to disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};
use url::Url;

use crate::DownloadError;
use crate::hls::codec::{align_to_sync_byte, decode_content, strip_image_disguise};
use crate::hls::config::HlsConfig;
use crate::hls::decryption::decrypt_segment;
use crate::hls::segment::Segment;
use crate::hls::throughput::{ThroughputTracker, TransferId};

#[async_trait]
pub trait SegmentDownloader: Send + Sync {
    /// Perform one attempt at downloading `segment` into `dir`.
    ///
    /// Returns the number of bytes written under the segment's file name.
    async fn fetch_segment(
        &self,
        segment: &Segment,
        dir: &Path,
        tracker: &ThroughputTracker,
    ) -> Result<u64, DownloadError>;
}

pub struct SegmentFetcher {
    http_client: Client,
    config: Arc<HlsConfig>,
    token: CancellationToken,
}

impl SegmentFetcher {
    pub fn new(http_client: Client, config: Arc<HlsConfig>, token: CancellationToken) -> Self {
        Self {
            http_client,
            config,
            token,
        }
    }

    /// Streams the response body, reporting progress to the tracker as it arrives.
    async fn read_body(
        &self,
        response: reqwest::Response,
        tracker: &ThroughputTracker,
        transfer: TransferId,
    ) -> Result<Bytes, DownloadError> {
        let content_length = response.content_length().unwrap_or(0) as usize;
        let mut buffer = BytesMut::with_capacity(content_length);
        let mut stream = response.bytes_stream();

        loop {
            let chunk = tokio::select! {
                _ = self.token.cancelled() => return Err(DownloadError::Cancelled),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else {
                break;
            };
            buffer.extend_from_slice(&chunk?);
            tracker.record_in_flight(transfer, buffer.len() as u64);
        }

        Ok(buffer.freeze())
    }
}

#[async_trait]
impl SegmentDownloader for SegmentFetcher {
    #[instrument(skip(self, segment, dir, tracker), fields(segment = segment.ordinal))]
    async fn fetch_segment(
        &self,
        segment: &Segment,
        dir: &Path,
        tracker: &ThroughputTracker,
    ) -> Result<u64, DownloadError> {
        let response = tokio::select! {
            _ = self.token.cancelled() => return Err(DownloadError::Cancelled),
            response = self
                .http_client
                .get(segment.uri.clone())
                .timeout(self.config.fetcher_config.segment_download_timeout)
                .send() => response?,
        };

        if response.status() != StatusCode::OK {
            return Err(DownloadError::http_status(
                response.status(),
                segment.uri.as_str(),
                "segment download",
            ));
        }

        let encoding = response
            .headers()
            .get(reqwest::header::CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        let transfer = tracker.begin_transfer(Instant::now());
        let body = self.read_body(response, tracker, transfer).await;
        tracker.finish_transfer(transfer);
        let body = body?;
        trace!(bytes = body.len(), "Segment body received");

        let key_iv = match &segment.encryption {
            Some(encryption) => {
                let key = encryption.key.ok_or_else(|| {
                    DownloadError::invalid_key(format!(
                        "key {} was not resolved",
                        encryption.key_uri
                    ))
                })?;
                Some((key, encryption.iv))
            }
            None => None,
        };

        let url = segment.uri.clone();
        let data = tokio::task::spawn_blocking(move || {
            repair_body(encoding.as_deref(), body, key_iv.as_ref(), &url)
        })
        .await
        .map_err(|e| DownloadError::Internal {
            reason: format!("segment processing task failed: {e}"),
        })??;

        let written = data.len() as u64;
        write_atomically(&dir.join(&segment.file_name), &data).await?;
        tracker.record_completed(Instant::now(), written);
        debug!(bytes = written, "Segment written");
        Ok(written)
    }
}

/// Decompress, decrypt and realign a raw segment body.
pub fn repair_body(
    encoding: Option<&str>,
    body: Bytes,
    key_iv: Option<&([u8; 16], [u8; 16])>,
    url: &Url,
) -> Result<Bytes, DownloadError> {
    let mut data = decode_content(encoding, body)?;
    if let Some((key, iv)) = key_iv {
        data = decrypt_segment(&data, key, iv)?;
    }
    let data = strip_image_disguise(data);
    align_to_sync_byte(data).ok_or_else(|| DownloadError::MissingSyncByte {
        url: url.to_string(),
    })
}

pub(crate) fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write `data` to `<path>.tmp` and rename it over `path`.
///
/// The temporary file is removed if any step fails.
pub(crate) async fn write_atomically(path: &Path, data: &[u8]) -> Result<(), DownloadError> {
    let tmp = temp_path(path);
    let result = async {
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, path).await
    }
    .await;

    if let Err(e) = result {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}
