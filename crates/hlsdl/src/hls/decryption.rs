// HLS Decryption: Resolves AES-128 key content and decrypts segment bodies.

use std::sync::Arc;

use aes::Aes128;
use bytes::Bytes;
use cipher::{BlockDecryptMut, KeyIvInit, block_padding::NoPadding};
use moka::future::Cache;
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};
use url::Url;

use crate::DownloadError;
use crate::hls::codec::decode_content;
use crate::hls::config::HlsConfig;
use crate::hls::retry::{RetryAction, retry_with_backoff};
use crate::hls::segment::Segment;

type Aes128CbcDec = cbc::Decryptor<Aes128>;

const AES_BLOCK: usize = 16;

/// Decrypt an AES-128-CBC body and strip its PKCS#7 padding.
///
/// A padding byte larger than the plaintext is reported as corrupt
/// ciphertext; the padding bytes themselves are not validated.
pub fn decrypt_segment(
    data: &[u8],
    key: &[u8; 16],
    iv: &[u8; 16],
) -> Result<Bytes, DownloadError> {
    if data.is_empty() || data.len() % AES_BLOCK != 0 {
        return Err(DownloadError::corrupt_ciphertext(format!(
            "ciphertext length {} is not a positive multiple of {AES_BLOCK}",
            data.len()
        )));
    }

    let mut buffer = data.to_vec();
    let cipher = Aes128CbcDec::new_from_slices(key, iv).map_err(|e| DownloadError::Decryption {
        reason: format!("failed to initialize AES decryptor: {e}"),
    })?;
    cipher
        .decrypt_padded_mut::<NoPadding>(&mut buffer)
        .map_err(|e| DownloadError::Decryption {
            reason: format!("decryption failed: {e}"),
        })?;

    let plain_len = unpadded_len(&buffer)?;
    buffer.truncate(plain_len);
    Ok(Bytes::from(buffer))
}

fn unpadded_len(plain: &[u8]) -> Result<usize, DownloadError> {
    let padding = plain.last().copied().unwrap_or(0) as usize;
    plain.len().checked_sub(padding).ok_or_else(|| {
        DownloadError::corrupt_ciphertext(format!(
            "padding length {padding} exceeds plaintext length {}",
            plain.len()
        ))
    })
}

/// Interpret fetched key content: 16 raw bytes, or 32 hex characters.
pub fn parse_key_content(content: &[u8]) -> Result<[u8; 16], DownloadError> {
    if let Ok(key) = <[u8; 16]>::try_from(content) {
        return Ok(key);
    }

    let text = std::str::from_utf8(content).map(str::trim).unwrap_or_default();
    if text.len() == 32
        && let Ok(decoded) = hex::decode(text)
        && let Ok(key) = <[u8; 16]>::try_from(decoded.as_slice())
    {
        return Ok(key);
    }

    Err(DownloadError::invalid_key(format!(
        "expected 16 bytes of key content, got {}",
        content.len()
    )))
}

/// Fetches key content once per distinct key URI.
///
/// Concurrent requests for the same URI share a single fetch.
pub struct KeyStore {
    client: Client,
    config: Arc<HlsConfig>,
    token: CancellationToken,
    keys: Cache<Url, [u8; 16]>,
}

impl KeyStore {
    pub fn new(client: Client, config: Arc<HlsConfig>, token: CancellationToken) -> Self {
        let keys = Cache::builder()
            .max_capacity(config.decryption_config.key_cache_capacity)
            .build();
        Self {
            client,
            config,
            token,
            keys,
        }
    }

    pub async fn key_for(&self, key_uri: &Url) -> Result<[u8; 16], DownloadError> {
        self.keys
            .try_get_with(key_uri.clone(), self.fetch_key(key_uri))
            .await
            .map_err(|shared| match Arc::try_unwrap(shared) {
                Ok(err) => err,
                Err(shared) => match *shared {
                    DownloadError::Cancelled => DownloadError::Cancelled,
                    ref other => DownloadError::invalid_key(format!("{key_uri}: {other}")),
                },
            })
    }

    /// Fill in the key content of every encrypted segment.
    pub async fn resolve_keys(&self, segments: &mut [Segment]) -> Result<(), DownloadError> {
        for segment in segments.iter_mut() {
            if let Some(encryption) = segment.encryption.as_mut() {
                encryption.key = Some(self.key_for(&encryption.key_uri).await?);
            }
        }
        Ok(())
    }

    #[instrument(skip(self), fields(uri = %key_uri))]
    async fn fetch_key(&self, key_uri: &Url) -> Result<[u8; 16], DownloadError> {
        debug!("Fetching key");
        let fetcher_config = &self.config.fetcher_config;
        retry_with_backoff(&fetcher_config.retry, &self.token, None, |_| async {
            let response = tokio::select! {
                _ = self.token.cancelled() => return RetryAction::Fail(DownloadError::Cancelled),
                response = self
                    .client
                    .get(key_uri.clone())
                    .timeout(fetcher_config.key_download_timeout)
                    .send() => response,
            };
            let response = match response {
                Ok(response) => response,
                Err(e) => return classify(DownloadError::from(e)),
            };
            if response.status() != reqwest::StatusCode::OK {
                return RetryAction::Retry(DownloadError::http_status(
                    response.status(),
                    key_uri.as_str(),
                    "key fetch",
                ));
            }
            let encoding = response
                .headers()
                .get(reqwest::header::CONTENT_ENCODING)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned);
            let body = match response.bytes().await {
                Ok(body) => body,
                Err(e) => return classify(DownloadError::from(e)),
            };
            match decode_content(encoding.as_deref(), body).and_then(|b| parse_key_content(&b)) {
                Ok(key) => RetryAction::Success(key),
                Err(e) => classify(e),
            }
        })
        .await
    }
}

fn classify<T>(err: DownloadError) -> RetryAction<T> {
    if err.is_retryable() {
        RetryAction::Retry(err)
    } else {
        RetryAction::Fail(err)
    }
}
