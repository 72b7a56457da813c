// Body decoding: content-encoding decompression and transport stream repair.

use std::io::Read;

use bytes::Bytes;
use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};

use crate::DownloadError;

const PNG_SIGNATURE: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
const TS_SYNC_BYTE: u8 = 0x47;

/// Decode `body` according to a `Content-Encoding` header value.
///
/// Stacked encodings are undone in reverse order of application. An unknown
/// encoding is reported as [`DownloadError::UnsupportedEncoding`].
pub fn decode_content(encoding: Option<&str>, body: Bytes) -> Result<Bytes, DownloadError> {
    let Some(encoding) = encoding else {
        return Ok(body);
    };

    let mut data = body;
    for coding in encoding.rsplit(',').map(str::trim) {
        data = match coding.to_ascii_lowercase().as_str() {
            "" | "identity" => data,
            "gzip" | "x-gzip" => read_all(GzDecoder::new(data.as_ref()), coding)?,
            "deflate" => inflate(&data)?,
            "br" => read_all(brotli::Decompressor::new(data.as_ref(), 4096), coding)?,
            _ => {
                return Err(DownloadError::UnsupportedEncoding {
                    encoding: coding.to_string(),
                });
            }
        };
    }
    Ok(data)
}

/// `deflate` is zlib-wrapped per RFC 9110 but some servers send raw deflate.
fn inflate(data: &[u8]) -> Result<Bytes, DownloadError> {
    read_all(ZlibDecoder::new(data), "deflate")
        .or_else(|_| read_all(DeflateDecoder::new(data), "deflate"))
}

fn read_all(mut reader: impl Read, coding: &str) -> Result<Bytes, DownloadError> {
    let mut out = Vec::new();
    reader
        .read_to_end(&mut out)
        .map_err(|e| DownloadError::Decompression {
            reason: format!("{coding}: {e}"),
        })?;
    Ok(Bytes::from(out))
}

/// Drop an 8-byte PNG signature some origins prepend to disguise segments.
pub fn strip_image_disguise(data: Bytes) -> Bytes {
    if data.starts_with(&PNG_SIGNATURE) {
        data.slice(PNG_SIGNATURE.len()..)
    } else {
        data
    }
}

/// Discard everything before the first transport stream sync byte.
///
/// Returns `None` when the payload contains no sync byte at all.
pub fn align_to_sync_byte(data: Bytes) -> Option<Bytes> {
    let offset = memchr::memchr(TS_SYNC_BYTE, &data)?;
    Some(data.slice(offset..))
}
