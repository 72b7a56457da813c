// HLS Segment Planner: Turns a media playlist into an ordered, addressable segment list.

use url::Url;

use crate::DownloadError;
use crate::hls::playlist::{KeyMethod, KeyTag, PlaylistDocument, PlaylistPart};
use crate::hls::segment::{EncryptionDescriptor, Segment};

/// Resolve a playlist reference against the URL of the playlist that contains it.
pub fn resolve_uri(base_url: &Url, reference: &str) -> Result<Url, DownloadError> {
    base_url.join(reference).map_err(|e| {
        DownloadError::invalid_url(reference, format!("cannot resolve against {base_url}: {e}"))
    })
}

/// Build the ordered segment list of a media playlist.
///
/// Key content is not fetched here; each encrypted segment only carries the
/// resolved key URI and its IV.
pub fn plan_segments(
    doc: &PlaylistDocument,
    base_url: &Url,
) -> Result<Vec<Segment>, DownloadError> {
    let total_markers = doc
        .parts
        .iter()
        .filter(|part| matches!(part, PlaylistPart::Discontinuity))
        .count();

    let mut segments: Vec<Segment> = Vec::new();
    let mut discontinuity_group = 0u32;
    let mut markers_seen = 0usize;
    let mut current_key: Option<&KeyTag> = None;

    for part in &doc.parts {
        match part {
            PlaylistPart::Discontinuity => {
                markers_seen += 1;
                if !segments.is_empty() {
                    discontinuity_group += 1;
                }
            }
            PlaylistPart::Key(tag) => {
                current_key = match tag.method {
                    KeyMethod::None => None,
                    _ => Some(tag),
                };
            }
            PlaylistPart::Segment(media) => {
                let ordinal = segments.len() + 1;
                let sequence = doc
                    .media_sequence
                    .checked_add(ordinal as u64 - 1)
                    .ok_or_else(|| DownloadError::playlist("media sequence overflow"))?;
                let encryption = current_key
                    .map(|tag| plan_encryption(tag, base_url, sequence))
                    .transpose()?;

                segments.push(Segment {
                    ordinal,
                    uri: resolve_uri(base_url, &media.uri)?,
                    file_name: Segment::file_name_for(ordinal),
                    duration: media.duration,
                    sequence,
                    discontinuity_group,
                    discontinuity_wrapped: markers_seen > 0 && markers_seen < total_markers,
                    encryption,
                });
            }
            PlaylistPart::Variant(_) | PlaylistPart::End => {}
        }
    }

    Ok(segments)
}

fn plan_encryption(
    tag: &KeyTag,
    base_url: &Url,
    sequence: u64,
) -> Result<EncryptionDescriptor, DownloadError> {
    if let KeyMethod::Other(method) = &tag.method {
        return Err(DownloadError::UnsupportedEncryption {
            method: method.clone(),
        });
    }

    let key_uri = tag
        .uri
        .as_deref()
        .ok_or_else(|| DownloadError::invalid_key("EXT-X-KEY without URI"))?;

    let iv = match tag.iv.as_deref() {
        Some(raw) => decode_iv(raw)?,
        None => sequence_iv(sequence),
    };

    Ok(EncryptionDescriptor {
        key_uri: resolve_uri(base_url, key_uri)?,
        key: None,
        iv,
    })
}

/// IV derived from the media sequence number: big-endian in the low 8 bytes.
pub fn sequence_iv(sequence: u64) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[8..].copy_from_slice(&sequence.to_be_bytes());
    iv
}

fn decode_iv(raw: &str) -> Result<[u8; 16], DownloadError> {
    let digits = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .unwrap_or(raw);
    let bytes = hex::decode(digits)
        .map_err(|e| DownloadError::invalid_key(format!("invalid IV `{raw}`: {e}")))?;
    <[u8; 16]>::try_from(bytes.as_slice())
        .map_err(|_| DownloadError::invalid_key(format!("IV `{raw}` is not 16 bytes")))
}
