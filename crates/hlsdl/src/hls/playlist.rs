// HLS Playlist Document: Parses playlist text into an ordered list of typed parts.

use crate::DownloadError;

/// Encryption method named by an `#EXT-X-KEY` tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyMethod {
    None,
    Aes128,
    /// Any other method; rejected when a segment would use it.
    Other(String),
}

impl KeyMethod {
    fn parse(value: &str) -> Self {
        match value {
            "NONE" => Self::None,
            "AES-128" => Self::Aes128,
            other => Self::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeyTag {
    pub method: KeyMethod,
    pub uri: Option<String>,
    /// Raw IV attribute, hex with an optional `0x` prefix
    pub iv: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaSegment {
    pub uri: String,
    /// Declared duration in seconds; zero when the segment had no `#EXTINF`.
    pub duration: f64,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariantStream {
    pub uri: String,
    pub bandwidth: u64,
    pub resolution: Option<Resolution>,
}

impl VariantStream {
    fn width(&self) -> u32 {
        self.resolution.map(|r| r.width).unwrap_or(0)
    }
}

/// One entry of a playlist, in document order.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaylistPart {
    Key(KeyTag),
    Segment(MediaSegment),
    Variant(VariantStream),
    Discontinuity,
    End,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlaylistDocument {
    pub version: Option<u32>,
    pub media_sequence: u64,
    pub target_duration: Option<f64>,
    pub parts: Vec<PlaylistPart>,
}

/// Entry opened by a tag and completed by the next URI line.
enum Pending {
    Segment {
        duration: f64,
        title: Option<String>,
    },
    Variant {
        bandwidth: u64,
        resolution: Option<Resolution>,
    },
}

impl PlaylistDocument {
    /// Parse playlist text. The first non-empty line must be `#EXTM3U`.
    pub fn parse(text: &str) -> Result<Self, DownloadError> {
        let mut lines = text
            .trim_start_matches('\u{feff}')
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty());

        if lines.next() != Some("#EXTM3U") {
            return Err(DownloadError::playlist("missing #EXTM3U header"));
        }

        let mut doc = PlaylistDocument::default();
        let mut pending: Option<Pending> = None;

        for line in lines {
            let Some(tag) = line.strip_prefix('#') else {
                let uri = line.to_string();
                let part = match pending.take() {
                    Some(Pending::Variant {
                        bandwidth,
                        resolution,
                    }) => PlaylistPart::Variant(VariantStream {
                        uri,
                        bandwidth,
                        resolution,
                    }),
                    Some(Pending::Segment { duration, title }) => {
                        PlaylistPart::Segment(MediaSegment {
                            uri,
                            duration,
                            title,
                        })
                    }
                    None => PlaylistPart::Segment(MediaSegment {
                        uri,
                        duration: 0.0,
                        title: None,
                    }),
                };
                doc.parts.push(part);
                continue;
            };

            let (name, value) = tag.split_once(':').unwrap_or((tag, ""));
            match name {
                "EXT-X-VERSION" => doc.version = Some(parse_number(name, value)?),
                "EXT-X-MEDIA-SEQUENCE" => doc.media_sequence = parse_number(name, value)?,
                "EXT-X-TARGETDURATION" => doc.target_duration = Some(parse_seconds(name, value)?),
                "EXT-X-KEY" => doc.parts.push(PlaylistPart::Key(parse_key(value)?)),
                "EXT-X-DISCONTINUITY" => doc.parts.push(PlaylistPart::Discontinuity),
                "EXTINF" => {
                    let (duration, title) = match value.split_once(',') {
                        Some((duration, title)) => {
                            let title = title.trim();
                            (duration, (!title.is_empty()).then(|| title.to_string()))
                        }
                        None => (value, None),
                    };
                    pending = Some(Pending::Segment {
                        duration: parse_seconds(name, duration)?,
                        title,
                    });
                }
                "EXT-X-STREAM-INF" => {
                    let mut bandwidth = 0;
                    let mut resolution = None;
                    for (key, attr) in parse_attributes(value) {
                        match key.as_str() {
                            "BANDWIDTH" => bandwidth = parse_number("BANDWIDTH", &attr)?,
                            "RESOLUTION" => resolution = parse_resolution(&attr),
                            _ => {}
                        }
                    }
                    pending = Some(Pending::Variant {
                        bandwidth,
                        resolution,
                    });
                }
                "EXT-X-ENDLIST" => {
                    doc.parts.push(PlaylistPart::End);
                    break;
                }
                _ => {}
            }
        }

        Ok(doc)
    }

    /// True when the document only references other playlists.
    pub fn is_master(&self) -> bool {
        self.variants().next().is_some() && self.segments().next().is_none()
    }

    pub fn segments(&self) -> impl Iterator<Item = &MediaSegment> {
        self.parts.iter().filter_map(|part| match part {
            PlaylistPart::Segment(segment) => Some(segment),
            _ => None,
        })
    }

    pub fn variants(&self) -> impl Iterator<Item = &VariantStream> {
        self.parts.iter().filter_map(|part| match part {
            PlaylistPart::Variant(variant) => Some(variant),
            _ => None,
        })
    }

    /// Pick the variant with the highest bandwidth, then the widest
    /// resolution. Ties keep the variant listed first.
    pub fn best_variant(&self) -> Option<&VariantStream> {
        self.variants().fold(None, |best: Option<&VariantStream>, candidate| match best {
            Some(current)
                if candidate.bandwidth < current.bandwidth
                    || (candidate.bandwidth == current.bandwidth
                        && candidate.width() <= current.width()) =>
            {
                Some(current)
            }
            _ => Some(candidate),
        })
    }
}

fn parse_number<T: std::str::FromStr>(tag: &str, value: &str) -> Result<T, DownloadError> {
    value
        .trim()
        .parse()
        .map_err(|_| DownloadError::playlist(format!("invalid {tag} value `{value}`")))
}

fn parse_seconds(tag: &str, value: &str) -> Result<f64, DownloadError> {
    let seconds: f64 = parse_number(tag, value)?;
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(DownloadError::playlist(format!(
            "invalid {tag} value `{value}`"
        )));
    }
    Ok(seconds)
}

fn parse_resolution(value: &str) -> Option<Resolution> {
    let (width, height) = value.split_once(['x', 'X'])?;
    Some(Resolution {
        width: width.trim().parse().ok()?,
        height: height.trim().parse().ok()?,
    })
}

fn parse_key(value: &str) -> Result<KeyTag, DownloadError> {
    let mut method = None;
    let mut uri = None;
    let mut iv = None;
    for (key, attr) in parse_attributes(value) {
        match key.as_str() {
            "METHOD" => method = Some(KeyMethod::parse(&attr)),
            "URI" => uri = Some(attr),
            "IV" => iv = Some(attr),
            _ => {}
        }
    }
    let method = method.ok_or_else(|| DownloadError::playlist("EXT-X-KEY without METHOD"))?;
    Ok(KeyTag { method, uri, iv })
}

/// Split an attribute list on commas outside double quotes and unquote values.
fn parse_attributes(value: &str) -> Vec<(String, String)> {
    let mut attributes = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    let mut push = |item: &str| {
        if let Some((key, attr)) = item.split_once('=') {
            let attr = attr.trim();
            let attr = attr
                .strip_prefix('"')
                .and_then(|a| a.strip_suffix('"'))
                .unwrap_or(attr);
            attributes.push((key.trim().to_ascii_uppercase(), attr.to_string()));
        }
    };
    for (idx, ch) in value.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                push(&value[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    push(&value[start..]);
    attributes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_text_without_header() {
        assert!(PlaylistDocument::parse("").is_err());
        assert!(PlaylistDocument::parse("#EXTM3U8\n1.ts").is_err());
        assert!(PlaylistDocument::parse("<html></html>").is_err());
        assert!(PlaylistDocument::parse("#EXTM3U").is_ok());
    }

    #[test]
    fn parses_media_playlist_parts_in_order() {
        let doc = PlaylistDocument::parse(
            "#EXTM3U
#EXT-X-VERSION:3
#EXT-X-PLAYLIST-TYPE:VOD
#EXT-X-MEDIA-SEQUENCE:7
#EXT-X-TARGETDURATION:8
#EXT-X-KEY:METHOD=AES-128,URI=\"/hls/key.key\",IV=0x10c27a9e3fa363dfe4c44b59b67304b3
#EXT-X-DISCONTINUITY
#EXTINF:4,first
0000000.ts
#EXTINF:4.24,
0000001.ts
bare.ts
#EXT-X-ENDLIST
ignored.ts
",
        )
        .unwrap();

        assert_eq!(doc.version, Some(3));
        assert_eq!(doc.media_sequence, 7);
        assert_eq!(doc.target_duration, Some(8.0));
        assert_eq!(doc.parts.len(), 6);
        assert_eq!(
            doc.parts[0],
            PlaylistPart::Key(KeyTag {
                method: KeyMethod::Aes128,
                uri: Some("/hls/key.key".into()),
                iv: Some("0x10c27a9e3fa363dfe4c44b59b67304b3".into()),
            })
        );
        assert_eq!(doc.parts[1], PlaylistPart::Discontinuity);
        assert_eq!(
            doc.parts[2],
            PlaylistPart::Segment(MediaSegment {
                uri: "0000000.ts".into(),
                duration: 4.0,
                title: Some("first".into()),
            })
        );
        assert_eq!(
            doc.parts[4],
            PlaylistPart::Segment(MediaSegment {
                uri: "bare.ts".into(),
                duration: 0.0,
                title: None,
            })
        );
        assert_eq!(doc.parts[5], PlaylistPart::End);
        assert!(!doc.is_master());
    }

    #[test]
    fn key_method_none_and_unknown_methods() {
        let doc = PlaylistDocument::parse(
            "#EXTM3U
#EXT-X-KEY:METHOD=NONE
#EXT-X-KEY:METHOD=SAMPLE-AES,URI=\"k\",KEYFORMAT=\"identity\"
",
        )
        .unwrap();
        assert!(matches!(
            &doc.parts[0],
            PlaylistPart::Key(KeyTag { method: KeyMethod::None, uri: None, .. })
        ));
        assert!(matches!(
            &doc.parts[1],
            PlaylistPart::Key(KeyTag { method: KeyMethod::Other(m), .. }) if m == "SAMPLE-AES"
        ));
    }

    #[test]
    fn quoted_attributes_may_contain_commas() {
        let attrs = parse_attributes("METHOD=AES-128,URI=\"key?a=1,b=2\",IV=0x01");
        assert_eq!(
            attrs,
            vec![
                ("METHOD".to_string(), "AES-128".to_string()),
                ("URI".to_string(), "key?a=1,b=2".to_string()),
                ("IV".to_string(), "0x01".to_string()),
            ]
        );
    }

    #[test]
    fn numeric_tags_are_strict() {
        assert!(PlaylistDocument::parse("#EXTM3U\n#EXT-X-MEDIA-SEQUENCE:abc").is_err());
        assert!(PlaylistDocument::parse("#EXTM3U\n#EXTINF:x,\n1.ts").is_err());
        assert!(PlaylistDocument::parse("#EXTM3U\n#EXTINF:-1,\n1.ts").is_err());
    }

    #[test]
    fn best_variant_prefers_bandwidth_then_width() {
        let doc = PlaylistDocument::parse(
            "#EXTM3U
#EXT-X-VERSION:3
#EXT-X-STREAM-INF:BANDWIDTH=1280000,RESOLUTION=640x480
master_640x480.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=2560000,RESOLUTION=1280x720
master_1280x720.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=5120000,RESOLUTION=1920x1080
master_1920x1080.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=5120000,RESOLUTION=2560x1440
master_2560X1440.m3u8
",
        )
        .unwrap();
        assert_eq!(doc.parts.len(), 4);
        assert!(doc.is_master());
        assert_eq!(doc.best_variant().unwrap().uri, "master_2560X1440.m3u8");
    }

    #[test]
    fn best_variant_full_tie_keeps_first() {
        let doc = PlaylistDocument::parse(
            "#EXTM3U
#EXT-X-STREAM-INF:BANDWIDTH=100,RESOLUTION=640x360
a.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=100,RESOLUTION=640x360
b.m3u8
",
        )
        .unwrap();
        assert_eq!(doc.best_variant().unwrap().uri, "a.m3u8");
    }
}
