use std::fmt;

use url::Url;

use crate::hls::filter::ExclusionReason;

/// Resolved encryption parameters for one segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionDescriptor {
    pub key_uri: Url,
    /// Key content, filled in by the key store after planning.
    pub key: Option<[u8; 16]>,
    pub iv: [u8; 16],
}

/// A planned media segment.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    /// 1-based position in the planned list
    pub ordinal: usize,
    pub uri: Url,
    /// File name inside the segment directory, e.g. `00001.ts`
    pub file_name: String,
    /// Declared duration in seconds, zero when unknown
    pub duration: f64,
    /// Media sequence number, used for IV derivation
    pub sequence: u64,
    pub discontinuity_group: u32,
    /// A discontinuity marker appears both before and after this segment
    pub discontinuity_wrapped: bool,
    pub encryption: Option<EncryptionDescriptor>,
}

impl Segment {
    pub fn file_name_for(ordinal: usize) -> String {
        format!("{ordinal:05}.ts")
    }
}

/// Terminal state of a segment after filtering and scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Downloaded,
    SkippedByFilter,
    SkippedByHttpCode,
    Failed,
    Cancelled,
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Downloaded => "downloaded",
            Self::SkippedByFilter => "skipped-by-filter",
            Self::SkippedByHttpCode => "skipped-by-http-code",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(text)
    }
}

/// Final record for one scheduled segment.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentReport {
    pub ordinal: usize,
    pub file_name: String,
    pub uri: Url,
    pub disposition: Disposition,
    /// Status observed on the final attempt, when the server answered
    pub http_status: Option<u16>,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Bytes written to disk for a downloaded segment
    pub bytes: u64,
    /// Why the skip filter dropped the segment
    pub exclusion: Option<String>,
}

impl SegmentReport {
    pub(crate) fn new(segment: &Segment, disposition: Disposition) -> Self {
        Self {
            ordinal: segment.ordinal,
            file_name: segment.file_name.clone(),
            uri: segment.uri.clone(),
            disposition,
            http_status: None,
            attempts: 0,
            last_error: None,
            bytes: 0,
            exclusion: None,
        }
    }

    pub(crate) fn excluded(segment: &Segment, reason: &ExclusionReason) -> Self {
        Self {
            exclusion: Some(reason.to_string()),
            ..Self::new(segment, Disposition::SkippedByFilter)
        }
    }
}
