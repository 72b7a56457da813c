// Skip Filter: Parses the skip expression and selects which planned segments to download.
//
// Expression clauses are comma separated:
//   N                        skip segment N
//   N1-N2                    skip segments N1 through N2
//   http.code=NNN            treat status NNN as "skip, don't fail"
//   if-http.code-merge_ts    assemble even if segments were skipped by status
//   time:HH:MM:SS-HH:MM:SS   skip segments overlapping the range
//   !time:HH:MM:SS-HH:MM:SS  keep only segments overlapping the range

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::DownloadError;
use crate::hls::segment::Segment;

static SINGLE_INDEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9]+)$").expect("valid regex"));
static INDEX_RANGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9]+) *- *([0-9]+)$").expect("valid regex"));
static HTTP_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^http\.code *= *([0-9]+)$").expect("valid regex"));
static TIME_RANGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(!?time) *: *([0-9]{2}):([0-9]{2}):([0-9]{2}) *- *([0-9]{2}):([0-9]{2}):([0-9]{2})$")
        .expect("valid regex")
});

const MERGE_DESPITE_HTTP_SKIPS: &str = "if-http.code-merge_ts";

/// Segments with a shorter declared duration count as having none.
const MIN_DURATION: f64 = 1e-5;

/// Inclusive range, in segment ordinals or in seconds from stream start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkipRange {
    pub start: u64,
    pub end: u64,
    /// Clause this range was parsed from
    pub origin: String,
}

impl SkipRange {
    fn contains(&self, value: u64) -> bool {
        self.start <= value && value <= self.end
    }

    /// The window `[begin, end)` overlaps this range with positive width.
    pub fn overlaps(&self, begin: f64, end: f64) -> bool {
        let overlap_begin = begin.max(self.start as f64);
        let overlap_end = end.min(self.end as f64);
        overlap_end > overlap_begin
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SkipSpec {
    pub skip_by_index: Vec<SkipRange>,
    pub skip_by_time: Vec<SkipRange>,
    pub keep_by_time: Vec<SkipRange>,
    /// Sorted ascending, without duplicates
    pub tolerated_http_codes: Vec<u16>,
    pub merge_despite_http_skips: bool,
    pub skip_discontinuity_wrapped: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExclusionReason {
    OutsideKeepWindow,
    Clause(String),
    DiscontinuityWrapped,
}

impl fmt::Display for ExclusionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutsideKeepWindow => f.write_str("outside keep window"),
            Self::Clause(clause) => write!(f, "skipped by \"{clause}\""),
            Self::DiscontinuityWrapped => f.write_str("discontinuity-wrapped"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FilterOutcome {
    pub kept: Vec<Segment>,
    pub excluded: Vec<(Segment, ExclusionReason)>,
}

impl SkipSpec {
    pub fn parse(expression: &str) -> Result<Self, DownloadError> {
        let mut spec = Self::default();
        let expression = expression.trim();
        if expression.is_empty() {
            return Ok(spec);
        }

        for clause in expression.split(',').map(str::trim) {
            let invalid = || DownloadError::skip_expression(clause);

            if let Some(caps) = SINGLE_INDEX.captures(clause) {
                let index = parse_ordinal(&caps[1]).ok_or_else(invalid)?;
                spec.skip_by_index.push(SkipRange {
                    start: index,
                    end: index,
                    origin: clause.to_string(),
                });
            } else if let Some(caps) = INDEX_RANGE.captures(clause) {
                let start = parse_ordinal(&caps[1]).ok_or_else(invalid)?;
                let end = parse_ordinal(&caps[2]).ok_or_else(invalid)?;
                if start > end {
                    return Err(invalid());
                }
                spec.skip_by_index.push(SkipRange {
                    start,
                    end,
                    origin: clause.to_string(),
                });
            } else if let Some(caps) = HTTP_CODE.captures(clause) {
                let code: u16 = caps[1].parse().map_err(|_| invalid())?;
                if !(100..=599).contains(&code) {
                    return Err(invalid());
                }
                spec.tolerated_http_codes.push(code);
            } else if clause == MERGE_DESPITE_HTTP_SKIPS {
                spec.merge_despite_http_skips = true;
            } else if let Some(caps) = TIME_RANGE.captures(clause) {
                let start = clock_seconds(&caps[2], &caps[3], &caps[4]).ok_or_else(invalid)?;
                let end = clock_seconds(&caps[5], &caps[6], &caps[7]).ok_or_else(invalid)?;
                if start >= end {
                    return Err(invalid());
                }
                let range = SkipRange {
                    start,
                    end,
                    origin: clause.to_string(),
                };
                if &caps[1] == "!time" {
                    spec.keep_by_time.push(range);
                } else {
                    spec.skip_by_time.push(range);
                }
            } else {
                return Err(invalid());
            }
        }

        spec.tolerated_http_codes.sort_unstable();
        spec.tolerated_http_codes.dedup();
        Ok(spec)
    }

    pub fn tolerates(&self, status: u16) -> bool {
        self.tolerated_http_codes.binary_search(&status).is_ok()
    }

    /// Split `segments` into the download set and the excluded segments.
    ///
    /// Time rules only apply when every segment declares a duration.
    pub fn apply(&self, segments: Vec<Segment>) -> FilterOutcome {
        let timed = segments.iter().all(|s| s.duration >= MIN_DURATION);
        let mut outcome = FilterOutcome::default();
        let mut begin = 0.0;

        for segment in segments {
            let end = begin + segment.duration;
            let window = timed.then_some((begin, end));
            begin = end;

            match self.exclusion_reason(&segment, window) {
                Some(reason) => outcome.excluded.push((segment, reason)),
                None => outcome.kept.push(segment),
            }
        }
        outcome
    }

    fn exclusion_reason(
        &self,
        segment: &Segment,
        window: Option<(f64, f64)>,
    ) -> Option<ExclusionReason> {
        if let Some((begin, end)) = window {
            if !self.keep_by_time.is_empty()
                && !self.keep_by_time.iter().any(|r| r.overlaps(begin, end))
            {
                return Some(ExclusionReason::OutsideKeepWindow);
            }
            if let Some(range) = self.skip_by_time.iter().find(|r| r.overlaps(begin, end)) {
                return Some(ExclusionReason::Clause(range.origin.clone()));
            }
        }

        if let Some(range) = self
            .skip_by_index
            .iter()
            .find(|r| r.contains(segment.ordinal as u64))
        {
            return Some(ExclusionReason::Clause(range.origin.clone()));
        }

        if self.skip_discontinuity_wrapped && segment.discontinuity_wrapped {
            return Some(ExclusionReason::DiscontinuityWrapped);
        }
        None
    }
}

fn parse_ordinal(digits: &str) -> Option<u64> {
    digits.parse().ok().filter(|n| *n >= 1)
}

fn clock_seconds(hours: &str, minutes: &str, seconds: &str) -> Option<u64> {
    let hours: u64 = hours.parse().ok()?;
    let minutes: u64 = minutes.parse().ok()?;
    let seconds: u64 = seconds.parse().ok()?;
    (minutes < 60 && seconds < 60).then_some(hours * 3600 + minutes * 60 + seconds)
}
