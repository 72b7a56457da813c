// HLS Download Scheduler: Drives the segment fetcher over the planned segment list.
//
// At most `concurrency` segments are in flight at once. Each segment is retried
// according to the fetcher retry policy; the first segment that exhausts its
// attempts halts dispatch of new work while in-flight segments run to completion.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::DownloadError;
use crate::hls::config::{HlsConfig, MAX_CONCURRENCY, MIN_CONCURRENCY};
use crate::hls::fetcher::SegmentDownloader;
use crate::hls::filter::{ExclusionReason, SkipSpec};
use crate::hls::retry::{RetryAction, RetryPolicy, SleepGauge, retry_with_backoff};
use crate::hls::segment::{Disposition, Segment, SegmentReport};
use crate::hls::throughput::ThroughputTracker;

/// Shared inputs of one scheduling run.
pub struct ScheduleContext<'a> {
    /// Directory the segment files are written to
    pub dir: &'a Path,
    /// Supplies the tolerated status codes
    pub skip: &'a SkipSpec,
    pub tracker: &'a ThroughputTracker,
    pub gauge: &'a SleepGauge,
    pub token: &'a CancellationToken,
}

/// Per-segment reports in ordinal order, plus the first fatal error.
#[derive(Debug)]
pub struct ScheduleOutcome {
    pub reports: Vec<SegmentReport>,
    pub fatal: Option<DownloadError>,
    pub cancelled: bool,
}

impl ScheduleOutcome {
    pub fn count(&self, disposition: Disposition) -> usize {
        self.reports
            .iter()
            .filter(|r| r.disposition == disposition)
            .count()
    }

    pub fn with_disposition(
        &self,
        disposition: Disposition,
    ) -> impl Iterator<Item = &SegmentReport> {
        self.reports
            .iter()
            .filter(move |r| r.disposition == disposition)
    }

    pub fn is_complete(&self) -> bool {
        self.fatal.is_none() && !self.cancelled
    }

    /// Reports for every planned segment in ordinal order: the scheduled
    /// ones plus the segments the filter dropped before scheduling.
    pub fn planned_reports(
        &self,
        excluded: &[(Segment, ExclusionReason)],
    ) -> Vec<SegmentReport> {
        let mut reports: Vec<SegmentReport> = self
            .reports
            .iter()
            .cloned()
            .chain(
                excluded
                    .iter()
                    .map(|(segment, reason)| SegmentReport::excluded(segment, reason)),
            )
            .collect();
        reports.sort_by_key(|report| report.ordinal);
        reports
    }
}

enum Fetched {
    Written(u64),
    Tolerated(u16),
}

#[derive(Default)]
struct LastFailure {
    status: Option<u16>,
    message: Option<String>,
}

pub struct DownloadScheduler<D: ?Sized> {
    downloader: Arc<D>,
    concurrency: usize,
    retry: RetryPolicy,
}

impl<D: SegmentDownloader + ?Sized> DownloadScheduler<D> {
    pub fn new(downloader: Arc<D>, config: &HlsConfig) -> Self {
        Self {
            downloader,
            concurrency: config
                .scheduler_config
                .concurrency
                .clamp(MIN_CONCURRENCY, MAX_CONCURRENCY),
            retry: config.fetcher_config.retry.clone(),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub async fn run(&self, segments: &[Segment], ctx: &ScheduleContext<'_>) -> ScheduleOutcome {
        info!(
            segments = segments.len(),
            concurrency = self.concurrency,
            "Scheduling segment downloads"
        );

        let halt = ctx.token.child_token();
        let mut reports: Vec<Option<SegmentReport>> = vec![None; segments.len()];
        let mut fatal: Option<DownloadError> = None;
        let mut pending = segments.iter().enumerate();
        let mut in_flight = FuturesUnordered::new();

        loop {
            while in_flight.len() < self.concurrency && !halt.is_cancelled() {
                let Some((index, segment)) = pending.next() else {
                    break;
                };
                let halt = &halt;
                in_flight.push(async move { (index, self.process(segment, ctx, halt).await) });
            }

            let Some((index, (report, error))) = in_flight.next().await else {
                break;
            };

            if let Some(err) = error {
                if fatal.is_none() {
                    error!(
                        segment = report.ordinal,
                        attempts = report.attempts,
                        error = %err,
                        "Segment failed permanently, halting new downloads"
                    );
                    fatal = Some(err);
                    halt.cancel();
                } else {
                    warn!(segment = report.ordinal, error = %err, "Additional segment failure");
                }
            }
            reports[index] = Some(report);
        }

        let reports: Vec<SegmentReport> = reports
            .into_iter()
            .zip(segments)
            .map(|(report, segment)| {
                report.unwrap_or_else(|| SegmentReport::new(segment, Disposition::Cancelled))
            })
            .collect();

        let outcome = ScheduleOutcome {
            reports,
            fatal,
            cancelled: ctx.token.is_cancelled(),
        };
        info!(
            downloaded = outcome.count(Disposition::Downloaded),
            skipped_by_http_code = outcome.count(Disposition::SkippedByHttpCode),
            failed = outcome.count(Disposition::Failed),
            cancelled = outcome.count(Disposition::Cancelled),
            "Segment scheduling finished"
        );
        outcome
    }

    /// Runs every attempt for one segment and produces its final report.
    ///
    /// The returned error is set only when the segment itself failed
    /// permanently.
    async fn process(
        &self,
        segment: &Segment,
        ctx: &ScheduleContext<'_>,
        halt: &CancellationToken,
    ) -> (SegmentReport, Option<DownloadError>) {
        let mut report = SegmentReport::new(segment, Disposition::Cancelled);

        if let Some(bytes) = existing_file_len(&ctx.dir.join(&segment.file_name)).await {
            debug!(segment = segment.ordinal, bytes, "Segment already on disk");
            ctx.tracker.record_completed(Instant::now(), bytes);
            report.disposition = Disposition::Downloaded;
            report.bytes = bytes;
            return (report, None);
        }

        let attempts = AtomicU32::new(0);
        let last_failure = Mutex::new(LastFailure::default());

        let result = retry_with_backoff(&self.retry, halt, Some(ctx.gauge), |_| {
            attempts.fetch_add(1, Ordering::Relaxed);
            let last_failure = &last_failure;
            async move {
                let err = match self
                    .downloader
                    .fetch_segment(segment, ctx.dir, ctx.tracker)
                    .await
                {
                    Ok(bytes) => return RetryAction::Success(Fetched::Written(bytes)),
                    Err(err) => err,
                };

                let status = err.status_code();
                if let Some(code) = status
                    && ctx.skip.tolerates(code)
                {
                    return RetryAction::Success(Fetched::Tolerated(code));
                }
                if !matches!(err, DownloadError::Cancelled) {
                    let mut last = last_failure.lock();
                    last.status = status;
                    last.message = Some(err.to_string());
                }
                if err.is_retryable() {
                    RetryAction::Retry(err)
                } else {
                    RetryAction::Fail(err)
                }
            }
        })
        .await;

        report.attempts = attempts.into_inner();
        let last_failure = last_failure.into_inner();
        report.http_status = last_failure.status;
        report.last_error = last_failure.message;

        match result {
            Ok(Fetched::Written(bytes)) => {
                report.disposition = Disposition::Downloaded;
                report.bytes = bytes;
                report.http_status = Some(200);
                (report, None)
            }
            Ok(Fetched::Tolerated(code)) => {
                info!(
                    segment = segment.ordinal,
                    status = code,
                    "Segment skipped by tolerated status"
                );
                report.disposition = Disposition::SkippedByHttpCode;
                report.http_status = Some(code);
                (report, None)
            }
            Err(DownloadError::Cancelled) => {
                // Halted by another segment's failure while waiting to retry.
                if report.last_error.is_some() && !ctx.token.is_cancelled() {
                    report.disposition = Disposition::Failed;
                }
                (report, None)
            }
            Err(err) => {
                report.disposition = Disposition::Failed;
                report.last_error = Some(err.to_string());
                (report, Some(err))
            }
        }
    }
}

async fn existing_file_len(path: &Path) -> Option<u64> {
    let metadata = tokio::fs::metadata(path).await.ok()?;
    (metadata.is_file() && metadata.len() > 0).then_some(metadata.len())
}
