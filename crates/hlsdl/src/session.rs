//! Download session: owns one download at a time and exposes its status for polling.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::assembler::{ConcatAssembler, ContainerAssembler};
use crate::cache::{ManifestCache, RequestIdentity, ResultCache};
use crate::client::create_client;
use crate::hls::config::{HlsConfig, MAX_CONCURRENCY, MIN_CONCURRENCY};
use crate::hls::decryption::KeyStore;
use crate::hls::fetcher::SegmentFetcher;
use crate::hls::filter::SkipSpec;
use crate::hls::planner::plan_segments;
use crate::hls::resolver::{HttpPlaylistProvider, PlaylistResolver};
use crate::hls::retry::{RetryPolicy, SleepGauge};
use crate::hls::scheduler::{DownloadScheduler, ScheduleContext};
use crate::hls::segment::{Disposition, SegmentReport};
use crate::hls::throughput::ThroughputTracker;
use crate::proxy::ProxyConfig;
use crate::{DownloadError, DownloaderConfig};

pub const TITLE_RESOLVE: &str = "[1/4] resolve playlist";
pub const TITLE_PLAN: &str = "[2/4] plan segments";
pub const TITLE_DOWNLOAD: &str = "[3/4] download segments";
pub const TITLE_ASSEMBLE: &str = "[4/4] assemble output";

/// Name of the tolerated-status report written next to the segments.
pub const SKIP_REPORT_FILE_NAME: &str = "skip_by_http_code.txt";

const DOWNLOADING_DIR: &str = "downloading";
const OUTPUT_EXTENSION: &str = "ts";
const MAX_OUTPUT_INDEX: u32 = 9999;

/// Everything an operator specifies for one download.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Playlist or page URL
    pub url: String,
    /// Output directory, the working directory when unset
    pub save_dir: Option<PathBuf>,
    /// Segment staging directory, `save_dir` when unset
    pub temp_dir: Option<PathBuf>,
    /// Output base name without extension, derived from the URL when unset
    pub file_name: Option<String>,
    pub concurrency: usize,
    pub headers: Vec<(String, String)>,
    pub proxy: Option<String>,
    pub insecure: bool,
    pub skip_expression: String,
    pub skip_discontinuity_wrapped: bool,
    /// Keep the segment directory after a successful assembly
    pub keep_segments: bool,
    /// Stop after downloading; no output file is produced
    pub skip_assembly: bool,
    pub use_cache: bool,
    pub retry: RetryPolicy,
    pub segment_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            save_dir: None,
            temp_dir: None,
            file_name: None,
            concurrency: 8,
            headers: Vec::new(),
            proxy: None,
            insecure: false,
            skip_expression: String::new(),
            skip_discontinuity_wrapped: false,
            keep_segments: false,
            skip_assembly: false,
            use_cache: true,
            retry: RetryPolicy::default(),
            segment_timeout: Duration::from_secs(120),
        }
    }
}

impl SessionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Validate the configuration and fill in defaults.
    fn prepare(self) -> Result<PreparedRequest, DownloadError> {
        let url = Url::parse(self.url.trim())
            .map_err(|e| DownloadError::invalid_url(&self.url, e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(DownloadError::invalid_url(
                &self.url,
                "only http and https URLs are supported",
            ));
        }

        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&self.concurrency) {
            return Err(DownloadError::configuration(format!(
                "concurrency must be between {MIN_CONCURRENCY} and {MAX_CONCURRENCY}, got {}",
                self.concurrency
            )));
        }

        let skip = SkipSpec {
            skip_discontinuity_wrapped: self.skip_discontinuity_wrapped,
            ..SkipSpec::parse(&self.skip_expression)?
        };

        let mut base = DownloaderConfig::for_target(&url, &self.headers)?;
        base.proxy = match self.proxy.as_deref().map(str::trim) {
            Some(proxy) if !proxy.is_empty() => Some(ProxyConfig::parse(proxy)?),
            _ => None,
        };
        base.danger_accept_invalid_certs = self.insecure;

        let mut hls = HlsConfig {
            base,
            ..HlsConfig::default()
        };
        hls.scheduler_config.concurrency = self.concurrency;
        hls.fetcher_config.retry = self.retry.clone();
        hls.fetcher_config.segment_download_timeout = self.segment_timeout;

        let save_dir = match self.save_dir {
            Some(dir) => dir,
            None => std::env::current_dir()?,
        };
        let temp_dir = self.temp_dir.unwrap_or_else(|| save_dir.clone());
        let file_name = match self.file_name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => file_name_from_url(&url),
        };

        let fingerprint = RequestIdentity {
            url: url.as_str(),
            headers: &self.headers,
            skip_expression: self.skip_expression.trim(),
            skip_discontinuity_wrapped: self.skip_discontinuity_wrapped,
        }
        .fingerprint()?;

        Ok(PreparedRequest {
            url,
            save_dir,
            temp_dir,
            file_name,
            skip,
            hls: Arc::new(hls),
            fingerprint,
            keep_segments: self.keep_segments,
            skip_assembly: self.skip_assembly,
            use_cache: self.use_cache,
        })
    }
}

struct PreparedRequest {
    url: Url,
    save_dir: PathBuf,
    temp_dir: PathBuf,
    file_name: String,
    skip: SkipSpec,
    hls: Arc<HlsConfig>,
    fingerprint: String,
    keep_segments: bool,
    skip_assembly: bool,
    use_cache: bool,
}

/// Polled view of a session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionStatus {
    pub percent: u8,
    pub title: String,
    /// Speed and ETA text, with the number of workers waiting to retry
    pub speed_text: String,
    pub running: bool,
    pub error: Option<String>,
    pub cancelled: bool,
    /// Final output file, or the segment directory when assembly was skipped
    pub output: Option<PathBuf>,
    /// The output was found in the result cache
    pub already_satisfied: bool,
}

#[derive(Debug, Default)]
struct SessionState {
    running: bool,
    title: String,
    error: Option<String>,
    cancelled: bool,
    output: Option<PathBuf>,
    already_satisfied: bool,
    finished: bool,
    token: Option<CancellationToken>,
    reports: Vec<SegmentReport>,
}

struct SessionShared {
    state: Mutex<SessionState>,
    tracker: ThroughputTracker,
    gauge: SleepGauge,
    done: Notify,
}

impl SessionShared {
    fn set_title(&self, title: &str) {
        info!(phase = title, "Entering phase");
        self.state.lock().title = title.to_string();
    }
}

/// What a completed run produced.
enum RunResult {
    Output(PathBuf),
    Cached(PathBuf),
}

/// Single-flight download session.
///
/// `start` launches a download on the Tokio runtime and returns at once;
/// a second `start` while one is running is rejected.
pub struct DownloadSession {
    shared: Arc<SessionShared>,
    assembler: Arc<dyn ContainerAssembler>,
    cache: Option<Arc<dyn ResultCache>>,
}

impl Default for DownloadSession {
    fn default() -> Self {
        Self::new()
    }
}

impl DownloadSession {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(SessionShared {
                state: Mutex::new(SessionState::default()),
                tracker: ThroughputTracker::new(),
                gauge: SleepGauge::default(),
                done: Notify::new(),
            }),
            assembler: Arc::new(ConcatAssembler::new()),
            cache: None,
        }
    }

    pub fn with_assembler(mut self, assembler: Arc<dyn ContainerAssembler>) -> Self {
        self.assembler = assembler;
        self
    }

    /// Use `cache` instead of a manifest in each request's save directory.
    pub fn with_cache(mut self, cache: Arc<dyn ResultCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Validate `config` and start downloading in the background.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self, config: SessionConfig) -> Result<(), DownloadError> {
        let mut state = self.shared.state.lock();
        if state.running {
            return Err(DownloadError::AlreadyRunning);
        }
        let request = config.prepare()?;

        let token = CancellationToken::new();
        *state = SessionState {
            running: true,
            token: Some(token.clone()),
            ..SessionState::default()
        };
        drop(state);

        let shared = Arc::clone(&self.shared);
        let assembler = Arc::clone(&self.assembler);
        let cache = match (&self.cache, request.use_cache) {
            (_, false) => None,
            (Some(cache), true) => Some(Arc::clone(cache)),
            (None, true) => {
                Some(Arc::new(ManifestCache::new(&request.save_dir)) as Arc<dyn ResultCache>)
            }
        };

        info!(url = %request.url, "Download session started");
        tokio::spawn(async move {
            let result = run(
                &shared,
                &request,
                assembler.as_ref(),
                cache.as_deref(),
                &token,
            )
            .await;

            let mut state = shared.state.lock();
            match result {
                Ok(RunResult::Output(path)) => {
                    info!(output = %path.display(), "Download session finished");
                    state.output = Some(path);
                    state.finished = true;
                }
                Ok(RunResult::Cached(path)) => {
                    info!(output = %path.display(), "Output already satisfied by cache");
                    state.output = Some(path);
                    state.already_satisfied = true;
                    state.finished = true;
                }
                Err(e) => {
                    state.cancelled = matches!(e, DownloadError::Cancelled) || token.is_cancelled();
                    if state.cancelled {
                        info!("Download session cancelled");
                    } else {
                        error!(error = %e, "Download session failed");
                    }
                    state.error = Some(e.to_string());
                }
            }
            state.running = false;
            state.token = None;
            drop(state);
            shared.done.notify_waiters();
        });
        Ok(())
    }

    /// Request cancellation of the running download.
    pub fn stop(&self) {
        if let Some(token) = &self.shared.state.lock().token {
            token.cancel();
        }
    }

    /// Per-segment outcome of the last download, one report per planned
    /// segment in ordinal order. Empty until scheduling has finished.
    pub fn reports(&self) -> Vec<SegmentReport> {
        self.shared.state.lock().reports.clone()
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }

    pub fn status(&self) -> SessionStatus {
        let state = self.shared.state.lock();
        let mut status = SessionStatus {
            percent: if state.finished {
                100
            } else {
                self.shared.tracker.percent()
            },
            title: state.title.clone(),
            speed_text: String::new(),
            running: state.running,
            error: state.error.clone(),
            cancelled: state.cancelled,
            output: state.output.clone(),
            already_satisfied: state.already_satisfied,
        };
        drop(state);

        if status.running
            && let Some(throughput) = self.shared.tracker.speed_and_eta(Instant::now())
        {
            status.speed_text = throughput.to_text();
        }
        let sleeping = self.shared.gauge.current();
        if sleeping > 0 {
            if !status.speed_text.is_empty() {
                status.speed_text.push_str(", ");
            }
            let _ = write!(status.speed_text, "{sleeping} sleeping");
        }
        status
    }

    /// Wait until the current download, if any, has finished.
    pub async fn wait(&self) -> SessionStatus {
        loop {
            let notified = self.shared.done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_running() {
                return self.status();
            }
            notified.await;
        }
    }
}

async fn run(
    shared: &SessionShared,
    request: &PreparedRequest,
    assembler: &dyn ContainerAssembler,
    cache: Option<&dyn ResultCache>,
    token: &CancellationToken,
) -> Result<RunResult, DownloadError> {
    let downloading_dir = request.temp_dir.join(DOWNLOADING_DIR);
    for dir in [&request.save_dir, &request.temp_dir, &downloading_dir] {
        tokio::fs::create_dir_all(dir).await?;
    }

    if let Some(cache) = cache {
        match cache.lookup(&request.fingerprint).await {
            Ok(Some(path)) => return Ok(RunResult::Cached(path)),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Result cache lookup failed"),
        }
    }

    shared.set_title(TITLE_RESOLVE);
    let client = create_client(&request.hls.base)?;
    let provider =
        HttpPlaylistProvider::new(client.clone(), Arc::clone(&request.hls), token.clone());
    let resolver = PlaylistResolver::new(provider, request.hls.playlist_config.max_hops);
    let resolved = resolver.resolve(&request.url).await?;

    shared.set_title(TITLE_PLAN);
    let planned = plan_segments(&resolved.document, &resolved.url)?;
    let planned_count = planned.len();
    let filtered = request.skip.apply(planned);
    for (segment, reason) in &filtered.excluded {
        debug!(segment = segment.ordinal, %reason, "Segment excluded");
    }
    let mut segments = filtered.kept;
    if segments.is_empty() {
        return Err(DownloadError::NotFound {
            resource: format!("segments to download after filtering {planned_count} planned"),
        });
    }
    info!(
        planned = planned_count,
        kept = segments.len(),
        excluded = filtered.excluded.len(),
        "Segments planned"
    );

    let keys = KeyStore::new(client.clone(), Arc::clone(&request.hls), token.clone());
    keys.resolve_keys(&mut segments).await?;

    let segment_dir = downloading_dir.join(hex::encode(Sha256::digest(resolved.url.as_str())));
    tokio::fs::create_dir_all(&segment_dir).await?;

    shared.set_title(TITLE_DOWNLOAD);
    shared.tracker.reset(segments.len() as u64, Instant::now());
    let fetcher = Arc::new(SegmentFetcher::new(
        client,
        Arc::clone(&request.hls),
        token.clone(),
    ));
    let scheduler = DownloadScheduler::new(fetcher, &request.hls);
    let ctx = ScheduleContext {
        dir: &segment_dir,
        skip: &request.skip,
        tracker: &shared.tracker,
        gauge: &shared.gauge,
        token,
    };
    let mut outcome = scheduler.run(&segments, &ctx).await;
    shared.state.lock().reports = outcome.planned_reports(&filtered.excluded);
    if outcome.cancelled {
        return Err(DownloadError::Cancelled);
    }
    if let Some(fatal) = outcome.fatal.take() {
        return Err(fatal);
    }

    let mut skip_report = String::new();
    for report in outcome.with_disposition(Disposition::SkippedByHttpCode) {
        let _ = writeln!(
            skip_report,
            "http.code={},filename={},url={}",
            report.http_status.unwrap_or_default(),
            report.file_name,
            report.uri
        );
    }
    let skipped = outcome.count(Disposition::SkippedByHttpCode);
    let report_path = segment_dir.join(SKIP_REPORT_FILE_NAME);
    if skipped > 0 {
        tokio::fs::write(&report_path, &skip_report).await?;
        if !request.skip.merge_despite_http_skips {
            return Err(DownloadError::SkippedByHttpCode { count: skipped });
        }
        warn!(skipped, "Assembling despite segments skipped by tolerated status");
    }

    if request.skip_assembly {
        return Ok(RunResult::Output(segment_dir));
    }

    let parts: Vec<PathBuf> = outcome
        .with_disposition(Disposition::Downloaded)
        .map(|report| segment_dir.join(&report.file_name))
        .collect();
    let output = unique_output_path(&request.save_dir, &request.file_name).await?;

    shared.set_title(TITLE_ASSEMBLE);
    shared.tracker.reset(parts.len() as u64, Instant::now());
    assembler.assemble(&parts, &output, &shared.tracker, token).await?;

    if skipped > 0 {
        tokio::fs::write(skipped_report_path(&output), &skip_report).await?;
    }

    if let Some(cache) = cache
        && let Err(e) = cache.store(&request.fingerprint, &output).await
    {
        warn!(error = %e, "Failed to record output in result cache");
    }

    if !request.keep_segments {
        tokio::fs::remove_dir_all(&segment_dir).await?;
        // Only succeeds when no other download is staged there.
        let _ = tokio::fs::remove_dir(&downloading_dir).await;
    }

    Ok(RunResult::Output(output))
}

/// `<output>.skipped.txt`
pub fn skipped_report_path(output: &Path) -> PathBuf {
    let mut name = output.file_name().unwrap_or_default().to_os_string();
    name.push(".skipped.txt");
    output.with_file_name(name)
}

/// First free name among `name.ts`, `name_0001.ts`, ... `name_9999.ts`.
pub async fn unique_output_path(dir: &Path, name: &str) -> Result<PathBuf, DownloadError> {
    for index in 0..=MAX_OUTPUT_INDEX {
        let candidate = if index == 0 {
            dir.join(format!("{name}.{OUTPUT_EXTENSION}"))
        } else {
            dir.join(format!("{name}_{index:04}.{OUTPUT_EXTENSION}"))
        };
        if !tokio::fs::try_exists(&candidate).await? {
            return Ok(candidate);
        }
    }
    Err(DownloadError::configuration(format!(
        "no free output name for `{name}` in {}",
        dir.display()
    )))
}

/// Output base name from the last path component of `url`, without its extension.
pub fn file_name_from_url(url: &Url) -> String {
    let stem = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .map(|last| last.rsplit_once('.').map_or(last, |(stem, _)| stem))
        .unwrap_or_default();
    let sanitized: String = stem
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    if sanitized.is_empty() {
        "download".to_string()
    } else {
        sanitized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_name_comes_from_last_path_component() {
        let url = Url::parse("http://h/a/b/movie.m3u8?token=1").unwrap();
        assert_eq!(file_name_from_url(&url), "movie");
        let url = Url::parse("http://h/").unwrap();
        assert_eq!(file_name_from_url(&url), "download");
        let url = Url::parse("http://h/play/list").unwrap();
        assert_eq!(file_name_from_url(&url), "list");
    }

    #[tokio::test]
    async fn output_names_never_clobber() {
        let dir = tempfile::tempdir().unwrap();
        let first = unique_output_path(dir.path(), "movie").await.unwrap();
        assert_eq!(first, dir.path().join("movie.ts"));

        std::fs::write(&first, b"x").unwrap();
        let second = unique_output_path(dir.path(), "movie").await.unwrap();
        assert_eq!(second, dir.path().join("movie_0001.ts"));

        std::fs::write(&second, b"x").unwrap();
        assert_eq!(
            unique_output_path(dir.path(), "movie").await.unwrap(),
            dir.path().join("movie_0002.ts")
        );
    }

    #[test]
    fn skipped_report_sits_next_to_output() {
        assert_eq!(
            skipped_report_path(Path::new("/out/movie.ts")),
            PathBuf::from("/out/movie.ts.skipped.txt")
        );
    }

    #[test]
    fn prepare_rejects_bad_input() {
        let err = SessionConfig::new("ftp://h/index.m3u8").prepare().err().unwrap();
        assert!(matches!(err, DownloadError::InvalidUrl { .. }));

        let config = SessionConfig {
            concurrency: 0,
            ..SessionConfig::new("http://h/index.m3u8")
        };
        assert!(matches!(
            config.prepare().err().unwrap(),
            DownloadError::Configuration { .. }
        ));

        let config = SessionConfig {
            skip_expression: "1, nope".to_string(),
            ..SessionConfig::new("http://h/index.m3u8")
        };
        assert!(matches!(
            config.prepare().err().unwrap(),
            DownloadError::SkipExpression { .. }
        ));

        let config = SessionConfig {
            proxy: Some("htt://123.com".to_string()),
            ..SessionConfig::new("http://h/index.m3u8")
        };
        assert!(matches!(
            config.prepare().err().unwrap(),
            DownloadError::ProxyConfiguration { .. }
        ));
    }

    #[test]
    fn prepare_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = SessionConfig {
            save_dir: Some(dir.path().to_path_buf()),
            proxy: Some("socKs5://127.0.0.1:1080".to_string()),
            skip_discontinuity_wrapped: true,
            concurrency: 3,
            ..SessionConfig::new("https://cdn.example/v/show.m3u8")
        };
        let prepared = config.prepare().unwrap();

        assert_eq!(prepared.temp_dir, dir.path());
        assert_eq!(prepared.file_name, "show");
        assert!(prepared.skip.skip_discontinuity_wrapped);
        assert_eq!(prepared.hls.scheduler_config.concurrency, 3);
        assert_eq!(prepared.fingerprint.len(), 64);
        let proxy = prepared.hls.base.proxy.as_ref().unwrap();
        assert_eq!(proxy.url, "socks5://127.0.0.1:1080");
    }

    #[test]
    fn idle_session_reports_nothing() {
        let session = DownloadSession::new();
        assert_eq!(session.status(), SessionStatus::default());
        assert!(!session.is_running());
    }
}
