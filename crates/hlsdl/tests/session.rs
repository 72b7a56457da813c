use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use aes::Aes128;
use axum::Router;
use axum::extract::State;
use axum::http::{HeaderValue, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use cipher::{BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use flate2::Compression;
use flate2::write::GzEncoder;
use tokio::net::TcpListener;

use hlsdl_engine::hls::Disposition;
use hlsdl_engine::hls::planner::sequence_iv;
use hlsdl_engine::hls::retry::RetryPolicy;
use hlsdl_engine::session::SKIP_REPORT_FILE_NAME;
use hlsdl_engine::{DownloadError, DownloadSession, SessionConfig};

const KEY: [u8; 16] = *b"hlsdl-test-key!!";

#[derive(Clone)]
struct Route {
    status: StatusCode,
    body: Bytes,
    encoding: Option<&'static str>,
    delay: Duration,
    /// Number of initial requests answered with 503
    fail_first: usize,
}

impl Route {
    fn ok(body: impl Into<Bytes>) -> Self {
        Self {
            status: StatusCode::OK,
            body: body.into(),
            encoding: None,
            delay: Duration::ZERO,
            fail_first: 0,
        }
    }

    fn status(status: StatusCode) -> Self {
        Self {
            status,
            ..Self::ok(Bytes::new())
        }
    }
}

#[derive(Default)]
struct Fixture {
    routes: Mutex<HashMap<String, Route>>,
    hits: Mutex<HashMap<String, usize>>,
}

impl Fixture {
    fn route(&self, path: &str, route: Route) {
        self.routes.lock().unwrap().insert(path.to_string(), route);
    }

    fn hits(&self, path: &str) -> usize {
        self.hits.lock().unwrap().get(path).copied().unwrap_or(0)
    }
}

async fn serve(State(fixture): State<Arc<Fixture>>, uri: Uri) -> Response {
    let path = uri.path().to_string();
    let hit = {
        let mut hits = fixture.hits.lock().unwrap();
        let count = hits.entry(path.clone()).or_default();
        *count += 1;
        *count
    };
    let route = fixture.routes.lock().unwrap().get(&path).cloned();
    let Some(route) = route else {
        return StatusCode::NOT_FOUND.into_response();
    };

    if !route.delay.is_zero() {
        tokio::time::sleep(route.delay).await;
    }
    if hit <= route.fail_first {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let mut response = (route.status, route.body).into_response();
    if let Some(encoding) = route.encoding {
        response
            .headers_mut()
            .insert(header::CONTENT_ENCODING, HeaderValue::from_static(encoding));
    }
    response
}

async fn start_server(fixture: Arc<Fixture>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new().fallback(serve).with_state(fixture);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn packet(fill: u8) -> Vec<u8> {
    let mut data = vec![0x47];
    data.extend(std::iter::repeat_n(fill, 187));
    data
}

fn encrypt(plain: &[u8], sequence: u64) -> Vec<u8> {
    cbc::Encryptor::<Aes128>::new(&KEY.into(), &sequence_iv(sequence).into())
        .encrypt_padded_vec_mut::<Pkcs7>(plain)
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn media_playlist(count: usize) -> String {
    let mut text = String::from("#EXTM3U\n#EXT-X-TARGETDURATION:4\n");
    for n in 1..=count {
        text.push_str(&format!("#EXTINF:4.0,\n{n}.ts\n"));
    }
    text.push_str("#EXT-X-ENDLIST\n");
    text
}

fn config(base: &str, path: &str, dir: &Path) -> SessionConfig {
    SessionConfig {
        save_dir: Some(dir.to_path_buf()),
        file_name: Some("movie".to_string()),
        concurrency: 2,
        retry: RetryPolicy {
            max_attempts: 5,
            retry_step: Duration::from_millis(10),
        },
        ..SessionConfig::new(format!("{base}{path}"))
    }
}

/// The single staging directory below `<dir>/downloading`.
fn segment_dir(dir: &Path) -> PathBuf {
    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir.join("downloading"))
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert_eq!(entries.len(), 1);
    entries.remove(0)
}

fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn downloads_encrypted_variant_and_assembles_output() {
    let fixture = Arc::new(Fixture::default());
    let base = start_server(fixture.clone()).await;

    fixture.route(
        "/master.m3u8",
        Route::ok(
            "#EXTM3U
#EXT-X-STREAM-INF:BANDWIDTH=200000,RESOLUTION=640x360
low/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=900000,RESOLUTION=1280x720
high/index.m3u8
",
        ),
    );
    fixture.route(
        "/high/index.m3u8",
        Route::ok(
            "#EXTM3U
#EXT-X-MEDIA-SEQUENCE:7
#EXT-X-KEY:METHOD=AES-128,URI=\"/keys/k.bin\"
#EXTINF:4.0,
1.ts
#EXTINF:4.0,
2.ts
#EXTINF:4.0,
3.ts
#EXT-X-ENDLIST
",
        ),
    );
    fixture.route("/keys/k.bin", Route::ok(KEY.to_vec()));

    let plain1 = packet(1);
    let mut plain2 = b"JUNK".to_vec();
    plain2.extend(packet(2));
    let plain3 = packet(3);
    fixture.route("/high/1.ts", Route::ok(encrypt(&plain1, 7)));
    fixture.route("/high/2.ts", Route::ok(encrypt(&plain2, 8)));
    fixture.route(
        "/high/3.ts",
        Route {
            encoding: Some("gzip"),
            ..Route::ok(gzip(&encrypt(&plain3, 9)))
        },
    );

    let dir = tempfile::tempdir().unwrap();
    let session = DownloadSession::new();
    session
        .start(config(&base, "/master.m3u8", dir.path()))
        .unwrap();
    let status = session.wait().await;

    assert_eq!(status.error, None);
    assert!(!status.running);
    assert!(!status.cancelled);
    assert_eq!(status.percent, 100);
    let output = status.output.unwrap();
    assert_eq!(output, dir.path().join("movie.ts"));

    let mut expected = plain1;
    expected.extend(packet(2));
    expected.extend(plain3);
    assert_eq!(std::fs::read(&output).unwrap(), expected);

    assert_eq!(fixture.hits("/keys/k.bin"), 1);
    assert_eq!(fixture.hits("/low/index.m3u8"), 0);
    assert!(!dir.path().join("downloading").exists());
}

#[tokio::test]
async fn tolerated_status_blocks_assembly_and_writes_report() {
    let fixture = Arc::new(Fixture::default());
    let base = start_server(fixture.clone()).await;
    fixture.route("/v/index.m3u8", Route::ok(media_playlist(3)));
    fixture.route("/v/1.ts", Route::ok(packet(1)));
    fixture.route("/v/2.ts", Route::status(StatusCode::NOT_FOUND));
    fixture.route("/v/3.ts", Route::ok(packet(3)));

    let dir = tempfile::tempdir().unwrap();
    let session = DownloadSession::new();
    session
        .start(SessionConfig {
            skip_expression: "http.code=404".to_string(),
            ..config(&base, "/v/index.m3u8", dir.path())
        })
        .unwrap();
    let status = session.wait().await;

    let expected = DownloadError::SkippedByHttpCode { count: 1 }.to_string();
    assert_eq!(status.error.as_deref(), Some(expected.as_str()));
    assert!(!status.cancelled);
    assert_eq!(status.output, None);
    assert_eq!(fixture.hits("/v/2.ts"), 1);

    let report = std::fs::read_to_string(segment_dir(dir.path()).join(SKIP_REPORT_FILE_NAME))
        .unwrap();
    assert_eq!(
        report,
        format!("http.code=404,filename=00002.ts,url={base}/v/2.ts\n")
    );
    assert!(!dir.path().join("movie.ts").exists());
}

#[tokio::test]
async fn merge_flag_assembles_despite_tolerated_status() {
    let fixture = Arc::new(Fixture::default());
    let base = start_server(fixture.clone()).await;
    fixture.route("/v/index.m3u8", Route::ok(media_playlist(3)));
    fixture.route("/v/1.ts", Route::ok(packet(1)));
    fixture.route("/v/2.ts", Route::status(StatusCode::FORBIDDEN));
    fixture.route("/v/3.ts", Route::ok(packet(3)));

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("movie.ts"), b"existing").unwrap();
    let session = DownloadSession::new();
    session
        .start(SessionConfig {
            skip_expression: "http.code=403, if-http.code-merge_ts".to_string(),
            ..config(&base, "/v/index.m3u8", dir.path())
        })
        .unwrap();
    let status = session.wait().await;

    assert_eq!(status.error, None);
    let output = status.output.unwrap();
    assert_eq!(output, dir.path().join("movie_0001.ts"));
    let mut expected = packet(1);
    expected.extend(packet(3));
    assert_eq!(std::fs::read(&output).unwrap(), expected);
    assert_eq!(std::fs::read(dir.path().join("movie.ts")).unwrap(), b"existing");

    let report =
        std::fs::read_to_string(dir.path().join("movie_0001.ts.skipped.txt")).unwrap();
    assert!(report.starts_with("http.code=403,filename=00002.ts,"));
}

#[tokio::test]
async fn transient_status_is_retried_until_success() {
    let fixture = Arc::new(Fixture::default());
    let base = start_server(fixture.clone()).await;
    fixture.route("/v/index.m3u8", Route::ok(media_playlist(2)));
    fixture.route("/v/1.ts", Route::ok(packet(1)));
    fixture.route(
        "/v/2.ts",
        Route {
            fail_first: 2,
            ..Route::ok(packet(2))
        },
    );

    let dir = tempfile::tempdir().unwrap();
    let session = DownloadSession::new();
    session
        .start(config(&base, "/v/index.m3u8", dir.path()))
        .unwrap();
    let status = session.wait().await;

    assert_eq!(status.error, None);
    assert_eq!(fixture.hits("/v/2.ts"), 3);
}

#[tokio::test]
async fn skip_expression_limits_requests() {
    let fixture = Arc::new(Fixture::default());
    let base = start_server(fixture.clone()).await;
    fixture.route("/v/index.m3u8", Route::ok(media_playlist(5)));
    for n in 1..=5u8 {
        fixture.route(&format!("/v/{n}.ts"), Route::ok(packet(n)));
    }

    let dir = tempfile::tempdir().unwrap();
    let session = DownloadSession::new();
    session
        .start(SessionConfig {
            skip_expression: "2-3, 5".to_string(),
            ..config(&base, "/v/index.m3u8", dir.path())
        })
        .unwrap();
    let status = session.wait().await;

    assert_eq!(status.error, None);
    let mut expected = packet(1);
    expected.extend(packet(4));
    assert_eq!(std::fs::read(status.output.unwrap()).unwrap(), expected);
    for skipped in ["/v/2.ts", "/v/3.ts", "/v/5.ts"] {
        assert_eq!(fixture.hits(skipped), 0);
    }
    let dispositions: Vec<(usize, Disposition)> = session
        .reports()
        .iter()
        .map(|r| (r.ordinal, r.disposition))
        .collect();
    assert_eq!(
        dispositions,
        vec![
            (1, Disposition::Downloaded),
            (2, Disposition::SkippedByFilter),
            (3, Disposition::SkippedByFilter),
            (4, Disposition::Downloaded),
            (5, Disposition::SkippedByFilter),
        ]
    );
}

#[tokio::test]
async fn cancellation_leaves_only_complete_segments() {
    let fixture = Arc::new(Fixture::default());
    let base = start_server(fixture.clone()).await;
    fixture.route("/v/index.m3u8", Route::ok(media_playlist(8)));
    for n in 1..=8u8 {
        fixture.route(
            &format!("/v/{n}.ts"),
            Route {
                delay: Duration::from_millis(150),
                ..Route::ok(packet(n))
            },
        );
    }

    let dir = tempfile::tempdir().unwrap();
    let session = DownloadSession::new();
    session
        .start(SessionConfig {
            concurrency: 1,
            ..config(&base, "/v/index.m3u8", dir.path())
        })
        .unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    session.stop();
    let status = session.wait().await;

    assert!(status.cancelled);
    assert!(status.error.is_some());
    assert_eq!(status.output, None);

    let staged = segment_dir(dir.path());
    let names = file_names(&staged);
    assert!(names.len() < 8);
    for name in &names {
        assert!(name.ends_with(".ts"), "unexpected file {name}");
        assert_eq!(std::fs::metadata(staged.join(name)).unwrap().len(), 188);
    }
}

#[tokio::test]
async fn second_start_is_rejected_while_running() {
    let fixture = Arc::new(Fixture::default());
    let base = start_server(fixture.clone()).await;
    fixture.route(
        "/v/index.m3u8",
        Route {
            delay: Duration::from_millis(300),
            ..Route::ok(media_playlist(1))
        },
    );
    fixture.route("/v/1.ts", Route::ok(packet(1)));

    let dir = tempfile::tempdir().unwrap();
    let session = DownloadSession::new();
    session
        .start(config(&base, "/v/index.m3u8", dir.path()))
        .unwrap();
    assert!(session.status().running);

    let err = session
        .start(config(&base, "/v/index.m3u8", dir.path()))
        .unwrap_err();
    assert!(matches!(err, DownloadError::AlreadyRunning));

    let status = session.wait().await;
    assert_eq!(status.error, None);
    assert_eq!(fixture.hits("/v/index.m3u8"), 1);
}

#[tokio::test]
async fn repeated_request_is_satisfied_from_cache() {
    let fixture = Arc::new(Fixture::default());
    let base = start_server(fixture.clone()).await;
    fixture.route("/v/index.m3u8", Route::ok(media_playlist(2)));
    fixture.route("/v/1.ts", Route::ok(packet(1)));
    fixture.route("/v/2.ts", Route::ok(packet(2)));

    let dir = tempfile::tempdir().unwrap();
    let session = DownloadSession::new();
    session
        .start(config(&base, "/v/index.m3u8", dir.path()))
        .unwrap();
    let first = session.wait().await;
    assert_eq!(first.error, None);
    assert!(!first.already_satisfied);

    session
        .start(config(&base, "/v/index.m3u8", dir.path()))
        .unwrap();
    let second = session.wait().await;
    assert_eq!(second.error, None);
    assert!(second.already_satisfied);
    assert_eq!(second.output, first.output);
    assert_eq!(fixture.hits("/v/index.m3u8"), 1);
}

#[tokio::test]
async fn unparseable_page_without_link_fails() {
    let fixture = Arc::new(Fixture::default());
    let base = start_server(fixture.clone()).await;
    fixture.route("/page", Route::ok("<html><body>nothing here</body></html>"));

    let dir = tempfile::tempdir().unwrap();
    let session = DownloadSession::new();
    session.start(config(&base, "/page", dir.path())).unwrap();
    let status = session.wait().await;

    assert!(status.error.unwrap().starts_with("not a playlist"));
    assert!(!status.cancelled);
}
