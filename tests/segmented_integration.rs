//! Integration tests for segmented downloads against a range-aware mock server.

use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use netupdate_core::{
    HttpTransport, NetworkConfig, ProgressSink, RequestSpec, SegmentedDownloader, SplitApproach,
    TokioExecutor, Transport,
};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

const SEGMENT_COUNT: u64 = 4;

/// Serves `Range: bytes=a-b` requests as 206 slices of `body`.
///
/// Requests whose range starts at `fail_start` get a 500 until
/// `failures_left` runs out.
struct RangeResponder {
    body: Vec<u8>,
    fail_start: Option<u64>,
    failures_left: AtomicUsize,
    requests: Arc<Mutex<Vec<String>>>,
}

impl RangeResponder {
    fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            fail_start: None,
            failures_left: AtomicUsize::new(0),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn failing(mut self, start: u64, times: usize) -> Self {
        self.fail_start = Some(start);
        self.failures_left = AtomicUsize::new(times);
        self
    }
}

fn parse_range(request: &Request) -> Option<(u64, u64)> {
    let value = request.headers.get("range")?.to_str().ok()?;
    let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let Some((start, end)) = parse_range(request) else {
            return ResponseTemplate::new(200).set_body_bytes(self.body.clone());
        };
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(format!("{start}-{end}"));
        }

        if self.fail_start == Some(start)
            && self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return ResponseTemplate::new(500).set_body_string("segment backend hiccup");
        }

        let end = usize::try_from(end).unwrap_or(usize::MAX).min(self.body.len() - 1);
        let start = usize::try_from(start).unwrap_or(usize::MAX);
        ResponseTemplate::new(206).set_body_bytes(self.body[start..=end].to_vec())
    }
}

fn sample_body() -> Vec<u8> {
    // A little over 1 MiB so four segments each clear the 256 KiB floor.
    (0..(1024 * 1024 + 123)).map(|i: u32| (i % 251) as u8).collect()
}

async fn mount(server: &MockServer, body: &[u8], responder: RangeResponder) {
    Mock::given(method("HEAD"))
        .and(path("/pack.zip"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/pack.zip"))
        .respond_with(responder)
        .mount(server)
        .await;
}

fn downloader() -> SegmentedDownloader {
    let executor = Arc::new(TokioExecutor::current(8).expect("runtime"));
    let transport: Arc<dyn Transport> = Arc::new(
        HttpTransport::new(&NetworkConfig::default(), executor).expect("transport builds"),
    );
    SegmentedDownloader::new(transport)
}

fn leftover_parts(dir: &Path) -> Vec<String> {
    std::fs::read_dir(dir)
        .expect("read dir")
        .filter_map(Result::ok)
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.contains(".part"))
        .collect()
}

#[tokio::test]
async fn test_segmented_download_reassembles_content() {
    let server = MockServer::start().await;
    let body = sample_body();
    let responder = RangeResponder::new(body.clone());
    let requests = Arc::clone(&responder.requests);
    mount(&server, &body, responder).await;

    let temp = TempDir::new().expect("temp dir");
    let target = temp.path().join("pack.zip");
    let spec = RequestSpec::download(format!("{}/pack.zip", server.uri()), &target);

    let ok = downloader()
        .multi_threaded_download(&spec, SplitApproach::ByQuantity, SEGMENT_COUNT)
        .await;

    assert!(ok);
    assert_eq!(std::fs::read(&target).expect("target"), body);
    assert_eq!(requests.lock().unwrap().len(), SEGMENT_COUNT as usize);
    assert!(leftover_parts(temp.path()).is_empty());
}

#[tokio::test]
async fn test_segmented_download_reports_total_progress() {
    let server = MockServer::start().await;
    let body = sample_body();
    mount(&server, &body, RangeResponder::new(body.clone())).await;

    let temp = TempDir::new().expect("temp dir");
    let target = temp.path().join("pack.zip");
    let highest = Arc::new(AtomicU64::new(0));
    let seen = Arc::clone(&highest);
    let spec = RequestSpec::download(format!("{}/pack.zip", server.uri()), &target)
        .progress_sink(ProgressSink::new(move |n| {
            seen.fetch_max(n, Ordering::SeqCst);
        }));

    let ok = downloader()
        .multi_threaded_download(&spec, SplitApproach::ByQuantity, SEGMENT_COUNT)
        .await;

    assert!(ok);
    assert_eq!(highest.load(Ordering::SeqCst), body.len() as u64);
}

#[tokio::test]
async fn test_failed_segment_is_retried_once() {
    let server = MockServer::start().await;
    let body = sample_body();
    let chunk = (body.len() as u64).div_ceil(SEGMENT_COUNT);
    let responder = RangeResponder::new(body.clone()).failing(chunk * 2, 1);
    let requests = Arc::clone(&responder.requests);
    mount(&server, &body, responder).await;

    let temp = TempDir::new().expect("temp dir");
    let target = temp.path().join("pack.zip");
    let spec = RequestSpec::download(format!("{}/pack.zip", server.uri()), &target);

    let ok = downloader()
        .multi_threaded_download(&spec, SplitApproach::ByQuantity, SEGMENT_COUNT)
        .await;

    assert!(ok);
    assert_eq!(std::fs::read(&target).expect("target"), body);
    assert_eq!(requests.lock().unwrap().len(), SEGMENT_COUNT as usize + 1);
    assert!(leftover_parts(temp.path()).is_empty());
}

#[tokio::test]
async fn test_segment_failing_twice_fails_and_cleans_up() {
    let server = MockServer::start().await;
    let body = sample_body();
    let chunk = (body.len() as u64).div_ceil(SEGMENT_COUNT);
    mount(&server, &body, RangeResponder::new(body.clone()).failing(chunk, 2)).await;

    let temp = TempDir::new().expect("temp dir");
    let target = temp.path().join("pack.zip");
    let spec = RequestSpec::download(format!("{}/pack.zip", server.uri()), &target);

    let ok = downloader()
        .multi_threaded_download(&spec, SplitApproach::ByQuantity, SEGMENT_COUNT)
        .await;

    assert!(!ok);
    assert!(!target.exists());
    assert!(leftover_parts(temp.path()).is_empty());
}

#[tokio::test]
async fn test_failed_download_keeps_previous_target_content() {
    let server = MockServer::start().await;
    let body = sample_body();
    mount(&server, &body, RangeResponder::new(body.clone()).failing(0, 2)).await;

    let temp = TempDir::new().expect("temp dir");
    let target = temp.path().join("pack.zip");
    std::fs::write(&target, b"previous good content").expect("seed target");
    let spec = RequestSpec::download(format!("{}/pack.zip", server.uri()), &target);

    let ok = downloader()
        .multi_threaded_download(&spec, SplitApproach::ByQuantity, SEGMENT_COUNT)
        .await;

    assert!(!ok);
    assert_eq!(
        std::fs::read(&target).expect("target"),
        b"previous good content"
    );
    assert!(leftover_parts(temp.path()).is_empty());
    assert!(!temp.path().join("pack.zip.merging").exists());
}

#[tokio::test]
async fn test_missing_content_length_fails_fast() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let temp = TempDir::new().expect("temp dir");
    let target = temp.path().join("gone.zip");
    let spec = RequestSpec::download(format!("{}/gone.zip", server.uri()), &target);

    let ok = downloader()
        .multi_threaded_download(&spec, SplitApproach::Auto, 0)
        .await;

    assert!(!ok);
    assert!(!target.exists());
}

#[tokio::test]
async fn test_small_resource_uses_single_segment() {
    let server = MockServer::start().await;
    let body = b"tiny resource".to_vec();
    let responder = RangeResponder::new(body.clone());
    let requests = Arc::clone(&responder.requests);
    mount(&server, &body, responder).await;

    let temp = TempDir::new().expect("temp dir");
    let target = temp.path().join("pack.zip");
    let spec = RequestSpec::download(format!("{}/pack.zip", server.uri()), &target);

    let ok = downloader()
        .multi_threaded_download(&spec, SplitApproach::ByQuantity, 8)
        .await;

    assert!(ok);
    assert_eq!(std::fs::read(&target).expect("target"), body);
    assert_eq!(*requests.lock().unwrap(), vec![format!("0-{}", body.len() - 1)]);
}
