//! HTTP transport executing one request/response cycle.
//!
//! [`HttpTransport`] is created once from a [`NetworkConfig`] and reused for
//! every call, taking advantage of connection pooling. It never returns an
//! error from a request: transport failures are folded into the returned
//! [`RequestOutcome`].

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind, set_hook, take_hook};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderName, HeaderValue, RANGE};
use reqwest::{Certificate, Client, ClientBuilder, Proxy};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, instrument, warn};
use url::Url;

use super::constants::{DEFAULT_POST_CONTENT_TYPE, MAX_ERROR_BODY_BYTES};
use super::error::TransportError;
use super::executor::{AsyncExecutor, TaskHandle, submit};
use super::request::{ByteRange, Method, Payload, ProgressSink, RequestOutcome, RequestSpec};
use crate::config::{NetworkConfig, ProxySetting};

/// One HTTP request/response cycle.
///
/// Implementations must never panic or return early without an outcome; a
/// failure before a response is received yields status 0 and
/// `succeeded == false`.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Executes the request and returns the raw body as payload.
    async fn execute_raw(&self, spec: &RequestSpec) -> RequestOutcome<Vec<u8>>;

    /// Executor used for asynchronous submissions.
    fn executor(&self) -> Arc<dyn AsyncExecutor>;
}

impl dyn Transport {
    /// Executes the request on the calling task, converting the payload.
    pub async fn execute<P: Payload>(&self, spec: &RequestSpec) -> RequestOutcome<P> {
        self.execute_raw(spec).await.into_payload()
    }
}

/// Submits a request through the transport's executor without blocking the caller.
pub fn execute_async<P: Payload>(
    transport: &Arc<dyn Transport>,
    spec: RequestSpec,
) -> TaskHandle<RequestOutcome<P>> {
    let executor = transport.executor();
    let transport = Arc::clone(transport);
    submit(executor.as_ref(), async move {
        transport.execute_raw(&spec).await.into_payload()
    })
}

/// reqwest-backed transport.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    executor: Arc<dyn AsyncExecutor>,
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

impl HttpTransport {
    /// Builds the transport from an immutable network configuration.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the proxy value is invalid or the
    /// HTTP client cannot be built.
    #[instrument(level = "debug", skip(config, executor), fields(proxy = ?config.proxy_setting()))]
    pub fn new(
        config: &NetworkConfig,
        executor: Arc<dyn AsyncExecutor>,
    ) -> Result<Self, TransportError> {
        let client = build_client(config)?;
        Ok(Self { client, executor })
    }

    /// Executes one request cycle on the calling task.
    pub async fn execute<P: Payload>(&self, spec: &RequestSpec) -> RequestOutcome<P> {
        self.execute_raw(spec).await.into_payload()
    }

    /// Submits one request cycle through the executor.
    pub fn execute_async<P: Payload>(&self, spec: RequestSpec) -> TaskHandle<RequestOutcome<P>> {
        let transport = self.clone();
        submit(self.executor.as_ref(), async move {
            transport.execute_raw(&spec).await.into_payload()
        })
    }

    async fn perform(&self, spec: &RequestSpec) -> Result<RequestOutcome<Vec<u8>>, TransportError> {
        let url = Url::parse(spec.url()).map_err(|_| TransportError::invalid_url(spec.url()))?;
        if spec.method() == Method::Download && spec.target().is_none() {
            return Err(TransportError::missing_target(spec.url()));
        }

        let resume_offset = resume_offset(spec).await;
        if let Some(range) = spec.range()
            && range.is_satisfied_by(resume_offset)
        {
            debug!(
                correlation_id = spec.id(),
                resume_offset,
                "requested range already on disk, skipping request"
            );
            if let Some(sink) = spec.sink() {
                sink.report(resume_offset);
            }
            return Ok(RequestOutcome {
                status_code: 206,
                succeeded: true,
                payload: Vec::new(),
                error_summary: String::new(),
                error_detail: String::new(),
                content_length: Some(0),
                bytes_transferred: 0,
                correlation_id: spec.id().to_string(),
            });
        }

        let mut request = match spec.method() {
            Method::Get | Method::Download => self.client.get(url),
            Method::Head => self.client.head(url),
            Method::Post => {
                let content_type = spec
                    .header_value(CONTENT_TYPE.as_str())
                    .unwrap_or(DEFAULT_POST_CONTENT_TYPE)
                    .to_string();
                self.client
                    .post(url)
                    .header(CONTENT_TYPE, encode_value(spec, CONTENT_TYPE.as_str(), &content_type)?)
                    .body(spec.body().to_vec())
            }
        };

        for (name, value) in spec.headers() {
            // Exactly one content-type header is sent with POST bodies.
            if spec.method() == Method::Post && name.eq_ignore_ascii_case(CONTENT_TYPE.as_str()) {
                continue;
            }
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| TransportError::invalid_header(spec.url(), name.as_str()))?;
            request = request.header(header_name, encode_value(spec, name, value)?);
        }

        let range_header = match spec.range() {
            Some(range) => Some(range.header_value(resume_offset)),
            None if resume_offset > 0 => Some(ByteRange::from_offset(0).header_value(resume_offset)),
            None => None,
        };
        if let Some(range) = &range_header {
            request = request.header(RANGE, range.as_str());
        }

        debug!(
            correlation_id = spec.id(),
            method = %spec.method(),
            range = ?range_header,
            resume_offset,
            "sending request"
        );

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::network(spec.url(), e))?;

        let status_code = response.status().as_u16();
        let content_length = header_content_length(&response);
        let succeeded = RequestOutcome::<()>::is_success_status(status_code);

        let (payload, bytes_transferred, error_detail) = match spec.method() {
            Method::Head => (Vec::new(), 0, String::new()),
            Method::Download if succeeded => {
                let appending = resume_offset > 0 && status_code == 206;
                let written = self.write_target(spec, response, appending, resume_offset).await?;
                (Vec::new(), written, String::new())
            }
            Method::Download => {
                let body = collect_body(response, spec.url(), None).await?;
                (Vec::new(), 0, error_snippet(&body))
            }
            Method::Get | Method::Post => {
                let body = collect_body(response, spec.url(), spec.sink()).await?;
                let detail = if succeeded { String::new() } else { error_snippet(&body) };
                let len = body.len() as u64;
                (body, len, detail)
            }
        };

        Ok(RequestOutcome {
            status_code,
            succeeded,
            payload,
            error_summary: if succeeded {
                String::new()
            } else {
                format!("HTTP {status_code}")
            },
            error_detail,
            content_length,
            bytes_transferred,
            correlation_id: spec.id().to_string(),
        })
    }

    async fn write_target(
        &self,
        spec: &RequestSpec,
        response: reqwest::Response,
        appending: bool,
        resume_offset: u64,
    ) -> Result<u64, TransportError> {
        let Some(path) = spec.target() else {
            return Err(TransportError::missing_target(spec.url()));
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TransportError::io(parent, e))?;
        }

        // Append for a true resume, create/truncate otherwise
        let file = if appending {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await
                .map_err(|e| TransportError::io(path, e))?
        } else {
            File::create(path)
                .await
                .map_err(|e| TransportError::io(path, e))?
        };

        let base = if appending { resume_offset } else { 0 };
        let result = stream_to_file(file, response, spec.url(), path, spec.sink(), base).await;
        if result.is_err() && !spec.is_resumable() {
            debug!(path = %path.display(), "cleaning up partial file after error");
            let _ = tokio::fs::remove_file(path).await;
        }
        result
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[instrument(skip(self, spec), fields(correlation_id = spec.id(), method = %spec.method(), url = spec.url()))]
    async fn execute_raw(&self, spec: &RequestSpec) -> RequestOutcome<Vec<u8>> {
        let started = Instant::now();
        match self.perform(spec).await {
            Ok(outcome) => {
                debug!(
                    status = outcome.status_code,
                    succeeded = outcome.succeeded,
                    bytes = outcome.bytes_transferred,
                    elapsed_ms = started.elapsed().as_millis(),
                    "request complete"
                );
                outcome
            }
            Err(error) => {
                warn!(
                    error = %error.detail(),
                    elapsed_ms = started.elapsed().as_millis(),
                    "transport failure"
                );
                RequestOutcome::transport_failure(spec.id(), error.summary(), error.detail())
            }
        }
    }

    fn executor(&self) -> Arc<dyn AsyncExecutor> {
        Arc::clone(&self.executor)
    }
}

fn encode_value(spec: &RequestSpec, name: &str, value: &str) -> Result<HeaderValue, TransportError> {
    HeaderValue::from_str(value).map_err(|_| TransportError::invalid_header(spec.url(), name))
}

/// Size of the partial target to resume from, or 0.
async fn resume_offset(spec: &RequestSpec) -> u64 {
    if !spec.is_resumable() {
        return 0;
    }
    let Some(path) = spec.target() else {
        return 0;
    };
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.len())
        .unwrap_or(0)
}

fn header_content_length(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
}

fn error_snippet(body: &[u8]) -> String {
    let end = body.len().min(MAX_ERROR_BODY_BYTES);
    String::from_utf8_lossy(&body[..end]).into_owned()
}

/// Collects a response body in memory, reporting cumulative progress.
async fn collect_body(
    response: reqwest::Response,
    url: &str,
    sink: Option<&ProgressSink>,
) -> Result<Vec<u8>, TransportError> {
    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk_result) = stream.next().await {
        let chunk = chunk_result.map_err(|e| TransportError::network(url, e))?;
        body.extend_from_slice(&chunk);
        if let Some(sink) = sink {
            sink.report(body.len() as u64);
        }
    }
    Ok(body)
}

/// Streams response body to file, returning bytes written by this cycle.
async fn stream_to_file(
    file: File,
    response: reqwest::Response,
    url: &str,
    file_path: &Path,
    sink: Option<&ProgressSink>,
    base: u64,
) -> Result<u64, TransportError> {
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut bytes_written: u64 = 0;

    while let Some(chunk_result) = stream.next().await {
        let chunk = chunk_result.map_err(|e| TransportError::network(url, e))?;

        writer
            .write_all(&chunk)
            .await
            .map_err(|e| TransportError::io(file_path, e))?;

        bytes_written += chunk.len() as u64;
        if let Some(sink) = sink {
            sink.report(base + bytes_written);
        }
    }

    // Ensure all data is flushed to disk
    writer
        .flush()
        .await
        .map_err(|e| TransportError::io(file_path, e))?;

    Ok(bytes_written)
}

fn build_client(config: &NetworkConfig) -> Result<Client, TransportError> {
    let roots = load_ca_bundle(config.ca_bundle.as_deref());
    let initial = try_build_client(config, &roots, false);
    match initial {
        Ok(client) => Ok(client),
        Err(BuildClientFailure::Panic) => {
            warn!(
                "HTTP client builder panicked while loading system proxy settings; retrying with env-proxy fallback"
            );
            match try_build_client(config, &roots, true) {
                Ok(client) => Ok(client),
                Err(BuildClientFailure::Build(error)) => Err(error),
                Err(BuildClientFailure::Panic) => Err(TransportError::ClientBuildPanicked),
            }
        }
        Err(BuildClientFailure::Build(error)) => Err(error),
    }
}

/// Reads the local CA bundle. An empty list means the system trust store is used.
fn load_ca_bundle(path: Option<&Path>) -> Vec<Certificate> {
    let Some(path) = path else {
        debug!("no CA bundle configured, using system trust store");
        return Vec::new();
    };
    let pem = match std::fs::read(path) {
        Ok(pem) => pem,
        Err(error) => {
            warn!(
                path = %path.display(),
                %error,
                "CA bundle not readable, falling back to system trust store"
            );
            return Vec::new();
        }
    };
    match Certificate::from_pem_bundle(&pem) {
        Ok(certs) if !certs.is_empty() => {
            debug!(path = %path.display(), count = certs.len(), "loaded CA bundle");
            certs
        }
        Ok(_) => {
            warn!(path = %path.display(), "CA bundle is empty, falling back to system trust store");
            Vec::new()
        }
        Err(error) => {
            warn!(
                path = %path.display(),
                %error,
                "CA bundle invalid, falling back to system trust store"
            );
            Vec::new()
        }
    }
}

enum BuildClientFailure {
    Panic,
    Build(TransportError),
}

// `catch_unwind` does not suppress panic-hook stderr output. Guarded client
// builds intentionally catch system-proxy panics, so suppress hook output
// briefly to keep host stderr deterministic for expected recovery paths.
static CLIENT_BUILD_PANIC_HOOK_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

fn try_build_client(
    config: &NetworkConfig,
    roots: &[Certificate],
    disable_system_proxy_lookup: bool,
) -> Result<Client, BuildClientFailure> {
    catch_unwind_silent(AssertUnwindSafe(move || {
        #[cfg(test)]
        maybe_inject_client_build_panic(disable_system_proxy_lookup);

        let builder = apply_proxy(
            base_client_builder(config, roots),
            &config.proxy_setting(),
            disable_system_proxy_lookup,
        )
        .map_err(BuildClientFailure::Build)?;
        builder
            .build()
            .map_err(|source| BuildClientFailure::Build(TransportError::ClientBuild { source }))
    }))
    .map_err(|_| BuildClientFailure::Panic)?
}

fn catch_unwind_silent<F, T>(operation: F) -> Result<T, Box<dyn std::any::Any + Send + 'static>>
where
    F: FnOnce() -> T + std::panic::UnwindSafe,
{
    let _panic_hook_guard = CLIENT_BUILD_PANIC_HOOK_LOCK
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    let previous_hook = take_hook();
    set_hook(Box::new(|_| {}));
    let outcome = catch_unwind(operation);
    set_hook(previous_hook);
    outcome
}

fn base_client_builder(config: &NetworkConfig, roots: &[Certificate]) -> ClientBuilder {
    let mut builder = Client::builder()
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .timeout(Duration::from_secs(config.read_timeout_secs))
        .gzip(true)
        .user_agent(config.effective_user_agent());
    for cert in roots {
        builder = builder.add_root_certificate(cert.clone());
    }
    builder
}

fn apply_proxy(
    builder: ClientBuilder,
    setting: &ProxySetting,
    disable_system_proxy_lookup: bool,
) -> Result<ClientBuilder, TransportError> {
    match setting {
        ProxySetting::Direct => Ok(builder.no_proxy()),
        ProxySetting::Explicit(proxy) => {
            let resolved = Proxy::all(proxy.as_str()).map_err(|source| {
                TransportError::InvalidProxy {
                    proxy: proxy.clone(),
                    source,
                }
            })?;
            Ok(builder.proxy(resolved))
        }
        // reqwest resolves OS proxy settings by default.
        ProxySetting::System if !disable_system_proxy_lookup => Ok(builder),
        ProxySetting::System => Ok(apply_env_proxy_fallback(builder.no_proxy())),
    }
}

fn apply_env_proxy_fallback(mut builder: ClientBuilder) -> ClientBuilder {
    if let Some(proxy) = env_proxy_for_scheme("https")
        && let Ok(resolved) = Proxy::https(&proxy)
    {
        builder = builder.proxy(resolved);
    }
    if let Some(proxy) = env_proxy_for_scheme("http")
        && let Ok(resolved) = Proxy::http(&proxy)
    {
        builder = builder.proxy(resolved);
    }
    builder
}

fn env_proxy_for_scheme(scheme: &str) -> Option<String> {
    match scheme {
        "https" => find_first_proxy_var(&["HTTPS_PROXY", "https_proxy", "ALL_PROXY", "all_proxy"]),
        "http" => find_first_proxy_var(&["HTTP_PROXY", "http_proxy", "ALL_PROXY", "all_proxy"]),
        _ => None,
    }
}

fn find_first_proxy_var(names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| {
        std::env::var(name)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

#[cfg(test)]
static CLIENT_BUILD_PANIC_INJECTION_COUNT: std::sync::atomic::AtomicUsize =
    std::sync::atomic::AtomicUsize::new(0);

#[cfg(test)]
fn inject_client_build_panics(count: usize) {
    CLIENT_BUILD_PANIC_INJECTION_COUNT.store(count, std::sync::atomic::Ordering::SeqCst);
}

#[cfg(test)]
fn maybe_inject_client_build_panic(disable_system_proxy_lookup: bool) {
    use std::sync::atomic::Ordering;

    if disable_system_proxy_lookup {
        return;
    }

    if CLIENT_BUILD_PANIC_INJECTION_COUNT
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
            if count > 0 { Some(count - 1) } else { None }
        })
        .is_ok()
    {
        panic!("injected HTTP client builder panic");
    }
}
