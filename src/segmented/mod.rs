//! Segmented parallel downloads.
//!
//! A resource is sized with HEAD, split into byte ranges by [`plan_segments`],
//! fetched concurrently into per-segment temp files, and merged in index
//! order into the destination.
//!
//! # Flow
//!
//! 1. HEAD for the content length (absent or zero fails fast)
//! 2. Plan segments and submit one DOWNLOAD per segment through the executor
//! 3. One retry round for failed segments, against fresh temp files
//! 4. Sequential merge into `<target>.merging`, renamed over the target on
//!    success; each temp file is deleted once consumed

mod merge;
mod plan;

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info, instrument, warn};

use crate::transport::{
    ProgressSink, RequestOutcome, RequestSpec, TaskHandle, Transport, execute_async,
};

pub use merge::{MERGE_BUFFER_SIZE, merge_segments};
pub use plan::{
    DEFAULT_CHUNK_SIZE, DEFAULT_SEGMENTS, MAX_SEGMENTS, MIN_CHUNK_SIZE, SegmentPlan,
    SegmentSpec, SplitApproach, plan_segments,
};

/// Result of one segment download; owned by the task that produced it.
#[derive(Debug, Clone)]
pub struct SegmentResult {
    /// The segment that was requested.
    pub spec: SegmentSpec,
    /// Outcome of the request.
    pub outcome: RequestOutcome<()>,
    /// Whether the status is in the accepted set.
    pub succeeded: bool,
}

/// Downloads a resource as concurrent byte-range segments.
#[derive(Debug, Clone)]
pub struct SegmentedDownloader {
    transport: Arc<dyn Transport>,
    accepted_status_codes: BTreeSet<u16>,
}

impl SegmentedDownloader {
    /// Creates a downloader accepting 200 and 206 for segments.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            accepted_status_codes: BTreeSet::from([200, 206]),
        }
    }

    /// Replaces the statuses that count as a successful segment.
    #[must_use]
    pub fn accepting(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.accepted_status_codes = codes.into_iter().collect();
        self
    }

    /// Downloads `spec` (a DOWNLOAD with a target) in segments.
    ///
    /// Returns `true` once the destination holds the merged content. On
    /// failure every temp file is removed and an existing destination keeps
    /// its previous content.
    #[instrument(skip(self, spec), fields(correlation_id = spec.id(), url = spec.url()))]
    pub async fn multi_threaded_download(
        &self,
        spec: &RequestSpec,
        approach: SplitApproach,
        param: u64,
    ) -> bool {
        let Some(target) = spec.target().map(PathBuf::from) else {
            warn!("segmented download requires a target file");
            return false;
        };

        let Some(content_length) = self.head_content_length(spec).await else {
            return false;
        };

        let plan = plan_segments(content_length, approach, param, &target);
        let progress = SegmentProgress::new(plan.len(), spec.sink().cloned());

        info!(
            content_length,
            segments = plan.len(),
            chunk_size = plan.chunk_size(),
            "starting segmented download"
        );

        let first_pass = self
            .run_round(spec, plan.segments().to_vec(), &progress)
            .await;
        let (mut done, failed): (Vec<_>, Vec<_>) =
            first_pass.into_iter().partition(|result| result.succeeded);

        if !failed.is_empty() {
            warn!(failed = failed.len(), "retrying failed segments once");
            let mut retry_specs = Vec::with_capacity(failed.len());
            for result in &failed {
                remove_quietly(&result.spec.temp_path).await;
                progress.rewind(result.spec.index);
                retry_specs.push(result.spec.for_retry());
            }

            let retried = self.run_round(spec, retry_specs, &progress).await;
            let still_failing: Vec<&SegmentResult> =
                retried.iter().filter(|result| !result.succeeded).collect();
            if !still_failing.is_empty() {
                for result in &still_failing {
                    warn!(
                        segment = result.spec.index,
                        status = result.outcome.status_code,
                        error = %result.outcome.error_summary,
                        "segment failed after retry"
                    );
                }
                for result in done.iter().chain(retried.iter()) {
                    remove_quietly(&result.spec.temp_path).await;
                }
                return false;
            }
            done.extend(retried);
        }

        done.sort_by_key(|result| result.spec.index);
        let parts: Vec<SegmentSpec> = done.into_iter().map(|result| result.spec).collect();

        match merge_segments(&target, &parts, content_length).await {
            Ok(written) => {
                info!(bytes = written, path = %target.display(), "segmented download complete");
                true
            }
            Err(error) => {
                warn!(error = %error.detail(), "segment merge failed");
                for part in &parts {
                    remove_quietly(&part.temp_path).await;
                }
                false
            }
        }
    }

    async fn head_content_length(&self, spec: &RequestSpec) -> Option<u64> {
        let mut head = RequestSpec::head(spec.url());
        for (name, value) in spec.headers() {
            head = head.header(name.as_str(), value.as_str());
        }
        let outcome = self.transport.execute_raw(&head).await;
        match outcome.content_length {
            Some(length) if outcome.succeeded && length > 0 => Some(length),
            _ => {
                warn!(
                    status = outcome.status_code,
                    content_length = ?outcome.content_length,
                    error = %outcome.error_summary,
                    "HEAD request gave no usable content length"
                );
                None
            }
        }
    }

    async fn run_round(
        &self,
        spec: &RequestSpec,
        segments: Vec<SegmentSpec>,
        progress: &SegmentProgress,
    ) -> Vec<SegmentResult> {
        let handles: Vec<(SegmentSpec, TaskHandle<RequestOutcome<()>>)> = segments
            .into_iter()
            .map(|segment| {
                let request = segment_request(spec, &segment, progress.sink_for(segment.index));
                let handle = execute_async::<()>(&self.transport, request);
                (segment, handle)
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for (segment, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(error) => RequestOutcome::transport_failure(
                    segment.correlation_id.clone(),
                    "segment task dropped",
                    error.to_string(),
                ),
            };
            let succeeded = self.accepted_status_codes.contains(&outcome.status_code);
            debug!(
                segment = segment.index,
                status = outcome.status_code,
                bytes = outcome.bytes_transferred,
                succeeded,
                "segment finished"
            );
            results.push(SegmentResult {
                spec: segment,
                outcome,
                succeeded,
            });
        }
        results
    }
}

fn segment_request(spec: &RequestSpec, segment: &SegmentSpec, sink: ProgressSink) -> RequestSpec {
    let mut request = RequestSpec::download(spec.url(), &segment.temp_path)
        .byte_range(segment.range())
        .correlation_id(segment.correlation_id.clone())
        .progress_sink(sink);
    for (name, value) in spec.headers() {
        request = request.header(name.as_str(), value.as_str());
    }
    request
}

async fn remove_quietly(path: &std::path::Path) {
    if let Err(error) = tokio::fs::remove_file(path).await
        && error.kind() != std::io::ErrorKind::NotFound
    {
        debug!(path = %path.display(), %error, "could not remove temp file");
    }
}

/// Aggregates per-segment cumulative counts into one total.
struct SegmentProgress {
    total: Arc<AtomicU64>,
    per_segment: Vec<Arc<AtomicU64>>,
    sink: Option<ProgressSink>,
}

impl SegmentProgress {
    fn new(segments: usize, sink: Option<ProgressSink>) -> Self {
        Self {
            total: Arc::new(AtomicU64::new(0)),
            per_segment: (0..segments).map(|_| Arc::new(AtomicU64::new(0))).collect(),
            sink,
        }
    }

    fn sink_for(&self, index: usize) -> ProgressSink {
        let total = Arc::clone(&self.total);
        let seen = self
            .per_segment
            .get(index)
            .map_or_else(|| Arc::new(AtomicU64::new(0)), Arc::clone);
        let outer = self.sink.clone();
        ProgressSink::new(move |cumulative| {
            let previous = seen.swap(cumulative, Ordering::SeqCst);
            let now = total.fetch_add(cumulative.saturating_sub(previous), Ordering::SeqCst)
                + cumulative.saturating_sub(previous);
            if let Some(outer) = &outer {
                outer.report(now);
            }
        })
    }

    /// Forgets the bytes of a segment that is about to be downloaded again.
    fn rewind(&self, index: usize) {
        if let Some(seen) = self.per_segment.get(index) {
            let previous = seen.swap(0, Ordering::SeqCst);
            self.total.fetch_sub(previous, Ordering::SeqCst);
        }
    }
}
