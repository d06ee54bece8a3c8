//! Feeds a captured dump of uplink events through the normalizer and sink.

use crate::normalize::{normalize, Normalized};
use crate::pipeline::{SinkHandle, SinkWriter};
use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::Serialize;
use simd_json::BorrowedValue;
use std::path::Path;
use std::sync::atomic::Ordering;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplaySummary {
    pub envelopes_total: usize,
    pub envelopes_processed: usize,
    pub measurements_enqueued: usize,
    pub points_written: u64,
    pub points_dropped: u64,
    pub batches_failed: u64,
    pub envelopes_skipped: usize,
    pub envelopes_errored: usize,
    pub interrupted: bool,
}

/// Replays every envelope of the JSON array in `path`, in file order, then
/// closes the sink. Only file-level problems fail the run. When `cancel` fires
/// the remaining envelopes are left unread and what was enqueued is drained.
pub async fn replay(
    path: &Path,
    writer: SinkWriter,
    cancel: CancellationToken,
) -> Result<ReplaySummary> {
    let fed = feed_file(path, &writer.handle(), &cancel).await;
    let sink = writer.close().await;

    let mut summary = fed?;
    summary.points_written = sink.points_written;
    summary.points_dropped = sink.points_dropped;
    summary.batches_failed = sink.batches_failed;
    tracing::info!(
        path = %path.display(),
        processed = summary.envelopes_processed,
        written = summary.points_written,
        skipped = summary.envelopes_skipped,
        errored = summary.envelopes_errored,
        "replay finished"
    );
    Ok(summary)
}

async fn feed_file(
    path: &Path,
    sink: &SinkHandle,
    cancel: &CancellationToken,
) -> Result<ReplaySummary> {
    let mut raw = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read replay file {}", path.display()))?;
    let document = simd_json::to_borrowed_value(&mut raw)
        .with_context(|| format!("replay file {} is not valid JSON", path.display()))?;
    let BorrowedValue::Array(envelopes) = document else {
        bail!(
            "replay file {} must contain a JSON array of envelopes",
            path.display()
        );
    };

    let stats = sink.stats();
    let mut summary = ReplaySummary {
        envelopes_total: envelopes.len(),
        ..ReplaySummary::default()
    };
    for (index, envelope) in envelopes.iter().enumerate() {
        if cancel.is_cancelled() {
            tracing::warn!(
                remaining = envelopes.len() - index,
                "replay interrupted; draining queued measurements"
            );
            summary.interrupted = true;
            break;
        }

        summary.envelopes_processed += 1;
        stats.envelopes_received.fetch_add(1, Ordering::Relaxed);
        match normalize(envelope, Utc::now()) {
            Normalized::Measurements(measurements) => {
                let count = measurements.len();
                for measurement in measurements {
                    sink.enqueue(measurement)
                        .await
                        .context("sink closed during replay")?;
                }
                summary.measurements_enqueued += count;
            }
            Normalized::Skipped(reason) if reason.is_error() => {
                summary.envelopes_errored += 1;
                stats.envelopes_malformed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(index, reason = reason.as_str(), "skipping invalid envelope");
            }
            Normalized::Skipped(reason) => {
                summary.envelopes_skipped += 1;
                stats.envelopes_skipped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(index, reason = reason.as_str(), "skipping envelope");
            }
        }
    }
    Ok(summary)
}
