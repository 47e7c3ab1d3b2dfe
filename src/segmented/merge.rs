//! Ordered merge of segment temp files into the destination.

use std::path::Path;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tracing::{debug, warn};

use super::plan::{SegmentSpec, with_suffix};
use crate::transport::TransportError;

/// Fixed copy buffer used while merging (1 MiB).
pub const MERGE_BUFFER_SIZE: usize = 1024 * 1024;

/// Suffix of the file parts are merged into before it replaces the target.
const MERGING_SUFFIX: &str = ".merging";

/// Concatenates `parts` (already in index order) into `target`.
///
/// Parts are written to `<target>.merging`, which replaces `target` only once
/// every part was copied. On error the staging file is removed and an existing
/// `target` keeps its previous content. Each temp file is opened, streamed and
/// closed before the next one, then deleted. A total that differs from
/// `expected_len` is logged and otherwise ignored.
///
/// # Errors
///
/// Returns [`TransportError::Io`] naming the file that could not be read,
/// written or removed.
pub async fn merge_segments(
    target: &Path,
    parts: &[SegmentSpec],
    expected_len: u64,
) -> Result<u64, TransportError> {
    if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| TransportError::io(parent, e))?;
    }

    let staging = with_suffix(target, MERGING_SUFFIX);
    let total = match copy_parts(&staging, parts).await {
        Ok(total) => total,
        Err(error) => {
            if let Err(remove_error) = tokio::fs::remove_file(&staging).await
                && remove_error.kind() != std::io::ErrorKind::NotFound
            {
                debug!(path = %staging.display(), %remove_error, "could not remove merge file");
            }
            return Err(error);
        }
    };

    tokio::fs::rename(&staging, target)
        .await
        .map_err(|e| TransportError::io(target, e))?;

    if total != expected_len {
        warn!(
            expected = expected_len,
            actual = total,
            path = %target.display(),
            "merged size differs from content length"
        );
    }
    Ok(total)
}

async fn copy_parts(staging: &Path, parts: &[SegmentSpec]) -> Result<u64, TransportError> {
    let destination = File::create(staging)
        .await
        .map_err(|e| TransportError::io(staging, e))?;
    let mut writer = BufWriter::new(destination);
    let mut buffer = vec![0u8; MERGE_BUFFER_SIZE];
    let mut total: u64 = 0;

    for part in parts {
        {
            let mut source = File::open(&part.temp_path)
                .await
                .map_err(|e| TransportError::io(&part.temp_path, e))?;
            loop {
                let read = source
                    .read(&mut buffer)
                    .await
                    .map_err(|e| TransportError::io(&part.temp_path, e))?;
                if read == 0 {
                    break;
                }
                writer
                    .write_all(&buffer[..read])
                    .await
                    .map_err(|e| TransportError::io(staging, e))?;
                total += read as u64;
            }
        }
        tokio::fs::remove_file(&part.temp_path)
            .await
            .map_err(|e| TransportError::io(&part.temp_path, e))?;
        debug!(segment = part.index, merged = total, "segment merged");
    }

    writer
        .flush()
        .await
        .map_err(|e| TransportError::io(staging, e))?;
    Ok(total)
}
