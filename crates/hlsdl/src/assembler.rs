// Container assembly: joins downloaded segment files into the final output.

use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::DownloadError;
use crate::hls::throughput::ThroughputTracker;

#[async_trait]
pub trait ContainerAssembler: Send + Sync {
    /// Produce `output` from `parts`, in order.
    ///
    /// Each finished part is reported to `tracker` as one completed block.
    /// Returns the size of the output file.
    async fn assemble(
        &self,
        parts: &[PathBuf],
        output: &Path,
        tracker: &ThroughputTracker,
        token: &CancellationToken,
    ) -> Result<u64, DownloadError>;
}

/// Byte-level concatenation of MPEG transport stream files.
///
/// Transport streams are self-synchronizing, so the concatenation of aligned
/// segments is a playable stream.
#[derive(Debug, Clone, Default)]
pub struct ConcatAssembler;

impl ConcatAssembler {
    pub fn new() -> Self {
        Self
    }

    async fn write_parts(
        &self,
        parts: &[PathBuf],
        target: &Path,
        tracker: &ThroughputTracker,
        token: &CancellationToken,
    ) -> Result<u64, DownloadError> {
        let mut writer = BufWriter::new(File::create(target).await?);
        let mut written = 0u64;

        for part in parts {
            if token.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }
            let mut reader = File::open(part).await.map_err(|e| DownloadError::Assembly {
                reason: format!("cannot open {}: {e}", part.display()),
            })?;
            let copied = tokio::select! {
                _ = token.cancelled() => return Err(DownloadError::Cancelled),
                copied = tokio::io::copy(&mut reader, &mut writer) => copied?,
            };
            written += copied;
            tracker.record_completed(Instant::now(), copied);
            debug!(part = %part.display(), bytes = copied, "Appended segment");
        }

        writer.flush().await?;
        writer.into_inner().sync_all().await?;
        Ok(written)
    }
}

/// Path of the partially written output, `<output>.temp`.
pub fn partial_output_path(output: &Path) -> PathBuf {
    let mut name = output.file_name().unwrap_or_default().to_os_string();
    name.push(".temp");
    output.with_file_name(name)
}

#[async_trait]
impl ContainerAssembler for ConcatAssembler {
    async fn assemble(
        &self,
        parts: &[PathBuf],
        output: &Path,
        tracker: &ThroughputTracker,
        token: &CancellationToken,
    ) -> Result<u64, DownloadError> {
        if parts.is_empty() {
            return Err(DownloadError::Assembly {
                reason: "no segments to assemble".to_string(),
            });
        }

        let partial = partial_output_path(output);
        let result = self.write_parts(parts, &partial, tracker, token).await;
        let written = match result {
            Ok(written) => written,
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(e);
            }
        };
        tokio::fs::rename(&partial, output).await?;

        info!(
            output = %output.display(),
            parts = parts.len(),
            bytes = written,
            "Output assembled"
        );
        Ok(written)
    }
}
