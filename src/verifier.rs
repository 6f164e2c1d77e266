//! # Artifact Verification
//!
//! Gatekeeper between a finished download and a [`VerifiedImage`]: the file
//! must be non-empty and decode completely as a raster image.

use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::illustration_errors::PipelineError;
use crate::illustration_model::{AspectRatio, VerifiedImage};

/// Decodes raster bytes and reports their dimensions
pub trait ImageDecoder: Send + Sync {
    fn dimensions(&self, bytes: &[u8]) -> Result<(u32, u32), String>;
}

/// Decoder backed by the `image` crate; decodes every pixel, not just the
/// header, so truncated bodies are caught
#[derive(Debug, Default, Clone, Copy)]
pub struct RasterDecoder;

impl ImageDecoder for RasterDecoder {
    fn dimensions(&self, bytes: &[u8]) -> Result<(u32, u32), String> {
        let format = image::guess_format(bytes).map_err(|e| e.to_string())?;
        let decoded =
            image::load_from_memory_with_format(bytes, format).map_err(|e| e.to_string())?;
        Ok((decoded.width(), decoded.height()))
    }
}

/// Open the downloaded file, fully decode it and build a [`VerifiedImage`]
///
/// The decode runs on tokio's blocking pool. A landscape result for a
/// vertical request is logged but accepted.
pub async fn verify_artifact(
    decoder: Arc<dyn ImageDecoder>,
    path: &Path,
    aspect_ratio: AspectRatio,
) -> Result<VerifiedImage, PipelineError> {
    let bytes = tokio::fs::read(path).await.map_err(|e| {
        PipelineError::CorruptArtifact(format!("cannot read {}: {e}", path.display()))
    })?;

    if bytes.is_empty() {
        return Err(PipelineError::CorruptArtifact(format!(
            "downloaded file {} is empty",
            path.display()
        )));
    }

    let byte_size = bytes.len() as u64;
    let (width, height) = tokio::task::spawn_blocking(move || decoder.dimensions(&bytes))
        .await
        .map_err(|e| PipelineError::Io(format!("decode task failed: {e}")))?
        .map_err(|e| {
            PipelineError::CorruptArtifact(format!("{} failed to decode: {e}", path.display()))
        })?;

    if width == 0 || height == 0 {
        return Err(PipelineError::CorruptArtifact(format!(
            "{} decoded to an empty {width}x{height} image",
            path.display()
        )));
    }

    if aspect_ratio.is_vertical() && width > height {
        warn!(
            path = %path.display(),
            width,
            height,
            requested = %aspect_ratio,
            "Generated image is landscape although a vertical composition was requested"
        );
    }

    debug!(path = %path.display(), width, height, bytes = byte_size, "Artifact verified");

    Ok(VerifiedImage {
        path: path.to_path_buf(),
        width,
        height,
        byte_size,
    })
}
