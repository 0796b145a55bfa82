//! Derivative rendering through external command-line tools.

mod image;
mod video;

pub use image::{ImageOperation, ImageTransform};
pub use video::{crf_from_quality, VideoPlan, VideoTransform};

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempPath;
use thiserror::Error;
use tokio::process::Command;

use crate::config::MediaConfig;
use crate::storage::models::{Dimension, MediaKind};

/// Tool output kept in error messages.
const MAX_TOOL_OUTPUT: usize = 2000;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("Failed to run {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{tool} exited with status {status:?}: {output}")]
    ToolFailed {
        tool: String,
        status: Option<i32>,
        output: String,
    },
    #[error("Could not read dimensions from {tool} output {output:?}")]
    UnreadableDimensions { tool: String, output: String },
    #[error("Unsupported transform: {0}")]
    Unsupported(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A rendered derivative waiting to be stored. The file is removed on drop.
#[derive(Debug)]
pub struct Rendition {
    pub path: TempPath,
    pub width: u32,
    pub height: u32,
    pub extension: String,
    pub mime_type: String,
}

/// Renders derivatives for one media kind.
#[async_trait]
pub trait MediaTransform: Send + Sync {
    async fn render(&self, source: &Path, dimension: &Dimension) -> Result<Rendition, TransformError>;

    /// Pixel width and height of a file this transform understands.
    async fn read_dimensions(&self, path: &Path) -> Result<(u32, u32), TransformError>;
}

/// Dispatch table from media kind to its transform.
#[derive(Clone, Default)]
pub struct TransformTable {
    image: Option<Arc<dyn MediaTransform>>,
    video: Option<Arc<dyn MediaTransform>>,
}

impl TransformTable {
    pub fn new(
        image: Option<Arc<dyn MediaTransform>>,
        video: Option<Arc<dyn MediaTransform>>,
    ) -> Self {
        Self { image, video }
    }

    /// ImageMagick for images, FFmpeg for video.
    pub fn from_config(media: &MediaConfig) -> Self {
        Self::new(
            Some(Arc::new(ImageTransform::new(
                &media.convert_path,
                &media.identify_path,
            ))),
            Some(Arc::new(VideoTransform::new(
                &media.ffmpeg_path,
                &media.ffprobe_path,
            ))),
        )
    }

    pub fn for_kind(&self, kind: MediaKind) -> Option<Arc<dyn MediaTransform>> {
        match kind {
            MediaKind::Image => self.image.clone(),
            MediaKind::Video => self.video.clone(),
            MediaKind::Other => None,
        }
    }
}

/// Run a tool to completion and return its stdout. The child is killed if the
/// caller is dropped first.
pub(crate) async fn run_tool(program: &str, args: &[String]) -> Result<Vec<u8>, TransformError> {
    tracing::debug!(tool = %program, ?args, "Running media tool");

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| TransformError::Spawn {
            tool: program.to_string(),
            source,
        })?;

    if !output.status.success() {
        let mut text = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if text.is_empty() {
            text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        }
        if text.len() > MAX_TOOL_OUTPUT {
            let mut cut = MAX_TOOL_OUTPUT;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text.truncate(cut);
        }
        return Err(TransformError::ToolFailed {
            tool: program.to_string(),
            status: output.status.code(),
            output: text,
        });
    }

    Ok(output.stdout)
}

/// Parse `<width>x<height>` as printed by `identify -format %wx%h` and
/// `ffprobe ... -of csv=s=x:p=0`.
pub fn parse_dimensions(output: &str) -> Option<(u32, u32)> {
    let line = output.lines().map(str::trim).find(|l| !l.is_empty())?;
    let mut parts = line.split('x');
    let width = parts.next()?.trim().parse().ok()?;
    let height = parts.next()?.trim().parse().ok()?;
    Some((width, height))
}

/// Extension of the rendered file: the dimension's format override, else the source's.
pub(crate) fn output_extension(dimension: &Dimension, source: &Path, fallback: &str) -> String {
    dimension
        .format
        .as_deref()
        .map(|f| f.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|f| !f.is_empty())
        .or_else(|| {
            source
                .extension()
                .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        })
        .unwrap_or_else(|| fallback.to_string())
}

pub(crate) fn mime_for_extension(extension: &str) -> String {
    mime_guess::from_ext(extension)
        .first_or_octet_stream()
        .to_string()
}

/// Empty temp file with the given extension for a tool to write into.
pub(crate) fn output_file(extension: &str) -> Result<TempPath, TransformError> {
    Ok(tempfile::Builder::new()
        .prefix("rendition-")
        .suffix(&format!(".{extension}"))
        .tempfile()?
        .into_temp_path())
}
