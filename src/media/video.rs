use std::path::Path;

use async_trait::async_trait;

use super::{
    mime_for_extension, output_extension, output_file, parse_dimensions, run_tool, MediaTransform,
    Rendition, TransformError,
};
use crate::storage::models::Dimension;

/// Frame grabbed for video thumbnails, in seconds.
const THUMBNAIL_AT_SECONDS: &str = "1";

/// Map 1..=100 (higher is better) onto x264's CRF 0..=51 (lower is better).
pub fn crf_from_quality(quality: u8) -> u8 {
    let quality = f64::from(quality.clamp(1, 100));
    51 - (quality / 100.0 * 51.0).round() as u8
}

/// What ffmpeg is asked to do for one dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoPlan {
    Transcode {
        filter: Option<String>,
        crf: Option<u8>,
    },
    Frame {
        filter: Option<String>,
    },
}

impl VideoPlan {
    /// Named presets win over the dimension's own size and quality.
    pub fn for_dimension(dimension: &Dimension) -> Self {
        match dimension.name.as_str() {
            "360p" => VideoPlan::Transcode {
                filter: Some("scale=-2:360".to_string()),
                crf: Some(28),
            },
            "720p" => VideoPlan::Transcode {
                filter: Some("scale=-2:720".to_string()),
                crf: Some(23),
            },
            "1080p" => VideoPlan::Transcode {
                filter: Some("scale=-2:1080".to_string()),
                crf: Some(20),
            },
            "video_thumbnail" | "thumbnail" => VideoPlan::Frame {
                filter: scale_filter(dimension.width, dimension.height),
            },
            _ => VideoPlan::Transcode {
                filter: scale_filter(dimension.width, dimension.height),
                crf: Some(crf_from_quality(dimension.quality)),
            },
        }
    }

    pub fn is_frame(&self) -> bool {
        matches!(self, VideoPlan::Frame { .. })
    }

    /// `-i <in> -y [-vf scale=..] [-crf n] [-ss t -vframes 1] <out>`
    pub fn args(&self, input: &str, output: &str) -> Vec<String> {
        let mut args = vec!["-i".to_string(), input.to_string(), "-y".to_string()];
        let (filter, crf, frame) = match self {
            VideoPlan::Transcode { filter, crf } => (filter, *crf, false),
            VideoPlan::Frame { filter } => (filter, None, true),
        };
        if let Some(filter) = filter {
            args.extend(["-vf".to_string(), filter.clone()]);
        }
        if let Some(crf) = crf {
            args.extend(["-crf".to_string(), crf.to_string()]);
        }
        if frame {
            args.extend([
                "-ss".to_string(),
                THUMBNAIL_AT_SECONDS.to_string(),
                "-vframes".to_string(),
                "1".to_string(),
            ]);
        }
        args.push(output.to_string());
        args
    }
}

/// Missing sides become `-2` so ffmpeg keeps the aspect ratio with an even size.
fn scale_filter(width: Option<u32>, height: Option<u32>) -> Option<String> {
    match (width, height) {
        (Some(w), Some(h)) => Some(format!("scale={w}:{h}")),
        (Some(w), None) => Some(format!("scale={w}:-2")),
        (None, Some(h)) => Some(format!("scale=-2:{h}")),
        (None, None) => None,
    }
}

/// FFmpeg-backed video renditions.
pub struct VideoTransform {
    ffmpeg: String,
    ffprobe: String,
}

impl VideoTransform {
    pub fn new(ffmpeg: &str, ffprobe: &str) -> Self {
        Self {
            ffmpeg: ffmpeg.to_string(),
            ffprobe: ffprobe.to_string(),
        }
    }
}

#[async_trait]
impl MediaTransform for VideoTransform {
    async fn render(&self, source: &Path, dimension: &Dimension) -> Result<Rendition, TransformError> {
        let plan = VideoPlan::for_dimension(dimension);
        let extension = if plan.is_frame() {
            dimension
                .format
                .as_deref()
                .map(|f| f.trim_start_matches('.').to_ascii_lowercase())
                .unwrap_or_else(|| "jpg".to_string())
        } else {
            output_extension(dimension, source, "mp4")
        };
        let output = output_file(&extension)?;

        let args = plan.args(&source.to_string_lossy(), &output.to_string_lossy());
        run_tool(&self.ffmpeg, &args).await?;

        let (width, height) = self.read_dimensions(&output).await?;
        tracing::debug!(dimension = %dimension.name, width, height, ?plan, "Rendered video");

        Ok(Rendition {
            path: output,
            width,
            height,
            mime_type: mime_for_extension(&extension),
            extension,
        })
    }

    async fn read_dimensions(&self, path: &Path) -> Result<(u32, u32), TransformError> {
        let args = vec![
            "-v".to_string(),
            "error".to_string(),
            "-select_streams".to_string(),
            "v:0".to_string(),
            "-show_entries".to_string(),
            "stream=width,height".to_string(),
            "-of".to_string(),
            "csv=s=x:p=0".to_string(),
            path.to_string_lossy().into_owned(),
        ];
        let stdout = run_tool(&self.ffprobe, &args).await?;
        let text = String::from_utf8_lossy(&stdout);
        parse_dimensions(&text).ok_or_else(|| TransformError::UnreadableDimensions {
            tool: self.ffprobe.clone(),
            output: text.into_owned(),
        })
    }
}
