use std::path::Path;

use async_trait::async_trait;

use super::{
    mime_for_extension, output_extension, output_file, parse_dimensions, run_tool, MediaTransform,
    Rendition, TransformError,
};
use crate::storage::models::Dimension;

/// Only shows if the source cannot cover the box, which `^` prevents.
const EXTENT_BACKGROUND: &str = "white";

/// How an image dimension is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageOperation {
    /// Scale until the box is covered, then cut the exact box from the centre.
    CropCover { width: u32, height: u32 },
    /// Aspect-preserving resize; no geometry means re-encode only.
    Resize {
        width: Option<u32>,
        height: Option<u32>,
    },
}

impl ImageOperation {
    pub fn for_dimension(dimension: &Dimension) -> Self {
        match dimension.fixed_box() {
            Some((width, height)) => ImageOperation::CropCover { width, height },
            None => ImageOperation::Resize {
                width: dimension.width,
                height: dimension.height,
            },
        }
    }

    /// ImageMagick arguments turning `input` into `output`.
    pub fn args(&self, input: &str, output: &str, quality: u8, format: Option<&str>) -> Vec<String> {
        let mut args = vec![input.to_string()];
        match *self {
            ImageOperation::CropCover { width, height } => {
                let geometry = format!("{width}x{height}");
                args.extend([
                    "-resize".to_string(),
                    format!("{geometry}^"),
                    "-gravity".to_string(),
                    "center".to_string(),
                    "-background".to_string(),
                    EXTENT_BACKGROUND.to_string(),
                    "-extent".to_string(),
                    geometry,
                ]);
            }
            ImageOperation::Resize { width, height } => {
                if let Some(geometry) = resize_geometry(width, height) {
                    args.extend(["-resize".to_string(), geometry]);
                }
            }
        }
        args.extend([
            "-quality".to_string(),
            quality.clamp(1, 100).to_string(),
            output_target(output, format),
        ]);
        args
    }
}

/// `<w>x` fixes the width, `x<h>` the height, `<w>x<h>>` fits within the box
/// without upscaling.
pub fn resize_geometry(width: Option<u32>, height: Option<u32>) -> Option<String> {
    match (width, height) {
        (Some(w), None) => Some(format!("{w}x")),
        (None, Some(h)) => Some(format!("x{h}")),
        (Some(w), Some(h)) => Some(format!("{w}x{h}>")),
        (None, None) => None,
    }
}

/// A `format:` prefix makes ImageMagick write that format whatever the file name.
fn output_target(output: &str, format: Option<&str>) -> String {
    match format.map(str::trim).filter(|f| !f.is_empty()) {
        Some(format) => format!("{}:{output}", format.to_ascii_lowercase()),
        None => output.to_string(),
    }
}

/// ImageMagick-backed image renditions.
pub struct ImageTransform {
    convert: String,
    identify: String,
}

impl ImageTransform {
    pub fn new(convert: &str, identify: &str) -> Self {
        Self {
            convert: convert.to_string(),
            identify: identify.to_string(),
        }
    }
}

#[async_trait]
impl MediaTransform for ImageTransform {
    async fn render(&self, source: &Path, dimension: &Dimension) -> Result<Rendition, TransformError> {
        let extension = output_extension(dimension, source, "jpg");
        let output = output_file(&extension)?;

        let operation = ImageOperation::for_dimension(dimension);
        let args = operation.args(
            &source.to_string_lossy(),
            &output.to_string_lossy(),
            dimension.quality,
            dimension.format.as_deref(),
        );
        run_tool(&self.convert, &args).await?;

        let (width, height) = self.read_dimensions(&output).await?;
        tracing::debug!(dimension = %dimension.name, width, height, ?operation, "Rendered image");

        Ok(Rendition {
            path: output,
            width,
            height,
            mime_type: mime_for_extension(&extension),
            extension,
        })
    }

    async fn read_dimensions(&self, path: &Path) -> Result<(u32, u32), TransformError> {
        // First frame only, so animated images print one size.
        let args = vec![
            "-format".to_string(),
            "%wx%h".to_string(),
            format!("{}[0]", path.to_string_lossy()),
        ];
        let stdout = run_tool(&self.identify, &args).await?;
        let text = String::from_utf8_lossy(&stdout);
        parse_dimensions(&text).ok_or_else(|| TransformError::UnreadableDimensions {
            tool: self.identify.clone(),
            output: text.into_owned(),
        })
    }
}
