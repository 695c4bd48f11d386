use crate::cache::PreviewImage;
use crate::error::PreviewError;
use image::codecs::jpeg::JpegDecoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageError, ImageFormat};
use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_TARGET_LONG_EDGE: u32 = 1200;

// Past this multiple of the target, decode through the fast reduced path
const FAST_PATH_FACTOR: u32 = 2;

/// Loads preview pixels for a file. Implementations run on the decode pool.
pub trait Decoder: Send + Sync {
    /// Reads only the header to find the image dimensions.
    fn probe_dimensions(&self, path: &Path) -> Result<(u32, u32), PreviewError>;

    fn decode(&self, path: &Path) -> Result<PreviewImage, PreviewError>;

    fn decode_downsampled(
        &self,
        path: &Path,
        target_long_edge: u32,
        cancel: &CancellationToken,
    ) -> Result<PreviewImage, PreviewError>;

    /// Full decode for images that already fit, downsampled decode otherwise.
    fn load_preview(
        &self,
        path: &Path,
        target_long_edge: u32,
        cancel: &CancellationToken,
    ) -> Result<PreviewImage, PreviewError> {
        if cancel.is_cancelled() {
            return Err(PreviewError::Cancelled);
        }

        let (width, height) = self.probe_dimensions(path)?;
        if width.max(height) > target_long_edge {
            self.decode_downsampled(path, target_long_edge, cancel)
        } else {
            self.decode(path)
        }
    }
}

/// Scales `(width, height)` so the long edge equals `target_long_edge`,
/// rounding the other edge to keep the aspect ratio.
pub fn fit_long_edge(width: u32, height: u32, target_long_edge: u32) -> (u32, u32) {
    if width == 0 || height == 0 {
        return (width, height);
    }

    let scaled = |short: u32, long: u32| -> u32 {
        let value = (target_long_edge as f64 * short as f64 / long as f64).round();
        (value as u32).max(1)
    };

    if width >= height {
        (target_long_edge, scaled(height, width))
    } else {
        (scaled(width, height), target_long_edge)
    }
}

/// `Decoder` backed by the `image` crate.
#[derive(Clone, Copy, Debug, Default)]
pub struct ImageDecoder;

impl ImageDecoder {
    pub fn new() -> Self {
        Self
    }

    fn open(&self, path: &Path) -> Result<image::io::Reader<BufReader<File>>, PreviewError> {
        image::io::Reader::open(path)
            .and_then(|reader| reader.with_guessed_format())
            .map_err(|e| io_error(path, e))
    }

    fn decode_full(&self, path: &Path) -> Result<DynamicImage, PreviewError> {
        self.open(path)?.decode().map_err(|e| image_error(path, e))
    }

    // JPEG can scale by 1/2, 1/4 or 1/8 inside the IDCT, so the full-size
    // buffer is never allocated. Other formats decode fully.
    fn decode_reduced(&self, path: &Path, width: u32, height: u32) -> Result<DynamicImage, PreviewError> {
        let reader = self.open(path)?;
        if reader.format() != Some(ImageFormat::Jpeg) {
            return reader.decode().map_err(|e| image_error(path, e));
        }

        let file = File::open(path).map_err(|e| io_error(path, e))?;
        let mut decoder = JpegDecoder::new(BufReader::new(file)).map_err(|e| image_error(path, e))?;
        decoder
            .scale(clamp_u16(width), clamp_u16(height))
            .map_err(|e| image_error(path, e))?;
        DynamicImage::from_decoder(decoder).map_err(|e| image_error(path, e))
    }

    fn downsample(
        &self,
        path: &Path,
        (width, height): (u32, u32),
        target_long_edge: u32,
        cancel: &CancellationToken,
    ) -> Result<PreviewImage, PreviewError> {
        let long_edge = width.max(height);
        if long_edge <= target_long_edge {
            return self.decode(path);
        }

        let (target_width, target_height) = fit_long_edge(width, height, target_long_edge);

        if long_edge > target_long_edge.saturating_mul(FAST_PATH_FACTOR) {
            let reduced = self.decode_reduced(path, target_width, target_height)?;
            if cancel.is_cancelled() {
                return Err(PreviewError::Cancelled);
            }
            // Area-averaging box filter
            Ok(reduced.thumbnail_exact(target_width, target_height).into())
        } else {
            let full = self.decode_full(path)?;
            if cancel.is_cancelled() {
                return Err(PreviewError::Cancelled);
            }
            Ok(full
                .resize_exact(target_width, target_height, FilterType::Lanczos3)
                .into())
        }
    }
}

impl Decoder for ImageDecoder {
    fn probe_dimensions(&self, path: &Path) -> Result<(u32, u32), PreviewError> {
        self.open(path)?
            .into_dimensions()
            .map_err(|e| image_error(path, e))
    }

    fn decode(&self, path: &Path) -> Result<PreviewImage, PreviewError> {
        self.decode_full(path).map(PreviewImage::from)
    }

    fn decode_downsampled(
        &self,
        path: &Path,
        target_long_edge: u32,
        cancel: &CancellationToken,
    ) -> Result<PreviewImage, PreviewError> {
        if cancel.is_cancelled() {
            return Err(PreviewError::Cancelled);
        }

        let dimensions = self.probe_dimensions(path)?;
        self.downsample(path, dimensions, target_long_edge, cancel)
    }

    // `downsample` already full-decodes images that fit, so one header read covers both branches
    fn load_preview(
        &self,
        path: &Path,
        target_long_edge: u32,
        cancel: &CancellationToken,
    ) -> Result<PreviewImage, PreviewError> {
        self.decode_downsampled(path, target_long_edge, cancel)
    }
}

fn clamp_u16(value: u32) -> u16 {
    value.min(u16::MAX as u32) as u16
}

fn io_error(path: &Path, err: io::Error) -> PreviewError {
    if err.kind() == io::ErrorKind::NotFound {
        PreviewError::NotFound(path.to_path_buf())
    } else {
        PreviewError::Io {
            path: path.to_path_buf(),
            reason: err.to_string(),
        }
    }
}

fn image_error(path: &Path, err: ImageError) -> PreviewError {
    match err {
        ImageError::Unsupported(_) => PreviewError::UnsupportedFormat(path.to_path_buf()),
        ImageError::Limits(limits) => PreviewError::ResourceExhausted(limits.to_string()),
        ImageError::IoError(e) if e.kind() == io::ErrorKind::NotFound => {
            PreviewError::NotFound(path.to_path_buf())
        }
        other => PreviewError::CorruptData {
            path: path.to_path_buf(),
            reason: other.to_string(),
        },
    }
}
