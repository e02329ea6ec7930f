//! Supported photo formats: recognition by extension, decoding and re-encoding.

use image::codecs::jpeg::JpegEncoder;
use image::metadata::Orientation;
use image::{DynamicImage, ImageDecoder, ImageFormat, ImageReader};
use std::io::Cursor;
use std::path::Path;
use thiserror::Error;

/// Quality used whenever a JPEG is (re-)encoded.
pub const JPEG_QUALITY: u8 = 90;

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("unsupported file type: {0}")]
    Unsupported(String),
    #[error("could not decode image: {0}")]
    Decode(#[source] image::ImageError),
    #[error("could not encode image: {0}")]
    Encode(#[source] image::ImageError),
    #[error("image has no pixels")]
    Empty,
}

/// Photo formats accepted from the input directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhotoFormat {
    Jpeg,
    Png,
    Bmp,
    Gif,
    Tiff,
    WebP,
}

impl PhotoFormat {
    /// Recognize a format from the file extension (case-insensitive).
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            "bmp" => Some(Self::Bmp),
            "gif" => Some(Self::Gif),
            "tif" | "tiff" => Some(Self::Tiff),
            "webp" => Some(Self::WebP),
            _ => None,
        }
    }

    /// BMP and GIF carry no usable metadata container and are converted to JPEG.
    pub fn needs_conversion(self) -> bool {
        matches!(self, Self::Bmp | Self::Gif)
    }

    /// Format written to the output directories.
    pub fn output_format(self) -> Self {
        if self.needs_conversion() {
            Self::Jpeg
        } else {
            self
        }
    }

    /// Whether face coordinates can be embedded as EXIF rather than a sidecar.
    pub fn embeds_exif(self) -> bool {
        self == Self::Jpeg
    }

    fn image_format(self) -> ImageFormat {
        match self {
            Self::Jpeg => ImageFormat::Jpeg,
            Self::Png => ImageFormat::Png,
            Self::Bmp => ImageFormat::Bmp,
            Self::Gif => ImageFormat::Gif,
            Self::Tiff => ImageFormat::Tiff,
            Self::WebP => ImageFormat::WebP,
        }
    }
}

/// Name of the output file for an input file name, or `None` if unsupported.
///
/// Converted formats keep their full name and gain a `.jpg` extension
/// (`scan.bmp` becomes `scan.bmp.jpg`), so `scan.bmp` and `scan.jpg` never
/// share an output.
pub fn output_file_name(input_name: &str) -> Option<String> {
    let format = PhotoFormat::from_path(Path::new(input_name))?;
    if format.needs_conversion() {
        Some(format!("{input_name}.jpg"))
    } else {
        Some(input_name.to_string())
    }
}

/// Decode raw file bytes in the given format.
///
/// An EXIF orientation tag is applied, so the result is upright as a viewer
/// would display it.
pub fn decode(bytes: &[u8], format: PhotoFormat) -> Result<DynamicImage, ImageError> {
    let mut decoder = ImageReader::with_format(Cursor::new(bytes), format.image_format())
        .into_decoder()
        .map_err(ImageError::Decode)?;
    let orientation = decoder.orientation().unwrap_or_else(|e| {
        tracing::debug!(error = %e, "unreadable orientation, decoding as stored");
        Orientation::NoTransforms
    });
    let mut image = DynamicImage::from_decoder(decoder).map_err(ImageError::Decode)?;
    if image.width() == 0 || image.height() == 0 {
        return Err(ImageError::Empty);
    }
    image.apply_orientation(orientation);
    Ok(image)
}

/// Encode an image into the given output format.
///
/// The result carries no metadata from the source file.
pub fn encode(image: &DynamicImage, format: PhotoFormat) -> Result<Vec<u8>, ImageError> {
    let mut out = Cursor::new(Vec::new());
    match format {
        PhotoFormat::Jpeg => {
            // JPEG has no alpha channel.
            let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
            rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY))
                .map_err(ImageError::Encode)?;
        }
        PhotoFormat::WebP => {
            let flattened = match image {
                DynamicImage::ImageRgb8(_) | DynamicImage::ImageRgba8(_) => image.clone(),
                other => DynamicImage::ImageRgba8(other.to_rgba8()),
            };
            flattened
                .write_to(&mut out, ImageFormat::WebP)
                .map_err(ImageError::Encode)?;
        }
        PhotoFormat::Bmp | PhotoFormat::Gif => {
            return Err(ImageError::Unsupported(format!("{format:?} is input-only")));
        }
        other => {
            image
                .write_to(&mut out, other.image_format())
                .map_err(ImageError::Encode)?;
        }
    }
    Ok(out.into_inner())
}
