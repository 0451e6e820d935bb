use std::io::Cursor;
use std::path::Path;

use image::codecs::png::PngEncoder;
use image::error::{LimitError, LimitErrorKind};
use image::{ExtendedColorType, ImageEncoder, ImageError, Rgba, RgbaImage};

use crate::error::{Error, Result};

/// A decoded RGBA capture. Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterImage {
    pixels: RgbaImage,
}

impl RasterImage {
    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.pixels.dimensions()
    }

    pub fn pixel(&self, x: u32, y: u32) -> Rgba<u8> {
        *self.pixels.get_pixel(x, y)
    }

    pub fn as_rgba(&self) -> &RgbaImage {
        &self.pixels
    }
}

impl From<RgbaImage> for RasterImage {
    fn from(pixels: RgbaImage) -> Self {
        Self { pixels }
    }
}

/// Decodes any supported container (PNG, JPEG, GIF) into RGBA.
pub fn decode(bytes: &[u8], context: &str) -> Result<RasterImage> {
    let decoded = image::load_from_memory(bytes).map_err(|source| Error::Decode {
        context: context.to_string(),
        source,
    })?;
    let pixels = decoded.to_rgba8();
    if pixels.width() == 0 || pixels.height() == 0 {
        return Err(Error::Decode {
            context: context.to_string(),
            source: ImageError::Limits(LimitError::from_kind(LimitErrorKind::DimensionError)),
        });
    }
    Ok(RasterImage { pixels })
}

pub fn decode_file(path: &Path) -> Result<RasterImage> {
    let bytes = std::fs::read(path).map_err(|e| Error::storage(path, e))?;
    decode(&bytes, &path.display().to_string())
}

/// PNG with fixed encoder settings, so identical pixels always give identical bytes.
pub fn encode(image: &RasterImage) -> Result<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    PngEncoder::new(&mut out)
        .write_image(
            image.pixels.as_raw(),
            image.width(),
            image.height(),
            ExtendedColorType::Rgba8,
        )
        .map_err(Error::Encode)?;
    Ok(out.into_inner())
}
