use image::Rgba;

use crate::codec::RasterImage;
use crate::config::DiffConfig;
use crate::tiles::DiffResult;

pub const HIGHLIGHT: [u8; 3] = [255, 255, 0];

/// Tints every changed tile yellow; everything else is copied as-is.
///
/// The result is a fresh image with the same dimensions as `current`.
pub fn render(current: &RasterImage, result: &DiffResult, config: &DiffConfig) -> RasterImage {
    let mut out = current.as_rgba().clone();
    let alpha = config.yellow_alpha();

    for tile in result.changed_tiles() {
        let rect = tile.rect;
        for y in rect.y..rect.y + rect.h {
            for x in rect.x..rect.x + rect.w {
                let base = *out.get_pixel(x, y);
                out.put_pixel(x, y, blend_highlight(base, alpha));
            }
        }
    }

    out.into()
}

/// `base * (1 - alpha) + highlight * alpha` per color channel. Alpha channel is kept.
pub fn blend_highlight(base: Rgba<u8>, alpha: f32) -> Rgba<u8> {
    let a = f64::from(alpha);
    let inv = 1.0 - a;
    let mix = |orig: u8, hl: u8| {
        (f64::from(orig) * inv + f64::from(hl) * a)
            .round()
            .clamp(0.0, 255.0) as u8
    };
    Rgba([
        mix(base[0], HIGHLIGHT[0]),
        mix(base[1], HIGHLIGHT[1]),
        mix(base[2], HIGHLIGHT[2]),
        base[3],
    ])
}
