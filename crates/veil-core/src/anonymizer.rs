//! Face anonymization by box-blurring each detected region.

use crate::types::FaceRegion;
use image::{DynamicImage, ImageBuffer, Pixel};

/// Default blur kernel size in pixels. Higher = stronger blur.
pub const DEFAULT_BLUR_STRENGTH: u32 = 100;

/// Blurs face regions in place with a normalized box filter.
#[derive(Debug, Clone, Copy)]
pub struct Anonymizer {
    strength: u32,
}

impl Default for Anonymizer {
    fn default() -> Self {
        Self::new(DEFAULT_BLUR_STRENGTH)
    }
}

impl Anonymizer {
    /// `strength` is the kernel size; it is clamped to each region's size and to at least 1.
    pub fn new(strength: u32) -> Self {
        Self {
            strength: strength.max(1),
        }
    }

    pub fn strength(&self) -> u32 {
        self.strength
    }

    /// Blur every face region of `image`. Regions are clipped to the image bounds;
    /// regions entirely outside it are skipped.
    ///
    /// Returns the number of regions that were blurred.
    pub fn anonymize(&self, image: &mut DynamicImage, faces: &[FaceRegion]) -> usize {
        let (width, height) = (image.width(), image.height());
        let regions: Vec<FaceRegion> = faces
            .iter()
            .filter_map(|face| face.clipped(width, height))
            .collect();

        if regions.is_empty() {
            return 0;
        }

        match image {
            DynamicImage::ImageRgb8(buf) => self.blur_all(buf, &regions),
            DynamicImage::ImageRgba8(buf) => self.blur_all(buf, &regions),
            DynamicImage::ImageLuma8(buf) => self.blur_all(buf, &regions),
            DynamicImage::ImageLumaA8(buf) => self.blur_all(buf, &regions),
            other => {
                // Deeper bit depths are flattened to 8-bit RGBA before blurring.
                let mut buf = other.to_rgba8();
                self.blur_all(&mut buf, &regions);
                *other = DynamicImage::ImageRgba8(buf);
            }
        }

        for region in &regions {
            tracing::debug!(%region, "blurred face region");
        }

        regions.len()
    }

    fn blur_all<P>(&self, image: &mut ImageBuffer<P, Vec<u8>>, regions: &[FaceRegion])
    where
        P: Pixel<Subpixel = u8>,
    {
        for region in regions {
            blur_region(image, *region, self.strength);
        }
    }
}

/// Separable box blur restricted to `region`; pixels outside it are never read or written.
fn blur_region<P>(image: &mut ImageBuffer<P, Vec<u8>>, region: FaceRegion, kernel: u32)
where
    P: Pixel<Subpixel = u8>,
{
    let channels = P::CHANNEL_COUNT as usize;
    let (rw, rh) = (region.width as usize, region.height as usize);
    let radius_x = (kernel.min(region.width) / 2) as usize;
    let radius_y = (kernel.min(region.height) / 2) as usize;

    let mut plane = vec![0u32; rw * rh * channels];
    for y in 0..rh {
        for x in 0..rw {
            let pixel = image.get_pixel(region.x + x as u32, region.y + y as u32);
            for (c, &value) in pixel.channels().iter().enumerate() {
                plane[(y * rw + x) * channels + c] = value as u32;
            }
        }
    }

    let mut line = Vec::with_capacity(rw.max(rh));
    for c in 0..channels {
        for y in 0..rh {
            line.clear();
            line.extend((0..rw).map(|x| plane[(y * rw + x) * channels + c]));
            for (x, value) in blur_line(&line, radius_x).into_iter().enumerate() {
                plane[(y * rw + x) * channels + c] = value;
            }
        }
        for x in 0..rw {
            line.clear();
            line.extend((0..rh).map(|y| plane[(y * rw + x) * channels + c]));
            for (y, value) in blur_line(&line, radius_y).into_iter().enumerate() {
                plane[(y * rw + x) * channels + c] = value;
            }
        }
    }

    for y in 0..rh {
        for x in 0..rw {
            let pixel = image.get_pixel_mut(region.x + x as u32, region.y + y as u32);
            for (c, value) in pixel.channels_mut().iter_mut().enumerate() {
                *value = plane[(y * rw + x) * channels + c].min(255) as u8;
            }
        }
    }
}

/// Mean over a window of `radius` on each side; the window shrinks at the edges.
fn blur_line(values: &[u32], radius: usize) -> Vec<u32> {
    let mut prefix = Vec::with_capacity(values.len() + 1);
    let mut sum = 0u64;
    prefix.push(sum);
    for &v in values {
        sum += v as u64;
        prefix.push(sum);
    }

    (0..values.len())
        .map(|i| {
            let lo = i.saturating_sub(radius);
            let hi = (i + radius + 1).min(values.len());
            let mean = (prefix[hi] - prefix[lo]) as f64 / (hi - lo) as f64;
            mean.round() as u32
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage, Rgba, RgbaImage};

    fn striped(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, _| {
            if x % 2 == 0 { Rgb([0, 0, 0]) } else { Rgb([255, 255, 255]) }
        })
    }

    #[test]
    fn test_blur_line_uniform() {
        assert_eq!(blur_line(&[7, 7, 7, 7], 2), vec![7, 7, 7, 7]);
    }

    #[test]
    fn test_blur_line_window_shrinks_at_edges() {
        // i=0 averages [0, 10] = 5, i=1 averages [0, 10, 20] = 10, i=2 averages [10, 20] = 15
        assert_eq!(blur_line(&[0, 10, 20], 1), vec![5, 10, 15]);
    }

    #[test]
    fn test_blur_line_zero_radius_is_identity() {
        assert_eq!(blur_line(&[1, 200, 3], 0), vec![1, 200, 3]);
    }

    #[test]
    fn test_anonymize_flattens_stripes_inside_region() {
        let mut image = DynamicImage::ImageRgb8(striped(40, 40));
        let face = FaceRegion { x: 10, y: 10, width: 20, height: 20 };

        let blurred = Anonymizer::new(100).anonymize(&mut image, &[face]);
        assert_eq!(blurred, 1);

        let rgb = image.to_rgb8();
        let centre = rgb.get_pixel(20, 20)[0];
        assert!((100..=155).contains(&centre), "centre = {centre}");
    }

    #[test]
    fn test_anonymize_leaves_outside_untouched() {
        let original = striped(40, 40);
        let mut image = DynamicImage::ImageRgb8(original.clone());
        let face = FaceRegion { x: 10, y: 10, width: 20, height: 20 };
        Anonymizer::default().anonymize(&mut image, &[face]);

        let rgb = image.to_rgb8();
        for (x, y, pixel) in rgb.enumerate_pixels() {
            let inside = (10..30).contains(&x) && (10..30).contains(&y);
            if !inside {
                assert_eq!(pixel, original.get_pixel(x, y), "pixel ({x}, {y}) changed");
            }
        }
    }

    #[test]
    fn test_anonymize_clips_and_skips() {
        let mut image = DynamicImage::ImageRgb8(striped(20, 20));
        let faces = [
            FaceRegion { x: 15, y: 15, width: 50, height: 50 },
            FaceRegion { x: 100, y: 100, width: 5, height: 5 },
        ];
        assert_eq!(Anonymizer::new(10).anonymize(&mut image, &faces), 1);
    }

    #[test]
    fn test_anonymize_no_faces() {
        let original = striped(8, 8);
        let mut image = DynamicImage::ImageRgb8(original.clone());
        assert_eq!(Anonymizer::default().anonymize(&mut image, &[]), 0);
        assert_eq!(image.to_rgb8(), original);
    }

    #[test]
    fn test_anonymize_keeps_alpha_channel_layout() {
        let mut image = DynamicImage::ImageRgba8(RgbaImage::from_pixel(10, 10, Rgba([50, 60, 70, 200])));
        let face = FaceRegion { x: 0, y: 0, width: 10, height: 10 };
        Anonymizer::new(5).anonymize(&mut image, &[face]);

        assert!(matches!(image, DynamicImage::ImageRgba8(_)));
        assert_eq!(image.to_rgba8().get_pixel(5, 5), &Rgba([50, 60, 70, 200]));
    }

    #[test]
    fn test_zero_strength_is_clamped() {
        assert_eq!(Anonymizer::new(0).strength(), 1);
    }
}
