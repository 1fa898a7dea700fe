//! Captured frames and the pixel conversions sources need: YUYV and Y16 to
//! grayscale, dark-frame detection, tiled CLAHE.

use image::GrayImage;
use std::time::Instant;

/// Fraction of near-black pixels above which a frame counts as dark.
pub const DARK_FRACTION: f32 = 0.95;
/// Pixels below this value are "near-black".
const DARK_LEVEL: u8 = 32;

/// A grayscale frame from any source.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: GrayImage,
    pub sequence: u64,
    pub timestamp: Instant,
    pub is_dark: bool,
}

impl Frame {
    pub fn new(image: GrayImage, sequence: u64) -> Self {
        let is_dark = is_dark_frame(&image, DARK_FRACTION);
        Self {
            image,
            sequence,
            timestamp: Instant::now(),
            is_dark,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Mean pixel value, `0.0..=255.0`.
    pub fn avg_brightness(&self) -> f32 {
        let px = self.image.as_raw();
        if px.is_empty() {
            return 0.0;
        }
        px.iter().map(|&b| b as f32).sum::<f32>() / px.len() as f32
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("buffer too short for {format}: expected {expected} bytes, got {actual}")]
    InvalidLength {
        format: &'static str,
        expected: usize,
        actual: usize,
    },
}

fn check_len(buf: &[u8], expected: usize, format: &'static str) -> Result<(), FrameError> {
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            format,
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

fn to_image(data: Vec<u8>, width: u32, height: u32) -> GrayImage {
    // Length is checked by every caller.
    GrayImage::from_raw(width, height, data).unwrap_or_else(|| GrayImage::new(width, height))
}

/// Packed YUYV 4:2:2 (`Y0 U Y1 V`) to grayscale: keep the luma bytes.
pub fn yuyv_to_grayscale(buf: &[u8], width: u32, height: u32) -> Result<GrayImage, FrameError> {
    let expected = (width * height * 2) as usize;
    check_len(buf, expected, "YUYV")?;
    let luma = buf[..expected].iter().step_by(2).copied().collect();
    Ok(to_image(luma, width, height))
}

/// 16-bit little-endian grayscale to 8-bit, keeping the high byte.
pub fn y16_to_grayscale(buf: &[u8], width: u32, height: u32) -> Result<GrayImage, FrameError> {
    let expected = (width * height * 2) as usize;
    check_len(buf, expected, "Y16")?;
    let gray = buf[..expected].chunks_exact(2).map(|px| px[1]).collect();
    Ok(to_image(gray, width, height))
}

/// 8-bit grayscale passthrough.
pub fn grey_to_grayscale(buf: &[u8], width: u32, height: u32) -> Result<GrayImage, FrameError> {
    let expected = (width * height) as usize;
    check_len(buf, expected, "GREY")?;
    Ok(to_image(buf[..expected].to_vec(), width, height))
}

/// True when more than `fraction` of the pixels are near-black. Empty
/// frames are dark.
pub fn is_dark_frame(image: &GrayImage, fraction: f32) -> bool {
    let px = image.as_raw();
    if px.is_empty() {
        return true;
    }
    let dark = px.iter().filter(|&&p| p < DARK_LEVEL).count();
    dark as f32 / px.len() as f32 > fraction
}

/// Contrast-limited adaptive histogram equalization over a `tiles` × `tiles`
/// grid. Each tile's histogram is clipped at `clip_limit` × tile pixels, the
/// excess spread evenly, and pixels are mapped by bilinear interpolation
/// between the four nearest tile CDFs.
pub fn clahe_enhance(image: &mut GrayImage, tiles: u32, clip_limit: f32) {
    let (w, h) = image.dimensions();
    let tiles = tiles.max(1);
    let (tile_w, tile_h) = (w / tiles, h / tiles);
    if tile_w == 0 || tile_h == 0 {
        return;
    }

    let mut luts = Vec::with_capacity((tiles * tiles) as usize);
    for ty in 0..tiles {
        for tx in 0..tiles {
            luts.push(tile_lut(image, tx * tile_w, ty * tile_h, tile_w, tile_h, clip_limit));
        }
    }
    let last = (tiles - 1) as f32;
    let lut = |row: u32, col: u32| &luts[(row * tiles + col) as usize];

    for y in 0..h {
        let fy = (y as f32 / tile_h as f32 - 0.5).clamp(0.0, last);
        let (r0, dy) = (fy as u32, fy.fract());
        let r1 = (r0 + 1).min(tiles - 1);
        for x in 0..w {
            let fx = (x as f32 / tile_w as f32 - 0.5).clamp(0.0, last);
            let (c0, dx) = (fx as u32, fx.fract());
            let c1 = (c0 + 1).min(tiles - 1);

            let v = image.get_pixel(x, y).0[0] as usize;
            let top = lut(r0, c0)[v] * (1.0 - dx) + lut(r0, c1)[v] * dx;
            let bottom = lut(r1, c0)[v] * (1.0 - dx) + lut(r1, c1)[v] * dx;
            let out = top * (1.0 - dy) + bottom * dy;
            image.get_pixel_mut(x, y).0[0] = out.round().clamp(0.0, 255.0) as u8;
        }
    }
}

/// Clipped, normalized CDF of one tile as a 256-entry lookup table.
fn tile_lut(image: &GrayImage, x0: u32, y0: u32, w: u32, h: u32, clip_limit: f32) -> [f32; 256] {
    let mut hist = [0u32; 256];
    for y in y0..y0 + h {
        for x in x0..x0 + w {
            hist[image.get_pixel(x, y).0[0] as usize] += 1;
        }
    }

    let pixels = w * h;
    let clip = ((clip_limit * pixels as f32) as u32).max(1);
    let excess: u32 = hist.iter().map(|&n| n.saturating_sub(clip)).sum();
    let (share, remainder) = (excess / 256, (excess % 256) as usize);
    for (i, bin) in hist.iter_mut().enumerate() {
        *bin = (*bin).min(clip) + share + u32::from(i < remainder);
    }

    let mut lut = [0f32; 256];
    let mut running = 0u32;
    for (slot, &n) in lut.iter_mut().zip(&hist) {
        running += n;
        *slot = running as f32;
    }
    let floor = lut.iter().copied().find(|&v| v > 0.0).unwrap_or(0.0);
    let span = pixels as f32 - floor;
    if span > 0.0 {
        for v in &mut lut {
            *v = ((*v - floor) / span * 255.0).clamp(0.0, 255.0);
        }
    }
    lut
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn stddev(img: &GrayImage) -> f32 {
        let px = img.as_raw();
        let n = px.len() as f32;
        let mean = px.iter().map(|&b| b as f32).sum::<f32>() / n;
        (px.iter().map(|&b| (b as f32 - mean).powi(2)).sum::<f32>() / n).sqrt()
    }

    #[test]
    fn test_yuyv_keeps_luma() {
        let img = yuyv_to_grayscale(&[100, 128, 200, 128], 2, 1).unwrap();
        assert_eq!(img.as_raw(), &vec![100, 200]);
    }

    #[test]
    fn test_yuyv_short_buffer() {
        let err = yuyv_to_grayscale(&[100, 128], 2, 1).unwrap_err();
        assert!(err.to_string().contains("YUYV"));
    }

    #[test]
    fn test_y16_high_byte() {
        let img = y16_to_grayscale(&[0x34, 0x12, 0xff, 0xab], 2, 1).unwrap();
        assert_eq!(img.as_raw(), &vec![0x12, 0xab]);
    }

    #[test]
    fn test_grey_passthrough_truncates() {
        let img = grey_to_grayscale(&[1, 2, 3, 4, 5], 2, 2).unwrap();
        assert_eq!(img.as_raw(), &vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_dark_detection() {
        assert!(is_dark_frame(&GrayImage::new(10, 10), DARK_FRACTION));
        assert!(!is_dark_frame(&GrayImage::from_pixel(10, 10, Luma([128])), DARK_FRACTION));
        assert!(is_dark_frame(&GrayImage::new(0, 0), DARK_FRACTION));

        // 96 dark pixels out of 100.
        let mostly = GrayImage::from_fn(10, 10, |x, y| Luma([if y * 10 + x < 96 { 5 } else { 200 }]));
        assert!(is_dark_frame(&mostly, DARK_FRACTION));
        let borderline = GrayImage::from_fn(10, 10, |x, y| Luma([if y * 10 + x < 94 { 5 } else { 200 }]));
        assert!(!is_dark_frame(&borderline, DARK_FRACTION));
    }

    #[test]
    fn test_frame_new_flags_dark() {
        assert!(Frame::new(GrayImage::new(4, 4), 0).is_dark);
        let f = Frame::new(GrayImage::from_pixel(4, 4, Luma([100])), 3);
        assert!(!f.is_dark);
        assert_eq!(f.avg_brightness(), 100.0);
        assert_eq!((f.width(), f.height(), f.sequence), (4, 4, 3));
    }

    #[test]
    fn test_clahe_stretches_low_contrast() {
        let mut img = GrayImage::from_fn(16, 16, |x, y| Luma([100 + ((y * 16 + x) % 11) as u8]));
        let before = stddev(&img);
        clahe_enhance(&mut img, 2, 0.02);
        assert!(stddev(&img) > before);
    }

    #[test]
    fn test_clahe_tiny_image_untouched() {
        let mut img = GrayImage::from_pixel(3, 3, Luma([50]));
        clahe_enhance(&mut img, 8, 0.02);
        assert_eq!(img, GrayImage::from_pixel(3, 3, Luma([50])));
    }
}
