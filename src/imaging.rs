// Still development and thumbnails
//
// Fixed image transforms used by the recorders: debayering, black level and
// white balance correction, bit-depth rescaling, sRGB encoding, TIFF/JPEG.

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageBuffer, ImageFormat, Luma, Rgb};

use crate::container::{BayerPattern, ColorBalance};
use crate::pipeline::Frame;

/// Headroom kept above the signal when scaling bayer data to 16 bits
const TOP_PADDING_BITS: u8 = 2;

const THUMBNAIL_MAX_WIDTH: u32 = 640;

/// Error type for image operations
#[derive(Debug, thiserror::Error)]
pub enum ImagingError {
    #[error("Pixel buffer of {len} bytes does not match {width}x{height} at {bitcount} bit")]
    BadBuffer { len: usize, width: u32, height: u32, bitcount: u8 },

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

pub type Result<T> = std::result::Result<T, ImagingError>;

/// Read the frame's samples as 16-bit values (LSB-aligned)
pub fn samples(frame: &Frame) -> Result<Vec<u16>> {
    let expected = frame.width as usize * frame.height as usize * frame.bytes_per_pixel();
    if frame.pixels.len() != expected {
        return Err(ImagingError::BadBuffer {
            len: frame.pixels.len(),
            width: frame.width,
            height: frame.height,
            bitcount: frame.bitcount,
        });
    }
    Ok(if frame.bytes_per_pixel() == 2 {
        frame
            .pixels
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect()
    } else {
        frame.pixels.iter().map(|&v| v as u16).collect()
    })
}

/// Bilinear demosaic: every output channel is the mean of the samples of
/// that color in the 3x3 neighbourhood. Returns interleaved RGB.
pub fn debayer(samples: &[u16], width: usize, height: usize, pattern: BayerPattern) -> Vec<u16> {
    let (rx, ry) = pattern.red_offset();
    // 0 = red, 1 = green, 2 = blue
    let color_at = |x: usize, y: usize| -> usize {
        let on_red_row = y % 2 == ry;
        let on_red_col = x % 2 == rx;
        match (on_red_row, on_red_col) {
            (true, true) => 0,
            (false, false) => 2,
            _ => 1,
        }
    };

    let mut rgb = vec![0u16; width * height * 3];
    if width == 0 || height == 0 {
        return rgb;
    }
    for y in 0..height {
        for x in 0..width {
            let mut sums = [0u32; 3];
            let mut counts = [0u32; 3];
            for ny in y.saturating_sub(1)..=(y + 1).min(height - 1) {
                for nx in x.saturating_sub(1)..=(x + 1).min(width - 1) {
                    let c = color_at(nx, ny);
                    sums[c] += samples[ny * width + nx] as u32;
                    counts[c] += 1;
                }
            }
            let own = color_at(x, y);
            let out = &mut rgb[(y * width + x) * 3..(y * width + x) * 3 + 3];
            for c in 0..3 {
                out[c] = if c == own {
                    samples[y * width + x]
                } else if counts[c] > 0 {
                    (sums[c] / counts[c]) as u16
                } else {
                    0
                };
            }
        }
    }
    rgb
}

/// Subtract the black level and apply white balance in place
pub fn apply_color_balance(rgb: &mut [u16], balance: ColorBalance, black_level: u32) {
    let gains = [balance.k_r, balance.k_g, balance.k_b];
    for px in rgb.chunks_exact_mut(3) {
        for (value, gain) in px.iter_mut().zip(gains) {
            let corrected = (*value as f32 - black_level as f32) * gain;
            *value = corrected.clamp(0.0, 65535.0) as u16;
        }
    }
}

/// Undeveloped mosaic as an 8- or 16-bit grayscale image
pub fn raw_image(frame: &Frame) -> Result<DynamicImage> {
    let data = samples(frame)?;
    Ok(if frame.bitcount > 8 {
        DynamicImage::ImageLuma16(gray16(frame, data)?)
    } else {
        DynamicImage::ImageLuma8(gray8(frame, data)?)
    })
}

/// Full-quality still: bayer sources become 16-bit RGB with the signal in the
/// top bits, mono sources above 8 bits are stretched to 16 bits.
pub fn develop(frame: &Frame, bayer: Option<BayerPattern>, balance: ColorBalance) -> Result<DynamicImage> {
    let data = samples(frame)?;
    let (w, h) = (frame.width as usize, frame.height as usize);

    match bayer {
        Some(pattern) => {
            let shift = 16u8.saturating_sub(frame.bitcount).saturating_sub(TOP_PADDING_BITS) as u32;
            let scaled: Vec<u16> = data.iter().map(|&v| v << shift).collect();
            let mut rgb = debayer(&scaled, w, h, pattern);
            apply_color_balance(&mut rgb, balance, frame.black_level << shift);
            let buffer = ImageBuffer::<Rgb<u16>, _>::from_raw(frame.width, frame.height, rgb)
                .ok_or_else(|| bad_buffer(frame))?;
            Ok(DynamicImage::ImageRgb16(buffer))
        }
        None if frame.bitcount > 8 => {
            let shift = 16u8.saturating_sub(frame.bitcount) as u32;
            let stretched = data.into_iter().map(|v| v << shift).collect();
            Ok(DynamicImage::ImageLuma16(gray16(frame, stretched)?))
        }
        None => Ok(DynamicImage::ImageLuma8(gray8(frame, data)?)),
    }
}

/// sRGB transfer curve on a normalized linear value
pub fn linear_to_srgb(linear: f32) -> f32 {
    let linear = linear.clamp(0.0, 1.0);
    if linear <= 0.0031308 {
        12.92 * linear
    } else {
        1.055 * linear.powf(1.0 / 2.4) - 0.055
    }
}

/// 8-bit sRGB preview of a frame, downscaled to thumbnail width
pub fn preview(frame: &Frame, bayer: Option<BayerPattern>, balance: ColorBalance) -> Result<DynamicImage> {
    let data = samples(frame)?;
    let (w, h) = (frame.width as usize, frame.height as usize);
    let down = frame.bitcount.saturating_sub(8) as u32;

    let lut: Vec<u8> = (0..=255u32)
        .map(|v| (linear_to_srgb(v as f32 / 255.0) * 255.0).round() as u8)
        .collect();
    let to_display = |v: u16| lut[((v as u32) >> down).min(255) as usize];

    let image = match bayer {
        Some(pattern) => {
            let mut rgb = debayer(&data, w, h, pattern);
            apply_color_balance(&mut rgb, balance, frame.black_level);
            let bytes = rgb.into_iter().map(to_display).collect();
            DynamicImage::ImageRgb8(
                ImageBuffer::<Rgb<u8>, _>::from_raw(frame.width, frame.height, bytes).ok_or_else(|| bad_buffer(frame))?,
            )
        }
        None => {
            let bytes = data.into_iter().map(to_display).collect();
            DynamicImage::ImageLuma8(
                ImageBuffer::<Luma<u8>, _>::from_raw(frame.width, frame.height, bytes).ok_or_else(|| bad_buffer(frame))?,
            )
        }
    };

    if image.width() > THUMBNAIL_MAX_WIDTH {
        let height = (image.height() as u64 * THUMBNAIL_MAX_WIDTH as u64 / image.width() as u64).max(1) as u32;
        Ok(image.resize_exact(THUMBNAIL_MAX_WIDTH, height, FilterType::Triangle))
    } else {
        Ok(image)
    }
}

/// Copy of an 8-bit preview with clipped pixels painted red, plus the number
/// of clipped pixels
pub fn overexposure_overlay(preview: &DynamicImage) -> (DynamicImage, usize) {
    let mut rgb = preview.to_rgb8();
    let mut clipped = 0;
    for px in rgb.pixels_mut() {
        if px.0.iter().any(|&c| c >= 254) {
            *px = Rgb([255, 0, 0]);
            clipped += 1;
        }
    }
    (DynamicImage::ImageRgb8(rgb), clipped)
}

pub fn encode_tiff(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    image.write_to(&mut out, ImageFormat::Tiff)?;
    Ok(out.into_inner())
}

pub fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    image.write_with_encoder(JpegEncoder::new_with_quality(&mut out, quality))?;
    Ok(out)
}

fn gray8(frame: &Frame, data: Vec<u16>) -> Result<ImageBuffer<Luma<u8>, Vec<u8>>> {
    let bytes = data.into_iter().map(|v| v.min(255) as u8).collect();
    ImageBuffer::from_raw(frame.width, frame.height, bytes).ok_or_else(|| bad_buffer(frame))
}

fn gray16(frame: &Frame, data: Vec<u16>) -> Result<ImageBuffer<Luma<u16>, Vec<u16>>> {
    ImageBuffer::from_raw(frame.width, frame.height, data).ok_or_else(|| bad_buffer(frame))
}

fn bad_buffer(frame: &Frame) -> ImagingError {
    ImagingError::BadBuffer {
        len: frame.pixels.len(),
        width: frame.width,
        height: frame.height,
        bitcount: frame.bitcount,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame16(values: &[u16], width: u32, height: u32, bitcount: u8, black_level: u32) -> Frame {
        let pixels = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Frame::new(pixels, width, height, bitcount, 0.0, black_level)
    }

    #[test]
    fn debayer_keeps_native_sample_and_interpolates_others() {
        // RGGB tile repeated over 4x4: R=100, G=50, B=10
        let mut samples = vec![0u16; 16];
        for y in 0..4 {
            for x in 0..4 {
                samples[y * 4 + x] = match (y % 2, x % 2) {
                    (0, 0) => 100,
                    (1, 1) => 10,
                    _ => 50,
                };
            }
        }
        let rgb = debayer(&samples, 4, 4, BayerPattern::Rggb);
        // Pixel (1,1) is blue
        let px = &rgb[(4 + 1) * 3..(4 + 1) * 3 + 3];
        assert_eq!(px, &[100, 50, 10]);
        // Pixel (0,0) is red
        assert_eq!(&rgb[0..3], &[100, 50, 10]);
    }

    #[test]
    fn develop_bayer_shifts_to_top_with_headroom() {
        // 12-bit: shift = 16 - 12 - 2 = 2
        let frame = frame16(&[400, 400, 400, 400], 2, 2, 12, 100);
        let image = develop(&frame, Some(BayerPattern::Rggb), ColorBalance::default()).unwrap();
        let rgb = image.as_rgb16().unwrap();
        // (400 << 2) - (100 << 2) = 1200
        assert_eq!(rgb.get_pixel(0, 0).0, [1200, 1200, 1200]);
    }

    #[test]
    fn develop_mono_stretches_high_bit_depth() {
        let frame = frame16(&[1023, 0], 2, 1, 10, 0);
        let image = develop(&frame, None, ColorBalance::default()).unwrap();
        let gray = image.as_luma16().unwrap();
        assert_eq!(gray.get_pixel(0, 0).0, [1023 << 6]);
        assert_eq!(gray.get_pixel(1, 0).0, [0]);
    }

    #[test]
    fn color_balance_clamps() {
        let mut rgb = vec![1000, 1000, 1000, 50, 50, 50];
        apply_color_balance(&mut rgb, ColorBalance { k_r: 100.0, k_g: 1.0, k_b: 0.5 }, 100);
        assert_eq!(rgb, vec![65535, 900, 450, 0, 0, 0]);
    }

    #[test]
    fn srgb_curve_endpoints() {
        assert_eq!(linear_to_srgb(0.0), 0.0);
        assert!((linear_to_srgb(1.0) - 1.0).abs() < 1e-5);
        assert!(linear_to_srgb(0.18) > 0.45);
    }

    #[test]
    fn wrong_buffer_size_is_an_error() {
        let frame = Frame::new(vec![0u8; 3], 2, 2, 8, 0.0, 0);
        assert!(matches!(samples(&frame), Err(ImagingError::BadBuffer { .. })));
    }

    #[test]
    fn still_encodings_produce_files() {
        let frame = frame16(&[10, 20, 30, 40], 2, 2, 12, 0);
        let tiff = encode_tiff(&develop(&frame, Some(BayerPattern::Bggr), ColorBalance::default()).unwrap()).unwrap();
        assert!(tiff.starts_with(b"II*\0") || tiff.starts_with(b"MM\0*"));

        let jpeg = encode_jpeg(&preview(&frame, Some(BayerPattern::Bggr), ColorBalance::default()).unwrap(), 90).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }
}
