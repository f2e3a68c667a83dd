use crate::domain::ImageArray;
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageBuffer, ImageFormat, Luma, LumaA, Rgb, Rgba};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Invalid image shape: {0}")]
    InvalidShape(String),
    #[error("Image encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormatKind {
    #[default]
    Jpeg,
    Png,
}

impl ImageFormatKind {
    pub fn extension(self) -> &'static str {
        match self {
            ImageFormatKind::Jpeg => ".jpeg",
            ImageFormatKind::Png => ".png",
        }
    }
}

impl FromStr for ImageFormatKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Ok(ImageFormatKind::Jpeg),
            "png" => Ok(ImageFormatKind::Png),
            other => Err(format!("unsupported image format '{other}'")),
        }
    }
}

/// Encoding parameters for reported image arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageSettings {
    pub format: ImageFormatKind,
    pub quality: u8,
    /// Accepted for configuration compatibility; the encoder does not use it.
    pub subsampling: u8,
}

impl Default for ImageSettings {
    fn default() -> Self {
        Self {
            format: ImageFormatKind::Jpeg,
            quality: 87,
            subsampling: 0,
        }
    }
}

/// Row-major 8-bit pixels with their geometry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuantizedImage {
    pub height: u32,
    pub width: u32,
    pub channels: u8,
    pub pixels: Vec<u8>,
}

fn at_least_3d(shape: &[usize]) -> Result<(usize, usize, usize), CodecError> {
    match *shape {
        [n] => Ok((1, n, 1)),
        [h, w] => Ok((h, w, 1)),
        [h, w, c] if (1..=4).contains(&c) => Ok((h, w, c)),
        _ => Err(CodecError::InvalidShape(format!("{shape:?}"))),
    }
}

fn quantize_floats(values: Vec<f64>) -> Vec<u8> {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let scale = if max <= 1.0 { 255.0 } else { 1.0 };
    values.into_iter().map(|v| (v * scale) as u8).collect()
}

/// Converts an array to 8-bit pixels.
///
/// Floats whose maximum is at most 1.0 are scaled to 0..=255, everything else
/// is cast.
pub fn quantize(array: &ImageArray) -> Result<QuantizedImage, CodecError> {
    let (height, width, channels) = at_least_3d(array.shape())?;
    let pixels = match array {
        ImageArray::U8(a) => a.iter().copied().collect(),
        ImageArray::U16(a) => a.iter().map(|v| *v as u8).collect(),
        ImageArray::F32(a) => quantize_floats(a.iter().map(|v| *v as f64).collect()),
        ImageArray::F64(a) => quantize_floats(a.iter().copied().collect()),
    };

    Ok(QuantizedImage {
        height: height as u32,
        width: width as u32,
        channels: channels as u8,
        pixels,
    })
}

fn to_dynamic(image: QuantizedImage) -> Result<DynamicImage, CodecError> {
    let QuantizedImage {
        height,
        width,
        channels,
        pixels,
    } = image;
    let mismatch = || CodecError::InvalidShape(format!("{height}x{width}x{channels}"));

    let dynamic = match channels {
        1 => DynamicImage::ImageLuma8(
            ImageBuffer::<Luma<u8>, _>::from_raw(width, height, pixels).ok_or_else(mismatch)?,
        ),
        2 => DynamicImage::ImageLumaA8(
            ImageBuffer::<LumaA<u8>, _>::from_raw(width, height, pixels).ok_or_else(mismatch)?,
        ),
        3 => DynamicImage::ImageRgb8(
            ImageBuffer::<Rgb<u8>, _>::from_raw(width, height, pixels).ok_or_else(mismatch)?,
        ),
        4 => DynamicImage::ImageRgba8(
            ImageBuffer::<Rgba<u8>, _>::from_raw(width, height, pixels).ok_or_else(mismatch)?,
        ),
        _ => return Err(mismatch()),
    };
    Ok(dynamic)
}

pub fn encode(image: QuantizedImage, settings: &ImageSettings) -> Result<Bytes, CodecError> {
    let channels = image.channels;
    let dynamic = to_dynamic(image)?;
    let mut out = Vec::new();

    match settings.format {
        ImageFormatKind::Jpeg => {
            let quality = settings.quality.clamp(1, 100);
            let mut encoder = JpegEncoder::new_with_quality(&mut out, quality);
            // JPEG has no alpha channel
            if channels <= 2 {
                encoder.encode_image(&dynamic.to_luma8())?;
            } else {
                encoder.encode_image(&dynamic.to_rgb8())?;
            }
        }
        ImageFormatKind::Png => {
            dynamic.write_to(&mut Cursor::new(&mut out), ImageFormat::Png)?;
        }
    }

    Ok(Bytes::from(out))
}

pub fn encode_array(array: &ImageArray, settings: &ImageSettings) -> Result<Bytes, CodecError> {
    encode(quantize(array)?, settings)
}
