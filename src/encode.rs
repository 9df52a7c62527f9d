//! Raw mirrored frames to transport-ready JPEG.

use crate::error::CaptureError;
use base64::{Engine as _, engine::general_purpose};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageBuffer, RgbaImage};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

pub const DEFAULT_JPEG_QUALITY: u8 = 85;
pub const RGBA_BYTES_PER_PIXEL: u32 = 4;

/// One RGBA_8888 plane as handed out by the frame buffer. `row_stride` may
/// exceed `width * pixel_stride` when the hardware pads rows.
#[derive(Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub row_stride: u32,
    pub pixel_stride: u32,
    pub data: Vec<u8>,
}

impl RawFrame {
    pub fn packed(width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            row_stride: width * RGBA_BYTES_PER_PIXEL,
            pixel_stride: RGBA_BYTES_PER_PIXEL,
            data,
        }
    }

    pub fn row_padding(&self) -> u32 {
        self.row_stride
            .saturating_sub(self.width.saturating_mul(self.pixel_stride))
    }
}

impl std::fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("row_stride", &self.row_stride)
            .field("pixel_stride", &self.pixel_stride)
            .field("bytes", &self.data.len())
            .finish()
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct EncodedImage {
    bytes: Vec<u8>,
    base64: String,
    width: u32,
    height: u32,
}

impl EncodedImage {
    pub const MIME_TYPE: &'static str = "image/jpeg";

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_base64(&self) -> &str {
        &self.base64
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", Self::MIME_TYPE, self.base64)
    }

    /// Re-encodes the part of this image inside `region`.
    pub fn cropped(&self, region: CropRegion, quality: u8) -> Result<EncodedImage, CaptureError> {
        let decoded = image::load_from_memory(&self.bytes)
            .map_err(|err| CaptureError::encoding(format!("cannot decode capture: {err}")))?
            .to_rgba8();
        compress(crop_region(decoded, region)?, quality)
    }
}

/// Rectangle in content pixels, origin at the top-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl CropRegion {
    /// The part of the region that lies inside a `width x height` image.
    pub fn within(&self, width: u32, height: u32) -> Option<CropRegion> {
        if self.x >= width || self.y >= height {
            return None;
        }
        let clamped = CropRegion {
            x: self.x,
            y: self.y,
            width: self.width.min(width - self.x),
            height: self.height.min(height - self.y),
        };
        (clamped.width > 0 && clamped.height > 0).then_some(clamped)
    }
}

impl FromStr for CropRegion {
    type Err = String;

    /// `x,y,width,height`; whitespace works as a separator too.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parts = value
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|part| !part.is_empty())
            .map(|part| {
                part.parse::<u32>()
                    .map_err(|_| format!("'{part}' is not a pixel count"))
            })
            .collect::<Result<Vec<_>, _>>()?;
        match parts.as_slice() {
            [x, y, width, height] => Ok(CropRegion {
                x: *x,
                y: *y,
                width: *width,
                height: *height,
            }),
            _ => Err(format!(
                "expected x,y,width,height but got {} numbers",
                parts.len()
            )),
        }
    }
}

/// Cuts `region` out of `image`, clamped to its bounds.
pub fn crop_region(image: RgbaImage, region: CropRegion) -> Result<RgbaImage, CaptureError> {
    let (width, height) = image.dimensions();
    let Some(region) = region.within(width, height) else {
        return Err(CaptureError::encoding(format!(
            "crop {}x{} at ({}, {}) lies outside the {width}x{height} capture",
            region.width, region.height, region.x, region.y
        )));
    };
    if (region.x, region.y, region.width, region.height) == (0, 0, width, height) {
        return Ok(image);
    }
    Ok(
        image::imageops::crop_imm(&image, region.x, region.y, region.width, region.height)
            .to_image(),
    )
}

impl std::fmt::Debug for EncodedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncodedImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

/// Rebuilds the frame at its stride-derived width and crops the padding
/// columns away, leaving exactly `width x height` pixels.
pub fn crop_to_content(frame: RawFrame) -> Result<RgbaImage, CaptureError> {
    let RawFrame {
        width,
        height,
        row_stride,
        pixel_stride,
        mut data,
    } = frame;

    if width == 0 || height == 0 {
        return Err(CaptureError::encoding(format!(
            "frame has zero-sized dimensions ({width}x{height})"
        )));
    }
    if pixel_stride != RGBA_BYTES_PER_PIXEL {
        return Err(CaptureError::encoding(format!(
            "unsupported pixel stride {pixel_stride}, expected RGBA_8888"
        )));
    }
    if row_stride % pixel_stride != 0 {
        return Err(CaptureError::encoding(format!(
            "row stride {row_stride} is not a whole number of pixels"
        )));
    }

    let padded_width = row_stride / pixel_stride;
    if padded_width < width {
        return Err(CaptureError::encoding(format!(
            "row stride {row_stride} is narrower than {width} pixels"
        )));
    }

    let row_bytes = row_stride as usize;
    let content_row_bytes = (width * pixel_stride) as usize;
    let last_row_end = row_bytes * (height as usize - 1) + content_row_bytes;
    if data.len() < last_row_end {
        return Err(CaptureError::encoding(format!(
            "pixel buffer holds {} bytes, need at least {last_row_end}",
            data.len()
        )));
    }

    // Some producers omit the padding after the final row.
    data.resize(row_bytes * height as usize, 0);

    let padded: RgbaImage = ImageBuffer::from_raw(padded_width, height, data)
        .ok_or_else(|| CaptureError::encoding("pixel buffer does not match its dimensions"))?;

    if padded_width == width {
        return Ok(padded);
    }
    Ok(image::imageops::crop_imm(&padded, 0, 0, width, height).to_image())
}

/// Crops, compresses at `quality` (1-100) and base64-encodes without line breaks.
pub fn encode(frame: RawFrame, quality: u8) -> Result<EncodedImage, CaptureError> {
    encode_region(frame, None, quality)
}

/// Like [`encode`], keeping only `region` of the content when one is given.
pub fn encode_region(
    frame: RawFrame,
    region: Option<CropRegion>,
    quality: u8,
) -> Result<EncodedImage, CaptureError> {
    let content = crop_to_content(frame)?;
    let content = match region {
        Some(region) => crop_region(content, region)?,
        None => content,
    };
    compress(content, quality)
}

fn compress(content: RgbaImage, quality: u8) -> Result<EncodedImage, CaptureError> {
    let quality = quality.clamp(1, 100);
    let (width, height) = content.dimensions();

    let rgb = DynamicImage::ImageRgba8(content).to_rgb8();
    let mut bytes = Vec::new();
    JpegEncoder::new_with_quality(&mut bytes, quality)
        .encode_image(&rgb)
        .map_err(|err| CaptureError::encoding(err.to_string()))?;
    drop(rgb);

    if bytes.is_empty() {
        return Err(CaptureError::encoding("encoder produced no output"));
    }

    let base64 = general_purpose::STANDARD.encode(&bytes);
    log::debug!(
        "encoded {width}x{height} image into {} bytes at quality {quality}",
        bytes.len()
    );

    Ok(EncodedImage {
        bytes,
        base64,
        width,
        height,
    })
}
