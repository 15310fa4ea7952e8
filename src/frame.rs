//! Owned pixel buffers.
//!
//! A `Frame` is produced by a connection, handed to the caller of
//! `StreamSource::next_frame()`, and owned by whoever holds it next. The
//! buffer length always equals `height * width * channels`; constructors
//! reject anything else instead of padding or truncating.

use std::borrow::Cow;
use std::fmt;

use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageEncoder};
use serde::{Deserialize, Serialize};

use crate::detect::{BoundingBox, DetectionResult};
use crate::error::FrameError;

/// Default JPEG quality for streamed frames.
pub const DEFAULT_JPEG_QUALITY: u8 = 80;

/// Overlay colors (RGB), picked by class id.
pub const BOX_COLORS: [[u8; 3]; 3] = [[255, 0, 0], [0, 255, 0], [0, 0, 255]];

/// Frame dimensions: rows, columns, interleaved channels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Shape {
    pub height: u32,
    pub width: u32,
    pub channels: u8,
}

impl Shape {
    pub fn new(height: u32, width: u32, channels: u8) -> Self {
        Self {
            height,
            width,
            channels,
        }
    }

    /// Number of bytes a buffer of this shape holds, or `None` on overflow
    /// or a zero dimension.
    pub fn byte_len(&self) -> Option<usize> {
        if self.height == 0 || self.width == 0 || self.channels == 0 {
            return None;
        }
        (self.height as usize)
            .checked_mul(self.width as usize)?
            .checked_mul(self.channels as usize)
    }

    pub fn as_array(&self) -> [u32; 3] {
        [self.height, self.width, self.channels as u32]
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.height, self.width, self.channels)
    }
}

/// Channel layout of the interleaved pixel data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelOrder {
    Gray,
    GrayAlpha,
    Rgb,
    Bgr,
    Rgba,
}

impl ChannelOrder {
    pub fn channels(self) -> u8 {
        match self {
            ChannelOrder::Gray => 1,
            ChannelOrder::GrayAlpha => 2,
            ChannelOrder::Rgb | ChannelOrder::Bgr => 3,
            ChannelOrder::Rgba => 4,
        }
    }

    /// Order assumed when only a channel count is known.
    pub fn default_for(channels: u8) -> Option<Self> {
        match channels {
            1 => Some(ChannelOrder::Gray),
            2 => Some(ChannelOrder::GrayAlpha),
            3 => Some(ChannelOrder::Rgb),
            4 => Some(ChannelOrder::Rgba),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ChannelOrder::Gray => "gray",
            ChannelOrder::GrayAlpha => "gray_alpha",
            ChannelOrder::Rgb => "rgb",
            ChannelOrder::Bgr => "bgr",
            ChannelOrder::Rgba => "rgba",
        }
    }
}

impl fmt::Display for ChannelOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single decoded video frame.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    shape: Shape,
    order: ChannelOrder,
    data: Vec<u8>,
}

impl Frame {
    pub fn new(shape: Shape, order: ChannelOrder, data: Vec<u8>) -> Result<Self, FrameError> {
        if shape.channels != order.channels() {
            return Err(FrameError::ChannelMismatch {
                order: order.name(),
                expected: order.channels(),
                actual: shape.channels,
            });
        }
        let expected = shape.byte_len().ok_or(FrameError::InvalidShape(shape))?;
        if data.len() != expected {
            return Err(FrameError::LengthMismatch {
                shape,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { shape, order, data })
    }

    /// Packed RGB frame, the layout every connector produces.
    pub fn from_rgb(width: u32, height: u32, data: Vec<u8>) -> Result<Self, FrameError> {
        Self::new(Shape::new(height, width, 3), ChannelOrder::Rgb, data)
    }

    /// Decode a still image (JPEG or PNG) into an RGB frame.
    pub fn from_image_bytes(bytes: &[u8]) -> Result<Self> {
        let rgb = image::load_from_memory(bytes)
            .context("decode image")?
            .into_rgb8();
        let (width, height) = rgb.dimensions();
        Ok(Self::from_rgb(width, height, rgb.into_raw())?)
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn order(&self) -> ChannelOrder {
        self.order
    }

    pub fn width(&self) -> u32 {
        self.shape.width
    }

    pub fn height(&self) -> u32 {
        self.shape.height
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Pixel data as packed RGB, converting only when needed.
    pub fn to_rgb8(&self) -> Cow<'_, [u8]> {
        match self.order {
            ChannelOrder::Rgb => Cow::Borrowed(&self.data),
            ChannelOrder::Bgr => Cow::Owned(
                self.data
                    .chunks_exact(3)
                    .flat_map(|px| [px[2], px[1], px[0]])
                    .collect(),
            ),
            ChannelOrder::Rgba => Cow::Owned(
                self.data
                    .chunks_exact(4)
                    .flat_map(|px| [px[0], px[1], px[2]])
                    .collect(),
            ),
            ChannelOrder::Gray => Cow::Owned(self.data.iter().flat_map(|&v| [v, v, v]).collect()),
            ChannelOrder::GrayAlpha => Cow::Owned(
                self.data
                    .chunks_exact(2)
                    .flat_map(|px| [px[0], px[0], px[0]])
                    .collect(),
            ),
        }
    }

    /// Encode as a baseline JPEG for the MJPEG transport.
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let encoder = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
        if self.order == ChannelOrder::Gray {
            encoder
                .write_image(&self.data, self.width(), self.height(), ExtendedColorType::L8)
                .context("encode gray jpeg")?;
        } else {
            let rgb = self.to_rgb8();
            encoder
                .write_image(&rgb, self.width(), self.height(), ExtendedColorType::Rgb8)
                .context("encode rgb jpeg")?;
        }
        Ok(out)
    }

    /// Draw a one-pixel rectangle outline. Coordinates are clamped to the
    /// frame; an empty box draws nothing.
    pub fn draw_box(&mut self, bbox: &BoundingBox, color: [u8; 3]) {
        let max_x = self.width().saturating_sub(1);
        let max_y = self.height().saturating_sub(1);
        let (x0, x1) = (bbox.xmin.min(max_x), bbox.xmax.min(max_x));
        let (y0, y1) = (bbox.ymin.min(max_y), bbox.ymax.min(max_y));
        if x0 > x1 || y0 > y1 {
            return;
        }
        for x in x0..=x1 {
            self.put_pixel(x, y0, color);
            self.put_pixel(x, y1, color);
        }
        for y in y0..=y1 {
            self.put_pixel(x0, y, color);
            self.put_pixel(x1, y, color);
        }
    }

    /// Outline every detection, colored by class id.
    pub fn draw_detections(&mut self, detections: &DetectionResult) {
        for detection in &detections.results {
            let color = BOX_COLORS[detection.class_id as usize % BOX_COLORS.len()];
            self.draw_box(&detection.bbox, color);
        }
    }

    fn put_pixel(&mut self, x: u32, y: u32, [r, g, b]: [u8; 3]) {
        let channels = self.shape.channels as usize;
        let offset = (y as usize * self.width() as usize + x as usize) * channels;
        let Some(px) = self.data.get_mut(offset..offset + channels) else {
            return;
        };
        match self.order {
            ChannelOrder::Rgb | ChannelOrder::Rgba => px[..3].copy_from_slice(&[r, g, b]),
            ChannelOrder::Bgr => px.copy_from_slice(&[b, g, r]),
            ChannelOrder::Gray | ChannelOrder::GrayAlpha => {
                px[0] = ((r as u32 * 299 + g as u32 * 587 + b as u32 * 114) / 1000) as u8;
            }
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("shape", &self.shape)
            .field("order", &self.order)
            .field("bytes", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_length_mismatch() {
        let err = Frame::from_rgb(2, 2, vec![0; 11]).unwrap_err();
        assert_eq!(
            err,
            FrameError::LengthMismatch {
                shape: Shape::new(2, 2, 3),
                expected: 12,
                actual: 11,
            }
        );
    }

    #[test]
    fn rejects_zero_dimension_and_wrong_order() {
        assert!(matches!(
            Frame::from_rgb(0, 2, vec![]),
            Err(FrameError::InvalidShape(_))
        ));
        assert!(matches!(
            Frame::new(Shape::new(1, 1, 3), ChannelOrder::Rgba, vec![0; 3]),
            Err(FrameError::ChannelMismatch { expected: 4, .. })
        ));
    }

    #[test]
    fn bgr_converts_to_rgb() {
        let frame = Frame::new(Shape::new(1, 2, 3), ChannelOrder::Bgr, vec![1, 2, 3, 4, 5, 6])
            .unwrap();
        assert_eq!(frame.to_rgb8().as_ref(), &[3, 2, 1, 6, 5, 4]);
    }

    #[test]
    fn jpeg_round_trips_dimensions() {
        let frame = Frame::from_rgb(16, 8, vec![128; 16 * 8 * 3]).unwrap();
        let jpeg = frame.encode_jpeg(DEFAULT_JPEG_QUALITY).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

        let decoded = Frame::from_image_bytes(&jpeg).unwrap();
        assert_eq!(decoded.width(), 16);
        assert_eq!(decoded.height(), 8);
        assert_eq!(decoded.order(), ChannelOrder::Rgb);
    }

    #[test]
    fn draw_box_outlines_and_clamps() {
        let mut frame = Frame::from_rgb(4, 4, vec![0; 4 * 4 * 3]).unwrap();
        let bbox = BoundingBox {
            xmin: 1,
            ymin: 1,
            xmax: 10,
            ymax: 10,
        };
        frame.draw_box(&bbox, [255, 0, 0]);

        let px = |x: usize, y: usize| {
            let o = (y * 4 + x) * 3;
            [frame.as_bytes()[o], frame.as_bytes()[o + 1], frame.as_bytes()[o + 2]]
        };
        assert_eq!(px(1, 1), [255, 0, 0]);
        assert_eq!(px(3, 3), [255, 0, 0]);
        assert_eq!(px(2, 2), [0, 0, 0]);
        assert_eq!(px(0, 0), [0, 0, 0]);
    }

    #[test]
    fn detections_are_colored_by_class() {
        use crate::detect::Detection;

        let mut frame = Frame::from_rgb(2, 1, vec![0; 6]).unwrap();
        let detections = DetectionResult {
            results: vec![
                Detection {
                    bbox: BoundingBox { xmin: 0, ymin: 0, xmax: 0, ymax: 0 },
                    score: 0.9,
                    class_id: 1,
                },
                Detection {
                    bbox: BoundingBox { xmin: 1, ymin: 0, xmax: 1, ymax: 0 },
                    score: 0.9,
                    class_id: 5,
                },
            ],
            ..DetectionResult::default()
        };
        frame.draw_detections(&detections);
        assert_eq!(frame.as_bytes(), &[0, 255, 0, 0, 0, 255]);
    }
}
