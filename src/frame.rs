use chrono::NaiveDateTime;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ExtendedColorType, RgbImage};
use jpeg_decoder::PixelFormat;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("JPEG decoder error")]
    Decode(#[from] jpeg_decoder::Error),
    #[error("JPEG decoder returned no image info")]
    MissingInfo,
    #[error("Unsupported JPEG pixel format {0}")]
    UnsupportedPixelFormat(String),
    #[error("Frame buffer does not match {width}x{height}")]
    BadDimensions { width: u32, height: u32 },
    #[error("JPEG encoder error")]
    Encode(#[from] image::ImageError),
    #[error("Failed to write frame")]
    Io(#[from] std::io::Error),
}

/// One JPEG-encoded frame as it arrived from the stream.
#[derive(Debug, Clone)]
pub struct Frame {
    pub jpeg: Vec<u8>,
    /// Wall-clock arrival time; the stream's own timestamps are not available.
    pub received_at: NaiveDateTime,
    /// Position of this frame in the reader's delivery order, starting at 1.
    pub sequence: u64,
}

/// A decoded RGB24 image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub width: u32,
    pub height: u32,
    pub rgb: Vec<u8>,
}

impl DecodedFrame {
    pub fn decode(jpeg: &[u8]) -> Result<Self, FrameError> {
        let mut decoder = jpeg_decoder::Decoder::new(jpeg);
        let pixels = decoder.decode()?;
        let info = decoder.info().ok_or(FrameError::MissingInfo)?;

        let rgb = match info.pixel_format {
            PixelFormat::RGB24 => pixels,
            // Grayscale cameras in night mode
            PixelFormat::L8 => pixels.iter().flat_map(|&luma| [luma, luma, luma]).collect(),
            other => return Err(FrameError::UnsupportedPixelFormat(format!("{:?}", other))),
        };

        Self::from_rgb(info.width as u32, info.height as u32, rgb)
    }

    pub fn from_rgb(width: u32, height: u32, rgb: Vec<u8>) -> Result<Self, FrameError> {
        if rgb.len() != width as usize * height as usize * 3 {
            return Err(FrameError::BadDimensions { width, height });
        }
        Ok(Self { width, height, rgb })
    }

    /// Scales the image to exactly `width`x`height`; returns it unchanged if it already fits.
    pub fn resized(self, width: u32, height: u32) -> Result<Self, FrameError> {
        if self.width == width && self.height == height {
            return Ok(self);
        }

        let (source_width, source_height) = (self.width, self.height);
        let image = RgbImage::from_raw(source_width, source_height, self.rgb).ok_or(
            FrameError::BadDimensions {
                width: source_width,
                height: source_height,
            },
        )?;
        let scaled = image::imageops::resize(&image, width, height, FilterType::Triangle);

        Ok(Self {
            width,
            height,
            rgb: scaled.into_raw(),
        })
    }

    /// Encodes the frame as JPEG at `quality` (1-100).
    pub fn to_jpeg(&self, quality: u8) -> Result<Vec<u8>, FrameError> {
        let mut out = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
        encoder.encode(&self.rgb, self.width, self.height, ExtendedColorType::Rgb8)?;
        Ok(out)
    }

    pub fn write_jpeg(&self, path: &Path, quality: u8) -> Result<(), FrameError> {
        let mut writer = BufWriter::new(File::create(path)?);
        let mut encoder = JpegEncoder::new_with_quality(&mut writer, quality.clamp(1, 100));
        encoder.encode(&self.rgb, self.width, self.height, ExtendedColorType::Rgb8)?;
        Ok(())
    }
}
