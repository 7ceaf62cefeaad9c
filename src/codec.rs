//! Payload encoding for the remote session
//!
//! Converts captured PCM samples and RGB frames into the base64 blobs the
//! Live API expects, and cuts decoded reply audio into fixed-size frames for
//! the transport.

use base64::engine::general_purpose;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// JPEG quality used when the caller does not pick one.
pub const DEFAULT_JPEG_QUALITY: u8 = 75;

/// Errors raised while encoding a local frame.
#[derive(Debug, thiserror::Error)]
pub enum EncodingError {
    #[error("frame of {width}x{height} expects {expected} RGB bytes, got {actual}")]
    PixelShape {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },

    #[error("audio chunk at {actual} Hz does not match the session input rate of {expected} Hz")]
    SampleRate { expected: u32, actual: u32 },

    #[error("image encoding failed: {0}")]
    Image(#[from] image::ImageError),
}

/// A wire-ready payload: mime type plus base64 data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

/// One chunk of captured microphone audio.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub sample_rate: u32,
    pub samples: Vec<i16>,
}

impl AudioChunk {
    pub fn new(sample_rate: u32, samples: Vec<i16>) -> Self {
        Self { sample_rate, samples }
    }
}

/// A raw RGB8 image, row-major, three bytes per pixel.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl VideoFrame {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        Self { width, height, pixels }
    }

    /// Check that the pixel buffer matches the declared dimensions.
    pub fn check_shape(&self) -> Result<(), EncodingError> {
        let expected = (self.width as usize)
            .checked_mul(self.height as usize)
            .and_then(|n| n.checked_mul(3));

        match expected {
            Some(expected) if expected != 0 && self.pixels.len() == expected => Ok(()),
            _ => Err(EncodingError::PixelShape {
                width: self.width,
                height: self.height,
                expected: expected.unwrap_or(usize::MAX),
                actual: self.pixels.len(),
            }),
        }
    }

    /// Build a frame from any image the `image` crate can decode.
    pub fn from_image(img: &image::DynamicImage) -> Self {
        let rgb = img.to_rgb8();
        let (width, height) = rgb.dimensions();
        Self {
            width,
            height,
            pixels: rgb.into_raw(),
        }
    }
}

/// A fixed-size frame of synthesized reply audio, ready for playback.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub sample_rate: u32,
    pub samples: Vec<i16>,
    /// Set on the short frame that closes a turn or a session.
    pub partial: bool,
}

/// Encode PCM16 samples as a little-endian base64 blob.
pub fn encode_audio(samples: &[i16], sample_rate: u32) -> Blob {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    Blob {
        mime_type: format!("audio/pcm;rate={}", sample_rate),
        data: general_purpose::STANDARD.encode(&bytes),
    }
}

/// Re-encode an RGB frame as a base64 JPEG blob.
pub fn encode_image(frame: &VideoFrame, quality: u8) -> Result<Blob, EncodingError> {
    frame.check_shape()?;

    let mut jpeg_buffer = Vec::new();
    let mut encoder =
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg_buffer, quality);
    encoder.encode(
        &frame.pixels,
        frame.width,
        frame.height,
        image::ExtendedColorType::Rgb8,
    )?;

    Ok(Blob {
        mime_type: "image/jpeg".to_string(),
        data: general_purpose::STANDARD.encode(&jpeg_buffer),
    })
}

/// Decode little-endian PCM16 bytes. A trailing odd byte is ignored.
pub fn decode_pcm(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Cuts a stream of reply audio into frames of exactly `frame_size` samples.
#[derive(Debug)]
pub struct AudioReframer {
    sample_rate: u32,
    frame_size: usize,
    carry: Vec<i16>,
    odd_byte: Option<u8>,
}

impl AudioReframer {
    pub fn new(sample_rate: u32, frame_size: usize) -> Self {
        Self {
            sample_rate,
            frame_size: frame_size.max(1),
            carry: Vec::with_capacity(frame_size * 2),
            odd_byte: None,
        }
    }

    /// Append raw reply bytes and return every complete frame.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<AudioFrame> {
        let mut rest = bytes;
        if let Some(low) = self.odd_byte.take() {
            match rest.split_first() {
                Some((&high, tail)) => {
                    self.carry.push(i16::from_le_bytes([low, high]));
                    rest = tail;
                }
                None => {
                    self.odd_byte = Some(low);
                    return Vec::new();
                }
            }
        }

        self.carry.extend(decode_pcm(rest));
        if rest.len() % 2 == 1 {
            self.odd_byte = rest.last().copied();
        }

        let mut frames = Vec::new();
        while self.carry.len() >= self.frame_size {
            let samples: Vec<i16> = self.carry.drain(..self.frame_size).collect();
            frames.push(AudioFrame {
                sample_rate: self.sample_rate,
                samples,
                partial: false,
            });
        }
        frames
    }

    /// Emit whatever is left as the terminal partial frame.
    pub fn flush(&mut self) -> Option<AudioFrame> {
        self.odd_byte = None;
        if self.carry.is_empty() {
            return None;
        }
        Some(AudioFrame {
            sample_rate: self.sample_rate,
            samples: std::mem::take(&mut self.carry),
            partial: true,
        })
    }

    /// Number of samples waiting for a full frame.
    pub fn pending(&self) -> usize {
        self.carry.len()
    }
}
