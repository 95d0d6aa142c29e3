//! Raw frame pixel formats and color normalisation

use super::CaptureError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Packed pixel layouts a source may deliver or an encoder may accept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Rgba,
}

impl PixelFormat {
    /// Bytes used by a single pixel
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => 3,
            PixelFormat::Rgba => 4,
        }
    }

    /// Name understood by ffmpeg's `-pix_fmt`
    pub fn ffmpeg_name(&self) -> &'static str {
        match self {
            PixelFormat::Rgb24 => "rgb24",
            PixelFormat::Bgr24 => "bgr24",
            PixelFormat::Rgba => "rgba",
        }
    }

    /// Size in bytes of one frame with the given dimensions
    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        width as usize * height as usize * self.bytes_per_pixel()
    }

    fn to_rgb(self, px: &[u8]) -> [u8; 3] {
        match self {
            PixelFormat::Rgb24 | PixelFormat::Rgba => [px[0], px[1], px[2]],
            PixelFormat::Bgr24 => [px[2], px[1], px[0]],
        }
    }

    fn write_rgb(self, rgb: [u8; 3], out: &mut Vec<u8>) {
        match self {
            PixelFormat::Rgb24 => out.extend_from_slice(&rgb),
            PixelFormat::Bgr24 => out.extend_from_slice(&[rgb[2], rgb[1], rgb[0]]),
            PixelFormat::Rgba => out.extend_from_slice(&[rgb[0], rgb[1], rgb[2], 255]),
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.ffmpeg_name())
    }
}

/// Convert a packed frame between pixel formats.
///
/// Returns the input untouched when both formats match. The BGR/RGB swap is
/// done in place; conversions that change the pixel size allocate.
pub fn convert(frame: Vec<u8>, from: PixelFormat, to: PixelFormat) -> Result<Vec<u8>, CaptureError> {
    let bpp = from.bytes_per_pixel();
    if frame.len() % bpp != 0 {
        return Err(CaptureError::FrameLayout(format!(
            "{} bytes is not a whole number of {} pixels",
            frame.len(),
            from
        )));
    }

    if from == to {
        return Ok(frame);
    }

    match (from, to) {
        (PixelFormat::Bgr24, PixelFormat::Rgb24) | (PixelFormat::Rgb24, PixelFormat::Bgr24) => {
            let mut frame = frame;
            for px in frame.chunks_exact_mut(3) {
                px.swap(0, 2);
            }
            Ok(frame)
        }
        _ => {
            let pixels = frame.len() / bpp;
            let mut out = Vec::with_capacity(pixels * to.bytes_per_pixel());
            for px in frame.chunks_exact(bpp) {
                to.write_rgb(from.to_rgb(px), &mut out);
            }
            Ok(out)
        }
    }
}
