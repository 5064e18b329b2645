//! Frame type and pixel helpers: YUYV conversion, dark detection, persistence.

use std::path::Path;

/// A captured colour camera frame.
#[derive(Clone)]
pub struct Frame {
    /// Packed RGB8 pixel data (width * height * 3 bytes).
    pub rgb: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub sequence: u32,
    pub is_dark: bool,
}

impl Frame {
    /// Build a frame from a packed YUYV buffer. Darkness is judged on the
    /// luma plane alone.
    pub fn from_yuyv(
        yuyv: &[u8],
        width: u32,
        height: u32,
        sequence: u32,
    ) -> Result<Self, FrameError> {
        let luma = yuyv_to_grayscale(yuyv, width, height)?;
        let rgb = yuyv_to_rgb(yuyv, width, height)?;
        Ok(Self {
            rgb,
            width,
            height,
            sequence,
            is_dark: is_dark_frame(&luma, DARK_FRAME_THRESHOLD),
        })
    }

    /// Build a frame from single-channel pixels, replicated into RGB.
    pub fn from_gray(gray: Vec<u8>, width: u32, height: u32, sequence: u32) -> Self {
        let is_dark = is_dark_frame(&gray, DARK_FRAME_THRESHOLD);
        let rgb = gray.iter().flat_map(|&y| [y, y, y]).collect();
        Self {
            rgb,
            width,
            height,
            sequence,
            is_dark,
        }
    }

    /// Write the frame to `path`; the format follows the file extension.
    pub fn save(&self, path: &Path) -> Result<(), FrameError> {
        let img = image::RgbImage::from_raw(self.width, self.height, self.rgb.clone()).ok_or(
            FrameError::InvalidLength {
                expected: (self.width * self.height * 3) as usize,
                actual: self.rgb.len(),
            },
        )?;
        img.save(path)?;
        Ok(())
    }
}

/// Fraction of near-black pixels above which a frame counts as dark.
pub const DARK_FRAME_THRESHOLD: f32 = 0.95;

/// Convert packed YUYV (4:2:2) to grayscale by extracting the Y channel.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V].
/// Grayscale = every even-indexed byte.
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }
    Ok(yuyv[..expected].iter().step_by(2).copied().collect())
}

/// Convert packed YUYV (4:2:2) to RGB8 with BT.601 coefficients.
///
/// Each [Y0, U, Y1, V] group yields two pixels sharing one chroma pair.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }

    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for group in yuyv[..expected].chunks_exact(4) {
        let u = f32::from(group[1]) - 128.0;
        let v = f32::from(group[3]) - 128.0;
        for y in [group[0], group[2]] {
            let y = f32::from(y);
            rgb.extend([
                clamp_channel(y + 1.402 * v),
                clamp_channel(y - 0.344 * u - 0.714 * v),
                clamp_channel(y + 1.772 * u),
            ]);
        }
    }
    Ok(rgb)
}

fn clamp_channel(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

/// Check if a frame is dark: more than `threshold_pct` of pixels below 32.
///
/// A covered lens or an unlit doorway yields such frames; they are useless
/// for face matching.
pub fn is_dark_frame(gray: &[u8], threshold_pct: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark_count = gray.iter().filter(|&&p| p < 32).count();
    (dark_count as f32 / gray.len() as f32) > threshold_pct
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid frame length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("encode: {0}")]
    Encode(#[from] image::ImageError),
}
