//! Image upload validation by content, not by metadata.
//!
//! The file type comes only from the leading bytes of the payload; the
//! client's filename and Content-Type are never consulted. Dimensions are
//! read straight out of the format headers, so no image decoder runs on
//! untrusted input.

use thiserror::Error;

/// 5 MiB.
pub const MAX_UPLOAD_BYTES: usize = 5 * 1024 * 1024;

/// Largest accepted width or height, in pixels.
pub const MAX_DIMENSION: u32 = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UploadError {
    #[error("No file provided")]
    Empty,
    #[error("File is too large (max 5 MB)")]
    TooLarge,
    #[error("Invalid file type. Only JPEG, PNG, GIF and WebP images are allowed")]
    InvalidFileType,
    #[error("Could not read image dimensions")]
    InvalidImage,
    #[error("Image must be between 1x1 and 4096x4096 pixels (got {width}x{height})")]
    DimensionsOutOfBounds { width: u32, height: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Jpeg,
    Png,
    Gif,
    Webp,
}

impl ImageKind {
    /// Identify the format from its signature.
    pub fn detect(bytes: &[u8]) -> Option<Self> {
        match bytes {
            [0xFF, 0xD8, 0xFF, ..] => Some(ImageKind::Jpeg),
            [0x89, 0x50, 0x4E, 0x47, ..] => Some(ImageKind::Png),
            [0x47, 0x49, 0x46, 0x38, ..] => Some(ImageKind::Gif),
            [0x52, 0x49, 0x46, 0x46, _, _, _, _, b'W', b'E', b'B', b'P', ..] => Some(ImageKind::Webp),
            _ => None,
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            ImageKind::Jpeg => "image/jpeg",
            ImageKind::Png => "image/png",
            ImageKind::Gif => "image/gif",
            ImageKind::Webp => "image/webp",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ImageKind::Jpeg => "jpg",
            ImageKind::Png => "png",
            ImageKind::Gif => "gif",
            ImageKind::Webp => "webp",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "jpg" => Some(ImageKind::Jpeg),
            "png" => Some(ImageKind::Png),
            "gif" => Some(ImageKind::Gif),
            "webp" => Some(ImageKind::Webp),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    pub kind: ImageKind,
    pub width: u32,
    pub height: u32,
}

impl ImageInfo {
    pub fn mime(&self) -> &'static str {
        self.kind.mime()
    }
}

/// Validate an uploaded image. `declared_size` is the size the client
/// announced; both it and the actual payload must fit the limit.
pub fn validate(bytes: &[u8], declared_size: usize) -> Result<ImageInfo, UploadError> {
    if declared_size > MAX_UPLOAD_BYTES || bytes.len() > MAX_UPLOAD_BYTES {
        return Err(UploadError::TooLarge);
    }
    if bytes.is_empty() {
        return Err(UploadError::Empty);
    }

    let kind = ImageKind::detect(bytes).ok_or(UploadError::InvalidFileType)?;
    let (width, height) = match kind {
        ImageKind::Jpeg => jpeg_dimensions(bytes),
        ImageKind::Png => png_dimensions(bytes),
        ImageKind::Gif => gif_dimensions(bytes),
        ImageKind::Webp => webp_dimensions(bytes),
    }
    .ok_or(UploadError::InvalidImage)?;

    if width == 0 || height == 0 || width > MAX_DIMENSION || height > MAX_DIMENSION {
        return Err(UploadError::DimensionsOutOfBounds { width, height });
    }

    Ok(ImageInfo {
        kind,
        width,
        height,
    })
}

/// Walks the marker segments up to the first baseline/progressive frame
/// header (SOF0..SOF3).
fn jpeg_dimensions(b: &[u8]) -> Option<(u32, u32)> {
    let mut i = 2;
    while i + 1 < b.len() {
        if b[i] != 0xFF {
            return None;
        }
        match b[i + 1] {
            // fill byte
            0xFF => i += 1,
            // standalone markers carry no length
            0x01 | 0xD0..=0xD8 => i += 2,
            // end of image or start of scan before any frame header
            0xD9 | 0xDA => return None,
            0xC0..=0xC3 => {
                let height = be16(b, i + 5)?;
                let width = be16(b, i + 7)?;
                return Some((width, height));
            }
            _ => {
                let len = be16(b, i + 2)? as usize;
                if len < 2 {
                    return None;
                }
                i += 2 + len;
            }
        }
    }
    None
}

fn png_dimensions(b: &[u8]) -> Option<(u32, u32)> {
    if b.get(12..16)? != b"IHDR" {
        return None;
    }
    Some((be32(b, 16)?, be32(b, 20)?))
}

/// Logical screen descriptor, little-endian.
fn gif_dimensions(b: &[u8]) -> Option<(u32, u32)> {
    Some((le16(b, 6)?, le16(b, 8)?))
}

fn webp_dimensions(b: &[u8]) -> Option<(u32, u32)> {
    match b.get(12..16)? {
        // lossy: 14-bit fields after the frame tag and start code
        b"VP8 " => Some((le16(b, 26)? & 0x3FFF, le16(b, 28)? & 0x3FFF)),
        // lossless: 14-bit (width - 1), 14-bit (height - 1) packed after 0x2F
        b"VP8L" => {
            let s = b.get(20..25)?;
            if s[0] != 0x2F {
                return None;
            }
            let (b0, b1, b2, b3) = (s[1] as u32, s[2] as u32, s[3] as u32, s[4] as u32);
            let width = 1 + (((b1 & 0x3F) << 8) | b0);
            let height = 1 + (((b3 & 0x0F) << 10) | (b2 << 2) | ((b1 & 0xC0) >> 6));
            Some((width, height))
        }
        // extended: 24-bit canvas (width - 1), (height - 1)
        b"VP8X" => Some((1 + le24(b, 24)?, 1 + le24(b, 27)?)),
        _ => None,
    }
}

fn be16(b: &[u8], at: usize) -> Option<u32> {
    let s = b.get(at..at + 2)?;
    Some(u16::from_be_bytes([s[0], s[1]]) as u32)
}

fn le16(b: &[u8], at: usize) -> Option<u32> {
    let s = b.get(at..at + 2)?;
    Some(u16::from_le_bytes([s[0], s[1]]) as u32)
}

fn le24(b: &[u8], at: usize) -> Option<u32> {
    let s = b.get(at..at + 3)?;
    Some(u32::from_le_bytes([s[0], s[1], s[2], 0]))
}

fn be32(b: &[u8], at: usize) -> Option<u32> {
    let s = b.get(at..at + 4)?;
    Some(u32::from_be_bytes([s[0], s[1], s[2], s[3]]))
}

/// Minimal well-formed headers for each accepted format, for tests here and
/// in dependent crates (`test-util` feature).
#[cfg(any(test, feature = "test-util"))]
pub mod fixtures {
    pub fn png(width: u32, height: u32) -> Vec<u8> {
        let mut b = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
        b.extend_from_slice(&13u32.to_be_bytes());
        b.extend_from_slice(b"IHDR");
        b.extend_from_slice(&width.to_be_bytes());
        b.extend_from_slice(&height.to_be_bytes());
        b.extend_from_slice(&[8, 6, 0, 0, 0, 0, 0, 0, 0]);
        b
    }

    pub fn jpeg(width: u16, height: u16) -> Vec<u8> {
        let mut b = vec![0xFF, 0xD8];
        // APP0 / JFIF, 16-byte segment
        b.extend_from_slice(&[0xFF, 0xE0, 0x00, 0x10]);
        b.extend_from_slice(b"JFIF\0");
        b.extend_from_slice(&[1, 1, 0, 0, 1, 0, 1, 0, 0]);
        // SOF0
        b.extend_from_slice(&[0xFF, 0xC0, 0x00, 0x11, 0x08]);
        b.extend_from_slice(&height.to_be_bytes());
        b.extend_from_slice(&width.to_be_bytes());
        b.extend_from_slice(&[3, 1, 0x22, 0, 2, 0x11, 1, 3, 0x11, 1]);
        b.extend_from_slice(&[0xFF, 0xD9]);
        b
    }

    pub fn gif(width: u16, height: u16) -> Vec<u8> {
        let mut b = b"GIF89a".to_vec();
        b.extend_from_slice(&width.to_le_bytes());
        b.extend_from_slice(&height.to_le_bytes());
        b.extend_from_slice(&[0, 0, 0, 0x3B]);
        b
    }

    pub fn webp_lossy(width: u16, height: u16) -> Vec<u8> {
        let mut b = b"RIFF".to_vec();
        b.extend_from_slice(&30u32.to_le_bytes());
        b.extend_from_slice(b"WEBPVP8 ");
        b.extend_from_slice(&18u32.to_le_bytes());
        b.extend_from_slice(&[0x30, 0x01, 0x00, 0x9D, 0x01, 0x2A]);
        b.extend_from_slice(&width.to_le_bytes());
        b.extend_from_slice(&height.to_le_bytes());
        b.extend_from_slice(&[0; 8]);
        b
    }
}
