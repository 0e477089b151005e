// crates/reelkit-media/src/image.rs
//
// Decoded frames as immutable refcounted buffers. Cloning an Image copies
// an Arc, never pixels, so frames travel freely between reader workers,
// the engine, and a renderer. "No image" is Option<Image>::None.

use std::fmt;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelType {
    L8,
    Rgb8,
    Rgba8,
}

impl PixelType {
    pub fn channels(&self) -> usize {
        match self {
            PixelType::L8 => 1,
            PixelType::Rgb8 => 3,
            PixelType::Rgba8 => 4,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageInfo {
    pub width:  u32,
    pub height: u32,
    pub pixel:  PixelType,
}

impl ImageInfo {
    pub fn new(width: u32, height: u32, pixel: PixelType) -> Self {
        Self { width, height, pixel }
    }

    pub fn bytes_per_pixel(&self) -> usize {
        self.pixel.channels()
    }

    /// Total byte length of a tightly-packed frame.
    pub fn byte_count(&self) -> usize {
        self.width as usize * self.height as usize * self.bytes_per_pixel()
    }
}

impl fmt::Display for ImageInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} {:?}", self.width, self.height, self.pixel)
    }
}

/// A tightly-packed pixel buffer. No stride padding; rows are
/// `width * bytes_per_pixel` bytes.
#[derive(Clone, Debug)]
pub struct Image {
    info: ImageInfo,
    data: Arc<[u8]>,
}

impl Image {
    /// Wrap `data`, which must be exactly `info.byte_count()` bytes.
    pub fn new(info: ImageInfo, data: Vec<u8>) -> Result<Image, String> {
        if data.len() != info.byte_count() {
            return Err(format!(
                "pixel buffer is {} bytes, {} expects {}",
                data.len(),
                info,
                info.byte_count()
            ));
        }
        Ok(Image { info, data: data.into() })
    }

    /// A frame with every byte set to `value`. `solid(info, 0)` is black.
    pub fn solid(info: ImageInfo, value: u8) -> Image {
        Image {
            info,
            data: vec![value; info.byte_count()].into(),
        }
    }

    pub fn info(&self) -> ImageInfo {
        self.info
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl PartialEq for Image {
    fn eq(&self, other: &Self) -> bool {
        self.info == other.info
            && (Arc::ptr_eq(&self.data, &other.data) || self.data == other.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_count_by_pixel_type() {
        assert_eq!(ImageInfo::new(16, 16, PixelType::L8).byte_count(), 256);
        assert_eq!(ImageInfo::new(16, 16, PixelType::Rgb8).byte_count(), 768);
        assert_eq!(ImageInfo::new(16, 16, PixelType::Rgba8).byte_count(), 1024);
    }

    #[test]
    fn new_rejects_wrong_length() {
        let info = ImageInfo::new(2, 2, PixelType::Rgb8);
        assert!(Image::new(info, vec![0; 11]).is_err());
        assert!(Image::new(info, vec![0; 12]).is_ok());
    }

    #[test]
    fn clone_shares_pixels() {
        let image = Image::solid(ImageInfo::new(4, 4, PixelType::Rgb8), 128);
        let copy = image.clone();
        assert!(Arc::ptr_eq(&image.data, &copy.data));
        assert_eq!(image, copy);
    }
}
